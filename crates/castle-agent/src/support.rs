use std::{path::PathBuf, sync::OnceLock, time::Duration};

const DEFAULT_STOP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STABLE_RUN_MS: u64 = 60_000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn config_path() -> PathBuf {
    std::env::var("CASTLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("castle.toml"))
}

pub fn check_updates_on_boot() -> bool {
    env_flag("CASTLE_CHECK_UPDATES")
}

pub fn stop_timeout() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_STOP_TIMEOUT_MS")
            .map(|v| v.clamp(1000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
    )
}

/// A crash after this much uptime starts a fresh restart sequence.
pub fn stable_run_threshold() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_STABLE_RUN_MS")
            .map(|v| v.clamp(1000, 60 * 60 * 1000))
            .unwrap_or(DEFAULT_STABLE_RUN_MS),
    )
}

pub fn ready_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_READY_POLL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(500),
    )
}

pub fn rcon_hold() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_RCON_HOLD_MS")
            .map(|v| v.clamp(0, 60_000))
            .unwrap_or(3000),
    )
}

pub fn rcon_timeout() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_RCON_TIMEOUT_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(5000),
    )
}

pub fn exit_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("CASTLE_EXIT_POLL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Process-wide HTTP client; cheap to clone into the adapters that need it.
pub fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .user_agent("castle-agent")
                .connect_timeout(Duration::from_secs(15))
                .timeout(Duration::from_secs(30 * 60))
                .build()
                .expect("failed to build reqwest client")
        })
        .clone()
}

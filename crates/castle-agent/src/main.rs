use std::{path::Path, sync::Arc};

use anyhow::Context;
use castle_agent::{
    Supervisor, SupervisorConfig, TomlSettingsStore,
    discovery::SysinfoScanner,
    notify::{DiscordWebhook, Notifier, WebhookSink},
    os_process::OsLauncher,
    steamcmd::SteamCmd,
    support,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("failed to create log directory {}: {e}", log_dir.display());
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout)
            .try_init()
            .ok();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "castle-agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .try_init()
        .ok();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = support::config_path();
    let store = Arc::new(
        TomlSettingsStore::open(&config_path)
            .with_context(|| format!("load settings from {}", config_path.display()))?,
    );
    let settings = store.snapshot();
    let _log_guard = init_tracing(&settings.app.data_root.join("logs"));

    tracing::info!(
        config = %config_path.display(),
        servers = settings.servers.len(),
        version = env!("CARGO_PKG_VERSION"),
        "castle-agent starting"
    );

    let client = support::http_client();
    let sink = (settings.webhook.enabled && !settings.webhook.url.trim().is_empty()).then(|| {
        Arc::new(DiscordWebhook::new(settings.webhook.url.clone(), client.clone()))
            as Arc<dyn WebhookSink>
    });
    let notifier = Notifier::new(settings.webhook.clone(), sink);

    let supervisor = Supervisor::new(
        SupervisorConfig::from_settings(&settings.app),
        Arc::new(OsLauncher::new(support::exit_poll_interval())),
        Arc::new(SteamCmd::new(&settings.app, client)),
        store.clone(),
        notifier,
        settings.servers.clone(),
    );

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(n) => tracing::info!(server = %n.server, event = %n.event, "lifecycle event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "lifecycle event log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if support::check_updates_on_boot() {
        match supervisor.check_for_remote_version().await {
            Ok(true) => tracing::info!("newer server build found; servers update on next start"),
            Ok(false) => tracing::info!("server build is current"),
            Err(err) => tracing::warn!(code = err.code(), error = %err, "version check failed"),
        }
    }

    let scanner = SysinfoScanner::new(settings.app.server_executable.clone());
    let report = supervisor.discover_and_autostart(&scanner).await;
    tracing::info!(
        adopted = ?report.adopted,
        started = ?report.started,
        failed = report.failed.len(),
        "startup discovery complete"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("castle-agent shutting down; managed servers keep running");
    Ok(())
}

//! Supervisor for V Rising dedicated servers: process lifecycle with bounded
//! auto-restart, SteamCMD updates, RCON announcements, log-based readiness
//! detection and webhook notifications.

pub mod archive;
pub mod discovery;
pub mod error;
pub mod launch;
pub mod log_tail;
pub mod notify;
pub mod os_process;
pub mod rcon;
pub mod settings;
pub mod steamcmd;
pub mod supervisor;
pub mod support;

pub use error::{ErrorClass, SupervisorError};
pub use settings::{ServerDefinition, Settings, SettingsStore, TomlSettingsStore};
pub use supervisor::{
    DiscoveryReport, MAX_RESTART_ATTEMPTS, RemoveOptions, RestartWarning, Supervisor,
    SupervisorConfig,
};

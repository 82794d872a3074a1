use std::{path::PathBuf, time::Duration};

use crate::support::format_error_chain;

/// Which part of the failure taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported immediately; persisted state is untouched.
    User,
    /// Logged and swallowed by the operation it decorates.
    Transient,
    /// Aborts only the request that hit it.
    FatalToRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid server definition: {0}")]
    InvalidDefinition(String),

    #[error("server {0} is already running or updating")]
    AlreadyRunning(String),

    #[error("server {0} is not running")]
    NotRunning(String),

    #[error("server executable not found (looked in {})", display_paths(.searched))]
    ExecutableMissing { searched: Vec<PathBuf> },

    #[error("server {name} did not exit within {}ms", .waited.as_millis())]
    StopTimedOut { name: String, waited: Duration },

    #[error("failed to launch server: {0}")]
    LaunchFailed(String),

    #[error("failed to fetch updater: {0}")]
    UpdaterFetchFailed(String),

    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("failed to write install script: {0}")]
    ScriptWriteFailed(String),

    #[error("version query failed: {0}")]
    VersionQueryFailed(String),

    #[error("failed to persist settings: {0}")]
    Persist(String),

    #[error("io error: {0}")]
    Io(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl SupervisorError {
    /// Stable reason code for callers that branch on failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownServer(_) => "unknown_server",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::ExecutableMissing { .. } => "executable_missing",
            Self::StopTimedOut { .. } => "stop_timed_out",
            Self::LaunchFailed(_) => "launch_failed",
            Self::UpdaterFetchFailed(_) => "updater_fetch_failed",
            Self::UpdateFailed(_) => "update_failed",
            Self::ScriptWriteFailed(_) => "script_write_failed",
            Self::VersionQueryFailed(_) => "version_query_failed",
            Self::Persist(_) => "persist_failed",
            Self::Io(_) => "io_error",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownServer(_)
            | Self::InvalidDefinition(_)
            | Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::ExecutableMissing { .. } => ErrorClass::User,
            Self::StopTimedOut { .. } | Self::Persist(_) => ErrorClass::Transient,
            Self::LaunchFailed(_)
            | Self::UpdaterFetchFailed(_)
            | Self::UpdateFailed(_)
            | Self::ScriptWriteFailed(_)
            | Self::VersionQueryFailed(_)
            | Self::Io(_) => ErrorClass::FatalToRequest,
        }
    }

    pub(crate) fn from_anyhow(wrap: fn(String) -> Self, err: &anyhow::Error) -> Self {
        wrap(format_error_chain(err))
    }
}

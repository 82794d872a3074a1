use std::fmt;

/// Stable identifier of a managed server: its configured name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ServerName(pub String);

impl ServerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    #[default]
    Stopped,
    Updating,
    Running,
}

/// How a server process ended, derived from its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitClass {
    NormalExit,
    Crash,
    /// The process reported that its network ports were already bound.
    PortConflict,
}

impl ExitClass {
    pub fn classify(code: Option<i32>, port_conflict_code: i32) -> Self {
        match code {
            Some(0) => Self::NormalExit,
            Some(c) if c == port_conflict_code => Self::PortConflict,
            _ => Self::Crash,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub name: ServerName,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub restart_attempts: u32,
    pub user_requested_stop: bool,
    pub auto_restart: bool,
    pub update_owed: bool,
    pub last_exit_code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        pid: Option<u32>,
        attempt: u32,
    },
    Stopping,
    Stopped {
        exit_code: Option<i32>,
    },
    Crashed {
        class: ExitClass,
        exit_code: Option<i32>,
    },
    Restarting {
        attempt: u32,
        max_attempts: u32,
    },
    GivingUp {
        attempts: u32,
    },
    UpdateStarted,
    UpdateCompleted,
    UpdateFailed {
        reason: String,
    },
    Ready {
        ip: String,
        steam_id: String,
    },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { pid, attempt } => {
                write!(f, "started")?;
                if let Some(pid) = pid {
                    write!(f, " (pid {pid})")?;
                }
                if *attempt > 0 {
                    write!(f, " attempt {attempt}")?;
                }
                Ok(())
            }
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped { exit_code } => match exit_code {
                Some(code) => write!(f, "stopped (exit code {code})"),
                None => f.write_str("stopped"),
            },
            Self::Crashed { class, exit_code } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                match class {
                    ExitClass::PortConflict => write!(
                        f,
                        "exited with code {code}; required ports were already in use"
                    ),
                    ExitClass::NormalExit => write!(f, "exited unexpectedly (exit code {code})"),
                    ExitClass::Crash => write!(f, "crashed (exit code {code})"),
                }
            }
            Self::Restarting {
                attempt,
                max_attempts,
            } => write!(f, "restarting (attempt {attempt}/{max_attempts})"),
            Self::GivingUp { attempts } => write!(
                f,
                "restart failed {attempts} times; auto-restart disabled"
            ),
            Self::UpdateStarted => f.write_str("update started"),
            Self::UpdateCompleted => f.write_str("update completed"),
            Self::UpdateFailed { reason } => write!(f, "update failed: {reason}"),
            Self::Ready { ip, steam_id } => {
                write!(f, "ready (public ip {ip}, steam id {steam_id})")
            }
        }
    }
}

/// A lifecycle event tagged with the server it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LifecycleNotification {
    pub server: ServerName,
    pub event: LifecycleEvent,
}

impl fmt::Display for LifecycleNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.server, self.event)
    }
}

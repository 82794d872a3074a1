use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::future::BoxFuture;
use tokio::process::Command;

use crate::launch::LaunchSpec;

/// Exit status of a supervised process. `code` is `None` when the process was
/// killed by a signal or was adopted and its status is unknowable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

#[async_trait::async_trait]
pub trait ProcessControl: Send + Sync {
    /// Asks the process to shut down cleanly. Does not wait for it to exit.
    async fn request_shutdown(&self) -> anyhow::Result<()>;
    async fn kill(&self) -> anyhow::Result<()>;
}

/// A running process: its pid, a way to signal it and a single-fire future
/// that resolves once the OS reports it gone.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub control: Arc<dyn ProcessControl>,
    pub exit: BoxFuture<'static, ExitOutcome>,
}

#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess>;
    /// Takes over a process this agent did not start.
    async fn attach(&self, pid: u32) -> anyhow::Result<LaunchedProcess>;
}

#[derive(Debug, Clone)]
pub struct OsLauncher {
    exit_poll: Duration,
}

impl OsLauncher {
    pub fn new(exit_poll: Duration) -> Self {
        Self { exit_poll }
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for OsLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess> {
        let mut cmd = Command::new(&spec.exec);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        // Own session so the server outlives the agent and Ctrl-C in the
        // agent's terminal does not reach it.
        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} (cwd {})", spec.exec.display(), spec.cwd.display()))?;
        let pid = child.id();

        let exit = Box::pin(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(error = %err, "wait on server process failed");
                    None
                }
            };
            ExitOutcome { code }
        });

        Ok(LaunchedProcess {
            pid,
            control: Arc::new(PidControl { pid, group: true }),
            exit,
        })
    }

    async fn attach(&self, pid: u32) -> anyhow::Result<LaunchedProcess> {
        if !pid_alive(pid) {
            anyhow::bail!("process {pid} is not running");
        }
        let poll = self.exit_poll;
        let exit = Box::pin(async move {
            loop {
                tokio::time::sleep(poll).await;
                if !pid_alive(pid) {
                    return ExitOutcome { code: None };
                }
            }
        });

        Ok(LaunchedProcess {
            pid: Some(pid),
            control: Arc::new(PidControl {
                pid: Some(pid),
                group: false,
            }),
            exit,
        })
    }
}

/// Signals a process by pid. `group` targets the whole session we created
/// at spawn time.
#[derive(Debug)]
struct PidControl {
    pid: Option<u32>,
    group: bool,
}

impl PidControl {
    fn pid(&self) -> anyhow::Result<u32> {
        self.pid.context("process has no pid (already exited)")
    }
}

#[async_trait::async_trait]
impl ProcessControl for PidControl {
    async fn request_shutdown(&self) -> anyhow::Result<()> {
        let pid = self.pid()?;
        #[cfg(unix)]
        return send_signal(pid, self.group, libc::SIGTERM);
        #[cfg(windows)]
        return taskkill(pid, false).await;
    }

    async fn kill(&self) -> anyhow::Result<()> {
        let pid = self.pid()?;
        #[cfg(unix)]
        return send_signal(pid, self.group, libc::SIGKILL);
        #[cfg(windows)]
        return taskkill(pid, true).await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, group: bool, sig: libc::c_int) -> anyhow::Result<()> {
    let target = i32::try_from(pid).context("pid out of range")?;
    let target = if group { -target } else { target };
    let rc = unsafe { libc::kill(target, sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Group already gone (or never formed); fall back to the pid itself.
        if group && err.raw_os_error() == Some(libc::ESRCH) {
            return send_signal(pid, false, sig);
        }
        return Err(err).with_context(|| format!("signal {sig} to {pid}"));
    }
    Ok(())
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("taskkill");
    if force {
        cmd.arg("/F");
    }
    let status = cmd
        .arg("/PID")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .context("run taskkill")?;
    if !status.success() {
        anyhow::bail!("taskkill exited with {status}");
    }
    Ok(())
}

pub fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

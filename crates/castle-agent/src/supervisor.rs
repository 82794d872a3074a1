use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use castle_process::{
    ExitClass, LifecycleEvent, LifecycleNotification, ServerName, ServerState, ServerStatus,
};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, watch};

use crate::{
    archive,
    discovery::{ProcessScanner, match_definition},
    error::SupervisorError,
    launch::{
        build_launch_spec, ensure_server_layout, find_nested_runtime_dir, log_file_path,
        resolve_executable, save_data_dir,
    },
    log_tail::{LogTail, watch_readiness},
    notify::Notifier,
    os_process::{ExitOutcome, ProcessControl, ProcessLauncher},
    rcon,
    settings::{AppSettings, ServerDefinition, SettingsStore},
    steamcmd::Updater,
    support::{self, format_error_chain},
};

/// Consecutive automatic restarts before auto-restart is switched off.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_executable: String,
    pub port_conflict_exit_code: i32,
    pub backups_dir: PathBuf,
    pub stop_timeout: Duration,
    pub stable_run_threshold: Duration,
    pub ready_poll_interval: Duration,
    pub rcon_timeout: Duration,
    pub rcon_hold: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(app: &AppSettings) -> Self {
        Self {
            server_executable: app.server_executable.clone(),
            port_conflict_exit_code: app.port_conflict_exit_code,
            backups_dir: app.backups_dir(),
            stop_timeout: support::stop_timeout(),
            stable_run_threshold: support::stable_run_threshold(),
            ready_poll_interval: support::ready_poll_interval(),
            rcon_timeout: support::rcon_timeout(),
            rcon_hold: support::rcon_hold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTrigger {
    /// Explicit request (user, auto-start, restart command). Starts a fresh
    /// restart sequence.
    Requested,
    /// Issued by the exit observer for the pending launch `ticket`; keeps
    /// the attempt counter.
    AutoRestart { ticket: u64 },
}

/// Announce a restart over RCON and wait before bouncing the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartWarning {
    pub minutes: u32,
    pub lead_time: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Zip `SaveData` into the backups directory first.
    pub backup_saves: bool,
    pub delete_files: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub adopted: Vec<String>,
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct ProcessHandle {
    pid: Option<u32>,
    control: Arc<dyn ProcessControl>,
    started_at: Instant,
    alive: watch::Sender<bool>,
}

struct Runtime {
    def: ServerDefinition,
    state: ServerState,
    handle: Option<ProcessHandle>,
    restart_attempts: u32,
    user_requested_stop: bool,
    update_owed: bool,
    /// A start (or adoption) is in progress and has no handle yet. A stop in
    /// this window cancels it.
    launch_pending: bool,
    /// Identifies the pending launch so a cancelled one cannot install its
    /// process after a newer start took over.
    launch_ticket: u64,
    last_exit_code: Option<i32>,
    message: Option<String>,
    generation: u64,
}

impl Runtime {
    fn new(def: ServerDefinition) -> Self {
        Self {
            def,
            state: ServerState::Stopped,
            handle: None,
            restart_attempts: 0,
            user_requested_stop: false,
            update_owed: false,
            launch_pending: false,
            launch_ticket: 0,
            last_exit_code: None,
            message: None,
            generation: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.handle.is_none() && self.state == ServerState::Stopped && !self.launch_pending
    }

    fn begin_launch(&mut self) -> u64 {
        self.launch_pending = true;
        self.launch_ticket += 1;
        self.launch_ticket
    }

    /// Whether the launch identified by `ticket` is still wanted.
    fn launch_wanted(&self, ticket: u64) -> bool {
        self.launch_pending && self.launch_ticket == ticket && !self.user_requested_stop
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            name: ServerName::from(self.def.name.as_str()),
            state: self.state,
            pid: self.handle.as_ref().and_then(|h| h.pid),
            restart_attempts: self.restart_attempts,
            user_requested_stop: self.user_requested_stop,
            auto_restart: self.def.auto_restart,
            update_owed: self.update_owed,
            last_exit_code: self.last_exit_code,
            message: self.message.clone(),
        }
    }
}

enum RestartDecision {
    None,
    Restart { attempt: u32, ticket: u64 },
    GiveUp { attempts: u32 },
}

struct Inner {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    updater: Arc<dyn Updater>,
    store: Arc<dyn SettingsStore>,
    notifier: Notifier,
    servers: Mutex<HashMap<String, Runtime>>,
}

/// Owns the runtime state of every managed server. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        updater: Arc<dyn Updater>,
        store: Arc<dyn SettingsStore>,
        notifier: Notifier,
        definitions: Vec<ServerDefinition>,
    ) -> Self {
        let servers = definitions
            .into_iter()
            .map(|d| (d.name.clone(), Runtime::new(d)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                updater,
                store,
                notifier,
                servers: Mutex::new(servers),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotification> {
        self.inner.notifier.subscribe()
    }

    pub async fn add_server(&self, def: ServerDefinition) -> Result<(), SupervisorError> {
        if def.name.trim().is_empty() {
            return Err(SupervisorError::InvalidDefinition(
                "server name must be non-empty".to_string(),
            ));
        }
        if def.install_path.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidDefinition(format!(
                "server {} has no install path",
                def.name
            )));
        }
        let mut servers = self.inner.servers.lock().await;
        if servers.contains_key(&def.name) {
            return Err(SupervisorError::InvalidDefinition(format!(
                "duplicate server name: {}",
                def.name
            )));
        }
        self.inner
            .store
            .add_server(&def)
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::Persist, &e))?;
        tracing::info!(server = %def.name, path = %def.install_path.display(), "server added");
        servers.insert(def.name.clone(), Runtime::new(def));
        Ok(())
    }

    /// Forgets a stopped server. Returns the backup archive path when one was
    /// written. On any failure the server stays registered.
    pub async fn remove_server(
        &self,
        name: &str,
        opts: RemoveOptions,
    ) -> Result<Option<PathBuf>, SupervisorError> {
        let rt = {
            let mut servers = self.inner.servers.lock().await;
            let rt = servers
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            if !rt.is_idle() {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            servers
                .remove(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?
        };

        match self.retire(&rt.def, opts).await {
            Ok(backup) => {
                tracing::info!(server = %name, "server removed");
                Ok(backup)
            }
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "server removal failed");
                self.inner
                    .servers
                    .lock()
                    .await
                    .entry(name.to_string())
                    .or_insert(rt);
                Err(err)
            }
        }
    }

    async fn retire(
        &self,
        def: &ServerDefinition,
        opts: RemoveOptions,
    ) -> Result<Option<PathBuf>, SupervisorError> {
        let mut backup = None;
        if opts.backup_saves {
            let src = save_data_dir(def);
            let dest = self
                .inner
                .config
                .backups_dir
                .join(format!("{}_Bak.zip", def.name.replace(' ', "_")));
            let dest_for_task = dest.clone();
            let files = tokio::task::spawn_blocking(move || {
                archive::zip_directory(&src, &dest_for_task)
            })
            .await
            .map_err(|e| anyhow::anyhow!("backup task failed: {e}"))
            .and_then(|r| r)
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::Io, &e))?;
            tracing::info!(server = %def.name, path = %dest.display(), files, "save data backed up");
            backup = Some(dest);
        }

        if opts.delete_files && def.install_path.exists() {
            tokio::fs::remove_dir_all(&def.install_path)
                .await
                .map_err(|e| {
                    SupervisorError::Io(format!("remove {}: {e}", def.install_path.display()))
                })?;
        }

        self.inner
            .store
            .remove_server(&def.name)
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::Persist, &e))?;
        Ok(backup)
    }

    pub async fn definition(&self, name: &str) -> Result<ServerDefinition, SupervisorError> {
        let servers = self.inner.servers.lock().await;
        servers
            .get(name)
            .map(|rt| rt.def.clone())
            .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))
    }

    pub async fn status(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        let servers = self.inner.servers.lock().await;
        servers
            .get(name)
            .map(Runtime::status)
            .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))
    }

    pub async fn list(&self) -> Vec<ServerStatus> {
        let servers = self.inner.servers.lock().await;
        let mut out = servers.values().map(Runtime::status).collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn start(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        start_boxed(self.inner.clone(), name.to_string(), StartTrigger::Requested).await
    }

    /// Asks the server to shut down and waits (bounded) for it to exit.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let (control, mut alive, templates) = {
            let mut servers = self.inner.servers.lock().await;
            let rt = servers
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            // Set before signalling so the exit observer sees a deliberate stop.
            rt.user_requested_stop = true;
            match rt.handle.as_ref() {
                Some(h) => (h.control.clone(), h.alive.subscribe(), rt.def.webhook.clone()),
                None if rt.launch_pending => {
                    rt.launch_pending = false;
                    tracing::info!(server = %name, "pending start cancelled by stop");
                    return Ok(());
                }
                None => {
                    rt.user_requested_stop = false;
                    return Err(SupervisorError::NotRunning(name.to_string()));
                }
            }
        };

        tracing::info!(server = %name, "stopping server");
        self.inner
            .notifier
            .publish(name, &templates, LifecycleEvent::Stopping);

        if let Err(err) = control.request_shutdown().await {
            tracing::warn!(
                server = %name,
                error = %format_error_chain(&err),
                "shutdown request failed"
            );
        }

        let waited = self.inner.config.stop_timeout;
        match tokio::time::timeout(waited, alive.wait_for(|a| !*a)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(server = %name, waited_ms = waited.as_millis() as u64, "stop timed out");
                Err(SupervisorError::StopTimedOut {
                    name: name.to_string(),
                    waited,
                })
            }
        }
    }

    /// Escalation after a timed-out stop. Still counts as a deliberate stop.
    pub async fn force_kill(&self, name: &str) -> Result<(), SupervisorError> {
        let control = {
            let mut servers = self.inner.servers.lock().await;
            let rt = servers
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            let h = rt
                .handle
                .as_ref()
                .ok_or_else(|| SupervisorError::NotRunning(name.to_string()))?;
            rt.user_requested_stop = true;
            h.control.clone()
        };
        tracing::warn!(server = %name, "force killing server");
        control
            .kill()
            .await
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::Io, &e))
    }

    /// Optionally warns players over RCON, then stops and starts the server.
    pub async fn restart(
        &self,
        name: &str,
        warning: Option<RestartWarning>,
    ) -> Result<ServerStatus, SupervisorError> {
        let def = self.definition(name).await?;
        if let Some(w) = warning {
            let cfg = &self.inner.config;
            match rcon::broadcast_restart_warning(&def.rcon, w.minutes, cfg.rcon_timeout, cfg.rcon_hold)
                .await
            {
                Ok(()) => tracing::info!(server = %name, minutes = w.minutes, "restart announced"),
                Err(err) => tracing::warn!(
                    server = %name,
                    error = %format_error_chain(&err),
                    "restart announcement failed"
                ),
            }
            tokio::time::sleep(w.lead_time).await;
        }

        match self.stop(name).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(err) => return Err(err),
        }
        self.start(name).await
    }

    /// Runs the updater for a stopped server.
    pub async fn update(&self, name: &str) -> Result<(), SupervisorError> {
        let def = {
            let mut servers = self.inner.servers.lock().await;
            let rt = servers
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            if !rt.is_idle() {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            rt.state = ServerState::Updating;
            rt.def.clone()
        };
        run_update(&self.inner, name, def).await
    }

    /// Compares the newest public build against the last one seen. A newer
    /// build is remembered and marks every server as owing an update.
    pub async fn check_for_remote_version(&self) -> Result<bool, SupervisorError> {
        let token = self.inner.updater.latest_build_token().await?;
        let last = self.inner.store.last_version_token();
        if token == last {
            tracing::debug!(token = %token, "server build unchanged");
            return Ok(false);
        }

        self.inner
            .store
            .set_last_version_token(&token)
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::Persist, &e))?;
        let mut servers = self.inner.servers.lock().await;
        for rt in servers.values_mut() {
            rt.update_owed = true;
        }
        tracing::info!(previous = %last, token = %token, "new server build available");
        Ok(true)
    }

    /// Re-adopts servers that are already running, then starts every
    /// auto-start server that is still stopped.
    pub async fn discover_and_autostart(&self, scanner: &dyn ProcessScanner) -> DiscoveryReport {
        let running = scanner.scan();
        let mut report = DiscoveryReport::default();
        let mut taken = Vec::<u32>::new();

        let mut names = self
            .inner
            .servers
            .lock()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();

        for name in &names {
            match adopt(&self.inner, name, &running, &taken).await {
                Ok(Some(pid)) => {
                    taken.push(pid);
                    report.adopted.push(name.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "failed to adopt running server");
                    report.failed.push((name.clone(), err.to_string()));
                }
            }
        }

        for name in &names {
            let wants_start = {
                let servers = self.inner.servers.lock().await;
                servers
                    .get(name)
                    .is_some_and(|rt| rt.def.auto_start && rt.is_idle())
            };
            if !wants_start {
                continue;
            }
            match self.start(name).await {
                Ok(_) => report.started.push(name.clone()),
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "auto-start failed");
                    report.failed.push((name.clone(), err.to_string()));
                }
            }
        }
        report
    }
}

async fn adopt(
    inner: &Arc<Inner>,
    name: &str,
    running: &[crate::discovery::RunningProcess],
    taken: &[u32],
) -> Result<Option<u32>, SupervisorError> {
    let (pid, ticket) = {
        let mut servers = inner.servers.lock().await;
        let Some(rt) = servers.get_mut(name) else {
            return Ok(None);
        };
        if !rt.is_idle() {
            return Ok(None);
        }
        let Some(pid) = match_definition(&rt.def, &inner.config.server_executable, running, taken)
        else {
            return Ok(None);
        };
        rt.user_requested_stop = false;
        (pid, rt.begin_launch())
    };

    let launched = match inner.launcher.attach(pid).await {
        Ok(v) => v,
        Err(err) => {
            if let Some(rt) = inner.servers.lock().await.get_mut(name)
                && rt.launch_ticket == ticket
            {
                rt.launch_pending = false;
            }
            return Err(SupervisorError::from_anyhow(SupervisorError::LaunchFailed, &err));
        }
    };

    let mut servers = inner.servers.lock().await;
    let Some(rt) = servers.get_mut(name).filter(|rt| rt.launch_wanted(ticket)) else {
        drop(servers);
        tracing::info!(server = %name, pid, "adoption cancelled by stop");
        if let Err(err) = launched.control.request_shutdown().await {
            tracing::warn!(server = %name, error = %format_error_chain(&err), "shutdown request failed");
        }
        return Ok(None);
    };
    let (alive, _) = watch::channel(true);
    rt.launch_pending = false;
    rt.generation += 1;
    rt.state = ServerState::Running;
    rt.message = None;
    rt.handle = Some(ProcessHandle {
        pid: launched.pid,
        control: launched.control,
        started_at: Instant::now(),
        alive,
    });
    let generation = rt.generation;
    drop(servers);

    tracing::info!(server = %name, pid, "adopted running server");
    tokio::spawn(observe_exit(
        inner.clone(),
        name.to_string(),
        generation,
        launched.exit,
    ));
    Ok(Some(pid))
}

fn start_boxed(
    inner: Arc<Inner>,
    name: String,
    trigger: StartTrigger,
) -> BoxFuture<'static, Result<ServerStatus, SupervisorError>> {
    Box::pin(async move { start_inner(&inner, &name, trigger).await })
}

async fn start_inner(
    inner: &Arc<Inner>,
    name: &str,
    trigger: StartTrigger,
) -> Result<ServerStatus, SupervisorError> {
    let (ticket, owed_update) = {
        let mut servers = inner.servers.lock().await;
        let rt = servers
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
        let ticket = match trigger {
            StartTrigger::Requested => {
                if !rt.is_idle() {
                    return Err(SupervisorError::AlreadyRunning(name.to_string()));
                }
                rt.user_requested_stop = false;
                rt.begin_launch()
            }
            StartTrigger::AutoRestart { ticket } => {
                if !rt.launch_wanted(ticket) || rt.handle.is_some() {
                    if rt.launch_ticket == ticket {
                        rt.launch_pending = false;
                    }
                    tracing::info!(server = %name, "automatic restart cancelled");
                    return Ok(rt.status());
                }
                ticket
            }
        };
        let owed_update = if rt.update_owed {
            rt.state = ServerState::Updating;
            Some(rt.def.clone())
        } else {
            None
        };
        (ticket, owed_update)
    };

    if let Some(def) = owed_update
        && let Err(err) = run_update(inner, name, def).await
    {
        abandon_launch(inner, name, ticket, None).await;
        return Err(err);
    }

    let def = {
        let mut servers = inner.servers.lock().await;
        let rt = servers
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
        // A stop issued while we were updating or waiting clears the flag.
        if !rt.launch_wanted(ticket) {
            if rt.launch_ticket == ticket {
                rt.launch_pending = false;
            }
            tracing::info!(server = %name, "start cancelled before launch");
            return Ok(rt.status());
        }
        if rt.handle.is_some() || rt.state != ServerState::Stopped {
            rt.launch_pending = false;
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        rt.def.clone()
    };

    // Launch without holding the map so other servers stay responsive.
    let prepared = resolve_executable(&def, &inner.config.server_executable)
        .map_err(|searched| SupervisorError::ExecutableMissing { searched })
        .and_then(|exec| {
            ensure_server_layout(&def)
                .map_err(|e| SupervisorError::Io(format!("create server directories: {e}")))?;
            Ok(build_launch_spec(&def, exec))
        });
    let spec = match prepared {
        Ok(spec) => spec,
        Err(err) => {
            abandon_launch(inner, name, ticket, None).await;
            return Err(err);
        }
    };
    let tail = LogTail::at_end(log_file_path(&def));
    tracing::info!(
        server = %name,
        exec = %spec.exec.display(),
        args = %spec.command_line,
        "launching server"
    );
    let launched = match inner.launcher.launch(&spec).await {
        Ok(v) => v,
        Err(err) => {
            abandon_launch(inner, name, ticket, Some(format_error_chain(&err))).await;
            return Err(SupervisorError::from_anyhow(SupervisorError::LaunchFailed, &err));
        }
    };

    let mut servers = inner.servers.lock().await;
    let rt = servers
        .get_mut(name)
        .filter(|rt| rt.launch_wanted(ticket) && rt.handle.is_none());
    let Some(rt) = rt else {
        let status = servers.get_mut(name).map(|rt| {
            if rt.launch_ticket == ticket {
                rt.launch_pending = false;
            }
            rt.status()
        });
        drop(servers);
        tracing::info!(server = %name, pid = ?launched.pid, "stop won over launch; killing new process");
        if let Err(err) = launched.control.kill().await {
            tracing::warn!(server = %name, error = %format_error_chain(&err), "kill failed");
        }
        tokio::spawn(launched.exit);
        return status.ok_or_else(|| SupervisorError::UnknownServer(name.to_string()));
    };

    if trigger == StartTrigger::Requested {
        rt.restart_attempts = 0;
    }
    let (alive, alive_rx) = watch::channel(true);
    rt.launch_pending = false;
    rt.generation += 1;
    rt.state = ServerState::Running;
    rt.message = None;
    rt.handle = Some(ProcessHandle {
        pid: launched.pid,
        control: launched.control,
        started_at: Instant::now(),
        alive,
    });
    let generation = rt.generation;
    let attempt = rt.restart_attempts;
    let status = rt.status();
    drop(servers);

    tracing::info!(server = %name, pid = ?launched.pid, attempt, "server started");
    inner.notifier.publish(
        name,
        &def.webhook,
        LifecycleEvent::Started {
            pid: launched.pid,
            attempt,
        },
    );

    tokio::spawn(observe_exit(
        inner.clone(),
        name.to_string(),
        generation,
        launched.exit,
    ));
    tokio::spawn(watch_ready(
        inner.clone(),
        name.to_string(),
        def,
        tail,
        alive_rx,
    ));
    Ok(status)
}

/// Clears a pending launch that failed before a process was installed.
async fn abandon_launch(inner: &Inner, name: &str, ticket: u64, message: Option<String>) {
    if let Some(rt) = inner.servers.lock().await.get_mut(name)
        && rt.launch_ticket == ticket
    {
        rt.launch_pending = false;
        if message.is_some() {
            rt.message = message;
        }
    }
}

async fn observe_exit(
    inner: Arc<Inner>,
    name: String,
    generation: u64,
    exit: BoxFuture<'static, ExitOutcome>,
) {
    let outcome = exit.await;

    let (class, user_stop, decision, templates) = {
        let mut servers = inner.servers.lock().await;
        let Some(rt) = servers.get_mut(&name) else {
            return;
        };
        if rt.generation != generation {
            return;
        }

        let handle = rt.handle.take();
        rt.state = ServerState::Stopped;
        rt.last_exit_code = outcome.code;
        let uptime = handle
            .as_ref()
            .map(|h| h.started_at.elapsed())
            .unwrap_or_default();
        if let Some(h) = &handle {
            h.alive.send_replace(false);
        }

        let class = ExitClass::classify(outcome.code, inner.config.port_conflict_exit_code);
        let user_stop = rt.user_requested_stop;
        let decision = if user_stop || !rt.def.auto_restart {
            RestartDecision::None
        } else {
            if uptime >= inner.config.stable_run_threshold {
                rt.restart_attempts = 0;
            }
            if rt.restart_attempts >= MAX_RESTART_ATTEMPTS {
                let attempts = rt.restart_attempts;
                rt.restart_attempts = 0;
                rt.def.auto_restart = false;
                RestartDecision::GiveUp { attempts }
            } else {
                rt.restart_attempts += 1;
                RestartDecision::Restart {
                    attempt: rt.restart_attempts,
                    ticket: rt.begin_launch(),
                }
            }
        };
        (class, user_stop, decision, rt.def.webhook.clone())
    };

    if user_stop {
        tracing::info!(server = %name, exit_code = ?outcome.code, "server stopped");
        inner.notifier.publish(
            &name,
            &templates,
            LifecycleEvent::Stopped {
                exit_code: outcome.code,
            },
        );
    } else {
        match class {
            ExitClass::NormalExit => {
                tracing::info!(server = %name, exit_code = ?outcome.code, "server exited")
            }
            ExitClass::Crash => {
                tracing::warn!(server = %name, exit_code = ?outcome.code, "server crashed")
            }
            ExitClass::PortConflict => tracing::warn!(
                server = %name,
                exit_code = ?outcome.code,
                "server exited: required ports already in use"
            ),
        }
        inner.notifier.publish(
            &name,
            &templates,
            LifecycleEvent::Crashed {
                class,
                exit_code: outcome.code,
            },
        );
    }

    match decision {
        RestartDecision::None => {}
        RestartDecision::GiveUp { attempts } => {
            tracing::warn!(server = %name, attempts, "giving up; auto-restart disabled");
            if let Err(err) = inner.store.set_auto_restart(&name, false) {
                tracing::warn!(
                    server = %name,
                    error = %format_error_chain(&err),
                    "failed to persist auto-restart flag"
                );
            }
            inner
                .notifier
                .publish(&name, &templates, LifecycleEvent::GivingUp { attempts });
        }
        RestartDecision::Restart { attempt, ticket } => {
            tracing::info!(server = %name, attempt, max = MAX_RESTART_ATTEMPTS, "restarting server");
            inner.notifier.publish(
                &name,
                &templates,
                LifecycleEvent::Restarting {
                    attempt,
                    max_attempts: MAX_RESTART_ATTEMPTS,
                },
            );
            if let Err(err) = start_boxed(inner.clone(), name.clone(), StartTrigger::AutoRestart { ticket }).await
            {
                tracing::warn!(server = %name, error = %err, "automatic restart failed");
                if let Some(rt) = inner.servers.lock().await.get_mut(&name) {
                    rt.message = Some(err.to_string());
                }
            }
        }
    }
}

async fn watch_ready(
    inner: Arc<Inner>,
    name: String,
    def: ServerDefinition,
    tail: LogTail,
    alive: watch::Receiver<bool>,
) {
    let Some(ready) = watch_readiness(tail, alive, inner.config.ready_poll_interval).await else {
        return;
    };
    tracing::info!(server = %name, ip = %ready.ip, steam_id = %ready.steam_id, "server ready");
    inner.notifier.publish(
        &name,
        &def.webhook,
        LifecycleEvent::Ready {
            ip: ready.ip,
            steam_id: ready.steam_id,
        },
    );
}

/// Runs the updater with the runtime already marked `Updating`; always leaves
/// it `Stopped`.
async fn run_update(
    inner: &Arc<Inner>,
    name: &str,
    def: ServerDefinition,
) -> Result<(), SupervisorError> {
    tracing::info!(server = %name, "update started");
    inner
        .notifier
        .publish(name, &def.webhook, LifecycleEvent::UpdateStarted);

    let res = inner.updater.run_update(&def, def.verify_on_update).await;
    let discovered = match &res {
        Ok(()) => discover_runtime_path(inner, name, &def),
        Err(_) => None,
    };

    if let Some(rt) = inner.servers.lock().await.get_mut(name) {
        rt.state = ServerState::Stopped;
        match &res {
            Ok(()) => {
                rt.update_owed = false;
                rt.message = None;
                if let Some(dir) = &discovered {
                    rt.def.external_runtime_path = Some(dir.clone());
                }
            }
            Err(err) => rt.message = Some(err.to_string()),
        }
    }

    match &res {
        Ok(()) => {
            tracing::info!(server = %name, "update completed");
            inner
                .notifier
                .publish(name, &def.webhook, LifecycleEvent::UpdateCompleted);
        }
        Err(err) => {
            tracing::warn!(server = %name, code = err.code(), error = %err, "update failed");
            inner.notifier.publish(
                name,
                &def.webhook,
                LifecycleEvent::UpdateFailed {
                    reason: err.to_string(),
                },
            );
        }
    }
    res
}

fn discover_runtime_path(inner: &Inner, name: &str, def: &ServerDefinition) -> Option<PathBuf> {
    let exe = &inner.config.server_executable;
    if def
        .external_runtime_path
        .as_ref()
        .is_some_and(|p| p.join(exe).is_file())
    {
        return None;
    }
    let dir = find_nested_runtime_dir(&def.install_path, exe)?;
    tracing::info!(server = %name, path = %dir.display(), "discovered server runtime path");
    if let Err(err) = inner.store.set_runtime_path(name, &dir) {
        tracing::warn!(
            server = %name,
            error = %format_error_chain(&err),
            "failed to persist runtime path"
        );
    }
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discovery::RunningProcess,
        launch::LaunchSpec,
        notify::{WebhookSink, tests::ChannelSink},
        os_process::LaunchedProcess,
        settings::{DEFAULT_SERVER_EXECUTABLE, TomlSettingsStore, WebhookSettings},
    };
    use std::{
        path::Path,
        sync::{
            Mutex as StdMutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::sync::{Semaphore, mpsc, oneshot};

    const WAIT: Duration = Duration::from_secs(5);

    type ExitSlot = Arc<StdMutex<Option<oneshot::Sender<ExitOutcome>>>>;

    struct FakeControl {
        slot: ExitSlot,
        ignore_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl ProcessControl for FakeControl {
        async fn request_shutdown(&self) -> anyhow::Result<()> {
            if !self.ignore_shutdown
                && let Some(tx) = self.slot.lock().unwrap().take()
            {
                let _ = tx.send(ExitOutcome { code: Some(0) });
            }
            Ok(())
        }

        async fn kill(&self) -> anyhow::Result<()> {
            if let Some(tx) = self.slot.lock().unwrap().take() {
                let _ = tx.send(ExitOutcome { code: None });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launches: StdMutex<Vec<LaunchSpec>>,
        exits: StdMutex<Vec<ExitSlot>>,
        attached: StdMutex<Vec<u32>>,
        ignore_shutdown: std::sync::atomic::AtomicBool,
        entered: AtomicUsize,
        gate: StdMutex<Option<(usize, Arc<Semaphore>)>>,
    }

    impl FakeLauncher {
        fn launch_count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }

        fn entered(&self) -> usize {
            self.entered.load(Ordering::SeqCst)
        }

        /// Holds the `n`th launch (0-based) until a permit is added.
        fn gate_launch(&self, n: usize) -> Arc<Semaphore> {
            let gate = Arc::new(Semaphore::new(0));
            *self.gate.lock().unwrap() = Some((n, gate.clone()));
            gate
        }

        fn was_killed(&self, n: usize) -> bool {
            self.exits
                .lock()
                .unwrap()
                .get(n)
                .is_some_and(|slot| slot.lock().unwrap().is_none())
        }

        fn process(&self, pid: u32) -> LaunchedProcess {
            let (tx, rx) = oneshot::channel();
            let slot: ExitSlot = Arc::new(StdMutex::new(Some(tx)));
            self.exits.lock().unwrap().push(slot.clone());
            LaunchedProcess {
                pid: Some(pid),
                control: Arc::new(FakeControl {
                    slot,
                    ignore_shutdown: self.ignore_shutdown.load(Ordering::SeqCst),
                }),
                exit: Box::pin(async move { rx.await.unwrap_or(ExitOutcome { code: None }) }),
            }
        }

        /// Makes the most recent process exit with `code`.
        fn exit_latest(&self, code: Option<i32>) {
            let slot = self.exits.lock().unwrap().last().cloned().unwrap();
            let tx = slot.lock().unwrap().take().expect("process already exited");
            tx.send(ExitOutcome { code }).unwrap();
        }
    }

    #[async_trait::async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<LaunchedProcess> {
            let n = self.entered.fetch_add(1, Ordering::SeqCst);
            let gate = self
                .gate
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(i, _)| *i == n)
                .map(|(_, g)| g.clone());
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
            let pid = 1001 + self.launch_count() as u32;
            let process = self.process(pid);
            self.launches.lock().unwrap().push(spec.clone());
            Ok(process)
        }

        async fn attach(&self, pid: u32) -> anyhow::Result<LaunchedProcess> {
            self.attached.lock().unwrap().push(pid);
            Ok(self.process(pid))
        }
    }

    struct FakeUpdater {
        gate: Semaphore,
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        token: StdMutex<Result<String, String>>,
        nest_runtime: bool,
    }

    impl FakeUpdater {
        fn open() -> Self {
            Self::with_gate(Semaphore::MAX_PERMITS)
        }

        fn with_gate(permits: usize) -> Self {
            Self {
                gate: Semaphore::new(permits),
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                token: StdMutex::new(Ok("100".to_string())),
                nest_runtime: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl Updater for FakeUpdater {
        async fn run_update(
            &self,
            def: &ServerDefinition,
            _validate: bool,
        ) -> Result<(), SupervisorError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            if self.nest_runtime {
                let nested = def
                    .install_path
                    .join("steamapps/common/VRisingDedicatedServer");
                std::fs::create_dir_all(&nested).unwrap();
                std::fs::write(nested.join(DEFAULT_SERVER_EXECUTABLE), b"").unwrap();
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn latest_build_token(&self) -> Result<String, SupervisorError> {
            self.token
                .lock()
                .unwrap()
                .clone()
                .map_err(SupervisorError::VersionQueryFailed)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        /// `+name` / `-name` for every registry change.
        registry: StdMutex<Vec<String>>,
        auto_restart: StdMutex<Vec<(String, bool)>>,
        runtime_paths: StdMutex<Vec<(String, PathBuf)>>,
        token: StdMutex<String>,
    }

    impl SettingsStore for MemoryStore {
        fn add_server(&self, def: &ServerDefinition) -> anyhow::Result<()> {
            self.registry.lock().unwrap().push(format!("+{}", def.name));
            Ok(())
        }

        fn remove_server(&self, server: &str) -> anyhow::Result<()> {
            self.registry.lock().unwrap().push(format!("-{server}"));
            Ok(())
        }

        fn set_auto_restart(&self, server: &str, enabled: bool) -> anyhow::Result<()> {
            self.auto_restart
                .lock()
                .unwrap()
                .push((server.to_string(), enabled));
            Ok(())
        }

        fn set_runtime_path(&self, server: &str, path: &Path) -> anyhow::Result<()> {
            self.runtime_paths
                .lock()
                .unwrap()
                .push((server.to_string(), path.to_path_buf()));
            Ok(())
        }

        fn last_version_token(&self) -> String {
            self.token.lock().unwrap().clone()
        }

        fn set_last_version_token(&self, token: &str) -> anyhow::Result<()> {
            *self.token.lock().unwrap() = token.to_string();
            Ok(())
        }
    }

    struct Harness {
        sup: Supervisor,
        launcher: Arc<FakeLauncher>,
        updater: Arc<FakeUpdater>,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<LifecycleNotification>,
        webhooks: mpsc::UnboundedReceiver<String>,
        root: tempfile::TempDir,
    }

    fn config(root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            server_executable: DEFAULT_SERVER_EXECUTABLE.to_string(),
            port_conflict_exit_code: -2147483645,
            backups_dir: root.join("Backups"),
            stop_timeout: Duration::from_secs(2),
            stable_run_threshold: Duration::from_secs(60),
            ready_poll_interval: Duration::from_millis(20),
            rcon_timeout: Duration::from_millis(500),
            rcon_hold: Duration::from_millis(50),
        }
    }

    /// Server definition with its binary in place.
    fn server(root: &Path, name: &str) -> ServerDefinition {
        let install = root.join(name.replace(' ', "_"));
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join(DEFAULT_SERVER_EXECUTABLE), b"").unwrap();
        let mut def = ServerDefinition::new(name, install);
        def.auto_restart = true;
        def.webhook.enabled = true;
        def.webhook.start_server = "starting".to_string();
        def.webhook.server_crash = "crashed".to_string();
        def.webhook.attempt_start3 = "gave up".to_string();
        def.webhook.server_ready = "ready".to_string();
        def.webhook.broadcast_ip = true;
        def
    }

    fn harness_with(
        updater: FakeUpdater,
        tweak: impl FnOnce(&Path, &mut SupervisorConfig) -> Vec<ServerDefinition>,
    ) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        let defs = tweak(root.path(), &mut cfg);

        let launcher = Arc::new(FakeLauncher::default());
        let updater = Arc::new(updater);
        let store = Arc::new(MemoryStore::default());
        let (tx, webhooks) = mpsc::unbounded_channel();
        let sink: Arc<dyn WebhookSink> = Arc::new(ChannelSink(tx));
        let notifier = Notifier::new(
            WebhookSettings {
                enabled: true,
                url: "https://hooks.invalid".to_string(),
            },
            Some(sink),
        );
        let sup = Supervisor::new(
            cfg,
            launcher.clone(),
            updater.clone(),
            store.clone(),
            notifier,
            defs,
        );
        let events = sup.subscribe();
        Harness {
            sup,
            launcher,
            updater,
            store,
            events,
            webhooks,
            root,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeUpdater::open(), |root, _| vec![server(root, "Main")])
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<LifecycleNotification>,
        pred: impl Fn(&LifecycleEvent) -> bool,
    ) -> LifecycleEvent {
        loop {
            let n = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if pred(&n.event) {
                return n.event;
            }
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness();
        let first = h.sup.start("Main").await.unwrap();
        assert_eq!(first.state, ServerState::Running);

        let err = h.sup.start("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(h.sup.status("Main").await.unwrap().pid, first.pid);
    }

    #[tokio::test]
    async fn stop_before_start_is_not_running() {
        let h = harness();
        let err = h.sup.stop("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
        assert!(!h.sup.status("Main").await.unwrap().user_requested_stop);

        let err = h.sup.start("Nope").await.unwrap_err();
        assert_eq!(err.code(), "unknown_server");
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let h = harness();
        let def = h.sup.definition("Main").await.unwrap();
        std::fs::remove_file(def.install_path.join(DEFAULT_SERVER_EXECUTABLE)).unwrap();

        let err = h.sup.start("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExecutableMissing { .. }));
        assert_eq!(h.sup.status("Main").await.unwrap().state, ServerState::Stopped);
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn start_uses_launch_contract_and_creates_layout() {
        let mut h = harness();
        h.sup.start("Main").await.unwrap();
        let def = h.sup.definition("Main").await.unwrap();
        let spec = h.launcher.launches.lock().unwrap()[0].clone();
        assert_eq!(spec.exec, def.install_path.join(DEFAULT_SERVER_EXECUTABLE));
        assert!(spec.command_line.starts_with("-persistentDataPath "));
        assert!(def.install_path.join("SaveData/Saves/v4").is_dir());
        assert_eq!(
            tokio::time::timeout(WAIT, h.webhooks.recv()).await.unwrap().unwrap(),
            "starting"
        );
    }

    #[tokio::test]
    async fn crash_loop_gives_up_after_three_restarts() {
        let mut h = harness();
        h.sup.start("Main").await.unwrap();

        for n in 1..=3 {
            h.launcher.exit_latest(Some(1));
            let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Restarting { .. })).await;
            assert_eq!(
                ev,
                LifecycleEvent::Restarting {
                    attempt: n,
                    max_attempts: MAX_RESTART_ATTEMPTS
                }
            );
            let launcher = h.launcher.clone();
            wait_until(move || launcher.launch_count() == n as usize + 1).await;
        }

        h.launcher.exit_latest(Some(1));
        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::GivingUp { .. })).await;
        assert_eq!(ev, LifecycleEvent::GivingUp { attempts: 3 });

        let status = h.sup.status("Main").await.unwrap();
        assert_eq!(h.launcher.launch_count(), 4);
        assert!(!status.auto_restart);
        assert_eq!(status.restart_attempts, 0);
        assert_eq!(status.state, ServerState::Stopped);
        assert_eq!(
            *h.store.auto_restart.lock().unwrap(),
            vec![("Main".to_string(), false)]
        );

        // A fresh manual start that crashes again is not restarted.
        h.sup.start("Main").await.unwrap();
        h.launcher.exit_latest(Some(1));
        next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Crashed { .. })).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.launcher.launch_count(), 5);
        assert_eq!(h.sup.status("Main").await.unwrap().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn deliberate_stop_never_restarts() {
        let mut h = harness();
        h.sup.start("Main").await.unwrap();
        h.sup.stop("Main").await.unwrap();

        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Stopped { .. })).await;
        assert_eq!(ev, LifecycleEvent::Stopped { exit_code: Some(0) });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = h.sup.status("Main").await.unwrap();
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(status.state, ServerState::Stopped);
        assert!(status.user_requested_stop);
        assert!(status.auto_restart);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn stop_timeout_is_reported_and_kill_is_deliberate() {
        let h = harness_with(FakeUpdater::open(), |root, cfg| {
            cfg.stop_timeout = Duration::from_millis(100);
            vec![server(root, "Main")]
        });
        h.launcher.ignore_shutdown.store(true, Ordering::SeqCst);
        h.sup.start("Main").await.unwrap();

        let err = h.sup.stop("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::StopTimedOut { .. }));
        assert_eq!(h.sup.status("Main").await.unwrap().state, ServerState::Running);

        h.sup.force_kill("Main").await.unwrap();
        let sup = h.sup.clone();
        let mut stopped = false;
        for _ in 0..500 {
            if sup.status("Main").await.unwrap().state == ServerState::Stopped {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stopped);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn counter_restarts_after_stable_run() {
        let mut h = harness_with(FakeUpdater::open(), |root, cfg| {
            cfg.stable_run_threshold = Duration::from_millis(50);
            vec![server(root, "Main")]
        });
        h.sup.start("Main").await.unwrap();

        h.launcher.exit_latest(Some(1));
        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Restarting { .. })).await;
        assert_eq!(ev, LifecycleEvent::Restarting { attempt: 1, max_attempts: 3 });
        let launcher = h.launcher.clone();
        wait_until(move || launcher.launch_count() == 2).await;

        // The restarted process stays up past the threshold before crashing.
        tokio::time::sleep(Duration::from_millis(120)).await;
        h.launcher.exit_latest(Some(1));
        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Restarting { .. })).await;
        assert_eq!(ev, LifecycleEvent::Restarting { attempt: 1, max_attempts: 3 });
    }

    #[tokio::test]
    async fn port_conflict_is_classified() {
        let mut h = harness();
        h.sup.start("Main").await.unwrap();
        h.launcher.exit_latest(Some(-2147483645));
        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Crashed { .. })).await;
        assert_eq!(
            ev,
            LifecycleEvent::Crashed {
                class: ExitClass::PortConflict,
                exit_code: Some(-2147483645)
            }
        );
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() {
        let h = harness_with(FakeUpdater::with_gate(0), |root, _| vec![server(root, "Main")]);
        let sup = h.sup.clone();
        let first = tokio::spawn(async move { sup.update("Main").await });

        let updater = h.updater.clone();
        wait_until(move || updater.runs.load(Ordering::SeqCst) == 1).await;
        assert_eq!(h.sup.status("Main").await.unwrap().state, ServerState::Updating);

        let err = h.sup.update("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        let err = h.sup.start("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));

        h.updater.gate.add_permits(1);
        first.await.unwrap().unwrap();
        assert_eq!(h.updater.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.updater.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(h.sup.status("Main").await.unwrap().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn update_refused_while_running() {
        let h = harness();
        h.sup.start("Main").await.unwrap();
        let err = h.sup.update("Main").await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        assert_eq!(h.updater.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn newer_build_is_installed_before_next_start() {
        let mut h = harness();
        assert!(h.sup.check_for_remote_version().await.unwrap());
        assert_eq!(h.store.last_version_token(), "100");
        assert!(h.sup.status("Main").await.unwrap().update_owed);
        assert!(!h.sup.check_for_remote_version().await.unwrap());

        h.sup.start("Main").await.unwrap();
        assert_eq!(h.updater.runs.load(Ordering::SeqCst), 1);
        next_event(&mut h.events, |e| matches!(e, LifecycleEvent::UpdateCompleted)).await;
        next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Started { .. })).await;

        let status = h.sup.status("Main").await.unwrap();
        assert!(!status.update_owed);
        assert_eq!(status.state, ServerState::Running);
    }

    #[tokio::test]
    async fn failed_version_query_keeps_token() {
        let h = harness();
        *h.store.token.lock().unwrap() = "42".to_string();
        *h.updater.token.lock().unwrap() = Err("bad json".to_string());

        let err = h.sup.check_for_remote_version().await.unwrap_err();
        assert_eq!(err.code(), "version_query_failed");
        assert_eq!(h.store.last_version_token(), "42");
        assert!(!h.sup.status("Main").await.unwrap().update_owed);
    }

    #[tokio::test]
    async fn update_discovers_nested_runtime() {
        let mut updater = FakeUpdater::open();
        updater.nest_runtime = true;
        let h = harness_with(updater, |root, _| {
            let install = root.join("fresh");
            std::fs::create_dir_all(&install).unwrap();
            vec![ServerDefinition::new("Fresh", install)]
        });

        h.sup.update("Fresh").await.unwrap();
        let def = h.sup.definition("Fresh").await.unwrap();
        let nested = def
            .install_path
            .join("steamapps/common/VRisingDedicatedServer");
        assert_eq!(def.external_runtime_path.as_deref(), Some(nested.as_path()));
        assert_eq!(
            *h.store.runtime_paths.lock().unwrap(),
            vec![("Fresh".to_string(), nested.clone())]
        );

        h.sup.start("Fresh").await.unwrap();
        let spec = h.launcher.launches.lock().unwrap()[0].clone();
        assert_eq!(spec.exec, nested.join(DEFAULT_SERVER_EXECUTABLE));
        assert_eq!(spec.cwd, nested);
    }

    #[tokio::test]
    async fn readiness_from_log_is_published() {
        let mut h = harness();
        h.sup.start("Main").await.unwrap();
        let def = h.sup.definition("Main").await.unwrap();
        assert_eq!(h.webhooks.recv().await.unwrap(), "starting");

        std::fs::write(
            log_file_path(&def),
            format!(
                "{}203.0.113.9\n{}1234\n{}\n",
                crate::log_tail::PUBLIC_IP_MARKER,
                crate::log_tail::STEAM_ID_MARKER,
                crate::log_tail::STREAMING_IDLE_MARKER
            ),
        )
        .unwrap();

        let ev = next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Ready { .. })).await;
        assert_eq!(
            ev,
            LifecycleEvent::Ready {
                ip: "203.0.113.9".to_string(),
                steam_id: "1234".to_string()
            }
        );
        assert_eq!(
            tokio::time::timeout(WAIT, h.webhooks.recv()).await.unwrap().unwrap(),
            "ready\nPublic IP: 203.0.113.9"
        );
    }

    struct FixedScanner(Vec<RunningProcess>);

    impl ProcessScanner for FixedScanner {
        fn scan(&self) -> Vec<RunningProcess> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn discovery_adopts_then_autostarts() {
        let h = harness_with(FakeUpdater::open(), |root, _| {
            let mut main = server(root, "Main");
            main.auto_start = true;
            let mut other = server(root, "Other");
            other.auto_start = true;
            vec![main, other, server(root, "Idle")]
        });
        let main = h.sup.definition("Main").await.unwrap();
        let scanner = FixedScanner(vec![RunningProcess {
            pid: 4242,
            exe: main.install_path.join(DEFAULT_SERVER_EXECUTABLE),
        }]);

        let report = h.sup.discover_and_autostart(&scanner).await;
        assert_eq!(report.adopted, vec!["Main".to_string()]);
        assert_eq!(report.started, vec!["Other".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(*h.launcher.attached.lock().unwrap(), vec![4242]);
        assert_eq!(h.launcher.launch_count(), 1);

        let statuses = h.sup.list().await;
        let names: Vec<_> = statuses.iter().map(|s| s.name.to_string()).collect();
        assert_eq!(names, vec!["Idle", "Main", "Other"]);
        assert_eq!(statuses[1].pid, Some(4242));
        assert_eq!(statuses[0].state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn remove_backs_up_saves_and_deletes_files() {
        let h = harness_with(FakeUpdater::open(), |root, _| vec![server(root, "My Server")]);
        let def = h.sup.definition("My Server").await.unwrap();

        h.sup.start("My Server").await.unwrap();
        let err = h
            .sup
            .remove_server("My Server", RemoveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
        h.sup.stop("My Server").await.unwrap();

        std::fs::write(save_data_dir(&def).join("Saves/v4/save.dat"), b"castle").unwrap();
        let backup = h
            .sup
            .remove_server(
                "My Server",
                RemoveOptions {
                    backup_saves: true,
                    delete_files: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backup, h.root.path().join("Backups").join("My_Server_Bak.zip"));
        assert!(backup.is_file());
        assert!(!def.install_path.exists());
        assert!(matches!(
            h.sup.status("My Server").await.unwrap_err(),
            SupervisorError::UnknownServer(_)
        ));
        assert_eq!(*h.store.registry.lock().unwrap(), vec!["-My Server".to_string()]);
    }

    #[tokio::test]
    async fn failed_file_removal_keeps_server_registered() {
        let h = harness_with(FakeUpdater::open(), |root, _| {
            let not_a_dir = root.join("install.txt");
            std::fs::write(&not_a_dir, b"").unwrap();
            vec![ServerDefinition::new("Broken", not_a_dir)]
        });

        let err = h
            .sup
            .remove_server(
                "Broken",
                RemoveOptions {
                    backup_saves: false,
                    delete_files: true,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "io_error");
        assert_eq!(
            h.sup.status("Broken").await.unwrap().state,
            ServerState::Stopped
        );
        assert!(h.store.registry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_server_rejects_duplicates() {
        let h = harness();
        let err = h
            .sup
            .add_server(ServerDefinition::new("Main", "/srv/other"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
        h.sup
            .add_server(ServerDefinition::new("Second", "/srv/second"))
            .await
            .unwrap();
        assert_eq!(h.sup.list().await.len(), 2);
        assert_eq!(*h.store.registry.lock().unwrap(), vec!["+Second".to_string()]);
    }

    #[tokio::test]
    async fn added_server_write_backs_reach_settings_file() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("castle.toml");
        let store = Arc::new(TomlSettingsStore::open(&path).unwrap());
        let launcher = Arc::new(FakeLauncher::default());
        let sup = Supervisor::new(
            config(root.path()),
            launcher.clone(),
            Arc::new(FakeUpdater::open()),
            store,
            Notifier::new(WebhookSettings::default(), None),
            Vec::new(),
        );
        let mut events = sup.subscribe();
        let on_disk = || TomlSettingsStore::open(&path).unwrap().snapshot().servers;

        sup.add_server(server(root.path(), "Added")).await.unwrap();
        assert_eq!(on_disk().len(), 1);
        assert!(on_disk()[0].auto_restart);

        sup.start("Added").await.unwrap();
        for n in 1..=3 {
            launcher.exit_latest(Some(1));
            next_event(&mut events, |e| matches!(e, LifecycleEvent::Restarting { .. })).await;
            let launcher = launcher.clone();
            wait_until(move || launcher.launch_count() == n + 1).await;
        }
        launcher.exit_latest(Some(1));
        next_event(&mut events, |e| matches!(e, LifecycleEvent::GivingUp { .. })).await;
        assert!(!on_disk()[0].auto_restart);

        sup.remove_server("Added", RemoveOptions::default())
            .await
            .unwrap();
        assert!(on_disk().is_empty());
    }

    #[tokio::test]
    async fn slow_launch_does_not_block_other_servers() {
        let h = harness_with(FakeUpdater::open(), |root, _| {
            vec![server(root, "A"), server(root, "B")]
        });
        let gate = h.launcher.gate_launch(0);
        let sup = h.sup.clone();
        let slow = tokio::spawn(async move { sup.start("A").await });
        let launcher = h.launcher.clone();
        wait_until(move || launcher.entered() == 1).await;

        let quick = Duration::from_secs(1);
        let b = tokio::time::timeout(quick, h.sup.status("B")).await.unwrap().unwrap();
        assert_eq!(b.state, ServerState::Stopped);
        let b = tokio::time::timeout(quick, h.sup.start("B")).await.unwrap().unwrap();
        assert_eq!(b.state, ServerState::Running);
        tokio::time::timeout(quick, h.sup.stop("B")).await.unwrap().unwrap();

        let err = h.sup.start("A").await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(_)));

        gate.add_permits(1);
        let a = slow.await.unwrap().unwrap();
        assert_eq!(a.state, ServerState::Running);
        assert_eq!(h.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn stop_during_launch_kills_new_process() {
        let h = harness();
        let gate = h.launcher.gate_launch(0);
        let sup = h.sup.clone();
        let start = tokio::spawn(async move { sup.start("Main").await });
        let launcher = h.launcher.clone();
        wait_until(move || launcher.entered() == 1).await;

        h.sup.stop("Main").await.unwrap();
        gate.add_permits(1);
        let status = start.await.unwrap().unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        assert!(h.launcher.was_killed(0));
        assert!(h.sup.status("Main").await.unwrap().pid.is_none());

        let again = h.sup.start("Main").await.unwrap();
        assert_eq!(again.state, ServerState::Running);
        assert_eq!(h.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn stop_wins_over_owed_update() {
        let h = harness_with(FakeUpdater::with_gate(0), |root, _| vec![server(root, "Main")]);
        assert!(h.sup.check_for_remote_version().await.unwrap());

        let sup = h.sup.clone();
        let start = tokio::spawn(async move { sup.start("Main").await });
        let updater = h.updater.clone();
        wait_until(move || updater.runs.load(Ordering::SeqCst) == 1).await;

        h.sup.stop("Main").await.unwrap();
        h.updater.gate.add_permits(1);
        let status = start.await.unwrap().unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        assert!(!status.update_owed);
        assert!(status.user_requested_stop);
        assert_eq!(h.launcher.entered(), 0);
    }

    #[tokio::test]
    async fn stop_wins_over_pending_restart() {
        let mut h = harness();
        let gate = h.launcher.gate_launch(1);
        h.sup.start("Main").await.unwrap();

        h.launcher.exit_latest(Some(1));
        next_event(&mut h.events, |e| matches!(e, LifecycleEvent::Restarting { .. })).await;
        let launcher = h.launcher.clone();
        wait_until(move || launcher.entered() == 2).await;

        h.sup.stop("Main").await.unwrap();
        gate.add_permits(1);
        let launcher = h.launcher.clone();
        wait_until(move || launcher.was_killed(1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = h.sup.status("Main").await.unwrap();
        assert_eq!(status.state, ServerState::Stopped);
        assert!(status.pid.is_none());
        assert!(status.user_requested_stop);
        assert_eq!(h.launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn restart_survives_unreachable_rcon() {
        let h = harness();
        h.sup.start("Main").await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        {
            let mut servers = h.sup.inner.servers.lock().await;
            servers.get_mut("Main").unwrap().def.rcon.port = port;
        }

        let status = h
            .sup
            .restart(
                "Main",
                Some(RestartWarning {
                    minutes: 5,
                    lead_time: Duration::from_millis(10),
                }),
            )
            .await
            .unwrap();
        assert_eq!(status.state, ServerState::Running);
        assert_eq!(h.launcher.launch_count(), 2);
    }
}

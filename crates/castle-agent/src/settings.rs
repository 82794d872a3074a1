use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;

pub const DEFAULT_APP_ID: u32 = 1829350;
pub const DEFAULT_SERVER_EXECUTABLE: &str = "VRisingServer.exe";
pub const DEFAULT_PORT_CONFLICT_EXIT_CODE: i32 = -2147483645;
pub const DEFAULT_VERSION_ENDPOINT: &str = "https://api.steamcmd.net/v1/info";

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: AppSettings,
    pub webhook: WebhookSettings,
    pub servers: Vec<ServerDefinition>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub data_root: PathBuf,
    /// Where the updater tool lives. Defaults to `<data_root>/SteamCMD`.
    pub steamcmd_dir: Option<PathBuf>,
    /// Overrides the platform default updater archive.
    pub steamcmd_archive_url: Option<String>,
    pub app_id: u32,
    pub server_executable: String,
    pub port_conflict_exit_code: i32,
    pub version_endpoint: String,
    /// Timestamp token of the last remote build we saw.
    pub last_update_token: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            steamcmd_dir: None,
            steamcmd_archive_url: None,
            app_id: DEFAULT_APP_ID,
            server_executable: DEFAULT_SERVER_EXECUTABLE.to_string(),
            port_conflict_exit_code: DEFAULT_PORT_CONFLICT_EXIT_CODE,
            version_endpoint: DEFAULT_VERSION_ENDPOINT.to_string(),
            last_update_token: String::new(),
        }
    }
}

impl AppSettings {
    pub fn steamcmd_dir(&self) -> PathBuf {
        self.steamcmd_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("SteamCMD"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("Backups")
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerDefinition {
    pub name: String,
    pub install_path: PathBuf,
    /// Directory holding a pre-installed server binary set (e.g. a Steam library).
    pub external_runtime_path: Option<PathBuf>,
    pub launch: LaunchOptions,
    pub rcon: RconEndpoint,
    pub webhook: WebhookTemplates,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub verify_on_update: bool,
}

impl Default for ServerDefinition {
    fn default() -> Self {
        Self {
            name: "My V Rising Server".to_string(),
            install_path: PathBuf::new(),
            external_runtime_path: None,
            launch: LaunchOptions::default(),
            rcon: RconEndpoint::default(),
            webhook: WebhookTemplates::default(),
            auto_start: false,
            auto_restart: false,
            verify_on_update: true,
        }
    }
}

impl ServerDefinition {
    pub fn new(name: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            install_path: install_path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    pub world_name: String,
    pub display_name: String,
    pub bind_to_ip: bool,
    pub binding_ip: String,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            world_name: "world1".to_string(),
            display_name: "V Rising Server".to_string(),
            bind_to_ip: false,
            binding_ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RconEndpoint {
    pub address: String,
    pub port: u16,
    pub password: String,
}

impl Default for RconEndpoint {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 25575,
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WebhookTemplates {
    pub enabled: bool,
    pub start_server: String,
    pub stop_server: String,
    pub server_crash: String,
    pub attempt_start3: String,
    pub server_ready: String,
    pub broadcast_ip: bool,
    pub broadcast_steam_id: bool,
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = BTreeSet::new();
        for s in &self.servers {
            if s.name.trim().is_empty() {
                anyhow::bail!("server name must be non-empty");
            }
            if !seen.insert(s.name.as_str()) {
                anyhow::bail!("duplicate server name: {}", s.name);
            }
            if s.install_path.as_os_str().is_empty() {
                anyhow::bail!("server {} has no install_path", s.name);
            }
            if s.launch.bind_to_ip && s.launch.binding_ip.trim().is_empty() {
                anyhow::bail!("server {} binds to an address but binding_ip is empty", s.name);
            }
        }
        if self.app.server_executable.trim().is_empty() {
            anyhow::bail!("app.server_executable must be non-empty");
        }
        Ok(())
    }

    pub fn server_mut(&mut self, name: &str) -> Option<&mut ServerDefinition> {
        self.servers.iter_mut().find(|s| s.name == name)
    }
}

/// Write-back port for the few fields the supervisor is allowed to change.
pub trait SettingsStore: Send + Sync {
    fn add_server(&self, def: &ServerDefinition) -> anyhow::Result<()>;
    fn remove_server(&self, server: &str) -> anyhow::Result<()>;
    fn set_auto_restart(&self, server: &str, enabled: bool) -> anyhow::Result<()>;
    fn set_runtime_path(&self, server: &str, path: &Path) -> anyhow::Result<()>;
    fn last_version_token(&self) -> String;
    fn set_last_version_token(&self, token: &str) -> anyhow::Result<()>;
}

/// Settings persisted as TOML, rewritten atomically on every change.
#[derive(Debug)]
pub struct TomlSettingsStore {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl TomlSettingsStore {
    /// Loads `path`, writing defaults first if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            toml::from_str::<Settings>(&raw)
                .with_context(|| format!("parse {}", path.display()))?
        } else {
            let settings = Settings::default();
            write_settings(&path, &settings)?;
            settings
        };
        settings.validate()?;

        Ok(Self {
            path,
            settings: Mutex::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Settings) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut guard = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        f(&mut next)?;
        write_settings(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

impl SettingsStore for TomlSettingsStore {
    fn add_server(&self, def: &ServerDefinition) -> anyhow::Result<()> {
        self.update(|s| {
            s.servers.push(def.clone());
            s.validate()
        })
    }

    fn remove_server(&self, server: &str) -> anyhow::Result<()> {
        self.update(|s| {
            let before = s.servers.len();
            s.servers.retain(|d| d.name != server);
            if s.servers.len() == before {
                anyhow::bail!("unknown server: {server}");
            }
            Ok(())
        })
    }

    fn set_auto_restart(&self, server: &str, enabled: bool) -> anyhow::Result<()> {
        self.update(|s| {
            let def = s
                .server_mut(server)
                .ok_or_else(|| anyhow::anyhow!("unknown server: {server}"))?;
            def.auto_restart = enabled;
            Ok(())
        })
    }

    fn set_runtime_path(&self, server: &str, path: &Path) -> anyhow::Result<()> {
        self.update(|s| {
            let def = s
                .server_mut(server)
                .ok_or_else(|| anyhow::anyhow!("unknown server: {server}"))?;
            def.external_runtime_path = Some(path.to_path_buf());
            Ok(())
        })
    }

    fn last_version_token(&self) -> String {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .app
            .last_update_token
            .clone()
    }

    fn set_last_version_token(&self, token: &str) -> anyhow::Result<()> {
        self.update(|s| {
            s.app.last_update_token = token.to_string();
            Ok(())
        })
    }
}

fn write_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("create settings dir")?;
    }
    let data = toml::to_string_pretty(settings).context("serialize settings")?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, data.as_bytes())
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

use std::path::{Path, PathBuf};

use crate::settings::ServerDefinition;

const LOG_FILE_NAME: &str = "VRisingServer.log";

/// Everything the launcher needs to start one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exec: PathBuf,
    pub args: Vec<String>,
    /// The same arguments rendered as one command line, quoting included.
    pub command_line: String,
    pub cwd: PathBuf,
}

pub fn save_data_dir(def: &ServerDefinition) -> PathBuf {
    def.install_path.join("SaveData")
}

pub fn log_file_path(def: &ServerDefinition) -> PathBuf {
    def.install_path.join("logs").join(LOG_FILE_NAME)
}

/// Candidate executable locations, in lookup order.
pub fn executable_candidates(def: &ServerDefinition, executable: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(rt) = def
        .external_runtime_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        out.push(rt.join(executable));
    }
    out.push(def.install_path.join(executable));
    out
}

pub fn resolve_executable(def: &ServerDefinition, executable: &str) -> Result<PathBuf, Vec<PathBuf>> {
    let candidates = executable_candidates(def, executable);
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or(candidates)
}

/// Server arguments in their fixed order: data path, display name, save
/// name, log file and, only when binding is enabled, the address.
pub fn launch_arguments(def: &ServerDefinition) -> Vec<(&'static str, String)> {
    let mut args = vec![
        (
            "-persistentDataPath",
            save_data_dir(def).display().to_string(),
        ),
        ("-serverName", def.launch.display_name.clone()),
        ("-saveName", def.launch.world_name.clone()),
        ("-logFile", log_file_path(def).display().to_string()),
    ];
    if def.launch.bind_to_ip {
        args.push(("-address", def.launch.binding_ip.clone()));
    }
    args
}

pub fn render_command_line(args: &[(&'static str, String)]) -> String {
    args.iter()
        .map(|(flag, value)| format!("{flag} \"{value}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn build_launch_spec(def: &ServerDefinition, exec: PathBuf) -> LaunchSpec {
    let pairs = launch_arguments(def);
    let command_line = render_command_line(&pairs);
    let args = pairs
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value])
        .collect();
    let cwd = exec
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| def.install_path.clone());

    LaunchSpec {
        exec,
        args,
        command_line,
        cwd,
    }
}

/// Creates the data and log directories the server expects to exist.
pub fn ensure_server_layout(def: &ServerDefinition) -> std::io::Result<()> {
    let save = save_data_dir(def);
    for dir in [
        save.clone(),
        save.join("Settings"),
        save.join("Saves").join("v4"),
        def.install_path.join("logs"),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Looks for the server binary below an install directory when it is not at
/// the root (SteamCMD sometimes nests it under `steamapps/common`).
pub fn find_nested_runtime_dir(install_dir: &Path, executable: &str) -> Option<PathBuf> {
    fn walk(cur: &Path, depth: usize, executable: &str, out: &mut Vec<PathBuf>) {
        if depth == 0 {
            return;
        }
        let rd = match std::fs::read_dir(cur) {
            Ok(v) => v,
            Err(_) => return,
        };
        for e in rd.flatten() {
            let p = e.path();
            let ty = match e.file_type() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if ty.is_dir() {
                if let Some(name) = p.file_name().and_then(|s| s.to_str()) {
                    if matches!(name, "SaveData" | "logs" | "Logs") {
                        continue;
                    }
                }
                walk(&p, depth - 1, executable, out);
                continue;
            }
            if ty.is_file()
                && p.file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(executable))
                && let Some(parent) = p.parent()
            {
                out.push(parent.to_path_buf());
            }
        }
    }

    if install_dir.join(executable).is_file() {
        return None;
    }

    let mut hits = Vec::<PathBuf>::new();
    let alt = install_dir.join("steamapps").join("common");
    if alt.is_dir() {
        walk(&alt, 3, executable, &mut hits);
    }
    if hits.is_empty() {
        walk(install_dir, 4, executable, &mut hits);
    }

    hits.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    hits.into_iter().next()
}

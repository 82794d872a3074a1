use std::path::{Path, PathBuf};

use sysinfo::{ProcessesToUpdate, System};

use crate::{launch::executable_candidates, settings::ServerDefinition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub pid: u32,
    pub exe: PathBuf,
}

/// Lists processes that might be servers we should re-adopt.
pub trait ProcessScanner: Send + Sync {
    fn scan(&self) -> Vec<RunningProcess>;
}

/// Scans the OS process table, keeping only processes whose executable file
/// name matches the server binary.
#[derive(Debug, Clone)]
pub struct SysinfoScanner {
    executable_name: String,
}

impl SysinfoScanner {
    pub fn new(executable_name: impl Into<String>) -> Self {
        Self {
            executable_name: executable_name.into(),
        }
    }
}

impl ProcessScanner for SysinfoScanner {
    fn scan(&self) -> Vec<RunningProcess> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut out = system
            .processes()
            .iter()
            .filter_map(|(pid, p)| {
                let exe = p.exe()?;
                let name = exe.file_name()?.to_str()?;
                name.eq_ignore_ascii_case(&self.executable_name)
                    .then(|| RunningProcess {
                        pid: pid.as_u32(),
                        exe: exe.to_path_buf(),
                    })
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|p| p.pid);
        out
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Picks the running process whose executable is one of the definition's
/// candidate binaries. Pids in `taken` are skipped.
pub fn match_definition(
    def: &ServerDefinition,
    executable: &str,
    running: &[RunningProcess],
    taken: &[u32],
) -> Option<u32> {
    let candidates = executable_candidates(def, executable);
    running
        .iter()
        .filter(|p| !taken.contains(&p.pid))
        .find(|p| candidates.iter().any(|c| same_file(&p.exe, c)))
        .map(|p| p.pid)
}

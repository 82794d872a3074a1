use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::watch,
};

use crate::support::format_error_chain;

pub const PUBLIC_IP_MARKER: &str = "SteamPlatformSystem - OnPolicyResponse - Public IP: ";
pub const STEAM_ID_MARKER: &str =
    "SteamNetworking - Successfully logged in with the SteamGameServer API. SteamID: ";
/// Emitted once the asset streamer goes idle, which in practice is the last
/// line of a normal boot.
pub const STREAMING_IDLE_MARKER: &str = "Shutting down Asynchronous Streaming";

const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ip: String,
    pub steam_id: String,
}

/// Three independent predicates, evaluated per line.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    ip: Option<String>,
    steam_id: Option<String>,
    streaming_idle: bool,
}

impl ReadinessTracker {
    /// Feeds one line. Returns true once every marker has been seen.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.ip.is_none()
            && let Some(v) = value_after(line, PUBLIC_IP_MARKER)
        {
            self.ip = Some(v);
        }
        if self.steam_id.is_none()
            && let Some(v) = value_after(line, STEAM_ID_MARKER)
        {
            self.steam_id = Some(v);
        }
        if line.contains(STREAMING_IDLE_MARKER) {
            self.streaming_idle = true;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.ip.is_some() && self.steam_id.is_some() && self.streaming_idle
    }

    pub fn result(&self) -> Option<Readiness> {
        if !self.streaming_idle {
            return None;
        }
        Some(Readiness {
            ip: self.ip.clone()?,
            steam_id: self.steam_id.clone()?,
        })
    }
}

fn value_after(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    Some(line[idx + marker.len()..].trim().to_string())
}

/// Follows a file that another process keeps appending to.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    pos: u64,
    identity: Option<FileId>,
    partial: Vec<u8>,
}

type FileId = (u64, u64);

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(meta: &std::fs::Metadata) -> Option<FileId> {
    let created = meta
        .created()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?;
    Some((created.as_secs(), u64::from(created.subsec_nanos())))
}

impl LogTail {
    /// Positions the cursor at the current end of the file so existing
    /// history is skipped. A missing file is read from the start once it
    /// appears.
    pub fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let meta = std::fs::metadata(&path).ok();
        Self {
            pos: meta.as_ref().map_or(0, |m| m.len()),
            identity: meta.as_ref().and_then(file_identity),
            path,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the complete lines appended since the last call.
    pub async fn read_new_lines(&mut self) -> anyhow::Result<Vec<String>> {
        let mut f = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let meta = f.metadata().await?;
        let len = meta.len();
        let identity = file_identity(&meta);
        let replaced = self.identity.is_some() && identity != self.identity;
        if replaced || len < self.pos {
            // Recreated or truncated by the server.
            self.pos = 0;
            self.partial.clear();
        }
        self.identity = identity;
        if len == self.pos {
            return Ok(Vec::new());
        }

        f.seek(SeekFrom::Start(self.pos)).await?;
        let mut buf = Vec::new();
        let n = f.take(MAX_READ_PER_POLL).read_to_end(&mut buf).await?;
        self.pos += n as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(i) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=i).collect();
            let line = String::from_utf8_lossy(&raw);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        Ok(lines)
    }
}

/// Tails `tail` until every readiness marker is seen or `alive` turns false.
/// Returns `None` unless all three markers were observed.
pub async fn watch_readiness(
    mut tail: LogTail,
    mut alive: watch::Receiver<bool>,
    poll: Duration,
) -> Option<Readiness> {
    let mut tracker = ReadinessTracker::default();
    loop {
        if !*alive.borrow_and_update() {
            return None;
        }

        match tail.read_new_lines().await {
            Ok(lines) => {
                for line in lines {
                    if tracker.observe(&line) {
                        return tracker.result();
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    path = %tail.path().display(),
                    error = %format_error_chain(&err),
                    "log tail read failed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = alive.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

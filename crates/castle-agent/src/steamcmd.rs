use std::path::{Path, PathBuf};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::{io::AsyncReadExt, process::Command, sync::Mutex};

use crate::{
    archive,
    error::SupervisorError,
    settings::{AppSettings, ServerDefinition},
};

pub const SCRIPT_FILE_NAME: &str = "steamcmd.txt";

#[cfg(windows)]
const DEFAULT_ARCHIVE_URL: &str = "https://steamcdn-a.akamaihd.net/client/installer/steamcmd.zip";
#[cfg(not(windows))]
const DEFAULT_ARCHIVE_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz";

#[cfg(windows)]
const EXECUTABLE_NAME: &str = "steamcmd.exe";
#[cfg(not(windows))]
const EXECUTABLE_NAME: &str = "steamcmd.sh";

const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;
const TAIL_BYTES: usize = 64 * 1024;

/// Runs install/update jobs for a server and reports the latest remote build.
#[async_trait::async_trait]
pub trait Updater: Send + Sync {
    async fn run_update(&self, def: &ServerDefinition, validate: bool) -> Result<(), SupervisorError>;

    /// Opaque token identifying the newest public build.
    async fn latest_build_token(&self) -> Result<String, SupervisorError>;
}

/// The four-line script handed to the updater via `+runscript`.
pub fn install_script(install_dir: &Path, app_id: u32, validate: bool) -> String {
    let validate = if validate { " validate" } else { "" };
    format!(
        "force_install_dir \"{}\"\nlogin anonymous\napp_update {app_id}{validate}\nquit\n",
        install_dir.display()
    )
}

pub async fn write_install_script(install_dir: &Path, script: &str) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(install_dir)
        .await
        .with_context(|| format!("create {}", install_dir.display()))?;
    let path = install_dir.join(SCRIPT_FILE_NAME);
    tokio::fs::write(&path, script.as_bytes())
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Pulls `data.<app_id>.depots.branches.public.timeupdated` out of a
/// version-metadata response.
pub fn parse_version_token(body: &serde_json::Value, app_id: u32) -> anyhow::Result<String> {
    let v = body
        .get("data")
        .and_then(|d| d.get(app_id.to_string()))
        .and_then(|a| a.get("depots"))
        .and_then(|d| d.get("branches"))
        .and_then(|b| b.get("public"))
        .and_then(|p| p.get("timeupdated"))
        .ok_or_else(|| anyhow::anyhow!("response has no public build timestamp"))?;
    let token = match v {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => anyhow::bail!("unexpected timestamp value: {other}"),
    };
    if token.is_empty() {
        anyhow::bail!("empty public build timestamp");
    }
    Ok(token)
}

#[derive(Debug)]
pub struct SteamCmd {
    dir: PathBuf,
    archive_url: String,
    version_endpoint: String,
    app_id: u32,
    client: reqwest::Client,
    fetch_lock: Mutex<()>,
}

impl SteamCmd {
    pub fn new(app: &AppSettings, client: reqwest::Client) -> Self {
        Self {
            dir: app.steamcmd_dir(),
            archive_url: app
                .steamcmd_archive_url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
            version_endpoint: app.version_endpoint.trim_end_matches('/').to_string(),
            app_id: app.app_id,
            client,
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn executable_path(&self) -> PathBuf {
        self.dir.join(EXECUTABLE_NAME)
    }

    /// Downloads and unpacks the updater if it is not installed yet.
    pub async fn ensure_present(&self) -> anyhow::Result<PathBuf> {
        let exe = self.executable_path();
        if exe.is_file() {
            return Ok(exe);
        }

        let _guard = self.fetch_lock.lock().await;
        if exe.is_file() {
            return Ok(exe);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))?;
        let file_name = self
            .archive_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("steamcmd-archive");
        let archive_path = self.dir.join(file_name);

        tracing::info!(url = %self.archive_url, dir = %self.dir.display(), "fetching steamcmd");
        self.download_to_path(&self.archive_url, &archive_path)
            .await
            .context("download steamcmd")?;

        let extracted = self.extract(&archive_path).await;
        let _ = tokio::fs::remove_file(&archive_path).await;
        extracted.context("extract steamcmd")?;

        if !exe.is_file() {
            anyhow::bail!("{} not found after extract", exe.display());
        }
        Ok(exe)
    }

    async fn download_to_path(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url} (status)"))?;

        let tmp = path.with_extension("part");
        let mut f = tokio::fs::File::create(&tmp).await?;
        let mut total: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total = total.saturating_add(chunk.len() as u64);
            if total > MAX_ARCHIVE_BYTES {
                drop(f);
                let _ = tokio::fs::remove_file(&tmp).await;
                anyhow::bail!("download too large");
            }
            tokio::io::AsyncWriteExt::write_all(&mut f, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut f).await.ok();
        drop(f);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn extract(&self, archive_path: &Path) -> anyhow::Result<()> {
        let is_zip = archive_path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("zip"));
        if is_zip {
            let src = archive_path.to_path_buf();
            let dest = self.dir.clone();
            return tokio::task::spawn_blocking(move || archive::extract_zip_safely(&src, &dest))
                .await
                .context("join zip extract")?;
        }

        let status = Command::new("tar")
            .arg("-xzf")
            .arg(archive_path)
            .arg("-C")
            .arg(&self.dir)
            .status()
            .await
            .context("run tar")?;
        if !status.success() {
            anyhow::bail!("tar exited with {status}");
        }
        Ok(())
    }

    async fn run_script(&self, exe: &Path, script: &Path) -> anyhow::Result<()> {
        let mut cmd = Command::new(exe);
        cmd.current_dir(&self.dir)
            .arg("+runscript")
            .arg(script)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("spawn steamcmd")?;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_tail(s, TAIL_BYTES)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s, TAIL_BYTES)));

        let status = child.wait().await.context("wait steamcmd")?;
        let stdout_tail = match stdout_task {
            Some(h) => h.await.context("join steamcmd stdout")??,
            None => Vec::new(),
        };
        let stderr_tail = match stderr_task {
            Some(h) => h.await.context("join steamcmd stderr")??,
            None => Vec::new(),
        };
        let stdout = String::from_utf8_lossy(&stdout_tail);

        // steamcmd can exit non-zero after a self-update even though the app
        // install went through.
        let installed = stdout.contains(&format!("Success! App '{}'", self.app_id));
        if !status.success() && !installed {
            let stderr = String::from_utf8_lossy(&stderr_tail);
            anyhow::bail!(
                "steamcmd failed (exit {}):\nstdout:\n{}\nstderr:\n{}",
                status,
                stdout.trim_end(),
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Updater for SteamCmd {
    async fn run_update(&self, def: &ServerDefinition, validate: bool) -> Result<(), SupervisorError> {
        let exe = self
            .ensure_present()
            .await
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::UpdaterFetchFailed, &e))?;

        let script = install_script(&def.install_path, self.app_id, validate);
        let script_path = write_install_script(&def.install_path, &script)
            .await
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::ScriptWriteFailed, &e))?;

        tracing::info!(
            server = %def.name,
            dir = %def.install_path.display(),
            validate,
            "running steamcmd"
        );
        self.run_script(&exe, &script_path)
            .await
            .map_err(|e| SupervisorError::from_anyhow(SupervisorError::UpdateFailed, &e))
    }

    async fn latest_build_token(&self) -> Result<String, SupervisorError> {
        let url = format!("{}/{}", self.version_endpoint, self.app_id);
        let res = async {
            let body: serde_json::Value = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("query {url}"))?
                .error_for_status()
                .with_context(|| format!("query {url} (status)"))?
                .json()
                .await
                .context("decode version response")?;
            parse_version_token(&body, self.app_id)
        }
        .await;
        res.map_err(|e| SupervisorError::from_anyhow(SupervisorError::VersionQueryFailed, &e))
    }
}

struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.cap {
            let drop = self.buf.len() - self.cap;
            self.buf.drain(..drop);
        }
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

async fn read_tail<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    limit_bytes: usize,
) -> anyhow::Result<Vec<u8>> {
    let mut tail = TailBuffer::new(limit_bytes);
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tail.push(&buf[..n]);
    }
    Ok(tail.into_vec())
}

//! Minimal Source-style RCON client.
//!
//! Packets are `size:i32le | id:i32le | type:i32le | body | 0x00 0x00`, where
//! `size` counts everything after itself. The client is strictly one command
//! at a time; log lines the server pushes unprompted surface as events.

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};

use crate::settings::RconEndpoint;

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

pub const AUTH_SUCCESS: &str = "Authentication success.";
pub const AUTH_FAILED: &str = "Authentication failed.";

const MAX_PACKET_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

pub fn encode_packet(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let size = (4 + 4 + body.len() + 2) as i32;
    let mut out = Vec::with_capacity(size as usize + 4);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Packet> {
    let size = r.read_i32_le().await?;
    if size < 10 || size as usize > MAX_PACKET_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid rcon packet size: {size}"),
        ));
    }
    let mut buf = vec![0u8; size as usize];
    r.read_exact(&mut buf).await?;

    let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body = &buf[8..];
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    Ok(Packet {
        id,
        kind,
        body: String::from_utf8_lossy(&body[..end]).into_owned(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RconEvent {
    State(ConnectionState),
    /// Text pushed by the server, including the authentication verdict.
    Log(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("rcon connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("rcon is not connected")]
    NotConnected,
    #[error("an rcon command is already in flight")]
    CommandInFlight,
    #[error("rcon io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct Pending {
    auth_id: Option<i32>,
    command: Option<(i32, oneshot::Sender<String>)>,
    authenticated: bool,
}

#[derive(Default)]
struct Shared {
    pending: StdMutex<Pending>,
    connected: AtomicBool,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, packet: Packet, events: &mpsc::UnboundedSender<RconEvent>) {
        let mut p = self.pending();
        if packet.kind == SERVERDATA_AUTH_RESPONSE && p.auth_id.is_some() {
            let ok = packet.id != -1 && p.auth_id == Some(packet.id);
            p.auth_id = None;
            p.authenticated = ok;
            let _ = events.send(RconEvent::Log(
                if ok { AUTH_SUCCESS } else { AUTH_FAILED }.to_string(),
            ));
            return;
        }

        if packet.kind == SERVERDATA_RESPONSE_VALUE
            && p.command.as_ref().is_some_and(|(id, _)| *id == packet.id)
            && let Some((_, tx)) = p.command.take()
        {
            let _ = tx.send(packet.body);
            return;
        }

        if !packet.body.is_empty() {
            let _ = events.send(RconEvent::Log(packet.body));
        }
    }

    fn mark_disconnected(&self, events: &mpsc::UnboundedSender<RconEvent>) {
        {
            let mut p = self.pending();
            p.auth_id = None;
            p.command = None;
            p.authenticated = false;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = events.send(RconEvent::State(ConnectionState::Disconnected));
        }
    }
}

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub struct RconClient {
    events: mpsc::UnboundedSender<RconEvent>,
    conn: Mutex<Option<Connection>>,
    shared: Arc<Shared>,
    next_id: AtomicI32,
}

impl RconClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RconEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: tx,
                conn: Mutex::new(None),
                shared: Arc::new(Shared::default()),
                next_id: AtomicI32::new(1),
            },
            rx,
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.pending().authenticated
    }

    pub async fn connect(&self, address: &str, port: u16, timeout: Duration) -> Result<(), RconError> {
        self.disconnect().await;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                let _ = self.events.send(RconEvent::State(ConnectionState::Failed));
                return Err(RconError::Connect(e));
            }
            Err(_) => {
                let _ = self.events.send(RconEvent::State(ConnectionState::Failed));
                return Err(RconError::Connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out after {}ms", timeout.as_millis()),
                )));
            }
        };
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();

        self.shared.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(rd, self.shared.clone(), self.events.clone()));
        *self.conn.lock().await = Some(Connection { writer: wr, reader });
        let _ = self.events.send(RconEvent::State(ConnectionState::Connected));
        Ok(())
    }

    /// Sends the auth packet. The verdict arrives as an [`RconEvent::Log`].
    pub async fn authenticate(&self, password: &str) -> Result<(), RconError> {
        let id = self.allocate_id();
        self.shared.pending().auth_id = Some(id);
        self.write(id, SERVERDATA_AUTH, password).await
    }

    /// Queues a single command; the reply is delivered on the returned channel.
    pub async fn send_command(&self, text: &str) -> Result<oneshot::Receiver<String>, RconError> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut p = self.shared.pending();
            if p.command.as_ref().is_some_and(|(_, tx)| !tx.is_closed()) {
                return Err(RconError::CommandInFlight);
            }
            p.command = Some((id, tx));
        }
        if let Err(e) = self.write(id, SERVERDATA_EXECCOMMAND, text).await {
            self.shared.pending().command = None;
            return Err(e);
        }
        Ok(rx)
    }

    /// Closes the connection. Safe to call repeatedly or before connecting.
    pub async fn disconnect(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(mut c) = conn {
            let _ = c.writer.shutdown().await;
            c.reader.abort();
        }
        self.shared.mark_disconnected(&self.events);
    }

    fn allocate_id(&self) -> i32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id <= 0 {
            self.next_id.store(2, Ordering::SeqCst);
            return 1;
        }
        id
    }

    async fn write(&self, id: i32, kind: i32, body: &str) -> Result<(), RconError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(RconError::NotConnected)?;
        conn.writer.write_all(&encode_packet(id, kind, body)).await?;
        conn.writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    mut rd: OwnedReadHalf,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<RconEvent>,
) {
    loop {
        match read_packet(&mut rd).await {
            Ok(packet) => shared.dispatch(packet, &events),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    tracing::debug!(error = %e, "rcon read loop ended");
                }
                break;
            }
        }
    }
    shared.mark_disconnected(&events);
}

/// Connects, authenticates, sends one `announcerestart` command and holds
/// the connection briefly before disconnecting.
pub async fn broadcast_restart_warning(
    endpoint: &RconEndpoint,
    minutes: u32,
    timeout: Duration,
    hold: Duration,
) -> anyhow::Result<()> {
    let (client, mut events) = RconClient::new();
    let res = async {
        client
            .connect(&endpoint.address, endpoint.port, timeout)
            .await
            .context("connect rcon")?;
        client
            .authenticate(&endpoint.password)
            .await
            .context("send rcon auth")?;
        wait_for_auth(&mut events, timeout).await?;

        let reply = client
            .send_command(&format!("announcerestart {minutes}"))
            .await
            .context("send announcerestart")?;
        if let Ok(Ok(text)) = tokio::time::timeout(hold, reply).await
            && !text.trim().is_empty()
        {
            tracing::debug!(reply = %text.trim(), "rcon replied");
        }
        anyhow::Ok(())
    }
    .await;

    client.disconnect().await;
    res
}

async fn wait_for_auth(
    events: &mut mpsc::UnboundedReceiver<RconEvent>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let ev = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("rcon authentication timed out"))?;
        match ev {
            Some(RconEvent::Log(line)) if line == AUTH_SUCCESS => return Ok(()),
            Some(RconEvent::Log(line)) if line == AUTH_FAILED => {
                anyhow::bail!("rcon authentication rejected")
            }
            Some(RconEvent::State(ConnectionState::Disconnected | ConnectionState::Failed)) => {
                anyhow::bail!("rcon connection closed before authentication")
            }
            Some(_) => continue,
            None => anyhow::bail!("rcon event stream closed"),
        }
    }
}

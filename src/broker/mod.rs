//! The broker: listener setup, per-connection tasks, and the shared
//! client table they dispatch through.

pub mod client;
pub mod connection;
pub mod router;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde_json::json;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::envelope::{Envelope, EnvelopeType};
use crate::frame::{self, Compression};
use crate::{command, event, CloseReason, BUFFER_CHUNK, DEFAULT_QUEUE_SIZE, DEFAULT_RUN_TIMEOUT_MS};

pub use client::BrokerClient;
pub use connection::Connection;
pub use router::BrokerDb;

/// Owns the shared routing table and serves as the handle `mbusd` (or an
/// embedding application) holds to start listeners and request shutdown.
///
/// Cheap to clone: every clone shares the same routing table, so a signal
/// handler task can hold one alongside the task driving `run_until_shutdown`.
#[derive(Clone)]
pub struct Broker {
    db: Arc<BrokerDb>,
    queue_size: usize,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            db: Arc::new(BrokerDb::new(None, 16 * 1024 * 1024)),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }

    pub fn set_password(mut self, password: Option<String>) -> Self {
        let max = self.db.max_buffer_size;
        self.db = Arc::new(BrokerDb::new(password, max));
        self
    }

    pub fn set_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn set_max_buffer_size(mut self, size: usize) -> Self {
        let password = self.db.password.clone();
        self.db = Arc::new(BrokerDb::new(password, size));
        self
    }

    pub fn shutdown_requested(&self) -> bool {
        self.db.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.db.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn connected_count(&self) -> usize {
        self.db.clients.read().unwrap().len()
    }

    /// Binds a TCP listener and spawns its accept loop. Returns immediately;
    /// the loop runs on its own task for as long as the broker lives.
    pub async fn spawn_tcp_server(&self, addr: &str) -> Result<(), crate::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on tcp {addr}");
        self.db.register_listener(format!("tcp://{addr}"));
        let db = self.db.clone();
        let queue_size = self.queue_size;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let db = db.clone();
                        let address = Some(peer.to_string());
                        tokio::spawn(handle_connection(db, stream, address, queue_size));
                    }
                    Err(e) => {
                        error!("tcp accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Binds a Unix domain socket listener and spawns its accept loop.
    #[cfg(unix)]
    pub async fn spawn_unix_server(&self, path: &str) -> Result<(), crate::Error> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        info!("listening on unix {path}");
        self.db.register_listener(format!("unix://{path}"));
        let db = self.db.clone();
        let queue_size = self.queue_size;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let db = db.clone();
                        tokio::spawn(handle_connection(db, stream, None, queue_size));
                    }
                    Err(e) => {
                        error!("unix accept failed: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Blocks, sleeping in `DEFAULT_RUN_TIMEOUT_MS`-sized slices, until
    /// `request_shutdown` (or an inbound `command.close` targeting the
    /// broker itself) sets the shutdown flag.
    pub async fn run_until_shutdown(&self) {
        while !self.shutdown_requested() {
            tokio::time::sleep(Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS)).await;
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// How often a connection re-checks its keepalive state. Finer than the
/// negotiated interval so a missed threshold is noticed promptly rather
/// than only on the next full interval boundary.
fn sweep_period(interval: Duration) -> Duration {
    (interval / 4).max(Duration::from_millis(250))
}

async fn handle_connection<S>(db: Arc<BrokerDb>, stream: S, address: Option<String>, queue_size: usize)
where
    S: Connection + 'static,
{
    let (mut reader, mut writer) = split(stream);
    let mut inbound = Vec::with_capacity(BUFFER_CHUNK);
    let mut chunk = vec![0u8; BUFFER_CHUNK];

    let (tx, rx) = async_channel::bounded(queue_size);

    let client = match perform_handshake(&mut reader, &mut writer, &mut inbound, &mut chunk, &db, tx, address.clone()).await {
        Ok(client) => client,
        Err(e) => {
            debug!("handshake failed from {address:?}: {e}");
            return;
        }
    };
    db.register(client.clone());
    debug!("client {} connected from {:?}", client.identifier, address);
    db.publish_server_event(
        event::CONNECTED,
        json!({ "source": client.identifier, "address": client.address }),
    )
    .await;

    let writer_task = tokio::spawn(write_loop(writer, rx));

    let reason = read_loop(&db, &client, &mut reader, &mut inbound, &mut chunk).await;

    debug!("client {} disconnecting: {}", client.identifier, reason.as_str());
    db.unregister(&client, reason).await;
    writer_task.abort();
}

/// Reads and validates the first frame, which must be `command.create`, and
/// completes the negotiation. The reply goes out uncompressed, directly on
/// the writer half, before the writer task or the shared client state exist.
async fn perform_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    inbound: &mut Vec<u8>,
    chunk: &mut [u8],
    db: &Arc<BrokerDb>,
    tx: async_channel::Sender<client::OutboundFrame>,
    address: Option<String>,
) -> Result<Arc<BrokerClient>, crate::Error>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let raw = loop {
        if let Some(raw) = frame::try_pop_frame(inbound, Compression::None)? {
            break raw;
        }
        let n = reader.read(chunk).await?;
        if n == 0 {
            return Err(crate::Error::eof());
        }
        inbound.extend_from_slice(&chunk[..n]);
        if inbound.len() > db.max_buffer_size {
            return Err(crate::Error::data("handshake frame too large"));
        }
    };

    let env = Envelope::parse(&raw)?;
    if env.kind != EnvelopeType::Command || env.identifier != command::CREATE {
        return Err(crate::Error::data("first frame must be command.create"));
    }

    let (client, reply, compression) = db.negotiate_create(&env, tx, address)?;

    // `negotiate_create` already reserved `client.identifier` in the shared
    // table; if the reply never makes it out, release the reservation
    // rather than leaving a phantom entry nothing will ever connect.
    let mut out = Vec::new();
    if let Err(e) = frame::push_string(&mut out, Compression::None, &reply.to_wire_string()?) {
        db.unregister(&client, CloseReason::InternalError).await;
        return Err(e);
    }
    if let Err(e) = writer.write_all(&out).await {
        db.unregister(&client, CloseReason::InternalError).await;
        return Err(e.into());
    }

    client.set_compression(compression);
    Ok(client)
}

async fn write_loop<W>(mut writer: W, rx: async_channel::Receiver<client::OutboundFrame>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Ok((env, compression)) = rx.recv().await {
        let raw = match env.to_wire_string() {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to encode outbound envelope: {e}");
                continue;
            }
        };
        let mut out = Vec::new();
        if let Err(e) = frame::push_string(&mut out, compression, &raw) {
            error!("failed to frame outbound envelope: {e}");
            continue;
        }
        if writer.write_all(&out).await.is_err() {
            break;
        }
    }
}

async fn read_loop<R>(
    db: &Arc<BrokerDb>,
    client: &Arc<BrokerClient>,
    reader: &mut R,
    inbound: &mut Vec<u8>,
    chunk: &mut [u8],
) -> CloseReason
where
    R: tokio::io::AsyncRead + Unpin,
{
    let read_compression = client.compression();
    let mut tick = client.keepalive_interval().map(|d| tokio::time::interval(sweep_period(d)));

    loop {
        while let Some(raw) = match frame::try_pop_frame(inbound, read_compression) {
            Ok(v) => v,
            Err(e) => {
                debug!("client {} sent a malformed frame: {e}", client.identifier);
                return CloseReason::InternalError;
            }
        } {
            let env = match Envelope::parse(&raw) {
                Ok(env) => env,
                Err(e) => {
                    debug!("client {} sent an invalid envelope: {e}", client.identifier);
                    return CloseReason::InternalError;
                }
            };
            let (reply, close) = db.dispatch(client, env).await;
            if let Some(reply) = reply {
                let _ = client.enqueue(reply).await;
            }
            if let Some(reason) = close {
                return reason;
            }
        }

        tokio::select! {
            biased;

            _ = client.disconnect.notified() => {
                return CloseReason::CloseCommand;
            }
            _ = tick_or_pending(&mut tick) => {
                if client.sweep_keepalive() {
                    return CloseReason::PingThreshold;
                }
            }
            n = reader.read(chunk) => {
                match n {
                    Ok(0) => return CloseReason::ConnectionClosed,
                    Ok(n) => {
                        inbound.extend_from_slice(&chunk[..n]);
                        if inbound.len() > db.max_buffer_size {
                            debug!(
                                "client {} exceeded max inbound buffer ({} > {})",
                                client.identifier,
                                inbound.len(),
                                db.max_buffer_size
                            );
                            return CloseReason::InternalError;
                        }
                    }
                    Err(_) => return CloseReason::ConnectionClosed,
                }
            }
        }
    }
}

async fn tick_or_pending(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

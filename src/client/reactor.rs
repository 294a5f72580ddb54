//! The background task behind a `Client` handle: connect, handshake,
//! request framing, in-flight correlation, and keepalive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::envelope::{Envelope, EnvelopeType, SequenceCounter};
use crate::error::{Error, ErrorKind};
use crate::frame::{self, Compression};
use crate::{command, event, BUFFER_CHUNK, SERVER};

use super::{Command, ConnectionState, EventHandler, CommandHandler, ClientOptions};

pub(crate) fn spawn(
    addr: String,
    options: ClientOptions,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
    identifier: Arc<RwLock<Option<String>>>,
    ready_tx: oneshot::Sender<Result<(), Error>>,
) {
    tokio::spawn(run_client(addr, options, cmd_rx, state, identifier, Some(ready_tx)));
}

fn set_state(state: &AtomicU8, s: ConnectionState) {
    state.store(s as u8, Ordering::SeqCst);
}

async fn run_client(
    addr: String,
    options: ClientOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
    identifier: Arc<RwLock<Option<String>>>,
    mut ready_tx: Option<oneshot::Sender<Result<(), Error>>>,
) {
    loop {
        set_state(&state, ConnectionState::Connecting);
        match connect_and_handshake(&addr, &options).await {
            Ok((stream, compression, assigned, ping)) => {
                *identifier.write().unwrap() = Some(assigned.clone());
                set_state(&state, ConnectionState::Connected);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                let end = run_session(stream, compression, ping, &options, &mut cmd_rx, &assigned).await;
                debug!("client {} session ended: {:?}", assigned, end);
                set_state(&state, ConnectionState::Disconnecting);
                if matches!(end, SessionEnd::HostDisconnect) {
                    set_state(&state, ConnectionState::Disconnected);
                    drain_with_error(&mut cmd_rx, Error::canceled()).await;
                    return;
                }
            }
            Err(e) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                    return;
                }
                warn!("reconnect attempt to {addr} failed: {e}");
            }
        }
        set_state(&state, ConnectionState::Disconnected);
        match options.connect_interval {
            Some(d) => tokio::time::sleep(d).await,
            None => {
                drain_with_error(&mut cmd_rx, Error::not_registered()).await;
                return;
            }
        }
    }
}

async fn drain_with_error(cmd_rx: &mut mpsc::UnboundedReceiver<Command>, err: Error) {
    while let Some(cmd) = cmd_rx.recv().await {
        fail_command(cmd, clone_err(&err));
    }
}

fn clone_err(e: &Error) -> Error {
    Error::new(e.kind(), e.to_string())
}

fn fail_command(cmd: Command, err: Error) {
    match cmd {
        Command::Publish { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Subscribe { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Unsubscribe { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Register { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Unregister { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Call { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Command::Disconnect => {}
    }
}

struct PingConfig {
    interval: Option<Duration>,
    timeout: Duration,
    threshold: u32,
}

fn command_envelope(destination: &str, identifier: &str, sequence: u32, payload: Value) -> Envelope {
    Envelope {
        kind: EnvelopeType::Command,
        destination: Some(destination.to_owned()),
        source: None,
        identifier: identifier.to_owned(),
        sequence,
        timeout: None,
        payload,
        status: None,
    }
}

async fn connect_and_handshake(
    addr: &str,
    options: &ClientOptions,
) -> Result<(TcpStream, Compression, String, PingConfig), Error> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = split(stream);

    let mut seq = SequenceCounter::new();
    let handshake_seq = seq.next();
    let payload = json!({
        "identifier": options.identifier.clone().unwrap_or_default(),
        "password": options.password,
        "ping.interval": options.ping_interval.map(|d| d.as_millis() as u64),
        "ping.timeout": options.ping_timeout.map(|d| d.as_millis() as u64),
        "ping.threshold": options.ping_threshold,
        "compressions": options.compressions.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
    });
    let env = command_envelope(SERVER, command::CREATE, handshake_seq, payload);
    let mut out = Vec::new();
    frame::push_string(&mut out, Compression::None, &env.to_wire_string()?)?;
    writer.write_all(&out).await?;

    let mut inbound = Vec::with_capacity(BUFFER_CHUNK);
    let mut chunk = vec![0u8; BUFFER_CHUNK];
    let raw = loop {
        if let Some(raw) = frame::try_pop_frame(&mut inbound, Compression::None)? {
            break raw;
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::eof());
        }
        inbound.extend_from_slice(&chunk[..n]);
    };

    let reply = Envelope::parse(&raw)?;
    if reply.kind != EnvelopeType::Result || reply.identifier != command::CREATE {
        return Err(Error::data("unexpected handshake reply"));
    }
    if reply.status != Some(0) {
        let message = reply
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("create rejected")
            .to_owned();
        return Err(Error::new(ErrorKind::NotSupported, message));
    }

    let assigned = reply
        .payload
        .get("identifier")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::data("handshake reply missing identifier"))?
        .to_owned();
    let compression = reply
        .payload
        .get("compression")
        .and_then(Value::as_str)
        .and_then(Compression::from_str)
        .unwrap_or(Compression::None);

    let ping_interval_ms = reply
        .payload
        .get("ping")
        .and_then(|p| p.get("interval"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let ping = if ping_interval_ms > 0 {
        let timeout_ms = reply
            .payload
            .get("ping")
            .and_then(|p| p.get("timeout"))
            .and_then(Value::as_u64)
            .unwrap_or(ping_interval_ms);
        let threshold = reply
            .payload
            .get("ping")
            .and_then(|p| p.get("threshold"))
            .and_then(Value::as_u64)
            .unwrap_or(options.ping_threshold as u64) as u32;
        PingConfig {
            interval: Some(Duration::from_millis(ping_interval_ms)),
            timeout: Duration::from_millis(timeout_ms),
            threshold,
        }
    } else {
        PingConfig {
            interval: None,
            timeout: Duration::from_secs(1),
            threshold: options.ping_threshold,
        }
    };

    // Reassemble the split halves; `run_session` re-splits, but tokio's
    // split() is a cheap `Arc`-free wrapper so recombining costs nothing.
    let stream = reader
        .unsplit(writer);
    Ok((stream, compression, assigned, ping))
}

#[derive(Debug)]
enum SessionEnd {
    HostDisconnect,
    Eof,
    PingThreshold,
    ProtocolError,
}

enum PendingKind {
    Subscribe {
        source: String,
        event: String,
        handler: Arc<dyn EventHandler>,
    },
    Unsubscribe {
        source: String,
        event: String,
    },
    Register {
        identifier: String,
        handler: Arc<dyn CommandHandler>,
    },
    Unregister {
        identifier: String,
    },
    Call,
}

enum PendingReply {
    Unit(oneshot::Sender<Result<(), Error>>),
    Value(oneshot::Sender<Result<Value, Error>>),
}

impl PendingReply {
    fn ok_unit(self) {
        if let PendingReply::Unit(tx) = self {
            let _ = tx.send(Ok(()));
        }
    }

    fn ok_value(self, v: Value) {
        if let PendingReply::Value(tx) = self {
            let _ = tx.send(Ok(v));
        }
    }

    fn err(self, e: Error) {
        match self {
            PendingReply::Unit(tx) => {
                let _ = tx.send(Err(e));
            }
            PendingReply::Value(tx) => {
                let _ = tx.send(Err(e));
            }
        }
    }
}

struct Pending {
    kind: PendingKind,
    reply: PendingReply,
    created: Instant,
    timeout: Duration,
}

fn status_to_error(status: i64, payload: &Value) -> Error {
    let kind = match -status {
        1 => ErrorKind::NotSupported,
        2 => ErrorKind::NotRegistered,
        3 => ErrorKind::Busy,
        4 => ErrorKind::Data,
        5 => ErrorKind::Timeout,
        6 => ErrorKind::Io,
        7 => ErrorKind::Eof,
        8 => ErrorKind::Canceled,
        _ => ErrorKind::Internal,
    };
    let message = payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| kind.as_str().to_owned());
    Error::new(kind, message)
}

fn subscription_matches(sub_source: &str, sub_event: &str, src: &str, id: &str) -> bool {
    (sub_source == crate::SOURCE_ALL || sub_source == src) && (sub_event == crate::EVENT_ALL || sub_event == id)
}

async fn send_envelope<W>(writer: &mut W, compression: Compression, env: &Envelope) -> Result<(), Error>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let raw = env.to_wire_string()?;
    let mut out = Vec::new();
    frame::push_string(&mut out, compression, &raw)?;
    writer.write_all(&out).await?;
    Ok(())
}

/// How often the session loop wakes up to sweep keepalive/timeouts even
/// with no I/O activity.
fn sweep_period(ping: &PingConfig) -> Duration {
    match ping.interval {
        Some(i) => (i.min(ping.timeout) / 4).max(Duration::from_millis(100)),
        None => Duration::from_millis(250),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    stream: TcpStream,
    compression: Compression,
    ping: PingConfig,
    options: &ClientOptions,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    our_identifier: &str,
) -> SessionEnd {
    let (mut reader, mut writer): (ReadHalf<TcpStream>, WriteHalf<TcpStream>) = split(stream);
    let mut inbound = Vec::with_capacity(BUFFER_CHUNK);
    let mut chunk = vec![0u8; BUFFER_CHUNK];

    // Shared with the spawned command-result tasks below so every outbound
    // envelope, in-flight or fire-and-forget, draws from the one counter.
    let seq = Arc::new(std::sync::Mutex::new(SequenceCounter::new()));
    seq.lock().unwrap().next(); // slot 1 was consumed by the handshake frame

    let mut subscriptions: Vec<(String, String, Arc<dyn EventHandler>)> = Vec::new();
    let mut routines: HashMap<String, Arc<dyn CommandHandler>> = HashMap::new();
    let mut in_flight: HashMap<u32, Pending> = HashMap::new();

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Envelope>();

    let mut wait_pong = false;
    let mut last_ping_sent = Instant::now();
    let mut missed: u32 = 0;
    let mut tick = tokio::time::interval(sweep_period(&ping));

    let end = 'session: loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Disconnect) => break SessionEnd::HostDisconnect,
                    Some(Command::Publish { destination, identifier, payload, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(
                            SERVER,
                            command::EVENT,
                            sequence,
                            json!({ "destination": destination, "identifier": identifier, "payload": payload }),
                        );
                        let result = send_envelope(&mut writer, compression, &env).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Subscribe { source, event, handler, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(SERVER, command::SUBSCRIBE, sequence, json!({ "source": source, "event": event }));
                        if let Err(e) = send_envelope(&mut writer, compression, &env).await {
                            let _ = reply.send(Err(e));
                        } else {
                            in_flight.insert(sequence, Pending {
                                kind: PendingKind::Subscribe { source, event, handler },
                                reply: PendingReply::Unit(reply),
                                created: Instant::now(),
                                timeout: options.default_timeout,
                            });
                        }
                    }
                    Some(Command::Unsubscribe { source, event, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(SERVER, command::UNSUBSCRIBE, sequence, json!({ "source": source, "event": event }));
                        if let Err(e) = send_envelope(&mut writer, compression, &env).await {
                            let _ = reply.send(Err(e));
                        } else {
                            in_flight.insert(sequence, Pending {
                                kind: PendingKind::Unsubscribe { source, event },
                                reply: PendingReply::Unit(reply),
                                created: Instant::now(),
                                timeout: options.default_timeout,
                            });
                        }
                    }
                    Some(Command::Register { identifier, handler, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(SERVER, command::REGISTER, sequence, json!({ "command": identifier }));
                        if let Err(e) = send_envelope(&mut writer, compression, &env).await {
                            let _ = reply.send(Err(e));
                        } else {
                            in_flight.insert(sequence, Pending {
                                kind: PendingKind::Register { identifier, handler },
                                reply: PendingReply::Unit(reply),
                                created: Instant::now(),
                                timeout: options.default_timeout,
                            });
                        }
                    }
                    Some(Command::Unregister { identifier, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(SERVER, command::UNREGISTER, sequence, json!({ "command": identifier }));
                        if let Err(e) = send_envelope(&mut writer, compression, &env).await {
                            let _ = reply.send(Err(e));
                        } else {
                            in_flight.insert(sequence, Pending {
                                kind: PendingKind::Unregister { identifier },
                                reply: PendingReply::Unit(reply),
                                created: Instant::now(),
                                timeout: options.default_timeout,
                            });
                        }
                    }
                    Some(Command::Call { destination, identifier, payload, timeout, reply }) => {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(&destination, &identifier, sequence, payload);
                        if let Err(e) = send_envelope(&mut writer, compression, &env).await {
                            let _ = reply.send(Err(e));
                        } else {
                            in_flight.insert(sequence, Pending {
                                kind: PendingKind::Call,
                                reply: PendingReply::Value(reply),
                                created: Instant::now(),
                                timeout,
                            });
                        }
                    }
                }
            }

            Some(result_env) = result_rx.recv() => {
                let _ = send_envelope(&mut writer, compression, &result_env).await;
            }

            _ = tick.tick() => {
                let now = Instant::now();
                if let Some(interval) = ping.interval {
                    if !wait_pong && now.duration_since(last_ping_sent) >= interval {
                        let sequence = seq.lock().unwrap().next();
                        let env = command_envelope(SERVER, command::EVENT, sequence, json!({ "destination": SERVER, "identifier": event::PING, "payload": {} }));
                        if send_envelope(&mut writer, compression, &env).await.is_ok() {
                            wait_pong = true;
                            last_ping_sent = now;
                        }
                    } else if wait_pong && now.duration_since(last_ping_sent) >= ping.timeout {
                        missed += 1;
                        wait_pong = false;
                        last_ping_sent = now;
                        if missed > ping.threshold {
                            break SessionEnd::PingThreshold;
                        }
                    }
                }
                in_flight.retain(|_, pending| now.duration_since(pending.created) < pending.timeout);
            }

            n = reader.read(&mut chunk) => {
                match n {
                    Ok(0) => break SessionEnd::Eof,
                    Err(_) => break SessionEnd::Eof,
                    Ok(n) => {
                        inbound.extend_from_slice(&chunk[..n]);
                        loop {
                            let raw = match frame::try_pop_frame(&mut inbound, compression) {
                                Ok(Some(raw)) => raw,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("client {our_identifier} received a malformed frame: {e}");
                                    break 'session SessionEnd::ProtocolError;
                                }
                            };
                            let env = match Envelope::parse(&raw) {
                                Ok(env) => env,
                                Err(e) => {
                                    warn!("client {our_identifier} received an invalid envelope: {e}");
                                    continue;
                                }
                            };
                            dispatch_inbound(
                                env,
                                &mut in_flight,
                                &mut subscriptions,
                                &mut routines,
                                &mut wait_pong,
                                &mut missed,
                                &result_tx,
                                &options.global_handler,
                                &seq,
                            );
                        }
                    }
                }
            }
        }
    };

    for (_, pending) in in_flight.drain() {
        pending.reply.err(Error::canceled());
    }
    subscriptions.clear();
    routines.clear();

    end
}

#[allow(clippy::too_many_arguments)]
fn dispatch_inbound(
    env: Envelope,
    in_flight: &mut HashMap<u32, Pending>,
    subscriptions: &mut Vec<(String, String, Arc<dyn EventHandler>)>,
    routines: &mut HashMap<String, Arc<dyn CommandHandler>>,
    wait_pong: &mut bool,
    missed: &mut u32,
    result_tx: &mpsc::UnboundedSender<Envelope>,
    global_handler: &Option<Arc<dyn EventHandler>>,
    seq: &Arc<std::sync::Mutex<SequenceCounter>>,
) {
    match env.kind {
        EnvelopeType::Result => {
            let Some(pending) = in_flight.remove(&env.sequence) else {
                warn!("unmatched result sequence {}", env.sequence);
                return;
            };
            let status = env.status.unwrap_or(-1);
            match pending.kind {
                PendingKind::Call => {
                    if status == 0 {
                        pending.reply.ok_value(env.payload);
                    } else {
                        pending.reply.err(status_to_error(status, &env.payload));
                    }
                }
                PendingKind::Subscribe { source, event, handler } => {
                    if status == 0 {
                        subscriptions.push((source, event, handler));
                        pending.reply.ok_unit();
                    } else {
                        pending.reply.err(status_to_error(status, &env.payload));
                    }
                }
                PendingKind::Unsubscribe { source, event } => {
                    if status == 0 {
                        subscriptions.retain(|(s, e, _)| !(*s == source && *e == event));
                        pending.reply.ok_unit();
                    } else {
                        pending.reply.err(status_to_error(status, &env.payload));
                    }
                }
                PendingKind::Register { identifier, handler } => {
                    if status == 0 {
                        routines.insert(identifier, handler);
                        pending.reply.ok_unit();
                    } else {
                        pending.reply.err(status_to_error(status, &env.payload));
                    }
                }
                PendingKind::Unregister { identifier } => {
                    if status == 0 {
                        routines.remove(&identifier);
                        pending.reply.ok_unit();
                    } else {
                        pending.reply.err(status_to_error(status, &env.payload));
                    }
                }
            }
        }
        EnvelopeType::Event => {
            let source = env.source.clone().unwrap_or_default();
            if source == SERVER && env.identifier == event::PONG {
                *wait_pong = false;
                *missed = 0;
                return;
            }
            let matched = subscriptions
                .iter()
                .find(|(s, e, _)| subscription_matches(s, e, &source, &env.identifier))
                .map(|(_, _, handler)| handler.clone())
                .or_else(|| global_handler.clone());
            if let Some(handler) = matched {
                let ev = super::Event {
                    source,
                    identifier: env.identifier,
                    payload: env.payload,
                };
                tokio::spawn(async move {
                    handler.handle(ev).await;
                });
            }
        }
        EnvelopeType::Command => {
            let Some(handler) = routines.get(&env.identifier).cloned() else {
                return;
            };
            let source = env.source.clone().unwrap_or_default();
            let sequence = env.sequence;
            let identifier = env.identifier.clone();
            let result_tx = result_tx.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let (status, payload) = handler.handle(env.payload).await;
                let reply_sequence = seq.lock().unwrap().next();
                let reply_env = command_envelope(
                    SERVER,
                    command::RESULT,
                    reply_sequence,
                    json!({ "destination": source, "identifier": identifier, "sequence": sequence, "status": status, "payload": payload }),
                );
                let _ = result_tx.send(reply_env);
            });
        }
    }
}

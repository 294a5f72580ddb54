//! Built-in command dispatch and inter-client routing (spec §4.4, §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::broker::client::{BrokerClient, Keepalive, OutboundFrame};
use crate::command;
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::Error;
use crate::frame::{Compression, COMPRESSION_PREFERENCE};
use crate::{event, CLIENT_PREFIX, DESTINATION_ALL, DESTINATION_SUBSCRIBERS, SERVER};
use crate::CloseReason;

fn ok_result(env: &Envelope, caller: &str, payload: Value) -> Envelope {
    Envelope::result(caller, env.identifier.clone(), env.sequence, 0, payload)
}

fn err_result(env: &Envelope, caller: &str, err: &Error) -> Envelope {
    Envelope::result(
        caller,
        env.identifier.clone(),
        env.sequence,
        err.status_code(),
        json!({ "error": err.to_string() }),
    )
}

#[derive(Deserialize)]
struct CreatePayload {
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "ping.interval")]
    ping_interval: Option<u64>,
    #[serde(default, rename = "ping.timeout")]
    ping_timeout: Option<u64>,
    #[serde(default, rename = "ping.threshold")]
    ping_threshold: Option<u32>,
    #[serde(default)]
    compressions: Vec<String>,
}

#[derive(Deserialize)]
struct SubUnsubPayload {
    source: String,
    event: String,
}

#[derive(Deserialize)]
struct CommandNamePayload {
    command: String,
}

#[derive(Deserialize)]
struct EventPayload {
    destination: String,
    identifier: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ResultPayload {
    destination: String,
    identifier: String,
    sequence: u32,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ClosePayload {
    source: String,
}

#[derive(Deserialize)]
struct ClientLookupPayload {
    identifier: String,
}

/// Shared broker routing state: the live client table and broker-wide
/// configuration. Owned by `Broker`, cloned into every connection task.
pub struct BrokerDb {
    pub clients: RwLock<HashMap<String, Arc<BrokerClient>>>,
    pub listeners: RwLock<Vec<String>>,
    pub password: Option<String>,
    pub max_buffer_size: usize,
    pub shutdown_requested: AtomicBool,
}

impl BrokerDb {
    pub fn new(password: Option<String>, max_buffer_size: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            password,
            max_buffer_size,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Handles the one `command.create` handshake frame. Reserves the
    /// identifier in `clients` itself (see below) and returns the new
    /// client, already inserted but not yet marked connected; the caller
    /// marks it connected via `register` after successfully sending the
    /// uncompressed reply, plus the reply envelope and the negotiated
    /// compression to switch to afterwards.
    pub fn negotiate_create(
        &self,
        env: &Envelope,
        tx: async_channel::Sender<OutboundFrame>,
        address: Option<String>,
    ) -> Result<(Arc<BrokerClient>, Envelope, Compression), Error> {
        let req: CreatePayload =
            serde_json::from_value(env.payload.clone()).map_err(|e| Error::data(e.to_string()))?;
        if let Some(pw) = &self.password {
            if req.password.as_deref() != Some(pw.as_str()) {
                return Err(Error::not_supported("invalid password"));
            }
        }
        if !req.identifier.is_empty() && (req.identifier == SERVER || req.identifier.starts_with(CLIENT_PREFIX)) {
            return Err(Error::data("reserved identifier"));
        }

        let compression = COMPRESSION_PREFERENCE
            .iter()
            .copied()
            .find(|c| req.compressions.iter().any(|s| s == c.as_str()))
            .unwrap_or(Compression::None);

        let ping_json = match req.ping_interval {
            Some(interval) if interval > 0 => {
                let timeout = req.ping_timeout.unwrap_or(interval).min(interval);
                let threshold = req.ping_threshold.unwrap_or(3).max(1);
                json!({ "interval": interval, "timeout": timeout, "threshold": threshold })
            }
            _ => json!({ "interval": 0 }),
        };

        // Check-and-reserve under one write lock: two connections racing
        // `command.create` for the same identifier (explicit or an
        // astronomically-unlikely minted collision) can't both pass the
        // uniqueness check before either inserts, since nothing drops the
        // lock between the lookup and the insert.
        let mut clients = self.clients.write().unwrap();
        let identifier = if req.identifier.is_empty() {
            loop {
                let bytes: [u8; 4] = rand::random();
                let candidate = format!("{CLIENT_PREFIX}{}", hex::encode(bytes));
                if !clients.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if clients.contains_key(&req.identifier) {
                return Err(Error::busy(format!(
                    "identifier already registered: {}",
                    req.identifier
                )));
            }
            req.identifier
        };

        let client = Arc::new(BrokerClient::new(identifier.clone(), address, tx));
        if let Some(interval) = req.ping_interval.filter(|i| *i > 0) {
            let timeout = req.ping_timeout.unwrap_or(interval).min(interval);
            let threshold = req.ping_threshold.unwrap_or(3).max(1);
            client.set_keepalive(Some(Keepalive::new(
                std::time::Duration::from_millis(interval),
                std::time::Duration::from_millis(timeout),
                threshold,
            )));
        }
        clients.insert(identifier.clone(), client.clone());
        drop(clients);

        let reply = ok_result(
            env,
            &identifier,
            json!({ "identifier": identifier, "compression": compression.as_str(), "ping": ping_json }),
        );
        Ok((client, reply, compression))
    }

    /// Marks an already-reserved client (inserted by `negotiate_create`) as
    /// connected, once its handshake reply has gone out on the wire.
    pub fn register(&self, client: Arc<BrokerClient>) {
        client.mark_connected();
    }

    pub fn register_listener(&self, addr: String) {
        self.listeners.write().unwrap().push(addr);
    }

    /// Dispatches one inbound frame from an already-connected client.
    /// Returns the immediate reply (built-in commands always produce one;
    /// forwarded calls do not) and, if set, the reason this connection must
    /// now be torn down.
    pub async fn dispatch(
        &self,
        caller: &Arc<BrokerClient>,
        env: Envelope,
    ) -> (Option<Envelope>, Option<CloseReason>) {
        if env.kind != EnvelopeType::Command {
            // Clients only ever originate `command`-typed envelopes; an
            // `event` or `result` frame from a client is a protocol
            // violation (see error taxonomy: parse/protocol errors close
            // the connection).
            return (None, Some(CloseReason::InternalError));
        }
        let destination = env.destination.clone().unwrap_or_default();
        if destination == SERVER {
            self.handle_builtin(caller, env).await
        } else {
            (self.forward_command(caller, &env, &destination).await, None)
        }
    }

    async fn handle_builtin(
        &self,
        caller: &Arc<BrokerClient>,
        env: Envelope,
    ) -> (Option<Envelope>, Option<CloseReason>) {
        let reply = match env.identifier.as_str() {
            command::CREATE => err_result(
                &env,
                &caller.identifier,
                &Error::not_supported("already connected"),
            ),
            command::SUBSCRIBE => self.cmd_subscribe(caller, &env).await,
            command::UNSUBSCRIBE => self.cmd_unsubscribe(caller, &env).await,
            command::REGISTER => self.cmd_register(caller, &env).await,
            command::UNREGISTER => self.cmd_unregister(caller, &env).await,
            command::EVENT => self.cmd_event(caller, &env).await,
            command::RESULT => self.cmd_result(caller, &env).await,
            command::STATUS => self.cmd_status(&env, &caller.identifier),
            command::CLIENTS => self.cmd_clients(&env, &caller.identifier),
            command::CLIENT => self.cmd_client(&env, &caller.identifier),
            command::CLOSE => return self.cmd_close(caller, &env).await,
            _ => err_result(&env, &caller.identifier, &Error::not_supported("unknown command")),
        };
        (Some(reply), None)
    }

    async fn cmd_subscribe(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        match serde_json::from_value::<SubUnsubPayload>(env.payload.clone()) {
            Ok(p) => {
                caller.add_subscription(&p.source, &p.event);
                self.publish_server_event(
                    event::SUBSCRIBED,
                    json!({ "source": caller.identifier, "destination": p.source, "identifier": p.event }),
                )
                .await;
                ok_result(env, &caller.identifier, json!({}))
            }
            Err(e) => err_result(env, &caller.identifier, &Error::data(e.to_string())),
        }
    }

    async fn cmd_unsubscribe(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        match serde_json::from_value::<SubUnsubPayload>(env.payload.clone()) {
            Ok(p) => {
                caller.remove_subscription(&p.source, &p.event);
                self.publish_server_event(
                    event::UNSUBSCRIBED,
                    json!({ "source": caller.identifier, "destination": p.source, "identifier": p.event }),
                )
                .await;
                ok_result(env, &caller.identifier, json!({}))
            }
            Err(e) => err_result(env, &caller.identifier, &Error::data(e.to_string())),
        }
    }

    async fn cmd_register(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        match serde_json::from_value::<CommandNamePayload>(env.payload.clone()) {
            Ok(p) => {
                caller.add_command(&p.command);
                self.publish_server_event(
                    event::REGISTERED,
                    json!({ "source": caller.identifier, "identifier": p.command }),
                )
                .await;
                ok_result(env, &caller.identifier, json!({}))
            }
            Err(e) => err_result(env, &caller.identifier, &Error::data(e.to_string())),
        }
    }

    async fn cmd_unregister(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        match serde_json::from_value::<CommandNamePayload>(env.payload.clone()) {
            Ok(p) => {
                caller.remove_command(&p.command);
                self.publish_server_event(
                    event::UNREGISTERED,
                    json!({ "source": caller.identifier, "identifier": p.command }),
                )
                .await;
                ok_result(env, &caller.identifier, json!({}))
            }
            Err(e) => err_result(env, &caller.identifier, &Error::data(e.to_string())),
        }
    }

    async fn cmd_event(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        match serde_json::from_value::<EventPayload>(env.payload.clone()) {
            Ok(p) => {
                self.route_event(caller, &p.destination, &p.identifier, p.payload)
                    .await;
                ok_result(env, &caller.identifier, json!({}))
            }
            Err(e) => err_result(env, &caller.identifier, &Error::data(e.to_string())),
        }
    }

    async fn cmd_result(&self, caller: &Arc<BrokerClient>, env: &Envelope) -> Envelope {
        let p: ResultPayload = match serde_json::from_value(env.payload.clone()) {
            Ok(p) => p,
            Err(e) => return err_result(env, &caller.identifier, &Error::data(e.to_string())),
        };
        let key = (p.destination.clone(), p.identifier.clone(), p.sequence);
        if caller.take_wait(&key) {
            let origin = self.clients.read().unwrap().get(&p.destination).cloned();
            if let Some(origin) = origin {
                let _ = origin
                    .enqueue(Envelope::result(
                        origin.identifier.clone(),
                        p.identifier,
                        p.sequence,
                        p.status,
                        p.payload,
                    ))
                    .await;
            }
            ok_result(env, &caller.identifier, json!({}))
        } else {
            err_result(env, &caller.identifier, &Error::not_registered())
        }
    }

    fn cmd_status(&self, env: &Envelope, caller: &str) -> Envelope {
        let clients = self.clients.read().unwrap();
        let clients_json: Vec<Value> = clients
            .values()
            .map(|c| {
                json!({
                    "identifier": c.identifier,
                    "connected": c.is_connected(),
                    "subscriptions": c.subscriptions_snapshot().iter().map(|s| json!({"source": s.source, "event": s.event})).collect::<Vec<_>>(),
                    "commands": c.commands_snapshot(),
                })
            })
            .collect();
        ok_result(
            env,
            caller,
            json!({ "clients": clients_json, "listeners": *self.listeners.read().unwrap() }),
        )
    }

    fn cmd_clients(&self, env: &Envelope, caller: &str) -> Envelope {
        let identifiers: Vec<String> = self.clients.read().unwrap().keys().cloned().collect();
        ok_result(env, caller, json!({ "clients": identifiers }))
    }

    fn cmd_client(&self, env: &Envelope, caller: &str) -> Envelope {
        match serde_json::from_value::<ClientLookupPayload>(env.payload.clone()) {
            Ok(p) => match self.clients.read().unwrap().get(&p.identifier) {
                Some(c) => ok_result(
                    env,
                    caller,
                    json!({
                        "identifier": c.identifier,
                        "connected": c.is_connected(),
                        "subscriptions": c.subscriptions_snapshot().iter().map(|s| json!({"source": s.source, "event": s.event})).collect::<Vec<_>>(),
                        "commands": c.commands_snapshot(),
                    }),
                ),
                None => err_result(env, caller, &Error::not_registered()),
            },
            Err(e) => err_result(env, caller, &Error::data(e.to_string())),
        }
    }

    async fn cmd_close(
        &self,
        caller: &Arc<BrokerClient>,
        env: &Envelope,
    ) -> (Option<Envelope>, Option<CloseReason>) {
        match serde_json::from_value::<ClosePayload>(env.payload.clone()) {
            Ok(p) if p.source == SERVER => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                (Some(ok_result(env, &caller.identifier, json!({}))), None)
            }
            Ok(p) => {
                let target = self.clients.read().unwrap().get(&p.source).cloned();
                match target {
                    Some(t) => {
                        t.disconnect.notify_waiters();
                        (Some(ok_result(env, &caller.identifier, json!({}))), None)
                    }
                    None => (
                        Some(err_result(env, &caller.identifier, &Error::not_registered())),
                        None,
                    ),
                }
            }
            Err(e) => (
                Some(err_result(env, &caller.identifier, &Error::data(e.to_string()))),
                None,
            ),
        }
    }

    async fn forward_command(
        &self,
        caller: &Arc<BrokerClient>,
        env: &Envelope,
        destination: &str,
    ) -> Option<Envelope> {
        let dest = self.clients.read().unwrap().get(destination).cloned();
        match dest {
            Some(d) if d.is_connected() && d.has_command(&env.identifier) => {
                let call = Envelope::response(
                    EnvelopeType::Command,
                    caller.identifier.clone(),
                    Some(d.identifier.clone()),
                    env.identifier.clone(),
                    env.sequence,
                    env.payload.clone(),
                );
                d.add_wait((caller.identifier.clone(), env.identifier.clone(), env.sequence));
                match d.enqueue(call).await {
                    Ok(()) => None,
                    Err(e) => Some(err_result(env, &caller.identifier, &e)),
                }
            }
            _ => Some(err_result(env, &caller.identifier, &Error::not_registered())),
        }
    }

    /// Fan-out for a `command.event` payload, per §4.5's three destination
    /// selectors plus the direct-identifier case.
    async fn route_event(&self, caller: &Arc<BrokerClient>, destination: &str, identifier: &str, payload: Value) {
        if destination == SERVER {
            if identifier == event::PING {
                caller.note_ping();
                self.send_pong(caller).await;
            }
            return;
        }
        if destination == DESTINATION_ALL {
            let snapshot: Vec<Arc<BrokerClient>> = self.clients.read().unwrap().values().cloned().collect();
            for c in snapshot {
                if c.identifier != caller.identifier && c.is_connected() {
                    self.deliver_event(&c, caller, identifier, payload.clone()).await;
                }
            }
            return;
        }
        if destination == DESTINATION_SUBSCRIBERS {
            let snapshot: Vec<Arc<BrokerClient>> = self.clients.read().unwrap().values().cloned().collect();
            for c in snapshot {
                // Self-fanout is not suppressed: if the publisher's own
                // subscription matches, it receives a copy too (see
                // DESIGN.md's Open Question resolution).
                if c.is_connected() && c.matches_subscription(&caller.identifier, identifier) {
                    self.deliver_event(&c, caller, identifier, payload.clone()).await;
                }
            }
            return;
        }
        let found = self.clients.read().unwrap().get(destination).cloned();
        if let Some(c) = found {
            if c.is_connected() {
                self.deliver_event(&c, caller, identifier, payload).await;
            }
        }
        // Unknown destination: silently dropped. §7 — the broker never
        // returns a result for an event; its absence is the only signal.
    }

    async fn deliver_event(&self, to: &Arc<BrokerClient>, from: &Arc<BrokerClient>, identifier: &str, payload: Value) {
        let seq = to.next_event_sequence();
        let env = Envelope::response(
            EnvelopeType::Event,
            from.identifier.clone(),
            None,
            identifier.to_string(),
            seq,
            payload,
        );
        let _ = to.enqueue(env).await;
    }

    async fn send_pong(&self, caller: &Arc<BrokerClient>) {
        let seq = caller.next_event_sequence();
        let env = Envelope::response(
            EnvelopeType::Event,
            SERVER,
            Some(caller.identifier.clone()),
            event::PONG,
            seq,
            json!({}),
        );
        let _ = caller.enqueue(env).await;
    }

    /// Broadcasts a built-in server event to every client whose
    /// subscription set matches `(SERVER, identifier)`.
    pub async fn publish_server_event(&self, identifier: &str, payload: Value) {
        let snapshot: Vec<Arc<BrokerClient>> = self.clients.read().unwrap().values().cloned().collect();
        for c in snapshot {
            if c.matches_subscription(SERVER, identifier) {
                let seq = c.next_event_sequence();
                let env = Envelope::response(EnvelopeType::Event, SERVER, None, identifier.to_string(), seq, payload.clone());
                let _ = c.enqueue(env).await;
            }
        }
    }

    /// Removes `client` from the table, completes every forwarded call it
    /// was still expected to answer with status `-1`, and (if it had
    /// reached `connected`) emits `event.disconnected`.
    pub async fn unregister(&self, client: &Arc<BrokerClient>, reason: CloseReason) {
        let was_connected = client.is_connected();
        self.clients.write().unwrap().remove(&client.identifier);
        for (origin, identifier, sequence) in client.drain_waits() {
            let found = self.clients.read().unwrap().get(&origin).cloned();
            if let Some(o) = found {
                let _ = o
                    .enqueue(Envelope::result(o.identifier.clone(), identifier, sequence, -1, json!({})))
                    .await;
            }
        }
        if was_connected {
            self.publish_server_event(
                event::DISCONNECTED,
                json!({ "source": client.identifier, "reason": reason.as_str() }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client(db: &BrokerDb, name: &str) -> (Arc<BrokerClient>, async_channel::Receiver<OutboundFrame>) {
        let (tx, rx) = async_channel::bounded(32);
        let c = Arc::new(BrokerClient::new(name.to_owned(), None, tx));
        c.mark_connected();
        db.clients.write().unwrap().insert(name.to_owned(), c.clone());
        (c, rx)
    }

    #[tokio::test]
    async fn subscribe_then_publish_to_subscribers() {
        let db = BrokerDb::new(None, 1 << 20);
        let (a, a_rx) = make_client(&db, "A");
        let (b, _b_rx) = make_client(&db, "B");

        let sub_env = Envelope::response(
            EnvelopeType::Command,
            "A".to_owned(),
            Some(SERVER.to_owned()),
            command::SUBSCRIBE,
            1,
            json!({ "source": crate::SOURCE_ALL, "event": "demo" }),
        );
        let (reply, close) = db.dispatch(&a, sub_env).await;
        assert!(close.is_none());
        assert_eq!(reply.unwrap().status, Some(0));

        let pub_env = Envelope::response(
            EnvelopeType::Command,
            "B".to_owned(),
            Some(SERVER.to_owned()),
            command::EVENT,
            2,
            json!({ "destination": DESTINATION_SUBSCRIBERS, "identifier": "demo", "payload": {"n": 7} }),
        );
        let (reply, _close) = db.dispatch(&b, pub_env).await;
        assert_eq!(reply.unwrap().status, Some(0));

        let (delivered, _compression) = a_rx.try_recv().unwrap();
        assert_eq!(delivered.kind, EnvelopeType::Event);
        assert_eq!(delivered.source.as_deref(), Some("B"));
        assert_eq!(delivered.identifier, "demo");
        assert_eq!(delivered.payload, json!({ "n": 7 }));
    }

    #[tokio::test]
    async fn forward_to_unregistered_command_fails_immediately() {
        let db = BrokerDb::new(None, 1 << 20);
        let (a, _a_rx) = make_client(&db, "A");
        let (_b, _b_rx) = make_client(&db, "B");

        let call = Envelope::response(
            EnvelopeType::Command,
            "A".to_owned(),
            Some("B".to_owned()),
            "sum",
            5,
            json!({}),
        );
        let (reply, _close) = db.dispatch(&a, call).await;
        let reply = reply.unwrap();
        assert_ne!(reply.status, Some(0));
    }

    #[tokio::test]
    async fn command_round_trip() {
        let db = BrokerDb::new(None, 1 << 20);
        let (a, a_rx) = make_client(&db, "A");
        let (b, b_rx) = make_client(&db, "B");
        a.add_command("sum");

        let call = Envelope::response(
            EnvelopeType::Command,
            "B".to_owned(),
            Some("A".to_owned()),
            "sum",
            5,
            json!({"a":1,"b":2}),
        );
        let (reply, _close) = db.dispatch(&b, call).await;
        assert!(reply.is_none());

        let (forwarded, _c) = a_rx.try_recv().unwrap();
        assert_eq!(forwarded.source.as_deref(), Some("B"));
        assert_eq!(forwarded.sequence, 5);

        let result_env = Envelope::response(
            EnvelopeType::Command,
            "A".to_owned(),
            Some(SERVER.to_owned()),
            command::RESULT,
            9,
            json!({"destination":"B","identifier":"sum","sequence":5,"status":0,"payload":{"r":3}}),
        );
        let (ack, _close) = db.dispatch(&a, result_env).await;
        assert_eq!(ack.unwrap().status, Some(0));

        let (result, _c) = b_rx.try_recv().unwrap();
        assert_eq!(result.kind, EnvelopeType::Result);
        assert_eq!(result.sequence, 5);
        assert_eq!(result.status, Some(0));
        assert_eq!(result.payload, json!({"r": 3}));
    }

    #[tokio::test]
    async fn disconnect_completes_pending_waits_with_minus_one() {
        let db = BrokerDb::new(None, 1 << 20);
        let (a, a_rx) = make_client(&db, "A");
        let (b, _b_rx) = make_client(&db, "B");
        b.add_command("sum");
        b.add_wait(("A".to_owned(), "sum".to_owned(), 5));

        db.unregister(&b, CloseReason::ConnectionClosed).await;

        let (result, _c) = a_rx.try_recv().unwrap();
        assert_eq!(result.status, Some(-1));
        assert_eq!(result.sequence, 5);
        let _ = a; // keep alive for clarity
    }
}

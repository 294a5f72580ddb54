use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::envelope::{Envelope, SequenceCounter};
use crate::error::Error;
use crate::frame::Compression;
use crate::subscription::{CommandSet, Subscription, SubscriptionSet};

/// Correlates a forwarded call awaiting `command.result`: the caller's
/// identifier, the command identifier, and the original sequence.
pub type WaitKey = (String, String, u32);

/// One outbound envelope tagged with the compression that was in effect at
/// the moment it was enqueued. Tagging per-item (rather than having the
/// writer task read a shared "current compression" cell) is what lets
/// `command.create`'s own reply go out uncompressed even though the
/// negotiated compression is recorded immediately afterwards: the envelopes
/// already in flight keep whatever was true when they were queued.
pub type OutboundFrame = (Envelope, Compression);

pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
    pub threshold: u32,
    last_recv: Instant,
    missed: u32,
}

impl Keepalive {
    pub fn new(interval: Duration, timeout: Duration, threshold: u32) -> Self {
        Self {
            interval,
            timeout,
            threshold,
            // set to `now - interval` at create, per §4.6
            last_recv: Instant::now()
                .checked_sub(interval)
                .unwrap_or_else(Instant::now),
            missed: 0,
        }
    }

    pub fn note_ping(&mut self) {
        self.last_recv = Instant::now();
        self.missed = 0;
    }

    /// One reactor sweep. Returns `true` if the threshold was exceeded and
    /// the connection must be closed.
    pub fn sweep(&mut self) -> bool {
        let now = Instant::now();
        if now > self.last_recv + self.interval + self.timeout {
            self.missed += 1;
            self.last_recv += self.interval;
        }
        self.missed > self.threshold
    }
}

struct ClientState {
    subscriptions: SubscriptionSet,
    commands: CommandSet,
    waits: HashSet<WaitKey>,
    publish_sequence: SequenceCounter,
    event_sequence: SequenceCounter,
    keepalive: Option<Keepalive>,
    compression: Compression,
    connected: bool,
}

/// Broker-side per-connection state: identity, outbound queue,
/// subscriptions/commands/waits, and keepalive fields (spec §3).
pub struct BrokerClient {
    pub identifier: String,
    pub address: Option<String>,
    tx: async_channel::Sender<OutboundFrame>,
    /// Signalled to make the connection's reader loop tear down: keepalive
    /// eviction, `command.close`, or broker shutdown.
    pub disconnect: Notify,
    state: Mutex<ClientState>,
}

impl BrokerClient {
    pub fn new(
        identifier: String,
        address: Option<String>,
        tx: async_channel::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            identifier,
            address,
            tx,
            disconnect: Notify::new(),
            state: Mutex::new(ClientState {
                subscriptions: SubscriptionSet::new(),
                commands: CommandSet::new(),
                waits: HashSet::new(),
                publish_sequence: SequenceCounter::new(),
                event_sequence: SequenceCounter::new(),
                keepalive: None,
                compression: Compression::None,
                connected: false,
            }),
        }
    }

    pub async fn enqueue(&self, env: Envelope) -> Result<(), Error> {
        let compression = self.state.lock().unwrap().compression;
        self.tx.send((env, compression)).await.map_err(Into::into)
    }

    pub fn set_compression(&self, c: Compression) {
        self.state.lock().unwrap().compression = c;
    }

    pub fn compression(&self) -> Compression {
        self.state.lock().unwrap().compression
    }

    pub fn mark_connected(&self) {
        self.state.lock().unwrap().connected = true;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn add_subscription(&self, source: &str, event: &str) {
        self.state.lock().unwrap().subscriptions.add(source, event);
    }

    pub fn remove_subscription(&self, source: &str, event: &str) -> bool {
        self.state.lock().unwrap().subscriptions.remove(source, event)
    }

    pub fn matches_subscription(&self, src: &str, id: &str) -> bool {
        self.state.lock().unwrap().subscriptions.matches(src, id)
    }

    pub fn subscriptions_snapshot(&self) -> Vec<Subscription> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .cloned()
            .collect()
    }

    pub fn add_command(&self, identifier: &str) {
        self.state.lock().unwrap().commands.add(identifier);
    }

    pub fn remove_command(&self, identifier: &str) -> bool {
        self.state.lock().unwrap().commands.remove(identifier)
    }

    pub fn has_command(&self, identifier: &str) -> bool {
        self.state.lock().unwrap().commands.contains(identifier)
    }

    pub fn commands_snapshot(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.iter().cloned().collect()
    }

    pub fn next_publish_sequence(&self) -> u32 {
        self.state.lock().unwrap().publish_sequence.next()
    }

    pub fn next_event_sequence(&self) -> u32 {
        self.state.lock().unwrap().event_sequence.next()
    }

    pub fn add_wait(&self, key: WaitKey) {
        self.state.lock().unwrap().waits.insert(key);
    }

    pub fn take_wait(&self, key: &WaitKey) -> bool {
        self.state.lock().unwrap().waits.remove(key)
    }

    pub fn drain_waits(&self) -> Vec<WaitKey> {
        self.state.lock().unwrap().waits.drain().collect()
    }

    pub fn set_keepalive(&self, keepalive: Option<Keepalive>) {
        self.state.lock().unwrap().keepalive = keepalive;
    }

    pub fn has_keepalive(&self) -> bool {
        self.state.lock().unwrap().keepalive.is_some()
    }

    pub fn note_ping(&self) {
        if let Some(k) = self.state.lock().unwrap().keepalive.as_mut() {
            k.note_ping();
        }
    }

    /// Runs one keepalive sweep; returns `true` if the threshold was
    /// exceeded and the connection should be closed.
    pub fn sweep_keepalive(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .keepalive
            .as_mut()
            .map(Keepalive::sweep)
            .unwrap_or(false)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.state.lock().unwrap().keepalive.as_ref().map(|k| k.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make() -> (Arc<BrokerClient>, async_channel::Receiver<OutboundFrame>) {
        let (tx, rx) = async_channel::bounded(8);
        (Arc::new(BrokerClient::new("peer.a".into(), None, tx)), rx)
    }

    #[test]
    fn subscription_roundtrip() {
        let (c, _rx) = make();
        c.add_subscription("peer.b", "demo");
        assert!(c.matches_subscription("peer.b", "demo"));
        assert!(c.remove_subscription("peer.b", "demo"));
        assert!(!c.matches_subscription("peer.b", "demo"));
    }

    #[test]
    fn wait_table_roundtrip() {
        let (c, _rx) = make();
        let key = ("peer.b".to_owned(), "sum".to_owned(), 5);
        c.add_wait(key.clone());
        assert!(c.take_wait(&key));
        assert!(!c.take_wait(&key));
    }

    #[test]
    fn keepalive_sweep_trips_after_threshold() {
        let ka = Keepalive {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(0),
            threshold: 1,
            last_recv: Instant::now() - Duration::from_millis(10),
            missed: 0,
        };
        let (c, _rx) = make();
        c.set_keepalive(Some(ka));
        assert!(!c.sweep_keepalive()); // missed=1, threshold=1 -> not yet exceeded
        assert!(c.sweep_keepalive()); // missed=2 > 1 -> exceeded
    }

    #[tokio::test]
    async fn create_reply_keeps_pre_switch_compression_tag() {
        let (c, rx) = make();
        c.enqueue(Envelope::result("peer.a", "command.create", 1, 0, serde_json::json!({})))
            .await
            .unwrap();
        c.set_compression(Compression::Zlib);
        c.enqueue(Envelope::response(
            crate::envelope::EnvelopeType::Event,
            "peer.b",
            None,
            "demo",
            1,
            serde_json::json!({}),
        ))
        .await
        .unwrap();
        let (_, first_compression) = rx.recv().await.unwrap();
        let (_, second_compression) = rx.recv().await.unwrap();
        assert_eq!(first_compression, Compression::None);
        assert_eq!(second_compression, Compression::Zlib);
    }
}

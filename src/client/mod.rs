//! The client-side protocol engine: connect/handshake, request queueing,
//! in-flight correlation, subscription/routine dispatch, and keepalive.
//!
//! Unlike the broker side (one task per accepted connection), a `Client` is
//! one task *owned* by the struct: `Client::connect` performs the TCP
//! connect and `command.create` handshake, then hands the live socket to a
//! background reactor task. Host code talks to that task over a command
//! channel; the socket and the subscription/routine tables never leave the
//! reactor task, so no lock is needed around callback invocation.

mod reactor;

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// An inbound event delivered to a subscription callback.
#[derive(Clone, Debug)]
pub struct Event {
    pub source: String,
    pub identifier: String,
    pub payload: Value,
}

/// A subscription callback. `async-trait` lets host code implement this
/// with an `async fn` body instead of hand-writing boxed futures.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// A registered command's handler; returns the status code and payload to
/// send back as the `command.result`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> (i64, Value);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: Event) {
        (self)(event).await
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = (i64, Value)> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> (i64, Value) {
        (self)(payload).await
    }
}

/// `ClientState` per spec.md §3: the host-observable connection phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    Unknown = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Disconnected,
            _ => ConnectionState::Unknown,
        }
    }
}

/// Configuration for `Client::connect`.
pub struct ClientOptions {
    pub identifier: Option<String>,
    pub password: Option<String>,
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Option<Duration>,
    pub ping_threshold: u32,
    /// If set, the reactor reconnects this long after a transport-level
    /// disconnect instead of settling into `Disconnected` for good.
    pub connect_interval: Option<Duration>,
    pub default_timeout: Duration,
    pub compressions: Vec<crate::Compression>,
    /// Invoked for an inbound event that no subscription matches — the
    /// direct-identifier delivery case (§4.5) bypasses subscriptions
    /// entirely, so without this slot such events have no callback at all.
    pub global_handler: Option<Arc<dyn EventHandler>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            identifier: None,
            password: None,
            ping_interval: None,
            ping_timeout: None,
            ping_threshold: 3,
            connect_interval: None,
            default_timeout: Duration::from_secs(5),
            compressions: vec![crate::Compression::Zlib, crate::Compression::None],
            global_handler: None,
        }
    }
}

pub(crate) enum Command {
    Publish {
        destination: String,
        identifier: String,
        payload: Value,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        source: String,
        event: String,
        handler: Arc<dyn EventHandler>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unsubscribe {
        source: String,
        event: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Register {
        identifier: String,
        handler: Arc<dyn CommandHandler>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unregister {
        identifier: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Call {
        destination: String,
        identifier: String,
        payload: Value,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
    Disconnect,
}

/// A handle to a running client reactor. Cheap to clone; every clone talks
/// to the same background task.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicU8>,
    identifier: Arc<std::sync::RwLock<Option<String>>>,
}

impl Client {
    /// Connects to `addr`, performs the `command.create` handshake, and
    /// spawns the background reactor. Returns once the handshake's result
    /// has been parsed (state = `Connected`).
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self, Error> {
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));
        let identifier = Arc::new(std::sync::RwLock::new(None));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let (ready_tx, ready_rx) = oneshot::channel();
        reactor::spawn(
            addr.to_owned(),
            options,
            cmd_rx,
            state.clone(),
            identifier.clone(),
            ready_tx,
        );
        ready_rx.await.map_err(|_| Error::internal("reactor exited before handshake"))??;

        Ok(Self {
            cmd_tx,
            state,
            identifier,
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier.read().unwrap().clone()
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    pub async fn publish(&self, destination: &str, identifier: &str, payload: Value) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                destination: destination.to_owned(),
                identifier: identifier.to_owned(),
                payload,
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }

    pub async fn subscribe(
        &self,
        source: &str,
        event: &str,
        handler: impl EventHandler + 'static,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                source: source.to_owned(),
                event: event.to_owned(),
                handler: Arc::new(handler),
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }

    pub async fn unsubscribe(&self, source: &str, event: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe {
                source: source.to_owned(),
                event: event.to_owned(),
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }

    pub async fn register(&self, identifier: &str, handler: impl CommandHandler + 'static) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                identifier: identifier.to_owned(),
                handler: Arc::new(handler),
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }

    pub async fn unregister(&self, identifier: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unregister {
                identifier: identifier.to_owned(),
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }

    /// Invokes a command registered by `destination`, waiting up to
    /// `timeout` for its result.
    pub async fn call(
        &self,
        destination: &str,
        identifier: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                destination: destination.to_owned(),
                identifier: identifier.to_owned(),
                payload,
                timeout,
                reply,
            })
            .map_err(|_| Error::not_registered())?;
        rx.await.map_err(|_| Error::canceled())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::timeout;

    async fn free_addr() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn connect_assigns_an_identifier() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let client = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        assert!(client.is_connected());
        assert!(client.identifier().unwrap().starts_with(crate::CLIENT_PREFIX));
        assert_eq!(broker.connected_count(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_a_matching_subscriber() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let publisher = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let subscriber = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let publisher_id = publisher.identifier().unwrap();

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        subscriber
            .subscribe(&publisher_id, "demo.ping", move |event: Event| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(event);
                    }
                }
            })
            .await
            .unwrap();

        publisher
            .publish(crate::DESTINATION_SUBSCRIBERS, "demo.ping", json!({ "n": 1 }))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(event.source, publisher_id);
        assert_eq!(event.identifier, "demo.ping");
        assert_eq!(event.payload, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let publisher = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let subscriber = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let publisher_id = publisher.identifier().unwrap();

        let seen = Arc::new(Mutex::new(0u32));
        let counter = seen.clone();
        subscriber
            .subscribe(&publisher_id, "demo.ping", move |_event: Event| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                }
            })
            .await
            .unwrap();
        subscriber.unsubscribe(&publisher_id, "demo.ping").await.unwrap();

        publisher
            .publish(crate::DESTINATION_SUBSCRIBERS, "demo.ping", json!({}))
            .await
            .unwrap();
        // No result round-trip exists for a dropped event; settle for a
        // generous wait and check nothing arrived.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn call_invokes_a_registered_command() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let callee = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let caller = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        callee
            .register("demo.echo", |payload: Value| async move { (0, payload) })
            .await
            .unwrap();

        let callee_id = callee.identifier().unwrap();
        let result = timeout(
            Duration::from_secs(2),
            caller.call(&callee_id, "demo.echo", json!({ "x": 7 }), Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result, json!({ "x": 7 }));
    }

    #[tokio::test]
    async fn call_against_unregistered_command_fails() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let callee = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let caller = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        let callee_id = callee.identifier().unwrap();

        let result = caller
            .call(&callee_id, "demo.missing", json!({}), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnect_settles_the_reactor() {
        let addr = free_addr().await;
        let broker = Broker::new();
        broker.spawn_tcp_server(&addr).await.unwrap();

        let client = Client::connect(&addr, ClientOptions::default()).await.unwrap();
        client.disconnect().await;

        for _ in 0..50 {
            if client.state() == ConnectionState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.publish(crate::SERVER, "x", json!({})).await.is_err());
    }
}

//! A lightweight message bus: a central broker that mediates named,
//! JSON-payload messages between concurrent clients, plus the client-side
//! protocol engine that talks to it.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod subscription;

#[cfg(feature = "broker")]
pub mod broker;

#[cfg(feature = "client")]
pub mod client;

pub use error::{Error, ErrorKind};
pub use frame::Compression;

/// The broker's own pseudo-identifier, destination for built-in commands.
pub const SERVER: &str = "org.mbus.server";

/// Prefix the broker mints auto-generated client identifiers under.
pub const CLIENT_PREFIX: &str = "org.mbus.client.";

/// Subscription source wildcard.
pub const SOURCE_ALL: &str = "org.mbus.method.event.source.all";

/// Subscription event wildcard.
pub const EVENT_ALL: &str = "org.mbus.method.event.identifier.all";

/// Fan out to every other connected client regardless of subscriptions.
pub const DESTINATION_ALL: &str = "org.mbus.method.event.destination.all";

/// Fan out to every client whose subscription set matches `(source, identifier)`.
pub const DESTINATION_SUBSCRIBERS: &str = "org.mbus.method.event.destination.subscribers";

pub mod method_type {
    pub const COMMAND: &str = "org.mbus.method.type.command";
    pub const EVENT: &str = "org.mbus.method.type.event";
    pub const RESULT: &str = "org.mbus.method.type.result";
}

pub mod command {
    pub const CREATE: &str = "command.create";
    pub const SUBSCRIBE: &str = "command.subscribe";
    pub const UNSUBSCRIBE: &str = "command.unsubscribe";
    pub const REGISTER: &str = "command.register";
    pub const UNREGISTER: &str = "command.unregister";
    pub const EVENT: &str = "command.event";
    pub const RESULT: &str = "command.result";
    pub const STATUS: &str = "command.status";
    pub const CLIENT: &str = "command.client";
    pub const CLIENTS: &str = "command.clients";
    pub const CLOSE: &str = "command.close";
}

pub mod event {
    pub const PING: &str = "org.mbus.server.event.ping";
    pub const PONG: &str = "org.mbus.server.event.pong";
    pub const CONNECTED: &str = "org.mbus.server.event.connected";
    pub const DISCONNECTED: &str = "org.mbus.server.event.disconnected";
    pub const SUBSCRIBED: &str = "org.mbus.server.event.subscribed";
    pub const UNSUBSCRIBED: &str = "org.mbus.server.event.unsubscribed";
    pub const REGISTERED: &str = "org.mbus.server.event.registered";
    pub const UNREGISTERED: &str = "org.mbus.server.event.unregistered";
}

/// Reasons a `disconnected` event or internal close can carry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    CloseCommand,
    PingThreshold,
    ConnectionClosed,
    InternalError,
    Unknown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::CloseCommand => "close_command",
            CloseReason::PingThreshold => "ping_threshold",
            CloseReason::ConnectionClosed => "connection_closed",
            CloseReason::InternalError => "internal_error",
            CloseReason::Unknown => "unknown",
        }
    }
}

/// Default size of the per-connection inbound/outbound buffer growth chunk.
pub const BUFFER_CHUNK: usize = 4096;

/// Default bounded outbound queue depth per client.
pub const DEFAULT_QUEUE_SIZE: usize = 8192;

/// Default broker reactor iteration bound (§4.8).
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_identifiers_are_stable_wire_strings() {
        assert_eq!(SERVER, "org.mbus.server");
        assert_eq!(CLIENT_PREFIX, "org.mbus.client.");
        assert_eq!(event::PING, "org.mbus.server.event.ping");
    }
}

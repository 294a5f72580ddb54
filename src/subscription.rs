//! Per-client subscription and command-registration tables.
//!
//! Matching is byte-wise string equality against the two wildcard
//! sentinels — never globbing or regex (see spec §9 "Wildcards as values").

use std::collections::HashSet;

use crate::{SOURCE_ALL, EVENT_ALL};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Subscription {
    pub source: String,
    pub event: String,
}

impl Subscription {
    pub fn new(source: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            event: event.into(),
        }
    }

    fn matches(&self, src: &str, id: &str) -> bool {
        (self.source == SOURCE_ALL || self.source == src)
            && (self.event == EVENT_ALL || self.event == id)
    }
}

/// A client's set of `(source, event)` subscription filters.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionSet(HashSet<Subscription>);

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription. Duplicate subscribe is a no-op success, so the
    /// return value distinguishes "already present" from "newly added" only
    /// for observability; both are Ok.
    pub fn add(&mut self, source: impl Into<String>, event: impl Into<String>) {
        self.0.insert(Subscription::new(source, event));
    }

    pub fn remove(&mut self, source: &str, event: &str) -> bool {
        self.0.remove(&Subscription::new(source, event))
    }

    /// True iff some subscription in the set matches `(src, id)` per §4.3.
    pub fn matches(&self, src: &str, id: &str) -> bool {
        self.0.iter().any(|s| s.matches(src, id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A client's set of registered command identifiers.
#[derive(Clone, Debug, Default)]
pub struct CommandSet(HashSet<String>);

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, command: impl Into<String>) {
        self.0.insert(command.into());
    }

    pub fn remove(&mut self, command: &str) -> bool {
        self.0.remove(command)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.0.contains(command)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        let mut s = SubscriptionSet::new();
        s.add("peer.a", "demo");
        assert!(s.matches("peer.a", "demo"));
        assert!(!s.matches("peer.b", "demo"));
    }

    #[test]
    fn wildcard_source_and_event_are_reflexive() {
        let mut s = SubscriptionSet::new();
        s.add(SOURCE_ALL, EVENT_ALL);
        assert!(s.matches("anyone", "anything"));
    }

    #[test]
    fn duplicate_subscribe_is_idempotent() {
        let mut s = SubscriptionSet::new();
        s.add("peer.a", "demo");
        s.add("peer.a", "demo");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn command_set_tracks_registration() {
        let mut c = CommandSet::new();
        c.add("sum");
        assert!(c.contains("sum"));
        assert!(c.remove("sum"));
        assert!(!c.contains("sum"));
    }
}

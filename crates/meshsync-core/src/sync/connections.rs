//! Live peer connection registry
//!
//! The mediator owns one [`ConnectionManager`] and passes it around instead
//! of consulting process-wide state. Entries are keyed by the transport's
//! peer key.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::protocol::{ConnectSyncModeDecision, ConnectSyncModeReason, NegotiatedCapabilities, SyncMode};

/// What this node knows about one connected peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub peer_key: String,
    /// Name from the peer's `hello`/`ping`, "anon" until then
    pub node_name: String,
    /// This node opened the connection and drives sessions on it
    pub is_initiator: bool,
    #[serde(skip)]
    pub capabilities: Option<NegotiatedCapabilities>,
    /// `None` until negotiated, or when sync was refused
    pub sync_mode: Option<SyncMode>,
    pub mode_reason: Option<ConnectSyncModeReason>,
    pub has_active_session: bool,
    pub connected_at_ms: i64,
    pub last_seen_ms: i64,
    pub last_repair_at_ms: Option<i64>,
}

impl ConnectionState {
    fn new(peer_key: &str, is_initiator: bool, now_ms: i64) -> Self {
        Self {
            peer_key: peer_key.to_string(),
            node_name: "anon".to_string(),
            is_initiator,
            capabilities: None,
            sync_mode: None,
            mode_reason: None,
            has_active_session: false,
            connected_at_ms: now_ms,
            last_seen_ms: now_ms,
            last_repair_at_ms: None,
        }
    }

    /// Shortened key for logs: first and last four characters
    pub fn short_name(&self) -> String {
        short_name(&self.peer_key)
    }
}

pub fn short_name(peer_key: &str) -> String {
    if peer_key.len() <= 9 || !peer_key.is_ascii() {
        return peer_key.to_string();
    }
    format!("{}-{}", &peer_key[..4], &peer_key[peer_key.len() - 4..])
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    peers: RwLock<HashMap<String, ConnectionState>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns false if the peer was already known.
    pub fn add(&self, peer_key: &str, is_initiator: bool, now_ms: i64) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(peer_key) {
            return false;
        }
        peers.insert(
            peer_key.to_string(),
            ConnectionState::new(peer_key, is_initiator, now_ms),
        );
        true
    }

    pub fn remove(&self, peer_key: &str) -> Option<ConnectionState> {
        self.peers.write().remove(peer_key)
    }

    pub fn get(&self, peer_key: &str) -> Option<ConnectionState> {
        self.peers.read().get(peer_key).cloned()
    }

    pub fn contains(&self, peer_key: &str) -> bool {
        self.peers.read().contains_key(peer_key)
    }

    /// Apply `f` to a peer's state; false if the peer is unknown
    pub fn update(&self, peer_key: &str, f: impl FnOnce(&mut ConnectionState)) -> bool {
        match self.peers.write().get_mut(peer_key) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, peer_key: &str, now_ms: i64) -> bool {
        self.update(peer_key, |s| s.last_seen_ms = now_ms)
    }

    pub fn set_node_name(&self, peer_key: &str, node_name: &str) -> bool {
        self.update(peer_key, |s| s.node_name = node_name.to_string())
    }

    pub fn set_negotiated(
        &self,
        peer_key: &str,
        capabilities: NegotiatedCapabilities,
        decision: ConnectSyncModeDecision,
    ) -> bool {
        self.update(peer_key, |s| {
            s.capabilities = Some(capabilities);
            s.sync_mode = decision.mode;
            s.mode_reason = Some(decision.reason);
        })
    }

    pub fn sync_mode(&self, peer_key: &str) -> Option<SyncMode> {
        self.peers.read().get(peer_key).and_then(|s| s.sync_mode)
    }

    /// Mark a session active; false if unknown or one is already running.
    pub fn begin_session(&self, peer_key: &str) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(peer_key) {
            Some(state) if !state.has_active_session => {
                state.has_active_session = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the active flag; `repaired_at_ms` records a finished repair.
    pub fn end_session(&self, peer_key: &str, repaired_at_ms: Option<i64>) -> bool {
        self.update(peer_key, |s| {
            s.has_active_session = false;
            if repaired_at_ms.is_some() {
                s.last_repair_at_ms = repaired_at_ms;
            }
        })
    }

    /// Sessions running across all connections
    pub fn active_sessions(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|s| s.has_active_session)
            .count()
    }

    pub fn peer_keys(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ConnectionState> {
        let mut states: Vec<_> = self.peers.read().values().cloned().collect();
        states.sort_by(|a, b| a.peer_key.cmp(&b.peer_key));
        states
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Drop peers not seen for longer than `timeout_ms`
    pub fn expire_stale(&self, now_ms: i64, timeout_ms: i64) -> Vec<ConnectionState> {
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .values()
            .filter(|s| now_ms.saturating_sub(s.last_seen_ms) > timeout_ms)
            .map(|s| s.peer_key.clone())
            .collect();
        stale.iter().filter_map(|key| peers.remove(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::{choose_connect_sync_mode, normalize_peer_capabilities, PeerCapabilities};

    #[test]
    fn test_add_and_negotiate() {
        let manager = ConnectionManager::new();
        assert!(manager.add("peer-a", true, 1_000));
        assert!(!manager.add("peer-a", false, 2_000));
        assert_eq!(manager.get("peer-a").unwrap().node_name, "anon");

        let caps = normalize_peer_capabilities(Some(&PeerCapabilities::local(true)));
        let decision = choose_connect_sync_mode(&caps, 1, true, true);
        assert!(manager.set_negotiated("peer-a", caps, decision));
        assert_eq!(manager.sync_mode("peer-a"), Some(SyncMode::Negentropy));
        assert!(!manager.set_node_name("missing", "x"));
    }

    #[test]
    fn test_single_session_per_connection() {
        let manager = ConnectionManager::new();
        manager.add("a", true, 0);
        manager.add("b", true, 0);
        assert!(manager.begin_session("a"));
        assert!(!manager.begin_session("a"));
        assert!(!manager.begin_session("missing"));
        assert_eq!(manager.active_sessions(), 1);

        manager.end_session("a", Some(500));
        assert_eq!(manager.active_sessions(), 0);
        assert_eq!(manager.get("a").unwrap().last_repair_at_ms, Some(500));
        manager.end_session("a", None);
        assert_eq!(manager.get("a").unwrap().last_repair_at_ms, Some(500));
    }

    #[test]
    fn test_expire_stale() {
        let manager = ConnectionManager::new();
        manager.add("old", false, 0);
        manager.add("fresh", false, 0);
        manager.touch("fresh", 150_000);

        let expired = manager.expire_stale(200_000, 180_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer_key, "old");
        assert_eq!(manager.peer_keys(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("0123456789abcdef"), "0123-cdef");
        assert_eq!(short_name("peer"), "peer");
    }
}

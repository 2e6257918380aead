//! # Session Store
//!
//! Per-device state for every authenticated, open device connection.
//!
//! Records live in a sharded [`DashMap`], so decoding a reply for one device
//! never waits on a poll round iterating the others. Every update replaces a
//! field while the record's shard lock is held, and readers clone a whole
//! record under the same lock: a reader sees either the old or the new state of
//! a record, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::codec::{ConsumptionSnapshot, ParameterLimits, ParametersMsg};
use crate::relay::UpstreamRelay;

/// Live state of one connected device.
#[derive(Debug)]
pub struct Session {
    /// Device identifier (MQTT client id)
    pub id: String,
    /// Identifies the local connection owning this session
    pub connection_id: u64,
    /// Outbound connection to the upstream broker, when relaying
    pub upstream: Option<UpstreamRelay>,
    /// Identity record from the device's BIRTH message
    pub birth: Option<HashMap<String, String>>,
    /// Last known int-valued parameters
    pub params: Option<HashMap<String, i32>>,
    /// Limits advertised with the last parameter reply
    pub param_limits: Option<HashMap<String, ParameterLimits>>,
    /// Last consumption report
    pub consumption: Option<ConsumptionSnapshot>,
    /// Last error list, kept as decoded
    pub errors: Option<ParametersMsg>,
}

impl Session {
    pub fn new(id: impl Into<String>, connection_id: u64, upstream: Option<UpstreamRelay>) -> Self {
        Session {
            id: id.into(),
            connection_id,
            upstream,
            birth: None,
            params: None,
            param_limits: None,
            consumption: None,
            errors: None,
        }
    }

    fn has_live_upstream(&self) -> bool {
        self.upstream.as_ref().is_some_and(UpstreamRelay::is_connected)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            upstream_connected: self.has_live_upstream(),
            birth: self.birth.clone(),
            params: self.params.clone(),
            param_limits: self.param_limits.clone(),
            consumption: self.consumption.clone(),
            errors: self.errors.clone(),
        }
    }
}

/// Point-in-time copy of a session's decoded state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub upstream_connected: bool,
    pub birth: Option<HashMap<String, String>>,
    pub params: Option<HashMap<String, i32>>,
    pub param_limits: Option<HashMap<String, ParameterLimits>>,
    pub consumption: Option<ConsumptionSnapshot>,
    pub errors: Option<ParametersMsg>,
}

/// Concurrency-safe registry of sessions keyed by device id.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    next_connection_id: AtomicU64,
    inserted: Notify,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new local connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a session, returning the one it displaced (a takeover by the same device id).
    pub fn insert(&self, session: Session) -> Option<Session> {
        info!(
            "📱 Session created: {} (connection {}, upstream: {})",
            session.id,
            session.connection_id,
            session.upstream.is_some()
        );
        let displaced = self.sessions.insert(session.id.clone(), session);
        self.inserted.notify_waiters();
        displaced
    }

    /// Remove the session of `device_id` if it still belongs to `connection_id`.
    ///
    /// Returns the removed session exactly once; later calls (and calls from a
    /// connection that was already taken over) return `None`.
    pub fn remove(&self, device_id: &str, connection_id: u64) -> Option<Session> {
        let removed = self
            .sessions
            .remove_if(device_id, |_, s| s.connection_id == connection_id)
            .map(|(_, s)| s);
        if removed.is_some() {
            info!("🗑️ Session removed: {} (connection {})", device_id, connection_id);
        }
        removed
    }

    /// Drain every session (process shutdown).
    pub fn drain(&self) -> Vec<Session> {
        let ids = self.device_ids();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(device_id).map(|s| s.snapshot())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// Clone of the upstream relay of a device, if it has one.
    pub fn upstream(&self, device_id: &str) -> Option<UpstreamRelay> {
        self.sessions.get(device_id).and_then(|s| s.upstream.clone())
    }

    fn update<F: FnOnce(&mut Session)>(&self, device_id: &str, f: F) -> bool {
        match self.sessions.get_mut(device_id) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => {
                debug!("No session for {}, update dropped", device_id);
                false
            }
        }
    }

    pub fn replace_birth(&self, device_id: &str, birth: HashMap<String, String>) -> bool {
        self.update(device_id, |s| s.birth = Some(birth))
    }

    pub fn replace_params(
        &self,
        device_id: &str,
        params: HashMap<String, i32>,
        limits: HashMap<String, ParameterLimits>,
    ) -> bool {
        self.update(device_id, |s| {
            s.params = Some(params);
            s.param_limits = Some(limits);
        })
    }

    pub fn replace_consumption(&self, device_id: &str, consumption: ConsumptionSnapshot) -> bool {
        self.update(device_id, |s| s.consumption = Some(consumption))
    }

    pub fn replace_errors(&self, device_id: &str, errors: ParametersMsg) -> bool {
        self.update(device_id, |s| s.errors = Some(errors))
    }

    /// Set a single parameter ahead of the device confirming it.
    ///
    /// The value stays visible until the next parameter reply replaces the map,
    /// whether or not the device accepted the write.
    pub fn update_param(&self, device_id: &str, key: &str, value: i32) -> bool {
        self.update(device_id, |s| {
            s.params
                .get_or_insert_with(HashMap::new)
                .insert(key.to_string(), value);
        })
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.iter().map(|s| s.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn has_live_upstream(&self) -> bool {
        self.sessions.iter().any(|s| s.has_live_upstream())
    }

    fn is_ready(&self, require_upstream: bool) -> bool {
        if require_upstream {
            self.has_live_upstream()
        } else {
            !self.is_empty()
        }
    }

    /// Wait until a session exists (with a live upstream when `require_upstream`).
    ///
    /// Woken by session inserts rather than polling the map.
    pub async fn wait_until_ready(&self, require_upstream: bool) {
        loop {
            let notified = self.inserted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_ready(require_upstream) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::codec::{Parameter, ParameterValue};

    #[test]
    fn test_insert_and_lookup() {
        let store = SessionStore::new();
        let conn = store.next_connection_id();
        assert!(store.insert(Session::new("gw-1", conn, None)).is_none());

        let snapshot = store.get("gw-1").unwrap();
        assert_eq!(snapshot.id, "gw-1");
        assert!(snapshot.birth.is_none());
        assert!(snapshot.params.is_none());
        assert!(!snapshot.upstream_connected);
        assert!(store.get("gw-2").is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = SessionStore::new();
        let conn = store.next_connection_id();
        store.insert(Session::new("gw-1", conn, None));

        assert!(store.remove("gw-1", conn).is_some());
        assert!(store.remove("gw-1", conn).is_none());
        assert!(store.get("gw-1").is_none());
    }

    #[test]
    fn test_stale_connection_does_not_remove_takeover() {
        let store = SessionStore::new();
        let old = store.next_connection_id();
        let new = store.next_connection_id();
        store.insert(Session::new("gw-1", old, None));

        let displaced = store.insert(Session::new("gw-1", new, None)).unwrap();
        assert_eq!(displaced.connection_id, old);

        assert!(store.remove("gw-1", old).is_none());
        assert_eq!(store.get("gw-1").map(|s| s.id), Some("gw-1".to_string()));
    }

    #[test]
    fn test_wholesale_replace() {
        let store = SessionStore::new();
        store.insert(Session::new("gw-1", 1, None));

        let mut params = HashMap::new();
        params.insert("T_22.1.3".to_string(), 500);
        params.insert("T_22.0.3".to_string(), 1);
        assert!(store.replace_params("gw-1", params, HashMap::new()));

        let mut params = HashMap::new();
        params.insert("T_22.1.3".to_string(), 450);
        assert!(store.replace_params("gw-1", params, HashMap::new()));

        let snapshot = store.get("gw-1").unwrap();
        let params = snapshot.params.unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["T_22.1.3"], 450);
    }

    #[test]
    fn test_update_param_without_prior_params() {
        let store = SessionStore::new();
        store.insert(Session::new("gw-1", 1, None));

        assert!(store.update_param("gw-1", "T_22.1.3", 600));
        assert_eq!(store.get("gw-1").unwrap().params.unwrap()["T_22.1.3"], 600);
        assert!(!store.update_param("gw-2", "T_22.1.3", 600));
    }

    #[test]
    fn test_errors_kept_raw() {
        let store = SessionStore::new();
        store.insert(Session::new("gw-1", 1, None));

        let errors = ParametersMsg {
            timestamp: 5,
            params: vec![Parameter::int("E_101", 3)],
            param_limits: None,
        };
        assert!(store.replace_errors("gw-1", errors.clone()));
        let stored = store.get("gw-1").unwrap().errors.unwrap();
        assert_eq!(stored, errors);
        assert_eq!(stored.params[0].value, Some(ParameterValue::Int(3)));
    }

    #[test]
    fn test_drain() {
        let store = SessionStore::new();
        store.insert(Session::new("gw-1", 1, None));
        store.insert(Session::new("gw-2", 2, None));
        assert_eq!(store.drain().len(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_ready_wakes_on_insert() {
        let store = Arc::new(SessionStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_until_ready(false).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.insert(Session::new("gw-1", 1, None));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on insert")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_upstream_ignores_local_only_sessions() {
        let store = SessionStore::new();
        store.insert(Session::new("gw-1", 1, None));

        let waited =
            tokio::time::timeout(Duration::from_millis(50), store.wait_until_ready(true)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_updates_and_iteration() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("gw-{}", i);
                store.insert(Session::new(id.clone(), i, None));
                for v in 0..100 {
                    store.update_param(&id, "T_22.1.3", v);
                    let _ = store.snapshots();
                }
                store.remove(&id, i);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(store.is_empty());
    }
}

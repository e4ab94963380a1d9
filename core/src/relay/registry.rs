//! Client Registry — the relay's single source of truth for who is online

use crate::signaling::envelope::{ClientProperties, ClientRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate client id: {0}")]
    DuplicateId(String),
    #[error("Client not found: {0}")]
    NotFound(String),
    #[error("Registry full ({0} clients)")]
    Full(usize),
}

/// Counters exposed for operational visibility
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Clients currently registered
    pub clients_active: usize,
    /// Total successful registrations since start
    pub clients_joined: u64,
    /// Total unregistrations since start
    pub clients_left: u64,
}

#[derive(Default)]
struct RegistryInner {
    /// id -> record
    records: HashMap<String, ClientRecord>,
    /// Insertion order, for deterministic roster snapshots
    order: Vec<String>,
    stats: RegistryStats,
}

/// Tracks connected clients. All operations are point-wise atomic: a
/// snapshot taken concurrently with a register/unregister sees a consistent
/// state, never a half-written record.
///
/// The registry holds no sockets and performs no I/O; the router owns the
/// connection table and passes this by reference.
pub struct ClientRegistry {
    max_clients: usize,
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    /// Create a registry bounded at `max_clients` concurrent registrations
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a new client. Fails if the id is already present; the
    /// existing registration always wins.
    pub fn register(
        &self,
        id: String,
        address: String,
        properties: ClientProperties,
    ) -> Result<ClientRecord, RegistryError> {
        let mut inner = self.inner.write();

        if inner.records.len() >= self.max_clients {
            return Err(RegistryError::Full(self.max_clients));
        }
        if inner.records.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        let record = ClientRecord {
            id: id.clone(),
            address,
            properties,
        };
        inner.records.insert(id.clone(), record.clone());
        inner.order.push(id);
        inner.stats.clients_joined += 1;
        inner.stats.clients_active = inner.records.len();
        Ok(record)
    }

    /// Remove a client. Idempotent: unregistering an absent id is a no-op
    /// and returns `None`.
    pub fn unregister(&self, id: &str) -> Option<ClientRecord> {
        let mut inner = self.inner.write();
        let removed = inner.records.remove(id);
        if removed.is_some() {
            inner.order.retain(|entry| entry != id);
            inner.stats.clients_left += 1;
            inner.stats.clients_active = inner.records.len();
        }
        removed
    }

    /// Look up a single client
    pub fn lookup(&self, id: &str) -> Result<ClientRecord, RegistryError> {
        self.inner
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// All current records in registration order, optionally excluding one id
    pub fn snapshot(&self, excluding: Option<&str>) -> Vec<ClientRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|id| excluding != Some(id.as_str()))
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.read().stats.clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn props(username: &str) -> ClientProperties {
        ClientProperties {
            username: username.to_string(),
            role: "participant".to_string(),
            joined_at: 0,
        }
    }

    fn test_registry() -> ClientRegistry {
        ClientRegistry::new(64)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = test_registry();
        let record = registry
            .register("a".to_string(), "127.0.0.1:1".to_string(), props("alice"))
            .expect("Failed to register");

        assert_eq!(record.id, "a");
        assert_eq!(registry.lookup("a").expect("lookup").properties.username, "alice");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_id_keeps_existing() {
        let registry = test_registry();
        registry
            .register("a".to_string(), "127.0.0.1:1".to_string(), props("first"))
            .expect("Failed to register");

        let result = registry.register("a".to_string(), "127.0.0.1:2".to_string(), props("second"));
        assert!(matches!(result, Err(RegistryError::DuplicateId(_))));

        // existing registration untouched
        let record = registry.lookup("a").expect("lookup");
        assert_eq!(record.properties.username, "first");
        assert_eq!(record.address, "127.0.0.1:1");
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = test_registry();
        registry
            .register("a".to_string(), "127.0.0.1:1".to_string(), props("alice"))
            .expect("Failed to register");

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.unregister("never-registered").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_registration_order() {
        let registry = test_registry();
        for id in ["c", "a", "b"] {
            registry
                .register(id.to_string(), "127.0.0.1:1".to_string(), props(id))
                .expect("Failed to register");
        }

        let ids: Vec<_> = registry.snapshot(None).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let ids: Vec<_> = registry
            .snapshot(Some("a"))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_snapshot_never_contains_unregistered() {
        let registry = test_registry();
        for round in 0..10u32 {
            let id = format!("peer-{}", round % 3);
            let _ = registry.register(id.clone(), "addr".to_string(), props(&id));
            if round % 2 == 0 {
                registry.unregister(&id);
            }

            let snapshot = registry.snapshot(None);
            let mut seen = std::collections::HashSet::new();
            for record in &snapshot {
                assert!(seen.insert(record.id.clone()), "duplicate id in snapshot");
                assert!(registry.contains(&record.id));
            }
        }
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ClientRegistry::new(2);
        registry
            .register("a".to_string(), "addr".to_string(), props("a"))
            .expect("Failed to register");
        registry
            .register("b".to_string(), "addr".to_string(), props("b"))
            .expect("Failed to register");

        let result = registry.register("c".to_string(), "addr".to_string(), props("c"));
        assert!(matches!(result, Err(RegistryError::Full(2))));
    }

    #[test]
    fn test_stats_tracking() {
        let registry = test_registry();
        registry
            .register("a".to_string(), "addr".to_string(), props("a"))
            .expect("Failed to register");
        registry
            .register("b".to_string(), "addr".to_string(), props("b"))
            .expect("Failed to register");
        registry.unregister("a");

        let stats = registry.stats();
        assert_eq!(stats.clients_active, 1);
        assert_eq!(stats.clients_joined, 2);
        assert_eq!(stats.clients_left, 1);
    }

    #[test]
    fn test_concurrent_register_snapshot() {
        let registry = std::sync::Arc::new(test_registry());
        let mut handles = Vec::new();

        for t in 0..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let id = format!("t{t}-{i}");
                    registry
                        .register(id.clone(), "addr".to_string(), props(&id))
                        .expect("Failed to register");
                    let snapshot = registry.snapshot(None);
                    assert!(snapshot.iter().any(|r| r.id == id));
                    registry.unregister(&id);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert!(registry.is_empty());
    }
}

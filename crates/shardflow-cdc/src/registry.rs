//! Lookup table from importer id to running importer.
//!
//! Acks usually arrive on a different task than the one running the
//! importer, often carrying nothing but the importer id and the ack id. The
//! [`ImporterRegistry`] routes them to the right instance. It is an ordinary
//! value: create one per process (or per test) and hand clones to whoever
//! needs it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::importer::Importer;
use crate::sink::AckId;

/// Shared map of running importers.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct ImporterRegistry {
    importers: Arc<RwLock<HashMap<String, Arc<Importer>>>>,
}

impl ImporterRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `importer` under `id`, replacing any previous entry.
    pub fn put(&self, id: impl Into<String>, importer: Arc<Importer>) {
        self.importers.write().insert(id.into(), importer);
    }

    /// Returns the importer registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Importer>> {
        self.importers.read().get(id).cloned()
    }

    /// Removes and returns the importer registered under `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<Importer>> {
        self.importers.write().remove(id)
    }

    /// Number of registered importers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.importers.read().len()
    }

    /// Returns `true` if no importer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.importers.read().is_empty()
    }

    /// Lists the registered importer ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.importers.read().keys().cloned().collect()
    }

    /// Routes an ack to the importer registered under `importer_id`.
    ///
    /// Returns `false` (and logs) if no such importer is registered.
    pub fn ack(&self, importer_id: &str, ack_id: &AckId) -> bool {
        // Release the read lock before acking; ack may take other locks.
        let Some(importer) = self.get(importer_id) else {
            warn!(importer_id, %ack_id, "ack for unregistered importer");
            return false;
        };
        importer.ack(ack_id);
        true
    }
}

impl std::fmt::Debug for ImporterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImporterRegistry")
            .field("importers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImporterConfig;
    use crate::testing::{member_with_channel, RecordingSink};

    fn importer(registry: &ImporterRegistry) -> Arc<Importer> {
        let (member, _channel, _progress) = member_with_channel("ds_0");
        Importer::new(
            ImporterConfig::default(),
            vec![member],
            Arc::new(RecordingSink::new()),
            None,
            registry.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let registry = ImporterRegistry::new();
        assert!(registry.is_empty());

        let importer = importer(&registry);
        registry.put("job-1", Arc::clone(&importer));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("job-1").unwrap(), &importer));
        assert_eq!(registry.ids(), vec!["job-1".to_string()]);

        assert!(registry.remove("job-1").is_some());
        assert!(registry.remove("job-1").is_none());
        assert!(registry.get("job-1").is_none());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = ImporterRegistry::new();
        let other = registry.clone();
        registry.put("job-1", importer(&registry));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_ack_for_unknown_importer() {
        let registry = ImporterRegistry::new();
        assert!(!registry.ack("missing", &AckId::new("x")));
    }

    #[test]
    fn test_ack_routes_to_importer() {
        let registry = ImporterRegistry::new();
        let importer = importer(&registry);
        registry.put("job-1", Arc::clone(&importer));

        assert!(registry.ack("job-1", &AckId::new("never-dispatched")));
        assert_eq!(importer.metrics().unknown_acks_total, 1);
    }
}

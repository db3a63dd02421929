//! Shared handles every dispatcher wakeup needs: the (read-only, shared)
//! flow registry plus the broker, storage, and trace collaborators.

use std::sync::Arc;

use broker::{BrokerAdapter, StorageAdapter};
use fdr::FlowRegistry;
use trace::TraceSink;

/// Constructed once per process and cheaply cloned into every dispatcher
/// wakeup.
#[derive(Clone)]
pub struct EngineDeps {
    pub registry: FlowRegistry,
    pub broker: Arc<dyn BrokerAdapter>,
    pub storage: Arc<dyn StorageAdapter>,
    pub trace: Arc<dyn TraceSink>,
}

impl EngineDeps {
    pub fn new(
        registry: FlowRegistry,
        broker: Arc<dyn BrokerAdapter>,
        storage: Arc<dyn StorageAdapter>,
        trace: Arc<dyn TraceSink>,
    ) -> Self {
        Self { registry, broker, storage, trace }
    }
}

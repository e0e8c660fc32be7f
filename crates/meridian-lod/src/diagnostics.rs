//! Injected diagnostics hook, replacing debug-flag branches in the walker.

use crate::change::EntityId;
use crate::node::NodeKey;

/// Receives per-node events from the walker. All methods default to no-ops.
pub trait Diagnostics: Send + Sync {
    fn node_visited(&self, _entity: EntityId, _key: &NodeKey, _sse: f64) {}
    fn content_requested(&self, _entity: EntityId, _key: &NodeKey, _priority: f64) {}
    fn content_attached(&self, _entity: EntityId, _key: &NodeKey, _primitives: u64) {}
    fn node_disposed(&self, _entity: EntityId, _key: &NodeKey) {}
    fn budget_applied(&self, _entity: EntityId, _displayed: u64, _budget: u64) {}
}

/// Diagnostics that record nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {}

/// Diagnostics emitted as trace-level `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn node_visited(&self, entity: EntityId, key: &NodeKey, sse: f64) {
        tracing::trace!(target: "meridian::diagnostics", %entity, node = %key, sse, "visit");
    }

    fn content_requested(&self, entity: EntityId, key: &NodeKey, priority: f64) {
        tracing::trace!(target: "meridian::diagnostics", %entity, node = %key, priority, "request");
    }

    fn content_attached(&self, entity: EntityId, key: &NodeKey, primitives: u64) {
        tracing::trace!(target: "meridian::diagnostics", %entity, node = %key, primitives, "attach");
    }

    fn node_disposed(&self, entity: EntityId, key: &NodeKey) {
        tracing::trace!(target: "meridian::diagnostics", %entity, node = %key, "dispose");
    }

    fn budget_applied(&self, entity: EntityId, displayed: u64, budget: u64) {
        tracing::trace!(target: "meridian::diagnostics", %entity, displayed, budget, "budget");
    }
}

/// Pick the diagnostics implementation selected by config.
#[must_use]
pub fn from_config(config: &meridian_config::DebugConfig) -> std::sync::Arc<dyn Diagnostics> {
    if config.diagnostics {
        std::sync::Arc::new(TracingDiagnostics)
    } else {
        std::sync::Arc::new(NoopDiagnostics)
    }
}

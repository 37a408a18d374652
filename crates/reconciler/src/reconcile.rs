//! The per-kind reconciliation contract.

use async_trait::async_trait;

use dprof_resources::ResourceObject;

use crate::error::Result;
use crate::monitor::MonitorHandle;

/// State an identity actor keeps between events.
pub struct IdentityState<M> {
    /// The completion monitor started for this identity, if any.
    pub monitor: Option<MonitorHandle>,
    /// Kind-specific memory.
    pub memory: M,
}

impl<M: Default> Default for IdentityState<M> {
    fn default() -> Self {
        Self {
            monitor: None,
            memory: M::default(),
        }
    }
}

impl<M> IdentityState<M> {
    /// Check if a monitor is still running.
    pub fn monitor_active(&self) -> bool {
        self.monitor.as_ref().is_some_and(MonitorHandle::is_active)
    }

    /// Install a monitor unless one is already running.
    ///
    /// Returns whether `start` was called.
    pub fn ensure_monitor(&mut self, start: impl FnOnce() -> MonitorHandle) -> bool {
        if self.monitor_active() {
            return false;
        }
        self.monitor = Some(start());
        true
    }

    /// Cancel the monitor and wait for it to let go.
    pub async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }
}

/// Drives one resource kind towards its declared state.
///
/// Calls for one identity never overlap; calls for different identities
/// run concurrently.
#[async_trait]
pub trait Reconcile: Clone + Send + Sync + 'static {
    /// Resource kind handled.
    type Resource: ResourceObject;

    /// What an identity remembers between events.
    type Memory: Default + Send + Sync + 'static;

    /// React to an Added or Modified event.
    async fn reconcile(
        &self,
        resource: Self::Resource,
        state: &mut IdentityState<Self::Memory>,
    ) -> Result<()>;

    /// React to a Deleted event: stop monitoring, then cancel backend jobs.
    async fn cleanup(&self, resource: Self::Resource, state: &mut IdentityState<Self::Memory>);
}

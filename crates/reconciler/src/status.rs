//! Conflict-safe status writes.

use std::sync::Arc;

use tracing::{debug, warn};

use dprof_resources::{Merge, MergeStatus, RejectReason, ResourceKey, ResourceObject};
use dprof_store::ResourceStore;

use crate::error::Result;

/// What a status write did.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<R> {
    /// The merged status was written; carries the stored resource.
    Written(R),
    /// The status already reflected the update.
    Unchanged(R),
    /// The update would break a status invariant and was dropped.
    Rejected(RejectReason),
    /// The resource no longer exists.
    Gone,
    /// Every attempt hit a version conflict; the update was dropped.
    GaveUp,
}

impl<R> WriteOutcome<R> {
    /// Check if the store now reflects the update.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Written(_) | Self::Unchanged(_))
    }

    /// The stored resource, when the update is reflected in it.
    pub fn into_resource(self) -> Option<R> {
        match self {
            Self::Written(resource) | Self::Unchanged(resource) => Some(resource),
            Self::Rejected(_) | Self::Gone | Self::GaveUp => None,
        }
    }

    /// Short name for logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Written(_) => "written",
            Self::Unchanged(_) => "unchanged",
            Self::Rejected(_) => "rejected",
            Self::Gone => "gone",
            Self::GaveUp => "gave-up",
        }
    }
}

/// Applies status deltas with optimistic concurrency.
///
/// Each attempt reads the resource, merges the delta into the fresh status
/// and patches it at the version it read. A version conflict triggers a
/// fresh read, up to `attempts` times.
pub struct StatusWriter<R: ResourceObject> {
    store: Arc<dyn ResourceStore<R>>,
    attempts: u32,
}

impl<R: ResourceObject> Clone for StatusWriter<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            attempts: self.attempts,
        }
    }
}

impl<R> StatusWriter<R>
where
    R: ResourceObject,
    R::Status: MergeStatus,
{
    pub fn new(store: Arc<dyn ResourceStore<R>>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    /// Merge `update` into the stored status and write it.
    pub async fn apply(
        &self,
        key: &ResourceKey,
        update: &<R::Status as MergeStatus>::Update,
    ) -> Result<WriteOutcome<R>> {
        for attempt in 1..=self.attempts {
            let fresh = match self.store.get(key).await {
                Ok(resource) => resource,
                Err(e) if e.is_not_found() => return Ok(WriteOutcome::Gone),
                Err(e) => return Err(e.into()),
            };

            let current = fresh.status().cloned().unwrap_or_default();
            let next = match current.merge(update) {
                Merge::Changed(next) => next,
                Merge::Unchanged => {
                    debug!(resource = %key, "status already up to date");
                    return Ok(WriteOutcome::Unchanged(fresh));
                }
                Merge::Rejected(reason) => {
                    debug!(resource = %key, reason = %reason, "status update rejected");
                    return Ok(WriteOutcome::Rejected(reason));
                }
            };

            let version = fresh.resource_version().unwrap_or_default().to_string();
            match self.store.patch_status(key, &version, &next).await {
                Ok(written) => {
                    debug!(resource = %key, phase = %next.current_phase(), "status written");
                    return Ok(WriteOutcome::Written(written));
                }
                Err(e) if e.is_conflict() => {
                    debug!(resource = %key, attempt, "status patch conflict, re-reading");
                }
                Err(e) if e.is_not_found() => return Ok(WriteOutcome::Gone),
                Err(e) => return Err(e.into()),
            }
        }

        warn!(resource = %key, attempts = self.attempts, "status patch kept conflicting, dropping update");
        Ok(WriteOutcome::GaveUp)
    }
}

//! Best-effort cancellation of backend jobs.

use tracing::{debug, info, warn};

use dprof_backends::Backends;
use dprof_resources::{JobHandle, ResourceKey};

use crate::strategy::BackendKind;

/// Deletes backend jobs that belonged to a deleted or failed resource.
///
/// Failures are logged and never retried; the resource is already gone.
#[derive(Clone)]
pub struct CleanupHandler {
    backends: Backends,
}

impl CleanupHandler {
    pub const fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// Cancel one job. Returns whether a delete call was issued.
    pub async fn cancel(&self, resource: &ResourceKey, handle: &JobHandle, backend: BackendKind) -> bool {
        let result = match backend {
            BackendKind::Profiling => self.backends.profiling.delete_job(handle).await,
            BackendKind::Cluster => self.backends.cluster.delete_batch_job(handle).await,
            BackendKind::Ml => {
                debug!(resource = %resource, job_handle = %handle, "synchronous job, nothing to cancel");
                return false;
            }
        };

        match result {
            Ok(()) => info!(resource = %resource, job_handle = %handle, backend = %backend, "backend job deleted"),
            Err(e) => warn!(resource = %resource, job_handle = %handle, backend = %backend, error = %e, "failed to delete backend job"),
        }
        true
    }

    /// Cancel every listed job.
    pub async fn cancel_all(&self, resource: &ResourceKey, jobs: &[(JobHandle, BackendKind)]) {
        for (handle, backend) in jobs {
            self.cancel(resource, handle, *backend).await;
        }
    }
}

//! Explicit per-job context passed from the planner down to providers.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_TENANT: &str = "default";
pub const DEFAULT_DATASTORE: &str = "default";

/// Identity and control handle of one running job.
///
/// Clones share the cancellation token, so cancelling any clone stops every
/// partition of the job at its next page boundary.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub datastore_id: String,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            tenant_id: DEFAULT_TENANT.to_string(),
            datastore_id: DEFAULT_DATASTORE.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_datastore(mut self, datastore_id: impl Into<String>) -> Self {
        self.datastore_id = datastore_id.into();
        self
    }

    /// Request cancellation of the job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let ctx = JobContext::default().with_tenant("acme");
        let worker_view = ctx.clone();
        assert!(!worker_view.is_cancelled());
        ctx.cancel();
        assert!(worker_view.is_cancelled());
        assert_eq!(worker_view.tenant_id, "acme");
        assert_eq!(worker_view.datastore_id, DEFAULT_DATASTORE);
    }
}

//! Read-only commands: `list` and `status`.

use crate::error::JobError;
use crate::model::{JobState, JobStatus};
use crate::reconcile::{observe, observe_all, query_snapshots};
use crate::store::JobStore;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub last: usize,
    pub all: bool,
    /// Name prefix; takes precedence over `all`.
    pub name: Option<String>,
    /// Keep only jobs whose reconciled state is this.
    pub state: Option<JobState>,
}

/// Most recent jobs first, each reconciled against one supervisor query.
pub(crate) async fn list<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    filter: &ListFilter,
) -> Result<Vec<JobStatus>, JobError> {
    let jobs = match filter.name.as_deref().filter(|n| !n.is_empty()) {
        Some(prefix) => store.list_by_name_prefix(prefix, filter.last)?,
        None => store.list(filter.last, filter.all)?,
    };
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let mut statuses = observe_all(supervisor, jobs).await;
    if let Some(wanted) = &filter.state {
        statuses.retain(|s| &s.state == wanted);
    }
    Ok(statuses)
}

/// Resolve `token` to a job and reconcile it.
pub(crate) async fn status<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    token: &str,
) -> Result<JobStatus, JobError> {
    let job = store
        .resolve(token)?
        .ok_or_else(|| JobError::NotFound(token.to_string()))?;
    let units = [job.unit.clone()];
    let snapshot = query_snapshots(supervisor, &units)
        .await
        .remove(&job.unit)
        .flatten();
    Ok(observe(job, snapshot))
}

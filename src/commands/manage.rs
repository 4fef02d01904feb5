//! Mutating commands: `stop`, `rm`, `prune`.
//!
//! Secondary steps that fail are collected as warnings rather than aborting
//! the command; only the primary action decides success.

use crate::error::JobError;
use crate::model::{Job, JobState};
use crate::store::{JobStore, PrunePolicy};
use crate::supervisor::Supervisor;
use std::time::Duration;

/// Outcome of a command that completed its primary action.
#[derive(Debug)]
pub struct Outcome {
    pub job: Job,
    pub warnings: Vec<String>,
}

fn find(store: &JobStore, token: &str) -> Result<Job, JobError> {
    store
        .resolve(token)?
        .ok_or_else(|| JobError::NotFound(token.to_string()))
}

/// Optionally signal, then stop the unit and cache `stopped` on the record.
pub(crate) async fn stop<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    token: &str,
    signal: Option<&str>,
) -> Result<Outcome, JobError> {
    let job = find(store, token)?;
    let mut warnings = Vec::new();

    if let Some(sig) = signal.filter(|s| !s.is_empty()) {
        if let Err(err) = supervisor.signal(&job.unit, sig).await {
            warnings.push(format!("failed to send signal: {err}"));
        }
    }

    supervisor
        .stop(&job.unit)
        .await
        .map_err(|err| JobError::unavailable("stop unit", err))?;

    if let Err(err) = store.update_state(job.id, &JobState::Stopped) {
        warnings.push(format!("failed to update job state: {err}"));
    }

    tracing::info!(id = job.id, unit = %job.unit, "job stopped");
    Ok(Outcome { job, warnings })
}

/// Delete a record. With `stop_first` the unit is stopped (and with `purge`
/// also reset) before deletion; failures there are warnings.
pub(crate) async fn remove<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    token: &str,
    stop_first: bool,
    purge: bool,
) -> Result<Outcome, JobError> {
    let job = find(store, token)?;
    let mut warnings = Vec::new();

    if stop_first {
        if let Err(err) = supervisor.stop(&job.unit).await {
            warnings.push(format!("failed to stop unit: {err}"));
        }
        if purge {
            if let Err(err) = supervisor.reset(&job.unit).await {
                warnings.push(format!("failed to reset-failed: {err}"));
            }
        }
    }

    store.delete(job.id)?;
    tracing::info!(id = job.id, unit = %job.unit, "job removed");
    Ok(Outcome { job, warnings })
}

/// Apply `policy`, returning the number of removed records.
pub fn prune(store: &JobStore, policy: &PrunePolicy) -> Result<usize, JobError> {
    Ok(store.prune(policy)?)
}

/// Parse a `--older-than` value such as `7d`, `24h` or `90m`.
pub fn parse_older_than(raw: &str) -> Result<Duration, JobError> {
    humantime::parse_duration(raw.trim())
        .map_err(|err| JobError::InvalidInput(format!("invalid duration {raw:?}: {err}")))
}

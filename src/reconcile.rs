//! Merging registry records with live supervisor state.

use crate::model::{Job, JobState, JobStatus, UnitSnapshot};
use crate::supervisor::Supervisor;
use std::collections::HashMap;

/// Map a live snapshot onto a [`JobState`].
///
/// Pure: the cached state on the record is never consulted here.
pub fn reconcile(snapshot: Option<&UnitSnapshot>) -> JobState {
    let Some(active) = snapshot.and_then(|s| s.active_state.as_deref()) else {
        return JobState::Unknown;
    };
    match active {
        "active" => JobState::Active,
        "inactive" => match snapshot.and_then(|s| s.exit_status.as_deref()) {
            Some(code) if code != "0" => JobState::Failed,
            _ => JobState::Exited,
        },
        "failed" => JobState::Failed,
        raw => JobState::from_raw(raw),
    }
}

/// Ask the supervisor about every unit in one call.
///
/// Every unit maps to `Some(snapshot)` or `None`. A failed batch query maps
/// every unit to `None` instead of failing the read.
pub(crate) async fn query_snapshots<S: Supervisor>(
    supervisor: &S,
    units: &[String],
) -> HashMap<String, Option<UnitSnapshot>> {
    match supervisor.query(units).await {
        Ok(mut found) => units
            .iter()
            .map(|unit| (unit.clone(), found.remove(unit)))
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, units = units.len(), "supervisor query failed; states unknown");
            units.iter().map(|unit| (unit.clone(), None)).collect()
        }
    }
}

/// Combine a record with its live snapshot. Without a snapshot the record's
/// cached state is surfaced, flagged as cached.
pub fn observe(job: Job, snapshot: Option<UnitSnapshot>) -> JobStatus {
    match snapshot {
        Some(live) => JobStatus {
            state: reconcile(Some(&live)),
            live: Some(live),
            cached: false,
            job,
        },
        None => {
            let (state, cached) = match &job.last_known_state {
                Some(state) => (state.clone(), true),
                None => (JobState::Unknown, false),
            };
            JobStatus {
                job,
                live: None,
                state,
                cached,
            }
        }
    }
}

/// Reconcile a batch of records against one supervisor query.
pub(crate) async fn observe_all<S: Supervisor>(supervisor: &S, jobs: Vec<Job>) -> Vec<JobStatus> {
    let units: Vec<String> = jobs.iter().map(|j| j.unit.clone()).collect();
    let mut snapshots = query_snapshots(supervisor, &units).await;
    jobs.into_iter()
        .map(|job| {
            let snapshot = snapshots.remove(&job.unit).flatten();
            observe(job, snapshot)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{job, FakeSupervisor};

    fn snap(active: &str, status: Option<&str>) -> UnitSnapshot {
        UnitSnapshot {
            unit: "u.service".into(),
            active_state: Some(active.into()),
            exit_status: status.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn inactive_maps_on_exit_status() {
        assert_eq!(reconcile(Some(&snap("inactive", Some("0")))), JobState::Exited);
        assert_eq!(reconcile(Some(&snap("inactive", None))), JobState::Exited);
        assert_eq!(reconcile(Some(&snap("inactive", Some("1")))), JobState::Failed);
        assert_eq!(reconcile(Some(&snap("inactive", Some("143")))), JobState::Failed);
    }

    #[test]
    fn active_wins_regardless_of_exit_status() {
        assert_eq!(reconcile(Some(&snap("active", Some("1")))), JobState::Active);
        assert_eq!(reconcile(Some(&snap("active", None))), JobState::Active);
    }

    #[test]
    fn failed_and_transitional_states() {
        assert_eq!(reconcile(Some(&snap("failed", Some("0")))), JobState::Failed);
        assert_eq!(reconcile(Some(&snap("activating", None))), JobState::Activating);
        assert_eq!(
            reconcile(Some(&snap("deactivating", None))),
            JobState::Other("deactivating".into())
        );
    }

    #[test]
    fn missing_or_empty_snapshot_is_unknown() {
        assert_eq!(reconcile(None), JobState::Unknown);
        assert_eq!(reconcile(Some(&UnitSnapshot::empty("u"))), JobState::Unknown);
    }

    #[test]
    fn observe_falls_back_to_cached_state_only_without_snapshot() {
        let mut record = job(1, "a.service");
        record.last_known_state = Some(JobState::Stopped);

        let cached = observe(record.clone(), None);
        assert_eq!(cached.state, JobState::Stopped);
        assert!(cached.cached);

        let live = observe(record, Some(snap("active", None)));
        assert_eq!(live.state, JobState::Active);
        assert!(!live.cached);
    }

    #[tokio::test]
    async fn failed_query_degrades_every_job_to_unknown() {
        let sup = FakeSupervisor::default();
        sup.fail_queries();

        let statuses = observe_all(&sup, vec![job(1, "a.service"), job(2, "b.service")]).await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == JobState::Unknown && !s.cached));
    }

    #[tokio::test]
    async fn batch_query_reconciles_each_job() {
        let sup = FakeSupervisor::default();
        sup.set_unit(snap_for("a.service", "active", None));
        sup.set_unit(snap_for("b.service", "inactive", Some("2")));

        let statuses = observe_all(
            &sup,
            vec![job(1, "a.service"), job(2, "b.service"), job(3, "c.service")],
        )
        .await;
        let states: Vec<JobState> = statuses.into_iter().map(|s| s.state).collect();
        assert_eq!(states, vec![JobState::Active, JobState::Failed, JobState::Unknown]);
        assert_eq!(sup.query_calls(), 1);
    }

    fn snap_for(unit: &str, active: &str, status: Option<&str>) -> UnitSnapshot {
        UnitSnapshot {
            unit: unit.into(),
            ..snap(active, status)
        }
    }
}

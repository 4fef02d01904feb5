//! Test doubles shared by the unit tests.

use crate::model::{Job, UnitSnapshot};
use crate::output::OutputLine;
use crate::supervisor::{LaunchSpec, LogQuery, Supervisor, SupervisorError};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use time::macros::datetime;
use tokio::sync::mpsc;

pub(crate) fn job(id: i64, unit: &str) -> Job {
    Job {
        id,
        created_at: datetime!(2024-06-01 12:00:00 UTC),
        name: "job".into(),
        unit: unit.into(),
        cwd: PathBuf::from("/tmp"),
        argv: vec!["sleep".into(), "60".into()],
        env: None,
        properties: None,
        host: None,
        user: None,
        notes: None,
        last_known_state: None,
        last_state_at: None,
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    units: HashMap<String, UnitSnapshot>,
    launched: Vec<(String, Vec<String>)>,
    fail_queries: bool,
    fail_launch: bool,
    fail_stop: bool,
    fail_signal: bool,
    query_calls: usize,
    log_lines: Vec<String>,
    hold_logs: bool,
    linger: bool,
}

/// In-memory supervisor that records every call.
#[derive(Clone, Default)]
pub(crate) struct FakeSupervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSupervisor {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().expect("fake supervisor lock"))
    }

    pub fn set_unit(&self, snapshot: UnitSnapshot) {
        self.with(|s| s.units.insert(snapshot.unit.clone(), snapshot));
    }

    pub fn fail_queries(&self) {
        self.with(|s| s.fail_queries = true);
    }

    pub fn fail_launch(&self) {
        self.with(|s| s.fail_launch = true);
    }

    pub fn fail_stop(&self) {
        self.with(|s| s.fail_stop = true);
    }

    pub fn fail_signal(&self) {
        self.with(|s| s.fail_signal = true);
    }

    pub fn set_linger(&self, enabled: bool) {
        self.with(|s| s.linger = enabled);
    }

    pub fn set_log_lines(&self, lines: &[&str]) {
        self.with(|s| s.log_lines = lines.iter().map(|l| l.to_string()).collect());
    }

    /// Make `stream_logs` block after emitting its lines, like `journalctl -f`.
    pub fn hold_logs_open(&self) {
        self.with(|s| s.hold_logs = true);
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn query_calls(&self) -> usize {
        self.with(|s| s.query_calls)
    }

    /// Units passed to `launch`, with their argv.
    pub fn launched(&self) -> Vec<(String, Vec<String>)> {
        self.with(|s| s.launched.clone())
    }

    fn failure(program: &'static str) -> SupervisorError {
        SupervisorError::Failed {
            program,
            code: Some(1),
            stderr: "Failed to connect to bus: No medium found".into(),
        }
    }
}

impl Supervisor for FakeSupervisor {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<(), SupervisorError> {
        self.with(|s| {
            s.calls.push(format!("launch {}", spec.unit));
            if s.fail_launch {
                return Err(Self::failure("systemd-run"));
            }
            s.launched.push((spec.unit.to_string(), spec.argv.to_vec()));
            s.units.insert(
                spec.unit.to_string(),
                UnitSnapshot {
                    unit: spec.unit.to_string(),
                    active_state: Some("active".into()),
                    sub_state: Some("running".into()),
                    ..Default::default()
                },
            );
            Ok(())
        })
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.with(|s| {
            s.calls.push(format!("stop {unit}"));
            if s.fail_stop {
                return Err(Self::failure("systemctl"));
            }
            if let Some(snapshot) = s.units.get_mut(unit) {
                snapshot.active_state = Some("inactive".into());
                snapshot.sub_state = Some("dead".into());
            }
            Ok(())
        })
    }

    async fn signal(&self, unit: &str, signal: &str) -> Result<(), SupervisorError> {
        self.with(|s| {
            s.calls.push(format!("signal {unit} {signal}"));
            if s.fail_signal {
                return Err(Self::failure("systemctl"));
            }
            Ok(())
        })
    }

    async fn reset(&self, unit: &str) -> Result<(), SupervisorError> {
        self.with(|s| s.calls.push(format!("reset {unit}")));
        Ok(())
    }

    async fn query(
        &self,
        units: &[String],
    ) -> Result<HashMap<String, UnitSnapshot>, SupervisorError> {
        self.with(|s| {
            s.query_calls += 1;
            if s.fail_queries {
                return Err(Self::failure("systemctl"));
            }
            Ok(units
                .iter()
                .map(|u| {
                    let snapshot = s.units.get(u).cloned().unwrap_or_else(|| UnitSnapshot::empty(u));
                    (u.clone(), snapshot)
                })
                .collect())
        })
    }

    fn stream_logs(
        &self,
        unit: &str,
        _query: &LogQuery,
        sink: mpsc::UnboundedSender<OutputLine>,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send + 'static {
        let (lines, hold) = self.with(|s| {
            s.calls.push(format!("stream_logs {unit}"));
            (s.log_lines.clone(), s.hold_logs)
        });
        async move {
            for line in lines {
                if sink.send(OutputLine::Stdout(line)).is_err() {
                    return Ok(());
                }
            }
            if hold {
                futures::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    async fn check_health(&self) -> Result<(), SupervisorError> {
        self.with(|s| {
            s.calls.push("check_health".into());
            if s.fail_queries {
                return Err(Self::failure("systemctl"));
            }
            Ok(())
        })
    }

    async fn check_linger_enabled(&self) -> Result<bool, SupervisorError> {
        self.with(|s| {
            s.calls.push("check_linger".into());
            Ok(s.linger)
        })
    }
}

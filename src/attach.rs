//! Attach sessions: follow a job's journal until the stream ends or the user
//! detaches.
//!
//! Detaching only stops reading. Nothing is sent to the supervisor, so the
//! job keeps running either way.

use crate::output::OutputLine;
use crate::supervisor::{LogQuery, Supervisor, SupervisorError};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// What ended a session. Both end in the detached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachTrigger {
    /// The user interrupted; the log stream was abandoned.
    Interrupt,
    /// The log stream finished on its own, typically because the job exited.
    StreamEnded,
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("log stream ended: {0}")]
    Stream(#[from] SupervisorError),
    #[error("log stream task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug)]
pub struct AttachReport {
    pub trigger: DetachTrigger,
    /// Only ever set for `StreamEnded`.
    pub error: Option<AttachError>,
}

impl AttachReport {
    pub fn into_result(self) -> Result<DetachTrigger, AttachError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.trigger),
        }
    }
}

/// Race a log-follow against an interrupt; the first to finish decides the
/// outcome and the other is discarded.
///
/// The follow runs on its own task. On interrupt that task is aborted, which
/// drops the stream reader; whatever it would have produced afterwards is
/// never seen. If the stream finishes first the interrupt future is simply
/// dropped, so a late interrupt has no effect on this session.
pub async fn run_session<F, I>(follow: F, interrupt: I) -> AttachReport
where
    F: Future<Output = Result<(), SupervisorError>> + Send + 'static,
    I: Future<Output = ()>,
{
    let mut follow = tokio::spawn(follow);

    tokio::select! {
        // Prefer the interrupt when both are ready in the same poll.
        biased;
        _ = interrupt => {
            follow.abort();
            tracing::debug!("attach session detached on interrupt");
            AttachReport { trigger: DetachTrigger::Interrupt, error: None }
        }
        joined = &mut follow => {
            tracing::debug!(ok = matches!(joined, Ok(Ok(()))), "attach session stream ended");
            let error = match joined {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(AttachError::Stream(err)),
                Err(err) => Some(AttachError::Task(err)),
            };
            AttachReport { trigger: DetachTrigger::StreamEnded, error }
        }
    }
}

/// Follow `unit`'s journal into `sink` until `interrupt` resolves or the
/// stream ends. The binary passes [`interrupt_signal`].
pub(crate) async fn attach<S, I>(
    supervisor: &S,
    unit: &str,
    query: &LogQuery,
    sink: mpsc::UnboundedSender<OutputLine>,
    interrupt: I,
) -> AttachReport
where
    S: Supervisor,
    I: Future<Output = ()>,
{
    let follow = supervisor.stream_logs(unit, query, sink);
    run_session(follow, interrupt).await
}

/// Resolves on the first SIGINT or SIGTERM. If no handler can be installed
/// it never resolves, leaving the stream as the only way out.
pub(crate) async fn interrupt_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_err() {
                        term.recv().await;
                    }
                }
                _ = term.recv() => {}
            }
            return;
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
}

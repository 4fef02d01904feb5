//! Boundary to the process supervisor (the systemd user manager).
//!
//! Everything here shells out to `systemd-run`, `systemctl`, `journalctl` or
//! `loginctl`. Failures are opaque: a non-zero exit is reported with its code
//! and captured stderr, nothing more structured.

use crate::model::UnitSnapshot;
use crate::output::OutputLine;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Properties requested from `systemctl show`, in the order they are parsed.
const SHOW_PROPERTIES: [&str; 6] = [
    "ActiveState",
    "SubState",
    "ExecMainStatus",
    "ExecMainPID",
    "ExecMainStartTimestamp",
    "ExecMainExitTimestamp",
];

/// Bytes of a streaming child's stderr kept for its error message.
const STDERR_TAIL: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("{program} exited with {}{}", fmt_code(.code), fmt_stderr(.stderr))]
    Failed {
        program: &'static str,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{0}")]
    Environment(String),
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
}

fn fmt_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Everything needed to start a transient unit.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub unit: &'a str,
    pub cwd: &'a Path,
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub properties: &'a BTreeMap<String, String>,
    pub description: &'a str,
}

/// Options for reading a unit's journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub follow: bool,
    /// `0` means no line limit.
    pub lines: usize,
    pub since: Option<String>,
    pub until: Option<String>,
    /// Message text only, no timestamp or unit prefix.
    pub raw: bool,
}

/// Operations the job commands need from the supervisor.
pub(crate) trait Supervisor {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<(), SupervisorError>;

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;

    async fn signal(&self, unit: &str, signal: &str) -> Result<(), SupervisorError>;

    async fn reset(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Batched state lookup. On success the map has an entry for every
    /// requested unit, including units the supervisor does not know.
    async fn query(&self, units: &[String])
        -> Result<HashMap<String, UnitSnapshot>, SupervisorError>;

    /// Copy the unit's journal into `sink`, one line per message. With
    /// `query.follow` the future only resolves when the journal source ends
    /// or the future is dropped. The returned future owns everything it
    /// needs so it can run on its own task.
    fn stream_logs(
        &self,
        unit: &str,
        query: &LogQuery,
        sink: mpsc::UnboundedSender<OutputLine>,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send + 'static;

    async fn check_health(&self) -> Result<(), SupervisorError>;

    async fn check_linger_enabled(&self) -> Result<bool, SupervisorError>;
}

/// The real supervisor: the calling user's systemd instance.
#[derive(Debug, Clone, Default)]
pub struct SystemdSupervisor;

impl Supervisor for SystemdSupervisor {
    async fn launch(&self, spec: &LaunchSpec<'_>) -> Result<(), SupervisorError> {
        let output = run_checked("systemd-run", launch_args(spec), Some(spec.cwd)).await?;
        tracing::debug!(
            unit = spec.unit,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "systemd-run accepted unit"
        );
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        run_checked("systemctl", ["--user", "stop", unit], None).await?;
        Ok(())
    }

    async fn signal(&self, unit: &str, signal: &str) -> Result<(), SupervisorError> {
        run_checked("systemctl", ["--user", "kill", "-s", signal, unit], None).await?;
        Ok(())
    }

    async fn reset(&self, unit: &str) -> Result<(), SupervisorError> {
        run_checked("systemctl", ["--user", "reset-failed", unit], None).await?;
        Ok(())
    }

    async fn query(
        &self,
        units: &[String],
    ) -> Result<HashMap<String, UnitSnapshot>, SupervisorError> {
        if units.is_empty() {
            return Ok(HashMap::new());
        }
        let mut args: Vec<&str> = vec!["--user", "show"];
        args.extend(units.iter().map(String::as_str));
        for property in SHOW_PROPERTIES {
            args.extend(["-p", property]);
        }
        let output = run_checked("systemctl", &args, None).await?;
        Ok(parse_show_output(&String::from_utf8_lossy(&output.stdout), units))
    }

    fn stream_logs(
        &self,
        unit: &str,
        query: &LogQuery,
        sink: mpsc::UnboundedSender<OutputLine>,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send + 'static {
        let mut cmd = Command::new("journalctl");
        cmd.args(journal_args(unit, query));
        pipe_lines("journalctl", cmd, sink)
    }

    async fn check_health(&self) -> Result<(), SupervisorError> {
        run_checked("systemctl", ["--user", "status"], None).await?;
        Ok(())
    }

    async fn check_linger_enabled(&self) -> Result<bool, SupervisorError> {
        let user = std::env::var("USER")
            .map_err(|_| SupervisorError::Environment("USER environment variable not set".into()))?;
        let output = run_checked("loginctl", ["show-user", user.as_str(), "-p", "Linger"], None).await?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("yes"))
    }
}

/// Run `cmd`, forwarding each stdout line into `sink` until EOF.
///
/// Stderr is drained alongside stdout so a chatty child cannot fill its pipe
/// and stall. Only the last `STDERR_TAIL` bytes are kept for the error.
/// Dropping the future closes the pipes without killing the child; it exits
/// once it next writes to the closed stdout.
async fn pipe_lines(
    program: &'static str,
    mut cmd: Command,
    sink: mpsc::UnboundedSender<OutputLine>,
) -> Result<(), SupervisorError> {
    let spawn_err = |source: std::io::Error| SupervisorError::Spawn { program, source };
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let forward = async move {
        let Some(stdout) = stdout else {
            return Ok(());
        };
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if sink.send(OutputLine::Stdout(line)).is_err() {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    };
    let drain = async move {
        match stderr {
            Some(stderr) => read_tail(stderr, STDERR_TAIL).await,
            None => String::new(),
        }
    };

    let (forwarded, stderr) = tokio::join!(forward, drain);
    forwarded.map_err(spawn_err)?;

    let status = child.wait().await.map_err(spawn_err)?;
    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::Failed {
            program,
            code: status.code(),
            stderr,
        })
    }
}

/// Read `reader` to EOF, keeping at most the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

async fn run_checked<I, S>(
    program: &'static str,
    args: I,
    cwd: Option<&Path>,
) -> Result<Output, SupervisorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .await
        .map_err(|source| SupervisorError::Spawn { program, source })?;
    check_status(program, output)
}

fn check_status(program: &'static str, output: Output) -> Result<Output, SupervisorError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(SupervisorError::Failed {
            program,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn launch_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["--user", "--unit", spec.unit, "--same-dir", "--collect"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if !spec.description.is_empty() {
        args.push("-p".into());
        args.push(format!("Description={}", spec.description));
    }
    for (key, value) in spec.env {
        args.push("--setenv".into());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in spec.properties {
        args.push("-p".into());
        args.push(format!("{key}={value}"));
    }

    args.push("--".into());
    args.extend(spec.argv.iter().cloned());
    args
}

pub(crate) fn journal_args(unit: &str, query: &LogQuery) -> Vec<String> {
    let format = if query.raw { "cat" } else { "short-iso" };
    let mut args: Vec<String> = ["--user", "-u", unit, "-o", format, "--no-pager"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if query.follow {
        args.push("-f".into());
    }
    if query.lines > 0 {
        args.push("-n".into());
        args.push(query.lines.to_string());
    }
    if let Some(since) = &query.since {
        args.push("--since".into());
        args.push(since.clone());
    }
    if let Some(until) = &query.until {
        args.push("--until".into());
        args.push(until.clone());
    }
    args
}

/// Parse `systemctl show` output for `units`.
///
/// The output holds one block of `Key=Value` lines per unit, in request
/// order, separated by blank lines. Every requested unit gets an entry even
/// if its block is missing.
pub(crate) fn parse_show_output(output: &str, units: &[String]) -> HashMap<String, UnitSnapshot> {
    let mut snapshots: Vec<UnitSnapshot> = units.iter().map(|u| UnitSnapshot::empty(u)).collect();
    let mut idx = 0usize;
    let mut in_block = false;

    for line in output.lines() {
        if line.is_empty() {
            // A run of blank lines is a single separator.
            if in_block {
                idx += 1;
                in_block = false;
            }
            continue;
        }
        let Some(snapshot) = snapshots.get_mut(idx) else {
            break;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        in_block = true;
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match key {
            "ActiveState" => snapshot.active_state = value,
            "SubState" => snapshot.sub_state = value,
            "ExecMainStatus" => snapshot.exit_status = value,
            "ExecMainPID" => {
                snapshot.main_pid = value.and_then(|v| v.parse().ok()).filter(|pid| *pid != 0)
            }
            "ExecMainStartTimestamp" => snapshot.started_at = value,
            "ExecMainExitTimestamp" => snapshot.exited_at = value,
            _ => {}
        }
    }

    snapshots
        .into_iter()
        .map(|s| (s.unit.clone(), s))
        .collect()
}

/// Whether `command` can be executed: an existing path when it contains a
/// `/`, otherwise an executable found on `PATH`.
pub fn command_exists(command: &str) -> bool {
    if command.contains('/') {
        return Path::new(command).exists();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(command)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_one_block_per_unit_in_request_order() {
        let output = "\
ActiveState=active
SubState=running
ExecMainStatus=0
ExecMainPID=4242
ExecMainStartTimestamp=Mon 2024-06-03 10:00:00 UTC
ExecMainExitTimestamp=

ActiveState=inactive
SubState=dead
ExecMainStatus=1
ExecMainPID=0
ExecMainStartTimestamp=Mon 2024-06-03 09:00:00 UTC
ExecMainExitTimestamp=Mon 2024-06-03 09:05:00 UTC
";
        let parsed = parse_show_output(output, &units(&["a.service", "b.service"]));

        let a = &parsed["a.service"];
        assert_eq!(a.active_state.as_deref(), Some("active"));
        assert_eq!(a.sub_state.as_deref(), Some("running"));
        assert_eq!(a.main_pid, Some(4242));
        assert!(a.exited_at.is_none());

        let b = &parsed["b.service"];
        assert_eq!(b.active_state.as_deref(), Some("inactive"));
        assert_eq!(b.exit_status.as_deref(), Some("1"));
        assert_eq!(b.main_pid, None);
        assert_eq!(b.exited_at.as_deref(), Some("Mon 2024-06-03 09:05:00 UTC"));
    }

    #[test]
    fn missing_blocks_still_yield_entries() {
        let parsed = parse_show_output("ActiveState=active\n", &units(&["a", "b", "c"]));
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["a"].active_state.as_deref(), Some("active"));
        assert_eq!(parsed["b"], UnitSnapshot::empty("b"));
        assert_eq!(parsed["c"], UnitSnapshot::empty("c"));
    }

    #[test]
    fn repeated_and_leading_blank_lines_do_not_shift_units() {
        let output = "\

ActiveState=active
SubState=running


ActiveState=failed
SubState=failed
";
        let parsed = parse_show_output(output, &units(&["a", "b", "c"]));
        assert_eq!(parsed["a"].active_state.as_deref(), Some("active"));
        assert_eq!(parsed["b"].active_state.as_deref(), Some("failed"));
        assert_eq!(parsed["c"], UnitSnapshot::empty("c"));
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn pipe_lines_survives_a_flood_on_stderr() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cmd = sh("head -c 200000 /dev/zero >&2; echo line-one; exit 0");

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pipe_lines("sh", cmd, tx),
        )
        .await
        .expect("stream finishes");
        assert!(result.is_ok());

        match rx.try_recv() {
            Ok(OutputLine::Stdout(line)) => assert_eq!(line, "line-one"),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipe_lines_reports_exit_code_and_stderr() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipe_lines("sh", sh("echo boom >&2; exit 3"), tx)
            .await
            .unwrap_err();
        match err {
            SupervisorError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn read_tail_keeps_only_the_last_bytes() {
        let data = format!("{}end", "x".repeat(20_000));
        let tail = read_tail(data.as_bytes(), 10).await;
        assert_eq!(tail, "xxxxxxxend");
    }

    #[test]
    fn launch_args_carry_env_properties_and_argv() {
        let argv = units(&["python", "train.py", "--lr", "0.1"]);
        let env = BTreeMap::from([("A".to_string(), "1".to_string())]);
        let props = BTreeMap::from([("MemoryMax".to_string(), "2G".to_string())]);
        let spec = LaunchSpec {
            unit: "jr-x.service",
            cwd: Path::new("/tmp"),
            argv: &argv,
            env: &env,
            properties: &props,
            description: "jr job: x",
        };

        let args = launch_args(&spec);
        assert_eq!(
            args,
            units(&[
                "--user",
                "--unit",
                "jr-x.service",
                "--same-dir",
                "--collect",
                "-p",
                "Description=jr job: x",
                "--setenv",
                "A=1",
                "-p",
                "MemoryMax=2G",
                "--",
                "python",
                "train.py",
                "--lr",
                "0.1",
            ])
        );
    }

    #[test]
    fn journal_args_follow_query_options() {
        let query = LogQuery {
            follow: true,
            lines: 50,
            since: Some("1h ago".into()),
            until: None,
            raw: true,
        };
        let args = journal_args("u.service", &query);
        assert_eq!(
            args,
            units(&[
                "--user", "-u", "u.service", "-o", "cat", "--no-pager", "-f", "-n", "50", "--since",
                "1h ago",
            ])
        );
    }

    #[test]
    fn failed_error_message_includes_stderr() {
        let err = SupervisorError::Failed {
            program: "systemctl",
            code: Some(5),
            stderr: "Unit x.service not loaded.\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "systemctl exited with status 5: Unit x.service not loaded."
        );
    }

    #[test]
    fn command_lookup_handles_paths_and_missing_commands() {
        assert!(command_exists("/"));
        assert!(!command_exists("./definitely/not/here"));
        assert!(!command_exists("jr-test-no-such-command-xyz"));
    }
}

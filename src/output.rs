//! Text and JSON rendering for CLI output.
//!
//! Everything here works on already reconciled data and returns
//! pre-formatted lines; writing them out is the output writer's job.

use crate::model::{Job, JobState, JobStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr so log streaming never blocks
/// the async tasks producing lines.
pub fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Serialize)]
pub(crate) struct ListEntry<'a> {
    pub id: i64,
    pub created: String,
    pub name: &'a str,
    pub state: &'a JobState,
    pub unit: &'a str,
    pub command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusView<'a> {
    pub id: i64,
    pub name: &'a str,
    pub unit: &'a str,
    pub created: String,
    pub state: &'a JobState,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub state_cached: bool,
    pub active_state: Option<&'a str>,
    pub sub_state: Option<&'a str>,
    pub pid: Option<u32>,
    pub exit_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited: Option<&'a str>,
    pub cwd: &'a PathBuf,
    pub argv: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
}

impl<'a> StatusView<'a> {
    pub fn new(status: &'a JobStatus) -> Self {
        let job = &status.job;
        let live = status.live.as_ref();
        Self {
            id: job.id,
            name: &job.name,
            unit: &job.unit,
            created: rfc3339(job.created_at),
            state: &status.state,
            state_cached: status.cached,
            active_state: live.and_then(|l| l.active_state.as_deref()),
            sub_state: live.and_then(|l| l.sub_state.as_deref()),
            pid: live.and_then(|l| l.main_pid),
            exit_code: live.and_then(|l| l.exit_status.as_deref()),
            started: live.and_then(|l| l.started_at.as_deref()),
            exited: live.and_then(|l| l.exited_at.as_deref()),
            cwd: &job.cwd,
            argv: &job.argv,
            env: job.env.as_ref(),
            host: job.host.as_deref(),
            user: job.user.as_deref(),
        }
    }
}

pub(crate) fn list_entries(statuses: &[JobStatus]) -> Vec<ListEntry<'_>> {
    statuses
        .iter()
        .map(|s| ListEntry {
            id: s.job.id,
            created: rfc3339(s.job.created_at),
            name: &s.job.name,
            state: &s.state,
            unit: &s.job.unit,
            command: shorten_command(&s.job.argv, 40),
        })
        .collect()
}

/// Build the `list` table, header first.
pub(crate) fn list_table(statuses: &[JobStatus], color: bool) -> Vec<String> {
    let mut rows: Vec<[String; 6]> = vec![[
        "ID".into(),
        "CREATED".into(),
        "NAME".into(),
        "STATE".into(),
        "UNIT".into(),
        "CMD".into(),
    ]];
    for s in statuses {
        rows.push([
            s.job.id.to_string(),
            short_time(s.job.created_at),
            s.job.name.clone(),
            s.state.to_string(),
            truncate(&s.job.unit, 30),
            shorten_command(&s.job.argv, 30),
        ]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let mut line = String::new();
            for (col, cell) in row.iter().enumerate() {
                let pad = widths[col] - cell.chars().count();
                let shown = if color && i > 0 && col == 3 {
                    paint_state(&statuses[i - 1].state, cell)
                } else {
                    cell.clone()
                };
                line.push_str(&shown);
                if col + 1 < row.len() {
                    line.push_str(&" ".repeat(pad + 2));
                }
            }
            line
        })
        .collect()
}

/// Human-readable `status` block.
pub(crate) fn status_lines(status: &JobStatus) -> Vec<String> {
    let view = StatusView::new(status);
    let mut lines = vec![
        format!("Job:         {}", view.id),
        format!("Name:        {}", view.name),
        format!("Unit:        {}", view.unit),
        format!("Created:     {}", view.created),
    ];
    if view.state_cached {
        lines.push(format!("State:       {} (cached, supervisor unreachable)", view.state));
    } else {
        lines.push(format!("State:       {}", view.state));
    }
    if let Some(sub) = view.sub_state {
        lines.push(format!("SubState:    {sub}"));
    }
    if let Some(pid) = view.pid {
        lines.push(format!("PID:         {pid}"));
    }
    if let Some(code) = view.exit_code {
        lines.push(format!("Exit Code:   {code}"));
    }
    if let Some(started) = view.started {
        lines.push(format!("Started:     {started}"));
    }
    if let Some(exited) = view.exited {
        lines.push(format!("Exited:      {exited}"));
    }
    lines.push(format!("Working Dir: {}", view.cwd.display()));
    lines.push(format!("Command:     {}", format_argv(view.argv)));
    if let Some(host) = view.host {
        lines.push(format!("Host:        {host}"));
    }
    if let Some(user) = view.user {
        lines.push(format!("User:        {user}"));
    }
    lines
}

/// Shown after an attach session detaches on request.
pub(crate) fn detach_guidance(job: &Job) -> Vec<String> {
    vec![
        String::new(),
        "=== Detached from job (job is still running) ===".to_string(),
        format!("View logs: jr logs {}", job.id),
        format!("Stop job:  jr stop {}", job.id),
    ]
}

/// Basename of the program followed by as many arguments as fit in `max_len`.
pub fn shorten_command(argv: &[String], max_len: usize) -> String {
    let Some(program) = argv.first() else {
        return String::new();
    };
    let mut cmd = std::path::Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());
    for arg in &argv[1..] {
        if cmd.len() + arg.len() + 1 > max_len {
            cmd.push_str(" ...");
            break;
        }
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd
}

/// Join argv for display, quoting arguments that contain whitespace.
pub fn format_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.chars().any(char::is_whitespace) {
                format!("{arg:?}")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn stdout_is_terminal() -> bool {
    std::io::stdout().is_terminal()
}

fn paint_state(state: &JobState, cell: &str) -> String {
    let code = match state {
        JobState::Active => "32",
        JobState::Failed => "31",
        JobState::Exited | JobState::Stopped => "90",
        _ => return cell.to_string(),
    };
    format!("\x1b[{code}m{cell}\x1b[0m")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.replace_nanosecond(0)
        .unwrap_or(ts)
        .format(&Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}

fn short_time(ts: OffsetDateTime) -> String {
    let local = time::UtcOffset::current_local_offset()
        .map(|offset| ts.to_offset(offset))
        .unwrap_or(ts);
    local
        .format(format_description!("[month repr:short] [day] [hour]:[minute]"))
        .unwrap_or_else(|_| rfc3339(ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitSnapshot;
    use time::macros::datetime;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn status(state: JobState) -> JobStatus {
        JobStatus {
            job: Job {
                id: 3,
                created_at: datetime!(2024-06-01 12:00:00.5 UTC),
                name: "train".into(),
                unit: "jr-train-20240601-120000-ABCDEFGHJKMNPQRS.service".into(),
                cwd: PathBuf::from("/srv"),
                argv: argv(&["/usr/bin/python", "train.py", "--name", "two words"]),
                env: None,
                properties: None,
                host: Some("box".into()),
                user: None,
                notes: None,
                last_known_state: None,
                last_state_at: None,
            },
            live: Some(UnitSnapshot {
                unit: "u".into(),
                active_state: Some("active".into()),
                sub_state: Some("running".into()),
                main_pid: Some(99),
                ..Default::default()
            }),
            state,
            cached: false,
        }
    }

    #[test]
    fn shorten_command_uses_basename_and_elides() {
        assert_eq!(shorten_command(&argv(&["/usr/bin/python", "a.py"]), 40), "python a.py");
        assert_eq!(
            shorten_command(&argv(&["python", "a-very-long-script-name.py", "--flag"]), 20),
            "python ..."
        );
        assert_eq!(shorten_command(&[], 10), "");
    }

    #[test]
    fn format_argv_quotes_whitespace() {
        assert_eq!(format_argv(&argv(&["echo", "hello world", "x"])), "echo \"hello world\" x");
    }

    #[test]
    fn list_table_aligns_columns() {
        let rows = list_table(&[status(JobState::Active)], false);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("ID  CREATED"));
        assert!(rows[1].contains("active"));
        assert!(rows[1].contains("jr-train-20240601-120000-AB..."));
        assert!(rows[1].ends_with("python train.py --name ..."));
    }

    #[test]
    fn status_lines_mark_cached_state() {
        let mut s = status(JobState::Failed);
        s.cached = true;
        s.live = None;
        let lines = status_lines(&s);
        assert!(lines.contains(&"State:       failed (cached, supervisor unreachable)".to_string()));
        assert!(lines.contains(&"Command:     /usr/bin/python train.py --name \"two words\"".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("PID:")));
    }

    #[test]
    fn status_json_uses_plain_state_and_second_precision() {
        let s = status(JobState::Active);
        let json = serde_json::to_value(StatusView::new(&s)).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["created"], "2024-06-01T12:00:00Z");
        assert_eq!(json["pid"], 99);
        assert!(json.get("stateCached").is_none());
    }
}

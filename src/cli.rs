use crate::attach::{self, DetachTrigger};
use crate::commands::{self, LaunchInput, LaunchRequest, ListFilter};
use crate::config::Config;
use crate::model::{Job, JobState};
use crate::output::{self, spawn_output_writer, OutputLine, StatusView};
use crate::store::{JobStore, PrunePolicy};
use crate::supervisor::{LogQuery, Supervisor, SystemdSupervisor};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::mpsc;

type Sink = mpsc::UnboundedSender<OutputLine>;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "jr",
    version,
    about = "Launch long-running jobs as systemd user units and keep track of them"
)]
pub struct Cli {
    /// Path to the job registry database
    #[arg(long, global = true, env = "JR_DB")]
    pub db: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start a command as a background job
    #[command(visible_alias = "start")]
    Run(RunArgs),
    /// List recorded jobs
    #[command(visible_aliases = ["ls", "last"])]
    List(ListArgs),
    /// Show detailed status for a job
    Status(StatusArgs),
    /// Show journal output for a job
    #[command(visible_aliases = ["tail", "attach"])]
    Logs(LogsArgs),
    /// Stop a running job
    Stop(StopArgs),
    /// Remove a job from the registry
    Rm(RmArgs),
    /// Remove old jobs from the registry
    Prune(PruneArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Job name (defaults to the command basename)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Working directory (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable, repeatable
    #[arg(short = 'e', long = "env", value_name = "K=V")]
    pub env: Vec<String>,

    /// Extra systemd unit property, repeatable
    #[arg(long = "property", value_name = "K=V")]
    pub properties: Vec<String>,

    /// Unit description
    #[arg(long = "desc")]
    pub description: Option<String>,

    /// Value for CUDA_VISIBLE_DEVICES
    #[arg(long)]
    pub gpu: Option<String>,

    /// Skip the lingering hint
    #[arg(long)]
    pub no_linger_check: bool,

    /// Follow the job's output after starting it
    #[arg(short, long)]
    pub attach: bool,

    /// Command and arguments to run
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Show the last N jobs
    #[arg(long, default_value_t = 10)]
    pub last: usize,

    /// Show all jobs
    #[arg(long)]
    pub all: bool,

    /// Only jobs whose name starts with this prefix
    #[arg(long)]
    pub name: Option<String>,

    /// Only jobs in this state (active, exited, failed, stopped, unknown, ...)
    #[arg(long)]
    pub state: Option<String>,

    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    /// Job id or unit name
    pub job: String,

    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct LogsArgs {
    /// Job id or unit name
    pub job: String,

    /// Follow output until Ctrl+C (the job keeps running)
    #[arg(short, long)]
    pub follow: bool,

    /// Number of lines to show
    #[arg(short = 'n', long, default_value_t = 200)]
    pub lines: usize,

    /// Show entries since this time (journalctl syntax)
    #[arg(long)]
    pub since: Option<String>,

    /// Show entries until this time (journalctl syntax)
    #[arg(long)]
    pub until: Option<String>,

    /// Message text only, no timestamps
    #[arg(long)]
    pub raw: bool,
}

#[derive(Debug, Args, Clone)]
pub struct StopArgs {
    /// Job id or unit name
    pub job: String,

    /// Send this signal before stopping (e.g. SIGINT)
    #[arg(short, long)]
    pub signal: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RmArgs {
    /// Job id or unit name
    pub job: String,

    /// Stop the unit before removing the record
    #[arg(long)]
    pub stop: bool,

    /// Also reset-failed the unit (with --stop)
    #[arg(long)]
    pub purge_unit: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PruneArgs {
    /// Keep the N most recent jobs
    #[arg(long, default_value_t = 100)]
    pub keep: usize,

    /// Only remove jobs older than this (e.g. 7d, 24h)
    #[arg(long)]
    pub older_than: Option<String>,

    /// Only remove failed jobs
    #[arg(long)]
    pub failed_only: bool,

    /// Print JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = Config::resolve(args.db)?;
    let store = JobStore::open(&cfg.db_path)
        .with_context(|| format!("failed to open job registry {}", cfg.db_path.display()))?;
    let supervisor = SystemdSupervisor;
    let (out_tx, out_handle) = spawn_output_writer();

    let result = dispatch(
        args.command,
        &store,
        &supervisor,
        &out_tx,
        attach::interrupt_signal(),
    )
    .await;

    if let Err(err) = store.close() {
        tracing::warn!(error = %err, "failed to close job registry");
    }
    drop(out_tx);
    let _ = out_handle.await;
    result
}

/// Run one command. `interrupt` ends an attach session (`run --attach`,
/// `logs -f`); other commands never poll it.
async fn dispatch<S, I>(
    command: Command,
    store: &JobStore,
    supervisor: &S,
    out: &Sink,
    interrupt: I,
) -> Result<()>
where
    S: Supervisor,
    I: Future<Output = ()>,
{
    match command {
        Command::Run(args) => run_job(args, store, supervisor, out, interrupt).await,
        Command::List(args) => list_jobs(args, store, supervisor, out).await,
        Command::Status(args) => show_status(args, store, supervisor, out).await,
        Command::Logs(args) => show_logs(args, store, supervisor, out, interrupt).await,
        Command::Stop(args) => {
            let outcome =
                commands::stop(store, supervisor, &args.job, args.signal.as_deref()).await?;
            warn_all(out, &outcome.warnings);
            stdout(out, format!("Stopped {} {}", outcome.job.id, outcome.job.unit));
            Ok(())
        }
        Command::Rm(args) => {
            let outcome =
                commands::remove(store, supervisor, &args.job, args.stop, args.purge_unit).await?;
            warn_all(out, &outcome.warnings);
            stdout(out, format!("Removed {} {}", outcome.job.id, outcome.job.unit));
            Ok(())
        }
        Command::Prune(args) => prune_jobs(args, store, out),
    }
}

async fn run_job<S, I>(
    args: RunArgs,
    store: &JobStore,
    supervisor: &S,
    out: &Sink,
    interrupt: I,
) -> Result<()>
where
    S: Supervisor,
    I: Future<Output = ()>,
{
    let attach = args.attach;
    let input = LaunchInput {
        command: args.command,
        name: args.name,
        cwd: args.cwd,
        env: args.env,
        properties: args.properties,
        description: args.description,
        gpu: args.gpu,
        attach,
    };
    let caller_env = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
    let request = LaunchRequest::build(input, caller_env, std::env::current_dir)?;

    if !args.no_linger_check {
        match supervisor.check_linger_enabled().await {
            Ok(false) => {
                stderr(out, "Warning: lingering not enabled. Jobs may stop on logout.");
                stderr(out, "Enable with: sudo loginctl enable-linger $USER\n");
            }
            Ok(true) => {}
            Err(err) => tracing::debug!(error = %err, "linger check failed"),
        }
    }

    let launched = commands::launch_new(store, supervisor, &request).await?;
    stdout(out, format!("Started {} {}", launched.id, launched.unit));

    if attach {
        stdout(out, "");
        stdout(
            out,
            "=== Attached to job output (press Ctrl+C to detach, job continues running) ===",
        );
        stdout(out, "");
        let job = store
            .get_by_id(launched.id)?
            .context("job disappeared from the registry")?;
        let query = LogQuery {
            follow: true,
            ..Default::default()
        };
        follow(supervisor, &job, &query, out, interrupt).await?;
    }
    Ok(())
}

async fn list_jobs<S: Supervisor>(
    args: ListArgs,
    store: &JobStore,
    supervisor: &S,
    out: &Sink,
) -> Result<()> {
    let filter = ListFilter {
        last: args.last,
        all: args.all,
        name: args.name,
        state: args.state.as_deref().map(JobState::from_raw),
    };
    let statuses = commands::list(store, supervisor, &filter)
        .await
        .context("failed to list jobs")?;

    if args.json {
        let body = serde_json::to_string_pretty(&output::list_entries(&statuses))?;
        stdout(out, body);
        return Ok(());
    }
    if statuses.is_empty() {
        stdout(out, "No jobs found");
        return Ok(());
    }
    for line in output::list_table(&statuses, output::stdout_is_terminal()) {
        stdout(out, line);
    }
    Ok(())
}

async fn show_status<S: Supervisor>(
    args: StatusArgs,
    store: &JobStore,
    supervisor: &S,
    out: &Sink,
) -> Result<()> {
    let status = commands::status(store, supervisor, &args.job).await?;
    if args.json {
        stdout(out, serde_json::to_string_pretty(&StatusView::new(&status))?);
    } else {
        for line in output::status_lines(&status) {
            stdout(out, line);
        }
    }
    Ok(())
}

async fn show_logs<S, I>(
    args: LogsArgs,
    store: &JobStore,
    supervisor: &S,
    out: &Sink,
    interrupt: I,
) -> Result<()>
where
    S: Supervisor,
    I: Future<Output = ()>,
{
    let job = store
        .resolve(&args.job)?
        .ok_or_else(|| crate::error::JobError::NotFound(args.job.clone()))?;
    let query = LogQuery {
        follow: args.follow,
        lines: args.lines,
        since: args.since,
        until: args.until,
        raw: args.raw,
    };

    if query.follow {
        return follow(supervisor, &job, &query, out, interrupt).await;
    }
    supervisor
        .stream_logs(&job.unit, &query, out.clone())
        .await
        .context("failed to read logs")?;
    Ok(())
}

/// Run an attach session on `job`, printing guidance if the user detaches.
async fn follow<S, I>(
    supervisor: &S,
    job: &Job,
    query: &LogQuery,
    out: &Sink,
    interrupt: I,
) -> Result<()>
where
    S: Supervisor,
    I: Future<Output = ()>,
{
    let report = attach::attach(supervisor, &job.unit, query, out.clone(), interrupt).await;
    if report.trigger == DetachTrigger::Interrupt {
        for line in output::detach_guidance(job) {
            stdout(out, line);
        }
    }
    report.into_result()?;
    Ok(())
}

#[derive(Serialize)]
struct PruneReport<'a> {
    removed: usize,
    policy: &'a PrunePolicy,
}

fn prune_jobs(args: PruneArgs, store: &JobStore, out: &Sink) -> Result<()> {
    let older_than = args
        .older_than
        .as_deref()
        .map(commands::parse_older_than)
        .transpose()?;
    let policy = PrunePolicy {
        keep: args.keep,
        older_than,
        failed_only: args.failed_only,
    };

    let removed = commands::prune(store, &policy).context("failed to prune jobs")?;
    if args.json {
        let body = serde_json::to_string_pretty(&PruneReport {
            removed,
            policy: &policy,
        })?;
        stdout(out, body);
    } else if policy.is_noop() {
        stdout(out, "Nothing to prune: no filter is active");
    } else {
        stdout(out, format!("Pruned {removed} job(s) (keeping last {})", policy.keep));
    }
    Ok(())
}

fn stdout(out: &Sink, line: impl Into<String>) {
    let _ = out.send(OutputLine::Stdout(line.into()));
}

fn stderr(out: &Sink, line: impl Into<String>) {
    let _ = out.send(OutputLine::Stderr(line.into()));
}

fn warn_all(out: &Sink, warnings: &[String]) {
    for w in warnings {
        tracing::debug!(warning = %w, "command finished with warning");
        stderr(out, format!("Warning: {w}"));
    }
}

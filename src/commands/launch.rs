//! Launch flow: generate a unit name, start the unit, then record it.

use crate::error::JobError;
use crate::identity;
use crate::model::NewJob;
use crate::store::JobStore;
use crate::supervisor::{command_exists, LaunchSpec, Supervisor};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A fully validated launch, ready to hand to the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub description: String,
    pub host: Option<String>,
    pub user: Option<String>,
}

/// Raw user input for a launch, before validation.
#[derive(Debug, Clone, Default)]
pub struct LaunchInput {
    pub command: Vec<String>,
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<String>,
    pub properties: Vec<String>,
    pub description: Option<String>,
    pub gpu: Option<String>,
    pub attach: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub id: i64,
    pub unit: String,
}

/// Split `K=V` strings into a map; later keys win.
pub fn parse_pairs(pairs: &[String], what: &str) -> Result<BTreeMap<String, String>, JobError> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                map.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(JobError::InvalidInput(format!(
                    "invalid {what} format: {pair} (expected K=V)"
                )))
            }
        }
    }
    Ok(map)
}

impl LaunchRequest {
    /// Validate `input` against the caller's environment. Nothing is started
    /// or written here, so every rejection happens before side effects.
    pub fn build(
        input: LaunchInput,
        caller_env: impl IntoIterator<Item = (String, String)>,
        current_dir: impl FnOnce() -> std::io::Result<PathBuf>,
    ) -> Result<Self, JobError> {
        let Some(program) = input.command.first() else {
            return Err(JobError::InvalidInput("requires a command to run".into()));
        };
        if !command_exists(program) {
            return Err(JobError::InvalidInput(format!("command not found: {program}")));
        }

        let overrides = parse_pairs(&input.env, "env")?;
        let mut properties = parse_pairs(&input.properties, "property")?;

        let name = input.name.unwrap_or_else(|| {
            Path::new(program)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.clone())
        });

        let cwd = match input.cwd {
            Some(cwd) => cwd,
            None => current_dir().map_err(|err| {
                JobError::InvalidInput(format!("failed to get current directory: {err}"))
            })?,
        };

        let mut env: BTreeMap<String, String> = caller_env.into_iter().collect();
        if input.attach {
            // TERM and COLORTERM come through with the caller's environment.
            properties.insert("StandardOutput".into(), "journal+console".into());
            properties.insert("StandardError".into(), "journal+console".into());
            env.insert("FORCE_COLOR".into(), "1".into());
            env.insert("CLICOLOR_FORCE".into(), "1".into());
        }
        env.extend(overrides);
        if let Some(gpu) = input.gpu {
            env.insert("CUDA_VISIBLE_DEVICES".into(), gpu);
        }

        let description = input
            .description
            .unwrap_or_else(|| format!("jr job: {name}"));

        Ok(Self {
            host: hostname::get().ok().and_then(|h| h.into_string().ok()),
            user: env.get("USER").cloned(),
            name,
            cwd,
            argv: input.command,
            env,
            properties,
            description,
        })
    }
}

/// Start `request` under `unit`, then record it.
///
/// The unit is started first; if recording fails afterwards the job is left
/// running and `PostLaunchPersistence` is returned. Nothing is retried.
pub(crate) async fn launch<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    request: &LaunchRequest,
    unit: String,
) -> Result<Launched, JobError> {
    let spec = LaunchSpec {
        unit: &unit,
        cwd: &request.cwd,
        argv: &request.argv,
        env: &request.env,
        properties: &request.properties,
        description: &request.description,
    };

    if let Err(err) = supervisor.launch(&spec).await {
        let action = if supervisor.check_health().await.is_err() {
            "start unit (user systemd manager unreachable)"
        } else {
            "start unit"
        };
        return Err(JobError::unavailable(action, err));
    }

    let record = NewJob {
        name: request.name.clone(),
        unit: unit.clone(),
        cwd: request.cwd.clone(),
        argv: request.argv.clone(),
        env: Some(request.env.clone()),
        properties: Some(request.properties.clone()),
        host: request.host.clone(),
        user: request.user.clone(),
    };

    match store.create(&record) {
        Ok(id) => {
            tracing::info!(id, unit = %unit, name = %request.name, "job started");
            Ok(Launched { id, unit })
        }
        Err(reason) => {
            tracing::error!(unit = %unit, error = %reason, "job started but not recorded");
            Err(JobError::PostLaunchPersistence { unit, reason })
        }
    }
}

/// Generate a unit name for `request` and launch it.
pub(crate) async fn launch_new<S: Supervisor>(
    store: &JobStore,
    supervisor: &S,
    request: &LaunchRequest,
) -> Result<Launched, JobError> {
    let unit = identity::generate(&request.name);
    launch(store, supervisor, request, unit).await
}

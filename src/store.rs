//! Durable job registry backed by SQLite.

use crate::model::{Job, JobState, NewJob};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

pub const SCHEMA_VERSION: i64 = 1;

const JOB_COLUMNS: &str = "id, created_at_utc, name, unit, cwd, argv_json, env_json, \
     properties_json, host, user, notes, last_known_state, last_state_at_utc";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("a job with unit {unit} is already registered")]
    Conflict { unit: String },
    #[error("no job with id {id}")]
    NotFound { id: i64 },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("failed to prepare registry directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Retention policy for [`JobStore::prune`]. A record is removed only when
/// every active filter matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrunePolicy {
    /// Protect the `keep` most recently created records. `0` disables the filter.
    pub keep: usize,
    /// Only remove records created before now minus this. Zero disables the filter.
    #[serde(with = "humantime_serde")]
    pub older_than: Option<Duration>,
    /// Only remove records whose cached state is `failed`.
    pub failed_only: bool,
}

impl PrunePolicy {
    pub fn is_noop(&self) -> bool {
        self.keep == 0 && self.age_cutoff().is_none() && !self.failed_only
    }

    fn age_cutoff(&self) -> Option<Duration> {
        self.older_than.filter(|d| !d.is_zero())
    }
}

pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Open (creating if needed) the registry at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        tracing::debug!(path = %path.display(), "opening job registry");
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Make every later insert fail, as a full disk or locked registry would.
    #[cfg(test)]
    pub(crate) fn reject_inserts(&self) {
        self.conn
            .execute_batch(
                "CREATE TRIGGER reject_inserts BEFORE INSERT ON jobs
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("create trigger");
    }

    /// Close the underlying connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            self.conn
                .execute_batch(include_str!("../migrations/0001_jobs.sql"))?;
            self.conn.execute("PRAGMA user_version = 1", [])?;
        }
        Ok(())
    }

    /// Record a new job stamped with the current time. Returns its id.
    pub fn create(&self, job: &NewJob) -> Result<i64, StoreError> {
        self.insert_at(job, OffsetDateTime::now_utc())
    }

    pub(crate) fn insert_at(
        &self,
        job: &NewJob,
        created_at: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let argv_json = to_json(&job.argv)?;
        let env_json = job.env.as_ref().map(to_json).transpose()?;
        let props_json = job.properties.as_ref().map(to_json).transpose()?;

        let inserted = self.conn.execute(
            "
            INSERT INTO jobs (
                created_at_utc, name, unit, cwd, argv_json,
                env_json, properties_json, host, user
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                format_timestamp(created_at),
                job.name,
                job.unit,
                job.cwd.to_string_lossy(),
                argv_json,
                env_json,
                props_json,
                job.host.as_deref().filter(|h| !h.is_empty()),
                job.user.as_deref().filter(|u| !u.is_empty()),
            ],
        );

        match inserted {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict {
                    unit: job.unit.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Job>, StoreError> {
        self.query_one(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"), [Value::Integer(id)])
    }

    pub fn get_by_unit(&self, unit: &str) -> Result<Option<Job>, StoreError> {
        self.query_one(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE unit = ?1"),
            [Value::Text(unit.to_string())],
        )
    }

    /// Look a job up by a user-supplied token: a token that parses as an
    /// integer is an id, anything else is a unit name. There is no fallback
    /// between the two.
    pub fn resolve(&self, token: &str) -> Result<Option<Job>, StoreError> {
        match token.parse::<i64>() {
            Ok(id) => self.get_by_id(id),
            Err(_) => self.get_by_unit(token),
        }
    }

    /// Most recent first. `limit` is ignored when `all` is set.
    pub fn list(&self, limit: usize, all: bool) -> Result<Vec<Job>, StoreError> {
        let limit = if all { -1 } else { sql_limit(limit) };
        self.query_many(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY julianday(created_at_utc) DESC, id DESC LIMIT ?1"
            ),
            [Value::Integer(limit)],
        )
    }

    /// Most recent first, restricted to names starting with `prefix`
    /// (case-sensitive, no wildcards).
    pub fn list_by_name_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE substr(name, 1, length(?1)) = ?1
                 ORDER BY julianday(created_at_utc) DESC, id DESC LIMIT ?2"
            ),
            [Value::Text(prefix.to_string()), Value::Integer(sql_limit(limit))],
        )
    }

    /// Overwrite the cached state of job `id` and stamp it with the current time.
    pub fn update_state(&self, id: i64, state: &JobState) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE jobs SET last_known_state = ?1, last_state_at_utc = ?2 WHERE id = ?3",
            params![
                state.as_str(),
                format_timestamp(OffsetDateTime::now_utc()),
                id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Remove job `id`. Removing an id that does not exist is not an error.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Apply a retention policy and return the number of removed records.
    /// A policy with no active filter removes nothing.
    pub fn prune(&self, policy: &PrunePolicy) -> Result<usize, StoreError> {
        self.prune_at(policy, OffsetDateTime::now_utc())
    }

    pub(crate) fn prune_at(
        &self,
        policy: &PrunePolicy,
        now: OffsetDateTime,
    ) -> Result<usize, StoreError> {
        let mut conditions = Vec::new();
        let mut args = Vec::new();

        if policy.keep > 0 {
            conditions.push(format!(
                "id NOT IN (SELECT id FROM jobs ORDER BY julianday(created_at_utc) DESC, id DESC LIMIT ?{})",
                args.len() + 1
            ));
            args.push(Value::Integer(sql_limit(policy.keep)));
        }

        if let Some(age) = policy.age_cutoff() {
            let age = time::Duration::try_from(age)
                .map_err(|err| StoreError::Timestamp(err.to_string()))?;
            let cutoff = now
                .checked_sub(age)
                .ok_or_else(|| StoreError::Timestamp("prune cutoff out of range".into()))?;
            conditions.push(format!(
                "julianday(created_at_utc) < julianday(?{})",
                args.len() + 1
            ));
            args.push(Value::Text(format_timestamp(cutoff)));
        }

        if policy.failed_only {
            conditions.push(format!("last_known_state = ?{}", args.len() + 1));
            args.push(Value::Text(JobState::Failed.as_str().to_string()));
        }

        if conditions.is_empty() {
            return Ok(0);
        }

        let sql = format!("DELETE FROM jobs WHERE {}", conditions.join(" AND "));
        let removed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(args))?;
        tracing::info!(removed, ?policy, "pruned job registry");
        Ok(removed)
    }

    fn query_one<P: IntoIterator<Item = Value>>(
        &self,
        sql: &str,
        args: P,
    ) -> Result<Option<Job>, StoreError> {
        self.conn
            .query_row(sql, rusqlite::params_from_iter(args), JobRow::from_row)
            .optional()?
            .map(JobRow::into_job)
            .transpose()
    }

    fn query_many<P: IntoIterator<Item = Value>>(
        &self,
        sql: &str,
        args: P,
    ) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), JobRow::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }
}

/// Raw column values, decoded into a [`Job`] outside the rusqlite closure so
/// JSON and timestamp failures keep their own error variants.
struct JobRow {
    id: i64,
    created_at: String,
    name: String,
    unit: String,
    cwd: String,
    argv_json: String,
    env_json: Option<String>,
    props_json: Option<String>,
    host: Option<String>,
    user: Option<String>,
    notes: Option<String>,
    last_known_state: Option<String>,
    last_state_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            name: row.get(2)?,
            unit: row.get(3)?,
            cwd: row.get(4)?,
            argv_json: row.get(5)?,
            env_json: row.get(6)?,
            props_json: row.get(7)?,
            host: row.get(8)?,
            user: row.get(9)?,
            notes: row.get(10)?,
            last_known_state: row.get(11)?,
            last_state_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: self.id,
            created_at: parse_timestamp(&self.created_at)?,
            name: self.name,
            unit: self.unit,
            cwd: PathBuf::from(self.cwd),
            argv: from_json(&self.argv_json)?,
            env: decode_map(self.env_json)?,
            properties: decode_map(self.props_json)?,
            host: self.host,
            user: self.user,
            notes: self.notes,
            last_known_state: self.last_known_state.as_deref().map(JobState::from_raw),
            last_state_at: self
                .last_state_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

fn decode_map(raw: Option<String>) -> Result<Option<BTreeMap<String, String>>, StoreError> {
    // Older registries wrote an empty string instead of NULL.
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(json) => from_json(json).map(Some),
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Fixed-width UTC timestamps. Queries still compare through `julianday` so
/// rows written as plain RFC 3339 order correctly against these.
fn format_timestamp(ts: OffsetDateTime) -> String {
    let ts = ts.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}Z",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second(),
        ts.nanosecond()
    )
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, StoreError> {
    let fixed = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z");
    PrimitiveDateTime::parse(raw, fixed)
        .map(PrimitiveDateTime::assume_utc)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc3339))
        .map_err(|err| StoreError::Timestamp(format!("{raw}: {err}")))
}

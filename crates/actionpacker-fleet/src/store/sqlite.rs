// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed runner store.

use std::path::Path;

use actionpacker_github::{CredentialKind, CredentialRef, RunnerScope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::RunnerStore;
use crate::error::{Error, Result};
use crate::record::{BackendHandle, RunnerEvent, RunnerId, RunnerMode, RunnerRecord, RunnerStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const RUNNER_COLUMNS: &str = r#"
    runner_id, name, mode, scope_kind, scope_owner, scope_repo,
    credential_id, credential_kind, credential_owner, labels, image, status,
    handle_pid, handle_container_id, remote_id, last_error,
    created_at, updated_at, started_at, last_observed_at
"#;

/// SQLite-backed [`RunnerStore`].
#[derive(Clone)]
pub struct SqliteRunnerStore {
    pool: SqlitePool,
}

impl SqliteRunnerStore {
    /// Wrap an existing pool. Call [`SqliteRunnerStore::migrate`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    ///
    /// Parent directories of file databases are created as needed.
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(path) = sqlite_file_path(url)
            && let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url).await
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// File path of a `sqlite:` URL, `None` for in-memory databases.
fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(path)
    }
}

#[derive(sqlx::FromRow)]
struct RunnerRow {
    runner_id: String,
    name: String,
    mode: String,
    scope_kind: String,
    scope_owner: String,
    scope_repo: Option<String>,
    credential_id: String,
    credential_kind: String,
    credential_owner: String,
    labels: String,
    image: Option<String>,
    status: String,
    handle_pid: Option<i64>,
    handle_container_id: Option<String>,
    remote_id: Option<i64>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    last_observed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunnerRow> for RunnerRecord {
    type Error = Error;

    fn try_from(row: RunnerRow) -> Result<Self> {
        let invalid = |what: &str, value: &str| {
            Error::InvalidRecord(format!("runner {}: bad {} {:?}", row.runner_id, what, value))
        };

        let id: RunnerId = row
            .runner_id
            .parse()
            .map_err(|_| invalid("id", &row.runner_id))?;
        let mode = RunnerMode::parse(&row.mode).ok_or_else(|| invalid("mode", &row.mode))?;
        let status =
            RunnerStatus::parse(&row.status).ok_or_else(|| invalid("status", &row.status))?;

        let scope = match (row.scope_kind.as_str(), &row.scope_repo) {
            ("repo", Some(repo)) => RunnerScope::repository(row.scope_owner.clone(), repo.clone()),
            ("org", _) => RunnerScope::organization(row.scope_owner.clone()),
            _ => return Err(invalid("scope", &row.scope_kind)),
        };

        let credential = CredentialRef {
            id: row.credential_id.clone(),
            kind: CredentialKind::parse(&row.credential_kind)
                .ok_or_else(|| invalid("credential kind", &row.credential_kind))?,
            owner: row.credential_owner.clone(),
        };

        let handle = match (mode, row.handle_pid, &row.handle_container_id) {
            (RunnerMode::Process, Some(pid), None) => Some(BackendHandle::Process {
                pid: u32::try_from(pid).map_err(|_| invalid("pid", &pid.to_string()))?,
            }),
            (RunnerMode::Container, None, Some(container_id)) => Some(BackendHandle::Container {
                container_id: container_id.clone(),
            }),
            (_, None, None) => None,
            _ => return Err(invalid("handle for mode", mode.as_str())),
        };

        let labels: Vec<String> = serde_json::from_str(&row.labels)?;

        Ok(RunnerRecord {
            id,
            name: row.name,
            mode,
            scope,
            credential,
            labels,
            image: row.image,
            status,
            handle,
            remote_id: row.remote_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            last_observed_at: row.last_observed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    runner_id: String,
    from_status: Option<String>,
    to_status: String,
    detail: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for RunnerEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        let parse_status = |s: &str| {
            RunnerStatus::parse(s)
                .ok_or_else(|| Error::InvalidRecord(format!("bad event status {:?}", s)))
        };
        Ok(RunnerEvent {
            runner_id: row
                .runner_id
                .parse()
                .map_err(|_| Error::InvalidRecord(format!("bad event runner id {:?}", row.runner_id)))?,
            from_status: row.from_status.as_deref().map(parse_status).transpose()?,
            to_status: parse_status(&row.to_status)?,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

/// Map constraint violations onto fleet errors.
fn map_write_error(record: &RunnerRecord, err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message();
        if db_err.is_unique_violation() {
            if message.contains("handle_pid") || message.contains("handle_container_id") {
                let handle = record
                    .handle
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Error::HandleConflict(format!(
                    "{} is already held by another runner (runner {})",
                    handle, record.id
                ));
            }
            if message.contains("runners.name") {
                return Error::InvalidRecord(format!(
                    "runner name {:?} is already in use",
                    record.name
                ));
            }
        }
        if message.contains("mode is immutable") {
            return Error::ModeImmutable(record.id);
        }
        if db_err.is_check_violation() {
            return Error::InvalidRecord(format!(
                "runner {} in status {} violates record invariants: {}",
                record.id, record.status, message
            ));
        }
    }
    Error::Database(err)
}

fn scope_columns(scope: &RunnerScope) -> (&'static str, &str, Option<&str>) {
    match scope {
        RunnerScope::Repository { owner, repo } => ("repo", owner, Some(repo)),
        RunnerScope::Organization { org } => ("org", org, None),
    }
}

#[async_trait]
impl RunnerStore for SqliteRunnerStore {
    async fn insert(&self, record: &RunnerRecord) -> Result<()> {
        let (scope_kind, scope_owner, scope_repo) = scope_columns(&record.scope);
        let labels = serde_json::to_string(&record.labels)?;

        sqlx::query(
            r#"
            INSERT INTO runners (
                runner_id, name, mode, scope_kind, scope_owner, scope_repo,
                credential_id, credential_kind, credential_owner, labels, image, status,
                handle_pid, handle_container_id, remote_id, last_error,
                created_at, updated_at, started_at, last_observed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(record.mode.as_str())
        .bind(scope_kind)
        .bind(scope_owner)
        .bind(scope_repo)
        .bind(&record.credential.id)
        .bind(record.credential.kind.as_str())
        .bind(&record.credential.owner)
        .bind(labels)
        .bind(&record.image)
        .bind(record.status.as_str())
        .bind(record.pid().map(i64::from))
        .bind(record.container_id())
        .bind(record.remote_id)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.last_observed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(record, e))?;

        Ok(())
    }

    async fn get(&self, id: RunnerId) -> Result<Option<RunnerRecord>> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM runners WHERE runner_id = ?",
            RUNNER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunnerRecord::try_from).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<RunnerRecord>> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM runners WHERE name = ?",
            RUNNER_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunnerRecord::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<RunnerRecord>> {
        let rows = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM runners ORDER BY created_at, runner_id",
            RUNNER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunnerRecord::try_from).collect()
    }

    async fn list_active(&self) -> Result<Vec<RunnerRecord>> {
        let rows = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM runners WHERE status <> 'removed' ORDER BY created_at, runner_id",
            RUNNER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunnerRecord::try_from).collect()
    }

    async fn update(&self, record: &RunnerRecord) -> Result<()> {
        let labels = serde_json::to_string(&record.labels)?;

        let result = sqlx::query(
            r#"
            UPDATE runners
            SET labels = ?, image = ?, status = ?, handle_pid = ?, handle_container_id = ?,
                remote_id = ?, last_error = ?, updated_at = ?, started_at = ?,
                last_observed_at = ?
            WHERE runner_id = ? AND mode = ?
            "#,
        )
        .bind(labels)
        .bind(&record.image)
        .bind(record.status.as_str())
        .bind(record.pid().map(i64::from))
        .bind(record.container_id())
        .bind(record.remote_id)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .bind(record.started_at)
        .bind(record.last_observed_at)
        .bind(record.id.to_string())
        .bind(record.mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(record, e))?;

        if result.rows_affected() == 0 {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT mode FROM runners WHERE runner_id = ?")
                    .bind(record.id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => Error::ModeImmutable(record.id),
                None => Error::RunnerNotFound(record.id),
            });
        }
        Ok(())
    }

    async fn record_event(&self, event: &RunnerEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runner_events (runner_id, from_status, to_status, detail, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.runner_id.to_string())
        .bind(event.from_status.map(|s| s.as_str()))
        .bind(event.to_status.as_str())
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, id: RunnerId) -> Result<Vec<RunnerEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT runner_id, from_status, to_status, detail, created_at
            FROM runner_events
            WHERE runner_id = ?
            ORDER BY id
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunnerEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteRunnerStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        let store = SqliteRunnerStore::new(pool);
        store.migrate().await.expect("Failed to run migrations");
        store
    }

    fn record(name: &str, mode: RunnerMode) -> RunnerRecord {
        RunnerRecord::new(
            RunnerId::new(),
            name,
            mode,
            RunnerScope::repository("org", "repo"),
            CredentialRef::personal_access_token("default", "org"),
            vec!["self-hosted".to_string(), "linux".to_string()],
            None,
        )
    }

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(sqlite_file_path("sqlite:.data/fleet.db?mode=rwc"), Some(".data/fleet.db"));
        assert_eq!(sqlite_file_path("sqlite:///var/lib/a.db"), Some("/var/lib/a.db"));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x"), None);
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = test_store().await;
        let record = record("r1", RunnerMode::Process);
        store.insert(&record).await.unwrap();

        let loaded = store.get(record.id).await.unwrap().expect("record should exist");
        assert_eq!(loaded.name, "r1");
        assert_eq!(loaded.scope, record.scope);
        assert_eq!(loaded.credential, record.credential);
        assert_eq!(loaded.labels, record.labels);
        assert_eq!(loaded.status, RunnerStatus::Pending);

        assert!(store.find_by_name("r1").await.unwrap().is_some());
        assert!(store.get(RunnerId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rejects_mode_change() {
        let store = test_store().await;
        let mut record = record("r1", RunnerMode::Process);
        store.insert(&record).await.unwrap();

        record.mode = RunnerMode::Container;
        assert!(matches!(
            store.update(&record).await,
            Err(Error::ModeImmutable(_))
        ));
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().mode,
            RunnerMode::Process
        );
    }

    #[tokio::test]
    async fn test_update_unknown_runner() {
        let store = test_store().await;
        let record = record("r1", RunnerMode::Process);
        assert!(matches!(
            store.update(&record).await,
            Err(Error::RunnerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_running_requires_handle() {
        let store = test_store().await;
        let mut record = record("r1", RunnerMode::Process);
        store.insert(&record).await.unwrap();

        record.status = RunnerStatus::Running;
        assert!(matches!(
            store.update(&record).await,
            Err(Error::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_list_active_excludes_removed() {
        let store = test_store().await;
        let mut removed = record("r1", RunnerMode::Container);
        store.insert(&removed).await.unwrap();
        store.insert(&record("r2", RunnerMode::Process)).await.unwrap();

        removed.status = RunnerStatus::Removed;
        store.update(&removed).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "r2");
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let store = test_store().await;
        let record = record("r1", RunnerMode::Process);
        store.insert(&record).await.unwrap();

        store
            .record_event(&RunnerEvent::new(record.id, None, RunnerStatus::Pending, "created"))
            .await
            .unwrap();
        store
            .record_event(&RunnerEvent::new(
                record.id,
                Some(RunnerStatus::Pending),
                RunnerStatus::Configuring,
                "configuring",
            ))
            .await
            .unwrap();

        let events = store.list_events(record.id).await.unwrap();
        let statuses: Vec<_> = events.iter().map(|e| e.to_status).collect();
        assert_eq!(statuses, [RunnerStatus::Pending, RunnerStatus::Configuring]);
        assert_eq!(events[1].from_status, Some(RunnerStatus::Pending));
    }
}

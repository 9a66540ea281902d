//! libSQL storage for the external-call cache and run history.
//!
//! Both tables are append-only. The call cache is keyed by a content hash of
//! the request (model, schema, prompt, grounding), so concurrent keyword runs
//! may share one [`Storage`] without coordination: a second insert for the
//! same key is ignored and the first response wins.
//!
//! **Access rules:**
//! - pipeline runs: read-write via [`Storage::open`]
//! - `articleforge history`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use articleforge_shared::{ArticleForgeError, CallTally, Result};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ArticleForgeError::Storage(format!("unknown run status: {other}"))),
        }
    }
}

/// One finished keyword run, as kept in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub batch_id: String,
    pub job_id: Option<String>,
    pub keyword: String,
    pub status: RunStatus,
    pub failed_stage: Option<String>,
    pub error_kind: Option<String>,
    pub message: Option<String>,
    pub calls: CallTally,
    pub output_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn completed(
        batch_id: impl Into<String>,
        job_id: impl Into<String>,
        keyword: impl Into<String>,
        calls: CallTally,
        output_path: Option<String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            job_id: Some(job_id.into()),
            keyword: keyword.into(),
            status: RunStatus::Completed,
            failed_stage: None,
            error_kind: None,
            message: None,
            calls,
            output_path,
            created_at: Utc::now(),
        }
    }

    pub fn failed(
        batch_id: impl Into<String>,
        job_id: Option<String>,
        keyword: impl Into<String>,
        stage: impl Into<String>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
        calls: CallTally,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            job_id,
            keyword: keyword.into(),
            status: RunStatus::Failed,
            failed_stage: Some(stage.into()),
            error_kind: Some(error_kind.into()),
            message: Some(message.into()),
            calls,
            output_path: None,
            created_at: Utc::now(),
        }
    }
}

fn storage_err(e: impl std::fmt::Display) -> ArticleForgeError {
    ArticleForgeError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArticleForgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ArticleForgeError::Storage(format!(
                "no database at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ArticleForgeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ArticleForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Call cache
    // -----------------------------------------------------------------------

    /// Cached response JSON for `key`, if any.
    pub async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response_json FROM call_cache WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Record a response under `key`. An existing entry is never overwritten.
    ///
    /// Returns whether a new row was written.
    pub async fn cache_put(&self, key: &str, model: &str, response_json: &str) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO call_cache (key, model, response_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, model, response_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(inserted > 0)
    }

    /// Number of cached responses.
    pub async fn cache_len(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM call_cache", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Append one run to history.
    pub async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let calls_json = serde_json::to_string(&run.calls)
            .map_err(|e| ArticleForgeError::Storage(format!("serialize calls: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO runs (id, batch_id, job_id, keyword, status, failed_stage, error_kind, message, calls_json, output_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id.as_str(),
                    run.batch_id.as_str(),
                    run.job_id.as_deref(),
                    run.keyword.as_str(),
                    run.status.as_str(),
                    run.failed_stage.as_deref(),
                    run.error_kind.as_deref(),
                    run.message.as_deref(),
                    calls_json.as_str(),
                    run.output_path.as_deref(),
                    run.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT batch_id, job_id, keyword, status, failed_stage, error_kind, message, calls_json, output_path, created_at
                 FROM runs
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let status: String = row.get(3).map_err(storage_err)?;
    let calls_json: String = row.get(7).map_err(storage_err)?;
    let created_at: String = row.get(9).map_err(storage_err)?;

    Ok(RunRecord {
        batch_id: row.get::<String>(0).map_err(storage_err)?,
        job_id: row.get::<String>(1).ok(),
        keyword: row.get::<String>(2).map_err(storage_err)?,
        status: RunStatus::parse(&status)?,
        failed_stage: row.get::<String>(4).ok(),
        error_kind: row.get::<String>(5).ok(),
        message: row.get::<String>(6).ok(),
        calls: serde_json::from_str(&calls_json).map_err(storage_err)?,
        output_path: row.get::<String>(8).ok(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(storage_err)?,
    })
}

//! SQL migrations for the articleforge database.
//!
//! Applied in order on open. Both tables are append-only: rows are inserted
//! and read, never updated in place.

pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: call_cache, runs",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- External call responses keyed by sha256(model, schema, prompt, grounding)
CREATE TABLE IF NOT EXISTS call_cache (
    key           TEXT PRIMARY KEY,
    model         TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

-- One row per finished keyword run
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    batch_id      TEXT NOT NULL,
    job_id        TEXT,
    keyword       TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
    failed_stage  TEXT,
    error_kind    TEXT,
    message       TEXT,
    calls_json    TEXT NOT NULL,
    output_path   TEXT,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_batch ON runs(batch_id);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

//! SQLite-backed store for the goal tree and governance tables.
//!
//! One `Connection` behind a mutex is the whole concurrency story: holding
//! the mutex for the span of a transaction is the single-node pessimistic
//! lock the orchestration pipeline relies on. A unit of work either commits
//! every staged write or none of them; no component may open its own
//! independent transaction while an orchestrated operation is in flight.

mod uow;

pub use uow::UnitOfWork;

use anyhow::Context;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::error::Result;

const SCHEMA: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS goals (
    id                TEXT PRIMARY KEY,
    parent_id         TEXT REFERENCES goals(id),
    title             TEXT NOT NULL,
    description       TEXT NOT NULL DEFAULT '',
    goal_type         TEXT NOT NULL,
    depth_level       INTEGER NOT NULL,
    is_atomic         INTEGER NOT NULL,
    domains           TEXT NOT NULL DEFAULT '[]',
    status            TEXT NOT NULL,
    completion_mode   TEXT NOT NULL,
    progress          REAL NOT NULL DEFAULT 0,
    contract          TEXT NOT NULL,
    mutation_status   TEXT NOT NULL,
    mutation_history  TEXT NOT NULL DEFAULT '[]',
    evaluation_result TEXT,
    execution_trace   TEXT NOT NULL DEFAULT '{\"steps\":[]}',
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_goals_parent ON goals(parent_id);
CREATE INDEX IF NOT EXISTS idx_goals_status ON goals(status);
CREATE INDEX IF NOT EXISTS idx_goals_created ON goals(created_at);

CREATE TABLE IF NOT EXISTS goal_completion_approvals (
    goal_id         TEXT PRIMARY KEY,
    approved_by     TEXT NOT NULL,
    authority_level TEXT NOT NULL,
    comment         TEXT NOT NULL DEFAULT '',
    approved_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transition_audit (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    goal_id     TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    reason      TEXT NOT NULL,
    actor       TEXT NOT NULL,
    source      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_goal ON transition_audit(goal_id);

CREATE TABLE IF NOT EXISTS artifacts (
    id                  TEXT PRIMARY KEY,
    goal_id             TEXT NOT NULL,
    kind                TEXT NOT NULL,
    content             TEXT NOT NULL DEFAULT '',
    verification_status TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_goal ON artifacts(goal_id);

CREATE TABLE IF NOT EXISTS policy_rules (
    name                 TEXT PRIMARY KEY,
    entity_name          TEXT NOT NULL,
    entity_type          TEXT NOT NULL,
    condition_expression TEXT NOT NULL,
    action_type          TEXT NOT NULL,
    action_payload       TEXT NOT NULL DEFAULT 'null',
    priority             INTEGER NOT NULL DEFAULT 100,
    cooldown_minutes     INTEGER NOT NULL DEFAULT 0,
    last_triggered       TEXT,
    enabled              INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_rules_entity ON policy_rules(entity_name);

CREATE TABLE IF NOT EXISTS safety_constraints (
    constraint_type TEXT PRIMARY KEY,
    limit_value     REAL NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS safety_violation_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    constraint_type TEXT NOT NULL,
    limit_value     REAL NOT NULL,
    current_value   REAL NOT NULL,
    action          TEXT NOT NULL,
    detail          TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS spend_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    amount     REAL NOT NULL,
    purpose    TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_state (
    entity_name            TEXT PRIMARY KEY,
    entity_type            TEXT NOT NULL,
    current_value          REAL NOT NULL,
    previous_value         REAL,
    confidence             REAL NOT NULL DEFAULT 0.5,
    trend                  TEXT NOT NULL DEFAULT 'stable',
    rolling_average        REAL NOT NULL DEFAULT 0,
    evaluation_window_days INTEGER NOT NULL DEFAULT 7,
    trend_history          TEXT NOT NULL DEFAULT '[]',
    updated_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS strategies (
    id                TEXT PRIMARY KEY,
    hypothesis        TEXT NOT NULL,
    expected_outcome  TEXT NOT NULL,
    status            TEXT NOT NULL,
    confidence        REAL NOT NULL,
    linked_goal_ids   TEXT NOT NULL DEFAULT '[]',
    activated_at      TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
";

pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `<workspace>/.telos/telos.db`.
    pub fn open(workspace_dir: &Path) -> anyhow::Result<Self> {
        let dir = workspace_dir.join(".telos");
        std::fs::create_dir_all(&dir)?;
        let db_path = dir.join("telos.db");

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open goal store at {db_path:?}"))?;
        conn.execute_batch(SCHEMA)?;

        info!("Store opened at {:?}", db_path);

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Run `f` inside one transaction scope: commit on `Ok`, roll back on
    /// `Err`. The connection mutex is held for the duration, which is the
    /// row-locking contract every orchestrated operation relies on.
    pub fn with_uow<T>(&self, f: impl FnOnce(&UnitOfWork<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let uow = UnitOfWork::new(tx);
        match f(&uow) {
            Ok(value) => {
                uow.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(uow);
                Err(e)
            }
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Snapshot counts for operator-facing stats.
    pub fn stats(&self) -> Result<OrchestratorStats> {
        self.with_uow(|uow| uow.goal_stats())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OrchestratorStats {
    pub total_goals: u64,
    pub by_status: HashMap<String, u64>,
    pub by_type: HashMap<String, u64>,
    pub atomic_goals: u64,
    pub safety_violations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractValidator;
    use crate::error::TelosError;
    use crate::goal::{Goal, GoalType};

    fn sample_goal() -> Goal {
        let contract = ContractValidator::default_contract(GoalType::Achievable, 0);
        Goal::new("ship it", "desc", GoalType::Achievable, None, false, contract)
    }

    #[test]
    fn commit_on_success_rollback_on_error() {
        let store = Store::open_in_memory().unwrap();
        let goal = sample_goal();

        store.with_uow(|uow| uow.insert_goal(&goal)).unwrap();

        // A failing unit of work must leave no trace.
        let doomed = sample_goal();
        let doomed_id = doomed.id.clone();
        let result: Result<()> = store.with_uow(|uow| {
            uow.insert_goal(&doomed)?;
            Err(TelosError::InvalidOperation("forced failure".into()))
        });
        assert!(result.is_err());

        store
            .with_uow(|uow| {
                assert!(uow.get_goal(&goal.id)?.is_some());
                assert!(uow.get_goal(&doomed_id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn open_creates_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.db_path().exists());
    }

    #[test]
    fn stats_counts_by_status() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_uow(|uow| {
                uow.insert_goal(&sample_goal())?;
                uow.insert_goal(&sample_goal())?;
                Ok(())
            })
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_goals, 2);
        assert_eq!(stats.by_status.get("pending"), Some(&2));
    }
}

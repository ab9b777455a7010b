//! Edge store for learned (step, tactic) arms
//!
//! The engine talks to persistence through [`EdgeStore`]. The shipped
//! implementation, [`SqliteEdgeStore`], keeps the graph in three tables
//! (steps, tactics, step_tactic_edges) plus an append-only decision log.
//!
//! Every method is a short, self-contained call. The engine's
//! read-decay-write update therefore spans several calls and is *not*
//! atomic: two concurrent updates to the same edge can lose one increment
//! (last writer wins). Different edges never interfere.

use crate::policy::Policy;
use crate::types::{DecisionRecord, EdgeSnapshot, LoggedTactic};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence seam for edges and decision records
pub trait EdgeStore: Send + Sync {
    /// Create the step, tactic and edge (uniform prior) if absent; return
    /// the current snapshot
    fn ensure_edge(&self, step: &str, tactic: &str) -> StoreResult<EdgeSnapshot>;

    /// All outgoing edges of `step`, ordered by tactic name
    fn fetch_edges(&self, step: &str) -> StoreResult<Vec<EdgeSnapshot>>;

    /// Overwrite both pseudo-counts, bump `count`, set `last_updated = now`
    fn write_edge(
        &self,
        step: &str,
        tactic: &str,
        alpha: f64,
        beta: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Remove the named edges of `step`; returns how many were deleted
    fn delete_edges(&self, step: &str, tactics: &[String]) -> StoreResult<usize>;

    /// Remove edges of `step` last updated strictly before `cutoff`
    ///
    /// Edges that were never updated are kept.
    fn delete_stale_edges(&self, step: &str, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// Attach (or clear) the cost used by the hybrid policy
    fn set_edge_cost(&self, step: &str, tactic: &str, cost: Option<f64>) -> StoreResult<usize>;

    /// Append an immutable decision record
    fn append_decision(&self, record: &DecisionRecord) -> StoreResult<()>;

    /// Decision records for `step`, oldest first
    fn decisions_for_step(&self, step: &str) -> StoreResult<Vec<DecisionRecord>>;

    /// Names of all known steps
    fn list_steps(&self) -> StoreResult<Vec<String>>;

    fn fetch_edge(&self, step: &str, tactic: &str) -> StoreResult<Option<EdgeSnapshot>> {
        Ok(self
            .fetch_edges(step)?
            .into_iter()
            .find(|e| e.tactic == tactic))
    }
}

const SCHEMA: &str = r#"
-- Steps: decision points in the guided dialogue
CREATE TABLE IF NOT EXISTS steps (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Tactics: reusable strategy choices
CREATE TABLE IF NOT EXISTS tactics (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Learned arms: one Beta-Bernoulli posterior per (step, tactic)
CREATE TABLE IF NOT EXISTS step_tactic_edges (
    step TEXT NOT NULL REFERENCES steps(name),
    tactic TEXT NOT NULL REFERENCES tactics(name),
    alpha REAL NOT NULL DEFAULT 1.0,    -- successes + 1 (decayed)
    beta REAL NOT NULL DEFAULT 1.0,     -- failures + 1 (decayed)
    count INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER,               -- epoch ms, NULL = never updated
    cost REAL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (step, tactic)
);

CREATE INDEX IF NOT EXISTS idx_edges_last_updated ON step_tactic_edges(step, last_updated);

-- Decision log for off-policy evaluation (append-only)
CREATE TABLE IF NOT EXISTS decision_records (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    step TEXT NOT NULL REFERENCES steps(name),
    tactic TEXT NOT NULL REFERENCES tactics(name),
    success INTEGER NOT NULL,
    policy TEXT,                        -- NULL = not from a tracked recommendation
    propensity REAL,                    -- NULL = exclude from IPS estimates
    recommendation_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_step ON decision_records(step);
CREATE INDEX IF NOT EXISTS idx_decisions_conversation ON decision_records(conversation_id);
"#;

/// SQLite-backed [`EdgeStore`]
pub struct SqliteEdgeStore {
    conn: Mutex<Connection>,
}

impl SqliteEdgeStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn require_name(kind: &str, name: &str) -> StoreResult<()> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!("{} name cannot be empty", kind)));
    }
    Ok(())
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn ensure_nodes(conn: &Connection, step: &str, tactic: &str, now_ms: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO steps (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![step, now_ms],
    )?;
    conn.execute(
        "INSERT INTO tactics (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![tactic, now_ms],
    )?;
    Ok(())
}

const EDGE_COLUMNS: &str = "step, tactic, alpha, beta, count, last_updated, cost";

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<EdgeSnapshot> {
    let last_updated: Option<i64> = row.get(5)?;
    Ok(EdgeSnapshot {
        step: row.get(0)?,
        tactic: row.get(1)?,
        alpha: row.get(2)?,
        beta: row.get(3)?,
        count: row.get(4)?,
        last_updated: last_updated.and_then(from_millis),
        cost: row.get(6)?,
    })
}

impl EdgeStore for SqliteEdgeStore {
    fn ensure_edge(&self, step: &str, tactic: &str) -> StoreResult<EdgeSnapshot> {
        require_name("step", step)?;
        require_name("tactic", tactic)?;

        let now_ms = to_millis(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        ensure_nodes(&tx, step, tactic, now_ms)?;
        tx.execute(
            r#"
            INSERT INTO step_tactic_edges (step, tactic, alpha, beta, count, created_at)
            VALUES (?1, ?2, 1.0, 1.0, 0, ?3)
            ON CONFLICT(step, tactic) DO NOTHING
            "#,
            params![step, tactic, now_ms],
        )?;

        let edge = tx.query_row(
            &format!(
                "SELECT {} FROM step_tactic_edges WHERE step = ?1 AND tactic = ?2",
                EDGE_COLUMNS
            ),
            params![step, tactic],
            edge_from_row,
        )?;

        tx.commit()?;
        Ok(edge)
    }

    fn fetch_edges(&self, step: &str) -> StoreResult<Vec<EdgeSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM step_tactic_edges WHERE step = ?1 ORDER BY tactic",
            EDGE_COLUMNS
        ))?;

        let edges = stmt
            .query_map([step], edge_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    fn write_edge(
        &self,
        step: &str,
        tactic: &str,
        alpha: f64,
        beta: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        require_name("step", step)?;
        require_name("tactic", tactic)?;

        let now_ms = to_millis(now);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // The edge may have been pruned since it was read; recreate it
        ensure_nodes(&tx, step, tactic, now_ms)?;
        tx.execute(
            r#"
            INSERT INTO step_tactic_edges (step, tactic, alpha, beta, count, last_updated, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
            ON CONFLICT(step, tactic) DO UPDATE SET
                alpha = excluded.alpha,
                beta = excluded.beta,
                count = count + 1,
                last_updated = excluded.last_updated
            "#,
            params![step, tactic, alpha, beta, now_ms],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn delete_edges(&self, step: &str, tactics: &[String]) -> StoreResult<usize> {
        if tactics.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt =
                tx.prepare("DELETE FROM step_tactic_edges WHERE step = ?1 AND tactic = ?2")?;
            for tactic in tactics {
                deleted += stmt.execute(params![step, tactic])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_stale_edges(&self, step: &str, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            r#"
            DELETE FROM step_tactic_edges
            WHERE step = ?1 AND last_updated IS NOT NULL AND last_updated < ?2
            "#,
            params![step, to_millis(cutoff)],
        )?;
        Ok(deleted)
    }

    fn set_edge_cost(&self, step: &str, tactic: &str, cost: Option<f64>) -> StoreResult<usize> {
        if let Some(c) = cost {
            if !c.is_finite() {
                return Err(StoreError::InvalidInput(format!("cost must be finite, got {}", c)));
            }
        }

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE step_tactic_edges SET cost = ?3 WHERE step = ?1 AND tactic = ?2",
            params![step, tactic, cost],
        )?;
        Ok(updated)
    }

    fn append_decision(&self, record: &DecisionRecord) -> StoreResult<()> {
        require_name("step", &record.step)?;
        require_name("tactic", &record.tactic)?;

        let recommendation_json = serde_json::to_string(&record.recommendation)?;
        let created_ms = to_millis(record.created_at);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_nodes(&tx, &record.step, &record.tactic, created_ms)?;
        tx.execute(
            r#"
            INSERT INTO decision_records (id, conversation_id, step, tactic, success,
                                          policy, propensity, recommendation_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.conversation_id,
                record.step,
                record.tactic,
                record.success as i32,
                record.policy.map(|p| p.name()),
                record.propensity,
                recommendation_json,
                created_ms,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn decisions_for_step(&self, step: &str) -> StoreResult<Vec<DecisionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, conversation_id, step, tactic, success, policy, propensity,
                   recommendation_json, created_at
            FROM decision_records
            WHERE step = ?1
            ORDER BY created_at, rowid
            "#,
        )?;

        let rows = stmt
            .query_map([step], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, conversation_id, step, tactic, success, policy, propensity, json, created) in rows {
            let recommendation: Vec<LoggedTactic> = serde_json::from_str(&json)?;
            let created_at = from_millis(created).ok_or_else(|| {
                StoreError::InvalidInput(format!("bad created_at {} on decision {}", created, id))
            })?;
            records.push(DecisionRecord {
                id,
                conversation_id,
                step,
                tactic,
                success: success != 0,
                policy: policy.and_then(|p| p.parse::<Policy>().ok()),
                propensity,
                recommendation,
                created_at,
            });
        }
        Ok(records)
    }

    fn list_steps(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM steps ORDER BY name")?;
        let steps = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(steps)
    }

    fn fetch_edge(&self, step: &str, tactic: &str) -> StoreResult<Option<EdgeSnapshot>> {
        let conn = self.conn()?;
        let edge = conn
            .query_row(
                &format!(
                    "SELECT {} FROM step_tactic_edges WHERE step = ?1 AND tactic = ?2",
                    EDGE_COLUMNS
                ),
                params![step, tactic],
                edge_from_row,
            )
            .optional()?;
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn setup_test_store() -> (SqliteEdgeStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteEdgeStore::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000).unwrap()
    }

    #[test]
    fn test_schema_tables_exist() {
        let (store, _dir) = setup_test_store();
        let conn = store.conn().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in ["steps", "tactics", "step_tactic_edges", "decision_records"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_ensure_edge_is_idempotent() {
        let (store, _dir) = setup_test_store();

        let first = store.ensure_edge("Discovery", "OpenQuestion").unwrap();
        assert_eq!(first.alpha, 1.0);
        assert_eq!(first.beta, 1.0);
        assert_eq!(first.count, 0);
        assert!(first.last_updated.is_none());

        store.write_edge("Discovery", "OpenQuestion", 4.0, 2.0, now()).unwrap();
        let second = store.ensure_edge("Discovery", "OpenQuestion").unwrap();
        assert_eq!(second.alpha, 4.0);
        assert_eq!(second.beta, 2.0);
        assert_eq!(second.count, 1);
        assert_eq!(second.last_updated, Some(now()));

        assert_eq!(store.fetch_edges("Discovery").unwrap().len(), 1);
        assert_eq!(store.list_steps().unwrap(), vec!["Discovery".to_string()]);
    }

    #[test]
    fn test_ensure_edge_rejects_blank_names() {
        let (store, _dir) = setup_test_store();
        assert!(matches!(
            store.ensure_edge("  ", "OpenQuestion"),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.ensure_edge("Discovery", ""),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_write_edge_counts_and_recreates() {
        let (store, _dir) = setup_test_store();

        store.write_edge("Pitch", "CaseStudy", 2.0, 1.0, now()).unwrap();
        store.write_edge("Pitch", "CaseStudy", 3.0, 1.0, now()).unwrap();

        let edge = store.fetch_edge("Pitch", "CaseStudy").unwrap().unwrap();
        assert_eq!(edge.count, 2);
        assert_eq!(edge.alpha, 3.0);
    }

    #[test]
    fn test_fetch_edges_sorted_and_scoped() {
        let (store, _dir) = setup_test_store();
        for tactic in ["Zeta", "Alpha", "Mid"] {
            store.ensure_edge("Close", tactic).unwrap();
        }
        store.ensure_edge("Other", "Alpha").unwrap();

        let names: Vec<_> = store
            .fetch_edges("Close")
            .unwrap()
            .into_iter()
            .map(|e| e.tactic)
            .collect();
        assert_eq!(names, vec!["Alpha", "Mid", "Zeta"]);
        assert!(store.fetch_edges("Nowhere").unwrap().is_empty());
    }

    #[test]
    fn test_delete_edges() {
        let (store, _dir) = setup_test_store();
        for tactic in ["a", "b", "c"] {
            store.ensure_edge("S", tactic).unwrap();
        }

        let deleted = store
            .delete_edges("S", &["a".to_string(), "c".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.fetch_edges("S").unwrap().len(), 1);
        assert_eq!(store.delete_edges("S", &[]).unwrap(), 0);
    }

    #[test]
    fn test_delete_stale_edges_keeps_fresh_and_unanchored() {
        let (store, _dir) = setup_test_store();
        store.write_edge("S", "old", 2.0, 2.0, now() - Duration::days(40)).unwrap();
        store.write_edge("S", "fresh", 2.0, 2.0, now() - Duration::days(1)).unwrap();
        store.ensure_edge("S", "never").unwrap();

        let deleted = store.delete_stale_edges("S", now() - Duration::days(30)).unwrap();
        assert_eq!(deleted, 1);

        let names: Vec<_> = store.fetch_edges("S").unwrap().into_iter().map(|e| e.tactic).collect();
        assert_eq!(names, vec!["fresh", "never"]);
    }

    #[test]
    fn test_set_edge_cost() {
        let (store, _dir) = setup_test_store();
        store.ensure_edge("S", "t").unwrap();

        assert_eq!(store.set_edge_cost("S", "t", Some(0.4)).unwrap(), 1);
        assert_eq!(store.fetch_edge("S", "t").unwrap().unwrap().cost, Some(0.4));

        assert_eq!(store.set_edge_cost("S", "t", None).unwrap(), 1);
        assert_eq!(store.fetch_edge("S", "t").unwrap().unwrap().cost, None);

        assert!(store.set_edge_cost("S", "t", Some(f64::NAN)).is_err());
    }

    #[test]
    fn test_decision_round_trip() {
        let (store, _dir) = setup_test_store();
        let record = DecisionRecord {
            id: "dec-1".to_string(),
            conversation_id: "lead-42".to_string(),
            step: "Discovery".to_string(),
            tactic: "OpenQuestion".to_string(),
            success: true,
            policy: Some(Policy::Hybrid),
            propensity: Some(0.7),
            recommendation: vec![LoggedTactic {
                tactic: "OpenQuestion".to_string(),
                estimated_success_probability: 0.8,
                propensity: 0.7,
            }],
            created_at: now(),
        };
        store.append_decision(&record).unwrap();

        let untracked = DecisionRecord {
            id: "dec-2".to_string(),
            policy: None,
            propensity: None,
            recommendation: vec![],
            created_at: now() + Duration::seconds(1),
            ..record.clone()
        };
        store.append_decision(&untracked).unwrap();

        let records = store.decisions_for_step("Discovery").unwrap();
        assert_eq!(records, vec![record, untracked]);
    }

    #[test]
    fn test_decision_ids_are_unique() {
        let (store, _dir) = setup_test_store();
        let record = DecisionRecord {
            id: "dup".to_string(),
            conversation_id: "c".to_string(),
            step: "S".to_string(),
            tactic: "t".to_string(),
            success: false,
            policy: None,
            propensity: None,
            recommendation: vec![],
            created_at: now(),
        };
        store.append_decision(&record).unwrap();
        assert!(store.append_decision(&record).is_err());
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteEdgeStore::open_in_memory().unwrap();
        store.ensure_edge("S", "t").unwrap();
        assert_eq!(store.fetch_edges("S").unwrap().len(), 1);
    }
}

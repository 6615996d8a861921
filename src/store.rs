// 💾 Allocation store - idempotent persistence of materialized records
// The store is a plain key-value collaborator (get/put, no transactions).
// Idempotency lives in the writer, not the store: records are keyed by the
// deterministic (baseline, rubro, month) composite, reads happen before
// writes, and a no-op rewrite is skipped. Re-running materialization after a
// partial failure resumes cleanly and never double-counts.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::warn;

/// Two-decimal currency equality (amounts are rounded at computation time).
fn amounts_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005
}

// ============================================================================
// ALLOCATION RECORD
// ============================================================================

/// One materialized (category × month) cost cell.
///
/// Exactly one record exists per `(baseline_id, canonical_rubro_id,
/// month_index)` - that tuple is the idempotency key. Created by the
/// expander; `actual_amount` is filled by the invoice matcher and
/// `forecast_amount` adjusted by the change distributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub project_id: String,
    pub baseline_id: String,
    pub canonical_rubro_id: String,

    /// 1-based project-relative month; unbounded upward (multi-year)
    pub month_index: u32,

    pub planned_amount: f64,
    pub forecast_amount: f64,

    /// None until invoices are reconciled against this cell
    #[serde(default)]
    pub actual_amount: Option<f64>,

    /// Fingerprint of the originating estimate item. Diagnostics only -
    /// never dereferenced for ownership.
    #[serde(default)]
    pub source_item_ref: Option<String>,

    /// Every known synonym for this cell's identity, precomputed at
    /// materialization time for the invoice matcher's alias layer.
    #[serde(default)]
    pub matching_ids: Vec<String>,
}

impl AllocationRecord {
    /// Deterministic composite store key, DynamoDB-style.
    pub fn store_key(&self) -> String {
        format!(
            "BASELINE#{}#RUBRO#{}#M{}",
            self.baseline_id, self.canonical_rubro_id, self.month_index
        )
    }
}

// ============================================================================
// STORE TRAIT + IMPLEMENTATIONS
// ============================================================================

/// Key-value collaborator holding allocation records. Absence is `None`,
/// never an error.
pub trait AllocationStore {
    fn get(&self, store_key: &str) -> Result<Option<AllocationRecord>>;
    fn put(&self, record: &AllocationRecord) -> Result<()>;
    fn list_baseline(&self, baseline_id: &str) -> Result<Vec<AllocationRecord>>;

    /// Explicit re-materialization support (rare). Returns deleted count.
    fn delete_baseline(&self, baseline_id: &str) -> Result<usize>;
}

/// SQLite-backed store (WAL mode), one row per allocation record.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening allocation store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;
        let store = SqliteStore { conn };
        store.setup()?;
        Ok(store)
    }

    /// In-memory store, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory store")?;
        let store = SqliteStore { conn };
        store.setup()?;
        Ok(store)
    }

    fn setup(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS allocations (
                store_key          TEXT PRIMARY KEY,
                project_id         TEXT NOT NULL,
                baseline_id        TEXT NOT NULL,
                canonical_rubro_id TEXT NOT NULL,
                month_index        INTEGER NOT NULL,
                planned_amount     REAL NOT NULL,
                forecast_amount    REAL NOT NULL,
                actual_amount      REAL,
                source_item_ref    TEXT,
                matching_ids       TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_allocations_baseline
                ON allocations (baseline_id);",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AllocationRecord> {
        // Month indexes are 1-based; a zero, negative or oversized stored
        // value is a corrupt row and surfaces as a per-record error rather
        // than silently truncating into a bogus month
        let raw_month: i64 = row.get("month_index")?;
        let month_index = u32::try_from(raw_month)
            .ok()
            .filter(|m| *m >= 1)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, raw_month))?;
        let matching_ids_raw: String = row.get("matching_ids")?;
        Ok(AllocationRecord {
            project_id: row.get("project_id")?,
            baseline_id: row.get("baseline_id")?,
            canonical_rubro_id: row.get("canonical_rubro_id")?,
            month_index,
            planned_amount: row.get("planned_amount")?,
            forecast_amount: row.get("forecast_amount")?,
            actual_amount: row.get("actual_amount")?,
            source_item_ref: row.get("source_item_ref")?,
            matching_ids: serde_json::from_str(&matching_ids_raw).unwrap_or_default(),
        })
    }
}

impl AllocationStore for SqliteStore {
    fn get(&self, store_key: &str) -> Result<Option<AllocationRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT * FROM allocations WHERE store_key = ?1")?;
        let mut rows = stmt.query_map(params![store_key], Self::row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: &AllocationRecord) -> Result<()> {
        let matching_ids = serde_json::to_string(&record.matching_ids)?;
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO allocations
                 (store_key, project_id, baseline_id, canonical_rubro_id, month_index,
                  planned_amount, forecast_amount, actual_amount, source_item_ref, matching_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?
            .execute(params![
                record.store_key(),
                record.project_id,
                record.baseline_id,
                record.canonical_rubro_id,
                record.month_index as i64,
                record.planned_amount,
                record.forecast_amount,
                record.actual_amount,
                record.source_item_ref,
                matching_ids,
            ])?;
        Ok(())
    }

    fn list_baseline(&self, baseline_id: &str) -> Result<Vec<AllocationRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT * FROM allocations WHERE baseline_id = ?1
             ORDER BY canonical_rubro_id, month_index",
        )?;
        let rows = stmt.query_map(params![baseline_id], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_baseline(&self, baseline_id: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM allocations WHERE baseline_id = ?1", params![baseline_id])?;
        Ok(deleted)
    }
}

/// In-memory store backed by a RwLock'd map. Same contract as SQLite.
pub struct MemoryStore {
    records: RwLock<HashMap<String, AllocationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationStore for MemoryStore {
    fn get(&self, store_key: &str) -> Result<Option<AllocationRecord>> {
        Ok(self.records.read().unwrap().get(store_key).cloned())
    }

    fn put(&self, record: &AllocationRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.store_key(), record.clone());
        Ok(())
    }

    fn list_baseline(&self, baseline_id: &str) -> Result<Vec<AllocationRecord>> {
        let mut records: Vec<AllocationRecord> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.baseline_id == baseline_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.canonical_rubro_id
                .cmp(&b.canonical_rubro_id)
                .then(a.month_index.cmp(&b.month_index))
        });
        Ok(records)
    }

    fn delete_baseline(&self, baseline_id: &str) -> Result<usize> {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, r| r.baseline_id != baseline_id);
        Ok(before - records.len())
    }
}

// ============================================================================
// IDEMPOTENT UPSERT WRITER
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// Rewrite cells whose stored value is exactly zero even when the
    /// computed value is also zero. Recovery switch for prior runs that
    /// wrote placeholder zeros before failing.
    pub force_rewrite_zeros: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertError {
    pub store_key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertSummary {
    pub attempted: usize,
    pub written: usize,
    pub skipped: usize,
    pub errors: Vec<UpsertError>,
}

/// Idempotently upsert expanded allocation records.
///
/// Per record: read the stored value; skip when planned and forecast already
/// match (unless the zero-rewrite override applies); otherwise write, carrying
/// forward any reconciled `actual_amount` already on the stored record.
/// Individual failures are collected and the batch continues - the caller may
/// retry just the failed subset under the same keys.
pub fn upsert_allocations(
    store: &dyn AllocationStore,
    records: &[AllocationRecord],
    options: UpsertOptions,
) -> UpsertSummary {
    let mut summary = UpsertSummary::default();

    for record in records {
        summary.attempted += 1;
        let key = record.store_key();

        let existing = match store.get(&key) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(store_key = %key, error = %e, "allocation read failed");
                summary.errors.push(UpsertError {
                    store_key: key,
                    message: format!("read failed: {e:#}"),
                });
                continue;
            }
        };

        let mut to_write = record.clone();
        if let Some(existing) = &existing {
            let unchanged = amounts_equal(existing.planned_amount, record.planned_amount)
                && amounts_equal(existing.forecast_amount, record.forecast_amount);
            let zero_rewrite = options.force_rewrite_zeros
                && amounts_equal(existing.planned_amount, 0.0)
                && amounts_equal(existing.forecast_amount, 0.0);

            if unchanged && !zero_rewrite {
                summary.skipped += 1;
                continue;
            }

            // Materialization must never erase reconciliation output
            if to_write.actual_amount.is_none() {
                to_write.actual_amount = existing.actual_amount;
            }
        }

        match store.put(&to_write) {
            Ok(()) => summary.written += 1,
            Err(e) => {
                warn!(store_key = %key, error = %e, "allocation write failed");
                summary.errors.push(UpsertError {
                    store_key: key,
                    message: format!("write failed: {e:#}"),
                });
            }
        }
    }

    summary
}

// ============================================================================
// TESTS
// ============================================================================

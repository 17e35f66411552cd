//! Durable cost ledger
//!
//! The metering core writes through the [`CostLedger`] trait only; the store
//! behind it is swappable.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;

use super::CostRecord;
use crate::db::{DbConn, DbPool};
use crate::{Error, Result};

/// Append-only sink for cost records
pub trait CostLedger: Send + Sync {
    /// Persist one record
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    fn append(&self, record: &CostRecord) -> Result<()>;
}

/// Ledger over the embedded `SQLite` database
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    /// Wrap a pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// All records for one device, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn list_for_device(&self, sn: &str) -> Result<Vec<CostRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sn, model_name, prompt_tokens, completion_tokens, total_tokens,
                    cost, currency, duration_ms, created_at
             FROM cost_records WHERE sn = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![sn], |row| {
            let cost_text: String = row.get(5)?;
            let created_text: String = row.get(8)?;
            Ok(CostRecord {
                sn: row.get(0)?,
                model_name: row.get(1)?,
                prompt_tokens: row.get(2)?,
                completion_tokens: row.get(3)?,
                total_tokens: row.get(4)?,
                cost: Decimal::from_str(&cost_text).unwrap_or_default(),
                currency: row.get(6)?,
                duration_ms: row.get(7)?,
                created_at: DateTime::parse_from_rfc3339(&created_text)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl CostLedger for SqliteLedger {
    fn append(&self, record: &CostRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cost_records
                (sn, model_name, prompt_tokens, completion_tokens, total_tokens,
                 cost, currency, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.sn,
                record.model_name,
                record.prompt_tokens,
                record.completion_tokens,
                record.total_tokens,
                record.cost.to_string(),
                record.currency,
                record.duration_ms,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

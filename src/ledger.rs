//! Payout ledger
//!
//! One entry per (job, pro, payout_type). Writes are upserts on that triple, so
//! retried or concurrent completions converge on a single row. The entry status
//! is written on insert only; approval workflows own it afterwards.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{DispatchError, Result};
use crate::store::{value_text, Row, RowStore};
use crate::types::{parse_timestamp, PayoutStatus, PayoutType};

/// Idempotency key of the ledger.
pub const LEDGER_CONFLICT_KEY: [&str; 3] = ["job_id", "pro_id", "payout_type"];

/// Monday on or before `ts`, in UTC.
pub fn week_start(ts: DateTime<Utc>) -> NaiveDate {
    let day = ts.date_naive();
    let back = u64::from(day.weekday().num_days_from_monday());
    day.checked_sub_days(Days::new(back)).unwrap_or(day)
}

/// `YYYY-MM-DD` week start of a timestamp string.
pub fn get_week_start(raw: &str) -> Option<String> {
    parse_timestamp(raw).map(|ts| week_start(ts).format("%Y-%m-%d").to_string())
}

/// A row of the payout ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutLedgerEntry {
    pub job_id: String,
    pub pro_id: String,
    pub payout_type: PayoutType,
    pub amount: f64,
    pub status: PayoutStatus,
    pub week_start: NaiveDate,
    pub metadata: Value,
}

impl PayoutLedgerEntry {
    /// A fresh `pending` job payout.
    pub fn pending_job_payout(
        job_id: impl Into<String>,
        pro_id: impl Into<String>,
        amount: f64,
        week_start: NaiveDate,
        metadata: Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            pro_id: pro_id.into(),
            payout_type: PayoutType::Job,
            amount,
            status: PayoutStatus::Pending,
            week_start,
            metadata,
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("job_id".into(), json!(self.job_id));
        row.insert("pro_id".into(), json!(self.pro_id));
        row.insert("payout_type".into(), json!(self.payout_type.as_str()));
        row.insert("amount".into(), json!(self.amount));
        row.insert("status".into(), json!(self.status.as_str()));
        row.insert(
            "week_start".into(),
            json!(self.week_start.format("%Y-%m-%d").to_string()),
        );
        row.insert("metadata".into(), self.metadata.clone());
        row
    }

    fn fallback_id(&self) -> String {
        format!("{}:{}:{}", self.job_id, self.pro_id, self.payout_type.as_str())
    }
}

/// Ledger table access.
pub struct PayoutLedger {
    store: Arc<dyn RowStore>,
    table: String,
}

impl PayoutLedger {
    pub fn new(store: Arc<dyn RowStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    /// Idempotent write. Returns the entry id (the composite key when the table
    /// has no `id` column). Errors are returned verbatim as `LedgerWrite`.
    pub async fn upsert(&self, entry: &PayoutLedgerEntry) -> Result<String> {
        let stored = self
            .store
            .upsert(&self.table, &entry.to_row(), &LEDGER_CONFLICT_KEY, &["status"])
            .await
            .map_err(DispatchError::LedgerWrite)?;

        let id = stored
            .get("id")
            .and_then(value_text)
            .unwrap_or_else(|| entry.fallback_id());
        info!(
            ledger_id = %id,
            job_id = %entry.job_id,
            pro_id = %entry.pro_id,
            amount = entry.amount,
            week_start = %entry.week_start,
            "payout ledger entry upserted"
        );
        Ok(id)
    }
}

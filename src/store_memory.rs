//! In-memory [`RowStore`] adapter.
//!
//! Tables carry an explicit column set so that writes naming unknown columns fail
//! the same way Postgres does, which lets tests exercise the schema fallbacks.
//! Unique constraints are declared per table and back `upsert` conflict targets.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{value_text, Filter, Query, Row, RowStore, StoreError};

#[derive(Debug, Default)]
struct MemTable {
    columns: BTreeSet<String>,
    unique: Vec<Vec<String>>,
    rows: Vec<Row>,
    write_failure: Option<StoreError>,
}

impl MemTable {
    fn check_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
        if self.columns.contains(column) {
            Ok(())
        } else {
            Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    fn matches(row: &Row, filters: &[Filter]) -> bool {
        filters.iter().all(|f| match f {
            Filter::Eq { column, value } => {
                let left = row.get(column).and_then(value_text);
                left.is_some() && left == value_text(value)
            }
            Filter::NotNull { column } => row.get(column).is_some_and(|v| !v.is_null()),
        })
    }

    fn same_key(a: &Row, b: &Row, columns: &[String]) -> bool {
        columns.iter().all(|c| {
            let left = a.get(c).and_then(value_text);
            left.is_some() && left == b.get(c).and_then(value_text)
        })
    }

    /// Fill unset columns with null and assign an `id` when the table has one.
    fn normalize(&self, table: &str, row: &Row) -> Result<Row, StoreError> {
        for column in row.keys() {
            self.check_column(table, column)?;
        }
        let mut stored = Row::new();
        for column in &self.columns {
            stored.insert(
                column.clone(),
                row.get(column).cloned().unwrap_or(Value::Null),
            );
        }
        if self.columns.contains("id") && stored.get("id").is_none_or(Value::is_null) {
            stored.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        Ok(stored)
    }
}

/// In-memory table store with Postgres-like failure modes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, MemTable>>,
    selects: AtomicUsize,
    selects_by_table: Mutex<HashMap<String, usize>>,
    read_failures: Mutex<HashMap<String, StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table with the given column set.
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        let table = MemTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        };
        self.lock().insert(name.to_string(), table);
    }

    /// Declare a unique constraint usable as an upsert conflict target.
    pub fn add_unique(&self, name: &str, columns: &[&str]) {
        if let Some(table) = self.lock().get_mut(name) {
            table
                .unique
                .push(columns.iter().map(|c| c.to_string()).collect());
        }
    }

    /// Append rows verbatim, bypassing column validation.
    pub fn seed(&self, name: &str, rows: Vec<Row>) {
        if let Some(table) = self.lock().get_mut(name) {
            table.rows.extend(rows);
        }
    }

    /// Make every subsequent write on `name` fail with `error`.
    pub fn fail_writes(&self, name: &str, error: StoreError) {
        if let Some(table) = self.lock().get_mut(name) {
            table.write_failure = Some(error);
        }
    }

    /// Make every subsequent `select` on `name` fail with `error`, whether or
    /// not the table exists.
    pub fn fail_reads(&self, name: &str, error: StoreError) {
        if let Ok(mut failures) = self.read_failures.lock() {
            failures.insert(name.to_string(), error);
        }
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.lock()
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Total number of `select` calls served, including failed ones.
    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    /// Number of `select` calls issued against one table name.
    pub fn select_count_for(&self, name: &str) -> usize {
        self.selects_by_table
            .lock()
            .map(|m| m.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemTable>> {
        // A poisoned lock only means a test panicked mid-write; keep serving.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn missing_table(name: &str) -> StoreError {
        StoreError::MissingTable {
            table: name.to_string(),
        }
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.selects_by_table.lock() {
            *counts.entry(table.to_string()).or_default() += 1;
        }
        if let Some(err) = self
            .read_failures
            .lock()
            .ok()
            .and_then(|f| f.get(table).cloned())
        {
            return Err(err);
        }

        let tables = self.lock();
        let t = tables.get(table).ok_or_else(|| Self::missing_table(table))?;
        for filter in &query.filters {
            t.check_column(table, filter.column())?;
        }
        if let Some(order) = &query.order_by {
            t.check_column(table, order)?;
        }

        let mut rows: Vec<Row> = t
            .rows
            .iter()
            .filter(|r| MemTable::matches(r, &query.filters))
            .cloned()
            .collect();
        if let Some(order) = &query.order_by {
            rows.sort_by_key(|r| r.get(order).and_then(value_text));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<Row, StoreError> {
        let mut tables = self.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        if let Some(err) = &t.write_failure {
            return Err(err.clone());
        }
        let stored = t.normalize(table, row)?;
        for key in &t.unique {
            if t.rows.iter().any(|r| MemTable::same_key(r, &stored, key)) {
                return Err(StoreError::Conflict {
                    table: table.to_string(),
                    detail: format!("duplicate key on ({})", key.join(", ")),
                });
            }
        }
        t.rows.push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Row,
    ) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        if let Some(err) = &t.write_failure {
            return Err(err.clone());
        }
        for filter in filters {
            t.check_column(table, filter.column())?;
        }
        for column in patch.keys() {
            t.check_column(table, column)?;
        }

        let mut touched = 0;
        for row in t.rows.iter_mut().filter(|r| MemTable::matches(r, filters)) {
            for (k, v) in patch {
                row.insert(k.clone(), v.clone());
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict: &[&str],
        insert_only: &[&str],
    ) -> Result<Row, StoreError> {
        let mut tables = self.lock();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| Self::missing_table(table))?;
        if let Some(err) = &t.write_failure {
            return Err(err.clone());
        }
        let target: BTreeSet<&str> = conflict.iter().copied().collect();
        let key = t
            .unique
            .iter()
            .find(|u| u.iter().map(String::as_str).collect::<BTreeSet<_>>() == target)
            .cloned()
            .ok_or_else(|| {
                StoreError::Backend(
                    "there is no unique or exclusion constraint matching the ON CONFLICT specification"
                        .to_string(),
                )
            })?;

        let stored = t.normalize(table, row)?;
        if let Some(existing) = t
            .rows
            .iter_mut()
            .find(|r| MemTable::same_key(r, &stored, &key))
        {
            for (k, v) in row.iter().filter(|(k, _)| !insert_only.contains(&k.as_str())) {
                existing.insert(k.clone(), v.clone());
            }
            return Ok(existing.clone());
        }
        t.rows.push(stored.clone());
        Ok(stored)
    }
}

//! Required-Reference Resolver
//!
//! New dispatch jobs carry foreign keys to a sequence, a recipient and a step.
//! Each value comes from, in order: an environment override, the canonical
//! table, the legacy tables, and finally existing job rows that already used
//! one. Only well-formed identifiers (UUIDs or positive integers) are accepted.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReferenceOverrides;
use crate::schema::SchemaResolver;
use crate::store::{value_text, Query, RowStore, StoreError};

const PROBE_LIMIT: usize = 5;

/// Lookup plan for one reference.
struct ReferenceSource {
    name: &'static str,
    /// Canonical table first, then legacy names.
    tables: &'static [&'static str],
    columns: &'static [&'static str],
}

const SEQUENCE: ReferenceSource = ReferenceSource {
    name: "sequence_id",
    tables: &["h2s_dispatch_sequences", "dispatch_sequences", "sequences"],
    columns: &["id", "sequence_id"],
};

const RECIPIENT: ReferenceSource = ReferenceSource {
    name: "recipient_id",
    tables: &["h2s_dispatch_recipients", "dispatch_recipients", "recipients"],
    columns: &["id", "recipient_id"],
};

const STEP: ReferenceSource = ReferenceSource {
    name: "step_id",
    tables: &[
        "h2s_dispatch_steps",
        "dispatch_steps",
        "dispatch_sequence_steps",
        "steps",
    ],
    columns: &["id", "step_id"],
};

/// Column on step rows pointing at their sequence.
const STEP_SEQUENCE_COLUMN: &str = "sequence_id";

/// A UUID or a positive integer.
pub fn is_well_formed_id(value: &str) -> bool {
    let value = value.trim();
    Uuid::parse_str(value).is_ok() || value.parse::<u64>().is_ok_and(|n| n > 0)
}

/// Resolved foreign keys; `None` where nothing usable was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequiredReferences {
    pub sequence_id: Option<String>,
    pub recipient_id: Option<String>,
    pub step_id: Option<String>,
}

impl RequiredReferences {
    /// Name of the first unresolved reference.
    pub fn first_missing(&self) -> Option<&'static str> {
        self.pairs_with_gaps()
            .into_iter()
            .find(|(_, v)| v.is_none())
            .map(|(name, _)| name)
    }

    /// `(column, value)` for every resolved reference.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        self.pairs_with_gaps()
            .into_iter()
            .filter_map(|(name, v)| v.map(|v| (name, v)))
            .collect()
    }

    fn pairs_with_gaps(&self) -> [(&'static str, Option<&str>); 3] {
        [
            (SEQUENCE.name, self.sequence_id.as_deref()),
            (RECIPIENT.name, self.recipient_id.as_deref()),
            (STEP.name, self.step_id.as_deref()),
        ]
    }
}

pub struct ReferenceResolver {
    store: Arc<dyn RowStore>,
    schema: Arc<SchemaResolver>,
    overrides: ReferenceOverrides,
}

impl ReferenceResolver {
    pub fn new(
        store: Arc<dyn RowStore>,
        schema: Arc<SchemaResolver>,
        overrides: ReferenceOverrides,
    ) -> Self {
        Self {
            store,
            schema,
            overrides,
        }
    }

    /// Resolve all three references. Lookup errors are logged, never raised.
    pub async fn resolve(&self) -> RequiredReferences {
        let sequence_id = self
            .resolve_one(&SEQUENCE, self.overrides.sequence_id.as_deref(), None)
            .await;
        let recipient_id = self
            .resolve_one(&RECIPIENT, self.overrides.recipient_id.as_deref(), None)
            .await;
        let step_id = self
            .resolve_one(
                &STEP,
                self.overrides.step_id.as_deref(),
                sequence_id.as_deref(),
            )
            .await;

        let refs = RequiredReferences {
            sequence_id,
            recipient_id,
            step_id,
        };
        info!(
            sequence_id = ?refs.sequence_id,
            recipient_id = ?refs.recipient_id,
            step_id = ?refs.step_id,
            "resolved dispatch references"
        );
        refs
    }

    async fn resolve_one(
        &self,
        source: &ReferenceSource,
        override_value: Option<&str>,
        sequence_id: Option<&str>,
    ) -> Option<String> {
        if let Some(value) = override_value {
            if is_well_formed_id(value) {
                return Some(value.trim().to_string());
            }
            warn!(reference = source.name, value, "ignoring malformed override");
        }

        if let Some(sequence_id) = sequence_id {
            for table in source.tables {
                let query = Query::new().eq(STEP_SEQUENCE_COLUMN, sequence_id);
                if let Some(found) = self.first_id(table, source.columns, query).await {
                    debug!(reference = source.name, table, "matched step of sequence");
                    return Some(found);
                }
            }
        }

        for table in source.tables {
            if let Some(found) = self.first_id(table, source.columns, Query::new()).await {
                return Some(found);
            }
        }

        self.mine_jobs(source.name).await
    }

    /// First well-formed id from `table`, trying each id column in turn.
    async fn first_id(&self, table: &str, columns: &[&str], base: Query) -> Option<String> {
        for column in columns {
            let query = base.clone().not_null(*column).limit(PROBE_LIMIT);
            match self.store.select(table, &query).await {
                Ok(rows) => {
                    let found = rows
                        .iter()
                        .filter_map(|r| r.get(*column).and_then(value_text))
                        .find(|v| is_well_formed_id(v));
                    if found.is_some() {
                        return found;
                    }
                }
                Err(StoreError::MissingTable { .. }) => return None,
                Err(StoreError::MissingColumn { .. }) => continue,
                Err(err) => {
                    warn!(table, column, error = %err, "reference lookup failed");
                    return None;
                }
            }
        }
        None
    }

    /// Reuse a value an existing job row already carries.
    async fn mine_jobs(&self, column: &str) -> Option<String> {
        let schema = match self.schema.resolve().await {
            Ok(schema) => schema,
            Err(err) => {
                warn!(reference = column, error = %err, "cannot mine job rows");
                return None;
            }
        };
        let found = self
            .first_id(&schema.jobs.table, &[column], Query::new())
            .await;
        if found.is_some() {
            debug!(reference = column, table = %schema.jobs.table, "reference mined from jobs");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssignmentsTable, JobsTable, SchemaDescriptor};
    use crate::store::row_of;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn schema() -> Arc<SchemaResolver> {
        Arc::new(SchemaResolver::fixed(SchemaDescriptor {
            jobs: JobsTable {
                table: "jobs".into(),
                id_column: "id".into(),
                status_column: Some("status".into()),
                columns: None,
            },
            assignments: AssignmentsTable {
                table: "job_assignments".into(),
                job_column: "job_id".into(),
                pro_id_column: Some("pro_id".into()),
                pro_email_column: None,
                state_column: None,
                columns: None,
            },
        }))
    }

    #[test]
    fn test_well_formed_ids() {
        assert!(is_well_formed_id("42"));
        assert!(is_well_formed_id("6f1c1f7e-3f55-4b0e-9b1a-0c6a7c6d2f10"));
        assert!(!is_well_formed_id("0"));
        assert!(!is_well_formed_id("-3"));
        assert!(!is_well_formed_id("seq-default"));
    }

    #[tokio::test]
    async fn test_override_wins_without_queries() {
        let store = Arc::new(MemoryStore::new());
        let resolver = ReferenceResolver::new(
            store.clone(),
            schema(),
            ReferenceOverrides {
                sequence_id: Some("7".into()),
                recipient_id: Some("8".into()),
                step_id: Some("9".into()),
            },
        );
        let refs = resolver.resolve().await;
        assert_eq!(refs.first_missing(), None);
        assert_eq!(
            refs.pairs(),
            vec![("sequence_id", "7"), ("recipient_id", "8"), ("step_id", "9")]
        );
        assert_eq!(store.select_count(), 0);
    }

    #[tokio::test]
    async fn test_falls_through_tables_and_prefers_step_of_sequence() {
        let store = Arc::new(MemoryStore::new());
        // Canonical sequence table holds only a malformed id; the legacy one is usable.
        store.create_table("h2s_dispatch_sequences", &["id"]);
        store.seed("h2s_dispatch_sequences", vec![row_of([("id", json!("draft"))])]);
        store.create_table("dispatch_sequences", &["id"]);
        store.seed("dispatch_sequences", vec![row_of([("id", json!(5))])]);

        store.create_table("dispatch_steps", &["id", "sequence_id"]);
        store.seed(
            "dispatch_steps",
            vec![
                row_of([("id", json!(100)), ("sequence_id", json!(4))]),
                row_of([("id", json!(101)), ("sequence_id", json!(5))]),
            ],
        );

        let refs = ReferenceResolver::new(store, schema(), ReferenceOverrides::default())
            .resolve()
            .await;
        assert_eq!(refs.sequence_id.as_deref(), Some("5"));
        assert_eq!(refs.step_id.as_deref(), Some("101"));
        assert_eq!(refs.recipient_id, None);
        assert_eq!(refs.first_missing(), Some("recipient_id"));
    }

    #[tokio::test]
    async fn test_mines_existing_jobs() {
        let store = Arc::new(MemoryStore::new());
        store.create_table("jobs", &["id", "recipient_id"]);
        store.seed(
            "jobs",
            vec![
                row_of([("id", json!("j1")), ("recipient_id", json!(null))]),
                row_of([("id", json!("j2")), ("recipient_id", json!(77))]),
            ],
        );
        let refs = ReferenceResolver::new(store, schema(), ReferenceOverrides::default())
            .resolve()
            .await;
        assert_eq!(refs.recipient_id.as_deref(), Some("77"));
        assert_eq!(refs.sequence_id, None);
    }
}

//! Job rows: lookup and creation of dispatch jobs.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::refs::ReferenceResolver;
use crate::schema::{SchemaDescriptor, SchemaResolver};
use crate::store::{Query, Row, RowStore, StoreError};
use crate::types::{JobRecord, JobStatus};

/// Load one job by its resolved id column.
pub async fn load_job(
    store: &dyn RowStore,
    schema: &SchemaDescriptor,
    job_id: &str,
) -> Result<JobRecord> {
    let rows = store
        .select(
            &schema.jobs.table,
            &Query::new().eq(schema.jobs.id_column.as_str(), job_id).limit(1),
        )
        .await?;
    rows.into_iter()
        .next()
        .and_then(|row| JobRecord::from_row(schema, row))
        .ok_or_else(|| DispatchError::JobNotFound {
            job_id: job_id.to_string(),
        })
}

/// Input for a new dispatch job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// First-class column values (service type, subtotal, schedule, ...).
    pub fields: Row,
    /// Stored in the `metadata` column when the table has one.
    pub metadata: Map<String, Value>,
}

/// Job lookup and creation against the resolved jobs table.
pub struct DispatchJobs {
    store: Arc<dyn RowStore>,
    schema: Arc<SchemaResolver>,
    references: ReferenceResolver,
}

impl DispatchJobs {
    pub fn new(
        store: Arc<dyn RowStore>,
        schema: Arc<SchemaResolver>,
        references: ReferenceResolver,
    ) -> Self {
        Self {
            store,
            schema,
            references,
        }
    }

    pub async fn load(&self, job_id: &str) -> Result<JobRecord> {
        let schema = self.schema.resolve().await?;
        load_job(self.store.as_ref(), &schema, job_id).await
    }

    /// Insert a job in status `open`. Every required reference must resolve
    /// first; nothing is written otherwise.
    pub async fn create_dispatch_job(&self, job: NewJob) -> Result<JobRecord> {
        let schema = self.schema.resolve().await?;
        let refs = self.references.resolve().await;
        if let Some(name) = refs.first_missing() {
            warn!(reference = name, "refusing to create dispatch job");
            return Err(DispatchError::MissingReference { name });
        }

        let mut row = job.fields;
        for (column, value) in refs.pairs() {
            row.insert(column.to_string(), Value::String(value.to_string()));
        }
        if let Some(status_column) = &schema.jobs.status_column {
            row.insert(
                status_column.clone(),
                Value::String(JobStatus::Open.as_str().to_string()),
            );
        }
        let with_metadata = !job.metadata.is_empty();
        if with_metadata {
            row.insert("metadata".into(), Value::Object(job.metadata));
        }

        let stored = match self.store.insert(&schema.jobs.table, &row).await {
            Err(err) if with_metadata && err.is_missing_column("metadata") => {
                warn!(table = %schema.jobs.table, "jobs table has no metadata column; dropping it");
                row.remove("metadata");
                self.store.insert(&schema.jobs.table, &row).await?
            }
            other => other?,
        };

        let record = JobRecord::from_row(&schema, stored).ok_or_else(|| {
            StoreError::Backend(format!(
                "inserted job row has no '{}' value",
                schema.jobs.id_column
            ))
        })?;
        info!(job_id = %record.id, table = %schema.jobs.table, "dispatch job created");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferenceOverrides;
    use crate::schema::{AssignmentsTable, JobsTable};
    use crate::store::row_of;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn descriptor() -> SchemaDescriptor {
        SchemaDescriptor {
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
                state_column: Some("state".into()),
                columns: None,
            },
        }
    }

    fn jobs(store: Arc<MemoryStore>, overrides: ReferenceOverrides) -> DispatchJobs {
        let schema = Arc::new(SchemaResolver::fixed(descriptor()));
        let references = ReferenceResolver::new(store.clone(), schema.clone(), overrides);
        DispatchJobs::new(store, schema, references)
    }

    fn full_overrides() -> ReferenceOverrides {
        ReferenceOverrides {
            sequence_id: Some("11".into()),
            recipient_id: Some("22".into()),
            step_id: Some("33".into()),
        }
    }

    #[tokio::test]
    async fn test_load_missing_job() {
        let store = Arc::new(MemoryStore::new());
        store.create_table("jobs", &["id", "status"]);
        let err = jobs(store, ReferenceOverrides::default())
            .load("nope")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_refuses_without_references() {
        let store = Arc::new(MemoryStore::new());
        store.create_table(
            "jobs",
            &["id", "status", "sequence_id", "recipient_id", "step_id"],
        );
        let err = jobs(store.clone(), ReferenceOverrides::default())
            .create_dispatch_job(NewJob::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::MissingReference { name: "sequence_id" }
        ));
        assert!(store.rows("jobs").is_empty());
    }

    #[tokio::test]
    async fn test_create_inserts_open_job() {
        let store = Arc::new(MemoryStore::new());
        store.create_table(
            "jobs",
            &[
                "id",
                "status",
                "service_type",
                "sequence_id",
                "recipient_id",
                "step_id",
                "metadata",
            ],
        );
        let mut metadata = Map::new();
        metadata.insert("source".into(), json!("portal"));
        let job = jobs(store.clone(), full_overrides())
            .create_dispatch_job(NewJob {
                fields: row_of([("service_type", json!("TV Mounting"))]),
                metadata,
            })
            .await
            .unwrap();

        assert_eq!(job.row()["status"], json!("open"));
        assert_eq!(job.row()["step_id"], json!("33"));
        assert_eq!(job.metadata()["source"], json!("portal"));
        assert_eq!(store.rows("jobs").len(), 1);
    }

    #[tokio::test]
    async fn test_create_drops_metadata_when_column_missing() {
        let store = Arc::new(MemoryStore::new());
        store.create_table(
            "jobs",
            &["id", "status", "sequence_id", "recipient_id", "step_id"],
        );
        let mut metadata = Map::new();
        metadata.insert("note".into(), json!("gate code 1234"));
        let job = jobs(store.clone(), full_overrides())
            .create_dispatch_job(NewJob {
                fields: Row::new(),
                metadata,
            })
            .await
            .unwrap();
        assert!(job.metadata().is_empty());
        assert_eq!(store.rows("jobs").len(), 1);
    }
}

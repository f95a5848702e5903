//! Offer Assignment Engine
//!
//! Picks the pro for a job and records the offer exactly once. The assignments
//! table may be any of several historical shapes, so the write walks an ordered
//! list of column combinations and keeps the first that the table accepts.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PortalConfig;
use crate::error::{DispatchError, Result};
use crate::jobs::load_job;
use crate::pros::{nearest, ProDirectory};
use crate::schema::{
    AssignmentsTable, ProMatch, SchemaDescriptor, SchemaResolver, ASSIGNMENT_JOB_COLUMNS,
    PRO_EMAIL_COLUMNS, PRO_ID_COLUMNS,
};
use crate::store::{Filter, Query, Row, RowStore, StoreError};
use crate::types::{AssignmentState, JobRecord, JobStatus, ProRef};

/// Job column holding the assigned pro.
const ASSIGNED_TO_COLUMN: &str = "assigned_to";

/// How the pro was chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProSelection {
    Explicit,
    /// Taken from assignment fields already on the job row.
    JobAssignment,
    Nearest { distance_km: f64 },
    FirstActive,
}

/// The assignment row backing the offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentRecord {
    /// Found by lookup; `restated` when its state was moved to the desired one.
    Existing { row: Row, restated: bool },
    Created { strategy: String, row: Row },
}

/// Result of the best-effort job row patch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPatch {
    Updated {
        status: Option<JobStatus>,
        assigned_to: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferOutcome {
    pub job_id: String,
    pub pro: ProRef,
    pub selection: ProSelection,
    pub state: AssignmentState,
    pub assignment: AssignmentRecord,
    pub job_status: JobPatch,
}

/// One column combination tried when inserting an assignment.
#[derive(Debug, Clone, PartialEq)]
struct WriteStrategy {
    name: String,
    row: Row,
}

/// `(column, value)` pairs identifying the pro on an assignment row, the
/// column asked for by `by` first.
fn pro_pairs(table: &AssignmentsTable, pro: &ProRef, by: ProMatch) -> Vec<(String, String)> {
    let other = match by {
        ProMatch::Id => ProMatch::Email,
        ProMatch::Email => ProMatch::Id,
    };
    let mut pairs: Vec<(String, String)> = Vec::new();
    for kind in [by, other] {
        let Some(column) = table.pro_column(kind) else {
            continue;
        };
        let value = if table.pro_email_column.as_deref() == Some(column) {
            &pro.email
        } else {
            &pro.id
        };
        if let Some(value) = value {
            let pair = (column.to_string(), value.clone());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
    }
    pairs
}

/// Every known `(job column, pro column, pro value)` worth searching.
fn lookup_pairs(
    table: &AssignmentsTable,
    pro: &ProRef,
    by: ProMatch,
) -> Vec<(String, String, String)> {
    let mut job_columns = vec![table.job_column.clone()];
    if let Some(known) = &table.columns {
        job_columns.extend(
            ASSIGNMENT_JOB_COLUMNS
                .iter()
                .filter(|c| known.contains(**c) && **c != table.job_column)
                .map(|c| c.to_string()),
        );
    }

    let mut pro_columns = pro_pairs(table, pro, by);
    if let Some(known) = &table.columns {
        let extra = |names: &[&str], value: &Option<String>| -> Vec<(String, String)> {
            match value {
                Some(v) => names
                    .iter()
                    .filter(|c| known.contains(**c))
                    .map(|c| (c.to_string(), v.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        for pair in extra(PRO_ID_COLUMNS, &pro.id)
            .into_iter()
            .chain(extra(PRO_EMAIL_COLUMNS, &pro.email))
        {
            if !pro_columns.contains(&pair) {
                pro_columns.push(pair);
            }
        }
    }

    job_columns
        .iter()
        .flat_map(|j| {
            pro_columns
                .iter()
                .map(move |(c, v)| (j.clone(), c.clone(), v.clone()))
        })
        .collect()
}

/// Insert attempts, richest first.
fn write_strategies(
    table: &AssignmentsTable,
    job_id: &str,
    pro: &ProRef,
    by: ProMatch,
    state: AssignmentState,
) -> Vec<WriteStrategy> {
    let pros = pro_pairs(table, pro, by);
    let mut pro_sets: Vec<Vec<(String, String)>> = Vec::new();
    if pros.len() > 1 {
        pro_sets.push(pros.clone());
    }
    pro_sets.extend(pros.into_iter().map(|p| vec![p]));

    let state_options: Vec<Option<&String>> = match &table.state_column {
        Some(c) => vec![Some(c), None],
        None => vec![None],
    };

    let mut strategies: Vec<WriteStrategy> = Vec::new();
    for set in &pro_sets {
        for state_column in &state_options {
            let mut row = Row::new();
            let mut name = vec![table.job_column.clone()];
            row.insert(table.job_column.clone(), Value::String(job_id.to_string()));
            for (column, value) in set {
                row.insert(column.clone(), Value::String(value.clone()));
                name.push(column.clone());
            }
            if let Some(column) = state_column {
                row.insert(
                    column.to_string(),
                    Value::String(state.as_str().to_string()),
                );
                name.push(column.to_string());
            }
            let strategy = WriteStrategy {
                name: name.join("+"),
                row,
            };
            if !strategies.iter().any(|s| s.row == strategy.row) {
                strategies.push(strategy);
            }
        }
    }
    strategies
}

/// Selects pros for jobs and records offers.
pub struct OfferEngine {
    store: Arc<dyn RowStore>,
    schema: Arc<SchemaResolver>,
    pros: ProDirectory,
}

impl OfferEngine {
    pub fn new(
        store: Arc<dyn RowStore>,
        schema: Arc<SchemaResolver>,
        config: &PortalConfig,
    ) -> Self {
        let pros = ProDirectory::new(store.clone(), config.pros_table.clone());
        Self { store, schema, pros }
    }

    /// Make sure `job_id` has an assignment in `desired` state for the chosen
    /// pro, creating it when no matching row exists.
    pub async fn ensure_offer(
        &self,
        job_id: &str,
        pro_value: Option<&str>,
        desired: AssignmentState,
    ) -> Result<OfferOutcome> {
        let schema = self.schema.resolve().await?;
        let job = load_job(self.store.as_ref(), &schema, job_id).await?;

        let (pro, selection) = self.select_pro(&job, pro_value).await?;
        info!(job_id, pro = ?pro.display_value(), ?selection, "pro selected for offer");
        let by = pro_value.map(ProMatch::for_value).unwrap_or_default();

        // The table may only key pros one way; fill in the other half if needed.
        let pro = if pro_pairs(&schema.assignments, &pro, by).is_empty() {
            self.pros.complete(pro).await
        } else {
            pro
        };

        let assignment = match self.find_existing(&schema, &job.id, &pro, by).await? {
            Some(row) => {
                let restated = self.restate(&schema, &row, desired).await;
                AssignmentRecord::Existing { row, restated }
            }
            None => {
                self.insert_assignment(&schema, &job.id, &pro, by, desired)
                    .await?
            }
        };

        let job_status = self.patch_job(&schema, &job, &pro, desired).await;

        Ok(OfferOutcome {
            job_id: job.id.clone(),
            pro,
            selection,
            state: desired,
            assignment,
            job_status,
        })
    }

    async fn select_pro(
        &self,
        job: &JobRecord,
        explicit: Option<&str>,
    ) -> Result<(ProRef, ProSelection)> {
        if let Some(pro) = explicit.and_then(ProRef::from_value) {
            return Ok((pro, ProSelection::Explicit));
        }
        if let Some(pro) = job.assigned_pro() {
            return Ok((pro, ProSelection::JobAssignment));
        }

        let active = self.pros.list_active().await?;
        if let Some(origin) = job.location() {
            if let Some((pro, distance_km)) = nearest(&active, origin) {
                return Ok((pro.pro_ref(), ProSelection::Nearest { distance_km }));
            }
            debug!(job_id = %job.id, "no located pros; falling back to listing order");
        }
        active
            .first()
            .map(|p| (p.pro_ref(), ProSelection::FirstActive))
            .ok_or_else(|| DispatchError::NoProAvailable {
                job_id: job.id.clone(),
            })
    }

    async fn find_existing(
        &self,
        schema: &SchemaDescriptor,
        job_id: &str,
        pro: &ProRef,
        by: ProMatch,
    ) -> Result<Option<Row>> {
        let table = &schema.assignments.table;
        for (job_column, pro_column, value) in lookup_pairs(&schema.assignments, pro, by) {
            let query = Query::new()
                .eq(job_column.as_str(), job_id)
                .eq(pro_column.as_str(), value)
                .limit(1);
            match self.store.select(table, &query).await {
                Ok(rows) => {
                    if let Some(row) = rows.into_iter().next() {
                        debug!(%table, %job_column, %pro_column, "existing assignment found");
                        return Ok(Some(row));
                    }
                }
                Err(err) if err.is_schema_mismatch() => {
                    debug!(%table, %job_column, %pro_column, error = %err,
                        "lookup pair not usable");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Move an existing assignment to `desired`; best effort.
    async fn restate(
        &self,
        schema: &SchemaDescriptor,
        row: &Row,
        desired: AssignmentState,
    ) -> bool {
        let Some(state_column) = &schema.assignments.state_column else {
            return false;
        };
        let current = schema.assignment_state_of(row);
        if current.as_deref().and_then(|s| s.parse::<AssignmentState>().ok()) == Some(desired) {
            return false;
        }

        let filters: Vec<Filter> = row
            .iter()
            .filter(|(k, v)| *k != state_column && !v.is_null() && !v.is_object() && !v.is_array())
            .filter(|(k, _)| {
                k.as_str() == "id"
                    || *k == &schema.assignments.job_column
                    || PRO_ID_COLUMNS.contains(&k.as_str())
                    || PRO_EMAIL_COLUMNS.contains(&k.as_str())
            })
            .map(|(k, v)| Filter::eq(k.clone(), v.clone()))
            .collect();

        let mut patch = Row::new();
        patch.insert(
            state_column.clone(),
            Value::String(desired.as_str().to_string()),
        );
        match self
            .store
            .update(&schema.assignments.table, &filters, &patch)
            .await
        {
            Ok(n) => {
                info!(from = ?current, to = %desired, rows = n, "assignment state updated");
                n > 0
            }
            Err(err) => {
                warn!(error = %err, "could not update assignment state");
                false
            }
        }
    }

    async fn insert_assignment(
        &self,
        schema: &SchemaDescriptor,
        job_id: &str,
        pro: &ProRef,
        by: ProMatch,
        state: AssignmentState,
    ) -> Result<AssignmentRecord> {
        let table = &schema.assignments.table;
        let strategies = write_strategies(&schema.assignments, job_id, pro, by, state);
        if strategies.is_empty() {
            return Err(DispatchError::AssignmentInsertFailed {
                attempts: 0,
                last_error: format!("no column on '{table}' can hold the pro reference"),
            });
        }

        let mut last_error = String::new();
        for (attempt, strategy) in strategies.iter().enumerate() {
            match self.store.insert(table, &strategy.row).await {
                Ok(row) => {
                    info!(%table, strategy = %strategy.name, attempt = attempt + 1,
                        "assignment inserted");
                    return Ok(AssignmentRecord::Created {
                        strategy: strategy.name.clone(),
                        row,
                    });
                }
                Err(StoreError::Conflict { .. }) => {
                    // Lost a race with a concurrent offer for the same pair.
                    if let Some(row) = self.find_existing(schema, job_id, pro, by).await? {
                        return Ok(AssignmentRecord::Existing {
                            row,
                            restated: false,
                        });
                    }
                    last_error = format!("conflict on {}", strategy.name);
                }
                Err(err) => {
                    debug!(%table, strategy = %strategy.name, error = %err,
                        "write strategy rejected");
                    last_error = err.to_string();
                }
            }
        }

        warn!(%table, attempts = strategies.len(), %last_error,
            "all assignment write strategies failed");
        Err(DispatchError::AssignmentInsertFailed {
            attempts: strategies.len(),
            last_error,
        })
    }

    /// Mirror the offer onto the job row; never fails the offer.
    async fn patch_job(
        &self,
        schema: &SchemaDescriptor,
        job: &JobRecord,
        pro: &ProRef,
        desired: AssignmentState,
    ) -> JobPatch {
        let target = desired.job_status();
        let mut patch = Row::new();

        if let Some(status_column) = &schema.jobs.status_column {
            match (job.status_text(schema), job.status(schema)) {
                (_, Some(current)) if !current.can_transition_to(target) => {
                    return JobPatch::Skipped {
                        reason: format!("job is {current}"),
                    };
                }
                (Some(raw), None) => {
                    return JobPatch::Skipped {
                        reason: format!("unrecognised job status '{raw}'"),
                    };
                }
                _ => {
                    patch.insert(
                        status_column.clone(),
                        Value::String(target.as_str().to_string()),
                    );
                }
            }
        }
        let with_assignee = desired.holds_job();
        if with_assignee {
            if let Some(value) = pro.display_value() {
                patch.insert(ASSIGNED_TO_COLUMN.into(), Value::String(value.to_string()));
            }
        }
        if patch.is_empty() {
            return JobPatch::Skipped {
                reason: "nothing to record on the job row".into(),
            };
        }

        let filters = [Filter::eq(schema.jobs.id_column.as_str(), job.id.as_str())];
        let status = patch
            .contains_key(schema.jobs.status_column.as_deref().unwrap_or_default())
            .then_some(target);
        let mut assigned_to = patch.contains_key(ASSIGNED_TO_COLUMN);

        let mut result = self.store.update(&schema.jobs.table, &filters, &patch).await;
        let retry = assigned_to
            && matches!(&result, Err(err) if err.is_missing_column(ASSIGNED_TO_COLUMN));
        if retry {
            debug!(table = %schema.jobs.table, "no assigned_to column; retrying with status only");
            patch.remove(ASSIGNED_TO_COLUMN);
            assigned_to = false;
            result = if patch.is_empty() {
                Ok(0)
            } else {
                self.store.update(&schema.jobs.table, &filters, &patch).await
            };
        }

        match result {
            Ok(_) => JobPatch::Updated {
                status,
                assigned_to,
            },
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "job status patch failed");
                JobPatch::Failed {
                    error: err.to_string(),
                }
            }
        }
    }
}

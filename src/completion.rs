//! Completion Orchestrator
//!
//! Turns a completed job into exactly one payout ledger entry. Steps up to and
//! including the ledger write are fail closed; stamping the job row and
//! notifying the pro happen afterwards and only log on failure.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{PayoutPolicy, PortalConfig};
use crate::error::DispatchError;
use crate::jobs::load_job;
use crate::ledger::{week_start, PayoutLedger, PayoutLedgerEntry};
use crate::notify::{Delivery, Notification, Notifier};
use crate::payout::{derive_payout, PayoutSource};
use crate::pros::ProDirectory;
use crate::schema::{SchemaDescriptor, SchemaResolver};
use crate::store::{Filter, Row, RowStore};
use crate::types::{
    JobRecord, JobStatus, ProRef, COMPLETED_FIELDS, CREATED_FIELDS, SCHEDULED_FIELDS,
    START_FIELDS,
};

/// Share of the order total above which a payout is flagged in the logs.
const PAYOUT_WARN_RATIO: f64 = 0.9;
const COMPLETED_AT_COLUMN: &str = "completed_at";

/// Fail-closed steps of a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStep {
    LoadJob,
    Beneficiary,
    Amount,
    Integrity,
    Ledger,
}

impl CompletionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadJob => "load_job",
            Self::Beneficiary => "beneficiary",
            Self::Amount => "amount",
            Self::Integrity => "integrity",
            Self::Ledger => "ledger",
        }
    }
}

impl fmt::Display for CompletionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A completion that stopped before the ledger entry was written.
#[derive(Debug, Error)]
#[error("completion failed at {step}: {source}")]
pub struct CompletionFailure {
    pub step: CompletionStep,
    #[source]
    pub source: DispatchError,
}

impl CompletionFailure {
    fn at(step: CompletionStep) -> impl FnOnce(DispatchError) -> Self {
        move |source| Self { step, source }
    }

    pub fn to_response(&self) -> Value {
        json!({
            "ok": false,
            "step": self.step,
            "code": self.source.code(),
            "error": self.source.to_string(),
        })
    }
}

/// Who is marking the job complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// The pro who did the work; they are the beneficiary.
    Pro(ProRef),
    Admin { id: Option<String> },
    System,
}

impl Actor {
    fn kind(&self) -> &'static str {
        match self {
            Self::Pro(_) => "pro",
            Self::Admin { .. } => "admin",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub job_id: String,
    pub actor: Actor,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompletionRequest {
    pub fn new(job_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            job_id: job_id.into(),
            actor,
            completed_at: None,
        }
    }
}

/// What happened to the completion notice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent,
    Duplicate,
    /// No e-mail known for the pro.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReceipt {
    pub job_id: String,
    pub ledger_id: String,
    pub pro_id: String,
    pub amount: f64,
    pub source: PayoutSource,
    pub week_start: NaiveDate,
    pub job_stamped: bool,
    pub notification: NotificationOutcome,
}

impl CompletionReceipt {
    pub fn to_response(&self) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(map) = body.as_object_mut() {
            map.insert("ok".into(), Value::Bool(true));
        }
        body
    }
}

/// JSON body for either outcome.
pub fn completion_response(result: &Result<CompletionReceipt, CompletionFailure>) -> Value {
    match result {
        Ok(receipt) => receipt.to_response(),
        Err(failure) => failure.to_response(),
    }
}

pub struct CompletionOrchestrator {
    store: Arc<dyn RowStore>,
    schema: Arc<SchemaResolver>,
    ledger: PayoutLedger,
    pros: ProDirectory,
    notifier: Arc<dyn Notifier>,
    policy: PayoutPolicy,
}

impl CompletionOrchestrator {
    pub fn new(
        store: Arc<dyn RowStore>,
        schema: Arc<SchemaResolver>,
        notifier: Arc<dyn Notifier>,
        config: &PortalConfig,
    ) -> Self {
        Self {
            ledger: PayoutLedger::new(store.clone(), config.payouts_table.clone()),
            pros: ProDirectory::new(store.clone(), config.pros_table.clone()),
            store,
            schema,
            notifier,
            policy: config.payout,
        }
    }

    /// Record the payout for a completed job. Safe to retry: repeated calls
    /// converge on the same ledger entry.
    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionReceipt, CompletionFailure> {
        let job_id = request.job_id.as_str();

        // 1. Job
        let schema = self
            .schema
            .resolve()
            .await
            .map_err(CompletionFailure::at(CompletionStep::LoadJob))?;
        let job = load_job(self.store.as_ref(), &schema, job_id)
            .await
            .map_err(CompletionFailure::at(CompletionStep::LoadJob))?;
        if let Some(status) = job.status(&schema) {
            if !status.allows_completion() {
                return Err(CompletionFailure::at(CompletionStep::LoadJob)(
                    DispatchError::InvalidTransition {
                        job_id: job.id.clone(),
                        from: status.to_string(),
                        to: JobStatus::Completed.to_string(),
                    },
                ));
            }
        }

        // 2. Beneficiary
        let pro = self
            .beneficiary(&job, &request.actor)
            .await
            .map_err(CompletionFailure::at(CompletionStep::Beneficiary))?;
        let pro_id = pro.id.clone().ok_or_else(|| {
            CompletionFailure::at(CompletionStep::Beneficiary)(DispatchError::NoBeneficiary {
                job_id: job.id.clone(),
            })
        })?;

        // 3. Amount
        let derivation = derive_payout(&self.policy, &job);
        if !derivation.amount.is_finite() {
            return Err(CompletionFailure::at(CompletionStep::Amount)(
                DispatchError::NonFinitePayout {
                    job_id: job.id.clone(),
                },
            ));
        }
        if derivation.source == PayoutSource::Unpriced {
            warn!(job_id = %job.id, "job has no pricing data; recording a zero payout");
        }

        // 4. Integrity
        if let Some(order_total) = job.order_total().filter(|t| t.is_finite()) {
            if derivation.amount > order_total {
                warn!(job_id = %job.id, payout = derivation.amount, order_total,
                    "payout exceeds order total");
                return Err(CompletionFailure::at(CompletionStep::Integrity)(
                    DispatchError::PayoutExceedsTotal {
                        job_id: job.id.clone(),
                        payout: derivation.amount,
                        order_total,
                    },
                ));
            }
            if derivation.amount > order_total * PAYOUT_WARN_RATIO {
                warn!(job_id = %job.id, payout = derivation.amount, order_total,
                    "payout is above 90% of the order total");
            }
        }

        // 5. Service week; the stamp below reuses the same completion time.
        let completed_at = completion_time(&job, request.completed_at);
        let service_date = service_date(&job, Some(completed_at));
        let week = week_start(service_date);

        // 6. Ledger
        let metadata = json!({
            "derivation": derivation,
            "service_date": service_date.to_rfc3339(),
            "actor": request.actor.kind(),
            "pro_email": pro.email,
        });
        let entry = PayoutLedgerEntry::pending_job_payout(
            job.id.clone(),
            pro_id.clone(),
            derivation.amount,
            week,
            metadata,
        );
        let ledger_id = self
            .ledger
            .upsert(&entry)
            .await
            .inspect_err(|err| {
                error!(job_id = %job.id, %pro_id, error = %err, "payout ledger write failed")
            })
            .map_err(CompletionFailure::at(CompletionStep::Ledger))?;

        // 7. Best effort
        let job_stamped = self.stamp_completed(&schema, &job, completed_at).await;
        let notification = match &pro.email {
            Some(email) => {
                let notice =
                    Notification::job_completed(&job.id, &pro_id, email, derivation.amount);
                match self.notifier.send(&notice).await {
                    Ok(Delivery::Sent) => NotificationOutcome::Sent,
                    Ok(Delivery::Duplicate) => NotificationOutcome::Duplicate,
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "completion notification failed");
                        NotificationOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            }
            None => NotificationOutcome::Skipped,
        };

        info!(
            job_id = %job.id,
            %ledger_id,
            %pro_id,
            amount = derivation.amount,
            week_start = %week,
            "job completion recorded"
        );
        Ok(CompletionReceipt {
            job_id: job.id.clone(),
            ledger_id,
            pro_id,
            amount: derivation.amount,
            source: derivation.source,
            week_start: week,
            job_stamped,
            notification,
        })
    }

    /// The acting pro, else the job's stored assignment, with its id resolved
    /// through the directory when only an e-mail is known.
    async fn beneficiary(&self, job: &JobRecord, actor: &Actor) -> Result<ProRef, DispatchError> {
        let pro = match actor {
            Actor::Pro(pro) if pro.display_value().is_some() => pro.clone(),
            _ => job.assigned_pro().ok_or_else(|| DispatchError::NoBeneficiary {
                job_id: job.id.clone(),
            })?,
        };
        if pro.id.is_some() && pro.email.is_some() {
            return Ok(pro);
        }
        match self.pros.find(&pro).await {
            Ok(Some(found)) => Ok(ProRef {
                id: pro.id.or(found.id),
                email: pro.email.or(found.email),
            }),
            Ok(None) => Ok(pro),
            // Only fatal when the id is still unknown.
            Err(err) if pro.id.is_none() => Err(err),
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "pro directory lookup failed");
                Ok(pro)
            }
        }
    }

    async fn stamp_completed(
        &self,
        schema: &SchemaDescriptor,
        job: &JobRecord,
        completed_at: DateTime<Utc>,
    ) -> bool {
        let mut patch = Row::new();
        if let Some(status_column) = &schema.jobs.status_column {
            let moves = job.status(schema).is_none_or(|s| {
                s != JobStatus::Completed && s.can_transition_to(JobStatus::Completed)
            });
            if moves {
                patch.insert(
                    status_column.clone(),
                    Value::String(JobStatus::Completed.as_str().to_string()),
                );
            }
        }
        if job.timestamp(COMPLETED_FIELDS).is_none() {
            patch.insert(
                COMPLETED_AT_COLUMN.into(),
                Value::String(completed_at.to_rfc3339()),
            );
        }
        if patch.is_empty() {
            return true;
        }

        let filters = [Filter::eq(schema.jobs.id_column.as_str(), job.id.as_str())];
        let mut result = self.store.update(&schema.jobs.table, &filters, &patch).await;
        let retry = matches!(&result, Err(err) if err.is_missing_column(COMPLETED_AT_COLUMN));
        if retry {
            patch.remove(COMPLETED_AT_COLUMN);
            result = if patch.is_empty() {
                Ok(0)
            } else {
                self.store.update(&schema.jobs.table, &filters, &patch).await
            };
        }
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "could not stamp job as completed");
                false
            }
        }
    }
}

/// Requested completion time, else the one already on the job, else now.
fn completion_time(job: &JobRecord, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
    requested
        .or_else(|| job.timestamp(COMPLETED_FIELDS))
        .unwrap_or_else(Utc::now)
}

/// Scheduled start, else start, else completion, else creation, else now.
fn service_date(job: &JobRecord, completed_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    job.timestamp(SCHEDULED_FIELDS)
        .or_else(|| job.timestamp(START_FIELDS))
        .or(completed_at)
        .or_else(|| job.timestamp(COMPLETED_FIELDS))
        .or_else(|| job.timestamp(CREATED_FIELDS))
        .unwrap_or_else(Utc::now)
}

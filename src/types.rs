//! Dispatch domain types
//!
//! Status enums normalize the many strings found in production rows. Job and pro
//! rows stay loosely typed underneath; [`JobRecord`] and [`Pro`] expose named
//! accessors so nothing outside this module and the schema resolver does
//! string-keyed field lookups.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::schema::SchemaDescriptor;
use crate::store::{value_f64, value_text, Row};

// ============================================================================
// Column name preferences for job and pro rows
// ============================================================================

/// Assignment fields on a job row, in the order they are trusted.
pub const JOB_ASSIGNMENT_FIELDS: &[&str] = &[
    "assigned_to",
    "assigned_pro_id",
    "pro_id",
    "tech_id",
    "technician_id",
    "assigned_email",
    "pro_email",
    "tech_email",
];
const LAT_FIELDS: &[&str] = &["lat", "latitude", "service_lat", "geo_lat"];
const LNG_FIELDS: &[&str] = &["lng", "lon", "longitude", "service_lng", "geo_lng"];
const SERVICE_FIELDS: &[&str] = &["service_type", "service", "service_name", "job_type", "title"];
const SUBTOTAL_FIELDS: &[&str] = &["subtotal", "order_subtotal", "subtotal_amount"];
const TOTAL_FIELDS: &[&str] = &["order_total", "total", "total_amount", "amount_total"];
const STORED_PAYOUT_FIELDS: &[&str] = &["pro_payout", "payout_amount", "payout", "tech_payout"];
const LINE_ITEM_FIELDS: &[&str] = &["line_items", "items"];
const METADATA_FIELDS: &[&str] = &["metadata", "meta"];
/// Service date sources, highest priority first.
pub const SCHEDULED_FIELDS: &[&str] = &[
    "scheduled_start",
    "scheduled_start_at",
    "scheduled_at",
    "service_date",
];
pub const START_FIELDS: &[&str] = &["start_at", "starts_at", "start_time", "started_at"];
pub const COMPLETED_FIELDS: &[&str] = &["completed_at", "finished_at"];
pub const CREATED_FIELDS: &[&str] = &["created_at", "inserted_at"];

// ============================================================================
// Status enums
// ============================================================================

/// Lifecycle of a job.
///
/// `Open → Assigned → InProgress → Completed → {PendingPayment → Paid} | Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    Assigned,
    InProgress,
    Completed,
    PendingPayment,
    Paid,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::PendingPayment => "pending_payment",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map a status string seen in the wild onto the lifecycle.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let status = match normalized.as_str() {
            "open" | "new" | "pending" | "unassigned" | "queued" | "created" => Self::Open,
            "assigned" | "offered" | "offer_sent" | "accepted" | "scheduled" | "dispatched"
            | "confirmed" => Self::Assigned,
            "in_progress" | "started" | "en_route" | "on_site" | "working" => Self::InProgress,
            "completed" | "complete" | "done" | "finished" => Self::Completed,
            "pending_payment" | "awaiting_payment" | "invoiced" | "payout_pending" => {
                Self::PendingPayment
            }
            "paid" | "paid_out" => Self::Paid,
            "cancelled" | "canceled" | "void" | "voided" => Self::Cancelled,
            _ => return None,
        };
        Some(status)
    }

    /// Allowed lifecycle moves. Re-applying the current status is always allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Open, Assigned)
                | (Open, Cancelled)
                | (Assigned, Open)
                | (Assigned, InProgress)
                | (Assigned, Completed)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (Completed, PendingPayment)
                | (Completed, Paid)
                | (PendingPayment, Paid)
        )
    }

    /// Whether completion bookkeeping may run for a job in this status. Only
    /// cancelled jobs are refused; post-completion statuses let retries converge.
    pub fn allows_completion(self) -> bool {
        self != Self::Cancelled
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of a (job, pro) assignment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    OfferSent,
    Accepted,
    Declined,
    Cancelled,
    Completed,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfferSent => "offer_sent",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Job status implied by recording an assignment in this state.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::OfferSent | Self::Accepted => JobStatus::Assigned,
            Self::Declined | Self::Cancelled => JobStatus::Open,
            Self::Completed => JobStatus::Completed,
        }
    }

    /// Whether recording this state hands the job to the pro.
    pub fn holds_job(&self) -> bool {
        matches!(self, Self::OfferSent | Self::Accepted | Self::Completed)
    }
}

impl std::str::FromStr for AssignmentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer_sent" | "offered" => Ok(Self::OfferSent),
            "accepted" => Ok(Self::Accepted),
            "declined" | "rejected" => Ok(Self::Declined),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown assignment state: {}", s)),
        }
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a payout ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Paid => "paid",
            Self::Rejected => "rejected",
        }
    }
}

/// Kind of payout; part of the ledger idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutType {
    Job,
}

impl PayoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
        }
    }
}

// ============================================================================
// Pro references and directory rows
// ============================================================================

/// Identifies a pro by id, e-mail, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProRef {
    pub id: Option<String>,
    pub email: Option<String>,
}

impl ProRef {
    /// Classify a free-form value: anything containing `@` is an e-mail.
    pub fn from_value(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(if value.contains('@') {
            Self {
                id: None,
                email: Some(value.to_ascii_lowercase()),
            }
        } else {
            Self {
                id: Some(value.to_string()),
                email: None,
            }
        })
    }

    /// Id when known, else e-mail.
    pub fn display_value(&self) -> Option<&str> {
        self.id.as_deref().or(self.email.as_deref())
    }
}

pub(crate) const PRO_ID_FIELDS: &[&str] = &["id", "pro_id", "user_id"];
pub(crate) const PRO_EMAIL_FIELDS: &[&str] = &["email", "pro_email", "contact_email"];
const PRO_STATUS_FIELDS: &[&str] = &["status", "state"];
const ACTIVE_PRO_STATUSES: &[&str] = &["active", "available", "enabled"];

/// A worker row from the pros directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pro {
    pub id: Option<String>,
    pub email: Option<String>,
    pub status: Option<String>,
    pub location: Option<(f64, f64)>,
}

impl Pro {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: first_text(row, PRO_ID_FIELDS),
            email: first_text(row, PRO_EMAIL_FIELDS).map(|e| e.to_ascii_lowercase()),
            status: first_text(row, PRO_STATUS_FIELDS),
            location: coordinates(row, None),
        }
    }

    /// Empty status counts as active.
    pub fn is_active(&self) -> bool {
        match &self.status {
            None => true,
            Some(s) => ACTIVE_PRO_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()),
        }
    }

    pub fn pro_ref(&self) -> ProRef {
        ProRef {
            id: self.id.clone(),
            email: self.email.clone(),
        }
    }
}

// ============================================================================
// Job rows
// ============================================================================

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: f64,
    pub unit_price: Option<f64>,
    pub line_total: Option<f64>,
}

impl LineItem {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let name = first_text(obj, &["name", "title", "service", "service_name", "sku"])
            .unwrap_or_default();
        let quantity = first_number(obj, &["quantity", "qty", "count"]).unwrap_or(1.0);
        Some(Self {
            name,
            quantity,
            unit_price: first_number(obj, &["unit_price", "price", "unit_amount"]),
            line_total: first_number(obj, &["line_total", "total", "amount_total", "subtotal"]),
        })
    }

    /// Explicit line total, else unit price × quantity.
    pub fn total(&self) -> Option<f64> {
        self.line_total
            .or_else(|| self.unit_price.map(|p| p * self.quantity))
    }
}

/// Typed view over a job row; first-class columns win over the metadata bag.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    row: Row,
    metadata: Map<String, Value>,
}

impl JobRecord {
    /// Wrap a row; `None` when the row lacks the resolved id column.
    pub fn from_row(schema: &SchemaDescriptor, row: Row) -> Option<Self> {
        let id = schema.job_id_of(&row)?;
        let metadata = METADATA_FIELDS
            .iter()
            .filter_map(|f| row.get(*f))
            .find_map(|v| match v {
                Value::Object(map) => Some(map.clone()),
                Value::String(s) => serde_json::from_str::<Map<String, Value>>(s).ok(),
                _ => None,
            })
            .unwrap_or_default();
        Some(Self { id, row, metadata })
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Raw status string through the resolved status column.
    pub fn status_text(&self, schema: &SchemaDescriptor) -> Option<String> {
        schema.job_status_of(&self.row)
    }

    pub fn status(&self, schema: &SchemaDescriptor) -> Option<JobStatus> {
        self.status_text(schema).as_deref().and_then(JobStatus::parse)
    }

    fn value(&self, names: &[&str]) -> Option<&Value> {
        names
            .iter()
            .filter_map(|n| self.row.get(*n))
            .find(|v| !v.is_null())
            .or_else(|| {
                names
                    .iter()
                    .filter_map(|n| self.metadata.get(*n))
                    .find(|v| !v.is_null())
            })
    }

    fn text(&self, names: &[&str]) -> Option<String> {
        first_text(&self.row, names).or_else(|| first_text(&self.metadata, names))
    }

    fn number(&self, names: &[&str]) -> Option<f64> {
        first_number(&self.row, names).or_else(|| first_number(&self.metadata, names))
    }

    /// First parseable timestamp among `names`.
    pub fn timestamp(&self, names: &[&str]) -> Option<DateTime<Utc>> {
        names
            .iter()
            .filter_map(|n| self.row.get(*n).or_else(|| self.metadata.get(*n)))
            .filter_map(value_text)
            .find_map(|s| parse_timestamp(&s))
    }

    /// Pro already recorded on the job, in the fixed preference order.
    pub fn assigned_pro(&self) -> Option<ProRef> {
        JOB_ASSIGNMENT_FIELDS
            .iter()
            .find_map(|f| self.row.get(*f).and_then(value_text))
            .and_then(|v| ProRef::from_value(&v))
    }

    pub fn location(&self) -> Option<(f64, f64)> {
        coordinates(&self.row, Some(&self.metadata))
    }

    pub fn service_type(&self) -> Option<String> {
        self.text(SERVICE_FIELDS)
    }

    pub fn order_subtotal(&self) -> Option<f64> {
        self.number(SUBTOTAL_FIELDS).or_else(|| self.order_number(SUBTOTAL_FIELDS))
    }

    pub fn order_total(&self) -> Option<f64> {
        self.number(TOTAL_FIELDS).or_else(|| self.order_number(TOTAL_FIELDS))
    }

    /// A pre-computed payout, when one was stored and is a finite number.
    pub fn stored_payout(&self) -> Option<f64> {
        self.number(STORED_PAYOUT_FIELDS).filter(|v| v.is_finite())
    }

    /// Line items from the row, the metadata bag, or a nested `order` object.
    pub fn line_items(&self) -> Vec<LineItem> {
        let nested = self
            .metadata
            .get("order")
            .and_then(Value::as_object)
            .and_then(|order| {
                LINE_ITEM_FIELDS
                    .iter()
                    .filter_map(|f| order.get(*f))
                    .find(|v| v.is_array())
            });
        self.value(LINE_ITEM_FIELDS)
            .filter(|v| v.is_array())
            .or(nested)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(LineItem::from_value).collect())
            .unwrap_or_default()
    }

    fn order_number(&self, names: &[&str]) -> Option<f64> {
        let order = self.metadata.get("order")?.as_object()?;
        first_number(order, names)
    }
}

fn first_text(map: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| map.get(*n).and_then(value_text))
}

fn first_number(map: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| map.get(*n).and_then(value_f64))
}

fn coordinates(row: &Row, fallback: Option<&Map<String, Value>>) -> Option<(f64, f64)> {
    let read = |map: &Map<String, Value>| {
        let lat = first_number(map, LAT_FIELDS)?;
        let lng = first_number(map, LNG_FIELDS)?;
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some((lat, lng))
    };
    read(row).or_else(|| fallback.and_then(read))
}

/// Parse the timestamp shapes found in job rows; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssignmentsTable, JobsTable};
    use crate::store::row_of;
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
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

    #[test]
    fn test_status_parse_covers_wild_strings() {
        assert_eq!(JobStatus::parse("Offer Sent"), Some(JobStatus::Assigned));
        assert_eq!(JobStatus::parse("en-route"), Some(JobStatus::InProgress));
        assert_eq!(JobStatus::parse("canceled"), Some(JobStatus::Cancelled));
        assert_eq!(JobStatus::parse("awaiting_payment"), Some(JobStatus::PendingPayment));
        assert_eq!(JobStatus::parse("mystery"), None);
    }

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Open.can_transition_to(JobStatus::Assigned));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::PendingPayment));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Assigned));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Paid.can_transition_to(JobStatus::Open));
        assert!(!JobStatus::Cancelled.allows_completion());
        assert!(JobStatus::Open.allows_completion());
        assert!(JobStatus::Paid.allows_completion());
    }

    #[test]
    fn test_assignment_state_parse() {
        assert_eq!("offer_sent".parse::<AssignmentState>(), Ok(AssignmentState::OfferSent));
        assert_eq!("Canceled".parse::<AssignmentState>(), Ok(AssignmentState::Cancelled));
        assert!("maybe".parse::<AssignmentState>().is_err());
        assert_eq!(AssignmentState::Declined.job_status(), JobStatus::Open);
    }

    #[test]
    fn test_job_record_prefers_columns_then_metadata() {
        let row = row_of([
            ("id", json!("j1")),
            ("status", json!("Scheduled")),
            ("subtotal", Value::Null),
            ("pro_email", json!("Pro@Example.com")),
            (
                "metadata",
                json!({
                    "subtotal": "120.50",
                    "service_type": "TV Mounting",
                    "lat": 40.7,
                    "lng": -74.0,
                    "order": {"total": 150, "items": [{"name": "Mount", "qty": 2, "price": 60}]}
                }),
            ),
        ]);
        let job = JobRecord::from_row(&schema(), row).unwrap();

        assert_eq!(job.id, "j1");
        assert_eq!(job.status(&schema()), Some(JobStatus::Assigned));
        assert_eq!(job.order_subtotal(), Some(120.5));
        assert_eq!(job.order_total(), Some(150.0));
        assert_eq!(job.service_type().as_deref(), Some("TV Mounting"));
        assert_eq!(job.location(), Some((40.7, -74.0)));
        assert_eq!(
            job.assigned_pro(),
            Some(ProRef {
                id: None,
                email: Some("pro@example.com".into())
            })
        );
        let items = job.line_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total(), Some(120.0));
    }

    #[test]
    fn test_assignment_fields_follow_preference_order() {
        let row = row_of([
            ("id", json!("j1")),
            ("tech_id", json!("tech-9")),
            ("assigned_to", json!("pro-1")),
        ]);
        let job = JobRecord::from_row(&schema(), row).unwrap();
        assert_eq!(job.assigned_pro().and_then(|p| p.id).as_deref(), Some("pro-1"));
    }

    #[test]
    fn test_metadata_may_be_a_json_string() {
        let row = row_of([
            ("id", json!("j1")),
            ("metadata", json!("{\"pro_payout\": 88}")),
        ]);
        let job = JobRecord::from_row(&schema(), row).unwrap();
        assert_eq!(job.stored_payout(), Some(88.0));
    }

    #[test]
    fn test_pro_activity() {
        let pro = Pro::from_row(&row_of([("id", json!("p1")), ("status", json!("Available"))]));
        assert!(pro.is_active());
        let pro = Pro::from_row(&row_of([("id", json!("p1")), ("status", json!("suspended"))]));
        assert!(!pro.is_active());
        let pro = Pro::from_row(&row_of([("id", json!("p1"))]));
        assert!(pro.is_active());
    }

    #[test]
    fn test_parse_timestamp_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 9, 14, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2026-01-09T14:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-09T09:00:00-05:00"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-09 14:00:00+00"), Some(expected));
        assert_eq!(parse_timestamp("2026-01-09T14:00:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2026-01-09"),
            Some(Utc.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("soon"), None);
    }
}

//! Schema Resolver
//!
//! Production runs several historical revisions of the dispatch tables side by
//! side, so table and column names are discovered instead of hard-coded. Each
//! candidate table is probed with a one-row read, scored by name hints and by the
//! concept columns it exposes, and the winners are folded into an immutable
//! [`SchemaDescriptor`].
//!
//! The descriptor is cached for a fixed window; a cache hit performs no database
//! access. Environment overrides skip discovery for the table they name.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PortalConfig, SchemaOverrides};
use crate::error::{DispatchError, Result, SchemaConcept};
use crate::store::{value_text, Query, Row, RowStore, StoreError};

/// Assignment tables, most specific first.
pub const ASSIGNMENT_TABLE_CANDIDATES: &[&str] = &[
    "h2s_dispatch_job_assignments",
    "dispatch_job_assignments",
    "job_assignments",
    "dispatch_assignments",
    "h2s_job_assignments",
    "assignments",
    "job_offers",
];

/// Job tables, most specific first.
pub const JOB_TABLE_CANDIDATES: &[&str] = &[
    "h2s_dispatch_jobs",
    "dispatch_jobs",
    "jobs",
    "h2s_jobs",
    "service_jobs",
    "portal_jobs",
];

/// Job reference columns on assignment rows.
pub const ASSIGNMENT_JOB_COLUMNS: &[&str] = &["job_id", "dispatch_job_id", "order_id"];
/// Pro identifier columns, preferred order.
pub const PRO_ID_COLUMNS: &[&str] = &[
    "pro_id",
    "tech_id",
    "technician_id",
    "worker_id",
    "assigned_pro_id",
    "pro_user_id",
];
/// Pro e-mail columns, preferred order.
pub const PRO_EMAIL_COLUMNS: &[&str] = &[
    "pro_email",
    "tech_email",
    "technician_email",
    "assigned_email",
    "email",
];
/// Assignment state columns.
pub const ASSIGNMENT_STATE_COLUMNS: &[&str] =
    &["state", "status", "assignment_state", "offer_status"];
/// Job primary key columns.
pub const JOB_ID_COLUMNS: &[&str] = &["job_id", "id", "dispatch_job_id"];
/// Job status columns.
pub const JOB_STATUS_COLUMNS: &[&str] = &["status", "job_status", "state"];

const ASSIGNMENT_NAME_HINTS: &[(&str, i32)] = &[
    ("assign", 6),
    ("offer", 3),
    ("dispatch", 2),
    ("job", 1),
];
const JOB_NAME_HINTS: &[(&str, i32)] = &[
    ("job", 5),
    ("dispatch", 2),
    ("order", 1),
    ("service", 1),
    ("assign", -6),
    ("offer", -4),
];
const NEGATIVE_NAME_HINTS: &[(&str, i32)] = &[("tracking", -10), ("pixel", -10), ("review", -10)];
const COLUMN_BONUS: i32 = 3;

/// Whether a pro is being matched by identifier or by e-mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProMatch {
    #[default]
    Id,
    Email,
}

impl ProMatch {
    /// E-mail when the value looks like an address.
    pub fn for_value(value: &str) -> Self {
        if value.contains('@') {
            Self::Email
        } else {
            Self::Id
        }
    }
}

/// Resolved jobs table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobsTable {
    pub table: String,
    pub id_column: String,
    pub status_column: Option<String>,
    /// Observed column set; `None` when overridden or the table was empty.
    pub columns: Option<BTreeSet<String>>,
}

/// Resolved assignments table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentsTable {
    pub table: String,
    pub job_column: String,
    pub pro_id_column: Option<String>,
    pub pro_email_column: Option<String>,
    pub state_column: Option<String>,
    pub columns: Option<BTreeSet<String>>,
}

impl AssignmentsTable {
    /// Pro column for the requested match, falling back to the other kind.
    pub fn pro_column(&self, by: ProMatch) -> Option<&str> {
        let (first, second) = match by {
            ProMatch::Id => (&self.pro_id_column, &self.pro_email_column),
            ProMatch::Email => (&self.pro_email_column, &self.pro_id_column),
        };
        first.as_deref().or(second.as_deref())
    }

    /// Whether `column` is known to exist (always true when the shape is unknown).
    pub fn may_have(&self, column: &str) -> bool {
        self.columns.as_ref().is_none_or(|c| c.contains(column))
    }
}

/// Mapping of logical dispatch concepts to concrete table and column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDescriptor {
    pub jobs: JobsTable,
    pub assignments: AssignmentsTable,
}

impl SchemaDescriptor {
    pub fn job_id_of(&self, job: &Row) -> Option<String> {
        job.get(&self.jobs.id_column).and_then(value_text)
    }

    pub fn job_status_of(&self, job: &Row) -> Option<String> {
        let column = self.jobs.status_column.as_ref()?;
        job.get(column).and_then(value_text)
    }

    pub fn assignment_job_of(&self, assignment: &Row) -> Option<String> {
        assignment
            .get(&self.assignments.job_column)
            .and_then(value_text)
    }

    pub fn pro_id_of(&self, assignment: &Row) -> Option<String> {
        let column = self.assignments.pro_id_column.as_ref()?;
        assignment.get(column).and_then(value_text)
    }

    pub fn pro_email_of(&self, assignment: &Row) -> Option<String> {
        let column = self.assignments.pro_email_column.as_ref()?;
        assignment.get(column).and_then(value_text)
    }

    pub fn assignment_state_of(&self, assignment: &Row) -> Option<String> {
        let column = self.assignments.state_column.as_ref()?;
        assignment.get(column).and_then(value_text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Shape {
    Known(BTreeSet<String>),
    Unknown,
}

impl Shape {
    fn first_of(&self, preferred: &[&str]) -> Option<String> {
        match self {
            Self::Known(cols) => preferred
                .iter()
                .find(|p| cols.contains(**p))
                .map(|p| p.to_string()),
            Self::Unknown => preferred.first().map(|p| p.to_string()),
        }
    }

    fn columns(&self) -> Option<BTreeSet<String>> {
        match self {
            Self::Known(cols) => Some(cols.clone()),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Probe {
    table: String,
    shape: Shape,
}

fn is_concept_column(column: &str) -> bool {
    [
        ASSIGNMENT_JOB_COLUMNS,
        JOB_ID_COLUMNS,
        PRO_ID_COLUMNS,
        PRO_EMAIL_COLUMNS,
        ASSIGNMENT_STATE_COLUMNS,
        JOB_STATUS_COLUMNS,
    ]
    .iter()
    .any(|list| list.contains(&column))
}

fn score_table(name: &str, shape: &Shape, hints: &[(&str, i32)]) -> i32 {
    let lower = name.to_ascii_lowercase();
    let mut score: i32 = hints
        .iter()
        .chain(NEGATIVE_NAME_HINTS)
        .filter(|(hint, _)| lower.contains(hint))
        .map(|(_, weight)| weight)
        .sum();
    if let Shape::Known(cols) = shape {
        let matches = cols.iter().filter(|c| is_concept_column(c)).count() as i32;
        score += COLUMN_BONUS * matches;
    }
    score
}

fn assignments_from_probe(probe: &Probe) -> Option<AssignmentsTable> {
    let job_column = probe.shape.first_of(ASSIGNMENT_JOB_COLUMNS)?;
    let pro_id_column = probe.shape.first_of(PRO_ID_COLUMNS);
    let pro_email_column = match probe.shape {
        Shape::Known(_) => probe.shape.first_of(PRO_EMAIL_COLUMNS),
        Shape::Unknown => None,
    };
    if pro_id_column.is_none() && pro_email_column.is_none() {
        return None;
    }
    Some(AssignmentsTable {
        table: probe.table.clone(),
        job_column,
        pro_id_column,
        pro_email_column,
        state_column: probe.shape.first_of(ASSIGNMENT_STATE_COLUMNS),
        columns: probe.shape.columns(),
    })
}

fn jobs_from_probe(probe: &Probe) -> Option<JobsTable> {
    Some(JobsTable {
        table: probe.table.clone(),
        id_column: probe.shape.first_of(JOB_ID_COLUMNS)?,
        status_column: probe.shape.first_of(JOB_STATUS_COLUMNS),
        columns: probe.shape.columns(),
    })
}

/// Highest scoring probe that clears `build`; ties keep candidate order.
fn pick<T>(
    probes: &[Probe],
    hints: &[(&str, i32)],
    build: impl Fn(&Probe) -> Option<T>,
) -> Option<(T, i32)> {
    let mut best: Option<(T, i32)> = None;
    for probe in probes {
        let Some(candidate) = build(probe) else {
            debug!(table = %probe.table, "candidate lacks required columns");
            continue;
        };
        let score = score_table(&probe.table, &probe.shape, hints);
        debug!(table = %probe.table, score, "scored schema candidate");
        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((candidate, score));
        }
    }
    best
}

fn assignments_override(o: &SchemaOverrides) -> Option<AssignmentsTable> {
    let table = o.assignments_table.clone()?;
    let pro = o
        .assignments_pro_column
        .clone()
        .unwrap_or_else(|| PRO_ID_COLUMNS[0].to_string());
    let (pro_id_column, pro_email_column) = if pro.to_ascii_lowercase().contains("email") {
        (None, Some(pro))
    } else {
        (Some(pro), None)
    };
    Some(AssignmentsTable {
        table,
        job_column: o
            .assignments_job_column
            .clone()
            .unwrap_or_else(|| ASSIGNMENT_JOB_COLUMNS[0].to_string()),
        pro_id_column,
        pro_email_column,
        state_column: Some(
            o.assignments_state_column
                .clone()
                .unwrap_or_else(|| ASSIGNMENT_STATE_COLUMNS[0].to_string()),
        ),
        columns: None,
    })
}

fn jobs_override(o: &SchemaOverrides) -> Option<JobsTable> {
    Some(JobsTable {
        table: o.jobs_table.clone()?,
        id_column: o
            .jobs_id_column
            .clone()
            .unwrap_or_else(|| JOB_ID_COLUMNS[0].to_string()),
        status_column: Some(
            o.jobs_status_column
                .clone()
                .unwrap_or_else(|| JOB_STATUS_COLUMNS[0].to_string()),
        ),
        columns: None,
    })
}

/// Cached descriptor with its expiry; `None` expiry never lapses.
#[derive(Debug, Clone)]
struct Cached {
    value: Arc<SchemaDescriptor>,
    expires_at: Option<Instant>,
}

/// Discovers and caches the [`SchemaDescriptor`].
pub struct SchemaResolver {
    store: Option<Arc<dyn RowStore>>,
    overrides: SchemaOverrides,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl SchemaResolver {
    pub fn new(store: Arc<dyn RowStore>, config: &PortalConfig) -> Self {
        Self {
            store: Some(store),
            overrides: config.schema.clone(),
            ttl: config.schema_ttl,
            cache: RwLock::new(None),
        }
    }

    /// A resolver that always returns `descriptor` and never touches a database.
    pub fn fixed(descriptor: SchemaDescriptor) -> Self {
        Self {
            store: None,
            overrides: SchemaOverrides::default(),
            ttl: Duration::MAX,
            cache: RwLock::new(Some(Cached {
                value: Arc::new(descriptor),
                expires_at: None,
            })),
        }
    }

    /// Return the cached descriptor, discovering it when absent or expired.
    pub async fn resolve(&self) -> Result<Arc<SchemaDescriptor>> {
        if let Some(hit) = self.cached() {
            return Ok(hit);
        }

        let descriptor = Arc::new(self.discover().await?);
        let expires_at = Instant::now().checked_add(self.ttl);
        if let Ok(mut slot) = self.cache.write() {
            *slot = Some(Cached {
                value: descriptor.clone(),
                expires_at,
            });
        }
        Ok(descriptor)
    }

    fn cached(&self) -> Option<Arc<SchemaDescriptor>> {
        let slot = self.cache.read().ok()?;
        let cached = slot.as_ref()?;
        match cached.expires_at {
            Some(at) if Instant::now() >= at => None,
            _ => Some(cached.value.clone()),
        }
    }

    async fn discover(&self) -> Result<SchemaDescriptor> {
        let assignments_fixed = assignments_override(&self.overrides);
        let jobs_fixed = jobs_override(&self.overrides);

        let assignments = match assignments_fixed {
            Some(table) => table,
            None => {
                let probes = self.probe_all(ASSIGNMENT_TABLE_CANDIDATES).await?;
                let (table, score) = pick(&probes, ASSIGNMENT_NAME_HINTS, assignments_from_probe)
                    .ok_or(DispatchError::SchemaNotFound {
                        concept: SchemaConcept::Assignments,
                    })?;
                info!(table = %table.table, score, job_column = %table.job_column,
                    pro_id_column = ?table.pro_id_column,
                    pro_email_column = ?table.pro_email_column,
                    "resolved assignments table");
                table
            }
        };

        let jobs = match jobs_fixed {
            Some(table) => table,
            None => {
                let probes = self.probe_all(JOB_TABLE_CANDIDATES).await?;
                let (table, score) = pick(&probes, JOB_NAME_HINTS, jobs_from_probe).ok_or(
                    DispatchError::SchemaNotFound {
                        concept: SchemaConcept::Jobs,
                    },
                )?;
                info!(table = %table.table, score, id_column = %table.id_column,
                    status_column = ?table.status_column, "resolved jobs table");
                table
            }
        };

        Ok(SchemaDescriptor { jobs, assignments })
    }

    async fn probe_all(&self, candidates: &[&str]) -> Result<Vec<Probe>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let mut probes = Vec::new();
        let mut failure: Option<StoreError> = None;
        for table in candidates {
            match store.select(table, &Query::new().limit(1)).await {
                Ok(rows) => {
                    let shape = match rows.first() {
                        Some(row) => Shape::Known(row.keys().cloned().collect()),
                        None => Shape::Unknown,
                    };
                    probes.push(Probe {
                        table: table.to_string(),
                        shape,
                    });
                }
                Err(StoreError::MissingTable { .. }) => {
                    debug!(table, "schema candidate absent");
                }
                Err(err) => {
                    warn!(table, error = %err, "schema probe failed");
                    failure = Some(err);
                }
            }
        }
        // No readable candidate and a real failure: report the store error.
        match failure {
            Some(err) if probes.is_empty() => Err(err.into()),
            _ => Ok(probes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::row_of;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn config() -> PortalConfig {
        PortalConfig::default()
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_table("job_assignments", &["job_id", "pro_email", "status"]);
        store.seed(
            "job_assignments",
            vec![row_of([
                ("job_id", json!("j0")),
                ("pro_email", json!("old@pro.test")),
                ("status", json!("accepted")),
            ])],
        );
        store.create_table(
            "h2s_dispatch_job_assignments",
            &["assignment_id", "job_id", "pro_id", "state"],
        );
        store.seed(
            "h2s_dispatch_job_assignments",
            vec![row_of([
                ("assignment_id", json!(1)),
                ("job_id", json!("j0")),
                ("pro_id", json!("p0")),
                ("state", json!("offer_sent")),
            ])],
        );
        store.create_table("jobs", &["id", "status", "subtotal"]);
        store.seed(
            "jobs",
            vec![row_of([
                ("id", json!("j0")),
                ("status", json!("open")),
                ("subtotal", json!(100)),
            ])],
        );
        store
    }

    #[test]
    fn test_negative_hints_sink_tracking_tables() {
        let cols = Shape::Known(["job_id", "pro_id"].iter().map(|s| s.to_string()).collect());
        let good = score_table("job_assignments", &cols, ASSIGNMENT_NAME_HINTS);
        let bad = score_table("assignment_tracking_pixel", &cols, ASSIGNMENT_NAME_HINTS);
        assert!(good > bad);
    }

    #[tokio::test]
    async fn test_discovers_best_tables() {
        let store = seeded_store();
        let resolver = SchemaResolver::new(store.clone(), &config());
        let schema = resolver.resolve().await.unwrap();

        assert_eq!(schema.assignments.table, "h2s_dispatch_job_assignments");
        assert_eq!(schema.assignments.job_column, "job_id");
        assert_eq!(schema.assignments.pro_id_column.as_deref(), Some("pro_id"));
        assert_eq!(schema.assignments.state_column.as_deref(), Some("state"));
        assert_eq!(schema.jobs.table, "jobs");
        assert_eq!(schema.jobs.id_column, "id");
        assert_eq!(schema.jobs.status_column.as_deref(), Some("status"));
    }

    #[tokio::test]
    async fn test_email_only_table_prefers_email_column() {
        let store = Arc::new(MemoryStore::new());
        store.create_table("job_assignments", &["job_id", "pro_email", "status"]);
        store.seed(
            "job_assignments",
            vec![row_of([
                ("job_id", json!("j0")),
                ("pro_email", json!("a@b.test")),
                ("status", json!("accepted")),
            ])],
        );
        store.create_table("jobs", &["job_id"]);

        let schema = SchemaResolver::new(store, &config()).resolve().await.unwrap();
        assert_eq!(schema.assignments.pro_id_column, None);
        assert_eq!(schema.assignments.pro_column(ProMatch::Id), Some("pro_email"));
        assert_eq!(schema.assignments.pro_column(ProMatch::Email), Some("pro_email"));
        // Empty jobs table: shape unknown, preferred defaults.
        assert_eq!(schema.jobs.id_column, "job_id");
        assert_eq!(schema.jobs.columns, None);
    }

    #[tokio::test]
    async fn test_cache_hit_issues_no_probes() {
        let store = seeded_store();
        let resolver = SchemaResolver::new(store.clone(), &config());
        let first = resolver.resolve().await.unwrap();
        let probes = store.select_count();
        assert!(probes > 0);

        let second = resolver.resolve().await.unwrap();
        assert_eq!(store.select_count(), probes);
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn test_expired_cache_rediscovers() {
        let store = seeded_store();
        let cfg = PortalConfig {
            schema_ttl: Duration::ZERO,
            ..config()
        };
        let resolver = SchemaResolver::new(store.clone(), &cfg);
        resolver.resolve().await.unwrap();
        let probes = store.select_count();
        resolver.resolve().await.unwrap();
        assert!(store.select_count() > probes);
    }

    #[tokio::test]
    async fn test_overrides_bypass_discovery() {
        let store = seeded_store();
        let mut cfg = config();
        cfg.schema.assignments_table = Some("custom_assignments".into());
        cfg.schema.assignments_pro_column = Some("tech_email".into());
        cfg.schema.jobs_table = Some("custom_jobs".into());
        cfg.schema.jobs_id_column = Some("uid".into());

        let schema = SchemaResolver::new(store.clone(), &cfg).resolve().await.unwrap();
        assert_eq!(store.select_count(), 0);
        assert_eq!(schema.assignments.table, "custom_assignments");
        assert_eq!(schema.assignments.pro_email_column.as_deref(), Some("tech_email"));
        assert_eq!(schema.assignments.pro_id_column, None);
        assert_eq!(schema.jobs.table, "custom_jobs");
        assert_eq!(schema.jobs.id_column, "uid");
    }

    #[tokio::test]
    async fn test_not_found_fails_closed_and_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        store.create_table("jobs", &["id"]);
        let resolver = SchemaResolver::new(store.clone(), &config());

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SchemaNotFound {
                concept: SchemaConcept::Assignments
            }
        ));
        let probes = store.select_count();
        assert!(resolver.resolve().await.is_err());
        assert!(store.select_count() > probes);
    }

    #[tokio::test]
    async fn test_unreadable_database_is_a_store_error() {
        let store = Arc::new(MemoryStore::new());
        for table in ASSIGNMENT_TABLE_CANDIDATES {
            store.fail_reads(table, StoreError::Backend("connection refused".into()));
        }
        let err = SchemaResolver::new(store, &config())
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::Backend(_))));
        assert_eq!(err.code(), "store_error");
    }

    #[tokio::test]
    async fn test_one_unreadable_candidate_keeps_readable_table() {
        let store = Arc::new(MemoryStore::new());
        store.fail_reads(
            "h2s_dispatch_job_assignments",
            StoreError::Backend("permission denied".into()),
        );
        store.create_table("job_assignments", &["job_id", "pro_id"]);
        store.create_table("jobs", &["id"]);
        let schema = SchemaResolver::new(store, &config()).resolve().await.unwrap();
        assert_eq!(schema.assignments.table, "job_assignments");
    }

    #[tokio::test]
    async fn test_fixed_descriptor_never_probes() {
        let descriptor = SchemaDescriptor {
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
        };
        let resolver = SchemaResolver::fixed(descriptor.clone());
        assert_eq!(*resolver.resolve().await.unwrap(), descriptor);
    }

    #[test]
    fn test_descriptor_accessors() {
        let descriptor = SchemaDescriptor {
            jobs: JobsTable {
                table: "jobs".into(),
                id_column: "job_id".into(),
                status_column: Some("status".into()),
                columns: None,
            },
            assignments: AssignmentsTable {
                table: "a".into(),
                job_column: "dispatch_job_id".into(),
                pro_id_column: Some("tech_id".into()),
                pro_email_column: Some("tech_email".into()),
                state_column: Some("offer_status".into()),
                columns: None,
            },
        };
        let job = row_of([("job_id", json!(17)), ("status", json!("open"))]);
        assert_eq!(descriptor.job_id_of(&job).as_deref(), Some("17"));
        assert_eq!(descriptor.job_status_of(&job).as_deref(), Some("open"));

        let assignment = row_of([
            ("dispatch_job_id", json!("17")),
            ("tech_id", json!("p9")),
            ("tech_email", json!("p9@pro.test")),
            ("offer_status", json!("accepted")),
        ]);
        assert_eq!(descriptor.assignment_job_of(&assignment).as_deref(), Some("17"));
        assert_eq!(descriptor.pro_id_of(&assignment).as_deref(), Some("p9"));
        assert_eq!(descriptor.pro_email_of(&assignment).as_deref(), Some("p9@pro.test"));
        assert_eq!(descriptor.assignment_state_of(&assignment).as_deref(), Some("accepted"));
    }
}

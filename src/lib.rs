//! pro-dispatch - job dispatch and payout orchestration
//!
//! Assigns service jobs to pros and turns completed jobs into payout ledger
//! entries, against a database whose table and column names are discovered at
//! runtime.
//!
//! ## Call chain
//! Schema Resolver -> Reference Resolver (job creation) -> Offer Engine
//! (dispatch) -> Completion Orchestrator (payout ledger + notification)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pro_dispatch::{
//!     Actor, CompletionOrchestrator, CompletionRequest, LogNotifier, MemoryStore,
//!     PortalConfig, SchemaResolver,
//! };
//!
//! # async fn run() {
//! let config = PortalConfig::from_env();
//! let store = Arc::new(MemoryStore::new());
//! let schema = Arc::new(SchemaResolver::new(store.clone(), &config));
//! let orchestrator =
//!     CompletionOrchestrator::new(store, schema, Arc::new(LogNotifier), &config);
//! let result = orchestrator
//!     .complete(CompletionRequest::new("job-1", Actor::System))
//!     .await;
//! println!("{}", pro_dispatch::completion_response(&result));
//! # }
//! ```

// Core error handling
pub mod error;

// Configuration and domain types
pub mod config;
pub mod types;

// Row store port and adapters
pub mod store;
pub mod store_memory;
#[cfg(feature = "database")]
pub mod store_postgres;

// Discovery
pub mod refs;
pub mod schema;

// Dispatch and payout
pub mod completion;
pub mod jobs;
pub mod ledger;
pub mod notify;
pub mod offer;
pub mod payout;
pub mod pros;

pub use completion::{
    completion_response, Actor, CompletionFailure, CompletionOrchestrator, CompletionReceipt,
    CompletionRequest, CompletionStep, NotificationOutcome,
};
pub use config::{PayoutPolicy, PortalConfig};
pub use error::{DispatchError, Result};
pub use jobs::{DispatchJobs, NewJob};
pub use ledger::{get_week_start, week_start, PayoutLedger, PayoutLedgerEntry};
pub use notify::{HttpNotifier, LogNotifier, MemoryNotifier, Notification, Notifier};
pub use offer::{AssignmentRecord, JobPatch, OfferEngine, OfferOutcome, ProSelection};
pub use payout::{derive_payout, PayoutDerivation, PayoutSource};
pub use refs::{ReferenceResolver, RequiredReferences};
pub use schema::{SchemaDescriptor, SchemaResolver};
pub use store::{Filter, Query, Row, RowStore, StoreError};
pub use store_memory::MemoryStore;
#[cfg(feature = "database")]
pub use store_postgres::{DatabaseConfig, PgRowStore};
pub use types::{AssignmentState, JobRecord, JobStatus, ProRef};

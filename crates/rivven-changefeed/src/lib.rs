//! # rivven-changefeed
//!
//! Lifecycle management for CockroachDB changefeed (CDC) jobs.
//!
//! A changefeed streams row changes of a set of tables into an external
//! sink. This crate creates the job, detects drift between the desired and
//! the observed configuration, changes the table set through a
//! pause → alter → resume saga, and cancels the job.
//!
//! ## Features
//!
//! - **Minimal updates**: only the table set can change in place, and only
//!   the difference is sent
//! - **Status polling**: deadline-bounded waits on asynchronous job transitions
//! - **Description decoding**: options the database only reports as free text
//!   are recovered for import and drift checks
//! - **Scoped transactions**: commit on success, rollback on failure or drop
//! - **Saga recovery**: interrupted updates resume from the recorded phase
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_changefeed::prelude::*;
//!
//! let conn = rivven_changefeed::postgres::connect(&ConnectionConfig::new(
//!     "postgresql://root@localhost:26257/defaultdb",
//! ))
//! .await?;
//!
//! let reconciler = ChangefeedReconciler::default();
//! let spec = ChangefeedSpec::new(["orders", "customers"], "kafka", "shop", "registry")
//!     .with_cursor("2024-01-01 00:00:00");
//!
//! let mut record = reconciler.create(conn.as_ref(), &spec).await?;
//! reconciler.read(conn.as_ref(), &mut record).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default) - backend via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod differ;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod reconciler;
pub mod record;
pub mod spec;
pub mod testing;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::{encode_create, ControlStatement, DecodedConfig};
    pub use crate::config::{ConnectionConfig, ReconcilerConfig};
    pub use crate::connection::{Connection, Row, Transaction, TransactionScope};
    pub use crate::differ::TableDiff;
    pub use crate::error::{ChangefeedError, ErrorCategory, Result};
    pub use crate::poller::{JobStatusQuery, StatusPoller, StatusSource};
    pub use crate::reconciler::{
        ApplyOutcome, ChangefeedReconciler, FieldDrift, Plan, ReadOutcome, ReadReport,
        UpdateOutcome,
    };
    pub use crate::record::{
        ChangefeedRecord, DiscardRecords, FileRecordStore, MemoryRecordStore, RecordStore,
        UpdatePhase,
    };
    pub use crate::spec::{ChangefeedSpec, InitialScan, JobId};
}

pub use error::{ChangefeedError, Result};
pub use reconciler::ChangefeedReconciler;

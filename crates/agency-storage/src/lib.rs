//! Storage abstractions for the agency data-collection service.
//!
//! This crate defines the storage contract for the two tables the service
//! owns:
//! - the mutable submission record tracking one form submission's
//!   processing state
//! - the append-once, finalize-once transaction ledger
//!
//! Design stance:
//! - Postgres is the transactional source of truth.
//! - Every write is its own atomic statement; no multi-statement
//!   transaction spans a pipeline run. A crash between steps can leave the
//!   ledger and the submission row individually consistent but mutually
//!   divergent.
//! - Lifecycle transitions are guarded in the adapters so a row can never
//!   move backwards.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use model::{
    ExternalSync, FinalizeOutcome, LedgerAppend, LedgerEntry, LedgerFinalize, LedgerHandle,
    LedgerLookup, LedgerStatus, NewSubmission, SubmissionHandle, SubmissionRecord,
    SubmissionStatus,
};
pub use traits::{LedgerStore, QueryWindow, SubmissionStore};

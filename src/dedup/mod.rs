//! Duplicate-suppression for turn submissions
//!
//! Three independent guards keep one capture from becoming two turns:
//! - [`Debounce`] drops a second stop/interrupt fired within a short span
//! - [`SubmissionGuard`] is the client's single-slot record of the last submission
//! - [`DedupLedger`] is the server's shared, swept record of recent submissions

mod debounce;
mod fingerprint;
mod ledger;

pub use debounce::Debounce;
pub use fingerprint::Fingerprint;
pub use ledger::{
    Admission, DedupLedger, LedgerSweeper, PendingRequestRecord, Rejection, SubmissionGuard,
};

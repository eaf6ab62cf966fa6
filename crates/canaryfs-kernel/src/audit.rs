//! Audit sinks: every request and its outcome, regardless of verdict.

use std::fmt;

use parking_lot::Mutex;

use crate::allowance::Basis;
use crate::request::RequestDescriptor;
use crate::store::StoreError;

/// How one request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The allowance engine said no; the store was not touched.
    Denied(Basis),
    /// Allowed and the store operation succeeded.
    Completed(Basis),
    /// Allowed but the store operation failed.
    Failed { basis: Basis, error: StoreError },
}

impl Outcome {
    /// Returns true if the operation ran and succeeded.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Returns true if the allowance engine refused the call.
    pub fn is_denied(&self) -> bool {
        matches!(self, Outcome::Denied(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Denied(basis) => write!(f, "denied [{basis}]"),
            Outcome::Completed(basis) => write!(f, "ok [{basis}]"),
            Outcome::Failed { basis, error } => write!(f, "error \"{error}\" [{basis}]"),
        }
    }
}

/// Receives one record per request. Fire-and-forget: recording can never fail
/// the filesystem call.
pub trait AuditSink: Send + Sync {
    fn record(&self, request: &RequestDescriptor, outcome: &Outcome);
}

/// Emits one `tracing` event per request under the `canaryfs::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, request: &RequestDescriptor, outcome: &Outcome) {
        let dest = request
            .dest
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        match outcome {
            Outcome::Denied(_) => tracing::warn!(
                target: "canaryfs::audit",
                seq = request.seq,
                op = %request.op,
                path = %request.path.display(),
                dest = %dest,
                outcome = %outcome,
                "request"
            ),
            _ => tracing::info!(
                target: "canaryfs::audit",
                seq = request.seq,
                op = %request.op,
                path = %request.path.display(),
                dest = %dest,
                outcome = %outcome,
                "request"
            ),
        }
    }
}

/// One stored audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub request: RequestDescriptor,
    pub outcome: Outcome,
}

/// Keeps every record in memory, for inspection and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far, in arrival order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Number of records so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, request: &RequestDescriptor, outcome: &Outcome) {
        self.records.lock().push(AuditRecord {
            request: request.clone(),
            outcome: outcome.clone(),
        });
    }
}

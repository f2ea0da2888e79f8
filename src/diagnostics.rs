//! Append-only diagnostics channel.
//!
//! The runtime never throws failures that nobody asked for across thread
//! boundaries. Instead it appends a [`DiagnosticRecord`] here and emits the same
//! information as a `tracing` event. Whatever consumes the records (log shipping,
//! telemetry, a test) lives outside this crate.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::Mutex;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A future faulted and nobody observed it within the grace period.
    UnobservedFault,
    /// A pool or exclusive-context payload panicked.
    PayloadPanic,
    /// A cancellation callback panicked during `trigger` or `register`.
    CancellationCallbackPanic,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::UnobservedFault => "unobserved_fault",
            DiagnosticKind::PayloadPanic => "payload_panic",
            DiagnosticKind::CancellationCallbackPanic => "cancellation_callback_panic",
        };
        f.write_str(name)
    }
}

/// One entry of the diagnostics channel.
#[derive(Debug, Clone)]
pub struct DiagnosticRecord {
    pub timestamp: SystemTime,
    pub kind: DiagnosticKind,
    /// Human-readable context: the panic message, or the faulted future's id.
    pub detail: String,
}

/// A cloneable handle to one diagnostics sink.
///
/// Every runtime reports to the sink it was built with; by default that is the
/// process-wide [`Diagnostics::global`] sink.
#[derive(Clone, Default)]
pub struct Diagnostics {
    records: Arc<Mutex<Vec<DiagnosticRecord>>>,
}

impl Diagnostics {
    /// Creates an empty, private sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide sink.
    pub fn global() -> Diagnostics {
        static GLOBAL: OnceLock<Diagnostics> = OnceLock::new();
        GLOBAL.get_or_init(Diagnostics::new).clone()
    }

    /// Appends a record and mirrors it to `tracing`.
    pub fn report(&self, kind: DiagnosticKind, detail: impl Into<String>) {
        let detail = detail.into();

        match kind {
            DiagnosticKind::UnobservedFault => {
                tracing::warn!(%kind, %detail, "runtime diagnostic");
            }
            DiagnosticKind::PayloadPanic | DiagnosticKind::CancellationCallbackPanic => {
                tracing::error!(%kind, %detail, "runtime diagnostic");
            }
        }

        self.records.lock().push(DiagnosticRecord {
            timestamp: SystemTime::now(),
            kind,
            detail,
        });
    }

    /// Copy of every record appended so far, oldest first.
    pub fn snapshot(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().clone()
    }

    /// Number of records of the given kind.
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_in_order() {
        let diagnostics = Diagnostics::new();
        diagnostics.report(DiagnosticKind::PayloadPanic, "first");
        diagnostics.report(DiagnosticKind::UnobservedFault, "second");

        let records = diagnostics.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].detail, "first");
        assert_eq!(records[1].kind, DiagnosticKind::UnobservedFault);
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[test]
    fn clones_share_the_same_sink() {
        let a = Diagnostics::new();
        let b = a.clone();
        b.report(DiagnosticKind::CancellationCallbackPanic, "boom");
        assert_eq!(a.count(DiagnosticKind::CancellationCallbackPanic), 1);
        assert_eq!(a.count(DiagnosticKind::PayloadPanic), 0);
    }
}

use crate::progress::ProgressTracker;

/// What to do with a job once its dispatched segments have settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Every segment is downloaded.
    Merge,
    /// Every segment settled and some of them failed permanently.
    Fail { failed: u64, message: String },
    /// Some segments are still pending or in flight.
    Wait,
}

/// Decide between merging and failing from the segment counters.
///
/// Pure and idempotent: the same counters always yield the same decision.
pub fn detect(total: u64, completed: u64, failed: u64) -> Completion {
    if total > 0 && completed == total {
        Completion::Merge
    } else if failed > 0 && completed + failed == total {
        Completion::Fail {
            failed,
            message: format!("Failed to download {failed} segments"),
        }
    } else {
        Completion::Wait
    }
}

impl From<&ProgressTracker> for Completion {
    fn from(tracker: &ProgressTracker) -> Self {
        detect(tracker.total(), tracker.completed(), tracker.failed())
    }
}

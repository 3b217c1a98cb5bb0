// Structured reporting of cleanup misuse
//
// Misuse never fails a task. Each occurrence is emitted as a `tracing` warning
// and, when recording is enabled, kept in memory so hosts and tests can
// inspect it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::task::TaskId;

/// A non-fatal misuse observed while driving a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A frame ended by `terminal` still had deferred operations.
    SkippedDefers {
        task: TaskId,
        frame: String,
        count: usize,
    },
    /// A frame asked to return kept suspending instead of finishing.
    UnfinishedTermination { task: TaskId, frame: String },
    /// A frame asked to return failed while cleaning up.
    FailedTermination {
        task: TaskId,
        frame: String,
        error: String,
    },
}

/// Diagnostic sink shared by every task of an engine
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    recorded: Option<Arc<Mutex<Vec<Diagnostic>>>>,
}

impl Diagnostics {
    /// Sink that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that logs and keeps every diagnostic.
    pub fn recording() -> Self {
        Self {
            recorded: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::SkippedDefers { task, frame, count } => {
                warn!(%task, %frame, count, "terminate: deferred operations are not executed")
            }
            Diagnostic::UnfinishedTermination { task, frame } => {
                warn!(%task, %frame, "terminate: generator did not finish, terminal should not be used inside cleanup code")
            }
            Diagnostic::FailedTermination { task, frame, error } => {
                warn!(%task, %frame, %error, "terminate: generator did not terminate properly")
            }
        }
        if let Some(recorded) = &self.recorded {
            recorded.lock().push(diagnostic);
        }
    }

    /// Snapshot of recorded diagnostics; empty when recording is off.
    pub fn recorded(&self) -> Vec<Diagnostic> {
        self.recorded
            .as_ref()
            .map(|recorded| recorded.lock().clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Some(recorded) = &self.recorded {
            recorded.lock().clear();
        }
    }
}

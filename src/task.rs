// Tasks: independently progressing units wrapping one frame stack
//
// A task settles exactly once. Cancellation is cooperative: `request_cancel`
// marks every live frame synchronously and the driver forces each marked
// frame to return the next time it would have been resumed. Frames running a
// deferred operation are shielded and always run to completion.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, debug_span, Instrument};
use uuid::Uuid;

use crate::context::Context;
use crate::engine::Environment;
use crate::error::{Error, Result};
use crate::generator::Yielded;
use crate::stack::Stack;
use crate::value::Value;

/// Unique identifier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cancellation marker of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cancellation {
    None,
    Pending,
    Done,
    Shielded,
}

#[derive(Debug, Default)]
struct TaskState {
    settled: bool,
    canceled: bool,
    /// One marker per live frame, bottom of the stack first.
    marks: Vec<Cancellation>,
}

/// State shared between a task's driver and its handles
#[derive(Debug)]
pub(crate) struct TaskShared {
    id: TaskId,
    state: Mutex<TaskState>,
}

impl TaskShared {
    fn new() -> Self {
        Self {
            id: TaskId::new(),
            state: Mutex::new(TaskState::default()),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the driver may start; false when cancelled before the first step.
    pub(crate) fn begin(&self) -> bool {
        !self.state.lock().canceled
    }

    /// Register a frame pushed on top of the stack. It starts out pending when
    /// the frame below it has not yet been forced to return, or when it is the
    /// first frame of a task cancelled before anything was pushed. Frames above
    /// a shielded frame are shielded too.
    pub(crate) fn push_mark(&self, shielded: bool) {
        let mut state = self.state.lock();
        let mark = match state.marks.last() {
            _ if shielded => Cancellation::Shielded,
            Some(Cancellation::Shielded) => Cancellation::Shielded,
            Some(Cancellation::Pending) => Cancellation::Pending,
            None if state.canceled => Cancellation::Pending,
            _ => Cancellation::None,
        };
        state.marks.push(mark);
    }

    pub(crate) fn pop_mark(&self) {
        self.state.lock().marks.pop();
    }

    /// Consume a pending cancellation of the frame at `depth`.
    pub(crate) fn begin_forced_return(&self, depth: usize) -> bool {
        let mut state = self.state.lock();
        match state.marks.get_mut(depth) {
            Some(mark @ Cancellation::Pending) => {
                *mark = Cancellation::Done;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_cancel_pending(&self, depth: usize) -> bool {
        self.state.lock().marks.get(depth) == Some(&Cancellation::Pending)
    }

    /// Mark every live frame. Returns false when the task already settled or
    /// a cancellation was already requested.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.settled || state.canceled {
            return false;
        }
        state.canceled = true;
        for mark in state.marks.iter_mut() {
            if *mark == Cancellation::None {
                *mark = Cancellation::Pending;
            }
        }
        true
    }

    /// Record settlement; returns whether a cancellation was requested.
    pub(crate) fn settle(&self) -> bool {
        let mut state = self.state.lock();
        state.settled = true;
        state.canceled
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.state.lock().settled
    }
}

/// A task ready to be driven, either inline or on the tokio runtime
pub(crate) struct Task {
    stack: Stack,
    root: Yielded,
}

impl Task {
    pub(crate) fn new(env: Arc<Environment>, ctx: Context, root: Yielded) -> Self {
        Self {
            stack: Stack::new(env, ctx, Arc::new(TaskShared::new())),
            root,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.stack.shared().id()
    }

    /// Drive the task to settlement on the current future.
    pub(crate) async fn run(self) -> Result<Value> {
        let span = debug_span!("task", id = %self.id());
        self.stack.run(self.root).instrument(span).await
    }

    /// Drive the task in the background on the tokio runtime.
    pub(crate) fn spawn(self) -> TaskHandle {
        let shared = Arc::clone(self.stack.shared());
        let settle_on_panic = Arc::clone(&shared);
        let join = tokio::spawn(async move {
            match AssertUnwindSafe(self.run()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    settle_on_panic.settle();
                    Err(Error::Panicked(panic_message(panic.as_ref())))
                }
            }
        });
        let result = async move {
            join.await
                .unwrap_or_else(|error| Err(Error::Panicked(error.to_string())))
        }
        .boxed()
        .shared();
        TaskHandle { shared, result }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handle onto a running task, as returned by `fork`
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    result: Shared<BoxFuture<'static, Result<Value>>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id()
    }

    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// Mark every live frame of the task for cancellation without waiting.
    ///
    /// Returns whether this call initiated the cancellation. Tasks forked by
    /// this one are not affected.
    pub fn request_cancel(&self) -> bool {
        let initiated = self.shared.request_cancel();
        if initiated {
            debug!(task = %self.id(), "cancellation requested");
        }
        initiated
    }

    /// Cancel the task and wait until it has settled.
    ///
    /// A no-op on a settled task. Fails only when the task settled with an
    /// error other than the cancellation itself.
    pub async fn cancel(&self) -> Result<()> {
        if self.is_settled() {
            return Ok(());
        }
        self.request_cancel();
        match self.result().await {
            Ok(_) | Err(Error::Cancelled) => Ok(()),
            Err(error) => Err(Error::CancelFailed(Box::new(error))),
        }
    }

    /// The settled result; can be awaited any number of times.
    pub fn result(&self) -> impl std::future::Future<Output = Result<Value>> + Send + 'static {
        self.result.clone()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("settled", &self.is_settled())
            .finish()
    }
}

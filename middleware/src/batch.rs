// Call batching
//
// Calls to a batched function that share a batch key within a time window are
// coalesced into one call of the underlying function. The underlying function
// receives one argument per coalesced call, each a list of that call's
// arguments, and must return a list with one result per call.
//
// Batching is composed from core operations only: each call re-arms a forked
// `delay` timer for its key, cancelling the previous one, and the timer that
// finally fires performs an `execute_batch` operation which runs the batch.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::Shared;
use futures::FutureExt;
use ladle::operation::kind;
use ladle::{
    call, custom, fork, Args, BoxGenerator, Context, Coroutine, Error, GeneratorFn, Middleware,
    Operation, Plugin, Registration, Result, TaskHandle, TaskId, Value,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::delay::delay;

/// Operation kind performed by a fired batch timer.
pub const EXECUTE_BATCH: &str = "execute_batch";

/// Batching settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Window, re-armed by every call, before a batch is executed.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { timeout_ms: 0 }
    }
}

impl BatchConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

type KeyFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Marks a generator function as batchable.
struct BatchSpec {
    func: GeneratorFn,
    key: Arc<KeyFn>,
}

/// Wrap `func` so that concurrent calls are coalesced into a single batch.
pub fn batched(func: GeneratorFn) -> GeneratorFn {
    batched_by(func, |_args| Value::Bool(true))
}

/// Like [`batched`], grouping calls by `key`. Calls whose key is falsy run on
/// their own, immediately.
pub fn batched_by<K>(func: GeneratorFn, key: K) -> GeneratorFn
where
    K: Fn(&[Value]) -> Value + Send + Sync + 'static,
{
    let underlying = func.clone();
    GeneratorFn::new(func.name().to_owned(), move |args| {
        Ok(standalone(underlying.clone(), args))
    })
    .with_extension(BatchSpec {
        func,
        key: Arc::new(key),
    })
}

/// Run one call through the underlying function as a batch of one.
fn standalone(func: GeneratorFn, args: Args) -> BoxGenerator {
    Coroutine::new("batch_standalone", move |co| async move {
        let results = co.yield_(call(&func, vec![Value::from(args)])).await?;
        select(results, 0)
    })
    .boxed()
}

fn select(results: Value, index: usize) -> Result<Value> {
    Ok(results
        .into_list()?
        .into_iter()
        .nth(index)
        .unwrap_or_default())
}

/// Structural form of a batch key. Keys of different types never match, even
/// when they print alike; opaque keys match only the same allocation.
#[derive(Debug, Clone)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    List(Vec<KeyPart>),
    Task(TaskId),
    Error(Error),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(i) => KeyPart::Int(*i),
            Value::Float(x) => KeyPart::Float(x.to_bits()),
            Value::Str(s) => KeyPart::Str(Arc::clone(s)),
            Value::List(items) => KeyPart::List(items.iter().map(KeyPart::from).collect()),
            Value::Task(handle) => KeyPart::Task(handle.id()),
            Value::Error(error) => KeyPart::Error(error.clone()),
            Value::Opaque(payload) => KeyPart::Opaque(Arc::clone(payload)),
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyPart::Null, KeyPart::Null) => true,
            (KeyPart::Bool(a), KeyPart::Bool(b)) => a == b,
            (KeyPart::Int(a), KeyPart::Int(b)) => a == b,
            (KeyPart::Float(a), KeyPart::Float(b)) => a == b,
            (KeyPart::Str(a), KeyPart::Str(b)) => a == b,
            (KeyPart::List(a), KeyPart::List(b)) => a == b,
            (KeyPart::Task(a), KeyPart::Task(b)) => a == b,
            (KeyPart::Error(a), KeyPart::Error(b)) => a.same(b),
            (KeyPart::Opaque(a), KeyPart::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for KeyPart {}

impl Hash for KeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            KeyPart::Null => {}
            KeyPart::Bool(b) => b.hash(state),
            KeyPart::Int(i) => i.hash(state),
            KeyPart::Float(bits) => bits.hash(state),
            KeyPart::Str(s) => s.hash(state),
            KeyPart::List(items) => items.hash(state),
            KeyPart::Task(id) => id.hash(state),
            KeyPart::Error(error) => error.to_string().hash(state),
            KeyPart::Opaque(payload) => (Arc::as_ptr(payload) as *const () as usize).hash(state),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    func: usize,
    key: KeyPart,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:?}", self.func, self.key)
    }
}

type BatchResult = Shared<oneshot::Receiver<Result<Value>>>;

struct PendingBatch {
    generation: u64,
    func: GeneratorFn,
    args: Vec<Value>,
    sender: oneshot::Sender<Result<Value>>,
    result: BatchResult,
    timer: Option<TaskHandle>,
}

/// Pending batches of one task tree, stored in its context.
#[derive(Default)]
struct Batches {
    state: Mutex<BatchesState>,
}

#[derive(Default)]
struct BatchesState {
    generation: u64,
    pending: HashMap<BatchKey, PendingBatch>,
}

impl Batches {
    /// Add a call to the batch for `key`, opening one if needed. Returns the
    /// batch generation, the call's position and the shared batch result.
    fn enqueue(&self, key: &BatchKey, func: &GeneratorFn, args: Args) -> (u64, usize, BatchResult) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let entry = state.pending.entry(key.clone()).or_insert_with(|| {
            state.generation += 1;
            let (sender, receiver) = oneshot::channel();
            PendingBatch {
                generation: state.generation,
                func: func.clone(),
                args: Vec::new(),
                sender,
                result: receiver.shared(),
                timer: None,
            }
        });
        entry.args.push(Value::from(args));
        (entry.generation, entry.args.len() - 1, entry.result.clone())
    }

    /// Install `timer` as the flush timer of the batch, cancelling the timer it
    /// replaces. A timer for a batch that already ran is cancelled instead.
    fn arm(&self, key: &BatchKey, generation: u64, timer: TaskHandle) {
        let replaced = {
            let mut state = self.state.lock();
            match state.pending.get_mut(key) {
                Some(entry) if entry.generation == generation => entry.timer.replace(timer),
                _ => Some(timer),
            }
        };
        if let Some(replaced) = replaced {
            trace!(%key, timer = %replaced.id(), "cancelling superseded batch timer");
            replaced.request_cancel();
        }
    }

    fn take(&self, key: &BatchKey) -> Option<PendingBatch> {
        self.state.lock().pending.remove(key)
    }
}

/// `call` middleware coalescing calls to functions built by [`batched`]
pub struct BatchMiddleware {
    timeout: Duration,
}

impl BatchMiddleware {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            timeout: config.timeout(),
        }
    }
}

impl Middleware for BatchMiddleware {
    fn filter(&self, operation: &Operation, _ctx: &Context) -> bool {
        operation
            .as_call()
            .is_some_and(|call| call.func.extension::<BatchSpec>().is_some())
    }

    fn handle(&self, operation: Operation, ctx: &Context) -> Result<BoxGenerator> {
        let call = match operation {
            Operation::Call(call) => call,
            other => return Err(Error::UnrecognizedOperation(other.kind().to_owned())),
        };
        let spec = call.func.extension::<BatchSpec>().ok_or_else(|| Error::Usage {
            operation: "batch",
            message: format!("{} is not a batched function", call.func.name()),
        })?;

        let key = (spec.key)(&call.args);
        if !key.is_truthy() {
            trace!(func = spec.func.name(), "falsy batch key, running standalone");
            return Ok(standalone(spec.func.clone(), call.args));
        }

        let key = BatchKey {
            func: spec.func.identity(),
            key: KeyPart::from(&key),
        };
        let batches = ctx.get_or_insert_with(Batches::default);
        let (generation, index, result) = batches.enqueue(&key, &spec.func, call.args);
        debug!(%key, index, "call added to batch");

        let timeout = self.timeout;
        Ok(Coroutine::new("batch", move |co| async move {
            let flush = custom(EXECUTE_BATCH, Value::opaque(key.clone()));
            let timer = co.yield_(fork(delay(timeout, flush))).await?.into_task()?;
            batches.arm(&key, generation, timer);

            let results = result.await.unwrap_or(Err(Error::Cancelled))?;
            select(results, index)
        })
        .boxed())
    }
}

/// Runs the batch a fired timer points at
pub struct ExecuteBatch;

impl Middleware for ExecuteBatch {
    fn filter(&self, operation: &Operation, _ctx: &Context) -> bool {
        operation
            .as_custom()
            .is_some_and(|custom| custom.payload.downcast_ref::<BatchKey>().is_some())
    }

    fn handle(&self, operation: Operation, ctx: &Context) -> Result<BoxGenerator> {
        let key = operation
            .as_custom()
            .and_then(|custom| custom.payload.downcast_ref::<BatchKey>())
            .cloned()
            .ok_or_else(|| Error::UnrecognizedOperation(operation.kind().to_owned()))?;
        let batch = ctx.get::<Batches>().and_then(|batches| batches.take(&key));

        Ok(Coroutine::new(EXECUTE_BATCH, move |co| async move {
            let Some(batch) = batch else {
                trace!(%key, "batch already executed");
                return Ok(Value::Null);
            };
            debug!(%key, size = batch.args.len(), "executing batch");
            let result = co.yield_(call(&batch.func, batch.args)).await;
            // Callers that gave up waiting dropped their receivers.
            let _ = batch.sender.send(result.clone());
            result
        })
        .boxed())
    }
}

/// Registers [`BatchMiddleware`] and [`ExecuteBatch`].
#[derive(Debug, Clone, Default)]
pub struct BatchPlugin {
    config: BatchConfig,
}

impl BatchPlugin {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }
}

impl Plugin for BatchPlugin {
    fn registrations(&self) -> Vec<Registration> {
        vec![
            Registration::new(kind::CALL, BatchMiddleware::new(&self.config)),
            Registration::new(EXECUTE_BATCH, ExecuteBatch),
        ]
    }
}

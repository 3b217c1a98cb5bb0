//! Suspendable computations driven by the frame stack.
//!
//! The scheduler only ever talks to a generator through [`Generator::resume`],
//! which covers the three ways of re-entering a suspended computation: resume
//! with a value, resume with an injected error, and force an early return so
//! that the computation runs its cleanup path.
//!
//! [`Coroutine`] adapts an `async` block to that interface; most generators are
//! written as coroutines:
//!
//! ```
//! use ladle::{call, Coroutine, GeneratorFn, Value};
//!
//! let double = GeneratorFn::coroutine("double", |_co, args| async move {
//!     let n = args.first().and_then(Value::as_int).unwrap_or_default();
//!     Ok(Value::from(n * 2))
//! });
//!
//! let _root = Coroutine::new("root", move |co| async move {
//!     let four = co.yield_(call(&double, vec![Value::from(2)])).await?;
//!     Ok(four)
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use futures::future::poll_fn;
use parking_lot::Mutex;

use crate::context::TypeMap;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::value::Value;

/// Arguments of a call
pub type Args = Vec<Value>;

/// Owned, type-erased generator
pub type BoxGenerator = Box<dyn Generator>;

/// How a suspended generator is re-entered
#[derive(Debug)]
pub enum Resume {
    /// Continue with the result of the last yielded operation.
    Next(Value),
    /// Raise an error at the suspension point.
    Throw(Error),
    /// Complete early, running cleanup without feeding a value.
    Return,
}

/// Outcome of one resumption
#[derive(Debug)]
pub enum GeneratorState {
    Yielded(Yielded),
    Complete(Result<Value>),
}

/// What a generator may hand to the engine when it suspends
pub enum Yielded {
    Operation(Operation),
    /// A bare generator, delegated to directly or through `execute` middleware.
    Generator(BoxGenerator),
}

impl fmt::Debug for Yielded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Yielded::Operation(operation) => f.debug_tuple("Operation").field(operation).finish(),
            Yielded::Generator(generator) => {
                f.debug_tuple("Generator").field(&generator.name()).finish()
            }
        }
    }
}

impl From<Operation> for Yielded {
    fn from(operation: Operation) -> Self {
        Yielded::Operation(operation)
    }
}

impl From<BoxGenerator> for Yielded {
    fn from(generator: BoxGenerator) -> Self {
        Yielded::Generator(generator)
    }
}

impl From<Coroutine> for BoxGenerator {
    fn from(coroutine: Coroutine) -> Self {
        Box::new(coroutine)
    }
}

impl From<Coroutine> for Yielded {
    fn from(coroutine: Coroutine) -> Self {
        Yielded::Generator(Box::new(coroutine))
    }
}

/// A resumable sequential computation
#[async_trait]
pub trait Generator: Send {
    /// Re-enter the generator and run it to its next suspension point or to
    /// completion. Resuming a completed generator completes again immediately.
    async fn resume(&mut self, input: Resume) -> GeneratorState;

    /// Name used for frames in logs and diagnostics.
    fn name(&self) -> &str {
        "<anonymous generator>"
    }
}

type Body = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Values crossing the suspension point of a coroutine.
#[derive(Default)]
struct Exchange {
    yielded: Option<Yielded>,
    input: Option<Resume>,
}

/// Handle a coroutine body uses to suspend itself
#[derive(Clone)]
pub struct Co {
    exchange: Arc<Mutex<Exchange>>,
}

impl Co {
    /// Suspend the coroutine on `yielded`.
    ///
    /// Resolves to the value the engine resumes with, or to the injected
    /// error. A forced return resolves to [`Error::Interrupted`]; propagating
    /// it with `?` completes the coroutine cleanly.
    pub fn yield_(&self, yielded: impl Into<Yielded>) -> Suspend {
        Suspend {
            exchange: Arc::clone(&self.exchange),
            pending: Some(yielded.into()),
        }
    }
}

/// Future returned by [`Co::yield_`]
#[must_use = "a coroutine only suspends when the yield is awaited"]
pub struct Suspend {
    exchange: Arc<Mutex<Exchange>>,
    pending: Option<Yielded>,
}

impl Future for Suspend {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut exchange = this.exchange.lock();

        // First poll hands the operation over; the driver picks it up as soon
        // as the body reports pending.
        if let Some(yielded) = this.pending.take() {
            exchange.yielded = Some(yielded);
            return Poll::Pending;
        }

        match exchange.input.take() {
            Some(Resume::Next(value)) => Poll::Ready(Ok(value)),
            Some(Resume::Throw(error)) => Poll::Ready(Err(error)),
            Some(Resume::Return) => Poll::Ready(Err(Error::Interrupted)),
            None => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoroutineState {
    Created,
    Suspended,
    Finished,
}

/// Generator backed by an `async` body
pub struct Coroutine {
    name: Arc<str>,
    body: Option<Body>,
    exchange: Arc<Mutex<Exchange>>,
    state: CoroutineState,
}

impl Coroutine {
    /// Build a coroutine. The body does not run until the first resumption.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let exchange = Arc::new(Mutex::new(Exchange::default()));
        let co = Co {
            exchange: Arc::clone(&exchange),
        };
        Self {
            name: name.into(),
            body: Some(Box::pin(body(co))),
            exchange,
            state: CoroutineState::Created,
        }
    }

    /// Box the coroutine for use where a [`BoxGenerator`] is expected.
    pub fn boxed(self) -> BoxGenerator {
        Box::new(self)
    }

    fn finish(&mut self, result: Result<Value>) -> GeneratorState {
        self.state = CoroutineState::Finished;
        self.body = None;
        GeneratorState::Complete(result)
    }
}

#[async_trait]
impl Generator for Coroutine {
    async fn resume(&mut self, input: Resume) -> GeneratorState {
        match (self.state, input) {
            (CoroutineState::Finished, Resume::Throw(error)) => return self.finish(Err(error)),
            (CoroutineState::Finished, _) => return self.finish(Ok(Value::Null)),
            // A body that never started has no cleanup to run.
            (CoroutineState::Created, Resume::Return) => return self.finish(Ok(Value::Null)),
            (CoroutineState::Created, Resume::Throw(error)) => return self.finish(Err(error)),
            // The value of the first resumption has nowhere to go.
            (CoroutineState::Created, Resume::Next(_)) => {}
            (CoroutineState::Suspended, input) => self.exchange.lock().input = Some(input),
        }
        self.state = CoroutineState::Suspended;

        let Some(body) = self.body.as_mut() else {
            return self.finish(Ok(Value::Null));
        };
        let exchange = Arc::clone(&self.exchange);
        let step = poll_fn(|cx| match body.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(GeneratorState::Complete(result)),
            Poll::Pending => match exchange.lock().yielded.take() {
                Some(yielded) => Poll::Ready(GeneratorState::Yielded(yielded)),
                // Genuinely waiting on I/O or a timer; the body registered a waker.
                None => Poll::Pending,
            },
        })
        .await;

        match step {
            GeneratorState::Complete(result) => self.finish(result),
            yielded => yielded,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type Invoke = dyn Fn(Args) -> Result<BoxGenerator> + Send + Sync;

/// Named constructor of generators, the target of a `call` operation
#[derive(Clone)]
pub struct GeneratorFn {
    name: Arc<str>,
    invoke: Arc<Invoke>,
    extensions: TypeMap,
}

impl GeneratorFn {
    pub fn new<F>(name: impl Into<Arc<str>>, invoke: F) -> Self
    where
        F: Fn(Args) -> Result<BoxGenerator> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            invoke: Arc::new(invoke),
            extensions: TypeMap::new(),
        }
    }

    /// Generator function whose generators are coroutines named after it.
    pub fn coroutine<F, Fut>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(Co, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name: Arc<str> = name.into();
        let frame_name = Arc::clone(&name);
        Self::new(name, move |args| {
            Ok(Coroutine::new(Arc::clone(&frame_name), |co| body(co, args)).boxed())
        })
    }

    /// Construct a generator for `args`.
    pub fn call(&self, args: Args) -> Result<BoxGenerator> {
        (self.invoke)(args)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach typed metadata that middleware can recognize the function by.
    pub fn with_extension<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.extensions.get::<T>()
    }

    /// Whether both handles refer to the same underlying function.
    pub fn same(&self, other: &GeneratorFn) -> bool {
        Arc::ptr_eq(&self.invoke, &other.invoke)
    }

    /// Stable identity of the underlying function for keyed lookups.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.invoke) as *const () as usize
    }
}

impl fmt::Debug for GeneratorFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorFn")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{custom, Operation};

    fn block_on<F: Future>(future: F) -> F::Output {
        futures::executor::block_on(future)
    }

    fn expect_yield(state: GeneratorState) -> Operation {
        match state {
            GeneratorState::Yielded(Yielded::Operation(operation)) => operation,
            other => panic!("expected an operation, got {other:?}"),
        }
    }

    #[test]
    fn resumes_with_values_until_completion() {
        let mut coroutine = Coroutine::new("adder", |co| async move {
            let a = co.yield_(custom("read", Value::Null)).await?;
            let b = co.yield_(custom("read", Value::Null)).await?;
            Ok(Value::from(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0)))
        });

        block_on(async {
            assert_eq!(expect_yield(coroutine.resume(Resume::Next(Value::Null)).await).kind(), "read");
            expect_yield(coroutine.resume(Resume::Next(Value::from(2))).await);
            match coroutine.resume(Resume::Next(Value::from(3))).await {
                GeneratorState::Complete(Ok(value)) => assert_eq!(value, Value::from(5)),
                other => panic!("unexpected state {other:?}"),
            }
        });
    }

    #[test]
    fn thrown_errors_can_be_caught() {
        let mut coroutine = Coroutine::new("catcher", |co| async move {
            match co.yield_(custom("fail", Value::Null)).await {
                Ok(_) => Ok(Value::from("no error")),
                Err(error) => Ok(Value::from(error.to_string())),
            }
        });

        block_on(async {
            expect_yield(coroutine.resume(Resume::Next(Value::Null)).await);
            match coroutine.resume(Resume::Throw(Error::msg("boom"))).await {
                GeneratorState::Complete(Ok(value)) => assert_eq!(value, Value::from("boom")),
                other => panic!("unexpected state {other:?}"),
            }
        });
    }

    #[test]
    fn forced_return_runs_cleanup() {
        let cleaned = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&cleaned);
        let mut coroutine = Coroutine::new("guarded", move |co| async move {
            let outcome = co.yield_(custom("wait", Value::Null)).await;
            *flag.lock() = true;
            outcome
        });

        block_on(async {
            expect_yield(coroutine.resume(Resume::Next(Value::Null)).await);
            match coroutine.resume(Resume::Return).await {
                GeneratorState::Complete(Err(Error::Interrupted)) => {}
                other => panic!("unexpected state {other:?}"),
            }
        });
        assert!(*cleaned.lock());
    }

    #[test]
    fn forced_return_before_start_skips_the_body() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let mut coroutine = Coroutine::new("lazy", move |_co| async move {
            *flag.lock() = true;
            Ok(Value::Null)
        });

        block_on(async {
            assert!(matches!(
                coroutine.resume(Resume::Return).await,
                GeneratorState::Complete(Ok(Value::Null))
            ));
        });
        assert!(!*ran.lock());
    }

    #[test]
    fn generator_fn_extensions() {
        struct Tag(&'static str);

        let func = GeneratorFn::coroutine("tagged", |_co, _args| async { Ok(Value::Null) })
            .with_extension(Tag("batch"));
        assert_eq!(func.extension::<Tag>().map(|tag| tag.0), Some("batch"));
        assert!(func.extension::<u8>().is_none());
        assert!(func.same(&func.clone()));
        assert_eq!(func.call(vec![]).map(|g| g.name().to_owned()).ok().as_deref(), Some("tagged"));
    }
}

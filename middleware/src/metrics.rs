// Metrics collection middleware

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ladle::{next, BoxGenerator, Context, Coroutine, Error, Middleware, Operation, Result};

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Counts the operations passing through it, delegating with `next`
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read side of the counters; stays valid after the middleware has been
    /// moved into an engine.
    pub fn counters(&self) -> MetricsHandle {
        MetricsHandle {
            counters: Arc::clone(&self.counters),
        }
    }
}

impl Middleware for Metrics {
    fn handle(&self, operation: Operation, _ctx: &Context) -> Result<BoxGenerator> {
        let counters = Arc::clone(&self.counters);
        counters.handled.fetch_add(1, Ordering::Relaxed);
        Ok(Coroutine::new("metrics", move |co| async move {
            let result = co.yield_(next(operation)).await;
            let counter = match &result {
                Ok(_) => &counters.succeeded,
                Err(Error::Interrupted | Error::Cancelled) => &counters.cancelled,
                Err(_) => &counters.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            result
        })
        .boxed())
    }
}

#[derive(Debug, Clone)]
pub struct MetricsHandle {
    counters: Arc<Counters>,
}

impl MetricsHandle {
    pub fn handled(&self) -> u64 {
        self.counters.handled.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.counters.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.counters.cancelled.load(Ordering::Relaxed)
    }
}

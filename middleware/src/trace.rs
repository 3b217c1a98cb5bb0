// Tracing middleware that logs every operation of the kinds it is registered
// for, then delegates with `next`.
//
// Register it only for kinds whose effect does not depend on the yielding
// frame: `defer`, `recover` and `terminal` act on the current frame, which
// inside this middleware is its own handler frame.

use std::time::Instant;

use ladle::{next, BoxGenerator, Context, Coroutine, Middleware, Operation, Result};
use tracing::{debug, trace, warn};

pub struct Trace {
    prefix: String,
}

impl Trace {
    pub fn new() -> Self {
        Self::with_prefix("ladle")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for Trace {
    fn handle(&self, operation: Operation, _ctx: &Context) -> Result<BoxGenerator> {
        let prefix = self.prefix.clone();
        let kind = operation.kind().to_owned();
        Ok(Coroutine::new("trace", move |co| async move {
            let start = Instant::now();
            trace!(%prefix, %kind, "operation: start");
            let result = co.yield_(next(operation)).await;
            let duration = start.elapsed();
            match &result {
                Ok(_) => debug!(%prefix, %kind, ?duration, "operation: success"),
                Err(e) => warn!(%prefix, %kind, ?duration, error = %e, "operation: failed"),
            }
            result
        })
        .boxed())
    }
}

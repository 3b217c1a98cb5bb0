//! Timer combinator built on `execute`.

use std::time::Duration;

use ladle::{execute, Coroutine, Operation};

/// Operation that waits for `duration` on the tokio timer, then performs
/// `operation` and resumes with its value.
///
/// Forking a delayed operation and cancelling the resulting task before the
/// timer fires means `operation` is never performed.
pub fn delay(duration: Duration, operation: Operation) -> Operation {
    execute(Coroutine::new("delay", move |co| async move {
        tokio::time::sleep(duration).await;
        co.yield_(operation).await
    }))
}

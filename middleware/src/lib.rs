//! Middleware for the ladle effect engine
//!
//! Everything here is built from the engine's public operations; nothing
//! needs access to its internals.
//!
//! - [`batch`]: coalesce concurrent calls sharing a key into one call
//! - [`delay`]: perform an operation after a timer
//! - [`Trace`] and [`Metrics`]: observe operations of selected kinds

pub mod batch;
pub mod delay;
pub mod metrics;
pub mod trace;

pub use batch::{batched, batched_by, BatchConfig, BatchMiddleware, BatchPlugin, ExecuteBatch};
pub use delay::delay;
pub use metrics::{Metrics, MetricsHandle};
pub use trace::Trace;

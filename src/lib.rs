//! Ladle: an effect-execution engine
//!
//! Generators describe what they want done by yielding [`Operation`]s. The
//! engine interprets each one through a configurable chain of middleware,
//! falling back to built-in semantics for the core kinds:
//!
//! - `call` / `execute`: run a child generator and resume with its result
//! - `fork`: start an independent task and resume with its [`TaskHandle`]
//! - `defer`: register cleanup that runs when the current frame completes
//! - `recover`: turn the error of a failed child into a value
//! - `terminal`: replace the current frame with another operation
//! - `start`: dispatch an operation as if freshly yielded
//!
//! Tasks can be cancelled cooperatively; every frame still runs its deferred
//! operations exactly once.

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod generator;
pub mod middleware;
pub mod operation;
pub mod plugin;
pub mod task;
pub mod value;

mod stack;

pub use config::EngineConfig;
pub use context::{Context, TypeMap};
pub use diagnostics::{Diagnostic, Diagnostics};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use generator::{
    Args, BoxGenerator, Co, Coroutine, Generator, GeneratorFn, GeneratorState, Resume, Suspend,
    Yielded,
};
pub use middleware::{FnMiddleware, Handlers, Middleware, Registration, Registry};
pub use operation::{
    call, custom, defer, execute, fork, next, recover, start, terminal, Operation,
};
pub use plugin::{Plugin, TaskListener};
pub use task::{TaskHandle, TaskId};
pub use value::Value;

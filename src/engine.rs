//! The engine: middleware configuration plus entry points that run root tasks.
//!
//! ```no_run
//! use ladle::{Engine, GeneratorFn, Value};
//!
//! # async fn run() -> ladle::Result<()> {
//! let hello = GeneratorFn::coroutine("hello", |_co, _args| async { Ok(Value::from("hello")) });
//! let engine = Engine::builder().build();
//! assert_eq!(engine.call(&hello, vec![]).await?, Value::from("hello"));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::generator::{Args, GeneratorFn, Yielded};
use crate::middleware::{Middleware, Registration, Registry, RegistryBuilder};
use crate::operation::{self, Operation};
use crate::plugin::{Plugin, TaskListener};
use crate::task::{Task, TaskHandle};
use crate::value::Value;

/// What every task of one engine shares, forks included.
pub(crate) struct Environment {
    pub(crate) registry: Registry,
    pub(crate) diagnostics: Diagnostics,
}

/// Runs generators against a fixed middleware configuration
#[derive(Clone)]
pub struct Engine {
    env: Arc<Environment>,
    listeners: Arc<[Arc<dyn TaskListener>]>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Call `func` with `args` as a root task.
    pub async fn call(&self, func: &GeneratorFn, args: impl Into<Args>) -> Result<Value> {
        self.start(operation::call(func, args)).await
    }

    /// Run an already constructed generator as a root task.
    pub async fn execute(&self, generator: impl Into<Yielded>) -> Result<Value> {
        self.start_with(Context::new(), generator).await
    }

    pub async fn start(&self, root: Operation) -> Result<Value> {
        self.start_with(Context::new(), root).await
    }

    /// Run a root task with a caller-supplied context, shared with its forks.
    pub async fn start_with(&self, ctx: Context, root: impl Into<Yielded>) -> Result<Value> {
        let task = Task::new(Arc::clone(&self.env), ctx.clone(), root.into());
        let span = info_span!("root_task", id = %task.id());
        self.run_root(task, &ctx).instrument(span).await
    }

    /// Run a root task in the background. No lifecycle hooks are invoked.
    pub fn spawn(&self, root: impl Into<Yielded>) -> TaskHandle {
        self.spawn_with(Context::new(), root)
    }

    pub fn spawn_with(&self, ctx: Context, root: impl Into<Yielded>) -> TaskHandle {
        Task::new(Arc::clone(&self.env), ctx, root.into()).spawn()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.env.diagnostics
    }

    pub fn registry(&self) -> &Registry {
        &self.env.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn run_root(&self, task: Task, ctx: &Context) -> Result<Value> {
        let mut result = async {
            for listener in self.listeners.iter() {
                listener.initialize(ctx).await?;
            }
            task.run().await
        }
        .await;

        if let Ok(value) = &result {
            if let Err(error) = self.complete(value).await {
                result = Err(error);
            }
        }
        if let Err(error) = &result {
            for listener in self.listeners.iter() {
                if let Err(hook) = listener.error(error).await {
                    warn!(%hook, %error, "error hook failed");
                }
            }
        }
        for listener in self.listeners.iter() {
            if let Err(hook) = listener.finalize(result.as_ref().err()).await {
                warn!(%hook, "finalize hook failed");
            }
        }
        result
    }

    async fn complete(&self, value: &Value) -> Result<()> {
        for listener in self.listeners.iter() {
            listener.pre_complete(value).await?;
        }
        for listener in self.listeners.iter() {
            listener.complete(value).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.env.registry)
            .field("listeners", &self.listeners.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    registry: RegistryBuilder,
    listeners: Vec<Arc<dyn TaskListener>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Register `middleware` for operations of `kind`, after any already
    /// registered for it.
    pub fn middleware(self, kind: impl Into<String>, middleware: impl Middleware + 'static) -> Self {
        self.registration(Registration::new(kind, middleware))
    }

    pub fn registration(mut self, registration: Registration) -> Self {
        self.registry.register(registration);
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        for registration in plugin.registrations() {
            self.registry.register(registration);
        }
        if let Some(listener) = plugin.listener() {
            self.listeners.push(listener);
        }
        self
    }

    pub fn listener(mut self, listener: impl TaskListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let diagnostics = if self.config.record_diagnostics {
            Diagnostics::recording()
        } else {
            Diagnostics::new()
        };
        Engine {
            env: Arc::new(Environment {
                registry: self.registry.build(),
                diagnostics,
            }),
            listeners: self.listeners.into(),
            config: self.config,
        }
    }
}

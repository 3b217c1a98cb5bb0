// Middleware registry
//
// Middleware intercept operations of one kind. For a given kind they are tried
// in registration order; the first whose filter accepts the operation handles
// it by returning a generator, which runs in a handler frame. A `next`
// operation yielded from that frame resumes the scan after it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Result;
use crate::generator::BoxGenerator;
use crate::operation::Operation;

/// Filter and handler pair registered under one operation kind
pub trait Middleware: Send + Sync {
    /// Whether this middleware takes `operation`. Defaults to every operation
    /// of the registered kind.
    fn filter(&self, _operation: &Operation, _ctx: &Context) -> bool {
        true
    }

    /// Build the generator that performs `operation`.
    fn handle(&self, operation: Operation, ctx: &Context) -> Result<BoxGenerator>;
}

type FilterFn = dyn Fn(&Operation, &Context) -> bool + Send + Sync;
type HandleFn = dyn Fn(Operation, &Context) -> Result<BoxGenerator> + Send + Sync;

/// Middleware built from closures
pub struct FnMiddleware {
    filter: Option<Box<FilterFn>>,
    handle: Box<HandleFn>,
}

impl FnMiddleware {
    pub fn new<H>(handle: H) -> Self
    where
        H: Fn(Operation, &Context) -> Result<BoxGenerator> + Send + Sync + 'static,
    {
        Self {
            filter: None,
            handle: Box::new(handle),
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Operation, &Context) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }
}

impl Middleware for FnMiddleware {
    fn filter(&self, operation: &Operation, ctx: &Context) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(operation, ctx))
    }

    fn handle(&self, operation: Operation, ctx: &Context) -> Result<BoxGenerator> {
        (self.handle)(operation, ctx)
    }
}

/// Ordered handler chain for one kind
pub type Handlers = Arc<[Arc<dyn Middleware>]>;

/// A middleware together with the kind it intercepts
#[derive(Clone)]
pub struct Registration {
    pub kind: String,
    pub middleware: Arc<dyn Middleware>,
}

impl Registration {
    pub fn new(kind: impl Into<String>, middleware: impl Middleware + 'static) -> Self {
        Self {
            kind: kind.into(),
            middleware: Arc::new(middleware),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Immutable kind → handler chain mapping, shared by a task and its forks
#[derive(Clone, Default)]
pub struct Registry {
    by_kind: HashMap<String, Handlers>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn handlers(&self, kind: &str) -> Option<&Handlers> {
        self.by_kind.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.by_kind.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_kind.iter().map(|(kind, handlers)| (kind, handlers.len())))
            .finish()
    }
}

/// Collects registrations in order
#[derive(Default)]
pub struct RegistryBuilder {
    by_kind: HashMap<String, Vec<Arc<dyn Middleware>>>,
}

impl RegistryBuilder {
    pub fn register(&mut self, registration: Registration) -> &mut Self {
        self.by_kind
            .entry(registration.kind)
            .or_default()
            .push(registration.middleware);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            by_kind: self
                .by_kind
                .into_iter()
                .map(|(kind, handlers)| (kind, Handlers::from(handlers)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::operation::custom;

    fn refusing() -> FnMiddleware {
        FnMiddleware::new(|operation, _ctx| {
            Err(Error::UnrecognizedOperation(operation.kind().to_owned()))
        })
    }

    #[test]
    fn registration_order_is_kept_per_kind() {
        let mut builder = Registry::builder();
        builder
            .register(Registration::new("query", refusing().with_filter(|_, _| false)))
            .register(Registration::new("query", refusing()))
            .register(Registration::new("mutation", refusing()));
        let registry = builder.build();

        let handlers = registry.handlers("query").map(|h| h.len());
        assert_eq!(handlers, Some(2));
        assert!(registry.contains("mutation"));
        assert!(!registry.contains("call"));

        let ctx = Context::new();
        let op = custom("query", ());
        let accepted: Vec<bool> = registry
            .handlers("query")
            .map(|handlers| handlers.iter().map(|m| m.filter(&op, &ctx)).collect())
            .unwrap_or_default();
        assert_eq!(accepted, vec![false, true]);
    }
}

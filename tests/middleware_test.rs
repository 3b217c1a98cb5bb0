// Middleware ordering, `next` delegation, plugins and lifecycle hooks

use std::sync::Arc;

use async_trait::async_trait;
use ladle::{
    custom, next, BoxGenerator, Context, Coroutine, Engine, Error, FnMiddleware, Middleware,
    Operation, Plugin, Registration, Result, TaskListener, Value,
};
use parking_lot::Mutex;

fn payload(op: &Operation) -> String {
    op.as_custom()
        .and_then(|custom| custom.payload.as_str())
        .unwrap_or_default()
        .to_owned()
}

/// Wraps whatever the rest of the chain produces in `label(...)`.
fn wrapping(label: &'static str) -> FnMiddleware {
    FnMiddleware::new(move |op, _ctx| {
        Ok(Coroutine::new(label, move |co| async move {
            let inner = co.yield_(next(op)).await?;
            Ok(Value::from(format!("{label}({inner})")))
        })
        .boxed())
    })
}

fn answering(label: &'static str) -> FnMiddleware {
    FnMiddleware::new(move |op, _ctx| {
        let text = format!("{label}:{}", payload(&op));
        Ok(Coroutine::new(label, move |_co| async move { Ok(Value::from(text)) }).boxed())
    })
}

#[tokio::test]
async fn middleware_run_in_registration_order() {
    let engine = Engine::builder()
        .middleware("greet", wrapping("a"))
        .middleware("greet", wrapping("b"))
        .middleware("greet", answering("c"))
        .build();

    let result = engine.start(custom("greet", "x")).await;
    assert_eq!(result.unwrap(), Value::from("a(b(c:x))"));
}

#[tokio::test]
async fn filters_skip_middleware() {
    let engine = Engine::builder()
        .middleware(
            "greet",
            answering("loud").with_filter(|op, _ctx| payload(op) == "loud"),
        )
        .middleware("greet", answering("quiet"))
        .build();

    assert_eq!(engine.start(custom("greet", "loud")).await.unwrap(), Value::from("loud:loud"));
    assert_eq!(engine.start(custom("greet", "soft")).await.unwrap(), Value::from("quiet:soft"));
}

#[tokio::test]
async fn next_keeps_unconsumed_handlers_for_later_operations() {
    let outer = FnMiddleware::new(|op, _ctx| {
        Ok(Coroutine::new("outer", move |co| async move {
            let delegated = co.yield_(next(op)).await?;
            // A fresh operation of the same kind starts from the top again.
            let fresh = co.yield_(custom("greet", "inner")).await?;
            Ok(Value::from(format!("{delegated}+{fresh}")))
        })
        .boxed())
    })
    .with_filter(|op, _ctx| payload(op) == "outer");

    let engine = Engine::builder()
        .middleware("greet", outer)
        .middleware("greet", answering("second"))
        .build();

    let result = engine.start(custom("greet", "outer")).await;
    assert_eq!(result.unwrap(), Value::from("second:outer+second:inner"));
}

#[tokio::test]
async fn next_past_the_last_middleware_falls_back_to_core() {
    let engine = Engine::builder().middleware("greet", wrapping("only")).build();

    let result = engine.start(custom("greet", "x")).await;
    assert!(matches!(result, Err(Error::UnrecognizedOperation(ref kind)) if kind == "greet"));
}

/// Middleware implemented as a type, keeping state across operations.
#[derive(Clone, Default)]
struct Counting {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Middleware for Counting {
    fn handle(&self, operation: Operation, _ctx: &Context) -> Result<BoxGenerator> {
        self.seen.lock().push(payload(&operation));
        Ok(Coroutine::new("counting", move |co| async move { co.yield_(next(operation)).await })
            .boxed())
    }
}

struct GreetingPlugin {
    counting: Counting,
    events: Arc<Mutex<Vec<String>>>,
}

impl Plugin for GreetingPlugin {
    fn registrations(&self) -> Vec<Registration> {
        vec![
            Registration::new("greet", self.counting.clone()),
            Registration::new("greet", answering("plugin")),
        ]
    }

    fn listener(&self) -> Option<Arc<dyn TaskListener>> {
        Some(Arc::new(Recorder {
            name: "plugin",
            events: Arc::clone(&self.events),
            fail_pre_complete: false,
        }))
    }
}

struct Recorder {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    fail_pre_complete: bool,
}

impl Recorder {
    fn push(&self, event: impl std::fmt::Display) {
        self.events.lock().push(format!("{}:{event}", self.name));
    }
}

#[async_trait]
impl TaskListener for Recorder {
    async fn initialize(&self, _ctx: &Context) -> Result<()> {
        self.push("initialize");
        Ok(())
    }

    async fn pre_complete(&self, value: &Value) -> Result<()> {
        self.push(format_args!("pre_complete {value}"));
        if self.fail_pre_complete {
            return Err(Error::msg("commit failed"));
        }
        Ok(())
    }

    async fn complete(&self, value: &Value) -> Result<()> {
        self.push(format_args!("complete {value}"));
        Ok(())
    }

    async fn error(&self, error: &Error) -> Result<()> {
        self.push(format_args!("error {error}"));
        Ok(())
    }

    async fn finalize(&self, error: Option<&Error>) -> Result<()> {
        self.push(format_args!("finalize {}", error.is_some()));
        Ok(())
    }
}

#[tokio::test]
async fn plugins_contribute_middleware_and_listeners() {
    let counting = Counting::default();
    let events = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder()
        .plugin(GreetingPlugin {
            counting: counting.clone(),
            events: Arc::clone(&events),
        })
        .build();

    let result = engine.start(custom("greet", "hi")).await;
    assert_eq!(result.unwrap(), Value::from("plugin:hi"));
    assert_eq!(*counting.seen.lock(), vec!["hi"]);
    assert_eq!(
        *events.lock(),
        vec![
            "plugin:initialize",
            "plugin:pre_complete plugin:hi",
            "plugin:complete plugin:hi",
            "plugin:finalize false",
        ]
    );
}

#[tokio::test]
async fn listeners_observe_failures() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder()
        .listener(Recorder {
            name: "a",
            events: Arc::clone(&events),
            fail_pre_complete: false,
        })
        .build();

    let result = engine.start(custom("missing", ())).await;
    assert!(result.is_err());
    assert_eq!(
        *events.lock(),
        vec![
            "a:initialize",
            "a:error unrecognized operation kind \"missing\"",
            "a:finalize true",
        ]
    );
}

#[tokio::test]
async fn failing_hooks_turn_success_into_failure() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::builder()
        .listener(Recorder {
            name: "a",
            events: Arc::clone(&events),
            fail_pre_complete: true,
        })
        .listener(Recorder {
            name: "b",
            events: Arc::clone(&events),
            fail_pre_complete: false,
        })
        .build();

    let done = Coroutine::new("done", |_co| async { Ok(Value::from(1)) });
    let error = engine.execute(done).await.unwrap_err();
    assert_eq!(error.to_string(), "commit failed");
    assert_eq!(
        *events.lock(),
        vec![
            "a:initialize",
            "b:initialize",
            "a:pre_complete 1",
            "a:error commit failed",
            "b:error commit failed",
            "a:finalize true",
            "b:finalize true",
        ]
    );
}

//! Operations: data describing an effect a generator wants performed.
//!
//! The core kinds form a closed enum so the dispatch loop can match on them
//! exhaustively; application kinds go through [`Operation::Custom`] and only
//! mean something to the middleware registered for them.

use std::borrow::Cow;
use std::fmt;

use crate::generator::{Args, BoxGenerator, GeneratorFn};
use crate::value::Value;

/// Kind names used for middleware registration.
pub mod kind {
    pub const CALL: &str = "call";
    pub const EXECUTE: &str = "execute";
    pub const FORK: &str = "fork";
    pub const DEFER: &str = "defer";
    pub const RECOVER: &str = "recover";
    pub const TERMINAL: &str = "terminal";
    pub const START: &str = "start";
    pub const NEXT: &str = "next";
}

/// Invocation of a generator function
#[derive(Debug, Clone)]
pub struct Call {
    pub func: GeneratorFn,
    pub args: Args,
}

/// Application-defined operation
#[derive(Debug, Clone)]
pub struct Custom {
    pub kind: Cow<'static, str>,
    pub payload: Value,
}

/// A requested effect
pub enum Operation {
    Call(Call),
    Execute(BoxGenerator),
    Fork(Box<Operation>),
    Defer(Box<Operation>),
    Recover,
    Terminal(Box<Operation>),
    Start(Box<Operation>),
    /// Delegate to the next matching middleware; only valid inside a handler.
    Next(Box<Operation>),
    Custom(Custom),
}

impl Operation {
    pub fn kind(&self) -> &str {
        match self {
            Operation::Call(_) => kind::CALL,
            Operation::Execute(_) => kind::EXECUTE,
            Operation::Fork(_) => kind::FORK,
            Operation::Defer(_) => kind::DEFER,
            Operation::Recover => kind::RECOVER,
            Operation::Terminal(_) => kind::TERMINAL,
            Operation::Start(_) => kind::START,
            Operation::Next(_) => kind::NEXT,
            Operation::Custom(custom) => custom.kind.as_ref(),
        }
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Operation::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&Custom> {
        match self {
            Operation::Custom(custom) => Some(custom),
            _ => None,
        }
    }

    /// Operation wrapped by `fork`, `defer`, `terminal`, `start` or `next`.
    pub fn inner(&self) -> Option<&Operation> {
        match self {
            Operation::Fork(inner)
            | Operation::Defer(inner)
            | Operation::Terminal(inner)
            | Operation::Start(inner)
            | Operation::Next(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Call(call) => f
                .debug_struct("Call")
                .field("func", &call.func.name())
                .field("args", &call.args)
                .finish(),
            Operation::Execute(generator) => {
                f.debug_tuple("Execute").field(&generator.name()).finish()
            }
            Operation::Fork(inner) => f.debug_tuple("Fork").field(inner).finish(),
            Operation::Defer(inner) => f.debug_tuple("Defer").field(inner).finish(),
            Operation::Recover => f.write_str("Recover"),
            Operation::Terminal(inner) => f.debug_tuple("Terminal").field(inner).finish(),
            Operation::Start(inner) => f.debug_tuple("Start").field(inner).finish(),
            Operation::Next(inner) => f.debug_tuple("Next").field(inner).finish(),
            Operation::Custom(custom) => f
                .debug_struct("Custom")
                .field("kind", &custom.kind)
                .field("payload", &custom.payload)
                .finish(),
        }
    }
}

pub fn call(func: &GeneratorFn, args: impl Into<Args>) -> Operation {
    Operation::Call(Call {
        func: func.clone(),
        args: args.into(),
    })
}

pub fn execute(generator: impl Into<BoxGenerator>) -> Operation {
    Operation::Execute(generator.into())
}

/// Run `operation` in a new task; the yielding frame receives its handle.
pub fn fork(operation: Operation) -> Operation {
    Operation::Fork(Box::new(operation))
}

/// Run `operation` when the current frame completes, in LIFO order.
pub fn defer(operation: Operation) -> Operation {
    Operation::Defer(Box::new(operation))
}

pub fn recover() -> Operation {
    Operation::Recover
}

pub fn terminal(operation: Operation) -> Operation {
    Operation::Terminal(Box::new(operation))
}

pub fn start(operation: Operation) -> Operation {
    Operation::Start(Box::new(operation))
}

pub fn next(operation: Operation) -> Operation {
    Operation::Next(Box::new(operation))
}

pub fn custom(kind: impl Into<Cow<'static, str>>, payload: impl Into<Value>) -> Operation {
    Operation::Custom(Custom {
        kind: kind.into(),
        payload: payload.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::Coroutine;

    #[test]
    fn kinds() {
        let func = GeneratorFn::coroutine("noop", |_co, _args| async { Ok(Value::Null) });
        assert_eq!(call(&func, vec![]).kind(), "call");
        assert_eq!(fork(call(&func, vec![])).kind(), "fork");
        assert_eq!(defer(recover()).kind(), "defer");
        assert_eq!(terminal(recover()).kind(), "terminal");
        assert_eq!(start(recover()).kind(), "start");
        assert_eq!(next(recover()).kind(), "next");
        assert_eq!(custom("query", "select 1").kind(), "query");

        let generator = Coroutine::new("bare", |_co| async { Ok(Value::Null) });
        assert_eq!(execute(generator.boxed()).kind(), "execute");
    }

    #[test]
    fn inner_operation() {
        let op = fork(custom("inner", Value::Null));
        assert_eq!(op.inner().map(Operation::kind), Some("inner"));
        assert!(recover().inner().is_none());
    }
}

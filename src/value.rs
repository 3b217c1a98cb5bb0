//! Dynamic values exchanged between frames.
//!
//! Generators receive a [`Value`] each time they are resumed and complete with
//! one. Besides plain data a value can hold the [`TaskHandle`] produced by
//! `fork`, the [`Error`] handed over by `recover`, or an opaque application
//! payload.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::task::TaskHandle;

/// A value passed into or out of a generator
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Vec<Value>),
    Task(TaskHandle),
    Error(Error),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap an arbitrary application payload.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Dynamic truthiness: `Null`, `false`, zero and the empty string are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskHandle> {
        match self {
            Value::Task(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Downcast an opaque payload.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Opaque(payload) => payload.downcast_ref(),
            _ => None,
        }
    }

    /// Consume the value as a list, failing with a usage error otherwise.
    pub fn into_list(self) -> Result<Vec<Value>, Error> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(Error::usage(
                "value",
                format!("expected a list, got {}", other.type_name()),
            )),
        }
    }

    /// Consume the value as a task handle, failing with a usage error otherwise.
    pub fn into_task(self) -> Result<TaskHandle, Error> {
        match self {
            Value::Task(handle) => Ok(handle),
            other => Err(Error::usage(
                "value",
                format!("expected a task handle, got {}", other.type_name()),
            )),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Task(_) => "task",
            Value::Error(_) => "error",
            Value::Opaque(_) => "opaque",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Value::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Value::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Task(handle) => f.debug_tuple("Task").field(&handle.id()).finish(),
            Value::Error(error) => f.debug_tuple("Error").field(error).finish(),
            Value::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Task(handle) => write!(f, "<task {}>", handle.id()),
            Value::Error(error) => write!(f, "<error {error}>"),
            Value::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a.id() == b.id(),
            (Value::Error(a), Value::Error(b)) => a.same(b),
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<TaskHandle> for Value {
    fn from(handle: TaskHandle) -> Self {
        Value::Task(handle)
    }
}

impl From<Error> for Value {
    fn from(error: Error) -> Self {
        Value::Error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from(0.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("users").is_truthy());
        assert!(Value::from(3).is_truthy());
        assert!(Value::List(vec![]).is_truthy());
        assert!(Value::opaque(1u8).is_truthy());
    }

    #[test]
    fn display_nested_list() {
        let value = Value::from(vec![Value::from(1), Value::from("a"), Value::Null]);
        assert_eq!(value.to_string(), "[1, a, null]");
    }

    #[test]
    fn opaque_downcast() {
        #[derive(Debug, PartialEq)]
        struct Row(u32);

        let value = Value::opaque(Row(7));
        assert_eq!(value.downcast_ref::<Row>(), Some(&Row(7)));
        assert!(value.downcast_ref::<String>().is_none());
        assert_eq!(value, value.clone());
    }

    #[test]
    fn errors_compare_by_identity() {
        let failure = Error::msg("boom");
        assert_eq!(Value::from(failure.clone()), Value::from(failure));
        assert_ne!(Value::from(Error::msg("boom")), Value::from(Error::msg("boom")));
        assert_eq!(Value::from(Error::Cancelled), Value::from(Error::Cancelled));
        assert_ne!(
            Value::from(Error::Panicked("boom".into())),
            Value::from(Error::msg("boom"))
        );
    }

    #[test]
    fn into_list_rejects_scalars() {
        assert!(Value::from(1).into_list().is_err());
        assert_eq!(Value::from(vec![Value::Null]).into_list().ok(), Some(vec![Value::Null]));
    }
}

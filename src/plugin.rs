// Plugins and root-task lifecycle hooks
//
// External integrations (resource pools, request scopes) subscribe to the
// lifecycle of root tasks through `TaskListener`. A `Plugin` bundles such a
// listener with the middleware it needs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::middleware::Registration;
use crate::value::Value;

/// Hooks around one root task run by an engine.
///
/// Hooks run in this order: `initialize`, the task itself, then either
/// `pre_complete` and `complete` on success or `error` on failure, and
/// `finalize` last regardless of the outcome. Every method defaults to a
/// no-op.
#[async_trait]
pub trait TaskListener: Send + Sync {
    /// Called before the task starts; failing aborts the task.
    async fn initialize(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn pre_complete(&self, _value: &Value) -> Result<()> {
        Ok(())
    }

    async fn complete(&self, _value: &Value) -> Result<()> {
        Ok(())
    }

    async fn error(&self, _error: &Error) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _error: Option<&Error>) -> Result<()> {
        Ok(())
    }
}

/// Bundle of middleware plus an optional lifecycle listener
pub trait Plugin {
    fn registrations(&self) -> Vec<Registration>;

    fn listener(&self) -> Option<Arc<dyn TaskListener>> {
        None
    }
}

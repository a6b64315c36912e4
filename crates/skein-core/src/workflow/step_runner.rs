//! Fluent activity call API for workflows.
//!
//! ```ignore
//! // Run now
//! let id = ctx.call::<CreateAccount>(email.clone()).await?;
//!
//! // Run one day after the workflow's current logical time
//! ctx.activity::<SendReminder>(id)
//!     .after(Duration::from_secs(24 * 60 * 60))
//!     .run()
//!     .await?;
//!
//! // Same arguments inside a loop: salt the key so each pass is a new call
//! ctx.activity::<SendEmail>(email).salted_by_time().run().await?;
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::activity::Activity;
use super::context::WorkflowContext;
use super::key::KeyMode;
use crate::{Result, SkeinError};

#[derive(Debug, Clone, Copy)]
enum Due {
    Now,
    At(DateTime<Utc>),
    After(Duration),
}

/// A fluent builder for one activity call site.
///
/// Created via `WorkflowContext::activity()`.
pub struct ActivityCall<'a, A: Activity> {
    ctx: &'a WorkflowContext,
    args: A::Args,
    due: Due,
    mode: KeyMode,
    _activity: PhantomData<fn() -> A>,
}

impl<'a, A: Activity> ActivityCall<'a, A> {
    pub(crate) fn new(ctx: &'a WorkflowContext, args: A::Args) -> Self {
        Self {
            ctx,
            args,
            due: Due::Now,
            mode: KeyMode::Arguments,
            _activity: PhantomData,
        }
    }

    /// Run no earlier than `at`.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.due = Due::At(at);
        self
    }

    /// Run `delay` after the workflow's current logical time.
    pub fn after(mut self, delay: Duration) -> Self {
        self.due = Due::After(delay);
        self
    }

    /// Salt the key with the current logical time.
    ///
    /// Needed when the same activity is called with the same arguments more
    /// than once, e.g. inside a loop.
    pub fn salted_by_time(mut self) -> Self {
        self.mode = KeyMode::LogicalTime;
        self
    }

    /// Salt the key with an explicit iteration token.
    pub fn iteration(mut self, token: impl Into<String>) -> Self {
        self.mode = KeyMode::Token(token.into());
        self
    }

    /// Resolve the call site.
    ///
    /// Returns the memoized result on replay. Errors with
    /// `SkeinError::Suspended` when the call is not due yet and with
    /// `SkeinError::ActivityFailed` when the body failed.
    pub async fn run(self) -> Result<A::Output> {
        let eta = match self.due {
            Due::Now => self.ctx.current_time(),
            Due::At(at) => at,
            Due::After(delay) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| SkeinError::Validation(format!("invalid delay: {}", e)))?;
                self.ctx.current_time() + delay
            }
        };

        self.ctx
            .execute_activity::<A>(self.args, eta, self.mode)
            .await
    }
}

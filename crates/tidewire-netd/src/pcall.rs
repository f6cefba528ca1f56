//! Panic-isolated invocation of business code.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures_util::FutureExt;
use tracing::{error, warn};

use crate::handler::Invocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    Completed,
    Failed,
    Panicked,
}

/// Drive one handler invocation to completion.
///
/// A returned error is logged, a panic is logged with a backtrace; neither
/// escapes.
pub async fn pcall(route: &str, invocation: Invocation) -> InvokeOutcome {
    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => InvokeOutcome::Completed,
        Ok(Err(e)) => {
            warn!(route, error = %e, "Handler returned error");
            InvokeOutcome::Failed
        }
        Err(payload) => {
            error!(
                route,
                panic = panic_message(payload.as_ref()),
                backtrace = %Backtrace::force_capture(),
                "Handler panicked"
            );
            InvokeOutcome::Panicked
        }
    }
}

/// Synchronous counterpart of [`pcall`] for callbacks run on the dispatch loop.
pub(crate) fn call_protected<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            error!(
                what,
                panic = panic_message(payload.as_ref()),
                backtrace = %Backtrace::force_capture(),
                "Callback panicked"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

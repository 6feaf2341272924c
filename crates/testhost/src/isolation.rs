//! Fault-isolation boundary for session jobs
//!
//! A job runs on its own task. Whatever it does wrong, an `Err` return or a
//! panic at any await point, is turned into one [`JobError`] and handed to
//! the session's error callback. Nothing escapes to the host.

use crate::result::JobError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info_span, warn, Instrument};

/// A session's unit of work; nothing runs until it is polled
pub type Job = BoxFuture<'static, Result<(), JobError>>;

/// Invoked at most once when a job faults
pub type ErrorCallback = Box<dyn FnOnce(JobError) + Send + 'static>;

/// Run `job` inside the boundary.
///
/// Returns the supervising task, or `None` when no runtime is available to
/// host it. In that case the error callback has already received an
/// [`JobError::Isolation`] so callers can keep their bookkeeping moving.
pub fn supervise(source: &str, job: Job, on_error: ErrorCallback) -> Option<JoinHandle<()>> {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(e) => {
            error!(source, error = %e, "isolation boundary unavailable, failing session");
            on_error(JobError::Isolation {
                message: e.to_string(),
            });
            return None;
        }
    };

    let span = info_span!("session", source = %source);
    Some(handle.spawn(
        async move {
            let fault = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(payload) => JobError::from_panic(payload.as_ref()),
            };
            warn!(error = %fault, "session job faulted");
            on_error(fault);
        }
        .instrument(span),
    ))
}

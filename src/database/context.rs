//! # Cancellation Context
//!
//! Managed transactions (`update_with_context` / `view_with_context`) carry
//! an explicit, cloneable cancellation token. Commit polls it at safe
//! points — after rebalance, before spill, and before the meta write-back —
//! so a cancelled transaction rolls back cleanly; once the meta write
//! starts, the commit completes regardless.
//!
//! ```ignore
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! let watchdog = ctx.clone();
//! std::thread::spawn(move || watchdog.cancel());
//!
//! db.update_with_context(ctx, |tx| { /* ... */ Ok(()) })?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, Result};

use crate::error::Error;

#[derive(Debug, Default)]
struct ContextInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// Cloneable cancellation token with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context that only cancels when [`Context::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that also expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Requests cancellation; observed by every clone.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails with `Cancelled` or `Timeout` when the context is done.
    pub(crate) fn check(&self) -> Result<()> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            bail!(Error::Cancelled);
        }
        if self.inner.deadline.is_some_and(|d| Instant::now() >= d) {
            bail!(Error::Timeout);
        }
        Ok(())
    }
}

//! Cooperative cancellation for in-flight jobs.
//!
//! Signal handlers never touch job state. They trigger a [`CancelHandle`];
//! the job pipeline observes the matching [`CancelToken`] before every
//! external operation and while waiting on one, and unwinds with
//! [`VaultError::Interrupted`] as an ordinary error value.

use crate::error::{Result, VaultError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// SIGINT, usually an operator at the terminal.
    Interrupt,
    /// SIGTERM from the host or a service manager.
    Terminate,
    /// SIGHUP, controlling terminal went away.
    Hangup,
    /// Explicit programmatic cancellation.
    #[default]
    Requested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Interrupt => write!(f, "SIGINT"),
            CancelReason::Terminate => write!(f, "SIGTERM"),
            CancelReason::Hangup => write!(f, "SIGHUP"),
            CancelReason::Requested => write!(f, "cancel requested"),
        }
    }
}

struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

/// A cloneable cancellation token observed by the job pipeline.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.shared.reason.lock()
    }

    /// Checkpoint: fail with `Interrupted` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(VaultError::Interrupted {
            reason: self.cancelled_reason().unwrap_or_default().to_string(),
        })
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_cancelled() {
                return self.cancelled_reason().unwrap_or_default();
            }
            notified.await;
        }
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.shared.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        reason: Mutex::new(None),
        notify: Notify::new(),
    });
    (
        CancelToken {
            shared: shared.clone(),
        },
        CancelHandle { shared },
    )
}

/// A token nothing can cancel. Used for compensation work that must run
/// after the main token already fired.
pub fn detached() -> CancelToken {
    new_cancel_pair().0
}

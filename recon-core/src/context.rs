//! Per-pass call context.
//!
//! The scheduler creates one [`CallContext`] per convergence pass. The engine
//! hands the same context, unchanged, to every remote call it makes; clients
//! wrap their transport futures in [`CallContext::run`] so deadline expiry and
//! cancellation surface as ordinary errors.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Deadline and cancellation carried through a convergence pass.
#[derive(Debug, Clone)]
pub struct CallContext {
    pass_id: String,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`CallContext`] derived from the same `cancellable()` call.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CallContext {
    /// Context without deadline or cancellation.
    pub fn new() -> Self {
        Self {
            pass_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            cancel: None,
        }
    }

    /// Expire the context `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation channel and return the handle that fires it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    /// Fresh context for the next pass: new pass id, same deadline and
    /// cancellation.
    pub fn next_pass(&self) -> Self {
        Self {
            pass_id: uuid::Uuid::new_v4().to_string(),
            deadline: self.deadline,
            cancel: self.cancel.clone(),
        }
    }

    /// Identifier of the pass this context belongs to (for log correlation).
    pub fn pass_id(&self) -> &str {
        &self.pass_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|at| at <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the context is cancelled. Never resolves for a context
    /// without cancellation.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    // Handle dropped without cancelling.
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Drive a remote call under this context's deadline and cancellation.
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            result = call => result,
            _ = self.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::DeadlineExceeded),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

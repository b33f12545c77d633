use crate::error::LedgerError;
use std::future::pending;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Per-call context threaded through every ledger transaction.
///
/// Carries an optional deadline, an optional cancellation signal and a label
/// that shows up on the transaction's tracing span.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
    label: Option<String>,
}

/// Cancels every context cloned from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl TxContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is already done, if it is.
    pub fn err(&self) -> Option<LedgerError> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Some(LedgerError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(LedgerError::DeadlineExceeded);
        }
        None
    }

    /// Resolves once the context is cancelled or its deadline passes. Never
    /// resolves for a background context.
    pub async fn done(&self) -> LedgerError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => pending::<()>().await,
            }
        };
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    // A dropped handle can no longer cancel.
                    let closed = rx.wait_for(|c| *c).await.is_err();
                    if closed {
                        pending::<()>().await;
                    }
                }
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => LedgerError::Cancelled,
            _ = deadline => LedgerError::DeadlineExceeded,
        }
    }
}

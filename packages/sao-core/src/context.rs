//! Cancellation and deadline propagation.
//!
//! Every long-running operation takes a [`Context`]. A context carries an
//! optional deadline and any number of cancellation signals inherited from
//! its ancestors, so cancelling a parent stops every derived operation.
//!
//! ```text
//! background ──► with_cancel ──► with_timeout(1h) ──► transfer_file
//!                    │                                   ▲
//!                    └── CancelHandle::cancel() ─────────┘ done() resolves
//! ```

use std::future::Future;
use std::time::Duration;

use futures::future::{pending, select_all};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Cancellation scope with an optional deadline
#[derive(Clone, Debug)]
pub struct Context {
    deadline: Option<Instant>,
    signals: Vec<watch::Receiver<bool>>,
}

/// Cancels the context it was created with, and every child of it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            deadline: None,
            signals: Vec::new(),
        }
    }

    /// Derive a child that can be cancelled independently of its parent
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut child = self.clone();
        child.signals.push(rx);
        (child, CancelHandle { tx })
    }

    /// Derive a child whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child whose deadline is the earlier of `deadline` and the parent's
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// Effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once cancelled or past the deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context finished, if it has
    pub fn err(&self) -> Option<Error> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::Timeout("context deadline exceeded".into()))
            }
            _ => None,
        }
    }

    /// Fail fast if the context already finished
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves when the context is cancelled or its deadline passes
    pub async fn done(&self) {
        let cancelled = async {
            let waits: Vec<_> = self
                .signals
                .iter()
                .cloned()
                .map(|mut rx| {
                    Box::pin(async move {
                        loop {
                            if *rx.borrow() {
                                return;
                            }
                            if rx.changed().await.is_err() {
                                // Handle dropped without cancelling.
                                pending::<()>().await;
                            }
                        }
                    })
                })
                .collect();
            if waits.is_empty() {
                pending::<()>().await;
            } else {
                select_all(waits).await;
            }
        };

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancelled => {}
            _ = expired => {}
        }
    }

    /// Run `fut` until it completes or the context finishes
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            result = fut => result,
            _ = self.done() => Err(self.err().unwrap_or(Error::Cancelled)),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

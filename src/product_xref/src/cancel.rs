//! Cooperative cancellation for batch work and retry sleeps.
//!
//! A [`CancelToken`] trips either when its [`CancelHandle`] fires or when an
//! optional deadline passes. Synchronous batch loops poll
//! [`CancelToken::is_cancelled`] between rows; async code races
//! [`CancelToken::cancelled`] against its own future in `tokio::select!`.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::watch;

/// Returned by operations that stop early because their token tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Fires the paired [`CancelToken`]s.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
    // keeps the channel open for tokens created without a handle
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// A handle/token pair with no deadline.
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx: Arc::new(tx) },
            CancelToken {
                rx,
                deadline: None,
                _keepalive: None,
            },
        )
    }

    /// A token that never trips.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            rx,
            deadline: None,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Same trigger, plus a deadline `timeout` from now. Keeps an earlier deadline.
    pub fn with_timeout(&self, timeout: Duration) -> CancelToken {
        let at = Instant::now() + timeout;
        CancelToken {
            rx: self.rx.clone(),
            deadline: Some(self.deadline.map_or(at, |d| d.min(at))),
            _keepalive: self._keepalive.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns `Err(Cancelled)` when tripped; handy with `?` in batch loops.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token trips. Never resolves for [`CancelToken::never`].
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let deadline = self.deadline.map(tokio::time::Instant::from_std);
        let trigger = async move {
            let fired = rx.wait_for(|v| *v).await.is_ok();
            if !fired {
                // sender gone without firing: nothing can cancel us any more
                std::future::pending::<()>().await;
            }
        };
        match deadline {
            Some(at) => tokio::select! {
                _ = trigger => {}
                _ = tokio::time::sleep_until(at) => {}
            },
            None => trigger.await,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::never()
    }
}

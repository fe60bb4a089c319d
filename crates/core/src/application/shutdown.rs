// Monitor Shutdown Token

use crate::error::{AppError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::error;

struct Shared {
    tx: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
}

/// Shutdown signal for cooperative termination of every loop
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once shutdown was requested
    pub fn check(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` on shutdown
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = rx.wait_for(|quit| *quit) => Err(AppError::Cancelled),
        }
    }

    /// Raise the quit flag because of a fatal condition
    ///
    /// The first reason recorded wins; later ones are only logged.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "Fatal condition, stopping monitor");
        {
            let mut fatal = self
                .shared
                .fatal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if fatal.is_none() {
                *fatal = Some(reason);
            }
        }
        self.shared.tx.send_replace(true);
    }

    /// Reason recorded by the first `abort`, if any
    pub fn fatal_reason(&self) -> Option<String> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    shared: Arc<Shared>,
}

impl ShutdownSender {
    /// Signal shutdown to all loops
    pub fn shutdown(&self) {
        self.shared.tx.send_replace(true);
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        tx,
        fatal: Mutex::new(None),
    });
    (
        ShutdownSender {
            shared: Arc::clone(&shared),
        },
        ShutdownToken { rx, shared },
    )
}

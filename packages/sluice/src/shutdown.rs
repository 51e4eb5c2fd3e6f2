//! Cooperative shutdown.
//!
//! Cancellation is a token checked at suspension points - before a
//! reservation, between make phases, before a commit - never an exception
//! thrown into user code. SIGTERM trips the token; in-flight transactions
//! roll back and the in-flight job record gets an error citing the
//! termination. A shutdown always unwinds `populate`, even when per-key
//! errors are being suppressed.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::PopulateError;

/// Shared cancellation state for one populate call and its workers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: CancellationToken,
}

impl ShutdownToken {
    /// A fresh, untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Workers notice at their next suspension point.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Error out if shutdown has been requested. Call this at every
    /// suspension point.
    pub fn check(&self) -> Result<(), PopulateError> {
        if self.inner.is_cancelled() {
            Err(PopulateError::ShutdownRequested)
        } else {
            Ok(())
        }
    }

    /// Bind this token to SIGTERM for the duration of the returned guard.
    ///
    /// The listener task is aborted when the guard drops, restoring the
    /// process to its previous signal disposition as far as this engine is
    /// concerned. On non-unix targets the guard is inert.
    pub fn bind_sigterm(&self) -> SignalGuard {
        #[cfg(unix)]
        {
            let token = self.inner.clone();
            let handle = tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                sigterm.recv().await;
                info!("SIGTERM received; requesting populate shutdown");
                token.cancel();
            });
            SignalGuard {
                handle: Some(handle),
            }
        }
        #[cfg(not(unix))]
        {
            SignalGuard { handle: None }
        }
    }
}

/// Aborts the SIGTERM listener on drop.
pub struct SignalGuard {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

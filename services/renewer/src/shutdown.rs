//! Signal handling and graceful shutdown.
//!
//! SIGTERM and Ctrl+C stop the renewer; SIGHUP asks for an immediate
//! renewal pass.

use futures::stream::{self, Stream, StreamExt};
use rust_common::PlatformError;
use std::io;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use vault_renewal::RenewalHandle;

/// A process signal the service reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Stop gracefully
    Shutdown,
    /// Renew now, clearing a stalled state
    RenewNow,
}

/// Installed OS signal handlers.
pub struct SignalListener {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
    #[cfg(unix)]
    hangup: signal::unix::Signal,
}

impl SignalListener {
    /// Install the handlers. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be registered.
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use signal::unix::{SignalKind, signal as unix_signal};
            Ok(Self {
                terminate: unix_signal(SignalKind::terminate())?,
                hangup: unix_signal(SignalKind::hangup())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> ProcessSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Ctrl+C handler failed");
                    }
                    info!("Received Ctrl+C, initiating shutdown");
                    ProcessSignal::Shutdown
                }
                Some(()) = self.terminate.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    ProcessSignal::Shutdown
                }
                Some(()) = self.hangup.recv() => {
                    info!("Received SIGHUP, renewing now");
                    ProcessSignal::RenewNow
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Ctrl+C handler failed");
            }
            info!("Received Ctrl+C, initiating shutdown");
            ProcessSignal::Shutdown
        }
    }

    /// The signals as an endless stream.
    pub fn into_stream(self) -> impl Stream<Item = ProcessSignal> + Unpin {
        Box::pin(stream::unfold(self, |mut listener| async move {
            let signal = listener.recv().await;
            Some((signal, listener))
        }))
    }
}

/// Drive `handle` from `signals` until a shutdown is requested, then stop it
/// within `timeout`.
///
/// The end of the stream counts as a shutdown request.
///
/// # Errors
///
/// See [`RenewalHandle::shutdown`].
pub async fn run_until_shutdown<S>(
    mut signals: S,
    handle: RenewalHandle,
    timeout: Duration,
) -> Result<(), PlatformError>
where
    S: Stream<Item = ProcessSignal> + Unpin,
{
    while let Some(ProcessSignal::RenewNow) = signals.next().await {
        info!(path = handle.path(), "Manual renewal requested");
        handle.renew_now();
    }

    info!(timeout_secs = timeout.as_secs(), "Initiating graceful shutdown");
    handle.shutdown(timeout).await
}

//! Signal handling for a clean shutdown of the run loop.
//!
//! SIGINT and SIGTERM set an atomic flag; the run loop polls it and closes
//! the link, which puts every slave back into Init.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static LAST_SIGNAL: AtomicU32 = AtomicU32::new(0);

/// Signals that stop the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Process-wide shutdown flag.
#[derive(Debug, Clone, Copy)]
pub struct SignalHandler;

impl SignalHandler {
    /// Register the handlers.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        register_unix_handlers()?;
        Ok(Self)
    }

    /// Whether a stop was requested.
    #[inline]
    pub fn shutdown_requested(self) -> bool {
        SHUTDOWN_FLAG.load(Ordering::Relaxed)
    }

    /// Request a stop from inside the process.
    pub fn request_shutdown(self) {
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    }

    /// The signal that requested the stop, if any.
    pub fn last_signal(self) -> Option<SignalKind> {
        match LAST_SIGNAL.load(Ordering::Relaxed) {
            1 => Some(SignalKind::Terminate),
            2 => Some(SignalKind::Interrupt),
            _ => None,
        }
    }
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_signal(signum: c_int) {
        let kind = if signum == libc::SIGTERM { 1 } else { 2 };
        LAST_SIGNAL.store(kind, Ordering::Relaxed);
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    }

    for signum in [libc::SIGTERM, libc::SIGINT] {
        // SAFETY: the handler only touches atomics, which is async-signal-safe.
        let previous = unsafe { libc::signal(signum, on_signal as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    debug!("Unix signal handlers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_shutdown() {
        let handler = SignalHandler::new().unwrap();
        assert!(handler.last_signal().is_none());
        handler.request_shutdown();
        assert!(handler.shutdown_requested());
    }

    #[test]
    fn test_signal_kind_display() {
        assert_eq!(SignalKind::Terminate.to_string(), "SIGTERM");
        assert_eq!(SignalKind::Interrupt.to_string(), "SIGINT");
    }
}

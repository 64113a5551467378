//! Signal handling for clean unmount
//!
//! SIGINT (Ctrl+C), SIGTERM and SIGHUP all request shutdown. The handlers
//! only flip atomics; the main thread polls [`ShutdownSignal`] and drops the
//! FUSE session, which unmounts the emulator.
//!
//! # Usage
//!
//! ```rust,no_run
//! use binfmt_misc_fs::signal::{ShutdownSignal, install_signal_handlers};
//! use std::sync::Arc;
//!
//! let shutdown = Arc::new(ShutdownSignal::new());
//! install_signal_handlers(shutdown.clone()).expect("Failed to install signal handlers");
//!
//! while !shutdown.is_signaled() {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// Shutdown request shared between signal handlers and the main thread
#[derive(Debug)]
pub struct ShutdownSignal {
    signaled: AtomicBool,
    /// The signal number that triggered shutdown (0 if not triggered)
    signal_num: AtomicI32,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            signal_num: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub fn signal_number(&self) -> i32 {
        self.signal_num.load(Ordering::Acquire)
    }

    /// Request shutdown as if `signal_num` had arrived.
    pub fn trigger(&self, signal_num: i32) {
        self.signal_num.store(signal_num, Ordering::Release);
        self.signaled.store(true, Ordering::Release);
    }

    pub fn signal_name(&self) -> &'static str {
        match self.signal_num.load(Ordering::Acquire) {
            SIGINT => "SIGINT",
            SIGTERM => "SIGTERM",
            SIGHUP => "SIGHUP",
            0 => "none",
            _ => "unknown",
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Route SIGINT, SIGTERM and SIGHUP into `shutdown`.
pub fn install_signal_handlers(shutdown: Arc<ShutdownSignal>) -> std::io::Result<()> {
    for signal in [SIGINT, SIGTERM, SIGHUP] {
        let shutdown = shutdown.clone();
        // SAFETY: the handler only stores to atomics, which is async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, move || shutdown.trigger(signal))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_initial_state() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_signaled());
        assert_eq!(signal.signal_number(), 0);
        assert_eq!(signal.signal_name(), "none");
    }

    #[test]
    fn test_shutdown_signal_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger(SIGTERM);
        assert!(signal.is_signaled());
        assert_eq!(signal.signal_number(), SIGTERM);
        assert_eq!(signal.signal_name(), "SIGTERM");
    }

    #[test]
    fn test_unknown_signal_name() {
        let signal = ShutdownSignal::new();
        signal.trigger(libc::SIGUSR1);
        assert_eq!(signal.signal_name(), "unknown");
    }
}

//! SIGINT/SIGTERM handling for the CLI.
//!
//! Signals only set a flag; the run loop polls it and cancels the execution,
//! so the usual compensating release still happens.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Debug, Clone)]
pub struct SignalHandler {
    stop_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register the OS hooks. Registration failures are
    /// reported on stderr and leave the handler usable programmatically.
    #[must_use]
    pub fn new() -> Self {
        let handler = Self::unregistered();
        for (signal, name) in [(SIGINT, "SIGINT"), (SIGTERM, "SIGTERM")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&handler.stop_flag)) {
                eprintln!("[SLG-SIGNAL] failed to register {name}: {e}");
            }
        }
        handler
    }

    fn unregistered() -> Self {
        Self {
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

//! Cooperative shutdown flag shared between the batch controller and pipeline workers.
//!
//! The flag is an explicit object handed into constructors so tests can inject
//! their own. Signal sources (a key listener, a Ctrl-C handler) live with the
//! caller and only ever call [`ShutdownFlag::request_stop`]. Consumers poll
//! between work units; an in-flight encoder subprocess is never killed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread-safe stop flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    stopped: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Create a new flag in the not-stopped state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop. Idempotent.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// True once a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_not_stopped() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_stopped());
    }

    #[test]
    fn test_request_stop_is_sticky() {
        let flag = ShutdownFlag::new();
        flag.request_stop();
        assert!(flag.is_stopped());
        flag.request_stop();
        assert!(flag.is_stopped());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        other.request_stop();
        assert!(flag.is_stopped());
    }

    #[test]
    fn test_visible_across_threads() {
        let flag = ShutdownFlag::new();
        let writer = flag.clone();

        let handle = thread::spawn(move || {
            writer.request_stop();
        });
        handle.join().unwrap();

        assert!(flag.is_stopped());
    }
}

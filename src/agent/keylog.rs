//! Keylogger seam
//!
//! The capture backend (evdev, hooks, …) is a replaceable boundary; the
//! agent only depends on this trait. Events are delivered on a backend
//! thread; handlers must be non-blocking (they push onto the
//! connection's critical lane and return).

use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub code: u32,
    pub pressed: bool,
    /// Resolved text, e.g. "a", "A", "ENTER".
    pub text: String,
}

pub type KeyEventHandler = Box<dyn Fn(KeyEvent) + Send + Sync>;

pub trait Keylogger: Send + Sync {
    /// Starts capture and returns immediately; events flow to `on_event`
    /// from a background thread. Starting an active logger replaces the
    /// handler.
    fn start(&self, on_event: KeyEventHandler) -> Result<()>;

    /// Stops the backend; bounded to ~100 ms by the backend's poll
    /// timeout.
    fn stop(&self);

    fn is_active(&self) -> bool;
}

/// Placeholder for builds without a capture backend; `start` reports the
/// missing device so the caller can surface `ERROR:Keylog:...`.
pub struct UnsupportedKeylogger;

impl Keylogger for UnsupportedKeylogger {
    fn start(&self, _on_event: KeyEventHandler) -> Result<()> {
        Err(AgentError::DeviceNotFound(
            "no keyboard capture backend available".to_string(),
        ))
    }

    fn stop(&self) {}

    fn is_active(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_unsupported_reports_device_not_found() {
        let logger = UnsupportedKeylogger;
        let result = logger.start(Box::new(|_| {}));
        assert_matches!(result, Err(AgentError::DeviceNotFound(_)));
        assert!(!logger.is_active());
        logger.stop();
    }
}

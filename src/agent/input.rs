//! Synthetic input injection seam
//!
//! Coordinates are normalized 0..1 so the client never needs the remote
//! resolution. The uinput/XTest backends are replaceable boundaries.

use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    /// Wire encoding: 0=Left, 1=Right, 2=Middle.
    pub fn from_code(code: u8) -> Option<MouseButton> {
        match code {
            0 => Some(MouseButton::Left),
            1 => Some(MouseButton::Right),
            2 => Some(MouseButton::Middle),
            _ => None,
        }
    }
}

pub trait InputInjector: Send + Sync {
    /// Moves the pointer to an absolute position, both axes in 0..1.
    fn move_mouse(&self, x: f32, y: f32) -> Result<()>;

    /// Presses (`down = true`) or releases a button.
    fn press_mouse(&self, button: MouseButton, down: bool) -> Result<()>;
}

/// No-device injector; accepts and discards events so remote sessions
/// keep working on headless hosts.
pub struct NullInjector;

impl InputInjector for NullInjector {
    fn move_mouse(&self, x: f32, y: f32) -> Result<()> {
        debug!(x, y, "input backend absent, mouse move discarded");
        Ok(())
    }

    fn press_mouse(&self, button: MouseButton, down: bool) -> Result<()> {
        debug!(?button, down, "input backend absent, mouse button discarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_codes() {
        assert_eq!(MouseButton::from_code(0), Some(MouseButton::Left));
        assert_eq!(MouseButton::from_code(1), Some(MouseButton::Right));
        assert_eq!(MouseButton::from_code(2), Some(MouseButton::Middle));
        assert_eq!(MouseButton::from_code(3), None);
    }
}

//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal dimensions as requested by the SSH peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl TerminalSize {
    /// Create a size in character cells
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Build from the 32-bit values carried by `pty-req` / `window-change`.
    ///
    /// Out-of-range values saturate rather than wrap.
    pub fn from_request(cols: u32, rows: u32, pixel_width: u32, pixel_height: u32) -> Self {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        Self {
            rows: clamp(rows),
            cols: clamp(cols),
            pixel_width: clamp(pixel_width),
            pixel_height: clamp(pixel_height),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_request_saturates() {
        let size = TerminalSize::from_request(120, 40, 70_000, 0);
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 40);
        assert_eq!(size.pixel_width, u16::MAX);
        assert_eq!(size.pixel_height, 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(TerminalSize::default().to_string(), "80x24");
    }
}

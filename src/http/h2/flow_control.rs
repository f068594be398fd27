//! Flow control windows (RFC 7540 section 5.2)
//!
//! A window is signed. Lowering SETTINGS_INITIAL_WINDOW_SIZE shifts every
//! open send window by the same delta and can leave it below zero; DATA is
//! held back until WINDOW_UPDATE brings it above zero again.

use super::error::{Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// 2^31 - 1
const LIMIT: i64 = i32::MAX as i64;

/// One direction of flow control for a stream or the connection.
///
/// Send windows shrink with [`consume`](Self::consume) and grow with the
/// peer's WINDOW_UPDATE. Receive windows shrink with
/// [`receive`](Self::receive) and grow with the updates we send.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial: i64,
    current: i64,
}

impl FlowControlWindow {
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_initial_size(size: u32) -> Self {
        FlowControlWindow {
            initial: i64::from(size),
            current: i64::from(size),
        }
    }

    pub fn size(&self) -> i64 {
        self.current
    }

    /// Zero while the window is exhausted or negative
    pub fn available(&self) -> usize {
        usize::try_from(self.current).unwrap_or(0)
    }

    /// Take up to `wanted` bytes of credit, returning what was granted
    pub fn consume(&mut self, wanted: usize) -> usize {
        let granted = wanted.min(self.available());
        self.current -= granted as i64;
        granted
    }

    /// Charge `amount` received bytes; overrunning the window is an error
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        let left = self.current - amount as i64;
        if left < 0 {
            return Err(Error::FlowControl(format!(
                "{} bytes received, window holds {}",
                amount, self.current
            )));
        }
        self.current = left;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment and return the new size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("WINDOW_UPDATE increment of 0".to_string()));
        }
        self.apply_delta(i64::from(increment))?;
        Ok(self.current)
    }

    /// Shift the window after a SETTINGS_INITIAL_WINDOW_SIZE change
    pub fn apply_delta(&mut self, delta: i64) -> Result<()> {
        let next = self.current + delta;
        if next > LIMIT {
            return Err(Error::FlowControl(format!(
                "window of {} exceeds 2^31-1",
                next
            )));
        }
        self.current = next;
        Ok(())
    }

    /// Increment that refills a receive window once it has dropped below
    /// half of its initial size
    pub fn should_send_window_update(&self) -> Option<u32> {
        if self.current < self.initial / 2 {
            u32::try_from(self.initial - self.current).ok()
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

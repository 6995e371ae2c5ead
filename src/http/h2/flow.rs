//! Flow-control windows.

use super::error::H2Error;
use super::settings::MAX_WINDOW_SIZE;

/// A send or receive window. May go negative after a SETTINGS change
/// shrinks the initial window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    size: i64,
}

impl Window {
    pub fn new(initial: u32) -> Self {
        Self { size: i64::from(initial) }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> u32 {
        self.size.clamp(0, i64::from(MAX_WINDOW_SIZE)) as u32
    }

    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let next = self.size - i64::from(amount);
        if next < 0 {
            return Err(H2Error::FlowControl);
        }
        self.size = next;
        Ok(())
    }

    /// WINDOW_UPDATE. Overflow past 2^31-1 is a flow-control error.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(increment))
    }

    /// Apply a change of SETTINGS_INITIAL_WINDOW_SIZE.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let next = self.size + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControl);
        }
        self.size = next;
        Ok(())
    }
}

/// Receive-side bookkeeping: bytes the consumer has taken but that were not
/// yet returned to the peer.
#[derive(Debug, Clone, Copy)]
pub struct Replenish {
    target: u32,
    unacked: u32,
}

impl Replenish {
    pub fn new(target: u32) -> Self {
        Self { target, unacked: 0 }
    }

    /// Record `len` consumed bytes; returns the WINDOW_UPDATE increment once
    /// at least half of the window has been consumed.
    pub fn release(&mut self, len: u32) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(len);
        if self.unacked >= self.target / 2 {
            Some(std::mem::take(&mut self.unacked))
        } else {
            None
        }
    }
}

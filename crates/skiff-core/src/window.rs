//! Receive window sizing.
//!
//! The receiving side of a transfer decides how many bytes the transmitter
//! may send. The window grows by chunk-sized steps, doubling while in slow
//! start and growing linearly once the first retransmission has been seen.

use crate::config::TransferParameters;

/// Window growth phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitPhase {
    /// Window doubles on every extension
    SlowStart,
    /// Window grows by one chunk per extension
    CongestionAvoidance,
}

/// Reason for recomputing the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// First parameters of a fresh transfer; resets to slow start
    Begin,
    /// First parameters after the start handshake
    FirstParameters,
    /// The current window was consumed or is about to be
    Extend,
    /// Data was lost; shrink the window
    Retransmit,
}

/// Receive window state of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    multiplier: u32,
    phase: TransmitPhase,
    size: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    /// Create a single-chunk window in slow start
    #[must_use]
    pub fn new() -> Self {
        Self {
            multiplier: 1,
            phase: TransmitPhase::SlowStart,
            size: 0,
        }
    }

    /// Current size in bytes
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current multiplier of the chunk size
    #[must_use]
    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> TransmitPhase {
        self.phase
    }

    /// Recompute the window for `action`, bounded by the writer's remaining
    /// capacity, and return the new size
    pub fn update(
        &mut self,
        action: WindowAction,
        params: &TransferParameters,
        write_limit: Option<u64>,
    ) -> u32 {
        let max_chunk = params.max_chunk_size_bytes();
        let max_window = params.max_window_size_bytes();
        let limit = write_limit.map_or(u32::MAX, |l| u32::try_from(l).unwrap_or(u32::MAX));

        if max_chunk > max_window {
            // A single chunk cannot fit; offer whatever capacity is left.
            self.multiplier = 1;
            self.size = max_window.min(limit);
            return self.size;
        }

        let max_multiplier = (max_window / max_chunk.max(1)).max(1);

        match action {
            WindowAction::Begin => {
                self.phase = TransmitPhase::SlowStart;
                self.multiplier = 1;
            }
            WindowAction::FirstParameters => self.multiplier = 1,
            WindowAction::Extend => {
                self.multiplier = match self.phase {
                    TransmitPhase::SlowStart => self.multiplier.saturating_mul(2),
                    TransmitPhase::CongestionAvoidance => self.multiplier.saturating_add(1),
                }
                .min(max_multiplier);
            }
            WindowAction::Retransmit => {
                self.multiplier = (self.multiplier / 2).max(1);
                if self.phase == TransmitPhase::SlowStart {
                    self.phase = TransmitPhase::CongestionAvoidance;
                }
            }
        }

        self.size = self
            .multiplier
            .saturating_mul(max_chunk)
            .min(max_window)
            .min(limit);
        self.size
    }
}

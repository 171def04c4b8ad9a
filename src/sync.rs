//! SYNC: producer/consumer of the SYNC frame, sync-window phase.

use defmt_or_log::warn;

/// Result of a `process_SYNC_RPDO` tick.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No phase change this tick.
    Unchanged,
    /// This tick crossed the SYNC reception boundary: signals RPDO apply +
    /// TPDO trigger.
    SyncReceived,
    /// This tick crossed the window-closed boundary: signals
    /// `clear_pending_sync_PDOs`.
    WindowClosed,
}

/// Producer role: emits a SYNC frame every `cycle_period_us`, with an
/// optional counter that overflows at `counter_overflow` (1..240).
pub struct SyncProducer {
    cycle_period_us: u32,
    elapsed_us: u32,
    counter: Option<u8>,
    counter_overflow: u8,
}

impl SyncProducer {
    pub fn new(cycle_period_us: u32, counter_overflow: Option<u8>) -> Self {
        SyncProducer {
            cycle_period_us,
            elapsed_us: 0,
            counter: counter_overflow.map(|_| 0),
            counter_overflow: counter_overflow.unwrap_or(0),
        }
    }

    /// Advance by `dt_us`; returns `Some(counter_byte)` (or `Some(0)` if no
    /// counter is configured) exactly on ticks where a SYNC frame is due.
    pub fn process(&mut self, dt_us: u32) -> Option<u8> {
        self.elapsed_us += dt_us;
        if self.elapsed_us < self.cycle_period_us {
            return None;
        }
        self.elapsed_us -= self.cycle_period_us;
        let byte = if let Some(counter) = &mut self.counter {
            *counter += 1;
            if *counter > self.counter_overflow {
                *counter = 1;
            }
            *counter
        } else {
            0
        };
        Some(byte)
    }
}

/// Consumer role: tracks `time_since_sync` and whether we're still inside
/// the synchronous window.
pub struct SyncConsumer {
    window_len_us: u32,
    time_since_sync_us: u32,
    inside_window: bool,
    sync_pending: bool,
    expected_period_us: u32,
    tolerance_us: u32,
    last_period_us: Option<u32>,
    sync_timed_out: bool,
}

impl SyncConsumer {
    pub fn new(window_len_us: u32, expected_period_us: u32, tolerance_us: u32) -> Self {
        SyncConsumer {
            window_len_us,
            time_since_sync_us: 0,
            inside_window: false,
            sync_pending: false,
            expected_period_us,
            tolerance_us,
            last_period_us: None,
            sync_timed_out: false,
        }
    }

    /// Called from the CAN dispatch path when a SYNC frame arrives.
    /// Checks the inter-arrival period against `expected_period_us` +-
    /// `tolerance_us`; raises a caller-visible failure flag on repeated
    /// deviation, cleared again once the phase is re-established.
    pub fn on_sync_received(&mut self) {
        if let Some(last) = self.last_period_us {
            let actual = self.time_since_sync_us;
            let delta = actual.abs_diff(last);
            if delta > self.tolerance_us {
                warn!("SYNC period deviation: expected~{} actual={}", last, actual);
                self.sync_timed_out = true;
            } else {
                self.sync_timed_out = false;
            }
        }
        self.last_period_us = Some(self.time_since_sync_us.max(self.expected_period_us));
        self.time_since_sync_us = 0;
        self.sync_pending = true;
        self.inside_window = true;
    }

    /// Returns true if synchronous PDOs should currently be held off due to
    /// a detected SYNC phase failure.
    pub fn sync_timed_out(&self) -> bool {
        self.sync_timed_out
    }

    /// Advances the phase clock, returns the boundary crossed this tick, if
    /// any.
    pub fn process(&mut self, dt_us: u32) -> SyncPhase {
        self.time_since_sync_us += dt_us;

        if self.sync_pending {
            self.sync_pending = false;
            return SyncPhase::SyncReceived;
        }

        if self.inside_window && self.time_since_sync_us > self.window_len_us {
            self.inside_window = false;
            return SyncPhase::WindowClosed;
        }

        SyncPhase::Unchanged
    }
}

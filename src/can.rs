//! CAN module: RX filter table, TX buffer table, dispatch and scan.
//!
//! Mirrors the reference CANopenNode stack's aligned-filter encoding
//! (`((msg ^ ident) & mask) == 0`, `ids::align_ident`/`align_mask`) and its
//! `bufferFull` TX bookkeeping, generalized to a caller-sized table instead
//! of a hardcoded pair of CAN interfaces.

use defmt_or_log::{debug, warn};
use embedded_can::{Id, StandardId};

use crate::error::ApiError;
use crate::frame::CanFrame;
use crate::ids::{align_ident, align_mask};

/// Driver collaborator contract: the low-level "send one frame" and
/// mode-switch primitives the core needs from the hardware/host binding.
/// Expressed as a generic parameter rather than a trait object so the core
/// never pays for dynamic dispatch on the hot path, the same way a
/// hardware-backed CAN controller is generic over its instance type rather
/// than boxed behind a trait object.
pub trait Driver {
    type Error;

    /// Put the controller into configuration mode (no bus traffic) prior to
    /// filter/bitrate setup.
    fn set_configuration_mode(&mut self);

    /// Leave configuration mode and join the bus.
    fn set_normal_mode(&mut self);

    /// Release any hardware resources. Called by the node's explicit
    /// teardown operation, never by `Drop`.
    fn module_deinit(&mut self);

    /// Attempt to push one frame into a hardware mailbox. Returns
    /// `Err(nb::Error::WouldBlock)` if no mailbox is currently free.
    fn send_frame(&mut self, frame: &CanFrame) -> nb::Result<(), Self::Error>;

    /// Read the controller error/status register for `verify_errors`.
    fn read_error_status(&mut self) -> ControllerStatus;
}

/// Edge-detectable controller status bits, polled by `verify_errors`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerStatus {
    pub bus_warning: bool,
    pub bus_passive: bool,
    pub bus_off: bool,
    pub rx_overrun: bool,
}

/// One RX filter table slot. The callback slot is populated iff the entry
/// is live; a cleared slot's `ident`/`mask` are irrelevant because
/// `live == false` always fails the match in `dispatch`.
#[derive(Clone, Copy)]
struct RxFilter {
    live: bool,
    aligned_ident: u16,
    aligned_mask: u16,
    subscriber: usize,
}

impl Default for RxFilter {
    fn default() -> Self {
        RxFilter {
            live: false,
            aligned_ident: 0,
            aligned_mask: 0,
            subscriber: 0,
        }
    }
}

/// One TX buffer table slot.
#[derive(Clone, Copy)]
struct TxBuffer {
    configured: bool,
    ident: u16,
    rtr: bool,
    dlc: u8,
    data: [u8; 8],
    buffer_full: bool,
    sync_flag: bool,
}

impl Default for TxBuffer {
    fn default() -> Self {
        TxBuffer {
            configured: false,
            ident: 0,
            rtr: false,
            dlc: 0,
            data: [0u8; 8],
            buffer_full: false,
            sync_flag: false,
        }
    }
}

/// Opaque handle into the TX buffer table returned by `tx_buffer_init`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxHandle(usize);

/// Caller-visible event delivered by `dispatch` alongside the frame, used by
/// `Node` to route the matched frame to the right subsystem without a
/// second filter-table pass.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMatch {
    pub subscriber: usize,
    pub rtr: bool,
    pub dlc: u8,
    pub data: [u8; 8],
}

/// CAN module owning the RX filter and TX buffer tables for one node
/// instance. `RX_SLOTS`/`TX_SLOTS` are sized by the caller at the total
/// filter/TX slot count computed from `ids::RxSlot`/`ids::TxSlot`.
pub struct CanModule<D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize> {
    driver: D,
    rx_table: [RxFilter; RX_SLOTS],
    tx_table: [TxBuffer; TX_SLOTS],
    pending_count: usize,
    normal: bool,
    last_status: ControllerStatus,
}

impl<D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize> CanModule<D, RX_SLOTS, TX_SLOTS> {
    /// Bind a hardware handle, clear all flags and leave `normal == false`.
    /// Bitrate validation happens in the driver, not here: actual bit-timing
    /// programming is the driver's job via `set_configuration_mode`.
    pub fn new(driver: D) -> Self {
        CanModule {
            driver,
            rx_table: [RxFilter::default(); RX_SLOTS],
            tx_table: [TxBuffer::default(); TX_SLOTS],
            pending_count: 0,
            normal: false,
            last_status: ControllerStatus::default(),
        }
    }

    /// Install a filter at a caller-chosen slot.
    /// Callers use the index builders in `ids::RxSlot` so every
    /// communication object lives at a known, allocation-free index.
    pub fn rx_register(
        &mut self,
        index: usize,
        ident: u16,
        mask: u16,
        rtr: bool,
        subscriber: usize,
    ) -> Result<(), ApiError> {
        let slot = self.rx_table.get_mut(index).ok_or(ApiError::IllegalArgument)?;
        slot.live = true;
        slot.aligned_ident = align_ident(ident, rtr);
        slot.aligned_mask = align_mask(mask, true);
        slot.subscriber = subscriber;
        Ok(())
    }

    /// Prepare a reusable TX slot.
    pub fn tx_buffer_init(
        &mut self,
        index: usize,
        ident: u16,
        rtr: bool,
        dlc: u8,
        sync_flag: bool,
    ) -> Result<TxHandle, ApiError> {
        if dlc > 8 {
            return Err(ApiError::IllegalArgument);
        }
        let slot = self.tx_table.get_mut(index).ok_or(ApiError::IllegalArgument)?;
        slot.configured = true;
        slot.ident = ident;
        slot.rtr = rtr;
        slot.dlc = dlc;
        slot.buffer_full = false;
        slot.sync_flag = sync_flag;
        Ok(TxHandle(index))
    }

    /// Enter normal (bus-joined) mode after filters/mailboxes are set up.
    pub fn set_normal_mode(&mut self) {
        self.driver.set_normal_mode();
        self.normal = true;
    }

    /// Write `data` into a prepared TX buffer and attempt immediate send.
    /// Returns `Err(ApiError::TxOverflow)` if the buffer was already full, in
    /// which case the caller (normally the EMCY module) raises
    /// `CAN_OVERRUN` unless this is the still-unsent boot-up frame.
    pub fn send(&mut self, handle: TxHandle, data: &[u8]) -> Result<(), ApiError> {
        let slot = self
            .tx_table
            .get_mut(handle.0)
            .ok_or(ApiError::TxUnconfigured)?;
        if !slot.configured {
            return Err(ApiError::TxUnconfigured);
        }
        if slot.buffer_full {
            return Err(ApiError::TxOverflow);
        }
        let dlc = data.len().min(8);
        slot.data[..dlc].copy_from_slice(&data[..dlc]);
        slot.dlc = dlc as u8;

        let id = StandardId::new(slot.ident & 0x7FF).ok_or(ApiError::IllegalArgument)?;
        let frame = if slot.rtr {
            CanFrame::new_remote(slot.ident, slot.dlc)
        } else {
            CanFrame::new_standard(slot.ident, &slot.data[..dlc])
        }
        .ok_or(ApiError::IllegalArgument)?;
        let _ = Id::Standard(id);

        match self.driver.send_frame(&frame) {
            Ok(()) => Ok(()),
            Err(nb::Error::WouldBlock) => {
                slot.buffer_full = true;
                self.pending_count += 1;
                Ok(())
            }
            Err(nb::Error::Other(_)) => Err(ApiError::TxOverflow),
        }
    }

    /// Drop all `sync_flag=true` pending transmits, called when the SYNC
    /// window closes with frames still queued.
    pub fn clear_pending_sync_pdos(&mut self) {
        for slot in self.tx_table.iter_mut() {
            if slot.buffer_full && slot.sync_flag {
                slot.buffer_full = false;
                self.pending_count = self.pending_count.saturating_sub(1);
            }
        }
    }

    /// RX dispatch: linear scan of the filter table, first match wins.
    /// Called once per delivered frame from the CAN RX ISR context.
    pub fn dispatch(&self, ident: u16, rtr: bool, dlc: u8, data: &[u8; 8]) -> Option<RxMatch> {
        let msg = align_ident(ident, rtr);
        for filter in self.rx_table.iter() {
            if !filter.live {
                continue;
            }
            if (msg ^ filter.aligned_ident) & filter.aligned_mask == 0 {
                return Some(RxMatch {
                    subscriber: filter.subscriber,
                    rtr,
                    dlc,
                    data: *data,
                });
            }
        }
        None
    }

    /// TX scan: find any `buffer_full` slot, clear it, push to the driver.
    /// Called from the TX-mailbox-empty ISR context.
    pub fn tx_scan(&mut self) {
        for slot in self.tx_table.iter_mut() {
            if !slot.buffer_full {
                continue;
            }
            let id = match StandardId::new(slot.ident & 0x7FF) {
                Some(id) => id,
                None => continue,
            };
            let frame = if slot.rtr {
                CanFrame::new_remote(slot.ident, slot.dlc)
            } else {
                CanFrame::new_standard(slot.ident, &slot.data[..slot.dlc as usize])
            };
            let frame = match frame {
                Some(f) => f,
                None => continue,
            };
            let _ = Id::Standard(id);
            match self.driver.send_frame(&frame) {
                Ok(()) => {
                    slot.buffer_full = false;
                    self.pending_count = self.pending_count.saturating_sub(1);
                    return;
                }
                Err(nb::Error::WouldBlock) => return,
                Err(nb::Error::Other(_)) => {
                    slot.buffer_full = false;
                    self.pending_count = self.pending_count.saturating_sub(1);
                    return;
                }
            }
        }
    }

    /// Poll controller status, edge-detect changes. Returns the bits that
    /// newly became true this call so the caller (EMCY) can raise the
    /// matching codes without re-deriving edges itself.
    pub fn verify_errors(&mut self) -> ControllerStatus {
        let status = self.driver.read_error_status();
        let rising = ControllerStatus {
            bus_warning: status.bus_warning && !self.last_status.bus_warning,
            bus_passive: status.bus_passive && !self.last_status.bus_passive,
            bus_off: status.bus_off && !self.last_status.bus_off,
            rx_overrun: status.rx_overrun,
        };
        if rising.bus_warning || rising.bus_passive || rising.bus_off {
            warn!(
                "CAN controller status edge: warning={} passive={} off={}",
                status.bus_warning, status.bus_passive, status.bus_off
            );
        } else {
            debug!("CAN controller status poll");
        }
        self.last_status = status;
        rising
    }

    pub fn is_normal(&self) -> bool {
        self.normal
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec as HVec;

    struct MockDriver {
        sent: HVec<CanFrame, 32>,
        would_block_once: bool,
    }

    impl MockDriver {
        fn new() -> Self {
            MockDriver {
                sent: HVec::new(),
                would_block_once: false,
            }
        }
    }

    impl Driver for MockDriver {
        type Error = ();

        fn set_configuration_mode(&mut self) {}
        fn set_normal_mode(&mut self) {}
        fn module_deinit(&mut self) {}

        fn send_frame(&mut self, frame: &CanFrame) -> nb::Result<(), Self::Error> {
            if self.would_block_once {
                self.would_block_once = false;
                return Err(nb::Error::WouldBlock);
            }
            self.sent.push(*frame).map_err(|_| nb::Error::Other(()))?;
            Ok(())
        }

        fn read_error_status(&mut self) -> ControllerStatus {
            ControllerStatus::default()
        }
    }

    #[test]
    fn dispatch_matches_first_live_filter() {
        let mut can: CanModule<MockDriver, 4, 4> = CanModule::new(MockDriver::new());
        can.rx_register(0, 0x000, 0x7FF, false, 99).unwrap();
        can.rx_register(1, 0x080, 0x7FF, false, 100).unwrap();

        let m = can.dispatch(0x080, false, 0, &[0u8; 8]).unwrap();
        assert_eq!(m.subscriber, 100);

        assert!(can.dispatch(0x123, false, 0, &[0u8; 8]).is_none());
    }

    #[test]
    fn send_marks_buffer_full_on_would_block_then_tx_scan_flushes() {
        let mut driver = MockDriver::new();
        driver.would_block_once = true;
        let mut can: CanModule<MockDriver, 4, 4> = CanModule::new(driver);
        let h = can.tx_buffer_init(0, 0x123, false, 2, false).unwrap();
        can.send(h, &[1, 2]).unwrap();
        assert_eq!(can.pending_count(), 1);

        can.tx_scan();
        assert_eq!(can.pending_count(), 0);
        assert_eq!(can.driver_mut().sent.len(), 1);
    }

    #[test]
    fn send_on_full_buffer_is_tx_overflow() {
        let mut driver = MockDriver::new();
        driver.would_block_once = true;
        let mut can: CanModule<MockDriver, 4, 4> = CanModule::new(driver);
        let h = can.tx_buffer_init(0, 0x123, false, 2, false).unwrap();
        can.send(h, &[1, 2]).unwrap();
        assert_eq!(can.send(h, &[3, 4]), Err(ApiError::TxOverflow));
    }

    #[test]
    fn clear_pending_sync_pdos_drops_only_flagged_slots() {
        let mut driver = MockDriver::new();
        driver.would_block_once = true;
        let mut can: CanModule<MockDriver, 4, 4> = CanModule::new(driver);
        let h = can.tx_buffer_init(0, 0x123, false, 1, true).unwrap();
        can.send(h, &[1]).unwrap();
        assert_eq!(can.pending_count(), 1);
        can.clear_pending_sync_pdos();
        assert_eq!(can.pending_count(), 0);
    }
}

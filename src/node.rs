//! Node instance: owns every subsystem and exposes the three tick entry
//! points plus the application-facing send/configure API. This is the
//! wiring layer the rest of the crate is built to be driven by; it has no
//! interesting algorithm of its own, just the fixed RX-filter/TX-buffer
//! slot layout and the dispatch table tying a received frame's subscriber
//! slot back to the subsystem that owns it.

use defmt_or_log::info;

use crate::can::{CanModule, Driver, TxHandle};
use crate::emcy::{EmcySink, Emergency, ErrorBit};
use crate::error::ApiError;
use crate::ids::{self, NodeId, RxSlot, TxSlot};
use crate::nmt::{HeartbeatConsumer, HeartbeatProducer, Nmt, NmtCommand, NmtSideEffect, NmtState};
use crate::od::ObjectDictionary;
use crate::pdo::{PdoMapping, Rpdo, Tpdo};
use crate::sdo::SdoServer;
use crate::sync::{SyncConsumer, SyncPhase, SyncProducer};

/// Everything a caller must decide once, at `Node::new` time, that this
/// crate can't infer from the object dictionary alone.
pub struct NodeConfig {
    pub sync_cycle_period_us: u32,
    pub sync_counter_overflow: Option<u8>,
    pub sync_window_len_us: u32,
    pub sync_tolerance_us: u32,
    pub heartbeat_producer_period_ms: u32,
    pub emcy_inhibit_time_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            sync_cycle_period_us: 0,
            sync_counter_overflow: None,
            sync_window_len_us: 0,
            sync_tolerance_us: 0,
            heartbeat_producer_period_ms: 0,
            emcy_inhibit_time_ms: 100,
        }
    }
}

struct CanSink<'a, D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize> {
    can: &'a mut CanModule<D, RX_SLOTS, TX_SLOTS>,
    handle: TxHandle,
}

impl<'a, D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize> EmcySink for CanSink<'a, D, RX_SLOTS, TX_SLOTS> {
    fn send_emcy(&mut self, code: u16, error_register: u8, info: &[u8; 5]) {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&code.to_le_bytes());
        data[2] = error_register;
        data[3..8].copy_from_slice(info);
        let _ = self.can.send(self.handle, &data);
    }
}

/// One CANopen node instance: the object dictionary is borrowed for the
/// node's lifetime, so the handle's ownership/borrowing is ordinary Rust
/// rather than a manually managed handle table.
pub struct Node<'od, D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize, const N_RPDO: usize, const N_TPDO: usize> {
    node_id: NodeId,
    od: &'od mut ObjectDictionary<'od>,
    can: CanModule<D, RX_SLOTS, TX_SLOTS>,
    nmt: Nmt,
    emergency: Emergency,
    sdo: SdoServer,
    sync_producer: Option<SyncProducer>,
    sync_consumer: SyncConsumer,
    hb_producer: HeartbeatProducer,
    hb_consumer: HeartbeatConsumer,
    rpdo: [Rpdo; N_RPDO],
    tpdo: [Tpdo; N_TPDO],
    emcy_tx: TxHandle,
    sync_tx: TxHandle,
    nmt_master_tx: TxHandle,
    sdo_resp_tx: TxHandle,
    hb_tx: TxHandle,
    tpdo_tx: [TxHandle; N_TPDO],
    uptime_ms: u32,
}

impl<'od, D: Driver, const RX_SLOTS: usize, const TX_SLOTS: usize, const N_RPDO: usize, const N_TPDO: usize>
    Node<'od, D, RX_SLOTS, TX_SLOTS, N_RPDO, N_TPDO>
{
    /// Binds the driver, sets up every fixed filter and TX buffer at its
    /// canonical slot (`ids::RxSlot`/`ids::TxSlot`), and leaves the node in
    /// `Initializing` until [`Node::boot`] is called.
    pub fn new(
        node_id: NodeId,
        driver: D,
        od: &'od mut ObjectDictionary<'od>,
        config: NodeConfig,
    ) -> Result<Self, ApiError> {
        let mut can = CanModule::new(driver);

        can.rx_register(RxSlot::NMT, ids::NMT_COMMAND_ID, 0x7FF, false, RxSlot::NMT)?;
        can.rx_register(RxSlot::SYNC, ids::sync_id(), 0x7FF, false, RxSlot::SYNC)?;
        let rpdo_array: [Rpdo; N_RPDO] = core::array::from_fn(|n| Rpdo::new(ids::rpdo_id(node_id, n).unwrap_or(0) as u32));
        for n in 0..N_RPDO {
            let ident = ids::rpdo_id(node_id, n).ok_or(ApiError::IllegalArgument)?;
            can.rx_register(RxSlot::rpdo(n), ident, 0x7FF, false, RxSlot::rpdo(n))?;
        }
        let sdo_server_slot = RxSlot::sdo_server(N_RPDO, 0);
        can.rx_register(sdo_server_slot, ids::sdo_request_id(node_id), 0x7FF, false, sdo_server_slot)?;

        let nmt_master_tx = can.tx_buffer_init(TxSlot::NMT_MASTER, ids::NMT_COMMAND_ID, false, 2, false)?;
        let sync_tx = can.tx_buffer_init(
            TxSlot::SYNC,
            ids::sync_id(),
            false,
            if config.sync_counter_overflow.is_some() { 1 } else { 0 },
            false,
        )?;
        let emcy_tx = can.tx_buffer_init(TxSlot::EMCY, ids::emcy_id(node_id), false, 8, false)?;
        let mut tpdo_tx_vec = [TxHandle::default(); N_TPDO];
        let tpdo_array: [Tpdo; N_TPDO] = core::array::from_fn(|n| Tpdo::new(ids::tpdo_id(node_id, n).unwrap_or(0) as u32));
        for n in 0..N_TPDO {
            let ident = ids::tpdo_id(node_id, n).ok_or(ApiError::IllegalArgument)?;
            tpdo_tx_vec[n] = can.tx_buffer_init(TxSlot::tpdo(n), ident, false, 8, true)?;
            let rtr_slot = RxSlot::tpdo_rtr(N_RPDO, 1, 0, crate::nmt::MAX_HB_CONSUMERS, n);
            can.rx_register(rtr_slot, ident, 0x7FF, true, rtr_slot)?;
        }
        let sdo_resp_tx = can.tx_buffer_init(
            TxSlot::sdo_server_resp(N_TPDO, 0),
            ids::sdo_response_id(node_id),
            false,
            8,
            false,
        )?;
        let hb_tx = can.tx_buffer_init(TxSlot::hb(N_TPDO, 1, 0), ids::heartbeat_id(node_id), false, 1, false)?;

        Ok(Node {
            node_id,
            od,
            can,
            nmt: Nmt::new(node_id),
            emergency: Emergency::new(config.emcy_inhibit_time_ms),
            sdo: SdoServer::new(node_id),
            sync_producer: (config.sync_cycle_period_us > 0)
                .then(|| SyncProducer::new(config.sync_cycle_period_us, config.sync_counter_overflow)),
            sync_consumer: SyncConsumer::new(config.sync_window_len_us, config.sync_cycle_period_us, config.sync_tolerance_us),
            hb_producer: HeartbeatProducer::new(config.heartbeat_producer_period_ms),
            hb_consumer: HeartbeatConsumer::new(),
            rpdo: rpdo_array,
            tpdo: tpdo_array,
            emcy_tx,
            sync_tx,
            nmt_master_tx,
            sdo_resp_tx,
            hb_tx,
            tpdo_tx: tpdo_tx_vec,
            uptime_ms: 0,
        })
    }

    /// Explicit teardown (no `Drop`, by design — the driver's resources are
    /// released on an explicit call so the caller controls exactly when the
    /// hardware is released). Releases the driver's hardware resources.
    pub fn delete(mut self) {
        self.can.driver_mut().module_deinit();
    }

    pub fn state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Emits the boot-up frame and enters pre-operational, then joins the
    /// bus.
    pub fn boot(&mut self) {
        let (_ident, data) = self.nmt.boot();
        let _ = self.can.send(self.hb_tx, &data);
        self.can.set_normal_mode();
    }

    /// Install or replace an RPDO's mapping table; `n` indexes `ids::RPDO_BASE_IDS`.
    pub fn configure_rpdo(&mut self, n: usize, valid: bool, mapping: &[PdoMapping]) -> Result<(), ApiError> {
        let rpdo = self.rpdo.get_mut(n).ok_or(ApiError::IllegalArgument)?;
        rpdo.compile_mapping(self.od, mapping)?;
        rpdo.valid = valid;
        Ok(())
    }

    /// Install or replace a TPDO's mapping table; `n` indexes `ids::TPDO_BASE_IDS`.
    pub fn configure_tpdo(&mut self, n: usize, valid: bool, mapping: &[PdoMapping]) -> Result<(), ApiError> {
        let tpdo = self.tpdo.get_mut(n).ok_or(ApiError::IllegalArgument)?;
        tpdo.compile_mapping(self.od, mapping)?;
        tpdo.valid = valid;
        Ok(())
    }

    /// Add a heartbeat consumer watchdog for `monitored_node_id`; registers
    /// the matching RX filter at the next free HB-consumer slot.
    pub fn monitor_heartbeat(&mut self, slot_index: usize, monitored_node_id: u8, window_ms: u32) -> Result<(), ApiError> {
        let rx_slot = RxSlot::hb_consumer(N_RPDO, 1, 0, slot_index);
        self.can.rx_register(
            rx_slot,
            ids::heartbeat_id(NodeId::new(monitored_node_id)?),
            0x7FF,
            false,
            rx_slot,
        )?;
        self.hb_consumer.monitor(monitored_node_id, window_ms)
    }

    /// Application-initiated NMT command: transmits the command frame and
    /// applies it locally (NMT masters loop back their own command rather
    /// than waiting to receive it again).
    pub fn send_nmt_command(&mut self, command: NmtCommand, target: u8) -> NmtSideEffect {
        let data = [command.to_byte(), target];
        let _ = self.can.send(self.nmt_master_tx, &data);
        if target == 0 || target == self.node_id.get() {
            self.nmt.apply_command(command, self.emergency.error_register() != 0)
        } else {
            NmtSideEffect::None
        }
    }

    /// Route one received frame by RX-filter subscriber slot. Call after
    /// `CanModule::dispatch` returns a match.
    ///
    /// While the node is in NMT state `Stopped`, only the NMT and heartbeat
    /// services stay active: SYNC, RPDO and RTR-triggered TPDO activity are
    /// dropped here rather than in each subsystem, since SDO already
    /// self-gates in `SdoServer::handle_frame`.
    pub fn on_rx_match(&mut self, subscriber: usize, dlc: u8, data: &[u8; 8]) -> Result<(), ApiError> {
        if subscriber == RxSlot::NMT {
            if let Some(cmd) = NmtCommand::from_byte(data[0]) {
                self.nmt.handle_command(cmd, data[1], self.emergency.error_register() != 0);
            }
            return Ok(());
        }
        let stopped = self.nmt.state() == NmtState::Stopped;
        if subscriber == RxSlot::SYNC {
            if !stopped {
                self.sync_consumer.on_sync_received();
            }
            return Ok(());
        }
        for n in 0..N_RPDO {
            if subscriber == RxSlot::rpdo(n) {
                if stopped {
                    return Ok(());
                }
                self.rpdo[n].on_frame(dlc, data)?;
                if self.rpdo[n].transmission_type == crate::pdo::RpdoTransmissionType::Event {
                    self.rpdo[n].apply_to(self.od)?;
                }
                return Ok(());
            }
        }
        let sdo_server_slot = RxSlot::sdo_server(N_RPDO, 0);
        if subscriber == sdo_server_slot {
            if let Some(resp) = self.sdo.handle_frame(self.od, self.nmt.state(), data) {
                let _ = self.can.send(self.sdo_resp_tx, &resp.data);
            }
            return Ok(());
        }
        for idx in 0..crate::nmt::MAX_HB_CONSUMERS {
            if subscriber == RxSlot::hb_consumer(N_RPDO, 1, 0, idx) {
                self.hb_consumer.on_heartbeat(self.node_id.get(), data[0]);
                return Ok(());
            }
        }
        for n in 0..N_TPDO {
            let rtr_slot = RxSlot::tpdo_rtr(N_RPDO, 1, 0, crate::nmt::MAX_HB_CONSUMERS, n);
            if subscriber == rtr_slot {
                if !stopped {
                    if let Some((payload, len)) = self.tpdo[n].respond_to_rtr(self.od) {
                        let _ = self.can.send(self.tpdo_tx[n], &payload[..len as usize]);
                    }
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// The millisecond-granularity tick. Advances NMT heartbeat timers, the
    /// SDO session timeout, and heartbeat-consumer watchdogs; raises `EMCY
    /// HEARTBEAT` for nodes that newly timed out.
    pub fn process(&mut self, dt_ms: u32) {
        self.uptime_ms = self.uptime_ms.wrapping_add(dt_ms);
        if let Some(byte) = self.hb_producer.process(dt_ms, self.nmt.state()) {
            let _ = self.can.send(self.hb_tx, &[byte]);
        }
        if let Some(resp) = self.sdo.process(dt_ms) {
            let _ = self.can.send(self.sdo_resp_tx, &resp.data);
        }
        let timed_out = self.hb_consumer.process(dt_ms);
        if !timed_out.is_empty() {
            let mut sink = CanSink { can: &mut self.can, handle: self.emcy_tx };
            self.emergency.error_report(
                &mut sink,
                ErrorBit::Communication,
                crate::nmt::EMCY_HEARTBEAT_CODE,
                [0; 5],
                self.uptime_ms,
            );
        }
        let rising = self.can.verify_errors();
        if rising.bus_off {
            let mut sink = CanSink { can: &mut self.can, handle: self.emcy_tx };
            self.emergency.error_report(
                &mut sink,
                ErrorBit::Communication,
                crate::emcy::EmcyCode::BusOffRecovered as u16,
                [0; 5],
                self.uptime_ms,
            );
        }
    }

    /// The microsecond-granularity SYNC phase tick. On `SyncReceived`,
    /// applies every buffered synchronous RPDO; on `WindowClosed`, drops
    /// pending synchronous TX. A no-op while `Stopped`: no SYNC is produced
    /// or consumed, and no RPDO is applied.
    pub fn process_sync_rpdo(&mut self, dt_us: u32) -> SyncPhase {
        if self.nmt.state() == NmtState::Stopped {
            return SyncPhase::Unchanged;
        }
        if let Some(producer) = &mut self.sync_producer {
            if producer.process(dt_us).is_some() {
                let _ = self.can.send(self.sync_tx, &[]);
            }
        }
        let phase = self.sync_consumer.process(dt_us);
        match phase {
            SyncPhase::SyncReceived => {
                for rpdo in &mut self.rpdo {
                    if rpdo.transmission_type == crate::pdo::RpdoTransmissionType::Synchronous {
                        let _ = rpdo.apply_to(self.od);
                    }
                }
            }
            SyncPhase::WindowClosed => {
                self.can.clear_pending_sync_pdos();
            }
            SyncPhase::Unchanged => {}
        }
        phase
    }

    /// Advances every TPDO's timers and transmits whichever are due this
    /// tick. A no-op while `Stopped`: no TPDO is transmitted.
    pub fn process_tpdo(&mut self, dt_us: u32, sync_occurred: bool) {
        if self.nmt.state() == NmtState::Stopped {
            return;
        }
        for (n, tpdo) in self.tpdo.iter_mut().enumerate() {
            if let Some((payload, len)) = tpdo.process(self.od, dt_us, sync_occurred) {
                let _ = self.can.send(self.tpdo_tx[n], &payload[..len as usize]);
            }
        }
    }

    pub fn error_register(&self) -> u8 {
        self.emergency.error_register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Bounds, OdEntry};
    use embedded_can::Frame as _;
    use heapless::Vec as HVec;

    /// Records every frame handed to `send_frame`, mirroring `can.rs`'s own
    /// test `MockDriver`, so these tests can assert on the actual bytes a
    /// `Node` puts on the wire instead of only its internal state.
    struct MockDriver {
        sent: HVec<crate::frame::CanFrame, 32>,
    }

    impl MockDriver {
        fn new() -> Self {
            MockDriver { sent: HVec::new() }
        }
    }

    impl Driver for MockDriver {
        type Error = ();
        fn set_configuration_mode(&mut self) {}
        fn set_normal_mode(&mut self) {}
        fn module_deinit(&mut self) {}
        fn send_frame(&mut self, frame: &crate::frame::CanFrame) -> nb::Result<(), Self::Error> {
            self.sent.push(*frame).map_err(|_| nb::Error::Other(()))?;
            Ok(())
        }
        fn read_error_status(&mut self) -> crate::can::ControllerStatus {
            crate::can::ControllerStatus::default()
        }
    }

    #[test]
    fn boot_enters_preoperational_and_joins_bus() {
        let mut storage: [u8; 0] = [];
        let mut entries: [OdEntry; 0] = [];
        let _ = (&mut storage, AccessType::NONE, Bounds::None);
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let config = NodeConfig::default();
        let mut node: Node<MockDriver, 8, 8, 0, 0> =
            Node::new(NodeId::new(5).unwrap(), MockDriver::new(), &mut od, config).unwrap();
        node.boot();
        assert_eq!(node.state(), NmtState::PreOperational);
        assert!(node.can.is_normal());
    }

    #[test]
    fn boot_sends_bootup_frame_on_the_heartbeat_object() {
        // The boot-up frame and a heartbeat are the same wire object per
        // CiA-301 (ident 0x700+nodeID, one state byte) — only the first one
        // sent after power-on is "boot-up" by convention.
        let mut storage: [u8; 0] = [];
        let mut entries: [OdEntry; 0] = [];
        let _ = (&mut storage, AccessType::NONE, Bounds::None);
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let config = NodeConfig::default();
        let mut node: Node<MockDriver, 8, 8, 0, 0> =
            Node::new(NodeId::new(5).unwrap(), MockDriver::new(), &mut od, config).unwrap();
        node.boot();

        let sent = &node.can.driver_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].standard_ident(), Some(0x705));
        assert_eq!(sent[0].data(), &[0x00]);
    }

    #[test]
    fn stopped_state_silences_tpdo_but_not_heartbeat() {
        let mut storage = [5u8; 1];
        let mut entries = [OdEntry {
            index: 0x6000,
            sub: 1,
            access: AccessType::READ_WRITE,
            mappable: true,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut config = NodeConfig::default();
        config.heartbeat_producer_period_ms = 100;
        let mut node: Node<MockDriver, 8, 8, 0, 1> =
            Node::new(NodeId::new(5).unwrap(), MockDriver::new(), &mut od, config).unwrap();
        node.boot();
        node.configure_tpdo(0, true, &[PdoMapping { index: 0x6000, sub: 1, bit_length: 8 }]).unwrap();
        node.send_nmt_command(NmtCommand::EnterStopped, 0);
        assert_eq!(node.state(), NmtState::Stopped);

        node.can.driver_mut().sent.clear();
        node.process_tpdo(1_000_000, false);
        node.process(200);

        let sent = &node.can.driver_mut().sent;
        assert_eq!(sent.len(), 1, "only the heartbeat should have been sent while stopped");
        assert_eq!(sent[0].standard_ident(), Some(0x705));
        assert_eq!(sent[0].data(), &[NmtState::Stopped.wire_byte()]);
    }

    #[test]
    fn stopped_state_drops_rpdo_frames_before_the_mapping_check() {
        let mut storage = [0u8; 1];
        let mut entries = [OdEntry {
            index: 0x6002,
            sub: 1,
            access: AccessType::READ_WRITE,
            mappable: true,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let config = NodeConfig::default();
        let mut node: Node<MockDriver, 8, 8, 1, 0> =
            Node::new(NodeId::new(5).unwrap(), MockDriver::new(), &mut od, config).unwrap();
        node.boot();
        node.configure_rpdo(0, true, &[PdoMapping { index: 0x6002, sub: 1, bit_length: 8 }]).unwrap();

        let ident = crate::ids::rpdo_id(NodeId::new(5).unwrap(), 0).unwrap();
        let short = [0u8; 8];
        let m = node.can.dispatch(ident, false, 0, &short).unwrap();

        // Pre-operational: a too-short RPDO frame is rejected.
        assert_eq!(node.on_rx_match(m.subscriber, m.dlc, &m.data), Err(ApiError::RxPdoLength));

        // Stopped: the very same frame is dropped before the mapping check
        // ever runs.
        node.send_nmt_command(NmtCommand::EnterStopped, 0);
        assert_eq!(node.on_rx_match(m.subscriber, m.dlc, &m.data), Ok(()));
    }

    #[test]
    fn tpdo_rtr_filter_responds_with_current_value() {
        let mut storage = [7u8; 1];
        let mut entries = [OdEntry {
            index: 0x6001,
            sub: 1,
            access: AccessType::READ_WRITE,
            mappable: true,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let config = NodeConfig::default();
        let mut node: Node<MockDriver, 8, 8, 0, 1> =
            Node::new(NodeId::new(5).unwrap(), MockDriver::new(), &mut od, config).unwrap();
        node.boot();
        node.configure_tpdo(0, true, &[PdoMapping { index: 0x6001, sub: 1, bit_length: 8 }]).unwrap();
        node.tpdo[0].transmission_type = crate::pdo::TpdoTransmissionType::RtrEvent;
        node.can.driver_mut().sent.clear();

        let ident = crate::ids::tpdo_id(NodeId::new(5).unwrap(), 0).unwrap();
        let m = node
            .can
            .dispatch(ident, true, 0, &[0u8; 8])
            .expect("an RTR filter must be registered for this TPDO's COB-ID");
        node.on_rx_match(m.subscriber, m.dlc, &m.data).unwrap();

        let sent = &node.can.driver_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].standard_ident(), Some(0x185));
        assert_eq!(sent[0].data(), &[7]);
    }
}

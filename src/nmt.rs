//! NMT + heartbeat: operating-state machine, heartbeat producer, and
//! heartbeat-consumer watchdogs.

use defmt_or_log::info;
use heapless::Vec;

use crate::ids::NodeId;

/// NMT operating state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtState {
    Initializing,
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    /// The single byte carried in a heartbeat/boot-up frame, per CiA-301
    /// section 7.2.7.2.2.
    pub fn wire_byte(self) -> u8 {
        match self {
            NmtState::Initializing => 0x00,
            NmtState::PreOperational => 0x7F,
            NmtState::Operational => 0x05,
            NmtState::Stopped => 0x04,
        }
    }
}

/// Commands carried in an NMT command frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    EnterOperational,
    EnterStopped,
    EnterPreOperational,
    ResetApplication,
    ResetCommunication,
}

impl NmtCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(NmtCommand::EnterOperational),
            0x02 => Some(NmtCommand::EnterStopped),
            0x80 => Some(NmtCommand::EnterPreOperational),
            0x81 => Some(NmtCommand::ResetApplication),
            0x82 => Some(NmtCommand::ResetCommunication),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            NmtCommand::EnterOperational => 0x01,
            NmtCommand::EnterStopped => 0x02,
            NmtCommand::EnterPreOperational => 0x80,
            NmtCommand::ResetApplication => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }
}

/// Side effect the caller (`Node`) must act on after an NMT transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtSideEffect {
    None,
    ApplicationResetRequested,
    CommunicationResetRequested,
}

/// The NMT state machine for one node instance.
pub struct Nmt {
    node_id: NodeId,
    state: NmtState,
}

impl Nmt {
    /// On power-on the node is in `Initializing`; `boot` emits the single
    /// boot-up frame and transitions to pre-operational.
    pub fn new(node_id: NodeId) -> Self {
        Nmt { node_id, state: NmtState::Initializing }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    /// Emits the boot-up frame payload and moves to pre-operational.
    /// Returns the `(ident, data)` to transmit.
    pub fn boot(&mut self) -> (u16, [u8; 1]) {
        let ident = 0x700 + self.node_id.get() as u16;
        self.state = NmtState::PreOperational;
        info!("NMT boot-up, entering pre-operational");
        (ident, [0x00])
    }

    /// Handle an incoming NMT command frame: `target == 0` addresses all
    /// nodes, otherwise only this node's ID. `error_register_nonzero` gates
    /// the transition to operational per CiA-301's guard clause.
    pub fn handle_command(
        &mut self,
        command: NmtCommand,
        target: u8,
        error_register_nonzero: bool,
    ) -> NmtSideEffect {
        if target != 0 && target != self.node_id.get() {
            return NmtSideEffect::None;
        }
        self.apply_command(command, error_register_nonzero)
    }

    /// Local loopback path for `send_NMT_command`: the local node applies
    /// the same command it just transmitted.
    pub fn apply_command(&mut self, command: NmtCommand, error_register_nonzero: bool) -> NmtSideEffect {
        match command {
            NmtCommand::EnterOperational => {
                if error_register_nonzero {
                    return NmtSideEffect::None;
                }
                self.state = NmtState::Operational;
                info!("NMT -> operational");
                NmtSideEffect::None
            }
            NmtCommand::EnterStopped => {
                self.state = NmtState::Stopped;
                info!("NMT -> stopped");
                NmtSideEffect::None
            }
            NmtCommand::EnterPreOperational => {
                self.state = NmtState::PreOperational;
                info!("NMT -> pre-operational");
                NmtSideEffect::None
            }
            NmtCommand::ResetApplication => NmtSideEffect::ApplicationResetRequested,
            NmtCommand::ResetCommunication => NmtSideEffect::CommunicationResetRequested,
        }
    }
}

/// Heartbeat producer: emits `(0x700+nodeID, [state byte])` every
/// `producer_heartbeat_time_ms` if nonzero.
pub struct HeartbeatProducer {
    period_ms: u32,
    elapsed_ms: u32,
}

impl HeartbeatProducer {
    pub fn new(period_ms: u32) -> Self {
        HeartbeatProducer { period_ms, elapsed_ms: 0 }
    }

    pub fn set_period_ms(&mut self, period_ms: u32) {
        self.period_ms = period_ms;
        self.elapsed_ms = 0;
    }

    /// Returns `Some(state_byte)` on ticks where a heartbeat is due.
    pub fn process(&mut self, dt_ms: u32, state: NmtState) -> Option<u8> {
        if self.period_ms == 0 {
            return None;
        }
        self.elapsed_ms += dt_ms;
        if self.elapsed_ms < self.period_ms {
            return None;
        }
        self.elapsed_ms -= self.period_ms;
        Some(state.wire_byte())
    }
}

/// Well-known HEARTBEAT EMCY code.
pub const EMCY_HEARTBEAT_CODE: u16 = 0x8130;

/// Maximum number of monitored nodes a single consumer table can hold.
pub const MAX_HB_CONSUMERS: usize = 16;

/// One heartbeat-consumer entry.
struct HbEntry {
    node_id: u8,
    window_ms: u32,
    since_last_seen_ms: u32,
    last_state: Option<NmtState>,
    timed_out: bool,
    /// True once the timeout EMCY has already fired for the current
    /// timeout episode, so `process` does not re-emit every tick.
    emitted: bool,
}

/// Tracks heartbeat reception deadlines for every monitored node.
pub struct HeartbeatConsumer {
    entries: Vec<HbEntry, MAX_HB_CONSUMERS>,
}

impl HeartbeatConsumer {
    pub fn new() -> Self {
        HeartbeatConsumer { entries: Vec::new() }
    }

    pub fn monitor(&mut self, node_id: u8, window_ms: u32) -> Result<(), crate::error::ApiError> {
        self.entries
            .push(HbEntry {
                node_id,
                window_ms,
                since_last_seen_ms: 0,
                last_state: None,
                timed_out: false,
                emitted: false,
            })
            .map_err(|_| crate::error::ApiError::OutOfMemory)
    }

    /// Reset the timer for `node_id` on a received heartbeat frame.
    pub fn on_heartbeat(&mut self, node_id: u8, state_byte: u8) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.node_id == node_id) {
            e.since_last_seen_ms = 0;
            e.timed_out = false;
            e.emitted = false;
            e.last_state = Some(match state_byte {
                0x00 => NmtState::Initializing,
                0x7F => NmtState::PreOperational,
                0x05 => NmtState::Operational,
                0x04 => NmtState::Stopped,
                _ => NmtState::Initializing,
            });
        }
    }

    /// Advance every monitored entry's timer by `dt_ms`. Returns the node
    /// IDs that newly timed out this call (so the caller raises
    /// EMCY `HEARTBEAT` exactly once per timeout episode).
    pub fn process(&mut self, dt_ms: u32) -> Vec<u8, MAX_HB_CONSUMERS> {
        let mut newly_timed_out = Vec::new();
        for e in self.entries.iter_mut() {
            if e.node_id == 0 {
                continue;
            }
            e.since_last_seen_ms += dt_ms;
            let should_timeout = e.since_last_seen_ms > e.window_ms;
            e.timed_out = should_timeout;
            if should_timeout && !e.emitted {
                e.emitted = true;
                let _ = newly_timed_out.push(e.node_id);
            }
        }
        newly_timed_out
    }

    pub fn is_timed_out(&self, node_id: u8) -> bool {
        self.entries.iter().any(|e| e.node_id == node_id && e.timed_out)
    }

    /// The state reported in the monitored node's most recent heartbeat, or
    /// `None` if it has never been heard from.
    pub fn node_state(&self, node_id: u8) -> Option<NmtState> {
        self.entries.iter().find(|e| e.node_id == node_id)?.last_state
    }
}

impl Default for HeartbeatConsumer {
    fn default() -> Self {
        Self::new()
    }
}

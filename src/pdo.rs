//! PDO engine: mapping compile, transmission-type rules, gather/scatter
//! against the object dictionary, for both RPDOs and TPDOs.

use defmt_or_log::warn;
use heapless::Vec;

use crate::error::ApiError;
use crate::od::ObjectDictionary;

/// Maximum mapped entries per PDO.
pub const MAX_MAPPING_ENTRIES: usize = 8;

/// One mapping-array entry: `(index:16 | sub:8 | bit_length:8)` packed into
/// a `u32`, matching the CiA-301 wire layout for objects 0x1600-0x17FF /
/// 0x1A00-0x1BFF (mirrored from `PdoMapping::from_u32`/`to_u32` in the
/// CANopen-over-Tokio dictionary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapping {
    pub index: u16,
    pub sub: u8,
    pub bit_length: u8,
}

impl PdoMapping {
    pub fn from_u32(raw: u32) -> Self {
        PdoMapping {
            index: (raw >> 16) as u16,
            sub: (raw >> 8) as u8,
            bit_length: raw as u8,
        }
    }

    pub fn to_u32(self) -> u32 {
        (self.index as u32) << 16 | (self.sub as u32) << 8 | self.bit_length as u32
    }

    fn byte_length(self) -> usize {
        (self.bit_length as usize + 7) / 8
    }
}

/// Transmission type for a TPDO.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpdoTransmissionType {
    /// 0 - acyclic synchronous: send once, only after next SYNC, only if
    /// the content changed.
    AcyclicSynchronous,
    /// 1..240 - cyclic synchronous: send after every N-th SYNC.
    CyclicSynchronous(u8),
    /// 252 - RTR synchronous: responded to on request, triggered by SYNC.
    RtrSynchronous,
    /// 253 - RTR event: responded to on request immediately.
    RtrEvent,
    /// 254/255 - event: on change of state or event timer, respecting
    /// inhibit time.
    Event,
}

impl TpdoTransmissionType {
    pub fn from_byte(byte: u8) -> Result<Self, ApiError> {
        match byte {
            0 => Ok(TpdoTransmissionType::AcyclicSynchronous),
            1..=240 => Ok(TpdoTransmissionType::CyclicSynchronous(byte)),
            252 => Ok(TpdoTransmissionType::RtrSynchronous),
            253 => Ok(TpdoTransmissionType::RtrEvent),
            254 | 255 => Ok(TpdoTransmissionType::Event),
            241..=251 => Err(ApiError::Parameters),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            TpdoTransmissionType::AcyclicSynchronous => 0,
            TpdoTransmissionType::CyclicSynchronous(n) => n,
            TpdoTransmissionType::RtrSynchronous => 252,
            TpdoTransmissionType::RtrEvent => 253,
            TpdoTransmissionType::Event => 255,
        }
    }

    fn is_synchronous(self) -> bool {
        !matches!(self, TpdoTransmissionType::Event | TpdoTransmissionType::RtrEvent)
    }
}

/// Transmission type for an RPDO: only the synchronous/asynchronous split
/// matters on the receive side.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpdoTransmissionType {
    Synchronous,
    Event,
}

impl RpdoTransmissionType {
    pub fn from_byte(byte: u8) -> Self {
        if byte >= 254 {
            RpdoTransmissionType::Event
        } else {
            RpdoTransmissionType::Synchronous
        }
    }
}

/// Compiled gather/scatter vector entry: offset into the PDO payload plus
/// the resolved OD entry position and byte length.
#[derive(Debug, Clone, Copy)]
struct CompiledEntry {
    od_pos: usize,
    byte_offset: u8,
    byte_len: u8,
}

/// A TPDO descriptor: COB-ID, transmission type, inhibit time, event timer,
/// mapping table and compiled gather vector.
pub struct Tpdo {
    pub cob_id: u32,
    pub valid: bool,
    pub transmission_type: TpdoTransmissionType,
    pub inhibit_time_100us: u16,
    pub event_timer_ms: u16,
    mapping: Vec<PdoMapping, MAX_MAPPING_ENTRIES>,
    compiled: Vec<CompiledEntry, MAX_MAPPING_ENTRIES>,
    last_sent: [u8; 8],
    last_sent_len: u8,
    since_last_send_100us: u32,
    since_event_ms: u32,
    sync_count: u8,
}

impl Tpdo {
    pub fn new(cob_id: u32) -> Self {
        Tpdo {
            cob_id,
            valid: false,
            transmission_type: TpdoTransmissionType::Event,
            inhibit_time_100us: 0,
            event_timer_ms: 0,
            mapping: Vec::new(),
            compiled: Vec::new(),
            last_sent: [0u8; 8],
            last_sent_len: 0,
            since_last_send_100us: u32::MAX,
            since_event_ms: 0,
            sync_count: 0,
        }
    }

    /// Resolves each `(index, sub, bits)` against the OD and caches a
    /// gather vector. Rejects with `Parameters` (mirroring SDO abort
    /// `PARAM_INCOMPATIBLE`) if the total bit length exceeds 64 or an entry
    /// isn't mappable.
    pub fn compile_mapping(&mut self, od: &ObjectDictionary, entries: &[PdoMapping]) -> Result<(), ApiError> {
        if entries.len() > MAX_MAPPING_ENTRIES {
            return Err(ApiError::Parameters);
        }
        let total_bits: u32 = entries.iter().map(|e| e.bit_length as u32).sum();
        if total_bits > 64 {
            warn!("TPDO mapping rejected: total bit length {} exceeds 64", total_bits);
            return Err(ApiError::Parameters);
        }
        let mut compiled = Vec::new();
        let mut offset = 0u8;
        for m in entries {
            let pos = od.find(m.index, m.sub).map_err(|_| ApiError::Parameters)?;
            let entry = od.entry(pos);
            if !entry.mappable {
                warn!("TPDO mapping rejected: {:04x}:{:02x} not mappable", m.index, m.sub);
                return Err(ApiError::Parameters);
            }
            let byte_len = m.byte_length() as u8;
            compiled
                .push(CompiledEntry { od_pos: pos, byte_offset: offset, byte_len })
                .map_err(|_| ApiError::Parameters)?;
            offset += byte_len;
        }
        self.mapping = entries.iter().copied().collect();
        self.compiled = compiled;
        Ok(())
    }

    fn gather(&self, od: &ObjectDictionary) -> ([u8; 8], u8) {
        let mut buf = [0u8; 8];
        let mut len = 0u8;
        for c in &self.compiled {
            let mut tmp = [0u8; 8];
            let _ = od.read(c.od_pos, &mut tmp);
            let start = c.byte_offset as usize;
            let end = start + c.byte_len as usize;
            buf[start..end].copy_from_slice(&tmp[..c.byte_len as usize]);
            len = end as u8;
        }
        (buf, len)
    }

    /// Advances timers by `dt_us` / restarts inhibit after a send; call
    /// once per `process_TPDO` tick. Returns `Some(payload)` when this PDO
    /// is due to transmit.
    pub fn process(&mut self, od: &ObjectDictionary, dt_us: u32, sync_occurred: bool) -> Option<([u8; 8], u8)> {
        if !self.valid {
            return None;
        }
        self.since_last_send_100us = self.since_last_send_100us.saturating_add(dt_us / 100);
        self.since_event_ms = self.since_event_ms.saturating_add(dt_us / 1000);

        match self.transmission_type {
            TpdoTransmissionType::AcyclicSynchronous => {
                if !sync_occurred {
                    return None;
                }
                let (payload, len) = self.gather(od);
                if payload[..len as usize] != self.last_sent[..self.last_sent_len as usize] {
                    self.record_send(payload, len);
                    return Some((payload, len));
                }
                None
            }
            TpdoTransmissionType::CyclicSynchronous(n) => {
                if !sync_occurred {
                    return None;
                }
                self.sync_count += 1;
                if self.sync_count < n {
                    return None;
                }
                self.sync_count = 0;
                let (payload, len) = self.gather(od);
                self.record_send(payload, len);
                Some((payload, len))
            }
            TpdoTransmissionType::RtrSynchronous | TpdoTransmissionType::RtrEvent => {
                // RTR-triggered PDOs transmit only in response to a remote
                // frame, handled by the caller via `respond_to_rtr`.
                None
            }
            TpdoTransmissionType::Event => {
                let inhibited = (self.since_last_send_100us as u16) < self.inhibit_time_100us;
                if inhibited {
                    return None;
                }
                let (payload, len) = self.gather(od);
                let changed = payload[..len as usize] != self.last_sent[..self.last_sent_len as usize];
                let timer_elapsed = self.event_timer_ms > 0
                    && self.since_event_ms >= self.event_timer_ms as u32;
                if changed || timer_elapsed {
                    self.record_send(payload, len);
                    return Some((payload, len));
                }
                None
            }
        }
    }

    /// RTR-triggered response path for transmission types 252/253.
    pub fn respond_to_rtr(&mut self, od: &ObjectDictionary) -> Option<([u8; 8], u8)> {
        if !self.valid
            || !matches!(
                self.transmission_type,
                TpdoTransmissionType::RtrSynchronous | TpdoTransmissionType::RtrEvent
            )
        {
            return None;
        }
        let (payload, len) = self.gather(od);
        self.record_send(payload, len);
        Some((payload, len))
    }

    fn record_send(&mut self, payload: [u8; 8], len: u8) {
        self.last_sent = payload;
        self.last_sent_len = len;
        self.since_last_send_100us = 0;
        self.since_event_ms = 0;
    }
}

/// An RPDO descriptor: COB-ID, transmission type, mapping table.
pub struct Rpdo {
    pub cob_id: u32,
    pub valid: bool,
    pub transmission_type: RpdoTransmissionType,
    compiled: Vec<CompiledEntry, MAX_MAPPING_ENTRIES>,
    buffered: Option<([u8; 8], u8)>,
}

impl Rpdo {
    pub fn new(cob_id: u32) -> Self {
        Rpdo {
            cob_id,
            valid: false,
            transmission_type: RpdoTransmissionType::Synchronous,
            compiled: Vec::new(),
            buffered: None,
        }
    }

    pub fn compile_mapping(&mut self, od: &ObjectDictionary, entries: &[PdoMapping]) -> Result<(), ApiError> {
        if entries.len() > MAX_MAPPING_ENTRIES {
            return Err(ApiError::Parameters);
        }
        let total_bits: u32 = entries.iter().map(|e| e.bit_length as u32).sum();
        if total_bits > 64 {
            return Err(ApiError::Parameters);
        }
        let mut compiled = Vec::new();
        let mut offset = 0u8;
        for m in entries {
            let pos = od.find(m.index, m.sub).map_err(|_| ApiError::Parameters)?;
            let entry = od.entry(pos);
            if !entry.mappable {
                return Err(ApiError::Parameters);
            }
            let byte_len = m.byte_length() as u8;
            compiled
                .push(CompiledEntry { od_pos: pos, byte_offset: offset, byte_len })
                .map_err(|_| ApiError::Parameters)?;
            offset += byte_len;
        }
        self.compiled = compiled;
        Ok(())
    }

    /// Called from CAN dispatch when a frame matching this RPDO's COB-ID
    /// arrives. DLC must cover every mapped byte, or this rejects with
    /// `RxPdoLength`. Always buffers; it is the caller's (`Node`'s) job to
    /// call `apply_to` immediately afterwards for event RPDOs, or defer the
    /// call to the next SYNC tick for synchronous ones: synchronous RPDOs
    /// buffer the received frame and apply it only at the next SYNC tick,
    /// while event RPDOs apply immediately.
    pub fn on_frame(&mut self, dlc: u8, data: &[u8; 8]) -> Result<(), ApiError> {
        if !self.valid {
            return Ok(());
        }
        let needed = self.compiled.iter().map(|c| c.byte_offset + c.byte_len).max().unwrap_or(0);
        if dlc < needed {
            return Err(ApiError::RxPdoLength);
        }
        self.buffered = Some((*data, dlc));
        Ok(())
    }

    /// Applied at the next SYNC tick for synchronous RPDOs, or immediately
    /// for event RPDOs.
    pub fn apply_to(&mut self, od: &mut ObjectDictionary) -> Result<(), ApiError> {
        let Some((data, _dlc)) = self.buffered.take() else {
            return Ok(());
        };
        for c in &self.compiled {
            let start = c.byte_offset as usize;
            let end = start + c.byte_len as usize;
            od.write(c.od_pos, &data[start..end]).map_err(|_| ApiError::Parameters)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Bounds, OdEntry};

    fn single_u8_od(storage: &mut [u8; 1]) -> [OdEntry; 1] {
        [OdEntry {
            index: 0x6000,
            sub: 1,
            access: AccessType::READ_WRITE,
            mappable: true,
            bounds: Bounds::None,
            storage,
        }]
    }

    #[test]
    fn mapping_packs_and_unpacks() {
        let m = PdoMapping { index: 0x6000, sub: 1, bit_length: 8 };
        let raw = m.to_u32();
        assert_eq!(raw, 0x6000_0108);
        assert_eq!(PdoMapping::from_u32(raw), m);
    }

    #[test]
    fn transmission_type_roundtrip() {
        assert_eq!(TpdoTransmissionType::from_byte(0).unwrap(), TpdoTransmissionType::AcyclicSynchronous);
        assert_eq!(TpdoTransmissionType::from_byte(5).unwrap(), TpdoTransmissionType::CyclicSynchronous(5));
        assert_eq!(TpdoTransmissionType::from_byte(252).unwrap(), TpdoTransmissionType::RtrSynchronous);
        assert_eq!(TpdoTransmissionType::from_byte(255).unwrap(), TpdoTransmissionType::Event);
        assert!(TpdoTransmissionType::from_byte(245).is_err());
    }

    #[test]
    fn mapping_rejects_oversized_total_bits() {
        let mut storage = [0u8; 1];
        let mut entries = single_u8_od(&mut storage);
        let od = ObjectDictionary::new_sorted(&mut entries);
        let mut tpdo = Tpdo::new(0x180);
        let oversized: Vec<PdoMapping, 8> = (0..8)
            .map(|_| PdoMapping { index: 0x6000, sub: 1, bit_length: 64 })
            .collect();
        assert_eq!(tpdo.compile_mapping(&od, &oversized), Err(ApiError::Parameters));
    }

    #[test]
    fn pdo_event_with_inhibit_scenario() {
        // TPDO1 mapped to (0x6000,1) u8, inhibit 100ms (1000 * 100us units).
        let mut storage = [1u8; 1];
        let mut entries = single_u8_od(&mut storage);
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let pos = od.find(0x6000, 1).unwrap();

        let mut tpdo = Tpdo::new(0x180);
        tpdo.valid = true;
        tpdo.transmission_type = TpdoTransmissionType::Event;
        tpdo.inhibit_time_100us = 1000; // 100ms
        tpdo.compile_mapping(&od, &[PdoMapping { index: 0x6000, sub: 1, bit_length: 8 }]).unwrap();

        // t=0: value already 1, first process() always sends (nothing sent yet).
        let sent0 = tpdo.process(&od, 0, false);
        assert_eq!(sent0, Some(([1, 0, 0, 0, 0, 0, 0, 0], 1)));

        // t=50ms: write value 2, but still inside inhibit window -> no send.
        od.write(pos, &[2]).unwrap();
        let sent1 = tpdo.process(&od, 50_000, false);
        assert_eq!(sent1, None);

        // t=100ms: inhibit has elapsed, changed value is sent.
        let sent2 = tpdo.process(&od, 50_000, false);
        assert_eq!(sent2, Some(([2, 0, 0, 0, 0, 0, 0, 0], 1)));
    }
}

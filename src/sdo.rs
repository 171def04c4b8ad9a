//! SDO server: per-session state machine for expedited, segmented and block
//! transfer against the object dictionary, per CiA-301 section 7.2.4.

use defmt_or_log::{debug, warn};

use crate::crc::{Crc16, StandardCrc16};
use crate::ids::NodeId;
use crate::nmt::NmtState;
use crate::od::{ObjectDictionary, OdError};

/// The standard 32-bit CiA-301 table 22 abort codes this server can emit.
/// Values cross-checked against `AbortReason` in the CANopen-over-Tokio
/// SDO client implementation (itself table 22), re-expressed as a plain
/// `#[repr(u32)]` enum since this crate is `no_std` and cannot use the
/// `thiserror` machinery that crate builds its error type with.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    ToggleBitError = 0x0503_0000,
    SdoTimeout = 0x0504_0000,
    CmdSpecifierInvalid = 0x0504_0001,
    BlockSizeInvalid = 0x0504_0002,
    BlockSequenceInvalid = 0x0504_0003,
    CrcError = 0x0504_0004,
    OutOfMemory = 0x0504_0005,
    UnsupportedAccess = 0x0601_0000,
    WriteOnly = 0x0601_0001,
    ReadOnly = 0x0601_0002,
    ObjectDoesNotExist = 0x0602_0000,
    ParamIncompatible = 0x0604_0043,
    ParamLength = 0x0607_0010,
    ParamValueHigh = 0x0609_0031,
    ParamValueLow = 0x0609_0032,
    SubIndexDoesNotExist = 0x0609_0011,
    ParamValue = 0x0609_0030,
    DataCannotTransferOrStore = 0x0800_0020,
    General = 0x0800_0000,
}

impl AbortCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    fn from_od_error(e: OdError) -> Self {
        match e {
            OdError::NotFound => AbortCode::ObjectDoesNotExist,
            OdError::UnsupportedAccess => AbortCode::UnsupportedAccess,
            OdError::ReadOnly => AbortCode::ReadOnly,
            OdError::WriteOnly => AbortCode::WriteOnly,
            OdError::ValueTooHigh => AbortCode::ParamValueHigh,
            OdError::ValueTooLow => AbortCode::ParamValueLow,
            OdError::DataTooLong | OdError::DataTooShort => AbortCode::ParamLength,
            // Re-interpreting an arbitrary hook-chosen code as this enum isn't
            // possible in general; hooks that need a specific wire value
            // write the abort frame themselves before returning.
            OdError::HookAbort(_) => AbortCode::General,
        }
    }
}

/// Per-session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    DownloadSegment,
    UploadSegment,
    BlockDownload,
    BlockDownloadEnd,
    Aborted,
}

/// Maximum payload this server buffers for a segmented/block transfer
/// in flight. Sized for a handful of typical OD entries (strings, visible
/// strings, domain objects up to 256 bytes); large domain transfers beyond
/// this would need a caller-supplied streaming extension, out of scope here.
pub const MAX_TRANSFER_BYTES: usize = 256;

/// Default SDO session timeout.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Segments per block this server requests, well under CiA-301's 127-per-
/// block ceiling; kept small since `MAX_TRANSFER_BYTES` already bounds the
/// whole transfer, not just one block.
const BLOCK_SIZE_SEGMENTS: u8 = 16;

struct Session {
    state: SessionState,
    od_pos: usize,
    cursor: usize,
    total_len: Option<usize>,
    toggle: bool,
    crc: u16,
    crc_enabled: bool,
    last_good_seq: u8,
    block_start_cursor: usize,
    buffer: [u8; MAX_TRANSFER_BYTES],
    timeout_ms: u32,
    elapsed_ms: u32,
}

impl Session {
    const fn new() -> Self {
        Session {
            state: SessionState::Idle,
            od_pos: 0,
            cursor: 0,
            total_len: None,
            toggle: false,
            crc: 0,
            crc_enabled: false,
            last_good_seq: 0,
            block_start_cursor: 0,
            buffer: [0u8; MAX_TRANSFER_BYTES],
            timeout_ms: DEFAULT_TIMEOUT_MS,
            elapsed_ms: 0,
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.cursor = 0;
        self.total_len = None;
        self.toggle = false;
        self.crc = 0;
        self.crc_enabled = false;
        self.last_good_seq = 0;
        self.block_start_cursor = 0;
        self.elapsed_ms = 0;
    }
}

/// Outcome of feeding one request frame to the server: either a response
/// frame to transmit, or nothing (malformed/ignored frame).
pub struct SdoResponse {
    pub data: [u8; 8],
}

impl SdoResponse {
    fn expedited_upload(index: u16, sub: u8, value: &[u8]) -> Self {
        let mut data = [0u8; 8];
        let n = 4 - value.len();
        // command byte: 0x43 for 4-byte, else size-indicated, always "expedited, size indicated"
        data[0] = 0x43 | ((n as u8) << 2);
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4..4 + value.len()].copy_from_slice(value);
        SdoResponse { data }
    }

    fn download_ack(index: u16, sub: u8) -> Self {
        let mut data = [0u8; 8];
        data[0] = 0x60;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        SdoResponse { data }
    }

    fn abort(index: u16, sub: u8, code: AbortCode) -> Self {
        let mut data = [0u8; 8];
        data[0] = 0x80;
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4..8].copy_from_slice(&code.code().to_le_bytes());
        SdoResponse { data }
    }

    fn block_download_init_ack(index: u16, sub: u8, crc_enabled: bool) -> Self {
        let mut data = [0u8; 8];
        data[0] = 0xA0 | ((crc_enabled as u8) << 2);
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[3] = sub;
        data[4] = BLOCK_SIZE_SEGMENTS;
        SdoResponse { data }
    }

    fn block_download_segment_ack(last_good_seq: u8) -> Self {
        let mut data = [0u8; 8];
        data[0] = 0xA2;
        data[1] = last_good_seq;
        data[2] = BLOCK_SIZE_SEGMENTS;
        SdoResponse { data }
    }

    fn block_download_end_ack() -> Self {
        SdoResponse { data: [0xA1, 0, 0, 0, 0, 0, 0, 0] }
    }
}

/// One SDO server channel. Channel 0 is the default, COB-IDs
/// `0x600+nodeID` (request) / `0x580+nodeID` (response).
pub struct SdoServer {
    node_id: NodeId,
    session: Session,
}

impl SdoServer {
    pub fn new(node_id: NodeId) -> Self {
        SdoServer { node_id, session: Session::new() }
    }

    pub fn request_id(&self) -> u16 {
        crate::ids::sdo_request_id(self.node_id)
    }

    pub fn response_id(&self) -> u16 {
        crate::ids::sdo_response_id(self.node_id)
    }

    /// Advance the session timeout; returns an abort response if the
    /// deadline expired.
    pub fn process(&mut self, dt_ms: u32) -> Option<SdoResponse> {
        if matches!(self.session.state, SessionState::Idle | SessionState::Aborted) {
            return None;
        }
        self.session.elapsed_ms += dt_ms;
        if self.session.elapsed_ms >= self.session.timeout_ms {
            warn!("SDO session timed out");
            let resp = SdoResponse::abort(0, 0, AbortCode::SdoTimeout);
            self.session.state = SessionState::Aborted;
            return Some(resp);
        }
        None
    }

    /// Handle one incoming request frame. `nmt_state` gates activity: the
    /// server silently drops all frames in `Stopped`.
    pub fn handle_frame(&mut self, od: &mut ObjectDictionary, nmt_state: NmtState, data: &[u8; 8]) -> Option<SdoResponse> {
        if nmt_state == NmtState::Stopped {
            return None;
        }
        self.session.elapsed_ms = 0;

        let cmd = data[0];
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub = data[3];

        // Raw sub-block segments aren't command-specifier coded; a frame
        // is only interpreted as one while a block download is in progress.
        if self.session.state == SessionState::BlockDownload {
            return self.handle_block_segment(data);
        }

        let ccs = cmd >> 5;
        // Any new init-request frame aborts an in-progress session at the
        // same server.
        match ccs {
            1 => self.handle_initiate_download(od, index, sub, cmd, data),
            2 => self.handle_initiate_upload(od, index, sub),
            0 => self.handle_download_segment(od, cmd, data),
            3 => self.handle_upload_segment(od, cmd),
            4 => {
                self.session.reset();
                self.session.state = SessionState::Aborted;
                None
            }
            6 => self.handle_block_subcommand(od, index, sub, cmd, data),
            _ => Some(SdoResponse::abort(index, sub, AbortCode::CmdSpecifierInvalid)),
        }
    }

    fn handle_block_subcommand(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub: u8,
        cmd: u8,
        data: &[u8; 8],
    ) -> Option<SdoResponse> {
        let cs = cmd & 0x01;
        match (self.session.state, cs) {
            (SessionState::Idle | SessionState::Aborted, 0) => {
                self.session.reset();
                let crc_enabled = cmd & 0x04 != 0;
                let size_indicated = cmd & 0x02 != 0;
                let pos = match od.find(index, sub) {
                    Ok(p) => p,
                    Err(e) => return Some(SdoResponse::abort(index, sub, AbortCode::from_od_error(e))),
                };
                let total_len = if size_indicated {
                    Some(u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize)
                } else {
                    None
                };
                if let Some(len) = total_len {
                    if len > MAX_TRANSFER_BYTES {
                        return Some(SdoResponse::abort(index, sub, AbortCode::OutOfMemory));
                    }
                }
                self.session.od_pos = pos;
                self.session.total_len = total_len;
                self.session.crc_enabled = crc_enabled;
                self.session.state = SessionState::BlockDownload;
                Some(SdoResponse::block_download_init_ack(index, sub, crc_enabled))
            }
            (SessionState::BlockDownloadEnd, 1) => {
                let n_empty = (cmd >> 2) & 0x07;
                let last_chunk = (7 - n_empty) as usize;
                let total = self.session.cursor.saturating_sub(7) + last_chunk;
                let peer_crc = u16::from_le_bytes([data[1], data[2]]);

                let pos = self.session.od_pos;
                let written = od.write(pos, &self.session.buffer[..total]);
                let crc_ok = !self.session.crc_enabled || self.session.crc == peer_crc;
                self.session.reset();

                match (written, crc_ok) {
                    (Ok(()), true) => Some(SdoResponse::block_download_end_ack()),
                    (Ok(()), false) => Some(SdoResponse::abort(0, 0, AbortCode::CrcError)),
                    (Err(e), _) => Some(SdoResponse::abort(0, 0, AbortCode::from_od_error(e))),
                }
            }
            _ => {
                self.session.state = SessionState::Aborted;
                Some(SdoResponse::abort(index, sub, AbortCode::CmdSpecifierInvalid))
            }
        }
    }

    fn handle_block_segment(&mut self, data: &[u8; 8]) -> Option<SdoResponse> {
        let seq = data[0] & 0x7F;
        let is_last = data[0] & 0x80 != 0;
        let expected_seq = self.session.last_good_seq + 1;

        if seq != expected_seq {
            // Out of order: drop it silently. The block-ack sent once the
            // sub-block ends reports `last_good_seq`, telling the client to
            // resend starting there.
            return None;
        }

        let room = self.session.cursor + 7 <= MAX_TRANSFER_BYTES;
        if !room {
            self.session.state = SessionState::Aborted;
            return Some(SdoResponse::abort(0, 0, AbortCode::OutOfMemory));
        }
        self.session.buffer[self.session.cursor..self.session.cursor + 7].copy_from_slice(&data[1..8]);
        self.session.cursor += 7;
        self.session.last_good_seq = seq;

        if is_last || seq == BLOCK_SIZE_SEGMENTS {
            if self.session.crc_enabled {
                let start = self.session.block_start_cursor;
                let crc_impl = StandardCrc16;
                self.session.crc = crc_impl.update(self.session.crc, &self.session.buffer[start..self.session.cursor]);
            }
            self.session.block_start_cursor = self.session.cursor;
            let ack = SdoResponse::block_download_segment_ack(self.session.last_good_seq);
            self.session.last_good_seq = 0;
            if is_last {
                self.session.state = SessionState::BlockDownloadEnd;
            }
            Some(ack)
        } else {
            None
        }
    }

    fn handle_initiate_download(
        &mut self,
        od: &mut ObjectDictionary,
        index: u16,
        sub: u8,
        cmd: u8,
        data: &[u8; 8],
    ) -> Option<SdoResponse> {
        self.session.reset();
        let expedited = cmd & 0x02 != 0;
        let size_indicated = cmd & 0x01 != 0;

        let pos = match od.find(index, sub) {
            Ok(p) => p,
            Err(e) => return Some(SdoResponse::abort(index, sub, AbortCode::from_od_error(e))),
        };

        if expedited {
            let n = if size_indicated { ((cmd >> 2) & 0x03) as usize } else { 0 };
            let len = 4 - n;
            match od.write(pos, &data[4..4 + len]) {
                Ok(()) => Some(SdoResponse::download_ack(index, sub)),
                Err(e) => Some(SdoResponse::abort(index, sub, AbortCode::from_od_error(e))),
            }
        } else {
            // Segmented: buffer internally, commit in one write at the end,
            // so a partially-written large entry is never visible.
            let total_len = if size_indicated {
                Some(u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize)
            } else {
                None
            };
            if let Some(len) = total_len {
                if len > MAX_TRANSFER_BYTES {
                    return Some(SdoResponse::abort(index, sub, AbortCode::OutOfMemory));
                }
            }
            self.session.od_pos = pos;
            self.session.total_len = total_len;
            self.session.cursor = 0;
            self.session.toggle = false;
            self.session.state = SessionState::DownloadSegment;
            Some(SdoResponse::download_ack(index, sub))
        }
    }

    fn handle_download_segment(&mut self, od: &mut ObjectDictionary, cmd: u8, data: &[u8; 8]) -> Option<SdoResponse> {
        if self.session.state != SessionState::DownloadSegment {
            return Some(SdoResponse::abort(0, 0, AbortCode::CmdSpecifierInvalid));
        }
        let toggle = (cmd & 0x10) != 0;
        if toggle != self.session.toggle {
            self.session.state = SessionState::Aborted;
            return Some(SdoResponse::abort(0, 0, AbortCode::ToggleBitError));
        }
        let no_more = (cmd & 0x01) != 0;
        let n = ((cmd >> 1) & 0x07) as usize;
        let len = 7 - n;
        if self.session.cursor + len > MAX_TRANSFER_BYTES {
            self.session.state = SessionState::Aborted;
            return Some(SdoResponse::abort(0, 0, AbortCode::OutOfMemory));
        }
        self.session.buffer[self.session.cursor..self.session.cursor + len].copy_from_slice(&data[1..1 + len]);
        self.session.cursor += len;
        self.session.toggle = !self.session.toggle;

        if no_more {
            let pos = self.session.od_pos;
            let total = self.session.cursor;
            let written = od.write(pos, &self.session.buffer[..total]);
            self.session.reset();
            return match written {
                Ok(()) => {
                    let mut resp = [0u8; 8];
                    resp[0] = 0x20 | ((toggle as u8) << 4);
                    debug!("SDO segmented download complete, {} bytes", total);
                    Some(SdoResponse { data: resp })
                }
                Err(e) => Some(SdoResponse::abort(0, 0, AbortCode::from_od_error(e))),
            };
        }
        let mut resp = [0u8; 8];
        resp[0] = 0x20 | ((toggle as u8) << 4);
        Some(SdoResponse { data: resp })
    }

    fn handle_initiate_upload(&mut self, od: &ObjectDictionary, index: u16, sub: u8) -> Option<SdoResponse> {
        self.session.reset();
        let pos = match od.find(index, sub) {
            Ok(p) => p,
            Err(e) => return Some(SdoResponse::abort(index, sub, AbortCode::from_od_error(e))),
        };
        let mut buf = [0u8; MAX_TRANSFER_BYTES];
        let len = match od.read(pos, &mut buf) {
            Ok(l) => l,
            Err(e) => return Some(SdoResponse::abort(index, sub, AbortCode::from_od_error(e))),
        };

        if len <= 4 {
            Some(SdoResponse::expedited_upload(index, sub, &buf[..len]))
        } else {
            self.session.od_pos = pos;
            self.session.buffer[..len].copy_from_slice(&buf[..len]);
            self.session.total_len = Some(len);
            self.session.cursor = 0;
            self.session.toggle = false;
            self.session.state = SessionState::UploadSegment;
            let mut resp = [0u8; 8];
            resp[0] = 0x41;
            resp[1..3].copy_from_slice(&index.to_le_bytes());
            resp[3] = sub;
            resp[4..8].copy_from_slice(&(len as u32).to_le_bytes());
            Some(SdoResponse { data: resp })
        }
    }

    fn handle_upload_segment(&mut self, _od: &ObjectDictionary, cmd: u8) -> Option<SdoResponse> {
        if self.session.state != SessionState::UploadSegment {
            return Some(SdoResponse::abort(0, 0, AbortCode::CmdSpecifierInvalid));
        }
        let toggle = (cmd & 0x10) != 0;
        if toggle != self.session.toggle {
            self.session.state = SessionState::Aborted;
            return Some(SdoResponse::abort(0, 0, AbortCode::ToggleBitError));
        }
        let total = self.session.total_len.unwrap_or(0);
        let remaining = total - self.session.cursor;
        let chunk = remaining.min(7);
        let no_more = remaining <= 7;

        let mut resp = [0u8; 8];
        resp[1..1 + chunk].copy_from_slice(&self.session.buffer[self.session.cursor..self.session.cursor + chunk]);
        let n_empty = 7 - chunk;
        resp[0] = ((toggle as u8) << 4) | ((n_empty as u8) << 1) | (no_more as u8);

        self.session.cursor += chunk;
        self.session.toggle = !self.session.toggle;
        if no_more {
            self.session.reset();
        }
        Some(SdoResponse { data: resp })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Bounds, OdEntry};

    #[test]
    fn expedited_upload_scenario() {
        // OD (0x1000,0) = u32 0xDEAD_BEEF, read-only.
        let mut storage = 0xDEAD_BEEFu32.to_le_bytes();
        let mut entries = [OdEntry {
            index: 0x1000,
            sub: 0,
            access: AccessType::READ_ONLY,
            mappable: false,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());

        let req = [0x40, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &req).unwrap();
        assert_eq!(resp.data, [0x43, 0x00, 0x10, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn expedited_download_out_of_range_scenario() {
        // OD (0x1017,0) u16 bounded 0..10000.
        let mut storage = 0u16.to_le_bytes();
        let mut entries = [OdEntry {
            index: 0x1017,
            sub: 0,
            access: AccessType::READ_WRITE,
            mappable: false,
            bounds: Bounds::U16 { min: 0, max: 10000 },
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());

        let ok_req = [0x2B, 0x17, 0x10, 0x00, 0x10, 0x27, 0x00, 0x00];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &ok_req).unwrap();
        assert_eq!(resp.data, [0x60, 0x17, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]);

        let bad_req = [0x2B, 0x17, 0x10, 0x00, 0x11, 0x27, 0x00, 0x00];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &bad_req).unwrap();
        assert_eq!(resp.data, [0x80, 0x17, 0x10, 0x00, 0x32, 0x00, 0x09, 0x06]);
        assert_eq!(u16::from_le_bytes(storage), 10000);
    }

    #[test]
    fn stopped_state_drops_all_frames() {
        let mut storage = 0u32.to_le_bytes();
        let mut entries = [OdEntry {
            index: 0x1000,
            sub: 0,
            access: AccessType::READ_ONLY,
            mappable: false,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());
        let req = [0x40, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(server.handle_frame(&mut od, NmtState::Stopped, &req).is_none());
    }

    #[test]
    fn segmented_download_commits_once_on_completion() {
        let mut storage = [0u8; 6];
        let mut entries = [OdEntry {
            index: 0x2000,
            sub: 0,
            access: AccessType::READ_WRITE,
            mappable: false,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());

        // initiate download, size indicated, not expedited, total len = 6
        let init = [0x21, 0x00, 0x20, 0x00, 0x06, 0x00, 0x00, 0x00];
        server.handle_frame(&mut od, NmtState::PreOperational, &init).unwrap();
        // storage must be untouched mid-transfer
        assert_eq!(storage, [0u8; 6]);

        // first segment, toggle=0, 6 bytes remain but max 7 per segment -> not-more since <=7
        let seg = [0x01, 1, 2, 3, 4, 5, 6, 0];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &seg).unwrap();
        assert_eq!(resp.data[0] & 0x20, 0x20);
        assert_eq!(storage, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn block_download_commits_full_payload() {
        let mut storage = [0u8; 10];
        let mut entries = [OdEntry {
            index: 0x2001,
            sub: 0,
            access: AccessType::READ_WRITE,
            mappable: false,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());

        // initiate block download, crc disabled, size indicated = 10 bytes
        let init = [0xC2, 0x01, 0x20, 0x00, 10, 0, 0, 0];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &init).unwrap();
        assert_eq!(resp.data[0] & 0xE0, 0xA0);

        // seg 1: bytes 0..7, not last
        let seg1 = [1u8, 0, 1, 2, 3, 4, 5, 6];
        assert!(server.handle_frame(&mut od, NmtState::PreOperational, &seg1).is_none());
        // seg 2: bytes 7..10 + padding, last of the (only) sub-block and of the transfer
        let seg2 = [0x80 | 2u8, 7, 8, 9, 0xAA, 0xAA, 0xAA, 0xAA];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &seg2).unwrap();
        assert_eq!(resp.data[1], 2); // last_good_seq acked

        // end block download: last segment carried 3 valid bytes -> n_empty=4
        let end = [0xC0 | (4 << 2) | 1, 0, 0, 0, 0, 0, 0, 0];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &end).unwrap();
        assert_eq!(resp.data[0] & 0xE0, 0xA0);
        assert_eq!(storage, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn block_download_out_of_order_segment_is_dropped() {
        let mut storage = [0u8; 7];
        let mut entries = [OdEntry {
            index: 0x2002,
            sub: 0,
            access: AccessType::READ_WRITE,
            mappable: false,
            bounds: Bounds::None,
            storage: &mut storage,
        }];
        let mut od = ObjectDictionary::new_sorted(&mut entries);
        let mut server = SdoServer::new(NodeId::new(5).unwrap());

        let init = [0xC2, 0x02, 0x20, 0x00, 7, 0, 0, 0];
        server.handle_frame(&mut od, NmtState::PreOperational, &init).unwrap();

        // seq=2 arrives before seq=1: dropped, no ack, no state change.
        let wrong = [0x80 | 2u8, 0, 1, 2, 3, 4, 5, 6];
        assert!(server.handle_frame(&mut od, NmtState::PreOperational, &wrong).is_none());

        // correct seq=1, last segment of a 7-byte transfer.
        let seg1 = [0x80 | 1u8, 0, 1, 2, 3, 4, 5, 6];
        let resp = server.handle_frame(&mut od, NmtState::PreOperational, &seg1).unwrap();
        assert_eq!(resp.data[1], 1);
    }
}

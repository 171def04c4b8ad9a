//! CAN frame type shared across the core and the driver boundary.

use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// An 11-bit CANopen frame. Extended IDs are carried for pass-through only:
/// extended frames are out of scope for this crate's own protocol logic,
/// but the frame type still carries an IDE/ExtId field so a driver sharing
/// the bus with non-CANopen extended-ID traffic can pass it through without
/// a second frame type at the boundary. Every component in this crate only
/// ever constructs standard-ID frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    rtr: bool,
    dlc: u8,
    data: [u8; 8],
}

#[cfg(feature = "defmt")]
impl defmt::Format for CanFrame {
    fn format(&self, f: defmt::Formatter) {
        let raw = match self.id {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(id) => id.as_raw(),
        };
        defmt::write!(
            f,
            "CanFrame{{ id: {=u32:#x}, rtr: {=bool}, dlc: {=u8}, data: {=[u8]} }}",
            raw,
            self.rtr,
            self.dlc,
            self.data()
        );
    }
}

impl CanFrame {
    /// Build a standard-ID data frame. `ident` is masked to 11 bits; `data`
    /// beyond `dlc` bytes is ignored.
    pub fn new_standard(ident: u16, data: &[u8]) -> Option<Self> {
        let dlc = data.len();
        if dlc > 8 {
            return None;
        }
        let std_id = StandardId::new(ident & 0x7FF)?;
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(data);
        Some(CanFrame {
            id: Id::Standard(std_id),
            rtr: false,
            dlc: dlc as u8,
            data: buf,
        })
    }

    /// Build a standard-ID remote (RTR) frame requesting `dlc` bytes.
    pub fn new_remote(ident: u16, dlc: u8) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        let std_id = StandardId::new(ident & 0x7FF)?;
        Some(CanFrame {
            id: Id::Standard(std_id),
            rtr: true,
            dlc,
            data: [0u8; 8],
        })
    }

    /// Raw 11-bit identifier, or `None` if this is (pass-through) extended.
    pub fn standard_ident(&self) -> Option<u16> {
        match self.id {
            Id::Standard(id) => Some(id.as_raw()),
            Id::Extended(_) => None,
        }
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        let dlc = data.len();
        if dlc > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(data);
        Some(CanFrame {
            id: id.into(),
            rtr: false,
            dlc: dlc as u8,
            data: buf,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        Some(CanFrame {
            id: id.into(),
            rtr: true,
            dlc: dlc as u8,
            data: [0u8; 8],
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.rtr
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Unused by this crate's own code, but kept so downstream drivers that
/// pass through an extended-ID frame compile against the same type.
pub fn extended_passthrough(raw: u32, data: &[u8]) -> Option<CanFrame> {
    let dlc = data.len();
    if dlc > 8 {
        return None;
    }
    let ext = ExtendedId::new(raw)?;
    let mut buf = [0u8; 8];
    buf[..dlc].copy_from_slice(data);
    Some(CanFrame {
        id: Id::Extended(ext),
        rtr: false,
        dlc: dlc as u8,
        data: buf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_standard_data_frame() {
        let f = CanFrame::new_standard(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(f.standard_ident(), Some(0x123));
        assert_eq!(f.data(), &[1, 2, 3]);
        assert!(!f.is_remote_frame());
        assert!(!f.is_extended());
    }

    #[test]
    fn rejects_oversized_payload() {
        assert!(CanFrame::new_standard(0x123, &[0u8; 9]).is_none());
    }

    #[test]
    fn masks_ident_to_11_bits() {
        let f = CanFrame::new_standard(0x7FF_FFFF, &[]).unwrap();
        assert_eq!(f.standard_ident(), Some(0x7FF));
    }
}

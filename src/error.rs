//! Node-level API error set.
//!
//! These are the errors returned synchronously from `init`-time and
//! `send`/`rx_register`-style API calls. They are always non-fatal to the
//! bus: a protocol violation observed *on the wire* is reported via an SDO
//! abort or an EMCY frame instead (see [`crate::sdo::AbortCode`] and
//! [`crate::emcy`]).

/// Error returned from the node's public API boundary.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    /// An argument was out of range or otherwise invalid.
    IllegalArgument,
    /// A fixed-capacity table (filter slots, TX buffers, PDO mappings, ...)
    /// is full.
    OutOfMemory,
    /// A session or operation exceeded its deadline.
    Timeout,
    /// The requested bitrate is not supported by the driver.
    IllegalBaudrate,
    /// The software RX queue overflowed.
    RxOverflow,
    /// An RPDO's mapped length didn't match the received frame.
    RxPdoOverflow,
    /// A received frame had an unexpected DLC for its identifier.
    RxMsgLength,
    /// A received RPDO frame's DLC didn't match its mapping.
    RxPdoLength,
    /// A TX buffer was still full when a new send was attempted.
    TxOverflow,
    /// A synchronous TPDO was due outside the sync window.
    TxPdoWindow,
    /// A TX buffer handle was used before being configured.
    TxUnconfigured,
    /// Bad combination of parameters for the attempted operation.
    Parameters,
    /// Data read back did not match what was expected (internal consistency).
    DataCorrupt,
    /// A CRC check failed.
    Crc,
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            ApiError::IllegalArgument => "illegal argument",
            ApiError::OutOfMemory => "out of memory",
            ApiError::Timeout => "timeout",
            ApiError::IllegalBaudrate => "illegal baudrate",
            ApiError::RxOverflow => "RX overflow",
            ApiError::RxPdoOverflow => "RX PDO overflow",
            ApiError::RxMsgLength => "RX message length mismatch",
            ApiError::RxPdoLength => "RX PDO length mismatch",
            ApiError::TxOverflow => "TX overflow",
            ApiError::TxPdoWindow => "TX PDO outside sync window",
            ApiError::TxUnconfigured => "TX buffer unconfigured",
            ApiError::Parameters => "bad parameters",
            ApiError::DataCorrupt => "data corrupt",
            ApiError::Crc => "CRC error",
        };
        f.write_str(msg)
    }
}

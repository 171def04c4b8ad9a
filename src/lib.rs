//! A CiA-301 CANopen node core: object dictionary, SDO server, PDO engine,
//! NMT/heartbeat, SYNC and EMCY, generic over a caller-supplied CAN driver.
//!
//! The crate is `no_std` by default so it can run on the same class of
//! hardware as the reference CAN driver it's built on top of; enable the
//! `std` feature to build host-side (e.g. for a SocketCAN-backed
//! [`can::Driver`], or to run the test suite) and the `defmt` feature to
//! route logging through `defmt` instead of the `log` facade.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

pub mod can;
pub mod crc;
pub mod emcy;
pub mod error;
pub mod frame;
pub mod ids;
pub mod nmt;
pub mod node;
pub mod od;
pub mod pdo;
pub mod sdo;
pub mod sync;

pub use can::{CanModule, Driver};
pub use error::ApiError;
pub use ids::NodeId;
pub use node::{Node, NodeConfig};
pub use od::ObjectDictionary;

/// Re-exported so a consumer sharing a `Node` between an RX interrupt and a
/// main loop can pick the same `critical-section` implementation crate this
/// core is built against, without adding its own direct dependency on it.
pub use critical_section;

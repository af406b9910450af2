//! BLE communication module.
//!
//! This module defines the channel boundary the session drives and a
//! btleplug implementation of it.

pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use characteristics::BtleLink;
pub use connection::{ConnectionEvent, ConnectionState};
pub use scanner::BtleTransport;
pub use transport::{DeviceIdentity, Endpoints, Link, LinkEvent, LinkEventSender, Transport};
pub use uuids::*;

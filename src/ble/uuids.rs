//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for controller communication.

use uuid::Uuid;

/// Controller service UUID.
pub const CONTROLLER_SERVICE_UUID: Uuid = Uuid::from_u128(0x5fb7_0000_8e9d_4f7a_b1b8_24c1c5f1a0d3);

/// Telemetry characteristic UUID (Notify). Delivers 20-byte frames.
pub const TELEMETRY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x5fb7_0001_8e9d_4f7a_b1b8_24c1c5f1a0d3);

/// Control characteristic UUID (Read, Write). Accepts 2-byte commands.
///
/// Reading it requires an encrypted link, which is what triggers pairing.
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x5fb7_0002_8e9d_4f7a_b1b8_24c1c5f1a0d3);

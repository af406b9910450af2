// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # pitlink-ble
//!
//! A Rust library for monitoring and controlling Bluetooth Low Energy
//! barbecue temperature controllers.
//!
//! The controller streams a 20-byte telemetry frame over a notify
//! characteristic and accepts 2-byte `[opcode, argument]` commands on a
//! read/write characteristic.
//!
//! ## Features
//!
//! - **Telemetry Decoding**: Pit and food probe temperatures, setpoints,
//!   alarms, fan and lid state, delay timer and staged-cook settings
//! - **Command Encoding**: All fifteen settings, clamped to device ranges
//! - **Connection Session**: Retries, one automatic reconnect after a drop,
//!   and pairing/authorization reporting
//! - **Fuel Estimation**: Low-fuel detection from fan duty and pit
//!   temperature trend
//! - **Setting Verification**: Sent values are checked against the next
//!   telemetry frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pitlink_ble::{protocol::Setting, ConnectionSession, Result, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = ConnectionSession::bluetooth(SessionConfig::default()).await?;
//!     let report = session.connect().await?;
//!     println!("Connected to {}", report.device);
//!
//!     session.apply(Setting::PitTarget(225)).await?;
//!
//!     let mut telemetry = session.subscribe_telemetry();
//!     while let Ok(update) = telemetry.recv().await {
//!         println!(
//!             "Pit {:?} F, fuel {}",
//!             update.reading.pit_temperature.fahrenheit(),
//!             update.fuel.level
//!         );
//!     }
//!
//!     session.disconnect().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. Pairing
//! prompts are handled by the system agent; a rejected write surfaces as
//! [`Error::AuthorizationRequired`].
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use config::{DeviceFilter, SessionConfig};
pub use error::{Error, Remediation, Result};
pub use session::{Applied, CallbackHandle, ConnectReport, ConnectionSession};
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius};

// Re-export commonly used types from submodules
pub use ble::{
    BtleTransport, ConnectionEvent, ConnectionState, DeviceIdentity, Link, LinkEventSender,
    Transport,
};
pub use data::{AlarmKind, AlarmTransition, FuelConfig, FuelLevel, FuelStatus, TimedReading};
pub use monitor::{SettingCheck, TelemetryUpdate};
pub use protocol::{
    CommandRequest, ProbeTemperature, Setting, StatusFlags, TelemetryReading, Verification,
};

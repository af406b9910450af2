//! Data derived from telemetry.
//!
//! This module contains the fuel estimator, alarm edge tracking and the
//! bounded reading history.

pub mod alarms;
pub mod fuel;
pub mod history;

pub use alarms::{AlarmKind, AlarmTracker, AlarmTransition};
pub use fuel::{FuelConfig, FuelEstimator, FuelLevel, FuelStatus};
pub use history::{TelemetryHistory, TimedReading};

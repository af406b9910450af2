//! Protocol module for decoding telemetry and encoding commands.
//!
//! This module contains the implementations for:
//! - Telemetry frame decoding (20-byte notifications)
//! - Command frame encoding (2-byte writes)

pub mod commands;
pub mod telemetry;

pub use commands::{
    CommandRequest, EncodeWarning, Encoded, Opcode, Setting, TemperatureUnit, Verification,
};
pub use telemetry::{DelayTimer, ProbeTemperature, StagedCook, StatusFlags, TelemetryReading};

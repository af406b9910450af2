//! Telemetry frame decoding.
//!
//! The controller notifies a fixed 20-byte frame roughly once a second.
//! Every field is a single byte except the three probe temperatures, which
//! are big-endian `u16` values.

use crate::error::{Error, Result};
use crate::utils::fahrenheit_to_celsius;

/// Offset added to pit-set family bytes (`targetF = raw + 145`).
pub const PIT_SET_OFFSET: u16 = 145;

/// A probe temperature as reported by the controller, in whole °F.
///
/// The value `999` means the probe is unplugged. It is never a temperature
/// and must not be averaged or alarmed against; use [`fahrenheit`](Self::fahrenheit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeTemperature(pub u16);

impl ProbeTemperature {
    /// Disconnected-probe sentinel.
    pub const DISCONNECTED: Self = Self(999);

    /// Check if a probe is plugged in.
    pub fn is_connected(&self) -> bool {
        *self != Self::DISCONNECTED
    }

    /// Temperature in °F, or `None` when the probe is unplugged.
    pub fn fahrenheit(&self) -> Option<u16> {
        self.is_connected().then_some(self.0)
    }

    /// Temperature in °C, or `None` when the probe is unplugged.
    pub fn celsius(&self) -> Option<f64> {
        self.fahrenheit().map(|f| fahrenheit_to_celsius(f as f64))
    }
}

/// Decode a pit-set family byte. Zero maps to `None` when the field is optional.
pub fn decode_pit_set(raw: u8) -> Option<u16> {
    (raw != 0).then(|| raw as u16 + PIT_SET_OFFSET)
}

/// Decode an alarm/trigger family byte (°F stored directly, zero = disabled).
pub fn decode_direct(raw: u8) -> Option<u16> {
    (raw != 0).then_some(raw as u16)
}

/// Flags byte (offset 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusFlags {
    /// Food 1 alarm is configured.
    pub food1_alarm_set: bool,
    /// Food 2 alarm is configured.
    pub food2_alarm_set: bool,
    /// Food 1 alarm has tripped.
    pub food1_alarm_tripped: bool,
    /// Food 2 alarm has tripped.
    pub food2_alarm_tripped: bool,
    /// Pit is above the alarm band.
    pub pit_over_temperature: bool,
    /// Pit is below the alarm band.
    pub pit_under_temperature: bool,
    /// Lid-open detected.
    pub lid_open: bool,
    /// Bit 0, meaning unknown. Kept so the byte can be reproduced.
    pub reserved: bool,
}

impl StatusFlags {
    /// Unpack the flags byte.
    pub fn from_raw(raw: u8) -> Self {
        Self {
            reserved: raw & 0x01 != 0,
            food1_alarm_set: raw & 0x02 != 0,
            food2_alarm_set: raw & 0x04 != 0,
            food1_alarm_tripped: raw & 0x08 != 0,
            food2_alarm_tripped: raw & 0x10 != 0,
            pit_over_temperature: raw & 0x20 != 0,
            pit_under_temperature: raw & 0x40 != 0,
            lid_open: raw & 0x80 != 0,
        }
    }

    /// Pack back into the flags byte.
    pub fn to_raw(&self) -> u8 {
        [
            self.reserved,
            self.food1_alarm_set,
            self.food2_alarm_set,
            self.food1_alarm_tripped,
            self.food2_alarm_tripped,
            self.pit_over_temperature,
            self.pit_under_temperature,
            self.lid_open,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (bit, set)| acc | ((*set as u8) << bit))
    }

    /// Whether any alarm condition is currently raised.
    pub fn any_alarm(&self) -> bool {
        self.food1_alarm_tripped
            || self.food2_alarm_tripped
            || self.pit_over_temperature
            || self.pit_under_temperature
    }
}

/// Delay timer state: start the cook at a different pit temperature later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DelayTimer {
    /// Whether the timer is running.
    pub enabled: bool,
    /// Duration in 15-minute units.
    pub duration_quarter_hours: u8,
    /// Pit target once the timer expires.
    pub pit_set: Option<u16>,
}

impl DelayTimer {
    /// Timer duration in minutes.
    pub fn duration_minutes(&self) -> u32 {
        self.duration_quarter_hours as u32 * 15
    }
}

/// Staged cooking: when the food reaches `trigger`, change the pit to `pit_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StagedCook {
    /// Food temperature that fires the stage, °F.
    pub trigger: Option<u16>,
    /// Pit target for the next stage, °F.
    pub pit_set: Option<u16>,
}

/// One decoded telemetry frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryReading {
    /// Pit temperature.
    pub pit_temperature: ProbeTemperature,
    /// Food probe 1 temperature.
    pub food1_temperature: ProbeTemperature,
    /// Food probe 2 temperature.
    pub food2_temperature: ProbeTemperature,
    /// Pit target, °F.
    pub pit_set: u16,
    /// Food 1 alarm temperature, °F.
    pub food1_alarm: Option<u16>,
    /// Food 2 alarm temperature, °F.
    pub food2_alarm: Option<u16>,
    /// Allowed pit deviation before the pit alarm fires, °F.
    pub pit_alarm: Option<u16>,
    /// Fan speed: 0 is auto, 1-7 manual.
    pub fan_speed: u8,
    /// Lid detection enabled.
    pub lid_detect: bool,
    /// Minutes since power on, wrapping at 16.
    pub uptime_minutes: u8,
    /// Toggles every few seconds while the controller is alive.
    pub heartbeat: bool,
    /// Delay timer.
    pub delay: DelayTimer,
    /// Food 1 staged cook.
    pub food1_stage: StagedCook,
    /// Food 2 staged cook.
    pub food2_stage: StagedCook,
    /// Current fan duty, percent.
    pub fan_duty_percent: u8,
    /// Alarm and lid flags.
    pub flags: StatusFlags,
}

impl TelemetryReading {
    /// Exact frame size.
    pub const FRAME_SIZE: usize = 20;

    /// Decode a telemetry frame.
    ///
    /// Frame layout:
    /// - Byte 0: Fan duty percent
    /// - Byte 1: Delay timer duration (×15 min)
    /// - Byte 2: Delay pit set (raw + 145, 0 = off)
    /// - Bytes 3-4: Pit temperature (u16 big-endian)
    /// - Bytes 5-6: Food 1 temperature (u16 big-endian)
    /// - Bytes 7-8: Food 2 temperature (u16 big-endian)
    /// - Byte 9: Uptime (bits 4-7), lid detect (bit 3), fan speed (bits 0-2)
    /// - Byte 10: Pit set (raw + 145)
    /// - Bytes 11-13: Food 1 alarm, food 2 alarm, pit alarm (direct, 0 = off)
    /// - Byte 14: Status (bit 7 heartbeat, bit 0 delay timer enabled)
    /// - Byte 15: Flags
    /// - Bytes 16-19: Food 1 trigger, food 1 pit set, food 2 trigger, food 2 pit set
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let frame: &[u8; Self::FRAME_SIZE] =
            frame.try_into().map_err(|_| Error::MalformedFrame {
                expected: Self::FRAME_SIZE,
                actual: frame.len(),
            })?;

        let temperature =
            |offset: usize| ProbeTemperature(u16::from_be_bytes([frame[offset], frame[offset + 1]]));

        let packed = frame[9];
        let status = frame[14];

        Ok(Self {
            pit_temperature: temperature(3),
            food1_temperature: temperature(5),
            food2_temperature: temperature(7),
            pit_set: frame[10] as u16 + PIT_SET_OFFSET,
            food1_alarm: decode_direct(frame[11]),
            food2_alarm: decode_direct(frame[12]),
            pit_alarm: decode_direct(frame[13]),
            fan_speed: packed & 0x07,
            lid_detect: packed & 0x08 != 0,
            uptime_minutes: packed >> 4,
            heartbeat: status & 0x80 != 0,
            delay: DelayTimer {
                enabled: status & 0x01 != 0,
                duration_quarter_hours: frame[1],
                pit_set: decode_pit_set(frame[2]),
            },
            food1_stage: StagedCook {
                trigger: decode_direct(frame[16]),
                pit_set: decode_pit_set(frame[17]),
            },
            food2_stage: StagedCook {
                trigger: decode_direct(frame[18]),
                pit_set: decode_pit_set(frame[19]),
            },
            fan_duty_percent: frame[0],
            flags: StatusFlags::from_raw(frame[15]),
        })
    }

    /// Fan is under automatic (PID) control.
    pub fn is_fan_auto(&self) -> bool {
        self.fan_speed == 0
    }

    /// Pit temperature in °F if the pit probe is plugged in.
    pub fn pit_fahrenheit(&self) -> Option<u16> {
        self.pit_temperature.fahrenheit()
    }
}

//! Command encoding.
//!
//! Every setting change is a 2-byte write to the control characteristic:
//! `[opcode, argument]`. Each setting has its own accepted range and storage
//! transform; inputs outside the range are clamped, never rejected, which
//! matches how the controller itself treats bad values.

use crate::protocol::telemetry::{TelemetryReading, PIT_SET_OFFSET};
use crate::utils::clamp_optional;

/// Pit set range, °F.
pub const PIT_SET_RANGE: (u16, u16) = (150, 400);
/// Food alarm and temp trigger range, °F.
pub const FOOD_TEMP_RANGE: (u16, u16) = (50, 250);
/// Pit alarm deviation range, °F.
pub const PIT_ALARM_RANGE: (u16, u16) = (20, 100);
/// Highest manual fan speed accepted by the controller.
pub const MAX_FAN_SPEED: u8 = 5;
/// Highest sound level.
pub const MAX_SOUND_LEVEL: u8 = 5;
/// Display brightness range.
pub const BRIGHTNESS_RANGE: (u8, u8) = (1, 3);
/// Longest delay timer in 15-minute units (24 hours).
pub const MAX_DELAY_QUARTER_HOURS: u8 = 96;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// Pit target temperature (0x01).
    PitTarget = 0x01,
    /// Food 1 alarm (0x02).
    Food1Alarm = 0x02,
    /// Food 2 alarm (0x03).
    Food2Alarm = 0x03,
    /// Pit alarm deviation (0x04).
    PitAlarm = 0x04,
    /// Lid detect (0x05).
    LidDetect = 0x05,
    /// Fan speed (0x06).
    FanSpeed = 0x06,
    /// Temperature units (0x07).
    TemperatureUnits = 0x07,
    /// Sound level (0x08).
    SoundLevel = 0x08,
    /// Display brightness (0x09).
    DisplayBrightness = 0x09,
    /// Delay timer duration (0x0A).
    DelayTimer = 0x0A,
    /// Delay pit set (0x0B).
    DelayPitSet = 0x0B,
    /// Food 1 temp trigger (0x0C).
    Food1Trigger = 0x0C,
    /// Food 1 pit set (0x0D).
    Food1PitSet = 0x0D,
    /// Food 2 temp trigger (0x0E).
    Food2Trigger = 0x0E,
    /// Food 2 pit set (0x0F).
    Food2PitSet = 0x0F,
}

impl Opcode {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::PitTarget,
            0x02 => Self::Food1Alarm,
            0x03 => Self::Food2Alarm,
            0x04 => Self::PitAlarm,
            0x05 => Self::LidDetect,
            0x06 => Self::FanSpeed,
            0x07 => Self::TemperatureUnits,
            0x08 => Self::SoundLevel,
            0x09 => Self::DisplayBrightness,
            0x0A => Self::DelayTimer,
            0x0B => Self::DelayPitSet,
            0x0C => Self::Food1Trigger,
            0x0D => Self::Food1PitSet,
            0x0E => Self::Food2Trigger,
            0x0F => Self::Food2PitSet,
            _ => return None,
        })
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Whether the setting shows up in telemetry and can be checked after a write.
    ///
    /// Units, sound and brightness live only in the controller's non-volatile
    /// settings and are never reported back.
    pub fn is_verifiable(&self) -> bool {
        !matches!(
            self,
            Self::TemperatureUnits | Self::SoundLevel | Self::DisplayBrightness
        )
    }
}

/// A 2-byte command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandRequest {
    /// The setting being changed.
    pub opcode: Opcode,
    /// Encoded argument byte.
    pub argument: u8,
}

impl CommandRequest {
    /// Frame size on the wire.
    pub const SIZE: usize = 2;

    /// Create a request from an already encoded argument.
    pub fn new(opcode: Opcode, argument: u8) -> Self {
        Self { opcode, argument }
    }

    /// Serialize for writing to the control characteristic.
    pub fn to_bytes(&self) -> [u8; 2] {
        [self.opcode.to_raw(), self.argument]
    }
}

/// Something the encoder changed that the caller should tell the user about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeWarning {
    /// Brightness 0 is not honored by the firmware; level 1 was sent instead.
    BrightnessZeroSubstituted,
}

impl std::fmt::Display for EncodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BrightnessZeroSubstituted => write!(
                f,
                "display brightness 0 is not supported by the controller, using 1"
            ),
        }
    }
}

/// A command together with any substitution made while encoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    /// The command to send.
    pub request: CommandRequest,
    /// Set when the encoder had to substitute a value.
    pub warning: Option<EncodeWarning>,
}

impl From<CommandRequest> for Encoded {
    fn from(request: CommandRequest) -> Self {
        Self {
            request,
            warning: None,
        }
    }
}

/// Temperature units shown on the controller display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TemperatureUnit {
    /// Degrees Fahrenheit.
    #[default]
    Fahrenheit,
    /// Degrees Celsius.
    Celsius,
}

impl TemperatureUnit {
    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        match self {
            Self::Fahrenheit => 0,
            Self::Celsius => 1,
        }
    }
}

fn encode_pit_set(temp: u16) -> u8 {
    match temp {
        0 => 0,
        t => (t - PIT_SET_OFFSET) as u8,
    }
}

/// Set the pit target. Clamped to 150-400 °F.
pub fn set_pit_temp(temp: u16) -> CommandRequest {
    let temp = temp.clamp(PIT_SET_RANGE.0, PIT_SET_RANGE.1);
    CommandRequest::new(Opcode::PitTarget, encode_pit_set(temp))
}

/// Set the food 1 alarm. 0 disables, otherwise clamped to 50-250 °F.
pub fn set_food1_alarm(temp: u16) -> CommandRequest {
    food_temp(Opcode::Food1Alarm, temp)
}

/// Set the food 2 alarm. 0 disables, otherwise clamped to 50-250 °F.
pub fn set_food2_alarm(temp: u16) -> CommandRequest {
    food_temp(Opcode::Food2Alarm, temp)
}

/// Set the pit alarm deviation. 0 disables, otherwise clamped to 20-100 °F.
pub fn set_pit_alarm(deviation: u16) -> CommandRequest {
    let deviation = clamp_optional(deviation, PIT_ALARM_RANGE.0, PIT_ALARM_RANGE.1);
    CommandRequest::new(Opcode::PitAlarm, deviation as u8)
}

/// Enable or disable lid-open detection.
pub fn set_lid_detect(enabled: bool) -> CommandRequest {
    CommandRequest::new(Opcode::LidDetect, enabled as u8)
}

/// Set the fan speed. 0 is automatic, manual speeds are clamped to 1-5.
pub fn set_fan_speed(speed: u8) -> CommandRequest {
    CommandRequest::new(Opcode::FanSpeed, speed.min(MAX_FAN_SPEED))
}

/// Set the display units.
pub fn set_temperature_units(unit: TemperatureUnit) -> CommandRequest {
    CommandRequest::new(Opcode::TemperatureUnits, unit.to_raw())
}

/// Set the buzzer volume. 0 mutes, otherwise clamped to 1-5.
pub fn set_sound_level(level: u8) -> CommandRequest {
    CommandRequest::new(Opcode::SoundLevel, level.min(MAX_SOUND_LEVEL))
}

/// Set the display brightness, 1-3.
///
/// The firmware does not reliably honor level 0, so it is replaced with
/// level 1 and the substitution is reported in [`Encoded::warning`].
pub fn set_display_brightness(level: u8) -> Encoded {
    let warning = (level == 0).then_some(EncodeWarning::BrightnessZeroSubstituted);
    let level = level.clamp(BRIGHTNESS_RANGE.0, BRIGHTNESS_RANGE.1);
    Encoded {
        request: CommandRequest::new(Opcode::DisplayBrightness, level),
        warning,
    }
}

/// Set the delay timer in 15-minute units, up to 96 (24 hours).
pub fn set_delay_timer(quarter_hours: u8) -> CommandRequest {
    CommandRequest::new(Opcode::DelayTimer, quarter_hours.min(MAX_DELAY_QUARTER_HOURS))
}

/// Set the pit target used once the delay timer expires. 0 disables.
pub fn set_delay_pit_set(temp: u16) -> CommandRequest {
    pit_set(Opcode::DelayPitSet, temp)
}

/// Set the food 1 staged-cook trigger. 0 disables.
pub fn set_food1_trigger(temp: u16) -> CommandRequest {
    food_temp(Opcode::Food1Trigger, temp)
}

/// Set the pit target applied when the food 1 trigger fires. 0 disables.
pub fn set_food1_pit_set(temp: u16) -> CommandRequest {
    pit_set(Opcode::Food1PitSet, temp)
}

/// Set the food 2 staged-cook trigger. 0 disables.
pub fn set_food2_trigger(temp: u16) -> CommandRequest {
    food_temp(Opcode::Food2Trigger, temp)
}

/// Set the pit target applied when the food 2 trigger fires. 0 disables.
pub fn set_food2_pit_set(temp: u16) -> CommandRequest {
    pit_set(Opcode::Food2PitSet, temp)
}

fn food_temp(opcode: Opcode, temp: u16) -> CommandRequest {
    let temp = clamp_optional(temp, FOOD_TEMP_RANGE.0, FOOD_TEMP_RANGE.1);
    CommandRequest::new(opcode, temp as u8)
}

fn pit_set(opcode: Opcode, temp: u16) -> CommandRequest {
    let temp = clamp_optional(temp, PIT_SET_RANGE.0, PIT_SET_RANGE.1);
    CommandRequest::new(opcode, encode_pit_set(temp))
}

/// A logical setting change, one variant per opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Setting {
    /// Pit target, °F.
    PitTarget(u16),
    /// Food 1 alarm, °F (0 = off).
    Food1Alarm(u16),
    /// Food 2 alarm, °F (0 = off).
    Food2Alarm(u16),
    /// Pit alarm deviation, °F (0 = off).
    PitAlarm(u16),
    /// Lid detection.
    LidDetect(bool),
    /// Fan speed (0 = auto).
    FanSpeed(u8),
    /// Display units.
    TemperatureUnits(TemperatureUnit),
    /// Buzzer volume (0 = mute).
    SoundLevel(u8),
    /// Display brightness.
    DisplayBrightness(u8),
    /// Delay timer, 15-minute units.
    DelayTimer(u8),
    /// Pit target after the delay timer, °F (0 = off).
    DelayPitSet(u16),
    /// Food 1 staged-cook trigger, °F (0 = off).
    Food1Trigger(u16),
    /// Food 1 staged-cook pit target, °F (0 = off).
    Food1PitSet(u16),
    /// Food 2 staged-cook trigger, °F (0 = off).
    Food2Trigger(u16),
    /// Food 2 staged-cook pit target, °F (0 = off).
    Food2PitSet(u16),
}

/// Outcome of checking a sent setting against telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Verification {
    /// Telemetry reports the value that was sent.
    Confirmed,
    /// Telemetry reports something else.
    Mismatch {
        /// Value after clamping.
        expected: u16,
        /// Value the controller reported.
        observed: u16,
    },
    /// The setting is not reported in telemetry.
    NotVerifiable,
}

impl Setting {
    /// The opcode this setting is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::PitTarget(_) => Opcode::PitTarget,
            Self::Food1Alarm(_) => Opcode::Food1Alarm,
            Self::Food2Alarm(_) => Opcode::Food2Alarm,
            Self::PitAlarm(_) => Opcode::PitAlarm,
            Self::LidDetect(_) => Opcode::LidDetect,
            Self::FanSpeed(_) => Opcode::FanSpeed,
            Self::TemperatureUnits(_) => Opcode::TemperatureUnits,
            Self::SoundLevel(_) => Opcode::SoundLevel,
            Self::DisplayBrightness(_) => Opcode::DisplayBrightness,
            Self::DelayTimer(_) => Opcode::DelayTimer,
            Self::DelayPitSet(_) => Opcode::DelayPitSet,
            Self::Food1Trigger(_) => Opcode::Food1Trigger,
            Self::Food1PitSet(_) => Opcode::Food1PitSet,
            Self::Food2Trigger(_) => Opcode::Food2Trigger,
            Self::Food2PitSet(_) => Opcode::Food2PitSet,
        }
    }

    /// Encode into a command frame.
    pub fn encode(&self) -> Encoded {
        match *self {
            Self::PitTarget(t) => set_pit_temp(t).into(),
            Self::Food1Alarm(t) => set_food1_alarm(t).into(),
            Self::Food2Alarm(t) => set_food2_alarm(t).into(),
            Self::PitAlarm(d) => set_pit_alarm(d).into(),
            Self::LidDetect(on) => set_lid_detect(on).into(),
            Self::FanSpeed(s) => set_fan_speed(s).into(),
            Self::TemperatureUnits(u) => set_temperature_units(u).into(),
            Self::SoundLevel(l) => set_sound_level(l).into(),
            Self::DisplayBrightness(l) => set_display_brightness(l),
            Self::DelayTimer(q) => set_delay_timer(q).into(),
            Self::DelayPitSet(t) => set_delay_pit_set(t).into(),
            Self::Food1Trigger(t) => set_food1_trigger(t).into(),
            Self::Food1PitSet(t) => set_food1_pit_set(t).into(),
            Self::Food2Trigger(t) => set_food2_trigger(t).into(),
            Self::Food2PitSet(t) => set_food2_pit_set(t).into(),
        }
    }

    /// The logical value the controller should report after this setting is applied.
    ///
    /// Derived from the encoded argument so it always reflects clamping.
    fn expected_value(&self) -> u16 {
        let argument = self.encode().request.argument as u16;
        match self.opcode() {
            Opcode::PitTarget => argument + PIT_SET_OFFSET,
            Opcode::DelayPitSet | Opcode::Food1PitSet | Opcode::Food2PitSet
                if argument != 0 =>
            {
                argument + PIT_SET_OFFSET
            }
            _ => argument,
        }
    }

    /// Compare against a reading received after the setting was sent.
    pub fn verify(&self, reading: &TelemetryReading) -> Verification {
        let observed = match self.opcode() {
            Opcode::PitTarget => reading.pit_set,
            Opcode::Food1Alarm => reading.food1_alarm.unwrap_or(0),
            Opcode::Food2Alarm => reading.food2_alarm.unwrap_or(0),
            Opcode::PitAlarm => reading.pit_alarm.unwrap_or(0),
            Opcode::LidDetect => reading.lid_detect as u16,
            Opcode::FanSpeed => reading.fan_speed as u16,
            Opcode::DelayTimer => reading.delay.duration_quarter_hours as u16,
            Opcode::DelayPitSet => reading.delay.pit_set.unwrap_or(0),
            Opcode::Food1Trigger => reading.food1_stage.trigger.unwrap_or(0),
            Opcode::Food1PitSet => reading.food1_stage.pit_set.unwrap_or(0),
            Opcode::Food2Trigger => reading.food2_stage.trigger.unwrap_or(0),
            Opcode::Food2PitSet => reading.food2_stage.pit_set.unwrap_or(0),
            Opcode::TemperatureUnits | Opcode::SoundLevel | Opcode::DisplayBrightness => {
                return Verification::NotVerifiable;
            }
        };

        let expected = self.expected_value();
        if observed == expected {
            Verification::Confirmed
        } else {
            Verification::Mismatch { expected, observed }
        }
    }
}

//! Alarm edge detection.
//!
//! The controller reports alarm conditions as level flags on every frame.
//! Consumers that deliver notifications want edges instead, so each reading's
//! flags are compared against the previous reading's.

use crate::protocol::StatusFlags;

/// An alarm condition that can be raised by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AlarmKind {
    /// Food 1 reached its alarm temperature.
    Food1Done,
    /// Food 2 reached its alarm temperature.
    Food2Done,
    /// Pit is above the deviation band.
    PitOverTemperature,
    /// Pit is below the deviation band.
    PitUnderTemperature,
    /// Lid is open.
    LidOpen,
}

impl AlarmKind {
    /// All kinds in flag-bit order.
    pub const ALL: [Self; 5] = [
        Self::Food1Done,
        Self::Food2Done,
        Self::PitOverTemperature,
        Self::PitUnderTemperature,
        Self::LidOpen,
    ];

    /// Whether this condition is raised in `flags`.
    pub fn is_raised(&self, flags: &StatusFlags) -> bool {
        match self {
            Self::Food1Done => flags.food1_alarm_tripped,
            Self::Food2Done => flags.food2_alarm_tripped,
            Self::PitOverTemperature => flags.pit_over_temperature,
            Self::PitUnderTemperature => flags.pit_under_temperature,
            Self::LidOpen => flags.lid_open,
        }
    }
}

/// A change in an alarm condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AlarmTransition {
    /// The condition started.
    Raised(AlarmKind),
    /// The condition ended.
    Cleared(AlarmKind),
}

/// Tracks flags across readings and reports edges.
#[derive(Debug, Clone, Default)]
pub struct AlarmTracker {
    previous: Option<StatusFlags>,
}

impl AlarmTracker {
    /// Create a tracker that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `flags` with the previous call.
    ///
    /// The first call reports every raised condition so a late subscriber
    /// learns about alarms already in progress.
    pub fn update(&mut self, flags: StatusFlags) -> Vec<AlarmTransition> {
        let previous = self.previous.replace(flags).unwrap_or_default();

        AlarmKind::ALL
            .iter()
            .filter_map(|kind| match (kind.is_raised(&previous), kind.is_raised(&flags)) {
                (false, true) => Some(AlarmTransition::Raised(*kind)),
                (true, false) => Some(AlarmTransition::Cleared(*kind)),
                _ => None,
            })
            .collect()
    }

    /// Forget the previous flags, e.g. after a new connection.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

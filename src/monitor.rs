//! Per-reading bookkeeping done by the session.
//!
//! Every decoded frame passes through [`TelemetryMonitor::ingest`], which
//! feeds the fuel estimator, appends to the history, detects alarm edges,
//! tracks the heartbeat bit, and resolves settings waiting for confirmation.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::data::{
    AlarmTracker, AlarmTransition, FuelEstimator, FuelStatus, TelemetryHistory, TimedReading,
};
use crate::protocol::{Setting, TelemetryReading, Verification};

/// A sent setting checked against the first reading that followed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingCheck {
    /// What was sent.
    pub setting: Setting,
    /// What telemetry said about it.
    pub outcome: Verification,
}

/// Published for every decoded telemetry frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryUpdate {
    /// When the frame was received.
    pub timestamp: DateTime<Utc>,
    /// The decoded frame.
    pub reading: TelemetryReading,
    /// Fuel estimate after this reading.
    pub fuel: FuelStatus,
    /// Alarm edges since the previous reading.
    pub alarms: Vec<AlarmTransition>,
    /// Settings confirmed or contradicted by this reading.
    pub checks: Vec<SettingCheck>,
}

/// State derived from the telemetry stream.
#[derive(Debug)]
pub struct TelemetryMonitor {
    fuel: FuelEstimator,
    fuel_status: FuelStatus,
    history: TelemetryHistory,
    alarms: AlarmTracker,
    heartbeat: Option<bool>,
    last_heartbeat_toggle: Option<DateTime<Utc>>,
    pending: Vec<Setting>,
}

impl TelemetryMonitor {
    /// Create a monitor sized from the session config.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            fuel: FuelEstimator::new(config.fuel.clone()),
            fuel_status: FuelStatus::default(),
            history: TelemetryHistory::new(config.history_capacity),
            alarms: AlarmTracker::new(),
            heartbeat: None,
            last_heartbeat_toggle: None,
            pending: Vec::new(),
        }
    }

    /// Process one reading received at `now`.
    pub fn ingest(&mut self, reading: TelemetryReading, now: DateTime<Utc>) -> TelemetryUpdate {
        if self.heartbeat != Some(reading.heartbeat) {
            self.heartbeat = Some(reading.heartbeat);
            self.last_heartbeat_toggle = Some(now);
        }

        let fuel = self.fuel.update(&reading, now);
        self.fuel_status = fuel.clone();

        let alarms = self.alarms.update(reading.flags);
        for transition in &alarms {
            debug!("Alarm transition: {:?}", transition);
        }

        let checks: Vec<SettingCheck> = self
            .pending
            .drain(..)
            .map(|setting| SettingCheck {
                setting,
                outcome: setting.verify(&reading),
            })
            .collect();
        for check in &checks {
            if let Verification::Mismatch { expected, observed } = check.outcome {
                warn!(
                    "{:?} not applied: sent {}, controller reports {}",
                    check.setting.opcode(),
                    expected,
                    observed
                );
            }
        }

        self.history.push(now, reading.clone());

        TelemetryUpdate {
            timestamp: now,
            reading,
            fuel,
            alarms,
            checks,
        }
    }

    /// Remember a sent setting so the next reading can confirm it.
    ///
    /// Only the latest setting per opcode is kept. Settings that are not
    /// reported in telemetry are ignored.
    pub fn track_pending(&mut self, setting: Setting) {
        if !setting.opcode().is_verifiable() {
            return;
        }
        self.pending.retain(|s| s.opcode() != setting.opcode());
        self.pending.push(setting);
    }

    /// Whether the heartbeat bit has stopped toggling.
    ///
    /// With no readings at all there is no live heartbeat, so this is `true`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_heartbeat_toggle {
            Some(at) => (now - at).to_std().map(|e| e > timeout).unwrap_or(false),
            None => true,
        }
    }

    /// Clear per-link state when a new link comes up.
    ///
    /// Fuel and history survive reconnects; they describe the cook, not the link.
    pub fn link_reset(&mut self) {
        self.alarms.reset();
        self.heartbeat = None;
        self.last_heartbeat_toggle = None;
        self.pending.clear();
    }

    /// Most recent reading.
    pub fn latest(&self) -> Option<&TimedReading> {
        self.history.latest()
    }

    /// Last fuel estimate.
    pub fn fuel_status(&self) -> &FuelStatus {
        &self.fuel_status
    }

    /// Reading history.
    pub fn history(&self) -> &TelemetryHistory {
        &self.history
    }

    /// Restart fuel estimation, e.g. after adding charcoal.
    pub fn reset_fuel(&mut self) {
        self.fuel.reset();
        self.fuel_status = FuelStatus::default();
    }
}

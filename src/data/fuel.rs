//! Fuel level estimation.
//!
//! The controller has no fuel sensor. Running low on charcoal shows up as the
//! fan working harder while the pit still cools, so the estimator keeps a
//! trailing window of fan duty and pit temperature slope and classifies the
//! pair against fixed thresholds.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::protocol::TelemetryReading;

/// Estimator tuning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuelConfig {
    /// Length of the trailing window.
    pub window: std::time::Duration,
    /// Duty samples needed before classifying.
    pub min_duty_samples: usize,
    /// Drop-rate samples needed before classifying.
    pub min_drop_samples: usize,
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            window: std::time::Duration::from_secs(30 * 60),
            min_duty_samples: 11,
            min_drop_samples: 6,
        }
    }
}

/// Estimated fuel level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FuelLevel {
    /// About 20%: refuel now.
    Critical,
    /// About 40%.
    Low,
    /// About 70%.
    Medium,
    /// Full, or not enough evidence to say otherwise.
    #[default]
    Full,
}

impl FuelLevel {
    /// Nominal level in percent.
    pub fn percent(&self) -> u8 {
        match self {
            Self::Critical => 20,
            Self::Low => 40,
            Self::Medium => 70,
            Self::Full => 100,
        }
    }

    /// Classify from window means.
    pub fn classify(mean_duty_percent: f64, mean_drop_rate: f64) -> Self {
        if mean_duty_percent > 60.0 && mean_drop_rate < -0.5 {
            Self::Critical
        } else if mean_duty_percent > 50.0 && mean_drop_rate < -0.2 {
            Self::Low
        } else if mean_duty_percent > 40.0 {
            Self::Medium
        } else {
            Self::Full
        }
    }
}

impl std::fmt::Display for FuelLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::Full => write!(f, "ok"),
        }
    }
}

/// Result of one estimator update.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuelStatus {
    /// Classified level.
    pub level: FuelLevel,
    /// Mean fan duty over the window, percent.
    pub mean_duty_percent: f64,
    /// Mean pit slope over the window, °F per minute (negative = cooling).
    pub mean_drop_rate: f64,
    /// Duty samples in the window.
    pub duty_samples: usize,
    /// Slope samples in the window.
    pub drop_samples: usize,
    /// Still collecting the minimum sample counts.
    pub warming_up: bool,
    /// Set on the single update that enters the critical level.
    pub low_fuel_alert: bool,
}

impl Default for FuelStatus {
    fn default() -> Self {
        Self {
            level: FuelLevel::Full,
            mean_duty_percent: 0.0,
            mean_drop_rate: 0.0,
            duty_samples: 0,
            drop_samples: 0,
            warming_up: true,
            low_fuel_alert: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: DateTime<Utc>,
    value: f64,
}

/// Sliding-window fuel estimator.
#[derive(Debug, Clone)]
pub struct FuelEstimator {
    config: FuelConfig,
    fan_duty_samples: VecDeque<Sample>,
    temp_drop_samples: VecDeque<Sample>,
    last_pit: Option<(u16, DateTime<Utc>)>,
    low_fuel_alerted: bool,
}

impl Default for FuelEstimator {
    fn default() -> Self {
        Self::new(FuelConfig::default())
    }
}

impl FuelEstimator {
    /// Create an estimator with the given tuning.
    pub fn new(config: FuelConfig) -> Self {
        Self {
            config,
            fan_duty_samples: VecDeque::new(),
            temp_drop_samples: VecDeque::new(),
            last_pit: None,
            low_fuel_alerted: false,
        }
    }

    /// Estimated fan duty for a reading, percent.
    ///
    /// Manual speeds map linearly onto 1-7. In auto mode the controller's own
    /// duty is approximated from how far the pit is below its target.
    pub fn fan_duty(reading: &TelemetryReading) -> f64 {
        match reading.fan_speed {
            0 => match reading.pit_fahrenheit() {
                Some(pit) => {
                    let gap = reading.pit_set as f64 - pit as f64;
                    (gap / 50.0 * 100.0 + 30.0).clamp(0.0, 100.0)
                }
                None => 0.0,
            },
            speed => speed as f64 / 7.0 * 100.0,
        }
    }

    /// Feed one reading observed at `now`.
    ///
    /// Readings must arrive in time order. A disconnected pit probe never
    /// contributes a slope sample.
    pub fn update(&mut self, reading: &TelemetryReading, now: DateTime<Utc>) -> FuelStatus {
        self.fan_duty_samples.push_back(Sample {
            time: now,
            value: Self::fan_duty(reading),
        });

        let pit = reading.pit_fahrenheit();
        if let (Some((previous, at)), Some(current)) = (self.last_pit, pit) {
            let minutes = (now - at).num_milliseconds() as f64 / 60_000.0;
            if minutes > 0.0 {
                self.temp_drop_samples.push_back(Sample {
                    time: now,
                    value: (current as f64 - previous as f64) / minutes,
                });
            }
        }
        self.last_pit = pit.map(|p| (p, now));

        let cutoff = now - Duration::milliseconds(self.config.window.as_millis() as i64);
        prune(&mut self.fan_duty_samples, cutoff);
        prune(&mut self.temp_drop_samples, cutoff);

        let mean_duty_percent = mean(&self.fan_duty_samples);
        let mean_drop_rate = mean(&self.temp_drop_samples);
        let warming_up = self.fan_duty_samples.len() < self.config.min_duty_samples
            || self.temp_drop_samples.len() < self.config.min_drop_samples;

        let level = if warming_up {
            FuelLevel::Full
        } else {
            FuelLevel::classify(mean_duty_percent, mean_drop_rate)
        };

        let mut low_fuel_alert = false;
        if level <= FuelLevel::Critical {
            if !self.low_fuel_alerted {
                self.low_fuel_alerted = true;
                low_fuel_alert = true;
                warn!(
                    "Fuel critical: mean duty {:.0}%, pit {:.2}°F/min",
                    mean_duty_percent, mean_drop_rate
                );
            }
        } else if self.low_fuel_alerted {
            debug!("Fuel recovered to {}", level);
            self.low_fuel_alerted = false;
        }

        FuelStatus {
            level,
            mean_duty_percent,
            mean_drop_rate,
            duty_samples: self.fan_duty_samples.len(),
            drop_samples: self.temp_drop_samples.len(),
            warming_up,
            low_fuel_alert,
        }
    }

    /// Forget all history, e.g. after refuelling.
    pub fn reset(&mut self) {
        self.fan_duty_samples.clear();
        self.temp_drop_samples.clear();
        self.last_pit = None;
        self.low_fuel_alerted = false;
    }
}

fn prune(samples: &mut VecDeque<Sample>, cutoff: DateTime<Utc>) {
    while samples.front().map_or(false, |s| s.time < cutoff) {
        samples.pop_front();
    }
}

fn mean(samples: &VecDeque<Sample>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(pit: u16, fan_speed: u8, pit_set: u16) -> TelemetryReading {
        let mut frame = [0u8; 20];
        frame[3..5].copy_from_slice(&pit.to_be_bytes());
        frame[5..7].copy_from_slice(&999u16.to_be_bytes());
        frame[7..9].copy_from_slice(&999u16.to_be_bytes());
        frame[9] = fan_speed & 0x07;
        frame[10] = (pit_set - 145) as u8;
        TelemetryReading::decode(&frame).unwrap()
    }

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn test_fan_duty() {
        assert!((FuelEstimator::fan_duty(&reading(225, 7, 225)) - 100.0).abs() < 1e-9);
        assert!((FuelEstimator::fan_duty(&reading(225, 5, 225)) - 71.428).abs() < 0.01);
        // Auto at target: baseline 30%.
        assert!((FuelEstimator::fan_duty(&reading(225, 0, 225)) - 30.0).abs() < 1e-9);
        // Auto, 25°F below target.
        assert!((FuelEstimator::fan_duty(&reading(200, 0, 225)) - 80.0).abs() < 1e-9);
        // Auto, far below and far above.
        assert_eq!(FuelEstimator::fan_duty(&reading(150, 0, 400)), 100.0);
        assert_eq!(FuelEstimator::fan_duty(&reading(400, 0, 150)), 0.0);
        // Auto with the pit probe unplugged.
        assert_eq!(FuelEstimator::fan_duty(&reading(999, 0, 225)), 0.0);
    }

    #[test]
    fn test_classify() {
        assert_eq!(FuelLevel::classify(70.0, -0.6), FuelLevel::Critical);
        assert_eq!(FuelLevel::classify(70.0, -0.3), FuelLevel::Low);
        assert_eq!(FuelLevel::classify(55.0, -0.6), FuelLevel::Low);
        assert_eq!(FuelLevel::classify(45.0, -1.0), FuelLevel::Medium);
        assert_eq!(FuelLevel::classify(40.0, -1.0), FuelLevel::Full);
        assert_eq!(FuelLevel::Critical.percent(), 20);
        assert_eq!(FuelLevel::Full.percent(), 100);
    }

    #[test]
    fn test_warm_up_reports_full() {
        let mut estimator = FuelEstimator::default();
        for minute in 0..10 {
            let status = estimator.update(&reading(300 - minute as u16 * 5, 7, 300), at(minute));
            assert!(status.warming_up);
            assert_eq!(status.level, FuelLevel::Full);
            assert!(!status.low_fuel_alert);
        }
    }

    #[test]
    fn test_declining_pit_at_high_duty_alerts_once() {
        let mut estimator = FuelEstimator::default();
        let mut alerts = 0;
        let mut first_critical = None;

        for minute in 0..=35 {
            let status = estimator.update(&reading(300 - minute as u16, 5, 300), at(minute));
            if status.low_fuel_alert {
                alerts += 1;
            }
            if status.level == FuelLevel::Critical && first_critical.is_none() {
                first_critical = Some(minute);
            }
            if minute >= 10 {
                assert_eq!(status.level, FuelLevel::Critical, "minute {}", minute);
                assert!((status.mean_drop_rate + 1.0).abs() < 1e-9);
            }
        }

        assert_eq!(first_critical, Some(10));
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut estimator = FuelEstimator::default();
        let mut status = FuelStatus::default();
        for minute in 0..=90 {
            status = estimator.update(&reading(250, 3, 250), at(minute));
        }
        assert_eq!(status.duty_samples, 31);
        assert_eq!(status.drop_samples, 31);
        assert_eq!(status.mean_drop_rate, 0.0);
    }

    #[test]
    fn test_alert_rearms_after_recovery() {
        let mut estimator = FuelEstimator::default();
        let mut alerts = 0;
        let mut pit = 300u16;

        for minute in 0..=120 {
            let sample = match minute {
                0..=15 => {
                    pit -= 1;
                    reading(pit, 5, 300)
                }
                16..=60 => reading(250, 0, 250),
                _ => {
                    pit -= 1;
                    reading(pit, 5, 300)
                }
            };
            if minute == 16 {
                pit = 250;
            }
            if estimator.update(&sample, at(minute)).low_fuel_alert {
                alerts += 1;
            }
        }

        assert_eq!(alerts, 2);
    }

    #[test]
    fn test_disconnected_pit_never_aggregated() {
        let mut estimator = FuelEstimator::default();

        estimator.update(&reading(250, 3, 250), at(0));
        let status = estimator.update(&reading(999, 3, 250), at(1));
        assert_eq!(status.drop_samples, 0);

        // The first valid reading after a gap has nothing to compare against.
        let status = estimator.update(&reading(240, 3, 250), at(2));
        assert_eq!(status.drop_samples, 0);
        assert!(status.mean_drop_rate.is_finite());

        let status = estimator.update(&reading(238, 3, 250), at(3));
        assert_eq!(status.drop_samples, 1);
        assert!((status.mean_drop_rate + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_same_timestamp_skips_slope() {
        let mut estimator = FuelEstimator::default();
        estimator.update(&reading(250, 3, 250), at(0));
        let status = estimator.update(&reading(200, 3, 250), at(0));
        assert_eq!(status.drop_samples, 0);
        assert!(status.mean_drop_rate.is_finite());
    }

    #[test]
    fn test_reset() {
        let mut estimator = FuelEstimator::default();
        for minute in 0..=20 {
            estimator.update(&reading(300 - minute as u16, 5, 300), at(minute));
        }
        estimator.reset();
        let status = estimator.update(&reading(280, 5, 300), at(21));
        assert_eq!(status.duty_samples, 1);
        assert_eq!(status.drop_samples, 0);
        assert_eq!(status.level, FuelLevel::Full);
    }
}

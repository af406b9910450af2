//! Session configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::CONTROLLER_SERVICE_UUID;
use crate::data::{FuelConfig, TelemetryHistory};

/// Which advertising devices count as a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFilter {
    /// Advertised local name prefix.
    pub name_prefix: Option<String>,
    /// Advertised primary service.
    pub service: Option<Uuid>,
}

impl DeviceFilter {
    /// Default advertised name prefix.
    pub const DEFAULT_NAME_PREFIX: &'static str = "BBQ";

    /// Match on name prefix only.
    pub fn by_name_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
            service: None,
        }
    }

    /// Match on advertised service only.
    pub fn by_service(service: Uuid) -> Self {
        Self {
            name_prefix: None,
            service: Some(service),
        }
    }

    /// Check an advertisement against the filter.
    ///
    /// A device matches if either criterion matches. An empty filter matches
    /// everything.
    pub fn matches(&self, local_name: Option<&str>, services: &[Uuid]) -> bool {
        if self.name_prefix.is_none() && self.service.is_none() {
            return true;
        }

        let name_match = match (&self.name_prefix, local_name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        };
        let service_match = self
            .service
            .map(|uuid| services.contains(&uuid))
            .unwrap_or(false);

        name_match || service_match
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_prefix: Some(Self::DEFAULT_NAME_PREFIX.to_string()),
            service: Some(CONTROLLER_SERVICE_UUID),
        }
    }
}

impl std::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name_prefix, &self.service) {
            (Some(prefix), Some(service)) => write!(f, "name '{}*' or service {}", prefix, service),
            (Some(prefix), None) => write!(f, "name '{}*'", prefix),
            (None, Some(service)) => write!(f, "service {}", service),
            (None, None) => write!(f, "any device"),
        }
    }
}

/// Connection session settings.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Which device to connect to.
    pub filter: DeviceFilter,
    /// How long to scan for a matching device.
    pub scan_timeout: Duration,
    /// Channel open attempts per `connect()`.
    pub connect_attempts: u32,
    /// Pause between open attempts.
    pub retry_backoff: Duration,
    /// Pause before the single reconnect after a link drop.
    pub reconnect_delay: Duration,
    /// Heartbeat silence after which the link is reported stale.
    pub stale_timeout: Duration,
    /// Readings kept in the history.
    pub history_capacity: usize,
    /// Broadcast channel capacity for events and telemetry.
    pub channel_capacity: usize,
    /// Fuel estimator tuning.
    pub fuel: FuelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::default(),
            scan_timeout: Duration::from_secs(30),
            connect_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(2),
            stale_timeout: Duration::from_secs(15),
            history_capacity: TelemetryHistory::DEFAULT_CAPACITY,
            channel_capacity: 64,
            fuel: FuelConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Set the device filter.
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the open attempts and the pause between them.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Set the pause before auto-reconnect.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the heartbeat stale timeout.
    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Set the history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the fuel estimator tuning.
    pub fn with_fuel(mut self, fuel: FuelConfig) -> Self {
        self.fuel = fuel;
        self
    }
}

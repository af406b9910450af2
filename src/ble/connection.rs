//! Connection state and lifecycle events.

use crate::ble::transport::DeviceIdentity;
use crate::error::Remediation;

/// Connection state for a controller session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// `connect()` is selecting and opening a device.
    Connecting,
    /// Connected and receiving telemetry.
    Connected,
    /// The link dropped and the single automatic reconnect is running.
    Reconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connect or reconnect is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Lifecycle events published by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A device was picked by the scan.
    DeviceSelected(DeviceIdentity),
    /// A channel open attempt is starting.
    ConnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
        /// Attempts allowed.
        max_attempts: u32,
    },
    /// The authorization probe failed; the first write may still prompt pairing.
    AuthorizationPending {
        /// Why the probe failed.
        reason: String,
    },
    /// The control characteristic is missing; commands will fail.
    ControlUnavailable,
    /// `connect()` gave up.
    ConnectFailed {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        reason: String,
        /// What to ask the user to do.
        remediation: Remediation,
    },
    /// The link dropped unexpectedly; a reconnect is scheduled.
    LinkDropped,
    /// The automatic reconnect failed. The device has been forgotten.
    ReconnectFailed {
        /// Why it failed.
        reason: String,
        /// What to ask the user to do.
        remediation: Remediation,
    },
}

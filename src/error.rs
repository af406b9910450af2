//! Error types for the pitlink-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No controller matching the device filter was found.
    #[error("No controller found matching {filter}")]
    DeviceNotFound {
        /// Description of the filter that was used.
        filter: String,
    },

    /// A telemetry frame had the wrong size.
    #[error("Malformed telemetry frame: expected {expected} bytes, got {actual}")]
    MalformedFrame {
        /// The required frame length.
        expected: usize,
        /// The length that was received.
        actual: usize,
    },

    /// A command was attempted without a live write endpoint.
    #[error("Controller not connected")]
    NotConnected,

    /// A connect or reconnect is already running.
    #[error("Connection already in progress")]
    ConnectionInProgress,

    /// The channel could not be opened after all attempts.
    #[error("Failed to open channel after {attempts} attempts: {reason}")]
    ChannelOpenFailure {
        /// Number of attempts made.
        attempts: u32,
        /// The last error seen.
        reason: String,
    },

    /// `disconnect()` was called while a connect was still running.
    #[error("Connect aborted by disconnect")]
    ConnectAborted,

    /// The controller rejected an operation for pairing or security reasons.
    #[error("Authorization required: {hint}")]
    AuthorizationRequired {
        /// What the user should do about it.
        hint: String,
    },

    /// The link dropped without being asked to, before it could be used.
    #[error("Connection lost")]
    LinkDropped,

    /// The single automatic reconnect after a link drop failed.
    #[error("Reconnect failed: {reason}")]
    ReconnectFailed {
        /// Why the reconnect failed.
        reason: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What a caller should ask the user to do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Remediation {
    /// Nothing to do; the error is informational.
    None,
    /// Try the same operation again.
    Retry,
    /// Connect to the controller again.
    Reconnect,
    /// Remove the pairing and pair the controller again.
    RePair,
    /// Pick a controller from the device list again.
    SelectDevice,
}

impl Error {
    /// Hint attached to authorization failures on the control endpoint.
    pub const RE_PAIR_HINT: &'static str =
        "the controller refused the write; remove the pairing and pair again";

    /// Build an authorization error with the standard re-pair hint.
    pub fn authorization_required() -> Self {
        Self::AuthorizationRequired {
            hint: Self::RE_PAIR_HINT.to_string(),
        }
    }

    /// Whether this error came from pairing/security rather than the link.
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::AuthorizationRequired { .. })
    }

    /// The action a caller should offer the user.
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MalformedFrame { .. } | Self::ConnectAborted => Remediation::None,
            Self::ConnectionInProgress | Self::Bluetooth(_) | Self::Internal(_) => {
                Remediation::Retry
            }
            Self::NotConnected
            | Self::ChannelOpenFailure { .. }
            | Self::LinkDropped
            | Self::CharacteristicNotFound { .. } => Remediation::Reconnect,
            Self::AuthorizationRequired { .. } => Remediation::RePair,
            Self::BluetoothUnavailable
            | Self::DeviceNotFound { .. }
            | Self::ReconnectFailed { .. } => Remediation::SelectDevice,
        }
    }

    /// Reclassify a BLE error, separating security rejections from link failures.
    pub(crate) fn from_ble(err: btleplug::Error) -> Self {
        match &err {
            btleplug::Error::PermissionDenied => Self::authorization_required(),
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::NotSupported(msg) | btleplug::Error::RuntimeError(msg)
                if mentions_security(msg) =>
            {
                Self::authorization_required()
            }
            btleplug::Error::Other(inner) if mentions_security(&inner.to_string()) => {
                Self::authorization_required()
            }
            _ => Self::Bluetooth(err),
        }
    }
}

fn mentions_security(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    ["auth", "encrypt", "pair", "security", "insufficient"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

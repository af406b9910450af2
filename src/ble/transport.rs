//! Channel boundary.
//!
//! The session never talks to a radio directly. It drives a [`Transport`]
//! that finds and opens devices, and the [`Link`] that an open returns.
//! Inbound traffic (notifications and unsolicited disconnects) is pushed by
//! the link into the [`LinkEventSender`] it was opened with, so frames and
//! the disconnect that ends them arrive on one ordered queue.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::DeviceFilter;
use crate::error::Result;

/// A device picked by [`Transport::select_device`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// Platform peripheral identifier.
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Inbound traffic from an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A notification from the telemetry characteristic.
    Frame(Bytes),
    /// The link went down without `disconnect()` being called on it.
    Disconnected,
}

/// Sender half handed to a link when it is opened.
///
/// Events are tagged with the link they came from so the session can ignore
/// traffic from a link it has already replaced.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    link_id: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEventSender {
    pub(crate) fn new(link_id: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { link_id, tx }
    }

    /// Identifier of the link this sender belongs to.
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Deliver a telemetry notification. Returns `false` once the session is gone.
    pub fn frame(&self, data: impl Into<Bytes>) -> bool {
        self.send(LinkEvent::Frame(data.into()))
    }

    /// Report an unsolicited disconnect. Returns `false` once the session is gone.
    pub fn disconnected(&self) -> bool {
        self.send(LinkEvent::Disconnected)
    }

    fn send(&self, event: LinkEvent) -> bool {
        self.tx.send((self.link_id, event)).is_ok()
    }
}

/// Endpoints found on a freshly opened link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Endpoints {
    /// Telemetry notify characteristic found.
    pub telemetry: bool,
    /// Control read/write characteristic found.
    pub control: bool,
}

/// An open channel to one controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// Discover the telemetry and control characteristics.
    async fn resolve_endpoints(&self) -> Result<Endpoints>;

    /// Enable telemetry notifications.
    async fn subscribe(&self) -> Result<()>;

    /// Read the control characteristic. Used to trigger pairing early.
    async fn read_control(&self) -> Result<Vec<u8>>;

    /// Acknowledged write to the control characteristic.
    async fn write_control(&self, data: &[u8]) -> Result<()>;

    /// Close the link. No `Disconnected` event should follow.
    async fn disconnect(&self) -> Result<()>;
}

/// Finds and opens controllers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for a device matching `filter`.
    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity>;

    /// Open a link. Inbound traffic must be pushed into `events`.
    async fn open(&self, device: &DeviceIdentity, events: LinkEventSender)
        -> Result<Arc<dyn Link>>;
}

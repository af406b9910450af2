//! GATT characteristic handling.
//!
//! [`BtleLink`] is the btleplug-backed [`Link`]: it resolves the telemetry
//! and control characteristics on a connected peripheral, forwards telemetry
//! notifications, and performs acknowledged control writes.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{Endpoints, Link, LinkEventSender};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// An open link to a controller over btleplug.
pub struct BtleLink {
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Telemetry notify characteristic, once resolved.
    telemetry: RwLock<Option<Characteristic>>,
    /// Control read/write characteristic, once resolved.
    control: RwLock<Option<Characteristic>>,
    /// Where inbound traffic goes.
    events: LinkEventSender,
    /// Set by `disconnect()` so the watcher does not report our own close.
    closing: Arc<AtomicBool>,
    /// Background tasks owned by this link.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleLink {
    /// Wrap a peripheral that is already connected and has discovered services.
    pub(crate) fn new(
        peripheral: Peripheral,
        events: LinkEventSender,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            peripheral,
            telemetry: RwLock::new(None),
            control: RwLock::new(None),
            events,
            closing,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Keep a background task alive for as long as the link.
    pub(crate) fn adopt_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    fn find(&self, uuid: &Uuid) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *uuid)
    }

    fn control(&self) -> Result<Characteristic> {
        self.control
            .read()
            .clone()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: CONTROL_CHARACTERISTIC_UUID.to_string(),
            })
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn resolve_endpoints(&self) -> Result<Endpoints> {
        let telemetry = self.find(&TELEMETRY_CHARACTERISTIC_UUID);
        let control = self.find(&CONTROL_CHARACTERISTIC_UUID);

        debug!(
            "Resolved endpoints: telemetry={:?}, control={:?}",
            telemetry.as_ref().map(|c| c.properties),
            control.as_ref().map(|c| c.properties)
        );

        let endpoints = Endpoints {
            telemetry: telemetry.is_some(),
            control: control.is_some(),
        };

        if telemetry.is_none() {
            return Err(Error::CharacteristicNotFound {
                uuid: TELEMETRY_CHARACTERISTIC_UUID.to_string(),
            });
        }

        *self.telemetry.write() = telemetry;
        *self.control.write() = control;

        Ok(endpoints)
    }

    async fn subscribe(&self) -> Result<()> {
        let characteristic =
            self.telemetry
                .read()
                .clone()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: TELEMETRY_CHARACTERISTIC_UUID.to_string(),
                })?;

        // Take the stream before subscribing so the first frame is not lost.
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::from_ble)?;

        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(Error::from_ble)?;

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            debug!("Telemetry forwarder started for link {}", events.link_id());
            while let Some(notification) = notifications.next().await {
                if notification.uuid != TELEMETRY_CHARACTERISTIC_UUID {
                    continue;
                }
                trace!(
                    "Notification: {} bytes, data: {:02X?}",
                    notification.value.len(),
                    notification.value
                );
                if !events.frame(notification.value) {
                    break;
                }
            }
            debug!("Telemetry forwarder stopped for link {}", events.link_id());
        });
        self.adopt_task(handle);

        debug!("Subscribed to telemetry notifications");

        Ok(())
    }

    async fn read_control(&self) -> Result<Vec<u8>> {
        let characteristic = self.control()?;
        let data = self
            .peripheral
            .read(&characteristic)
            .await
            .map_err(Error::from_ble)?;

        trace!("Read {} bytes from control characteristic", data.len());

        Ok(data)
    }

    async fn write_control(&self, data: &[u8]) -> Result<()> {
        let characteristic = self.control()?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(Error::from_ble)?;

        trace!("Wrote {:02X?} to control characteristic", data);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Failed to disconnect peripheral: {}", e);
            return Err(Error::from_ble(e));
        }

        Ok(())
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

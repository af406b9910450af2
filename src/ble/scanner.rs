//! BLE scanning and link setup.
//!
//! [`BtleTransport`] is the btleplug-backed [`Transport`]: it scans for a
//! controller matching a [`DeviceFilter`], connects to it, and watches the
//! adapter for the peripheral dropping off.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ble::characteristics::BtleLink;
use crate::ble::transport::{DeviceIdentity, Link, LinkEventSender, Transport};
use crate::config::DeviceFilter;
use crate::error::{Error, Result};

/// How often the peripheral list is checked while scanning.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// btleplug transport for controllers.
pub struct BtleTransport {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// How long `select_device` scans before giving up.
    scan_timeout: Duration,
    /// Peripherals picked by `select_device`, by identifier.
    selected: RwLock<HashMap<String, Peripheral>>,
}

impl BtleTransport {
    /// Create a transport on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, scan_timeout))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter, scan_timeout: Duration) -> Self {
        Self {
            adapter,
            scan_timeout,
            selected: RwLock::new(HashMap::new()),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_match(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Option<(DeviceIdentity, Peripheral)>> {
        for peripheral in self.adapter.peripherals().await.map_err(Error::Bluetooth)? {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                _ => continue,
            };

            trace!(
                "Seen {:?} ({:?}), services {:?}",
                peripheral.id(),
                properties.local_name,
                properties.services
            );

            if filter.matches(properties.local_name.as_deref(), &properties.services) {
                let identity = DeviceIdentity {
                    id: peripheral.id().to_string(),
                    name: properties.local_name.clone(),
                };
                return Ok(Some((identity, peripheral)));
            }
        }

        Ok(None)
    }

    /// Watch adapter events and report the peripheral disconnecting.
    async fn watch_disconnect(
        adapter: Adapter,
        id: PeripheralId,
        events: LinkEventSender,
        closing: Arc<AtomicBool>,
    ) {
        let mut central_events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to get adapter events, link drops will go unnoticed: {}", e);
                return;
            }
        };

        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone != id {
                    continue;
                }
                if closing.load(Ordering::SeqCst) {
                    debug!("Peripheral {:?} closed", id);
                } else {
                    info!("Peripheral {:?} dropped", id);
                    events.disconnected();
                }
                break;
            }
        }
    }
}

/// Adapter-level scan filter for `filter`.
///
/// The adapter can only pre-filter on services. A name prefix is checked
/// per advertisement, so any filter with a name scans unfiltered.
fn scan_filter(filter: &DeviceFilter) -> ScanFilter {
    if filter.name_prefix.is_some() {
        return ScanFilter::default();
    }
    ScanFilter {
        services: filter.service.into_iter().collect(),
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn select_device(&self, filter: &DeviceFilter) -> Result<DeviceIdentity> {
        info!("Scanning for controller matching {}", filter);

        self.adapter
            .start_scan(scan_filter(filter))
            .await
            .map_err(Error::Bluetooth)?;

        let deadline = Instant::now() + self.scan_timeout;
        let found = loop {
            if let Some(found) = self.find_match(filter).await? {
                break Some(found);
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        let (identity, peripheral) = found.ok_or_else(|| Error::DeviceNotFound {
            filter: filter.to_string(),
        })?;

        info!("Selected controller {}", identity);
        self.selected.write().insert(identity.id.clone(), peripheral);

        Ok(identity)
    }

    async fn open(
        &self,
        device: &DeviceIdentity,
        events: LinkEventSender,
    ) -> Result<Arc<dyn Link>> {
        let peripheral = self
            .selected
            .read()
            .get(&device.id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                filter: device.to_string(),
            })?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(Error::from_ble)?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(Error::from_ble)?;

        debug!(
            "Connected to {}, {} services",
            device,
            peripheral.services().len()
        );

        let closing = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(Self::watch_disconnect(
            self.adapter.clone(),
            peripheral.id(),
            events.clone(),
            closing.clone(),
        ));

        let link = BtleLink::new(peripheral, events, closing);
        link.adopt_task(watcher);

        Ok(Arc::new(link))
    }
}

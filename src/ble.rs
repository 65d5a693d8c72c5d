//! [`Transport`] implementation on `btleplug`.
//!
//! Works on macOS (CoreBluetooth), Linux (BlueZ) and Windows (WinRT).  The
//! transport addresses peripherals by their platform id string, so a
//! [`DeviceDescriptor::address`] is a UUID on macOS / Windows and a MAC
//! address on Linux.
//!
//! `btleplug` exposes neither explicit bonding nor an MTU request, so the
//! capability set reports both as unavailable and the orchestrator skips
//! them; the corresponding trait methods return
//! [`TransportError::Unsupported`].

use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{
    device_info_characteristic, DATA_CHARACTERISTIC, DEVICE_INFO_SERVICE_UUID,
    MAILBOX_CHARACTERISTIC,
};
use crate::transport::{CapabilitySet, NotificationChannel, ScanFilter, Transport, TransportResult};
use crate::types::{DeviceDescriptor, DeviceInfoKind};

/// BLE transport bound to one adapter.
#[derive(Clone)]
pub struct BleTransport {
    adapter: Adapter,
}

/// A connected headset.
#[derive(Clone, Debug)]
pub struct BleLink {
    peripheral: Peripheral,
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// On macOS, `CBCentralManager` starts in an "unknown" state and a scan
    /// issued before it reports *poweredOn* is silently ignored, so this
    /// waits up to 3 s for that state.
    pub async fn new() -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;

        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        Ok(Self::from_adapter(adapter))
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    async fn find_peripheral(&self, address: &str) -> TransportResult<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| TransportError::NotFound(address.to_owned()))
    }
}

/// Descriptor for `peripheral` if it advertises a supported headset name.
async fn describe(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
    let props = peripheral.properties().await.ok()??;
    let name = props.local_name?;
    let mut device = DeviceDescriptor::from_advertisement(peripheral.id().to_string(), name)?;
    device.rssi = props.rssi;
    Some(device)
}

fn characteristic(link: &BleLink, uuid: Uuid) -> TransportResult<Characteristic> {
    link.peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| TransportError::MissingAttribute(format!("characteristic {uuid}")))
}

const fn channel_uuid(channel: NotificationChannel) -> Uuid {
    match channel {
        NotificationChannel::Mailbox => MAILBOX_CHARACTERISTIC,
        NotificationChannel::Data => DATA_CHARACTERISTIC,
    }
}

impl Transport for BleTransport {
    type Link = BleLink;

    async fn scan(&self, filter: &ScanFilter) -> TransportResult<BoxStream<'static, DeviceDescriptor>> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(BleScanFilter {
                services: filter.services.clone(),
            })
            .await?;
        info!("BLE scan started");

        let adapter = self.adapter.clone();
        let found = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                describe(&peripheral).await
            }
        });
        Ok(found.boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connected_device(&self) -> TransportResult<Option<(DeviceDescriptor, BleLink)>> {
        for peripheral in self.adapter.peripherals().await? {
            match peripheral.is_connected().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("is_connected({}): {e}", peripheral.id());
                    continue;
                }
            }
            if let Some(device) = describe(&peripheral).await {
                debug!("{} is already connected", device.name);
                return Ok(Some((device, BleLink { peripheral })));
            }
        }
        Ok(None)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> TransportResult<BleLink> {
        let peripheral = self.find_peripheral(&device.address).await?;
        peripheral.connect().await?;

        // BlueZ reports the connection before the remote GATT cache is
        // populated; discovering services right away can come back empty.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        Ok(BleLink { peripheral })
    }

    async fn disconnect(&self, link: &BleLink) -> TransportResult<()> {
        link.peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_capabilities(&self, link: &BleLink) -> TransportResult<CapabilitySet> {
        link.peripheral.discover_services().await?;
        let chars = link.peripheral.characteristics();
        let has = |uuid: Uuid| chars.iter().any(|c| c.uuid == uuid);
        let found = CapabilitySet {
            mailbox: has(MAILBOX_CHARACTERISTIC),
            data: has(DATA_CHARACTERISTIC),
            device_info: link
                .peripheral
                .services()
                .iter()
                .any(|s| s.uuid == DEVICE_INFO_SERVICE_UUID),
            pairing: false,
            audio: true,
            mtu_negotiation: false,
        };
        debug!("discovered {} characteristic(s): {found:?}", chars.len());
        Ok(found)
    }

    async fn read_info(&self, link: &BleLink, kind: DeviceInfoKind) -> TransportResult<Vec<u8>> {
        let uuid = device_info_characteristic(kind)
            .ok_or(TransportError::Unsupported("device info attribute"))?;
        let c = characteristic(link, uuid)?;
        Ok(link.peripheral.read(&c).await?)
    }

    async fn write_command(&self, link: &BleLink, bytes: &[u8]) -> TransportResult<()> {
        let c = characteristic(link, MAILBOX_CHARACTERISTIC)?;
        link.peripheral
            .write(&c, bytes, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        link: &BleLink,
        channel: NotificationChannel,
    ) -> TransportResult<BoxStream<'static, Vec<u8>>> {
        let uuid = channel_uuid(channel);
        let c = characteristic(link, uuid)?;
        link.peripheral.subscribe(&c).await?;
        let notifications = link.peripheral.notifications().await?;
        info!("{channel:?} notifications subscribed");
        let values = notifications.filter_map(move |n| async move { (n.uuid == uuid).then_some(n.value) });
        Ok(values.boxed())
    }

    async fn unsubscribe(&self, link: &BleLink, channel: NotificationChannel) -> TransportResult<()> {
        let c = characteristic(link, channel_uuid(channel))?;
        link.peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    async fn negotiate_transport_parameter(&self, _link: &BleLink, _requested: u16) -> TransportResult<u16> {
        Err(TransportError::Unsupported("MTU request"))
    }

    async fn is_bonded(&self, _link: &BleLink) -> TransportResult<bool> {
        Ok(false)
    }

    async fn request_pairing(&self, _link: &BleLink) -> TransportResult<()> {
        Err(TransportError::Unsupported("pairing"))
    }
}

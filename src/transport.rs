//! The link-layer seam.
//!
//! Everything the orchestrator needs from the radio is expressed by
//! [`Transport`].  [`crate::ble::BleTransport`] implements it on `btleplug`;
//! tests drive the orchestrator through an in-memory implementation.

use std::future::Future;

use futures::stream::BoxStream;
use serde::Serialize;
use uuid::Uuid;

use crate::error::TransportError;
use crate::types::{DeviceDescriptor, DeviceInfoKind};

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

// ── Scan filter ───────────────────────────────────────────────────────────────

/// Which advertisements the orchestrator will accept.
///
/// All set fields must match.  The default accepts any device of a supported
/// family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Case-insensitive advertised-name prefix (e.g. `"alpha_"`).
    pub name_prefix: Option<String>,
    /// Exact transport address of one specific headset.
    pub address: Option<String>,
    /// Service UUIDs passed to the radio's own scan filter.
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// `true` when `device` passes the name and address criteria.
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        let name_ok = self.name_prefix.as_deref().map_or(true, |prefix| {
            device
                .name
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase())
        });
        let address_ok = self
            .address
            .as_deref()
            .map_or(true, |addr| addr.eq_ignore_ascii_case(&device.address));
        name_ok && address_ok
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// What the transport found on a freshly connected link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet {
    /// Mailbox characteristic present.
    pub mailbox: bool,
    /// Sensor-data characteristic present.
    pub data: bool,
    /// Device Information Service present.
    pub device_info: bool,
    /// The transport can bond this link.
    pub pairing: bool,
    /// The headset exposes an audio sub-link.
    pub audio: bool,
    /// The transport can request an MTU.
    pub mtu_negotiation: bool,
}

impl CapabilitySet {
    /// Both mandatory characteristics are present.
    pub fn is_usable(&self) -> bool {
        self.mailbox && self.data
    }
}

/// Notification sources on the headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    Mailbox,
    Data,
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Asynchronous link operations.
///
/// Every returned future is `Send` so the orchestrator can run on a spawned
/// task.  Implementations should not apply their own long timeouts: the
/// orchestrator bounds every call with a per-step timeout and drops the
/// future on expiry or interrupt.
pub trait Transport: Send + Sync + 'static {
    /// Handle to one connected link.
    type Link: Clone + Send + Sync + 'static;

    /// Start scanning; the stream yields every matching advertisement until
    /// it is dropped or [`Transport::stop_scan`] is called.
    fn scan(
        &self,
        filter: &ScanFilter,
    ) -> impl Future<Output = TransportResult<BoxStream<'static, DeviceDescriptor>>> + Send;

    fn stop_scan(&self) -> impl Future<Output = TransportResult<()>> + Send;

    /// A headset already linked to this host, if any.
    fn connected_device(
        &self,
    ) -> impl Future<Output = TransportResult<Option<(DeviceDescriptor, Self::Link)>>> + Send;

    fn connect(
        &self,
        device: &DeviceDescriptor,
    ) -> impl Future<Output = TransportResult<Self::Link>> + Send;

    fn disconnect(&self, link: &Self::Link) -> impl Future<Output = TransportResult<()>> + Send;

    fn discover_capabilities(
        &self,
        link: &Self::Link,
    ) -> impl Future<Output = TransportResult<CapabilitySet>> + Send;

    /// Raw bytes of one device-information attribute.
    fn read_info(
        &self,
        link: &Self::Link,
        kind: DeviceInfoKind,
    ) -> impl Future<Output = TransportResult<Vec<u8>>> + Send;

    /// Write one encoded mailbox command.
    fn write_command(
        &self,
        link: &Self::Link,
        bytes: &[u8],
    ) -> impl Future<Output = TransportResult<()>> + Send;

    /// Enable notifications on `channel`.  The stream ends when the link is
    /// lost.
    fn subscribe_notifications(
        &self,
        link: &Self::Link,
        channel: NotificationChannel,
    ) -> impl Future<Output = TransportResult<BoxStream<'static, Vec<u8>>>> + Send;

    fn unsubscribe(
        &self,
        link: &Self::Link,
        channel: NotificationChannel,
    ) -> impl Future<Output = TransportResult<()>> + Send;

    /// Request an MTU; returns the value the link settled on.
    fn negotiate_transport_parameter(
        &self,
        link: &Self::Link,
        requested: u16,
    ) -> impl Future<Output = TransportResult<u16>> + Send;

    fn is_bonded(&self, link: &Self::Link) -> impl Future<Output = TransportResult<bool>> + Send;

    fn request_pairing(
        &self,
        link: &Self::Link,
    ) -> impl Future<Output = TransportResult<()>> + Send;
}

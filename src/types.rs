use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::mailbox::{MailboxCommand, MailboxResponse};
use crate::protocol::DeviceFamily;
use crate::reassembly::{QualityChecker, StreamStats};

// ── Connection state ──────────────────────────────────────────────────────────

/// Device information read from the headset.
///
/// The first four are read in this order during `ReadingInfo` on every
/// connection; battery is only available on request through the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceInfoKind {
    FirmwareVersion,
    HardwareVersion,
    SerialNumber,
    /// Model number; on audio-capable headsets this is also the audio name.
    ModelNumber,
    BatteryLevel,
}

impl DeviceInfoKind {
    /// Kinds read during connection establishment, in order.
    pub const CONNECT_SEQUENCE: [DeviceInfoKind; 4] = [
        DeviceInfoKind::FirmwareVersion,
        DeviceInfoKind::HardwareVersion,
        DeviceInfoKind::SerialNumber,
        DeviceInfoKind::ModelNumber,
    ];

    fn connect_position(self) -> Option<usize> {
        Self::CONNECT_SEQUENCE.iter().position(|&k| k == self)
    }
}

/// Connection state machine.
///
/// The in-progress states form one strict pipeline:
///
/// ```text
/// Idle → ReadyForOperation → Scanning → DeviceFound → Connecting → Connected
///      → DiscoveringCapabilities → ReadingInfo(fw) → ReadingInfo(hw)
///      → ReadingInfo(serial) → ReadingInfo(model) → Bonding
///      → NegotiatingTransportParams → Ready
/// ```
///
/// Any in-progress state may fall into a failure state; see
/// [`ConnectionState::failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Idle,
    ReadyForOperation,
    Scanning,
    DeviceFound,
    Connecting,
    Connected,
    DiscoveringCapabilities,
    ReadingInfo(DeviceInfoKind),
    Bonding,
    NegotiatingTransportParams,
    Ready,

    ScanFailed,
    ConnectFailed,
    DiscoveryFailed,
    ReadFailed,
    BondFailed,
    NegotiationFailed,
    Interrupted,
    AnotherDeviceConnected,

    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Position in the connection pipeline, `None` outside it.
    pub fn pipeline_position(self) -> Option<usize> {
        use ConnectionState::*;
        let pos = match self {
            Idle => 0,
            ReadyForOperation => 1,
            Scanning => 2,
            DeviceFound => 3,
            Connecting => 4,
            Connected => 5,
            DiscoveringCapabilities => 6,
            ReadingInfo(kind) => 7 + kind.connect_position()?,
            Bonding => 11,
            NegotiatingTransportParams => 12,
            Ready => 13,
            _ => return None,
        };
        Some(pos)
    }

    /// The state that follows this one when its step succeeds.
    pub fn next(self) -> Option<ConnectionState> {
        use ConnectionState::*;
        let next = match self {
            Idle => ReadyForOperation,
            ReadyForOperation => Scanning,
            Scanning => DeviceFound,
            DeviceFound => Connecting,
            Connecting => Connected,
            Connected => DiscoveringCapabilities,
            DiscoveringCapabilities => ReadingInfo(DeviceInfoKind::CONNECT_SEQUENCE[0]),
            ReadingInfo(kind) => {
                let pos = kind.connect_position()?;
                match DeviceInfoKind::CONNECT_SEQUENCE.get(pos + 1) {
                    Some(&k) => ReadingInfo(k),
                    None => Bonding,
                }
            }
            Bonding => NegotiatingTransportParams,
            NegotiatingTransportParams => Ready,
            _ => return None,
        };
        Some(next)
    }

    /// Failure state a step lands in when it times out or fails.
    pub fn failure(self) -> Option<ConnectionState> {
        use ConnectionState::*;
        let failed = match self {
            Idle | ReadyForOperation | Scanning | DeviceFound => ScanFailed,
            Connecting | Connected => ConnectFailed,
            DiscoveringCapabilities => DiscoveryFailed,
            ReadingInfo(_) => ReadFailed,
            Bonding => BondFailed,
            NegotiatingTransportParams => NegotiationFailed,
            _ => return None,
        };
        Some(failed)
    }

    /// `true` while the connection pipeline can still advance.
    pub fn is_in_progress(self) -> bool {
        !matches!(self, ConnectionState::Ready) && self.pipeline_position().is_some()
    }

    /// `true` for terminal failure states.
    pub fn is_failure(self) -> bool {
        use ConnectionState::*;
        matches!(
            self,
            ScanFailed
                | ConnectFailed
                | DiscoveryFailed
                | ReadFailed
                | BondFailed
                | NegotiationFailed
                | Interrupted
                | AnotherDeviceConnected
        )
    }

    /// `true` when a new connection attempt may begin from this state.
    pub fn can_start_connection(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Disconnected) || self.is_failure()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ── Devices ───────────────────────────────────────────────────────────────────

/// Optional features of a headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    /// The device can be bonded at the link level.
    pub pairing: bool,
    /// The device exposes an audio sub-link set up through the mailbox.
    pub audio: bool,
    /// The link supports an explicit MTU request.
    pub mtu_negotiation: bool,
}

impl Capabilities {
    /// Features present in both `self` and `other`.
    pub fn intersect(self, other: Capabilities) -> Capabilities {
        Capabilities {
            pairing: self.pairing && other.pairing,
            audio: self.audio && other.audio,
            mtu_negotiation: self.mtu_negotiation && other.mtu_negotiation,
        }
    }
}

/// A headset discovered by a scan or already linked to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDescriptor {
    /// Platform transport identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
    /// Advertised device name (e.g. `"alpha_1010100123"`).
    pub name: String,
    pub family: DeviceFamily,
    pub capabilities: Capabilities,
    pub rssi: Option<i16>,
}

impl DeviceDescriptor {
    /// Build a descriptor from an advertised name, detecting the family.
    ///
    /// Returns `None` when the name does not belong to a supported family.
    pub fn from_advertisement(address: impl Into<String>, name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let family = DeviceFamily::from_name(&name)?;
        Some(Self {
            address: address.into(),
            name,
            family,
            capabilities: family.default_capabilities(),
            rssi: None,
        })
    }
}

/// One device-info value, delivered through [`DriverEvent::DeviceInfo`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceInfo {
    FirmwareVersion(String),
    HardwareVersion(String),
    SerialNumber(String),
    ModelNumber(String),
    /// Battery state of charge in percent.
    BatteryLevel(f32),
}

impl DeviceInfo {
    pub fn kind(&self) -> DeviceInfoKind {
        match self {
            DeviceInfo::FirmwareVersion(_) => DeviceInfoKind::FirmwareVersion,
            DeviceInfo::HardwareVersion(_) => DeviceInfoKind::HardwareVersion,
            DeviceInfo::SerialNumber(_) => DeviceInfoKind::SerialNumber,
            DeviceInfo::ModelNumber(_) => DeviceInfoKind::ModelNumber,
            DeviceInfo::BatteryLevel(_) => DeviceInfoKind::BatteryLevel,
        }
    }

    /// Interpret a DIS string attribute.  Trailing NULs are trimmed.
    pub fn from_text(kind: DeviceInfoKind, raw: &[u8]) -> Option<DeviceInfo> {
        let text = String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .trim()
            .to_owned();
        match kind {
            DeviceInfoKind::FirmwareVersion => Some(DeviceInfo::FirmwareVersion(text)),
            DeviceInfoKind::HardwareVersion => Some(DeviceInfo::HardwareVersion(text)),
            DeviceInfoKind::SerialNumber => Some(DeviceInfo::SerialNumber(text)),
            DeviceInfoKind::ModelNumber => Some(DeviceInfo::ModelNumber(text)),
            DeviceInfoKind::BatteryLevel => None,
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// Options for a streaming session.
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Ask the device to prepend a per-sample status bitmask (trigger input).
    pub trigger: bool,
    /// Per-channel quality function run on every packet.
    pub quality: Option<Arc<dyn QualityChecker>>,
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("trigger", &self.trigger)
            .field("quality", &self.quality.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Start or stop streaming.
#[derive(Debug, Clone)]
pub enum StreamState {
    Start(StreamOptions),
    Stop,
}

/// A unit of work for the request serializer.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    /// Run the connection pipeline to `Ready`.
    Connect,
    /// Tear the link down.  `interrupted: true` bypasses the queue and
    /// cancels whatever is in flight.
    Disconnect { interrupted: bool },
    /// Read one device-info value.
    ReadInfo(DeviceInfoKind),
    SetStreamState(StreamState),
    SendCommand(MailboxCommand),
}

impl PendingRequest {
    /// `true` for requests that need an established link.
    pub fn requires_link(&self) -> bool {
        matches!(
            self,
            PendingRequest::ReadInfo(_)
                | PendingRequest::SetStreamState(_)
                | PendingRequest::SendCommand(_)
        )
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, PendingRequest::Disconnect { interrupted: true })
    }
}

// ── Data ──────────────────────────────────────────────────────────────────────

/// A one-second slice of calibrated, channel-aligned EEG.
///
/// Gap-filled timesteps are `NaN` in every channel and in `status`; treat
/// `NaN` as missing, never as zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    /// Packet counter within the current streaming session, from 0.
    pub sequence: u64,
    /// Samples per channel (and length of `status`).
    pub sample_rate: usize,
    /// `channels[c][t]` in µV.
    pub channels: Vec<Vec<f64>>,
    /// Trigger/status value per timestep: `0.0` / `1.0`, or `NaN` when no
    /// trigger is configured or the timestep was gap-filled.
    pub status: Vec<f64>,
    /// One quality score per channel; all `NaN` when quality is disabled or
    /// the quality function failed.
    pub quality: Vec<f64>,
}

impl Packet {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Non-fatal anomaly on the data plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamError {
    /// Frames were lost in transit and gap-filled.
    MissingFrames { count: u64, at_index: u64 },
    /// A frame failed shape validation and was dropped.
    InvalidFrame { len: usize },
    /// The index jumped too far to gap-fill; the sequence was re-seeded.
    Resynchronized { from_index: u64, to_index: u64 },
    /// Queued frames were discarded because processing fell behind.
    Shed { frames: usize },
    /// The quality function failed; the packet was still emitted.
    QualityFailed(String),
    /// The data notification stream ended.
    NotificationsClosed,
}

/// Everything the driver reports to its consumer.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Emitted on every state transition.
    StateChanged(ConnectionState),
    /// The scan selected this device.
    DeviceSelected(DeviceDescriptor),
    DeviceInfo(DeviceInfo),
    Packet(Packet),
    StreamError(StreamError),
    /// Streaming was enabled (`true`) or disabled (`false`).
    Streaming(bool),
    /// Final statistics of a streaming session.
    StreamStats(StreamStats),
    /// A mailbox frame nobody was waiting for (lead-off events, reboot
    /// notices, answers to fire-and-forget commands).
    Mailbox(MailboxResponse),
    /// Response to a [`PendingRequest::SendCommand`].
    CommandResponse {
        command: MailboxCommand,
        response: MailboxResponse,
    },
}

//! GATT UUIDs, per-family frame geometry, and small wire-format helpers.
//!
//! Both headset families expose the same vendor service
//! `b2a0XXXX-8d6e-4f4b-a3b1-5c2c1f0e7a90` with one mailbox characteristic
//! (write + notify) and one sensor-data characteristic (notify).  Device
//! information is read from the standard Device Information Service.

use serde::Serialize;
use uuid::Uuid;

use crate::types::DeviceInfoKind;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary vendor service advertised by every supported headset.
///
/// Used as the scan filter; family detection then happens on the advertised
/// name (see [`DeviceFamily::from_name`]).
pub const HEADSET_SERVICE_UUID: Uuid = Uuid::from_u128(0xb2a00001_8d6e_4f4b_a3b1_5c2c1f0e7a90);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Mailbox characteristic.
///
/// The host writes `[opcode, payload…]` commands without response; the
/// device answers (and emits unsolicited events) as notifications on the
/// same characteristic.  See [`crate::mailbox`].
pub const MAILBOX_CHARACTERISTIC: Uuid = Uuid::from_u128(0xb2a00002_8d6e_4f4b_a3b1_5c2c1f0e7a90);

/// Sensor-data characteristic carrying raw EEG frames once notifications are
/// enabled.  Frame layout is described by [`FrameGeometry`].
pub const DATA_CHARACTERISTIC: Uuid = Uuid::from_u128(0xb2a00003_8d6e_4f4b_a3b1_5c2c1f0e7a90);

/// Standard Device Information Service (0x180A).
pub const DEVICE_INFO_SERVICE_UUID: Uuid = bluetooth_uuid(0x180a);

/// Standard DIS characteristic for each connect-time info kind.
///
/// | Kind | Characteristic |
/// |---|---|
/// | firmware version | 0x2A26 |
/// | hardware version | 0x2A27 |
/// | serial number    | 0x2A25 |
/// | model number     | 0x2A24 |
///
/// Battery level is not a DIS attribute on these headsets; it is queried
/// through the mailbox instead, so this returns `None` for it.
pub const fn device_info_characteristic(kind: DeviceInfoKind) -> Option<Uuid> {
    match kind {
        DeviceInfoKind::FirmwareVersion => Some(bluetooth_uuid(0x2a26)),
        DeviceInfoKind::HardwareVersion => Some(bluetooth_uuid(0x2a27)),
        DeviceInfoKind::SerialNumber => Some(bluetooth_uuid(0x2a25)),
        DeviceInfoKind::ModelNumber => Some(bluetooth_uuid(0x2a24)),
        DeviceInfoKind::BatteryLevel => None,
    }
}

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID.
const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

// ── Transport parameters ──────────────────────────────────────────────────────

/// ATT MTU every BLE link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// MTU requested during `NegotiatingTransportParams`.
///
/// 47 bytes leaves room for a 3-byte index, a status byte and several
/// timesteps of 2-byte samples for the 2-channel family.
pub const PREFERRED_MTU: u16 = 47;

/// Raw samples accumulated before one batch conversion to µV.
pub const CONSOLIDATION_THRESHOLD: usize = 40;

// ── Battery ───────────────────────────────────────────────────────────────────

/// Map the mailbox battery byte onto a percentage.
///
/// The headset reports battery in coarse steps: values below 4 mean empty,
/// each step above that is worth 12.5 %.
///
/// ```
/// # use eeg_link::protocol::battery_percent;
/// assert_eq!(battery_percent(3), 0.0);
/// assert_eq!(battery_percent(12), 100.0);
/// ```
pub fn battery_percent(raw: u8) -> f32 {
    if raw < 4 {
        0.0
    } else {
        (raw - 4) as f32 * 12.5
    }
}

// ── Device families ───────────────────────────────────────────────────────────

/// Headset variant.  Families differ in frame geometry and in which optional
/// features (audio sub-link, pairing, MTU negotiation) they support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceFamily {
    /// Two-channel headband with an audio sub-link.  2-byte frame index.
    Alpha,
    /// Eight-channel research cap.  3-byte frame index, no audio.
    Beta,
}

/// Advertised-name prefixes used for family detection.
pub const ALPHA_NAME_PREFIX: &str = "alpha_";
pub const BETA_NAME_PREFIX: &str = "beta_";

impl DeviceFamily {
    /// Detect the family from an advertised name (case-insensitive prefix).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with(ALPHA_NAME_PREFIX) {
            Some(DeviceFamily::Alpha)
        } else if lower.starts_with(BETA_NAME_PREFIX) {
            Some(DeviceFamily::Beta)
        } else {
            None
        }
    }

    /// Frame layout and calibration for this family.
    pub const fn geometry(self) -> FrameGeometry {
        match self {
            DeviceFamily::Alpha => ALPHA_GEOMETRY,
            DeviceFamily::Beta => BETA_GEOMETRY,
        }
    }

    /// Capabilities a device of this family is expected to advertise.  The
    /// orchestrator intersects these with what the transport discovers.
    pub const fn default_capabilities(self) -> crate::types::Capabilities {
        match self {
            DeviceFamily::Alpha => crate::types::Capabilities {
                pairing: true,
                audio: true,
                mtu_negotiation: true,
            },
            DeviceFamily::Beta => crate::types::Capabilities {
                pairing: false,
                audio: false,
                mtu_negotiation: true,
            },
        }
    }
}

/// Byte order of one raw sample on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEndianness {
    Big,
    Little,
}

/// Data-driven description of a family's raw frame layout.
///
/// ```text
/// [index: index_size bytes, BE] [status: status_size bytes, only with triggers]
/// [t0: ch0 ch1 … chN] [t1: ch0 ch1 … chN] …      (sample_alloc_size bytes each)
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGeometry {
    pub channel_count: usize,
    /// Bytes per raw sample value.
    pub sample_alloc_size: usize,
    /// Bytes of sequence index at the start of each frame.
    pub index_size: usize,
    /// Bytes of per-sample status bitmask following the index when triggers
    /// are enabled.
    pub status_size: usize,
    /// Samples per second per channel; also the packet length.
    pub sample_rate: usize,
    pub endianness: SampleEndianness,
    /// Calibration factor applied to the signed raw value.
    pub microvolts_per_lsb: f64,
}

/// ADS reference voltage in µV shared by both families' front ends.
const VREF_MICROVOLTS: f64 = 4_500_000.0;

pub const ALPHA_GEOMETRY: FrameGeometry = FrameGeometry {
    channel_count: 2,
    sample_alloc_size: 2,
    index_size: 2,
    status_size: 1,
    sample_rate: 250,
    endianness: SampleEndianness::Big,
    microvolts_per_lsb: VREF_MICROVOLTS / (24.0 * 32_768.0),
};

pub const BETA_GEOMETRY: FrameGeometry = FrameGeometry {
    channel_count: 8,
    sample_alloc_size: 2,
    index_size: 3,
    status_size: 1,
    sample_rate: 250,
    endianness: SampleEndianness::Little,
    microvolts_per_lsb: VREF_MICROVOLTS / (12.0 * 32_768.0),
};

impl FrameGeometry {
    /// Header length in bytes for the given trigger setting.
    pub const fn header_len(&self, trigger: bool) -> usize {
        if trigger {
            self.index_size + self.status_size
        } else {
            self.index_size
        }
    }

    /// Bytes occupied by one timestep across all channels.
    pub const fn timestep_len(&self) -> usize {
        self.sample_alloc_size * self.channel_count
    }

    /// Modulus of the sequence index counter.
    pub const fn index_modulus(&self) -> u64 {
        1u64 << (8 * self.index_size as u32)
    }

    /// Read the big-endian sequence index from the start of `frame`.
    ///
    /// Returns `None` if `frame` is shorter than the index.
    pub fn read_index(&self, frame: &[u8]) -> Option<u64> {
        let bytes = frame.get(..self.index_size)?;
        Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// Convert one raw sample (`sample_alloc_size` bytes) into µV.
    ///
    /// Values are two's-complement signed in the family's byte order.
    pub fn decode_sample(&self, raw: &[u8]) -> f64 {
        let value = match (raw, self.endianness) {
            ([hi, lo], SampleEndianness::Big) => i16::from_be_bytes([*hi, *lo]) as f64,
            ([lo, hi], SampleEndianness::Little) => i16::from_le_bytes([*lo, *hi]) as f64,
            _ => return f64::NAN,
        };
        value * self.microvolts_per_lsb
    }
}

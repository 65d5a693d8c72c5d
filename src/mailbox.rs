//! Mailbox command/response codec.
//!
//! Every mailbox frame is `[opcode, payload…]`, unescaped and unframed; BLE
//! already delimits notifications.  The codec is pure: [`MailboxCommand::encode`]
//! builds the bytes written to [`crate::protocol::MAILBOX_CHARACTERISTIC`] and
//! [`decode`] turns any non-empty notification into a [`MailboxResponse`].
//!
//! | Opcode | Command | Response payload |
//! |---|---|---|
//! | `0x01` | connect audio sub-link | [`AudioLinkStatus`], several per command |
//! | `0x02` | disconnect audio sub-link | [`AudioLinkStatus`] |
//! | `0x03` | set serial number | echoed ASCII |
//! | `0x04` | — | lead-off event, channel bitmask |
//! | `0x05` | system status | processor, memory, audio status bytes |
//! | `0x06` | reboot | reboot notice (unsolicited) |
//! | `0x07` | transmit MTU | accepted samples per frame |
//! | `0x08` | EEG config | gain code, notch code, trigger flag |
//! | `0x09` | set trigger mode | trigger flag |
//! | `0x0A` | battery | coarse level, see [`crate::protocol::battery_percent`] |
//! | `0x0B` | set product name | echoed ASCII |
//! | `0x0C` | set amplifier gain | gain code |

use serde::Serialize;

use crate::error::MailboxError;
use crate::protocol::battery_percent;

/// Mailbox operation codes.
pub mod opcode {
    pub const AUDIO_CONNECT: u8 = 0x01;
    pub const AUDIO_DISCONNECT: u8 = 0x02;
    pub const SET_SERIAL_NUMBER: u8 = 0x03;
    pub const LEAD_OFF_EVENT: u8 = 0x04;
    pub const SYSTEM_STATUS: u8 = 0x05;
    pub const REBOOT: u8 = 0x06;
    pub const TRANSMIT_MTU: u8 = 0x07;
    pub const EEG_CONFIG: u8 = 0x08;
    pub const SET_TRIGGER_MODE: u8 = 0x09;
    pub const BATTERY: u8 = 0x0a;
    pub const SET_PRODUCT_NAME: u8 = 0x0b;
    pub const SET_AMPLIFIER_GAIN: u8 = 0x0c;
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A host → device mailbox command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MailboxCommand {
    /// Establish the audio sub-link.  Answered by a sequence of
    /// [`MailboxResponse::AudioConnect`] until a terminal status.
    ConnectAudio,
    DisconnectAudio,
    SetSerialNumber(String),
    GetSystemStatus,
    /// Reboot the headset.  The device does not answer.
    Reboot,
    /// Tell the device the negotiated MTU; it answers with the number of
    /// samples per frame it will send.
    TransmitMtu(u8),
    GetEegConfig,
    SetTriggerMode(bool),
    GetBattery,
    SetProductName(String),
    SetAmplifierGain(u8),
}

impl MailboxCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            MailboxCommand::ConnectAudio => opcode::AUDIO_CONNECT,
            MailboxCommand::DisconnectAudio => opcode::AUDIO_DISCONNECT,
            MailboxCommand::SetSerialNumber(_) => opcode::SET_SERIAL_NUMBER,
            MailboxCommand::GetSystemStatus => opcode::SYSTEM_STATUS,
            MailboxCommand::Reboot => opcode::REBOOT,
            MailboxCommand::TransmitMtu(_) => opcode::TRANSMIT_MTU,
            MailboxCommand::GetEegConfig => opcode::EEG_CONFIG,
            MailboxCommand::SetTriggerMode(_) => opcode::SET_TRIGGER_MODE,
            MailboxCommand::GetBattery => opcode::BATTERY,
            MailboxCommand::SetProductName(_) => opcode::SET_PRODUCT_NAME,
            MailboxCommand::SetAmplifierGain(_) => opcode::SET_AMPLIFIER_GAIN,
        }
    }

    /// Serialize to `[opcode, payload…]`.
    ///
    /// ```
    /// # use eeg_link::mailbox::MailboxCommand;
    /// assert_eq!(MailboxCommand::TransmitMtu(47).encode(), vec![0x07, 47]);
    /// assert_eq!(MailboxCommand::GetBattery.encode(), vec![0x0a]);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            MailboxCommand::SetSerialNumber(text) | MailboxCommand::SetProductName(text) => {
                out.extend_from_slice(text.as_bytes())
            }
            MailboxCommand::TransmitMtu(mtu) => out.push(*mtu),
            MailboxCommand::SetTriggerMode(enabled) => out.push(*enabled as u8),
            MailboxCommand::SetAmplifierGain(code) => out.push(*code),
            MailboxCommand::ConnectAudio
            | MailboxCommand::DisconnectAudio
            | MailboxCommand::GetSystemStatus
            | MailboxCommand::Reboot
            | MailboxCommand::GetEegConfig
            | MailboxCommand::GetBattery => {}
        }
        out
    }

    /// `true` when the device answers this command.
    pub fn expects_response(&self) -> bool {
        !matches!(self, MailboxCommand::Reboot)
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Status byte of an audio sub-link response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AudioLinkStatus {
    Connected,
    InProgress,
    /// The stored link key was rejected; re-bonding may succeed.
    LinkKeyInvalid,
    /// A wired headphone is plugged in, so the sub-link cannot be routed.
    JackConnected,
    AlreadyConnected,
    Failed(u8),
}

impl AudioLinkStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => AudioLinkStatus::Connected,
            0x01 => AudioLinkStatus::InProgress,
            0x02 => AudioLinkStatus::LinkKeyInvalid,
            0x03 => AudioLinkStatus::JackConnected,
            0x04 => AudioLinkStatus::AlreadyConnected,
            other => AudioLinkStatus::Failed(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            AudioLinkStatus::Connected | AudioLinkStatus::AlreadyConnected
        )
    }
}

/// Headset self-test result from [`MailboxCommand::GetSystemStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub processor_ok: bool,
    pub memory_ok: bool,
    pub audio_ok: bool,
}

/// Acquisition settings from [`MailboxCommand::GetEegConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EegConfig {
    pub gain_code: u8,
    pub notch_code: u8,
    pub trigger: bool,
}

/// A decoded device → host mailbox frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MailboxResponse {
    AudioConnect(AudioLinkStatus),
    AudioDisconnect(AudioLinkStatus),
    SerialNumberSet(String),
    /// Unsolicited: bit `n` set means electrode `n` lost contact.
    LeadOff { channel_mask: u8 },
    SystemStatus(SystemStatus),
    /// Unsolicited: the headset is about to reboot.
    Rebooting,
    MtuAccepted { samples_per_frame: u8 },
    EegConfig(EegConfig),
    TriggerMode { enabled: bool },
    Battery { percent: f32 },
    ProductNameSet(String),
    AmplifierGain { code: u8 },
    /// Unrecognized opcode, or a known opcode with a short payload.
    Unknown { opcode: u8, payload: Vec<u8> },
}

impl MailboxResponse {
    /// Opcode this response was decoded from.
    pub fn opcode(&self) -> u8 {
        match self {
            MailboxResponse::AudioConnect(_) => opcode::AUDIO_CONNECT,
            MailboxResponse::AudioDisconnect(_) => opcode::AUDIO_DISCONNECT,
            MailboxResponse::SerialNumberSet(_) => opcode::SET_SERIAL_NUMBER,
            MailboxResponse::LeadOff { .. } => opcode::LEAD_OFF_EVENT,
            MailboxResponse::SystemStatus(_) => opcode::SYSTEM_STATUS,
            MailboxResponse::Rebooting => opcode::REBOOT,
            MailboxResponse::MtuAccepted { .. } => opcode::TRANSMIT_MTU,
            MailboxResponse::EegConfig(_) => opcode::EEG_CONFIG,
            MailboxResponse::TriggerMode { .. } => opcode::SET_TRIGGER_MODE,
            MailboxResponse::Battery { .. } => opcode::BATTERY,
            MailboxResponse::ProductNameSet(_) => opcode::SET_PRODUCT_NAME,
            MailboxResponse::AmplifierGain { .. } => opcode::SET_AMPLIFIER_GAIN,
            MailboxResponse::Unknown { opcode, .. } => *opcode,
        }
    }

    /// `false` only for intermediate responses of a multi-response command;
    /// a waiter keeps listening (without restarting its timeout) until it
    /// sees a terminal one.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            MailboxResponse::AudioConnect(AudioLinkStatus::InProgress)
        )
    }
}

/// Decode one mailbox notification.
///
/// Total over non-empty input: unknown opcodes and truncated payloads become
/// [`MailboxResponse::Unknown`] so that device noise can never abort the
/// session.  Only an empty buffer is an error.
pub fn decode(bytes: &[u8]) -> Result<MailboxResponse, MailboxError> {
    let (&op, payload) = bytes
        .split_first()
        .ok_or(MailboxError::InvalidFrame("empty mailbox frame"))?;

    let unknown = || MailboxResponse::Unknown {
        opcode: op,
        payload: payload.to_vec(),
    };
    let text = || String::from_utf8_lossy(payload).trim_end_matches('\0').to_owned();

    let response = match (op, payload) {
        (opcode::AUDIO_CONNECT, [status, ..]) => {
            MailboxResponse::AudioConnect(AudioLinkStatus::from_byte(*status))
        }
        (opcode::AUDIO_DISCONNECT, [status, ..]) => {
            MailboxResponse::AudioDisconnect(AudioLinkStatus::from_byte(*status))
        }
        (opcode::SET_SERIAL_NUMBER, _) => MailboxResponse::SerialNumberSet(text()),
        (opcode::LEAD_OFF_EVENT, [mask, ..]) => MailboxResponse::LeadOff { channel_mask: *mask },
        (opcode::SYSTEM_STATUS, [processor, memory, audio, ..]) => {
            MailboxResponse::SystemStatus(SystemStatus {
                processor_ok: *processor == 0,
                memory_ok: *memory == 0,
                audio_ok: *audio == 0,
            })
        }
        (opcode::REBOOT, _) => MailboxResponse::Rebooting,
        (opcode::TRANSMIT_MTU, [samples, ..]) => MailboxResponse::MtuAccepted {
            samples_per_frame: *samples,
        },
        (opcode::EEG_CONFIG, [gain, notch, trigger, ..]) => MailboxResponse::EegConfig(EegConfig {
            gain_code: *gain,
            notch_code: *notch,
            trigger: *trigger != 0,
        }),
        (opcode::SET_TRIGGER_MODE, [flag, ..]) => MailboxResponse::TriggerMode { enabled: *flag != 0 },
        (opcode::BATTERY, [level, ..]) => MailboxResponse::Battery {
            percent: battery_percent(*level),
        },
        (opcode::SET_PRODUCT_NAME, _) => MailboxResponse::ProductNameSet(text()),
        (opcode::SET_AMPLIFIER_GAIN, [code, ..]) => MailboxResponse::AmplifierGain { code: *code },
        _ => {
            log::debug!("mailbox: unrecognized frame op=0x{op:02x} len={}", payload.len());
            unknown()
        }
    };
    Ok(response)
}

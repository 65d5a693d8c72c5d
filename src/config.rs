use std::time::Duration;

use crate::protocol::PREFERRED_MTU;
use crate::reassembly::ReassemblerConfig;
use crate::transport::ScanFilter;
use crate::types::ConnectionState;

// ── StepTimeouts ──────────────────────────────────────────────────────────────

/// Time budget for each connection step and for post-connect requests.
///
/// A step that does not finish within its budget moves the state machine to
/// that step's failure state; the pending transport call is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTimeouts {
    /// Radio readiness and the already-connected check.  Default: 5 s.
    pub preflight: Duration,
    /// How long to wait for a matching advertisement.  Default: 15 s.
    pub scan: Duration,
    /// Link establishment and mailbox subscription.  Default: 10 s.
    ///
    /// BlueZ's `Device1.Connect` can block forever when the headset is out of
    /// range; a BLE connection typically takes under 2 s.
    pub connect: Duration,
    /// GATT service discovery.  Default: 15 s.
    pub discovery: Duration,
    /// One device-information read.  Default: 5 s.
    pub read_info: Duration,
    /// Pairing plus the audio sub-link, retries included.  Default: 30 s.
    pub bonding: Duration,
    /// MTU request plus the transmit-MTU mailbox exchange.  Default: 5 s.
    pub negotiation: Duration,
    /// One mailbox command sent through `SendCommand`.  Default: 5 s.
    pub command: Duration,
    /// Link teardown.  Default: 5 s.
    pub disconnect: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            preflight: Duration::from_secs(5),
            scan: Duration::from_secs(15),
            connect: Duration::from_secs(10),
            discovery: Duration::from_secs(15),
            read_info: Duration::from_secs(5),
            bonding: Duration::from_secs(30),
            negotiation: Duration::from_secs(5),
            command: Duration::from_secs(5),
            disconnect: Duration::from_secs(5),
        }
    }
}

impl StepTimeouts {
    /// Budget of the step that runs from `state`.
    pub fn for_state(&self, state: ConnectionState) -> Duration {
        use ConnectionState::*;
        match state {
            Idle | ReadyForOperation => self.preflight,
            Scanning | DeviceFound => self.scan,
            Connecting | Connected => self.connect,
            DiscoveringCapabilities => self.discovery,
            ReadingInfo(_) => self.read_info,
            Bonding => self.bonding,
            NegotiatingTransportParams => self.negotiation,
            Disconnecting => self.disconnect,
            _ => self.command,
        }
    }

    /// Every budget set to `d`.  Handy for tests and impatient tools.
    pub fn uniform(d: Duration) -> Self {
        Self {
            preflight: d,
            scan: d,
            connect: d,
            discovery: d,
            read_info: d,
            bonding: d,
            negotiation: d,
            command: d,
            disconnect: d,
        }
    }
}

// ── StreamOverrides ───────────────────────────────────────────────────────────

/// Optional replacements for a family's frame geometry defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOverrides {
    pub channel_count: Option<usize>,
    /// Also the packet length in samples per channel.
    pub sample_rate: Option<usize>,
    pub consolidation_threshold: Option<usize>,
    pub max_gap_frames: Option<u64>,
}

impl StreamOverrides {
    /// Apply the set fields on top of `config`.
    pub fn apply(&self, mut config: ReassemblerConfig) -> ReassemblerConfig {
        if let Some(n) = self.channel_count {
            config.geometry.channel_count = n;
        }
        if let Some(rate) = self.sample_rate {
            config.geometry.sample_rate = rate;
        }
        if let Some(threshold) = self.consolidation_threshold {
            config.consolidation_threshold = threshold;
        }
        if let Some(gap) = self.max_gap_frames {
            config.max_gap_frames = gap;
        }
        config
    }
}

// ── DriverConfig ──────────────────────────────────────────────────────────────

/// Default [`DriverConfig::event_capacity`].
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for [`crate::driver::Driver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Which advertisements to accept.  Default: any supported family.
    pub scan_filter: ScanFilter,
    pub timeouts: StepTimeouts,
    /// MTU requested on links that support negotiation.  Default: `47`.
    pub requested_mtu: u16,
    /// Bring up the audio sub-link during `Bonding` on headsets that have
    /// one.  Default: `true`.
    pub connect_audio: bool,
    /// Retries of the audio sub-link after the first attempt.  Default: `2`.
    pub audio_retries: u32,
    /// Pause between audio sub-link attempts.  Default: 500 ms.
    pub audio_retry_backoff: Duration,
    /// How long one audio sub-link attempt waits for its final status before
    /// it counts as failed and is retried.  Default: 5 s.
    pub audio_attempt_timeout: Duration,
    pub stream: StreamOverrides,
    /// Size of the [`crate::types::DriverEvent`] channel.  A consumer that
    /// falls this far behind stalls the drain worker, and the dispatch ring
    /// then sheds unprocessed frames.  Default: [`DEFAULT_EVENT_CAPACITY`].
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            scan_filter: ScanFilter::default(),
            timeouts: StepTimeouts::default(),
            requested_mtu: PREFERRED_MTU,
            connect_audio: true,
            audio_retries: 2,
            audio_retry_backoff: Duration::from_millis(500),
            audio_attempt_timeout: Duration::from_secs(5),
            stream: StreamOverrides::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

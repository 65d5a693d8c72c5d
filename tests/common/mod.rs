//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;

use eeg_link::error::TransportError;
use eeg_link::mailbox::opcode;
use eeg_link::transport::{
    CapabilitySet, NotificationChannel, ScanFilter, Transport, TransportResult,
};
use eeg_link::config::{DriverConfig, StepTimeouts};
use eeg_link::types::{ConnectionState, DeviceDescriptor, DeviceInfoKind, DriverEvent};

/// Every transport call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Scan,
    StopScan,
    ConnectedDevice,
    Connect(String),
    Disconnect,
    DiscoverCapabilities,
    ReadInfo(DeviceInfoKind),
    Write(Vec<u8>),
    Subscribe(NotificationChannel),
    Unsubscribe(NotificationChannel),
    Negotiate(u16),
    IsBonded,
    RequestPairing,
}

/// Operations that can be made to hang forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    Discover,
    ReadInfo,
    Pairing,
    Negotiate,
}

/// How the fake headset behaves.
pub struct Script {
    /// Advertised during a scan; the scan stream stays open afterwards.
    pub advertisements: Vec<DeviceDescriptor>,
    pub already_connected: Option<DeviceDescriptor>,
    pub connect_error: bool,
    pub capabilities: CapabilitySet,
    pub info: HashMap<DeviceInfoKind, Vec<u8>>,
    pub bonded: bool,
    pub negotiated_mtu: u16,
    /// Status bytes answered to each successive `ConnectAudio`.
    pub audio_attempts: VecDeque<Vec<u8>>,
    /// Samples per frame answered to `TransmitMtu`.
    pub samples_per_frame: u8,
    /// Raw battery byte answered to `GetBattery`.
    pub battery: u8,
    pub stall: HashSet<Op>,
    /// Mailbox opcodes the headset never answers.
    pub silent: HashSet<u8>,
}

pub fn alpha() -> DeviceDescriptor {
    DeviceDescriptor::from_advertisement("AA:BB:CC:DD:EE:01", "alpha_1010100123").unwrap()
}

pub fn beta() -> DeviceDescriptor {
    DeviceDescriptor::from_advertisement("AA:BB:CC:DD:EE:02", "beta_0042").unwrap()
}

impl Default for Script {
    fn default() -> Self {
        let info = HashMap::from([
            (DeviceInfoKind::FirmwareVersion, b"1.7.4\0".to_vec()),
            (DeviceInfoKind::HardwareVersion, b"rev C".to_vec()),
            (DeviceInfoKind::SerialNumber, b"1010100123".to_vec()),
            (DeviceInfoKind::ModelNumber, b"alpha-2ch".to_vec()),
        ]);
        Self {
            advertisements: vec![alpha()],
            already_connected: None,
            connect_error: false,
            capabilities: CapabilitySet {
                mailbox: true,
                data: true,
                device_info: true,
                pairing: true,
                audio: true,
                mtu_negotiation: true,
            },
            info,
            bonded: false,
            negotiated_mtu: 47,
            audio_attempts: VecDeque::from([vec![0x01, 0x00]]),
            samples_per_frame: 1,
            battery: 8,
            stall: HashSet::new(),
            silent: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Channels {
    mailbox: Option<mpsc::UnboundedSender<Vec<u8>>>,
    data: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct Inner {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    channels: Mutex<Channels>,
}

/// Cheap to clone; clones share the same fake headset.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockLink(pub String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

fn into_stream(mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> BoxStream<'static, Vec<u8>> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

impl MockTransport {
    pub fn new(script: Script) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
                channels: Mutex::new(Channels::default()),
            }),
        }
    }

    /// Change the headset's behaviour mid-test.
    pub fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.inner.script)
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.inner.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.inner.calls).len()
    }

    /// Mailbox commands written so far, as opcodes.
    pub fn written_opcodes(&self) -> Vec<u8> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(bytes) => bytes.first().copied(),
                _ => None,
            })
            .collect()
    }

    /// Push a raw sensor-data frame; `false` when data is not subscribed.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        lock(&self.inner.channels)
            .data
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Push an unsolicited mailbox frame.
    pub fn send_mailbox(&self, frame: Vec<u8>) -> bool {
        lock(&self.inner.channels)
            .mailbox
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// End every notification stream, as a dropped radio link would.
    pub fn drop_link(&self) {
        let mut channels = lock(&self.inner.channels);
        channels.mailbox = None;
        channels.data = None;
    }

    fn record(&self, call: Call) {
        lock(&self.inner.calls).push(call);
    }

    async fn maybe_stall(&self, op: Op) {
        let stalled = lock(&self.inner.script).stall.contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Answer a mailbox command the way the headset would.
    fn respond(&self, command: &[u8]) {
        let Some((&op, payload)) = command.split_first() else {
            return;
        };
        let replies: Vec<Vec<u8>> = {
            let mut script = lock(&self.inner.script);
            if script.silent.contains(&op) {
                return;
            }
            match op {
                opcode::AUDIO_CONNECT => script
                    .audio_attempts
                    .pop_front()
                    .unwrap_or_else(|| vec![0xff])
                    .into_iter()
                    .map(|status| vec![op, status])
                    .collect(),
                opcode::TRANSMIT_MTU => vec![vec![op, script.samples_per_frame]],
                opcode::BATTERY => vec![vec![op, script.battery]],
                opcode::SET_TRIGGER_MODE => vec![vec![op, payload.first().copied().unwrap_or(0)]],
                opcode::SYSTEM_STATUS => vec![vec![op, 0, 0, 0]],
                opcode::REBOOT => vec![],
                _ => vec![command.to_vec()],
            }
        };
        let channels = lock(&self.inner.channels);
        if let Some(tx) = channels.mailbox.as_ref() {
            for reply in replies {
                let _ = tx.send(reply);
            }
        }
    }
}

impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(&self, _filter: &ScanFilter) -> TransportResult<BoxStream<'static, DeviceDescriptor>> {
        self.record(Call::Scan);
        let adverts = lock(&self.inner.script).advertisements.clone();
        Ok(futures::stream::iter(adverts)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connected_device(&self) -> TransportResult<Option<(DeviceDescriptor, MockLink)>> {
        self.record(Call::ConnectedDevice);
        Ok(lock(&self.inner.script)
            .already_connected
            .clone()
            .map(|d| {
                let link = MockLink(d.address.clone());
                (d, link)
            }))
    }

    async fn connect(&self, device: &DeviceDescriptor) -> TransportResult<MockLink> {
        self.record(Call::Connect(device.address.clone()));
        self.maybe_stall(Op::Connect).await;
        if lock(&self.inner.script).connect_error {
            return Err(TransportError::Rejected("connection refused".into()));
        }
        Ok(MockLink(device.address.clone()))
    }

    async fn disconnect(&self, _link: &MockLink) -> TransportResult<()> {
        self.record(Call::Disconnect);
        self.drop_link();
        Ok(())
    }

    async fn discover_capabilities(&self, _link: &MockLink) -> TransportResult<CapabilitySet> {
        self.record(Call::DiscoverCapabilities);
        self.maybe_stall(Op::Discover).await;
        Ok(lock(&self.inner.script).capabilities)
    }

    async fn read_info(&self, _link: &MockLink, kind: DeviceInfoKind) -> TransportResult<Vec<u8>> {
        self.record(Call::ReadInfo(kind));
        self.maybe_stall(Op::ReadInfo).await;
        lock(&self.inner.script)
            .info
            .get(&kind)
            .cloned()
            .ok_or_else(|| TransportError::MissingAttribute(format!("{kind:?}")))
    }

    async fn write_command(&self, _link: &MockLink, bytes: &[u8]) -> TransportResult<()> {
        self.record(Call::Write(bytes.to_vec()));
        self.respond(bytes);
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        _link: &MockLink,
        channel: NotificationChannel,
    ) -> TransportResult<BoxStream<'static, Vec<u8>>> {
        self.record(Call::Subscribe(channel));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = lock(&self.inner.channels);
        match channel {
            NotificationChannel::Mailbox => channels.mailbox = Some(tx),
            NotificationChannel::Data => channels.data = Some(tx),
        }
        Ok(into_stream(rx))
    }

    async fn unsubscribe(&self, _link: &MockLink, channel: NotificationChannel) -> TransportResult<()> {
        self.record(Call::Unsubscribe(channel));
        if channel == NotificationChannel::Data {
            lock(&self.inner.channels).data = None;
        }
        Ok(())
    }

    async fn negotiate_transport_parameter(&self, _link: &MockLink, requested: u16) -> TransportResult<u16> {
        self.record(Call::Negotiate(requested));
        self.maybe_stall(Op::Negotiate).await;
        Ok(requested.min(lock(&self.inner.script).negotiated_mtu))
    }

    async fn is_bonded(&self, _link: &MockLink) -> TransportResult<bool> {
        self.record(Call::IsBonded);
        Ok(lock(&self.inner.script).bonded)
    }

    async fn request_pairing(&self, _link: &MockLink) -> TransportResult<()> {
        self.record(Call::RequestPairing);
        self.maybe_stall(Op::Pairing).await;
        lock(&self.inner.script).bonded = true;
        Ok(())
    }
}

/// Drain every event currently queued.
pub fn drain(events: &mut mpsc::Receiver<DriverEvent>) -> Vec<DriverEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// State changes among `events`, in order.
pub fn states(events: &[DriverEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            DriverEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

/// Receive events until one satisfies `pred`, returning it.
pub async fn wait_for(
    events: &mut mpsc::Receiver<DriverEvent>,
    mut pred: impl FnMut(&DriverEvent) -> bool,
) -> DriverEvent {
    let found = async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(60), found)
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Short step budgets so failure paths resolve quickly under paused time.
pub fn config() -> DriverConfig {
    DriverConfig {
        timeouts: StepTimeouts::uniform(Duration::from_secs(2)),
        audio_retry_backoff: Duration::from_millis(10),
        audio_attempt_timeout: Duration::from_millis(500),
        ..DriverConfig::default()
    }
}

/// An Alpha data frame: 2-byte big-endian index, optional status byte, then
/// one row of big-endian i16 samples per timestep.
pub fn alpha_frame(index: u16, status: Option<u8>, timesteps: &[&[i16]]) -> Vec<u8> {
    let mut out = index.to_be_bytes().to_vec();
    out.extend(status);
    for row in timesteps {
        for v in *row {
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
    out
}

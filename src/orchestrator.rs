//! Connection state machine.
//!
//! [`Orchestrator`] owns the [`Session`] and drives it through the
//! connection pipeline one step at a time:
//!
//! | From | Step | Failure |
//! |---|---|---|
//! | `Idle` | radio ready | `ScanFailed` |
//! | `ReadyForOperation` | already-linked check (may short-circuit to `Ready`) | `ScanFailed` / `AnotherDeviceConnected` |
//! | `Scanning` | first matching advertisement | `ScanFailed` |
//! | `DeviceFound` | target selected | `ScanFailed` |
//! | `Connecting` | link up | `ConnectFailed` |
//! | `Connected` | mailbox notifications on | `ConnectFailed` |
//! | `DiscoveringCapabilities` | characteristics + optional features | `DiscoveryFailed` |
//! | `ReadingInfo(kind)` | firmware, hardware, serial, model | `ReadFailed` |
//! | `Bonding` | pairing, then audio sub-link (retried) | `BondFailed` |
//! | `NegotiatingTransportParams` | MTU + transmit-MTU exchange | `NegotiationFailed` |
//!
//! Every step is bounded by its [`StepTimeouts`](crate::config::StepTimeouts)
//! budget and by the request's cancellation token.  A step runs only from its
//! own pre-state, so calling it anywhere else is a no-op.
//!
//! Mailbox notifications are decoded by a router task.  A control step that
//! expects an answer registers a single waiter keyed on the command opcode;
//! everything else goes out as [`DriverEvent::Mailbox`].  When the mailbox
//! stream ends the router queues a disconnect.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DriverConfig;
use crate::error::{DriverError, Result, TransportError};
use crate::mailbox::{self, AudioLinkStatus, MailboxCommand, MailboxResponse};
use crate::protocol::DEFAULT_MTU;
use crate::reassembly::{FrameReassembler, ReassemblerConfig};
use crate::serializer::{RequestExecutor, WeakRequestSender};
use crate::supervisor::StreamingSupervisor;
use crate::transport::{CapabilitySet, NotificationChannel, Transport};
use crate::types::{
    Capabilities, ConnectionState, DeviceDescriptor, DeviceInfo, DeviceInfoKind, DriverEvent,
    PendingRequest, StreamOptions, StreamState,
};

// ── Session ───────────────────────────────────────────────────────────────────

/// Everything known about the current connection attempt.
#[derive(Debug, Clone)]
pub struct Session<L> {
    pub state: ConnectionState,
    pub device: Option<DeviceDescriptor>,
    pub link: Option<L>,
    /// Raw discovery result.
    pub link_capabilities: CapabilitySet,
    /// Family defaults intersected with what discovery found.
    pub capabilities: Capabilities,
    pub info: Vec<DeviceInfo>,
    pub mtu: u16,
    /// Samples per data frame the device agreed to send.
    pub samples_per_frame: Option<u8>,
    /// Trigger mode last confirmed by the device.
    pub trigger: bool,
}

impl<L> Session<L> {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            device: None,
            link: None,
            link_capabilities: CapabilitySet::default(),
            capabilities: Capabilities::default(),
            info: Vec::new(),
            mtu: DEFAULT_MTU,
            samples_per_frame: None,
            trigger: false,
        }
    }

    /// Last value read for `kind`, if any.
    pub fn info(&self, kind: DeviceInfoKind) -> Option<&DeviceInfo> {
        self.info.iter().find(|i| i.kind() == kind)
    }
}

// ── Mailbox routing ───────────────────────────────────────────────────────────

struct Waiter {
    id: u64,
    opcode: u8,
    tx: mpsc::UnboundedSender<MailboxResponse>,
}

/// Routes decoded mailbox frames to the one registered waiter.
#[derive(Default)]
struct MailboxRouter {
    slot: Mutex<Option<Waiter>>,
    next_id: AtomicU64,
}

impl MailboxRouter {
    fn lock(&self) -> MutexGuard<'_, Option<Waiter>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register for responses carrying `opcode`, replacing any stale waiter.
    fn register(
        self: &Arc<Self>,
        opcode: u8,
    ) -> (WaiterGuard, mpsc::UnboundedReceiver<MailboxResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.lock() = Some(Waiter { id, opcode, tx });
        let guard = WaiterGuard {
            router: Arc::clone(self),
            id,
        };
        (guard, rx)
    }

    /// Hand `response` to the waiter; gives it back when nobody wants it.
    fn route(&self, response: MailboxResponse) -> Option<MailboxResponse> {
        let slot = self.lock();
        match slot.as_ref() {
            Some(waiter) if waiter.opcode == response.opcode() => {
                waiter.tx.send(response).err().map(|e| e.0)
            }
            _ => Some(response),
        }
    }

    /// Drop the waiter so a pending exchange observes the lost link.
    fn close(&self) {
        self.lock().take();
    }
}

/// Unregisters its waiter when the exchange completes or is dropped.
struct WaiterGuard {
    router: Arc<MailboxRouter>,
    id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut slot = self.router.lock();
        if slot.as_ref().is_some_and(|w| w.id == self.id) {
            slot.take();
        }
    }
}

async fn route_mailbox(
    mut frames: BoxStream<'static, Vec<u8>>,
    router: Arc<MailboxRouter>,
    events: mpsc::Sender<DriverEvent>,
    requests: Option<WeakRequestSender>,
) {
    while let Some(bytes) = frames.next().await {
        match mailbox::decode(&bytes) {
            Ok(response) => {
                if let Some(unclaimed) = router.route(response) {
                    debug!("mailbox: unsolicited {unclaimed:?}");
                    let _ = events.send(DriverEvent::Mailbox(unclaimed)).await;
                }
            }
            Err(e) => warn!("mailbox: {e}"),
        }
    }
    info!("mailbox: notification stream ended; treating link as lost");
    router.close();
    if let Some(requests) = requests {
        if !requests.submit_detached(PendingRequest::Disconnect { interrupted: false }) {
            debug!("mailbox: request worker gone; not queueing disconnect");
        }
    }
}

/// Run `fut` bounded by `budget` and `cancel`.
async fn bounded<R>(
    step: ConnectionState,
    budget: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<R>>,
) -> Result<R> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Interrupted),
        outcome = tokio::time::timeout(budget, fut) => {
            outcome.unwrap_or(Err(DriverError::StepTimeout { step, after: budget }))
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator<T: Transport> {
    transport: Arc<T>,
    config: DriverConfig,
    session: Session<T::Link>,
    supervisor: StreamingSupervisor,
    mailbox: Arc<MailboxRouter>,
    mailbox_task: Option<JoinHandle<()>>,
    events: mpsc::Sender<DriverEvent>,
    state: watch::Sender<ConnectionState>,
    requests: Option<WeakRequestSender>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(
        transport: Arc<T>,
        config: DriverConfig,
        events: mpsc::Sender<DriverEvent>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        state.send_replace(ConnectionState::Idle);
        Self {
            transport,
            config,
            session: Session::new(ConnectionState::Idle),
            supervisor: StreamingSupervisor::new(),
            mailbox: Arc::new(MailboxRouter::default()),
            mailbox_task: None,
            events,
            state,
            requests: None,
        }
    }

    /// Where the mailbox router queues its link-loss disconnect.
    pub fn with_request_sender(mut self, requests: WeakRequestSender) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn session(&self) -> &Session<T::Link> {
        &self.session
    }

    pub fn is_streaming(&self) -> bool {
        self.supervisor.is_enabled()
    }

    /// Execute one request to completion.
    pub async fn handle(&mut self, request: PendingRequest, cancel: CancellationToken) -> Result<()> {
        match request {
            PendingRequest::Connect => self.connect(&cancel).await,
            PendingRequest::Disconnect { interrupted: false } => self.disconnect().await,
            PendingRequest::Disconnect { interrupted: true } => self.settle_interrupted().await,
            PendingRequest::ReadInfo(kind) => {
                self.require_ready()?;
                let budget = self.config.timeouts.read_info;
                let info = bounded(self.state(), budget, &cancel, self.fetch_info(kind)).await?;
                self.record_info(info).await;
                Ok(())
            }
            PendingRequest::SetStreamState(StreamState::Start(options)) => {
                self.start_stream(options, &cancel).await
            }
            PendingRequest::SetStreamState(StreamState::Stop) => {
                self.stop_stream().await;
                Ok(())
            }
            PendingRequest::SendCommand(command) => self.send_command(command, &cancel).await,
        }
    }

    // ── Pipeline ─────────────────────────────────────────────────────────────

    /// Run the pipeline until `Ready` or a failure state.  A no-op in `Ready`.
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let state = self.state();
        if state == ConnectionState::Ready {
            debug!("connect: already ready");
            return Ok(());
        }
        if !state.can_start_connection() {
            debug!("connect: ignored in {state}");
            return Ok(());
        }
        if state != ConnectionState::Idle {
            self.reset_session();
            self.transition(ConnectionState::Idle).await;
        }
        while self.state().is_in_progress() {
            self.advance(cancel).await?;
        }
        Ok(())
    }

    /// Run the step for the current state.
    ///
    /// No-op (and no transport call) in `Ready`, in failure states and while
    /// `Interrupted`.
    pub async fn advance(&mut self, cancel: &CancellationToken) -> Result<()> {
        let state = self.state();
        self.step(state, cancel).await.map(|_| ())
    }

    /// Run the step whose pre-state is `expected`.  Returns `Ok(false)`
    /// without doing anything when the machine is elsewhere.
    pub async fn step(&mut self, expected: ConnectionState, cancel: &CancellationToken) -> Result<bool> {
        let state = self.state();
        if state != expected || !state.is_in_progress() {
            debug!("step {expected}: not applicable in {state}");
            return Ok(false);
        }

        let budget = self.config.timeouts.for_state(state);
        let outcome = bounded(state, budget, cancel, self.run_step(state)).await;

        match outcome {
            Ok(next) => {
                self.transition(next).await;
                Ok(true)
            }
            Err(DriverError::Interrupted) => {
                info!("step {state} interrupted");
                if state == ConnectionState::Scanning {
                    self.stop_scan().await;
                }
                self.transition(ConnectionState::Interrupted).await;
                Err(DriverError::Interrupted)
            }
            Err(DriverError::AnotherDeviceConnected(name)) => {
                warn!("{name} is linked to this host but does not match the scan filter");
                self.transition(ConnectionState::AnotherDeviceConnected).await;
                Err(DriverError::AnotherDeviceConnected(name))
            }
            Err(e) => {
                let failed = state.failure().unwrap_or(ConnectionState::ConnectFailed);
                warn!("step {state} failed: {e}");
                if state == ConnectionState::Scanning {
                    self.stop_scan().await;
                }
                self.release_link().await;
                self.transition(failed).await;
                Err(e)
            }
        }
    }

    async fn run_step(&mut self, state: ConnectionState) -> Result<ConnectionState> {
        use ConnectionState::*;
        match state {
            Idle => {}
            ReadyForOperation => return self.check_existing_link().await,
            Scanning => self.scan_for_device().await?,
            DeviceFound => {
                self.device()?;
            }
            Connecting => self.open_link().await?,
            Connected => self.open_mailbox().await?,
            DiscoveringCapabilities => self.discover().await?,
            ReadingInfo(kind) => {
                let info = self.fetch_info(kind).await?;
                self.record_info(info).await;
            }
            Bonding => self.bond().await?,
            NegotiatingTransportParams => self.negotiate().await?,
            _ => return Ok(state),
        }
        Ok(state.next().unwrap_or(Ready))
    }

    async fn check_existing_link(&mut self) -> Result<ConnectionState> {
        match self.transport.connected_device().await? {
            None => Ok(ConnectionState::Scanning),
            Some((device, link)) if self.config.scan_filter.matches(&device) => {
                info!("{} is already linked; skipping the handshake", device.name);
                self.select_device(device).await;
                self.session.link = Some(link);
                self.session.capabilities = self
                    .session
                    .device
                    .as_ref()
                    .map(|d| d.capabilities)
                    .unwrap_or_default();
                self.open_mailbox().await?;
                Ok(ConnectionState::Ready)
            }
            Some((device, _)) => Err(DriverError::AnotherDeviceConnected(device.name)),
        }
    }

    async fn scan_for_device(&mut self) -> Result<()> {
        let filter = self.config.scan_filter.clone();
        info!("scanning for headsets (filter: {filter:?})");
        let mut advertisements = self.transport.scan(&filter).await?;
        let mut found = None;
        while let Some(device) = advertisements.next().await {
            if filter.matches(&device) {
                found = Some(device);
                break;
            }
            debug!("ignoring {} at {}", device.name, device.address);
        }
        drop(advertisements);
        self.stop_scan().await;
        let device = found.ok_or_else(|| TransportError::NotFound("no matching headset".into()))?;
        info!("found {} ({:?}) at {}", device.name, device.family, device.address);
        self.select_device(device).await;
        Ok(())
    }

    async fn open_link(&mut self) -> Result<()> {
        let device = self.device()?.clone();
        let link = self.transport.connect(&device).await?;
        info!("connected to {}", device.name);
        self.session.link = Some(link);
        Ok(())
    }

    async fn open_mailbox(&mut self) -> Result<()> {
        let link = self.link()?.clone();
        let frames = self
            .transport
            .subscribe_notifications(&link, NotificationChannel::Mailbox)
            .await?;
        if let Some(task) = self.mailbox_task.take() {
            task.abort();
        }
        self.mailbox_task = Some(tokio::spawn(route_mailbox(
            frames,
            Arc::clone(&self.mailbox),
            self.events.clone(),
            self.requests.clone(),
        )));
        Ok(())
    }

    async fn discover(&mut self) -> Result<()> {
        let link = self.link()?.clone();
        let family = self.device()?.family;
        let found = self.transport.discover_capabilities(&link).await?;
        if !found.is_usable() {
            return Err(TransportError::MissingAttribute(
                "headset mailbox or data characteristic".into(),
            )
            .into());
        }
        let capabilities = family.default_capabilities().intersect(Capabilities {
            pairing: found.pairing,
            audio: found.audio,
            mtu_negotiation: found.mtu_negotiation,
        });
        info!("capabilities: {capabilities:?}");
        self.session.link_capabilities = found;
        self.session.capabilities = capabilities;
        if let Some(device) = self.session.device.as_mut() {
            device.capabilities = capabilities;
        }
        Ok(())
    }

    async fn bond(&mut self) -> Result<()> {
        let capabilities = self.session.capabilities;
        if capabilities.pairing {
            let link = self.link()?.clone();
            if self.transport.is_bonded(&link).await? {
                debug!("link already bonded");
            } else {
                info!("requesting pairing");
                self.transport.request_pairing(&link).await?;
            }
        }
        if capabilities.audio && self.config.connect_audio {
            self.connect_audio().await?;
        }
        Ok(())
    }

    /// Bring up the audio sub-link, retrying transient failures.
    async fn connect_audio(&self) -> Result<()> {
        let attempts = self.config.audio_retries + 1;
        let per_attempt = self.config.audio_attempt_timeout;
        let command = MailboxCommand::ConnectAudio;
        for attempt in 1..=attempts {
            let exchange = self.exchange(&command);
            let Ok(response) = tokio::time::timeout(per_attempt, exchange).await else {
                warn!("audio sub-link attempt {attempt}/{attempts}: no answer within {per_attempt:?}");
                if attempt < attempts {
                    tokio::time::sleep(self.config.audio_retry_backoff).await;
                }
                continue;
            };
            match response? {
                MailboxResponse::AudioConnect(status) if status.is_success() => {
                    info!("audio sub-link up ({status:?})");
                    return Ok(());
                }
                MailboxResponse::AudioConnect(AudioLinkStatus::JackConnected) => {
                    return Err(DriverError::UnexpectedResponse(
                        "audio sub-link unavailable: headphone jack connected".into(),
                    ));
                }
                other => warn!("audio sub-link attempt {attempt}/{attempts}: {other:?}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.audio_retry_backoff).await;
            }
        }
        Err(DriverError::UnexpectedResponse(format!(
            "audio sub-link failed after {attempts} attempts"
        )))
    }

    async fn negotiate(&mut self) -> Result<()> {
        if !self.session.capabilities.mtu_negotiation {
            debug!("MTU negotiation not supported; keeping {}", self.session.mtu);
            return Ok(());
        }
        let link = self.link()?.clone();
        let mtu = self
            .transport
            .negotiate_transport_parameter(&link, self.config.requested_mtu)
            .await?;
        self.session.mtu = mtu;
        let announced = u8::try_from(mtu).unwrap_or(u8::MAX);
        let response = self.exchange(&MailboxCommand::TransmitMtu(announced)).await?;
        match response {
            MailboxResponse::MtuAccepted { samples_per_frame } => {
                info!("MTU {mtu}: device sends {samples_per_frame} sample(s) per frame");
                self.session.samples_per_frame = Some(samples_per_frame);
                Ok(())
            }
            other => Err(DriverError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    // ── Device info ──────────────────────────────────────────────────────────

    async fn fetch_info(&self, kind: DeviceInfoKind) -> Result<DeviceInfo> {
        if kind == DeviceInfoKind::BatteryLevel {
            return match self.exchange(&MailboxCommand::GetBattery).await? {
                MailboxResponse::Battery { percent } => Ok(DeviceInfo::BatteryLevel(percent)),
                other => Err(DriverError::UnexpectedResponse(format!("{other:?}"))),
            };
        }
        let link = self.link()?;
        let raw = self.transport.read_info(link, kind).await?;
        DeviceInfo::from_text(kind, &raw)
            .ok_or_else(|| DriverError::UnexpectedResponse(format!("{kind:?}: {raw:02x?}")))
    }

    async fn record_info(&mut self, info: DeviceInfo) {
        debug!("device info: {info:?}");
        let kind = info.kind();
        self.session.info.retain(|i| i.kind() != kind);
        self.session.info.push(info.clone());
        let _ = self.events.send(DriverEvent::DeviceInfo(info)).await;
    }

    // ── Mailbox ──────────────────────────────────────────────────────────────

    /// Send `command` and wait for its terminal response.  Unbounded; callers
    /// wrap it in a step budget.
    async fn exchange(&self, command: &MailboxCommand) -> Result<MailboxResponse> {
        let link = self.link()?;
        let (_guard, mut responses) = self.mailbox.register(command.opcode());
        debug!("mailbox → {command:?}");
        self.transport.write_command(link, &command.encode()).await?;
        loop {
            let response = responses
                .recv()
                .await
                .ok_or(DriverError::Transport(TransportError::LinkLost))?;
            if response.is_terminal() {
                debug!("mailbox ← {response:?}");
                return Ok(response);
            }
            debug!("mailbox ← {response:?} (waiting for final response)");
        }
    }

    async fn send_command(&mut self, command: MailboxCommand, cancel: &CancellationToken) -> Result<()> {
        self.require_ready()?;
        let budget = self.config.timeouts.command;
        if !command.expects_response() {
            let link = self.link()?;
            let bytes = command.encode();
            let write = async {
                self.transport
                    .write_command(link, &bytes)
                    .await
                    .map_err(DriverError::from)
            };
            return bounded(self.state(), budget, cancel, write).await;
        }
        let response = bounded(self.state(), budget, cancel, self.exchange(&command)).await?;
        let _ = self
            .events
            .send(DriverEvent::CommandResponse { command, response })
            .await;
        Ok(())
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    async fn start_stream(&mut self, options: StreamOptions, cancel: &CancellationToken) -> Result<()> {
        self.require_ready()?;
        let family = self.device()?.family;
        let link = self.link()?.clone();
        if self.supervisor.is_enabled() {
            info!("restarting stream");
            self.stop_stream().await;
        }

        let budget = self.config.timeouts.command;
        if options.trigger != self.session.trigger {
            let command = MailboxCommand::SetTriggerMode(options.trigger);
            let response = bounded(self.state(), budget, cancel, self.exchange(&command)).await?;
            match response {
                MailboxResponse::TriggerMode { enabled } if enabled == options.trigger => {
                    self.session.trigger = enabled;
                }
                other => return Err(DriverError::UnexpectedResponse(format!("{other:?}"))),
            }
        }

        let subscribe = async {
            self.transport
                .subscribe_notifications(&link, NotificationChannel::Data)
                .await
                .map_err(DriverError::from)
        };
        let frames = bounded(self.state(), budget, cancel, subscribe).await?;

        let config = self.config.stream.apply(ReassemblerConfig {
            trigger: options.trigger,
            ..ReassemblerConfig::for_family(family)
        });
        info!(
            "streaming {} channel(s) at {} Hz (trigger: {})",
            config.geometry.channel_count, config.geometry.sample_rate, config.trigger
        );
        let reassembler = FrameReassembler::new(config, options.quality);
        self.supervisor
            .enable(reassembler, frames, self.events.clone())
            .await;
        let _ = self.events.send(DriverEvent::Streaming(true)).await;
        Ok(())
    }

    /// Disable the supervisor and turn data notifications off.  No-op when
    /// not streaming.
    async fn stop_stream(&mut self) {
        if self.supervisor.disable(&self.events).await.is_none() {
            debug!("stop_stream: not streaming");
            return;
        }
        if let Some(link) = self.session.link.clone() {
            let budget = self.config.timeouts.command;
            let unsubscribe = self.transport.unsubscribe(&link, NotificationChannel::Data);
            match tokio::time::timeout(budget, unsubscribe).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("unsubscribe from data failed: {e}"),
                Err(_) => warn!("unsubscribe from data timed out"),
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Full disconnect: `Disconnecting → Disconnected → Idle`.
    async fn disconnect(&mut self) -> Result<()> {
        if self.state() == ConnectionState::Idle && self.session.link.is_none() {
            debug!("disconnect: nothing to do");
            return Ok(());
        }
        self.transition(ConnectionState::Disconnecting).await;
        self.supervisor.disable(&self.events).await;
        self.release_link().await;
        self.transition(ConnectionState::Disconnected).await;
        self.reset_session();
        self.transition(ConnectionState::Idle).await;
        Ok(())
    }

    /// Interrupting disconnect: release everything and settle at
    /// `Interrupted`.
    async fn settle_interrupted(&mut self) -> Result<()> {
        if self.state() == ConnectionState::Idle && self.session.link.is_none() {
            debug!("interrupt: nothing in progress");
            return Ok(());
        }
        self.supervisor.disable(&self.events).await;
        self.release_link().await;
        self.reset_session();
        self.transition(ConnectionState::Interrupted).await;
        Ok(())
    }

    /// Stop the mailbox router and drop the link.
    async fn release_link(&mut self) {
        if let Some(task) = self.mailbox_task.take() {
            task.abort();
        }
        self.mailbox.close();
        let Some(link) = self.session.link.take() else {
            return;
        };
        let budget = self.config.timeouts.disconnect;
        match tokio::time::timeout(budget, self.transport.disconnect(&link)).await {
            Ok(Ok(())) => info!("link closed"),
            Ok(Err(e)) => warn!("disconnect failed: {e}"),
            Err(_) => warn!("disconnect timed out after {budget:?}"),
        }
    }

    async fn stop_scan(&self) {
        let budget = self.config.timeouts.command;
        match tokio::time::timeout(budget, self.transport.stop_scan()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("stop_scan: {e}"),
            Err(_) => debug!("stop_scan timed out after {budget:?}"),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Record `next` and announce it.  Waits for room in the event channel,
    /// so state changes are never dropped.
    async fn transition(&mut self, next: ConnectionState) {
        let previous = self.session.state;
        if previous == next {
            return;
        }
        self.session.state = next;
        info!("state: {previous} → {next}");
        self.state.send_replace(next);
        let _ = self.events.send(DriverEvent::StateChanged(next)).await;
    }

    fn reset_session(&mut self) {
        self.session = Session::new(self.session.state);
    }

    async fn select_device(&mut self, device: DeviceDescriptor) {
        let _ = self.events.send(DriverEvent::DeviceSelected(device.clone())).await;
        self.session.device = Some(device);
    }

    fn require_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            other => Err(DriverError::NotConnected(other)),
        }
    }

    fn device(&self) -> Result<&DeviceDescriptor> {
        self.session
            .device
            .as_ref()
            .ok_or(DriverError::NotConnected(self.session.state))
    }

    fn link(&self) -> Result<&T::Link> {
        self.session
            .link
            .as_ref()
            .ok_or(DriverError::NotConnected(self.session.state))
    }
}

impl<T: Transport> RequestExecutor for Orchestrator<T> {
    fn execute(
        &mut self,
        request: PendingRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        self.handle(request, cancel)
    }
}

impl<T: Transport> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        if let Some(task) = self.mailbox_task.take() {
            task.abort();
        }
    }
}

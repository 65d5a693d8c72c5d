//! Public entry point.
//!
//! [`Driver::new`] wires a [`Transport`] into an [`Orchestrator`] running
//! behind the request serializer, and hands back the event receiver:
//!
//! ```no_run
//! use eeg_link::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport = BleTransport::new().await?;
//! let (driver, mut events) = Driver::new(transport, DriverConfig::default());
//! driver.connect().await?;
//! driver.start_stream(StreamOptions::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let DriverEvent::Packet(p) = event {
//!         println!("packet #{}: {} ch × {}", p.sequence, p.channel_count(), p.sample_rate);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::mailbox::MailboxCommand;
use crate::orchestrator::Orchestrator;
use crate::serializer::{self, RequestReport, RequestSender};
use crate::transport::Transport;
use crate::types::{
    ConnectionState, DeviceInfoKind, DriverEvent, PendingRequest, StreamOptions, StreamState,
};

/// Handle to a running driver.  Clones share the same session.
///
/// The worker task stops once every clone is dropped.
#[derive(Clone)]
pub struct Driver {
    requests: RequestSender,
    state: watch::Receiver<ConnectionState>,
}

impl Driver {
    /// Start a driver on `transport`.  Must be called inside a Tokio runtime.
    ///
    /// The event receiver must be drained: it holds at most
    /// [`DriverConfig::event_capacity`] events, and the driver waits for room
    /// rather than dropping state changes or packets.
    pub fn new<T: Transport>(
        transport: T,
        config: DriverConfig,
    ) -> (Self, mpsc::Receiver<DriverEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (requests, receiver) = serializer::channel();

        let orchestrator = Orchestrator::new(Arc::new(transport), config, events_tx, state_tx)
            .with_request_sender(requests.downgrade());
        receiver.spawn(orchestrator);

        let driver = Self {
            requests,
            state: state_rx,
        };
        (driver, events_rx)
    }

    /// Queue a request.
    ///
    /// Requests that need a link fail immediately with
    /// [`DriverError::NotConnected`] unless the session is `Ready`; nothing
    /// reaches the transport in that case.
    pub fn submit(&self, request: PendingRequest) -> Result<oneshot::Receiver<RequestReport>> {
        let state = self.state();
        if request.requires_link() && state != ConnectionState::Ready {
            return Err(DriverError::NotConnected(state));
        }
        self.requests.submit(request)
    }

    /// Queue a request and wait for its report.
    pub async fn request(&self, request: PendingRequest) -> Result<RequestReport> {
        let reply = self.submit(request)?;
        reply.await.map_err(|_| DriverError::Closed)
    }

    async fn run(&self, request: PendingRequest) -> Result<()> {
        self.request(request).await?.result
    }

    /// Run the connection pipeline to `Ready`.
    pub async fn connect(&self) -> Result<()> {
        self.run(PendingRequest::Connect).await
    }

    /// Orderly disconnect, ending in `Idle`.
    pub async fn disconnect(&self) -> Result<()> {
        self.run(PendingRequest::Disconnect { interrupted: false }).await
    }

    /// Cancel whatever is in flight and settle at `Interrupted`.
    pub async fn interrupt(&self) -> Result<()> {
        self.run(PendingRequest::Disconnect { interrupted: true }).await
    }

    /// Read one device-info value; it arrives as [`DriverEvent::DeviceInfo`].
    pub async fn read_info(&self, kind: DeviceInfoKind) -> Result<()> {
        self.run(PendingRequest::ReadInfo(kind)).await
    }

    /// Start (or restart) streaming.
    pub async fn start_stream(&self, options: StreamOptions) -> Result<()> {
        self.run(PendingRequest::SetStreamState(StreamState::Start(options)))
            .await
    }

    pub async fn stop_stream(&self) -> Result<()> {
        self.run(PendingRequest::SetStreamState(StreamState::Stop))
            .await
    }

    /// Send a mailbox command; its answer arrives as
    /// [`DriverEvent::CommandResponse`].
    pub async fn send_command(&self, command: MailboxCommand) -> Result<()> {
        self.run(PendingRequest::SendCommand(command)).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// `true` while a request is executing.
    pub fn is_busy(&self) -> bool {
        self.requests.is_busy()
    }
}

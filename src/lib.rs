//! # eeg-link
//!
//! Async host-side driver for wireless EEG headsets over Bluetooth Low
//! Energy: connection orchestration, the mailbox command protocol, and
//! reassembly of raw sensor frames into fixed-length packets.
//!
//! ## Supported hardware
//!
//! | Family | Name prefix | EEG ch | Index | Sample order | Audio sub-link |
//! |---|---|---|---|---|---|
//! | Alpha | `alpha_` | 2 | 2 bytes | big-endian | ✓ |
//! | Beta | `beta_` | 8 | 3 bytes | little-endian | ✗ |
//!
//! The family is detected from the advertised name; see
//! [`protocol::DeviceFamily`].
//!
//! ## Quick start
//!
//! ```no_run
//! use eeg_link::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (driver, mut events) = Driver::new(BleTransport::new().await?, DriverConfig::default());
//!     driver.connect().await?;
//!     driver.start_stream(StreamOptions::default()).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             DriverEvent::Packet(p) => println!("#{} ch0[0]={:+.2} µV", p.sequence, p.channels[0][0]),
//!             DriverEvent::StateChanged(ConnectionState::Idle) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`driver`] | [`driver::Driver`]: request submission, state view, event channel |
//! | [`orchestrator`] | Connection state machine and mailbox routing |
//! | [`serializer`] | Single-flight request executor with interrupt |
//! | [`supervisor`] | Streaming session: notification pump and drain worker |
//! | [`dispatch`] | Three-lane rotating work queue for raw frames |
//! | [`reassembly`] | Frame validation, gap fill, calibration and packetization |
//! | [`mailbox`] | Mailbox command/response codec |
//! | [`transport`] | The [`transport::Transport`] trait |
//! | [`ble`] | `btleplug` implementation of the transport |
//! | [`protocol`] | GATT UUIDs, family frame geometry, wire helpers |
//! | [`types`] | States, requests, packets and events |
//! | [`config`] | [`config::DriverConfig`] and step timeouts |
//! | [`error`] | Error types |

pub mod ble;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod mailbox;
pub mod orchestrator;
pub mod protocol;
pub mod reassembly;
pub mod serializer;
pub mod supervisor;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Driver ────────────────────────────────────────────────────────────────
    pub use crate::ble::BleTransport;
    pub use crate::config::{DriverConfig, StepTimeouts, StreamOverrides};
    pub use crate::driver::Driver;
    pub use crate::error::{DriverError, Result};
    pub use crate::transport::{ScanFilter, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::reassembly::{QualityChecker, StreamStats};
    pub use crate::types::{
        ConnectionState, DeviceDescriptor, DeviceInfo, DeviceInfoKind, DriverEvent, Packet,
        PendingRequest, StreamError, StreamOptions, StreamState,
    };

    // ── Mailbox ───────────────────────────────────────────────────────────────
    pub use crate::mailbox::{AudioLinkStatus, MailboxCommand, MailboxResponse};

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::protocol::DeviceFamily;
}

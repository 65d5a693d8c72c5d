//! Data-plane session: notification stream → dispatch ring → reassembler.
//!
//! While enabled, two tasks run:
//!
//! * the **pump** reads sensor-data notifications and dispatches each frame
//!   into the [`DispatchRing`], reporting frames shed by lane rotation;
//! * the **drain worker** owns the [`FrameReassembler`] (single writer),
//!   pops frames oldest-first and forwards packets and stream errors as
//!   [`DriverEvent`]s.
//!
//! Packets go into the bounded event channel with `send().await`: a consumer
//! that falls behind stalls the drain worker, the ring backs up and lane
//! rotation sheds the oldest unprocessed frames.  Memory stays bounded by the
//! channel capacity plus the ring.
//!
//! Disabling closes the ring (queued frames are discarded, the frame being
//! processed finishes), stops both tasks and reports the session's
//! [`StreamStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchRing;
use crate::reassembly::{FrameReassembler, StreamStats};
use crate::types::{DriverEvent, StreamError};

/// Lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Never enabled.
    Idle,
    Enabled,
    Disabled,
}

struct ActiveStream {
    ring: Arc<DispatchRing<Vec<u8>>>,
    stop: CancellationToken,
    pump: JoinHandle<()>,
    worker: JoinHandle<StreamStats>,
}

pub struct StreamingSupervisor {
    state: SupervisorState,
    active: Option<ActiveStream>,
}

impl StreamingSupervisor {
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == SupervisorState::Enabled
    }

    /// Start a session.  An already running session is disabled first, so
    /// every enable begins with fresh buffers, counters and index sentinel.
    pub async fn enable(
        &mut self,
        mut reassembler: FrameReassembler,
        frames: BoxStream<'static, Vec<u8>>,
        events: mpsc::Sender<DriverEvent>,
    ) {
        if self.is_enabled() {
            debug!("supervisor: restarting active stream");
            self.disable(&events).await;
        }
        reassembler.reset();

        let ring = Arc::new(DispatchRing::new());
        let shed = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();

        let pump = tokio::spawn(pump_frames(
            frames,
            Arc::clone(&ring),
            Arc::clone(&shed),
            events.clone(),
        ));
        let worker = tokio::spawn(drain_frames(
            reassembler,
            Arc::clone(&ring),
            shed,
            events,
            stop.clone(),
        ));

        self.active = Some(ActiveStream {
            ring,
            stop,
            pump,
            worker,
        });
        self.state = SupervisorState::Enabled;
        info!("supervisor: streaming enabled");
    }

    /// Stop the session and report its statistics.  Returns `None` when no
    /// session was running.
    pub async fn disable(&mut self, events: &mpsc::Sender<DriverEvent>) -> Option<StreamStats> {
        let active = self.active.take()?;
        self.state = SupervisorState::Disabled;

        active.stop.cancel();
        active.ring.close();
        active.pump.abort();
        let stats = match active.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("supervisor: drain worker ended abnormally: {e}");
                StreamStats::default()
            }
        };
        info!(
            "supervisor: streaming disabled after {} packets ({} frames, {} missing, {} shed)",
            stats.packets_emitted, stats.frames_received, stats.frames_missing, stats.frames_shed
        );
        let _ = events.send(DriverEvent::StreamStats(stats.clone())).await;
        let _ = events.send(DriverEvent::Streaming(false)).await;
        Some(stats)
    }
}

impl Default for StreamingSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamingSupervisor {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop.cancel();
            active.ring.close();
            active.pump.abort();
            active.worker.abort();
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn pump_frames(
    mut frames: BoxStream<'static, Vec<u8>>,
    ring: Arc<DispatchRing<Vec<u8>>>,
    shed: Arc<AtomicU64>,
    events: mpsc::Sender<DriverEvent>,
) {
    while let Some(frame) = frames.next().await {
        let dropped = ring.dispatch(frame);
        if dropped > 0 {
            shed.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!("supervisor: processing fell behind; shed {dropped} queued frame(s)");
            // The pump never waits on the consumer; the count is in the stats.
            let _ = events.try_send(DriverEvent::StreamError(StreamError::Shed { frames: dropped }));
        }
    }
    info!("supervisor: data notification stream ended");
    let _ = events
        .send(DriverEvent::StreamError(StreamError::NotificationsClosed))
        .await;
}

/// Hand `event` to the consumer, waiting for room unless the session is
/// stopping.  Returns `false` once stopped.
async fn deliver(
    events: &mpsc::Sender<DriverEvent>,
    stop: &CancellationToken,
    event: DriverEvent,
) -> bool {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => true,
        Err(TrySendError::Full(event)) => tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            _ = events.send(event) => true,
        },
    }
}

async fn drain_frames(
    mut reassembler: FrameReassembler,
    ring: Arc<DispatchRing<Vec<u8>>>,
    shed: Arc<AtomicU64>,
    events: mpsc::Sender<DriverEvent>,
    stop: CancellationToken,
) -> StreamStats {
    let mut frame_count: u64 = 0;
    'frames: while let Some(frame) = ring.next().await {
        frame_count += 1;
        if frame_count <= 3 || frame_count % 500 == 0 {
            debug!("supervisor: frame #{frame_count} len={}", frame.len());
        }
        let ingest = reassembler.ingest(&frame);
        let outgoing = ingest
            .errors
            .into_iter()
            .map(DriverEvent::StreamError)
            .chain(ingest.packets.into_iter().map(DriverEvent::Packet));
        for event in outgoing {
            if !deliver(&events, &stop, event).await {
                debug!("supervisor: stopped while the consumer was behind");
                break 'frames;
            }
        }
    }
    reassembler.record_shed(shed.load(Ordering::Relaxed) as usize);
    reassembler.stats().clone()
}

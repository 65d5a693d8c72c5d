//! Single-flight request executor.
//!
//! All control-plane work (connect, info reads, stream start/stop, mailbox
//! commands, disconnect) goes through one worker task that runs one
//! [`PendingRequest`] at a time.  Requests submitted while it is busy wait in
//! FIFO order; nothing is dropped.
//!
//! An interrupting disconnect is different: [`RequestSender::submit`] cancels
//! the in-flight request's [`CancellationToken`] immediately and the
//! disconnect jumps the queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DriverError, Result};
use crate::types::PendingRequest;

/// Runs requests on behalf of the worker.
pub trait RequestExecutor: Send + 'static {
    /// Execute one request.  `cancel` fires when an interrupting disconnect
    /// is submitted; the executor must then give up as soon as possible.
    fn execute(
        &mut self,
        request: PendingRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Outcome of one request.
#[derive(Debug)]
pub struct RequestReport {
    pub request: PendingRequest,
    pub started: Instant,
    pub finished: Instant,
    pub result: Result<()>,
}

// ── Interrupt flag ────────────────────────────────────────────────────────────

/// Shared interrupt flag.  Cancelled by an interrupting disconnect, re-armed
/// when that disconnect starts executing.
///
/// Read-only outside this module: the flag is raised only together with the
/// interrupting disconnect that tears the session down and re-arms it.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    fn interrupt(&self) {
        self.lock().cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn current(&self) -> CancellationToken {
        self.lock().clone()
    }

    fn rearm(&self) -> CancellationToken {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Submission ────────────────────────────────────────────────────────────────

struct Envelope {
    request: PendingRequest,
    reply: Option<oneshot::Sender<RequestReport>>,
}

/// Submission side of the serializer.  Cheap to clone.
#[derive(Clone)]
pub struct RequestSender {
    queue: mpsc::UnboundedSender<Envelope>,
    priority: mpsc::UnboundedSender<Envelope>,
    busy: Arc<AtomicBool>,
    interrupt: InterruptHandle,
}

impl RequestSender {
    /// Queue `request`; the receiver resolves once it has run.
    pub fn submit(&self, request: PendingRequest) -> Result<oneshot::Receiver<RequestReport>> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Envelope {
            request,
            reply: Some(reply),
        })?;
        Ok(rx)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let sent = if envelope.request.is_interrupt() {
            debug!("serializer: interrupt requested");
            self.interrupt.interrupt();
            self.priority.send(envelope)
        } else {
            self.queue.send(envelope)
        };
        sent.map_err(|_| DriverError::Closed)
    }

    /// Cancel the in-flight request and queue the interrupting disconnect
    /// ahead of everything else.
    pub fn interrupt(&self) -> Result<oneshot::Receiver<RequestReport>> {
        self.submit(PendingRequest::Disconnect { interrupted: true })
    }

    /// `true` while a request is executing.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    /// A handle that does not keep the worker alive, for tasks owned by the
    /// executor itself.
    pub fn downgrade(&self) -> WeakRequestSender {
        WeakRequestSender {
            queue: self.queue.downgrade(),
        }
    }
}

/// Non-owning submission handle; see [`RequestSender::downgrade`].
#[derive(Clone)]
pub struct WeakRequestSender {
    queue: mpsc::WeakUnboundedSender<Envelope>,
}

impl WeakRequestSender {
    /// Queue a non-interrupting request without waiting for its report.
    /// Returns `false` when the worker is gone.
    pub fn submit_detached(&self, request: PendingRequest) -> bool {
        debug_assert!(!request.is_interrupt());
        self.queue
            .upgrade()
            .map(|queue| queue.send(Envelope { request, reply: None }).is_ok())
            .unwrap_or(false)
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// Create the channels of a serializer without starting the worker, so the
/// executor can be handed a [`WeakRequestSender`] before it exists.
pub fn channel() -> (RequestSender, RequestReceiver) {
    let (queue, queue_rx) = mpsc::unbounded_channel();
    let (priority, priority_rx) = mpsc::unbounded_channel();
    let busy = Arc::new(AtomicBool::new(false));
    let interrupt = InterruptHandle::default();
    let sender = RequestSender {
        queue,
        priority,
        busy: Arc::clone(&busy),
        interrupt: interrupt.clone(),
    };
    let receiver = RequestReceiver {
        queue: queue_rx,
        priority: priority_rx,
        busy,
        interrupt,
    };
    (sender, receiver)
}

/// Worker side of [`channel`].
pub struct RequestReceiver {
    queue: mpsc::UnboundedReceiver<Envelope>,
    priority: mpsc::UnboundedReceiver<Envelope>,
    busy: Arc<AtomicBool>,
    interrupt: InterruptHandle,
}

impl RequestReceiver {
    /// Spawn the worker.  It exits once every [`RequestSender`] is dropped.
    pub fn spawn<E: RequestExecutor>(self, executor: E) -> JoinHandle<()> {
        tokio::spawn(self.run(executor))
    }

    async fn run<E: RequestExecutor>(mut self, mut executor: E) {
        loop {
            let envelope = tokio::select! {
                biased;
                Some(envelope) = self.priority.recv() => envelope,
                Some(envelope) = self.queue.recv() => envelope,
                else => break,
            };
            let cancel = if envelope.request.is_interrupt() {
                self.interrupt.rearm()
            } else {
                self.interrupt.current()
            };

            self.busy.store(true, Ordering::SeqCst);
            let started = Instant::now();
            debug!("serializer: executing {:?}", envelope.request);
            let result = executor.execute(envelope.request.clone(), cancel).await;
            let finished = Instant::now();
            self.busy.store(false, Ordering::SeqCst);

            if let Err(e) = &result {
                warn!("serializer: {:?} failed: {e}", envelope.request);
            }
            if let Some(reply) = envelope.reply {
                let _ = reply.send(RequestReport {
                    request: envelope.request,
                    started,
                    finished,
                    result,
                });
            }
        }
        debug!("serializer: all senders dropped; worker exiting");
    }
}

/// Create a serializer and start its worker.
pub fn spawn<E: RequestExecutor>(executor: E) -> (RequestSender, JoinHandle<()>) {
    let (sender, receiver) = channel();
    (sender, receiver.spawn(executor))
}

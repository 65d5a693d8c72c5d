//! Rotating three-lane work queue for the data plane.
//!
//! Each incoming frame is dispatched into the *current* lane.  After
//! [`DISPATCHES_PER_LANE`] dispatches the ring rotates to the next lane, and
//! whatever that lane still holds from its previous turn (frames queued but
//! never started) is discarded.  A consumer that falls more than two lanes
//! behind therefore loses its oldest backlog instead of growing memory
//! without bound.  Frames already popped by the consumer always finish.
//!
//! [`DispatchRing::next`] pops oldest-first across lanes, so a single drain
//! task sees frames in arrival order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Number of lanes in the ring.
pub const LANE_COUNT: usize = 3;

/// Dispatches into one lane before rotating to the next.
pub const DISPATCHES_PER_LANE: usize = 20;

struct Lanes<T> {
    lanes: [VecDeque<T>; LANE_COUNT],
    current: usize,
    dispatched: usize,
    closed: bool,
}

impl<T> Lanes<T> {
    /// Oldest-first lane order: the lanes after `current` were filled on
    /// earlier turns.
    fn pop_oldest(&mut self) -> Option<T> {
        (1..=LANE_COUNT)
            .map(|offset| (self.current + offset) % LANE_COUNT)
            .find_map(|lane| self.lanes[lane].pop_front())
    }
}

pub struct DispatchRing<T> {
    inner: Mutex<Lanes<T>>,
    notify: Notify,
}

impl<T> DispatchRing<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Lanes {
                lanes: Default::default(),
                current: 0,
                dispatched: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one item.  Returns how many stale items were discarded by a lane
    /// rotation (`0` in the common case).  Items dispatched after
    /// [`Self::close`] are dropped.
    pub fn dispatch(&self, item: T) -> usize {
        let shed = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            let mut shed = 0;
            if inner.dispatched == DISPATCHES_PER_LANE {
                inner.current = (inner.current + 1) % LANE_COUNT;
                inner.dispatched = 0;
                let current = inner.current;
                shed = inner.lanes[current].len();
                inner.lanes[current].clear();
            }
            let current = inner.current;
            inner.lanes[current].push_back(item);
            inner.dispatched += 1;
            shed
        };
        self.notify.notify_one();
        shed
    }

    /// Pop the oldest queued item without waiting.
    pub fn try_next(&self) -> Option<T> {
        self.lock().pop_oldest()
    }

    /// Wait for the oldest queued item.  Returns `None` once the ring is
    /// closed; anything still queued at that point is discarded.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(item) = inner.pop_oldest() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Items queued across all lanes.
    pub fn len(&self) -> usize {
        self.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work, drop the backlog and wake the consumer.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            for lane in &mut inner.lanes {
                lane.clear();
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl<T> Default for DispatchRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Ordered, bounded buffer of events awaiting acknowledgement
//!
//! Producers are the host's lifecycle threads (blocking, bounded by a
//! timeout); the single consumer is the connection manager's sender task
//! (async). An event leaves the queue only when the collector acknowledged
//! it, so a reconnect can resend everything from the oldest unacknowledged
//! event by rewinding the send cursor.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

use shared::{Event, SequencedEvent};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("queue full after waiting {0:?}")]
    QueueFull(Duration),

    #[error("queue closed")]
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    /// Unacknowledged events in sequence order
    events: VecDeque<SequencedEvent>,
    /// Number of leading `events` already handed to the sender
    in_flight: usize,
    next_sequence: u64,
    closed: bool,
}

/// Outbound event queue shared by producers and the sender
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    /// Producers wait here for room
    space: Condvar,
    /// The sender waits here for events
    available: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity.min(1024)),
                in_flight: 0,
                next_sequence: 0,
                closed: false,
            }),
            capacity: capacity.max(1),
            space: Condvar::new(),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event, assigning the next sequence number
    ///
    /// Blocks up to `timeout` while the queue is at capacity. Sequence numbers
    /// are assigned under the same lock as the append, so they are gap-free
    /// and match queue order even with concurrent producers.
    pub fn enqueue(&self, event: Event, timeout: Duration) -> Result<u64, EnqueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if inner.closed {
                return Err(EnqueueError::Closed);
            }
            if inner.events.len() < self.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EnqueueError::QueueFull(timeout));
            }
            inner = match self.space.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.events.push_back(SequencedEvent::new(sequence, event));
        drop(inner);

        self.available.notify_one();
        Ok(sequence)
    }

    /// Take up to `max` events that have not been handed out yet
    ///
    /// Waits while there is nothing to send. Returns an empty batch only once
    /// the queue is closed and every event has been handed out. Cancel safe:
    /// events are claimed only in the same poll that returns them.
    pub async fn next_batch(&self, max: usize) -> Vec<SequencedEvent> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.in_flight < inner.events.len() {
                    let start = inner.in_flight;
                    let end = inner.events.len().min(start + max.max(1));
                    let batch: Vec<SequencedEvent> = inner.events.range(start..end).cloned().collect();
                    inner.in_flight = end;
                    return batch;
                }
                if inner.closed {
                    return Vec::new();
                }
            }

            notified.await;
        }
    }

    /// Discard every handed-out event with `sequence <= up_to`; returns how many went
    ///
    /// Events the sender has not taken yet stay queued even if `up_to` covers them.
    pub fn acknowledge(&self, up_to: u64) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        while removed < inner.in_flight && inner.events.front().is_some_and(|front| front.sequence <= up_to) {
            inner.events.pop_front();
            removed += 1;
        }
        inner.in_flight = inner.in_flight.saturating_sub(removed);
        drop(inner);

        if removed > 0 {
            self.space.notify_all();
        }
        removed
    }

    /// Make every unacknowledged event eligible for sending again
    pub fn rewind(&self) {
        let mut inner = self.lock();
        inner.in_flight = 0;
        drop(inner);
        self.available.notify_one();
    }

    /// Refuse further events; pending ones can still be drained
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);

        self.space.notify_all();
        self.available.notify_one();
    }

    /// Close and throw away everything still pending; returns the count
    pub fn abandon(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let dropped = inner.events.len();
        inner.events.clear();
        inner.in_flight = 0;
        drop(inner);

        self.space.notify_all();
        self.available.notify_one();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Events not yet acknowledged
    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Closed and fully acknowledged
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.events.is_empty()
    }

    /// Oldest sequence number still awaiting acknowledgement
    pub fn oldest_unacknowledged(&self) -> Option<u64> {
        self.lock().events.front().map(|event| event.sequence)
    }

    /// Sequence number the next enqueued event will get
    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }
}

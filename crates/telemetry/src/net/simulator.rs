use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::stats::{Impairment, ImpairmentConfig};
use crate::error::{ConfigError, TransportError};

pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Scheduled<T> {
    pub send_at: Instant,
    pub seq: Option<u32>,
    pub item: T,
    order: u64,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.send_at == other.send_at && self.order == other.order
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .send_at
            .cmp(&self.send_at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Time-ordered holding area for delayed datagrams. Knows nothing about sockets; callers supply
/// the clock, so tests can drive it with synthetic instants.
#[derive(Debug)]
pub struct DelayQueue<T> {
    heap: BinaryHeap<Scheduled<T>>,
    next_order: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, send_at: Instant, seq: Option<u32>, item: T) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Scheduled {
            send_at,
            seq,
            item,
            order,
        });
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<Scheduled<T>> {
        if self.heap.peek()?.send_at <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    pub fn drain_due(&mut self, now: Instant) -> Vec<Scheduled<T>> {
        let mut due = Vec::new();
        while let Some(entry) = self.pop_due(now) {
            due.push(entry);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug)]
pub struct Outgoing {
    pub socket: Arc<UdpSocket>,
    pub dest: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ImpairmentStats {
    pub submitted: u64,
    pub dropped: u64,
    pub sent_immediately: u64,
    pub delayed: u64,
    pub dispatched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    sent_immediately: AtomicU64,
    delayed: AtomicU64,
    dispatched: AtomicU64,
}

/// Process-wide impairment stage shared by every session's outbound traffic.
///
/// Dropped packets never reach the wire. Delayed packets sit in a [`DelayQueue`] until a single
/// background dispatcher, spawned on the first delayed packet, sends them.
#[derive(Debug)]
pub struct ImpairmentScheduler {
    config: ImpairmentConfig,
    queue: Arc<Mutex<DelayQueue<Outgoing>>>,
    rng: Mutex<StdRng>,
    dispatcher_started: AtomicBool,
    counters: Arc<Counters>,
}

impl ImpairmentScheduler {
    pub fn new(config: ImpairmentConfig) -> Result<Self, ConfigError> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: ImpairmentConfig, rng: StdRng) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            queue: Arc::new(Mutex::new(DelayQueue::new())),
            rng: Mutex::new(rng),
            dispatcher_started: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn config(&self) -> &ImpairmentConfig {
        &self.config
    }

    /// Applies the configured impairment to one datagram. `SendNow` packets are sent before this
    /// returns; `Delay` packets are handed to the dispatcher.
    pub async fn submit(
        &self,
        socket: &Arc<UdpSocket>,
        dest: SocketAddr,
        bytes: Vec<u8>,
        seq: Option<u32>,
    ) -> Result<Impairment, TransportError> {
        self.counters.submitted.fetch_add(1, AtomicOrdering::Relaxed);
        let decision = self.config.decide(&mut *self.rng.lock());

        match decision {
            Impairment::Drop => {
                self.counters.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                log::trace!("impairment dropped packet seq={:?} to {}", seq, dest);
            }
            Impairment::SendNow => {
                socket
                    .send_to(&bytes, dest)
                    .await
                    .map_err(|source| TransportError::SendFailed { addr: dest, source })?;
                self.counters
                    .sent_immediately
                    .fetch_add(1, AtomicOrdering::Relaxed);
            }
            Impairment::Delay(delay) => {
                let outgoing = Outgoing {
                    socket: Arc::clone(socket),
                    dest,
                    bytes,
                };
                self.queue.lock().push(Instant::now() + delay, seq, outgoing);
                self.counters.delayed.fetch_add(1, AtomicOrdering::Relaxed);
                self.ensure_dispatcher();
            }
        }

        Ok(decision)
    }

    fn ensure_dispatcher(&self) {
        if self.dispatcher_started.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let queue = Arc::downgrade(&self.queue);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(dispatch_loop(queue, counters, DEFAULT_DISPATCH_INTERVAL));
        log::debug!("impairment dispatcher started");
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Waits until every delayed packet has been dispatched, or the timeout passes.
    /// Returns the number still queued.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending();
            if pending == 0 || Instant::now() >= deadline {
                return pending;
            }
            tokio::time::sleep(DEFAULT_DISPATCH_INTERVAL).await;
        }
    }

    pub fn stats(&self) -> ImpairmentStats {
        ImpairmentStats {
            submitted: self.counters.submitted.load(AtomicOrdering::Relaxed),
            dropped: self.counters.dropped.load(AtomicOrdering::Relaxed),
            sent_immediately: self.counters.sent_immediately.load(AtomicOrdering::Relaxed),
            delayed: self.counters.delayed.load(AtomicOrdering::Relaxed),
            dispatched: self.counters.dispatched.load(AtomicOrdering::Relaxed),
        }
    }
}

async fn dispatch_loop(
    queue: Weak<Mutex<DelayQueue<Outgoing>>>,
    counters: Arc<Counters>,
    interval: Duration,
) {
    // Exits once the owning scheduler is dropped.
    while let Some(shared) = queue.upgrade() {
        let due = shared.lock().drain_due(Instant::now());
        drop(shared);

        for entry in due {
            let Outgoing { socket, dest, bytes } = entry.item;
            match socket.send_to(&bytes, dest).await {
                Ok(_) => {
                    counters.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(e) => {
                    log::warn!("delayed send of seq={:?} to {} failed: {}", entry.seq, dest, e);
                }
            }
        }

        tokio::time::sleep(interval).await;
    }
}

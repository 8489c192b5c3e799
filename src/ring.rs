use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{InFlight, Job};
use crate::metrics;
use crate::notify::NotifyPolicy;

/// Bounds-checked ring index. Obtained from
/// [`Engine::select_ring`](crate::Engine::select_ring) or
/// [`Engine::ring_id`](crate::Engine::ring_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId(u8);

impl RingId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Result of queueing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued behind at least `backlog_threshold` other requests.
    Backlogged,
}

/// Per-ring queue and in-flight state.
///
/// The queue and in-flight locks guard list manipulation only. The
/// dispatch lock keeps one dispatcher per ring; the harvest lock
/// serializes result retrieval between the notified drain and pollers.
pub(crate) struct Ring {
    id: RingId,
    queue: Mutex<VecDeque<Box<dyn Job>>>,
    in_flight: Mutex<VecDeque<InFlight>>,
    submitted: AtomicU64,
    backlog_threshold: usize,
    pub(crate) dispatch_lock: Mutex<()>,
    pub(crate) harvest_lock: Mutex<()>,
    pub(crate) policy: Mutex<NotifyPolicy>,
}

impl Ring {
    fn new(id: RingId, config: &Config) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
            submitted: AtomicU64::new(0),
            backlog_threshold: config.backlog_threshold,
            dispatch_lock: Mutex::new(()),
            harvest_lock: Mutex::new(()),
            policy: Mutex::new(NotifyPolicy::new(&config.notify)),
        }
    }

    pub(crate) fn id(&self) -> RingId {
        self.id
    }

    pub(crate) fn enqueue(&self, job: Box<dyn Job>) -> Enqueued {
        let before = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.push_back(job);
            before
        };
        metrics::REQUESTS_QUEUED.increment();
        if before >= self.backlog_threshold {
            metrics::REQUESTS_BACKLOGGED.increment();
            Enqueued::Backlogged
        } else {
            Enqueued::Queued
        }
    }

    pub(crate) fn pop_job(&self) -> Option<Box<dyn Job>> {
        let job = self.queue.lock().pop_front();
        if job.is_some() {
            metrics::REQUESTS_QUEUED.decrement();
        }
        job
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn take_queue(&self) -> Vec<Box<dyn Job>> {
        let jobs: Vec<_> = self.queue.lock().drain(..).collect();
        metrics::REQUESTS_QUEUED.sub(jobs.len() as i64);
        jobs
    }

    pub(crate) fn push_in_flight(&self, entry: InFlight) {
        self.in_flight.lock().push_back(entry);
        metrics::REQUESTS_IN_FLIGHT.increment();
    }

    /// Remove the entry with command id `id`. Results normally arrive in
    /// submission order, so the head is checked first.
    pub(crate) fn withdraw(&self, id: u64) -> Option<InFlight> {
        let entry = {
            let mut list = self.in_flight.lock();
            if list.front().is_some_and(|e| e.id == id) {
                list.pop_front()
            } else {
                let pos = list.iter().position(|e| e.id == id)?;
                list.remove(pos)
            }
        };
        if entry.is_some() {
            metrics::REQUESTS_IN_FLIGHT.decrement();
        }
        entry
    }

    pub(crate) fn take_in_flight(&self) -> Vec<InFlight> {
        let entries: Vec<_> = self.in_flight.lock().drain(..).collect();
        metrics::REQUESTS_IN_FLIGHT.sub(entries.len() as i64);
        entries
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Count a submission; returns the ring's total including it.
    pub(crate) fn record_submit(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

/// The fixed set of rings an engine drives.
pub(crate) struct RingSet {
    rings: Box<[Ring]>,
    next: AtomicUsize,
}

impl RingSet {
    pub(crate) fn new(config: &Config) -> Self {
        let rings = (0..config.rings)
            .map(|i| Ring::new(RingId(i as u8), config))
            .collect();
        Self {
            rings,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rings.len()
    }

    pub(crate) fn id(&self, index: usize) -> Result<RingId> {
        if index < self.rings.len() {
            Ok(RingId(index as u8))
        } else {
            Err(Error::InvalidRing)
        }
    }

    /// Round-robin ring choice.
    pub(crate) fn select(&self) -> RingId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RingId((n % self.rings.len()) as u8)
    }

    pub(crate) fn get(&self, id: RingId) -> Result<&Ring> {
        self.rings.get(id.index()).ok_or(Error::InvalidRing)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Ring> {
        self.rings.iter()
    }
}

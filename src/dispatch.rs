//! Per-ring dispatcher.
//!
//! Each ring has one dispatcher thread woken over a crossbeam channel. It
//! drains the ring's queue into the hardware, runs the notified drain when
//! the packet engine reports results, and fires the notification timer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, trace, warn};

use crate::completion::Classify;
use crate::counter::bind_ring_shard;
use crate::ddk::Notifier;
use crate::engine::Shared;
use crate::error::Error;
use crate::harvest;
use crate::job::{InFlight, Job, Prepared, Waiter};
use crate::metrics;
use crate::ring::RingId;

/// Message to a ring's dispatcher thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    /// New requests were queued.
    Dispatch,
    /// The packet engine has results for the ring.
    ResultsReady,
    Shutdown,
}

/// Body of a ring's dispatcher thread.
pub(crate) fn run_ring(shared: Arc<Shared>, ring: RingId, rx: Receiver<Wakeup>) {
    bind_ring_shard(ring.index());
    let Ok(state) = shared.rings.get(ring) else {
        return;
    };
    debug!(ring = ring.index(), "dispatcher started");
    loop {
        let deadline = state.policy.lock().deadline();
        let msg = match deadline {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(Wakeup::Dispatch) => {
                dispatch(&shared, ring);
            }
            Ok(Wakeup::ResultsReady) => {
                harvest::drain(&shared, ring);
            }
            Ok(Wakeup::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let expired = state.policy.lock().expire(Instant::now());
                if expired {
                    arm_notify(&shared, ring);
                }
            }
        }
    }
    debug!(ring = ring.index(), "dispatcher stopped");
}

/// Drain the ring's queue into the hardware. Returns the number of
/// requests taken off the queue.
pub(crate) fn dispatch(shared: &Shared, ring: RingId) -> usize {
    let Ok(state) = shared.rings.get(ring) else {
        return 0;
    };
    let _single = state.dispatch_lock.lock();
    let mut count = 0;
    while let Some(job) = state.pop_job() {
        submit_job(shared, ring, job);
        count += 1;
    }
    count
}

/// Run one queued request through the submission path.
///
/// A request that panics while being built is failed on its own so the
/// ring keeps running.
fn submit_job(shared: &Shared, ring: RingId, mut job: Box<dyn Job>) {
    let sent = panic::catch_unwind(AssertUnwindSafe(|| job.send(shared, ring)));
    let prepared = match sent {
        Ok(Ok(prepared)) => prepared,
        Ok(Err(e)) => {
            metrics::REQUESTS_SEND_FAILED.increment();
            debug!(ring = ring.index(), error = %e, "request failed before submission");
            job.fail(e);
            return;
        }
        Err(_) => {
            metrics::REQUESTS_SEND_FAILED.increment();
            error!(ring = ring.index(), "request panicked before submission");
            job.fail(Error::build("request could not be built"));
            return;
        }
    };
    match submit_prepared(shared, ring, prepared, Waiter::Job(job), Classify::Ring) {
        Ok(_) => {
            let Ok(state) = shared.rings.get(ring) else {
                return;
            };
            let submitted = state.record_submit();
            let arm_now = state.policy.lock().on_submit(submitted, Instant::now());
            if arm_now {
                arm_notify(shared, ring);
            }
        }
        Err((waiter, e)) => waiter.fail(e),
    }
}

/// Record the in-flight entry, then hand the command to the hardware. A
/// rejected command is withdrawn and its waiter handed back.
pub(crate) fn submit_prepared(
    shared: &Shared,
    ring: RingId,
    prepared: Prepared,
    waiter: Waiter,
    classify: Classify,
) -> Result<u64, (Waiter, Error)> {
    let state = match shared.rings.get(ring) {
        Ok(state) => state,
        Err(e) => return Err((waiter, e)),
    };
    let id = shared.next_command_id();
    let mut command = prepared.command;
    command.id = id;
    state.push_in_flight(InFlight {
        id,
        waiter,
        resources: prepared.resources,
        classify,
    });

    let err = match shared.services.packet.submit(ring.index(), &[command]) {
        Ok(1) => None,
        Ok(_) => Some(Error::Submit("command not accepted".into())),
        Err(e) => Some(Error::submit("packet engine", e)),
    };
    let Some(err) = err else {
        metrics::REQUESTS_SUBMITTED.increment();
        trace!(ring = ring.index(), id, "command submitted");
        return Ok(id);
    };

    metrics::REQUESTS_REJECTED.increment();
    warn!(ring = ring.index(), id, error = %err, "command rejected");
    match state.withdraw(id) {
        Some(entry) => Err((entry.waiter, err)),
        // Only an accepted command can have been harvested.
        None => Ok(id),
    }
}

/// Register the ring's one-shot completion notification.
pub(crate) fn arm_notify(shared: &Shared, ring: RingId) {
    let Some(tx) = shared.waker(ring) else {
        return;
    };
    let notifier = Notifier::new(ring.index(), tx);
    match shared.services.packet.register_notify(ring.index(), notifier) {
        Ok(()) => metrics::NOTIFY_ARMED.increment(),
        Err(e) => warn!(ring = ring.index(), error = %e, "notification registration failed"),
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::ConfigBuilder;
    use crate::engine::Engine;
    use crate::job::Harvest;
    use crate::sim::Sim;
    use crossbeam_channel::Sender;

    struct Exploding(Sender<Error>);

    impl Job for Exploding {
        fn send(&mut self, _shared: &Shared, _ring: RingId) -> crate::Result<Prepared> {
            panic!("malformed request");
        }

        fn finish(self: Box<Self>, _shared: &Shared, _harvest: Harvest) {
            unreachable!("never submitted");
        }

        fn fail(self: Box<Self>, err: Error) {
            let _ = self.0.send(err);
        }
    }

    #[test]
    fn panicking_request_fails_alone() {
        let sim = Sim::new(1);
        let config = ConfigBuilder::new()
            .rings(1)
            .spawn_workers(false)
            .build()
            .unwrap();
        let engine = Engine::start(config, sim.services()).unwrap();
        let ring = engine.ring_id(0).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        engine.enqueue(ring, Box::new(Exploding(tx.clone()))).unwrap();
        engine.enqueue(ring, Box::new(Exploding(tx))).unwrap();
        assert_eq!(dispatch(engine.shared(), ring), 2);
        assert!(matches!(rx.try_recv(), Ok(Error::Build(_))));
        assert!(matches!(rx.try_recv(), Ok(Error::Build(_))));
        assert_eq!(engine.queued(ring).unwrap(), 0);
        assert_eq!(engine.in_flight(ring).unwrap(), 0);
    }
}

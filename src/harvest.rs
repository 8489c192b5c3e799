//! Completion harvesting.
//!
//! Results come back through two paths that share one routine: the
//! notified drain on the dispatcher thread, and bounded polling on a
//! caller's thread. The ring's harvest lock covers "poll one descriptor and
//! take its in-flight entry", so each entry is completed at most once.

use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, warn};

use crate::completion::{Classify, Outcome, OutputToken};
use crate::dispatch::{arm_notify, submit_prepared};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::job::{Harvest, InFlight, Prepared, Waiter};
use crate::metrics;
use crate::ring::RingId;

/// Poll the packet engine once and complete the matching entry. Returns
/// false when no result was ready.
pub(crate) fn harvest_one(shared: &Shared, ring: RingId) -> Result<bool> {
    let state = shared.rings.get(ring)?;
    let (entry, token) = {
        let _serial = state.harvest_lock.lock();
        let rd = match shared.services.packet.poll(ring.index()) {
            Ok(Some(rd)) => rd,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(ring = ring.index(), error = %e, "result poll failed");
                return Ok(false);
            }
        };
        let token = OutputToken::from_descriptor(&rd);
        match state.withdraw(token.app_id) {
            Some(entry) => (entry, token),
            None => {
                metrics::RESULTS_UNMATCHED.increment();
                warn!(ring = ring.index(), id = token.app_id, "result without in-flight entry");
                return Ok(true);
            }
        }
    };
    complete(shared, entry, token);
    Ok(true)
}

fn complete(shared: &Shared, entry: InFlight, token: OutputToken) {
    let InFlight {
        waiter,
        resources,
        classify,
        ..
    } = entry;
    let mut outcome = classify.apply(token.error_code);
    let output = match &resources.dst {
        Some(dst) => match dst.read_all() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id = token.app_id, error = %e, "destination read failed");
                outcome = Outcome::HardwareFault(token.error_code);
                Vec::new()
            }
        },
        None => Vec::new(),
    };
    metrics::RESULTS_COMPLETED.increment();
    match outcome {
        Outcome::Success => {}
        Outcome::IntegrityFailure => metrics::INTEGRITY_FAILURES.increment(),
        Outcome::HardwareFault(code) => {
            metrics::HARDWARE_FAULTS.increment();
            debug!(id = token.app_id, code, "result carries an error code");
        }
    }
    waiter.deliver(
        shared,
        Harvest {
            outcome,
            output,
            token,
        },
    );
    drop(resources);
}

/// Notified drain: harvest until the in-flight list is empty. When the
/// hardware has nothing ready while entries remain, re-arm notification
/// and return.
pub(crate) fn drain(shared: &Shared, ring: RingId) -> usize {
    let Ok(state) = shared.rings.get(ring) else {
        return 0;
    };
    let mut harvested = 0;
    while state.in_flight() > 0 {
        match harvest_one(shared, ring) {
            Ok(true) => harvested += 1,
            Ok(false) | Err(_) => {
                arm_notify(shared, ring);
                break;
            }
        }
    }
    harvested
}

/// Bounded polling for any one result of the ring. Returns false when
/// nothing is in flight.
pub(crate) fn harvest_polled(shared: &Shared, ring: RingId) -> Result<bool> {
    let state = shared.rings.get(ring)?;
    let poll = &shared.config.poll;
    for attempt in 0..poll.retries {
        if state.in_flight() == 0 {
            return Ok(false);
        }
        if harvest_one(shared, ring)? {
            return Ok(true);
        }
        if attempt + 1 < poll.retries {
            thread::sleep(poll.delay);
        }
    }
    metrics::POLL_TIMEOUTS.increment();
    Err(Error::Timeout)
}

/// Submit a command and poll for its own result on the calling thread.
///
/// Results of other entries seen while polling are completed normally; if
/// the notified drain takes this command's result first, it is handed over
/// through the waiter channel.
pub(crate) fn poll_sync(shared: &Shared, ring: RingId, prepared: Prepared) -> Result<Harvest> {
    let (tx, rx) = bounded(1);
    let id = submit_prepared(shared, ring, prepared, Waiter::Sync(tx), Classify::Lookaside)
        .map_err(|(_, e)| e)?;

    let poll = &shared.config.poll;
    for attempt in 0..poll.retries {
        loop {
            if let Ok(harvest) = rx.try_recv() {
                return Ok(harvest);
            }
            if !harvest_one(shared, ring)? {
                break;
            }
        }
        if let Ok(harvest) = rx.try_recv() {
            return Ok(harvest);
        }
        if attempt + 1 < poll.retries {
            thread::sleep(poll.delay);
        }
    }

    // Give up. The command stays in flight and its buffers are released
    // when its result is harvested; the result itself is discarded.
    if let Ok(harvest) = rx.try_recv() {
        return Ok(harvest);
    }
    metrics::POLL_TIMEOUTS.increment();
    warn!(ring = ring.index(), id, "polled command timed out");
    Err(Error::Timeout)
}

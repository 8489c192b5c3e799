//! Work items moving through a ring.
//!
//! A [`Job`] is what producers queue: the dispatcher asks it to build its
//! hardware command ([`Job::send`]), and the harvester hands it the result
//! ([`Job::finish`]). Between the two, the [`InFlight`] record owns the
//! command's transient DMA buffers and keeps the SA alive.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::completion::{Classify, Outcome, OutputToken};
use crate::ddk::Command;
use crate::dma::DmaBuffer;
use crate::engine::Shared;
use crate::engine_data::{EngineData, SaRecord};
use crate::error::{Error, Result};
use crate::ring::RingId;

/// A classified hardware result with the destination contents.
#[derive(Debug)]
pub(crate) struct Harvest {
    pub(crate) outcome: Outcome,
    pub(crate) output: Vec<u8>,
    pub(crate) token: OutputToken,
}

impl Harvest {
    /// The destination bytes, or the error the result was classified as.
    pub(crate) fn into_output(self) -> Result<Vec<u8>> {
        self.outcome.into_result()?;
        Ok(self.output)
    }
}

pub(crate) trait Job: Send {
    /// Build the hardware command. Anything allocated is returned inside
    /// [`Prepared`]; on error everything allocated so far is released.
    fn send(&mut self, shared: &Shared, ring: RingId) -> Result<Prepared>;

    /// Deliver a harvested result.
    fn finish(self: Box<Self>, shared: &Shared, harvest: Harvest);

    /// Complete without reaching the hardware.
    fn fail(self: Box<Self>, err: Error);
}

/// A command ready for submission plus the buffers it references.
pub(crate) struct Prepared {
    pub(crate) command: Command,
    pub(crate) resources: Resources,
}

/// Buffers an in-flight command references. Dropped after the result has
/// been delivered, in declaration order.
#[derive(Default)]
pub(crate) struct Resources {
    pub(crate) token: Option<DmaBuffer>,
    pub(crate) src: Option<DmaBuffer>,
    pub(crate) dst: Option<DmaBuffer>,
    pub(crate) engine_data: Option<Arc<EngineData>>,
    /// SA built for this command alone (hash steps, precompute).
    pub(crate) sa: Option<SaRecord>,
}

/// Who receives a harvested result.
pub(crate) enum Waiter {
    Job(Box<dyn Job>),
    /// A caller polling synchronously.
    Sync(Sender<Harvest>),
}

impl Waiter {
    pub(crate) fn deliver(self, shared: &Shared, harvest: Harvest) {
        match self {
            Waiter::Job(job) => job.finish(shared, harvest),
            Waiter::Sync(tx) => {
                // The poller may have given up already.
                let _ = tx.send(harvest);
            }
        }
    }

    pub(crate) fn fail(self, err: Error) {
        match self {
            Waiter::Job(job) => job.fail(err),
            Waiter::Sync(_) => {}
        }
    }
}

/// An entry of a ring's in-flight list.
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) waiter: Waiter,
    pub(crate) resources: Resources,
    pub(crate) classify: Classify,
}

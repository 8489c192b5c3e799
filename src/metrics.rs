//! cryptoline pipeline metrics.
//!
//! Ring-sharded counters for requests, completions, failures, SA lifecycle
//! and offload installs, plus gauges for queue and in-flight depth.

use crate::counter::{Counter, CounterGroup};
use metriken::{Gauge, metric};

static REQ: CounterGroup = CounterGroup::new();
static RESULT: CounterGroup = CounterGroup::new();
static RESOURCE: CounterGroup = CounterGroup::new();
static OFFLOAD: CounterGroup = CounterGroup::new();

/// Counter slot indices for request metrics.
pub mod req {
    pub const SUBMITTED: usize = 0;
    pub const BACKLOGGED: usize = 1;
    pub const REJECTED: usize = 2;
    pub const SEND_FAILED: usize = 3;
}

/// Counter slot indices for result metrics.
pub mod result {
    pub const COMPLETED: usize = 0;
    pub const INTEGRITY_FAILURES: usize = 1;
    pub const HARDWARE_FAULTS: usize = 2;
    pub const POLL_TIMEOUTS: usize = 3;
    pub const UNMATCHED: usize = 4;
    pub const NOTIFY_ARMED: usize = 5;
}

/// Counter slot indices for hardware resource metrics.
pub mod resource {
    pub const SA_BUILT: usize = 0;
    pub const SA_RELEASED: usize = 1;
    pub const BUILD_FAILURES: usize = 2;
}

/// Counter slot indices for offload metrics.
pub mod offload {
    pub const IPSEC_INSTALLED: usize = 0;
    pub const IPSEC_REMOVED: usize = 1;
    pub const DTLS_INSTALLED: usize = 2;
    pub const DTLS_REMOVED: usize = 3;
    pub const INSTALL_FAILURES: usize = 4;
}

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "cryptoline/requests/submitted",
    description = "Commands accepted by the packet engine"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new(&REQ, req::SUBMITTED);

#[metric(
    name = "cryptoline/requests/backlogged",
    description = "Requests queued past the backlog threshold"
)]
pub static REQUESTS_BACKLOGGED: Counter = Counter::new(&REQ, req::BACKLOGGED);

#[metric(
    name = "cryptoline/requests/rejected",
    description = "Commands rejected by the packet engine"
)]
pub static REQUESTS_REJECTED: Counter = Counter::new(&REQ, req::REJECTED);

#[metric(
    name = "cryptoline/requests/send_failed",
    description = "Requests failed before reaching the hardware"
)]
pub static REQUESTS_SEND_FAILED: Counter = Counter::new(&REQ, req::SEND_FAILED);

#[metric(
    name = "cryptoline/requests/queued",
    description = "Requests waiting in ring queues"
)]
pub static REQUESTS_QUEUED: Gauge = Gauge::new();

#[metric(
    name = "cryptoline/requests/in_flight",
    description = "Commands submitted and not yet harvested"
)]
pub static REQUESTS_IN_FLIGHT: Gauge = Gauge::new();

// ── Results ──────────────────────────────────────────────────────

#[metric(
    name = "cryptoline/results/completed",
    description = "Results harvested"
)]
pub static RESULTS_COMPLETED: Counter = Counter::new(&RESULT, result::COMPLETED);

#[metric(
    name = "cryptoline/results/integrity_failures",
    description = "Results failing the ICV check"
)]
pub static INTEGRITY_FAILURES: Counter = Counter::new(&RESULT, result::INTEGRITY_FAILURES);

#[metric(
    name = "cryptoline/results/hardware_faults",
    description = "Results carrying an unexpected error code"
)]
pub static HARDWARE_FAULTS: Counter = Counter::new(&RESULT, result::HARDWARE_FAULTS);

#[metric(
    name = "cryptoline/results/poll_timeouts",
    description = "Polled retrievals that ran out of attempts"
)]
pub static POLL_TIMEOUTS: Counter = Counter::new(&RESULT, result::POLL_TIMEOUTS);

#[metric(
    name = "cryptoline/results/unmatched",
    description = "Result descriptors with no matching in-flight entry"
)]
pub static RESULTS_UNMATCHED: Counter = Counter::new(&RESULT, result::UNMATCHED);

#[metric(
    name = "cryptoline/results/notify_armed",
    description = "One-shot completion notifications registered"
)]
pub static NOTIFY_ARMED: Counter = Counter::new(&RESULT, result::NOTIFY_ARMED);

// ── Hardware resources ───────────────────────────────────────────

#[metric(name = "cryptoline/sa/built", description = "SA records built and registered")]
pub static SA_BUILT: Counter = Counter::new(&RESOURCE, resource::SA_BUILT);

#[metric(name = "cryptoline/sa/released", description = "SA records unregistered and released")]
pub static SA_RELEASED: Counter = Counter::new(&RESOURCE, resource::SA_RELEASED);

#[metric(
    name = "cryptoline/sa/build_failures",
    description = "SA or token context builds that failed"
)]
pub static SA_BUILD_FAILURES: Counter = Counter::new(&RESOURCE, resource::BUILD_FAILURES);

// ── Offload ──────────────────────────────────────────────────────

#[metric(
    name = "cryptoline/offload/ipsec_installed",
    description = "IPsec associations installed"
)]
pub static IPSEC_INSTALLED: Counter = Counter::new(&OFFLOAD, offload::IPSEC_INSTALLED);

#[metric(
    name = "cryptoline/offload/ipsec_removed",
    description = "IPsec associations torn down"
)]
pub static IPSEC_REMOVED: Counter = Counter::new(&OFFLOAD, offload::IPSEC_REMOVED);

#[metric(
    name = "cryptoline/offload/dtls_installed",
    description = "DTLS tunnels installed"
)]
pub static DTLS_INSTALLED: Counter = Counter::new(&OFFLOAD, offload::DTLS_INSTALLED);

#[metric(
    name = "cryptoline/offload/dtls_removed",
    description = "DTLS tunnels torn down"
)]
pub static DTLS_REMOVED: Counter = Counter::new(&OFFLOAD, offload::DTLS_REMOVED);

#[metric(
    name = "cryptoline/offload/install_failures",
    description = "Offload installs rolled back"
)]
pub static OFFLOAD_INSTALL_FAILURES: Counter = Counter::new(&OFFLOAD, offload::INSTALL_FAILURES);

//! Top-level engine.
//!
//! Owns the driver services, the rings and their dispatcher threads, and
//! the offload tables. Every public operation of the crate goes through
//! [`Engine`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::context::CipherContext;
use crate::ddk::Services;
use crate::dispatch::{self, Wakeup};
use crate::error::{Error, Result};
use crate::harvest;
use crate::hash::{HashContext, HashSession};
use crate::job::Job;
use crate::metrics;
use crate::offload::dtls::{self, DtlsParams, TunnelId, TunnelTable};
use crate::offload::ipsec::{self, AssocHandle, AssocTable, OffloadState, XfrmState};
use crate::request::{CipherOutput, CipherRequest, Ticket};
use crate::ring::{Enqueued, Ring, RingId, RingSet};
use crate::submit::CipherJob;

/// State shared between the engine handle and its dispatcher threads.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) services: Services,
    pub(crate) rings: RingSet,
    wakers: Vec<Sender<Wakeup>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    pub(crate) ipsec: Mutex<AssocTable>,
    pub(crate) dtls: TunnelTable,
}

impl Shared {
    /// Application id of the next command. Never zero.
    pub(crate) fn next_command_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Channel to the ring's dispatcher thread.
    pub(crate) fn waker(&self, ring: RingId) -> Option<Sender<Wakeup>> {
        self.wakers.get(ring.index()).cloned()
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queue a job and wake the ring's dispatcher. A refused job is failed
    /// before this returns.
    pub(crate) fn enqueue(&self, ring: RingId, job: Box<dyn Job>) -> Result<Enqueued> {
        let state = match self.rings.get(ring) {
            Ok(state) => state,
            Err(e) => {
                job.fail(e.clone());
                return Err(e);
            }
        };
        let enqueued = state.enqueue(job);
        // Checked after the push: shutdown may have emptied the queue
        // between an earlier check and the push.
        if self.is_shut_down() {
            fail_queued(state);
            return Err(Error::Shutdown);
        }
        if let Some(tx) = self.waker(ring) {
            // No receiver when dispatch is driven manually.
            let _ = tx.send(Wakeup::Dispatch);
        }
        Ok(enqueued)
    }
}

/// Fail every job still queued on `ring`.
fn fail_queued(ring: &Ring) -> usize {
    let jobs = ring.take_queue();
    let failed = jobs.len();
    for job in jobs {
        job.fail(Error::Shutdown);
    }
    failed
}

/// The crypto offload engine.
///
/// # Examples
///
/// ```rust
/// use cryptoline::sim::Sim;
/// use cryptoline::{CipherAlg, CipherContext, CipherMode, CipherRequest, CipherSpec, Config, Engine};
///
/// let sim = Sim::new(4);
/// let engine = Engine::start(Config::default(), sim.services())?;
/// let ctx = CipherContext::new(CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc))?;
/// engine.set_key(&ctx, &[0x2b; 16])?;
/// let ticket = engine.submit(&ctx, CipherRequest::encrypt(&[0; 16], vec![0u8; 64]))?;
/// assert_eq!(ticket.wait()?.data.len(), 64);
/// # Ok::<(), cryptoline::Error>(())
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config`, build the rings and start one dispatcher thread
    /// per ring (unless `spawn_workers` is off).
    pub fn start(config: Config, services: Services) -> Result<Self> {
        config.validate()?;
        let available = services.packet.ring_count();
        if config.rings > available {
            return Err(Error::Config(format!(
                "{} rings configured, packet engine has {available}",
                config.rings
            )));
        }

        let mut wakers = Vec::with_capacity(config.rings);
        let mut receivers = Vec::with_capacity(config.rings);
        for _ in 0..config.rings {
            let (tx, rx) = unbounded();
            wakers.push(tx);
            receivers.push(rx);
        }
        let shared = Arc::new(Shared {
            rings: RingSet::new(&config),
            dtls: TunnelTable::new(config.max_tunnels),
            ipsec: Mutex::new(AssocTable::default()),
            wakers,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            services,
            config,
        });

        let engine = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        };
        if shared.config.spawn_workers {
            for (index, rx) in receivers.into_iter().enumerate() {
                let ring = shared.rings.id(index)?;
                let worker_shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(format!("cryptoline-ring-{index}"))
                    .spawn(move || dispatch::run_ring(worker_shared, ring, rx))
                    .map_err(|e| Error::Alloc(format!("dispatcher thread: {e}")))?;
                engine.workers.lock().push(handle);
            }
        }
        info!(
            rings = shared.config.rings,
            workers = shared.config.spawn_workers,
            "engine started"
        );
        Ok(engine)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn ring_count(&self) -> usize {
        self.shared.rings.len()
    }

    /// Next ring in round-robin order.
    pub fn select_ring(&self) -> RingId {
        self.shared.rings.select()
    }

    pub fn ring_id(&self, index: usize) -> Result<RingId> {
        self.shared.rings.id(index)
    }

    pub(crate) fn enqueue(&self, ring: RingId, job: Box<dyn Job>) -> Result<Enqueued> {
        self.shared.enqueue(ring, job)
    }

    // ── Keys ────────────────────────────────────────────────────────

    /// Set the key of a cipher or AEAD context. Nonce-carrying modes take
    /// the nonce from the tail of `key`. Cached hardware state is rebuilt
    /// on next use.
    pub fn set_key(&self, ctx: &CipherContext, key: &[u8]) -> Result<()> {
        ctx.set_key(&self.shared, key, None)
    }

    /// Set the cipher and HMAC keys of an authenc context.
    pub fn set_authenc_key(&self, ctx: &CipherContext, cipher_key: &[u8], auth_key: &[u8]) -> Result<()> {
        ctx.set_key(&self.shared, cipher_key, Some(auth_key))
    }

    pub fn set_hmac_key(&self, ctx: &HashContext, key: &[u8]) -> Result<()> {
        ctx.set_key(&self.shared, key)
    }

    // ── Cipher requests ─────────────────────────────────────────────

    /// Queue a cipher or AEAD request on the context's ring.
    pub fn submit(&self, ctx: &Arc<CipherContext>, req: CipherRequest) -> Result<Ticket<CipherOutput>> {
        let (reply, rx) = Ticket::channel();
        let enqueued = self.submit_job(ctx, req, reply)?;
        Ok(Ticket::new(rx, enqueued))
    }

    /// Queue a request whose result is handed to `callback` on the
    /// completing thread.
    pub fn submit_with<F>(&self, ctx: &Arc<CipherContext>, req: CipherRequest, callback: F) -> Result<Enqueued>
    where
        F: FnOnce(Result<CipherOutput>) + Send + 'static,
    {
        self.submit_job(ctx, req, Box::new(callback))
    }

    fn submit_job(
        &self,
        ctx: &Arc<CipherContext>,
        req: CipherRequest,
        reply: crate::request::Reply<CipherOutput>,
    ) -> Result<Enqueued> {
        let ring = ctx.ring(&self.shared);
        let job = CipherJob::new(Arc::clone(ctx), req, reply);
        self.shared.enqueue(ring, Box::new(job))
    }

    // ── Hashing ─────────────────────────────────────────────────────

    pub fn hash_session(&self, ctx: &Arc<HashContext>) -> Result<HashSession> {
        HashSession::new(ctx)
    }

    /// Hash `data` in one request.
    pub fn digest(&self, ctx: &Arc<HashContext>, data: &[u8]) -> Result<Ticket<Vec<u8>>> {
        HashSession::new(ctx)?.one_shot(self, data)
    }

    // ── Ring driving ────────────────────────────────────────────────

    /// Submit everything queued on `ring`. Returns the number of requests
    /// taken off the queue.
    pub fn dispatch(&self, ring: RingId) -> usize {
        dispatch::dispatch(&self.shared, ring)
    }

    /// Complete every result the hardware has ready for `ring`.
    pub fn drain(&self, ring: RingId) -> usize {
        harvest::drain(&self.shared, ring)
    }

    /// Dispatch and drain until the ring has nothing left to do. Returns the
    /// number of completed results.
    pub fn drive(&self, ring: RingId) -> usize {
        let mut completed = 0;
        loop {
            let dispatched = self.dispatch(ring);
            let drained = self.drain(ring);
            completed += drained;
            if dispatched == 0 && drained == 0 {
                return completed;
            }
        }
    }

    /// Poll for one result of `ring` with bounded retries. Returns false
    /// when nothing is in flight.
    pub fn harvest_polled(&self, ring: RingId) -> Result<bool> {
        harvest::harvest_polled(&self.shared, ring)
    }

    pub fn in_flight(&self, ring: RingId) -> Result<usize> {
        Ok(self.shared.rings.get(ring)?.in_flight())
    }

    pub fn queued(&self, ring: RingId) -> Result<usize> {
        Ok(self.shared.rings.get(ring)?.queued())
    }

    // ── IPsec offload ───────────────────────────────────────────────

    pub fn install_association(&self, state: &XfrmState) -> Result<AssocHandle> {
        ipsec::install(&self.shared, state)
    }

    /// Lifecycle state of an association; `TearDown` once removed.
    pub fn association_state(&self, handle: AssocHandle) -> Result<OffloadState> {
        ipsec::state(&self.shared, handle)
    }

    /// Tear down an association. Returns false if it was already removed.
    pub fn remove_association(&self, handle: AssocHandle) -> Result<bool> {
        ipsec::remove(&self.shared, handle)
    }

    pub fn association_count(&self) -> usize {
        self.shared.ipsec.lock().len()
    }

    /// Tear down every association. Returns how many there were.
    pub fn tear_down_all(&self) -> usize {
        ipsec::tear_down_all(&self.shared)
    }

    // ── DTLS offload ────────────────────────────────────────────────

    pub fn tunnel_id(&self, index: usize) -> Result<TunnelId> {
        self.shared.dtls.id(index)
    }

    /// Install a tunnel, replacing whatever occupies the slot.
    pub fn dtls_install(&self, id: TunnelId, params: &DtlsParams) -> Result<()> {
        dtls::install(&self.shared, id, params)
    }

    /// Remove a tunnel. Returns false for an empty slot.
    pub fn dtls_remove(&self, id: TunnelId) -> Result<bool> {
        dtls::remove(&self.shared, id)
    }

    pub fn dtls_tunnel_count(&self) -> usize {
        self.shared.dtls.occupied()
    }

    pub fn dtls_tear_down_all(&self) -> usize {
        dtls::tear_down_all(&self.shared)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Tear down all offloads, stop the dispatcher threads and fail every
    /// request that has not completed. Idempotent.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        ipsec::tear_down_all(shared);
        dtls::tear_down_all(shared);

        for tx in &shared.wakers {
            let _ = tx.send(Wakeup::Shutdown);
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }

        let mut failed = 0;
        for ring in shared.rings.iter() {
            harvest::drain(shared, ring.id());
            failed += fail_queued(ring);
            debug!(
                ring = ring.id().index(),
                submitted = ring.submitted(),
                by_dispatcher = metrics::REQUESTS_SUBMITTED.ring_value(ring.id().index()),
                "ring stopped"
            );
            for entry in ring.take_in_flight() {
                entry.waiter.fail(Error::Shutdown);
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(failed, "pending requests failed at shutdown");
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rings", &self.shared.rings.len())
            .field("shut_down", &self.shared.is_shut_down())
            .finish_non_exhaustive()
    }
}

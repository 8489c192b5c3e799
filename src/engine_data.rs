//! SA / token builder adapter.
//!
//! Turns a filled-in [`SaParams`] into hardware state: an SA image in a
//! transform-bank buffer, registered on a ring, plus the token context the
//! token builder derives per-packet tokens from. Records are shared through
//! `Arc` so an in-flight command keeps its SA registered until harvested.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ddk::{Bank, DmaHandle, SaBuilder, SaParams, TokenInfo, TokenParams};
use crate::dma::DmaBuffer;
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::metrics;
use crate::ring::RingId;

/// Build an SA image into a fresh transform-bank buffer of
/// `max(4 * words, min_sa_bytes)` bytes. Not registered anywhere yet.
pub(crate) fn build_sa_buffer(shared: &Shared, params: &SaParams) -> Result<DmaBuffer> {
    let services = &shared.services;
    let words = services
        .sa
        .size_words(params)
        .map_err(|e| Error::build(format!("SA size: {e}")))?;
    let size = (words * 4).max(shared.config.min_sa_bytes);
    let buffer = DmaBuffer::alloc(&services.dma, Bank::Transform, size)
        .map_err(|e| Error::alloc("SA buffer", e))?;
    let mut image = vec![0u32; size / 4];
    services
        .sa
        .build(params, &mut image)
        .map_err(|e| Error::build(format!("SA build: {e}")))?;
    buffer
        .write_words(&image)
        .map_err(|e| Error::alloc("SA write", e))?;
    Ok(buffer)
}

/// Build the token context for `params`.
pub(crate) fn build_token_context(shared: &Shared, params: &SaParams) -> Result<Box<[u32]>> {
    let token = &shared.services.token;
    let words = token
        .context_size_words(params)
        .map_err(|e| Error::build(format!("token context size: {e}")))?;
    let mut ctx = vec![0u32; words];
    token
        .build_context(params, &mut ctx)
        .map_err(|e| Error::build(format!("token context: {e}")))?;
    Ok(ctx.into_boxed_slice())
}

/// Build a per-packet token into a token-bank buffer.
pub(crate) fn build_token(
    shared: &Shared,
    context: &[u32],
    params: &TokenParams<'_>,
) -> Result<(DmaBuffer, TokenInfo)> {
    let services = &shared.services;
    let words = services
        .token
        .token_size_words(context, params)
        .map_err(|e| Error::build(format!("token size: {e}")))?;
    let buffer = DmaBuffer::alloc(&services.dma, Bank::Token, words * 4)
        .map_err(|e| Error::alloc("token buffer", e))?;
    let mut image = vec![0u32; words];
    let info = services
        .token
        .build_token(context, params, &mut image)
        .map_err(|e| Error::build(format!("token: {e}")))?;
    buffer
        .write_words(&image[..info.words.min(words)])
        .map_err(|e| Error::alloc("token write", e))?;
    Ok((buffer, info))
}

/// An SA registered on a ring. Unregistered, then released, on drop.
pub(crate) struct SaRecord {
    buffer: DmaBuffer,
    ring: RingId,
    builder: Arc<dyn SaBuilder>,
    registered: bool,
}

impl SaRecord {
    fn register(shared: &Shared, ring: RingId, buffer: DmaBuffer) -> Result<Self> {
        let handle = buffer
            .handle()
            .map_err(|e| Error::register("SA", e))?;
        shared
            .services
            .sa
            .register(ring.index(), handle)
            .map_err(|e| Error::register("SA", e))?;
        metrics::SA_BUILT.increment();
        Ok(Self {
            buffer,
            ring,
            builder: Arc::clone(&shared.services.sa),
            registered: true,
        })
    }

    /// Build and register a one-off SA.
    pub(crate) fn build(shared: &Shared, ring: RingId, params: &SaParams) -> Result<Self> {
        let buffer = build_sa_buffer(shared, params)?;
        Self::register(shared, ring, buffer)
    }

    pub(crate) fn handle(&self) -> Result<DmaHandle> {
        self.buffer
            .handle()
            .map_err(|e| Error::submit("SA handle", e))
    }
}

impl Drop for SaRecord {
    fn drop(&mut self) {
        if self.registered {
            self.registered = false;
            if let Ok(handle) = self.buffer.handle()
                && let Err(e) = self.builder.unregister(self.ring.index(), handle)
            {
                warn!(ring = self.ring.index(), error = %e, "SA unregister failed");
            }
        }
        self.buffer.release();
        metrics::SA_RELEASED.increment();
    }
}

/// A fully built per-direction record: SA plus token context.
pub(crate) struct EngineData {
    sa: SaRecord,
    token_context: Box<[u32]>,
}

impl EngineData {
    pub(crate) fn sa_handle(&self) -> Result<DmaHandle> {
        self.sa.handle()
    }

    pub(crate) fn token_context(&self) -> &[u32] {
        &self.token_context
    }
}

impl std::fmt::Debug for EngineData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineData")
            .field("sa", &self.sa.buffer)
            .field("ring", &self.sa.ring)
            .field("token_context_words", &self.token_context.len())
            .finish()
    }
}

/// Build an Engine Data record on `ring`. Either everything is built and
/// registered, or nothing remains allocated.
pub(crate) fn build_engine_data(
    shared: &Shared,
    ring: RingId,
    params: &SaParams,
) -> Result<Arc<EngineData>> {
    let result = (|| -> Result<EngineData> {
        let buffer = build_sa_buffer(shared, params)?;
        let token_context = build_token_context(shared, params)?;
        let sa = SaRecord::register(shared, ring, buffer)?;
        Ok(EngineData { sa, token_context })
    })();
    match result {
        Ok(data) => {
            debug!(ring = ring.index(), direction = ?params.direction, "engine data built");
            Ok(Arc::new(data))
        }
        Err(e) => {
            metrics::SA_BUILD_FAILURES.increment();
            warn!(ring = ring.index(), error = %e, "engine data build failed");
            Err(e)
        }
    }
}

/// The encrypt and decrypt records of a context.
#[derive(Debug, Default)]
pub(crate) struct EngineSlots {
    pub(crate) encrypt: Option<Arc<EngineData>>,
    pub(crate) decrypt: Option<Arc<EngineData>>,
}

/// Drop the cached records so the next submission builds fresh ones. The
/// hardware state goes away once in-flight commands release their
/// references.
pub(crate) fn rebuild_on_keychange(slots: &mut EngineSlots) {
    let encrypt = slots.encrypt.take();
    let decrypt = slots.decrypt.take();
    if encrypt.is_some() || decrypt.is_some() {
        debug!("engine data invalidated by key change");
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::ddk::{SaCryptoAlg, SaCryptoMode, SaDirection, SaProtocol};
    use crate::engine::Engine;
    use crate::sim::{Call, Sim};
    use crate::ConfigBuilder;

    fn engine(sim: &Arc<Sim>) -> Engine {
        let config = ConfigBuilder::new()
            .rings(2)
            .spawn_workers(false)
            .build()
            .unwrap();
        Engine::start(config, sim.services()).unwrap()
    }

    fn cbc_params(engine: &Engine) -> SaParams {
        let mut p = engine
            .shared()
            .services
            .sa
            .init(SaDirection::Outbound, SaProtocol::Basic)
            .unwrap();
        p.crypto_alg = SaCryptoAlg::Aes;
        p.crypto_mode = SaCryptoMode::Cbc;
        p.key = vec![7; 16];
        p
    }

    #[test]
    fn built_record_is_registered_and_released_once() {
        let sim = Sim::new(2);
        let engine = engine(&sim);
        let ring = engine.ring_id(1).unwrap();
        let data = build_engine_data(engine.shared(), ring, &cbc_params(&engine)).unwrap();
        let handle = data.sa_handle().unwrap();
        assert!(sim.sa_registered(1, handle));
        assert!(sim.buffer_len(handle).unwrap() >= 256);

        let clone = Arc::clone(&data);
        drop(data);
        assert!(sim.sa_registered(1, handle));
        drop(clone);
        assert!(!sim.sa_registered(1, handle));
        assert_eq!(sim.live_buffers(), 0);
        assert_eq!(sim.double_releases(), 0);

        let calls = sim.calls();
        let unregister = calls
            .iter()
            .position(|c| *c == Call::SaUnregister(1, handle))
            .unwrap();
        let release = calls
            .iter()
            .position(|c| *c == Call::DmaRelease(handle))
            .unwrap();
        assert!(unregister < release);
    }

    #[test]
    fn register_failure_leaves_nothing_allocated() {
        let sim = Sim::new(2);
        let engine = engine(&sim);
        sim.faults().fail_sa_register = true;
        let ring = engine.ring_id(0).unwrap();
        let err = build_engine_data(engine.shared(), ring, &cbc_params(&engine)).unwrap_err();
        assert!(matches!(err, Error::Register(_)));
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn alloc_failure_is_reported() {
        let sim = Sim::new(2);
        let engine = engine(&sim);
        sim.faults().fail_alloc_bank = Some(Bank::Transform);
        let ring = engine.ring_id(0).unwrap();
        let err = build_engine_data(engine.shared(), ring, &cbc_params(&engine)).unwrap_err();
        assert!(matches!(err, Error::Alloc(_)));
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn null_algorithm_fails_build() {
        let sim = Sim::new(2);
        let engine = engine(&sim);
        let mut params = cbc_params(&engine);
        params.crypto_alg = SaCryptoAlg::Null;
        let ring = engine.ring_id(0).unwrap();
        let err = build_engine_data(engine.shared(), ring, &params).unwrap_err();
        assert!(matches!(err, Error::Build(_)));
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn keychange_clears_slots() {
        let sim = Sim::new(2);
        let engine = engine(&sim);
        let ring = engine.ring_id(0).unwrap();
        let mut slots = EngineSlots {
            encrypt: Some(build_engine_data(engine.shared(), ring, &cbc_params(&engine)).unwrap()),
            decrypt: None,
        };
        assert_eq!(sim.live_buffers(), 1);
        rebuild_on_keychange(&mut slots);
        assert!(slots.encrypt.is_none());
        assert_eq!(sim.live_buffers(), 0);
    }
}

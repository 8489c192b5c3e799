//! Hash pipeline.
//!
//! Plain hashes and HMACs run as hash-only SAs: every command carries its
//! own one-off SA holding the intermediate state it continues from. Key
//! precomputation (HMAC inner/outer states, the GCM hash key) is polled on
//! the caller's thread; session updates and finals go through the ring
//! queue like any other request.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::algo::{HashAlg, map_hash};
use crate::completion::OutputToken;
use crate::ddk::{
    Command, HashChain, IvSource, SaAuthAlg, SaCryptoAlg, SaCryptoMode, SaDirection, SaParams,
    SaProtocol, TokenParams,
};
use crate::dma::DmaBuffer;
use crate::engine::{Engine, Shared};
use crate::engine_data::{SaRecord, build_token, build_token_context};
use crate::error::{Error, Result};
use crate::harvest::poll_sync;
use crate::job::{Harvest, Job, Prepared, Resources};
use crate::request::{Reply, Ticket};
use crate::ring::RingId;

const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

/// Builder auth algorithm of a plain hash. XCBC and CMAC only exist as
/// table entries.
fn hash_auth(alg: HashAlg) -> Result<SaAuthAlg> {
    match alg {
        HashAlg::Xcbc | HashAlg::Cmac128 | HashAlg::Cmac192 | HashAlg::Cmac256 => {
            Err(Error::build(format!("{alg:?} hashing is not supported")))
        }
        _ => Ok(map_hash(alg)),
    }
}

fn hash_params(shared: &Shared, alg: HashAlg, state: Option<(&[u8], u64)>) -> Result<SaParams> {
    let auth_alg = hash_auth(alg)?;
    let mut params = shared
        .services
        .sa
        .init(SaDirection::Outbound, SaProtocol::Basic)
        .map_err(|e| Error::build(format!("SA init: {e}")))?;
    params.crypto_alg = SaCryptoAlg::Null;
    params.crypto_mode = SaCryptoMode::Basic;
    params.auth_alg = auth_alg;
    if let Some((digest, count)) = state {
        params.auth_key1 = digest.to_vec();
        params.digest_count = count;
    }
    Ok(params)
}

/// Build a hash command over `data`.
///
/// `state` is the intermediate digest and the number of bytes it covers;
/// without it the hash starts from the algorithm's initial value. The
/// result is the next intermediate state, or the digest when
/// `chain.last` is set.
pub(crate) fn prepare_hash(
    shared: &Shared,
    ring: RingId,
    alg: HashAlg,
    state: Option<(&[u8], u64)>,
    data: &[u8],
    chain: HashChain,
) -> Result<Prepared> {
    if data.len() > OutputToken::MAX_PACKET_LEN {
        return Err(Error::build(format!(
            "{} bytes exceeds the {} byte packet limit",
            data.len(),
            OutputToken::MAX_PACKET_LEN
        )));
    }
    let params = hash_params(shared, alg, state)?;
    let sa = SaRecord::build(shared, ring, &params)?;
    let context = build_token_context(shared, &params)?;
    let dma = &shared.services.dma;

    let src = DmaBuffer::particles(dma, &[data.len()])
        .map_err(|e| Error::alloc("hash source", e))?;
    src.write(0, data)
        .map_err(|e| Error::alloc("hash source write", e))?;
    let out_len = if chain.last {
        alg.digest_size()
    } else {
        alg.state_size()
    };
    let dst = DmaBuffer::particles(dma, &[out_len])
        .map_err(|e| Error::alloc("hash destination", e))?;

    let token_params = TokenParams {
        packet_len: data.len(),
        hash: chain,
        ..TokenParams::default()
    };
    let (token, info) = build_token(shared, &context, &token_params)?;
    let command = Command {
        token: Some(token.handle().map_err(|e| Error::submit("token", e))?),
        token_words: info.words,
        token_header: info.header,
        sa: Some(sa.handle()?),
        src: Some(src.handle().map_err(|e| Error::submit("source", e))?),
        src_len: data.len(),
        dst: Some(dst.handle().map_err(|e| Error::submit("destination", e))?),
        dst_len: out_len,
        ..Command::packet()
    };
    Ok(Prepared {
        command,
        resources: Resources {
            token: Some(token),
            src: Some(src),
            dst: Some(dst),
            engine_data: None,
            sa: Some(sa),
        },
    })
}

/// Hash `data` on the calling thread.
fn hash_polled(
    shared: &Shared,
    ring: RingId,
    alg: HashAlg,
    state: Option<(&[u8], u64)>,
    data: &[u8],
    chain: HashChain,
) -> Result<Vec<u8>> {
    let prepared = prepare_hash(shared, ring, alg, state, data, chain)?;
    let harvest = poll_sync(shared, ring, prepared)?;
    let mut out = harvest.into_output()?;
    out.truncate(if chain.last {
        alg.digest_size()
    } else {
        alg.state_size()
    });
    Ok(out)
}

/// HMAC inner and outer states for `key`, computed on the hardware.
#[instrument(skip(shared, key), fields(ring = ring.index()))]
pub(crate) fn hmac_precompute(
    shared: &Shared,
    ring: RingId,
    alg: HashAlg,
    key: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let block = alg.block_size();
    let mut padded = if key.len() > block {
        let whole = HashChain {
            first: true,
            last: true,
        };
        hash_polled(shared, ring, alg, None, key, whole)?
    } else {
        key.to_vec()
    };
    padded.resize(block, 0);

    let first = HashChain {
        first: true,
        last: false,
    };
    let ipad: Vec<u8> = padded.iter().map(|b| b ^ IPAD).collect();
    let opad: Vec<u8> = padded.iter().map(|b| b ^ OPAD).collect();
    let istate = hash_polled(shared, ring, alg, None, &ipad, first)?;
    let ostate = hash_polled(shared, ring, alg, None, &opad, first)?;
    debug!(?alg, "hmac states computed");
    Ok((istate, ostate))
}

/// GHASH key `H = AES_K(0^128)`, each 32-bit word byte-swapped as the SA
/// expects it.
#[instrument(skip(shared, key), fields(ring = ring.index()))]
pub(crate) fn gcm_hash_key(shared: &Shared, ring: RingId, key: &[u8]) -> Result<Vec<u8>> {
    const BLOCK: usize = 16;
    let mut params = shared
        .services
        .sa
        .init(SaDirection::Outbound, SaProtocol::Basic)
        .map_err(|e| Error::build(format!("SA init: {e}")))?;
    params.crypto_alg = SaCryptoAlg::Aes;
    params.crypto_mode = SaCryptoMode::Ecb;
    params.key = key.to_vec();
    params.iv_source = IvSource::Token;

    let sa = SaRecord::build(shared, ring, &params)?;
    let context = build_token_context(shared, &params)?;
    let dma = &shared.services.dma;
    let src = DmaBuffer::particles(dma, &[BLOCK]).map_err(|e| Error::alloc("zero block", e))?;
    src.write(0, &[0; BLOCK])
        .map_err(|e| Error::alloc("zero block write", e))?;
    let dst = DmaBuffer::particles(dma, &[BLOCK]).map_err(|e| Error::alloc("hash key", e))?;
    let token_params = TokenParams {
        packet_len: BLOCK,
        ..TokenParams::default()
    };
    let (token, info) = build_token(shared, &context, &token_params)?;
    let command = Command {
        token: Some(token.handle().map_err(|e| Error::submit("token", e))?),
        token_words: info.words,
        token_header: info.header,
        sa: Some(sa.handle()?),
        src: Some(src.handle().map_err(|e| Error::submit("source", e))?),
        src_len: BLOCK,
        dst: Some(dst.handle().map_err(|e| Error::submit("destination", e))?),
        dst_len: BLOCK,
        ..Command::packet()
    };
    let prepared = Prepared {
        command,
        resources: Resources {
            token: Some(token),
            src: Some(src),
            dst: Some(dst),
            engine_data: None,
            sa: Some(sa),
        },
    };
    let mut h = poll_sync(shared, ring, prepared)?.into_output()?;
    h.truncate(BLOCK);
    for word in h.chunks_exact_mut(4) {
        word.reverse();
    }
    Ok(h)
}

/// A hash or HMAC transform instance.
pub struct HashContext {
    alg: HashAlg,
    mac: bool,
    ring: OnceLock<RingId>,
    /// HMAC inner and outer states once keyed.
    keys: Mutex<Option<(Vec<u8>, Vec<u8>)>>,
}

impl HashContext {
    /// Plain hash.
    pub fn new(alg: HashAlg) -> Result<Arc<Self>> {
        Self::with_mac(alg, false)
    }

    /// HMAC; a key must be set before use.
    pub fn hmac(alg: HashAlg) -> Result<Arc<Self>> {
        Self::with_mac(alg, true)
    }

    fn with_mac(alg: HashAlg, mac: bool) -> Result<Arc<Self>> {
        hash_auth(alg)?;
        Ok(Arc::new(Self {
            alg,
            mac,
            ring: OnceLock::new(),
            keys: Mutex::new(None),
        }))
    }

    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    pub fn is_hmac(&self) -> bool {
        self.mac
    }

    fn ring(&self, shared: &Shared) -> RingId {
        *self.ring.get_or_init(|| shared.rings.select())
    }

    pub(crate) fn set_key(&self, shared: &Shared, key: &[u8]) -> Result<()> {
        if !self.mac {
            return Err(Error::build("plain hashes take no key"));
        }
        let states = hmac_precompute(shared, self.ring(shared), self.alg, key)?;
        *self.keys.lock() = Some(states);
        Ok(())
    }
}

impl std::fmt::Debug for HashContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashContext")
            .field("alg", &self.alg)
            .field("mac", &self.mac)
            .field("ring", &self.ring.get())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    /// Bytes not yet sent to the hardware.
    cache: Vec<u8>,
    /// Intermediate digest of everything sent so far.
    digest: Option<Vec<u8>>,
    /// Bytes covered by `digest`.
    count: u64,
    busy: bool,
    /// HMAC outer state.
    ostate: Option<Vec<u8>>,
}

/// A multi-part hash or HMAC computation.
///
/// Small updates are cached; larger ones are sent to the hardware whole
/// cache blocks at a time, each continuing from the previous
/// intermediate state. At most one operation is outstanding.
#[derive(Debug)]
pub struct HashSession {
    ctx: Arc<HashContext>,
    state: Arc<Mutex<SessionState>>,
}

impl HashSession {
    pub(crate) fn new(ctx: &Arc<HashContext>) -> Result<Self> {
        let mut state = SessionState::default();
        if ctx.mac {
            let keys = ctx.keys.lock();
            let (istate, ostate) = keys
                .as_ref()
                .ok_or_else(|| Error::build("no HMAC key set"))?;
            state.digest = Some(istate.clone());
            state.count = ctx.alg.block_size() as u64;
            state.ostate = Some(ostate.clone());
        }
        Ok(Self {
            ctx: Arc::clone(ctx),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Feed more data.
    pub fn update(&self, engine: &Engine, data: &[u8]) -> Result<Ticket<()>> {
        let shared = engine.shared();
        let cache_size = shared.config.hash_cache_size;
        let mut state = self.state.lock();
        if state.busy {
            return Err(Error::Busy);
        }
        if state.cache.len() + data.len() <= cache_size {
            state.cache.extend_from_slice(data);
            return Ok(Ticket::ready(Ok(())));
        }

        let total = state.cache.len() + data.len();
        let keep = match total % cache_size {
            0 => cache_size,
            n => n,
        };
        if total - keep > OutputToken::MAX_PACKET_LEN {
            return Err(Error::build(format!(
                "update of {} bytes exceeds the {} byte packet limit",
                total - keep,
                OutputToken::MAX_PACKET_LEN
            )));
        }
        let mut pending = std::mem::take(&mut state.cache);
        pending.extend_from_slice(data);
        state.cache = pending.split_off(pending.len() - keep);
        state.busy = true;
        drop(state);

        let (reply, rx) = Ticket::channel();
        let job = HashJob {
            ctx: Arc::clone(&self.ctx),
            session: Arc::clone(&self.state),
            data: pending,
            step: Step::Update(reply),
        };
        let enqueued = engine.enqueue(self.ctx.ring(shared), Box::new(job))?;
        Ok(Ticket::new(rx, enqueued))
    }

    /// Produce the digest or MAC.
    pub fn finish(self, engine: &Engine) -> Result<Ticket<Vec<u8>>> {
        let shared = engine.shared();
        let mut state = self.state.lock();
        if state.busy {
            return Err(Error::Busy);
        }
        if !self.ctx.mac
            && state.digest.is_none()
            && state.cache.is_empty()
            && let Some(empty) = self.ctx.alg.empty_digest()
        {
            return Ok(Ticket::ready(Ok(empty.to_vec())));
        }
        let data = std::mem::take(&mut state.cache);
        state.busy = true;
        drop(state);

        let (reply, rx) = Ticket::channel();
        let job = HashJob {
            ctx: Arc::clone(&self.ctx),
            session: Arc::clone(&self.state),
            data,
            step: Step::Final(reply),
        };
        let enqueued = engine.enqueue(self.ctx.ring(shared), Box::new(job))?;
        Ok(Ticket::new(rx, enqueued))
    }

    /// Hash `data` in one final command, whatever its size.
    pub(crate) fn one_shot(self, engine: &Engine, data: &[u8]) -> Result<Ticket<Vec<u8>>> {
        self.state.lock().cache = data.to_vec();
        self.finish(engine)
    }
}

enum Step {
    Update(Reply<()>),
    Final(Reply<Vec<u8>>),
    /// HMAC outer pass over the inner digest.
    Outer(Reply<Vec<u8>>),
}

struct HashJob {
    ctx: Arc<HashContext>,
    session: Arc<Mutex<SessionState>>,
    data: Vec<u8>,
    step: Step,
}

impl HashJob {
    fn release_session(&self) {
        self.session.lock().busy = false;
    }
}

impl Job for HashJob {
    fn send(&mut self, shared: &Shared, ring: RingId) -> Result<Prepared> {
        let alg = self.ctx.alg;
        let session = self.session.lock();
        let (state, chain) = match &self.step {
            Step::Update(_) => (
                session.digest.as_deref().map(|d| (d, session.count)),
                HashChain {
                    first: session.digest.is_none(),
                    last: false,
                },
            ),
            Step::Final(_) => (
                session.digest.as_deref().map(|d| (d, session.count)),
                HashChain {
                    first: session.digest.is_none(),
                    last: true,
                },
            ),
            Step::Outer(_) => {
                let ostate = session
                    .ostate
                    .as_deref()
                    .ok_or_else(|| Error::build("no HMAC outer state"))?;
                (
                    Some((ostate, alg.block_size() as u64)),
                    HashChain {
                        first: false,
                        last: true,
                    },
                )
            }
        };
        prepare_hash(shared, ring, alg, state, &self.data, chain)
    }

    fn finish(self: Box<Self>, shared: &Shared, harvest: Harvest) {
        let alg = self.ctx.alg;
        let produced = harvest.token.packet_len as usize;
        let result = harvest.into_output().map(|mut out| {
            out.truncate(produced);
            out
        });
        let HashJob {
            ctx,
            session,
            data,
            step,
        } = *self;
        match step {
            Step::Update(reply) => {
                let mut state = session.lock();
                state.busy = false;
                match result {
                    Ok(mut digest) => {
                        digest.truncate(alg.state_size());
                        state.digest = Some(digest);
                        state.count += data.len() as u64;
                        drop(state);
                        reply(Ok(()));
                    }
                    Err(e) => {
                        drop(state);
                        reply(Err(e));
                    }
                }
            }
            Step::Final(reply) if ctx.mac => {
                let inner = match result {
                    Ok(mut inner) => {
                        inner.truncate(alg.digest_size());
                        inner
                    }
                    Err(e) => {
                        session.lock().busy = false;
                        return reply(Err(e));
                    }
                };
                let ring = ctx.ring(shared);
                let outer = HashJob {
                    ctx,
                    session: Arc::clone(&session),
                    data: inner,
                    step: Step::Outer(reply),
                };
                // A refused job has already been failed.
                let _ = shared.enqueue(ring, Box::new(outer));
            }
            Step::Final(reply) | Step::Outer(reply) => {
                session.lock().busy = false;
                reply(result.map(|mut digest| {
                    digest.truncate(alg.digest_size());
                    digest
                }));
            }
        }
    }

    fn fail(self: Box<Self>, err: Error) {
        self.release_session();
        match self.step {
            Step::Update(reply) => reply(Err(err)),
            Step::Final(reply) | Step::Outer(reply) => reply(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_only_algorithms_are_rejected() {
        assert!(HashContext::new(HashAlg::Sha256).is_ok());
        assert!(HashContext::hmac(HashAlg::Md5).is_ok());
        assert!(matches!(HashContext::new(HashAlg::Xcbc), Err(Error::Build(_))));
        assert!(matches!(HashContext::hmac(HashAlg::Cmac128), Err(Error::Build(_))));
    }

    #[test]
    fn hmac_session_needs_key() {
        let ctx = HashContext::hmac(HashAlg::Sha1).unwrap();
        assert!(HashSession::new(&ctx).is_err());
        let plain = HashContext::new(HashAlg::Sha1).unwrap();
        assert!(HashSession::new(&plain).is_ok());
    }
}

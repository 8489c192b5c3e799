//! IPsec association install and teardown.
//!
//! An association walks `Uninstalled → CdrtAllocated → TransformBuilt →
//! ClassifierInstalled (inbound) → Active`, and teardown unwinds whatever
//! was reached in reverse. Teardown is idempotent: every step is guarded
//! by the presence of the resource it undoes.

use std::net::IpAddr;

use slab::Slab;
use tracing::{debug, info, instrument, warn};

use crate::algo::{AuthAlg, CipherAlg, CipherMode, HashAlg, map_auth, map_cipher};
use crate::ddk::{
    CdrtDescriptor, CdrtEntry, CdrtKind, ClassifierRule, DmaHandle, EspParams, IpsecMode,
    IvSource, L4Match, RuleHandle, SaAuthAlg, SaCryptoAlg, SaDirection, SaParams, SaProtocol,
    TransformRecord,
};
use crate::dma::DmaBuffer;
use crate::engine::Shared;
use crate::engine_data::build_sa_buffer;
use crate::error::{Error, Result};
use crate::metrics;
use crate::offload::{auth_keys, parse_hmac, retire_transform};

/// IP protocol number of ESP.
pub const IPPROTO_ESP: u8 = 50;

/// CDRT descriptor type of an inline ESP context.
const CDRT_DESC_TYPE: u8 = 3;
/// Token words the inline path reserves per packet.
const CDRT_TOKEN_LEN: u8 = 48;
/// Hardware service code of inline ESP processing.
const CDRT_HW_SERVICE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XfrmDirection {
    Outbound,
    Inbound,
}

impl XfrmDirection {
    fn sa(self) -> SaDirection {
        match self {
            XfrmDirection::Outbound => SaDirection::Outbound,
            XfrmDirection::Inbound => SaDirection::Inbound,
        }
    }

    fn cdrt(self) -> CdrtKind {
        match self {
            XfrmDirection::Outbound => CdrtKind::Encrypt,
            XfrmDirection::Inbound => CdrtKind::Decrypt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XfrmMode {
    Tunnel,
    Transport,
}

/// UDP encapsulation ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatT {
    pub sport: u16,
    pub dport: u16,
}

/// Algorithms and keys of an association, named the way xfrm names them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XfrmCrypto {
    /// `rfc4106(gcm(aes))`, `rfc4543(gcm(aes))` or `rfc4309(ccm(aes))`.
    /// The key ends in the salt.
    Aead {
        name: String,
        key: Vec<u8>,
        icv_bits: usize,
    },
    /// A `cbc(...)` cipher with an `hmac(...)` auth algorithm.
    CipherAuth {
        cipher: String,
        cipher_key: Vec<u8>,
        auth: String,
        auth_key: Vec<u8>,
        trunc_bits: usize,
    },
}

/// An xfrm state to offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmState {
    pub direction: XfrmDirection,
    pub spi: u32,
    pub proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub mode: XfrmMode,
    pub nat_t: Option<NatT>,
    pub crypto: XfrmCrypto,
}

/// Lifecycle state of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffloadState {
    Uninstalled,
    CdrtAllocated,
    TransformBuilt,
    ClassifierInstalled,
    Active,
    TearDown,
}

/// Generation-checked handle into the association table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssocHandle {
    index: usize,
    generation: u64,
}

/// Algorithm selection derived from an [`XfrmCrypto`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct EspCrypto {
    cipher: CipherAlg,
    mode: CipherMode,
    auth: AuthAlg,
    cipher_key: Vec<u8>,
    nonce: Vec<u8>,
    auth_key: Vec<u8>,
    icv_len: usize,
}

fn parse_crypto(crypto: &XfrmCrypto) -> Result<EspCrypto> {
    match crypto {
        XfrmCrypto::Aead {
            name,
            key,
            icv_bits,
        } => {
            let (mode, auth, salt) = match name.as_str() {
                "rfc4106(gcm(aes))" => (CipherMode::Gcm, AuthAlg::Gcm, 4),
                "rfc4543(gcm(aes))" => (CipherMode::Gmac, AuthAlg::Gmac, 4),
                "rfc4309(ccm(aes))" => (CipherMode::Ccm, AuthAlg::Ccm, 3),
                _ => return Err(Error::build(format!("unsupported AEAD {name:?}"))),
            };
            if key.len() < salt {
                return Err(Error::build("AEAD key shorter than its salt"));
            }
            let (cipher_key, salt) = key.split_at(key.len() - salt);
            let nonce = if mode == CipherMode::Ccm {
                let mut n = vec![3u8];
                n.extend_from_slice(salt);
                n
            } else {
                salt.to_vec()
            };
            Ok(EspCrypto {
                cipher: CipherAlg::Aes,
                mode,
                auth,
                cipher_key: cipher_key.to_vec(),
                nonce,
                auth_key: Vec::new(),
                icv_len: icv_bits / 8,
            })
        }
        XfrmCrypto::CipherAuth {
            cipher,
            cipher_key,
            auth,
            auth_key,
            trunc_bits,
        } => {
            let cipher = match cipher.as_str() {
                "cbc(aes)" => CipherAlg::Aes,
                "cbc(des)" => CipherAlg::Des,
                "cbc(des3_ede)" => CipherAlg::TripleDes,
                _ => return Err(Error::build(format!("unsupported cipher {cipher:?}"))),
            };
            Ok(EspCrypto {
                cipher,
                mode: CipherMode::Cbc,
                auth: AuthAlg::Hmac(parse_hmac(auth)?),
                cipher_key: cipher_key.clone(),
                nonce: Vec::new(),
                auth_key: auth_key.clone(),
                icv_len: trunc_bits / 8,
            })
        }
    }
}

/// Transform record layout for an auth algorithm.
fn record_type(auth: AuthAlg) -> TransformRecord {
    match auth {
        AuthAlg::Hmac(HashAlg::Sha384 | HashAlg::Sha512) => TransformRecord::Large,
        _ => TransformRecord::Small,
    }
}

fn validate(state: &XfrmState) -> Result<()> {
    if state.proto != IPPROTO_ESP {
        return Err(Error::build(format!("protocol {} is not ESP", state.proto)));
    }
    if state.src.is_ipv4() != state.dst.is_ipv4() {
        return Err(Error::build("mixed address families"));
    }
    Ok(())
}

fn esp_params(shared: &Shared, state: &XfrmState, crypto: &EspCrypto) -> Result<SaParams> {
    let (crypto_alg, crypto_mode) = map_cipher(crypto.cipher, crypto.mode);
    let auth_alg = map_auth(crypto.auth);
    if crypto_alg == SaCryptoAlg::Null || auth_alg == SaAuthAlg::Null {
        return Err(Error::build("algorithm has no ESP mapping"));
    }
    let esp = EspParams {
        spi: state.spi,
        mode: match state.mode {
            XfrmMode::Tunnel => IpsecMode::Tunnel,
            XfrmMode::Transport => IpsecMode::Transport,
        },
        ipv6: state.src.is_ipv6(),
        nat_t: state.nat_t.map(|n| (n.sport, n.dport)),
        tunnel: (state.mode == XfrmMode::Tunnel).then_some((state.src, state.dst)),
        process_ip_headers: true,
        ext_processing: true,
    };
    let mut params = shared
        .services
        .sa
        .init(state.direction.sa(), SaProtocol::Esp(esp))
        .map_err(|e| Error::build(format!("ESP SA init: {e}")))?;
    params.crypto_alg = crypto_alg;
    params.crypto_mode = crypto_mode;
    params.key = crypto.cipher_key.clone();
    params.nonce = crypto.nonce.clone();
    params.iv_source = IvSource::Sa;
    params.auth_alg = auth_alg;
    let (key1, key2) = auth_keys(shared, crypto.auth, &crypto.cipher_key, &crypto.auth_key)?;
    params.auth_key1 = key1;
    params.auth_key2 = key2;
    params.icv_len = crypto.icv_len;
    Ok(params)
}

/// Hardware resources of one association.
#[derive(Debug)]
struct Association {
    direction: XfrmDirection,
    spi: u32,
    state: OffloadState,
    cdrt: Option<CdrtEntry>,
    cdrt_written: bool,
    transform: Option<DmaBuffer>,
    transform_registered: bool,
    rule: Option<RuleHandle>,
}

impl Association {
    fn new(state: &XfrmState) -> Self {
        Self {
            direction: state.direction,
            spi: state.spi,
            state: OffloadState::Uninstalled,
            cdrt: None,
            cdrt_written: false,
            transform: None,
            transform_registered: false,
            rule: None,
        }
    }

    fn install(&mut self, shared: &Shared, xfrm: &XfrmState) -> Result<()> {
        let classifier = &shared.services.classifier;
        let crypto = parse_crypto(&xfrm.crypto)?;

        let entry = classifier
            .cdrt_alloc(self.direction.cdrt())
            .map_err(|e| Error::alloc("CDRT entry", e))?;
        self.cdrt = Some(entry);
        self.state = OffloadState::CdrtAllocated;

        let params = esp_params(shared, xfrm, &crypto)?;
        let transform = build_sa_buffer(shared, &params)?;
        let handle = transform
            .handle()
            .map_err(|e| Error::register("transform", e))?;
        self.transform = Some(transform);
        classifier
            .transform_register(handle)
            .map_err(|e| Error::register("transform", e))?;
        self.transform_registered = true;
        self.state = OffloadState::TransformBuilt;

        let addr = shared
            .services
            .dma
            .bus_address(handle)
            .map_err(|e| Error::register("transform address", e))?;
        let desc = CdrtDescriptor {
            desc_type: CDRT_DESC_TYPE,
            token_len: CDRT_TOKEN_LEN,
            transform: [addr as u32 | record_type(crypto.auth).bits(), (addr >> 32) as u32],
            hw_service: CDRT_HW_SERVICE,
            allow_pad: true,
            strip_pad: true,
        };
        classifier
            .cdrt_write(&entry, &desc)
            .map_err(|e| Error::register("CDRT descriptor", e))?;
        self.cdrt_written = true;

        if self.direction == XfrmDirection::Inbound {
            let rule = ClassifierRule {
                cdrt_index: entry.index,
                spi: xfrm.spi,
                l4: match xfrm.nat_t {
                    Some(nat_t) => L4Match::NatT { dport: nat_t.dport },
                    None => L4Match::Esp,
                },
            };
            let handle = classifier
                .rule_install(&rule)
                .map_err(|e| Error::register("classifier rule", e))?;
            self.rule = Some(handle);
            self.state = OffloadState::ClassifierInstalled;
        }
        self.state = OffloadState::Active;
        Ok(())
    }

    fn transform_handle(&self) -> Option<DmaHandle> {
        self.transform.as_ref().and_then(|t| t.handle().ok())
    }

    /// Undo whatever was installed. Safe to call repeatedly.
    fn tear_down(&mut self, shared: &Shared) {
        let classifier = &shared.services.classifier;
        if let Some(rule) = self.rule.take() {
            classifier.rule_remove(rule);
        }
        if self.cdrt_written
            && let Some(entry) = &self.cdrt
        {
            self.cdrt_written = false;
            if let Err(e) = classifier.cdrt_write(entry, &CdrtDescriptor::CLEARED) {
                warn!(index = entry.index, error = %e, "CDRT clear failed");
            }
        }
        if self.transform_registered {
            self.transform_registered = false;
            if let Some(handle) = self.transform_handle() {
                retire_transform(shared, handle);
            }
        }
        if let Some(mut transform) = self.transform.take() {
            transform.release();
        }
        if let Some(entry) = self.cdrt.take() {
            classifier.cdrt_free(entry);
        }
        self.state = OffloadState::TearDown;
    }
}

/// Slab of installed associations. Handles carry a generation so a handle
/// to a removed association never aliases a later one in the same slot.
#[derive(Debug, Default)]
pub(crate) struct AssocTable {
    slots: Slab<(u64, Association)>,
    next_generation: u64,
}

impl AssocTable {
    fn insert(&mut self, assoc: Association) -> AssocHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let index = self.slots.insert((generation, assoc));
        AssocHandle { index, generation }
    }

    fn lookup(&self, handle: AssocHandle) -> Result<Option<&Association>> {
        if handle.generation >= self.next_generation {
            return Err(Error::InvalidAssociation);
        }
        Ok(self
            .slots
            .get(handle.index)
            .filter(|(generation, _)| *generation == handle.generation)
            .map(|(_, assoc)| assoc))
    }

    /// Take an association out. `Ok(None)` when it has already been removed.
    fn take(&mut self, handle: AssocHandle) -> Result<Option<Association>> {
        if self.lookup(handle)?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.slots.remove(handle.index).1))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Install an association. On failure everything reached is torn down.
#[instrument(skip_all, fields(spi = xfrm.spi, direction = ?xfrm.direction))]
pub(crate) fn install(shared: &Shared, xfrm: &XfrmState) -> Result<AssocHandle> {
    if let Err(e) = validate(xfrm) {
        metrics::OFFLOAD_INSTALL_FAILURES.increment();
        return Err(e);
    }
    let mut assoc = Association::new(xfrm);
    if let Err(e) = assoc.install(shared, xfrm) {
        warn!(error = %e, state = ?assoc.state, "association install failed");
        assoc.tear_down(shared);
        metrics::OFFLOAD_INSTALL_FAILURES.increment();
        return Err(e);
    }
    let handle = shared.ipsec.lock().insert(assoc);
    metrics::IPSEC_INSTALLED.increment();
    info!(index = handle.index, "association active");
    Ok(handle)
}

pub(crate) fn state(shared: &Shared, handle: AssocHandle) -> Result<OffloadState> {
    let table = shared.ipsec.lock();
    Ok(table
        .lookup(handle)?
        .map_or(OffloadState::TearDown, |assoc| assoc.state))
}

/// Tear an association down. Returns false if it was already gone.
#[instrument(skip(shared))]
pub(crate) fn remove(shared: &Shared, handle: AssocHandle) -> Result<bool> {
    let Some(mut assoc) = shared.ipsec.lock().take(handle)? else {
        debug!("association already removed");
        return Ok(false);
    };
    assoc.tear_down(shared);
    metrics::IPSEC_REMOVED.increment();
    info!(spi = assoc.spi, "association removed");
    Ok(true)
}

/// Tear down every installed association.
pub(crate) fn tear_down_all(shared: &Shared) -> usize {
    let drained: Vec<Association> = {
        let mut table = shared.ipsec.lock();
        table.slots.drain().map(|(_, assoc)| assoc).collect()
    };
    let count = drained.len();
    for mut assoc in drained {
        assoc.tear_down(shared);
        metrics::IPSEC_REMOVED.increment();
    }
    if count > 0 {
        info!(count, "associations torn down");
    }
    count
}

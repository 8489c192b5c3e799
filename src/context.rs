use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::algo::{AeadKind, AuthAlg, CipherAlg, CipherMode, HashAlg, map_auth, map_cipher};
use crate::ddk::{IvSource, SaAuthAlg, SaCryptoAlg, SaDirection, SaParams, SaProtocol};
use crate::engine::Shared;
use crate::engine_data::{EngineData, EngineSlots, build_engine_data, rebuild_on_keychange};
use crate::error::{Error, Result};
use crate::hash;
use crate::ring::RingId;

/// Direction of a cipher request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    pub(crate) fn sa(self) -> SaDirection {
        match self {
            Direction::Encrypt => SaDirection::Outbound,
            Direction::Decrypt => SaDirection::Inbound,
        }
    }
}

/// Algorithm selection of a cipher, AEAD or authenc context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSpec {
    pub cipher: CipherAlg,
    pub mode: CipherMode,
    pub auth: AuthAlg,
    pub aead: AeadKind,
    /// Tag length in bytes; zero for plain ciphers.
    pub icv_len: usize,
}

impl CipherSpec {
    /// Unauthenticated block cipher. `CipherMode::Ctr` is RFC 3686 counter
    /// mode: the key carries a trailing 4-byte nonce.
    pub const fn skcipher(cipher: CipherAlg, mode: CipherMode) -> Self {
        Self {
            cipher,
            mode,
            auth: AuthAlg::None,
            aead: AeadKind::None,
            icv_len: 0,
        }
    }

    /// `gcm(aes)` with a 12-byte IV.
    pub const fn gcm(icv_len: usize) -> Self {
        Self::aead(CipherMode::Gcm, AuthAlg::Gcm, AeadKind::Generic, icv_len)
    }

    /// `ccm(aes)`; the IV is the caller's 16-byte counter block A0.
    pub const fn ccm(icv_len: usize) -> Self {
        Self::aead(CipherMode::Ccm, AuthAlg::Ccm, AeadKind::Generic, icv_len)
    }

    /// `rfc4106(gcm(aes))`: key ends in a 4-byte salt.
    pub const fn rfc4106(icv_len: usize) -> Self {
        Self::aead(CipherMode::Gcm, AuthAlg::Gcm, AeadKind::IpsecEsp, icv_len)
    }

    /// `rfc4543(gcm(aes))`: GMAC over the whole input.
    pub const fn rfc4543() -> Self {
        Self::aead(CipherMode::Gmac, AuthAlg::Gmac, AeadKind::IpsecEsp, 16)
    }

    /// `rfc4309(ccm(aes))`: key ends in a 3-byte salt.
    pub const fn rfc4309(icv_len: usize) -> Self {
        Self::aead(CipherMode::Ccm, AuthAlg::Ccm, AeadKind::IpsecEsp, icv_len)
    }

    /// `authenc(hmac(hash),cbc(cipher))`.
    pub const fn authenc(hash: HashAlg, cipher: CipherAlg, icv_len: usize) -> Self {
        Self {
            cipher,
            mode: CipherMode::Cbc,
            auth: AuthAlg::Hmac(hash),
            aead: AeadKind::Generic,
            icv_len,
        }
    }

    const fn aead(mode: CipherMode, auth: AuthAlg, aead: AeadKind, icv_len: usize) -> Self {
        Self {
            cipher: CipherAlg::Aes,
            mode,
            auth,
            aead,
            icv_len,
        }
    }

    /// Bytes of IV a request must carry.
    pub fn iv_len(&self) -> usize {
        let esp = self.aead == AeadKind::IpsecEsp;
        match self.mode {
            CipherMode::Ecb => 0,
            CipherMode::Cbc | CipherMode::Ofb | CipherMode::Cfb => self.cipher.block_size(),
            CipherMode::Ctr | CipherMode::Gmac => 8,
            CipherMode::Gcm if esp => 8,
            CipherMode::Gcm => 12,
            CipherMode::Ccm if esp => 8,
            CipherMode::Ccm => 16,
        }
    }

    /// Bytes of nonce or salt taken from the tail of the key.
    pub fn nonce_len(&self) -> usize {
        match (self.mode, self.aead) {
            (CipherMode::Ctr, _) => 4,
            (CipherMode::Gcm | CipherMode::Gmac, AeadKind::IpsecEsp) => 4,
            (CipherMode::Ccm, AeadKind::IpsecEsp) => 3,
            _ => 0,
        }
    }

    /// Tag bytes appended on encrypt and checked on decrypt.
    pub fn digest_len(&self) -> usize {
        match self.auth {
            AuthAlg::None => 0,
            _ => self.icv_len,
        }
    }

    /// Whether the associated data is copied out of the packet and carried
    /// in the token.
    pub(crate) fn splits_aad(&self) -> bool {
        self.mode == CipherMode::Ccm
            || (self.mode == CipherMode::Gcm && self.aead == AeadKind::IpsecEsp)
    }

    fn validate(&self) -> Result<()> {
        let auth_matches = match self.mode {
            CipherMode::Gcm => self.auth == AuthAlg::Gcm,
            CipherMode::Gmac => self.auth == AuthAlg::Gmac,
            CipherMode::Ccm => self.auth == AuthAlg::Ccm,
            CipherMode::Cbc => matches!(self.auth, AuthAlg::None | AuthAlg::Hmac(_)),
            _ => self.auth == AuthAlg::None,
        };
        if !auth_matches {
            return Err(Error::build(format!(
                "{:?} cannot be combined with {:?}",
                self.auth, self.mode
            )));
        }
        if (self.auth == AuthAlg::None) != (self.aead == AeadKind::None) {
            return Err(Error::build("AEAD flavour does not match the auth algorithm"));
        }
        let icv_ok = match self.auth {
            AuthAlg::None => self.icv_len == 0,
            AuthAlg::Gcm => matches!(self.icv_len, 4 | 8 | 12..=16),
            AuthAlg::Gmac => self.icv_len == 16,
            AuthAlg::Ccm => (4..=16).contains(&self.icv_len) && self.icv_len % 2 == 0,
            AuthAlg::Hmac(alg) => self.icv_len > 0 && self.icv_len <= alg.digest_size(),
        };
        if !icv_ok {
            return Err(Error::build(format!("invalid ICV length {}", self.icv_len)));
        }
        if self.aead == AeadKind::IpsecEsp
            && self.mode == CipherMode::Gcm
            && !matches!(self.icv_len, 8 | 12 | 16)
        {
            return Err(Error::build("rfc4106 ICV must be 8, 12 or 16 bytes"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct KeyState {
    cipher_key: Vec<u8>,
    nonce: Vec<u8>,
    auth_key1: Vec<u8>,
    auth_key2: Vec<u8>,
    keyed: bool,
    slots: EngineSlots,
}

/// A cipher / AEAD transform instance.
///
/// Hardware state is built lazily per direction on first use and dropped
/// whenever the key changes. The context is pinned to one ring, chosen on
/// first use.
pub struct CipherContext {
    spec: CipherSpec,
    ring: OnceLock<RingId>,
    keys: Mutex<KeyState>,
}

impl CipherContext {
    pub fn new(spec: CipherSpec) -> Result<Arc<Self>> {
        spec.validate()?;
        Ok(Arc::new(Self {
            spec,
            ring: OnceLock::new(),
            keys: Mutex::new(KeyState::default()),
        }))
    }

    pub fn spec(&self) -> &CipherSpec {
        &self.spec
    }

    pub fn is_keyed(&self) -> bool {
        self.keys.lock().keyed
    }

    /// The context's ring, chosen round-robin on first use.
    pub(crate) fn ring(&self, shared: &Shared) -> RingId {
        *self.ring.get_or_init(|| shared.rings.select())
    }

    #[instrument(skip_all, fields(mode = ?self.spec.mode))]
    pub(crate) fn set_key(&self, shared: &Shared, key: &[u8], auth_key: Option<&[u8]>) -> Result<()> {
        let spec = self.spec;
        let nonce_len = spec.nonce_len();
        if key.len() < nonce_len {
            return Err(Error::build("key shorter than its nonce"));
        }
        let (cipher_key, salt) = key.split_at(key.len() - nonce_len);
        if !spec.cipher.key_len_ok(cipher_key.len()) {
            return Err(Error::build(format!(
                "invalid {:?} key length {}",
                spec.cipher,
                cipher_key.len()
            )));
        }
        let nonce = match (spec.mode, spec.aead) {
            // CCM flags byte for a 4-byte length field, then the salt.
            (CipherMode::Ccm, AeadKind::IpsecEsp) => {
                let mut n = vec![3u8];
                n.extend_from_slice(salt);
                n
            }
            _ => salt.to_vec(),
        };

        let ring = self.ring(shared);
        let (auth_key1, auth_key2) = match spec.auth {
            AuthAlg::Gcm | AuthAlg::Gmac => (hash::gcm_hash_key(shared, ring, cipher_key)?, Vec::new()),
            AuthAlg::Hmac(alg) => {
                let auth_key = auth_key.ok_or_else(|| Error::build("authenc needs an auth key"))?;
                hash::hmac_precompute(shared, ring, alg, auth_key)?
            }
            AuthAlg::Ccm | AuthAlg::None => (Vec::new(), Vec::new()),
        };

        let mut keys = self.keys.lock();
        keys.cipher_key = cipher_key.to_vec();
        keys.nonce = nonce;
        keys.auth_key1 = auth_key1;
        keys.auth_key2 = auth_key2;
        keys.keyed = true;
        rebuild_on_keychange(&mut keys.slots);
        debug!(ring = ring.index(), "key installed");
        Ok(())
    }

    /// The record for `direction`, built on first use, and the key nonce.
    pub(crate) fn engine_data(
        &self,
        shared: &Shared,
        ring: RingId,
        direction: Direction,
    ) -> Result<(Arc<EngineData>, Vec<u8>)> {
        let mut keys = self.keys.lock();
        if !keys.keyed {
            return Err(Error::build("no key set"));
        }
        let cached = match direction {
            Direction::Encrypt => keys.slots.encrypt.clone(),
            Direction::Decrypt => keys.slots.decrypt.clone(),
        };
        if let Some(data) = cached {
            return Ok((data, keys.nonce.clone()));
        }
        let params = self.sa_params(shared, direction, &keys)?;
        let data = build_engine_data(shared, ring, &params)?;
        match direction {
            Direction::Encrypt => keys.slots.encrypt = Some(Arc::clone(&data)),
            Direction::Decrypt => keys.slots.decrypt = Some(Arc::clone(&data)),
        }
        Ok((data, keys.nonce.clone()))
    }

    fn sa_params(&self, shared: &Shared, direction: Direction, keys: &KeyState) -> Result<SaParams> {
        let spec = self.spec;
        let (crypto_alg, crypto_mode) = map_cipher(spec.cipher, spec.mode);
        if crypto_alg == SaCryptoAlg::Null {
            return Err(Error::build(format!(
                "{:?} does not support {:?}",
                spec.cipher, spec.mode
            )));
        }
        let auth_alg = map_auth(spec.auth);
        if spec.auth != AuthAlg::None && auth_alg == SaAuthAlg::Null {
            return Err(Error::build(format!("unsupported auth {:?}", spec.auth)));
        }

        let mut params = shared
            .services
            .sa
            .init(direction.sa(), SaProtocol::Basic)
            .map_err(|e| Error::build(format!("SA init: {e}")))?;
        params.crypto_alg = crypto_alg;
        params.crypto_mode = crypto_mode;
        params.key = keys.cipher_key.clone();
        params.iv_source = IvSource::Token;
        match spec.mode {
            CipherMode::Gcm if spec.aead == AeadKind::IpsecEsp => {
                params.nonce = keys.nonce.clone();
                params.copy_iv = true;
            }
            CipherMode::Gmac | CipherMode::Ccm | CipherMode::Ctr => {
                params.nonce = keys.nonce.clone();
            }
            _ => {}
        }
        params.auth_alg = auth_alg;
        params.auth_key1 = keys.auth_key1.clone();
        params.auth_key2 = keys.auth_key2.clone();
        params.icv_len = spec.digest_len();
        Ok(params)
    }
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext")
            .field("spec", &self.spec)
            .field("ring", &self.ring.get())
            .finish_non_exhaustive()
    }
}

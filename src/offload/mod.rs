//! Tunnel offload lifecycle.
//!
//! IPsec associations and DTLS tunnels hand whole flows to the packet
//! engine's inline path. Their transforms are registered with the
//! classification service rather than a ring; control commands (key
//! precompute, record-cache invalidation) run polled on ring 0.

pub mod dtls;
pub mod ipsec;

use tracing::warn;

use crate::algo::{AuthAlg, HashAlg};
use crate::ddk::{Command, DmaHandle};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::harvest::poll_sync;
use crate::hash::{gcm_hash_key, hmac_precompute};
use crate::job::{Prepared, Resources};
use crate::ring::RingId;

/// Ring that carries offload control commands.
pub(crate) fn control_ring(shared: &Shared) -> Result<RingId> {
    shared.rings.id(0)
}

/// Drop a transform record from the hardware record cache.
pub(crate) fn invalidate_transform(shared: &Shared, sa: DmaHandle) -> Result<()> {
    let ring = control_ring(shared)?;
    let prepared = Prepared {
        command: Command::invalidate(sa),
        resources: Resources::default(),
    };
    poll_sync(shared, ring, prepared)?.into_output()?;
    Ok(())
}

/// Best-effort teardown of a classifier-registered transform: invalidate
/// the cached record, then unregister. The buffer itself is released by
/// its owner.
pub(crate) fn retire_transform(shared: &Shared, sa: DmaHandle) {
    if let Err(e) = invalidate_transform(shared, sa) {
        warn!(sa = sa.0, error = %e, "transform invalidate failed");
    }
    if let Err(e) = shared.services.classifier.transform_unregister(sa) {
        warn!(sa = sa.0, error = %e, "transform unregister failed");
    }
}

/// SA auth keys for an offloaded transform.
pub(crate) fn auth_keys(
    shared: &Shared,
    auth: AuthAlg,
    cipher_key: &[u8],
    auth_key: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let ring = control_ring(shared)?;
    match auth {
        AuthAlg::Gcm | AuthAlg::Gmac => Ok((gcm_hash_key(shared, ring, cipher_key)?, Vec::new())),
        AuthAlg::Hmac(alg) => hmac_precompute(shared, ring, alg, auth_key),
        AuthAlg::Ccm | AuthAlg::None => Ok((Vec::new(), Vec::new())),
    }
}

/// Parse an `hmac(...)` algorithm name.
pub(crate) fn parse_hmac(name: &str) -> Result<HashAlg> {
    match name {
        "hmac(md5)" => Ok(HashAlg::Md5),
        "hmac(sha1)" => Ok(HashAlg::Sha1),
        "hmac(sha256)" => Ok(HashAlg::Sha256),
        "hmac(sha384)" => Ok(HashAlg::Sha384),
        "hmac(sha512)" => Ok(HashAlg::Sha512),
        _ => Err(Error::build(format!("unsupported auth algorithm {name:?}"))),
    }
}

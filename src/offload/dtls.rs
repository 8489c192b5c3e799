//! DTLS / CAPWAP-DTLS tunnel offload.
//!
//! Each tunnel owns an outbound and an inbound SA, both registered with
//! the classifier and reachable through the DTLS flow table. Tunnels live
//! in a fixed-capacity table indexed by [`TunnelId`].

use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::algo::{AuthAlg, CipherAlg, CipherMode, HashAlg, map_auth, map_cipher};
use crate::ddk::{
    DmaHandle, DtlsSaParams, DtlsVersion, FlowSelector, IvSource, SaDirection, SaParams,
    SaProtocol,
};
use crate::dma::DmaBuffer;
use crate::engine::Shared;
use crate::engine_data::build_sa_buffer;
use crate::error::{Error, Result};
use crate::metrics;
use crate::offload::{auth_keys, retire_transform};

/// IP protocol number of UDP.
const IPPROTO_UDP: u8 = 17;

/// Cipher suite of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtlsSecMode {
    Aes128CbcHmacSha1,
    Aes256CbcHmacSha1,
    Aes128CbcHmacSha256,
    Aes256CbcHmacSha256,
    Aes128Gcm,
    Aes256Gcm,
    /// A suite code the hardware has no mapping for.
    Other(u16),
}

impl DtlsSecMode {
    /// Cipher mode, auth algorithm, key length and ICV length.
    fn suite(self) -> Result<(CipherMode, AuthAlg, usize, usize)> {
        let sha1 = AuthAlg::Hmac(HashAlg::Sha1);
        let sha256 = AuthAlg::Hmac(HashAlg::Sha256);
        Ok(match self {
            DtlsSecMode::Aes128CbcHmacSha1 => (CipherMode::Cbc, sha1, 16, 20),
            DtlsSecMode::Aes256CbcHmacSha1 => (CipherMode::Cbc, sha1, 32, 20),
            DtlsSecMode::Aes128CbcHmacSha256 => (CipherMode::Cbc, sha256, 16, 32),
            DtlsSecMode::Aes256CbcHmacSha256 => (CipherMode::Cbc, sha256, 32, 32),
            DtlsSecMode::Aes128Gcm => (CipherMode::Gcm, AuthAlg::Gcm, 16, 16),
            DtlsSecMode::Aes256Gcm => (CipherMode::Gcm, AuthAlg::Gcm, 32, 16),
            DtlsSecMode::Other(code) => {
                return Err(Error::build(format!("unsupported DTLS suite {code:#x}")));
            }
        })
    }
}

/// Keys of one direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DtlsKeys {
    pub cipher: Vec<u8>,
    /// HMAC key; unused for GCM suites.
    pub mac: Vec<u8>,
    /// 4-byte implicit nonce of GCM suites.
    pub nonce: Vec<u8>,
}

/// Parameters of a tunnel, from the local endpoint's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsParams {
    pub version: DtlsVersion,
    pub sec_mode: DtlsSecMode,
    pub epoch: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub capwap: bool,
    pub encrypt: DtlsKeys,
    pub decrypt: DtlsKeys,
}

/// Bounds-checked slot of the tunnel table. Obtained from
/// [`Engine::tunnel_id`](crate::Engine::tunnel_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(u16);

impl TunnelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One registered direction of a tunnel.
#[derive(Debug)]
struct DtlsSa {
    buffer: DmaBuffer,
    registered: bool,
    flow_added: bool,
}

impl DtlsSa {
    fn handle(&self) -> Option<DmaHandle> {
        self.buffer.handle().ok()
    }

    /// Take the SA out of the flow table and the classifier. The buffer is
    /// released separately.
    fn detach(&mut self, shared: &Shared) {
        let Some(handle) = self.handle() else {
            return;
        };
        if self.flow_added {
            self.flow_added = false;
            if let Err(e) = shared.services.classifier.flow_remove(handle) {
                warn!(sa = handle.0, error = %e, "flow remove failed");
            }
        }
        if self.registered {
            self.registered = false;
            retire_transform(shared, handle);
        }
    }
}

#[derive(Debug)]
struct Tunnel {
    outbound: DtlsSa,
    inbound: DtlsSa,
}

impl Tunnel {
    fn tear_down(mut self, shared: &Shared) {
        self.outbound.detach(shared);
        self.inbound.detach(shared);
        self.outbound.buffer.release();
        self.inbound.buffer.release();
    }
}

/// Fixed-capacity tunnel arena.
#[derive(Debug)]
pub(crate) struct TunnelTable {
    slots: Mutex<Vec<Option<Tunnel>>>,
}

impl TunnelTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub(crate) fn id(&self, index: usize) -> Result<TunnelId> {
        if index >= self.slots.lock().len() {
            return Err(Error::InvalidTunnel);
        }
        u16::try_from(index)
            .map(TunnelId)
            .map_err(|_| Error::InvalidTunnel)
    }

    fn take(&self, id: TunnelId) -> Result<Option<Tunnel>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id.index()).ok_or(Error::InvalidTunnel)?;
        Ok(slot.take())
    }

    /// Store a tunnel, handing back any occupant installed meanwhile.
    fn put(&self, id: TunnelId, tunnel: Tunnel) -> Result<Option<Tunnel>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id.index()).ok_or(Error::InvalidTunnel)?;
        Ok(slot.replace(tunnel))
    }

    fn drain(&self) -> Vec<Tunnel> {
        self.slots.lock().iter_mut().filter_map(Option::take).collect()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

fn dtls_params(
    shared: &Shared,
    params: &DtlsParams,
    direction: SaDirection,
) -> Result<SaParams> {
    let (mode, auth, key_len, icv_len) = params.sec_mode.suite()?;
    let keys = match direction {
        SaDirection::Outbound => &params.encrypt,
        SaDirection::Inbound => &params.decrypt,
    };
    if keys.cipher.len() != key_len {
        return Err(Error::build(format!(
            "{:?} needs a {key_len}-byte key, got {}",
            params.sec_mode,
            keys.cipher.len()
        )));
    }
    if mode == CipherMode::Gcm && keys.nonce.len() != 4 {
        return Err(Error::build("GCM suites need a 4-byte nonce"));
    }
    let protocol = SaProtocol::Dtls(DtlsSaParams {
        version: params.version,
        epoch: params.epoch,
        ipv6: params.src.is_ipv6(),
        capwap: params.capwap,
        process_ip_headers: true,
        ext_processing: true,
    });
    let mut sa = shared
        .services
        .sa
        .init(direction, protocol)
        .map_err(|e| Error::build(format!("DTLS SA init: {e}")))?;
    let (crypto_alg, crypto_mode) = map_cipher(CipherAlg::Aes, mode);
    sa.crypto_alg = crypto_alg;
    sa.crypto_mode = crypto_mode;
    sa.key = keys.cipher.clone();
    if mode == CipherMode::Gcm {
        sa.nonce = keys.nonce.clone();
    }
    sa.iv_source = IvSource::Sa;
    sa.auth_alg = map_auth(auth);
    let (key1, key2) = auth_keys(shared, auth, &keys.cipher, &keys.mac)?;
    sa.auth_key1 = key1;
    sa.auth_key2 = key2;
    sa.icv_len = icv_len;
    Ok(sa)
}

/// Flow selector matching the direction's packets. Inbound packets come
/// from the peer, so addresses and ports are swapped.
fn selector(params: &DtlsParams, direction: SaDirection) -> FlowSelector {
    match direction {
        SaDirection::Outbound => FlowSelector {
            src: params.src,
            dst: params.dst,
            src_port: params.src_port,
            dst_port: params.dst_port,
            ip_proto: IPPROTO_UDP,
            epoch: 0,
            spi: 0,
        },
        SaDirection::Inbound => FlowSelector {
            src: params.dst,
            dst: params.src,
            src_port: params.dst_port,
            dst_port: params.src_port,
            ip_proto: IPPROTO_UDP,
            epoch: params.epoch,
            spi: 0,
        },
    }
}

/// Build, register and route one direction. On failure nothing of it
/// remains.
fn install_direction(shared: &Shared, params: &DtlsParams, direction: SaDirection) -> Result<DtlsSa> {
    let classifier = &shared.services.classifier;
    let sa_params = dtls_params(shared, params, direction)?;
    let buffer = build_sa_buffer(shared, &sa_params)?;
    let handle = buffer
        .handle()
        .map_err(|e| Error::register("DTLS transform", e))?;
    classifier
        .transform_register(handle)
        .map_err(|e| Error::register("DTLS transform", e))?;
    let mut sa = DtlsSa {
        buffer,
        registered: true,
        flow_added: false,
    };

    let routed = classifier
        .flow_hash(&selector(params, direction))
        .and_then(|hash| classifier.flow_add(&hash, handle));
    if let Err(e) = routed {
        sa.detach(shared);
        sa.buffer.release();
        return Err(Error::register("DTLS flow", e));
    }
    sa.flow_added = true;
    Ok(sa)
}

/// Install a tunnel into `id`, replacing any occupant.
#[instrument(skip(shared, params), fields(tunnel = id.index()))]
pub(crate) fn install(shared: &Shared, id: TunnelId, params: &DtlsParams) -> Result<()> {
    if let Some(occupant) = shared.dtls.take(id)? {
        debug!("replacing installed tunnel");
        occupant.tear_down(shared);
        metrics::DTLS_REMOVED.increment();
    }

    let built = install_direction(shared, params, SaDirection::Outbound).and_then(|mut outbound| {
        match install_direction(shared, params, SaDirection::Inbound) {
            Ok(inbound) => Ok(Tunnel { outbound, inbound }),
            Err(e) => {
                outbound.detach(shared);
                outbound.buffer.release();
                Err(e)
            }
        }
    });
    let tunnel = match built {
        Ok(tunnel) => tunnel,
        Err(e) => {
            metrics::OFFLOAD_INSTALL_FAILURES.increment();
            warn!(error = %e, "tunnel install failed");
            return Err(e);
        }
    };

    if let Some(raced) = shared.dtls.put(id, tunnel)? {
        raced.tear_down(shared);
        metrics::DTLS_REMOVED.increment();
    }
    metrics::DTLS_INSTALLED.increment();
    info!("tunnel installed");
    Ok(())
}

/// Remove the tunnel in `id`. Returns false for an empty slot.
#[instrument(skip(shared), fields(tunnel = id.index()))]
pub(crate) fn remove(shared: &Shared, id: TunnelId) -> Result<bool> {
    let Some(tunnel) = shared.dtls.take(id)? else {
        return Ok(false);
    };
    tunnel.tear_down(shared);
    metrics::DTLS_REMOVED.increment();
    info!("tunnel removed");
    Ok(true)
}

pub(crate) fn tear_down_all(shared: &Shared) -> usize {
    let tunnels = shared.dtls.drain();
    let count = tunnels.len();
    for tunnel in tunnels {
        tunnel.tear_down(shared);
        metrics::DTLS_REMOVED.increment();
    }
    if count > 0 {
        info!(count, "tunnels torn down");
    }
    count
}

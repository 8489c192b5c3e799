//! Contract of the accelerator driver library.
//!
//! The SA builder, token builder, DMA buffer service, packet engine and
//! classification/CDRT service are consumed as opaque collaborators. The
//! pipeline only talks to them through the traits in this module; the
//! [`sim`](crate::sim) module provides a software implementation.

use std::net::IpAddr;
use std::sync::Arc;

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::dispatch::Wakeup;

/// Alignment requested for every DMA buffer.
pub const DMA_ALIGNMENT: usize = 4;

/// Words in a result descriptor's output token.
pub const OUTPUT_TOKEN_WORDS: usize = 4;

/// Status reported by the driver library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DdkError {
    #[error("out of memory")]
    NoMemory,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("unsupported")]
    Unsupported,
    #[error("busy")]
    Busy,
    #[error("out of range")]
    OutOfRange,
}

// ── DMA buffers ─────────────────────────────────────────────────────

/// Opaque handle to a DMA-safe buffer or particle list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaHandle(pub u64);

/// Memory bank a buffer is allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Transform,
    Token,
    Packet,
}

/// Allocation properties for [`DmaService::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaProperties {
    pub size: usize,
    pub alignment: usize,
    pub bank: Bank,
    pub cached: bool,
}

impl DmaProperties {
    pub fn new(bank: Bank, size: usize) -> Self {
        Self {
            size,
            alignment: DMA_ALIGNMENT,
            bank,
            cached: true,
        }
    }
}

/// DMA buffer service.
///
/// Particle lists are scatter-gather buffers; `read`/`write` address them
/// as one contiguous byte range across their particles.
pub trait DmaService: Send + Sync {
    fn alloc(&self, props: DmaProperties) -> Result<DmaHandle, DdkError>;
    fn release(&self, handle: DmaHandle) -> Result<(), DdkError>;
    fn write(&self, handle: DmaHandle, offset: usize, data: &[u8]) -> Result<(), DdkError>;
    fn read(&self, handle: DmaHandle, offset: usize, out: &mut [u8]) -> Result<(), DdkError>;
    /// Device-visible address of a buffer, as written into routing tables.
    fn bus_address(&self, handle: DmaHandle) -> Result<u64, DdkError>;
    fn alloc_particles(&self, lens: &[usize]) -> Result<DmaHandle, DdkError>;
    fn release_particles(&self, list: DmaHandle) -> Result<(), DdkError>;
}

// ── SA builder ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SaDirection {
    Outbound = 0,
    Inbound = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SaCryptoAlg {
    Null = 0,
    Aes = 1,
    Des = 2,
    TripleDes = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SaCryptoMode {
    /// No chaining; the builder's "null" mode.
    Basic = 0,
    Ecb = 1,
    Cbc = 2,
    Ofb = 3,
    Cfb = 4,
    Ctr = 5,
    Gcm = 6,
    Gmac = 7,
    Ccm = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SaAuthAlg {
    Null = 0,
    HashSha1 = 1,
    HashSha224 = 2,
    HashSha256 = 3,
    HashSha384 = 4,
    HashSha512 = 5,
    HashMd5 = 6,
    HmacSha1 = 7,
    HmacSha224 = 8,
    HmacSha256 = 9,
    HmacSha384 = 10,
    HmacSha512 = 11,
    HmacMd5 = 12,
    AesGcm = 13,
    AesGmac = 14,
    AesCcm = 15,
    AesXcbc = 16,
    AesCmac128 = 17,
    AesCmac192 = 18,
    AesCmac256 = 19,
}

/// Where the hardware takes the IV from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSource {
    Token,
    Sa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecMode {
    Tunnel,
    Transport,
}

/// ESP protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspParams {
    pub spi: u32,
    pub mode: IpsecMode,
    pub ipv6: bool,
    /// NAT-T UDP encapsulation ports (source, destination).
    pub nat_t: Option<(u16, u16)>,
    /// Outer addresses, tunnel mode only.
    pub tunnel: Option<(IpAddr, IpAddr)>,
    pub process_ip_headers: bool,
    pub ext_processing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtlsVersion {
    V1_0,
    V1_2,
}

/// DTLS / CAPWAP-DTLS protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsSaParams {
    pub version: DtlsVersion,
    pub epoch: u16,
    pub ipv6: bool,
    pub capwap: bool,
    pub process_ip_headers: bool,
    pub ext_processing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaProtocol {
    Basic,
    Esp(EspParams),
    Dtls(DtlsSaParams),
}

/// Builder parameter block, obtained from [`SaBuilder::init`] and filled in
/// by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaParams {
    pub direction: SaDirection,
    pub protocol: SaProtocol,
    pub crypto_alg: SaCryptoAlg,
    pub crypto_mode: SaCryptoMode,
    pub key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub iv_source: IvSource,
    pub copy_iv: bool,
    pub auth_alg: SaAuthAlg,
    /// Inner digest state, GCM hash key, or intermediate hash state.
    pub auth_key1: Vec<u8>,
    /// Outer digest state.
    pub auth_key2: Vec<u8>,
    pub icv_len: usize,
    /// Bytes already hashed into `auth_key1` when continuing a hash.
    pub digest_count: u64,
}

pub trait SaBuilder: Send + Sync {
    fn init(&self, direction: SaDirection, protocol: SaProtocol) -> Result<SaParams, DdkError>;
    fn size_words(&self, params: &SaParams) -> Result<usize, DdkError>;
    fn build(&self, params: &SaParams, sa: &mut [u32]) -> Result<(), DdkError>;
    fn register(&self, ring: usize, sa: DmaHandle) -> Result<(), DdkError>;
    fn unregister(&self, ring: usize, sa: DmaHandle) -> Result<(), DdkError>;
}

// ── Token builder ───────────────────────────────────────────────────

/// Hash chaining flags for multi-part hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashChain {
    /// Start from the algorithm IV instead of the SA's saved state.
    pub first: bool,
    /// Pad and produce the final digest.
    pub last: bool,
}

/// Per-packet token parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenParams<'a> {
    pub iv: &'a [u8],
    /// Private copy of the associated data when it is not in the packet.
    pub aad: &'a [u8],
    /// Number of associated-data bytes to authenticate.
    pub aad_len: usize,
    /// Bytes of packet data the token processes.
    pub packet_len: usize,
    pub hash: HashChain,
}

/// Token builder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub words: usize,
    pub header: u32,
}

pub trait TokenBuilder: Send + Sync {
    fn context_size_words(&self, params: &SaParams) -> Result<usize, DdkError>;
    fn build_context(&self, params: &SaParams, ctx: &mut [u32]) -> Result<(), DdkError>;
    fn token_size_words(&self, ctx: &[u32], params: &TokenParams<'_>) -> Result<usize, DdkError>;
    fn build_token(
        &self,
        ctx: &[u32],
        params: &TokenParams<'_>,
        out: &mut [u32],
    ) -> Result<TokenInfo, DdkError>;
}

// ── Packet engine ───────────────────────────────────────────────────

/// Hardware service requested by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwService {
    Packet,
    /// Drop a transform record from the hardware record cache.
    InvalidateTransform,
}

/// Command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Application id echoed back in the output token.
    pub id: u64,
    pub service: HwService,
    pub token: Option<DmaHandle>,
    pub token_words: usize,
    pub token_header: u32,
    pub sa: Option<DmaHandle>,
    pub src: Option<DmaHandle>,
    pub src_len: usize,
    pub dst: Option<DmaHandle>,
    pub dst_len: usize,
}

impl Command {
    pub(crate) fn packet() -> Self {
        Self {
            id: 0,
            service: HwService::Packet,
            token: None,
            token_words: 0,
            token_header: 0,
            sa: None,
            src: None,
            src_len: 0,
            dst: None,
            dst_len: 0,
        }
    }

    pub(crate) fn invalidate(sa: DmaHandle) -> Self {
        Self {
            service: HwService::InvalidateTransform,
            sa: Some(sa),
            ..Self::packet()
        }
    }
}

/// Result descriptor returned by [`PacketEngine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultDescriptor {
    pub output_token: [u32; OUTPUT_TOKEN_WORDS],
}

/// One-shot completion notification for a ring.
///
/// The packet engine calls [`Notifier::notify`] once results are available
/// after [`PacketEngine::register_notify`].
#[derive(Debug, Clone)]
pub struct Notifier {
    ring: usize,
    tx: Sender<Wakeup>,
}

impl Notifier {
    pub(crate) fn new(ring: usize, tx: Sender<Wakeup>) -> Self {
        Self { ring, tx }
    }

    pub fn ring(&self) -> usize {
        self.ring
    }

    pub fn notify(self) {
        // The receiver is gone once the engine shuts down.
        let _ = self.tx.send(Wakeup::ResultsReady);
    }
}

pub trait PacketEngine: Send + Sync {
    fn ring_count(&self) -> usize;
    /// Submit commands; returns how many were accepted.
    fn submit(&self, ring: usize, commands: &[Command]) -> Result<usize, DdkError>;
    fn poll(&self, ring: usize) -> Result<Option<ResultDescriptor>, DdkError>;
    fn register_notify(&self, ring: usize, notifier: Notifier) -> Result<(), DdkError>;
}

// ── Classification / routing table ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdrtKind {
    Encrypt,
    Decrypt,
}

/// Context/routing-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdrtEntry {
    pub index: u16,
    pub kind: CdrtKind,
}

/// Transform record layout referenced by a CDRT descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformRecord {
    Small,
    Large,
}

impl TransformRecord {
    /// Type bits or-ed into the low word of the transform address.
    pub const fn bits(self) -> u32 {
        match self {
            TransformRecord::Small => 0x2,
            TransformRecord::Large => 0x3,
        }
    }
}

/// CDRT descriptor contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CdrtDescriptor {
    pub desc_type: u8,
    pub token_len: u8,
    pub transform: [u32; 2],
    pub hw_service: u8,
    pub allow_pad: bool,
    pub strip_pad: bool,
}

impl CdrtDescriptor {
    pub const CLEARED: CdrtDescriptor = CdrtDescriptor {
        desc_type: 0,
        token_len: 0,
        transform: [0, 0],
        hw_service: 0,
        allow_pad: false,
        strip_pad: false,
    };

    pub fn is_cleared(&self) -> bool {
        *self == Self::CLEARED
    }
}

/// Layer-4 match of an inbound classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Match {
    Esp,
    /// UDP-encapsulated ESP on the given destination port.
    NatT { dport: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierRule {
    pub cdrt_index: u16,
    pub spi: u32,
    pub l4: L4Match,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleHandle(pub u32);

/// Packet selector hashed into the DTLS flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSelector {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_proto: u8,
    pub epoch: u16,
    pub spi: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHash(pub [u32; 4]);

pub trait Classifier: Send + Sync {
    fn cdrt_alloc(&self, kind: CdrtKind) -> Result<CdrtEntry, DdkError>;
    fn cdrt_write(&self, entry: &CdrtEntry, desc: &CdrtDescriptor) -> Result<(), DdkError>;
    fn cdrt_free(&self, entry: CdrtEntry);
    fn rule_install(&self, rule: &ClassifierRule) -> Result<RuleHandle, DdkError>;
    fn rule_remove(&self, rule: RuleHandle);
    fn transform_register(&self, sa: DmaHandle) -> Result<(), DdkError>;
    fn transform_unregister(&self, sa: DmaHandle) -> Result<(), DdkError>;
    fn flow_hash(&self, selector: &FlowSelector) -> Result<FlowHash, DdkError>;
    fn flow_add(&self, hash: &FlowHash, sa: DmaHandle) -> Result<(), DdkError>;
    fn flow_remove(&self, sa: DmaHandle) -> Result<(), DdkError>;
}

/// The set of driver services the engine runs on.
#[derive(Clone)]
pub struct Services {
    pub dma: Arc<dyn DmaService>,
    pub sa: Arc<dyn SaBuilder>,
    pub token: Arc<dyn TokenBuilder>,
    pub packet: Arc<dyn PacketEngine>,
    pub classifier: Arc<dyn Classifier>,
}

// SA and token images of the software engine.
//
// Images are a byte stream packed little-endian into words, prefixed by a
// word holding the stream length. The packet engine decodes them back from
// DMA memory when it executes a command.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::ddk::{
    DdkError, DmaHandle, DtlsSaParams, DtlsVersion, EspParams, HashChain, IpsecMode, IvSource,
    SaAuthAlg, SaBuilder, SaCryptoAlg, SaCryptoMode, SaDirection, SaParams, SaProtocol,
    TokenBuilder, TokenInfo, TokenParams,
};

use super::{Call, Sim};

const CONTEXT_MAGIC: u32 = 0x5458_4331; // "TXC1"
const CONTEXT_WORDS: usize = 5;

// ── Byte codec ──────────────────────────────────────────────────────

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn bool(&mut self, v: bool) {
        self.0.push(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
    }

    fn ip(&mut self, ip: &IpAddr) {
        match ip {
            IpAddr::V4(a) => {
                self.u8(4);
                self.0.extend_from_slice(&a.octets());
            }
            IpAddr::V6(a) => {
                self.u8(6);
                self.0.extend_from_slice(&a.octets());
            }
        }
    }

    /// Length-prefixed word image.
    fn into_words(self) -> Vec<u32> {
        let mut words = Vec::with_capacity(1 + self.0.len().div_ceil(4));
        words.push(self.0.len() as u32);
        words.extend(self.0.chunks(4).map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(w)
        }));
        words
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Open a length-prefixed image read back from memory.
    fn image(mem: &'a [u8]) -> Result<Self, DdkError> {
        let len = mem
            .get(..4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) as usize)
            .ok_or(DdkError::InvalidParameter)?;
        let buf = mem.get(4..4 + len).ok_or(DdkError::InvalidParameter)?;
        Ok(Self { buf })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DdkError> {
        if self.buf.len() < n {
            return Err(DdkError::InvalidParameter);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DdkError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DdkError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, DdkError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DdkError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DdkError> {
        let b = self.take(8)?;
        let mut w = [0u8; 8];
        w.copy_from_slice(b);
        Ok(u64::from_le_bytes(w))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DdkError> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    fn ip(&mut self) -> Result<IpAddr, DdkError> {
        match self.u8()? {
            4 => {
                let b = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            6 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(self.take(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(o)))
            }
            _ => Err(DdkError::InvalidParameter),
        }
    }
}

fn crypto_alg(v: u8) -> Result<SaCryptoAlg, DdkError> {
    Ok(match v {
        0 => SaCryptoAlg::Null,
        1 => SaCryptoAlg::Aes,
        2 => SaCryptoAlg::Des,
        3 => SaCryptoAlg::TripleDes,
        _ => return Err(DdkError::InvalidParameter),
    })
}

fn crypto_mode(v: u8) -> Result<SaCryptoMode, DdkError> {
    use SaCryptoMode::*;
    const ALL: [SaCryptoMode; 9] = [Basic, Ecb, Cbc, Ofb, Cfb, Ctr, Gcm, Gmac, Ccm];
    ALL.into_iter()
        .find(|m| *m as u8 == v)
        .ok_or(DdkError::InvalidParameter)
}

fn auth_alg(v: u8) -> Result<SaAuthAlg, DdkError> {
    use SaAuthAlg::*;
    const ALL: [SaAuthAlg; 20] = [
        Null, HashSha1, HashSha224, HashSha256, HashSha384, HashSha512, HashMd5, HmacSha1,
        HmacSha224, HmacSha256, HmacSha384, HmacSha512, HmacMd5, AesGcm, AesGmac, AesCcm, AesXcbc,
        AesCmac128, AesCmac192, AesCmac256,
    ];
    ALL.into_iter()
        .find(|a| *a as u8 == v)
        .ok_or(DdkError::InvalidParameter)
}

fn direction(v: u8) -> Result<SaDirection, DdkError> {
    match v {
        0 => Ok(SaDirection::Outbound),
        1 => Ok(SaDirection::Inbound),
        _ => Err(DdkError::InvalidParameter),
    }
}

// ── SA image ────────────────────────────────────────────────────────

fn check_sa(params: &SaParams) -> Result<(), DdkError> {
    let key_ok = match params.crypto_alg {
        SaCryptoAlg::Null => params.crypto_mode == SaCryptoMode::Basic,
        SaCryptoAlg::Aes => matches!(params.key.len(), 16 | 24 | 32),
        SaCryptoAlg::Des => params.key.len() == 8,
        SaCryptoAlg::TripleDes => params.key.len() == 24,
    };
    if !key_ok {
        return Err(DdkError::InvalidParameter);
    }
    if params.crypto_alg != SaCryptoAlg::Null && params.crypto_mode == SaCryptoMode::Basic {
        return Err(DdkError::InvalidParameter);
    }
    let auth_ok = match params.auth_alg {
        SaAuthAlg::AesGcm | SaAuthAlg::AesGmac => params.auth_key1.len() == 16,
        SaAuthAlg::HmacMd5
        | SaAuthAlg::HmacSha1
        | SaAuthAlg::HmacSha224
        | SaAuthAlg::HmacSha256
        | SaAuthAlg::HmacSha384
        | SaAuthAlg::HmacSha512 => !params.auth_key1.is_empty() && !params.auth_key2.is_empty(),
        _ => true,
    };
    if !auth_ok {
        return Err(DdkError::InvalidParameter);
    }
    Ok(())
}

fn encode_sa(params: &SaParams) -> Writer {
    let mut w = Writer::default();
    w.u8(params.direction as u8);
    match &params.protocol {
        SaProtocol::Basic => w.u8(0),
        SaProtocol::Esp(esp) => {
            w.u8(1);
            w.u32(esp.spi);
            w.bool(esp.mode == IpsecMode::Tunnel);
            w.bool(esp.ipv6);
            w.bool(esp.nat_t.is_some());
            if let Some((sport, dport)) = esp.nat_t {
                w.u16(sport);
                w.u16(dport);
            }
            w.bool(esp.tunnel.is_some());
            if let Some((src, dst)) = &esp.tunnel {
                w.ip(src);
                w.ip(dst);
            }
            w.bool(esp.process_ip_headers);
            w.bool(esp.ext_processing);
        }
        SaProtocol::Dtls(dtls) => {
            w.u8(2);
            w.bool(dtls.version == DtlsVersion::V1_2);
            w.u16(dtls.epoch);
            w.bool(dtls.ipv6);
            w.bool(dtls.capwap);
            w.bool(dtls.process_ip_headers);
            w.bool(dtls.ext_processing);
        }
    }
    w.u8(params.crypto_alg as u8);
    w.u8(params.crypto_mode as u8);
    w.bytes(&params.key);
    w.bytes(&params.nonce);
    w.bool(params.iv_source == IvSource::Sa);
    w.bool(params.copy_iv);
    w.u8(params.auth_alg as u8);
    w.bytes(&params.auth_key1);
    w.bytes(&params.auth_key2);
    w.u32(params.icv_len as u32);
    w.u64(params.digest_count);
    w
}

/// Decode an SA image read back from its buffer.
pub(crate) fn decode_sa(mem: &[u8]) -> Result<SaParams, DdkError> {
    let mut r = Reader::image(mem)?;
    let direction = direction(r.u8()?)?;
    let protocol = match r.u8()? {
        0 => SaProtocol::Basic,
        1 => {
            let spi = r.u32()?;
            let mode = if r.bool()? {
                IpsecMode::Tunnel
            } else {
                IpsecMode::Transport
            };
            let ipv6 = r.bool()?;
            let nat_t = if r.bool()? {
                Some((r.u16()?, r.u16()?))
            } else {
                None
            };
            let tunnel = if r.bool()? {
                Some((r.ip()?, r.ip()?))
            } else {
                None
            };
            SaProtocol::Esp(EspParams {
                spi,
                mode,
                ipv6,
                nat_t,
                tunnel,
                process_ip_headers: r.bool()?,
                ext_processing: r.bool()?,
            })
        }
        2 => SaProtocol::Dtls(DtlsSaParams {
            version: if r.bool()? {
                DtlsVersion::V1_2
            } else {
                DtlsVersion::V1_0
            },
            epoch: r.u16()?,
            ipv6: r.bool()?,
            capwap: r.bool()?,
            process_ip_headers: r.bool()?,
            ext_processing: r.bool()?,
        }),
        _ => return Err(DdkError::InvalidParameter),
    };
    Ok(SaParams {
        direction,
        protocol,
        crypto_alg: crypto_alg(r.u8()?)?,
        crypto_mode: crypto_mode(r.u8()?)?,
        key: r.bytes()?,
        nonce: r.bytes()?,
        iv_source: if r.bool()? { IvSource::Sa } else { IvSource::Token },
        copy_iv: r.bool()?,
        auth_alg: auth_alg(r.u8()?)?,
        auth_key1: r.bytes()?,
        auth_key2: r.bytes()?,
        icv_len: r.u32()? as usize,
        digest_count: r.u64()?,
    })
}

impl SaBuilder for Sim {
    fn init(&self, direction: SaDirection, protocol: SaProtocol) -> Result<SaParams, DdkError> {
        Ok(SaParams {
            direction,
            protocol,
            crypto_alg: SaCryptoAlg::Null,
            crypto_mode: SaCryptoMode::Basic,
            key: Vec::new(),
            nonce: Vec::new(),
            iv_source: IvSource::Token,
            copy_iv: false,
            auth_alg: SaAuthAlg::Null,
            auth_key1: Vec::new(),
            auth_key2: Vec::new(),
            icv_len: 0,
            digest_count: 0,
        })
    }

    fn size_words(&self, params: &SaParams) -> Result<usize, DdkError> {
        check_sa(params)?;
        Ok(1 + encode_sa(params).0.len().div_ceil(4))
    }

    fn build(&self, params: &SaParams, sa: &mut [u32]) -> Result<(), DdkError> {
        check_sa(params)?;
        let words = encode_sa(params).into_words();
        let out = sa.get_mut(..words.len()).ok_or(DdkError::OutOfRange)?;
        out.copy_from_slice(&words);
        Ok(())
    }

    fn register(&self, ring: usize, sa: DmaHandle) -> Result<(), DdkError> {
        if ring >= self.rings.len() {
            return Err(DdkError::OutOfRange);
        }
        if self.faults.lock().fail_sa_register {
            return Err(DdkError::NoMemory);
        }
        let mut state = self.state.lock();
        if !state.is_live(sa) {
            return Err(DdkError::InvalidHandle);
        }
        state.registered.insert((ring, sa));
        state.calls.push(Call::SaRegister(ring, sa));
        Ok(())
    }

    fn unregister(&self, ring: usize, sa: DmaHandle) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        if !state.registered.remove(&(ring, sa)) {
            return Err(DdkError::InvalidHandle);
        }
        state.calls.push(Call::SaUnregister(ring, sa));
        Ok(())
    }
}

// ── Token images ────────────────────────────────────────────────────

/// Token fields the packet engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) iv: Vec<u8>,
    pub(crate) aad: Vec<u8>,
    pub(crate) aad_len: usize,
    pub(crate) packet_len: usize,
    pub(crate) hash: HashChain,
}

fn encode_token(params: &TokenParams<'_>) -> Writer {
    let mut w = Writer::default();
    w.bytes(params.iv);
    w.bytes(params.aad);
    w.u32(params.aad_len as u32);
    w.u32(params.packet_len as u32);
    w.bool(params.hash.first);
    w.bool(params.hash.last);
    w
}

pub(crate) fn decode_token(mem: &[u8]) -> Result<Token, DdkError> {
    let mut r = Reader::image(mem)?;
    Ok(Token {
        iv: r.bytes()?,
        aad: r.bytes()?,
        aad_len: r.u32()? as usize,
        packet_len: r.u32()? as usize,
        hash: HashChain {
            first: r.bool()?,
            last: r.bool()?,
        },
    })
}

fn check_context(ctx: &[u32]) -> Result<(), DdkError> {
    match ctx.first() {
        Some(&CONTEXT_MAGIC) if ctx.len() >= CONTEXT_WORDS => Ok(()),
        _ => Err(DdkError::InvalidParameter),
    }
}

impl TokenBuilder for Sim {
    fn context_size_words(&self, _params: &SaParams) -> Result<usize, DdkError> {
        Ok(CONTEXT_WORDS)
    }

    fn build_context(&self, params: &SaParams, ctx: &mut [u32]) -> Result<(), DdkError> {
        let out = ctx.get_mut(..CONTEXT_WORDS).ok_or(DdkError::OutOfRange)?;
        out.copy_from_slice(&[
            CONTEXT_MAGIC,
            params.direction as u32,
            params.crypto_mode as u32,
            params.auth_alg as u32,
            params.icv_len as u32,
        ]);
        Ok(())
    }

    fn token_size_words(&self, ctx: &[u32], params: &TokenParams<'_>) -> Result<usize, DdkError> {
        check_context(ctx)?;
        Ok(1 + encode_token(params).0.len().div_ceil(4))
    }

    fn build_token(
        &self,
        ctx: &[u32],
        params: &TokenParams<'_>,
        out: &mut [u32],
    ) -> Result<TokenInfo, DdkError> {
        check_context(ctx)?;
        let words = encode_token(params).into_words();
        let dst = out.get_mut(..words.len()).ok_or(DdkError::OutOfRange)?;
        dst.copy_from_slice(&words);
        Ok(TokenInfo {
            words: words.len(),
            header: params.packet_len as u32 & 0x1_FFFF,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn esp_image_decodes_back() {
        let sim = Sim::new(1);
        let esp = EspParams {
            spi: 0x1234,
            mode: IpsecMode::Tunnel,
            ipv6: false,
            nat_t: Some((4500, 4500)),
            tunnel: Some(("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap())),
            process_ip_headers: true,
            ext_processing: true,
        };
        let mut params = sim.init(SaDirection::Inbound, SaProtocol::Esp(esp)).unwrap();
        params.crypto_alg = SaCryptoAlg::Aes;
        params.crypto_mode = SaCryptoMode::Gcm;
        params.key = vec![1; 16];
        params.nonce = vec![2; 4];
        params.auth_alg = SaAuthAlg::AesGcm;
        params.auth_key1 = vec![3; 16];
        params.icv_len = 16;

        let mut image = vec![0u32; sim.size_words(&params).unwrap() + 8];
        sim.build(&params, &mut image).unwrap();
        assert_eq!(decode_sa(&bytes_of(&image)).unwrap(), params);
    }

    #[test]
    fn null_cipher_needs_basic_mode() {
        let sim = Sim::new(1);
        let mut params = sim.init(SaDirection::Outbound, SaProtocol::Basic).unwrap();
        params.crypto_mode = SaCryptoMode::Cbc;
        assert_eq!(sim.size_words(&params), Err(DdkError::InvalidParameter));
    }

    #[test]
    fn short_buffer_is_out_of_range() {
        let sim = Sim::new(1);
        let params = sim.init(SaDirection::Outbound, SaProtocol::Basic).unwrap();
        let mut image = [0u32; 2];
        assert_eq!(sim.build(&params, &mut image), Err(DdkError::OutOfRange));
    }

    #[test]
    fn token_needs_a_built_context() {
        let sim = Sim::new(1);
        let params = TokenParams {
            iv: &[9; 16],
            packet_len: 32,
            ..TokenParams::default()
        };
        assert!(sim.token_size_words(&[0; 5], &params).is_err());

        let sa = sim.init(SaDirection::Outbound, SaProtocol::Basic).unwrap();
        let mut ctx = vec![0u32; sim.context_size_words(&sa).unwrap()];
        sim.build_context(&sa, &mut ctx).unwrap();
        let mut out = vec![0u32; sim.token_size_words(&ctx, &params).unwrap()];
        let info = sim.build_token(&ctx, &params, &mut out).unwrap();
        assert_eq!(info.words, out.len());
        let token = decode_token(&bytes_of(&out)).unwrap();
        assert_eq!(token.iv, vec![9; 16]);
        assert_eq!(token.packet_len, 32);
    }
}

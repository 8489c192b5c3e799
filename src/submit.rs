//! Submission path for cipher and AEAD requests.
//!
//! Builds the source/destination particle lists, the per-packet token and
//! the command for one request, and post-processes its result.

use std::sync::Arc;

use bytes::Bytes;

use crate::algo::{AeadKind, CipherMode};
use crate::completion::OutputToken;
use crate::context::{CipherContext, CipherSpec, Direction};
use crate::ddk::{Command, TokenParams};
use crate::dma::DmaBuffer;
use crate::engine::Shared;
use crate::engine_data::build_token;
use crate::error::{Error, Result};
use crate::job::{Harvest, Job, Prepared, Resources};
use crate::request::{CipherOutput, CipherRequest, Reply};
use crate::ring::RingId;

/// Bytes of explicit IV an ESP associated-data block ends with.
const ESP_IV_LEN: usize = 8;

/// Lengths derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lengths {
    assoclen: usize,
    /// Payload bytes, excluding the tag.
    payload: usize,
    totlen_src: usize,
    totlen_dst: usize,
}

fn lengths(spec: &CipherSpec, req: &CipherRequest) -> Result<Lengths> {
    let available = req.src_len();
    let cryptlen = req
        .cryptlen
        .unwrap_or_else(|| available.saturating_sub(req.assoclen));
    let totlen_src = req
        .assoclen
        .checked_add(cryptlen)
        .ok_or_else(|| Error::build("request length overflows"))?;
    if available < totlen_src {
        return Err(Error::build(format!(
            "source holds {available} bytes, request needs {totlen_src}"
        )));
    }
    let digest = spec.digest_len();
    let (payload, totlen_dst) = match req.direction {
        Direction::Encrypt => (cryptlen, totlen_src + digest),
        Direction::Decrypt => {
            let payload = cryptlen
                .checked_sub(digest)
                .ok_or_else(|| Error::build("ciphertext shorter than its tag"))?;
            (payload, totlen_src - digest)
        }
    };
    if totlen_src.max(totlen_dst) > OutputToken::MAX_PACKET_LEN {
        return Err(Error::build(format!(
            "{} bytes exceeds the {} byte packet limit",
            totlen_src.max(totlen_dst),
            OutputToken::MAX_PACKET_LEN
        )));
    }
    if spec.mode.block_aligned() && payload % spec.cipher.block_size() != 0 {
        return Err(Error::build(format!(
            "{payload} bytes is not a multiple of the block size"
        )));
    }
    Ok(Lengths {
        assoclen: req.assoclen,
        payload,
        totlen_src,
        totlen_dst,
    })
}

/// Copy the first `len` bytes of the fragments.
fn gather(src: &[Bytes], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for frag in src {
        let take = frag.len().min(len - out.len());
        out.extend_from_slice(&frag[..take]);
        if out.len() == len {
            break;
        }
    }
    out
}

/// One particle per fragment covering bytes `skip..len` of the source.
fn particle_lens(src: &[Bytes], len: usize, skip: usize) -> Vec<usize> {
    let mut lens = Vec::with_capacity(src.len());
    let mut start = 0;
    for frag in src {
        if start >= len {
            break;
        }
        let end = (start + frag.len()).min(len);
        let from = start.max(skip);
        if end > from {
            lens.push(end - from);
        }
        start += frag.len();
    }
    lens
}

/// IV placed in the token for `spec`. `iv` has been length-checked.
fn token_iv(spec: &CipherSpec, nonce: &[u8], iv: &[u8]) -> Vec<u8> {
    const COUNTER_ONE: [u8; 4] = [0, 0, 0, 1];
    let esp = spec.aead == AeadKind::IpsecEsp;
    let mut out = Vec::with_capacity(16);
    match spec.mode {
        CipherMode::Gmac | CipherMode::Ctr => {
            out.extend_from_slice(nonce);
            out.extend_from_slice(&iv[..8]);
            out.extend_from_slice(&COUNTER_ONE);
        }
        CipherMode::Gcm if esp => {
            out.extend_from_slice(nonce);
            out.extend_from_slice(&iv[..8]);
            out.extend_from_slice(&COUNTER_ONE);
        }
        CipherMode::Gcm => {
            out.extend_from_slice(&iv[..12]);
            out.extend_from_slice(&COUNTER_ONE);
        }
        CipherMode::Ccm if esp => {
            out.extend_from_slice(nonce);
            out.extend_from_slice(&iv[..8]);
            out.extend_from_slice(&[0; 4]);
        }
        CipherMode::Ccm => {
            // A0: flags, nonce, then an L-byte counter starting at zero.
            out.extend_from_slice(&iv[..16]);
            let l = (out[0] & 7) as usize + 1;
            out[16 - l..].fill(0);
        }
        CipherMode::Ecb | CipherMode::Cbc | CipherMode::Ofb | CipherMode::Cfb => {
            out.extend_from_slice(&iv[..spec.iv_len()]);
        }
    }
    out
}

/// Associated-data length the token authenticates.
fn token_aad_len(spec: &CipherSpec, assoclen: usize) -> Result<usize> {
    match (spec.mode, spec.aead) {
        (CipherMode::Gmac, _) => Ok(0),
        (CipherMode::Gcm | CipherMode::Ccm, AeadKind::IpsecEsp) => assoclen
            .checked_sub(ESP_IV_LEN)
            .ok_or_else(|| Error::build("ESP associated data must include the IV")),
        _ => Ok(assoclen),
    }
}

/// ESP CCM decrypt output is written without the 8-byte IV; shift it back
/// into place and zero the vacated prefix.
fn realign_esp_ccm(data: &mut [u8]) {
    let len = data.len();
    if len < ESP_IV_LEN {
        data.fill(0);
        return;
    }
    data.copy_within(..len - ESP_IV_LEN, ESP_IV_LEN);
    data[..ESP_IV_LEN].fill(0);
}

/// A queued cipher / AEAD request.
pub(crate) struct CipherJob {
    ctx: Arc<CipherContext>,
    req: CipherRequest,
    reply: Reply<CipherOutput>,
    lengths: Option<Lengths>,
    next_iv: Option<Vec<u8>>,
}

impl CipherJob {
    pub(crate) fn new(ctx: Arc<CipherContext>, req: CipherRequest, reply: Reply<CipherOutput>) -> Self {
        Self {
            ctx,
            req,
            reply,
            lengths: None,
            next_iv: None,
        }
    }
}

impl Job for CipherJob {
    fn send(&mut self, shared: &Shared, ring: RingId) -> Result<Prepared> {
        let spec = *self.ctx.spec();
        let req = &self.req;
        let len = lengths(&spec, req)?;
        if req.iv.len() < spec.iv_len() {
            return Err(Error::build(format!(
                "IV must be {} bytes, got {}",
                spec.iv_len(),
                req.iv.len()
            )));
        }

        let (data, nonce) = self.ctx.engine_data(shared, ring, req.direction)?;
        let dma = &shared.services.dma;

        let flat = gather(&req.src, len.totlen_src);
        let skip = if spec.splits_aad() { len.assoclen } else { 0 };
        let (aad, packet) = flat.split_at(skip);

        let src = DmaBuffer::particles(dma, &particle_lens(&req.src, len.totlen_src, skip))
            .map_err(|e| Error::alloc("source particles", e))?;
        src.write(0, packet)
            .map_err(|e| Error::alloc("source write", e))?;
        let dst = DmaBuffer::particles(dma, &[len.totlen_dst])
            .map_err(|e| Error::alloc("destination particles", e))?;

        let iv = token_iv(&spec, &nonce, &req.iv);
        let params = TokenParams {
            iv: &iv,
            aad,
            aad_len: token_aad_len(&spec, len.assoclen)?,
            packet_len: packet.len(),
            ..TokenParams::default()
        };
        let (token, info) = build_token(shared, data.token_context(), &params)?;

        if spec.mode == CipherMode::Cbc && req.direction == Direction::Decrypt {
            let end = len.assoclen + len.payload;
            let bs = spec.cipher.block_size();
            self.next_iv = end.checked_sub(bs).map(|start| flat[start..end].to_vec());
        }
        self.lengths = Some(len);

        let command = Command {
            token: Some(token.handle().map_err(|e| Error::submit("token", e))?),
            token_words: info.words,
            token_header: info.header,
            sa: Some(data.sa_handle()?),
            src: Some(src.handle().map_err(|e| Error::submit("source", e))?),
            src_len: packet.len(),
            dst: Some(dst.handle().map_err(|e| Error::submit("destination", e))?),
            dst_len: len.totlen_dst,
            ..Command::packet()
        };
        Ok(Prepared {
            command,
            resources: Resources {
                token: Some(token),
                src: Some(src),
                dst: Some(dst),
                engine_data: Some(data),
                sa: None,
            },
        })
    }

    fn finish(self: Box<Self>, _shared: &Shared, harvest: Harvest) {
        let CipherJob {
            ctx,
            req,
            reply,
            lengths,
            mut next_iv,
        } = *self;
        let mut data = match harvest.into_output() {
            Ok(data) => data,
            Err(e) => return reply(Err(e)),
        };
        let Some(len) = lengths else {
            return reply(Err(Error::build("result for an unsent request")));
        };
        data.truncate(len.totlen_dst);

        let spec = ctx.spec();
        if spec.mode == CipherMode::Ccm
            && spec.aead == AeadKind::IpsecEsp
            && req.direction == Direction::Decrypt
        {
            realign_esp_ccm(&mut data);
        }
        if spec.mode == CipherMode::Cbc && req.direction == Direction::Encrypt {
            let end = len.assoclen + len.payload;
            let bs = spec.cipher.block_size();
            next_iv = end
                .checked_sub(bs)
                .and_then(|start| data.get(start..end))
                .map(<[u8]>::to_vec);
        }
        reply(Ok(CipherOutput { data, next_iv }))
    }

    fn fail(self: Box<Self>, err: Error) {
        (self.reply)(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{CipherAlg, HashAlg};

    fn frags(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn lengths_per_direction() {
        let spec = CipherSpec::gcm(16);
        let enc = CipherRequest::encrypt(&[0; 12], vec![0u8; 40]).assoclen(8);
        let len = lengths(&spec, &enc).unwrap();
        assert_eq!((len.totlen_src, len.totlen_dst, len.payload), (40, 56, 32));

        let dec = CipherRequest::decrypt(&[0; 12], vec![0u8; 56]).assoclen(8);
        let len = lengths(&spec, &dec).unwrap();
        assert_eq!((len.totlen_src, len.totlen_dst, len.payload), (56, 40, 32));

        let short = CipherRequest::decrypt(&[0; 12], vec![0u8; 10]).assoclen(0);
        assert!(lengths(&spec, &short).is_err());
    }

    #[test]
    fn block_modes_need_alignment() {
        let spec = CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc);
        let req = CipherRequest::encrypt(&[0; 16], vec![0u8; 33]);
        assert!(matches!(lengths(&spec, &req), Err(Error::Build(_))));
        let ctr = CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr);
        assert!(lengths(&ctr, &req).is_ok());
        let authenc = CipherSpec::authenc(HashAlg::Sha1, CipherAlg::Aes, 12);
        let dec = CipherRequest::decrypt(&[0; 16], vec![0u8; 8 + 32 + 12]).assoclen(8);
        assert_eq!(lengths(&authenc, &dec).unwrap().payload, 32);
    }

    #[test]
    fn oversized_lengths_are_rejected() {
        let spec = CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr);
        let req = CipherRequest::encrypt(&[0; 8], vec![0u8; 16])
            .assoclen(1)
            .cryptlen(usize::MAX);
        assert!(matches!(lengths(&spec, &req), Err(Error::Build(_))));

        let big = CipherRequest::encrypt(&[0; 8], vec![0u8; OutputToken::MAX_PACKET_LEN + 1]);
        assert!(matches!(lengths(&spec, &big), Err(Error::Build(_))));
        let fits = CipherRequest::encrypt(&[0; 8], vec![0u8; OutputToken::MAX_PACKET_LEN]);
        assert!(lengths(&spec, &fits).is_ok());

        // The tag pushes the destination over the limit.
        let gcm = CipherSpec::gcm(16);
        let req = CipherRequest::encrypt(&[0; 12], vec![0u8; OutputToken::MAX_PACKET_LEN - 8]);
        assert!(matches!(lengths(&gcm, &req), Err(Error::Build(_))));
    }

    #[test]
    fn source_must_cover_request() {
        let spec = CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr);
        let req = CipherRequest::encrypt(&[0; 8], vec![0u8; 16]).cryptlen(32);
        assert!(lengths(&spec, &req).is_err());
    }

    #[test]
    fn particles_skip_split_aad() {
        let src = frags(&[b"aaaa", b"aaaapp", b"pppp", b"unused"]);
        assert_eq!(particle_lens(&src, 14, 0), vec![4, 6, 4]);
        assert_eq!(particle_lens(&src, 14, 8), vec![2, 4]);
        assert_eq!(particle_lens(&src, 10, 4), vec![6]);
        assert_eq!(gather(&src, 12), b"aaaaaaaapppp".to_vec());
    }

    #[test]
    fn iv_layouts() {
        let nonce = [0xA0, 0xA1, 0xA2, 0xA3];
        let iv: Vec<u8> = (1..=16).collect();

        let esp_gcm = token_iv(&CipherSpec::rfc4106(16), &nonce, &iv);
        assert_eq!(esp_gcm, [0xA0, 0xA1, 0xA2, 0xA3, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 1]);

        let gmac = token_iv(&CipherSpec::rfc4543(), &nonce, &iv);
        assert_eq!(gmac, esp_gcm);

        let gcm = token_iv(&CipherSpec::gcm(16), &[], &iv);
        assert_eq!(gcm, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0, 0, 0, 1]);

        let ccm_nonce = [3, 0xB0, 0xB1, 0xB2];
        let esp_ccm = token_iv(&CipherSpec::rfc4309(16), &ccm_nonce, &iv);
        assert_eq!(esp_ccm, [3, 0xB0, 0xB1, 0xB2, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0]);

        let mut a0 = vec![1u8; 16];
        a0[0] = 3;
        let ccm = token_iv(&CipherSpec::ccm(16), &[], &a0);
        assert_eq!(&ccm[..12], &a0[..12]);
        assert_eq!(&ccm[12..], &[0, 0, 0, 0]);

        let ctr = token_iv(
            &CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Ctr),
            &nonce,
            &iv,
        );
        assert_eq!(ctr, esp_gcm);

        let cbc = token_iv(
            &CipherSpec::skcipher(CipherAlg::Aes, CipherMode::Cbc),
            &[],
            &iv,
        );
        assert_eq!(cbc, iv);
    }

    #[test]
    fn aad_lengths() {
        assert_eq!(token_aad_len(&CipherSpec::rfc4106(16), 16).unwrap(), 8);
        assert_eq!(token_aad_len(&CipherSpec::rfc4309(16), 16).unwrap(), 8);
        assert_eq!(token_aad_len(&CipherSpec::rfc4543(), 16).unwrap(), 0);
        assert_eq!(token_aad_len(&CipherSpec::gcm(16), 13).unwrap(), 13);
        assert!(token_aad_len(&CipherSpec::rfc4106(16), 4).is_err());
    }

    #[test]
    fn ccm_realign() {
        let mut data: Vec<u8> = (1..=12).collect();
        realign_esp_ccm(&mut data);
        assert_eq!(data, [0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }
}

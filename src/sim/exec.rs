// Packet engine of the software simulator. Commands execute synchronously
// at submit time; their result descriptors queue per ring until polled.

use crate::completion::{ERR_AUTH, OutputToken};
use crate::ddk::{
    Command, DdkError, DmaHandle, HwService, Notifier, PacketEngine, ResultDescriptor,
    SaAuthAlg, SaCryptoAlg, SaCryptoMode, SaDirection, SaParams,
};

use super::builder::{Token, decode_sa, decode_token};
use super::cipher::{self, Aes, BLOCK};
use super::digest::{self, HashKind};
use super::{Call, Sim};

/// Input shorter than the transform needs, unaligned, or larger than the
/// destination.
pub const ERR_LENGTH: u32 = 0x0001;
/// SA missing, not registered on the ring, or malformed.
pub const ERR_INVALID_SA: u32 = 0x0040;
/// Algorithm combination the simulator does not execute.
pub const ERR_UNSUPPORTED: u32 = 0x0800;

type Outcome = Result<Vec<u8>, u32>;

/// GHASH key from the SA, whose words are stored byte-swapped.
fn hash_key(sa: &SaParams) -> Result<[u8; BLOCK], u32> {
    if sa.auth_key1.len() != BLOCK {
        return Err(ERR_INVALID_SA);
    }
    let mut h = [0u8; BLOCK];
    for (dst, src) in h.chunks_exact_mut(4).zip(sa.auth_key1.chunks_exact(4)) {
        dst.copy_from_slice(src);
        dst.reverse();
    }
    Ok(h)
}

fn split_tag(data: &[u8], icv: usize) -> Result<(&[u8], &[u8]), u32> {
    let at = data.len().checked_sub(icv).ok_or(ERR_LENGTH)?;
    Ok(data.split_at(at))
}

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

fn hash(sa: &SaParams, token: &Token, input: &[u8]) -> Outcome {
    let kind = HashKind::from_auth(sa.auth_alg).ok_or(ERR_UNSUPPORTED)?;
    let (state, count) = if token.hash.first {
        (None, 0)
    } else {
        (Some(sa.auth_key1.as_slice()), sa.digest_count)
    };
    digest::run(kind, state, count, input, token.hash.last).ok_or(ERR_LENGTH)
}

/// AES-CBC with HMAC over associated data and ciphertext.
fn authenc(aes: &Aes, sa: &SaParams, token: &Token, input: &[u8], encrypt: bool) -> Outcome {
    let kind = HashKind::from_auth(sa.auth_alg).ok_or(ERR_UNSUPPORTED)?;
    let aad = input.get(..token.aad_len).ok_or(ERR_LENGTH)?;
    let body = &input[token.aad_len..];
    let mac = |ct: &[u8]| {
        digest::hmac(kind, &sa.auth_key1, &sa.auth_key2, &concat(&[aad, ct]))
            .ok_or(ERR_INVALID_SA)
    };
    if encrypt {
        let ct = cipher::cbc(aes, &token.iv, body, true).ok_or(ERR_LENGTH)?;
        let tag = mac(&ct)?;
        let icv = tag.get(..sa.icv_len).ok_or(ERR_INVALID_SA)?;
        Ok(concat(&[aad, &ct[..], icv]))
    } else {
        let (ct, tag) = split_tag(body, sa.icv_len)?;
        let expected = mac(ct)?;
        if expected.get(..tag.len()) != Some(tag) {
            return Err(ERR_AUTH);
        }
        let pt = cipher::cbc(aes, &token.iv, ct, false).ok_or(ERR_LENGTH)?;
        Ok(concat(&[aad, &pt[..]]))
    }
}

/// Associated data written to the output, the part of it authenticated,
/// and the packet body. Split transforms carry the associated data in the
/// token; otherwise it leads the packet.
fn aead_parts<'a>(
    token: &'a Token,
    input: &'a [u8],
) -> Result<(&'a [u8], &'a [u8], &'a [u8]), u32> {
    if token.aad.is_empty() {
        let aad = input.get(..token.aad_len).ok_or(ERR_LENGTH)?;
        Ok((aad, aad, &input[token.aad_len..]))
    } else {
        let auth = token.aad.get(..token.aad_len).ok_or(ERR_LENGTH)?;
        Ok((token.aad.as_slice(), auth, input))
    }
}

fn gcm(aes: &Aes, sa: &SaParams, token: &Token, input: &[u8], encrypt: bool) -> Outcome {
    let h = hash_key(sa)?;
    let (prefix, aad, body) = aead_parts(token, input)?;
    if encrypt {
        let (ct, tag) =
            cipher::gcm_seal(aes, &h, &token.iv, aad, body).ok_or(ERR_INVALID_SA)?;
        let icv = tag.get(..sa.icv_len).ok_or(ERR_INVALID_SA)?;
        Ok(concat(&[prefix, &ct[..], icv]))
    } else {
        let (ct, tag) = split_tag(body, sa.icv_len)?;
        let pt = cipher::gcm_open(aes, &h, &token.iv, aad, ct, tag).ok_or(ERR_AUTH)?;
        Ok(concat(&[prefix, &pt[..]]))
    }
}

/// GMAC authenticates the whole packet and encrypts nothing.
fn gmac(aes: &Aes, sa: &SaParams, token: &Token, input: &[u8], encrypt: bool) -> Outcome {
    let h = hash_key(sa)?;
    if encrypt {
        let (_, tag) =
            cipher::gcm_seal(aes, &h, &token.iv, input, &[]).ok_or(ERR_INVALID_SA)?;
        let icv = tag.get(..sa.icv_len).ok_or(ERR_INVALID_SA)?;
        Ok(concat(&[input, icv]))
    } else {
        let (data, tag) = split_tag(input, sa.icv_len)?;
        cipher::gcm_open(aes, &h, &token.iv, data, &[], tag).ok_or(ERR_AUTH)?;
        Ok(data.to_vec())
    }
}

/// CCM. Decrypt output carries only the authenticated part of the
/// associated data.
fn ccm(aes: &Aes, sa: &SaParams, token: &Token, input: &[u8], encrypt: bool) -> Outcome {
    let (prefix, aad, body) = aead_parts(token, input)?;
    if encrypt {
        let (ct, tag) =
            cipher::ccm_seal(aes, &token.iv, sa.icv_len, aad, body).ok_or(ERR_INVALID_SA)?;
        Ok(concat(&[prefix, &ct[..], &tag[..]]))
    } else {
        let (ct, tag) = split_tag(body, sa.icv_len)?;
        let pt = cipher::ccm_open(aes, &token.iv, aad, ct, tag).ok_or(ERR_AUTH)?;
        Ok(concat(&[aad, &pt[..]]))
    }
}

fn process(sa: &SaParams, token: &Token, input: &[u8]) -> Outcome {
    let encrypt = sa.direction == SaDirection::Outbound;
    match sa.crypto_alg {
        SaCryptoAlg::Null if sa.crypto_mode == SaCryptoMode::Basic => hash(sa, token, input),
        SaCryptoAlg::Aes => {
            let aes = Aes::new(&sa.key).ok_or(ERR_INVALID_SA)?;
            match sa.crypto_mode {
                SaCryptoMode::Ecb => cipher::ecb(&aes, input, encrypt).ok_or(ERR_LENGTH),
                SaCryptoMode::Cbc if HashKind::is_hmac(sa.auth_alg) => {
                    authenc(&aes, sa, token, input, encrypt)
                }
                SaCryptoMode::Cbc => cipher::cbc(&aes, &token.iv, input, encrypt).ok_or(ERR_LENGTH),
                SaCryptoMode::Ofb => cipher::ofb(&aes, &token.iv, input).ok_or(ERR_INVALID_SA),
                SaCryptoMode::Cfb => {
                    cipher::cfb(&aes, &token.iv, input, encrypt).ok_or(ERR_INVALID_SA)
                }
                SaCryptoMode::Ctr => cipher::ctr(&aes, &token.iv, input).ok_or(ERR_INVALID_SA),
                SaCryptoMode::Gcm if sa.auth_alg == SaAuthAlg::AesGcm => {
                    gcm(&aes, sa, token, input, encrypt)
                }
                SaCryptoMode::Gmac if sa.auth_alg == SaAuthAlg::AesGmac => {
                    gmac(&aes, sa, token, input, encrypt)
                }
                SaCryptoMode::Ccm if sa.auth_alg == SaAuthAlg::AesCcm => {
                    ccm(&aes, sa, token, input, encrypt)
                }
                _ => Err(ERR_UNSUPPORTED),
            }
        }
        _ => Err(ERR_UNSUPPORTED),
    }
}

impl Sim {
    /// Run one packet command; returns the bytes written to the
    /// destination.
    fn run_packet(&self, ring: usize, cmd: &Command) -> Result<usize, u32> {
        let (sa, token, input) = {
            let state = self.state.lock();
            let sa_handle = cmd.sa.ok_or(ERR_INVALID_SA)?;
            if !state.registered.contains(&(ring, sa_handle)) {
                return Err(ERR_INVALID_SA);
            }
            let sa = state
                .bytes(sa_handle)
                .and_then(|b| decode_sa(b).ok())
                .ok_or(ERR_INVALID_SA)?;
            let token = cmd
                .token
                .and_then(|h| state.bytes(h))
                .and_then(|b| decode_token(b).ok())
                .ok_or(ERR_LENGTH)?;
            let input = match cmd.src {
                Some(h) => state
                    .bytes(h)
                    .and_then(|b| b.get(..cmd.src_len))
                    .ok_or(ERR_LENGTH)?
                    .to_vec(),
                None => Vec::new(),
            };
            (sa, token, input)
        };
        if token.packet_len != input.len() {
            return Err(ERR_LENGTH);
        }

        let output = process(&sa, &token, &input)?;
        if output.len() > cmd.dst_len {
            return Err(ERR_LENGTH);
        }
        if output.is_empty() {
            return Ok(0);
        }
        let dst = cmd.dst.ok_or(ERR_LENGTH)?;
        let mut state = self.state.lock();
        let buf = state.buffer_mut(dst).ok_or(ERR_LENGTH)?;
        buf.data
            .get_mut(..output.len())
            .ok_or(ERR_LENGTH)?
            .copy_from_slice(&output);
        Ok(output.len())
    }

    fn invalidate(&self, sa: Option<DmaHandle>) -> u32 {
        let mut state = self.state.lock();
        match sa {
            Some(h) if state.transforms.contains(&h) => {
                state.calls.push(Call::Invalidate(h));
                0
            }
            _ => ERR_INVALID_SA,
        }
    }

    fn execute(&self, ring: usize, cmd: &Command) -> ResultDescriptor {
        let (packet_len, mut error_code) = match cmd.service {
            HwService::InvalidateTransform => (0, self.invalidate(cmd.sa)),
            HwService::Packet => match self.run_packet(ring, cmd) {
                Ok(len) => (len as u32, 0),
                Err(code) => (0, code),
            },
        };
        if let Some(code) = self.injected.lock().pop_front() {
            error_code = code;
        }
        self.state.lock().calls.push(Call::Submit {
            ring,
            id: cmd.id,
            src_len: cmd.src_len,
            dst_len: cmd.dst_len,
        });
        ResultDescriptor {
            output_token: OutputToken {
                packet_len,
                error_code,
                app_id: cmd.id,
            }
            .encode(),
        }
    }
}

impl PacketEngine for Sim {
    fn ring_count(&self) -> usize {
        self.rings.len()
    }

    fn submit(&self, ring: usize, commands: &[Command]) -> Result<usize, DdkError> {
        let slot = self.rings.get(ring).ok_or(DdkError::OutOfRange)?;
        if self.faults.lock().fail_submit {
            return Err(DdkError::Busy);
        }
        let results: Vec<_> = commands.iter().map(|c| self.execute(ring, c)).collect();
        let due = {
            let mut r = slot.lock();
            r.ready.extend(results);
            r.due()
        };
        if let Some(n) = due {
            n.notify();
        }
        Ok(commands.len())
    }

    fn poll(&self, ring: usize) -> Result<Option<ResultDescriptor>, DdkError> {
        let slot = self.rings.get(ring).ok_or(DdkError::OutOfRange)?;
        let mut r = slot.lock();
        if r.hold {
            return Ok(None);
        }
        Ok(r.ready.pop_front())
    }

    fn register_notify(&self, ring: usize, notifier: Notifier) -> Result<(), DdkError> {
        let slot = self.rings.get(ring).ok_or(DdkError::OutOfRange)?;
        self.state.lock().calls.push(Call::NotifyRegistered(ring));
        let due = {
            let mut r = slot.lock();
            r.notifier = Some(notifier);
            r.due()
        };
        if let Some(n) = due {
            n.notify();
        }
        Ok(())
    }
}

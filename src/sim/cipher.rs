// AES modes of the software engine. Block cipher, chaining modes, GHASH
// and CCM come from the RustCrypto crates; GCM is assembled here because
// the engine takes its hash key and pre-counter block from the SA and the
// token rather than deriving them.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    AsyncStreamCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit,
    KeyIvInit, StreamCipher,
};
use aes::{Aes128, Aes192, Aes256};
use ccm::Ccm;
use ccm::aead::AeadInPlace;
use ccm::consts::{U4, U6, U7, U8, U9, U10, U11, U12, U13, U14, U16};
use ghash::GHash;
use ghash::universal_hash::UniversalHash;

pub(crate) const BLOCK: usize = 16;

/// An AES key of a supported size.
pub(crate) struct Aes {
    key: Vec<u8>,
}

impl Aes {
    pub(crate) fn new(key: &[u8]) -> Option<Self> {
        matches!(key.len(), 16 | 24 | 32).then(|| Self { key: key.to_vec() })
    }
}

/// Expand `$body` with `$c` naming the AES variant of `$key`. Keys have
/// been size-checked by [`Aes::new`].
macro_rules! with_aes {
    ($key:expr, $c:ident => $body:expr) => {
        match $key.len() {
            16 => {
                type $c = Aes128;
                $body
            }
            24 => {
                type $c = Aes192;
                $body
            }
            _ => {
                type $c = Aes256;
                $body
            }
        }
    };
}

/// CCM tag sizes.
macro_rules! with_tag_size {
    ($len:expr, $m:ident => $body:expr) => {
        match $len {
            4 => { type $m = U4; $body }
            6 => { type $m = U6; $body }
            8 => { type $m = U8; $body }
            10 => { type $m = U10; $body }
            12 => { type $m = U12; $body }
            14 => { type $m = U14; $body }
            16 => { type $m = U16; $body }
            _ => None,
        }
    };
}

/// CCM nonce sizes.
macro_rules! with_nonce_size {
    ($len:expr, $n:ident => $body:expr) => {
        match $len {
            7 => { type $n = U7; $body }
            8 => { type $n = U8; $body }
            9 => { type $n = U9; $body }
            10 => { type $n = U10; $body }
            11 => { type $n = U11; $body }
            12 => { type $n = U12; $body }
            13 => { type $n = U13; $body }
            _ => None,
        }
    };
}

fn xor(dst: &mut [u8], src: &[u8]) {
    dst.iter_mut().zip(src).for_each(|(d, s)| *d ^= s);
}

fn block_of(bytes: &[u8]) -> [u8; BLOCK] {
    let mut b = [0u8; BLOCK];
    let n = bytes.len().min(BLOCK);
    b[..n].copy_from_slice(&bytes[..n]);
    b
}

pub(crate) fn ecb(aes: &Aes, data: &[u8], encrypt: bool) -> Option<Vec<u8>> {
    if data.len() % BLOCK != 0 {
        return None;
    }
    let mut out = data.to_vec();
    with_aes!(aes.key, C => {
        let cipher = C::new_from_slice(&aes.key).ok()?;
        for block in out.chunks_exact_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(block);
            if encrypt {
                cipher.encrypt_block(block);
            } else {
                cipher.decrypt_block(block);
            }
        }
    });
    Some(out)
}

pub(crate) fn cbc(aes: &Aes, iv: &[u8], data: &[u8], encrypt: bool) -> Option<Vec<u8>> {
    if data.len() % BLOCK != 0 {
        return None;
    }
    let iv = iv.get(..BLOCK)?;
    let mut out = data.to_vec();
    with_aes!(aes.key, C => {
        if encrypt {
            let mut mode = cbc::Encryptor::<C>::new_from_slices(&aes.key, iv).ok()?;
            for block in out.chunks_exact_mut(BLOCK) {
                mode.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        } else {
            let mut mode = cbc::Decryptor::<C>::new_from_slices(&aes.key, iv).ok()?;
            for block in out.chunks_exact_mut(BLOCK) {
                mode.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    });
    Some(out)
}

pub(crate) fn ofb(aes: &Aes, iv: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let mut out = data.to_vec();
    with_aes!(aes.key, C => {
        let mut mode = ofb::Ofb::<C>::new_from_slices(&aes.key, &block_of(iv)).ok()?;
        mode.apply_keystream(&mut out);
    });
    Some(out)
}

/// Full-block CFB.
pub(crate) fn cfb(aes: &Aes, iv: &[u8], data: &[u8], encrypt: bool) -> Option<Vec<u8>> {
    let mut out = data.to_vec();
    let iv = block_of(iv);
    with_aes!(aes.key, C => {
        if encrypt {
            cfb_mode::Encryptor::<C>::new_from_slices(&aes.key, &iv)
                .ok()?
                .encrypt(&mut out);
        } else {
            cfb_mode::Decryptor::<C>::new_from_slices(&aes.key, &iv)
                .ok()?
                .decrypt(&mut out);
        }
    });
    Some(out)
}

/// Counter mode starting at `counter`; the low 32 bits count.
pub(crate) fn ctr(aes: &Aes, counter: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let mut out = data.to_vec();
    with_aes!(aes.key, C => {
        let mut mode = ctr::Ctr32BE::<C>::new_from_slices(&aes.key, &block_of(counter)).ok()?;
        mode.apply_keystream(&mut out);
    });
    Some(out)
}

// ── GCM ─────────────────────────────────────────────────────────────

fn ghash(h: &[u8; BLOCK], aad: &[u8], ct: &[u8]) -> [u8; BLOCK] {
    let mut mac = GHash::new(GenericArray::from_slice(h));
    mac.update_padded(aad);
    mac.update_padded(ct);
    let mut lens = [0u8; BLOCK];
    lens[..8].copy_from_slice(&(aad.len() as u64 * 8).to_be_bytes());
    lens[8..].copy_from_slice(&(ct.len() as u64 * 8).to_be_bytes());
    mac.update(&[GenericArray::from(lens)]);
    block_of(&mac.finalize())
}

/// Counter mode from the pre-counter block `j0`: the first keystream block
/// masks the tag, the rest transform `data`.
fn gcm_ctr(aes: &Aes, j0: &[u8], data: &[u8]) -> Option<([u8; BLOCK], Vec<u8>)> {
    let mut mask = [0u8; BLOCK];
    let mut out = data.to_vec();
    with_aes!(aes.key, C => {
        let mut mode = ctr::Ctr32BE::<C>::new_from_slices(&aes.key, &block_of(j0)).ok()?;
        mode.apply_keystream(&mut mask);
        mode.apply_keystream(&mut out);
    });
    Some((mask, out))
}

/// GCM with a caller-formed pre-counter block `j0`. Returns the ciphertext
/// and the full 16-byte tag.
pub(crate) fn gcm_seal(
    aes: &Aes,
    h: &[u8; BLOCK],
    j0: &[u8],
    aad: &[u8],
    plain: &[u8],
) -> Option<(Vec<u8>, [u8; BLOCK])> {
    let (mask, ct) = gcm_ctr(aes, j0, plain)?;
    let mut tag = ghash(h, aad, &ct);
    xor(&mut tag, &mask);
    Some((ct, tag))
}

/// GCM decrypt. `None` when the first `tag.len()` bytes of the computed tag
/// differ.
pub(crate) fn gcm_open(
    aes: &Aes,
    h: &[u8; BLOCK],
    j0: &[u8],
    aad: &[u8],
    ct: &[u8],
    tag: &[u8],
) -> Option<Vec<u8>> {
    let (mask, plain) = gcm_ctr(aes, j0, ct)?;
    let mut expected = ghash(h, aad, ct);
    xor(&mut expected, &mask);
    (expected.get(..tag.len())? == tag).then_some(plain)
}

// ── CCM ─────────────────────────────────────────────────────────────

/// Nonce carried by the counter block A0, whose flags give the counter
/// width L.
fn ccm_nonce(a0: &[u8]) -> Option<&[u8]> {
    let flags = *a0.first()?;
    let l = (flags & 7) as usize + 1;
    if l < 2 {
        return None;
    }
    a0.get(1..BLOCK - l)
}

/// CCM encrypt with counter block `a0`. Returns ciphertext and the
/// `m`-byte encrypted tag.
pub(crate) fn ccm_seal(
    aes: &Aes,
    a0: &[u8],
    m: usize,
    aad: &[u8],
    plain: &[u8],
) -> Option<(Vec<u8>, Vec<u8>)> {
    let nonce = ccm_nonce(a0)?;
    let mut out = plain.to_vec();
    let tag = with_aes!(aes.key, C => with_tag_size!(m, M => with_nonce_size!(nonce.len(), N => {
        let ccm = Ccm::<C, M, N>::new_from_slice(&aes.key).ok()?;
        let tag = ccm
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, &mut out)
            .ok()?;
        Some(tag.to_vec())
    })))?;
    Some((out, tag))
}

/// CCM decrypt. `None` on a tag mismatch or malformed parameters.
pub(crate) fn ccm_open(
    aes: &Aes,
    a0: &[u8],
    aad: &[u8],
    ct: &[u8],
    tag: &[u8],
) -> Option<Vec<u8>> {
    let nonce = ccm_nonce(a0)?;
    let mut out = ct.to_vec();
    with_aes!(aes.key, C => with_tag_size!(tag.len(), M => with_nonce_size!(nonce.len(), N => {
        let ccm = Ccm::<C, M, N>::new_from_slice(&aes.key).ok()?;
        ccm.decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            &mut out,
            GenericArray::from_slice(tag),
        )
        .ok()
    })))?;
    Some(out)
}

//! Algorithm tables.
//!
//! Closed enums for the algorithms a context can request and the total
//! mappings onto the SA builder's enumerations. A combination the builder
//! cannot express maps to the builder's `Null` value; callers treat `Null`
//! as a build failure.

use crate::ddk::{SaAuthAlg, SaCryptoAlg, SaCryptoMode};

/// Block cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlg {
    Aes,
    Des,
    TripleDes,
}

impl CipherAlg {
    pub const fn block_size(self) -> usize {
        match self {
            CipherAlg::Aes => 16,
            CipherAlg::Des | CipherAlg::TripleDes => 8,
        }
    }

    /// Whether `len` is a valid key length in bytes.
    pub fn key_len_ok(self, len: usize) -> bool {
        match self {
            CipherAlg::Aes => matches!(len, 16 | 24 | 32),
            CipherAlg::Des => len == 8,
            CipherAlg::TripleDes => len == 24,
        }
    }
}

/// Chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    Ecb,
    Cbc,
    Ofb,
    Cfb,
    Ctr,
    Gcm,
    Gmac,
    Ccm,
}

impl CipherMode {
    /// Modes that only accept whole blocks of payload.
    pub const fn block_aligned(self) -> bool {
        matches!(self, CipherMode::Ecb | CipherMode::Cbc)
    }
}

/// Hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Xcbc,
    Cmac128,
    Cmac192,
    Cmac256,
}

impl HashAlg {
    /// Bytes per compression block.
    pub const fn block_size(self) -> usize {
        match self {
            HashAlg::Sha384 | HashAlg::Sha512 => 128,
            HashAlg::Md5 | HashAlg::Sha1 | HashAlg::Sha224 | HashAlg::Sha256 => 64,
            HashAlg::Xcbc | HashAlg::Cmac128 | HashAlg::Cmac192 | HashAlg::Cmac256 => 16,
        }
    }

    /// Bytes of intermediate state carried between requests.
    pub const fn state_size(self) -> usize {
        match self {
            HashAlg::Md5 => 16,
            HashAlg::Sha1 => 20,
            HashAlg::Sha224 | HashAlg::Sha256 => 32,
            HashAlg::Sha384 | HashAlg::Sha512 => 64,
            HashAlg::Xcbc | HashAlg::Cmac128 | HashAlg::Cmac192 | HashAlg::Cmac256 => 16,
        }
    }

    pub const fn digest_size(self) -> usize {
        match self {
            HashAlg::Md5 => 16,
            HashAlg::Sha1 => 20,
            HashAlg::Sha224 => 28,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
            HashAlg::Xcbc | HashAlg::Cmac128 | HashAlg::Cmac192 | HashAlg::Cmac256 => 16,
        }
    }

    /// Digest of the empty message, for algorithms with a well-known one.
    pub fn empty_digest(self) -> Option<&'static [u8]> {
        let digest: &'static [u8] = match self {
            HashAlg::Md5 => &[
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8,
                0x42, 0x7e,
            ],
            HashAlg::Sha1 => &[
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60,
                0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09,
            ],
            HashAlg::Sha224 => &[
                0xd1, 0x4a, 0x02, 0x8c, 0x2a, 0x3a, 0x2b, 0xc9, 0x47, 0x61, 0x02, 0xbb, 0x28, 0x82,
                0x34, 0xc4, 0x15, 0xa2, 0xb0, 0x1f, 0x82, 0x8e, 0xa6, 0x2a, 0xc5, 0xb3, 0xe4, 0x2f,
            ],
            HashAlg::Sha256 => &[
                0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
                0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
                0x78, 0x52, 0xb8, 0x55,
            ],
            HashAlg::Sha384 => &[
                0x38, 0xb0, 0x60, 0xa7, 0x51, 0xac, 0x96, 0x38, 0x4c, 0xd9, 0x32, 0x7e, 0xb1, 0xb1,
                0xe3, 0x6a, 0x21, 0xfd, 0xb7, 0x11, 0x14, 0xbe, 0x07, 0x43, 0x4c, 0x0c, 0xc7, 0xbf,
                0x63, 0xf6, 0xe1, 0xda, 0x27, 0x4e, 0xde, 0xbf, 0xe7, 0x6f, 0x65, 0xfb, 0xd5, 0x1a,
                0xd2, 0xf1, 0x48, 0x98, 0xb9, 0x5b,
            ],
            HashAlg::Sha512 => &[
                0xcf, 0x83, 0xe1, 0x35, 0x7e, 0xef, 0xb8, 0xbd, 0xf1, 0x54, 0x28, 0x50, 0xd6, 0x6d,
                0x80, 0x07, 0xd6, 0x20, 0xe4, 0x05, 0x0b, 0x57, 0x15, 0xdc, 0x83, 0xf4, 0xa9, 0x21,
                0xd3, 0x6c, 0xe9, 0xce, 0x47, 0xd0, 0xd1, 0x3c, 0x5d, 0x85, 0xf2, 0xb0, 0xff, 0x83,
                0x18, 0xd2, 0x87, 0x7e, 0xec, 0x2f, 0x63, 0xb9, 0x31, 0xbd, 0x47, 0x41, 0x7a, 0x81,
                0xa5, 0x38, 0x32, 0x7a, 0xf9, 0x27, 0xda, 0x3e,
            ],
            HashAlg::Xcbc | HashAlg::Cmac128 | HashAlg::Cmac192 | HashAlg::Cmac256 => return None,
        };
        Some(digest)
    }
}

/// Authentication half of an AEAD or authenc context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAlg {
    None,
    Hmac(HashAlg),
    Gcm,
    Gmac,
    Ccm,
}

/// AEAD flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AeadKind {
    None,
    Generic,
    /// RFC 4106 / 4309 / 4543: 8-byte explicit IV carried in the AAD.
    IpsecEsp,
}

/// Map a cipher and mode to the builder's enumerations.
///
/// DES and 3DES only run the classic block modes; any other pairing maps
/// the algorithm to `Null`.
pub fn map_cipher(alg: CipherAlg, mode: CipherMode) -> (SaCryptoAlg, SaCryptoMode) {
    let sa_mode = map_mode(mode);
    let sa_alg = match (alg, mode) {
        (CipherAlg::Aes, _) => SaCryptoAlg::Aes,
        (
            CipherAlg::Des,
            CipherMode::Ecb | CipherMode::Cbc | CipherMode::Ofb | CipherMode::Cfb,
        ) => SaCryptoAlg::Des,
        (
            CipherAlg::TripleDes,
            CipherMode::Ecb | CipherMode::Cbc | CipherMode::Ofb | CipherMode::Cfb,
        ) => SaCryptoAlg::TripleDes,
        _ => SaCryptoAlg::Null,
    };
    (sa_alg, sa_mode)
}

pub fn map_mode(mode: CipherMode) -> SaCryptoMode {
    match mode {
        CipherMode::Ecb => SaCryptoMode::Ecb,
        CipherMode::Cbc => SaCryptoMode::Cbc,
        CipherMode::Ofb => SaCryptoMode::Ofb,
        CipherMode::Cfb => SaCryptoMode::Cfb,
        CipherMode::Ctr => SaCryptoMode::Ctr,
        CipherMode::Gcm => SaCryptoMode::Gcm,
        CipherMode::Gmac => SaCryptoMode::Gmac,
        CipherMode::Ccm => SaCryptoMode::Ccm,
    }
}

/// Map the authentication half of a cipher context.
///
/// Only HMAC over MD5/SHA-1/SHA-2 is expressible as an HMAC SA; XCBC and
/// CMAC map to `Null`.
pub fn map_auth(auth: AuthAlg) -> SaAuthAlg {
    match auth {
        AuthAlg::None => SaAuthAlg::Null,
        AuthAlg::Hmac(HashAlg::Sha1) => SaAuthAlg::HmacSha1,
        AuthAlg::Hmac(HashAlg::Sha224) => SaAuthAlg::HmacSha224,
        AuthAlg::Hmac(HashAlg::Sha256) => SaAuthAlg::HmacSha256,
        AuthAlg::Hmac(HashAlg::Sha384) => SaAuthAlg::HmacSha384,
        AuthAlg::Hmac(HashAlg::Sha512) => SaAuthAlg::HmacSha512,
        AuthAlg::Hmac(HashAlg::Md5) => SaAuthAlg::HmacMd5,
        AuthAlg::Hmac(_) => SaAuthAlg::Null,
        AuthAlg::Gcm => SaAuthAlg::AesGcm,
        AuthAlg::Gmac => SaAuthAlg::AesGmac,
        AuthAlg::Ccm => SaAuthAlg::AesCcm,
    }
}

/// Map a plain hash algorithm.
pub fn map_hash(alg: HashAlg) -> SaAuthAlg {
    match alg {
        HashAlg::Md5 => SaAuthAlg::HashMd5,
        HashAlg::Sha1 => SaAuthAlg::HashSha1,
        HashAlg::Sha224 => SaAuthAlg::HashSha224,
        HashAlg::Sha256 => SaAuthAlg::HashSha256,
        HashAlg::Sha384 => SaAuthAlg::HashSha384,
        HashAlg::Sha512 => SaAuthAlg::HashSha512,
        HashAlg::Xcbc => SaAuthAlg::AesXcbc,
        HashAlg::Cmac128 => SaAuthAlg::AesCmac128,
        HashAlg::Cmac192 => SaAuthAlg::AesCmac192,
        HashAlg::Cmac256 => SaAuthAlg::AesCmac256,
    }
}

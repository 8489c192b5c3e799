// Hash compression for the software engine.
//
// States are carried between commands in their serialized form (MD5
// little-endian words, SHA big-endian words) so the pipeline can hand them
// back through `SaParams::auth_key1`. SHA-2 compression comes from the
// `sha2` crate; MD5 and SHA-1 are written out here.

use sha2::digest::generic_array::GenericArray;

use crate::ddk::SaAuthAlg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashKind {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    /// Hash of a plain-hash or HMAC auth algorithm.
    pub(crate) fn from_auth(alg: SaAuthAlg) -> Option<Self> {
        Some(match alg {
            SaAuthAlg::HashMd5 | SaAuthAlg::HmacMd5 => HashKind::Md5,
            SaAuthAlg::HashSha1 | SaAuthAlg::HmacSha1 => HashKind::Sha1,
            SaAuthAlg::HashSha224 | SaAuthAlg::HmacSha224 => HashKind::Sha224,
            SaAuthAlg::HashSha256 | SaAuthAlg::HmacSha256 => HashKind::Sha256,
            SaAuthAlg::HashSha384 | SaAuthAlg::HmacSha384 => HashKind::Sha384,
            SaAuthAlg::HashSha512 | SaAuthAlg::HmacSha512 => HashKind::Sha512,
            _ => return None,
        })
    }

    pub(crate) fn is_hmac(alg: SaAuthAlg) -> bool {
        matches!(
            alg,
            SaAuthAlg::HmacMd5
                | SaAuthAlg::HmacSha1
                | SaAuthAlg::HmacSha224
                | SaAuthAlg::HmacSha256
                | SaAuthAlg::HmacSha384
                | SaAuthAlg::HmacSha512
        )
    }

    pub(crate) fn block_size(self) -> usize {
        match self {
            HashKind::Sha384 | HashKind::Sha512 => 128,
            _ => 64,
        }
    }

    fn state_size(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha224 | HashKind::Sha256 => 32,
            HashKind::Sha384 | HashKind::Sha512 => 64,
        }
    }

    fn digest_size(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
            HashKind::Sha224 => 28,
            HashKind::Sha256 => 32,
            HashKind::Sha384 => 48,
            HashKind::Sha512 => 64,
        }
    }
}

const SHA1_IV: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];
const SHA224_IV: [u32; 8] = [
    0xc1059ed8, 0x367cd507, 0x3070dd17, 0xf70e5939, 0xffc00b31, 0x68581511, 0x64f98fa7, 0xbefa4fa4,
];
const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];
const SHA384_IV: [u64; 8] = [
    0xcbbb9d5dc1059ed8,
    0x629a292a367cd507,
    0x9159015a3070dd17,
    0x152fecd8f70e5939,
    0x67332667ffc00b31,
    0x8eb44a8768581511,
    0xdb0c2e0d64f98fa7,
    0x47b5481dbefa4fa4,
];
const SHA512_IV: [u64; 8] = [
    0x6a09e667f3bcc908,
    0xbb67ae8584caa73b,
    0x3c6ef372fe94f82b,
    0xa54ff53a5f1d36f1,
    0x510e527fade682d1,
    0x9b05688c2b3e6c1f,
    0x1f83d9abfb41bd6b,
    0x5be0cd19137e2179,
];
const MD5_IV: [u32; 4] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476];

// Per-round shift amounts
const MD5_S: [u32; 64] = [
    7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20, 5, 9,
    14, 20, 5, 9, 14, 20, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 6, 10, 15,
    21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
];

// T[i] = floor(2^32 * |sin(i + 1)|)
const MD5_K: [u32; 64] = [
    0xd76aa478, 0xe8c7b756, 0x242070db, 0xc1bdceee, 0xf57c0faf, 0x4787c62a, 0xa8304613, 0xfd469501,
    0x698098d8, 0x8b44f7af, 0xffff5bb1, 0x895cd7be, 0x6b901122, 0xfd987193, 0xa679438e, 0x49b40821,
    0xf61e2562, 0xc040b340, 0x265e5a51, 0xe9b6c7aa, 0xd62f105d, 0x02441453, 0xd8a1e681, 0xe7d3fbc8,
    0x21e1cde6, 0xc33707d6, 0xf4d50d87, 0x455a14ed, 0xa9e3e905, 0xfcefa3f8, 0x676f02d9, 0x8d2a4c8a,
    0xfffa3942, 0x8771f681, 0x6d9d6122, 0xfde5380c, 0xa4beea44, 0x4bdecfa9, 0xf6bb4b60, 0xbebfbc70,
    0x289b7ec6, 0xeaa127fa, 0xd4ef3085, 0x04881d05, 0xd9d4d039, 0xe6db99e5, 0x1fa27cf8, 0xc4ac5665,
    0xf4292244, 0x432aff97, 0xab9423a7, 0xfc93a039, 0x655b59c3, 0x8f0ccc92, 0xffeff47d, 0x85845dd1,
    0x6fa87e4f, 0xfe2ce6e0, 0xa3014314, 0x4e0811a1, 0xf7537e82, 0xbd3af235, 0x2ad7d2bb, 0xeb86d391,
];

fn md5_compress(state: &mut [u32; 4], block: &[u8]) {
    let mut m = [0u32; 16];
    for (word, chunk) in m.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let [mut a, mut b, mut c, mut d] = *state;
    for i in 0..64 {
        let (f, g) = match i {
            0..16 => ((b & c) | ((!b) & d), i),
            16..32 => ((d & b) | ((!d) & c), (5 * i + 1) % 16),
            32..48 => (b ^ c ^ d, (3 * i + 5) % 16),
            _ => (c ^ (b | (!d)), (7 * i) % 16),
        };
        let f = f.wrapping_add(a).wrapping_add(MD5_K[i]).wrapping_add(m[g]);
        a = d;
        d = c;
        c = b;
        b = b.wrapping_add(f.rotate_left(MD5_S[i]));
    }
    state[0] = state[0].wrapping_add(a);
    state[1] = state[1].wrapping_add(b);
    state[2] = state[2].wrapping_add(c);
    state[3] = state[3].wrapping_add(d);
}

fn sha1_compress(state: &mut [u32; 5], block: &[u8]) {
    let mut w = [0u32; 80];
    for (word, chunk) in w.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    for i in 16..80 {
        w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
    }
    let [mut a, mut b, mut c, mut d, mut e] = *state;
    for (i, wi) in w.iter().enumerate() {
        let (f, k) = match i {
            0..20 => ((b & c) | ((!b) & d), 0x5a827999),
            20..40 => (b ^ c ^ d, 0x6ed9eba1),
            40..60 => ((b & c) | (b & d) | (c & d), 0x8f1bbcdc),
            _ => (b ^ c ^ d, 0xca62c1d6),
        };
        let t = a
            .rotate_left(5)
            .wrapping_add(f)
            .wrapping_add(e)
            .wrapping_add(k)
            .wrapping_add(*wi);
        e = d;
        d = c;
        c = b.rotate_left(30);
        b = a;
        a = t;
    }
    for (s, v) in state.iter_mut().zip([a, b, c, d, e]) {
        *s = s.wrapping_add(v);
    }
}

/// Working state of one hash computation.
enum State {
    Md5([u32; 4]),
    Sha1([u32; 5]),
    Sha256([u32; 8]),
    Sha512([u64; 8]),
}

impl State {
    fn initial(kind: HashKind) -> Self {
        match kind {
            HashKind::Md5 => State::Md5(MD5_IV),
            HashKind::Sha1 => State::Sha1(SHA1_IV),
            HashKind::Sha224 => State::Sha256(SHA224_IV),
            HashKind::Sha256 => State::Sha256(SHA256_IV),
            HashKind::Sha384 => State::Sha512(SHA384_IV),
            HashKind::Sha512 => State::Sha512(SHA512_IV),
        }
    }

    fn load(kind: HashKind, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < kind.state_size() {
            return None;
        }
        let be32 = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(match kind {
            HashKind::Md5 => {
                let mut s = [0u32; 4];
                for (i, w) in s.iter_mut().enumerate() {
                    *w = u32::from_le_bytes([
                        bytes[4 * i],
                        bytes[4 * i + 1],
                        bytes[4 * i + 2],
                        bytes[4 * i + 3],
                    ]);
                }
                State::Md5(s)
            }
            HashKind::Sha1 => State::Sha1(std::array::from_fn(|i| be32(4 * i))),
            HashKind::Sha224 | HashKind::Sha256 => State::Sha256(std::array::from_fn(|i| be32(4 * i))),
            HashKind::Sha384 | HashKind::Sha512 => State::Sha512(std::array::from_fn(|i| {
                let mut w = [0u8; 8];
                w.copy_from_slice(&bytes[8 * i..8 * i + 8]);
                u64::from_be_bytes(w)
            })),
        })
    }

    fn store(&self) -> Vec<u8> {
        match self {
            State::Md5(s) => s.iter().flat_map(|w| w.to_le_bytes()).collect(),
            State::Sha1(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
            State::Sha256(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
            State::Sha512(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
        }
    }

    fn compress(&mut self, blocks: &[u8]) {
        match self {
            State::Md5(s) => blocks.chunks_exact(64).for_each(|b| md5_compress(s, b)),
            State::Sha1(s) => blocks.chunks_exact(64).for_each(|b| sha1_compress(s, b)),
            State::Sha256(s) => {
                let blocks: Vec<_> = blocks
                    .chunks_exact(64)
                    .map(GenericArray::clone_from_slice)
                    .collect();
                sha2::compress256(s, &blocks);
            }
            State::Sha512(s) => {
                let blocks: Vec<_> = blocks
                    .chunks_exact(128)
                    .map(GenericArray::clone_from_slice)
                    .collect();
                sha2::compress512(s, &blocks);
            }
        }
    }
}

/// Run one hash command.
///
/// Continues from `state` covering `count` bytes, or from the algorithm IV
/// when `state` is `None`. Non-final commands must be block aligned and
/// return the serialized state; final commands pad and return the digest.
pub(crate) fn run(
    kind: HashKind,
    state: Option<&[u8]>,
    count: u64,
    data: &[u8],
    last: bool,
) -> Option<Vec<u8>> {
    let mut st = match state {
        Some(bytes) => State::load(kind, bytes)?,
        None => State::initial(kind),
    };
    let block = kind.block_size();
    if !last {
        if data.len() % block != 0 {
            return None;
        }
        st.compress(data);
        return Some(st.store());
    }

    let total_bits = (count + data.len() as u64).wrapping_mul(8);
    let len_field = if block == 128 { 16 } else { 8 };
    let mut msg = data.to_vec();
    msg.push(0x80);
    while msg.len() % block != block - len_field {
        msg.push(0);
    }
    match kind {
        HashKind::Md5 => msg.extend_from_slice(&total_bits.to_le_bytes()),
        _ if len_field == 16 => msg.extend_from_slice(&u128::from(total_bits).to_be_bytes()),
        _ => msg.extend_from_slice(&total_bits.to_be_bytes()),
    }
    st.compress(&msg);
    let mut digest = st.store();
    digest.truncate(kind.digest_size());
    Some(digest)
}

/// HMAC from precomputed inner and outer states.
pub(crate) fn hmac(kind: HashKind, istate: &[u8], ostate: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let block = kind.block_size() as u64;
    let inner = run(kind, Some(istate), block, data, true)?;
    run(kind, Some(ostate), block, &inner, true)
}

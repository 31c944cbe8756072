//! Software hash unit for the simulated engine
//!
//! Each pass starts from the state words and byte counter carried in the
//! job, the way the hardware is loaded from the request, so the tracker in
//! [`crate::hash`] can split a message across any number of passes.

use sha2::digest::generic_array::GenericArray;
use zeroize::Zeroizing;

use crate::error::{CeError, CeResult};
use crate::hash::initial_digest;
use crate::job::HashJob;
use crate::sim::cipher::BlockKey;
use crate::types::{CipherAlg, HashAlg, AES_BLOCK_SIZE, MAX_SHA_BLOCK_SIZE, MAX_SHA_DIGEST};

const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;

/// What one hash pass reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashResult {
    pub digest: [u8; MAX_SHA_DIGEST],
    pub auth_data: [u32; 2],
}

/// Chaining state of the hash unit
enum ShaState {
    Sha1([u32; 5]),
    Sha256([u32; 8]),
}

impl ShaState {
    /// Load big-endian state words from a digest buffer
    fn load(alg: HashAlg, digest: &[u8; MAX_SHA_DIGEST]) -> Self {
        let word = |i: usize| {
            u32::from_be_bytes([digest[4 * i], digest[4 * i + 1], digest[4 * i + 2], digest[4 * i + 3]])
        };
        match alg.base() {
            HashAlg::Sha1 => Self::Sha1(std::array::from_fn(word)),
            _ => Self::Sha256(std::array::from_fn(word)),
        }
    }

    fn store(&self) -> [u8; MAX_SHA_DIGEST] {
        let mut out = [0u8; MAX_SHA_DIGEST];
        let words: &[u32] = match self {
            Self::Sha1(s) => s,
            Self::Sha256(s) => s,
        };
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_be_bytes());
        }
        out
    }

    /// `data` must be whole blocks
    fn compress(&mut self, data: &[u8]) {
        for block in data.chunks_exact(MAX_SHA_BLOCK_SIZE) {
            let block = GenericArray::from_slice(block);
            match self {
                Self::Sha1(s) => sha1::compress(s, std::slice::from_ref(block)),
                Self::Sha256(s) => sha2::compress256(s, std::slice::from_ref(block)),
            }
        }
    }

    /// Hash `data` as the final bytes of a message `prior + data.len()` long
    fn finish(&mut self, data: &[u8], prior: u64) {
        let full = data.len() - data.len() % MAX_SHA_BLOCK_SIZE;
        self.compress(&data[..full]);

        let tail = &data[full..];
        let bits = (prior + data.len() as u64).wrapping_mul(8);
        let pad_len = if tail.len() < 56 { 64 } else { 128 };
        let mut pad = Zeroizing::new(vec![0u8; pad_len]);
        pad[..tail.len()].copy_from_slice(tail);
        pad[tail.len()] = 0x80;
        pad[pad_len - 8..].copy_from_slice(&bits.to_be_bytes());
        self.compress(&pad);
    }
}

fn count(auth_data: [u32; 2]) -> u64 {
    ((auth_data[1] as u64) << 32) | auth_data[0] as u64
}

fn split_count(n: u64) -> [u32; 2] {
    [n as u32, (n >> 32) as u32]
}

/// Absorb `data`; non-final passes must be whole blocks
fn absorb(state: &mut ShaState, job: &HashJob, prefix: u64) -> CeResult<u64> {
    let hashed = count(job.auth_data);
    let len = job.data.len() as u64;
    if job.last_blk {
        state.finish(&job.data, prefix + hashed);
    } else {
        if job.data.len() % MAX_SHA_BLOCK_SIZE != 0 {
            return Err(CeError::invalid(format!(
                "{} byte partial block on a non-final pass",
                job.data.len()
            )));
        }
        state.compress(&job.data);
    }
    Ok(hashed + len)
}

fn pad_key(key: &[u8], pad: u8) -> CeResult<Zeroizing<[u8; MAX_SHA_BLOCK_SIZE]>> {
    if key.len() > MAX_SHA_BLOCK_SIZE {
        return Err(CeError::invalid(format!("{} byte HMAC key", key.len())));
    }
    let mut block = Zeroizing::new([pad; MAX_SHA_BLOCK_SIZE]);
    for (b, k) in block.iter_mut().zip(key) {
        *b ^= k;
    }
    Ok(block)
}

/// Run one hash pass
pub(crate) fn run(job: &HashJob) -> CeResult<HashResult> {
    match job.alg {
        HashAlg::Sha1 | HashAlg::Sha256 => {
            let mut state = ShaState::load(job.alg, &job.digest);
            let hashed = absorb(&mut state, job, 0)?;
            Ok(HashResult { digest: state.store(), auth_data: split_count(hashed) })
        }
        HashAlg::Sha1Hmac | HashAlg::Sha256Hmac => hmac(job),
        HashAlg::AesCmac => {
            let tag = cmac(&job.auth_key, &job.data)?;
            let mut digest = [0u8; MAX_SHA_DIGEST];
            digest[..AES_BLOCK_SIZE].copy_from_slice(&tag);
            Ok(HashResult { digest, auth_data: split_count(job.data.len() as u64) })
        }
    }
}

/// Keyed pass; the ipad block is hashed on the first pass and the outer
/// hash is done on the last
fn hmac(job: &HashJob) -> CeResult<HashResult> {
    let base = job.alg.base();
    let mut state = ShaState::load(base, &job.digest);
    if job.first_blk {
        state.compress(&*pad_key(&job.auth_key, IPAD)?);
    }
    let hashed = absorb(&mut state, job, MAX_SHA_BLOCK_SIZE as u64)?;
    if !job.last_blk {
        return Ok(HashResult { digest: state.store(), auth_data: split_count(hashed) });
    }

    let n = job.alg.digest_size();
    let inner = Zeroizing::new(state.store());
    let mut outer = ShaState::load(base, &initial_digest(base));
    outer.compress(&*pad_key(&job.auth_key, OPAD)?);
    outer.finish(&inner[..n], MAX_SHA_BLOCK_SIZE as u64);
    Ok(HashResult { digest: outer.store(), auth_data: split_count(hashed) })
}

fn dbl(block: [u8; AES_BLOCK_SIZE]) -> [u8; AES_BLOCK_SIZE] {
    let v = u128::from_be_bytes(block);
    let r = (v << 1) ^ if v >> 127 == 1 { 0x87 } else { 0 };
    r.to_be_bytes()
}

/// AES-CMAC (RFC 4493)
pub(crate) fn cmac(key: &[u8], msg: &[u8]) -> CeResult<[u8; AES_BLOCK_SIZE]> {
    let cipher = BlockKey::new(CipherAlg::Aes, key)?;
    let mut l = [0u8; AES_BLOCK_SIZE];
    cipher.encrypt_block(&mut l);
    let k1 = dbl(l);
    let k2 = dbl(k1);

    let blocks = msg.len().div_ceil(AES_BLOCK_SIZE).max(1);
    let complete = !msg.is_empty() && msg.len() % AES_BLOCK_SIZE == 0;

    let mut x = [0u8; AES_BLOCK_SIZE];
    for block in msg.chunks(AES_BLOCK_SIZE).take(blocks - 1) {
        for (a, b) in x.iter_mut().zip(block) {
            *a ^= b;
        }
        cipher.encrypt_block(&mut x);
    }

    let rest = &msg[(blocks - 1) * AES_BLOCK_SIZE..];
    let mut last = [0u8; AES_BLOCK_SIZE];
    last[..rest.len()].copy_from_slice(rest);
    let subkey = if complete {
        k1
    } else {
        last[rest.len()] = 0x80;
        k2
    };
    for ((a, b), k) in x.iter_mut().zip(last).zip(subkey) {
        *a ^= b ^ k;
    }
    cipher.encrypt_block(&mut x);
    Ok(x)
}

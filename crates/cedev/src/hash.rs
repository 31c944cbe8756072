//! Incremental hash state tracker
//!
//! A [`HashContext`] carries SHA-1/SHA-256 state between Init, Update and
//! Final calls on one session: the running digest, the two byte counters,
//! and a trailing buffer with the bytes that did not yet fill a 64-byte
//! block. Every engine pass starts from the stored state and writes the
//! new state back, so any split of a message into Update calls yields the
//! same digest.
//!
//! HMAC runs natively when the engine supports it. Otherwise the context
//! builds it from plain hash passes:
//!
//! ```text
//! init:   trailing = (K ^ 0x36)                     one full block
//! update: H_in  <- message
//! final:  inner = H_in.final
//!         H_out = fresh IV, first block = (K ^ 0x5C)
//!         digest = H_out(inner).final
//! ```
//!
//! Keys longer than one block are hashed down first; shorter keys are
//! zero-padded.

use zeroize::{Zeroize, Zeroizing};

use crate::buffer::ScratchBuf;
use crate::chunk::{gather, plan_chunks};
use crate::device::Device;
use crate::error::{CeError, CeResult};
use crate::job::{EngineJob, HashJob};
use crate::supervisor::{RequestKind, WaitOutcome};
use crate::types::{
    HashAlg, ShaOpReq, AES_KEY_256, CACHE_LINE_SIZE, CMAC_DIGEST_SIZE, MAX_SHA_BLOCK_SIZE,
    MAX_SHA_DIGEST,
};

const HMAC_IPAD: u8 = 0x36;
const HMAC_OPAD: u8 = 0x5C;

/// SHA-1 initial hash value, big-endian
pub const SHA1_IV: [u8; 20] = [
    0x67, 0x45, 0x23, 0x01, 0xEF, 0xCD, 0xAB, 0x89, 0x98, 0xBA, 0xDC, 0xFE, 0x10, 0x32, 0x54, 0x76,
    0xC3, 0xD2, 0xE1, 0xF0,
];

/// SHA-256 initial hash value, big-endian
pub const SHA256_IV: [u8; 32] = [
    0x6A, 0x09, 0xE6, 0x67, 0xBB, 0x67, 0xAE, 0x85, 0x3C, 0x6E, 0xF3, 0x72, 0xA5, 0x4F, 0xF5, 0x3A,
    0x51, 0x0E, 0x52, 0x7F, 0x9B, 0x05, 0x68, 0x8C, 0x1F, 0x83, 0xD9, 0xAB, 0x5B, 0xE0, 0xCD, 0x19,
];

/// Digest buffer seeded with the initial hash value of `alg`
pub fn initial_digest(alg: HashAlg) -> [u8; MAX_SHA_DIGEST] {
    let mut digest = [0u8; MAX_SHA_DIGEST];
    match alg.base() {
        HashAlg::Sha1 => digest[..SHA1_IV.len()].copy_from_slice(&SHA1_IV),
        HashAlg::Sha256 => digest.copy_from_slice(&SHA256_IV),
        _ => {}
    }
    digest
}

/// Position in the Init/Update/Final sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashState {
    /// No session, or the last one was finalized
    Uninitialized,
    /// Init done, nothing hashed on the engine yet
    Initialized,
    /// At least one engine pass done
    Updating,
}

/// Per-session hash state
pub struct HashContext {
    alg: Option<HashAlg>,
    digest: [u8; MAX_SHA_DIGEST],
    auth_data: [u32; 2],
    trailing: [u8; MAX_SHA_BLOCK_SIZE],
    trailing_len: usize,
    first_blk: bool,
    last_blk: bool,
    authkey: [u8; MAX_SHA_BLOCK_SIZE],
    authklen: usize,
    diglen: usize,
    init_done: bool,
}

impl Default for HashContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HashContext {
    pub fn new() -> Self {
        Self {
            alg: None,
            digest: [0; MAX_SHA_DIGEST],
            auth_data: [0; 2],
            trailing: [0; MAX_SHA_BLOCK_SIZE],
            trailing_len: 0,
            first_blk: false,
            last_blk: false,
            authkey: [0; MAX_SHA_BLOCK_SIZE],
            authklen: 0,
            diglen: 0,
            init_done: false,
        }
    }

    pub fn state(&self) -> HashState {
        match (self.init_done, self.first_blk) {
            (false, _) => HashState::Uninitialized,
            (true, true) => HashState::Initialized,
            (true, false) => HashState::Updating,
        }
    }

    /// Algorithm of the current session
    pub fn alg(&self) -> Option<HashAlg> {
        self.alg
    }

    /// Bytes waiting for a full block
    pub fn trailing_len(&self) -> usize {
        self.trailing_len
    }

    /// Total bytes hashed on the engine so far
    pub fn byte_count(&self) -> u64 {
        ((self.auth_data[1] as u64) << 32) | self.auth_data[0] as u64
    }

    /// Scrub and de-initialize
    pub fn clear(&mut self) {
        self.digest.zeroize();
        self.auth_data.zeroize();
        self.trailing.zeroize();
        self.authkey.zeroize();
        self.trailing_len = 0;
        self.authklen = 0;
        self.diglen = 0;
        self.first_blk = false;
        self.last_blk = false;
        self.init_done = false;
        self.alg = None;
    }

    fn sha_init(&mut self, alg: HashAlg) {
        self.clear();
        self.digest = initial_digest(alg);
        self.diglen = alg.digest_size();
        self.first_blk = true;
        self.alg = Some(alg);
        self.init_done = true;
    }

    fn require_session(&self, stage: &str, alg: HashAlg) -> CeResult<HashAlg> {
        let current = match (self.init_done, self.alg) {
            (true, Some(current)) => current,
            _ => return Err(CeError::Usage(format!("hash {} before init", stage))),
        };
        if current != alg {
            return Err(CeError::invalid(format!(
                "hash {} with {} on a {} session",
                stage,
                alg.name(),
                current.name()
            )));
        }
        Ok(current)
    }

    /// Start a session; HMAC keys are read from caller memory
    pub(crate) fn init(&mut self, device: &Device, req: &ShaOpReq) -> CeResult<()> {
        match req.alg {
            HashAlg::Sha1 | HashAlg::Sha256 => {
                self.sha_init(req.alg);
                Ok(())
            }
            HashAlg::Sha1Hmac | HashAlg::Sha256Hmac => self.hmac_init(device, req),
            HashAlg::AesCmac => Err(CeError::Usage("AES-CMAC is single-shot".to_string())),
        }
    }

    fn hmac_init(&mut self, device: &Device, req: &ShaOpReq) -> CeResult<()> {
        let klen = req.authklen as usize;
        let mut key = ScratchBuf::zeroed(klen)?;
        device.memory().copy_from_user(req.authkey, &mut key)?;

        if klen <= MAX_SHA_BLOCK_SIZE {
            self.sha_init(req.alg);
            self.authkey[..klen].copy_from_slice(&key);
            self.authklen = klen;
        } else {
            // Hash the key down to one digest with the base algorithm
            self.sha_init(req.alg.base());
            for piece in key.chunks(self.slice_limit(device)) {
                self.absorb(device, piece.len(), |dst| {
                    dst.copy_from_slice(piece);
                    Ok(())
                })?;
            }
            self.final_pass(device)?;
            let hashed = Zeroizing::new(self.digest);
            let n = req.alg.digest_size();

            self.sha_init(req.alg);
            self.authkey[..n].copy_from_slice(&hashed[..n]);
            self.authklen = n;
        }

        if !device.support().sha_hmac {
            for (t, k) in self.trailing.iter_mut().zip(self.authkey.iter()) {
                *t = k ^ HMAC_IPAD;
            }
            self.trailing_len = MAX_SHA_BLOCK_SIZE;
        }
        Ok(())
    }

    /// Largest caller slice per pass so trailing bytes plus the slice stay
    /// within the per-job limit
    fn slice_limit(&self, device: &Device) -> usize {
        device.config().transfer.max_oper_data - MAX_SHA_BLOCK_SIZE
    }

    /// Feed message bytes; running digest is copied into `req`
    pub(crate) fn update(&mut self, device: &Device, req: &mut ShaOpReq) -> CeResult<()> {
        self.require_session("update", req.alg)?;

        let mem = device.memory();
        for chunk in plan_chunks(&req.data, self.slice_limit(device), 0) {
            self.absorb(device, chunk.len, |dst| gather(mem, &chunk.pieces, dst))?;
        }

        req.digest = self.digest;
        Ok(())
    }

    /// Complete the session and report the digest in `req`
    pub(crate) fn finalize(&mut self, device: &Device, req: &mut ShaOpReq) -> CeResult<()> {
        let alg = self.require_session("final", req.alg)?;

        if alg.is_hmac() && !device.support().sha_hmac {
            self.final_pass(device)?;
            self.outer_pass(device)?;
        }
        self.final_pass(device)?;

        let n = self.diglen.min(MAX_SHA_DIGEST);
        req.digest = [0; MAX_SHA_DIGEST];
        req.digest[..n].copy_from_slice(&self.digest[..n]);
        req.diglen = n as u32;
        self.clear();
        Ok(())
    }

    /// Combine `len` new bytes with the trailing buffer and hash the whole
    /// blocks, keeping the remainder (0..=63 bytes) for the next call
    fn absorb(
        &mut self,
        device: &Device,
        len: usize,
        fill: impl FnOnce(&mut [u8]) -> CeResult<()>,
    ) -> CeResult<()> {
        let held = self.trailing_len;
        let total = held + len;

        if total < MAX_SHA_BLOCK_SIZE {
            fill(&mut self.trailing[held..total])?;
            self.trailing_len = total;
            return Ok(());
        }

        let mut buf = ScratchBuf::zeroed(total)?;
        buf[..held].copy_from_slice(&self.trailing[..held]);
        fill(&mut buf[held..])?;

        let tail = total % MAX_SHA_BLOCK_SIZE;
        let aligned = total - tail;
        self.trailing.zeroize();
        self.trailing[..tail].copy_from_slice(&buf[aligned..]);
        self.trailing_len = tail;

        buf.truncate(aligned);
        self.submit_pass(device, buf)
    }

    /// Hash the trailing bytes as the last block
    fn final_pass(&mut self, device: &Device) -> CeResult<()> {
        self.last_blk = true;
        let buf = ScratchBuf::from_slice(&self.trailing[..self.trailing_len])?;
        self.trailing.zeroize();
        self.trailing_len = 0;
        self.submit_pass(device, buf)
    }

    /// Restart with the outer pad block and queue the inner digest behind it
    fn outer_pass(&mut self, device: &Device) -> CeResult<()> {
        let n = self.diglen;
        let inner = Zeroizing::new(self.digest);

        let mut opad = ScratchBuf::zeroed(MAX_SHA_BLOCK_SIZE)?;
        for (o, k) in opad.iter_mut().zip(self.authkey.iter()) {
            *o = k ^ HMAC_OPAD;
        }

        let alg = self.alg.unwrap_or(HashAlg::Sha256);
        self.digest = initial_digest(alg);
        self.auth_data = [0; 2];
        self.first_blk = true;
        self.last_blk = false;
        self.submit_pass(device, opad)?;

        self.trailing[..n].copy_from_slice(&inner[..n]);
        self.trailing_len = n;
        Ok(())
    }

    /// One engine pass from the stored state
    fn submit_pass(&mut self, device: &Device, data: ScratchBuf) -> CeResult<()> {
        let alg = self.alg.ok_or_else(|| CeError::Usage("hash pass without a session".into()))?;
        let native = alg.is_hmac() && device.support().sha_hmac;

        let job = HashJob {
            alg: if native { alg } else { alg.base() },
            auth_key: Zeroizing::new(if native {
                self.authkey[..self.authklen].to_vec()
            } else {
                Vec::new()
            }),
            digest: self.digest,
            auth_data: self.auth_data,
            first_blk: self.first_blk,
            last_blk: self.last_blk,
            data,
        };

        let output = match device.submit_and_wait(RequestKind::Hash, EngineJob::Hash(job))? {
            WaitOutcome::Done(output) => output,
            WaitOutcome::Recovered(anomaly) => return Err(CeError::HardwareAnomaly(anomaly)),
        };
        if let Some(digest) = output.digest {
            self.digest = digest;
        }
        if let Some(auth_data) = output.auth_data {
            self.auth_data = auth_data;
        }
        self.first_blk = false;
        self.last_blk = false;
        Ok(())
    }
}

impl Drop for HashContext {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for HashContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashContext")
            .field("alg", &self.alg)
            .field("state", &self.state())
            .field("trailing_len", &self.trailing_len)
            .field("byte_count", &self.byte_count())
            .finish()
    }
}

/// Single-shot AES-CMAC over the whole message
///
/// Uses its own state so an open SHA session on the same handle is left
/// untouched.
pub(crate) fn cmac(device: &Device, req: &mut ShaOpReq) -> CeResult<()> {
    let diglen = match req.diglen as usize {
        0 => CMAC_DIGEST_SIZE,
        n if n <= CMAC_DIGEST_SIZE => n,
        n => return Err(CeError::invalid(format!("CMAC digest length {} exceeds 16", n))),
    };
    if req.data_len > u32::MAX - (CACHE_LINE_SIZE * 2) as u32 {
        return Err(CeError::invalid(format!("CMAC data length {} overflows", req.data_len)));
    }

    let mem = device.memory();
    let klen = (req.authklen as usize).min(AES_KEY_256);
    let mut key = Zeroizing::new(vec![0u8; klen]);
    mem.copy_from_user(req.authkey, &mut key)?;

    let mut buf = ScratchBuf::zeroed(req.data_len as usize)?;
    gather(mem, &req.data, &mut buf)?;

    let job = HashJob {
        alg: HashAlg::AesCmac,
        auth_key: key,
        digest: [0; MAX_SHA_DIGEST],
        auth_data: [0; 2],
        first_blk: true,
        last_blk: true,
        data: buf,
    };
    let output = match device.submit_and_wait(RequestKind::Hash, EngineJob::Hash(job))? {
        WaitOutcome::Done(output) => output,
        WaitOutcome::Recovered(anomaly) => return Err(CeError::HardwareAnomaly(anomaly)),
    };
    let tag = output.digest.ok_or_else(|| CeError::Io("engine returned no CMAC".into()))?;

    req.digest = [0; MAX_SHA_DIGEST];
    req.digest[..diglen].copy_from_slice(&tag[..diglen]);
    req.diglen = diglen as u32;
    Ok(())
}

//! Client sessions
//!
//! A [`ClientHandle`] is one open session on a [`Device`]. It owns a hash
//! context and the list of external buffers it has mapped. Every operation
//! takes its descriptor by value, validates it, runs it and hands the
//! updated descriptor back.
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "sim")]
//! # {
//! use cedev::sim::{SimMemory, SimulatedEngine};
//! use cedev::{BufSegment, DeviceBuilder, HashAlg, ShaOpReq};
//! use std::sync::Arc;
//!
//! let memory = Arc::new(SimMemory::new());
//! let engine = Arc::new(SimulatedEngine::new(memory.clone()));
//! let device = DeviceBuilder::new(engine, memory.clone()).build().unwrap();
//! let mut handle = device.open();
//!
//! let msg = memory.alloc_with(b"abc");
//! let req = ShaOpReq::new(HashAlg::Sha256).with_data(vec![BufSegment::new(msg, 3)]);
//! let req = handle.hash_digest(req).unwrap();
//! assert_eq!(req.digest_bytes()[0], 0xba);
//! # }
//! ```

use std::sync::Arc;

use crate::chunk::{run_cipher, run_offload};
use crate::device::Device;
use crate::error::{CeError, CeResult};
use crate::hash::{cmac, HashContext, HashState};
use crate::types::{
    CipherOpReq, HashAlg, MapBufReq, OffloadCipherOpReq, ShaOpReq, UnmapBufReq, MAX_BUFFERS,
};
use crate::validate;

/// One imported external buffer
#[derive(Debug, Clone, PartialEq, Eq)]
struct BufferMapping {
    fd: i32,
    offset: u64,
    size: u64,
    vaddr: u64,
    refs: u32,
}

/// Open session on a device
pub struct ClientHandle {
    device: Arc<Device>,
    sha_ctx: HashContext,
    mappings: Vec<BufferMapping>,
    holds_bandwidth: bool,
}

impl ClientHandle {
    pub(crate) fn new(device: Arc<Device>, holds_bandwidth: bool) -> Self {
        Self { device, sha_ctx: HashContext::new(), mappings: Vec::new(), holds_bandwidth }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    // =========================================================================
    // Cipher
    // =========================================================================

    /// Run a cipher descriptor in the direction its `op` names
    ///
    /// Output lands in the destination segments; the chaining IV is
    /// returned in the descriptor.
    pub fn cipher(&mut self, mut req: CipherOpReq) -> CeResult<CipherOpReq> {
        validate::check_cipher(&req, &self.device.support())?;
        run_cipher(&self.device, &mut req)?;
        Ok(req)
    }

    /// Encrypt (`Enc` or `EncNoKey` only)
    pub fn encrypt(&mut self, req: CipherOpReq) -> CeResult<CipherOpReq> {
        if !req.op.is_encrypt() {
            return Err(CeError::invalid(format!("{:?} on the encrypt path", req.op)));
        }
        self.cipher(req)
    }

    /// Decrypt (`Dec` or `DecNoKey` only)
    pub fn decrypt(&mut self, req: CipherOpReq) -> CeResult<CipherOpReq> {
        if req.op.is_encrypt() {
            return Err(CeError::invalid(format!("{:?} on the decrypt path", req.op)));
        }
        self.cipher(req)
    }

    /// Offload cipher over mapped buffers with pipe keys
    ///
    /// A pipe-key anomaly found during timeout recovery is reported in
    /// `err` of the returned descriptor rather than as an error.
    pub fn offload_cipher(&mut self, mut req: OffloadCipherOpReq) -> CeResult<OffloadCipherOpReq> {
        validate::check_offload(&req)?;
        run_offload(&self.device, &mut req)?;
        Ok(req)
    }

    // =========================================================================
    // Hash
    // =========================================================================

    /// Start a SHA or HMAC session
    pub fn hash_init(&mut self, req: ShaOpReq) -> CeResult<ShaOpReq> {
        validate::check_sha(&req)?;
        let _hash = self.device.hash_lock();
        self.sha_ctx.init(&self.device, &req)?;
        Ok(req)
    }

    /// Feed message data; the running digest is returned in the descriptor
    pub fn hash_update(&mut self, mut req: ShaOpReq) -> CeResult<ShaOpReq> {
        validate::check_sha(&req)?;
        let _hash = self.device.hash_lock();
        self.sha_ctx.update(&self.device, &mut req)?;
        Ok(req)
    }

    /// Finish the session and return the digest
    pub fn hash_final(&mut self, mut req: ShaOpReq) -> CeResult<ShaOpReq> {
        validate::check_sha(&req)?;
        let _hash = self.device.hash_lock();
        self.sha_ctx.finalize(&self.device, &mut req)?;
        Ok(req)
    }

    /// Init, Update and Final under one hold of the hash lock
    pub fn hash_digest(&mut self, mut req: ShaOpReq) -> CeResult<ShaOpReq> {
        validate::check_sha(&req)?;
        if req.alg == HashAlg::AesCmac {
            return Err(CeError::Usage("use cmac for AES-CMAC".to_string()));
        }
        let _hash = self.device.hash_lock();
        self.sha_ctx.init(&self.device, &req)?;
        let result = self
            .sha_ctx
            .update(&self.device, &mut req)
            .and_then(|_| self.sha_ctx.finalize(&self.device, &mut req));
        if result.is_err() {
            self.sha_ctx.clear();
        }
        result.map(|_| req)
    }

    /// Single-shot AES-CMAC
    pub fn cmac(&mut self, mut req: ShaOpReq) -> CeResult<ShaOpReq> {
        if !self.device.support().cmac {
            return Err(CeError::NotSupported("AES-CMAC".to_string()));
        }
        if req.alg != HashAlg::AesCmac {
            return Err(CeError::invalid(format!("{} on the CMAC path", req.alg.name())));
        }
        validate::check_sha(&req)?;
        let _hash = self.device.hash_lock();
        cmac(&self.device, &mut req)?;
        Ok(req)
    }

    /// Where this session's hash context stands
    pub fn hash_state(&self) -> HashState {
        self.sha_ctx.state()
    }

    // =========================================================================
    // Buffer Mapping
    // =========================================================================

    /// Import external buffers; mapping an fd again reuses its mapping
    pub fn map_buffers(&mut self, mut req: MapBufReq) -> CeResult<MapBufReq> {
        let n = req.fds.len();
        if n > MAX_BUFFERS || req.fd_offsets.len() != n || req.fd_sizes.len() != n {
            return Err(CeError::invalid(format!("malformed map request for {} fds", n)));
        }

        req.buf_vaddr = Vec::with_capacity(n);
        for i in 0..n {
            let vaddr = self.map_one(req.fds[i], req.fd_offsets[i], req.fd_sizes[i])?;
            tracing::debug!("mapped fd {} at 0x{:x}", req.fds[i], vaddr);
            req.buf_vaddr.push(vaddr);
        }
        Ok(req)
    }

    fn map_one(&mut self, fd: i32, offset: u64, size: u64) -> CeResult<u64> {
        if size == 0 {
            return Err(CeError::invalid(format!("zero-sized mapping for fd {}", fd)));
        }
        if let Some(m) = self.mappings.iter_mut().find(|m| m.fd == fd) {
            if m.offset != offset || m.size != size {
                return Err(CeError::invalid(format!(
                    "fd {} already mapped with a different range",
                    fd
                )));
            }
            m.refs += 1;
            return Ok(m.vaddr);
        }

        let vaddr = self.device.importer().map(fd, offset, size)?;
        self.mappings.push(BufferMapping { fd, offset, size, vaddr, refs: 1 });
        Ok(vaddr)
    }

    /// Drop one reference per fd; the mapping is released at zero
    pub fn unmap_buffers(&mut self, req: UnmapBufReq) -> CeResult<()> {
        if req.fds.len() > MAX_BUFFERS {
            return Err(CeError::invalid(format!("unmap request for {} fds", req.fds.len())));
        }
        // Every fd must hold as many references as the request drops
        for &fd in &req.fds {
            let held = self.mappings.iter().find(|m| m.fd == fd).map_or(0, |m| m.refs);
            let dropped = req.fds.iter().filter(|&&f| f == fd).count() as u32;
            if held < dropped {
                return Err(CeError::invalid(format!(
                    "fd {} unmapped {} times with {} references",
                    fd, dropped, held
                )));
            }
        }

        for &fd in &req.fds {
            let Some(pos) = self.mappings.iter().position(|m| m.fd == fd) else {
                continue;
            };
            if self.mappings[pos].refs > 1 {
                self.mappings[pos].refs -= 1;
                continue;
            }
            let vaddr = self.mappings[pos].vaddr;
            self.device.importer().unmap(vaddr)?;
            self.mappings.remove(pos);
            tracing::debug!("unmapped fd {} from 0x{:x}", fd, vaddr);
        }
        Ok(())
    }

    /// Number of distinct mapped buffers
    pub fn mapped_count(&self) -> usize {
        self.mappings.len()
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        for mapping in self.mappings.drain(..) {
            if let Err(e) = self.device.importer().unmap(mapping.vaddr) {
                tracing::warn!("failed to unmap fd {} on close: {}", mapping.fd, e);
            }
        }
        self.sha_ctx.clear();
        if self.holds_bandwidth {
            self.device.release_bandwidth();
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("hash", &self.sha_ctx)
            .field("mappings", &self.mappings.len())
            .finish()
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::config::CeConfig;
    use crate::device::DeviceBuilder;
    use crate::error::HwAnomaly;
    use crate::sim::{SimMemory, SimulatedEngine};
    use crate::stats::StatsSnapshot;
    use crate::types::{
        BufSegment, CeSupport, CipherAlg, CipherMode, CipherOper, OffloadErr, OffloadOper,
        PatternInfo, StatusRegisters,
    };
    use hmac::{Hmac, Mac};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sha1::Sha1;
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    struct Bench {
        device: Arc<Device>,
        memory: Arc<SimMemory>,
        engine: Arc<SimulatedEngine>,
    }

    fn bench(config: CeConfig) -> Bench {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let memory = Arc::new(SimMemory::new());
        let engine = Arc::new(SimulatedEngine::with_config(memory.clone(), config.sim.clone()));
        let device = DeviceBuilder::new(engine.clone(), memory.clone())
            .importer(memory.clone())
            .config(config)
            .build()
            .unwrap();
        Bench { device, memory, engine }
    }

    fn small_chunks() -> CeConfig {
        CeConfig::default().with_max_oper_data(512).with_max_offload_transfer(512)
    }

    fn native_hmac() -> CeConfig {
        let support = CeSupport { sha_hmac: true, ..CeConfig::default().sim.support };
        small_chunks().with_sim_support(support)
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill(&mut data[..]);
        data
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    /// Place `data` in memory as one segment
    fn place(memory: &SimMemory, data: &[u8]) -> BufSegment {
        BufSegment::new(memory.alloc_with(data), data.len() as u32)
    }

    /// Place `data` split into segments of the given lengths
    fn scatter(memory: &SimMemory, data: &[u8], lens: &[usize]) -> Vec<BufSegment> {
        let mut at = 0;
        lens.iter()
            .map(|&n| {
                let seg = place(memory, &data[at..at + n]);
                at += n;
                seg
            })
            .collect()
    }

    fn gather_all(memory: &SimMemory, segs: &[BufSegment]) -> Vec<u8> {
        segs.iter().flat_map(|s| memory.read(s.vaddr, s.len as usize).unwrap()).collect()
    }

    fn no_data() -> Vec<BufSegment> {
        vec![BufSegment::new(0, 0)]
    }

    fn sha_req(alg: HashAlg, data: Vec<BufSegment>) -> ShaOpReq {
        ShaOpReq::new(alg).with_data(data)
    }

    // =========================================================================
    // Hash
    // =========================================================================

    #[test]
    fn test_sha256_abc() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let msg = place(&b.memory, b"abc");

        let req = handle.hash_digest(sha_req(HashAlg::Sha256, vec![msg])).unwrap();
        assert_eq!(
            req.digest_bytes(),
            hex("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(handle.hash_state(), HashState::Uninitialized);
        assert_eq!(b.device.stats().snapshot().sha_success, 1);
    }

    #[test]
    fn test_sha1_abc_staged() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let msg = place(&b.memory, b"abc");

        handle.hash_init(sha_req(HashAlg::Sha1, no_data())).unwrap();
        assert_eq!(handle.hash_state(), HashState::Initialized);
        handle.hash_update(sha_req(HashAlg::Sha1, vec![msg])).unwrap();
        let req = handle.hash_final(sha_req(HashAlg::Sha1, no_data())).unwrap();
        assert_eq!(req.diglen, 20);
        assert_eq!(req.digest_bytes(), hex("a9993e364706816aba3e25717850c26c9cd0d89d"));
    }

    #[test]
    fn test_split_updates_match_one_shot() {
        let b = bench(small_chunks());
        let mut handle = b.device.open();
        let msg = random_bytes(2000, 1);

        handle.hash_init(sha_req(HashAlg::Sha256, no_data())).unwrap();
        let mut at = 0;
        for n in [1, 63, 64, 65, 300, 7, 1500] {
            let segs = scatter(&b.memory, &msg[at..at + n], &[n / 2, n - n / 2]);
            let segs: Vec<_> = segs.into_iter().filter(|s| s.len > 0).collect();
            let req = handle.hash_update(sha_req(HashAlg::Sha256, segs)).unwrap();
            assert_eq!(req.diglen, 0);
            at += n;
        }
        assert_eq!(at, msg.len());
        assert_eq!(handle.hash_state(), HashState::Updating);

        let req = handle.hash_final(sha_req(HashAlg::Sha256, no_data())).unwrap();
        assert_eq!(req.digest_bytes(), Sha256::digest(&msg).as_slice());
    }

    #[test]
    fn test_multi_chunk_update() {
        let b = bench(small_chunks());
        let mut handle = b.device.open();
        let msg = random_bytes(5000, 2);
        let segs = scatter(&b.memory, &msg, &[1000, 3, 3997]);

        let req = handle.hash_digest(sha_req(HashAlg::Sha1, segs)).unwrap();
        assert_eq!(req.digest_bytes(), Sha1::digest(&msg).as_slice());
        // 448-byte slices, one final pass
        assert!(b.device.stats().snapshot().sha_success > 10);
    }

    #[test]
    fn test_running_digest_reported() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let msg = place(&b.memory, &[0x61; 128]);

        handle.hash_init(sha_req(HashAlg::Sha256, no_data())).unwrap();
        let req = handle.hash_update(sha_req(HashAlg::Sha256, vec![msg])).unwrap();
        assert_ne!(req.digest, crate::hash::initial_digest(HashAlg::Sha256));
        assert_ne!(req.digest, [0u8; 32]);
    }

    #[test]
    fn test_hash_sequence_errors() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let msg = place(&b.memory, b"abc");

        let err = handle.hash_update(sha_req(HashAlg::Sha256, vec![msg])).unwrap_err();
        assert!(matches!(err, CeError::Usage(_)));
        assert!(handle.hash_final(sha_req(HashAlg::Sha256, no_data())).is_err());

        handle.hash_init(sha_req(HashAlg::Sha256, no_data())).unwrap();
        let err = handle.hash_update(sha_req(HashAlg::Sha1, vec![msg])).unwrap_err();
        assert!(err.is_invalid_argument());

        // Zero entries never reach the engine
        assert!(handle.hash_update(sha_req(HashAlg::Sha256, vec![])).is_err());
        assert_eq!(b.engine.jobs_run(), 0);
    }

    fn reference_hmac256(key: &[u8], msg: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(msg);
        mac.finalize().into_bytes().to_vec()
    }

    fn run_hmac(b: &Bench, alg: HashAlg, key: &[u8], msg: &[u8]) -> Vec<u8> {
        let mut handle = b.device.open();
        let key = place(&b.memory, key);
        let keyed = |data| sha_req(alg, data).with_key(key.vaddr, key.len);

        handle.hash_init(keyed(no_data())).unwrap();
        let half = msg.len() / 2;
        handle.hash_update(keyed(vec![place(&b.memory, &msg[..half])])).unwrap();
        handle.hash_update(keyed(vec![place(&b.memory, &msg[half..])])).unwrap();
        let req = handle.hash_final(keyed(no_data())).unwrap();
        req.digest_bytes().to_vec()
    }

    const FOX: &[u8] = b"The quick brown fox jumps over the lazy dog";

    #[test]
    fn test_hmac_sha256_built_from_passes() {
        let b = bench(small_chunks());
        assert!(!b.device.support().sha_hmac);
        let digest = run_hmac(&b, HashAlg::Sha256Hmac, b"key", FOX);
        assert_eq!(
            digest,
            hex("f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8")
        );
    }

    #[test]
    fn test_hmac_sha256_native() {
        let b = bench(native_hmac());
        assert!(b.device.support().sha_hmac);
        let digest = run_hmac(&b, HashAlg::Sha256Hmac, b"key", FOX);
        assert_eq!(digest, reference_hmac256(b"key", FOX));
    }

    #[test]
    fn test_hmac_long_key_and_long_message() {
        let key = random_bytes(100, 3);
        let msg = random_bytes(3000, 4);
        for config in [small_chunks(), native_hmac()] {
            let b = bench(config);
            let digest = run_hmac(&b, HashAlg::Sha256Hmac, &key, &msg);
            assert_eq!(digest, reference_hmac256(&key, &msg));

            let mut mac = Hmac::<Sha1>::new_from_slice(&key).unwrap();
            mac.update(&msg);
            let expected = mac.finalize().into_bytes().to_vec();
            assert_eq!(run_hmac(&b, HashAlg::Sha1Hmac, &key, &msg), expected);
        }
    }

    #[test]
    fn test_hmac_block_sized_key() {
        let key = random_bytes(64, 5);
        let b = bench(small_chunks());
        assert_eq!(run_hmac(&b, HashAlg::Sha256Hmac, &key, FOX), reference_hmac256(&key, FOX));
    }

    // =========================================================================
    // CMAC
    // =========================================================================

    fn cmac_req(b: &Bench, msg: &[u8], diglen: u32) -> ShaOpReq {
        let key = place(&b.memory, &hex("2b7e151628aed2a6abf7158809cf4f3c"));
        let data = if msg.is_empty() { no_data() } else { vec![place(&b.memory, msg)] };
        let mut req = sha_req(HashAlg::AesCmac, data).with_key(key.vaddr, key.len);
        req.diglen = diglen;
        req
    }

    #[test]
    fn test_cmac_known_answers() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();

        let req = handle.cmac(cmac_req(&b, &[], 0)).unwrap();
        assert_eq!(req.digest_bytes(), hex("bb1d6929e95937287fa37d129b756746"));

        let msg = hex("6bc1bee22e409f96e93d7e117393172a");
        let req = handle.cmac(cmac_req(&b, &msg, 4)).unwrap();
        assert_eq!(req.digest_bytes(), hex("070a16b4"));

        assert!(handle.cmac(cmac_req(&b, &msg, 17)).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_cmac_leaves_sha_session() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();

        handle.hash_init(sha_req(HashAlg::Sha256, no_data())).unwrap();
        handle.hash_update(sha_req(HashAlg::Sha256, vec![place(&b.memory, b"ab")])).unwrap();
        handle.cmac(cmac_req(&b, b"interleaved", 0)).unwrap();
        handle.hash_update(sha_req(HashAlg::Sha256, vec![place(&b.memory, b"c")])).unwrap();
        let req = handle.hash_final(sha_req(HashAlg::Sha256, no_data())).unwrap();
        assert_eq!(req.digest_bytes(), Sha256::digest(b"abc").as_slice());
    }

    #[test]
    fn test_cmac_requires_support() {
        let support = CeSupport { cmac: false, ..CeConfig::default().sim.support };
        let b = bench(CeConfig::default().with_sim_support(support));
        let mut handle = b.device.open();
        assert!(matches!(handle.cmac(cmac_req(&b, b"x", 0)), Err(CeError::NotSupported(_))));
        let err = handle.hash_digest(cmac_req(&b, b"x", 0)).unwrap_err();
        assert!(matches!(err, CeError::Usage(_)));
    }

    // =========================================================================
    // Cipher
    // =========================================================================

    fn cipher_req(
        b: &Bench,
        alg: CipherAlg,
        mode: CipherMode,
        op: CipherOper,
        input: &[u8],
        lens: &[usize],
    ) -> (CipherOpReq, Vec<BufSegment>) {
        let src = scatter(&b.memory, input, lens);
        let dst = scatter(&b.memory, &vec![0u8; input.len()], lens);
        let req = CipherOpReq::new(alg, mode, op).with_segments(src, dst.clone());
        (req, dst)
    }

    fn aes_req(
        b: &Bench,
        mode: CipherMode,
        op: CipherOper,
        input: &[u8],
        lens: &[usize],
    ) -> (CipherOpReq, Vec<BufSegment>) {
        cipher_req(b, CipherAlg::Aes, mode, op, input, lens)
    }

    /// Encrypt then decrypt `plain`; returns the ciphertext
    fn round_trip(
        b: &Bench,
        alg: CipherAlg,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        plain: &[u8],
    ) -> Vec<u8> {
        let mut handle = b.device.open();
        let lens = [plain.len() / 3, plain.len() - plain.len() / 3];

        let (req, dst) = cipher_req(b, alg, mode, CipherOper::Enc, plain, &lens);
        let mut req = req.with_key(key);
        if !iv.is_empty() {
            req = req.with_iv(iv);
        }
        handle.encrypt(req).unwrap();
        let cipher = gather_all(&b.memory, &dst);
        assert_ne!(cipher, plain);

        let (req, dst) = cipher_req(b, alg, mode, CipherOper::Dec, &cipher, &lens);
        let mut req = req.with_key(key);
        if !iv.is_empty() {
            req = req.with_iv(iv);
        }
        handle.decrypt(req).unwrap();
        assert_eq!(gather_all(&b.memory, &dst), plain);
        cipher
    }

    /// AES ciphertext with small chunks and with one job per request
    fn chunked_and_whole(
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        plain: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let chunked = round_trip(&bench(small_chunks()), CipherAlg::Aes, mode, key, iv, plain);
        let whole = round_trip(&bench(CeConfig::default()), CipherAlg::Aes, mode, key, iv, plain);
        (chunked, whole)
    }

    #[test]
    fn test_aes_cbc_chunked_matches_unchunked() {
        let plain = random_bytes(2000, 6);
        let key = random_bytes(16, 7);
        let iv = random_bytes(16, 8);
        let (chunked, whole) = chunked_and_whole(CipherMode::AesCbc, &key, &iv, &plain);
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_aes_cbc_known_answer_and_chaining_iv() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let plain = hex("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51");
        let (req, dst) = aes_req(&b, CipherMode::AesCbc, CipherOper::Enc, &plain, &[32]);
        let req = req
            .with_key(&hex("2b7e151628aed2a6abf7158809cf4f3c"))
            .with_iv(&hex("000102030405060708090a0b0c0d0e0f"));
        let req = handle.encrypt(req).unwrap();
        let expected = hex("7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2");
        assert_eq!(gather_all(&b.memory, &dst), expected);
        assert_eq!(req.iv_bytes(), &expected[16..]);
        assert_eq!(b.device.stats().snapshot().enc_success, 1);
    }

    #[test]
    fn test_aes_ecb_and_256_bit_keys() {
        let plain = random_bytes(1024, 9);
        let key = random_bytes(32, 10);
        let b = bench(small_chunks());
        round_trip(&b, CipherAlg::Aes, CipherMode::AesEcb, &key, &[], &plain);
        round_trip(&b, CipherAlg::Aes, CipherMode::AesCbc, &key, &[1; 16], &plain);
    }

    #[test]
    fn test_aes_ctr_chunked_matches_unchunked() {
        let plain = random_bytes(1500, 11);
        let key = random_bytes(16, 12);
        let iv = [0xFF; 16];
        let (chunked, whole) = chunked_and_whole(CipherMode::AesCtr, &key, &iv, &plain);
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_ctr_byteoffset_continues_keystream() {
        let b = bench(small_chunks());
        let mut handle = b.device.open();
        let key = random_bytes(16, 13);
        let iv = random_bytes(16, 14);
        let plain = random_bytes(1500, 15);

        // Reference: encrypt five filler bytes plus the data from the block start
        let mut padded = vec![0u8; 5];
        padded.extend_from_slice(&plain);
        let lens = [padded.len()];
        let (req, ref_dst) = aes_req(&b, CipherMode::AesCtr, CipherOper::Enc, &padded, &lens);
        handle.encrypt(req.with_key(&key).with_iv(&iv)).unwrap();
        let reference = gather_all(&b.memory, &ref_dst);

        let (req, dst) = aes_req(&b, CipherMode::AesCtr, CipherOper::Enc, &plain, &[700, 800]);
        handle.encrypt(req.with_key(&key).with_iv(&iv).with_byteoffset(5)).unwrap();
        assert_eq!(gather_all(&b.memory, &dst), reference[5..].to_vec());
    }

    #[test]
    fn test_aes_xts_chunked_matches_unchunked() {
        let plain = random_bytes(2048 + 32, 16);
        let key = random_bytes(32, 17);
        let iv = [3u8; 16];
        let (chunked, whole) = chunked_and_whole(CipherMode::AesXts, &key, &iv, &plain);
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_des_and_triple_des_cbc() {
        let plain = random_bytes(800, 18);
        let b = bench(small_chunks());
        let (des_key, tdes_key) = (random_bytes(8, 19), random_bytes(24, 20));
        round_trip(&b, CipherAlg::Des, CipherMode::DesCbc, &des_key, &[7; 8], &plain);
        round_trip(&b, CipherAlg::TripleDes, CipherMode::DesCbc, &tdes_key, &[7; 8], &plain);
        round_trip(&b, CipherAlg::TripleDes, CipherMode::DesEcb, &tdes_key, &[], &plain);
    }

    #[test]
    fn test_direction_checked_per_entry_point() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let data = [0u8; 16];
        let (req, _) = aes_req(&b, CipherMode::AesEcb, CipherOper::Dec, &data, &[16]);
        assert!(handle.encrypt(req.with_key(&[1; 16])).unwrap_err().is_invalid_argument());
        let (req, _) = aes_req(&b, CipherMode::AesEcb, CipherOper::EncNoKey, &data, &[16]);
        assert!(handle.decrypt(req).unwrap_err().is_invalid_argument());
        assert_eq!(b.engine.jobs_run(), 0);
    }

    #[test]
    fn test_no_key_op_uses_pipe_key() {
        let b = bench(CeConfig::default());
        b.engine.set_pipe_key(&[9; 16]);
        let mut handle = b.device.open();
        let plain = random_bytes(64, 22);

        let (req, dst) = aes_req(&b, CipherMode::AesCbc, CipherOper::EncNoKey, &plain, &[64]);
        handle.encrypt(req.with_iv(&[0; 16])).unwrap();
        let (req, dst2) = aes_req(&b, CipherMode::AesCbc, CipherOper::Enc, &plain, &[64]);
        handle.encrypt(req.with_key(&[9; 16]).with_iv(&[0; 16])).unwrap();
        assert_eq!(gather_all(&b.memory, &dst), gather_all(&b.memory, &dst2));
    }

    #[test]
    fn test_no_key_ops_not_counted() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let plain = random_bytes(64, 31);

        let (req, dst) = aes_req(&b, CipherMode::AesCbc, CipherOper::EncNoKey, &plain, &[64]);
        handle.encrypt(req.with_iv(&[0; 16])).unwrap();
        let cipher = gather_all(&b.memory, &dst);
        let (req, dst) = aes_req(&b, CipherMode::AesCbc, CipherOper::DecNoKey, &cipher, &[64]);
        handle.decrypt(req.with_iv(&[0; 16])).unwrap();
        assert_eq!(gather_all(&b.memory, &dst), plain);

        assert_eq!(b.engine.jobs_run(), 2);
        assert_eq!(b.device.stats().snapshot(), StatsSnapshot::default());

        let (req, _) = aes_req(&b, CipherMode::AesCbc, CipherOper::Enc, &plain, &[64]);
        handle.encrypt(req.with_key(&[2; 16]).with_iv(&[0; 16])).unwrap();
        assert_eq!(b.device.stats().snapshot().enc_success, 1);
    }

    #[test]
    fn test_bad_descriptor_rejected_before_engine() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let (mut req, _) = aes_req(&b, CipherMode::AesCbc, CipherOper::Enc, &[0; 32], &[32]);
        req.data_len = 48;
        let err = handle.encrypt(req.with_key(&[1; 16]).with_iv(&[0; 16])).unwrap_err();
        assert_eq!(err.errno(), crate::error::errno::EINVAL);
        assert_eq!(b.device.stats().snapshot().enc_fail, 0);
    }

    #[test]
    fn test_bad_user_pointer_faults() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let dst = place(&b.memory, &[0; 32]);
        let req = CipherOpReq::new(CipherAlg::Aes, CipherMode::AesEcb, CipherOper::Enc)
            .with_key(&[1; 16])
            .with_segments(vec![BufSegment::new(0x10, 32)], vec![dst]);
        assert!(matches!(handle.encrypt(req), Err(CeError::UserBufferFault { vaddr: 0x10, .. })));
    }

    // =========================================================================
    // Offload
    // =========================================================================

    /// Map `data` through a dma-buf and return the imported segment
    fn import(handle: &mut ClientHandle, memory: &SimMemory, data: &[u8]) -> BufSegment {
        let fd = memory.register_dmabuf(data);
        let req = MapBufReq {
            fds: vec![fd],
            fd_offsets: vec![0],
            fd_sizes: vec![data.len() as u64],
            buf_vaddr: Vec::new(),
        };
        let req = handle.map_buffers(req).unwrap();
        BufSegment::new(req.buf_vaddr[0], data.len() as u32)
    }

    #[test]
    fn test_offload_ctr_matches_explicit_key() {
        let b = bench(small_chunks());
        let key = random_bytes(16, 23);
        b.engine.set_pipe_key(&key);
        let mut handle = b.device.open();
        let plain = random_bytes(1500, 24);
        let iv = random_bytes(16, 25);

        let src = import(&mut handle, &b.memory, &plain);
        let dst = import(&mut handle, &b.memory, &vec![0; plain.len()]);
        let req = OffloadCipherOpReq::new(CipherMode::AesCtr, OffloadOper::HlosCpb, 16)
            .with_iv(&iv)
            .with_segments(vec![src], vec![dst]);
        let before = b.device.stats().snapshot();
        let req = handle.offload_cipher(req).unwrap();
        assert_eq!(req.err, OffloadErr::NoError);
        // Offload requests are not counted
        assert_eq!(b.device.stats().snapshot(), before);
        let offloaded = gather_all(&b.memory, &[dst]);

        let (req, ref_dst) = aes_req(&b, CipherMode::AesCtr, CipherOper::Enc, &plain, &[1500]);
        handle.encrypt(req.with_key(&key).with_iv(&iv)).unwrap();
        assert_eq!(offloaded, gather_all(&b.memory, &ref_dst));
        // One count per 512-byte chunk of the reference encrypt
        assert_eq!(b.device.stats().snapshot().enc_success, 3);
    }

    #[test]
    fn test_offload_cbc_decrypts() {
        let b = bench(small_chunks());
        let key = random_bytes(32, 26);
        b.engine.set_pipe_key(&key);
        let mut handle = b.device.open();
        let plain = random_bytes(1024, 27);
        let iv = [4u8; 16];

        let (req, enc_dst) = aes_req(&b, CipherMode::AesCbc, CipherOper::Enc, &plain, &[1024]);
        handle.encrypt(req.with_key(&key).with_iv(&iv)).unwrap();
        let cipher = gather_all(&b.memory, &enc_dst);

        let src = import(&mut handle, &b.memory, &cipher);
        let dst = import(&mut handle, &b.memory, &vec![0; cipher.len()]);
        let req = OffloadCipherOpReq::new(CipherMode::AesCbc, OffloadOper::HlosHlos, 32)
            .with_iv(&iv)
            .with_segments(vec![src], vec![dst]);
        handle.offload_cipher(req).unwrap();
        assert_eq!(gather_all(&b.memory, &[dst]), plain);
    }

    #[test]
    fn test_offload_copy_and_pattern() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let plain = random_bytes(160, 28);

        let src = import(&mut handle, &b.memory, &plain);
        let dst = import(&mut handle, &b.memory, &vec![0; plain.len()]);
        let mut req = OffloadCipherOpReq::new(CipherMode::AesCtr, OffloadOper::HlosHlos, 16)
            .with_iv(&[0; 16])
            .with_segments(vec![src], vec![dst]);
        req.is_copy_op = true;
        handle.offload_cipher(req.clone()).unwrap();
        assert_eq!(gather_all(&b.memory, &[dst]), plain);

        // One block processed in every two
        req.is_copy_op = false;
        let req = req.with_pattern(PatternInfo { patt_sz: 2, proc_data_sz: 1, patt_offset: 0 });
        handle.offload_cipher(req).unwrap();
        let out = gather_all(&b.memory, &[dst]);
        for block in 0..10 {
            let range = block * 16..(block + 1) * 16;
            assert_eq!(out[range.clone()] == plain[range], block % 2 == 1, "block {}", block);
        }
    }

    #[test]
    fn test_offload_rejects_ecb() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let src = place(&b.memory, &[0; 32]);
        let dst = place(&b.memory, &[0; 32]);
        let req = OffloadCipherOpReq::new(CipherMode::AesEcb, OffloadOper::HlosHlos, 16)
            .with_segments(vec![src], vec![dst]);
        assert!(handle.offload_cipher(req).unwrap_err().is_invalid_argument());
    }

    // =========================================================================
    // Buffer Mapping
    // =========================================================================

    #[test]
    fn test_map_refcount() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let fd = b.memory.register_dmabuf(&[5; 256]);
        let req = MapBufReq {
            fds: vec![fd],
            fd_offsets: vec![0],
            fd_sizes: vec![256],
            buf_vaddr: Vec::new(),
        };

        let first = handle.map_buffers(req.clone()).unwrap().buf_vaddr[0];
        let second = handle.map_buffers(req).unwrap().buf_vaddr[0];
        assert_eq!(first, second);
        assert_eq!(handle.mapped_count(), 1);
        assert_eq!(b.memory.import_count(), 1);

        handle.unmap_buffers(UnmapBufReq { fds: vec![fd] }).unwrap();
        assert_eq!(b.memory.import_count(), 1);
        handle.unmap_buffers(UnmapBufReq { fds: vec![fd] }).unwrap();
        assert_eq!(b.memory.import_count(), 0);
        assert_eq!(handle.mapped_count(), 0);

        let err = handle.unmap_buffers(UnmapBufReq { fds: vec![fd] }).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_failed_unmap_leaves_mappings() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let first = b.memory.register_dmabuf(&[1; 64]);
        let second = b.memory.register_dmabuf(&[2; 64]);
        for fd in [first, second] {
            let req = MapBufReq {
                fds: vec![fd],
                fd_offsets: vec![0],
                fd_sizes: vec![64],
                buf_vaddr: Vec::new(),
            };
            handle.map_buffers(req).unwrap();
        }

        let err = handle.unmap_buffers(UnmapBufReq { fds: vec![first, 999] }).unwrap_err();
        assert!(err.is_invalid_argument());
        let err = handle.unmap_buffers(UnmapBufReq { fds: vec![second, second] }).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(handle.mapped_count(), 2);
        assert_eq!(b.memory.import_count(), 2);

        handle.unmap_buffers(UnmapBufReq { fds: vec![first, second] }).unwrap();
        assert_eq!(handle.mapped_count(), 0);
        assert_eq!(b.memory.import_count(), 0);
    }

    #[test]
    fn test_map_request_checks() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        let fd = b.memory.register_dmabuf(&[0; 64]);

        let ragged = MapBufReq {
            fds: vec![fd, fd],
            fd_offsets: vec![0],
            fd_sizes: vec![64],
            buf_vaddr: vec![],
        };
        assert!(handle.map_buffers(ragged).is_err());

        let too_many = MapBufReq {
            fds: vec![fd; 17],
            fd_offsets: vec![0; 17],
            fd_sizes: vec![64; 17],
            buf_vaddr: vec![],
        };
        assert!(handle.map_buffers(too_many).unwrap_err().is_invalid_argument());

        let out_of_range = MapBufReq {
            fds: vec![fd],
            fd_offsets: vec![32],
            fd_sizes: vec![64],
            buf_vaddr: vec![],
        };
        assert!(handle.map_buffers(out_of_range).is_err());
        assert_eq!(handle.mapped_count(), 0);
    }

    #[test]
    fn test_close_releases_mappings() {
        let b = bench(CeConfig::default());
        let mut handle = b.device.open();
        import(&mut handle, &b.memory, &[1; 64]);
        import(&mut handle, &b.memory, &[2; 64]);
        assert_eq!(b.memory.import_count(), 2);
        drop(handle);
        assert_eq!(b.memory.import_count(), 0);
        assert_eq!(b.device.bandwidth_refs(), 0);
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn quick_timeout() -> CeConfig {
        CeConfig::default().with_wait_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_hung_cipher_times_out_and_device_recovers() {
        let b = bench(quick_timeout());
        let mut handle = b.device.open();
        let plain = random_bytes(64, 29);

        b.engine.hang_next();
        let (req, _) = aes_req(&b, CipherMode::AesEcb, CipherOper::Enc, &plain, &[64]);
        let err = handle.encrypt(req.with_key(&[1; 16])).unwrap_err();
        assert!(matches!(err, CeError::Timeout { timeout_ms: 50 }));
        assert!(err.is_recoverable());
        assert!(b.device.is_idle());

        let (req, _) = aes_req(&b, CipherMode::AesEcb, CipherOper::Enc, &plain, &[64]);
        handle.encrypt(req.with_key(&[1; 16])).unwrap();
        let stats = b.device.stats().snapshot();
        assert_eq!((stats.enc_fail, stats.enc_success), (1, 1));
        assert!(!b.engine.overlap_detected());
    }

    #[test]
    fn test_hung_cipher_reports_anomaly() {
        let b = bench(quick_timeout());
        let mut handle = b.device.open();
        b.engine.hang_next();
        b.engine.set_status(StatusRegisters([0, 0, 0x0010_0000, 0, 0, 0]));

        let (req, _) = aes_req(&b, CipherMode::AesEcb, CipherOper::Dec, &[0; 16], &[16]);
        let err = handle.decrypt(req.with_key(&[1; 16])).unwrap_err();
        assert!(matches!(err, CeError::HardwareAnomaly(HwAnomaly::KeyPaused)));
        assert_eq!(b.device.stats().snapshot().dec_fail, 1);
    }

    #[test]
    fn test_hung_offload_sets_err() {
        let b = bench(quick_timeout().with_max_offload_transfer(512));
        let mut handle = b.device.open();
        let plain = random_bytes(1024, 30);
        let src = import(&mut handle, &b.memory, &plain);
        let dst = import(&mut handle, &b.memory, &vec![0; plain.len()]);

        b.engine.hang_next();
        b.engine.set_status(StatusRegisters([0, 0, 0, 0, 0, 0x2]));
        let req = OffloadCipherOpReq::new(CipherMode::AesCtr, OffloadOper::CpbHlos, 16)
            .with_iv(&[0; 16])
            .with_segments(vec![src], vec![dst]);
        let req = handle.offload_cipher(req).unwrap();
        assert_eq!(req.err, OffloadErr::KeyTimerExpired);
        // The second piece was never submitted
        assert_eq!(b.engine.jobs_run(), 0);
        assert_eq!(gather_all(&b.memory, &[dst]), vec![0; plain.len()]);
    }

    #[test]
    fn test_hung_hash_clears_nothing_else() {
        let b = bench(quick_timeout());
        let mut handle = b.device.open();
        b.engine.hang_next();
        let abc = place(&b.memory, b"abc");
        let err = handle.hash_digest(sha_req(HashAlg::Sha256, vec![abc])).unwrap_err();
        assert!(matches!(err, CeError::Timeout { .. }));
        assert_eq!(handle.hash_state(), HashState::Uninitialized);

        let req = handle.hash_digest(sha_req(HashAlg::Sha256, vec![abc])).unwrap();
        assert_eq!(req.digest_bytes(), Sha256::digest(b"abc").as_slice());
    }

    #[test]
    fn test_concurrent_clients_share_engine() {
        let mut config = CeConfig::default().with_max_oper_data(512);
        config.sim.latency_us = 200;
        let b = bench(config);

        let workers: Vec<_> = (0..4u64)
            .map(|i| {
                let device = Arc::clone(&b.device);
                let memory = Arc::clone(&b.memory);
                std::thread::spawn(move || {
                    let mut handle = device.open();
                    let msg = random_bytes(1000 + i as usize * 100, 40 + i);
                    let seg = place(&memory, &msg);
                    let req = handle.hash_digest(sha_req(HashAlg::Sha256, vec![seg])).unwrap();
                    assert_eq!(req.digest_bytes(), Sha256::digest(&msg).as_slice());

                    let (src, dst) = (place(&memory, &msg[..512]), place(&memory, &[0; 512]));
                    let req = CipherOpReq::new(CipherAlg::Aes, CipherMode::AesCtr, CipherOper::Enc)
                        .with_key(&[i as u8; 16])
                        .with_iv(&[0; 16])
                        .with_segments(vec![src], vec![dst]);
                    handle.encrypt(req).unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(!b.engine.overlap_detected());
        assert!(b.device.is_idle());
        assert_eq!(b.device.stats().snapshot().enc_success, 4);
    }
}

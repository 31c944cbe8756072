//! Request descriptors and engine-facing types

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{CeError, HwAnomaly};

/// Maximum number of scatter/gather entries in one descriptor
pub const MAX_BUFFERS: usize = 16;

/// Largest key accepted (AES-256 XTS carries two keys)
pub const MAX_KEY_SIZE: usize = 64;

/// Largest IV accepted
pub const MAX_IV_SIZE: usize = 32;

/// SHA-1 and SHA-256 block size
pub const MAX_SHA_BLOCK_SIZE: usize = 64;

/// Digest buffer size (SHA-256)
pub const MAX_SHA_DIGEST: usize = 32;

pub const SHA1_DIGEST_SIZE: usize = 20;
pub const SHA256_DIGEST_SIZE: usize = 32;
pub const CMAC_DIGEST_SIZE: usize = 16;

pub const AES_BLOCK_SIZE: usize = 16;
pub const DES_BLOCK_SIZE: usize = 8;

pub const AES_KEY_128: usize = 16;
pub const AES_KEY_192: usize = 24;
pub const AES_KEY_256: usize = 32;
pub const DES_KEY_SIZE: usize = 8;
pub const TRIPLE_DES_KEY_SIZE: usize = 24;

/// Scratch buffers are aligned to this boundary
pub const CACHE_LINE_SIZE: usize = 64;

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $code:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl TryFrom<u32> for $name {
            type Error = CeError;

            fn try_from(code: u32) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(CeError::invalid(format!(
                        "{} code {} out of range",
                        stringify!($name),
                        code
                    ))),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }
    };
}

wire_enum! {
    /// Block cipher algorithm
    CipherAlg {
        Des = 0,
        TripleDes = 1,
        Aes = 2,
    }
}

wire_enum! {
    /// Cipher mode; the `Aes`/`Des` prefix names the algorithm family it belongs to
    CipherMode {
        AesCbc = 0,
        AesEcb = 1,
        AesCtr = 2,
        AesXts = 3,
        AesCcm = 4,
        DesCbc = 5,
        DesEcb = 6,
    }
}

wire_enum! {
    /// Cipher direction and key source
    CipherOper {
        Dec = 0,
        Enc = 1,
        /// Decrypt with the pipe-resident key
        DecNoKey = 2,
        /// Encrypt with the pipe-resident key
        EncNoKey = 3,
    }
}

wire_enum! {
    /// Hash algorithm
    HashAlg {
        Sha1 = 0,
        Sha256 = 1,
        Sha1Hmac = 2,
        Sha256Hmac = 3,
        AesCmac = 4,
    }
}

wire_enum! {
    /// Content-protection pipeline path of an offload request
    OffloadOper {
        /// HLOS buffer to HLOS buffer
        HlosHlos = 1,
        /// HLOS buffer to content-protected buffer
        HlosCpb = 2,
        /// Content-protected buffer to HLOS buffer
        CpbHlos = 3,
    }
}

wire_enum! {
    /// Error code an offload request reports in its descriptor
    OffloadErr {
        NoError = 0,
        KeyTimerExpired = 1,
        KeyPause = 2,
        GenericError = 3,
    }
}

impl From<HwAnomaly> for OffloadErr {
    fn from(anomaly: HwAnomaly) -> Self {
        match anomaly {
            HwAnomaly::KeyTimerExpired => OffloadErr::KeyTimerExpired,
            HwAnomaly::KeyPaused => OffloadErr::KeyPause,
            HwAnomaly::GenericError => OffloadErr::GenericError,
        }
    }
}

impl CipherMode {
    /// Check whether this mode belongs to the DES family
    pub fn is_des(&self) -> bool {
        matches!(self, CipherMode::DesCbc | CipherMode::DesEcb)
    }

    /// Check whether this mode takes no IV
    pub fn is_ecb(&self) -> bool {
        matches!(self, CipherMode::AesEcb | CipherMode::DesEcb)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherMode::AesCbc => "AES-CBC",
            CipherMode::AesEcb => "AES-ECB",
            CipherMode::AesCtr => "AES-CTR",
            CipherMode::AesXts => "AES-XTS",
            CipherMode::AesCcm => "AES-CCM",
            CipherMode::DesCbc => "DES-CBC",
            CipherMode::DesEcb => "DES-ECB",
        }
    }
}

impl CipherAlg {
    /// Cipher block size in bytes
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlg::Aes => AES_BLOCK_SIZE,
            CipherAlg::Des | CipherAlg::TripleDes => DES_BLOCK_SIZE,
        }
    }
}

impl CipherOper {
    /// Encrypt direction
    pub fn is_encrypt(&self) -> bool {
        matches!(self, CipherOper::Enc | CipherOper::EncNoKey)
    }

    /// Uses the pipe-resident key
    pub fn is_no_key(&self) -> bool {
        matches!(self, CipherOper::EncNoKey | CipherOper::DecNoKey)
    }
}

impl HashAlg {
    /// Digest size produced by this algorithm
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlg::Sha1 | HashAlg::Sha1Hmac => SHA1_DIGEST_SIZE,
            HashAlg::Sha256 | HashAlg::Sha256Hmac => SHA256_DIGEST_SIZE,
            HashAlg::AesCmac => CMAC_DIGEST_SIZE,
        }
    }

    pub fn is_hmac(&self) -> bool {
        matches!(self, HashAlg::Sha1Hmac | HashAlg::Sha256Hmac)
    }

    /// Underlying digest algorithm of an HMAC variant
    pub fn base(&self) -> HashAlg {
        match self {
            HashAlg::Sha1Hmac => HashAlg::Sha1,
            HashAlg::Sha256Hmac => HashAlg::Sha256,
            other => *other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlg::Sha1 => "SHA-1",
            HashAlg::Sha256 => "SHA-256",
            HashAlg::Sha1Hmac => "HMAC-SHA1",
            HashAlg::Sha256Hmac => "HMAC-SHA256",
            HashAlg::AesCmac => "AES-CMAC",
        }
    }
}

/// One scatter/gather entry: a caller address and a length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufSegment {
    /// Caller virtual address; zero is a null pointer
    pub vaddr: u64,

    /// Length in bytes
    pub len: u32,
}

impl BufSegment {
    pub fn new(vaddr: u64, len: u32) -> Self {
        Self { vaddr, len }
    }
}

/// Cipher operation descriptor
#[derive(Clone)]
pub struct CipherOpReq {
    /// Source segments
    pub src: Vec<BufSegment>,

    /// Destination segments
    pub dst: Vec<BufSegment>,

    /// Declared total length
    pub data_len: u32,

    /// IV; updated with the chaining value on return
    pub iv: [u8; MAX_IV_SIZE],

    pub ivlen: u32,

    /// Start offset inside the first counter block (CTR only)
    pub byteoffset: u32,

    /// Key bytes; zero length selects a pipe or hardware key
    pub enckey: [u8; MAX_KEY_SIZE],

    pub encklen: u32,

    pub alg: CipherAlg,

    pub mode: CipherMode,

    pub op: CipherOper,
}

impl CipherOpReq {
    /// Create an empty descriptor for the given algorithm, mode and direction
    pub fn new(alg: CipherAlg, mode: CipherMode, op: CipherOper) -> Self {
        Self {
            src: Vec::new(),
            dst: Vec::new(),
            data_len: 0,
            iv: [0; MAX_IV_SIZE],
            ivlen: 0,
            byteoffset: 0,
            enckey: [0; MAX_KEY_SIZE],
            encklen: 0,
            alg,
            mode,
            op,
        }
    }

    /// Set the key (truncated to `MAX_KEY_SIZE`)
    pub fn with_key(mut self, key: &[u8]) -> Self {
        let n = key.len().min(MAX_KEY_SIZE);
        self.enckey = [0; MAX_KEY_SIZE];
        self.enckey[..n].copy_from_slice(&key[..n]);
        self.encklen = n as u32;
        self
    }

    /// Set the IV (truncated to `MAX_IV_SIZE`)
    pub fn with_iv(mut self, iv: &[u8]) -> Self {
        let n = iv.len().min(MAX_IV_SIZE);
        self.iv = [0; MAX_IV_SIZE];
        self.iv[..n].copy_from_slice(&iv[..n]);
        self.ivlen = n as u32;
        self
    }

    /// Set source and destination segments; the declared length is the source sum
    pub fn with_segments(mut self, src: Vec<BufSegment>, dst: Vec<BufSegment>) -> Self {
        self.data_len = src.iter().map(|s| s.len).sum();
        self.src = src;
        self.dst = dst;
        self
    }

    pub fn with_byteoffset(mut self, byteoffset: u32) -> Self {
        self.byteoffset = byteoffset;
        self
    }

    /// IV bytes currently in use
    pub fn iv_bytes(&self) -> &[u8] {
        &self.iv[..(self.ivlen as usize).min(MAX_IV_SIZE)]
    }
}

impl std::fmt::Debug for CipherOpReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherOpReq")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("data_len", &self.data_len)
            .field("ivlen", &self.ivlen)
            .field("byteoffset", &self.byteoffset)
            .field("enckey", &"[REDACTED]")
            .field("encklen", &self.encklen)
            .field("alg", &self.alg)
            .field("mode", &self.mode)
            .field("op", &self.op)
            .finish()
    }
}

impl Drop for CipherOpReq {
    fn drop(&mut self) {
        self.enckey.zeroize();
        self.iv.zeroize();
    }
}

/// Pattern for partial (subsample) encryption on the offload path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternInfo {
    /// Pattern period in blocks (1..=16)
    pub patt_sz: u8,

    /// Processed blocks at the start of each period (1..=16)
    pub proc_data_sz: u8,

    /// Offset into the first period (0..=15)
    pub patt_offset: u8,
}

impl PatternInfo {
    /// Pack into the engine register layout
    pub fn packed(&self) -> u32 {
        0x1 | ((self.patt_sz.saturating_sub(1) as u32 & 0xF) << 4)
            | ((self.proc_data_sz.saturating_sub(1) as u32 & 0xF) << 8)
            | ((self.patt_offset as u32 & 0xF) << 12)
    }
}

/// Offload cipher descriptor; keys live in the engine pipe
#[derive(Debug, Clone)]
pub struct OffloadCipherOpReq {
    pub src: Vec<BufSegment>,

    pub dst: Vec<BufSegment>,

    pub data_len: u32,

    /// IV; updated with the chaining value on return
    pub iv: [u8; MAX_IV_SIZE],

    pub ivlen: u32,

    /// Counter width in bits (CTR)
    pub iv_ctr_size: u32,

    pub byteoffset: u32,

    /// Length of the pipe key the engine uses (16 or 32)
    pub encklen: u32,

    /// AES block offset carried to the engine
    pub block_offset: u32,

    pub alg: CipherAlg,

    pub mode: CipherMode,

    pub op: OffloadOper,

    /// Pure copy through the pipeline
    pub is_copy_op: bool,

    pub is_pattern_valid: bool,

    pub pattern_info: PatternInfo,

    /// Anomaly reported by the engine on timeout
    pub err: OffloadErr,
}

impl OffloadCipherOpReq {
    pub fn new(mode: CipherMode, op: OffloadOper, encklen: u32) -> Self {
        Self {
            src: Vec::new(),
            dst: Vec::new(),
            data_len: 0,
            iv: [0; MAX_IV_SIZE],
            ivlen: 0,
            iv_ctr_size: 128,
            byteoffset: 0,
            encklen,
            block_offset: 0,
            alg: CipherAlg::Aes,
            mode,
            op,
            is_copy_op: false,
            is_pattern_valid: false,
            pattern_info: PatternInfo::default(),
            err: OffloadErr::NoError,
        }
    }

    pub fn with_iv(mut self, iv: &[u8]) -> Self {
        let n = iv.len().min(MAX_IV_SIZE);
        self.iv = [0; MAX_IV_SIZE];
        self.iv[..n].copy_from_slice(&iv[..n]);
        self.ivlen = n as u32;
        self
    }

    pub fn with_segments(mut self, src: Vec<BufSegment>, dst: Vec<BufSegment>) -> Self {
        self.data_len = src.iter().map(|s| s.len).sum();
        self.src = src;
        self.dst = dst;
        self
    }

    pub fn with_pattern(mut self, pattern: PatternInfo) -> Self {
        self.is_pattern_valid = true;
        self.pattern_info = pattern;
        self
    }

    pub fn iv_bytes(&self) -> &[u8] {
        &self.iv[..(self.ivlen as usize).min(MAX_IV_SIZE)]
    }
}

/// Hash / MAC operation descriptor
#[derive(Debug, Clone)]
pub struct ShaOpReq {
    /// Message segments
    pub data: Vec<BufSegment>,

    pub data_len: u32,

    /// Output digest
    pub digest: [u8; MAX_SHA_DIGEST],

    /// Output digest length (CMAC: requested tag length, 0 for full)
    pub diglen: u32,

    /// Caller address of the HMAC/CMAC key; zero when absent
    pub authkey: u64,

    pub authklen: u32,

    pub alg: HashAlg,
}

impl ShaOpReq {
    pub fn new(alg: HashAlg) -> Self {
        Self {
            data: Vec::new(),
            data_len: 0,
            digest: [0; MAX_SHA_DIGEST],
            diglen: 0,
            authkey: 0,
            authklen: 0,
            alg,
        }
    }

    pub fn with_data(mut self, data: Vec<BufSegment>) -> Self {
        self.data_len = data.iter().map(|s| s.len).sum();
        self.data = data;
        self
    }

    pub fn with_key(mut self, vaddr: u64, len: u32) -> Self {
        self.authkey = vaddr;
        self.authklen = len;
        self
    }

    /// Digest bytes reported by the last call
    pub fn digest_bytes(&self) -> &[u8] {
        &self.digest[..(self.diglen as usize).min(MAX_SHA_DIGEST)]
    }
}

/// Import external buffers into the engine address space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapBufReq {
    pub fds: Vec<i32>,
    pub fd_offsets: Vec<u64>,
    pub fd_sizes: Vec<u64>,
    /// Filled with the mapped addresses on return
    pub buf_vaddr: Vec<u64>,
}

/// Release imported buffers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmapBufReq {
    pub fds: Vec<i32>,
}

/// Engine capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeSupport {
    /// Native HMAC (engine performs ipad/opad)
    pub sha_hmac: bool,

    /// AES-XTS
    pub aes_xts: bool,

    /// AES-192 keys
    pub aes_key_192: bool,

    /// AES-CMAC
    pub cmac: bool,

    /// Hardware-resident key
    pub hw_key: bool,
}

/// Engine identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    /// Backend name
    pub name: String,

    /// Engine hardware revision
    pub version: String,

    /// Pipe pair serving this device
    pub pipe_pair: u32,
}

/// Snapshot of the six engine status words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusRegisters(pub [u32; 6]);

impl StatusRegisters {
    /// Status word `n` (1-based, matching the register names)
    pub fn status(&self, n: usize) -> u32 {
        match n {
            1..=6 => self.0[n - 1],
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(CipherMode::try_from(3).unwrap(), CipherMode::AesXts);
        assert_eq!(u32::from(CipherOper::EncNoKey), 3);
        assert!(CipherMode::try_from(7).is_err());
        assert!(HashAlg::try_from(5).unwrap_err().is_invalid_argument());
        assert_eq!(OffloadOper::try_from(3).unwrap(), OffloadOper::CpbHlos);
    }

    #[test]
    fn test_pattern_packing() {
        let p = PatternInfo { patt_sz: 10, proc_data_sz: 1, patt_offset: 2 };
        assert_eq!(p.packed(), 0x1 | (9 << 4) | (2 << 12));
    }

    #[test]
    fn test_builders() {
        let req = CipherOpReq::new(CipherAlg::Aes, CipherMode::AesCbc, CipherOper::Enc)
            .with_key(&[7u8; 16])
            .with_iv(&[1u8; 16])
            .with_segments(vec![BufSegment::new(0x10, 5), BufSegment::new(0x20, 11)], vec![]);
        assert_eq!(req.encklen, 16);
        assert_eq!(req.iv_bytes(), &[1u8; 16]);
        assert_eq!(req.data_len, 16);
        assert!(!format!("{:?}", req).contains("7, 7"));
    }

    #[test]
    fn test_hash_alg_helpers() {
        assert_eq!(HashAlg::Sha1Hmac.base(), HashAlg::Sha1);
        assert_eq!(HashAlg::Sha256Hmac.digest_size(), 32);
        assert!(!HashAlg::AesCmac.is_hmac());
    }

    #[test]
    fn test_status_words() {
        let regs = StatusRegisters([1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.status(1), 1);
        assert_eq!(regs.status(6), 6);
        assert_eq!(regs.status(0), 0);
    }
}

//! Engine job model
//!
//! A job is the fully formed operation handed to the engine. Data moves by
//! ownership: a contiguous job gives its [`ScratchBuf`] to the engine and
//! gets it back in [`EngineOutput`]; a mapped job names caller addresses the
//! engine reads and writes directly.

use std::sync::mpsc::Sender;

use zeroize::Zeroizing;

use crate::buffer::ScratchBuf;
use crate::types::{CipherAlg, HashAlg, OffloadOper, MAX_SHA_DIGEST};

/// Identifies one async request for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(pub u64);

/// Engine-assigned handle for an accepted job, used for timeout recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqInfo(pub u64);

/// Engine-level cipher mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Ecb,
    Cbc,
    Ctr,
    Xts,
}

/// Engine-level direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Where the engine takes the key from
#[derive(Clone)]
pub enum KeySource {
    /// Key bytes supplied with the job
    Explicit(Zeroizing<Vec<u8>>),
    /// Hardware-resident key
    HwKey,
    /// Key already loaded in the pipe; length in bytes
    Pipe { klen: usize },
}

/// Data the engine operates on
pub enum JobData {
    /// In-place over an owned scratch buffer
    Contiguous(ScratchBuf),
    /// Directly over caller memory (offload path)
    Mapped { src: u64, dst: u64, len: usize },
}

impl JobData {
    pub fn len(&self) -> usize {
        match self {
            JobData::Contiguous(buf) => buf.len(),
            JobData::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Offload-only job parameters
#[derive(Debug, Clone, Copy)]
pub struct OffloadParams {
    pub oper: OffloadOper,
    pub is_copy: bool,
    /// Packed pattern word when pattern processing is on
    pub pattern: Option<u32>,
    pub block_offset: u32,
    pub iv_ctr_size: u32,
}

/// Cipher job
pub struct CipherJob {
    pub alg: CipherAlg,
    pub mode: EngineMode,
    pub dir: Direction,
    pub key: KeySource,
    pub iv: Zeroizing<Vec<u8>>,
    pub data: JobData,
    /// Bytes of keystream to skip before the data (CTR)
    pub byte_offset: usize,
    pub offload: Option<OffloadParams>,
}

/// Hash job: one pass of the hash unit with caller-held state
pub struct HashJob {
    pub alg: HashAlg,
    /// HMAC or CMAC key when the engine does the keyed work
    pub auth_key: Zeroizing<Vec<u8>>,
    /// Running digest (big-endian state words)
    pub digest: [u8; MAX_SHA_DIGEST],
    /// Bytes hashed so far, low word first
    pub auth_data: [u32; 2],
    pub first_blk: bool,
    pub last_blk: bool,
    pub data: ScratchBuf,
}

/// Job handed to [`CryptoEngine::submit`](crate::traits::CryptoEngine::submit)
pub enum EngineJob {
    Cipher(CipherJob),
    Hash(HashJob),
}

impl EngineJob {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineJob::Cipher(job) if job.offload.is_some() => "offload",
            EngineJob::Cipher(_) => "cipher",
            EngineJob::Hash(_) => "hash",
        }
    }
}

/// Fields the engine reports back on completion
#[derive(Default)]
pub struct EngineOutput {
    /// Engine-side failure; `None` on success
    pub fault: Option<String>,

    /// Processed contiguous buffer
    pub data: Option<ScratchBuf>,

    /// Chaining IV for the next chunk
    pub iv: Option<Zeroizing<Vec<u8>>>,

    pub digest: Option<[u8; MAX_SHA_DIGEST]>,

    pub auth_data: Option<[u32; 2]>,
}

impl EngineOutput {
    /// Output reporting an engine fault
    pub fn failed(reason: impl Into<String>) -> Self {
        Self { fault: Some(reason.into()), ..Default::default() }
    }
}

/// Message from the completion callback to the device worker
pub(crate) enum WorkerMsg {
    Completed { token: RequestToken, output: EngineOutput },
    Shutdown,
}

/// Typed completion callback handed to the engine with each job
///
/// Calling [`complete`](Completion::complete) only enqueues an event; the
/// device worker does the dispatch-next work.
pub struct Completion {
    token: RequestToken,
    tx: Sender<WorkerMsg>,
}

impl Completion {
    pub(crate) fn new(token: RequestToken, tx: Sender<WorkerMsg>) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Report the job finished
    pub fn complete(self, output: EngineOutput) {
        let msg = WorkerMsg::Completed { token: self.token, output };
        if self.tx.send(msg).is_err() {
            tracing::debug!("completion for {:?} after device shutdown", self.token);
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("token", &self.token).finish()
    }
}

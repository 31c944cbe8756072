//! Simulated crypto engine for development and testing
//!
//! A software model of the single shared engine, so the device, queue,
//! chunking and hash tracking can run end to end without hardware:
//! - AES ECB/CBC/CTR/XTS, DES and 3DES ECB/CBC
//! - SHA-1/SHA-256 from caller-held state, native HMAC, AES-CMAC
//! - offload jobs over [`SimMemory`] with pattern and copy processing
//!
//! Jobs run on the engine's own thread after an optional latency and are
//! reported through the job's [`Completion`]. The engine refuses a second
//! job while one is in flight and remembers that it happened, which lets
//! tests check the device never overlaps work. Faults can be injected:
//! hang the next job, reject the next submit, or preset the status words
//! read during timeout recovery.

pub mod cipher;
pub mod hash;
pub mod memory;

pub use memory::SimMemory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::config::SimConfig;
use crate::error::{CeError, CeResult};
use crate::job::{CipherJob, Completion, EngineJob, EngineOutput, JobData, KeySource, ReqInfo};
use crate::queue::lock;
use crate::traits::{CryptoEngine, UserMemory};
use crate::types::{CeSupport, CipherAlg, EngineInfo, StatusRegisters, AES_KEY_256};

use self::cipher::{ModeParams, Pattern};

const DEFAULT_PIPE_KEY: [u8; AES_KEY_256] = [
    0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
    0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
];
const DEFAULT_HW_KEY: [u8; AES_KEY_256] = [0x5A; AES_KEY_256];

/// Keys resident in the engine rather than supplied with a job
struct ResidentKeys {
    pipe: Zeroizing<Vec<u8>>,
    hw: Zeroizing<Vec<u8>>,
}

impl ResidentKeys {
    /// Key bytes for `source`; a zero length picks the natural size for `alg`
    fn resolve(&self, alg: CipherAlg, source: &KeySource) -> CeResult<Zeroizing<Vec<u8>>> {
        let (store, klen) = match source {
            KeySource::Explicit(key) => return Ok(key.clone()),
            KeySource::HwKey => (&self.hw, 0),
            KeySource::Pipe { klen } => (&self.pipe, *klen),
        };
        let want = match (klen, alg) {
            (0, CipherAlg::Des) => 8,
            (0, CipherAlg::TripleDes) => 24,
            (0, CipherAlg::Aes) => store.len(),
            (n, _) => n,
        };
        store
            .get(..want)
            .map(|k| Zeroizing::new(k.to_vec()))
            .ok_or_else(|| CeError::invalid(format!("no {} byte resident key", want)))
    }
}

#[derive(Default)]
struct EngineState {
    /// Job currently owning the engine
    busy: Option<ReqInfo>,
    /// Held by a hang fault; its completion never fires
    hung: Option<(ReqInfo, Completion)>,
    overlap_seen: bool,
    reject_next: bool,
    hang_next: bool,
    status: StatusRegisters,
    jobs_run: u64,
}

struct SimJob {
    info: ReqInfo,
    job: EngineJob,
    done: Completion,
}

/// Software model of the crypto engine
pub struct SimulatedEngine {
    memory: Arc<SimMemory>,
    config: SimConfig,
    state: Arc<Mutex<EngineState>>,
    keys: Arc<Mutex<ResidentKeys>>,
    tx: Mutex<Option<Sender<SimJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_info: AtomicU64,
}

impl SimulatedEngine {
    /// Create an engine with the default simulated capabilities
    pub fn new(memory: Arc<SimMemory>) -> Self {
        Self::with_config(memory, SimConfig::default())
    }

    pub fn with_config(memory: Arc<SimMemory>, config: SimConfig) -> Self {
        let state = Arc::new(Mutex::new(EngineState::default()));
        let keys = Arc::new(Mutex::new(ResidentKeys {
            pipe: Zeroizing::new(DEFAULT_PIPE_KEY.to_vec()),
            hw: Zeroizing::new(DEFAULT_HW_KEY.to_vec()),
        }));
        let (tx, rx) = mpsc::channel();

        let runner = Runner {
            memory: Arc::clone(&memory),
            state: Arc::clone(&state),
            keys: Arc::clone(&keys),
            latency: Duration::from_micros(config.latency_us),
        };
        let worker = std::thread::Builder::new()
            .name("cedev-sim-engine".to_string())
            .spawn(move || runner.run(rx))
            .map_err(|e| tracing::error!("failed to start simulated engine thread: {}", e))
            .ok();

        Self {
            memory,
            config,
            state,
            keys,
            tx: Mutex::new(worker.is_some().then_some(tx)),
            worker: Mutex::new(worker),
            next_info: AtomicU64::new(1),
        }
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.memory
    }

    /// Load the key the pipe uses for no-key and offload jobs
    pub fn set_pipe_key(&self, key: &[u8]) {
        lock(&self.keys).pipe = Zeroizing::new(key.to_vec());
    }

    /// Load the hardware-resident key
    pub fn set_hw_key(&self, key: &[u8]) {
        lock(&self.keys).hw = Zeroizing::new(key.to_vec());
    }

    /// Accept the next job but never complete it
    pub fn hang_next(&self) {
        lock(&self.state).hang_next = true;
    }

    /// Refuse the next submit
    pub fn reject_next(&self) {
        lock(&self.state).reject_next = true;
    }

    /// Preset the status words until the next timeout reset
    pub fn set_status(&self, status: StatusRegisters) {
        lock(&self.state).status = status;
    }

    /// Whether a submit ever arrived while a job was in flight
    pub fn overlap_detected(&self) -> bool {
        lock(&self.state).overlap_seen
    }

    /// Jobs executed to completion
    pub fn jobs_run(&self) -> u64 {
        lock(&self.state).jobs_run
    }
}

impl CryptoEngine for SimulatedEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "cedev simulated engine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pipe_pair: 0,
        }
    }

    fn capabilities(&self) -> CeSupport {
        self.config.support
    }

    fn submit(&self, job: EngineJob, done: Completion) -> CeResult<ReqInfo> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.reject_next) {
            return Err(CeError::DispatchFailed("injected rejection".to_string()));
        }
        if let Some(busy) = state.busy {
            state.overlap_seen = true;
            return Err(CeError::DispatchFailed(format!("engine busy with {:?}", busy)));
        }

        let info = ReqInfo(self.next_info.fetch_add(1, Ordering::Relaxed));
        if std::mem::take(&mut state.hang_next) {
            tracing::debug!("{} job {:?} will hang", job.kind(), info);
            state.busy = Some(info);
            state.hung = Some((info, done));
            return Ok(info);
        }

        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or_else(|| CeError::DispatchFailed("engine stopped".into()))?;
        tx.send(SimJob { info, job, done })
            .map_err(|_| CeError::DispatchFailed("engine thread exited".to_string()))?;
        state.busy = Some(info);
        Ok(info)
    }

    fn read_status(&self) -> StatusRegisters {
        lock(&self.state).status
    }

    fn manage_timeout(&self, req_info: ReqInfo) {
        let mut state = lock(&self.state);
        if state.busy == Some(req_info) {
            state.busy = None;
        }
        if state.hung.as_ref().is_some_and(|(info, _)| *info == req_info) {
            state.hung = None;
        }
        state.status = StatusRegisters::default();
        tracing::debug!("engine reset after {:?}", req_info);
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        lock(&self.tx).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("simulated engine thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedEngine").field("config", &self.config).finish()
    }
}

/// State the engine thread works with
struct Runner {
    memory: Arc<SimMemory>,
    state: Arc<Mutex<EngineState>>,
    keys: Arc<Mutex<ResidentKeys>>,
    latency: Duration,
}

impl Runner {
    fn run(self, rx: Receiver<SimJob>) {
        while let Ok(SimJob { info, job, done }) = rx.recv() {
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            let kind = job.kind();
            let output = match self.execute(job) {
                Ok(output) => output,
                Err(e) => {
                    tracing::debug!("{} job {:?} faulted: {}", kind, info, e);
                    EngineOutput::failed(e.to_string())
                }
            };

            {
                let mut state = lock(&self.state);
                if state.busy != Some(info) {
                    // Reset by timeout recovery; the result is stale
                    tracing::debug!("dropping result of reset job {:?}", info);
                    continue;
                }
                state.busy = None;
                state.jobs_run += 1;
            }
            done.complete(output);
        }
    }

    fn execute(&self, job: EngineJob) -> CeResult<EngineOutput> {
        match job {
            EngineJob::Hash(job) => {
                let result = hash::run(&job)?;
                Ok(EngineOutput {
                    digest: Some(result.digest),
                    auth_data: Some(result.auth_data),
                    ..Default::default()
                })
            }
            EngineJob::Cipher(job) => self.cipher(job),
        }
    }

    fn cipher(&self, job: CipherJob) -> CeResult<EngineOutput> {
        let key = lock(&self.keys).resolve(job.alg, &job.key)?;
        let params = ModeParams {
            alg: job.alg,
            mode: job.mode,
            dir: job.dir,
            key: &key,
            iv: &job.iv,
            skip: job.byte_offset,
            ctr_bits: job.offload.map_or(128, |o| o.iv_ctr_size),
        };
        let pattern = job.offload.and_then(|o| o.pattern).and_then(Pattern::unpack);
        let copy = job.offload.is_some_and(|o| o.is_copy);

        match job.data {
            JobData::Contiguous(mut buf) => {
                let iv = params.apply(&mut buf)?;
                Ok(EngineOutput {
                    data: Some(buf),
                    iv: iv.map(Zeroizing::new),
                    ..Default::default()
                })
            }
            JobData::Mapped { src, dst, len } => {
                let mut data = Zeroizing::new(vec![0u8; len]);
                self.memory.copy_from_user(src, &mut data)?;
                let iv = match (copy, pattern) {
                    (true, _) => None,
                    (false, Some(p)) => params.apply_pattern(&p, &mut data)?,
                    (false, None) => params.apply(&mut data)?,
                };
                self.memory.copy_to_user(dst, &data)?;
                Ok(EngineOutput { iv: iv.map(Zeroizing::new), ..Default::default() })
            }
        }
    }
}

//! Device context
//!
//! One [`Device`] fronts one engine. It owns the request queue, the
//! completion worker thread, the device-wide hash lock, the high-bandwidth
//! reference count and the statistics. Client sessions are opened with
//! [`Device::open`] and keep the device alive through an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::CeConfig;
use crate::error::{CeError, CeResult};
use crate::handle::ClientHandle;
use crate::job::{RequestToken, WorkerMsg};
use crate::queue::{lock, RequestQueue};
use crate::stats::CeStats;
use crate::traits::{BandwidthVoter, BufferImporter, CryptoEngine, NoopVoter, UserMemory};
use crate::types::{CeSupport, EngineInfo};

/// Importer for platforms without external buffer import
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImporter;

impl BufferImporter for NoImporter {
    fn map(&self, fd: i32, _offset: u64, _size: u64) -> CeResult<u64> {
        Err(CeError::NotSupported(format!("buffer import (fd {})", fd)))
    }

    fn unmap(&self, _vaddr: u64) -> CeResult<()> {
        Ok(())
    }
}

/// Builder for [`Device`]
pub struct DeviceBuilder {
    engine: Arc<dyn CryptoEngine>,
    memory: Arc<dyn UserMemory>,
    importer: Arc<dyn BufferImporter>,
    voter: Arc<dyn BandwidthVoter>,
    config: CeConfig,
}

impl DeviceBuilder {
    /// Start from an engine and the caller memory it serves
    pub fn new(engine: Arc<dyn CryptoEngine>, memory: Arc<dyn UserMemory>) -> Self {
        Self {
            engine,
            memory,
            importer: Arc::new(NoImporter),
            voter: Arc::new(NoopVoter),
            config: CeConfig::default(),
        }
    }

    pub fn importer(mut self, importer: Arc<dyn BufferImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn voter(mut self, voter: Arc<dyn BandwidthVoter>) -> Self {
        self.voter = voter;
        self
    }

    pub fn config(mut self, config: CeConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the config and start the completion worker
    pub fn build(self) -> CeResult<Arc<Device>> {
        self.config.validate()?;

        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(RequestQueue::new(Arc::clone(&self.engine), tx.clone()));

        let worker_queue = Arc::clone(&queue);
        let worker = std::thread::Builder::new()
            .name("cedev-completion".to_string())
            .spawn(move || completion_worker(worker_queue, rx))
            .map_err(|e| CeError::Io(format!("failed to start completion worker: {}", e)))?;

        let support = self.engine.capabilities();
        let info = self.engine.info();
        tracing::info!(
            "{} {} (pipe pair {}): {:?}",
            info.name,
            info.version,
            info.pipe_pair,
            support
        );

        Ok(Arc::new(Device {
            engine: self.engine,
            memory: self.memory,
            importer: self.importer,
            voter: self.voter,
            config: self.config,
            support,
            queue,
            worker_tx: tx,
            worker: Mutex::new(Some(worker)),
            next_token: AtomicU64::new(1),
            hash_lock: Mutex::new(()),
            high_bw_refs: Mutex::new(0),
            stats: CeStats::new(),
        }))
    }
}

/// Drains completion events until shutdown
fn completion_worker(queue: Arc<RequestQueue>, rx: Receiver<WorkerMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            WorkerMsg::Completed { token, output } => queue.complete(token, output),
            WorkerMsg::Shutdown => break,
        }
    }
    tracing::debug!("completion worker exiting");
}

/// Shared device context
pub struct Device {
    engine: Arc<dyn CryptoEngine>,
    memory: Arc<dyn UserMemory>,
    importer: Arc<dyn BufferImporter>,
    voter: Arc<dyn BandwidthVoter>,
    config: CeConfig,
    support: CeSupport,
    queue: Arc<RequestQueue>,
    worker_tx: Sender<WorkerMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_token: AtomicU64,
    /// Serializes hash stages across sessions
    hash_lock: Mutex<()>,
    high_bw_refs: Mutex<u32>,
    stats: CeStats,
}

impl Device {
    /// Open a client session
    pub fn open(self: &Arc<Self>) -> ClientHandle {
        let holds_bandwidth = self.acquire_bandwidth();
        ClientHandle::new(Arc::clone(self), holds_bandwidth)
    }

    /// Engine identity
    pub fn info(&self) -> EngineInfo {
        self.engine.info()
    }

    /// Capability flags captured at build time
    pub fn support(&self) -> CeSupport {
        self.support
    }

    pub fn config(&self) -> &CeConfig {
        &self.config
    }

    pub fn stats(&self) -> &CeStats {
        &self.stats
    }

    /// Current high-bandwidth reference count
    pub fn bandwidth_refs(&self) -> u32 {
        *lock(&self.high_bw_refs)
    }

    /// No request active or pending
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub(crate) fn engine(&self) -> &dyn CryptoEngine {
        self.engine.as_ref()
    }

    pub(crate) fn memory(&self) -> &dyn UserMemory {
        self.memory.as_ref()
    }

    pub(crate) fn importer(&self) -> &dyn BufferImporter {
        self.importer.as_ref()
    }

    pub(crate) fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub(crate) fn next_token(&self) -> RequestToken {
        RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn hash_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.hash_lock)
    }

    /// Take a high-bandwidth reference; the first one votes high
    ///
    /// Returns whether a reference is now held.
    fn acquire_bandwidth(&self) -> bool {
        let mut refs = lock(&self.high_bw_refs);
        if *refs == 0 {
            if let Err(e) = self.voter.vote(true) {
                tracing::warn!("high bandwidth vote failed: {}", e);
                return false;
            }
            tracing::debug!("bandwidth voted high");
        }
        *refs += 1;
        true
    }

    /// Drop a high-bandwidth reference; the last one votes idle
    pub(crate) fn release_bandwidth(&self) {
        let mut refs = lock(&self.high_bw_refs);
        if *refs == 0 {
            return;
        }
        if *refs == 1 {
            match self.voter.vote(false) {
                Ok(()) => tracing::debug!("bandwidth voted idle"),
                Err(e) => tracing::warn!("idle bandwidth vote failed: {}", e),
            }
        }
        *refs -= 1;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.worker_tx.send(WorkerMsg::Shutdown);
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("completion worker panicked");
            }
        }
        self.queue.drain();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("support", &self.support)
            .field("config", &self.config)
            .field("bandwidth_refs", &self.bandwidth_refs())
            .finish()
    }
}

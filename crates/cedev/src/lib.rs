//! cedev: client front-end for a shared hardware crypto engine
//!
//! Many clients share one engine that runs a single job at a time. This
//! crate sits between them:
//!
//! - **Validation** of cipher, offload and hash descriptors before any work
//! - **Scheduling** through a single-server FIFO queue with completion on a
//!   worker thread, bounded waits, and timeout recovery that classifies the
//!   engine status words
//! - **Chunking** of scatter/gather requests into hardware-sized jobs with
//!   IV chaining and CTR byte offsets
//! - **Hash tracking** for incremental SHA-1/SHA-256, HMAC (native or built
//!   from plain passes) and single-shot AES-CMAC
//! - **Buffer import** of external buffers by file descriptor
//!
//! # Feature Flags
//!
//! - `sim` (default): software model of the engine and caller memory
//!
//! # Example
//!
//! ```rust,no_run
//! use cedev::{BufSegment, CipherAlg, CipherMode, CipherOpReq, CipherOper};
//!
//! let (device, memory) = cedev::create_default().unwrap();
//! let mut handle = device.open();
//!
//! let buf = memory.alloc_with(&[0u8; 64]);
//! let req = CipherOpReq::new(CipherAlg::Aes, CipherMode::AesCbc, CipherOper::Enc)
//!     .with_key(&[0x11; 16])
//!     .with_iv(&[0x22; 16])
//!     .with_segments(vec![BufSegment::new(buf, 64)], vec![BufSegment::new(buf, 64)]);
//! let req = handle.encrypt(req).unwrap();
//! println!("next iv: {:02x?}", req.iv_bytes());
//! ```

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod device;
pub mod error;
pub mod handle;
pub mod hash;
pub mod job;
pub(crate) mod queue;
pub mod stats;
pub mod supervisor;
pub mod traits;
pub mod types;
pub mod validate;

#[cfg(feature = "sim")]
pub mod sim;

// Re-export main types
pub use buffer::ScratchBuf;
pub use config::{CeConfig, ConfigError};
pub use device::{Device, DeviceBuilder, NoImporter};
pub use error::{CeError, CeResult, HwAnomaly};
pub use handle::ClientHandle;
pub use hash::HashState;
pub use stats::{CeStats, StatsSnapshot};
pub use supervisor::classify_status;
pub use traits::{BandwidthVoter, BufferImporter, CryptoEngine, NoopVoter, UserMemory};
pub use types::{
    BufSegment, CeSupport, CipherAlg, CipherMode, CipherOpReq, CipherOper, EngineInfo, HashAlg,
    MapBufReq, OffloadCipherOpReq, OffloadErr, OffloadOper, PatternInfo, ShaOpReq,
    StatusRegisters, UnmapBufReq,
};

#[cfg(feature = "sim")]
pub use sim::{SimMemory, SimulatedEngine};

/// Build a device on the simulated engine from the loaded configuration
///
/// Returns the device and the simulated memory its clients address.
#[cfg(feature = "sim")]
pub fn create_default() -> CeResult<(std::sync::Arc<Device>, std::sync::Arc<SimMemory>)> {
    use std::sync::Arc;

    let config = CeConfig::load()?;
    let memory = Arc::new(SimMemory::new());
    let engine = Arc::new(SimulatedEngine::with_config(Arc::clone(&memory), config.sim.clone()));
    let device = DeviceBuilder::new(engine, memory.clone())
        .importer(memory.clone())
        .config(config)
        .build()?;
    Ok((device, memory))
}

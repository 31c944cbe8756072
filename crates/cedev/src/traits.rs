//! Collaborator traits: the engine, caller memory, buffer import and bandwidth voting

use crate::error::CeResult;
use crate::job::{Completion, EngineJob, ReqInfo};
use crate::types::{CeSupport, EngineInfo, StatusRegisters};

/// Trait for the shared hardware crypto engine
///
/// The engine executes at most one job at a time and reports completion
/// asynchronously through the [`Completion`] handed to [`submit`].
/// Implementations must not call back into the device from inside `submit`
/// other than through the completion.
///
/// [`submit`]: CryptoEngine::submit
pub trait CryptoEngine: Send + Sync {
    // =========================================================================
    // Device Information
    // =========================================================================

    /// Get information about the engine
    fn info(&self) -> EngineInfo;

    /// Get engine capability flags
    fn capabilities(&self) -> CeSupport;

    // =========================================================================
    // Job Execution
    // =========================================================================

    /// Start a job
    ///
    /// # Arguments
    /// * `job` - Fully formed cipher or hash job
    /// * `done` - Completion to invoke exactly once when the job finishes
    ///
    /// # Returns
    /// The engine's handle for the accepted job, or `DispatchFailed` if the
    /// engine refused it (in which case `done` is dropped unused)
    fn submit(&self, job: EngineJob, done: Completion) -> CeResult<ReqInfo>;

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Read the six status words
    fn read_status(&self) -> StatusRegisters;

    /// Force the engine out of a stuck job so the next one can be dispatched
    ///
    /// The completion of the abandoned job may still fire later; the device
    /// discards it.
    fn manage_timeout(&self, req_info: ReqInfo);
}

/// Access to caller-supplied memory
pub trait UserMemory: Send + Sync {
    /// Copy `dst.len()` bytes from caller address `vaddr`
    fn copy_from_user(&self, vaddr: u64, dst: &mut [u8]) -> CeResult<()>;

    /// Copy `src` to caller address `vaddr`
    fn copy_to_user(&self, vaddr: u64, src: &[u8]) -> CeResult<()>;
}

/// Turns external buffer handles into engine-addressable buffers
pub trait BufferImporter: Send + Sync {
    /// Import `size` bytes at `offset` of the buffer behind `fd`
    ///
    /// # Returns
    /// The address the mapped buffer is reachable at
    fn map(&self, fd: i32, offset: u64, size: u64) -> CeResult<u64>;

    /// Release a mapping returned by [`map`](BufferImporter::map)
    fn unmap(&self, vaddr: u64) -> CeResult<()>;
}

/// Bus bandwidth voting for the engine clocks
pub trait BandwidthVoter: Send + Sync {
    /// Request high (`true`) or idle (`false`) bandwidth
    fn vote(&self, high: bool) -> CeResult<()>;
}

/// Voter for platforms without bandwidth control
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVoter;

impl BandwidthVoter for NoopVoter {
    fn vote(&self, _high: bool) -> CeResult<()> {
        Ok(())
    }
}

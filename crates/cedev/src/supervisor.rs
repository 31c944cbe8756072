//! Completion and recovery supervisor
//!
//! Bridges the engine's asynchronous completion to a blocking caller. Each
//! job is submitted through the [`RequestQueue`](crate::queue::RequestQueue)
//! and waited on with a bounded timeout. When the wait expires and the job
//! still owns the engine, the status registers are read and classified,
//! the engine is told to drop the job, and the queue is released again so a
//! single stuck job never wedges the device.

use std::sync::Arc;

use crate::device::Device;
use crate::error::{CeError, CeResult, HwAnomaly};
use crate::job::{EngineJob, EngineOutput};
use crate::queue::{Abandoned, AsyncRequest};
use crate::types::{CipherOper, StatusRegisters};

/// Status 3 bits raised when a pipe key timer expired
pub const KEY_TIMER_EXPIRED_STATUS3_MASK: u32 = 0x0000_00FF;
/// Status 6 bits raised when a pipe key timer expired
pub const KEY_TIMER_EXPIRED_STATUS6_MASK: u32 = 0x0000_0003;
/// Status 3 bits raised when pipe key use is paused
pub const KEY_PAUSE_STATUS3_MASK: u32 = 0x00FF_0000;
/// Status 6 bits raised when pipe key use is paused
pub const KEY_PAUSE_STATUS6_MASK: u32 = 0x0003_0000;
/// Status 1 error interrupt bit
pub const STATUS1_ERR_INTR_MASK: u32 = 0x0000_0010;

/// Operation class of a request, for recovery policy and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Only `Enc` and `Dec` are counted in the statistics
    Cipher { op: CipherOper },
    Offload,
    Hash,
}

/// What a successful wait produced
pub(crate) enum WaitOutcome {
    /// The engine completed the job
    Done(EngineOutput),
    /// An offload job timed out on a recognised pipe-key condition
    Recovered(HwAnomaly),
}

/// Classify the status words read after a timeout
///
/// Key timer expiry wins over key pause, which wins over the generic error
/// interrupt.
pub fn classify_status(status: &StatusRegisters) -> Option<HwAnomaly> {
    let (s1, s3, s6) = (status.status(1), status.status(3), status.status(6));
    if s6 & KEY_TIMER_EXPIRED_STATUS6_MASK != 0 || s3 & KEY_TIMER_EXPIRED_STATUS3_MASK != 0 {
        Some(HwAnomaly::KeyTimerExpired)
    } else if s6 & KEY_PAUSE_STATUS6_MASK != 0 || s3 & KEY_PAUSE_STATUS3_MASK != 0 {
        Some(HwAnomaly::KeyPaused)
    } else if s1 & STATUS1_ERR_INTR_MASK != 0 {
        Some(HwAnomaly::GenericError)
    } else {
        None
    }
}

impl Device {
    /// Submit one job and block until it completes or recovery finishes
    pub(crate) fn submit_and_wait(&self, kind: RequestKind, job: EngineJob) -> CeResult<WaitOutcome> {
        let req = AsyncRequest::new(self.next_token(), kind, job);
        let result = self.wait_for(&req);

        let ok = result.is_ok();
        match kind {
            RequestKind::Cipher { op: CipherOper::Enc } => self.stats().record_encrypt(ok),
            RequestKind::Cipher { op: CipherOper::Dec } => self.stats().record_decrypt(ok),
            RequestKind::Cipher { .. } => {}
            RequestKind::Hash => self.stats().record_sha(ok),
            RequestKind::Offload => {}
        }
        result
    }

    fn wait_for(&self, req: &Arc<AsyncRequest>) -> CeResult<WaitOutcome> {
        self.queue().submit(req)?;

        let timeout = self.config().wait_timeout();
        match req.wait(timeout) {
            Some(result) => result.map(WaitOutcome::Done),
            None => self.recover(req),
        }
    }

    fn recover(&self, req: &Arc<AsyncRequest>) -> CeResult<WaitOutcome> {
        let timeout_ms = self.config().queue.wait_timeout_ms;

        let req_info = match self.queue().abandon(req) {
            Abandoned::Completing => return req.wait_done().map(WaitOutcome::Done),
            Abandoned::WasPending => {
                tracing::error!(
                    "{:?} timed out after {}ms before reaching the engine",
                    req.token(),
                    timeout_ms
                );
                return Err(CeError::Timeout { timeout_ms });
            }
            Abandoned::WasActive(info) => info,
        };

        tracing::error!("wait timed out, req info = {:?}", req_info);
        let status = self.engine().read_status();
        let s = status.0;
        tracing::error!(
            "sts = 0x{:x} 0x{:x} 0x{:x} 0x{:x} 0x{:x} 0x{:x}",
            s[0], s[1], s[2], s[3], s[4], s[5]
        );

        let anomaly = classify_status(&status);
        match anomaly {
            Some(HwAnomaly::GenericError) => tracing::error!("generic crypto error"),
            Some(a) => tracing::info!("crypto {}", a),
            None => {}
        }

        if let Some(info) = req_info {
            self.engine().manage_timeout(info);
        }
        self.queue().resume();

        match (anomaly, req.kind()) {
            (Some(a), RequestKind::Offload) => Ok(WaitOutcome::Recovered(a)),
            (Some(a), _) => Err(CeError::HardwareAnomaly(a)),
            (None, _) => Err(CeError::Timeout { timeout_ms }),
        }
    }
}

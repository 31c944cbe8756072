//! Single-server request queue
//!
//! At most one [`AsyncRequest`] is active on the engine; the rest wait in a
//! FIFO. All decisions happen under one device-wide lock that is held only
//! for the slot swap and the synchronous `submit` call, never while the
//! engine is working. Callers are signalled after the lock is dropped.
//!
//! ```text
//!   submit ──► idle? ──yes──► active ──► engine.submit
//!                 │no
//!                 └──► pending (FIFO)
//!
//!   completion ──► clear active ──► signal caller ──► pop pending ──► dispatch
//!                                                       │ dispatch failed
//!                                                       └──► signal failure, pop next
//! ```

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CeError, CeResult};
use crate::job::{Completion, EngineJob, EngineOutput, ReqInfo, RequestToken, WorkerMsg};
use crate::supervisor::RequestKind;
use crate::traits::CryptoEngine;

/// Recover the guard from a poisoned lock; queue state is updated atomically
/// under the lock so it stays consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct RequestSlot {
    req_info: Option<ReqInfo>,
    result: Option<CeResult<EngineOutput>>,
    completed: bool,
}

/// One unit of work from submission until its caller observes the result
pub(crate) struct AsyncRequest {
    token: RequestToken,
    kind: RequestKind,
    job: Mutex<Option<EngineJob>>,
    slot: Mutex<RequestSlot>,
    done: Condvar,
}

impl AsyncRequest {
    pub fn new(token: RequestToken, kind: RequestKind, job: EngineJob) -> Arc<Self> {
        Arc::new(Self {
            token,
            kind,
            job: Mutex::new(Some(job)),
            slot: Mutex::new(RequestSlot::default()),
            done: Condvar::new(),
        })
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn req_info(&self) -> Option<ReqInfo> {
        lock(&self.slot).req_info
    }

    fn take_job(&self) -> Option<EngineJob> {
        lock(&self.job).take()
    }

    fn set_req_info(&self, info: ReqInfo) {
        lock(&self.slot).req_info = Some(info);
    }

    /// Record the outcome and wake the waiter; later calls are ignored
    pub fn finish(&self, result: CeResult<EngineOutput>) {
        let mut slot = lock(&self.slot);
        if slot.completed {
            return;
        }
        slot.completed = true;
        slot.result = Some(result);
        self.done.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.slot).completed
    }

    /// Wait up to `timeout` for the outcome; `None` when the wait expired
    pub fn wait(&self, timeout: Duration) -> Option<CeResult<EngineOutput>> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot);
        while !slot.completed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .done
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        Some(slot.result.take().unwrap_or(Err(CeError::DeviceClosed)))
    }

    /// Wait for an outcome that is already on its way
    pub fn wait_done(&self) -> CeResult<EngineOutput> {
        let mut slot = lock(&self.slot);
        while !slot.completed {
            slot = self.done.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        slot.result.take().unwrap_or(Err(CeError::DeviceClosed))
    }
}

/// How a submission was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    /// Handed to the engine immediately
    Dispatched,
    /// Waiting behind the active request
    Queued,
}

/// Where a timed-out request was found when it was pulled from the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abandoned {
    /// It owned the engine; recovery must reset the engine and call `resume`
    WasActive(Option<ReqInfo>),
    /// It never reached the engine
    WasPending,
    /// Its completion was being delivered concurrently
    Completing,
}

#[derive(Default)]
struct QueueState {
    active: Option<Arc<AsyncRequest>>,
    pending: VecDeque<Arc<AsyncRequest>>,
    /// Engine is being reset; hold new dispatches
    recovering: bool,
}

type Finished = Vec<(Arc<AsyncRequest>, CeResult<EngineOutput>)>;

/// FIFO queue in front of one engine
pub(crate) struct RequestQueue {
    engine: Arc<dyn CryptoEngine>,
    tx: Sender<WorkerMsg>,
    state: Mutex<QueueState>,
}

impl RequestQueue {
    pub fn new(engine: Arc<dyn CryptoEngine>, tx: Sender<WorkerMsg>) -> Self {
        Self { engine, tx, state: Mutex::new(QueueState::default()) }
    }

    /// Make `req` active if the engine is idle, otherwise append it
    ///
    /// A synchronous dispatch failure leaves the slot empty and is returned.
    pub fn submit(&self, req: &Arc<AsyncRequest>) -> CeResult<Submitted> {
        let mut state = lock(&self.state);
        if state.active.is_some() || state.recovering {
            state.pending.push_back(Arc::clone(req));
            tracing::trace!("{:?} queued behind {} pending", req.token(), state.pending.len() - 1);
            return Ok(Submitted::Queued);
        }

        state.active = Some(Arc::clone(req));
        match self.dispatch(req) {
            Ok(()) => Ok(Submitted::Dispatched),
            Err(e) => {
                state.active = None;
                Err(e)
            }
        }
    }

    fn dispatch(&self, req: &Arc<AsyncRequest>) -> CeResult<()> {
        let job = req
            .take_job()
            .ok_or_else(|| CeError::DispatchFailed(format!("{:?} has no job", req.token())))?;
        let kind = job.kind();
        let completion = Completion::new(req.token(), self.tx.clone());
        match self.engine.submit(job, completion) {
            Ok(info) => {
                req.set_req_info(info);
                tracing::trace!("{:?} dispatched as {:?}", req.token(), info);
                Ok(())
            }
            Err(e) => {
                tracing::error!("{} dispatch of {:?} failed: {}", kind, req.token(), e);
                Err(match e {
                    CeError::DispatchFailed(msg) => CeError::DispatchFailed(msg),
                    other => CeError::DispatchFailed(other.to_string()),
                })
            }
        }
    }

    /// Pop pending requests until one dispatches or the list is empty
    fn dispatch_next(&self, state: &mut QueueState, finished: &mut Finished) {
        while state.active.is_none() {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            state.active = Some(Arc::clone(&next));
            if let Err(e) = self.dispatch(&next) {
                state.active = None;
                finished.push((next, Err(e)));
            }
        }
    }

    /// Completion worker entry: retire the active request and start the next
    pub fn complete(&self, token: RequestToken, mut output: EngineOutput) {
        let mut finished = Finished::new();
        {
            let mut state = lock(&self.state);
            let is_active = state.active.as_ref().map(|a| a.token()) == Some(token);
            if !is_active {
                tracing::warn!("dropping stale completion for {:?}", token);
                return;
            }
            if let Some(done) = state.active.take() {
                let result = match output.fault.take() {
                    Some(fault) => Err(CeError::Io(fault)),
                    None => Ok(output),
                };
                finished.push((done, result));
            }
            if !state.recovering {
                self.dispatch_next(&mut state, &mut finished);
            }
        }
        for (req, result) in finished {
            req.finish(result);
        }
    }

    /// Pull a timed-out request out of the queue
    ///
    /// When it was active the queue enters recovery and holds new dispatches
    /// until [`resume`](Self::resume).
    pub fn abandon(&self, req: &Arc<AsyncRequest>) -> Abandoned {
        let mut state = lock(&self.state);
        if state.active.as_ref().is_some_and(|a| Arc::ptr_eq(a, req)) {
            state.active = None;
            state.recovering = true;
            return Abandoned::WasActive(req.req_info());
        }
        if let Some(pos) = state.pending.iter().position(|p| Arc::ptr_eq(p, req)) {
            state.pending.remove(pos);
            return Abandoned::WasPending;
        }
        Abandoned::Completing
    }

    /// Leave recovery and dispatch the next pending request
    pub fn resume(&self) {
        let mut finished = Finished::new();
        {
            let mut state = lock(&self.state);
            state.recovering = false;
            self.dispatch_next(&mut state, &mut finished);
        }
        for (req, result) in finished {
            req.finish(result);
        }
    }

    /// Fail everything still queued (device teardown)
    pub fn drain(&self) {
        let drained: Vec<_> = {
            let mut state = lock(&self.state);
            let mut all: Vec<_> = state.active.take().into_iter().collect();
            all.extend(state.pending.drain(..));
            all
        };
        for req in drained {
            req.finish(Err(CeError::DeviceClosed));
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.active.is_none() && state.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

//! Buffer chunking
//!
//! Planning is pure: [`plan_chunks`] and [`plan_mapped`] turn an immutable
//! segment list into a lazy sequence of hardware-sized pieces, and never
//! touch the descriptor. The executors at the bottom of this module feed
//! those pieces through the device one at a time.
//!
//! ## Contiguous chunks
//!
//! Segments are packed greedily into chunks of at most `limit` bytes; a
//! segment that does not fit is split at the boundary and its remainder
//! heads the next chunk. A CTR byte offset reserves room at the front of
//! the first chunk only:
//!
//! ```text
//! segments:  [ 20000 ][ 30000 ][ 5000 ]          limit 32768, offset 4
//! chunk 0:   off 4 | 20000 + 12764               (4 + 32764 = 32768)
//! chunk 1:   17236 + 5000
//! ```

use zeroize::Zeroizing;

use crate::buffer::ScratchBuf;
use crate::device::Device;
use crate::error::{CeError, CeResult};
use crate::job::{
    CipherJob, Direction, EngineJob, EngineMode, JobData, KeySource, OffloadParams,
};
use crate::supervisor::{RequestKind, WaitOutcome};
use crate::traits::UserMemory;
use crate::types::{
    BufSegment, CipherAlg, CipherMode, CipherOpReq, OffloadCipherOpReq, OffloadErr, OffloadOper,
    MAX_IV_SIZE,
};

/// One contiguous sub-operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Caller ranges gathered into this chunk, in order
    pub pieces: Vec<BufSegment>,

    /// Payload bytes (excluding the byte offset)
    pub len: usize,

    /// Leading bytes reserved before the payload
    pub byte_offset: usize,
}

/// Lazy contiguous chunk plan over a segment list
#[derive(Debug, Clone)]
pub struct ChunkPlan<'a> {
    segments: &'a [BufSegment],
    limit: usize,
    index: usize,
    consumed: usize,
    byte_offset: usize,
}

/// Plan contiguous chunks of at most `limit` bytes
///
/// `byte_offset` counts against the first chunk's capacity and is zero for
/// every later chunk.
pub fn plan_chunks(segments: &[BufSegment], limit: usize, byte_offset: usize) -> ChunkPlan<'_> {
    ChunkPlan { segments, limit, index: 0, consumed: 0, byte_offset }
}

impl Iterator for ChunkPlan<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let offset = self.byte_offset;
        let capacity = self.limit.saturating_sub(offset);
        let mut pieces = Vec::new();
        let mut len = 0;

        while len < capacity && self.index < self.segments.len() {
            let seg = self.segments[self.index];
            let remaining = seg.len as usize - self.consumed;
            if remaining > 0 {
                let take = remaining.min(capacity - len);
                pieces.push(BufSegment::new(seg.vaddr + self.consumed as u64, take as u32));
                len += take;
                self.consumed += take;
            }
            if self.consumed == seg.len as usize {
                self.index += 1;
                self.consumed = 0;
            }
        }

        if len == 0 {
            return None;
        }
        self.byte_offset = 0;
        Some(Chunk { pieces, len, byte_offset: offset })
    }
}

/// One mapped (zero-copy) sub-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedChunk {
    pub src: u64,
    pub dst: u64,
    pub len: usize,
    /// Keystream bytes to skip (first piece only)
    pub byte_offset: usize,
}

/// Lazy plan over paired source/destination segments
#[derive(Debug, Clone)]
pub struct MappedPlan<'a> {
    src: &'a [BufSegment],
    dst: &'a [BufSegment],
    limit: usize,
    index: usize,
    consumed: usize,
    byte_offset: usize,
}

/// Plan mapped pieces of at most `limit` bytes, one segment pair at a time
///
/// Pairs must have equal lengths; the first piece is shortened by
/// `byte_offset` so later pieces stay block aligned.
pub fn plan_mapped<'a>(
    src: &'a [BufSegment],
    dst: &'a [BufSegment],
    limit: usize,
    byte_offset: usize,
) -> MappedPlan<'a> {
    MappedPlan { src, dst, limit, index: 0, consumed: 0, byte_offset }
}

impl Iterator for MappedPlan<'_> {
    type Item = MappedChunk;

    fn next(&mut self) -> Option<MappedChunk> {
        while self.index < self.src.len().min(self.dst.len()) {
            let (s, d) = (self.src[self.index], self.dst[self.index]);
            let remaining = s.len as usize - self.consumed;
            if remaining == 0 {
                self.index += 1;
                self.consumed = 0;
                continue;
            }

            let offset = self.byte_offset;
            let take = remaining.min(self.limit.saturating_sub(offset).max(1));
            let piece = MappedChunk {
                src: s.vaddr + self.consumed as u64,
                dst: d.vaddr + self.consumed as u64,
                len: take,
                byte_offset: offset,
            };
            self.byte_offset = 0;
            self.consumed += take;
            return Some(piece);
        }
        None
    }
}

/// Sequential writer over a destination segment list
///
/// Keeps its position across calls so successive chunk outputs land
/// back-to-back in the caller's layout.
pub struct SegmentCursor<'a> {
    segments: &'a [BufSegment],
    index: usize,
    offset: usize,
}

impl<'a> SegmentCursor<'a> {
    pub fn new(segments: &'a [BufSegment]) -> Self {
        Self { segments, index: 0, offset: 0 }
    }

    /// Copy `data` out to the next bytes of the destination layout
    pub fn write(&mut self, mem: &dyn UserMemory, mut data: &[u8]) -> CeResult<()> {
        while !data.is_empty() {
            let seg = self
                .segments
                .get(self.index)
                .ok_or_else(|| CeError::invalid("destination segments exhausted"))?;
            let room = seg.len as usize - self.offset;
            if room == 0 {
                self.index += 1;
                self.offset = 0;
                continue;
            }
            let n = room.min(data.len());
            mem.copy_to_user(seg.vaddr + self.offset as u64, &data[..n])?;
            self.offset += n;
            data = &data[n..];
        }
        Ok(())
    }
}

/// Copy the caller ranges of a chunk into `dst` back-to-back
pub fn gather(mem: &dyn UserMemory, pieces: &[BufSegment], dst: &mut [u8]) -> CeResult<()> {
    let mut at = 0;
    for piece in pieces {
        let len = piece.len as usize;
        let window = dst
            .get_mut(at..at + len)
            .ok_or_else(|| CeError::invalid("chunk larger than its buffer"))?;
        mem.copy_from_user(piece.vaddr, window)?;
        at += len;
    }
    Ok(())
}

fn engine_mode(mode: CipherMode) -> CeResult<EngineMode> {
    match mode {
        CipherMode::AesEcb | CipherMode::DesEcb => Ok(EngineMode::Ecb),
        CipherMode::AesCbc | CipherMode::DesCbc => Ok(EngineMode::Cbc),
        CipherMode::AesCtr => Ok(EngineMode::Ctr),
        CipherMode::AesXts => Ok(EngineMode::Xts),
        CipherMode::AesCcm => Err(CeError::invalid("AES-CCM is not supported by the engine")),
    }
}

fn store_iv(iv: &mut [u8; MAX_IV_SIZE], returned: &[u8]) {
    let n = returned.len().min(MAX_IV_SIZE);
    iv[..n].copy_from_slice(&returned[..n]);
}

/// Run a validated cipher descriptor chunk by chunk
///
/// Each chunk is gathered into a fresh scratch buffer, processed, and
/// scattered to the destination segments before the next one starts; the
/// IV the engine returns chains into the next chunk and is left in the
/// descriptor. A failing chunk aborts the rest and keeps earlier output.
pub(crate) fn run_cipher(device: &Device, req: &mut CipherOpReq) -> CeResult<()> {
    let mode = engine_mode(req.mode)?;
    // CTR is symmetric; the engine always runs it forward
    let dir = if req.mode == CipherMode::AesCtr || req.op.is_encrypt() {
        Direction::Encrypt
    } else {
        Direction::Decrypt
    };
    let key = if req.encklen > 0 {
        KeySource::Explicit(Zeroizing::new(req.enckey[..req.encklen as usize].to_vec()))
    } else if req.op.is_no_key() {
        KeySource::Pipe { klen: 0 }
    } else {
        KeySource::HwKey
    };
    let byte_offset = if req.mode == CipherMode::AesCtr { req.byteoffset as usize } else { 0 };
    let kind = RequestKind::Cipher { op: req.op };

    let src = req.src.clone();
    let dst_segments = req.dst.clone();
    let mem = device.memory();
    let mut dst = SegmentCursor::new(&dst_segments);

    for chunk in plan_chunks(&src, device.config().transfer.max_oper_data, byte_offset) {
        let mut buf = ScratchBuf::zeroed(chunk.byte_offset + chunk.len)?;
        gather(mem, &chunk.pieces, &mut buf[chunk.byte_offset..])?;

        let job = CipherJob {
            alg: req.alg,
            mode,
            dir,
            key: key.clone(),
            iv: Zeroizing::new(req.iv_bytes().to_vec()),
            data: JobData::Contiguous(buf),
            byte_offset: 0,
            offload: None,
        };

        let output = match device.submit_and_wait(kind, EngineJob::Cipher(job))? {
            WaitOutcome::Done(output) => output,
            WaitOutcome::Recovered(anomaly) => return Err(CeError::HardwareAnomaly(anomaly)),
        };
        if let Some(iv) = &output.iv {
            store_iv(&mut req.iv, iv);
        }
        let data = output.data.ok_or_else(|| CeError::Io("engine returned no data".into()))?;
        let out = data
            .get(chunk.byte_offset..chunk.byte_offset + chunk.len)
            .ok_or_else(|| CeError::Io("engine returned a short buffer".into()))?;
        dst.write(mem, out)?;
    }
    Ok(())
}

/// Engine direction for an offload request
pub fn offload_direction(req: &OffloadCipherOpReq) -> Direction {
    if req.is_copy_op {
        return Direction::Encrypt;
    }
    match req.op {
        OffloadOper::HlosHlos | OffloadOper::HlosCpb => Direction::Decrypt,
        OffloadOper::CpbHlos => Direction::Encrypt,
    }
}

/// Run a validated offload descriptor over mapped memory
///
/// On a timeout the supervisor classifies as a pipe-key condition, the
/// descriptor's `err` is set, the call succeeds and the remaining pieces
/// are not submitted.
pub(crate) fn run_offload(device: &Device, req: &mut OffloadCipherOpReq) -> CeResult<()> {
    let mode = match req.mode {
        CipherMode::AesCbc => EngineMode::Cbc,
        CipherMode::AesCtr => EngineMode::Ctr,
        other => {
            return Err(CeError::invalid(format!(
                "offload path supports CBC and CTR only, got {}",
                other.name()
            )))
        }
    };
    let params = OffloadParams {
        oper: req.op,
        is_copy: req.is_copy_op,
        pattern: req.is_pattern_valid.then(|| req.pattern_info.packed()),
        block_offset: req.block_offset,
        iv_ctr_size: req.iv_ctr_size,
    };
    let dir = offload_direction(req);
    let byte_offset = if req.mode == CipherMode::AesCtr { req.byteoffset as usize } else { 0 };

    req.err = OffloadErr::NoError;
    let src = req.src.clone();
    let dst = req.dst.clone();
    let limit = device.config().transfer.max_offload_transfer;

    for piece in plan_mapped(&src, &dst, limit, byte_offset) {
        let job = CipherJob {
            alg: CipherAlg::Aes,
            mode,
            dir,
            key: KeySource::Pipe { klen: req.encklen as usize },
            iv: Zeroizing::new(req.iv_bytes().to_vec()),
            data: JobData::Mapped { src: piece.src, dst: piece.dst, len: piece.len },
            byte_offset: piece.byte_offset,
            offload: Some(params),
        };

        match device.submit_and_wait(RequestKind::Offload, EngineJob::Cipher(job))? {
            WaitOutcome::Done(output) => {
                if let Some(iv) = &output.iv {
                    store_iv(&mut req.iv, iv);
                }
            }
            WaitOutcome::Recovered(anomaly) => {
                req.err = anomaly.into();
                tracing::info!("offload stopped after {}: {}", anomaly, req.err as u32);
                return Ok(());
            }
        }
    }
    Ok(())
}

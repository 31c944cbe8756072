//! Cache-line aligned scratch buffers
//!
//! Every byte that crosses between caller memory and the engine passes
//! through a [`ScratchBuf`]. The backing allocation is over-sized by one
//! cache line so the usable window starts on a `CACHE_LINE_SIZE` boundary,
//! and the whole allocation is zeroized on drop regardless of how the
//! request ended.

use std::ops::{Deref, DerefMut};

use zeroize::Zeroizing;

use crate::error::{CeError, CeResult};
use crate::types::CACHE_LINE_SIZE;

/// Aligned, zeroize-on-drop byte buffer handed to the engine
pub struct ScratchBuf {
    raw: Zeroizing<Vec<u8>>,
    start: usize,
    len: usize,
}

impl ScratchBuf {
    /// Allocate `len` zeroed bytes aligned to the cache line
    ///
    /// Allocation failure is reported as `OutOfMemory` instead of aborting.
    pub fn zeroed(len: usize) -> CeResult<Self> {
        let total = len
            .checked_add(CACHE_LINE_SIZE)
            .ok_or(CeError::OutOfMemory { requested: len })?;

        let mut raw = Vec::new();
        raw.try_reserve_exact(total)
            .map_err(|_| CeError::OutOfMemory { requested: total })?;
        raw.resize(total, 0);

        let misalign = raw.as_ptr() as usize % CACHE_LINE_SIZE;
        let start = if misalign == 0 { 0 } else { CACHE_LINE_SIZE - misalign };

        Ok(Self { raw: Zeroizing::new(raw), start, len })
    }

    /// Allocate and fill from a slice
    pub fn from_slice(data: &[u8]) -> CeResult<Self> {
        let mut buf = Self::zeroed(data.len())?;
        buf.copy_from_slice(data);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the usable window; bytes past the new end are scrubbed now
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            let end = self.start + self.len;
            self.raw[self.start + len..end].fill(0);
            self.len = len;
        }
    }

    /// Check cache-line alignment of the usable window
    pub fn is_aligned(&self) -> bool {
        self.as_ptr() as usize % CACHE_LINE_SIZE == 0
    }
}

impl Deref for ScratchBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.raw[self.start..self.start + self.len]
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.raw[self.start..self.start + self.len]
    }
}

impl std::fmt::Debug for ScratchBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuf").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        for len in [0, 1, 63, 64, 65, 4096] {
            let buf = ScratchBuf::zeroed(len).unwrap();
            assert!(buf.is_aligned());
            assert_eq!(buf.len(), len);
            assert!(buf.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_truncate_scrubs_tail() {
        let mut buf = ScratchBuf::from_slice(&[0xAA; 100]).unwrap();
        buf.truncate(64);
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0xAA));
        let end = buf.start + 100;
        assert!(buf.raw[buf.start + 64..end].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_huge_allocation_fails_cleanly() {
        let err = ScratchBuf::zeroed(usize::MAX - 8).unwrap_err();
        assert!(matches!(err, CeError::OutOfMemory { .. }));
    }
}

//! Simulated caller address space
//!
//! Regions are allocated at page-aligned addresses with an unmapped guard
//! gap after each one, so any access that runs past a region faults the
//! way a bad user pointer would. External buffers ("dma-bufs") are regions
//! registered under a file descriptor; importing one hands back an address
//! inside its region.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{CeError, CeResult};
use crate::queue::lock;
use crate::traits::{BufferImporter, UserMemory};

const BASE_ADDR: u64 = 0x1000_0000;
const PAGE: u64 = 0x1000;
const GUARD: u64 = PAGE;
const FIRST_FD: i32 = 100;

#[derive(Debug)]
struct DmaBuf {
    vaddr: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct AddressSpace {
    regions: BTreeMap<u64, Vec<u8>>,
    next_addr: u64,
    dmabufs: HashMap<i32, DmaBuf>,
    next_fd: i32,
    /// Imported address -> fd
    imports: HashMap<u64, i32>,
}

impl AddressSpace {
    /// Region base and byte offset covering `[vaddr, vaddr + len)`
    fn locate(&self, vaddr: u64, len: usize) -> CeResult<(u64, usize)> {
        let fault = || CeError::UserBufferFault { vaddr, len };
        let (&base, region) = self.regions.range(..=vaddr).next_back().ok_or_else(fault)?;
        let start = (vaddr - base) as usize;
        let end = start.checked_add(len).ok_or_else(fault)?;
        if end > region.len() {
            return Err(fault());
        }
        Ok((base, start))
    }

    fn alloc(&mut self, data: Vec<u8>) -> u64 {
        if self.next_addr == 0 {
            self.next_addr = BASE_ADDR;
        }
        let vaddr = self.next_addr;
        let span = (data.len() as u64).max(1);
        self.next_addr = (vaddr + span + GUARD + PAGE - 1) & !(PAGE - 1);
        self.regions.insert(vaddr, data);
        vaddr
    }
}

/// Sparse simulated memory shared by a test and the simulated engine
#[derive(Debug, Default)]
pub struct SimMemory {
    space: Mutex<AddressSpace>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes and return their address
    pub fn alloc(&self, len: usize) -> u64 {
        lock(&self.space).alloc(vec![0; len])
    }

    /// Allocate a region holding a copy of `data`
    pub fn alloc_with(&self, data: &[u8]) -> u64 {
        lock(&self.space).alloc(data.to_vec())
    }

    /// Release a region by its base address
    pub fn free(&self, vaddr: u64) -> bool {
        lock(&self.space).regions.remove(&vaddr).is_some()
    }

    pub fn read(&self, vaddr: u64, len: usize) -> CeResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.copy_from_user(vaddr, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, vaddr: u64, data: &[u8]) -> CeResult<()> {
        self.copy_to_user(vaddr, data)
    }

    /// Register an external buffer holding `data` and return its fd
    pub fn register_dmabuf(&self, data: &[u8]) -> i32 {
        let mut space = lock(&self.space);
        let vaddr = space.alloc(data.to_vec());
        if space.next_fd == 0 {
            space.next_fd = FIRST_FD;
        }
        let fd = space.next_fd;
        space.next_fd += 1;
        space.dmabufs.insert(fd, DmaBuf { vaddr, len: data.len() as u64 });
        fd
    }

    /// Number of live imports
    pub fn import_count(&self) -> usize {
        lock(&self.space).imports.len()
    }
}

impl UserMemory for SimMemory {
    fn copy_from_user(&self, vaddr: u64, dst: &mut [u8]) -> CeResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let space = lock(&self.space);
        let (base, start) = space.locate(vaddr, dst.len())?;
        let region = &space.regions[&base];
        dst.copy_from_slice(&region[start..start + dst.len()]);
        Ok(())
    }

    fn copy_to_user(&self, vaddr: u64, src: &[u8]) -> CeResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let mut space = lock(&self.space);
        let (base, start) = space.locate(vaddr, src.len())?;
        if let Some(region) = space.regions.get_mut(&base) {
            region[start..start + src.len()].copy_from_slice(src);
        }
        Ok(())
    }
}

impl BufferImporter for SimMemory {
    fn map(&self, fd: i32, offset: u64, size: u64) -> CeResult<u64> {
        let mut space = lock(&self.space);
        let buf = space
            .dmabufs
            .get(&fd)
            .ok_or_else(|| CeError::invalid(format!("fd {} is not a dma-buf", fd)))?;
        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > buf.len) {
            return Err(CeError::invalid(format!(
                "range {}+{} outside dma-buf fd {} of {} bytes",
                offset, size, fd, buf.len
            )));
        }
        let vaddr = buf.vaddr + offset;
        space.imports.insert(vaddr, fd);
        Ok(vaddr)
    }

    fn unmap(&self, vaddr: u64) -> CeResult<()> {
        match lock(&self.space).imports.remove(&vaddr) {
            Some(_) => Ok(()),
            None => Err(CeError::invalid(format!("0x{:x} is not an imported buffer", vaddr))),
        }
    }
}

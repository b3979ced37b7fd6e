use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{
    AccessSize, AccessType, Backing, GuestFault, GuestMemory, IoRegionId, PageFlags,
    PageMapping, PAGE_MASK,
};

/// Access counters shared with whoever created the [`FlatMemory`], so they stay observable after
/// the memory has been moved into a CPU.
#[derive(Debug, Default)]
pub struct FlatCounters {
    walks: AtomicU64,
    io_reads: AtomicU64,
    io_writes: AtomicU64,
    code_writes: AtomicU64,
}

impl FlatCounters {
    pub fn walks(&self) -> u64 {
        self.walks.load(Ordering::Relaxed)
    }

    pub fn io_reads(&self) -> u64 {
        self.io_reads.load(Ordering::Relaxed)
    }

    pub fn io_writes(&self) -> u64 {
        self.io_writes.load(Ordering::Relaxed)
    }

    pub fn code_writes(&self) -> u64 {
        self.code_writes.load(Ordering::Relaxed)
    }
}

/// Identity-mapped guest memory: virtual == physical == host RAM offset.
///
/// Every page inside the RAM size is mapped read/write/execute unless overridden. Pages can be
/// unmapped, restricted, turned into I/O pages (backed by a simple register file) or marked as
/// holding translated code.
#[derive(Debug)]
pub struct FlatMemory {
    ram: Vec<u8>,
    unmapped: HashSet<u64>,
    flags: HashMap<u64, PageFlags>,
    io_pages: HashMap<u64, IoRegionId>,
    io_registers: HashMap<u64, u64>,
    code_pages: HashSet<u64>,
    code_write_log: Vec<(u64, u64)>,
    counters: Arc<FlatCounters>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0; size],
            unmapped: HashSet::new(),
            flags: HashMap::new(),
            io_pages: HashMap::new(),
            io_registers: HashMap::new(),
            code_pages: HashSet::new(),
            code_write_log: Vec::new(),
            counters: Arc::new(FlatCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<FlatCounters> {
        Arc::clone(&self.counters)
    }

    pub fn unmap_page(&mut self, vaddr: u64) {
        self.unmapped.insert(vaddr & PAGE_MASK);
    }

    pub fn set_page_flags(&mut self, vaddr: u64, flags: PageFlags) {
        self.flags.insert(vaddr & PAGE_MASK, flags);
    }

    pub fn map_io(&mut self, vaddr: u64, region: IoRegionId) {
        self.io_pages.insert(vaddr & PAGE_MASK, region);
    }

    /// Mark the page as holding translated code so stores to it are reported.
    pub fn watch_code(&mut self, vaddr: u64) {
        self.code_pages.insert(vaddr & PAGE_MASK);
    }

    /// `(paddr, len)` of every store reported through [`GuestMemory::code_written`].
    pub fn code_write_log(&self) -> &[(u64, u64)] {
        &self.code_write_log
    }

    /// Last value written to the I/O register at `paddr`.
    pub fn io_register(&self, paddr: u64) -> Option<u64> {
        self.io_registers.get(&paddr).copied()
    }

    pub fn set_io_register(&mut self, paddr: u64, value: u64) {
        self.io_registers.insert(paddr, value);
    }

    /// Raw RAM write, bypassing translation. Panics if out of range.
    pub fn write_bytes(&mut self, paddr: u64, data: &[u8]) {
        let start = paddr as usize;
        self.ram[start..start + data.len()].copy_from_slice(data);
    }

    /// Raw RAM read, bypassing translation. Panics if out of range.
    pub fn read_bytes(&self, paddr: u64, len: usize) -> &[u8] {
        let start = paddr as usize;
        &self.ram[start..start + len]
    }

    fn ram_range(&self, host_offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(host_offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.ram.len()).then_some(start..end)
    }
}

impl GuestMemory for FlatMemory {
    fn walk_page_table(
        &mut self,
        vaddr: u64,
        access: AccessType,
        _mmu_idx: usize,
    ) -> Result<PageMapping, GuestFault> {
        self.counters.walks.fetch_add(1, Ordering::Relaxed);
        let page = vaddr & PAGE_MASK;
        if self.unmapped.contains(&page) {
            return Err(GuestFault::PageFault { vaddr, access });
        }
        let flags = self.flags.get(&page).copied().unwrap_or(PageFlags::RWX);

        if let Some(&region) = self.io_pages.get(&page) {
            return Ok(PageMapping {
                phys_page: page,
                flags,
                backing: Backing::Io(region),
                watch_code: false,
            });
        }
        if page >= self.ram.len() as u64 {
            return Err(GuestFault::PageFault { vaddr, access });
        }
        Ok(PageMapping {
            phys_page: page,
            flags,
            backing: Backing::Ram { host_offset: page },
            watch_code: self.code_pages.contains(&page),
        })
    }

    fn ram_read(&mut self, host_offset: u64, dst: &mut [u8]) -> bool {
        match self.ram_range(host_offset, dst.len()) {
            Some(range) => {
                dst.copy_from_slice(&self.ram[range]);
                true
            }
            None => false,
        }
    }

    fn ram_write(&mut self, host_offset: u64, src: &[u8]) -> bool {
        match self.ram_range(host_offset, src.len()) {
            Some(range) => {
                self.ram[range].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn io_read(&mut self, _region: IoRegionId, paddr: u64, size: AccessSize) -> u64 {
        self.counters.io_reads.fetch_add(1, Ordering::Relaxed);
        self.io_registers.get(&paddr).copied().unwrap_or(u64::MAX) & size.mask()
    }

    fn io_write(&mut self, _region: IoRegionId, paddr: u64, _size: AccessSize, value: u64) {
        self.counters.io_writes.fetch_add(1, Ordering::Relaxed);
        self.io_registers.insert(paddr, value);
    }

    fn code_written(&mut self, paddr: u64, len: u64) {
        self.counters.code_writes.fetch_add(1, Ordering::Relaxed);
        self.code_write_log.push((paddr, len));
    }
}

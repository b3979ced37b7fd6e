use std::fmt;
use std::sync::Arc;

use crate::{
    AccessSize, AccessType, Backing, CodeWatch, GuestFault, GuestMemory, TlbConfig,
    UnalignedPolicy, PAGE_MASK, PAGE_SIZE, TLB_SIZE,
};

// Low (page offset) bits of a tag. A tag matches `vaddr` only if its page bits are equal and
// `TLB_INVALID` is clear; the remaining flags force the slow path without causing a miss.
pub(crate) const TLB_INVALID: u64 = 1 << 3;
/// Stores must notify the code-write hook before landing.
pub(crate) const TLB_NOTDIRTY: u64 = 1 << 4;
/// Accesses go through I/O dispatch instead of host RAM.
pub(crate) const TLB_MMIO: u64 = 1 << 5;

const INVALID_TAG: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    addr_read: u64,
    addr_write: u64,
    addr_code: u64,
    /// `host_offset(page) - vpage` (wrapping), so RAM accesses compute `vaddr + addend`.
    addend: u64,
    phys_page: u64,
    backing: Backing,
}

impl TlbEntry {
    const EMPTY: Self = Self {
        addr_read: INVALID_TAG,
        addr_write: INVALID_TAG,
        addr_code: INVALID_TAG,
        addend: 0,
        phys_page: 0,
        backing: Backing::Ram { host_offset: 0 },
    };

    #[inline]
    fn tag(&self, access: AccessType) -> u64 {
        match access {
            AccessType::Read => self.addr_read,
            AccessType::Write => self.addr_write,
            AccessType::Execute => self.addr_code,
        }
    }

    #[inline]
    fn maps_page(&self, page: u64) -> bool {
        [self.addr_read, self.addr_write, self.addr_code]
            .iter()
            .any(|&tag| tag & (PAGE_MASK | TLB_INVALID) == page)
    }
}

#[inline]
fn tlb_index(vaddr: u64) -> usize {
    ((vaddr >> crate::PAGE_BITS) as usize) & (TLB_SIZE - 1)
}

#[inline]
fn tag_matches(tag: u64, vaddr: u64) -> bool {
    vaddr & PAGE_MASK == tag & (PAGE_MASK | TLB_INVALID)
}

/// Soft-TLB counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlbStats {
    pub hits: u64,
    pub misses: u64,
    /// Page-table walks requested from [`GuestMemory::walk_page_table`].
    pub refills: u64,
    pub io_accesses: u64,
    /// Accesses that were split because they straddled a page or were unaligned.
    pub split_accesses: u64,
    pub flushes: u64,
}

#[derive(Clone)]
struct AttachedWatch {
    watch: Arc<dyn CodeWatch>,
    /// Last [`CodeWatch::generation`] the cached write entries were tagged against.
    generation: u64,
}

impl fmt::Debug for AttachedWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedWatch")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Per-CPU software TLB: one direct-mapped table of [`TLB_SIZE`] slots per MMU mode.
#[derive(Debug, Clone)]
pub struct SoftTlb {
    tables: Vec<Box<[TlbEntry]>>,
    config: TlbConfig,
    stats: TlbStats,
    code_watch: Option<AttachedWatch>,
}

impl SoftTlb {
    pub fn new(config: TlbConfig) -> Self {
        let modes = config.mmu_modes.max(1);
        Self {
            tables: (0..modes)
                .map(|_| vec![TlbEntry::EMPTY; TLB_SIZE].into_boxed_slice())
                .collect(),
            config,
            stats: TlbStats::default(),
            code_watch: None,
        }
    }

    /// Report stores to the pages `watch` holds as code, in addition to pages whose mapping
    /// sets `watch_code`. Attaching the watch that is already attached is a no-op.
    pub fn set_code_watch(&mut self, watch: Arc<dyn CodeWatch>) {
        if let Some(current) = &self.code_watch {
            if Arc::ptr_eq(&current.watch, &watch) {
                return;
            }
        }
        self.code_watch = Some(AttachedWatch {
            watch,
            generation: u64::MAX,
        });
        self.protect_code_pages();
    }

    pub fn clear_code_watch(&mut self) {
        self.code_watch = None;
    }

    /// Tag every cached RAM write entry that now maps a code page, if the watch moved on
    /// since the last check.
    fn protect_code_pages(&mut self) {
        let Some(attached) = self.code_watch.as_mut() else {
            return;
        };
        let generation = attached.watch.generation();
        if generation == attached.generation {
            return;
        }
        attached.generation = generation;
        for table in &mut self.tables {
            for entry in table.iter_mut() {
                if entry.addr_write & (TLB_INVALID | TLB_MMIO | TLB_NOTDIRTY) == 0
                    && attached.watch.is_code_page(entry.phys_page)
                {
                    entry.addr_write |= TLB_NOTDIRTY;
                }
            }
        }
    }

    fn is_code_page(&self, phys_page: u64) -> bool {
        self.code_watch
            .as_ref()
            .is_some_and(|attached| attached.watch.is_code_page(phys_page))
    }

    pub fn config(&self) -> &TlbConfig {
        &self.config
    }

    pub fn mmu_modes(&self) -> usize {
        self.tables.len()
    }

    pub fn stats(&self) -> TlbStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = TlbStats::default();
    }

    /// Drop every cached translation in every mode.
    pub fn flush(&mut self) {
        for table in &mut self.tables {
            table.fill(TlbEntry::EMPTY);
        }
        self.stats.flushes += 1;
    }

    /// Drop every translation for the modes whose bit is set in `mode_mask`.
    pub fn flush_mmu_modes(&mut self, mode_mask: u32) {
        for (idx, table) in self.tables.iter_mut().enumerate() {
            if idx < 32 && mode_mask & (1 << idx) != 0 {
                table.fill(TlbEntry::EMPTY);
            }
        }
        self.stats.flushes += 1;
    }

    /// Drop the translation for the page containing `vaddr` in every mode.
    pub fn flush_page(&mut self, vaddr: u64) {
        let page = vaddr & PAGE_MASK;
        let index = tlb_index(vaddr);
        for table in &mut self.tables {
            if table[index].maps_page(page) {
                table[index] = TlbEntry::EMPTY;
            }
        }
    }

    /// Whether a translation for `vaddr` is cached for `access` in `mmu_idx`.
    pub fn is_cached(&self, vaddr: u64, access: AccessType, mmu_idx: usize) -> bool {
        tag_matches(self.tables[mmu_idx][tlb_index(vaddr)].tag(access), vaddr)
    }

    /// Walk the guest page tables for `vaddr` and install the result.
    ///
    /// Fails without touching the slot if the walk faults or the page does not permit `access`.
    pub fn fill<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        access: AccessType,
        mmu_idx: usize,
    ) -> Result<(), GuestFault> {
        self.stats.refills += 1;
        let mapping = mem.walk_page_table(vaddr, access, mmu_idx)?;
        if !mapping.flags.permits(access) {
            return Err(GuestFault::Protection { vaddr, access });
        }

        let vpage = vaddr & PAGE_MASK;
        let (addend, flags) = match mapping.backing {
            Backing::Ram { host_offset } => (host_offset.wrapping_sub(vpage), 0),
            Backing::Io(_) => (0, TLB_MMIO),
        };
        let tag = |allowed: bool| if allowed { vpage | flags } else { INVALID_TAG };
        let phys_page = mapping.phys_page & PAGE_MASK;
        let mut addr_write = tag(mapping.flags.permits(AccessType::Write));
        if addr_write != INVALID_TAG
            && flags & TLB_MMIO == 0
            && (mapping.watch_code || self.is_code_page(phys_page))
        {
            addr_write |= TLB_NOTDIRTY;
        }

        let entry = TlbEntry {
            addr_read: tag(mapping.flags.permits(AccessType::Read)),
            addr_write,
            addr_code: tag(mapping.flags.permits(AccessType::Execute)),
            addend,
            phys_page,
            backing: mapping.backing,
        };
        tracing::trace!(
            vaddr,
            phys_page = entry.phys_page,
            mmu_idx,
            ?access,
            "soft-TLB refill"
        );
        self.tables[mmu_idx][tlb_index(vaddr)] = entry;
        Ok(())
    }

    /// Return the slot for `vaddr`, refilling it if its `access` tag misses.
    #[inline]
    fn lookup<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        access: AccessType,
        mmu_idx: usize,
    ) -> Result<TlbEntry, GuestFault> {
        let index = tlb_index(vaddr);
        if tag_matches(self.tables[mmu_idx][index].tag(access), vaddr) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            self.fill(mem, vaddr, access, mmu_idx)?;
        }
        Ok(self.tables[mmu_idx][index])
    }

    /// Guest physical address of the instruction at `vaddr`.
    pub fn translate_code<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        mmu_idx: usize,
    ) -> Result<u64, GuestFault> {
        let entry = self.lookup(mem, vaddr, AccessType::Execute, mmu_idx)?;
        if let Backing::Io(_) = entry.backing {
            return Err(GuestFault::ExecuteOutsideRam { vaddr });
        }
        Ok(entry.phys_page | (vaddr & !PAGE_MASK))
    }

    pub fn load<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        mmu_idx: usize,
    ) -> Result<u64, GuestFault> {
        self.load_access(mem, vaddr, size, mmu_idx, AccessType::Read)
    }

    /// Load with execute permission (instruction fetch).
    pub fn load_code<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        mmu_idx: usize,
    ) -> Result<u64, GuestFault> {
        self.load_access(mem, vaddr, size, mmu_idx, AccessType::Execute)
    }

    fn load_access<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        mmu_idx: usize,
        access: AccessType,
    ) -> Result<u64, GuestFault> {
        let bytes = size.bytes();
        let unaligned = vaddr & (bytes - 1) != 0;
        if unaligned && self.config.unaligned == UnalignedPolicy::Fault {
            return Err(GuestFault::Unaligned {
                vaddr,
                size: bytes as u8,
                access,
            });
        }

        let entry = self.lookup(mem, vaddr, access, mmu_idx)?;
        let offset = vaddr & !PAGE_MASK;

        if entry.tag(access) & TLB_MMIO != 0 {
            if unaligned {
                return self.load_split(mem, vaddr, size, mmu_idx, access);
            }
            if let Backing::Io(region) = entry.backing {
                self.stats.io_accesses += 1;
                return Ok(mem.io_read(region, entry.phys_page | offset, size) & size.mask());
            }
        }

        let straddles = offset + bytes > PAGE_SIZE;
        if straddles || (unaligned && self.config.unaligned == UnalignedPolicy::Split) {
            return self.load_split(mem, vaddr, size, mmu_idx, access);
        }

        let mut buf = [0u8; 8];
        let buf = &mut buf[..bytes as usize];
        if !mem.ram_read(vaddr.wrapping_add(entry.addend), buf) {
            return Err(GuestFault::PageFault { vaddr, access });
        }
        Ok(self.config.endian.decode(buf))
    }

    /// Read the two aligned words covering `vaddr` and extract the requested bytes.
    fn load_split<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        mmu_idx: usize,
        access: AccessType,
    ) -> Result<u64, GuestFault> {
        self.stats.split_accesses += 1;
        let bytes = size.bytes();
        let addr1 = vaddr & !(bytes - 1);
        let addr2 = addr1.wrapping_add(bytes);
        let res1 = self.load_access(mem, addr1, size, mmu_idx, access)?;
        let res2 = self.load_access(mem, addr2, size, mmu_idx, access)?;

        let shift = ((vaddr & (bytes - 1)) * 8) as u32;
        let bits = size.bits();
        let value = match self.config.endian {
            crate::Endian::Little => (res1 >> shift) | (res2 << (bits - shift)),
            crate::Endian::Big => (res1 << shift) | (res2 >> (bits - shift)),
        };
        Ok(value & size.mask())
    }

    pub fn store<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        value: u64,
        mmu_idx: usize,
    ) -> Result<(), GuestFault> {
        let bytes = size.bytes();
        let unaligned = vaddr & (bytes - 1) != 0;
        if unaligned && self.config.unaligned == UnalignedPolicy::Fault {
            return Err(GuestFault::Unaligned {
                vaddr,
                size: bytes as u8,
                access: AccessType::Write,
            });
        }

        self.protect_code_pages();
        let entry = self.lookup(mem, vaddr, AccessType::Write, mmu_idx)?;
        let offset = vaddr & !PAGE_MASK;
        let tag = entry.addr_write;

        if tag & TLB_MMIO != 0 {
            if unaligned {
                return self.store_split(mem, vaddr, size, value, mmu_idx);
            }
            if let Backing::Io(region) = entry.backing {
                self.stats.io_accesses += 1;
                mem.io_write(region, entry.phys_page | offset, size, value & size.mask());
                return Ok(());
            }
        }

        let straddles = offset + bytes > PAGE_SIZE;
        if straddles || (unaligned && self.config.unaligned == UnalignedPolicy::Split) {
            return self.store_split(mem, vaddr, size, value, mmu_idx);
        }

        if tag & TLB_NOTDIRTY != 0 {
            let paddr = entry.phys_page | offset;
            mem.code_written(paddr, bytes);
            if let Some(attached) = &self.code_watch {
                attached.watch.code_written(paddr, bytes);
            }
        }

        let mut buf = [0u8; 8];
        let buf = &mut buf[..bytes as usize];
        self.config.endian.encode(value, buf);
        if !mem.ram_write(vaddr.wrapping_add(entry.addend), buf) {
            return Err(GuestFault::PageFault {
                vaddr,
                access: AccessType::Write,
            });
        }
        Ok(())
    }

    /// Store byte by byte, last byte first, so a fault on the second page happens before the
    /// first page is modified.
    fn store_split<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        vaddr: u64,
        size: AccessSize,
        value: u64,
        mmu_idx: usize,
    ) -> Result<(), GuestFault> {
        self.stats.split_accesses += 1;
        let bytes = size.bytes();
        for i in (0..bytes).rev() {
            let shift = match self.config.endian {
                crate::Endian::Little => i * 8,
                crate::Endian::Big => (bytes - 1 - i) * 8,
            };
            self.store(
                mem,
                vaddr.wrapping_add(i),
                AccessSize::Byte,
                value >> shift,
                mmu_idx,
            )?;
        }
        Ok(())
    }
}

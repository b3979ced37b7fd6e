//! Guest memory access through a software TLB.
//!
//! Generated code performs every guest load/store through [`SoftTlb`]. A hit costs one tag
//! compare and one add (`host_offset = vaddr + addend`); a miss asks the [`GuestMemory`]
//! collaborator to walk the guest page tables and installs the result. Pages that are not plain
//! RAM (device registers, pages backing translated code) carry flag bits in their tag so they
//! fall off the fast path and are routed to I/O dispatch or to the code-write notification.
//!
//! The page-table format itself is not modelled here: [`GuestMemory::walk_page_table`] returns a
//! resolved [`PageMapping`] or a [`GuestFault`]. [`FlatMemory`] is a small identity-mapped
//! implementation used by tests, benches and simple embedders.

mod flat;
mod tlb;

pub use flat::{FlatCounters, FlatMemory};
pub use tlb::{SoftTlb, TlbStats};


pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Selects the page-number bits of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// log2 of the number of slots per MMU mode.
pub const TLB_BITS: u32 = 8;
pub const TLB_SIZE: usize = 1 << TLB_BITS;

/// Type of memory access being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Width of a single guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessSize {
    Byte = 1,
    Half = 2,
    Word = 4,
    Quad = 8,
}

impl AccessSize {
    #[inline]
    pub const fn bytes(self) -> u64 {
        self as u64
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        (self as u32) * 8
    }

    /// Mask selecting the low `bits()` bits of a value.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AccessSize::Quad => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    #[inline]
    pub(crate) fn decode(self, bytes: &[u8]) -> u64 {
        let mut value = 0u64;
        match self {
            Endian::Little => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | u64::from(b);
                }
            }
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | u64::from(b);
                }
            }
        }
        value
    }

    #[inline]
    pub(crate) fn encode(self, value: u64, out: &mut [u8]) {
        let len = out.len();
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = match self {
                Endian::Little => i * 8,
                Endian::Big => (len - 1 - i) * 8,
            };
            *slot = (value >> shift) as u8;
        }
    }
}

/// How accesses that are not naturally aligned are serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnalignedPolicy {
    /// Perform the access directly; only page-straddling accesses are split.
    #[default]
    Direct,
    /// Split every unaligned access into two aligned halves.
    Split,
    /// Raise [`GuestFault::Unaligned`].
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbConfig {
    /// Number of independent translation modes (e.g. kernel/user). Each gets its own table.
    pub mmu_modes: usize,
    pub unaligned: UnalignedPolicy,
    /// Guest byte order used to assemble multi-byte values.
    pub endian: Endian,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            mmu_modes: 2,
            unaligned: UnalignedPolicy::default(),
            endian: Endian::default(),
        }
    }
}

bitflags::bitflags! {
    /// Permissions granted by a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

impl PageFlags {
    #[inline]
    pub fn permits(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.contains(PageFlags::READ),
            AccessType::Write => self.contains(PageFlags::WRITE),
            AccessType::Execute => self.contains(PageFlags::EXEC),
        }
    }
}

/// Identifies a device region for I/O dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoRegionId(pub u32);

/// What backs a guest physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Host RAM; `host_offset` locates the start of the page in the RAM exposed by
    /// [`GuestMemory::ram_read`] / [`GuestMemory::ram_write`].
    Ram { host_offset: u64 },
    /// Device registers; every access goes through [`GuestMemory::io_read`] /
    /// [`GuestMemory::io_write`].
    Io(IoRegionId),
}

/// Result of a successful page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    /// Guest physical address of the page (low bits are ignored).
    pub phys_page: u64,
    pub flags: PageFlags,
    pub backing: Backing,
    /// The page holds translated code: stores must be reported through
    /// [`GuestMemory::code_written`].
    pub watch_code: bool,
}

/// Guest-visible memory faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuestFault {
    #[error("page fault at {vaddr:#x} ({access:?})")]
    PageFault { vaddr: u64, access: AccessType },
    #[error("protection violation at {vaddr:#x} ({access:?})")]
    Protection { vaddr: u64, access: AccessType },
    #[error("unaligned {size}-byte {access:?} at {vaddr:#x}")]
    Unaligned {
        vaddr: u64,
        size: u8,
        access: AccessType,
    },
    #[error("instruction fetch from non-RAM page at {vaddr:#x}")]
    ExecuteOutsideRam { vaddr: u64 },
}

impl GuestFault {
    /// Faulting guest virtual address.
    pub fn vaddr(&self) -> u64 {
        match *self {
            GuestFault::PageFault { vaddr, .. }
            | GuestFault::Protection { vaddr, .. }
            | GuestFault::Unaligned { vaddr, .. }
            | GuestFault::ExecuteOutsideRam { vaddr } => vaddr,
        }
    }
}

/// The memory subsystem as seen by the soft TLB.
pub trait GuestMemory {
    /// Resolve `vaddr` for an access of kind `access` under translation mode `mmu_idx`.
    ///
    /// Implementations report unmapped pages as [`GuestFault::PageFault`]. Permission checks
    /// against `access` are done by the caller using [`PageMapping::flags`].
    fn walk_page_table(
        &mut self,
        vaddr: u64,
        access: AccessType,
        mmu_idx: usize,
    ) -> Result<PageMapping, GuestFault>;

    /// Copy host RAM starting at `host_offset` into `dst`. Returns `false` if out of range.
    fn ram_read(&mut self, host_offset: u64, dst: &mut [u8]) -> bool;

    /// Copy `src` into host RAM at `host_offset`. Returns `false` if out of range.
    fn ram_write(&mut self, host_offset: u64, src: &[u8]) -> bool;

    fn io_read(&mut self, region: IoRegionId, paddr: u64, size: AccessSize) -> u64;

    fn io_write(&mut self, region: IoRegionId, paddr: u64, size: AccessSize, value: u64);

    /// Called before a store lands on a page mapped with [`PageMapping::watch_code`].
    fn code_written(&mut self, _paddr: u64, _len: u64) {}
}

impl<T: GuestMemory + ?Sized> GuestMemory for &mut T {
    #[inline]
    fn walk_page_table(
        &mut self,
        vaddr: u64,
        access: AccessType,
        mmu_idx: usize,
    ) -> Result<PageMapping, GuestFault> {
        <T as GuestMemory>::walk_page_table(&mut **self, vaddr, access, mmu_idx)
    }

    #[inline]
    fn ram_read(&mut self, host_offset: u64, dst: &mut [u8]) -> bool {
        <T as GuestMemory>::ram_read(&mut **self, host_offset, dst)
    }

    #[inline]
    fn ram_write(&mut self, host_offset: u64, src: &[u8]) -> bool {
        <T as GuestMemory>::ram_write(&mut **self, host_offset, src)
    }

    #[inline]
    fn io_read(&mut self, region: IoRegionId, paddr: u64, size: AccessSize) -> u64 {
        <T as GuestMemory>::io_read(&mut **self, region, paddr, size)
    }

    #[inline]
    fn io_write(&mut self, region: IoRegionId, paddr: u64, size: AccessSize, value: u64) {
        <T as GuestMemory>::io_write(&mut **self, region, paddr, size, value)
    }

    #[inline]
    fn code_written(&mut self, paddr: u64, len: u64) {
        <T as GuestMemory>::code_written(&mut **self, paddr, len)
    }
}

/// Set of physical pages that hold translated code, shared between the translation cache and
/// every CPU's [`SoftTlb`].
///
/// A TLB with a watch attached routes stores to these pages through the slow path and reports
/// them with [`CodeWatch::code_written`] before they land, whether or not the page table
/// marks the page with [`PageMapping::watch_code`].
pub trait CodeWatch: Send + Sync {
    fn is_code_page(&self, phys_page: u64) -> bool;

    /// Advances whenever a page becomes a code page. TLBs re-tag cached write entries when
    /// they observe a new value.
    fn generation(&self) -> u64;

    /// `[paddr, paddr + len)` is about to be overwritten.
    fn code_written(&self, paddr: u64, len: u64);
}

use std::sync::Arc;

use ember_mmu::{AccessSize, GuestFault, GuestMemory, SoftTlb, TlbConfig};

use crate::arch::GuestArch;
use crate::exception::{CpuException, LoopExit};
use crate::icount::IcountState;
use crate::interrupts::{CpuHandle, CpuSignals, InterruptRequest, SingleStep};
use crate::jit::fragment::CodeFragment;
use crate::jit::jump_cache::JumpCache;

/// Counters kept by the dispatch loop and the fragment cache for one CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub fragments_executed: u64,
    /// Lookups answered by the per-CPU jump cache.
    pub jump_cache_hits: u64,
    /// Lookups that went to the physical index (and possibly the translator).
    pub slow_lookups: u64,
    pub uncached_executions: u64,
    pub interrupts_delivered: u64,
    pub exceptions_delivered: u64,
}

/// One emulated processor.
///
/// Owned by the thread running its dispatch loop. Other threads reach it only through a
/// [`CpuHandle`].
pub struct VirtualCpu<S> {
    /// Architectural register state.
    pub arch: S,
    index: usize,
    signals: Arc<CpuSignals>,
    /// Pending exception; `None` when idle.
    pub exception: Option<CpuException>,
    pub icount: IcountState,
    pub singlestep: SingleStep,
    /// Whether the current instruction may access I/O. Re-established after every unwind.
    pub can_do_io: bool,
    pub(crate) jmp_cache: JumpCache<S>,
    /// Fragment cache flush generation this CPU's jump cache belongs to.
    pub(crate) cache_generation: u64,
    tlb: SoftTlb,
    memory: Box<dyn GuestMemory + Send>,
    pub(crate) stats: CpuStats,
}

impl<S> VirtualCpu<S> {
    pub fn new(index: usize, arch: S, memory: Box<dyn GuestMemory + Send>, tlb: TlbConfig) -> Self {
        Self {
            arch,
            index,
            signals: Arc::new(CpuSignals::default()),
            exception: None,
            icount: IcountState::default(),
            singlestep: SingleStep::empty(),
            can_do_io: true,
            jmp_cache: JumpCache::new(),
            cache_generation: 0,
            tlb: SoftTlb::new(tlb),
            memory,
            stats: CpuStats::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> CpuHandle {
        CpuHandle::new(Arc::clone(&self.signals))
    }

    pub(crate) fn signals(&self) -> &Arc<CpuSignals> {
        &self.signals
    }

    pub fn is_halted(&self) -> bool {
        self.signals.is_halted()
    }

    pub fn set_halted(&self, halted: bool) {
        self.signals.set_halted(halted);
    }

    pub fn interrupt_request(&self) -> InterruptRequest {
        self.signals.interrupt_request()
    }

    pub fn raise_interrupt(&self, mask: InterruptRequest) {
        self.signals.raise_interrupt(mask);
    }

    pub fn clear_interrupt(&self, mask: InterruptRequest) {
        self.signals.clear_interrupt(mask);
    }

    pub fn request_exit(&self) {
        self.signals.request_exit();
    }

    /// Record `exception` and return the marker that unwinds to the dispatch loop.
    ///
    /// Typical use from fragment code: `return Err(cpu.raise(CpuException::Halt))`.
    pub fn raise(&mut self, exception: CpuException) -> LoopExit {
        self.exception = Some(exception);
        LoopExit
    }

    pub fn raise_fault(&mut self, fault: GuestFault) -> LoopExit {
        self.raise(CpuException::Fault(fault))
    }

    pub fn tlb(&self) -> &SoftTlb {
        &self.tlb
    }

    pub fn tlb_mut(&mut self) -> &mut SoftTlb {
        &mut self.tlb
    }

    pub fn memory_mut(&mut self) -> &mut (dyn GuestMemory + Send) {
        &mut *self.memory
    }

    /// Flush the whole soft TLB. Cached virtual-to-fragment mappings go with it.
    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
        self.jmp_cache.clear();
    }

    pub fn flush_tlb_page(&mut self, vaddr: u64) {
        self.tlb.flush_page(vaddr);
        self.jmp_cache.clear_page(vaddr);
    }

    pub fn stats(&self) -> CpuStats {
        self.stats
    }

    /// The fragment the jump cache currently holds for `pc`.
    pub fn cached_fragment(&self, pc: u64) -> Option<Arc<CodeFragment<S>>> {
        self.jmp_cache.get(pc).cloned()
    }
}

impl<S: GuestArch> VirtualCpu<S> {
    /// Guest data load; a fault is recorded and unwinds to the dispatch loop.
    pub fn load(&mut self, vaddr: u64, size: AccessSize) -> Result<u64, LoopExit> {
        let mmu_idx = self.arch.mmu_index(false);
        self.tlb
            .load(&mut *self.memory, vaddr, size, mmu_idx)
            .map_err(|fault| self.raise_fault(fault))
    }

    pub fn store(&mut self, vaddr: u64, size: AccessSize, value: u64) -> Result<(), LoopExit> {
        let mmu_idx = self.arch.mmu_index(false);
        self.tlb
            .store(&mut *self.memory, vaddr, size, value, mmu_idx)
            .map_err(|fault| self.raise_fault(fault))
    }

    /// Instruction fetch for translators. Faults are returned, not raised.
    pub fn read_code(&mut self, vaddr: u64, size: AccessSize) -> Result<u64, GuestFault> {
        let mmu_idx = self.arch.mmu_index(true);
        self.tlb.load_code(&mut *self.memory, vaddr, size, mmu_idx)
    }

    /// Guest physical address of the instruction at `vaddr`.
    pub fn translate_code(&mut self, vaddr: u64) -> Result<u64, GuestFault> {
        let mmu_idx = self.arch.mmu_index(true);
        self.tlb.translate_code(&mut *self.memory, vaddr, mmu_idx)
    }
}

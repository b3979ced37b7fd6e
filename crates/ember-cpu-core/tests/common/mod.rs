#![allow(dead_code)]

//! A scripted toy guest: 4-byte instructions whose behaviour is looked up in a [`Program`], a
//! remappable page-table memory, and a translator that turns straight-line runs of the program
//! into interpreted fragments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ember_cpu_core::{
    ArchError, CacheConfig, CodeExit, CodeFragment, CompileFlags, CpuException, Dispatcher,
    ExecConfig, FragmentCache, FragmentCode, FragmentKey, GuestArch, InterpretedCode,
    InterruptRequest, LoopExit, ReadEpoch, TranslateError, TranslateRequest, Translation,
    Translator, VirtualCpu,
};
use ember_mmu::{
    AccessSize, AccessType, Backing, GuestFault, GuestMemory, IoRegionId, PageFlags, PageMapping,
    TlbConfig, PAGE_MASK,
};
use parking_lot::Mutex;

pub const INSN_SIZE: u64 = 4;
pub const RAM_SIZE: usize = 0x10_000;
/// Where [`ToyCpu::deliver_interrupt`] sends the guest.
pub const IRQ_VECTOR: u64 = 0x8000;
/// Where [`ToyCpu::deliver_exception`] sends the guest.
pub const FAULT_VECTOR: u64 = 0x9000;
/// Exception vector the toy architecture refuses to deliver.
pub const BAD_VECTOR: u32 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Step,
    /// Direct jump, chain slot 0.
    Jump(u64),
    /// Computed jump; never chained.
    JumpIndirect(u64),
    /// Decrement `counter`; jump (slot 0) while non-zero, else fall through (slot 1).
    DecJnz(u64),
    Halt,
    Raise(u32),
    Store(u64, u64),
    /// Request an exit of whatever CPU runs on this thread.
    ExitCurrent,
    /// Record the number of active epoch readers.
    Probe,
}

impl Op {
    fn ends_block(self) -> bool {
        !matches!(self, Op::Step | Op::Store(..) | Op::ExitCurrent | Op::Probe)
    }
}

/// Guest code; addresses not listed execute as [`Op::Step`].
#[derive(Debug, Clone, Default)]
pub struct Program {
    ops: HashMap<u64, Op>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, pc: u64, op: Op) -> Self {
        self.ops.insert(pc, op);
        self
    }

    pub fn op(&self, pc: u64) -> Op {
        self.ops.get(&pc).copied().unwrap_or(Op::Step)
    }
}

#[derive(Debug, Default)]
pub struct ToyCpu {
    pub pc: u64,
    pub mode: u32,
    pub counter: u64,
    pub irq_enabled: bool,
    /// Every instruction executed, in order.
    pub trace: Vec<u64>,
    /// Program counter at each delivered interrupt.
    pub interrupts: Vec<u64>,
    pub exceptions: Vec<CpuException>,
    pub debug_traps: u32,
    pub resets: u32,
    pub probes: Vec<usize>,
    pub epoch: Option<Arc<ReadEpoch>>,
}

impl GuestArch for ToyCpu {
    fn fragment_key(&self) -> FragmentKey {
        FragmentKey::new(self.pc, 0, self.mode)
    }

    fn mmu_index(&self, _ifetch: bool) -> usize {
        0
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn deliver_interrupt(cpu: &mut VirtualCpu<Self>, pending: InterruptRequest) -> bool {
        if !cpu.arch.irq_enabled || !pending.contains(InterruptRequest::HARD) {
            return false;
        }
        cpu.clear_interrupt(InterruptRequest::HARD);
        let pc = cpu.arch.pc;
        cpu.arch.interrupts.push(pc);
        cpu.arch.pc = IRQ_VECTOR;
        true
    }

    fn deliver_exception(
        cpu: &mut VirtualCpu<Self>,
        exception: CpuException,
    ) -> Result<(), ArchError> {
        if let CpuException::Guest {
            vector: BAD_VECTOR, ..
        } = exception
        {
            return Err(ArchError::UnhandledVector(BAD_VECTOR));
        }
        cpu.arch.exceptions.push(exception);
        cpu.arch.pc = FAULT_VECTOR;
        Ok(())
    }

    fn handle_debug_trap(cpu: &mut VirtualCpu<Self>) {
        cpu.arch.debug_traps += 1;
    }

    fn reset(cpu: &mut VirtualCpu<Self>) {
        cpu.arch.pc = 0;
        cpu.arch.mode = 0;
        cpu.arch.resets += 1;
    }
}

struct ScriptBlock {
    insns: Vec<(u64, Op)>,
}

impl InterpretedCode<ToyCpu> for ScriptBlock {
    fn interpret(&self, cpu: &mut VirtualCpu<ToyCpu>) -> Result<CodeExit, LoopExit> {
        for &(pc, op) in &self.insns {
            cpu.arch.trace.push(pc);
            let next = pc + INSN_SIZE;
            match op {
                Op::Step => cpu.arch.pc = next,
                Op::Jump(target) => {
                    cpu.arch.pc = target;
                    return Ok(CodeExit::Goto(0));
                }
                Op::JumpIndirect(target) => {
                    cpu.arch.pc = target;
                    return Ok(CodeExit::Indirect);
                }
                Op::DecJnz(target) => {
                    cpu.arch.counter -= 1;
                    if cpu.arch.counter != 0 {
                        cpu.arch.pc = target;
                        return Ok(CodeExit::Goto(0));
                    }
                    cpu.arch.pc = next;
                    return Ok(CodeExit::Goto(1));
                }
                Op::Halt => {
                    cpu.arch.pc = next;
                    cpu.set_halted(true);
                    return Err(cpu.raise(CpuException::Halt));
                }
                Op::Raise(vector) => {
                    cpu.arch.pc = pc;
                    return Err(cpu.raise(CpuException::Guest {
                        vector,
                        error_code: None,
                    }));
                }
                Op::Store(addr, value) => {
                    cpu.arch.pc = pc;
                    cpu.store(addr, AccessSize::Word, value)?;
                    cpu.arch.pc = next;
                }
                Op::ExitCurrent => {
                    assert!(ember_cpu_core::exit_current_cpu());
                    cpu.arch.pc = next;
                }
                Op::Probe => {
                    let readers = cpu.arch.epoch.as_ref().map_or(0, |e| e.active_readers());
                    cpu.arch.probes.push(readers);
                    cpu.arch.pc = next;
                }
            }
        }
        Ok(CodeExit::Goto(1))
    }
}

/// What the translator did, observable after it was moved into the cache.
#[derive(Debug, Default)]
pub struct TranslatorLog {
    pub requests: Mutex<Vec<TranslateRequest>>,
    /// Ids of fragments reported through `on_invalidate`.
    pub invalidated: Mutex<Vec<u64>>,
    pub flushes: Mutex<u32>,
}

impl TranslatorLog {
    pub fn translations(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn translated_pcs(&self) -> Vec<u64> {
        self.requests.lock().iter().map(|r| r.key.pc).collect()
    }
}

pub struct ScriptTranslator {
    program: Arc<Program>,
    log: Arc<TranslatorLog>,
    /// Live fragments the "code buffer" can hold.
    capacity: Option<usize>,
    live: usize,
}

impl ScriptTranslator {
    pub fn new(program: Arc<Program>, log: Arc<TranslatorLog>) -> Self {
        Self {
            program,
            log,
            capacity: None,
            live: 0,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl Translator<ToyCpu> for ScriptTranslator {
    fn translate(
        &mut self,
        cpu: &mut VirtualCpu<ToyCpu>,
        request: &TranslateRequest,
    ) -> Result<Translation<ToyCpu>, TranslateError> {
        if self.capacity.is_some_and(|capacity| self.live >= capacity) {
            return Err(TranslateError::BufferFull);
        }

        let mut insns = Vec::new();
        let mut pc = request.key.pc;
        while (insns.len() as u32) < request.max_insns {
            if let Err(fault) = cpu.read_code(pc, AccessSize::Word) {
                if insns.is_empty() {
                    return Err(fault.into());
                }
                break;
            }
            let op = self.program.op(pc);
            insns.push((pc, op));
            pc += INSN_SIZE;
            if op.ends_block() {
                break;
            }
        }

        self.live += 1;
        self.log.requests.lock().push(*request);
        Ok(Translation {
            size: (insns.len() as u64 * INSN_SIZE) as u32,
            icount: insns.len() as u16,
            code: FragmentCode::Interpreted(Box::new(ScriptBlock { insns })),
        })
    }

    fn on_invalidate(&mut self, fragment: &CodeFragment<ToyCpu>) {
        self.live = self.live.saturating_sub(1);
        self.log.invalidated.lock().push(fragment.id());
    }

    fn on_flush(&mut self) {
        self.live = 0;
        *self.log.flushes.lock() += 1;
    }
}

/// Virtual-to-physical page map shared between a test and its [`PagedMemory`].
#[derive(Debug, Default)]
pub struct PageMap {
    remap: HashMap<u64, u64>,
    unmapped: HashSet<u64>,
}

impl PageMap {
    pub fn remap(&mut self, vpage: u64, ppage: u64) {
        self.remap.insert(vpage & PAGE_MASK, ppage & PAGE_MASK);
    }

    pub fn unmap(&mut self, vpage: u64) {
        self.unmapped.insert(vpage & PAGE_MASK);
    }
}

/// RAM with a page table the test can change after the memory was handed to a CPU.
pub struct PagedMemory {
    ram: Vec<u8>,
    map: Arc<Mutex<PageMap>>,
}

impl PagedMemory {
    pub fn new(map: Arc<Mutex<PageMap>>) -> Self {
        Self {
            ram: vec![0; RAM_SIZE],
            map,
        }
    }
}

impl GuestMemory for PagedMemory {
    fn walk_page_table(
        &mut self,
        vaddr: u64,
        access: AccessType,
        _mmu_idx: usize,
    ) -> Result<PageMapping, GuestFault> {
        let vpage = vaddr & PAGE_MASK;
        let map = self.map.lock();
        if map.unmapped.contains(&vpage) {
            return Err(GuestFault::PageFault { vaddr, access });
        }
        let ppage = map.remap.get(&vpage).copied().unwrap_or(vpage);
        if ppage >= RAM_SIZE as u64 {
            return Err(GuestFault::PageFault { vaddr, access });
        }
        Ok(PageMapping {
            phys_page: ppage,
            flags: PageFlags::RWX,
            backing: Backing::Ram { host_offset: ppage },
            watch_code: false,
        })
    }

    fn ram_read(&mut self, host_offset: u64, dst: &mut [u8]) -> bool {
        let start = host_offset as usize;
        match self.ram.get(start..start + dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn ram_write(&mut self, host_offset: u64, src: &[u8]) -> bool {
        let start = host_offset as usize;
        match self.ram.get_mut(start..start + src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn io_read(&mut self, _region: IoRegionId, _paddr: u64, _size: AccessSize) -> u64 {
        0
    }

    fn io_write(&mut self, _region: IoRegionId, _paddr: u64, _size: AccessSize, _value: u64) {}
}

pub struct Harness {
    pub cpu: VirtualCpu<ToyCpu>,
    pub cache: Arc<FragmentCache<ToyCpu>>,
    pub dispatcher: Dispatcher<ToyCpu>,
    pub log: Arc<TranslatorLog>,
    pub map: Arc<Mutex<PageMap>>,
}

pub struct HarnessBuilder {
    program: Program,
    exec: ExecConfig,
    cache: CacheConfig,
    capacity: Option<usize>,
    pc: u64,
}

impl HarnessBuilder {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            exec: ExecConfig::default(),
            cache: CacheConfig::default(),
            capacity: None,
            pc: 0x1000,
        }
    }

    pub fn exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn pc(mut self, pc: u64) -> Self {
        self.pc = pc;
        self
    }

    pub fn build(self) -> Harness {
        let log = Arc::new(TranslatorLog::default());
        let mut translator = ScriptTranslator::new(Arc::new(self.program), Arc::clone(&log));
        if let Some(capacity) = self.capacity {
            translator = translator.with_capacity(capacity);
        }
        let cache = Arc::new(FragmentCache::new(Box::new(translator), self.cache));
        let dispatcher = Dispatcher::new(Arc::clone(&cache), self.exec);

        let map = Arc::new(Mutex::new(PageMap::default()));
        let memory = PagedMemory::new(Arc::clone(&map));
        let arch = ToyCpu {
            pc: self.pc,
            ..ToyCpu::default()
        };
        let cpu = VirtualCpu::new(0, arch, Box::new(memory), TlbConfig::default());
        Harness {
            cpu,
            cache,
            dispatcher,
            log,
            map,
        }
    }
}

impl Harness {
    /// Another CPU on the same cache and page map.
    pub fn add_cpu(&self, index: usize, pc: u64) -> VirtualCpu<ToyCpu> {
        let memory = PagedMemory::new(Arc::clone(&self.map));
        let arch = ToyCpu {
            pc,
            ..ToyCpu::default()
        };
        VirtualCpu::new(index, arch, Box::new(memory), TlbConfig::default())
    }
}

pub fn harness(program: Program) -> Harness {
    HarnessBuilder::new(program).build()
}

pub fn nocache(request: &TranslateRequest) -> bool {
    request.cflags.contains(CompileFlags::NOCACHE)
}

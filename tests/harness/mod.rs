#![allow(dead_code)]

//! A small byte-coded guest used by the end-to-end tests.
//!
//! Instructions are 4 bytes, little endian: opcode, register, 16-bit immediate. Code lives in
//! ordinary guest RAM and is fetched through the CPU's soft-TLB like any other target would.

use std::sync::{Arc, Barrier};

use ember_cpu_core::{
    ArchError, CacheConfig, CodeExit, CpuException, Dispatcher, ExecConfig, FragmentCache,
    FragmentCode, FragmentKey, GuestArch, InterpretedCode, InterruptRequest, LoopExit,
    TranslateError, TranslateRequest, Translation, Translator, VirtualCpu,
};
use ember_mmu::{AccessSize, FlatMemory, TlbConfig};
use parking_lot::Mutex;

pub const INSN_SIZE: u64 = 4;
pub const RAM_SIZE: usize = 0x10_000;
pub const IRQ_VECTOR: u64 = 0x3000;

const OP_NOP: u8 = 0x00;
const OP_ADDI: u8 = 0x01;
const OP_JMP: u8 = 0x02;
const OP_DJNZ: u8 = 0x03;
const OP_STB: u8 = 0x04;
const OP_HLT: u8 = 0x05;
const OP_SYNC: u8 = 0x06;

fn encode(op: u8, reg: u8, imm: u16) -> u32 {
    u32::from(op) | u32::from(reg) << 8 | u32::from(imm) << 16
}

pub fn nop() -> u32 {
    encode(OP_NOP, 0, 0)
}

/// `r[reg] += imm`
pub fn addi(reg: u8, imm: u16) -> u32 {
    encode(OP_ADDI, reg, imm)
}

pub fn jmp(target: u16) -> u32 {
    encode(OP_JMP, 0, target)
}

/// Decrement `r[reg]` and jump to `target` while it is non-zero.
pub fn djnz(reg: u8, target: u16) -> u32 {
    encode(OP_DJNZ, reg, target)
}

/// Store the low byte of `r[reg]` at `addr`.
pub fn stb(reg: u8, addr: u16) -> u32 {
    encode(OP_STB, reg, addr)
}

pub fn hlt() -> u32 {
    encode(OP_HLT, 0, 0)
}

/// Meet the test thread twice on [`ByteCpu::rendezvous`], then end the fragment.
pub fn sync() -> u32 {
    encode(OP_SYNC, 0, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insn {
    Nop,
    AddI { reg: usize, imm: u64 },
    Jmp(u64),
    Djnz { reg: usize, target: u64 },
    Stb { reg: usize, addr: u64 },
    Hlt,
    Sync,
    Invalid(u8),
}

impl Insn {
    fn decode(word: u64) -> Self {
        let reg = usize::from((word >> 8) as u8 & 3);
        let imm = (word >> 16) & 0xffff;
        match word as u8 {
            OP_NOP => Insn::Nop,
            OP_ADDI => Insn::AddI { reg, imm },
            OP_JMP => Insn::Jmp(imm),
            OP_DJNZ => Insn::Djnz { reg, target: imm },
            OP_STB => Insn::Stb { reg, addr: imm },
            OP_HLT => Insn::Hlt,
            OP_SYNC => Insn::Sync,
            op => Insn::Invalid(op),
        }
    }

    fn ends_block(self) -> bool {
        !matches!(self, Insn::Nop | Insn::AddI { .. } | Insn::Stb { .. })
    }
}

#[derive(Debug, Default)]
pub struct ByteCpu {
    pub pc: u64,
    pub regs: [u64; 4],
    pub irq_enabled: bool,
    /// Instructions executed, counted by the instructions themselves.
    pub retired: u64,
    pub trace: Vec<u64>,
    /// Program counter at each delivered interrupt.
    pub interrupts: Vec<u64>,
    pub rendezvous: Option<Arc<Barrier>>,
}

impl GuestArch for ByteCpu {
    fn fragment_key(&self) -> FragmentKey {
        FragmentKey::new(self.pc, 0, 0)
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
        cpu.arch.irq_enabled = false;
        cpu.arch.pc = IRQ_VECTOR;
        true
    }

    fn deliver_exception(
        cpu: &mut VirtualCpu<Self>,
        exception: CpuException,
    ) -> Result<(), ArchError> {
        Err(ArchError::Other(format!(
            "{exception:?} at {:#x}",
            cpu.arch.pc
        )))
    }
}

struct ByteBlock {
    insns: Vec<(u64, Insn)>,
}

impl InterpretedCode<ByteCpu> for ByteBlock {
    fn interpret(&self, cpu: &mut VirtualCpu<ByteCpu>) -> Result<CodeExit, LoopExit> {
        for &(pc, insn) in &self.insns {
            cpu.arch.trace.push(pc);
            cpu.arch.retired += 1;
            let next = pc + INSN_SIZE;
            match insn {
                Insn::Nop => cpu.arch.pc = next,
                Insn::AddI { reg, imm } => {
                    cpu.arch.regs[reg] = cpu.arch.regs[reg].wrapping_add(imm);
                    cpu.arch.pc = next;
                }
                Insn::Jmp(target) => {
                    cpu.arch.pc = target;
                    return Ok(CodeExit::Goto(0));
                }
                Insn::Djnz { reg, target } => {
                    cpu.arch.regs[reg] = cpu.arch.regs[reg].wrapping_sub(1);
                    if cpu.arch.regs[reg] != 0 {
                        cpu.arch.pc = target;
                        return Ok(CodeExit::Goto(0));
                    }
                    cpu.arch.pc = next;
                    return Ok(CodeExit::Goto(1));
                }
                Insn::Stb { reg, addr } => {
                    cpu.arch.pc = pc;
                    let value = cpu.arch.regs[reg] & 0xff;
                    cpu.store(addr, AccessSize::Byte, value)?;
                    cpu.arch.pc = next;
                }
                Insn::Hlt => {
                    cpu.arch.pc = next;
                    cpu.set_halted(true);
                    return Err(cpu.raise(CpuException::Halt));
                }
                Insn::Sync => {
                    if let Some(barrier) = cpu.arch.rendezvous.clone() {
                        barrier.wait();
                        barrier.wait();
                    }
                    cpu.arch.pc = next;
                    return Ok(CodeExit::Goto(1));
                }
                Insn::Invalid(op) => {
                    cpu.arch.pc = pc;
                    return Err(cpu.raise(CpuException::Guest {
                        vector: u32::from(op),
                        error_code: None,
                    }));
                }
            }
        }
        Ok(CodeExit::Goto(1))
    }
}

/// Decodes guest RAM into interpreted fragments and records every request it served.
pub struct ByteTranslator {
    requests: Arc<Mutex<Vec<TranslateRequest>>>,
}

impl Translator<ByteCpu> for ByteTranslator {
    fn translate(
        &mut self,
        cpu: &mut VirtualCpu<ByteCpu>,
        request: &TranslateRequest,
    ) -> Result<Translation<ByteCpu>, TranslateError> {
        let mut insns = Vec::new();
        let mut pc = request.key.pc;
        while (insns.len() as u32) < request.max_insns {
            let word = match cpu.read_code(pc, AccessSize::Word) {
                Ok(word) => word,
                Err(fault) if insns.is_empty() => return Err(fault.into()),
                Err(_) => break,
            };
            let insn = Insn::decode(word);
            insns.push((pc, insn));
            pc += INSN_SIZE;
            if insn.ends_block() {
                break;
            }
        }

        self.requests.lock().push(*request);
        Ok(Translation {
            size: (insns.len() as u64 * INSN_SIZE) as u32,
            icount: insns.len() as u16,
            code: FragmentCode::Interpreted(Box::new(ByteBlock { insns })),
        })
    }
}

pub struct Machine {
    pub cpu: VirtualCpu<ByteCpu>,
    pub dispatcher: Dispatcher<ByteCpu>,
    pub cache: Arc<FragmentCache<ByteCpu>>,
    requests: Arc<Mutex<Vec<TranslateRequest>>>,
    code: Vec<(u64, Vec<u32>)>,
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder::default()
    }

    /// Another CPU sharing this machine's fragment cache, with its own copy of the program.
    pub fn add_cpu(&self, index: usize, pc: u64) -> VirtualCpu<ByteCpu> {
        let memory = load_memory(&self.code);
        let arch = ByteCpu {
            pc,
            ..ByteCpu::default()
        };
        VirtualCpu::new(index, arch, Box::new(memory), TlbConfig::default())
    }

    pub fn translations(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn translations_of(&self, pc: u64) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.key.pc == pc)
            .count()
    }

    pub fn requests(&self) -> Vec<TranslateRequest> {
        self.requests.lock().clone()
    }
}

pub struct MachineBuilder {
    code: Vec<(u64, Vec<u32>)>,
    exec: ExecConfig,
    cache: CacheConfig,
    pc: u64,
    irq_enabled: bool,
    rendezvous: Option<Arc<Barrier>>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self {
            code: Vec::new(),
            exec: ExecConfig::default(),
            cache: CacheConfig::default(),
            pc: 0x1000,
            irq_enabled: false,
            rendezvous: None,
        }
    }
}

impl MachineBuilder {
    pub fn code(mut self, addr: u64, insns: &[u32]) -> Self {
        self.code.push((addr, insns.to_vec()));
        self
    }

    pub fn exec(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn pc(mut self, pc: u64) -> Self {
        self.pc = pc;
        self
    }

    pub fn irq_enabled(mut self, enabled: bool) -> Self {
        self.irq_enabled = enabled;
        self
    }

    pub fn rendezvous(mut self, barrier: Arc<Barrier>) -> Self {
        self.rendezvous = Some(barrier);
        self
    }

    pub fn build(self) -> Machine {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let translator = ByteTranslator {
            requests: Arc::clone(&requests),
        };
        let cache = Arc::new(FragmentCache::new(Box::new(translator), self.cache));
        let dispatcher = Dispatcher::new(Arc::clone(&cache), self.exec);

        let memory = load_memory(&self.code);

        let arch = ByteCpu {
            pc: self.pc,
            irq_enabled: self.irq_enabled,
            rendezvous: self.rendezvous,
            ..ByteCpu::default()
        };
        let cpu = VirtualCpu::new(0, arch, Box::new(memory), TlbConfig::default());
        Machine {
            cpu,
            dispatcher,
            cache,
            requests,
            code: self.code,
        }
    }
}

fn load_memory(code: &[(u64, Vec<u32>)]) -> FlatMemory {
    let mut ram = FlatMemory::new(RAM_SIZE);
    for (addr, insns) in code {
        let bytes: Vec<u8> = insns.iter().flat_map(|insn| insn.to_le_bytes()).collect();
        ram.write_bytes(*addr, &bytes);
    }
    ram
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

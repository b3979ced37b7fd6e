//! Execution core for a translating CPU emulator.
//!
//! A [`exec::Dispatcher`] drives one [`VirtualCpu`] through cached, pre-translated code
//! fragments. Fragments are looked up in a [`jit::cache::FragmentCache`] (a physical-address
//! hash index shared by all CPUs plus a per-CPU virtual-address jump cache), chained directly to
//! their successors, and executed until something needs the loop's attention: a pending
//! interrupt, an exception, an exit request or an exhausted instruction budget.
//!
//! Guest architecture details (register file, interrupt and exception delivery) are supplied by
//! a [`GuestArch`] implementation; instruction translation by a [`jit::translator::Translator`].
//! Guest memory goes through the per-CPU soft TLB from `ember-mmu`.
//!
//! Aborting from deep inside a fragment is modelled with the [`LoopExit`] marker: the reason is
//! stored in [`VirtualCpu::exception`] and `Err(LoopExit)` is propagated with `?` back to the
//! dispatch loop.

pub mod arch;
pub mod epoch;
pub mod exception;
pub mod exec;
pub mod icount;
pub mod interrupts;
pub mod jit;
pub mod state;

pub use arch::GuestArch;
pub use epoch::{ReadEpoch, ReadGuard};
pub use exception::{ArchError, CpuException, ExecError, ExitReason, LoopExit};
pub use exec::{Dispatcher, ExecConfig, ExecMode, FragmentExit, TbExit};
pub use icount::IcountState;
pub use jit::cache::{CacheConfig, CacheStats, ChainPoint, FragmentCache};
pub use jit::fragment::{
    CodeExit, CodeFragment, CompileFlags, FragmentCode, FragmentKey, InterpretedCode,
    CF_COUNT_MASK, CHAIN_SLOTS,
};
pub use jit::translator::{TranslateError, TranslateRequest, Translation, Translator};
pub use interrupts::{
    clear_global_exit, exit_current_cpu, global_exit_requested, request_global_exit, CpuHandle,
    InterruptRequest, SingleStep,
};
pub use state::{CpuStats, VirtualCpu};

use crate::exception::{ArchError, CpuException};
use crate::interrupts::InterruptRequest;
use crate::jit::fragment::{CodeFragment, FragmentKey};
use crate::state::VirtualCpu;

/// Architecture-specific CPU state and the hooks the dispatch loop calls into.
///
/// `Self` is the guest register file. The associated functions take the whole [`VirtualCpu`] so
/// that interrupt and exception delivery can reach guest memory and the pending-interrupt mask.
pub trait GuestArch: Sized + Send + 'static {
    /// Lookup key for the code at the current program counter.
    fn fragment_key(&self) -> FragmentKey;

    /// Soft-TLB translation mode for data accesses, or for instruction fetch when `ifetch`.
    fn mmu_index(&self, ifetch: bool) -> usize;

    fn set_pc(&mut self, pc: u64);

    /// Restore the program counter after `fragment` was abandoned before executing anything.
    fn resynchronize_pc(cpu: &mut VirtualCpu<Self>, fragment: &CodeFragment<Self>) {
        cpu.arch.set_pc(fragment.pc());
    }

    /// Whether a halted CPU has something to do.
    ///
    /// The default wakes on any pending interrupt request.
    fn has_work(cpu: &VirtualCpu<Self>) -> bool {
        !cpu.interrupt_request().is_empty()
    }

    /// Deliver one of the `pending` interrupts if the guest currently accepts it.
    ///
    /// Returns `true` if execution was redirected, which drops any pending chaining decision.
    /// Implementations clear the request bits they consumed.
    fn deliver_interrupt(_cpu: &mut VirtualCpu<Self>, _pending: InterruptRequest) -> bool {
        false
    }

    /// Enter the guest's handler for `exception`.
    ///
    /// Only called for exceptions that are not loop exits, and only in system mode. An error is
    /// fatal to the current [`crate::Dispatcher::run`] call.
    fn deliver_exception(
        cpu: &mut VirtualCpu<Self>,
        exception: CpuException,
    ) -> Result<(), ArchError>;

    /// Called before `run` returns for a debug stop.
    fn handle_debug_trap(_cpu: &mut VirtualCpu<Self>) {}

    /// Architectural reset requested through [`InterruptRequest::RESET`].
    fn reset(_cpu: &mut VirtualCpu<Self>) {}

    fn exec_enter(_cpu: &mut VirtualCpu<Self>) {}

    fn exec_exit(_cpu: &mut VirtualCpu<Self>) {}
}

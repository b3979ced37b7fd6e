use ember_mmu::GuestFault;
use thiserror::Error;

/// Marker returned through `Err` when execution must abandon the current fragment and return to
/// the dispatch loop. The reason is always recorded in [`crate::VirtualCpu::exception`] first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct LoopExit;

/// Pending exception recorded on a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuException {
    /// Architecture-defined exception vector raised by a fragment or helper.
    Guest { vector: u32, error_code: Option<u32> },
    /// Fault raised by the soft-TLB access path or instruction fetch.
    Fault(GuestFault),
    /// Exit requested from outside, or the instruction budget ran out.
    Interrupt,
    /// The guest executed a halt instruction or a halt interrupt was serviced.
    Halt,
    /// The CPU was put into the halted state by the architecture (e.g. INIT).
    Halted,
    Debug,
    /// The guest gave up its time slice.
    Yield,
}

impl CpuException {
    /// Exceptions of these classes end the dispatch loop instead of being delivered.
    #[inline]
    pub fn is_loop_exit(&self) -> bool {
        matches!(
            self,
            CpuException::Interrupt
                | CpuException::Halt
                | CpuException::Halted
                | CpuException::Debug
                | CpuException::Yield
        )
    }

    pub(crate) fn exit_reason(&self) -> Option<ExitReason> {
        match self {
            CpuException::Interrupt => Some(ExitReason::Interrupt),
            CpuException::Halt | CpuException::Halted => Some(ExitReason::Halted),
            CpuException::Debug => Some(ExitReason::Debug),
            CpuException::Yield => Some(ExitReason::Yield),
            CpuException::Guest { .. } | CpuException::Fault(_) => None,
        }
    }
}

impl From<GuestFault> for CpuException {
    fn from(fault: GuestFault) -> Self {
        CpuException::Fault(fault)
    }
}

/// Why [`crate::Dispatcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The CPU is halted and has no pending work.
    Halted,
    /// An exit was requested (by another thread, a signal handler or the embedder) or the
    /// instruction budget was used up.
    Interrupt,
    /// Debug stop (breakpoint, watchpoint or single step).
    Debug,
    Yield,
    /// User-mode execution only: a guest exception for the embedder to service.
    Exception(CpuException),
}

/// Failure reported by [`crate::GuestArch::deliver_exception`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchError {
    #[error("triple fault")]
    TripleFault,
    #[error("unhandled exception vector {0}")]
    UnhandledVector(u32),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to deliver {exception:?}")]
    Delivery {
        exception: CpuException,
        #[source]
        source: ArchError,
    },
}

pub type Result<T> = std::result::Result<T, ExecError>;

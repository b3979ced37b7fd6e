//! Cross-thread signalling into a running CPU.
//!
//! Everything another thread (or a host signal handler) may touch lives in [`CpuSignals`] and
//! is accessed with plain atomic loads and stores, so [`CpuHandle::request_exit`] and
//! [`request_global_exit`] are async-signal-safe.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Pending interrupt classes.
    ///
    /// The `TARGET_*` classes carry no meaning here; architectures alias them (NMI, SMI, SIPI,
    /// virtual IRQ, ...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptRequest: u32 {
        /// External hardware interrupt line.
        const HARD = 0x0002;
        /// Leave the current fragment chain so new CPU state is picked up.
        const EXITTB = 0x0004;
        const TARGET_EXT_0 = 0x0008;
        const TARGET_EXT_1 = 0x0010;
        const HALT = 0x0020;
        const TARGET_EXT_2 = 0x0040;
        const DEBUG = 0x0080;
        const TARGET_INT_0 = 0x0100;
        const TARGET_EXT_3 = 0x0200;
        const RESET = 0x0400;
        const TARGET_INT_1 = 0x0800;
        const TARGET_EXT_4 = 0x1000;
        const TARGET_INT_2 = 0x2000;

        /// Classes suppressed while single-stepping with [`SingleStep::NOIRQ`].
        const SSTEP_MASK = Self::HARD.bits()
            | Self::TARGET_EXT_0.bits()
            | Self::TARGET_EXT_1.bits()
            | Self::TARGET_EXT_2.bits()
            | Self::TARGET_EXT_3.bits()
            | Self::TARGET_EXT_4.bits();
    }
}

bitflags::bitflags! {
    /// Single-step mode requested by a debugger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SingleStep: u8 {
        const ENABLE = 0x1;
        /// Do not service interrupts while stepping.
        const NOIRQ = 0x2;
        const NOTIMER = 0x4;
    }
}

/// Per-CPU flags shared with other threads.
#[derive(Debug, Default)]
pub struct CpuSignals {
    interrupt_request: AtomicU32,
    exit_request: AtomicBool,
    /// Polled at every fragment entry; makes the CPU leave its fragment chain.
    fragment_exit_request: AtomicBool,
    halted: AtomicBool,
}

impl CpuSignals {
    #[inline]
    pub fn interrupt_request(&self) -> InterruptRequest {
        InterruptRequest::from_bits_retain(self.interrupt_request.load(Ordering::Acquire))
    }

    pub fn raise_interrupt(&self, mask: InterruptRequest) {
        self.interrupt_request
            .fetch_or(mask.bits(), Ordering::AcqRel);
        self.fragment_exit_request.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self, mask: InterruptRequest) {
        self.interrupt_request
            .fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    pub fn request_exit(&self) {
        self.exit_request.store(true, Ordering::Release);
        self.fragment_exit_request.store(true, Ordering::Release);
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }

    /// Clear and return the exit request.
    #[inline]
    pub(crate) fn take_exit_request(&self) -> bool {
        self.exit_request.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn fragment_exit_requested(&self) -> bool {
        self.fragment_exit_request.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn clear_fragment_exit_request(&self) {
        self.fragment_exit_request.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::Release);
    }
}

/// Thread-safe handle for poking a CPU that may be running on another thread.
#[derive(Debug, Clone)]
pub struct CpuHandle {
    signals: Arc<CpuSignals>,
}

impl CpuHandle {
    pub(crate) fn new(signals: Arc<CpuSignals>) -> Self {
        Self { signals }
    }

    /// Make the CPU leave its dispatch loop at the next safe point with
    /// [`crate::ExitReason::Interrupt`].
    pub fn request_exit(&self) {
        self.signals.request_exit();
    }

    /// Mark `mask` pending; the CPU observes it before resolving its next fragment.
    pub fn raise_interrupt(&self, mask: InterruptRequest) {
        self.signals.raise_interrupt(mask);
    }

    pub fn clear_interrupt(&self, mask: InterruptRequest) {
        self.signals.clear_interrupt(mask);
    }

    pub fn interrupt_request(&self) -> InterruptRequest {
        self.signals.interrupt_request()
    }

    pub fn is_halted(&self) -> bool {
        self.signals.is_halted()
    }
}

static EXIT_REQUEST: AtomicBool = AtomicBool::new(false);

/// Ask every CPU to leave its dispatch loop. Sampled on loop entry and converted into a
/// per-CPU exit request; stays set until [`clear_global_exit`].
pub fn request_global_exit() {
    EXIT_REQUEST.store(true, Ordering::SeqCst);
}

pub fn clear_global_exit() {
    EXIT_REQUEST.store(false, Ordering::SeqCst);
}

pub fn global_exit_requested() -> bool {
    EXIT_REQUEST.load(Ordering::SeqCst)
}

thread_local! {
    // The CPU whose dispatch loop runs on this thread. Only used for out-of-band exit requests;
    // everything else receives the CPU explicitly.
    static CURRENT_CPU: RefCell<Option<Arc<CpuSignals>>> = const { RefCell::new(None) };
}

/// Request an exit from the CPU running on the calling thread, if any.
///
/// Meant for code called from inside a fragment (device callbacks, helpers) that has no direct
/// access to the CPU. Returns `false` if no CPU is running on this thread.
pub fn exit_current_cpu() -> bool {
    CURRENT_CPU
        .try_with(|current| match current.try_borrow() {
            Ok(current) => match current.as_ref() {
                Some(signals) => {
                    signals.request_exit();
                    true
                }
                None => false,
            },
            Err(_) => false,
        })
        .unwrap_or(false)
}

/// Registers a CPU as the current one for this thread until dropped.
pub(crate) struct CurrentCpuGuard {
    previous: Option<Arc<CpuSignals>>,
}

impl CurrentCpuGuard {
    pub(crate) fn enter(signals: &Arc<CpuSignals>) -> Self {
        let previous = CURRENT_CPU.with(|current| current.replace(Some(Arc::clone(signals))));
        Self { previous }
    }
}

impl Drop for CurrentCpuGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_CPU.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

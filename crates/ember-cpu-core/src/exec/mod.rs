//! The dispatch loop.

use std::convert::Infallible;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use ember_mmu::CodeWatch;
use ember_time::{HostClock, IcountConfig, StdHostClock, SyncClocks};

use crate::arch::GuestArch;
use crate::epoch::ReadEpoch;
use crate::exception::{CpuException, ExecError, ExitReason, LoopExit};
use crate::interrupts::{global_exit_requested, CurrentCpuGuard, InterruptRequest, SingleStep};
use crate::jit::cache::{ChainPoint, FragmentCache};
use crate::jit::fragment::CodeFragment;
use crate::state::VirtualCpu;

mod chain;

pub use chain::{execute_fragments, FragmentExit, TbExit};

/// Whether guest exceptions are handled by the guest or by the embedder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecMode {
    /// Full-system emulation: exceptions are delivered through [`GuestArch::deliver_exception`].
    #[default]
    System,
    /// User-mode emulation: exceptions end [`Dispatcher::run`] with [`ExitReason::Exception`].
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecConfig {
    pub mode: ExecMode,
    /// Deterministic timing. `None` runs without an instruction budget.
    pub icount: Option<IcountConfig>,
    /// Link fragments directly to their successors.
    pub chaining: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            mode: ExecMode::System,
            icount: None,
            chaining: true,
        }
    }
}

/// Drives [`VirtualCpu`]s through the fragments of a shared [`FragmentCache`].
///
/// One dispatcher may serve several CPUs, each running [`Dispatcher::run`] on its own thread.
pub struct Dispatcher<S> {
    cache: Arc<FragmentCache<S>>,
    epoch: Arc<ReadEpoch>,
    clock: Arc<dyn HostClock>,
    /// Host time that corresponds to virtual time zero.
    clock_origin_ns: i64,
    config: ExecConfig,
}

impl<S: GuestArch> Dispatcher<S> {
    pub fn new(cache: Arc<FragmentCache<S>>, config: ExecConfig) -> Self {
        Self::with_clock(cache, config, Arc::new(StdHostClock::new()))
    }

    pub fn with_clock(
        cache: Arc<FragmentCache<S>>,
        config: ExecConfig,
        clock: Arc<dyn HostClock>,
    ) -> Self {
        let clock_origin_ns = clock.now_ns();
        Self {
            cache,
            epoch: Arc::new(ReadEpoch::new()),
            clock,
            clock_origin_ns,
            config,
        }
    }

    /// Share `epoch` with whoever updates structures the CPUs read while executing.
    pub fn with_epoch(mut self, epoch: Arc<ReadEpoch>) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn cache(&self) -> &Arc<FragmentCache<S>> {
        &self.cache
    }

    pub fn epoch(&self) -> &Arc<ReadEpoch> {
        &self.epoch
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Guest code in `[start, start + len)` (physical) was modified.
    pub fn invalidate_code(&self, start: u64, len: u64) -> usize {
        self.cache.invalidate(start, len)
    }

    /// Run `cpu` until it halts, an exit is requested, its instruction budget runs out, or a
    /// debug stop (or, in user mode, a guest exception) occurs.
    ///
    /// Errors are reserved for exceptions the architecture failed to deliver.
    pub fn run(&self, cpu: &mut VirtualCpu<S>) -> Result<ExitReason, ExecError> {
        if Self::handle_halt(cpu) {
            return Ok(ExitReason::Halted);
        }

        let _current = CurrentCpuGuard::enter(cpu.signals());
        let _read = self.epoch.read();

        if global_exit_requested() {
            cpu.request_exit();
        }
        cpu.icount.set_enabled(self.config.icount.is_some());
        // Guest stores to pages holding cached fragments invalidate them.
        let watch: Arc<dyn CodeWatch> = self.cache.clone();
        cpu.tlb_mut().set_code_watch(watch);

        S::exec_enter(cpu);
        let mut sc = match &self.config.icount {
            Some(icount) => SyncClocks::init(
                icount,
                self.clock_origin_ns + icount.to_ns(cpu.icount.retired()),
                self.clock.now_ns(),
                cpu.icount.remaining(),
            ),
            None => SyncClocks::default(),
        };

        let result = loop {
            match self.handle_exception(cpu) {
                Ok(Some(reason)) => break Ok(reason),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            match self.run_fragments(cpu, &mut sc) {
                Ok(never) => match never {},
                // Everything below is reloaded from the CPU on the next pass.
                Err(LoopExit) => cpu.can_do_io = true,
            }
        };

        S::exec_exit(cpu);
        tracing::trace!(cpu = cpu.index(), ?result, "left dispatch loop");
        result
    }

    fn handle_halt(cpu: &mut VirtualCpu<S>) -> bool {
        if !cpu.is_halted() {
            return false;
        }
        if !S::has_work(cpu) {
            return true;
        }
        cpu.set_halted(false);
        false
    }

    /// Deal with the pending exception. Returns the exit reason if the loop should end.
    fn handle_exception(&self, cpu: &mut VirtualCpu<S>) -> Result<Option<ExitReason>, ExecError> {
        let Some(exception) = cpu.exception.take() else {
            return Ok(None);
        };
        if let Some(reason) = exception.exit_reason() {
            if exception == CpuException::Debug {
                S::handle_debug_trap(cpu);
            }
            return Ok(Some(reason));
        }
        match self.config.mode {
            ExecMode::User => Ok(Some(ExitReason::Exception(exception))),
            ExecMode::System => {
                tracing::trace!(cpu = cpu.index(), ?exception, "delivering exception");
                S::deliver_exception(cpu, exception)
                    .map_err(|source| ExecError::Delivery { exception, source })?;
                cpu.stats.exceptions_delivered += 1;
                Ok(None)
            }
        }
    }

    /// The per-fragment loop. Only ever left by unwinding.
    fn run_fragments(
        &self,
        cpu: &mut VirtualCpu<S>,
        sc: &mut SyncClocks,
    ) -> Result<Infallible, LoopExit> {
        let mut last: Option<ChainPoint<S>> = None;
        loop {
            self.handle_interrupt(cpu, &mut last)?;
            let fragment = self.cache.find_fast(cpu, last.take())?;
            if cpu.signals().exit_requested() {
                continue;
            }
            let FragmentExit { last: exited, exit } =
                execute_fragments(cpu, fragment, self.config.chaining)?;
            last = match exit {
                TbExit::Chain(slot) if self.config.chaining => Some(ChainPoint::new(exited, slot)),
                TbExit::Chain(_) | TbExit::NoChain => None,
                TbExit::Requested => {
                    // Pairs with the release stores that raised the request.
                    fence(Ordering::Acquire);
                    None
                }
                TbExit::IcountExpired => {
                    self.icount_expired(cpu, &exited, sc)?;
                    None
                }
            };
            self.align_clocks(cpu, sc);
        }
    }

    fn handle_interrupt(
        &self,
        cpu: &mut VirtualCpu<S>,
        last: &mut Option<ChainPoint<S>>,
    ) -> Result<(), LoopExit> {
        let mut pending = cpu.interrupt_request();
        if !pending.is_empty() {
            if cpu.singlestep.contains(SingleStep::NOIRQ) {
                pending.remove(InterruptRequest::SSTEP_MASK);
            }
            if pending.contains(InterruptRequest::DEBUG) {
                cpu.clear_interrupt(InterruptRequest::DEBUG);
                return Err(cpu.raise(CpuException::Debug));
            }
            if pending.contains(InterruptRequest::HALT) {
                cpu.clear_interrupt(InterruptRequest::HALT);
                cpu.set_halted(true);
                return Err(cpu.raise(CpuException::Halt));
            }
            if pending.contains(InterruptRequest::RESET) {
                tracing::debug!(cpu = cpu.index(), "cpu reset");
                cpu.clear_interrupt(InterruptRequest::RESET);
                S::reset(cpu);
                return Err(LoopExit);
            }
            if S::deliver_interrupt(cpu, pending) {
                cpu.stats.interrupts_delivered += 1;
                *last = None;
            }
            // Delivery may have changed the request mask.
            if cpu
                .interrupt_request()
                .contains(InterruptRequest::EXITTB)
            {
                cpu.clear_interrupt(InterruptRequest::EXITTB);
                *last = None;
            }
        }
        if cpu.signals().take_exit_request() {
            return Err(cpu.raise(CpuException::Interrupt));
        }
        Ok(())
    }

    /// The decrementer cannot cover the next fragment.
    ///
    /// Refills it from the bank if possible. Otherwise runs exactly the instructions left through
    /// a one-off fragment and ends the time slice.
    fn icount_expired(
        &self,
        cpu: &mut VirtualCpu<S>,
        fragment: &CodeFragment<S>,
        sc: &mut SyncClocks,
    ) -> Result<(), LoopExit> {
        if cpu.icount.refill() {
            return Ok(());
        }
        let left = cpu.icount.decr();
        if left > 0 {
            self.cache
                .run_uncached(cpu, fragment.key(), u32::from(left))?;
            self.align_clocks(cpu, sc);
        }
        Err(cpu.raise(CpuException::Interrupt))
    }

    fn align_clocks(&self, cpu: &VirtualCpu<S>, sc: &mut SyncClocks) {
        if let Some(icount) = &self.config.icount {
            sc.align(icount, cpu.icount.remaining(), &*self.clock);
        }
    }
}

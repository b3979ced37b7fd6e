use std::sync::Arc;

use crate::arch::GuestArch;
use crate::jit::fragment::{CodeExit, CodeFragment, CompileFlags};
use crate::state::VirtualCpu;
use crate::LoopExit;

/// How a run of chained fragments ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbExit {
    /// Left through a direct-jump slot with nothing linked to it yet.
    Chain(usize),
    /// Left through a computed jump; the next fragment cannot be chained.
    NoChain,
    /// Stopped at a fragment's entry because something asked the CPU to leave its chain.
    Requested,
    /// Stopped at a fragment's entry because the instruction budget could not cover it.
    IcountExpired,
}

impl TbExit {
    /// The fragment reported alongside this exit never started.
    pub fn abandoned(self) -> bool {
        matches!(self, TbExit::Requested | TbExit::IcountExpired)
    }
}

/// Result of [`execute_fragments`].
pub struct FragmentExit<S> {
    /// The last fragment entered (or, for an abandoned entry, the one that was not started).
    pub last: Arc<CodeFragment<S>>,
    pub exit: TbExit,
}

/// Run `entry` and, when `follow_chains` is set, every fragment linked from it.
///
/// Exit requests and the instruction budget are checked at every fragment entry. An abandoned
/// fragment has the program counter rewound to its start before returning.
pub fn execute_fragments<S: GuestArch>(
    cpu: &mut VirtualCpu<S>,
    entry: Arc<CodeFragment<S>>,
    follow_chains: bool,
) -> Result<FragmentExit<S>, LoopExit> {
    let mut current = entry;
    loop {
        if cpu.signals().fragment_exit_requested() {
            cpu.signals().clear_fragment_exit_request();
            return Ok(abandon(cpu, current, TbExit::Requested));
        }
        let charged = current.cflags().contains(CompileFlags::IGNORE_ICOUNT)
            || cpu.icount.try_enter(current.icount());
        if !charged {
            return Ok(abandon(cpu, current, TbExit::IcountExpired));
        }

        tracing::trace!(
            id = current.id(),
            pc = current.pc(),
            flags = current.key().flags,
            "executing fragment"
        );
        cpu.stats.fragments_executed += 1;
        cpu.can_do_io = !cpu.icount.enabled();
        let exit = current.code().execute(cpu);
        cpu.can_do_io = true;

        match exit? {
            CodeExit::Indirect => {
                return Ok(FragmentExit {
                    last: current,
                    exit: TbExit::NoChain,
                })
            }
            CodeExit::Goto(slot) => match follow_chains.then(|| current.chained(slot)).flatten() {
                Some(next) => current = next,
                None => {
                    return Ok(FragmentExit {
                        last: current,
                        exit: TbExit::Chain(slot),
                    })
                }
            },
        }
    }
}

fn abandon<S: GuestArch>(
    cpu: &mut VirtualCpu<S>,
    fragment: Arc<CodeFragment<S>>,
    exit: TbExit,
) -> FragmentExit<S> {
    tracing::debug!(
        id = fragment.id(),
        pc = fragment.pc(),
        ?exit,
        "stopped execution of fragment chain"
    );
    S::resynchronize_pc(cpu, &fragment);
    FragmentExit {
        last: fragment,
        exit,
    }
}

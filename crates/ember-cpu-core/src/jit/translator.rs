use ember_mmu::GuestFault;
use thiserror::Error;

use super::fragment::{CodeFragment, CompileFlags, FragmentCode, FragmentKey};
use crate::state::VirtualCpu;

/// What the cache asks a [`Translator`] to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateRequest {
    pub key: FragmentKey,
    /// Guest physical address of the first instruction.
    pub phys_pc: u64,
    /// Upper bound on the instructions the fragment may contain.
    pub max_insns: u32,
    pub cflags: CompileFlags,
}

pub struct Translation<S> {
    pub code: FragmentCode<S>,
    /// Bytes of guest code covered, starting at the request's `pc`.
    pub size: u32,
    /// Guest instructions in the fragment.
    pub icount: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// Instruction fetch faulted on the first instruction.
    #[error(transparent)]
    Fault(#[from] GuestFault),
    /// The code buffer has no room left; the cache is flushed and the request retried.
    #[error("translation buffer full")]
    BufferFull,
}

/// Turns guest code into executable fragments.
///
/// Called with the cache lock held, so implementations must not call back into the
/// [`super::cache::FragmentCache`].
pub trait Translator<S>: Send {
    fn translate(
        &mut self,
        cpu: &mut VirtualCpu<S>,
        request: &TranslateRequest,
    ) -> Result<Translation<S>, TranslateError>;

    /// The fragment was invalidated or flushed; any backing storage can be reclaimed.
    fn on_invalidate(&mut self, _fragment: &CodeFragment<S>) {}

    /// Every fragment was discarded.
    fn on_flush(&mut self) {}
}

impl<S, T: Translator<S> + ?Sized> Translator<S> for Box<T> {
    #[inline]
    fn translate(
        &mut self,
        cpu: &mut VirtualCpu<S>,
        request: &TranslateRequest,
    ) -> Result<Translation<S>, TranslateError> {
        <T as Translator<S>>::translate(&mut **self, cpu, request)
    }

    #[inline]
    fn on_invalidate(&mut self, fragment: &CodeFragment<S>) {
        <T as Translator<S>>::on_invalidate(&mut **self, fragment)
    }

    #[inline]
    fn on_flush(&mut self) {
        <T as Translator<S>>::on_flush(&mut **self)
    }
}

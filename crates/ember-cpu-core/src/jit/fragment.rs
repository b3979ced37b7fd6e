use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ember_mmu::{PAGE_MASK, PAGE_SIZE};
use parking_lot::Mutex;

use crate::state::VirtualCpu;
use crate::LoopExit;

/// Largest instruction count a single fragment may be translated with.
pub const CF_COUNT_MASK: u32 = 0xffff;

/// Number of direct-jump exits a fragment can chain.
pub const CHAIN_SLOTS: usize = 2;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompileFlags: u32 {
        /// One-off fragment: never inserted into the caches, discarded after one execution.
        const NOCACHE = 1 << 16;
        /// Do not emit the instruction-count check at fragment entry.
        const IGNORE_ICOUNT = 1 << 17;
    }
}

/// Everything that determines how a run of guest code is translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub pc: u64,
    /// Code segment base, for architectures that have one.
    pub cs_base: u64,
    /// Architecture mode bits affecting translation (privilege level, operand size, ...).
    pub flags: u32,
}

impl FragmentKey {
    pub const fn new(pc: u64, cs_base: u64, flags: u32) -> Self {
        Self { pc, cs_base, flags }
    }
}

/// How a fragment's code left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeExit {
    /// Direct jump through chain slot `n`; the next fragment can be linked to it.
    Goto(usize),
    /// Computed jump or anything else that must go back through a lookup.
    Indirect,
}

pub type NativeEntry<S> = fn(&mut VirtualCpu<S>) -> Result<CodeExit, LoopExit>;

/// Fragment body for targets without native code generation.
pub trait InterpretedCode<S>: Send + Sync {
    fn interpret(&self, cpu: &mut VirtualCpu<S>) -> Result<CodeExit, LoopExit>;
}

pub enum FragmentCode<S> {
    Native(NativeEntry<S>),
    Interpreted(Box<dyn InterpretedCode<S>>),
}

impl<S> FragmentCode<S> {
    #[inline]
    pub fn execute(&self, cpu: &mut VirtualCpu<S>) -> Result<CodeExit, LoopExit> {
        match self {
            FragmentCode::Native(entry) => entry(cpu),
            FragmentCode::Interpreted(code) => code.interpret(cpu),
        }
    }
}

impl<S> std::fmt::Debug for FragmentCode<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FragmentCode::Native(_) => f.write_str("Native"),
            FragmentCode::Interpreted(_) => f.write_str("Interpreted"),
        }
    }
}

struct JumpLinks<S> {
    outgoing: [Option<Weak<CodeFragment<S>>>; CHAIN_SLOTS],
    /// Fragments whose chain slot points here.
    incoming: Vec<(Weak<CodeFragment<S>>, usize)>,
}

impl<S> Default for JumpLinks<S> {
    fn default() -> Self {
        Self {
            outgoing: [None, None],
            incoming: Vec::new(),
        }
    }
}

/// A translated run of guest instructions.
///
/// Owned by the [`super::cache::FragmentCache`]; CPUs only hold clones of the `Arc` in their jump
/// caches and while executing. Once invalidated a fragment is never returned by a lookup or
/// followed through a chain again.
pub struct CodeFragment<S> {
    id: u64,
    key: FragmentKey,
    phys_pc: u64,
    /// Physical pages the guest code spans; the second one only if it crosses a page.
    page_addr: [Option<u64>; 2],
    size: u32,
    icount: u16,
    cflags: CompileFlags,
    code: FragmentCode<S>,
    links: Mutex<JumpLinks<S>>,
    invalid: AtomicBool,
}

impl<S> CodeFragment<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        key: FragmentKey,
        phys_pc: u64,
        second_page: Option<u64>,
        size: u32,
        icount: u16,
        cflags: CompileFlags,
        code: FragmentCode<S>,
    ) -> Self {
        Self {
            id,
            key,
            phys_pc,
            page_addr: [Some(phys_pc & PAGE_MASK), second_page],
            size,
            icount,
            cflags,
            code,
            links: Mutex::new(JumpLinks::default()),
            invalid: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn key(&self) -> FragmentKey {
        self.key
    }

    #[inline]
    pub fn pc(&self) -> u64 {
        self.key.pc
    }

    #[inline]
    pub fn phys_pc(&self) -> u64 {
        self.phys_pc
    }

    #[inline]
    pub fn first_page(&self) -> u64 {
        self.phys_pc & PAGE_MASK
    }

    #[inline]
    pub fn second_page(&self) -> Option<u64> {
        self.page_addr[1]
    }

    /// Physical pages spanned by the fragment.
    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.page_addr.iter().flatten().copied()
    }

    /// Guest code size in bytes.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn icount(&self) -> u16 {
        self.icount
    }

    #[inline]
    pub fn cflags(&self) -> CompileFlags {
        self.cflags
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        !self.cflags.contains(CompileFlags::NOCACHE)
    }

    #[inline]
    pub fn code(&self) -> &FragmentCode<S> {
        &self.code
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark invalid. Returns `false` if the fragment already was.
    pub(crate) fn invalidate(&self) -> bool {
        !self.invalid.swap(true, Ordering::AcqRel)
    }

    /// The still-valid fragment linked to chain slot `slot`, if any.
    pub fn chained(&self, slot: usize) -> Option<Arc<CodeFragment<S>>> {
        let links = self.links.lock();
        links
            .outgoing
            .get(slot)?
            .as_ref()?
            .upgrade()
            .filter(|next| !next.is_invalid())
    }

    /// Virtual page the fragment's last byte lies on, if different from the first.
    pub(crate) fn spill_page(pc: u64, size: u32) -> Option<u64> {
        let last_byte = pc.wrapping_add(u64::from(size.max(1)) - 1);
        let first = pc & PAGE_MASK;
        let last = last_byte & PAGE_MASK;
        (last != first).then(|| first.wrapping_add(PAGE_SIZE))
    }

    /// Link chain slot `slot` of `from` to `to`.
    ///
    /// Does nothing if the slot is already linked or either fragment is invalid or one-off.
    pub(crate) fn link(from: &Arc<Self>, slot: usize, to: &Arc<Self>) -> bool {
        if slot >= CHAIN_SLOTS
            || from.is_invalid()
            || to.is_invalid()
            || !from.is_cached()
            || !to.is_cached()
        {
            return false;
        }
        {
            let mut links = from.links.lock();
            if links.outgoing[slot].is_some() {
                return false;
            }
            links.outgoing[slot] = Some(Arc::downgrade(to));
        }
        to.links.lock().incoming.push((Arc::downgrade(from), slot));
        true
    }

    /// Remove every chain link into and out of this fragment.
    pub(crate) fn unlink_all(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        let this = self as *const Self;

        for (slot, dest) in links.outgoing.iter().enumerate() {
            if let Some(dest) = dest.as_ref().and_then(Weak::upgrade) {
                dest.links
                    .lock()
                    .incoming
                    .retain(|(src, s)| !(src.as_ptr() == this && *s == slot));
            }
        }
        for (src, slot) in links.incoming {
            if let Some(src) = src.upgrade() {
                let mut src_links = src.links.lock();
                let points_here = src_links.outgoing[slot]
                    .as_ref()
                    .is_some_and(|dest| dest.as_ptr() == this);
                if points_here {
                    src_links.outgoing[slot] = None;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn incoming_links(&self) -> usize {
        self.links.lock().incoming.len()
    }
}

impl<S> std::fmt::Debug for CodeFragment<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeFragment")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("phys_pc", &format_args!("{:#x}", self.phys_pc))
            .field("second_page", &self.page_addr[1])
            .field("size", &self.size)
            .field("icount", &self.icount)
            .field("cflags", &self.cflags)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

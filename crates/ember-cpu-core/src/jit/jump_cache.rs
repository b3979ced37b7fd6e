use std::sync::Arc;

use ember_mmu::{PAGE_BITS, PAGE_SIZE};

use super::fragment::{CodeFragment, FragmentKey};

pub const JMP_CACHE_BITS: u32 = 12;
pub const JMP_CACHE_SIZE: usize = 1 << JMP_CACHE_BITS;

// The upper half of a slot index is derived from the virtual page only, so all slots that can
// hold fragments of one page form a contiguous run and can be cleared together.
const JMP_PAGE_BITS: u32 = JMP_CACHE_BITS / 2;
const JMP_PAGE_SIZE: usize = 1 << JMP_PAGE_BITS;
const JMP_ADDR_MASK: u64 = (JMP_PAGE_SIZE - 1) as u64;
const JMP_PAGE_MASK: u64 = (JMP_CACHE_SIZE - JMP_PAGE_SIZE) as u64;

#[inline]
fn hash_page(pc: u64) -> usize {
    let tmp = pc ^ (pc >> (PAGE_BITS - JMP_PAGE_BITS));
    ((tmp >> (PAGE_BITS - JMP_PAGE_BITS)) & JMP_PAGE_MASK) as usize
}

#[inline]
fn hash(pc: u64) -> usize {
    let tmp = pc ^ (pc >> (PAGE_BITS - JMP_PAGE_BITS));
    (((tmp >> (PAGE_BITS - JMP_PAGE_BITS)) & JMP_PAGE_MASK) | (tmp & JMP_ADDR_MASK)) as usize
}

/// Per-CPU direct-mapped cache from guest virtual PC to the last fragment that ran there.
///
/// Entries are validated against the full [`FragmentKey`] and the fragment's invalid flag on
/// every lookup, so a stale slot can only cost a slow lookup, never a wrong fragment.
pub struct JumpCache<S> {
    slots: Box<[Option<Arc<CodeFragment<S>>>]>,
}

impl<S> JumpCache<S> {
    pub fn new() -> Self {
        Self {
            slots: (0..JMP_CACHE_SIZE).map(|_| None).collect(),
        }
    }

    #[inline]
    pub fn lookup(&self, key: &FragmentKey) -> Option<Arc<CodeFragment<S>>> {
        match &self.slots[hash(key.pc)] {
            Some(fragment) if fragment.key() == *key && !fragment.is_invalid() => {
                Some(Arc::clone(fragment))
            }
            _ => None,
        }
    }

    #[inline]
    pub fn insert(&mut self, fragment: Arc<CodeFragment<S>>) {
        let slot = hash(fragment.pc());
        self.slots[slot] = Some(fragment);
    }

    /// Raw contents of the slot `pc` hashes to, if it currently holds a fragment for `pc`.
    pub fn get(&self, pc: u64) -> Option<&Arc<CodeFragment<S>>> {
        self.slots[hash(pc)]
            .as_ref()
            .filter(|fragment| fragment.pc() == pc)
    }

    pub fn clear(&mut self) {
        self.slots.fill(None);
    }

    /// Forget fragments that may start on the page of `vaddr` or on the page before it (whose
    /// fragments can spill into this one).
    pub fn clear_page(&mut self, vaddr: u64) {
        for page in [vaddr.wrapping_sub(PAGE_SIZE), vaddr] {
            let start = hash_page(page);
            self.slots[start..start + JMP_PAGE_SIZE].fill(None);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Default for JumpCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::fragment::{CodeExit, CompileFlags, FragmentCode};

    fn fragment(id: u64, pc: u64, flags: u32) -> Arc<CodeFragment<()>> {
        Arc::new(CodeFragment::new(
            id,
            FragmentKey::new(pc, 0, flags),
            pc,
            None,
            4,
            1,
            CompileFlags::empty(),
            FragmentCode::Native(|_| Ok(CodeExit::Indirect)),
        ))
    }

    #[test]
    fn hash_keeps_a_page_inside_its_run() {
        for pc in [0x1000u64, 0x1004, 0x1ffc, 0x7fff_f123] {
            let page_start = hash_page(pc & !(PAGE_SIZE - 1));
            let slot = hash(pc);
            assert!((page_start..page_start + JMP_PAGE_SIZE).contains(&slot));
        }
    }

    #[test]
    fn lookup_validates_the_whole_key() {
        let mut cache = JumpCache::new();
        cache.insert(fragment(1, 0x1000, 0));

        assert!(cache.lookup(&FragmentKey::new(0x1000, 0, 0)).is_some());
        assert!(cache.lookup(&FragmentKey::new(0x1000, 0, 1)).is_none());
        assert!(cache.lookup(&FragmentKey::new(0x1000, 0x10, 0)).is_none());
    }

    #[test]
    fn invalidated_fragments_are_not_returned() {
        let mut cache = JumpCache::new();
        let frag = fragment(1, 0x1000, 0);
        cache.insert(Arc::clone(&frag));
        assert!(frag.invalidate());
        assert!(cache.lookup(&frag.key()).is_none());
    }

    #[test]
    fn clear_page_drops_this_and_the_previous_page() {
        let mut cache = JumpCache::new();
        cache.insert(fragment(1, 0x1ff0, 0));
        cache.insert(fragment(2, 0x2010, 0));
        cache.insert(fragment(3, 0x5000, 0));

        cache.clear_page(0x2000);
        assert!(cache.get(0x1ff0).is_none());
        assert!(cache.get(0x2010).is_none());
        assert!(cache.get(0x5000).is_some());
        assert_eq!(cache.len(), 1);
    }
}

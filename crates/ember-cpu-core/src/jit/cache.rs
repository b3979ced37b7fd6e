use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_mmu::{CodeWatch, PAGE_MASK, PAGE_SIZE};
use parking_lot::{Mutex, MutexGuard, RwLock};

use super::fragment::{CodeFragment, CompileFlags, FragmentKey, CF_COUNT_MASK};
use super::translator::{TranslateError, TranslateRequest, Translation, Translator};
use crate::arch::GuestArch;
use crate::exec::{execute_fragments, FragmentExit};
use crate::state::VirtualCpu;
use crate::LoopExit;

pub const PHYS_HASH_BITS: u32 = 15;
pub const PHYS_HASH_SIZE: usize = 1 << PHYS_HASH_BITS;

#[inline]
fn phys_hash(phys_pc: u64) -> usize {
    (phys_pc >> 2) as usize & (PHYS_HASH_SIZE - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cached fragments kept before the whole cache is flushed.
    pub max_fragments: usize,
    /// Instruction cap passed to the translator for cached fragments.
    pub max_fragment_insns: u16,
    /// Take the address-space lock around translation. The cache lock is dropped before it is
    /// acquired, and the index is re-checked afterwards.
    pub use_mmap_lock: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_fragments: 1 << 16,
            max_fragment_insns: 512,
            use_mmap_lock: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub translations: u64,
    pub physical_hits: u64,
    pub invalidations: u64,
    pub flushes: u64,
    pub chains: u64,
    pub uncached: u64,
}

/// An exit of a previously executed fragment that may be wired to the next one.
pub struct ChainPoint<S> {
    pub from: Arc<CodeFragment<S>>,
    pub slot: usize,
}

impl<S> ChainPoint<S> {
    pub fn new(from: Arc<CodeFragment<S>>, slot: usize) -> Self {
        Self { from, slot }
    }
}

struct CacheInner<S> {
    /// Physical index; the most recently hit fragment sits at the front of its bucket.
    buckets: Box<[Vec<Arc<CodeFragment<S>>>]>,
    /// Physical page -> fragments with code on that page.
    pages: HashMap<u64, Vec<Arc<CodeFragment<S>>>>,
    translator: Box<dyn Translator<S>>,
    len: usize,
    next_id: u64,
    stats: CacheStats,
}

/// Translated code shared by every CPU of a machine.
///
/// All index mutation, chaining and the translator itself run under one lock. Executing an
/// already-resolved fragment does not touch it.
pub struct FragmentCache<S> {
    inner: Mutex<CacheInner<S>>,
    mmap_lock: Option<Mutex<()>>,
    /// Bumped on every flush; CPUs compare it with the value they last saw.
    generation: AtomicU64,
    /// Keys of `CacheInner::pages`, readable without the cache lock so TLB refills made by
    /// the translator can consult it. Always taken after `inner`.
    code_pages: RwLock<HashSet<u64>>,
    /// Bumped whenever a page joins `code_pages`.
    code_generation: AtomicU64,
    config: CacheConfig,
}

impl<S: GuestArch> FragmentCache<S> {
    pub fn new(translator: Box<dyn Translator<S>>, config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                buckets: (0..PHYS_HASH_SIZE).map(|_| Vec::new()).collect(),
                pages: HashMap::new(),
                translator,
                len: 0,
                next_id: 0,
                stats: CacheStats::default(),
            }),
            mmap_lock: config.use_mmap_lock.then(|| Mutex::new(())),
            generation: AtomicU64::new(0),
            code_pages: RwLock::new(HashSet::new()),
            code_generation: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of cached fragments.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The address-space lock, for embedders changing guest mappings while CPUs translate.
    ///
    /// Never call this while holding a fragment returned by a lookup that is still being
    /// resolved; the lock is always taken before the cache lock.
    pub fn lock_address_space(&self) -> Option<MutexGuard<'_, ()>> {
        self.mmap_lock.as_ref().map(|lock| lock.lock())
    }

    fn cflags_for(cpu: &VirtualCpu<S>) -> CompileFlags {
        if cpu.icount.enabled() {
            CompileFlags::empty()
        } else {
            CompileFlags::IGNORE_ICOUNT
        }
    }

    /// Resolve the fragment for the CPU's current state, chaining `last` to it when possible.
    pub fn find_fast(
        &self,
        cpu: &mut VirtualCpu<S>,
        last: Option<ChainPoint<S>>,
    ) -> Result<Arc<CodeFragment<S>>, LoopExit> {
        let key = cpu.arch.fragment_key();
        let cflags = Self::cflags_for(cpu);
        let mut inner = self.inner.lock();

        let fragment = match cpu.jmp_cache.lookup(&key) {
            Some(fragment) if fragment.cflags() == cflags => {
                cpu.stats.jump_cache_hits += 1;
                fragment
            }
            _ => self.find_slow_locked(&mut inner, cpu, key, cflags)?,
        };

        let mut last = last;
        let generation = self.generation.load(Ordering::Acquire);
        if cpu.cache_generation != generation {
            cpu.jmp_cache.clear();
            cpu.cache_generation = generation;
            last = None;
        }
        cpu.jmp_cache.insert(Arc::clone(&fragment));

        if let Some(ChainPoint { from, slot }) = last {
            if CodeFragment::link(&from, slot, &fragment) {
                inner.stats.chains += 1;
                tracing::trace!(
                    from = from.id(),
                    slot,
                    to = fragment.id(),
                    "linked fragments"
                );
            }
        }
        Ok(fragment)
    }

    /// Look `key` up in the physical index, translating it on a miss.
    pub fn find_slow(
        &self,
        cpu: &mut VirtualCpu<S>,
        key: FragmentKey,
    ) -> Result<Arc<CodeFragment<S>>, LoopExit> {
        let cflags = Self::cflags_for(cpu);
        let mut inner = self.inner.lock();
        self.find_slow_locked(&mut inner, cpu, key, cflags)
    }

    fn find_slow_locked(
        &self,
        inner: &mut MutexGuard<'_, CacheInner<S>>,
        cpu: &mut VirtualCpu<S>,
        key: FragmentKey,
        cflags: CompileFlags,
    ) -> Result<Arc<CodeFragment<S>>, LoopExit> {
        cpu.stats.slow_lookups += 1;
        let phys_pc = cpu
            .translate_code(key.pc)
            .map_err(|fault| cpu.raise_fault(fault))?;

        if let Some(fragment) = Self::find_physical(inner, cpu, key, phys_pc, cflags) {
            inner.stats.physical_hits += 1;
            return Ok(fragment);
        }

        let _mmap = match &self.mmap_lock {
            Some(lock) => {
                let guard = MutexGuard::unlocked(inner, || lock.lock());
                // Another CPU may have translated the same code meanwhile.
                if let Some(fragment) = Self::find_physical(inner, cpu, key, phys_pc, cflags) {
                    inner.stats.physical_hits += 1;
                    return Ok(fragment);
                }
                Some(guard)
            }
            None => None,
        };

        let max_insns = u32::from(self.config.max_fragment_insns);
        self.generate(inner, cpu, key, phys_pc, max_insns, cflags)
    }

    fn find_physical(
        inner: &mut CacheInner<S>,
        cpu: &mut VirtualCpu<S>,
        key: FragmentKey,
        phys_pc: u64,
        cflags: CompileFlags,
    ) -> Option<Arc<CodeFragment<S>>> {
        let bucket = &mut inner.buckets[phys_hash(phys_pc)];
        let next_page = (key.pc & PAGE_MASK).wrapping_add(PAGE_SIZE);
        // Resolved at most once, and only for a candidate that spans two pages.
        let mut current_second: Option<Option<u64>> = None;

        let pos = bucket.iter().position(|fragment| {
            if fragment.key() != key || fragment.phys_pc() != phys_pc || fragment.cflags() != cflags
            {
                return false;
            }
            match fragment.second_page() {
                None => true,
                Some(page) => {
                    let current = *current_second.get_or_insert_with(|| {
                        cpu.translate_code(next_page).ok().map(|p| p & PAGE_MASK)
                    });
                    current == Some(page)
                }
            }
        })?;
        bucket[..=pos].rotate_right(1);
        Some(Arc::clone(&bucket[0]))
    }

    fn translate(
        &self,
        inner: &mut CacheInner<S>,
        cpu: &mut VirtualCpu<S>,
        request: &TranslateRequest,
    ) -> Result<Translation<S>, LoopExit> {
        let result = match inner.translator.translate(cpu, request) {
            Err(TranslateError::BufferFull) => {
                tracing::warn!(
                    pc = request.key.pc,
                    fragments = inner.len,
                    "translation buffer full, flushing fragment cache"
                );
                self.flush_locked(inner);
                inner.translator.translate(cpu, request)
            }
            result => result,
        };
        match result {
            Ok(translation) => Ok(translation),
            Err(TranslateError::Fault(fault)) => Err(cpu.raise_fault(fault)),
            Err(TranslateError::BufferFull) => {
                panic!(
                    "translator out of space for pc {:#x} after flushing the fragment cache",
                    request.key.pc
                )
            }
        }
    }

    fn generate(
        &self,
        inner: &mut CacheInner<S>,
        cpu: &mut VirtualCpu<S>,
        key: FragmentKey,
        phys_pc: u64,
        max_insns: u32,
        cflags: CompileFlags,
    ) -> Result<Arc<CodeFragment<S>>, LoopExit> {
        let cached = !cflags.contains(CompileFlags::NOCACHE);
        if cached && inner.len >= self.config.max_fragments {
            tracing::debug!(fragments = inner.len, "fragment cache full");
            self.flush_locked(inner);
        }

        let request = TranslateRequest {
            key,
            phys_pc,
            max_insns,
            cflags,
        };
        let translation = self.translate(inner, cpu, &request)?;

        let second_page = match CodeFragment::<S>::spill_page(key.pc, translation.size) {
            Some(vpage) => Some(
                cpu.translate_code(vpage)
                    .map_err(|fault| cpu.raise_fault(fault))?
                    & PAGE_MASK,
            ),
            None => None,
        };

        let id = inner.next_id;
        inner.next_id += 1;
        inner.stats.translations += 1;
        let fragment = Arc::new(CodeFragment::new(
            id,
            key,
            phys_pc,
            second_page,
            translation.size,
            translation.icount,
            cflags,
            translation.code,
        ));
        tracing::trace!(
            id,
            pc = key.pc,
            phys_pc,
            size = translation.size,
            icount = translation.icount,
            ?cflags,
            "translated fragment"
        );

        if cached {
            inner.buckets[phys_hash(phys_pc)].insert(0, Arc::clone(&fragment));
            let mut new_code_pages = false;
            for page in fragment.pages() {
                inner
                    .pages
                    .entry(page)
                    .or_default()
                    .push(Arc::clone(&fragment));
                new_code_pages |= self.code_pages.write().insert(page);
            }
            if new_code_pages {
                self.code_generation.fetch_add(1, Ordering::AcqRel);
            }
            inner.len += 1;
        }
        Ok(fragment)
    }

    /// Drop every fragment with code in the guest physical range `[start, start + len)`.
    ///
    /// Works at page granularity: any fragment touching one of the range's pages goes. Returns
    /// the number of fragments removed.
    pub fn invalidate(&self, start: u64, len: u64) -> usize {
        if len == 0 {
            return 0;
        }
        let mut inner = self.inner.lock();
        let first = start & PAGE_MASK;
        let last = start.saturating_add(len - 1) & PAGE_MASK;
        let span = (last - first) / PAGE_SIZE + 1;

        let mut victims = Vec::new();
        if span > inner.pages.len() as u64 {
            for (page, fragments) in &inner.pages {
                if (first..=last).contains(page) {
                    victims.extend(fragments.iter().cloned());
                }
            }
        } else {
            let mut page = first;
            loop {
                if let Some(fragments) = inner.pages.get(&page) {
                    victims.extend(fragments.iter().cloned());
                }
                if page == last {
                    break;
                }
                page += PAGE_SIZE;
            }
        }

        let removed = victims
            .iter()
            .filter(|fragment| self.remove_locked(&mut inner, fragment))
            .count();
        if removed > 0 {
            tracing::debug!(start, len, removed, "invalidated fragments");
        }
        removed
    }

    fn remove_locked(&self, inner: &mut CacheInner<S>, fragment: &Arc<CodeFragment<S>>) -> bool {
        if !fragment.invalidate() {
            return false;
        }
        inner.buckets[phys_hash(fragment.phys_pc())].retain(|f| !Arc::ptr_eq(f, fragment));
        for page in fragment.pages() {
            if let Some(list) = inner.pages.get_mut(&page) {
                list.retain(|f| !Arc::ptr_eq(f, fragment));
                if list.is_empty() {
                    inner.pages.remove(&page);
                    self.code_pages.write().remove(&page);
                }
            }
        }
        fragment.unlink_all();
        inner.translator.on_invalidate(fragment);
        inner.len -= 1;
        inner.stats.invalidations += 1;
        true
    }

    /// Drop every fragment. CPUs clear their jump caches at their next lookup.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner);
    }

    fn flush_locked(&self, inner: &mut CacheInner<S>) {
        let dropped = inner.len;
        for bucket in inner.buckets.iter_mut() {
            for fragment in bucket.drain(..) {
                fragment.invalidate();
                fragment.unlink_all();
                inner.translator.on_invalidate(&fragment);
            }
        }
        inner.pages.clear();
        self.code_pages.write().clear();
        inner.len = 0;
        inner.translator.on_flush();
        inner.stats.flushes += 1;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(dropped, generation, "flushed fragment cache");
    }

    /// Translate and run a one-off fragment of at most `limit` instructions starting at `key`.
    ///
    /// The fragment is never inserted into an index or chained, and is discarded afterwards.
    ///
    /// # Panics
    ///
    /// If `limit` exceeds [`CF_COUNT_MASK`].
    pub fn run_uncached(
        &self,
        cpu: &mut VirtualCpu<S>,
        key: FragmentKey,
        limit: u32,
    ) -> Result<FragmentExit<S>, LoopExit> {
        assert!(
            limit <= CF_COUNT_MASK,
            "uncached instruction limit {limit} exceeds {CF_COUNT_MASK}"
        );
        let cflags = Self::cflags_for(cpu) | CompileFlags::NOCACHE;
        let fragment = {
            let mut inner = self.inner.lock();
            let phys_pc = cpu
                .translate_code(key.pc)
                .map_err(|fault| cpu.raise_fault(fault))?;
            inner.stats.uncached += 1;
            self.generate(&mut inner, cpu, key, phys_pc, limit, cflags)?
        };
        cpu.stats.uncached_executions += 1;
        tracing::debug!(pc = key.pc, limit, icount = fragment.icount(), "running uncached fragment");

        let result = execute_fragments(cpu, Arc::clone(&fragment), false);

        fragment.invalidate();
        self.inner.lock().translator.on_invalidate(&fragment);
        result
    }
}

/// Stores reported by a CPU's soft TLB invalidate the fragments on the written page.
impl<S: GuestArch> CodeWatch for FragmentCache<S> {
    fn is_code_page(&self, phys_page: u64) -> bool {
        self.code_pages.read().contains(&phys_page)
    }

    fn generation(&self) -> u64 {
        self.code_generation.load(Ordering::Acquire)
    }

    fn code_written(&self, paddr: u64, len: u64) {
        self.invalidate(paddr, len);
    }
}

//! Read-side epochs guarding shared memory-topology state.
//!
//! Dispatch loops hold a [`ReadGuard`] for the whole time they execute guest code. A writer that
//! changes structures those loops may be reading (device mappings, memory regions) publishes
//! the new state and then calls [`ReadEpoch::synchronize`], which returns only once every read
//! section that was already running has finished. Read sections never block each other.

use std::cell::Cell;
use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct EpochState {
    generation: u64,
    /// Active readers per generation they entered in.
    readers: BTreeMap<u64, usize>,
}

#[derive(Debug, Default)]
pub struct ReadEpoch {
    state: Mutex<EpochState>,
    readers_done: Condvar,
}

thread_local! {
    static READ_DEPTH: Cell<usize> = const { Cell::new(0) };
}

impl ReadEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        let generation = state.generation;
        *state.readers.entry(generation).or_insert(0) += 1;
        READ_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ReadGuard {
            epoch: self,
            generation,
        }
    }

    /// Wait until every read section that began before this call has ended.
    ///
    /// Must not be called from inside a read section on the same thread.
    pub fn synchronize(&self) {
        debug_assert_eq!(
            READ_DEPTH.with(Cell::get),
            0,
            "ReadEpoch::synchronize called inside a read section"
        );
        let mut state = self.state.lock();
        let target = state.generation;
        state.generation += 1;
        while state.readers.range(..=target).next().is_some() {
            self.readers_done.wait(&mut state);
        }
    }

    pub fn active_readers(&self) -> usize {
        self.state.lock().readers.values().sum()
    }
}

pub struct ReadGuard<'a> {
    epoch: &'a ReadEpoch,
    generation: u64,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        READ_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        let mut state = self.epoch.state.lock();
        if let Some(count) = state.readers.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&self.generation);
            }
        }
        drop(state);
        self.epoch.readers_done.notify_all();
    }
}

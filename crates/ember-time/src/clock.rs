use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic host time source used to pace guest execution.
pub trait HostClock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed origin.
    fn now_ns(&self) -> i64;

    /// Block the calling thread for `ns` nanoseconds.
    ///
    /// Returns the part of the request that was *not* slept. This is zero unless the sleep was
    /// cut short.
    fn sleep_ns(&self, ns: i64) -> i64;
}

static PROCESS_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Host monotonic time measured from one origin shared by every instance in the process, so
/// readings from different clocks can be compared and fed to the same [`DelayReporter`].
///
/// [`DelayReporter`]: crate::DelayReporter
#[derive(Debug, Clone)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: *PROCESS_ORIGIN.get_or_init(Instant::now),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    fn sleep_ns(&self, ns: i64) -> i64 {
        if ns <= 0 {
            return 0;
        }
        // `thread::sleep` restarts after signals, so the full request is always honoured.
        std::thread::sleep(Duration::from_nanos(ns as u64));
        0
    }
}

/// Deterministic clock for tests.
///
/// Time only moves when [`FakeHostClock::advance`] is called or when the code under test sleeps;
/// every sleep request is recorded.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: AtomicI64,
    interrupt_remaining_ns: AtomicI64,
    sleeps: Mutex<Vec<i64>>,
}

impl FakeHostClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now_ns: AtomicI64::new(start_ns),
            ..Self::default()
        }
    }

    pub fn advance(&self, ns: i64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_now(&self, ns: i64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    /// Make the next sleep return early with `remaining_ns` left unslept.
    pub fn interrupt_next_sleep(&self, remaining_ns: i64) {
        self.interrupt_remaining_ns
            .store(remaining_ns.max(0), Ordering::SeqCst);
    }

    /// Every sleep request seen so far, in order.
    pub fn sleeps(&self) -> Vec<i64> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept_ns(&self) -> i64 {
        self.sleeps.lock().iter().sum()
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn sleep_ns(&self, ns: i64) -> i64 {
        if ns <= 0 {
            return 0;
        }
        self.sleeps.lock().push(ns);
        let remaining = self
            .interrupt_remaining_ns
            .swap(0, Ordering::SeqCst)
            .min(ns);
        self.advance(ns - remaining);
        remaining
    }
}

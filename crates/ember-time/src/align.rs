use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{const_mutex, Mutex};

use crate::{HostClock, IcountConfig};

/// The guest may run this far ahead of real time before the vCPU thread is put to sleep.
pub const VM_CLOCK_ADVANCE_NS: i64 = 3_000_000;
/// Width, in seconds, of the hysteresis band used by [`DelayReporter`].
pub const THRESHOLD_REDUCE: f32 = 1.5;
/// Minimum real time between two "guest is late" diagnostics.
pub const MAX_DELAY_PRINT_RATE_NS: i64 = 2_000_000_000;
/// Upper bound on "guest is late" diagnostics per process.
pub const MAX_NB_PRINTS: u32 = 100;

/// Clock alignment state for one dispatch-loop invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncClocks {
    /// Virtual time minus real time, in ns. Positive when the guest is ahead.
    pub diff_clk: i64,
    /// Remaining instruction budget when drift was last accounted.
    pub last_cpu_icount: i64,
    /// Host clock reading taken at loop entry.
    pub realtime_clock: i64,
}

impl SyncClocks {
    /// Snapshot both clocks at dispatch-loop entry.
    ///
    /// `cpu_icount` is the CPU's remaining instruction budget. Updates the process-wide
    /// [`ALIGN_STATS`] and may emit a rate-limited diagnostic through [`GUEST_DELAY_REPORTER`].
    pub fn init(config: &IcountConfig, virtual_ns: i64, realtime_ns: i64, cpu_icount: i64) -> Self {
        Self::init_with(
            config,
            virtual_ns,
            realtime_ns,
            cpu_icount,
            &ALIGN_STATS,
            &GUEST_DELAY_REPORTER,
        )
    }

    pub fn init_with(
        config: &IcountConfig,
        virtual_ns: i64,
        realtime_ns: i64,
        cpu_icount: i64,
        stats: &AlignStats,
        reporter: &DelayReporter,
    ) -> Self {
        if !config.align {
            return Self::default();
        }
        let sc = Self {
            diff_clk: virtual_ns - realtime_ns,
            last_cpu_icount: cpu_icount,
            realtime_clock: realtime_ns,
        };
        stats.record(sc.diff_clk);
        reporter.report(&sc);
        sc
    }

    /// Account for the instructions retired since the last call and sleep if the guest is now
    /// more than [`VM_CLOCK_ADVANCE_NS`] ahead of real time.
    ///
    /// Returns the amount of time that was requested from the host clock (zero if no sleep).
    pub fn align(&mut self, config: &IcountConfig, cpu_icount: i64, clock: &dyn HostClock) -> i64 {
        if !config.align {
            return 0;
        }
        self.diff_clk += config.to_ns(self.last_cpu_icount - cpu_icount);
        self.last_cpu_icount = cpu_icount;

        if self.diff_clk <= VM_CLOCK_ADVANCE_NS {
            return 0;
        }
        let requested = self.diff_clk;
        let unslept = clock.sleep_ns(requested);
        self.diff_clk = unslept.max(0);
        requested
    }
}

/// Process-wide extremes of the drift observed at dispatch-loop entry.
#[derive(Debug)]
pub struct AlignStats {
    max_delay: AtomicI64,
    max_advance: AtomicI64,
}

impl AlignStats {
    pub const fn new() -> Self {
        Self {
            max_delay: AtomicI64::new(0),
            max_advance: AtomicI64::new(0),
        }
    }

    pub fn record(&self, diff_clk: i64) {
        self.max_delay.fetch_min(diff_clk, Ordering::Relaxed);
        self.max_advance.fetch_max(diff_clk, Ordering::Relaxed);
    }

    /// Largest lateness seen, as a non-positive drift in ns.
    pub fn max_delay(&self) -> i64 {
        self.max_delay.load(Ordering::Relaxed)
    }

    /// Largest lead seen, as a non-negative drift in ns.
    pub fn max_advance(&self) -> i64 {
        self.max_advance.load(Ordering::Relaxed)
    }
}

impl Default for AlignStats {
    fn default() -> Self {
        Self::new()
    }
}

pub static ALIGN_STATS: AlignStats = AlignStats::new();

#[derive(Debug)]
struct ReporterState {
    threshold_delay: f32,
    last_realtime_clock: i64,
    nb_prints: u32,
}

/// Rate-limited "guest is late" diagnostic.
///
/// A message is emitted at most once per [`MAX_DELAY_PRINT_RATE_NS`] of real time and at most
/// [`MAX_NB_PRINTS`] times in total, and only when the lateness leaves the band
/// `[threshold - THRESHOLD_REDUCE, threshold]` seconds. The threshold then moves to the next
/// whole second above the current lateness.
#[derive(Debug)]
pub struct DelayReporter {
    state: Mutex<ReporterState>,
}

impl DelayReporter {
    pub const fn new() -> Self {
        Self {
            state: const_mutex(ReporterState {
                threshold_delay: 0.0,
                last_realtime_clock: 0,
                nb_prints: 0,
            }),
        }
    }

    /// Returns `true` if a diagnostic was emitted.
    pub fn report(&self, sc: &SyncClocks) -> bool {
        let mut state = self.state.lock();
        if sc.realtime_clock - state.last_realtime_clock < MAX_DELAY_PRINT_RATE_NS
            || state.nb_prints >= MAX_NB_PRINTS
        {
            return false;
        }

        let late_s = -sc.diff_clk as f32 / 1_000_000_000.0;
        if late_s <= state.threshold_delay && late_s >= state.threshold_delay - THRESHOLD_REDUCE {
            return false;
        }

        state.threshold_delay = (-sc.diff_clk / 1_000_000_000) as f32 + 1.0;
        tracing::warn!(
            late_min_s = state.threshold_delay - 1.0,
            late_max_s = state.threshold_delay,
            "guest is running behind real time; consider a smaller icount shift"
        );
        state.nb_prints += 1;
        state.last_realtime_clock = sc.realtime_clock;
        true
    }

    pub fn prints(&self) -> u32 {
        self.state.lock().nb_prints
    }
}

impl Default for DelayReporter {
    fn default() -> Self {
        Self::new()
    }
}

pub static GUEST_DELAY_REPORTER: DelayReporter = DelayReporter::new();

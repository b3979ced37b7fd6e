//! Host time sources and icount-driven pacing of guest execution.
//!
//! When deterministic timing ("icount") is enabled, guest virtual time advances strictly with
//! retired guest instructions: every instruction is worth `1 << shift` nanoseconds. Left alone,
//! such a clock runs as fast as the host can translate and execute code. [`SyncClocks`] keeps
//! the two in step by sleeping the vCPU thread whenever the guest gets too far ahead of the
//! host's wall clock, and reports (rate limited) when it falls behind.
//!
//! Production code uses [`StdHostClock`]; unit tests drive everything deterministically through
//! [`FakeHostClock`].

mod align;
mod clock;
mod icount;

pub use align::{
    AlignStats, DelayReporter, SyncClocks, ALIGN_STATS, GUEST_DELAY_REPORTER,
    MAX_DELAY_PRINT_RATE_NS, MAX_NB_PRINTS, THRESHOLD_REDUCE, VM_CLOCK_ADVANCE_NS,
};
pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use icount::{IcountConfig, MAX_ICOUNT_SHIFT};

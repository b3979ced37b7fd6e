/// Largest supported `ns per instruction` exponent.
pub const MAX_ICOUNT_SHIFT: u32 = 10;

/// Deterministic-timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcountConfig {
    /// Each retired guest instruction advances virtual time by `1 << shift` nanoseconds.
    ///
    /// Values above [`MAX_ICOUNT_SHIFT`] are clamped.
    pub shift: u32,
    /// Throttle the vCPU so virtual time does not run ahead of the host clock.
    pub align: bool,
}

impl Default for IcountConfig {
    fn default() -> Self {
        Self {
            shift: 3,
            align: false,
        }
    }
}

impl IcountConfig {
    /// Convert an instruction count to virtual nanoseconds.
    #[inline]
    pub fn to_ns(&self, icount: i64) -> i64 {
        icount << self.shift.min(MAX_ICOUNT_SHIFT)
    }
}

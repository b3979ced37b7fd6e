/// Largest budget the 16-bit decrementer can hold.
pub const ICOUNT_DECR_MAX: i64 = 0xffff;

/// Instruction budget of one CPU under deterministic timing.
///
/// The budget is split into a 16-bit decrementer, which fragments consume on entry, and a bank
/// of `extra` instructions used to refill it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcountState {
    enabled: bool,
    decr: u16,
    extra: i64,
    granted: i64,
    retired_before_grant: i64,
}

impl IcountState {
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Give the CPU `budget` instructions to execute, replacing whatever was left.
    pub fn grant(&mut self, budget: i64) {
        self.retired_before_grant = self.retired();
        let budget = budget.max(0);
        let decr = budget.min(ICOUNT_DECR_MAX);
        self.decr = decr as u16;
        self.extra = budget - decr;
        self.granted = budget;
    }

    /// Take back the unused part of the budget.
    pub fn reclaim(&mut self) -> i64 {
        let left = self.remaining();
        self.retired_before_grant = self.retired();
        self.decr = 0;
        self.extra = 0;
        self.granted = 0;
        left
    }

    #[inline]
    pub fn decr(&self) -> u16 {
        self.decr
    }

    #[inline]
    pub fn extra(&self) -> i64 {
        self.extra
    }

    /// Instructions left in the current grant.
    #[inline]
    pub fn remaining(&self) -> i64 {
        i64::from(self.decr) + self.extra
    }

    /// Instructions retired since the CPU was created.
    pub fn retired(&self) -> i64 {
        self.retired_before_grant + self.granted - self.remaining()
    }

    /// Charge a fragment of `insns` instructions at its entry.
    ///
    /// Returns `false`, leaving the budget untouched, if the decrementer cannot cover it.
    #[inline]
    pub fn try_enter(&mut self, insns: u16) -> bool {
        if !self.enabled {
            return true;
        }
        match self.decr.checked_sub(insns) {
            Some(left) => {
                self.decr = left;
                true
            }
            None => false,
        }
    }

    /// Move banked instructions into the decrementer. Returns `false` if the bank is empty.
    pub fn refill(&mut self) -> bool {
        if self.extra == 0 {
            return false;
        }
        self.extra += i64::from(self.decr);
        let next = self.extra.min(ICOUNT_DECR_MAX);
        self.extra -= next;
        self.decr = next as u16;
        true
    }
}

//! Slot ledger: the integer account of worker capacity.
//!
//! One pod = one slot; a launcher consumes a slot too. The ledger moves
//! only on actual create/delete of pods and launchers, so at any moment
//! `free + live pods + live launchers == pool`.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("need {requested} slots but only {available} free")]
pub struct InsufficientSlots {
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, Clone)]
pub struct SlotLedger {
    pool: i32,
    free: i32,
}

impl SlotLedger {
    pub fn new(pool_size: i32) -> Self {
        Self {
            pool: pool_size.max(0),
            free: pool_size.max(0),
        }
    }

    pub fn pool(&self) -> i32 {
        self.pool
    }

    pub fn free(&self) -> i32 {
        self.free
    }

    /// Take `n` slots out of the free pool.
    pub fn reserve(&mut self, n: i32) -> Result<(), InsufficientSlots> {
        if n > self.free {
            return Err(InsufficientSlots {
                requested: n,
                available: self.free,
            });
        }
        self.free -= n;
        Ok(())
    }

    /// Return `n` slots to the free pool.
    pub fn release(&mut self, n: i32) {
        debug_assert!(self.free + n <= self.pool, "slot ledger over-released");
        self.free = (self.free + n).min(self.pool);
    }
}

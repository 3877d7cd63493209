//! Interrupts waiting for the guest to become interruptible again
//!
//! The buffer is a fixed array of raw interruption-information values where zero marks a
//! free slot. Insertion takes the first free slot and removal takes the first occupied one,
//! so the buffer behaves as a bag: there is no ordering guarantee between interrupts that
//! are waiting at the same time.

use tracing::warn;

use crate::consts::PENDING_INTERRUPTS_CAPACITY;
use crate::errors::{HvError, Result};
use crate::injection::InterruptionInfo;

#[derive(Debug, Clone)]
pub struct PendingInterrupts {
    slots: [u32; PENDING_INTERRUPTS_CAPACITY],
}

impl Default for PendingInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingInterrupts {
    pub fn new() -> Self {
        Self {
            slots: [0; PENDING_INTERRUPTS_CAPACITY],
        }
    }

    /// Park an interrupt in the first free slot
    ///
    /// # Errors
    ///
    /// Fails with [`HvError::PendingInterruptsSaturated`] if every slot is taken. The
    /// existing entries are left untouched in that case.
    pub fn insert(&mut self, info: InterruptionInfo) -> Result<()> {
        if info.raw() == 0 {
            warn!("refusing to park an empty interruption");
            return Ok(());
        }
        match self.slots.iter_mut().find(|slot| **slot == 0) {
            Some(slot) => {
                *slot = info.raw();
                Ok(())
            }
            None => Err(HvError::PendingInterruptsSaturated(info.raw())),
        }
    }

    /// Remove one parked interrupt, if there is any
    pub fn take(&mut self) -> Option<InterruptionInfo> {
        let slot = self.slots.iter_mut().find(|slot| **slot != 0)?;
        let raw = std::mem::take(slot);
        Some(InterruptionInfo::from_raw(raw))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| **slot != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| *slot == 0)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|slot| *slot != 0)
    }

    pub fn capacity(&self) -> usize {
        PENDING_INTERRUPTS_CAPACITY
    }
}

//! Guest virtual addresses

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

use crate::consts::{KERNEL_ADDRESS_MASK, PAGE_SIZE};

/// A virtual address inside the guest
///
/// Guest memory is never dereferenced directly by the engine, every access goes through
/// [`GuestOs`](crate::extension_points::GuestOs), so this is a plain number with some
/// helpers for page arithmetic.
#[derive(Hash, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
    pub fn u64(&self) -> u64 {
        self.0
    }
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
    /// Start of the 4 KiB page holding this address
    pub fn page_base(&self) -> Addr {
        Addr(self.0 & !(PAGE_SIZE - 1))
    }
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
    /// Whether the address lies in the kernel half of the canonical address space
    pub fn is_kernel(&self) -> bool {
        self.0 & KERNEL_ADDRESS_MASK != 0
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", { self.0 })
    }
}

impl std::fmt::Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Add<u64> for Addr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u64> for Addr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs)
    }
}

impl Sub for Addr {
    type Output = u64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl Sub<u64> for Addr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value)
    }
}

impl From<Addr> for u64 {
    fn from(value: Addr) -> Self {
        value.0
    }
}

//! MSR and I/O intercept bitmaps of a core
//!
//! Both bitmaps are plain memory pages referenced by the VMCS. A set bit makes the matching
//! `rdmsr`/`wrmsr` or `in`/`out` cause a VM-exit.

use crate::consts::ALL;

const MSR_LOW_END: u32 = 0x1fff;
const MSR_HIGH_START: u32 = 0xc000_0000;
const MSR_HIGH_END: u32 = 0xc000_1fff;
const MSR_QUARTER: usize = 0x400;

/// The 4 KiB MSR bitmap: read-low, read-high, write-low, write-high
#[derive(Clone)]
pub struct MsrBitmap {
    page: Box<[u8; 4 * MSR_QUARTER]>,
}

impl std::fmt::Debug for MsrBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsrBitmap")
            .field("intercepted_bits", &self.count())
            .finish()
    }
}

impl Default for MsrBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrBitmap {
    pub fn new() -> Self {
        Self {
            page: Box::new([0; 4 * MSR_QUARTER]),
        }
    }

    /// Byte offset and bit of `msr` inside the page, `None` for MSRs the bitmap cannot cover
    fn locate(msr: u32, write: bool) -> Option<(usize, u8)> {
        let (quarter, index) = match msr {
            0..=MSR_LOW_END => (0, msr),
            MSR_HIGH_START..=MSR_HIGH_END => (1, msr - MSR_HIGH_START),
            _ => return None,
        };
        let quarter = if write { quarter + 2 } else { quarter };
        Some((
            quarter * MSR_QUARTER + (index / 8) as usize,
            1 << (index % 8),
        ))
    }

    fn range(write: bool) -> std::ops::Range<usize> {
        if write {
            2 * MSR_QUARTER..4 * MSR_QUARTER
        } else {
            0..2 * MSR_QUARTER
        }
    }

    /// Intercept `msr`, or every MSR for [`ALL`]
    ///
    /// Returns false if the MSR is outside of the ranges covered by the bitmap.
    pub fn intercept(&mut self, msr: u32, write: bool) -> bool {
        if msr == ALL {
            self.page[Self::range(write)].fill(0xff);
            return true;
        }
        match Self::locate(msr, write) {
            Some((byte, bit)) => {
                self.page[byte] |= bit;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self, write: bool) {
        self.page[Self::range(write)].fill(0);
    }

    /// MSRs outside of the covered ranges always exit
    pub fn is_intercepted(&self, msr: u32, write: bool) -> bool {
        match Self::locate(msr, write) {
            Some((byte, bit)) => self.page[byte] & bit != 0,
            None => true,
        }
    }

    fn count(&self) -> u32 {
        self.page.iter().map(|b| b.count_ones()).sum()
    }
}

const IO_BITMAP_BYTES: usize = 0x2000;

/// The two 4 KiB I/O bitmaps A (ports 0 to 0x7fff) and B (0x8000 to 0xffff), stored back to back
#[derive(Clone)]
pub struct IoBitmap {
    pages: Box<[u8; IO_BITMAP_BYTES]>,
}

impl std::fmt::Debug for IoBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ports: u32 = self.pages.iter().map(|b| b.count_ones()).sum();
        f.debug_struct("IoBitmap")
            .field("intercepted_ports", &ports)
            .finish()
    }
}

impl Default for IoBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBitmap {
    pub fn new() -> Self {
        Self {
            pages: Box::new([0; IO_BITMAP_BYTES]),
        }
    }

    /// Intercept `port`, or every port for [`ALL`]
    ///
    /// Returns false for values that are not a 16-bit port.
    pub fn intercept(&mut self, port: u32) -> bool {
        if port == ALL {
            self.pages.fill(0xff);
            return true;
        }
        if port > 0xffff {
            return false;
        }
        self.pages[(port / 8) as usize] |= 1 << (port % 8);
        true
    }

    pub fn reset(&mut self) {
        self.pages.fill(0);
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        self.pages[(port / 8) as usize] & (1 << (port % 8)) != 0
    }
}

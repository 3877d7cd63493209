//! # Per-core and global debugging state
//!
//! [`CoreState`] is the state block of one logical core. The context keeps one per core
//! behind a [`spin::Mutex`]. Every change to the core's VMCS, and every arbiter
//! recomputation, happens while that lock is held.
//!
//! [`Features`] are the switches of the debugger that are global to the machine, like
//! whether the kernel debugger is connected. They are atomics because they are read on
//! every VM-exit of every core.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::bitmaps::{IoBitmap, MsrBitmap};
use crate::config::HvConfig;
use crate::consts::PAGE_SIZE;
use crate::pending::PendingInterrupts;
use crate::vmcs::Vmcs;
use crate::{CoreId, ProcessId, ThreadId};

/// Hardware breakpoint armed to stop a thread after stepping over a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareStep {
    pub address: Addr,
    pub process: ProcessId,
    pub thread: ThreadId,
}

/// Page faults still to be injected, one page per interrupt window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFaultRange {
    pub next: Addr,
    pub end: Addr,
    pub error_code: u32,
}

impl PageFaultRange {
    /// Address of the next fault to inject, advancing the range
    pub fn advance(&mut self) -> Option<Addr> {
        if self.next > self.end {
            return None;
        }
        let current = self.next;
        self.next = self.next.page_base() + PAGE_SIZE;
        Some(current)
    }

    pub fn is_done(&self) -> bool {
        self.next > self.end
    }
}

pub struct CoreState {
    pub core: CoreId,
    pub vmcs: Box<dyn Vmcs>,
    pub pending: PendingInterrupts,
    pub msr_bitmap: MsrBitmap,
    pub io_bitmap: IoBitmap,
    /// Skip the exiting instruction once the current exit is handled
    pub increment_rip: bool,
    /// An instrumentation step is in flight on this core
    pub instrumentation_step: bool,
    /// Break into the debugger on the next monitor trap flag exit
    pub break_on_mtf: bool,
    /// Events are not evaluated on this core, used while stepping
    pub masking_events: bool,
    pub hardware_step: Option<HardwareStep>,
    /// NMIs of the guest that arrived while NMI delivery was blocked
    pub queued_nmis: u32,
    pub page_fault_range: Option<PageFaultRange>,
    /// Mov-to-CR3 exiting is needed to catch the next address space switch
    pub waiting_for_mov_cr3: bool,
    pub vmx_off: bool,
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("core", &self.core)
            .field("pending", &self.pending.len())
            .field("instrumentation_step", &self.instrumentation_step)
            .field("break_on_mtf", &self.break_on_mtf)
            .field("masking_events", &self.masking_events)
            .field("hardware_step", &self.hardware_step)
            .field("queued_nmis", &self.queued_nmis)
            .field("waiting_for_mov_cr3", &self.waiting_for_mov_cr3)
            .finish_non_exhaustive()
    }
}

impl CoreState {
    pub fn new(core: CoreId, vmcs: Box<dyn Vmcs>) -> Self {
        Self {
            core,
            vmcs,
            pending: PendingInterrupts::new(),
            msr_bitmap: MsrBitmap::new(),
            io_bitmap: IoBitmap::new(),
            increment_rip: false,
            instrumentation_step: false,
            break_on_mtf: false,
            masking_events: false,
            hardware_step: None,
            queued_nmis: 0,
            page_fault_range: None,
            waiting_for_mov_cr3: false,
            vmx_off: false,
        }
    }

    /// Whether the core is in the middle of a single-step sequence
    pub fn is_stepping(&self) -> bool {
        self.instrumentation_step || self.break_on_mtf
    }

    pub fn suppress_rip_increment(&mut self) {
        self.increment_rip = false;
    }
}

/// Machine-wide feature switches
#[derive(Debug, Default)]
pub struct Features {
    pub events_enabled: AtomicBool,
    pub kernel_debugger_active: AtomicBool,
    pub user_debugger_active: AtomicBool,
    /// #DB interception used to notice a thread switch
    pub debug_registers_interception: AtomicBool,
    pub intercept_clock_interrupts_for_thread_change: AtomicBool,
    pub intercept_clock_interrupts_for_process_change: AtomicBool,
    pub transparent_mode: AtomicBool,
    /// The user debugger parks threads of a process on their next #PF or CR3 switch
    pub check_page_faults_and_cr3: AtomicBool,
    /// Classify `syscall`/`sysret` by the address half instead of reading the instruction
    pub unsafe_syscall_handling: AtomicBool,
    /// Interrupts are parked instead of delivered while an instrumentation step runs
    pub interrupts_suppressed_while_stepping: AtomicBool,
}

macro_rules! feature_accessors {
    ($($field:ident),* $(,)?) => {
        impl Features {
            $(
                pub fn $field(&self) -> bool {
                    self.$field.load(Ordering::Acquire)
                }
            )*
        }
    };
}

feature_accessors!(
    events_enabled,
    kernel_debugger_active,
    user_debugger_active,
    debug_registers_interception,
    intercept_clock_interrupts_for_thread_change,
    intercept_clock_interrupts_for_process_change,
    transparent_mode,
    check_page_faults_and_cr3,
    unsafe_syscall_handling,
    interrupts_suppressed_while_stepping,
);

impl Features {
    pub fn from_config(config: &HvConfig) -> Self {
        let features = Features::default();
        features.set(&features.events_enabled, config.events_enabled);
        features.set(&features.kernel_debugger_active, config.kernel_debugger);
        features.set(&features.transparent_mode, config.transparent_mode);
        features.set(
            &features.unsafe_syscall_handling,
            config.unsafe_syscall_handling,
        );
        features.set(
            &features.interrupts_suppressed_while_stepping,
            config.suppress_interrupts_while_stepping,
        );
        features
    }

    pub fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }

    pub fn snapshot(&self) -> FeatureSnapshot {
        FeatureSnapshot {
            events_enabled: self.events_enabled(),
            kernel_debugger_active: self.kernel_debugger_active(),
            user_debugger_active: self.user_debugger_active(),
            debug_registers_interception: self.debug_registers_interception(),
            intercept_clock_interrupts_for_thread_change: self
                .intercept_clock_interrupts_for_thread_change(),
            intercept_clock_interrupts_for_process_change: self
                .intercept_clock_interrupts_for_process_change(),
            transparent_mode: self.transparent_mode(),
            check_page_faults_and_cr3: self.check_page_faults_and_cr3(),
            unsafe_syscall_handling: self.unsafe_syscall_handling(),
            interrupts_suppressed_while_stepping: self.interrupts_suppressed_while_stepping(),
        }
    }
}

/// Plain copy of [`Features`] for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub events_enabled: bool,
    pub kernel_debugger_active: bool,
    pub user_debugger_active: bool,
    pub debug_registers_interception: bool,
    pub intercept_clock_interrupts_for_thread_change: bool,
    pub intercept_clock_interrupts_for_process_change: bool,
    pub transparent_mode: bool,
    pub check_page_faults_and_cr3: bool,
    pub unsafe_syscall_handling: bool,
    pub interrupts_suppressed_while_stepping: bool,
}

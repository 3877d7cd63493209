//! # VMCS access
//!
//! The virtual-machine control structure of one logical core, reduced to the fields the
//! engine reads and writes.
//!
//! The engine never executes `vmread`/`vmwrite` itself. It talks to a [`Vmcs`] trait object
//! that is owned by the per-core state, so the same logic runs against real hardware
//! (through a thin wrapper around the instructions) and against [`SoftVmcs`], the in-memory
//! implementation used by the simulated machine.
//!
//! The VM-execution controls are modelled with [`bitflags`], one type per control field.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A VMCS field, identified by its architectural encoding
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmcsField {
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestPhysicalAddress = 0x2400,
    GuestEfer = 0x2806,
    PinBasedControls = 0x4000,
    ProcBasedControls = 0x4002,
    ExceptionBitmap = 0x4004,
    ExitControls = 0x400c,
    EntryControls = 0x4012,
    EntryInterruptionInfo = 0x4016,
    EntryExceptionErrorCode = 0x4018,
    EntryInstructionLength = 0x401a,
    ExitReason = 0x4402,
    ExitInterruptionInfo = 0x4404,
    ExitInterruptionErrorCode = 0x4406,
    ExitInstructionLength = 0x440c,
    GuestInterruptibility = 0x4824,
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    ExitQualification = 0x6400,
    GuestLinearAddress = 0x640a,
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestDr7 = 0x681a,
    GuestRsp = 0x681c,
    GuestRip = 0x681e,
    GuestRflags = 0x6820,
}

impl VmcsField {
    pub fn encoding(self) -> u32 {
        self as u32
    }
}

/// Access to the VMCS of the current core
///
/// CR2 is not a VMCS field, but it has to be written right before a page fault is injected,
/// so the implementation is responsible for it as well. The same goes for the debug address
/// registers DR0 to DR3, which are loaded on the core before the next VM-entry.
pub trait Vmcs: Send {
    fn read(&self, field: VmcsField) -> u64;
    fn write(&mut self, field: VmcsField, value: u64);
    fn guest_cr2(&self) -> u64;
    fn set_guest_cr2(&mut self, value: u64);
    /// Debug address register `index`, only the low two bits of `index` are used
    fn guest_dr(&self, index: usize) -> u64;
    fn set_guest_dr(&mut self, index: usize, value: u64);
}

bitflags! {
    /// Pin-based VM-execution controls
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PinControls: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProcControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const USE_MSR_BITMAPS = 1 << 28;
    }
}

bitflags! {
    /// Primary VM-exit controls
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags! {
    /// VM-entry controls
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags! {
    /// Guest interruptibility state
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Interruptibility: u32 {
        const BLOCKING_BY_STI = 1 << 0;
        const BLOCKING_BY_MOV_SS = 1 << 1;
        const BLOCKING_BY_SMI = 1 << 2;
        const BLOCKING_BY_NMI = 1 << 3;
    }
}

/// Typed accessors on top of the raw [`Vmcs`] interface
pub trait VmcsExt: Vmcs {
    fn pin_controls(&self) -> PinControls {
        PinControls::from_bits_retain(self.read(VmcsField::PinBasedControls) as u32)
    }
    fn set_pin_controls(&mut self, controls: PinControls) {
        self.write(VmcsField::PinBasedControls, controls.bits() as u64)
    }
    fn proc_controls(&self) -> ProcControls {
        ProcControls::from_bits_retain(self.read(VmcsField::ProcBasedControls) as u32)
    }
    fn set_proc_controls(&mut self, controls: ProcControls) {
        self.write(VmcsField::ProcBasedControls, controls.bits() as u64)
    }
    fn exit_controls(&self) -> ExitControls {
        ExitControls::from_bits_retain(self.read(VmcsField::ExitControls) as u32)
    }
    fn set_exit_controls(&mut self, controls: ExitControls) {
        self.write(VmcsField::ExitControls, controls.bits() as u64)
    }
    fn entry_controls(&self) -> EntryControls {
        EntryControls::from_bits_retain(self.read(VmcsField::EntryControls) as u32)
    }
    fn set_entry_controls(&mut self, controls: EntryControls) {
        self.write(VmcsField::EntryControls, controls.bits() as u64)
    }
    fn interruptibility(&self) -> Interruptibility {
        Interruptibility::from_bits_retain(self.read(VmcsField::GuestInterruptibility) as u32)
    }

    /// Turn a processor-based control on or off, leaving the other bits alone
    fn toggle_proc_control(&mut self, control: ProcControls, on: bool) {
        let mut controls = self.proc_controls();
        controls.set(control, on);
        self.set_proc_controls(controls);
    }

    fn exit_instruction_length(&self) -> u64 {
        self.read(VmcsField::ExitInstructionLength)
    }
    fn guest_rip(&self) -> u64 {
        self.read(VmcsField::GuestRip)
    }
    fn set_guest_rip(&mut self, rip: u64) {
        self.write(VmcsField::GuestRip, rip)
    }
    fn guest_rflags(&self) -> u64 {
        self.read(VmcsField::GuestRflags)
    }
    fn set_guest_rflags(&mut self, rflags: u64) {
        self.write(VmcsField::GuestRflags, rflags)
    }
}

impl<T: Vmcs + ?Sized> VmcsExt for T {}

/// Basic exit reasons handled by the classifier
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    NmiWindow = 8,
    Cpuid = 10,
    Hlt = 12,
    Invd = 13,
    Rdpmc = 15,
    Rdtsc = 16,
    Vmcall = 18,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    MonitorTrapFlag = 37,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Rdtscp = 51,
    Xsetbv = 55,
}

impl ExitReason {
    /// Decode the exit reason field, only the low 16 bits are the basic reason
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw & 0xffff {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            7 => Self::InterruptWindow,
            8 => Self::NmiWindow,
            10 => Self::Cpuid,
            12 => Self::Hlt,
            13 => Self::Invd,
            15 => Self::Rdpmc,
            16 => Self::Rdtsc,
            18 => Self::Vmcall,
            28 => Self::CrAccess,
            29 => Self::DrAccess,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            37 => Self::MonitorTrapFlag,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            51 => Self::Rdtscp,
            55 => Self::Xsetbv,
            _ => return None,
        })
    }

    /// Whether the exit was caused by executing an instruction that has to be skipped after
    /// it was handled
    pub fn advances_rip(self) -> bool {
        matches!(
            self,
            Self::Cpuid
                | Self::Hlt
                | Self::Invd
                | Self::Rdpmc
                | Self::Rdtsc
                | Self::Vmcall
                | Self::CrAccess
                | Self::DrAccess
                | Self::IoInstruction
                | Self::Rdmsr
                | Self::Wrmsr
                | Self::Rdtscp
                | Self::Xsetbv
        )
    }
}

/// An in-memory VMCS
///
/// Unwritten fields read as zero, like a freshly cleared VMCS region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftVmcs {
    fields: HashMap<VmcsField, u64>,
    cr2: u64,
    dr: [u64; 4],
}

impl SoftVmcs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vmcs for SoftVmcs {
    fn read(&self, field: VmcsField) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }

    fn write(&mut self, field: VmcsField, value: u64) {
        self.fields.insert(field, value);
    }

    fn guest_cr2(&self) -> u64 {
        self.cr2
    }

    fn set_guest_cr2(&mut self, value: u64) {
        self.cr2 = value;
    }

    fn guest_dr(&self, index: usize) -> u64 {
        self.dr[index & 3]
    }

    fn set_guest_dr(&mut self, index: usize, value: u64) {
        self.dr[index & 3] = value;
    }
}

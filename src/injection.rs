//! # Event injection
//!
//! Interruption-information decoding and the routines that put an interrupt or exception
//! back into the guest on the next VM-entry.
//!
//! Re-injection of an intercepted event is always verbatim: the exit interruption
//! information is copied unchanged into the entry interruption field, and the error code
//! is copied when the exit marked it valid. Software interrupts and exceptions also need
//! the instruction length, which is taken from the exit.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::consts::{
    EXCEPTION_VECTOR_BREAKPOINT, EXCEPTION_VECTOR_NMI, EXCEPTION_VECTOR_PAGE_FAULT,
    EXCEPTION_VECTOR_UNDEFINED_OPCODE,
};
use crate::vmcs::{Vmcs, VmcsExt, VmcsField};

/// Type of an interruption, bits 8 to 10 of the interruption information
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    Reserved = 1,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => Self::ExternalInterrupt,
            1 => Self::Reserved,
            2 => Self::Nmi,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::OtherEvent,
        }
    }

    /// Software-generated events need the instruction length on entry
    pub fn needs_instruction_length(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

/// Raw interruption information as found in the exit and entry interruption fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterruptionInfo(u32);

impl InterruptionInfo {
    const ERROR_CODE_VALID: u32 = 1 << 11;
    const NMI_UNBLOCKING: u32 = 1 << 12;
    const VALID: u32 = 1 << 31;

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// A valid interruption of the given vector and type
    pub fn new(vector: u8, kind: InterruptionType, error_code_valid: bool) -> Self {
        let mut raw = Self::VALID | ((kind as u32) << 8) | vector as u32;
        if error_code_valid {
            raw |= Self::ERROR_CODE_VALID;
        }
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
    pub fn vector(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
    pub fn kind(&self) -> InterruptionType {
        InterruptionType::from_bits(self.0 >> 8)
    }
    pub fn error_code_valid(&self) -> bool {
        self.0 & Self::ERROR_CODE_VALID != 0
    }
    pub fn nmi_unblocking(&self) -> bool {
        self.0 & Self::NMI_UNBLOCKING != 0
    }
    pub fn valid(&self) -> bool {
        self.0 & Self::VALID != 0
    }
}

/// Interruption information of the exit currently being handled
pub fn exit_interruption(vmcs: &dyn Vmcs) -> InterruptionInfo {
    InterruptionInfo::from_raw(vmcs.read(VmcsField::ExitInterruptionInfo) as u32)
}

/// Deliver the intercepted interrupt or exception back to the guest, unmodified
pub fn reinject(vmcs: &mut dyn Vmcs) {
    let info = exit_interruption(vmcs);
    trace!("re-injecting {:#x}", info.raw());
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
    if info.error_code_valid() {
        let code = vmcs.read(VmcsField::ExitInterruptionErrorCode);
        vmcs.write(VmcsField::EntryExceptionErrorCode, code);
    }
    if info.kind().needs_instruction_length() {
        let len = vmcs.exit_instruction_length();
        vmcs.write(VmcsField::EntryInstructionLength, len);
    }
}

/// Inject an interrupt that was parked in the pending ring
pub fn inject_raw(vmcs: &mut dyn Vmcs, info: InterruptionInfo) {
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
}

pub fn inject_breakpoint(vmcs: &mut dyn Vmcs) {
    let info = InterruptionInfo::new(
        EXCEPTION_VECTOR_BREAKPOINT,
        InterruptionType::SoftwareException,
        false,
    );
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
    let len = vmcs.exit_instruction_length();
    vmcs.write(VmcsField::EntryInstructionLength, len);
}

pub fn inject_undefined_opcode(vmcs: &mut dyn Vmcs) {
    let info = InterruptionInfo::new(
        EXCEPTION_VECTOR_UNDEFINED_OPCODE,
        InterruptionType::HardwareException,
        false,
    );
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
}

/// Inject a page fault at `address`, CR2 is written first
pub fn inject_page_fault(vmcs: &mut dyn Vmcs, address: u64, error_code: u32) {
    let info = InterruptionInfo::new(
        EXCEPTION_VECTOR_PAGE_FAULT,
        InterruptionType::HardwareException,
        true,
    );
    trace!("injecting #PF at {address:#x} ({error_code:#x})");
    vmcs.set_guest_cr2(address);
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
    vmcs.write(VmcsField::EntryExceptionErrorCode, error_code as u64);
}

pub fn inject_nmi(vmcs: &mut dyn Vmcs) {
    let info = InterruptionInfo::new(EXCEPTION_VECTOR_NMI, InterruptionType::Nmi, false);
    vmcs.write(VmcsField::EntryInterruptionInfo, info.raw() as u64);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmcs::SoftVmcs;

    #[test]
    fn test_reinject_copies_info_and_error_code() {
        let mut vmcs = SoftVmcs::new();
        let info = InterruptionInfo::new(13, InterruptionType::HardwareException, true);
        vmcs.write(VmcsField::ExitInterruptionInfo, info.raw() as u64);
        vmcs.write(VmcsField::ExitInterruptionErrorCode, 0x1337);

        reinject(&mut vmcs);

        assert_eq!(
            vmcs.read(VmcsField::EntryInterruptionInfo),
            info.raw() as u64
        );
        assert_eq!(vmcs.read(VmcsField::EntryExceptionErrorCode), 0x1337);
    }

    #[test]
    fn test_reinject_without_error_code_leaves_it_alone() {
        let mut vmcs = SoftVmcs::new();
        let info = InterruptionInfo::new(0x2f, InterruptionType::ExternalInterrupt, false);
        vmcs.write(VmcsField::ExitInterruptionInfo, info.raw() as u64);
        vmcs.write(VmcsField::ExitInterruptionErrorCode, 0xdead);

        reinject(&mut vmcs);

        assert_eq!(vmcs.read(VmcsField::EntryExceptionErrorCode), 0);
        assert_eq!(vmcs.read(VmcsField::EntryInstructionLength), 0);
    }

    #[test]
    fn test_page_fault_injection_layout() {
        let mut vmcs = SoftVmcs::new();
        inject_page_fault(&mut vmcs, 0x7ff0_0000_1000, 0x14);
        assert_eq!(vmcs.read(VmcsField::EntryInterruptionInfo), 0x8000_0b0e);
        assert_eq!(vmcs.read(VmcsField::EntryExceptionErrorCode), 0x14);
        assert_eq!(vmcs.guest_cr2(), 0x7ff0_0000_1000);
    }

    #[test]
    fn test_breakpoint_is_a_software_exception() {
        let mut vmcs = SoftVmcs::new();
        vmcs.write(VmcsField::ExitInstructionLength, 1);
        inject_breakpoint(&mut vmcs);
        let info =
            InterruptionInfo::from_raw(vmcs.read(VmcsField::EntryInterruptionInfo) as u32);
        assert_eq!(info.vector(), 3);
        assert_eq!(info.kind(), InterruptionType::SoftwareException);
        assert!(info.valid());
        assert_eq!(vmcs.read(VmcsField::EntryInstructionLength), 1);
    }
}

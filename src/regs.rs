//! General purpose registers of a guest at the time of a VM-exit
//!
//! rip and rflags are not part of this block. Like on real hardware, they live in the guest
//! area of the [`Vmcs`](crate::vmcs::Vmcs).

use serde::{Deserialize, Serialize};

/// The register block saved by the VM-exit stub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuestRegs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    rax,
    rcx,
    rdx,
    rbx,
    rsp,
    rbp,
    rsi,
    rdi,
    r8,
    r9,
    r10,
    r11,
    r12,
    r13,
    r14,
    r15,
}

impl GuestRegs {
    pub fn get(&self, r: Register) -> u64 {
        match r {
            Register::rax => self.rax,
            Register::rcx => self.rcx,
            Register::rdx => self.rdx,
            Register::rbx => self.rbx,
            Register::rsp => self.rsp,
            Register::rbp => self.rbp,
            Register::rsi => self.rsi,
            Register::rdi => self.rdi,
            Register::r8 => self.r8,
            Register::r9 => self.r9,
            Register::r10 => self.r10,
            Register::r11 => self.r11,
            Register::r12 => self.r12,
            Register::r13 => self.r13,
            Register::r14 => self.r14,
            Register::r15 => self.r15,
        }
    }

    pub fn set(&mut self, r: Register, v: u64) {
        match r {
            Register::rax => self.rax = v,
            Register::rcx => self.rcx = v,
            Register::rdx => self.rdx = v,
            Register::rbx => self.rbx = v,
            Register::rsp => self.rsp = v,
            Register::rbp => self.rbp = v,
            Register::rsi => self.rsi = v,
            Register::rdi => self.rdi = v,
            Register::r8 => self.r8 = v,
            Register::r9 => self.r9 = v,
            Register::r10 => self.r10 = v,
            Register::r11 => self.r11 = v,
            Register::r12 => self.r12 = v,
            Register::r13 => self.r13 = v,
            Register::r14 => self.r14 = v,
            Register::r15 => self.r15 = v,
        }
    }

    /// Register selected by the 4-bit general purpose register index used in exit
    /// qualifications
    pub fn by_index(index: u8) -> Register {
        match index & 0xf {
            0 => Register::rax,
            1 => Register::rcx,
            2 => Register::rdx,
            3 => Register::rbx,
            4 => Register::rsp,
            5 => Register::rbp,
            6 => Register::rsi,
            7 => Register::rdi,
            8 => Register::r8,
            9 => Register::r9,
            10 => Register::r10,
            11 => Register::r11,
            12 => Register::r12,
            13 => Register::r13,
            14 => Register::r14,
            _ => Register::r15,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_access_by_index() {
        let mut regs = GuestRegs::default();
        regs.set(GuestRegs::by_index(9), 0x1337);
        assert_eq!(regs.r9, 0x1337);
        assert_eq!(regs.get(Register::r9), 0x1337);
        assert_eq!(GuestRegs::by_index(4), Register::rsp);
    }
}

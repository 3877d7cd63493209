//! Fixed numbers of the hypervisor: sentinels, vectors, MSRs and the layout of the user-mode
//! spin buffer.

#![allow(unused)]

/// Sentinel meaning "every core", "every process", "every MSR" and so on
pub const ALL: u32 = 0xffff_ffff;
/// Same sentinel widened to the 64-bit event parameters
pub const ALL_U64: u64 = ALL as u64;
/// Tag value of a modify request that applies to every registered event
pub const ALL_TAGS: u64 = u64::MAX;

/// First tag minted for events registered without an explicit tag
pub const EVENT_TAG_SEED: u64 = 0x100_0000;
/// First token minted for attached user-mode processes
pub const THREAD_DEBUGGING_TOKEN_SEED: u64 = 0x100_0000;

/// Slots in the per-core ring of interrupts waiting for re-injection
pub const PENDING_INTERRUPTS_CAPACITY: usize = 64;
/// Commands a paused thread can have queued at once
pub const MAX_THREAD_ACTIONS: usize = 4;

pub const PAGE_SIZE: u64 = 0x1000;
/// Largest guest buffer read on behalf of a message or a disassembly request
pub const MAX_GUEST_BUFFER_SIZE: u64 = 20 * PAGE_SIZE;

// ---------------- exception vectors --------------------------------------------------------------

pub const EXCEPTION_VECTOR_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_VECTOR_DEBUG_BREAKPOINT: u8 = 1;
pub const EXCEPTION_VECTOR_NMI: u8 = 2;
pub const EXCEPTION_VECTOR_BREAKPOINT: u8 = 3;
pub const EXCEPTION_VECTOR_UNDEFINED_OPCODE: u8 = 6;
pub const EXCEPTION_VECTOR_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_VECTOR_PAGE_FAULT: u8 = 14;
/// First vector that is not an architectural exception
pub const FIRST_INTERRUPT_VECTOR: u64 = 32;

/// #PF error code of a user-mode instruction fetch from a non-present page
pub const PAGE_FAULT_ERROR_USER_FETCH: u32 = 0x14;

// ---------------- hypercall ABI ------------------------------------------------------------------

pub const HYPERCALL_MAGIC_R10: u64 = 0x4856_4653;
pub const HYPERCALL_MAGIC_R11: u64 = 0x564d_4341_4c4c;
pub const HYPERCALL_MAGIC_R12: u64 = 0x4e4f_4859_5045_5256;

/// Returned in rax by a successful hypercall
pub const HV_STATUS_SUCCESS: u64 = 0;
/// Returned in rax by a failed or unknown hypercall
pub const HV_STATUS_UNSUCCESSFUL: u64 = 0xc000_0001;

/// Hypercall codes above this number and up to [`TOP_LEVEL_VMCALL_END`] belong to the
/// top-level driver
pub const TOP_LEVEL_VMCALL_START: u32 = 0x200;
pub const TOP_LEVEL_VMCALL_END: u32 = TOP_LEVEL_VMCALL_START + 0x100;

// ---------------- rflags -------------------------------------------------------------------------

pub const RFLAGS_FIXED: u64 = 1 << 1;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;
/// Bits of rflags that must read as zero
pub const RFLAGS_RESERVED: u64 = 0xffff_ffff_ffc0_8028;

// ---------------- MSRs ---------------------------------------------------------------------------

pub const MSR_IA32_EFER: u32 = 0xc000_0080;
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
pub const MSR_IA32_FMASK: u32 = 0xc000_0084;
/// EFER.SCE, system-call extensions
pub const EFER_SCE: u64 = 1;

/// Kernel-half addresses have the top byte set on x86_64
pub const KERNEL_ADDRESS_MASK: u64 = 0xff00_0000_0000_0000;

// ---------------- spin buffer --------------------------------------------------------------------

pub const NOP: u8 = 0x90;
/// `cpuid`, traps to the hypervisor unconditionally
pub const SPIN_TRAP: [u8; 2] = [0x0f, 0xa2];
/// `jmp -12`, back into the nop slide in front of the trap
pub const SPIN_JUMP_BACK: [u8; 2] = [0xeb, 0xf4];
/// Offset of the trapping instruction inside the spin buffer
pub const SPIN_TRAP_OFFSET: u64 = PAGE_SIZE - 4;

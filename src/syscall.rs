//! # Syscall hook through EFER
//!
//! With EFER.SCE cleared in the guest, every `syscall` and `sysret` raises #UD. The #UD exit
//! fires the matching event and then emulates the instruction the way the processor would
//! have executed it, so the guest does not notice anything.

use tracing::{debug, trace};

use crate::arbiter::{self, PassOver, ProtectedResource};
use crate::consts::{
    EFER_SCE, EXCEPTION_VECTOR_UNDEFINED_OPCODE, MSR_IA32_FMASK, MSR_IA32_LSTAR, MSR_IA32_STAR,
    PAGE_FAULT_ERROR_USER_FETCH, RFLAGS_FIXED, RFLAGS_RESERVED, RFLAGS_RF, RFLAGS_VM,
};
use crate::context::HvContext;
use crate::disassemble::{self, SyscallKind};
use crate::errors::Result;
use crate::event::EventType;
use crate::injection;
use crate::regs::GuestRegs;
use crate::vmcs::{EntryControls, ExitControls, VmcsExt, VmcsField};
use crate::vmexit;
use crate::{Addr, CoreId};

/// Length of `syscall` and of `sysret` without a REX prefix
const SHORT_LENGTH: u64 = 2;
/// `sysretq`, the form a 64-bit kernel uses
const SYSRETQ_LENGTH: u64 = 3;

/// Turn the syscall hook of `core` on or off
pub fn configure_efer(ctx: &HvContext, core: CoreId, enable: bool) -> Result<()> {
    ctx.with_core(core, |state| {
        let efer = state.vmcs.read(VmcsField::GuestEfer);
        let mut entry = state.vmcs.entry_controls();
        let mut exit = state.vmcs.exit_controls();
        entry.set(EntryControls::LOAD_IA32_EFER, enable);
        exit.set(ExitControls::SAVE_IA32_EFER | ExitControls::LOAD_IA32_EFER, enable);
        state.vmcs.set_entry_controls(entry);
        state.vmcs.set_exit_controls(exit);

        if enable {
            state.vmcs.write(VmcsField::GuestEfer, efer & !EFER_SCE);
            arbiter::set(
                state,
                ProtectedResource::ExceptionBitmap,
                1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE,
                ctx,
            );
        } else {
            state.vmcs.write(VmcsField::GuestEfer, efer | EFER_SCE);
            arbiter::unset(
                state,
                ProtectedResource::ExceptionBitmap,
                1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE,
                PassOver::UD_FOR_SYSCALL_SYSRET,
                ctx,
            );
        }
        debug!("core {core}: syscall hook {}", if enable { "on" } else { "off" });
    })
}

enum Classified {
    Instruction(SyscallKind, u64),
    /// The instruction bytes are paged out, a #PF was injected for them
    PagedOut,
    Other,
}

fn classify(ctx: &HvContext, core: CoreId, rip: Addr) -> Classified {
    if ctx.features.unsafe_syscall_handling() {
        // sysret runs in the kernel, syscall never does
        return if rip.is_kernel() {
            Classified::Instruction(SyscallKind::Sysret, SYSRETQ_LENGTH)
        } else {
            Classified::Instruction(SyscallKind::Syscall, SHORT_LENGTH)
        };
    }

    let process = ctx.collab.guest.current_process(core);
    if !ctx.collab.guest.is_page_present(process, rip) {
        return Classified::PagedOut;
    }
    let mut bytes = [0u8; 3];
    if ctx
        .collab
        .guest
        .read_memory(process, rip, &mut bytes)
        .is_err()
    {
        return Classified::Other;
    }
    match disassemble::syscall_kind(&bytes) {
        Some(kind) => match disassemble::decode_one(&bytes, rip.u64(), 64) {
            Some(instruction) => {
                trace!(
                    "core {core}: {rip}: {}",
                    disassemble::format_instruction(&instruction)
                );
                Classified::Instruction(kind, instruction.len() as u64)
            }
            None => Classified::Instruction(kind, SHORT_LENGTH),
        },
        None => Classified::Other,
    }
}

/// Emulate the `syscall` or `sysret` behind a #UD
///
/// Returns false if the #UD was not caused by either of them and has to go to the guest.
pub fn handle_ud(ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) -> Result<bool> {
    let rip = Addr::from(ctx.with_core(core, |state| state.vmcs.guest_rip())?);

    let (kind, len) = match classify(ctx, core, rip) {
        Classified::Instruction(kind, len) => (kind, len),
        Classified::PagedOut => {
            debug!("core {core}: #UD at {rip} on a page that is not present");
            ctx.with_core(core, |state| {
                injection::inject_page_fault(
                    state.vmcs.as_mut(),
                    rip.u64(),
                    PAGE_FAULT_ERROR_USER_FETCH,
                );
                state.suppress_rip_increment();
            })?;
            return Ok(true);
        }
        Classified::Other => return Ok(false),
    };

    let (event_type, context) = match kind {
        SyscallKind::Syscall => (EventType::SyscallHookEferSyscall, regs.rax),
        SyscallKind::Sysret => (EventType::SyscallHookEferSysret, rip.u64()),
    };
    if vmexit::fire(ctx, core, regs, event_type, context) {
        trace!("core {core}: {kind:?} at {rip} short-circuited");
        ctx.with_core(core, |state| {
            state.vmcs.set_guest_rip(rip.u64() + len);
            state.suppress_rip_increment();
        })?;
        return Ok(true);
    }

    let guest = &ctx.collab.guest;
    let star = guest.read_msr(core, MSR_IA32_STAR);
    match kind {
        SyscallKind::Syscall => {
            let lstar = guest.read_msr(core, MSR_IA32_LSTAR);
            let fmask = guest.read_msr(core, MSR_IA32_FMASK);
            ctx.with_core(core, |state| {
                let rflags = state.vmcs.guest_rflags();
                regs.rcx = rip.u64() + len;
                regs.r11 = rflags;
                state.vmcs.set_guest_rip(lstar);
                state.vmcs.set_guest_rflags(rflags & !(fmask | RFLAGS_RF));
                let cs = (star >> 32) & 0xffff & !3;
                state.vmcs.write(VmcsField::GuestCsSelector, cs);
                state.vmcs.write(VmcsField::GuestSsSelector, cs + 8);
                state.suppress_rip_increment();
            })?;
        }
        SyscallKind::Sysret => {
            ctx.with_core(core, |state| {
                let base = (star >> 48) & 0xffff;
                state.vmcs.set_guest_rip(regs.rcx);
                state.vmcs.set_guest_rflags(
                    (regs.r11 & !(RFLAGS_RF | RFLAGS_VM | RFLAGS_RESERVED)) | RFLAGS_FIXED,
                );
                state
                    .vmcs
                    .write(VmcsField::GuestCsSelector, (base + 16) | 3);
                state
                    .vmcs
                    .write(VmcsField::GuestSsSelector, (base + 8) | 3);
                state.suppress_rip_increment();
            })?;
        }
    }
    Ok(true)
}

//! # Hypercall dispatcher
//!
//! The non-root half of the debugger configures the engine with `vmcall`. The call code is
//! in rcx, the parameters in rdx, r8 and r9, and the result goes back in rax. Only calls that
//! carry the magic values in r10, r11 and r12 are ours, everything else belongs to a
//! hypervisor below us and is forwarded untouched.
//!
//! The same operations are reachable without a `vmcall` through
//! [`HvContext::direct_hypercall`] and [`HvContext::broadcast_hypercall`], which is how the
//! event registry applies its events.

use tracing::{debug, error, info, trace, warn};

use crate::arbiter::{self, PassOver, ProtectedResource};
use crate::consts::{
    ALL_U64, EXCEPTION_VECTOR_BREAKPOINT, FIRST_INTERRUPT_VECTOR, HV_STATUS_SUCCESS,
    HV_STATUS_UNSUCCESSFUL, HYPERCALL_MAGIC_R10, HYPERCALL_MAGIC_R11, HYPERCALL_MAGIC_R12,
    MAX_GUEST_BUFFER_SIZE, TOP_LEVEL_VMCALL_END, TOP_LEVEL_VMCALL_START,
};
use crate::context::HvContext;
use crate::errors::{HvError, Result};
use crate::extension_points::{MessageKind, PageAttributes};
use crate::halt::PausingReason;
use crate::regs::GuestRegs;
use crate::state::CoreState;
use crate::syscall;
use crate::vmcs::{EntryControls, ExitControls, PinControls, ProcControls, VmcsExt};
use crate::CoreId;

/// Operations of the hypercall interface, the discriminant is the call code
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HypercallCode {
    Test = 0x01,
    VmxOff = 0x02,
    ChangePageAttrib = 0x03,
    InveptAllContexts = 0x04,
    InveptSingleContext = 0x05,
    UnhookAllPages = 0x06,
    UnhookSinglePage = 0x07,
    EnableSyscallHookEfer = 0x08,
    DisableSyscallHookEfer = 0x09,
    ChangeMsrBitmapRead = 0x0a,
    ChangeMsrBitmapWrite = 0x0b,
    SetRdtscExiting = 0x0c,
    SetRdpmcExiting = 0x0d,
    SetExceptionBitmap = 0x0e,
    EnableMovToDebugRegsExiting = 0x0f,
    EnableExternalInterruptExiting = 0x10,
    ChangeIoBitmap = 0x11,
    SetHiddenCcBreakpoint = 0x12,
    UnsetRdtscExiting = 0x13,
    DisableExternalInterruptExitingOnlyToClearInterruptCommands = 0x14,
    UnsetRdpmcExiting = 0x15,
    DisableMovToDebugRegsExiting = 0x16,
    ResetMsrBitmapRead = 0x17,
    ResetMsrBitmapWrite = 0x18,
    ResetExceptionBitmapOnlyOnClearingExceptionEvents = 0x19,
    ResetIoBitmap = 0x1a,
    EnableMovToCr3Exiting = 0x1b,
    DisableMovToCr3Exiting = 0x1c,
    UnsetExceptionBitmap = 0x1d,
    SetVmEntryLoadDebugControls = 0x1e,
    UnsetVmEntryLoadDebugControls = 0x1f,
    SetVmExitSaveDebugControls = 0x20,
    UnsetVmExitSaveDebugControls = 0x21,
    VmExitHaltSystem = 0x22,
    SetVmExitOnNmis = 0x23,
    UnsetVmExitOnNmis = 0x24,
    SignalDebuggerExecutionFinished = 0x25,
    SendMessagesToDebugger = 0x26,
    SendGeneralBufferToDebugger = 0x27,
    VmExitHaltSystemAsAResultOfTriggeringEvent = 0x28,
    DisableRdtscExitingOnlyForTscEvents = 0x29,
    DisableMovToHwDrExitingOnlyForDrEvents = 0x2a,
    EnableMovToControlRegsExiting = 0x2b,
    DisableMovToControlRegsExiting = 0x2c,
    DisableMovToCrExitingOnlyForCrEvents = 0x2d,
}

impl HypercallCode {
    const TABLE: [HypercallCode; 45] = [
        HypercallCode::Test,
        HypercallCode::VmxOff,
        HypercallCode::ChangePageAttrib,
        HypercallCode::InveptAllContexts,
        HypercallCode::InveptSingleContext,
        HypercallCode::UnhookAllPages,
        HypercallCode::UnhookSinglePage,
        HypercallCode::EnableSyscallHookEfer,
        HypercallCode::DisableSyscallHookEfer,
        HypercallCode::ChangeMsrBitmapRead,
        HypercallCode::ChangeMsrBitmapWrite,
        HypercallCode::SetRdtscExiting,
        HypercallCode::SetRdpmcExiting,
        HypercallCode::SetExceptionBitmap,
        HypercallCode::EnableMovToDebugRegsExiting,
        HypercallCode::EnableExternalInterruptExiting,
        HypercallCode::ChangeIoBitmap,
        HypercallCode::SetHiddenCcBreakpoint,
        HypercallCode::UnsetRdtscExiting,
        HypercallCode::DisableExternalInterruptExitingOnlyToClearInterruptCommands,
        HypercallCode::UnsetRdpmcExiting,
        HypercallCode::DisableMovToDebugRegsExiting,
        HypercallCode::ResetMsrBitmapRead,
        HypercallCode::ResetMsrBitmapWrite,
        HypercallCode::ResetExceptionBitmapOnlyOnClearingExceptionEvents,
        HypercallCode::ResetIoBitmap,
        HypercallCode::EnableMovToCr3Exiting,
        HypercallCode::DisableMovToCr3Exiting,
        HypercallCode::UnsetExceptionBitmap,
        HypercallCode::SetVmEntryLoadDebugControls,
        HypercallCode::UnsetVmEntryLoadDebugControls,
        HypercallCode::SetVmExitSaveDebugControls,
        HypercallCode::UnsetVmExitSaveDebugControls,
        HypercallCode::VmExitHaltSystem,
        HypercallCode::SetVmExitOnNmis,
        HypercallCode::UnsetVmExitOnNmis,
        HypercallCode::SignalDebuggerExecutionFinished,
        HypercallCode::SendMessagesToDebugger,
        HypercallCode::SendGeneralBufferToDebugger,
        HypercallCode::VmExitHaltSystemAsAResultOfTriggeringEvent,
        HypercallCode::DisableRdtscExitingOnlyForTscEvents,
        HypercallCode::DisableMovToHwDrExitingOnlyForDrEvents,
        HypercallCode::EnableMovToControlRegsExiting,
        HypercallCode::DisableMovToControlRegsExiting,
        HypercallCode::DisableMovToCrExitingOnlyForCrEvents,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for HypercallCode {
    type Error = HvError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        value
            .checked_sub(1)
            .and_then(|idx| Self::TABLE.get(idx as usize))
            .copied()
            .ok_or(HvError::UnknownHypercall(value as u64))
    }
}

/// Whether the registers carry the magic values of our own hypercalls
pub fn is_own_hypercall(regs: &GuestRegs) -> bool {
    regs.r10 == HYPERCALL_MAGIC_R10
        && regs.r11 == HYPERCALL_MAGIC_R11
        && regs.r12 == HYPERCALL_MAGIC_R12
}

/// Handle a `vmcall` exit
///
/// Sets rax to the result for our own calls. Calls of other hypervisors are forwarded with
/// the guest stack pointer preserved.
pub fn handle_vmcall(ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) {
    if !is_own_hypercall(regs) {
        trace!("core {core}: forwarding foreign vmcall {:#x}", regs.rcx);
        let rsp = regs.rsp;
        ctx.collab.nested.forward(core, regs);
        regs.rsp = rsp;
        return;
    }

    let (call, p1, p2, p3) = (regs.rcx, regs.rdx, regs.r8, regs.r9);
    let result = dispatch(ctx, core, regs, call, p1, p2, p3);
    regs.rax = if result {
        HV_STATUS_SUCCESS
    } else {
        HV_STATUS_UNSUCCESSFUL
    };
}

/// Route a call code to the top-level driver or to [`execute`], true on success
pub fn dispatch(
    ctx: &HvContext,
    core: CoreId,
    regs: &mut GuestRegs,
    call: u64,
    p1: u64,
    p2: u64,
    p3: u64,
) -> bool {
    let code = call as u32;
    if code > TOP_LEVEL_VMCALL_START && code <= TOP_LEVEL_VMCALL_END {
        return match &ctx.collab.top_level {
            Some(top) => top.handle(core, code, p1, p2, p3),
            None => {
                warn!("core {core}: no top-level handler for vmcall {code:#x}");
                false
            }
        };
    }

    let op = match HypercallCode::try_from(code) {
        Ok(op) => op,
        Err(e) => {
            error!("core {core}: {e}");
            return false;
        }
    };

    // the attribute mask rides in the upper half of the call code
    let p2 = if op == HypercallCode::ChangePageAttrib && call >> 32 != 0 {
        call >> 32
    } else {
        p2
    };

    match execute(ctx, core, regs, op, p1, p2, p3) {
        Ok(()) => true,
        Err(e) => {
            error!("core {core}: hypercall {op:?} failed: {e}");
            false
        }
    }
}

fn exception_bits(vector: u64) -> Result<u64> {
    if vector == ALL_U64 {
        Ok(0xffff_ffff)
    } else if vector < FIRST_INTERRUPT_VECTOR {
        Ok(1 << vector)
    } else {
        Err(HvError::ExceptionIndexExceedFirst32Entries(vector))
    }
}

fn cr_resource(cr: u64) -> Result<ProtectedResource> {
    match cr {
        0 => Ok(ProtectedResource::MovToCr0),
        3 => Ok(ProtectedResource::MovToCr3Exiting),
        4 => Ok(ProtectedResource::MovToCr4),
        other => Err(HvError::HypercallFailed(
            HypercallCode::EnableMovToControlRegsExiting.code(),
            format!("cr{other} cannot be intercepted"),
        )),
    }
}

/// Bits of a control-register resource selected by the event mask
fn cr_bits(resource: ProtectedResource, mask: u64) -> u64 {
    if resource == ProtectedResource::MovToCr3Exiting {
        1
    } else {
        mask
    }
}

fn read_guest_buffer(ctx: &HvContext, core: CoreId, address: u64, len: u64) -> Result<Vec<u8>> {
    if len > MAX_GUEST_BUFFER_SIZE {
        return Err(HvError::BufferTooLarge(len));
    }
    let process = ctx.collab.guest.current_process(core);
    let mut buf = vec![0u8; len as usize];
    ctx.collab
        .guest
        .read_memory(process, address.into(), &mut buf)?;
    Ok(buf)
}

/// Execute one operation for `core`
///
/// # Errors
///
/// Fails if the parameters are out of range or a collaborator reports an error.
pub fn execute(
    ctx: &HvContext,
    core: CoreId,
    regs: &mut GuestRegs,
    code: HypercallCode,
    p1: u64,
    p2: u64,
    p3: u64,
) -> Result<()> {
    trace!("core {core}: hypercall {code:?} ({p1:#x}, {p2:#x}, {p3:#x})");

    let set = |resource: ProtectedResource, bits: u64| {
        ctx.with_core(core, |state| arbiter::set(state, resource, bits, ctx))
    };
    let unset = |resource: ProtectedResource, bits: u64, pass_over: PassOver| {
        ctx.with_core(core, |state| {
            arbiter::unset(state, resource, bits, pass_over, ctx)
        })
    };
    let on_core = |f: &dyn Fn(&mut CoreState)| ctx.with_core(core, |state| f(state));

    match code {
        HypercallCode::Test => {
            info!("core {core}: test hypercall ({p1:#x}, {p2:#x}, {p3:#x})");
            Ok(())
        }
        HypercallCode::VmxOff => {
            info!("core {core}: leaving vmx operation");
            on_core(&|state| state.vmx_off = true)
        }
        HypercallCode::ChangePageAttrib => {
            let attributes = PageAttributes::from_bits_truncate(p2 as u32);
            ctx.collab
                .ept
                .hook_page_attributes(core, p1.into(), attributes, p3)
        }
        HypercallCode::InveptAllContexts => {
            ctx.collab.ept.invept_all_contexts(core);
            Ok(())
        }
        HypercallCode::InveptSingleContext => {
            ctx.collab.ept.invept_single_context(core, p1);
            Ok(())
        }
        HypercallCode::UnhookAllPages => ctx.collab.ept.unhook_all(core),
        HypercallCode::UnhookSinglePage => ctx.collab.ept.unhook_single(p1.into(), p2 as u32),
        HypercallCode::EnableSyscallHookEfer => syscall::configure_efer(ctx, core, true),
        HypercallCode::DisableSyscallHookEfer => syscall::configure_efer(ctx, core, false),
        HypercallCode::ChangeMsrBitmapRead | HypercallCode::ChangeMsrBitmapWrite => {
            let write = code == HypercallCode::ChangeMsrBitmapWrite;
            let msr = u32::try_from(p1).map_err(|_| {
                HvError::HypercallFailed(code.code(), format!("{p1:#x} is not an msr"))
            })?;
            let covered = ctx.with_core(core, |state| {
                let covered = state.msr_bitmap.intercept(msr, write);
                state
                    .vmcs
                    .toggle_proc_control(ProcControls::USE_MSR_BITMAPS, true);
                covered
            })?;
            if !covered {
                // outside the bitmap ranges, these exit unconditionally anyway
                debug!("msr {msr:#x} is not covered by the msr bitmap");
            }
            Ok(())
        }
        HypercallCode::SetRdtscExiting => set(ProtectedResource::RdtscExiting, 1),
        HypercallCode::SetRdpmcExiting => set(ProtectedResource::RdpmcExiting, 1),
        HypercallCode::SetExceptionBitmap => {
            set(ProtectedResource::ExceptionBitmap, exception_bits(p1)?)
        }
        HypercallCode::EnableMovToDebugRegsExiting => {
            set(ProtectedResource::MovDebugRegsExiting, 1)
        }
        HypercallCode::EnableExternalInterruptExiting => {
            set(ProtectedResource::ExternalInterruptExiting, 1)
        }
        HypercallCode::ChangeIoBitmap => {
            let port = u32::try_from(p1).unwrap_or(u32::MAX - 1);
            let covered = ctx.with_core(core, |state| {
                let covered = state.io_bitmap.intercept(port);
                state
                    .vmcs
                    .toggle_proc_control(ProcControls::USE_IO_BITMAPS, true);
                covered
            })?;
            if covered {
                Ok(())
            } else {
                Err(HvError::HypercallFailed(
                    code.code(),
                    format!("{p1:#x} is not an io port"),
                ))
            }
        }
        HypercallCode::SetHiddenCcBreakpoint => {
            ctx.collab
                .ept
                .set_hidden_breakpoint(core, p1.into(), p2 as u32)?;
            set(
                ProtectedResource::ExceptionBitmap,
                1 << EXCEPTION_VECTOR_BREAKPOINT,
            )
        }
        HypercallCode::UnsetRdtscExiting => {
            unset(ProtectedResource::RdtscExiting, 1, PassOver::empty())
        }
        HypercallCode::DisableExternalInterruptExitingOnlyToClearInterruptCommands => unset(
            ProtectedResource::ExternalInterruptExiting,
            1,
            PassOver::INTERRUPT_EVENTS,
        ),
        HypercallCode::UnsetRdpmcExiting => {
            unset(ProtectedResource::RdpmcExiting, 1, PassOver::empty())
        }
        HypercallCode::DisableMovToDebugRegsExiting => {
            unset(ProtectedResource::MovDebugRegsExiting, 1, PassOver::empty())
        }
        HypercallCode::ResetMsrBitmapRead => on_core(&|state| state.msr_bitmap.reset(false)),
        HypercallCode::ResetMsrBitmapWrite => on_core(&|state| state.msr_bitmap.reset(true)),
        HypercallCode::ResetExceptionBitmapOnlyOnClearingExceptionEvents => {
            ctx.with_core(core, |state| {
                arbiter::reset(
                    state,
                    ProtectedResource::ExceptionBitmap,
                    PassOver::EXCEPTION_EVENTS,
                    ctx,
                )
            })
        }
        HypercallCode::ResetIoBitmap => on_core(&|state| state.io_bitmap.reset()),
        HypercallCode::EnableMovToCr3Exiting => set(ProtectedResource::MovToCr3Exiting, 1),
        HypercallCode::DisableMovToCr3Exiting => {
            unset(ProtectedResource::MovToCr3Exiting, 1, PassOver::empty())
        }
        HypercallCode::UnsetExceptionBitmap => unset(
            ProtectedResource::ExceptionBitmap,
            exception_bits(p1)?,
            PassOver::empty(),
        ),
        HypercallCode::SetVmEntryLoadDebugControls
        | HypercallCode::UnsetVmEntryLoadDebugControls => {
            let on = code == HypercallCode::SetVmEntryLoadDebugControls;
            on_core(&|state| {
                let mut controls = state.vmcs.entry_controls();
                controls.set(EntryControls::LOAD_DEBUG_CONTROLS, on);
                state.vmcs.set_entry_controls(controls);
            })
        }
        HypercallCode::SetVmExitSaveDebugControls
        | HypercallCode::UnsetVmExitSaveDebugControls => {
            let on = code == HypercallCode::SetVmExitSaveDebugControls;
            on_core(&|state| {
                let mut controls = state.vmcs.exit_controls();
                controls.set(ExitControls::SAVE_DEBUG_CONTROLS, on);
                state.vmcs.set_exit_controls(controls);
            })
        }
        HypercallCode::VmExitHaltSystem => {
            ctx.halt
                .break_to_debugger(ctx, core, regs, PausingReason::RequestFromDebugger);
            Ok(())
        }
        HypercallCode::SetVmExitOnNmis | HypercallCode::UnsetVmExitOnNmis => {
            let on = code == HypercallCode::SetVmExitOnNmis;
            on_core(&|state| {
                let mut controls = state.vmcs.pin_controls();
                controls.set(PinControls::NMI_EXITING, on);
                state.vmcs.set_pin_controls(controls);
            })
        }
        HypercallCode::SignalDebuggerExecutionFinished => {
            ctx.halt.break_to_debugger(
                ctx,
                core,
                regs,
                PausingReason::CommandExecutionFinished,
            );
            Ok(())
        }
        HypercallCode::SendMessagesToDebugger | HypercallCode::SendGeneralBufferToDebugger => {
            let kind = if code == HypercallCode::SendMessagesToDebugger {
                MessageKind::Message
            } else {
                MessageKind::GeneralBuffer
            };
            let buf = read_guest_buffer(ctx, core, p1, p2)?;
            ctx.collab.transport.send_buffer(kind, &buf, true)
        }
        HypercallCode::VmExitHaltSystemAsAResultOfTriggeringEvent => {
            ctx.halt.break_to_debugger(
                ctx,
                core,
                regs,
                PausingReason::EventTriggered {
                    tag: p1,
                    context: p2,
                },
            );
            Ok(())
        }
        HypercallCode::DisableRdtscExitingOnlyForTscEvents => {
            unset(ProtectedResource::RdtscExiting, 1, PassOver::TSC_EVENTS)
        }
        HypercallCode::DisableMovToHwDrExitingOnlyForDrEvents => {
            unset(ProtectedResource::MovDebugRegsExiting, 1, PassOver::DR_EVENTS)
        }
        HypercallCode::EnableMovToControlRegsExiting => {
            let resource = cr_resource(p1)?;
            set(resource, cr_bits(resource, p2))
        }
        HypercallCode::DisableMovToControlRegsExiting => {
            let resource = cr_resource(p1)?;
            unset(resource, cr_bits(resource, p2), PassOver::empty())
        }
        HypercallCode::DisableMovToCrExitingOnlyForCrEvents => {
            let resource = cr_resource(p1)?;
            unset(resource, cr_bits(resource, p2), PassOver::CR_EVENTS)
        }
    }
}

//! # VM-exit classifier
//!
//! [`handle_vmexit`] is the entry point of the engine. The VM-exit stub of the hypervisor
//! calls it with the saved general purpose registers after every exit. It decodes the exit
//! reason, offers the exit to the debugger (events, the halt machine and the user debugger)
//! and then does the default handling: emulate the instruction, or put the interrupt or
//! exception back into the guest.
//!
//! No core lock is held while an event fires or a core halts.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::consts::{
    EXCEPTION_VECTOR_BREAKPOINT, EXCEPTION_VECTOR_DEBUG_BREAKPOINT, EXCEPTION_VECTOR_PAGE_FAULT,
    EXCEPTION_VECTOR_UNDEFINED_OPCODE, PAGE_FAULT_ERROR_USER_FETCH, RFLAGS_IF,
};
use crate::context::HvContext;
use crate::errors::Result;
use crate::event::{EventType, TriggerContext};
use crate::halt::PausingReason;
use crate::hypercall;
use crate::injection::{self, InterruptionType};
use crate::regs::{GuestRegs, Register};
use crate::state::PageFaultRange;
use crate::syscall;
use crate::vmcs::{ExitReason, Interruptibility, ProcControls, VmcsExt, VmcsField};
use crate::{Addr, CoreId};

/// An `in` or `out`, decoded from the exit qualification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoAccess {
    pub port: u16,
    /// Access size in bytes
    pub size: u8,
    pub is_in: bool,
    pub string: bool,
    pub rep: bool,
}

impl IoAccess {
    pub fn from_qualification(q: u64) -> Self {
        Self {
            size: (q & 0b111) as u8 + 1,
            is_in: q & (1 << 3) != 0,
            string: q & (1 << 4) != 0,
            rep: q & (1 << 5) != 0,
            port: (q >> 16) as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrAccessKind {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// A control register access, decoded from the exit qualification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrAccess {
    pub cr: u8,
    pub kind: CrAccessKind,
    pub register: Register,
}

impl CrAccess {
    pub fn from_qualification(q: u64) -> Self {
        let kind = match (q >> 4) & 0b11 {
            0 => CrAccessKind::MovToCr,
            1 => CrAccessKind::MovFromCr,
            2 => CrAccessKind::Clts,
            _ => CrAccessKind::Lmsw,
        };
        Self {
            cr: (q & 0xf) as u8,
            kind,
            register: GuestRegs::by_index(((q >> 8) & 0xf) as u8),
        }
    }
}

/// A debug register access, decoded from the exit qualification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrAccess {
    pub dr: u8,
    pub to_dr: bool,
    pub register: Register,
}

impl DrAccess {
    pub fn from_qualification(q: u64) -> Self {
        Self {
            dr: (q & 0b111) as u8,
            to_dr: q & (1 << 4) == 0,
            register: GuestRegs::by_index(((q >> 8) & 0xf) as u8),
        }
    }
}

/// What happened during one exit, for the caller and for tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    /// `None` for a reason the classifier does not know
    pub reason: Option<ExitReason>,
    pub rip_advanced: bool,
    /// Something will be injected on the next entry
    pub injected: bool,
    /// An event action asked to skip the default handling
    pub short_circuited: bool,
}

/// Fire `event_type` for the current exit of `core`, true if an action short-circuited it
pub(crate) fn fire(
    ctx: &HvContext,
    core: CoreId,
    regs: &mut GuestRegs,
    event_type: EventType,
    context: u64,
) -> bool {
    let rip = ctx
        .with_core(core, |state| state.vmcs.guest_rip())
        .unwrap_or_default();
    let mut tctx = TriggerContext {
        core,
        process: ctx.collab.guest.current_process(core),
        thread: ctx.collab.guest.current_thread(core),
        rip,
        context,
        regs,
        short_circuit: false,
    };
    let status = ctx.trigger(event_type, &mut tctx);
    trace!("core {core}: {event_type} ({context:#x}) {status:?}");
    tctx.short_circuit
}

/// Handle one VM-exit of `core`
///
/// # Errors
///
/// Fails only if `core` is not virtualized. Problems inside single handlers are logged
/// and the guest continues.
pub fn handle_vmexit(ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) -> Result<ExitOutcome> {
    let (raw, qualification) = ctx.with_core(core, |state| {
        // the processor clears the valid bit of the entry interruption field on every exit
        state.vmcs.write(VmcsField::EntryInterruptionInfo, 0);
        (
            state.vmcs.read(VmcsField::ExitReason),
            state.vmcs.read(VmcsField::ExitQualification),
        )
    })?;
    let reason = ExitReason::from_raw(raw);
    ctx.with_core(core, |state| {
        state.increment_rip = reason.is_some_and(ExitReason::advances_rip);
    })?;

    let mut outcome = ExitOutcome {
        reason,
        ..Default::default()
    };
    let Some(reason) = reason else {
        warn!("core {core}: unhandled exit reason {raw:#x}");
        return Ok(outcome);
    };
    trace!("core {core}: exit {reason:?}");

    match reason {
        ExitReason::ExceptionOrNmi => handle_exception(ctx, core, regs, qualification, &mut outcome)?,
        ExitReason::ExternalInterrupt => handle_external_interrupt(ctx, core, regs, &mut outcome)?,
        ExitReason::InterruptWindow => handle_interrupt_window(ctx, core)?,
        ExitReason::NmiWindow => handle_nmi_window(ctx, core)?,
        ExitReason::MonitorTrapFlag => handle_mtf(ctx, core, regs)?,
        ExitReason::TripleFault => error!("core {core}: the guest triple faulted"),
        ExitReason::EptMisconfiguration => {
            error!("core {core}: ept misconfiguration at {qualification:#x}")
        }
        ExitReason::EptViolation => {
            let (physical, linear) = ctx.with_core(core, |state| {
                (
                    state.vmcs.read(VmcsField::GuestPhysicalAddress),
                    state.vmcs.read(VmcsField::GuestLinearAddress),
                )
            })?;
            match ctx
                .collab
                .ept
                .handle_violation(core, physical, Addr::from(linear))
            {
                Some(hit) => {
                    outcome.short_circuited = fire(ctx, core, regs, hit.event_type, hit.context);
                }
                None => trace!("core {core}: ept violation at {physical:#x} is not a hook"),
            }
        }
        ExitReason::Cpuid => {
            if !ctx.handle_spin_trap(core, regs) {
                let leaf = regs.rax;
                outcome.short_circuited =
                    fire(ctx, core, regs, EventType::CpuidInstructionExecution, leaf);
                if !outcome.short_circuited {
                    ctx.collab.emulator.cpuid(core, regs);
                }
            }
        }
        ExitReason::Rdtsc | ExitReason::Rdtscp => {
            let with_aux = reason == ExitReason::Rdtscp;
            outcome.short_circuited = fire(
                ctx,
                core,
                regs,
                EventType::TscInstructionExecution,
                u64::from(with_aux),
            );
            if !outcome.short_circuited {
                ctx.collab.emulator.rdtsc(core, regs, with_aux);
            }
        }
        ExitReason::Rdpmc => {
            outcome.short_circuited = fire(ctx, core, regs, EventType::PmcInstructionExecution, 0);
            if !outcome.short_circuited {
                ctx.collab.emulator.rdpmc(core, regs);
            }
        }
        ExitReason::Rdmsr => {
            let msr = regs.rcx;
            outcome.short_circuited =
                fire(ctx, core, regs, EventType::RdmsrInstructionExecution, msr);
            if !outcome.short_circuited {
                ctx.collab.emulator.rdmsr(core, regs);
            }
        }
        ExitReason::Wrmsr => {
            let msr = regs.rcx;
            outcome.short_circuited =
                fire(ctx, core, regs, EventType::WrmsrInstructionExecution, msr);
            if !outcome.short_circuited {
                ctx.collab.emulator.wrmsr(core, regs);
            }
        }
        ExitReason::IoInstruction => {
            let access = IoAccess::from_qualification(qualification);
            let event_type = if access.is_in {
                EventType::InInstructionExecution
            } else {
                EventType::OutInstructionExecution
            };
            outcome.short_circuited = fire(ctx, core, regs, event_type, access.port as u64);
            if !outcome.short_circuited {
                ctx.collab.emulator.io(core, regs, access);
            }
        }
        ExitReason::CrAccess => {
            let access = CrAccess::from_qualification(qualification);
            if access.kind == CrAccessKind::MovToCr {
                outcome.short_circuited = fire(
                    ctx,
                    core,
                    regs,
                    EventType::ControlRegisterModified,
                    access.cr as u64,
                );
            }
            if !outcome.short_circuited {
                ctx.with_core(core, |state| {
                    ctx.collab.emulator.control_register_access(
                        core,
                        state.vmcs.as_mut(),
                        regs,
                        access,
                    )
                })?;
            }
            if access.cr == 3 && access.kind == CrAccessKind::MovToCr {
                ctx.check_process_switch(core, regs);
                ctx.check_thread_intercept(core, regs);
            }
        }
        ExitReason::DrAccess => {
            let access = DrAccess::from_qualification(qualification);
            outcome.short_circuited = fire(
                ctx,
                core,
                regs,
                EventType::DebugRegistersAccessed,
                access.dr as u64,
            );
            if !outcome.short_circuited {
                ctx.collab.emulator.debug_register_access(core, regs, access);
            }
        }
        ExitReason::Vmcall => {
            let call = regs.rcx;
            outcome.short_circuited =
                fire(ctx, core, regs, EventType::VmcallInstructionExecution, call);
            if !outcome.short_circuited {
                hypercall::handle_vmcall(ctx, core, regs);
            }
        }
        ExitReason::Hlt | ExitReason::Invd | ExitReason::Xsetbv => {
            trace!("core {core}: {reason:?} passes through");
        }
    }

    ctx.with_core(core, |state| {
        if state.increment_rip {
            let len = state.vmcs.exit_instruction_length();
            let rip = state.vmcs.guest_rip();
            state.vmcs.set_guest_rip(rip.wrapping_add(len));
            outcome.rip_advanced = true;
        }
        outcome.injected =
            injection::InterruptionInfo::from_raw(state.vmcs.read(VmcsField::EntryInterruptionInfo) as u32)
                .valid();
    })?;
    Ok(outcome)
}

fn handle_exception(
    ctx: &HvContext,
    core: CoreId,
    regs: &mut GuestRegs,
    qualification: u64,
    outcome: &mut ExitOutcome,
) -> Result<()> {
    let (info, stepping) = ctx.with_core(core, |state| {
        (
            injection::exit_interruption(state.vmcs.as_ref()),
            state.is_stepping(),
        )
    })?;

    if info.kind() == InterruptionType::Nmi {
        if ctx.halt.halt_on_nmi(ctx, core, regs) {
            return Ok(());
        }
        if stepping {
            trace!("core {core}: dropping an nmi while stepping");
            return Ok(());
        }
        return ctx.with_core(core, |state| {
            if state
                .vmcs
                .interruptibility()
                .contains(Interruptibility::BLOCKING_BY_NMI)
            {
                state.queued_nmis += 1;
                state
                    .vmcs
                    .toggle_proc_control(ProcControls::NMI_WINDOW_EXITING, true);
            } else {
                injection::reinject(state.vmcs.as_mut());
            }
        });
    }

    if stepping {
        trace!("core {core}: exception {} during a step", info.vector());
        return Ok(());
    }

    let vector = info.vector();
    if fire(ctx, core, regs, EventType::ExceptionOccurred, vector as u64) {
        outcome.short_circuited = true;
        return Ok(());
    }

    match vector {
        EXCEPTION_VECTOR_BREAKPOINT => {
            let rip = ctx.with_core(core, |state| {
                state.suppress_rip_increment();
                Addr::from(state.vmcs.guest_rip())
            })?;
            if let Some(hit) = ctx.collab.ept.check_breakpoint(core, rip) {
                debug!("core {core}: hidden breakpoint at {rip}");
                outcome.short_circuited = fire(ctx, core, regs, hit.event_type, hit.context);
                return Ok(());
            }
            if ctx.features.kernel_debugger_active() {
                ctx.halt
                    .break_to_debugger(ctx, core, regs, PausingReason::SoftwareBreakpointHit);
                return Ok(());
            }
            ctx.with_core(core, |state| injection::inject_breakpoint(state.vmcs.as_mut()))
        }
        EXCEPTION_VECTOR_UNDEFINED_OPCODE => {
            if !syscall::handle_ud(ctx, core, regs)? {
                ctx.with_core(core, |state| {
                    injection::inject_undefined_opcode(state.vmcs.as_mut())
                })?;
            }
            Ok(())
        }
        EXCEPTION_VECTOR_PAGE_FAULT => {
            if ctx.check_thread_intercept(core, regs) {
                return Ok(());
            }
            ctx.with_core(core, |state| {
                state.vmcs.set_guest_cr2(qualification);
                injection::reinject(state.vmcs.as_mut());
            })
        }
        EXCEPTION_VECTOR_DEBUG_BREAKPOINT => {
            if ctx.handle_user_debug_exception(core, regs) || ctx.check_thread_switch(core, regs) {
                return Ok(());
            }
            if ctx.features.kernel_debugger_active() {
                ctx.halt.break_to_debugger(
                    ctx,
                    core,
                    regs,
                    PausingReason::HardwareDebugBreakpointHit,
                );
                return Ok(());
            }
            ctx.with_core(core, |state| injection::reinject(state.vmcs.as_mut()))
        }
        _ => ctx.with_core(core, |state| injection::reinject(state.vmcs.as_mut())),
    }
}

fn handle_external_interrupt(
    ctx: &HvContext,
    core: CoreId,
    regs: &mut GuestRegs,
    outcome: &mut ExitOutcome,
) -> Result<()> {
    ctx.check_process_switch(core, regs);
    ctx.check_thread_switch(core, regs);

    let info = ctx.with_core(core, |state| injection::exit_interruption(state.vmcs.as_ref()))?;
    if fire(
        ctx,
        core,
        regs,
        EventType::ExternalInterruptOccurred,
        info.vector() as u64,
    ) {
        outcome.short_circuited = true;
        return Ok(());
    }

    let suppress = ctx.features.interrupts_suppressed_while_stepping();
    ctx.with_core(core, |state| {
        if suppress && state.instrumentation_step {
            if let Err(e) = state.pending.insert(info) {
                warn!("core {core}: {e}");
            }
            state.suppress_rip_increment();
            return;
        }
        let interruptible = state.vmcs.guest_rflags() & RFLAGS_IF != 0
            && !state
                .vmcs
                .interruptibility()
                .intersects(Interruptibility::BLOCKING_BY_STI | Interruptibility::BLOCKING_BY_MOV_SS);
        if interruptible {
            injection::reinject(state.vmcs.as_mut());
        } else {
            if let Err(e) = state.pending.insert(info) {
                warn!("core {core}: {e}");
            }
            state
                .vmcs
                .toggle_proc_control(ProcControls::INTERRUPT_WINDOW_EXITING, true);
        }
    })
}

fn handle_interrupt_window(ctx: &HvContext, core: CoreId) -> Result<()> {
    ctx.with_core(core, |state| {
        state.suppress_rip_increment();

        let mut injected = false;
        if let Some(mut range) = state.page_fault_range.take() {
            if let Some(address) = range.advance() {
                injection::inject_page_fault(state.vmcs.as_mut(), address.u64(), range.error_code);
                injected = true;
            }
            if !range.is_done() {
                state.page_fault_range = Some(range);
            }
        }
        if !injected {
            if let Some(info) = state.pending.take() {
                injection::inject_raw(state.vmcs.as_mut(), info);
            }
        }

        if state.page_fault_range.is_none() && state.pending.is_empty() {
            state
                .vmcs
                .toggle_proc_control(ProcControls::INTERRUPT_WINDOW_EXITING, false);
        }
    })
}

fn handle_nmi_window(ctx: &HvContext, core: CoreId) -> Result<()> {
    ctx.with_core(core, |state| {
        state.suppress_rip_increment();
        if state.queued_nmis > 0 {
            state.queued_nmis -= 1;
            injection::inject_nmi(state.vmcs.as_mut());
        }
        if state.queued_nmis == 0 {
            state
                .vmcs
                .toggle_proc_control(ProcControls::NMI_WINDOW_EXITING, false);
        }
    })
}

fn handle_mtf(ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) -> Result<()> {
    let completed = ctx.with_core(core, |state| {
        state.suppress_rip_increment();
        state
            .vmcs
            .toggle_proc_control(ProcControls::MONITOR_TRAP_FLAG, false);
        let completed = state.instrumentation_step && state.break_on_mtf;
        state.instrumentation_step = false;
        state.break_on_mtf = false;
        state.masking_events = false;
        if !state.pending.is_empty() {
            state
                .vmcs
                .toggle_proc_control(ProcControls::INTERRUPT_WINDOW_EXITING, true);
        }
        completed
    })?;
    if completed {
        ctx.halt
            .break_to_debugger(ctx, core, regs, PausingReason::InstrumentationStepCompleted);
    }
    Ok(())
}

impl HvContext {
    /// Bring `[start, end]` of the current process into memory
    ///
    /// One page fault per page is injected, each in its own interrupt window.
    pub fn request_page_in(&self, core: CoreId, start: Addr, end: Addr, error_code: Option<u32>) -> Result<()> {
        self.with_core(core, |state| {
            state.page_fault_range = Some(PageFaultRange {
                next: start,
                end,
                error_code: error_code.unwrap_or(PAGE_FAULT_ERROR_USER_FETCH),
            });
            state
                .vmcs
                .toggle_proc_control(ProcControls::INTERRUPT_WINDOW_EXITING, true);
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::HvConfig;
    use crate::consts::{
        EXCEPTION_VECTOR_GENERAL_PROTECTION, HV_STATUS_SUCCESS, HYPERCALL_MAGIC_R10,
        HYPERCALL_MAGIC_R11, HYPERCALL_MAGIC_R12,
    };
    use crate::event::{ActionKindRequest, EventRequest};
    use crate::extension_points::{EptHit, MessageKind};
    use crate::halt::ResumeCommand;
    use crate::injection::InterruptionInfo;
    use crate::sim::{run_exit, EmulatedCall, SimMachine, SyntheticExit, SIM_SCRIPT_SHORT_CIRCUIT};

    fn machine() -> SimMachine {
        SimMachine::new(HvConfig::default())
    }

    fn entry_info(machine: &SimMachine, core: CoreId) -> InterruptionInfo {
        machine
            .ctx
            .with_core(core, |c| {
                InterruptionInfo::from_raw(c.vmcs.read(VmcsField::EntryInterruptionInfo) as u32)
            })
            .unwrap()
    }

    fn controls(machine: &SimMachine, core: CoreId) -> ProcControls {
        machine
            .ctx
            .with_core(core, |c| c.vmcs.proc_controls())
            .unwrap()
    }

    fn short_circuit(event_type: EventType, p1: u64) -> EventRequest {
        EventRequest::new(event_type)
            .with_params(p1, 0)
            .with_action(ActionKindRequest::RunScript {
                script: SIM_SCRIPT_SHORT_CIRCUIT.to_vec(),
                scratch_size: 0,
            })
    }

    #[test]
    fn test_decode_qualifications() {
        // in al, 0x60
        let io = IoAccess::from_qualification((0x60 << 16) | (1 << 3));
        assert_eq!(io.port, 0x60);
        assert_eq!(io.size, 1);
        assert!(io.is_in && !io.string && !io.rep);
        // rep outsd to 0x3f8
        let io = IoAccess::from_qualification((0x3f8 << 16) | (1 << 5) | (1 << 4) | 3);
        assert_eq!(io.size, 4);
        assert!(!io.is_in && io.string && io.rep);

        // mov cr3, rbx
        let cr = CrAccess::from_qualification(3 | (3 << 8));
        assert_eq!(cr.cr, 3);
        assert_eq!(cr.kind, CrAccessKind::MovToCr);
        assert_eq!(cr.register, Register::rbx);
        assert_eq!(CrAccess::from_qualification(2 << 4).kind, CrAccessKind::Clts);

        // mov rax, dr7
        let dr = DrAccess::from_qualification(7 | (1 << 4));
        assert_eq!(dr.dr, 7);
        assert!(!dr.to_dr);
        assert_eq!(dr.register, Register::rax);
    }

    #[test]
    fn test_cpuid_is_emulated_and_skipped() {
        let machine = machine();
        let mut regs = GuestRegs {
            rax: 1,
            ..Default::default()
        };
        let outcome = machine
            .exit(0, &SyntheticExit::instruction(ExitReason::Cpuid, 0x1000, 2), &mut regs)
            .unwrap();
        assert!(outcome.rip_advanced);
        assert_eq!(machine.emulator.calls(), vec![EmulatedCall::Cpuid(0)]);
        assert_eq!(machine.ctx.with_core(0, |c| c.vmcs.guest_rip()).unwrap(), 0x1002);
    }

    #[test]
    fn test_short_circuit_skips_emulation_but_not_the_instruction() {
        let machine = machine();
        machine
            .ctx
            .register(short_circuit(EventType::RdmsrInstructionExecution, 0xc000_0082))
            .unwrap();
        let mut regs = GuestRegs {
            rcx: 0xc000_0082,
            ..Default::default()
        };
        let outcome = machine
            .exit(1, &SyntheticExit::instruction(ExitReason::Rdmsr, 0x2000, 2), &mut regs)
            .unwrap();
        assert!(outcome.short_circuited);
        assert!(outcome.rip_advanced);
        assert!(machine.emulator.calls().is_empty());

        regs.rcx = 0x10;
        machine
            .exit(1, &SyntheticExit::instruction(ExitReason::Rdmsr, 0x2000, 2), &mut regs)
            .unwrap();
        assert_eq!(machine.emulator.calls(), vec![EmulatedCall::Rdmsr(1)]);
    }

    #[test]
    fn test_io_event_gets_port() {
        let machine = machine();
        machine
            .ctx
            .register(
                EventRequest::new(EventType::InInstructionExecution)
                    .with_params(0x60, 0)
                    .with_action(ActionKindRequest::LogState),
            )
            .unwrap();
        let exit = SyntheticExit::instruction(ExitReason::IoInstruction, 0x3000, 2)
            .with_qualification((0x60 << 16) | (1 << 3));
        let mut regs = GuestRegs::default();
        machine.exit(0, &exit, &mut regs).unwrap();
        assert_eq!(machine.transport.buffers()[0].0, MessageKind::StateRecord);
        assert!(matches!(
            machine.emulator.calls()[0],
            EmulatedCall::Io(0, IoAccess { port: 0x60, .. })
        ));
    }

    #[test]
    fn test_unknown_reason_is_logged() {
        let machine = machine();
        let mut regs = GuestRegs::default();
        let outcome = machine
            .exit(0, &SyntheticExit::raw(0x3f), &mut regs)
            .unwrap();
        assert_eq!(outcome.reason, None);
        assert!(machine.exit(9, &SyntheticExit::raw(0), &mut regs).is_err());
    }

    #[test]
    fn test_external_interrupt_delivery() {
        let machine = machine();
        let mut regs = GuestRegs::default();
        let timer = InterruptionInfo::new(0xd1, InterruptionType::ExternalInterrupt, false);

        let outcome = machine
            .exit(0, &SyntheticExit::interrupt(timer).with_rflags(RFLAGS_IF), &mut regs)
            .unwrap();
        assert!(outcome.injected);
        assert_eq!(entry_info(&machine, 0), timer);

        // interrupts disabled, the vector waits for the window
        let outcome = machine
            .exit(0, &SyntheticExit::interrupt(timer).with_rflags(0), &mut regs)
            .unwrap();
        assert!(!outcome.injected);
        assert!(controls(&machine, 0).contains(ProcControls::INTERRUPT_WINDOW_EXITING));
        assert_eq!(machine.ctx.with_core(0, |c| c.pending.len()).unwrap(), 1);

        let outcome = machine
            .exit(0, &SyntheticExit::raw(ExitReason::InterruptWindow as u64), &mut regs)
            .unwrap();
        assert!(outcome.injected);
        assert!(!outcome.rip_advanced);
        assert_eq!(entry_info(&machine, 0), timer);
        assert!(!controls(&machine, 0).contains(ProcControls::INTERRUPT_WINDOW_EXITING));
    }

    #[test]
    fn test_interrupts_wait_while_stepping() {
        let machine = machine();
        machine
            .ctx
            .with_core(2, |c| {
                c.instrumentation_step = true;
                c.vmcs.toggle_proc_control(ProcControls::MONITOR_TRAP_FLAG, true);
            })
            .unwrap();
        let mut regs = GuestRegs::default();
        let timer = InterruptionInfo::new(0xd1, InterruptionType::ExternalInterrupt, false);
        let outcome = machine
            .exit(2, &SyntheticExit::interrupt(timer).with_rflags(RFLAGS_IF), &mut regs)
            .unwrap();
        assert!(!outcome.injected);

        // no break requested, the step just ends and the window opens
        machine
            .exit(2, &SyntheticExit::raw(ExitReason::MonitorTrapFlag as u64), &mut regs)
            .unwrap();
        let controls = controls(&machine, 2);
        assert!(!controls.contains(ProcControls::MONITOR_TRAP_FLAG));
        assert!(controls.contains(ProcControls::INTERRUPT_WINDOW_EXITING));
        assert!(!machine.ctx.with_core(2, |c| c.is_stepping()).unwrap());
    }

    #[test]
    fn test_completed_step_halts() {
        let machine = machine();
        machine
            .ctx
            .with_core(1, |c| {
                c.instrumentation_step = true;
                c.break_on_mtf = true;
            })
            .unwrap();
        let ctx = Arc::clone(&machine.ctx);
        let stepped = thread::spawn(move || {
            let mut regs = GuestRegs::default();
            let mtf = SyntheticExit::raw(ExitReason::MonitorTrapFlag as u64);
            run_exit(&ctx, 1, &mtf, &mut regs)
        });
        while machine.ctx.halt().owner() != Some(1) {
            thread::yield_now();
        }
        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        stepped.join().unwrap().unwrap();
        assert_eq!(
            machine.transport.notices()[0].reason,
            PausingReason::InstrumentationStepCompleted
        );
    }

    #[test]
    fn test_breakpoint_goes_back_to_guest() {
        let machine = machine();
        let bp = InterruptionInfo::new(3, InterruptionType::SoftwareException, false);
        let mut regs = GuestRegs::default();
        let outcome = machine
            .exit(0, &SyntheticExit::exception(bp, 0x4000, 1), &mut regs)
            .unwrap();
        assert!(!outcome.rip_advanced);
        assert_eq!(entry_info(&machine, 0), bp);
        assert_eq!(
            machine
                .ctx
                .with_core(0, |c| c.vmcs.read(VmcsField::EntryInstructionLength))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_hidden_breakpoint_fires_its_event() {
        let machine = machine();
        machine
            .ctx
            .register(
                EventRequest::new(EventType::HiddenHookExecCc)
                    .with_params(0x7ff6_0000_4000, 0)
                    .with_action(ActionKindRequest::LogState),
            )
            .unwrap();
        let bp = InterruptionInfo::new(3, InterruptionType::SoftwareException, false);
        let mut regs = GuestRegs::default();
        let outcome = machine
            .exit(0, &SyntheticExit::exception(bp, 0x7ff6_0000_4000, 1), &mut regs)
            .unwrap();
        assert!(!outcome.injected);
        assert_eq!(machine.transport.buffers().len(), 1);
    }

    #[test]
    fn test_page_fault_restores_cr2() {
        let machine = machine();
        let pf = InterruptionInfo::new(14, InterruptionType::HardwareException, true);
        let mut regs = GuestRegs::default();
        let exit = SyntheticExit::exception(pf, 0x4000, 0)
            .with_qualification(0xdead_b000)
            .with_error_code(6);
        machine.exit(3, &exit, &mut regs).unwrap();
        machine
            .ctx
            .with_core(3, |c| {
                assert_eq!(c.vmcs.guest_cr2(), 0xdead_b000);
                assert_eq!(c.vmcs.read(VmcsField::EntryExceptionErrorCode), 6);
            })
            .unwrap();
        assert_eq!(entry_info(&machine, 3), pf);
    }

    #[test]
    fn test_exception_event_short_circuit_drops_exception() {
        let machine = machine();
        machine
            .ctx
            .register(short_circuit(
                EventType::ExceptionOccurred,
                EXCEPTION_VECTOR_GENERAL_PROTECTION as u64,
            ))
            .unwrap();
        let gp = InterruptionInfo::new(13, InterruptionType::HardwareException, true);
        let mut regs = GuestRegs::default();
        let outcome = machine
            .exit(0, &SyntheticExit::exception(gp, 0x5000, 0), &mut regs)
            .unwrap();
        assert!(outcome.short_circuited);
        assert!(!outcome.injected);

        // other vectors still reach the guest
        let de = InterruptionInfo::new(0, InterruptionType::HardwareException, false);
        let outcome = machine
            .exit(0, &SyntheticExit::exception(de, 0x5000, 0), &mut regs)
            .unwrap();
        assert!(outcome.injected);
    }

    #[test]
    fn test_exceptions_are_left_alone_while_stepping() {
        let machine = machine();
        machine.ctx.with_core(0, |c| c.break_on_mtf = true).unwrap();
        let mut regs = GuestRegs::default();
        let gp = InterruptionInfo::new(13, InterruptionType::HardwareException, true);
        let outcome = machine
            .exit(0, &SyntheticExit::exception(gp, 0x5000, 0), &mut regs)
            .unwrap();
        assert!(!outcome.injected);

        let nmi = InterruptionInfo::new(2, InterruptionType::Nmi, false);
        let outcome = machine
            .exit(0, &SyntheticExit::exception(nmi, 0x5000, 0), &mut regs)
            .unwrap();
        assert!(!outcome.injected);
    }

    #[test]
    fn test_blocked_nmis_wait_for_the_window() {
        let machine = machine();
        let nmi = InterruptionInfo::new(2, InterruptionType::Nmi, false);
        let mut regs = GuestRegs::default();
        let blocked = SyntheticExit::exception(nmi, 0x5000, 0)
            .with_interruptibility(Interruptibility::BLOCKING_BY_NMI);
        machine.exit(1, &blocked, &mut regs).unwrap();
        machine.exit(1, &blocked, &mut regs).unwrap();
        assert_eq!(machine.ctx.with_core(1, |c| c.queued_nmis).unwrap(), 2);
        assert!(controls(&machine, 1).contains(ProcControls::NMI_WINDOW_EXITING));

        let window = SyntheticExit::raw(ExitReason::NmiWindow as u64);
        assert!(machine.exit(1, &window, &mut regs).unwrap().injected);
        assert!(controls(&machine, 1).contains(ProcControls::NMI_WINDOW_EXITING));
        assert!(machine.exit(1, &window, &mut regs).unwrap().injected);
        assert!(!controls(&machine, 1).contains(ProcControls::NMI_WINDOW_EXITING));
        assert_eq!(entry_info(&machine, 1), nmi);
    }

    #[test]
    fn test_page_in_range_injects_one_fault_per_window() {
        let machine = machine();
        machine
            .ctx
            .request_page_in(0, Addr::from(0x7000u64), Addr::from(0x8fffu64), None)
            .unwrap();
        let window = SyntheticExit::raw(ExitReason::InterruptWindow as u64);
        let mut regs = GuestRegs::default();
        let mut faults = Vec::new();
        for _ in 0..3 {
            if machine.exit(0, &window, &mut regs).unwrap().injected {
                faults.push(machine.ctx.with_core(0, |c| c.vmcs.guest_cr2()).unwrap());
            }
        }
        assert_eq!(faults, vec![0x7000, 0x8000]);
        assert!(!controls(&machine, 0).contains(ProcControls::INTERRUPT_WINDOW_EXITING));
    }

    #[test]
    fn test_ept_violation_fires_hook_event() {
        let machine = machine();
        machine
            .ctx
            .register(
                EventRequest::new(EventType::HiddenHookWrite)
                    .with_params(0x7ff6_0000_6000, 0x7ff6_0000_6100)
                    .with_action(ActionKindRequest::LogState),
            )
            .unwrap();
        machine.ept.add_violation(
            0x1_2345_6010,
            EptHit {
                event_type: EventType::HiddenHookWrite,
                context: 0x7ff6_0000_6010,
            },
        );
        let exit = SyntheticExit::raw(ExitReason::EptViolation as u64)
            .with_addresses(0x1_2345_6010, 0x7ff6_0000_6010);
        let mut regs = GuestRegs::default();
        let outcome = machine.exit(0, &exit, &mut regs).unwrap();
        assert!(!outcome.rip_advanced);
        assert_eq!(machine.transport.buffers().len(), 1);
    }

    #[test]
    fn test_vmcall_reaches_dispatcher() {
        let machine = machine();
        let mut regs = GuestRegs {
            rcx: 0x0c,
            r10: HYPERCALL_MAGIC_R10,
            r11: HYPERCALL_MAGIC_R11,
            r12: HYPERCALL_MAGIC_R12,
            ..Default::default()
        };
        let outcome = machine
            .exit(0, &SyntheticExit::instruction(ExitReason::Vmcall, 0x6000, 3), &mut regs)
            .unwrap();
        assert!(outcome.rip_advanced);
        assert_eq!(regs.rax, HV_STATUS_SUCCESS);
        assert!(controls(&machine, 0).contains(ProcControls::RDTSC_EXITING));
    }

    #[test]
    fn test_cr3_write_checks_process_switch() {
        let machine = machine();
        machine
            .ctx
            .register(
                EventRequest::new(EventType::ControlRegisterModified)
                    .with_params(3, 0)
                    .with_action(ActionKindRequest::LogState),
            )
            .unwrap();
        let exit = SyntheticExit::instruction(ExitReason::CrAccess, 0x7000, 3).with_qualification(3);
        let mut regs = GuestRegs::default();
        machine.exit(0, &exit, &mut regs).unwrap();
        assert_eq!(machine.transport.buffers().len(), 1);
        assert!(matches!(
            machine.emulator.calls()[0],
            EmulatedCall::ControlRegister(0, CrAccess { cr: 3, .. })
        ));
    }
}

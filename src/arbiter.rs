//! # Protected-resource arbiter
//!
//! Several debugging features share the same VMX control bits. The exception bitmap is the
//! obvious case: exception events, the syscall hook, the kernel debugger and the user
//! debugger all want some of its vectors. A feature that is torn down must not clear a bit
//! another feature still relies on.
//!
//! The arbiter never counts users of a bit. Whenever a bit should be cleared it recomputes
//! the full set of bits that are still required from the ground truth (the enabled events,
//! the feature switches and the state of the core) and keeps those. A [`PassOver`] tells the
//! recomputation to ignore the consumer that is being torn down right now, because it is
//! still registered at that point.
//!
//! All operations work on a locked [`CoreState`].

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{
    EXCEPTION_VECTOR_BREAKPOINT, EXCEPTION_VECTOR_DEBUG_BREAKPOINT, EXCEPTION_VECTOR_PAGE_FAULT,
    EXCEPTION_VECTOR_UNDEFINED_OPCODE,
};
use crate::event::EventType;
use crate::state::{CoreState, Features};
use crate::vmcs::{ExitControls, PinControls, ProcControls, Vmcs, VmcsExt, VmcsField};
use crate::CoreId;

/// A VMX control shared between features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectedResource {
    ExceptionBitmap,
    /// Pin-based external-interrupt exiting together with acknowledge-interrupt-on-exit
    ExternalInterruptExiting,
    RdtscExiting,
    RdpmcExiting,
    MovDebugRegsExiting,
    MovToCr3Exiting,
    /// The CR0 guest/host mask
    MovToCr0,
    /// The CR4 guest/host mask
    MovToCr4,
}

bitflags! {
    /// Consumers left out of a recomputation
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PassOver: u32 {
        const EXCEPTION_EVENTS = 1 << 0;
        const INTERRUPT_EVENTS = 1 << 1;
        const TSC_EVENTS = 1 << 2;
        const PMC_EVENTS = 1 << 3;
        const DR_EVENTS = 1 << 4;
        const CR_EVENTS = 1 << 5;
        const UD_FOR_SYSCALL_SYSRET = 1 << 6;
    }
}

/// What the arbiter needs to know about the consumers of the controls
pub trait ConsumerQuery {
    /// Whether an enabled event of this type applies to `core`
    fn has_enabled_event(&self, event_type: EventType, core: CoreId) -> bool;
    /// Vectors of the enabled exception events applying to `core`, as a bitmap
    fn exception_event_vectors(&self, core: CoreId) -> u32;
    /// Union of the masks of enabled control-register events for register `cr`
    fn cr_event_mask(&self, core: CoreId, cr: u64) -> u64;
    fn has_cr_event(&self, core: CoreId, cr: u64) -> bool;
    fn features(&self) -> &Features;
    /// Number of hidden breakpoints installed through the EPT
    fn ept_breakpoints(&self) -> usize;
}

fn flag(on: bool) -> u64 {
    u64::from(on)
}

impl ProtectedResource {
    /// Every bit of the resource
    pub fn all_bits(self) -> u64 {
        match self {
            ProtectedResource::ExceptionBitmap => 0xffff_ffff,
            ProtectedResource::MovToCr0 | ProtectedResource::MovToCr4 => u64::MAX,
            _ => 1,
        }
    }

    /// Current value of the control in the VMCS
    pub fn read(self, vmcs: &dyn Vmcs) -> u64 {
        match self {
            ProtectedResource::ExceptionBitmap => vmcs.read(VmcsField::ExceptionBitmap),
            ProtectedResource::ExternalInterruptExiting => flag(
                vmcs.pin_controls()
                    .contains(PinControls::EXTERNAL_INTERRUPT_EXITING),
            ),
            ProtectedResource::RdtscExiting => {
                flag(vmcs.proc_controls().contains(ProcControls::RDTSC_EXITING))
            }
            ProtectedResource::RdpmcExiting => {
                flag(vmcs.proc_controls().contains(ProcControls::RDPMC_EXITING))
            }
            ProtectedResource::MovDebugRegsExiting => {
                flag(vmcs.proc_controls().contains(ProcControls::MOV_DR_EXITING))
            }
            ProtectedResource::MovToCr3Exiting => {
                flag(vmcs.proc_controls().contains(ProcControls::CR3_LOAD_EXITING))
            }
            ProtectedResource::MovToCr0 => vmcs.read(VmcsField::Cr0GuestHostMask),
            ProtectedResource::MovToCr4 => vmcs.read(VmcsField::Cr4GuestHostMask),
        }
    }

    pub fn write(self, vmcs: &mut dyn Vmcs, value: u64) {
        let on = value & 1 != 0;
        match self {
            ProtectedResource::ExceptionBitmap => {
                vmcs.write(VmcsField::ExceptionBitmap, value & 0xffff_ffff)
            }
            ProtectedResource::ExternalInterruptExiting => {
                let mut pin = vmcs.pin_controls();
                pin.set(PinControls::EXTERNAL_INTERRUPT_EXITING, on);
                vmcs.set_pin_controls(pin);
                let mut exit = vmcs.exit_controls();
                exit.set(ExitControls::ACK_INTERRUPT_ON_EXIT, on);
                vmcs.set_exit_controls(exit);
            }
            ProtectedResource::RdtscExiting => {
                vmcs.toggle_proc_control(ProcControls::RDTSC_EXITING, on)
            }
            ProtectedResource::RdpmcExiting => {
                vmcs.toggle_proc_control(ProcControls::RDPMC_EXITING, on)
            }
            ProtectedResource::MovDebugRegsExiting => {
                vmcs.toggle_proc_control(ProcControls::MOV_DR_EXITING, on)
            }
            ProtectedResource::MovToCr3Exiting => {
                vmcs.toggle_proc_control(ProcControls::CR3_LOAD_EXITING, on)
            }
            ProtectedResource::MovToCr0 => {
                vmcs.write(VmcsField::Cr0GuestHostMask, value);
                let cr0 = vmcs.read(VmcsField::GuestCr0);
                vmcs.write(VmcsField::Cr0ReadShadow, cr0);
            }
            ProtectedResource::MovToCr4 => {
                vmcs.write(VmcsField::Cr4GuestHostMask, value);
                let cr4 = vmcs.read(VmcsField::GuestCr4);
                vmcs.write(VmcsField::Cr4ReadShadow, cr4);
            }
        }
    }
}

/// Assert `bits` of the resource
///
/// Setting the exception bitmap also asserts every vector that is currently required, so
/// a stale bitmap heals itself on the next set.
pub fn set(core: &mut CoreState, resource: ProtectedResource, bits: u64, q: &dyn ConsumerQuery) {
    let mut value = resource.read(core.vmcs.as_ref()) | bits;
    if resource == ProtectedResource::ExceptionBitmap {
        value |= required(core, resource, PassOver::empty(), q);
    }
    resource.write(core.vmcs.as_mut(), value);
}

/// Clear `bits` of the resource, keeping those another consumer still needs
pub fn unset(
    core: &mut CoreState,
    resource: ProtectedResource,
    bits: u64,
    pass_over: PassOver,
    q: &dyn ConsumerQuery,
) {
    let current = resource.read(core.vmcs.as_ref());
    let still_needed = required(core, resource, pass_over, q) & bits;
    if still_needed != 0 {
        debug!(
            "core {}: keeping {still_needed:#x} of {resource:?}, it is still in use",
            core.core
        );
    }
    resource.write(core.vmcs.as_mut(), (current & !bits) | still_needed);
}

/// Clear everything of the resource that is not required anymore
pub fn reset(
    core: &mut CoreState,
    resource: ProtectedResource,
    pass_over: PassOver,
    q: &dyn ConsumerQuery,
) {
    unset(core, resource, resource.all_bits(), pass_over, q)
}

/// Bits of the resource some consumer needs right now
pub fn required(
    core: &CoreState,
    resource: ProtectedResource,
    pass_over: PassOver,
    q: &dyn ConsumerQuery,
) -> u64 {
    let id = core.core;
    let features = q.features();
    let event = |ty: EventType, pass: PassOver| !pass_over.contains(pass) && q.has_enabled_event(ty, id);

    match resource {
        ProtectedResource::ExceptionBitmap => {
            let mut bitmap = 0u64;
            if !pass_over.contains(PassOver::EXCEPTION_EVENTS) {
                bitmap |= q.exception_event_vectors(id) as u64;
            }
            if event(
                EventType::SyscallHookEferSyscall,
                PassOver::UD_FOR_SYSCALL_SYSRET,
            ) || event(
                EventType::SyscallHookEferSysret,
                PassOver::UD_FOR_SYSCALL_SYSRET,
            ) {
                bitmap |= 1 << EXCEPTION_VECTOR_UNDEFINED_OPCODE;
            }
            if features.kernel_debugger_active() || features.user_debugger_active() {
                bitmap |= 1 << EXCEPTION_VECTOR_BREAKPOINT;
                bitmap |= 1 << EXCEPTION_VECTOR_DEBUG_BREAKPOINT;
            }
            if features.debug_registers_interception() {
                bitmap |= 1 << EXCEPTION_VECTOR_DEBUG_BREAKPOINT;
            }
            if features.check_page_faults_and_cr3() {
                bitmap |= 1 << EXCEPTION_VECTOR_PAGE_FAULT;
            }
            if q.ept_breakpoints() > 0 {
                bitmap |= 1 << EXCEPTION_VECTOR_BREAKPOINT;
            }
            bitmap
        }
        ProtectedResource::ExternalInterruptExiting => flag(
            event(
                EventType::ExternalInterruptOccurred,
                PassOver::INTERRUPT_EVENTS,
            ) || features.intercept_clock_interrupts_for_process_change()
                || features.intercept_clock_interrupts_for_thread_change(),
        ),
        ProtectedResource::RdtscExiting => flag(
            event(EventType::TscInstructionExecution, PassOver::TSC_EVENTS)
                || features.transparent_mode(),
        ),
        ProtectedResource::RdpmcExiting => flag(event(
            EventType::PmcInstructionExecution,
            PassOver::PMC_EVENTS,
        )),
        ProtectedResource::MovDebugRegsExiting => flag(
            event(EventType::DebugRegistersAccessed, PassOver::DR_EVENTS)
                || features.debug_registers_interception(),
        ),
        ProtectedResource::MovToCr3Exiting => flag(
            core.waiting_for_mov_cr3
                || features.check_page_faults_and_cr3()
                || (!pass_over.contains(PassOver::CR_EVENTS) && q.has_cr_event(id, 3)),
        ),
        ProtectedResource::MovToCr0 | ProtectedResource::MovToCr4 => {
            if pass_over.contains(PassOver::CR_EVENTS) {
                return 0;
            }
            let cr = if resource == ProtectedResource::MovToCr0 { 0 } else { 4 };
            q.cr_event_mask(id, cr)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vmcs::SoftVmcs;

    #[derive(Default)]
    struct Consumers {
        events: Vec<EventType>,
        exception_vectors: u32,
        cr4_mask: u64,
        features: Features,
    }

    impl ConsumerQuery for Consumers {
        fn has_enabled_event(&self, event_type: EventType, _core: CoreId) -> bool {
            self.events.contains(&event_type)
        }
        fn exception_event_vectors(&self, _core: CoreId) -> u32 {
            self.exception_vectors
        }
        fn cr_event_mask(&self, _core: CoreId, cr: u64) -> u64 {
            if cr == 4 {
                self.cr4_mask
            } else {
                0
            }
        }
        fn has_cr_event(&self, _core: CoreId, cr: u64) -> bool {
            cr == 4 && self.cr4_mask != 0
        }
        fn features(&self) -> &Features {
            &self.features
        }
        fn ept_breakpoints(&self) -> usize {
            0
        }
    }

    fn core() -> CoreState {
        CoreState::new(0, Box::new(SoftVmcs::new()))
    }

    #[test]
    fn test_unset_keeps_bit_with_remaining_consumer() {
        let mut core = core();
        let consumers = Consumers {
            exception_vectors: 1 << 14,
            ..Default::default()
        };
        set(&mut core, ProtectedResource::ExceptionBitmap, 1 << 14, &consumers);
        unset(
            &mut core,
            ProtectedResource::ExceptionBitmap,
            1 << 14,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::ExceptionBitmap), 1 << 14);
    }

    #[test]
    fn test_unset_clears_bit_without_consumer() {
        let mut core = core();
        let mut consumers = Consumers {
            exception_vectors: 1 << 14,
            ..Default::default()
        };
        set(&mut core, ProtectedResource::ExceptionBitmap, 1 << 14, &consumers);
        consumers.exception_vectors = 0;
        unset(
            &mut core,
            ProtectedResource::ExceptionBitmap,
            1 << 14,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::ExceptionBitmap), 0);
    }

    #[test]
    fn test_pass_over_ignores_the_consumer_being_removed() {
        let mut core = core();
        let consumers = Consumers {
            events: vec![EventType::SyscallHookEferSyscall],
            ..Default::default()
        };
        set(&mut core, ProtectedResource::ExceptionBitmap, 1 << 6, &consumers);
        unset(
            &mut core,
            ProtectedResource::ExceptionBitmap,
            1 << 6,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::ExceptionBitmap), 1 << 6);
        unset(
            &mut core,
            ProtectedResource::ExceptionBitmap,
            1 << 6,
            PassOver::UD_FOR_SYSCALL_SYSRET,
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::ExceptionBitmap), 0);
    }

    #[test]
    fn test_debuggers_keep_breakpoint_vectors() {
        let mut core = core();
        let consumers = Consumers::default();
        consumers
            .features
            .set(&consumers.features.user_debugger_active, true);
        reset(
            &mut core,
            ProtectedResource::ExceptionBitmap,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::ExceptionBitmap), 0b1010);
    }

    #[test]
    fn test_external_interrupt_exiting_acknowledges_on_exit() {
        let mut core = core();
        let consumers = Consumers::default();
        set(&mut core, ProtectedResource::ExternalInterruptExiting, 1, &consumers);
        assert!(core
            .vmcs
            .pin_controls()
            .contains(PinControls::EXTERNAL_INTERRUPT_EXITING));
        assert!(core
            .vmcs
            .exit_controls()
            .contains(ExitControls::ACK_INTERRUPT_ON_EXIT));

        reset(
            &mut core,
            ProtectedResource::ExternalInterruptExiting,
            PassOver::empty(),
            &consumers,
        );
        assert!(core.vmcs.pin_controls().is_empty());
        assert!(core.vmcs.exit_controls().is_empty());
    }

    #[test]
    fn test_transparent_mode_holds_rdtsc_exiting() {
        let mut core = core();
        let consumers = Consumers {
            events: vec![EventType::TscInstructionExecution],
            ..Default::default()
        };
        consumers
            .features
            .set(&consumers.features.transparent_mode, true);
        set(&mut core, ProtectedResource::RdtscExiting, 1, &consumers);
        reset(
            &mut core,
            ProtectedResource::RdtscExiting,
            PassOver::TSC_EVENTS,
            &consumers,
        );
        assert!(core
            .vmcs
            .proc_controls()
            .contains(ProcControls::RDTSC_EXITING));
    }

    #[test]
    fn test_cr_mask_keeps_bits_of_other_events_and_refreshes_shadow() {
        let mut core = core();
        core.vmcs.write(VmcsField::GuestCr4, 0x2020);
        let consumers = Consumers {
            cr4_mask: 0x20,
            ..Default::default()
        };
        set(&mut core, ProtectedResource::MovToCr4, 0x20 | 0x80, &consumers);
        assert_eq!(core.vmcs.read(VmcsField::Cr4ReadShadow), 0x2020);
        unset(
            &mut core,
            ProtectedResource::MovToCr4,
            0x20 | 0x80,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::Cr4GuestHostMask), 0x20);
        reset(
            &mut core,
            ProtectedResource::MovToCr4,
            PassOver::CR_EVENTS,
            &consumers,
        );
        assert_eq!(core.vmcs.read(VmcsField::Cr4GuestHostMask), 0);
    }

    #[test]
    fn test_waiting_for_cr3_keeps_exiting() {
        let mut core = core();
        core.waiting_for_mov_cr3 = true;
        let consumers = Consumers::default();
        set(&mut core, ProtectedResource::MovToCr3Exiting, 1, &consumers);
        reset(
            &mut core,
            ProtectedResource::MovToCr3Exiting,
            PassOver::empty(),
            &consumers,
        );
        assert_eq!(
            ProtectedResource::MovToCr3Exiting.read(core.vmcs.as_ref()),
            1
        );
    }
}

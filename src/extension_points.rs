//! # Collaborators
//!
//! The engine is the middle of a larger debugger. The parts around it (the script evaluator,
//! the transport to the remote debugger, the EPT hooking code, the guest OS introspection
//! and so on) are reached through the traits of this module. [`HvContext`] holds one trait
//! object for each of them in [`Collaborators`].
//!
//! [`crate::sim`] has an implementation of every trait.
//!
//! [`HvContext`]: crate::context::HvContext

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::errors::Result;
use crate::event::EventType;
use crate::halt::HaltNotice;
use crate::regs::GuestRegs;
use crate::vmcs::Vmcs;
use crate::vmexit::{CrAccess, DrAccess, IoAccess};
use crate::{CoreId, ProcessId, ThreadId};

/// What a buffer sent to the debugger contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    StateRecord,
    CustomCodeResult,
    ScriptResult,
    Registers,
    /// Text from the guest side of the debugger
    Message,
    GeneralBuffer,
}

/// Result of running a script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    /// Skip the default handling of the exit that triggered the event
    pub short_circuit: bool,
    pub output: Option<Vec<u8>>,
}

pub trait ScriptEngine: Send + Sync {
    /// Check that a condition buffer can be evaluated at all
    fn check_condition(&self, condition: &[u8]) -> Result<()>;
    fn evaluate_condition(&self, regs: &GuestRegs, context: u64, condition: &[u8]) -> bool;
    fn run_script(
        &self,
        regs: &mut GuestRegs,
        context: u64,
        script: &[u8],
        scratch: &mut [u8],
    ) -> Result<ScriptOutcome>;
}

/// The channel to the remote debugger
pub trait Transport: Send + Sync {
    /// Send a buffer, `immediate` asks to skip any batching
    fn send_buffer(&self, kind: MessageKind, buffer: &[u8], immediate: bool) -> Result<()>;
    /// A core stopped and waits for the debugger
    fn notify_halt(&self, notice: &HaltNotice);
}

bitflags! {
    /// Access rights of a guest page in the EPT
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PageAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// An EPT violation that belongs to a registered hidden hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EptHit {
    pub event_type: EventType,
    /// The accessed address, or the hooked address for execution hooks
    pub context: u64,
}

pub trait EptHooks: Send + Sync {
    fn set_hidden_breakpoint(&self, core: CoreId, address: Addr, process: ProcessId)
        -> Result<()>;
    fn hook_page_attributes(
        &self,
        core: CoreId,
        address: Addr,
        attributes: PageAttributes,
        cr3: u64,
    ) -> Result<()>;
    /// Remove `attributes` from every page of `[start, end)`
    fn monitor_range(
        &self,
        start: Addr,
        end: Addr,
        attributes: PageAttributes,
        process: ProcessId,
    ) -> Result<()>;
    fn hook_detour(&self, address: Addr, process: ProcessId) -> Result<()>;
    fn unhook_single(&self, address: Addr, process: ProcessId) -> Result<()>;
    fn unhook_all(&self, core: CoreId) -> Result<()>;
    fn invept_all_contexts(&self, core: CoreId);
    fn invept_single_context(&self, core: CoreId, eptp: u64);
    /// Check whether a #BP was caused by a hidden breakpoint and restore the original byte
    fn check_breakpoint(&self, core: CoreId, rip: Addr) -> Option<EptHit>;
    fn handle_violation(&self, core: CoreId, guest_physical: u64, linear: Addr)
        -> Option<EptHit>;
    fn installed_breakpoints(&self) -> usize;
}

/// Ways to get rid of a process, tried in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KillMethod {
    /// Terminate through a handle opened the documented way
    TerminateByHandle,
    /// Terminate through a handle opened with kernel-mode access
    TerminateByKernelHandle,
    /// Unmap the main image of the process
    UnmapImage,
}

impl KillMethod {
    pub const ORDER: [KillMethod; 3] = [
        KillMethod::TerminateByHandle,
        KillMethod::TerminateByKernelHandle,
        KillMethod::UnmapImage,
    ];
}

/// Introspection of the guest operating system
pub trait GuestOs: Send + Sync {
    fn current_process(&self, core: CoreId) -> ProcessId;
    fn current_thread(&self, core: CoreId) -> ThreadId;
    fn current_cr3(&self, core: CoreId) -> u64;
    fn is_page_present(&self, process: ProcessId, address: Addr) -> bool;
    fn read_memory(&self, process: ProcessId, address: Addr, buf: &mut [u8]) -> Result<()>;
    fn write_memory(&self, process: ProcessId, address: Addr, data: &[u8]) -> Result<()>;
    fn read_msr(&self, core: CoreId, msr: u32) -> u64;
    fn process_exists(&self, process: ProcessId) -> bool;
    fn threads(&self, process: ProcessId) -> Vec<ThreadId>;
    /// `None` if the bitness cannot be determined
    fn is_32bit(&self, process: ProcessId) -> Option<bool>;
    fn entry_point(&self, process: ProcessId) -> Option<Addr>;
    fn allocate_user_buffer(&self, process: ProcessId, size: u64) -> Option<Addr>;
    fn kill(&self, process: ProcessId, method: KillMethod) -> bool;
}

/// A hypervisor below this one that owns hypercalls we do not know
pub trait NestedHypervisor: Send + Sync {
    fn forward(&self, core: CoreId, regs: &mut GuestRegs);
}

pub trait CoreBroadcast: Send + Sync {
    fn core_count(&self) -> u32;
    /// Run `task` on every core and wait for all of them
    fn run_on_each(&self, task: &(dyn Fn(CoreId) + Sync));
    /// Send the halt NMI to every core except `except`
    fn send_halt_nmis(&self, except: CoreId);
}

/// Default emulation of the intercepted instructions
pub trait InstructionEmulator: Send + Sync {
    fn cpuid(&self, core: CoreId, regs: &mut GuestRegs);
    fn rdtsc(&self, core: CoreId, regs: &mut GuestRegs, with_aux: bool);
    fn rdpmc(&self, core: CoreId, regs: &mut GuestRegs);
    fn rdmsr(&self, core: CoreId, regs: &mut GuestRegs);
    fn wrmsr(&self, core: CoreId, regs: &mut GuestRegs);
    fn io(&self, core: CoreId, regs: &mut GuestRegs, access: IoAccess);
    fn control_register_access(
        &self,
        core: CoreId,
        vmcs: &mut dyn Vmcs,
        regs: &mut GuestRegs,
        access: CrAccess,
    );
    fn debug_register_access(&self, core: CoreId, regs: &mut GuestRegs, access: DrAccess);
}

/// Hypercalls of the driver that sits on top of the engine
pub trait TopLevelVmcall: Send + Sync {
    /// True if the call was handled
    fn handle(&self, core: CoreId, code: u32, p1: u64, p2: u64, p3: u64) -> bool;
}

/// Everything the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub script: Arc<dyn ScriptEngine>,
    pub transport: Arc<dyn Transport>,
    pub ept: Arc<dyn EptHooks>,
    pub guest: Arc<dyn GuestOs>,
    pub nested: Arc<dyn NestedHypervisor>,
    pub broadcast: Arc<dyn CoreBroadcast>,
    pub emulator: Arc<dyn InstructionEmulator>,
    pub top_level: Option<Arc<dyn TopLevelVmcall>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("top_level", &self.top_level.is_some())
            .finish_non_exhaustive()
    }
}

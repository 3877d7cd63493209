//! # Simulated machine
//!
//! In-memory implementations of every collaborator trait, wired to an [`HvContext`] with a
//! [`SoftVmcs`] per core. The tests of the crate and the `hvserve` binary run the engine on
//! this machine.
//!
//! Exits are produced with [`SyntheticExit`], which writes the exit information fields of a
//! core's VMCS the way the processor would and then runs [`handle_vmexit`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spin::Mutex;
use tracing::{debug, trace};

use crate::config::HvConfig;
use crate::consts::PAGE_SIZE;
use crate::context::HvContext;
use crate::errors::{HvError, Result};
use crate::event::EventType;
use crate::extension_points::{
    Collaborators, CoreBroadcast, EptHit, EptHooks, GuestOs, InstructionEmulator, KillMethod,
    MessageKind, NestedHypervisor, PageAttributes, ScriptEngine, ScriptOutcome, TopLevelVmcall,
    Transport,
};
use crate::halt::HaltNotice;
use crate::injection::InterruptionInfo;
use crate::regs::GuestRegs;
use crate::vmcs::{ExitReason, Interruptibility, SoftVmcs, Vmcs, VmcsExt, VmcsField};
use crate::vmexit::{handle_vmexit, CrAccess, CrAccessKind, DrAccess, ExitOutcome, IoAccess};
use crate::{Addr, CoreId, ProcessId, ThreadId};

/// The process most tests debug
pub const SIM_PROCESS: ProcessId = 4;
/// A second, 32-bit process
pub const SIM_OTHER_PROCESS: ProcessId = 8;
pub const SIM_MAIN_THREAD: ThreadId = 0x10;
pub const SIM_ENTRY_POINT: Addr = Addr::new(0x7ff6_4000_1000);
/// A script the simulated engine answers with a short-circuit
pub const SIM_SCRIPT_SHORT_CIRCUIT: &[u8] = b"short-circuit";
/// rax the hypervisor below answers forwarded calls with
pub const SIM_NESTED_STATUS: u64 = 0x4e;

const SIM_OTHER_ENTRY_POINT: Addr = Addr::new(0x40_1000);
const USER_BUFFER_BASE: u64 = 0x1f0_0000_0000;

#[derive(Debug, Clone)]
struct SimProcess {
    threads: Vec<ThreadId>,
    is_32bit: Option<bool>,
    entry_point: Option<Addr>,
}

/// Guest operating system with two processes and sparse byte-addressed memory
#[derive(Debug)]
pub struct SimGuest {
    processes: Mutex<HashMap<ProcessId, SimProcess>>,
    memory: Mutex<HashMap<(ProcessId, u64), u8>>,
    paged_out: Mutex<HashSet<(ProcessId, u64)>>,
    msrs: Mutex<HashMap<u32, u64>>,
    current_process: AtomicU32,
    current_thread: AtomicU32,
    next_buffer: AtomicU64,
    refused_kills: Mutex<HashSet<KillMethod>>,
    kill_attempts: Mutex<Vec<KillMethod>>,
}

impl Default for SimGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGuest {
    pub fn new() -> Self {
        let mut processes = HashMap::new();
        processes.insert(
            SIM_PROCESS,
            SimProcess {
                threads: vec![SIM_MAIN_THREAD, 0x14, 0x18],
                is_32bit: Some(false),
                entry_point: Some(SIM_ENTRY_POINT),
            },
        );
        processes.insert(
            SIM_OTHER_PROCESS,
            SimProcess {
                threads: vec![0x20],
                is_32bit: Some(true),
                entry_point: Some(SIM_OTHER_ENTRY_POINT),
            },
        );
        Self {
            processes: Mutex::new(processes),
            memory: Mutex::new(HashMap::new()),
            paged_out: Mutex::new(HashSet::new()),
            msrs: Mutex::new(HashMap::new()),
            current_process: AtomicU32::new(SIM_PROCESS),
            current_thread: AtomicU32::new(SIM_MAIN_THREAD),
            next_buffer: AtomicU64::new(USER_BUFFER_BASE),
            refused_kills: Mutex::new(HashSet::new()),
            kill_attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn write(&self, process: ProcessId, address: u64, bytes: &[u8]) {
        let mut memory = self.memory.lock();
        for (i, byte) in bytes.iter().enumerate() {
            memory.insert((process, address.wrapping_add(i as u64)), *byte);
        }
    }

    /// Unwritten memory reads as zero
    pub fn read(&self, process: ProcessId, address: Addr, len: usize) -> Vec<u8> {
        let memory = self.memory.lock();
        (0..len as u64)
            .map(|i| {
                memory
                    .get(&(process, address.u64().wrapping_add(i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn set_page_present(&self, process: ProcessId, address: Addr, present: bool) {
        let key = (process, address.page_base().u64());
        let mut paged_out = self.paged_out.lock();
        if present {
            paged_out.remove(&key);
        } else {
            paged_out.insert(key);
        }
    }

    /// Make the loader data of `process` look uninitialized
    pub fn hide_entry_point(&self, process: ProcessId) {
        if let Some(p) = self.processes.lock().get_mut(&process) {
            p.entry_point = None;
        }
    }

    /// Every core now runs `process`
    pub fn set_current_process(&self, process: ProcessId) {
        self.current_process.store(process, Ordering::Release);
    }

    pub fn set_current_thread(&self, thread: ThreadId) {
        self.current_thread.store(thread, Ordering::Release);
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        self.msrs.lock().insert(msr, value);
    }

    pub fn refuse_kill(&self, method: KillMethod) {
        self.refused_kills.lock().insert(method);
    }

    pub fn kill_attempts(&self) -> Vec<KillMethod> {
        self.kill_attempts.lock().clone()
    }

    fn check_process(&self, process: ProcessId) -> Result<()> {
        if self.process_exists(process) {
            Ok(())
        } else {
            Err(HvError::Guest(format!("there is no process {process}")))
        }
    }
}

impl GuestOs for SimGuest {
    fn current_process(&self, _core: CoreId) -> ProcessId {
        self.current_process.load(Ordering::Acquire)
    }

    fn current_thread(&self, _core: CoreId) -> ThreadId {
        self.current_thread.load(Ordering::Acquire)
    }

    fn current_cr3(&self, core: CoreId) -> u64 {
        0x1aa000 + ((self.current_process(core) as u64) << 12)
    }

    fn is_page_present(&self, process: ProcessId, address: Addr) -> bool {
        !self
            .paged_out
            .lock()
            .contains(&(process, address.page_base().u64()))
    }

    fn read_memory(&self, process: ProcessId, address: Addr, buf: &mut [u8]) -> Result<()> {
        self.check_process(process)?;
        buf.copy_from_slice(&self.read(process, address, buf.len()));
        Ok(())
    }

    fn write_memory(&self, process: ProcessId, address: Addr, data: &[u8]) -> Result<()> {
        self.check_process(process)?;
        self.write(process, address.u64(), data);
        Ok(())
    }

    fn read_msr(&self, _core: CoreId, msr: u32) -> u64 {
        self.msrs.lock().get(&msr).copied().unwrap_or(0)
    }

    fn process_exists(&self, process: ProcessId) -> bool {
        self.processes.lock().contains_key(&process)
    }

    fn threads(&self, process: ProcessId) -> Vec<ThreadId> {
        self.processes
            .lock()
            .get(&process)
            .map(|p| p.threads.clone())
            .unwrap_or_default()
    }

    fn is_32bit(&self, process: ProcessId) -> Option<bool> {
        self.processes.lock().get(&process)?.is_32bit
    }

    fn entry_point(&self, process: ProcessId) -> Option<Addr> {
        self.processes.lock().get(&process)?.entry_point
    }

    fn allocate_user_buffer(&self, process: ProcessId, size: u64) -> Option<Addr> {
        if !self.process_exists(process) {
            return None;
        }
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        let base = self
            .next_buffer
            .fetch_add(pages * PAGE_SIZE, Ordering::Relaxed);
        Some(Addr::from(base))
    }

    fn kill(&self, process: ProcessId, method: KillMethod) -> bool {
        self.kill_attempts.lock().push(method);
        if self.refused_kills.lock().contains(&method) {
            return false;
        }
        self.processes.lock().remove(&process).is_some()
    }
}

/// Records everything sent to the debugger
#[derive(Debug, Default)]
pub struct SimTransport {
    buffers: Mutex<Vec<(MessageKind, Vec<u8>)>>,
    notices: Mutex<Vec<HaltNotice>>,
}

impl SimTransport {
    pub fn buffers(&self) -> Vec<(MessageKind, Vec<u8>)> {
        self.buffers.lock().clone()
    }

    pub fn notices(&self) -> Vec<HaltNotice> {
        self.notices.lock().clone()
    }

    /// Take everything recorded so far
    pub fn drain(&self) -> (Vec<(MessageKind, Vec<u8>)>, Vec<HaltNotice>) {
        (
            std::mem::take(&mut *self.buffers.lock()),
            std::mem::take(&mut *self.notices.lock()),
        )
    }
}

impl Transport for SimTransport {
    fn send_buffer(&self, kind: MessageKind, buffer: &[u8], immediate: bool) -> Result<()> {
        trace!("sending {} bytes of {kind:?} (immediate: {immediate})", buffer.len());
        self.buffers.lock().push((kind, buffer.to_vec()));
        Ok(())
    }

    fn notify_halt(&self, notice: &HaltNotice) {
        debug!("core {} halted: {:?}", notice.core, notice.reason);
        self.notices.lock().push(notice.clone());
    }
}

/// EPT hooks kept as plain sets, with one-shot failure injection
#[derive(Debug, Default)]
pub struct SimEpt {
    breakpoints: Mutex<HashSet<u64>>,
    detours: Mutex<HashSet<u64>>,
    monitored: Mutex<Vec<(u64, u64, PageAttributes, ProcessId)>>,
    attribute_hooks: Mutex<Vec<(u64, PageAttributes, u64)>>,
    violations: Mutex<HashMap<u64, EptHit>>,
    invalidations: AtomicUsize,
    fail_next: AtomicBool,
}

impl SimEpt {
    /// The next hook request fails
    pub fn fail_next_hook(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn attribute_hooks(&self) -> Vec<(u64, PageAttributes, u64)> {
        self.attribute_hooks.lock().clone()
    }

    pub fn monitored(&self) -> Vec<(u64, u64, PageAttributes, ProcessId)> {
        self.monitored.lock().clone()
    }

    pub fn has_detour(&self, address: u64) -> bool {
        self.detours.lock().contains(&address)
    }

    /// Resolve violations at `physical` to `hit`
    pub fn add_violation(&self, physical: u64, hit: EptHit) {
        self.violations.lock().insert(physical, hit);
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            Err(HvError::Guest("the page could not be hooked".into()))
        } else {
            Ok(())
        }
    }
}

impl EptHooks for SimEpt {
    fn set_hidden_breakpoint(&self, _core: CoreId, address: Addr, _process: ProcessId) -> Result<()> {
        self.check_failure()?;
        self.breakpoints.lock().insert(address.u64());
        Ok(())
    }

    fn hook_page_attributes(
        &self,
        _core: CoreId,
        address: Addr,
        attributes: PageAttributes,
        cr3: u64,
    ) -> Result<()> {
        self.check_failure()?;
        self.attribute_hooks
            .lock()
            .push((address.u64(), attributes, cr3));
        Ok(())
    }

    fn monitor_range(
        &self,
        start: Addr,
        end: Addr,
        attributes: PageAttributes,
        process: ProcessId,
    ) -> Result<()> {
        self.check_failure()?;
        self.monitored
            .lock()
            .push((start.u64(), end.u64(), attributes, process));
        Ok(())
    }

    fn hook_detour(&self, address: Addr, _process: ProcessId) -> Result<()> {
        self.check_failure()?;
        self.detours.lock().insert(address.u64());
        Ok(())
    }

    fn unhook_single(&self, address: Addr, _process: ProcessId) -> Result<()> {
        let address = address.u64();
        self.breakpoints.lock().remove(&address);
        self.detours.lock().remove(&address);
        self.monitored.lock().retain(|m| m.0 != address);
        Ok(())
    }

    fn unhook_all(&self, _core: CoreId) -> Result<()> {
        self.breakpoints.lock().clear();
        self.detours.lock().clear();
        self.monitored.lock().clear();
        self.attribute_hooks.lock().clear();
        Ok(())
    }

    fn invept_all_contexts(&self, _core: CoreId) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn invept_single_context(&self, _core: CoreId, _eptp: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn check_breakpoint(&self, _core: CoreId, rip: Addr) -> Option<EptHit> {
        self.breakpoints.lock().contains(&rip.u64()).then_some(EptHit {
            event_type: EventType::HiddenHookExecCc,
            context: rip.u64(),
        })
    }

    fn handle_violation(&self, _core: CoreId, physical: u64, linear: Addr) -> Option<EptHit> {
        if let Some(hit) = self.violations.lock().get(&physical) {
            return Some(*hit);
        }
        let linear = linear.u64();
        self.monitored
            .lock()
            .iter()
            .find(|(start, end, ..)| (*start..*end).contains(&linear))
            .map(|(_, _, attributes, _)| {
                let event_type = if attributes.contains(PageAttributes::READ | PageAttributes::WRITE) {
                    EventType::HiddenHookReadAndWrite
                } else if attributes.contains(PageAttributes::WRITE) {
                    EventType::HiddenHookWrite
                } else {
                    EventType::HiddenHookRead
                };
                EptHit {
                    event_type,
                    context: linear,
                }
            })
    }

    fn installed_breakpoints(&self) -> usize {
        self.breakpoints.lock().len()
    }
}

#[derive(Debug, Default)]
pub struct SimNested {
    /// rcx, rdx, r8 and r9 of every forwarded call
    received: Mutex<Vec<(u64, u64, u64, u64)>>,
}

impl SimNested {
    pub fn received(&self) -> Vec<(u64, u64, u64, u64)> {
        self.received.lock().clone()
    }
}

impl NestedHypervisor for SimNested {
    /// Leaves its own stack pointer behind, like a hypervisor that runs on the guest stack
    fn forward(&self, core: CoreId, regs: &mut GuestRegs) {
        trace!("core {core}: vmcall {:#x} goes to the hypervisor below", regs.rcx);
        self.received
            .lock()
            .push((regs.rcx, regs.rdx, regs.r8, regs.r9));
        regs.rax = SIM_NESTED_STATUS;
        regs.rsp = regs.rsp.wrapping_sub(0x28);
    }
}

/// Runs broadcast tasks one core after the other on the calling thread
#[derive(Debug)]
pub struct SimBroadcast {
    cores: u32,
    halt_nmis: Mutex<Vec<CoreId>>,
}

impl SimBroadcast {
    pub fn new(cores: u32) -> Self {
        Self {
            cores,
            halt_nmis: Mutex::new(Vec::new()),
        }
    }

    /// The `except` argument of every halt NMI broadcast so far
    pub fn halt_nmis(&self) -> Vec<CoreId> {
        self.halt_nmis.lock().clone()
    }
}

impl CoreBroadcast for SimBroadcast {
    fn core_count(&self) -> u32 {
        self.cores
    }

    fn run_on_each(&self, task: &(dyn Fn(CoreId) + Sync)) {
        for core in 0..self.cores {
            task(core);
        }
    }

    fn send_halt_nmis(&self, except: CoreId) {
        self.halt_nmis.lock().push(except);
    }
}

/// An instruction the emulator was asked to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmulatedCall {
    Cpuid(CoreId),
    Rdtsc(CoreId, bool),
    Rdpmc(CoreId),
    Rdmsr(CoreId),
    Wrmsr(CoreId),
    Io(CoreId, IoAccess),
    ControlRegister(CoreId, CrAccess),
    DebugRegister(CoreId, DrAccess),
}

#[derive(Debug, Default)]
pub struct SimEmulator {
    calls: Mutex<Vec<EmulatedCall>>,
    tsc: AtomicU64,
}

impl SimEmulator {
    pub fn calls(&self) -> Vec<EmulatedCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: EmulatedCall) {
        self.calls.lock().push(call);
    }
}

impl InstructionEmulator for SimEmulator {
    fn cpuid(&self, core: CoreId, regs: &mut GuestRegs) {
        self.record(EmulatedCall::Cpuid(core));
        regs.rbx = 0;
        regs.rcx = 0;
        regs.rdx = 0;
    }

    fn rdtsc(&self, core: CoreId, regs: &mut GuestRegs, with_aux: bool) {
        self.record(EmulatedCall::Rdtsc(core, with_aux));
        let tsc = self.tsc.fetch_add(1000, Ordering::Relaxed);
        regs.rax = tsc & 0xffff_ffff;
        regs.rdx = tsc >> 32;
        if with_aux {
            regs.rcx = core as u64;
        }
    }

    fn rdpmc(&self, core: CoreId, regs: &mut GuestRegs) {
        self.record(EmulatedCall::Rdpmc(core));
        regs.rax = 0;
        regs.rdx = 0;
    }

    fn rdmsr(&self, core: CoreId, regs: &mut GuestRegs) {
        self.record(EmulatedCall::Rdmsr(core));
        regs.rax = 0;
        regs.rdx = 0;
    }

    fn wrmsr(&self, core: CoreId, _regs: &mut GuestRegs) {
        self.record(EmulatedCall::Wrmsr(core));
    }

    fn io(&self, core: CoreId, regs: &mut GuestRegs, access: IoAccess) {
        self.record(EmulatedCall::Io(core, access));
        if access.is_in {
            regs.rax |= (1u64 << (access.size as u64 * 8)) - 1;
        }
    }

    fn control_register_access(
        &self,
        core: CoreId,
        vmcs: &mut dyn Vmcs,
        regs: &mut GuestRegs,
        access: CrAccess,
    ) {
        self.record(EmulatedCall::ControlRegister(core, access));
        let field = match access.cr {
            0 => VmcsField::GuestCr0,
            3 => VmcsField::GuestCr3,
            4 => VmcsField::GuestCr4,
            _ => return,
        };
        match access.kind {
            CrAccessKind::MovToCr => vmcs.write(field, regs.get(access.register)),
            CrAccessKind::MovFromCr => regs.set(access.register, vmcs.read(field)),
            CrAccessKind::Clts | CrAccessKind::Lmsw => (),
        }
    }

    fn debug_register_access(&self, core: CoreId, _regs: &mut GuestRegs, access: DrAccess) {
        self.record(EmulatedCall::DebugRegister(core, access));
    }
}

#[derive(Debug, Default)]
pub struct SimTopLevel {
    calls: Mutex<Vec<(u32, u64, u64, u64)>>,
}

impl SimTopLevel {
    pub fn calls(&self) -> Vec<(u32, u64, u64, u64)> {
        self.calls.lock().clone()
    }
}

impl TopLevelVmcall for SimTopLevel {
    fn handle(&self, _core: CoreId, code: u32, p1: u64, p2: u64, p3: u64) -> bool {
        self.calls.lock().push((code, p1, p2, p3));
        true
    }
}

/// A stand-in for the script engine
///
/// A condition is eight little-endian bytes compared with the event context. A script
/// echoes itself as output, except [`SIM_SCRIPT_SHORT_CIRCUIT`], which short-circuits.
#[derive(Debug, Default)]
pub struct SimScript;

impl ScriptEngine for SimScript {
    fn check_condition(&self, condition: &[u8]) -> Result<()> {
        if condition.len() == 8 {
            Ok(())
        } else {
            Err(HvError::MalformedCondition(format!(
                "expected 8 bytes, got {}",
                condition.len()
            )))
        }
    }

    fn evaluate_condition(&self, _regs: &GuestRegs, context: u64, condition: &[u8]) -> bool {
        match <[u8; 8]>::try_from(condition) {
            Ok(bytes) => u64::from_le_bytes(bytes) == context,
            Err(_) => false,
        }
    }

    fn run_script(
        &self,
        _regs: &mut GuestRegs,
        _context: u64,
        script: &[u8],
        _scratch: &mut [u8],
    ) -> Result<ScriptOutcome> {
        if script == SIM_SCRIPT_SHORT_CIRCUIT {
            return Ok(ScriptOutcome {
                short_circuit: true,
                output: None,
            });
        }
        Ok(ScriptOutcome {
            short_circuit: false,
            output: Some(script.to_vec()),
        })
    }
}

/// The exit information a processor would leave in the VMCS
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticExit {
    pub reason: u64,
    pub qualification: u64,
    pub interruption: u32,
    pub error_code: u32,
    pub instruction_length: u64,
    pub rip: Option<u64>,
    pub rflags: Option<u64>,
    pub interruptibility: u32,
    pub guest_physical: u64,
    pub linear: u64,
}

impl SyntheticExit {
    pub fn raw(reason: u64) -> Self {
        Self {
            reason,
            ..Default::default()
        }
    }

    /// An instruction exit at `rip`
    pub fn instruction(reason: ExitReason, rip: u64, length: u64) -> Self {
        Self {
            reason: reason as u64,
            instruction_length: length,
            rip: Some(rip),
            ..Default::default()
        }
    }

    pub fn interrupt(info: InterruptionInfo) -> Self {
        Self {
            reason: ExitReason::ExternalInterrupt as u64,
            interruption: info.raw(),
            ..Default::default()
        }
    }

    pub fn exception(info: InterruptionInfo, rip: u64, length: u64) -> Self {
        Self {
            reason: ExitReason::ExceptionOrNmi as u64,
            interruption: info.raw(),
            instruction_length: length,
            rip: Some(rip),
            ..Default::default()
        }
    }

    pub fn with_qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }
    pub fn with_error_code(mut self, error_code: u32) -> Self {
        self.error_code = error_code;
        self
    }
    pub fn with_rflags(mut self, rflags: u64) -> Self {
        self.rflags = Some(rflags);
        self
    }
    pub fn with_interruptibility(mut self, state: Interruptibility) -> Self {
        self.interruptibility = state.bits();
        self
    }
    pub fn with_addresses(mut self, guest_physical: u64, linear: u64) -> Self {
        self.guest_physical = guest_physical;
        self.linear = linear;
        self
    }
}

/// Load `exit` into the VMCS of `core` and handle it
pub fn run_exit(
    ctx: &HvContext,
    core: CoreId,
    exit: &SyntheticExit,
    regs: &mut GuestRegs,
) -> Result<ExitOutcome> {
    ctx.with_core(core, |state| {
        let vmcs = state.vmcs.as_mut();
        vmcs.write(VmcsField::ExitReason, exit.reason);
        vmcs.write(VmcsField::ExitQualification, exit.qualification);
        vmcs.write(VmcsField::ExitInterruptionInfo, exit.interruption as u64);
        vmcs.write(VmcsField::ExitInterruptionErrorCode, exit.error_code as u64);
        vmcs.write(VmcsField::ExitInstructionLength, exit.instruction_length);
        vmcs.write(VmcsField::GuestInterruptibility, exit.interruptibility as u64);
        vmcs.write(VmcsField::GuestPhysicalAddress, exit.guest_physical);
        vmcs.write(VmcsField::GuestLinearAddress, exit.linear);
        if let Some(rip) = exit.rip {
            vmcs.set_guest_rip(rip);
        }
        if let Some(rflags) = exit.rflags {
            vmcs.set_guest_rflags(rflags);
        }
    })?;
    handle_vmexit(ctx, core, regs)
}

/// An [`HvContext`] together with the simulated parts around it
#[derive(Debug)]
pub struct SimMachine {
    pub ctx: Arc<HvContext>,
    pub guest: Arc<SimGuest>,
    pub transport: Arc<SimTransport>,
    pub ept: Arc<SimEpt>,
    pub nested: Arc<SimNested>,
    pub broadcast: Arc<SimBroadcast>,
    pub emulator: Arc<SimEmulator>,
    pub top_level: Arc<SimTopLevel>,
    pub script: Arc<SimScript>,
}

impl SimMachine {
    pub fn new(config: HvConfig) -> Self {
        let guest = Arc::new(SimGuest::new());
        let transport = Arc::new(SimTransport::default());
        let ept = Arc::new(SimEpt::default());
        let nested = Arc::new(SimNested::default());
        let broadcast = Arc::new(SimBroadcast::new(config.cores));
        let emulator = Arc::new(SimEmulator::default());
        let top_level = Arc::new(SimTopLevel::default());
        let script = Arc::new(SimScript);

        let collab = Collaborators {
            script: script.clone(),
            transport: transport.clone(),
            ept: ept.clone(),
            guest: guest.clone(),
            nested: nested.clone(),
            broadcast: broadcast.clone(),
            emulator: emulator.clone(),
            top_level: Some(top_level.clone()),
        };
        let ctx = Arc::new(HvContext::new(config, collab, |_| {
            Box::new(SoftVmcs::new()) as Box<dyn Vmcs>
        }));
        Self {
            ctx,
            guest,
            transport,
            ept,
            nested,
            broadcast,
            emulator,
            top_level,
            script,
        }
    }

    pub fn exit(
        &self,
        core: CoreId,
        exit: &SyntheticExit,
        regs: &mut GuestRegs,
    ) -> Result<ExitOutcome> {
        run_exit(&self.ctx, core, exit, regs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guest_memory_is_sparse() {
        let guest = SimGuest::new();
        guest.write(SIM_PROCESS, 0x1000, &[1, 2, 3]);
        assert_eq!(guest.read(SIM_PROCESS, Addr::from(0xfffu64), 5), vec![0, 1, 2, 3, 0]);
        assert!(guest
            .read_memory(0xdead, Addr::from(0x1000u64), &mut [0u8; 2])
            .is_err());
    }

    #[test]
    fn test_buffers_do_not_overlap() {
        let guest = SimGuest::new();
        let a = guest.allocate_user_buffer(SIM_PROCESS, PAGE_SIZE).unwrap();
        let b = guest.allocate_user_buffer(SIM_PROCESS, 1).unwrap();
        assert_eq!(b - a, PAGE_SIZE);
        assert!(guest.allocate_user_buffer(0xdead, 1).is_none());
    }

    #[test]
    fn test_monitored_range_resolves_violation() {
        let ept = SimEpt::default();
        ept.monitor_range(
            Addr::from(0x5000u64),
            Addr::from(0x5100u64),
            PageAttributes::WRITE,
            SIM_PROCESS,
        )
        .unwrap();
        let hit = ept.handle_violation(0, 0x1234_5000, Addr::from(0x5010u64)).unwrap();
        assert_eq!(hit.event_type, EventType::HiddenHookWrite);
        assert_eq!(hit.context, 0x5010);
        assert!(ept.handle_violation(0, 0, Addr::from(0x5100u64)).is_none());
    }

    #[test]
    fn test_one_shot_hook_failure() {
        let ept = SimEpt::default();
        ept.fail_next_hook();
        assert!(ept.hook_detour(Addr::from(0x1000u64), SIM_PROCESS).is_err());
        assert!(ept.hook_detour(Addr::from(0x1000u64), SIM_PROCESS).is_ok());
        assert!(ept.has_detour(0x1000));
    }
}

//! # Attaching to user-mode processes
//!
//! The user debugger stops single threads of a process without halting the machine. A
//! stopped thread is parked in a *spin buffer*, a page in the process that runs a nop slide
//! into a `cpuid` and jumps back. Every round through the buffer traps to the hypervisor,
//! which is where queued [`ThreadAction`]s are applied, one per trap.
//!
//! A thread is in one of the [`ThreadState`]s. Threads of an attached process are tracked
//! lazily, the first VM-exit that concerns a thread creates its [`ThreadDetails`].
//!
//! Lock order: a thread's lock may be held while a core state is locked, never the other
//! way round.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spin::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::arbiter::{PassOver, ProtectedResource};
use crate::consts::{
    EXCEPTION_VECTOR_BREAKPOINT, EXCEPTION_VECTOR_DEBUG_BREAKPOINT, EXCEPTION_VECTOR_PAGE_FAULT,
    MAX_THREAD_ACTIONS, NOP, PAGE_FAULT_ERROR_USER_FETCH, PAGE_SIZE, RFLAGS_TF, SPIN_JUMP_BACK,
    SPIN_TRAP, SPIN_TRAP_OFFSET, THREAD_DEBUGGING_TOKEN_SEED,
};
use crate::context::HvContext;
use crate::disassemble::{self, MAX_INSTRUCTION_LENGTH};
use crate::errors::{HvError, Result};
use crate::event::CoreFilter;
use crate::extension_points::{KillMethod, MessageKind};
use crate::halt::{HaltNotice, PausingReason};
use crate::hypercall::HypercallCode;
use crate::injection;
use crate::regs::GuestRegs;
use crate::state::HardwareStep;
use crate::vmcs::{Vmcs, VmcsExt, VmcsField};
use crate::{Addr, CoreId, ProcessId, ThreadId, Token};

/// Breakpoint 0 enable bit of DR7
const DR7_L0: u64 = 1;
/// R/W0 and LEN0 of DR7, all clear for a one byte execute breakpoint
const DR7_RW0_LEN0: u64 = 0xf << 16;

/// Arm DR0 as an execute breakpoint at `address`
///
/// DR0 catches the entry point while a main thread waits for it, and the return address
/// of a stepped over call later on.
fn arm_hardware_breakpoint(vmcs: &mut dyn Vmcs, address: Addr) {
    vmcs.set_guest_dr(0, address.u64());
    let dr7 = vmcs.read(VmcsField::GuestDr7);
    vmcs.write(VmcsField::GuestDr7, (dr7 & !DR7_RW0_LEN0) | DR7_L0);
}

fn disarm_hardware_breakpoint(vmcs: &mut dyn Vmcs) {
    let dr7 = vmcs.read(VmcsField::GuestDr7);
    vmcs.write(VmcsField::GuestDr7, dr7 & !DR7_L0);
    vmcs.set_guest_dr(0, 0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    Running,
    /// The main thread has not reached the entry point yet
    WaitingForEntryPoint,
    /// A #PF was injected to page in the entry point
    WaitingForPageFaultReturn,
    /// Parked in the spin buffer
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadAction {
    Continue,
    StepIn,
    StepOver,
    ReadRegisters,
    RunScript(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SteppingMode {
    StepIn,
    StepOver,
}

#[derive(Debug, Clone)]
pub struct ThreadDetails {
    pub tid: ThreadId,
    pub state: ThreadState,
    /// Where the thread continues once it leaves the spin buffer
    pub saved_rip: Addr,
    pub actions: VecDeque<ThreadAction>,
    pub stepping: Option<SteppingMode>,
    pub step_over_target: Option<Addr>,
}

impl ThreadDetails {
    fn new(tid: ThreadId, state: ThreadState) -> Self {
        Self {
            tid,
            state,
            saved_rip: Addr::NULL,
            actions: VecDeque::with_capacity(MAX_THREAD_ACTIONS),
            stepping: None,
            step_over_target: None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessDetails {
    pub token: Token,
    pub pid: ProcessId,
    pub entry_point: Addr,
    pub spin_buffer: Addr,
    pub is_32bit: bool,
    /// Park the threads of the process on their next #PF or CR3 exit
    intercept: AtomicBool,
    active_thread: AtomicU32,
    threads: RwLock<HashMap<ThreadId, Arc<Mutex<ThreadDetails>>>>,
}

impl ProcessDetails {
    pub fn thread(&self, tid: ThreadId) -> Option<Arc<Mutex<ThreadDetails>>> {
        self.threads.read().get(&tid).cloned()
    }

    /// The details of `tid`, created as running if the thread is new
    fn thread_or_create(&self, tid: ThreadId) -> Arc<Mutex<ThreadDetails>> {
        if let Some(thread) = self.thread(tid) {
            return thread;
        }
        let mut threads = self.threads.write();
        threads
            .entry(tid)
            .or_insert_with(|| {
                trace!("tracking thread {tid} of process {}", self.pid);
                Arc::new(Mutex::new(ThreadDetails::new(tid, ThreadState::Running)))
            })
            .clone()
    }

    fn all_threads(&self) -> Vec<Arc<Mutex<ThreadDetails>>> {
        self.threads.read().values().cloned().collect()
    }

    fn has_paused_threads(&self) -> bool {
        self.all_threads()
            .iter()
            .any(|t| t.lock().state == ThreadState::Paused)
    }

    pub fn intercepting(&self) -> bool {
        self.intercept.load(Ordering::Acquire)
    }

    pub fn active_thread(&self) -> ThreadId {
        self.active_thread.load(Ordering::Acquire)
    }

    /// Address of the trapping `cpuid` in the spin buffer
    pub fn spin_trap(&self) -> Addr {
        self.spin_buffer + SPIN_TRAP_OFFSET
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub tid: ThreadId,
    pub state: ThreadState,
    pub saved_rip: Addr,
    pub queued_actions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub token: Token,
    pub pid: ProcessId,
    pub is_32bit: bool,
    pub entry_point: Addr,
    pub spin_buffer: Addr,
    pub intercepting: bool,
    pub active_thread: ThreadId,
    pub threads: Vec<ThreadSummary>,
}

/// The attached processes, by token
#[derive(Debug)]
pub struct UserDebugger {
    processes: RwLock<HashMap<Token, Arc<ProcessDetails>>>,
    next_token: AtomicU64,
}

impl Default for UserDebugger {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDebugger {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(THREAD_DEBUGGING_TOKEN_SEED),
        }
    }

    pub fn by_token(&self, token: Token) -> Option<Arc<ProcessDetails>> {
        self.processes.read().get(&token).cloned()
    }

    pub fn by_pid(&self, pid: ProcessId) -> Option<Arc<ProcessDetails>> {
        self.processes
            .read()
            .values()
            .find(|p| p.pid == pid)
            .cloned()
    }

    fn process(&self, token: Token) -> Result<Arc<ProcessDetails>> {
        self.by_token(token).ok_or_else(|| {
            let err = HvError::InvalidThreadDebuggingToken(token);
            error!("{err}");
            err
        })
    }

    fn forget(&self, pid: ProcessId) -> Option<Arc<ProcessDetails>> {
        let mut processes = self.processes.write();
        let token = processes.values().find(|p| p.pid == pid)?.token;
        processes.remove(&token)
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }

    fn any_intercepting(&self) -> bool {
        self.processes.read().values().any(|p| p.intercepting())
    }
}

/// The page a paused thread spins in
///
/// A nop slide up to a `cpuid` at [`SPIN_TRAP_OFFSET`], followed by a short jump back into
/// the slide.
pub fn spin_buffer() -> Vec<u8> {
    let mut buffer = vec![NOP; PAGE_SIZE as usize];
    let trap = SPIN_TRAP_OFFSET as usize;
    buffer[trap..trap + SPIN_TRAP.len()].copy_from_slice(&SPIN_TRAP);
    buffer[trap + SPIN_TRAP.len()..].copy_from_slice(&SPIN_JUMP_BACK);
    buffer
}

const BREAKPOINT_VECTORS: u64 =
    (1 << EXCEPTION_VECTOR_BREAKPOINT) | (1 << EXCEPTION_VECTOR_DEBUG_BREAKPOINT);

impl HvContext {
    /// Attach the user debugger to `pid`
    ///
    /// With `check_entry_point`, the main thread is paused once it reaches the entry point
    /// of the process.
    ///
    /// # Errors
    ///
    /// Nothing is kept if attaching fails at any step.
    pub fn attach(&self, pid: ProcessId, check_entry_point: bool) -> Result<Token> {
        if self.userdbg.by_pid(pid).is_some() {
            return Err(HvError::AlreadyAttached(pid));
        }
        let guest = &self.collab.guest;
        if !guest.process_exists(pid) {
            return Err(HvError::InvalidProcessId(pid));
        }
        let is_32bit = guest
            .is_32bit(pid)
            .ok_or(HvError::UnableToDetectBitness(pid))?;
        let entry_point = guest
            .entry_point(pid)
            .ok_or(HvError::PebAddressesNotInitialized(pid))?;
        let spin = guest
            .allocate_user_buffer(pid, PAGE_SIZE)
            .ok_or(HvError::UnableToAttach(pid))?;
        guest.write_memory(pid, spin, &spin_buffer()).map_err(|e| {
            error!("could not place the spin buffer in process {pid}: {e}");
            HvError::UnableToAttach(pid)
        })?;

        let main_thread = guest.threads(pid).first().copied();
        let mut threads = HashMap::new();
        if let (true, Some(tid)) = (check_entry_point, main_thread) {
            threads.insert(
                tid,
                Arc::new(Mutex::new(ThreadDetails::new(
                    tid,
                    ThreadState::WaitingForEntryPoint,
                ))),
            );
        }

        let was_active = self.features.user_debugger_active();
        self.features.set(&self.features.user_debugger_active, true);
        if let Err(e) = self.broadcast_hypercall(
            CoreFilter::All,
            HypercallCode::SetExceptionBitmap,
            EXCEPTION_VECTOR_BREAKPOINT as u64,
            0,
            0,
        )
        .and_then(|()| {
            self.broadcast_hypercall(
                CoreFilter::All,
                HypercallCode::SetExceptionBitmap,
                EXCEPTION_VECTOR_DEBUG_BREAKPOINT as u64,
                0,
                0,
            )
        }) {
            error!("could not intercept breakpoints for process {pid}: {e}");
            if !was_active {
                self.features.set(&self.features.user_debugger_active, false);
                self.unset_on_cores(
                    CoreFilter::All,
                    ProtectedResource::ExceptionBitmap,
                    BREAKPOINT_VECTORS,
                    PassOver::empty(),
                );
            }
            return Err(HvError::UnableToAttach(pid));
        }

        let mut processes = self.userdbg.processes.write();
        if processes.values().any(|p| p.pid == pid) {
            return Err(HvError::AlreadyAttached(pid));
        }
        let token = self.userdbg.next_token.fetch_add(1, Ordering::Relaxed);
        let waits_for_entry = !threads.is_empty();
        processes.insert(
            token,
            Arc::new(ProcessDetails {
                token,
                pid,
                entry_point,
                spin_buffer: spin,
                is_32bit,
                intercept: AtomicBool::new(false),
                active_thread: AtomicU32::new(main_thread.unwrap_or_default()),
                threads: RwLock::new(threads),
            }),
        );
        drop(processes);
        if waits_for_entry {
            self.arm_entry_point(entry_point);
        }
        info!("attached to process {pid} with token {token:#x}, entry point at {entry_point}");
        Ok(token)
    }

    /// Arm the entry point breakpoint on every core, the main thread may start on any
    fn arm_entry_point(&self, entry_point: Addr) {
        self.collab.broadcast.run_on_each(&|core| {
            if let Err(e) = self.with_core(core, |state| {
                arm_hardware_breakpoint(state.vmcs.as_mut(), entry_point)
            }) {
                error!("could not arm the entry point on core {core}: {e}");
            }
        });
    }

    /// Disarm the entry point breakpoint on the cores where it is still armed
    fn disarm_entry_point(&self, entry_point: Addr) {
        self.collab.broadcast.run_on_each(&|core| {
            let _ = self.with_core(core, |state| {
                let dr7 = state.vmcs.read(VmcsField::GuestDr7);
                if dr7 & DR7_L0 != 0 && state.vmcs.guest_dr(0) == entry_point.u64() {
                    disarm_hardware_breakpoint(state.vmcs.as_mut());
                }
            });
        });
    }

    /// Handle a #DB for the user debugger, true if it was consumed
    pub(crate) fn handle_user_debug_exception(&self, core: CoreId, regs: &mut GuestRegs) -> bool {
        if !self.features.user_debugger_active() {
            return false;
        }
        let pid = self.collab.guest.current_process(core);
        let Some(process) = self.userdbg.by_pid(pid) else {
            return false;
        };
        let tid = self.collab.guest.current_thread(core);
        let Ok(rip) = self.with_core(core, |state| Addr::from(state.vmcs.guest_rip())) else {
            return false;
        };

        let thread = process.thread_or_create(tid);
        let mut thread = thread.lock();
        loop {
            match (thread.state, thread.stepping) {
                (ThreadState::WaitingForPageFaultReturn, _) if rip == process.entry_point => {
                    // back from the injected fault, look again
                    thread.state = ThreadState::WaitingForEntryPoint;
                    continue;
                }
                (ThreadState::WaitingForEntryPoint, _) if rip == process.entry_point => {
                    if !self.collab.guest.is_page_present(pid, rip) {
                        debug!("entry point {rip} of process {pid} is paged out");
                        let injected = self.with_core(core, |state| {
                            injection::inject_page_fault(
                                state.vmcs.as_mut(),
                                rip.u64(),
                                PAGE_FAULT_ERROR_USER_FETCH,
                            );
                            // catch the fetch again once the fault is handled
                            arm_hardware_breakpoint(state.vmcs.as_mut(), rip);
                            state.suppress_rip_increment();
                        });
                        if injected.is_ok() {
                            thread.state = ThreadState::WaitingForPageFaultReturn;
                        }
                        return true;
                    }
                    self.disarm_entry_point(process.entry_point);
                    let reason = PausingReason::EntryPointReached {
                        token: process.token,
                        thread: tid,
                    };
                    self.park_thread(core, &process, &mut thread, rip, regs, reason);
                    return true;
                }
                (ThreadState::Running, Some(SteppingMode::StepIn)) => {
                    let _ = self.with_core(core, |state| {
                        let rflags = state.vmcs.guest_rflags();
                        state.vmcs.set_guest_rflags(rflags & !RFLAGS_TF);
                    });
                    let reason = PausingReason::UserThreadPaused {
                        token: process.token,
                        thread: tid,
                    };
                    self.park_thread(core, &process, &mut thread, rip, regs, reason);
                    return true;
                }
                (ThreadState::Running, Some(SteppingMode::StepOver))
                    if thread.step_over_target == Some(rip) =>
                {
                    let _ = self.with_core(core, |state| {
                        state.hardware_step = None;
                        disarm_hardware_breakpoint(state.vmcs.as_mut());
                    });
                    let reason = PausingReason::UserThreadPaused {
                        token: process.token,
                        thread: tid,
                    };
                    self.park_thread(core, &process, &mut thread, rip, regs, reason);
                    return true;
                }
                _ => return false,
            }
        }
    }

    /// Save the thread's position and send it into the spin buffer
    fn park_thread(
        &self,
        core: CoreId,
        process: &ProcessDetails,
        thread: &mut ThreadDetails,
        rip: Addr,
        regs: &GuestRegs,
        reason: PausingReason,
    ) {
        thread.saved_rip = rip;
        thread.state = ThreadState::Paused;
        thread.stepping = None;
        thread.step_over_target = None;
        let spin = process.spin_buffer;
        if let Err(e) = self.with_core(core, |state| {
            state.vmcs.set_guest_rip(spin.u64());
            state.suppress_rip_increment();
        }) {
            error!("could not park thread {}: {e}", thread.tid);
            return;
        }
        debug!(
            "thread {} of process {} paused at {rip}: {reason:?}",
            thread.tid, process.pid
        );
        self.collab.transport.notify_halt(&HaltNotice {
            core,
            process: process.pid,
            thread: thread.tid,
            rip: rip.u64(),
            reason,
            regs: *regs,
        });
    }

    /// Handle a `cpuid` exit, true if it was the trap of a spin buffer
    ///
    /// One queued action of the parked thread is applied per trap.
    pub(crate) fn handle_spin_trap(&self, core: CoreId, regs: &mut GuestRegs) -> bool {
        if !self.features.user_debugger_active() {
            return false;
        }
        let pid = self.collab.guest.current_process(core);
        let Some(process) = self.userdbg.by_pid(pid) else {
            return false;
        };
        let Ok(rip) = self.with_core(core, |state| Addr::from(state.vmcs.guest_rip())) else {
            return false;
        };
        if rip != process.spin_trap() {
            return false;
        }
        let tid = self.collab.guest.current_thread(core);
        let Some(thread) = process.thread(tid) else {
            warn!("unknown thread {tid} of process {pid} is in the spin buffer");
            return true;
        };
        let mut thread = thread.lock();
        if thread.state != ThreadState::Paused {
            warn!("thread {tid} spins but is {:?}", thread.state);
            return true;
        }
        let Some(action) = thread.actions.pop_front() else {
            // nothing to do, let it jump back into the slide
            return true;
        };
        trace!("thread {tid} of process {pid}: {action:?}");

        match action {
            ThreadAction::Continue => {
                self.release_thread(core, &mut thread, None);
            }
            ThreadAction::StepIn => {
                self.release_thread(core, &mut thread, Some(SteppingMode::StepIn));
            }
            ThreadAction::StepOver => {
                let mut bytes = [0u8; MAX_INSTRUCTION_LENGTH];
                let bitness = if process.is_32bit { 32 } else { 64 };
                let call = self
                    .collab
                    .guest
                    .read_memory(pid, thread.saved_rip, &mut bytes)
                    .ok()
                    .and_then(|()| {
                        disassemble::call_length(&bytes, thread.saved_rip.u64(), bitness)
                    });
                match call {
                    Some(len) => {
                        let target = thread.saved_rip + len as u64;
                        thread.step_over_target = Some(target);
                        let _ = self.with_core(core, |state| {
                            state.hardware_step = Some(HardwareStep {
                                address: target,
                                process: pid,
                                thread: tid,
                            });
                            arm_hardware_breakpoint(state.vmcs.as_mut(), target);
                        });
                        self.release_thread(core, &mut thread, Some(SteppingMode::StepOver));
                    }
                    None => {
                        self.release_thread(core, &mut thread, Some(SteppingMode::StepIn));
                    }
                }
            }
            ThreadAction::ReadRegisters => match serde_json::to_vec(&*regs) {
                Ok(buffer) => {
                    if let Err(e) =
                        self.collab
                            .transport
                            .send_buffer(MessageKind::Registers, &buffer, true)
                    {
                        error!("could not send the registers of thread {tid}: {e}");
                    }
                }
                Err(e) => error!("{e}"),
            },
            ThreadAction::RunScript(script) => {
                let mut scratch = Vec::new();
                match self
                    .collab
                    .script
                    .run_script(regs, thread.saved_rip.u64(), &script, &mut scratch)
                {
                    Ok(outcome) => {
                        if let Some(output) = outcome.output {
                            if let Err(e) = self.collab.transport.send_buffer(
                                MessageKind::ScriptResult,
                                &output,
                                true,
                            ) {
                                error!("{e}");
                            }
                        }
                    }
                    Err(e) => error!(
                        "{}",
                        HvError::PreparingDebuggeeToRunScript(e.to_string())
                    ),
                }
            }
        }
        true
    }

    /// Let a parked thread leave the spin buffer at its saved rip
    fn release_thread(
        &self,
        core: CoreId,
        thread: &mut ThreadDetails,
        stepping: Option<SteppingMode>,
    ) {
        let rip = thread.saved_rip;
        let result = self.with_core(core, |state| {
            state.vmcs.set_guest_rip(rip.u64());
            if stepping == Some(SteppingMode::StepIn) {
                let rflags = state.vmcs.guest_rflags();
                state.vmcs.set_guest_rflags(rflags | RFLAGS_TF);
            }
            state.suppress_rip_increment();
        });
        if let Err(e) = result {
            error!("could not release thread {}: {e}", thread.tid);
            return;
        }
        thread.state = ThreadState::Running;
        thread.stepping = stepping;
    }

    /// Park the current thread if its process is being paused, true if it was parked
    ///
    /// Called for #PF and mov-to-CR3 exits. Only threads in user mode are parked.
    pub(crate) fn check_thread_intercept(
        &self,
        core: CoreId,
        regs: &mut GuestRegs,
    ) -> bool {
        if !self.features.check_page_faults_and_cr3() {
            return false;
        }
        let pid = self.collab.guest.current_process(core);
        let Some(process) = self.userdbg.by_pid(pid) else {
            return false;
        };
        if !process.intercepting() {
            return false;
        }
        let Ok(rip) = self.with_core(core, |state| Addr::from(state.vmcs.guest_rip())) else {
            return false;
        };
        if rip.is_kernel() {
            return false;
        }
        let tid = self.collab.guest.current_thread(core);
        let thread = process.thread_or_create(tid);
        let mut thread = thread.lock();
        if thread.state != ThreadState::Running {
            return false;
        }
        let reason = PausingReason::UserThreadPaused {
            token: process.token,
            thread: tid,
        };
        self.park_thread(core, &process, &mut thread, rip, regs, reason);
        true
    }

    /// Queue a command for a paused thread
    pub fn queue_thread_action(
        &self,
        token: Token,
        tid: ThreadId,
        action: ThreadAction,
    ) -> Result<()> {
        let process = self.userdbg.process(token)?;
        let thread = process
            .thread(tid)
            .ok_or(HvError::SteppingThreadNotFound(tid))?;
        let mut thread = thread.lock();
        if thread.state != ThreadState::Paused {
            return Err(HvError::SteppingThreadNotFound(tid));
        }
        if thread.actions.len() >= MAX_THREAD_ACTIONS {
            return Err(HvError::ThreadActionQueueFull(tid));
        }
        thread.actions.push_back(action);
        Ok(())
    }

    /// Park every thread of the process at its next page fault or address space switch
    pub fn pause_process(&self, token: Token) -> Result<()> {
        let process = self.userdbg.process(token)?;
        process.intercept.store(true, Ordering::Release);
        self.features
            .set(&self.features.check_page_faults_and_cr3, true);
        self.broadcast_hypercall(
            CoreFilter::All,
            HypercallCode::SetExceptionBitmap,
            EXCEPTION_VECTOR_PAGE_FAULT as u64,
            0,
            0,
        )
        .and_then(|()| {
            self.broadcast_hypercall(CoreFilter::All, HypercallCode::EnableMovToCr3Exiting, 0, 0, 0)
        })
        .map_err(|e| {
            error!("could not intercept the threads of process {}: {e}", process.pid);
            HvError::UnableToPauseThreads(process.pid)
        })
    }

    /// Stop parking threads of the process and let every paused thread continue
    pub fn continue_process(&self, token: Token) -> Result<()> {
        let process = self.userdbg.process(token)?;
        process.intercept.store(false, Ordering::Release);
        self.stop_intercepting_if_unused();

        for thread in process.all_threads() {
            let mut thread = thread.lock();
            if thread.state == ThreadState::Paused {
                if thread.actions.len() >= MAX_THREAD_ACTIONS {
                    warn!("action queue of thread {} is full", thread.tid);
                    continue;
                }
                thread.actions.push_back(ThreadAction::Continue);
            }
        }
        Ok(())
    }

    fn stop_intercepting_if_unused(&self) {
        if self.userdbg.any_intercepting() {
            return;
        }
        self.features
            .set(&self.features.check_page_faults_and_cr3, false);
        self.unset_on_cores(
            CoreFilter::All,
            ProtectedResource::ExceptionBitmap,
            1 << EXCEPTION_VECTOR_PAGE_FAULT,
            PassOver::empty(),
        );
        self.unset_on_cores(
            CoreFilter::All,
            ProtectedResource::MovToCr3Exiting,
            1,
            PassOver::empty(),
        );
    }

    /// Kill an attached or unattached process, trying every [`KillMethod`] in order
    pub fn kill_process(&self, pid: ProcessId) -> Result<KillMethod> {
        if !self.collab.guest.process_exists(pid) {
            if self.forget_process(pid) {
                debug!("forgot process {pid}, it is gone");
            }
            return Err(HvError::InvalidProcessId(pid));
        }
        for method in KillMethod::ORDER {
            if self.collab.guest.kill(pid, method) {
                info!("killed process {pid} with {method:?}");
                self.forget_process(pid);
                return Ok(method);
            }
            debug!("could not kill process {pid} with {method:?}");
        }
        Err(HvError::UnableToKillProcess(pid))
    }

    /// Detach from the process of `token`
    pub fn detach(&self, token: Token) -> Result<()> {
        let process = self.userdbg.process(token)?;
        if process.has_paused_threads() {
            return Err(HvError::PausedThreadsPreventDetach(process.pid));
        }
        self.forget_process(process.pid);
        info!("detached from process {}", process.pid);
        Ok(())
    }

    /// Drop the details of `pid` and the interception nothing needs anymore
    fn forget_process(&self, pid: ProcessId) -> bool {
        let Some(process) = self.userdbg.forget(pid) else {
            return false;
        };
        self.disarm_entry_point(process.entry_point);
        self.user_debugger_cleanup();
        true
    }

    fn user_debugger_cleanup(&self) {
        self.stop_intercepting_if_unused();
        if self.userdbg.is_empty() {
            self.features
                .set(&self.features.user_debugger_active, false);
            self.unset_on_cores(
                CoreFilter::All,
                ProtectedResource::ExceptionBitmap,
                BREAKPOINT_VECTORS,
                PassOver::empty(),
            );
        }
    }

    /// Make `tid` the thread the debugger works with
    pub fn switch_thread(&self, token: Token, tid: ThreadId) -> Result<()> {
        let process = self.userdbg.process(token)?;
        let threads = self.collab.guest.threads(process.pid);
        if threads.is_empty() {
            return Err(HvError::NoThreadOnProcess(process.pid));
        }
        if !threads.contains(&tid) {
            return Err(HvError::InvalidSwitchTarget(tid));
        }
        process.active_thread.store(tid, Ordering::Release);
        Ok(())
    }

    pub fn query_processes(&self) -> Vec<ProcessSummary> {
        let mut summaries: Vec<ProcessSummary> = self
            .userdbg
            .processes
            .read()
            .values()
            .map(|p| {
                let mut threads: Vec<ThreadSummary> = p
                    .all_threads()
                    .iter()
                    .map(|t| {
                        let t = t.lock();
                        ThreadSummary {
                            tid: t.tid,
                            state: t.state,
                            saved_rip: t.saved_rip,
                            queued_actions: t.actions.len(),
                        }
                    })
                    .collect();
                threads.sort_by_key(|t| t.tid);
                ProcessSummary {
                    token: p.token,
                    pid: p.pid,
                    is_32bit: p.is_32bit,
                    entry_point: p.entry_point,
                    spin_buffer: p.spin_buffer,
                    intercepting: p.intercepting(),
                    active_thread: p.active_thread(),
                    threads,
                }
            })
            .collect();
        summaries.sort_by_key(|p| p.token);
        summaries
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::HvConfig;
    use crate::extension_points::GuestOs;
    use crate::sim::{SimMachine, SIM_ENTRY_POINT, SIM_MAIN_THREAD, SIM_PROCESS};
    use crate::vmcs::VmcsField;

    fn at(machine: &SimMachine, core: CoreId, rip: Addr) {
        machine
            .ctx
            .with_core(core, |c| {
                c.vmcs.set_guest_rip(rip.u64());
                c.increment_rip = true;
            })
            .unwrap();
    }

    fn rip(machine: &SimMachine, core: CoreId) -> Addr {
        machine
            .ctx
            .with_core(core, |c| Addr::from(c.vmcs.guest_rip()))
            .unwrap()
    }

    fn thread_state(machine: &SimMachine, token: Token, tid: ThreadId) -> ThreadState {
        machine
            .ctx
            .user_debugger()
            .by_token(token)
            .unwrap()
            .thread(tid)
            .unwrap()
            .lock()
            .state
    }

    /// Attach and run the main thread into its entry point
    fn paused_at_entry(machine: &SimMachine) -> (Token, Arc<ProcessDetails>) {
        let token = machine.ctx.attach(SIM_PROCESS, true).unwrap();
        let process = machine.ctx.user_debugger().by_token(token).unwrap();
        at(machine, 0, SIM_ENTRY_POINT);
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(
            thread_state(machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
        (token, process)
    }

    /// DR0 and DR7 of `core`
    fn debug_registers(machine: &SimMachine, core: CoreId) -> (u64, u64) {
        machine
            .ctx
            .with_core(core, |c| (c.vmcs.guest_dr(0), c.vmcs.read(VmcsField::GuestDr7)))
            .unwrap()
    }

    fn trap(machine: &SimMachine, process: &ProcessDetails) {
        at(machine, 0, process.spin_trap());
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_spin_trap(0, &mut regs));
    }

    #[test]
    fn test_attach_errors_leave_no_state() {
        let machine = SimMachine::new(HvConfig::default());
        assert!(matches!(
            machine.ctx.attach(0xdead, true),
            Err(HvError::InvalidProcessId(0xdead))
        ));
        machine.guest.hide_entry_point(SIM_PROCESS);
        assert!(matches!(
            machine.ctx.attach(SIM_PROCESS, true),
            Err(HvError::PebAddressesNotInitialized(_))
        ));
        assert!(machine.ctx.query_processes().is_empty());
        assert!(!machine.ctx.features().user_debugger_active());
    }

    #[test]
    fn test_attach_places_spin_buffer_and_intercepts_breakpoints() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, true).unwrap();
        assert_eq!(token, THREAD_DEBUGGING_TOKEN_SEED);
        assert!(matches!(
            machine.ctx.attach(SIM_PROCESS, true),
            Err(HvError::AlreadyAttached(_))
        ));

        let process = machine.ctx.user_debugger().by_token(token).unwrap();
        assert_eq!(
            machine.guest.read(SIM_PROCESS, process.spin_buffer, PAGE_SIZE as usize),
            spin_buffer()
        );
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::WaitingForEntryPoint
        );
        for core in 0..machine.ctx.core_count() {
            let bitmap = machine
                .ctx
                .with_core(core, |c| c.vmcs.read(VmcsField::ExceptionBitmap))
                .unwrap();
            assert_eq!(bitmap & BREAKPOINT_VECTORS, BREAKPOINT_VECTORS);
        }
    }

    #[test]
    fn test_entry_point_breakpoint_on_every_core() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, true).unwrap();
        for core in 0..machine.ctx.core_count() {
            let (dr0, dr7) = debug_registers(&machine, core);
            assert_eq!(dr0, SIM_ENTRY_POINT.u64());
            assert_eq!(dr7 & DR7_L0, DR7_L0);
            assert_eq!(dr7 & DR7_RW0_LEN0, 0);
        }

        // reached on core 1, no core keeps waiting for it
        at(&machine, 1, SIM_ENTRY_POINT);
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_user_debug_exception(1, &mut regs));
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
        for core in 0..machine.ctx.core_count() {
            assert_eq!(debug_registers(&machine, core), (0, 0));
        }
    }

    #[test]
    fn test_entry_point_breakpoint_follows_the_attachment() {
        let machine = SimMachine::new(HvConfig::default());
        machine.ctx.attach(SIM_PROCESS, false).unwrap();
        assert_eq!(debug_registers(&machine, 0), (0, 0));

        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, true).unwrap();
        machine.ctx.detach(token).unwrap();
        for core in 0..machine.ctx.core_count() {
            assert_eq!(debug_registers(&machine, core), (0, 0));
        }

        machine.ctx.attach(SIM_PROCESS, true).unwrap();
        machine.ctx.kill_process(SIM_PROCESS).unwrap();
        assert_eq!(debug_registers(&machine, 1), (0, 0));
    }

    #[test]
    fn test_entry_point_on_paged_out_page() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, true).unwrap();
        machine.guest.set_page_present(SIM_PROCESS, SIM_ENTRY_POINT, false);
        // the guest reloaded its own debug registers on core 0
        machine
            .ctx
            .with_core(0, |c| {
                c.vmcs.set_guest_dr(0, 0);
                c.vmcs.write(VmcsField::GuestDr7, 0);
            })
            .unwrap();

        at(&machine, 0, SIM_ENTRY_POINT);
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::WaitingForPageFaultReturn
        );
        let (dr0, dr7) = debug_registers(&machine, 0);
        assert_eq!(dr0, SIM_ENTRY_POINT.u64());
        assert_eq!(dr7 & DR7_L0, DR7_L0);
        let (info, cr2, increment) = machine
            .ctx
            .with_core(0, |c| {
                (
                    c.vmcs.read(VmcsField::EntryInterruptionInfo),
                    c.vmcs.guest_cr2(),
                    c.increment_rip,
                )
            })
            .unwrap();
        assert_eq!(info, 0x8000_0b0e);
        assert_eq!(cr2, SIM_ENTRY_POINT.u64());
        assert!(!increment);

        // the second hit finds the page resident
        machine.guest.set_page_present(SIM_PROCESS, SIM_ENTRY_POINT, true);
        at(&machine, 0, SIM_ENTRY_POINT);
        assert!(machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
        let notices = machine.transport.notices();
        assert_eq!(
            notices[0].reason,
            PausingReason::EntryPointReached {
                token,
                thread: SIM_MAIN_THREAD
            }
        );
    }

    #[test]
    fn test_continue_restores_saved_rip() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, process) = paused_at_entry(&machine);
        assert_eq!(rip(&machine, 0), process.spin_buffer);

        // an empty queue keeps it spinning
        trap(&machine, &process);
        assert!(machine.ctx.with_core(0, |c| c.increment_rip).unwrap());

        machine
            .ctx
            .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::Continue)
            .unwrap();
        trap(&machine, &process);
        assert_eq!(rip(&machine, 0), SIM_ENTRY_POINT);
        assert!(!machine.ctx.with_core(0, |c| c.increment_rip).unwrap());
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Running
        );
    }

    #[test]
    fn test_step_in_traps_once_then_pauses() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, process) = paused_at_entry(&machine);
        machine
            .ctx
            .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::StepIn)
            .unwrap();
        trap(&machine, &process);
        let rflags = machine
            .ctx
            .with_core(0, |c| c.vmcs.guest_rflags())
            .unwrap();
        assert_ne!(rflags & RFLAGS_TF, 0);

        // the single step lands on the next instruction
        let next = SIM_ENTRY_POINT + 4;
        at(&machine, 0, next);
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
        let rflags = machine
            .ctx
            .with_core(0, |c| c.vmcs.guest_rflags())
            .unwrap();
        assert_eq!(rflags & RFLAGS_TF, 0);
        assert_eq!(rip(&machine, 0), process.spin_buffer);
        let thread = process.thread(SIM_MAIN_THREAD).unwrap();
        assert_eq!(thread.lock().saved_rip, next);

        // a second #DB is not ours anymore
        at(&machine, 0, next + 3);
        assert!(!machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(machine.transport.notices().len(), 2);
    }

    #[test]
    fn test_step_over_call_arms_breakpoint_after_it() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, process) = paused_at_entry(&machine);
        // call rel32 at the entry point
        machine
            .guest
            .write(SIM_PROCESS, SIM_ENTRY_POINT.u64(), &[0xe8, 0x10, 0, 0, 0]);
        machine
            .ctx
            .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::StepOver)
            .unwrap();
        trap(&machine, &process);

        let target = SIM_ENTRY_POINT + 5;
        let (step, dr7, rflags) = machine
            .ctx
            .with_core(0, |c| {
                (
                    c.hardware_step,
                    c.vmcs.read(VmcsField::GuestDr7),
                    c.vmcs.guest_rflags(),
                )
            })
            .unwrap();
        assert_eq!(step.map(|s| s.address), Some(target));
        assert_eq!(dr7 & DR7_L0, DR7_L0);
        assert_eq!(debug_registers(&machine, 0).0, target.u64());
        assert_eq!(rflags & RFLAGS_TF, 0);

        at(&machine, 0, target);
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.handle_user_debug_exception(0, &mut regs));
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
        assert!(machine.ctx.with_core(0, |c| c.hardware_step).unwrap().is_none());
        assert_eq!(debug_registers(&machine, 0), (0, 0));
    }

    #[test]
    fn test_action_queue_limits() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, _process) = paused_at_entry(&machine);
        for _ in 0..MAX_THREAD_ACTIONS {
            machine
                .ctx
                .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::ReadRegisters)
                .unwrap();
        }
        assert!(matches!(
            machine
                .ctx
                .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::Continue),
            Err(HvError::ThreadActionQueueFull(_))
        ));
        assert!(matches!(
            machine
                .ctx
                .queue_thread_action(token, 0x4242, ThreadAction::Continue),
            Err(HvError::SteppingThreadNotFound(0x4242))
        ));
        assert!(matches!(
            machine
                .ctx
                .queue_thread_action(1, SIM_MAIN_THREAD, ThreadAction::Continue),
            Err(HvError::InvalidThreadDebuggingToken(1))
        ));
    }

    #[test]
    fn test_read_registers_keeps_thread_paused() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, process) = paused_at_entry(&machine);
        machine
            .ctx
            .queue_thread_action(token, SIM_MAIN_THREAD, ThreadAction::ReadRegisters)
            .unwrap();
        at(&machine, 0, process.spin_trap());
        let mut regs = GuestRegs {
            rax: 0x1337,
            ..Default::default()
        };
        assert!(machine.ctx.handle_spin_trap(0, &mut regs));
        let sent = machine.transport.buffers();
        assert_eq!(sent[0].0, MessageKind::Registers);
        let back: GuestRegs = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(back.rax, 0x1337);
        assert_eq!(
            thread_state(&machine, token, SIM_MAIN_THREAD),
            ThreadState::Paused
        );
    }

    #[test]
    fn test_detach_with_paused_threads_is_refused() {
        let machine = SimMachine::new(HvConfig::default());
        let (token, process) = paused_at_entry(&machine);
        assert!(matches!(
            machine.ctx.detach(token),
            Err(HvError::PausedThreadsPreventDetach(_))
        ));

        machine.ctx.continue_process(token).unwrap();
        trap(&machine, &process);
        machine.ctx.detach(token).unwrap();
        assert!(machine.ctx.query_processes().is_empty());
        assert!(!machine.ctx.features().user_debugger_active());
        let bitmap = machine
            .ctx
            .with_core(1, |c| c.vmcs.read(VmcsField::ExceptionBitmap))
            .unwrap();
        assert_eq!(bitmap & BREAKPOINT_VECTORS, 0);
    }

    #[test]
    fn test_pause_parks_next_user_mode_fault() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, false).unwrap();
        machine.ctx.pause_process(token).unwrap();
        assert!(machine.ctx.features().check_page_faults_and_cr3());

        let mut regs = GuestRegs::default();
        at(&machine, 1, Addr::from(0xffff_f800_0000_1000u64));
        assert!(!machine.ctx.check_thread_intercept(1, &mut regs));

        at(&machine, 1, Addr::from(0x7ff6_1234_0000u64));
        assert!(machine.ctx.check_thread_intercept(1, &mut regs));
        let tid = machine.guest.current_thread(1);
        assert_eq!(thread_state(&machine, token, tid), ThreadState::Paused);

        machine.ctx.continue_process(token).unwrap();
        assert!(!machine.ctx.features().check_page_faults_and_cr3());
        let process = machine.ctx.user_debugger().by_token(token).unwrap();
        assert_eq!(
            process.thread(tid).unwrap().lock().actions.front(),
            Some(&ThreadAction::Continue)
        );
    }

    #[test]
    fn test_kill_falls_back_in_order() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, false).unwrap();
        machine.guest.refuse_kill(KillMethod::TerminateByHandle);
        machine.guest.refuse_kill(KillMethod::TerminateByKernelHandle);
        assert_eq!(
            machine.ctx.kill_process(SIM_PROCESS).unwrap(),
            KillMethod::UnmapImage
        );
        assert_eq!(
            machine.guest.kill_attempts(),
            KillMethod::ORDER.to_vec()
        );
        assert!(machine.ctx.user_debugger().by_token(token).is_none());
        assert!(matches!(
            machine.ctx.kill_process(0xdead),
            Err(HvError::InvalidProcessId(_))
        ));
    }

    #[test]
    fn test_switch_thread() {
        let machine = SimMachine::new(HvConfig::default());
        let token = machine.ctx.attach(SIM_PROCESS, false).unwrap();
        let threads = machine.guest.threads(SIM_PROCESS);
        machine.ctx.switch_thread(token, threads[1]).unwrap();
        assert_eq!(machine.ctx.query_processes()[0].active_thread, threads[1]);
        assert!(matches!(
            machine.ctx.switch_thread(token, 0x999),
            Err(HvError::InvalidSwitchTarget(0x999))
        ));
    }
}

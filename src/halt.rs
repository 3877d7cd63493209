//! # Halting the guest for the debugger
//!
//! When a core has to stop for the debugger it becomes the *owner* of the halt and sends a
//! halt NMI to every other core. Those cores stop as well, as *followers*, and all of them
//! spin until the debugger resumes the machine. Only the owner talks to the debugger. The
//! others can still be given work with [`HaltController::run_on_halted_core`], and
//! ownership can move to another halted core with [`ResumeCommand::SwitchCore`].
//!
//! A halt ends when the owner releases it, which bumps the halt generation. Followers wait
//! for the generation they were halted in to pass. A halt NMI that arrives after its halt
//! already ended is recognized by its generation and swallowed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use spin::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::arbiter::{PassOver, ProtectedResource};
use crate::context::HvContext;
use crate::errors::{HvError, Result};
use crate::event::CoreFilter;
use crate::hypercall::HypercallCode;
use crate::regs::GuestRegs;
use crate::vmcs::{ProcControls, VmcsExt};
use crate::{CoreId, ProcessId, Tag, ThreadId, Token};

const NO_OWNER: u32 = u32::MAX;
const NO_REQUEST: u64 = 0;

/// Why a core (or a user-mode thread) stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PausingReason {
    RequestFromDebugger,
    EventTriggered { tag: Tag, context: u64 },
    ProcessSwitched(ProcessId),
    ThreadSwitched(ThreadId),
    EntryPointReached { token: Token, thread: ThreadId },
    InstrumentationStepCompleted,
    SoftwareBreakpointHit,
    HardwareDebugBreakpointHit,
    UserThreadPaused { token: Token, thread: ThreadId },
    /// Ownership of the halt was handed to this core
    HaltedByOtherCore,
    /// The non-root half finished running a debugger command
    CommandExecutionFinished,
}

/// Sent to the debugger whenever something stops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltNotice {
    pub core: CoreId,
    pub process: ProcessId,
    pub thread: ThreadId,
    pub rip: u64,
    pub reason: PausingReason,
    pub regs: GuestRegs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeCommand {
    Continue,
    /// Run one instruction on the owning core and halt again
    InstrumentationStep,
    /// Make another halted core the owner
    SwitchCore(CoreId),
}

/// Work for a halted core, run on that core
pub type HaltedTask = Box<dyn FnOnce(&HvContext, CoreId) + Send>;

pub struct HaltController {
    owner: AtomicU32,
    halted: Vec<AtomicBool>,
    /// Generation plus one of the halt a core was asked to join, zero for none
    nmi_requests: Vec<AtomicU64>,
    tasks: Vec<Mutex<VecDeque<HaltedTask>>>,
    mailbox: Mutex<Option<ResumeCommand>>,
    generation: AtomicU64,
    cancel: AtomicBool,
    pause_requested: AtomicBool,
    thread_switch: Mutex<Option<ThreadId>>,
    process_switch: Mutex<Option<ProcessId>>,
}

impl std::fmt::Debug for HaltController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltController")
            .field("owner", &self.owner())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl HaltController {
    pub fn new(cores: u32) -> Self {
        let cores = cores as usize;
        Self {
            owner: AtomicU32::new(NO_OWNER),
            halted: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            nmi_requests: (0..cores).map(|_| AtomicU64::new(NO_REQUEST)).collect(),
            tasks: (0..cores).map(|_| Mutex::new(VecDeque::new())).collect(),
            mailbox: Mutex::new(None),
            generation: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            thread_switch: Mutex::new(None),
            process_switch: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> Option<CoreId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            core => Some(core),
        }
    }

    pub fn is_halted(&self, core: CoreId) -> bool {
        self.halted
            .get(core as usize)
            .is_some_and(|h| h.load(Ordering::Acquire))
    }

    pub fn halted_cores(&self) -> Vec<CoreId> {
        (0..self.halted.len() as CoreId)
            .filter(|c| self.is_halted(*c))
            .collect()
    }

    /// Stop the machine with `core` as the owner and wait until the debugger resumes
    ///
    /// Blocks. Must not be called with any lock held.
    pub fn break_to_debugger(
        &self,
        ctx: &HvContext,
        core: CoreId,
        regs: &mut GuestRegs,
        reason: PausingReason,
    ) {
        if core as usize >= self.halted.len() {
            error!("core {core} cannot halt, it is not virtualized");
            return;
        }
        loop {
            match self.owner.compare_exchange(
                NO_OWNER,
                core,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => {
                    // another core halts the machine, join it instead of spinning blind
                    self.halt_on_nmi(ctx, core, regs);
                    std::hint::spin_loop();
                }
            }
        }

        self.cancel.store(false, Ordering::Release);
        self.mailbox.lock().take();
        self.halted[core as usize].store(true, Ordering::Release);
        debug!("core {core} halts the machine: {reason:?}");
        self.notify(ctx, core, regs, reason);

        let request = self.generation.load(Ordering::Acquire) + 1;
        for (other, slot) in self.nmi_requests.iter().enumerate() {
            if other != core as usize {
                slot.store(request, Ordering::Release);
            }
        }
        ctx.collab.broadcast.send_halt_nmis(core);

        self.owner_loop(ctx, core, regs);
    }

    /// Handle an NMI on `core`, true if it was a halt NMI and must not reach the guest
    pub fn halt_on_nmi(&self, ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) -> bool {
        let Some(slot) = self.nmi_requests.get(core as usize) else {
            return false;
        };
        let request = slot.swap(NO_REQUEST, Ordering::AcqRel);
        if request == NO_REQUEST {
            return false;
        }

        if self.pause_requested.swap(false, Ordering::AcqRel) {
            self.break_to_debugger(ctx, core, regs, PausingReason::RequestFromDebugger);
            return true;
        }

        let generation = request - 1;
        if self.generation.load(Ordering::Acquire) != generation {
            trace!("core {core}: swallowing the halt nmi of an earlier halt");
            return true;
        }
        self.follower_loop(ctx, core, regs, generation);
        true
    }

    fn owner_loop(&self, ctx: &HvContext, core: CoreId, regs: &mut GuestRegs) {
        loop {
            if self.cancel.swap(false, Ordering::AcqRel) {
                warn!("core {core}: halt was cancelled");
                self.release(core);
                return;
            }
            self.run_tasks(ctx, core);

            let command = self.mailbox.lock().take();
            match command {
                Some(ResumeCommand::Continue) => {
                    info!("core {core}: resuming the machine");
                    self.release(core);
                    return;
                }
                Some(ResumeCommand::InstrumentationStep) => {
                    let armed = ctx.with_core(core, |state| {
                        state
                            .vmcs
                            .toggle_proc_control(ProcControls::MONITOR_TRAP_FLAG, true);
                        state.instrumentation_step = true;
                        state.break_on_mtf = true;
                        state.masking_events = true;
                    });
                    if let Err(e) = armed {
                        error!("could not arm the instrumentation step: {e}");
                    }
                    debug!("core {core}: stepping one instruction");
                    self.release(core);
                    return;
                }
                Some(ResumeCommand::SwitchCore(target)) => {
                    if target == core {
                        continue;
                    }
                    if !self.is_halted(target) {
                        error!("cannot switch to core {target}, it is not halted");
                        continue;
                    }
                    info!("switching from core {core} to core {target}");
                    let generation = self.generation.load(Ordering::Acquire);
                    self.owner.store(target, Ordering::Release);
                    self.follower_loop(ctx, core, regs, generation);
                    return;
                }
                None => (),
            }
            std::hint::spin_loop();
        }
    }

    fn follower_loop(&self, ctx: &HvContext, core: CoreId, regs: &mut GuestRegs, generation: u64) {
        self.halted[core as usize].store(true, Ordering::Release);
        trace!("core {core} follows the halt");
        loop {
            if self.owner.load(Ordering::Acquire) == core {
                self.notify(ctx, core, regs, PausingReason::HaltedByOtherCore);
                self.owner_loop(ctx, core, regs);
                return;
            }
            if self.generation.load(Ordering::Acquire) != generation {
                break;
            }
            self.run_tasks(ctx, core);
            std::hint::spin_loop();
        }
        self.halted[core as usize].store(false, Ordering::Release);
    }

    fn release(&self, core: CoreId) {
        self.halted[core as usize].store(false, Ordering::Release);
        self.owner.store(NO_OWNER, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn run_tasks(&self, ctx: &HvContext, core: CoreId) {
        loop {
            let task = self.tasks[core as usize].lock().pop_front();
            match task {
                Some(task) => task(ctx, core),
                None => return,
            }
        }
    }

    fn notify(&self, ctx: &HvContext, core: CoreId, regs: &GuestRegs, reason: PausingReason) {
        let rip = ctx
            .with_core(core, |state| state.vmcs.guest_rip())
            .unwrap_or_default();
        let notice = HaltNotice {
            core,
            process: ctx.collab.guest.current_process(core),
            thread: ctx.collab.guest.current_thread(core),
            rip,
            reason,
            regs: *regs,
        };
        ctx.collab.transport.notify_halt(&notice);
    }

    /// Hand a command to the owner of the current halt
    ///
    /// # Errors
    ///
    /// Fails with [`HvError::NotHalted`] if no core is halted.
    pub fn resume(&self, command: ResumeCommand) -> Result<()> {
        if self.owner().is_none() {
            return Err(HvError::NotHalted);
        }
        *self.mailbox.lock() = Some(command);
        Ok(())
    }

    /// Halt the machine at the next NMI
    pub fn request_pause(&self, ctx: &HvContext) {
        self.pause_requested.store(true, Ordering::Release);
        let request = self.generation.load(Ordering::Acquire) + 1;
        for slot in &self.nmi_requests {
            slot.store(request, Ordering::Release);
        }
        ctx.collab.broadcast.send_halt_nmis(NO_OWNER);
    }

    /// Queue `task` to run on the halted `core`
    ///
    /// # Errors
    ///
    /// Fails if the core does not exist or is not halted.
    pub fn run_on_halted_core(&self, core: CoreId, task: HaltedTask) -> Result<()> {
        if core as usize >= self.halted.len() {
            return Err(HvError::InvalidCoreId(core));
        }
        if !self.is_halted(core) {
            return Err(HvError::NotHalted);
        }
        self.tasks[core as usize].lock().push_back(task);
        Ok(())
    }

    /// Let the owner give up the halt without a resume command
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub(crate) fn set_thread_switch_target(&self, thread: Option<ThreadId>) {
        *self.thread_switch.lock() = thread;
    }

    pub(crate) fn set_process_switch_target(&self, process: Option<ProcessId>) {
        *self.process_switch.lock() = process;
    }

    pub fn thread_switch_target(&self) -> Option<ThreadId> {
        *self.thread_switch.lock()
    }

    pub fn process_switch_target(&self) -> Option<ProcessId> {
        *self.process_switch.lock()
    }
}

impl HvContext {
    /// Stop a pending instrumentation step of `core` before it completes
    pub fn cancel_step(&self, core: CoreId) -> Result<()> {
        self.with_core(core, |state| {
            state.instrumentation_step = false;
            state.break_on_mtf = false;
            state.masking_events = false;
        })
    }

    /// Halt as soon as `thread` runs on any core
    pub fn watch_thread_switch(&self, thread: ThreadId) -> Result<()> {
        self.halt.set_thread_switch_target(Some(thread));
        self.features
            .set(&self.features.intercept_clock_interrupts_for_thread_change, true);
        self.broadcast_hypercall(
            CoreFilter::All,
            HypercallCode::EnableExternalInterruptExiting,
            0,
            0,
            0,
        )
    }

    /// Halt as soon as `process` is scheduled on any core
    pub fn watch_process_switch(&self, process: ProcessId) -> Result<()> {
        if !self.collab.guest.process_exists(process) {
            return Err(HvError::InvalidProcessId(process));
        }
        self.halt.set_process_switch_target(Some(process));
        self.features.set(
            &self.features.intercept_clock_interrupts_for_process_change,
            true,
        );
        self.collab.broadcast.run_on_each(&|core| {
            if let Err(e) = self.with_core(core, |state| state.waiting_for_mov_cr3 = true) {
                error!("{e}");
            }
        });
        self.broadcast_hypercall(
            CoreFilter::All,
            HypercallCode::EnableExternalInterruptExiting,
            0,
            0,
            0,
        )?;
        self.broadcast_hypercall(CoreFilter::All, HypercallCode::EnableMovToCr3Exiting, 0, 0, 0)
    }

    /// Halt if the thread being watched for is now running on `core`
    pub(crate) fn check_thread_switch(&self, core: CoreId, regs: &mut GuestRegs) -> bool {
        let Some(target) = self.halt.thread_switch_target() else {
            return false;
        };
        if self.collab.guest.current_thread(core) != target {
            return false;
        }
        self.halt.set_thread_switch_target(None);
        self.features
            .set(&self.features.intercept_clock_interrupts_for_thread_change, false);
        self.unset_on_cores(
            CoreFilter::All,
            ProtectedResource::ExternalInterruptExiting,
            1,
            PassOver::empty(),
        );
        self.halt
            .break_to_debugger(self, core, regs, PausingReason::ThreadSwitched(target));
        true
    }

    /// Halt if the process being watched for is now running on `core`
    pub(crate) fn check_process_switch(&self, core: CoreId, regs: &mut GuestRegs) -> bool {
        let Some(target) = self.halt.process_switch_target() else {
            return false;
        };
        if self.collab.guest.current_process(core) != target {
            return false;
        }
        self.halt.set_process_switch_target(None);
        self.features.set(
            &self.features.intercept_clock_interrupts_for_process_change,
            false,
        );
        self.collab.broadcast.run_on_each(&|c| {
            if let Err(e) = self.with_core(c, |state| state.waiting_for_mov_cr3 = false) {
                error!("{e}");
            }
        });
        self.unset_on_cores(
            CoreFilter::All,
            ProtectedResource::ExternalInterruptExiting,
            1,
            PassOver::empty(),
        );
        self.unset_on_cores(
            CoreFilter::All,
            ProtectedResource::MovToCr3Exiting,
            1,
            PassOver::empty(),
        );
        self.halt
            .break_to_debugger(self, core, regs, PausingReason::ProcessSwitched(target));
        true
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::HvConfig;
    use crate::sim::SimMachine;

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "timed out waiting for {what}"
            );
            thread::yield_now();
        }
    }

    fn halt_on(machine: &SimMachine, core: CoreId, reason: PausingReason) -> thread::JoinHandle<()> {
        let ctx = Arc::clone(&machine.ctx);
        thread::spawn(move || {
            let mut regs = GuestRegs::default();
            ctx.halt().break_to_debugger(&ctx, core, &mut regs, reason);
        })
    }

    fn follow_on(machine: &SimMachine, core: CoreId) -> thread::JoinHandle<bool> {
        let ctx = Arc::clone(&machine.ctx);
        thread::spawn(move || {
            let mut regs = GuestRegs::default();
            ctx.halt().halt_on_nmi(&ctx, core, &mut regs)
        })
    }

    #[test]
    fn test_resume_without_halt_fails() {
        let machine = SimMachine::new(HvConfig::default());
        assert!(matches!(
            machine.ctx.halt().resume(ResumeCommand::Continue),
            Err(HvError::NotHalted)
        ));
    }

    #[test]
    fn test_owner_halts_and_others_follow() {
        let machine = SimMachine::new(HvConfig::default());
        let owner = halt_on(&machine, 0, PausingReason::RequestFromDebugger);
        wait_until("owner", || machine.ctx.halt().owner() == Some(0));
        assert_eq!(machine.broadcast.halt_nmis(), vec![0]);

        let follower = follow_on(&machine, 1);
        wait_until("follower", || machine.ctx.halt().is_halted(1));
        assert_eq!(machine.ctx.halt().halted_cores(), vec![0, 1]);

        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        owner.join().unwrap();
        assert!(follower.join().unwrap());
        assert!(machine.ctx.halt().halted_cores().is_empty());
        assert_eq!(machine.ctx.halt().owner(), None);

        let notices = machine.transport.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reason, PausingReason::RequestFromDebugger);
    }

    #[test]
    fn test_stale_halt_nmi_is_swallowed() {
        let machine = SimMachine::new(HvConfig::default());
        let owner = halt_on(&machine, 0, PausingReason::SoftwareBreakpointHit);
        wait_until("owner", || machine.ctx.halt().owner() == Some(0));
        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        owner.join().unwrap();

        // core 2 only sees its halt nmi now
        let mut regs = GuestRegs::default();
        assert!(machine.ctx.halt().halt_on_nmi(&machine.ctx, 2, &mut regs));
        // a guest nmi is not ours
        assert!(!machine.ctx.halt().halt_on_nmi(&machine.ctx, 2, &mut regs));
    }

    #[test]
    fn test_switch_core_hands_over_ownership() {
        let machine = SimMachine::new(HvConfig::default());
        let owner = halt_on(&machine, 0, PausingReason::RequestFromDebugger);
        wait_until("owner", || machine.ctx.halt().owner() == Some(0));
        let follower = follow_on(&machine, 3);
        wait_until("follower", || machine.ctx.halt().is_halted(3));

        machine.ctx.halt().resume(ResumeCommand::SwitchCore(3)).unwrap();
        wait_until("switch", || machine.ctx.halt().owner() == Some(3));
        wait_until("notice", || machine.transport.notices().len() == 2);
        let notices = machine.transport.notices();
        assert_eq!(notices[1].core, 3);
        assert_eq!(notices[1].reason, PausingReason::HaltedByOtherCore);
        assert!(machine.ctx.halt().is_halted(0));

        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        owner.join().unwrap();
        follower.join().unwrap();
        assert!(machine.ctx.halt().halted_cores().is_empty());
    }

    #[test]
    fn test_task_runs_on_halted_core() {
        let machine = SimMachine::new(HvConfig::default());
        assert!(machine
            .ctx
            .halt()
            .run_on_halted_core(0, Box::new(|_: &HvContext, _: CoreId| ()))
            .is_err());

        let owner = halt_on(&machine, 0, PausingReason::RequestFromDebugger);
        wait_until("owner", || machine.ctx.halt().owner() == Some(0));
        let follower = follow_on(&machine, 1);
        wait_until("follower", || machine.ctx.halt().is_halted(1));

        let ran_on = Arc::new(AtomicU32::new(NO_OWNER));
        let seen = ran_on.clone();
        machine
            .ctx
            .halt()
            .run_on_halted_core(
                1,
                Box::new(move |_: &HvContext, core: CoreId| {
                    seen.store(core, Ordering::SeqCst)
                }),
            )
            .unwrap();
        wait_until("task", || ran_on.load(Ordering::SeqCst) == 1);

        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        owner.join().unwrap();
        follower.join().unwrap();
    }

    #[test]
    fn test_instrumentation_step_arms_mtf() {
        let machine = SimMachine::new(HvConfig::default());
        let owner = halt_on(&machine, 2, PausingReason::RequestFromDebugger);
        wait_until("owner", || machine.ctx.halt().owner() == Some(2));
        machine
            .ctx
            .halt()
            .resume(ResumeCommand::InstrumentationStep)
            .unwrap();
        owner.join().unwrap();
        machine
            .ctx
            .with_core(2, |c| {
                assert!(c.vmcs.proc_controls().contains(ProcControls::MONITOR_TRAP_FLAG));
                assert!(c.instrumentation_step && c.break_on_mtf && c.masking_events);
            })
            .unwrap();

        machine.ctx.cancel_step(2).unwrap();
        assert!(!machine.ctx.with_core(2, |c| c.is_stepping()).unwrap());
    }

    #[test]
    fn test_cancel_releases_owner() {
        let machine = SimMachine::new(HvConfig::default());
        let owner = halt_on(&machine, 1, PausingReason::RequestFromDebugger);
        wait_until("owner", || machine.ctx.halt().owner() == Some(1));
        machine.ctx.halt().cancel();
        owner.join().unwrap();
        assert_eq!(machine.ctx.halt().owner(), None);
    }

    #[test]
    fn test_requested_pause_makes_first_nmi_the_owner() {
        let machine = SimMachine::new(HvConfig::default());
        machine.ctx.halt().request_pause(&machine.ctx);
        let owner = follow_on(&machine, 2);
        wait_until("owner", || machine.ctx.halt().owner() == Some(2));
        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        assert!(owner.join().unwrap());
        assert_eq!(
            machine.transport.notices()[0].reason,
            PausingReason::RequestFromDebugger
        );
    }

    #[test]
    fn test_process_switch_watch() {
        let machine = SimMachine::new(HvConfig::default());
        machine.ctx.watch_process_switch(8).unwrap();
        assert!(machine.ctx.with_core(1, |c| c.waiting_for_mov_cr3).unwrap());
        assert!(machine
            .ctx
            .features()
            .intercept_clock_interrupts_for_process_change());

        let mut regs = GuestRegs::default();
        // still in process 4
        assert!(!machine.ctx.check_process_switch(1, &mut regs));

        machine.guest.set_current_process(8);
        let ctx = Arc::clone(&machine.ctx);
        let switched = thread::spawn(move || {
            let mut regs = GuestRegs::default();
            ctx.check_process_switch(1, &mut regs)
        });
        wait_until("owner", || machine.ctx.halt().owner() == Some(1));
        machine.ctx.halt().resume(ResumeCommand::Continue).unwrap();
        assert!(switched.join().unwrap());
        assert_eq!(
            machine.transport.notices()[0].reason,
            PausingReason::ProcessSwitched(8)
        );
        assert_eq!(machine.ctx.halt().process_switch_target(), None);
        assert!(!machine.ctx.with_core(1, |c| c.waiting_for_mov_cr3).unwrap());
        assert!(machine
            .ctx
            .with_core(0, |c| !c.vmcs.proc_controls().contains(ProcControls::CR3_LOAD_EXITING))
            .unwrap());
    }
}

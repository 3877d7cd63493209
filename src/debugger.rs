//! # Debugger session
//!
//! Drives a [`SimMachine`] with the commands of a [`DebuggerUI`]. Simulated vm-exits run on
//! worker threads, so an exit that halts the machine does not block the session: the
//! halted core waits in its worker until a later [`Status::Resume`] releases it, and
//! [`Status::CollectExits`] picks up the results.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::config::HvConfig;
use crate::consts::{
    HYPERCALL_MAGIC_R10, HYPERCALL_MAGIC_R11, HYPERCALL_MAGIC_R12, MAX_GUEST_BUFFER_SIZE,
};
use crate::disassemble::Disassembly;
use crate::errors::{HvError, Result};
use crate::extension_points::GuestOs;
use crate::feedback::{ExitReport, Feedback};
use crate::hypercall::handle_vmcall;
use crate::regs::GuestRegs;
use crate::sim::{run_exit, SimMachine, SyntheticExit};
use crate::ui::{DebuggerUI, Status};
use crate::vmexit::ExitOutcome;
use crate::{Addr, CoreId, ProcessId};

struct Worker {
    ticket: u64,
    core: CoreId,
    handle: JoinHandle<(GuestRegs, Result<ExitOutcome>)>,
}

pub struct Debugger<UI: DebuggerUI> {
    machine: SimMachine,
    ui: UI,
    next_ticket: u64,
    workers: Vec<Worker>,
}

impl<UI: DebuggerUI> Debugger<UI> {
    pub fn build(config: HvConfig, ui: UI) -> Result<Self> {
        if config.cores == 0 {
            let err = HvError::InvalidCoreId(0);
            error!("a machine needs at least one core: {err}");
            return Err(err);
        }
        info!("simulating a machine with {} cores", config.cores);
        Ok(Debugger {
            machine: SimMachine::new(config),
            ui,
            next_ticket: 0,
            workers: Vec::new(),
        })
    }

    pub fn machine(&self) -> &SimMachine {
        &self.machine
    }

    pub fn run_debugger(&mut self) -> Result<()> {
        let mut feedback: Feedback = Feedback::Ok;
        loop {
            let ui_res = self.ui.process(feedback);
            feedback = match ui_res {
                Err(e) => {
                    error!("{e}");
                    return Err(e);
                }
                Ok(Status::DebuggerQuit) => break,
                Ok(status) => self.execute(status).into(),
            };
        }

        Ok(())
    }

    /// Run one command of the session
    pub fn execute(&mut self, status: Status) -> Result<Feedback> {
        let ctx = &self.machine.ctx;
        match status {
            Status::RegisterEvent(request) => Ok(Feedback::Registered(ctx.register_event(request))),
            Status::ModifyEvent(tag, kind) => Ok(Feedback::EventState(ctx.modify_event(tag, kind)?)),
            Status::RemoveEvent(tag) => ctx.remove_event(tag).map(|()| Feedback::Ok),
            Status::RemoveAllEvents => ctx.remove_all_events().map(|()| Feedback::Ok),
            Status::ListEvents => Ok(Feedback::Events(ctx.list_events())),
            Status::Hypercall {
                core,
                call,
                p1,
                p2,
                p3,
            } => self.hypercall(core, call, p1, p2, p3),
            Status::Attach {
                pid,
                check_entry_point,
            } => Ok(Feedback::Attached(ctx.attach(pid, check_entry_point)?)),
            Status::Detach(token) => ctx.detach(token).map(|()| Feedback::Ok),
            Status::Kill(pid) => Ok(Feedback::Killed(ctx.kill_process(pid)?)),
            Status::PauseProcess(token) => ctx.pause_process(token).map(|()| Feedback::Ok),
            Status::ContinueProcess(token) => ctx.continue_process(token).map(|()| Feedback::Ok),
            Status::ThreadAction {
                token,
                thread,
                action,
            } => ctx
                .queue_thread_action(token, thread, action)
                .map(|()| Feedback::Ok),
            Status::SwitchThread { token, thread } => {
                ctx.switch_thread(token, thread).map(|()| Feedback::Ok)
            }
            Status::QueryProcesses => Ok(Feedback::Processes(ctx.query_processes())),
            Status::Disassemble {
                process,
                address,
                len,
            } => self.disassemble(process, address, len),
            Status::Resume(command) => ctx.halt().resume(command).map(|()| Feedback::Ok),
            Status::PauseGuest => {
                ctx.halt().request_pause(ctx);
                Ok(Feedback::Ok)
            }
            Status::VmExit { core, exit, regs } => self.start_exit(core, exit, regs),
            Status::CollectExits => Ok(self.collect_exits()),
            Status::DebuggerQuit => Ok(Feedback::Ok),
        }
    }

    fn hypercall(&self, core: CoreId, call: u64, p1: u64, p2: u64, p3: u64) -> Result<Feedback> {
        if core >= self.machine.ctx.core_count() {
            return Err(HvError::InvalidCoreId(core));
        }
        let mut regs = GuestRegs {
            rcx: call,
            rdx: p1,
            r8: p2,
            r9: p3,
            r10: HYPERCALL_MAGIC_R10,
            r11: HYPERCALL_MAGIC_R11,
            r12: HYPERCALL_MAGIC_R12,
            ..Default::default()
        };
        handle_vmcall(&self.machine.ctx, core, &mut regs);
        Ok(Feedback::HypercallStatus(regs.rax))
    }

    fn disassemble(&self, process: ProcessId, address: Addr, len: usize) -> Result<Feedback> {
        if len as u64 > MAX_GUEST_BUFFER_SIZE {
            let err = HvError::BufferTooLarge(len as u64);
            error!("{err}");
            return Err(err);
        }
        let guest = &self.machine.ctx.collaborators().guest;
        let bitness = match guest.is_32bit(process) {
            Some(true) => 32,
            Some(false) => 64,
            None => {
                let err = HvError::UnableToDetectBitness(process);
                error!("{err}");
                return Err(err);
            }
        };
        let mut data = vec![0u8; len];
        guest.read_memory(process, address, &mut data)?;
        Ok(Feedback::Disassembly(Disassembly::disassemble(
            &data, address, bitness,
        )))
    }

    /// Hand a simulated exit to a worker thread
    pub fn start_exit(
        &mut self,
        core: CoreId,
        exit: SyntheticExit,
        mut regs: GuestRegs,
    ) -> Result<Feedback> {
        if core >= self.machine.ctx.core_count() {
            return Err(HvError::InvalidCoreId(core));
        }
        if self
            .workers
            .iter()
            .any(|w| w.core == core && !w.handle.is_finished())
        {
            let err = HvError::CoreBusy(core);
            warn!("{err}");
            return Err(err);
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let ctx = Arc::clone(&self.machine.ctx);
        let handle = thread::spawn(move || {
            let outcome = run_exit(&ctx, core, &exit, &mut regs);
            (regs, outcome)
        });
        debug!("exit {ticket} runs on core {core}");
        self.workers.push(Worker {
            ticket,
            core,
            handle,
        });
        Ok(Feedback::ExitStarted { ticket, core })
    }

    /// Results of every finished exit and what the machine sent since the last collection
    pub fn collect_exits(&mut self) -> Feedback {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.workers = running;

        let finished = finished
            .into_iter()
            .map(|worker| {
                let (regs, outcome, error) = match worker.handle.join() {
                    Ok((regs, Ok(outcome))) => (regs, Some(outcome), None),
                    Ok((regs, Err(e))) => (regs, None, Some(e.to_string())),
                    Err(_) => {
                        error!("the worker of exit {} panicked", worker.ticket);
                        (GuestRegs::default(), None, Some("worker panicked".to_string()))
                    }
                };
                ExitReport {
                    ticket: worker.ticket,
                    core: worker.core,
                    regs,
                    outcome,
                    error,
                }
            })
            .collect();

        let (messages, notices) = self.machine.transport.drain();
        Feedback::Exits {
            finished,
            notices,
            messages,
        }
    }

    /// Release a halted machine and wait for every worker
    pub fn cleanup(&mut self) -> Result<()> {
        let halt = self.machine.ctx.halt();
        while self.workers.iter().any(|w| !w.handle.is_finished()) {
            if halt.owner().is_some() {
                halt.cancel();
            }
            thread::yield_now();
        }
        let left = self.workers.len();
        self.collect_exits();
        debug!("joined {left} workers");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::errors::STATUS_SUCCESS;
    use crate::event::{ActionKindRequest, EventRequest, EventType};
    use crate::halt::{PausingReason, ResumeCommand};
    use crate::hypercall::HypercallCode;
    use crate::sim::{EmulatedCall, SIM_PROCESS};
    use crate::vmcs::ExitReason;

    /// Plays a fixed list of commands and keeps every feedback
    struct ScriptedUI {
        commands: VecDeque<Status>,
        feedbacks: Vec<Feedback>,
    }

    impl DebuggerUI for ScriptedUI {
        fn process(&mut self, feedback: Feedback) -> Result<Status> {
            self.feedbacks.push(feedback);
            Ok(self.commands.pop_front().unwrap_or(Status::DebuggerQuit))
        }
    }

    fn scripted(commands: Vec<Status>) -> ScriptedUI {
        ScriptedUI {
            commands: commands.into(),
            feedbacks: Vec::new(),
        }
    }

    fn debugger() -> Debugger<ScriptedUI> {
        Debugger::build(HvConfig::default(), scripted(Vec::new())).unwrap()
    }

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

    fn collect_all(dbg: &mut Debugger<ScriptedUI>) -> Vec<ExitReport> {
        wait_until("workers", || dbg.workers.iter().all(|w| w.handle.is_finished()));
        match dbg.collect_exits() {
            Feedback::Exits { finished, .. } => finished,
            other => panic!("unexpected feedback {other}"),
        }
    }

    #[test]
    fn test_session_loop() {
        let ui = scripted(vec![
            Status::RegisterEvent(
                EventRequest::new(EventType::CpuidInstructionExecution)
                    .with_action(ActionKindRequest::LogState),
            ),
            Status::ListEvents,
            Status::RemoveEvent(0xdead),
        ]);
        let mut dbg = Debugger::build(HvConfig::default(), ui).unwrap();
        dbg.run_debugger().unwrap();

        let feedbacks = &dbg.ui.feedbacks;
        assert_eq!(feedbacks.len(), 4);
        assert_eq!(feedbacks[0], Feedback::Ok);
        let tag = match &feedbacks[1] {
            Feedback::Registered(r) => {
                assert_eq!(r.status, STATUS_SUCCESS);
                r.tag.unwrap()
            }
            other => panic!("unexpected feedback {other}"),
        };
        match &feedbacks[2] {
            Feedback::Events(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].tag, tag);
            }
            other => panic!("unexpected feedback {other}"),
        }
        assert!(matches!(feedbacks[3], Feedback::Error { .. }));
    }

    #[test]
    fn test_exit_runs_on_worker() {
        let mut dbg = debugger();
        let exit = SyntheticExit::instruction(ExitReason::Cpuid, 0x1000, 2);
        let started = dbg
            .execute(Status::VmExit {
                core: 1,
                exit,
                regs: GuestRegs::default(),
            })
            .unwrap();
        assert_eq!(started, Feedback::ExitStarted { ticket: 0, core: 1 });

        let finished = collect_all(&mut dbg);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].core, 1);
        assert!(finished[0].error.is_none());
        assert_eq!(finished[0].outcome.unwrap().reason, Some(ExitReason::Cpuid));
        assert!(dbg.machine().emulator.calls().contains(&EmulatedCall::Cpuid(1)));
    }

    #[test]
    fn test_halted_exit_waits_for_resume() {
        let mut dbg = debugger();
        let registered = dbg
            .execute(Status::RegisterEvent(
                EventRequest::new(EventType::CpuidInstructionExecution)
                    .with_action(ActionKindRequest::BreakToDebugger),
            ))
            .unwrap();
        assert!(matches!(registered, Feedback::Registered(r) if r.status == STATUS_SUCCESS));

        let exit = SyntheticExit::instruction(ExitReason::Cpuid, 0x1000, 2);
        dbg.start_exit(0, exit.clone(), GuestRegs::default()).unwrap();
        wait_until("halt", || dbg.machine().ctx.halt().owner() == Some(0));

        // the core is stuck in its exit
        assert!(matches!(
            dbg.start_exit(0, exit, GuestRegs::default()),
            Err(HvError::CoreBusy(0))
        ));

        dbg.execute(Status::Resume(ResumeCommand::Continue)).unwrap();
        wait_until("workers", || dbg.workers.iter().all(|w| w.handle.is_finished()));
        match dbg.execute(Status::CollectExits).unwrap() {
            Feedback::Exits {
                finished, notices, ..
            } => {
                assert_eq!(finished.len(), 1);
                assert!(finished[0].outcome.is_some());
                assert_eq!(notices.len(), 1);
                assert!(matches!(
                    notices[0].reason,
                    PausingReason::EventTriggered { .. }
                ));
            }
            other => panic!("unexpected feedback {other}"),
        }
    }

    #[test]
    fn test_cleanup_releases_halt() {
        let mut dbg = debugger();
        dbg.execute(Status::RegisterEvent(
            EventRequest::new(EventType::CpuidInstructionExecution)
                .with_action(ActionKindRequest::BreakToDebugger),
        ))
        .unwrap();
        dbg.start_exit(2, SyntheticExit::instruction(ExitReason::Cpuid, 0x1000, 2), GuestRegs::default())
            .unwrap();
        wait_until("halt", || dbg.machine().ctx.halt().owner() == Some(2));
        dbg.cleanup().unwrap();
        assert!(dbg.workers.is_empty());
        assert_eq!(dbg.machine().ctx.halt().owner(), None);
    }

    #[test]
    fn test_raw_hypercall() {
        let mut dbg = debugger();
        let status = dbg
            .execute(Status::Hypercall {
                core: 0,
                call: HypercallCode::Test.code() as u64,
                p1: 1,
                p2: 2,
                p3: 3,
            })
            .unwrap();
        assert_eq!(status, Feedback::HypercallStatus(0));
        assert!(dbg
            .execute(Status::Hypercall {
                core: 99,
                call: 1,
                p1: 0,
                p2: 0,
                p3: 0,
            })
            .is_err());
    }

    #[test]
    fn test_disassemble_guest_code() {
        let mut dbg = debugger();
        // sub rsp, 8; ret
        dbg.machine()
            .guest
            .write(SIM_PROCESS, 0x1000, &[0x48, 0x83, 0xec, 0x08, 0xc3]);
        match dbg
            .execute(Status::Disassemble {
                process: SIM_PROCESS,
                address: Addr::from(0x1000u64),
                len: 5,
            })
            .unwrap()
        {
            Feedback::Disassembly(listing) => {
                assert_eq!(listing.len(), 2);
                assert_eq!(listing.inner()[1].0, Addr::from(0x1004u64));
            }
            other => panic!("unexpected feedback {other}"),
        }
        assert!(dbg
            .execute(Status::Disassemble {
                process: 0xdead,
                address: Addr::from(0x1000u64),
                len: 5,
            })
            .is_err());
        assert!(matches!(
            dbg.execute(Status::Disassemble {
                process: SIM_PROCESS,
                address: Addr::from(0x1000u64),
                len: usize::MAX,
            }),
            Err(HvError::BufferTooLarge(_))
        ));
    }

    #[test]
    fn test_attach_and_query() {
        let mut dbg = debugger();
        let token = match dbg
            .execute(Status::Attach {
                pid: SIM_PROCESS,
                check_entry_point: false,
            })
            .unwrap()
        {
            Feedback::Attached(token) => token,
            other => panic!("unexpected feedback {other}"),
        };
        match dbg.execute(Status::QueryProcesses).unwrap() {
            Feedback::Processes(p) => {
                assert_eq!(p.len(), 1);
                assert_eq!(p[0].token, token);
                assert_eq!(p[0].pid, SIM_PROCESS);
            }
            other => panic!("unexpected feedback {other}"),
        }
        dbg.execute(Status::Detach(token)).unwrap();
        assert!(Feedback::from(dbg.execute(Status::Detach(token))) != Feedback::Ok);
    }
}

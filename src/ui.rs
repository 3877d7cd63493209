use serde::{Deserialize, Serialize};

use crate::attach::ThreadAction;
use crate::errors::Result;
use crate::event::{EventRequest, ModifyKind};
use crate::feedback::Feedback;
use crate::halt::ResumeCommand;
use crate::regs::GuestRegs;
use crate::sim::SyntheticExit;
use crate::{Addr, CoreId, ProcessId, Tag, ThreadId, Token};

pub mod json;

/// A command of the debugger session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    RegisterEvent(EventRequest),
    ModifyEvent(Tag, ModifyKind),
    RemoveEvent(Tag),
    RemoveAllEvents,
    ListEvents,
    /// Issue a hypercall from `core` as the non-root half would
    Hypercall {
        core: CoreId,
        call: u64,
        p1: u64,
        p2: u64,
        p3: u64,
    },
    Attach {
        pid: ProcessId,
        check_entry_point: bool,
    },
    Detach(Token),
    Kill(ProcessId),
    PauseProcess(Token),
    ContinueProcess(Token),
    ThreadAction {
        token: Token,
        thread: ThreadId,
        action: ThreadAction,
    },
    SwitchThread {
        token: Token,
        thread: ThreadId,
    },
    QueryProcesses,
    /// List `len` bytes of guest code
    Disassemble {
        process: ProcessId,
        address: Addr,
        len: usize,
    },
    Resume(ResumeCommand),
    PauseGuest,
    /// Run a simulated exit on a worker thread
    VmExit {
        core: CoreId,
        exit: SyntheticExit,
        #[serde(default)]
        regs: GuestRegs,
    },
    /// Collect the finished exits and everything the engine sent meanwhile
    CollectExits,
    DebuggerQuit,
}

pub trait DebuggerUI {
    fn process(&mut self, feedback: Feedback) -> Result<Status>;
}

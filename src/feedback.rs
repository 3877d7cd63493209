use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::attach::ProcessSummary;
use crate::disassemble::Disassembly;
use crate::errors::{HvError, Result};
use crate::event::{EventSummary, RegistrationResult};
use crate::extension_points::{KillMethod, MessageKind};
use crate::halt::HaltNotice;
use crate::regs::GuestRegs;
use crate::vmexit::ExitOutcome;
use crate::{CoreId, Token};

/// A simulated vm-exit that finished on its worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub ticket: u64,
    pub core: CoreId,
    /// Guest registers after the exit was handled
    pub regs: GuestRegs,
    pub outcome: Option<ExitOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Feedback {
    Ok,
    Error {
        status: u32,
        message: String,
    },
    Registered(RegistrationResult),
    EventState(Option<bool>),
    Events(Vec<EventSummary>),
    /// rax after a raw hypercall
    HypercallStatus(u64),
    Attached(Token),
    Killed(KillMethod),
    Processes(Vec<ProcessSummary>),
    Disassembly(Disassembly),
    ExitStarted {
        ticket: u64,
        core: CoreId,
    },
    Exits {
        finished: Vec<ExitReport>,
        notices: Vec<HaltNotice>,
        messages: Vec<(MessageKind, Vec<u8>)>,
    },
}

impl Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feedback::Ok => write!(f, "Ok")?,
            Feedback::Error { status, message } => write!(f, "Error ({status:#x}): {message}")?,
            Feedback::Registered(r) => write!(f, "Registered: {r:x?}")?,
            Feedback::EventState(s) => write!(f, "Event state: {s:?}")?,
            Feedback::Events(e) => write!(f, "Events: {e:#x?}")?,
            Feedback::HypercallStatus(s) => write!(f, "Hypercall status: {s:#x}")?,
            Feedback::Attached(t) => write!(f, "Attached: token {t:#x}")?,
            Feedback::Killed(m) => write!(f, "Killed with {m:?}")?,
            Feedback::Processes(p) => write!(f, "Processes: {p:#x?}")?,
            Feedback::Disassembly(d) => write!(f, "{d}")?,
            Feedback::ExitStarted { ticket, core } => {
                write!(f, "Exit {ticket} started on core {core}")?
            }
            Feedback::Exits {
                finished,
                notices,
                messages,
            } => write!(
                f,
                "{} exits finished, {} halt notices, {} messages",
                finished.len(),
                notices.len(),
                messages.len()
            )?,
        }

        Ok(())
    }
}

impl From<HvError> for Feedback {
    fn from(value: HvError) -> Self {
        Feedback::Error {
            status: value.status_code(),
            message: value.to_string(),
        }
    }
}

impl From<Result<Feedback>> for Feedback {
    fn from(value: Result<Feedback>) -> Self {
        match value {
            Ok(f) => f,
            Err(e) => e.into(),
        }
    }
}

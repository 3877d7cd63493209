//! # Debugger events and actions
//!
//! An [`Event`] describes *when* the debugger wants to know about something happening in the
//! guest (a syscall, an MSR access, an exception, ...), its [`Action`]s describe *what* to
//! do about it. Events are registered from serialized [`EventRequest`]s and live in the
//! [`EventRegistry`](crate::registry::EventRegistry).
//!
//! The two generic parameters `p1` and `p2` of an event are interpreted per
//! [`EventType`]:
//!
//! | type                           | p1                        | p2            |
//! |--------------------------------|---------------------------|---------------|
//! | exception                      | vector or [`ALL`]         |               |
//! | external interrupt             | vector (32..=255)         |               |
//! | rdmsr / wrmsr                  | msr or [`ALL`]            |               |
//! | in / out                       | port or [`ALL`]           |               |
//! | syscall                        | syscall number or [`ALL`] |               |
//! | control register               | 0, 3 or 4                 | mask          |
//! | hidden read / write            | range start               | range end     |
//! | hidden exec-cc / detours       | address                   |               |

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::consts::{ALL, ALL_U64};
use crate::errors::HvError;
use crate::regs::GuestRegs;
use crate::{CoreId, ProcessId, Tag, ThreadId};

/// Routine behind a run-custom-code action
///
/// It receives a zeroed scratch buffer, the registers of the triggering core and the
/// event context. A returned buffer is delivered to the debugger.
pub type CustomRoutine = Arc<dyn Fn(&mut [u8], &GuestRegs, u64) -> Option<Vec<u8>> + Send + Sync>;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    HiddenHookRead = 0,
    HiddenHookWrite = 1,
    HiddenHookReadAndWrite = 2,
    HiddenHookExecDetours = 3,
    HiddenHookExecCc = 4,
    SyscallHookEferSyscall = 5,
    SyscallHookEferSysret = 6,
    CpuidInstructionExecution = 7,
    RdmsrInstructionExecution = 8,
    WrmsrInstructionExecution = 9,
    InInstructionExecution = 10,
    OutInstructionExecution = 11,
    ExceptionOccurred = 12,
    ExternalInterruptOccurred = 13,
    DebugRegistersAccessed = 14,
    TscInstructionExecution = 15,
    PmcInstructionExecution = 16,
    VmcallInstructionExecution = 17,
    ControlRegisterModified = 18,
}

impl EventType {
    pub const ALL_TYPES: [EventType; 19] = [
        EventType::HiddenHookRead,
        EventType::HiddenHookWrite,
        EventType::HiddenHookReadAndWrite,
        EventType::HiddenHookExecDetours,
        EventType::HiddenHookExecCc,
        EventType::SyscallHookEferSyscall,
        EventType::SyscallHookEferSysret,
        EventType::CpuidInstructionExecution,
        EventType::RdmsrInstructionExecution,
        EventType::WrmsrInstructionExecution,
        EventType::InInstructionExecution,
        EventType::OutInstructionExecution,
        EventType::ExceptionOccurred,
        EventType::ExternalInterruptOccurred,
        EventType::DebugRegistersAccessed,
        EventType::TscInstructionExecution,
        EventType::PmcInstructionExecution,
        EventType::VmcallInstructionExecution,
        EventType::ControlRegisterModified,
    ];

    pub fn is_hidden_hook(self) -> bool {
        matches!(
            self,
            EventType::HiddenHookRead
                | EventType::HiddenHookWrite
                | EventType::HiddenHookReadAndWrite
                | EventType::HiddenHookExecDetours
                | EventType::HiddenHookExecCc
        )
    }

    pub fn is_syscall_hook(self) -> bool {
        matches!(
            self,
            EventType::SyscallHookEferSyscall | EventType::SyscallHookEferSysret
        )
    }
}

impl TryFrom<u32> for EventType {
    type Error = HvError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        EventType::ALL_TYPES
            .get(value as usize)
            .copied()
            .ok_or(HvError::EventTypeIsInvalid(value))
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Core an event is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoreFilter {
    #[default]
    All,
    Core(CoreId),
}

impl CoreFilter {
    /// Decode the raw form where [`ALL`] stands for every core
    pub fn from_raw(raw: u32) -> Self {
        if raw == ALL {
            CoreFilter::All
        } else {
            CoreFilter::Core(raw)
        }
    }

    pub fn matches(&self, core: CoreId) -> bool {
        match self {
            CoreFilter::All => true,
            CoreFilter::Core(c) => *c == core,
        }
    }
}

/// Process an event is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessFilter {
    #[default]
    All,
    Process(ProcessId),
}

impl ProcessFilter {
    pub fn from_raw(raw: u32) -> Self {
        if raw == ALL {
            ProcessFilter::All
        } else {
            ProcessFilter::Process(raw)
        }
    }

    pub fn matches(&self, process: ProcessId) -> bool {
        match self {
            ProcessFilter::All => true,
            ProcessFilter::Process(p) => *p == process,
        }
    }
}

#[derive(Clone)]
pub enum ActionKind {
    BreakToDebugger,
    LogState,
    RunCustomCode {
        name: String,
        routine: CustomRoutine,
        scratch_size: usize,
    },
    RunScript {
        script: Vec<u8>,
        scratch_size: usize,
    },
}

impl std::fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::BreakToDebugger => write!(f, "BreakToDebugger"),
            ActionKind::LogState => write!(f, "LogState"),
            ActionKind::RunCustomCode {
                name, scratch_size, ..
            } => write!(f, "RunCustomCode({name}, {scratch_size} bytes)"),
            ActionKind::RunScript {
                script,
                scratch_size,
            } => write!(
                f,
                "RunScript({} bytes, {scratch_size} bytes scratch)",
                script.len()
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    /// Deliver results right away instead of letting the transport batch them
    pub immediately_send_results: bool,
}

/// A registered event
#[derive(Debug)]
pub struct Event {
    pub tag: Tag,
    pub event_type: EventType,
    pub core: CoreFilter,
    pub process: ProcessFilter,
    pub p1: u64,
    pub p2: u64,
    pub condition: Option<Vec<u8>>,
    pub actions: Vec<Action>,
    enabled: AtomicBool,
}

impl Event {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tag: Tag,
        event_type: EventType,
        core: CoreFilter,
        process: ProcessFilter,
        p1: u64,
        p2: u64,
        condition: Option<Vec<u8>>,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            tag,
            event_type,
            core,
            process,
            p1,
            p2,
            condition,
            actions,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release)
    }

    /// Whether the event would be evaluated for an occurrence on `core` in `process`
    pub fn applies_to(&self, core: CoreId, process: ProcessId) -> bool {
        self.core.matches(core) && self.process.matches(process)
    }

    /// Type-specific check of the event parameters against the occurrence context
    pub fn params_match(&self, context: u64) -> bool {
        match self.event_type {
            EventType::ExternalInterruptOccurred => context == self.p1,
            EventType::HiddenHookRead
            | EventType::HiddenHookWrite
            | EventType::HiddenHookReadAndWrite => self.p1 <= context && context < self.p2,
            EventType::HiddenHookExecCc | EventType::HiddenHookExecDetours => {
                context == self.p1
            }
            EventType::RdmsrInstructionExecution
            | EventType::WrmsrInstructionExecution
            | EventType::ExceptionOccurred
            | EventType::InInstructionExecution
            | EventType::OutInstructionExecution
            | EventType::SyscallHookEferSyscall => self.p1 == ALL_U64 || self.p1 == context,
            EventType::ControlRegisterModified => context == self.p1,
            EventType::SyscallHookEferSysret
            | EventType::CpuidInstructionExecution
            | EventType::DebugRegistersAccessed
            | EventType::TscInstructionExecution
            | EventType::PmcInstructionExecution
            | EventType::VmcallInstructionExecution => true,
        }
    }

    pub fn summary(&self) -> EventSummary {
        EventSummary {
            tag: self.tag,
            event_type: self.event_type,
            enabled: self.is_enabled(),
            core: self.core,
            process: self.process,
            p1: self.p1,
            p2: self.p2,
            has_condition: self.condition.is_some(),
            actions: self.actions.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKindRequest {
    BreakToDebugger,
    LogState,
    /// A routine registered with
    /// [`EventRegistry::register_custom_routine`](crate::registry::EventRegistry::register_custom_routine)
    RunCustomCode {
        routine: String,
        scratch_size: usize,
    },
    RunScript {
        script: Vec<u8>,
        #[serde(default)]
        scratch_size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKindRequest,
    #[serde(default)]
    pub immediately_send_results: bool,
}

impl ActionRequest {
    pub fn new(kind: ActionKindRequest) -> Self {
        Self {
            kind,
            immediately_send_results: false,
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// Serialized description of an event and its actions, as sent by the command layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    /// Requested tag, a fresh one is minted if absent
    #[serde(default)]
    pub tag: Option<Tag>,
    pub event_type: EventType,
    #[serde(default)]
    pub core: CoreFilter,
    #[serde(default)]
    pub process: ProcessFilter,
    #[serde(default)]
    pub p1: u64,
    #[serde(default)]
    pub p2: u64,
    #[serde(default)]
    pub condition: Option<Vec<u8>>,
    pub actions: Vec<ActionRequest>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl EventRequest {
    pub fn new(event_type: EventType) -> Self {
        Self {
            tag: None,
            event_type,
            core: CoreFilter::All,
            process: ProcessFilter::All,
            p1: 0,
            p2: 0,
            condition: None,
            actions: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = Some(tag);
        self
    }
    pub fn on_core(mut self, core: CoreId) -> Self {
        self.core = CoreFilter::Core(core);
        self
    }
    pub fn in_process(mut self, process: ProcessId) -> Self {
        self.process = ProcessFilter::Process(process);
        self
    }
    pub fn with_params(mut self, p1: u64, p2: u64) -> Self {
        self.p1 = p1;
        self.p2 = p2;
        self
    }
    pub fn with_condition(mut self, condition: Vec<u8>) -> Self {
        self.condition = Some(condition);
        self
    }
    pub fn with_action(mut self, kind: ActionKindRequest) -> Self {
        self.actions.push(ActionRequest::new(kind));
        self
    }
}

/// What the command layer gets back from a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub status: u32,
    pub tag: Option<Tag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub tag: Tag,
    pub event_type: EventType,
    pub enabled: bool,
    pub core: CoreFilter,
    pub process: ProcessFilter,
    pub p1: u64,
    pub p2: u64,
    pub has_condition: bool,
    pub actions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyKind {
    Enable,
    Disable,
    Clear,
    QueryState,
}

impl TryFrom<u32> for ModifyKind {
    type Error = HvError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ModifyKind::Enable,
            1 => ModifyKind::Disable,
            2 => ModifyKind::Clear,
            3 => ModifyKind::QueryState,
            other => return Err(HvError::ModifyEventsInvalidTypeOfAction(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyResult {
    pub status: u32,
    /// Enabled state of the event, filled in for [`ModifyKind::QueryState`]
    pub enabled: Option<bool>,
}

/// Outcome of triggering an event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStatus {
    Successful,
    /// Nothing was evaluated because the core masks events right now
    SuccessfulIgnoreEvent,
    DebuggerNotEnabled,
    InvalidEventType,
}

/// Everything an event evaluation can look at and change
#[derive(Debug)]
pub struct TriggerContext<'a> {
    pub core: CoreId,
    pub process: ProcessId,
    pub thread: ThreadId,
    pub rip: u64,
    /// Type-specific value of the occurrence, like the MSR number or the vector
    pub context: u64,
    pub regs: &'a mut GuestRegs,
    /// Set by an action that wants the default handling of the exit skipped
    pub short_circuit: bool,
}

/// The record a log-the-state action sends to the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub tag: Tag,
    pub event_type: EventType,
    pub core: CoreId,
    pub process: ProcessId,
    pub thread: ThreadId,
    pub rip: u64,
    pub context: u64,
    pub regs: GuestRegs,
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(event_type: EventType, p1: u64, p2: u64) -> Event {
        Event::new(
            0x1000000,
            event_type,
            CoreFilter::All,
            ProcessFilter::All,
            p1,
            p2,
            None,
            vec![Action {
                kind: ActionKind::LogState,
                immediately_send_results: false,
            }],
        )
    }

    #[test]
    fn test_params_match_per_type() {
        assert!(event(EventType::RdmsrInstructionExecution, ALL_U64, 0).params_match(0x10));
        assert!(event(EventType::RdmsrInstructionExecution, 0x10, 0).params_match(0x10));
        assert!(!event(EventType::RdmsrInstructionExecution, 0x11, 0).params_match(0x10));

        assert!(event(EventType::ExternalInterruptOccurred, 0x2f, 0).params_match(0x2f));
        assert!(!event(EventType::ExternalInterruptOccurred, 0x2f, 0).params_match(0x30));

        let monitor = event(EventType::HiddenHookWrite, 0x1000, 0x1010);
        assert!(monitor.params_match(0x1000));
        assert!(monitor.params_match(0x100f));
        assert!(!monitor.params_match(0x1010));

        assert!(event(EventType::ControlRegisterModified, 4, 0x20).params_match(4));
        assert!(!event(EventType::ControlRegisterModified, 4, 0x20).params_match(0));
        assert!(event(EventType::CpuidInstructionExecution, 0, 0).params_match(0x4000_0000));
    }

    #[test]
    fn test_filters() {
        assert!(CoreFilter::from_raw(ALL).matches(7));
        assert!(!CoreFilter::from_raw(1).matches(7));
        assert!(ProcessFilter::from_raw(ALL).matches(4));
        assert!(ProcessFilter::Process(4).matches(4));
        assert!(!ProcessFilter::Process(4).matches(5));
    }

    #[test]
    fn test_event_type_from_raw() {
        assert_eq!(
            EventType::try_from(18).unwrap(),
            EventType::ControlRegisterModified
        );
        assert!(matches!(
            EventType::try_from(19),
            Err(HvError::EventTypeIsInvalid(19))
        ));
    }

    #[test]
    fn test_request_from_json() {
        let raw = r#"{
            "event_type": "RdmsrInstructionExecution",
            "p1": 3221225602,
            "actions": [ { "kind": "LogState" }, { "kind": { "RunScript": { "script": [1, 2] } } } ]
        }"#;
        let request: EventRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.core, CoreFilter::All);
        assert!(request.enabled);
        assert_eq!(request.actions.len(), 2);
        assert_eq!(
            request.actions[1].kind,
            ActionKindRequest::RunScript {
                script: vec![1, 2],
                scratch_size: 0
            }
        );
    }
}

//! # Errors
//!
//! The single error type of the crate together with the numeric status codes the remote
//! debugger understands.
//!
//! Every failing operation of the engine returns a [`HvError`]. When a result has to leave
//! the hypervisor (a registration result buffer, a thread action result or a session
//! feedback), [`HvError::status_code`] turns it into the status value the client side
//! expects. A successful operation is reported as [`STATUS_SUCCESS`].

use thiserror::Error;

use crate::addr::Addr;
use crate::consts::MAX_GUEST_BUFFER_SIZE;
use crate::{CoreId, ProcessId, Tag, ThreadId, Token};

/// Status value reported for a successful debugger operation
pub const STATUS_SUCCESS: u32 = 0xFFFF_FFFF;

pub type Result<T> = std::result::Result<T, HvError>;

#[derive(Error, Debug)]
pub enum HvError {
    #[error("Event tag {0:#x} does not exist")]
    TagNotExists(Tag),
    #[error("Invalid action type: {0}")]
    InvalidActionType(String),
    #[error("Action buffer size is zero")]
    ActionBufferSizeIsZero,
    #[error("Event type is invalid: {0}")]
    EventTypeIsInvalid(u32),
    #[error("Unable to create event: {0}")]
    UnableToCreateEvent(String),
    #[error("Event tag {0:#x} is already registered")]
    DuplicateTag(Tag),
    #[error("Condition buffer is malformed: {0}")]
    MalformedCondition(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(Addr),
    #[error("Invalid core id: {0}")]
    InvalidCoreId(CoreId),
    #[error("Exception index {0:#x} exceeds the first 32 entries")]
    ExceptionIndexExceedFirst32Entries(u64),
    #[error("Interrupt index {0:#x} is not valid")]
    InterruptIndexIsNotValid(u64),
    #[error("Modify events: tag {0:#x} is invalid")]
    ModifyEventsInvalidTag(Tag),
    #[error("Modify events: type of action {0} is invalid")]
    ModifyEventsInvalidTypeOfAction(u32),
    #[error("Thread {0} was not found or is not paused")]
    SteppingThreadNotFound(ThreadId),
    #[error("Action queue of thread {0} is full")]
    ThreadActionQueueFull(ThreadId),
    #[error("Could not prepare the debuggee to run the script: {0}")]
    PreparingDebuggeeToRunScript(String),
    #[error("Invalid process id: {0}")]
    InvalidProcessId(ProcessId),
    #[error("Event was not applied: {0}")]
    EventIsNotApplied(String),
    #[error("Unable to attach to user-mode process {0}")]
    UnableToAttach(ProcessId),
    #[error("Functions for initializing PEB addresses are not initialized for process {0}")]
    PebAddressesNotInitialized(ProcessId),
    #[error("Unable to detect whether process {0} is 32-bit or 64-bit")]
    UnableToDetectBitness(ProcessId),
    #[error("Unable to kill process {0}")]
    UnableToKillProcess(ProcessId),
    #[error("Invalid thread debugging token {0:#x}")]
    InvalidThreadDebuggingToken(Token),
    #[error("Unable to pause the threads of process {0}")]
    UnableToPauseThreads(ProcessId),
    #[error("Process {0} is already attached")]
    AlreadyAttached(ProcessId),
    #[error("The user debugger is not attached to process {0}")]
    NotAttached(ProcessId),
    #[error("Unable to detach from process {0} as there are paused threads")]
    PausedThreadsPreventDetach(ProcessId),
    #[error("Unable to switch: thread {0} is invalid")]
    InvalidSwitchTarget(ThreadId),
    #[error("Unable to switch: there is no thread on process {0}")]
    NoThreadOnProcess(ProcessId),
    #[error("Unable to query the count of processes or threads")]
    UnableToQueryCount,
    #[error("No core is halted")]
    NotHalted,
    #[error("Core {0} is still handling a vm-exit")]
    CoreBusy(CoreId),
    #[error("Pending interrupt buffer is saturated, dropping {0:#x}")]
    PendingInterruptsSaturated(u32),
    #[error("Unknown hypercall code {0:#x}")]
    UnknownHypercall(u64),
    #[error("Hypercall {0:#x} failed: {1}")]
    HypercallFailed(u32, String),
    #[error("Buffer of {0:#x} bytes is larger than {max:#x}", max = MAX_GUEST_BUFFER_SIZE)]
    BufferTooLarge(u64),
    #[error("Guest error: {0}")]
    Guest(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Script engine error: {0}")]
    Script(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HvError {
    /// Numeric status of this error as it is reported to the remote debugger
    ///
    /// Errors that have no dedicated status in the debugger protocol (for example
    /// failures of a collaborator) are reported as [`HvError::UnableToCreateEvent`]
    /// would be, the generic "operation failed" status for configuration requests.
    #[must_use]
    pub fn status_code(&self) -> u32 {
        match self {
            HvError::TagNotExists(_) => 0xc000_0000,
            HvError::InvalidActionType(_) => 0xc000_0001,
            HvError::ActionBufferSizeIsZero => 0xc000_0002,
            HvError::EventTypeIsInvalid(_) => 0xc000_0003,
            HvError::UnableToCreateEvent(_)
            | HvError::DuplicateTag(_)
            | HvError::MalformedCondition(_) => 0xc000_0004,
            HvError::InvalidAddress(_) => 0xc000_0005,
            HvError::InvalidCoreId(_) => 0xc000_0006,
            HvError::ExceptionIndexExceedFirst32Entries(_) => 0xc000_0007,
            HvError::InterruptIndexIsNotValid(_) => 0xc000_0008,
            HvError::ModifyEventsInvalidTag(_) => 0xc000_000e,
            HvError::ModifyEventsInvalidTypeOfAction(_) => 0xc000_000f,
            HvError::SteppingThreadNotFound(_) | HvError::ThreadActionQueueFull(_) => {
                0xc000_0011
            }
            HvError::PreparingDebuggeeToRunScript(_) | HvError::Script(_) => 0xc000_0016,
            HvError::InvalidProcessId(_) => 0xc000_001e,
            HvError::EventIsNotApplied(_) => 0xc000_001f,
            HvError::UnableToAttach(_) => 0xc000_002a,
            HvError::PebAddressesNotInitialized(_) => 0xc000_002d,
            HvError::UnableToDetectBitness(_) => 0xc000_002e,
            HvError::UnableToKillProcess(_) => 0xc000_002f,
            HvError::InvalidThreadDebuggingToken(_) => 0xc000_0030,
            HvError::UnableToPauseThreads(_) => 0xc000_0031,
            HvError::AlreadyAttached(_) => 0xc000_0032,
            HvError::NotAttached(_) => 0xc000_0033,
            HvError::PausedThreadsPreventDetach(_) => 0xc000_0034,
            HvError::InvalidSwitchTarget(_) => 0xc000_0035,
            HvError::NoThreadOnProcess(_) => 0xc000_0036,
            HvError::UnableToQueryCount => 0xc000_0039,
            HvError::PendingInterruptsSaturated(_)
            | HvError::NotHalted
            | HvError::CoreBusy(_)
            | HvError::UnknownHypercall(_)
            | HvError::HypercallFailed(..)
            | HvError::BufferTooLarge(_)
            | HvError::Guest(_)
            | HvError::Transport(_)
            | HvError::Io(_)
            | HvError::Json(_) => 0xc000_0004,
        }
    }
}

/// Turns a result into the status value of the debugger protocol
pub fn status_of<T>(result: &Result<T>) -> u32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.status_code(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_codes_match_protocol() {
        assert_eq!(HvError::TagNotExists(1).status_code(), 0xc0000000);
        assert_eq!(HvError::DuplicateTag(1).status_code(), 0xc0000004);
        assert_eq!(HvError::InvalidCoreId(9).status_code(), 0xc0000006);
        assert_eq!(
            HvError::PausedThreadsPreventDetach(4).status_code(),
            0xc0000034
        );
        assert_eq!(HvError::UnableToKillProcess(4).status_code(), 0xc000002f);
        assert_eq!(HvError::BufferTooLarge(u64::MAX).status_code(), 0xc0000004);
    }

    #[test]
    fn test_status_of() {
        let ok: Result<()> = Ok(());
        assert_eq!(status_of(&ok), STATUS_SUCCESS);
        let err: Result<()> = Err(HvError::InvalidThreadDebuggingToken(0x1000000));
        assert_eq!(status_of(&err), 0xc0000030);
    }
}

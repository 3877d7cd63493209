//! # vmxdbg
//!
//! The VM-exit dispatch and debugging-event engine of a hardware-virtualization based
//! debugger.
//!
//! A hypervisor intercepts guest execution through VM-exits. This crate decides what happens
//! with each of them: whether an interrupt or exception goes back into the guest, whether it
//! becomes a debugger event, or whether the core stops and waits for the debugger. It also
//! owns the registry of debugger events and their actions, the hypercall interface the
//! non-root half of the debugger uses to configure all of that, and the state machines
//! used to halt the guest and to park single threads of user-mode processes.
//!
//! Everything that touches hardware or the guest operating system goes through traits
//! (see [`vmcs`] and [`extension_points`]). The [`sim`] module implements all of them for a
//! simulated machine, which is what the tests and the `hvserve` binary run on.

pub mod addr;
pub mod arbiter;
pub mod attach;
pub mod bitmaps;
pub mod config;
pub mod consts;
pub mod context;
pub mod debugger;
pub mod disassemble;
pub mod errors;
pub mod event;
pub mod extension_points;
pub mod feedback;
pub mod halt;
pub mod hypercall;
pub mod injection;
pub mod pending;
pub mod registry;
pub mod regs;
pub mod sim;
pub mod state;
pub mod syscall;
pub mod ui;
pub mod vmcs;
pub mod vmexit;

/// Index of a logical core
pub type CoreId = u32;
pub type ProcessId = u32;
pub type ThreadId = u32;
/// Identifier of a registered event
pub type Tag = u64;
/// Identifier of a user-mode process the user debugger is attached to
pub type Token = u64;

pub use addr::Addr;
pub use context::HvContext;
pub use errors::{HvError, Result};
pub use regs::{GuestRegs, Register};

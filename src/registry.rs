//! # Event registry and trigger engine
//!
//! The [`EventRegistry`] keeps the registered events per [`EventType`] in registration
//! order. The operations on events (registering, triggering, modifying and removing them)
//! need the rest of the context as well, so they are implemented on
//! [`HvContext`](crate::context::HvContext).
//!
//! An event becomes effective in two steps. It is first inserted disabled, then the
//! hardware is configured for it through hypercalls on the cores it applies to. Only if
//! every hypercall succeeded it is enabled. A failing registration leaves no trace.
//!
//! Triggering takes a snapshot of the matching events under the read lock and runs their
//! actions afterwards, so an action may block (for example by halting the core) without
//! holding up other cores that look at the registry.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::arbiter::{PassOver, ProtectedResource};
use crate::consts::{
    ALL, ALL_TAGS, ALL_U64, EVENT_TAG_SEED, EXCEPTION_VECTOR_BREAKPOINT, FIRST_INTERRUPT_VECTOR,
};
use crate::context::HvContext;
use crate::errors::{status_of, HvError, Result};
use crate::event::{
    Action, ActionKind, ActionKindRequest, CoreFilter, CustomRoutine, Event, EventRequest,
    EventSummary, EventType, ModifyKind, ModifyResult, ProcessFilter, RegistrationResult,
    StateRecord, TriggerContext, TriggerStatus,
};
use crate::extension_points::{MessageKind, PageAttributes};
use crate::halt::PausingReason;
use crate::hypercall::HypercallCode;
use crate::{CoreId, Tag};

pub struct EventRegistry {
    events: RwLock<HashMap<EventType, Vec<Arc<Event>>>>,
    next_tag: AtomicU64,
    routines: RwLock<HashMap<String, CustomRoutine>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.len())
            .field("next_tag", &self.next_tag)
            .finish_non_exhaustive()
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            next_tag: AtomicU64::new(EVENT_TAG_SEED),
            routines: RwLock::new(HashMap::new()),
        }
    }

    /// Make a routine available to run-custom-code actions under `name`
    pub fn register_custom_routine(&self, name: impl Into<String>, routine: CustomRoutine) {
        let name = name.into();
        debug!("registered custom routine {name}");
        self.routines.write().insert(name, routine);
    }

    fn custom_routine(&self, name: &str) -> Option<CustomRoutine> {
        self.routines.read().get(name).cloned()
    }

    fn mint_tag(&self) -> Tag {
        loop {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if !self.contains(tag) {
                return tag;
            }
        }
    }

    pub fn get(&self, tag: Tag) -> Option<Arc<Event>> {
        self.events
            .read()
            .values()
            .flatten()
            .find(|e| e.tag == tag)
            .cloned()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_some()
    }

    pub fn len(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events of one type, in registration order
    pub fn snapshot(&self, event_type: EventType) -> Vec<Arc<Event>> {
        self.events
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Every event, ordered by tag
    pub fn all(&self) -> Vec<Arc<Event>> {
        let mut all: Vec<Arc<Event>> = self.events.read().values().flatten().cloned().collect();
        all.sort_by_key(|e| e.tag);
        all
    }

    fn insert(&self, event: Arc<Event>) -> Result<()> {
        let mut events = self.events.write();
        if events.values().flatten().any(|e| e.tag == event.tag) {
            return Err(HvError::DuplicateTag(event.tag));
        }
        events.entry(event.event_type).or_default().push(event);
        Ok(())
    }

    fn unlink(&self, tag: Tag) -> Option<Arc<Event>> {
        let mut events = self.events.write();
        for list in events.values_mut() {
            if let Some(idx) = list.iter().position(|e| e.tag == tag) {
                return Some(list.remove(idx));
            }
        }
        None
    }

    fn clear(&self) {
        self.events.write().clear();
    }

    fn enabled_for(&self, event_type: EventType, core: CoreId) -> Vec<Arc<Event>> {
        self.events
            .read()
            .get(&event_type)
            .map(|list| {
                list.iter()
                    .filter(|e| e.is_enabled() && e.core.matches(core))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_enabled(&self, event_type: EventType, core: CoreId) -> bool {
        self.events.read().get(&event_type).is_some_and(|list| {
            list.iter()
                .any(|e| e.is_enabled() && e.core.matches(core))
        })
    }

    /// Vectors of the enabled exception events on `core` as a bitmap
    pub fn exception_vectors(&self, core: CoreId) -> u32 {
        self.enabled_for(EventType::ExceptionOccurred, core)
            .iter()
            .fold(0, |bitmap, e| {
                if e.p1 == ALL_U64 {
                    u32::MAX
                } else {
                    bitmap | (1u32 << (e.p1 & 31))
                }
            })
    }

    pub fn cr_mask(&self, core: CoreId, cr: u64) -> u64 {
        self.enabled_for(EventType::ControlRegisterModified, core)
            .iter()
            .filter(|e| e.p1 == cr)
            .fold(0, |mask, e| mask | e.p2)
    }

    pub fn has_cr_event(&self, core: CoreId, cr: u64) -> bool {
        self.enabled_for(EventType::ControlRegisterModified, core)
            .iter()
            .any(|e| e.p1 == cr)
    }

    pub fn summaries(&self) -> Vec<EventSummary> {
        self.all().iter().map(|e| e.summary()).collect()
    }
}

fn raw_process(process: ProcessFilter) -> u64 {
    match process {
        ProcessFilter::All => ALL as u64,
        ProcessFilter::Process(pid) => pid as u64,
    }
}

fn hidden_hook_attributes(event_type: EventType) -> PageAttributes {
    match event_type {
        EventType::HiddenHookRead => PageAttributes::READ,
        EventType::HiddenHookWrite => PageAttributes::WRITE,
        _ => PageAttributes::READ | PageAttributes::WRITE,
    }
}

impl HvContext {
    /// Register an event and report the outcome the way the debugger protocol expects it
    pub fn register_event(&self, request: EventRequest) -> RegistrationResult {
        let result = self.register(request);
        RegistrationResult {
            status: status_of(&result),
            tag: result.ok(),
        }
    }

    /// Validate, insert and apply an event
    ///
    /// # Errors
    ///
    /// Fails if the request does not pass validation, or with
    /// [`HvError::EventIsNotApplied`] if the hardware could not be configured for it. The
    /// registry is unchanged in both cases.
    pub fn register(&self, request: EventRequest) -> Result<Tag> {
        let enabled = request.enabled;
        let event = Arc::new(self.validate(request)?);
        let tag = event.tag;
        self.registry.insert(event.clone())?;

        if enabled {
            if let Err(e) = self.apply(&event) {
                error!("could not apply event {tag:#x}: {e}");
                self.registry.unlink(tag);
                self.revoke(&event);
                return Err(HvError::EventIsNotApplied(e.to_string()));
            }
            event.set_enabled(true);
        }
        info!(
            "registered event {tag:#x} ({}, {} actions)",
            event.event_type,
            event.actions.len()
        );
        Ok(tag)
    }

    fn validate(&self, request: EventRequest) -> Result<Event> {
        let tag = match request.tag {
            Some(tag) if self.registry.contains(tag) => {
                let err = HvError::DuplicateTag(tag);
                error!("{err}");
                return Err(err);
            }
            Some(tag) => tag,
            None => self.registry.mint_tag(),
        };

        if let CoreFilter::Core(core) = request.core {
            if core >= self.core_count() {
                return Err(HvError::InvalidCoreId(core));
            }
        }
        if let ProcessFilter::Process(pid) = request.process {
            if !self.collab.guest.process_exists(pid) {
                return Err(HvError::InvalidProcessId(pid));
            }
        }

        let p1 = request.p1;
        let mut p2 = request.p2;
        match request.event_type {
            EventType::ExceptionOccurred if p1 != ALL_U64 && p1 >= FIRST_INTERRUPT_VECTOR => {
                return Err(HvError::ExceptionIndexExceedFirst32Entries(p1));
            }
            EventType::ExternalInterruptOccurred
                if !(FIRST_INTERRUPT_VECTOR..=0xff).contains(&p1) =>
            {
                return Err(HvError::InterruptIndexIsNotValid(p1));
            }
            EventType::ControlRegisterModified if !matches!(p1, 0 | 3 | 4) => {
                return Err(HvError::UnableToCreateEvent(format!(
                    "cr{p1} cannot be monitored"
                )));
            }
            ty if ty.is_hidden_hook() && p1 == 0 => {
                return Err(HvError::InvalidAddress(p1.into()));
            }
            EventType::HiddenHookRead
            | EventType::HiddenHookWrite
            | EventType::HiddenHookReadAndWrite => {
                // a single byte if no end is given
                if p2 == 0 {
                    p2 = p1
                        .checked_add(1)
                        .ok_or(HvError::InvalidAddress(p1.into()))?;
                }
                if p2 <= p1 {
                    return Err(HvError::InvalidAddress(p2.into()));
                }
            }
            _ => (),
        }

        if let Some(condition) = &request.condition {
            if condition.is_empty() {
                return Err(HvError::ActionBufferSizeIsZero);
            }
            self.collab
                .script
                .check_condition(condition)
                .map_err(|e| HvError::MalformedCondition(e.to_string()))?;
        }

        if request.actions.is_empty() {
            return Err(HvError::UnableToCreateEvent(
                "an event needs at least one action".to_string(),
            ));
        }
        let mut actions = Vec::with_capacity(request.actions.len());
        for action in request.actions {
            let kind = match action.kind {
                ActionKindRequest::BreakToDebugger => ActionKind::BreakToDebugger,
                ActionKindRequest::LogState => ActionKind::LogState,
                ActionKindRequest::RunCustomCode {
                    routine,
                    scratch_size,
                } => {
                    let Some(f) = self.registry.custom_routine(&routine) else {
                        return Err(HvError::InvalidActionType(format!(
                            "unknown custom routine {routine}"
                        )));
                    };
                    ActionKind::RunCustomCode {
                        name: routine,
                        routine: f,
                        scratch_size,
                    }
                }
                ActionKindRequest::RunScript {
                    script,
                    scratch_size,
                } => {
                    if script.is_empty() {
                        return Err(HvError::ActionBufferSizeIsZero);
                    }
                    ActionKind::RunScript {
                        script,
                        scratch_size,
                    }
                }
            };
            actions.push(Action {
                kind,
                immediately_send_results: action.immediately_send_results,
            });
        }

        Ok(Event::new(
            tag,
            request.event_type,
            request.core,
            request.process,
            p1,
            p2,
            request.condition,
            actions,
        ))
    }

    /// Configure the hardware so that the event can be triggered
    fn apply(&self, event: &Event) -> Result<()> {
        let cores = event.core;
        let (p1, p2) = (event.p1, event.p2);
        let process = raw_process(event.process);
        match event.event_type {
            EventType::ExceptionOccurred => {
                self.broadcast_hypercall(cores, HypercallCode::SetExceptionBitmap, p1, 0, 0)
            }
            EventType::ExternalInterruptOccurred => self.broadcast_hypercall(
                cores,
                HypercallCode::EnableExternalInterruptExiting,
                0,
                0,
                0,
            ),
            EventType::TscInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::SetRdtscExiting, 0, 0, 0)
            }
            EventType::PmcInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::SetRdpmcExiting, 0, 0, 0)
            }
            EventType::DebugRegistersAccessed => self.broadcast_hypercall(
                cores,
                HypercallCode::EnableMovToDebugRegsExiting,
                0,
                0,
                0,
            ),
            EventType::ControlRegisterModified => self.broadcast_hypercall(
                cores,
                HypercallCode::EnableMovToControlRegsExiting,
                p1,
                p2,
                0,
            ),
            EventType::RdmsrInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::ChangeMsrBitmapRead, p1, 0, 0)
            }
            EventType::WrmsrInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::ChangeMsrBitmapWrite, p1, 0, 0)
            }
            EventType::InInstructionExecution | EventType::OutInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::ChangeIoBitmap, p1, 0, 0)
            }
            EventType::SyscallHookEferSyscall | EventType::SyscallHookEferSysret => {
                self.broadcast_hypercall(cores, HypercallCode::EnableSyscallHookEfer, 0, 0, 0)
            }
            EventType::HiddenHookExecCc => self.direct_hypercall(
                0,
                HypercallCode::SetHiddenCcBreakpoint,
                p1,
                process,
                0,
            ),
            EventType::HiddenHookExecDetours => {
                self.collab.ept.hook_detour(p1.into(), process as u32)
            }
            EventType::HiddenHookRead
            | EventType::HiddenHookWrite
            | EventType::HiddenHookReadAndWrite => self.collab.ept.monitor_range(
                p1.into(),
                p2.into(),
                hidden_hook_attributes(event.event_type),
                process as u32,
            ),
            // always cause an exit
            EventType::CpuidInstructionExecution | EventType::VmcallInstructionExecution => Ok(()),
        }
    }

    /// Take back what [`apply`](Self::apply) configured, the event must already be disabled
    /// or unlinked
    ///
    /// Bits are cleared through the arbiter, so whatever another consumer still needs
    /// stays set. Failures are logged, there is nobody to report them to.
    fn revoke(&self, event: &Event) {
        let cores = event.core;
        let (p1, p2) = (event.p1, event.p2);
        let result = match event.event_type {
            EventType::ExceptionOccurred => {
                self.broadcast_hypercall(cores, HypercallCode::UnsetExceptionBitmap, p1, 0, 0)
            }
            EventType::ExternalInterruptOccurred => {
                self.unset_on_cores(
                    cores,
                    ProtectedResource::ExternalInterruptExiting,
                    1,
                    PassOver::empty(),
                );
                Ok(())
            }
            EventType::TscInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::UnsetRdtscExiting, 0, 0, 0)
            }
            EventType::PmcInstructionExecution => {
                self.broadcast_hypercall(cores, HypercallCode::UnsetRdpmcExiting, 0, 0, 0)
            }
            EventType::DebugRegistersAccessed => self.broadcast_hypercall(
                cores,
                HypercallCode::DisableMovToDebugRegsExiting,
                0,
                0,
                0,
            ),
            EventType::ControlRegisterModified => self.broadcast_hypercall(
                cores,
                HypercallCode::DisableMovToControlRegsExiting,
                p1,
                p2,
                0,
            ),
            EventType::RdmsrInstructionExecution => self.rebuild_bitmap(
                event.event_type,
                HypercallCode::ResetMsrBitmapRead,
                HypercallCode::ChangeMsrBitmapRead,
            ),
            EventType::WrmsrInstructionExecution => self.rebuild_bitmap(
                event.event_type,
                HypercallCode::ResetMsrBitmapWrite,
                HypercallCode::ChangeMsrBitmapWrite,
            ),
            EventType::InInstructionExecution | EventType::OutInstructionExecution => self
                .rebuild_bitmap(
                    event.event_type,
                    HypercallCode::ResetIoBitmap,
                    HypercallCode::ChangeIoBitmap,
                ),
            EventType::SyscallHookEferSyscall | EventType::SyscallHookEferSysret => {
                let remaining = self.registry.all().iter().any(|e| {
                    e.event_type.is_syscall_hook() && e.is_enabled() && e.tag != event.tag
                });
                if remaining {
                    Ok(())
                } else {
                    self.broadcast_hypercall(
                        CoreFilter::All,
                        HypercallCode::DisableSyscallHookEfer,
                        0,
                        0,
                        0,
                    )
                }
            }
            EventType::HiddenHookExecCc => self
                .direct_hypercall(
                    0,
                    HypercallCode::UnhookSinglePage,
                    p1,
                    raw_process(event.process),
                    0,
                )
                .map(|()| {
                    self.unset_on_cores(
                        CoreFilter::All,
                        ProtectedResource::ExceptionBitmap,
                        1 << EXCEPTION_VECTOR_BREAKPOINT,
                        PassOver::empty(),
                    )
                }),
            ty if ty.is_hidden_hook() => self.direct_hypercall(
                0,
                HypercallCode::UnhookSinglePage,
                p1,
                raw_process(event.process),
                0,
            ),
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("could not revoke event {:#x}: {e}", event.tag);
        }
    }

    /// Clear a bitmap on every core and intercept again what the remaining events need
    ///
    /// In and out events share the I/O bitmap.
    fn rebuild_bitmap(
        &self,
        event_type: EventType,
        reset: HypercallCode,
        change: HypercallCode,
    ) -> Result<()> {
        self.broadcast_hypercall(CoreFilter::All, reset, 0, 0, 0)?;
        let sharing: &[EventType] = match event_type {
            EventType::InInstructionExecution | EventType::OutInstructionExecution => &[
                EventType::InInstructionExecution,
                EventType::OutInstructionExecution,
            ],
            _ => &[event_type],
        };
        for ty in sharing {
            for remaining in self.registry.snapshot(*ty) {
                if remaining.is_enabled() {
                    self.broadcast_hypercall(remaining.core, change, remaining.p1, 0, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Evaluate every matching event of `event_type` and run its actions
    pub fn trigger(&self, event_type: EventType, tctx: &mut TriggerContext) -> TriggerStatus {
        if !self.features.events_enabled() {
            return TriggerStatus::DebuggerNotEnabled;
        }
        let masked = self
            .with_core(tctx.core, |c| c.masking_events)
            .unwrap_or(false);
        if masked {
            trace!("core {}: ignoring {event_type}, events are masked", tctx.core);
            return TriggerStatus::SuccessfulIgnoreEvent;
        }

        let matching: Vec<Arc<Event>> = self
            .registry
            .snapshot(event_type)
            .into_iter()
            .filter(|e| {
                e.is_enabled() && e.applies_to(tctx.core, tctx.process) && e.params_match(tctx.context)
            })
            .collect();

        for event in matching {
            if let Some(condition) = &event.condition {
                if !self
                    .collab
                    .script
                    .evaluate_condition(tctx.regs, tctx.context, condition)
                {
                    trace!("condition of event {:#x} is false", event.tag);
                    continue;
                }
            }
            trace!("event {:#x} triggered on core {}", event.tag, tctx.core);
            for action in &event.actions {
                if let Err(e) = self.run_action(&event, action, tctx) {
                    error!(
                        "action {:?} of event {:#x} failed: {e}",
                        action.kind, event.tag
                    );
                }
            }
        }
        TriggerStatus::Successful
    }

    /// [`trigger`](Self::trigger) with the event type as its protocol number
    pub fn trigger_raw(&self, raw_type: u32, tctx: &mut TriggerContext) -> TriggerStatus {
        match EventType::try_from(raw_type) {
            Ok(event_type) => self.trigger(event_type, tctx),
            Err(e) => {
                warn!("{e}");
                TriggerStatus::InvalidEventType
            }
        }
    }

    fn run_action(&self, event: &Event, action: &Action, tctx: &mut TriggerContext) -> Result<()> {
        let immediate = action.immediately_send_results;
        match &action.kind {
            ActionKind::BreakToDebugger => {
                self.halt.break_to_debugger(
                    self,
                    tctx.core,
                    tctx.regs,
                    PausingReason::EventTriggered {
                        tag: event.tag,
                        context: tctx.context,
                    },
                );
                Ok(())
            }
            ActionKind::LogState => {
                let record = StateRecord {
                    tag: event.tag,
                    event_type: event.event_type,
                    core: tctx.core,
                    process: tctx.process,
                    thread: tctx.thread,
                    rip: tctx.rip,
                    context: tctx.context,
                    regs: *tctx.regs,
                };
                let buffer = serde_json::to_vec(&record)?;
                self.collab
                    .transport
                    .send_buffer(MessageKind::StateRecord, &buffer, immediate)
            }
            ActionKind::RunCustomCode {
                name,
                routine,
                scratch_size,
            } => {
                let mut scratch = vec![0u8; *scratch_size];
                let regs = *tctx.regs;
                let context = tctx.context;
                let output = panic::catch_unwind(AssertUnwindSafe(|| {
                    routine(&mut scratch, &regs, context)
                }))
                .map_err(|_| HvError::Script(format!("custom routine {name} panicked")))?;
                match output {
                    Some(output) => self.collab.transport.send_buffer(
                        MessageKind::CustomCodeResult,
                        &output,
                        immediate,
                    ),
                    None => Ok(()),
                }
            }
            ActionKind::RunScript {
                script,
                scratch_size,
            } => {
                let mut scratch = vec![0u8; *scratch_size];
                let outcome =
                    self.collab
                        .script
                        .run_script(tctx.regs, tctx.context, script, &mut scratch)?;
                if outcome.short_circuit {
                    tctx.short_circuit = true;
                }
                match outcome.output {
                    Some(output) => self.collab.transport.send_buffer(
                        MessageKind::ScriptResult,
                        &output,
                        immediate,
                    ),
                    None => Ok(()),
                }
            }
        }
    }

    /// Disable, revoke and unlink a single event
    ///
    /// # Errors
    ///
    /// Fails with [`HvError::TagNotExists`] for an unknown tag.
    pub fn remove_event(&self, tag: Tag) -> Result<()> {
        let Some(event) = self.registry.get(tag) else {
            let err = HvError::TagNotExists(tag);
            error!("{err}");
            return Err(err);
        };
        event.set_enabled(false);
        self.revoke(&event);
        self.registry.unlink(tag);
        info!("removed event {tag:#x}");
        Ok(())
    }

    /// Remove every event and reset every control that only events needed
    pub fn remove_all_events(&self) -> Result<()> {
        let events = self.registry.all();
        for event in &events {
            event.set_enabled(false);
        }
        let all = CoreFilter::All;
        // hidden breakpoints go first, they hold #BP in the exception bitmap
        if events.iter().any(|e| e.event_type.is_hidden_hook()) {
            self.direct_hypercall(0, HypercallCode::UnhookAllPages, 0, 0, 0)?;
        }
        self.broadcast_hypercall(
            all,
            HypercallCode::ResetExceptionBitmapOnlyOnClearingExceptionEvents,
            0,
            0,
            0,
        )?;
        self.broadcast_hypercall(
            all,
            HypercallCode::DisableExternalInterruptExitingOnlyToClearInterruptCommands,
            0,
            0,
            0,
        )?;
        self.broadcast_hypercall(all, HypercallCode::DisableRdtscExitingOnlyForTscEvents, 0, 0, 0)?;
        self.broadcast_hypercall(all, HypercallCode::UnsetRdpmcExiting, 0, 0, 0)?;
        self.broadcast_hypercall(
            all,
            HypercallCode::DisableMovToHwDrExitingOnlyForDrEvents,
            0,
            0,
            0,
        )?;
        for cr in [0, 3, 4] {
            self.broadcast_hypercall(
                all,
                HypercallCode::DisableMovToCrExitingOnlyForCrEvents,
                cr,
                u64::MAX,
                0,
            )?;
        }
        self.broadcast_hypercall(all, HypercallCode::ResetMsrBitmapRead, 0, 0, 0)?;
        self.broadcast_hypercall(all, HypercallCode::ResetMsrBitmapWrite, 0, 0, 0)?;
        self.broadcast_hypercall(all, HypercallCode::ResetIoBitmap, 0, 0, 0)?;
        if events.iter().any(|e| e.event_type.is_syscall_hook()) {
            self.broadcast_hypercall(all, HypercallCode::DisableSyscallHookEfer, 0, 0, 0)?;
        }
        self.registry.clear();
        info!("removed all {} events", events.len());
        Ok(())
    }

    /// Enable, disable, clear or query one event, or every event for [`ALL_TAGS`]
    ///
    /// Returns the enabled state for [`ModifyKind::QueryState`]. For [`ALL_TAGS`], an event
    /// that fails does not keep the others from being changed, the first failure is
    /// returned.
    pub fn modify_event(&self, tag: Tag, kind: ModifyKind) -> Result<Option<bool>> {
        if tag == ALL_TAGS {
            return match kind {
                ModifyKind::QueryState => Err(HvError::ModifyEventsInvalidTag(tag)),
                ModifyKind::Clear => self.remove_all_events().map(|()| None),
                _ => {
                    let mut first = None;
                    for event in self.registry.all() {
                        if let Err(e) = self.modify_event(event.tag, kind) {
                            first.get_or_insert(e);
                        }
                    }
                    first.map_or(Ok(None), Err)
                }
            };
        }

        let Some(event) = self.registry.get(tag) else {
            let err = HvError::ModifyEventsInvalidTag(tag);
            error!("{err}");
            return Err(err);
        };
        match kind {
            ModifyKind::Enable => {
                if !event.is_enabled() {
                    if let Err(e) = self.apply(&event) {
                        self.revoke(&event);
                        return Err(HvError::EventIsNotApplied(e.to_string()));
                    }
                    event.set_enabled(true);
                }
                Ok(None)
            }
            ModifyKind::Disable => {
                if event.is_enabled() {
                    event.set_enabled(false);
                    self.revoke(&event);
                }
                Ok(None)
            }
            ModifyKind::Clear => self.remove_event(tag).map(|()| None),
            ModifyKind::QueryState => Ok(Some(event.is_enabled())),
        }
    }

    /// [`modify_event`](Self::modify_event) with the action as its protocol number
    pub fn modify_event_raw(&self, tag: Tag, raw_kind: u32) -> ModifyResult {
        let result = ModifyKind::try_from(raw_kind).and_then(|kind| self.modify_event(tag, kind));
        ModifyResult {
            status: status_of(&result),
            enabled: result.ok().flatten(),
        }
    }

    pub fn list_events(&self) -> Vec<EventSummary> {
        self.registry.summaries()
    }
}

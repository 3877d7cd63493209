//! # The hypervisor context
//!
//! [`HvContext`] owns all state of the engine: the per-core state blocks, the event
//! registry, the feature switches, the halt controller and the user debugger. There are no
//! globals. Every exit handler and every debugger-side operation gets the context by
//! reference.
//!
//! Locking rules:
//!
//! * a core state lock is only held for short, non-blocking sections
//! * while a core state is locked, the event registry may be read, never the other way round
//! * nothing is locked while an event action runs or while a core is halted

use spin::Mutex;
use tracing::{debug, error};

use crate::arbiter::{self, ConsumerQuery, PassOver, ProtectedResource};
use crate::attach::UserDebugger;
use crate::config::HvConfig;
use crate::errors::{HvError, Result};
use crate::event::{CoreFilter, EventType};
use crate::extension_points::Collaborators;
use crate::halt::HaltController;
use crate::hypercall::{self, HypercallCode};
use crate::registry::EventRegistry;
use crate::regs::GuestRegs;
use crate::state::{CoreState, Features};
use crate::vmcs::Vmcs;
use crate::CoreId;

pub struct HvContext {
    cores: Vec<Mutex<CoreState>>,
    pub(crate) registry: EventRegistry,
    pub(crate) features: Features,
    pub(crate) halt: HaltController,
    pub(crate) userdbg: UserDebugger,
    pub(crate) collab: Collaborators,
    config: HvConfig,
}

impl std::fmt::Debug for HvContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvContext")
            .field("cores", &self.cores.len())
            .field("features", &self.features)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HvContext {
    /// Build the context for `config.cores` cores, `vmcs_for` hands out the VMCS of a core
    pub fn new(
        config: HvConfig,
        collab: Collaborators,
        mut vmcs_for: impl FnMut(CoreId) -> Box<dyn Vmcs>,
    ) -> Self {
        let cores = (0..config.cores)
            .map(|core| Mutex::new(CoreState::new(core, vmcs_for(core))))
            .collect();
        debug!("virtualizing {} cores", config.cores);
        Self {
            cores,
            registry: EventRegistry::new(),
            features: Features::from_config(&config),
            halt: HaltController::new(config.cores),
            userdbg: UserDebugger::new(),
            collab,
            config,
        }
    }

    pub fn core_count(&self) -> u32 {
        self.cores.len() as u32
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }
    pub fn features(&self) -> &Features {
        &self.features
    }
    pub fn halt(&self) -> &HaltController {
        &self.halt
    }
    pub fn user_debugger(&self) -> &UserDebugger {
        &self.userdbg
    }
    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }
    pub fn config(&self) -> &HvConfig {
        &self.config
    }

    /// Run `f` with the state of `core` locked
    ///
    /// # Errors
    ///
    /// Fails with [`HvError::InvalidCoreId`] if there is no such core.
    pub fn with_core<R>(&self, core: CoreId, f: impl FnOnce(&mut CoreState) -> R) -> Result<R> {
        let lock = self.cores.get(core as usize).ok_or_else(|| {
            let err = HvError::InvalidCoreId(core);
            error!("{err}");
            err
        })?;
        let mut state = lock.lock();
        Ok(f(&mut state))
    }

    /// Execute a hypercall as if `core` had issued it
    pub fn direct_hypercall(
        &self,
        core: CoreId,
        code: HypercallCode,
        p1: u64,
        p2: u64,
        p3: u64,
    ) -> Result<()> {
        if core >= self.core_count() {
            return Err(HvError::InvalidCoreId(core));
        }
        let mut regs = GuestRegs::default();
        hypercall::execute(self, core, &mut regs, code, p1, p2, p3)
    }

    /// Execute a hypercall on the selected cores
    ///
    /// Every selected core runs the call even if another one failed. The first failure is
    /// reported.
    pub fn broadcast_hypercall(
        &self,
        cores: CoreFilter,
        code: HypercallCode,
        p1: u64,
        p2: u64,
        p3: u64,
    ) -> Result<()> {
        match cores {
            CoreFilter::Core(core) => self.direct_hypercall(core, code, p1, p2, p3),
            CoreFilter::All => {
                let failure: Mutex<Option<HvError>> = Mutex::new(None);
                self.collab.broadcast.run_on_each(&|core| {
                    if let Err(e) = self.direct_hypercall(core, code, p1, p2, p3) {
                        let mut failure = failure.lock();
                        if failure.is_none() {
                            *failure = Some(e);
                        }
                    }
                });
                match failure.into_inner() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Recompute-and-unset a resource on the selected cores
    ///
    /// Used where no hypercall exists for an unset without pass-over.
    pub fn unset_on_cores(
        &self,
        cores: CoreFilter,
        resource: ProtectedResource,
        bits: u64,
        pass_over: PassOver,
    ) {
        self.collab.broadcast.run_on_each(&|core| {
            if !cores.matches(core) {
                return;
            }
            if let Err(e) =
                self.with_core(core, |state| arbiter::unset(state, resource, bits, pass_over, self))
            {
                error!("could not unset {resource:?} on core {core}: {e}");
            }
        });
    }
}

impl ConsumerQuery for HvContext {
    fn has_enabled_event(&self, event_type: EventType, core: CoreId) -> bool {
        self.registry.has_enabled(event_type, core)
    }

    fn exception_event_vectors(&self, core: CoreId) -> u32 {
        self.registry.exception_vectors(core)
    }

    fn cr_event_mask(&self, core: CoreId, cr: u64) -> u64 {
        self.registry.cr_mask(core, cr)
    }

    fn has_cr_event(&self, core: CoreId, cr: u64) -> bool {
        self.registry.has_cr_event(core, cr)
    }

    fn features(&self) -> &Features {
        &self.features
    }

    fn ept_breakpoints(&self) -> usize {
        self.collab.ept.installed_breakpoints()
    }
}

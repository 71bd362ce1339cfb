//! The processor facade: module registry, lazy function resolution and the
//! guest-call entry sequence.

use cpu::{DebugInfoFlags, DebugListener};
use cpu::backend::{Backend, X64Backend};
use cpu::entry_table::{EntryStatus, EntryTable};
use cpu::export_resolver::ExportResolver;
use cpu::frontend::{Frontend, PpcFrontend};
use cpu::function::{Function, SymbolStatus};
use cpu::module::{BuiltinModule, DeclareOutcome, DefineOutcome, Module, BUILTIN_ADDRESS_BASE};
use cpu::stack_walker::StackWalker;
use cpu::state::ThreadState;
use memory::VirtualMemory;

use num_traits::FromPrimitive;

use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

/// Link-register value installed for the duration of a host-initiated call.
/// Emitted code that returns to this address is returning to the host.
pub const CALL_RETURN_SENTINEL: u32 = 0xBCBC_BCBC;

/// Value returned by `execute_with_args` when the call could not be made.
pub const CALL_FAILED_SENTINEL: u64 = 0xDEAD_BABE;

/// Scratch space reserved below the caller's stack pointer for the duration
/// of a call; some callees overwrite the caller's frame by a few dozen
/// bytes.
const STACK_SCRATCH_BYTES: u64 = 64 + 112;

/// Interrupt request level of the emulated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Irql {
    Passive = 0,
    Apc = 1,
    Dispatch = 2,
    Dpc = 3,
}

/// CPU configuration, fixed at processor construction.
#[derive(Debug, Clone)]
pub struct Options {
    /// Backend selector: `"x64"` requires the x64 backend, `"any"` takes
    /// the first backend available on this host. Anything else fails setup.
    pub backend: String,
    /// Debug information requested from the frontend at definition time.
    pub debug_info: DebugInfoFlags,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: "any".to_string(),
            debug_info: DebugInfoFlags::empty(),
        }
    }
}

/// Error returned by `Processor::setup`.
#[derive(Debug)]
pub enum SetupError {
    /// `setup` was called on an already initialized processor.
    AlreadyInitialized,
    /// The backend selector is not recognized.
    UnknownBackend(String),
    /// No backend usable on this host matched the selector.
    NoBackendAvailable,
    /// The chosen backend failed to initialize.
    BackendFailed,
    /// The frontend failed to initialize.
    FrontendFailed,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SetupError::AlreadyInitialized => write!(f, "CPU core is already initialized"),
            SetupError::UnknownBackend(name) => write!(f, "unknown CPU backend '{}'", name),
            SetupError::NoBackendAvailable => write!(f, "no usable CPU backend on this host"),
            SetupError::BackendFailed => write!(f, "backend initialization failed"),
            SetupError::FrontendFailed => write!(f, "frontend initialization failed"),
        }
    }
}

impl Error for SetupError {}

/// The guest-code execution core.
///
/// Owns the loaded modules and the entry table, wires the frontend/backend
/// pair together and turns guest addresses into callable functions on
/// first demand. All operations except `setup` take `&self`; any number of
/// threads may resolve and execute concurrently.
pub struct Processor {
    memory: Arc<dyn VirtualMemory>,
    export_resolver: Arc<ExportResolver>,
    debug_listener: Option<Arc<dyn DebugListener>>,
    options: Options,
    frontend: Option<Box<dyn Frontend>>,
    backend: Option<Arc<dyn Backend>>,
    stack_walker: Option<StackWalker>,
    modules: Mutex<Vec<Arc<dyn Module>>>,
    builtin_module: Arc<BuiltinModule>,
    entry_table: EntryTable,
    next_builtin_address: AtomicU32,
    irql: AtomicU32,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Processor")
            .field("options", &self.options)
            .field("initialized", &self.backend.is_some())
            .field("modules", &self.modules.lock().expect("modules lock poisoned").len())
            .field("entries", &self.entry_table.len())
            .finish()
    }
}

impl Processor {
    pub fn new(
        memory: Arc<dyn VirtualMemory>,
        export_resolver: Arc<ExportResolver>,
        debug_listener: Option<Arc<dyn DebugListener>>,
        options: Options,
    ) -> Self {
        Self {
            memory,
            export_resolver,
            debug_listener,
            options,
            frontend: None,
            backend: None,
            stack_walker: None,
            modules: Mutex::new(Vec::new()),
            builtin_module: Arc::new(BuiltinModule::new()),
            entry_table: EntryTable::new(),
            next_builtin_address: AtomicU32::new(BUILTIN_ADDRESS_BASE),
            irql: AtomicU32::new(Irql::Passive as u32),
        }
    }

    /// Initializes the CPU core: installs the builtin module, selects and
    /// initializes a backend per the configured selector, then brings up
    /// the frontend and the stack walker.
    pub fn setup(&mut self) -> Result<(), SetupError> {
        if self.frontend.is_some() || self.backend.is_some() {
            return Err(SetupError::AlreadyInitialized);
        }

        self.install_builtin_module();

        let backend: Arc<dyn Backend> = match self.options.backend.as_str() {
            "x64" => {
                if !X64Backend::available() {
                    return Err(SetupError::NoBackendAvailable);
                }
                Arc::new(X64Backend::new())
            }
            "any" => {
                // prefer x64; it is also the only backend right now
                if !X64Backend::available() {
                    return Err(SetupError::NoBackendAvailable);
                }
                Arc::new(X64Backend::new())
            }
            other => return Err(SetupError::UnknownBackend(other.to_string())),
        };

        self.finish_setup(backend)
    }

    fn install_builtin_module(&self) {
        let mut modules = self.modules.lock().expect("modules lock poisoned");
        let builtin: Arc<dyn Module> = self.builtin_module.clone();
        if !modules.iter().any(|module| Arc::ptr_eq(module, &builtin)) {
            modules.insert(0, builtin);
        }
    }

    fn finish_setup(&mut self, backend: Arc<dyn Backend>) -> Result<(), SetupError> {
        if !backend.initialize() {
            return Err(SetupError::BackendFailed);
        }

        let mut frontend = PpcFrontend::new(self.memory.clone(), backend.clone());
        if !frontend.initialize() {
            return Err(SetupError::FrontendFailed);
        }

        // both halves are up; the stack walker hangs off the backend's
        // code cache
        self.stack_walker = Some(StackWalker::new(backend.code_cache().clone()));
        info!("CPU core ready ({} backend)", backend.name());
        self.backend = Some(backend);
        self.frontend = Some(Box::new(frontend));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn setup_with_backend(&mut self, backend: Arc<dyn Backend>) -> Result<(), SetupError> {
        if self.frontend.is_some() || self.backend.is_some() {
            return Err(SetupError::AlreadyInitialized);
        }
        self.install_builtin_module();
        self.finish_setup(backend)
    }

    #[cfg(test)]
    pub(crate) fn replace_frontend(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    pub fn memory(&self) -> &Arc<dyn VirtualMemory> {
        &self.memory
    }

    pub fn export_resolver(&self) -> &Arc<ExportResolver> {
        &self.export_resolver
    }

    pub fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.backend.as_ref()
    }

    pub fn stack_walker(&self) -> Option<&StackWalker> {
        self.stack_walker.as_ref()
    }

    pub fn debug_info_flags(&self) -> DebugInfoFlags {
        self.options.debug_info
    }

    /// Appends a module to the registry.
    pub fn add_module(&self, module: Arc<dyn Module>) {
        let mut modules = self.modules.lock().expect("modules lock poisoned");
        modules.push(module);
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        let modules = self.modules.lock().expect("modules lock poisoned");
        modules.iter().find(|module| module.name() == name).cloned()
    }

    /// Snapshot of the module list at the time of the call.
    pub fn get_modules(&self) -> Vec<Arc<dyn Module>> {
        let modules = self.modules.lock().expect("modules lock poisoned");
        modules.clone()
    }

    /// Registers a host-implemented pseudo-function in the reserved builtin
    /// region and returns its symbol.
    ///
    /// The symbol is declared but not yet in the entry table; the first
    /// resolution of its address drives it through the normal define path
    /// (which, for builtins, bypasses the frontend entirely).
    pub fn define_builtin<H>(&self, name: &str, handler: H, arg0: u64, arg1: u64) -> Arc<Function>
    where
        H: Fn(&mut ThreadState, u64, u64) -> u64 + Send + Sync + 'static,
    {
        let address = self.next_builtin_address.fetch_add(4, Ordering::SeqCst);

        let (function, _) = self.builtin_module.declare_function(address);
        function.set_end_address(address + 4);
        function.set_name(name);
        function.setup_builtin(handler, arg0, arg1);
        function.set_status(SymbolStatus::Declared);
        debug!("builtin {} at {:#010X}", name, address);
        function
    }

    /// Read-only entry table lookup; never triggers translation.
    pub fn query_function(&self, address: u32) -> Option<Arc<Function>> {
        self.entry_table.get(address).and_then(|entry| entry.function())
    }

    /// All ready functions whose address range contains `address`.
    pub fn find_functions_with_address(&self, address: u32) -> Vec<Arc<Function>> {
        self.entry_table.find_with_address(address)
    }

    /// Returns the callable function at `address`, translating it first if
    /// this is the first resolution of the address.
    ///
    /// Translation happens at most once per address; a failed translation
    /// is permanent and every later resolution of the address returns
    /// `None` without touching the frontend again.
    pub fn resolve_function(&self, address: u32) -> Option<Arc<Function>> {
        let (entry, status) = self.entry_table.get_or_create(address);
        if status == EntryStatus::New {
            // This thread drives the resolution. Another thread may race
            // us here while the entry is still `New`; the declare/define
            // stages below are first-writer-wins, so both converge on the
            // same symbol.
            let module = match self.find_containing_module(address) {
                Some(module) => module,
                None => {
                    // The entry intentionally stays `New`: the module may
                    // simply not be loaded yet, and the next resolution
                    // retries the scan.
                    debug!("resolve {:#010X}: no module contains the address", address);
                    return None;
                }
            };

            let function = match self.lookup_function_in(&*module, address) {
                Some(function) => function,
                None => {
                    entry.set_status(EntryStatus::Failed);
                    return None;
                }
            };

            if !self.demand_function(&*module, &function) {
                entry.set_status(EntryStatus::Failed);
                return None;
            }

            entry.set_ready(&function);
            return Some(function);
        }

        if status == EntryStatus::Ready {
            entry.function()
        } else {
            None
        }
    }

    /// Looks up (declaring if necessary) the symbol at `address` without
    /// demanding its definition.
    pub fn lookup_function(&self, address: u32) -> Option<Arc<Function>> {
        let module = self.find_containing_module(address)?;
        self.lookup_function_in(&*module, address)
    }

    fn find_containing_module(&self, address: u32) -> Option<Arc<dyn Module>> {
        let modules = self.modules.lock().expect("modules lock poisoned");
        // TODO: sort modules by code address so this can binary search, and
        // cache the last hit module; lookups cluster heavily
        modules.iter().find(|module| module.contains_address(address)).cloned()
    }

    fn lookup_function_in(&self, module: &dyn Module, address: u32) -> Option<Arc<Function>> {
        let (function, outcome) = module.declare_function(address);
        if outcome == DeclareOutcome::New {
            if !function.is_guest() {
                // builtins are registered through `define_builtin`; a fresh
                // symbol in the sentinel region has nothing to bind to
                error!("lookup {:#010X}: unregistered builtin address", address);
                function.set_status(SymbolStatus::Failed);
                return None;
            }
            let declared = match self.frontend {
                Some(ref frontend) => frontend.declare_function(&function),
                None => false,
            };
            if !declared {
                function.set_status(SymbolStatus::Failed);
                return None;
            }
            function.set_status(SymbolStatus::Declared);
        }
        Some(function)
    }

    fn demand_function(&self, module: &dyn Module, function: &Arc<Function>) -> bool {
        match module.define_function(function) {
            DefineOutcome::New => {
                let defined = if function.is_guest() {
                    match self.frontend {
                        Some(ref frontend) => {
                            frontend.define_function(function, self.options.debug_info)
                        }
                        None => false,
                    }
                } else {
                    // builtins bound their handler at declaration time;
                    // there is nothing to translate
                    true
                };
                if !defined {
                    function.set_status(SymbolStatus::Failed);
                    return false;
                }

                // let the debugger index the symbol before anyone can
                // observe it as defined
                if let Some(ref listener) = self.debug_listener {
                    listener.on_function_defined(function);
                }

                function.set_status(SymbolStatus::Defined);
                true
            }
            DefineOutcome::Existing => true,
            DefineOutcome::Failed => false,
        }
    }

    /// Calls the function at `address` on the calling thread, in the guest
    /// context carried by `thread_state`.
    ///
    /// The stack pointer and link register are restored to their pre-call
    /// values on every exit path, including callees that clobber them.
    pub fn execute(&self, thread_state: &mut ThreadState, address: u32) -> bool {
        let function = match self.resolve_function(address) {
            Some(function) => function,
            None => {
                error!("execute({:#010X}): failed to resolve function", address);
                return false;
            }
        };

        let (previous_r1, previous_lr) = {
            let context = thread_state.context_mut();
            let previous = (context.r[1], context.lr);
            context.r[1] = previous.0.wrapping_sub(STACK_SCRATCH_BYTES);
            context.lr = CALL_RETURN_SENTINEL as u64;
            previous
        };

        let result = function.call(thread_state, CALL_RETURN_SENTINEL);

        let context = thread_state.context_mut();
        context.lr = previous_lr;
        context.r[1] = previous_r1;

        result
    }

    /// Like `execute`, but marshals up to five arguments into `r3..r7`
    /// first and returns the guest's return register afterwards.
    ///
    /// Returns [`CALL_FAILED_SENTINEL`] when the call could not be made.
    pub fn execute_with_args(&self, thread_state: &mut ThreadState, address: u32, args: &[u64]) -> u64 {
        assert!(args.len() <= 5, "guest calls marshal at most 5 arguments");
        {
            let context = thread_state.context_mut();
            for (i, arg) in args.iter().enumerate() {
                context.r[3 + i] = *arg;
            }
        }
        if !self.execute(thread_state, address) {
            return CALL_FAILED_SENTINEL;
        }
        thread_state.context().r[3]
    }

    /// Atomically raises the interrupt request level, returning the
    /// previous level.
    pub fn raise_irql(&self, new_value: Irql) -> Irql {
        Irql::from_u32(self.irql.swap(new_value as u32, Ordering::SeqCst))
            .expect("IRQL cell holds an invalid level")
    }

    /// Atomically lowers the interrupt request level back to `old_value`,
    /// returning the level that was current.
    pub fn lower_irql(&self, old_value: Irql) -> Irql {
        Irql::from_u32(self.irql.swap(old_value as u32, Ordering::SeqCst))
            .expect("IRQL cell holds an invalid level")
    }
}

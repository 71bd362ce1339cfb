//! Guest modules and their symbol maps.
//!
//! A module is anything that owns a range of guest addresses and can mint
//! symbols for them. The trait carries the two lifecycle operations every
//! module shares: `declare_function` (atomic insert-or-get of the symbol)
//! and `define_function` (serialization of concurrent definers). Both are
//! provided methods built on [`SymbolMap`], so implementors only supply
//! naming, containment and the symbol factory.

use cpu::function::Function;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

/// First address of the reserved builtin sentinel region.
///
/// Every address whose high 28 bits are all ones belongs to the builtin
/// module; no guest module may claim it.
pub const BUILTIN_ADDRESS_BASE: u32 = 0xFFFF_FFF0;

/// Result of `declare_function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// The symbol was created by this call; the caller must drive it to
    /// `Declared` (or `Failed`).
    New,
    /// A symbol already existed at the address.
    Existing,
}

/// Result of `define_function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineOutcome {
    /// The caller claimed the definition stage and must drive the symbol to
    /// `Defined` (or `Failed`).
    New,
    /// Another thread already defined the symbol.
    Existing,
    /// The symbol is permanently failed.
    Failed,
}

/// Per-module symbol storage with atomic insert-or-get.
#[derive(Debug)]
pub struct SymbolMap {
    map: Mutex<HashMap<u32, Arc<Function>>>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the symbol at `address`, creating it with `create` if none
    /// exists. Exactly one caller per address ever observes
    /// `DeclareOutcome::New`.
    pub fn declare_with<F>(&self, address: u32, create: F) -> (Arc<Function>, DeclareOutcome)
    where
        F: FnOnce() -> Function,
    {
        let mut map = self.map.lock().expect("symbol map lock poisoned");
        match map.entry(address) {
            Entry::Occupied(entry) => (entry.get().clone(), DeclareOutcome::Existing),
            Entry::Vacant(entry) => {
                let function = Arc::new(create());
                entry.insert(function.clone());
                (function, DeclareOutcome::New)
            }
        }
    }

    pub fn get(&self, address: u32) -> Option<Arc<Function>> {
        self.map.lock().expect("symbol map lock poisoned").get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("symbol map lock poisoned").len()
    }
}

/// Capability set required of every guest module, builtin or otherwise.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `address` lies inside this module's guest address range.
    fn contains_address(&self, address: u32) -> bool;

    /// Creates a fresh, undeclared symbol for `address`. Called at most once
    /// per address, under the symbol map's insert lock.
    fn create_function(&self, address: u32) -> Function;

    /// The module's symbol storage.
    fn symbols(&self) -> &SymbolMap;

    /// Atomically looks up or creates the symbol at `address`.
    ///
    /// Exactly one caller observes [`DeclareOutcome::New`] for a given
    /// address and becomes responsible for declaring the symbol. This never
    /// blocks beyond the map insert itself.
    fn declare_function(&self, address: u32) -> (Arc<Function>, DeclareOutcome) {
        self.symbols().declare_with(address, || self.create_function(address))
    }

    /// Serializes concurrent definers of `function`.
    ///
    /// Exactly one caller observes [`DefineOutcome::New`] and must complete
    /// the definition; the others block until the symbol leaves the defining
    /// stage and then observe the terminal state that was reached.
    fn define_function(&self, function: &Arc<Function>) -> DefineOutcome {
        function.begin_define()
    }

    /// Read-only symbol lookup; never creates.
    fn function_at(&self, address: u32) -> Option<Arc<Function>> {
        self.symbols().get(address)
    }
}

/// The module backing the reserved sentinel region.
///
/// Its symbols are host-implemented pseudo-functions registered through
/// `Processor::define_builtin`; they never pass through the frontend.
#[derive(Debug)]
pub struct BuiltinModule {
    symbols: SymbolMap,
}

impl BuiltinModule {
    pub fn new() -> Self {
        Self {
            symbols: SymbolMap::new(),
        }
    }
}

impl Module for BuiltinModule {
    fn name(&self) -> &str {
        "builtin"
    }

    fn contains_address(&self, address: u32) -> bool {
        (address & BUILTIN_ADDRESS_BASE) == BUILTIN_ADDRESS_BASE
    }

    fn create_function(&self, address: u32) -> Function {
        Function::builtin(address)
    }

    fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }
}

/// A guest module covering a flat `[low, high)` address range.
///
/// Used for raw images whose code has been mapped into guest memory by the
/// caller; there is no header parsing here.
#[derive(Debug)]
pub struct RawModule {
    name: String,
    low_address: u32,
    high_address: u32,
    symbols: SymbolMap,
}

impl RawModule {
    pub fn new<S: Into<String>>(name: S, low_address: u32, high_address: u32) -> Self {
        Self {
            name: name.into(),
            low_address,
            high_address,
            symbols: SymbolMap::new(),
        }
    }

    pub fn low_address(&self) -> u32 {
        self.low_address
    }

    pub fn high_address(&self) -> u32 {
        self.high_address
    }
}

impl Module for RawModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn contains_address(&self, address: u32) -> bool {
        address >= self.low_address && address < self.high_address
    }

    fn create_function(&self, address: u32) -> Function {
        Function::guest(address)
    }

    fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }
}

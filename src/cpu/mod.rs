//! Emulation of the Xbox 360's Xenon CPU.
//!
//! The [`processor::Processor`] is the entry point: it owns the loaded
//! guest modules, translates guest functions on first demand through a
//! frontend/backend pair, and dispatches guest-context calls into the
//! translated (or host-implemented) entry points.

pub mod backend;
pub mod entry_table;
pub mod export_resolver;
pub mod frontend;
pub mod function;
pub mod module;
pub mod processor;
pub mod stack_walker;
mod state;

pub use self::function::{Function, SymbolStatus};
pub use self::processor::{Irql, Options, Processor};
pub use self::state::{PpcContext, ThreadState};

use std::sync::Arc;

bitflags! {
    /// Debug information requested from the frontend when a function is
    /// defined.
    pub struct DebugInfoFlags: u32 {
        /// Log every function as it is defined.
        const TRACE_FUNCTIONS = 1 << 0;
        /// Keep source-level disassembly alongside the translated unit.
        const DISASM_SOURCE = 1 << 1;
    }
}

impl Default for DebugInfoFlags {
    fn default() -> Self {
        DebugInfoFlags::empty()
    }
}

/// Debugger-side callback surface.
///
/// When attached, the processor reports every successful definition before
/// the symbol becomes visible as defined, so the debugger can index it
/// ahead of the first call.
pub trait DebugListener: Send + Sync {
    fn on_function_defined(&self, function: &Arc<Function>);
}

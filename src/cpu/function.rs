//! Guest symbols: per-address function metadata and its lifecycle.
//!
//! A `Function` is created exactly once per (module, address) and is shared
//! between the owning module's symbol map and the processor's entry table.
//! Everything mutable on it is either a status transition or metadata that
//! is written while the symbol is being declared or defined, so the struct
//! is interior-mutable and safe to hand out behind `Arc`.

use cpu::backend::NativeCode;
use cpu::module::DefineOutcome;
use cpu::state::ThreadState;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle state of a symbol.
///
/// A symbol moves along `Undeclared → Declared → Defining → Defined`;
/// `Failed` is terminal and reachable from any non-terminal state. Each
/// forward transition is performed only by the single thread that won the
/// corresponding declare/define stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    /// Created, but its extent and signature are not known yet.
    Undeclared,
    /// Extent and signature are known; no native code exists yet.
    Declared,
    /// A thread is currently translating the symbol.
    Defining,
    /// Translation finished; the symbol can be called.
    Defined,
    /// Declaration or translation failed. Permanent.
    Failed,
}

/// Handler bound to a builtin function.
///
/// Receives the calling guest thread's state and the two opaque arguments
/// given to `define_builtin`. The returned value is placed in the guest's
/// return register (`r3`) by the dispatcher.
pub type BuiltinHandler = Box<dyn Fn(&mut ThreadState, u64, u64) -> u64 + Send + Sync>;

struct BuiltinBinding {
    handler: BuiltinHandler,
    arg0: u64,
    arg1: u64,
}

impl fmt::Debug for BuiltinBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BuiltinBinding")
            .field("arg0", &self.arg0)
            .field("arg1", &self.arg1)
            .finish()
    }
}

/// Variant-specific payload of a symbol.
#[derive(Debug)]
enum FunctionBody {
    /// Guest machine code; translated by the frontend/backend pair on first
    /// demand.
    Guest {
        native: RwLock<Option<Arc<NativeCode>>>,
    },
    /// Host-implemented pseudo-function in the reserved sentinel range.
    /// Never passes through the frontend.
    Builtin {
        binding: RwLock<Option<BuiltinBinding>>,
    },
}

/// A single guest callable: metadata, lifecycle status and dispatch target.
#[derive(Debug)]
pub struct Function {
    address: u32,
    end_address: AtomicU32,
    name: RwLock<String>,
    status: Mutex<SymbolStatus>,
    status_cv: Condvar,
    body: FunctionBody,
}

impl Function {
    /// Creates an undeclared guest function at `address`.
    pub fn guest(address: u32) -> Self {
        Self::new(address, FunctionBody::Guest {
            native: RwLock::new(None),
        })
    }

    /// Creates an undeclared builtin function at `address`.
    pub fn builtin(address: u32) -> Self {
        Self::new(address, FunctionBody::Builtin {
            binding: RwLock::new(None),
        })
    }

    fn new(address: u32, body: FunctionBody) -> Self {
        Self {
            address,
            end_address: AtomicU32::new(0),
            name: RwLock::new(String::new()),
            status: Mutex::new(SymbolStatus::Undeclared),
            status_cv: Condvar::new(),
            body,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// End of the function's guest address range (exclusive). 0 until the
    /// symbol has been declared.
    pub fn end_address(&self) -> u32 {
        self.end_address.load(Ordering::Acquire)
    }

    pub fn set_end_address(&self, end_address: u32) {
        self.end_address.store(end_address, Ordering::Release);
    }

    pub fn name(&self) -> String {
        self.name.read().expect("symbol name lock poisoned").clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write().expect("symbol name lock poisoned") = name.to_string();
    }

    pub fn is_guest(&self) -> bool {
        match self.body {
            FunctionBody::Guest { .. } => true,
            FunctionBody::Builtin { .. } => false,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !self.is_guest()
    }

    pub fn status(&self) -> SymbolStatus {
        *self.status.lock().expect("symbol status lock poisoned")
    }

    /// Publishes a new lifecycle status and wakes any threads blocked in
    /// `define_function` on this symbol.
    ///
    /// Must only be called by the thread that owns the current stage (the
    /// one that observed `New` from `declare_function`/`define_function`).
    pub fn set_status(&self, status: SymbolStatus) {
        let mut guard = self.status.lock().expect("symbol status lock poisoned");
        *guard = status;
        self.status_cv.notify_all();
    }

    /// Binds the host handler and its two opaque arguments to a builtin
    /// function.
    pub fn setup_builtin<H>(&self, handler: H, arg0: u64, arg1: u64)
    where
        H: Fn(&mut ThreadState, u64, u64) -> u64 + Send + Sync + 'static,
    {
        match self.body {
            FunctionBody::Builtin { ref binding } => {
                *binding.write().expect("builtin binding lock poisoned") = Some(BuiltinBinding {
                    handler: Box::new(handler),
                    arg0,
                    arg1,
                });
            }
            FunctionBody::Guest { .. } => {
                panic!("attempted to bind a builtin handler to guest function {:#010X}", self.address);
            }
        }
    }

    /// The native entry produced by the backend, once the symbol is defined.
    pub fn native_code(&self) -> Option<Arc<NativeCode>> {
        match self.body {
            FunctionBody::Guest { ref native } => {
                native.read().expect("native code lock poisoned").clone()
            }
            FunctionBody::Builtin { .. } => None,
        }
    }

    pub fn set_native_code(&self, code: Arc<NativeCode>) {
        match self.body {
            FunctionBody::Guest { ref native } => {
                *native.write().expect("native code lock poisoned") = Some(code);
            }
            FunctionBody::Builtin { .. } => {
                panic!("attempted to attach native code to builtin function {:#010X}", self.address);
            }
        }
    }

    /// Claims or waits out the definition stage of this symbol.
    ///
    /// Exactly one caller observes `New` and becomes responsible for driving
    /// the definition to `Defined` or `Failed` via `set_status`. Callers that
    /// arrive while declaration or definition is still in flight block until
    /// the owning thread publishes a terminal state.
    pub(crate) fn begin_define(&self) -> DefineOutcome {
        let mut status = self.status.lock().expect("symbol status lock poisoned");
        loop {
            match *status {
                SymbolStatus::Declared => {
                    *status = SymbolStatus::Defining;
                    return DefineOutcome::New;
                }
                SymbolStatus::Undeclared | SymbolStatus::Defining => {
                    status = self.status_cv.wait(status)
                        .expect("symbol status lock poisoned");
                }
                SymbolStatus::Defined => return DefineOutcome::Existing,
                SymbolStatus::Failed => return DefineOutcome::Failed,
            }
        }
    }

    /// Transfers control to the function on the calling thread.
    ///
    /// Builtins dispatch straight to their bound handler, whose return value
    /// is placed in `r3`. Guest functions dispatch to the native entry the
    /// backend produced at definition time.
    pub fn call(&self, thread_state: &mut ThreadState, return_address: u32) -> bool {
        match self.body {
            FunctionBody::Builtin { ref binding } => {
                let binding = binding.read().expect("builtin binding lock poisoned");
                match *binding {
                    Some(ref binding) => {
                        let result = (binding.handler)(thread_state, binding.arg0, binding.arg1);
                        thread_state.context_mut().r[3] = result;
                        true
                    }
                    None => {
                        error!("builtin {:#010X} called without a bound handler", self.address);
                        false
                    }
                }
            }
            FunctionBody::Guest { .. } => {
                match self.native_code() {
                    Some(code) => code.invoke(thread_state, return_address),
                    None => {
                        error!("guest function {:#010X} called before it was defined", self.address);
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn builtin_dispatch_writes_r3() {
        let function = Function::builtin(0xFFFF_FFF0);
        function.setup_builtin(|state, arg0, arg1| {
            assert_eq!(state.context().lr, 0xBCBC_BCBC);
            arg0 + arg1
        }, 40, 2);

        let mut state = ThreadState::new(1, 0x7000_0000);
        state.context_mut().lr = 0xBCBC_BCBC;
        assert!(function.call(&mut state, 0xBCBC_BCBC));
        assert_eq!(state.context().r[3], 42);
    }

    #[test]
    fn unbound_builtin_fails() {
        let function = Function::builtin(0xFFFF_FFF0);
        let mut state = ThreadState::new(1, 0x7000_0000);
        assert!(!function.call(&mut state, 0));
    }

    #[test]
    fn undefined_guest_call_fails() {
        let function = Function::guest(0x8201_0000);
        let mut state = ThreadState::new(1, 0x7000_0000);
        assert!(!function.call(&mut state, 0));
    }

    #[test]
    fn define_stage_is_claimed_once() {
        let function = Function::guest(0x8201_0000);
        function.set_status(SymbolStatus::Declared);
        assert_eq!(function.begin_define(), DefineOutcome::New);

        // the claim moved the symbol into `Defining`
        assert_eq!(function.status(), SymbolStatus::Defining);
    }

    #[test]
    fn later_definers_wait_for_the_owner() {
        let function = Arc::new(Function::guest(0x8201_0000));
        function.set_status(SymbolStatus::Declared);
        assert_eq!(function.begin_define(), DefineOutcome::New);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let function = function.clone();
            thread::spawn(move || {
                tx.send(()).unwrap();
                function.begin_define()
            })
        };

        // wait until the second definer is (very likely) blocked, then
        // publish the terminal state
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        function.set_status(SymbolStatus::Defined);

        assert_eq!(waiter.join().unwrap(), DefineOutcome::Existing);
    }

    #[test]
    fn failure_is_absorbing() {
        let function = Function::guest(0x8201_0000);
        function.set_status(SymbolStatus::Failed);
        assert_eq!(function.begin_define(), DefineOutcome::Failed);
        assert_eq!(function.status(), SymbolStatus::Failed);
    }
}

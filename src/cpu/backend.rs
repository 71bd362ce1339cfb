//! Native-code backends and the shared code cache.
//!
//! The backend owns the process-wide code cache. Translated units are
//! placed into the cache's append-only region and registered in a span
//! table so that other components (the stack walker, diagnostics) can map
//! guest addresses back to cached code. Dispatch goes through
//! [`NativeCode`], the per-function entry handle the frontend attaches to
//! a symbol at definition time.

use cpu::function::Function;
use cpu::state::ThreadState;

use dashmap::DashMap;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Host-callable entry point for a defined guest function.
pub struct NativeCode {
    cache_offset: usize,
    length: usize,
    thunk: Box<dyn Fn(&mut ThreadState, u32) -> bool + Send + Sync>,
}

impl NativeCode {
    pub fn new<F>(cache_offset: usize, length: usize, thunk: F) -> Self
    where
        F: Fn(&mut ThreadState, u32) -> bool + Send + Sync + 'static,
    {
        Self {
            cache_offset,
            length,
            thunk: Box::new(thunk),
        }
    }

    /// An entry that lives outside the cache region; used by alternative
    /// frontends and tests that synthesize functions directly.
    pub fn from_fn<F>(thunk: F) -> Self
    where
        F: Fn(&mut ThreadState, u32) -> bool + Send + Sync + 'static,
    {
        Self::new(0, 0, thunk)
    }

    /// Offset of the emitted unit inside the cache region.
    pub fn cache_offset(&self) -> usize {
        self.cache_offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn invoke(&self, thread_state: &mut ThreadState, return_address: u32) -> bool {
        (self.thunk)(thread_state, return_address)
    }
}

impl fmt::Debug for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NativeCode")
            .field("cache_offset", &self.cache_offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Placement record of one translated unit inside the code cache.
#[derive(Debug, Clone)]
pub struct CodeSpan {
    pub guest_address: u32,
    pub guest_end: u32,
    pub offset: usize,
    pub length: usize,
    pub name: String,
}

/// Shared, append-only storage for translated units.
///
/// Threads observe a placed unit only through the span table, which is
/// updated after the bytes are in the region; readers therefore never see
/// a partially written span.
#[derive(Debug)]
pub struct CodeCache {
    region: Mutex<Vec<u8>>,
    spans: DashMap<u32, CodeSpan>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            region: Mutex::new(Vec::new()),
            spans: DashMap::new(),
        }
    }

    /// Appends `bytes` to the region and registers the span under the
    /// unit's guest start address.
    pub fn place(&self, guest_address: u32, guest_end: u32, name: &str, bytes: &[u8]) -> CodeSpan {
        let offset = {
            let mut region = self.region.lock().expect("code cache region lock poisoned");
            let offset = region.len();
            region.extend_from_slice(bytes);
            offset
        };
        let span = CodeSpan {
            guest_address,
            guest_end,
            offset,
            length: bytes.len(),
            name: name.to_string(),
        };
        self.spans.insert(guest_address, span.clone());
        span
    }

    /// Looks up the span starting exactly at `guest_address`.
    pub fn lookup(&self, guest_address: u32) -> Option<CodeSpan> {
        self.spans.get(&guest_address).map(|span| span.value().clone())
    }

    /// Finds the span whose `[guest_address, guest_end)` range contains
    /// `guest_address`.
    pub fn find_containing(&self, guest_address: u32) -> Option<CodeSpan> {
        for slot in self.spans.iter() {
            let span = slot.value();
            if guest_address >= span.guest_address && guest_address < span.guest_end {
                return Some(span.clone());
            }
        }
        None
    }

    pub fn used_bytes(&self) -> usize {
        self.region.lock().expect("code cache region lock poisoned").len()
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }
}

/// Capability set the execution core consumes from a backend.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self) -> bool;

    /// The shared code cache; the stack walker is constructed against it
    /// once setup finishes.
    fn code_cache(&self) -> &Arc<CodeCache>;

    /// Places a translated unit in the code cache and returns its dispatch
    /// handle. Builtin symbols never get here; they dispatch straight to
    /// their bound handler.
    fn assemble(&self, function: &Function, words: &[u32]) -> Option<Arc<NativeCode>>;
}

/// Backend targeting x86-64 hosts.
pub struct X64Backend {
    code_cache: Arc<CodeCache>,
    initialized: AtomicBool,
}

impl X64Backend {
    pub fn new() -> Self {
        Self {
            code_cache: Arc::new(CodeCache::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Whether this backend can run on the current host.
    pub fn available() -> bool {
        cfg!(target_arch = "x86_64")
    }
}

impl fmt::Debug for X64Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("X64Backend")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .field("cached_spans", &self.code_cache.span_count())
            .finish()
    }
}

impl Backend for X64Backend {
    fn name(&self) -> &str {
        "x64"
    }

    fn initialize(&self) -> bool {
        if !Self::available() {
            error!("x64 backend requested on a non-x86_64 host");
            return false;
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("x64 backend initialized twice");
        }
        true
    }

    fn code_cache(&self) -> &Arc<CodeCache> {
        &self.code_cache
    }

    fn assemble(&self, function: &Function, words: &[u32]) -> Option<Arc<NativeCode>> {
        let address = function.address();
        let name = function.name();

        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&[
                (word >> 24) as u8,
                (word >> 16) as u8,
                (word >> 8) as u8,
                *word as u8,
            ]);
        }

        let span = self.code_cache.place(address, function.end_address(), &name, &bytes);
        debug!("placed {} ({} bytes) at cache offset {:#X}", name, span.length, span.offset);

        // The instruction selector is not wired up yet; the translated unit
        // is resident in the cache, but dispatching into it reports the
        // call-failure path. TODO: emit host code and jump to it here.
        Some(Arc::new(NativeCode::new(span.offset, span.length, move |_state, _return_address| {
            error!("no host code emitted for guest function {:#010X}; call fails", address);
            false
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_placement_is_appended_and_registered() {
        let cache = CodeCache::new();
        let a = cache.place(0x8201_0000, 0x8201_0008, "sub_82010000", &[0x4E, 0x80, 0x00, 0x20]);
        let b = cache.place(0x8201_0008, 0x8201_000C, "sub_82010008", &[0x60, 0x00, 0x00, 0x00]);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 4);
        assert_eq!(cache.used_bytes(), 8);
        assert_eq!(cache.span_count(), 2);

        assert_eq!(cache.lookup(0x8201_0000).unwrap().name, "sub_82010000");
        assert!(cache.lookup(0x8201_0004).is_none());
        assert_eq!(cache.find_containing(0x8201_0004).unwrap().name, "sub_82010000");
        assert!(cache.find_containing(0x8201_000C).is_none());
    }

    #[test]
    fn assemble_registers_a_span() {
        let backend = X64Backend::new();
        let function = Function::guest(0x8201_0000);
        function.set_name("sub_82010000");
        function.set_end_address(0x8201_0008);

        let code = backend.assemble(&function, &[0x3860_0001, 0x4E80_0020]).unwrap();
        assert_eq!(code.length(), 8);
        assert_eq!(backend.code_cache().used_bytes(), 8);

        // dispatch surfaces the call-failure path until an emitter exists
        let mut state = ThreadState::new(1, 0x7000_0000);
        assert!(!code.invoke(&mut state, 0xBCBC_BCBC));
    }

    #[test]
    fn synthesized_entries_dispatch() {
        let code = NativeCode::from_fn(|state, return_address| {
            state.context_mut().r[3] = return_address as u64;
            true
        });
        let mut state = ThreadState::new(1, 0x7000_0000);
        assert!(code.invoke(&mut state, 0x1234));
        assert_eq!(state.context().r[3], 0x1234);
    }
}

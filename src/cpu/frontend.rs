//! The PowerPC frontend: guest symbol declaration and translation.
//!
//! Declaration establishes a symbol's extent by scanning forward from its
//! entry point until the function returns to its caller; definition reads
//! the instruction words and hands them to the backend for placement in
//! the code cache.

use cpu::DebugInfoFlags;
use cpu::backend::Backend;
use cpu::function::Function;
use memory::VirtualMemory;

use std::fmt;
use std::sync::Arc;

/// Upper bound for the extent scan. Functions larger than this are almost
/// certainly data misidentified as code.
const MAX_SCAN_BYTES: u32 = 16 * 1024;

/// Capability set the execution core consumes from a frontend.
///
/// Both operations report failure as `false`; the processor turns that into
/// an absent symbol and a permanently failed entry.
pub trait Frontend: Send + Sync {
    fn initialize(&mut self) -> bool;

    /// Parses the signature/extent of an undeclared guest symbol.
    fn declare_function(&self, function: &Function) -> bool;

    /// Fully translates a declared guest symbol; on success the symbol is
    /// ready for native dispatch.
    fn define_function(&self, function: &Function, flags: DebugInfoFlags) -> bool;
}

/// Returns true for `bclr`-family words that unconditionally return through
/// the link register (`blr` and its hint variants).
fn is_return(word: u32) -> bool {
    // opcode 19, extended opcode 16, LK = 0
    if !bitpat!(0 1 0 0 1 1 _ _ _ _ _ _ _ _ _ _ _ _ _ _ _ 0 0 0 0 0 1 0 0 0 0 0)(word) {
        return false;
    }
    // BO must encode "branch always"; conditional returns don't end the
    // function
    (word >> 21) & 0b10100 == 0b10100
}

/// Frontend for the 360's PowerPC instruction stream.
pub struct PpcFrontend {
    memory: Arc<dyn VirtualMemory>,
    backend: Arc<dyn Backend>,
}

impl PpcFrontend {
    pub fn new(memory: Arc<dyn VirtualMemory>, backend: Arc<dyn Backend>) -> Self {
        Self {
            memory,
            backend,
        }
    }
}

impl fmt::Debug for PpcFrontend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PpcFrontend").finish()
    }
}

impl Frontend for PpcFrontend {
    fn initialize(&mut self) -> bool {
        debug!("PowerPC frontend ready");
        true
    }

    fn declare_function(&self, function: &Function) -> bool {
        let address = function.address();
        if address % 4 != 0 {
            error!("declare {:#010X}: misaligned function address", address);
            return false;
        }

        let mut offset = 0;
        let end_address = loop {
            if offset >= MAX_SCAN_BYTES {
                error!("declare {:#010X}: no return within {} bytes", address, MAX_SCAN_BYTES);
                return false;
            }
            let word = match self.memory.load_u32(address + offset) {
                Ok(word) => word,
                Err(e) => {
                    error!("declare {:#010X}: fetch at +{:#X} failed: {}", address, offset, e);
                    return false;
                }
            };
            if is_return(word) {
                break address + offset + 4;
            }
            offset += 4;
        };

        function.set_end_address(end_address);
        function.set_name(&format!("sub_{:08X}", address));
        trace!("declared sub_{:08X}, end {:#010X}", address, end_address);
        true
    }

    fn define_function(&self, function: &Function, flags: DebugInfoFlags) -> bool {
        let address = function.address();
        let end_address = function.end_address();
        if end_address <= address {
            error!("define {:#010X}: symbol has no extent", address);
            return false;
        }

        let mut words = Vec::with_capacity(((end_address - address) / 4) as usize);
        let mut addr = address;
        while addr < end_address {
            match self.memory.load_u32(addr) {
                Ok(word) => words.push(word),
                Err(e) => {
                    error!("define {:#010X}: fetch at {:#010X} failed: {}", address, addr, e);
                    return false;
                }
            }
            addr += 4;
        }

        if flags.contains(DebugInfoFlags::TRACE_FUNCTIONS) {
            debug!("defining {} [{:#010X}..{:#010X}), {} words",
                   function.name(), address, end_address, words.len());
        }

        match self.backend.assemble(function, &words) {
            Some(code) => {
                function.set_native_code(code);
                true
            }
            None => {
                error!("define {:#010X}: backend rejected the unit", address);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpu::backend::X64Backend;
    use memory::ArrayMemory;

    fn frontend_over(words: &[u32]) -> (PpcFrontend, Arc<dyn Backend>) {
        let memory = Arc::new(ArrayMemory::from_words(0x8201_0000, words));
        let backend: Arc<dyn Backend> = Arc::new(X64Backend::new());
        (PpcFrontend::new(memory, backend.clone()), backend)
    }

    #[test]
    fn return_detection() {
        assert!(is_return(0x4E80_0020));    // blr
        assert!(is_return(0x4E80_0820));    // blr with branch hint
        assert!(!is_return(0x4E80_0021));   // blrl is a call, not a return
        assert!(!is_return(0x4D82_0020));   // beqlr is conditional
        assert!(!is_return(0x4E80_0420));   // bctr
        assert!(!is_return(0x3860_0001));   // li r3, 1
        assert!(!is_return(0x6000_0000));   // nop
    }

    #[test]
    fn declare_scans_to_the_return() {
        let (frontend, _) = frontend_over(&[
            0x3860_0001,    // li r3, 1
            0x4D82_0020,    // beqlr - conditional, does not end the function
            0x6000_0000,    // nop
            0x4E80_0020,    // blr
        ]);

        let function = Function::guest(0x8201_0000);
        assert!(frontend.declare_function(&function));
        assert_eq!(function.end_address(), 0x8201_0010);
        assert_eq!(function.name(), "sub_82010000");
    }

    #[test]
    fn declare_fails_without_a_return() {
        let (frontend, _) = frontend_over(&[0x3860_0001, 0x6000_0000]);
        let function = Function::guest(0x8201_0000);
        assert!(!frontend.declare_function(&function));
    }

    #[test]
    fn declare_fails_on_misaligned_addresses() {
        let (frontend, _) = frontend_over(&[0x4E80_0020]);
        let function = Function::guest(0x8201_0002);
        assert!(!frontend.declare_function(&function));
    }

    #[test]
    fn define_places_the_body_in_the_cache() {
        let (frontend, backend) = frontend_over(&[0x3860_0001, 0x4E80_0020]);

        let function = Function::guest(0x8201_0000);
        assert!(frontend.declare_function(&function));
        assert!(frontend.define_function(&function, DebugInfoFlags::empty()));

        assert!(function.native_code().is_some());
        assert_eq!(backend.code_cache().used_bytes(), 8);
        let span = backend.code_cache().lookup(0x8201_0000).unwrap();
        assert_eq!(span.name, "sub_82010000");
        assert_eq!(span.guest_end, 0x8201_0008);
    }

    #[test]
    fn define_requires_a_declared_extent() {
        let (frontend, _) = frontend_over(&[0x4E80_0020]);
        let function = Function::guest(0x8201_0000);
        assert!(!frontend.define_function(&function, DebugInfoFlags::empty()));
    }
}

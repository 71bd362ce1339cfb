//! The address-keyed registry of resolution records.
//!
//! Every guest address the processor has been asked to resolve gets exactly
//! one [`Entry`] here, inserted atomically by `get_or_create`. The entry is
//! the per-address rendezvous point: the thread that inserts it drives
//! translation, and its transition to `Ready` publishes the symbol and its
//! extent to every other thread.

use cpu::function::Function;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use num_traits::FromPrimitive;

use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Resolution state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum EntryStatus {
    /// Inserted, but no resolution has completed yet. Also observed by
    /// threads that race a resolution still in flight; they simply resolve
    /// the address themselves and converge on the module's per-symbol locks.
    New = 0,
    /// The referenced function is defined and callable.
    Ready = 1,
    /// Resolution failed. Permanent for the lifetime of the table.
    Failed = 2,
}

/// A per-address resolution record.
#[derive(Debug)]
pub struct Entry {
    address: u32,
    status: AtomicU8,
    end_address: AtomicU32,
    function: RwLock<Option<Arc<Function>>>,
}

impl Entry {
    fn new(address: u32) -> Self {
        Self {
            address,
            status: AtomicU8::new(EntryStatus::New as u8),
            end_address: AtomicU32::new(0),
            function: RwLock::new(None),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn status(&self) -> EntryStatus {
        EntryStatus::from_u8(self.status.load(Ordering::Acquire))
            .expect("entry holds an invalid status value")
    }

    pub fn set_status(&self, status: EntryStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// End of the covered guest range (exclusive); 0 until `Ready`.
    pub fn end_address(&self) -> u32 {
        self.end_address.load(Ordering::Acquire)
    }

    pub fn function(&self) -> Option<Arc<Function>> {
        self.function.read().expect("entry function lock poisoned").clone()
    }

    /// Publishes `function` through this entry. The `Ready` status is
    /// written last so that any thread observing it also observes the
    /// function and its end address.
    pub fn set_ready(&self, function: &Arc<Function>) {
        *self.function.write().expect("entry function lock poisoned") = Some(function.clone());
        self.end_address.store(function.end_address(), Ordering::Release);
        self.status.store(EntryStatus::Ready as u8, Ordering::Release);
    }
}

/// Concurrent mapping from guest address to [`Entry`].
#[derive(Debug)]
pub struct EntryTable {
    map: DashMap<u32, Arc<Entry>>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Read-only lookup; never inserts.
    pub fn get(&self, address: u32) -> Option<Arc<Entry>> {
        self.map.get(&address).map(|entry| entry.value().clone())
    }

    /// Returns the entry for `address`, inserting a fresh one if none
    /// exists.
    ///
    /// The returned status is `New` for the inserting thread (exactly one
    /// per address); otherwise it is the entry's status at the time of the
    /// lookup. This is the single atomicity point deciding the first
    /// resolver of an address, and it never blocks on in-flight work.
    pub fn get_or_create(&self, address: u32) -> (Arc<Entry>, EntryStatus) {
        match self.map.entry(address) {
            Slot::Occupied(slot) => {
                let entry = slot.get().clone();
                let status = entry.status();
                (entry, status)
            }
            Slot::Vacant(slot) => {
                let entry = Arc::new(Entry::new(address));
                slot.insert(entry.clone());
                (entry, EntryStatus::New)
            }
        }
    }

    /// All ready functions whose `[address, end_address)` range contains
    /// `address`. Ranges may overlap (thunks and trampolines), so this can
    /// return more than one function.
    pub fn find_with_address(&self, address: u32) -> Vec<Arc<Function>> {
        let mut functions = Vec::new();
        for slot in self.map.iter() {
            let entry = slot.value();
            if entry.status() != EntryStatus::Ready {
                continue;
            }
            if address >= entry.address() && address < entry.end_address() {
                if let Some(function) = entry.function() {
                    functions.push(function);
                }
            }
        }
        functions
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpu::function::SymbolStatus;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn defined_function(address: u32, end_address: u32) -> Arc<Function> {
        let function = Arc::new(Function::guest(address));
        function.set_end_address(end_address);
        function.set_status(SymbolStatus::Defined);
        function
    }

    #[test]
    fn first_caller_creates() {
        let table = EntryTable::new();
        assert!(table.get(0x8201_0000).is_none());

        let (entry, status) = table.get_or_create(0x8201_0000);
        assert_eq!(status, EntryStatus::New);
        assert_eq!(entry.address(), 0x8201_0000);
        assert!(entry.function().is_none());

        // second caller sees the same record with its current status
        let (again, status) = table.get_or_create(0x8201_0000);
        assert_eq!(status, EntryStatus::New);
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ready_publishes_function_and_extent() {
        let table = EntryTable::new();
        let (entry, _) = table.get_or_create(0x8201_0000);

        let function = defined_function(0x8201_0000, 0x8201_0040);
        entry.set_ready(&function);

        let (entry, status) = table.get_or_create(0x8201_0000);
        assert_eq!(status, EntryStatus::Ready);
        assert_eq!(entry.end_address(), 0x8201_0040);
        assert!(Arc::ptr_eq(&entry.function().unwrap(), &function));
    }

    #[test]
    fn find_with_address_matches_half_open_ranges() {
        let table = EntryTable::new();

        let f1 = defined_function(0x8000, 0x8100);
        let f2 = defined_function(0x8040, 0x80C0);
        table.get_or_create(0x8000).0.set_ready(&f1);
        table.get_or_create(0x8040).0.set_ready(&f2);

        let mut hits: Vec<u32> = table.find_with_address(0x8050)
            .iter().map(|f| f.address()).collect();
        hits.sort();
        assert_eq!(hits, vec![0x8000, 0x8040]);

        let hits: Vec<u32> = table.find_with_address(0x80FF)
            .iter().map(|f| f.address()).collect();
        assert_eq!(hits, vec![0x8000]);

        // end addresses are exclusive
        assert!(table.find_with_address(0x8100).is_empty());
    }

    #[test]
    fn failed_entries_are_not_found() {
        let table = EntryTable::new();
        let (entry, _) = table.get_or_create(0x9000);
        entry.set_status(EntryStatus::Failed);
        assert!(table.find_with_address(0x9000).is_empty());
    }

    #[test]
    fn concurrent_inserts_yield_exactly_one_new() {
        const THREADS: usize = 16;

        let table = Arc::new(EntryTable::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let news = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS).map(|_| {
            let table = table.clone();
            let barrier = barrier.clone();
            let news = news.clone();
            thread::spawn(move || {
                barrier.wait();
                let (entry, status) = table.get_or_create(0x8201_0000);
                news.fetch_add((status == EntryStatus::New) as usize, Ordering::SeqCst);
                entry.address()
            })
        }).collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0x8201_0000);
        }
        // all threads share one record
        assert_eq!(table.len(), 1);
        // every thread may legitimately observe `New` here (none of them
        // ever marked the entry ready), but at least the inserting one did
        assert!(news.load(Ordering::SeqCst) >= 1);
    }
}

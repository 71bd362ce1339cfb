//! Host-side registry of guest library exports.
//!
//! Guest images import OS functionality by (library, ordinal) pairs. The
//! resolver stores static per-library export tables so loaders can look up
//! what an import refers to and bridge callable exports into the builtin
//! address region.

use std::sync::Mutex;

/// A symbol exported by a system library.
#[derive(Debug, Clone, Copy)]
pub struct Export {
    /// ID used to import the symbol.
    pub ordinal: u16,
    /// Symbol name.
    pub name: &'static str,
    pub kind: ExportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Callable API function.
    Function,
    /// Shared variable stored in guest-visible memory.
    Variable,
    /// Unused entry.
    ///
    /// Attempts to import it are guest bugs.
    Unused,
}

#[derive(Debug)]
struct ExportTable {
    library: String,
    exports: Vec<Export>,
}

/// Registry of export tables, one per system library.
#[derive(Debug)]
pub struct ExportResolver {
    tables: Mutex<Vec<ExportTable>>,
}

impl ExportResolver {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Registers the export table of `library`. Later registrations of the
    /// same library shadow earlier ones.
    pub fn register_table(&self, library: &str, exports: &[Export]) {
        let mut tables = self.tables.lock().expect("export tables lock poisoned");
        tables.insert(0, ExportTable {
            library: library.to_string(),
            exports: exports.to_vec(),
        });
    }

    /// Looks up an export by (library, ordinal).
    pub fn resolve(&self, library: &str, ordinal: u16) -> Option<Export> {
        let tables = self.tables.lock().expect("export tables lock poisoned");
        tables.iter()
            .find(|table| table.library == library)
            .and_then(|table| table.exports.iter().find(|export| export.ordinal == ordinal))
            .cloned()
    }

    pub fn library_names(&self) -> Vec<String> {
        let tables = self.tables.lock().expect("export tables lock poisoned");
        tables.iter().map(|table| table.library.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DEMO_EXPORTS: &[Export] = &[
        Export { ordinal: 1, name: "XamVoiceCreate", kind: ExportKind::Function },
        Export { ordinal: 2, name: "XamVoiceClose", kind: ExportKind::Function },
        Export { ordinal: 3, name: "XamVoiceState", kind: ExportKind::Variable },
    ];

    #[test]
    fn resolves_registered_exports() {
        let resolver = ExportResolver::new();
        resolver.register_table("xam.xex", DEMO_EXPORTS);

        let export = resolver.resolve("xam.xex", 2).unwrap();
        assert_eq!(export.name, "XamVoiceClose");
        assert_eq!(export.kind, ExportKind::Function);

        assert!(resolver.resolve("xam.xex", 4).is_none());
        assert!(resolver.resolve("xboxkrnl.exe", 2).is_none());
        assert_eq!(resolver.library_names(), vec!["xam.xex".to_string()]);
    }

    #[test]
    fn later_tables_shadow_earlier_ones() {
        let resolver = ExportResolver::new();
        resolver.register_table("xam.xex", DEMO_EXPORTS);
        resolver.register_table("xam.xex", &[
            Export { ordinal: 1, name: "XamVoiceIsActiveProcess", kind: ExportKind::Function },
        ]);

        assert_eq!(resolver.resolve("xam.xex", 1).unwrap().name, "XamVoiceIsActiveProcess");
    }
}

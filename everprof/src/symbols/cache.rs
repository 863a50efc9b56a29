use rustc_hash::FxHashMap;

use crate::file_info::{FileInfoId, FileInfoTable};
use crate::symbols::backend::{BackendResolution, SymbolBackend};
use crate::symbols::demangle::demangle;
use crate::symbols::symbol_map::{SymbolMap, MAX_SYMBOL_SIZE, MIN_SYMBOL_SIZE};
use crate::unwind::FrameKind;

/// One symbolized function. Entries are appended for the life of a profile
/// cycle; indices stay stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub mangled_name: Option<String>,
    pub demangled_name: String,
    pub source_path: Option<String>,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    fn push(&mut self, symbol: Symbol) -> u32 {
        let idx = self.symbols.len() as u32;
        self.symbols.push(symbol);
        idx
    }

    pub fn get(&self, idx: u32) -> &Symbol {
        &self.symbols[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Address → symbol cache over a pluggable backend, deduplicated across
/// processes by `(file id, ELF address)`.
pub struct SymbolCache<B> {
    backend: B,
    pub table: SymbolTable,
    per_file: FxHashMap<FileInfoId, SymbolMap>,
    /// mangled → demangled, looked up by `&str` so hits never allocate.
    demangle_cache: FxHashMap<String, String>,
    special_symbols: FxHashMap<&'static str, u32>,
    pid_symbols: FxHashMap<i32, u32>,
    fallback_symbols: FxHashMap<(String, u64), u32>,
    /// Cross-check every cache hit against the backend
    /// (`EVERPROF_SYMBOL_VALIDATE`).
    validate: bool,
    pub validation_mismatches: u64,
}

pub const VALIDATE_ENV_VAR: &str = "EVERPROF_SYMBOL_VALIDATE";

impl<B: SymbolBackend> SymbolCache<B> {
    pub fn new(backend: B) -> Self {
        SymbolCache {
            backend,
            table: SymbolTable::default(),
            per_file: FxHashMap::default(),
            demangle_cache: FxHashMap::default(),
            special_symbols: FxHashMap::default(),
            pid_symbols: FxHashMap::default(),
            fallback_symbols: FxHashMap::default(),
            validate: std::env::var_os(VALIDATE_ENV_VAR).is_some(),
            validation_mismatches: 0,
        }
    }

    /// Symbol indices for `elf_addr` in file `id`: inline frames innermost
    /// first, concrete frame last. Total: falls back to a DSO-level
    /// synthetic symbol when the backend has nothing.
    pub fn symbolize(
        &mut self,
        files: &FileInfoTable,
        id: FileInfoId,
        elf_addr: u64,
    ) -> Vec<u32> {
        if let Some(hit) = self
            .per_file
            .get(&id)
            .and_then(|map| map.find_closest(elf_addr))
            .map(|(_, span)| span.symbols.clone())
        {
            if self.validate {
                self.validate_hit(files, id, elf_addr, &hit);
            }
            return hit;
        }

        let resolution = files
            .get(id)
            .filter(|file_info| !file_info.errored)
            .and_then(|file_info| self.backend.resolve(file_info, elf_addr))
            .filter(|resolution| !resolution.is_empty());

        let Some(resolution) = resolution else {
            let name = files
                .get(id)
                .and_then(|fi| fi.path.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<unknown>".to_owned());
            let idx = self.dso_fallback_symbol(&name, elf_addr);
            if id.is_valid() {
                self.per_file.entry(id).or_default().insert_evicting(
                    elf_addr,
                    elf_addr + MIN_SYMBOL_SIZE,
                    vec![idx],
                );
            }
            return vec![idx];
        };

        // A span already cached for this symbol's start grows to cover the
        // new pc instead of re-interning anything, as long as the names
        // still agree.
        let start_hint = resolution.symbol_start.unwrap_or(elf_addr);
        if elf_addr <= start_hint + MAX_SYMBOL_SIZE {
            if let Some(map) = self.per_file.get_mut(&id) {
                if let Some(span) = map.span_at(start_hint) {
                    let stored = span.symbols.clone();
                    let fresh_name = resolution
                        .frames
                        .last()
                        .and_then(|frame| frame.name.as_deref())
                        .or(resolution.symbol_name.as_deref());
                    let names_match = match (stored.last(), fresh_name) {
                        (Some(&idx), Some(name)) => {
                            self.table.get(idx).mangled_name.as_deref() == Some(name)
                        }
                        _ => false,
                    };
                    if names_match {
                        map.grow_end(start_hint, elf_addr);
                        return stored;
                    }
                }
            }
        }

        let symbols = self.intern_resolution(&resolution);

        let mut start = resolution.symbol_start.unwrap_or(elf_addr);
        let mut end = match resolution.symbol_size {
            Some(size) => start + size.max(MIN_SYMBOL_SIZE),
            None => start + MIN_SYMBOL_SIZE,
        };
        // The span must cover the probe so the next lookup hits.
        if elf_addr > end {
            if elf_addr <= start + MAX_SYMBOL_SIZE {
                end = elf_addr;
            } else {
                start = elf_addr;
                end = elf_addr + MIN_SYMBOL_SIZE;
            }
        }
        self.per_file
            .entry(id)
            .or_default()
            .insert_evicting(start, end, symbols.clone());
        symbols
    }

    fn intern_resolution(&mut self, resolution: &BackendResolution) -> Vec<u32> {
        let mut symbols = Vec::with_capacity(resolution.frames.len().max(1));
        if resolution.frames.is_empty() {
            let mangled = resolution
                .symbol_name
                .clone()
                .expect("non-empty resolution");
            symbols.push(self.intern_symbol(Some(mangled), None, 0));
            return symbols;
        }
        let concrete = resolution.frames.len() - 1;
        for (i, frame) in resolution.frames.iter().enumerate() {
            let mangled = frame.name.clone().or_else(|| {
                (i == concrete)
                    .then(|| resolution.symbol_name.clone())
                    .flatten()
            });
            let idx = match mangled {
                Some(mangled) => {
                    self.intern_symbol(Some(mangled), frame.file.clone(), frame.line)
                }
                None => self.special_symbol("<anonymous>"),
            };
            symbols.push(idx);
        }
        symbols
    }

    fn intern_symbol(
        &mut self,
        mangled_name: Option<String>,
        source_path: Option<String>,
        line: u32,
    ) -> u32 {
        let demangled_name = match &mangled_name {
            Some(name) => match self.demangle_cache.get(name.as_str()) {
                Some(cached) => cached.clone(),
                None => {
                    let demangled = demangle(name);
                    self.demangle_cache.insert(name.clone(), demangled.clone());
                    demangled
                }
            },
            None => "<anonymous>".to_owned(),
        };
        self.table.push(Symbol {
            mangled_name,
            demangled_name,
            source_path,
            line,
        })
    }

    /// `<filename>+0x<elf_addr>`, so aggregation still has something to
    /// hash when symbolization comes up empty.
    pub fn dso_fallback_symbol(&mut self, dso_name: &str, elf_addr: u64) -> u32 {
        if let Some(&idx) = self
            .fallback_symbols
            .get(&(dso_name.to_owned(), elf_addr))
        {
            return idx;
        }
        let name = format!("{dso_name}+0x{elf_addr:x}");
        let idx = self.table.push(Symbol {
            mangled_name: None,
            demangled_name: name,
            source_path: None,
            line: 0,
        });
        self.fallback_symbols
            .insert((dso_name.to_owned(), elf_addr), idx);
        idx
    }

    fn special_symbol(&mut self, name: &'static str) -> u32 {
        if let Some(&idx) = self.special_symbols.get(name) {
            return idx;
        }
        let idx = self.table.push(Symbol {
            mangled_name: None,
            demangled_name: name.to_owned(),
            source_path: None,
            line: 0,
        });
        self.special_symbols.insert(name, idx);
        idx
    }

    /// The placeholder symbol for an abnormal unwind stop.
    pub fn error_symbol(&mut self, kind: FrameKind) -> u32 {
        let name = match kind {
            FrameKind::TruncatedStack => "[truncated]",
            FrameKind::UnknownDso => "[unknown_dso]",
            FrameKind::UnwindFailure => "[unwind_failure]",
            FrameKind::IncompleteStack => "[incomplete]",
            FrameKind::Regular | FrameKind::ProcessRoot => "[unexpected]",
        };
        self.special_symbol(name)
    }

    /// The synthetic per-process base frame symbol.
    pub fn pid_symbol(&mut self, pid: i32) -> u32 {
        if let Some(&idx) = self.pid_symbols.get(&pid) {
            return idx;
        }
        let idx = self.table.push(Symbol {
            mangled_name: None,
            demangled_name: format!("pid_{pid}"),
            source_path: None,
            line: 0,
        });
        self.pid_symbols.insert(pid, idx);
        idx
    }

    /// The placeholder for kernel frames; the call chain is not recovered.
    pub fn kernel_symbol(&mut self) -> u32 {
        self.special_symbol("[kernel]")
    }

    fn validate_hit(
        &mut self,
        files: &FileInfoTable,
        id: FileInfoId,
        elf_addr: u64,
        cached: &[u32],
    ) {
        let Some(file_info) = files.get(id) else {
            return;
        };
        let Some(resolution) = self.backend.resolve(file_info, elf_addr) else {
            return;
        };
        let fresh_name = resolution
            .frames
            .last()
            .and_then(|frame| frame.name.clone())
            .or(resolution.symbol_name);
        let (Some(fresh), Some(&cached_idx)) = (fresh_name, cached.last()) else {
            return;
        };
        let cached_symbol = self.table.get(cached_idx);
        let fresh_demangled = demangle(&fresh);
        if cached_symbol.demangled_name != fresh_demangled {
            self.validation_mismatches += 1;
            log::warn!(
                "symbol cache mismatch at {id:?}+{elf_addr:#x}: cached {}, backend {}",
                cached_symbol.demangled_name,
                fresh_demangled
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::backend::BackendFrame;
    use std::fs::File;
    use std::io::Write;

    #[derive(Default)]
    struct ScriptedBackend {
        by_addr: FxHashMap<u64, BackendResolution>,
        calls: usize,
    }

    impl SymbolBackend for ScriptedBackend {
        fn resolve(
            &mut self,
            _file_info: &crate::file_info::FileInfo,
            elf_addr: u64,
        ) -> Option<BackendResolution> {
            self.calls += 1;
            self.by_addr.get(&elf_addr).cloned()
        }
    }

    fn table_with_one_file() -> (FileInfoTable, FileInfoId) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libtest.so");
        File::create(&path)
            .unwrap()
            .write_all(b"placeholder")
            .unwrap();
        let mut table = FileInfoTable::new();
        let dso = crate::dso::Dso {
            pid: std::process::id() as i32,
            start: 0,
            end: 0x1000,
            page_offset: 0,
            inode: 1,
            path: path.to_str().unwrap().to_owned(),
            kind: crate::dso::DsoKind::Standard,
            executable: true,
            file_info_id: FileInfoId::UNSET,
        };
        let id = table.resolve(&dso);
        // Leak the directory so the open fd's path stays alive for the test.
        std::mem::forget(dir);
        (table, id)
    }

    fn concrete(name: &str, file: &str, line: u32) -> BackendFrame {
        BackendFrame {
            name: Some(name.to_owned()),
            file: Some(file.to_owned()),
            line,
        }
    }

    #[test]
    fn symbolize_is_idempotent_and_caches() {
        let (files, id) = table_with_one_file();
        let mut backend = ScriptedBackend::default();
        backend.by_addr.insert(
            0x400,
            BackendResolution {
                frames: vec![concrete("_Z3fooi", "foo.cc", 12)],
                symbol_start: Some(0x400),
                symbol_size: Some(0x40),
                symbol_name: Some("_Z3fooi".to_owned()),
            },
        );
        let mut cache = SymbolCache::new(backend);

        let first = cache.symbolize(&files, id, 0x400);
        assert_eq!(first.len(), 1);
        let symbol = cache.table.get(first[0]);
        assert_eq!(symbol.demangled_name, "foo(int)");
        assert_eq!(symbol.source_path.as_deref(), Some("foo.cc"));
        assert_eq!(symbol.line, 12);

        // Same index on every subsequent call, without a backend round trip.
        let second = cache.symbolize(&files, id, 0x400);
        assert_eq!(first, second);
        let third = cache.symbolize(&files, id, 0x420);
        assert_eq!(first, third);
    }

    #[test]
    fn inline_frames_expand_innermost_first() {
        let (files, id) = table_with_one_file();
        let mut backend = ScriptedBackend::default();
        backend.by_addr.insert(
            0x500,
            BackendResolution {
                frames: vec![
                    concrete("_ZN5inner4leafE", "inner.rs", 3),
                    concrete("_ZN5outer4siteE", "outer.rs", 44),
                ],
                symbol_start: Some(0x500),
                symbol_size: Some(0x10),
                symbol_name: Some("_ZN5outer4siteE".to_owned()),
            },
        );
        let mut cache = SymbolCache::new(backend);

        let symbols = cache.symbolize(&files, id, 0x500);
        assert_eq!(symbols.len(), 2);
        assert_eq!(cache.table.get(symbols[0]).demangled_name, "inner::leaf");
        assert_eq!(cache.table.get(symbols[1]).demangled_name, "outer::site");
    }

    #[test]
    fn empty_resolution_falls_back_to_dso_symbol() {
        let (files, id) = table_with_one_file();
        let mut cache = SymbolCache::new(ScriptedBackend::default());

        let symbols = cache.symbolize(&files, id, 0xabc);
        assert_eq!(symbols.len(), 1);
        assert_eq!(
            cache.table.get(symbols[0]).demangled_name,
            "libtest.so+0xabc"
        );
        // Cached as a span too.
        assert_eq!(cache.symbolize(&files, id, 0xabc), symbols);
    }

    #[test]
    fn zero_sized_symbols_grow_on_demand() {
        let (files, id) = table_with_one_file();
        let mut backend = ScriptedBackend::default();
        for addr in [0x600u64, 0x640] {
            backend.by_addr.insert(
                addr,
                BackendResolution {
                    frames: vec![concrete("_Z3bazv", "baz.cc", 1)],
                    symbol_start: Some(0x600),
                    symbol_size: None,
                    symbol_name: Some("_Z3bazv".to_owned()),
                },
            );
        }
        let mut cache = SymbolCache::new(backend);

        let first = cache.symbolize(&files, id, 0x600);
        // 0x640 is past the provisional end; the span regrows to cover it.
        let again = cache.symbolize(&files, id, 0x640);
        assert_eq!(first, again);
        // Everything in between now hits.
        assert_eq!(cache.symbolize(&files, id, 0x620), first);
    }

    #[test]
    fn special_symbols_are_stable() {
        let mut cache = SymbolCache::new(ScriptedBackend::default());
        let a = cache.error_symbol(FrameKind::UnknownDso);
        let b = cache.error_symbol(FrameKind::UnknownDso);
        assert_eq!(a, b);
        assert_eq!(cache.table.get(a).demangled_name, "[unknown_dso]");

        let pid = cache.pid_symbol(42);
        assert_eq!(cache.table.get(pid).demangled_name, "pid_42");
        assert_eq!(cache.pid_symbol(42), pid);
        assert_ne!(cache.pid_symbol(43), pid);
    }
}

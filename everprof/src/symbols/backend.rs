//! The backend symbolizer: ELF address → function names, source location,
//! inline frames. One implementation over addr2line's DWARF reader with an
//! ELF symbol-table fallback; tests substitute their own.

use object::{Object, ObjectSymbol};
use rustc_hash::FxHashMap;

use crate::file_info::{FileInfo, FileInfoId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendFrame {
    /// Raw (mangled) function name.
    pub name: Option<String>,
    pub file: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendResolution {
    /// Inline frames innermost first; the concrete frame is last. May be
    /// empty when only the symbol table knew the address.
    pub frames: Vec<BackendFrame>,
    /// The containing ELF symbol, when the symbol table has one.
    pub symbol_start: Option<u64>,
    pub symbol_size: Option<u64>,
    pub symbol_name: Option<String>,
}

impl BackendResolution {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.symbol_name.is_none()
    }
}

pub trait SymbolBackend {
    fn resolve(&mut self, file_info: &FileInfo, elf_addr: u64) -> Option<BackendResolution>;
}

struct SymtabEntry {
    addr: u64,
    size: u64,
    name: String,
}

struct LoadedFile {
    loader: addr2line::Loader,
    /// Function symbols sorted by address.
    symtab: Vec<SymtabEntry>,
}

/// DWARF-based symbolization with debug symbols and inline frames on.
#[derive(Default)]
pub struct Addr2LineBackend {
    files: FxHashMap<FileInfoId, Option<LoadedFile>>,
}

impl Addr2LineBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(file_info: &FileInfo) -> Option<LoadedFile> {
        let loader = addr2line::Loader::new(&file_info.path).ok()?;

        let mmap = unsafe { memmap2::MmapOptions::new().map(&file_info.file) }.ok()?;
        let object = object::File::parse(&mmap[..]).ok()?;
        let mut symtab: Vec<SymtabEntry> = object
            .symbols()
            .chain(object.dynamic_symbols())
            .filter(|symbol| symbol.is_definition())
            .filter_map(|symbol| {
                Some(SymtabEntry {
                    addr: symbol.address(),
                    size: symbol.size(),
                    name: symbol.name().ok()?.to_owned(),
                })
            })
            .collect();
        symtab.sort_by_key(|entry| entry.addr);
        symtab.dedup_by_key(|entry| entry.addr);

        Some(LoadedFile { loader, symtab })
    }
}

impl LoadedFile {
    fn symtab_lookup(&self, elf_addr: u64) -> Option<&SymtabEntry> {
        let index = self
            .symtab
            .partition_point(|entry| entry.addr <= elf_addr)
            .checked_sub(1)?;
        let entry = &self.symtab[index];
        // Zero-sized symbols match provisionally; the cache bounds their
        // reach through its own span growth rules.
        if entry.size > 0 && elf_addr >= entry.addr + entry.size {
            return None;
        }
        Some(entry)
    }
}

impl SymbolBackend for Addr2LineBackend {
    fn resolve(&mut self, file_info: &FileInfo, elf_addr: u64) -> Option<BackendResolution> {
        let loaded = self
            .files
            .entry(file_info.id)
            .or_insert_with(|| Self::load(file_info))
            .as_ref()?;

        let mut resolution = BackendResolution::default();

        if let Ok(mut frames) = loaded.loader.find_frames(elf_addr) {
            while let Ok(Some(frame)) = frames.next() {
                let name = frame
                    .function
                    .as_ref()
                    .and_then(|f| f.raw_name().ok())
                    .map(|name| name.into_owned());
                let (file, line) = match &frame.location {
                    Some(location) => (
                        location.file.map(ToOwned::to_owned),
                        location.line.unwrap_or(0),
                    ),
                    None => (None, 0),
                };
                resolution.frames.push(BackendFrame { name, file, line });
            }
        }

        if let Some(entry) = loaded.symtab_lookup(elf_addr) {
            resolution.symbol_start = Some(entry.addr);
            resolution.symbol_size = (entry.size > 0).then_some(entry.size);
            resolution.symbol_name = Some(entry.name.clone());
        } else if resolution.frames.is_empty() {
            resolution.symbol_name = loaded
                .loader
                .find_symbol(elf_addr)
                .map(ToOwned::to_owned);
        }

        if resolution.is_empty() {
            None
        } else {
            Some(resolution)
        }
    }
}

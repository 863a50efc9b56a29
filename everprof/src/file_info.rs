use std::fs::File;
use std::path::PathBuf;

use rustc_hash::FxHashMap;

use crate::dso::Dso;

/// Stable identifier for one unique ELF file seen during the run.
///
/// `0` means "error", `1` is reserved for the injected profiling library,
/// `-1` means "unset"; real ids start at 2 and are never reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileInfoId(pub i64);

impl FileInfoId {
    pub const ERROR: FileInfoId = FileInfoId(0);
    pub const PROFILER_LIB: FileInfoId = FileInfoId(1);
    pub const UNSET: FileInfoId = FileInfoId(-1);
    const FIRST_VALID: i64 = 2;

    pub fn is_valid(self) -> bool {
        self.0 >= Self::FIRST_VALID
    }
}

#[derive(Debug)]
pub struct FileInfo {
    pub id: FileInfoId,
    pub path: PathBuf,
    pub size: u64,
    pub inode: u64,
    pub errored: bool,
    /// Open descriptor, held for the lifetime of the run.
    pub file: File,
}

/// Content-addressed interning of ELF files: each unique
/// `(inode, page offset, mapping size)` is opened once and keeps its id for
/// the whole run.
#[derive(Default)]
pub struct FileInfoTable {
    by_key: FxHashMap<(u64, u64, u64), FileInfoId>,
    entries: Vec<FileInfo>,
}

impl FileInfoTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_for(dso: &Dso) -> (u64, u64, u64) {
        (dso.inode, dso.page_offset, dso.end - dso.start)
    }

    /// Intern the file backing `dso`. Returns [`FileInfoId::ERROR`] when the
    /// file is gone or unreadable; the failure is sticky.
    pub fn resolve(&mut self, dso: &Dso) -> FileInfoId {
        let key = Self::key_for(dso);
        if let Some(&id) = self.by_key.get(&key) {
            if let Some(info) = self.get(id) {
                if info.errored {
                    return FileInfoId::ERROR;
                }
            }
            return id;
        }

        let id = match self.open_dso_file(dso) {
            Some((file, path, size)) => {
                let id = FileInfoId(FileInfoId::FIRST_VALID + self.entries.len() as i64);
                self.entries.push(FileInfo {
                    id,
                    path,
                    size,
                    inode: dso.inode,
                    errored: false,
                    file,
                });
                id
            }
            None => {
                log::debug!("could not open {} for pid {}", dso.path, dso.pid);
                FileInfoId::ERROR
            }
        };
        self.by_key.insert(key, id);
        id
    }

    /// Open the file, preferring the target's mount namespace so files in
    /// containers stay reachable.
    fn open_dso_file(&self, dso: &Dso) -> Option<(File, PathBuf, u64)> {
        let in_target_root = PathBuf::from(format!("/proc/{}/root{}", dso.pid, dso.path));
        let candidates = [in_target_root, PathBuf::from(&dso.path)];
        for path in candidates {
            if let Ok(file) = File::open(&path) {
                if let Ok(metadata) = file.metadata() {
                    return Some((file, path, metadata.len()));
                }
            }
        }
        None
    }

    pub fn get(&self, id: FileInfoId) -> Option<&FileInfo> {
        if !id.is_valid() {
            return None;
        }
        self.entries.get((id.0 - FileInfoId::FIRST_VALID) as usize)
    }

    /// Sticky failure: every later lookup for this file short-circuits to
    /// the DSO-level synthetic symbol.
    pub fn mark_errored(&mut self, id: FileInfoId) {
        if !id.is_valid() {
            return;
        }
        if let Some(info) = self
            .entries
            .get_mut((id.0 - FileInfoId::FIRST_VALID) as usize)
        {
            info.errored = true;
        }
    }

    pub fn is_errored(&self, id: FileInfoId) -> bool {
        match self.get(id) {
            Some(info) => info.errored,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dso::DsoKind;
    use std::io::Write;

    fn dso_for(path: &str, inode: u64) -> Dso {
        Dso {
            pid: std::process::id() as i32,
            start: 0x1000,
            end: 0x2000,
            page_offset: 0,
            inode,
            path: path.to_owned(),
            kind: DsoKind::Standard,
            executable: true,
            file_info_id: FileInfoId::UNSET,
        }
    }

    #[test]
    fn interning_shares_ids_and_failures_are_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("libsomething.so");
        let mut f = File::create(&file_path).unwrap();
        f.write_all(b"not really elf but openable").unwrap();

        let mut table = FileInfoTable::new();
        let dso = dso_for(file_path.to_str().unwrap(), 42);
        let id = table.resolve(&dso);
        assert!(id.is_valid());
        assert_eq!(table.resolve(&dso), id);
        assert_eq!(table.get(id).unwrap().inode, 42);

        // A different mapping key gets a different id, even for the same path.
        let mut other = dso_for(file_path.to_str().unwrap(), 42);
        other.page_offset = 0x1000;
        let other_id = table.resolve(&other);
        assert!(other_id.is_valid());
        assert_ne!(other_id, id);

        // Missing files intern the error sentinel.
        let missing = dso_for("/nonexistent/libgone.so", 77);
        assert_eq!(table.resolve(&missing), FileInfoId::ERROR);
        assert_eq!(table.resolve(&missing), FileInfoId::ERROR);

        // Marking errored later is sticky.
        table.mark_errored(id);
        assert_eq!(table.resolve(&dso), FileInfoId::ERROR);
        assert!(table.is_errored(id));
    }

    #[test]
    fn sentinel_ids() {
        assert!(!FileInfoId::ERROR.is_valid());
        assert!(!FileInfoId::PROFILER_LIB.is_valid());
        assert!(!FileInfoId::UNSET.is_valid());
        assert!(FileInfoId(2).is_valid());
    }
}

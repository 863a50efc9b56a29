use crate::file_info::FileInfoId;

/// What a mapped region is, derived from its path in `/proc/<pid>/maps` or
/// the filename of an mmap record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsoKind {
    Standard,
    Vdso,
    Vsyscall,
    Stack,
    Heap,
    Anon,
    Socket,
    Undef,
}

impl DsoKind {
    pub fn from_path(path: &str) -> DsoKind {
        if path.is_empty()
            || path == "//anon"
            || path.starts_with("anon_inode:")
            || path.starts_with("/dev/zero")
            || path.starts_with("/dev/null")
            || path.ends_with(".jsa")
        {
            return DsoKind::Anon;
        }
        if let Some(rest) = path.strip_prefix('[') {
            if rest.starts_with("vdso]") {
                return DsoKind::Vdso;
            }
            if rest.starts_with("vsyscall]") {
                return DsoKind::Vsyscall;
            }
            if rest.starts_with("stack]") {
                return DsoKind::Stack;
            }
            if rest.starts_with("heap]") {
                return DsoKind::Heap;
            }
            return DsoKind::Undef;
        }
        if path.starts_with("socket:") {
            return DsoKind::Socket;
        }
        DsoKind::Standard
    }

    /// Only file-backed code regions carry unwind information.
    pub fn is_unwindable(self) -> bool {
        matches!(self, DsoKind::Standard | DsoKind::Vdso | DsoKind::Vsyscall)
    }
}

/// One contiguously mapped region of a process's address space.
/// Half-open interval `[start, end)`, totally ordered by `start` within a
/// PID; two DSOs of the same PID never overlap.
#[derive(Debug, Clone)]
pub struct Dso {
    pub pid: i32,
    pub start: u64,
    pub end: u64,
    pub page_offset: u64,
    pub inode: u64,
    pub path: String,
    pub kind: DsoKind,
    pub executable: bool,
    pub file_info_id: FileInfoId,
}

impl Dso {
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    pub fn intersects(&self, other: &Dso) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Byte-identical for eviction purposes: same start, page offset, kind,
    /// executable bit, and (for file-backed regions) path. Such a pair is
    /// merged by extending the end instead of replacing.
    pub fn is_same_mapping(&self, other: &Dso) -> bool {
        self.start == other.start
            && self.page_offset == other.page_offset
            && self.kind == other.kind
            && self.executable == other.executable
            && (self.kind != DsoKind::Standard || self.path == other.path)
    }

    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(pos) => &self.path[pos + 1..],
            None => &self.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(DsoKind::from_path("/usr/lib/libc.so.6"), DsoKind::Standard);
        assert_eq!(DsoKind::from_path("[vdso]"), DsoKind::Vdso);
        assert_eq!(DsoKind::from_path("[vdso]extra"), DsoKind::Vdso);
        assert_eq!(DsoKind::from_path("[vsyscall]"), DsoKind::Vsyscall);
        assert_eq!(DsoKind::from_path("[stack]"), DsoKind::Stack);
        assert_eq!(DsoKind::from_path("[heap]"), DsoKind::Heap);
        assert_eq!(DsoKind::from_path("[unexpected]"), DsoKind::Undef);
        assert_eq!(DsoKind::from_path(""), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("//anon"), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("anon_inode:[perf_event]"), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("/dev/zero (deleted)"), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("/dev/null"), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("/opt/app/classes.jsa"), DsoKind::Anon);
        assert_eq!(DsoKind::from_path("socket:[12345]"), DsoKind::Socket);
    }

    #[test]
    fn unwindable_kinds() {
        assert!(DsoKind::Standard.is_unwindable());
        assert!(DsoKind::Vdso.is_unwindable());
        assert!(DsoKind::Vsyscall.is_unwindable());
        assert!(!DsoKind::Anon.is_unwindable());
        assert!(!DsoKind::Stack.is_unwindable());
        assert!(!DsoKind::Heap.is_unwindable());
    }
}

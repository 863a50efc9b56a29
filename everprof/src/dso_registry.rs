use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::dso::{Dso, DsoKind};
use crate::proc_maps;

/// Re-reads of `/proc/<pid>/maps` allowed per PID, to cap the cost of
/// lookups on pathological mapping churn.
pub const MAX_BACKPOPULATES_PER_PID: u32 = 10;

/// Per-PID sorted index of mapped regions.
#[derive(Default)]
pub struct DsoRegistry {
    by_pid: FxHashMap<i32, BTreeMap<u64, Dso>>,
    backpopulate_budget: FxHashMap<i32, u32>,
}

impl DsoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, pid: i32, pc: u64) -> Option<&Dso> {
        let map = self.by_pid.get(&pid)?;
        let (_, dso) = map.range(..=pc).next_back()?;
        dso.contains(pc).then_some(dso)
    }

    pub fn find_mut(&mut self, pid: i32, pc: u64) -> Option<&mut Dso> {
        let map = self.by_pid.get_mut(&pid)?;
        let (_, dso) = map.range_mut(..=pc).next_back()?;
        dso.contains(pc).then_some(dso)
    }

    /// Lookup with a lazy re-read of `/proc/<pid>/maps` on miss, since perf
    /// only reports mappings created after attach.
    pub fn find_or_backpopulate(&mut self, pid: i32, pc: u64) -> Option<&mut Dso> {
        if self.find(pid, pc).is_none() {
            self.backpopulate(pid);
        }
        self.find_mut(pid, pc)
    }

    /// Insert, evicting every existing DSO of the same PID that intersects.
    /// A byte-identical region only has its end extended.
    pub fn insert_evicting(&mut self, dso: Dso) {
        let map = self.by_pid.entry(dso.pid).or_default();

        let intersecting: Vec<u64> = map
            .range(..dso.end)
            .rev()
            .take_while(|(_, existing)| existing.end > dso.start)
            .map(|(&start, _)| start)
            .collect();

        let mut extended = false;
        for start in &intersecting {
            let existing = map.get_mut(start).expect("collected key");
            if !extended && existing.is_same_mapping(&dso) {
                existing.end = existing.end.max(dso.end);
                extended = true;
            } else {
                map.remove(start);
            }
        }
        if !extended {
            map.insert(dso.start, dso);
        }
    }

    /// Read `/proc/<pid>/maps` and insert every readable line. Bounded per
    /// PID; returns the number of regions inserted.
    pub fn backpopulate(&mut self, pid: i32) -> usize {
        let budget = self
            .backpopulate_budget
            .entry(pid)
            .or_insert(MAX_BACKPOPULATES_PER_PID);
        if *budget == 0 {
            return 0;
        }
        *budget -= 1;

        let Ok(maps) = std::fs::read_to_string(format!("/proc/{pid}/maps")) else {
            return 0;
        };
        let dsos = proc_maps::parse(pid, &maps);
        let inserted = dsos.len();
        for dso in dsos {
            self.insert_evicting(dso);
        }
        inserted
    }

    pub fn erase_pid(&mut self, pid: i32) {
        self.by_pid.remove(&pid);
        self.backpopulate_budget.remove(&pid);
    }

    /// The mapping used for the synthetic per-process base frame.
    pub fn first_executable_standard(&self, pid: i32) -> Option<&Dso> {
        self.by_pid
            .get(&pid)?
            .values()
            .find(|dso| dso.kind == DsoKind::Standard && dso.executable)
    }

    pub fn pids(&self) -> impl Iterator<Item = i32> + '_ {
        self.by_pid.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::FileInfoId;

    fn dso(pid: i32, start: u64, end: u64, path: &str) -> Dso {
        Dso {
            pid,
            start,
            end,
            page_offset: 0,
            inode: 1,
            path: path.to_owned(),
            kind: DsoKind::from_path(path),
            executable: true,
            file_info_id: FileInfoId::UNSET,
        }
    }

    #[test]
    fn find_respects_bounds() {
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(dso(1, 0x1000, 0x2000, "/a"));

        assert!(registry.find(1, 0xfff).is_none());
        assert_eq!(registry.find(1, 0x1000).unwrap().path, "/a");
        assert_eq!(registry.find(1, 0x1fff).unwrap().path, "/a");
        assert!(registry.find(1, 0x2000).is_none());
        assert!(registry.find(2, 0x1000).is_none());
    }

    #[test]
    fn intersecting_insert_evicts() {
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(dso(1, 0x1000, 0x2000, "/a"));
        registry.insert_evicting(dso(1, 0x1800, 0x2800, "/b"));

        // The old region is gone entirely, not truncated.
        assert!(registry.find(1, 0x1500).is_none());
        assert_eq!(registry.find(1, 0x2000).unwrap().path, "/b");
        assert_eq!(registry.find(1, 0x1800).unwrap().path, "/b");
    }

    #[test]
    fn identical_mapping_extends_instead_of_replacing() {
        let mut registry = DsoRegistry::new();
        let mut first = dso(1, 0x1000, 0x2000, "/a");
        first.file_info_id = FileInfoId(5);
        registry.insert_evicting(first);
        // perf delivers larger regions than /proc/maps for the same mapping.
        registry.insert_evicting(dso(1, 0x1000, 0x3000, "/a"));

        let found = registry.find(1, 0x2800).unwrap();
        assert_eq!(found.path, "/a");
        assert_eq!(found.end, 0x3000);
        // The union kept the original entry and its resolved file.
        assert_eq!(found.file_info_id, FileInfoId(5));
    }

    #[test]
    fn eviction_removes_multiple_overlaps() {
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(dso(1, 0x1000, 0x2000, "/a"));
        registry.insert_evicting(dso(1, 0x2000, 0x3000, "/b"));
        registry.insert_evicting(dso(1, 0x3000, 0x4000, "/c"));
        registry.insert_evicting(dso(1, 0x1800, 0x3800, "/big"));

        assert!(registry.find(1, 0x1000).is_none());
        assert_eq!(registry.find(1, 0x1800).unwrap().path, "/big");
        assert_eq!(registry.find(1, 0x3700).unwrap().path, "/big");
        assert!(registry.find(1, 0x3800).is_none());
    }

    #[test]
    fn pids_are_isolated() {
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(dso(1, 0x1000, 0x2000, "/a"));
        registry.insert_evicting(dso(2, 0x1000, 0x2000, "/b"));
        registry.erase_pid(1);

        assert!(registry.find(1, 0x1500).is_none());
        assert_eq!(registry.find(2, 0x1500).unwrap().path, "/b");
    }

    #[test]
    fn miss_backpopulates_from_proc_maps() {
        let mut registry = DsoRegistry::new();
        let pid = std::process::id() as i32;
        let pc = miss_backpopulates_from_proc_maps as usize as u64;

        let dso = registry
            .find_or_backpopulate(pid, pc)
            .expect("own text mapping");
        assert_eq!(dso.kind, DsoKind::Standard);
        assert!(dso.executable);
        assert!(dso.contains(pc));
    }

    #[test]
    fn base_frame_mapping_is_first_executable_standard() {
        let mut registry = DsoRegistry::new();
        registry.insert_evicting(dso(1, 0x500, 0x600, "[heap]"));
        let mut lib = dso(1, 0x1000, 0x2000, "/usr/bin/app");
        lib.executable = true;
        registry.insert_evicting(lib);
        registry.insert_evicting(dso(1, 0x3000, 0x4000, "/usr/lib/libc.so"));

        assert_eq!(
            registry.first_executable_standard(1).unwrap().path,
            "/usr/bin/app"
        );
    }
}

use framehop::Unwinder;
use rustc_hash::FxHashMap;

use crate::file_info::FileInfoId;
use crate::module::ModuleInfo;

/// Per-PID unwinding context: the backend unwinder with its registered
/// modules, plus our own module records keyed by file id.
pub struct Process<U> {
    pub pid: i32,
    pub name: Option<String>,
    pub unwinder: U,
    pub modules: FxHashMap<FileInfoId, ModuleInfo>,
    /// Export cycle in which this PID last produced an event.
    pub last_seen_cycle: u64,
}

impl<U: Default> Process<U> {
    fn new(pid: i32, cycle: u64) -> Self {
        Process {
            pid,
            name: None,
            unwinder: U::default(),
            modules: FxHashMap::default(),
            last_seen_cycle: cycle,
        }
    }
}

pub struct Processes<U> {
    by_pid: FxHashMap<i32, Process<U>>,
}

impl<U: Unwinder + Default> Processes<U> {
    pub fn new() -> Self {
        Processes {
            by_pid: FxHashMap::default(),
        }
    }

    pub fn get_by_pid(&mut self, pid: i32, cycle: u64) -> &mut Process<U> {
        let process = self
            .by_pid
            .entry(pid)
            .or_insert_with(|| Process::new(pid, cycle));
        process.last_seen_cycle = cycle;
        process
    }

    pub fn get(&self, pid: i32) -> Option<&Process<U>> {
        self.by_pid.get(&pid)
    }

    pub fn set_name(&mut self, pid: i32, name: String, cycle: u64) {
        self.get_by_pid(pid, cycle).name = Some(name);
    }

    pub fn remove(&mut self, pid: i32) {
        self.by_pid.remove(&pid);
    }

    /// Drop contexts for PIDs that stayed silent for a full export cycle.
    pub fn retire_idle(&mut self, current_cycle: u64) -> Vec<i32> {
        let idle: Vec<i32> = self
            .by_pid
            .iter()
            .filter(|(_, p)| p.last_seen_cycle + 1 < current_cycle)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in &idle {
            self.by_pid.remove(pid);
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}

impl<U: Unwinder + Default> Default for Processes<U> {
    fn default() -> Self {
        Self::new()
    }
}

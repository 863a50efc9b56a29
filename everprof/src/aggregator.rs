//! Stack aggregation into pprof profiles.
//!
//! One profile per export cycle. Inserting a symbolized stack costs one hash
//! lookup per table (string, function, location, sample) and allocates only
//! for entries never seen this cycle. The pprof tables reset at flush;
//! live-heap state and the mapping catalog persist for the whole run.

use std::hash::{Hash, Hasher};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use prost::Message;
use rustc_hash::{FxHashMap, FxHasher};

use crate::file_info::FileInfoId;
use crate::pprof;
use crate::symbols::SymbolTable;

/// Live allocations tracked per profile before the address map is dropped
/// and restarted.
pub const MAX_TRACKED_ALLOCATIONS: usize = 1 << 19;

/// The four profile-wide label values attached to every sample, plus a
/// numeric `pid` label added per sample.
#[derive(Debug, Clone)]
pub struct ProfileLabels {
    pub service: String,
    pub environment: String,
    pub service_version: String,
    pub runtime: String,
}

/// What one watcher's values mean, pprof-wise.
#[derive(Debug, Clone)]
pub struct ValueTypeSpec {
    pub type_name: &'static str,
    pub unit: &'static str,
    pub period: u64,
}

/// One frame ready for aggregation. Mappings are referenced by the stable
/// file id, not by this cycle's pprof mapping id.
pub struct LocationFrame<'a> {
    pub file_info_id: FileInfoId,
    pub address: u64,
    pub symbols: &'a [u32],
}

#[derive(Clone)]
struct OwnedFrame {
    file_info_id: FileInfoId,
    address: u64,
    symbols: Vec<u32>,
}

/// Everything needed to recreate a pprof mapping entry in a later cycle.
#[derive(Clone)]
struct MappingMeta {
    memory_start: u64,
    memory_limit: u64,
    file_offset: u64,
    filename: String,
    build_id: Option<String>,
}

#[derive(PartialEq, Eq, Hash)]
struct SampleKey {
    locations: Vec<u64>,
    pid: i32,
}

#[derive(Default)]
struct ProfileTables {
    strings: Vec<String>,
    string_index: FxHashMap<String, i64>,
    functions: Vec<pprof::Function>,
    function_index: FxHashMap<(i64, i64, i64), u64>,
    locations: Vec<pprof::Location>,
    location_index: FxHashMap<(i64, u64), u64>,
    mappings: Vec<pprof::Mapping>,
    mapping_index: FxHashMap<i64, u64>,
    samples: Vec<pprof::Sample>,
    sample_index: FxHashMap<SampleKey, usize>,
}

impl ProfileTables {
    fn new() -> Self {
        let mut tables = ProfileTables::default();
        tables.strings.push(String::new());
        tables.string_index.insert(String::new(), 0);
        tables
    }

    fn string(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as i64;
        self.strings.push(s.to_owned());
        self.string_index.insert(s.to_owned(), idx);
        idx
    }

    fn mapping(&mut self, file_key: i64, meta: &MappingMeta) -> u64 {
        if let Some(&id) = self.mapping_index.get(&file_key) {
            return id;
        }
        let filename = self.string(&meta.filename);
        let build_id = match &meta.build_id {
            Some(hex) => self.string(hex),
            None => 0,
        };
        let id = self.mappings.len() as u64 + 1;
        self.mappings.push(pprof::Mapping {
            id,
            memory_start: meta.memory_start,
            memory_limit: meta.memory_limit,
            file_offset: meta.file_offset,
            filename,
            build_id,
            has_functions: true,
            has_filenames: false,
            has_line_numbers: false,
            has_inline_frames: true,
        });
        self.mapping_index.insert(file_key, id);
        id
    }

    fn function(&mut self, table: &SymbolTable, symbol_idx: u32) -> u64 {
        let symbol = table.get(symbol_idx);
        let name = self.string(&symbol.demangled_name);
        let system_name = match &symbol.mangled_name {
            Some(mangled) => self.string(mangled),
            None => name,
        };
        let filename = match &symbol.source_path {
            Some(path) => self.string(path),
            None => 0,
        };
        if let Some(&id) = self.function_index.get(&(name, system_name, filename)) {
            return id;
        }
        let id = self.functions.len() as u64 + 1;
        self.functions.push(pprof::Function {
            id,
            name,
            system_name,
            filename,
            start_line: 0,
        });
        self.function_index.insert((name, system_name, filename), id);
        id
    }

    fn location(
        &mut self,
        table: &SymbolTable,
        catalog: &FxHashMap<i64, MappingMeta>,
        file_key: i64,
        address: u64,
        symbols: &[u32],
    ) -> u64 {
        if let Some(&id) = self.location_index.get(&(file_key, address)) {
            return id;
        }
        let mapping_id = match catalog.get(&file_key) {
            Some(meta) => self.mapping(file_key, meta),
            None => 0,
        };
        let line: Vec<pprof::Line> = symbols
            .iter()
            .map(|&symbol_idx| pprof::Line {
                function_id: self.function(table, symbol_idx),
                line: table.get(symbol_idx).line as i64,
            })
            .collect();
        let id = self.locations.len() as u64 + 1;
        self.locations.push(pprof::Location {
            id,
            mapping_id,
            address,
            line,
            is_folded: false,
        });
        self.location_index.insert((file_key, address), id);
        id
    }
}

struct LiveStack {
    pid: i32,
    frames: Vec<OwnedFrame>,
    live_bytes: i64,
    allocation_count: i64,
}

/// Live-heap tracking: address → owning stack, so a later deallocation
/// decrements the live count for exactly one stack.
#[derive(Default)]
struct LiveHeap {
    addresses: FxHashMap<(i32, u64), (u64, u64)>,
    stacks: FxHashMap<u64, LiveStack>,
}

impl LiveHeap {
    fn clear_pid(&mut self, pid: i32) {
        self.addresses.retain(|(entry_pid, _), _| *entry_pid != pid);
        self.stacks.retain(|_, stack| stack.pid != pid);
    }
}

pub struct Aggregator {
    labels: ProfileLabels,
    value_types: Vec<ValueTypeSpec>,
    tables: ProfileTables,
    mapping_catalog: FxHashMap<i64, MappingMeta>,
    live: LiveHeap,
    lost_events: u64,
    cycle_start: Instant,
}

impl Aggregator {
    pub fn new(labels: ProfileLabels, value_types: Vec<ValueTypeSpec>) -> Self {
        Aggregator {
            labels,
            value_types,
            tables: ProfileTables::new(),
            mapping_catalog: FxHashMap::default(),
            live: LiveHeap::default(),
            lost_events: 0,
            cycle_start: Instant::now(),
        }
    }

    /// Record the mapping metadata for a file once per run; every cycle's
    /// profile re-creates its pprof mapping entry from this catalog.
    pub fn register_mapping(
        &mut self,
        file_info_id: FileInfoId,
        memory_start: u64,
        memory_limit: u64,
        file_offset: u64,
        filename: &str,
        build_id: Option<&str>,
    ) {
        self.mapping_catalog
            .entry(file_info_id.0)
            .or_insert_with(|| MappingMeta {
                memory_start,
                memory_limit,
                file_offset,
                filename: filename.to_owned(),
                build_id: build_id.map(ToOwned::to_owned),
            });
    }

    pub fn has_mapping(&self, file_info_id: FileInfoId) -> bool {
        self.mapping_catalog.contains_key(&file_info_id.0)
    }

    fn location_ids(&mut self, table: &SymbolTable, frames: &[LocationFrame]) -> Vec<u64> {
        frames
            .iter()
            .map(|frame| {
                self.tables.location(
                    table,
                    &self.mapping_catalog,
                    frame.file_info_id.0,
                    frame.address,
                    frame.symbols,
                )
            })
            .collect()
    }

    /// Add one value to the (stack, pid) sample, leaf frame first.
    pub fn add_sample(
        &mut self,
        table: &SymbolTable,
        pid: i32,
        watcher_index: usize,
        frames: &[LocationFrame],
        value: i64,
    ) {
        let locations = self.location_ids(table, frames);
        self.add_values(pid, locations, watcher_index, value);
    }

    fn add_values(&mut self, pid: i32, locations: Vec<u64>, watcher_index: usize, value: i64) {
        let key = SampleKey { locations, pid };
        if let Some(&idx) = self.tables.sample_index.get(&key) {
            self.tables.samples[idx].value[watcher_index] += value;
            return;
        }
        let label = self.sample_labels(pid);
        let mut values = vec![0i64; self.value_types.len()];
        values[watcher_index] = value;
        let sample = pprof::Sample {
            location_id: key.locations.clone(),
            value: values,
            label,
        };
        let idx = self.tables.samples.len();
        self.tables.samples.push(sample);
        self.tables.sample_index.insert(key, idx);
    }

    fn sample_labels(&mut self, pid: i32) -> Vec<pprof::Label> {
        let pairs = [
            ("service", self.labels.service.clone()),
            ("environment", self.labels.environment.clone()),
            ("service_version", self.labels.service_version.clone()),
            ("runtime", self.labels.runtime.clone()),
        ];
        let mut label: Vec<pprof::Label> = pairs
            .iter()
            .map(|(key, value)| {
                let key = self.tables.string(key);
                let str = self.tables.string(value);
                pprof::Label {
                    key,
                    str,
                    num: 0,
                    num_unit: 0,
                }
            })
            .collect();
        let pid_key = self.tables.string("pid");
        label.push(pprof::Label {
            key: pid_key,
            str: 0,
            num: pid as i64,
            num_unit: 0,
        });
        label
    }

    /// Order-sensitive hash over the stack's `(file id, ELF address)` pairs.
    fn stack_hash(pid: i32, frames: &[OwnedFrame]) -> u64 {
        let mut hasher = FxHasher::default();
        pid.hash(&mut hasher);
        for frame in frames {
            frame.file_info_id.0.hash(&mut hasher);
            frame.address.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Track a sampled allocation for live-heap accounting. Samples with
    /// empty stacks are dropped rather than recorded.
    pub fn add_allocation(
        &mut self,
        table: &SymbolTable,
        pid: i32,
        watcher_index: usize,
        frames: &[LocationFrame],
        address: u64,
        size: u64,
    ) {
        if frames.is_empty() {
            return;
        }
        let locations = self.location_ids(table, frames);
        self.add_values(pid, locations, watcher_index, size as i64);

        if self.live.addresses.len() >= MAX_TRACKED_ALLOCATIONS {
            log::warn!("live-allocation map full; dropping all tracked entries");
            self.live.addresses.clear();
            self.live.stacks.clear();
        }
        let owned: Vec<OwnedFrame> = frames
            .iter()
            .map(|frame| OwnedFrame {
                file_info_id: frame.file_info_id,
                address: frame.address,
                symbols: frame.symbols.to_vec(),
            })
            .collect();
        let hash = Self::stack_hash(pid, &owned);
        let stack = self.live.stacks.entry(hash).or_insert_with(|| LiveStack {
            pid,
            frames: owned,
            live_bytes: 0,
            allocation_count: 0,
        });
        stack.live_bytes += size as i64;
        stack.allocation_count += 1;
        self.live.addresses.insert((pid, address), (hash, size));
    }

    /// Match a deallocation to its allocation; unmatched addresses are
    /// ignored (their allocation was never sampled).
    pub fn add_deallocation(&mut self, pid: i32, address: u64) {
        let Some((hash, size)) = self.live.addresses.remove(&(pid, address)) else {
            return;
        };
        if let Some(stack) = self.live.stacks.get_mut(&hash) {
            stack.live_bytes -= size as i64;
            stack.allocation_count -= 1;
            if stack.live_bytes <= 0 && stack.allocation_count <= 0 {
                self.live.stacks.remove(&hash);
            }
        }
    }

    /// The producer overflowed its tracked-allocation budget and restarted;
    /// drop our mirror of its state.
    pub fn clear_live_allocations(&mut self, pid: i32) {
        self.live.clear_pid(pid);
    }

    /// Forget everything about an exited process.
    pub fn forget_pid(&mut self, pid: i32) {
        self.live.clear_pid(pid);
    }

    pub fn add_lost_events(&mut self, count: u64) {
        self.lost_events += count;
    }

    pub fn live_allocation_count(&self) -> usize {
        self.live.addresses.len()
    }

    pub fn live_bytes_for_pid(&self, pid: i32) -> i64 {
        self.live
            .stacks
            .values()
            .filter(|stack| stack.pid == pid)
            .map(|stack| stack.live_bytes)
            .sum()
    }

    /// Serialize this cycle's profile and install a fresh one. Live-heap
    /// stacks are folded in as values of the allocation watcher before the
    /// swap.
    pub fn flush(
        &mut self,
        table: &SymbolTable,
        live_watcher_index: Option<usize>,
    ) -> (pprof::Profile, Vec<u8>) {
        if let Some(watcher_index) = live_watcher_index {
            let live_stacks: Vec<(i32, Vec<OwnedFrame>, i64)> = self
                .live
                .stacks
                .values()
                .filter(|stack| stack.live_bytes > 0)
                .map(|stack| (stack.pid, stack.frames.clone(), stack.live_bytes))
                .collect();
            for (pid, frames, live_bytes) in live_stacks {
                let borrowed: Vec<LocationFrame> = frames
                    .iter()
                    .map(|frame| LocationFrame {
                        file_info_id: frame.file_info_id,
                        address: frame.address,
                        symbols: &frame.symbols,
                    })
                    .collect();
                let locations = self.location_ids(table, &borrowed);
                self.add_values(pid, locations, watcher_index, live_bytes);
            }
        }

        let mut tables = std::mem::replace(&mut self.tables, ProfileTables::new());

        let sample_type = self
            .value_types
            .iter()
            .map(|spec| pprof::ValueType {
                r#type: tables.string(spec.type_name),
                unit: tables.string(spec.unit),
            })
            .collect();
        let period_type = self.value_types.first().map(|spec| pprof::ValueType {
            r#type: tables.string(spec.type_name),
            unit: tables.string(spec.unit),
        });
        let period = self.value_types.first().map(|spec| spec.period).unwrap_or(0);

        let mut comment = Vec::new();
        if self.lost_events > 0 {
            let lost = format!("lost_events: {}", self.lost_events);
            comment.push(tables.string(&lost));
            self.lost_events = 0;
        }

        let time_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let duration_nanos = self.cycle_start.elapsed().as_nanos() as i64;
        self.cycle_start = Instant::now();

        let profile = pprof::Profile {
            sample_type,
            sample: tables.samples,
            mapping: tables.mappings,
            location: tables.locations,
            function: tables.functions,
            string_table: tables.strings,
            drop_frames: 0,
            keep_frames: 0,
            time_nanos,
            duration_nanos,
            period_type,
            period: period as i64,
            comment,
            default_sample_type: 0,
        };
        let bytes = profile.encode_to_vec();
        (profile, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::cache::SymbolCache;
    use crate::symbols::SymbolBackend;

    struct NoBackend;
    impl SymbolBackend for NoBackend {
        fn resolve(
            &mut self,
            _file_info: &crate::file_info::FileInfo,
            _elf_addr: u64,
        ) -> Option<crate::symbols::BackendResolution> {
            None
        }
    }

    fn test_aggregator() -> Aggregator {
        let mut aggregator = Aggregator::new(
            ProfileLabels {
                service: "svc".into(),
                environment: "test".into(),
                service_version: "1.2.3".into(),
                runtime: "native".into(),
            },
            vec![
                ValueTypeSpec {
                    type_name: "cpu-time",
                    unit: "nanoseconds",
                    period: 10_000_000,
                },
                ValueTypeSpec {
                    type_name: "alloc-space",
                    unit: "bytes",
                    period: 524288,
                },
            ],
        );
        aggregator.register_mapping(
            FileInfoId(2),
            0x1000,
            0x9000,
            0,
            "/bin/app",
            Some("9432ac93"),
        );
        aggregator
    }

    fn symbols_for(cache: &mut SymbolCache<NoBackend>, names: &[&str]) -> Vec<u32> {
        names
            .iter()
            .map(|name| cache.dso_fallback_symbol(name, 0))
            .collect()
    }

    #[test]
    fn repeated_stacks_collapse_into_one_sample() {
        let mut aggregator = test_aggregator();
        let mut cache = SymbolCache::new(NoBackend);
        let symbols = symbols_for(&mut cache, &["leaf", "mid", "root"]);

        let frames: Vec<LocationFrame> = symbols
            .iter()
            .enumerate()
            .map(|(i, symbol)| LocationFrame {
                file_info_id: FileInfoId(2),
                address: 0x100 * (i as u64 + 1),
                symbols: std::slice::from_ref(symbol),
            })
            .collect();

        aggregator.add_sample(&cache.table, 42, 0, &frames, 10_000_000);
        aggregator.add_sample(&cache.table, 42, 0, &frames, 10_000_000);

        let (profile, bytes) = aggregator.flush(&cache.table, None);
        assert!(!bytes.is_empty());
        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![20_000_000, 0]);
        assert_eq!(profile.sample[0].location_id.len(), 3);
        assert_eq!(profile.string_table[0], "");
        assert_eq!(profile.location.len(), 3);
        assert_eq!(profile.function.len(), 3);
        assert_eq!(profile.mapping.len(), 1);
        let mapping = &profile.mapping[0];
        assert_eq!(profile.string_table[mapping.filename as usize], "/bin/app");
        assert_eq!(profile.string_table[mapping.build_id as usize], "9432ac93");

        // Labels: the four service labels plus the numeric pid.
        let labels = &profile.sample[0].label;
        assert_eq!(labels.len(), 5);
        let pid_label = labels.last().unwrap();
        assert_eq!(profile.string_table[pid_label.key as usize], "pid");
        assert_eq!(pid_label.num, 42);
    }

    #[test]
    fn live_heap_returns_to_prior_value_after_matching_free() {
        let mut aggregator = test_aggregator();
        let mut cache = SymbolCache::new(NoBackend);
        let symbols = symbols_for(&mut cache, &["alloc_site"]);
        let frames = [LocationFrame {
            file_info_id: FileInfoId(2),
            address: 0x10,
            symbols: &symbols,
        }];

        let before = aggregator.live_bytes_for_pid(1);
        aggregator.add_allocation(&cache.table, 1, 1, &frames, 0x7000, 64);
        assert_eq!(aggregator.live_bytes_for_pid(1), before + 64);
        aggregator.add_deallocation(1, 0x7000);
        assert_eq!(aggregator.live_bytes_for_pid(1), before);
        assert_eq!(aggregator.live_allocation_count(), 0);

        // Unmatched deallocations are ignored.
        aggregator.add_deallocation(1, 0x9999);
        assert_eq!(aggregator.live_bytes_for_pid(1), before);
    }

    #[test]
    fn empty_stacks_are_dropped_from_live_tracking() {
        let mut aggregator = test_aggregator();
        let cache = SymbolCache::new(NoBackend);
        aggregator.add_allocation(&cache.table, 1, 1, &[], 0x7000, 64);
        assert_eq!(aggregator.live_allocation_count(), 0);
    }

    #[test]
    fn clear_live_marker_resets_one_pid() {
        let mut aggregator = test_aggregator();
        let mut cache = SymbolCache::new(NoBackend);
        let symbols = symbols_for(&mut cache, &["site"]);
        let frames = [LocationFrame {
            file_info_id: FileInfoId(2),
            address: 0x10,
            symbols: &symbols,
        }];

        for i in 0..10 {
            aggregator.add_allocation(&cache.table, 1, 1, &frames, 0x1000 + i * 0x10, 16);
        }
        aggregator.add_allocation(&cache.table, 2, 1, &frames, 0x5000, 16);
        assert_eq!(aggregator.live_allocation_count(), 11);

        // The producer hit its cap and restarted: only its entries go.
        aggregator.clear_live_allocations(1);
        assert_eq!(aggregator.live_allocation_count(), 1);

        // The next allocation after the clear is the sole tracked entry for
        // that pid.
        aggregator.add_allocation(&cache.table, 1, 1, &frames, 0x8000, 16);
        assert_eq!(aggregator.live_allocation_count(), 2);
        assert_eq!(aggregator.live_bytes_for_pid(1), 16);
    }

    #[test]
    fn flush_folds_live_bytes_and_resets_tables() {
        let mut aggregator = test_aggregator();
        let mut cache = SymbolCache::new(NoBackend);
        let symbols = symbols_for(&mut cache, &["site"]);
        let frames = [LocationFrame {
            file_info_id: FileInfoId(2),
            address: 0x10,
            symbols: &symbols,
        }];

        aggregator.add_allocation(&cache.table, 1, 1, &frames, 0x7000, 128);
        aggregator.add_lost_events(3);
        let (profile, _) = aggregator.flush(&cache.table, Some(1));
        assert_eq!(profile.sample.len(), 1);
        // Sampled bytes plus the folded-in live bytes.
        assert_eq!(profile.sample[0].value[1], 128 + 128);
        assert_eq!(profile.comment.len(), 1);
        assert_eq!(
            profile.string_table[profile.comment[0] as usize],
            "lost_events: 3"
        );

        // A fresh profile was installed; live state survives the cycle and
        // its mapping is recreated from the catalog.
        let (next, _) = aggregator.flush(&cache.table, Some(1));
        assert_eq!(next.sample.len(), 1);
        assert_eq!(next.sample[0].value[1], 128);
        assert_eq!(next.mapping.len(), 1);
        assert_eq!(next.comment.len(), 0);
    }
}

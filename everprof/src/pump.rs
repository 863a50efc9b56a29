//! The event pump: one thread, level-triggered epoll over every event
//! source, records dispatched by type into the unwinding and aggregation
//! pipeline. The single-consumer discipline here is what lets the registry,
//! file table, symbol cache, and aggregator all go lock-free.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use linux_perf_data::linux_perf_event_reader;
use linux_perf_event_reader::{
    EventRecord, RawData, RawEventRecord, RecordParseInfo, RecordType, SampleRecord,
};

use everprof_events::{
    AllocationTrackerStateRecord, ClearLiveAllocationRecord, DeallocationRecord, LostRecord,
    MpscRingBufferReader, PerfEventHeader, RingBuffer, RingBufferKind,
    PERF_CUSTOM_EVENT_ALLOCATION_TRACKER_STATE, PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION,
    PERF_CUSTOM_EVENT_DEALLOCATION, PERF_RECORD_LOST, PERF_RECORD_SAMPLE,
};

use crate::aggregator::{Aggregator, LocationFrame, ProfileLabels};
use crate::convert_regs::{ConvertRegs, ConvertRegsNative};
use crate::dso_registry::DsoRegistry;
use crate::error::{ErrorKind, ProfilerError, Result};
use crate::file_info::{FileInfoId, FileInfoTable};
use crate::ipc::HandshakeServer;
use crate::perf_event::{EventSource, Perf};
use crate::process::Processes;
use crate::section_data::SectionData;
use crate::sink::ProfileSink;
use crate::symbols::{Addr2LineBackend, SymbolCache};
use crate::unwind::{unwind_stack, FrameKind, UnwoundFrame};
use crate::watcher::{Watcher, WatcherEvent};

type NativeUnwinder = framehop::UnwinderNative<SectionData, framehop::MayAllocateDuringUnwind>;
type NativeCache = <NativeUnwinder as framehop::Unwinder>::Cache;

const TOKEN_ALLOC: u64 = 1 << 32;
const TOKEN_HANDSHAKE: u64 = (1 << 32) + 1;
const MAX_EPOLL_WAIT: Duration = Duration::from_millis(500);

pub struct PumpConfig {
    pub target_pid: Option<u32>,
    pub frequency: u64,
    pub event_source: EventSource,
    pub upload_period: Duration,
    pub socket_path: Option<PathBuf>,
    pub allocation_interval: u64,
    pub track_live_heap: bool,
    pub labels: ProfileLabels,
}

/// Everything the record-dispatch path touches; split from the fd plumbing
/// so draining a buffer can borrow both at once.
struct PipelineState {
    registry: DsoRegistry,
    files: FileInfoTable,
    processes: Processes<NativeUnwinder>,
    cache: NativeCache,
    symbols: SymbolCache<Addr2LineBackend>,
    aggregator: Aggregator,
    cycle: u64,
}

pub struct EventPump<S: ProfileSink> {
    state: PipelineState,
    sink: S,
    watchers: Vec<Watcher>,
    perfs: Vec<Perf>,
    alloc_rb: Option<RingBuffer>,
    alloc_rb_failed: bool,
    handshake: Option<HandshakeServer>,
    allocation_interval: u64,
    agent_parse_info: RecordParseInfo,
    epoll: OwnedFd,
    shutdown: Receiver<()>,
    upload_period: Duration,
}

impl<S: ProfileSink> EventPump<S> {
    pub fn new(config: PumpConfig, sink: S, shutdown: Receiver<()>) -> Result<Self> {
        let mut watchers = vec![Watcher::cpu(0, watcher_event(config.event_source), config.frequency)];

        let epoll = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(ProfilerError::error(ErrorKind::Epoll(
                    io::Error::last_os_error(),
                )));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let mut perfs = Vec::new();
        if let Some(pid) = config.target_pid {
            let cpu_count: usize = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            for cpu in 0..cpu_count as u32 {
                let perf = Perf::build()
                    .pid(pid)
                    .only_cpu(cpu)
                    .frequency(config.frequency)
                    .event_source(config.event_source)
                    .inherit_to_children()
                    .open()
                    .map_err(|e| ProfilerError::error(ErrorKind::PerfOpen(e)))?;
                perfs.push(perf);
            }
        }
        for (index, perf) in perfs.iter().enumerate() {
            epoll_add(&epoll, perf.fd(), index as u64)?;
        }

        let (alloc_rb, handshake) = match &config.socket_path {
            Some(path) => {
                watchers.push(Watcher::allocations(
                    watchers.len(),
                    config.allocation_interval,
                    config.track_live_heap,
                ));
                let rb = RingBuffer::create(8, RingBufferKind::Mpsc)?;
                epoll_add(&epoll, rb.event_fd().as_raw_fd(), TOKEN_ALLOC)?;
                let server = HandshakeServer::bind(path)?;
                epoll_add(&epoll, server.fd().as_raw_fd(), TOKEN_HANDSHAKE)?;
                (Some(rb), Some(server))
            }
            None => (None, None),
        };

        let value_types = watchers.iter().map(Watcher::value_type).collect();
        let mut state = PipelineState {
            registry: DsoRegistry::new(),
            files: FileInfoTable::new(),
            processes: Processes::new(),
            cache: framehop::CacheNative::new(),
            symbols: SymbolCache::new(Addr2LineBackend::new()),
            aggregator: Aggregator::new(config.labels, value_types),
            cycle: 0,
        };
        if let Some(pid) = config.target_pid {
            state.registry.backpopulate(pid as i32);
        }

        Ok(EventPump {
            state,
            sink,
            watchers,
            perfs,
            alloc_rb,
            alloc_rb_failed: false,
            handshake,
            allocation_interval: config.allocation_interval,
            agent_parse_info: crate::perf_event::parse_info_for_sample_layout(),
            epoll,
            shutdown,
            upload_period: config.upload_period,
        })
    }

    /// Poll, dispatch, and export until a shutdown signal arrives. The
    /// signal drains pending records and flushes one final profile.
    pub fn run(&mut self) -> Result<()> {
        let mut next_flush = Instant::now() + self.upload_period;
        let mut epoll_events = [libc::epoll_event { events: 0, u64: 0 }; 64];

        loop {
            if self.shutdown.try_recv().is_ok() {
                log::info!("shutdown requested; draining");
                self.drain_all();
                self.flush()?;
                return Ok(());
            }

            let until_flush = next_flush.saturating_duration_since(Instant::now());
            let timeout = until_flush.min(MAX_EPOLL_WAIT).as_millis() as i32;
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    epoll_events.as_mut_ptr(),
                    epoll_events.len() as i32,
                    timeout.max(1),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ProfilerError::error(ErrorKind::Epoll(err)));
            }

            for event in &epoll_events[..n as usize] {
                let token = event.u64;
                match token {
                    TOKEN_ALLOC => self.drain_alloc(),
                    TOKEN_HANDSHAKE => self.answer_handshake(),
                    index => self.drain_perf(index as usize),
                }
            }

            if Instant::now() >= next_flush {
                self.flush()?;
                next_flush = Instant::now() + self.upload_period;
            }
        }
    }

    fn drain_all(&mut self) {
        for index in 0..self.perfs.len() {
            self.drain_perf(index);
        }
        self.drain_alloc();
    }

    fn drain_perf(&mut self, index: usize) {
        let Some(perf) = self.perfs.get_mut(index) else {
            return;
        };
        let state = &mut self.state;
        let watchers = &self.watchers;
        perf.consume_pending(|record| state.handle_kernel_record(record, watchers));
    }

    fn drain_alloc(&mut self) {
        let Some(rb) = &self.alloc_rb else {
            return;
        };
        if self.alloc_rb_failed {
            return;
        }
        rb.drain_notifications();

        let state = &mut self.state;
        let watchers = &self.watchers;
        let parse_info = self.agent_parse_info;
        let mut reader = MpscRingBufferReader::new(rb);
        loop {
            match reader.next_record() {
                Ok(Some(payload)) => {
                    state.handle_agent_record(payload, parse_info, watchers);
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("abandoning allocation ring buffer: {err}");
                    self.alloc_rb_failed = true;
                    break;
                }
            }
        }
        reader.advance();
    }

    fn answer_handshake(&mut self) {
        let (Some(server), Some(rb)) = (&self.handshake, &self.alloc_rb) else {
            return;
        };
        if let Err(err) = server.handle_request(rb, self.allocation_interval) {
            err.log();
        }
    }

    fn flush(&mut self) -> Result<()> {
        let live_index = self
            .watchers
            .iter()
            .find(|w| w.event == WatcherEvent::AllocationBytes && w.track_live_heap)
            .map(|w| w.index);
        let (_profile, bytes) = self
            .state
            .aggregator
            .flush(&self.state.symbols.table, live_index);
        self.sink.export(&bytes)?;

        self.state.cycle += 1;
        let retired = self.state.processes.retire_idle(self.state.cycle);
        if !retired.is_empty() {
            log::debug!("retired {} idle unwinder contexts", retired.len());
        }
        Ok(())
    }
}

fn watcher_event(source: EventSource) -> WatcherEvent {
    match source {
        EventSource::HwCpuCycles => WatcherEvent::CpuCycles,
        EventSource::SwCpuClock => WatcherEvent::CpuClock,
    }
}

fn epoll_add(epoll: &OwnedFd, fd: RawFd, token: u64) -> Result<()> {
    let mut event = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: token,
    };
    let rc = unsafe {
        libc::epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event,
        )
    };
    if rc < 0 {
        return Err(ProfilerError::error(ErrorKind::Epoll(
            io::Error::last_os_error(),
        )));
    }
    Ok(())
}

impl PipelineState {
    fn handle_kernel_record(&mut self, record: RawEventRecord<'_>, watchers: &[Watcher]) {
        let parsed = match record.parse() {
            Ok(parsed) => parsed,
            Err(err) => {
                log::debug!("unparseable perf record: {err}");
                return;
            }
        };
        match parsed {
            EventRecord::Sample(e) => {
                // Watcher 0 is the CPU watcher feeding the kernel buffers.
                self.handle_sample(&e, &watchers[0], false);
            }
            EventRecord::Mmap2(e) => self.handle_mmap2(e),
            EventRecord::Mmap(e) => self.handle_mmap(e),
            EventRecord::Comm(e) => self.handle_comm(e),
            EventRecord::Fork(e) => {
                // The child starts from the parent's address space; mappings
                // backpopulate lazily on its first sample.
                if e.pid != e.ppid {
                    self.processes.get_by_pid(e.pid, self.cycle);
                }
            }
            EventRecord::Exit(e) => {
                if e.pid == e.tid {
                    self.registry.erase_pid(e.pid);
                    self.processes.remove(e.pid);
                    self.aggregator.forget_pid(e.pid);
                }
            }
            EventRecord::Lost(e) => {
                self.aggregator.add_lost_events(e.count);
            }
            _ => {}
        }
    }

    fn handle_agent_record(
        &mut self,
        payload: &[u8],
        parse_info: RecordParseInfo,
        watchers: &[Watcher],
    ) {
        let Some(header) = PerfEventHeader::parse(payload) else {
            return;
        };
        let Some(alloc_watcher) = watchers
            .iter()
            .find(|w| w.event == WatcherEvent::AllocationBytes)
        else {
            return;
        };
        let body = &payload[8..];
        match header.kind {
            PERF_RECORD_SAMPLE => {
                let raw = RawEventRecord {
                    record_type: RecordType(PERF_RECORD_SAMPLE),
                    misc: header.misc,
                    data: RawData::Single(body),
                    parse_info,
                };
                match raw.parse() {
                    Ok(EventRecord::Sample(e)) => {
                        self.handle_sample(&e, alloc_watcher, alloc_watcher.track_live_heap)
                    }
                    Ok(_) | Err(_) => log::debug!("bad allocation sample record"),
                }
            }
            PERF_CUSTOM_EVENT_DEALLOCATION => {
                if let Some(record) = DeallocationRecord::parse(body) {
                    self.aggregator
                        .add_deallocation(record.sample_id.pid as i32, record.ptr);
                }
            }
            PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION => {
                if let Some(record) = ClearLiveAllocationRecord::parse(body) {
                    self.aggregator
                        .clear_live_allocations(record.sample_id.pid as i32);
                }
            }
            PERF_CUSTOM_EVENT_ALLOCATION_TRACKER_STATE => {
                if let Some(record) = AllocationTrackerStateRecord::parse(body) {
                    log::debug!(
                        "tracker state pid={} tracked={} lost_alloc={} lost_dealloc={}",
                        record.sample_id.pid,
                        record.tracked_count,
                        record.lost_alloc,
                        record.lost_dealloc
                    );
                }
            }
            PERF_RECORD_LOST => {
                if let Some(record) = LostRecord::parse(body) {
                    self.aggregator.add_lost_events(record.lost);
                }
            }
            other => log::debug!("unknown agent record type {other}"),
        }
    }

    fn handle_sample(&mut self, e: &SampleRecord, watcher: &Watcher, live_heap: bool) {
        let Some(pid) = e.pid else {
            return;
        };
        let (Some(regs), Some((user_stack, _))) = (&e.user_regs, e.user_stack) else {
            return;
        };
        let period = e.period.unwrap_or(1);

        let (pc, sp, unwind_regs) = ConvertRegsNative::convert_regs(regs);
        let mut stack: Vec<UnwoundFrame> = Vec::new();
        {
            let process = self.processes.get_by_pid(pid, self.cycle);
            unwind_stack(
                pid,
                pc,
                sp,
                unwind_regs,
                user_stack,
                process,
                &mut self.registry,
                &mut self.files,
                &mut self.cache,
                &mut stack,
            );
        }

        let mut owned_frames: Vec<(FileInfoId, u64, Vec<u32>)> = Vec::with_capacity(stack.len());
        for frame in &stack {
            match frame.kind {
                FrameKind::Regular => {
                    if frame.file_info_id.is_valid() {
                        self.ensure_mapping(pid, frame.file_info_id);
                        let symbols =
                            self.symbols
                                .symbolize(&self.files, frame.file_info_id, frame.elf_addr);
                        owned_frames.push((frame.file_info_id, frame.elf_addr, symbols));
                    } else {
                        let name = self
                            .registry
                            .find(pid, frame.pc)
                            .map(|dso| dso.file_name().to_owned())
                            .unwrap_or_else(|| "<unknown>".to_owned());
                        let symbol = self.symbols.dso_fallback_symbol(&name, frame.elf_addr);
                        owned_frames.push((FileInfoId::ERROR, frame.elf_addr, vec![symbol]));
                    }
                }
                FrameKind::ProcessRoot => {
                    let symbol = self.symbols.pid_symbol(pid);
                    owned_frames.push((frame.file_info_id, 0, vec![symbol]));
                }
                kind => {
                    let symbol = self.symbols.error_symbol(kind);
                    owned_frames.push((FileInfoId::UNSET, 0, vec![symbol]));
                }
            }
        }

        let frames: Vec<LocationFrame> = owned_frames
            .iter()
            .map(|(file_info_id, address, symbols)| LocationFrame {
                file_info_id: *file_info_id,
                address: *address,
                symbols,
            })
            .collect();

        if live_heap {
            let address = e.addr.unwrap_or(0);
            self.aggregator.add_allocation(
                &self.symbols.table,
                pid,
                watcher.index,
                &frames,
                address,
                period,
            );
        } else {
            self.aggregator.add_sample(
                &self.symbols.table,
                pid,
                watcher.index,
                &frames,
                period as i64,
            );
        }
    }

    fn ensure_mapping(&mut self, pid: i32, file_info_id: FileInfoId) {
        if self.aggregator.has_mapping(file_info_id) {
            return;
        }
        let Some(file_info) = self.files.get(file_info_id) else {
            return;
        };
        let Some(process) = self.processes.get(pid) else {
            return;
        };
        let Some(module) = process.modules.get(&file_info_id) else {
            return;
        };
        let file_offset = self
            .registry
            .find(pid, module.low_addr)
            .map(|dso| dso.page_offset)
            .unwrap_or(0);
        self.aggregator.register_mapping(
            file_info_id,
            module.low_addr,
            module.high_addr,
            file_offset,
            &file_info.path.to_string_lossy(),
            module.build_id.as_deref(),
        );
    }

    fn handle_mmap2(&mut self, e: linux_perf_event_reader::Mmap2Record) {
        let path_bytes = e.path.as_slice();
        let path = String::from_utf8_lossy(&path_bytes).into_owned();
        let inode = match &e.file_id {
            linux_perf_event_reader::Mmap2FileId::InodeAndVersion(inode) => inode.inode,
            linux_perf_event_reader::Mmap2FileId::BuildId(_) => 0,
        };
        const PROT_EXEC: u32 = 0b100;
        self.insert_dso(
            e.pid,
            e.address,
            e.length,
            e.page_offset,
            inode,
            path,
            e.protection & PROT_EXEC != 0,
        );
    }

    fn handle_mmap(&mut self, e: linux_perf_event_reader::MmapRecord) {
        let path_bytes = e.path.as_slice();
        let path = String::from_utf8_lossy(&path_bytes).into_owned();
        self.insert_dso(
            e.pid,
            e.address,
            e.length,
            e.page_offset,
            0,
            path,
            e.is_executable,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_dso(
        &mut self,
        pid: i32,
        address: u64,
        length: u64,
        page_offset: u64,
        inode: u64,
        path: String,
        executable: bool,
    ) {
        if pid < 0 {
            // Kernel pseudo-mappings are not unwound; only the placeholder
            // symbol would ever come out of them.
            return;
        }
        let kind = crate::dso::DsoKind::from_path(&path);
        self.registry.insert_evicting(crate::dso::Dso {
            pid,
            start: address,
            end: address.saturating_add(length),
            page_offset,
            inode,
            path,
            kind,
            executable,
            file_info_id: FileInfoId::UNSET,
        });
    }

    fn handle_comm(&mut self, e: linux_perf_event_reader::CommOrExecRecord) {
        let name_bytes = e.name.as_slice();
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        if e.is_execve {
            // The address space was replaced wholesale.
            self.registry.erase_pid(e.pid);
            self.processes.remove(e.pid);
        }
        self.processes.set_name(e.pid, name, self.cycle);
    }
}

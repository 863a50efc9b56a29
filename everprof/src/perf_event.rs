//! One perf_event_open fd with its kernel-mapped ring buffer.
//!
//! The kernel maps the buffer once, so a record can straddle the wrap
//! point; records are handed out as split raw-data views instead of relying
//! on the double-mapping trick the profiler-owned buffers use.

use std::cmp::max;
use std::io;
use std::mem;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void, pid_t};
use linux_perf_data::linux_perf_event_reader;
use linux_perf_event_reader::{Endianness, RawData, RawEventRecord, RecordParseInfo, RecordType};

use everprof_events::{
    PerfEventMmapPage, PERF_ATTR_FLAG_COMM, PERF_ATTR_FLAG_DISABLED,
    PERF_ATTR_FLAG_ENABLE_ON_EXEC, PERF_ATTR_FLAG_EXCLUDE_KERNEL, PERF_ATTR_FLAG_FREQ,
    PERF_ATTR_FLAG_INHERIT, PERF_ATTR_FLAG_MMAP, PERF_ATTR_FLAG_MMAP2, PERF_ATTR_FLAG_MMAP_DATA,
    PERF_ATTR_FLAG_SAMPLE_ID_ALL, PERF_ATTR_FLAG_TASK, PERF_ATTR_FLAG_USE_CLOCKID,
    PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_SW_CPU_CLOCK, PERF_SAMPLE_STACK_SIZE,
    PERF_TYPE_HARDWARE, PERF_TYPE_SOFTWARE, SAMPLE_REGS_MASK, SAMPLE_TYPE_MASK,
};

use crate::sys::{
    sys_perf_event_open, PerfEventAttr, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE,
    PERF_FLAG_FD_CLOEXEC,
};

#[repr(C)]
struct RawRecordHeader {
    kind: u32,
    misc: u16,
    size: u16,
}

#[derive(Clone, Debug)]
enum SliceLocation {
    Single(Range<usize>),
    Split(Range<usize>, Range<usize>),
}

impl SliceLocation {
    #[inline]
    fn get<'a>(&self, buffer: &'a [u8]) -> RawData<'a> {
        match *self {
            SliceLocation::Single(ref range) => RawData::Single(&buffer[range.clone()]),
            SliceLocation::Split(ref left, ref right) => {
                RawData::Split(&buffer[left.clone()], &buffer[right.clone()])
            }
        }
    }
}

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventSource {
    HwCpuCycles,
    SwCpuClock,
}

#[derive(Clone, Debug)]
pub struct PerfBuilder {
    pid: u32,
    cpu: Option<u32>,
    frequency: u64,
    event_source: EventSource,
    inherit: bool,
    start_disabled: bool,
    enable_on_exec: bool,
    exclude_kernel: bool,
}

impl PerfBuilder {
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn only_cpu(mut self, cpu: u32) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn any_cpu(mut self) -> Self {
        self.cpu = None;
        self
    }

    pub fn frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn event_source(mut self, event_source: EventSource) -> Self {
        self.event_source = event_source;
        self
    }

    pub fn inherit_to_children(mut self) -> Self {
        self.inherit = true;
        self
    }

    pub fn start_disabled(mut self) -> Self {
        self.start_disabled = true;
        self
    }

    pub fn enable_on_exec(mut self) -> Self {
        self.enable_on_exec = true;
        self
    }

    /// Requires `/proc/sys/kernel/perf_event_paranoid` below 2.
    pub fn sample_kernel(mut self) -> Self {
        self.exclude_kernel = false;
        self
    }

    pub fn open(self) -> io::Result<Perf> {
        if let Some(max_sample_rate) = Perf::max_sample_rate() {
            if self.frequency > max_sample_rate {
                let message = format!(
                    "frequency can be at most {max_sample_rate} as configured in /proc/sys/kernel/perf_event_max_sample_rate"
                );
                return Err(io::Error::new(io::ErrorKind::InvalidInput, message));
            }
        }

        let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<PerfEventAttr>() as u32;

        match self.event_source {
            EventSource::HwCpuCycles => {
                attr.kind = PERF_TYPE_HARDWARE;
                attr.config = PERF_COUNT_HW_CPU_CYCLES;
            }
            EventSource::SwCpuClock => {
                attr.kind = PERF_TYPE_SOFTWARE;
                attr.config = PERF_COUNT_SW_CPU_CLOCK;
            }
        }

        attr.sample_type = SAMPLE_TYPE_MASK;
        attr.sample_regs_user = SAMPLE_REGS_MASK;
        attr.sample_stack_user = PERF_SAMPLE_STACK_SIZE as u32;
        attr.sample_period_or_freq = self.frequency;
        attr.clock_id = libc::CLOCK_MONOTONIC;

        attr.flags = PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_MMAP
            | PERF_ATTR_FLAG_MMAP2
            | PERF_ATTR_FLAG_MMAP_DATA
            | PERF_ATTR_FLAG_COMM
            | PERF_ATTR_FLAG_FREQ
            | PERF_ATTR_FLAG_TASK
            | PERF_ATTR_FLAG_SAMPLE_ID_ALL
            | PERF_ATTR_FLAG_USE_CLOCKID;

        if self.enable_on_exec {
            attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
        }
        if self.exclude_kernel {
            attr.flags |= PERF_ATTR_FLAG_EXCLUDE_KERNEL;
        }
        if self.inherit {
            attr.flags |= PERF_ATTR_FLAG_INHERIT;
        }

        let cpu = self.cpu.map(|cpu| cpu as i32).unwrap_or(-1);
        let fd = sys_perf_event_open(&attr, self.pid as pid_t, cpu, -1, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd));
        }

        // Enough room for a batch of max-size stack samples between polls.
        const STACK_COUNT_PER_BUFFER: u32 = 32;
        let required_space = max(PERF_SAMPLE_STACK_SIZE as u32, 4096) * STACK_COUNT_PER_BUFFER;
        let page_size = 4096u32;
        let n = (1..26)
            .find(|n| (1_u32 << n) * page_size >= required_space)
            .expect("cannot find an appropriate page count");
        let page_count: u32 = max(1 << n, 16);
        let full_size = (page_size * (page_count + 1)) as usize;

        let buffer = unsafe {
            let buffer = libc::mmap(
                ptr::null_mut(),
                full_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if buffer == libc::MAP_FAILED {
                libc::close(fd);
                return Err(io::Error::other("mmap of perf buffer failed"));
            }
            buffer as *mut u8
        };

        let attr_bytes = unsafe {
            slice::from_raw_parts(
                &attr as *const PerfEventAttr as *const u8,
                mem::size_of::<PerfEventAttr>(),
            )
        };
        let (parsed_attr, _size) =
            linux_perf_event_reader::PerfEventAttr::parse::<_, byteorder::NativeEndian>(attr_bytes)
                .map_err(|_| io::Error::other("could not re-parse perf attr"))?;
        let parse_info = RecordParseInfo::new(&parsed_attr, Endianness::NATIVE);

        let mut perf = Perf {
            buffer,
            size: (page_size * page_count) as u64,
            fd,
            position: 0,
            parse_info,
        };
        if !self.start_disabled {
            perf.enable();
        }
        Ok(perf)
    }
}

/// Parse info for the fixed sample layout, for records that did not come
/// from a perf fd (the in-process agent writes the same shape).
pub fn parse_info_for_sample_layout() -> RecordParseInfo {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_type = SAMPLE_TYPE_MASK;
    attr.sample_regs_user = SAMPLE_REGS_MASK;
    attr.sample_stack_user = PERF_SAMPLE_STACK_SIZE as u32;
    let attr_bytes = unsafe {
        slice::from_raw_parts(
            &attr as *const PerfEventAttr as *const u8,
            mem::size_of::<PerfEventAttr>(),
        )
    };
    let (parsed_attr, _size) =
        linux_perf_event_reader::PerfEventAttr::parse::<_, byteorder::NativeEndian>(attr_bytes)
            .expect("fixed attr layout must parse");
    RecordParseInfo::new(&parsed_attr, Endianness::NATIVE)
}

pub struct Perf {
    buffer: *mut u8,
    size: u64,
    fd: RawFd,
    position: u64,
    parse_info: RecordParseInfo,
}

impl Perf {
    pub fn build() -> PerfBuilder {
        PerfBuilder {
            pid: 0,
            cpu: None,
            frequency: 0,
            event_source: EventSource::SwCpuClock,
            inherit: false,
            start_disabled: false,
            enable_on_exec: false,
            exclude_kernel: true,
        }
    }

    pub fn max_sample_rate() -> Option<u64> {
        let data = std::fs::read_to_string("/proc/sys/kernel/perf_event_max_sample_rate").ok()?;
        data.trim().parse::<u64>().ok()
    }

    pub fn enable(&mut self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as _);
        }
    }

    pub fn disable(&mut self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as _);
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn parse_info(&self) -> RecordParseInfo {
        self.parse_info
    }

    #[inline]
    pub fn are_events_pending(&self) -> bool {
        unsafe { read_head(self.buffer) != self.position }
    }

    /// Hand every pending record to `f`, then publish consumption once.
    pub fn consume_pending(&mut self, mut f: impl FnMut(RawEventRecord<'_>)) {
        let head = unsafe { read_head(self.buffer) };
        let data = unsafe { slice::from_raw_parts(self.buffer.add(4096), self.size as usize) };

        while self.position != head {
            let offset = (self.position % self.size) as usize;
            let header = unsafe { &*(data[offset..].as_ptr() as *const RawRecordHeader) };
            let record_size = header.size as usize;
            if record_size < mem::size_of::<RawRecordHeader>()
                || record_size as u64 > head - self.position
            {
                log::error!("perf record with impossible size {record_size}; abandoning buffer");
                self.position = head;
                break;
            }
            let data_start = offset + mem::size_of::<RawRecordHeader>();
            let data_end = offset + record_size;
            let location = if data_end > self.size as usize {
                SliceLocation::Split(data_start..data.len(), 0..data_end % self.size as usize)
            } else {
                SliceLocation::Single(data_start..data_end)
            };

            f(RawEventRecord {
                record_type: RecordType(header.kind),
                misc: header.misc,
                data: location.get(data),
                parse_info: self.parse_info,
            });

            self.position += record_size as u64;
        }

        unsafe { write_tail(self.buffer, self.position) };
    }
}

impl Drop for Perf {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer as *mut c_void, (self.size + 4096) as usize);
            libc::close(self.fd);
        }
    }
}

use byteorder::{ByteOrder, LittleEndian};

#[cfg(target_endian = "big")]
macro_rules! flag {
    ($nth:expr) => {
        (1 << 63) >> $nth
    };
}

#[cfg(target_endian = "little")]
macro_rules! flag {
    ($nth:expr) => {
        1 << $nth
    };
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;

pub const PERF_ATTR_FLAG_DISABLED: u64 = flag!(0);
pub const PERF_ATTR_FLAG_INHERIT: u64 = flag!(1);
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = flag!(5);
pub const PERF_ATTR_FLAG_MMAP: u64 = flag!(8);
pub const PERF_ATTR_FLAG_COMM: u64 = flag!(9);
pub const PERF_ATTR_FLAG_FREQ: u64 = flag!(10);
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = flag!(12);
pub const PERF_ATTR_FLAG_TASK: u64 = flag!(13);
pub const PERF_ATTR_FLAG_MMAP_DATA: u64 = flag!(17);
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = flag!(18);
pub const PERF_ATTR_FLAG_MMAP2: u64 = flag!(23);
pub const PERF_ATTR_FLAG_USE_CLOCKID: u64 = flag!(25);

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;

/// Custom record types start above anything the kernel will ever emit.
pub const PERF_CUSTOM_EVENT_DEALLOCATION: u32 = 1000;
pub const PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION: u32 = 1001;
pub const PERF_CUSTOM_EVENT_ALLOCATION_TRACKER_STATE: u32 = 1002;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_ADDR: u64 = 1 << 3;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

/// The one sample layout used for every watcher, kernel or in-process.
pub const SAMPLE_TYPE_MASK: u64 = PERF_SAMPLE_TID
    | PERF_SAMPLE_TIME
    | PERF_SAMPLE_ADDR
    | PERF_SAMPLE_CPU
    | PERF_SAMPLE_PERIOD
    | PERF_SAMPLE_REGS_USER
    | PERF_SAMPLE_STACK_USER;

pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

/// Number of bytes of raw stack captured per sample, on both the kernel and
/// the in-process path.
pub const PERF_SAMPLE_STACK_SIZE: usize = 4096 * 8;

pub const PERF_REG_X86_AX: u64 = 0;
pub const PERF_REG_X86_BX: u64 = 1;
pub const PERF_REG_X86_CX: u64 = 2;
pub const PERF_REG_X86_DX: u64 = 3;
pub const PERF_REG_X86_SI: u64 = 4;
pub const PERF_REG_X86_DI: u64 = 5;
pub const PERF_REG_X86_BP: u64 = 6;
pub const PERF_REG_X86_SP: u64 = 7;
pub const PERF_REG_X86_IP: u64 = 8;
pub const PERF_REG_X86_FLAGS: u64 = 9;
pub const PERF_REG_X86_CS: u64 = 10;
pub const PERF_REG_X86_SS: u64 = 11;
pub const PERF_REG_X86_R8: u64 = 16;
pub const PERF_REG_X86_R9: u64 = 17;
pub const PERF_REG_X86_R10: u64 = 18;
pub const PERF_REG_X86_R11: u64 = 19;
pub const PERF_REG_X86_R12: u64 = 20;
pub const PERF_REG_X86_R13: u64 = 21;
pub const PERF_REG_X86_R14: u64 = 22;
pub const PERF_REG_X86_R15: u64 = 23;

pub const PERF_REG_ARM64_X0: u64 = 0;
pub const PERF_REG_ARM64_X19: u64 = 19;
pub const PERF_REG_ARM64_X29: u64 = 29;
pub const PERF_REG_ARM64_LR: u64 = 30;
pub const PERF_REG_ARM64_SP: u64 = 31;
pub const PERF_REG_ARM64_PC: u64 = 32;

/// Register sample mask: general-purpose integer registers only, in perf
/// numbering. The two segment selector pairs DS/ES/FS/GS are not sampled.
#[cfg(target_arch = "x86_64")]
pub const SAMPLE_REGS_MASK: u64 = (1 << PERF_REG_X86_AX)
    | (1 << PERF_REG_X86_BX)
    | (1 << PERF_REG_X86_CX)
    | (1 << PERF_REG_X86_DX)
    | (1 << PERF_REG_X86_SI)
    | (1 << PERF_REG_X86_DI)
    | (1 << PERF_REG_X86_BP)
    | (1 << PERF_REG_X86_SP)
    | (1 << PERF_REG_X86_IP)
    | (1 << PERF_REG_X86_FLAGS)
    | (1 << PERF_REG_X86_CS)
    | (1 << PERF_REG_X86_SS)
    | (1 << PERF_REG_X86_R8)
    | (1 << PERF_REG_X86_R9)
    | (1 << PERF_REG_X86_R10)
    | (1 << PERF_REG_X86_R11)
    | (1 << PERF_REG_X86_R12)
    | (1 << PERF_REG_X86_R13)
    | (1 << PERF_REG_X86_R14)
    | (1 << PERF_REG_X86_R15);

#[cfg(target_arch = "aarch64")]
pub const SAMPLE_REGS_MASK: u64 = (1 << (PERF_REG_ARM64_PC + 1)) - 1;

#[cfg(target_arch = "x86_64")]
pub const PERF_REGS_COUNT: usize = 20;

#[cfg(target_arch = "aarch64")]
pub const PERF_REGS_COUNT: usize = 33;

/// Index of a register within the sampled register array, i.e. the number of
/// mask bits set below its perf register id.
pub const fn sampled_reg_index(perf_reg: u64) -> usize {
    (SAMPLE_REGS_MASK & ((1u64 << perf_reg) - 1)).count_ones() as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PerfEventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

pub const PERF_EVENT_HEADER_SIZE: usize = 8;

impl PerfEventHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PERF_EVENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: LittleEndian::read_u32(&data[0..4]),
            misc: LittleEndian::read_u16(&data[4..6]),
            size: LittleEndian::read_u16(&data[6..8]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.kind);
        LittleEndian::write_u16(&mut out[4..6], self.misc);
        LittleEndian::write_u16(&mut out[6..8], self.size);
    }
}

/// The trailing identification fields every custom record carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
}

pub const SAMPLE_ID_SIZE: usize = 16;

impl SampleId {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SAMPLE_ID_SIZE {
            return None;
        }
        Some(Self {
            pid: LittleEndian::read_u32(&data[0..4]),
            tid: LittleEndian::read_u32(&data[4..8]),
            time: LittleEndian::read_u64(&data[8..16]),
        })
    }

    fn write(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.pid);
        LittleEndian::write_u32(&mut out[4..8], self.tid);
        LittleEndian::write_u64(&mut out[8..16], self.time);
    }
}

/// `PERF_RECORD_LOST` body: `{id, lost}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
}

pub const LOST_RECORD_SIZE: usize = PERF_EVENT_HEADER_SIZE + 16;

impl LostRecord {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 16 {
            return None;
        }
        Some(Self {
            id: LittleEndian::read_u64(&body[0..8]),
            lost: LittleEndian::read_u64(&body[8..16]),
        })
    }

    pub fn write_record(&self, out: &mut [u8]) {
        PerfEventHeader {
            kind: PERF_RECORD_LOST,
            misc: 0,
            size: LOST_RECORD_SIZE as u16,
        }
        .write(out);
        LittleEndian::write_u64(&mut out[8..16], self.id);
        LittleEndian::write_u64(&mut out[16..24], self.lost);
    }
}

/// `PERF_CUSTOM_EVENT_DEALLOCATION` body: `{sample_id, ptr}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeallocationRecord {
    pub sample_id: SampleId,
    pub ptr: u64,
}

pub const DEALLOCATION_RECORD_SIZE: usize = PERF_EVENT_HEADER_SIZE + SAMPLE_ID_SIZE + 8;

impl DeallocationRecord {
    pub fn parse(body: &[u8]) -> Option<Self> {
        let sample_id = SampleId::parse(body)?;
        if body.len() < SAMPLE_ID_SIZE + 8 {
            return None;
        }
        Some(Self {
            sample_id,
            ptr: LittleEndian::read_u64(&body[SAMPLE_ID_SIZE..SAMPLE_ID_SIZE + 8]),
        })
    }

    pub fn write_record(&self, out: &mut [u8]) {
        PerfEventHeader {
            kind: PERF_CUSTOM_EVENT_DEALLOCATION,
            misc: 0,
            size: DEALLOCATION_RECORD_SIZE as u16,
        }
        .write(out);
        self.sample_id.write(&mut out[8..]);
        LittleEndian::write_u64(&mut out[24..32], self.ptr);
    }
}

/// `PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION` body: `{sample_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearLiveAllocationRecord {
    pub sample_id: SampleId,
}

pub const CLEAR_LIVE_ALLOCATION_RECORD_SIZE: usize = PERF_EVENT_HEADER_SIZE + SAMPLE_ID_SIZE;

impl ClearLiveAllocationRecord {
    pub fn parse(body: &[u8]) -> Option<Self> {
        Some(Self {
            sample_id: SampleId::parse(body)?,
        })
    }

    pub fn write_record(&self, out: &mut [u8]) {
        PerfEventHeader {
            kind: PERF_CUSTOM_EVENT_CLEAR_LIVE_ALLOCATION,
            misc: 0,
            size: CLEAR_LIVE_ALLOCATION_RECORD_SIZE as u16,
        }
        .write(out);
        self.sample_id.write(&mut out[8..]);
    }
}

/// `PERF_CUSTOM_EVENT_ALLOCATION_TRACKER_STATE` body:
/// `{sample_id, tracked_count, lost_alloc, lost_dealloc}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationTrackerStateRecord {
    pub sample_id: SampleId,
    pub tracked_count: u64,
    pub lost_alloc: u64,
    pub lost_dealloc: u64,
}

pub const ALLOCATION_TRACKER_STATE_RECORD_SIZE: usize =
    PERF_EVENT_HEADER_SIZE + SAMPLE_ID_SIZE + 24;

impl AllocationTrackerStateRecord {
    pub fn parse(body: &[u8]) -> Option<Self> {
        let sample_id = SampleId::parse(body)?;
        if body.len() < SAMPLE_ID_SIZE + 24 {
            return None;
        }
        let rest = &body[SAMPLE_ID_SIZE..];
        Some(Self {
            sample_id,
            tracked_count: LittleEndian::read_u64(&rest[0..8]),
            lost_alloc: LittleEndian::read_u64(&rest[8..16]),
            lost_dealloc: LittleEndian::read_u64(&rest[16..24]),
        })
    }

    pub fn write_record(&self, out: &mut [u8]) {
        PerfEventHeader {
            kind: PERF_CUSTOM_EVENT_ALLOCATION_TRACKER_STATE,
            misc: 0,
            size: ALLOCATION_TRACKER_STATE_RECORD_SIZE as u16,
        }
        .write(out);
        self.sample_id.write(&mut out[8..]);
        LittleEndian::write_u64(&mut out[24..32], self.tracked_count);
        LittleEndian::write_u64(&mut out[32..40], self.lost_alloc);
        LittleEndian::write_u64(&mut out[40..48], self.lost_dealloc);
    }
}

/// Size of the `PERF_RECORD_SAMPLE` look-alike the agent writes. The field
/// order follows the kernel ABI for [`SAMPLE_TYPE_MASK`]: TID, TIME, ADDR,
/// CPU, PERIOD, REGS_USER (abi + regs), STACK_USER (size + data + dyn_size).
pub const ALLOCATION_SAMPLE_RECORD_SIZE: usize = PERF_EVENT_HEADER_SIZE
    + SAMPLE_ID_SIZE          // pid, tid, time
    + 8                       // addr
    + 8                       // cpu, res
    + 8                       // period
    + 8                       // regs abi
    + PERF_REGS_COUNT * 8     // regs
    + 8                       // stack size
    + PERF_SAMPLE_STACK_SIZE  // stack bytes
    + 8; // dyn_size

/// Field-by-field writer for the allocation sample record. Writes are
/// byte-oriented because MPSC payloads are only 4-byte aligned.
pub struct AllocationSampleWriter<'a> {
    out: &'a mut [u8],
}

impl<'a> AllocationSampleWriter<'a> {
    /// `out` must be exactly [`ALLOCATION_SAMPLE_RECORD_SIZE`] bytes.
    pub fn new(out: &'a mut [u8]) -> Self {
        debug_assert_eq!(out.len(), ALLOCATION_SAMPLE_RECORD_SIZE);
        PerfEventHeader {
            kind: PERF_RECORD_SAMPLE,
            misc: 0,
            size: ALLOCATION_SAMPLE_RECORD_SIZE as u16,
        }
        .write(out);
        Self { out }
    }

    pub fn set_identity(&mut self, pid: u32, tid: u32, time: u64) {
        SampleId { pid, tid, time }.write(&mut self.out[8..]);
    }

    pub fn set_addr(&mut self, addr: u64) {
        LittleEndian::write_u64(&mut self.out[24..32], addr);
    }

    pub fn set_cpu(&mut self, cpu: u32) {
        LittleEndian::write_u32(&mut self.out[32..36], cpu);
        LittleEndian::write_u32(&mut self.out[36..40], 0);
    }

    pub fn set_period(&mut self, period: u64) {
        LittleEndian::write_u64(&mut self.out[40..48], period);
    }

    pub fn set_regs(&mut self, regs: &[u64; PERF_REGS_COUNT]) {
        LittleEndian::write_u64(&mut self.out[48..56], PERF_SAMPLE_REGS_ABI_64);
        let mut offset = 56;
        for reg in regs {
            LittleEndian::write_u64(&mut self.out[offset..offset + 8], *reg);
            offset += 8;
        }
    }

    /// The fixed-size stack area; the caller copies captured bytes into its
    /// head and reports the copied length through `set_dyn_size`.
    pub fn stack_bytes(&mut self) -> &mut [u8] {
        let start = 56 + PERF_REGS_COUNT * 8 + 8;
        &mut self.out[start..start + PERF_SAMPLE_STACK_SIZE]
    }

    pub fn set_dyn_size(&mut self, dyn_size: u64) {
        let size_offset = 56 + PERF_REGS_COUNT * 8;
        LittleEndian::write_u64(
            &mut self.out[size_offset..size_offset + 8],
            PERF_SAMPLE_STACK_SIZE as u64,
        );
        let dyn_offset = size_offset + 8 + PERF_SAMPLE_STACK_SIZE;
        LittleEndian::write_u64(&mut self.out[dyn_offset..dyn_offset + 8], dyn_size);
    }
}

/// Round a record length up to the 8-byte granularity every ring-buffer
/// variant reserves in.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(24), 24);
        assert_eq!(align8(25), 32);
    }

    #[test]
    fn header_round_trip() {
        let hdr = PerfEventHeader {
            kind: PERF_RECORD_SAMPLE,
            misc: 3,
            size: 48,
        };
        let mut buf = [0u8; 8];
        hdr.write(&mut buf);
        assert_eq!(PerfEventHeader::parse(&buf), Some(hdr));
    }

    #[test]
    fn deallocation_round_trip() {
        let record = DeallocationRecord {
            sample_id: SampleId {
                pid: 1234,
                tid: 1235,
                time: 77,
            },
            ptr: 0xdead_beef,
        };
        let mut buf = [0u8; DEALLOCATION_RECORD_SIZE];
        record.write_record(&mut buf);
        let hdr = PerfEventHeader::parse(&buf).unwrap();
        assert_eq!(hdr.kind, PERF_CUSTOM_EVENT_DEALLOCATION);
        assert_eq!(hdr.size as usize, DEALLOCATION_RECORD_SIZE);
        assert_eq!(DeallocationRecord::parse(&buf[8..]), Some(record));
    }

    #[test]
    fn sampled_reg_index_matches_mask_order() {
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(sampled_reg_index(PERF_REG_X86_AX), 0);
            assert_eq!(sampled_reg_index(PERF_REG_X86_SP), 7);
            assert_eq!(sampled_reg_index(PERF_REG_X86_IP), 8);
            // r8 follows ss directly because ds/es/fs/gs are not sampled.
            assert_eq!(sampled_reg_index(PERF_REG_X86_R8), 12);
            assert_eq!(sampled_reg_index(PERF_REG_X86_R15), 19);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(sampled_reg_index(PERF_REG_ARM64_X0), 0);
            assert_eq!(sampled_reg_index(PERF_REG_ARM64_SP), 31);
            assert_eq!(sampled_reg_index(PERF_REG_ARM64_PC), 32);
        }
    }
}

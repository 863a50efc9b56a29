//! Wire compatibility: the in-process agent's sample look-alikes must parse
//! with the same record reader the kernel buffers go through.

use everprof::perf_event::parse_info_for_sample_layout;
use linux_perf_data::linux_perf_event_reader::{
    EventRecord, RawData, RawEventRecord, RecordType,
};

use everprof_events::{
    sampled_reg_index, AllocationSampleWriter, MpscRingBufferReader, MpscRingBufferWriter,
    PerfEventHeader, RingBuffer, RingBufferKind, ALLOCATION_SAMPLE_RECORD_SIZE,
    PERF_RECORD_SAMPLE, PERF_REGS_COUNT, PERF_SAMPLE_STACK_SIZE, RESERVE_TIMEOUT,
};

#[cfg(target_arch = "x86_64")]
const SP_REG: u64 = everprof_events::PERF_REG_X86_SP;
#[cfg(target_arch = "aarch64")]
const SP_REG: u64 = everprof_events::PERF_REG_ARM64_SP;

#[test]
fn allocation_sample_parses_as_a_perf_sample_record() {
    let rb = RingBuffer::create(6, RingBufferKind::Mpsc).unwrap();
    let writer = MpscRingBufferWriter::new(&rb);

    let mut regs = [0u64; PERF_REGS_COUNT];
    regs[sampled_reg_index(SP_REG)] = 0x7ffd_0000_1000;

    {
        let mut reservation = writer
            .reserve(ALLOCATION_SAMPLE_RECORD_SIZE, RESERVE_TIMEOUT)
            .unwrap();
        let mut sample = AllocationSampleWriter::new(reservation.bytes());
        sample.set_identity(4242, 4243, 1_000_000);
        sample.set_addr(0xdead_1000);
        sample.set_cpu(3);
        sample.set_period(524288);
        sample.set_regs(&regs);
        sample.stack_bytes()[0] = 0xaa;
        sample.stack_bytes()[7] = 0xbb;
        sample.set_dyn_size(4096);
        reservation.commit();
    }

    let mut reader = MpscRingBufferReader::new(&rb);
    let payload = reader.next_record().unwrap().expect("record missing");
    let header = PerfEventHeader::parse(payload).unwrap();
    assert_eq!(header.kind, PERF_RECORD_SAMPLE);
    assert_eq!(header.size as usize, ALLOCATION_SAMPLE_RECORD_SIZE);

    let raw = RawEventRecord {
        record_type: RecordType(PERF_RECORD_SAMPLE),
        misc: header.misc,
        data: RawData::Single(&payload[8..]),
        parse_info: parse_info_for_sample_layout(),
    };
    let EventRecord::Sample(sample) = raw.parse().expect("sample must parse") else {
        panic!("not parsed as a sample record");
    };

    assert_eq!(sample.pid, Some(4242));
    assert_eq!(sample.tid, Some(4243));
    assert_eq!(sample.timestamp, Some(1_000_000));
    assert_eq!(sample.addr, Some(0xdead_1000));
    assert_eq!(sample.cpu, Some(3));
    assert_eq!(sample.period, Some(524288));

    let parsed_regs = sample.user_regs.expect("user regs present");
    assert_eq!(parsed_regs.get(SP_REG), Some(0x7ffd_0000_1000));

    let (stack, dyn_size) = sample.user_stack.expect("user stack present");
    assert_eq!(dyn_size, 4096);
    let stack_bytes = stack.as_slice();
    assert_eq!(stack_bytes.len(), PERF_SAMPLE_STACK_SIZE);
    assert_eq!(stack_bytes[0], 0xaa);
    assert_eq!(stack_bytes[7], 0xbb);
}

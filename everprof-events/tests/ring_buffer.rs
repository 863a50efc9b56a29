use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use everprof_events::{
    align8, MpscRingBufferReader, MpscRingBufferWriter, PerfEventHeader, PerfRingBufferReader,
    PerfRingBufferWriter, ReserveError, RingBuffer, RingBufferKind, SpinLock, RESERVE_TIMEOUT,
};

const TEST_RECORD_SIZE: usize = 24;

fn write_test_record(writer: &mut PerfRingBufferWriter, i: u32) -> bool {
    let mut record = [0u8; TEST_RECORD_SIZE];
    PerfEventHeader {
        kind: 3,
        misc: 0,
        size: TEST_RECORD_SIZE as u16,
    }
    .write(&mut record);
    LittleEndian::write_u32(&mut record[8..12], i);
    LittleEndian::write_u32(&mut record[12..16], 2 * i);
    LittleEndian::write_u32(&mut record[16..20], 3 * i);
    writer.write(&record)
}

fn read_test_records(reader: &mut PerfRingBufferReader, out: &mut Vec<(u32, u32, u32)>) {
    let mut consumed = 0;
    {
        let data = reader.read_all_available();
        let mut pos = 0;
        while pos + TEST_RECORD_SIZE <= data.len() {
            let hdr = PerfEventHeader::parse(&data[pos..]).unwrap();
            assert_eq!(hdr.kind, 3);
            assert_eq!(hdr.size as usize, TEST_RECORD_SIZE);
            out.push((
                LittleEndian::read_u32(&data[pos + 8..]),
                LittleEndian::read_u32(&data[pos + 12..]),
                LittleEndian::read_u32(&data[pos + 16..]),
            ));
            pos += TEST_RECORD_SIZE;
        }
        consumed += pos;
    }
    reader.advance(consumed);
}

#[test]
fn perf_round_trip_in_order() {
    let rb = RingBuffer::create(0, RingBufferKind::Perf).unwrap();
    let mut seen = Vec::new();
    let mut next = 0u32;
    while seen.len() < 1000 {
        {
            let mut writer = PerfRingBufferWriter::new(&rb);
            while next < 1000 && write_test_record(&mut writer, next) {
                next += 1;
            }
        }
        let mut reader = PerfRingBufferReader::new(&rb);
        read_test_records(&mut reader, &mut seen);
    }

    assert_eq!(seen.len(), 1000);
    for (i, &(x, y, z)) in seen.iter().enumerate() {
        let i = i as u32;
        assert_eq!((x, y, z), (i, 2 * i, 3 * i));
    }
}

#[test]
fn perf_round_trip_threaded() {
    let rb = RingBuffer::create(0, RingBufferKind::Perf).unwrap();
    thread::scope(|scope| {
        scope.spawn(|| {
            let mut next = 0u32;
            while next < 1000 {
                let mut writer = PerfRingBufferWriter::new(&rb);
                while next < 1000 && write_test_record(&mut writer, next) {
                    next += 1;
                }
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            let mut reader = PerfRingBufferReader::new(&rb);
            read_test_records(&mut reader, &mut seen);
        }
        for (i, &(x, y, z)) in seen.iter().enumerate() {
            let i = i as u32;
            assert_eq!((x, y, z), (i, 2 * i, 3 * i));
        }
    });
}

#[test]
fn perf_reserve_rounds_to_eight_bytes() {
    let rb = RingBuffer::create(0, RingBufferKind::Perf).unwrap();
    let mut writer = PerfRingBufferWriter::new(&rb);
    let available = writer.available_size();
    let span = writer.reserve(13);
    assert_eq!(span.len(), 16);
    assert_eq!(writer.available_size(), available - 16);
}

#[test]
fn perf_writer_rejects_oversized_record() {
    let rb = RingBuffer::create(0, RingBufferKind::Perf).unwrap();
    let mut writer = PerfRingBufferWriter::new(&rb);
    assert!(writer.reserve(4096 + 8).is_empty());
    assert_eq!(writer.reserve(4096).len(), 4096);
}

#[test]
fn perf_record_straddling_the_wrap_is_contiguous() {
    let rb = RingBuffer::create(0, RingBufferKind::Perf).unwrap();

    // Push the cursors close to the end of the 4096-byte data region, so the
    // next record crosses the wrap point.
    {
        let mut writer = PerfRingBufferWriter::new(&rb);
        let span = writer.reserve(4096 - 16);
        span.fill(0xaa);
    }
    {
        let mut reader = PerfRingBufferReader::new(&rb);
        let n = reader.available_size();
        reader.advance(n);
    }

    let payload: Vec<u8> = (0..64u8).collect();
    {
        let mut writer = PerfRingBufferWriter::new(&rb);
        let span = writer.reserve(64);
        span.copy_from_slice(&payload);
    }
    let mut reader = PerfRingBufferReader::new(&rb);
    assert_eq!(reader.read_all_available(), &payload[..]);
    reader.advance(64);
}

#[test]
fn mpsc_round_trip() {
    let rb = RingBuffer::create(0, RingBufferKind::Mpsc).unwrap();
    let writer = MpscRingBufferWriter::new(&rb);

    for i in 0..10u64 {
        let mut reservation = writer.reserve(16, RESERVE_TIMEOUT).unwrap();
        LittleEndian::write_u64(&mut reservation.bytes()[0..8], i);
        LittleEndian::write_u64(&mut reservation.bytes()[8..16], i * i);
        reservation.commit();
        rb.notify();
    }

    let mut reader = MpscRingBufferReader::new(&rb);
    for i in 0..10u64 {
        let record = reader.next_record().unwrap().expect("record missing");
        assert_eq!(record.len(), 16);
        assert_eq!(LittleEndian::read_u64(&record[0..8]), i);
        assert_eq!(LittleEndian::read_u64(&record[8..16]), i * i);
    }
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn mpsc_aborted_reservation_is_invisible() {
    let rb = RingBuffer::create(0, RingBufferKind::Mpsc).unwrap();
    let writer = MpscRingBufferWriter::new(&rb);

    {
        let mut reservation = writer.reserve(8, RESERVE_TIMEOUT).unwrap();
        reservation.bytes().fill(0xff);
        // Dropped without commit.
    }
    {
        let mut reservation = writer.reserve(8, RESERVE_TIMEOUT).unwrap();
        LittleEndian::write_u64(&mut reservation.bytes()[0..8], 7);
        reservation.commit();
    }

    let mut reader = MpscRingBufferReader::new(&rb);
    let record = reader.next_record().unwrap().unwrap();
    assert_eq!(LittleEndian::read_u64(&record[0..8]), 7);
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn mpsc_stale_lock_times_out_reservations() {
    let rb = RingBuffer::create(0, RingBufferKind::Mpsc).unwrap();
    let writer = MpscRingBufferWriter::new(&rb);

    // Simulate a producer that died while holding the lock.
    let held = SpinLock::new(rb.mpsc_spinlock())
        .try_lock(RESERVE_TIMEOUT)
        .unwrap();
    std::mem::forget(held);

    assert_eq!(
        writer.reserve(8, Duration::from_micros(200)).err(),
        Some(ReserveError::StaleLock)
    );

    // Releasing the lock lets reservations through again.
    rb.mpsc_spinlock().store(0, Ordering::Release);
    assert!(writer.reserve(8, RESERVE_TIMEOUT).is_ok());
}

#[test]
fn mpsc_full_buffer_reports_full_not_stale() {
    let rb = RingBuffer::create(0, RingBufferKind::Mpsc).unwrap();
    let writer = MpscRingBufferWriter::new(&rb);

    let record = 512;
    let per_record = align8(4 + record);
    let mut committed = 0;
    loop {
        match writer.reserve(record, RESERVE_TIMEOUT) {
            Ok(reservation) => {
                reservation.commit();
                committed += per_record;
            }
            Err(err) => {
                assert_eq!(err, ReserveError::Full);
                break;
            }
        }
    }
    assert!(committed <= 4096);

    // Consuming makes room again.
    let mut reader = MpscRingBufferReader::new(&rb);
    while reader.next_record().unwrap().is_some() {}
    reader.advance();
    assert!(writer.reserve(record, RESERVE_TIMEOUT).is_ok());
}

#[test]
fn eventfd_wakeup_round_trip() {
    let rb = RingBuffer::create(0, RingBufferKind::Mpsc).unwrap();
    rb.notify();
    rb.notify();
    // Level-triggered consumers drain the counter once per wake.
    rb.drain_notifications();
}

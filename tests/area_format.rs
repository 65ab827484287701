// tests/area_format.rs
//
// Запуск только этого файла:
//   cargo test --test area_format -- --nocapture
//
// Покрываем:
// 1) Запись области: encode → decode сохраняет диапазон, права, backing, props и имя.
// 2) Sentinel (64 нулевых байта) читается как конец потока.
// 3) Битые записи (невыровненные, end <= start) отвергаются.
// 4) Коды флагов страниц и slice() для файловой области.

use std::io::Cursor;

use anyhow::Result;

use SnapRewind::area::{AreaProps, Backing, MemoryArea, PageStatus};
use SnapRewind::consts::{AREA_NAME_MAX, AREA_REC_SIZE, PAGE_SIZE};

fn encode(a: &MemoryArea) -> Vec<u8> {
    let mut buf = [0u8; AREA_REC_SIZE + AREA_NAME_MAX];
    let n = a.encode(&mut buf);
    buf[..n].to_vec()
}

#[test]
fn area_record_survives_encode_decode() -> Result<()> {
    let mut file = MemoryArea::new(0x7f00_0000_0000, 0x7f00_0000_4000, libc::PROT_READ)
        .with_name(b"/usr/lib/libfoo.so.1");
    file.offset = 0x2000;
    file.dev = (8 << 32) | 1;
    file.inode = 123456;
    file.bytes_offset = 77 * PAGE_SIZE as u64;

    let mut heap = MemoryArea::anon_rw(0x5555_0000_0000, 0x5555_0002_1000).with_name(b"[heap]");
    heap.props.set(AreaProps::SKIP, true);

    let mut stream = encode(&file);
    stream.extend_from_slice(&encode(&heap));
    stream.extend_from_slice(&MemoryArea::SENTINEL);

    let mut r = Cursor::new(stream);
    let a = MemoryArea::decode(&mut r)?.expect("file area");
    assert_eq!(a, file);
    assert_eq!(a.bytes_offset, file.bytes_offset);
    assert_eq!(a.dev, file.dev);
    assert_eq!(a.inode, 123456);
    assert_eq!(a.backing, Backing::File);
    assert!(a.maps_from_file());
    assert_eq!(a.name_str(), "/usr/lib/libfoo.so.1");

    let h = MemoryArea::decode(&mut r)?.expect("heap area");
    assert_eq!(h, heap);
    assert!(h.is_heap());
    assert!(h.is_skip());
    assert!(h.is_anonymous());

    assert!(MemoryArea::decode(&mut r)?.is_none(), "sentinel must end the stream");
    Ok(())
}

#[test]
fn malformed_records_are_rejected() -> Result<()> {
    // невыровненный конец
    let bad = MemoryArea::anon_rw(0x1000, 0x1800);
    let err = MemoryArea::decode(&mut Cursor::new(encode(&bad))).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    // end <= start
    let mut rec = encode(&MemoryArea::anon_rw(0x3000, 0x4000));
    rec[8..16].copy_from_slice(&0x2000u64.to_le_bytes());
    let err = MemoryArea::decode(&mut Cursor::new(rec)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

    // обрезанная запись
    let rec = encode(&MemoryArea::anon_rw(0x3000, 0x4000));
    let err = MemoryArea::decode(&mut Cursor::new(rec[..20].to_vec())).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    Ok(())
}

#[test]
fn backing_is_classified_from_the_name() -> Result<()> {
    let memfd = MemoryArea::anon_rw(0x1000, 0x2000).with_name(b"/memfd:jit (deleted)");
    assert!(memfd.is_anonymous());
    assert!(!memfd.maps_from_file());

    let deleted = MemoryArea::anon_rw(0x1000, 0x2000).with_name(b"/tmp/scratch (deleted)");
    assert!(deleted.is_anonymous(), "deleted file is promoted to anonymous");

    let stack = MemoryArea::anon_rw(0x1000, 0x2000).with_name(b"[stack]");
    assert!(stack.is_stack());
    assert_eq!(stack.backing, Backing::Special);

    let anon = MemoryArea::anon_rw(0x1000, 0x2000);
    assert!(anon.same_backing(&stack));
    let file = MemoryArea::anon_rw(0x1000, 0x2000).with_name(b"/data/db.bin");
    assert!(!file.same_backing(&anon));
    Ok(())
}

#[test]
fn slice_moves_file_offset() -> Result<()> {
    let mut f = MemoryArea::new(0x10000, 0x20000, libc::PROT_READ | libc::PROT_WRITE)
        .with_name(b"/data/map.bin");
    f.offset = 0x4000;
    let tail = f.slice(0x18000, 0x20000);
    assert_eq!(tail.start, 0x18000);
    assert_eq!(tail.offset, 0x4000 + 0x8000);
    assert_eq!(tail.pages(), 8);

    let anon = MemoryArea::anon_rw(0x10000, 0x20000);
    assert_eq!(anon.slice(0x12000, 0x13000).offset, 0);
    Ok(())
}

#[test]
fn page_status_codes_are_stable() -> Result<()> {
    for st in [
        PageStatus::NoPage,
        PageStatus::Zero,
        PageStatus::Unchanged,
        PageStatus::CompressedRun,
        PageStatus::Raw,
    ] {
        assert_eq!(PageStatus::from_u8(st.to_u8()), Some(st));
    }
    assert_eq!(PageStatus::from_u8(0), None, "0 is the 'no flag' value");
    assert_eq!(PageStatus::from_u8(200), None);
    assert!(PageStatus::Raw.has_payload());
    assert!(PageStatus::CompressedRun.has_payload());
    assert!(!PageStatus::Unchanged.has_payload());
    Ok(())
}

// tests/reconcile.rs
//
// Запуск только этого файла:
//   cargo test --test reconcile -- --nocapture
//
// Покрываем сверку раскладок на записывающем AddressSpaceOps (без syscalls):
// 1) Живая область короче сохранённой → один mremap.
// 2) Лишняя живая → munmap; недостающая сохранённая → mmap.
// 3) [heap]: рост через brk, исчезнувшая куча → brk вниз.
// 4) Skip-область из файла: mmap из файла + защита, или ничего, если файла нет.
// 5) Частичное перекрытие: mmap префикса + mremap остатка.
// 6) Файловая область длиннее сохранённой: общая часть делается rw, хвост снимается.
// 7) Тот же диапазон, другое происхождение → перемапливание.

use std::io;

use anyhow::Result;

use SnapRewind::area::{AreaProps, Backing, MemoryArea};
use SnapRewind::metrics::OpStats;
use SnapRewind::reconcile::{reconcile, SliceAreas};
use SnapRewind::space::AddressSpaceOps;

const RW: i32 = libc::PROT_READ | libc::PROT_WRITE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Map { start: usize, end: usize, file: bool },
    Unmap(usize, usize),
    Remap { start: usize, new_len: usize },
    Brk(usize),
    Protect(usize, usize, i32),
}

#[derive(Default)]
struct Recorder {
    ops: Vec<Op>,
    file_len: Option<u64>,
}

impl AddressSpaceOps for Recorder {
    fn map_area(&mut self, area: &MemoryArea, use_file: bool) -> io::Result<()> {
        self.ops.push(Op::Map {
            start: area.start,
            end: area.end,
            file: use_file,
        });
        Ok(())
    }
    fn unmap(&mut self, start: usize, len: usize) -> io::Result<()> {
        self.ops.push(Op::Unmap(start, len));
        Ok(())
    }
    fn remap(&mut self, area: &MemoryArea, new_len: usize) -> io::Result<()> {
        self.ops.push(Op::Remap {
            start: area.start,
            new_len,
        });
        Ok(())
    }
    fn set_break(&mut self, addr: usize) -> io::Result<()> {
        self.ops.push(Op::Brk(addr));
        Ok(())
    }
    fn protect(&mut self, start: usize, len: usize, prot: i32) -> io::Result<()> {
        self.ops.push(Op::Protect(start, len, prot));
        Ok(())
    }
    fn backing_len(&mut self, _area: &MemoryArea) -> Option<u64> {
        self.file_len
    }
}

fn run(saved: &[MemoryArea], live: &[MemoryArea], rec: &mut Recorder) -> Result<OpStats> {
    let mut stats = OpStats::default();
    let mut s = SliceAreas::new(saved);
    reconcile(&mut s, live.iter().copied(), rec, &mut stats)?;
    Ok(stats)
}

fn anon(start: usize, end: usize) -> MemoryArea {
    MemoryArea::anon_rw(start, end)
}

fn heap(start: usize, end: usize) -> MemoryArea {
    let mut a = MemoryArea::anon_rw(start, end).with_name(b"[heap]");
    a.backing = Backing::Special;
    a.props.set(AreaProps::HEAP, true);
    a
}

fn file(start: usize, end: usize, prot: i32, name: &[u8]) -> MemoryArea {
    let mut a = MemoryArea::new(start, end, prot).with_name(name);
    a.backing = Backing::File;
    a
}

#[test]
fn shorter_live_area_is_remapped_once() -> Result<()> {
    let mut rec = Recorder::default();
    let stats = run(&[anon(0x1000, 0x3000)], &[anon(0x1000, 0x2000)], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![Op::Remap {
            start: 0x1000,
            new_len: 0x2000
        }]
    );
    assert_eq!(stats.remaps, 1);
    assert_eq!(stats.maps + stats.unmaps, 0);
    Ok(())
}

#[test]
fn remap_needs_room_after_live_area() -> Result<()> {
    // следующая живая область мешает росту на месте: префикс общий, хвост создаётся
    let mut rec = Recorder::default();
    let live = [anon(0x1000, 0x2000), anon(0x2000, 0x3000).with_name(b"other")];
    let mut saved_tail = anon(0x1000, 0x4000);
    saved_tail.shared = true; // shared не ресайзится
    run(&[saved_tail], &live, &mut rec)?;
    assert_eq!(rec.ops.len(), 3);
    assert_eq!(
        rec.ops[0],
        Op::Map {
            start: 0x1000,
            end: 0x2000,
            file: false
        },
        "private live vs shared saved is a different backing"
    );
    Ok(())
}

#[test]
fn extra_live_is_unmapped_missing_saved_is_mapped() -> Result<()> {
    let mut rec = Recorder::default();
    let stats = run(&[], &[anon(0x5000, 0x6000)], &mut rec)?;
    assert_eq!(rec.ops, vec![Op::Unmap(0x5000, 0x1000)]);
    assert_eq!(stats.unmaps, 1);

    let mut rec = Recorder::default();
    let stats = run(&[anon(0x5000, 0x6000)], &[], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![Op::Map {
            start: 0x5000,
            end: 0x6000,
            file: false
        }]
    );
    assert_eq!(stats.maps, 1);

    // сохранённая лежит целиком перед живой
    let mut rec = Recorder::default();
    run(&[anon(0x1000, 0x2000)], &[anon(0x8000, 0x9000)], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![
            Op::Map {
                start: 0x1000,
                end: 0x2000,
                file: false
            },
            Op::Unmap(0x8000, 0x1000),
        ]
    );
    Ok(())
}

#[test]
fn identical_layout_needs_no_ops() -> Result<()> {
    let areas = [anon(0x1000, 0x3000), heap(0x10000, 0x20000), anon(0x30000, 0x31000)];
    let mut rec = Recorder::default();
    let stats = run(&areas, &areas, &mut rec)?;
    assert!(rec.ops.is_empty(), "unexpected ops: {:?}", rec.ops);
    assert_eq!(stats, OpStats::default());
    Ok(())
}

#[test]
fn heap_moves_through_brk() -> Result<()> {
    let mut rec = Recorder::default();
    let stats = run(&[heap(0x10000, 0x14000)], &[heap(0x10000, 0x12000)], &mut rec)?;
    assert_eq!(rec.ops, vec![Op::Brk(0x14000)]);
    assert_eq!(stats.brks, 1);

    // кучи в снимке нет: break опускается к началу живой
    let mut rec = Recorder::default();
    run(&[], &[heap(0x10000, 0x12000)], &mut rec)?;
    assert_eq!(rec.ops, vec![Op::Brk(0x10000)]);

    // кучи нет в живой раскладке: break поднимается до сохранённого конца
    let mut rec = Recorder::default();
    run(&[heap(0x10000, 0x18000)], &[], &mut rec)?;
    assert_eq!(rec.ops, vec![Op::Brk(0x18000)]);
    Ok(())
}

#[test]
fn skipped_file_area_is_mapped_from_file_when_possible() -> Result<()> {
    let mut lib = file(0x20000, 0x22000, libc::PROT_READ | libc::PROT_EXEC, b"/usr/lib/libx.so");
    lib.props.set(AreaProps::SKIP, true);

    let mut rec = Recorder {
        file_len: Some(0x10000),
        ..Default::default()
    };
    run(&[lib], &[], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![
            Op::Map {
                start: 0x20000,
                end: 0x22000,
                file: true
            },
            Op::Protect(0x20000, 0x2000, libc::PROT_READ | libc::PROT_EXEC),
        ]
    );

    // файл пропал: skip-область остаётся пустой
    let mut rec = Recorder::default();
    run(&[lib], &[], &mut rec)?;
    assert!(rec.ops.is_empty());

    // skip с обеих сторон не трогается
    let mut rec = Recorder::default();
    run(&[lib], &[lib], &mut rec)?;
    assert!(rec.ops.is_empty());
    Ok(())
}

#[test]
fn partial_overlap_maps_prefix_and_remaps_rest() -> Result<()> {
    let mut rec = Recorder::default();
    let stats = run(&[anon(0x1000, 0x4000)], &[anon(0x2000, 0x3000)], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![
            Op::Map {
                start: 0x1000,
                end: 0x2000,
                file: false
            },
            Op::Remap {
                start: 0x2000,
                new_len: 0x2000
            },
        ]
    );
    assert_eq!((stats.maps, stats.remaps), (1, 1));
    Ok(())
}

#[test]
fn longer_file_area_is_split() -> Result<()> {
    let saved = file(0x1000, 0x2000, libc::PROT_READ, b"/data/blob");
    let live = file(0x1000, 0x3000, libc::PROT_READ, b"/data/blob");
    let mut rec = Recorder::default();
    run(&[saved], &[live], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![Op::Protect(0x1000, 0x1000, RW), Op::Unmap(0x2000, 0x1000)]
    );
    Ok(())
}

#[test]
fn live_prefix_before_saved_is_unmapped() -> Result<()> {
    let mut rec = Recorder::default();
    run(&[anon(0x3000, 0x4000)], &[anon(0x1000, 0x4000)], &mut rec)?;
    assert_eq!(rec.ops, vec![Op::Unmap(0x1000, 0x2000)]);
    Ok(())
}

#[test]
fn different_backing_is_remapped_in_place() -> Result<()> {
    let saved = anon(0x1000, 0x2000);
    let live = file(0x1000, 0x2000, RW, b"/tmp/f");
    let mut rec = Recorder::default();
    run(&[saved], &[live], &mut rec)?;
    assert_eq!(
        rec.ops,
        vec![Op::Map {
            start: 0x1000,
            end: 0x2000,
            file: false
        }]
    );
    Ok(())
}

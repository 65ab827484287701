// tests/incremental.rs
//
// Запуск только этого файла:
//   cargo test --test incremental -- --nocapture
//
// Покрываем цепочку base → slot → slot на поддельной памяти:
// 1) Слот, записанный в той же заморозке, что и base (FreshBase): ноль байт payload,
//    все страницы с данными: Unchanged.
// 2) Смешанный случай: стр.0 обнулена, стр.1 не тронута, стр.2 изменена →
//    Zero / Unchanged / Raw, payload ровно одна страница; restore с base
//    собирает исходные байты.
// 3) Повторный save без изменений от слота из одних Unchanged: ноль payload.
// 4) SyncInfo: load того же поколения пропускает чистые страницы.

use std::io::{self, Cursor};

use anyhow::Result;
use flate2::{Compress, Compression, Decompress};

use SnapRewind::area::{MemoryArea, PageStatus};
use SnapRewind::consts::{FRAME_HDR_SIZE, PAGE_SIZE, RUN_BYTES};
use SnapRewind::metrics::OpStats;
use SnapRewind::pagemap::{PageInfo, PageSource, PageTarget};
use SnapRewind::restore::{restore_pages, SyncInfo};
use SnapRewind::snapshot::{
    Baseline, GenHeader, GenerationKind, GenerationReader, ReaderScratch, SnapshotWriter,
    ThreadImage, WriterOptions, WriterScratch,
};
use SnapRewind::space::AddressSpaceOps;

type Mem = Cursor<Vec<u8>>;

const START: usize = 0x40_0000;
const PAGES: usize = 3;

struct FakeMem {
    start: usize,
    data: Vec<u8>,
    present: Vec<bool>,
    dirty: Vec<bool>,
}

impl FakeMem {
    fn new(fill: u8) -> Self {
        Self {
            start: START,
            data: vec![fill; PAGES * PAGE_SIZE],
            present: vec![true; PAGES],
            dirty: vec![true; PAGES],
        }
    }

    fn page(&self, idx: usize) -> &[u8] {
        &self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
    }

    fn page_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
    }

    /// Аналог clear_refs: всё чистое.
    fn clear_dirty(&mut self) {
        self.dirty.iter_mut().for_each(|d| *d = false);
    }
}

impl PageSource for FakeMem {
    fn page_info(&mut self, addr: usize) -> io::Result<PageInfo> {
        let i = (addr - self.start) / PAGE_SIZE;
        Ok(PageInfo {
            present: self.present[i],
            soft_dirty: self.dirty[i],
        })
    }

    fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        let off = addr - self.start;
        &self.data[off..off + len]
    }
}

impl PageTarget for FakeMem {
    fn pages_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        let off = addr - self.start;
        &mut self.data[off..off + len]
    }

    fn discard(&mut self, addr: usize, len: usize) -> io::Result<()> {
        self.pages_mut(addr, len).fill(0);
        Ok(())
    }
}

struct NoLayout;

impl AddressSpaceOps for NoLayout {
    fn map_area(&mut self, _area: &MemoryArea, _use_file: bool) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
    fn unmap(&mut self, _start: usize, _len: usize) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
    fn remap(&mut self, _area: &MemoryArea, _new_len: usize) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
    fn set_break(&mut self, _addr: usize) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
    fn protect(&mut self, _start: usize, _len: usize, _prot: i32) -> io::Result<()> {
        Ok(())
    }
    fn backing_len(&mut self, _area: &MemoryArea) -> Option<u64> {
        None
    }
}

/// Записанное поколение в памяти.
struct Gen {
    meta: Vec<u8>,
    bytes: Vec<u8>,
    stats: OpStats,
}

fn area() -> MemoryArea {
    MemoryArea::anon_rw(START, START + PAGES * PAGE_SIZE)
}

fn write_gen(
    header: &GenHeader,
    mem: &mut FakeMem,
    baseline: &mut Baseline<'_, '_, Mem>,
    compression: bool,
) -> Result<Gen> {
    let mut comp_in = vec![0u8; RUN_BYTES];
    let mut comp_out = vec![0u8; RUN_BYTES + FRAME_HDR_SIZE + PAGE_SIZE];
    let mut codec = Compress::new(Compression::fast(), false);
    let mut w = SnapshotWriter::new(
        Vec::new(),
        Vec::new(),
        header,
        &[],
        Some(&mut codec),
        WriterScratch {
            comp_in: &mut comp_in,
            comp_out: &mut comp_out,
        },
        WriterOptions {
            compression,
            hashing: true,
        },
    )?;
    w.write_area(&area(), mem, baseline)?;
    let (meta, bytes, stats) = w.finish_save(&*mem)?;
    Ok(Gen { meta, bytes, stats })
}

fn slot_header(slot: u32, generation: u64, base: u64, parent: u64) -> GenHeader {
    let mut h = GenHeader::new(GenerationKind::Slot(slot), 0xabc, generation);
    h.flags |= SnapRewind::consts::GEN_FLAG_INCREMENTAL;
    h.base_generation = base;
    h.parent_generation = parent;
    h
}

fn flags_of(g: &Gen) -> Result<Vec<PageStatus>> {
    let mut images: [ThreadImage; 0] = [];
    let mut r: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(g.meta.clone()), &mut images)?;
    let mut out = Vec::new();
    for i in 0..PAGES {
        out.push(r.get_page_flag(START + i * PAGE_SIZE)?.expect("flag"));
    }
    Ok(out)
}

/// Исходная память: три страницы с разными непустыми байтами.
fn initial_memory() -> FakeMem {
    let mut rng = oorandom::Rand64::new(42);
    let mut m = FakeMem::new(0);
    for i in 0..PAGES {
        for chunk in m.page_mut(i).chunks_mut(8) {
            chunk.copy_from_slice(&rng.rand_u64().to_le_bytes());
        }
    }
    m
}

fn write_base(mem: &mut FakeMem) -> Result<Gen> {
    let h = GenHeader::new(GenerationKind::Base, 0xabc, 1);
    let mut b: Baseline<'_, '_, Mem> = Baseline::Full;
    write_gen(&h, mem, &mut b, false)
}

#[test]
fn fresh_base_slot_has_no_payload() -> Result<()> {
    let mut mem = initial_memory();
    let base = write_base(&mut mem)?;
    assert_eq!(base.stats.pages_raw, PAGES as u64);

    let mut fresh: Baseline<'_, '_, Mem> = Baseline::FreshBase;
    let slot = write_gen(&slot_header(0, 2, 1, 1), &mut mem, &mut fresh, true)?;
    assert!(slot.bytes.is_empty());
    assert_eq!(slot.stats.payload_bytes, 0);
    assert_eq!(slot.stats.pages_unchanged, PAGES as u64);
    assert_eq!(flags_of(&slot)?, vec![PageStatus::Unchanged; PAGES]);
    Ok(())
}

#[test]
fn zero_unchanged_raw_against_base() -> Result<()> {
    let mut mem = initial_memory();
    let original = mem.data.clone();
    let base = write_base(&mut mem)?;
    mem.clear_dirty();

    // стр.0 обнулена, стр.1 не тронута, стр.2 переписана
    mem.page_mut(0).fill(0);
    mem.dirty[0] = true;
    mem.page_mut(2).fill(0x5a);
    mem.dirty[2] = true;
    let expected = mem.data.clone();

    let mut images: [ThreadImage; 0] = [];
    let mut parent: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(base.meta.clone()), &mut images)?;
    let mut baseline = Baseline::Parent {
        reader: &mut parent,
        is_base: true,
    };
    let slot = write_gen(&slot_header(0, 2, 1, 1), &mut mem, &mut baseline, false)?;

    assert_eq!(
        flags_of(&slot)?,
        vec![PageStatus::Zero, PageStatus::Unchanged, PageStatus::Raw]
    );
    assert_eq!(slot.stats.payload_bytes, PAGE_SIZE as u64);
    assert_eq!(slot.bytes.len(), PAGE_SIZE);

    // restore в мусор: стр.1 берётся из base
    let mut run_c = vec![0u8; RUN_BYTES];
    let mut frame_c = vec![0u8; RUN_BYTES];
    let mut run_b = vec![0u8; RUN_BYTES];
    let mut frame_b = vec![0u8; RUN_BYTES];
    let mut img_c: [ThreadImage; 0] = [];
    let mut img_b: [ThreadImage; 0] = [];
    let mut current = GenerationReader::open(
        Cursor::new(slot.meta),
        Some(Cursor::new(slot.bytes)),
        &mut img_c,
        Some(ReaderScratch {
            run: &mut run_c,
            frame: &mut frame_c,
        }),
    )?;
    let mut base_r = GenerationReader::open(
        Cursor::new(base.meta),
        Some(Cursor::new(base.bytes)),
        &mut img_b,
        Some(ReaderScratch {
            run: &mut run_b,
            frame: &mut frame_b,
        }),
    )?;

    let mut dst = FakeMem::new(0xee);
    let mut codec = Decompress::new(false);
    let mut stats = OpStats::default();
    restore_pages(
        &mut current,
        Some(&mut base_r),
        None,
        SyncInfo::default(),
        &mut dst,
        &mut NoLayout,
        &mut codec,
        &mut stats,
    )?;
    assert_eq!(dst.data, expected);
    assert_eq!(dst.page(1), &original[PAGE_SIZE..2 * PAGE_SIZE]);
    assert_eq!(stats.pages_restored, PAGES as u64);
    assert_eq!(stats.pages_skipped, 0);
    Ok(())
}

#[test]
fn unchanged_parent_gives_empty_second_save() -> Result<()> {
    let mut mem = initial_memory();
    let _base = write_base(&mut mem)?;
    let mut fresh: Baseline<'_, '_, Mem> = Baseline::FreshBase;
    let first = write_gen(&slot_header(0, 2, 1, 1), &mut mem, &mut fresh, true)?;
    mem.clear_dirty();

    let mut images: [ThreadImage; 0] = [];
    let mut parent: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(first.meta.clone()), &mut images)?;
    let mut baseline = Baseline::Parent {
        reader: &mut parent,
        is_base: false,
    };
    let second = write_gen(&slot_header(1, 3, 1, 2), &mut mem, &mut baseline, true)?;
    assert!(second.bytes.is_empty());
    assert_eq!(second.stats.pages_unchanged, PAGES as u64);

    // а грязная страница от не-base родителя пишется целиком
    mem.dirty[1] = true;
    let mut images: [ThreadImage; 0] = [];
    let mut parent: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(first.meta), &mut images)?;
    let mut baseline = Baseline::Parent {
        reader: &mut parent,
        is_base: false,
    };
    let third = write_gen(&slot_header(1, 4, 1, 2), &mut mem, &mut baseline, false)?;
    assert_eq!(
        flags_of(&third)?,
        vec![PageStatus::Unchanged, PageStatus::Raw, PageStatus::Unchanged]
    );
    Ok(())
}

#[test]
fn reload_of_last_synced_generation_skips_clean_pages() -> Result<()> {
    let mut mem = initial_memory();
    let base = write_base(&mut mem)?;
    let mut fresh: Baseline<'_, '_, Mem> = Baseline::FreshBase;
    let slot = write_gen(&slot_header(0, 2, 1, 1), &mut mem, &mut fresh, true)?;
    mem.clear_dirty();
    // только стр.2 тронута после save
    mem.page_mut(2).fill(0x11);
    mem.dirty[2] = true;

    let mut run_c = vec![0u8; RUN_BYTES];
    let mut frame_c = vec![0u8; RUN_BYTES];
    let mut run_b = vec![0u8; RUN_BYTES];
    let mut frame_b = vec![0u8; RUN_BYTES];
    let (mut img_c, mut img_b, mut img_l): ([ThreadImage; 0], [ThreadImage; 0], [ThreadImage; 0]) =
        ([], [], []);
    let mut current = GenerationReader::open(
        Cursor::new(slot.meta.clone()),
        Some(Cursor::new(slot.bytes)),
        &mut img_c,
        Some(ReaderScratch {
            run: &mut run_c,
            frame: &mut frame_c,
        }),
    )?;
    let mut base_r = GenerationReader::open(
        Cursor::new(base.meta),
        Some(Cursor::new(base.bytes)),
        &mut img_b,
        Some(ReaderScratch {
            run: &mut run_b,
            frame: &mut frame_b,
        }),
    )?;
    let mut last: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(slot.meta), &mut img_l)?;

    let mut codec = Decompress::new(false);
    let mut stats = OpStats::default();
    restore_pages(
        &mut current,
        Some(&mut base_r),
        Some(&mut last),
        SyncInfo {
            same_generation: true,
            last_is_base: false,
            soft_dirty: true,
        },
        &mut mem,
        &mut NoLayout,
        &mut codec,
        &mut stats,
    )?;
    assert_eq!(stats.pages_skipped, 2);
    assert_eq!(stats.pages_restored, 1);

    let fresh_mem = initial_memory();
    assert_eq!(mem.data, fresh_mem.data);
    Ok(())
}

#[test]
fn without_soft_dirty_every_page_is_reloaded() -> Result<()> {
    let mut mem = initial_memory();
    let base = write_base(&mut mem)?;
    mem.clear_dirty();

    let mut run = vec![0u8; RUN_BYTES];
    let mut frame = vec![0u8; RUN_BYTES];
    let mut img: [ThreadImage; 0] = [];
    let mut current = GenerationReader::open(
        Cursor::new(base.meta),
        Some(Cursor::new(base.bytes)),
        &mut img,
        Some(ReaderScratch {
            run: &mut run,
            frame: &mut frame,
        }),
    )?;
    let mut codec = Decompress::new(false);
    let mut stats = OpStats::default();
    restore_pages(
        &mut current,
        None,
        None,
        SyncInfo {
            same_generation: true,
            last_is_base: true,
            soft_dirty: false,
        },
        &mut mem,
        &mut NoLayout,
        &mut codec,
        &mut stats,
    )?;
    assert_eq!(stats.pages_skipped, 0);
    assert_eq!(stats.pages_restored, PAGES as u64);
    Ok(())
}

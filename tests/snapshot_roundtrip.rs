// tests/snapshot_roundtrip.rs
//
// Запуск только этого файла:
//   cargo test --test snapshot_roundtrip -- --nocapture
//
// Покрываем (поддельная память вместо процесса):
// 1) Полное поколение: Raw/Compressed/Zero/NoPage, запись → чтение → restore_pages
//    восстанавливает каждую сохранённую страницу байт в байт.
// 2) NoPage-страницы возвращаются ядру одним склеенным discard.
// 3) Хеши областей: verify_restored_areas = 0 после restore и ловит порчу.
// 4) Skip-области пишут только запись, без флагов и байт.
// 5) Нечитаемая область сохраняет только раскладку (все страницы NoPage).

use std::io::{self, Cursor};

use anyhow::Result;
use flate2::{Compress, Compression, Decompress};

use SnapRewind::area::{AreaProps, MemoryArea, PageStatus};
use SnapRewind::consts::{FRAME_HDR_SIZE, PAGE_SIZE, RUN_BYTES};
use SnapRewind::metrics::OpStats;
use SnapRewind::pagemap::{PageInfo, PageSource, PageTarget};
use SnapRewind::restore::{restore_pages, verify_restored_areas, SyncInfo};
use SnapRewind::snapshot::{
    Baseline, GenHeader, GenerationKind, GenerationReader, ReaderScratch, SnapshotWriter,
    ThreadImage, WriterOptions, WriterScratch,
};
use SnapRewind::space::AddressSpaceOps;

type Mem = Cursor<Vec<u8>>;

/// Плоская «память» с адреса `start`, резидентность и dirty по страницам.
struct FakeMem {
    start: usize,
    data: Vec<u8>,
    present: Vec<bool>,
    dirty: Vec<bool>,
    discarded: Vec<(usize, usize)>,
}

impl FakeMem {
    fn new(start: usize, pages: usize, fill: u8) -> Self {
        Self {
            start,
            data: vec![fill; pages * PAGE_SIZE],
            present: vec![true; pages],
            dirty: vec![true; pages],
            discarded: Vec::new(),
        }
    }

    fn page(&self, idx: usize) -> &[u8] {
        &self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
    }

    fn page_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.data[idx * PAGE_SIZE..(idx + 1) * PAGE_SIZE]
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
        self.discarded.push((addr, len));
        self.pages_mut(addr, len).fill(0);
        Ok(())
    }
}

/// Восстановление байт не трогает раскладку; считаем только mprotect.
#[derive(Default)]
struct NoLayout {
    protects: Vec<(usize, usize, i32)>,
}

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
    fn protect(&mut self, start: usize, len: usize, prot: i32) -> io::Result<()> {
        self.protects.push((start, len, prot));
        Ok(())
    }
    fn backing_len(&mut self, _area: &MemoryArea) -> Option<u64> {
        None
    }
}

fn random_page(rng: &mut oorandom::Rand64, out: &mut [u8]) {
    for chunk in out.chunks_mut(8) {
        chunk.copy_from_slice(&rng.rand_u64().to_le_bytes());
    }
}

fn write_full(
    areas: &[MemoryArea],
    mem: &mut FakeMem,
    compression: bool,
    hashing: bool,
) -> Result<(Vec<u8>, Vec<u8>, OpStats)> {
    let header = GenHeader::new(GenerationKind::Slot(0), 0xfeed, 1);
    let mut comp_in = vec![0u8; RUN_BYTES];
    let mut comp_out = vec![0u8; RUN_BYTES + FRAME_HDR_SIZE + PAGE_SIZE];
    let mut codec = Compress::new(Compression::fast(), false);
    let mut w = SnapshotWriter::new(
        Vec::new(),
        Vec::new(),
        &header,
        &[],
        Some(&mut codec),
        WriterScratch {
            comp_in: &mut comp_in,
            comp_out: &mut comp_out,
        },
        WriterOptions {
            compression,
            hashing,
        },
    )?;
    let mut baseline: Baseline<'_, '_, Mem> = Baseline::Full;
    for a in areas {
        w.write_area(a, mem, &mut baseline)?;
    }
    Ok(w.finish_save(&*mem)?)
}

const START: usize = 0x10_0000;

/// 8 страниц: 0-1 случайные, 2 нулевая, 3 нерезидентная, 4-7 хорошо сжимаемые.
fn sample_memory() -> FakeMem {
    let mut rng = oorandom::Rand64::new(0x5eed);
    let mut mem = FakeMem::new(START, 8, 0);
    random_page(&mut rng, mem.page_mut(0));
    random_page(&mut rng, mem.page_mut(1));
    mem.present[3] = false;
    for i in 4..8 {
        for (j, b) in mem.page_mut(i).iter_mut().enumerate() {
            *b = ((i * 7 + j / 64) % 13) as u8 + 1;
        }
    }
    mem
}

fn roundtrip(compression: bool) -> Result<()> {
    let area = MemoryArea::anon_rw(START, START + 8 * PAGE_SIZE);
    let mut src = sample_memory();
    let (meta, bytes, stats) = write_full(&[area], &mut src, compression, true)?;

    assert_eq!(stats.pages_zero, 1);
    assert_eq!(stats.pages_no_page, 1);
    if compression {
        // случайные страницы не сжимаются и уходят Raw
        assert_eq!(stats.pages_raw, 2);
        assert_eq!(stats.pages_compressed, 4);
        assert!(stats.payload_bytes < 6 * PAGE_SIZE as u64);
    } else {
        assert_eq!(stats.pages_raw, 6);
        assert_eq!(stats.payload_bytes, 6 * PAGE_SIZE as u64);
    }
    assert_eq!(bytes.len() as u64, stats.payload_bytes);

    let mut run = vec![0u8; RUN_BYTES];
    let mut frame = vec![0u8; RUN_BYTES];
    let mut images: [ThreadImage; 0] = [];
    let mut reader = GenerationReader::open(
        Cursor::new(meta),
        Some(Cursor::new(bytes)),
        &mut images,
        Some(ReaderScratch {
            run: &mut run,
            frame: &mut frame,
        }),
    )?;
    assert_eq!(reader.header().generation, 1);

    // цель: мусор, всё резидентно
    let mut dst = FakeMem::new(START, 8, 0xee);
    let mut layout = NoLayout::default();
    let mut codec = Decompress::new(false);
    let mut load_stats = OpStats::default();
    restore_pages(
        &mut reader,
        None,
        None,
        SyncInfo::default(),
        &mut dst,
        &mut layout,
        &mut codec,
        &mut load_stats,
    )?;

    for i in [0usize, 1, 2, 4, 5, 6, 7] {
        assert_eq!(dst.page(i), src.page(i), "page {} differs after restore", i);
    }
    assert_eq!(dst.discarded, vec![(START + 3 * PAGE_SIZE, PAGE_SIZE)]);
    assert_eq!(layout.protects, vec![(START, 8 * PAGE_SIZE, area.prot)]);
    assert_eq!(load_stats.pages_restored, 8);

    let bad = verify_restored_areas(&mut reader, &dst, |a| {
        panic!("unexpected mismatch in {:?}", a)
    })?;
    assert_eq!(bad, 0);

    dst.page_mut(5)[100] ^= 0xff;
    let mut hits = Vec::new();
    let bad = verify_restored_areas(&mut reader, &dst, |a| hits.push(a.start))?;
    assert_eq!(bad, 1);
    assert_eq!(hits, vec![START]);
    Ok(())
}

#[test]
fn full_generation_roundtrip_compressed() -> Result<()> {
    roundtrip(true)
}

#[test]
fn full_generation_roundtrip_raw() -> Result<()> {
    roundtrip(false)
}

#[test]
fn skip_and_unreadable_areas_keep_only_layout() -> Result<()> {
    let mut mem = sample_memory();
    let mut skip = MemoryArea::anon_rw(START, START + 2 * PAGE_SIZE);
    skip.props.set(AreaProps::SKIP, true);
    let none = MemoryArea::new(START + 4 * PAGE_SIZE, START + 8 * PAGE_SIZE, libc::PROT_NONE);

    let (meta, bytes, stats) = write_full(&[skip, none], &mut mem, true, false)?;
    assert!(bytes.is_empty(), "no payload expected");
    assert_eq!(stats.pages_no_page, 4);
    assert_eq!(stats.pages_total(), 4);

    let mut images: [ThreadImage; 0] = [];
    let mut r: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(meta), &mut images)?;
    let a = r.next_area()?.expect("skip area");
    assert!(a.is_skip());
    assert_eq!(r.get_page_flag(START)?, None, "skip areas carry no flags");

    let b = r.next_area()?.expect("PROT_NONE area");
    assert_eq!(b.prot, libc::PROT_NONE);
    for i in 0..4 {
        assert_eq!(
            r.get_page_flag(b.start + i * PAGE_SIZE)?,
            Some(PageStatus::NoPage)
        );
    }
    assert_eq!(r.area_hash()?, 0, "hashing was off");
    assert!(r.next_area()?.is_none());
    Ok(())
}

#[test]
fn flags_are_read_in_address_order_only() -> Result<()> {
    let area = MemoryArea::anon_rw(START, START + 8 * PAGE_SIZE);
    let mut mem = sample_memory();
    let (meta, _bytes, _) = write_full(&[area], &mut mem, false, false)?;

    let mut images: [ThreadImage; 0] = [];
    let mut r: GenerationReader<'_, Mem> =
        GenerationReader::open_flags_only(Cursor::new(meta), &mut images)?;
    assert_eq!(r.get_page_flag(START + 2 * PAGE_SIZE)?, Some(PageStatus::Zero));
    assert_eq!(r.get_page_flag(START + 3 * PAGE_SIZE)?, Some(PageStatus::NoPage));
    // назад нельзя
    assert!(r.get_page_flag(START).is_err());
    r.restart()?;
    assert_eq!(r.get_page_flag(START)?, Some(PageStatus::Raw));
    // за последней областью флагов нет
    assert_eq!(r.get_page_flag(START + 64 * PAGE_SIZE)?, None);
    Ok(())
}

// src/snapshot/writer.rs: запись поколения (metadata + bytes)
//
// Metadata-поток:
//   заголовок (header.rs)
//   для каждой области: запись (area.rs), затем для не-skip:
//     u8 × pages  : PageStatus на страницу
//     u64         : xxhash64 содержимого (0 если хеширование выключено)
//   sentinel (64 нулевых байта)
//
// Bytes-поток: Raw-страницы по 4 KiB подряд либо deflate-фреймы
//   [clen u32][pages u32][raw deflate payload]  (до RUN_PAGES страниц во фрейме)
// Позиция первой страницы области: bytes_offset в её записи.
//
// Без аллокаций: флаги копятся в массиве на стеке, серия для сжатия копируется
// в comp_in (reserved memory), выход deflate: в comp_out. Флаги серии остаются в
// буфере до её сброса: если фрейм не сжался, они переписываются на Raw.

use std::io::{self, Read, Seek, Write};

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, FlushCompress, Status};

use crate::area::{MemoryArea, PageStatus};
use crate::consts::{
    AREA_NAME_MAX, AREA_REC_SIZE, FLAG_CHUNK, FRAME_HDR_SIZE, PAGE_SIZE, RUN_PAGES,
};
use crate::hash::{is_zero_page, AreaHasher};
use crate::metrics::OpStats;
use crate::pagemap::PageSource;
use crate::snapshot::header::{GenHeader, ThreadImage};
use crate::snapshot::reader::GenerationReader;

/// Буферы сжатия (reserved memory).
pub struct WriterScratch<'s> {
    pub comp_in: &'s mut [u8],
    pub comp_out: &'s mut [u8],
}

/// С чем сравнивать чистые (не soft-dirty) страницы.
pub enum Baseline<'p, 's, R: Read + Seek> {
    /// Ссылок нет: всё содержимое пишется.
    Full,
    /// base записан в этой же заморозке: любая страница с данными совпадает с ним.
    FreshBase,
    /// Флаги последнего синхронизированного поколения.
    Parent {
        reader: &'p mut GenerationReader<'s, R>,
        /// parent сам является base (его Raw/Compressed = «как в base»).
        is_base: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub compression: bool,
    pub hashing: bool,
}

pub struct SnapshotWriter<'w, M: Write, B: Write> {
    meta: M,
    bytes: B,
    bytes_pos: u64,
    codec: Option<&'w mut Compress>,
    scratch: WriterScratch<'w>,
    hashing: bool,

    flags: [u8; FLAG_CHUNK],
    flag_len: usize,

    area: Option<MemoryArea>,
    run_addr: usize,
    run_pages: usize,
    hasher: AreaHasher,
    stats: OpStats,
}

impl<'w, M: Write, B: Write> SnapshotWriter<'w, M, B> {
    /// Начать поколение: заголовок пишется сразу.
    pub fn new(
        mut meta: M,
        bytes: B,
        header: &GenHeader,
        images: &[ThreadImage],
        codec: Option<&'w mut Compress>,
        scratch: WriterScratch<'w>,
        opts: WriterOptions,
    ) -> io::Result<Self> {
        header.write_to(&mut meta, images)?;
        let codec = if opts.compression { codec } else { None };
        Ok(Self {
            meta,
            bytes,
            bytes_pos: 0,
            codec,
            scratch,
            hashing: opts.hashing,
            flags: [0u8; FLAG_CHUNK],
            flag_len: 0,
            area: None,
            run_addr: 0,
            run_pages: 0,
            hasher: AreaHasher::new(),
            stats: OpStats::default(),
        })
    }

    pub fn stats(&self) -> &OpStats {
        &self.stats
    }

    /// Закрыть предыдущую область и начать новую: запись области пишется сразу,
    /// для skip-областей на этом всё.
    pub fn process_area<S: PageSource>(&mut self, area: &MemoryArea, src: &S) -> io::Result<()> {
        self.end_area(src)?;

        let mut rec = *area;
        rec.bytes_offset = self.bytes_pos;
        let mut buf = [0u8; AREA_REC_SIZE + AREA_NAME_MAX];
        let n = rec.encode(&mut buf);
        self.meta.write_all(&buf[..n])?;

        if !area.is_skip() {
            self.area = Some(rec);
            self.hasher = AreaHasher::new();
            self.run_pages = 0;
        }
        Ok(())
    }

    /// Классифицировать страницу и поставить её в очередь записи.
    /// Ровно один флаг на страницу.
    pub fn queue_page_save<S: PageSource, R: Read + Seek>(
        &mut self,
        addr: usize,
        src: &mut S,
        baseline: &mut Baseline<'_, '_, R>,
    ) -> io::Result<PageStatus> {
        let area = match &self.area {
            Some(a) if a.contains(addr) => *a,
            _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        };
        let info = src.page_info(addr)?;

        // нечитаемые области (PROT_NONE и т.п.) сохраняют только раскладку
        if !info.present || !area.is_readable() {
            self.stats.pages_no_page += 1;
            self.put_flag(PageStatus::NoPage, src)?;
            return Ok(PageStatus::NoPage);
        }

        // хешируются ровно те страницы, что после load не будут NoPage
        let page = src.bytes(addr, PAGE_SIZE);
        if is_zero_page(page) {
            if self.hashing {
                self.hasher.page(page);
            }
            self.stats.pages_zero += 1;
            self.put_flag(PageStatus::Zero, src)?;
            return Ok(PageStatus::Zero);
        }

        let reuse = match baseline {
            Baseline::Full => None,
            Baseline::FreshBase => Some(PageStatus::Unchanged),
            Baseline::Parent { reader, is_base } => {
                if info.soft_dirty {
                    None
                } else {
                    match reader.get_page_flag(addr)? {
                        Some(PageStatus::Unchanged) => Some(PageStatus::Unchanged),
                        Some(PageStatus::NoPage) => Some(PageStatus::NoPage),
                        Some(PageStatus::Raw | PageStatus::CompressedRun) if *is_base => {
                            Some(PageStatus::Unchanged)
                        }
                        _ => None,
                    }
                }
            }
        };
        if reuse != Some(PageStatus::NoPage) && self.hashing {
            self.hasher.page(page);
        }
        if let Some(st) = reuse {
            match st {
                PageStatus::NoPage => self.stats.pages_no_page += 1,
                _ => self.stats.pages_unchanged += 1,
            }
            self.put_flag(st, src)?;
            return Ok(st);
        }

        self.queue_data_page(addr, src)
    }

    /// Страница с байтами: в сжимаемую серию или в серию Raw.
    fn queue_data_page<S: PageSource>(&mut self, addr: usize, src: &S) -> io::Result<PageStatus> {
        let adjacent = self.run_pages > 0 && self.run_addr + self.run_pages * PAGE_SIZE == addr;
        if self.codec.is_some() {
            if self.run_pages > 0 && (!adjacent || self.run_pages == RUN_PAGES) {
                self.flush_compressed_save()?;
            }
            if self.run_pages == 0 {
                // флаги серии не должны уйти в поток до её сброса
                if self.flag_len + RUN_PAGES > FLAG_CHUNK {
                    self.flush_flags()?;
                }
                self.run_addr = addr;
            }
            let off = self.run_pages * PAGE_SIZE;
            self.scratch.comp_in[off..off + PAGE_SIZE].copy_from_slice(src.bytes(addr, PAGE_SIZE));
            self.run_pages += 1;
            self.push_flag(PageStatus::CompressedRun)?;
            Ok(PageStatus::CompressedRun)
        } else {
            if self.run_pages > 0 && !adjacent {
                self.flush_save(src)?;
            }
            if self.run_pages == 0 {
                self.run_addr = addr;
            }
            self.run_pages += 1;
            self.push_flag(PageStatus::Raw)?;
            Ok(PageStatus::Raw)
        }
    }

    /// Флаг страницы без байт: сначала закрываем открытую серию.
    fn put_flag<S: PageSource>(&mut self, st: PageStatus, src: &S) -> io::Result<()> {
        if self.run_pages > 0 {
            self.flush_save(src)?;
        }
        self.push_flag(st)
    }

    fn push_flag(&mut self, st: PageStatus) -> io::Result<()> {
        if self.flag_len == FLAG_CHUNK {
            self.flush_flags()?;
        }
        self.flags[self.flag_len] = st.to_u8();
        self.flag_len += 1;
        Ok(())
    }

    fn flush_flags(&mut self) -> io::Result<()> {
        if self.flag_len > 0 {
            self.meta.write_all(&self.flags[..self.flag_len])?;
            self.flag_len = 0;
        }
        Ok(())
    }

    /// Сбросить открытую серию (сжатую или Raw).
    pub fn flush_save<S: PageSource>(&mut self, src: &S) -> io::Result<()> {
        if self.run_pages == 0 {
            return Ok(());
        }
        if self.codec.is_some() {
            return self.flush_compressed_save();
        }
        let len = self.run_pages * PAGE_SIZE;
        self.bytes.write_all(src.bytes(self.run_addr, len))?;
        self.bytes_pos += len as u64;
        self.stats.pages_raw += self.run_pages as u64;
        self.stats.payload_bytes += len as u64;
        self.run_pages = 0;
        Ok(())
    }

    /// Сжать накопленную серию одним фреймом; если не сжалась: записать как Raw.
    pub fn flush_compressed_save(&mut self) -> io::Result<()> {
        let n = self.run_pages;
        if n == 0 {
            return Ok(());
        }
        self.run_pages = 0;
        let raw_len = n * PAGE_SIZE;
        let input = &self.scratch.comp_in[..raw_len];

        let mut clen = usize::MAX;
        if let Some(codec) = self.codec.as_deref_mut() {
            codec.reset();
            let out = &mut self.scratch.comp_out[FRAME_HDR_SIZE..];
            if let Ok(Status::StreamEnd) = codec.compress(input, out, FlushCompress::Finish) {
                clen = codec.total_out() as usize;
            }
        }

        if clen < raw_len {
            LittleEndian::write_u32(&mut self.scratch.comp_out[0..4], clen as u32);
            LittleEndian::write_u32(&mut self.scratch.comp_out[4..8], n as u32);
            let frame = FRAME_HDR_SIZE + clen;
            self.bytes.write_all(&self.scratch.comp_out[..frame])?;
            self.bytes_pos += frame as u64;
            self.stats.pages_compressed += n as u64;
            self.stats.payload_bytes += frame as u64;
        } else {
            for f in &mut self.flags[self.flag_len - n..self.flag_len] {
                *f = PageStatus::Raw.to_u8();
            }
            self.bytes.write_all(input)?;
            self.bytes_pos += raw_len as u64;
            self.stats.pages_raw += n as u64;
            self.stats.payload_bytes += raw_len as u64;
        }
        Ok(())
    }

    fn end_area<S: PageSource>(&mut self, src: &S) -> io::Result<()> {
        if self.area.take().is_none() {
            return Ok(());
        }
        self.flush_save(src)?;
        self.flush_flags()?;
        let hash = if self.hashing { self.hasher.finish() } else { 0 };
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, hash);
        self.meta.write_all(&b)
    }

    /// Записать область целиком: запись + по флагу на каждую страницу.
    pub fn write_area<S: PageSource, R: Read + Seek>(
        &mut self,
        area: &MemoryArea,
        src: &mut S,
        baseline: &mut Baseline<'_, '_, R>,
    ) -> io::Result<()> {
        self.process_area(area, src)?;
        if area.is_skip() {
            return Ok(());
        }
        let mut addr = area.start;
        while addr < area.end {
            self.queue_page_save(addr, src, baseline)?;
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    /// Завершить поколение: последняя область, sentinel, flush обоих потоков.
    pub fn finish_save<S: PageSource>(mut self, src: &S) -> io::Result<(M, B, OpStats)> {
        self.end_area(src)?;
        self.meta.write_all(&MemoryArea::SENTINEL)?;
        self.meta.flush()?;
        self.bytes.flush()?;
        Ok((self.meta, self.bytes, self.stats))
    }
}

//! Потоковое чтение одного поколения.
//!
//! Курсор монотонный: области и страницы посещаются по возрастанию адресов.
//! - get_page_flag(addr): флаг страницы (None, если addr не покрыт сохранённой областью);
//!   пропущенные по дороге страницы учитываются в позиции bytes-потока;
//! - get_page / skip_page / queue_page_load: «потребляют» страницу;
//! - queue_page_load склеивает соседние Raw-страницы в одно чтение прямо в целевую
//!   память, finish_load дочитывает хвост;
//! - next_area / restart: обход записей областей.
//!
//! Flags-only режим (без bytes-файла) нужен для parent/last-synced поколений: от них
//! требуются только флаги.
//!
//! Сжатые серии: заголовок фрейма читается лениво (при первой странице серии),
//! распаковка: только если страницу действительно грузят. Буферы распаковки
//! приходят снаружи (reserved memory), Decompress: аргументом методов: один
//! контекст на несколько reader'ов.

use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Decompress, FlushDecompress, Status};

use crate::area::{MemoryArea, PageStatus};
use crate::consts::{AREA_HASH_SIZE, FLAG_CHUNK, FRAME_HDR_SIZE, PAGE_SIZE, RUN_PAGES};
use crate::error::invalid_data;
use crate::pagemap::PageTarget;
use crate::snapshot::header::{GenHeader, ThreadImage};

/// Буферы для сжатых серий: распакованные страницы и сжатый фрейм.
pub struct ReaderScratch<'s> {
    pub run: &'s mut [u8],
    pub frame: &'s mut [u8],
}

#[derive(Debug, Clone, Copy, Default)]
struct RunState {
    /// Сколько страниц текущего фрейма ещё не потреблено.
    remaining: u32,
    loaded: bool,
    frame_pos: u64,
    clen: u32,
    pages: u32,
    /// Индекс последней потреблённой страницы внутри фрейма.
    index: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    addr: usize,
    len: usize,
    file_pos: u64,
}

pub struct GenerationReader<'s, R: Read + Seek> {
    meta: R,
    bytes: Option<R>,
    header: GenHeader,
    records_start: u64,
    meta_pos: u64,

    area: Option<MemoryArea>,
    finished: bool,
    flags_start: u64,
    next_page: usize,
    chunk: [u8; FLAG_CHUNK],
    chunk_first: usize,
    chunk_len: usize,

    byte_pos: u64,
    bytes_file_pos: u64,
    run: RunState,
    pending: Option<PendingLoad>,
    scratch: Option<ReaderScratch<'s>>,
}

fn seek_to<R: Seek>(r: &mut R, cur: &mut u64, want: u64) -> io::Result<()> {
    if *cur != want {
        r.seek(SeekFrom::Start(want))?;
        *cur = want;
    }
    Ok(())
}

impl<'s, R: Read + Seek> GenerationReader<'s, R> {
    /// Открыть поколение: читает и проверяет заголовок, образы потоков кладёт в `images`.
    pub fn open(
        mut meta: R,
        bytes: Option<R>,
        images: &mut [ThreadImage],
        scratch: Option<ReaderScratch<'s>>,
    ) -> io::Result<Self> {
        meta.seek(SeekFrom::Start(0))?;
        let header = GenHeader::read_from(&mut meta, images)?;
        let records_start = GenHeader::encoded_len(header.thread_count as usize) as u64;
        Ok(Self {
            meta,
            bytes,
            header,
            records_start,
            meta_pos: records_start,
            area: None,
            finished: false,
            flags_start: 0,
            next_page: 0,
            chunk: [0u8; FLAG_CHUNK],
            chunk_first: 0,
            chunk_len: 0,
            byte_pos: 0,
            bytes_file_pos: u64::MAX,
            run: RunState::default(),
            pending: None,
            scratch,
        })
    }

    /// Только флаги (без bytes-файла).
    pub fn open_flags_only(meta: R, images: &mut [ThreadImage]) -> io::Result<Self> {
        Self::open(meta, None, images, None)
    }

    #[inline]
    pub fn header(&self) -> &GenHeader {
        &self.header
    }

    #[inline]
    pub fn current_area(&self) -> Option<&MemoryArea> {
        self.area.as_ref()
    }

    pub fn is_flags_only(&self) -> bool {
        self.bytes.is_none()
    }

    /// Следующая запись области; None: достигнут sentinel.
    pub fn next_area(&mut self) -> io::Result<Option<MemoryArea>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(a) = self.area.take() {
            if !a.is_skip() {
                let end = self.flags_start + a.pages() as u64 + AREA_HASH_SIZE as u64;
                seek_to(&mut self.meta, &mut self.meta_pos, end)?;
            }
        }
        self.run = RunState::default();
        self.chunk_len = 0;
        self.next_page = 0;

        match MemoryArea::decode(&mut self.meta)? {
            None => {
                self.finished = true;
                self.meta_pos = self.meta.stream_position()?;
                Ok(None)
            }
            Some(a) => {
                self.meta_pos = self.meta.stream_position()?;
                self.flags_start = self.meta_pos;
                self.byte_pos = a.bytes_offset;
                self.area = Some(a);
                Ok(Some(a))
            }
        }
    }

    /// Вернуться к первой записи области.
    pub fn restart(&mut self) -> io::Result<()> {
        debug_assert!(self.pending.is_none(), "restart with queued loads");
        self.meta.seek(SeekFrom::Start(self.records_start))?;
        self.meta_pos = self.records_start;
        self.area = None;
        self.finished = false;
        self.run = RunState::default();
        self.chunk_len = 0;
        self.next_page = 0;
        Ok(())
    }

    /// Хеш содержимого текущей области (0: не считался).
    pub fn area_hash(&mut self) -> io::Result<u64> {
        let a = match self.area {
            Some(a) if !a.is_skip() => a,
            _ => return Ok(0),
        };
        let pos = self.flags_start + a.pages() as u64;
        seek_to(&mut self.meta, &mut self.meta_pos, pos)?;
        let mut b = [0u8; AREA_HASH_SIZE];
        self.meta.read_exact(&mut b)?;
        self.meta_pos += AREA_HASH_SIZE as u64;
        Ok(LittleEndian::read_u64(&b))
    }

    fn flag_at(&mut self, idx: usize, pages: usize) -> io::Result<PageStatus> {
        if idx < self.chunk_first || idx >= self.chunk_first + self.chunk_len {
            let n = (pages - idx).min(FLAG_CHUNK);
            seek_to(&mut self.meta, &mut self.meta_pos, self.flags_start + idx as u64)?;
            self.meta.read_exact(&mut self.chunk[..n])?;
            self.meta_pos += n as u64;
            self.chunk_first = idx;
            self.chunk_len = n;
        }
        PageStatus::from_u8(self.chunk[idx - self.chunk_first]).ok_or_else(invalid_data)
    }

    /// Флаг страницы по адресу. Адреса должны идти по неубыванию.
    pub fn get_page_flag(&mut self, addr: usize) -> io::Result<Option<PageStatus>> {
        loop {
            let a = match self.area {
                Some(a) => a,
                None if self.finished => return Ok(None),
                None => {
                    if self.next_area()?.is_none() {
                        return Ok(None);
                    }
                    continue;
                }
            };
            if addr >= a.end {
                if self.next_area()?.is_none() {
                    return Ok(None);
                }
                continue;
            }
            if addr < a.start || a.is_skip() {
                return Ok(None);
            }
            let idx = (addr - a.start) / PAGE_SIZE;
            if idx < self.next_page {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            let pages = a.pages();
            while self.next_page < idx {
                let f = self.flag_at(self.next_page, pages)?;
                self.skip_payload(f)?;
                self.next_page += 1;
            }
            return self.flag_at(idx, pages).map(Some);
        }
    }

    /// Учесть страницу без чтения её байт.
    fn skip_payload(&mut self, flag: PageStatus) -> io::Result<()> {
        if self.bytes.is_none() {
            return Ok(());
        }
        match flag {
            PageStatus::Raw => self.byte_pos += PAGE_SIZE as u64,
            PageStatus::CompressedRun => {
                self.advance_run()?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Перейти к следующей странице сжатой серии, при необходимости прочитав
    /// заголовок нового фрейма. Возвращает индекс страницы во фрейме.
    fn advance_run(&mut self) -> io::Result<u32> {
        if self.run.remaining == 0 {
            let bytes = self.bytes.as_mut().ok_or_else(invalid_data)?;
            seek_to(bytes, &mut self.bytes_file_pos, self.byte_pos)?;
            let mut hdr = [0u8; FRAME_HDR_SIZE];
            bytes.read_exact(&mut hdr)?;
            self.bytes_file_pos += FRAME_HDR_SIZE as u64;
            let clen = LittleEndian::read_u32(&hdr[0..4]);
            let pages = LittleEndian::read_u32(&hdr[4..8]);
            if pages == 0
                || pages as usize > RUN_PAGES
                || clen as usize >= pages as usize * PAGE_SIZE
            {
                return Err(invalid_data());
            }
            self.run = RunState {
                remaining: pages,
                loaded: false,
                frame_pos: self.byte_pos,
                clen,
                pages,
                index: 0,
            };
            self.byte_pos += FRAME_HDR_SIZE as u64 + clen as u64;
        }
        self.run.index = self.run.pages - self.run.remaining;
        self.run.remaining -= 1;
        Ok(self.run.index)
    }

    fn load_run(&mut self, codec: &mut Decompress) -> io::Result<()> {
        if self.run.loaded {
            return Ok(());
        }
        let bytes = self.bytes.as_mut().ok_or_else(invalid_data)?;
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let clen = self.run.clen as usize;
        let out_len = self.run.pages as usize * PAGE_SIZE;
        if clen > scratch.frame.len() || out_len > scratch.run.len() {
            return Err(invalid_data());
        }
        seek_to(
            bytes,
            &mut self.bytes_file_pos,
            self.run.frame_pos + FRAME_HDR_SIZE as u64,
        )?;
        bytes.read_exact(&mut scratch.frame[..clen])?;
        self.bytes_file_pos += clen as u64;

        codec.reset(false);
        let st = codec
            .decompress(
                &scratch.frame[..clen],
                &mut scratch.run[..out_len],
                FlushDecompress::Finish,
            )
            .map_err(|_| invalid_data())?;
        if st != Status::StreamEnd || codec.total_out() != out_len as u64 {
            return Err(invalid_data());
        }
        self.run.loaded = true;
        Ok(())
    }

    fn run_page(&self) -> &[u8] {
        let off = self.run.index as usize * PAGE_SIZE;
        match &self.scratch {
            Some(s) => &s.run[off..off + PAGE_SIZE],
            None => &[],
        }
    }

    fn expect_flag(&mut self, addr: usize) -> io::Result<PageStatus> {
        self.get_page_flag(addr)?.ok_or_else(invalid_data)
    }

    /// Скопировать байты страницы (Raw или из сжатой серии) в `out`.
    pub fn get_page(
        &mut self,
        addr: usize,
        out: &mut [u8],
        codec: &mut Decompress,
    ) -> io::Result<()> {
        match self.expect_flag(addr)? {
            PageStatus::Raw => {
                let bytes = self.bytes.as_mut().ok_or_else(invalid_data)?;
                seek_to(bytes, &mut self.bytes_file_pos, self.byte_pos)?;
                bytes.read_exact(&mut out[..PAGE_SIZE])?;
                self.bytes_file_pos += PAGE_SIZE as u64;
                self.byte_pos += PAGE_SIZE as u64;
            }
            PageStatus::CompressedRun => {
                self.advance_run()?;
                self.load_run(codec)?;
                out[..PAGE_SIZE].copy_from_slice(self.run_page());
            }
            _ => return Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
        self.next_page += 1;
        Ok(())
    }

    /// Позиция Raw-страницы в bytes-файле (страница потребляется).
    /// Для прочих флагов: None, курсор не двигается.
    pub fn get_page_stream(&mut self, addr: usize) -> io::Result<Option<u64>> {
        match self.get_page_flag(addr)? {
            Some(PageStatus::Raw) if self.bytes.is_some() => {
                let pos = self.byte_pos;
                self.byte_pos += PAGE_SIZE as u64;
                self.next_page += 1;
                Ok(Some(pos))
            }
            _ => Ok(None),
        }
    }

    /// Пропустить страницу, не читая байт.
    pub fn skip_page(&mut self, addr: usize) -> io::Result<()> {
        if let Some(f) = self.get_page_flag(addr)? {
            self.skip_payload(f)?;
            self.next_page += 1;
        }
        Ok(())
    }

    /// Загрузить страницу в целевую память. Соседние Raw-страницы копятся и
    /// читаются одним read; обязательно завершать finish_load.
    pub fn queue_page_load<T: PageTarget>(
        &mut self,
        addr: usize,
        target: &mut T,
        codec: &mut Decompress,
    ) -> io::Result<()> {
        match self.expect_flag(addr)? {
            PageStatus::Raw => {
                if self.bytes.is_none() {
                    return Err(invalid_data());
                }
                let file_pos = self.byte_pos;
                self.byte_pos += PAGE_SIZE as u64;
                self.next_page += 1;
                let adjacent = matches!(self.pending, Some(p)
                    if p.addr + p.len == addr && p.file_pos + p.len as u64 == file_pos);
                if adjacent {
                    if let Some(p) = self.pending.as_mut() {
                        p.len += PAGE_SIZE;
                    }
                } else {
                    self.finish_load(target)?;
                    self.pending = Some(PendingLoad {
                        addr,
                        len: PAGE_SIZE,
                        file_pos,
                    });
                }
                Ok(())
            }
            PageStatus::CompressedRun => {
                self.advance_run()?;
                self.load_run(codec)?;
                let page = self.run_page();
                target.pages_mut(addr, PAGE_SIZE).copy_from_slice(page);
                self.next_page += 1;
                Ok(())
            }
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    /// Дочитать накопленные Raw-страницы.
    pub fn finish_load<T: PageTarget>(&mut self, target: &mut T) -> io::Result<()> {
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        let bytes = self.bytes.as_mut().ok_or_else(invalid_data)?;
        seek_to(bytes, &mut self.bytes_file_pos, p.file_pos)?;
        bytes.read_exact(target.pages_mut(p.addr, p.len))?;
        self.bytes_file_pos += p.len as u64;
        Ok(())
    }
}

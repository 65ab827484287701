// src/snapshot/header.rs: заголовок поколения (metadata-файл)
//
// Формат (LE):
// MAGIC8 "SRSNAP01"
// u32 version
// u32 flags            (bit0 incremental, bit1 compressed)
// u32 kind             (0 = base, 1 = slot)
// u32 slot
// u64 session
// u64 generation
// u64 base_generation  (0 = поколение без base)
// u64 parent_generation
// u64 driver_pthread
// u32 thread_count
// u32 reserved
// thread_count × образ потока (744 байта):
//   i32 tid | u32 state | u64 pthread | u64 stack_base | u64 stack_size
//   u64 fs_base | u64 sigmask | 23×u64 gregs | 512 B fpstate
// u32 crc32 (crc32fast по всему выше)
//
// Запись и чтение идут кусками через стековые буферы: годится для окна заморозки.

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::consts::{
    FPSTATE_SIZE, GEN_FLAG_COMPRESSED, GEN_FLAG_INCREMENTAL, GEN_KIND_BASE, GEN_KIND_SLOT,
    HDR_CRC_SIZE, HDR_FIXED_SIZE, NGREG, SNAP_MAGIC, SNAP_VERSION, THREAD_IMAGE_SIZE,
};
use crate::error::invalid_data;
use crate::thread::context::SavedContext;

/// Какое поколение: общий base сессии или слот.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Base,
    Slot(u32),
}

impl GenerationKind {
    fn code(self) -> (u32, u32) {
        match self {
            GenerationKind::Base => (GEN_KIND_BASE, 0),
            GenerationKind::Slot(s) => (GEN_KIND_SLOT, s),
        }
    }

    fn from_code(kind: u32, slot: u32) -> Option<Self> {
        match kind {
            GEN_KIND_BASE => Some(GenerationKind::Base),
            GEN_KIND_SLOT => Some(GenerationKind::Slot(slot)),
            _ => None,
        }
    }
}

/// Сохранённый поток.
#[derive(Clone, Copy)]
pub struct ThreadImage {
    pub tid: i32,
    /// ThreadState на момент заморозки (до Signaled).
    pub state: u32,
    pub pthread: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    pub context: SavedContext,
}

impl ThreadImage {
    pub const fn empty() -> Self {
        Self {
            tid: 0,
            state: 0,
            pthread: 0,
            stack_base: 0,
            stack_size: 0,
            context: SavedContext::zeroed(),
        }
    }

    fn encode(&self, out: &mut [u8; THREAD_IMAGE_SIZE]) {
        LittleEndian::write_i32(&mut out[0..4], self.tid);
        LittleEndian::write_u32(&mut out[4..8], self.state);
        LittleEndian::write_u64(&mut out[8..16], self.pthread);
        LittleEndian::write_u64(&mut out[16..24], self.stack_base);
        LittleEndian::write_u64(&mut out[24..32], self.stack_size);
        LittleEndian::write_u64(&mut out[32..40], self.context.fs_base);
        LittleEndian::write_u64(&mut out[40..48], self.context.sigmask);
        let regs_end = 48 + NGREG * 8;
        LittleEndian::write_u64_into(&self.context.gregs, &mut out[48..regs_end]);
        out[regs_end..regs_end + FPSTATE_SIZE].copy_from_slice(&self.context.fpstate);
    }

    fn decode(buf: &[u8; THREAD_IMAGE_SIZE]) -> Self {
        let mut img = ThreadImage::empty();
        img.tid = LittleEndian::read_i32(&buf[0..4]);
        img.state = LittleEndian::read_u32(&buf[4..8]);
        img.pthread = LittleEndian::read_u64(&buf[8..16]);
        img.stack_base = LittleEndian::read_u64(&buf[16..24]);
        img.stack_size = LittleEndian::read_u64(&buf[24..32]);
        img.context.fs_base = LittleEndian::read_u64(&buf[32..40]);
        img.context.sigmask = LittleEndian::read_u64(&buf[40..48]);
        let regs_end = 48 + NGREG * 8;
        LittleEndian::read_u64_into(&buf[48..regs_end], &mut img.context.gregs);
        img.context
            .fpstate
            .copy_from_slice(&buf[regs_end..regs_end + FPSTATE_SIZE]);
        img
    }
}

impl std::fmt::Debug for ThreadImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadImage")
            .field("tid", &self.tid)
            .field("state", &self.state)
            .field("pthread", &format_args!("{:#x}", self.pthread))
            .field("ip", &format_args!("{:#x}", self.context.ip()))
            .field("sp", &format_args!("{:#x}", self.context.sp()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenHeader {
    pub flags: u32,
    pub kind: GenerationKind,
    pub session: u64,
    pub generation: u64,
    pub base_generation: u64,
    pub parent_generation: u64,
    pub driver_pthread: u64,
    pub thread_count: u32,
}

impl GenHeader {
    pub fn new(kind: GenerationKind, session: u64, generation: u64) -> Self {
        Self {
            flags: 0,
            kind,
            session,
            generation,
            base_generation: 0,
            parent_generation: 0,
            driver_pthread: 0,
            thread_count: 0,
        }
    }

    #[inline]
    pub fn is_incremental(&self) -> bool {
        self.flags & GEN_FLAG_INCREMENTAL != 0
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & GEN_FLAG_COMPRESSED != 0
    }

    /// Полная длина заголовка вместе с образами и crc.
    pub fn encoded_len(thread_count: usize) -> usize {
        HDR_FIXED_SIZE + thread_count * THREAD_IMAGE_SIZE + HDR_CRC_SIZE
    }

    fn encode_fixed(&self, out: &mut [u8; HDR_FIXED_SIZE]) {
        let (kind, slot) = self.kind.code();
        out[0..8].copy_from_slice(SNAP_MAGIC);
        LittleEndian::write_u32(&mut out[8..12], SNAP_VERSION);
        LittleEndian::write_u32(&mut out[12..16], self.flags);
        LittleEndian::write_u32(&mut out[16..20], kind);
        LittleEndian::write_u32(&mut out[20..24], slot);
        LittleEndian::write_u64(&mut out[24..32], self.session);
        LittleEndian::write_u64(&mut out[32..40], self.generation);
        LittleEndian::write_u64(&mut out[40..48], self.base_generation);
        LittleEndian::write_u64(&mut out[48..56], self.parent_generation);
        LittleEndian::write_u64(&mut out[56..64], self.driver_pthread);
        LittleEndian::write_u32(&mut out[64..68], self.thread_count);
        LittleEndian::write_u32(&mut out[68..72], 0);
    }

    /// Записать заголовок; `images.len()` должно совпадать с thread_count.
    pub fn write_to<W: Write>(&self, w: &mut W, images: &[ThreadImage]) -> io::Result<()> {
        if images.len() != self.thread_count as usize {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut crc = Crc32::new();
        let mut fixed = [0u8; HDR_FIXED_SIZE];
        self.encode_fixed(&mut fixed);
        crc.update(&fixed);
        w.write_all(&fixed)?;

        let mut buf = [0u8; THREAD_IMAGE_SIZE];
        for img in images {
            img.encode(&mut buf);
            crc.update(&buf);
            w.write_all(&buf)?;
        }
        let mut tail = [0u8; HDR_CRC_SIZE];
        LittleEndian::write_u32(&mut tail, crc.finalize());
        w.write_all(&tail)
    }

    /// Прочитать заголовок, образы потоков кладутся в `images[..thread_count]`.
    /// InvalidData: неверный magic/версия/crc; InvalidInput: образов больше, чем места.
    pub fn read_from<R: Read>(r: &mut R, images: &mut [ThreadImage]) -> io::Result<GenHeader> {
        let mut crc = Crc32::new();
        let mut fixed = [0u8; HDR_FIXED_SIZE];
        r.read_exact(&mut fixed)?;
        crc.update(&fixed);
        if &fixed[0..8] != SNAP_MAGIC || LittleEndian::read_u32(&fixed[8..12]) != SNAP_VERSION {
            return Err(invalid_data());
        }
        let kind = GenerationKind::from_code(
            LittleEndian::read_u32(&fixed[16..20]),
            LittleEndian::read_u32(&fixed[20..24]),
        )
        .ok_or_else(invalid_data)?;
        let hdr = GenHeader {
            flags: LittleEndian::read_u32(&fixed[12..16]),
            kind,
            session: LittleEndian::read_u64(&fixed[24..32]),
            generation: LittleEndian::read_u64(&fixed[32..40]),
            base_generation: LittleEndian::read_u64(&fixed[40..48]),
            parent_generation: LittleEndian::read_u64(&fixed[48..56]),
            driver_pthread: LittleEndian::read_u64(&fixed[56..64]),
            thread_count: LittleEndian::read_u32(&fixed[64..68]),
        };
        let n = hdr.thread_count as usize;
        if n > images.len() {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let mut buf = [0u8; THREAD_IMAGE_SIZE];
        for img in images.iter_mut().take(n) {
            r.read_exact(&mut buf)?;
            crc.update(&buf);
            *img = ThreadImage::decode(&buf);
        }
        let mut tail = [0u8; HDR_CRC_SIZE];
        r.read_exact(&mut tail)?;
        if LittleEndian::read_u32(&tail) != crc.finalize() {
            return Err(invalid_data());
        }
        Ok(hdr)
    }

    /// Вариант для кода вне окна заморозки (CLI, проверки перед load).
    pub fn read_owned<R: Read>(r: &mut R) -> io::Result<(GenHeader, Vec<ThreadImage>)> {
        // сначала узнаём thread_count, затем читаем всё заново из буфера
        let mut fixed = [0u8; HDR_FIXED_SIZE];
        r.read_exact(&mut fixed)?;
        let n = LittleEndian::read_u32(&fixed[64..68]) as usize;
        let rest_len = n
            .checked_mul(THREAD_IMAGE_SIZE)
            .and_then(|v| v.checked_add(HDR_CRC_SIZE))
            .filter(|v| *v <= 64 << 20)
            .ok_or_else(invalid_data)?;
        let mut rest = vec![0u8; rest_len];
        r.read_exact(&mut rest)?;
        let mut images = vec![ThreadImage::empty(); n];
        let mut chained = io::Cursor::new(fixed).chain(io::Cursor::new(rest));
        let hdr = GenHeader::read_from(&mut chained, &mut images)?;
        Ok((hdr, images))
    }
}

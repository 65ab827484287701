// src/area.rs: MemoryArea и PageStatus
//
// Формат записи области в metadata-потоке (LE, 64 байта + имя):
// u64 start
// u64 end
// u64 offset        (смещение в файле для file-backed)
// u64 bytes_offset  (позиция первой страницы области в bytes-потоке)
// u64 dev
// u64 inode
// u32 prot          (PROT_*)
// u32 flags         (bit0 shared | bits 4..7 backing | bits 8.. props)
// u16 name_len      (<= 512)
// u16 pad
// name[name_len]
//
// Sentinel конца списка: запись из 64 нулевых байт (start == end == 0).

use std::fmt;
use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    AREA_NAME_MAX, AREA_REC_SIZE, PAGE_FLAG_COMPRESSED, PAGE_FLAG_NO_PAGE, PAGE_FLAG_RAW,
    PAGE_FLAG_UNCHANGED, PAGE_FLAG_ZERO, PAGE_SIZE,
};
use crate::error::invalid_data;

/// Статус одной 4 KiB страницы в поколении.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageStatus {
    NoPage = PAGE_FLAG_NO_PAGE,
    Zero = PAGE_FLAG_ZERO,
    /// Совпадает со страницей base-поколения той же сессии.
    Unchanged = PAGE_FLAG_UNCHANGED,
    CompressedRun = PAGE_FLAG_COMPRESSED,
    Raw = PAGE_FLAG_RAW,
}

impl PageStatus {
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            PAGE_FLAG_NO_PAGE => Some(PageStatus::NoPage),
            PAGE_FLAG_ZERO => Some(PageStatus::Zero),
            PAGE_FLAG_UNCHANGED => Some(PageStatus::Unchanged),
            PAGE_FLAG_COMPRESSED => Some(PageStatus::CompressedRun),
            PAGE_FLAG_RAW => Some(PageStatus::Raw),
            _ => None,
        }
    }

    /// Есть ли у страницы байты в bytes-потоке этого поколения.
    #[inline]
    pub fn has_payload(self) -> bool {
        matches!(self, PageStatus::CompressedRun | PageStatus::Raw)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PageStatus::NoPage => "no-page",
            PageStatus::Zero => "zero",
            PageStatus::Unchanged => "unchanged",
            PageStatus::CompressedRun => "compressed",
            PageStatus::Raw => "raw",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Backing {
    Anonymous = 0,
    File = 1,
    /// [heap], [stack], [vdso] и прочие псевдо-имена в квадратных скобках.
    Special = 2,
}

impl Backing {
    fn from_code(v: u32) -> Option<Self> {
        match v {
            0 => Some(Backing::Anonymous),
            1 => Some(Backing::File),
            2 => Some(Backing::Special),
            _ => None,
        }
    }
}

/// Битовый набор свойств области.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AreaProps(pub u32);

impl AreaProps {
    pub const SKIP: u32 = 0x01;
    pub const MEMFD: u32 = 0x02;
    /// Файл удалён или короче записи: область считается анонимной.
    pub const PROMOTED_ANON: u32 = 0x04;
    pub const HEAP: u32 = 0x08;
    pub const STACK: u32 = 0x10;

    #[inline]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl fmt::Debug for AreaProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Self::SKIP, "skip"),
            (Self::MEMFD, "memfd"),
            (Self::PROMOTED_ANON, "promoted-anon"),
            (Self::HEAP, "heap"),
            (Self::STACK, "stack"),
        ] {
            if self.has(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

const FLAG_SHARED: u32 = 0x1;
const BACKING_SHIFT: u32 = 4;
const BACKING_MASK: u32 = 0xF;
const PROPS_SHIFT: u32 = 8;

/// Область адресного пространства. Имя хранится в фиксированном буфере, чтобы
/// запись можно было копировать внутри окна заморозки без кучи.
#[derive(Clone, Copy)]
pub struct MemoryArea {
    pub start: usize,
    pub end: usize,
    pub prot: i32,
    pub shared: bool,
    pub backing: Backing,
    pub offset: u64,
    pub dev: u64,
    pub inode: u64,
    pub props: AreaProps,
    pub bytes_offset: u64,
    name: [u8; AREA_NAME_MAX],
    name_len: u16,
}

impl MemoryArea {
    pub fn new(start: usize, end: usize, prot: i32) -> Self {
        Self {
            start,
            end,
            prot,
            shared: false,
            backing: Backing::Anonymous,
            offset: 0,
            dev: 0,
            inode: 0,
            props: AreaProps::default(),
            bytes_offset: 0,
            name: [0u8; AREA_NAME_MAX],
            name_len: 0,
        }
    }

    /// Анонимная rw-область (удобно в тестах).
    pub fn anon_rw(start: usize, end: usize) -> Self {
        Self::new(start, end, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub fn with_name(mut self, name: &[u8]) -> Self {
        self.set_name(name);
        self
    }

    /// Имя обрезается до AREA_NAME_MAX. Backing и props выводятся из имени.
    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(AREA_NAME_MAX);
        self.name[..n].copy_from_slice(&name[..n]);
        for b in &mut self.name[n..] {
            *b = 0;
        }
        self.name_len = n as u16;
        self.classify_backing();
    }

    fn classify_backing(&mut self) {
        let buf = self.name;
        let name = &buf[..self.name_len as usize];
        if name.is_empty() {
            self.backing = Backing::Anonymous;
        } else if name.starts_with(b"[") {
            self.backing = Backing::Special;
            self.props.set(AreaProps::HEAP, name == b"[heap]");
            self.props.set(AreaProps::STACK, name.starts_with(b"[stack"));
        } else {
            self.backing = Backing::File;
            self.props.set(AreaProps::MEMFD, name.starts_with(b"/memfd:"));
            self.props
                .set(AreaProps::PROMOTED_ANON, name.ends_with(b" (deleted)"));
        }
    }

    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    /// Имя для печати (lossy только на границе символа).
    pub fn name_str(&self) -> &str {
        std::str::from_utf8(self.name()).unwrap_or("<non-utf8>")
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn pages(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    #[inline]
    pub fn is_skip(&self) -> bool {
        self.props.has(AreaProps::SKIP)
    }

    #[inline]
    pub fn is_heap(&self) -> bool {
        self.props.has(AreaProps::HEAP)
    }

    #[inline]
    pub fn is_stack(&self) -> bool {
        self.props.has(AreaProps::STACK)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.prot & libc::PROT_WRITE != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.prot & libc::PROT_READ != 0
    }

    /// Область без файла за спиной (анонимная, спец. или «повышенная» до анонимной).
    pub fn is_anonymous(&self) -> bool {
        match self.backing {
            Backing::Anonymous | Backing::Special => true,
            Backing::File => {
                self.props.has(AreaProps::MEMFD) || self.props.has(AreaProps::PROMOTED_ANON)
            }
        }
    }

    /// Мапится ли область из файла при пересоздании.
    pub fn maps_from_file(&self) -> bool {
        self.backing == Backing::File && !self.is_anonymous()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Под-диапазон [from, to) той же области; offset для файла сдвигается.
    pub fn slice(&self, from: usize, to: usize) -> MemoryArea {
        debug_assert!(from >= self.start && to <= self.end && from < to);
        let mut a = *self;
        a.start = from;
        a.end = to;
        if self.backing == Backing::File {
            a.offset = self.offset + (from - self.start) as u64;
        }
        a
    }

    /// Одинаковое ли происхождение (чтобы не перемапливать без нужды).
    pub fn same_backing(&self, other: &MemoryArea) -> bool {
        if self.shared != other.shared || self.is_anonymous() != other.is_anonymous() {
            return false;
        }
        if self.maps_from_file() {
            return self.name() == other.name() && self.offset == other.offset;
        }
        true
    }

    // ---- кодирование ----

    fn flags_word(&self) -> u32 {
        let mut f = 0u32;
        if self.shared {
            f |= FLAG_SHARED;
        }
        f |= (self.backing as u32 & BACKING_MASK) << BACKING_SHIFT;
        f |= self.props.0 << PROPS_SHIFT;
        f
    }

    /// Закодировать запись в `out`; возвращает длину.
    pub fn encode(&self, out: &mut [u8; AREA_REC_SIZE + AREA_NAME_MAX]) -> usize {
        LittleEndian::write_u64(&mut out[0..8], self.start as u64);
        LittleEndian::write_u64(&mut out[8..16], self.end as u64);
        LittleEndian::write_u64(&mut out[16..24], self.offset);
        LittleEndian::write_u64(&mut out[24..32], self.bytes_offset);
        LittleEndian::write_u64(&mut out[32..40], self.dev);
        LittleEndian::write_u64(&mut out[40..48], self.inode);
        LittleEndian::write_u32(&mut out[48..52], self.prot as u32);
        LittleEndian::write_u32(&mut out[52..56], self.flags_word());
        LittleEndian::write_u16(&mut out[56..58], self.name_len);
        LittleEndian::write_u16(&mut out[58..60], 0);
        LittleEndian::write_u32(&mut out[60..64], 0);
        let n = self.name_len as usize;
        out[AREA_REC_SIZE..AREA_REC_SIZE + n].copy_from_slice(self.name());
        AREA_REC_SIZE + n
    }

    /// Прочитать запись; None: sentinel.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Option<MemoryArea>> {
        let mut hdr = [0u8; AREA_REC_SIZE];
        r.read_exact(&mut hdr)?;
        let start = LittleEndian::read_u64(&hdr[0..8]) as usize;
        let end = LittleEndian::read_u64(&hdr[8..16]) as usize;
        if start == 0 && end == 0 {
            return Ok(None);
        }
        if end <= start || start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(invalid_data());
        }
        let flags = LittleEndian::read_u32(&hdr[52..56]);
        let name_len = LittleEndian::read_u16(&hdr[56..58]) as usize;
        if name_len > AREA_NAME_MAX {
            return Err(invalid_data());
        }
        let backing =
            Backing::from_code((flags >> BACKING_SHIFT) & BACKING_MASK).ok_or_else(invalid_data)?;

        let mut a = MemoryArea::new(start, end, LittleEndian::read_u32(&hdr[48..52]) as i32);
        a.offset = LittleEndian::read_u64(&hdr[16..24]);
        a.bytes_offset = LittleEndian::read_u64(&hdr[24..32]);
        a.dev = LittleEndian::read_u64(&hdr[32..40]);
        a.inode = LittleEndian::read_u64(&hdr[40..48]);
        r.read_exact(&mut a.name[..name_len])?;
        a.name_len = name_len as u16;
        // флаги записи авторитетны: не выводим заново из имени
        a.shared = flags & FLAG_SHARED != 0;
        a.backing = backing;
        a.props = AreaProps(flags >> PROPS_SHIFT);
        Ok(Some(a))
    }

    /// Sentinel: 64 нулевых байта.
    pub const SENTINEL: [u8; AREA_REC_SIZE] = [0u8; AREA_REC_SIZE];
}

impl fmt::Debug for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}-{:#x} {}{}{}{} {:?} {:?} {}",
            self.start,
            self.end,
            if self.prot & libc::PROT_READ != 0 { 'r' } else { '-' },
            if self.prot & libc::PROT_WRITE != 0 { 'w' } else { '-' },
            if self.prot & libc::PROT_EXEC != 0 { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' },
            self.backing,
            self.props,
            self.name_str()
        )
    }
}

impl PartialEq for MemoryArea {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.prot == other.prot
            && self.shared == other.shared
            && self.backing == other.backing
            && self.offset == other.offset
            && self.props == other.props
            && self.name() == other.name()
    }
}

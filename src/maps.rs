//! Перечисление областей адресного пространства (/proc/self/maps).
//!
//! - capture_maps: читает /proc/self/maps в переданный буфер (reserved memory) через
//!   libc::open/read: без аллокаций, годится для окна заморозки.
//! - AreaEnumerator: перезапускаемый упорядоченный итератор MemoryArea поверх снимка
//!   текста. Соседние строки [heap] склеиваются; область, пересекающая reserved region,
//!   режется вокруг него.
//! - is_skipped: фиксированные правила + политика конфигурации. Чистая функция.

use std::io;

use crate::area::{AreaProps, MemoryArea};
use crate::config::SkipPolicy;

const PROC_SELF_MAPS: &[u8] = b"/proc/self/maps\0";

/// Псевдо-области, которые нельзя ни сохранить, ни пересоздать.
const PSEUDO_NAMES: &[&[u8]] = &[
    b"[vdso]",
    b"[vvar]",
    b"[vvar_vclock]",
    b"[vsyscall]",
    b"[vectors]",
    b"[uprobes]",
];

/// Прочитать /proc/self/maps целиком в `buf`. Ошибка ENOBUFS, если не влезло.
pub fn capture_maps(buf: &mut [u8]) -> io::Result<usize> {
    let fd = unsafe {
        libc::open(
            PROC_SELF_MAPS.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut len = 0usize;
    let res = loop {
        if len == buf.len() {
            break Err(io::Error::from_raw_os_error(libc::ENOBUFS));
        }
        let n = unsafe {
            libc::read(
                fd,
                buf[len..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - len,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break Err(e);
        }
        if n == 0 {
            break Ok(len);
        }
        len += n as usize;
    };
    unsafe { libc::close(fd) };
    res
}

/// Правила пропуска. `reserved`: диапазон reserved region ([start, end)).
pub fn is_skipped(area: &MemoryArea, policy: &SkipPolicy, reserved: (usize, usize)) -> bool {
    if area.size() == 0 {
        return true;
    }
    let name = area.name();
    if PSEUDO_NAMES.iter().any(|p| *p == name) {
        return true;
    }
    if area.start < reserved.1 && reserved.0 < area.end {
        return true;
    }
    if policy.ignore_non_writable && !area.is_writable() {
        return true;
    }
    if policy.ignore_exec && area.prot & libc::PROT_EXEC != 0 {
        return true;
    }
    if let Some(limit) = policy.ignore_large_anon {
        if area.is_anonymous() && area.size() > limit {
            return true;
        }
    }
    // по умолчанию: сохраняем записываемые или анонимные
    !(area.is_writable() || area.is_anonymous())
}

/// Итератор областей поверх захваченного текста maps.
pub struct AreaEnumerator<'b> {
    text: &'b [u8],
    pos: usize,
    policy: SkipPolicy,
    reserved: (usize, usize),
    pending: Option<MemoryArea>,
}

impl<'b> AreaEnumerator<'b> {
    pub fn new(text: &'b [u8], policy: SkipPolicy, reserved: (usize, usize)) -> Self {
        Self {
            text,
            pos: 0,
            policy,
            reserved,
            pending: None,
        }
    }

    /// Начать обход заново (тот же снимок текста).
    pub fn restart(&mut self) {
        self.pos = 0;
        self.pending = None;
    }

    fn next_line(&mut self) -> Option<&'b [u8]> {
        let text: &'b [u8] = self.text;
        while self.pos < text.len() {
            let rest = &text[self.pos..];
            let len = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            self.pos += len + 1;
            let line = &rest[..len];
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn peek_line(&self) -> Option<&'b [u8]> {
        let text: &'b [u8] = self.text;
        let mut p = self.pos;
        while p < text.len() {
            let rest = &text[p..];
            let len = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            if len > 0 {
                return Some(&rest[..len]);
            }
            p += 1;
        }
        None
    }

    fn next_raw(&mut self) -> Option<MemoryArea> {
        loop {
            let line = self.next_line()?;
            let Some(mut area) = parse_maps_line(line) else {
                continue;
            };
            // склеиваем соседние [heap] в одну область
            if area.is_heap() {
                while let Some(next) = self.peek_line().and_then(parse_maps_line) {
                    if next.is_heap() && next.start == area.end {
                        area.end = next.end;
                        area.prot |= next.prot;
                        let _ = self.next_line();
                    } else {
                        break;
                    }
                }
            }
            return Some(area);
        }
    }

    fn finish(&self, mut area: MemoryArea) -> MemoryArea {
        let skip = is_skipped(&area, &self.policy, self.reserved);
        area.props.set(AreaProps::SKIP, skip);
        area
    }
}

impl<'b> Iterator for AreaEnumerator<'b> {
    type Item = MemoryArea;

    fn next(&mut self) -> Option<MemoryArea> {
        if let Some(a) = self.pending.take() {
            return Some(self.finish(a));
        }
        loop {
            let area = self.next_raw()?;
            let (rs, re) = self.reserved;
            if area.end <= rs || area.start >= re {
                return Some(self.finish(area));
            }
            // пересечение с reserved: отдаём части до и после
            if area.start < rs {
                if area.end > re {
                    self.pending = Some(area.slice(re, area.end));
                }
                return Some(self.finish(area.slice(area.start, rs)));
            }
            if area.end > re {
                return Some(self.finish(area.slice(re, area.end)));
            }
            // область целиком внутри reserved: не перечисляется вовсе
        }
    }
}

fn parse_hex(s: &[u8]) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    let mut v = 0u64;
    for &c in s {
        let d = (c as char).to_digit(16)? as u64;
        v = (v << 4) | d;
    }
    Some(v)
}

fn parse_dec(s: &[u8]) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let mut v = 0u64;
    for &c in s {
        let d = (c as char).to_digit(10)? as u64;
        v = v.checked_mul(10)?.checked_add(d)?;
    }
    Some(v)
}

/// Разбор одной строки maps:
/// `start-end perms offset dev inode    [name]`
pub fn parse_maps_line(line: &[u8]) -> Option<MemoryArea> {
    let mut fields = line.splitn(6, |b| *b == b' ');
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let name = fields.next().unwrap_or(b"");

    let dash = range.iter().position(|b| *b == b'-')?;
    let start = parse_hex(&range[..dash])? as usize;
    let end = parse_hex(&range[dash + 1..])? as usize;
    if end < start || perms.len() < 4 {
        return None;
    }

    let mut prot = 0;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC;
    }

    let mut area = MemoryArea::new(start, end, prot);
    area.shared = perms[3] == b's';
    area.offset = parse_hex(offset)?;
    let colon = dev.iter().position(|b| *b == b':')?;
    area.dev = (parse_hex(&dev[..colon])? << 32) | parse_hex(&dev[colon + 1..])?;
    area.inode = parse_dec(inode)?;

    // имя выровнено пробелами; может само содержать пробелы
    let name_start = name.iter().position(|b| *b != b' ').unwrap_or(name.len());
    area.set_name(&name[name_start..]);
    Some(area)
}

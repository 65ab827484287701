//! Копирование байт сохранённого поколения в уже сверенную раскладку.
//!
//! Для каждой страницы каждой не-skip области текущего поколения:
//! - NoPage → вернуть страницу ядру (соседние склеиваются в один madvise);
//! - Zero → обнулить; анонимную нерезидентную страницу не трогаем, она и так нулевая;
//! - Unchanged → байты из base. Пропуск, если страница не менялась с последней
//!   синхронизации, а тогда она тоже совпадала с base;
//! - Raw/Compressed → байты из current. Пропуск, если последняя синхронизация была
//!   этим же поколением и страница не тронута.
//!
//! В конце области ставится сохранённая защита.

use std::io::{self, Read, Seek};

use flate2::Decompress;

use crate::area::{MemoryArea, PageStatus};
use crate::consts::PAGE_SIZE;
use crate::error::invalid_data;
use crate::hash::AreaHasher;
use crate::metrics::OpStats;
use crate::pagemap::{PageSource, PageTarget};
use crate::snapshot::reader::GenerationReader;
use crate::space::AddressSpaceOps;

/// Что известно о последней синхронизации памяти с диском.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncInfo {
    /// Последнее синхронизированное поколение: то, что загружается.
    pub same_generation: bool,
    /// Последнее синхронизированное поколение: сам base.
    pub last_is_base: bool,
    /// Soft-dirty биты достоверны (иначе любая страница считается изменённой).
    pub soft_dirty: bool,
}

struct Discard {
    start: usize,
    len: usize,
}

fn flush_discard<T: PageTarget>(pending: &mut Option<Discard>, target: &mut T) -> io::Result<()> {
    if let Some(d) = pending.take() {
        target.discard(d.start, d.len)?;
    }
    Ok(())
}

fn queue_discard<T: PageTarget>(
    pending: &mut Option<Discard>,
    addr: usize,
    target: &mut T,
) -> io::Result<()> {
    if let Some(d) = pending.as_mut() {
        if d.start + d.len == addr {
            d.len += PAGE_SIZE;
            return Ok(());
        }
    }
    flush_discard(pending, target)?;
    *pending = Some(Discard {
        start: addr,
        len: PAGE_SIZE,
    });
    Ok(())
}

/// Восстановить байты всех областей `current`.
#[allow(clippy::too_many_arguments)]
pub fn restore_pages<'s, R, T, O>(
    current: &mut GenerationReader<'s, R>,
    mut base: Option<&mut GenerationReader<'s, R>>,
    mut last: Option<&mut GenerationReader<'_, R>>,
    sync: SyncInfo,
    target: &mut T,
    space: &mut O,
    codec: &mut Decompress,
    stats: &mut OpStats,
) -> io::Result<()>
where
    R: Read + Seek,
    T: PageSource + PageTarget,
    O: AddressSpaceOps,
{
    let mut discard: Option<Discard> = None;

    while let Some(area) = current.next_area()? {
        if area.is_skip() {
            continue;
        }
        let mut addr = area.start;
        while addr < area.end {
            let flag = current.get_page_flag(addr)?.ok_or_else(invalid_data)?;
            let info = target.page_info(addr)?;
            let clean = info.present && sync.soft_dirty && !info.soft_dirty;

            match flag {
                PageStatus::NoPage => {
                    queue_discard(&mut discard, addr, target)?;
                    stats.pages_restored += 1;
                }
                PageStatus::Zero => {
                    if area.is_anonymous() && !info.present {
                        stats.pages_skipped += 1;
                    } else {
                        flush_discard(&mut discard, target)?;
                        target.pages_mut(addr, PAGE_SIZE).fill(0);
                        stats.pages_restored += 1;
                    }
                }
                PageStatus::Unchanged => {
                    let last_flag = match last.as_mut() {
                        Some(l) if clean => l.get_page_flag(addr)?,
                        _ => None,
                    };
                    let same_as_base = match last_flag {
                        Some(PageStatus::Unchanged) => true,
                        Some(PageStatus::Raw | PageStatus::CompressedRun) => sync.last_is_base,
                        _ => false,
                    };
                    if same_as_base {
                        stats.pages_skipped += 1;
                    } else {
                        flush_discard(&mut discard, target)?;
                        let b = base.as_mut().ok_or_else(invalid_data)?;
                        match b.get_page_flag(addr)? {
                            Some(PageStatus::Raw | PageStatus::CompressedRun) => {
                                b.queue_page_load(addr, target, codec)?;
                            }
                            Some(PageStatus::Zero) => target.pages_mut(addr, PAGE_SIZE).fill(0),
                            Some(PageStatus::NoPage) => queue_discard(&mut discard, addr, target)?,
                            // base не содержит Unchanged; отсутствие страницы: битый снимок
                            Some(PageStatus::Unchanged) | None => return Err(invalid_data()),
                        }
                        stats.pages_restored += 1;
                    }
                }
                PageStatus::Raw | PageStatus::CompressedRun => {
                    if sync.same_generation && clean {
                        stats.pages_skipped += 1;
                    } else {
                        flush_discard(&mut discard, target)?;
                        current.queue_page_load(addr, target, codec)?;
                        stats.pages_restored += 1;
                    }
                }
            }
            addr += PAGE_SIZE;
        }

        current.finish_load(target)?;
        if let Some(b) = base.as_mut() {
            b.finish_load(target)?;
        }
        flush_discard(&mut discard, target)?;
        space.protect(area.start, area.size(), area.prot)?;
        stats.protects += 1;
    }
    Ok(())
}

/// Сверить хеши восстановленных областей с записанными. Возвращает число несовпадений.
pub fn verify_restored_areas<R, S>(
    current: &mut GenerationReader<'_, R>,
    src: &S,
    mut on_mismatch: impl FnMut(&MemoryArea),
) -> io::Result<u64>
where
    R: Read + Seek,
    S: PageSource,
{
    current.restart()?;
    let mut mismatches = 0u64;
    while let Some(area) = current.next_area()? {
        if area.is_skip() {
            continue;
        }
        let mut hasher = AreaHasher::new();
        let mut addr = area.start;
        while addr < area.end {
            match current.get_page_flag(addr)? {
                Some(PageStatus::NoPage) | None => {}
                Some(_) => hasher.page(src.bytes(addr, PAGE_SIZE)),
            }
            addr += PAGE_SIZE;
        }
        let recorded = current.area_hash()?;
        if recorded != 0 && recorded != hasher.finish() {
            mismatches += 1;
            on_mismatch(&area);
        }
    }
    Ok(mismatches)
}

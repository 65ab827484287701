//! Сверка сохранённой и живой раскладки адресного пространства.
//!
//! Оба списка упорядочены по адресу; идём по ним одновременно, держа рабочую пару
//! (saved, live). Каждый шаг либо закрывает одну из сторон, либо отрезает
//! неперекрывающийся префикс и продолжает с остатком. Байты здесь не копируются:
//! после прохода каждая сохранённая не-skip область отображена и доступна на запись,
//! итоговую защиту ставит restore.

use std::io::{self, Read, Seek};

use crate::area::MemoryArea;
use crate::metrics::OpStats;
use crate::snapshot::reader::GenerationReader;
use crate::space::AddressSpaceOps;

/// Источник сохранённых областей.
pub trait AreaStream {
    fn next_saved(&mut self) -> io::Result<Option<MemoryArea>>;
}

impl<R: Read + Seek> AreaStream for GenerationReader<'_, R> {
    fn next_saved(&mut self) -> io::Result<Option<MemoryArea>> {
        self.next_area()
    }
}

/// Области из среза (тесты, офлайн-планирование).
pub struct SliceAreas<'a> {
    areas: &'a [MemoryArea],
    pos: usize,
}

impl<'a> SliceAreas<'a> {
    pub fn new(areas: &'a [MemoryArea]) -> Self {
        Self { areas, pos: 0 }
    }
}

impl AreaStream for SliceAreas<'_> {
    fn next_saved(&mut self) -> io::Result<Option<MemoryArea>> {
        let a = self.areas.get(self.pos).copied();
        if a.is_some() {
            self.pos += 1;
        }
        Ok(a)
    }
}

fn rw(prot: i32) -> i32 {
    prot | libc::PROT_READ | libc::PROT_WRITE
}

/// Можно ли менять размер на месте через mremap.
fn resizable(sa: &MemoryArea, la: &MemoryArea) -> bool {
    (sa.is_stack() || sa.is_anonymous())
        && !sa.shared
        && !sa.is_skip()
        && !la.is_skip()
        && sa.same_backing(la)
}

struct Pass<'o, O: AddressSpaceOps> {
    ops: &'o mut O,
    stats: &'o mut OpStats,
}

impl<O: AddressSpaceOps> Pass<'_, O> {
    fn file_fits(&mut self, sa: &MemoryArea) -> bool {
        sa.maps_from_file()
            && matches!(self.ops.backing_len(sa), Some(len) if len >= sa.offset + sa.size() as u64)
    }

    /// Сохранённой области нет в живой раскладке.
    fn create(&mut self, sa: &MemoryArea) -> io::Result<()> {
        if sa.is_skip() {
            // содержимое не сохранялось; файловую область можно вернуть из файла
            if self.file_fits(sa) {
                self.ops.map_area(sa, true)?;
                self.ops.protect(sa.start, sa.size(), sa.prot)?;
                self.stats.maps += 1;
                self.stats.protects += 1;
            }
            return Ok(());
        }
        if sa.is_heap() {
            self.ops.set_break(sa.end)?;
            self.stats.brks += 1;
            return Ok(());
        }
        let use_file = self.file_fits(sa);
        if sa.maps_from_file() && !use_file {
            crate::frozen_debug!(
                "reconcile: {:#x}-{:#x} backing file gone or short, mapped anonymous",
                sa.start,
                sa.end
            );
        }
        self.ops.map_area(sa, use_file)?;
        self.stats.maps += 1;
        Ok(())
    }

    /// Живой области нет в сохранённой раскладке. `whole`: это вся область целиком.
    fn remove(&mut self, la: &MemoryArea, whole: bool) -> io::Result<()> {
        if la.is_skip() {
            return Ok(());
        }
        if la.is_heap() && whole {
            self.ops.set_break(la.start)?;
            self.stats.brks += 1;
        } else {
            self.ops.unmap(la.start, la.size())?;
            self.stats.unmaps += 1;
        }
        Ok(())
    }

    /// Одинаковый диапазон.
    fn same(&mut self, sa: &MemoryArea, la: &MemoryArea) -> io::Result<()> {
        debug_assert!(sa.start == la.start && sa.end == la.end);
        if sa.is_skip() {
            return Ok(());
        }
        if la.is_skip() || !sa.same_backing(la) {
            let use_file = self.file_fits(sa);
            self.ops.map_area(sa, use_file)?;
            self.stats.maps += 1;
            return Ok(());
        }
        if la.prot != rw(sa.prot) {
            self.ops.protect(sa.start, sa.size(), rw(sa.prot))?;
            self.stats.protects += 1;
        }
        Ok(())
    }
}

/// Привести живую раскладку к сохранённой.
pub fn reconcile<S, I, O>(
    saved: &mut S,
    live: I,
    ops: &mut O,
    stats: &mut OpStats,
) -> io::Result<()>
where
    S: AreaStream,
    I: Iterator<Item = MemoryArea>,
    O: AddressSpaceOps,
{
    let mut live = live.peekable();
    let mut pass = Pass { ops, stats };
    let mut s = saved.next_saved()?;
    let mut l = live.next();
    // исходная ли это живая область (а не остаток после отрезания префикса)
    let mut l_whole = true;

    loop {
        match (s, l) {
            (None, None) => break,
            (Some(sa), None) => {
                pass.create(&sa)?;
                s = saved.next_saved()?;
            }
            (None, Some(la)) => {
                pass.remove(&la, l_whole)?;
                l = live.next();
                l_whole = true;
            }
            (Some(sa), Some(la)) => {
                if sa.end <= la.start {
                    pass.create(&sa)?;
                    s = saved.next_saved()?;
                } else if la.end <= sa.start {
                    pass.remove(&la, l_whole)?;
                    l = live.next();
                    l_whole = true;
                } else if sa.start == la.start && sa.end == la.end {
                    pass.same(&sa, &la)?;
                    s = saved.next_saved()?;
                    l = live.next();
                    l_whole = true;
                } else if sa.start == la.start {
                    let mut resized = la;
                    resized.end = sa.end;
                    if sa.is_heap() && la.is_heap() {
                        pass.ops.set_break(sa.end)?;
                        pass.stats.brks += 1;
                        pass.same(&sa, &resized)?;
                        s = saved.next_saved()?;
                        l = live.next();
                        l_whole = true;
                        continue;
                    }
                    let room = sa.end < la.end || live.peek().map_or(true, |n| n.start >= sa.end);
                    if resizable(&sa, &la) && room {
                        pass.ops.remap(&la, sa.size())?;
                        pass.stats.remaps += 1;
                        pass.same(&sa, &resized)?;
                        s = saved.next_saved()?;
                        l = live.next();
                        l_whole = true;
                    } else if sa.end < la.end {
                        // живая длиннее: общая часть + остаток живой
                        pass.same(&sa, &la.slice(la.start, sa.end))?;
                        l = Some(la.slice(sa.end, la.end));
                        l_whole = false;
                        s = saved.next_saved()?;
                    } else {
                        pass.same(&sa.slice(sa.start, la.end), &la)?;
                        s = Some(sa.slice(la.end, sa.end));
                        l = live.next();
                        l_whole = true;
                    }
                } else if sa.start < la.start {
                    pass.create(&sa.slice(sa.start, la.start))?;
                    s = Some(sa.slice(la.start, sa.end));
                } else {
                    pass.remove(&la.slice(la.start, sa.start), false)?;
                    l = Some(la.slice(sa.start, la.end));
                    l_whole = false;
                }
            }
        }
    }
    Ok(())
}

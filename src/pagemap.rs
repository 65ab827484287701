//! Резидентность и soft-dirty биты страниц (/proc/self/pagemap, /proc/self/clear_refs).
//!
//! pagemap: 8 байт на виртуальную страницу
//! - bit 63 present
//! - bit 62 swapped
//! - bit 55 soft-dirty (запись в страницу после последнего clear_refs=4)
//!
//! PageSource: шов для writer/restore: живая память (LiveMemory) или фейк в тестах.

use std::io;

use crate::consts::{
    PAGEMAP_BATCH, PAGEMAP_PRESENT, PAGEMAP_SOFT_DIRTY, PAGEMAP_SWAPPED, PAGE_SHIFT, PAGE_SIZE,
};

const PROC_SELF_PAGEMAP: &[u8] = b"/proc/self/pagemap\0";
const PROC_SELF_CLEAR_REFS: &[u8] = b"/proc/self/clear_refs\0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageInfo {
    /// У страницы есть данные (в RAM или в swap).
    pub present: bool,
    pub soft_dirty: bool,
}

/// Источник страниц для записи снимка.
pub trait PageSource {
    /// Резидентность/dirty для страницы по адресу (адреса идут по возрастанию).
    fn page_info(&mut self, addr: usize) -> io::Result<PageInfo>;

    /// Непрерывные байты [addr, addr+len). Вызывающий гарантирует, что диапазон
    /// лежит внутри сохраняемой области.
    fn bytes(&self, addr: usize, len: usize) -> &[u8];
}

/// Цель восстановления страниц.
pub trait PageTarget {
    /// Изменяемый диапазон [addr, addr+len) целевой памяти.
    fn pages_mut(&mut self, addr: usize, len: usize) -> &mut [u8];

    /// Вернуть страницы ядру (NoPage): анонимные читаются нулями, файловые: из файла.
    fn discard(&mut self, addr: usize, len: usize) -> io::Result<()>;
}

fn open_proc(path: &[u8], flags: i32) -> io::Result<i32> {
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, flags | libc::O_CLOEXEC) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Сбросить soft-dirty биты всего процесса.
pub fn clear_soft_dirty() -> io::Result<()> {
    let fd = open_proc(PROC_SELF_CLEAR_REFS, libc::O_WRONLY)?;
    let n = unsafe { libc::write(fd, b"4".as_ptr() as *const libc::c_void, 1) };
    let res = if n == 1 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    };
    unsafe { libc::close(fd) };
    res
}

/// Живая память текущего процесса: pagemap читается пачками по PAGEMAP_BATCH записей.
pub struct LiveMemory {
    fd: i32,
    batch_first: usize,
    batch_len: usize,
    entries: [u64; PAGEMAP_BATCH],
}

impl LiveMemory {
    pub fn open() -> io::Result<Self> {
        let fd = open_proc(PROC_SELF_PAGEMAP, libc::O_RDONLY)?;
        Ok(Self {
            fd,
            batch_first: 0,
            batch_len: 0,
            entries: [0u64; PAGEMAP_BATCH],
        })
    }

    fn entry(&mut self, addr: usize) -> io::Result<u64> {
        let page = addr >> PAGE_SHIFT;
        if page < self.batch_first || page >= self.batch_first + self.batch_len {
            let off = (page * 8) as libc::off_t;
            let n = unsafe {
                libc::pread(
                    self.fd,
                    self.entries.as_mut_ptr() as *mut libc::c_void,
                    PAGEMAP_BATCH * 8,
                    off,
                )
            };
            if n < 8 {
                return Err(if n < 0 {
                    io::Error::last_os_error()
                } else {
                    io::Error::from(io::ErrorKind::UnexpectedEof)
                });
            }
            self.batch_first = page;
            self.batch_len = n as usize / 8;
        }
        Ok(self.entries[page - self.batch_first])
    }

    /// Сбросить кэш пачки (после clear_refs или изменения карты).
    pub fn invalidate(&mut self) {
        self.batch_len = 0;
    }
}

impl Drop for LiveMemory {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl PageSource for LiveMemory {
    fn page_info(&mut self, addr: usize) -> io::Result<PageInfo> {
        let e = self.entry(addr)?;
        Ok(PageInfo {
            present: e & (PAGEMAP_PRESENT | PAGEMAP_SWAPPED) != 0,
            soft_dirty: e & PAGEMAP_SOFT_DIRTY != 0,
        })
    }

    fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        // Диапазон лежит в сохраняемой области, которая читаема на время записи.
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }
    }
}

impl PageTarget for LiveMemory {
    fn pages_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        // Reconciler уже сделал область записываемой.
        unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) }
    }

    fn discard(&mut self, addr: usize, len: usize) -> io::Result<()> {
        let r = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Проверить, что ядро ведёт soft-dirty (CONFIG_MEM_SOFT_DIRTY). Вызывается при attach.
pub fn probe_soft_dirty() -> bool {
    let probe = || -> io::Result<bool> {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = page as usize;
        let result = (|| -> io::Result<bool> {
            unsafe { std::ptr::write_volatile(page as *mut u8, 1) };
            clear_soft_dirty()?;
            let mut mem = LiveMemory::open()?;
            let clean = mem.page_info(addr)?;
            unsafe { std::ptr::write_volatile(page as *mut u8, 2) };
            mem.invalidate();
            let dirty = mem.page_info(addr)?;
            Ok(clean.present && !clean.soft_dirty && dirty.soft_dirty)
        })();
        unsafe { libc::munmap(page, PAGE_SIZE) };
        result
    };
    match probe() {
        Ok(ok) => ok,
        Err(e) => {
            log::debug!("soft-dirty probe failed: {}", e);
            false
        }
    }
}

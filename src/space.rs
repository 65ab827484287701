// src/space.rs: операции над адресным пространством для reconciler'а
//
// AddressSpaceOps: шов: живой процесс (LiveAddressSpace, mmap/munmap/mremap/brk/
// mprotect) или запись операций в тестах. Все адреса и длины выровнены по странице.
//
// LiveAddressSpace отказывается трогать reserved region: это нарушение инварианта,
// дальше работать нельзя (fatal).

use std::io;

use crate::area::MemoryArea;
use crate::consts::PAGE_SIZE;
use crate::sys;

pub trait AddressSpaceOps {
    /// MAP_FIXED поверх [area.start, area.end). `use_file`: мапить из файла по имени
    /// области, иначе анонимно.
    fn map_area(&mut self, area: &MemoryArea, use_file: bool) -> io::Result<()>;

    fn unmap(&mut self, start: usize, len: usize) -> io::Result<()>;

    /// Изменить размер области на месте (без переноса).
    fn remap(&mut self, area: &MemoryArea, new_len: usize) -> io::Result<()>;

    /// Сдвинуть program break.
    fn set_break(&mut self, addr: usize) -> io::Result<()>;

    fn protect(&mut self, start: usize, len: usize, prot: i32) -> io::Result<()>;

    /// Длина файла области (None: файла нет или это не файл).
    fn backing_len(&mut self, area: &MemoryArea) -> Option<u64>;
}

pub struct LiveAddressSpace {
    reserved: (usize, usize),
}

impl LiveAddressSpace {
    pub fn new(reserved: (usize, usize)) -> Self {
        Self { reserved }
    }

    fn check(&self, start: usize, len: usize) {
        if start % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            crate::fatal!("unaligned address space op at {:#x}+{:#x}", start, len);
        }
        let (rs, re) = self.reserved;
        if start < re && rs < start + len {
            crate::fatal!(
                "address space op {:#x}+{:#x} touches the reserved region",
                start,
                len
            );
        }
    }
}

/// Имя области как C-строка в стековом буфере.
fn c_name(area: &MemoryArea, buf: &mut [u8; crate::consts::AREA_NAME_MAX + 1]) -> io::Result<()> {
    let name = area.name();
    if name.is_empty() || name.contains(&0) {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    buf[..name.len()].copy_from_slice(name);
    buf[name.len()] = 0;
    Ok(())
}

fn check_ret(r: libc::c_int) -> io::Result<()> {
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AddressSpaceOps for LiveAddressSpace {
    fn map_area(&mut self, area: &MemoryArea, use_file: bool) -> io::Result<()> {
        self.check(area.start, area.size());
        let sharing = if area.shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        // PROT_WRITE до восстановления байт; итоговая защита ставится после
        let prot = area.prot | libc::PROT_READ | libc::PROT_WRITE;
        let (fd, flags) = if use_file {
            let mut name = [0u8; crate::consts::AREA_NAME_MAX + 1];
            c_name(area, &mut name)?;
            let oflags = if area.shared {
                libc::O_RDWR
            } else {
                libc::O_RDONLY
            };
            let fd = unsafe {
                libc::open(
                    name.as_ptr() as *const libc::c_char,
                    oflags | libc::O_CLOEXEC,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            (fd, sharing | libc::MAP_FIXED)
        } else {
            (-1, sharing | libc::MAP_FIXED | libc::MAP_ANONYMOUS)
        };
        let p = unsafe {
            libc::mmap(
                area.start as *mut libc::c_void,
                area.size(),
                prot,
                flags,
                fd,
                if use_file { area.offset as libc::off_t } else { 0 },
            )
        };
        let err = if p == libc::MAP_FAILED {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        match err {
            Some(e) => Err(e),
            None if p as usize != area.start => Err(io::Error::from(io::ErrorKind::AddrInUse)),
            None => Ok(()),
        }
    }

    fn unmap(&mut self, start: usize, len: usize) -> io::Result<()> {
        self.check(start, len);
        check_ret(unsafe { libc::munmap(start as *mut libc::c_void, len) })
    }

    fn remap(&mut self, area: &MemoryArea, new_len: usize) -> io::Result<()> {
        self.check(area.start, area.size().max(new_len));
        let p = unsafe {
            libc::mremap(
                area.start as *mut libc::c_void,
                area.size(),
                new_len,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if p as usize != area.start {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        Ok(())
    }

    fn set_break(&mut self, addr: usize) -> io::Result<()> {
        // brk возвращает новый break; несовпадение: отказ ядра
        let r = unsafe { sys::raw_syscall1(libc::SYS_brk, addr) };
        if r as usize != addr {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok(())
    }

    fn protect(&mut self, start: usize, len: usize, prot: i32) -> io::Result<()> {
        self.check(start, len);
        check_ret(unsafe { libc::mprotect(start as *mut libc::c_void, len, prot) })
    }

    fn backing_len(&mut self, area: &MemoryArea) -> Option<u64> {
        let mut name = [0u8; crate::consts::AREA_NAME_MAX + 1];
        c_name(area, &mut name).ok()?;
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let r = unsafe { libc::stat(name.as_ptr() as *const libc::c_char, &mut st) };
        if r != 0 || (st.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return None;
        }
        Some(st.st_size as u64)
    }
}

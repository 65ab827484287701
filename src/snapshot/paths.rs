//! Пути файлов поколений без аллокаций.
//!
//! SnapPath: NUL-терминированный путь в фиксированном буфере. Открытие, rename и
//! unlink идут через libc, поэтому всё это годится внутри окна заморозки.
//!
//! Раскладка каталога:
//!   <dir>/state{slot}.pm   <dir>/state{slot}.p
//!   <dir>/base.pm          <dir>/base.p
//! Запись всегда в <name>.tmp, затем rename.
//!
//! Режим in_ram: те же имена, но за каждым путём стоит ячейка RamStore с fd
//! memfd. rename меняет fd в ячейках местами, чтение открывает /proc/self/fd/N
//! (своё смещение у каждого читателя).

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::consts::{
    BASE_NAME, BYTES_EXT, MEMFD_PREFIX, META_EXT, PATH_MAX_BYTES, RAM_SLOTS, SLOT_PREFIX,
    TMP_SUFFIX,
};
use crate::logging::StackBuf;
use crate::snapshot::header::GenerationKind;

#[derive(Clone, Copy)]
pub struct SnapPath {
    buf: [u8; PATH_MAX_BYTES],
    len: usize,
    /// Ячейка memfd (режим in_ram); None: обычный файл.
    ram: Option<&'static AtomicI32>,
}

impl PartialEq for SnapPath {
    fn eq(&self, other: &Self) -> bool {
        let same_cell = match (self.ram, other.ram) {
            (Some(a), Some(b)) => std::ptr::eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_cell && self.buf[..self.len] == other.buf[..other.len]
    }
}

impl Eq for SnapPath {}

const NO_FD: i32 = -1;

/// Fd memfd-поколений для режима in_ram. Лежит в reserved memory: load не
/// откатывает таблицу вместе с остальной памятью.
#[repr(C)]
pub struct RamStore {
    base: [AtomicI32; 4],
    slots: [[AtomicI32; 4]; RAM_SLOTS],
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_CELL: AtomicI32 = AtomicI32::new(NO_FD);
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ROW: [AtomicI32; 4] = [EMPTY_CELL; 4];

impl RamStore {
    pub const fn new() -> Self {
        Self {
            base: EMPTY_ROW,
            slots: [EMPTY_ROW; RAM_SLOTS],
        }
    }

    fn cell(&self, kind: GenerationKind, role: FileRole, tmp: bool) -> io::Result<&AtomicI32> {
        let row = match kind {
            GenerationKind::Base => &self.base,
            GenerationKind::Slot(s) if (s as usize) < RAM_SLOTS => &self.slots[s as usize],
            GenerationKind::Slot(_) => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        let idx = match role {
            FileRole::Meta => 0,
            FileRole::Bytes => 2,
        } + tmp as usize;
        Ok(&row[idx])
    }

    /// Суммарный размер всех memfd (финальных и временных).
    pub fn used_bytes(&self) -> u64 {
        self.base
            .iter()
            .chain(self.slots.iter().flatten())
            .map(|c| fd_len(c.load(Ordering::Acquire)))
            .sum()
    }

    /// Закрыть все memfd.
    pub fn release_all(&self) {
        for c in self.base.iter().chain(self.slots.iter().flatten()) {
            close_fd(c.swap(NO_FD, Ordering::AcqRel));
        }
    }
}

impl Default for RamStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fd_len(fd: i32) -> u64 {
    if fd < 0 {
        return 0;
    }
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return 0;
    }
    st.st_size as u64
}

fn close_fd(fd: i32) {
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
}

fn open_c(path: *const libc::c_char, flags: i32) -> io::Result<File> {
    let fd = unsafe { libc::open(path, flags | libc::O_CLOEXEC, 0o644 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Новое открытие memfd через /proc/self/fd/N: у файла своё смещение.
fn reopen_fd(fd: i32, flags: i32) -> io::Result<File> {
    let mut p = StackBuf::<32>::new();
    let _ = write!(p, "/proc/self/fd/{}", fd);
    let mut c = [0u8; 33];
    c[..p.as_bytes().len()].copy_from_slice(p.as_bytes());
    open_c(c.as_ptr() as *const libc::c_char, flags)
}

/// metadata или bytes файл поколения.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Meta,
    Bytes,
}

fn file_name(kind: GenerationKind, role: FileRole, tmp: bool) -> StackBuf<64> {
    let mut name = StackBuf::<64>::new();
    let ext = match role {
        FileRole::Meta => META_EXT,
        FileRole::Bytes => BYTES_EXT,
    };
    let _ = match kind {
        GenerationKind::Base => write!(name, "{}.{}", BASE_NAME, ext),
        GenerationKind::Slot(s) => write!(name, "{}{}.{}", SLOT_PREFIX, s, ext),
    };
    if tmp {
        let _ = name.write_str(TMP_SUFFIX);
    }
    name
}

impl SnapPath {
    /// Путь файла поколения. ENAMETOOLONG, если не влезает в буфер.
    pub fn new(dir: &Path, kind: GenerationKind, role: FileRole, tmp: bool) -> io::Result<Self> {
        let name = file_name(kind, role, tmp);
        let dir = dir.as_os_str().as_bytes();
        let need = dir.len() + 1 + name.as_bytes().len() + 1;
        if need > PATH_MAX_BYTES {
            return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
        }
        let mut p = SnapPath {
            buf: [0u8; PATH_MAX_BYTES],
            len: 0,
            ram: None,
        };
        p.push(dir);
        if !dir.ends_with(b"/") {
            p.push(b"/");
        }
        p.push(name.as_bytes());
        Ok(p)
    }

    /// memfd-вариант: имя "memfd:state3.pm" только для логов.
    /// EINVAL для слотов за пределами RAM_SLOTS.
    pub fn in_ram(
        store: &'static RamStore,
        kind: GenerationKind,
        role: FileRole,
        tmp: bool,
    ) -> io::Result<Self> {
        let cell = store.cell(kind, role, tmp)?;
        let mut p = SnapPath {
            buf: [0u8; PATH_MAX_BYTES],
            len: 0,
            ram: Some(cell),
        };
        p.push(MEMFD_PREFIX.as_bytes());
        p.push(file_name(kind, role, tmp).as_bytes());
        Ok(p)
    }

    #[inline]
    pub fn is_in_ram(&self) -> bool {
        self.ram.is_some()
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.buf[self.len] = 0;
    }

    #[inline]
    fn c_ptr(&self) -> *const libc::c_char {
        self.buf.as_ptr() as *const libc::c_char
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..self.len]))
    }

    pub fn open_read(&self) -> io::Result<File> {
        match self.ram {
            Some(cell) => match cell.load(Ordering::Acquire) {
                NO_FD => Err(io::Error::from_raw_os_error(libc::ENOENT)),
                fd => reopen_fd(fd, libc::O_RDONLY),
            },
            None => open_c(self.c_ptr(), libc::O_RDONLY),
        }
    }

    /// Создать/обрезать файл для записи.
    pub fn create(&self) -> io::Result<File> {
        let Some(cell) = self.ram else {
            return open_c(self.c_ptr(), libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC);
        };
        let mut fd = cell.load(Ordering::Acquire);
        if fd == NO_FD {
            fd = unsafe {
                libc::syscall(libc::SYS_memfd_create, self.c_ptr(), libc::MFD_CLOEXEC) as i32
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            cell.store(fd, Ordering::Release);
        }
        reopen_fd(fd, libc::O_WRONLY | libc::O_TRUNC)
    }

    pub fn exists(&self) -> bool {
        match self.ram {
            Some(cell) => cell.load(Ordering::Acquire) != NO_FD,
            None => unsafe { libc::access(self.c_ptr(), libc::F_OK) == 0 },
        }
    }

    pub fn rename_to(&self, to: &SnapPath) -> io::Result<()> {
        match (self.ram, to.ram) {
            (Some(from), Some(dst)) => {
                let fd = from.swap(NO_FD, Ordering::AcqRel);
                if fd == NO_FD {
                    return Err(io::Error::from_raw_os_error(libc::ENOENT));
                }
                close_fd(dst.swap(fd, Ordering::AcqRel));
                Ok(())
            }
            (None, None) => {
                if unsafe { libc::rename(self.c_ptr(), to.c_ptr()) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
            _ => Err(io::Error::from_raw_os_error(libc::EXDEV)),
        }
    }

    /// Удалить; отсутствие файла ошибкой не считается.
    pub fn unlink(&self) -> io::Result<()> {
        if let Some(cell) = self.ram {
            close_fd(cell.swap(NO_FD, Ordering::AcqRel));
            return Ok(());
        }
        if unsafe { libc::unlink(self.c_ptr()) } != 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::ENOENT) {
                return Err(e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SnapPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Четыре пути одного поколения: финальные и временные metadata/bytes.
#[derive(Debug, Clone, Copy)]
pub struct GenerationPaths {
    pub meta: SnapPath,
    pub bytes: SnapPath,
    pub meta_tmp: SnapPath,
    pub bytes_tmp: SnapPath,
}

impl GenerationPaths {
    pub fn new(dir: &Path, kind: GenerationKind) -> io::Result<Self> {
        Ok(Self {
            meta: SnapPath::new(dir, kind, FileRole::Meta, false)?,
            bytes: SnapPath::new(dir, kind, FileRole::Bytes, false)?,
            meta_tmp: SnapPath::new(dir, kind, FileRole::Meta, true)?,
            bytes_tmp: SnapPath::new(dir, kind, FileRole::Bytes, true)?,
        })
    }

    /// Поколение в memfd вместо каталога.
    pub fn in_ram(store: &'static RamStore, kind: GenerationKind) -> io::Result<Self> {
        Ok(Self {
            meta: SnapPath::in_ram(store, kind, FileRole::Meta, false)?,
            bytes: SnapPath::in_ram(store, kind, FileRole::Bytes, false)?,
            meta_tmp: SnapPath::in_ram(store, kind, FileRole::Meta, true)?,
            bytes_tmp: SnapPath::in_ram(store, kind, FileRole::Bytes, true)?,
        })
    }

    pub fn exists(&self) -> bool {
        self.meta.exists() && self.bytes.exists()
    }

    /// Опубликовать записанное поколение: bytes раньше meta, чтобы meta
    /// никогда не ссылалась на отсутствующие байты.
    pub fn commit(&self) -> io::Result<()> {
        self.bytes_tmp.rename_to(&self.bytes)?;
        self.meta_tmp.rename_to(&self.meta)
    }

    /// Убрать недописанные временные файлы.
    pub fn discard_tmp(&self) {
        let _ = self.meta_tmp.unlink();
        let _ = self.bytes_tmp.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_and_base_names() {
        let dir = Path::new("/tmp/snaps");
        let p = GenerationPaths::new(dir, GenerationKind::Slot(3)).unwrap();
        assert_eq!(p.meta.as_path(), Path::new("/tmp/snaps/state3.pm"));
        assert_eq!(p.bytes_tmp.as_path(), Path::new("/tmp/snaps/state3.p.tmp"));
        let b = GenerationPaths::new(Path::new("/tmp/snaps/"), GenerationKind::Base).unwrap();
        assert_eq!(b.meta.as_path(), Path::new("/tmp/snaps/base.pm"));
    }

    #[test]
    fn too_long_dir_is_rejected() {
        let long = "x".repeat(PATH_MAX_BYTES);
        let err = SnapPath::new(Path::new(&long), GenerationKind::Base, FileRole::Meta, false)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENAMETOOLONG));
    }
}

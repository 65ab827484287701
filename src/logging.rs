//! Логирование для окна заморозки.
//!
//! Между freeze и resume нельзя звать аллокатор и `log` (замороженный поток может
//! держать lock аллокатора или логгера). Сообщения форматируются в стековый буфер
//! (core::fmt) и кладутся в кольцо в reserved memory. После resume кольцо сливается
//! в `log` обычным образом.
//!
//! Вне окна (и когда движок не подключён, например в тестах) макросы идут прямо в `log`.

use std::cell::UnsafeCell;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::consts::{FROZEN_LOG_ENTRIES, FROZEN_LOG_TEXT};

pub use log::Level;

/// Буфер фиксированного размера с fmt::Write; лишнее молча обрезается.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self { buf: [0u8; N], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // обрезка могла разрезать UTF-8 символ: отступаем до валидной границы
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                let ok = e.valid_up_to();
                std::str::from_utf8(&self.buf[..ok]).unwrap_or("")
            }
        }
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Entry {
    level: u8,
    len: u8,
    text: [u8; FROZEN_LOG_TEXT],
}

/// Кольцо сообщений в reserved memory. Писатель один (driver).
#[repr(C)]
pub struct FrozenLog {
    active: AtomicBool,
    head: AtomicU32,
    count: AtomicU32,
    dropped: AtomicU32,
    entries: UnsafeCell<[Entry; FROZEN_LOG_ENTRIES]>,
}

unsafe impl Sync for FrozenLog {}

static RING: AtomicPtr<FrozenLog> = AtomicPtr::new(std::ptr::null_mut());

impl FrozenLog {
    /// Инициализация на месте (память уже обнулена mmap'ом).
    pub fn reset(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Сделать кольцо глобальным приёмником frozen-макросов.
    pub fn install(&'static self) {
        RING.store(self as *const FrozenLog as *mut FrozenLog, Ordering::Release);
    }

    pub fn set_active(&self, on: bool) {
        self.active.store(on, Ordering::Release);
    }

    fn push(&self, level: log::Level, text: &[u8]) {
        let count = self.count.load(Ordering::Relaxed) as usize;
        if count == FROZEN_LOG_ENTRIES {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let head = self.head.load(Ordering::Relaxed) as usize;
        let idx = (head + count) % FROZEN_LOG_ENTRIES;
        let n = text.len().min(FROZEN_LOG_TEXT);
        // единственный писатель; читатель (drain) работает только вне окна
        let slot = unsafe { &mut (*self.entries.get())[idx] };
        slot.level = level as u8;
        slot.len = n.min(u8::MAX as usize) as u8;
        slot.text[..n].copy_from_slice(&text[..n]);
        self.count.store((count + 1) as u32, Ordering::Release);
    }

    /// Слить накопленное в `log`. Вызывать только после resume.
    pub fn drain(&self) {
        let count = self.count.load(Ordering::Acquire) as usize;
        let mut head = self.head.load(Ordering::Relaxed) as usize;
        for _ in 0..count {
            let e = unsafe { &(*self.entries.get())[head] };
            let text = String::from_utf8_lossy(&e.text[..e.len as usize]);
            log::log!(level_from_u8(e.level), "{}", text);
            head = (head + 1) % FROZEN_LOG_ENTRIES;
        }
        self.head.store(head as u32, Ordering::Relaxed);
        self.count.store(0, Ordering::Release);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("frozen log ring overflow: {} messages dropped", dropped);
        }
    }
}

fn level_from_u8(v: u8) -> log::Level {
    match v {
        1 => log::Level::Error,
        2 => log::Level::Warn,
        3 => log::Level::Info,
        4 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

/// Точка входа макросов frozen_*.
pub fn frozen_log(level: log::Level, args: fmt::Arguments<'_>) {
    let ring = RING.load(Ordering::Acquire);
    if !ring.is_null() {
        let ring = unsafe { &*ring };
        if ring.active.load(Ordering::Acquire) {
            // уровень фильтруем заранее, чтобы не тратить кольцо на trace/debug
            if level > log::max_level() {
                return;
            }
            let mut buf = StackBuf::<FROZEN_LOG_TEXT>::new();
            let _ = buf.write_fmt(args);
            ring.push(level, buf.as_bytes());
            return;
        }
    }
    log::log!(level, "{}", args);
}

#[macro_export]
macro_rules! frozen_debug {
    ($($arg:tt)*) => {
        $crate::logging::frozen_log($crate::logging::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! frozen_info {
    ($($arg:tt)*) => {
        $crate::logging::frozen_log($crate::logging::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! frozen_warn {
    ($($arg:tt)*) => {
        $crate::logging::frozen_log($crate::logging::Level::Warn, format_args!($($arg)*))
    };
}

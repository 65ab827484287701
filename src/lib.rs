#![allow(non_snake_case)]

//! SnapRewind: снимок и восстановление состояния процесса изнутри процесса.
//!
//! save(slot) замораживает все зарегистрированные потоки и пишет память процесса в
//! поколение слота; load(slot) приводит раскладку адресного пространства к
//! сохранённой, возвращает байты страниц и чинит набор потоков, после чего
//! выполнение продолжается из того save().

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("SnapRewind supports only Linux on x86_64");

// Базовые модули
pub mod consts;
pub mod config;
pub mod error;
pub mod metrics;

// Низкоуровневое: syscalls, frozen log, futex-примитивы
#[macro_use]
pub mod sys;
#[macro_use]
pub mod logging;
pub mod sync;
pub mod hash;

// Память процесса
pub mod area;     // MemoryArea, PageStatus
pub mod maps;     // /proc/self/maps → области
pub mod pagemap;  // /proc/self/pagemap, soft-dirty, чтение/запись страниц
pub mod reserved; // Reserved Memory Region

// Формат снимков: src/snapshot/{header,paths,reader,writer,inspect}.rs
pub mod snapshot;

// Восстановление
pub mod space;     // mmap/munmap/mremap/brk/mprotect
pub mod reconcile; // сверка раскладок
pub mod restore;   // копирование байт

// Потоки: src/thread/{state,context,registry,freeze,repair,clone}.rs
pub mod thread;

// Оркестратор
pub mod engine;

// Удобные реэкспорты
pub use config::{EngineBuilder, EngineConfig, SkipPolicy};
pub use engine::{Engine, FreezeHook, LogProgress, ProgressSink, Resumed};
pub use error::{SnapshotError, Status};
pub use metrics::{MetricsSnapshot, OpStats};
pub use snapshot::{GenHeader, GenerationKind};

//! Ошибки движка и коды статуса для внешней поверхности прогресса.
//!
//! - SnapshotError: публичный тип (thiserror), создаётся вне окна заморозки.
//! - OpFailure: Copy-запись для окна заморозки (без аллокаций); хранится в reserved
//!   header и превращается в SnapshotError после resume.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Коды статуса операции save/load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Feasibility = 1,
    NotFound = 2,
    ThreadSet = 3,
    Consistency = 4,
    Io = 5,
}

impl Status {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Feasibility),
            2 => Some(Status::NotFound),
            3 => Some(Status::ThreadSet),
            4 => Some(Status::Consistency),
            5 => Some(Status::Io),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Feasibility => "feasibility",
            Status::NotFound => "not-found",
            Status::ThreadSet => "thread-set",
            Status::Consistency => "consistency",
            Status::Io => "io",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("not enough free space in {}: need ~{needed} bytes, available {available}", dir.display())]
    Feasibility {
        dir: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("not enough available memory for in-RAM snapshots: need ~{needed} bytes, available {available}")]
    MemoryShortage { needed: u64, available: u64 },

    #[error("no snapshot for slot {slot}: {reason}")]
    NotFound { slot: u32, reason: String },

    #[error("thread set cannot be reconciled: {0}")]
    ThreadSet(String),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("snapshot i/o: {0}")]
    Io(#[from] io::Error),
}

impl SnapshotError {
    pub fn status(&self) -> Status {
        match self {
            SnapshotError::Feasibility { .. } | SnapshotError::MemoryShortage { .. } => {
                Status::Feasibility
            }
            SnapshotError::NotFound { .. } => Status::NotFound,
            SnapshotError::ThreadSet(_) => Status::ThreadSet,
            SnapshotError::Consistency(_) => Status::Consistency,
            SnapshotError::Io(_) => Status::Io,
        }
    }
}

/// Причина неудачи внутри окна заморозки. Только статические строки и коды errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFailure {
    pub status: Status,
    pub what: &'static str,
    /// raw errno (0 если неизвестен)
    pub os_code: i32,
}

impl OpFailure {
    pub const fn new(status: Status, what: &'static str) -> Self {
        Self {
            status,
            what,
            os_code: 0,
        }
    }

    pub fn io(what: &'static str, e: &io::Error) -> Self {
        Self {
            status: Status::Io,
            what,
            os_code: e.raw_os_error().unwrap_or(0),
        }
    }

    pub fn into_error(self, slot: u32) -> SnapshotError {
        match self.status {
            Status::NotFound => SnapshotError::NotFound {
                slot,
                reason: self.what.to_string(),
            },
            Status::ThreadSet => SnapshotError::ThreadSet(self.what.to_string()),
            Status::Io if self.os_code != 0 => SnapshotError::Io(io::Error::new(
                io::Error::from_raw_os_error(self.os_code).kind(),
                format!("{}: {}", self.what, io::Error::from_raw_os_error(self.os_code)),
            )),
            Status::Io => SnapshotError::Io(io::Error::new(io::ErrorKind::Other, self.what)),
            // Feasibility внутри окна не возникает; считаем нарушением инварианта.
            Status::Feasibility | Status::Consistency | Status::Ok => {
                SnapshotError::Consistency(self.what.to_string())
            }
        }
    }
}

/// io::Error без аллокаций: Simple-репрезентация по ErrorKind.
#[inline]
pub(crate) fn invalid_data() -> io::Error {
    io::Error::from(io::ErrorKind::InvalidData)
}

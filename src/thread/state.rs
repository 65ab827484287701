//! Жизненный цикл слота потока.
//!
//! Free → Uninitialized → Running → Signaled → SuspendInProgress → Suspended → (Running)
//! плюс Zombie (поток завершается), Terminating → Terminated.
//! Значение хранится в AtomicU32 слота; переходы: CAS.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadState {
    Free = 0,
    Uninitialized = 1,
    Running = 2,
    Signaled = 3,
    SuspendInProgress = 4,
    Suspended = 5,
    Zombie = 6,
    Terminating = 7,
    Terminated = 8,
}

impl ThreadState {
    #[inline]
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => ThreadState::Free,
            1 => ThreadState::Uninitialized,
            2 => ThreadState::Running,
            3 => ThreadState::Signaled,
            4 => ThreadState::SuspendInProgress,
            5 => ThreadState::Suspended,
            6 => ThreadState::Zombie,
            7 => ThreadState::Terminating,
            8 => ThreadState::Terminated,
            _ => return None,
        })
    }

    /// Слот занят живым (или ещё не убранным) потоком.
    pub fn is_active(self) -> bool {
        !matches!(self, ThreadState::Free | ThreadState::Terminated)
    }

    /// Допустим ли переход. Используется в debug_assert и тестах.
    pub fn can_transition(self, to: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, to),
            (Free, Uninitialized)
                // пересоздаваемый поток сразу ждёт сигнала
                | (Free, Signaled)
                | (Uninitialized, Running)
                | (Uninitialized, Free)
                | (Running, Signaled)
                | (Running, Zombie)
                | (Running, Terminating)
                | (Zombie, Signaled)
                | (Zombie, Free)
                | (Terminating, Signaled)
                | (Terminating, Terminated)
                | (Terminating, Free)
                | (Signaled, SuspendInProgress)
                | (Signaled, Free)
                | (SuspendInProgress, Suspended)
                | (Suspended, Running)
                | (Suspended, Zombie)
                | (Suspended, Terminating)
                | (Suspended, Terminated)
                | (Terminated, Signaled)
                | (Terminated, Free)
        )
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadState::Free => "free",
            ThreadState::Uninitialized => "uninitialized",
            ThreadState::Running => "running",
            ThreadState::Signaled => "signaled",
            ThreadState::SuspendInProgress => "suspend-in-progress",
            ThreadState::Suspended => "suspended",
            ThreadState::Zombie => "zombie",
            ThreadState::Terminating => "terminating",
            ThreadState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Что сделать потоку при выходе из обработчика приостановки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResumeAction {
    /// Вернуться туда, где прервали.
    Return = 0,
    /// Продолжить с сохранённого контекста (target слота).
    Teleport = 1,
    /// Завершиться (его нет в восстанавливаемом наборе).
    Exit = 2,
}

impl ResumeAction {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ResumeAction::Teleport,
            2 => ResumeAction::Exit,
            _ => ResumeAction::Return,
        }
    }
}

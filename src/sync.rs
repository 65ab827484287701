//! Примитивы синхронизации для окна заморозки (futex, без errno и без кучи).
//!
//! - FutexLock: простой mutex (0 свободен, 1 занят, 2 занят + есть ожидающие).
//! - Semaphore: счётчик с post/wait; driver ждёт N постов от потоков.
//! - Gate: «ворота» по поколению: ждущий запоминает поколение и спит, пока оно
//!   не сменится; release() открывает ворота для всех разом.
//!
//! Все структуры repr(C) и живут в reserved memory: их состояние не откатывается
//! при восстановлении памяти процесса.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::sys::{futex_wait, futex_wake};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

#[repr(C)]
#[derive(Default)]
pub struct FutexLock {
    word: AtomicU32,
}

impl FutexLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) -> FutexGuard<'_> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
        FutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<FutexGuard<'_>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FutexGuard { lock: self })
    }

    fn lock_slow(&self) {
        loop {
            if self.word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            futex_wait(&self.word, CONTENDED, None);
        }
    }

    fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.word, 1);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Принудительно освободить (после восстановления памяти владелец мог «исчезнуть»).
    pub fn force_unlock(&self) {
        self.unlock();
    }
}

pub struct FutexGuard<'a> {
    lock: &'a FutexLock,
}

impl Drop for FutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[repr(C)]
#[derive(Default)]
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Безопасен в signal handler'е.
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        futex_wake(&self.count, 1);
    }

    fn try_take(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(v) => cur = v,
            }
        }
        false
    }

    pub fn wait(&self) {
        while !self.try_take() {
            futex_wait(&self.count, 0, None);
        }
    }

    /// true: пост получен; false: истёк таймаут (одна попытка ожидания).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.try_take() {
            return true;
        }
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        futex_wait(&self.count, 0, Some(&ts));
        self.try_take()
    }

    /// Сбросить счётчик (между операциями, когда ожидающих нет).
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

#[repr(C)]
#[derive(Default)]
pub struct Gate {
    generation: AtomicU32,
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    /// Поколение читается ДО поста «suspended», иначе release может проскочить.
    #[inline]
    pub fn current(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn wait_past(&self, seen: u32) {
        while self.generation.load(Ordering::Acquire) == seen {
            futex_wait(&self.generation, seen, None);
        }
    }

    pub fn release(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        futex_wake(&self.generation, i32::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_counts_posts() {
        let s = Semaphore::new();
        s.post();
        s.post();
        assert!(s.wait_timeout(Duration::from_millis(1)));
        assert!(s.wait_timeout(Duration::from_millis(1)));
        assert!(!s.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn gate_releases_all_waiters() {
        let gate = Arc::new(Gate::new());
        let done = Arc::new(Semaphore::new());
        let seen = gate.current();
        let mut hs = Vec::new();
        for _ in 0..4 {
            let (g, d) = (gate.clone(), done.clone());
            hs.push(std::thread::spawn(move || {
                g.wait_past(seen);
                d.post();
            }));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(done.value(), 0);
        gate.release();
        for _ in 0..4 {
            done.wait();
        }
        for h in hs {
            h.join().unwrap();
        }
    }

    #[test]
    fn futex_lock_excludes() {
        let lock = Arc::new(FutexLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut hs = Vec::new();
        for _ in 0..4 {
            let (l, c) = (lock.clone(), counter.clone());
            hs.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = l.lock();
                    let v = c.load(Ordering::Relaxed);
                    c.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert!(lock.try_lock().is_some());
    }
}

//! Таблица потоков в reserved memory.
//!
//! ThreadSlot: запись одного потока (атомики + сохранённый/целевой контекст).
//! ThreadControl: общие примитивы заморозки: lock реестра, семафоры
//! suspended/resumed, gate. Registry: Copy-вид поверх них; обработчик сигнала
//! находит его через глобальный указатель, без кучи и без TLS.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::SnapshotError;
use crate::sync::{FutexLock, Gate, Semaphore};
use crate::sys;
use crate::thread::context::SavedContext;
use crate::thread::state::{ResumeAction, ThreadState};

#[repr(C)]
pub struct ThreadSlot {
    state: AtomicU32,
    orig_state: AtomicU32,
    tid: AtomicI32,
    resume: AtomicU32,
    pthread: AtomicU64,
    stack_base: AtomicU64,
    stack_size: AtomicU64,
    /// Контекст на момент приостановки (пишет сам поток в обработчике).
    context: UnsafeCell<SavedContext>,
    /// Куда телепортировать (пишет driver, пока поток запаркован).
    target: UnsafeCell<SavedContext>,
}

unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(ThreadState::Free as u32),
            orig_state: AtomicU32::new(ThreadState::Free as u32),
            tid: AtomicI32::new(0),
            resume: AtomicU32::new(ResumeAction::Return as u32),
            pthread: AtomicU64::new(0),
            stack_base: AtomicU64::new(0),
            stack_size: AtomicU64::new(0),
            context: UnsafeCell::new(SavedContext::zeroed()),
            target: UnsafeCell::new(SavedContext::zeroed()),
        }
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(ThreadState::Free)
    }

    #[inline]
    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u32, Ordering::Release);
    }

    #[inline]
    pub fn cas_state(&self, from: ThreadState, to: ThreadState) -> bool {
        debug_assert!(from.can_transition(to), "bad transition {} -> {}", from, to);
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn orig_state(&self) -> ThreadState {
        ThreadState::from_u32(self.orig_state.load(Ordering::Acquire))
            .unwrap_or(ThreadState::Running)
    }

    pub fn set_orig_state(&self, s: ThreadState) {
        self.orig_state.store(s as u32, Ordering::Release);
    }

    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::Acquire)
    }

    pub fn set_tid(&self, tid: i32) {
        self.tid.store(tid, Ordering::Release);
    }

    #[inline]
    pub fn pthread(&self) -> u64 {
        self.pthread.load(Ordering::Acquire)
    }

    pub fn set_pthread(&self, p: u64) {
        self.pthread.store(p, Ordering::Release);
    }

    /// (нижний адрес, размер) стека потока.
    pub fn stack(&self) -> (u64, u64) {
        (
            self.stack_base.load(Ordering::Relaxed),
            self.stack_size.load(Ordering::Relaxed),
        )
    }

    pub fn set_stack(&self, base: u64, size: u64) {
        self.stack_base.store(base, Ordering::Relaxed);
        self.stack_size.store(size, Ordering::Relaxed);
    }

    pub fn resume_action(&self) -> ResumeAction {
        ResumeAction::from_u32(self.resume.load(Ordering::Acquire))
    }

    pub fn set_resume_action(&self, a: ResumeAction) {
        self.resume.store(a as u32, Ordering::Release);
    }

    /// # Safety
    /// Пишет только сам поток в обработчике (или driver, пока поток запаркован).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut SavedContext {
        &mut *self.context.get()
    }

    /// # Safety
    /// Поток запаркован либо это текущий поток.
    pub unsafe fn context(&self) -> &SavedContext {
        &*self.context.get()
    }

    /// # Safety
    /// Пишет только driver, пока поток запаркован.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn target_mut(&self) -> &mut SavedContext {
        &mut *self.target.get()
    }

    /// # Safety
    /// Читает поток после открытия gate.
    pub unsafe fn target(&self) -> &SavedContext {
        &*self.target.get()
    }

    /// Вернуть слот в Free.
    pub fn clear(&self) {
        self.set_tid(0);
        self.set_pthread(0);
        self.set_stack(0, 0);
        self.set_resume_action(ResumeAction::Return);
        self.set_orig_state(ThreadState::Free);
        self.set_state(ThreadState::Free);
    }
}

impl Default for ThreadSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Общие примитивы протокола заморозки.
#[repr(C)]
pub struct ThreadControl {
    pub lock: FutexLock,
    pub suspended: Semaphore,
    pub resumed: Semaphore,
    pub gate: Gate,
    slots_addr: AtomicUsize,
    slot_count: AtomicUsize,
    altstacks_addr: AtomicUsize,
    altstack_stride: AtomicUsize,
    altstack_len: AtomicUsize,
    suspend_signal: AtomicI32,
    /// Смещение поля tid внутри struct pthread; usize::MAX: неизвестно.
    tid_offset: AtomicUsize,
}

impl ThreadControl {
    pub const fn new() -> Self {
        Self {
            lock: FutexLock::new(),
            suspended: Semaphore::new(),
            resumed: Semaphore::new(),
            gate: Gate::new(),
            slots_addr: AtomicUsize::new(0),
            slot_count: AtomicUsize::new(0),
            altstacks_addr: AtomicUsize::new(0),
            altstack_stride: AtomicUsize::new(0),
            altstack_len: AtomicUsize::new(0),
            suspend_signal: AtomicI32::new(0),
            tid_offset: AtomicUsize::new(usize::MAX),
        }
    }
}

impl Default for ThreadControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Раскладка альтернативных стеков слотов.
#[derive(Debug, Clone, Copy)]
pub struct AltStacks {
    pub first: usize,
    pub stride: usize,
    pub len: usize,
}

static CONTROL: AtomicPtr<ThreadControl> = AtomicPtr::new(std::ptr::null_mut());

#[derive(Clone, Copy)]
pub struct Registry {
    control: &'static ThreadControl,
    slots: &'static [ThreadSlot],
}

impl Registry {
    /// Разметить слоты и сделать реестр глобальным (для обработчиков сигналов).
    ///
    /// # Safety
    /// `slots` указывает на `count` записей в памяти, живущей до конца процесса.
    pub unsafe fn install(
        control: &'static ThreadControl,
        slots: *mut ThreadSlot,
        count: usize,
        altstacks: AltStacks,
        suspend_signal: i32,
    ) -> Registry {
        for i in 0..count {
            std::ptr::write(slots.add(i), ThreadSlot::new());
        }
        control.slots_addr.store(slots as usize, Ordering::Release);
        control.slot_count.store(count, Ordering::Release);
        control.altstacks_addr.store(altstacks.first, Ordering::Release);
        control.altstack_stride.store(altstacks.stride, Ordering::Release);
        control.altstack_len.store(altstacks.len, Ordering::Release);
        control.suspend_signal.store(suspend_signal, Ordering::Release);
        CONTROL.store(control as *const _ as *mut _, Ordering::Release);
        Self::from_control(control)
    }

    fn from_control(control: &'static ThreadControl) -> Registry {
        let addr = control.slots_addr.load(Ordering::Acquire);
        let count = control.slot_count.load(Ordering::Acquire);
        let slots = unsafe { std::slice::from_raw_parts(addr as *const ThreadSlot, count) };
        Registry { control, slots }
    }

    /// Реестр процесса; None, пока движок не подключён.
    pub fn global() -> Option<Registry> {
        let p = CONTROL.load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        Some(Self::from_control(unsafe { &*p }))
    }

    #[inline]
    pub fn control(&self) -> &'static ThreadControl {
        self.control
    }

    #[inline]
    pub fn slots(&self) -> &'static [ThreadSlot] {
        self.slots
    }

    #[inline]
    pub fn slot(&self, idx: usize) -> &'static ThreadSlot {
        &self.slots[idx]
    }

    pub fn suspend_signal(&self) -> i32 {
        self.control.suspend_signal.load(Ordering::Acquire)
    }

    pub fn tid_offset(&self) -> Option<usize> {
        match self.control.tid_offset.load(Ordering::Acquire) {
            usize::MAX => None,
            v => Some(v),
        }
    }

    pub fn set_tid_offset(&self, off: Option<usize>) {
        self.control
            .tid_offset
            .store(off.unwrap_or(usize::MAX), Ordering::Release);
    }

    /// (нижний адрес, длина) альтернативного стека слота.
    pub fn altstack(&self, idx: usize) -> (usize, usize) {
        let first = self.control.altstacks_addr.load(Ordering::Acquire);
        let stride = self.control.altstack_stride.load(Ordering::Acquire);
        let len = self.control.altstack_len.load(Ordering::Acquire);
        (first + idx * stride, len)
    }

    pub fn find_by_tid(&self, tid: i32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state().is_active() && s.tid() == tid)
    }

    pub fn find_by_pthread(&self, pthread: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state().is_active() && s.pthread() == pthread)
    }

    pub fn free_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == ThreadState::Free)
            .count()
    }

    /// Занять свободный слот (Free → Uninitialized). Вызывать под lock реестра.
    pub fn allocate(&self) -> Option<usize> {
        self.claim(ThreadState::Uninitialized)
    }

    /// Занять свободный слот сразу в состоянии `to`.
    /// Слоты умерших Zombie/Terminated потоков переиспользуются.
    pub fn claim(&self, to: ThreadState) -> Option<usize> {
        for (i, s) in self.slots.iter().enumerate() {
            let st = s.state();
            if matches!(st, ThreadState::Zombie | ThreadState::Terminated)
                && s.tid() != 0
                && sys::tgkill(s.tid(), 0) == -(libc::ESRCH as isize)
            {
                s.clear();
            }
            if s.state() == ThreadState::Free && s.cas_state(ThreadState::Free, to) {
                return Some(i);
            }
        }
        None
    }

    /// Зарегистрировать вызывающий поток (идемпотентно).
    pub fn register_current(&self) -> Result<usize, SnapshotError> {
        if let Some(idx) = self.find_by_tid(sys::gettid()) {
            return Ok(idx);
        }
        let idx = {
            let _g = self.control.lock.lock();
            self.allocate()
        }
        .ok_or_else(|| SnapshotError::ThreadSet("no free thread slots".into()))?;
        if let Err(e) = self.complete_registration(idx) {
            self.slot(idx).clear();
            return Err(e.into());
        }
        Ok(idx)
    }

    /// Дозаполнить слот из самого потока и перевести его в Running.
    pub fn complete_registration(&self, idx: usize) -> io::Result<()> {
        let slot = self.slot(idx);
        let (stack_base, stack_size) = current_stack()?;
        slot.set_tid(sys::gettid());
        slot.set_pthread(unsafe { libc::pthread_self() } as u64);
        slot.set_stack(stack_base, stack_size);
        slot.set_resume_action(ResumeAction::Return);
        self.install_altstack(idx)?;
        if !slot.cas_state(ThreadState::Uninitialized, ThreadState::Running) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "thread slot changed state during registration",
            ));
        }
        log::debug!("thread registered: slot={} tid={}", idx, slot.tid());
        Ok(())
    }

    /// sigaltstack на стек слота (без errno: годится и для пересоздаваемых потоков).
    pub fn install_altstack(&self, idx: usize) -> io::Result<()> {
        let (sp, len) = self.altstack(idx);
        let st = libc::stack_t {
            ss_sp: sp as *mut libc::c_void,
            ss_flags: 0,
            ss_size: len,
        };
        let r = unsafe {
            sys::raw_syscall3(
                libc::SYS_sigaltstack,
                &st as *const libc::stack_t as usize,
                0,
                0,
            )
        };
        if r < 0 {
            return Err(io::Error::from_raw_os_error(-r as i32));
        }
        Ok(())
    }

    /// Поток завершается: Running → Zombie (Terminating → Terminated).
    /// Если идёт заморозка, ждём, пока сигнал не запаркует и не отпустит нас.
    pub fn finish(&self, idx: usize) {
        let slot = self.slot(idx);
        loop {
            match slot.state() {
                ThreadState::Running => {
                    if slot.cas_state(ThreadState::Running, ThreadState::Zombie) {
                        break;
                    }
                }
                ThreadState::Terminating => {
                    if slot.cas_state(ThreadState::Terminating, ThreadState::Terminated) {
                        break;
                    }
                }
                ThreadState::Signaled | ThreadState::SuspendInProgress | ThreadState::Suspended => {
                    std::thread::yield_now();
                }
                _ => break,
            }
        }
    }

    /// Пометить поток как завершающийся (заморозка его отменит, а не запаркует).
    pub fn mark_terminating(&self, idx: usize) -> bool {
        self.slot(idx)
            .cas_state(ThreadState::Running, ThreadState::Terminating)
    }

    /// (slot, tid, state) всех занятых слотов.
    pub fn states(&self) -> Vec<(usize, i32, ThreadState)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state() != ThreadState::Free)
            .map(|(i, s)| (i, s.tid(), s.state()))
            .collect()
    }
}

/// (нижний адрес, размер) стека текущего потока.
fn current_stack() -> io::Result<(u64, u64)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok((addr as u64, size as u64))
    }
}

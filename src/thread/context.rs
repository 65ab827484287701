//! Контекст потока: снимок из ucontext обработчика и «телепорт» обратно.
//!
//! Телепорт не использует setcontext: обработчик переписывает свой ucontext
//! (gregs, содержимое FP-области, маску сигналов), и sigreturn сам переносит поток
//! на сохранённый RIP/RSP. uc_stack не трогаем: по нему ядро восстанавливает
//! настройки sigaltstack.

use crate::consts::{FPSTATE_SIZE, NGREG};
use crate::sys::raw_syscall3;

pub const REG_RSP: usize = 15;
pub const REG_RIP: usize = 16;

const ARCH_GET_FS: usize = 0x1003;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedContext {
    /// mcontext gregs в порядке ядра (REG_R8 .. REG_CR2).
    pub gregs: [u64; NGREG],
    /// FXSAVE-образ (x87/SSE, MXCSR).
    pub fpstate: [u8; FPSTATE_SIZE],
    /// Первые 64 сигнала маски.
    pub sigmask: u64,
    /// База TLS (fs).
    pub fs_base: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self {
            gregs: [0u64; NGREG],
            fpstate: [0u8; FPSTATE_SIZE],
            sigmask: 0,
            fs_base: 0,
        }
    }

    #[inline]
    pub fn ip(&self) -> u64 {
        self.gregs[REG_RIP]
    }

    #[inline]
    pub fn sp(&self) -> u64 {
        self.gregs[REG_RSP]
    }
}

impl Default for SavedContext {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// fs base текущего потока (arch_prctl, без errno).
pub fn current_fs_base() -> u64 {
    let mut v: u64 = 0;
    unsafe {
        raw_syscall3(
            libc::SYS_arch_prctl,
            ARCH_GET_FS,
            &mut v as *mut u64 as usize,
            0,
        );
    }
    v
}

/// Снять контекст прерванного кода из ucontext обработчика.
///
/// # Safety
/// `uc`: третий аргумент SA_SIGINFO-обработчика текущего потока.
pub unsafe fn capture_context(uc: *const libc::ucontext_t, out: &mut SavedContext) {
    let mc = &(*uc).uc_mcontext;
    for (dst, src) in out.gregs.iter_mut().zip(mc.gregs.iter()) {
        *dst = *src as u64;
    }
    if mc.fpregs.is_null() {
        out.fpstate = [0u8; FPSTATE_SIZE];
    } else {
        std::ptr::copy_nonoverlapping(
            mc.fpregs as *const u8,
            out.fpstate.as_mut_ptr(),
            FPSTATE_SIZE,
        );
    }
    out.sigmask = *(&(*uc).uc_sigmask as *const libc::sigset_t as *const u64);
    out.fs_base = current_fs_base();
}

/// Подменить ucontext так, чтобы sigreturn продолжил поток с `ctx`.
/// fs base не меняется: телепортируемый поток остаётся тем же pthread.
///
/// # Safety
/// `uc`: ucontext активного обработчика текущего потока.
pub unsafe fn install_context(uc: *mut libc::ucontext_t, ctx: &SavedContext) {
    let mc = &mut (*uc).uc_mcontext;
    for (dst, src) in mc.gregs.iter_mut().zip(ctx.gregs.iter()) {
        *dst = *src as libc::greg_t;
    }
    if !mc.fpregs.is_null() {
        std::ptr::copy_nonoverlapping(ctx.fpstate.as_ptr(), mc.fpregs as *mut u8, FPSTATE_SIZE);
    }
    *(&mut (*uc).uc_sigmask as *mut libc::sigset_t as *mut u64) = ctx.sigmask;
}

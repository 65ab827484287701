//! Тонкие обёртки над syscalls, безопасные внутри signal handler'ов.
//!
//! Прямые `syscall` через inline asm не трогают errno: поток, чья TLS могла быть
//! перезаписана восстановлением памяти, не должен писать в неё ничего.
//! Возврат: сырое значение ядра (отрицательный errno при ошибке).

use std::fmt::{self, Write as _};

use crate::logging::StackBuf;

#[inline(always)]
pub unsafe fn raw_syscall1(n: libc::c_long, a1: usize) -> isize {
    let ret: isize;
    core::arch::asm!(
        "syscall",
        inlateout("rax") (n as isize) => ret,
        in("rdi") a1,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

#[inline(always)]
pub unsafe fn raw_syscall3(n: libc::c_long, a1: usize, a2: usize, a3: usize) -> isize {
    let ret: isize;
    core::arch::asm!(
        "syscall",
        inlateout("rax") (n as isize) => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

#[inline(always)]
pub unsafe fn raw_syscall4(n: libc::c_long, a1: usize, a2: usize, a3: usize, a4: usize) -> isize {
    let ret: isize;
    core::arch::asm!(
        "syscall",
        inlateout("rax") (n as isize) => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

#[inline]
pub fn gettid() -> i32 {
    unsafe { raw_syscall1(libc::SYS_gettid, 0) as i32 }
}

#[inline]
pub fn getpid() -> i32 {
    unsafe { raw_syscall1(libc::SYS_getpid, 0) as i32 }
}

/// tgkill(getpid(), tid, sig). Возвращает 0 или -errno.
#[inline]
pub fn tgkill(tid: i32, sig: i32) -> isize {
    unsafe {
        raw_syscall3(
            libc::SYS_tgkill,
            getpid() as usize,
            tid as usize,
            sig as usize,
        )
    }
}

/// FUTEX_WAIT_PRIVATE; `timeout` = None: без ограничения.
#[inline]
pub fn futex_wait(
    word: &std::sync::atomic::AtomicU32,
    expected: u32,
    timeout: Option<&libc::timespec>,
) -> isize {
    let ts = match timeout {
        Some(t) => t as *const libc::timespec as usize,
        None => 0,
    };
    unsafe {
        raw_syscall4(
            libc::SYS_futex,
            word.as_ptr() as usize,
            (libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG) as usize,
            expected as usize,
            ts,
        )
    }
}

#[inline]
pub fn futex_wake(word: &std::sync::atomic::AtomicU32, count: i32) -> isize {
    unsafe {
        raw_syscall3(
            libc::SYS_futex,
            word.as_ptr() as usize,
            (libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG) as usize,
            count as usize,
        )
    }
}

/// Завершить только текущий поток, не трогая clear_child_tid: память pthread
/// могла уже принадлежать восстановленному образу.
pub fn exit_thread_silently() -> ! {
    unsafe {
        raw_syscall1(libc::SYS_set_tid_address, 0);
        loop {
            raw_syscall1(libc::SYS_exit, 0);
        }
    }
}

/// sigprocmask(SIG_UNBLOCK) для одного сигнала (kernel sigset = 8 байт).
pub fn unblock_signal(sig: i32) {
    let set: u64 = 1u64 << ((sig - 1) as u64);
    unsafe {
        raw_syscall4(
            libc::SYS_rt_sigprocmask,
            libc::SIG_UNBLOCK as usize,
            &set as *const u64 as usize,
            0,
            8,
        );
    }
}

fn write_stderr(bytes: &[u8]) {
    let mut off = 0;
    while off < bytes.len() {
        let n = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes[off..].as_ptr() as *const libc::c_void,
                bytes.len() - off,
            )
        };
        if n <= 0 {
            break;
        }
        off += n as usize;
    }
}

/// Фатальная ошибка: продолжать нельзя (память может быть частично восстановлена).
/// Не аллоцирует: write(2) + abort.
pub fn fatal(msg: &str) -> ! {
    write_stderr(b"snaprewind: fatal: ");
    write_stderr(msg.as_bytes());
    write_stderr(b"\n");
    unsafe { libc::abort() }
}

pub fn fatal_fmt(args: fmt::Arguments<'_>) -> ! {
    let mut buf = StackBuf::<256>::new();
    let _ = buf.write_fmt(args);
    fatal(buf.as_str())
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::sys::fatal_fmt(format_args!($($arg)*))
    };
}

//! Пересоздание потока из сохранённого образа (raw clone, без pthread_create).
//!
//! Новый поток получает TLS (fs base) и struct pthread исходного потока: обе лежат
//! в уже восстановленной памяти. Стек: временный участок ниже сохранённого SP.
//! Ребёнок ставит свой sigaltstack, снимает блокировку сигнала приостановки и
//! сигналит сам себе: дальше он паркуется обычным обработчиком и при resume
//! телепортируется в сохранённый контекст.

use crate::error::{OpFailure, Status};
use crate::snapshot::header::ThreadImage;
use crate::sys;
use crate::thread::freeze::FreezeParams;
use crate::thread::registry::Registry;
use crate::thread::state::{ResumeAction, ThreadState};

/// Red zone + запас под кадры child_entry.
const CHILD_STACK_GAP: u64 = 128 + 256;
/// Минимум места между временным стеком и низом стека потока.
const CHILD_STACK_MIN: u64 = 16 * 1024;
/// Сколько байт struct pthread просматривать в поисках поля tid.
const TID_SCAN_BYTES: usize = 2048;

const CLONE_FLAGS: libc::c_int = libc::CLONE_VM
    | libc::CLONE_FS
    | libc::CLONE_FILES
    | libc::CLONE_SIGHAND
    | libc::CLONE_THREAD
    | libc::CLONE_SYSVSEM
    | libc::CLONE_SETTLS
    | libc::CLONE_PARENT_SETTID
    | libc::CLONE_CHILD_CLEARTID;

type ChildEntry = extern "C" fn(usize) -> !;

/// clone(2) с передачей управления в `entry(arg)` на новом стеке.
/// Родителю возвращает tid ребёнка или -errno.
unsafe fn raw_clone(
    flags: usize,
    stack_top: usize,
    ptid: usize,
    ctid: usize,
    tls: usize,
    entry: ChildEntry,
    arg: usize,
) -> isize {
    let ret: isize;
    core::arch::asm!(
        "syscall",
        "test rax, rax",
        "jnz 2f",
        // ребёнок: чистый кадр, entry(arg) не возвращается
        "xor ebp, ebp",
        "mov rdi, r12",
        "call r13",
        "ud2",
        "2:",
        inlateout("rax") libc::SYS_clone as isize => ret,
        in("rdi") flags,
        in("rsi") stack_top,
        in("rdx") ptid,
        in("r10") ctid,
        in("r8") tls,
        in("r12") arg,
        in("r13") entry as usize,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack)
    );
    ret
}

/// Точка входа пересозданного потока. TLS уже чужая (образ), поэтому только
/// атомики реестра и сырые syscalls.
extern "C" fn child_entry(slot_idx: usize) -> ! {
    let Some(reg) = Registry::global() else {
        sys::exit_thread_silently()
    };
    let slot = reg.slot(slot_idx);
    let tid = sys::gettid();
    slot.set_tid(tid);
    if reg.install_altstack(slot_idx).is_err() {
        sys::fatal("recreated thread: sigaltstack failed");
    }
    sys::unblock_signal(reg.suspend_signal());
    sys::tgkill(tid, reg.suspend_signal());
    loop {
        unsafe { sys::raw_syscall1(libc::SYS_pause, 0) };
    }
}

/// Вершина временного стека ребёнка (выровнена на 16).
pub fn child_stack_top(img: &ThreadImage) -> Option<usize> {
    let sp = img.context.sp();
    if sp < CHILD_STACK_GAP {
        return None;
    }
    let top = (sp - CHILD_STACK_GAP) & !15;
    if top < img.stack_base || top - img.stack_base < CHILD_STACK_MIN {
        return None;
    }
    Some(top as usize)
}

/// Пересоздать поток образа `img` и дождаться, пока он запаркуется.
/// Вызывать под lock реестра, когда остальные потоки заморожены.
pub fn recreate_thread(
    reg: &Registry,
    img: &ThreadImage,
    params: &FreezeParams,
) -> Result<usize, OpFailure> {
    let tid_offset = reg
        .tid_offset()
        .ok_or(OpFailure::new(Status::ThreadSet, "pthread tid offset unknown"))?;
    let top = child_stack_top(img).ok_or(OpFailure::new(
        Status::ThreadSet,
        "no room below saved stack pointer for a recreated thread",
    ))?;
    let idx = reg
        .claim(ThreadState::Signaled)
        .ok_or(OpFailure::new(Status::ThreadSet, "no free thread slot"))?;

    let slot = reg.slot(idx);
    slot.set_tid(0);
    slot.set_pthread(img.pthread);
    slot.set_stack(img.stack_base, img.stack_size);
    slot.set_orig_state(ThreadState::from_u32(img.state).unwrap_or(ThreadState::Running));
    unsafe { *slot.target_mut() = img.context };
    slot.set_resume_action(ResumeAction::Teleport);

    let tid_field = img.pthread as usize + tid_offset;
    let r = unsafe {
        raw_clone(
            CLONE_FLAGS as usize,
            top,
            tid_field,
            tid_field,
            img.context.fs_base as usize,
            child_entry,
            idx,
        )
    };
    if r < 0 {
        slot.clear();
        return Err(OpFailure {
            status: Status::Io,
            what: "clone failed",
            os_code: -r as i32,
        });
    }

    // общего таймаута нет, как и у заморозки
    let ctl = reg.control();
    while slot.state() != ThreadState::Suspended {
        ctl.suspended.wait_timeout(params.poll);
    }
    Ok(idx)
}

/// Найти смещение поля tid в struct pthread: значение совпадает с gettid() у
/// текущего потока и у вспомогательного. Вызывается при attach (вне окна).
pub fn discover_tid_offset() -> Option<usize> {
    let me = unsafe { libc::pthread_self() } as usize;
    let tid = sys::gettid();
    for off in (0..TID_SCAN_BYTES).step_by(4) {
        let v = unsafe { std::ptr::read_volatile((me + off) as *const i32) };
        if v != tid {
            continue;
        }
        let confirmed = std::thread::Builder::new()
            .name("sr-tid-probe".into())
            .spawn(move || {
                let p = unsafe { libc::pthread_self() } as usize;
                unsafe { std::ptr::read_volatile((p + off) as *const i32) == sys::gettid() }
            })
            .ok()
            .and_then(|h| h.join().ok())
            .unwrap_or(false);
        if confirmed {
            log::debug!("pthread tid offset: {:#x}", off);
            return Some(off);
        }
    }
    log::warn!("pthread tid offset not found; thread recreation disabled");
    None
}

//! Stop-the-world через сигналы.
//!
//! freeze_all: каждому зарегистрированному потоку (кроме driver) Running/Zombie →
//! Signaled + tgkill(SIGRTMIN+4). Обработчик сохраняет контекст, постит
//! `suspended` и спит на gate. Driver опрашивает состояния слотов, пока все не
//! станут Suspended. resume_all открывает gate один раз и ждёт по одному посту
//! `resumed` на каждый запаркованный поток.
//!
//! Код между freeze и resume не аллоцирует и не пишет в `log`.

use std::io;
use std::time::{Duration, Instant};

use crate::error::{OpFailure, Status};
use crate::metrics::OpStats;
use crate::sys;
use crate::thread::context::{capture_context, install_context};
use crate::thread::registry::Registry;
use crate::thread::state::{ResumeAction, ThreadState};

/// Повторный сигнал раз в столько раундов опроса.
const RESIGNAL_EVERY: u64 = 16;

pub type SigHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// sigaction(SA_SIGINFO | SA_ONSTACK | SA_RESTART). `block`: сигналы, маскируемые
/// на время обработчика.
pub fn install_handler(sig: i32, handler: SigHandler, block: &[i32]) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        for b in block {
            libc::sigaddset(&mut sa.sa_mask, *b);
        }
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Обработчик приостановки. Работает на альтернативном стеке слота.
pub extern "C" fn on_suspend(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let errno = unsafe { *libc::__errno_location() };
    let Some(reg) = Registry::global() else {
        return;
    };
    let Some(idx) = reg.find_by_tid(sys::gettid()) else {
        return;
    };
    let slot = reg.slot(idx);
    // лишний (повторный) сигнал: поток уже обработан
    if !slot.cas_state(ThreadState::Signaled, ThreadState::SuspendInProgress) {
        return;
    }
    unsafe { capture_context(uc as *const libc::ucontext_t, slot.context_mut()) };

    let ctl = reg.control();
    let seen = ctl.gate.current();
    slot.set_state(ThreadState::Suspended);
    ctl.suspended.post();
    ctl.gate.wait_past(seen);

    match slot.resume_action() {
        ResumeAction::Teleport => {
            // errno не трогаем: TLS уже принадлежит восстановленному образу
            unsafe { install_context(uc as *mut libc::ucontext_t, slot.target()) };
        }
        ResumeAction::Exit => {
            slot.set_state(ThreadState::Terminated);
            ctl.resumed.post();
            sys::exit_thread_silently();
        }
        ResumeAction::Return => unsafe { *libc::__errno_location() = errno },
    }
    slot.set_resume_action(ResumeAction::Return);
    slot.set_state(slot.orig_state());
    ctl.resumed.post();
}

#[derive(Debug, Clone, Copy)]
pub struct FreezeParams {
    pub poll: Duration,
    pub terminate_wait: Duration,
}

fn signal_slot(reg: &Registry, idx: usize, stats: &mut OpStats) {
    let slot = reg.slot(idx);
    if sys::tgkill(slot.tid(), reg.suspend_signal()) == -(libc::ESRCH as isize) {
        // поток успел выйти: больше не ждём его
        crate::frozen_debug!("freeze: tid {} is gone, slot {} dropped", slot.tid(), idx);
        slot.clear();
        stats.threads_dropped += 1;
    }
}

/// Отмена Terminating-потока с ограниченным ожиданием; по таймауту: обычная приостановка.
fn wait_out_terminating(reg: &Registry, idx: usize, params: &FreezeParams, stats: &mut OpStats) {
    let slot = reg.slot(idx);
    let pthread = slot.pthread();
    if pthread != 0 {
        unsafe { libc::pthread_cancel(pthread as libc::pthread_t) };
    }
    let deadline = Instant::now() + params.terminate_wait;
    while slot.state() == ThreadState::Terminating && Instant::now() < deadline {
        std::thread::sleep(params.poll);
    }
    if slot.state() == ThreadState::Terminating {
        slot.set_orig_state(ThreadState::Terminating);
        if slot.cas_state(ThreadState::Terminating, ThreadState::Signaled) {
            crate::frozen_warn!("freeze: slot {} did not terminate in time, suspending", idx);
            signal_slot(reg, idx, stats);
        }
    }
}

/// Запарковать все потоки, кроме `driver`. Общего таймаута нет: частичная
/// заморозка не даёт согласованного снимка.
pub fn freeze_all(
    reg: &Registry,
    driver: usize,
    params: &FreezeParams,
    stats: &mut OpStats,
) -> Result<(), OpFailure> {
    let ctl = reg.control();
    let slots = reg.slots();
    ctl.suspended.reset();

    // регистрация, начатая до захвата lock реестра, должна успеть завершиться
    let deadline = Instant::now() + params.terminate_wait;
    while slots
        .iter()
        .enumerate()
        .any(|(i, s)| i != driver && s.state() == ThreadState::Uninitialized)
    {
        if Instant::now() >= deadline {
            return Err(OpFailure::new(
                Status::ThreadSet,
                "thread registration did not complete before freeze",
            ));
        }
        std::thread::sleep(params.poll);
    }

    for (i, slot) in slots.iter().enumerate() {
        if i == driver {
            continue;
        }
        match slot.state() {
            st @ (ThreadState::Running | ThreadState::Zombie | ThreadState::Terminated) => {
                if slot.tid() == 0 {
                    continue;
                }
                slot.set_orig_state(st);
                if slot.cas_state(st, ThreadState::Signaled) {
                    signal_slot(reg, i, stats);
                }
            }
            ThreadState::Terminating => wait_out_terminating(reg, i, params, stats),
            _ => {}
        }
    }

    let mut rounds = 0u64;
    loop {
        let mut waiting = false;
        for (i, slot) in slots.iter().enumerate() {
            if i == driver {
                continue;
            }
            match slot.state() {
                ThreadState::Signaled => {
                    waiting = true;
                    if rounds > 0 && rounds % RESIGNAL_EVERY == 0 {
                        signal_slot(reg, i, stats);
                    }
                }
                ThreadState::SuspendInProgress => waiting = true,
                _ => {}
            }
        }
        if !waiting {
            break;
        }
        ctl.suspended.wait_timeout(params.poll);
        rounds += 1;
    }
    stats.freeze_rounds += rounds;
    crate::frozen_debug!("freeze: all threads parked after {} rounds", rounds);
    Ok(())
}

/// Открыть gate и дождаться, пока каждый запаркованный поток выйдет из обработчика.
pub fn resume_all(reg: &Registry, driver: usize) -> usize {
    let ctl = reg.control();
    let parked = reg
        .slots()
        .iter()
        .enumerate()
        .filter(|(i, s)| *i != driver && s.state() == ThreadState::Suspended)
        .count();
    ctl.resumed.reset();
    ctl.gate.release();
    for _ in 0..parked {
        ctl.resumed.wait();
    }
    ctl.suspended.reset();
    parked
}

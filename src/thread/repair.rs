//! Починка набора потоков после восстановления памяти.
//!
//! План строится чистой функцией по ключам pthread (адрес struct pthread живёт в
//! восстановленной памяти, поэтому однозначно связывает образ и слот):
//! - есть в обоих наборах → Keep: поток телепортируется в сохранённый контекст;
//! - только live → Exit;
//! - только saved → Recreate через raw clone.
//!
//! Сначала проверяется выполнимость, и только потом вызывается `emit`: dry-run
//! (feasibility) и применение видят один и тот же план.

use thiserror::Error;

use crate::error::{OpFailure, Status};
use crate::metrics::OpStats;
use crate::snapshot::header::ThreadImage;
use crate::thread::clone::recreate_thread;
use crate::thread::freeze::FreezeParams;
use crate::thread::registry::{Registry, ThreadSlot};
use crate::thread::state::{ResumeAction, ThreadState};

/// Ключ потока для сопоставления. None: слот не участвует.
pub trait ThreadKey {
    fn key(&self) -> Option<u64>;
}

impl ThreadKey for u64 {
    fn key(&self) -> Option<u64> {
        Some(*self)
    }
}

impl ThreadKey for Option<u64> {
    fn key(&self) -> Option<u64> {
        *self
    }
}

impl ThreadKey for ThreadImage {
    fn key(&self) -> Option<u64> {
        Some(self.pthread)
    }
}

impl ThreadKey for ThreadSlot {
    fn key(&self) -> Option<u64> {
        if self.state().is_active() && self.pthread() != 0 {
            Some(self.pthread())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    /// live-слот продолжит с образа `image`.
    Keep { live: usize, image: usize },
    Exit { live: usize },
    Recreate { image: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub kept: usize,
    pub exited: usize,
    pub recreated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairLimits {
    pub free_slots: usize,
    /// Известно смещение tid в struct pthread (без него clone невозможен).
    pub can_recreate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("driver thread is not in the saved thread set")]
    DriverMissing,
    #[error("threads must be recreated but the pthread tid offset is unknown")]
    CannotRecreate,
    #[error("not enough free thread slots: need {needed}, have {free}")]
    NoFreeSlots { needed: usize, free: usize },
}

impl RepairError {
    pub fn what(&self) -> &'static str {
        match self {
            RepairError::DriverMissing => "driver thread is not in the saved thread set",
            RepairError::CannotRecreate => "pthread tid offset unknown, cannot recreate threads",
            RepairError::NoFreeSlots { .. } => "not enough free thread slots for recreation",
        }
    }
}

fn position_of<K: ThreadKey>(set: &[K], key: u64) -> Option<usize> {
    set.iter().position(|k| k.key() == Some(key))
}

/// Сопоставить сохранённый и живой наборы потоков.
pub fn plan_thread_repair<S, L, F>(
    saved: &[S],
    live: &[L],
    driver: u64,
    limits: RepairLimits,
    mut emit: F,
) -> Result<RepairSummary, RepairError>
where
    S: ThreadKey,
    L: ThreadKey,
    F: FnMut(RepairStep),
{
    if position_of(saved, driver).is_none() {
        return Err(RepairError::DriverMissing);
    }
    let recreate = saved
        .iter()
        .filter(|s| matches!(s.key(), Some(k) if position_of(live, k).is_none()))
        .count();
    if recreate > 0 {
        if !limits.can_recreate {
            return Err(RepairError::CannotRecreate);
        }
        if recreate > limits.free_slots {
            return Err(RepairError::NoFreeSlots {
                needed: recreate,
                free: limits.free_slots,
            });
        }
    }

    let mut sum = RepairSummary::default();
    for (li, l) in live.iter().enumerate() {
        let Some(k) = l.key() else { continue };
        match position_of(saved, k) {
            Some(si) => {
                emit(RepairStep::Keep { live: li, image: si });
                sum.kept += 1;
            }
            None => {
                emit(RepairStep::Exit { live: li });
                sum.exited += 1;
            }
        }
    }
    for (si, s) in saved.iter().enumerate() {
        let Some(k) = s.key() else { continue };
        if position_of(live, k).is_none() {
            emit(RepairStep::Recreate { image: si });
            sum.recreated += 1;
        }
    }
    Ok(sum)
}

/// Лимиты для текущего реестра.
pub fn registry_limits(reg: &Registry) -> RepairLimits {
    RepairLimits {
        free_slots: reg.free_slots(),
        can_recreate: reg.tid_offset().is_some(),
    }
}

/// Записать живой tid в поле tid struct pthread восстановленного образа.
fn patch_pthread_tid(pthread: u64, offset: usize, tid: i32) {
    if pthread == 0 {
        return;
    }
    unsafe { std::ptr::write_volatile((pthread as usize + offset) as *mut i32, tid) };
}

/// Применить план к запаркованным потокам. Driver (Keep на `driver`) пропускается:
/// его контекст ставит checkpoint-обработчик.
pub fn apply_thread_repair(
    reg: &Registry,
    driver: usize,
    images: &[ThreadImage],
    params: &FreezeParams,
    stats: &mut OpStats,
) -> Result<RepairSummary, OpFailure> {
    let driver_pthread = reg.slot(driver).pthread();
    let tid_offset = reg.tid_offset();
    let mut failure: Option<OpFailure> = None;

    let sum = plan_thread_repair(
        images,
        reg.slots(),
        driver_pthread,
        registry_limits(reg),
        |step| {
            if failure.is_some() {
                return;
            }
            match step {
                RepairStep::Keep { live, .. } if live == driver => {}
                RepairStep::Keep { live, image } => {
                    let slot = reg.slot(live);
                    let img = &images[image];
                    unsafe { *slot.target_mut() = img.context };
                    slot.set_orig_state(
                        ThreadState::from_u32(img.state).unwrap_or(ThreadState::Running),
                    );
                    slot.set_stack(img.stack_base, img.stack_size);
                    if let Some(off) = tid_offset {
                        patch_pthread_tid(img.pthread, off, slot.tid());
                    }
                    slot.set_resume_action(ResumeAction::Teleport);
                }
                RepairStep::Exit { live } => {
                    crate::frozen_debug!(
                        "repair: slot {} (tid {}) exits",
                        live,
                        reg.slot(live).tid()
                    );
                    reg.slot(live).set_resume_action(ResumeAction::Exit);
                    stats.threads_terminated += 1;
                }
                RepairStep::Recreate { image } => {
                    match recreate_thread(reg, &images[image], params) {
                        Ok(idx) => {
                            crate::frozen_debug!("repair: image {} recreated in slot {}", image, idx);
                            stats.threads_recreated += 1;
                        }
                        Err(f) => failure = Some(f),
                    }
                }
            }
        },
    )
    .map_err(|e| OpFailure::new(Status::ThreadSet, e.what()))?;

    match failure {
        Some(f) => Err(f),
        None => Ok(sum),
    }
}

// tests/thread_repair_plan.rs
//
// Запуск только этого файла:
//   cargo test --test thread_repair_plan -- --nocapture
//
// Покрываем план починки набора потоков (чистая функция, без реальных потоков):
// 1) saved {1,2,3} vs live {1,2,4}, driver 1 → Keep, Keep, Exit, Recreate.
// 2) Пустые live-слоты (None) пропускаются, индексы live сохраняются.
// 3) Ошибки: driver не в снимке, нет tid offset, не хватает слотов.
//    При ошибке emit не вызывается ни разу.
// 4) Жизненный цикл ThreadState: коды, активность, переходы, Display.

use anyhow::Result;

use SnapRewind::thread::{
    plan_thread_repair, RepairError, RepairLimits, RepairStep, RepairSummary, ResumeAction,
    ThreadState,
};

const ROOMY: RepairLimits = RepairLimits {
    free_slots: 8,
    can_recreate: true,
};

fn plan(
    saved: &[u64],
    live: &[Option<u64>],
    driver: u64,
    limits: RepairLimits,
) -> (Result<RepairSummary, RepairError>, Vec<RepairStep>) {
    let mut steps = Vec::new();
    let r = plan_thread_repair(saved, live, driver, limits, |s| steps.push(s));
    (r, steps)
}

#[test]
fn keep_exit_recreate() -> Result<()> {
    let (r, steps) = plan(&[1, 2, 3], &[Some(1), Some(2), Some(4)], 1, ROOMY);
    let sum = r?;
    assert_eq!(
        steps,
        vec![
            RepairStep::Keep { live: 0, image: 0 },
            RepairStep::Keep { live: 1, image: 1 },
            RepairStep::Exit { live: 2 },
            RepairStep::Recreate { image: 2 },
        ]
    );
    assert_eq!(
        sum,
        RepairSummary {
            kept: 2,
            exited: 1,
            recreated: 1
        }
    );
    Ok(())
}

#[test]
fn empty_live_slots_are_ignored() -> Result<()> {
    // слоты 1 и 3 свободны; порядок в saved другой
    let (r, steps) = plan(&[20, 10], &[Some(10), None, Some(20), None], 10, ROOMY);
    r?;
    assert_eq!(
        steps,
        vec![
            RepairStep::Keep { live: 0, image: 1 },
            RepairStep::Keep { live: 2, image: 0 },
        ]
    );
    Ok(())
}

#[test]
fn nothing_to_recreate_needs_no_tid_offset() -> Result<()> {
    let limits = RepairLimits {
        free_slots: 0,
        can_recreate: false,
    };
    let (r, steps) = plan(&[7], &[Some(7), Some(8)], 7, limits);
    assert_eq!(
        r?,
        RepairSummary {
            kept: 1,
            exited: 1,
            recreated: 0
        }
    );
    assert_eq!(steps.len(), 2);
    Ok(())
}

#[test]
fn infeasible_plans_emit_nothing() {
    let (r, steps) = plan(&[2, 3], &[Some(1), Some(2)], 1, ROOMY);
    assert_eq!(r, Err(RepairError::DriverMissing));
    assert!(steps.is_empty());

    let no_offset = RepairLimits {
        free_slots: 8,
        can_recreate: false,
    };
    let (r, steps) = plan(&[1, 5], &[Some(1)], 1, no_offset);
    assert_eq!(r, Err(RepairError::CannotRecreate));
    assert!(steps.is_empty());

    let tight = RepairLimits {
        free_slots: 1,
        can_recreate: true,
    };
    let (r, steps) = plan(&[1, 5, 6], &[Some(1)], 1, tight);
    assert_eq!(r, Err(RepairError::NoFreeSlots { needed: 2, free: 1 }));
    assert!(steps.is_empty());

    let msg = RepairError::NoFreeSlots { needed: 2, free: 1 }.to_string();
    assert!(msg.contains("need 2"), "{}", msg);
}

#[test]
fn thread_state_codes_and_activity() {
    for v in 0..9u32 {
        let st = ThreadState::from_u32(v).expect("known state");
        assert_eq!(st.to_u32(), v);
    }
    assert_eq!(ThreadState::from_u32(9), None);

    assert!(!ThreadState::Free.is_active());
    assert!(!ThreadState::Terminated.is_active());
    for st in [
        ThreadState::Uninitialized,
        ThreadState::Running,
        ThreadState::Suspended,
        ThreadState::Zombie,
        ThreadState::Terminating,
    ] {
        assert!(st.is_active(), "{} must be active", st);
    }

    assert_eq!(ThreadState::SuspendInProgress.to_string(), "suspend-in-progress");
    assert_eq!(ResumeAction::from_u32(1), ResumeAction::Teleport);
    assert_eq!(ResumeAction::from_u32(2), ResumeAction::Exit);
    assert_eq!(ResumeAction::from_u32(77), ResumeAction::Return);
}

#[test]
fn thread_state_transitions() {
    use ThreadState::*;
    // обычный цикл заморозки
    let cycle = [Running, Signaled, SuspendInProgress, Suspended, Running];
    for w in cycle.windows(2) {
        assert!(w[0].can_transition(w[1]), "{} -> {}", w[0], w[1]);
    }
    // регистрация и выход
    assert!(Free.can_transition(Uninitialized));
    assert!(Uninitialized.can_transition(Running));
    assert!(Running.can_transition(Zombie));
    assert!(Zombie.can_transition(Free));
    assert!(Terminating.can_transition(Terminated));
    assert!(Terminated.can_transition(Free));
    // пересоздание: слот сразу ждёт сигнала
    assert!(Free.can_transition(Signaled));

    assert!(!Free.can_transition(Running));
    assert!(!Suspended.can_transition(Signaled));
    assert!(!Running.can_transition(Suspended));
    assert!(!Terminated.can_transition(Running));
}

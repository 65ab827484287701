//! Lightweight global metrics for SnapRewind.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Save / Load (операции, ошибки)
//! - Pages (статусы страниц, байты payload)
//! - Reconcile (map/unmap/remap/brk/protect)
//! - Threads (заморозка, пересоздание, завершение)
//!
//! Внутри окна заморозки счётчики НЕ трогаются: они лежат в .bss, которая входит в
//! снимок. Статистика копится в Copy-записи (OpStats) в reserved memory и
//! переносится сюда после resume. Успешный load откатывает .bss к моменту save,
//! поэтому load учитывается уже в продолжении save.

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Save / Load -----
static SAVES_TOTAL: AtomicU64 = AtomicU64::new(0);
static LOADS_TOTAL: AtomicU64 = AtomicU64::new(0);
static SAVE_FAILURES: AtomicU64 = AtomicU64::new(0);
static LOAD_FAILURES: AtomicU64 = AtomicU64::new(0);
static BASE_WRITES: AtomicU64 = AtomicU64::new(0);

// ----- Pages -----
static PAGES_NO_PAGE: AtomicU64 = AtomicU64::new(0);
static PAGES_ZERO: AtomicU64 = AtomicU64::new(0);
static PAGES_UNCHANGED: AtomicU64 = AtomicU64::new(0);
static PAGES_COMPRESSED: AtomicU64 = AtomicU64::new(0);
static PAGES_RAW: AtomicU64 = AtomicU64::new(0);
static PAYLOAD_BYTES: AtomicU64 = AtomicU64::new(0);
static PAGES_RESTORED: AtomicU64 = AtomicU64::new(0);
static PAGES_SKIPPED_ON_LOAD: AtomicU64 = AtomicU64::new(0);

// ----- Reconcile -----
static RECONCILE_MAPS: AtomicU64 = AtomicU64::new(0);
static RECONCILE_UNMAPS: AtomicU64 = AtomicU64::new(0);
static RECONCILE_REMAPS: AtomicU64 = AtomicU64::new(0);
static RECONCILE_BRK: AtomicU64 = AtomicU64::new(0);
static RECONCILE_PROTECTS: AtomicU64 = AtomicU64::new(0);

// ----- Threads -----
static FREEZE_ROUNDS: AtomicU64 = AtomicU64::new(0);
static THREADS_RECREATED: AtomicU64 = AtomicU64::new(0);
static THREADS_TERMINATED: AtomicU64 = AtomicU64::new(0);
static THREADS_DROPPED: AtomicU64 = AtomicU64::new(0);

/// Счётчики одной операции (накапливаются в окне заморозки).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub pages_no_page: u64,
    pub pages_zero: u64,
    pub pages_unchanged: u64,
    pub pages_compressed: u64,
    pub pages_raw: u64,
    pub payload_bytes: u64,
    pub pages_restored: u64,
    pub pages_skipped: u64,

    pub maps: u64,
    pub unmaps: u64,
    pub remaps: u64,
    pub brks: u64,
    pub protects: u64,

    pub freeze_rounds: u64,
    pub threads_recreated: u64,
    pub threads_terminated: u64,
    pub threads_dropped: u64,

    pub base_written: bool,
    pub hash_mismatches: u64,
}

impl OpStats {
    /// Прибавить счётчики другой записи (base + slot одной заморозки).
    pub fn absorb(&mut self, o: &OpStats) {
        self.pages_no_page += o.pages_no_page;
        self.pages_zero += o.pages_zero;
        self.pages_unchanged += o.pages_unchanged;
        self.pages_compressed += o.pages_compressed;
        self.pages_raw += o.pages_raw;
        self.payload_bytes += o.payload_bytes;
        self.pages_restored += o.pages_restored;
        self.pages_skipped += o.pages_skipped;
        self.maps += o.maps;
        self.unmaps += o.unmaps;
        self.remaps += o.remaps;
        self.brks += o.brks;
        self.protects += o.protects;
        self.freeze_rounds += o.freeze_rounds;
        self.threads_recreated += o.threads_recreated;
        self.threads_terminated += o.threads_terminated;
        self.threads_dropped += o.threads_dropped;
        self.base_written |= o.base_written;
        self.hash_mismatches += o.hash_mismatches;
    }

    pub fn pages_total(&self) -> u64 {
        self.pages_no_page
            + self.pages_zero
            + self.pages_unchanged
            + self.pages_compressed
            + self.pages_raw
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Save / Load
    pub saves_total: u64,
    pub loads_total: u64,
    pub save_failures: u64,
    pub load_failures: u64,
    pub base_writes: u64,

    // Pages
    pub pages_no_page: u64,
    pub pages_zero: u64,
    pub pages_unchanged: u64,
    pub pages_compressed: u64,
    pub pages_raw: u64,
    pub payload_bytes: u64,
    pub pages_restored: u64,
    pub pages_skipped_on_load: u64,

    // Reconcile
    pub reconcile_maps: u64,
    pub reconcile_unmaps: u64,
    pub reconcile_remaps: u64,
    pub reconcile_brk: u64,
    pub reconcile_protects: u64,

    // Threads
    pub freeze_rounds: u64,
    pub threads_recreated: u64,
    pub threads_terminated: u64,
    pub threads_dropped: u64,
}

impl MetricsSnapshot {
    /// Доля страниц, для которых не пришлось писать байты.
    pub fn unchanged_ratio(&self) -> f64 {
        let total = self.pages_no_page
            + self.pages_zero
            + self.pages_unchanged
            + self.pages_compressed
            + self.pages_raw;
        if total == 0 {
            0.0
        } else {
            (total - self.pages_compressed - self.pages_raw) as f64 / total as f64
        }
    }
}

fn add_pages(s: &OpStats) {
    PAGES_NO_PAGE.fetch_add(s.pages_no_page, Ordering::Relaxed);
    PAGES_ZERO.fetch_add(s.pages_zero, Ordering::Relaxed);
    PAGES_UNCHANGED.fetch_add(s.pages_unchanged, Ordering::Relaxed);
    PAGES_COMPRESSED.fetch_add(s.pages_compressed, Ordering::Relaxed);
    PAGES_RAW.fetch_add(s.pages_raw, Ordering::Relaxed);
    PAYLOAD_BYTES.fetch_add(s.payload_bytes, Ordering::Relaxed);
    FREEZE_ROUNDS.fetch_add(s.freeze_rounds, Ordering::Relaxed);
    THREADS_DROPPED.fetch_add(s.threads_dropped, Ordering::Relaxed);
}

// ----- Recorders -----
pub fn record_save(s: &OpStats) {
    SAVES_TOTAL.fetch_add(1, Ordering::Relaxed);
    if s.base_written {
        BASE_WRITES.fetch_add(1, Ordering::Relaxed);
    }
    add_pages(s);
}

pub fn record_load(s: &OpStats) {
    LOADS_TOTAL.fetch_add(1, Ordering::Relaxed);
    PAGES_RESTORED.fetch_add(s.pages_restored, Ordering::Relaxed);
    PAGES_SKIPPED_ON_LOAD.fetch_add(s.pages_skipped, Ordering::Relaxed);
    RECONCILE_MAPS.fetch_add(s.maps, Ordering::Relaxed);
    RECONCILE_UNMAPS.fetch_add(s.unmaps, Ordering::Relaxed);
    RECONCILE_REMAPS.fetch_add(s.remaps, Ordering::Relaxed);
    RECONCILE_BRK.fetch_add(s.brks, Ordering::Relaxed);
    RECONCILE_PROTECTS.fetch_add(s.protects, Ordering::Relaxed);
    THREADS_RECREATED.fetch_add(s.threads_recreated, Ordering::Relaxed);
    THREADS_TERMINATED.fetch_add(s.threads_terminated, Ordering::Relaxed);
    FREEZE_ROUNDS.fetch_add(s.freeze_rounds, Ordering::Relaxed);
    THREADS_DROPPED.fetch_add(s.threads_dropped, Ordering::Relaxed);
}

pub fn record_save_failure() {
    SAVE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_load_failure() {
    LOAD_FAILURES.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        saves_total: SAVES_TOTAL.load(Ordering::Relaxed),
        loads_total: LOADS_TOTAL.load(Ordering::Relaxed),
        save_failures: SAVE_FAILURES.load(Ordering::Relaxed),
        load_failures: LOAD_FAILURES.load(Ordering::Relaxed),
        base_writes: BASE_WRITES.load(Ordering::Relaxed),

        pages_no_page: PAGES_NO_PAGE.load(Ordering::Relaxed),
        pages_zero: PAGES_ZERO.load(Ordering::Relaxed),
        pages_unchanged: PAGES_UNCHANGED.load(Ordering::Relaxed),
        pages_compressed: PAGES_COMPRESSED.load(Ordering::Relaxed),
        pages_raw: PAGES_RAW.load(Ordering::Relaxed),
        payload_bytes: PAYLOAD_BYTES.load(Ordering::Relaxed),
        pages_restored: PAGES_RESTORED.load(Ordering::Relaxed),
        pages_skipped_on_load: PAGES_SKIPPED_ON_LOAD.load(Ordering::Relaxed),

        reconcile_maps: RECONCILE_MAPS.load(Ordering::Relaxed),
        reconcile_unmaps: RECONCILE_UNMAPS.load(Ordering::Relaxed),
        reconcile_remaps: RECONCILE_REMAPS.load(Ordering::Relaxed),
        reconcile_brk: RECONCILE_BRK.load(Ordering::Relaxed),
        reconcile_protects: RECONCILE_PROTECTS.load(Ordering::Relaxed),

        freeze_rounds: FREEZE_ROUNDS.load(Ordering::Relaxed),
        threads_recreated: THREADS_RECREATED.load(Ordering::Relaxed),
        threads_terminated: THREADS_TERMINATED.load(Ordering::Relaxed),
        threads_dropped: THREADS_DROPPED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    for c in [
        &SAVES_TOTAL,
        &LOADS_TOTAL,
        &SAVE_FAILURES,
        &LOAD_FAILURES,
        &BASE_WRITES,
        &PAGES_NO_PAGE,
        &PAGES_ZERO,
        &PAGES_UNCHANGED,
        &PAGES_COMPRESSED,
        &PAGES_RAW,
        &PAYLOAD_BYTES,
        &PAGES_RESTORED,
        &PAGES_SKIPPED_ON_LOAD,
        &RECONCILE_MAPS,
        &RECONCILE_UNMAPS,
        &RECONCILE_REMAPS,
        &RECONCILE_BRK,
        &RECONCILE_PROTECTS,
        &FREEZE_ROUNDS,
        &THREADS_RECREATED,
        &THREADS_TERMINATED,
        &THREADS_DROPPED,
    ] {
        c.store(0, Ordering::Relaxed);
    }
}

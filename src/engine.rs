//! Snapshot Orchestrator: save(slot) / load(slot).
//!
//! Последовательность одной операции:
//! 1. orchestration mutex, FreezeHook::before_freeze;
//! 2. проверки выполнимости (вне окна, можно аллоцировать);
//! 3. lock реестра, freeze_all;
//! 4. checkpoint-сигнал самому себе на стеке из reserved memory: обработчик пишет
//!    поколение (save) или сверяет раскладку, копирует байты и чинит потоки (load);
//! 5. resume_all, слив frozen log, метрики, FreezeHook::after_resume.
//!
//! Успешный load не возвращается: driver телепортируется в контекст, снятый при
//! save, и тот save() возвращается второй раз с Resumed::Restored.
//!
//! Всё, что читает обработчик, лежит в EngineHeader (reserved memory): куча в
//! момент load перезаписывается.

use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::fs::File;
use std::io;
use std::sync::atomic::{compiler_fence, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::{Compress, Compression, Decompress};

use crate::area::MemoryArea;
use crate::config::{EngineConfig, SkipPolicy};
use crate::consts::{
    CHECKPOINT_SIGNAL_OFFSET, GEN_FLAG_COMPRESSED, GEN_FLAG_INCREMENTAL, PAGE_SIZE,
    RESERVED_MAGIC, SUSPEND_SIGNAL_OFFSET,
};
use crate::error::{OpFailure, SnapshotError, Status};
use crate::hash::hash64;
use crate::logging::FrozenLog;
use crate::maps::{capture_maps, AreaEnumerator};
use crate::metrics::{self, OpStats};
use crate::pagemap::{clear_soft_dirty, probe_soft_dirty, LiveMemory};
use crate::reconcile::reconcile;
use crate::reserved::{ReservedLayout, ReservedRegion, Span};
use crate::restore::{restore_pages, verify_restored_areas, SyncInfo};
use crate::snapshot::header::{GenHeader, GenerationKind, ThreadImage};
use crate::snapshot::paths::{GenerationPaths, RamStore};
use crate::snapshot::reader::{GenerationReader, ReaderScratch};
use crate::snapshot::writer::{Baseline, SnapshotWriter, WriterOptions, WriterScratch};
use crate::space::LiveAddressSpace;
use crate::sys;
use crate::thread::clone::discover_tid_offset;
use crate::thread::context::{capture_context, install_context};
use crate::thread::freeze::{freeze_all, install_handler, on_suspend, resume_all, FreezeParams};
use crate::thread::registry::{AltStacks, Registry, ThreadControl, ThreadSlot};
use crate::thread::repair::{apply_thread_repair, plan_thread_repair, registry_limits};
use crate::thread::state::ThreadState;

/// Внешние устройства, которые не переживают заморозку.
pub trait FreezeHook: Send + Sync {
    fn before_freeze(&self) {}
    fn after_resume(&self) {}
}

/// Куда сообщать о результате операций.
pub trait ProgressSink: Send + Sync {
    fn status(&self, status: Status);
    fn message(&self, msg: &str);
}

/// ProgressSink по умолчанию: в `log`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn status(&self, status: Status) {
        log::debug!("snapshot status: {}", status);
    }

    fn message(&self, msg: &str) {
        log::warn!("{}", msg);
    }
}

/// Чем закончился вызов save().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// Слот записан, выполнение продолжается.
    Saved,
    /// Слот был загружен позже: выполнение перемотано к этому save.
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Save,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Saved,
    Restored,
    Failed(OpFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Synced {
    kind: GenerationKind,
    generation: u64,
}

/// Всё, что нужно обработчику checkpoint-сигнала. Заполняется до заморозки.
#[derive(Clone, Copy)]
struct OpParams {
    kind: OpKind,
    slot: u32,
    driver: usize,
    driver_pthread: u64,
    slot_paths: GenerationPaths,
    base_paths: GenerationPaths,
    last_paths: Option<GenerationPaths>,
    incremental: bool,
    compression: bool,
    hashing: bool,
    soft_dirty: bool,
    policy: SkipPolicy,
    freeze: FreezeParams,
}

/// Изменяемое состояние движка; переживает восстановление памяти.
#[derive(Clone, Copy)]
struct EngineState {
    region: ReservedRegion,
    max_threads: usize,
    session: u64,
    next_generation: u64,
    /// 0: base в этой сессии ещё не записан.
    base_generation: u64,
    last_synced: Option<Synced>,
    op: Option<OpParams>,
    outcome: Outcome,
    stats: OpStats,
}

/// Заголовок в начале reserved region.
#[repr(C)]
struct EngineHeader {
    magic: u64,
    control: ThreadControl,
    log: FrozenLog,
    ram: RamStore,
    state: UnsafeCell<EngineState>,
}

unsafe impl Sync for EngineHeader {}

/// flate2-контексты, созданные при attach. Сбрасываются перед каждым фреймом,
/// поэтому содержимое их внутреннего состояния в куче между фреймами не важно.
struct Codec {
    compress: Compress,
    decompress: Decompress,
}

static HEADER: AtomicPtr<EngineHeader> = AtomicPtr::new(std::ptr::null_mut());
static ENGINE: AtomicPtr<Engine> = AtomicPtr::new(std::ptr::null_mut());
static ATTACH: Mutex<()> = Mutex::new(());

pub struct Engine {
    cfg: EngineConfig,
    region: ReservedRegion,
    header: &'static EngineHeader,
    registry: Registry,
    soft_dirty: bool,
    suspend_signal: i32,
    checkpoint_signal: i32,
    op_lock: Mutex<()>,
    hooks: Mutex<Vec<Arc<dyn FreezeHook>>>,
    progress: Mutex<Arc<dyn ProgressSink>>,
}

fn new_session_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut seed = [0u8; 24];
    let stack_addr = &seed as *const [u8; 24] as usize as u64;
    seed[..8].copy_from_slice(&nanos.to_le_bytes());
    seed[8..16].copy_from_slice(&(sys::getpid() as u64).to_le_bytes());
    seed[16..].copy_from_slice(&stack_addr.to_le_bytes());
    match hash64(&seed) {
        0 => 1,
        v => v,
    }
}

/// Резидентная память процесса в байтах (/proc/self/statm).
fn resident_bytes() -> io::Result<u64> {
    let s = std::fs::read_to_string("/proc/self/statm")?;
    let pages = s
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/self/statm"))?;
    Ok(pages * PAGE_SIZE as u64)
}

/// MemAvailable из /proc/meminfo, в байтах.
fn available_memory() -> io::Result<u64> {
    let s = std::fs::read_to_string("/proc/meminfo")?;
    s.lines()
        .find_map(|l| l.strip_prefix("MemAvailable:"))
        .and_then(|v| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no MemAvailable in /proc/meminfo")
        })
}

fn header_state() -> Option<(&'static EngineHeader, &'static mut EngineState)> {
    let p = HEADER.load(Ordering::Acquire);
    if p.is_null() {
        return None;
    }
    let h = unsafe { &*p };
    Some((h, unsafe { &mut *h.state.get() }))
}

// ---- доступ к reserved memory из окна заморозки ----

fn images_chunk(
    region: &ReservedRegion,
    max_threads: usize,
    chunk: usize,
) -> &'static mut [ThreadImage] {
    let span = region.layout().images;
    let base = region.addr(span.offset) as *mut ThreadImage;
    unsafe { std::slice::from_raw_parts_mut(base.add(chunk * max_threads), max_threads) }
}

fn codec(region: &ReservedRegion) -> &'static mut Codec {
    unsafe { &mut *(region.addr(region.layout().codec.offset) as *mut Codec) }
}

fn scratch(region: &ReservedRegion, span: Span) -> &'static mut [u8] {
    unsafe { region.span_mut(span) }
}

fn set_altstack(sp: *mut u8, len: usize) {
    let st = libc::stack_t {
        ss_sp: sp as *mut libc::c_void,
        ss_flags: 0,
        ss_size: len,
    };
    unsafe {
        sys::raw_syscall3(
            libc::SYS_sigaltstack,
            &st as *const libc::stack_t as usize,
            0,
            0,
        )
    };
}

fn io_fail(what: &'static str) -> impl Fn(io::Error) -> OpFailure {
    move |e| OpFailure::io(what, &e)
}

impl Engine {
    /// Подключить движок к процессу (один раз). Повторный вызов возвращает уже
    /// подключённый экземпляр. Вызывающий поток регистрируется.
    pub fn attach(cfg: EngineConfig) -> Result<&'static Engine, SnapshotError> {
        let _g = ATTACH.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(e) = Self::global() {
            log::warn!("engine already attached; new config ignored");
            return Ok(e);
        }

        let mut cfg = cfg;
        let soft_dirty = probe_soft_dirty();
        if cfg.incremental && !soft_dirty {
            log::warn!("kernel does not track soft-dirty bits; incremental snapshots disabled");
            cfg.incremental = false;
        }

        let layout = ReservedLayout::compute(
            &cfg,
            std::mem::size_of::<EngineHeader>(),
            std::mem::size_of::<Codec>(),
            std::mem::size_of::<ThreadSlot>(),
            // текущее поколение, base и последнее синхронизированное
            std::mem::size_of::<ThreadImage>() * 3,
        );
        let region = ReservedRegion::init(layout)
            .unwrap_or_else(|e| crate::fatal!("cannot map reserved region: {}", e));

        let suspend_signal = libc::SIGRTMIN() + SUSPEND_SIGNAL_OFFSET;
        let checkpoint_signal = libc::SIGRTMIN() + CHECKPOINT_SIGNAL_OFFSET;

        let header_ptr = region.addr(layout.header.offset) as *mut EngineHeader;
        let state = EngineState {
            region,
            max_threads: cfg.max_threads,
            session: new_session_id(),
            next_generation: 1,
            base_generation: 0,
            last_synced: None,
            op: None,
            outcome: Outcome::Pending,
            stats: OpStats::default(),
        };
        unsafe {
            std::ptr::write(
                header_ptr,
                EngineHeader {
                    magic: RESERVED_MAGIC,
                    control: ThreadControl::new(),
                    log: std::mem::zeroed(),
                    ram: RamStore::new(),
                    state: UnsafeCell::new(state),
                },
            );
            std::ptr::write(
                region.addr(layout.codec.offset) as *mut Codec,
                Codec {
                    compress: Compress::new(Compression::new(cfg.compression_level), false),
                    decompress: Decompress::new(false),
                },
            );
        }
        let header: &'static EngineHeader = unsafe { &*header_ptr };
        debug_assert_eq!(header.magic, RESERVED_MAGIC);
        header.log.reset();
        header.log.install();

        let registry = unsafe {
            Registry::install(
                &header.control,
                region.addr(layout.slots.offset) as *mut ThreadSlot,
                cfg.max_threads,
                AltStacks {
                    first: region.addr(layout.altstacks.offset) as usize,
                    stride: layout.altstack_stride,
                    len: layout.altstacks.len,
                },
                suspend_signal,
            )
        };
        registry.set_tid_offset(discover_tid_offset());

        install_handler(suspend_signal, on_suspend, &[])?;
        install_handler(checkpoint_signal, on_checkpoint, &[suspend_signal])?;
        HEADER.store(header_ptr, Ordering::Release);

        let engine: &'static Engine = Box::leak(Box::new(Engine {
            cfg,
            region,
            header,
            registry,
            soft_dirty,
            suspend_signal,
            checkpoint_signal,
            op_lock: Mutex::new(()),
            hooks: Mutex::new(Vec::new()),
            progress: Mutex::new(Arc::new(LogProgress)),
        }));
        ENGINE.store(engine as *const Engine as *mut Engine, Ordering::Release);

        registry.register_current()?;
        log::info!(
            "snaprewind attached: reserved {} KiB at {:#x}, session {:016x}, {}",
            region.size() / 1024,
            region.range().0,
            engine.session(),
            engine.cfg
        );
        Ok(engine)
    }

    /// Подключённый движок процесса.
    pub fn global() -> Option<&'static Engine> {
        let p = ENGINE.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn session(&self) -> u64 {
        self.state().session
    }

    pub fn soft_dirty_supported(&self) -> bool {
        self.soft_dirty
    }

    pub fn signals(&self) -> (i32, i32) {
        (self.suspend_signal, self.checkpoint_signal)
    }

    pub fn reserved_range(&self) -> (usize, usize) {
        self.region.range()
    }

    fn state(&self) -> &mut EngineState {
        // владелец: поток под op_lock; обработчик работает в том же потоке
        unsafe { &mut *self.header.state.get() }
    }

    pub fn add_hook(&self, hook: Arc<dyn FreezeHook>) {
        self.hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(hook);
    }

    pub fn set_progress(&self, sink: Arc<dyn ProgressSink>) {
        *self.progress.lock().unwrap_or_else(|p| p.into_inner()) = sink;
    }

    // ---- потоки ----

    /// Зарегистрировать вызывающий поток (идемпотентно).
    pub fn register_current_thread(&self) -> Result<(), SnapshotError> {
        self.registry.register_current().map(|_| ())
    }

    /// Поток заканчивает работу: больше не телепортируется при load.
    pub fn thread_exiting(&self) {
        if let Some(idx) = self.registry.find_by_tid(sys::gettid()) {
            self.registry.finish(idx);
        }
    }

    /// Пометить вызывающий поток завершающимся: следующая заморозка его отменит.
    pub fn mark_terminating(&self) -> bool {
        match self.registry.find_by_tid(sys::gettid()) {
            Some(idx) => self.registry.mark_terminating(idx),
            None => false,
        }
    }

    /// std::thread с регистрацией: слот занимается до старта, освобождается при выходе.
    pub fn spawn<F, T>(&self, name: &str, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        struct Finish(Registry, usize);
        impl Drop for Finish {
            fn drop(&mut self) {
                self.0.finish(self.1);
            }
        }

        let reg = self.registry;
        let idx = {
            let _g = reg.control().lock.lock();
            reg.allocate()
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no free thread slots"))?;

        let res = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _fin = match reg.complete_registration(idx) {
                    Ok(()) => Some(Finish(reg, idx)),
                    Err(e) => {
                        log::error!("thread registration failed: {}", e);
                        reg.slot(idx).clear();
                        None
                    }
                };
                f()
            });
        if res.is_err() {
            reg.slot(idx).clear();
        }
        res
    }

    /// (slot, tid, state) занятых слотов.
    pub fn thread_states(&self) -> Vec<(usize, i32, ThreadState)> {
        self.registry.states()
    }

    // ---- операции ----

    /// Сохранить состояние процесса в слот.
    pub fn save(&self, slot: u32) -> Result<Resumed, SnapshotError> {
        self.run_op(OpKind::Save, slot)
    }

    /// Восстановить слот. При успехе не возвращается: продолжает тот save(),
    /// что записал слот.
    pub fn load(&self, slot: u32) -> Result<Infallible, SnapshotError> {
        match self.run_op(OpKind::Load, slot) {
            Ok(r) => Err(SnapshotError::Consistency(format!(
                "load of slot {} returned to its caller ({:?})",
                slot, r
            ))),
            Err(e) => Err(e),
        }
    }

    fn run_op(&self, kind: OpKind, slot: u32) -> Result<Resumed, SnapshotError> {
        let _op = self.op_lock.lock().unwrap_or_else(|p| p.into_inner());
        let hooks: Vec<Arc<dyn FreezeHook>> = self
            .hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for h in &hooks {
            h.before_freeze();
        }

        let res = self.run_frozen(kind, slot);

        for h in &hooks {
            h.after_resume();
        }
        let sink = self
            .progress
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        match &res {
            Ok(_) => sink.status(Status::Ok),
            Err(e) => {
                sink.message(&e.to_string());
                sink.status(e.status());
            }
        }
        res
    }

    fn freeze_params(&self) -> FreezeParams {
        FreezeParams {
            poll: Duration::from_micros(self.cfg.freeze_poll_us),
            terminate_wait: Duration::from_millis(self.cfg.terminate_wait_ms),
        }
    }

    fn paths(&self, kind: GenerationKind) -> Result<GenerationPaths, SnapshotError> {
        if self.cfg.in_ram {
            return Ok(GenerationPaths::in_ram(&self.header.ram, kind)?);
        }
        Ok(GenerationPaths::new(&self.cfg.snapshot_dir, kind)?)
    }

    fn base_params(
        &self,
        kind: OpKind,
        slot: u32,
        driver: usize,
    ) -> Result<OpParams, SnapshotError> {
        let st = self.state();
        let last_paths = match st.last_synced {
            Some(s) => Some(self.paths(s.kind)?),
            None => None,
        };
        Ok(OpParams {
            kind,
            slot,
            driver,
            driver_pthread: unsafe { libc::pthread_self() } as u64,
            slot_paths: self.paths(GenerationKind::Slot(slot))?,
            base_paths: self.paths(GenerationKind::Base)?,
            last_paths,
            incremental: self.cfg.incremental,
            compression: self.cfg.compression,
            hashing: self.cfg.verify_hashes,
            soft_dirty: self.soft_dirty,
            policy: self.cfg.skip_policy(),
            freeze: self.freeze_params(),
        })
    }

    /// Хватит ли места: резидентная память (вдвое, если ещё пишется base).
    /// В режиме in_ram сравниваем со свободной памятью, а не с диском.
    fn check_save(&self, slot: u32, driver: usize) -> Result<OpParams, SnapshotError> {
        let p = self.base_params(OpKind::Save, slot, driver)?;
        let resident = resident_bytes()?;
        let needed = if p.incremental && self.state().base_generation == 0 {
            resident.saturating_mul(2)
        } else {
            resident
        };
        if self.cfg.in_ram {
            let available = available_memory()?;
            if available < needed {
                return Err(SnapshotError::MemoryShortage { needed, available });
            }
            return Ok(p);
        }
        let dir = &self.cfg.snapshot_dir;
        std::fs::create_dir_all(dir)?;
        let available = fs2::available_space(dir)?;
        if available < needed {
            return Err(SnapshotError::Feasibility {
                dir: dir.clone(),
                needed,
                available,
            });
        }
        Ok(p)
    }

    /// Сколько байт занимают поколения в memfd (0 вне режима in_ram).
    pub fn ram_usage(&self) -> u64 {
        self.header.ram.used_bytes()
    }

    fn read_header(
        &self,
        paths: &GenerationPaths,
        slot: u32,
    ) -> Result<(GenHeader, Vec<ThreadImage>), SnapshotError> {
        if !paths.exists() {
            return Err(SnapshotError::NotFound {
                slot,
                reason: format!("{:?} does not exist", paths.meta),
            });
        }
        let mut f = paths.meta.open_read()?;
        GenHeader::read_owned(&mut f).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                SnapshotError::Consistency(format!("corrupt generation header {:?}", paths.meta))
            }
            _ => SnapshotError::Io(e),
        })
    }

    /// Файлы на месте, заголовки целы, сессия и base совпадают, план потоков выполним.
    fn check_load(&self, slot: u32, driver: usize) -> Result<OpParams, SnapshotError> {
        let p = self.base_params(OpKind::Load, slot, driver)?;
        let st = self.state();
        let (h, images) = self.read_header(&p.slot_paths, slot)?;
        if h.session != st.session {
            return Err(SnapshotError::NotFound {
                slot,
                reason: format!("written by another session ({:016x})", h.session),
            });
        }
        if images.len() > st.max_threads {
            return Err(SnapshotError::Consistency(format!(
                "slot {} holds {} threads, engine supports {}",
                slot,
                images.len(),
                st.max_threads
            )));
        }
        if h.is_incremental() {
            let (bh, _) = self.read_header(&p.base_paths, slot)?;
            if bh.session != st.session || bh.generation != h.base_generation {
                return Err(SnapshotError::NotFound {
                    slot,
                    reason: format!(
                        "base generation {} is missing (found {} of session {:016x})",
                        h.base_generation, bh.generation, bh.session
                    ),
                });
            }
        }
        if h.driver_pthread != p.driver_pthread {
            return Err(SnapshotError::ThreadSet(format!(
                "slot {} must be loaded from the thread that saved it",
                slot
            )));
        }
        plan_thread_repair(
            &images,
            self.registry.slots(),
            h.driver_pthread,
            registry_limits(&self.registry),
            |_| {},
        )
        .map_err(|e| SnapshotError::ThreadSet(e.to_string()))?;
        Ok(p)
    }

    fn run_frozen(&self, kind: OpKind, slot: u32) -> Result<Resumed, SnapshotError> {
        let driver = self.registry.register_current()?;
        let params = match kind {
            OpKind::Save => self.check_save(slot, driver)?,
            OpKind::Load => self.check_load(slot, driver)?,
        };
        log::debug!("{:?} slot {}: feasibility ok, freezing", kind, slot);

        {
            let st = self.state();
            st.op = Some(params);
            st.outcome = Outcome::Pending;
            st.stats = OpStats::default();
        }

        let reg = self.registry;
        let guard = reg.control().lock.lock();
        self.header.log.set_active(true);

        let mut freeze_stats = OpStats::default();
        if let Err(f) = freeze_all(&reg, driver, &params.freeze, &mut freeze_stats) {
            resume_all(&reg, driver);
            self.header.log.set_active(false);
            drop(guard);
            self.header.log.drain();
            self.state().op = None;
            return Err(f.into_error(slot));
        }
        self.state().stats = freeze_stats;

        self.raise_checkpoint(driver);
        // Сюда возвращаются дважды: после save и после load этого слота.
        compiler_fence(Ordering::SeqCst);
        let st: EngineState = unsafe { std::ptr::read_volatile(self.header.state.get()) };
        let (op_slot, op_kind) = match st.op {
            Some(op) => (op.slot, op.kind),
            None => (slot, kind),
        };

        let parked = resume_all(&reg, driver);
        self.header.log.set_active(false);
        drop(guard);
        self.header.log.drain();
        self.state().op = None;

        match st.outcome {
            Outcome::Saved => {
                metrics::record_save(&st.stats);
                log::info!(
                    "saved slot {} ({} threads parked): {} pages, {} payload bytes{}",
                    op_slot,
                    parked,
                    st.stats.pages_total(),
                    st.stats.payload_bytes,
                    if st.stats.base_written { ", base written" } else { "" }
                );
                Ok(Resumed::Saved)
            }
            Outcome::Restored => {
                metrics::record_load(&st.stats);
                log::info!(
                    "restored slot {}: {} pages copied, {} skipped, {} threads recreated, {} exited",
                    op_slot,
                    st.stats.pages_restored,
                    st.stats.pages_skipped,
                    st.stats.threads_recreated,
                    st.stats.threads_terminated
                );
                if st.stats.hash_mismatches > 0 {
                    log::warn!(
                        "slot {}: {} restored areas differ from their saved hash",
                        op_slot,
                        st.stats.hash_mismatches
                    );
                }
                Ok(Resumed::Restored)
            }
            Outcome::Failed(f) => {
                match op_kind {
                    OpKind::Save => metrics::record_save_failure(),
                    OpKind::Load => metrics::record_load_failure(),
                }
                Err(f.into_error(op_slot))
            }
            Outcome::Pending => Err(SnapshotError::Consistency(
                "checkpoint handler did not run".into(),
            )),
        }
    }

    /// Поднять checkpoint-сигнал на стеке checkpoint из reserved memory.
    fn raise_checkpoint(&self, driver: usize) {
        let (sp, len) = self.region.stack_bounds(self.region.layout().checkpoint_stack);
        set_altstack(sp, len);
        sys::tgkill(sys::gettid(), self.checkpoint_signal);
        let _ = self.registry.install_altstack(driver);
    }
}

/// Обработчик checkpoint-сигнала: только driver, остальные потоки запаркованы.
extern "C" fn on_checkpoint(_sig: libc::c_int, _info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    let Some((_h, st)) = header_state() else {
        return;
    };
    let Some(op) = st.op else {
        return;
    };
    let Some(reg) = Registry::global() else {
        return;
    };
    let slot = reg.slot(op.driver);
    unsafe { capture_context(uc as *const libc::ucontext_t, slot.context_mut()) };

    match op.kind {
        OpKind::Save => {
            let mut stats = st.stats;
            st.outcome = match do_save(st, &op, &reg, &mut stats) {
                Ok(()) => Outcome::Saved,
                Err(f) => {
                    crate::frozen_warn!("save of slot {} failed: {}", op.slot, f.what);
                    Outcome::Failed(f)
                }
            };
            st.stats = stats;
        }
        OpKind::Load => {
            let mut stats = st.stats;
            match do_load(st, &op, &reg, &mut stats) {
                Ok(driver_image) => {
                    st.stats = stats;
                    st.outcome = Outcome::Restored;
                    unsafe { install_context(uc as *mut libc::ucontext_t, &driver_image.context) };
                }
                Err(f) => {
                    crate::frozen_warn!("load of slot {} failed: {}", op.slot, f.what);
                    st.stats = stats;
                    st.outcome = Outcome::Failed(f);
                }
            }
        }
    }
}

/// Образы: driver (Running) + каждый запаркованный поток (его состояние до заморозки).
fn collect_images(
    reg: &Registry,
    driver: usize,
    out: &mut [ThreadImage],
) -> Result<usize, OpFailure> {
    let mut n = 0;
    for (i, s) in reg.slots().iter().enumerate() {
        let state = if i == driver {
            ThreadState::Running
        } else if s.state() == ThreadState::Suspended {
            s.orig_state()
        } else {
            continue;
        };
        let img = out
            .get_mut(n)
            .ok_or(OpFailure::new(Status::ThreadSet, "too many threads for image buffer"))?;
        let (stack_base, stack_size) = s.stack();
        *img = ThreadImage {
            tid: s.tid(),
            state: state.to_u32(),
            pthread: s.pthread(),
            stack_base,
            stack_size,
            context: unsafe { *s.context() },
        };
        n += 1;
    }
    Ok(n)
}

/// Всё, что нужно для записи одного поколения.
struct GenWrite<'a> {
    kind: GenerationKind,
    generation: u64,
    base_generation: u64,
    parent_generation: u64,
    paths: &'a GenerationPaths,
    images: &'a [ThreadImage],
    maps: &'a [u8],
}

fn write_generation(
    st: &EngineState,
    op: &OpParams,
    gen: &GenWrite<'_>,
    baseline: &mut Baseline<'_, '_, File>,
    mem: &mut LiveMemory,
) -> Result<OpStats, OpFailure> {
    let res = (|| -> Result<OpStats, OpFailure> {
        let meta = gen.paths.meta_tmp.create().map_err(io_fail("create metadata file"))?;
        let bytes = gen.paths.bytes_tmp.create().map_err(io_fail("create bytes file"))?;

        let mut header = GenHeader::new(gen.kind, st.session, gen.generation);
        header.base_generation = gen.base_generation;
        header.parent_generation = gen.parent_generation;
        header.driver_pthread = op.driver_pthread;
        header.thread_count = gen.images.len() as u32;
        if op.incremental {
            header.flags |= GEN_FLAG_INCREMENTAL;
        }
        if op.compression {
            header.flags |= GEN_FLAG_COMPRESSED;
        }

        let region = &st.region;
        let sc = region.layout().scratch;
        let c = codec(region);
        let mut writer = SnapshotWriter::new(
            meta,
            bytes,
            &header,
            gen.images,
            Some(&mut c.compress),
            WriterScratch {
                comp_in: scratch(region, sc.comp_in),
                comp_out: scratch(region, sc.comp_out),
            },
            WriterOptions {
                compression: op.compression,
                hashing: op.hashing,
            },
        )
        .map_err(io_fail("write generation header"))?;

        for area in AreaEnumerator::new(gen.maps, op.policy, region.range()) {
            writer
                .write_area(&area, mem, baseline)
                .map_err(io_fail("write memory area"))?;
        }
        let (meta, bytes, stats) = writer.finish_save(&*mem).map_err(io_fail("finish generation"))?;
        meta.sync_all().map_err(io_fail("fsync metadata"))?;
        bytes.sync_all().map_err(io_fail("fsync bytes"))?;
        drop((meta, bytes));
        gen.paths.commit().map_err(io_fail("publish generation"))?;
        Ok(stats)
    })();
    if res.is_err() {
        gen.paths.discard_tmp();
    }
    res
}

fn do_save(
    st: &mut EngineState,
    op: &OpParams,
    reg: &Registry,
    stats: &mut OpStats,
) -> Result<(), OpFailure> {
    let region = st.region;
    let maps_buf = scratch(&region, region.layout().maps);
    let n = capture_maps(maps_buf).map_err(io_fail("capture /proc/self/maps"))?;
    let maps = &maps_buf[..n];

    let images = images_chunk(&region, st.max_threads, 0);
    let count = collect_images(reg, op.driver, images)?;
    let images = &images[..count];
    let mut mem = LiveMemory::open().map_err(io_fail("open /proc/self/pagemap"))?;

    let mut fresh_base = false;
    if op.incremental && st.base_generation == 0 {
        let generation = st.next_generation;
        st.next_generation += 1;
        let s = write_generation(
            st,
            op,
            &GenWrite {
                kind: GenerationKind::Base,
                generation,
                base_generation: generation,
                parent_generation: 0,
                paths: &op.base_paths,
                images,
                maps,
            },
            &mut Baseline::Full,
            &mut mem,
        )?;
        stats.absorb(&s);
        stats.base_written = true;
        st.base_generation = generation;
        fresh_base = true;
        crate::frozen_debug!("base generation {} written", generation);
    }

    let generation = st.next_generation;
    st.next_generation += 1;
    let gen = GenWrite {
        kind: GenerationKind::Slot(op.slot),
        generation,
        base_generation: if op.incremental { st.base_generation } else { 0 },
        parent_generation: st.last_synced.map(|s| s.generation).unwrap_or(0),
        paths: &op.slot_paths,
        images,
        maps,
    };

    let s = if !op.incremental {
        write_generation(st, op, &gen, &mut Baseline::Full, &mut mem)?
    } else if fresh_base {
        write_generation(st, op, &gen, &mut Baseline::FreshBase, &mut mem)?
    } else {
        let parent = match (st.last_synced, op.last_paths) {
            (Some(s), Some(p)) => p.meta.open_read().ok().map(|f| (s, f)),
            _ => None,
        };
        let parent_images = images_chunk(&region, st.max_threads, 1);
        let reader = match parent {
            Some((s, f)) => GenerationReader::open_flags_only(f, parent_images)
                .ok()
                .filter(|r| r.header().session == st.session)
                .map(|r| (s, r)),
            None => None,
        };
        match reader {
            Some((s, mut r)) => {
                let mut baseline = Baseline::Parent {
                    reader: &mut r,
                    is_base: s.kind == GenerationKind::Base,
                };
                write_generation(st, op, &gen, &mut baseline, &mut mem)?
            }
            None => {
                crate::frozen_warn!(
                    "parent generation unavailable, slot {} written in full",
                    op.slot
                );
                write_generation(st, op, &gen, &mut Baseline::Full, &mut mem)?
            }
        }
    };
    stats.absorb(&s);

    if op.soft_dirty {
        if let Err(e) = clear_soft_dirty() {
            crate::frozen_warn!("clear_refs failed after save: {}", e);
        }
    }
    st.last_synced = Some(Synced {
        kind: GenerationKind::Slot(op.slot),
        generation,
    });
    Ok(())
}

fn open_pair(paths: &GenerationPaths, what: &'static str) -> Result<(File, File), OpFailure> {
    let m = paths.meta.open_read().map_err(io_fail(what))?;
    let b = paths.bytes.open_read().map_err(io_fail(what))?;
    Ok((m, b))
}

/// Сохранённые области упорядочены, выровнены, не задевают reserved region, а все
/// флаги и заголовки фреймов читаются.
fn validate_stream(r: &mut GenerationReader<'_, File>, reserved: (usize, usize)) -> io::Result<()> {
    let mut prev_end = 0usize;
    while let Some(a) = r.next_area()? {
        if a.start < prev_end || (!a.is_skip() && a.start < reserved.1 && reserved.0 < a.end) {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        prev_end = a.end;
        if a.is_skip() {
            continue;
        }
        let mut addr = a.start;
        while addr < a.end {
            r.get_page_flag(addr)?
                .ok_or(io::Error::from(io::ErrorKind::InvalidData))?;
            addr += PAGE_SIZE;
        }
    }
    r.restart()
}

fn find_image<'i>(images: &'i [ThreadImage], pthread: u64) -> Option<&'i ThreadImage> {
    images.iter().find(|i| i.pthread == pthread)
}

fn do_load(
    st: &mut EngineState,
    op: &OpParams,
    reg: &Registry,
    stats: &mut OpStats,
) -> Result<ThreadImage, OpFailure> {
    let region = st.region;
    let sc = region.layout().scratch;
    let reserved = region.range();

    // ---- всё, что может не получиться, до первой мутации ----
    let images = images_chunk(&region, st.max_threads, 0);
    let (m, b) = open_pair(&op.slot_paths, "open slot generation")?;
    let mut current = GenerationReader::open(
        m,
        Some(b),
        &mut *images,
        Some(ReaderScratch {
            run: scratch(&region, sc.cur_run),
            frame: scratch(&region, sc.cur_frame),
        }),
    )
    .map_err(io_fail("read slot header"))?;
    let h = *current.header();
    let count = h.thread_count as usize;
    if h.session != st.session {
        return Err(OpFailure::new(Status::NotFound, "slot written by another session"));
    }
    let images: &[ThreadImage] = &images[..count];
    let driver_image = *find_image(images, op.driver_pthread)
        .ok_or(OpFailure::new(Status::ThreadSet, "driver thread is not in the saved thread set"))?;
    validate_stream(&mut current, reserved)
        .map_err(|_| OpFailure::new(Status::Consistency, "slot area stream is invalid"))?;

    let base_images = images_chunk(&region, st.max_threads, 1);
    let mut base = if h.is_incremental() {
        let (m, b) = open_pair(&op.base_paths, "open base generation")?;
        let r = GenerationReader::open(
            m,
            Some(b),
            base_images,
            Some(ReaderScratch {
                run: scratch(&region, sc.base_run),
                frame: scratch(&region, sc.base_frame),
            }),
        )
        .map_err(io_fail("read base header"))?;
        let bh = r.header();
        if bh.session != st.session || bh.generation != h.base_generation {
            return Err(OpFailure::new(Status::NotFound, "base generation mismatch"));
        }
        Some(r)
    } else {
        None
    };

    let last_images = images_chunk(&region, st.max_threads, 2);
    let mut sync = SyncInfo {
        soft_dirty: op.soft_dirty,
        ..SyncInfo::default()
    };
    let mut last = None;
    if let (Some(s), Some(p), true) = (st.last_synced, op.last_paths, h.is_incremental()) {
        sync.same_generation = s.generation == h.generation;
        sync.last_is_base = s.kind == GenerationKind::Base;
        if let Ok(f) = p.meta.open_read() {
            last = GenerationReader::open_flags_only(f, last_images)
                .ok()
                .filter(|r| {
                    r.header().session == st.session && r.header().generation == s.generation
                });
        }
    }
    if last.is_none() {
        // без последней синхронизации пропускать нечего
        sync = SyncInfo {
            soft_dirty: false,
            ..SyncInfo::default()
        };
    }

    let maps_buf = scratch(&region, region.layout().maps);
    let n = capture_maps(maps_buf).map_err(io_fail("capture /proc/self/maps"))?;
    let maps = &maps_buf[..n];
    let mut mem = LiveMemory::open().map_err(io_fail("open /proc/self/pagemap"))?;

    // ---- точка невозврата: дальше любая ошибка фатальна ----
    let mut space = LiveAddressSpace::new(reserved);
    let live = AreaEnumerator::new(maps, op.policy, reserved);
    if let Err(e) = reconcile(&mut current, live, &mut space, stats) {
        crate::fatal!("address space reconciliation failed: {}", e);
    }
    if let Err(e) = current.restart() {
        crate::fatal!("rewind slot stream: {}", e);
    }
    mem.invalidate();
    let dec = &mut codec(&region).decompress;
    if let Err(e) = restore_pages(
        &mut current,
        base.as_mut(),
        last.as_mut(),
        sync,
        &mut mem,
        &mut space,
        dec,
        stats,
    ) {
        crate::fatal!("page restore failed: {}", e);
    }

    if op.hashing {
        match verify_restored_areas(&mut current, &mem, |a: &MemoryArea| {
            crate::frozen_warn!("restored area {:#x}-{:#x} hash mismatch", a.start, a.end);
        }) {
            Ok(bad) => stats.hash_mismatches += bad,
            Err(e) => crate::frozen_warn!("hash verification aborted: {}", e),
        }
    }

    if let Err(f) = apply_thread_repair(reg, op.driver, images, &op.freeze, stats) {
        crate::fatal!("thread repair failed: {}", f.what);
    }

    if op.soft_dirty {
        if let Err(e) = clear_soft_dirty() {
            crate::frozen_warn!("clear_refs failed after load: {}", e);
        }
    }
    st.last_synced = Some(Synced {
        kind: GenerationKind::Slot(op.slot),
        generation: h.generation,
    });
    Ok(driver_image)
}

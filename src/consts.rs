//! Общие константы формата снимков и движка.

// -------- Pages --------
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

// -------- Generation files --------
// <dir>/state{slot}.pm + <dir>/state{slot}.p, <dir>/base.pm + <dir>/base.p
pub const META_EXT: &str = "pm";
pub const BYTES_EXT: &str = "p";
pub const TMP_SUFFIX: &str = ".tmp";
pub const SLOT_PREFIX: &str = "state";
pub const BASE_NAME: &str = "base";

// -------- In-RAM generations (memfd) --------
pub const RAM_SLOTS: usize = 32;
pub const MEMFD_PREFIX: &str = "memfd:";

// -------- Header --------
pub const SNAP_MAGIC: &[u8; 8] = b"SRSNAP01";
pub const SNAP_VERSION: u32 = 1;

// Фиксированная часть заголовка (без образов потоков и crc):
// [magic8][ver u32][flags u32][kind u32][slot u32][session u64][generation u64]
// [base_gen u64][parent_gen u64][driver_pthread u64][thread_count u32][reserved u32]
pub const HDR_FIXED_SIZE: usize = 72;
pub const HDR_CRC_SIZE: usize = 4;

pub const GEN_FLAG_INCREMENTAL: u32 = 0x1;
pub const GEN_FLAG_COMPRESSED: u32 = 0x2;

pub const GEN_KIND_BASE: u32 = 0;
pub const GEN_KIND_SLOT: u32 = 1;

// Образ потока: [tid i32][state u32][pthread u64][stack_base u64][stack_size u64]
// [fs_base u64][sigmask u64][gregs 23*u64][fpstate 512]
pub const NGREG: usize = 23;
pub const FPSTATE_SIZE: usize = 512;
pub const THREAD_IMAGE_SIZE: usize = 4 + 4 + 8 * 5 + NGREG * 8 + FPSTATE_SIZE;

// -------- Area records --------
// [start u64][end u64][offset u64][bytes_offset u64][dev u64][inode u64]
// [prot u32][flags u32][name_len u16][pad u16] + name
pub const AREA_REC_SIZE: usize = 64;
pub const AREA_NAME_MAX: usize = 512;
pub const AREA_HASH_SIZE: usize = 8;

// -------- Page flags (u8 на страницу) --------
pub const PAGE_FLAG_NONE: u8 = 0;
pub const PAGE_FLAG_NO_PAGE: u8 = 1;
pub const PAGE_FLAG_ZERO: u8 = 2;
pub const PAGE_FLAG_UNCHANGED: u8 = 3;
pub const PAGE_FLAG_COMPRESSED: u8 = 4;
pub const PAGE_FLAG_RAW: u8 = 5;

// -------- Compression --------
// До RUN_PAGES подряд идущих страниц в одном deflate-фрейме: [clen u32][pages u32][payload]
pub const RUN_PAGES: usize = 16;
pub const RUN_BYTES: usize = RUN_PAGES * PAGE_SIZE;
pub const FRAME_HDR_SIZE: usize = 8;

// Буфер флагов: сбрасывается в metadata-поток порциями
pub const FLAG_CHUNK: usize = 4096;

// -------- Reserved region --------
pub const RESERVED_MAGIC: u64 = 0x5352_5245_5345_5256; // "SRRESERV"
pub const CHECKPOINT_STACK_SIZE: usize = 1 << 20;
pub const FROZEN_LOG_ENTRIES: usize = 128;
pub const FROZEN_LOG_TEXT: usize = 200;
pub const PATH_MAX_BYTES: usize = 512;

// -------- Signals (смещения от SIGRTMIN) --------
pub const SUSPEND_SIGNAL_OFFSET: i32 = 4;
pub const CHECKPOINT_SIGNAL_OFFSET: i32 = 5;

// -------- /proc --------
pub const PAGEMAP_PRESENT: u64 = 1 << 63;
pub const PAGEMAP_SWAPPED: u64 = 1 << 62;
pub const PAGEMAP_SOFT_DIRTY: u64 = 1 << 55;
pub const PAGEMAP_BATCH: usize = 512;

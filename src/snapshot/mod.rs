//! snapshot: формат поколений: заголовок, запись, потоковое чтение, офлайн-разбор.
//!
//! Три поколения на сессию работают вместе:
//! - base: первая полная копия (создаётся лениво при первом инкрементальном save);
//! - parent: последнее синхронизированное поколение (последний save или load);
//! - current: записываемое сейчас.
//!
//! Unchanged в current всегда означает «как в base», поэтому любая страница
//! разрешается не более чем за два шага: current → base.

pub mod header;
pub mod inspect;
pub mod paths;
pub mod reader;
pub mod writer;

pub use header::{GenHeader, GenerationKind, ThreadImage};
pub use paths::{FileRole, GenerationPaths, RamStore, SnapPath};
pub use reader::{GenerationReader, ReaderScratch};
pub use writer::{Baseline, SnapshotWriter, WriterOptions, WriterScratch};

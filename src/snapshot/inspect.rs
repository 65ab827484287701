//! snapshot/inspect: офлайн-разбор и проверка поколений (для CLI и тестов).
//!
//! Работает вне движка: обычные аллокации, anyhow-ошибки с контекстом.
//! - inspect_generation: заголовок, потоки, области, гистограмма флагов;
//! - verify_slot: читает все флаги и payload слота, проверяет разрешение Unchanged
//!   через base и хеши областей (если они записаны).

use anyhow::{anyhow, Context, Result};
use flate2::Decompress;
use serde::Serialize;
use std::fs::File;
use std::path::Path;

use crate::area::{MemoryArea, PageStatus};
use crate::consts::{PAGE_SIZE, RUN_BYTES};
use crate::hash::AreaHasher;
use crate::snapshot::header::{GenHeader, GenerationKind, ThreadImage};
use crate::snapshot::paths::GenerationPaths;
use crate::snapshot::reader::{GenerationReader, ReaderScratch};
use crate::thread::state::ThreadState;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FlagHistogram {
    pub no_page: u64,
    pub zero: u64,
    pub unchanged: u64,
    pub compressed: u64,
    pub raw: u64,
}

impl FlagHistogram {
    pub fn add(&mut self, st: PageStatus) {
        match st {
            PageStatus::NoPage => self.no_page += 1,
            PageStatus::Zero => self.zero += 1,
            PageStatus::Unchanged => self.unchanged += 1,
            PageStatus::CompressedRun => self.compressed += 1,
            PageStatus::Raw => self.raw += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.no_page + self.zero + self.unchanged + self.compressed + self.raw
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub tid: i32,
    pub state: String,
    pub pthread: String,
    pub ip: String,
    pub sp: String,
    pub fs_base: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaSummary {
    pub start: String,
    pub end: String,
    pub perms: String,
    pub name: String,
    pub props: String,
    pub pages: usize,
    pub skip: bool,
    pub hash: String,
    pub flags: FlagHistogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub meta_path: String,
    pub kind: String,
    pub slot: Option<u32>,
    pub session: String,
    pub generation: u64,
    pub base_generation: u64,
    pub parent_generation: u64,
    pub incremental: bool,
    pub compressed: bool,
    pub driver_pthread: String,
    pub bytes_len: u64,
    pub threads: Vec<ThreadSummary>,
    pub areas: Vec<AreaSummary>,
    pub flags: FlagHistogram,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub slot: u32,
    pub generation: u64,
    pub pages_checked: u64,
    pub payload_pages: u64,
    pub unchanged_resolved: u64,
    pub areas_hashed: u64,
    pub hash_mismatches: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty() && self.hash_mismatches == 0
    }
}

fn perms(a: &MemoryArea) -> String {
    format!(
        "{}{}{}{}",
        if a.prot & libc::PROT_READ != 0 { 'r' } else { '-' },
        if a.prot & libc::PROT_WRITE != 0 { 'w' } else { '-' },
        if a.prot & libc::PROT_EXEC != 0 { 'x' } else { '-' },
        if a.shared { 's' } else { 'p' },
    )
}

fn thread_summary(img: &ThreadImage) -> ThreadSummary {
    let state = ThreadState::from_u32(img.state)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("unknown({})", img.state));
    ThreadSummary {
        tid: img.tid,
        state,
        pthread: format!("{:#x}", img.pthread),
        ip: format!("{:#x}", img.context.ip()),
        sp: format!("{:#x}", img.context.sp()),
        fs_base: format!("{:#x}", img.context.fs_base),
    }
}

/// Открыть поколение со всеми буферами, принадлежащими вызывающему.
struct OwnedGeneration {
    images: Vec<ThreadImage>,
    run: Vec<u8>,
    frame: Vec<u8>,
    meta: File,
    bytes: File,
    bytes_len: u64,
}

impl OwnedGeneration {
    fn open(dir: &Path, kind: GenerationKind) -> Result<Self> {
        let paths = GenerationPaths::new(dir, kind).context("build generation paths")?;
        let mut meta = paths
            .meta
            .open_read()
            .with_context(|| format!("open {:?}", paths.meta))?;
        let (_, images) = GenHeader::read_owned(&mut meta)
            .with_context(|| format!("read header {:?}", paths.meta))?;
        let bytes = paths
            .bytes
            .open_read()
            .with_context(|| format!("open {:?}", paths.bytes))?;
        let bytes_len = bytes.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            images,
            run: vec![0u8; RUN_BYTES],
            frame: vec![0u8; RUN_BYTES],
            meta,
            bytes,
            bytes_len,
        })
    }

    fn reader(&mut self) -> Result<GenerationReader<'_, File>> {
        let meta = self.meta.try_clone().context("dup meta fd")?;
        let bytes = self.bytes.try_clone().context("dup bytes fd")?;
        let scratch = ReaderScratch {
            run: &mut self.run,
            frame: &mut self.frame,
        };
        GenerationReader::open(meta, Some(bytes), &mut self.images, Some(scratch))
            .context("open generation reader")
    }
}

/// Сводка по одному поколению.
pub fn inspect_generation(dir: &Path, kind: GenerationKind) -> Result<GenerationSummary> {
    let mut owned = OwnedGeneration::open(dir, kind)?;
    let bytes_len = owned.bytes_len;
    let threads: Vec<ThreadSummary> = owned.images.iter().map(thread_summary).collect();
    let meta_path = GenerationPaths::new(dir, kind)?.meta.as_path().display().to_string();
    let mut r = owned.reader()?;
    let h = *r.header();

    let mut areas = Vec::new();
    let mut total = FlagHistogram::default();
    while let Some(a) = r.next_area()? {
        let mut hist = FlagHistogram::default();
        if !a.is_skip() {
            let mut addr = a.start;
            while addr < a.end {
                let st = r
                    .get_page_flag(addr)?
                    .ok_or_else(|| anyhow!("missing flag at {:#x}", addr))?;
                hist.add(st);
                total.add(st);
                addr += PAGE_SIZE;
            }
        }
        let hash = r.area_hash()?;
        areas.push(AreaSummary {
            start: format!("{:#x}", a.start),
            end: format!("{:#x}", a.end),
            perms: perms(&a),
            name: a.name_str().to_string(),
            props: format!("{:?}", a.props),
            pages: a.pages(),
            skip: a.is_skip(),
            hash: format!("{:016x}", hash),
            flags: hist,
        });
    }

    let (kind_s, slot) = match h.kind {
        GenerationKind::Base => ("base".to_string(), None),
        GenerationKind::Slot(s) => ("slot".to_string(), Some(s)),
    };
    Ok(GenerationSummary {
        meta_path,
        kind: kind_s,
        slot,
        session: format!("{:016x}", h.session),
        generation: h.generation,
        base_generation: h.base_generation,
        parent_generation: h.parent_generation,
        incremental: h.is_incremental(),
        compressed: h.is_compressed(),
        driver_pthread: format!("{:#x}", h.driver_pthread),
        bytes_len,
        threads,
        areas,
        flags: total,
    })
}

/// Полная проверка слота: каждая страница читается (или разрешается через base).
pub fn verify_slot(dir: &Path, slot: u32) -> Result<VerifyReport> {
    let mut cur_owned = OwnedGeneration::open(dir, GenerationKind::Slot(slot))?;
    let mut cur = cur_owned.reader()?;
    let h = *cur.header();

    let mut base_owned = if h.is_incremental() {
        Some(OwnedGeneration::open(dir, GenerationKind::Base).context("open base generation")?)
    } else {
        None
    };
    let mut base = match base_owned.as_mut() {
        Some(o) => Some(o.reader()?),
        None => None,
    };

    let mut rep = VerifyReport {
        slot,
        generation: h.generation,
        ..Default::default()
    };
    if let Some(b) = &base {
        let bh = b.header();
        if bh.session != h.session || bh.generation != h.base_generation {
            rep.errors.push(format!(
                "base mismatch: slot wants session {:016x} gen {}, base is session {:016x} gen {}",
                h.session, h.base_generation, bh.session, bh.generation
            ));
            return Ok(rep);
        }
    }

    let mut codec = Decompress::new(false);
    let mut page = vec![0u8; PAGE_SIZE];
    let zero = vec![0u8; PAGE_SIZE];

    while let Some(a) = cur.next_area()? {
        if a.is_skip() {
            continue;
        }
        let mut hasher = AreaHasher::new();
        let mut addr = a.start;
        while addr < a.end {
            let st = cur
                .get_page_flag(addr)?
                .ok_or_else(|| anyhow!("missing flag at {:#x}", addr))?;
            rep.pages_checked += 1;
            match st {
                PageStatus::NoPage => {}
                PageStatus::Zero => hasher.page(&zero),
                PageStatus::Raw | PageStatus::CompressedRun => {
                    cur.get_page(addr, &mut page, &mut codec)
                        .with_context(|| format!("payload at {:#x}", addr))?;
                    rep.payload_pages += 1;
                    hasher.page(&page);
                }
                PageStatus::Unchanged => {
                    let Some(b) = base.as_mut() else {
                        rep.errors
                            .push(format!("unchanged page {:#x} in a full generation", addr));
                        addr += PAGE_SIZE;
                        continue;
                    };
                    match b.get_page_flag(addr)? {
                        Some(PageStatus::Raw | PageStatus::CompressedRun) => {
                            b.get_page(addr, &mut page, &mut codec)
                                .with_context(|| format!("base payload at {:#x}", addr))?;
                            rep.unchanged_resolved += 1;
                            hasher.page(&page);
                        }
                        Some(PageStatus::Zero) => {
                            rep.unchanged_resolved += 1;
                            hasher.page(&zero);
                        }
                        other => rep.errors.push(format!(
                            "unchanged page {:#x} does not resolve in base (base flag {:?})",
                            addr, other
                        )),
                    }
                }
            }
            addr += PAGE_SIZE;
        }
        let recorded = cur.area_hash()?;
        if recorded != 0 {
            rep.areas_hashed += 1;
            if hasher.finish() != recorded {
                rep.hash_mismatches += 1;
                rep.errors.push(format!(
                    "hash mismatch in {:#x}-{:#x} {}",
                    a.start,
                    a.end,
                    a.name_str()
                ));
            }
        }
    }
    Ok(rep)
}

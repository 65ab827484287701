//! Centralized configuration and builder for SnapRewind.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - EngineConfig::from_env() reads SR_* variables on top of the defaults.
//! - EngineBuilder collects overrides and attaches the process-wide engine.
//!
//! Skip policy (enumerator):
//! - ignore_non_writable: non-writable areas are never saved
//! - ignore_exec: executable areas are never saved
//! - ignore_large_anon_mb: anonymous areas above this size are skipped
//!
//! Reserved region sizing:
//! - max_threads / altstack_kb / maps_buffer_kb are fixed at attach and cannot change later.

use std::fmt;
use std::path::PathBuf;

use crate::consts::PAGE_SIZE;

/// Top-level configuration for the checkpoint engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory for generation files (state{slot}.pm/.p, base.pm/.p).
    /// Env: SR_SNAPSHOT_DIR (default "<tmp>/snaprewind")
    pub snapshot_dir: PathBuf,

    /// Keep generations in memfd files instead of snapshot_dir (slots 0..RAM_SLOTS).
    /// Feasibility is then checked against MemAvailable.
    /// Env: SR_IN_RAM (default false)
    pub in_ram: bool,

    /// Use base/parent generations and soft-dirty tracking.
    /// Env: SR_INCREMENTAL (default true). Disabled at attach if the kernel lacks soft-dirty.
    pub incremental: bool,

    /// Compress page runs with raw deflate.
    /// Env: SR_COMPRESSION (default true)
    pub compression: bool,

    /// Deflate level 0..=9.
    /// Env: SR_COMPRESSION_LEVEL (default 1)
    pub compression_level: u32,

    /// Env: SR_IGNORE_NON_WRITABLE (default false)
    pub ignore_non_writable: bool,

    /// Env: SR_IGNORE_EXEC (default false)
    pub ignore_exec: bool,

    /// Skip anonymous areas larger than this many MiB (None = keep all).
    /// Env: SR_IGNORE_LARGE_ANON_MB
    pub ignore_large_anon_mb: Option<u64>,

    /// Capacity of the thread slot table.
    /// Env: SR_MAX_THREADS (default 64)
    pub max_threads: usize,

    /// Alternate signal stack per thread, KiB.
    /// Env: SR_ALTSTACK_KB (default 64)
    pub altstack_kb: usize,

    /// Buffer for /proc/self/maps captures, KiB.
    /// Env: SR_MAPS_BUFFER_KB (default 1024)
    pub maps_buffer_kb: usize,

    /// Freeze poll interval between re-signals, microseconds.
    /// Env: SR_FREEZE_POLL_US (default 1000)
    pub freeze_poll_us: u64,

    /// Bounded wait for a cancelled (terminating) thread before the suspend signal fallback.
    /// Env: SR_TERMINATE_WAIT_MS (default 100)
    pub terminate_wait_ms: u64,

    /// Store an xxhash64 of every area and check it after a load.
    /// Env: SR_VERIFY_HASHES (default false)
    pub verify_hashes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: std::env::temp_dir().join("snaprewind"),
            in_ram: false,
            incremental: true,
            compression: true,
            compression_level: 1,

            ignore_non_writable: false,
            ignore_exec: false,
            ignore_large_anon_mb: None,

            max_threads: 64,
            altstack_kb: 64,
            maps_buffer_kb: 1024,

            freeze_poll_us: 1000,
            terminate_wait_ms: 100,
            verify_hashes: false,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl EngineConfig {
    /// Load configuration from environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SR_SNAPSHOT_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.snapshot_dir = PathBuf::from(s);
            }
        }

        if let Some(on) = env_flag("SR_IN_RAM") {
            cfg.in_ram = on;
        }
        if let Some(on) = env_flag("SR_INCREMENTAL") {
            cfg.incremental = on;
        }
        if let Some(on) = env_flag("SR_COMPRESSION") {
            cfg.compression = on;
        }
        if let Some(n) = env_num::<u32>("SR_COMPRESSION_LEVEL") {
            cfg.compression_level = n.min(9);
        }

        // ----- skip policy -----
        if let Some(on) = env_flag("SR_IGNORE_NON_WRITABLE") {
            cfg.ignore_non_writable = on;
        }
        if let Some(on) = env_flag("SR_IGNORE_EXEC") {
            cfg.ignore_exec = on;
        }
        if let Some(n) = env_num::<u64>("SR_IGNORE_LARGE_ANON_MB") {
            cfg.ignore_large_anon_mb = if n == 0 { None } else { Some(n) };
        }

        // ----- reserved region sizing -----
        if let Some(n) = env_num::<usize>("SR_MAX_THREADS") {
            if n > 0 {
                cfg.max_threads = n;
            }
        }
        if let Some(n) = env_num::<usize>("SR_ALTSTACK_KB") {
            cfg.altstack_kb = n.max(16);
        }
        if let Some(n) = env_num::<usize>("SR_MAPS_BUFFER_KB") {
            cfg.maps_buffer_kb = n.max(64);
        }

        // ----- freeze protocol -----
        if let Some(n) = env_num::<u64>("SR_FREEZE_POLL_US") {
            cfg.freeze_poll_us = n.max(10);
        }
        if let Some(n) = env_num::<u64>("SR_TERMINATE_WAIT_MS") {
            cfg.terminate_wait_ms = n;
        }
        if let Some(on) = env_flag("SR_VERIFY_HASHES") {
            cfg.verify_hashes = on;
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_snapshot_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    pub fn with_in_ram(mut self, on: bool) -> Self {
        self.in_ram = on;
        self
    }

    pub fn with_incremental(mut self, on: bool) -> Self {
        self.incremental = on;
        self
    }

    pub fn with_compression(mut self, on: bool) -> Self {
        self.compression = on;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_ignore_non_writable(mut self, on: bool) -> Self {
        self.ignore_non_writable = on;
        self
    }

    pub fn with_ignore_exec(mut self, on: bool) -> Self {
        self.ignore_exec = on;
        self
    }

    pub fn with_ignore_large_anon_mb(mut self, mb: Option<u64>) -> Self {
        self.ignore_large_anon_mb = mb;
        self
    }

    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n.max(1);
        self
    }

    pub fn with_altstack_kb(mut self, kb: usize) -> Self {
        self.altstack_kb = kb.max(16);
        self
    }

    pub fn with_maps_buffer_kb(mut self, kb: usize) -> Self {
        self.maps_buffer_kb = kb.max(64);
        self
    }

    pub fn with_freeze_poll_us(mut self, us: u64) -> Self {
        self.freeze_poll_us = us.max(10);
        self
    }

    pub fn with_terminate_wait_ms(mut self, ms: u64) -> Self {
        self.terminate_wait_ms = ms;
        self
    }

    pub fn with_verify_hashes(mut self, on: bool) -> Self {
        self.verify_hashes = on;
        self
    }

    /// Skip policy derived from this config (copied into reserved memory at attach).
    pub fn skip_policy(&self) -> SkipPolicy {
        SkipPolicy {
            ignore_non_writable: self.ignore_non_writable,
            ignore_exec: self.ignore_exec,
            ignore_large_anon: self
                .ignore_large_anon_mb
                .map(|mb| (mb as usize).saturating_mul(1024 * 1024)),
        }
    }

    /// Alternate stack size in bytes, page aligned.
    pub fn altstack_bytes(&self) -> usize {
        round_up_page(self.altstack_kb * 1024)
    }

    pub fn maps_buffer_bytes(&self) -> usize {
        round_up_page(self.maps_buffer_kb * 1024)
    }
}

#[inline]
pub(crate) fn round_up_page(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Configurable part of the enumerator's skip rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipPolicy {
    pub ignore_non_writable: bool,
    pub ignore_exec: bool,
    /// Byte threshold for anonymous areas.
    pub ignore_large_anon: Option<usize>,
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig {{ dir: {}, in_ram: {}, incremental: {}, compression: {} (level {}), \
             ignore_non_writable: {}, ignore_exec: {}, ignore_large_anon_mb: {:?}, \
             max_threads: {}, altstack_kb: {}, maps_buffer_kb: {}, freeze_poll_us: {}, \
             terminate_wait_ms: {}, verify_hashes: {} }}",
            self.snapshot_dir.display(),
            self.in_ram,
            self.incremental,
            self.compression,
            self.compression_level,
            self.ignore_non_writable,
            self.ignore_exec,
            self.ignore_large_anon_mb,
            self.max_threads,
            self.altstack_kb,
            self.maps_buffer_kb,
            self.freeze_poll_us,
            self.terminate_wait_ms,
            self.verify_hashes
        )
    }
}

/// Simple builder that collects overrides and attaches the engine.
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    cfg: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            cfg: EngineConfig::from_env(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, cfg: EngineConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn snapshot_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cfg = self.cfg.with_snapshot_dir(dir);
        self
    }

    pub fn in_ram(mut self, on: bool) -> Self {
        self.cfg = self.cfg.with_in_ram(on);
        self
    }

    pub fn incremental(mut self, on: bool) -> Self {
        self.cfg = self.cfg.with_incremental(on);
        self
    }

    pub fn compression(mut self, on: bool) -> Self {
        self.cfg = self.cfg.with_compression(on);
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.cfg = self.cfg.with_max_threads(n);
        self
    }

    pub fn verify_hashes(mut self, on: bool) -> Self {
        self.cfg = self.cfg.with_verify_hashes(on);
        self
    }

    /// Return the collected config without attaching.
    pub fn build(self) -> EngineConfig {
        self.cfg
    }

    /// Attach the process-wide engine with the collected config.
    pub fn attach(self) -> Result<&'static crate::engine::Engine, crate::error::SnapshotError> {
        crate::engine::Engine::attach(self.cfg)
    }
}

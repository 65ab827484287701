// tests/config_builder.rs
//
// Запуск только этого файла:
//   cargo test --test config_builder -- --nocapture
//
// Покрываем:
// 1) Значения по умолчанию и производные размеры (altstack/maps, выравнивание по странице).
// 2) SR_* переменные окружения поверх дефолтов (все в одном тесте: env общий на процесс).
// 3) Зажимы в with_* и skip_policy().
// 4) EngineBuilder::build без attach; Display.
// 5) Коды статуса и превращение OpFailure в SnapshotError.

use std::io;
use std::path::PathBuf;

use anyhow::Result;

use SnapRewind::consts::PAGE_SIZE;
use SnapRewind::error::OpFailure;
use SnapRewind::{EngineBuilder, EngineConfig, SkipPolicy, SnapshotError, Status};

const ENV_VARS: &[&str] = &[
    "SR_SNAPSHOT_DIR",
    "SR_IN_RAM",
    "SR_INCREMENTAL",
    "SR_COMPRESSION",
    "SR_COMPRESSION_LEVEL",
    "SR_IGNORE_NON_WRITABLE",
    "SR_IGNORE_EXEC",
    "SR_IGNORE_LARGE_ANON_MB",
    "SR_MAX_THREADS",
    "SR_ALTSTACK_KB",
    "SR_MAPS_BUFFER_KB",
    "SR_FREEZE_POLL_US",
    "SR_TERMINATE_WAIT_MS",
    "SR_VERIFY_HASHES",
];

#[test]
fn defaults() {
    let cfg = EngineConfig::default();
    assert!(cfg.incremental);
    assert!(cfg.compression);
    assert_eq!(cfg.compression_level, 1);
    assert_eq!(cfg.max_threads, 64);
    assert_eq!(cfg.altstack_bytes(), 64 * 1024);
    assert_eq!(cfg.maps_buffer_bytes(), 1024 * 1024);
    assert_eq!(cfg.skip_policy(), SkipPolicy::default());
    assert!(!cfg.verify_hashes);
    assert!(cfg.snapshot_dir.ends_with("snaprewind"));
    assert!(!cfg.in_ram);
}

#[test]
fn env_overrides() -> Result<()> {
    for v in ENV_VARS {
        std::env::remove_var(v);
    }
    std::env::set_var("SR_SNAPSHOT_DIR", "/var/tmp/sr-env");
    std::env::set_var("SR_IN_RAM", "1");
    std::env::set_var("SR_INCREMENTAL", "off");
    std::env::set_var("SR_COMPRESSION", "0");
    std::env::set_var("SR_COMPRESSION_LEVEL", "42");
    std::env::set_var("SR_IGNORE_EXEC", "yes");
    std::env::set_var("SR_IGNORE_LARGE_ANON_MB", "512");
    std::env::set_var("SR_MAX_THREADS", "0");
    std::env::set_var("SR_ALTSTACK_KB", "4");
    std::env::set_var("SR_MAPS_BUFFER_KB", " 2048 ");
    std::env::set_var("SR_FREEZE_POLL_US", "1");
    std::env::set_var("SR_TERMINATE_WAIT_MS", "5");
    std::env::set_var("SR_VERIFY_HASHES", "TRUE");

    let cfg = EngineConfig::from_env();
    assert_eq!(cfg.snapshot_dir, PathBuf::from("/var/tmp/sr-env"));
    assert!(cfg.in_ram);
    assert!(!cfg.incremental);
    assert!(!cfg.compression);
    assert_eq!(cfg.compression_level, 9);
    assert!(cfg.ignore_exec);
    assert!(!cfg.ignore_non_writable);
    assert_eq!(cfg.ignore_large_anon_mb, Some(512));
    // 0 потоков игнорируется
    assert_eq!(cfg.max_threads, 64);
    assert_eq!(cfg.altstack_kb, 16);
    assert_eq!(cfg.maps_buffer_kb, 2048);
    assert_eq!(cfg.freeze_poll_us, 10);
    assert_eq!(cfg.terminate_wait_ms, 5);
    assert!(cfg.verify_hashes);

    // 0 МиБ: порог выключен; мусор в числе: дефолт
    std::env::set_var("SR_IGNORE_LARGE_ANON_MB", "0");
    std::env::set_var("SR_MAX_THREADS", "lots");
    let cfg = EngineConfig::from_env();
    assert_eq!(cfg.ignore_large_anon_mb, None);
    assert_eq!(cfg.max_threads, 64);

    // builder стартует с env
    let built = EngineBuilder::new().compression(true).max_threads(3).build();
    assert!(built.compression);
    assert!(!built.incremental);
    assert_eq!(built.max_threads, 3);

    for v in ENV_VARS {
        std::env::remove_var(v);
    }
    Ok(())
}

#[test]
fn setters_clamp_and_skip_policy() {
    let cfg = EngineConfig::default()
        .with_compression_level(12)
        .with_max_threads(0)
        .with_altstack_kb(1)
        .with_maps_buffer_kb(3)
        .with_freeze_poll_us(0)
        .with_ignore_non_writable(true)
        .with_ignore_large_anon_mb(Some(2))
        .with_snapshot_dir("/tmp/sr-x");
    assert_eq!(cfg.compression_level, 9);
    assert_eq!(cfg.max_threads, 1);
    assert_eq!(cfg.altstack_kb, 16);
    assert_eq!(cfg.maps_buffer_kb, 64);
    assert_eq!(cfg.freeze_poll_us, 10);
    assert_eq!(cfg.altstack_bytes() % PAGE_SIZE, 0);

    assert_eq!(
        cfg.skip_policy(),
        SkipPolicy {
            ignore_non_writable: true,
            ignore_exec: false,
            ignore_large_anon: Some(2 * 1024 * 1024),
        }
    );

    let s = cfg.to_string();
    assert!(s.contains("/tmp/sr-x"), "{}", s);
    assert!(s.contains("max_threads: 1"), "{}", s);
    assert!(s.contains("in_ram: false"), "{}", s);
}

#[test]
fn builder_takes_whole_config() {
    let cfg = EngineConfig::default().with_verify_hashes(true);
    let built = EngineBuilder::new()
        .config(cfg)
        .snapshot_dir("/tmp/sr-b")
        .incremental(false)
        .in_ram(true)
        .build();
    assert!(built.verify_hashes);
    assert!(!built.incremental);
    assert!(built.in_ram);
    assert_eq!(built.snapshot_dir, PathBuf::from("/tmp/sr-b"));
}

#[test]
fn status_codes() {
    for code in 0..6u32 {
        let st = Status::from_u32(code).expect("known status");
        assert_eq!(st.to_u32(), code);
    }
    assert_eq!(Status::from_u32(6), None);
    assert_eq!(Status::ThreadSet.to_string(), "thread-set");

    let e = SnapshotError::from(io::Error::from(io::ErrorKind::PermissionDenied));
    assert_eq!(e.status(), Status::Io);
    let e = SnapshotError::Feasibility {
        dir: PathBuf::from("/x"),
        needed: 10,
        available: 1,
    };
    assert_eq!(e.status(), Status::Feasibility);
    assert!(e.to_string().contains("need ~10"));
    let e = SnapshotError::MemoryShortage {
        needed: 4096,
        available: 1,
    };
    assert_eq!(e.status(), Status::Feasibility);
    assert!(e.to_string().contains("in-RAM"), "{}", e);
}

#[test]
fn op_failure_becomes_public_error() {
    let e = OpFailure::new(Status::NotFound, "slot file missing").into_error(3);
    assert_eq!(e.status(), Status::NotFound);
    assert!(e.to_string().contains("slot 3"), "{}", e);

    let e = OpFailure::new(Status::ThreadSet, "driver missing").into_error(0);
    assert!(matches!(e, SnapshotError::ThreadSet(ref s) if s == "driver missing"));

    let os = io::Error::from_raw_os_error(libc::ENOSPC);
    let e = OpFailure::io("write bytes", &os).into_error(0);
    match e {
        SnapshotError::Io(inner) => {
            assert_eq!(inner.raw_os_error(), None);
            assert!(inner.to_string().starts_with("write bytes: "), "{}", inner);
        }
        other => panic!("expected Io, got {:?}", other),
    }

    let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
    let e = OpFailure::io("short read", &eof).into_error(0);
    assert_eq!(e.status(), Status::Io);

    // Consistency и всё, что не должно случаться внутри окна
    let e = OpFailure::new(Status::Feasibility, "odd").into_error(0);
    assert_eq!(e.status(), Status::Consistency);
}

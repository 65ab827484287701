// tests/engine_ram_rewind.rs
//
// save → изменение → load с поколениями в memfd. Перезаписывает память процесса,
// поэтому помечен #[ignore]; запуск:
//   cargo test --test engine_ram_rewind -- --ignored --nocapture --test-threads=1
//
// Покрываем:
// 1) Таблица memfd переживает откат памяти: load находит слот, записанный до него.
// 2) Куча, значение в Box и статика откатываются к моменту save.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

use SnapRewind::{EngineBuilder, EngineConfig, Resumed};

static LOADS: AtomicU64 = AtomicU64::new(0);

fn fill(buf: &mut [u8], seed: u128) {
    let mut rng = oorandom::Rand64::new(seed);
    for chunk in buf.chunks_mut(8) {
        let v = rng.rand_u64().to_le_bytes();
        chunk.copy_from_slice(&v[..chunk.len()]);
    }
}

#[test]
#[ignore]
fn rewind_from_memfd() -> Result<()> {
    let cfg = EngineConfig::default()
        .with_in_ram(true)
        .with_max_threads(4)
        .with_verify_hashes(true);
    let engine = EngineBuilder::new().config(cfg).attach()?;

    let mut heap = vec![0u8; 512 * 1024];
    fill(&mut heap, 11);
    let expected = heap.clone();
    let mut marker = Box::new(0u64);

    match engine.save(2)? {
        Resumed::Saved => {
            fill(&mut heap, 12);
            *marker = 1;
            LOADS.fetch_add(1, Ordering::SeqCst);
            match engine.load(2) {
                Ok(never) => match never {},
                Err(e) => bail!("load failed: {:#}", e),
            }
        }
        Resumed::Restored => {
            assert_eq!(heap, expected, "heap not rolled back");
            assert_eq!(*marker, 0);
            assert_eq!(LOADS.load(Ordering::SeqCst), 0, "statics rolled back too");
        }
    }
    assert!(engine.ram_usage() > 0);
    engine.thread_exiting();
    Ok(())
}

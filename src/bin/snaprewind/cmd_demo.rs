use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use SnapRewind::hash::hash64;
use SnapRewind::{metrics, Engine, EngineConfig, Resumed};

fn fill(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = ((i * 31) % 251) as u8;
    }
}

pub fn exec(
    dir: PathBuf,
    workers: usize,
    buffer_kb: usize,
    incremental: bool,
    compression: bool,
    in_ram: bool,
) -> Result<()> {
    let cfg = EngineConfig::from_env()
        .with_snapshot_dir(&dir)
        .with_incremental(incremental)
        .with_compression(compression)
        .with_in_ram(in_ram);
    let engine = Engine::attach(cfg).context("attach engine")?;

    let stop = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let stop = stop.clone();
        let ticks = ticks.clone();
        let h = engine
            .spawn(&format!("sr-demo-{}", i), move || {
                while !stop.load(Ordering::Acquire) {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .with_context(|| format!("spawn worker {}", i))?;
        handles.push(h);
    }

    let mut buf = vec![0u8; buffer_kb * 1024];
    fill(&mut buf);
    let expected = hash64(&buf);

    match engine.save(0).context("save slot 0")? {
        Resumed::Saved => {
            println!("slot 0 saved; mutating {} KiB and loading it back", buffer_kb);
            buf.iter_mut().for_each(|b| *b = !*b);
            let extra: Vec<u8> = vec![0xa5; 128 * 1024];
            if hash64(&buf) == expected || extra.is_empty() {
                bail!("mutation did not change the buffer");
            }
            match engine.load(0) {
                Ok(never) => match never {},
                Err(e) => return Err(e).context("load slot 0"),
            }
        }
        Resumed::Restored => {
            println!("slot 0 restored");
        }
    }

    if hash64(&buf) != expected {
        bail!("buffer content differs after restore");
    }

    // второй save без изменений буфера: в incremental-режиме почти весь Unchanged
    let before = metrics::snapshot();
    engine.save(1).context("save slot 1")?;
    let after = metrics::snapshot();

    stop.store(true, Ordering::Release);
    for h in handles {
        let _ = h.join();
    }

    println!("Round trip OK");
    println!("  workers:            {} ({} ticks)", workers, ticks.load(Ordering::Relaxed));
    println!("  pages restored:     {}", after.pages_restored);
    println!("  pages skipped:      {}", after.pages_skipped_on_load);
    println!("  threads recreated:  {}", after.threads_recreated);
    println!(
        "  slot 1 payload:     {} bytes ({} unchanged pages)",
        after.payload_bytes - before.payload_bytes,
        after.pages_unchanged - before.pages_unchanged
    );
    if in_ram {
        println!("  memfd usage:        {} bytes", engine.ram_usage());
    }
    Ok(())
}

use anyhow::{bail, Result};
use std::path::PathBuf;

use SnapRewind::snapshot::inspect::inspect_generation;
use SnapRewind::GenerationKind;

pub fn exec(dir: PathBuf, slot: Option<u32>, base: bool, json: bool) -> Result<()> {
    let kind = match (slot, base) {
        (Some(s), false) => GenerationKind::Slot(s),
        (None, true) => GenerationKind::Base,
        _ => bail!("specify exactly one of --slot N or --base"),
    };
    let s = inspect_generation(&dir, kind)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&s)?);
        return Ok(());
    }

    println!("Generation {}", s.meta_path);
    match s.slot {
        Some(n) => println!("  kind:        slot {}", n),
        None => println!("  kind:        {}", s.kind),
    }
    println!("  session:     {}", s.session);
    println!(
        "  generation:  {} (base {}, parent {})",
        s.generation, s.base_generation, s.parent_generation
    );
    println!("  incremental: {}", s.incremental);
    println!("  compressed:  {}", s.compressed);
    println!("  driver:      {}", s.driver_pthread);
    println!("  bytes file:  {} bytes", s.bytes_len);

    println!("Threads ({}):", s.threads.len());
    for t in &s.threads {
        println!(
            "  tid={:<8} state={:<12} pthread={} ip={} sp={}",
            t.tid, t.state, t.pthread, t.ip, t.sp
        );
    }

    println!("Areas ({}):", s.areas.len());
    for a in &s.areas {
        if a.skip {
            println!("  {}-{} {} [skip] {}", a.start, a.end, a.perms, a.name);
            continue;
        }
        println!(
            "  {}-{} {} pages={} nopage={} zero={} unchanged={} comp={} raw={} {}",
            a.start,
            a.end,
            a.perms,
            a.pages,
            a.flags.no_page,
            a.flags.zero,
            a.flags.unchanged,
            a.flags.compressed,
            a.flags.raw,
            a.name
        );
    }

    let f = &s.flags;
    println!(
        "Total pages: {} (nopage={}, zero={}, unchanged={}, compressed={}, raw={})",
        f.total(),
        f.no_page,
        f.zero,
        f.unchanged,
        f.compressed,
        f.raw
    );
    Ok(())
}

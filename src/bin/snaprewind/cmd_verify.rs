use anyhow::{bail, Result};
use std::path::PathBuf;

use SnapRewind::snapshot::inspect::verify_slot;

pub fn exec(dir: PathBuf, slot: u32, json: bool) -> Result<()> {
    let rep = verify_slot(&dir, slot)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rep)?);
    } else {
        println!("Verify slot {} (generation {})", rep.slot, rep.generation);
        println!("  pages checked:      {}", rep.pages_checked);
        println!("  payload pages:      {}", rep.payload_pages);
        println!("  unchanged resolved: {}", rep.unchanged_resolved);
        println!("  areas hashed:       {}", rep.areas_hashed);
        println!("  hash mismatches:    {}", rep.hash_mismatches);
        for e in &rep.errors {
            println!("  ERROR: {}", e);
        }
    }

    if !rep.ok() {
        bail!("slot {} failed verification ({} problems)", slot, rep.errors.len());
    }
    if !json {
        println!("OK");
    }
    Ok(())
}

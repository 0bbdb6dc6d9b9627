//! `clyde cache` subcommands.

use crate::cache::{BuildCache, CacheTier};
use crate::ops::Error;

pub fn list(cache: &BuildCache) -> Result<(), Error> {
    let entries = cache.enumerate(None);
    if entries.is_empty() {
        println!("cache is empty ({})", cache.root().display());
        return Ok(());
    }
    let mut objects = 0u64;
    let mut artifacts = 0u64;
    for entry in &entries {
        let tier = match entry.tier {
            CacheTier::Objects => {
                objects += entry.size;
                "object"
            }
            CacheTier::Artifacts => {
                artifacts += entry.size;
                "artifact"
            }
        };
        println!("{:<9} {}  {} bytes", tier, entry.key, entry.size);
    }
    println!(
        "{} entries, {} object bytes, {} artifact bytes",
        entries.len(),
        objects,
        artifacts
    );
    Ok(())
}

pub fn clean(cache: &BuildCache) -> Result<(), Error> {
    let removed = cache.evict(|_| true)?;
    println!("removed {removed} cache entries from {}", cache.root().display());
    Ok(())
}

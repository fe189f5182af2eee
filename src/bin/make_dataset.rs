//! Build the cleaned precinct table from the raw source files and cache it.
//!
//! Usage: `make_dataset [DATA_DIR] [CACHE_DB]`. Defaults to `data` and
//! `precomputed_data/ecoinfer.db`. If the table is already cached this is a
//! no-op; clear the cache to force a rebuild.

use std::path::Path;

use log::info;

use ecoinfer_re::data::{make_precinct_table, DataPaths, DEFAULT_OFFICE};
use ecoinfer_re::store::CacheStore;

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> ecoinfer_re::Result<()> {
    let mut args = std::env::args().skip(1);
    let data_dir = args.next().unwrap_or_else(|| "data".to_string());
    let cache_db = args
        .next()
        .unwrap_or_else(|| "precomputed_data/ecoinfer.db".to_string());
    if let Some(parent) = Path::new(&cache_db).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut store = CacheStore::open(&cache_db)?;
    if let Some(table) = store.load_table()? {
        info!("precinct table already cached; skipping rebuild");
        println!(
            "cache hit: {} precinct rows across districts {:?}",
            table.len(),
            table.districts()
        );
        return Ok(());
    }

    let table = make_precinct_table(&DataPaths::new(&data_dir), DEFAULT_OFFICE)?;
    store.save_table(&table)?;
    let stats = store.stats()?;
    println!(
        "built {} precinct rows across districts {:?} ({} bytes cached)",
        table.len(),
        table.districts(),
        stats.db_size_bytes
    );
    Ok(())
}

//! Run ecological inference for one congressional district and render the
//! charts.
//!
//! Usage: `run_inference [CACHE_DB] [DISTRICT] [DRAWS] [OUT_DIR]`. The
//! precinct table must already be cached (see `make_dataset`). A trace
//! cached under the same district/draws/seed key is reused instead of
//! resampling; delete it from the cache to force a fresh run.

use std::path::PathBuf;

use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use ecoinfer_re::data::PrecinctRecord;
use ecoinfer_re::model::{EiModel, EiModelArgs};
use ecoinfer_re::store::CacheStore;
use ecoinfer_re::{plots, sampler, Error};

/// Number of precincts shown on the density chart.
const DENSITY_ROWS: usize = 10;

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> ecoinfer_re::Result<()> {
    let mut args = std::env::args().skip(1);
    let cache_db = args
        .next()
        .unwrap_or_else(|| "precomputed_data/ecoinfer.db".to_string());
    let district: Option<u32> = args.next().map(|s| s.parse().unwrap_or(0));
    let draws: Option<usize> = args.next().and_then(|s| s.parse().ok());
    let out_dir = PathBuf::from(args.next().unwrap_or_else(|| "plots".to_string()));

    let mut store = CacheStore::open(&cache_db)?;
    let table = store
        .load_table()?
        .ok_or_else(|| Error::MissingInput(PathBuf::from(&cache_db)))?;

    let district = match district {
        Some(d) if d > 0 => d,
        _ => table.districts()[0],
    };
    let records: Vec<&PrecinctRecord> = table.district_records(district);
    if records.is_empty() {
        return Err(Error::Integrity(format!(
            "no precincts in district {district}; available: {:?}",
            table.districts()
        )));
    }
    info!("district {district}: {} precincts", records.len());

    let model = EiModel::from_records(&records)?;
    let mut margs = EiModelArgs::new();
    if let Some(d) = draws {
        margs.draws = d;
    }
    let run_key = format!("district{district}-draws{}-seed{}", margs.draws, margs.seed);

    let trace = match store.load_trace(&run_key)? {
        Some(trace) => {
            info!("trace {run_key:?} found in cache; skipping sampling");
            trace
        }
        None => {
            let trace = sampler::sample(&model, &margs)?;
            store.save_trace(&run_key, &trace)?;
            trace
        }
    };

    let d = &trace.diagnostics;
    println!(
        "{} draws ({} chains x {}), acceptance latent {:.2} / hyper {:.2}, max split-Rhat {:.3}",
        trace.total_draws(),
        d.chains,
        d.draws_per_chain,
        d.accept_latent,
        d.accept_hyper,
        d.max_rhat
    );
    if !d.converged() {
        println!("warning: chains may not have converged; consider more draws or warmup");
    }

    std::fs::create_dir_all(&out_dir)?;
    let labels: Vec<String> = records.iter().map(|r| r.label.clone()).collect();
    let mut selected: Vec<usize> = (0..records.len()).collect();
    let mut rng = StdRng::seed_from_u64(margs.seed);
    selected.shuffle(&mut rng);
    selected.truncate(DENSITY_ROWS);

    let density_path = out_dir.join(format!("district{district}_precinct_densities.svg"));
    plots::plot_precinct_densities(&trace, &labels, &selected, district, &density_path)?;
    let means_path = out_dir.join(format!("district{district}_posterior_means.svg"));
    plots::plot_posterior_means(&trace, &model.pct_minority().to_vec(), district, &means_path)?;
    println!(
        "wrote {} and {}",
        density_path.display(),
        means_path.display()
    );
    Ok(())
}

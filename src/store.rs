//! SQLite-backed disk cache for the cleaned precinct table and posterior
//! traces.
//!
//! Presence of a cached row set is the only validity signal; nothing here
//! invalidates a trace when the model specification changes. Managing that
//! staleness (or passing a fresh run key) is the caller's responsibility.

use std::path::Path;

use ndarray::Array2;
use rusqlite::{params, Connection, OptionalExtension};

use crate::data::{PrecinctRecord, PrecinctTable};
use crate::error::{Error, Result};
use crate::sampler::{Diagnostics, Trace};

/// SQLite-backed cache of intermediate artifacts.
pub struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    /// Open (or create) the cache database and its tables.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS precincts (
                division TEXT NOT NULL,
                district INTEGER NOT NULL,
                label TEXT NOT NULL,
                white REAL NOT NULL,
                black REAL NOT NULL,
                hispanic REAL NOT NULL,
                other REAL NOT NULL,
                total REAL NOT NULL,
                dem INTEGER NOT NULL,
                lib INTEGER NOT NULL,
                rep INTEGER NOT NULL,
                total_votes INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (division, district)
            );
            CREATE TABLE IF NOT EXISTS trace_vars (
                run_key TEXT NOT NULL,
                var TEXT NOT NULL,
                rows INTEGER NOT NULL,
                cols INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (run_key, var)
            );
            CREATE TABLE IF NOT EXISTS trace_meta (
                run_key TEXT PRIMARY KEY,
                chains INTEGER NOT NULL,
                draws_per_chain INTEGER NOT NULL,
                accept_latent REAL NOT NULL,
                accept_hyper REAL NOT NULL,
                max_rhat REAL NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Replace the cached precinct table.
    pub fn save_table(&mut self, table: &PrecinctTable) -> Result<()> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM precincts", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO precincts (division, district, label, white, black, hispanic,
                                        other, total, dem, lib, rep, total_votes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for rec in &table.records {
                stmt.execute(params![
                    rec.division,
                    rec.district,
                    rec.label,
                    rec.white,
                    rec.black,
                    rec.hispanic,
                    rec.other,
                    rec.total,
                    rec.dem as i64,
                    rec.lib as i64,
                    rec.rep as i64,
                    rec.total_votes as i64,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load the cached precinct table, or `None` when the cache is empty.
    pub fn load_table(&self) -> Result<Option<PrecinctTable>> {
        let mut stmt = self.conn.prepare(
            "SELECT division, district, label, white, black, hispanic, other, total,
                    dem, lib, rep, total_votes
             FROM precincts
             ORDER BY district, division",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PrecinctRecord {
                division: row.get(0)?,
                district: row.get(1)?,
                label: row.get(2)?,
                white: row.get(3)?,
                black: row.get(4)?,
                hispanic: row.get(5)?,
                other: row.get(6)?,
                total: row.get(7)?,
                dem: row.get::<_, i64>(8)? as u64,
                lib: row.get::<_, i64>(9)? as u64,
                rep: row.get::<_, i64>(10)? as u64,
                total_votes: row.get::<_, i64>(11)? as u64,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        if records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PrecinctTable { records }))
        }
    }

    /// Drop the cached precinct table, forcing the next load to recompute.
    pub fn clear_table(&self) -> Result<()> {
        self.conn.execute("DELETE FROM precincts", [])?;
        Ok(())
    }

    /// Persist a trace under `run_key`, replacing any previous run with the
    /// same key.
    pub fn save_trace(&mut self, run_key: &str, trace: &Trace) -> Result<()> {
        let created_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM trace_vars WHERE run_key = ?1", params![run_key])?;
        tx.execute("DELETE FROM trace_meta WHERE run_key = ?1", params![run_key])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trace_vars (run_key, var, rows, cols, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, draws) in trace.variables() {
                stmt.execute(params![
                    run_key,
                    name,
                    draws.nrows() as i64,
                    draws.ncols() as i64,
                    encode_f64s(draws),
                ])?;
            }
        }
        let d = &trace.diagnostics;
        tx.execute(
            "INSERT INTO trace_meta (run_key, chains, draws_per_chain, accept_latent,
                                     accept_hyper, max_rhat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_key,
                d.chains as i64,
                d.draws_per_chain as i64,
                d.accept_latent,
                d.accept_hyper,
                d.max_rhat,
                created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load the trace stored under `run_key`, or `None` if no run with that
    /// key has been cached.
    pub fn load_trace(&self, run_key: &str) -> Result<Option<Trace>> {
        let meta = self
            .conn
            .query_row(
                "SELECT chains, draws_per_chain, accept_latent, accept_hyper, max_rhat
                 FROM trace_meta WHERE run_key = ?1",
                params![run_key],
                |row| {
                    Ok(Diagnostics {
                        chains: row.get::<_, i64>(0)? as usize,
                        draws_per_chain: row.get::<_, i64>(1)? as usize,
                        accept_latent: row.get(2)?,
                        accept_hyper: row.get(3)?,
                        max_rhat: row.get(4)?,
                    })
                },
            )
            .optional()?;
        let Some(diagnostics) = meta else {
            return Ok(None);
        };

        Ok(Some(Trace {
            minority_rate: self.load_trace_var(run_key, "minority_rate")?,
            majority_rate: self.load_trace_var(run_key, "majority_rate")?,
            expected_dem_share: self.load_trace_var(run_key, "expected_dem_share")?,
            alpha: self.load_trace_var(run_key, "alpha")?,
            beta: self.load_trace_var(run_key, "beta")?,
            diagnostics,
        }))
    }

    /// Drop one cached trace.
    pub fn delete_trace(&self, run_key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM trace_vars WHERE run_key = ?1", params![run_key])?;
        self.conn
            .execute("DELETE FROM trace_meta WHERE run_key = ?1", params![run_key])?;
        Ok(())
    }

    /// Cache statistics for inspection.
    pub fn stats(&self) -> Result<CacheStats> {
        let precinct_rows: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM precincts", [], |row| row.get(0))?;
        let trace_runs: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM trace_meta", [], |row| row.get(0))?;
        let db_size_bytes = if let Some(path) = self.conn.path() {
            std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        Ok(CacheStats {
            precinct_rows: precinct_rows as usize,
            trace_runs: trace_runs as usize,
            db_size_bytes,
        })
    }

    fn load_trace_var(&self, run_key: &str, name: &str) -> Result<Array2<f64>> {
        let row = self
            .conn
            .query_row(
                "SELECT rows, cols, data FROM trace_vars WHERE run_key = ?1 AND var = ?2",
                params![run_key, name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as usize,
                        row.get::<_, i64>(1)? as usize,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((rows, cols, blob)) = row else {
            return Err(Error::MissingTraceVariable(name.to_string()));
        };
        let values = decode_f64s(&blob);
        Array2::from_shape_vec((rows, cols), values).map_err(|e| Error::BadShape(e.to_string()))
    }
}

/// Statistics about the cache contents.
#[derive(Debug)]
pub struct CacheStats {
    pub precinct_rows: usize,
    pub trace_runs: usize,
    pub db_size_bytes: u64,
}

fn encode_f64s(draws: &Array2<f64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(draws.len() * 8);
    for &v in draws.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_f64s(blob: &[u8]) -> Vec<f64> {
    blob.chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_table() -> PrecinctTable {
        PrecinctTable {
            records: vec![
                PrecinctRecord {
                    division: "ocd-division/country:us/state:nc/county:wake/precinct:01-01"
                        .to_string(),
                    district: 4,
                    label: "Wake (01-01)".to_string(),
                    white: 900.0,
                    black: 300.0,
                    hispanic: 100.0,
                    other: 50.0,
                    total: 1350.0,
                    dem: 600,
                    lib: 20,
                    rep: 400,
                    total_votes: 1020,
                },
                PrecinctRecord {
                    division: "ocd-division/country:us/state:nc/county:durham/precinct:2"
                        .to_string(),
                    district: 1,
                    label: "Durham (2)".to_string(),
                    white: 400.0,
                    black: 700.0,
                    hispanic: 150.0,
                    other: 50.0,
                    total: 1300.0,
                    dem: 800,
                    lib: 10,
                    rep: 150,
                    total_votes: 960,
                },
            ],
        }
    }

    fn sample_trace() -> Trace {
        let draws = |v: Vec<f64>, cols: usize| {
            let rows = v.len() / cols;
            Array2::from_shape_vec((rows, cols), v).unwrap()
        };
        Trace {
            minority_rate: draws(vec![0.8, 0.9, 0.85, 0.88], 2),
            majority_rate: draws(vec![0.3, 0.4, 0.35, 0.32], 2),
            expected_dem_share: draws(vec![0.5, 0.6, 0.55, 0.57], 2),
            alpha: draws(vec![2.0, 1.5, 2.1, 1.6], 2),
            beta: draws(vec![1.0, 3.0, 1.1, 2.9], 2),
            diagnostics: Diagnostics {
                chains: 2,
                draws_per_chain: 1,
                accept_latent: 0.44,
                accept_hyper: 0.41,
                max_rhat: 1.01,
            },
        }
    }

    #[test]
    fn table_round_trip_and_invalidate() {
        let db_path = "/tmp/ecoinfer_test_table.db";
        let _ = fs::remove_file(db_path);

        let mut store = CacheStore::open(db_path).unwrap();
        assert!(store.load_table().unwrap().is_none());

        let table = sample_table();
        store.save_table(&table).unwrap();

        // Two loads without touching the source give identical tables.
        let first = store.load_table().unwrap().unwrap();
        let second = store.load_table().unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), table.len());
        // Ordered by (district, division) on the way out.
        assert_eq!(first.records[0].district, 1);

        // Clearing the cache forces recomputation rather than a stale read.
        store.clear_table().unwrap();
        assert!(store.load_table().unwrap().is_none());

        drop(store);
        let _ = fs::remove_file(db_path);
    }

    #[test]
    fn trace_round_trip() {
        let db_path = "/tmp/ecoinfer_test_trace.db";
        let _ = fs::remove_file(db_path);

        let mut store = CacheStore::open(db_path).unwrap();
        let trace = sample_trace();
        assert!(store.load_trace("district1-5000").unwrap().is_none());

        store.save_trace("district1-5000", &trace).unwrap();
        let loaded = store.load_trace("district1-5000").unwrap().unwrap();
        assert_eq!(loaded, trace);

        store.delete_trace("district1-5000").unwrap();
        assert!(store.load_trace("district1-5000").unwrap().is_none());

        drop(store);
        let _ = fs::remove_file(db_path);
    }

    #[test]
    fn missing_trace_variable_is_an_error() {
        let db_path = "/tmp/ecoinfer_test_missing_var.db";
        let _ = fs::remove_file(db_path);

        let mut store = CacheStore::open(db_path).unwrap();
        store.save_trace("run", &sample_trace()).unwrap();
        store
            .conn
            .execute("DELETE FROM trace_vars WHERE var = 'alpha'", [])
            .unwrap();
        assert!(matches!(
            store.load_trace("run"),
            Err(Error::MissingTraceVariable(_))
        ));

        drop(store);
        let _ = fs::remove_file(db_path);
    }

    #[test]
    fn stats_counts_rows() {
        let db_path = "/tmp/ecoinfer_test_stats.db";
        let _ = fs::remove_file(db_path);

        let mut store = CacheStore::open(db_path).unwrap();
        store.save_table(&sample_table()).unwrap();
        store.save_trace("run", &sample_trace()).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.precinct_rows, 2);
        assert_eq!(stats.trace_runs, 1);

        drop(store);
        let _ = fs::remove_file(db_path);
    }
}

//! Crate-wide error type.
//!
//! Data gaps (missing files, unresolved identifiers) are hard errors that
//! require manual curation of the source data. Sampler non-convergence is
//! deliberately *not* represented here; it is reported as a diagnostic on
//! the trace and left to the caller's judgment.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("required column {0:?} not found in {1}")]
    MissingColumn(String, PathBuf),

    #[error("malformed row in {file}: {detail}")]
    MalformedRow { file: PathBuf, detail: String },

    #[error("unknown office {0:?}; available offices: {1}")]
    UnknownOffice(String, String),

    #[error("{} division(s) could not be resolved through the crosswalk, e.g. {:?}", .0.len(), .0.first())]
    UnresolvedDivisions(Vec<String>),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("shape mismatch: {0}")]
    BadShape(String),

    #[error("trace variable {0:?} missing from cache")]
    MissingTraceVariable(String),

    #[error("plot error: {0}")]
    Plot(String),
}

//! Library crate exposing ecological-inference components used by binary
//! targets.
//!
//! The pipeline runs in three stages: `data` joins the raw census and
//! election sources into one per-precinct table, `model` plus `sampler`
//! draw posterior samples of race-conditional voting rates, and `plots`
//! renders charts from the trace. `store` caches the intermediate artifacts
//! on disk between runs.

pub mod data;
pub mod error;
pub mod math;
pub mod model;
pub mod plots;
pub mod sampler;
pub mod store;

pub use error::{Error, Result};

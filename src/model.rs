//! The 2x2 hierarchical ecological-inference model.
//!
//! Follows King/Rosen/Tanner: each precinct has latent minority and majority
//! rates of voting for the Democratic candidate, drawn from group-level Beta
//! distributions whose shape parameters carry Exponential hyperpriors shared
//! across precincts (partial pooling). Observed Democratic votes out of the
//! two-party ballot count enter through a Binomial likelihood on the
//! population-weighted mixture of the two rates.
//!
//! Latent rates are carried in logit space and hyperparameters in log space,
//! with Jacobian corrections folded into the densities below. A naive
//! bounded parameterization mixes poorly under a random-walk sampler.

use ndarray::Array1;

use crate::data::PrecinctRecord;
use crate::error::{Error, Result};
use crate::math::{inv_logit, ln_beta, ln_choose, ln_inv_logit};

/// Group index for the minority voting rate.
pub const MINORITY: usize = 0;
/// Group index for the majority voting rate.
pub const MAJORITY: usize = 1;

/// Model hyperparameters and sampler configuration.
#[derive(Clone, Debug)]
pub struct EiModelArgs {
    /// Rate of the Exponential hyperpriors (0.5 in King's paper).
    pub lam: f64,
    /// Retained posterior draws per chain.
    pub draws: usize,
    /// Warm-up draws per chain, discarded after adaptation.
    pub warmup: usize,
    /// Number of independent chains.
    pub chains: usize,
    /// Base RNG seed; chain `c` is seeded with `seed + c`.
    pub seed: u64,
}

impl Default for EiModelArgs {
    fn default() -> Self {
        Self {
            lam: 0.5,
            draws: 5000,
            warmup: 1000,
            chains: 2,
            seed: 20_161_108,
        }
    }
}

impl EiModelArgs {
    /// Convenience constructor matching the original API.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Immutable per-district model data: observed counts and the derived
/// minority population share per precinct.
pub struct EiModel {
    pct_minority: Array1<f64>,
    ballots: Array1<f64>,
    dem_votes: Array1<f64>,
}

impl EiModel {
    /// Build the model from raw per-precinct arrays.
    ///
    /// `dem_votes[i]` must not exceed `ballots[i]`, and `pct_minority` must
    /// lie in [0, 1]; all three must have the same length.
    pub fn new(dem_votes: Vec<f64>, ballots: Vec<f64>, pct_minority: Vec<f64>) -> Result<Self> {
        let n = ballots.len();
        if dem_votes.len() != n || pct_minority.len() != n {
            return Err(Error::BadShape(format!(
                "dem_votes ({}), ballots ({}) and pct_minority ({}) must share a length",
                dem_votes.len(),
                n,
                pct_minority.len()
            )));
        }
        if n == 0 {
            return Err(Error::BadShape("model needs at least one precinct".to_string()));
        }
        for i in 0..n {
            if ballots[i] < 0.0 || dem_votes[i] < 0.0 || dem_votes[i] > ballots[i] {
                return Err(Error::BadShape(format!(
                    "precinct {i}: {} democratic votes out of {} ballots",
                    dem_votes[i], ballots[i]
                )));
            }
            if !(0.0..=1.0).contains(&pct_minority[i]) {
                return Err(Error::BadShape(format!(
                    "precinct {i}: pct_minority {} outside [0, 1]",
                    pct_minority[i]
                )));
            }
        }
        Ok(Self {
            pct_minority: Array1::from(pct_minority),
            ballots: Array1::from(ballots),
            dem_votes: Array1::from(dem_votes),
        })
    }

    /// Build the model from cleaned precinct rows, typically one district's
    /// subset of the loaded table.
    pub fn from_records(records: &[&PrecinctRecord]) -> Result<Self> {
        let dem_votes = records.iter().map(|r| r.dem as f64).collect();
        let ballots = records.iter().map(|r| r.two_party_ballots() as f64).collect();
        let pct_minority = records.iter().map(|r| r.pct_minority()).collect();
        Self::new(dem_votes, ballots, pct_minority)
    }

    pub fn n_precincts(&self) -> usize {
        self.ballots.len()
    }

    pub fn pct_minority(&self) -> &Array1<f64> {
        &self.pct_minority
    }

    /// Expected Democratic vote share for precinct `i` given both rates.
    pub fn expected_dem_share(&self, i: usize, b_minority: f64, b_majority: f64) -> f64 {
        let x = self.pct_minority[i];
        x * b_minority + (1.0 - x) * b_majority
    }

    /// Binomial log-likelihood of precinct `i`, up to the binomial
    /// coefficient, which is constant in the parameters.
    pub(crate) fn ln_likelihood(&self, i: usize, b_minority: f64, b_majority: f64) -> f64 {
        let n = self.ballots[i];
        if n == 0.0 {
            return 0.0;
        }
        let k = self.dem_votes[i];
        let x = self.pct_minority[i];
        let p = x * b_minority + (1.0 - x) * b_majority;
        // 1 - p computed directly to keep precision when p is near one.
        let q = x * (1.0 - b_minority) + (1.0 - x) * (1.0 - b_majority);
        let mut lp = 0.0;
        if k > 0.0 {
            lp += k * p.ln();
        }
        if n - k > 0.0 {
            lp += (n - k) * q.ln();
        }
        lp
    }

    /// Full joint log-density at one parameter point, in the sampled
    /// (logit/log) parameterization, including normalizing constants.
    ///
    /// The sampler works with local differences of this quantity; the full
    /// evaluation is kept for diagnostics and consistency checks.
    pub fn ln_posterior(
        &self,
        theta_minority: &[f64],
        theta_majority: &[f64],
        ln_alpha: [f64; 2],
        ln_beta_param: [f64; 2],
        lam: f64,
    ) -> Result<f64> {
        let n = self.n_precincts();
        if theta_minority.len() != n || theta_majority.len() != n {
            return Err(Error::BadShape(format!(
                "expected {n} latent rates per group, got {} and {}",
                theta_minority.len(),
                theta_majority.len()
            )));
        }
        let alpha = [ln_alpha[0].exp(), ln_alpha[1].exp()];
        let beta = [ln_beta_param[0].exp(), ln_beta_param[1].exp()];

        let mut lp = 0.0;
        for g in [MINORITY, MAJORITY] {
            lp += ln_exp_prior_log(ln_alpha[g], lam);
            lp += ln_exp_prior_log(ln_beta_param[g], lam);
        }
        for i in 0..n {
            lp += ln_beta_prior_logit(theta_minority[i], alpha[MINORITY], beta[MINORITY]);
            lp += ln_beta_prior_logit(theta_majority[i], alpha[MAJORITY], beta[MAJORITY]);
            let b_min = inv_logit(theta_minority[i]);
            let b_maj = inv_logit(theta_majority[i]);
            lp += self.ln_likelihood(i, b_min, b_maj);
            lp += ln_choose(self.ballots[i], self.dem_votes[i]);
        }
        Ok(lp)
    }
}

/// Beta(alpha, beta) log-density of a rate expressed in logit space,
/// Jacobian included: the `-1` exponents cancel against `b(1-b)`.
pub(crate) fn ln_beta_prior_logit(theta: f64, alpha: f64, beta: f64) -> f64 {
    alpha * ln_inv_logit(theta) + beta * ln_inv_logit(-theta) - ln_beta(alpha, beta)
}

/// Exponential(lam) log-density of a positive parameter expressed in log
/// space, Jacobian included.
pub(crate) fn ln_exp_prior_log(ln_value: f64, lam: f64) -> f64 {
    lam.ln() - lam * ln_value.exp() + ln_value
}

//! Adaptive random-walk Metropolis sampler for the ecological-inference
//! model, plus the posterior trace it produces.
//!
//! Each latent logit-rate and log-hyperparameter gets a component-wise
//! Gaussian proposal whose step size is tuned during warm-up toward the
//! scalar-optimal acceptance rate. Warm-up draws are discarded; the retained
//! draws from all chains are concatenated chain-major. Non-convergence is a
//! diagnostic on the trace, never an error.

use log::{info, warn};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{Error, Result};
use crate::math::{inv_logit, ln_beta, ln_inv_logit};
use crate::model::{ln_exp_prior_log, EiModel, EiModelArgs, MAJORITY, MINORITY};

/// Acceptance rate targeted by the step-size adaptation.
const TARGET_ACCEPT: f64 = 0.44;
/// Warm-up iterations per adaptation batch.
const ADAPT_BATCH: usize = 50;
/// Split-R̂ above this is flagged in the logs.
const RHAT_WARN: f64 = 1.1;

/// Sampler health summary attached to every trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub chains: usize,
    pub draws_per_chain: usize,
    /// Post-warmup acceptance rate across all latent-rate updates.
    pub accept_latent: f64,
    /// Post-warmup acceptance rate across hyperparameter updates.
    pub accept_hyper: f64,
    /// Largest split-R̂ over all monitored variables.
    pub max_rhat: f64,
}

impl Diagnostics {
    /// Rough convergence check; failing it suggests re-running with more
    /// draws or a longer warm-up, at the caller's discretion.
    pub fn converged(&self) -> bool {
        self.max_rhat.is_finite() && self.max_rhat < RHAT_WARN
    }
}

/// Posterior draws, one row per retained draw (chains concatenated in
/// order), one column per precinct or group.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Minority support rate per precinct.
    pub minority_rate: Array2<f64>,
    /// Majority support rate per precinct.
    pub majority_rate: Array2<f64>,
    /// Deterministic expected Democratic share per precinct.
    pub expected_dem_share: Array2<f64>,
    /// Beta shape `alpha` per group (minority, majority).
    pub alpha: Array2<f64>,
    /// Beta shape `beta` per group (minority, majority).
    pub beta: Array2<f64>,
    pub diagnostics: Diagnostics,
}

impl Trace {
    pub fn n_precincts(&self) -> usize {
        self.minority_rate.ncols()
    }

    pub fn total_draws(&self) -> usize {
        self.minority_rate.nrows()
    }

    /// Named views over the draw matrices, in a fixed order, used by the
    /// cache store.
    pub fn variables(&self) -> [(&'static str, &Array2<f64>); 5] {
        [
            ("minority_rate", &self.minority_rate),
            ("majority_rate", &self.majority_rate),
            ("expected_dem_share", &self.expected_dem_share),
            ("alpha", &self.alpha),
            ("beta", &self.beta),
        ]
    }
}

/// Column-wise posterior means.
pub fn column_means(draws: &Array2<f64>) -> Array1<f64> {
    let n = draws.nrows().max(1) as f64;
    draws.sum_axis(ndarray::Axis(0)) / n
}

/// Column-wise central credible interval with total mass `prob`.
pub fn credible_interval(draws: &Array2<f64>, prob: f64) -> (Array1<f64>, Array1<f64>) {
    let tail = (1.0 - prob) / 2.0;
    (column_quantile(draws, tail), column_quantile(draws, 1.0 - tail))
}

/// Column-wise empirical quantile (nearest-rank).
pub fn column_quantile(draws: &Array2<f64>, q: f64) -> Array1<f64> {
    let rows = draws.nrows();
    let mut out = Array1::zeros(draws.ncols());
    if rows == 0 {
        return out;
    }
    let rank = ((q * rows as f64).floor() as usize).min(rows - 1);
    for (j, col) in draws.columns().into_iter().enumerate() {
        let mut values: Vec<f64> = col.to_vec();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        out[j] = values[rank];
    }
    out
}

/// Per-component proposal scale with batched warm-up adaptation.
struct AdaptiveScale {
    ln_step: f64,
    batch: usize,
    tried: usize,
    accepted: usize,
}

impl AdaptiveScale {
    fn new(initial_step: f64) -> Self {
        Self { ln_step: initial_step.ln(), batch: 0, tried: 0, accepted: 0 }
    }

    fn step(&self) -> f64 {
        self.ln_step.exp()
    }

    fn record(&mut self, accepted: bool, adapting: bool) {
        if !adapting {
            return;
        }
        self.tried += 1;
        if accepted {
            self.accepted += 1;
        }
        if self.tried == ADAPT_BATCH {
            self.batch += 1;
            let delta = (1.0 / (self.batch as f64).sqrt()).min(0.1);
            if self.accepted as f64 / self.tried as f64 > TARGET_ACCEPT {
                self.ln_step += delta;
            } else {
                self.ln_step -= delta;
            }
            self.tried = 0;
            self.accepted = 0;
        }
    }
}

/// Mutable chain state in the sampled parameterization, with cached
/// transforms of the latent rates.
struct ChainState {
    theta: [Vec<f64>; 2],
    rate: [Vec<f64>; 2],
    ln_rate: [Vec<f64>; 2],
    ln_rate_comp: [Vec<f64>; 2],
    ln_alpha: [f64; 2],
    ln_beta_param: [f64; 2],
}

impl ChainState {
    fn init(n: usize, rng: &mut StdRng) -> Self {
        let mut theta_init = || -> Vec<f64> {
            (0..n).map(|_| 0.1 * rng.sample::<f64, _>(StandardNormal)).collect()
        };
        let theta = [theta_init(), theta_init()];
        let mut state = Self {
            rate: [vec![0.0; n], vec![0.0; n]],
            ln_rate: [vec![0.0; n], vec![0.0; n]],
            ln_rate_comp: [vec![0.0; n], vec![0.0; n]],
            // Exponential(0.5) has mean 2; start the shapes there, jittered.
            ln_alpha: [
                2f64.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal),
                2f64.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal),
            ],
            ln_beta_param: [
                2f64.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal),
                2f64.ln() + 0.1 * rng.sample::<f64, _>(StandardNormal),
            ],
            theta,
        };
        for g in [MINORITY, MAJORITY] {
            for i in 0..n {
                let theta = state.theta[g][i];
                state.set_theta(g, i, theta);
            }
        }
        state
    }

    fn set_theta(&mut self, group: usize, i: usize, theta: f64) {
        self.theta[group][i] = theta;
        self.rate[group][i] = inv_logit(theta);
        self.ln_rate[group][i] = ln_inv_logit(theta);
        self.ln_rate_comp[group][i] = ln_inv_logit(-theta);
    }
}

struct ChainDraws {
    minority: Vec<f64>,
    majority: Vec<f64>,
    expected: Vec<f64>,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    latent_tried: usize,
    latent_accepted: usize,
    hyper_tried: usize,
    hyper_accepted: usize,
}

/// Draw posterior samples for `model` under `args`.
///
/// Deterministic for a fixed seed. Returns the concatenated trace with
/// diagnostics; convergence problems are logged, not raised.
pub fn sample(model: &EiModel, args: &EiModelArgs) -> Result<Trace> {
    if args.draws == 0 || args.chains == 0 {
        return Err(Error::BadShape(
            "sampler needs at least one draw and one chain".to_string(),
        ));
    }
    let n = model.n_precincts();
    let total = args.chains * args.draws;

    let mut minority = Vec::with_capacity(total * n);
    let mut majority = Vec::with_capacity(total * n);
    let mut expected = Vec::with_capacity(total * n);
    let mut alpha = Vec::with_capacity(total * 2);
    let mut beta = Vec::with_capacity(total * 2);
    let mut latent_tried = 0usize;
    let mut latent_accepted = 0usize;
    let mut hyper_tried = 0usize;
    let mut hyper_accepted = 0usize;

    for chain in 0..args.chains {
        let draws = run_chain(model, args, chain);
        info!(
            "chain {}/{}: latent acceptance {:.2}, hyper acceptance {:.2}",
            chain + 1,
            args.chains,
            draws.latent_accepted as f64 / draws.latent_tried.max(1) as f64,
            draws.hyper_accepted as f64 / draws.hyper_tried.max(1) as f64,
        );
        minority.extend(draws.minority);
        majority.extend(draws.majority);
        expected.extend(draws.expected);
        alpha.extend(draws.alpha);
        beta.extend(draws.beta);
        latent_tried += draws.latent_tried;
        latent_accepted += draws.latent_accepted;
        hyper_tried += draws.hyper_tried;
        hyper_accepted += draws.hyper_accepted;
    }

    let minority = Array2::from_shape_vec((total, n), minority)
        .map_err(|e| Error::BadShape(e.to_string()))?;
    let majority = Array2::from_shape_vec((total, n), majority)
        .map_err(|e| Error::BadShape(e.to_string()))?;
    let expected = Array2::from_shape_vec((total, n), expected)
        .map_err(|e| Error::BadShape(e.to_string()))?;
    let alpha =
        Array2::from_shape_vec((total, 2), alpha).map_err(|e| Error::BadShape(e.to_string()))?;
    let beta =
        Array2::from_shape_vec((total, 2), beta).map_err(|e| Error::BadShape(e.to_string()))?;

    let mut max_rhat = f64::NAN;
    for draws in [&minority, &majority, &alpha, &beta] {
        for col in draws.columns() {
            let rhat = split_rhat(col.to_vec(), args.chains, args.draws);
            if max_rhat.is_nan() || rhat > max_rhat {
                max_rhat = rhat;
            }
        }
    }
    if max_rhat > RHAT_WARN {
        warn!("max split-R̂ = {max_rhat:.3}; chains may not have converged, consider more draws or warmup");
    }

    Ok(Trace {
        minority_rate: minority,
        majority_rate: majority,
        expected_dem_share: expected,
        alpha,
        beta,
        diagnostics: Diagnostics {
            chains: args.chains,
            draws_per_chain: args.draws,
            accept_latent: latent_accepted as f64 / latent_tried.max(1) as f64,
            accept_hyper: hyper_accepted as f64 / hyper_tried.max(1) as f64,
            max_rhat,
        },
    })
}

fn run_chain(model: &EiModel, args: &EiModelArgs, chain: usize) -> ChainDraws {
    let n = model.n_precincts();
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(chain as u64));
    let mut state = ChainState::init(n, &mut rng);

    let mut latent_scales: [Vec<AdaptiveScale>; 2] = [
        (0..n).map(|_| AdaptiveScale::new(0.5)).collect(),
        (0..n).map(|_| AdaptiveScale::new(0.5)).collect(),
    ];
    // alpha then beta, per group.
    let mut hyper_scales: Vec<AdaptiveScale> =
        (0..4).map(|_| AdaptiveScale::new(0.2)).collect();

    let mut out = ChainDraws {
        minority: Vec::with_capacity(args.draws * n),
        majority: Vec::with_capacity(args.draws * n),
        expected: Vec::with_capacity(args.draws * n),
        alpha: Vec::with_capacity(args.draws * 2),
        beta: Vec::with_capacity(args.draws * 2),
        latent_tried: 0,
        latent_accepted: 0,
        hyper_tried: 0,
        hyper_accepted: 0,
    };

    for iter in 0..(args.warmup + args.draws) {
        let adapting = iter < args.warmup;

        for g in [MINORITY, MAJORITY] {
            let alpha_g = state.ln_alpha[g].exp();
            let beta_g = state.ln_beta_param[g].exp();
            for i in 0..n {
                let scale = &mut latent_scales[g][i];
                let theta = state.theta[g][i];
                let proposal = theta + scale.step() * rng.sample::<f64, _>(StandardNormal);
                let ln_rate_new = ln_inv_logit(proposal);
                let ln_comp_new = ln_inv_logit(-proposal);
                let rate_new = inv_logit(proposal);

                // ln B(alpha, beta) cancels within the group.
                let mut delta = alpha_g * (ln_rate_new - state.ln_rate[g][i])
                    + beta_g * (ln_comp_new - state.ln_rate_comp[g][i]);
                let (b_min_new, b_maj_new) = if g == MINORITY {
                    (rate_new, state.rate[MAJORITY][i])
                } else {
                    (state.rate[MINORITY][i], rate_new)
                };
                delta += model.ln_likelihood(i, b_min_new, b_maj_new)
                    - model.ln_likelihood(i, state.rate[MINORITY][i], state.rate[MAJORITY][i]);

                let accepted = delta >= 0.0 || rng.gen::<f64>().ln() < delta;
                if accepted {
                    state.set_theta(g, i, proposal);
                }
                scale.record(accepted, adapting);
                if !adapting {
                    out.latent_tried += 1;
                    if accepted {
                        out.latent_accepted += 1;
                    }
                }
            }
        }

        for g in [MINORITY, MAJORITY] {
            let sum_ln_rate: f64 = state.ln_rate[g].iter().sum();
            let sum_ln_comp: f64 = state.ln_rate_comp[g].iter().sum();

            // alpha update.
            {
                let scale = &mut hyper_scales[g];
                let ln_alpha = state.ln_alpha[g];
                let proposal = ln_alpha + scale.step() * rng.sample::<f64, _>(StandardNormal);
                let (alpha_old, alpha_new) = (ln_alpha.exp(), proposal.exp());
                let beta_g = state.ln_beta_param[g].exp();
                let delta = (alpha_new - alpha_old) * sum_ln_rate
                    - n as f64 * (ln_beta(alpha_new, beta_g) - ln_beta(alpha_old, beta_g))
                    + ln_exp_prior_log(proposal, args.lam)
                    - ln_exp_prior_log(ln_alpha, args.lam);
                let accepted = delta >= 0.0 || rng.gen::<f64>().ln() < delta;
                if accepted {
                    state.ln_alpha[g] = proposal;
                }
                scale.record(accepted, adapting);
                if !adapting {
                    out.hyper_tried += 1;
                    if accepted {
                        out.hyper_accepted += 1;
                    }
                }
            }

            // beta update.
            {
                let scale = &mut hyper_scales[2 + g];
                let ln_beta_old = state.ln_beta_param[g];
                let proposal = ln_beta_old + scale.step() * rng.sample::<f64, _>(StandardNormal);
                let (beta_old, beta_new) = (ln_beta_old.exp(), proposal.exp());
                let alpha_g = state.ln_alpha[g].exp();
                let delta = (beta_new - beta_old) * sum_ln_comp
                    - n as f64 * (ln_beta(alpha_g, beta_new) - ln_beta(alpha_g, beta_old))
                    + ln_exp_prior_log(proposal, args.lam)
                    - ln_exp_prior_log(ln_beta_old, args.lam);
                let accepted = delta >= 0.0 || rng.gen::<f64>().ln() < delta;
                if accepted {
                    state.ln_beta_param[g] = proposal;
                }
                scale.record(accepted, adapting);
                if !adapting {
                    out.hyper_tried += 1;
                    if accepted {
                        out.hyper_accepted += 1;
                    }
                }
            }
        }

        if !adapting {
            for i in 0..n {
                let b_min = state.rate[MINORITY][i];
                let b_maj = state.rate[MAJORITY][i];
                out.minority.push(b_min);
                out.majority.push(b_maj);
                out.expected.push(model.expected_dem_share(i, b_min, b_maj));
            }
            out.alpha.push(state.ln_alpha[MINORITY].exp());
            out.alpha.push(state.ln_alpha[MAJORITY].exp());
            out.beta.push(state.ln_beta_param[MINORITY].exp());
            out.beta.push(state.ln_beta_param[MAJORITY].exp());
        }
    }

    out
}

/// Split-R̂ over one monitored column, laid out chain-major.
fn split_rhat(values: Vec<f64>, chains: usize, draws_per_chain: usize) -> f64 {
    let half = draws_per_chain / 2;
    if half < 2 {
        return f64::NAN;
    }
    let mut means = Vec::with_capacity(chains * 2);
    let mut vars = Vec::with_capacity(chains * 2);
    for c in 0..chains {
        for h in 0..2 {
            let start = c * draws_per_chain + h * half;
            let seg = &values[start..start + half];
            let mean = seg.iter().sum::<f64>() / half as f64;
            let var = seg.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (half - 1) as f64;
            means.push(mean);
            vars.push(var);
        }
    }
    let m = means.len() as f64;
    let l = half as f64;
    let grand = means.iter().sum::<f64>() / m;
    let between = l / (m - 1.0) * means.iter().map(|v| (v - grand).powi(2)).sum::<f64>();
    let within = vars.iter().sum::<f64>() / m;
    if within <= 0.0 {
        // All segments constant; treat as converged.
        return 1.0;
    }
    let var_plus = (l - 1.0) / l * within + between / l;
    (var_plus / within).sqrt()
}

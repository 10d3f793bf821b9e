//! Convergence diagnostics for a multi-chain run.
//!
//! - Split R-hat, plain and rank-normalized with folding
//! - Bulk and tail effective sample size (Geyer initial monotone sequence)
//! - E-BFMI per chain
//!
//! The numbers are advisory. [`ConvergenceThresholds::check`] turns them into
//! a [`ConvergenceReport`] with warnings, it never fails a run.

use std::fmt;

use log::warn;
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

use crate::{
    math::{mean_and_variance, quantile_sorted},
    sampler::Trace,
};

/// Split R-hat for one parameter.
///
/// Every chain is split in half and the halves are truncated to a common
/// length. Returns NaN for chains shorter than four draws or a constant
/// parameter.
pub fn split_r_hat(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_chains(chains, 2) else {
        return f64::NAN;
    };

    let m = halves.len() as f64;
    let n = halves[0].len() as f64;
    let (means, vars): (Vec<f64>, Vec<f64>) =
        halves.iter().map(|half| mean_and_variance(half)).unzip();
    let grand_mean = means.iter().sum::<f64>() / m;

    let between = means.iter().map(|&mu| (mu - grand_mean).powi(2)).sum::<f64>() * n / (m - 1.);
    let within = vars.iter().sum::<f64>() / m;
    if within < 1e-30 {
        return f64::NAN;
    }

    let var_hat_plus = (n - 1.) / n * within + between / n;
    (var_hat_plus / within).sqrt()
}

/// Rank-normalized split R-hat, the larger of the bulk and the folded value.
pub fn r_hat(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() || chains.iter().any(|chain| chain.len() < 4) {
        return f64::NAN;
    }
    let bulk = split_r_hat(&as_slices(&rank_normalize(chains)));

    let median = pooled_quantile(chains, 0.5);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|chain| chain.iter().map(|&x| (x - median).abs()).collect())
        .collect();
    let folded = split_r_hat(&as_slices(&rank_normalize(&as_slices(&folded))));

    bulk.max(folded)
}

/// Bulk effective sample size on rank-normalized draws.
pub fn ess_bulk(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() {
        return 0.;
    }
    ess(&as_slices(&rank_normalize(chains)))
}

/// Tail effective sample size, the smaller ESS of the 5% and 95% quantile indicators.
pub fn ess_tail(chains: &[&[f64]]) -> f64 {
    if chains.is_empty() {
        return 0.;
    }
    let q05 = pooled_quantile(chains, 0.05);
    let q95 = pooled_quantile(chains, 0.95);
    let indicator = |hit: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|&x| if hit(x) { 1. } else { 0. })
                    .collect()
            })
            .collect()
    };
    let lower = indicator(&|x| x <= q05);
    let upper = indicator(&|x| x >= q95);
    ess(&as_slices(&lower)).min(ess(&as_slices(&upper)))
}

/// Effective sample size of the raw draws.
///
/// Autocorrelations come from the variogram across split chains. The sum of
/// autocorrelation pairs is truncated at the first negative pair and made
/// monotone before it enters the integrated autocorrelation time.
pub fn ess(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_chains(chains, 4) else {
        return 0.;
    };

    let m = halves.len() as f64;
    let n = halves[0].len();
    let total_draws = m * n as f64;

    let (means, vars): (Vec<f64>, Vec<f64>) =
        halves.iter().map(|half| mean_and_variance(half)).unzip();
    let grand_mean = means.iter().sum::<f64>() / m;
    let spread = means.iter().map(|&mu| (mu - grand_mean).powi(2)).sum::<f64>();
    let between = spread * n as f64 / (m - 1.).max(1.);
    let within = vars.iter().sum::<f64>() / m;
    let var_hat_plus = (n as f64 - 1.) / n as f64 * within + between / n as f64;

    if !var_hat_plus.is_finite() || var_hat_plus < 1e-30 {
        return total_draws;
    }

    let mut rho = Vec::with_capacity(n);
    for lag in 1..n {
        let variogram = halves
            .iter()
            .flat_map(|half| half.windows(lag + 1).map(|w| (w[0] - w[lag]).powi(2)))
            .sum::<f64>()
            / (m * (n - lag) as f64);
        rho.push((1. - variogram / (2. * var_hat_plus)).clamp(-1., 1.));
        if rho.len() % 2 == 0 && rho[rho.len() - 2] + rho[rho.len() - 1] < 0. {
            break;
        }
    }

    let mut pairs: Vec<f64> = rho
        .chunks_exact(2)
        .map(|pair| pair[0] + pair[1])
        .take_while(|&sum| sum >= 0.)
        .collect();
    for k in 1..pairs.len() {
        pairs[k] = pairs[k].min(pairs[k - 1]);
    }

    let tau = 1. + 2. * pairs.iter().sum::<f64>();
    if !tau.is_finite() || tau <= 0. {
        return total_draws;
    }
    (total_draws / tau).clamp(1., total_draws)
}

/// Energy Bayesian fraction of missing information of one chain.
pub fn ebfmi(energies: &[f64]) -> f64 {
    let n = energies.len();
    if n < 4 {
        return f64::NAN;
    }
    let (_, var) = mean_and_variance(energies);
    if var < 1e-30 {
        return f64::NAN;
    }
    let msd = energies
        .windows(2)
        .map(|w| (w[1] - w[0]).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    msd / var
}

fn split_chains<'a>(chains: &[&'a [f64]], min_len: usize) -> Option<Vec<&'a [f64]>> {
    if chains.is_empty() || chains.iter().any(|chain| chain.len() < 4) {
        return None;
    }
    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| {
            let (first, second) = chain.split_at(chain.len() / 2);
            [first, second]
        })
        .collect();
    let len = halves.iter().map(|half| half.len()).min()?;
    if len < min_len {
        return None;
    }
    Some(halves.into_iter().map(|half| &half[..len]).collect())
}

fn as_slices(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains.iter().map(|chain| chain.as_slice()).collect()
}

fn pooled_quantile(chains: &[&[f64]], q: f64) -> f64 {
    let mut all: Vec<f64> = chains.iter().flat_map(|chain| chain.iter().copied()).collect();
    all.sort_by(f64::total_cmp);
    quantile_sorted(&all, q)
}

/// Replace every draw by the normal quantile of its pooled rank.
///
/// Ties share their average rank.
fn rank_normalize(chains: &[&[f64]]) -> Vec<Vec<f64>> {
    let mut out: Vec<Vec<f64>> = chains.iter().map(|chain| vec![0.; chain.len()]).collect();
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(i, &x)| (x, c, i)))
        .collect();
    if flat.is_empty() {
        return out;
    }
    flat.sort_by(|a, b| a.0.total_cmp(&b.0));

    let Ok(normal) = Normal::new(0., 1.) else {
        return out;
    };
    let n = flat.len();
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && flat[end].0 == flat[start].0 {
            end += 1;
        }
        let rank = 0.5 * ((start + 1) as f64 + end as f64);
        let p = ((rank - 0.375) / (n as f64 + 0.25)).clamp(1e-12, 1. - 1e-12);
        let z = normal.inverse_cdf(p);
        for &(_, c, i) in &flat[start..end] {
            out[c][i] = z;
        }
        start = end;
    }
    out
}

/// Posterior summary of one coordinate over all post-warmup draws.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q2_5: f64,
    pub median: f64,
    pub q97_5: f64,
    pub r_hat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
}

/// Diagnostics of a whole trace.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub parameters: Vec<ParameterSummary>,
    pub num_draws: usize,
    pub num_divergences: usize,
    /// Fraction of post-warmup draws that diverged.
    pub divergence_rate: f64,
    /// Fraction of post-warmup draws that hit the maximum tree depth.
    pub max_treedepth_rate: f64,
    /// E-BFMI of every successful chain, in chain order.
    pub ebfmi: Vec<f64>,
}

impl Diagnostics {
    pub fn new(trace: &Trace) -> Self {
        let parameters = summarize(trace);
        let num_draws = trace.draws().count();
        let num_divergences = trace.num_divergences();
        let num_maxdepth = trace.draws().filter(|draw| draw.maxdepth_reached).count();
        let rate = |count: usize| {
            if num_draws == 0 {
                0.
            } else {
                count as f64 / num_draws as f64
            }
        };
        let ebfmi = trace
            .chains
            .iter()
            .map(|chain| {
                let energies: Vec<f64> = chain.draws.iter().map(|draw| draw.energy).collect();
                ebfmi(&energies)
            })
            .collect();

        Self {
            parameters,
            num_draws,
            num_divergences,
            divergence_rate: rate(num_divergences),
            max_treedepth_rate: rate(num_maxdepth),
            ebfmi,
        }
    }

    pub fn max_r_hat(&self) -> f64 {
        self.parameters
            .iter()
            .map(|param| param.r_hat)
            .filter(|v| v.is_finite())
            .fold(f64::NAN, f64::max)
    }

    pub fn min_ess_bulk(&self) -> f64 {
        self.parameters
            .iter()
            .map(|param| param.ess_bulk)
            .fold(f64::NAN, f64::min)
    }
}

/// Summaries of every coordinate of `trace`, in layout order.
pub fn summarize(trace: &Trace) -> Vec<ParameterSummary> {
    trace
        .parameter_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let series = trace.parameter_series(index);
            let chains = as_slices(&series);
            let mut pooled: Vec<f64> = series.iter().flatten().copied().collect();
            let (mean, var) = if pooled.is_empty() {
                (f64::NAN, f64::NAN)
            } else {
                mean_and_variance(&pooled)
            };
            pooled.sort_by(f64::total_cmp);
            ParameterSummary {
                name: name.clone(),
                mean,
                sd: var.sqrt(),
                q2_5: quantile_sorted(&pooled, 0.025),
                median: quantile_sorted(&pooled, 0.5),
                q97_5: quantile_sorted(&pooled, 0.975),
                r_hat: r_hat(&chains),
                ess_bulk: ess_bulk(&chains),
                ess_tail: ess_tail(&chains),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Ok,
    Warn,
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceStatus::Ok => write!(f, "ok"),
            ConvergenceStatus::Warn => write!(f, "warn"),
        }
    }
}

/// A diagnostic outside its healthy range.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvergenceWarning {
    #[error("R-hat of {parameter} is {value:.3}")]
    RHat { parameter: String, value: f64 },
    #[error("Bulk ESS of {parameter} is {value:.0}")]
    LowEssBulk { parameter: String, value: f64 },
    #[error("Tail ESS of {parameter} is {value:.0}")]
    LowEssTail { parameter: String, value: f64 },
    #[error("{count} divergences after warmup ({rate:.3} of draws)")]
    Divergences { count: usize, rate: f64 },
    #[error("{rate:.3} of draws reached the maximum tree depth")]
    MaxTreeDepth { rate: f64 },
    #[error("E-BFMI of chain {chain} is {value:.3}")]
    LowEbfmi { chain: u64, value: f64 },
    #[error("Chains {0:?} failed")]
    FailedChains(Vec<u64>),
    #[error("Chains {0:?} stopped before all draws were made")]
    IncompleteChains(Vec<u64>),
}

/// Healthy ranges of the diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceThresholds {
    pub max_r_hat: f64,
    /// Minimum bulk and tail ESS per successful chain.
    pub min_ess_per_chain: f64,
    pub max_divergence_rate: f64,
    pub max_treedepth_rate: f64,
    pub min_ebfmi: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            max_r_hat: 1.01,
            min_ess_per_chain: 100.,
            max_divergence_rate: 0.,
            max_treedepth_rate: 0.05,
            min_ebfmi: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    pub status: ConvergenceStatus,
    pub warnings: Vec<ConvergenceWarning>,
    pub succeeded_chains: Vec<u64>,
    pub failed_chains: Vec<u64>,
    pub diagnostics: Diagnostics,
}

impl ConvergenceThresholds {
    /// Compute diagnostics for `trace` and compare them to the thresholds.
    pub fn check(&self, trace: &Trace) -> ConvergenceReport {
        let diagnostics = Diagnostics::new(trace);
        let mut warnings = Vec::new();

        let failed_chains = trace.failed_chains();
        if !failed_chains.is_empty() {
            warnings.push(ConvergenceWarning::FailedChains(failed_chains.clone()));
        }
        let incomplete: Vec<u64> = trace
            .chains
            .iter()
            .filter(|chain| !chain.is_complete())
            .map(|chain| chain.chain)
            .collect();
        if !incomplete.is_empty() {
            warnings.push(ConvergenceWarning::IncompleteChains(incomplete));
        }

        let min_ess = self.min_ess_per_chain * trace.chains.len() as f64;
        for param in diagnostics.parameters.iter() {
            if param.r_hat > self.max_r_hat {
                warnings.push(ConvergenceWarning::RHat {
                    parameter: param.name.clone(),
                    value: param.r_hat,
                });
            }
            if param.ess_bulk < min_ess {
                warnings.push(ConvergenceWarning::LowEssBulk {
                    parameter: param.name.clone(),
                    value: param.ess_bulk,
                });
            }
            if param.ess_tail < min_ess {
                warnings.push(ConvergenceWarning::LowEssTail {
                    parameter: param.name.clone(),
                    value: param.ess_tail,
                });
            }
        }

        if diagnostics.num_divergences > 0
            && diagnostics.divergence_rate > self.max_divergence_rate
        {
            warnings.push(ConvergenceWarning::Divergences {
                count: diagnostics.num_divergences,
                rate: diagnostics.divergence_rate,
            });
        }
        if diagnostics.max_treedepth_rate > self.max_treedepth_rate {
            warnings.push(ConvergenceWarning::MaxTreeDepth {
                rate: diagnostics.max_treedepth_rate,
            });
        }
        for (chain, &value) in trace.chains.iter().zip(diagnostics.ebfmi.iter()) {
            if value < self.min_ebfmi {
                warnings.push(ConvergenceWarning::LowEbfmi {
                    chain: chain.chain,
                    value,
                });
            }
        }

        for warning in warnings.iter() {
            warn!("{}", warning);
        }

        ConvergenceReport {
            status: if warnings.is_empty() {
                ConvergenceStatus::Ok
            } else {
                ConvergenceStatus::Warn
            },
            warnings,
            succeeded_chains: trace.succeeded_chains(),
            failed_chains,
            diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{ChainOutput, ChainStatus, Draw},
        sampler::ChainFailure,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal as NormalDist};
    use std::time::Duration;

    fn iid(seed: u64, n: usize, mean: f64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = NormalDist::new(mean, 1.).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    fn random_walk(seed: u64, n: usize) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = NormalDist::new(0., 0.01).unwrap();
        let mut x = 0.;
        (0..n)
            .map(|_| {
                x += normal.sample(&mut rng);
                x
            })
            .collect()
    }

    #[test]
    fn r_hat_well_mixed() {
        let a = iid(1, 500, 0.);
        let b = iid(2, 500, 0.);
        assert!(split_r_hat(&[&a, &b]) < 1.05);
        assert!(r_hat(&[&a, &b]) < 1.05);
    }

    #[test]
    fn r_hat_diverged_chains() {
        let a: Vec<f64> = (0..200).map(|i| i as f64 * 0.01).collect();
        let b: Vec<f64> = (0..200).map(|i| 10. + i as f64 * 0.01).collect();
        assert!(split_r_hat(&[&a, &b]) > 1.5);
        assert!(r_hat(&[&a, &b]) > 1.5);
    }

    #[test]
    fn short_chains_have_no_r_hat() {
        assert!(split_r_hat(&[&[1., 2., 3.]]).is_nan());
        assert!(r_hat(&[]).is_nan());
    }

    #[test]
    fn ess_iid_vs_random_walk() {
        let chain = iid(42, 1000, 0.);
        assert!(ess(&[&chain]) > 500.);
        assert!(ess_bulk(&[&chain]) > 500.);
        assert!(ess_tail(&[&chain]) > 500.);

        let walk = random_walk(42, 1000);
        assert!(ess(&[&walk]) < 500.);
        assert!(ess_tail(&[&walk]) < 500.);
    }

    #[test]
    fn ess_of_constant_chain() {
        let chain = vec![1.; 100];
        assert_relative_eq!(ess(&[&chain]), 100.);
    }

    #[test]
    fn ebfmi_iid_energy() {
        let energies = iid(123, 1000, 10.);
        let value = ebfmi(&energies);
        assert!(value > 1.5 && value < 2.5, "{}", value);
        assert!(ebfmi(&[1., 2.]).is_nan());
    }

    #[test]
    fn rank_normalization_preserves_order() {
        let z = rank_normalize(&[&[3., 1., 2.], &[2., 5.]]);
        assert!(z[0][1] < z[0][2]);
        assert!(z[0][2] < z[0][0]);
        assert_eq!(z[0][2], z[1][0]);
        assert!(z[1][1] > z[0][0]);
    }

    fn draw(x: f64, energy: f64, diverging: bool) -> Draw {
        Draw {
            position: vec![x].into(),
            logp: 0.,
            depth: 2,
            n_steps: 3,
            diverging,
            maxdepth_reached: false,
            accept_stat: 0.8,
            energy,
            energy_error: 0.,
            step_size: 0.5,
            tuning: false,
            index_in_trajectory: 1,
        }
    }

    fn chain_output(chain: u64, xs: &[f64], energies: &[f64]) -> ChainOutput {
        ChainOutput {
            chain,
            status: ChainStatus::Complete,
            warmup: vec![],
            draws: xs
                .iter()
                .zip(energies)
                .map(|(&x, &e)| draw(x, e, false))
                .collect(),
            step_size: 0.5,
            mass_matrix_diag: vec![1.].into(),
            runtime: Duration::ZERO,
        }
    }

    #[test]
    fn healthy_trace_passes() {
        let chains = (0..4)
            .map(|c| chain_output(c, &iid(c, 1000, 0.), &iid(c + 10, 1000, 5.)))
            .collect();
        let trace = Trace {
            chains,
            failures: vec![],
            parameter_names: vec!["x".to_string()],
        };
        let report = ConvergenceThresholds::default().check(&trace);
        assert_eq!(report.status, ConvergenceStatus::Ok, "{:?}", report.warnings);
        assert_eq!(report.succeeded_chains, vec![0, 1, 2, 3]);
        let summary = &report.diagnostics.parameters[0];
        assert_eq!(summary.name, "x");
        assert!(summary.mean.abs() < 0.1);
        assert!((summary.sd - 1.).abs() < 0.1);
        assert!(summary.q2_5 < summary.median && summary.median < summary.q97_5);
    }

    #[test]
    fn unhealthy_trace_warns() {
        let stuck: Vec<f64> = (0..200).map(|i| 10. + i as f64 * 0.01).collect();
        let mut bad = chain_output(1, &stuck, &iid(3, 200, 5.));
        bad.draws[7].diverging = true;
        let trace = Trace {
            chains: vec![chain_output(0, &iid(1, 200, 0.), &iid(2, 200, 5.)), bad],
            failures: vec![ChainFailure {
                chain: 2,
                message: "boom".to_string(),
            }],
            parameter_names: vec!["x".to_string()],
        };
        let report = ConvergenceThresholds::default().check(&trace);
        assert_eq!(report.status, ConvergenceStatus::Warn);
        assert_eq!(report.failed_chains, vec![2]);
        assert!(report
            .warnings
            .contains(&ConvergenceWarning::FailedChains(vec![2])));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, ConvergenceWarning::RHat { .. })));
        assert!(report.warnings.contains(&ConvergenceWarning::Divergences {
            count: 1,
            rate: 1. / 400.
        }));
    }
}

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::AtomicBool, mpsc::channel, Arc},
    time::Instant,
};
use thiserror::Error;

use crate::{
    adapt_strategy::AdaptOptions,
    chain::{AbortPolicy, Chain, ChainOutput, ChainRunner, Draw, NutsChain},
    mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrixKind},
    model::CpuLogpFunc,
    nuts::NutsError,
};

/// Settings for the NUTS sampler
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    pub num_chains: usize,
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// Seed of the run. Chain `i` uses stream `i` of this seed.
    pub seed: u64,
    /// Explicit seed per chain, overriding `seed`.
    pub chain_seeds: Option<Vec<u64>>,
    /// Half-width of the uniform perturbation of random initial points.
    pub init_jitter: f64,
    /// Start every chain here instead of at a random point.
    pub init_position: Option<Vec<f64>>,
    /// Settings for step size and mass matrix adaptation.
    pub adapt_options: AdaptOptions,
    pub mass_matrix: MassMatrixKind,
    /// Worker threads. Zero means one per chain.
    pub num_threads: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            seed: 0,
            chain_seeds: None,
            init_jitter: 2.,
            init_position: None,
            adapt_options: AdaptOptions::default(),
            mass_matrix: MassMatrixKind::default(),
            num_threads: 0,
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("At least one chain is required")]
    NoChains,
    #[error("The number of warmup iterations must be positive")]
    NoWarmup,
    #[error("The number of draws must be positive")]
    NoDraws,
    #[error("Target acceptance rate {0} is not in (0, 1)")]
    TargetAccept(f64),
    #[error("Initial step size {0} must be positive and finite")]
    InitialStep(f64),
    #[error("The maximum tree depth must be positive")]
    MaxDepth,
    #[error("Maximum energy error {0} must be positive")]
    MaxEnergyError(f64),
    #[error("Initial jitter {0} must be finite and non-negative")]
    InitJitter(f64),
    #[error("Got {found} chain seeds for {expected} chains")]
    ChainSeeds { expected: usize, found: usize },
    #[error("Initial position has {found} coordinates, the model has {expected}")]
    InitDimension { expected: usize, found: usize },
}

impl SamplerSettings {
    /// Check the settings against a model of dimension `dim`.
    pub fn validate(&self, dim: usize) -> Result<(), SettingsError> {
        if self.num_chains == 0 {
            return Err(SettingsError::NoChains);
        }
        if self.num_tune == 0 {
            return Err(SettingsError::NoWarmup);
        }
        if self.num_draws == 0 {
            return Err(SettingsError::NoDraws);
        }
        let target = self.adapt_options.dual_average.target_accept;
        if !(target > 0. && target < 1.) {
            return Err(SettingsError::TargetAccept(target));
        }
        let step = self.adapt_options.dual_average.initial_step;
        if !(step > 0. && step.is_finite()) {
            return Err(SettingsError::InitialStep(step));
        }
        if self.maxdepth == 0 {
            return Err(SettingsError::MaxDepth);
        }
        if !(self.max_energy_error > 0.) {
            return Err(SettingsError::MaxEnergyError(self.max_energy_error));
        }
        if !(self.init_jitter >= 0. && self.init_jitter.is_finite()) {
            return Err(SettingsError::InitJitter(self.init_jitter));
        }
        if let Some(seeds) = &self.chain_seeds {
            if seeds.len() != self.num_chains {
                return Err(SettingsError::ChainSeeds {
                    expected: self.num_chains,
                    found: seeds.len(),
                });
            }
        }
        if let Some(position) = &self.init_position {
            check_init_position(position, dim)?;
        }
        Ok(())
    }

    /// The random stream of chain `chain`.
    pub fn chain_rng(&self, chain: u64) -> ChaCha8Rng {
        if let Some(&seed) = self
            .chain_seeds
            .as_ref()
            .and_then(|seeds| seeds.get(chain as usize))
        {
            return ChaCha8Rng::seed_from_u64(seed);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(chain);
        rng
    }

    fn thread_count(&self) -> usize {
        if self.num_threads == 0 {
            self.num_chains
        } else {
            self.num_threads.min(self.num_chains)
        }
    }
}

pub(crate) fn check_init_position(position: &[f64], dim: usize) -> Result<(), SettingsError> {
    if position.len() != dim {
        return Err(SettingsError::InitDimension {
            expected: dim,
            found: position.len(),
        });
    }
    Ok(())
}

/// Caller-side control over a running sampler.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    /// Chains stop at their next iteration boundary once this is set.
    pub abort: Option<Arc<AtomicBool>>,
    /// Wall-clock budget shared by all chains.
    pub deadline: Option<Instant>,
    pub policy: AbortPolicy,
}

/// A chain that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    pub chain: u64,
    pub message: String,
}

/// The pooled output of all chains.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Successful chains, ordered by chain id.
    pub chains: Vec<ChainOutput>,
    pub failures: Vec<ChainFailure>,
    pub parameter_names: Vec<String>,
}

impl Trace {
    pub fn succeeded_chains(&self) -> Vec<u64> {
        self.chains.iter().map(|chain| chain.chain).collect()
    }

    pub fn failed_chains(&self) -> Vec<u64> {
        self.failures.iter().map(|failure| failure.chain).collect()
    }

    pub fn dim(&self) -> usize {
        self.parameter_names.len()
    }

    /// Post-warmup draws of every chain.
    pub fn draws(&self) -> impl Iterator<Item = &Draw> + '_ {
        self.chains.iter().flat_map(|chain| chain.draws.iter())
    }

    pub fn draws_without_divergences(&self) -> impl Iterator<Item = &Draw> + '_ {
        self.draws().filter(|draw| !draw.diverging)
    }

    pub fn num_divergences(&self) -> usize {
        self.chains.iter().map(|chain| chain.num_divergences()).sum()
    }

    /// The post-warmup values of coordinate `index`, one series per chain.
    pub fn parameter_series(&self, index: usize) -> Vec<Vec<f64>> {
        self.chains
            .iter()
            .map(|chain| chain.draws.iter().map(|draw| draw.position[index]).collect())
            .collect()
    }
}

/// Run all chains of `settings` in parallel.
pub fn sample<F>(model: &F, settings: &SamplerSettings) -> Result<Trace>
where
    F: CpuLogpFunc + Clone + Send + Sync,
{
    sample_with_control(model, settings, RunControl::default())
}

/// Run all chains of `settings` in parallel, each on its own copy of `model`.
///
/// Chains never share mutable state. A chain that fails or panics is
/// reported in [`Trace::failures`] and does not affect the others.
pub fn sample_with_control<F>(
    model: &F,
    settings: &SamplerSettings,
    control: RunControl,
) -> Result<Trace>
where
    F: CpuLogpFunc + Clone + Send + Sync,
{
    settings
        .validate(model.dim())
        .context("Invalid sampler settings")?;

    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.thread_count())
        .thread_name(|i| format!("nuts-forecast-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let start_time = Instant::now();
    let (results_tx, results_rx) = channel();

    pool.scope_fifo(|scope| {
        for chain_id in 0..settings.num_chains as u64 {
            let results = results_tx.clone();
            let mut runner = ChainRunner::new(model.clone(), settings, chain_id)
                .with_policy(control.policy);
            if let Some(flag) = &control.abort {
                runner = runner.with_abort_flag(flag.clone());
            }
            if let Some(deadline) = control.deadline {
                runner = runner.with_deadline(deadline);
            }

            scope.spawn_fifo(move |_| {
                debug!("starting chain {}", chain_id);
                let result = match catch_unwind(AssertUnwindSafe(move || runner.run())) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(ChainFailure {
                        chain: chain_id,
                        message: format!("{:#}", err),
                    }),
                    Err(payload) => Err(ChainFailure {
                        chain: chain_id,
                        message: panic_message(payload.as_ref()),
                    }),
                };
                // The receiver lives until every worker is done
                let _ = results.send(result);
            });
        }
    });
    drop(results_tx);

    let (mut chains, mut failures): (Vec<_>, Vec<_>) = results_rx.into_iter().partition_result();
    chains.sort_unstable_by_key(|chain: &ChainOutput| chain.chain);
    failures.sort_unstable_by_key(|failure: &ChainFailure| failure.chain);

    for failure in failures.iter() {
        warn!("chain {} failed: {}", failure.chain, failure.message);
    }
    info!(
        "sampled {} of {} chains in {:?}",
        chains.len(),
        settings.num_chains,
        start_time.elapsed()
    );

    Ok(Trace {
        chains,
        failures,
        parameter_names: model.parameter_names(),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("Chain panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("Chain panicked: {}", msg)
    } else {
        "Chain panicked".to_string()
    }
}

/// Sample a single chain from `start` on the calling thread.
///
/// The first `settings.num_tune` draws of the iterator are warmup draws.
pub fn sample_sequentially<F: CpuLogpFunc + 'static>(
    model: F,
    settings: &SamplerSettings,
    start: &[f64],
    draws: u64,
    chain: u64,
) -> Result<impl Iterator<Item = Result<Draw, NutsError>>> {
    settings
        .validate(model.dim())
        .context("Invalid sampler settings")?;
    check_init_position(start, model.dim())
        .context("Invalid start point")?;
    let rng = settings.chain_rng(chain);
    let mut sampler: Box<dyn Chain> = match settings.mass_matrix {
        MassMatrixKind::Diag => Box::new(NutsChain::<F, DiagMassMatrix, _>::new(
            model, settings, chain, rng,
        )),
        MassMatrixKind::Dense => Box::new(NutsChain::<F, DenseMassMatrix, _>::new(
            model, settings, chain, rng,
        )),
    };
    sampler
        .set_position(start)
        .context("Could not initialize chain")?;
    Ok((0..draws).map(move |_| sampler.draw()))
}

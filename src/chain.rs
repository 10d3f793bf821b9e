use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::{
    adapt_strategy::{CombinedCollector, WindowedAdaptation},
    hamiltonian::{EuclideanHamiltonian, Hamiltonian},
    mass_matrix::{DenseMassMatrix, DiagMassMatrix, DrawCollector, MassMatrix, MassMatrixKind},
    model::CpuLogpFunc,
    nuts::{draw, NutsError, NutsOptions},
    sampler::{check_init_position, SamplerSettings},
    state::{State, StatePool},
    stepsize::AcceptanceRateCollector,
};

/// Attempts at finding an initial point with a finite log density.
const INIT_ATTEMPTS: usize = 100;

/// One iteration of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub position: Box<[f64]>,
    /// Unnormalized log posterior at `position`.
    pub logp: f64,
    /// Depth of the trajectory tree.
    pub depth: u64,
    /// Number of leapfrog steps in the trajectory.
    pub n_steps: u64,
    pub diverging: bool,
    pub maxdepth_reached: bool,
    /// Mean acceptance probability over the trajectory.
    pub accept_stat: f64,
    /// Hamiltonian at the draw.
    pub energy: f64,
    /// Hamiltonian at the draw minus the Hamiltonian at the start of the trajectory.
    pub energy_error: f64,
    /// Step size used to build the trajectory.
    pub step_size: f64,
    /// Whether this draw is part of warmup.
    pub tuning: bool,
    pub index_in_trajectory: i64,
}

/// A single Markov chain that can be advanced one draw at a time.
pub trait Chain {
    /// Initialize the chain at `position` and search for an initial step size.
    fn set_position(&mut self, position: &[f64]) -> std::result::Result<(), NutsError>;

    /// Make one NUTS iteration and adapt if still in warmup.
    fn draw(&mut self) -> std::result::Result<Draw, NutsError>;

    fn dim(&self) -> usize;

    fn step_size(&self) -> f64;

    /// Diagonal of the current inverse mass matrix.
    fn mass_matrix_diag(&self) -> Box<[f64]>;
}

pub(crate) struct NutsChain<F: CpuLogpFunc, M: MassMatrix, R: Rng> {
    pool: StatePool,
    hamiltonian: EuclideanHamiltonian<F, M>,
    collector: CombinedCollector<AcceptanceRateCollector, DrawCollector>,
    options: NutsOptions,
    rng: R,
    init: Option<State>,
    chain: u64,
    draw_count: u64,
    strategy: WindowedAdaptation<M>,
}

impl<F: CpuLogpFunc, M: MassMatrix, R: Rng> NutsChain<F, M, R> {
    pub(crate) fn new(logp: F, settings: &SamplerSettings, chain: u64, rng: R) -> Self {
        let dim = logp.dim();
        let pool_size: usize = (2 * settings.maxdepth) as usize;
        let hamiltonian = EuclideanHamiltonian::new(
            logp,
            M::identity(dim),
            settings.adapt_options.dual_average.initial_step,
            settings.max_energy_error,
        );
        let strategy = WindowedAdaptation::new(
            settings.adapt_options,
            settings.num_tune,
            &hamiltonian.mass_matrix,
            dim,
        );
        let collector = strategy.new_collector();
        NutsChain {
            pool: StatePool::new(dim, pool_size),
            hamiltonian,
            collector,
            options: NutsOptions {
                maxdepth: settings.maxdepth,
            },
            rng,
            init: None,
            chain,
            draw_count: 0,
            strategy,
        }
    }

    fn logp_and_rng(&mut self) -> (&F, &mut R) {
        (&self.hamiltonian.logp, &mut self.rng)
    }
}

impl<F: CpuLogpFunc, M: MassMatrix, R: Rng> Chain for NutsChain<F, M, R> {
    fn set_position(&mut self, position: &[f64]) -> std::result::Result<(), NutsError> {
        let state = self.hamiltonian.init_state(&mut self.pool, position)?;
        self.strategy
            .init(&mut self.hamiltonian, &state, &self.options, &mut self.rng);
        self.init = Some(state);
        Ok(())
    }

    fn draw(&mut self) -> std::result::Result<Draw, NutsError> {
        let init = self.init.as_mut().ok_or(NutsError::NotInitialized)?;
        let step_size = self.hamiltonian.step_size();
        let tuning = self.strategy.schedule().is_tuning(self.draw_count);

        let (state, info) = draw(
            &mut self.pool,
            init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;
        let initial_energy = init.energy();

        let accept = &self.collector.collector1.mean;
        let draw = Draw {
            position: state.q.clone(),
            logp: -state.potential_energy(),
            depth: info.depth,
            n_steps: accept.count(),
            diverging: info.divergence_info.is_some(),
            maxdepth_reached: info.reached_maxdepth,
            accept_stat: accept.current(),
            energy: state.energy(),
            energy_error: state.energy() - initial_energy,
            step_size,
            tuning,
            index_in_trajectory: state.index_in_trajectory(),
        };

        if draw.diverging && !tuning {
            debug!("chain {} draw {} diverged", self.chain, self.draw_count);
        }

        self.strategy.adapt(
            &mut self.hamiltonian,
            self.draw_count,
            &self.collector,
            &state,
            &self.options,
            &mut self.rng,
        );
        self.init = Some(state);
        self.draw_count += 1;
        Ok(draw)
    }

    fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    fn mass_matrix_diag(&self) -> Box<[f64]> {
        self.hamiltonian.mass_matrix.variance_diag()
    }
}

/// What happens to the draws of a chain that was stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortPolicy {
    /// Keep the draws made before the interruption.
    #[default]
    Retain,
    /// Return the chain without draws.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The shared abort flag was raised.
    Aborted,
    /// The wall-clock deadline passed.
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Complete,
    /// Stopped at an iteration boundary after `finished` iterations.
    Interrupted {
        reason: InterruptReason,
        finished: u64,
    },
}

/// Everything one chain produced.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: u64,
    pub status: ChainStatus,
    /// Warmup iterations, in order.
    pub warmup: Vec<Draw>,
    /// Post-warmup iterations, in order. Divergent draws are kept and flagged.
    pub draws: Vec<Draw>,
    /// The frozen step size used after warmup.
    pub step_size: f64,
    /// Diagonal of the adapted inverse mass matrix.
    pub mass_matrix_diag: Box<[f64]>,
    pub runtime: Duration,
}

impl ChainOutput {
    pub fn is_complete(&self) -> bool {
        self.status == ChainStatus::Complete
    }

    pub fn num_divergences(&self) -> usize {
        self.draws.iter().filter(|draw| draw.diverging).count()
    }
}

/// Drives warmup and sampling of one chain.
///
/// The runner owns its model copy, random stream and adaptation state, so
/// any number of runners can execute concurrently.
pub struct ChainRunner<F> {
    model: F,
    settings: SamplerSettings,
    chain: u64,
    abort: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    policy: AbortPolicy,
    init_position: Option<Vec<f64>>,
}

impl<F: CpuLogpFunc> ChainRunner<F> {
    pub fn new(model: F, settings: &SamplerSettings, chain: u64) -> Self {
        Self {
            model,
            settings: settings.clone(),
            chain,
            abort: None,
            deadline: None,
            policy: AbortPolicy::default(),
            init_position: settings.init_position.clone(),
        }
    }

    /// Stop at the next iteration boundary once `flag` is set.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Stop at the first iteration boundary after `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_policy(mut self, policy: AbortPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start at `position` instead of a random point.
    pub fn with_init_position(mut self, position: Vec<f64>) -> Self {
        self.init_position = Some(position);
        self
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn run(self) -> Result<ChainOutput> {
        let dim = self.model.dim();
        self.settings
            .validate(dim)
            .context("Invalid sampler settings")?;
        if let Some(position) = &self.init_position {
            check_init_position(position, dim)
                .context("Invalid initial position")?;
        }
        let rng = self.settings.chain_rng(self.chain);
        match self.settings.mass_matrix {
            MassMatrixKind::Diag => self.run_with::<DiagMassMatrix>(rng),
            MassMatrixKind::Dense => self.run_with::<DenseMassMatrix>(rng),
        }
    }

    fn run_with<M: MassMatrix>(self, rng: ChaCha8Rng) -> Result<ChainOutput> {
        let start_time = Instant::now();
        let ChainRunner {
            model,
            settings,
            chain: chain_id,
            abort,
            deadline,
            policy,
            init_position,
        } = self;
        let interrupted = || -> Option<InterruptReason> {
            if abort.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Some(InterruptReason::Aborted);
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => Some(InterruptReason::Deadline),
                _ => None,
            }
        };

        let mut chain: NutsChain<F, M, ChaCha8Rng> =
            NutsChain::new(model, &settings, chain_id, rng);

        initialize(&mut chain, init_position.as_deref(), settings.init_jitter)
            .with_context(|| format!("Could not initialize chain {}", chain_id))?;
        debug!("chain {} initialized", chain_id);

        let total = settings.num_tune + settings.num_draws;
        let mut warmup = Vec::new();
        let mut draws = Vec::new();
        let mut status = ChainStatus::Complete;

        for i in 0..total {
            if let Some(reason) = interrupted() {
                debug!("chain {} interrupted after {} iterations", chain_id, i);
                status = ChainStatus::Interrupted {
                    reason,
                    finished: i,
                };
                break;
            }
            let draw = chain
                .draw()
                .with_context(|| format!("Chain {} failed at iteration {}", chain_id, i))?;
            if draw.tuning {
                warmup.push(draw);
            } else {
                draws.push(draw);
            }
        }

        if status != ChainStatus::Complete && policy == AbortPolicy::Discard {
            warmup.clear();
            draws.clear();
        }

        let divergences = draws.iter().filter(|draw| draw.diverging).count();
        if divergences > 0 {
            warn!(
                "chain {} had {} divergences after warmup",
                chain_id, divergences
            );
        }
        debug!(
            "chain {} finished {} draws in {:?}",
            chain_id,
            draws.len(),
            start_time.elapsed()
        );

        Ok(ChainOutput {
            chain: chain_id,
            status,
            warmup,
            draws,
            step_size: chain.step_size(),
            mass_matrix_diag: chain.mass_matrix_diag(),
            runtime: start_time.elapsed(),
        })
    }
}

/// Set the chain to `position`, or to random points until the log density is finite.
pub(crate) fn initialize<F: CpuLogpFunc, M: MassMatrix, R: Rng>(
    chain: &mut NutsChain<F, M, R>,
    position: Option<&[f64]>,
    jitter: f64,
) -> std::result::Result<(), NutsError> {
    if let Some(position) = position {
        return chain.set_position(position);
    }
    let mut position = vec![0f64; chain.dim()];
    let mut last_error = None;
    for _ in 0..INIT_ATTEMPTS {
        let (logp, rng) = chain.logp_and_rng();
        logp.init_position(rng, jitter, &mut position);
        match chain.set_position(&position) {
            Ok(()) => return Ok(()),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.unwrap_or(NutsError::NotInitialized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::test_logps::NormalLogp, sampler::SettingsError};
    use pretty_assertions::assert_eq;

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_tune: 100,
            num_draws: 50,
            seed: 7,
            ..Default::default()
        }
    }

    #[test]
    fn runs_warmup_then_sampling() {
        let output = ChainRunner::new(NormalLogp::new(3, 1.), &settings(), 0)
            .run()
            .unwrap();
        assert!(output.is_complete());
        assert_eq!(output.warmup.len(), 100);
        assert_eq!(output.draws.len(), 50);
        assert!(output.warmup.iter().all(|d| d.tuning));
        assert!(output.draws.iter().all(|d| !d.tuning));
        let frozen = output.draws[0].step_size;
        assert!(output.draws.iter().all(|d| d.step_size == frozen));
        assert_eq!(output.step_size, frozen);
        assert!(output.draws.iter().all(|d| d.accept_stat >= 0. && d.accept_stat <= 1.));
        assert!(output.draws.iter().all(|d| d.n_steps >= 1));
    }

    #[test]
    fn same_seed_same_draws() {
        let a = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 1)
            .run()
            .unwrap();
        let b = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 1)
            .run()
            .unwrap();
        assert_eq!(a.draws, b.draws);
        let c = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 2)
            .run()
            .unwrap();
        assert!(a.draws != c.draws);
    }

    #[test]
    fn abort_flag_stops_chain() {
        let flag = Arc::new(AtomicBool::new(true));
        let output = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 0)
            .with_abort_flag(flag)
            .run()
            .unwrap();
        assert_eq!(
            output.status,
            ChainStatus::Interrupted {
                reason: InterruptReason::Aborted,
                finished: 0
            }
        );
        assert!(output.draws.is_empty());
    }

    #[test]
    fn deadline_discards_partial_chain() {
        let output = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 0)
            .with_deadline(Instant::now())
            .with_policy(AbortPolicy::Discard)
            .run()
            .unwrap();
        assert!(matches!(
            output.status,
            ChainStatus::Interrupted {
                reason: InterruptReason::Deadline,
                ..
            }
        ));
        assert!(output.warmup.is_empty());
        assert!(output.draws.is_empty());
    }

    #[test]
    fn explicit_start() {
        let output = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 0)
            .with_init_position(vec![0.3, -0.3])
            .run()
            .unwrap();
        assert!(output.is_complete());
    }

    #[test]
    fn invalid_settings_stop_before_sampling() {
        let rejected = |runner: ChainRunner<NormalLogp>| {
            let err = runner.run().err().expect("runner should not start");
            err.downcast_ref::<SettingsError>().cloned()
        };
        let no_depth = SamplerSettings {
            maxdepth: 0,
            ..settings()
        };
        assert_eq!(
            rejected(ChainRunner::new(NormalLogp::new(2, 0.), &no_depth, 0)),
            Some(SettingsError::MaxDepth)
        );
        let no_iterations = SamplerSettings {
            num_tune: 0,
            num_draws: 0,
            ..settings()
        };
        assert_eq!(
            rejected(ChainRunner::new(NormalLogp::new(2, 0.), &no_iterations, 0)),
            Some(SettingsError::NoWarmup)
        );
        let wrong_start = ChainRunner::new(NormalLogp::new(2, 0.), &settings(), 0)
            .with_init_position(vec![0.; 3]);
        assert_eq!(
            rejected(wrong_start),
            Some(SettingsError::InitDimension {
                expected: 2,
                found: 3
            })
        );
    }
}

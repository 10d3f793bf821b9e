//! Warmup adaptation in windows.
//!
//! ```text
//! |  initial  |  slow 1  |    slow 2    |        slow 3        | terminal |
//!   step size   step size and mass matrix, doubling windows      step size
//! ```
//!
//! The mass matrix is re-estimated at the end of every slow window from the
//! draws of that window only. After every update the step size search and
//! the dual averaging controller restart, because the old step size was
//! tuned for the old metric.

use log::debug;
use rand::Rng;

use crate::{
    hamiltonian::{DivergenceInfo, EuclideanHamiltonian, Hamiltonian},
    mass_matrix::{DrawCollector, Estimator, MassMatrix, Regularization},
    model::CpuLogpFunc,
    nuts::{Collector, NutsOptions, SampleInfo},
    state::State,
    stepsize::{AcceptanceRateCollector, DualAverageSettings, StepSizeAdapter},
};

/// Settings for the warmup phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptOptions {
    pub dual_average: DualAverageSettings,
    /// Draws at the start of warmup that only tune the step size.
    pub initial_window: u64,
    /// Length of the first slow window. Later windows double.
    pub base_window: u64,
    /// Draws at the end of warmup that only tune the step size.
    pub terminal_window: u64,
    pub regularization: Regularization,
}

impl Default for AdaptOptions {
    fn default() -> Self {
        Self {
            dual_average: DualAverageSettings::default(),
            initial_window: 75,
            base_window: 25,
            terminal_window: 50,
            regularization: Regularization::default(),
        }
    }
}

/// Boundaries of the adaptation windows for a given number of warmup draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupSchedule {
    num_tune: u64,
    slow_start: u64,
    slow_end: u64,
    /// Exclusive end of every slow window, increasing.
    window_ends: Vec<u64>,
}

impl WarmupSchedule {
    /// Lay out the windows, shrinking them to 15% / 75% / 10% of warmup if
    /// the configured windows do not fit.
    ///
    /// A shrunk schedule keeps at least one terminal draw, so the last mass
    /// matrix update is always followed by a dual averaging step.
    pub fn new(num_tune: u64, options: &AdaptOptions) -> Self {
        let (initial, base, terminal) =
            if options.initial_window + options.base_window + options.terminal_window > num_tune {
                let initial = (num_tune as f64 * 0.15) as u64;
                let terminal = if num_tune > 1 {
                    ((num_tune as f64 * 0.1) as u64).max(1)
                } else {
                    0
                };
                (initial, num_tune - initial - terminal, terminal)
            } else {
                (
                    options.initial_window,
                    options.base_window,
                    options.terminal_window,
                )
            };

        let slow_end = num_tune - terminal;
        let mut window_ends = Vec::new();
        let mut start = initial;
        let mut size = base.max(1);
        while start < slow_end {
            let mut end = start + size;
            if end + 2 * size > slow_end {
                end = slow_end;
            }
            window_ends.push(end);
            start = end;
            size *= 2;
        }

        Self {
            num_tune,
            slow_start: initial,
            slow_end,
            window_ends,
        }
    }

    pub fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_tune
    }

    /// Whether `draw` feeds the mass matrix estimator.
    pub fn in_slow_window(&self, draw: u64) -> bool {
        (self.slow_start..self.slow_end).contains(&draw)
    }

    /// Whether `draw` is the last draw of a slow window.
    pub fn is_window_end(&self, draw: u64) -> bool {
        self.window_ends.binary_search(&(draw + 1)).is_ok()
    }

    pub fn window_ends(&self) -> &[u64] {
        &self.window_ends
    }
}

/// Step size and mass matrix adaptation on the schedule of [`WarmupSchedule`].
pub(crate) struct WindowedAdaptation<M: MassMatrix> {
    step_size: StepSizeAdapter,
    estimator: M::Estimator,
    schedule: WarmupSchedule,
    options: AdaptOptions,
    dim: usize,
}

impl<M: MassMatrix> WindowedAdaptation<M> {
    pub(crate) fn new(options: AdaptOptions, num_tune: u64, mass_matrix: &M, dim: usize) -> Self {
        Self {
            step_size: StepSizeAdapter::new(options.dual_average),
            estimator: mass_matrix.new_estimator(),
            schedule: WarmupSchedule::new(num_tune, &options),
            options,
            dim,
        }
    }

    pub(crate) fn schedule(&self) -> &WarmupSchedule {
        &self.schedule
    }

    pub(crate) fn init<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        state: &State,
        options: &NutsOptions,
        rng: &mut R,
    ) {
        self.step_size.init(hamiltonian, state, options, rng);
        debug!("initial step size {:e}", hamiltonian.step_size());
    }

    /// Update the sampler after draw number `draw` has been produced.
    pub(crate) fn adapt<F: CpuLogpFunc, R: Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, M>,
        draw: u64,
        collector: &CombinedCollector<AcceptanceRateCollector, DrawCollector>,
        state: &State,
        options: &NutsOptions,
        rng: &mut R,
    ) {
        if !self.schedule.is_tuning(draw) {
            return;
        }

        self.step_size.update(collector.collector1.mean.current());

        if self.schedule.in_slow_window(draw) && collector.collector2.is_good {
            self.estimator.add_sample(&collector.collector2.draw);
        }

        if self.schedule.is_window_end(draw) {
            let updated = hamiltonian
                .mass_matrix
                .update_from(&self.estimator, &self.options.regularization);
            debug!(
                "slow window ending at draw {} with {} samples, mass matrix updated: {}",
                draw + 1,
                self.estimator.count(),
                updated
            );
            self.estimator = hamiltonian.mass_matrix.new_estimator();
            if updated {
                self.step_size.init(hamiltonian, state, options, rng);
                return;
            }
        }

        let last_tune = draw + 1 == self.schedule.num_tune;
        self.step_size.update_stepsize(hamiltonian, last_tune);
        if last_tune {
            debug!("warmup finished, step size {:e}", hamiltonian.step_size());
        }
    }

    pub(crate) fn new_collector(
        &self,
    ) -> CombinedCollector<AcceptanceRateCollector, DrawCollector> {
        CombinedCollector {
            collector1: self.step_size.new_collector(),
            collector2: DrawCollector::new(self.dim),
        }
    }
}

pub(crate) struct CombinedCollector<C1: Collector, C2: Collector> {
    pub(crate) collector1: C1,
    pub(crate) collector2: C2,
}

impl<C1, C2> Collector for CombinedCollector<C1, C2>
where
    C1: Collector,
    C2: Collector,
{
    fn register_leapfrog(
        &mut self,
        start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.collector1.register_leapfrog(start, end, divergence_info);
        self.collector2.register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.collector1.register_draw(state, info);
        self.collector2.register_draw(state, info);
    }

    fn register_init(&mut self, state: &State, options: &NutsOptions) {
        self.collector1.register_init(state, options);
        self.collector2.register_init(state, options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::DiagMassMatrix, model::test_logps::NormalLogp, nuts::draw, state::StatePool,
    };
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn default_windows() {
        let schedule = WarmupSchedule::new(1000, &AdaptOptions::default());
        assert_eq!(schedule.window_ends(), &[100, 150, 250, 450, 950]);
        assert!(!schedule.in_slow_window(74));
        assert!(schedule.in_slow_window(75));
        assert!(schedule.in_slow_window(949));
        assert!(!schedule.in_slow_window(950));
        assert!(schedule.is_window_end(99));
        assert!(schedule.is_window_end(949));
        assert!(!schedule.is_window_end(100));
    }

    #[test]
    fn short_warmup_is_scaled() {
        let schedule = WarmupSchedule::new(100, &AdaptOptions::default());
        assert_eq!(schedule.window_ends(), &[90]);
        assert!(!schedule.in_slow_window(14));
        assert!(schedule.in_slow_window(15));
        assert!(!schedule.in_slow_window(90));
    }

    #[test]
    fn tiny_warmup() {
        let schedule = WarmupSchedule::new(3, &AdaptOptions::default());
        assert_eq!(schedule.window_ends(), &[2]);
        let schedule = WarmupSchedule::new(1, &AdaptOptions::default());
        assert_eq!(schedule.window_ends(), &[1]);
        let schedule = WarmupSchedule::new(0, &AdaptOptions::default());
        assert!(schedule.window_ends().is_empty());
        assert!(!schedule.is_tuning(0));
    }

    #[test]
    fn last_window_ends_before_warmup() {
        for num_tune in 2..200 {
            let schedule = WarmupSchedule::new(num_tune, &AdaptOptions::default());
            let last = *schedule.window_ends().last().unwrap();
            assert!(last < num_tune, "{} warmup draws end with {}", num_tune, last);
            assert!(!schedule.is_window_end(num_tune - 1));
        }
    }

    #[test]
    fn short_warmup_ends_with_averaged_step() {
        let dim = 2;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(dim, 0.),
            DiagMassMatrix::identity(dim),
            0.1,
            1000.,
        );
        let mut pool = StatePool::new(dim, 20);
        let options = NutsOptions::default();
        let num_tune = 8;
        let mut adapt = WindowedAdaptation::new(
            AdaptOptions::default(),
            num_tune,
            &hamiltonian.mass_matrix,
            dim,
        );
        let mut collector = adapt.new_collector();
        let mut state = hamiltonian.init_state(&mut pool, &[0.5, -0.5]).unwrap();
        adapt.init(&mut hamiltonian, &state, &options, &mut rng);

        for i in 0..num_tune {
            let (next, _info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut hamiltonian,
                &options,
                &mut collector,
            )
            .unwrap();
            state = next;
            adapt.adapt(&mut hamiltonian, i, &collector, &state, &options, &mut rng);
        }
        let frozen = hamiltonian.step_size();
        adapt.step_size.update_stepsize(&mut hamiltonian, true);
        assert_eq!(hamiltonian.step_size(), frozen);
    }

    #[test]
    fn adapts_to_scaled_normal() {
        let dim = 4;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(dim, 0.5),
            DiagMassMatrix::identity(dim),
            0.1,
            1000.,
        );
        let mut pool = StatePool::new(dim, 20);
        let options = NutsOptions::default();
        let num_tune = 300;
        let mut adapt = WindowedAdaptation::new(
            AdaptOptions::default(),
            num_tune,
            &hamiltonian.mass_matrix,
            dim,
        );
        let mut collector = adapt.new_collector();
        let mut state = hamiltonian.init_state(&mut pool, &[0.; 4]).unwrap();
        adapt.init(&mut hamiltonian, &state, &options, &mut rng);

        for i in 0..num_tune {
            let (next, _info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut hamiltonian,
                &options,
                &mut collector,
            )
            .unwrap();
            state = next;
            adapt.adapt(&mut hamiltonian, i, &collector, &state, &options, &mut rng);
        }

        // Unit variance posterior: the regularized estimate stays near one
        for &var in hamiltonian.mass_matrix.variance.iter() {
            assert!(var > 0.3 && var < 3., "variance {}", var);
        }
        let step = hamiltonian.step_size();
        assert!(step > 0.2 && step < 3., "step size {}", step);
    }
}

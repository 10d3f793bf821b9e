use crate::{
    hamiltonian::{DivergenceInfo, Hamiltonian},
    integrator::Direction,
    nuts::{Collector, NutsOptions},
    state::{State, StatePool},
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageSettings {
    /// Mean acceptance statistic the controller aims for.
    pub target_accept: f64,
    /// Starting point of the initial step size search.
    pub initial_step: f64,
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageSettings {
    fn default() -> DualAverageSettings {
        DualAverageSettings {
            target_accept: 0.8,
            initial_step: 0.1,
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Nesterov dual averaging of `log ε`.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageSettings,
}

impl DualAverage {
    pub fn new(settings: DualAverageSettings, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (self.settings.target_accept - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    /// The step size for the next iteration during warmup.
    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    /// The averaged step size, frozen for sampling.
    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Restart the controller around a new step size.
    pub fn reset(&mut self, initial_step: f64) {
        *self = DualAverage::new(self.settings, initial_step);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability over every leapfrog of a trajectory.
///
/// Divergent steps count as zero.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => self
                .mean
                .add(end.log_acceptance_probability(self.initial_energy).exp()),
        }
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

/// Step size tuning during warmup.
#[derive(Debug, Clone)]
pub(crate) struct StepSizeAdapter {
    settings: DualAverageSettings,
    dual_average: DualAverage,
}

impl StepSizeAdapter {
    pub(crate) fn new(settings: DualAverageSettings) -> Self {
        Self {
            settings,
            dual_average: DualAverage::new(settings, settings.initial_step),
        }
    }

    /// Find a reasonable starting step size.
    ///
    /// Starting at the configured initial step, the step is doubled while a
    /// single leapfrog from `state` is accepted with probability above the
    /// target, or halved until it is. The dual averaging controller is
    /// restarted around the result.
    pub(crate) fn init<H: Hamiltonian, R: rand::Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut H,
        state: &State,
        options: &NutsOptions,
        rng: &mut R,
    ) {
        let mut pool = StatePool::new(hamiltonian.dim(), 4);
        let mut state = pool.copy_state(state);
        hamiltonian.randomize_momentum(&mut state, rng);
        state.make_init_point();

        *hamiltonian.step_size_mut() = self.settings.initial_step;

        let Some(accept_stat) = single_step_accept(hamiltonian, &mut pool, &state, options)
        else {
            self.dual_average.reset(self.settings.initial_step);
            return;
        };
        let dir = if accept_stat > self.settings.target_accept {
            Direction::Forward
        } else {
            Direction::Backward
        };

        for _ in 0..100 {
            match dir {
                Direction::Forward => *hamiltonian.step_size_mut() *= 2.,
                Direction::Backward => *hamiltonian.step_size_mut() /= 2.,
            }
            let accept_stat = single_step_accept(hamiltonian, &mut pool, &state, options);
            let done = match (dir, accept_stat) {
                (_, None) => {
                    *hamiltonian.step_size_mut() /= 2.;
                    true
                }
                (Direction::Forward, Some(stat)) => {
                    if stat <= self.settings.target_accept {
                        *hamiltonian.step_size_mut() /= 2.;
                        true
                    } else {
                        hamiltonian.step_size() > 1e5
                    }
                }
                (Direction::Backward, Some(stat)) => {
                    (stat > self.settings.target_accept) | (hamiltonian.step_size() < 1e-10)
                }
            };
            if done {
                break;
            }
        }
        self.dual_average.reset(hamiltonian.step_size());
    }

    /// Feed the acceptance statistic of the last draw into the controller.
    pub(crate) fn update(&mut self, accept_stat: f64) {
        self.dual_average.advance(accept_stat);
    }

    /// Write the current or the averaged step size into the hamiltonian.
    pub(crate) fn update_stepsize<H: Hamiltonian>(&self, hamiltonian: &mut H, use_best: bool) {
        *hamiltonian.step_size_mut() = if use_best {
            self.dual_average.current_step_size_adapted()
        } else {
            self.dual_average.current_step_size()
        };
    }

    pub(crate) fn new_collector(&self) -> AcceptanceRateCollector {
        AcceptanceRateCollector::new()
    }
}

fn single_step_accept<H: Hamiltonian>(
    hamiltonian: &mut H,
    pool: &mut StatePool,
    state: &State,
    options: &NutsOptions,
) -> Option<f64> {
    let mut collector = AcceptanceRateCollector::new();
    collector.register_init(state, options);
    match hamiltonian.leapfrog(pool, state, Direction::Forward, state.energy(), &mut collector) {
        Ok(Ok(_)) => Some(collector.mean.current()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hamiltonian::EuclideanHamiltonian,
        mass_matrix::{DiagMassMatrix, MassMatrix},
        model::test_logps::NormalLogp,
    };
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn dual_average_moves_toward_target() {
        let settings = DualAverageSettings::default();
        let mut too_low = DualAverage::new(settings, 1.);
        let mut too_high = DualAverage::new(settings, 1.);
        for _ in 0..50 {
            too_low.advance(0.2);
            too_high.advance(0.99);
        }
        assert!(too_low.current_step_size() < 1.);
        assert!(too_high.current_step_size() > 1.);
        assert!(too_low.current_step_size_adapted() < too_high.current_step_size_adapted());
    }

    #[test]
    fn dual_average_is_stationary_at_target() {
        let settings = DualAverageSettings::default();
        let mut da = DualAverage::new(settings, 0.5);
        for _ in 0..100 {
            da.advance(settings.target_accept);
        }
        assert_abs_diff_eq!(da.current_step_size(), 5., epsilon = 1e-9);
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::new();
        mean.add(1.);
        mean.add(2.);
        assert_eq!(mean.current(), 1.5);
        assert_eq!(mean.count(), 2);
        mean.reset();
        assert_eq!(mean.count(), 0);
    }

    #[test]
    fn initial_search_finds_workable_step() {
        let dim = 5;
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp::new(dim, 0.),
            DiagMassMatrix::identity(dim),
            1.,
            1000.,
        );
        let mut pool = StatePool::new(dim, 4);
        let state = hamiltonian.init_state(&mut pool, &[0.1; 5]).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let settings = DualAverageSettings {
            initial_step: 1e-3,
            ..Default::default()
        };
        let mut adapter = StepSizeAdapter::new(settings);
        adapter.init(&mut hamiltonian, &state, &NutsOptions::default(), &mut rng);
        let step = hamiltonian.step_size();
        assert!(step > 1e-3);
        assert!(step < 10.);
    }
}

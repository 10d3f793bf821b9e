use std::sync::Arc;

use rand::Rng;

use crate::{
    integrator::{leapfrog, Direction},
    mass_matrix::MassMatrix,
    model::CpuLogpFunc,
    nuts::{Collector, LogpError, NutsError, Result},
    state::{State, StatePool},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg a non-finite
///   log density far out in the tails)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_location: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// The hamiltonian defined by the potential energy and the kinetic energy
pub(crate) trait Hamiltonian {
    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>>;

    /// Initialize a state at a new location.
    ///
    /// The momentum is zero, it will later be set using
    /// Self::randomize_momentum.
    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State>;

    /// Randomize the momentum part of a state
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R);

    fn step_size(&self) -> f64;
    fn step_size_mut(&mut self) -> &mut f64;

    /// The dimension of the hamiltonian (position only).
    fn dim(&self) -> usize;
}

/// Separable hamiltonian with a Euclidean (position independent) metric.
pub(crate) struct EuclideanHamiltonian<F: CpuLogpFunc, M: MassMatrix> {
    pub(crate) logp: F,
    pub(crate) mass_matrix: M,
    step_size: f64,
    max_energy_error: f64,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanHamiltonian<F, M> {
    pub(crate) fn new(logp: F, mass_matrix: M, step_size: f64, max_energy_error: f64) -> Self {
        Self {
            logp,
            mass_matrix,
            step_size,
            max_energy_error,
        }
    }

    /// Recompute velocity and kinetic energy after the mass matrix changed.
    pub(crate) fn update_kinetic_energy(&self, state: &mut State) {
        let inner = state.try_mut_inner().expect("State already in use");
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> Hamiltonian for EuclideanHamiltonian<F, M> {
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>> {
        let mut out = pool.new_state();
        let epsilon = dir.sign() as f64 * self.step_size;

        let result = leapfrog(&mut self.logp, &self.mass_matrix, start, &mut out, epsilon);
        if let Err(logp_error) = result {
            if !logp_error.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: None,
                energy_error: None,
                end_idx_in_trajectory: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                logp_function_error: Some(Arc::new(logp_error)),
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        *out.index_in_trajectory_mut() = start.index_in_trajectory() + dir.sign();
        start.set_psum(&mut out);

        let energy_error = out.energy() - initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        collector.register_leapfrog(start, &out, None);

        Ok(Ok(out))
    }

    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State> {
        let mut state = pool.new_state();
        {
            let inner = state.try_mut_inner().expect("State already in use");
            inner.q.copy_from_slice(init);
            inner.p.fill(0.);
            inner.p_sum.fill(0.);
            inner.idx_in_trajectory = 0;
            let logp = self
                .logp
                .logp(&inner.q, &mut inner.grad)
                .map_err(|e| NutsError::BadInitGrad(Box::new(e)))?;
            inner.potential_energy = -logp;
        }
        self.update_kinetic_energy(&mut state);
        Ok(state)
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let inner = state.try_mut_inner().expect("State already in use");
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }
}

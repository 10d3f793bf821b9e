use faer::{Mat, Side};
use itertools::izip;
use multiversion::multiversion;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    hamiltonian::DivergenceInfo,
    math::{multiply, vector_dot},
    nuts::{Collector, SampleInfo},
    state::{InnerState, State},
};

const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

/// Which preconditioner the warmup estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassMatrixKind {
    /// One variance per coordinate.
    #[default]
    Diag,
    /// Full covariance, factored with a Cholesky decomposition.
    Dense,
}

/// Shrinkage of a warmup estimate toward a multiple of the identity.
///
/// With `n` samples the regularized variance is
/// `n / (n + shrinkage) * estimate + shrinkage / (n + shrinkage) * target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regularization {
    pub shrinkage: f64,
    pub target: f64,
}

impl Default for Regularization {
    fn default() -> Self {
        Self {
            shrinkage: 5.,
            target: 1.,
        }
    }
}

impl Regularization {
    fn weight(&self, count: u64) -> f64 {
        let n = count as f64;
        n / (n + self.shrinkage)
    }
}

/// An online estimator fed with warmup draws.
pub(crate) trait Estimator {
    fn add_sample(&mut self, value: &[f64]);
    fn count(&self) -> u64;
}

/// The kinetic energy `½ pᵀ M⁻¹ p` and its momentum distribution `N(0, M)`.
///
/// Implementations store `M⁻¹`, the estimated posterior covariance.
pub(crate) trait MassMatrix {
    type Estimator: Estimator;

    fn identity(dim: usize) -> Self;
    fn update_velocity(&self, state: &mut InnerState);
    fn update_kinetic_energy(&self, state: &mut InnerState);
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);
    fn new_estimator(&self) -> Self::Estimator;

    /// Replace the current matrix with the regularized estimate.
    ///
    /// Returns `false` and leaves the matrix untouched if the estimate is unusable.
    fn update_from(&mut self, estimator: &Self::Estimator, regularization: &Regularization)
        -> bool;

    /// Diagonal of `M⁻¹`.
    fn variance_diag(&self) -> Box<[f64]>;
}

#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn update_diag(&mut self, new_variance: &[f64]) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn update_diag(variance_out: &mut [f64], inv_std_out: &mut [f64], new_variance: &[f64]) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        let x = x.clamp(LOWER_LIMIT, UPPER_LIMIT);
        *var = x;
        *inv_std = x.sqrt().recip();
    });
}

impl MassMatrix for DiagMassMatrix {
    type Estimator = RunningVariance;

    fn identity(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn new_estimator(&self) -> RunningVariance {
        RunningVariance::new(self.variance.len())
    }

    fn update_from(
        &mut self,
        estimator: &RunningVariance,
        regularization: &Regularization,
    ) -> bool {
        if estimator.count() < 3 {
            return false;
        }
        let weight = regularization.weight(estimator.count());
        let target = regularization.target;
        let new_variance: Vec<f64> = estimator
            .current()
            .map(|var| weight * var + (1. - weight) * target)
            .collect();
        if !new_variance.iter().all(|x| x.is_finite() && *x > 0.) {
            return false;
        }
        self.update_diag(&new_variance);
        true
    }

    fn variance_diag(&self) -> Box<[f64]> {
        self.variance.clone()
    }
}

/// Dense `M⁻¹ = L Lᵀ`.
///
/// Momentum is drawn as `p = L⁻ᵀ z`, which has covariance `(L Lᵀ)⁻¹ = M`.
#[derive(Debug, Clone)]
pub(crate) struct DenseMassMatrix {
    dim: usize,
    /// `M⁻¹`, row major
    covariance: Box<[f64]>,
    /// Lower Cholesky factor of `M⁻¹`, row major
    factor: Box<[f64]>,
}

impl DenseMassMatrix {
    fn row<'a>(values: &'a [f64], dim: usize, i: usize) -> &'a [f64] {
        &values[i * dim..(i + 1) * dim]
    }

    /// Factor `covariance`; `None` if it is not positive definite.
    fn factorize(covariance: &[f64], dim: usize) -> Option<Box<[f64]>> {
        let mat = Mat::<f64>::from_fn(dim, dim, |i, j| covariance[i * dim + j]);
        let llt = mat.llt(Side::Lower).ok()?;
        let lower = llt.L().to_owned();
        let mut factor = vec![0f64; dim * dim];
        for i in 0..dim {
            for j in 0..=i {
                factor[i * dim + j] = lower[(i, j)];
            }
        }
        if factor.iter().all(|x| x.is_finite()) {
            Some(factor.into())
        } else {
            None
        }
    }
}

impl MassMatrix for DenseMassMatrix {
    type Estimator = RunningCovariance;

    fn identity(dim: usize) -> Self {
        let mut covariance = vec![0f64; dim * dim];
        (0..dim).for_each(|i| covariance[i * dim + i] = 1.);
        Self {
            dim,
            factor: covariance.clone().into(),
            covariance: covariance.into(),
        }
    }

    fn update_velocity(&self, state: &mut InnerState) {
        let dim = self.dim;
        for (i, v) in state.v.iter_mut().enumerate() {
            *v = vector_dot(Self::row(&self.covariance, dim, i), &state.p);
        }
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        let dim = self.dim;
        state.p.iter_mut().for_each(|p| *p = rng.sample(StandardNormal));
        // Back substitution for Lᵀ p = z
        for i in (0..dim).rev() {
            let mut value = state.p[i];
            for j in i + 1..dim {
                value -= self.factor[j * dim + i] * state.p[j];
            }
            state.p[i] = value / self.factor[i * dim + i];
        }
    }

    fn new_estimator(&self) -> RunningCovariance {
        RunningCovariance::new(self.dim)
    }

    fn update_from(
        &mut self,
        estimator: &RunningCovariance,
        regularization: &Regularization,
    ) -> bool {
        if estimator.count() < 3 {
            return false;
        }
        let dim = self.dim;
        let weight = regularization.weight(estimator.count());
        let mut covariance = estimator.current();
        for i in 0..dim {
            for j in 0..dim {
                let value = &mut covariance[i * dim + j];
                *value *= weight;
                if i == j {
                    *value = (*value + (1. - weight) * regularization.target)
                        .clamp(LOWER_LIMIT, UPPER_LIMIT);
                }
            }
        }
        let Some(factor) = Self::factorize(&covariance, dim) else {
            return false;
        };
        self.covariance = covariance.into();
        self.factor = factor;
        true
    }

    fn variance_diag(&self) -> Box<[f64]> {
        (0..self.dim)
            .map(|i| self.covariance[i * self.dim + i])
            .collect()
    }
}

/// Welford's online mean and variance, per coordinate.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    variance: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            variance: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// The unbiased variance estimate for every coordinate.
    pub(crate) fn current(&self) -> impl Iterator<Item = f64> + '_ {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        self.variance.iter().map(move |&m2| m2 * scale)
    }
}

impl Estimator for RunningVariance {
    fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        if self.count == 1 {
            self.mean.copy_from_slice(value);
        } else {
            add_sample(&mut self.mean, &mut self.variance, value, self.count);
        }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
fn add_sample(mean: &mut [f64], variance: &mut [f64], value: &[f64], count: u64) {
    let count = count as f64;
    izip!(value, mean, variance).for_each(|(&x, mean, var)| {
        let diff = x - *mean;
        *mean += diff / count;
        *var += (x - *mean) * diff;
    });
}

/// Welford's algorithm for the full covariance.
#[derive(Debug, Clone)]
pub(crate) struct RunningCovariance {
    mean: Box<[f64]>,
    comoment: Box<[f64]>,
    delta: Box<[f64]>,
    count: u64,
}

impl RunningCovariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            comoment: vec![0f64; dim * dim].into(),
            delta: vec![0f64; dim].into(),
            count: 0,
        }
    }

    /// The unbiased covariance estimate, row major.
    pub(crate) fn current(&self) -> Vec<f64> {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        self.comoment.iter().map(|&c| c * scale).collect()
    }
}

impl Estimator for RunningCovariance {
    fn add_sample(&mut self, value: &[f64]) {
        let dim = self.mean.len();
        self.count += 1;
        let count = self.count as f64;
        izip!(self.delta.iter_mut(), value, self.mean.iter_mut()).for_each(|(d, &x, mean)| {
            *d = x - *mean;
            *mean += *d / count;
        });
        for i in 0..dim {
            let after = value[i] - self.mean[i];
            for j in 0..dim {
                self.comoment[i * dim + j] += after * self.delta[j];
            }
        }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

/// Remembers the last draw for the mass matrix estimators.
///
/// Draws that equal the starting point of their trajectory carry no
/// information about the posterior scale and are flagged as not good.
pub(crate) struct DrawCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl DrawCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawCollector {
            draw: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl Collector for DrawCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }

    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.q);
        let idx = state.index_in_trajectory();
        if info.divergence_info.is_some() {
            self.is_good = (idx <= -4) | (idx >= 4);
        } else {
            self.is_good = idx != 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StatePool;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn welford_matches_two_pass() {
        let samples = [[1., 10.], [2., 12.], [4., 11.], [7., 15.]];
        let mut est = RunningVariance::new(2);
        samples.iter().for_each(|s| est.add_sample(s));
        let var: Vec<f64> = est.current().collect();

        let first: Vec<f64> = samples.iter().map(|s| s[0]).collect();
        let second: Vec<f64> = samples.iter().map(|s| s[1]).collect();
        let (_, v0) = crate::math::mean_and_variance(&first);
        let (_, v1) = crate::math::mean_and_variance(&second);
        assert_abs_diff_eq!(var[0], v0, epsilon = 1e-12);
        assert_abs_diff_eq!(var[1], v1, epsilon = 1e-12);
        assert_eq!(est.count(), 4);
    }

    #[test]
    fn covariance_diagonal_matches_variance() {
        let samples = [[1., 10.], [2., 12.], [4., 11.], [7., 15.]];
        let mut cov = RunningCovariance::new(2);
        let mut var = RunningVariance::new(2);
        samples.iter().for_each(|s| {
            cov.add_sample(s);
            var.add_sample(s);
        });
        let cov = cov.current();
        let var: Vec<f64> = var.current().collect();
        assert_abs_diff_eq!(cov[0], var[0], epsilon = 1e-12);
        assert_abs_diff_eq!(cov[3], var[1], epsilon = 1e-12);
        assert_abs_diff_eq!(cov[1], cov[2], epsilon = 1e-12);
    }

    #[test]
    fn shrinks_toward_target() {
        let mut est = RunningVariance::new(1);
        for x in [0., 0.2, -0.2, 0.1, -0.1] {
            est.add_sample(&[x]);
        }
        let raw: f64 = est.current().next().unwrap();
        let mut mass = DiagMassMatrix::identity(1);
        assert!(mass.update_from(&est, &Regularization::default()));
        let expected = 0.5 * raw + 0.5 * 1.;
        assert_abs_diff_eq!(mass.variance[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn too_few_samples_keep_identity() {
        let mut est = RunningVariance::new(2);
        est.add_sample(&[1., 2.]);
        let mut mass = DiagMassMatrix::identity(2);
        assert!(!mass.update_from(&est, &Regularization::default()));
        assert_eq!(&mass.variance[..], &[1., 1.]);
    }

    #[test]
    fn dense_identity_matches_diag() {
        let mut pool = StatePool::new(3, 2);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        inner.p.copy_from_slice(&[1., -2., 0.5]);

        let dense = DenseMassMatrix::identity(3);
        dense.update_velocity(inner);
        dense.update_kinetic_energy(inner);
        assert_eq!(&inner.v[..], &[1., -2., 0.5]);
        assert_abs_diff_eq!(inner.kinetic_energy, 0.5 * 5.25, epsilon = 1e-12);
    }

    #[test]
    fn dense_momentum_has_inverse_covariance() {
        let mut est = RunningCovariance::new(2);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..2000 {
            let z1: f64 = rng.sample(StandardNormal);
            let z2: f64 = rng.sample(StandardNormal);
            est.add_sample(&[2. * z1, z1 + 0.5 * z2]);
        }
        let mut mass = DenseMassMatrix::identity(2);
        let regularization = Regularization {
            shrinkage: 0.,
            target: 1.,
        };
        assert!(mass.update_from(&est, &regularization));

        // pᵀ M⁻¹ p averages to the dimension when p ~ N(0, M)
        let mut pool = StatePool::new(2, 2);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        let mut total = 0.;
        let n = 4000;
        for _ in 0..n {
            mass.randomize_momentum(inner, &mut rng);
            mass.update_velocity(inner);
            total += vector_dot(&inner.p, &inner.v);
        }
        assert_abs_diff_eq!(total / n as f64, 2., epsilon = 0.15);
    }

    #[test]
    fn collector_flags_initial_point() {
        let mut pool = StatePool::new(2, 2);
        let mut state = pool.new_state();
        state.try_mut_inner().unwrap().q.copy_from_slice(&[0.5, -1.]);
        let mut collector = DrawCollector::new(2);
        let info = SampleInfo {
            depth: 1,
            divergence_info: None,
            reached_maxdepth: false,
        };
        collector.register_draw(&state, &info);
        assert!(!collector.is_good);
        assert_eq!(&collector.draw[..], &[0.5, -1.]);
    }
}

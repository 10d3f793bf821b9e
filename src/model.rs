//! The Poisson count regression sampled by the chains.
//!
//! `log λ_n = α + β[dow_n] + δ·t_n + γ·fourier_n` with β[1] fixed at zero.
//! Only the K−1 free day-of-week effects are part of the position vector,
//! the baseline is reconstructed on every access.

use std::{error::Error, fmt::Debug, sync::Arc};

use itertools::izip;
use rand::Rng;
use thiserror::Error;

use crate::{math::vector_dot, nuts::LogpError};

/// Number of day-of-week categories in the default encoding.
pub const DAYS_PER_WEEK: usize = 7;

/// A log density with gradient over a flat `f64` position.
///
/// This is the only thing the sampler needs to know about a model.
pub trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    /// The dimension of the position vector.
    fn dim(&self) -> usize;

    /// Write the gradient of the unnormalized log density into `gradient`
    /// and return the log density itself.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// Names of the coordinates, used to label summaries.
    fn parameter_names(&self) -> Vec<String> {
        (0..self.dim()).map(|i| format!("x[{}]", i)).collect()
    }

    /// Fill `position` with a starting point for a chain.
    ///
    /// The default draws every coordinate uniformly from `(-jitter, jitter)`.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, jitter: f64, position: &mut [f64]) {
        position.iter_mut().for_each(|x| {
            *x = if jitter > 0. {
                rng.random_range(-jitter..jitter)
            } else {
                0.
            }
        });
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("Dataset contains no observations")]
    Empty,
    #[error("The number of day-of-week categories must be at least one")]
    NoCategories,
    #[error("Column `{field}` has {found} entries, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Fourier row {row} has {found} columns, expected {expected}")]
    RaggedFourier {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Day-of-week index {value} at observation {index} is outside [1, {categories}]")]
    DowOutOfRange {
        index: usize,
        value: usize,
        categories: usize,
    },
    #[error("Non-finite value in `{field}` at observation {index}")]
    NonFinite { field: &'static str, index: usize },
}

/// Observed daily counts and their covariates.
///
/// Immutable once constructed; chains share it through an [`Arc`].
#[derive(Debug, Clone)]
pub struct Dataset {
    counts: Vec<u64>,
    dow: Vec<usize>,
    time: Vec<f64>,
    fourier: Vec<f64>,
    fourier_width: usize,
    num_categories: usize,
}

impl Dataset {
    /// Build a dataset with the seven day-of-week categories.
    ///
    /// `dow` is 1-based, category 1 is the baseline.
    pub fn new(
        counts: Vec<u64>,
        dow: Vec<usize>,
        time: Vec<f64>,
        fourier: Vec<Vec<f64>>,
    ) -> Result<Self, DatasetError> {
        Self::with_categories(DAYS_PER_WEEK, counts, dow, time, fourier)
    }

    pub fn with_categories(
        num_categories: usize,
        counts: Vec<u64>,
        dow: Vec<usize>,
        time: Vec<f64>,
        fourier: Vec<Vec<f64>>,
    ) -> Result<Self, DatasetError> {
        if num_categories == 0 {
            return Err(DatasetError::NoCategories);
        }
        let n = counts.len();
        if n == 0 {
            return Err(DatasetError::Empty);
        }
        for (field, found) in [("dow", dow.len()), ("time", time.len()), ("fourier", fourier.len())]
        {
            if found != n {
                return Err(DatasetError::LengthMismatch {
                    field,
                    expected: n,
                    found,
                });
            }
        }

        let fourier_width = fourier[0].len();
        let mut flat = Vec::with_capacity(n * fourier_width);
        for (row_idx, row) in fourier.iter().enumerate() {
            if row.len() != fourier_width {
                return Err(DatasetError::RaggedFourier {
                    row: row_idx,
                    expected: fourier_width,
                    found: row.len(),
                });
            }
            if !row.iter().all(|x| x.is_finite()) {
                return Err(DatasetError::NonFinite {
                    field: "fourier",
                    index: row_idx,
                });
            }
            flat.extend_from_slice(row);
        }

        for (index, (&value, &t)) in dow.iter().zip(time.iter()).enumerate() {
            if !(1..=num_categories).contains(&value) {
                return Err(DatasetError::DowOutOfRange {
                    index,
                    value,
                    categories: num_categories,
                });
            }
            if !t.is_finite() {
                return Err(DatasetError::NonFinite {
                    field: "time",
                    index,
                });
            }
        }

        Ok(Self {
            counts,
            dow,
            time,
            fourier: flat,
            fourier_width,
            num_categories,
        })
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn dow(&self) -> &[usize] {
        &self.dow
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn fourier_row(&self, idx: usize) -> &[f64] {
        &self.fourier[idx * self.fourier_width..(idx + 1) * self.fourier_width]
    }

    pub fn fourier_width(&self) -> usize {
        self.fourier_width
    }

    pub fn num_categories(&self) -> usize {
        self.num_categories
    }

    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.num_categories, self.fourier_width)
    }

    fn rows(&self) -> impl Iterator<Item = (u64, usize, f64, &[f64])> + '_ {
        let rows: Box<dyn Iterator<Item = &[f64]> + '_> = if self.fourier_width == 0 {
            Box::new(std::iter::repeat(&[][..]).take(self.len()))
        } else {
            Box::new(self.fourier.chunks_exact(self.fourier_width))
        };
        izip!(
            self.counts.iter().copied(),
            self.dow.iter().copied(),
            self.time.iter().copied(),
            rows
        )
    }
}

/// Positions of α, β_raw, δ and γ inside the flat parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    num_categories: usize,
    fourier_width: usize,
}

impl ParameterLayout {
    pub fn new(num_categories: usize, fourier_width: usize) -> Self {
        assert!(num_categories > 0);
        Self {
            num_categories,
            fourier_width,
        }
    }

    /// `1 + (K − 1) + 1 + 2S`
    pub fn dim(&self) -> usize {
        self.num_categories + 1 + self.fourier_width
    }

    pub fn num_categories(&self) -> usize {
        self.num_categories
    }

    pub fn fourier_width(&self) -> usize {
        self.fourier_width
    }

    pub fn alpha(&self) -> usize {
        0
    }

    pub fn beta_raw(&self) -> std::ops::Range<usize> {
        1..self.num_categories
    }

    pub fn delta(&self) -> usize {
        self.num_categories
    }

    pub fn gamma(&self) -> std::ops::Range<usize> {
        self.num_categories + 1..self.dim()
    }

    /// Index of the free coefficient for a 1-based day-of-week, `None` for the baseline.
    pub fn beta_index(&self, dow: usize) -> Option<usize> {
        debug_assert!((1..=self.num_categories).contains(&dow));
        if dow == 1 {
            None
        } else {
            Some(dow - 1)
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dim());
        names.push("alpha".to_string());
        names.extend((2..=self.num_categories).map(|k| format!("beta[{}]", k)));
        names.push("delta".to_string());
        names.extend((1..=self.fourier_width).map(|j| format!("gamma[{}]", j)));
        names
    }

    pub fn split<'a>(&self, position: &'a [f64]) -> Parameters<'a> {
        assert!(position.len() == self.dim());
        Parameters {
            layout: *self,
            alpha: position[self.alpha()],
            beta_raw: &position[self.beta_raw()],
            delta: position[self.delta()],
            gamma: &position[self.gamma()],
        }
    }
}

/// Read-only view of one parameter vector.
#[derive(Debug, Clone, Copy)]
pub struct Parameters<'a> {
    layout: ParameterLayout,
    pub alpha: f64,
    pub beta_raw: &'a [f64],
    pub delta: f64,
    pub gamma: &'a [f64],
}

impl Parameters<'_> {
    /// Day-of-week effect for a 1-based category; the baseline is exactly zero.
    pub fn beta(&self, dow: usize) -> f64 {
        match self.layout.beta_index(dow) {
            None => 0.,
            Some(idx) => self.beta_raw[idx - 1],
        }
    }

    /// The full K-vector `[0, β_raw...]`.
    pub fn full_beta(&self) -> Vec<f64> {
        std::iter::once(0.)
            .chain(self.beta_raw.iter().copied())
            .collect()
    }

    /// Linear predictor `α + β[dow] + δ·t + γ·fourier_row`.
    pub fn log_rate(&self, dow: usize, t: f64, fourier_row: &[f64]) -> f64 {
        let seasonal = if self.gamma.is_empty() {
            0.
        } else {
            vector_dot(self.gamma, fourier_row)
        };
        self.alpha + self.beta(dow) + self.delta * t + seasonal
    }
}

/// Normal prior scales and the overflow guard for `exp(log λ)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Priors {
    pub alpha_scale: f64,
    pub beta_scale: f64,
    pub delta_scale: f64,
    pub gamma_scale: f64,
    /// `log λ` is capped at this value before exponentiating.
    pub log_rate_cap: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            alpha_scale: 5.,
            beta_scale: 2.,
            delta_scale: 2.,
            gamma_scale: 1.,
            log_rate_cap: 30.,
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Log density is not finite: {0}")]
    NonFiniteLogp(f64),
    #[error("Gradient is not finite at coordinate {0}")]
    NonFiniteGradient(usize),
    #[error("Position has dimension {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

impl LogpError for ModelError {
    fn is_recoverable(&self) -> bool {
        match self {
            ModelError::NonFiniteLogp(_) | ModelError::NonFiniteGradient(_) => true,
            ModelError::DimensionMismatch { .. } => false,
        }
    }
}

/// Posterior density of the day-of-week / trend / seasonality Poisson model.
#[derive(Debug, Clone)]
pub struct PoissonRegression {
    data: Arc<Dataset>,
    layout: ParameterLayout,
    priors: Priors,
    arch: pulp::Arch,
}

impl PoissonRegression {
    pub fn new(data: Arc<Dataset>) -> Self {
        Self::with_priors(data, Priors::default())
    }

    pub fn with_priors(data: Arc<Dataset>, priors: Priors) -> Self {
        let layout = data.layout();
        Self {
            data,
            layout,
            priors,
            arch: pulp::Arch::new(),
        }
    }

    pub fn data(&self) -> &Arc<Dataset> {
        &self.data
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    fn prior_logp(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let Priors {
            alpha_scale,
            beta_scale,
            delta_scale,
            gamma_scale,
            ..
        } = self.priors;
        let layout = self.layout;
        let mut logp = 0f64;

        let mut normal = |idx: usize, scale: f64| {
            let x = position[idx];
            let var = scale * scale;
            logp -= 0.5 * x * x / var;
            gradient[idx] = -x / var;
        };

        normal(layout.alpha(), alpha_scale);
        layout.beta_raw().for_each(|idx| normal(idx, beta_scale));
        normal(layout.delta(), delta_scale);
        layout.gamma().for_each(|idx| normal(idx, gamma_scale));

        logp
    }

    fn likelihood_logp(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let layout = self.layout;
        let params = layout.split(position);
        let cap = self.priors.log_rate_cap;
        let data = &self.data;

        self.arch.dispatch(|| {
            let mut logp = 0f64;
            let mut grad_alpha = 0f64;
            let mut grad_delta = 0f64;
            let mut grad_beta = vec![0f64; layout.num_categories()];
            let mut grad_gamma = vec![0f64; layout.fourier_width()];

            for (y, dow, t, row) in data.rows() {
                let y = y as f64;
                let log_rate = params.log_rate(dow, t, row);
                let rate = log_rate.min(cap).exp();
                logp += y * log_rate - rate;

                let resid = y - rate;
                grad_alpha += resid;
                grad_beta[dow - 1] += resid;
                grad_delta += resid * t;
                izip!(grad_gamma.iter_mut(), row).for_each(|(g, &x)| *g = resid.mul_add(x, *g));
            }

            gradient[layout.alpha()] += grad_alpha;
            layout
                .beta_raw()
                .zip(grad_beta.iter().skip(1))
                .for_each(|(idx, &g)| gradient[idx] += g);
            gradient[layout.delta()] += grad_delta;
            layout
                .gamma()
                .zip(grad_gamma.iter())
                .for_each(|(idx, &g)| gradient[idx] += g);
            logp
        })
    }
}

impl CpuLogpFunc for PoissonRegression {
    type LogpError = ModelError;

    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.layout.names()
    }

    /// A starting point near the data: α at the log of the mean count,
    /// everything else uniform in `(-jitter, jitter)`.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, jitter: f64, position: &mut [f64]) {
        assert!(position.len() == self.layout.dim());
        let mean_count =
            self.data.counts().iter().map(|&y| y as f64).sum::<f64>() / self.data.len() as f64;
        position.iter_mut().for_each(|x| {
            *x = if jitter > 0. {
                rng.random_range(-jitter..jitter)
            } else {
                0.
            }
        });
        position[self.layout.alpha()] += (mean_count + 0.5).ln();
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, ModelError> {
        if position.len() != self.dim() || gradient.len() != self.dim() {
            return Err(ModelError::DimensionMismatch {
                expected: self.dim(),
                found: position.len(),
            });
        }
        let logp = self.prior_logp(position, gradient) + self.likelihood_logp(position, gradient);

        if !logp.is_finite() {
            return Err(ModelError::NonFiniteLogp(logp));
        }
        if let Some(idx) = gradient.iter().position(|g| !g.is_finite()) {
            return Err(ModelError::NonFiniteGradient(idx));
        }
        Ok(logp)
    }
}

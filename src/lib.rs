//! Bayesian forecasting of daily counts.
//!
//! Counts are modelled as Poisson with
//! `log λ = α + β[dow] + δ·t + γ·fourier(t)`, where the first day-of-week
//! category is the baseline with `β[1] = 0`. The posterior is sampled with
//! the No-U-Turn Sampler, warmup adapts step size and mass matrix, and
//! posterior draws are turned into forecast distributions.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nuts_forecast::{
//!     sample, ConvergenceThresholds, Dataset, FourierBasis, ForecastPoint, PoissonRegression,
//!     PosteriorPredictive, SamplerSettings, TimeScaler,
//! };
//!
//! let days: Vec<f64> = (0..56).map(|d| d as f64).collect();
//! let counts: Vec<u64> = days.iter().map(|&d| 10 + (d as u64 % 7)).collect();
//! let dow: Vec<usize> = days.iter().map(|&d| d as usize % 7 + 1).collect();
//!
//! let scaler = TimeScaler::fit(&days);
//! let basis = FourierBasis::new(365.25, 2);
//! let data = Dataset::new(counts, dow, scaler.transform_all(&days), basis.matrix(&days))?;
//! let model = PoissonRegression::new(Arc::new(data));
//!
//! let settings = SamplerSettings {
//!     num_tune: 500,
//!     num_draws: 500,
//!     seed: 42,
//!     ..Default::default()
//! };
//! let trace = sample(&model, &settings)?;
//! let report = ConvergenceThresholds::default().check(&trace);
//! println!("convergence: {}", report.status);
//!
//! let next = ForecastPoint::new(1, scaler.transform(56.), basis.row(56.));
//! let forecast = PosteriorPredictive::for_model(&model, Default::default())
//!     .predict(&trace, &[next])?;
//! println!("{:.1} ({:.0}, {:.0})", forecast[0].mean, forecast[0].lower, forecast[0].upper);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod diagnostics;
pub(crate) mod features;
pub(crate) mod forecast;
pub(crate) mod hamiltonian;
pub(crate) mod integrator;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod nuts;
pub(crate) mod sampler;
pub(crate) mod state;
pub(crate) mod stepsize;

pub use adapt_strategy::{AdaptOptions, WarmupSchedule};
pub use chain::{
    AbortPolicy, Chain, ChainOutput, ChainRunner, ChainStatus, Draw, InterruptReason,
};
pub use diagnostics::{
    ebfmi, ess, ess_bulk, ess_tail, r_hat, split_r_hat, summarize, ConvergenceReport,
    ConvergenceStatus, ConvergenceThresholds, ConvergenceWarning, Diagnostics, ParameterSummary,
};
pub use features::{fourier_row, FourierBasis, TimeScaler};
pub use forecast::{
    ForecastError, ForecastOptions, ForecastPoint, ForecastSummary, PosteriorPredictive,
};
pub use hamiltonian::DivergenceInfo;
pub use integrator::Direction;
pub use mass_matrix::{MassMatrixKind, Regularization};
pub use model::{
    CpuLogpFunc, Dataset, DatasetError, ModelError, ParameterLayout, Parameters,
    PoissonRegression, Priors, DAYS_PER_WEEK,
};
pub use nuts::{LogpError, NutsError, NutsOptions, SampleInfo};
pub use sampler::{
    sample, sample_sequentially, sample_with_control, ChainFailure, RunControl, SamplerSettings,
    SettingsError, Trace,
};
pub use stepsize::{DualAverage, DualAverageSettings};

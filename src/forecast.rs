//! Posterior predictive simulation of future counts.

use log::debug;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use thiserror::Error;

use crate::{
    math::{mean_and_variance, quantile_sorted},
    model::{ParameterLayout, PoissonRegression},
    sampler::Trace,
};

/// A future observation to predict.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    /// 1-based day-of-week category.
    pub dow: usize,
    /// Scaled time index, on the scale used for fitting.
    pub t: f64,
    pub fourier: Vec<f64>,
}

impl ForecastPoint {
    pub fn new(dow: usize, t: f64, fourier: Vec<f64>) -> Self {
        Self { dow, t, fourier }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("Forecast point {index} has day of week {dow}, expected 1..={categories}")]
    DowOutOfRange {
        index: usize,
        dow: usize,
        categories: usize,
    },
    #[error("Forecast point {index} has {found} Fourier terms, expected {expected}")]
    FourierWidth {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("Forecast point {index} has a non-finite time index")]
    NonFiniteTime { index: usize },
    #[error("Trace has {found} coordinates, the model has {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("No posterior draws are available for prediction")]
    NoDraws,
    #[error("Interval ({lower}, {upper}) is not a pair of increasing probabilities")]
    Interval { lower: f64, upper: f64 },
    #[error("Poisson rate {0} is not finite")]
    InvalidRate(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastOptions {
    /// Lower quantile of the reported interval.
    pub lower: f64,
    /// Upper quantile of the reported interval.
    pub upper: f64,
    /// Skip draws flagged as divergent.
    pub exclude_divergent: bool,
    /// Seed of the simulation. Chain `i` uses stream `i`.
    pub seed: u64,
    /// Ceiling on `log λ`, the same guard the model applies.
    pub log_rate_cap: f64,
}

impl Default for ForecastOptions {
    fn default() -> Self {
        Self {
            lower: 0.025,
            upper: 0.975,
            exclude_divergent: false,
            seed: 0,
            log_rate_cap: 30.,
        }
    }
}

/// The predictive distribution at one forecast point.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSummary {
    pub point: ForecastPoint,
    /// Mean of the simulated counts.
    pub mean: f64,
    pub sd: f64,
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
    /// Mean of `λ` over the draws, the expectation without Poisson noise.
    pub expected_rate: f64,
    /// One simulated count per posterior draw.
    pub samples: Vec<u64>,
}

/// Maps posterior draws to forecast distributions.
#[derive(Debug, Clone)]
pub struct PosteriorPredictive {
    layout: ParameterLayout,
    options: ForecastOptions,
}

impl PosteriorPredictive {
    pub fn new(layout: ParameterLayout) -> Self {
        Self::with_options(layout, ForecastOptions::default())
    }

    pub fn with_options(layout: ParameterLayout, options: ForecastOptions) -> Self {
        Self { layout, options }
    }

    /// Predict with the layout and rate cap of a fitted model.
    pub fn for_model(model: &PoissonRegression, options: ForecastOptions) -> Self {
        Self::with_options(
            model.layout(),
            ForecastOptions {
                log_rate_cap: model.priors().log_rate_cap,
                ..options
            },
        )
    }

    pub fn options(&self) -> &ForecastOptions {
        &self.options
    }

    fn validate(&self, trace: &Trace, points: &[ForecastPoint]) -> Result<(), ForecastError> {
        let ForecastOptions { lower, upper, .. } = self.options;
        if !(0. ..=1.).contains(&lower) || !(0. ..=1.).contains(&upper) || lower > upper {
            return Err(ForecastError::Interval { lower, upper });
        }
        if trace.dim() != self.layout.dim() {
            return Err(ForecastError::DimensionMismatch {
                expected: self.layout.dim(),
                found: trace.dim(),
            });
        }
        if let Some(draw) = trace
            .draws()
            .find(|draw| draw.position.len() != self.layout.dim())
        {
            return Err(ForecastError::DimensionMismatch {
                expected: self.layout.dim(),
                found: draw.position.len(),
            });
        }
        for (index, point) in points.iter().enumerate() {
            let categories = self.layout.num_categories();
            if !(1..=categories).contains(&point.dow) {
                return Err(ForecastError::DowOutOfRange {
                    index,
                    dow: point.dow,
                    categories,
                });
            }
            if point.fourier.len() != self.layout.fourier_width() {
                return Err(ForecastError::FourierWidth {
                    index,
                    expected: self.layout.fourier_width(),
                    found: point.fourier.len(),
                });
            }
            if !point.t.is_finite() {
                return Err(ForecastError::NonFiniteTime { index });
            }
        }
        Ok(())
    }

    /// Simulate one count per retained draw and forecast point, then summarize.
    ///
    /// Draws of chain `i` are simulated with stream `i` of the configured seed,
    /// so the result only depends on the trace and the options.
    pub fn predict(
        &self,
        trace: &Trace,
        points: &[ForecastPoint],
    ) -> Result<Vec<ForecastSummary>, ForecastError> {
        self.validate(trace, points)?;

        let mut samples: Vec<Vec<u64>> = vec![Vec::new(); points.len()];
        let mut rates: Vec<Vec<f64>> = vec![Vec::new(); points.len()];

        for chain in trace.chains.iter() {
            let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed);
            rng.set_stream(chain.chain);

            let retained = chain
                .draws
                .iter()
                .filter(|draw| !(self.options.exclude_divergent && draw.diverging));
            for draw in retained {
                let params = self.layout.split(&draw.position);
                for (i, point) in points.iter().enumerate() {
                    let log_rate = params
                        .log_rate(point.dow, point.t, &point.fourier)
                        .min(self.options.log_rate_cap);
                    let rate = log_rate.exp();
                    samples[i].push(simulate_count(rate, &mut rng)?);
                    rates[i].push(rate);
                }
            }
        }

        if points.first().is_some_and(|_| samples[0].is_empty()) {
            return Err(ForecastError::NoDraws);
        }
        debug!(
            "simulated {} forecast points from {} chains",
            points.len(),
            trace.chains.len()
        );

        Ok(points
            .iter()
            .cloned()
            .zip(samples)
            .zip(rates)
            .map(|((point, samples), rates)| self.summarize(point, samples, &rates))
            .collect())
    }

    fn summarize(&self, point: ForecastPoint, samples: Vec<u64>, rates: &[f64]) -> ForecastSummary {
        let mut counts: Vec<f64> = samples.iter().map(|&y| y as f64).collect();
        let (mean, var) = mean_and_variance(&counts);
        counts.sort_by(f64::total_cmp);
        ForecastSummary {
            point,
            mean,
            sd: var.sqrt(),
            lower: quantile_sorted(&counts, self.options.lower),
            median: quantile_sorted(&counts, 0.5),
            upper: quantile_sorted(&counts, self.options.upper),
            expected_rate: rates.iter().sum::<f64>() / rates.len() as f64,
            samples,
        }
    }
}

fn simulate_count<R: rand::Rng + ?Sized>(rate: f64, rng: &mut R) -> Result<u64, ForecastError> {
    if !rate.is_finite() {
        return Err(ForecastError::InvalidRate(rate));
    }
    // Underflow of exp(log λ) leaves a point mass at zero
    if rate <= 0. {
        return Ok(0);
    }
    let poisson = Poisson::new(rate).map_err(|_| ForecastError::InvalidRate(rate))?;
    Ok(poisson.sample(rng) as u64)
}

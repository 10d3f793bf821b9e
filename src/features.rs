//! Design-matrix helpers for the seasonal and trend terms.
//!
//! Callers build the Fourier block of a [`Dataset`](crate::Dataset) and of
//! every [`ForecastPoint`](crate::ForecastPoint) from the same
//! [`FourierBasis`] and [`TimeScaler`], so fit and forecast share one
//! encoding of time.

use std::f64::consts::PI;

/// Sine/cosine pairs for `harmonics` harmonics of a cycle of length `period`.
///
/// The row is laid out as `[sin(2πt/P), cos(2πt/P), sin(4πt/P), cos(4πt/P), ...]`
/// and has length `2 * harmonics`.
pub fn fourier_row(t: f64, period: f64, harmonics: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(2 * harmonics);
    let phase = 2. * PI * t.rem_euclid(period) / period;
    for k in 1..=harmonics {
        let angle = (k as f64) * phase;
        row.push(angle.sin());
        row.push(angle.cos());
    }
    row
}

/// Annual (or any other fixed period) Fourier seasonality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FourierBasis {
    /// Length of one cycle in the unit of the raw time values, e.g. 365.25 days.
    pub period: f64,
    /// Number of harmonics S. Rows have 2S columns.
    pub harmonics: usize,
}

impl Default for FourierBasis {
    fn default() -> Self {
        Self {
            period: 365.25,
            harmonics: 5,
        }
    }
}

impl FourierBasis {
    pub fn new(period: f64, harmonics: usize) -> Self {
        Self { period, harmonics }
    }

    pub fn width(&self) -> usize {
        2 * self.harmonics
    }

    pub fn row(&self, t: f64) -> Vec<f64> {
        fourier_row(t, self.period, self.harmonics)
    }

    pub fn matrix(&self, times: &[f64]) -> Vec<Vec<f64>> {
        times.iter().map(|&t| self.row(t)).collect()
    }
}

/// Affine map from raw day numbers to the scaled trend index `(t - offset) / scale`.
///
/// Fit it on the training range and reuse it unchanged for forecast points,
/// otherwise the trend coefficient is applied on the wrong scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeScaler {
    pub offset: f64,
    pub scale: f64,
}

impl Default for TimeScaler {
    fn default() -> Self {
        Self {
            offset: 0.,
            scale: 1.,
        }
    }
}

impl TimeScaler {
    /// Map the training range onto `[0, 1]`.
    ///
    /// A degenerate range (fewer than two distinct values) keeps unit scale.
    pub fn fit(times: &[f64]) -> Self {
        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !min.is_finite() || !max.is_finite() {
            return Self::default();
        }
        let span = max - min;
        let scale = if span > 0. { span } else { 1. };
        Self { offset: min, scale }
    }

    pub fn transform(&self, t: f64) -> f64 {
        (t - self.offset) / self.scale
    }

    pub fn transform_all(&self, times: &[f64]) -> Vec<f64> {
        times.iter().map(|&t| self.transform(t)).collect()
    }
}

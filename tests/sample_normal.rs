use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use itertools::Itertools;
use nuts_forecast::{
    r_hat, sample, sample_sequentially, sample_with_control, AbortPolicy, ConvergenceStatus,
    ConvergenceThresholds, CpuLogpFunc, LogpError, MassMatrixKind, RunControl, SamplerSettings,
};
use pretty_assertions::assert_eq;
use thiserror::Error;

#[derive(Clone)]
struct NormalLogp {
    mu: Vec<f64>,
    sigma: Vec<f64>,
}

#[derive(Error, Debug)]
enum NormalLogpError {}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

impl CpuLogpFunc for NormalLogp {
    type LogpError = NormalLogpError;

    fn dim(&self) -> usize {
        self.mu.len()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        let n = position.len();
        assert!(grad.len() == n);
        let mut logp = 0f64;

        position
            .iter()
            .zip(self.mu.iter())
            .zip(self.sigma.iter())
            .zip(grad.iter_mut())
            .for_each(|(((&p, &mu), &sigma), grad)| {
                let diff = (p - mu) / sigma;
                logp -= diff * diff / 2.;
                *grad = -diff / sigma;
            });
        Ok(logp)
    }
}

fn model() -> NormalLogp {
    NormalLogp {
        mu: vec![0.1, -1., 3., 0.],
        sigma: vec![1., 0.1, 10., 2.],
    }
}

#[test]
fn sample_scaled_normal() -> Result<()> {
    let settings = SamplerSettings {
        num_tune: 500,
        num_draws: 500,
        seed: 42,
        ..Default::default()
    };
    let trace = sample(&model(), &settings)?;
    assert_eq!(trace.succeeded_chains(), vec![0, 1, 2, 3]);

    let report = ConvergenceThresholds {
        max_r_hat: 1.05,
        ..Default::default()
    }
    .check(&trace);
    assert_eq!(report.status, ConvergenceStatus::Ok, "{:?}", report.warnings);

    for (summary, (&mu, &sigma)) in report
        .diagnostics
        .parameters
        .iter()
        .zip(model().mu.iter().zip(model().sigma.iter()))
    {
        assert!(
            (summary.mean - mu).abs() < 0.2 * sigma,
            "{}: {} vs {}",
            summary.name,
            summary.mean,
            mu
        );
        assert!((summary.sd / sigma - 1.).abs() < 0.2, "{}", summary.name);
    }

    // The adapted metric follows the posterior scales
    for chain in trace.chains.iter() {
        let diag = &chain.mass_matrix_diag;
        assert!(diag[1] < diag[0]);
        assert!(diag[0] < diag[2]);
    }
    Ok(())
}

#[test]
fn dense_mass_matrix() -> Result<()> {
    let settings = SamplerSettings {
        num_chains: 2,
        num_tune: 400,
        num_draws: 400,
        mass_matrix: MassMatrixKind::Dense,
        seed: 3,
        ..Default::default()
    };
    let trace = sample(&model(), &settings)?;
    for index in 0..4 {
        let series = trace.parameter_series(index);
        let chains = series.iter().map(|chain| chain.as_slice()).collect_vec();
        assert!(r_hat(&chains) < 1.1);
    }
    Ok(())
}

#[test]
fn chains_are_deterministic() -> Result<()> {
    let settings = SamplerSettings {
        num_chains: 2,
        num_tune: 100,
        num_draws: 100,
        seed: 11,
        ..Default::default()
    };
    let a = sample(&model(), &settings)?;
    let b = sample(&model(), &settings)?;
    for (a, b) in a.chains.iter().zip_eq(b.chains.iter()) {
        assert_eq!(a.draws, b.draws);
        assert_eq!(a.step_size, b.step_size);
    }

    let sequential = sample_sequentially(model(), &settings, &[0.; 4], 200, 1)?
        .map_ok(|draw| draw.position)
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(sequential.len(), 200);
    Ok(())
}

#[test]
fn deadline_stops_all_chains() -> Result<()> {
    let settings = SamplerSettings {
        num_chains: 2,
        num_tune: 1_000_000,
        num_draws: 1000,
        ..Default::default()
    };
    let start = Instant::now();
    let control = RunControl {
        deadline: Some(start + Duration::from_millis(200)),
        policy: AbortPolicy::Retain,
        ..Default::default()
    };
    let trace = sample_with_control(&model(), &settings, control)?;
    assert!(start.elapsed() < Duration::from_secs(60));
    assert_eq!(trace.chains.len(), 2);
    assert!(trace.chains.iter().all(|chain| !chain.is_complete()));
    assert!(trace.chains.iter().all(|chain| !chain.warmup.is_empty()));
    assert!(trace.chains.iter().all(|chain| chain.draws.is_empty()));

    let report = ConvergenceThresholds::default().check(&trace);
    assert_eq!(report.status, ConvergenceStatus::Warn);
    Ok(())
}

#[test]
fn abort_flag_from_another_thread() -> Result<()> {
    let settings = SamplerSettings {
        num_chains: 2,
        num_tune: 1_000_000,
        num_draws: 1000,
        ..Default::default()
    };
    let flag = Arc::new(AtomicBool::new(false));
    let setter = {
        let flag = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::Relaxed);
        })
    };
    let control = RunControl {
        abort: Some(flag),
        policy: AbortPolicy::Discard,
        ..Default::default()
    };
    let trace = sample_with_control(&model(), &settings, control)?;
    setter.join().unwrap();
    assert!(trace.chains.iter().all(|chain| chain.warmup.is_empty()));
    Ok(())
}

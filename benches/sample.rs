use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use nuts_forecast::{
    sample_sequentially, CpuLogpFunc, Dataset, FourierBasis, PoissonRegression, SamplerSettings,
    TimeScaler,
};

fn make_model(n: usize) -> PoissonRegression {
    let days: Vec<f64> = (0..n).map(|d| d as f64).collect();
    let basis = FourierBasis::new(365.25, 5);
    let counts = (0..n).map(|d| 5 + (d % 7) as u64).collect();
    let dow = (0..n).map(|d| d % 7 + 1).collect();
    let time = TimeScaler::fit(&days).transform_all(&days);
    let data = Dataset::new(counts, dow, time, basis.matrix(&days)).unwrap();
    PoissonRegression::new(Arc::new(data))
}

fn criterion_benchmark(c: &mut Criterion) {
    for n in [400, 4000] {
        let mut model = make_model(n);
        let position = vec![0.01; model.dim()];
        let mut grad = vec![0.; model.dim()];
        c.bench_function(&format!("logp poisson {}", n), |b| {
            b.iter(|| model.logp(black_box(&position), black_box(&mut grad)).unwrap())
        });
    }

    let model = make_model(400);
    let settings = SamplerSettings {
        num_tune: 100,
        seed: 42,
        ..Default::default()
    };
    let init = vec![1.5; model.dim()];
    c.bench_function("sample poisson 400", |b| {
        b.iter_batched(
            || model.clone(),
            |model| {
                sample_sequentially(model, &settings, &init, 200, 0)
                    .unwrap()
                    .for_each(|draw| {
                        black_box(draw.unwrap());
                    })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

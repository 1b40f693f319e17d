//! Benchmarks for the preprocessing and windowing path.

use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use neuroauth_core::utils::Xorshift64;
use neuroauth_core::Trial;
use neuroauth_signal::preprocess::{PreprocessConfig, Preprocessor};
use neuroauth_signal::windowing::WindowConfig;

fn synthetic_trial(fs: f32, seconds: f32) -> Trial {
    let n = (fs * seconds) as usize;
    let mut rng = Xorshift64::new(42);
    let data = Array2::from_shape_fn((48, n), |(channel, sample)| {
        let t = sample as f32 / fs;
        (2.0 * std::f32::consts::PI * (10.0 + channel as f32 * 0.05) * t).sin()
            + 0.1 * rng.next_gaussian()
    });
    Trial::new(data, fs).unwrap()
}

fn bench_preprocess(c: &mut Criterion) {
    let trial = synthetic_trial(512.0, 4.0);
    let fast = Preprocessor::new(PreprocessConfig::fast()).unwrap();

    c.bench_function("preprocess_fast_4s_48ch", |b| {
        b.iter(|| fast.run(&trial).unwrap())
    });
}

fn bench_windowing(c: &mut Criterion) {
    let trial = synthetic_trial(512.0, 30.0);
    let preprocessor = Preprocessor::new(PreprocessConfig::fast()).unwrap();
    let processed = preprocessor.run(&trial).unwrap();
    let config = WindowConfig::default();

    c.bench_function("window_30s_trial", |b| {
        b.iter(|| config.slide(&processed).unwrap())
    });
}

criterion_group!(benches, bench_preprocess, bench_windowing);
criterion_main!(benches);

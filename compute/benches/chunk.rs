//! Chunk stepping throughput on a recurrent LIF population

use compute::{BuildResult, Chunk};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use data::{column, Matrix};
use std::{hint::black_box, sync::Once};

// Make sure env_logger is only initialized once
fn init_logger() {
    static INIT_LOGGER: Once = Once::new();
    INIT_LOGGER.call_once(env_logger::init);
}

/// Recurrent population: J ← bias + W·spikes, then a LIF step and a synapse
fn recurrent_chunk(num_neurons: usize) -> BuildResult<Chunk> {
    let mut chunk = Chunk::new("bench", 0.001);
    let weights = Matrix::from_shape_fn((num_neurons, num_neurons), |(i, j)| {
        if i == j {
            0.0
        } else {
            1e-4 * ((i * 31 + j * 17) % 7) as f64
        }
    });
    let bias = (0..num_neurons)
        .map(|i| 1.0 + (i % 10) as f64 / 5.0)
        .collect::<Vec<_>>();
    let zeros = vec![0.0; num_neurons];
    chunk.add_signal(1, "weights", weights)?;
    chunk.add_signal(2, "bias", column(&bias))?;
    chunk.add_signal(3, "J", column(&zeros))?;
    chunk.add_signal(4, "spikes", column(&zeros))?;
    chunk.add_signal(5, "filtered", column(&zeros))?;
    chunk.add_op("Copy;3;2")?;
    chunk.add_op("DotInc;1;5;3")?;
    chunk.add_op(&format!("SimLIF;{num_neurons};0.02;0.002;0.001;3;4"))?;
    chunk.add_op("SimpleSynapse;4;5;-0.99;0.01")?;
    Ok(chunk)
}

fn criterion_benchmark(c: &mut Criterion) {
    init_logger();
    let mut group = c.benchmark_group("chunk::run_n_steps");
    for num_neurons_pow2 in 4..=10 {
        let num_neurons = 2usize.pow(num_neurons_pow2);
        let mut chunk =
            recurrent_chunk(black_box(num_neurons)).expect("Failed to build benchmark chunk");
        group.throughput(Throughput::Elements(num_neurons as u64));
        group.bench_function(
            BenchmarkId::from_parameter(format!("{num_neurons}neurons")),
            |b| b.iter(|| chunk.run_n_steps(1).expect("Local steps cannot fail")),
        );
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

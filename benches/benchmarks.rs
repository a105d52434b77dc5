use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use keccak_trails::{DcOrLc, KeccakF, KeccakFDcLc, Propagation};

fn permutation_benchmarks(c: &mut Criterion) {
    let mut g = c.benchmark_group("permutation");

    for width in [200, 1600] {
        let f = KeccakF::new(width).unwrap();
        let mut state = [0u64; 25];
        for (i, lane) in state.iter_mut().enumerate() {
            *lane = (0x9E3779B97F4A7C15u64.wrapping_mul(i as u64 + 1)) & f.lane_mask();
        }
        g.bench_function(format!("forward-{width}"), |b| {
            b.iter_batched(
                || state,
                |mut s| {
                    f.forward(&mut s);
                    s
                },
                BatchSize::SmallInput,
            )
        });
        g.bench_function(format!("inverse-{width}"), |b| {
            b.iter_batched(
                || state,
                |mut s| {
                    f.inverse(&mut s);
                    s
                },
                BatchSize::SmallInput,
            )
        });
    }
    g.finish();
}

fn propagation_benchmarks(c: &mut Criterion) {
    let mut g = c.benchmark_group("propagation");
    let cache = std::env::temp_dir();
    let dclc = KeccakFDcLc::with_cache_dir(200, &cache).unwrap();
    let dc = Propagation::new(&dclc, DcOrLc::Dc);

    let mut state = vec![0u32; dc.lane_size()];
    state[0] = 0x0000_0421;
    state[3] = 0x0150_0003;
    state[7] = 0x0000_8800;

    g.bench_function("lambda-200", |b| b.iter(|| dc.direct_lambda(&state)));
    g.bench_function("weight-200", |b| b.iter(|| dc.weight(&state)));
    g.bench_function("state-base-200", |b| {
        b.iter(|| dc.build_state_base(&state, true))
    });
    g.finish();
}

criterion_group!(benches, permutation_benchmarks, propagation_benchmarks);
criterion_main!(benches);

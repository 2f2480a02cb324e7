use std::time::Instant;

use candle_dq_kernels::{
    pad_to, ComputePrimitive, MmSoftmaxArgs, MmSoftmaxBatch, MmSoftmaxParam, PackKey,
    PackKeyArgs, PackKeyParam, TileConfig, TileConfigure, TileParam,
};
use criterion::{black_box, criterion_group, Criterion, Throughput};
use rand::prelude::*;

// One 16 rows query tile against all the keys of a 12 heads batch.
const HEADS: usize = 12;
const HEAD_SIZE: usize = 64;
const N: usize = 384;

fn run_pack_key_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let ld = HEADS * HEAD_SIZE;
    let key: Vec<i8> = (0..N * ld).map(|_| rng.random_range(-127..=127)).collect();
    let mut packed = vec![0i8; pad_to(N, 64) * pad_to(HEAD_SIZE, 64)];
    let pack = PackKey::build(PackKeyParam::default()).unwrap();

    let mut group = c.benchmark_group("pack_key_ab16a4b");
    group.throughput(Throughput::Bytes((N * HEAD_SIZE) as u64));
    group.bench_function("head", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                for j in (0..N).step_by(16) {
                    pack.call(PackKeyArgs {
                        src: black_box(&key[j * ld..]),
                        dst: &mut packed[j * HEAD_SIZE..],
                        ld_src: ld,
                        rows: (N - j).min(16),
                        cols: HEAD_SIZE,
                    });
                }
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn run_mm_softmax_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let ld = HEADS * HEAD_SIZE;
    let n_pad64 = pad_to(N, 64);
    let head_k = n_pad64 * HEAD_SIZE;
    let query: Vec<i8> = (0..16 * ld).map(|_| rng.random_range(-127..=127)).collect();
    let key: Vec<i8> = (0..HEADS * head_k).map(|_| rng.random_range(-127..=127)).collect();
    let q_scale = vec![0.002f32; 16];
    let k_scale = vec![0.002f32; N];
    let mask = vec![0f32; N];
    let mut probs = vec![0u8; HEADS * 16 * n_pad64];
    let mut acc = vec![0f32; N];

    let qk = MmSoftmaxBatch::build(MmSoftmaxParam {
        pre_tile: Some(TileParam::FULL_INT8),
    })
    .unwrap();
    let cfg = TileConfig::new(TileParam::FULL_INT8).unwrap();
    let tile = TileConfigure::build(()).unwrap();

    let mut group = c.benchmark_group("mm_softmax_batch_s8s8_u8");
    group.throughput(Throughput::Elements((HEADS * 16 * N * HEAD_SIZE) as u64));
    group.bench_function("tile", |b| {
        let _scope = tile.scope(&cfg);
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                qk.call(MmSoftmaxArgs {
                    src0: black_box(&query),
                    src1: &key,
                    scale_src0: &q_scale,
                    scale_src1: &k_scale,
                    src_bias: &mask,
                    dst: &mut probs,
                    acc: &mut acc,
                    m: 16,
                    k: HEAD_SIZE,
                    n: N,
                    ld_src0: ld,
                    ld_src1: 16 * HEAD_SIZE,
                    ld_dst: n_pad64,
                    batch_size: HEADS,
                    batchstep_src0: HEAD_SIZE,
                    batchstep_src0scale: 0,
                    batchstep_src1: head_k,
                    batchstep_src1scale: 0,
                    batchstep_dst: 16 * n_pad64,
                });
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    run_pack_key_benchmark(c);
    run_mm_softmax_benchmark(c);
}

criterion_group!(benches, criterion_benchmark);

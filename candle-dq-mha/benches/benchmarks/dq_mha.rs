use std::sync::Arc;
use std::time::Instant;

use candle_dq_mha::test_utils::{mha_op_desc, workspace, MhaInputs};
use candle_dq_mha::{DynamicQuantMha, KernelDesc, ProblemShape};
use criterion::{black_box, criterion_group, Criterion, Throughput};

use crate::benchmarks::{macs, SHAPES};

fn run_dq_mha_benchmark(c: &mut Criterion, name: &str, shape: ProblemShape) {
    let kd = KernelDesc::new(mha_op_desc(&shape));
    let mha = DynamicQuantMha::new(Arc::new(kd)).unwrap();
    let inputs = MhaInputs::random(shape, 0);
    let mut output = vec![0i8; shape.query_elem_count()];
    let mut output_scale = vec![0f32; shape.batch_size * shape.m];
    let mut ws = workspace(mha.workspace_size(&shape));

    let mut group = c.benchmark_group(format!("dq_mha_{name}"));
    group.throughput(Throughput::Elements(macs(&shape)));
    group.bench_function(format!("threads_{}", mha.num_threads()), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                mha.execute(black_box(inputs.args(
                    &mut output,
                    &mut output_scale,
                    bytemuck::cast_slice_mut(&mut ws),
                )))
                .unwrap();
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    for (name, shape) in SHAPES {
        run_dq_mha_benchmark(c, name, shape);
    }
}

criterion_group!(benches, criterion_benchmark);

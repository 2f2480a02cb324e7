pub(crate) mod dq_mha;
pub(crate) mod primitives;

use candle_dq_mha::ProblemShape;

/// Bert-base like problems, prefill and decode.
pub(crate) const SHAPES: [(&str, ProblemShape); 3] = [
    ("b1_s128", shape(1, 12, 128, 128, 64)),
    ("b4_s384", shape(4, 12, 384, 384, 64)),
    ("b8_q16_kv512", shape(8, 12, 16, 512, 64)),
];

const fn shape(batch_size: usize, head_num: usize, m: usize, n: usize, head_size: usize) -> ProblemShape {
    ProblemShape {
        batch_size,
        head_num,
        m,
        n,
        head_size,
    }
}

/// Int8 multiply-accumulates of the two attention matmuls.
pub(crate) fn macs(shape: &ProblemShape) -> u64 {
    (2 * shape.batch_size * shape.head_num * shape.m * shape.n * shape.head_size) as u64
}

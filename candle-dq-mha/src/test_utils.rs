//! Helpers shared by the tests, the benchmarks and the example: random inputs,
//! a float64 reference of the attention and the matching error bound.
use rand::prelude::*;

use crate::kernel_desc::{APPROX_EXP, STABLE_SOFTMAX};
use crate::op_desc::{IoSlot, OperatorDesc, TensorDesc};
use crate::runtime::{DynamicSizes, MhaArgs};
use crate::workspace::ProblemShape;
use crate::DType;

/// A descriptor the kernel accepts for `shape`, with every dimension static.
pub fn mha_op_desc(shape: &ProblemShape) -> OperatorDesc {
    let s = |x: usize| x as i64;
    let (b, h, m, n, d) = (
        s(shape.batch_size),
        s(shape.head_num),
        s(shape.m),
        s(shape.n),
        s(shape.head_size),
    );
    OperatorDesc::new()
        .with_tensor(IoSlot::SrcQ, TensorDesc::new([b, m, h, d], DType::S8))
        .with_tensor(IoSlot::SrcK, TensorDesc::new([b, n, h, d], DType::S8))
        .with_tensor(IoSlot::SrcV, TensorDesc::new([b, n, h, d], DType::S8))
        .with_tensor(IoSlot::Dst, TensorDesc::new([b, m, h, d], DType::S8))
        .with_tensor(IoSlot::BinaryAdd, TensorDesc::new([b, 1, 1, n], DType::F32))
        .with_tensor(IoSlot::QScale, TensorDesc::new([b, m], DType::F32))
        .with_tensor(IoSlot::KScale, TensorDesc::new([b, n], DType::F32))
        .with_tensor(IoSlot::VScale, TensorDesc::new([b, n], DType::F32))
        .with_tensor(IoSlot::DstScale, TensorDesc::new([b, m], DType::F32))
        .with_attr(APPROX_EXP, "True")
        .with_attr(STABLE_SOFTMAX, "False")
}

/// Aligned, zero-initialized workspace of at least `bytes` bytes.
pub fn workspace(bytes: usize) -> Vec<f32> {
    vec![0f32; bytes.div_ceil(4)]
}

/// Host side buffers of one attention problem.
#[derive(Debug, Clone)]
pub struct MhaInputs {
    pub shape: ProblemShape,
    pub query: Vec<i8>,
    pub key: Vec<i8>,
    pub value: Vec<i8>,
    pub mask: Vec<f32>,
    pub query_scale: Vec<f32>,
    pub key_scale: Vec<f32>,
    pub value_scale: Vec<f32>,
}

impl MhaInputs {
    /// Random int8 values over the full range, scales in `[0.001, 0.005)` and a
    /// zero mask.
    pub fn random(shape: ProblemShape, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ints = |len: usize| -> Vec<i8> {
            (0..len).map(|_| rng.random_range(-127..=127)).collect()
        };
        let query = ints(shape.query_elem_count());
        let key = ints(shape.key_elem_count());
        let value = ints(shape.key_elem_count());
        let mut scales = |len: usize| -> Vec<f32> {
            (0..len).map(|_| rng.random_range(0.001..0.005)).collect()
        };
        let query_scale = scales(shape.batch_size * shape.m);
        let key_scale = scales(shape.batch_size * shape.n);
        let value_scale = scales(shape.batch_size * shape.n);
        Self {
            shape,
            query,
            key,
            value,
            mask: vec![0f32; shape.batch_size * shape.n],
            query_scale,
            key_scale,
            value_scale,
        }
    }

    pub fn args<'a>(
        &'a self,
        output: &'a mut [i8],
        output_scale: &'a mut [f32],
        workspace: &'a mut [u8],
    ) -> MhaArgs<'a> {
        MhaArgs {
            query: &self.query,
            key: &self.key,
            value: &self.value,
            mask: &self.mask,
            query_scale: &self.query_scale,
            key_scale: &self.key_scale,
            value_scale: &self.value_scale,
            output,
            output_scale,
            workspace,
            sizes: DynamicSizes::from_shape(&self.shape),
        }
    }

    fn kv_index(&self, b: usize, j: usize, h: usize, c: usize) -> usize {
        let s = &self.shape;
        ((b * s.n + j) * s.head_num + h) * s.head_size + c
    }

    fn dequant_value(&self, b: usize, j: usize, h: usize, c: usize) -> f64 {
        self.value[self.kv_index(b, j, h, c)] as f64 * self.value_scale[b * self.shape.n + j] as f64
    }

    /// Exact attention output `[batch_size, m, head_num, head_size]`, computed
    /// with a max-subtracted softmax in float64.
    pub fn reference(&self) -> Vec<f64> {
        let s = self.shape;
        let mut out = vec![0f64; s.query_elem_count()];
        let mut probs = vec![0f64; s.n];
        for b in 0..s.batch_size {
            for r in 0..s.m {
                for h in 0..s.head_num {
                    let q_row = ((b * s.m + r) * s.head_num + h) * s.head_size;
                    let q_scale = self.query_scale[b * s.m + r] as f64;
                    for (j, p) in probs.iter_mut().enumerate() {
                        let k_row = self.kv_index(b, j, h, 0);
                        let acc: i64 = (0..s.head_size)
                            .map(|c| self.query[q_row + c] as i64 * self.key[k_row + c] as i64)
                            .sum();
                        *p = acc as f64 * q_scale * self.key_scale[b * s.n + j] as f64
                            + self.mask[b * s.n + j] as f64;
                    }
                    let max = probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    probs.iter_mut().for_each(|p| *p = (*p - max).exp());
                    let sum: f64 = probs.iter().sum();
                    for c in 0..s.head_size {
                        out[q_row + c] = probs
                            .iter()
                            .enumerate()
                            .map(|(j, p)| p / sum * self.dequant_value(b, j, h, c))
                            .sum();
                    }
                }
            }
        }
        out
    }

    /// Per element bound on `|dequantized output - reference|`.
    ///
    /// It sums two output quantization steps, the rounding of the probabilities
    /// to `1 / 255` applied to the requantized values and half a step of the
    /// per-column value requantization.
    pub fn tolerance(&self, output_scale: &[f32]) -> Vec<f64> {
        let s = self.shape;
        let mut tol = vec![0f64; s.query_elem_count()];
        for b in 0..s.batch_size {
            for h in 0..s.head_num {
                for c in 0..s.head_size {
                    let values = (0..s.n).map(|j| self.dequant_value(b, j, h, c).abs());
                    let sum: f64 = values.clone().sum();
                    let col_step = values.fold(0f64, f64::max) / 127.;
                    let kernel_err =
                        0.5 / 255. * (sum + 0.5 * col_step * s.n as f64) + 0.5 * col_step;
                    for r in 0..s.m {
                        let out_step = output_scale[b * s.m + r] as f64;
                        let idx = ((b * s.m + r) * s.head_num + h) * s.head_size + c;
                        tol[idx] = 2. * out_step + kernel_err + 1e-6;
                    }
                }
            }
        }
        tol
    }
}

/// Dequantizes a kernel output with its per-row scales.
pub fn dequantize_output(shape: &ProblemShape, output: &[i8], output_scale: &[f32]) -> Vec<f64> {
    let row = shape.head_num * shape.head_size;
    output[..shape.query_elem_count()]
        .chunks_exact(row)
        .zip(output_scale)
        .flat_map(|(vs, &scale)| vs.iter().map(move |&v| v as f64 * scale as f64))
        .collect()
}

//! Fused `softmax x V` with per-channel dequantization and per-row dynamic
//! requantization of the result.
use crate::tile::{check_pre_tile, debug_assert_configured};
use crate::{round_to_i8, ComputePrimitive, Result, TileParam, K_PACK, TILE_ROWS};

/// Scale of the u8 probabilities produced by the fused softmax.
const U8_PROB_SCALE: f32 = 1. / 255.;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmDynamicQuantParam {
    /// Tile configuration the caller programs before invoking the primitive.
    pub pre_tile: Option<TileParam>,
}

/// Arguments of [`MmDynamicQuantBatch`].
///
/// `src0` holds u8 probabilities (row-major), `src1` a sequence of `BA16b4a`
/// blocks (16 output columns each) with one scale per output column. All the
/// `batchstep_*` offsets are counted in elements.
#[derive(Debug)]
pub struct MmDynamicQuantArgs<'a> {
    pub src0: &'a [u8],
    pub src1: &'a [i8],
    pub scale_src1: &'a [f32],
    pub dst: &'a mut [i8],
    /// One scale per row, shared by all the batches of the call.
    pub dst_scale: &'a mut [f32],
    /// Row scratch holding the dequantized values of one row across all the
    /// batches, `batch_size * n` entries. Values that do not fit are computed a
    /// second time when quantizing.
    pub acc: &'a mut [f32],
    /// Number of rows, at most 16.
    pub m: usize,
    /// Reduction size.
    pub k: usize,
    /// Number of output columns per batch.
    pub n: usize,
    pub ld_src0: usize,
    /// Distance between two blocks of `src1`.
    pub ld_src1: usize,
    pub ld_dst: usize,
    pub batch_size: usize,
    pub batchstep_src0: usize,
    pub batchstep_src1: usize,
    pub batchstep_src1scale: usize,
    pub batchstep_dst: usize,
}

/// Computes `(src0 / 255) x dequant(src1)` for every batch, then quantizes each
/// output row with a symmetric scale `absmax / 127` taken over all the batches.
///
/// Rows are processed in two passes, the first one computes the values and the
/// row maximum, the second one quantizes the values kept in `acc`.
#[derive(Debug)]
pub struct MmDynamicQuantBatch {
    pre_tile: Option<TileParam>,
}

impl ComputePrimitive for MmDynamicQuantBatch {
    type Param = MmDynamicQuantParam;
    type Args<'a> = MmDynamicQuantArgs<'a>;

    const NAME: &'static str = "mm_batch_u8s8_dynamic_quant";

    fn build(param: MmDynamicQuantParam) -> Result<Self> {
        check_pre_tile(Self::NAME, param.pre_tile)?;
        Ok(Self {
            pre_tile: param.pre_tile,
        })
    }

    fn call(&self, args: MmDynamicQuantArgs<'_>) {
        debug_assert_configured(Self::NAME, self.pre_tile);
        debug_assert!(args.m <= TILE_ROWS);
        let MmDynamicQuantArgs {
            src0,
            src1,
            scale_src1,
            dst,
            dst_scale,
            acc,
            m,
            k,
            n,
            ld_src0,
            ld_src1,
            ld_dst,
            batch_size,
            batchstep_src0,
            batchstep_src1,
            batchstep_src1scale,
            batchstep_dst,
        } = args;

        let value = |ib: usize, r: usize, c: usize| {
            let probs = &src0[ib * batchstep_src0 + r * ld_src0..][..k];
            let block = &src1[ib * batchstep_src1 + (c / TILE_ROWS) * ld_src1..];
            let lane = (c % TILE_ROWS) * K_PACK;
            let acc: i32 = probs
                .iter()
                .enumerate()
                .map(|(kk, &p)| {
                    let off = (kk / K_PACK) * TILE_ROWS * K_PACK + lane + kk % K_PACK;
                    p as i32 * block[off] as i32
                })
                .sum();
            acc as f32 * (scale_src1[ib * batchstep_src1scale + c] * U8_PROB_SCALE)
        };

        let cached = acc.len().min(batch_size * n);
        for r in 0..m {
            let mut absmax = 0f32;
            for ib in 0..batch_size {
                for c in 0..n {
                    let v = value(ib, r, c);
                    if ib * n + c < cached {
                        acc[ib * n + c] = v;
                    }
                    absmax = absmax.max(v.abs());
                }
            }
            let scale = absmax / 127.;
            let inv = if scale > 0. { 1. / scale } else { 0. };
            dst_scale[r] = scale;
            for ib in 0..batch_size {
                let row = &mut dst[ib * batchstep_dst + r * ld_dst..][..n];
                for (c, d) in row.iter_mut().enumerate() {
                    let idx = ib * n + c;
                    let v = if idx < cached { acc[idx] } else { value(ib, r, c) };
                    *d = round_to_i8(v * inv);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{PackValueQuant, PackValueQuantArgs};
    use crate::pad_to;
    use rand::prelude::*;

    struct Packed {
        probs: Vec<u8>,
        v: Vec<i8>,
        v_scale: Vec<f32>,
        packed: Vec<i8>,
        packed_scale: Vec<f32>,
    }

    const M: usize = 3;
    const K: usize = 10;
    const D: usize = 20;
    const HEADS: usize = 2;

    fn packed(seed: u64) -> Result<Packed> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (k, d, heads) = (K, D, HEADS);
        let k_pad64 = pad_to(k, 64);
        let d_pad16 = pad_to(d, 16);
        let head_v_size = k_pad64 * d_pad16;
        let probs: Vec<u8> = (0..heads * 16 * k_pad64)
            .map(|_| rng.random_range(0..=255))
            .collect();
        let v: Vec<i8> = (0..k * heads * d)
            .map(|_| rng.random_range(-127..=127))
            .collect();
        let v_scale: Vec<f32> = (0..k).map(|_| rng.random_range(0.01..0.1)).collect();

        let pack = PackValueQuant::build(())?;
        let mut packed = vec![0i8; heads * head_v_size];
        let mut packed_scale = vec![0f32; heads * d_pad16];
        for h in 0..heads {
            for j in (0..d).step_by(16) {
                pack.call(PackValueQuantArgs {
                    src: &v[h * d + j..],
                    dst: &mut packed[h * head_v_size + j * k_pad64..],
                    src_scale: &v_scale,
                    dst_scale: &mut packed_scale[h * d_pad16 + j..],
                    ld_src: heads * d,
                    rows: k,
                    cols: (d - j).min(16),
                });
            }
        }
        Ok(Packed {
            probs,
            v,
            v_scale,
            packed,
            packed_scale,
        })
    }

    fn run(p: &Packed, acc_len: usize) -> Result<(Vec<i8>, Vec<f32>)> {
        let (m, k, d, heads) = (M, K, D, HEADS);
        let k_pad64 = pad_to(k, 64);
        let head_v_size = k_pad64 * pad_to(d, 16);
        let kernel = MmDynamicQuantBatch::build(MmDynamicQuantParam::default())?;
        let mut dst = vec![0i8; m * heads * d];
        let mut dst_scale = vec![0f32; m];
        let mut acc = vec![0f32; acc_len];
        kernel.call(MmDynamicQuantArgs {
            src0: &p.probs,
            src1: &p.packed,
            scale_src1: &p.packed_scale,
            dst: &mut dst,
            dst_scale: &mut dst_scale,
            acc: &mut acc,
            m,
            k,
            n: d,
            ld_src0: k_pad64,
            ld_src1: 16 * k_pad64,
            ld_dst: heads * d,
            batch_size: heads,
            batchstep_src0: 16 * k_pad64,
            batchstep_src1: head_v_size,
            batchstep_src1scale: pad_to(d, 16),
            batchstep_dst: d,
        });
        Ok((dst, dst_scale))
    }

    #[test]
    fn dequantizes_and_requantizes_rows() -> Result<()> {
        let (m, k, d, heads) = (M, K, D, HEADS);
        let k_pad64 = pad_to(k, 64);
        let p = packed(7)?;
        let (probs, v, v_scale, packed_scale) = (&p.probs, &p.v, &p.v_scale, &p.packed_scale);
        let (dst, dst_scale) = run(&p, heads * d)?;

        for r in 0..m {
            let mut expected = vec![0f64; heads * d];
            for h in 0..heads {
                for c in 0..d {
                    expected[h * d + c] = (0..k)
                        .map(|kk| {
                            let p = probs[h * 16 * k_pad64 + r * k_pad64 + kk] as f64 / 255.;
                            p * v[kk * heads * d + h * d + c] as f64 * v_scale[kk] as f64
                        })
                        .sum();
                }
            }
            // half a step of the value requantization for each of the k products.
            let v_step = packed_scale.iter().fold(0f32, |a, &b| a.max(b)) as f64;
            let v_err = v_step * 0.5 * k as f64 + 1e-4;
            let absmax = expected.iter().fold(0f64, |a, b| a.max(b.abs()));
            let scale = dst_scale[r] as f64;
            assert!((scale * 127. - absmax).abs() <= v_err);
            for (i, e) in expected.iter().enumerate() {
                let got = dst[r * heads * d + i] as f64 * scale;
                let tol = scale * 0.5 + v_err;
                assert!((got - e).abs() <= tol, "row {r} elem {i}: {got} {e}");
            }
        }
        Ok(())
    }

    #[test]
    fn short_scratch_gives_the_same_result() -> Result<()> {
        let p = packed(13)?;
        let full = run(&p, HEADS * D)?;
        for acc_len in [0, 1, D, HEADS * D - 3, 4 * HEADS * D] {
            assert_eq!(run(&p, acc_len)?, full, "{acc_len}");
        }
        Ok(())
    }
}

//! Fused `Q x K^T` + softmax + u8 requantization.
use crate::exp::exp_approx;
use crate::tile::{check_pre_tile, debug_assert_configured};
use crate::{pad_to, round_to_u8, ComputePrimitive, Result, TileParam, K_PACK, TILE_ROWS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmSoftmaxParam {
    /// Tile configuration the caller programs before invoking the primitive.
    pub pre_tile: Option<TileParam>,
}

/// Arguments of [`MmSoftmaxBatch`].
///
/// `src0` is row-major int8 with one scale per row, `src1` is a sequence of
/// `AB16a4b` panels (16 columns of the result each) with one scale per column.
/// All the `batchstep_*` offsets are counted in elements.
#[derive(Debug)]
pub struct MmSoftmaxArgs<'a> {
    pub src0: &'a [i8],
    pub src1: &'a [i8],
    pub scale_src0: &'a [f32],
    pub scale_src1: &'a [f32],
    /// Additive bias, `pad_to(n, 16)` entries shared by every row and batch.
    pub src_bias: &'a [f32],
    pub dst: &'a mut [u8],
    /// Row scratch. The exponentials of the first `acc.len()` columns are kept
    /// there between the normalization and the store, the others are computed
    /// twice. `pad_to(n, 16)` entries avoid any recomputation.
    pub acc: &'a mut [f32],
    /// Number of rows, at most 16.
    pub m: usize,
    /// Reduction size.
    pub k: usize,
    /// Number of valid columns.
    pub n: usize,
    pub ld_src0: usize,
    /// Distance between two panels of `src1`.
    pub ld_src1: usize,
    pub ld_dst: usize,
    pub batch_size: usize,
    pub batchstep_src0: usize,
    pub batchstep_src0scale: usize,
    pub batchstep_src1: usize,
    pub batchstep_src1scale: usize,
    pub batchstep_dst: usize,
}

/// Computes `softmax(scale0 * scale1 * (src0 x src1) + bias)` row by row and
/// stores the probabilities as `round(p * 255)`.
///
/// The softmax is not stabilized: the exponential is taken on the raw logits
/// with [`exp_approx`]. Columns up to `pad_to(n, 16)` take part in the
/// normalization, which is why the padded bias entries have to be very
/// negative. Destination columns past that are zeroed up to `ld_dst`, as are
/// the rows whose logits are all below the range of the exponential.
#[derive(Debug)]
pub struct MmSoftmaxBatch {
    pre_tile: Option<TileParam>,
}

impl ComputePrimitive for MmSoftmaxBatch {
    type Param = MmSoftmaxParam;
    type Args<'a> = MmSoftmaxArgs<'a>;

    const NAME: &'static str = "mm_softmax_batch_s8s8_u8";

    fn build(param: MmSoftmaxParam) -> Result<Self> {
        check_pre_tile(Self::NAME, param.pre_tile)?;
        Ok(Self {
            pre_tile: param.pre_tile,
        })
    }

    fn call(&self, args: MmSoftmaxArgs<'_>) {
        debug_assert_configured(Self::NAME, self.pre_tile);
        let MmSoftmaxArgs {
            src0,
            src1,
            scale_src0,
            scale_src1,
            src_bias,
            dst,
            acc,
            m,
            k,
            n,
            ld_src0,
            ld_src1,
            ld_dst,
            batch_size,
            batchstep_src0,
            batchstep_src0scale,
            batchstep_src1,
            batchstep_src1scale,
            batchstep_dst,
        } = args;
        debug_assert!(m <= TILE_ROWS);
        let n_pad16 = pad_to(n, TILE_ROWS);
        let cached = acc.len().min(n_pad16);
        for ib in 0..batch_size {
            let src0 = &src0[ib * batchstep_src0..];
            let scale0 = &scale_src0[ib * batchstep_src0scale..];
            let src1 = &src1[ib * batchstep_src1..];
            let scale1 = &scale_src1[ib * batchstep_src1scale..][..n];
            let dst = &mut dst[ib * batchstep_dst..];
            for r in 0..m {
                let row = &src0[r * ld_src0..][..k];
                let weight = |col: usize| {
                    let panel = &src1[(col / TILE_ROWS) * ld_src1..];
                    let lane = (col % TILE_ROWS) * K_PACK;
                    let dot: i32 = row
                        .iter()
                        .enumerate()
                        .map(|(kk, &q)| {
                            let off = (kk / K_PACK) * TILE_ROWS * K_PACK + lane + kk % K_PACK;
                            q as i32 * panel[off] as i32
                        })
                        .sum();
                    let col_scale = scale1.get(col).copied().unwrap_or(0.);
                    exp_approx(dot as f32 * scale0[r] * col_scale + src_bias[col])
                };
                let mut sum = 0f32;
                for col in 0..n_pad16 {
                    let w = weight(col);
                    if col < cached {
                        acc[col] = w;
                    }
                    sum += w;
                }
                // Rows where every exponential underflows get no weight at all.
                let valid = sum > 0. && sum.is_finite();
                let dst_row = &mut dst[r * ld_dst..][..ld_dst];
                for (col, d) in dst_row.iter_mut().enumerate() {
                    *d = if valid && col < n_pad16 {
                        let w = if col < cached { acc[col] } else { weight(col) };
                        round_to_u8(w / sum * 255.)
                    } else {
                        0
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{PackKey, PackKeyArgs, PackKeyParam};
    use crate::tile::{TileConfig, TileConfigure};
    use rand::prelude::*;

    struct Problem {
        q: Vec<i8>,
        k: Vec<i8>,
        q_scale: Vec<f32>,
        k_scale: Vec<f32>,
        m: usize,
        n: usize,
        d: usize,
    }

    fn problem(m: usize, n: usize, d: usize, seed: u64) -> Problem {
        let mut rng = StdRng::seed_from_u64(seed);
        Problem {
            q: (0..m * d).map(|_| rng.random_range(-127..=127)).collect(),
            k: (0..n * d).map(|_| rng.random_range(-127..=127)).collect(),
            q_scale: (0..m).map(|_| rng.random_range(0.001..0.005)).collect(),
            k_scale: (0..n).map(|_| rng.random_range(0.001..0.005)).collect(),
            m,
            n,
            d,
        }
    }

    fn packed_key(p: &Problem) -> Result<Vec<i8>> {
        let pack = PackKey::build(PackKeyParam::default())?;
        let d_pad = pad_to(p.d, 64);
        let mut out = vec![0i8; pad_to(p.n, 16) * d_pad];
        for j in (0..p.n).step_by(16) {
            pack.call(PackKeyArgs {
                src: &p.k[j * p.d..],
                dst: &mut out[j * d_pad..],
                ld_src: p.d,
                rows: (p.n - j).min(16),
                cols: p.d,
            });
        }
        Ok(out)
    }

    fn run(p: &Problem, bias: &[f32]) -> Result<Vec<u8>> {
        run_with_scratch(p, bias, pad_to(p.n, 16))
    }

    fn run_with_scratch(p: &Problem, bias: &[f32], acc_len: usize) -> Result<Vec<u8>> {
        let kernel = MmSoftmaxBatch::build(MmSoftmaxParam {
            pre_tile: Some(TileParam::FULL_INT8),
        })?;
        let configure = TileConfigure::build(())?;
        let cfg = TileConfig::new(TileParam::FULL_INT8)?;
        let _scope = configure.scope(&cfg);
        let d_pad = pad_to(p.d, 64);
        let ld_dst = pad_to(p.n, 64);
        let key = packed_key(p)?;
        let mut dst = vec![7u8; 16 * ld_dst];
        let mut acc = vec![0f32; acc_len];
        kernel.call(MmSoftmaxArgs {
            src0: &p.q,
            src1: &key,
            scale_src0: &p.q_scale,
            scale_src1: &p.k_scale,
            src_bias: bias,
            dst: &mut dst,
            acc: &mut acc,
            m: p.m,
            k: p.d,
            n: p.n,
            ld_src0: p.d,
            ld_src1: 16 * d_pad,
            ld_dst,
            batch_size: 1,
            batchstep_src0: 0,
            batchstep_src0scale: 0,
            batchstep_src1: 0,
            batchstep_src1scale: 0,
            batchstep_dst: 0,
        });
        Ok(dst)
    }

    #[test]
    fn matches_reference_softmax() -> Result<()> {
        let p = problem(5, 20, 24, 42);
        let mut bias = vec![0f32; 32];
        bias[3] = -2.;
        bias[20..].fill(-1000.);
        let dst = run(&p, &bias)?;
        let ld_dst = 64;
        for r in 0..p.m {
            let logits: Vec<f64> = (0..p.n)
                .map(|c| {
                    let dot: i32 = (0..p.d)
                        .map(|kk| p.q[r * p.d + kk] as i32 * p.k[c * p.d + kk] as i32)
                        .sum();
                    dot as f64 * p.q_scale[r] as f64 * p.k_scale[c] as f64 + bias[c] as f64
                })
                .collect();
            let sum: f64 = logits.iter().map(|l| l.exp()).sum();
            for c in 0..p.n {
                let expected = logits[c].exp() / sum * 255.;
                let got = dst[r * ld_dst + c] as f64;
                assert!((got - expected).abs() <= 0.5 + 1e-3, "{r} {c}: {got} {expected}");
            }
            // padded key positions get no weight, the tail is zeroed.
            assert!(dst[r * ld_dst + p.n..(r + 1) * ld_dst].iter().all(|&v| v == 0));
        }
        // rows past m are left untouched.
        assert!(dst[p.m * ld_dst..].iter().all(|&v| v == 7));
        Ok(())
    }

    #[test]
    fn padded_positions_get_no_weight() -> Result<()> {
        let p = problem(16, 20, 16, 3);
        // A uniform shift keeps every real logit inside the range of the exponential.
        let mut bias = vec![-60f32; 32];
        bias[20..].fill(-1000.);
        let dst = run(&p, &bias)?;
        for r in 0..p.m {
            let row = &dst[r * 64..(r + 1) * 64];
            assert!(row[p.n..].iter().all(|&v| v == 0), "row {r}: {row:?}");
            let total: u32 = row[..p.n].iter().map(|&v| v as u32).sum();
            assert!(total.abs_diff(255) <= p.n as u32 / 2 + 1, "row {r}: {total}");
        }
        let unshifted = run(&p, &[&[0f32; 20][..], &[-1000f32; 12][..]].concat())?;
        for (a, b) in dst.iter().zip(&unshifted) {
            assert!(a.abs_diff(*b) <= 1);
        }
        Ok(())
    }

    #[test]
    fn underflowing_rows_are_zeroed() -> Result<()> {
        let p = problem(16, 20, 16, 5);
        let mut bias = vec![-100f32; 32];
        bias[20..].fill(-1000.);
        let dst = run(&p, &bias)?;
        assert!(dst.iter().all(|&v| v == 0));
        Ok(())
    }

    #[test]
    fn short_scratch_gives_the_same_result() -> Result<()> {
        let p = problem(7, 37, 40, 11);
        let mut bias = vec![0f32; 48];
        bias[37..].fill(-1000.);
        let full = run(&p, &bias)?;
        for acc_len in [0, 5, 16, 47, 100] {
            assert_eq!(run_with_scratch(&p, &bias, acc_len)?, full, "{acc_len}");
        }
        Ok(())
    }

    #[test]
    fn rejects_foreign_tiles() {
        let param = MmSoftmaxParam {
            pre_tile: Some(TileParam::new(8, 16, 64, false, 4)),
        };
        assert!(MmSoftmaxBatch::build(param).is_err());
        assert!(MmSoftmaxBatch::build(MmSoftmaxParam::default()).is_ok());
    }
}

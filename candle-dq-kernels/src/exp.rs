//! Fast approximate exponential used by the fused softmax.

const LOG2E: f32 = std::f32::consts::LOG2_E;
// ln(2) split in a part exactly representable with few mantissa bits and a
// correction term, so that `x - n * ln2` stays exact for |n| <= 127.
const LN2_HI: f32 = 0.693_359_4;
const LN2_LO: f32 = -2.121_944_4e-4;

// Bounds keeping both `n` and the reconstructed exponent finite, below
// `EXP_MIN` the result is flushed to zero.
const EXP_MIN: f32 = -87.3;
const EXP_MAX: f32 = 88.3;

/// Approximates `exp(x)`.
///
/// The input is reduced to `x = n * ln2 + r` with `|r| <= ln2 / 2`, and
/// `exp(r)` is evaluated with a degree 6 polynomial. The relative error is below
/// `1e-6` over `[-87.3, 88.3]`. Inputs below that range return exactly zero,
/// inputs above it saturate to a finite value.
#[inline]
pub fn exp_approx(x: f32) -> f32 {
    if x < EXP_MIN {
        return 0.;
    }
    let x = x.min(EXP_MAX);
    let n = (x * LOG2E).round();
    let r = x - n * LN2_HI - n * LN2_LO;
    let p = 1.0
        + r * (1.0
            + r * (1.0 / 2.0
                + r * (1.0 / 6.0 + r * (1.0 / 24.0 + r * (1.0 / 120.0 + r * (1.0 / 720.0))))));
    let pow2n = f32::from_bits(((n as i32 + 127) as u32) << 23);
    p * pow2n
}

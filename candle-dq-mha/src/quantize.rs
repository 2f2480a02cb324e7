//! Symmetric per-row int8 quantization, used to prepare the kernel inputs and to
//! read its output back.
//!
//! A row of `[batch, seq, head_num, head_size]` activations spans all the heads
//! of one token, so quantizing with `row_len = head_num * head_size` yields the
//! `[batch, seq]` scales the kernel expects.
use crate::{bail, Result};

/// Quantizes `xs` with one scale `absmax / 127` per row of `row_len` values.
pub fn quantize_per_row(xs: &[f32], row_len: usize) -> Result<(Vec<i8>, Vec<f32>)> {
    if row_len == 0 || xs.len() % row_len != 0 {
        bail!(
            "quantize_per_row: {} values cannot be split in rows of {}",
            xs.len(),
            row_len
        )
    }
    let mut values = Vec::with_capacity(xs.len());
    let mut scales = Vec::with_capacity(xs.len() / row_len);
    for row in xs.chunks_exact(row_len) {
        let absmax = row.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        let scale = absmax / 127.;
        let inv = if scale > 0. { 1. / scale } else { 0. };
        values.extend(row.iter().map(|v| (v * inv).round().clamp(-127., 127.) as i8));
        scales.push(scale);
    }
    Ok((values, scales))
}

/// Inverse of [`quantize_per_row`], the row length is given by the number of
/// scales.
pub fn dequantize_per_row(xs: &[i8], scales: &[f32]) -> Result<Vec<f32>> {
    if scales.is_empty() || xs.len() % scales.len() != 0 {
        bail!(
            "dequantize_per_row: {} values do not match {} scales",
            xs.len(),
            scales.len()
        )
    }
    let row_len = xs.len() / scales.len();
    let mut out = Vec::with_capacity(xs.len());
    for (row, &scale) in xs.chunks_exact(row_len.max(1)).zip(scales) {
        out.extend(row.iter().map(|&v| v as f32 * scale));
    }
    Ok(out)
}

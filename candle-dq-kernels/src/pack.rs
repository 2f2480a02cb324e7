//! Packing primitives turning row-major int8 operands into tile layouts.
use crate::{pad_to, round_to_i8, ComputePrimitive, KernelError, Result, K_PACK, TILE_ROWS};

const PANEL_GROUP: usize = TILE_ROWS * K_PACK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackKeyParam {
    /// The packed width, columns past the source width are zero-filled up to a
    /// multiple of this value.
    pub pad_n: usize,
}

impl Default for PackKeyParam {
    fn default() -> Self {
        Self { pad_n: 64 }
    }
}

/// Arguments of [`PackKey`], one 16-row panel per call.
#[derive(Debug)]
pub struct PackKeyArgs<'a> {
    /// First element of the panel, row `r` starts at `r * ld_src`.
    pub src: &'a [i8],
    /// Destination panel, `16 * pad_to(cols, pad_n)` bytes.
    pub dst: &'a mut [i8],
    pub ld_src: usize,
    /// Number of valid rows, at most 16.
    pub rows: usize,
    /// Number of valid columns.
    pub cols: usize,
}

/// Copies a block of at most 16 rows into the `AB16a4b` layout.
///
/// Rows past `rows` and columns past `cols` are written as zeros so that the
/// whole panel can be fed to a full tile.
#[derive(Debug)]
pub struct PackKey {
    pad_n: usize,
}

impl ComputePrimitive for PackKey {
    type Param = PackKeyParam;
    type Args<'a> = PackKeyArgs<'a>;

    const NAME: &'static str = "pack_key_ab16a4b";

    fn build(param: PackKeyParam) -> Result<Self> {
        if param.pad_n == 0 || param.pad_n % K_PACK != 0 {
            return Err(KernelError::InvalidParam {
                primitive: Self::NAME,
                msg: format!("pad_n {} is not a positive multiple of {K_PACK}", param.pad_n),
            });
        }
        Ok(Self {
            pad_n: param.pad_n,
        })
    }

    fn call(&self, args: PackKeyArgs<'_>) {
        let PackKeyArgs {
            src,
            dst,
            ld_src,
            rows,
            cols,
        } = args;
        debug_assert!(rows <= TILE_ROWS);
        let padded = pad_to(cols, self.pad_n);
        for (k4, group) in dst[..padded * TILE_ROWS]
            .chunks_exact_mut(PANEL_GROUP)
            .enumerate()
        {
            for r in 0..TILE_ROWS {
                for kk in 0..K_PACK {
                    let col = k4 * K_PACK + kk;
                    group[r * K_PACK + kk] = if r < rows && col < cols {
                        src[r * ld_src + col]
                    } else {
                        0
                    };
                }
            }
        }
    }
}

/// Arguments of [`PackValueQuant`], one block of at most 16 columns per call.
#[derive(Debug)]
pub struct PackValueQuantArgs<'a> {
    /// First element of the block, row `r` starts at `r * ld_src`.
    pub src: &'a [i8],
    /// Destination block, `16 * pad_to(rows, 4)` bytes are written.
    pub dst: &'a mut [i8],
    /// One dequantization scale per source row.
    pub src_scale: &'a [f32],
    /// One output scale per column of the block, 16 entries are written.
    pub dst_scale: &'a mut [f32],
    pub ld_src: usize,
    /// Number of source rows.
    pub rows: usize,
    /// Number of valid columns, at most 16.
    pub cols: usize,
}

/// Transposes a block of at most 16 columns into the `BA16b4a` layout while
/// moving from per-row to per-column quantization.
///
/// Each column gets a symmetric scale `absmax / 127` computed over the
/// dequantized values of that column. Columns past `cols` get a zero scale and
/// rows past `rows` are zero-filled up to a multiple of 4.
#[derive(Debug)]
pub struct PackValueQuant {
    _private: (),
}

impl ComputePrimitive for PackValueQuant {
    type Param = ();
    type Args<'a> = PackValueQuantArgs<'a>;

    const NAME: &'static str = "pack_value_ba16b4a_requant";

    fn build(_: ()) -> Result<Self> {
        Ok(Self { _private: () })
    }

    fn call(&self, args: PackValueQuantArgs<'_>) {
        let PackValueQuantArgs {
            src,
            dst,
            src_scale,
            dst_scale,
            ld_src,
            rows,
            cols,
        } = args;
        debug_assert!(cols <= TILE_ROWS);
        let dequant = |r: usize, c: usize| src[r * ld_src + c] as f32 * src_scale[r];

        let mut inv_scale = [0f32; TILE_ROWS];
        for c in 0..TILE_ROWS {
            let scale = if c < cols {
                (0..rows).map(|r| dequant(r, c).abs()).fold(0f32, f32::max) / 127.
            } else {
                0.
            };
            dst_scale[c] = scale;
            inv_scale[c] = if scale > 0. { 1. / scale } else { 0. };
        }

        let rows_pad = pad_to(rows, K_PACK);
        for (r4, group) in dst[..rows_pad * TILE_ROWS]
            .chunks_exact_mut(PANEL_GROUP)
            .enumerate()
        {
            for (c, &inv) in inv_scale.iter().enumerate() {
                for rr in 0..K_PACK {
                    let r = r4 * K_PACK + rr;
                    group[c * K_PACK + rr] = if r < rows && c < cols {
                        round_to_i8(dequant(r, c) * inv)
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

    #[test]
    fn pack_key_layout() -> Result<()> {
        let pack = PackKey::build(PackKeyParam::default())?;
        // 3 rows of 5 columns with a leading dimension of 7.
        let ld = 7;
        let src: Vec<i8> = (0..3 * ld as i8).collect();
        let mut dst = vec![-1i8; 16 * 64];
        pack.call(PackKeyArgs {
            src: &src,
            dst: &mut dst,
            ld_src: ld,
            rows: 3,
            cols: 5,
        });
        for col in 0..64 {
            for row in 0..16 {
                let got = dst[(col / 4) * 64 + row * 4 + col % 4];
                let expected = if row < 3 && col < 5 {
                    src[row * ld + col]
                } else {
                    0
                };
                assert_eq!(got, expected, "row {row} col {col}");
            }
        }
        Ok(())
    }

    #[test]
    fn pack_key_rejects_bad_padding() {
        assert!(PackKey::build(PackKeyParam { pad_n: 0 }).is_err());
        assert!(PackKey::build(PackKeyParam { pad_n: 6 }).is_err());
    }

    #[test]
    fn pack_value_requantizes_per_column() -> Result<()> {
        let pack = PackValueQuant::build(())?;
        let rows = 5;
        let ld = 3;
        let src: Vec<i8> = vec![
            10, -20, 0, //
            127, 5, 0, //
            -64, 40, 0, //
            1, -127, 0, //
            0, 0, 0, //
        ];
        let src_scale = [0.5, 0.25, 1.0, 2.0, 4.0];
        let mut dst = vec![-1i8; 16 * 64];
        let mut dst_scale = [-1f32; 16];
        pack.call(PackValueQuantArgs {
            src: &src,
            dst: &mut dst,
            src_scale: &src_scale,
            dst_scale: &mut dst_scale,
            ld_src: ld,
            rows,
            cols: 3,
        });
        // column 0: max |v * s| is 64, column 1: 254, column 2 is all zeros.
        assert_eq!(dst_scale[0], 64. / 127.);
        assert_eq!(dst_scale[1], 254. / 127.);
        assert_eq!(dst_scale[2], 0.);
        assert!(dst_scale[3..].iter().all(|&s| s == 0.));

        let at = |r: usize, c: usize| dst[(r / 4) * 64 + c * 4 + r % 4];
        assert_eq!(at(2, 0), -127);
        assert_eq!(at(3, 1), -127);
        assert_eq!(at(0, 1), round_to_i8(-10. / (254. / 127.)));
        for r in 0..8 {
            for c in 0..16 {
                if r >= rows || c >= 2 {
                    assert_eq!(at(r, c), 0, "row {r} col {c}");
                }
            }
        }
        // only 16 * pad_to(rows, 4) bytes are written.
        assert!(dst[16 * 8..].iter().all(|&v| v == -1));
        Ok(())
    }
}

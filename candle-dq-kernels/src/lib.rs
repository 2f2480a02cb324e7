//! Int8 compute primitives for the dynamically quantized attention kernel.
//!
//! Each primitive follows the same life cycle: it is built once from a small
//! parameter struct, then invoked many times with a per-call argument struct
//! carrying the source and destination slices, leading dimensions and the batch
//! steps used to loop over heads without re-invocation. Primitives never allocate
//! and keep no state across calls, so a built primitive can be shared by all the
//! worker threads as long as each call writes to disjoint data.
//!
//! The operand layouts are the ones expected by an int8 matrix-tile engine:
//!
//! - `AB16a4b`: a matrix stored as 16-row panels, each panel holding groups of 4
//!   consecutive columns for all 16 rows (`[col / 4][row][col % 4]`).
//! - `BA16b4a`: a matrix stored as 16-column blocks, each block holding groups of
//!   4 consecutive rows for all 16 columns (`[row / 4][col][row % 4]`).
//!
//! The implementations in this crate are portable and do not require the tile
//! instructions, the [`tile`] module only tracks the configuration a hardware
//! backend would program.
pub mod error;
pub mod exp;
pub mod isa;
pub mod mm_dequant;
pub mod mm_softmax;
pub mod pack;
pub mod tile;

pub use error::{KernelError, Result};
pub use isa::Isa;
pub use mm_dequant::{MmDynamicQuantArgs, MmDynamicQuantBatch, MmDynamicQuantParam};
pub use mm_softmax::{MmSoftmaxArgs, MmSoftmaxBatch, MmSoftmaxParam};
pub use pack::{PackKey, PackKeyArgs, PackKeyParam, PackValueQuant, PackValueQuantArgs};
pub use tile::{TileConfig, TileConfigure, TileParam, TileScope};

/// Number of rows in a full tile, also the panel height of the packed layouts.
pub const TILE_ROWS: usize = 16;

/// Number of bytes in a full tile row.
pub const TILE_COLSB: usize = 64;

/// Number of int8 values packed together along the reduction dimension.
pub const K_PACK: usize = 4;

/// The build-once, invoke-many contract shared by the primitives.
pub trait ComputePrimitive: Send + Sync + Sized {
    /// Build time configuration.
    type Param;
    /// Per invocation arguments.
    type Args<'a>;

    const NAME: &'static str;

    /// Builds the primitive, this is where all the validation happens.
    fn build(param: Self::Param) -> Result<Self>;

    /// Runs the primitive. The arguments have to match the layouts documented on
    /// each primitive, slices that are too short result in a panic.
    fn call(&self, args: Self::Args<'_>);
}

/// Rounds `x` up to the next multiple of `n`.
#[inline]
pub const fn pad_to(x: usize, n: usize) -> usize {
    x.div_ceil(n) * n
}

#[inline]
pub(crate) fn round_to_i8(v: f32) -> i8 {
    v.round().clamp(-127.0, 127.0) as i8
}

#[inline]
pub(crate) fn round_to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

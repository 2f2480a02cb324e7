//! Matrix-tile configuration.
//!
//! A tile engine has to be programmed with the shape of its tile registers
//! before any tile instruction runs, and that configuration is per-thread
//! hardware state. [`TileConfigure`] is the primitive programming it and
//! [`TileScope`] keeps it active for the lifetime of a worker's share of the work.
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ComputePrimitive, KernelError, Result, K_PACK, TILE_COLSB, TILE_ROWS};

thread_local! {
    static ACTIVE_TILE: Cell<Option<TileParam>> = const { Cell::new(None) };
}

/// The tile configuration currently active on the calling thread.
pub fn active_tile() -> Option<TileParam> {
    ACTIVE_TILE.with(|t| t.get())
}

/// Shape of the tiles used by a gemm micro-kernel, `C[m, n] += A[m, k] * B[k, n]`
/// with `k` counted in bytes and `B` packed by groups of `k_pack` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileParam {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub is_bf16: bool,
    pub k_pack: usize,
}

impl TileParam {
    /// Full 16x16 int8 tiles reducing 64 bytes at a time.
    pub const FULL_INT8: Self = Self::new(TILE_ROWS, TILE_ROWS, TILE_COLSB, false, K_PACK);

    pub const fn new(m: usize, n: usize, k: usize, is_bf16: bool, k_pack: usize) -> Self {
        Self {
            m,
            n,
            k,
            is_bf16,
            k_pack,
        }
    }

    fn check(&self) -> Result<()> {
        let elem_size = if self.is_bf16 { 2 } else { 1 };
        let invalid = |msg: String| KernelError::InvalidParam {
            primitive: TileConfigure::NAME,
            msg,
        };
        if self.m == 0 || self.m > TILE_ROWS || self.n == 0 || self.n > TILE_ROWS {
            return Err(invalid(format!("tile of {}x{} does not fit", self.m, self.n)));
        }
        if self.k == 0 || self.k > TILE_COLSB || self.k % (self.k_pack * elem_size) != 0 {
            return Err(invalid(format!(
                "k of {} bytes is incompatible with a k-pack of {}",
                self.k, self.k_pack
            )));
        }
        if self.k_pack * elem_size != 4 {
            return Err(invalid(format!("unsupported k-pack {}", self.k_pack)));
        }
        Ok(())
    }
}

/// A validated tile configuration.
///
/// Register assignment: tmm0-3 hold the int32 accumulators, tmm4-5 the `A`
/// operands and tmm6-7 the packed `B` operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    param: TileParam,
}

impl TileConfig {
    pub fn new(param: TileParam) -> Result<Self> {
        param.check()?;
        Ok(Self { param })
    }

    pub fn param(&self) -> TileParam {
        self.param
    }
}

/// Programs and releases the tile configuration of the calling thread.
#[derive(Debug)]
pub struct TileConfigure {
    configurations: AtomicUsize,
}

impl ComputePrimitive for TileConfigure {
    type Param = ();
    type Args<'a> = &'a TileConfig;

    const NAME: &'static str = "tile_configure";

    fn build(_: ()) -> Result<Self> {
        Ok(Self {
            configurations: AtomicUsize::new(0),
        })
    }

    fn call(&self, cfg: &TileConfig) {
        self.configurations.fetch_add(1, Ordering::Relaxed);
        ACTIVE_TILE.with(|t| t.set(Some(cfg.param())))
    }
}

impl TileConfigure {
    /// Number of configurations programmed so far, over all the threads.
    pub fn configurations(&self) -> usize {
        self.configurations.load(Ordering::Relaxed)
    }

    /// Releases the tile configuration of the calling thread.
    pub fn release(&self) {
        ACTIVE_TILE.with(|t| t.set(None))
    }

    /// Configures the calling thread, the returned guard releases the tiles when
    /// dropped. The guard cannot leave the thread it was created on.
    pub fn scope<'a>(&'a self, cfg: &TileConfig) -> TileScope<'a> {
        self.call(cfg);
        TileScope {
            owner: self,
            _not_send: PhantomData,
        }
    }
}

/// Keeps a tile configuration active on the current thread.
pub struct TileScope<'a> {
    owner: &'a TileConfigure,
    _not_send: PhantomData<*const ()>,
}

impl Drop for TileScope<'_> {
    fn drop(&mut self) {
        self.owner.release()
    }
}

/// Checks that a gemm built for `expected` runs with the matching tiles.
#[inline]
pub(crate) fn debug_assert_configured(primitive: &'static str, expected: Option<TileParam>) {
    if let Some(expected) = expected {
        debug_assert_eq!(
            active_tile(),
            Some(expected),
            "{primitive} called without the expected tile configuration"
        );
    }
}

/// Validates the `pre_tile` parameter of a gemm primitive.
pub(crate) fn check_pre_tile(primitive: &'static str, pre_tile: Option<TileParam>) -> Result<()> {
    match pre_tile {
        Some(got) if got != TileParam::FULL_INT8 => Err(KernelError::TileMismatch {
            primitive,
            expected: TileParam::FULL_INT8,
            got,
        }),
        _ => Ok(()),
    }
}

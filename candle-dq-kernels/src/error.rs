use crate::{Isa, TileParam};

/// Errors returned when building a primitive.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("{primitive}: invalid parameter, {msg}")]
    InvalidParam {
        primitive: &'static str,
        msg: String,
    },

    #[error("{primitive}: expected a {expected:?} tile configuration, got {got:?}")]
    TileMismatch {
        primitive: &'static str,
        expected: TileParam,
        got: TileParam,
    },

    #[error("{primitive} is not supported on this host, missing {isa}")]
    UnsupportedIsa { primitive: &'static str, isa: Isa },
}

pub type Result<T> = std::result::Result<T, KernelError>;

use crate::{DType, IoSlot};
use candle_dq_kernels::Isa;

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the host does not support {isa}")]
    UnsupportedIsa { isa: Isa },

    #[error("attribute `{key}` has to be `{expected}`, got {got:?}")]
    UnexpectedAttr {
        key: &'static str,
        expected: &'static str,
        got: Option<String>,
    },

    #[error("{dim} is dynamic ({value}) but {slot:?} is not a [1] tensor")]
    MissingDynamicSize {
        dim: &'static str,
        value: i64,
        slot: IoSlot,
    },

    #[error("unexpected rank for {slot:?}, expected: {expected}, got: {got:?}")]
    UnexpectedRank {
        slot: IoSlot,
        expected: usize,
        got: Vec<i64>,
    },

    #[error("shape mismatch for {slot:?}, expected: {expected:?}, got: {got:?}")]
    ShapeMismatch {
        slot: IoSlot,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("{slot:?} has to be empty, got {shape:?}")]
    UnexpectedTensor { slot: IoSlot, shape: Vec<i64> },

    #[error("unexpected dtype for {slot:?}, expected: {expected:?}, got: {got:?}")]
    UnexpectedDType {
        slot: IoSlot,
        expected: DType,
        got: DType,
    },

    #[error("invalid dynamic size for {dim}: {value}")]
    InvalidDynamicSize { dim: &'static str, value: i64 },

    #[error("buffer for {slot:?} is too small, expected at least {expected} elements, got {got}")]
    BufferTooSmall {
        slot: IoSlot,
        expected: usize,
        got: usize,
    },

    #[error("the workspace has to be aligned on {align} bytes")]
    MisalignedWorkspace { align: usize },

    #[error(transparent)]
    Kernel(#[from] candle_dq_kernels::KernelError),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn msg(err: impl std::fmt::Display) -> Self {
        Self::Msg(err.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()))
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()))
    };
}

//! Kernel configuration.
use std::str::FromStr;

use candle_dq_kernels::Isa;

use crate::{Error, Result};

/// Environment variable overriding the number of worker threads.
pub const NUM_THREADS_ENV: &str = "CANDLE_DQ_MHA_NUM_THREADS";
/// Environment variable naming the isa the descriptor has to require, `none`
/// disables the check.
pub const ISA_ENV: &str = "CANDLE_DQ_MHA_ISA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Size of the worker pool, also the number of per-thread scratch regions
    /// in the workspace.
    pub num_threads: usize,
    /// Instruction set the host must support for the descriptor to validate.
    pub required_isa: Option<Isa>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_threads: crate::utils::get_num_threads(),
            required_isa: None,
        }
    }
}

impl KernelConfig {
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_required_isa(mut self, isa: Option<Isa>) -> Self {
        self.required_isa = isa;
        self
    }

    /// Reads the configuration from `CANDLE_DQ_MHA_NUM_THREADS` and
    /// `CANDLE_DQ_MHA_ISA`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup(NUM_THREADS_ENV) {
            match usize::from_str(v.trim()) {
                Ok(n) if n > 0 => cfg.num_threads = n,
                _ => {
                    return Err(Error::Msg(format!(
                        "{NUM_THREADS_ENV} has to be a positive integer, got {v:?}"
                    )))
                }
            }
        }
        if let Some(v) = lookup(ISA_ENV) {
            cfg.required_isa = match v.trim() {
                "" | "none" => None,
                isa => Some(Isa::from_str(isa).map_err(Error::msg)?),
            }
        }
        Ok(cfg)
    }
}

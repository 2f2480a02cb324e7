//! Multi-head attention over int8 activations with dynamic quantization.
//!
//! The kernel computes, for every batch `b`, query row `i` and head `h`,
//!
//! ```text
//! out[b, i, h, :] = softmax(q[b, i, h, :] . k[b, :, h, :]^T * q_scale * k_scale + mask[b])
//!                   x (v[b, :, h, :] * v_scale)
//! ```
//!
//! and requantizes the result to int8 with one scale per `(b, i)` row, shared by
//! all the heads. Query, key and value come with one scale per token.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_dq_mha::test_utils::{mha_op_desc, workspace, MhaInputs};
//! use candle_dq_mha::{DynamicQuantMha, KernelDesc, ProblemShape};
//!
//! # fn main() -> candle_dq_mha::Result<()> {
//! let shape = ProblemShape::new(1, 2, 16, 40, 64);
//! let kd = KernelDesc::new(mha_op_desc(&shape));
//! assert!(kd.validate());
//! let mha = DynamicQuantMha::new(Arc::new(kd))?;
//!
//! let inputs = MhaInputs::random(shape, 42);
//! let mut output = vec![0i8; shape.query_elem_count()];
//! let mut output_scale = vec![0f32; shape.batch_size * shape.m];
//! let mut ws = workspace(mha.workspace_size(&shape));
//! mha.execute(inputs.args(&mut output, &mut output_scale, bytemuck::cast_slice_mut(&mut ws)))?;
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod dtype;
pub mod engine;
mod error;
pub mod kernel_desc;
pub mod op_desc;
pub mod quantize;
pub mod runtime;
pub mod test_utils;
pub mod utils;
pub mod workspace;

pub use config::KernelConfig;
pub use dtype::DType;
pub use engine::DynamicQuantMha;
pub use error::{Error, Result};
pub use kernel_desc::{Dim, KernelDesc, ProblemDims};
pub use op_desc::{IoSlot, OperatorDesc, TensorDesc};
pub use quantize::{dequantize_per_row, quantize_per_row};
pub use runtime::{DynamicSizes, MhaArgs};
pub use workspace::{workspace_size, ProblemShape, WorkspaceLayout};

pub use candle_dq_kernels::Isa;

//! Workspace sizing and partitioning.
//!
//! The caller-provided workspace is carved into five consecutive regions:
//!
//! | region       | element | size                                   |
//! |--------------|---------|----------------------------------------|
//! | padded mask  | `f32`   | `batch_size * pad16(n)`                |
//! | packed key   | `i8`    | `batch_size * head_num * pad64(n) * pad64(head_size)` |
//! | packed value | `i8`    | same as the packed key                 |
//! | value scales | `f32`   | `batch_size * head_num * pad64(head_size)` |
//! | per thread   | `f32`   | `threads * 16 * head_num * pad64(n)`   |
//!
//! The mask region is only written when `n` is not a multiple of 16.
use crate::utils::pad_to;
use crate::{Error, IoSlot, Result};

/// Concrete problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch_size: usize,
    pub head_num: usize,
    pub m: usize,
    pub n: usize,
    pub head_size: usize,
}

impl ProblemShape {
    pub fn new(batch_size: usize, head_num: usize, m: usize, n: usize, head_size: usize) -> Self {
        Self {
            batch_size,
            head_num,
            m,
            n,
            head_size,
        }
    }

    /// Number of elements of the query and of the output.
    pub fn query_elem_count(&self) -> usize {
        self.batch_size * self.m * self.head_num * self.head_size
    }

    /// Number of elements of the key and of the value.
    pub fn key_elem_count(&self) -> usize {
        self.batch_size * self.n * self.head_num * self.head_size
    }
}

/// Number of workspace bytes needed to run `shape` on `num_threads` workers.
pub fn workspace_size(shape: &ProblemShape, num_threads: usize) -> usize {
    WorkspaceLayout::new(shape, num_threads).size_in_bytes()
}

/// Region sizes and per-head strides of the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub num_threads: usize,
    /// Elements per batch of the padded mask, `pad16(n)`.
    pub mask_stride: usize,
    /// Bytes of one packed key head, also used for the packed value heads.
    pub head_kv_size: usize,
    /// Scales of one packed value head.
    pub head_v_scale_size: usize,
    /// Bytes of one thread scratch region.
    pub thread_size: usize,
    mask_len: usize,
    kv_len: usize,
    v_scale_len: usize,
}

impl WorkspaceLayout {
    pub fn new(shape: &ProblemShape, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let n_pad16 = pad_to(shape.n, 16);
        let n_pad64 = pad_to(shape.n, 64);
        let d_pad64 = pad_to(shape.head_size, 64);
        let heads = shape.batch_size * shape.head_num;
        let head_kv_size = n_pad64 * d_pad64;
        Self {
            num_threads,
            mask_stride: n_pad16,
            head_kv_size,
            head_v_scale_size: d_pad64,
            thread_size: 4 * 16 * shape.head_num * n_pad64,
            mask_len: shape.batch_size * n_pad16,
            kv_len: heads * head_kv_size,
            v_scale_len: heads * d_pad64,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        4 * self.mask_len
            + 2 * self.kv_len
            + 4 * self.v_scale_len
            + self.num_threads * self.thread_size
    }

    /// Splits the first `size_in_bytes` bytes of `workspace` into its regions.
    pub fn split<'a>(&self, workspace: &'a mut [u8]) -> Result<WorkspaceRegions<'a>> {
        let size = self.size_in_bytes();
        if workspace.len() < size {
            return Err(Error::BufferTooSmall {
                slot: IoSlot::Workspace,
                expected: size,
                got: workspace.len(),
            });
        }
        let (mask, rest) = workspace[..size].split_at_mut(4 * self.mask_len);
        let (key, rest) = rest.split_at_mut(self.kv_len);
        let (value, rest) = rest.split_at_mut(self.kv_len);
        let (value_scale, threads) = rest.split_at_mut(4 * self.v_scale_len);
        Ok(WorkspaceRegions {
            mask: cast_f32(mask)?,
            key: bytemuck::cast_slice_mut(key),
            value: bytemuck::cast_slice_mut(value),
            value_scale: cast_f32(value_scale)?,
            threads: cast_f32(threads)?,
        })
    }
}

fn cast_f32(bytes: &mut [u8]) -> Result<&mut [f32]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|_| Error::MisalignedWorkspace {
        align: std::mem::align_of::<f32>(),
    })
}

/// Mutable views on the workspace regions.
#[derive(Debug)]
pub struct WorkspaceRegions<'a> {
    pub mask: &'a mut [f32],
    pub key: &'a mut [i8],
    pub value: &'a mut [i8],
    pub value_scale: &'a mut [f32],
    pub threads: &'a mut [f32],
}

//! Run time view of the operator io.
use crate::kernel_desc::{Dim, ProblemDims};
use crate::workspace::{ProblemShape, WorkspaceLayout};
use crate::{Error, IoSlot, Result};

/// Values of the scalar size tensors, only read for the dimensions the
/// descriptor left dynamic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicSizes {
    pub batch_size: Option<i32>,
    pub head_num: Option<i32>,
    pub m: Option<i32>,
    pub n: Option<i32>,
    pub head_size: Option<i32>,
}

impl DynamicSizes {
    pub fn from_shape(shape: &ProblemShape) -> Self {
        let v = |x: usize| i32::try_from(x).ok();
        Self {
            batch_size: v(shape.batch_size),
            head_num: v(shape.head_num),
            m: v(shape.m),
            n: v(shape.n),
            head_size: v(shape.head_size),
        }
    }
}

impl ProblemDims {
    /// Resolves the dynamic dimensions against the run time sizes.
    pub fn resolve(&self, sizes: &DynamicSizes) -> Result<ProblemShape> {
        let resolve = |dim: Dim, value: Option<i32>, name: &'static str, slot: IoSlot| match dim
        {
            Dim::Static(v) => Ok(v),
            Dim::Dynamic => match value {
                Some(v) if v > 0 => Ok(v as usize),
                Some(v) => Err(Error::InvalidDynamicSize {
                    dim: name,
                    value: v as i64,
                }),
                None => Err(Error::MissingDynamicSize {
                    dim: name,
                    value: -1,
                    slot,
                }),
            },
        };
        Ok(ProblemShape {
            batch_size: resolve(
                self.batch_size,
                sizes.batch_size,
                "batch_size",
                IoSlot::BatchSize,
            )?,
            head_num: resolve(self.head_num, sizes.head_num, "head_num", IoSlot::HeadNum)?,
            m: resolve(self.m, sizes.m, "m", IoSlot::M)?,
            n: resolve(self.n, sizes.n, "n", IoSlot::N)?,
            head_size: resolve(
                self.head_size,
                sizes.head_size,
                "head_size",
                IoSlot::HeadSize,
            )?,
        })
    }

    /// The shape when no dimension is dynamic.
    pub fn as_static(&self) -> Option<ProblemShape> {
        Some(ProblemShape {
            batch_size: self.batch_size.as_static()?,
            head_num: self.head_num.as_static()?,
            m: self.m.as_static()?,
            n: self.n.as_static()?,
            head_size: self.head_size.as_static()?,
        })
    }
}

/// Buffers of one execution, all of them dense and row-major.
///
/// - `query`, `output`: `[batch_size, m, head_num, head_size]`.
/// - `key`, `value`: `[batch_size, n, head_num, head_size]`.
/// - `mask`: `[batch_size, 1, 1, n]`.
/// - `query_scale`, `output_scale`: `[batch_size, m]`.
/// - `key_scale`, `value_scale`: `[batch_size, n]`.
///
/// Buffers longer than required are fine, only the leading elements are used.
#[derive(Debug)]
pub struct MhaArgs<'a> {
    pub query: &'a [i8],
    pub key: &'a [i8],
    pub value: &'a [i8],
    pub mask: &'a [f32],
    pub query_scale: &'a [f32],
    pub key_scale: &'a [f32],
    pub value_scale: &'a [f32],
    pub output: &'a mut [i8],
    pub output_scale: &'a mut [f32],
    pub workspace: &'a mut [u8],
    pub sizes: DynamicSizes,
}

impl MhaArgs<'_> {
    pub(crate) fn check(&self, shape: &ProblemShape, layout: &WorkspaceLayout) -> Result<()> {
        let q_elems = shape.query_elem_count();
        let kv_elems = shape.key_elem_count();
        let q_rows = shape.batch_size * shape.m;
        let kv_rows = shape.batch_size * shape.n;
        for (slot, expected, got) in [
            (IoSlot::SrcQ, q_elems, self.query.len()),
            (IoSlot::SrcK, kv_elems, self.key.len()),
            (IoSlot::SrcV, kv_elems, self.value.len()),
            (IoSlot::BinaryAdd, kv_rows, self.mask.len()),
            (IoSlot::QScale, q_rows, self.query_scale.len()),
            (IoSlot::KScale, kv_rows, self.key_scale.len()),
            (IoSlot::VScale, kv_rows, self.value_scale.len()),
            (IoSlot::Dst, q_elems, self.output.len()),
            (IoSlot::DstScale, q_rows, self.output_scale.len()),
            (IoSlot::Workspace, layout.size_in_bytes(), self.workspace.len()),
        ] {
            if got < expected {
                return Err(Error::BufferTooSmall {
                    slot,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }
}

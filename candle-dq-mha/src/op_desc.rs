//! Abstract operator description: one tensor descriptor per io slot plus string
//! attributes.
use std::collections::HashMap;

use crate::DType;

/// The io slots of the dense multi-head attention operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSlot {
    SrcQ,
    SrcK,
    SrcV,
    /// Additive attention mask.
    BinaryAdd,
    Dst,
    Workspace,
    BatchSize,
    HeadNum,
    HeadSize,
    M,
    N,
    QScale,
    QZp,
    KScale,
    KZp,
    VScale,
    VZp,
    /// Static per-channel output scale.
    SrcDstScale,
    /// Static per-channel output zero-point.
    SrcDstZp,
    DstScale,
    DstZp,
}

impl IoSlot {
    pub const COUNT: usize = 21;

    pub const ALL: [IoSlot; Self::COUNT] = [
        Self::SrcQ,
        Self::SrcK,
        Self::SrcV,
        Self::BinaryAdd,
        Self::Dst,
        Self::Workspace,
        Self::BatchSize,
        Self::HeadNum,
        Self::HeadSize,
        Self::M,
        Self::N,
        Self::QScale,
        Self::QZp,
        Self::KScale,
        Self::KZp,
        Self::VScale,
        Self::VZp,
        Self::SrcDstScale,
        Self::SrcDstZp,
        Self::DstScale,
        Self::DstZp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Shape and element type of one operator tensor. Dimensions can be
/// non-positive to mark them as only known at run time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorDesc {
    shape: Vec<i64>,
    dtype: DType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Vec<i64>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Absent tensors have an empty shape.
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OperatorDesc {
    tensors: Vec<TensorDesc>,
    attrs: HashMap<String, String>,
}

impl Default for OperatorDesc {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorDesc {
    pub fn new() -> Self {
        Self {
            tensors: vec![TensorDesc::default(); IoSlot::COUNT],
            attrs: HashMap::new(),
        }
    }

    pub fn with_tensor(mut self, slot: IoSlot, desc: TensorDesc) -> Self {
        self.set_tensor(slot, desc);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn set_tensor(&mut self, slot: IoSlot, desc: TensorDesc) {
        self.tensors[slot.index()] = desc
    }

    pub fn tensor(&self, slot: IoSlot) -> &TensorDesc {
        &self.tensors[slot.index()]
    }

    pub fn tensors(&self) -> &[TensorDesc] {
        &self.tensors
    }

    pub fn attrs(&self) -> &HashMap<String, String> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| s.as_str())
    }
}

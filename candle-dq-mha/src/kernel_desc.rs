//! Kernel descriptor: checks an operator description against the requirements
//! of the dynamic quantization kernel and derives the problem dimensions.
use crate::op_desc::{IoSlot, OperatorDesc};
use crate::{DType, Error, KernelConfig, Result};

/// Attribute selecting the approximate exponential, has to be `"True"`.
pub const APPROX_EXP: &str = "approx_exp";
/// Attribute selecting the max-subtracted softmax, has to be `"False"`.
pub const STABLE_SOFTMAX: &str = "stable_softmax";

/// A problem dimension, either baked in the descriptor or provided by a scalar
/// tensor at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    fn from_desc(value: i64) -> Self {
        if value > 0 {
            Self::Static(value as usize)
        } else {
            Self::Dynamic
        }
    }

    pub fn as_static(&self) -> Option<usize> {
        match self {
            Self::Static(v) => Some(*v),
            Self::Dynamic => None,
        }
    }
}

/// Dimensions of the attention problem, query is `[batch_size, m, head_num,
/// head_size]` and key/value are `[batch_size, n, head_num, head_size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemDims {
    pub batch_size: Dim,
    pub head_num: Dim,
    pub m: Dim,
    pub head_size: Dim,
    pub n: Dim,
}

#[derive(Debug, Clone)]
pub struct KernelDesc {
    op_desc: OperatorDesc,
    config: KernelConfig,
}

impl KernelDesc {
    pub fn new(op_desc: OperatorDesc) -> Self {
        Self::with_config(op_desc, KernelConfig::default())
    }

    pub fn with_config(op_desc: OperatorDesc, config: KernelConfig) -> Self {
        Self { op_desc, config }
    }

    pub fn op_desc(&self) -> &OperatorDesc {
        &self.op_desc
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns true if the operator can run with this kernel. The first failing
    /// requirement is logged.
    pub fn validate(&self) -> bool {
        match self.check() {
            Ok(_) => true,
            Err(err) => {
                tracing::error!("dynamic quant mha kernel requires: {err}");
                false
            }
        }
    }

    /// Runs the checks, stopping at the first failure, and returns the derived
    /// problem dimensions.
    pub fn check(&self) -> Result<ProblemDims> {
        if let Some(isa) = self.config.required_isa {
            if !isa.is_available() {
                return Err(Error::UnsupportedIsa { isa });
            }
        }
        self.check_attr(APPROX_EXP, "True")?;
        self.check_attr(STABLE_SOFTMAX, "False")?;

        let q = self.shape(IoSlot::SrcQ);
        let k = self.shape(IoSlot::SrcK);
        if q.len() != 4 {
            return Err(Error::UnexpectedRank {
                slot: IoSlot::SrcQ,
                expected: 4,
                got: q.to_vec(),
            });
        }
        if k.len() != 4 {
            return Err(Error::UnexpectedRank {
                slot: IoSlot::SrcK,
                expected: 4,
                got: k.to_vec(),
            });
        }
        let (batch_size, m, head_num, head_size) = (q[0], q[1], q[2], q[3]);
        let n = k[1];

        for (dim, value, slot) in [
            ("batch_size", batch_size, IoSlot::BatchSize),
            ("head_num", head_num, IoSlot::HeadNum),
            ("m", m, IoSlot::M),
            ("head_size", head_size, IoSlot::HeadSize),
            ("n", n, IoSlot::N),
        ] {
            if value <= 0 && self.shape(slot) != [1] {
                return Err(Error::MissingDynamicSize { dim, value, slot });
            }
        }

        for (slot, expected) in [
            (IoSlot::SrcQ, vec![batch_size, m, head_num, head_size]),
            (IoSlot::SrcK, vec![batch_size, n, head_num, head_size]),
            (IoSlot::SrcV, vec![batch_size, n, head_num, head_size]),
            (IoSlot::Dst, vec![batch_size, m, head_num, head_size]),
            (IoSlot::BinaryAdd, vec![batch_size, 1, 1, n]),
            (IoSlot::QScale, vec![batch_size, m]),
            (IoSlot::KScale, vec![batch_size, n]),
            (IoSlot::VScale, vec![batch_size, n]),
            (IoSlot::DstScale, vec![batch_size, m]),
        ] {
            let got = self.shape(slot);
            if got != expected.as_slice() {
                return Err(Error::ShapeMismatch {
                    slot,
                    expected,
                    got: got.to_vec(),
                });
            }
        }

        // Only symmetric dynamic quantization is supported.
        for slot in [
            IoSlot::QZp,
            IoSlot::KZp,
            IoSlot::VZp,
            IoSlot::DstZp,
            IoSlot::SrcDstScale,
            IoSlot::SrcDstZp,
        ] {
            let desc = self.op_desc.tensor(slot);
            if !desc.is_empty() {
                return Err(Error::UnexpectedTensor {
                    slot,
                    shape: desc.shape().to_vec(),
                });
            }
        }

        self.check_dtypes(&[IoSlot::SrcQ, IoSlot::SrcK, IoSlot::SrcV, IoSlot::Dst], DType::S8)?;
        self.check_dtypes(
            &[
                IoSlot::BinaryAdd,
                IoSlot::QScale,
                IoSlot::KScale,
                IoSlot::VScale,
                IoSlot::DstScale,
            ],
            DType::F32,
        )?;

        Ok(ProblemDims {
            batch_size: Dim::from_desc(batch_size),
            head_num: Dim::from_desc(head_num),
            m: Dim::from_desc(m),
            head_size: Dim::from_desc(head_size),
            n: Dim::from_desc(n),
        })
    }

    fn shape(&self, slot: IoSlot) -> &[i64] {
        self.op_desc.tensor(slot).shape()
    }

    fn check_attr(&self, key: &'static str, expected: &'static str) -> Result<()> {
        match self.op_desc.attr(key) {
            Some(v) if v == expected => Ok(()),
            got => Err(Error::UnexpectedAttr {
                key,
                expected,
                got: got.map(|s| s.to_string()),
            }),
        }
    }

    fn check_dtypes(&self, slots: &[IoSlot], expected: DType) -> Result<()> {
        for &slot in slots {
            let got = self.op_desc.tensor(slot).dtype();
            if got != expected {
                return Err(Error::UnexpectedDType {
                    slot,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }
}

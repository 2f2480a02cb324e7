//! Element types declared by the operator description.

/// The element types a tensor descriptor can declare.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum DType {
    // Not set, used by absent tensors.
    #[default]
    Undef,
    // Signed 8 bits integer.
    S8,
    // Unsigned 8 bits integer.
    U8,
    // Signed 32 bits integer.
    S32,
    // Brain floating-point using half precision (16 bits).
    BF16,
    // Floating-point using single precision (32 bits).
    F32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DTypeParseError(String);

impl std::fmt::Display for DTypeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot parse '{}' as a dtype", self.0)
    }
}

impl std::error::Error for DTypeParseError {}

impl std::str::FromStr for DType {
    type Err = DTypeParseError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "undef" => Ok(Self::Undef),
            "s8" => Ok(Self::S8),
            "u8" => Ok(Self::U8),
            "s32" => Ok(Self::S32),
            "bf16" => Ok(Self::BF16),
            "f32" | "fp32" => Ok(Self::F32),
            _ => Err(DTypeParseError(s.to_string())),
        }
    }
}

impl DType {
    /// String representation for dtypes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::S8 => "s8",
            Self::U8 => "u8",
            Self::S32 => "s32",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
        }
    }

    /// The size used by each element in bytes, i.e. 1 for `S8`, 4 for `F32`.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Undef => 0,
            Self::S8 => 1,
            Self::U8 => 1,
            Self::S32 => 4,
            Self::BF16 => 2,
            Self::F32 => 4,
        }
    }
}

//! Host instruction set probing.
use std::sync::LazyLock;

/// Instruction set extensions relevant to the int8 attention kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Avx512Core,
    Avx512Vnni,
    AmxTile,
    AmxInt8,
    AmxBf16,
}

#[derive(Debug, PartialEq, Eq)]
pub struct IsaParseError(String);

impl std::fmt::Display for IsaParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot parse '{}' as an isa", self.0)
    }
}

impl std::error::Error for IsaParseError {}

impl std::str::FromStr for Isa {
    type Err = IsaParseError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "avx512_core" => Ok(Self::Avx512Core),
            "avx512_core_vnni" => Ok(Self::Avx512Vnni),
            "amx_tile" => Ok(Self::AmxTile),
            "amx_int8" => Ok(Self::AmxInt8),
            "amx_bf16" => Ok(Self::AmxBf16),
            _ => Err(IsaParseError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Isa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Isa {
    pub const ALL: [Isa; 5] = [
        Self::Avx512Core,
        Self::Avx512Vnni,
        Self::AmxTile,
        Self::AmxInt8,
        Self::AmxBf16,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avx512Core => "avx512_core",
            Self::Avx512Vnni => "avx512_core_vnni",
            Self::AmxTile => "amx_tile",
            Self::AmxInt8 => "amx_int8",
            Self::AmxBf16 => "amx_bf16",
        }
    }

    /// Whether the host cpu supports this extension and the os has enabled the
    /// register state it needs. The probe runs once per process.
    pub fn is_available(&self) -> bool {
        let host = &*HOST_FEATURES;
        match self {
            Self::Avx512Core => host.avx512_core,
            Self::Avx512Vnni => host.avx512_vnni,
            Self::AmxTile => host.amx_tile,
            Self::AmxInt8 => host.amx_int8,
            Self::AmxBf16 => host.amx_bf16,
        }
    }
}

static HOST_FEATURES: LazyLock<HostFeatures> = LazyLock::new(|| {
    let features = HostFeatures::probe();
    tracing::debug!(?features, "probed host isa");
    features
});

#[derive(Debug, Default, Clone, Copy)]
struct HostFeatures {
    avx512_core: bool,
    avx512_vnni: bool,
    amx_tile: bool,
    amx_int8: bool,
    amx_bf16: bool,
}

impl HostFeatures {
    #[cfg(target_arch = "x86_64")]
    #[allow(unused_unsafe)]
    fn probe() -> Self {
        use std::arch::x86_64::{__cpuid, __cpuid_count, __get_cpuid_max};

        // SAFETY: cpuid is always available on x86_64.
        let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
        if max_leaf < 7 {
            return Self::default();
        }
        let leaf1 = unsafe { __cpuid(1) };
        let osxsave = leaf1.ecx & (1 << 27) != 0;
        let xcr0 = if osxsave {
            // SAFETY: OSXSAVE is set so xgetbv is enabled.
            unsafe { xgetbv0() }
        } else {
            0
        };
        let leaf7 = unsafe { __cpuid_count(7, 0) };
        let bit = |reg: u32, b: u32| reg & (1 << b) != 0;

        // opmask, upper zmm and hi16 zmm state, plus the sse/avx state.
        let zmm_state = xcr0 & 0xe6 == 0xe6;
        // xtilecfg and xtiledata.
        let tile_state = xcr0 & (0b11 << 17) == (0b11 << 17);

        let avx512_core = zmm_state
            && bit(leaf7.ebx, 16) // avx512f
            && bit(leaf7.ebx, 17) // avx512dq
            && bit(leaf7.ebx, 30) // avx512bw
            && bit(leaf7.ebx, 31); // avx512vl
        let amx_tile = tile_state && bit(leaf7.edx, 24);
        Self {
            avx512_core,
            avx512_vnni: avx512_core && bit(leaf7.ecx, 11),
            amx_tile,
            amx_int8: amx_tile && bit(leaf7.edx, 25),
            amx_bf16: amx_tile && bit(leaf7.edx, 22),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn probe() -> Self {
        Self::default()
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "xsave")]
unsafe fn xgetbv0() -> u64 {
    std::arch::x86_64::_xgetbv(0)
}

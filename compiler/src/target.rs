// target.rs - Target capability descriptor
//
// A target is an (arch, bits, os) triple plus a set of feature flags. It is
// written as a dash-separated string, `x86-64-linux-avx2-profile`, or
// `host[-feature...]` for the build machine. Lowering gates passes on these
// features; nothing here queries the real hardware beyond `cfg!`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, Snafu};

use crate::ir::DeviceApi;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TargetParseError {
    #[snafu(display("empty target string"))]
    Empty,
    #[snafu(display("unknown target token `{token}` in `{target}`"))]
    UnknownToken { token: String, target: String },
    #[snafu(display("target `{target}` is missing {what}"))]
    Missing { what: &'static str, target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86,
    Arm,
    Hexagon,
    Wasm,
    RiscV,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Os {
    Linux,
    Windows,
    OsX,
    Android,
    Ios,
    NoOs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    Jit,
    Debug,
    Profile,
    NoAsserts,
    Sse41,
    Avx,
    Avx2,
    Avx512,
    Fma,
    Neon,
    Hvx,
    Cuda,
    OpenCl,
    Metal,
    IntelGpu,
    IntelFpga,
}

const ARCHES: &[(&str, Arch)] = &[
    ("x86", Arch::X86),
    ("arm", Arch::Arm),
    ("hexagon", Arch::Hexagon),
    ("wasm", Arch::Wasm),
    ("riscv", Arch::RiscV),
];

const OSES: &[(&str, Os)] = &[
    ("linux", Os::Linux),
    ("windows", Os::Windows),
    ("osx", Os::OsX),
    ("android", Os::Android),
    ("ios", Os::Ios),
    ("noos", Os::NoOs),
];

const FEATURES: &[(&str, Feature)] = &[
    ("jit", Feature::Jit),
    ("debug", Feature::Debug),
    ("profile", Feature::Profile),
    ("no_asserts", Feature::NoAsserts),
    ("sse41", Feature::Sse41),
    ("avx", Feature::Avx),
    ("avx2", Feature::Avx2),
    ("avx512", Feature::Avx512),
    ("fma", Feature::Fma),
    ("neon", Feature::Neon),
    ("hvx", Feature::Hvx),
    ("cuda", Feature::Cuda),
    ("opencl", Feature::OpenCl),
    ("metal", Feature::Metal),
    ("intel_gpu", Feature::IntelGpu),
    ("intel_fpga", Feature::IntelFpga),
];

fn lookup<T: Copy>(table: &[(&str, T)], token: &str) -> Option<T> {
    table.iter().find(|(n, _)| *n == token).map(|(_, v)| *v)
}

fn name_of<T: PartialEq>(table: &[(&'static str, T)], value: &T) -> &'static str {
    table
        .iter()
        .find(|(_, v)| v == value)
        .map(|(n, _)| *n)
        .unwrap_or("?")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
    pub arch: Arch,
    pub bits: u8,
    pub os: Os,
    pub features: BTreeSet<Feature>,
}

impl Default for Target {
    fn default() -> Self {
        Target::host()
    }
}

impl Target {
    pub fn new(arch: Arch, bits: u8, os: Os) -> Self {
        Target {
            arch,
            bits,
            os,
            features: BTreeSet::new(),
        }
    }

    /// The machine this crate was built for.
    pub fn host() -> Self {
        let arch = if cfg!(target_arch = "aarch64") || cfg!(target_arch = "arm") {
            Arch::Arm
        } else if cfg!(target_arch = "wasm32") {
            Arch::Wasm
        } else if cfg!(target_arch = "riscv64") {
            Arch::RiscV
        } else {
            Arch::X86
        };
        let os = if cfg!(target_os = "windows") {
            Os::Windows
        } else if cfg!(target_os = "macos") {
            Os::OsX
        } else if cfg!(target_os = "android") {
            Os::Android
        } else if cfg!(target_os = "ios") {
            Os::Ios
        } else {
            Os::Linux
        };
        let bits = if cfg!(target_pointer_width = "32") { 32 } else { 64 };
        Target::new(arch, bits, os)
    }

    pub fn with_feature(mut self, f: Feature) -> Self {
        self.features.insert(f);
        self
    }

    pub fn without_feature(mut self, f: Feature) -> Self {
        self.features.remove(&f);
        self
    }

    pub fn has_feature(&self, f: Feature) -> bool {
        self.features.contains(&f)
    }

    pub fn has_gpu_feature(&self) -> bool {
        [Feature::Cuda, Feature::OpenCl, Feature::Metal, Feature::IntelGpu]
            .iter()
            .any(|f| self.has_feature(*f))
    }

    /// Whether vector loads and stores may carry a lane mask.
    pub fn supports_predicated_memory(&self) -> bool {
        self.has_feature(Feature::Hvx) || self.has_feature(Feature::IntelGpu)
    }

    pub fn is_fpga(&self) -> bool {
        self.has_feature(Feature::IntelFpga)
    }

    /// The device API that `DeviceApi::DefaultGpu` resolves to.
    pub fn default_gpu_api(&self) -> Option<DeviceApi> {
        if self.has_feature(Feature::Cuda) {
            Some(DeviceApi::Cuda)
        } else if self.has_feature(Feature::OpenCl) || self.has_feature(Feature::IntelGpu) {
            Some(DeviceApi::OpenCl)
        } else if self.has_feature(Feature::Metal) {
            Some(DeviceApi::Metal)
        } else {
            None
        }
    }

    /// Native SIMD register width in bits, used as a vector-width hint.
    pub fn vector_bits(&self) -> u32 {
        if self.has_feature(Feature::Hvx) {
            1024
        } else if self.has_feature(Feature::Avx512) {
            512
        } else if self.has_feature(Feature::Avx2) || self.has_feature(Feature::Avx) {
            256
        } else {
            128
        }
    }

    pub fn supports_device_api(&self, api: DeviceApi) -> bool {
        match api {
            DeviceApi::None | DeviceApi::Host => true,
            DeviceApi::DefaultGpu => self.has_gpu_feature(),
            DeviceApi::Cuda => self.has_feature(Feature::Cuda),
            DeviceApi::OpenCl => {
                self.has_feature(Feature::OpenCl) || self.has_feature(Feature::IntelGpu)
            }
            DeviceApi::Metal => self.has_feature(Feature::Metal),
            DeviceApi::Hexagon => self.has_feature(Feature::Hvx),
            DeviceApi::IntelFpga => self.has_feature(Feature::IntelFpga),
        }
    }
}

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ensure!(!s.is_empty(), EmptySnafu);
        let mut tokens = s.split('-').peekable();
        let mut target = if tokens.peek() == Some(&"host") {
            tokens.next();
            Target::host()
        } else {
            let arch_tok = tokens.next().context(EmptySnafu)?;
            let arch = lookup(ARCHES, arch_tok).context(UnknownTokenSnafu {
                token: arch_tok,
                target: s,
            })?;
            let bits_tok = tokens.next().context(MissingSnafu {
                what: "a bit width",
                target: s,
            })?;
            let bits: u8 = match bits_tok {
                "32" => 32,
                "64" => 64,
                other => {
                    return UnknownTokenSnafu {
                        token: other,
                        target: s,
                    }
                    .fail()
                }
            };
            let os_tok = tokens.next().context(MissingSnafu {
                what: "an operating system",
                target: s,
            })?;
            let os = lookup(OSES, os_tok).context(UnknownTokenSnafu {
                token: os_tok,
                target: s,
            })?;
            Target::new(arch, bits, os)
        };
        for tok in tokens {
            let f = lookup(FEATURES, tok).context(UnknownTokenSnafu {
                token: tok,
                target: s,
            })?;
            target.features.insert(f);
        }
        Ok(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            name_of(ARCHES, &self.arch),
            self.bits,
            name_of(OSES, &self.os)
        )?;
        for feat in &self.features {
            write!(f, "-{}", name_of(FEATURES, feat))?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Target {
    type Error = TargetParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Target> for String {
    fn from(t: Target) -> String {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        let t: Target = "x86-64-linux-avx2-profile".parse().unwrap();
        assert_eq!(t.arch, Arch::X86);
        assert_eq!(t.bits, 64);
        assert!(t.has_feature(Feature::Avx2));
        assert!(t.has_feature(Feature::Profile));
        assert_eq!(t.to_string(), "x86-64-linux-profile-avx2");
        assert_eq!(t.vector_bits(), 256);
    }

    #[test]
    fn host_with_features() {
        let t: Target = "host-cuda-jit".parse().unwrap();
        assert!(t.has_gpu_feature());
        assert_eq!(t.default_gpu_api(), Some(DeviceApi::Cuda));
        assert!(t.has_feature(Feature::Jit));
    }

    #[test]
    fn rejects_unknown_tokens() {
        let err = "x86-64-linux-sparkles".parse::<Target>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown target token `sparkles` in `x86-64-linux-sparkles`"
        );
        assert!(matches!("x86".parse::<Target>(), Err(TargetParseError::Missing { .. })));
        assert!(matches!("".parse::<Target>(), Err(TargetParseError::Empty)));
    }

    #[test]
    fn predicated_memory_targets() {
        let hvx: Target = "hexagon-32-noos-hvx".parse().unwrap();
        assert!(hvx.supports_predicated_memory());
        assert!(!Target::host().supports_predicated_memory());
    }

    #[test]
    fn serde_uses_the_string_form() {
        let t: Target = "arm-64-android-neon".parse().unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"arm-64-android-neon\"");
        let back: Target = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}

//! Operating system and CPU architecture detection.
//!
//! Maps the environment's OS and architecture descriptors onto the closed set
//! of platforms the native module bundle knows about.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};

/// Operating systems recognized by the module bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

impl Os {
    /// All variants in matching order.
    pub const ALL: [Os; 3] = [Os::MacOs, Os::Linux, Os::Windows];

    /// Returns the string representation of the OS.
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::Windows => "windows",
        }
    }

    /// Returns true if `name` identifies this OS.
    ///
    /// Matching is case-insensitive: "mac os x" (and Rust's "macos"/"darwin")
    /// anywhere in the name, "linux" anywhere, or a "windows" prefix.
    fn matches(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        match self {
            Os::MacOs => {
                name.contains("mac os x") || name.contains("macos") || name.contains("darwin")
            }
            Os::Linux => name.contains("linux"),
            Os::Windows => name.starts_with("windows"),
        }
    }

    /// Resolves an OS descriptor string.
    pub fn resolve(name: &str) -> Result<Self> {
        let os = Os::ALL
            .into_iter()
            .find(|os| os.matches(name))
            .ok_or_else(|| {
                SdError::unsupported_platform(format!("operating system \"{}\"", name))
            })?;
        tracing::trace!(descriptor = name, os = %os, "matched operating system");
        Ok(os)
    }

    /// Resolves the OS this process runs on.
    pub fn current() -> Result<Self> {
        Self::resolve(std::env::consts::OS)
    }

    /// Returns true if a loaded dynamic module keeps its file locked.
    ///
    /// Such files cannot be deleted while the process that loaded them lives.
    pub fn locks_loaded_modules(&self) -> bool {
        matches!(self, Os::Windows)
    }
}

impl std::fmt::Display for Os {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// CPU architectures recognized by the module bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_32,
    X86_64,
    ArmV8,
}

impl Arch {
    /// All variants in matching order.
    pub const ALL: [Arch; 3] = [Arch::X86_32, Arch::X86_64, Arch::ArmV8];

    /// Returns the string representation of the architecture.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_32 => "x86_32",
            Arch::X86_64 => "x86_64",
            Arch::ArmV8 => "armv8",
        }
    }

    /// Exact aliases naming this architecture.
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Arch::X86_32 => &["i386", "i686", "x86"],
            Arch::X86_64 => &["amd64", "x86_64"],
            Arch::ArmV8 => &["arm", "aarch64"],
        }
    }

    /// Resolves an architecture descriptor string by exact alias match.
    pub fn resolve(name: &str) -> Result<Self> {
        let arch = Arch::ALL
            .into_iter()
            .find(|arch| arch.aliases().contains(&name))
            .ok_or_else(|| SdError::unsupported_platform(format!("architecture \"{}\"", name)))?;
        tracing::trace!(descriptor = name, arch = %arch, "matched architecture");
        Ok(arch)
    }

    /// Resolves the architecture this process runs on.
    pub fn current() -> Result<Self> {
        Self::resolve(std::env::consts::ARCH)
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved (OS, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformDescriptor {
    /// Resolves a platform from explicit OS and architecture descriptors.
    pub fn from_descriptors(os_name: &str, arch_name: &str) -> Result<Self> {
        Ok(Self {
            os: Os::resolve(os_name)?,
            arch: Arch::resolve(arch_name)?,
        })
    }

    /// Resolves the platform this process runs on.
    pub fn current() -> Result<Self> {
        Ok(Self {
            os: Os::current()?,
            arch: Arch::current()?,
        })
    }
}

impl std::fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

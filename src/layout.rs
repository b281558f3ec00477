//! Installed-binary layout.
//!
//! An external installer lays out ready-to-run executables for one CPU
//! architecture under `<base_dir>/bin`. This module only reads that
//! directory: it maps logical executables to absolute paths and picks the
//! architecture the rest of the crate builds paths for.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),
}

/// Android ABI names of the architectures binaries are shipped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
    Arm64V8a,
    ArmeabiV7a,
    X86_64,
    X86,
}

impl Abi {
    /// ABI of the running build target.
    pub fn detect() -> Result<Self, LayoutError> {
        Self::from_target_arch(std::env::consts::ARCH)
    }

    pub fn from_target_arch(arch: &str) -> Result<Self, LayoutError> {
        match arch {
            "aarch64" => Ok(Abi::Arm64V8a),
            "arm" => Ok(Abi::ArmeabiV7a),
            "x86_64" => Ok(Abi::X86_64),
            "x86" => Ok(Abi::X86),
            other => Err(LayoutError::UnsupportedArch(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Abi::Arm64V8a => "arm64-v8a",
            Abi::ArmeabiV7a => "armeabi-v7a",
            Abi::X86_64 => "x86_64",
            Abi::X86 => "x86",
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Abi::Arm64V8a | Abi::X86_64)
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Abi {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm64-v8a" => Ok(Abi::Arm64V8a),
            "armeabi-v7a" => Ok(Abi::ArmeabiV7a),
            "x86_64" => Ok(Abi::X86_64),
            "x86" => Ok(Abi::X86),
            other => Err(LayoutError::UnsupportedArch(other.to_string())),
        }
    }
}

/// A named artifact inside the private binaries directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutableRef(String);

impl ExecutableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLayout {
    bin_dir: PathBuf,
    abi: Abi,
}

impl BinaryLayout {
    pub fn new(base_dir: impl AsRef<Path>, abi: Abi) -> Self {
        Self {
            bin_dir: base_dir.as_ref().join("bin"),
            abi,
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn path_of(&self, exe: &ExecutableRef) -> PathBuf {
        self.bin_dir.join(exe.name())
    }

    /// Existence and executability only; contents are trusted.
    pub fn is_runnable(&self, exe: &ExecutableRef) -> bool {
        is_executable(&self.path_of(exe))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_target_arch_to_abi() {
        assert_eq!(Abi::from_target_arch("aarch64").unwrap(), Abi::Arm64V8a);
        assert_eq!(Abi::from_target_arch("arm").unwrap(), Abi::ArmeabiV7a);
        assert!(Abi::Arm64V8a.is_64bit());
        assert!(!Abi::ArmeabiV7a.is_64bit());
    }

    #[test]
    fn unsupported_arch_is_an_error() {
        let err = Abi::from_target_arch("riscv64").unwrap_err();
        assert_eq!(err, LayoutError::UnsupportedArch("riscv64".into()));
        assert!("mips".parse::<Abi>().is_err());
    }

    #[test]
    fn abi_round_trips_through_its_name() {
        for abi in [Abi::Arm64V8a, Abi::ArmeabiV7a, Abi::X86_64, Abi::X86] {
            assert_eq!(abi.as_str().parse::<Abi>().unwrap(), abi);
        }
    }

    #[test]
    fn resolves_paths_under_bin() {
        let layout = BinaryLayout::new("/data/app", Abi::Arm64V8a);
        assert_eq!(
            layout.path_of(&ExecutableRef::new("policy_cli")),
            PathBuf::from("/data/app/bin/policy_cli")
        );
    }

    #[cfg(unix)]
    #[test]
    fn runnable_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let layout = BinaryLayout::new(dir.path(), Abi::X86_64);
        std::fs::create_dir_all(layout.bin_dir()).unwrap();
        let exe = ExecutableRef::new("tool");
        let path = layout.path_of(&exe);

        assert!(!layout.is_runnable(&exe));
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!layout.is_runnable(&exe));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(layout.is_runnable(&exe));
    }
}

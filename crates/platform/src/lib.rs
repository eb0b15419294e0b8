//! relpy-platform: architecture, OS and toolchain-triple model
//!
//! This crate provides the platform vocabulary shared by the build pipeline:
//! - `Arch`: CPU architectures a runtime can be built for
//! - `Os`: operating systems with a supported build process
//! - `Triple`: full toolchain triples (e.g. "x86_64-linux-gnu")
//! - `paths`: default on-disk locations for work trees and caches

pub mod arch;
pub mod os;
pub mod paths;
pub mod triple;

pub use arch::Arch;
pub use os::Os;
pub use triple::Triple;

use std::fmt;

/// Platform identifier combining architecture and OS (e.g. "x86_64-linux").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the platform this process is running on.
  ///
  /// Returns `None` if the OS or architecture is not supported.
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// The full toolchain triple for this platform.
  pub fn triple(&self) -> Triple {
    Triple::new(self.arch, self.os)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.arch, self.os)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn platform_display_format() {
    let platform = Platform::new(Arch::X86_64, Os::Linux);
    assert_eq!(platform.to_string(), "x86_64-linux");

    let platform = Platform::new(Arch::Aarch64, Os::Linux);
    assert_eq!(platform.to_string(), "aarch64-linux");
  }

  #[test]
  fn platform_triple_is_gnu_on_linux() {
    let platform = Platform::new(Arch::X86_64, Os::Linux);
    assert_eq!(platform.triple().as_str(), "x86_64-linux-gnu");
  }
}

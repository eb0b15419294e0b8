//! Toolchain triples.
//!
//! The build pipeline distinguishes the *build* triple (the machine running
//! the compilers) from the *host* triple (the machine the produced runtime
//! will run on). When the two differ the build is a cross compile and the
//! toolchain's sysroot for the host triple is used.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::arch::{Arch, UnknownArch};
use crate::os::Os;

/// A full toolchain triple such as "x86_64-linux-gnu" or "aarch64-linux-gnu".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Triple(String);

impl Triple {
  /// The conventional triple for an arch/OS pair.
  pub fn new(arch: Arch, os: Os) -> Self {
    let s = match os {
      Os::Linux => format!("{}-linux-gnu", arch),
      Os::Darwin => format!("{}-apple-darwin", arch),
      Os::Windows => format!("{}-pc-windows-msvc", arch),
    };
    Self(s)
  }

  /// Parse a triple from a raw string, keeping it verbatim.
  ///
  /// The leading component must name a supported architecture; the rest of
  /// the triple is carried through to configure scripts untouched.
  pub fn parse(s: &str) -> Result<Self, UnknownArch> {
    let arch_part = s.split('-').next().unwrap_or(s);
    arch_part.parse::<Arch>()?;
    Ok(Self(s.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The architecture component of the triple.
  pub fn arch(&self) -> Arch {
    // parse() and new() guarantee the leading component is valid
    self
      .0
      .split('-')
      .next()
      .and_then(|a| a.parse().ok())
      .expect("triple carries a valid architecture")
  }

  /// Whether this triple targets a Linux system.
  pub fn is_linux(&self) -> bool {
    self.0.contains("linux")
  }
}

impl fmt::Display for Triple {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for Triple {
  type Err = UnknownArch;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

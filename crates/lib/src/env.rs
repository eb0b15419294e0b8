//! Per-step process-environment composition.
//!
//! The composer derives one immutable environment mapping per step from the
//! working directories and the platform facts. It is built from an ordered
//! list of contribution functions so flag assembly lives in one place instead
//! of being repeated across recipes; graph- and step-level callbacks then
//! extend (never replace) the result. Composition only produces a mapping —
//! the calling process's own environment is never mutated.

use std::path::{Path, PathBuf};

use relpy_platform::{Platform, Triple};
use thiserror::Error;

use crate::dirs::Dirs;
use crate::spec::EnvMap;

/// Environment composition errors.
#[derive(Debug, Error)]
pub enum EnvError {
  /// A required triple or architecture value is absent.
  #[error("missing platform fact: {fact}")]
  MissingPlatformFact { fact: &'static str },
}

/// Platform facts the composer needs: the triple of the machine running the
/// compilers, the triple the produced runtime targets, and (for cross builds
/// of the runtime itself) a native interpreter for the build machine.
#[derive(Debug, Clone, Default)]
pub struct PlatformFacts {
  pub build: Option<Triple>,
  pub host: Option<Triple>,
  pub native_python: Option<PathBuf>,
}

impl PlatformFacts {
  /// Facts for a native build on the current machine.
  pub fn native() -> Self {
    let triple = Platform::current().map(|p| p.triple());
    Self {
      build: triple.clone(),
      host: triple,
      native_python: None,
    }
  }

  /// Facts for building on the current machine for `host`.
  pub fn for_host(host: Triple) -> Self {
    Self {
      build: Platform::current().map(|p| p.triple()),
      host: Some(host),
      native_python: None,
    }
  }

  pub fn with_native_python(mut self, python: impl Into<PathBuf>) -> Self {
    self.native_python = Some(python.into());
    self
  }
}

/// Resolved facts handed to each contribution.
struct Context<'a> {
  dirs: &'a Dirs,
  build: &'a Triple,
  host: &'a Triple,
  native_python: Option<&'a Path>,
}

type Contribution = for<'a> fn(&mut EnvMap, &Context<'a>);

/// Ordered base contributions. Later entries may read what earlier ones set.
const BASE_CONTRIBUTIONS: &[Contribution] = &[
  triple_vars,
  toolchain_compilers,
  search_path,
  compiler_flags,
  linker_flags,
];

/// Compose the base environment for one step.
pub fn compose(dirs: &Dirs, facts: &PlatformFacts) -> Result<EnvMap, EnvError> {
  let build = facts
    .build
    .as_ref()
    .ok_or(EnvError::MissingPlatformFact { fact: "build triple" })?;
  let host = facts
    .host
    .as_ref()
    .ok_or(EnvError::MissingPlatformFact { fact: "host triple" })?;

  let ctx = Context {
    dirs,
    build,
    host,
    native_python: facts.native_python.as_deref(),
  };

  let mut env = EnvMap::new();
  for contribute in BASE_CONTRIBUTIONS {
    contribute(&mut env, &ctx);
  }
  Ok(env)
}

/// Append whitespace-joined flags to `key`, preserving anything already set.
pub fn append_flags(env: &mut EnvMap, key: &str, flags: &[String]) {
  let joined = flags.join(" ");
  match env.get_mut(key) {
    Some(existing) if !existing.is_empty() => {
      existing.push(' ');
      existing.push_str(&joined);
    }
    _ => {
      env.insert(key.to_string(), joined);
    }
  }
}

/// Prepend a directory to a PATH-style variable.
pub fn prepend_path(env: &mut EnvMap, key: &str, dir: &Path) {
  let dir = dir.display().to_string();
  let value = match env.get(key) {
    Some(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
    _ => dir,
  };
  env.insert(key.to_string(), value);
}

fn triple_vars(env: &mut EnvMap, ctx: &Context<'_>) {
  env.insert("RELPY_BUILD".to_string(), ctx.build.to_string());
  env.insert("RELPY_HOST".to_string(), ctx.host.to_string());
  env.insert("RELPY_BUILD_ARCH".to_string(), ctx.build.arch().to_string());
  env.insert("RELPY_HOST_ARCH".to_string(), ctx.host.arch().to_string());
  if let Some(python) = ctx.native_python {
    env.insert("RELPY_NATIVE_PY".to_string(), python.display().to_string());
  }
}

fn toolchain_compilers(env: &mut EnvMap, ctx: &Context<'_>) {
  // Full paths so configure scripts never pick up a system compiler.
  let bin = ctx.dirs.toolchain.join("bin");
  env.insert(
    "CC".to_string(),
    format!("{}/{}-gcc -no-pie", bin.display(), ctx.host),
  );
  env.insert(
    "CXX".to_string(),
    format!("{}/{}-g++ -no-pie", bin.display(), ctx.host),
  );
}

fn search_path(env: &mut EnvMap, ctx: &Context<'_>) {
  // Prefix bin comes after toolchain bin but ahead of the system path, so
  // libtirpc can find krb5-config from an earlier step's install.
  if let Ok(system_path) = std::env::var("PATH") {
    env.insert("PATH".to_string(), system_path);
  }
  prepend_path(env, "PATH", &ctx.dirs.prefix.join("bin"));
  prepend_path(env, "PATH", &ctx.dirs.toolchain.join("bin"));
}

fn compiler_flags(env: &mut EnvMap, ctx: &Context<'_>) {
  let prefix = &ctx.dirs.prefix;
  let sysroot_include = ctx
    .dirs
    .toolchain
    .join(ctx.host.as_str())
    .join("sysroot/usr/include");

  let includes = [
    format!("-I{}/include", prefix.display()),
    format!("-I{}/include/readline", prefix.display()),
    format!("-I{}/include/ncursesw", prefix.display()),
    format!("-I{}", sysroot_include.display()),
  ];

  let mut cflags = vec!["-g".to_string()];
  cflags.extend(includes.iter().cloned());
  append_flags(env, "CFLAGS", &cflags);

  // CPPFLAGS are what Python's setup.py consults to locate zlib and sqlite.
  let cppflags: Vec<String> = includes.to_vec();
  append_flags(env, "CPPFLAGS", &cppflags);
  append_flags(env, "CXXFLAGS", &cppflags);
}

fn linker_flags(env: &mut EnvMap, ctx: &Context<'_>) {
  let prefix = &ctx.dirs.prefix;
  let sysroot_lib = ctx.dirs.toolchain.join(ctx.host.as_str()).join("sysroot/lib");

  let ldflags = [
    "-Wl,--build-id=sha1".to_string(),
    format!("-Wl,--rpath={}/lib", prefix.display()),
    format!("-L{}/lib", prefix.display()),
    format!("-L{}", sysroot_lib.display()),
    "-static-libstdc++".to_string(),
  ];
  append_flags(env, "LDFLAGS", &ldflags);
  env.insert("LD_LIBRARY_PATH".to_string(), format!("{}/lib", prefix.display()));
}

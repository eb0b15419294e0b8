//! The Linux build graphs.
//!
//! One base graph pinned at Python 3.10.14 plus cloned version lines for
//! 3.11.8 and 3.12.0. Build callbacks drive autoconf-style sources through
//! configure/make/install in the composed cross environment; the few
//! packages with non-standard build systems (openssl, bzip2, ncurses, zlib)
//! get dedicated callbacks.

use crate::check::{VersionProbe, detect};
use crate::cmd::runcmd;
use crate::dirs::Dirs;
use crate::env::append_flags;
use crate::executor::StepError;
use crate::graph::{BuildGraph, GraphBuilder, GraphError, GraphRegistry};
use crate::hash::Checksum;
use crate::log::StepLog;
use crate::patch::{Patch, apply_patch};
use crate::spec::{BuildSpec, EnvMap, Source};

/// Disables Debian/Ubuntu multiarch path probing in Python's setup.py, which
/// would leak host-system library directories into the relocatable build.
/// Opaque, pinned to the 3.10/3.11 setup.py; 3.12 dropped setup.py entirely.
const PYTHON_SETUP_PATCH: &str = r#"--- ./setup.py
+++ ./setup.py
@@ -664,6 +664,7 @@
             self.failed.append(ext.name)

     def add_multiarch_paths(self):
+        return
         # Debian/Ubuntu multiarch support.
         # https://wiki.ubuntu.com/MultiarchSpec
         tmpfile = os.path.join(self.build_temp, 'multiarch')
"#;

/// Register the Linux version lines: the 3.10.14 base graph and its clones.
pub fn register(registry: &mut GraphRegistry) -> Result<(), GraphError> {
  let base = graph("3.10.14", "05148354ce821ba7369e5b7958435400")?;
  let py311 = base.clone_with("3.11.8", Checksum::Md5("b353b8433e560e1af2b130f56dfbd973".to_string()));
  let py312 = base.clone_with("3.12.0", Checksum::Md5("f6f4616584b23254d165f4db90c247d6".to_string()));
  registry.add(base)?;
  registry.add(py311)?;
  registry.add(py312)?;
  Ok(())
}

/// The full Linux graph for one runtime version.
pub fn graph(version: &str, runtime_md5: &str) -> Result<BuildGraph, GraphError> {
  let mut builder = GraphBuilder::new("linux", "python", version);

  builder.add(
    BuildSpec::new("openssl", build_openssl)
      .with_source(Source {
        url: "https://www.openssl.org/source/openssl-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/openssl-{version}.tar.gz".to_string()),
        version: "3.2.1".to_string(),
        checksum: Checksum::Md5("c239213887804ba00654884918b37441".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://www.openssl.org/source/".to_string(),
        detect: detect::tarball_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("openssl-fips-module", build_openssl_fips)
      .with_depends(&["openssl"])
      .with_source(Source {
        url: "https://www.openssl.org/source/openssl-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/openssl-{version}.tar.gz".to_string()),
        version: "3.0.8".to_string(),
        checksum: Checksum::Md5("61e017cf4fea1b599048f621f1490fbd".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://www.openssl.org/source/".to_string(),
        detect: detect::tarball_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("libxcrypt", build_default)
      .with_source(Source {
        url: "https://github.com/besser82/libxcrypt/releases/download/v{version}/libxcrypt-{version}.tar.gz"
          .to_string(),
        fallback_url: None,
        version: "4.4.36".to_string(),
        checksum: Checksum::Md5("b84cd4104e08c975063ec6c4d0372446".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://github.com/besser82/libxcrypt/releases/".to_string(),
        detect: detect::github_version,
      }),
  )?;

  builder.add(BuildSpec::new("xz", build_default).with_source(Source {
    url: "http://tukaani.org/xz/xz-{version}.tar.gz".to_string(),
    fallback_url: Some("https://mirror.relpy.io/dependencies/xz-{version}.tar.gz".to_string()),
    version: "5.4.4".to_string(),
    checksum: Checksum::Md5("b9c34fed669c3e84aa1fa1246a99943b".to_string()),
  }))?;

  builder.add(
    BuildSpec::new("sqlite", build_default)
      .with_source(Source {
        url: "https://sqlite.org/2024/sqlite-autoconf-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/sqlite-autoconf-{version}.tar.gz".to_string()),
        version: "3450200".to_string(),
        checksum: Checksum::Md5("27436d5446f3e2afa6bc2e82f9c4f6ba".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://sqlite.org/".to_string(),
        detect: detect::sqlite_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("bzip2", build_bzip2)
      .with_source(Source {
        url: "https://sourceware.org/pub/bzip2/bzip2-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/bzip2-{version}.tar.gz".to_string()),
        version: "1.0.8".to_string(),
        checksum: Checksum::Md5("67e051268d0c475ea773822f7500d0e5".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://sourceware.org/pub/bzip2/".to_string(),
        detect: detect::tarball_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("gdbm", build_gdbm).with_source(Source {
      url: "https://ftp.gnu.org/gnu/gdbm/gdbm-{version}.tar.gz".to_string(),
      fallback_url: Some("https://mirror.relpy.io/dependencies/gdbm-{version}.tar.gz".to_string()),
      version: "1.23".to_string(),
      checksum: Checksum::Md5("8551961e36bf8c70b7500d255d3658ec".to_string()),
    }),
  )?;

  builder.add(
    BuildSpec::new("ncurses", build_ncurses).with_source(Source {
      url: "https://ftp.gnu.org/pub/gnu/ncurses/ncurses-{version}.tar.gz".to_string(),
      fallback_url: Some("https://mirror.relpy.io/dependencies/ncurses-{version}.tar.gz".to_string()),
      version: "6.4".to_string(),
      checksum: Checksum::Md5("5a62487b5d4ac6b132fe2bf9f8fad29b".to_string()),
    }),
  )?;

  builder.add(
    BuildSpec::new("libffi", build_libffi)
      .with_source(Source {
        url: "https://github.com/libffi/libffi/releases/download/v{version}/libffi-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/libffi-{version}.tar.gz".to_string()),
        version: "3.4.6".to_string(),
        checksum: Checksum::Md5("b9cac6c5997dca2b3787a59ede34e0eb".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://github.com/libffi/libffi/releases/".to_string(),
        detect: detect::github_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("zlib", build_zlib)
      .with_env(zlib_env)
      .with_source(Source {
        url: "https://zlib.net/fossils/zlib-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/zlib-{version}.tar.gz".to_string()),
        version: "1.3.1".to_string(),
        checksum: Checksum::Md5("9855b6d802d7fe5b7bd5b196a2271655".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://zlib.net/fossils/".to_string(),
        detect: detect::tarball_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("uuid", build_default)
      .with_source(Source {
        url: "https://sourceforge.net/projects/libuuid/files/libuuid-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/libuuid-{version}.tar.gz".to_string()),
        version: "1.0.3".to_string(),
        checksum: Checksum::Md5("d44d866d06286c08ba0846aba1086d68".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://sourceforge.net/projects/libuuid/files/".to_string(),
        detect: detect::uuid_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("krb5", build_krb5)
      .with_depends(&["openssl"])
      .with_env(krb5_env)
      .with_source(Source {
        url: "https://kerberos.org/dist/krb5/{version}/krb5-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/krb5-{version}.tar.gz".to_string()),
        version: "1.21".to_string(),
        checksum: Checksum::Md5("304b335236d86a7e8effec31bd782baf".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://kerberos.org/dist/krb5/".to_string(),
        detect: detect::krb_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("readline", build_readline)
      .with_depends(&["ncurses"])
      .with_env(readline_env)
      .with_source(Source {
        url: "https://ftp.gnu.org/gnu/readline/readline-{version}.tar.gz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/readline-{version}.tar.gz".to_string()),
        version: "8.2".to_string(),
        checksum: Checksum::Md5("4aa1b31be779e6b84f9a96cb66bc50f6".to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://ftp.gnu.org/gnu/readline/".to_string(),
        detect: detect::tarball_version,
      }),
  )?;

  builder.add(
    BuildSpec::new("tirpc", build_default).with_depends(&["krb5"]).with_source(Source {
      url: "https://downloads.sourceforge.net/libtirpc/libtirpc-{version}.tar.bz2".to_string(),
      fallback_url: Some("https://mirror.relpy.io/dependencies/libtirpc-{version}.tar.bz2".to_string()),
      version: "1.3.4".to_string(),
      checksum: Checksum::Md5("375dbe7ceb2d0300d173fb40321b49b6".to_string()),
    }),
  )?;

  builder.add(
    BuildSpec::new("python", build_python)
      .with_depends(&[
        "openssl",
        "libxcrypt",
        "xz",
        "sqlite",
        "bzip2",
        "gdbm",
        "ncurses",
        "libffi",
        "zlib",
        "uuid",
        "krb5",
        "readline",
        "tirpc",
      ])
      .with_env(python_env)
      .with_source(Source {
        url: "https://www.python.org/ftp/python/{version}/Python-{version}.tar.xz".to_string(),
        fallback_url: Some("https://mirror.relpy.io/dependencies/Python-{version}.tar.xz".to_string()),
        version: version.to_string(),
        checksum: Checksum::Md5(runtime_md5.to_string()),
      })
      .with_probe(VersionProbe {
        check_url: "https://www.python.org/ftp/python/".to_string(),
        detect: detect::python_version,
      }),
  )?;

  builder.add(BuildSpec::new("finalize", finalize).with_depends(&["python"]))?;

  builder.finish()
}

fn prefix_arg(dirs: &Dirs) -> String {
  format!("--prefix={}", dirs.prefix.display())
}

fn build_host_args(env: &EnvMap) -> Vec<String> {
  let mut args = Vec::new();
  if let (Some(build), Some(host)) = (env.get("RELPY_BUILD"), env.get("RELPY_HOST")) {
    args.push(format!("--build={build}"));
    args.push(format!("--host={host}"));
  }
  args
}

/// Standard autoconf flow: configure with the cross pair, make, install.
pub fn build_default(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let mut configure = vec!["./configure".to_string(), prefix_arg(dirs)];
  configure.extend(build_host_args(env));
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

fn openssl_target(env: &EnvMap) -> &'static str {
  match env.get("RELPY_HOST_ARCH").map(String::as_str) {
    Some("aarch64") => "linux-aarch64",
    _ => "linux-x86_64",
  }
}

fn build_openssl(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let configure = vec![
    "./Configure".to_string(),
    openssl_target(env).to_string(),
    "no-idea".to_string(),
    "shared".to_string(),
    prefix_arg(dirs),
    format!("--openssldir={}/ssl", dirs.prefix.display()),
  ];
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  // install_sw skips the man pages, which have no place in a runtime tree
  runcmd(&["make", "install_sw", "install_ssldirs"], env, &dirs.source, log)
}

/// Build the 3.0-series FIPS provider and install only the module itself
/// into the already-populated openssl prefix.
fn build_openssl_fips(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let configure = vec![
    "./Configure".to_string(),
    openssl_target(env).to_string(),
    "enable-fips".to_string(),
    "shared".to_string(),
    prefix_arg(dirs),
    format!("--openssldir={}/ssl", dirs.prefix.display()),
  ];
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install_fips"], env, &dirs.source, log)
}

fn build_bzip2(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let empty = String::new();
  let ldflags = env.get("LDFLAGS").unwrap_or(&empty);
  let cc = env.get("CC").unwrap_or(&empty);
  let host = env.get("RELPY_HOST").unwrap_or(&empty);

  let install = vec![
    "make".to_string(),
    "-j8".to_string(),
    format!("PREFIX={}", dirs.prefix.display()),
    format!("LDFLAGS={ldflags}"),
    "CFLAGS=-fPIC".to_string(),
    format!("CC={cc}"),
    "BUILD=x86_64-linux-gnu".to_string(),
    format!("HOST={host}"),
    "install".to_string(),
  ];
  runcmd(&install, env, &dirs.source, log)?;

  let shared = vec![
    "make".to_string(),
    "-f".to_string(),
    "Makefile-libbz2_so".to_string(),
    format!("CC={cc}"),
    format!("LDFLAGS={ldflags}"),
    "BUILD=x86_64-linux-gnu".to_string(),
    format!("HOST={host}"),
  ];
  runcmd(&shared, env, &dirs.source, log)?;

  // The shared-object makefile has no install target.
  std::fs::copy(
    dirs.source.join("libbz2.so.1.0.8"),
    dirs.prefix.join("lib").join("libbz2.so.1.0.8"),
  )?;
  Ok(())
}

fn build_gdbm(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let mut configure = vec![
    "./configure".to_string(),
    prefix_arg(dirs),
    "--enable-libgdbm-compat".to_string(),
  ];
  configure.extend(build_host_args(env));
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

fn build_ncurses(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let configure_script = dirs.source.join("configure");

  // Cross builds need a tic binary that runs on the build machine; compile
  // one natively in the scratch tree before the cross configure below.
  let aarch64_involved =
    env.get("RELPY_BUILD_ARCH").map(String::as_str) == Some("aarch64") || env.get("RELPY_HOST_ARCH").map(String::as_str) == Some("aarch64");
  if aarch64_involved {
    let mut native_env = EnvMap::new();
    if let Some(path) = env.get("PATH") {
      native_env.insert("PATH".to_string(), path.clone());
    }
    runcmd(
      &[configure_script.display().to_string()],
      &native_env,
      &dirs.tmpbuild,
      log,
    )?;
    runcmd(&["make", "-C", "include"], &native_env, &dirs.tmpbuild, log)?;
    runcmd(&["make", "-C", "progs", "tic"], &native_env, &dirs.tmpbuild, log)?;
  }

  let mut configure = vec![
    configure_script.display().to_string(),
    "--prefix=/".to_string(),
    "--with-shared".to_string(),
    "--enable-termcap".to_string(),
    "--with-termlib=tinfo".to_string(),
    "--without-cxx-shared".to_string(),
    "--without-static".to_string(),
    "--without-cxx".to_string(),
    "--enable-widec".to_string(),
    "--with-normal".to_string(),
    "--disable-stripping".to_string(),
  ];
  configure.extend(build_host_args(env));
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;

  // Installed under DESTDIR because the configure prefix is /.
  let install = vec![
    "make".to_string(),
    format!("DESTDIR={}", dirs.prefix.display()),
    format!("TIC_PATH={}", dirs.tmpbuild.join("progs").join("tic").display()),
    "install".to_string(),
  ];
  runcmd(&install, env, &dirs.source, log)
}

fn readline_env(env: &mut EnvMap, _dirs: &Dirs) {
  append_flags(env, "LDFLAGS", &["-ltinfo".to_string()]);
}

fn build_readline(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let mut configure = vec!["./configure".to_string(), prefix_arg(dirs)];
  if env.get("RELPY_HOST").is_some_and(|host| host.contains("linux")) {
    configure.extend(build_host_args(env));
  }
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

fn build_libffi(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let mut configure = vec![
    "./configure".to_string(),
    prefix_arg(dirs),
    "--disable-multi-os-directory".to_string(),
  ];
  configure.extend(build_host_args(env));
  runcmd(&configure, env, &dirs.source, log)?;
  // libffi does not honor libdir; force lib instead of lib64
  runcmd(&["sed", "-i", "s/lib64/lib/g", "Makefile"], env, &dirs.source, log)?;
  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

fn zlib_env(env: &mut EnvMap, _dirs: &Dirs) {
  append_flags(env, "CFLAGS", &["-fPIC".to_string()]);
}

fn build_zlib(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let configure = vec![
    "./configure".to_string(),
    prefix_arg(dirs),
    format!("--libdir={}/lib", dirs.prefix.display()),
    "--shared".to_string(),
  ];
  runcmd(&configure, env, &dirs.source, log)?;
  runcmd(&["make", "-no-pie", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

fn krb5_env(env: &mut EnvMap, _dirs: &Dirs) {
  // Autoconf cannot run cross-compiled feature probes; seed the answers.
  if env.get("RELPY_BUILD_ARCH") != env.get("RELPY_HOST_ARCH") {
    env.insert("krb5_cv_attr_constructor_destructor".to_string(), "yes,yes".to_string());
    env.insert("ac_cv_func_regcomp".to_string(), "yes".to_string());
    env.insert("ac_cv_printf_positional".to_string(), "yes".to_string());
  }
}

fn build_krb5(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let src = dirs.source.join("src");
  let mut configure = vec![
    "./configure".to_string(),
    prefix_arg(dirs),
    "--without-system-verto".to_string(),
    "--without-libedit".to_string(),
  ];
  configure.extend(build_host_args(env));
  runcmd(&configure, env, &src, log)?;
  runcmd(&["make", "-j8"], env, &src, log)?;
  runcmd(&["make", "install"], env, &src, log)
}

fn python_env(env: &mut EnvMap, dirs: &Dirs) {
  let prefix = dirs.prefix.display();
  env.insert(
    "OPENSSL_CFLAGS".to_string(),
    format!("-I{prefix}/include -Wno-coverage-mismatch"),
  );
  env.insert("OPENSSL_LDFLAGS".to_string(), format!("-L{prefix}/lib"));
  append_flags(env, "CFLAGS", &["-Wno-coverage-mismatch".to_string()]);
  append_flags(env, "LDFLAGS", &[format!("-Wl,--rpath={prefix}/lib")]);
}

fn build_python(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  use std::io::Write;

  // Needed when using a toolchain even if build and host match.
  runcmd(
    &["sed", "-i", "s/ac_cv_buggy_getaddrinfo=yes/ac_cv_buggy_getaddrinfo=no/g", "configure"],
    env,
    &dirs.source,
    log,
  )?;
  runcmd(
    &[
      "sed",
      "-i",
      "s/ac_cv_enable_implicit_function_declaration_error=yes/ac_cv_enable_implicit_function_declaration_error=no/g",
      "configure",
    ],
    env,
    &dirs.source,
    log,
  )?;

  // 3.12 dropped setup.py along with the multiarch probing this disables.
  if dirs.source.join("setup.py").exists() {
    let patch = Patch {
      name: "disable-multiarch-paths".to_string(),
      diff: PYTHON_SETUP_PATCH.to_string(),
    };
    apply_patch(&patch, &dirs.source, env, log)?;
  }

  let mut configure = vec![
    "./configure".to_string(),
    "-v".to_string(),
    prefix_arg(dirs),
    format!("--with-openssl={}", dirs.prefix.display()),
    "--enable-optimizations".to_string(),
    "--with-ensurepip=no".to_string(),
  ];
  configure.extend(build_host_args(env));
  configure.extend([
    "--disable-test-modules".to_string(),
    "--with-ssl-default-suites=openssl".to_string(),
    "--with-builtin-hashlib-hashes=blake2,md5,sha1,sha2,sha3".to_string(),
    "--with-readline=readline".to_string(),
  ]);

  if env.get("RELPY_HOST_ARCH") != env.get("RELPY_BUILD_ARCH") {
    let native = env
      .get("RELPY_NATIVE_PY")
      .ok_or(StepError::Env(crate::env::EnvError::MissingPlatformFact {
        fact: "native build python",
      }))?;
    configure.push(format!("--with-build-python={native}"));
  }
  // Device probes cannot run under a cross toolchain either.
  configure.push("ac_cv_file__dev_ptmx=yes".to_string());
  configure.push("ac_cv_file__dev_ptc=no".to_string());

  runcmd(&configure, env, &dirs.source, log)?;

  // Extension modules that must never be built into the runtime.
  let setup_path = dirs.source.join("Modules").join("Setup");
  let mut setup = std::fs::OpenOptions::new().append(true).open(&setup_path)?;
  write!(setup, "*disabled*\n_tkinter\nnsl\nnis\n")?;

  runcmd(&["make", "-j8"], env, &dirs.source, log)?;
  runcmd(&["make", "install"], env, &dirs.source, log)
}

/// Terminal aggregation step: records what was built into the prefix.
fn finalize(env: &EnvMap, dirs: &Dirs, log: &mut StepLog) -> Result<(), StepError> {
  let release = serde_json::json!({
    "python": env.get("RELPY_VERSION"),
    "host": env.get("RELPY_HOST"),
    "build": env.get("RELPY_BUILD"),
  });
  let path = dirs.prefix.join("relpy.json");
  std::fs::write(&path, format!("{release:#}\n"))?;
  log.message(&format!("wrote release metadata to {}", path.display()))?;
  Ok(())
}

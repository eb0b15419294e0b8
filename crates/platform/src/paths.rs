//! Default on-disk locations for work trees and caches.

use std::path::PathBuf;

/// Application directory name used under XDG locations.
pub const APP_NAME: &str = "relpy";

/// Environment variable overriding the work-tree root.
pub const ROOT_ENV: &str = "RELPY_ROOT";

/// Returns the user's home directory.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  let userprofile = std::env::var("USERPROFILE").expect("USERPROFILE not set");
  PathBuf::from(userprofile)
}

/// Returns the user's home directory.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  let home = std::env::var("HOME").expect("HOME not set");
  PathBuf::from(home)
}

/// Returns the directory for data files for the application.
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  let appdata = std::env::var("APPDATA").expect("APPDATA not set");
  PathBuf::from(appdata).join(APP_NAME)
}

/// Returns the directory for data files for the application.
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Root of the work tree: downloads, extracted sources, build scratch
/// directories, install prefixes and per-step logs all live below it.
///
/// `RELPY_ROOT` overrides the default XDG data location.
pub fn work_root() -> PathBuf {
  std::env::var(ROOT_ENV).map(PathBuf::from).unwrap_or_else(|_| data_dir())
}

//! Checksum computation and verification for source archives.
//!
//! Upstream projects publish either MD5 sums (the GNU mirrors, kerberos.org)
//! or SHA-256 sums for their release tarballs, so both digests are supported.
//! Verification is a pure function of the archive bytes.

use md5::Md5;
use sha2::{Digest, Sha256};

/// An expected archive checksum, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
  Md5(String),
  Sha256(String),
}

impl Checksum {
  /// The expected hex digest.
  pub fn expected(&self) -> &str {
    match self {
      Self::Md5(hex) => hex,
      Self::Sha256(hex) => hex,
    }
  }

  /// The digest algorithm name, for log and error messages.
  pub fn algorithm(&self) -> &'static str {
    match self {
      Self::Md5(_) => "md5",
      Self::Sha256(_) => "sha256",
    }
  }

  /// Compute this checksum's digest over `bytes`.
  pub fn compute(&self, bytes: &[u8]) -> String {
    match self {
      Self::Md5(_) => {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
      }
      Self::Sha256(_) => {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
      }
    }
  }

  /// Verify `bytes` against the expected digest.
  ///
  /// Returns the actual digest on mismatch so callers can report both sides.
  pub fn verify(&self, bytes: &[u8]) -> Result<(), String> {
    let actual = self.compute(bytes);
    if actual.eq_ignore_ascii_case(self.expected()) {
      Ok(())
    } else {
      Err(actual)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sha256_matches_known_digest() {
    // echo -n 'hello' | sha256sum
    let sum = Checksum::Sha256("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".to_string());
    assert!(sum.verify(b"hello").is_ok());
  }

  #[test]
  fn md5_matches_known_digest() {
    // echo -n 'hello' | md5sum
    let sum = Checksum::Md5("5d41402abc4b2a76b9719d911017c592".to_string());
    assert!(sum.verify(b"hello").is_ok());
  }

  #[test]
  fn verify_is_deterministic() {
    let sum = Checksum::Sha256("0".repeat(64));
    assert_eq!(sum.compute(b"same bytes"), sum.compute(b"same bytes"));
  }

  #[test]
  fn corrupting_one_byte_changes_the_digest() {
    let original = b"valid archive contents".to_vec();
    let sum = Checksum::Sha256(Checksum::Sha256(String::new()).compute(&original));
    assert!(sum.verify(&original).is_ok());

    let mut corrupted = original.clone();
    corrupted[3] ^= 0x01;
    let err = sum.verify(&corrupted).unwrap_err();
    assert_ne!(err, sum.expected());
  }

  #[test]
  fn expected_digest_case_is_ignored() {
    let sum = Checksum::Md5("5D41402ABC4B2A76B9719D911017C592".to_string());
    assert!(sum.verify(b"hello").is_ok());
  }
}

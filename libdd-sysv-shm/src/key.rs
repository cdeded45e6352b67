// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment keys.
//!
//! A key is a process-independent 32-bit identifier. It is either given
//! directly or derived from an existing filesystem path and a one-byte
//! discriminator, `ftok(3)` style. Derivation only looks at the path's
//! identity (device and inode), never its content, so the same existing path
//! yields the same key across processes and restarts.

use crate::error::{KeyError, ShmError};
use crate::ipc::SysvIpc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::{NonZeroU32, ParseIntError};
use std::path::{Path, PathBuf};

/// A validated segment key in `(0, 2^32)`.
///
/// The kernel's `key_t` is a signed 32-bit integer; keys with the top bit set
/// are passed through bit-for-bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ShmKey(NonZeroU32);

impl ShmKey {
    pub fn new(value: i64) -> Result<Self, KeyError> {
        if value < 0 {
            return Err(KeyError::Negative(value));
        }
        let value = u32::try_from(value).map_err(|_| KeyError::OutOfRange(value))?;
        NonZeroU32::new(value).map(Self).ok_or(KeyError::Zero)
    }

    /// Wraps a key as returned by the kernel's key derivation.
    pub fn from_raw(raw: libc::key_t) -> Result<Self, KeyError> {
        NonZeroU32::new(raw as u32).map(Self).ok_or(KeyError::Zero)
    }

    /// Derives a key from `path` and `proj_id`.
    ///
    /// The path must exist: run `touch <path>` (or create it any other way)
    /// before deriving a key from it.
    pub fn derive<I: SysvIpc + ?Sized>(
        ipc: &I,
        path: &Path,
        proj_id: u8,
    ) -> Result<Self, KeyError> {
        std::fs::metadata(path).map_err(|source| KeyError::MarkerMissing {
            path: path.to_path_buf(),
            source,
        })?;
        let raw = ipc
            .derive_key(path, proj_id)
            .map_err(|source| KeyError::Derivation {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_raw(raw)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn as_raw(self) -> libc::key_t {
        self.0.get() as libc::key_t
    }
}

impl fmt::Display for ShmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0.get())
    }
}

impl TryFrom<i64> for ShmKey {
    type Error = KeyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShmKey> for i64 {
    fn from(key: ShmKey) -> i64 {
        key.get() as i64
    }
}

/// Where a key comes from, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Derive the key from an existing path and a discriminator byte.
    Path {
        path: PathBuf,
        #[serde(default)]
        proj_id: u8,
    },
    /// Use the integer as the key.
    Value(i64),
}

impl KeySource {
    /// Parses a key argument.
    ///
    /// `0x`-prefixed hexadecimal and decimal integers (including negative
    /// ones, which fail later validation) become [`KeySource::Value`];
    /// anything else is a path. A relative path starting with a digit has to
    /// be written as `./<path>`.
    pub fn parse(value: &str, proj_id: u8) -> Result<Self, ParseIntError> {
        let value = value.trim();
        if let Some(hex) = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            return i64::from_str_radix(hex, 16).map(KeySource::Value);
        }
        if value.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
            return value.parse().map(KeySource::Value);
        }
        Ok(KeySource::Path {
            path: PathBuf::from(value),
            proj_id,
        })
    }

    /// Validates or derives the key. Nothing reaches the segment table
    /// unless this succeeds.
    pub fn resolve<I: SysvIpc + ?Sized>(&self, ipc: &I) -> Result<ShmKey, ShmError> {
        let key = match self {
            KeySource::Path { path, proj_id } => ShmKey::derive(ipc, path, *proj_id)?,
            KeySource::Value(value) => ShmKey::new(*value)?,
        };
        Ok(key)
    }
}

impl From<ShmKey> for KeySource {
    fn from(key: ShmKey) -> Self {
        KeySource::Value(key.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeIpc;

    #[test]
    fn rejects_zero() {
        assert!(matches!(ShmKey::new(0), Err(KeyError::Zero)));
    }

    #[test]
    fn rejects_negative() {
        assert!(matches!(ShmKey::new(-1), Err(KeyError::Negative(-1))));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(matches!(
            ShmKey::new(1 << 32),
            Err(KeyError::OutOfRange(0x1_0000_0000))
        ));
        assert_eq!(ShmKey::new(u32::MAX as i64).unwrap().get(), u32::MAX);
    }

    #[test]
    fn high_bit_keys_keep_their_bits() {
        let key = ShmKey::new(0x8000_0001).unwrap();
        assert_eq!(key.as_raw(), i32::MIN + 1);
        assert_eq!(ShmKey::from_raw(key.as_raw()).unwrap(), key);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(ShmKey::new(0x8827).unwrap().to_string(), "0x00008827");
    }

    #[test]
    fn fuzz_key_bounds() {
        bolero::check!().with_type::<i64>().for_each(|&value| {
            let in_range = value > 0 && value < (1i64 << 32);
            match ShmKey::new(value) {
                Ok(key) => {
                    assert!(in_range);
                    assert_eq!(i64::from(key), value);
                }
                Err(_) => assert!(!in_range),
            }
        });
    }

    #[test]
    fn parse_key_arguments() {
        assert_eq!(
            KeySource::parse("0x8827", 0).unwrap(),
            KeySource::Value(0x8827)
        );
        assert_eq!(KeySource::parse(" 42 ", 0).unwrap(), KeySource::Value(42));
        assert_eq!(KeySource::parse("-3", 0).unwrap(), KeySource::Value(-3));
        assert_eq!(
            KeySource::parse(".shm", 7).unwrap(),
            KeySource::Path {
                path: PathBuf::from(".shm"),
                proj_id: 7
            }
        );
        assert!(KeySource::parse("12abc", 0).is_err());
        assert!(KeySource::parse("0xzz", 0).is_err());
    }

    #[test]
    fn derive_requires_marker() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let ipc = FakeIpc::default();

        let err = ShmKey::derive(&ipc, &missing, 0).unwrap_err();
        assert!(matches!(err, KeyError::MarkerMissing { .. }));
        assert_eq!(ipc.calls(), 0);
    }

    #[test]
    fn derive_is_deterministic() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let ipc = FakeIpc::default();

        let first = ShmKey::derive(&ipc, marker.path(), 0).unwrap();
        let second = ShmKey::derive(&ipc, marker.path(), 0).unwrap();
        assert_eq!(first, second);

        let other = ShmKey::derive(&ipc, marker.path(), 1).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn resolve_validates_before_kernel() {
        let ipc = FakeIpc::default();
        for value in [0, -1, 1 << 32] {
            let err = KeySource::Value(value).resolve(&ipc).unwrap_err();
            assert!(matches!(err, ShmError::InvalidKey(_)), "{err}");
        }
        assert_eq!(ipc.calls(), 0);
    }

    #[test]
    fn key_source_from_json() {
        let source: KeySource =
            serde_json::from_str(r#"{"path": {"path": "/tmp/.shm"}}"#).unwrap();
        assert_eq!(
            source,
            KeySource::Path {
                path: PathBuf::from("/tmp/.shm"),
                proj_id: 0
            }
        );
        let source: KeySource = serde_json::from_str(r#"{"value": 34855}"#).unwrap();
        assert_eq!(source, KeySource::Value(0x8827));
    }
}

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::key::KeySource;
use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DD_SYSV_SHM_KEY: &str = "DD_SYSV_SHM_KEY";
pub const DD_SYSV_SHM_PROJ_ID: &str = "DD_SYSV_SHM_PROJ_ID";
pub const DD_SYSV_SHM_SIZE: &str = "DD_SYSV_SHM_SIZE";

/// What segment to open, and how large to make it if it has to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentConfig {
    #[serde(default = "SegmentConfig::default_size")]
    pub size: usize,
    pub key: KeySource,
}

impl SegmentConfig {
    pub const DEFAULT_SIZE: usize = 4096;

    fn default_size() -> usize {
        Self::DEFAULT_SIZE
    }

    pub fn new(size: usize, key: KeySource) -> Self {
        Self { size, key }
    }

    /// Reads the configuration from `DD_SYSV_SHM_KEY` (an integer or a
    /// path), `DD_SYSV_SHM_PROJ_ID` and `DD_SYSV_SHM_SIZE`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let proj_id = match var(DD_SYSV_SHM_PROJ_ID) {
            Some(v) => v
                .parse::<u8>()
                .with_context(|| format!("{DD_SYSV_SHM_PROJ_ID} must be in 0..=255, got {v:?}"))?,
            None => 0,
        };
        let size = match var(DD_SYSV_SHM_SIZE) {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("{DD_SYSV_SHM_SIZE} must be a byte count, got {v:?}"))?,
            None => Self::DEFAULT_SIZE,
        };
        let key = var(DD_SYSV_SHM_KEY).with_context(|| format!("{DD_SYSV_SHM_KEY} is not set"))?;
        let key = KeySource::parse(&key, proj_id)
            .with_context(|| format!("{DD_SYSV_SHM_KEY} is not a valid key: {key:?}"))?;

        Ok(Self { size, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn integer_key_with_default_size() {
        let config = SegmentConfig::from_lookup(lookup(&[(DD_SYSV_SHM_KEY, "0x8827")])).unwrap();
        assert_eq!(config, SegmentConfig::new(4096, KeySource::Value(0x8827)));
    }

    #[test]
    fn path_key_with_proj_id() {
        let config = SegmentConfig::from_lookup(lookup(&[
            (DD_SYSV_SHM_KEY, "/tmp/.shm"),
            (DD_SYSV_SHM_PROJ_ID, "7"),
            (DD_SYSV_SHM_SIZE, " 8192 "),
        ]))
        .unwrap();
        assert_eq!(
            config,
            SegmentConfig::new(
                8192,
                KeySource::Path {
                    path: PathBuf::from("/tmp/.shm"),
                    proj_id: 7
                }
            )
        );
    }

    #[test]
    fn missing_or_blank_key() {
        assert!(SegmentConfig::from_lookup(lookup(&[])).is_err());
        let err = SegmentConfig::from_lookup(lookup(&[(DD_SYSV_SHM_KEY, "  ")])).unwrap_err();
        assert!(err.to_string().contains(DD_SYSV_SHM_KEY));
    }

    #[test]
    fn invalid_numbers() {
        assert!(SegmentConfig::from_lookup(lookup(&[
            (DD_SYSV_SHM_KEY, "1"),
            (DD_SYSV_SHM_SIZE, "big")
        ]))
        .is_err());
        assert!(SegmentConfig::from_lookup(lookup(&[
            (DD_SYSV_SHM_KEY, "1"),
            (DD_SYSV_SHM_PROJ_ID, "256")
        ]))
        .is_err());
        assert!(SegmentConfig::from_lookup(lookup(&[(DD_SYSV_SHM_KEY, "0xnope")])).is_err());
    }

    #[test]
    fn deserialize_with_default_size() {
        let config: SegmentConfig = serde_json::from_str(r#"{"key": {"value": 34855}}"#).unwrap();
        assert_eq!(config, SegmentConfig::new(4096, KeySource::Value(0x8827)));
    }
}

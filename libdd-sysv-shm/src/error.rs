// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for `libdd-sysv-shm`.

use crate::ipc::SegmentId;
use crate::key::ShmKey;
use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a key is rejected. All of them are raised before the segment
/// itself is looked up.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key must be non-zero")]
    Zero,

    #[error("key {0} is negative")]
    Negative(i64),

    #[error("key {0:#x} does not fit in 32 bits")]
    OutOfRange(i64),

    /// The path a key is derived from must exist before derivation.
    #[error("key marker {} does not exist, create it first (e.g. `touch {}`): {source}", path.display(), path.display())]
    MarkerMissing { path: PathBuf, source: io::Error },

    #[error("failed to derive a key from {}: {source}", path.display())]
    Derivation { path: PathBuf, source: Errno },
}

/// Errors that can occur while operating on a segment.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Both the existence probe and the create request were refused.
    #[error("segment for key {key} is unavailable: {source}")]
    SegmentUnavailable { key: ShmKey, source: Errno },

    #[error("failed to attach segment {id}: {source}")]
    Attach { id: SegmentId, source: Errno },

    #[error("failed to detach segment {id}: {source}")]
    Detach { id: SegmentId, source: Errno },

    #[error("segment is not attached")]
    NotAttached,

    #[error("read length must be non-zero")]
    EmptyRead,

    #[error("write must contain at least one byte")]
    EmptyWrite,

    #[error("{length} bytes at offset {offset} exceed the {size} byte segment")]
    OutOfBounds {
        offset: usize,
        length: usize,
        size: usize,
    },

    #[error("failed to query segment {id}: {source}")]
    Stat { id: SegmentId, source: Errno },

    #[error("failed to remove segment {id}: {source}")]
    Remove { id: SegmentId, source: Errno },

    /// The raw usage record does not have the size the layout table expects.
    /// No field is decoded in this case.
    #[error("usage record for {layout} must be {expected} bytes, got {actual}")]
    LayoutMismatch {
        layout: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("no usage record layout is known for this platform")]
    UnsupportedPlatform,
}

impl ShmError {
    /// The OS error behind this error, if it came from a kernel call.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ShmError::InvalidKey(KeyError::Derivation { source, .. }) => Some(*source),
            ShmError::InvalidKey(KeyError::MarkerMissing { source, .. }) => {
                source.raw_os_error().map(Errno::from_raw)
            }
            ShmError::SegmentUnavailable { source, .. }
            | ShmError::Attach { source, .. }
            | ShmError::Detach { source, .. }
            | ShmError::Stat { source, .. }
            | ShmError::Remove { source, .. } => Some(*source),
            _ => None,
        }
    }
}

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The kernel System V shared memory interface, as a capability trait.
//!
//! [`Segment`](crate::Segment) only talks to the kernel through [`SysvIpc`].
//! The host implementation lives in [`platform`](crate::platform); tests use
//! an in-memory fake.

use crate::key::ShmKey;
use crate::record::RecordLayout;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;

/// Kernel-assigned segment identifier (`shmid`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(libc::c_int);

impl SegmentId {
    pub fn from_raw(raw: libc::c_int) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Flags for looking up a segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GetFlags {
    /// Only test whether the segment exists. Used with a size of zero.
    Probe,
    /// Create the segment if it does not exist, with the given permission
    /// bits.
    Create { mode: u32 },
}

impl GetFlags {
    /// Owner, group and other may read and write.
    pub const DEFAULT_MODE: u32 = 0o666;

    pub fn create() -> Self {
        GetFlags::Create {
            mode: Self::DEFAULT_MODE,
        }
    }

    pub fn bits(self) -> libc::c_int {
        match self {
            GetFlags::Probe => 0,
            GetFlags::Create { mode } => libc::IPC_CREAT | (mode & 0o777) as libc::c_int,
        }
    }
}

/// System V shared memory operations.
///
/// Every method maps to one kernel call and returns its `errno` on failure.
pub trait SysvIpc {
    /// Derives a key from an existing path and a discriminator byte.
    fn derive_key(&self, path: &Path, proj_id: u8) -> Result<libc::key_t, Errno>;

    /// Looks up, and with [`GetFlags::Create`] possibly creates, the segment
    /// for `key`. `size` only matters when the segment is created.
    fn get(&self, key: ShmKey, size: usize, flags: GetFlags) -> Result<SegmentId, Errno>;

    /// Maps the segment at an address of the kernel's choosing.
    fn attach(&self, id: SegmentId) -> Result<NonNull<u8>, Errno>;

    /// Unmaps a mapping created by [`SysvIpc::attach`].
    ///
    /// # Safety
    /// Nothing may access the mapping at `addr` once this returns `Ok`.
    unsafe fn detach(&self, addr: NonNull<u8>) -> Result<(), Errno>;

    /// Returns the raw usage record for the segment, laid out as described by
    /// [`SysvIpc::native_layout`].
    fn stat(&self, id: SegmentId) -> Result<Vec<u8>, Errno>;

    /// Size of the segment in bytes, read from the same kernel record as
    /// [`SysvIpc::stat`] without going through a [`RecordLayout`].
    fn segment_size(&self, id: SegmentId) -> Result<usize, Errno>;

    /// Marks the segment for removal. The kernel reclaims it after the last
    /// detach.
    fn remove(&self, id: SegmentId) -> Result<(), Errno>;

    /// Layout of the records returned by [`SysvIpc::stat`], if one is known.
    fn native_layout(&self) -> Option<&'static RecordLayout>;
}

impl<T: SysvIpc + ?Sized> SysvIpc for &T {
    fn derive_key(&self, path: &Path, proj_id: u8) -> Result<libc::key_t, Errno> {
        (**self).derive_key(path, proj_id)
    }

    fn get(&self, key: ShmKey, size: usize, flags: GetFlags) -> Result<SegmentId, Errno> {
        (**self).get(key, size, flags)
    }

    fn attach(&self, id: SegmentId) -> Result<NonNull<u8>, Errno> {
        (**self).attach(id)
    }

    unsafe fn detach(&self, addr: NonNull<u8>) -> Result<(), Errno> {
        (**self).detach(addr)
    }

    fn stat(&self, id: SegmentId) -> Result<Vec<u8>, Errno> {
        (**self).stat(id)
    }

    fn segment_size(&self, id: SegmentId) -> Result<usize, Errno> {
        (**self).segment_size(id)
    }

    fn remove(&self, id: SegmentId) -> Result<(), Errno> {
        (**self).remove(id)
    }

    fn native_layout(&self) -> Option<&'static RecordLayout> {
        (**self).native_layout()
    }
}

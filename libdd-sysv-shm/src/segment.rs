// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The segment handle.
//!
//! A [`Segment`] is created once per logical use: construction opens the
//! segment for a key, creating it if needed. The handle can then be attached
//! and detached any number of times. It never destroys the segment on its
//! own; [`Segment::destroy`] is explicit and only removes the segment when no
//! process has it mapped.
//!
//! # Concurrency
//!
//! No locking is provided over the mapped bytes. Other processes attached to
//! the same key see writes as they happen; coordinating access is up to the
//! caller. [`Segment::destroy`] checks the attachment count and then removes
//! the segment, which is not atomic: another process may attach in between.

use crate::error::ShmError;
use crate::ipc::{GetFlags, SegmentId, SysvIpc};
use crate::key::{KeySource, ShmKey};
use crate::record::UsageRecord;
use std::ptr::{self, NonNull};
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
use crate::{config::SegmentConfig, platform::HostIpc};

/// Result of [`Segment::destroy`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The kernel accepted the removal request.
    Removed,
    /// Some process still had the segment mapped, so nothing was done.
    Skipped { attachment_count: u64 },
}

struct Mapping {
    addr: NonNull<u8>,
    size: usize,
}

/// An open System V shared memory segment.
pub struct Segment<I: SysvIpc> {
    ipc: I,
    key: ShmKey,
    id: SegmentId,
    requested_size: usize,
    is_creator: bool,
    mapping: Option<Mapping>,
}

#[cfg(target_os = "linux")]
impl Segment<HostIpc> {
    /// Opens the segment for `key`, creating it with `size` bytes if it does
    /// not exist yet.
    pub fn open_or_create(size: usize, key: &KeySource) -> Result<Self, ShmError> {
        Self::from_source(HostIpc, size, key)
    }

    pub fn from_config(config: &SegmentConfig) -> Result<Self, ShmError> {
        Self::from_source(HostIpc, config.size, &config.key)
    }
}

impl<I: SysvIpc> Segment<I> {
    /// Resolves `key` and opens or creates its segment through `ipc`.
    pub fn from_source(ipc: I, size: usize, key: &KeySource) -> Result<Self, ShmError> {
        let key = key.resolve(&ipc)?;
        Self::with_ipc(ipc, size, key)
    }

    /// Opens the segment for `key`, creating it with `size` bytes if the
    /// existence probe fails.
    ///
    /// When the segment already exists, `size` is ignored.
    pub fn with_ipc(ipc: I, size: usize, key: ShmKey) -> Result<Self, ShmError> {
        let (id, is_creator) = match ipc.get(key, 0, GetFlags::Probe) {
            Ok(id) => (id, false),
            Err(probe) => {
                debug!(%key, %probe, size, "segment probe failed, creating it");
                let id = ipc
                    .get(key, size, GetFlags::create())
                    .map_err(|source| ShmError::SegmentUnavailable { key, source })?;
                (id, true)
            }
        };
        debug!(%key, %id, is_creator, "opened segment");

        Ok(Self {
            ipc,
            key,
            id,
            requested_size: size,
            is_creator,
            mapping: None,
        })
    }

    pub fn key(&self) -> ShmKey {
        self.key
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// The size given at construction. Only meaningful if this handle created
    /// the segment.
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// Whether this handle created the segment rather than opening an
    /// existing one.
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    pub fn is_attached(&self) -> bool {
        self.mapping.is_some()
    }

    /// Size of the current mapping, as reported by the kernel at attach time.
    pub fn attached_size(&self) -> Option<usize> {
        self.mapping.as_ref().map(|m| m.size)
    }

    /// Maps the segment into this process and returns its address.
    ///
    /// The mapping is owned by this handle until [`Segment::detach`], or until
    /// the handle is dropped. Attaching an attached handle returns the current
    /// address without creating a second mapping.
    ///
    /// The segment size used for bounds checks comes from
    /// [`SysvIpc::segment_size`], so attaching works on platforms without a
    /// [`RecordLayout`](crate::RecordLayout).
    pub fn attach(&mut self) -> Result<NonNull<u8>, ShmError> {
        if let Some(mapping) = &self.mapping {
            debug!(id = %self.id, "segment already attached");
            return Ok(mapping.addr);
        }

        let addr = self.ipc.attach(self.id).map_err(|source| ShmError::Attach {
            id: self.id,
            source,
        })?;
        let size = match self.ipc.segment_size(self.id) {
            Ok(size) => size,
            Err(source) => {
                // SAFETY: the mapping was never handed out.
                if let Err(errno) = unsafe { self.ipc.detach(addr) } {
                    warn!(id = %self.id, %errno, "failed to release mapping after size query failure");
                }
                return Err(ShmError::Attach {
                    id: self.id,
                    source,
                });
            }
        };
        debug!(id = %self.id, ?addr, size, "attached segment");

        self.mapping = Some(Mapping { addr, size });
        Ok(addr)
    }

    /// Unmaps the segment.
    ///
    /// The mapping is given up even if the kernel reports an error, since that
    /// means the address is no longer mapped by this process.
    pub fn detach(&mut self) -> Result<(), ShmError> {
        let mapping = self.mapping.take().ok_or(ShmError::NotAttached)?;
        // SAFETY: the mapping was taken out of the handle, nothing can read
        // through it anymore.
        unsafe { self.ipc.detach(mapping.addr) }.map_err(|source| ShmError::Detach {
            id: self.id,
            source,
        })?;
        debug!(id = %self.id, "detached segment");
        Ok(())
    }

    /// Copies `length` bytes starting at `offset` out of the mapping.
    ///
    /// # Safety
    /// `offset + length` must not exceed the size of the segment. Nothing is
    /// checked against it; [`Segment::read`] is the checked version.
    pub unsafe fn read_raw(&self, length: usize, offset: usize) -> Result<Vec<u8>, ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotAttached)?;
        if length == 0 {
            return Err(ShmError::EmptyRead);
        }
        let mut buf = vec![0u8; length];
        ptr::copy_nonoverlapping(mapping.addr.as_ptr().add(offset), buf.as_mut_ptr(), length);
        Ok(buf)
    }

    /// Copies `length` bytes starting at `offset` out of the mapping, failing
    /// if the range is not inside the segment.
    pub fn read(&self, length: usize, offset: usize) -> Result<Vec<u8>, ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotAttached)?;
        if length == 0 {
            return Err(ShmError::EmptyRead);
        }
        Self::check_bounds(mapping, offset, length)?;
        // SAFETY: the range was checked against the segment size.
        unsafe { self.read_raw(length, offset) }
    }

    /// Copies `bytes` into the mapping at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        let mapping = self.mapping.as_ref().ok_or(ShmError::NotAttached)?;
        if bytes.is_empty() {
            return Err(ShmError::EmptyWrite);
        }
        Self::check_bounds(mapping, offset, bytes.len())?;
        // SAFETY: the range was checked against the segment size.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapping.addr.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    fn check_bounds(mapping: &Mapping, offset: usize, length: usize) -> Result<(), ShmError> {
        match offset.checked_add(length) {
            Some(end) if end <= mapping.size => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                length,
                size: mapping.size,
            }),
        }
    }

    /// Queries and decodes the segment's usage record. Works attached or not.
    pub fn stat(&self) -> Result<UsageRecord, ShmError> {
        let raw = self.ipc.stat(self.id).map_err(|source| ShmError::Stat {
            id: self.id,
            source,
        })?;
        let layout = self
            .ipc
            .native_layout()
            .ok_or(ShmError::UnsupportedPlatform)?;
        layout.decode(&raw)
    }

    /// Removes the segment if no process has it attached.
    ///
    /// This handle's own mapping counts, so detach before destroying.
    /// Best effort: the count is checked before the removal request, and a
    /// process attaching in between is not detected.
    pub fn destroy(&self) -> Result<DestroyOutcome, ShmError> {
        let record = self.stat()?;
        if record.attachment_count > 0 {
            info!(
                id = %self.id,
                attachment_count = record.attachment_count,
                "segment still in use, not removing it"
            );
            return Ok(DestroyOutcome::Skipped {
                attachment_count: record.attachment_count,
            });
        }

        self.ipc.remove(self.id).map_err(|source| ShmError::Remove {
            id: self.id,
            source,
        })?;
        debug!(id = %self.id, "removed segment");
        Ok(DestroyOutcome::Removed)
    }
}

impl<I: SysvIpc> Drop for Segment<I> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: the handle is going away with its only access to the
            // mapping.
            if let Err(errno) = unsafe { self.ipc.detach(mapping.addr) } {
                warn!(id = %self.id, %errno, "failed to detach segment on drop");
            }
        }
    }
}

// SAFETY: the mapping is only reachable through the handle, and mutation
// through it requires `&mut self`.
unsafe impl<I: SysvIpc + Send> Send for Segment<I> {}

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An in-memory [`SysvIpc`] for exercising segment logic without the kernel.

use crate::ipc::{GetFlags, SegmentId, SysvIpc};
use crate::key::ShmKey;
use crate::record::{IpcPermissions, RecordLayout, UsageRecord, X86_64_LINUX};
use nix::errno::Errno;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::ptr::NonNull;
use std::rc::Rc;

/// Kernel calls a failure can be injected into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FakeOp {
    DeriveKey,
    Get,
    Attach,
    Detach,
    Stat,
    Remove,
}

struct FakeSegment {
    key: ShmKey,
    data: Box<[u8]>,
    record: UsageRecord,
    marked_for_removal: bool,
}

struct FakeKernel {
    next_id: libc::c_int,
    clock: i64,
    segments: HashMap<SegmentId, FakeSegment>,
    failures: HashMap<FakeOp, Errno>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self {
            next_id: 1,
            clock: 1,
            segments: HashMap::new(),
            failures: HashMap::new(),
        }
    }
}

impl FakeKernel {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn check(&mut self, op: FakeOp) -> Result<(), Errno> {
        match self.failures.remove(&op) {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }

    fn find_key(&self, key: ShmKey) -> Option<SegmentId> {
        self.segments
            .iter()
            .find(|(_, seg)| seg.key == key && !seg.marked_for_removal)
            .map(|(id, _)| *id)
    }
}

/// A fake segment table shared by every clone, like the kernel is shared by
/// every process.
///
/// Follows Linux semantics where they matter to callers: probing a missing key
/// is `ENOENT`, creating with size zero is `EINVAL`, and removing an attached
/// segment only marks it; it disappears with its last detach.
#[derive(Clone)]
pub struct FakeIpc {
    kernel: Rc<RefCell<FakeKernel>>,
    layout: Option<&'static RecordLayout>,
    calls: Rc<Cell<usize>>,
}

impl Default for FakeIpc {
    fn default() -> Self {
        Self {
            kernel: Rc::default(),
            layout: Some(&X86_64_LINUX),
            calls: Rc::default(),
        }
    }
}

impl FakeIpc {
    /// Records are always produced in the x86_64 layout; `layout` is what
    /// the fake claims, so a different one exercises the mismatch path.
    pub fn with_layout(layout: Option<&'static RecordLayout>) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    /// Number of calls made through this fake and its clones.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Makes the next call of kind `op` fail with `errno`.
    pub fn fail_next(&self, op: FakeOp, errno: Errno) {
        self.kernel.borrow_mut().failures.insert(op, errno);
    }

    /// Number of segments still held by the fake, including ones marked for
    /// removal.
    pub fn segment_count(&self) -> usize {
        self.kernel.borrow().segments.len()
    }

    fn enter(&self, op: FakeOp) -> Result<std::cell::RefMut<'_, FakeKernel>, Errno> {
        self.calls.set(self.calls.get() + 1);
        let mut kernel = self.kernel.borrow_mut();
        kernel.check(op)?;
        Ok(kernel)
    }
}

impl SysvIpc for FakeIpc {
    fn derive_key(&self, path: &Path, proj_id: u8) -> Result<libc::key_t, Errno> {
        let _kernel = self.enter(FakeOp::DeriveKey)?;
        if !path.exists() {
            return Err(Errno::ENOENT);
        }
        // FNV-1a over the path, with proj_id in the top byte as ftok does.
        let hash = path
            .as_os_str()
            .as_encoded_bytes()
            .iter()
            .fold(0x811c_9dc5u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193));
        Ok((((proj_id as u32) << 24) | (hash & 0x00ff_ffff)) as libc::key_t)
    }

    fn get(&self, key: ShmKey, size: usize, flags: GetFlags) -> Result<SegmentId, Errno> {
        let mut kernel = self.enter(FakeOp::Get)?;
        if let Some(id) = kernel.find_key(key) {
            let segment_size = kernel.segments[&id].data.len();
            if size > segment_size {
                return Err(Errno::EINVAL);
            }
            return Ok(id);
        }
        let GetFlags::Create { mode } = flags else {
            return Err(Errno::ENOENT);
        };
        if size == 0 {
            return Err(Errno::EINVAL);
        }

        let id = SegmentId::from_raw(kernel.next_id);
        kernel.next_id += 1;
        let now = kernel.tick();
        let record = UsageRecord {
            permissions: IpcPermissions {
                key: key.as_raw(),
                mode: mode & 0o777,
                ..IpcPermissions::default()
            },
            segment_size: size as u64,
            last_change_time: now,
            creator_pid: std::process::id() as i32,
            ..UsageRecord::default()
        };
        kernel.segments.insert(
            id,
            FakeSegment {
                key,
                data: vec![0u8; size].into_boxed_slice(),
                record,
                marked_for_removal: false,
            },
        );
        Ok(id)
    }

    fn attach(&self, id: SegmentId) -> Result<NonNull<u8>, Errno> {
        let mut kernel = self.enter(FakeOp::Attach)?;
        let now = kernel.tick();
        let segment = kernel.segments.get_mut(&id).ok_or(Errno::EINVAL)?;
        if segment.marked_for_removal {
            return Err(Errno::EIDRM);
        }
        segment.record.attachment_count += 1;
        segment.record.last_attach_time = now;
        segment.record.last_operator_pid = std::process::id() as i32;
        NonNull::new(segment.data.as_mut_ptr()).ok_or(Errno::EINVAL)
    }

    unsafe fn detach(&self, addr: NonNull<u8>) -> Result<(), Errno> {
        let mut kernel = self.enter(FakeOp::Detach)?;
        let now = kernel.tick();
        let (id, segment) = kernel
            .segments
            .iter_mut()
            .find(|(_, seg)| seg.data.as_ptr() == addr.as_ptr() && seg.record.attachment_count > 0)
            .ok_or(Errno::EINVAL)?;
        let id = *id;
        segment.record.attachment_count -= 1;
        segment.record.last_detach_time = now;
        segment.record.last_operator_pid = std::process::id() as i32;
        if segment.marked_for_removal && segment.record.attachment_count == 0 {
            kernel.segments.remove(&id);
        }
        Ok(())
    }

    fn stat(&self, id: SegmentId) -> Result<Vec<u8>, Errno> {
        let kernel = self.enter(FakeOp::Stat)?;
        let segment = kernel.segments.get(&id).ok_or(Errno::EINVAL)?;
        Ok(X86_64_LINUX.encode(&segment.record))
    }

    /// Fails along with [`FakeOp::Stat`], both being `IPC_STAT` underneath.
    fn segment_size(&self, id: SegmentId) -> Result<usize, Errno> {
        let kernel = self.enter(FakeOp::Stat)?;
        let segment = kernel.segments.get(&id).ok_or(Errno::EINVAL)?;
        Ok(segment.data.len())
    }

    fn remove(&self, id: SegmentId) -> Result<(), Errno> {
        let mut kernel = self.enter(FakeOp::Remove)?;
        let segment = kernel.segments.get_mut(&id).ok_or(Errno::EINVAL)?;
        if segment.record.attachment_count == 0 {
            kernel.segments.remove(&id);
        } else {
            segment.marked_for_removal = true;
        }
        Ok(())
    }

    fn native_layout(&self) -> Option<&'static RecordLayout> {
        self.layout
    }
}

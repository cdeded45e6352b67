// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`SysvIpc`] bound to the host C library.

use crate::ipc::{GetFlags, SegmentId, SysvIpc};
use crate::key::ShmKey;
use crate::record::RecordLayout;
use nix::errno::Errno;
use std::ffi::CString;
use std::mem::{size_of, MaybeUninit};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use tracing::trace;

/// The host's System V shared memory calls.
///
/// Stateless: the C library is linked once for the whole process, so any
/// number of segments, on any thread, can share one `HostIpc`.
#[derive(Debug, Default, Copy, Clone)]
pub struct HostIpc;

impl SysvIpc for HostIpc {
    fn derive_key(&self, path: &Path, proj_id: u8) -> Result<libc::key_t, Errno> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
        // SAFETY: `path` is a valid nul-terminated string for the whole call.
        let key = Errno::result(unsafe { libc::ftok(path.as_ptr(), proj_id as libc::c_int) })?;
        trace!(?path, proj_id, key, "ftok");
        Ok(key)
    }

    fn get(&self, key: ShmKey, size: usize, flags: GetFlags) -> Result<SegmentId, Errno> {
        // SAFETY: shmget has no memory safety requirements.
        let id = Errno::result(unsafe { libc::shmget(key.as_raw(), size, flags.bits()) })?;
        trace!(%key, size, ?flags, id, "shmget");
        Ok(SegmentId::from_raw(id))
    }

    fn attach(&self, id: SegmentId) -> Result<NonNull<u8>, Errno> {
        // SAFETY: a null address lets the kernel pick an unused range, so no
        // existing mapping is replaced.
        let addr = unsafe { libc::shmat(id.as_raw(), ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(Errno::last());
        }
        trace!(%id, ?addr, "shmat");
        NonNull::new(addr.cast::<u8>()).ok_or(Errno::EINVAL)
    }

    unsafe fn detach(&self, addr: NonNull<u8>) -> Result<(), Errno> {
        Errno::result(libc::shmdt(addr.as_ptr().cast::<libc::c_void>().cast_const()))?;
        trace!(?addr, "shmdt");
        Ok(())
    }

    fn stat(&self, id: SegmentId) -> Result<Vec<u8>, Errno> {
        let ds = ipc_stat(id)?;
        // SAFETY: `ds` was zero-initialized and then filled in by the kernel,
        // so every byte, padding included, is initialized.
        let raw = unsafe {
            std::slice::from_raw_parts(ds.as_ptr().cast::<u8>(), size_of::<libc::shmid_ds>())
        };
        Ok(raw.to_vec())
    }

    fn segment_size(&self, id: SegmentId) -> Result<usize, Errno> {
        let ds = ipc_stat(id)?;
        // SAFETY: filled in by the kernel.
        Ok(unsafe { ds.assume_init_ref() }.shm_segsz as usize)
    }

    fn remove(&self, id: SegmentId) -> Result<(), Errno> {
        // SAFETY: IPC_RMID does not read the buffer argument.
        Errno::result(unsafe { libc::shmctl(id.as_raw(), libc::IPC_RMID, ptr::null_mut()) })?;
        trace!(%id, "shmctl(IPC_RMID)");
        Ok(())
    }

    fn native_layout(&self) -> Option<&'static RecordLayout> {
        RecordLayout::native()
    }
}

fn ipc_stat(id: SegmentId) -> Result<MaybeUninit<libc::shmid_ds>, Errno> {
    let mut ds = MaybeUninit::<libc::shmid_ds>::zeroed();
    // SAFETY: `ds` is a writable buffer of the size shmctl expects.
    Errno::result(unsafe { libc::shmctl(id.as_raw(), libc::IPC_STAT, ds.as_mut_ptr()) })?;
    trace!(%id, "shmctl(IPC_STAT)");
    Ok(ds)
}

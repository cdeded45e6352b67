// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Usage record codec.
//!
//! The kernel reports a segment's metadata as a fixed-size `shmid_ds` record
//! whose field widths and padding depend on the architecture. Instead of
//! trusting a `#[repr(C)]` struct, each supported platform has a
//! [`RecordLayout`]: an ordered table of fields, every byte accounted for,
//! padding included.
//!
//! # Layout
//!
//! ```text
//! +-------------------------------------------------+------------------------------------+
//! | ipc_perm                                        | segment statistics                 |
//! | key uid gid cuid cgid mode seq reserved x2      | segsz atime dtime ctime cpid lpid  |
//! |                                                 | nattch reserved x2                 |
//! +-------------------------------------------------+------------------------------------+
//! ```
//!
//! Integers are stored in native byte order.

use crate::error::ShmError;
use serde::{Deserialize, Serialize};
use Width::{W16, W32, W64};

/// The permission sub-record (`ipc_perm`).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcPermissions {
    pub key: i32,
    /// Owner's user id.
    pub uid: u32,
    /// Owner's group id.
    pub gid: u32,
    /// Creator's user id.
    pub cuid: u32,
    /// Creator's group id.
    pub cgid: u32,
    /// Permission bits.
    pub mode: u32,
    /// Slot usage sequence number.
    pub seq: u16,
}

/// A decoded snapshot of a segment's kernel metadata.
///
/// Times are seconds since the epoch, zero meaning "never".
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub permissions: IpcPermissions,
    pub segment_size: u64,
    pub last_attach_time: i64,
    pub last_detach_time: i64,
    pub last_change_time: i64,
    pub creator_pid: i32,
    pub last_operator_pid: i32,
    /// Number of live mappings of the segment, across all processes.
    pub attachment_count: u64,
}

/// What a field of the raw record holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
    Key,
    Uid,
    Gid,
    Cuid,
    Cgid,
    Mode,
    Seq,
    SegmentSize,
    AttachTime,
    DetachTime,
    ChangeTime,
    CreatorPid,
    LastOperatorPid,
    AttachmentCount,
    /// Words reserved by the C library, skipped when decoding.
    Reserved,
    /// Alignment or explicit padding, skipped when decoding.
    Padding,
}

impl Slot {
    fn store(self, record: &mut UsageRecord, bits: u64) {
        let perm = &mut record.permissions;
        match self {
            Slot::Key => perm.key = bits as i32,
            Slot::Uid => perm.uid = bits as u32,
            Slot::Gid => perm.gid = bits as u32,
            Slot::Cuid => perm.cuid = bits as u32,
            Slot::Cgid => perm.cgid = bits as u32,
            Slot::Mode => perm.mode = bits as u32,
            Slot::Seq => perm.seq = bits as u16,
            Slot::SegmentSize => record.segment_size = bits,
            Slot::AttachTime => record.last_attach_time = bits as i64,
            Slot::DetachTime => record.last_detach_time = bits as i64,
            Slot::ChangeTime => record.last_change_time = bits as i64,
            Slot::CreatorPid => record.creator_pid = bits as i32,
            Slot::LastOperatorPid => record.last_operator_pid = bits as i32,
            Slot::AttachmentCount => record.attachment_count = bits,
            Slot::Reserved | Slot::Padding => {}
        }
    }

    // Signed values are sign-extended to 64 bits.
    fn load(self, record: &UsageRecord) -> u64 {
        let perm = &record.permissions;
        match self {
            Slot::Key => perm.key as i64 as u64,
            Slot::Uid => perm.uid as u64,
            Slot::Gid => perm.gid as u64,
            Slot::Cuid => perm.cuid as u64,
            Slot::Cgid => perm.cgid as u64,
            Slot::Mode => perm.mode as u64,
            Slot::Seq => perm.seq as u64,
            Slot::SegmentSize => record.segment_size,
            Slot::AttachTime => record.last_attach_time as u64,
            Slot::DetachTime => record.last_detach_time as u64,
            Slot::ChangeTime => record.last_change_time as u64,
            Slot::CreatorPid => record.creator_pid as i64 as u64,
            Slot::LastOperatorPid => record.last_operator_pid as i64 as u64,
            Slot::AttachmentCount => record.attachment_count,
            Slot::Reserved | Slot::Padding => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    W16,
    W32,
    W64,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    fn read(self, bytes: &[u8], signed: bool) -> Option<u64> {
        let bits = match self {
            Width::W16 => {
                let v = u16::from_ne_bytes(bytes.try_into().ok()?);
                if signed {
                    v as i16 as i64 as u64
                } else {
                    v as u64
                }
            }
            Width::W32 => {
                let v = u32::from_ne_bytes(bytes.try_into().ok()?);
                if signed {
                    v as i32 as i64 as u64
                } else {
                    v as u64
                }
            }
            Width::W64 => u64::from_ne_bytes(bytes.try_into().ok()?),
        };
        Some(bits)
    }

    // Keeps the low-order bytes of `bits`.
    fn write(self, bits: u64, out: &mut Vec<u8>) {
        match self {
            Width::W16 => out.extend_from_slice(&(bits as u16).to_ne_bytes()),
            Width::W32 => out.extend_from_slice(&(bits as u32).to_ne_bytes()),
            Width::W64 => out.extend_from_slice(&bits.to_ne_bytes()),
        }
    }
}

/// One entry of a layout table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LayoutField {
    pub slot: Slot,
    pub width: Width,
    pub signed: bool,
}

const fn signed(slot: Slot, width: Width) -> LayoutField {
    LayoutField {
        slot,
        width,
        signed: true,
    }
}

const fn unsigned(slot: Slot, width: Width) -> LayoutField {
    LayoutField {
        slot,
        width,
        signed: false,
    }
}

const fn pad(width: Width) -> LayoutField {
    unsigned(Slot::Padding, width)
}

const fn reserved(width: Width) -> LayoutField {
    unsigned(Slot::Reserved, width)
}

/// An ordered description of a platform's raw usage record.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordLayout {
    name: &'static str,
    fields: &'static [LayoutField],
}

/// x86_64 Linux: 16-bit mode, seq words padded to 32 bits, 64-bit times.
pub const X86_64_LINUX: RecordLayout = RecordLayout {
    name: "x86_64-linux",
    fields: &[
        signed(Slot::Key, W32),
        unsigned(Slot::Uid, W32),
        unsigned(Slot::Gid, W32),
        unsigned(Slot::Cuid, W32),
        unsigned(Slot::Cgid, W32),
        unsigned(Slot::Mode, W16),
        pad(W16),
        unsigned(Slot::Seq, W16),
        pad(W16),
        pad(W32),
        reserved(W64),
        reserved(W64),
        unsigned(Slot::SegmentSize, W64),
        signed(Slot::AttachTime, W64),
        signed(Slot::DetachTime, W64),
        signed(Slot::ChangeTime, W64),
        signed(Slot::CreatorPid, W32),
        signed(Slot::LastOperatorPid, W32),
        unsigned(Slot::AttachmentCount, W64),
        reserved(W64),
        reserved(W64),
    ],
};

/// aarch64 Linux (asm-generic): 32-bit mode, 64-bit times.
pub const AARCH64_LINUX: RecordLayout = RecordLayout {
    name: "aarch64-linux",
    fields: &[
        signed(Slot::Key, W32),
        unsigned(Slot::Uid, W32),
        unsigned(Slot::Gid, W32),
        unsigned(Slot::Cuid, W32),
        unsigned(Slot::Cgid, W32),
        unsigned(Slot::Mode, W32),
        unsigned(Slot::Seq, W16),
        pad(W16),
        pad(W32),
        reserved(W64),
        reserved(W64),
        unsigned(Slot::SegmentSize, W64),
        signed(Slot::AttachTime, W64),
        signed(Slot::DetachTime, W64),
        signed(Slot::ChangeTime, W64),
        signed(Slot::CreatorPid, W32),
        signed(Slot::LastOperatorPid, W32),
        unsigned(Slot::AttachmentCount, W64),
        reserved(W64),
        reserved(W64),
    ],
};

/// i686 Linux with glibc: 32-bit words, each time followed by a reserved word.
pub const I686_LINUX_GNU: RecordLayout = RecordLayout {
    name: "i686-linux-gnu",
    fields: &[
        signed(Slot::Key, W32),
        unsigned(Slot::Uid, W32),
        unsigned(Slot::Gid, W32),
        unsigned(Slot::Cuid, W32),
        unsigned(Slot::Cgid, W32),
        unsigned(Slot::Mode, W16),
        pad(W16),
        unsigned(Slot::Seq, W16),
        pad(W16),
        reserved(W32),
        reserved(W32),
        unsigned(Slot::SegmentSize, W32),
        signed(Slot::AttachTime, W32),
        reserved(W32),
        signed(Slot::DetachTime, W32),
        reserved(W32),
        signed(Slot::ChangeTime, W32),
        reserved(W32),
        signed(Slot::CreatorPid, W32),
        signed(Slot::LastOperatorPid, W32),
        unsigned(Slot::AttachmentCount, W32),
        reserved(W32),
        reserved(W32),
    ],
};

const _: () = assert!(X86_64_LINUX.size() == 112);
const _: () = assert!(AARCH64_LINUX.size() == 112);
const _: () = assert!(I686_LINUX_GNU.size() == 84);

impl RecordLayout {
    pub const fn new(name: &'static str, fields: &'static [LayoutField]) -> Self {
        Self { name, fields }
    }

    /// The layout the kernel uses on the target this crate was built for.
    pub fn native() -> Option<&'static RecordLayout> {
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            Some(&X86_64_LINUX)
        } else if cfg!(all(target_os = "linux", target_arch = "aarch64")) {
            Some(&AARCH64_LINUX)
        } else if cfg!(all(target_os = "linux", target_arch = "x86", target_env = "gnu")) {
            Some(&I686_LINUX_GNU)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &'static [LayoutField] {
        self.fields
    }

    /// Total record size in bytes.
    pub const fn size(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.fields.len() {
            total += self.fields[i].width.bytes();
            i += 1;
        }
        total
    }

    /// Byte offset of the first field holding `slot`.
    pub fn offset_of(&self, slot: Slot) -> Option<usize> {
        let mut offset = 0;
        for field in self.fields {
            if field.slot == slot {
                return Some(offset);
            }
            offset += field.width.bytes();
        }
        None
    }

    fn mismatch(&self, actual: usize) -> ShmError {
        ShmError::LayoutMismatch {
            layout: self.name,
            expected: self.size(),
            actual,
        }
    }

    /// Decodes a raw record. `raw` must be exactly [`RecordLayout::size`]
    /// bytes long.
    pub fn decode(&self, raw: &[u8]) -> Result<UsageRecord, ShmError> {
        if raw.len() != self.size() {
            return Err(self.mismatch(raw.len()));
        }

        let mut record = UsageRecord::default();
        let mut offset = 0;
        for field in self.fields {
            let end = offset + field.width.bytes();
            let bits = raw
                .get(offset..end)
                .and_then(|bytes| field.width.read(bytes, field.signed))
                .ok_or_else(|| self.mismatch(raw.len()))?;
            field.slot.store(&mut record, bits);
            offset = end;
        }

        if offset != raw.len() {
            return Err(self.mismatch(raw.len()));
        }
        Ok(record)
    }

    /// Encodes `record` in this layout, zeroing reserved and padding bytes.
    /// Values wider than their field are truncated.
    pub fn encode(&self, record: &UsageRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for field in self.fields {
            field.width.write(field.slot.load(record), &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UsageRecord {
        UsageRecord {
            permissions: IpcPermissions {
                key: 0x8827,
                uid: 1000,
                gid: 1001,
                cuid: 1002,
                cgid: 1003,
                mode: 0o666,
                seq: 9,
            },
            segment_size: 4096,
            last_attach_time: 1_700_000_000,
            last_detach_time: 1_700_000_005,
            last_change_time: 1_699_999_999,
            creator_pid: 4242,
            last_operator_pid: 4243,
            attachment_count: 2,
        }
    }

    #[test]
    fn decode_hand_built_x86_64_record() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x8827i32.to_ne_bytes());
        for id in [1000u32, 1001, 1002, 1003] {
            raw.extend_from_slice(&id.to_ne_bytes());
        }
        raw.extend_from_slice(&0o666u16.to_ne_bytes());
        raw.extend_from_slice(&0xffffu16.to_ne_bytes()); // padding is ignored
        raw.extend_from_slice(&9u16.to_ne_bytes());
        raw.extend_from_slice(&[0xaa; 2 + 4]);
        raw.extend_from_slice(&[0xbb; 16]);
        raw.extend_from_slice(&4096u64.to_ne_bytes());
        for time in [1_700_000_000i64, 1_700_000_005, 1_699_999_999] {
            raw.extend_from_slice(&time.to_ne_bytes());
        }
        raw.extend_from_slice(&4242i32.to_ne_bytes());
        raw.extend_from_slice(&4243i32.to_ne_bytes());
        raw.extend_from_slice(&2u64.to_ne_bytes());
        raw.extend_from_slice(&[0xcc; 16]);
        assert_eq!(raw.len(), 112);

        assert_eq!(X86_64_LINUX.decode(&raw).unwrap(), sample());
    }

    #[test]
    fn decode_hand_built_i686_record() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(-5i32).to_ne_bytes());
        for id in [1u32, 2, 3, 4] {
            raw.extend_from_slice(&id.to_ne_bytes());
        }
        raw.extend_from_slice(&0o600u16.to_ne_bytes());
        raw.extend_from_slice(&[0; 2]);
        raw.extend_from_slice(&3u16.to_ne_bytes());
        raw.extend_from_slice(&[0; 2 + 8]);
        raw.extend_from_slice(&8192u32.to_ne_bytes());
        for time in [10i32, 20, 30] {
            raw.extend_from_slice(&time.to_ne_bytes());
            raw.extend_from_slice(&[0x11; 4]);
        }
        raw.extend_from_slice(&7i32.to_ne_bytes());
        raw.extend_from_slice(&8i32.to_ne_bytes());
        raw.extend_from_slice(&1u32.to_ne_bytes());
        raw.extend_from_slice(&[0; 8]);
        assert_eq!(raw.len(), 84);

        let record = I686_LINUX_GNU.decode(&raw).unwrap();
        assert_eq!(record.permissions.key, -5);
        assert_eq!(record.permissions.mode, 0o600);
        assert_eq!(record.permissions.seq, 3);
        assert_eq!(record.segment_size, 8192);
        assert_eq!(record.last_attach_time, 10);
        assert_eq!(record.last_detach_time, 20);
        assert_eq!(record.last_change_time, 30);
        assert_eq!(record.creator_pid, 7);
        assert_eq!(record.last_operator_pid, 8);
        assert_eq!(record.attachment_count, 1);
    }

    #[test]
    fn encode_matches_table() {
        for layout in [&X86_64_LINUX, &AARCH64_LINUX, &I686_LINUX_GNU] {
            let raw = layout.encode(&sample());
            assert_eq!(raw.len(), layout.size(), "{}", layout.name());
            assert_eq!(layout.decode(&raw).unwrap(), sample(), "{}", layout.name());
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        let raw = vec![0u8; 111];
        match X86_64_LINUX.decode(&raw) {
            Err(ShmError::LayoutMismatch {
                layout,
                expected,
                actual,
            }) => {
                assert_eq!(layout, "x86_64-linux");
                assert_eq!(expected, 112);
                assert_eq!(actual, 111);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(X86_64_LINUX.decode(&[]).is_err());
        assert!(X86_64_LINUX.decode(&[0u8; 113]).is_err());
    }

    #[test]
    fn custom_layout() {
        static FIELDS: [LayoutField; 3] = [
            unsigned(Slot::AttachmentCount, W16),
            pad(W16),
            signed(Slot::CreatorPid, W32),
        ];
        let layout = RecordLayout::new("tiny", &FIELDS);
        assert_eq!(layout.size(), 8);

        let mut raw = Vec::new();
        raw.extend_from_slice(&3u16.to_ne_bytes());
        raw.extend_from_slice(&[0; 2]);
        raw.extend_from_slice(&(-1i32).to_ne_bytes());
        let record = layout.decode(&raw).unwrap();
        assert_eq!(record.attachment_count, 3);
        assert_eq!(record.creator_pid, -1);
    }

    #[test]
    fn offsets_follow_table_order() {
        assert_eq!(X86_64_LINUX.offset_of(Slot::Key), Some(0));
        assert_eq!(X86_64_LINUX.offset_of(Slot::Mode), Some(20));
        assert_eq!(X86_64_LINUX.offset_of(Slot::Seq), Some(24));
        assert_eq!(X86_64_LINUX.offset_of(Slot::SegmentSize), Some(48));
        assert_eq!(X86_64_LINUX.offset_of(Slot::AttachmentCount), Some(88));
        assert_eq!(AARCH64_LINUX.offset_of(Slot::Seq), Some(24));
        assert_eq!(I686_LINUX_GNU.offset_of(Slot::ChangeTime), Some(56));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn native_layout_matches_libc() {
        use std::mem::{offset_of, size_of};

        let Some(layout) = RecordLayout::native() else {
            return;
        };
        assert_eq!(layout.size(), size_of::<libc::shmid_ds>());

        let perm = offset_of!(libc::shmid_ds, shm_perm);
        let expected = [
            (Slot::Uid, perm + offset_of!(libc::ipc_perm, uid)),
            (Slot::Cgid, perm + offset_of!(libc::ipc_perm, cgid)),
            (Slot::Mode, perm + offset_of!(libc::ipc_perm, mode)),
            (Slot::SegmentSize, offset_of!(libc::shmid_ds, shm_segsz)),
            (Slot::AttachTime, offset_of!(libc::shmid_ds, shm_atime)),
            (Slot::DetachTime, offset_of!(libc::shmid_ds, shm_dtime)),
            (Slot::ChangeTime, offset_of!(libc::shmid_ds, shm_ctime)),
            (Slot::CreatorPid, offset_of!(libc::shmid_ds, shm_cpid)),
            (Slot::LastOperatorPid, offset_of!(libc::shmid_ds, shm_lpid)),
            (Slot::AttachmentCount, offset_of!(libc::shmid_ds, shm_nattch)),
        ];
        for (slot, offset) in expected {
            assert_eq!(layout.offset_of(slot), Some(offset), "{slot:?}");
        }
    }

    /// Fuzz: any byte sequence of the wrong length is rejected, any sequence
    /// of the right length decodes, and re-encoding preserves every field.
    #[test]
    fn fuzz_decode_arbitrary_bytes() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            for layout in [&X86_64_LINUX, &AARCH64_LINUX, &I686_LINUX_GNU] {
                if bytes.len() != layout.size() {
                    assert!(matches!(
                        layout.decode(bytes),
                        Err(ShmError::LayoutMismatch { .. })
                    ));
                }

                let mut raw = bytes.clone();
                raw.resize(layout.size(), 0);
                let record = layout.decode(&raw).unwrap();
                assert_eq!(layout.decode(&layout.encode(&record)).unwrap(), record);
            }
        });
    }
}

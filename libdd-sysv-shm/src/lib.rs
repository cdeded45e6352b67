// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![cfg(unix)]

//! System V shared memory segments.
//!
//! - [`Segment`]: opens or creates the segment for a [`ShmKey`], attaches and
//!   detaches it, reads and writes through the mapping, and removes it once
//!   nobody has it mapped.
//! - [`UsageRecord`]: the kernel's metadata for a segment (`shmid_ds`),
//!   decoded through a per-platform [`RecordLayout`] table.
//!
//! All kernel calls go through the [`SysvIpc`] trait; [`HostIpc`] is the
//! implementation backed by the C library.

pub mod config;
pub mod error;
pub mod ipc;
pub mod key;
#[cfg(target_os = "linux")]
pub mod platform;
pub mod record;
pub mod segment;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SegmentConfig;
pub use error::{KeyError, ShmError};
pub use ipc::{GetFlags, SegmentId, SysvIpc};
pub use key::{KeySource, ShmKey};
#[cfg(target_os = "linux")]
pub use platform::HostIpc;
pub use record::{IpcPermissions, RecordLayout, UsageRecord};
pub use segment::{DestroyOutcome, Segment};

// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! Opens (or creates) a System V shared memory segment, optionally dumps some
//! of its bytes, and prints its usage record as JSON.

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    inspect::run()
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("sysv-shm-inspect only supports Linux")
}

#[cfg(target_os = "linux")]
mod inspect {
    use anyhow::Context;
    use clap::Parser;
    use libdd_sysv_shm::{DestroyOutcome, KeySource, Segment, SegmentConfig};
    use std::fmt::Write;
    use std::time::Duration;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    #[derive(Parser, Debug)]
    #[command(version, about)]
    struct Args {
        /// Segment key: `0x` hex or decimal integer, or an existing path.
        /// Falls back to DD_SYSV_SHM_KEY and friends when absent.
        #[arg(long)]
        key: Option<String>,

        /// Discriminator byte for path-derived keys.
        #[arg(long, default_value_t = 0)]
        proj_id: u8,

        /// Size in bytes, used only when the segment has to be created.
        #[arg(long, default_value_t = SegmentConfig::DEFAULT_SIZE)]
        size: usize,

        /// Attach and dump this many bytes.
        #[arg(long)]
        read: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Stay attached for this many seconds before detaching.
        #[arg(long)]
        hold: Option<u64>,

        /// Remove the segment afterwards, unless another process has it
        /// attached.
        #[arg(long)]
        destroy: bool,
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().fold(String::new(), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    pub fn run() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();
        let config = match &args.key {
            Some(key) => SegmentConfig::new(
                args.size,
                KeySource::parse(key, args.proj_id)
                    .with_context(|| format!("invalid --key {key:?}"))?,
            ),
            None => SegmentConfig::from_env()?,
        };

        let mut segment = Segment::from_config(&config)?;
        if !segment.is_creator() {
            info!(key = %segment.key(), "segment already created by another process, using it");
        }

        if args.read.is_some() || args.hold.is_some() {
            segment.attach()?;
        }
        if let Some(length) = args.read {
            println!("{}", hex(&segment.read(length, args.offset)?));
        }
        if let Some(secs) = args.hold {
            std::thread::sleep(Duration::from_secs(secs));
        }
        if segment.is_attached() {
            segment.detach()?;
        }

        let record = segment.stat()?;
        println!("{}", serde_json::to_string_pretty(&record)?);

        if args.destroy {
            match segment.destroy()? {
                DestroyOutcome::Removed => info!(id = %segment.id(), "segment removed"),
                DestroyOutcome::Skipped { attachment_count } => {
                    info!(attachment_count, "other processes are using the segment, not removed")
                }
            }
        }
        Ok(())
    }

}

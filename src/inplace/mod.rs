//! In-place encryption: streaming a plaintext filesystem through dm-crypt onto itself.
//!
//! Three strategies are tried in turn. The ext4 and f2fs ones read the filesystem's allocation
//! metadata and copy only blocks in use; the last one copies the whole device and works on
//! anything. Every strategy can be stopped at a batch boundary when the battery runs low, and
//! reports how far it got so that a later run can pick up from there.

pub mod ext4;
pub mod f2fs;
pub mod full;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use log::{debug, error, warn};
use retry::{delay::Fixed, retry};
use thiserror::Error;

use crate::blockdev::{CRYPT_INPLACE_BUFSIZE, CRYPT_SECTOR_SIZE};
use crate::platform::{self, PowerMonitor, BATTERY_CONTINUE_PERCENT};
use crate::props::{self, Properties};

pub const CRYPT_SECTORS_PER_BUFSIZE: u64 = CRYPT_INPLACE_BUFSIZE as u64 / CRYPT_SECTOR_SIZE;

/// Largest run of blocks copied at once; runs also break at multiples of this many blocks
pub const BLOCKS_AT_A_TIME: u64 = 8;

const RETRY_OPEN_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum InplaceError {
    /// The crypto device could not be opened
    #[error("crypto block device unavailable")]
    Device(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InplaceError {
    pub fn error_code(&self) -> i32 {
        match self {
            InplaceError::Other(_) => -1,
            InplaceError::Device(_) => -2,
        }
    }
}

/// How far a run got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InplaceOutcome {
    /// Sectors, from the start of the device, that are now encrypted or free
    pub done_sectors: u64,

    /// False if the run stopped early
    pub completed: bool,
}

/// The devices and system services a run works with
pub struct InplaceContext<'a> {
    pub real_blkdev: &'a Path,
    pub crypto_blkdev: &'a Path,

    /// Where to publish progress, if anywhere
    pub props: Option<&'a dyn Properties>,
    pub power: &'a dyn PowerMonitor,
}

impl InplaceContext<'_> {
    /// Open the real device for reading and the crypto device for writing
    ///
    /// The crypto device may take a moment to appear after the mapping is created.
    fn open_devices(&self) -> Result<(File, File), InplaceError> {
        let real = File::open(self.real_blkdev)
            .with_context(|| format!("Error opening real_blkdev {}", self.real_blkdev.display()))?;

        let mut tries = 0;
        let crypto = retry(Fixed::from_millis(1000).take(RETRY_OPEN_ATTEMPTS - 1), || {
            tries += 1;
            OpenOptions::new().write(true).open(self.crypto_blkdev)
        })
        .with_context(|| {
            format!(
                "Error opening crypto_blkdev {} after {tries} tries",
                self.crypto_blkdev.display()
            )
        })
        .map_err(InplaceError::Device)?;

        Ok((real, crypto))
    }

    fn keep_going(&self) -> bool {
        let ok = platform::battery_ok(self.power, BATTERY_CONTINUE_PERCENT);
        if !ok {
            error!("Stopping encryption due to low battery");
        }
        ok
    }
}

/// Copies runs of blocks from the real device to the crypto device
struct Copier<'a> {
    real: &'a File,
    crypto: &'a File,
    block_size: u64,
    buf: Vec<u8>,

    /// Pending run: byte offset and length in blocks
    offset: u64,
    count: u64,
}

impl<'a> Copier<'a> {
    fn new(real: &'a File, crypto: &'a File, block_size: u64, max_blocks: u64) -> Self {
        Self {
            real,
            crypto,
            block_size,
            buf: vec![0u8; (block_size * max_blocks) as usize],
            offset: 0,
            count: 0,
        }
    }

    /// Add the block at byte `offset` to the pending run
    fn push(&mut self, offset: u64) {
        if self.count == 0 {
            self.offset = offset;
        }
        self.count += 1;
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        debug!("Copying {} blocks at offset {:#x}", self.count, self.offset);
        let len = (self.count * self.block_size) as usize;
        self.copy(self.offset, len)?;
        self.count = 0;
        Ok(())
    }

    /// Copy `len` bytes at `offset` right away, bypassing the pending run
    fn copy(&mut self, offset: u64, len: usize) -> anyhow::Result<()> {
        let buf = &mut self.buf[..len];
        self.real
            .read_exact_at(buf, offset)
            .context("Error reading real_blkdev for inplace encrypt")?;
        self.crypto
            .write_all_at(buf, offset)
            .context("Error writing crypto_blkdev for inplace encrypt")?;
        Ok(())
    }
}

/// Percentage and time-remaining bookkeeping, published to properties and the terminal
struct Progress<'a> {
    props: Option<&'a dyn Properties>,
    rpt: howudoin::Tx,
    blocks_done: u64,
    used_blocks_done: u64,
    tot_used_blocks: u64,
    cur_pct: u64,
    started: Instant,
    remaining_time: Option<u64>,
}

impl<'a> Progress<'a> {
    fn new(label: &str, props: Option<&'a dyn Properties>, tot_used_blocks: u64) -> Self {
        let rpt = howudoin::new().label(label).set_len(tot_used_blocks);
        Self {
            props,
            rpt,
            blocks_done: 0,
            used_blocks_done: 0,
            tot_used_blocks,
            cur_pct: 0,
            started: Instant::now(),
            remaining_time: None,
        }
    }

    /// One more block looked at
    fn update(&mut self, used: bool) {
        self.blocks_done += 1;
        if used {
            self.used_blocks_done += 1;
        }
        self.publish();
    }

    /// Jump to an absolute position
    fn set(&mut self, blocks_done: u64, used_blocks_done: u64) {
        self.blocks_done = blocks_done;
        self.used_blocks_done = used_blocks_done;
        self.publish();
    }

    fn set_property(&self, key: &str, value: &str) {
        if let Some(props) = self.props {
            if let Err(e) = props.set(key, value) {
                warn!("cannot set {key}: {e:#}");
            }
        }
    }

    fn publish(&mut self) {
        self.rpt.set_pos(self.used_blocks_done);

        if self.props.is_none() || self.tot_used_blocks == 0 {
            return;
        }

        let new_pct = self.used_blocks_done * 100 / self.tot_used_blocks;
        if new_pct > self.cur_pct {
            self.cur_pct = new_pct;
            self.set_property(props::ENCRYPT_PROGRESS, &new_pct.to_string());
        }

        if self.cur_pct >= 5 && self.used_blocks_done > 0 {
            let elapsed = self.started.elapsed().as_secs();
            let remaining_blocks = self.tot_used_blocks.saturating_sub(self.used_blocks_done);
            let remaining_time = elapsed * remaining_blocks / self.used_blocks_done;

            // Only move the estimate when it is new, lower, or a lot higher
            let republish = match self.remaining_time {
                None => true,
                Some(prev) => remaining_time < prev || remaining_time > prev + 60,
            };
            if republish {
                self.remaining_time = Some(remaining_time);
                self.set_property(props::ENCRYPT_TIME_REMAINING, &remaining_time.to_string());
            }
        }
    }

    fn finish(self, completed: bool) {
        if !completed {
            self.rpt.add_info("Stopped early");
        }
        self.rpt.close();
    }
}

/// Encrypt `size` sectors of `ctx.real_blkdev` in place, through `ctx.crypto_blkdev`
///
/// `already_done` is where this volume starts within the overall run, and
/// `previously_encrypted_upto` is the checkpoint of an interrupted earlier run (0 if none).
pub fn encrypt_inplace(
    ctx: &InplaceContext,
    size: u64,
    already_done: u64,
    previously_encrypted_upto: u64,
) -> Result<InplaceOutcome, InplaceError> {
    debug!(
        "encrypt_inplace({}, {}, {size}, {already_done}, {previously_encrypted_upto})",
        ctx.crypto_blkdev.display(),
        ctx.real_blkdev.display()
    );
    if previously_encrypted_upto > 0 {
        debug!("Continuing encryption from {previously_encrypted_upto}");
    }

    if already_done + size < previously_encrypted_upto {
        debug!("encrypt_inplace already done");
        return Ok(InplaceOutcome {
            done_sectors: already_done + size,
            completed: true,
        });
    }

    let ext4_err = match ext4::encrypt(ctx, size, already_done, previously_encrypted_upto) {
        Ok(outcome) => return Ok(outcome),
        Err(e) => {
            debug!("ext4 in-place encryption: {e:#}");
            e
        }
    };

    let f2fs_err = match f2fs::encrypt(ctx, size, already_done, previously_encrypted_upto) {
        Ok(outcome) => return Ok(outcome),
        Err(e) => {
            debug!("f2fs in-place encryption: {e:#}");
            e
        }
    };

    match full::encrypt(ctx, size, already_done, previously_encrypted_upto) {
        Ok(outcome) => Ok(outcome),
        Err(full_err) => {
            let all_device = [&ext4_err, &f2fs_err, &full_err]
                .iter()
                .all(|e| matches!(e, InplaceError::Device(_)));
            match (all_device, full_err) {
                (false, InplaceError::Device(e)) => Err(InplaceError::Other(e)),
                (_, e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::platform::SimPower;
    use crate::props::MemoryProperties;

    /// A real device of `size` bytes filled with a per-block pattern, and an empty crypto device
    pub(crate) fn devices(
        dir: &tempfile::TempDir,
        size: u64,
    ) -> anyhow::Result<(std::path::PathBuf, std::path::PathBuf)> {
        let real = dir.path().join("real");
        let crypto = dir.path().join("crypto");
        let data: Vec<u8> = (0..size).map(|i| (i / 512 % 251) as u8 + 1).collect();
        std::fs::write(&real, data)?;
        File::create(&crypto)?.set_len(size)?;
        Ok((real, crypto))
    }

    #[test]
    fn progress_properties() {
        let props = MemoryProperties::new();
        let mut progress = Progress::new("test", Some(&props), 200);

        progress.update(false);
        assert_eq!(props.get(props::ENCRYPT_PROGRESS), None);

        progress.update(true);
        progress.update(true);
        assert_eq!(props.get(props::ENCRYPT_PROGRESS).as_deref(), Some("1"));
        assert_eq!(props.get(props::ENCRYPT_TIME_REMAINING), None);

        progress.set(20, 20);
        assert_eq!(props.get(props::ENCRYPT_PROGRESS).as_deref(), Some("10"));
        assert!(props.get(props::ENCRYPT_TIME_REMAINING).is_some());
        progress.finish(true);

        // Without a property store nothing is published
        let mut quiet = Progress::new("test", None, 1);
        quiet.update(true);
        quiet.finish(true);
    }

    #[test]
    fn falls_back_to_full_copy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (real, crypto) = devices(&dir, 64 * 1024)?;
        let power = SimPower::full();
        let ctx = InplaceContext {
            real_blkdev: &real,
            crypto_blkdev: &crypto,
            props: None,
            power: &power,
        };

        let outcome = encrypt_inplace(&ctx, 128, 0, 0)?;
        assert_eq!(
            outcome,
            InplaceOutcome {
                done_sectors: 128,
                completed: true
            }
        );
        assert_eq!(std::fs::read(&real)?, std::fs::read(&crypto)?);
        Ok(())
    }

    #[test]
    fn already_past_this_volume() -> anyhow::Result<()> {
        let power = SimPower::full();
        let ctx = InplaceContext {
            real_blkdev: Path::new("/nonexistent/real"),
            crypto_blkdev: Path::new("/nonexistent/crypto"),
            props: None,
            power: &power,
        };
        let outcome = encrypt_inplace(&ctx, 100, 50, 200)?;
        assert_eq!(outcome.done_sectors, 150);
        assert!(outcome.completed);
        Ok(())
    }

    #[test]
    fn missing_real_device_is_not_a_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = dir.path().join("crypto");
        File::create(&crypto).unwrap().set_len(4096).unwrap();
        let power = SimPower::full();
        let ctx = InplaceContext {
            real_blkdev: &dir.path().join("missing"),
            crypto_blkdev: &crypto,
            props: None,
            power: &power,
        };
        let err = encrypt_inplace(&ctx, 8, 0, 0).unwrap_err();
        assert_eq!(err.error_code(), -1);
    }
}

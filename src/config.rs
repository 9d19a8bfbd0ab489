//! Per-device configuration for a cryptfs session.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;

use crate::props::{self, Properties};

pub const DATA_MNT_POINT: &str = "/data";
pub const CRYPTO_BLOCK_DEVICE: &str = "userdata";
pub const DEFAULT_DM_CONTROL: &str = "/dev/device-mapper";

/// Where the crypto footer (and with it, the encrypted master key) lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyLocation {
    /// In the last 16 KiB of the real block device
    Footer,

    /// In a separate key file of exactly 16 KiB
    File(PathBuf),
}

/// Parse strings like "footer" or "/path/to/keyfile"
impl FromStr for KeyLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "footer" => Ok(KeyLocation::Footer),
            "" => anyhow::bail!("empty key location"),
            path => Ok(KeyLocation::File(PathBuf::from(path))),
        }
    }
}

/// Everything a [`CryptSession`](crate::cryptfs::CryptSession) needs to know about the device
#[derive(Debug, Clone)]
pub struct CryptConfig {
    /// The block device holding the (encrypted) userdata filesystem
    pub real_blkdev: PathBuf,
    pub key_location: KeyLocation,
    pub fs_type: String,
    pub mount_point: PathBuf,

    /// Name of the dm-crypt mapping exposing the decrypted filesystem
    pub crypto_label: String,

    /// Whether the footer and persistent data may be written back to disk
    pub footer_writes: bool,

    /// Whether in-place encryption of a plaintext device may be started
    pub enable_allowed: bool,

    pub dm_control: PathBuf,
}

impl CryptConfig {
    /// A read-only configuration for `real_blkdev` with everything else defaulted
    pub fn new(real_blkdev: impl Into<PathBuf>, key_location: KeyLocation) -> Self {
        Self {
            real_blkdev: real_blkdev.into(),
            key_location,
            fs_type: "ext4".to_owned(),
            mount_point: PathBuf::from(DATA_MNT_POINT),
            crypto_label: CRYPTO_BLOCK_DEVICE.to_owned(),
            footer_writes: false,
            enable_allowed: false,
            dm_control: PathBuf::from(DEFAULT_DM_CONTROL),
        }
    }

    /// Build a configuration from the `ro.crypto.*` properties
    pub fn from_properties(props: &dyn Properties) -> anyhow::Result<Self> {
        let real_blkdev = props
            .get(props::CRYPTO_REAL_BLKDEV)
            .context("ro.crypto.fs_real_blkdev is not set")?;
        let key_location = props
            .get(props::CRYPTO_KEYFILE)
            .unwrap_or_else(|| "footer".to_owned())
            .parse()?;

        let mut config = Self::new(real_blkdev, key_location);
        if let Some(fs_type) = props.get(props::CRYPTO_FS_TYPE) {
            config.fs_type = fs_type;
        }
        if let Some(mnt) = props.get(props::CRYPTO_MNT_POINT) {
            config.mount_point = PathBuf::from(mnt);
        }
        Ok(config)
    }

    pub fn footer_writes(mut self, enabled: bool) -> Self {
        self.footer_writes = enabled;
        self
    }

    pub fn enable_allowed(mut self, allowed: bool) -> Self {
        self.enable_allowed = allowed;
        self
    }
}

//! Setting up and tearing down the dm-crypt mapping that exposes the decrypted filesystem.

#[cfg(target_os = "linux")]
pub mod control;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, ensure, Context};
use log::{info, warn};
use zeroize::Zeroizing;

use crate::blockdev::CRYPT_SECTOR_SIZE;
use crate::footer::CryptFooter;

/// Table parameter enabling TRIM passthrough on new enough crypt targets
pub const ALLOW_DISCARDS: &str = "1 allow_discards";

/// A single `crypt` target spanning a whole device
pub struct CryptTarget {
    /// Cipher spec, e.g. `aes-cbc-essiv:sha256`
    pub cipher: String,
    key_hex: Zeroizing<String>,
    pub real_blkdev: PathBuf,

    /// Length of the mapping in 512-byte sectors
    pub length: u64,

    /// Optional parameters, appended after the mandatory ones
    pub extra_params: String,
}

impl CryptTarget {
    pub fn new(ftr: &CryptFooter, master_key: &[u8], real_blkdev: &Path) -> Self {
        Self {
            cipher: ftr.crypto_type_name.clone(),
            key_hex: Zeroizing::new(hex::encode_upper(master_key)),
            real_blkdev: real_blkdev.to_owned(),
            length: ftr.fs_size,
            extra_params: String::new(),
        }
    }

    pub fn extra_params(mut self, extra: &str) -> Self {
        self.extra_params = extra.to_owned();
        self
    }

    /// The table line: `<cipher> <key> <iv_offset> <device> <offset>[ <opt_params>]`
    pub fn params(&self) -> Zeroizing<String> {
        let mut params = Zeroizing::new(format!(
            "{} {} 0 {} 0",
            self.cipher,
            self.key_hex.as_str(),
            self.real_blkdev.display()
        ));
        if !self.extra_params.is_empty() {
            params.push(' ');
            params.push_str(&self.extra_params);
        }
        params
    }
}

/// The kernel's device-mapper, as far as cryptfs needs it
pub trait DeviceMapper {
    /// Version of the loaded `crypt` target, if it is loaded
    fn crypt_target_version(&self) -> anyhow::Result<Option<[u32; 3]>>;

    /// Create and activate a mapping called `name`, returning its block device node
    fn create_crypto_dev(&self, name: &str, target: &CryptTarget) -> anyhow::Result<PathBuf>;

    /// Remove the mapping called `name`
    fn delete_crypto_dev(&self, name: &str) -> anyhow::Result<()>;
}

/// Can this version of the crypt target pass discards through?
pub fn supports_discards(version: [u32; 3]) -> bool {
    let [major, minor, _] = version;
    major >= 2 || (major == 1 && minor >= 11)
}

/// Map `real_blkdev` through dm-crypt with `master_key`, using the footer's cipher and size
pub fn create_crypto_blk_dev(
    dm: &dyn DeviceMapper,
    ftr: &CryptFooter,
    master_key: &[u8],
    real_blkdev: &Path,
    name: &str,
) -> anyhow::Result<PathBuf> {
    let mut target = CryptTarget::new(ftr, master_key, real_blkdev);

    match dm.crypt_target_version() {
        Ok(Some(version)) if supports_discards(version) => {
            info!("Enabling support for allow_discards in dmcrypt.");
            target = target.extra_params(ALLOW_DISCARDS);
        }
        Ok(_) => (),
        Err(e) => warn!("cannot query dm-crypt version: {e:#}"),
    }

    dm.create_crypto_dev(name, &target)
        .with_context(|| format!("cannot create crypto device {name}"))
}

pub fn delete_crypto_blk_dev(dm: &dyn DeviceMapper, name: &str) -> anyhow::Result<()> {
    dm.delete_crypto_dev(name)
        .with_context(|| format!("cannot remove crypto device {name}"))
}

/// A simulated device-mapper, for testing purposes
///
/// Each mapping is backed by a regular file named after it, standing in for the decrypted view
/// of the real device. Files outlive the mappings, the way data written through dm-crypt
/// outlives the mapping on a real device. Clones share state.
#[derive(Debug, Clone)]
pub struct SimDeviceMapper {
    dir: PathBuf,
    crypt_version: Option<[u32; 3]>,
    active: Rc<RefCell<BTreeMap<String, String>>>,
}

impl SimDeviceMapper {
    /// Keep backing files for mappings in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            crypt_version: Some([1, 11, 0]),
            active: Default::default(),
        }
    }

    pub fn crypt_version(mut self, version: Option<[u32; 3]>) -> Self {
        self.crypt_version = version;
        self
    }

    /// Where the mapping called `name` is (or would be) exposed
    pub fn device_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("dm-{name}"))
    }

    /// The table of an active mapping
    pub fn table(&self, name: &str) -> Option<String> {
        self.active.borrow().get(name).cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.borrow().contains_key(name)
    }
}

impl DeviceMapper for SimDeviceMapper {
    fn crypt_target_version(&self) -> anyhow::Result<Option<[u32; 3]>> {
        Ok(self.crypt_version)
    }

    fn create_crypto_dev(&self, name: &str, target: &CryptTarget) -> anyhow::Result<PathBuf> {
        ensure!(!self.is_active(name), "device {name} already exists");
        ensure!(
            target.real_blkdev.exists(),
            "{} does not exist",
            target.real_blkdev.display()
        );

        let path = self.device_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = target.length * CRYPT_SECTOR_SIZE;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }

        self.active
            .borrow_mut()
            .insert(name.to_owned(), target.params().to_string());
        Ok(path)
    }

    fn delete_crypto_dev(&self, name: &str) -> anyhow::Result<()> {
        if self.active.borrow_mut().remove(name).is_none() {
            bail!("no such device {name}");
        }
        Ok(())
    }
}

//! Access to Android system properties.
//!
//! Recovery has no property service of its own that we can link against, so properties are
//! modelled as a trait. The in-memory implementation can be seeded from a `build.prop`-style
//! file, which is also how the command-line tool receives the device's configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;

pub const CRYPTO_STATE: &str = "ro.crypto.state";
pub const CRYPTO_FS_TYPE: &str = "ro.crypto.fs_type";
pub const CRYPTO_REAL_BLKDEV: &str = "ro.crypto.fs_real_blkdev";
pub const CRYPTO_MNT_POINT: &str = "ro.crypto.fs_mnt_point";
pub const CRYPTO_FS_OPTIONS: &str = "ro.crypto.fs_options";
pub const CRYPTO_FS_FLAGS: &str = "ro.crypto.fs_flags";
pub const CRYPTO_KEYFILE: &str = "ro.crypto.keyfile.userdata";
pub const CRYPTO_SCRYPT_PARAMS: &str = "ro.crypto.scrypt_params";
pub const CRYPTO_BLKDEV: &str = "ro.crypto.fs_crypto_blkdev";
pub const ENCRYPT_PROGRESS: &str = "vold.encrypt_progress";
pub const ENCRYPT_TIME_REMAINING: &str = "vold.encrypt_time_remaining";

/// A string key/value property store
pub trait Properties {
    /// Look up a property; unset properties are `None`
    fn get(&self, key: &str) -> Option<String>;

    /// Set (or overwrite) a property
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Is the userdata partition marked as encrypted?
    fn is_encrypted(&self) -> bool {
        self.get(CRYPTO_STATE).as_deref() == Some("encrypted")
    }
}

/// A property store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryProperties {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, for seeding a store
    pub fn with(self, key: &str, value: &str) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_owned(), value.to_owned());
        }
        self
    }

    /// Load `key=value` lines from a property file, ignoring blanks and `#` comments
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
        self.load_str(&text)
    }

    pub fn load_str(&self, text: &str) -> anyhow::Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(anyhow::anyhow!("malformed property line `{line}`"))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }
}

impl Properties for MemoryProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("property store poisoned"))?;
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Shared stores, so a caller can keep watching properties a session sets
impl<P: Properties + ?Sized> Properties for Arc<P> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        (**self).set(key, value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_property_text() -> anyhow::Result<()> {
        let props = MemoryProperties::new();
        props.load_str(
            "# device config\n\
             ro.crypto.state=encrypted\n\
             \n\
             ro.crypto.scrypt_params = 15:3:1\n",
        )?;

        assert!(props.is_encrypted());
        assert_eq!(props.get(CRYPTO_SCRYPT_PARAMS).as_deref(), Some("15:3:1"));
        assert_eq!(props.get(CRYPTO_FS_TYPE), None);
        assert!(props.load_str("no equals sign").is_err());
        Ok(())
    }

    #[test]
    fn unencrypted_by_default() {
        let props = MemoryProperties::new().with(CRYPTO_STATE, "unencrypted");
        assert!(!props.is_encrypted());
    }
}

//! Unlocking with a password, and changing it.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::{default_password, CryptSession};
use crate::crypto;
use crate::dm;
use crate::error::CryptfsError;
use crate::footer::{CryptFooter, CryptType, CRYPT_MNT_KEY_UNENCRYPTED};
use crate::kdf::KdfType;
use crate::props;

/// Re-encode an old-style pattern password
///
/// Patterns used to be stored as the dot indices 0 to 8, each hex-encoded as `0` and a digit.
/// Newer ones use the characters '1' to '9', which hex-encode as `3` and a digit. `None` if
/// `passwd` is not an old-style pattern.
pub fn adjust_passwd(passwd: &str) -> Option<Zeroizing<String>> {
    let bytes = passwd.as_bytes();
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return None;
    }

    let mut adjusted = Zeroizing::new(String::with_capacity(bytes.len()));
    for pair in bytes.chunks_exact(2) {
        match pair {
            [b'0', digit @ b'0'..=b'8'] => {
                adjusted.push('3');
                adjusted.push(char::from(digit + 1));
            }
            _ => return None,
        }
    }
    Some(adjusted)
}

/// Why a single password candidate did not unlock the device
enum Attempt {
    /// The password decrypted to the wrong key
    Mismatch,
    Failed(anyhow::Error),
}

impl CryptSession {
    /// Try to unlock the device with `passwd`
    ///
    /// Returns 0 once unlocked, or the number of failed attempts recorded in the footer. Besides
    /// the password as given, an old-style pattern encoding and the hex encoding of the ASCII
    /// text are tried.
    pub fn check_passwd(&mut self, passwd: &str) -> Result<u32, CryptfsError> {
        if !self.props.is_encrypted() {
            warn!("check_passwd called on an unencrypted device");
        }
        if self.master_key.is_some() {
            warn!("check_passwd called while already unlocked");
        }

        let mut ftr = self.read_footer_and_upgrade()?;

        let mut candidates: Vec<Zeroizing<String>> = Vec::with_capacity(3);
        if let Some(adjusted) = adjust_passwd(passwd) {
            candidates.push(adjusted);
        }
        candidates.push(Zeroizing::new(passwd.to_owned()));
        candidates.push(Zeroizing::new(hex::encode(passwd)));

        let mut mismatched = false;
        let mut last_error = None;
        for candidate in &candidates {
            match self.test_mount(&mut ftr, candidate) {
                Ok(()) => {
                    if ftr.crypt_type != u32::from(CryptType::Default) {
                        self.remember_password(candidate);
                    }
                    return Ok(0);
                }
                Err(Attempt::Mismatch) => mismatched = true,
                Err(Attempt::Failed(e)) => {
                    debug!("Password candidate rejected: {e:#}");
                    last_error = Some(e);
                }
            }
        }

        if !mismatched {
            return Err(last_error
                .unwrap_or(anyhow::anyhow!("no password candidates"))
                .into());
        }

        ftr.failed_decrypt_count += 1;
        if let Err(e) = self.write_footer(&ftr) {
            warn!("Cannot record failed decrypt attempt: {e}");
        }
        error!("Password did not match, {} failed attempts", ftr.failed_decrypt_count);
        Ok(ftr.failed_decrypt_count)
    }

    /// Does any of `fs_type`, ext4 or f2fs mount from `source`?
    fn try_mount_multiple_fs(&self, source: &Path) -> bool {
        let target = self.config.mount_point.join("tmp_mnt");
        let mut fs_types = vec![self.config.fs_type.as_str()];
        for fs in ["ext4", "f2fs"] {
            if !fs_types.contains(&fs) {
                fs_types.push(fs);
            }
        }

        for fs_type in fs_types {
            match self.mounter.mount(source, &target, fs_type) {
                Ok(()) => {
                    info!("Mounted {} as {fs_type}", source.display());
                    if let Err(e) = self.mounter.unmount(&target) {
                        warn!("Cannot unmount {}: {e:#}", target.display());
                    }
                    return true;
                }
                Err(e) => debug!("{fs_type} mount failed: {e:#}"),
            }
        }
        false
    }

    /// Map the device with the key `passwd` unlocks, and check that it is the right one
    fn test_mount(&mut self, ftr: &mut CryptFooter, passwd: &str) -> Result<(), Attempt> {
        let unencrypted_key = ftr.has_flag(CRYPT_MNT_KEY_UNENCRYPTED);
        let (master_key, verified) = if unencrypted_key {
            info!("Master key is not encrypted");
            (Zeroizing::new(ftr.key().to_vec()), true)
        } else {
            let (key, ikey) = crypto::decrypt_master_key(passwd, ftr, self.keymaster.as_ref())
                .map_err(Attempt::Failed)?;
            let verified = crypto::verify_intermediate_key(&ikey[..], ftr).map_err(Attempt::Failed)?;
            (key, verified)
        };

        let label = self.config.crypto_label.clone();
        let crypto_blkdev = dm::create_crypto_blk_dev(
            self.dm.as_ref(),
            ftr,
            &master_key,
            &self.config.real_blkdev,
            &label,
        )
        .map_err(Attempt::Failed)?;

        if verified {
            info!("Password matches");
        } else if self.try_mount_multiple_fs(&crypto_blkdev) {
            info!("Password verifier did not match, but the filesystem mounts");
        } else {
            if let Err(e) = dm::delete_crypto_blk_dev(self.dm.as_ref(), &label) {
                warn!("{e:#}");
            }
            return Err(Attempt::Mismatch);
        }

        if ftr.failed_decrypt_count != 0 {
            ftr.failed_decrypt_count = 0;
            if let Err(e) = self.write_footer(ftr) {
                warn!("Cannot reset failed decrypt count: {e}");
            }
        }

        if let Err(e) = self
            .props
            .set(props::CRYPTO_BLKDEV, &crypto_blkdev.display().to_string())
        {
            warn!("{e:#}");
        }
        self.master_key = Some(master_key);
        self.mount_point = Some(self.config.mount_point.clone());

        if !unencrypted_key {
            self.upgrade_kdf(ftr, passwd);
        }
        Ok(())
    }

    /// Rewrap the master key with the strongest KDF available
    fn upgrade_kdf(&self, ftr: &mut CryptFooter, passwd: &str) {
        let Ok(kdf) = ftr.kdf() else {
            return;
        };
        let target = match kdf {
            KdfType::ScryptKeymaster => return,
            _ if self.keymaster.is_compatible() => KdfType::ScryptKeymaster,
            KdfType::Scrypt => return,
            _ => KdfType::Scrypt,
        };
        let Some(key) = self.master_key.as_ref() else {
            return;
        };

        info!("Upgrading KDF from {kdf:?} to {target:?}");
        let old = ftr.clone();
        ftr.kdf_type = target.into();
        let result = crypto::encrypt_master_key(
            passwd,
            key,
            ftr,
            self.scrypt_params(),
            self.keymaster.as_ref(),
        )
        .map_err(CryptfsError::from)
        .and_then(|()| self.write_footer(ftr));
        if let Err(e) = result {
            warn!("KDF upgrade failed, keeping {kdf:?}: {e:#}");
            *ftr = old;
        }
    }

    /// Is `passwd` the password of the device unlocked in this session?
    pub fn verify_passwd(&self, passwd: &str) -> Result<bool, CryptfsError> {
        if !self.props.is_encrypted() {
            return Err(CryptfsError::NotEncrypted);
        }
        let saved = self.master_key.as_ref().ok_or(CryptfsError::KeyNotSaved)?;
        if self.mount_point.is_none() {
            return Err(CryptfsError::NoMountPoint);
        }

        let ftr = self.read_footer_and_upgrade()?;
        if ftr.has_flag(CRYPT_MNT_KEY_UNENCRYPTED) {
            return Ok(true);
        }

        let matches = match crypto::decrypt_master_key(passwd, &ftr, self.keymaster.as_ref()) {
            Ok((key, _)) => {
                let len = (ftr.keysize as usize).min(key.len()).min(saved.len());
                key[..len] == saved[..len]
            }
            Err(e) => {
                debug!("Cannot decrypt master key: {e:#}");
                false
            }
        };
        if !matches {
            // Slow down brute force attempts
            thread::sleep(Duration::from_secs(1));
        }
        Ok(matches)
    }

    /// Protect the master key unlocked in this session with a new password
    ///
    /// With [`CryptType::Default`] the new password is ignored in favour of the default one.
    pub fn changepw(&mut self, crypt_type: u32, new_passwd: &str) -> Result<(), CryptfsError> {
        let crypt_type =
            CryptType::try_from(crypt_type).map_err(|_| CryptfsError::BadCryptType(crypt_type))?;
        let key = self.master_key.clone().ok_or(CryptfsError::KeyNotSaved)?;

        let mut ftr = self.read_footer_and_upgrade()?;
        ftr.crypt_type = crypt_type.into();
        let passwd = match crypt_type {
            CryptType::Default => default_password(),
            _ => Zeroizing::new(new_passwd.to_owned()),
        };

        crypto::encrypt_master_key(
            &passwd,
            &key,
            &mut ftr,
            self.scrypt_params(),
            self.keymaster.as_ref(),
        )
        .context("Cannot wrap the master key with the new password")?;
        self.write_footer(&ftr)?;
        info!("Changed password type to {crypt_type:?}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cryptfs::test::Fixture;
    use crate::dm::DeviceMapper;
    use crate::kdf::SimKeymaster;
    use crate::platform::SimMounter;
    use crate::props::Properties;

    #[test]
    fn pattern_adjustment() {
        assert_eq!(adjust_passwd("000102").as_deref().map(String::as_str), Some("313233"));
        assert_eq!(adjust_passwd("0008").as_deref().map(String::as_str), Some("3139"));
        assert!(adjust_passwd("0009").is_none());
        assert!(adjust_passwd("313233").is_none());
        assert!(adjust_passwd("000").is_none());
        assert!(adjust_passwd("").is_none());
    }

    #[test]
    fn unlock_with_right_password() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let key = fx.encrypted_footer("31323334")?;
        let mut session = fx.session();

        // The ASCII text is hex-encoded before trying it
        assert_eq!(session.check_passwd("1234")?, 0);
        assert!(session.is_unlocked());
        assert_eq!(session.master_key.as_deref().map(Vec::as_slice), Some(&key[..]));
        assert!(fx.dm.is_active("userdata"));
        assert_eq!(
            fx.props.get(props::CRYPTO_BLKDEV),
            Some(fx.dm.device_path("userdata").display().to_string())
        );
        assert_eq!(session.get_password(), Some("31323334"));
        // "1234" itself is valid hex, so it was tried (and mount-checked) first
        assert_eq!(fx.mounter.attempts().len(), 2);
        Ok(())
    }

    #[test]
    fn wrong_password_counts_failures() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("31323334")?;

        let mut session = fx.session();
        assert_eq!(session.check_passwd("35353535")?, 1);
        assert!(!session.is_unlocked());
        assert_eq!(session.get_password(), None);
        assert!(!fx.dm.is_active("userdata"));
        assert_eq!(session.check_passwd("35353535")?, 2);

        // Every candidate fell back to ext4 then f2fs
        let fs_types: Vec<String> = fx.mounter.attempts().into_iter().map(|(_, fs)| fs).collect();
        assert_eq!(fs_types.len(), 8);
        assert_eq!(&fs_types[..2], ["ext4", "f2fs"]);

        // Unlocking resets the count
        assert_eq!(session.check_passwd("31323334")?, 0);
        assert_eq!(session.read_footer_and_upgrade()?.failed_decrypt_count, 0);
        Ok(())
    }

    #[test]
    fn mountable_filesystem_overrides_verifier() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("31323334")?;

        // Scribble over the verifier, as footers from before it existed look
        let session = fx.session();
        let mut ftr = session.read_footer_and_upgrade()?;
        ftr.scrypted_intermediate_key = [0; 32];
        session.write_footer(&ftr)?;

        let mounter = SimMounter::new().accept(fx.dm.device_path("userdata"), "f2fs");
        let mut session = fx.session().mounter(Box::new(mounter.clone()));
        assert_eq!(session.check_passwd("31323334")?, 0);
        assert!(mounter.mounted().is_empty());
        assert_eq!(
            mounter.attempts().last().map(|(_, fs)| fs.as_str()),
            Some("f2fs")
        );
        Ok(())
    }

    #[test]
    fn old_pattern_encoding() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        // Pattern 1-2-3 stored with the new encoding
        fx.encrypted_footer("313233")?;
        let mut session = fx.session();
        assert_eq!(session.check_passwd("000102")?, 0);
        assert_eq!(session.get_password(), Some("313233"));
        Ok(())
    }

    #[test]
    fn unencrypted_master_key() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let session = fx.session();
        let mut ftr = session.init_footer();
        ftr.fs_size = 512;
        ftr.set_flag(CRYPT_MNT_KEY_UNENCRYPTED);
        ftr.master_key[..16].copy_from_slice(&[0x5A; 16]);
        session.write_footer(&ftr)?;
        fx.props.set(props::CRYPTO_STATE, "encrypted")?;

        let mut session = fx.session();
        assert_eq!(session.check_passwd("anything")?, 0);
        assert_eq!(session.master_key.as_deref().map(Vec::as_slice), Some(&[0x5A; 16][..]));
        assert!(session.verify_passwd("something else")?);
        Ok(())
    }

    #[test]
    fn verify_after_unlock() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("31323334")?;
        let mut session = fx.session();
        assert!(matches!(
            session.verify_passwd("31323334"),
            Err(CryptfsError::KeyNotSaved)
        ));

        session.check_passwd("31323334")?;
        assert!(session.verify_passwd("31323334")?);
        assert!(!session.verify_passwd("35353535")?);

        fx.props.set(props::CRYPTO_STATE, "unencrypted")?;
        let err = session.verify_passwd("31323334").unwrap_err();
        assert_eq!(err.error_code(), -2);
        Ok(())
    }

    #[test]
    fn change_password() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let key = fx.encrypted_footer("31323334")?;

        let mut session = fx.session();
        assert!(matches!(
            session.changepw(0, "35353535"),
            Err(CryptfsError::KeyNotSaved)
        ));
        session.check_passwd("31323334")?;
        assert!(matches!(
            session.changepw(4, "35353535"),
            Err(CryptfsError::BadCryptType(4))
        ));
        session.changepw(CryptType::Pin.into(), "35353535")?;
        fx.dm.delete_crypto_dev("userdata")?;

        let mut session = fx.session();
        assert_eq!(session.get_password_type()?, Some(CryptType::Pin));
        assert_eq!(session.check_passwd("31323334")?, 1);
        assert_eq!(session.check_passwd("35353535")?, 0);
        assert_eq!(session.master_key.as_deref().map(Vec::as_slice), Some(&key[..]));

        // The default password is not remembered
        session.changepw(CryptType::Default.into(), "ignored")?;
        fx.dm.delete_crypto_dev("userdata")?;
        let mut session = fx.session();
        assert_eq!(session.check_passwd(crate::cryptfs::DEFAULT_PASSWORD)?, 0);
        assert_eq!(session.get_password(), None);
        assert_eq!(&session.get_master_key("")?[..], &key[..]);
        Ok(())
    }

    #[test]
    fn kdf_upgrades_to_keymaster() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("31323334")?;
        let keymaster = SimKeymaster::new([7; 32]);

        let mut session = fx.session().keymaster(Box::new(keymaster.clone()));
        assert_eq!(session.check_passwd("31323334")?, 0);
        let ftr = session.read_footer_and_upgrade()?;
        assert_eq!(ftr.kdf()?, KdfType::ScryptKeymaster);
        assert!(!ftr.keymaster_blob.is_empty());

        fx.dm.delete_crypto_dev("userdata")?;
        let mut session = fx.session().keymaster(Box::new(keymaster));
        assert_eq!(session.check_passwd("31323334")?, 0);
        Ok(())
    }
}

//! Turning on encryption of a plaintext device, in place.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use log::{error, info, warn};
use zeroize::Zeroizing;

use super::{default_password, CryptSession};
use crate::blockdev::{self, CRYPT_SECTOR_SIZE};
use crate::crypto;
use crate::dm;
use crate::error::CryptfsError;
use crate::footer::{
    CryptFooter, CryptType, CRYPT_ENCRYPTION_IN_PROGRESS, CRYPT_FOOTER_OFFSET,
    CRYPT_INCONSISTENT_STATE,
};
use crate::inplace::{self, ext4::Ext4Info, f2fs::F2fsInfo, InplaceContext};
use crate::persist::{self, PersistData};
use crate::platform::{self, BATTERY_START_PERCENT};
use crate::props;

/// Size of the ext4 or f2fs filesystem on `path` in sectors, if there is one
fn filesystem_sectors(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    // A size too large to represent still overlaps the footer
    if let Ok(info) = Ext4Info::read(&file) {
        let bytes = info.blocks_count.checked_mul(info.block_size);
        return Some(bytes.map_or(u64::MAX, |b| b / CRYPT_SECTOR_SIZE));
    }
    if let Ok(info) = F2fsInfo::read(&file) {
        let bytes = info.block_count.checked_mul(inplace::f2fs::F2FS_BLKSIZE as u64);
        return Some(bytes.map_or(u64::MAX, |b| b / CRYPT_SECTOR_SIZE));
    }
    None
}

impl CryptSession {
    /// Encrypt the device with the default password
    pub fn enable_default(&mut self) -> Result<(), CryptfsError> {
        self.enable(CryptType::Default.into(), "")
    }

    /// Encrypt the device in place, protecting a new master key with `passwd`
    ///
    /// If an earlier run was interrupted, it is picked up where it stopped; `passwd` must then
    /// be the password that run used. A run stopped early by a low battery is not an error: the
    /// footer records how far it got.
    pub fn enable(&mut self, crypt_type: u32, passwd: &str) -> Result<(), CryptfsError> {
        if !self.config.enable_allowed {
            return Err(CryptfsError::EnableDisabled);
        }
        if !self.config.footer_writes {
            return Err(CryptfsError::FooterWritesDisabled);
        }
        let crypt_type =
            CryptType::try_from(crypt_type).map_err(|_| CryptfsError::BadCryptType(crypt_type))?;
        let passwd = match crypt_type {
            CryptType::Default => default_password(),
            _ => Zeroizing::new(passwd.to_owned()),
        };

        if !platform::battery_ok(self.power.as_ref(), BATTERY_START_PERCENT) {
            return Err(anyhow::anyhow!("Not enough battery to start encryption").into());
        }

        let resumed = self.take_over_interrupted_run(&passwd)?;
        if resumed.is_none() && self.props.is_encrypted() {
            return Err(anyhow::anyhow!("Device is already running encrypted, aborting").into());
        }

        let real_blkdev = self.config.real_blkdev.clone();
        let nr_sec = blockdev::path_size_in_sectors(&real_blkdev)?;
        let max_fs_sectors = if self.store.is_key_file() {
            nr_sec
        } else {
            let max = nr_sec
                .checked_sub(CRYPT_FOOTER_OFFSET / CRYPT_SECTOR_SIZE)
                .ok_or(anyhow::anyhow!("{} is too small", real_blkdev.display()))?;
            if let Some(fs_sectors) = filesystem_sectors(&real_blkdev) {
                if fs_sectors > max {
                    error!("Filesystem of {fs_sectors} sectors overlaps the crypto footer at {max}");
                    return Err(anyhow::anyhow!("filesystem overlaps the crypto footer").into());
                }
            }
            max
        };

        let (mut ftr, previously_encrypted_upto) = match resumed {
            Some(resumed) => resumed,
            None => (self.write_new_footer(crypt_type, &passwd, max_fs_sectors)?, 0),
        };

        let (master_key, _) = crypto::decrypt_master_key(&passwd, &ftr, self.keymaster.as_ref())
            .context("Failed to decrypt master key")?;
        let label = self.config.crypto_label.clone();
        let crypto_blkdev = dm::create_crypto_blk_dev(
            self.dm.as_ref(),
            &ftr,
            &master_key,
            &real_blkdev,
            &label,
        )?;

        let result = self.encrypt_mapped(&mut ftr, &crypto_blkdev, previously_encrypted_upto);
        if let Err(e) = dm::delete_crypto_blk_dev(self.dm.as_ref(), &label) {
            warn!("{e:#}");
        }
        let completed = result?;

        ftr.clear_flag(CRYPT_INCONSISTENT_STATE);
        self.write_footer(&ftr)?;

        if completed {
            info!("Encryption of {} complete", real_blkdev.display());
            self.props.set(props::ENCRYPT_PROGRESS, "100")?;
            if self.props.get(props::CRYPTO_STATE).is_none() {
                self.props.set(props::CRYPTO_STATE, "encrypted")?;
            }
        } else {
            info!("Encryption stopped at sector {}", ftr.encrypted_upto);
        }
        Ok(())
    }

    /// If an earlier run stopped early, mark the footer inconsistent and return it with the
    /// sector that run reached
    ///
    /// The footer is left alone unless `passwd` unlocks the key the earlier run used.
    fn take_over_interrupted_run(
        &self,
        passwd: &str,
    ) -> Result<Option<(CryptFooter, u64)>, CryptfsError> {
        let Ok(mut ftr) = self.read_footer_and_upgrade() else {
            return Ok(None);
        };
        if !ftr.has_flag(CRYPT_ENCRYPTION_IN_PROGRESS) {
            return Ok(None);
        }

        let (_, ikey) = crypto::decrypt_master_key(passwd, &ftr, self.keymaster.as_ref())
            .context("Can't calculate intermediate key")?;
        if !crypto::verify_intermediate_key(&ikey[..], &ftr)? {
            error!("Password does not match the interrupted run's key, not resuming");
            return Err(anyhow::anyhow!("Password does not match the crypto footer").into());
        }

        let upto = ftr.encrypted_upto;
        info!("Previous encryption stopped at sector {upto}, resuming");
        ftr.encrypted_upto = 0;
        ftr.clear_flag(CRYPT_ENCRYPTION_IN_PROGRESS);
        ftr.set_flag(CRYPT_INCONSISTENT_STATE);
        self.write_footer(&ftr)?;
        Ok(Some((ftr, upto)))
    }

    fn write_new_footer(
        &mut self,
        crypt_type: CryptType,
        passwd: &str,
        fs_size: u64,
    ) -> Result<CryptFooter, CryptfsError> {
        let mut ftr = self.init_footer();
        ftr.fs_size = fs_size;
        ftr.crypt_type = crypt_type.into();
        ftr.set_flag(CRYPT_INCONSISTENT_STATE);
        crypto::create_encrypted_random_key(
            passwd,
            &mut ftr,
            self.scrypt_params(),
            self.keymaster.as_ref(),
        )
        .context("Cannot create encrypted master key")?;

        self.write_footer(&ftr)?;
        persist::init_region(&ftr, self.store.path())
            .context("Cannot initialize persistent data")?;
        self.persist = Some(PersistData::new(ftr.persist_data_size));
        Ok(ftr)
    }

    /// Run the in-place engine over the mapped device; true if it got to the end
    fn encrypt_mapped(
        &self,
        ftr: &mut CryptFooter,
        crypto_blkdev: &Path,
        previously_encrypted_upto: u64,
    ) -> Result<bool, CryptfsError> {
        if previously_encrypted_upto > 0 {
            let hash = blockdev::hash_first_block(crypto_blkdev)?;
            if hash != ftr.hash_first_block {
                error!("Checksums do not match, not resuming encryption");
                if let Err(e) = self
                    .props
                    .set(props::ENCRYPT_PROGRESS, "error_partially_encrypted")
                {
                    warn!("{e:#}");
                }
                return Err(CryptfsError::ResumeRefused);
            }
        }

        let ctx = InplaceContext {
            real_blkdev: &self.config.real_blkdev,
            crypto_blkdev,
            props: Some(self.props.as_ref()),
            power: self.power.as_ref(),
        };
        let outcome = inplace::encrypt_inplace(&ctx, ftr.fs_size, 0, previously_encrypted_upto)
            .map_err(|e| anyhow::Error::new(e).context("In-place encryption failed"))?;

        ftr.encrypted_upto = outcome.done_sectors;
        if !outcome.completed {
            ftr.hash_first_block = blockdev::hash_first_block(crypto_blkdev)?;
            ftr.set_flag(CRYPT_ENCRYPTION_IN_PROGRESS);
        }
        Ok(outcome.completed)
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::FileExt;

    use super::*;
    use crate::config::{CryptConfig, KeyLocation};
    use crate::cryptfs::test::{Fixture, DEVICE_SECTORS};
    use crate::cryptfs::{CryptoComplete, DEFAULT_PASSWORD};
    use crate::platform::SimPower;
    use crate::props::Properties;

    const FS_SECTORS: u64 = DEVICE_SECTORS - 32;

    fn encrypted_prefix_matches(fx: &Fixture) -> anyhow::Result<bool> {
        let real = std::fs::read(&fx.real)?;
        let crypto = std::fs::read(fx.dm.device_path("userdata"))?;
        Ok(crypto[..] == real[..(FS_SECTORS * 512) as usize])
    }

    #[test]
    fn needs_permission() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let read_only = CryptConfig::new(&fx.real, KeyLocation::Footer).enable_allowed(true);
        assert!(matches!(
            fx.session_with(read_only).enable_default(),
            Err(CryptfsError::FooterWritesDisabled)
        ));
        let no_enable = fx.config().enable_allowed(false);
        assert!(matches!(
            fx.session_with(no_enable).enable_default(),
            Err(CryptfsError::EnableDisabled)
        ));
        assert!(matches!(
            fx.session().enable(7, "31323334"),
            Err(CryptfsError::BadCryptType(7))
        ));
        Ok(())
    }

    #[test]
    fn enable_default_then_unlock() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.session().enable_default()?;

        assert!(encrypted_prefix_matches(&fx)?);
        assert!(!fx.dm.is_active("userdata"));
        assert_eq!(fx.props.get(props::ENCRYPT_PROGRESS).as_deref(), Some("100"));
        assert!(fx.props.is_encrypted());

        let mut session = fx.session();
        assert_eq!(session.crypto_complete(), CryptoComplete::Encrypted);
        assert_eq!(session.get_password_type()?, Some(CryptType::Default));
        let ftr = session.read_footer_and_upgrade()?;
        assert_eq!(ftr.fs_size, FS_SECTORS);
        assert_eq!(ftr.encrypted_upto, FS_SECTORS);

        assert_eq!(session.check_passwd(DEFAULT_PASSWORD)?, 0);
        assert_eq!(session.get_password(), None);

        // The persistent field table starts out empty but usable
        session.setfield("wrapped", "1")?;
        assert_eq!(fx.session().getfield("wrapped", 16)?, "1");
        Ok(())
    }

    #[test]
    fn already_encrypted() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("31323334")?;
        assert!(fx.session().enable(0, "31323334").is_err());
        Ok(())
    }

    #[test]
    fn low_battery_refuses_to_start() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.power = SimPower::dying_after(0);
        assert!(fx.session().enable(0, "31323334").is_err());
        assert!(fx.session().read_footer_and_upgrade().is_err());
        Ok(())
    }

    #[test]
    fn filesystem_overlapping_footer() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        crate::inplace::ext4::test::format(&fx.real)?;
        // Claim 300 KiB, past the footer at 256 KiB
        let file = std::fs::OpenOptions::new().write(true).open(&fx.real)?;
        file.write_all_at(&300u32.to_le_bytes(), 1024 + 4)?;
        drop(file);

        assert!(fx.session().enable(0, "31323334").is_err());
        assert!(fx.session().read_footer_and_upgrade().is_err());
        Ok(())
    }

    #[test]
    fn interrupted_then_resumed() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        // The starting check and two blocks, then the battery dies
        fx.power = SimPower::dying_after(3);
        fx.session().enable(CryptType::Pin.into(), "31323334")?;

        let ftr = fx.session().read_footer_and_upgrade()?;
        assert!(ftr.has_flag(CRYPT_ENCRYPTION_IN_PROGRESS));
        assert!(!ftr.has_flag(CRYPT_INCONSISTENT_STATE));
        assert_eq!(ftr.encrypted_upto, 24);
        assert!(!fx.props.is_encrypted());
        assert!(!fx.dm.is_active("userdata"));

        fx.power.recharge();
        fx.session().enable(CryptType::Pin.into(), "31323334")?;

        let ftr = fx.session().read_footer_and_upgrade()?;
        assert!(!ftr.has_flag(CRYPT_ENCRYPTION_IN_PROGRESS));
        assert!(!ftr.has_flag(CRYPT_INCONSISTENT_STATE));
        assert_eq!(ftr.encrypted_upto, FS_SECTORS);
        assert!(encrypted_prefix_matches(&fx)?);
        assert!(fx.props.is_encrypted());
        assert_eq!(fx.session().check_passwd("31323334")?, 0);
        Ok(())
    }

    #[test]
    fn resume_needs_the_same_password() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.power = SimPower::dying_after(3);
        fx.session().enable(CryptType::Pin.into(), "31323334")?;

        fx.power.recharge();
        assert!(fx.session().enable(CryptType::Pin.into(), "35353535").is_err());
        assert!(!fx.dm.is_active("userdata"));

        // The interrupted run is still there to pick up
        let ftr = fx.session().read_footer_and_upgrade()?;
        assert!(ftr.has_flag(CRYPT_ENCRYPTION_IN_PROGRESS));
        assert_eq!(ftr.encrypted_upto, 24);

        fx.session().enable(CryptType::Pin.into(), "31323334")?;
        assert!(encrypted_prefix_matches(&fx)?);
        assert_eq!(fx.session().check_passwd("31323334")?, 0);
        Ok(())
    }

    #[test]
    fn resume_refused_when_first_block_changed() -> anyhow::Result<()> {
        let mut fx = Fixture::new()?;
        fx.power = SimPower::dying_after(3);
        fx.session().enable(0, "31323334")?;

        let crypto = std::fs::OpenOptions::new()
            .write(true)
            .open(fx.dm.device_path("userdata"))?;
        crypto.write_all_at(&[0u8; 4096], 0)?;
        drop(crypto);

        fx.power.recharge();
        assert!(matches!(
            fx.session().enable(0, "31323334"),
            Err(CryptfsError::ResumeRefused)
        ));
        assert_eq!(
            fx.props.get(props::ENCRYPT_PROGRESS).as_deref(),
            Some("error_partially_encrypted")
        );
        assert!(!fx.dm.is_active("userdata"));
        let ftr = fx.session().read_footer_and_upgrade()?;
        assert!(ftr.has_flag(CRYPT_INCONSISTENT_STATE));
        Ok(())
    }

    #[test]
    fn key_file_covers_whole_device() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let keyfile = fx.dir.path().join("userdata_key");
        let config = CryptConfig::new(&fx.real, KeyLocation::File(keyfile.clone()))
            .footer_writes(true)
            .enable_allowed(true);
        fx.session_with(config.clone()).enable(0, "31323334")?;

        assert_eq!(std::fs::metadata(&keyfile)?.len(), CRYPT_FOOTER_OFFSET);
        let ftr = fx.session_with(config).read_footer_and_upgrade()?;
        assert_eq!(ftr.fs_size, DEVICE_SECTORS);
        Ok(())
    }
}

//! A cryptfs session: the footer, the keys recovered from it, and the operations built on them.
//!
//! Everything one recovery run learns (the unlocked master key, the mount point, the persistent
//! field table and a recently entered password) lives in a [`CryptSession`], so a fresh session
//! behaves like a fresh process.

mod enable;
mod password;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::blockdev;
use crate::config::CryptConfig;
use crate::crypto::{self, MasterKey};
use crate::dm::{self, DeviceMapper};
use crate::error::CryptfsError;
use crate::footer::{
    self, CryptFooter, CryptType, FooterStore, CRYPT_DATA_CORRUPT, CRYPT_ENCRYPTION_IN_PROGRESS,
    CRYPT_INCONSISTENT_STATE, DEFAULT_CIPHER, MAX_KEY_LEN,
};
use crate::kdf::{KdfType, Keymaster, NoKeymaster, ScryptParams};
use crate::persist::{self, PersistData, PROPERTY_VALUE_MAX};
use crate::platform::{Mounter, PowerMonitor, SysMounter, SysfsPower};
use crate::props::Properties;

pub use password::adjust_passwd;

/// Password that protects the master key when the user has not set one
pub const DEFAULT_PASSWORD: &str = "default_password";

/// How long an entered password stays available through [`CryptSession::get_password`]
pub const PASSWORD_MAX_AGE: Duration = Duration::from_secs(60);

/// Default buffer size for reading persistent fields
pub const GETFIELD_MAX_LEN: usize = PROPERTY_VALUE_MAX;

/// The default password in the hex form the KDFs expect
pub fn default_password() -> Zeroizing<String> {
    Zeroizing::new(hex::encode(DEFAULT_PASSWORD))
}

/// Result of [`CryptSession::crypto_complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoComplete {
    NotEncrypted,
    Encrypted,
    BadMetadata,
    Partial,
    Inconsistent,
    Corrupt,
}

impl CryptoComplete {
    pub fn code(self) -> i32 {
        match self {
            CryptoComplete::NotEncrypted => 1,
            CryptoComplete::Encrypted => 0,
            CryptoComplete::BadMetadata => -1,
            CryptoComplete::Partial => -2,
            CryptoComplete::Inconsistent => -3,
            CryptoComplete::Corrupt => -4,
        }
    }
}

struct CachedPassword {
    value: Zeroizing<String>,
    expires: Instant,
}

pub struct CryptSession {
    config: CryptConfig,
    store: FooterStore,
    props: Box<dyn Properties>,
    dm: Box<dyn DeviceMapper>,
    mounter: Box<dyn Mounter>,
    keymaster: Box<dyn Keymaster>,
    power: Box<dyn PowerMonitor>,

    master_key: Option<MasterKey>,
    mount_point: Option<PathBuf>,
    persist: Option<PersistData>,
    password: Option<CachedPassword>,
}

impl CryptSession {
    /// A session using the kernel for mounts and the battery, and no keymaster
    pub fn new(config: CryptConfig, props: Box<dyn Properties>, dm: Box<dyn DeviceMapper>) -> Self {
        Self {
            store: FooterStore::new(&config),
            config,
            props,
            dm,
            mounter: Box::new(SysMounter),
            keymaster: Box::new(NoKeymaster),
            power: Box::new(SysfsPower::default()),
            master_key: None,
            mount_point: None,
            persist: None,
            password: None,
        }
    }

    pub fn mounter(mut self, mounter: Box<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn keymaster(mut self, keymaster: Box<dyn Keymaster>) -> Self {
        self.keymaster = keymaster;
        self
    }

    pub fn power(mut self, power: Box<dyn PowerMonitor>) -> Self {
        self.power = power;
        self
    }

    pub fn config(&self) -> &CryptConfig {
        &self.config
    }

    /// Has a password been accepted in this session?
    pub fn is_unlocked(&self) -> bool {
        self.master_key.is_some()
    }

    /// Forget everything learned in this session
    pub fn clear(&mut self) {
        self.master_key = None;
        self.mount_point = None;
        self.persist = None;
        self.clear_password();
    }

    fn scrypt_params(&self) -> ScryptParams {
        ScryptParams::from_properties(self.props.as_ref())
    }

    /// Read the footer, bringing old versions up to date
    ///
    /// The upgraded footer is written back only when footer writes are enabled.
    pub fn read_footer_and_upgrade(&self) -> Result<CryptFooter, CryptfsError> {
        let mut ftr = self
            .store
            .read()
            .context("Error getting crypt footer and key")?;

        let footer_offset = match self.store.is_key_file() {
            true => 0,
            false => self
                .store
                .footer_offset()
                .context("Cannot locate crypt footer")?,
        };
        if let Some(from) = footer::upgrade(&mut ftr, footer_offset, self.scrypt_params()) {
            info!(
                "Upgraded crypt footer from 1.{from} to {}.{}",
                ftr.major_version, ftr.minor_version
            );
            if !self.config.footer_writes {
                debug!("Footer writes disabled; keeping the upgraded footer in memory");
            } else {
                if from == 0 {
                    persist::init_region(&ftr, self.store.path())
                        .context("Cannot initialize persistent data")?;
                }
                self.write_footer(&ftr)?;
            }
        }

        Ok(ftr)
    }

    fn write_footer(&self, ftr: &CryptFooter) -> Result<(), CryptfsError> {
        if !self.config.footer_writes {
            return Err(CryptfsError::FooterWritesDisabled);
        }
        self.store.write(ftr).context("Cannot write crypt footer")?;
        Ok(())
    }

    /// Can the footer be read (and upgraded)?
    pub fn check_footer(&self) -> Result<(), CryptfsError> {
        self.read_footer_and_upgrade().map(|_| ())
    }

    /// How far along encryption of the device is
    pub fn crypto_complete(&self) -> CryptoComplete {
        if !self.props.is_encrypted() {
            return CryptoComplete::NotEncrypted;
        }

        let ftr = match self.read_footer_and_upgrade() {
            Ok(ftr) => ftr,
            Err(e) => {
                // A key file that was never created means the device was never encrypted
                if self.store.is_key_file() && !self.store.path().exists() {
                    return CryptoComplete::NotEncrypted;
                }
                warn!("Cannot read crypt footer: {e:#}");
                return CryptoComplete::BadMetadata;
            }
        };

        if ftr.has_flag(CRYPT_ENCRYPTION_IN_PROGRESS) {
            warn!("Crypto footer shows encryption did not complete");
            CryptoComplete::Partial
        } else if ftr.has_flag(CRYPT_INCONSISTENT_STATE) {
            warn!("Crypto footer shows the encryption state is inconsistent");
            CryptoComplete::Inconsistent
        } else if ftr.has_flag(CRYPT_DATA_CORRUPT) {
            warn!("Crypto footer shows the data is corrupt");
            CryptoComplete::Corrupt
        } else {
            CryptoComplete::Encrypted
        }
    }

    /// The password type, or `None` while the footer is in an inconsistent state
    pub fn get_password_type(&self) -> Result<Option<CryptType>, CryptfsError> {
        let ftr = self.read_footer_and_upgrade()?;
        if ftr.has_flag(CRYPT_INCONSISTENT_STATE) {
            return Ok(None);
        }
        let crypt_type = CryptType::try_from(ftr.crypt_type)
            .map_err(|_| CryptfsError::BadCryptType(ftr.crypt_type))?;
        Ok(Some(crypt_type))
    }

    /// Mark the encrypted data as not to be trusted
    pub fn set_corrupt(&self) -> Result<(), CryptfsError> {
        let mut ftr = self.read_footer_and_upgrade()?;
        ftr.set_flag(CRYPT_DATA_CORRUPT);
        self.write_footer(&ftr)
    }

    /// The last accepted password, if it was entered recently enough
    pub fn get_password(&mut self) -> Option<&str> {
        let expired = match &self.password {
            Some(cached) => Instant::now() >= cached.expires,
            None => return None,
        };
        if expired {
            self.clear_password();
            return None;
        }
        self.password.as_ref().map(|cached| cached.value.as_str())
    }

    pub fn clear_password(&mut self) {
        self.password = None;
    }

    fn remember_password(&mut self, passwd: &str) {
        self.password = Some(CachedPassword {
            value: Zeroizing::new(passwd.to_owned()),
            expires: Instant::now() + PASSWORD_MAX_AGE,
        });
    }

    /// The persistent field table, loaded on first use
    fn persist_data(&mut self) -> Result<&mut PersistData, CryptfsError> {
        let data = match self.persist.take() {
            Some(data) => data,
            None if self.props.is_encrypted() => {
                let ftr = self.read_footer_and_upgrade()?;
                persist::load(&ftr, self.store.path())?
            }
            None => PersistData::default(),
        };
        Ok(self.persist.insert(data))
    }

    fn save_persist_data(&mut self) -> Result<(), CryptfsError> {
        if !self.config.footer_writes {
            warn!("Not saving persistent data: footer writes are disabled");
            return Err(CryptfsError::FooterWritesDisabled);
        }
        let ftr = self.read_footer_and_upgrade()?;
        let data = self.persist_data()?.clone();
        persist::save(&ftr, self.store.path(), &data)?;
        Ok(())
    }

    /// Read a persistent field; values of `max_len` bytes or more are refused
    pub fn getfield(&mut self, field: &str, max_len: usize) -> Result<String, CryptfsError> {
        Ok(self.persist_data()?.getfield(field, max_len)?)
    }

    /// Write a persistent field, saving the table when the device is encrypted
    pub fn setfield(&mut self, field: &str, value: &str) -> Result<(), CryptfsError> {
        self.persist_data()?.setfield(field, value)?;
        if self.props.is_encrypted() {
            self.save_persist_data()?;
        }
        Ok(())
    }

    /// A footer for this device with the session's KDF and the device's cost factors
    pub fn init_footer(&self) -> CryptFooter {
        let kdf = match self.keymaster.is_compatible() {
            true => KdfType::ScryptKeymaster,
            false => KdfType::Scrypt,
        };
        let offset = match self.store.is_key_file() {
            true => Some(0),
            false => self.store.footer_offset().ok(),
        };
        let mut ftr = CryptFooter::new(kdf, self.scrypt_params(), offset);
        ftr.crypto_type_name = DEFAULT_CIPHER.to_owned();
        ftr
    }

    /// A fresh footer holding a random master key protected by the default password
    pub fn create_default_footer(&self) -> Result<CryptFooter, CryptfsError> {
        let mut ftr = self.init_footer();
        ftr.crypt_type = CryptType::Default.into();
        crypto::create_encrypted_random_key(
            &default_password(),
            &mut ftr,
            self.scrypt_params(),
            self.keymaster.as_ref(),
        )
        .context("Failed to create a default crypto footer")?;
        Ok(ftr)
    }

    /// Unwrap the master key with `passwd` (the default password if empty), checking it
    /// against the footer's verifier
    pub fn get_master_key(&self, passwd: &str) -> Result<MasterKey, CryptfsError> {
        let ftr = self.read_footer_and_upgrade()?;
        let passwd = match passwd.is_empty() {
            true => default_password(),
            false => Zeroizing::new(passwd.to_owned()),
        };

        let (key, ikey) = crypto::decrypt_master_key(&passwd, &ftr, self.keymaster.as_ref())
            .context("Can't calculate intermediate key")?;
        if !crypto::verify_intermediate_key(&ikey[..], &ftr)? {
            return Err(anyhow::anyhow!("Password does not match the crypto footer").into());
        }
        Ok(key)
    }

    /// Map an external volume whose key is kept elsewhere
    pub fn setup_ext_volume(
        &self,
        label: &str,
        real_blkdev: &Path,
        key: &[u8],
    ) -> Result<PathBuf, CryptfsError> {
        let fs_size = blockdev::path_size_in_sectors(real_blkdev)?;
        if fs_size == 0 {
            return Err(anyhow::anyhow!("Failed to get size of {}", real_blkdev.display()).into());
        }
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(anyhow::anyhow!("invalid key length {}", key.len()).into());
        }

        let ftr = CryptFooter {
            fs_size,
            keysize: key.len() as u32,
            crypto_type_name: DEFAULT_CIPHER.to_owned(),
            ..Default::default()
        };
        Ok(dm::create_crypto_blk_dev(
            self.dm.as_ref(),
            &ftr,
            key,
            real_blkdev,
            label,
        )?)
    }

    pub fn revert_ext_volume(&self, label: &str) -> Result<(), CryptfsError> {
        Ok(dm::delete_crypto_blk_dev(self.dm.as_ref(), label)?)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::config::KeyLocation;
    use crate::dm::SimDeviceMapper;
    use crate::persist::FieldError;
    use crate::platform::{SimMounter, SimPower};
    use crate::props::{self, MemoryProperties};
    use std::sync::Arc;

    /// Device size used by the test fixtures: 256 KiB of data plus the footer region
    pub(crate) const DEVICE_SECTORS: u64 = 512 + 32;

    /// A plaintext "device" image, a key file location and simulated services
    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub real: PathBuf,
        pub props: Arc<MemoryProperties>,
        pub dm: SimDeviceMapper,
        pub mounter: SimMounter,
        pub power: SimPower,
    }

    impl Fixture {
        pub fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let real = dir.path().join("userdata.img");
            let data: Vec<u8> = (0..DEVICE_SECTORS * 512)
                .map(|i| (i / 512 % 241) as u8 + 7)
                .collect();
            std::fs::write(&real, data)?;

            let props = Arc::new(
                MemoryProperties::new()
                    .with(props::CRYPTO_REAL_BLKDEV, &real.display().to_string())
                    .with(props::CRYPTO_SCRYPT_PARAMS, "4:0:0"),
            );
            let dm = SimDeviceMapper::new(dir.path());
            Ok(Self {
                dir,
                real,
                props,
                dm,
                mounter: SimMounter::new(),
                power: SimPower::full(),
            })
        }

        pub fn config(&self) -> CryptConfig {
            CryptConfig::new(&self.real, KeyLocation::Footer)
                .footer_writes(true)
                .enable_allowed(true)
        }

        /// A new session over the same disk, as a freshly started process would see it
        pub fn session(&self) -> CryptSession {
            self.session_with(self.config())
        }

        pub fn session_with(&self, config: CryptConfig) -> CryptSession {
            let mut config = config;
            config.mount_point = self.dir.path().join("data");
            CryptSession::new(config, Box::new(Arc::clone(&self.props)), Box::new(self.dm.clone()))
                .mounter(Box::new(self.mounter.clone()))
                .power(Box::new(self.power.clone()))
        }

        /// Write a footer protecting a random key with `passwd`; returns the key
        pub fn encrypted_footer(&self, passwd: &str) -> anyhow::Result<Vec<u8>> {
            let session = self.session();
            let mut ftr = session.init_footer();
            ftr.fs_size = DEVICE_SECTORS - 32;
            crypto::create_encrypted_random_key(
                passwd,
                &mut ftr,
                session.scrypt_params(),
                &NoKeymaster,
            )?;
            session.write_footer(&ftr)?;
            persist::init_region(&ftr, &self.real)?;
            self.props.set(props::CRYPTO_STATE, "encrypted")?;

            let (key, _) = crypto::decrypt_master_key(passwd, &ftr, &NoKeymaster)?;
            Ok(key.to_vec())
        }
    }

    #[test]
    fn crypto_complete_states() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        assert_eq!(fx.session().crypto_complete(), CryptoComplete::NotEncrypted);

        fx.props.set(props::CRYPTO_STATE, "encrypted")?;
        assert_eq!(fx.session().crypto_complete(), CryptoComplete::BadMetadata);

        fx.encrypted_footer("70617373")?;
        let session = fx.session();
        assert_eq!(session.crypto_complete(), CryptoComplete::Encrypted);
        assert_eq!(session.crypto_complete().code(), 0);

        for (flag, expected) in [
            (CRYPT_DATA_CORRUPT, CryptoComplete::Corrupt),
            (CRYPT_INCONSISTENT_STATE, CryptoComplete::Inconsistent),
            (CRYPT_ENCRYPTION_IN_PROGRESS, CryptoComplete::Partial),
        ] {
            let mut ftr = session.read_footer_and_upgrade()?;
            ftr.set_flag(flag);
            session.write_footer(&ftr)?;
            assert_eq!(session.crypto_complete(), expected);
        }
        Ok(())
    }

    #[test]
    fn missing_key_file_is_not_encrypted() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.props.set(props::CRYPTO_STATE, "encrypted")?;
        let keyfile = fx.dir.path().join("missing_key");
        let config = CryptConfig::new(&fx.real, KeyLocation::File(keyfile));
        assert_eq!(
            fx.session_with(config).crypto_complete(),
            CryptoComplete::NotEncrypted
        );
        Ok(())
    }

    #[test]
    fn password_type_and_corruption() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("1234")?;
        let session = fx.session();
        assert_eq!(session.get_password_type()?, Some(CryptType::Password));

        session.set_corrupt()?;
        assert!(session.read_footer_and_upgrade()?.has_flag(CRYPT_DATA_CORRUPT));

        let mut ftr = session.read_footer_and_upgrade()?;
        ftr.set_flag(CRYPT_INCONSISTENT_STATE);
        session.write_footer(&ftr)?;
        assert_eq!(session.get_password_type()?, None);

        // Without footer writes nothing reaches the disk
        let read_only = fx.session_with(CryptConfig::new(&fx.real, KeyLocation::Footer));
        assert!(matches!(
            read_only.set_corrupt(),
            Err(CryptfsError::FooterWritesDisabled)
        ));
        Ok(())
    }

    #[test]
    fn fields_persist_across_sessions() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        fx.encrypted_footer("1234")?;

        let mut session = fx.session();
        let long_value = "x".repeat(200);
        session.setfield("pin_hint", &long_value)?;
        session.setfield("fbe", "1")?;
        drop(session);

        let mut session = fx.session();
        assert_eq!(session.getfield("pin_hint", 512)?, long_value);
        assert_eq!(session.getfield("fbe", GETFIELD_MAX_LEN)?, "1");
        let err = session.getfield("pin_hint", 100).unwrap_err();
        assert_eq!(err.getfield_code(), -2);
        let err = session.getfield("nothing", GETFIELD_MAX_LEN).unwrap_err();
        assert!(matches!(err, CryptfsError::Field(FieldError::NoField)));
        Ok(())
    }

    #[test]
    fn fields_on_unencrypted_device_stay_in_memory() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let before = std::fs::read(&fx.real)?;

        let mut session = fx.session();
        session.setfield("key", "value")?;
        assert_eq!(session.getfield("key", GETFIELD_MAX_LEN)?, "value");
        assert_eq!(std::fs::read(&fx.real)?, before);
        Ok(())
    }

    #[test]
    fn default_footer_and_master_key() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let session = fx.session();
        let ftr = session.create_default_footer()?;
        assert_eq!(ftr.crypt_type, u32::from(CryptType::Default));
        assert_eq!(ftr.kdf()?, KdfType::Scrypt);
        assert_eq!(ftr.crypto_type_name, DEFAULT_CIPHER);
        session.write_footer(&ftr)?;

        // An empty password means the default one
        let key = session.get_master_key("")?;
        assert_eq!(key.len(), 16);
        assert!(session.get_master_key("00").is_err());
        Ok(())
    }

    #[test]
    fn ext_volume_mapping() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let session = fx.session();
        let sdcard = fx.dir.path().join("sdcard.img");
        std::fs::File::create(&sdcard)?.set_len(64 * 512)?;

        let path = session.setup_ext_volume("sdcard", &sdcard, &[0x11; 16])?;
        assert_eq!(path, fx.dm.device_path("sdcard"));
        let table = fx.dm.table("sdcard").unwrap();
        assert!(table.starts_with("aes-cbc-essiv:sha256 11111111111111111111111111111111 0 "));

        session.revert_ext_volume("sdcard")?;
        assert!(!fx.dm.is_active("sdcard"));
        assert!(session.setup_ext_volume("bad", &sdcard, &[]).is_err());
        Ok(())
    }

    #[test]
    fn password_cache_expires() {
        let fx = Fixture::new().unwrap();
        let mut session = fx.session();
        assert_eq!(session.get_password(), None);

        session.remember_password("31323334");
        assert_eq!(session.get_password(), Some("31323334"));

        if let Some(cached) = session.password.as_mut() {
            cached.expires = Instant::now();
        }
        assert_eq!(session.get_password(), None);
        assert!(session.password.is_none());

        session.remember_password("31323334");
        session.clear();
        assert_eq!(session.get_password(), None);
    }
}

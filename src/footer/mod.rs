//! The crypto footer: the versioned on-disk record describing an encrypted partition.
//!
//! The footer lives either in the last 16 KiB of the real block device or in a separate 16 KiB
//! key file. Several generations of the layout exist on real devices; [`codec`] handles the
//! differences, while this module holds the in-memory representation, locating the footer on
//! disk, and the forward migration between minor versions.

pub mod codec;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use thiserror::Error;

use crate::blockdev::{self, CRYPT_SECTOR_SIZE};
use crate::config::{CryptConfig, KeyLocation};
use crate::kdf::{KdfType, ScryptParams};
use crate::util::LeFields;

pub const CRYPT_MNT_MAGIC: u32 = 0xD0B5B1C4;
pub const CURRENT_MAJOR_VERSION: u16 = 1;
pub const CURRENT_MINOR_VERSION: u16 = 3;

/// Distance of the footer from the end of the device, and the exact size of a key file
pub const CRYPT_FOOTER_OFFSET: u64 = 0x4000;
pub const CRYPT_FOOTER_TO_PERSIST_OFFSET: u64 = 0x1000;
pub const CRYPT_PERSIST_DATA_SIZE: u32 = 0x1000;

pub const MAX_CRYPTO_TYPE_NAME_LEN: usize = 64;
pub const MAX_KEY_LEN: usize = 48;
pub const SALT_LEN: usize = 16;
pub const SCRYPT_LEN: usize = 32;
pub const KEYMASTER_BLOB_SIZE: usize = 2048;
pub const KEY_TO_SALT_PADDING: usize = 32;

/// The key for the partition is not encrypted
pub const CRYPT_MNT_KEY_UNENCRYPTED: u32 = 0x1;
/// Encryption partially completed; `encrypted_upto` says how far
pub const CRYPT_ENCRYPTION_IN_PROGRESS: u32 = 0x2;
/// Set while encryption runs, cleared when it stops cleanly
pub const CRYPT_INCONSISTENT_STATE: u32 = 0x4;
/// Encryption finished but the data is known to be bad
pub const CRYPT_DATA_CORRUPT: u32 = 0x8;

pub const DEFAULT_CIPHER: &str = "aes-cbc-essiv:sha256";

/// What kind of secret the master key is encrypted with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptType {
    Password,
    /// Encrypted with [`DEFAULT_PASSWORD`](crate::cryptfs::DEFAULT_PASSWORD)
    Default,
    Pattern,
    Pin,
}

impl From<CryptType> for u32 {
    fn from(value: CryptType) -> Self {
        match value {
            CryptType::Password => 0,
            CryptType::Default => 1,
            CryptType::Pattern => 2,
            CryptType::Pin => 3,
        }
    }
}

impl TryFrom<u32> for CryptType {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> anyhow::Result<Self> {
        match value {
            0 => Ok(Self::Password),
            1 => Ok(Self::Default),
            2 => Ok(Self::Pattern),
            3 => Ok(Self::Pin),
            _ => anyhow::bail!("unknown crypt type {value}"),
        }
    }
}

impl FromStr for CryptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "password" => Ok(Self::Password),
            "default" => Ok(Self::Default),
            "pattern" => Ok(Self::Pattern),
            "pin" => Ok(Self::Pin),
            _ => anyhow::bail!("expected one of password, default, pattern, pin"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FooterError {
    #[error("no crypt footer at {0}")]
    NotFound(PathBuf),
    #[error("bad magic {0:#010x} for crypt footer")]
    BadMagic(u32),
    #[error("cannot understand crypt footer version {0}.{1}")]
    UnsupportedVersion(u16, u16),
    #[error("invalid master key size {0}")]
    BadKeySize(u32),
    #[error("invalid keymaster blob size {0}")]
    BadBlobSize(u32),
    #[error("key file is {0} bytes, expected 16384")]
    BadFileSize(u64),
    #[error("short read of crypt footer")]
    ShortRead,
    #[error("cannot locate crypt footer: {0}")]
    SeekFailed(String),
    #[error("cannot write crypt footer")]
    WriteFailed(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FooterError {
    /// The `crypto_complete` status this failure is reported as
    pub fn error_code(&self) -> i32 {
        match self {
            FooterError::NotFound(_) => 1,
            _ => -1,
        }
    }
}

/// The fields of a crypto footer, independent of the on-disk generation it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptFooter {
    pub major_version: u16,
    pub minor_version: u16,

    /// Size of the fixed part of the footer as recorded on disk
    pub ftr_size: u32,

    /// Bitset of the `CRYPT_*` flags
    pub flags: u32,

    /// Length of the master key in bytes
    pub keysize: u32,

    /// Raw [`CryptType`]
    pub crypt_type: u32,

    /// Size of the filesystem in 512-byte sectors
    pub fs_size: u64,

    pub failed_decrypt_count: u32,

    /// Cipher spec handed to dm-crypt, e.g. `aes-cbc-essiv:sha256`
    pub crypto_type_name: String,

    /// The master key, encrypted unless `CRYPT_MNT_KEY_UNENCRYPTED` is set
    pub master_key: [u8; MAX_KEY_LEN],
    pub salt: [u8; SALT_LEN],

    /// Absolute offsets of the two persistent data slots
    pub persist_data_offset: [u64; 2],
    pub persist_data_size: u32,

    /// Raw [`KdfType`]
    pub kdf_type: u8,
    pub n_factor: u8,
    pub r_factor: u8,
    pub p_factor: u8,

    /// Sectors already encrypted by an interrupted in-place run
    pub encrypted_upto: u64,
    pub hash_first_block: [u8; 32],

    /// Key blob for the hardware keymaster; empty if unused
    pub keymaster_blob: Vec<u8>,

    /// `scrypt` of the intermediate key, for recognizing a wrong password
    pub scrypted_intermediate_key: [u8; SCRYPT_LEN],
}

impl Default for CryptFooter {
    fn default() -> Self {
        Self {
            major_version: CURRENT_MAJOR_VERSION,
            minor_version: CURRENT_MINOR_VERSION,
            ftr_size: codec::CURRENT_FTR_SIZE as u32,
            flags: 0,
            keysize: 0,
            crypt_type: CryptType::Password.into(),
            fs_size: 0,
            failed_decrypt_count: 0,
            crypto_type_name: String::new(),
            master_key: [0; MAX_KEY_LEN],
            salt: [0; SALT_LEN],
            persist_data_offset: [0; 2],
            persist_data_size: 0,
            kdf_type: 0,
            n_factor: 0,
            r_factor: 0,
            p_factor: 0,
            encrypted_upto: 0,
            hash_first_block: [0; 32],
            keymaster_blob: Vec::new(),
            scrypted_intermediate_key: [0; SCRYPT_LEN],
        }
    }
}

impl CryptFooter {
    /// A fresh current-version footer, as written when encryption is first enabled
    pub fn new(kdf: KdfType, params: ScryptParams, footer_offset: Option<u64>) -> Self {
        let mut ftr = Self {
            keysize: crate::crypto::KEY_LEN_BYTES as u32,
            kdf_type: kdf.into(),
            persist_data_size: CRYPT_PERSIST_DATA_SIZE,
            ..Default::default()
        };
        params.apply(&mut ftr);
        if let Some(off) = footer_offset {
            let first = off + CRYPT_FOOTER_TO_PERSIST_OFFSET;
            ftr.persist_data_offset = [first, first + CRYPT_PERSIST_DATA_SIZE as u64];
        }
        ftr
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub fn kdf(&self) -> anyhow::Result<KdfType> {
        self.kdf_type.try_into()
    }

    pub fn scrypt_params(&self) -> ScryptParams {
        ScryptParams {
            n_factor: self.n_factor,
            r_factor: self.r_factor,
            p_factor: self.p_factor,
        }
    }

    /// The used portion of `master_key`
    pub fn key(&self) -> &[u8] {
        &self.master_key[..(self.keysize as usize).min(MAX_KEY_LEN)]
    }

    /// Parse a footer from the start of `buf`, validating magic and version
    pub fn decode(buf: &[u8]) -> Result<Self, FooterError> {
        let magic = buf.le_u32_at(0).map_err(|_| FooterError::ShortRead)?;
        if magic != CRYPT_MNT_MAGIC {
            return Err(FooterError::BadMagic(magic));
        }

        let major = buf.le_u16_at(4).map_err(|_| FooterError::ShortRead)?;
        let minor = buf.le_u16_at(6).map_err(|_| FooterError::ShortRead)?;
        if major != CURRENT_MAJOR_VERSION {
            return Err(FooterError::UnsupportedVersion(major, minor));
        }
        if minor > CURRENT_MINOR_VERSION {
            warn!(
                "crypto footer minor version {minor}, expected <= {CURRENT_MINOR_VERSION}, \
                 continuing..."
            );
        }

        codec::for_version(minor).decode(buf)
    }

    /// Serialize into `out` using the layout of this footer's version; returns the length used
    pub fn encode(&self, out: &mut [u8]) -> anyhow::Result<usize> {
        let codec = codec::for_version(self.minor_version);
        let len = codec.encoded_len(self);
        let out = out
            .get_mut(..len)
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out.fill(0);
        codec.encode(self, out)?;
        Ok(len)
    }
}

/// Bring a footer up to the current minor version
///
/// Returns the minor version the footer started at if anything changed. A footer coming from
/// 1.0 also needs its persistent data region initialized on disk; see
/// [`persist::init_region`](crate::persist::init_region).
pub fn upgrade(ftr: &mut CryptFooter, footer_offset: u64, params: ScryptParams) -> Option<u16> {
    let from = ftr.minor_version;

    if ftr.major_version == 1 && ftr.minor_version == 0 {
        let first = footer_offset + CRYPT_FOOTER_TO_PERSIST_OFFSET;
        ftr.persist_data_size = CRYPT_PERSIST_DATA_SIZE;
        ftr.persist_data_offset = [first, first + CRYPT_PERSIST_DATA_SIZE as u64];
        ftr.minor_version = 1;
    }

    if ftr.major_version == 1 && ftr.minor_version == 1 {
        ftr.kdf_type = KdfType::Pbkdf2.into();
        params.apply(ftr);
        ftr.minor_version = 2;
    }

    if ftr.major_version == 1 && ftr.minor_version == 2 {
        ftr.crypt_type = CryptType::Password.into();
        ftr.minor_version = 3;
    }

    (ftr.minor_version != from).then_some(from)
}

/// Reads and writes the footer of one device
#[derive(Debug, Clone)]
pub struct FooterStore {
    real_blkdev: PathBuf,
    location: KeyLocation,
}

impl FooterStore {
    pub fn new(config: &CryptConfig) -> Self {
        Self {
            real_blkdev: config.real_blkdev.clone(),
            location: config.key_location.clone(),
        }
    }

    /// The file that holds the footer (and the persistent data next to it)
    pub fn path(&self) -> &Path {
        match &self.location {
            KeyLocation::Footer => &self.real_blkdev,
            KeyLocation::File(path) => path,
        }
    }

    pub fn is_key_file(&self) -> bool {
        matches!(self.location, KeyLocation::File(_))
    }

    fn offset_in(&self, file: &File) -> Result<u64, FooterError> {
        match self.location {
            KeyLocation::File(_) => Ok(0),
            KeyLocation::Footer => {
                let sectors = blockdev::size_in_sectors(file)
                    .map_err(|e| FooterError::SeekFailed(e.to_string()))?;
                (sectors * CRYPT_SECTOR_SIZE)
                    .checked_sub(CRYPT_FOOTER_OFFSET)
                    .ok_or(FooterError::SeekFailed(format!(
                        "{} is too small to hold a footer",
                        self.real_blkdev.display()
                    )))
            }
        }
    }

    /// Byte offset of the footer within [`path`](Self::path)
    pub fn footer_offset(&self) -> Result<u64, FooterError> {
        let file = self.open(false)?;
        self.offset_in(&file)
    }

    fn open(&self, write: bool) -> Result<File, FooterError> {
        let path = self.path();
        let result = OpenOptions::new()
            .read(true)
            .write(write)
            .create(write && self.is_key_file())
            .open(path);
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FooterError::NotFound(path.to_owned()))
            }
            Err(e) if write => Err(FooterError::WriteFailed(e)),
            r => Ok(r?),
        }
    }

    pub fn read(&self) -> Result<CryptFooter, FooterError> {
        let file = self.open(false)?;

        let meta = file.metadata()?;
        if self.is_key_file() && meta.file_type().is_file() && meta.len() != CRYPT_FOOTER_OFFSET
        {
            return Err(FooterError::BadFileSize(meta.len()));
        }

        let offset = self.offset_in(&file)?;
        let mut buf = vec![0u8; CRYPT_FOOTER_OFFSET as usize];
        file.read_exact_at(&mut buf, offset).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => FooterError::ShortRead,
            _ => FooterError::Io(e),
        })?;

        CryptFooter::decode(&buf)
    }

    pub fn write(&self, ftr: &CryptFooter) -> Result<(), FooterError> {
        let file = self.open(true)?;
        let offset = self.offset_in(&file)?;

        let mut buf = vec![0u8; CRYPT_FOOTER_OFFSET as usize];
        let len = ftr.encode(&mut buf).map_err(|e| {
            FooterError::WriteFailed(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?;
        file.write_all_at(&buf[..len], offset)
            .map_err(FooterError::WriteFailed)?;

        // Key files are always exactly one footer region long; devices are never truncated.
        let meta = file.metadata()?;
        if self.is_key_file() && !meta.file_type().is_block_device() && meta.file_type().is_file()
        {
            file.set_len(CRYPT_FOOTER_OFFSET)
                .map_err(FooterError::WriteFailed)?;
        }
        file.sync_data().map_err(FooterError::WriteFailed)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_footer() -> CryptFooter {
        let mut ftr = CryptFooter::new(
            KdfType::Scrypt,
            "15:3:1".parse().unwrap(),
            Some(0x10_0000 - CRYPT_FOOTER_OFFSET),
        );
        ftr.flags = CRYPT_ENCRYPTION_IN_PROGRESS | CRYPT_DATA_CORRUPT;
        ftr.crypt_type = CryptType::Pin.into();
        ftr.fs_size = 2016;
        ftr.failed_decrypt_count = 3;
        ftr.crypto_type_name = DEFAULT_CIPHER.to_owned();
        ftr.master_key[..16].copy_from_slice(&[0x5A; 16]);
        ftr.salt = [0xA5; SALT_LEN];
        ftr.encrypted_upto = 1000;
        ftr.hash_first_block = [7; 32];
        ftr.keymaster_blob = vec![1, 2, 3, 4, 5];
        ftr.scrypted_intermediate_key = [9; SCRYPT_LEN];
        ftr
    }

    fn device(dir: &tempfile::TempDir, sectors: u64) -> anyhow::Result<PathBuf> {
        let path = dir.path().join("userdata.img");
        File::create(&path)?.set_len(sectors * CRYPT_SECTOR_SIZE)?;
        Ok(path)
    }

    #[test]
    fn round_trip_in_device_footer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dev = device(&dir, 2048)?;
        let store = FooterStore::new(&CryptConfig::new(&dev, KeyLocation::Footer));

        assert_eq!(store.footer_offset()?, 2048 * 512 - 0x4000);
        let ftr = sample_footer();
        store.write(&ftr)?;
        assert_eq!(store.read()?, ftr);

        // The device must not have been truncated
        assert_eq!(std::fs::metadata(&dev)?.len(), 2048 * 512);
        Ok(())
    }

    #[test]
    fn round_trip_in_key_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dev = device(&dir, 2048)?;
        let key_file = dir.path().join("userdata_key");
        let store = FooterStore::new(&CryptConfig::new(
            &dev,
            KeyLocation::File(key_file.clone()),
        ));

        assert!(matches!(store.read(), Err(FooterError::NotFound(_))));

        let ftr = sample_footer();
        store.write(&ftr)?;
        assert_eq!(std::fs::metadata(&key_file)?.len(), CRYPT_FOOTER_OFFSET);
        assert_eq!(store.read()?, ftr);

        // A key file of the wrong size is rejected outright
        OpenOptions::new()
            .write(true)
            .open(&key_file)?
            .set_len(CRYPT_FOOTER_OFFSET + 1)?;
        assert!(matches!(store.read(), Err(FooterError::BadFileSize(_))));
        Ok(())
    }

    #[test]
    fn rejects_bad_magic_and_version() -> anyhow::Result<()> {
        let mut buf = vec![0u8; CRYPT_FOOTER_OFFSET as usize];
        sample_footer().encode(&mut buf)?;
        assert!(CryptFooter::decode(&buf).is_ok());

        let mut bad_magic = buf.clone();
        bad_magic[2] ^= 0x01;
        assert!(matches!(
            CryptFooter::decode(&bad_magic),
            Err(FooterError::BadMagic(_))
        ));

        let mut bad_major = buf.clone();
        bad_major[4] = 2;
        assert!(matches!(
            CryptFooter::decode(&bad_major),
            Err(FooterError::UnsupportedVersion(2, 3))
        ));

        let mut bad_keysize = buf.clone();
        bad_keysize[16] = 64;
        assert!(matches!(
            CryptFooter::decode(&bad_keysize),
            Err(FooterError::BadKeySize(64))
        ));

        // Newer minor versions are read with a warning
        let mut newer = buf;
        newer[6] = 9;
        assert_eq!(CryptFooter::decode(&newer)?.minor_version, 9);

        assert!(matches!(
            CryptFooter::decode(&[0xC4, 0xB1]),
            Err(FooterError::ShortRead)
        ));
        Ok(())
    }

    #[test]
    fn upgrade_from_1_0() {
        let mut ftr = sample_footer();
        ftr.minor_version = 0;
        ftr.kdf_type = 0;
        ftr.persist_data_offset = [0; 2];
        ftr.persist_data_size = 0;
        ftr.crypt_type = 0xFF;
        let ftr_size = ftr.ftr_size;

        let params = ScryptParams {
            n_factor: 11,
            r_factor: 2,
            p_factor: 1,
        };
        assert_eq!(upgrade(&mut ftr, 0x8000, params), Some(0));

        assert_eq!(ftr.minor_version, CURRENT_MINOR_VERSION);
        assert_eq!(ftr.persist_data_offset, [0x9000, 0xA000]);
        assert_eq!(ftr.persist_data_size, CRYPT_PERSIST_DATA_SIZE);
        assert_eq!(ftr.kdf_type, u8::from(KdfType::Pbkdf2));
        assert_eq!(ftr.scrypt_params(), params);
        assert_eq!(ftr.crypt_type, u32::from(CryptType::Password));
        assert_eq!(ftr.ftr_size, ftr_size);

        // Already current: nothing to do
        assert_eq!(upgrade(&mut ftr, 0x8000, params), None);
    }

    #[test]
    fn upgrade_from_1_2_only_sets_crypt_type() {
        let mut ftr = sample_footer();
        ftr.minor_version = 2;
        let before = ftr.clone();
        assert_eq!(upgrade(&mut ftr, 0, ScryptParams::default()), Some(2));
        assert_eq!(ftr.crypt_type, u32::from(CryptType::Password));
        assert_eq!(ftr.kdf_type, before.kdf_type);
        assert_eq!(ftr.persist_data_offset, before.persist_data_offset);
    }

    #[test]
    fn crypt_type_conversions() -> anyhow::Result<()> {
        assert_eq!("pattern".parse::<CryptType>()?, CryptType::Pattern);
        assert_eq!(CryptType::try_from(3)?, CryptType::Pin);
        assert!(CryptType::try_from(4).is_err());
        assert!("swipe".parse::<CryptType>().is_err());
        Ok(())
    }
}

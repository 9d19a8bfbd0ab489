//! On-disk layouts of the crypto footer.
//!
//! Version 1.0 footers (ICS) are a 104-byte header followed by the master key, 32 bytes of
//! padding and the salt. Every later minor version uses one C struct that grew by appending
//! fields, so it is described once by [`RawFooter`] and older minors simply carry zeroes (or
//! whatever the old release left there) in the fields they did not know about.

use bytes::{Buf, BufMut};
use deku::prelude::*;

use super::{
    CryptFooter, FooterError, CRYPT_MNT_MAGIC, KEYMASTER_BLOB_SIZE, KEY_TO_SALT_PADDING,
    MAX_CRYPTO_TYPE_NAME_LEN, MAX_KEY_LEN, SALT_LEN, SCRYPT_LEN,
};
use crate::kdf::KdfType;
use crate::util::CStrField;

/// `sizeof(struct crypt_mnt_ftr)` for 1.0 footers
pub const LEGACY_FTR_SIZE: usize = 104;

/// `sizeof(struct crypt_mnt_ftr)` for current footers
pub const CURRENT_FTR_SIZE: usize = 2320;

/// One generation of the footer's on-disk layout
pub trait FooterCodec {
    /// How many bytes `encode` will write for this footer
    fn encoded_len(&self, ftr: &CryptFooter) -> usize;

    /// Parse a footer whose magic and major version were already checked
    fn decode(&self, buf: &[u8]) -> Result<CryptFooter, FooterError>;

    /// Serialize into `out`, which is exactly `encoded_len` zeroed bytes
    fn encode(&self, ftr: &CryptFooter, out: &mut [u8]) -> anyhow::Result<()>;
}

/// Select the layout used by footers of a given minor version
pub fn for_version(minor_version: u16) -> &'static dyn FooterCodec {
    match minor_version {
        0 => &LegacyCodec,
        _ => &CurrentCodec,
    }
}

fn check_keysize(keysize: u32) -> Result<usize, FooterError> {
    let size = keysize as usize;
    if size == 0 || size % 16 != 0 || size > MAX_KEY_LEN {
        return Err(FooterError::BadKeySize(keysize));
    }
    Ok(size)
}

/// The 1.0 layout: fixed header, then key and salt at positions derived from `ftr_size`
#[derive(Debug, Clone, Copy)]
pub struct LegacyCodec;

impl LegacyCodec {
    /// Where the key starts: after the header, or after however much header the writer recorded
    fn key_offset(ftr_size: u32) -> usize {
        (ftr_size as usize).max(LEGACY_FTR_SIZE)
    }
}

impl FooterCodec for LegacyCodec {
    fn encoded_len(&self, ftr: &CryptFooter) -> usize {
        Self::key_offset(ftr.ftr_size) + ftr.key().len() + KEY_TO_SALT_PADDING + SALT_LEN
    }

    fn decode(&self, buf: &[u8]) -> Result<CryptFooter, FooterError> {
        let mut hdr = buf.get(..LEGACY_FTR_SIZE).ok_or(FooterError::ShortRead)?;

        let _magic = hdr.get_u32_le();
        let major_version = hdr.get_u16_le();
        let minor_version = hdr.get_u16_le();
        let ftr_size = hdr.get_u32_le();
        let flags = hdr.get_u32_le();
        let keysize = hdr.get_u32_le();
        let crypt_type = hdr.get_u32_le();
        let fs_size = hdr.get_u64_le();
        let failed_decrypt_count = hdr.get_u32_le();
        let mut name = [0u8; MAX_CRYPTO_TYPE_NAME_LEN];
        hdr.copy_to_slice(&mut name);

        let key_len = check_keysize(keysize)?;
        let key_start = Self::key_offset(ftr_size);
        let salt_start = key_start + key_len + KEY_TO_SALT_PADDING;
        let key = buf
            .get(key_start..key_start + key_len)
            .ok_or(FooterError::ShortRead)?;
        let salt = buf
            .get(salt_start..salt_start + SALT_LEN)
            .ok_or(FooterError::ShortRead)?;

        let mut ftr = CryptFooter {
            major_version,
            minor_version,
            ftr_size,
            flags,
            keysize,
            crypt_type,
            fs_size,
            failed_decrypt_count,
            crypto_type_name: name.c_str(),
            ..Default::default()
        };
        ftr.master_key[..key_len].copy_from_slice(key);
        ftr.salt.copy_from_slice(salt);
        Ok(ftr)
    }

    fn encode(&self, ftr: &CryptFooter, mut out: &mut [u8]) -> anyhow::Result<()> {
        let mut name = [0u8; MAX_CRYPTO_TYPE_NAME_LEN];
        name.set_c_str(&ftr.crypto_type_name)?;

        out.put_u32_le(CRYPT_MNT_MAGIC);
        out.put_u16_le(ftr.major_version);
        out.put_u16_le(ftr.minor_version);
        out.put_u32_le(ftr.ftr_size);
        out.put_u32_le(ftr.flags);
        out.put_u32_le(ftr.keysize);
        out.put_u32_le(ftr.crypt_type);
        out.put_u64_le(ftr.fs_size);
        out.put_u32_le(ftr.failed_decrypt_count);
        out.put_slice(&name);

        let skip = Self::key_offset(ftr.ftr_size) - (LEGACY_FTR_SIZE - 4);
        out.put_bytes(0, skip);
        out.put_slice(ftr.key());
        out.put_bytes(0, KEY_TO_SALT_PADDING);
        out.put_slice(&ftr.salt);
        Ok(())
    }
}

/// The raw `struct crypt_mnt_ftr` of minor versions 1 through 3
#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct RawFooter {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub ftr_size: u32,
    pub flags: u32,
    pub keysize: u32,
    pub crypt_type: u32,
    pub fs_size: u64,
    pub failed_decrypt_count: u32,
    pub crypto_type_name: [u8; MAX_CRYPTO_TYPE_NAME_LEN],
    pub spare2: u32,
    pub master_key: [u8; MAX_KEY_LEN],
    pub salt: [u8; SALT_LEN],
    pub persist_data_offset: [u64; 2],
    pub persist_data_size: u32,
    pub kdf_type: u8,
    pub n_factor: u8,
    pub r_factor: u8,
    pub p_factor: u8,
    pub encrypted_upto: u64,
    pub hash_first_block: [u8; 32],
    pub keymaster_blob: [u8; KEYMASTER_BLOB_SIZE],
    pub keymaster_blob_size: u32,
    pub scrypted_intermediate_key: [u8; SCRYPT_LEN],
    pub tail_padding: u32,
}

impl TryFrom<RawFooter> for CryptFooter {
    type Error = FooterError;

    fn try_from(value: RawFooter) -> Result<Self, FooterError> {
        let RawFooter {
            major_version,
            minor_version,
            ftr_size,
            flags,
            keysize,
            crypt_type,
            fs_size,
            failed_decrypt_count,
            crypto_type_name,
            master_key,
            salt,
            persist_data_offset,
            persist_data_size,
            kdf_type,
            n_factor,
            r_factor,
            p_factor,
            encrypted_upto,
            hash_first_block,
            keymaster_blob,
            keymaster_blob_size,
            scrypted_intermediate_key,
            ..
        } = value;

        check_keysize(keysize)?;
        let uses_keymaster = KdfType::try_from(kdf_type).is_ok_and(KdfType::uses_keymaster);
        let blob = match keymaster_blob.get(..keymaster_blob_size as usize) {
            Some(blob) => blob,
            // Only keymaster footers are required to carry a sane blob
            None if !uses_keymaster => &[],
            None => return Err(FooterError::BadBlobSize(keymaster_blob_size)),
        };

        Ok(Self {
            major_version,
            minor_version,
            ftr_size,
            flags,
            keysize,
            crypt_type,
            fs_size,
            failed_decrypt_count,
            crypto_type_name: crypto_type_name.c_str(),
            master_key,
            salt,
            persist_data_offset,
            persist_data_size,
            kdf_type,
            n_factor,
            r_factor,
            p_factor,
            encrypted_upto,
            hash_first_block,
            keymaster_blob: blob.to_vec(),
            scrypted_intermediate_key,
        })
    }
}

impl TryFrom<&CryptFooter> for RawFooter {
    type Error = anyhow::Error;

    fn try_from(value: &CryptFooter) -> anyhow::Result<RawFooter> {
        let mut crypto_type_name = [0u8; MAX_CRYPTO_TYPE_NAME_LEN];
        crypto_type_name.set_c_str(&value.crypto_type_name)?;

        anyhow::ensure!(
            value.keymaster_blob.len() <= KEYMASTER_BLOB_SIZE,
            "keymaster blob of {} bytes is too large",
            value.keymaster_blob.len()
        );
        let mut keymaster_blob = [0u8; KEYMASTER_BLOB_SIZE];
        keymaster_blob[..value.keymaster_blob.len()].copy_from_slice(&value.keymaster_blob);

        Ok(RawFooter {
            magic: CRYPT_MNT_MAGIC,
            major_version: value.major_version,
            minor_version: value.minor_version,
            ftr_size: value.ftr_size,
            flags: value.flags,
            keysize: value.keysize,
            crypt_type: value.crypt_type,
            fs_size: value.fs_size,
            failed_decrypt_count: value.failed_decrypt_count,
            crypto_type_name,
            spare2: 0,
            master_key: value.master_key,
            salt: value.salt,
            persist_data_offset: value.persist_data_offset,
            persist_data_size: value.persist_data_size,
            kdf_type: value.kdf_type,
            n_factor: value.n_factor,
            r_factor: value.r_factor,
            p_factor: value.p_factor,
            encrypted_upto: value.encrypted_upto,
            hash_first_block: value.hash_first_block,
            keymaster_blob,
            keymaster_blob_size: value.keymaster_blob.len() as u32,
            scrypted_intermediate_key: value.scrypted_intermediate_key,
            tail_padding: 0,
        })
    }
}

/// The layout of minor versions 1 and up
#[derive(Debug, Clone, Copy)]
pub struct CurrentCodec;

impl FooterCodec for CurrentCodec {
    fn encoded_len(&self, _ftr: &CryptFooter) -> usize {
        CURRENT_FTR_SIZE
    }

    fn decode(&self, buf: &[u8]) -> Result<CryptFooter, FooterError> {
        let buf = buf.get(..CURRENT_FTR_SIZE).ok_or(FooterError::ShortRead)?;
        let (_, raw) = RawFooter::from_bytes((buf, 0)).map_err(|_| FooterError::ShortRead)?;
        raw.try_into()
    }

    fn encode(&self, ftr: &CryptFooter, out: &mut [u8]) -> anyhow::Result<()> {
        let bytes = RawFooter::try_from(ftr)?.to_bytes()?;
        let out = out
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out.copy_from_slice(&bytes);
        Ok(())
    }
}

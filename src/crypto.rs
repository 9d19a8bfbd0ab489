//! Wrapping and unwrapping of the master key with AES-128-CBC.

use aes::Aes128;
use anyhow::Context;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::{debug, error};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::footer::CryptFooter;
use crate::kdf::{self, IntermediateKey, KdfType, Keymaster, ScryptParams};

pub const KEY_LEN_BYTES: usize = 16;
pub const IV_LEN_BYTES: usize = 16;

pub type MasterKey = Zeroizing<Vec<u8>>;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Unwrap the footer's master key with the key derived from `passwd`
///
/// Also returns the intermediate key, so the caller can compare it against the stored verifier.
pub fn decrypt_master_key(
    passwd: &str,
    ftr: &CryptFooter,
    keymaster: &dyn Keymaster,
) -> anyhow::Result<(MasterKey, IntermediateKey)> {
    let ikey = kdf::derive_intermediate_key(passwd, ftr, keymaster)?;

    let mut key = Zeroizing::new(ftr.master_key[..KEY_LEN_BYTES].to_vec());
    let decrypted_len = Aes128CbcDec::new_from_slices(&ikey[..KEY_LEN_BYTES], &ikey[KEY_LEN_BYTES..])
        .map_err(|_| anyhow::anyhow!("bad intermediate key length"))?
        .decrypt_padded_mut::<NoPadding>(&mut key)
        .map_err(|_| anyhow::anyhow!("master key is not block aligned"))?
        .len();
    anyhow::ensure!(
        decrypted_len == KEY_LEN_BYTES,
        "decrypted master key is {decrypted_len} bytes, expected {KEY_LEN_BYTES}"
    );

    Ok((key, ikey))
}

/// Wrap `master_key` under `passwd`, storing the result and a fresh verifier in the footer
///
/// The footer's cost factors are first reset to the device's current `params`, and keymaster
/// KDFs get a newly created keymaster key.
pub fn encrypt_master_key(
    passwd: &str,
    master_key: &[u8],
    ftr: &mut CryptFooter,
    params: ScryptParams,
    keymaster: &dyn Keymaster,
) -> anyhow::Result<()> {
    params.apply(ftr);

    match ftr.kdf()? {
        KdfType::Scrypt => (),
        kdf if kdf.uses_keymaster() => {
            ftr.keymaster_blob = keymaster
                .create_key()
                .context("failed to create keymaster key")?;
            debug!("created {}-byte keymaster key blob", ftr.keymaster_blob.len());
        }
        kdf => {
            error!("Invalid kdf_type {kdf:?}");
            anyhow::bail!("cannot encrypt a master key with {kdf:?}");
        }
    }

    let ikey = kdf::derive_intermediate_key(passwd, ftr, keymaster)?;

    anyhow::ensure!(
        master_key.len() >= KEY_LEN_BYTES,
        "master key is only {} bytes",
        master_key.len()
    );
    let mut encrypted = Zeroizing::new(master_key[..KEY_LEN_BYTES].to_vec());
    let encrypted_len = Aes128CbcEnc::new_from_slices(&ikey[..KEY_LEN_BYTES], &ikey[KEY_LEN_BYTES..])
        .map_err(|_| anyhow::anyhow!("bad intermediate key length"))?
        .encrypt_padded_mut::<NoPadding>(&mut encrypted, KEY_LEN_BYTES)
        .map_err(|_| anyhow::anyhow!("master key is not block aligned"))?
        .len();
    anyhow::ensure!(
        encrypted_len == KEY_LEN_BYTES,
        "encrypted master key is {encrypted_len} bytes, expected {KEY_LEN_BYTES}"
    );
    ftr.master_key[..KEY_LEN_BYTES].copy_from_slice(&encrypted);

    let verifier = kdf::intermediate_key_verifier(&ikey[..], &ftr.salt, ftr.scrypt_params())?;
    ftr.scrypted_intermediate_key = *verifier;
    Ok(())
}

/// Does `ikey` match the verifier stored in the footer?
pub fn verify_intermediate_key(ikey: &[u8], ftr: &CryptFooter) -> anyhow::Result<bool> {
    let verifier = kdf::intermediate_key_verifier(ikey, &ftr.salt, ftr.scrypt_params())?;
    Ok(*verifier == ftr.scrypted_intermediate_key)
}

/// Generate a random master key and salt, and store the key wrapped under `passwd`
pub fn create_encrypted_random_key(
    passwd: &str,
    ftr: &mut CryptFooter,
    params: ScryptParams,
    keymaster: &dyn Keymaster,
) -> anyhow::Result<()> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN_BYTES]);
    OsRng.try_fill_bytes(&mut key)?;
    OsRng.try_fill_bytes(&mut ftr.salt)?;

    encrypt_master_key(passwd, &key, ftr, params, keymaster)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kdf::{NoKeymaster, SimKeymaster};

    const FAST: ScryptParams = ScryptParams {
        n_factor: 4,
        r_factor: 0,
        p_factor: 0,
    };

    fn footer(kdf: KdfType) -> CryptFooter {
        CryptFooter::new(kdf, FAST, None)
    }

    #[test]
    fn master_key_round_trip() -> anyhow::Result<()> {
        let master_key = *b"sixteen byte key";
        let mut ftr = footer(KdfType::Scrypt);
        ftr.salt = [3; 16];

        encrypt_master_key("70617373", &master_key, &mut ftr, FAST, &NoKeymaster)?;
        assert_ne!(ftr.master_key[..16], master_key);

        let (decrypted, ikey) = decrypt_master_key("70617373", &ftr, &NoKeymaster)?;
        assert_eq!(decrypted[..], master_key);
        assert!(verify_intermediate_key(&ikey[..], &ftr)?);

        // A wrong password "decrypts" to garbage, which the verifier catches
        let (garbage, wrong_ikey) = decrypt_master_key("70617374", &ftr, &NoKeymaster)?;
        assert_ne!(garbage[..], master_key);
        assert!(!verify_intermediate_key(&wrong_ikey[..], &ftr)?);
        Ok(())
    }

    #[test]
    fn random_keys_with_keymaster() -> anyhow::Result<()> {
        let keymaster = SimKeymaster::new([7; 32]);
        let mut ftr = footer(KdfType::ScryptKeymaster);

        create_encrypted_random_key("31323334", &mut ftr, FAST, &keymaster)?;
        assert_ne!(ftr.salt, [0; 16]);
        assert!(!ftr.keymaster_blob.is_empty());

        let (_, ikey) = decrypt_master_key("31323334", &ftr, &keymaster)?;
        assert!(verify_intermediate_key(&ikey[..], &ftr)?);

        let mut other = footer(KdfType::ScryptKeymaster);
        create_encrypted_random_key("31323334", &mut other, FAST, &keymaster)?;
        assert_ne!(other.master_key, ftr.master_key);
        Ok(())
    }

    #[test]
    fn encrypt_resets_cost_factors() -> anyhow::Result<()> {
        let mut ftr = footer(KdfType::Scrypt);
        ftr.n_factor = 20;
        encrypt_master_key("00", &[0; 16], &mut ftr, FAST, &NoKeymaster)?;
        assert_eq!(ftr.scrypt_params(), FAST);
        Ok(())
    }

    #[test]
    fn pbkdf2_cannot_wrap_new_keys() {
        let mut ftr = footer(KdfType::Pbkdf2);
        assert!(encrypt_master_key("00", &[0; 16], &mut ftr, FAST, &NoKeymaster).is_err());

        let mut ftr = footer(KdfType::ScryptKeymaster);
        assert!(encrypt_master_key("00", &[0; 16], &mut ftr, FAST, &NoKeymaster).is_err());
    }
}

//! Key derivation: turning a password into the intermediate key and IV that unwrap the master
//! key.
//!
//! Three families are supported, selected by the footer's `kdf_type`: PBKDF2-HMAC-SHA1,
//! scrypt, and scrypt with a hardware keymaster signature folded in between two scrypt passes.
//! Passwords arrive as hex text and are decoded to raw bytes before use.

use std::str::FromStr;

use anyhow::Context;
use log::{info, warn};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::{IV_LEN_BYTES, KEY_LEN_BYTES};
use crate::error::CryptfsError;
use crate::footer::{CryptFooter, SALT_LEN, SCRYPT_LEN};
use crate::props::{self, Properties};

/// PBKDF2 iteration count
pub const HASH_COUNT: u32 = 2000;

/// Size of the message handed to the keymaster for signing
pub const RSA_KEY_SIZE_BYTES: usize = 256;

/// Intermediate key followed by IV
pub type IntermediateKey = Zeroizing<[u8; KEY_LEN_BYTES + IV_LEN_BYTES]>;

/// The key derivation function recorded in a footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfType {
    Pbkdf2,
    Scrypt,

    /// Keymaster variant that signed the bare 32-byte object
    ScryptKeymasterUnpadded,

    /// Keymaster variant that left-aligned the object in the signed block
    ScryptKeymasterBadlyPadded,

    /// Keymaster variant that keeps the most significant byte of the signed block zero
    ScryptKeymaster,
}

impl KdfType {
    pub fn uses_keymaster(self) -> bool {
        matches!(
            self,
            Self::ScryptKeymasterUnpadded | Self::ScryptKeymasterBadlyPadded | Self::ScryptKeymaster
        )
    }
}

impl From<KdfType> for u8 {
    fn from(value: KdfType) -> Self {
        match value {
            KdfType::Pbkdf2 => 1,
            KdfType::Scrypt => 2,
            KdfType::ScryptKeymasterUnpadded => 3,
            KdfType::ScryptKeymasterBadlyPadded => 4,
            KdfType::ScryptKeymaster => 5,
        }
    }
}

impl TryFrom<u8> for KdfType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Self::Pbkdf2),
            2 => Ok(Self::Scrypt),
            3 => Ok(Self::ScryptKeymasterUnpadded),
            4 => Ok(Self::ScryptKeymasterBadlyPadded),
            5 => Ok(Self::ScryptKeymaster),
            _ => anyhow::bail!("invalid kdf_type {value}"),
        }
    }
}

/// scrypt cost factors, each stored as a power-of-two exponent
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScryptParams {
    pub n_factor: u8,
    pub r_factor: u8,
    pub p_factor: u8,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            n_factor: 15,
            r_factor: 3,
            p_factor: 1,
        }
    }
}

/// Parse strings like "N:r:p"
impl FromStr for ScryptParams {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [n, r, p]: [&str; 3] = s
            .split(':')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #:#:#"))?;

        Ok(Self {
            n_factor: n.trim().parse()?,
            r_factor: r.trim().parse()?,
            p_factor: p.trim().parse()?,
        })
    }
}

impl ScryptParams {
    /// The device's configured factors, falling back to the defaults if the property is bad
    pub fn from_properties(props: &dyn Properties) -> Self {
        match props.get(props::CRYPTO_SCRYPT_PARAMS) {
            None => Self::default(),
            Some(value) => value.parse().unwrap_or_else(|e| {
                warn!("bad scrypt parameters `{value}` ({e}); using defaults");
                Self::default()
            }),
        }
    }

    pub fn apply(self, ftr: &mut CryptFooter) {
        ftr.n_factor = self.n_factor;
        ftr.r_factor = self.r_factor;
        ftr.p_factor = self.p_factor;
    }

    fn to_params(self, len: usize) -> anyhow::Result<::scrypt::Params> {
        let r = 1u32
            .checked_shl(self.r_factor.into())
            .context("scrypt r factor too large")?;
        let p = 1u32
            .checked_shl(self.p_factor.into())
            .context("scrypt p factor too large")?;
        ::scrypt::Params::new(self.n_factor, r, p, len)
            .map_err(|_| anyhow::anyhow!("invalid scrypt parameters {:?}", self))
    }
}

/// scrypt with N, r, p given as exponents
pub fn scrypt(
    password: &[u8],
    salt: &[u8],
    params: ScryptParams,
    out: &mut [u8],
) -> anyhow::Result<()> {
    let params = params.to_params(out.len())?;
    ::scrypt::scrypt(password, salt, &params, out)
        .map_err(|_| anyhow::anyhow!("scrypt output length {} rejected", out.len()))
}

/// Hex-decode a password
pub fn decode_password(passwd: &str) -> Result<Zeroizing<Vec<u8>>, CryptfsError> {
    hex::decode(passwd)
        .map(Zeroizing::new)
        .map_err(|_| CryptfsError::BadPasswordEncoding)
}

/// A hardware-backed signing service that binds key derivation to one device
pub trait Keymaster {
    /// Can this keymaster be used for disk encryption?
    fn is_compatible(&self) -> bool;

    /// Generate a new signing key, returning its opaque blob
    fn create_key(&self) -> anyhow::Result<Vec<u8>>;

    /// Sign `message` (at most [`RSA_KEY_SIZE_BYTES`]) with the key in `key_blob`
    fn sign(&self, key_blob: &[u8], message: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Used when no keymaster HAL is available
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeymaster;

impl Keymaster for NoKeymaster {
    fn is_compatible(&self) -> bool {
        false
    }

    fn create_key(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no keymaster available")
    }

    fn sign(&self, _key_blob: &[u8], _message: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no keymaster available")
    }
}

/// A software keymaster with a fixed device secret, for testing purposes
///
/// Key blobs carry a tag derived from the secret, so a blob created by one `SimKeymaster` cannot
/// be used with another, like a real device's keymaster.
#[derive(Debug, Clone)]
pub struct SimKeymaster {
    secret: [u8; 32],
}

impl SimKeymaster {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    fn tag(&self, nonce: &[u8]) -> [u8; 16] {
        let digest = Sha256::new()
            .chain_update(self.secret)
            .chain_update(b"blob")
            .chain_update(nonce)
            .finalize();
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&digest[..16]);
        tag
    }
}

impl Keymaster for SimKeymaster {
    fn is_compatible(&self) -> bool {
        true
    }

    fn create_key(&self) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; 16];
        OsRng.try_fill_bytes(&mut nonce)?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&self.tag(&nonce));
        Ok(blob)
    }

    fn sign(&self, key_blob: &[u8], message: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(key_blob.len() == 32, "malformed key blob");
        anyhow::ensure!(
            key_blob[16..] == self.tag(&key_blob[..16]),
            "key blob belongs to another keymaster"
        );
        anyhow::ensure!(message.len() <= RSA_KEY_SIZE_BYTES, "message too long");

        let mut signature = Vec::with_capacity(RSA_KEY_SIZE_BYTES);
        for block in 0u8..(RSA_KEY_SIZE_BYTES / 32) as u8 {
            let digest = Sha256::new()
                .chain_update(self.secret)
                .chain_update(key_blob)
                .chain_update(message)
                .chain_update([block])
                .finalize();
            signature.extend_from_slice(&digest);
        }
        Ok(signature)
    }
}

/// Lay out the object to sign according to the historical padding of each keymaster variant
fn keymaster_message(kdf: KdfType, object: &[u8]) -> Zeroizing<Vec<u8>> {
    let message = match kdf {
        KdfType::ScryptKeymasterUnpadded => object.to_vec(),
        KdfType::ScryptKeymasterBadlyPadded => {
            let mut message = vec![0u8; RSA_KEY_SIZE_BYTES];
            let len = object.len().min(RSA_KEY_SIZE_BYTES);
            message[..len].copy_from_slice(&object[..len]);
            message
        }
        _ => {
            let mut message = vec![0u8; RSA_KEY_SIZE_BYTES];
            let len = object.len().min(RSA_KEY_SIZE_BYTES - 1);
            message[1..][..len].copy_from_slice(&object[..len]);
            message
        }
    };
    Zeroizing::new(message)
}

fn scrypt_keymaster(
    passwd: &str,
    ftr: &CryptFooter,
    kdf: KdfType,
    keymaster: &dyn Keymaster,
) -> anyhow::Result<IntermediateKey> {
    info!("Using scrypt with keymaster for cryptfs KDF");
    let params = ftr.scrypt_params();

    let password = match decode_password(passwd) {
        Ok(password) => password,
        Err(_) => {
            info!("Failed to convert passwd from hex, using passwd instead");
            Zeroizing::new(passwd.as_bytes().to_vec())
        }
    };

    let mut ikey: IntermediateKey = Zeroizing::new([0; KEY_LEN_BYTES + IV_LEN_BYTES]);
    scrypt(&password, &ftr.salt, params, &mut ikey[..])?;

    let message = keymaster_message(kdf, &ikey[..]);
    let signature = Zeroizing::new(
        keymaster
            .sign(&ftr.keymaster_blob, &message)
            .context("keymaster signing failed")?,
    );

    scrypt(&signature, &ftr.salt, params, &mut ikey[..])?;
    Ok(ikey)
}

/// Derive the intermediate key and IV for `passwd` with the footer's KDF, salt and cost factors
pub fn derive_intermediate_key(
    passwd: &str,
    ftr: &CryptFooter,
    keymaster: &dyn Keymaster,
) -> anyhow::Result<IntermediateKey> {
    let kdf = ftr.kdf()?;
    if kdf.uses_keymaster() {
        return scrypt_keymaster(passwd, ftr, kdf, keymaster);
    }

    let password = decode_password(passwd)?;
    let mut ikey: IntermediateKey = Zeroizing::new([0; KEY_LEN_BYTES + IV_LEN_BYTES]);
    match kdf {
        KdfType::Pbkdf2 => {
            info!("Using pbkdf2 for cryptfs KDF");
            pbkdf2::pbkdf2_hmac::<Sha1>(&password, &ftr.salt, HASH_COUNT, &mut ikey[..]);
        }
        _ => {
            info!("Using scrypt for cryptfs KDF");
            scrypt(&password, &ftr.salt, ftr.scrypt_params(), &mut ikey[..])?;
        }
    }
    Ok(ikey)
}

/// The verifier stored in `scrypted_intermediate_key`: scrypt over the intermediate key alone
pub fn intermediate_key_verifier(
    ikey: &[u8],
    salt: &[u8; SALT_LEN],
    params: ScryptParams,
) -> anyhow::Result<Zeroizing<[u8; SCRYPT_LEN]>> {
    let mut out = Zeroizing::new([0u8; SCRYPT_LEN]);
    scrypt(&ikey[..KEY_LEN_BYTES], salt, params, &mut out[..])?;
    Ok(out)
}

//! Errors that callers of the password lifecycle need to tell apart.

use std::io;

use thiserror::Error;

use crate::persist::FieldError;

#[derive(Error, Debug)]
pub enum CryptfsError {
    #[error("userdata is not encrypted")]
    NotEncrypted,
    #[error("no master key has been saved in this session")]
    KeyNotSaved,
    #[error("no mount point has been saved in this session")]
    NoMountPoint,
    #[error("enabling encryption is disabled in this build")]
    EnableDisabled,
    #[error("footer writes are disabled")]
    FooterWritesDisabled,
    #[error("cannot resume encryption: first block does not match the recorded hash")]
    ResumeRefused,
    #[error("password is not valid hex")]
    BadPasswordEncoding,
    #[error("invalid crypt type {0}")]
    BadCryptType(u32),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CryptfsError {
    /// The status code reported by the password entry points
    pub fn error_code(&self) -> i32 {
        match self {
            CryptfsError::NotEncrypted => -2,
            _ => -1,
        }
    }

    /// The status code reported by `getfield`
    pub fn getfield_code(&self) -> i32 {
        match self {
            CryptfsError::Field(FieldError::NoField) => -1,
            CryptfsError::Field(FieldError::BufTooSmall(_)) => -2,
            _ => -3,
        }
    }

    /// The status code reported by `setfield`
    pub fn setfield_code(&self) -> i32 {
        match self {
            CryptfsError::Field(FieldError::FieldTooLong) => -2,
            CryptfsError::Field(FieldError::ValueTooLong) => -3,
            _ => -1,
        }
    }
}

#[test]
fn test_status_codes() {
    assert_eq!(CryptfsError::NotEncrypted.error_code(), -2);
    assert_eq!(CryptfsError::KeyNotSaved.error_code(), -1);
    assert_eq!(CryptfsError::from(FieldError::NoField).getfield_code(), -1);
    assert_eq!(CryptfsError::from(FieldError::BufTooSmall(9)).getfield_code(), -2);
    assert_eq!(CryptfsError::NotEncrypted.getfield_code(), -3);
    assert_eq!(CryptfsError::from(FieldError::FieldTooLong).setfield_code(), -2);
    assert_eq!(CryptfsError::from(FieldError::ValueTooLong).setfield_code(), -3);
    assert_eq!(CryptfsError::KeyNotSaved.setfield_code(), -1);
}

//! Recovery-side support for Android full-disk encryption ("cryptfs").
//!
//! This crate reads and maintains the crypto footer that describes an encrypted userdata
//! partition, derives keys from user passwords, sets up the dm-crypt mapping that exposes the
//! decrypted filesystem, and can convert a plaintext filesystem to ciphertext in place.

pub mod blockdev;
pub mod config;
pub mod crypto;
pub mod cryptfs;
pub mod dm;
pub mod error;
pub mod footer;
pub mod inplace;
pub mod kdf;
pub mod persist;
pub mod platform;
pub mod props;
pub mod util;

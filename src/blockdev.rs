//! Sizing and hashing of block devices (or the regular files standing in for them).

use std::fs::File;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};

/// The unit of every size the kernel and the crypto footer deal in
pub const CRYPT_SECTOR_SIZE: u64 = 512;

/// The unit of filesystem-aware copies, and the size of the block hashed for resume checks
pub const CRYPT_INPLACE_BUFSIZE: usize = 4096;

/// Size of an open device in 512-byte sectors
///
/// Block devices are asked via `BLKGETSIZE`; anything else is sized by its length.
pub fn size_in_sectors(file: &File) -> anyhow::Result<u64> {
    let meta = file.metadata()?;
    if meta.file_type().is_block_device() {
        let mut sectors: nix::libc::c_ulong = 0;
        unsafe {
            ioctl::blkgetsize(std::os::fd::AsRawFd::as_raw_fd(file), &mut sectors)?;
        }
        Ok(sectors as u64)
    } else {
        Ok(meta.len() / CRYPT_SECTOR_SIZE)
    }
}

/// Size of the device at `path` in 512-byte sectors
pub fn path_size_in_sectors<P: AsRef<Path>>(path: P) -> anyhow::Result<u64> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| path.display().to_string())?;
    size_in_sectors(&file)
}

/// Is `path` an existing regular file (as opposed to a device node)?
pub fn is_regular_file<P: AsRef<Path>>(path: P) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

/// SHA-256 over the first 4 KiB of a device
pub fn hash_first_block<P: AsRef<Path>>(path: P) -> anyhow::Result<[u8; 32]> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| path.display().to_string())?;
    let mut block = vec![0u8; CRYPT_INPLACE_BUFSIZE];
    file.read_exact_at(&mut block, 0)
        .with_context(|| format!("reading first block of {}", path.display()))?;
    Ok(Sha256::digest(&block).into())
}

mod ioctl {
    //! The block layer ioctl for querying device size

    use nix::{ioctl_read_bad, libc::c_ulong, request_code_none};

    ioctl_read_bad!(blkgetsize, request_code_none!(0x12, 96), c_ulong);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_file_sizes() -> anyhow::Result<()> {
        let file = tempfile::tempfile()?;
        file.set_len(10 * CRYPT_SECTOR_SIZE + 100)?;
        assert_eq!(size_in_sectors(&file)?, 10);
        Ok(())
    }

    #[test]
    fn first_block_hash_ignores_later_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dev");
        let file = File::create(&path)?;
        file.set_len(8192)?;
        let before = hash_first_block(&path)?;

        file.write_all_at(&[1, 2, 3], 4096)?;
        assert_eq!(hash_first_block(&path)?, before);

        file.write_all_at(&[1, 2, 3], 4093)?;
        assert_ne!(hash_first_block(&path)?, before);

        assert!(is_regular_file(&path));
        assert!(!is_regular_file(dir.path()));
        Ok(())
    }
}

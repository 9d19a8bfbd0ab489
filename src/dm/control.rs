//! Device-mapper implementation over the kernel's control node (`/dev/device-mapper`)

use super::{CryptTarget, DeviceMapper};

use anyhow::{ensure, Context};
use bytes::BufMut;
use log::info;
use retry::{delay::Fixed, retry};

use std::fs::File;
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::util::CStrField;

/// How many times to try loading a table before giving up
pub const TABLE_LOAD_RETRIES: usize = 10;

const DM_BUF_SIZE: usize = 4096;
const DM_TARGET_SPEC_SIZE: usize = 40;

/// A `dm_ioctl` header followed by room for its payload, as one 8-byte-aligned buffer
#[repr(C, align(8))]
struct IoctlBuffer {
    io: ioctl::dm_ioctl,
    payload: [u8; DM_BUF_SIZE - size_of::<ioctl::dm_ioctl>()],
}

impl IoctlBuffer {
    fn new(name: &str) -> anyhow::Result<Box<Self>> {
        // All-integer C structs; zero is a valid value for every field.
        let mut buf: Box<Self> = Box::new(unsafe { std::mem::zeroed() });
        buf.io.version = [4, 0, 0];
        buf.io.data_size = DM_BUF_SIZE as u32;
        buf.io.data_start = size_of::<ioctl::dm_ioctl>() as u32;
        buf.io.name.set_c_str(name)?;
        Ok(buf)
    }

    fn as_mut_ptr(&mut self) -> *mut ioctl::dm_ioctl {
        &mut self.io
    }

    /// Append a single target spec and its parameter string
    fn load_target(&mut self, target_type: &str, length: u64, params: &[u8]) -> anyhow::Result<()> {
        let spec_len = DM_TARGET_SPEC_SIZE + params.len() + 1;
        let aligned = (spec_len + 7) & !7;
        ensure!(aligned <= self.payload.len(), "dm table too large");

        let mut target_name = [0u8; ioctl::DM_MAX_TYPE_NAME];
        target_name.set_c_str(target_type)?;

        let mut out = &mut self.payload[..aligned];
        out.put_u64_ne(0); // sector_start
        out.put_u64_ne(length);
        out.put_i32_ne(0); // status
        out.put_u32_ne(aligned as u32); // next
        out.put_slice(&target_name);
        out.put_slice(params);
        out.put_bytes(0, aligned - spec_len + 1);

        self.io.target_count = 1;
        self.io.data_size = (size_of::<ioctl::dm_ioctl>() + aligned) as u32;
        Ok(())
    }

    /// The bytes the kernel placed at `data_start`
    fn data(&self) -> &[u8] {
        let start = (self.io.data_start as usize).saturating_sub(size_of::<ioctl::dm_ioctl>());
        self.payload.get(start..).unwrap_or(&[])
    }
}

impl Drop for IoctlBuffer {
    fn drop(&mut self) {
        // Table loads leave key material in the payload
        zeroize::Zeroize::zeroize(&mut self.payload[..]);
    }
}

/// Device-mapper reached through its control node
#[derive(Debug)]
pub struct DmControl {
    file: File,
}

impl DmControl {
    /// Open the control node, by path (e.g. "/dev/device-mapper")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Cannot open device-mapper {}", path.display()))?;
        Ok(Self { file })
    }
}

fn ne_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

impl DeviceMapper for DmControl {
    fn crypt_target_version(&self) -> anyhow::Result<Option<[u32; 3]>> {
        let mut buf = IoctlBuffer::new("")?;
        unsafe {
            ioctl::dm_list_versions(self.file.as_raw_fd(), buf.as_mut_ptr())
                .context("Cannot list device-mapper targets")?;
        }

        // A chain of `struct dm_target_versions { next, version[3], name[] }`
        let data = buf.data();
        let mut offset = 0;
        while let Some(next) = ne_u32(data, offset) {
            let name = data.get(offset + 16..).unwrap_or(&[]).c_str();
            if name == "crypt" {
                let version = [
                    ne_u32(data, offset + 4).unwrap_or(0),
                    ne_u32(data, offset + 8).unwrap_or(0),
                    ne_u32(data, offset + 12).unwrap_or(0),
                ];
                return Ok(Some(version));
            }
            if next == 0 {
                break;
            }
            offset += next as usize;
        }

        Ok(None)
    }

    fn create_crypto_dev(&self, name: &str, target: &CryptTarget) -> anyhow::Result<PathBuf> {
        let fd = self.file.as_raw_fd();

        let mut buf = IoctlBuffer::new(name)?;
        unsafe {
            ioctl::dm_dev_create(fd, buf.as_mut_ptr()).context("Cannot create dm-crypt device")?;
        }

        let mut buf = IoctlBuffer::new(name)?;
        unsafe {
            ioctl::dm_dev_status(fd, buf.as_mut_ptr())
                .context("Cannot retrieve dm-crypt device status")?;
        }
        let dev = buf.io.dev;
        let minor = (dev & 0xff) | ((dev >> 12) & 0xfff00);
        let path = PathBuf::from(format!("/dev/block/dm-{minor}"));

        let mut buf = IoctlBuffer::new(name)?;
        buf.load_target("crypt", target.length, target.params().as_bytes())?;
        let mut tries = 0;
        retry(Fixed::from_millis(500).take(TABLE_LOAD_RETRIES - 1), || {
            tries += 1;
            unsafe { ioctl::dm_table_load(fd, buf.as_mut_ptr()) }
        })
        .context("Cannot load dm-crypt mapping table.")?;
        if tries > 1 {
            info!("Took {tries} tries to load dmcrypt table.");
        }

        // Resuming the device is what activates the loaded table
        let mut buf = IoctlBuffer::new(name)?;
        unsafe {
            ioctl::dm_dev_suspend(fd, buf.as_mut_ptr()).context("Cannot resume the dm-crypt device")?;
        }

        Ok(path)
    }

    fn delete_crypto_dev(&self, name: &str) -> anyhow::Result<()> {
        let mut buf = IoctlBuffer::new(name)?;
        unsafe {
            ioctl::dm_dev_remove(self.file.as_raw_fd(), buf.as_mut_ptr())
                .context("Cannot remove dm-crypt device")?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for talking to the device-mapper

    use nix::ioctl_readwrite;

    const DM_IOCTL: u8 = 0xfd;
    pub const DM_MAX_TYPE_NAME: usize = 16;
    const DM_NAME_LEN: usize = 128;
    const DM_UUID_LEN: usize = 129;

    #[repr(C)]
    pub struct dm_ioctl {
        pub version: [u32; 3],
        pub data_size: u32,
        pub data_start: u32,
        pub target_count: u32,
        pub open_count: i32,
        pub flags: u32,
        pub event_nr: u32,
        pub padding: u32,
        pub dev: u64,
        pub name: [u8; DM_NAME_LEN],
        pub uuid: [u8; DM_UUID_LEN],
        pub data: [u8; 7],
    }

    ioctl_readwrite!(dm_dev_create, DM_IOCTL, 3, dm_ioctl);
    ioctl_readwrite!(dm_dev_remove, DM_IOCTL, 4, dm_ioctl);
    ioctl_readwrite!(dm_dev_suspend, DM_IOCTL, 6, dm_ioctl);
    ioctl_readwrite!(dm_dev_status, DM_IOCTL, 7, dm_ioctl);
    ioctl_readwrite!(dm_table_load, DM_IOCTL, 9, dm_ioctl);
    ioctl_readwrite!(dm_list_versions, DM_IOCTL, 13, dm_ioctl);
}

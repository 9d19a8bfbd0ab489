//! Little-endian integer and NUL-terminated string accessors for on-disk records.

use anyhow::ensure;

/// Accessors for little-endian integers embedded in on-disk structures
pub trait LeFields {
    /// Read a `u16` at byte offset `off`
    fn le_u16_at(&self, off: usize) -> anyhow::Result<u16>;

    /// Read a `u32` at byte offset `off`
    fn le_u32_at(&self, off: usize) -> anyhow::Result<u32>;

    /// Read a `u64` at byte offset `off`
    fn le_u64_at(&self, off: usize) -> anyhow::Result<u64>;
}

impl LeFields for [u8] {
    fn le_u16_at(&self, off: usize) -> anyhow::Result<u16> {
        Ok(u16::from_le_bytes(field(self, off)?))
    }

    fn le_u32_at(&self, off: usize) -> anyhow::Result<u32> {
        Ok(u32::from_le_bytes(field(self, off)?))
    }

    fn le_u64_at(&self, off: usize) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(field(self, off)?))
    }
}

fn field<const N: usize>(buf: &[u8], off: usize) -> anyhow::Result<[u8; N]> {
    let bytes = off
        .checked_add(N)
        .and_then(|end| buf.get(off..end))
        .ok_or(anyhow::anyhow!("field at {off} runs past end of {}-byte buffer", buf.len()))?;
    Ok(bytes.try_into()?)
}

/// Fixed-width, NUL-padded string fields as found in C structs
pub trait CStrField {
    /// The text up to (not including) the first NUL, lossily decoded
    fn c_str(&self) -> String;

    /// Store `s` NUL-terminated, clearing the remainder of the field
    fn set_c_str(&mut self, s: &str) -> anyhow::Result<()>;
}

impl CStrField for [u8] {
    fn c_str(&self) -> String {
        let end = self.iter().position(|&b| b == 0).unwrap_or(self.len());
        String::from_utf8_lossy(&self[..end]).into_owned()
    }

    fn set_c_str(&mut self, s: &str) -> anyhow::Result<()> {
        ensure!(
            s.len() < self.len(),
            "string of {} bytes does not fit a {}-byte field",
            s.len(),
            self.len()
        );
        self.fill(0);
        self[..s.len()].copy_from_slice(s.as_bytes());
        Ok(())
    }
}

#[test]
fn test_le_fields() -> anyhow::Result<()> {
    let buf = [0x34, 0x12, 0x78, 0x56, 0xF0, 0xDE, 0xBC, 0x9A, 0x01];
    assert_eq!(buf.le_u16_at(0)?, 0x1234);
    assert_eq!(buf.le_u32_at(0)?, 0x56781234);
    assert_eq!(buf.le_u64_at(1)?, 0x019ABCDEF0567812);
    assert!(buf.le_u32_at(6).is_err());
    assert!(buf.le_u16_at(usize::MAX).is_err());
    Ok(())
}

#[test]
fn test_c_str_field() -> anyhow::Result<()> {
    let mut name = [0xFFu8; 8];
    name.set_c_str("aes")?;
    assert_eq!(name, *b"aes\0\0\0\0\0");
    assert_eq!(name.c_str(), "aes");
    assert!(name.set_c_str("eightchr").is_err());
    assert_eq!([b'x'; 4].c_str(), "xxxx");
    Ok(())
}

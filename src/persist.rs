//! The persistent data table: a small key/value store kept next to the crypto footer.
//!
//! Two slots are reserved for it. At most one carries the magic at any time; a save writes the
//! other slot, syncs, and only then erases the previous copy, so an interrupted save always
//! leaves one complete table behind.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{ensure, Context};
use bytes::{Buf, BufMut};
use log::{error, info};
use thiserror::Error;

use crate::footer::{CryptFooter, CRYPT_FOOTER_OFFSET, CRYPT_FOOTER_TO_PERSIST_OFFSET};
use crate::util::CStrField;

pub use crate::footer::CRYPT_PERSIST_DATA_SIZE;

pub const PERSIST_DATA_MAGIC: u32 = 0xE950CD44;

/// Longest key, including its NUL
pub const PROPERTY_KEY_MAX: usize = 32;
/// Longest value, including its NUL
pub const PROPERTY_VALUE_MAX: usize = 92;

const HEADER_SIZE: usize = 128;
const ENTRY_SIZE: usize = PROPERTY_KEY_MAX + PROPERTY_VALUE_MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    #[error("no such field")]
    NoField,
    #[error("value does not fit in {0} bytes")]
    BufTooSmall(usize),
    #[error("field name too long")]
    FieldTooLong,
    #[error("value too long for the remaining space")]
    ValueTooLong,
    #[error("persistent data table is full")]
    TableFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistEntry {
    pub key: String,
    pub value: String,
}

/// An in-memory copy of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistData {
    size: u32,
    entries: Vec<PersistEntry>,
}

impl Default for PersistData {
    fn default() -> Self {
        Self::new(CRYPT_PERSIST_DATA_SIZE)
    }
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a char boundary
fn truncated(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Split `value` into pieces that each fit one entry; an empty value still takes one
fn chunks(mut value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    loop {
        let part = truncated(value, PROPERTY_VALUE_MAX - 1);
        parts.push(part);
        value = &value[part.len()..];
        if value.is_empty() {
            return parts;
        }
    }
}

/// Is `key` part `index` or later of the multi-entry field `field`?
///
/// Parts after the first are stored as `field_1`, `field_2`, ... A key whose text after the
/// last `_` is not a number is a plain name at index 0.
pub fn match_multi_entry(key: &str, field: &str, index: usize) -> bool {
    let (parsed_field, parsed_index) = match key.rsplit_once('_') {
        Some((name, suffix)) => match suffix.parse::<usize>() {
            Ok(n) => (name, n),
            Err(_) => (key, 0),
        },
        None => (key, 0),
    };
    parsed_field == field && parsed_index >= index
}

impl PersistData {
    /// An empty table for a slot of `size` bytes
    pub fn new(size: u32) -> Self {
        Self {
            size,
            entries: Vec::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn max_entries(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE) / ENTRY_SIZE
    }

    pub fn entries(&self) -> &[PersistEntry] {
        &self.entries
    }

    /// Parse a slot; `None` if it does not carry the magic
    pub fn decode(buf: &[u8]) -> anyhow::Result<Option<Self>> {
        ensure!(buf.len() >= HEADER_SIZE, "persistent data slot too small");
        let mut header = &buf[..HEADER_SIZE];
        if header.get_u32_le() != PERSIST_DATA_MAGIC {
            return Ok(None);
        }
        let valid = header.get_u32_le() as usize;

        let mut data = Self::new(buf.len() as u32);
        ensure!(
            valid <= data.max_entries(),
            "persistent data claims {valid} entries, room for {}",
            data.max_entries()
        );

        for raw in buf[HEADER_SIZE..].chunks_exact(ENTRY_SIZE).take(valid) {
            let (key, value) = raw.split_at(PROPERTY_KEY_MAX);
            data.entries.push(PersistEntry {
                key: key.c_str(),
                value: value.c_str(),
            });
        }
        Ok(Some(data))
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        buf.put_u32_le(PERSIST_DATA_MAGIC);
        buf.put_u32_le(self.entries.len() as u32);
        buf.put_bytes(0, HEADER_SIZE - 8);

        for entry in &self.entries {
            let mut raw = [0u8; ENTRY_SIZE];
            let (key, value) = raw.split_at_mut(PROPERTY_KEY_MAX);
            key.set_c_str(&entry.key)?;
            value.set_c_str(&entry.value)?;
            buf.put_slice(&raw);
        }

        ensure!(
            buf.len() <= self.size as usize,
            "{} entries overflow a {}-byte slot",
            self.entries.len(),
            self.size
        );
        buf.resize(self.size as usize, 0);
        Ok(buf)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Set a single entry, replacing an existing one or appending if there is room
    ///
    /// Keys and values are cut to what an entry can hold.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), FieldError> {
        let key = truncated(key, PROPERTY_KEY_MAX - 1);
        let value = truncated(value, PROPERTY_VALUE_MAX - 1);

        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.value = value.to_owned();
            return Ok(());
        }

        if self.entries.len() >= self.max_entries() {
            return Err(FieldError::TableFull);
        }
        self.entries.push(PersistEntry {
            key: key.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    /// Remove parts `index` onward of a multi-entry field; false if none existed
    pub fn del_keys(&mut self, field: &str, index: usize) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !match_multi_entry(&e.key, field, index));
        self.entries.len() < before
    }

    /// Number of entries holding parts of `field`
    pub fn count_keys(&self, field: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| match_multi_entry(&e.key, field, 0))
            .count()
    }

    /// Read a field, joining its parts; the result must be shorter than `max_len`
    pub fn getfield(&self, field: &str, max_len: usize) -> Result<String, FieldError> {
        let mut value = self.get(field).ok_or(FieldError::NoField)?.to_owned();
        if value.len() >= max_len {
            return Err(FieldError::BufTooSmall(max_len));
        }

        for i in 1.. {
            let part_key = format!("{field}_{i}");
            if part_key.len() >= PROPERTY_KEY_MAX {
                break;
            }
            let Some(part) = self.get(&part_key) else {
                break;
            };
            value.push_str(part);
            if value.len() >= max_len {
                return Err(FieldError::BufTooSmall(max_len));
            }
        }

        Ok(value)
    }

    /// Store a field, splitting long values across several entries
    ///
    /// Nothing is changed if the value cannot be stored in full.
    pub fn setfield(&mut self, field: &str, value: &str) -> Result<(), FieldError> {
        let parts = chunks(value);

        let longest_key = match parts.len() {
            1 => field.len(),
            n => format!("{field}_{}", n - 1).len(),
        };
        if longest_key > PROPERTY_KEY_MAX - 1 {
            return Err(FieldError::FieldTooLong);
        }

        if self.entries.len() + parts.len() - self.count_keys(field) > self.max_entries() {
            return Err(FieldError::ValueTooLong);
        }

        self.del_keys(field, 0);
        for (i, part) in parts.iter().enumerate() {
            let key = match i {
                0 => field.to_owned(),
                i => format!("{field}_{i}"),
            };
            self.set(&key, part)?;
        }
        Ok(())
    }
}

/// Check that the footer's two slots are ordered, disjoint, and inside the footer region
pub fn validate_offsets(ftr: &CryptFooter) -> anyhow::Result<()> {
    let [first, second] = ftr.persist_data_offset;
    let size = ftr.persist_data_size as u64;

    let first_end = first
        .checked_add(size)
        .context("Crypt_ftr persist data region 0 is out of range")?;
    ensure!(first_end <= second, "Crypt_ftr persist data regions overlap");
    ensure!(first < second, "Crypt_ftr persist data region 0 starts after region 1");

    let region_start = first
        .checked_sub(CRYPT_FOOTER_TO_PERSIST_OFFSET)
        .context("Persistent data starts before crypto footer")?;
    let region_end = second
        .checked_add(size)
        .context("Crypt_ftr persist data region 1 is out of range")?;
    ensure!(
        region_end - region_start <= CRYPT_FOOTER_OFFSET,
        "Persistent data extends past crypto footer"
    );
    Ok(())
}

fn check_footer(ftr: &CryptFooter) -> anyhow::Result<()> {
    ensure!(
        ftr.major_version > 1 || (ftr.major_version == 1 && ftr.minor_version >= 1),
        "Crypt_ftr version doesn't support persistent data"
    );
    validate_offsets(ftr)
}

fn read_slot(file: &File, offset: u64, size: u32) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    file.read_exact_at(&mut buf, offset)
        .with_context(|| format!("reading persistent data at {offset:#x}"))?;
    Ok(buf)
}

fn write_slot(file: &File, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
    file.write_all_at(buf, offset)
        .with_context(|| format!("writing persistent data at {offset:#x}"))?;
    file.sync_data()?;
    Ok(())
}

/// Load the current table from `path` (the file holding the footer)
///
/// Only meaningful on an encrypted device. A region with no valid copy yields an empty table.
pub fn load(ftr: &CryptFooter, path: &Path) -> anyhow::Result<PersistData> {
    check_footer(ftr)?;

    let file = File::open(path)
        .with_context(|| format!("Cannot open {} metadata file", path.display()))?;

    for (i, &offset) in ftr.persist_data_offset.iter().enumerate() {
        let buf = read_slot(&file, offset, ftr.persist_data_size)
            .with_context(|| format!("Error reading persistent data on iteration {i}"))?;
        if let Some(data) = PersistData::decode(&buf)? {
            return Ok(data);
        }
    }

    info!("Could not find valid persistent data, creating");
    Ok(PersistData::new(ftr.persist_data_size))
}

/// Write `data` to the stale slot, then erase the previously valid one
pub fn save(ftr: &CryptFooter, path: &Path, data: &PersistData) -> anyhow::Result<()> {
    check_footer(ftr)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Cannot open {} metadata file", path.display()))?;

    let [first, second] = ftr.persist_data_offset;
    let current = read_slot(&file, first, ftr.persist_data_size)?;
    // Whichever slot is not current gets the new copy
    let magic = PERSIST_DATA_MAGIC.to_le_bytes();
    let (write_offset, erase_offset) = if current.get(..4) == Some(&magic[..]) {
        (second, first)
    } else {
        (first, second)
    };

    let mut encoded = data.encode()?;
    encoded.resize(ftr.persist_data_size as usize, 0);
    if let Err(e) = write_slot(&file, write_offset, &encoded) {
        error!("Cannot write persistent data: {e:#}");
        return Err(e);
    }

    write_slot(&file, erase_offset, &vec![0u8; ftr.persist_data_size as usize])
        .context("Cannot erase previous persistent data")?;
    Ok(())
}

/// Lay out a fresh region: slot 0 zeroed, slot 1 a valid empty table
pub fn init_region(ftr: &CryptFooter, path: &Path) -> anyhow::Result<()> {
    check_footer(ftr)?;

    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Cannot open {} metadata file", path.display()))?;

    let [first, second] = ftr.persist_data_offset;
    write_slot(&file, first, &vec![0u8; ftr.persist_data_size as usize])?;
    write_slot(&file, second, &PersistData::new(ftr.persist_data_size).encode()?)?;
    Ok(())
}

//! Encrypting ext4 in place, copying only the blocks the block bitmaps mark as in use

use std::cmp::min;
use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{ensure, Context};
use log::{debug, info};

use super::{
    Copier, InplaceContext, InplaceError, InplaceOutcome, Progress, BLOCKS_AT_A_TIME,
};
use crate::blockdev::{size_in_sectors, CRYPT_SECTOR_SIZE};
use crate::util::LeFields;

const EXT4_SUPER_OFFSET: u64 = 1024;
const EXT4_SUPER_SIZE: usize = 1024;
const EXT4_SUPER_MAGIC: u16 = 0xEF53;

const EXT4_SUPER_POS_BLOCKS_COUNT_LO: usize = 4;
const EXT4_SUPER_POS_FIRST_DATA_BLOCK: usize = 20;
const EXT4_SUPER_POS_LOG_BLOCK_SIZE: usize = 24;
const EXT4_SUPER_POS_BLOCKS_PER_GROUP: usize = 32;
const EXT4_SUPER_POS_MAGIC: usize = 56;
const EXT4_SUPER_POS_FEATURE_INCOMPAT: usize = 96;
const EXT4_SUPER_POS_DESC_SIZE: usize = 254;
const EXT4_SUPER_POS_BLOCKS_COUNT_HI: usize = 336;

const EXT4_FEATURE_INCOMPAT_64BIT: u32 = 0x80;
const EXT4_MIN_DESC_SIZE: usize = 32;
const EXT4_MIN_DESC_SIZE_64BIT: usize = 64;
const EXT4_MAX_LOG_BLOCK_SIZE: u32 = 6;

const EXT4_BG_POS_BLOCK_BITMAP_LO: usize = 0;
const EXT4_BG_POS_FREE_BLOCKS_COUNT_LO: usize = 12;
const EXT4_BG_POS_FLAGS: usize = 18;
const EXT4_BG_POS_BLOCK_BITMAP_HI: usize = 0x20;
const EXT4_BG_POS_FREE_BLOCKS_COUNT_HI: usize = 0x2C;

const EXT4_BG_BLOCK_UNINIT: u16 = 0x2;

/// The parts of a block group descriptor that matter here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDesc {
    pub block_bitmap: u64,
    pub free_blocks: u32,
    pub flags: u16,
}

impl GroupDesc {
    fn parse(raw: &[u8], wide: bool) -> anyhow::Result<Self> {
        let mut block_bitmap = u64::from(raw.le_u32_at(EXT4_BG_POS_BLOCK_BITMAP_LO)?);
        let mut free_blocks = u32::from(raw.le_u16_at(EXT4_BG_POS_FREE_BLOCKS_COUNT_LO)?);
        if wide {
            block_bitmap |= u64::from(raw.le_u32_at(EXT4_BG_POS_BLOCK_BITMAP_HI)?) << 32;
            free_blocks |= u32::from(raw.le_u16_at(EXT4_BG_POS_FREE_BLOCKS_COUNT_HI)?) << 16;
        }
        Ok(Self {
            block_bitmap,
            free_blocks,
            flags: raw.le_u16_at(EXT4_BG_POS_FLAGS)?,
        })
    }

    /// The group's bitmap was never initialized: nothing in it is allocated
    pub fn uninit(&self) -> bool {
        self.flags & EXT4_BG_BLOCK_UNINIT != 0
    }
}

/// Geometry and allocation summary of an ext4 filesystem
#[derive(Debug, Clone)]
pub struct Ext4Info {
    pub block_size: u64,
    pub blocks_count: u64,
    pub first_data_block: u64,
    pub blocks_per_group: u64,
    pub groups: Vec<GroupDesc>,
}

impl Ext4Info {
    /// Read the superblock and group descriptor table
    pub fn read(file: &File) -> anyhow::Result<Self> {
        let mut sb = [0u8; EXT4_SUPER_SIZE];
        file.read_exact_at(&mut sb, EXT4_SUPER_OFFSET)
            .context("cannot read ext4 superblock")?;

        let magic = sb.le_u16_at(EXT4_SUPER_POS_MAGIC)?;
        ensure!(magic == EXT4_SUPER_MAGIC, "bad ext4 magic {magic:#06x}");

        let log_block_size = sb.le_u32_at(EXT4_SUPER_POS_LOG_BLOCK_SIZE)?;
        ensure!(
            log_block_size <= EXT4_MAX_LOG_BLOCK_SIZE,
            "implausible ext4 block size shift {log_block_size}"
        );
        let block_size = 1024u64 << log_block_size;

        let wide = sb.le_u32_at(EXT4_SUPER_POS_FEATURE_INCOMPAT)? & EXT4_FEATURE_INCOMPAT_64BIT != 0;
        let mut blocks_count = u64::from(sb.le_u32_at(EXT4_SUPER_POS_BLOCKS_COUNT_LO)?);
        let desc_size = if wide {
            blocks_count |= u64::from(sb.le_u32_at(EXT4_SUPER_POS_BLOCKS_COUNT_HI)?) << 32;
            usize::from(sb.le_u16_at(EXT4_SUPER_POS_DESC_SIZE)?)
        } else {
            EXT4_MIN_DESC_SIZE
        };
        ensure!(
            !wide || desc_size >= EXT4_MIN_DESC_SIZE_64BIT,
            "bad ext4 group descriptor size {desc_size}"
        );

        let first_data_block = u64::from(sb.le_u32_at(EXT4_SUPER_POS_FIRST_DATA_BLOCK)?);
        let blocks_per_group = u64::from(sb.le_u32_at(EXT4_SUPER_POS_BLOCKS_PER_GROUP)?);
        ensure!(blocks_per_group > 0, "ext4 superblock has no blocks per group");
        ensure!(
            blocks_per_group <= block_size * 8,
            "ext4 block group larger than its bitmap"
        );
        ensure!(
            blocks_count > first_data_block,
            "ext4 filesystem has no data blocks"
        );

        let group_count = (blocks_count - first_data_block).div_ceil(blocks_per_group);
        let gdt_offset = (first_data_block + 1)
            .checked_mul(block_size)
            .context("ext4 group descriptors are out of range")?;
        let gdt_len = group_count
            .checked_mul(desc_size as u64)
            .context("ext4 group descriptor table is out of range")?;
        let device_bytes = size_in_sectors(file)? * CRYPT_SECTOR_SIZE;
        ensure!(
            gdt_offset
                .checked_add(gdt_len)
                .is_some_and(|end| end <= device_bytes),
            "ext4 group descriptors for {group_count} groups extend past the device"
        );

        let mut gdt = vec![0u8; gdt_len as usize];
        file.read_exact_at(&mut gdt, gdt_offset)
            .context("cannot read ext4 group descriptors")?;

        let groups = gdt
            .chunks_exact(desc_size)
            .map(|raw| GroupDesc::parse(raw, wide))
            .collect::<anyhow::Result<Vec<_>>>()?;
        for (i, group) in groups.iter().enumerate() {
            ensure!(
                group.block_bitmap < blocks_count,
                "group {i} bitmap at block {} is out of range",
                group.block_bitmap
            );
        }

        Ok(Self {
            block_size,
            blocks_count,
            first_data_block,
            blocks_per_group,
            groups,
        })
    }

    /// Blocks in use, going by the per-group free counts
    pub fn used_blocks(&self) -> u64 {
        let free: u64 = self.groups.iter().map(|g| u64::from(g.free_blocks)).sum();
        self.blocks_count.saturating_sub(free)
    }

    /// (first block, block count) of group `i`
    fn group_span(&self, i: usize) -> (u64, u64) {
        let first = self.first_data_block + i as u64 * self.blocks_per_group;
        (first, min(self.blocks_per_group, self.blocks_count - first))
    }
}

fn bitmap_get_bit(bitmap: &[u8], bit: u64) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

pub fn encrypt(
    ctx: &InplaceContext,
    size: u64,
    already_done: u64,
    previously_encrypted_upto: u64,
) -> Result<InplaceOutcome, InplaceError> {
    if previously_encrypted_upto > already_done {
        return Err(anyhow::anyhow!(
            "Not fast encrypting since resuming part way through"
        )
        .into());
    }

    let (real, crypto) = ctx.open_devices()?;
    let info = Ext4Info::read(&real)
        .with_context(|| format!("{} is not ext4", ctx.real_blkdev.display()))?;
    info!(
        "Encrypting ext4 filesystem in place: {} groups, {} of {} blocks used",
        info.groups.len(),
        info.used_blocks(),
        info.blocks_count
    );

    let bs = info.block_size;
    let mut progress = Progress::new("Encrypting ext4", ctx.props, info.used_blocks());
    let mut copier = Copier::new(&real, &crypto, bs, BLOCKS_AT_A_TIME);
    let mut bitmap = vec![0u8; bs as usize];

    for (i, group) in info.groups.iter().enumerate() {
        debug!("Encrypting group {i}");
        let (first_block, block_count) = info.group_span(i);

        if group.uninit() {
            bitmap.fill(0);
        } else {
            real.read_exact_at(&mut bitmap, group.block_bitmap * bs)
                .with_context(|| format!("Error reading block bitmap of group {i}"))?;
        }

        let mut offset = first_block * bs;
        for block in 0..block_count {
            let used = bitmap_get_bit(&bitmap, block);
            progress.update(used);
            if used {
                copier.push(offset);
            } else {
                copier.flush()?;
            }

            offset += bs;
            if offset % (bs * BLOCKS_AT_A_TIME) == 0 || copier.count == BLOCKS_AT_A_TIME {
                copier.flush()?;
                if !ctx.keep_going() {
                    progress.finish(false);
                    return Ok(InplaceOutcome {
                        done_sectors: already_done + offset / CRYPT_SECTOR_SIZE,
                        completed: false,
                    });
                }
            }
        }
        copier.flush()?;
    }

    progress.finish(true);
    Ok(InplaceOutcome {
        done_sectors: already_done + size,
        completed: true,
    })
}

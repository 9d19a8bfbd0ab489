//! Encrypting f2fs in place, copying only blocks in use
//!
//! Everything before the main area (superblocks, checkpoints, SIT, NAT, SSA) is copied as is.
//! Within the main area, a block is in use when its segment's SIT entry says so, with the SIT
//! journal in the current checkpoint's summary overriding the on-disk table.

use std::cmp::min;
use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::{bail, ensure, Context};
use crc::{Algorithm, Crc, CRC_32_ISO_HDLC};
use log::{debug, info};

use super::{
    Copier, InplaceContext, InplaceError, InplaceOutcome, Progress, BLOCKS_AT_A_TIME,
    CRYPT_SECTORS_PER_BUFSIZE,
};
use crate::blockdev::{size_in_sectors, CRYPT_INPLACE_BUFSIZE, CRYPT_SECTOR_SIZE};
use crate::util::LeFields;

const F2FS_SUPER_OFFSET: u64 = 1024;
const F2FS_SUPER_SIZE: usize = 1024;
pub const F2FS_SUPER_MAGIC: u32 = 0xF2F5_2010;
pub const F2FS_BLKSIZE: usize = 4096;
const F2FS_LOG_BLKSIZE: u32 = 12;
const F2FS_MAX_LOG_BLOCKS_PER_SEG: u32 = 9;

const F2FS_SUPER_POS_MAGIC: usize = 0;
const F2FS_SUPER_POS_LOG_BLOCKSIZE: usize = 16;
const F2FS_SUPER_POS_LOG_BLOCKS_PER_SEG: usize = 20;
const F2FS_SUPER_POS_BLOCK_COUNT: usize = 36;
const F2FS_SUPER_POS_SEGMENT_COUNT_SIT: usize = 56;
const F2FS_SUPER_POS_SEGMENT_COUNT_MAIN: usize = 68;
const F2FS_SUPER_POS_CP_BLKADDR: usize = 76;
const F2FS_SUPER_POS_SIT_BLKADDR: usize = 80;
const F2FS_SUPER_POS_MAIN_BLKADDR: usize = 92;

const F2FS_CP_POS_VERSION: usize = 0;
const F2FS_CP_POS_FLAGS: usize = 132;
const F2FS_CP_POS_PACK_TOTAL_BLOCK_COUNT: usize = 136;
const F2FS_CP_POS_PACK_START_SUM: usize = 140;
const F2FS_CP_POS_SIT_VER_BITMAP_BYTESIZE: usize = 156;
const F2FS_CP_POS_CHECKSUM_OFFSET: usize = 164;
const F2FS_CP_POS_VERSION_BITMAP: usize = 192;

const CP_UMOUNT_FLAG: u32 = 0x1;
const CP_COMPACT_SUM_FLAG: u32 = 0x4;

const SIT_ENTRY_SIZE: usize = 74;
const SIT_ENTRY_PER_BLOCK: u64 = 55;
const SIT_VBLOCKS_MASK: u16 = 0x3FF;
const SIT_VBLOCK_MAP_SIZE: usize = 64;

const SUM_JOURNAL_SIZE: usize = 507;
const SUM_ENTRIES_SIZE: usize = 3584;
const SIT_JOURNAL_ENTRIES: usize = 6;
const SIT_JOURNAL_ENTRY_SIZE: usize = 4 + SIT_ENTRY_SIZE;
const CURSEG_COLD_DATA: u64 = 2;

/// f2fs checksums: CRC-32 seeded with the superblock magic, without the final inversion
const F2FS_CRC_ALG: Algorithm<u32> = Algorithm {
    init: F2FS_SUPER_MAGIC.reverse_bits(),
    xorout: 0,
    ..CRC_32_ISO_HDLC
};
const F2FS_CRC: Crc<u32> = Crc::<u32>::new(&F2FS_CRC_ALG);

pub fn f2fs_crc32(data: &[u8]) -> u32 {
    F2FS_CRC.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SitEntry {
    vblocks: u16,
    valid_map: [u8; SIT_VBLOCK_MAP_SIZE],
}

impl SitEntry {
    fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        let vblocks = raw.le_u16_at(0)? & SIT_VBLOCKS_MASK;
        let valid_map = raw
            .get(2..2 + SIT_VBLOCK_MAP_SIZE)
            .context("truncated SIT entry")?
            .try_into()?;
        Ok(Self { vblocks, valid_map })
    }
}

/// A valid checkpoint: its pack's first block and where the pack starts
struct Checkpoint {
    version: u64,
    block: Vec<u8>,
    addr: u64,
}

/// Geometry and block usage of an f2fs filesystem
#[derive(Debug, Clone)]
pub struct F2fsInfo {
    pub block_count: u64,
    pub main_blkaddr: u64,
    pub blocks_per_segment: u64,
    pub checkpoint_version: u64,
    sit: Vec<SitEntry>,
}

fn read_block(file: &File, blkaddr: u64) -> anyhow::Result<Vec<u8>> {
    let mut block = vec![0u8; F2FS_BLKSIZE];
    file.read_exact_at(&mut block, blkaddr * F2FS_BLKSIZE as u64)
        .with_context(|| format!("cannot read f2fs block {blkaddr}"))?;
    Ok(block)
}

fn checksum_ok(block: &[u8]) -> anyhow::Result<bool> {
    let offset = block.le_u32_at(F2FS_CP_POS_CHECKSUM_OFFSET)? as usize;
    if offset < F2FS_CP_POS_VERSION_BITMAP || offset + 4 > F2FS_BLKSIZE {
        return Ok(false);
    }
    Ok(block.le_u32_at(offset)? == f2fs_crc32(&block[..offset]))
}

/// Validate the checkpoint pack at `addr`: both copies of its header must check out and agree
fn read_checkpoint(file: &File, addr: u64) -> anyhow::Result<Option<Checkpoint>> {
    let head = read_block(file, addr)?;
    if !checksum_ok(&head)? {
        debug!("f2fs checkpoint at {addr} has a bad checksum");
        return Ok(None);
    }
    let version = head.le_u64_at(F2FS_CP_POS_VERSION)?;

    let total = u64::from(head.le_u32_at(F2FS_CP_POS_PACK_TOTAL_BLOCK_COUNT)?);
    if total < 2 {
        return Ok(None);
    }
    let tail = read_block(file, addr + total - 1)?;
    if !checksum_ok(&tail)? || tail.le_u64_at(F2FS_CP_POS_VERSION)? != version {
        debug!("f2fs checkpoint at {addr} was not completely written");
        return Ok(None);
    }

    Ok(Some(Checkpoint {
        version,
        block: head,
        addr,
    }))
}

fn test_bit_msb(bitmap: &[u8], nr: u64) -> bool {
    bitmap
        .get((nr / 8) as usize)
        .is_some_and(|byte| byte & (0x80 >> (nr % 8)) != 0)
}

impl F2fsInfo {
    pub fn read(file: &File) -> anyhow::Result<Self> {
        let mut sb = [0u8; F2FS_SUPER_SIZE];
        file.read_exact_at(&mut sb, F2FS_SUPER_OFFSET)
            .context("cannot read f2fs superblock")?;

        let magic = sb.le_u32_at(F2FS_SUPER_POS_MAGIC)?;
        ensure!(magic == F2FS_SUPER_MAGIC, "bad f2fs magic {magic:#010x}");
        let log_blocksize = sb.le_u32_at(F2FS_SUPER_POS_LOG_BLOCKSIZE)?;
        ensure!(
            log_blocksize == F2FS_LOG_BLKSIZE,
            "unsupported f2fs block size shift {log_blocksize}"
        );
        let log_blocks_per_seg = sb.le_u32_at(F2FS_SUPER_POS_LOG_BLOCKS_PER_SEG)?;
        ensure!(
            log_blocks_per_seg <= F2FS_MAX_LOG_BLOCKS_PER_SEG,
            "unsupported f2fs segment size shift {log_blocks_per_seg}"
        );
        let blocks_per_segment = 1u64 << log_blocks_per_seg;

        let block_count = sb.le_u64_at(F2FS_SUPER_POS_BLOCK_COUNT)?;
        let segment_count_sit = u64::from(sb.le_u32_at(F2FS_SUPER_POS_SEGMENT_COUNT_SIT)?);
        let segment_count_main = u64::from(sb.le_u32_at(F2FS_SUPER_POS_SEGMENT_COUNT_MAIN)?);
        let cp_blkaddr = u64::from(sb.le_u32_at(F2FS_SUPER_POS_CP_BLKADDR)?);
        let sit_blkaddr = u64::from(sb.le_u32_at(F2FS_SUPER_POS_SIT_BLKADDR)?);
        let main_blkaddr = u64::from(sb.le_u32_at(F2FS_SUPER_POS_MAIN_BLKADDR)?);
        ensure!(
            main_blkaddr + segment_count_main * blocks_per_segment <= block_count,
            "f2fs main area runs past the end of the filesystem"
        );

        // Two checkpoint packs, one segment apart; the newest valid one is current
        let cp1 = read_checkpoint(file, cp_blkaddr)?;
        let cp2 = read_checkpoint(file, cp_blkaddr + blocks_per_segment)?;
        let cp = match (cp1, cp2) {
            (Some(a), Some(b)) => {
                if b.version > a.version {
                    b
                } else {
                    a
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => bail!("no valid f2fs checkpoint"),
        };
        debug!("Using f2fs checkpoint version {} at {}", cp.version, cp.addr);

        // Each SIT block has two copies; the checkpoint's bitmap picks the live one
        let sit_blocks_per_copy = (segment_count_sit / 2) << log_blocks_per_seg;
        let device_blocks = size_in_sectors(file)? * CRYPT_SECTOR_SIZE / F2FS_BLKSIZE as u64;
        ensure!(
            sit_blkaddr + 2 * sit_blocks_per_copy <= device_blocks,
            "f2fs SIT area extends past the device"
        );
        let bitmap_size = cp.block.le_u32_at(F2FS_CP_POS_SIT_VER_BITMAP_BYTESIZE)? as usize;
        let bitmap = cp
            .block
            .get(F2FS_CP_POS_VERSION_BITMAP..F2FS_CP_POS_VERSION_BITMAP + bitmap_size)
            .context("f2fs SIT version bitmap does not fit in the checkpoint")?;

        let sit_blocks = segment_count_main.div_ceil(SIT_ENTRY_PER_BLOCK);
        ensure!(
            sit_blocks <= sit_blocks_per_copy,
            "f2fs SIT area too small for the main area"
        );
        let mut sit = Vec::with_capacity(segment_count_main as usize);
        for i in 0..sit_blocks {
            let mut addr = sit_blkaddr + i;
            if test_bit_msb(bitmap, i) {
                addr += sit_blocks_per_copy;
            }
            let block = read_block(file, addr)?;
            let entries = min(SIT_ENTRY_PER_BLOCK, segment_count_main - i * SIT_ENTRY_PER_BLOCK);
            for raw in block.chunks_exact(SIT_ENTRY_SIZE).take(entries as usize) {
                sit.push(SitEntry::parse(raw)?);
            }
        }

        // Recent SIT updates may only be in the journal of the cold data summary
        let flags = cp.block.le_u32_at(F2FS_CP_POS_FLAGS)?;
        let (sum_addr, journal_pos) = if flags & CP_COMPACT_SUM_FLAG != 0 {
            let start_sum = u64::from(cp.block.le_u32_at(F2FS_CP_POS_PACK_START_SUM)?);
            (cp.addr + start_sum, SUM_JOURNAL_SIZE)
        } else {
            let total = u64::from(cp.block.le_u32_at(F2FS_CP_POS_PACK_TOTAL_BLOCK_COUNT)?);
            let base = if flags & CP_UMOUNT_FLAG != 0 { 6 } else { 3 };
            ensure!(total > base, "f2fs checkpoint pack too short");
            (cp.addr + total - (base + 1) + CURSEG_COLD_DATA, SUM_ENTRIES_SIZE)
        };
        let summary = read_block(file, sum_addr)?;
        let n_sits = usize::from(summary.le_u16_at(journal_pos)?);
        ensure!(
            n_sits <= SIT_JOURNAL_ENTRIES,
            "f2fs SIT journal claims {n_sits} entries"
        );
        for k in 0..n_sits {
            let pos = journal_pos + 2 + k * SIT_JOURNAL_ENTRY_SIZE;
            let segno = summary.le_u32_at(pos)? as usize;
            let entry = SitEntry::parse(&summary[pos + 4..])?;
            match sit.get_mut(segno) {
                Some(slot) => *slot = entry,
                None => bail!("f2fs SIT journal entry for segment {segno} out of range"),
            }
        }

        Ok(Self {
            block_count,
            main_blkaddr,
            blocks_per_segment,
            checkpoint_version: cp.version,
            sit,
        })
    }

    /// Is block `blkaddr` in use? Everything before the main area is.
    pub fn is_used(&self, blkaddr: u64) -> bool {
        if blkaddr < self.main_blkaddr {
            return true;
        }
        let rel = blkaddr - self.main_blkaddr;
        match self.sit.get((rel / self.blocks_per_segment) as usize) {
            Some(entry) => test_bit_msb(&entry.valid_map, rel % self.blocks_per_segment),
            None => false,
        }
    }

    pub fn used_blocks(&self) -> u64 {
        self.main_blkaddr
            + self
                .sit
                .iter()
                .map(|entry| u64::from(entry.vblocks))
                .sum::<u64>()
    }
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
    let info = F2fsInfo::read(&real)
        .with_context(|| format!("{} is not f2fs", ctx.real_blkdev.display()))?;
    let total = min(info.block_count, size / CRYPT_SECTORS_PER_BUFSIZE);
    info!(
        "Encrypting f2fs filesystem in place: {} of {total} blocks used",
        info.used_blocks()
    );

    let mut progress = Progress::new("Encrypting f2fs", ctx.props, info.used_blocks());
    let mut copier = Copier::new(&real, &crypto, CRYPT_INPLACE_BUFSIZE as u64, 1);
    let mut copied = 0u64;

    for blkaddr in 0..total {
        if !info.is_used(blkaddr) {
            continue;
        }
        copier.copy(blkaddr * CRYPT_INPLACE_BUFSIZE as u64, CRYPT_INPLACE_BUFSIZE)?;
        copied += 1;
        progress.set(blkaddr + 1, copied);

        if copied % BLOCKS_AT_A_TIME == 0 && !ctx.keep_going() {
            progress.finish(false);
            return Ok(InplaceOutcome {
                done_sectors: already_done + (blkaddr + 1) * CRYPT_SECTORS_PER_BUFSIZE,
                completed: false,
            });
        }
    }

    progress.finish(true);
    Ok(InplaceOutcome {
        done_sectors: already_done + size,
        completed: true,
    })
}

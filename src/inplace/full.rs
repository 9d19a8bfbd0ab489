//! Encrypting any device in place by copying every sector

use anyhow::Context;
use log::info;

use super::{
    Copier, InplaceContext, InplaceError, InplaceOutcome, Progress, CRYPT_SECTORS_PER_BUFSIZE,
};
use crate::blockdev::{CRYPT_INPLACE_BUFSIZE, CRYPT_SECTOR_SIZE};

pub fn encrypt(
    ctx: &InplaceContext,
    size: u64,
    already_done: u64,
    previously_encrypted_upto: u64,
) -> Result<InplaceOutcome, InplaceError> {
    let (real, crypto) = ctx.open_devices()?;

    let numblocks = size / CRYPT_SECTORS_PER_BUFSIZE;
    let sector = CRYPT_SECTOR_SIZE as usize;
    let mut copier = Copier::new(&real, &crypto, CRYPT_SECTOR_SIZE, CRYPT_SECTORS_PER_BUFSIZE);

    // Resume where the last run stopped
    let mut i = previously_encrypted_upto.saturating_sub(already_done);
    if i > 0 {
        info!("Resuming full encryption at sector {i}");
    }

    // Single sectors up to the next block boundary
    while i < size && i % CRYPT_SECTORS_PER_BUFSIZE != 0 {
        copier
            .copy(i * CRYPT_SECTOR_SIZE, sector)
            .with_context(|| format!("Error copying sector {i}"))?;
        i += 1;
    }

    let mut progress = Progress::new("Encrypting", ctx.props, numblocks);
    let mut block = i / CRYPT_SECTORS_PER_BUFSIZE;
    progress.set(block, block);
    while block < numblocks {
        copier
            .copy(block * CRYPT_INPLACE_BUFSIZE as u64, CRYPT_INPLACE_BUFSIZE)
            .with_context(|| format!("Error copying block {block}"))?;
        block += 1;
        progress.set(block, block);

        if !ctx.keep_going() {
            progress.finish(false);
            return Ok(InplaceOutcome {
                done_sectors: already_done + block * CRYPT_SECTORS_PER_BUFSIZE,
                completed: false,
            });
        }
    }

    // Whatever is left past the last whole block
    for s in (numblocks * CRYPT_SECTORS_PER_BUFSIZE).max(i)..size {
        copier
            .copy(s * CRYPT_SECTOR_SIZE, sector)
            .with_context(|| format!("Error copying sector {s}"))?;
    }

    progress.finish(true);
    Ok(InplaceOutcome {
        done_sectors: already_done + size,
        completed: true,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inplace::test::devices;
    use crate::platform::SimPower;
    use crate::props::{self, MemoryProperties, Properties};

    #[test]
    fn copies_everything() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // Not a multiple of the block size
        let (real, crypto) = devices(&dir, 21 * 512)?;
        let power = SimPower::full();
        let props = MemoryProperties::new();
        let ctx = InplaceContext {
            real_blkdev: &real,
            crypto_blkdev: &crypto,
            props: Some(&props),
            power: &power,
        };

        let outcome = encrypt(&ctx, 21, 0, 0)?;
        assert_eq!(outcome.done_sectors, 21);
        assert!(outcome.completed);
        assert_eq!(std::fs::read(real)?, std::fs::read(crypto)?);
        assert_eq!(props.get(props::ENCRYPT_PROGRESS).as_deref(), Some("100"));
        Ok(())
    }

    #[test]
    fn stops_and_resumes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (real, crypto) = devices(&dir, 64 * 512)?;
        let power = SimPower::dying_after(2);
        let ctx = InplaceContext {
            real_blkdev: &real,
            crypto_blkdev: &crypto,
            props: None,
            power: &power,
        };

        let first = encrypt(&ctx, 64, 0, 0)?;
        assert_eq!(
            first,
            InplaceOutcome {
                done_sectors: 24,
                completed: false
            }
        );
        let data = std::fs::read(&crypto)?;
        assert!(data[24 * 512..].iter().all(|&b| b == 0));

        // Pick up from the checkpoint once charged
        power.recharge();
        let real_data = std::fs::read(&real)?;
        let second = encrypt(&ctx, 64, 0, first.done_sectors)?;
        assert!(second.completed);
        assert_eq!(std::fs::read(&crypto)?, real_data);
        Ok(())
    }

    #[test]
    fn resumes_mid_block() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (real, crypto) = devices(&dir, 20 * 512)?;
        let power = SimPower::full();
        let ctx = InplaceContext {
            real_blkdev: &real,
            crypto_blkdev: &crypto,
            props: None,
            power: &power,
        };

        let outcome = encrypt(&ctx, 20, 0, 5)?;
        assert!(outcome.completed);
        let real = std::fs::read(real)?;
        let crypto = std::fs::read(crypto)?;
        assert!(crypto[..5 * 512].iter().all(|&b| b == 0));
        assert_eq!(crypto[5 * 512..], real[5 * 512..]);
        Ok(())
    }
}

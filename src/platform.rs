//! The parts of the running system cryptfs leans on: mounting filesystems and the battery.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use log::warn;
use nix::mount::{mount, umount, MsFlags};

/// Battery needed before in-place encryption may start
pub const BATTERY_START_PERCENT: u32 = 10;
/// Battery below which a running in-place encryption stops at the next batch boundary
pub const BATTERY_CONTINUE_PERCENT: u32 = 5;

const POWER_SUPPLY_CAPACITY: &str = "/sys/class/power_supply/battery/capacity";

pub trait Mounter {
    /// Mount `source` on `target` (creating `target` if needed)
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> anyhow::Result<()>;

    fn unmount(&self, target: &Path) -> anyhow::Result<()>;
}

/// Mounts through the kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> anyhow::Result<()> {
        if !target.is_dir() {
            fs::create_dir_all(target)?;
        }
        mount(
            Some(source),
            target,
            Some(fs_type),
            MsFlags::empty(),
            None::<&str>,
        )
        .with_context(|| {
            format!(
                "cannot mount {} on {} as {fs_type}",
                source.display(),
                target.display()
            )
        })
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        umount(target).with_context(|| format!("cannot unmount {}", target.display()))
    }
}

#[derive(Debug, Default)]
struct SimMounts {
    accepted: Vec<(PathBuf, String)>,
    mounted: Vec<PathBuf>,
    attempts: Vec<(PathBuf, String)>,
}

/// A simulated mounter, for testing purposes
///
/// Mounting only succeeds for the (source, fs type) pairs it has been told to accept. Clones
/// share state.
#[derive(Debug, Default, Clone)]
pub struct SimMounter {
    state: Rc<RefCell<SimMounts>>,
}

impl SimMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `source` be mounted as `fs_type`
    pub fn accept(self, source: impl Into<PathBuf>, fs_type: &str) -> Self {
        self.state
            .borrow_mut()
            .accepted
            .push((source.into(), fs_type.to_owned()));
        self
    }

    /// Every (source, fs type) mount that was tried, in order
    pub fn attempts(&self) -> Vec<(PathBuf, String)> {
        self.state.borrow().attempts.clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.borrow().mounted.clone()
    }
}

impl Mounter for SimMounter {
    fn mount(&self, source: &Path, target: &Path, fs_type: &str) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .attempts
            .push((source.to_owned(), fs_type.to_owned()));

        let ok = state
            .accepted
            .iter()
            .any(|(src, fs)| src == source && fs == fs_type);
        anyhow::ensure!(ok, "{} is not a valid {fs_type} filesystem", source.display());

        state.mounted.push(target.to_owned());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        let pos = state
            .mounted
            .iter()
            .position(|t| t == target)
            .ok_or(anyhow::anyhow!("{} is not mounted", target.display()))?;
        state.mounted.remove(pos);
        Ok(())
    }
}

pub trait PowerMonitor {
    /// Remaining battery charge in percent, if it can be determined
    fn battery_percent(&self) -> Option<u32>;
}

/// Is there enough charge to go on? An unknown level counts as enough.
pub fn battery_ok(power: &dyn PowerMonitor, threshold: u32) -> bool {
    match power.battery_percent() {
        Some(percent) => percent >= threshold,
        None => true,
    }
}

/// The battery as reported by the kernel's power-supply class
#[derive(Debug, Clone)]
pub struct SysfsPower {
    capacity: PathBuf,
}

impl Default for SysfsPower {
    fn default() -> Self {
        Self {
            capacity: PathBuf::from(POWER_SUPPLY_CAPACITY),
        }
    }
}

impl SysfsPower {
    pub fn new(capacity: impl Into<PathBuf>) -> Self {
        Self {
            capacity: capacity.into(),
        }
    }
}

impl PowerMonitor for SysfsPower {
    fn battery_percent(&self) -> Option<u32> {
        let text = fs::read_to_string(&self.capacity).ok()?;
        match text.trim().parse() {
            Ok(percent) => Some(percent),
            Err(_) => {
                warn!("unreadable battery capacity `{}`", text.trim());
                None
            }
        }
    }
}

/// A simulated battery, for testing purposes
///
/// Reports `level` for the first `checks` readings, then `low`. Clones share state.
#[derive(Debug, Clone)]
pub struct SimPower {
    level: u32,
    low: u32,
    remaining: Rc<RefCell<Option<u64>>>,
}

impl SimPower {
    /// A battery that never runs down
    pub fn full() -> Self {
        Self {
            level: 100,
            low: 0,
            remaining: Rc::new(RefCell::new(None)),
        }
    }

    /// A battery that drops to 1% after `checks` readings
    pub fn dying_after(checks: u64) -> Self {
        Self {
            level: 100,
            low: 1,
            remaining: Rc::new(RefCell::new(Some(checks))),
        }
    }

    /// Stop running down; every later reading is `level`
    pub fn recharge(&self) {
        *self.remaining.borrow_mut() = None;
    }
}

impl PowerMonitor for SimPower {
    fn battery_percent(&self) -> Option<u32> {
        let mut remaining = self.remaining.borrow_mut();
        match remaining.as_mut() {
            None => Some(self.level),
            Some(0) => Some(self.low),
            Some(n) => {
                *n -= 1;
                Some(self.level)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sim_mounter() -> anyhow::Result<()> {
        let mounter = SimMounter::new().accept("/dev/block/dm-0", "f2fs");
        let target = Path::new("/data/tmp_mnt");

        assert!(mounter
            .mount(Path::new("/dev/block/dm-0"), target, "ext4")
            .is_err());
        mounter.mount(Path::new("/dev/block/dm-0"), target, "f2fs")?;
        assert_eq!(mounter.mounted(), vec![target.to_owned()]);
        assert_eq!(mounter.attempts().len(), 2);

        mounter.unmount(target)?;
        assert!(mounter.unmount(target).is_err());
        Ok(())
    }

    #[test]
    fn battery_thresholds() -> anyhow::Result<()> {
        let power = SimPower::dying_after(2);
        assert!(battery_ok(&power, BATTERY_START_PERCENT));
        assert!(battery_ok(&power, BATTERY_CONTINUE_PERCENT));
        assert!(!battery_ok(&power, BATTERY_CONTINUE_PERCENT));
        power.recharge();
        assert!(battery_ok(&power, BATTERY_START_PERCENT));

        let dir = tempfile::tempdir()?;
        let capacity = dir.path().join("capacity");
        let sysfs = SysfsPower::new(&capacity);
        assert!(battery_ok(&sysfs, BATTERY_START_PERCENT));

        fs::write(&capacity, "7\n")?;
        assert_eq!(sysfs.battery_percent(), Some(7));
        assert!(!battery_ok(&sysfs, BATTERY_START_PERCENT));
        assert!(battery_ok(&sysfs, BATTERY_CONTINUE_PERCENT));
        Ok(())
    }
}

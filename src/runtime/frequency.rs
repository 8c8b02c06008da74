//! CPU frequency backends.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::error::{InstrumentError, InstrumentResult};

/// Reads and sets the clock of one CPU, in kHz
pub trait FrequencyControl {
    fn current(&mut self, cpu: u32) -> InstrumentResult<u32>;

    fn set(&mut self, cpu: u32, khz: u32) -> InstrumentResult<()>;
}

impl<T: FrequencyControl + ?Sized> FrequencyControl for &mut T {
    fn current(&mut self, cpu: u32) -> InstrumentResult<u32> {
        (**self).current(cpu)
    }

    fn set(&mut self, cpu: u32, khz: u32) -> InstrumentResult<()> {
        (**self).set(cpu, khz)
    }
}

/// CPU that `rank` runs on when ranks are spread over `cpus` processors
pub fn cpu_for_rank(rank: u32, cpus: usize) -> u32 {
    let cpus = u32::try_from(cpus.max(1)).unwrap_or(u32::MAX);
    rank % cpus
}

/// Pin the calling process to the CPU chosen for `rank` and return it
pub fn pin_to_rank(rank: u32) -> InstrumentResult<u32> {
    let cpu = cpu_for_rank(rank, thread::available_parallelism()?.get());
    let mut set = CpuSet::new();
    set.set(cpu as usize).map_err(io::Error::from)?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(io::Error::from)?;
    info!("rank {} pinned to cpu{}", rank, cpu);
    Ok(cpu)
}

/// cpufreq through sysfs, which needs the `userspace` governor
#[derive(Debug, Clone)]
pub struct SysfsFrequency {
    root: PathBuf,
}

impl SysfsFrequency {
    pub const DEFAULT_ROOT: &'static str = "/sys/devices/system/cpu";

    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, cpu: u32, file: &str) -> PathBuf {
        self.root.join(format!("cpu{}", cpu)).join("cpufreq").join(file)
    }
}

impl Default for SysfsFrequency {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyControl for SysfsFrequency {
    fn current(&mut self, cpu: u32) -> InstrumentResult<u32> {
        let path = self.path(cpu, "scaling_cur_freq");
        let text = fs::read_to_string(&path)?;
        text.trim().parse().map_err(|_| {
            InstrumentError::Config(format!("{}: not a frequency: {:?}", path.display(), text.trim()))
        })
    }

    fn set(&mut self, cpu: u32, khz: u32) -> InstrumentResult<()> {
        let path = self.path(cpu, "scaling_setspeed");
        fs::write(&path, khz.to_string())?;
        debug!("cpu{} -> {} kHz", cpu, khz);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sysfs_read_and_write() {
        let dir = tempdir().unwrap();
        let cpufreq = dir.path().join("cpu2").join("cpufreq");
        fs::create_dir_all(&cpufreq).unwrap();
        fs::write(cpufreq.join("scaling_cur_freq"), "2600000\n").unwrap();

        let mut control = SysfsFrequency::with_root(dir.path());
        assert_eq!(control.current(2).unwrap(), 2600000);
        control.set(2, 1800000).unwrap();
        assert_eq!(fs::read_to_string(cpufreq.join("scaling_setspeed")).unwrap(), "1800000");

        assert!(control.current(3).is_err());
    }

    #[test]
    fn test_cpu_for_rank() {
        assert_eq!(cpu_for_rank(0, 8), 0);
        assert_eq!(cpu_for_rank(9, 8), 1);
        assert_eq!(cpu_for_rank(3, 0), 0);
    }

    #[test]
    fn test_garbage_frequency_rejected() {
        let dir = tempdir().unwrap();
        let cpufreq = dir.path().join("cpu0").join("cpufreq");
        fs::create_dir_all(&cpufreq).unwrap();
        fs::write(cpufreq.join("scaling_cur_freq"), "fast\n").unwrap();

        let mut control = SysfsFrequency::with_root(dir.path());
        assert!(matches!(control.current(0), Err(InstrumentError::Config(_))));
    }
}

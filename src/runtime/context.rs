//! Per-process state of a frequency-scaling run.
//!
//! One `RuntimeContext` is created at program start from the descriptor table
//! of the running image, receives every site entry and exit, and is consumed
//! by `finish` at program exit.

use tracing::{debug, info, warn};

use crate::descriptor::{PatchTarget, PointState, RuntimeTable};
use crate::error::{InstrumentError, InstrumentResult};
use crate::runtime::frequency::{pin_to_rank, FrequencyControl};
use crate::runtime::policy::FrequencyMap;

/// A site whose entry and exit counts differ at teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imbalance {
    pub site: u32,
    pub id: u64,
    pub entries: u64,
    pub exits: u64,
}

/// Summary produced at program exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub imbalances: Vec<Imbalance>,
    pub freq_requests: u64,
    pub freq_changes: u64,
    pub disabled_points: usize,
    /// 0 when every site is balanced, 1 otherwise
    pub exit_status: i32,
}

pub struct RuntimeContext<F: FrequencyControl> {
    table: RuntimeTable,
    control: F,
    cpu: u32,
    site_freq: Vec<Option<u32>>,
    ceiling: Option<u32>,
    entries: Vec<u64>,
    exits: Vec<u64>,
    inside: Vec<bool>,
    initial_freq: Option<u32>,
    current_freq: Option<u32>,
    freq_requests: u64,
    freq_changes: u64,
    disabled_points: usize,
}

impl<F: FrequencyControl> RuntimeContext<F> {
    /// Context that scales `cpu`; the caller must already run on it
    pub fn new(table: RuntimeTable, control: F, cpu: u32) -> Self {
        let sites = table.site_ids.len();
        Self {
            table,
            control,
            cpu,
            site_freq: vec![None; sites],
            ceiling: None,
            entries: vec![0; sites],
            exits: vec![0; sites],
            inside: vec![false; sites],
            initial_freq: None,
            current_freq: None,
            freq_requests: 0,
            freq_changes: 0,
            disabled_points: 0,
        }
    }

    /// Pin this process to the CPU of `rank`, then scale that CPU
    pub fn for_rank(table: RuntimeTable, control: F, rank: u32) -> InstrumentResult<Self> {
        let cpu = pin_to_rank(rank)?;
        Ok(Self::new(table, control, cpu))
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn table(&self) -> &RuntimeTable {
        &self.table
    }

    pub fn site_frequency(&self, site: u32) -> Option<u32> {
        self.site_freq.get(site as usize).copied().flatten()
    }

    pub fn counts(&self, site: u32) -> Option<(u64, u64)> {
        let i = site as usize;
        Some((*self.entries.get(i)?, *self.exits.get(i)?))
    }

    pub fn current_frequency(&self) -> Option<u32> {
        self.current_freq
    }

    /// Bind the policy to the site table
    ///
    /// Points of sites without a frequency are disabled in `target`. The
    /// starting frequency is recorded and the rank ceiling applied.
    pub fn apply_policy<T: PatchTarget + ?Sized>(&mut self, policy: &FrequencyMap, target: &mut T) -> InstrumentResult<()> {
        for hash in policy.hashes() {
            if !self.table.site_ids.contains(&hash) {
                info!("not an instrumented loop: {}, ignoring", hash);
            }
        }

        let ids = self.table.site_ids.clone();
        for (i, id) in ids.iter().enumerate() {
            self.site_freq[i] = policy.frequency(*id);
            match self.site_freq[i] {
                Some(freq) => info!("running with loop {} @ {}kHz", id, freq),
                None => {
                    let mut killed = 0;
                    for point in self.table.points_for_site(i as u32) {
                        if point.state() == PointState::Enabled {
                            point.disable(&mut *target)?;
                            killed += 1;
                        }
                    }
                    self.disabled_points += killed;
                    debug!("site {} (id {:#x}): {} points disabled", i, id, killed);
                }
            }
        }

        let initial = self.control.current(self.cpu)?;
        self.initial_freq = Some(initial);
        self.current_freq = Some(initial);
        info!("clock frequency at run start: {}kHz", initial);

        self.ceiling = policy.ceiling();
        if let Some(ceiling) = self.ceiling {
            self.control.set(self.cpu, ceiling)?;
            self.current_freq = Some(ceiling);
            info!("scaling cpu{} to rank ceiling {}kHz", self.cpu, ceiling);
        }
        Ok(())
    }

    fn check_site(&self, site: u32) -> InstrumentResult<usize> {
        let i = site as usize;
        if i >= self.entries.len() {
            return Err(InstrumentError::out_of_range(
                "runtime site index",
                site as u64,
                self.entries.len() as u64,
            ));
        }
        Ok(i)
    }

    fn request(&mut self, freq: u32) -> InstrumentResult<()> {
        self.freq_requests += 1;
        if self.current_freq == Some(freq) {
            return Ok(());
        }
        self.current_freq = Some(freq);
        self.freq_changes += 1;
        self.control.set(self.cpu, freq)
    }

    pub fn site_entry(&mut self, site: u32) -> InstrumentResult<()> {
        let i = self.check_site(site)?;
        self.entries[i] += 1;

        let Some(freq) = self.site_freq[i] else {
            return Ok(());
        };
        if self.inside[i] {
            warn!("loop entry scaling call without exit for site {}", site);
        }
        self.inside[i] = true;

        if self.ceiling.map_or(false, |ceiling| freq >= ceiling) {
            return Ok(());
        }
        self.request(freq)
    }

    pub fn site_exit(&mut self, site: u32) -> InstrumentResult<()> {
        let i = self.check_site(site)?;
        self.exits[i] += 1;

        if self.site_freq[i].is_none() {
            return Ok(());
        }
        if !self.inside[i] {
            warn!("loop exit scaling call without entry for site {}", site);
        }
        self.inside[i] = false;
        Ok(())
    }

    /// Restore the starting frequency and check entry/exit balance
    pub fn finish(mut self) -> Teardown {
        if let Some(initial) = self.initial_freq {
            match self.control.set(self.cpu, initial) {
                Ok(()) => info!("restored cpu{} frequency to {}kHz", self.cpu, initial),
                Err(e) => warn!("cannot restore cpu{} frequency: {}", self.cpu, e),
            }
        }

        let imbalances: Vec<Imbalance> = self
            .entries
            .iter()
            .zip(&self.exits)
            .enumerate()
            .filter(|(_, (entries, exits))| entries != exits)
            .map(|(i, (entries, exits))| Imbalance {
                site: i as u32,
                id: self.table.site_ids[i],
                entries: *entries,
                exits: *exits,
            })
            .collect();
        for imbalance in &imbalances {
            warn!(
                "site {}: entry called {} times but exit {}",
                imbalance.site, imbalance.entries, imbalance.exits
            );
        }
        info!(
            "{} frequency requests, {} changes",
            self.freq_requests, self.freq_changes
        );

        Teardown {
            exit_status: if imbalances.is_empty() { 0 } else { 1 },
            imbalances,
            freq_requests: self.freq_requests,
            freq_changes: self.freq_changes,
            disabled_points: self.disabled_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{InstrumentationPoint, MappedRegion, TableHeader};

    const BASE: u64 = 0x401000;
    const JMP: [u8; 5] = [0xe9, 0x10, 0x00, 0x00, 0x00];
    const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

    struct Recorder {
        freq: u32,
        writes: Vec<u32>,
    }

    impl FrequencyControl for Recorder {
        fn current(&mut self, _cpu: u32) -> InstrumentResult<u32> {
            Ok(self.freq)
        }

        fn set(&mut self, _cpu: u32, khz: u32) -> InstrumentResult<()> {
            self.freq = khz;
            self.writes.push(khz);
            Ok(())
        }
    }

    /// Two loop sites, 111 and 222, with one patched point each
    fn setup() -> (RuntimeTable, MappedRegion) {
        let mut code = vec![0x90; 0x20];
        code[0..5].copy_from_slice(&JMP);
        code[0x10..0x15].copy_from_slice(&JMP);
        let points = vec![
            InstrumentationPoint::new(0, BASE, NOP5.to_vec(), JMP.to_vec()).unwrap(),
            InstrumentationPoint::new(1, BASE + 0x10, NOP5.to_vec(), JMP.to_vec()).unwrap(),
        ];
        let table = RuntimeTable {
            header: TableHeader {
                point_count: 2,
                site_count: 2,
                ..Default::default()
            },
            site_ids: vec![111, 222],
            points,
        };
        (table, MappedRegion::new(BASE, code))
    }

    fn context(freq: u32) -> (RuntimeContext<Recorder>, MappedRegion) {
        let (table, region) = setup();
        let control = Recorder {
            freq,
            writes: Vec::new(),
        };
        (RuntimeContext::new(table, control, 0), region)
    }

    #[test]
    fn test_sites_without_frequency_are_disabled() {
        let (mut ctx, mut region) = context(2600000);
        let policy = FrequencyMap::parse("111 * 1800000\n999 * 1000000\n", 0).unwrap();
        ctx.apply_policy(&policy, &mut region).unwrap();

        assert_eq!(ctx.site_frequency(0), Some(1800000));
        assert_eq!(ctx.site_frequency(1), None);
        assert_eq!(&region.as_bytes()[0..5], &JMP);
        assert_eq!(&region.as_bytes()[0x10..0x15], &NOP5);
        assert_eq!(ctx.table().points[1].state(), PointState::Disabled);
    }

    #[test]
    fn test_entry_requests_frequency() {
        let (mut ctx, mut region) = context(2600000);
        let policy = FrequencyMap::parse("111 * 1800000\n", 0).unwrap();
        ctx.apply_policy(&policy, &mut region).unwrap();

        ctx.site_entry(0).unwrap();
        ctx.site_exit(0).unwrap();
        ctx.site_entry(0).unwrap();
        ctx.site_exit(0).unwrap();
        assert_eq!(ctx.current_frequency(), Some(1800000));
        assert_eq!(ctx.counts(0), Some((2, 2)));

        let teardown = ctx.finish();
        assert_eq!(teardown.freq_requests, 2);
        assert_eq!(teardown.freq_changes, 1);
        assert_eq!(teardown.exit_status, 0);
        assert_eq!(teardown.disabled_points, 1);
    }

    #[test]
    fn test_ceiling_caps_requests() {
        let (mut ctx, mut region) = context(2600000);
        let policy = FrequencyMap::parse("111 * 2400000\n0 2000000\n", 0).unwrap();
        ctx.apply_policy(&policy, &mut region).unwrap();
        assert_eq!(ctx.current_frequency(), Some(2000000));

        ctx.site_entry(0).unwrap();
        assert_eq!(ctx.current_frequency(), Some(2000000));
        ctx.site_exit(0).unwrap();

        let teardown = ctx.finish();
        assert_eq!(teardown.freq_requests, 0);
    }

    #[test]
    fn test_imbalance_sets_exit_status() {
        let (mut ctx, mut region) = context(2600000);
        ctx.apply_policy(&FrequencyMap::disabled(), &mut region).unwrap();
        ctx.site_entry(1).unwrap();
        ctx.site_entry(1).unwrap();
        ctx.site_exit(1).unwrap();
        assert!(ctx.site_entry(2).is_err());

        let teardown = ctx.finish();
        assert_eq!(teardown.exit_status, 1);
        assert_eq!(
            teardown.imbalances,
            vec![Imbalance {
                site: 1,
                id: 222,
                entries: 2,
                exits: 1
            }]
        );
        assert_eq!(teardown.disabled_points, 2);
    }

    #[test]
    fn test_finish_restores_initial_frequency() {
        let (table, mut region) = setup();
        let mut recorder = Recorder {
            freq: 2600000,
            writes: Vec::new(),
        };
        let mut ctx = RuntimeContext::new(table, &mut recorder, 0);
        let policy = FrequencyMap::parse("222 * 1200000\n", 0).unwrap();
        ctx.apply_policy(&policy, &mut region).unwrap();
        ctx.site_entry(1).unwrap();
        ctx.site_exit(1).unwrap();

        let teardown = ctx.finish();
        assert!(teardown.imbalances.is_empty());
        assert_eq!(recorder.writes, vec![1200000, 2600000]);
        assert_eq!(recorder.freq, 2600000);
    }
}

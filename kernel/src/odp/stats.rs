//! Paging statistics
//!
//! Miss counters with min/max/sum service time per miss kind, exported with
//! `postcard` for dashboards and debug consoles. Timing is recorded only
//! with the `odp-stats` feature; counters are always kept.

use embassy_time::Duration;
use serde::Serialize;

/// Kind of fault serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    /// Code page filled from backing store
    Code,
    /// Data page filled, victim was clean or empty
    DataClean,
    /// Data page filled after writing back a dirty victim
    DataDirty,
    /// Page already resident, only the MPU mapping was missing
    Mpu,
    /// Fill refused because the aperture was suspended
    Suspended,
}

/// Counter and service time for one miss kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MissStats {
    /// Misses recorded
    pub count: u32,
    /// Shortest service time in microseconds
    pub min_us: u32,
    /// Longest service time in microseconds
    pub max_us: u32,
    /// Total service time in microseconds
    pub sum_us: u64,
}

impl MissStats {
    fn record(&mut self, elapsed: Duration) {
        self.count = self.count.saturating_add(1);
        if cfg!(feature = "odp-stats") {
            let us = u32::try_from(elapsed.as_micros()).unwrap_or(u32::MAX);
            if self.count == 1 || us < self.min_us {
                self.min_us = us;
            }
            self.max_us = self.max_us.max(us);
            self.sum_us = self.sum_us.saturating_add(u64::from(us));
        }
    }

    /// Mean service time in microseconds
    pub fn mean_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_us / u64::from(self.count)
        }
    }
}

/// Paging statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OdpStats {
    /// Code page misses
    pub code: MissStats,
    /// Data misses with a clean victim
    pub data_clean: MissStats,
    /// Data misses with a dirty victim
    pub data_dirty: MissStats,
    /// MPU-only misses
    pub mpu: MissStats,
    /// Fills refused while the DMA aperture was suspended
    pub suspended: MissStats,
    /// Every miss above
    pub total: MissStats,
    /// Dirty pages written back
    pub writebacks: u32,
}

impl OdpStats {
    /// Zeroed statistics
    pub const fn new() -> Self {
        const ZERO: MissStats = MissStats {
            count: 0,
            min_us: 0,
            max_us: 0,
            sum_us: 0,
        };
        Self {
            code: ZERO,
            data_clean: ZERO,
            data_dirty: ZERO,
            mpu: ZERO,
            suspended: ZERO,
            total: ZERO,
            writebacks: 0,
        }
    }

    /// Account one serviced miss
    pub fn record(&mut self, kind: MissKind, elapsed: Duration) {
        let stats = match kind {
            MissKind::Code => &mut self.code,
            MissKind::DataClean => &mut self.data_clean,
            MissKind::DataDirty => &mut self.data_dirty,
            MissKind::Mpu => &mut self.mpu,
            MissKind::Suspended => &mut self.suspended,
        };
        stats.record(elapsed);
        self.total.record(elapsed);
    }

    /// Encode into `buf`, returning the encoded length
    pub fn export(&self, buf: &mut [u8]) -> Result<usize, postcard::Error> {
        postcard::to_slice(self, buf).map(|out| out.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_min_max_and_total() {
        let mut stats = OdpStats::new();
        stats.record(MissKind::Code, Duration::from_micros(30));
        stats.record(MissKind::Code, Duration::from_micros(10));
        stats.record(MissKind::Mpu, Duration::from_micros(2));
        assert_eq!(stats.code.count, 2);
        assert_eq!(stats.total.count, 3);
        if cfg!(feature = "odp-stats") {
            assert_eq!((stats.code.min_us, stats.code.max_us), (10, 30));
            assert_eq!(stats.code.mean_us(), 20);
            assert_eq!(stats.total.min_us, 2);
        }
    }

    #[test]
    fn export_fits_small_buffer() {
        let mut stats = OdpStats::new();
        stats.record(MissKind::DataDirty, Duration::from_micros(100));
        let mut buf = [0u8; 128];
        let len = stats.export(&mut buf).unwrap();
        assert!(len > 0 && len < buf.len());
        assert!(stats.export(&mut [0u8; 2]).is_err());
    }
}

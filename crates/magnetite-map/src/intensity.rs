use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Running mean and covariance of the sample intensities observed in a voxel.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct IntensityMeanCov {
    pub mean: f32,
    pub cov: f32,
}

unsafe impl Zeroable for IntensityMeanCov {}
unsafe impl Pod for IntensityMeanCov {}

impl IntensityMeanCov {
    /// Folds a hit's intensity into the statistics. `point_count` is the sample count
    /// before this hit; `reset` discards the history, e.g. on a covariance reset.
    pub fn update_hit(&mut self, intensity: f32, point_count: u32, reset: bool) {
        if reset || point_count == 0 {
            self.mean = intensity;
            self.cov = 0.0;
            return;
        }
        let n = point_count as f32;
        let delta = intensity - self.mean;
        let mean = self.mean + delta / (n + 1.0);
        self.cov = (n * self.cov + delta * (intensity - mean)) / (n + 1.0);
        self.mean = mean;
    }
}

/// Saturating per-voxel hit and miss counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct HitMissCount {
    pub hit: u32,
    pub miss: u32,
}

unsafe impl Zeroable for HitMissCount {}
unsafe impl Pod for HitMissCount {}

const_assert_eq!(std::mem::size_of::<HitMissCount>(), 8);

impl HitMissCount {
    pub fn record_hit(&mut self, reset: bool) {
        if reset {
            self.hit = 1;
            self.miss = 0;
        } else {
            self.hit = self.hit.saturating_add(1);
        }
    }

    pub fn record_miss(&mut self) {
        self.miss = self.miss.saturating_add(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intensity_statistics_track_constant_input() {
        let mut stats = IntensityMeanCov::default();
        for count in 0..10 {
            stats.update_hit(7.5, count, false);
        }
        assert_eq!(stats.mean, 7.5);
        assert_eq!(stats.cov, 0.0);
    }

    #[test]
    fn intensity_mean_and_variance_match_direct_computation() {
        let samples = [1.0f32, 3.0, 5.0, 7.0];
        let mut stats = IntensityMeanCov::default();
        for (count, &sample) in samples.iter().enumerate() {
            stats.update_hit(sample, count as u32, false);
        }
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        let variance: f32 =
            samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / samples.len() as f32;
        assert!((stats.mean - mean).abs() < 1e-5);
        assert!((stats.cov - variance).abs() < 1e-4);
    }

    #[test]
    fn reset_discards_history() {
        let mut stats = IntensityMeanCov::default();
        stats.update_hit(1.0, 0, false);
        stats.update_hit(9.0, 1, false);
        stats.update_hit(4.0, 2, true);
        assert_eq!(stats.mean, 4.0);
        assert_eq!(stats.cov, 0.0);

        let mut counts = HitMissCount { hit: 10, miss: 4 };
        counts.record_hit(true);
        assert_eq!(counts, HitMissCount { hit: 1, miss: 0 });
        counts.record_miss();
        assert_eq!(counts.miss, 1);
    }

    #[test]
    fn counters_saturate() {
        let mut counts = HitMissCount {
            hit: u32::MAX,
            miss: u32::MAX,
        };
        counts.record_hit(false);
        counts.record_miss();
        assert_eq!(counts.hit, u32::MAX);
        assert_eq!(counts.miss, u32::MAX);
    }
}

use bitflags::bitflags;
use magnetite_core::geometry::{Aabb, Ray};
use magnetite_core::glam::DVec3;

bitflags! {
    /// Per-ray behavior flags, either supplied with a batch or raised by a ray filter.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RayFlags: u32 {
        /// Skip miss updates on the voxels the ray passes through.
        const EXCLUDE_RAY = 1 << 0;
        /// Treat the end voxel as a miss instead of applying the hit update.
        const EXCLUDE_SAMPLE = 1 << 1;
        /// The end voxel contributes to the miss count rather than hit.
        const END_POINT_AS_FREE = 1 << 2;
        /// Raised by a ray filter: the sample was clipped short of the true endpoint, so it
        /// does not represent a surface observation.
        const CLIPPED_END = 1 << 3;
    }
}

/// A pre-integration ray filter.
///
/// The filter may shorten either endpoint, raise [`RayFlags`] bits (notably
/// [`RayFlags::CLIPPED_END`]), or return `false` to drop the ray entirely. Integration
/// invokes the filter at most once per ray, before walking.
pub type RayFilterFn = dyn Fn(&mut DVec3, &mut DVec3, &mut RayFlags) -> bool + Send + Sync;

/// The default filter: rejects rays with non-finite endpoints and optionally clips rays
/// longer than `max_range` (ignored when `max_range <= 0`).
pub fn good_ray_filter(
    start: &mut DVec3,
    end: &mut DVec3,
    flags: &mut RayFlags,
    max_range: f64,
) -> bool {
    if !start.is_finite() || !end.is_finite() {
        return false;
    }
    if max_range > 0.0 {
        let range = start.distance(*end);
        if range > max_range {
            *end = *start + (*end - *start) * (max_range / range);
            flags.insert(RayFlags::CLIPPED_END);
        }
    }
    true
}

/// Clips a ray to `bounds`, dropping rays entirely outside. Raises
/// [`RayFlags::CLIPPED_END`] when the sample end moves.
pub fn clip_ray_filter(
    start: &mut DVec3,
    end: &mut DVec3,
    flags: &mut RayFlags,
    bounds: &Aabb,
) -> bool {
    if !start.is_finite() || !end.is_finite() {
        return false;
    }
    if bounds.contains(*start) && bounds.contains(*end) {
        return true;
    }

    let ray = Ray::between(*start, *end);
    let Some([t0, t1]) = ray.cast_at_aabb(*bounds) else {
        return false;
    };
    // The segment parameterization runs over [0, 1].
    let t0 = t0.max(0.0);
    let t1 = t1.min(1.0);
    if t0 >= t1 {
        return false;
    }

    if t1 < 1.0 {
        *end = ray.position_at(t1);
        flags.insert(RayFlags::CLIPPED_END);
    }
    if t0 > 0.0 {
        *start = ray.position_at(t0);
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn non_finite_rays_are_rejected() {
        let mut flags = RayFlags::default();
        let mut start = DVec3::new(f64::NAN, 0.0, 0.0);
        let mut end = DVec3::ZERO;
        assert!(!good_ray_filter(&mut start, &mut end, &mut flags, 0.0));

        let mut start = DVec3::ZERO;
        let mut end = DVec3::new(0.0, f64::INFINITY, 0.0);
        assert!(!good_ray_filter(&mut start, &mut end, &mut flags, 0.0));
    }

    #[test]
    fn long_rays_are_clipped_to_range() {
        let mut flags = RayFlags::default();
        let mut start = DVec3::ZERO;
        let mut end = DVec3::new(10.0, 0.0, 0.0);
        assert!(good_ray_filter(&mut start, &mut end, &mut flags, 2.5));
        assert_eq!(end, DVec3::new(2.5, 0.0, 0.0));
        assert!(flags.contains(RayFlags::CLIPPED_END));
    }

    #[test]
    fn short_rays_pass_unclipped() {
        let mut flags = RayFlags::default();
        let mut start = DVec3::ZERO;
        let mut end = DVec3::new(1.0, 0.0, 0.0);
        assert!(good_ray_filter(&mut start, &mut end, &mut flags, 2.5));
        assert_eq!(end, DVec3::new(1.0, 0.0, 0.0));
        assert!(!flags.contains(RayFlags::CLIPPED_END));
    }

    #[test]
    fn clip_to_box_shortens_the_sample_end() {
        let bounds = Aabb::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        let mut flags = RayFlags::default();
        let mut start = DVec3::ZERO;
        let mut end = DVec3::new(5.0, 0.0, 0.0);
        assert!(clip_ray_filter(&mut start, &mut end, &mut flags, &bounds));
        assert_eq!(start, DVec3::ZERO);
        assert_eq!(end, DVec3::new(1.0, 0.0, 0.0));
        assert!(flags.contains(RayFlags::CLIPPED_END));
    }

    #[test]
    fn rays_outside_the_box_are_dropped() {
        let bounds = Aabb::new(DVec3::splat(-1.0), DVec3::splat(1.0));
        let mut flags = RayFlags::default();
        let mut start = DVec3::new(2.0, 2.0, 2.0);
        let mut end = DVec3::new(3.0, 2.0, 2.0);
        assert!(!clip_ray_filter(&mut start, &mut end, &mut flags, &bounds));
        assert!(!flags.contains(RayFlags::CLIPPED_END));
    }
}

use crate::key::Key;
use crate::map::OccupancyMap;

use magnetite_core::glam::DVec3;

/// One voxel reported by [`walk_segment_keys`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentVisit {
    pub key: Key,
    /// Distance along the segment at which it enters this voxel.
    pub enter_range: f64,
    /// Distance along the segment at which it exits this voxel.
    pub exit_range: f64,
    /// True only for the last voxel emitted: the voxel containing the segment end.
    pub is_end_voxel: bool,
}

/// Walks the voxels crossed by the segment `start -> end`, in traversal order, from the
/// voxel containing `start` to the voxel containing `end` inclusive.
///
/// Implements Amanatides & Woo's traversal: at each step the walk advances along the axis
/// with the nearest voxel border, breaking ties in X, Y, Z order and never stepping along
/// an axis the segment does not move in. The `visitor` may return `false` to stop the walk.
/// Returns the number of voxels visited.
pub fn walk_segment_keys(
    map: &OccupancyMap,
    start: DVec3,
    end: DVec3,
    visitor: &mut dyn FnMut(SegmentVisit) -> bool,
) -> usize {
    let start_key = map.voxel_key(start);
    let end_key = map.voxel_key(end);
    let resolution = map.resolution();
    let dims = map.region_voxel_dims();

    let mut direction = end - start;
    let mut length_sq = direction.length_squared();

    if length_sq < 1e-3 * resolution * resolution && start_key == end_key {
        visitor(SegmentVisit {
            key: start_key,
            enter_range: 0.0,
            exit_range: 0.0,
            is_end_voxel: true,
        });
        return 1;
    }

    if length_sq < 1e-3 && start_key != end_key {
        // Degenerate segment straddling a voxel border: walk along the key lattice instead.
        direction = map.voxel_centre(end_key) - map.voxel_centre(start_key);
        length_sq = direction.length_squared();
    }

    let length = length_sq.sqrt();
    let direction = direction / length;
    let start_voxel_min = map.voxel_centre(start_key) - DVec3::splat(0.5 * resolution);

    let mut step = [0i32; 3];
    let mut t_max = [f64::INFINITY; 3];
    let mut t_delta = [f64::INFINITY; 3];
    let mut t_limit = [0.0f64; 3];
    for axis in 0..3 {
        if direction[axis] != 0.0 {
            step[axis] = if direction[axis] > 0.0 { 1 } else { -1 };
            t_delta[axis] = resolution / direction[axis].abs();
            let next_border = start_voxel_min[axis]
                + if direction[axis] > 0.0 { resolution } else { 0.0 };
            t_max[axis] = (next_border - start[axis]) / direction[axis];
            t_limit[axis] = length;
        }
    }

    let mut current = start_key;
    let mut enter_range = 0.0;
    let mut visited = 0;
    loop {
        if current == end_key {
            break;
        }

        let mut axis = 0;
        if t_max[1] < t_max[axis] {
            axis = 1;
        }
        if t_max[2] < t_max[axis] {
            axis = 2;
        }
        if t_max[axis] > t_limit[axis] {
            break;
        }

        visited += 1;
        let proceed = visitor(SegmentVisit {
            key: current,
            enter_range,
            exit_range: t_max[axis],
            is_end_voxel: false,
        });
        if !proceed {
            return visited;
        }

        current.step_axis(axis, step[axis], dims);
        enter_range = t_max[axis];
        t_max[axis] += t_delta[axis];
    }

    visited += 1;
    visitor(SegmentVisit {
        key: end_key,
        enter_range,
        exit_range: length,
        is_end_voxel: true,
    });
    visited
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;
    use crate::map::MapFlags;

    use approx::assert_relative_eq;
    use magnetite_core::glam::U8Vec3;

    fn test_map() -> OccupancyMap {
        OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::empty())
    }

    fn collect_visits(map: &OccupancyMap, start: DVec3, end: DVec3) -> Vec<SegmentVisit> {
        let mut visits = Vec::new();
        walk_segment_keys(map, start, end, &mut |visit| {
            visits.push(visit);
            true
        });
        visits
    }

    #[test]
    fn axis_aligned_walk_visits_every_voxel() {
        let map = test_map();
        let visits = collect_visits(&map, DVec3::ZERO, DVec3::new(0.95, 0.0, 0.0));

        assert_eq!(visits.len(), 10);
        assert!(visits[..9].iter().all(|v| !v.is_end_voxel));
        assert!(visits[9].is_end_voxel);

        for (i, visit) in visits.iter().enumerate() {
            let centre = map.voxel_centre(visit.key);
            assert_relative_eq!(centre.x, 0.05 + 0.1 * i as f64, epsilon = 1e-9);
            assert_relative_eq!(centre.y, 0.05);
        }

        // Ranges partition the segment.
        assert_relative_eq!(visits[0].enter_range, 0.0);
        for pair in visits.windows(2) {
            assert_relative_eq!(pair[0].exit_range, pair[1].enter_range);
        }
        assert_relative_eq!(visits[9].exit_range, 0.95, epsilon = 1e-9);
    }

    #[test]
    fn degenerate_segment_visits_only_the_containing_voxel() {
        let map = test_map();
        let point = DVec3::new(0.04, 0.04, 0.04);
        let visits = collect_visits(&map, point, point + DVec3::splat(1e-4));
        assert_eq!(visits.len(), 1);
        assert!(visits[0].is_end_voxel);
        assert_eq!(visits[0].key, map.voxel_key(point));
        assert_eq!(visits[0].exit_range, 0.0);
    }

    #[test]
    fn zero_axis_is_never_stepped() {
        let map = test_map();
        // Start on an exact voxel border in y; the walk must hold y fixed.
        let visits = collect_visits(
            &map,
            DVec3::new(0.05, 0.1, 0.05),
            DVec3::new(0.75, 0.1, 0.05),
        );
        let y_key = map.voxel_key(DVec3::new(0.05, 0.1, 0.05)).local_key().y;
        assert!(visits.iter().all(|v| v.key.local_key().y == y_key));
    }

    #[test]
    fn diagonal_tie_breaks_in_axis_order() {
        let map = test_map();
        // A perfect diagonal from a voxel corner: every border crossing ties on all axes.
        let visits = collect_visits(&map, DVec3::ZERO, DVec3::splat(0.25));
        // X steps first on a tie, then Y, then Z.
        let k0 = visits[0].key;
        let k1 = visits[1].key;
        let k2 = visits[2].key;
        let k3 = visits[3].key;
        assert_eq!(k1.local_key().x, k0.local_key().x + 1);
        assert_eq!(k1.local_key().y, k0.local_key().y);
        assert_eq!(k2.local_key().y, k0.local_key().y + 1);
        assert_eq!(k2.local_key().z, k0.local_key().z);
        assert_eq!(k3.local_key().z, k0.local_key().z + 1);
    }

    #[test]
    fn walk_crosses_region_boundaries() {
        let map = test_map();
        // Region 0 spans [-1.6, 1.6); walk across the positive x boundary.
        let visits = collect_visits(
            &map,
            DVec3::new(1.45, 0.0, 0.0),
            DVec3::new(1.75, 0.0, 0.0),
        );
        assert_eq!(visits.len(), 4);
        assert_eq!(visits[0].key.region_key().x, 0);
        assert_eq!(visits[3].key.region_key().x, 1);
        assert_eq!(visits[3].key.local_key().x, 1);
    }

    #[test]
    fn visitor_stop_aborts_the_walk() {
        let map = test_map();
        let mut seen = 0;
        let visited = walk_segment_keys(
            &map,
            DVec3::ZERO,
            DVec3::new(0.95, 0.0, 0.0),
            &mut |_| {
                seen += 1;
                seen < 3
            },
        );
        assert_eq!(visited, 3);
        assert_eq!(seen, 3);
    }
}

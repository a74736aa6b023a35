use crate::glam::DVec3;

/// An axis-aligned box in world coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_and_half_extents(center: DVec3, half_extents: DVec3) -> Self {
        Self {
            min: center - half_extents,
            max: center + half_extents,
        }
    }

    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

#[derive(Clone, Copy)]
pub struct Ray {
    pub start: DVec3,
    velocity: DVec3,
    inverse_velocity: DVec3,
}

impl Ray {
    pub fn new(start: DVec3, velocity: DVec3) -> Self {
        Self {
            start,
            velocity,
            inverse_velocity: 1.0 / velocity,
        }
    }

    pub fn between(start: DVec3, end: DVec3) -> Self {
        Self::new(start, end - start)
    }

    pub fn velocity(&self) -> DVec3 {
        self.velocity
    }

    pub fn inverse_velocity(&self) -> DVec3 {
        self.inverse_velocity
    }

    pub fn position_at(&self, t: f64) -> DVec3 {
        self.start + t * self.velocity
    }

    /// If the ray intersects `aabb`, returns `[tmin, tmax]`, the entrance and exit times of the ray.
    ///
    /// Implemented as branchless, vectorized "slab method". Does not attempt to handle NaNs properly.
    ///
    /// Refer to [this reference](https://tavianator.com/2015/ray_box_nan.html).
    pub fn cast_at_aabb(&self, aabb: Aabb) -> Option<[f64; 2]> {
        let t1 = (aabb.min - self.start) * self.inverse_velocity;
        let t2 = (aabb.max - self.start) * self.inverse_velocity;

        let tmin = t1.min(t2).max_element();
        let tmax = t1.max(t2).min_element();

        (tmax >= tmin.max(0.0)).then(|| [tmin, tmax])
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

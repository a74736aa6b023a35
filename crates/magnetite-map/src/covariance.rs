use bytemuck::{Pod, Zeroable};
use magnetite_core::glam::{DMat3, DVec3};
use static_assertions::const_assert_eq;

/// Lower bound keeping the NDT probability update away from the log-odds asymptotes.
const PROBABILITY_EPSILON: f64 = 1e-9;
/// Below this, the maximum likelihood projection is ill conditioned and the standard miss
/// update applies instead.
const PROJECTION_EPSILON: f64 = 1e-12;

/// The packed square root of a voxel's sample covariance.
///
/// `triangular` stores the lower-triangular matrix `M`, row packed as
/// `[(0,0), (1,0), (1,1), (2,0), (2,1), (2,2)]`, such that `M Mᵀ` is the accumulated
/// covariance `P` of the sample positions in the voxel. `P` itself is never stored; updates
/// operate on the square-root form to preserve conditioning.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct CovarianceVoxel {
    pub triangular: [f32; 6],
}

unsafe impl Zeroable for CovarianceVoxel {}
unsafe impl Pod for CovarianceVoxel {}

const_assert_eq!(std::mem::size_of::<CovarianceVoxel>(), 24);

impl CovarianceVoxel {
    /// Seeds the square root as `sensor_noise · I`, making the covariance `sensor_noise² · I`.
    /// The non-zero seed keeps [`solve_triangular`](Self::solve_triangular) well defined
    /// even when all samples are coplanar.
    pub fn initialise(&mut self, sensor_noise: f32) {
        self.triangular = [sensor_noise, 0.0, sensor_noise, 0.0, 0.0, sensor_noise];
    }

    /// Solves `M x = y` for `x` by forward substitution on the packed lower triangle.
    pub fn solve_triangular(&self, y: DVec3) -> DVec3 {
        let c = &self.triangular;
        let x0 = y.x / c[0] as f64;
        let x1 = (y.y - c[1] as f64 * x0) / c[2] as f64;
        let x2 = (y.z - c[3] as f64 * x0 - c[4] as f64 * x1) / c[5] as f64;
        DVec3::new(x0, x1, x2)
    }

    /// The lower-triangular square root `M`.
    pub fn sqrt_matrix(&self) -> DMat3 {
        let c = &self.triangular;
        DMat3::from_cols(
            DVec3::new(c[0] as f64, c[1] as f64, c[3] as f64),
            DVec3::new(0.0, c[2] as f64, c[4] as f64),
            DVec3::new(0.0, 0.0, c[5] as f64),
        )
    }

    /// The accumulated sample covariance `M Mᵀ`.
    pub fn covariance_matrix(&self) -> DMat3 {
        let m = self.sqrt_matrix();
        m * m.transpose()
    }
}

/// Dot product of the j-th and k-th columns of the augmented square root `A`.
///
/// `A` is 4x3, packed into 9 values with the represented entries:
///
/// ```text
/// a[0] a[1] a[3]
///  .   a[2] a[4]
///  .    .   a[5]
/// a[6] a[7] a[8]
/// ```
fn packed_dot(a: &[f64; 9], j: usize, k: usize) -> f64 {
    const COL_FIRST_EL: [usize; 3] = [0, 1, 3];
    let indj = COL_FIRST_EL[j];
    let indk = COL_FIRST_EL[k];
    let m = j.min(k);
    let mut d = a[6 + k] * a[6 + j];
    for i in 0..=m {
        d += a[indj + i] * a[indk + i];
    }
    d
}

/// Unpacks the stored square root and the new sample into the augmented matrix `A` such
/// that `Aᵀ A = n/(n+1)·P + n/(n+1)²·(z-μ)(z-μ)ᵀ`, the covariance update for appending one
/// sample.
fn unpack_covariance(cov: &CovarianceVoxel, point_count: u32, sample_to_mean: DVec3) -> [f64; 9] {
    let one_on_count_plus_one = 1.0 / (point_count as f64 + 1.0);
    let sc_1 = if point_count > 0 {
        (point_count as f64 * one_on_count_plus_one).sqrt()
    } else {
        1.0
    };
    let sc_2 = one_on_count_plus_one * (point_count as f64).sqrt();

    let mut a = [0.0; 9];
    for i in 0..6 {
        a[i] = sc_1 * cov.triangular[i] as f64;
    }
    a[6] = sc_2 * sample_to_mean.x;
    a[7] = sc_2 * sample_to_mean.y;
    a[8] = sc_2 * sample_to_mean.z;
    a
}

/// Applies a hit to a voxel's occupancy and packed covariance.
///
/// The covariance is (re)seeded whenever the voxel transitions to occupied: on the first
/// observation, on the first sample, or when the occupancy has decayed below
/// `reinitialise_threshold` after at least `reinitialise_sample_count` samples. The latter
/// handles voxels occupied by a transient object which later becomes occupied again: the
/// old distribution no longer describes the new surface. The sample count gate prevents
/// repeated reseeding while the value oscillates around the threshold.
///
/// The voxel mean is not updated here; the caller appends the sample to the mean and
/// increments the count afterwards, resetting both first when this returns `true`.
///
/// The covariance update appends the sample on the square-root form: the augmented 4x3
/// matrix is reduced back to a triangular square root by a modified Gram-Schmidt
/// decomposition (Maybeck 1978, Stochastic Models, Estimation and Control, vol 1, p381).
#[allow(clippy::too_many_arguments)]
pub fn calculate_hit_with_covariance(
    cov: &mut CovarianceVoxel,
    value: &mut f32,
    sample: DVec3,
    voxel_mean: DVec3,
    point_count: u32,
    hit_value: f32,
    unobserved_value: f32,
    sensor_noise: f32,
    reinitialise_threshold: f32,
    reinitialise_sample_count: u32,
) -> bool {
    let initial_value = *value;
    let was_unobserved = initial_value == unobserved_value;

    let reinitialised = was_unobserved
        || point_count == 0
        || (initial_value < reinitialise_threshold && point_count >= reinitialise_sample_count);
    if reinitialised {
        cov.initialise(sensor_noise);
        *value = hit_value;
    } else {
        *value += hit_value;
    }

    // On a reseed the old mean and count no longer apply; fold the sample in as the first.
    let (point_count, sample_to_mean) = if reinitialised {
        (0, DVec3::ZERO)
    } else {
        (point_count, sample - voxel_mean)
    };

    let mut a = unpack_covariance(cov, point_count, sample_to_mean);
    for k in 0..3 {
        let ind1 = (k * (k + 3)) >> 1; // packed index of the (k, k) term
        let indk = ind1 - k; // packed index of the start of row k
        let ak = packed_dot(&a, k, k).sqrt();
        cov.triangular[ind1] = ak as f32;
        if ak > 0.0 {
            let aki = 1.0 / ak;
            for j in (k + 1)..3 {
                let indj = (j * (j + 1)) >> 1;
                let indkj = indj + k;
                let mut c = packed_dot(&a, j, k) * aki;
                cov.triangular[indkj] = c as f32;
                c *= aki;
                a[j + 6] -= c * a[k + 6];
                for l in 0..=k {
                    a[indj + l] -= c * a[indk + l];
                }
            }
        }
    }

    reinitialised
}

/// Applies an NDT miss (ray passthrough) to a voxel's occupancy.
///
/// Implements the update of:
/// > 3D normal distributions transform occupancy maps: an efficient representation for
/// > mapping in dynamic environments — Saarinen, Andreasson, Stoyanov, Lilienthal.
///
/// An unobserved voxel takes `miss_value` directly; a voxel with fewer than
/// `sample_threshold` samples takes the standard miss adjustment. Otherwise the voxel's
/// Gaussian modulates the update: the ray's maximum likelihood point `x_ML` within the
/// distribution determines how strongly the passthrough contradicts the stored surface.
/// Returns the point the update was evaluated at (`x_ML`, or the mean when the standard
/// update applied).
#[allow(clippy::too_many_arguments)]
pub fn calculate_miss_ndt(
    cov: &CovarianceVoxel,
    value: &mut f32,
    sensor: DVec3,
    sample: DVec3,
    voxel_mean: DVec3,
    point_count: u32,
    unobserved_value: f32,
    miss_value: f32,
    sensor_noise: f32,
    sample_threshold: u32,
) -> DVec3 {
    if *value == unobserved_value {
        // First touch of the voxel. Apply the miss value as is.
        *value = miss_value;
        return voxel_mean;
    }

    if point_count < sample_threshold {
        // Too few points to resolve a Gaussian. Use the standard value update.
        *value += miss_value;
        return voxel_mean;
    }

    let sensor_ray = (sample - sensor).normalize();
    let sensor_to_mean = sensor - voxel_mean;

    // With P = M Mᵀ, solving on the triangle evaluates the P⁻¹ products without forming an
    // inverse:
    //   x_ML = sensor + t·l  with  t = -(a·b) / (a·a),  a = M⁻¹l,  b = M⁻¹(sensor - μ)
    let a = cov.solve_triangular(sensor_ray);
    let b_norm = cov.solve_triangular(sensor_to_mean);
    let a_dot_a = a.dot(a);
    if a_dot_a < PROJECTION_EPSILON {
        *value += miss_value;
        return voxel_mean;
    }
    let t = -a.dot(b_norm) / a_dot_a;
    let voxel_maximum_likelihood = sensor_ray * t + sensor;

    let p_x_ml_given_voxel = (-0.5
        * cov
            .solve_triangular(voxel_maximum_likelihood - voxel_mean)
            .length_squared())
    .exp();

    let sensor_noise_variance = sensor_noise as f64 * sensor_noise as f64;
    let p_x_ml_given_sample =
        (-0.5 * (voxel_maximum_likelihood - sample).length_squared() / sensor_noise_variance).exp();

    // The adaptation rate derives from the configured miss value.
    let scaling_factor = 1.0 - 1.0 / (1.0 + (miss_value as f64).exp());
    let probability_update = (0.5 - scaling_factor * p_x_ml_given_voxel * (1.0 - p_x_ml_given_sample))
        .clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);

    let adjustment = (probability_update / (1.0 - probability_update)).ln();
    if adjustment.is_finite() {
        *value += adjustment as f32;
    }

    voxel_maximum_likelihood
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

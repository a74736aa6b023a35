use magnetite_core::glam::Vec3;

const NORMAL_QUANTA: f32 = 16383.0;
const NORMAL_MASK: u32 = 0x3FFF;
const NORMAL_SHIFT_X: u32 = 0;
const NORMAL_SHIFT_Y: u32 = 15;
const NORMAL_SET_BIT: u32 = 1 << 30;
const NORMAL_SIGN_BIT_Z: u32 = 1 << 31;

/// Decodes a quantized incident normal.
///
/// See [`encode_normal`] for the bit layout. Returns the zero vector when the validity bit
/// is clear.
pub fn decode_normal(packed_normal: u32) -> Vec3 {
    let mut x = 2.0 * (((packed_normal >> NORMAL_SHIFT_X) & NORMAL_MASK) as f32 / NORMAL_QUANTA)
        - 1.0;
    let mut y = 2.0 * (((packed_normal >> NORMAL_SHIFT_Y) & NORMAL_MASK) as f32 / NORMAL_QUANTA)
        - 1.0;
    x = x.clamp(-1.0, 1.0);
    y = y.clamp(-1.0, 1.0);
    let z = (1.0 - (x * x + y * y)).clamp(-1.0, 1.0);

    if packed_normal & NORMAL_SET_BIT == 0 {
        return Vec3::ZERO;
    }

    let z = z.max(0.0).sqrt() * if packed_normal & NORMAL_SIGN_BIT_Z != 0 { -1.0 } else { 1.0 };
    Vec3::new(x, y, z)
}

/// Encodes a normalized vector into 32 bits: 15 bits each for the X and Y channels, bit 30
/// marking a valid (non-zero) normal and bit 31 carrying the sign of Z. The Z magnitude is
/// recovered from X and Y on decode.
pub fn encode_normal(normal: Vec3) -> u32 {
    let mut n = 0u32;

    // Adjust from [-1, 1] to [0, 1] per channel before quantizing.
    let x = 0.5 * (normal.x.clamp(-1.0, 1.0) + 1.0);
    let y = 0.5 * (normal.y.clamp(-1.0, 1.0) + 1.0);

    n |= ((x * NORMAL_QUANTA) as u32 & NORMAL_MASK) << NORMAL_SHIFT_X;
    n |= ((y * NORMAL_QUANTA) as u32 & NORMAL_MASK) << NORMAL_SHIFT_Y;

    if normal.z < 0.0 {
        n |= NORMAL_SIGN_BIT_Z;
    }
    if normal != Vec3::ZERO {
        n |= NORMAL_SET_BIT;
    }

    n
}

/// Folds a new incident ray (sensor to sample) into the running normal estimate.
///
/// A zero stored normal re-initializes regardless of `point_count`. The incident ray need
/// not be normalized; degenerate rays contribute a zero direction.
pub fn update_incident_normal(packed_normal: u32, incident_ray: Vec3, point_count: u32) -> u32 {
    let normal = decode_normal(packed_normal);

    let point_count = if normal != Vec3::ZERO { point_count } else { 0 };
    let one_on_count_plus_one = 1.0 / (point_count as f32 + 1.0);

    let length_sq = incident_ray.length_squared();
    let incident = if length_sq > 1e-6 {
        incident_ray / length_sq.sqrt()
    } else {
        Vec3::ZERO
    };

    let mut updated = normal + (incident - normal) * one_on_count_plus_one;
    let length_sq = updated.length_squared();
    updated = if length_sq > 1e-6 {
        updated / length_sq.sqrt()
    } else {
        Vec3::ZERO
    };

    encode_normal(updated)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_normal_is_invalid() {
        let packed = encode_normal(Vec3::ZERO);
        assert_eq!(packed & NORMAL_SET_BIT, 0);
        assert_eq!(decode_normal(packed), Vec3::ZERO);
    }

    #[test]
    fn encode_decode_round_trip() {
        for normal in [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(0.577, 0.577, 0.577),
            Vec3::new(-0.577, 0.577, -0.577),
        ] {
            let decoded = decode_normal(encode_normal(normal));
            assert!(
                (decoded - normal).length() < 2e-3,
                "normal {normal:?} decoded {decoded:?}"
            );
            assert!((decoded.length() - 1.0).abs() < 2e-3);
        }
    }

    #[test]
    fn first_ray_initializes_the_estimate() {
        let incident = Vec3::new(0.0, 0.0, 2.0);
        let packed = update_incident_normal(0, incident, 17);
        let decoded = decode_normal(packed);
        assert!((decoded - Vec3::new(0.0, 0.0, 1.0)).length() < 1e-3);
    }

    #[test]
    fn estimate_converges_toward_repeated_direction() {
        let mut packed = update_incident_normal(0, Vec3::new(1.0, 0.0, 0.0), 0);
        for count in 1..20 {
            packed = update_incident_normal(packed, Vec3::new(0.0, 1.0, 0.0), count);
        }
        let decoded = decode_normal(packed);
        assert!(decoded.y > 0.9);
    }
}

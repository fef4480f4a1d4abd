//! Pose composition
//!
//! All matrices are flat 4x4 in row-major order.

use depthlink_protocol::Matrices;
use std::f64::consts::FRAC_PI_2;

pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Flips the X and Z axes from the provider's camera space to the viewer's
pub const COORDINATE_FLIP: Mat4 = [
    -1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, -1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Number of bytes in a serialized pose
pub const POSE_BYTES: usize = 64;

pub fn rotation_x(angle: f64) -> Mat4 {
    let (s, c) = angle.sin_cos();
    let (s, c) = (s as f32, c as f32);
    [
        1.0, 0.0, 0.0, 0.0, //
        0.0, c, -s, 0.0, //
        0.0, s, c, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]
}

pub fn multiply(a: &Mat4, b: &Mat4) -> Mat4 {
    let mut out = [0.0f32; 16];
    for row in 0..4 {
        for col in 0..4 {
            out[row * 4 + col] = (0..4).map(|k| a[row * 4 + k] * b[k * 4 + col]).sum();
        }
    }
    out
}

/// General 4x4 inverse by cofactor expansion; `None` for singular matrices
pub fn invert(m: &Mat4) -> Option<Mat4> {
    let m: [f64; 16] = m.map(f64::from);
    let mut inv = [0.0f64; 16];

    inv[0] = m[5] * m[10] * m[15] - m[5] * m[11] * m[14] - m[9] * m[6] * m[15]
        + m[9] * m[7] * m[14]
        + m[13] * m[6] * m[11]
        - m[13] * m[7] * m[10];
    inv[4] = -m[4] * m[10] * m[15] + m[4] * m[11] * m[14] + m[8] * m[6] * m[15]
        - m[8] * m[7] * m[14]
        - m[12] * m[6] * m[11]
        + m[12] * m[7] * m[10];
    inv[8] = m[4] * m[9] * m[15] - m[4] * m[11] * m[13] - m[8] * m[5] * m[15]
        + m[8] * m[7] * m[13]
        + m[12] * m[5] * m[11]
        - m[12] * m[7] * m[9];
    inv[12] = -m[4] * m[9] * m[14] + m[4] * m[10] * m[13] + m[8] * m[5] * m[14]
        - m[8] * m[6] * m[13]
        - m[12] * m[5] * m[10]
        + m[12] * m[6] * m[9];
    inv[1] = -m[1] * m[10] * m[15] + m[1] * m[11] * m[14] + m[9] * m[2] * m[15]
        - m[9] * m[3] * m[14]
        - m[13] * m[2] * m[11]
        + m[13] * m[3] * m[10];
    inv[5] = m[0] * m[10] * m[15] - m[0] * m[11] * m[14] - m[8] * m[2] * m[15]
        + m[8] * m[3] * m[14]
        + m[12] * m[2] * m[11]
        - m[12] * m[3] * m[10];
    inv[9] = -m[0] * m[9] * m[15] + m[0] * m[11] * m[13] + m[8] * m[1] * m[15]
        - m[8] * m[3] * m[13]
        - m[12] * m[1] * m[11]
        + m[12] * m[3] * m[9];
    inv[13] = m[0] * m[9] * m[14] - m[0] * m[10] * m[13] - m[8] * m[1] * m[14]
        + m[8] * m[2] * m[13]
        + m[12] * m[1] * m[10]
        - m[12] * m[2] * m[9];
    inv[2] = m[1] * m[6] * m[15] - m[1] * m[7] * m[14] - m[5] * m[2] * m[15]
        + m[5] * m[3] * m[14]
        + m[13] * m[2] * m[7]
        - m[13] * m[3] * m[6];
    inv[6] = -m[0] * m[6] * m[15] + m[0] * m[7] * m[14] + m[4] * m[2] * m[15]
        - m[4] * m[3] * m[14]
        - m[12] * m[2] * m[7]
        + m[12] * m[3] * m[6];
    inv[10] = m[0] * m[5] * m[15] - m[0] * m[7] * m[13] - m[4] * m[1] * m[15]
        + m[4] * m[3] * m[13]
        + m[12] * m[1] * m[7]
        - m[12] * m[3] * m[5];
    inv[14] = -m[0] * m[5] * m[14] + m[0] * m[6] * m[13] + m[4] * m[1] * m[14]
        - m[4] * m[2] * m[13]
        - m[12] * m[1] * m[6]
        + m[12] * m[2] * m[5];
    inv[3] = -m[1] * m[6] * m[11] + m[1] * m[7] * m[10] + m[5] * m[2] * m[11]
        - m[5] * m[3] * m[10]
        - m[9] * m[2] * m[7]
        + m[9] * m[3] * m[6];
    inv[7] = m[0] * m[6] * m[11] - m[0] * m[7] * m[10] - m[4] * m[2] * m[11]
        + m[4] * m[3] * m[10]
        + m[8] * m[2] * m[7]
        - m[8] * m[3] * m[6];
    inv[11] = -m[0] * m[5] * m[11] + m[0] * m[7] * m[9] + m[4] * m[1] * m[11]
        - m[4] * m[3] * m[9]
        - m[8] * m[1] * m[7]
        + m[8] * m[3] * m[5];
    inv[15] = m[0] * m[5] * m[10] - m[0] * m[6] * m[9] - m[4] * m[1] * m[10]
        + m[4] * m[2] * m[9]
        + m[8] * m[1] * m[6]
        - m[8] * m[2] * m[5];

    let det = m[0] * inv[0] + m[1] * inv[4] + m[2] * inv[8] + m[3] * inv[12];
    if det.abs() < 1e-12 || !det.is_finite() {
        return None;
    }

    Some(inv.map(|v| (v / det) as f32))
}

/// Camera pose relative to the groundplane, in viewer coordinates:
/// `flip · camera · inverse(rotX(-π/2) · groundplane)`
pub fn relative_pose(matrices: &Matrices) -> Option<Mat4> {
    let ground = multiply(&rotation_x(-FRAC_PI_2), &matrices.groundplane);
    let ground_inv = invert(&ground)?;
    let camera = multiply(&COORDINATE_FLIP, &matrices.camera);
    Some(multiply(&camera, &ground_inv))
}

/// Serialize a pose as 16 little-endian f32 values
pub fn pose_to_bytes(pose: &Mat4) -> Vec<u8> {
    pose.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn pose_from_bytes(bytes: &[u8]) -> Option<Mat4> {
    if bytes.len() != POSE_BYTES {
        return None;
    }
    let mut pose = [0.0f32; 16];
    for (value, chunk) in pose.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(pose)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &Mat4, b: &Mat4) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{:?} != {:?}", a, b);
        }
    }

    fn translation(x: f32, y: f32, z: f32) -> Mat4 {
        [
            1.0, 0.0, 0.0, x, //
            0.0, 1.0, 0.0, y, //
            0.0, 0.0, 1.0, z, //
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    #[test]
    fn test_inverse_of_rigid_transform() {
        let m = multiply(&rotation_x(0.7), &translation(1.0, -2.0, 3.5));
        let inv = invert(&m).unwrap();
        assert_close(&multiply(&m, &inv), &IDENTITY);
        assert_close(&multiply(&inv, &m), &IDENTITY);
    }

    #[test]
    fn test_singular_matrix() {
        assert!(invert(&[0.0; 16]).is_none());
    }

    #[test]
    fn test_relative_pose_identity_inputs() {
        let matrices = Matrices {
            camera: IDENTITY,
            groundplane: IDENTITY,
        };
        let pose = relative_pose(&matrices).unwrap();
        // flip · rotX(π/2)
        assert_close(&pose, &multiply(&COORDINATE_FLIP, &rotation_x(FRAC_PI_2)));
    }

    #[test]
    fn test_relative_pose_composition() {
        let camera = multiply(&translation(0.5, 1.5, -2.0), &rotation_x(0.3));
        let groundplane = translation(0.0, -1.2, 0.0);
        let pose = relative_pose(&Matrices {
            camera,
            groundplane,
        })
        .unwrap();

        let ground = multiply(&rotation_x(-FRAC_PI_2), &groundplane);
        assert_close(
            &multiply(&pose, &ground),
            &multiply(&COORDINATE_FLIP, &camera),
        );
    }

    #[test]
    fn test_pose_bytes() {
        let pose = translation(1.0, 2.0, 3.0);
        let bytes = pose_to_bytes(&pose);
        assert_eq!(bytes.len(), POSE_BYTES);
        assert_eq!(&bytes[12..16], &1.0f32.to_le_bytes());
        assert_eq!(pose_from_bytes(&bytes), Some(pose));
        assert_eq!(pose_from_bytes(&bytes[1..]), None);
    }
}

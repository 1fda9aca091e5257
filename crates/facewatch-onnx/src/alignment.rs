//! Face alignment via a 4-DOF similarity transform.
//!
//! Warps a face to the canonical 112x112 ArcFace position given its five
//! landmarks.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// ArcFace reference landmarks for a 112x112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Returns the row-major 3x3 matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// | 0   0   1 |
/// ```
pub fn similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 9] {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (smx, smy) = mean(src);
    let (dmx, dmy) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - smx, sy - smy);
        let (dx, dy) = (dx - dmx, dy - dmy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    let (a, b) = if norm > f32::EPSILON {
        (dot / norm, cross / norm)
    } else {
        (1.0, 0.0)
    };
    let tx = dmx - (a * smx - b * smy);
    let ty = dmy - (b * smx + a * smy);

    [a, -b, tx, b, a, ty, 0.0, 0.0, 1.0]
}

/// Warp `image` so that `landmarks` land on the reference positions.
///
/// Pixels outside the source are black. Coincident landmarks fall back to a
/// pure translation.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    let matrix = similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    match Projection::from_matrix(matrix) {
        Some(projection) => {
            warp_into(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
        }
        None => tracing::debug!("degenerate landmarks, alignment skipped"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &[f32; 9], (x, y): (f32, f32)) -> (f32, f32) {
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    #[test]
    fn test_identity_transform() {
        let m = similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[2].abs() < 1e-3 && m[5].abs() < 1e-3);
    }

    #[test]
    fn test_scaled_and_shifted_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 30.0, y * 2.0 + 10.0));
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = apply(&m, *s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_rotation_is_recovered() {
        // Rotate the reference by 90 degrees: (x, y) -> (-y, x).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (200.0 - y, x));
        let m = similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3].abs() - 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_bright_patch_lands_on_reference_eye() {
        let mut img = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 58..63 {
            for x in 78..83 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&img, &src);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));

        let (rx, ry) = REFERENCE_LANDMARKS_112[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "max={brightest}");
    }

    #[test]
    fn test_coincident_landmarks_still_warp() {
        let img = RgbImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        let aligned = align_face(&img, &[(10.0, 10.0); 5]);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }
}

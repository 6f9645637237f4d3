//! Eye-line alignment of a face crop.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};

use crate::types::Landmarks;

/// Angle (radians) of the line through the two eye landmarks.
///
/// Zero when the eyes share an x coordinate.
pub fn eye_angle(landmarks: &Landmarks) -> f32 {
    let dx = landmarks[0].0 - landmarks[1].0;
    let dy = landmarks[0].1 - landmarks[1].1;
    if dx == 0.0 {
        0.0
    } else {
        (dy / dx).atan()
    }
}

/// Rotate `crop` about its centre so the eyes lie on a horizontal line.
///
/// Output keeps the input dimensions; uncovered corners are black. The
/// returned landmarks are rotated with the image and clamped to its bounds.
pub fn align(crop: &RgbImage, landmarks: &Landmarks) -> (RgbImage, Landmarks) {
    let angle = eye_angle(landmarks);
    if angle == 0.0 {
        return (crop.clone(), *landmarks);
    }

    // imageproc rotates clockwise; undoing the eye tilt is the opposite turn.
    let theta = -angle;
    let rotated = rotate_about_center(crop, theta, Interpolation::Bilinear, Rgb([0, 0, 0]));

    let (w, h) = (crop.width() as f32, crop.height() as f32);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (sin, cos) = theta.sin_cos();
    let moved = landmarks.map(|(x, y)| {
        let (rx, ry) = (x - cx, y - cy);
        (
            (cx + rx * cos - ry * sin).clamp(0.0, w),
            (cy + rx * sin + ry * cos).clamp(0.0, h),
        )
    });

    (rotated, moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn landmarks(left_eye: (f32, f32), right_eye: (f32, f32)) -> Landmarks {
        [left_eye, right_eye, (80.0, 90.0), (60.0, 120.0), (100.0, 120.0)]
    }

    #[test]
    fn test_level_eyes_leave_crop_untouched() {
        let crop = RgbImage::from_pixel(160, 160, Rgb([10, 20, 30]));
        let lm = landmarks((50.0, 60.0), (110.0, 60.0));
        let (out, out_lm) = align(&crop, &lm);
        assert_eq!(out, crop);
        assert_eq!(out_lm, lm);
    }

    #[test]
    fn test_tilted_eyes_become_horizontal() {
        let crop = RgbImage::from_pixel(160, 160, Rgb([10, 20, 30]));
        let lm = landmarks((40.0, 60.0), (120.0, 80.0));
        let (out, out_lm) = align(&crop, &lm);
        assert_eq!(out.dimensions(), (160, 160));
        assert!(
            (out_lm[0].1 - out_lm[1].1).abs() < 1e-3,
            "eyes at {:?} / {:?}",
            out_lm[0],
            out_lm[1]
        );
        assert!(eye_angle(&out_lm).abs() < 1e-4);
    }

    #[test]
    fn test_vertical_eye_line_is_zero_angle() {
        let lm = landmarks((80.0, 40.0), (80.0, 90.0));
        assert_eq!(eye_angle(&lm), 0.0);
    }
}

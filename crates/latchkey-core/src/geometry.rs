//! Geometry normalization: detector box → square, frame-bounded region →
//! aligned 160×160 crop.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::alignment;
use crate::types::{BoundingBox, Landmarks, NormalizedCrop, CROP_SIZE};

/// Expand the shorter side so the box is square about the original centre.
pub fn square(b: &BoundingBox) -> BoundingBox {
    let w = b.width() as f32;
    let h = b.height() as f32;
    let side = w.max(h);

    let left = (b.left as f32 + w * 0.5 - side * 0.5) as i32;
    let top = (b.top as f32 + h * 0.5 - side * 0.5) as i32;
    let side = side as i32;

    BoundingBox {
        left,
        top,
        right: left + side,
        bottom: top + side,
        landmarks: b.landmarks,
    }
}

/// Clamp every edge into the frame. `None` when nothing is left.
pub fn clip(b: &BoundingBox, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
    let (w, h) = (frame_width as i32, frame_height as i32);
    let clipped = BoundingBox {
        left: b.left.clamp(0, w),
        top: b.top.clamp(0, h),
        right: b.right.clamp(0, w),
        bottom: b.bottom.clamp(0, h),
        landmarks: b.landmarks,
    };
    (!clipped.is_empty()).then_some(clipped)
}

/// Translate landmarks by the box origin and scale them into crop space.
///
/// Each axis is scaled by its own side so the result tracks the resize that
/// produced the crop; for the square boxes that survive clipping untouched
/// both factors equal `CROP_SIZE / height`.
pub fn remap_landmarks(b: &BoundingBox) -> Landmarks {
    let sx = CROP_SIZE as f32 / b.width() as f32;
    let sy = CROP_SIZE as f32 / b.height() as f32;
    let limit = CROP_SIZE as f32;
    b.landmarks.map(|(x, y)| {
        (
            ((x - b.left as f32) * sx).clamp(0.0, limit),
            ((y - b.top as f32) * sy).clamp(0.0, limit),
        )
    })
}

/// Convert a detector box into an aligned crop ready for encoding.
///
/// Returns `None` if the squared box has zero area once clipped to the
/// frame; the face is simply skipped for this frame.
pub fn normalize(face: &BoundingBox, frame: &RgbImage) -> Option<NormalizedCrop> {
    let region = clip(&square(face), frame.width(), frame.height())?;
    let landmarks = remap_landmarks(&region);

    let crop = imageops::crop_imm(
        frame,
        region.left as u32,
        region.top as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    let resized = imageops::resize(&crop, CROP_SIZE, CROP_SIZE, FilterType::Triangle);

    let (image, landmarks) = alignment::align(&resized, &landmarks);
    Some(NormalizedCrop { image, landmarks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(left: i32, top: i32, right: i32, bottom: i32) -> BoundingBox {
        let cx = (left + right) as f32 / 2.0;
        let cy = (top + bottom) as f32 / 2.0;
        BoundingBox {
            left,
            top,
            right,
            bottom,
            landmarks: [
                (cx - 10.0, cy - 10.0),
                (cx + 10.0, cy - 10.0),
                (cx, cy),
                (cx - 8.0, cy + 12.0),
                (cx + 8.0, cy + 12.0),
            ],
        }
    }

    fn frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([90, 120, 150]))
    }

    #[test]
    fn test_square_expands_shorter_side_about_centre() {
        let sq = square(&bbox(100, 100, 140, 200));
        assert_eq!(sq.width(), 100);
        assert_eq!(sq.height(), 100);
        assert_eq!((sq.left, sq.top, sq.right, sq.bottom), (70, 100, 170, 200));
    }

    #[test]
    fn test_square_keeps_square_box() {
        let b = bbox(10, 20, 60, 70);
        assert_eq!(square(&b), b);
    }

    #[test]
    fn test_clip_clamps_edges() {
        let c = clip(&bbox(-20, -5, 50, 40), 40, 30).unwrap();
        assert_eq!((c.left, c.top, c.right, c.bottom), (0, 0, 40, 30));
    }

    #[test]
    fn test_clip_outside_frame_is_none() {
        assert!(clip(&bbox(700, 500, 800, 600), 640, 480).is_none());
        assert!(clip(&bbox(-100, -100, -10, -10), 640, 480).is_none());
    }

    #[test]
    fn test_normalize_outside_frame_yields_no_crop() {
        let f = frame(640, 480);
        assert!(normalize(&bbox(650, 100, 700, 150), &f).is_none());
        assert!(normalize(&bbox(100, -300, 150, -200), &f).is_none());
    }

    #[test]
    fn test_normalize_degenerate_box_yields_no_crop() {
        let f = frame(640, 480);
        assert!(normalize(&bbox(100, 100, 100, 100), &f).is_none());
    }

    #[test]
    fn test_normalize_crop_is_160_square() {
        let f = frame(640, 480);
        for b in [
            bbox(100, 100, 180, 200),
            bbox(0, 0, 640, 480),
            bbox(-30, 400, 60, 520),
            bbox(600, 10, 700, 50),
        ] {
            let crop = normalize(&b, &f).unwrap();
            assert_eq!(crop.image.dimensions(), (CROP_SIZE, CROP_SIZE));
            for (x, y) in crop.landmarks {
                assert!((0.0..=CROP_SIZE as f32).contains(&x), "x={x} for {b:?}");
                assert!((0.0..=CROP_SIZE as f32).contains(&y), "y={y} for {b:?}");
            }
        }
    }

    #[test]
    fn test_remap_landmarks_scales_into_crop_space() {
        let mut b = bbox(100, 100, 180, 180);
        b.landmarks[0] = (120.0, 140.0);
        let lm = remap_landmarks(&b);
        assert!((lm[0].0 - 40.0).abs() < 1e-4);
        assert!((lm[0].1 - 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_remap_landmarks_clamps_strays() {
        let mut b = bbox(100, 100, 180, 180);
        b.landmarks[4] = (300.0, 50.0);
        let lm = remap_landmarks(&b);
        assert_eq!(lm[4], (CROP_SIZE as f32, 0.0));
    }
}

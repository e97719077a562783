//! Dab mask rendering: every brush shape reduces to a rectangular fix15
//! coverage mask that gets stamped onto layer content.

use pixels::BIT15;
use protocol::{ClassicDab, MyPaintDab, PixelDab};

/// A rendered dab: coverage values and where their top-left corner lands on
/// the canvas.
#[derive(Debug)]
pub struct DabMask {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    pub coverage: Vec<u16>,
}

fn falloff(normalized_distance: f32, hardness: f32) -> f32 {
    if normalized_distance >= 1.0 {
        0.0
    } else if normalized_distance <= hardness {
        1.0
    } else {
        (1.0 - normalized_distance) / (1.0 - hardness)
    }
}

fn to_fix15(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * BIT15 as f32).round() as u16
}

/// Soft round mask for a classic dab. `center_x`/`center_y` are in pixels
/// (quarter-pixel positions divide down before this), `size` is the diameter
/// in 1/256 pixel steps.
pub fn classic_dab_mask(center_x: f32, center_y: f32, dab: &ClassicDab) -> Option<DabMask> {
    let diameter = dab.size as f32 / 256.0;
    if diameter <= 0.0 {
        return None;
    }
    let radius = diameter / 2.0;
    let hardness = dab.hardness as f32 / 255.0;

    let left = (center_x - radius).floor() as i32;
    let top = (center_y - radius).floor() as i32;
    let right = (center_x + radius).ceil() as i32;
    let bottom = (center_y + radius).ceil() as i32;
    let width = (right - left).max(1) as u32;
    let height = (bottom - top).max(1) as u32;

    let mut coverage = vec![0u16; (width * height) as usize];
    for row in 0..height {
        let pixel_y = top as f32 + row as f32 + 0.5;
        for column in 0..width {
            let pixel_x = left as f32 + column as f32 + 0.5;
            let distance = ((pixel_x - center_x).powi(2) + (pixel_y - center_y).powi(2)).sqrt();
            let value = if radius < 1.0 {
                // Subpixel dab: spread the whole dab's weight over one pixel.
                if distance < 0.5 { radius * radius * 4.0 } else { 0.0 }
            } else {
                falloff(distance / radius, hardness)
            };
            coverage[(row * width + column) as usize] = to_fix15(value);
        }
    }
    Some(DabMask {
        left,
        top,
        width,
        height,
        coverage,
    })
}

/// Solid round or square mask for a pixel dab, diameter in whole pixels.
pub fn pixel_dab_mask(center_x: i32, center_y: i32, dab: &PixelDab, square: bool) -> Option<DabMask> {
    let diameter = dab.size as u32;
    if diameter == 0 {
        return None;
    }
    let left = center_x - (diameter / 2) as i32;
    let top = center_y - (diameter / 2) as i32;

    let mut coverage = vec![0u16; (diameter * diameter) as usize];
    if square {
        coverage.fill(BIT15);
    } else {
        let center = diameter as f32 / 2.0;
        let radius_squared = center * center;
        for row in 0..diameter {
            for column in 0..diameter {
                let dx = column as f32 + 0.5 - center;
                let dy = row as f32 + 0.5 - center;
                if dx * dx + dy * dy <= radius_squared {
                    coverage[(row * diameter + column) as usize] = BIT15;
                }
            }
        }
    }
    Some(DabMask {
        left,
        top,
        width: diameter,
        height: diameter,
        coverage,
    })
}

/// Elliptical soft mask for a MyPaint dab: the classic falloff evaluated in
/// a rotated, aspect-scaled space.
pub fn mypaint_dab_mask(center_x: f32, center_y: f32, dab: &MyPaintDab) -> Option<DabMask> {
    let diameter = dab.size as f32 / 256.0;
    if diameter <= 0.0 {
        return None;
    }
    let radius = diameter / 2.0;
    let hardness = dab.hardness as f32 / 255.0;
    let aspect = 1.0 + dab.aspect_ratio as f32 / 64.0;
    let angle = dab.angle as f32 * (std::f32::consts::PI / 128.0);
    let (sin, cos) = angle.sin_cos();

    // The bounding box covers the unrotated major axis in both dimensions.
    let left = (center_x - radius).floor() as i32;
    let top = (center_y - radius).floor() as i32;
    let right = (center_x + radius).ceil() as i32;
    let bottom = (center_y + radius).ceil() as i32;
    let width = (right - left).max(1) as u32;
    let height = (bottom - top).max(1) as u32;

    let mut coverage = vec![0u16; (width * height) as usize];
    for row in 0..height {
        let pixel_y = top as f32 + row as f32 + 0.5 - center_y;
        for column in 0..width {
            let pixel_x = left as f32 + column as f32 + 0.5 - center_x;
            let rotated_x = pixel_x * cos + pixel_y * sin;
            let rotated_y = (pixel_y * cos - pixel_x * sin) * aspect;
            let distance = (rotated_x * rotated_x + rotated_y * rotated_y).sqrt();
            let value = if radius < 1.0 {
                if distance < 0.5 { radius * radius * 4.0 } else { 0.0 }
            } else {
                falloff(distance / radius, hardness)
            };
            coverage[(row * width + column) as usize] = to_fix15(value);
        }
    }
    Some(DabMask {
        left,
        top,
        width,
        height,
        coverage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_round_dab_of_size_one_covers_one_pixel() {
        let dab = PixelDab {
            x: 0,
            y: 0,
            size: 1,
            opacity: 255,
        };
        let mask = pixel_dab_mask(10, 10, &dab, false).expect("mask");
        assert_eq!((mask.width, mask.height), (1, 1));
        assert_eq!(mask.coverage, vec![BIT15]);
        assert_eq!((mask.left, mask.top), (10, 10));
    }

    #[test]
    fn pixel_square_dab_covers_the_full_box() {
        let dab = PixelDab {
            x: 0,
            y: 0,
            size: 4,
            opacity: 255,
        };
        let mask = pixel_dab_mask(8, 8, &dab, true).expect("mask");
        assert_eq!(mask.coverage.len(), 16);
        assert!(mask.coverage.iter().all(|&value| value == BIT15));
        assert_eq!((mask.left, mask.top), (6, 6));
    }

    #[test]
    fn pixel_round_dab_clips_the_corners() {
        let dab = PixelDab {
            x: 0,
            y: 0,
            size: 8,
            opacity: 255,
        };
        let mask = pixel_dab_mask(0, 0, &dab, false).expect("mask");
        assert_eq!(mask.coverage[0], 0, "corner is outside the circle");
        let center_index = (4 * mask.width + 4) as usize;
        assert_eq!(mask.coverage[center_index], BIT15);
    }

    #[test]
    fn classic_dab_is_full_at_center_and_fades_to_zero() {
        let dab = ClassicDab {
            x: 0,
            y: 0,
            size: 16 * 256,
            hardness: 128,
            opacity: 255,
        };
        let mask = classic_dab_mask(32.0, 32.0, &dab).expect("mask");
        let center_index =
            ((mask.height / 2) * mask.width + mask.width / 2) as usize;
        assert_eq!(mask.coverage[center_index], BIT15);
        assert_eq!(mask.coverage[0], 0, "bounding box corner is past the radius");
    }

    #[test]
    fn classic_hardness_widens_the_solid_core() {
        let soft = ClassicDab {
            x: 0,
            y: 0,
            size: 16 * 256,
            hardness: 0,
            opacity: 255,
        };
        let hard = ClassicDab {
            x: 0,
            y: 0,
            size: 16 * 256,
            hardness: 255,
            opacity: 255,
        };
        let soft_mask = classic_dab_mask(32.0, 32.0, &soft).expect("soft mask");
        let hard_mask = classic_dab_mask(32.0, 32.0, &hard).expect("hard mask");
        let probe = ((soft_mask.height / 2) * soft_mask.width + soft_mask.width - 2) as usize;
        assert!(
            hard_mask.coverage[probe] >= soft_mask.coverage[probe],
            "hard brush keeps more coverage near the rim"
        );
    }

    #[test]
    fn subpixel_classic_dab_still_leaves_a_trace() {
        let dab = ClassicDab {
            x: 0,
            y: 0,
            size: 128,
            hardness: 255,
            opacity: 255,
        };
        let mask = classic_dab_mask(10.5, 10.5, &dab).expect("mask");
        assert!(mask.coverage.iter().any(|&value| value > 0));
        assert!(mask.coverage.iter().all(|&value| value < BIT15));
    }

    #[test]
    fn mypaint_aspect_squashes_one_axis() {
        let round = MyPaintDab {
            x: 0,
            y: 0,
            size: 16 * 256,
            hardness: 255,
            opacity: 255,
            angle: 0,
            aspect_ratio: 0,
        };
        let squashed = MyPaintDab {
            aspect_ratio: 192,
            ..round
        };
        let round_mask = mypaint_dab_mask(32.0, 32.0, &round).expect("round mask");
        let squashed_mask = mypaint_dab_mask(32.0, 32.0, &squashed).expect("squashed mask");
        let total = |mask: &DabMask| -> u64 {
            mask.coverage.iter().map(|&value| value as u64).sum()
        };
        assert!(total(&squashed_mask) < total(&round_mask));
    }
}

//! Binary-mask image operations shared by both detectors.
//!
//! Masks are row-major `Vec<u8>` with 0 = background and 255 = foreground.

use std::collections::VecDeque;

use image::GrayImage;

pub const FOREGROUND: u8 = 255;

/// Gaussian sigma matching an odd box size the way OpenCV derives it.
pub fn sigma_for_kernel(kernel: u32) -> f32 {
    0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

pub fn blur(image: &GrayImage, kernel: u32) -> GrayImage {
    if kernel <= 1 {
        return image.clone();
    }
    image::imageops::blur(image, sigma_for_kernel(kernel))
}

/// 3x3 erosion. Pixels outside the frame count as background.
pub fn erode(mask: &[u8], width: usize, height: usize) -> Vec<u8> {
    morph(mask, width, height, true)
}

/// 3x3 dilation.
pub fn dilate(mask: &[u8], width: usize, height: usize) -> Vec<u8> {
    morph(mask, width, height, false)
}

fn morph(mask: &[u8], width: usize, height: usize, erode: bool) -> Vec<u8> {
    let mut out = vec![0u8; mask.len()];
    for y in 0..height {
        for x in 0..width {
            let mut hit = erode;
            'window: for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    let set = nx >= 0
                        && ny >= 0
                        && (nx as usize) < width
                        && (ny as usize) < height
                        && mask[ny as usize * width + nx as usize] != 0;
                    if erode && !set {
                        hit = false;
                        break 'window;
                    }
                    if !erode && set {
                        hit = true;
                        break 'window;
                    }
                }
            }
            if hit {
                out[y * width + x] = FOREGROUND;
            }
        }
    }
    out
}

/// Opening removes speckle, closing fills small holes.
pub fn open_close(mask: &[u8], width: usize, height: usize) -> Vec<u8> {
    let opened = dilate(&erode(mask, width, height), width, height);
    erode(&dilate(&opened, width, height), width, height)
}

/// Zero every 8-connected component smaller than `min_area` and return the
/// number of foreground pixels left.
pub fn filter_components(mask: &mut [u8], width: usize, height: usize, min_area: usize) -> usize {
    let mut label = vec![false; mask.len()];
    let mut kept = 0;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for start in 0..mask.len() {
        if mask[start] == 0 || label[start] {
            continue;
        }
        label[start] = true;
        queue.push_back(start);
        component.clear();

        while let Some(idx) = queue.pop_front() {
            component.push(idx);
            let (x, y) = ((idx % width) as i64, (idx / width) as i64);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx as usize >= width || ny as usize >= height {
                        continue;
                    }
                    let n = ny as usize * width + nx as usize;
                    if mask[n] != 0 && !label[n] {
                        label[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }

        if component.len() >= min_area {
            kept += component.len();
        } else {
            for idx in &component {
                mask[*idx] = 0;
            }
        }
    }
    kept
}

/// Fraction of changed pixels required for motion at a given sensitivity.
pub fn motion_fraction_threshold(sensitivity: f64) -> f64 {
    0.01 + (1.0 - sensitivity.clamp(0.0, 1.0)) * 0.09
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with_square(width: usize, height: usize, x0: usize, y0: usize, side: usize) -> Vec<u8> {
        let mut mask = vec![0u8; width * height];
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                mask[y * width + x] = FOREGROUND;
            }
        }
        mask
    }

    #[test]
    fn open_close_drops_isolated_pixels() {
        let mut mask = mask_with_square(20, 20, 5, 5, 6);
        mask[0] = FOREGROUND;
        mask[19 * 20 + 19] = FOREGROUND;
        let cleaned = open_close(&mask, 20, 20);
        assert_eq!(cleaned[0], 0);
        assert_eq!(cleaned[19 * 20 + 19], 0);
        assert_eq!(cleaned.iter().filter(|v| **v != 0).count(), 36);
    }

    #[test]
    fn small_components_are_filtered() {
        let mut mask = mask_with_square(30, 30, 1, 1, 3);
        for y in 10..20 {
            for x in 10..20 {
                mask[y * 30 + x] = FOREGROUND;
            }
        }
        let kept = filter_components(&mut mask, 30, 30, 50);
        assert_eq!(kept, 100);
        assert_eq!(mask[30 + 1], 0);
    }

    #[test]
    fn sensitivity_maps_to_fraction() {
        assert!((motion_fraction_threshold(1.0) - 0.01).abs() < 1e-9);
        assert!((motion_fraction_threshold(0.0) - 0.10).abs() < 1e-9);
        assert!((motion_fraction_threshold(0.5) - 0.055).abs() < 1e-9);
    }

    #[test]
    fn sigma_for_default_kernel() {
        assert!((sigma_for_kernel(21) - 3.5).abs() < 1e-6);
    }
}

use image::GrayImage;

use crate::config::MotionSettings;
use crate::detect::ops::{self, FOREGROUND};
use crate::detect::{MotionDetector, TemporalFilter, ZoneMaskCache};

/// Blend weight of the current frame when the reference drifts without motion.
const REFERENCE_BLEND: f32 = 0.05;
const TEMPORAL_WINDOW: usize = 5;
const TEMPORAL_REQUIRED: usize = 3;

/// Frame differencing against a slowly adapting reference frame.
pub struct FrameDifferencer {
    settings: MotionSettings,
    reference: Option<Reference>,
    zones: ZoneMaskCache,
    temporal: TemporalFilter,
}

struct Reference {
    width: u32,
    height: u32,
    pixels: Vec<f32>,
}

impl FrameDifferencer {
    pub fn new(settings: MotionSettings) -> Self {
        let zones = ZoneMaskCache::new(settings.zones.clone(), settings.exclusion_zones.clone());
        Self {
            settings,
            reference: None,
            zones,
            temporal: TemporalFilter::new(TEMPORAL_WINDOW, TEMPORAL_REQUIRED),
        }
    }

    /// Single-frame decision before temporal smoothing.
    fn evaluate(&mut self, frame: &GrayImage) -> bool {
        let blurred = ops::blur(frame, self.settings.blur_kernel);
        let (width, height) = blurred.dimensions();

        let seeded = matches!(&self.reference, Some(r) if r.width == width && r.height == height);
        if !seeded {
            self.reference = Some(Reference {
                width,
                height,
                pixels: blurred.as_raw().iter().map(|p| f32::from(*p)).collect(),
            });
            return false;
        }
        let Some(reference) = self.reference.as_mut() else {
            return false;
        };

        let threshold = f32::from(self.settings.diff_threshold);
        let diff: Vec<u8> = blurred
            .as_raw()
            .iter()
            .zip(&reference.pixels)
            .map(|(cur, prev)| {
                if (f32::from(*cur) - prev).abs() > threshold {
                    FOREGROUND
                } else {
                    0
                }
            })
            .collect();

        let (w, h) = (width as usize, height as usize);
        let mut mask = ops::open_close(&diff, w, h);
        let zone_mask = self.zones.get(width, height, width, height);
        zone_mask.apply(&mut mask);
        let considered = zone_mask.active_count();

        let changed = ops::filter_components(&mut mask, w, h, self.settings.min_area as usize);
        let motion = considered > 0
            && changed as f64 / considered as f64
                > ops::motion_fraction_threshold(self.settings.sensitivity);

        if motion {
            for (r, cur) in reference.pixels.iter_mut().zip(blurred.as_raw()) {
                *r = f32::from(*cur);
            }
        } else {
            for (r, cur) in reference.pixels.iter_mut().zip(blurred.as_raw()) {
                *r += (f32::from(*cur) - *r) * REFERENCE_BLEND;
            }
        }
        motion
    }
}

impl MotionDetector for FrameDifferencer {
    fn name(&self) -> &'static str {
        "differencing"
    }

    fn detect(&mut self, frame: &GrayImage) -> bool {
        let raw = self.evaluate(frame);
        self.temporal.push(raw)
    }

    fn reset(&mut self) {
        self.reference = None;
        self.temporal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Zone;
    use image::Luma;

    fn background() -> GrayImage {
        GrayImage::from_pixel(160, 120, Luma([40]))
    }

    /// Large bright square alternating between the left and right half.
    fn with_square(step: u32) -> GrayImage {
        let mut img = background();
        let x0 = if step % 2 == 0 { 10 } else { 90 };
        for y in 30..90 {
            for x in x0..x0 + 60 {
                img.put_pixel(x, y, Luma([230]));
            }
        }
        img
    }

    #[test]
    fn static_scene_never_triggers() {
        let mut detector = FrameDifferencer::new(MotionSettings::default());
        for _ in 0..20 {
            assert!(!detector.detect(&background()));
        }
    }

    #[test]
    fn moving_object_triggers_after_temporal_quorum() {
        let mut detector = FrameDifferencer::new(MotionSettings::default());
        assert!(!detector.detect(&background()));
        let results: Vec<bool> = (0..5).map(|i| detector.detect(&with_square(i))).collect();
        assert_eq!(results, vec![false, false, true, true, true]);
    }

    #[test]
    fn full_frame_exclusion_suppresses_motion() {
        let mut settings = MotionSettings::default();
        settings.exclusion_zones = vec![Zone::Rect {
            x: 0.0,
            y: 0.0,
            width: 160.0,
            height: 120.0,
        }];
        let mut detector = FrameDifferencer::new(settings);
        detector.detect(&background());
        for i in 0..10 {
            assert!(!detector.detect(&with_square(i)));
        }
    }

    #[test]
    fn reset_forgets_reference() {
        let mut detector = FrameDifferencer::new(MotionSettings::default());
        detector.detect(&background());
        detector.reset();
        // First frame after reset only seeds the reference.
        assert!(!detector.detect(&with_square(0)));
    }
}

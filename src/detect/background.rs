use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::config::MotionSettings;
use crate::detect::ops::{self, FOREGROUND};
use crate::detect::{MotionDetector, TemporalFilter, ZoneMaskCache};

/// Frames wider than this are downscaled before analysis.
pub const MAX_ANALYSIS_WIDTH: u32 = 320;
const INITIAL_VARIANCE: f32 = 15.0 * 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 75.0 * 75.0;
/// Darker than the background by at most this ratio counts as shadow.
const SHADOW_RATIO: f32 = 0.5;
const TEMPORAL_WINDOW: usize = 5;
const TEMPORAL_REQUIRED: usize = 4;

/// Per-pixel running Gaussian background model.
pub struct BackgroundSubtractor {
    settings: MotionSettings,
    model: Option<Model>,
    zones: ZoneMaskCache,
    temporal: TemporalFilter,
}

struct Model {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    frames_seen: u32,
}

impl Model {
    fn seed(frame: &GrayImage) -> Self {
        let (width, height) = frame.dimensions();
        Self {
            width,
            height,
            mean: frame.as_raw().iter().map(|p| f32::from(*p)).collect(),
            variance: vec![INITIAL_VARIANCE; (width * height) as usize],
            frames_seen: 1,
        }
    }

    /// Classify every pixel, then fold the frame into the model.
    fn apply(&mut self, frame: &GrayImage, settings: &MotionSettings) -> Vec<u8> {
        self.frames_seen = self.frames_seen.saturating_add(1);
        let rate = 1.0 / self.frames_seen.min(settings.history.max(1)) as f32;
        let var_threshold = settings.var_threshold as f32;
        let mut mask = vec![0u8; self.mean.len()];

        for (i, pixel) in frame.as_raw().iter().enumerate() {
            let value = f32::from(*pixel);
            let mean = &mut self.mean[i];
            let variance = &mut self.variance[i];
            let delta = value - *mean;
            let distance = delta * delta;

            if distance > var_threshold * *variance {
                let shadow = settings.detect_shadows
                    && value < *mean
                    && *mean > 0.0
                    && value / *mean >= SHADOW_RATIO;
                if !shadow {
                    mask[i] = FOREGROUND;
                }
            }

            *mean += rate * delta;
            *variance = (*variance + rate * (distance - *variance)).clamp(MIN_VARIANCE, MAX_VARIANCE);
        }
        mask
    }
}

impl BackgroundSubtractor {
    pub fn new(settings: MotionSettings) -> Self {
        let zones = ZoneMaskCache::new(settings.zones.clone(), settings.exclusion_zones.clone());
        Self {
            settings,
            model: None,
            zones,
            temporal: TemporalFilter::new(TEMPORAL_WINDOW, TEMPORAL_REQUIRED),
        }
    }

    fn evaluate(&mut self, frame: &GrayImage) -> bool {
        let (source_width, source_height) = frame.dimensions();
        let analysed = downscale(frame);
        let (width, height) = analysed.dimensions();

        let seeded = matches!(&self.model, Some(m) if m.width == width && m.height == height);
        if !seeded {
            self.model = Some(Model::seed(&analysed));
            return false;
        }
        let Some(model) = self.model.as_mut() else {
            return false;
        };

        let (w, h) = (width as usize, height as usize);
        let raw = model.apply(&analysed, &self.settings);
        let mut mask = ops::dilate(&ops::erode(&raw, w, h), w, h);
        let zone_mask = self.zones.get(width, height, source_width, source_height);
        zone_mask.apply(&mut mask);
        let considered = zone_mask.active_count();

        let scale = f64::from(width * height) / f64::from((source_width * source_height).max(1));
        let min_area = (f64::from(self.settings.min_area) * scale).round().max(1.0) as usize;
        let changed = ops::filter_components(&mut mask, w, h, min_area);

        considered > 0
            && changed as f64 / considered as f64
                > ops::motion_fraction_threshold(self.settings.sensitivity)
    }
}

fn downscale(frame: &GrayImage) -> GrayImage {
    let (width, height) = frame.dimensions();
    if width <= MAX_ANALYSIS_WIDTH {
        return frame.clone();
    }
    let scaled_height = ((u64::from(height) * u64::from(MAX_ANALYSIS_WIDTH)) / u64::from(width)).max(1);
    imageops::resize(frame, MAX_ANALYSIS_WIDTH, scaled_height as u32, FilterType::Triangle)
}

impl MotionDetector for BackgroundSubtractor {
    fn name(&self) -> &'static str {
        "background-subtraction"
    }

    fn detect(&mut self, frame: &GrayImage) -> bool {
        let raw = self.evaluate(frame);
        self.temporal.push(raw)
    }

    fn reset(&mut self) {
        self.model = None;
        self.temporal.clear();
    }
}

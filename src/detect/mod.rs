//! Motion detection.
//!
//! A `MotionDetector` consumes greyscale frames one at a time and answers
//! "is there motion now". Detectors are stateful: each keeps its own reference
//! or background model plus a short temporal window that smooths out flicker.

mod background;
mod differencing;
pub mod ops;
mod zones;

use std::collections::VecDeque;

use image::GrayImage;

use crate::config::{MotionAlgorithm, MotionSettings};

pub use background::BackgroundSubtractor;
pub use differencing::FrameDifferencer;
pub use zones::{ZoneMask, ZoneMaskCache};

pub trait MotionDetector: Send {
    /// Algorithm identifier.
    fn name(&self) -> &'static str;

    /// Feed one frame. Returns the temporally smoothed motion decision.
    fn detect(&mut self, frame: &GrayImage) -> bool;

    /// Drop the reference/background model, e.g. after a reconnect.
    fn reset(&mut self);
}

pub fn build_detector(settings: &MotionSettings) -> Box<dyn MotionDetector> {
    match settings.algorithm {
        MotionAlgorithm::Differencing => Box::new(FrameDifferencer::new(settings.clone())),
        MotionAlgorithm::BackgroundSubtraction => {
            Box::new(BackgroundSubtractor::new(settings.clone()))
        }
    }
}

/// "k of the last n" vote over raw per-frame decisions.
#[derive(Debug, Clone)]
pub struct TemporalFilter {
    window: VecDeque<bool>,
    size: usize,
    required: usize,
}

impl TemporalFilter {
    pub fn new(size: usize, required: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(size),
            size,
            required,
        }
    }

    pub fn push(&mut self, raw: bool) -> bool {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(raw);
        self.window.iter().filter(|hit| **hit).count() >= self.required
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_filter_needs_quorum() {
        let mut filter = TemporalFilter::new(5, 3);
        assert!(!filter.push(true));
        assert!(!filter.push(true));
        assert!(filter.push(true));
        assert!(filter.push(false));
        assert!(filter.push(false));
        // Window is now [T, T, F, F, F] after the next push drops the first T.
        assert!(!filter.push(false));
    }

    #[test]
    fn build_detector_selects_algorithm() {
        let mut settings = MotionSettings::default();
        assert_eq!(build_detector(&settings).name(), "differencing");
        settings.algorithm = MotionAlgorithm::BackgroundSubtraction;
        assert_eq!(build_detector(&settings).name(), "background-subtraction");
    }
}

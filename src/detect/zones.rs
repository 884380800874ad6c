//! Zone geometry and per-resolution analysis masks.

use crate::config::Zone;

impl Zone {
    /// Check if a point (source-frame pixels) is inside this zone.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        match self {
            Zone::Rect {
                x: left,
                y: top,
                width,
                height,
            } => x >= *left && x < left + width && y >= *top && y < top + height,
            Zone::Polygon { points } => point_in_polygon(points, x, y),
        }
    }
}

/// Even-odd ray casting. Fewer than three points is an empty polygon.
fn point_in_polygon(points: &[[f64; 2]], x: f64, y: f64) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let [xi, yi] = points[i];
        let [xj, yj] = points[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Boolean mask at analysis resolution: true where a pixel takes part in motion analysis.
///
/// Inclusion zones restrict analysis to their union (empty = whole frame);
/// exclusion zones are then removed.
#[derive(Debug, Clone)]
pub struct ZoneMask {
    width: u32,
    height: u32,
    source_width: u32,
    source_height: u32,
    active: Vec<bool>,
    active_count: usize,
}

impl ZoneMask {
    pub fn build(
        include: &[Zone],
        exclude: &[Zone],
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
    ) -> Self {
        let sx = f64::from(source_width) / f64::from(width.max(1));
        let sy = f64::from(source_height) / f64::from(height.max(1));
        let mut active = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            for col in 0..width {
                // Sample at the pixel centre, mapped back to source coordinates.
                let x = (f64::from(col) + 0.5) * sx;
                let y = (f64::from(row) + 0.5) * sy;
                let included = include.is_empty() || include.iter().any(|z| z.contains(x, y));
                let excluded = exclude.iter().any(|z| z.contains(x, y));
                active.push(included && !excluded);
            }
        }
        let active_count = active.iter().filter(|a| **a).count();
        Self {
            width,
            height,
            source_width,
            source_height,
            active,
            active_count,
        }
    }

    pub fn matches(&self, width: u32, height: u32, source_width: u32, source_height: u32) -> bool {
        self.width == width
            && self.height == height
            && self.source_width == source_width
            && self.source_height == source_height
    }

    /// Zero every masked-out pixel of a binary mask in place.
    pub fn apply(&self, mask: &mut [u8]) {
        for (value, active) in mask.iter_mut().zip(&self.active) {
            if !active {
                *value = 0;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }
}

/// Rebuilds the mask only when the analysis or source resolution changes.
#[derive(Debug, Default)]
pub struct ZoneMaskCache {
    include: Vec<Zone>,
    exclude: Vec<Zone>,
    cached: Option<ZoneMask>,
}

impl ZoneMaskCache {
    pub fn new(include: Vec<Zone>, exclude: Vec<Zone>) -> Self {
        Self {
            include,
            exclude,
            cached: None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn get(&mut self, width: u32, height: u32, source_width: u32, source_height: u32) -> &ZoneMask {
        let mask = match self.cached.take() {
            Some(mask) if mask.matches(width, height, source_width, source_height) => mask,
            _ => {
                log::debug!(
                    "rebuilding zone mask for {}x{} (source {}x{})",
                    width,
                    height,
                    source_width,
                    source_height
                );
                ZoneMask::build(
                    &self.include,
                    &self.exclude,
                    width,
                    height,
                    source_width,
                    source_height,
                )
            }
        };
        self.cached.insert(mask)
    }
}

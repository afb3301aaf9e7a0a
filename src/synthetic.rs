// src/synthetic.rs - Generated layers for test runs
//
// Every layer is a square part centred on the field origin: one outline
// polygon plus a hatch fill whose direction alternates between X and Y from
// layer to layer.

use layerstream_shared::{
    BuildStyle, GeometrySource, Hatch, Layer, LaserMode, Point2, Polygon, SourceError, StyleMap,
};

use crate::config::SyntheticConfig;

pub const OUTLINE_TAG: u32 = 1;
pub const HATCH_TAG: u32 = 2;

pub struct SyntheticSource {
    thickness: f64,
    count: u32,
    next: u32,
    config: SyntheticConfig,
}

impl SyntheticSource {
    pub fn new(thickness: f64, count: u32, config: SyntheticConfig) -> Self {
        Self {
            thickness,
            count,
            next: 0,
            config,
        }
    }

    pub fn layer(&self, index: u32) -> Layer {
        let half = self.config.part_size_mm / 2.0;
        let mut layer = Layer::new(index, f64::from(index + 1) * self.thickness, self.thickness);

        let mut lines = Vec::new();
        let spacing = self.config.hatch_spacing_mm;
        let mut offset = -half + spacing / 2.0;
        let mut forward = true;
        while offset < half {
            let (a, b) = if index % 2 == 0 {
                (Point2::new(-half, offset), Point2::new(half, offset))
            } else {
                (Point2::new(offset, -half), Point2::new(offset, half))
            };
            lines.push(if forward { (a, b) } else { (b, a) });
            forward = !forward;
            offset += spacing;
        }
        layer.hatches.push(Hatch { geometry_tag: HATCH_TAG, lines });

        layer.polygons.push(Polygon {
            geometry_tag: OUTLINE_TAG,
            points: vec![
                Point2::new(-half, -half),
                Point2::new(half, -half),
                Point2::new(half, half),
                Point2::new(-half, half),
            ],
        });
        layer
    }
}

impl GeometrySource for SyntheticSource {
    fn has_next(&self) -> bool {
        self.next < self.count
    }

    fn read_next(&mut self) -> Result<Layer, SourceError> {
        if !self.has_next() {
            return Err(SourceError::Exhausted);
        }
        let layer = self.layer(self.next);
        self.next += 1;
        Ok(layer)
    }

    fn total_count(&self) -> u32 {
        self.count
    }
}

/// Styles for synthetic runs: outline and hatch plus the fallback, all at
/// the configured speeds. Test runs hold the laser at zero power regardless.
pub fn test_styles(config: &SyntheticConfig) -> StyleMap {
    let style = |id| BuildStyle {
        id,
        laser_power_w: 0.0,
        mark_speed: config.mark_speed,
        jump_speed: config.jump_speed,
        mode: LaserMode::Continuous,
        focus_offset_mm: 0.0,
    };
    let mut map = StyleMap::with_fallback(style(0));
    for id in [OUTLINE_TAG, HATCH_TAG] {
        if let Err(e) = map.insert(style(id)) {
            tracing::warn!("Skipping synthetic style {}: {}", id, e);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_alternate_hatch_direction() {
        let config = SyntheticConfig {
            part_size_mm: 4.0,
            hatch_spacing_mm: 1.0,
            ..SyntheticConfig::default()
        };
        let mut source = SyntheticSource::new(0.03, 2, config);
        assert_eq!(source.total_count(), 2);

        let even = source.read_next().unwrap();
        assert_eq!(even.hatches[0].lines.len(), 4);
        let (a, b) = even.hatches[0].lines[0];
        assert_eq!(a.y, b.y);
        // Serpentine: second line runs the other way
        let (c, _) = even.hatches[0].lines[1];
        assert_eq!(c.x, 2.0);
        assert_eq!(even.polygons[0].points.len(), 4);

        let odd = source.read_next().unwrap();
        let (a, b) = odd.hatches[0].lines[0];
        assert_eq!(a.x, b.x);
        assert!((odd.z_height - 0.06).abs() < 1e-12);
        assert!(!source.has_next());
    }

    #[test]
    fn test_styles_cover_all_tags() {
        let styles = test_styles(&SyntheticConfig::default());
        assert!(styles.has_fallback());
        assert_eq!(styles.len(), 3);
    }
}

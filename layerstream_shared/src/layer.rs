//! Slice geometry as delivered by a geometry source.
//!
//! All coordinates are physical millimetres in the build-plane frame. A `Layer`
//! is immutable once produced and is moved into the converter.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A batch of independent line segments sharing one geometry type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hatch {
    pub geometry_tag: u32,
    #[serde(default)]
    pub lines: Vec<(Point2, Point2)>,
}

/// An open chain of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub geometry_tag: u32,
    pub points: Vec<Point2>,
}

/// A closed chain; the closing edge back to the first point is implicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub geometry_tag: u32,
    pub points: Vec<Point2>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub index: u32,
    /// Height of the layer top above the build plate, mm.
    pub z_height: f64,
    /// Layer thickness, mm.
    pub thickness: f64,
    #[serde(default)]
    pub hatches: Vec<Hatch>,
    #[serde(default)]
    pub polylines: Vec<Polyline>,
    #[serde(default)]
    pub polygons: Vec<Polygon>,
}

impl Layer {
    pub fn new(index: u32, z_height: f64, thickness: f64) -> Self {
        Self {
            index,
            z_height,
            thickness,
            hatches: Vec::new(),
            polylines: Vec::new(),
            polygons: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hatches.iter().all(|h| h.lines.is_empty())
            && self.polylines.is_empty()
            && self.polygons.is_empty()
    }

    /// Number of geometry items (hatch batches, polylines, polygons).
    pub fn item_count(&self) -> usize {
        self.hatches.len() + self.polylines.len() + self.polygons.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_json_defaults() {
        let layer: Layer =
            serde_json::from_str(r#"{"index":4,"z_height":0.12,"thickness":0.03}"#).unwrap();
        assert_eq!(layer.index, 4);
        assert!(layer.is_empty());
        assert_eq!(layer.item_count(), 0);
    }

    #[test]
    fn test_empty_hatch_counts_as_empty() {
        let mut layer = Layer::new(0, 0.03, 0.03);
        layer.hatches.push(Hatch { geometry_tag: 1, lines: vec![] });
        assert!(layer.is_empty());
        assert_eq!(layer.item_count(), 1);
    }
}

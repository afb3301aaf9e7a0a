//! Layer geometry -> device command block conversion.
//!
//! Straight-through conversion: geometry items are emitted in source order,
//! each item as one contiguous run of commands with exactly one parameter
//! segment. Hatch ordering and skywriting are not performed here.

use layerstream_shared::{
    BuildStyle, Command, CommandBlock, FALLBACK_STYLE_TAG, Layer, ParameterSegment, Point2,
    StyleTable,
};
use thiserror::Error;

use crate::config::ScannerConfig;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("no style for geometry tag {tag} and no fallback style (tag {fallback})", fallback = FALLBACK_STYLE_TAG)]
    UnresolvedStyle { tag: u32 },
    #[error("non-finite coordinate in {item}")]
    NonFiniteCoordinate { item: String },
}

/// Physical millimetres -> signed device bits.
#[derive(Debug, Clone, Copy)]
pub struct DeviceUnits {
    pub bits_per_mm: f64,
    pub field_limit: i32,
}

impl DeviceUnits {
    pub fn from_scanner(config: &ScannerConfig) -> Self {
        Self {
            bits_per_mm: config.bits_per_mm,
            field_limit: config.field_limit,
        }
    }

    /// Converts one coordinate, clamping to the signed field range. The second
    /// value reports whether clamping happened.
    pub fn to_bits(&self, mm: f64) -> (i32, bool) {
        let limit = f64::from(self.field_limit);
        let bits = (mm * self.bits_per_mm).round();
        if bits > limit {
            (self.field_limit, true)
        } else if bits < -limit {
            (-self.field_limit, true)
        } else {
            (bits as i32, false)
        }
    }
}

pub struct LayerConverter {
    units: DeviceUnits,
}

/// Accumulates commands for one layer and tracks clamped points.
struct Emitter {
    units: DeviceUnits,
    block: CommandBlock,
    clamped: usize,
}

impl Emitter {
    fn point(&mut self, p: Point2, item: &dyn Fn() -> String) -> Result<(i32, i32), ConversionError> {
        if !p.is_finite() {
            return Err(ConversionError::NonFiniteCoordinate { item: item() });
        }
        let (x, cx) = self.units.to_bits(p.x);
        let (y, cy) = self.units.to_bits(p.y);
        if cx || cy {
            self.clamped += 1;
        }
        Ok((x, y))
    }

    fn jump(&mut self, p: Point2, item: &dyn Fn() -> String) -> Result<(), ConversionError> {
        let (x, y) = self.point(p, item)?;
        self.block.commands.push(Command::Jump { x, y });
        Ok(())
    }

    fn mark(&mut self, p: Point2, item: &dyn Fn() -> String) -> Result<(), ConversionError> {
        let (x, y) = self.point(p, item)?;
        self.block.commands.push(Command::Mark { x, y });
        Ok(())
    }

    /// Jump to the first point, mark through the rest; `closed` adds the mark
    /// back to the first point. A single point is a bare jump and an empty
    /// chain emits nothing.
    fn chain(&mut self, points: &[Point2], closed: bool, item: &dyn Fn() -> String) -> Result<(), ConversionError> {
        let Some((&first, rest)) = points.split_first() else {
            return Ok(());
        };
        self.jump(first, item)?;
        for &p in rest {
            self.mark(p, item)?;
        }
        if closed && !rest.is_empty() {
            self.mark(first, item)?;
        }
        Ok(())
    }

    /// Closes the style island started at `start` (command count before the item).
    fn close_segment(&mut self, start: usize, style: &BuildStyle) {
        let end = self.block.commands.len();
        if end > start {
            self.block
                .parameter_segments
                .push(ParameterSegment::from_style(start, end - 1, style));
        }
    }
}

impl LayerConverter {
    pub fn new(units: DeviceUnits) -> Self {
        Self { units }
    }

    pub fn from_scanner(config: &ScannerConfig) -> Self {
        Self::new(DeviceUnits::from_scanner(config))
    }

    fn resolve(&self, styles: &dyn StyleTable, tag: u32) -> Result<BuildStyle, ConversionError> {
        if let Some(style) = styles.lookup(tag) {
            return Ok(style);
        }
        tracing::debug!("No style for geometry tag {}, using fallback", tag);
        styles
            .lookup(FALLBACK_STYLE_TAG)
            .ok_or(ConversionError::UnresolvedStyle { tag })
    }

    pub fn convert(&self, layer: Layer, styles: &dyn StyleTable) -> Result<CommandBlock, ConversionError> {
        let mut out = Emitter {
            units: self.units,
            block: CommandBlock::new(layer.index, layer.thickness),
            clamped: 0,
        };

        for (i, hatch) in layer.hatches.iter().enumerate() {
            let style = self.resolve(styles, hatch.geometry_tag)?;
            let item = || format!("layer {} hatch {}", layer.index, i);
            let start = out.block.commands.len();
            for &(from, to) in &hatch.lines {
                out.jump(from, &item)?;
                out.mark(to, &item)?;
            }
            out.close_segment(start, &style);
        }

        for (i, polyline) in layer.polylines.iter().enumerate() {
            let style = self.resolve(styles, polyline.geometry_tag)?;
            let item = || format!("layer {} polyline {}", layer.index, i);
            let start = out.block.commands.len();
            out.chain(&polyline.points, false, &item)?;
            out.close_segment(start, &style);
        }

        for (i, polygon) in layer.polygons.iter().enumerate() {
            let style = self.resolve(styles, polygon.geometry_tag)?;
            let item = || format!("layer {} polygon {}", layer.index, i);
            let start = out.block.commands.len();
            out.chain(&polygon.points, true, &item)?;
            out.close_segment(start, &style);
        }

        if out.clamped > 0 {
            tracing::warn!(
                "Layer {}: {} point(s) clamped to the scan field (±{} bits)",
                layer.index,
                out.clamped,
                self.units.field_limit
            );
        }
        tracing::debug!(
            "Converted layer {}: {} commands in {} segments",
            layer.index,
            out.block.commands.len(),
            out.block.parameter_segments.len()
        );
        Ok(out.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bits_rounds_and_clamps() {
        let units = DeviceUnits { bits_per_mm: 100.0, field_limit: 1000 };
        assert_eq!(units.to_bits(1.234), (123, false));
        assert_eq!(units.to_bits(-2.5), (-250, false));
        assert_eq!(units.to_bits(10.0), (1000, false));
        assert_eq!(units.to_bits(10.01), (1000, true));
        assert_eq!(units.to_bits(-1e12), (-1000, true));
    }
}

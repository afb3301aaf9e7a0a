// Build styles: geometry-type tag -> laser parameters

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Tag used when a geometry item's own tag has no style.
pub const FALLBACK_STYLE_TAG: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaserMode {
    #[default]
    Continuous,
    Pulsed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStyle {
    pub id: u32,
    /// Laser power, W.
    pub laser_power_w: f64,
    /// mm/s
    pub mark_speed: f64,
    /// mm/s
    pub jump_speed: f64,
    #[serde(default)]
    pub mode: LaserMode,
    #[serde(default)]
    pub focus_offset_mm: f64,
}

impl BuildStyle {
    pub fn validate(&self) -> Result<(), StyleError> {
        let invalid = |reason: &str| StyleError::Invalid { id: self.id, reason: reason.to_string() };
        if !self.laser_power_w.is_finite() || self.laser_power_w < 0.0 {
            return Err(invalid("laser power must be a finite value >= 0"));
        }
        if !self.mark_speed.is_finite() || self.mark_speed <= 0.0 {
            return Err(invalid("mark speed must be > 0"));
        }
        if !self.jump_speed.is_finite() || self.jump_speed <= 0.0 {
            return Err(invalid("jump speed must be > 0"));
        }
        if !self.focus_offset_mm.is_finite() {
            return Err(invalid("focus offset must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StyleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("style {id} is invalid: {reason}")]
    Invalid { id: u32, reason: String },
    #[error("style {0} is defined more than once")]
    Duplicate(u32),
}

/// Maps a geometry-type tag to laser parameters.
pub trait StyleTable: Send + Sync {
    fn lookup(&self, geometry_tag: u32) -> Option<BuildStyle>;
}

#[derive(Debug, Deserialize)]
struct StyleFile {
    styles: Vec<BuildStyle>,
}

/// In-memory style table keyed by style id (which doubles as the geometry tag).
#[derive(Debug, Clone, Default)]
pub struct StyleMap {
    styles: HashMap<u32, BuildStyle>,
}

impl StyleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding only `style`, registered under the fallback tag.
    pub fn with_fallback(style: BuildStyle) -> Self {
        let mut map = Self::new();
        map.styles.insert(FALLBACK_STYLE_TAG, BuildStyle { id: FALLBACK_STYLE_TAG, ..style });
        map
    }

    pub fn insert(&mut self, style: BuildStyle) -> Result<(), StyleError> {
        style.validate()?;
        if self.styles.contains_key(&style.id) {
            return Err(StyleError::Duplicate(style.id));
        }
        self.styles.insert(style.id, style);
        Ok(())
    }

    /// Parse a `{"styles": [...]}` document.
    pub fn from_json_str(json: &str) -> Result<Self, StyleError> {
        let file: StyleFile = serde_json::from_str(json)?;
        let mut map = Self::new();
        for style in file.styles {
            map.insert(style)?;
        }
        tracing::debug!("Loaded {} build styles", map.len());
        Ok(map)
    }

    /// Load a JSON style config from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StyleError> {
        let path = path.as_ref();
        tracing::info!("Loading build styles from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }

    pub fn has_fallback(&self) -> bool {
        self.styles.contains_key(&FALLBACK_STYLE_TAG)
    }
}

impl StyleTable for StyleMap {
    fn lookup(&self, geometry_tag: u32) -> Option<BuildStyle> {
        self.styles.get(&geometry_tag).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_style_file() {
        let json = r#"{"styles":[
            {"id":0,"laser_power_w":150.0,"mark_speed":900.0,"jump_speed":5000.0},
            {"id":3,"laser_power_w":280.0,"mark_speed":1200.0,"jump_speed":5000.0,"mode":"pulsed","focus_offset_mm":-0.5}
        ]}"#;
        let map = StyleMap::from_json_str(json).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.has_fallback());
        let style = map.lookup(3).unwrap();
        assert_eq!(style.mode, LaserMode::Pulsed);
        assert_eq!(style.focus_offset_mm, -0.5);
        assert!(map.lookup(7).is_none());
    }

    #[test]
    fn test_duplicate_style_rejected() {
        let json = r#"{"styles":[
            {"id":1,"laser_power_w":100.0,"mark_speed":900.0,"jump_speed":5000.0},
            {"id":1,"laser_power_w":120.0,"mark_speed":900.0,"jump_speed":5000.0}
        ]}"#;
        assert!(matches!(StyleMap::from_json_str(json), Err(StyleError::Duplicate(1))));
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let json = r#"{"styles":[{"id":1,"laser_power_w":100.0,"mark_speed":0.0,"jump_speed":5000.0}]}"#;
        assert!(matches!(StyleMap::from_json_str(json), Err(StyleError::Invalid { id: 1, .. })));
    }
}

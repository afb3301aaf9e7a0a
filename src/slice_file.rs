// src/slice_file.rs - JSON-lines slice files
//
// Line 1 is a header, every following line one layer:
//   {"format":"layerstream-slice","version":1,"layer_count":N}
//   {"index":0,"z_height":0.03,"thickness":0.03,"hatches":[...],...}
// Layers are read one at a time, only when the producer asks for them.

use layerstream_shared::{GeometrySource, Layer, SourceError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const SLICE_FORMAT: &str = "layerstream-slice";
pub const SLICE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceHeader {
    pub format: String,
    pub version: u32,
    pub layer_count: u32,
}

impl SliceHeader {
    pub fn new(layer_count: u32) -> Self {
        Self {
            format: SLICE_FORMAT.to_string(),
            version: SLICE_VERSION,
            layer_count,
        }
    }
}

pub struct SliceFile {
    reader: Box<dyn BufRead + Send>,
    header: SliceHeader,
    line_no: usize,
    layers_read: u32,
}

impl SliceFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        tracing::info!("Opening slice file: {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Result<Self, SourceError> {
        let mut source = Self {
            reader: Box::new(reader),
            header: SliceHeader::new(0),
            line_no: 0,
            layers_read: 0,
        };
        let line = source.next_line()?.ok_or(SourceError::Malformed {
            line: 1,
            message: "missing header".to_string(),
        })?;
        let header: SliceHeader = serde_json::from_str(&line).map_err(|e| SourceError::Malformed {
            line: 1,
            message: format!("invalid header: {}", e),
        })?;
        if header.format != SLICE_FORMAT {
            return Err(SourceError::Malformed {
                line: 1,
                message: format!("unknown format '{}'", header.format),
            });
        }
        if header.version != SLICE_VERSION {
            return Err(SourceError::Malformed {
                line: 1,
                message: format!("unsupported version {}", header.version),
            });
        }
        tracing::debug!("Slice file declares {} layers", header.layer_count);
        source.header = header;
        Ok(source)
    }

    pub fn header(&self) -> &SliceHeader {
        &self.header
    }

    /// Next non-blank line, or `None` at end of input.
    fn next_line(&mut self) -> Result<Option<String>, SourceError> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if !buf.trim().is_empty() {
                return Ok(Some(buf.trim().to_string()));
            }
        }
    }
}

impl GeometrySource for SliceFile {
    fn has_next(&self) -> bool {
        self.layers_read < self.header.layer_count
    }

    fn read_next(&mut self) -> Result<Layer, SourceError> {
        if !self.has_next() {
            return Err(SourceError::Exhausted);
        }
        let line = self.next_line()?.ok_or_else(|| SourceError::Malformed {
            line: self.line_no + 1,
            message: format!(
                "file ended after {} of {} layers",
                self.layers_read, self.header.layer_count
            ),
        })?;
        let layer: Layer = serde_json::from_str(&line).map_err(|e| SourceError::Malformed {
            line: self.line_no,
            message: e.to_string(),
        })?;
        if !(layer.thickness.is_finite() && layer.thickness > 0.0) {
            return Err(SourceError::Malformed {
                line: self.line_no,
                message: format!("layer {} has invalid thickness {}", layer.index, layer.thickness),
            });
        }
        self.layers_read += 1;
        Ok(layer)
    }

    fn total_count(&self) -> u32 {
        self.header.layer_count
    }
}

/// Writes `layers` as a slice file.
pub fn write_slice_file(path: impl AsRef<Path>, layers: &[Layer]) -> Result<(), SourceError> {
    let path = path.as_ref();
    let mut out = BufWriter::new(File::create(path)?);
    let header = SliceHeader::new(layers.len() as u32);
    let encode = |e: serde_json::Error| SourceError::Malformed { line: 0, message: e.to_string() };
    writeln!(out, "{}", serde_json::to_string(&header).map_err(encode)?)?;
    for layer in layers {
        writeln!(out, "{}", serde_json::to_string(layer).map_err(encode)?)?;
    }
    out.flush()?;
    tracing::info!("Wrote {} layers to {}", layers.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerstream_shared::{Hatch, Point2};
    use std::io::Cursor;

    fn reader(text: &str) -> Cursor<Vec<u8>> {
        Cursor::new(text.as_bytes().to_vec())
    }

    #[test]
    fn test_reads_layers_lazily() {
        let text = concat!(
            "{\"format\":\"layerstream-slice\",\"version\":1,\"layer_count\":2}\n",
            "{\"index\":0,\"z_height\":0.03,\"thickness\":0.03}\n",
            "\n",
            "{\"index\":1,\"z_height\":0.06,\"thickness\":0.03,\"hatches\":[{\"geometry_tag\":1,\"lines\":[[{\"x\":0.0,\"y\":0.0},{\"x\":1.0,\"y\":0.0}]]}]}\n",
        );
        let mut file = SliceFile::from_reader(reader(text)).unwrap();
        assert_eq!(file.total_count(), 2);
        assert!(file.has_next());
        assert_eq!(file.read_next().unwrap().index, 0);
        let second = file.read_next().unwrap();
        assert_eq!(second.hatches.len(), 1);
        assert!(!file.has_next());
        assert!(matches!(file.read_next(), Err(SourceError::Exhausted)));
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let text = "{\"format\":\"layerstream-slice\",\"version\":1,\"layer_count\":3}\n{\"index\":0,\"z_height\":0.03,\"thickness\":0.03}\n";
        let mut file = SliceFile::from_reader(reader(text)).unwrap();
        file.read_next().unwrap();
        match file.read_next() {
            Err(SourceError::Malformed { message, .. }) => assert!(message.contains("1 of 3")),
            other => panic!("unexpected {:?}", other.map(|l| l.index)),
        }
    }

    #[test]
    fn test_bad_header_and_bad_layer() {
        assert!(SliceFile::from_reader(reader("")).is_err());
        assert!(SliceFile::from_reader(reader("{\"format\":\"gcode\",\"version\":1,\"layer_count\":1}\n")).is_err());

        let text = "{\"format\":\"layerstream-slice\",\"version\":1,\"layer_count\":1}\n{\"index\":0,\"z_height\":0.0,\"thickness\":0.0}\n";
        let mut file = SliceFile::from_reader(reader(text)).unwrap();
        assert!(matches!(file.read_next(), Err(SourceError::Malformed { line: 2, .. })));
    }

    #[test]
    fn test_write_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.slice");
        let mut layer = Layer::new(0, 0.05, 0.05);
        layer.hatches.push(Hatch {
            geometry_tag: 2,
            lines: vec![(Point2::new(0.0, 0.0), Point2::new(2.0, 0.0))],
        });
        write_slice_file(&path, &[layer.clone(), Layer::new(1, 0.1, 0.05)]).unwrap();

        let mut file = SliceFile::open(&path).unwrap();
        assert_eq!(file.total_count(), 2);
        assert_eq!(file.read_next().unwrap(), layer);
    }
}

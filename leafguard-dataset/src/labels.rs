//! YOLO label files: one `class cx cy w h` line per box, coordinates
//! normalized to the image size.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloBox {
    pub class_id: u32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Parse one label line. Blank lines yield `None`.
pub fn parse_label_line(line: &str, path: &Path, line_num: usize) -> Result<Option<YoloBox>, LabelError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let err = |message: String| LabelError::Parse {
        path: path.to_path_buf(),
        line: line_num,
        message,
    };

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() != 5 {
        return Err(err(format!("expected 5 fields, found {}", tokens.len())));
    }

    let class_id = tokens[0]
        .parse::<u32>()
        .map_err(|_| err(format!("invalid class id '{}'", tokens[0])))?;

    let mut values = [0f32; 4];
    for (slot, token) in values.iter_mut().zip(&tokens[1..]) {
        *slot = token
            .parse::<f32>()
            .map_err(|_| err(format!("invalid coordinate '{}'", token)))?;
        if !slot.is_finite() {
            return Err(err(format!("non-finite coordinate '{}'", token)));
        }
    }
    let [cx, cy, w, h] = values;
    if w <= 0.0 || h <= 0.0 {
        return Err(err(format!("box size must be positive, got {}x{}", w, h)));
    }

    Ok(Some(YoloBox { class_id, cx, cy, w, h }))
}

/// Read every box in a label file, in file order.
///
/// A missing file reads as empty.
pub fn read_boxes(path: &Path) -> Result<Vec<YoloBox>, LabelError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LabelError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut boxes = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(b) = parse_label_line(line, path, idx + 1)? {
            boxes.push(b);
        }
    }
    Ok(boxes)
}

/// Distinct class ids in a label file.
pub fn read_classes(path: &Path) -> Result<BTreeSet<u32>, LabelError> {
    Ok(read_boxes(path)?.into_iter().map(|b| b.class_id).collect())
}

/// Like [`read_classes`], but a failure is logged and read as empty so one bad
/// file never stops a batch.
pub fn read_classes_lenient(path: &Path) -> BTreeSet<u32> {
    read_classes(path).unwrap_or_else(|e| {
        tracing::error!("Error reading labels: {}", e);
        BTreeSet::new()
    })
}

pub fn format_labels(boxes: &[YoloBox]) -> String {
    let mut out = String::new();
    for b in boxes {
        let _ = writeln!(out, "{} {:.6} {:.6} {:.6} {:.6}", b.class_id, b.cx, b.cy, b.w, b.h);
    }
    out
}

pub fn write_labels(path: &Path, boxes: &[YoloBox]) -> io::Result<()> {
    fs::write(path, format_labels(boxes))
}

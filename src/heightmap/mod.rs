//! Heightmap files for the command-line tool.
//!
//! Supports 16-bit grayscale PNG and the RAW layouts terrain editors
//! exchange (16-bit little/big-endian, 32-bit float). Integer formats are
//! normalized against a [`HeightRange`]; the erosion core itself only ever
//! sees `Grid<f32>`.

mod png;
mod raw;

use std::path::Path;

use thiserror::Error;

use crate::grid::Grid;

pub use png::{read_png, write_png, PngOptions};
pub use raw::{expected_file_size, infer_square_resolution, read_raw, write_raw, RawFormat};

#[derive(Error, Debug)]
pub enum HeightmapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid dimensions {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },
    #[error("Size mismatch: expected {expected} bytes, found {found}")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("Invalid height range: min ({0}) >= max ({1})")]
    InvalidHeightRange(f32, f32),
}

/// Heights mapped onto the full range of an integer format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightRange {
    pub min: f32,
    pub max: f32,
}

impl Default for HeightRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl HeightRange {
    pub fn new(min: f32, max: f32) -> Result<Self, HeightmapError> {
        if min >= max || !min.is_finite() || !max.is_finite() {
            return Err(HeightmapError::InvalidHeightRange(min, max));
        }
        Ok(Self { min, max })
    }

    /// Range covering every value of `grid`. A flat grid gets a unit range
    /// starting at its value.
    pub fn of(grid: &Grid<f32>) -> Self {
        let (min, max) = grid.min_max();
        if min < max {
            Self { min, max }
        } else {
            Self { min, max: min + 1.0 }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), HeightmapError> {
        Self::new(self.min, self.max).map(|_| ())
    }

    pub(crate) fn quantize(&self, value: f32) -> u16 {
        let normalized = ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0);
        (normalized * 65535.0).round() as u16
    }

    pub(crate) fn dequantize(&self, value: u16) -> f32 {
        self.min + (value as f32 / 65535.0) * (self.max - self.min)
    }
}

/// On-disk layout of a heightmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightmapFormat {
    Png,
    Raw(RawFormat),
}

impl HeightmapFormat {
    /// Guesses the format from a file extension: `.png`, `.r32`, or any
    /// other extension as little-endian 16-bit RAW.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => HeightmapFormat::Png,
            Some("r32") => HeightmapFormat::Raw(RawFormat::R32Float),
            _ => HeightmapFormat::Raw(RawFormat::R16LittleEndian),
        }
    }
}

/// Loads a heightmap. RAW files need `dimensions` unless they are square.
pub fn load(
    path: &Path,
    format: HeightmapFormat,
    dimensions: Option<(usize, usize)>,
    range: HeightRange,
) -> Result<Grid<f32>, HeightmapError> {
    match format {
        HeightmapFormat::Png => read_png(path, range),
        HeightmapFormat::Raw(raw) => {
            let (width, height) = match dimensions {
                Some(dims) => dims,
                None => {
                    let len = std::fs::metadata(path)?.len();
                    let side = infer_square_resolution(len, raw)?;
                    (side, side)
                }
            };
            read_raw(path, width, height, raw, range)
        }
    }
}

/// Saves a heightmap in the given format.
pub fn save(grid: &Grid<f32>, path: &Path, format: HeightmapFormat, range: HeightRange) -> Result<(), HeightmapError> {
    match format {
        HeightmapFormat::Png => write_png(
            grid,
            path,
            &PngOptions {
                range,
                ..Default::default()
            },
        ),
        HeightmapFormat::Raw(raw) => write_raw(grid, path, raw, range),
    }
}

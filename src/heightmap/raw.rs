//! Headerless RAW heightmaps.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::{HeightRange, HeightmapError};
use crate::grid::Grid;

/// RAW sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawFormat {
    /// 16-bit unsigned integer, little-endian (Unity default).
    #[default]
    R16LittleEndian,
    /// 16-bit unsigned integer, big-endian.
    R16BigEndian,
    /// 32-bit float, little-endian. Written and read without normalization.
    R32Float,
}

impl RawFormat {
    pub fn bytes_per_sample(self) -> u64 {
        match self {
            RawFormat::R16LittleEndian | RawFormat::R16BigEndian => 2,
            RawFormat::R32Float => 4,
        }
    }
}

/// Returns the expected file size of a `width x height` RAW file.
pub fn expected_file_size(width: usize, height: usize, format: RawFormat) -> u64 {
    (width as u64) * (height as u64) * format.bytes_per_sample()
}

/// Side length of a square RAW file of `len` bytes.
pub fn infer_square_resolution(len: u64, format: RawFormat) -> Result<usize, HeightmapError> {
    let samples = len / format.bytes_per_sample();
    let side = (samples as f64).sqrt().round() as u64;
    if side == 0 || side * side * format.bytes_per_sample() != len {
        return Err(HeightmapError::InvalidDimensions {
            width: side as usize,
            height: side as usize,
        });
    }
    Ok(side as usize)
}

/// Reads a RAW heightmap. 16-bit samples are mapped onto `range`.
pub fn read_raw(
    path: &Path,
    width: usize,
    height: usize,
    format: RawFormat,
    range: HeightRange,
) -> Result<Grid<f32>, HeightmapError> {
    if width == 0 || height == 0 {
        return Err(HeightmapError::InvalidDimensions { width, height });
    }
    if format != RawFormat::R32Float {
        range.validate()?;
    }

    let expected = expected_file_size(width, height, format);
    let found = std::fs::metadata(path)?.len();
    if found != expected {
        return Err(HeightmapError::SizeMismatch { expected, found });
    }

    let mut bytes = Vec::with_capacity(expected as usize);
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;

    let data: Vec<f32> = match format {
        RawFormat::R16LittleEndian => bytes
            .chunks_exact(2)
            .map(|b| range.dequantize(u16::from_le_bytes([b[0], b[1]])))
            .collect(),
        RawFormat::R16BigEndian => bytes
            .chunks_exact(2)
            .map(|b| range.dequantize(u16::from_be_bytes([b[0], b[1]])))
            .collect(),
        RawFormat::R32Float => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };

    Grid::from_vec(width, height, data).map_err(|_| HeightmapError::InvalidDimensions { width, height })
}

/// Writes a RAW heightmap. 16-bit formats clamp to `range`.
pub fn write_raw(grid: &Grid<f32>, path: &Path, format: RawFormat, range: HeightRange) -> Result<(), HeightmapError> {
    if format != RawFormat::R32Float {
        range.validate()?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match format {
        RawFormat::R16LittleEndian => {
            for &height in grid.iter() {
                writer.write_all(&range.quantize(height).to_le_bytes())?;
            }
        }
        RawFormat::R16BigEndian => {
            for &height in grid.iter() {
                writer.write_all(&range.quantize(height).to_be_bytes())?;
            }
        }
        RawFormat::R32Float => {
            for &height in grid.iter() {
                writer.write_all(&height.to_le_bytes())?;
            }
        }
    }

    writer.flush()?;
    Ok(())
}

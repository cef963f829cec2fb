//! 16-bit grayscale PNG heightmaps.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ImageBuffer, ImageEncoder, Luma};

use super::{HeightRange, HeightmapError};
use crate::grid::Grid;

/// Options for PNG output.
#[derive(Debug, Clone)]
pub struct PngOptions {
    /// Heights mapped to black and white.
    pub range: HeightRange,
    pub compression: CompressionType,
    pub filter: FilterType,
}

impl Default for PngOptions {
    fn default() -> Self {
        Self {
            range: HeightRange::default(),
            compression: CompressionType::Default,
            filter: FilterType::Adaptive,
        }
    }
}

impl PngOptions {
    /// Options stretching the full value range of `grid` over the 16 bits.
    pub fn auto_range(grid: &Grid<f32>) -> Self {
        Self {
            range: HeightRange::of(grid),
            ..Default::default()
        }
    }
}

/// Writes `grid` as a 16-bit grayscale PNG.
pub fn write_png(grid: &Grid<f32>, path: &Path, options: &PngOptions) -> Result<(), HeightmapError> {
    options.range.validate()?;
    let (width, height) = grid.dimensions();
    if width == 0 || height == 0 || width > u32::MAX as usize || height > u32::MAX as usize {
        return Err(HeightmapError::InvalidDimensions { width, height });
    }

    let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([options.range.quantize(grid[(x as usize, y as usize)])])
    });

    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    let encoder = PngEncoder::new_with_quality(writer, options.compression, options.filter);

    let byte_slice: &[u8] = bytemuck::cast_slice(img.as_raw());
    encoder.write_image(byte_slice, width as u32, height as u32, image::ExtendedColorType::L16)?;
    Ok(())
}

/// Reads a grayscale PNG of any bit depth, mapping black..white onto `range`.
pub fn read_png(path: &Path, range: HeightRange) -> Result<Grid<f32>, HeightmapError> {
    range.validate()?;
    let img = image::open(path)?.into_luma16();
    let (width, height) = (img.width() as usize, img.height() as usize);
    let data = img.pixels().map(|p| range.dequantize(p.0[0])).collect();
    Grid::from_vec(width, height, data).map_err(|_| HeightmapError::InvalidDimensions { width, height })
}

//! Host-side 2D raster used for simulation inputs and outputs.

use std::ops::{Index, IndexMut};

use glam::Vec2;

use crate::erosion::ErosionError;

/// A row-major 2D array of values with a fixed `(width, height)` resolution.
///
/// Cells are addressed as `[(x, y)]`, stored at `y * width + x`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Copy> Grid<T> {
    /// Creates a grid with every cell set to `fill`.
    pub fn new(width: usize, height: usize, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    /// Wraps an existing row-major buffer.
    ///
    /// Fails with [`ErosionError::InvalidResolution`] when `data.len()` does
    /// not match `width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Result<Self, ErosionError> {
        if data.len() != width * height {
            return Err(ErosionError::InvalidResolution(format!(
                "buffer of {} cells cannot back a {}x{} grid",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Builds a grid by evaluating `f(x, y)` for every cell.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// True when the grid has no cells.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.data[y * self.width + x] = value;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    /// Applies `f` to every cell, producing a grid of the same resolution.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().copied().map(f).collect(),
        }
    }
}

impl Grid<f32> {
    /// Sum of all cells, accumulated in f64 to keep conservation checks tight.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Returns `(min, max)` over all cells, or `(0.0, 0.0)` for an empty grid.
    pub fn min_max(&self) -> (f32, f32) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        self.data
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}

impl Grid<Vec2> {
    /// Per-cell vector length.
    pub fn magnitude(&self) -> Grid<f32> {
        self.map(|v| v.length())
    }
}

impl<T> Index<(usize, usize)> for Grid<T> {
    type Output = T;

    fn index(&self, (x, y): (usize, usize)) -> &T {
        &self.data[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Grid<T> {
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        &mut self.data[y * self.width + x]
    }
}

//! Grid kernels for the hydraulic and thermal passes.
//!
//! Each kernel is a pure function of its input grids: it reads the current
//! slots and writes the next slots, one row at a time. The domain is closed:
//! neighbours outside the grid are absent for flux and talus transfers, and
//! clamp to the edge cell for gradients.

mod effect;
mod flow;
mod sediment;
mod thermal;

use crate::backend::GridKernel;

pub use effect::InvertEffectKernel;
pub use flow::{OutflowKernel, WaterUpdateKernel};
pub use sediment::{AdvectSedimentKernel, ErodeDepositKernel};
pub use thermal::{ThermalApplyKernel, ThermalOutflowKernel};

/// Water depth below which a cell counts as dry.
pub const WET_EPSILON: f32 = 1e-4;

/// Lower bound on the tilt term of the carrying capacity, so flowing water
/// on flat ground still carries some sediment.
pub const MIN_TILT: f32 = 0.01;

/// Neighbour offsets in channel order: E, W, N, S, NE, NW, SE, SW.
///
/// `Flux` uses the first four, `TalusFlux` all eight.
pub const OFFSETS: [(isize, isize); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, 1),
    (1, -1),
    (-1, -1),
];

/// Channel of the neighbour that points back at the cell.
pub const OPPOSITE: [usize; 8] = [1, 0, 3, 2, 7, 6, 5, 4];

/// All kernels the CPU backend registers by default.
pub fn standard_kernels() -> Vec<Box<dyn GridKernel>> {
    vec![
        Box::new(OutflowKernel),
        Box::new(WaterUpdateKernel),
        Box::new(ErodeDepositKernel),
        Box::new(AdvectSedimentKernel),
        Box::new(ThermalOutflowKernel),
        Box::new(ThermalApplyKernel),
        Box::new(InvertEffectKernel),
    ]
}

/// In-domain neighbour of `(x, y)` in direction `dir`, or `None` across the edge.
#[inline]
pub(crate) fn neighbor(x: usize, y: usize, dir: usize, width: usize, height: usize) -> Option<(usize, usize)> {
    let (dx, dy) = OFFSETS[dir];
    let nx = x.checked_add_signed(dx)?;
    let ny = y.checked_add_signed(dy)?;
    (nx < width && ny < height).then_some((nx, ny))
}

/// World distance to the neighbour in direction `dir`.
#[inline]
pub(crate) fn neighbor_distance(dir: usize, texel: [f32; 2]) -> f32 {
    match dir {
        0 | 1 => texel[0],
        2 | 3 => texel[1],
        _ => (texel[0] * texel[0] + texel[1] * texel[1]).sqrt(),
    }
}

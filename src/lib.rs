//! Grid-based hydraulic and thermal terrain erosion.
//!
//! A heightmap is eroded by a virtual-pipe water model with sediment
//! transport and by talus relaxation. Kernels run through a pluggable
//! compute backend over double-buffered field grids.

pub mod backend;
pub mod erosion;
pub mod grid;
pub mod heightmap;
pub mod logger;

pub use backend::{ComputeBackend, CpuBackend};
pub use erosion::{
    ErosionConfig, ErosionError, ErosionInput, ErosionOutputs, HydraulicEroder, MaskSource, Simulation,
    TerrainEroder, ThermalEroder,
};
pub use grid::{FieldId, Grid};

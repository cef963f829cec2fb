//! Hydraulic and thermal erosion.
//!
//! The [`Simulation`] driver runs grid kernels from [`kernels`] on any
//! [`ComputeBackend`](crate::backend::ComputeBackend). The eroders wrap a
//! whole run behind a single call.

mod config;
mod eroder;
mod error;
pub mod kernels;
mod mask;
mod simulation;

pub use config::{talus_slope, ConfigError, ErosionConfig, HydraulicParams, ThermalParams, MAX_ANGLE_OF_REPOSE_DEG};
pub use eroder::{ErosionOutputs, HydraulicEroder, TerrainEroder, ThermalEroder};
pub use error::ErosionError;
pub use mask::{MaskSource, Reduction};
pub use simulation::{ErosionInput, Schedule, Simulation, SimulationProgress, SimulationState};

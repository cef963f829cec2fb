//! One-call erosion entry points on top of [`Simulation`].

use glam::Vec2;

use crate::backend::ComputeBackend;
use crate::grid::Grid;

use super::config::ErosionConfig;
use super::simulation::{ErosionInput, Schedule, Simulation, SimulationProgress};
use super::ErosionError;

/// Result grids of a completed run, all at the input resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ErosionOutputs {
    /// Eroded terrain, in the units of the input height.
    pub height: Grid<f32>,
    /// Standing water depth.
    pub water: Grid<f32>,
    /// Suspended sediment left in the water.
    pub sediment: Grid<f32>,
    /// Accumulated height change per cell.
    pub eroded_amount: Grid<f32>,
    pub velocity: Grid<Vec2>,
}

/// An erosion algorithm that runs to completion on a borrowed backend.
pub trait TerrainEroder {
    fn name(&self) -> &str;

    fn schedule(&self) -> Schedule;

    fn config(&self) -> &ErosionConfig;

    /// Runs a full simulation and returns its outputs.
    ///
    /// Buffers are released before returning, on success and on failure.
    fn erode(&self, backend: &mut dyn ComputeBackend, input: &ErosionInput) -> Result<ErosionOutputs, ErosionError> {
        self.erode_with_progress(backend, input, &mut |_| {})
    }

    fn erode_with_progress(
        &self,
        backend: &mut dyn ComputeBackend,
        input: &ErosionInput,
        on_progress: &mut dyn FnMut(SimulationProgress),
    ) -> Result<ErosionOutputs, ErosionError> {
        log::info!("{} on '{}'", self.name(), backend.name());
        let mut sim = Simulation::new(backend);
        sim.initialize_with_schedule(input, self.config(), self.schedule())?;
        sim.run_with_progress(on_progress)?;
        let outputs = sim.outputs();
        sim.release()?;
        outputs
    }
}

/// Rain, flow, sediment transport, and the thermal sub-steps between them.
#[derive(Debug, Clone, Default)]
pub struct HydraulicEroder {
    pub config: ErosionConfig,
}

impl HydraulicEroder {
    pub fn new(config: ErosionConfig) -> Self {
        Self { config }
    }
}

impl TerrainEroder for HydraulicEroder {
    fn name(&self) -> &str {
        "Hydraulic Erosion"
    }

    fn schedule(&self) -> Schedule {
        Schedule::hydraulic(&self.config)
    }

    fn config(&self) -> &ErosionConfig {
        &self.config
    }
}

/// Slope relaxation only.
#[derive(Debug, Clone, Default)]
pub struct ThermalEroder {
    pub config: ErosionConfig,
}

impl ThermalEroder {
    pub fn new(config: ErosionConfig) -> Self {
        Self { config }
    }
}

impl TerrainEroder for ThermalEroder {
    fn name(&self) -> &str {
        "Thermal Erosion"
    }

    fn schedule(&self) -> Schedule {
        Schedule::thermal_only(&self.config)
    }

    fn config(&self) -> &ErosionConfig {
        &self.config
    }
}

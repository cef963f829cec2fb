//! Erosion simulation driver.
//!
//! [`Simulation`] owns the field store for one run and walks it through the
//! lifecycle `Uninitialized -> Allocated -> Running -> Completed`. Every
//! kernel dispatch reads the current slot of its input fields and writes the
//! next slot of its output fields; the written fields are swapped right after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::backend::{BackendError, ComputeBackend, GridHandle, KernelId, KernelUniforms};
use crate::grid::{FieldId, FieldStore, Grid};

use super::config::ErosionConfig;
use super::eroder::ErosionOutputs;
use super::mask::MaskSource;
use super::ErosionError;

/// Where a simulation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Uninitialized,
    Allocated,
    Running { iteration: u32, of: u32 },
    Completed,
    Failed,
}

/// Reported after every outer iteration.
#[derive(Debug, Clone, Copy)]
pub struct SimulationProgress {
    /// Outer iterations finished so far.
    pub iteration: u32,
    pub total: u32,
    pub elapsed: Duration,
}

impl SimulationProgress {
    /// Completion in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.iteration as f32 / self.total as f32
        }
    }
}

/// Which passes run, and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub outer_iterations: u32,
    /// Run the four hydraulic dispatches each outer iteration.
    pub hydraulic: bool,
    /// Thermal sub-steps after the hydraulic pass of each outer iteration.
    pub thermal_substeps: u32,
}

impl Schedule {
    /// `hydraulic.iterations` outer iterations, each followed by the thermal
    /// sub-steps when thermal relaxation is enabled.
    pub fn hydraulic(config: &ErosionConfig) -> Self {
        Self {
            outer_iterations: config.hydraulic.iterations,
            hydraulic: true,
            thermal_substeps: if config.thermal.enabled {
                config.thermal.iterations
            } else {
                0
            },
        }
    }

    /// A single pass of `thermal.iterations` sub-steps, no water.
    pub fn thermal_only(config: &ErosionConfig) -> Self {
        Self {
            outer_iterations: 1,
            hydraulic: false,
            thermal_substeps: config.thermal.iterations,
        }
    }

    /// Kernel dispatches one run of this schedule issues, not counting the
    /// single closing dispatch of an inverted run.
    pub fn dispatch_count(&self) -> u64 {
        let hydraulic = if self.hydraulic { 4 } else { 0 };
        self.outer_iterations as u64 * (hydraulic + 2 * self.thermal_substeps as u64)
    }
}

/// Grids handed to [`Simulation::initialize`].
#[derive(Debug, Clone, Default)]
pub struct ErosionInput {
    /// Terrain height, required.
    pub height: Option<Grid<f32>>,
    /// Per-cell resistance in `[0, 1]`; zero everywhere when absent.
    pub hardness: Option<Grid<f32>>,
}

impl ErosionInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_height(mut self, height: Grid<f32>) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_hardness(mut self, hardness: Grid<f32>) -> Self {
        self.hardness = Some(hardness);
        self
    }
}

/// One erosion run on an injected backend.
pub struct Simulation<B: ComputeBackend> {
    backend: B,
    state: SimulationState,
    store: Option<FieldStore>,
    config: ErosionConfig,
    schedule: Schedule,
    rng: ChaCha8Rng,
    cancel: Option<Arc<AtomicBool>>,
}

impl<B: ComputeBackend> Simulation<B> {
    pub fn new(backend: B) -> Self {
        let config = ErosionConfig::default();
        Self {
            backend,
            state: SimulationState::Uninitialized,
            store: None,
            schedule: Schedule::hydraulic(&config),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            cancel: None,
        }
    }

    /// Checks `flag` before every outer iteration and stops with
    /// [`ErosionError::Cancelled`] once it is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The sanitized configuration of the current run.
    pub fn config(&self) -> &ErosionConfig {
        &self.config
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Logical `(width, height)` of the allocated field set.
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        self.store.as_ref().map(|s| s.dimensions())
    }

    /// Allocates and seeds the field set for a hydraulic run.
    pub fn initialize(&mut self, input: &ErosionInput, config: &ErosionConfig) -> Result<(), ErosionError> {
        self.initialize_with_schedule(input, config, Schedule::hydraulic(config))
    }

    /// Allocates and seeds the field set.
    ///
    /// Height and Hardness are uploaded into both slots; every other field
    /// starts at zero. Only valid while `Uninitialized`.
    pub fn initialize_with_schedule(
        &mut self,
        input: &ErosionInput,
        config: &ErosionConfig,
        schedule: Schedule,
    ) -> Result<(), ErosionError> {
        self.expect_state("initialize", SimulationState::Uninitialized)?;

        let height = match &input.height {
            Some(h) if !h.is_empty() => h,
            _ => return Err(ErosionError::MissingInput),
        };
        let (width, rows) = height.dimensions();
        if let Some(hardness) = &input.hardness {
            if hardness.dimensions() != (width, rows) {
                return Err(ErosionError::InvalidResolution(format!(
                    "hardness is {}x{}, height is {}x{}",
                    hardness.width(),
                    hardness.height(),
                    width,
                    rows
                )));
            }
        }

        self.config = config.sanitized();
        self.schedule = schedule;
        self.rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        let mut store = match FieldStore::allocate(&mut self.backend, width, rows) {
            Ok(store) => store,
            Err(e) => {
                self.state = SimulationState::Failed;
                return Err(e);
            }
        };

        if let Err(e) = seed_fields(&mut self.backend, &mut store, height, input.hardness.as_ref()) {
            store.release(&mut self.backend);
            self.state = SimulationState::Failed;
            return Err(e);
        }

        log::debug!(
            "initialized {}x{} simulation on '{}': {} outer iterations, hydraulic={}, {} thermal sub-steps",
            width,
            rows,
            self.backend.name(),
            schedule.outer_iterations,
            schedule.hydraulic,
            schedule.thermal_substeps
        );

        self.store = Some(store);
        self.state = SimulationState::Allocated;
        Ok(())
    }

    /// Runs the whole schedule.
    pub fn run(&mut self) -> Result<(), ErosionError> {
        self.run_with_progress(|_| {})
    }

    /// Runs the whole schedule, calling `on_progress` after each outer iteration.
    ///
    /// On a backend failure or cancellation the buffers are released and the
    /// simulation ends up `Failed`.
    pub fn run_with_progress<F>(&mut self, mut on_progress: F) -> Result<(), ErosionError>
    where
        F: FnMut(SimulationProgress),
    {
        self.expect_state("run", SimulationState::Allocated)?;

        let schedule = self.schedule;
        let total = schedule.outer_iterations;
        let base = match &self.store {
            Some(store) => {
                let (width, height) = store.dimensions();
                build_uniforms(&self.config, width, height)
            }
            None => return Err(self.invalid("run")),
        };

        let start = Instant::now();
        log::info!(
            "erosion run: {} outer iterations, {} dispatches on '{}'",
            total,
            schedule.dispatch_count(),
            self.backend.name()
        );

        for iteration in 0..total {
            if self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Relaxed)) {
                log::info!("erosion cancelled after {}/{} iterations", iteration, total);
                self.abort();
                return Err(ErosionError::Cancelled {
                    completed: iteration,
                    total,
                });
            }

            self.state = SimulationState::Running { iteration, of: total };
            let step_start = Instant::now();
            if let Err(e) = self.step(&schedule, &base) {
                log::warn!("erosion failed at iteration {}/{}: {}", iteration, total, e);
                self.abort();
                return Err(e.into());
            }
            log::debug!(
                "iteration {}/{} in {:.2}ms",
                iteration + 1,
                total,
                step_start.elapsed().as_secs_f64() * 1000.0
            );

            on_progress(SimulationProgress {
                iteration: iteration + 1,
                total,
                elapsed: start.elapsed(),
            });
        }

        if self.config.invert_effect {
            let inverted = match self.store.as_mut() {
                Some(store) => dispatch(&mut self.backend, store, KernelId::InvertEffect, &base),
                None => Ok(()),
            };
            if let Err(e) = inverted {
                log::warn!("inverting the erosion effect failed: {}", e);
                self.abort();
                return Err(e.into());
            }
        }

        self.state = SimulationState::Completed;
        log::info!("erosion finished in {:.2}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    /// One outer iteration: the hydraulic pass, then the thermal sub-steps.
    fn step(&mut self, schedule: &Schedule, base: &KernelUniforms) -> Result<(), BackendError> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };

        if schedule.hydraulic {
            for kernel in [
                KernelId::Outflow,
                KernelId::WaterUpdate,
                KernelId::ErodeDeposit,
                KernelId::AdvectSediment,
            ] {
                dispatch(&mut self.backend, store, kernel, base)?;
            }
        }

        for _ in 0..schedule.thermal_substeps {
            let uniforms = KernelUniforms {
                jitter_salt: self.rng.random(),
                ..*base
            };
            dispatch(&mut self.backend, store, KernelId::ThermalOutflow, &uniforms)?;
            dispatch(&mut self.backend, store, KernelId::ThermalApply, &uniforms)?;
        }
        Ok(())
    }

    /// The eroded height field, in the units of the input.
    pub fn result(&self) -> Result<Grid<f32>, ErosionError> {
        self.scalar_field("result", FieldId::Height)
    }

    /// Current contents of any field, row-major with `channels()` floats per
    /// cell. Only valid once the run has completed.
    pub fn field(&self, field: FieldId) -> Result<Vec<f32>, ErosionError> {
        let store = self.completed_store("field")?;
        store.download(&self.backend, field)
    }

    /// Per-cell water velocity.
    pub fn velocity(&self) -> Result<Grid<Vec2>, ErosionError> {
        let (width, height) = self.completed_store("velocity")?.dimensions();
        let data = self.field(FieldId::WaterVelocity)?;
        let cells = data.chunks_exact(2).map(|c| Vec2::new(c[0], c[1])).collect();
        Grid::from_vec(width, height, cells)
    }

    /// A scalar mask derived from one of the auxiliary fields.
    pub fn mask(&self, source: MaskSource) -> Result<Grid<f32>, ErosionError> {
        let (width, height) = self.completed_store("mask")?.dimensions();
        let field = source.field();
        let data = self.field(field)?;
        Grid::from_vec(width, height, source.reduction().apply(&data, field.channels()))
    }

    /// Height plus every auxiliary field a caller usually wants.
    pub fn outputs(&self) -> Result<ErosionOutputs, ErosionError> {
        Ok(ErosionOutputs {
            height: self.result()?,
            water: self.scalar_field("outputs", FieldId::Water)?,
            sediment: self.scalar_field("outputs", FieldId::Sediment)?,
            eroded_amount: self.scalar_field("outputs", FieldId::ErodedAmount)?,
            velocity: self.velocity()?,
        })
    }

    /// Frees all buffers and returns to `Uninitialized`.
    pub fn release(&mut self) -> Result<(), ErosionError> {
        if self.state == SimulationState::Uninitialized {
            return Err(self.invalid("release"));
        }
        if let Some(mut store) = self.store.take() {
            store.release(&mut self.backend);
        }
        self.state = SimulationState::Uninitialized;
        Ok(())
    }

    fn scalar_field(&self, operation: &'static str, field: FieldId) -> Result<Grid<f32>, ErosionError> {
        let (width, height) = self.completed_store(operation)?.dimensions();
        Grid::from_vec(width, height, self.field(field)?)
    }

    fn completed_store(&self, operation: &'static str) -> Result<&FieldStore, ErosionError> {
        match (&self.store, self.state) {
            (Some(store), SimulationState::Completed) => Ok(store),
            _ => Err(self.invalid(operation)),
        }
    }

    fn expect_state(&self, operation: &'static str, expected: SimulationState) -> Result<(), ErosionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> ErosionError {
        ErosionError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn abort(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.release(&mut self.backend);
        }
        self.state = SimulationState::Failed;
    }
}

impl<B: ComputeBackend> Drop for Simulation<B> {
    fn drop(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.release(&mut self.backend);
        }
    }
}

fn seed_fields<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    store: &mut FieldStore,
    height: &Grid<f32>,
    hardness: Option<&Grid<f32>>,
) -> Result<(), ErosionError> {
    for field in FieldId::ALL {
        store.clear(backend, field)?;
    }
    store.seed(backend, FieldId::Height, height)?;
    if let Some(hardness) = hardness {
        store.seed(backend, FieldId::Hardness, hardness)?;
    }
    Ok(())
}

/// Uniforms shared by every dispatch of a run. `jitter_salt` is drawn per
/// thermal sub-step.
fn build_uniforms(config: &ErosionConfig, width: usize, height: usize) -> KernelUniforms {
    let h = &config.hydraulic;
    let texel = config.texel_size_for(width, height);
    KernelUniforms {
        width: width as u32,
        height: height as u32,
        include_diagonals: config.thermal.include_diagonals as u32,
        texel: texel.to_array(),
        dt: h.time_delta,
        height_scale: config.height_scale(),
        precipitation: h.precipitation_rate,
        evaporation: h.evaporation_rate,
        flow_rate: h.flow_rate,
        gravity: config.gravity,
        sediment_capacity: h.sediment_capacity,
        dissolve_rate: h.sediment_dissolve_rate,
        deposit_rate: h.sediment_deposit_rate,
        effect_scalar: config.effect_scalar,
        riverbed_dissolve: h.riverbed_dissolve_rate,
        riverbed_deposit: h.riverbed_deposit_rate,
        riverbank_dissolve: h.riverbank_dissolve_rate,
        riverbank_deposit: h.riverbank_deposit_rate,
        repose_deg: config.thermal.angle_of_repose_deg,
        repose_jitter_deg: config.thermal.repose_jitter_deg,
        thermal_rate: config.thermal.time_delta,
        ..Default::default()
    }
}

/// Binds the read slots of the kernel's inputs and the write slots of its
/// outputs, dispatches, then swaps the outputs.
fn dispatch<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    store: &mut FieldStore,
    kernel: KernelId,
    uniforms: &KernelUniforms,
) -> Result<(), BackendError> {
    let inputs: Vec<GridHandle> = kernel.inputs().iter().map(|&f| store.read(f)).collect();
    let outputs: Vec<GridHandle> = kernel.outputs().iter().map(|&f| store.write(f)).collect();
    backend.dispatch(kernel, &inputs, &outputs, uniforms, store.groups())?;
    for &field in kernel.outputs() {
        store.swap(field);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use glam::Vec3;

    /// Config with a unit texel and unit height scale on an `n x n` grid.
    fn unit_config(n: usize) -> ErosionConfig {
        ErosionConfig {
            terrain_dimensions: Vec3::new(n as f32, 1.0, n as f32),
            ..Default::default()
        }
    }

    fn slope(n: usize) -> Grid<f32> {
        Grid::from_fn(n, n, |x, y| (n - x) as f32 * 0.5 + y as f32 * 0.1)
    }

    fn corner_peak() -> Grid<f32> {
        let mut grid = Grid::new(4, 4, 10.0);
        grid[(0, 0)] = 20.0;
        grid
    }

    fn run(config: &ErosionConfig, schedule: Schedule, height: Grid<f32>) -> Simulation<CpuBackend> {
        let mut sim = Simulation::new(CpuBackend::new());
        sim.initialize_with_schedule(&ErosionInput::new().with_height(height), config, schedule)
            .unwrap();
        sim.run().unwrap();
        sim
    }

    #[test]
    fn test_flat_dry_terrain_is_unchanged() {
        let mut config = ErosionConfig::default();
        config.hydraulic.iterations = 5;
        config.hydraulic.precipitation_rate = 0.0;
        let input = Grid::new(4, 4, 10.0);
        let sim = run(&config, Schedule::hydraulic(&config), input.clone());
        assert_eq!(sim.state(), SimulationState::Completed);
        assert_eq!(sim.result().unwrap(), input);
    }

    #[test]
    fn test_zero_iterations_is_identity() {
        let mut config = ErosionConfig::default();
        config.hydraulic.iterations = 0;
        let input = slope(8);
        let sim = run(&config, Schedule::hydraulic(&config), input.clone());
        assert_eq!(sim.result().unwrap(), input);
    }

    #[test]
    fn test_corner_peak_relaxes_with_zero_repose() {
        let mut config = ErosionConfig::default();
        config.thermal.angle_of_repose_deg = 0.0;
        config.thermal.iterations = 1;
        let input = corner_peak();
        let sim = run(&config, Schedule::thermal_only(&config), input.clone());
        let out = sim.result().unwrap();

        assert!(out[(0, 0)] < 20.0);
        assert!((out.sum() - input.sum()).abs() < 1e-3);
    }

    #[test]
    fn test_vertical_repose_is_a_no_op() {
        let mut config = ErosionConfig::default();
        config.thermal.angle_of_repose_deg = 90.0;
        config.thermal.iterations = 3;
        config.thermal.include_diagonals = true;
        let input = corner_peak();
        let sim = run(&config, Schedule::thermal_only(&config), input.clone());
        assert_eq!(sim.result().unwrap(), input);
    }

    #[test]
    fn test_thermal_conserves_mass_with_jitter() {
        let mut config = unit_config(16);
        config.thermal.angle_of_repose_deg = 20.0;
        config.thermal.repose_jitter_deg = 10.0;
        config.thermal.iterations = 6;
        config.thermal.include_diagonals = true;
        let input = Grid::from_fn(16, 16, |x, y| ((x * 7 + y * 13) % 5) as f32);
        let sim = run(&config, Schedule::thermal_only(&config), input.clone());
        assert!((sim.result().unwrap().sum() - input.sum()).abs() < 1e-2);
    }

    #[test]
    fn test_water_never_negative() {
        let mut config = unit_config(12);
        config.hydraulic.iterations = 20;
        config.hydraulic.precipitation_rate = 0.5;
        config.hydraulic.evaporation_rate = 0.3;
        let sim = run(&config, Schedule::hydraulic(&config), slope(12));
        let water = sim.field(FieldId::Water).unwrap();
        assert!(water.iter().all(|&w| w >= 0.0));
        assert!(water.iter().any(|&w| w > 0.0));
    }

    #[test]
    fn test_inverted_effect_mirrors_single_iteration() {
        let mut config = unit_config(8);
        config.hydraulic.iterations = 1;
        config.hydraulic.precipitation_rate = 2.0;
        config.thermal.enabled = false;
        let input = slope(8);

        let normal = run(&config, Schedule::hydraulic(&config), input.clone()).result().unwrap();
        config.invert_effect = true;
        let inverted = run(&config, Schedule::hydraulic(&config), input.clone()).result().unwrap();

        let mut changed = false;
        for y in 0..8 {
            for x in 0..8 {
                let d0 = normal[(x, y)] - input[(x, y)];
                let d1 = inverted[(x, y)] - input[(x, y)];
                assert!((d0 + d1).abs() < 1e-5, "({x}, {y}): {d0} vs {d1}");
                changed |= d0 != 0.0;
            }
        }
        assert!(changed);
    }

    fn waves(n: usize) -> Grid<f32> {
        Grid::from_fn(n, n, |x, y| 0.5 + 0.25 * (x as f32 * 0.3).sin() * (y as f32 * 0.2).cos())
    }

    fn sum_f64(values: &[f32]) -> f64 {
        values.iter().map(|&v| v as f64).sum()
    }

    #[test]
    fn test_closed_domain_keeps_sediment_budget() {
        let mut config = ErosionConfig {
            terrain_dimensions: Vec3::new(64.0, 8.0, 64.0),
            ..Default::default()
        };
        config.hydraulic.iterations = 30;
        config.hydraulic.precipitation_rate = 0.5;
        config.thermal.enabled = false;
        let input = waves(64);
        let sim = run(&config, Schedule::hydraulic(&config), input.clone());

        let scale = config.height_scale() as f64;
        let out = sim.result().unwrap();
        let lost = (input.sum() - out.sum()) * scale;
        let suspended = sum_f64(&sim.field(FieldId::Sediment).unwrap());
        let applied = sum_f64(&sim.field(FieldId::ErodedAmount).unwrap()) * scale;

        assert!(lost > 0.0);
        assert!((lost - suspended).abs() <= 0.01 * lost + 0.05, "lost {lost}, suspended {suspended}");
        assert!((applied + suspended).abs() <= 0.01 * suspended + 0.05, "applied {applied}, suspended {suspended}");
    }

    #[test]
    fn test_default_config_stays_finite_and_bounded() {
        let config = ErosionConfig::default();
        let input = waves(64);
        let (min, max) = input.min_max();
        let sim = run(&config, Schedule::hydraulic(&config), input);

        let out = sim.result().unwrap();
        assert!(out.iter().all(|h| h.is_finite()));
        assert!(out.iter().all(|&h| h >= min - 0.05 && h <= max + 0.05), "{:?}", out.min_max());
        for field in [FieldId::Water, FieldId::Sediment] {
            let data = sim.field(field).unwrap();
            assert!(data.iter().all(|v| v.is_finite() && *v >= 0.0), "{}", field.name());
        }
    }

    #[test]
    fn test_inverted_default_run_mirrors_physical_run() {
        let mut config = ErosionConfig::default();
        let input = waves(64);
        let (min, max) = input.min_max();
        let normal = run(&config, Schedule::hydraulic(&config), input.clone()).result().unwrap();
        config.invert_effect = true;
        let sim = run(&config, Schedule::hydraulic(&config), input.clone());
        let inverted = sim.result().unwrap();

        let span = max - min;
        assert!(inverted
            .iter()
            .all(|&h| h.is_finite() && h >= min - span - 0.05 && h <= max + span + 0.05));
        for ((a, b), h) in normal.iter().zip(inverted.iter()).zip(input.iter()) {
            assert!(((a - h) + (b - h)).abs() < 1e-4, "{a} / {b} around {h}");
        }

        let eroded = sim.field(FieldId::ErodedAmount).unwrap();
        for ((e, b), h) in eroded.iter().zip(inverted.iter()).zip(input.iter()) {
            assert!((b - h - e).abs() < 1e-4);
        }
    }

    #[test]
    fn test_inverted_thermal_run_stays_bounded() {
        let mut config = ErosionConfig::default();
        config.thermal.angle_of_repose_deg = 0.0;
        config.thermal.iterations = 40;
        config.invert_effect = true;
        let input = corner_peak();
        let out = run(&config, Schedule::thermal_only(&config), input.clone()).result().unwrap();

        // Mirroring a relaxation that stays within [10, 20] about the input.
        assert!(out.iter().all(|&h| h.is_finite() && (0.0..=30.0).contains(&h)), "{:?}", out.min_max());
        assert!(out[(0, 0)] > 20.0);
        assert!((out.sum() - input.sum()).abs() < 1e-2);
    }

    #[test]
    fn test_repose_jitter_is_seeded() {
        let mut config = unit_config(16);
        config.thermal.angle_of_repose_deg = 30.0;
        config.thermal.repose_jitter_deg = 15.0;
        config.thermal.iterations = 3;
        let input = Grid::from_fn(16, 16, |x, y| ((x * 7 + y * 13) % 5) as f32 * 0.5);

        let a = run(&config, Schedule::thermal_only(&config), input.clone()).result().unwrap();
        let b = run(&config, Schedule::thermal_only(&config), input.clone()).result().unwrap();
        assert_eq!(a, b);
        config.seed += 1;
        let c = run(&config, Schedule::thermal_only(&config), input).result().unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_state_machine_rejects_out_of_order_calls() {
        let mut sim = Simulation::new(CpuBackend::new());
        assert!(matches!(sim.run(), Err(ErosionError::InvalidState { operation: "run", .. })));
        assert!(matches!(sim.result(), Err(ErosionError::InvalidState { .. })));
        assert!(matches!(sim.release(), Err(ErosionError::InvalidState { .. })));

        let config = ErosionConfig::default();
        let input = ErosionInput::new().with_height(Grid::new(4, 4, 1.0));
        sim.initialize(&input, &config).unwrap();
        assert_eq!(sim.state(), SimulationState::Allocated);
        assert!(matches!(sim.initialize(&input, &config), Err(ErosionError::InvalidState { .. })));
        assert!(matches!(sim.mask(MaskSource::Sediment), Err(ErosionError::InvalidState { .. })));

        sim.release().unwrap();
        assert_eq!(sim.state(), SimulationState::Uninitialized);
        assert_eq!(sim.backend().live_grids(), 0);
    }

    #[test]
    fn test_initialize_validates_input() {
        let mut sim = Simulation::new(CpuBackend::new());
        let config = ErosionConfig::default();
        assert!(matches!(
            sim.initialize(&ErosionInput::new(), &config),
            Err(ErosionError::MissingInput)
        ));
        let input = ErosionInput::new()
            .with_height(Grid::new(4, 4, 1.0))
            .with_hardness(Grid::new(4, 3, 0.5));
        assert!(matches!(
            sim.initialize(&input, &config),
            Err(ErosionError::InvalidResolution(_))
        ));
        assert_eq!(sim.state(), SimulationState::Uninitialized);
    }

    #[test]
    fn test_out_of_memory_fails_cleanly() {
        let backend = CpuBackend::new().with_memory_budget(1024);
        let mut sim = Simulation::new(backend);
        let input = ErosionInput::new().with_height(Grid::new(64, 64, 1.0));
        let err = sim.initialize(&input, &ErosionConfig::default()).unwrap_err();

        assert!(matches!(err, ErosionError::Backend(BackendError::OutOfMemory { .. })));
        assert_eq!(sim.state(), SimulationState::Failed);
        assert_eq!(sim.backend().live_grids(), 0);
        sim.release().unwrap();
        assert_eq!(sim.state(), SimulationState::Uninitialized);
    }

    #[test]
    fn test_missing_kernel_fails_and_releases() {
        let mut sim = Simulation::new(CpuBackend::without_kernels());
        let input = ErosionInput::new().with_height(Grid::new(4, 4, 1.0));
        sim.initialize(&input, &ErosionConfig::default()).unwrap();
        let err = sim.run().unwrap_err();

        assert!(matches!(err, ErosionError::Backend(BackendError::UnknownKernel(_))));
        assert_eq!(sim.state(), SimulationState::Failed);
        assert_eq!(sim.backend().live_grids(), 0);
    }

    #[test]
    fn test_cancel_flag_stops_run() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut sim = Simulation::new(CpuBackend::new()).with_cancel_flag(flag.clone());
        let mut config = ErosionConfig::default();
        config.hydraulic.iterations = 10;
        sim.initialize(&ErosionInput::new().with_height(slope(8)), &config)
            .unwrap();

        let err = sim
            .run_with_progress(|p| {
                if p.iteration == 3 {
                    flag.store(true, Ordering::Relaxed);
                }
            })
            .unwrap_err();
        assert!(matches!(err, ErosionError::Cancelled { completed: 3, total: 10 }));
        assert_eq!(sim.state(), SimulationState::Failed);
        assert_eq!(sim.backend().live_grids(), 0);
    }

    #[test]
    fn test_progress_and_outputs() {
        let mut config = unit_config(8);
        config.hydraulic.iterations = 4;
        let mut sim = Simulation::new(CpuBackend::new());
        sim.initialize(&ErosionInput::new().with_height(slope(8)), &config)
            .unwrap();

        let mut seen = Vec::new();
        sim.run_with_progress(|p| seen.push(p.iteration)).unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4]);

        let outputs = sim.outputs().unwrap();
        assert_eq!(outputs.height.dimensions(), (8, 8));
        assert_eq!(outputs.velocity.dimensions(), (8, 8));
        assert!(outputs.water.iter().all(|&w| w >= 0.0));

        let speed = sim.mask(MaskSource::WaterSpeed).unwrap();
        assert_eq!(speed, outputs.velocity.magnitude());
        let diff = sim.mask(MaskSource::HeightDiff).unwrap();
        assert_eq!(diff, outputs.eroded_amount);
    }

    #[test]
    fn test_release_returns_pooled_memory() {
        let config = ErosionConfig::default();
        let input = ErosionInput::new().with_height(Grid::new(8, 8, 1.0));
        let mut sim = Simulation::new(CpuBackend::new());
        sim.initialize(&input, &config).unwrap();
        sim.release().unwrap();
        assert_eq!(sim.backend().pooled_grids(), FieldId::ALL.len() * 2);

        sim.initialize(&input, &config).unwrap();
        assert_eq!(sim.backend().pooled_grids(), 0);
    }

    #[test]
    fn test_schedules() {
        let mut config = ErosionConfig::default();
        config.hydraulic.iterations = 3;
        config.thermal.iterations = 2;
        let hydraulic = Schedule::hydraulic(&config);
        assert_eq!(hydraulic.dispatch_count(), 3 * (4 + 4));

        config.thermal.enabled = false;
        assert_eq!(Schedule::hydraulic(&config).thermal_substeps, 0);
        let thermal = Schedule::thermal_only(&config);
        assert_eq!((thermal.outer_iterations, thermal.hydraulic, thermal.thermal_substeps), (1, false, 2));
    }
}

//! Kernel interface shared by all backends.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::grid::FieldId;

/// The fixed set of kernels the erosion driver dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Pipe-model outflow flux from height + water differences.
    Outflow,
    /// Water depth and velocity from flux divergence.
    WaterUpdate,
    /// Dissolve/deposit between terrain and suspended sediment.
    ErodeDeposit,
    /// Upwind sediment transport along the water flux.
    AdvectSediment,
    /// Talus outflow above the angle of repose.
    ThermalOutflow,
    /// Gather of talus outflow into the height field.
    ThermalApply,
    /// Negation of the accumulated height change, once after the last iteration.
    InvertEffect,
}

impl KernelId {
    pub const ALL: [KernelId; 7] = [
        KernelId::Outflow,
        KernelId::WaterUpdate,
        KernelId::ErodeDeposit,
        KernelId::AdvectSediment,
        KernelId::ThermalOutflow,
        KernelId::ThermalApply,
        KernelId::InvertEffect,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelId::Outflow => "Outflow",
            KernelId::WaterUpdate => "WaterUpdate",
            KernelId::ErodeDeposit => "ErodeDeposit",
            KernelId::AdvectSediment => "AdvectSediment",
            KernelId::ThermalOutflow => "ThermalOutflow",
            KernelId::ThermalApply => "ThermalApply",
            KernelId::InvertEffect => "InvertEffect",
        }
    }

    /// Fields read by the kernel, in binding order.
    pub fn inputs(self) -> &'static [FieldId] {
        use FieldId::*;
        match self {
            KernelId::Outflow => &[Height, Water, Flux],
            KernelId::WaterUpdate => &[Water, Flux],
            KernelId::ErodeDeposit => &[Height, Water, WaterVelocity, Sediment, Hardness, ErodedAmount],
            KernelId::AdvectSediment => &[Sediment, Water, Flux],
            KernelId::ThermalOutflow => &[Height, Hardness],
            KernelId::ThermalApply => &[Height, TalusFlux, ErodedAmount],
            KernelId::InvertEffect => &[Height, ErodedAmount],
        }
    }

    /// Fields written by the kernel, in binding order.
    pub fn outputs(self) -> &'static [FieldId] {
        use FieldId::*;
        match self {
            KernelId::Outflow => &[Flux],
            KernelId::WaterUpdate => &[Water, WaterVelocity],
            KernelId::ErodeDeposit => &[Height, Sediment, ErodedAmount],
            KernelId::AdvectSediment => &[Sediment],
            KernelId::ThermalOutflow => &[TalusFlux],
            KernelId::ThermalApply => &[Height, ErodedAmount],
            KernelId::InvertEffect => &[Height, ErodedAmount],
        }
    }
}

/// Uniform block passed to every dispatch.
///
/// Laid out like a GPU uniform buffer: 4-byte scalars only, no implicit
/// padding, 16-byte multiple in total.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct KernelUniforms {
    /// Logical domain width in cells.
    pub width: u32,
    /// Logical domain height in cells.
    pub height: u32,
    /// Non-zero when thermal relaxation considers diagonal neighbours.
    pub include_diagonals: u32,
    pub _pad0: u32,

    /// World units per cell (x, y), including the simulation scale.
    pub texel: [f32; 2],
    /// Hydraulic time step.
    pub dt: f32,
    /// World height of a unit input height.
    pub height_scale: f32,

    pub precipitation: f32,
    pub evaporation: f32,
    pub flow_rate: f32,
    pub gravity: f32,

    pub sediment_capacity: f32,
    pub dissolve_rate: f32,
    pub deposit_rate: f32,
    pub effect_scalar: f32,

    pub riverbed_dissolve: f32,
    pub riverbed_deposit: f32,
    pub riverbank_dissolve: f32,
    pub riverbank_deposit: f32,

    /// Angle of repose in degrees, before jitter.
    pub repose_deg: f32,
    /// Largest per-cell deviation from `repose_deg`, in degrees.
    pub repose_jitter_deg: f32,
    /// Per sub-step salt of the per-cell repose jitter.
    pub jitter_salt: u32,
    /// Fraction of the excess moved per thermal sub-step, in [0, 1].
    pub thermal_rate: f32,
}

impl KernelUniforms {
    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.width as usize, self.height as usize)
    }

    #[inline]
    pub fn diagonals(&self) -> bool {
        self.include_diagonals != 0
    }
}

/// Read-only view of a bound grid.
#[derive(Debug, Clone, Copy)]
pub struct GridView<'a> {
    data: &'a [f32],
    stride: usize,
    channels: usize,
}

impl<'a> GridView<'a> {
    /// `stride` is the allocated row width in cells.
    pub fn new(data: &'a [f32], stride: usize, channels: usize) -> Self {
        debug_assert_eq!(data.len() % (stride * channels).max(1), 0);
        Self { data, stride, channels }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// First channel of cell `(x, y)`.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[(y * self.stride + x) * self.channels]
    }

    #[inline]
    pub fn channel(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.stride + x) * self.channels + c]
    }

    #[inline]
    pub fn vec2(&self, x: usize, y: usize) -> Vec2 {
        let i = (y * self.stride + x) * self.channels;
        Vec2::new(self.data[i], self.data[i + 1])
    }

    /// All channels of cell `(x, y)`.
    #[inline]
    pub fn cell(&self, x: usize, y: usize) -> &'a [f32] {
        let i = (y * self.stride + x) * self.channels;
        &self.data[i..i + self.channels]
    }
}

/// One writable row of an output grid.
#[derive(Debug)]
pub struct RowMut<'a> {
    data: &'a mut [f32],
    channels: usize,
}

impl<'a> RowMut<'a> {
    pub fn new(data: &'a mut [f32], channels: usize) -> Self {
        Self { data, channels }
    }

    #[inline]
    pub fn set(&mut self, x: usize, value: f32) {
        self.data[x * self.channels] = value;
    }

    #[inline]
    pub fn set_vec2(&mut self, x: usize, value: Vec2) {
        let i = x * self.channels;
        self.data[i] = value.x;
        self.data[i + 1] = value.y;
    }

    #[inline]
    pub fn set_cell(&mut self, x: usize, values: &[f32]) {
        let i = x * self.channels;
        self.data[i..i + values.len()].copy_from_slice(values);
    }
}

/// A pure grid-to-grid transform.
///
/// `apply_row` computes row `y` of every output from the inputs. It must not
/// depend on the order rows are processed in; backends are free to run rows
/// concurrently. Cells at `x >= columns` or outside the uniforms' logical
/// extent are left untouched.
pub trait GridKernel: Send + Sync {
    fn id(&self) -> KernelId;

    fn apply_row(
        &self,
        y: usize,
        columns: usize,
        inputs: &[GridView<'_>],
        outputs: &mut [RowMut<'_>],
        uniforms: &KernelUniforms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniforms_are_gpu_sized() {
        assert_eq!(std::mem::size_of::<KernelUniforms>() % 16, 0);
        let u = KernelUniforms::default();
        assert_eq!(bytemuck::bytes_of(&u).len(), std::mem::size_of::<KernelUniforms>());
    }

    #[test]
    fn test_kernel_outputs_are_distinct() {
        for id in KernelId::ALL {
            assert!(!id.outputs().is_empty(), "{} has no outputs", id.name());
            for (i, a) in id.outputs().iter().enumerate() {
                for b in &id.outputs()[i + 1..] {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn test_grid_view_channels() {
        let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
        // 2x2 grid, 4 channels
        let view = GridView::new(&data, 2, 4);
        assert_eq!(view.at(1, 0), 4.0);
        assert_eq!(view.channel(0, 1, 2), 10.0);
        assert_eq!(view.cell(1, 1), &[12.0, 13.0, 14.0, 15.0]);
        assert_eq!(view.vec2(1, 1), Vec2::new(12.0, 13.0));
    }
}

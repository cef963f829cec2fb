//! Compute backend abstraction.
//!
//! The simulation never touches grid memory directly: it allocates grids,
//! uploads/downloads them and dispatches kernels through [`ComputeBackend`].
//! [`CpuBackend`] runs kernels as rayon parallel-for loops over rows; a GPU
//! implementation would map the same calls onto textures and compute passes.

mod cpu;
mod kernel;

use thiserror::Error;

pub use cpu::CpuBackend;
pub use kernel::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};

/// Edge length of a dispatch work group. Field allocations are rounded up to
/// a multiple of this in both axes.
pub const WORK_GROUP_SIZE: usize = 8;

/// Opaque reference to a grid owned by a backend.
///
/// The generation counter makes handles to released grids detectable even
/// after their slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("Invalid or released grid handle {0:?}")]
    InvalidHandle(GridHandle),
    #[error("Grid {0:?} is bound more than once in a single dispatch")]
    AliasedBinding(GridHandle),
    #[error("Size mismatch: expected {expected} values, got {found}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("Kernel '{kernel}' binding mismatch: {reason}")]
    BindingMismatch { kernel: &'static str, reason: String },
    #[error("Kernel '{0}' is not available on this backend")]
    UnknownKernel(&'static str),
}

/// Grid storage and kernel execution used by the erosion driver.
///
/// Implementations must guarantee that a dispatch reads only its input grids
/// and writes only its output grids; binding the same grid on both sides is
/// rejected with [`BackendError::AliasedBinding`].
pub trait ComputeBackend {
    /// Human-readable backend name used in logs.
    fn name(&self) -> &str;

    /// Allocates a zero-initialized grid with `channels` floats per cell.
    fn allocate_grid(&mut self, width: usize, height: usize, channels: usize) -> Result<GridHandle, BackendError>;

    /// Replaces the full contents of a grid. `data` is row-major,
    /// `width * height * channels` long.
    fn upload_grid(&mut self, handle: GridHandle, data: &[f32]) -> Result<(), BackendError>;

    /// Reads back the full contents of a grid.
    fn download_grid(&self, handle: GridHandle) -> Result<Vec<f32>, BackendError>;

    /// Zeroes a grid.
    fn clear_grid(&mut self, handle: GridHandle) -> Result<(), BackendError>;

    /// Runs `kernel` over `groups[0] x groups[1]` work groups.
    fn dispatch(
        &mut self,
        kernel: KernelId,
        inputs: &[GridHandle],
        outputs: &[GridHandle],
        uniforms: &KernelUniforms,
        groups: [u32; 2],
    ) -> Result<(), BackendError>;

    /// Frees a grid. The handle is invalid afterwards.
    fn release_grid(&mut self, handle: GridHandle) -> Result<(), BackendError>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for &mut B {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn allocate_grid(&mut self, width: usize, height: usize, channels: usize) -> Result<GridHandle, BackendError> {
        (**self).allocate_grid(width, height, channels)
    }

    fn upload_grid(&mut self, handle: GridHandle, data: &[f32]) -> Result<(), BackendError> {
        (**self).upload_grid(handle, data)
    }

    fn download_grid(&self, handle: GridHandle) -> Result<Vec<f32>, BackendError> {
        (**self).download_grid(handle)
    }

    fn clear_grid(&mut self, handle: GridHandle) -> Result<(), BackendError> {
        (**self).clear_grid(handle)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        inputs: &[GridHandle],
        outputs: &[GridHandle],
        uniforms: &KernelUniforms,
        groups: [u32; 2],
    ) -> Result<(), BackendError> {
        (**self).dispatch(kernel, inputs, outputs, uniforms, groups)
    }

    fn release_grid(&mut self, handle: GridHandle) -> Result<(), BackendError> {
        (**self).release_grid(handle)
    }
}

/// Rounds `value` up to the next multiple of [`WORK_GROUP_SIZE`].
pub fn align_to_work_group(value: usize) -> usize {
    value.div_ceil(WORK_GROUP_SIZE) * WORK_GROUP_SIZE
}

/// Number of work groups needed to cover `value` cells.
pub fn work_groups(value: usize) -> u32 {
    value.div_ceil(WORK_GROUP_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_group_alignment() {
        assert_eq!(align_to_work_group(1), 8);
        assert_eq!(align_to_work_group(8), 8);
        assert_eq!(align_to_work_group(9), 16);
        assert_eq!(align_to_work_group(513), 520);
        assert_eq!(work_groups(4), 1);
        assert_eq!(work_groups(17), 3);
    }
}

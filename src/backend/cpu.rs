//! CPU compute backend: grids in host memory, kernels as rayon row loops.

use rayon::prelude::*;

use super::kernel::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};
use super::{BackendError, ComputeBackend, GridHandle, WORK_GROUP_SIZE};
use crate::erosion::kernels::standard_kernels;

struct CpuGrid {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl CpuGrid {
    fn len(&self) -> usize {
        self.width * self.height * self.channels
    }

    fn bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    grid: Option<CpuGrid>,
    /// Set while the grid is moved out for a dispatch.
    in_flight: bool,
}

/// Host-memory backend.
///
/// Released buffers are kept in a pool and handed out again to allocations
/// of the same size, so back-to-back runs at one resolution do not touch the
/// allocator.
pub struct CpuBackend {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    pool: Vec<Vec<f32>>,
    kernels: Vec<Option<Box<dyn GridKernel>>>,
    memory_budget: Option<usize>,
    live_bytes: usize,
}

impl CpuBackend {
    /// Backend with the standard erosion kernels registered.
    pub fn new() -> Self {
        let mut backend = Self::without_kernels();
        for kernel in standard_kernels() {
            backend.register_kernel(kernel);
        }
        backend
    }

    /// Backend with no kernels; every dispatch fails until kernels are registered.
    pub fn without_kernels() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            pool: Vec::new(),
            kernels: (0..KernelId::ALL.len()).map(|_| None).collect(),
            memory_budget: None,
            live_bytes: 0,
        }
    }

    /// Caps the bytes of live grid memory. Allocations beyond the cap fail
    /// with [`BackendError::OutOfMemory`].
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Installs (or replaces) the implementation of a kernel.
    pub fn register_kernel(&mut self, kernel: Box<dyn GridKernel>) {
        let index = kernel.id().index();
        self.kernels[index] = Some(kernel);
    }

    /// Number of grids currently allocated.
    pub fn live_grids(&self) -> usize {
        self.slots.iter().filter(|s| s.grid.is_some() || s.in_flight).count()
    }

    /// Bytes held by live grids.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of released buffers waiting to be reused.
    pub fn pooled_grids(&self) -> usize {
        self.pool.len()
    }

    /// Drops every pooled buffer.
    pub fn trim_pool(&mut self) {
        self.pool.clear();
    }

    fn slot(slots: &[Slot], handle: GridHandle) -> Result<&CpuGrid, BackendError> {
        slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.grid.as_ref())
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn slot_mut(slots: &mut [Slot], handle: GridHandle) -> Result<&mut CpuGrid, BackendError> {
        slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.grid.as_mut())
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn take_buffer(&mut self, len: usize) -> Vec<f32> {
        match self.pool.iter().position(|b| b.len() == len) {
            Some(i) => {
                let mut buffer = self.pool.swap_remove(i);
                buffer.fill(0.0);
                buffer
            }
            None => vec![0.0; len],
        }
    }

    fn check_bindings(
        kernel: KernelId,
        inputs: &[GridHandle],
        outputs: &[GridHandle],
    ) -> Result<(), BackendError> {
        if inputs.len() != kernel.inputs().len() || outputs.len() != kernel.outputs().len() {
            return Err(BackendError::BindingMismatch {
                kernel: kernel.name(),
                reason: format!(
                    "expected {} inputs / {} outputs, got {} / {}",
                    kernel.inputs().len(),
                    kernel.outputs().len(),
                    inputs.len(),
                    outputs.len()
                ),
            });
        }
        for (i, out) in outputs.iter().enumerate() {
            if inputs.contains(out) || outputs[i + 1..].contains(out) {
                return Err(BackendError::AliasedBinding(*out));
            }
        }
        Ok(())
    }

    fn check_shape(
        kernel: KernelId,
        grid: &CpuGrid,
        expected_channels: usize,
        shape: (usize, usize),
    ) -> Result<(), BackendError> {
        if grid.channels != expected_channels {
            return Err(BackendError::BindingMismatch {
                kernel: kernel.name(),
                reason: format!("expected {} channels, got {}", expected_channels, grid.channels),
            });
        }
        if (grid.width, grid.height) != shape {
            return Err(BackendError::BindingMismatch {
                kernel: kernel.name(),
                reason: format!(
                    "grid is {}x{}, dispatch domain is {}x{}",
                    grid.width, grid.height, shape.0, shape.1
                ),
            });
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate_grid(&mut self, width: usize, height: usize, channels: usize) -> Result<GridHandle, BackendError> {
        let len = width * height * channels;
        let requested = len * std::mem::size_of::<f32>();
        if let Some(budget) = self.memory_budget {
            let available = budget.saturating_sub(self.live_bytes);
            if requested > available {
                return Err(BackendError::OutOfMemory { requested, available });
            }
        }

        let data = self.take_buffer(len);
        let grid = CpuGrid { width, height, channels, data };
        self.live_bytes += requested;

        let index = match self.free_slots.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.grid = Some(grid);
        Ok(GridHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn upload_grid(&mut self, handle: GridHandle, data: &[f32]) -> Result<(), BackendError> {
        let grid = Self::slot_mut(&mut self.slots, handle)?;
        if data.len() != grid.len() {
            return Err(BackendError::SizeMismatch {
                expected: grid.len(),
                found: data.len(),
            });
        }
        grid.data.copy_from_slice(data);
        Ok(())
    }

    fn download_grid(&self, handle: GridHandle) -> Result<Vec<f32>, BackendError> {
        Ok(Self::slot(&self.slots, handle)?.data.clone())
    }

    fn clear_grid(&mut self, handle: GridHandle) -> Result<(), BackendError> {
        Self::slot_mut(&mut self.slots, handle)?.data.fill(0.0);
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel_id: KernelId,
        inputs: &[GridHandle],
        outputs: &[GridHandle],
        uniforms: &KernelUniforms,
        groups: [u32; 2],
    ) -> Result<(), BackendError> {
        let kernel = self.kernels[kernel_id.index()]
            .as_deref()
            .ok_or(BackendError::UnknownKernel(kernel_id.name()))?;
        Self::check_bindings(kernel_id, inputs, outputs)?;

        // Move the outputs out of the arena so the inputs can be borrowed
        // immutably alongside them.
        let mut taken: Vec<(usize, CpuGrid)> = Vec::with_capacity(outputs.len());
        for &handle in outputs {
            let grid = self
                .slots
                .get_mut(handle.index as usize)
                .filter(|s| s.generation == handle.generation)
                .and_then(|s| {
                    let grid = s.grid.take();
                    s.in_flight = grid.is_some();
                    grid
                });
            match grid {
                Some(grid) => taken.push((handle.index as usize, grid)),
                None => {
                    restore(&mut self.slots, taken);
                    return Err(BackendError::InvalidHandle(handle));
                }
            }
        }

        let result = (|| -> Result<(), BackendError> {
            let shape = (taken[0].1.width, taken[0].1.height);
            for ((_, grid), field) in taken.iter().zip(kernel_id.outputs()) {
                Self::check_shape(kernel_id, grid, field.channels(), shape)?;
            }

            let mut views = Vec::with_capacity(inputs.len());
            for (&handle, field) in inputs.iter().zip(kernel_id.inputs()) {
                let grid = Self::slot(&self.slots, handle)?;
                Self::check_shape(kernel_id, grid, field.channels(), shape)?;
                views.push(GridView::new(&grid.data, grid.width, grid.channels));
            }

            let rows = (groups[1] as usize * WORK_GROUP_SIZE).min(shape.1);
            let columns = (groups[0] as usize * WORK_GROUP_SIZE).min(shape.0);

            let mut row_sets: Vec<Vec<RowMut<'_>>> =
                (0..rows).map(|_| Vec::with_capacity(taken.len())).collect();
            for (_, grid) in taken.iter_mut() {
                let row_len = grid.width * grid.channels;
                let channels = grid.channels;
                for (y, chunk) in grid.data.chunks_mut(row_len).take(rows).enumerate() {
                    row_sets[y].push(RowMut::new(chunk, channels));
                }
            }

            row_sets.into_par_iter().enumerate().for_each(|(y, mut row)| {
                kernel.apply_row(y, columns, &views, &mut row, uniforms);
            });
            Ok(())
        })();

        restore(&mut self.slots, taken);
        result
    }

    fn release_grid(&mut self, handle: GridHandle) -> Result<(), BackendError> {
        Self::slot(&self.slots, handle)?;
        let slot = &mut self.slots[handle.index as usize];
        if let Some(grid) = slot.grid.take() {
            self.live_bytes -= grid.bytes();
            self.pool.push(grid.data);
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(handle.index as usize);
        Ok(())
    }
}

fn restore(slots: &mut [Slot], taken: Vec<(usize, CpuGrid)>) {
    for (index, grid) in taken {
        slots[index].grid = Some(grid);
        slots[index].in_flight = false;
    }
}

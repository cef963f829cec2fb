//! The double-buffered field set a simulation runs on.

use crate::backend::{align_to_work_group, work_groups, BackendError, ComputeBackend, GridHandle};
use crate::erosion::ErosionError;

use super::Grid;

/// Logical fields of an erosion simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    Height,
    Water,
    WaterVelocity,
    Flux,
    Sediment,
    Hardness,
    ErodedAmount,
    TalusFlux,
}

impl FieldId {
    pub const ALL: [FieldId; 8] = [
        FieldId::Height,
        FieldId::Water,
        FieldId::WaterVelocity,
        FieldId::Flux,
        FieldId::Sediment,
        FieldId::Hardness,
        FieldId::ErodedAmount,
        FieldId::TalusFlux,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Floats stored per cell.
    pub fn channels(self) -> usize {
        match self {
            FieldId::WaterVelocity => 2,
            FieldId::Flux => 4,
            FieldId::TalusFlux => 8,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldId::Height => "Height",
            FieldId::Water => "Water",
            FieldId::WaterVelocity => "WaterVelocity",
            FieldId::Flux => "Flux",
            FieldId::Sediment => "Sediment",
            FieldId::Hardness => "Hardness",
            FieldId::ErodedAmount => "ErodedAmount",
            FieldId::TalusFlux => "TalusFlux",
        }
    }

    /// Resolves a logical name, ignoring case.
    pub fn from_name(name: &str) -> Option<FieldId> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

/// Two backend grids holding one field, plus the parity of the current one.
///
/// Slot `parity` is read by the next dispatch, slot `parity ^ 1` is written;
/// [`PingPong::swap`] flips the roles once the write is complete.
#[derive(Debug, Clone, Copy)]
pub struct PingPong {
    slots: [GridHandle; 2],
    parity: usize,
}

impl PingPong {
    pub fn read(&self) -> GridHandle {
        self.slots[self.parity]
    }

    pub fn write(&self) -> GridHandle {
        self.slots[self.parity ^ 1]
    }

    pub fn parity(&self) -> usize {
        self.parity
    }

    pub fn swap(&mut self) {
        self.parity ^= 1;
    }
}

fn allocate_pair<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    width: usize,
    height: usize,
    channels: usize,
    allocated: &mut Vec<GridHandle>,
) -> Result<[GridHandle; 2], BackendError> {
    let a = backend.allocate_grid(width, height, channels)?;
    allocated.push(a);
    let b = backend.allocate_grid(width, height, channels)?;
    allocated.push(b);
    Ok([a, b])
}

/// Every field of a simulation, double-buffered at one resolution.
///
/// `width`/`height` is the logical extent; the backing grids are padded to
/// a multiple of the work-group size and the padding is never written.
#[derive(Debug)]
pub struct FieldStore {
    width: usize,
    height: usize,
    stride: usize,
    rows: usize,
    fields: Vec<PingPong>,
}

impl FieldStore {
    /// Allocates both slots of every field.
    ///
    /// On a backend failure everything allocated so far is released before
    /// the error is returned.
    pub fn allocate<B: ComputeBackend + ?Sized>(
        backend: &mut B,
        width: usize,
        height: usize,
    ) -> Result<Self, ErosionError> {
        if width == 0 || height == 0 {
            return Err(ErosionError::InvalidResolution(format!(
                "cannot allocate a {}x{} field set",
                width, height
            )));
        }

        let stride = align_to_work_group(width);
        let rows = align_to_work_group(height);
        let mut allocated: Vec<GridHandle> = Vec::with_capacity(FieldId::ALL.len() * 2);

        let mut fields = Vec::with_capacity(FieldId::ALL.len());
        for field in FieldId::ALL {
            let pair = allocate_pair(backend, stride, rows, field.channels(), &mut allocated);
            match pair {
                Ok(slots) => fields.push(PingPong { slots, parity: 0 }),
                Err(e) => {
                    log::warn!(
                        "field allocation failed at {} ({}x{} padded to {}x{}): {}",
                        field.name(),
                        width,
                        height,
                        stride,
                        rows,
                        e
                    );
                    for handle in allocated {
                        let _ = backend.release_grid(handle);
                    }
                    return Err(e.into());
                }
            }
        }

        log::debug!(
            "allocated {} fields at {}x{} (padded {}x{}) on '{}'",
            fields.len(),
            width,
            height,
            stride,
            rows,
            backend.name()
        );

        Ok(Self {
            width,
            height,
            stride,
            rows,
            fields,
        })
    }

    /// Logical `(width, height)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Allocated `(width, height)`, a multiple of the work-group size.
    pub fn padded_dimensions(&self) -> (usize, usize) {
        (self.stride, self.rows)
    }

    /// Work groups covering the logical extent.
    pub fn groups(&self) -> [u32; 2] {
        [work_groups(self.width), work_groups(self.height)]
    }

    pub fn get(&self, field: FieldId) -> &PingPong {
        &self.fields[field.index()]
    }

    pub fn read(&self, field: FieldId) -> GridHandle {
        self.fields[field.index()].read()
    }

    pub fn write(&self, field: FieldId) -> GridHandle {
        self.fields[field.index()].write()
    }

    pub fn swap(&mut self, field: FieldId) {
        self.fields[field.index()].swap();
    }

    /// Looks a field up by its logical name ("Height", "Water", ...).
    pub fn by_name(&self, name: &str) -> Option<&PingPong> {
        FieldId::from_name(name).map(|f| self.get(f))
    }

    /// Copies `source` into both slots of a scalar field.
    pub fn seed<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        field: FieldId,
        source: &Grid<f32>,
    ) -> Result<(), ErosionError> {
        if field.channels() != 1 {
            return Err(ErosionError::InvalidResolution(format!(
                "{} has {} channels and cannot be seeded from a scalar grid",
                field.name(),
                field.channels()
            )));
        }
        if source.dimensions() != (self.width, self.height) {
            return Err(ErosionError::InvalidResolution(format!(
                "{} seed is {}x{}, field set is {}x{}",
                field.name(),
                source.width(),
                source.height(),
                self.width,
                self.height
            )));
        }

        let mut padded = vec![0.0f32; self.stride * self.rows];
        for (y, row) in source.as_slice().chunks(self.width).enumerate() {
            padded[y * self.stride..y * self.stride + self.width].copy_from_slice(row);
        }

        let pair = self.fields[field.index()];
        for handle in pair.slots {
            backend.upload_grid(handle, &padded)?;
        }
        Ok(())
    }

    /// Zeroes both slots of a field.
    pub fn clear<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, field: FieldId) -> Result<(), ErosionError> {
        let pair = self.fields[field.index()];
        for handle in pair.slots {
            backend.clear_grid(handle)?;
        }
        Ok(())
    }

    /// Reads the current slot of a field, cropped to the logical extent.
    ///
    /// The result is row-major with `channels()` floats per cell.
    pub fn download<B: ComputeBackend + ?Sized>(&self, backend: &B, field: FieldId) -> Result<Vec<f32>, ErosionError> {
        let channels = field.channels();
        let raw = backend.download_grid(self.read(field))?;
        let row_len = self.width * channels;
        let mut out = Vec::with_capacity(row_len * self.height);
        for y in 0..self.height {
            let start = y * self.stride * channels;
            out.extend_from_slice(&raw[start..start + row_len]);
        }
        Ok(out)
    }

    /// Frees every grid. Calling it again is a no-op.
    pub fn release<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) {
        for pair in self.fields.drain(..) {
            for handle in pair.slots {
                if let Err(e) = backend.release_grid(handle) {
                    log::warn!("failed to release grid {:?}: {}", handle, e);
                }
            }
        }
    }

    /// True once [`FieldStore::release`] has run.
    pub fn is_released(&self) -> bool {
        self.fields.is_empty()
    }
}

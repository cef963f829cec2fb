//! Inverted effect: mirrors the accumulated height change about the input.

use crate::backend::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};

/// `h' = h - 2·Δ`, `Δ' = -Δ`, where `Δ` is the accumulated change in input
/// units. Runs once after the last iteration, so every step before it
/// evolves the physical terrain.
///
/// Inputs: Height, ErodedAmount. Outputs: Height, ErodedAmount.
pub struct InvertEffectKernel;

impl GridKernel for InvertEffectKernel {
    fn id(&self) -> KernelId {
        KernelId::InvertEffect
    }

    fn apply_row(
        &self,
        y: usize,
        columns: usize,
        inputs: &[GridView<'_>],
        outputs: &mut [RowMut<'_>],
        u: &KernelUniforms,
    ) {
        let (width, height) = u.dims();
        if y >= height {
            return;
        }
        let (terrain, eroded) = (&inputs[0], &inputs[1]);

        for x in 0..columns.min(width) {
            let delta = eroded.at(x, y);
            outputs[0].set(x, terrain.at(x, y) - 2.0 * delta);
            outputs[1].set(x, -delta);
        }
    }
}

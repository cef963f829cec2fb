//! Sediment phase: dissolve/deposit against the carrying capacity, then
//! transport the suspended sediment along the flow.
//!
//! Suspended sediment is in world height units; terrain lost times
//! `height_scale` always equals sediment gained.

use super::{neighbor, MIN_TILT, OPPOSITE, WET_EPSILON};
use crate::backend::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};

/// Exchange between terrain and suspended sediment.
///
/// Inputs: Height, Water, WaterVelocity, Sediment, Hardness, ErodedAmount.
/// Outputs: Height, Sediment, ErodedAmount.
pub struct ErodeDepositKernel;

/// Sine of the terrain tilt at `(x, y)` from central differences, with edge
/// lookups clamped to the domain.
fn sin_tilt(terrain: &GridView<'_>, x: usize, y: usize, width: usize, height: usize, u: &KernelUniforms) -> f32 {
    let (x0, x1) = (x.saturating_sub(1), (x + 1).min(width - 1));
    let (y0, y1) = (y.saturating_sub(1), (y + 1).min(height - 1));

    let gx = if x1 > x0 {
        (terrain.at(x1, y) - terrain.at(x0, y)) * u.height_scale / ((x1 - x0) as f32 * u.texel[0])
    } else {
        0.0
    };
    let gy = if y1 > y0 {
        (terrain.at(x, y1) - terrain.at(x, y0)) * u.height_scale / ((y1 - y0) as f32 * u.texel[1])
    } else {
        0.0
    };

    let g2 = gx * gx + gy * gy;
    (g2 / (1.0 + g2)).sqrt()
}

/// A wet cell at least as deep as its neighbours' mean sits in the channel
/// bed; shallower wet cells and dry cells are treated as bank.
fn is_riverbed(water: &GridView<'_>, x: usize, y: usize, width: usize, height: usize) -> bool {
    let depth = water.at(x, y);
    if depth <= WET_EPSILON {
        return false;
    }
    let mut sum = 0.0;
    let mut count = 0;
    for dir in 0..4 {
        if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
            sum += water.at(nx, ny);
            count += 1;
        }
    }
    count == 0 || depth >= sum / count as f32
}

impl GridKernel for ErodeDepositKernel {
    fn id(&self) -> KernelId {
        KernelId::ErodeDeposit
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
        let (terrain, water, velocity, sediment, hardness, eroded) =
            (&inputs[0], &inputs[1], &inputs[2], &inputs[3], &inputs[4], &inputs[5]);

        for x in 0..columns.min(width) {
            let depth = water.at(x, y);
            let suspended = sediment.at(x, y);

            // Water never carries more sediment than its own depth.
            let capacity = if depth > WET_EPSILON {
                let speed = velocity.vec2(x, y).length();
                (u.sediment_capacity * speed * sin_tilt(terrain, x, y, width, height, u).max(MIN_TILT)).min(depth)
            } else {
                0.0
            };

            let (dissolve_mul, deposit_mul) = if is_riverbed(water, x, y, width, height) {
                (u.riverbed_dissolve, u.riverbed_deposit)
            } else {
                (u.riverbank_dissolve, u.riverbank_deposit)
            };

            let (dissolved, deposited) = if capacity > suspended {
                let soft = (1.0 - hardness.at(x, y)).clamp(0.0, 1.0);
                let deficit = capacity - suspended;
                let amount = u.dt * u.dissolve_rate * dissolve_mul * deficit * soft * u.effect_scalar;
                (amount.min(deficit), 0.0)
            } else if suspended > capacity {
                let surplus = suspended - capacity;
                let amount = u.dt * u.deposit_rate * deposit_mul * surplus * u.effect_scalar;
                (0.0, amount.min(surplus))
            } else {
                (0.0, 0.0)
            };

            let dh = (deposited - dissolved) / u.height_scale;
            outputs[0].set(x, terrain.at(x, y) + dh);
            outputs[1].set(x, suspended + dissolved - deposited);
            outputs[2].set(x, eroded.at(x, y) + dh);
        }
    }
}

/// Upwind transport of suspended sediment along the water flux.
///
/// Each cell sends the share of its sediment that matches the share of its
/// water leaving in each direction. Shares are computed from the sender's
/// flux and depth only, so both ends of a transfer agree and the domain total
/// is preserved.
///
/// Inputs: Sediment, Water, Flux. Output: Sediment.
pub struct AdvectSedimentKernel;

/// Fraction of the cell's sediment leaving towards each axis neighbour.
///
/// The water present during the step is what remains plus what left.
fn leaving_fractions(water: &GridView<'_>, flux: &GridView<'_>, x: usize, y: usize, dt: f32) -> [f32; 4] {
    let f = flux.cell(x, y);
    let out: f32 = f.iter().sum::<f32>() * dt;
    let present = water.at(x, y) + out;
    let mut fractions = [0.0f32; 4];
    if out > 0.0 && present > 0.0 {
        for (fr, &fd) in fractions.iter_mut().zip(f) {
            *fr = fd * dt / present;
        }
    }
    fractions
}

impl GridKernel for AdvectSedimentKernel {
    fn id(&self) -> KernelId {
        KernelId::AdvectSediment
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
        let (sediment, water, flux) = (&inputs[0], &inputs[1], &inputs[2]);

        for x in 0..columns.min(width) {
            let own = sediment.at(x, y);
            let sent: f32 = leaving_fractions(water, flux, x, y, u.dt).iter().sum::<f32>() * own;

            let mut received = 0.0f32;
            for dir in 0..4 {
                if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
                    let back = leaving_fractions(water, flux, nx, ny, u.dt)[OPPOSITE[dir]];
                    received += back * sediment.at(nx, ny);
                }
            }

            outputs[0].set(x, (own - sent + received).max(0.0));
        }
    }
}

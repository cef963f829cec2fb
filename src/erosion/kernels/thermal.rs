//! Thermal relaxation: material above the angle of repose slides to lower
//! neighbours.
//!
//! Split in two kernels so each transfer is computed exactly once: the
//! outflow kernel writes what every cell sends in each direction, the apply
//! kernel gathers those amounts. The sum over the domain is preserved.

use super::{neighbor, neighbor_distance, OPPOSITE};
use crate::backend::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};
use crate::erosion::config::talus_slope;

#[inline]
fn directions(u: &KernelUniforms) -> usize {
    if u.diagonals() {
        8
    } else {
        4
    }
}

/// Uniform value in `[-1, 1)` for cell `(x, y)`, decorrelated by `salt`.
#[inline]
fn cell_noise(salt: u32, x: usize, y: usize) -> f32 {
    let mut h = salt ^ (x as u32).wrapping_mul(0x27d4_eb2d) ^ (y as u32).wrapping_mul(0x1656_67b1);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2c1b_3c6d);
    h ^= h >> 12;
    h = h.wrapping_mul(0x297a_2d39);
    h ^= h >> 15;
    (h >> 8) as f32 / (1u32 << 23) as f32 - 1.0
}

/// Talus tangent at `(x, y)` with the per-cell repose jitter applied.
#[inline]
fn cell_talus(u: &KernelUniforms, x: usize, y: usize) -> f32 {
    talus_slope(u.repose_deg + u.repose_jitter_deg * cell_noise(u.jitter_salt, x, y))
}

/// Inputs: Height, Hardness. Output: TalusFlux (world height units).
pub struct ThermalOutflowKernel;

impl GridKernel for ThermalOutflowKernel {
    fn id(&self) -> KernelId {
        KernelId::ThermalOutflow
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
        let (terrain, hardness) = (&inputs[0], &inputs[1]);
        let dirs = directions(u);
        let base_talus = talus_slope(u.repose_deg);

        for x in 0..columns.min(width) {
            let center = terrain.at(x, y) * u.height_scale;
            let talus = if u.repose_jitter_deg > 0.0 {
                cell_talus(u, x, y)
            } else {
                base_talus
            };

            let mut excess = [0.0f32; 8];
            let mut total = 0.0f32;
            let mut steepest = 0.0f32;
            for (dir, e) in excess.iter_mut().enumerate().take(dirs) {
                if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
                    let drop = center - terrain.at(nx, ny) * u.height_scale;
                    let over = drop - talus * neighbor_distance(dir, u.texel);
                    if over > 0.0 {
                        *e = over;
                        total += over;
                        steepest = steepest.max(over);
                    }
                }
            }

            let mut out = [0.0f32; 8];
            if total > 0.0 {
                // Moving half the steepest excess at most keeps the pair from
                // overshooting past each other.
                let soft = (1.0 - hardness.at(x, y)).clamp(0.0, 1.0);
                let moved = u.thermal_rate * 0.5 * steepest * soft;
                for (o, e) in out.iter_mut().zip(excess) {
                    *o = moved * e / total;
                }
            }
            outputs[0].set_cell(x, &out);
        }
    }
}

/// Inputs: Height, TalusFlux, ErodedAmount. Outputs: Height, ErodedAmount.
pub struct ThermalApplyKernel;

impl GridKernel for ThermalApplyKernel {
    fn id(&self) -> KernelId {
        KernelId::ThermalApply
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
        let (terrain, talus, eroded) = (&inputs[0], &inputs[1], &inputs[2]);
        let dirs = directions(u);

        for x in 0..columns.min(width) {
            let sent: f32 = talus.cell(x, y)[..dirs].iter().sum();
            let mut received = 0.0f32;
            for dir in 0..dirs {
                if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
                    received += talus.channel(nx, ny, OPPOSITE[dir]);
                }
            }

            let dh = (received - sent) / u.height_scale;
            outputs[0].set(x, terrain.at(x, y) + dh);
            outputs[1].set(x, eroded.at(x, y) + dh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::kernels::test_util::{run_kernel, uniforms};

    fn relax(terrain: &[f32], w: usize, h: usize, u: &KernelUniforms) -> Vec<f32> {
        let hardness = vec![0.0; w * h];
        let eroded = vec![0.0; w * h];
        let talus = run_kernel(&ThermalOutflowKernel, w, h, &[(terrain, 1), (&hardness[..], 1)], &[8], u).remove(0);
        run_kernel(&ThermalApplyKernel, w, h, &[(terrain, 1), (&talus[..], 8), (&eroded[..], 1)], &[1, 1], u).remove(0)
    }

    fn corner_peak() -> Vec<f32> {
        let mut terrain = vec![10.0; 16];
        terrain[0] = 20.0;
        terrain
    }

    #[test]
    fn test_corner_peak_relaxes_and_conserves_mass() {
        let mut u = uniforms(4, 4);
        u.repose_deg = 0.0;
        let terrain = corner_peak();
        let out = relax(&terrain, 4, 4, &u);

        assert!(out[0] < 20.0);
        assert!(out[1] > 10.0 && out[4] > 10.0);
        let before: f32 = terrain.iter().sum();
        let after: f32 = out.iter().sum();
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn test_steep_repose_is_a_no_op() {
        let mut u = uniforms(4, 4);
        u.repose_deg = 90.0;
        u.include_diagonals = 1;
        let terrain = corner_peak();
        assert_eq!(relax(&terrain, 4, 4, &u), terrain);
    }

    #[test]
    fn test_diagonals_conserve_mass_on_rough_terrain() {
        let (w, h) = (7, 5);
        let mut u = uniforms(w, h);
        u.repose_deg = 20.0;
        u.include_diagonals = 1;
        u.texel = [1.0, 2.0];
        let terrain: Vec<f32> = (0..w * h).map(|i| ((i * 7919) % 13) as f32).collect();
        let out = relax(&terrain, w, h, &u);

        let before: f64 = terrain.iter().map(|&v| v as f64).sum();
        let after: f64 = out.iter().map(|&v| v as f64).sum();
        assert!((before - after).abs() < 1e-3);
        assert_ne!(out, terrain);
    }

    #[test]
    fn test_repose_jitter_varies_per_cell() {
        let (w, h) = (32, 4);
        let mut u = uniforms(w, h);
        u.repose_deg = 35.0;
        let slope = talus_slope(32.0);
        let terrain: Vec<f32> = (0..w * h).map(|i| (w - i % w) as f32 * slope).collect();
        let hardness = vec![0.0; w * h];
        let moved = |u: &KernelUniforms| -> Vec<bool> {
            let talus = run_kernel(&ThermalOutflowKernel, w, h, &[(&terrain[..], 1), (&hardness[..], 1)], &[8], u).remove(0);
            talus.chunks_exact(8).map(|c| c.iter().any(|&f| f > 0.0)).collect()
        };

        // A 32 degree ramp is stable under a fixed 35 degree repose.
        assert!(moved(&u).iter().all(|&m| !m));

        u.repose_jitter_deg = 10.0;
        u.jitter_salt = 7;
        let jittered = moved(&u);
        let interior: Vec<bool> = (0..w * h).filter(|i| i % w + 1 < w).map(|i| jittered[i]).collect();
        assert!(interior.iter().any(|&m| m));
        assert!(interior.iter().any(|&m| !m));

        u.jitter_salt = 8;
        assert_ne!(moved(&u), jittered);
    }

    #[test]
    fn test_cell_noise_range() {
        for salt in [0, 1, 0xdead_beef] {
            for y in 0..16 {
                for x in 0..16 {
                    let n = cell_noise(salt, x, y);
                    assert!((-1.0..1.0).contains(&n));
                }
            }
        }
    }
}

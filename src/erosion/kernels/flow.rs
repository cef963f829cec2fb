//! Flow phase: pipe-model outflow, then water depth and velocity.

use glam::Vec2;

use super::{neighbor, OPPOSITE, WET_EPSILON};
use crate::backend::{GridKernel, GridView, KernelId, KernelUniforms, RowMut};

/// Outflow flux to the four axis neighbours.
///
/// Inputs: Height, Water, Flux (previous). Output: Flux.
pub struct OutflowKernel;

impl GridKernel for OutflowKernel {
    fn id(&self) -> KernelId {
        KernelId::Outflow
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
        let (terrain, water, flux) = (&inputs[0], &inputs[1], &inputs[2]);
        let rain = u.precipitation * u.dt;
        let pipe = u.dt * u.flow_rate * u.gravity;

        for x in 0..columns.min(width) {
            // Rain lands before the water moves.
            let available = water.at(x, y) + rain;
            let surface = terrain.at(x, y) * u.height_scale + available;
            let previous = flux.cell(x, y);

            let mut out = [0.0f32; 4];
            for (dir, f) in out.iter_mut().enumerate() {
                if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
                    let neighbor_surface = terrain.at(nx, ny) * u.height_scale + water.at(nx, ny) + rain;
                    let dist = if dir < 2 { u.texel[0] } else { u.texel[1] };
                    *f = (previous[dir] + pipe * (surface - neighbor_surface) / dist).max(0.0);
                }
            }

            // Never drain more water than the cell holds.
            let drained = out.iter().sum::<f32>() * u.dt;
            if drained > available {
                let k = if drained > 0.0 { available / drained } else { 0.0 };
                for f in &mut out {
                    *f *= k;
                }
            }

            outputs[0].set_cell(x, &out);
        }
    }
}

/// Water depth from the flux divergence, and the velocity field.
///
/// Inputs: Water, Flux (current). Outputs: Water, WaterVelocity.
pub struct WaterUpdateKernel;

impl GridKernel for WaterUpdateKernel {
    fn id(&self) -> KernelId {
        KernelId::WaterUpdate
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
        let (water, flux) = (&inputs[0], &inputs[1]);

        for x in 0..columns.min(width) {
            let f = flux.cell(x, y);
            let outflow: f32 = f.iter().sum();

            // incoming[dir] is what the neighbour in `dir` sends back to us.
            let mut incoming = [0.0f32; 4];
            for (dir, inc) in incoming.iter_mut().enumerate() {
                if let Some((nx, ny)) = neighbor(x, y, dir, width, height) {
                    *inc = flux.channel(nx, ny, OPPOSITE[dir]);
                }
            }
            let inflow: f32 = incoming.iter().sum();

            let w0 = water.at(x, y);
            let w1 = (w0 + u.dt * (u.precipitation - u.evaporation + inflow - outflow)).max(0.0);

            // Average flow through the cell: (in from W - out to W + out to E - in from E) / 2.
            let through_x = 0.5 * (incoming[1] - f[1] + f[0] - incoming[0]);
            let through_y = 0.5 * (incoming[3] - f[3] + f[2] - incoming[2]);
            let mean_depth = 0.5 * (w0 + w1);
            let velocity = if mean_depth > WET_EPSILON {
                let v = Vec2::new(through_x * u.texel[0], through_y * u.texel[1]) / mean_depth;
                // Water never crosses more than one cell per step.
                if u.dt > 0.0 {
                    v.clamp_length_max(u.texel[0].min(u.texel[1]) / u.dt)
                } else {
                    v
                }
            } else {
                Vec2::ZERO
            };

            outputs[0].set(x, w1);
            outputs[1].set_vec2(x, velocity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::kernels::test_util::{run_kernel, uniforms};

    fn slope(width: usize, height: usize) -> Vec<f32> {
        (0..width * height).map(|i| (width - i % width) as f32).collect()
    }

    #[test]
    fn test_flat_dry_terrain_has_no_flux() {
        let (w, h) = (4, 4);
        let terrain = vec![10.0; w * h];
        let water = vec![0.0; w * h];
        let flux = vec![0.0; w * h * 4];
        let out = run_kernel(&OutflowKernel, w, h, &[(&terrain[..], 1), (&water[..], 1), (&flux[..], 4)], &[4], &uniforms(w, h));
        assert!(out[0].iter().all(|&f| f == 0.0));
    }

    #[test]
    fn test_outflow_never_exceeds_available_water() {
        let (w, h) = (6, 3);
        let terrain = slope(w, h);
        let water = vec![0.05; w * h];
        let flux = vec![0.0; w * h * 4];
        let mut u = uniforms(w, h);
        u.precipitation = 0.1;
        let out = run_kernel(&OutflowKernel, w, h, &[(&terrain[..], 1), (&water[..], 1), (&flux[..], 4)], &[4], &u);

        for i in 0..w * h {
            let cell = &out[0][i * 4..i * 4 + 4];
            assert!(cell.iter().all(|&f| f >= 0.0));
            let drained: f32 = cell.iter().sum::<f32>() * u.dt;
            assert!(drained <= water[i] + u.precipitation * u.dt + 1e-6);
        }
        // Downhill is +x, so the first column flows east and never west.
        assert!(out[0][0] > 0.0);
        assert_eq!(out[0][1], 0.0);
    }

    #[test]
    fn test_no_flux_across_domain_edge() {
        let (w, h) = (3, 3);
        let terrain: Vec<f32> = vec![5.0, 1.0, 5.0, 1.0, 9.0, 1.0, 5.0, 1.0, 5.0];
        let water = vec![1.0; w * h];
        let flux = vec![0.0; w * h * 4];
        let out = run_kernel(&OutflowKernel, w, h, &[(&terrain[..], 1), (&water[..], 1), (&flux[..], 4)], &[4], &uniforms(w, h));
        // Corner (0, 0): west and south are outside the domain.
        assert_eq!(out[0][1], 0.0);
        assert_eq!(out[0][3], 0.0);
        // Center flows in all four directions.
        assert!(out[0][4 * 4..4 * 4 + 4].iter().all(|&f| f > 0.0));
    }

    #[test]
    fn test_water_update_conserves_volume_and_stays_non_negative() {
        let (w, h) = (5, 5);
        let terrain = slope(w, h);
        let water: Vec<f32> = (0..w * h).map(|i| 0.01 * (i % 3) as f32).collect();
        let flux = vec![0.0; w * h * 4];
        let u = uniforms(w, h);
        let flux = run_kernel(&OutflowKernel, w, h, &[(&terrain[..], 1), (&water[..], 1), (&flux[..], 4)], &[4], &u)
            .remove(0);
        let out = run_kernel(&WaterUpdateKernel, w, h, &[(&water[..], 1), (&flux[..], 4)], &[1, 2], &u);

        assert!(out[0].iter().all(|&v| v >= 0.0));
        let before: f32 = water.iter().sum();
        let after: f32 = out[0].iter().sum();
        assert!((before - after).abs() < 1e-4, "{before} vs {after}");
    }

    #[test]
    fn test_velocity_points_downhill() {
        let (w, h) = (8, 1);
        let terrain = slope(w, h);
        let water = vec![0.5; w * h];
        let flux = vec![0.0; w * h * 4];
        let u = uniforms(w, h);
        let flux = run_kernel(&OutflowKernel, w, h, &[(&terrain[..], 1), (&water[..], 1), (&flux[..], 4)], &[4], &u)
            .remove(0);
        let out = run_kernel(&WaterUpdateKernel, w, h, &[(&water[..], 1), (&flux[..], 4)], &[1, 2], &u);

        let vx = out[1][2 * 3];
        let vy = out[1][2 * 3 + 1];
        assert!(vx > 0.0);
        assert_eq!(vy, 0.0);
    }

    #[test]
    fn test_thin_film_velocity_respects_cell_per_step_limit() {
        let (w, h) = (8, 1);
        // Strong eastward flow through a film barely above the wet threshold.
        let water = vec![2.0 * WET_EPSILON; w * h];
        let flux: Vec<f32> = (0..w * h).flat_map(|_| [1.0, 0.0, 0.0, 0.0]).collect();
        let u = uniforms(w, h);
        let out = run_kernel(&WaterUpdateKernel, w, h, &[(&water[..], 1), (&flux[..], 4)], &[1, 2], &u);

        let limit = u.texel[0] / u.dt;
        for c in out[1].chunks_exact(2) {
            assert!(Vec2::new(c[0], c[1]).length() <= limit * (1.0 + 1e-5));
        }
        // Interior cells keep their depth and run at the limit.
        assert!((out[1][2 * 3] - limit).abs() < 1e-3);
    }

    #[test]
    fn test_dry_cell_has_zero_velocity() {
        let (w, h) = (2, 2);
        let water = vec![0.0; w * h];
        let flux = vec![0.0; w * h * 4];
        let mut u = uniforms(w, h);
        u.evaporation = 1.0;
        let out = run_kernel(&WaterUpdateKernel, w, h, &[(&water[..], 1), (&flux[..], 4)], &[1, 2], &u);
        assert!(out[0].iter().all(|&v| v == 0.0));
        assert!(out[1].iter().all(|&v| v == 0.0));
    }
}

use serde::{Deserialize, Serialize};

/// Cutoff-cube lookup tables precomputed once at world construction. See
/// spec.md §4.5 and the `Table` list in §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecomputedTables {
    cutoff: u32,
    r2: Vec<f64>,
    r: Vec<f64>,
    i_r: Vec<f64>,
    e_r: Vec<f64>,
    k: Vec<f64>,
    /// `sI`, the scalar self-interaction constant subtracted from the
    /// future-site Coulomb sum (spec.md §4.3).
    pub self_interaction: f64,
    /// `κ = q / (4π·ε_r·ε₀·a)`.
    pub kappa: f64,
    /// `β = q / (kB·T)`.
    pub beta: f64,
    gaussian_enabled: bool,
}

const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;
const VACUUM_PERMITTIVITY: f64 = 8.854_187_8128e-12;
const BOLTZMANN: f64 = 1.380_649e-23;

impl PrecomputedTables {
    /// Build tables for a cutoff `C`, relative permittivity `epsilon_r`,
    /// lattice spacing `a` (meters), temperature `temperature_k`, and
    /// optional Gaussian screening with standard deviation `sigma` (grid
    /// units; `None` disables the `eR` table, matching spec.md's "optional
    /// Gaussian screening"), and `hopping_range` (1 or 2) feeding the `K`
    /// coupling table (spec.md §4.5: "piecewise function of distance and
    /// hop range").
    pub fn build(
        cutoff: u32,
        epsilon_r: f64,
        a: f64,
        temperature_k: f64,
        sigma: Option<f64>,
        hopping_range: u8,
    ) -> Self {
        let c = cutoff as usize;
        let n = c * c * c;
        let mut r2 = vec![0.0; n];
        let mut r = vec![0.0; n];
        let mut i_r = vec![0.0; n];
        let mut e_r = vec![1.0; n];
        let kappa = ELEMENTARY_CHARGE / (4.0 * std::f64::consts::PI * epsilon_r * VACUUM_PERMITTIVITY * a);

        for dx in 0..c {
            for dy in 0..c {
                for dz in 0..c {
                    let idx = Self::raw_index(c, dx, dy, dz);
                    let r2v = (dx * dx + dy * dy + dz * dz) as f64;
                    let rv = r2v.sqrt();
                    r2[idx] = r2v;
                    r[idx] = rv;
                    i_r[idx] = if rv > 0.0 { 1.0 / rv } else { 0.0 };
                    if let Some(sigma) = sigma {
                        e_r[idx] = erf(rv / (std::f64::consts::SQRT_2 * sigma));
                    }
                }
            }
        }

        let k = Self::build_coupling(cutoff, hopping_range);
        // A single nearest-neighbor hop's self-interaction: kappa / 1 (the
        // future site transiently counts the hopping carrier's own charge
        // at unit distance from itself before the hop completes).
        let self_interaction = kappa;

        PrecomputedTables {
            cutoff,
            r2,
            r,
            i_r,
            e_r,
            k,
            self_interaction,
            kappa,
            beta: ELEMENTARY_CHARGE / (BOLTZMANN * temperature_k),
            gaussian_enabled: sigma.is_some(),
        }
    }

    /// Build coupling for the given hopping range: unit coupling for
    /// nearest-neighbor (`r == 1`) hops, `1/r` for longer-range hops within
    /// the cube (reflecting reduced tunneling probability with distance),
    /// zero outside the hopping range's reach.
    fn build_coupling(cutoff: u32, hopping_range: u8) -> Vec<f64> {
        let c = cutoff as usize;
        let reach = hopping_range.max(1) as f64;
        let mut k = vec![0.0; c * c * c];
        for dx in 0..c {
            for dy in 0..c {
                for dz in 0..c {
                    let rv = ((dx * dx + dy * dy + dz * dz) as f64).sqrt();
                    let idx = Self::raw_index(c, dx, dy, dz);
                    k[idx] = if rv == 0.0 {
                        0.0
                    } else if rv <= reach {
                        1.0 / rv.max(1.0)
                    } else {
                        0.0
                    };
                }
            }
        }
        k
    }

    /// Override the coupling table with a single uniform value, used by
    /// callers (and the S1/S6 scenario tests) that fix `coupling = 1`
    /// everywhere rather than deriving it from distance.
    pub fn with_uniform_coupling(mut self, value: f64) -> Self {
        self.k.iter_mut().for_each(|v| *v = value);
        self
    }

    fn raw_index(c: usize, dx: usize, dy: usize, dz: usize) -> usize {
        (dx * c + dy) * c + dz
    }

    fn lookup(&self, table: &[f64], dx: i32, dy: i32, dz: i32) -> f64 {
        let c = self.cutoff as i32;
        let (adx, ady, adz) = (dx.abs(), dy.abs(), dz.abs());
        if adx >= c || ady >= c || adz >= c {
            return 0.0;
        }
        table[Self::raw_index(self.cutoff as usize, adx as usize, ady as usize, adz as usize)]
    }

    pub fn cutoff(&self) -> u32 {
        self.cutoff
    }

    pub fn gaussian_enabled(&self) -> bool {
        self.gaussian_enabled
    }

    /// `1/r` at displacement `(dx, dy, dz)`, or exactly zero when any axis
    /// displacement reaches the cutoff (spec.md §8 property 4).
    pub fn inverse_r(&self, dx: i32, dy: i32, dz: i32) -> f64 {
        self.lookup(&self.i_r, dx, dy, dz)
    }

    /// `iR · eR` (Gaussian-screened inverse distance).
    pub fn screened_inverse_r(&self, dx: i32, dy: i32, dz: i32) -> f64 {
        self.lookup(&self.i_r, dx, dy, dz) * self.lookup(&self.e_r, dx, dy, dz)
    }

    pub fn coupling(&self, dx: i32, dy: i32, dz: i32) -> f64 {
        self.lookup(&self.k, dx, dy, dz)
    }

    pub fn r(&self, dx: i32, dy: i32, dz: i32) -> f64 {
        self.lookup(&self.r, dx, dy, dz)
    }

    /// Flat `(cutoff, iR, eR)` view of the lookup cube, for a GPU backend
    /// to upload as storage buffers rather than recomputing `1/r` and the
    /// Gaussian-screening factor per thread.
    pub fn raw_distance_tables(&self) -> (u32, &[f64], &[f64]) {
        (self.cutoff, &self.i_r, &self.e_r)
    }
}

/// Abramowitz–Stegun 7.1.26 approximation of `erf`, good to ~1.5e-7. Used
/// only to build the Gaussian-screening table once at startup, so a
/// lightweight series is preferable to adding a numerics dependency for a
/// single function.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_gives_exact_zero_beyond_cube() {
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1);
        assert_eq!(tables.inverse_r(3, 0, 0), 0.0);
        assert_eq!(tables.inverse_r(0, 5, 0), 0.0);
        assert_eq!(tables.coupling(0, 0, 3), 0.0);
    }

    #[test]
    fn origin_inverse_r_is_zero() {
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1);
        assert_eq!(tables.inverse_r(0, 0, 0), 0.0);
    }

    #[test]
    fn inverse_r_matches_euclidean_distance() {
        let tables = PrecomputedTables::build(4, 3.5, 1e-9, 300.0, None, 1);
        let expected = 1.0 / (2.0f64).sqrt();
        assert!((tables.inverse_r(1, 1, 0) - expected).abs() < 1e-12);
    }

    #[test]
    fn gaussian_screening_disabled_is_pure_coulomb() {
        let tables = PrecomputedTables::build(4, 3.5, 1e-9, 300.0, None, 1);
        assert_eq!(tables.screened_inverse_r(1, 0, 0), tables.inverse_r(1, 0, 0));
    }

    #[test]
    fn erf_approximation_sane_values() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(10.0) - 1.0).abs() < 1e-6);
        assert!((erf(-1.0) + erf(1.0)).abs() < 1e-6);
    }

    #[test]
    fn uniform_coupling_override() {
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1).with_uniform_coupling(1.0);
        assert_eq!(tables.coupling(1, 0, 0), 1.0);
        assert_eq!(tables.coupling(1, 1, 1), 1.0);
    }
}

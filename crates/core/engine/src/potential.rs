use serde::{Deserialize, Serialize};

use crate::error::PlacementError;
use crate::grid::{Agent, Grid, Site};
use crate::params::Parameters;
use crate::rng::DeterministicRng;
use crate::tables::PrecomputedTables;
use crate::Species;

/// Retry budget for randomized placement (trap seeding, carrier/defect
/// scattering). spec.md §7: "random placement exceeds 10·volume retries".
fn retry_budget(volume: u32) -> usize {
    10 * volume as usize
}

/// The per-site potential landscape: applied field plus trap/defect
/// contributions. See spec.md §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Potential {
    /// `(site, contribution)` for every trap site, where `contribution` is
    /// the exact value added to that site's potential (`trap.potential`
    /// plus any Gaussian perturbation actually drawn), persisted verbatim
    /// so `[TrapPotentials]` round-trips without re-running trap placement.
    traps: Vec<(Site, f64)>,
}

impl Potential {
    /// Build the landscape in place on `grid`: linear drop along X, gate
    /// slope along Z, then trap seeding + growth. Returns the built
    /// `Potential` (which remembers trap sites/values for checkpointing).
    pub fn build(
        grid: &mut Grid,
        params: &Parameters,
        rng: &mut DeterministicRng,
    ) -> Result<Self, PlacementError> {
        let (x_size, y_size, z_size) = grid.dims();

        for z in 0..z_size {
            for y in 0..y_size {
                for x in 0..x_size {
                    let site = grid.index(x, y, z);
                    let linear = if x_size > 1 {
                        params.voltage_left
                            + (params.voltage_right - params.voltage_left) * (x as f64 + 0.5)
                                / x_size as f64
                    } else {
                        params.voltage_left
                    };
                    let gate = if z_size == 1 { 0.0 } else { params.slope_z * (z as f64 + 0.5) };
                    grid.set_potential(site, linear + gate);
                }
            }
        }

        let traps = Self::place_traps(grid, params, rng)?;
        for &(site, value) in &traps {
            let existing = grid.potential_at(site);
            grid.set_potential(site, existing + value);
        }

        Ok(Potential { traps })
    }

    fn place_traps(
        grid: &Grid,
        params: &Parameters,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<(Site, f64)>, PlacementError> {
        let volume = grid.volume();
        let target = (params.trap_percentage * volume as f64).round() as usize;
        if target == 0 {
            return Ok(Vec::new());
        }
        let seed_count =
            ((params.seed_percentage.max(f64::MIN_POSITIVE) * target as f64).ceil() as usize)
                .clamp(1, target);

        let mut traps: Vec<(Site, f64)> = Vec::with_capacity(target);
        let mut is_trap = vec![false; volume as usize];

        let draw_value = |rng: &mut DeterministicRng| {
            if params.gaussian_stdev > 0.0 {
                params.trap_potential + rng.next_normal(params.gaussian_average, params.gaussian_stdev)
            } else {
                params.trap_potential
            }
        };

        let mut attempts = 0usize;
        let budget = retry_budget(volume);
        while traps.len() < seed_count {
            if attempts >= budget {
                return Err(PlacementError::RetryBudgetExceeded { kind: "trap seed", limit: budget });
            }
            attempts += 1;
            let site = rng.next_index(volume as usize) as Site;
            if is_trap[site as usize] || !grid.agent_at(site).is_empty() {
                continue;
            }
            is_trap[site as usize] = true;
            traps.push((site, draw_value(rng)));
        }

        attempts = 0;
        while traps.len() < target {
            if attempts >= budget {
                return Err(PlacementError::RetryBudgetExceeded { kind: "trap growth", limit: budget });
            }
            attempts += 1;
            let existing_trap = traps[rng.next_index(traps.len())].0;
            let neighbors = grid.neighbors(existing_trap, 1);
            if neighbors.is_empty() {
                continue;
            }
            let candidate = neighbors[rng.next_index(neighbors.len())];
            if is_trap[candidate as usize] || !grid.agent_at(candidate).is_empty() {
                continue;
            }
            is_trap[candidate as usize] = true;
            traps.push((candidate, draw_value(rng)));
        }

        Ok(traps)
    }

    pub fn traps(&self) -> &[(Site, f64)] {
        &self.traps
    }

    /// Restore a landscape directly from checkpointed trap data, without
    /// re-running randomized placement. Recomputes the linear/gate field
    /// fresh (deterministic from `Parameters`) then re-applies the
    /// persisted trap contributions.
    pub fn restore(grid: &mut Grid, params: &Parameters, traps: Vec<(Site, f64)>) -> Self {
        let (x_size, y_size, z_size) = grid.dims();
        for z in 0..z_size {
            for y in 0..y_size {
                for x in 0..x_size {
                    let site = grid.index(x, y, z);
                    let linear = if x_size > 1 {
                        params.voltage_left
                            + (params.voltage_right - params.voltage_left) * (x as f64 + 0.5)
                                / x_size as f64
                    } else {
                        params.voltage_left
                    };
                    let gate = if z_size == 1 { 0.0 } else { params.slope_z * (z as f64 + 0.5) };
                    grid.set_potential(site, linear + gate);
                }
            }
        }
        for &(site, value) in &traps {
            let existing = grid.potential_at(site);
            grid.set_potential(site, existing + value);
        }
        Potential { traps }
    }

    /// Correction applied when the opposite-species carrier currently
    /// occupies `site`: subtracts the exciton binding energy from the
    /// electron's view, adds it from the hole's, capturing electron–hole
    /// attraction (spec.md §4.2 `binding`).
    pub fn binding(&self, grid: &Grid, site: Site, species: Species, exciton_binding: f64) -> f64 {
        let opposite_present = match (species, grid.agent_at(site)) {
            (Species::Electron, Agent::Hole(_)) => true,
            (Species::Hole, Agent::Electron(_)) => true,
            _ => false,
        };
        if !opposite_present {
            return 0.0;
        }
        match species {
            Species::Electron => -exciton_binding,
            Species::Hole => exciton_binding,
        }
    }
}

/// Truncated Coulomb sum over `sources` (site, integer charge) at `site`,
/// optionally Gaussian-screened. Shared by `coulomb_e/h/d` and their
/// `gauss_*` counterparts. spec.md keeps them as distinct named
/// operations, but they differ only in which table they read, so this one
/// function backs all six.
pub fn coulomb_sum(
    tables: &PrecomputedTables,
    grid: &Grid,
    site: Site,
    sources: impl Iterator<Item = (Site, i32)>,
    gaussian: bool,
) -> f64 {
    sources
        .map(|(source_site, charge)| {
            let (dx, dy, dz) = grid.distance_i(site, source_site);
            let inv_r =
                if gaussian { tables.screened_inverse_r(dx, dy, dz) } else { tables.inverse_r(dx, dy, dz) };
            tables.kappa * charge as f64 * inv_r
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    #[test]
    fn linear_drop_spans_voltage_at_cell_centers() {
        let mut grid = Grid::new(4, 1, 1);
        let mut rng = DeterministicRng::from_seed(1);
        let mut params = test_params();
        params.voltage_left = 0.0;
        params.voltage_right = 8.0;
        params.trap_percentage = 0.0;
        Potential::build(&mut grid, &params, &mut rng).unwrap();
        // Cell centers at (0.5,1.5,2.5,3.5)/4 * 8 = 1,3,5,7
        assert!((grid.potential_at(grid.index(0, 0, 0)) - 1.0).abs() < 1e-9);
        assert!((grid.potential_at(grid.index(3, 0, 0)) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn gate_slope_is_noop_when_z_is_one() {
        let mut grid = Grid::new(3, 3, 1);
        let mut rng = DeterministicRng::from_seed(1);
        let mut params = test_params();
        params.slope_z = 5.0;
        params.trap_percentage = 0.0;
        Potential::build(&mut grid, &params, &mut rng).unwrap();
        let a = grid.potential_at(grid.index(1, 1, 0));
        let b = grid.potential_at(grid.index(1, 2, 0));
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn trap_growth_reaches_target_fraction() {
        let mut grid = Grid::new(10, 10, 1);
        let mut rng = DeterministicRng::from_seed(9);
        let mut params = test_params();
        params.trap_percentage = 0.2;
        params.seed_percentage = 0.1;
        let potential = Potential::build(&mut grid, &params, &mut rng).unwrap();
        assert_eq!(potential.traps().len(), 20);
    }

    #[test]
    fn coulomb_sum_pairwise_matches_spec_scenario_s6() {
        // grid=3x1x1, electrons at sites 0 and 2, cutoff >= 3.
        let grid = Grid::new(3, 1, 1);
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1);
        let site1 = grid.index(1, 0, 0);
        let sources = vec![(grid.index(0, 0, 0), -1), (grid.index(2, 0, 0), -1)];
        let delta = coulomb_sum(&tables, &grid, site1, sources.into_iter(), false);
        let expected = tables.kappa * (-1.0) * (tables.inverse_r(1, 0, 0) + tables.inverse_r(1, 0, 0));
        assert!((delta - expected).abs() < 1e-12);
    }

    fn test_params() -> Parameters {
        Parameters::parse(
            "\
grid.x = 4\ngrid.y = 1\ngrid.z = 1\n\
simulation.type = transistor\n\
iterations.real = 10\niterations.print = 10\nrandom.seed = 1\n\
electron.percentage = 0.1\nhole.percentage = 0.0\n\
defect.percentage = 0.0\ntrap.percentage = 0.0\nseed.percentage = 1.0\nseed.charges = 0\n\
voltage.left = 0\nvoltage.right = 0\nslope.z = 0\ntrap.potential = 0\n\
gaussian.stdev = 0\ngaussian.average = 0\n\
temperature.kelvin = 300\ndielectric.constant = 3.5\ngrid.factor = 1e-9\

source.rate = 1\ndrain.rate = 1\nrecombination.rate = 1\ngeneration.rate = 0\n\
coulomb.carriers = false\ndefects.charge = 0\nelectrostatic.cutoff = 3\n\
coulomb.gaussian.sigma = 1\nexciton.binding = 0\nhopping.range = 1\n\
use.opencl = false\nwork.x = 0\nwork.y = 0\nwork.z = 0\nwork.size = 0\n\
",
        )
        .unwrap()
    }
}

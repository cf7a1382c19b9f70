use crate::error::GpuError;
use crate::grid::{Grid, Site};
use crate::potential::coulomb_sum;
use crate::tables::PrecomputedTables;

/// Kernel 2 of spec.md §4.6: a batched Coulomb sum over every carrier's
/// current and proposed future site in one pass. `langmuir-core` only
/// depends on this trait; `langmuir-gpu` supplies the hardware-accelerated
/// implementation, and `langmuir-cli` wires it in at runtime (spec.md §9
/// "Design Notes: GPU optional... treat it as an optimization, not a
/// semantic dependency").
pub trait CoulombBackend: Send + Sync {
    /// `current` and `future` are parallel arrays of query sites, one pair
    /// per carrier. `sources` is the packed charge list (electrons, holes,
    /// then charged defects, in that fixed order per spec.md §4.6) used as
    /// the summation set. Returns a dense vector of length `2 * current.len()`:
    /// entry `i` is the current-site sum for carrier `i`, entry
    /// `current.len() + i` is the future-site sum.
    fn coulomb_batch(
        &self,
        grid: &Grid,
        tables: &PrecomputedTables,
        current: &[Site],
        future: &[Site],
        sources: &[(Site, i32)],
        gaussian: bool,
    ) -> Result<Vec<f64>, GpuError>;
}

/// The CPU reference backend. Always available, always correct by
/// definition (spec.md §4.6: "When disabled or unavailable, the CPU path is
/// authoritative"); `langmuir-gpu`'s batched kernel must agree with this one
/// within tolerance (spec.md §8 property 5).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CoulombBackend for CpuBackend {
    #[tracing::instrument(level = "debug", skip_all, fields(carriers = current.len()))]
    fn coulomb_batch(
        &self,
        grid: &Grid,
        tables: &PrecomputedTables,
        current: &[Site],
        future: &[Site],
        sources: &[(Site, i32)],
        gaussian: bool,
    ) -> Result<Vec<f64>, GpuError> {
        let mut out = Vec::with_capacity(current.len() + future.len());
        for &site in current.iter().chain(future.iter()) {
            out.push(coulomb_sum(tables, grid, site, sources.iter().copied(), gaussian));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    #[test]
    fn cpu_backend_matches_direct_coulomb_sum() {
        let grid = Grid::new(3, 1, 1);
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1);
        let sources = vec![(grid.index(0, 0, 0), -1), (grid.index(2, 0, 0), -1)];
        let current = vec![grid.index(1, 0, 0)];
        let future = vec![grid.index(0, 0, 0)];
        let out = CpuBackend.coulomb_batch(&grid, &tables, &current, &future, &sources, false).unwrap();
        assert_eq!(out.len(), 2);
        let expected_current =
            coulomb_sum(&tables, &grid, current[0], sources.iter().copied(), false);
        assert!((out[0] - expected_current).abs() < 1e-12);
    }
}

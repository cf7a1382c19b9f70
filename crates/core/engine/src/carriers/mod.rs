pub mod flux;

use serde::{Deserialize, Serialize};

use crate::grid::{Agent, Grid, Site};
use crate::potential::{coulomb_sum, Potential};
use crate::tables::PrecomputedTables;
use flux::FluxAgent;

/// Stable identity for a registered charge carrier. Never reused within a
/// run; see spec.md §3 "Agent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CarrierId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Species {
    Electron,
    Hole,
}

impl Species {
    pub fn charge(self) -> i32 {
        match self {
            Species::Electron => -1,
            Species::Hole => 1,
        }
    }
}

/// Result of one carrier's per-tick decision. `commit` consumes this to
/// update grid occupancy; see spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureOutcome {
    /// The hop was rejected (or there was nothing to decide); the carrier
    /// stays at its current site.
    Stay,
    /// The hop was accepted into an empty bulk site.
    Move,
    /// The carrier was accepted by a drain and should be removed on
    /// commit.
    Drained,
}

/// A single electron or hole. See spec.md §3 "Agent" and §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Carrier {
    pub id: CarrierId,
    pub species: Species,
    pub site: Site,
    pub future_site: Site,
    pub lifetime: u64,
    pub pathlength: u64,
    pub delta_energy: f64,
    pub removed: bool,
    /// Dense index into the GPU staging arrays, refreshed every tick in
    /// `World::refresh_gpu_index` (spec.md §4.6).
    pub gpu_index: usize,
    outcome: FutureOutcome,
}

/// Borrowed, read-only context a carrier needs to decide its move. Bundling
/// this avoids a carrier holding an owning handle back to `World`, see
/// spec.md §9 "Design Notes: Cyclic ownership".
pub struct DecideContext<'a> {
    pub grid: &'a Grid,
    pub tables: &'a PrecomputedTables,
    pub potential: &'a Potential,
    pub electrons: &'a [(Site, i32)],
    pub holes: &'a [(Site, i32)],
    pub defects: &'a [(Site, i32)],
    pub coulomb_enabled: bool,
    pub gaussian_enabled: bool,
    pub exciton_binding: f64,
    /// Precomputed Coulomb sums at `(current, future)` for this carrier,
    /// supplied by the GPU backend when enabled (spec.md §4.6). `None`
    /// means "use the CPU path".
    pub gpu_coulomb: Option<(f64, f64)>,
}

impl Carrier {
    pub fn new(id: CarrierId, species: Species, site: Site) -> Self {
        Carrier {
            id,
            species,
            site,
            future_site: site,
            lifetime: 0,
            pathlength: 0,
            delta_energy: 0.0,
            removed: false,
            gpu_index: 0,
            outcome: FutureOutcome::Stay,
        }
    }

    pub fn outcome(&self) -> FutureOutcome {
        self.outcome
    }

    /// Draw a uniformly random neighbor of `site` as the proposed future
    /// site, and reset `delta_energy`. spec.md §4.3 step 1.
    pub fn choose_future(&mut self, grid: &Grid, hopping_range: u8, rng: &mut crate::rng::DeterministicRng) {
        self.lifetime += 1;
        self.delta_energy = 0.0;
        let neighbors = grid.neighbors(self.site, hopping_range);
        if neighbors.is_empty() {
            self.future_site = self.site;
            return;
        }
        self.future_site = neighbors[rng.next_index(neighbors.len())];
    }

    /// Dispatch on the variant of the chosen site and decide whether to
    /// accept the hop. spec.md §4.3 step 2. `drain` is `Some` only when the
    /// chosen site is a `Drain` special agent bound to this carrier's
    /// species.
    pub fn decide_future(
        &mut self,
        ctx: &DecideContext<'_>,
        drain: Option<&mut FluxAgent>,
        rng: &mut crate::rng::DeterministicRng,
    ) {
        if self.future_site == self.site {
            self.outcome = FutureOutcome::Stay;
            return;
        }

        match ctx.grid.agent_at(self.future_site) {
            Agent::Empty => self.decide_empty(ctx, rng),
            Agent::Drain { .. } => self.decide_drain(drain, rng),
            Agent::Defect | Agent::Electron(_) | Agent::Hole(_) | Agent::Source { .. } => {
                self.future_site = self.site;
                self.outcome = FutureOutcome::Stay;
            }
            Agent::ExcitonSource { .. } | Agent::Recombination { .. } => {
                self.future_site = self.site;
                self.outcome = FutureOutcome::Stay;
            }
        }
    }

    fn decide_empty(&mut self, ctx: &DecideContext<'_>, rng: &mut crate::rng::DeterministicRng) {
        let charge = self.species.charge();
        let field_delta =
            charge as f64 * (ctx.grid.potential_at(self.future_site) - ctx.grid.potential_at(self.site));

        let coulomb_step = if ctx.coulomb_enabled {
            self.coulomb_step(ctx)
        } else {
            0.0
        };

        let binding = ctx.potential.binding(ctx.grid, self.future_site, self.species, ctx.exciton_binding)
            - ctx.potential.binding(ctx.grid, self.site, self.species, ctx.exciton_binding);

        self.delta_energy = field_delta + coulomb_step + binding;

        let (dx, dy, dz) = ctx.grid.distance_i(self.site, self.future_site);
        let coupling = ctx.tables.coupling(dx, dy, dz);
        let acceptance = coupling * (-self.delta_energy * ctx.tables.beta).exp().min(1.0);

        if rng.next_uniform() < acceptance {
            self.pathlength += 1;
            self.outcome = FutureOutcome::Move;
        } else {
            self.future_site = self.site;
            self.outcome = FutureOutcome::Stay;
        }
    }

    /// `Δ_coulomb = q·(ΣE(f)+ΣH(f)+ΣD(f) − ΣE(c)−ΣH(c)−ΣD(c) − q·sI)`.
    /// spec.md §4.3. Uses the GPU-supplied sums when present, otherwise
    /// walks the CPU sum directly, the two must agree within tolerance
    /// (spec.md §8 property 5).
    fn coulomb_step(&self, ctx: &DecideContext<'_>) -> f64 {
        let charge = self.species.charge() as f64;
        let (current_sum, future_sum) = if let Some((c, f)) = ctx.gpu_coulomb {
            (c, f - charge * ctx.tables.self_interaction)
        } else {
            let current = self.cpu_coulomb_sum(ctx, self.site);
            let future = self.cpu_coulomb_sum(ctx, self.future_site) - charge * ctx.tables.self_interaction;
            (current, future)
        };
        charge * (future_sum - current_sum)
    }

    fn cpu_coulomb_sum(&self, ctx: &DecideContext<'_>, site: Site) -> f64 {
        coulomb_sum(ctx.tables, ctx.grid, site, ctx.electrons.iter().copied(), ctx.gaussian_enabled)
            + coulomb_sum(ctx.tables, ctx.grid, site, ctx.holes.iter().copied(), ctx.gaussian_enabled)
            + coulomb_sum(ctx.tables, ctx.grid, site, ctx.defects.iter().copied(), ctx.gaussian_enabled)
    }

    fn decide_drain(&mut self, drain: Option<&mut FluxAgent>, rng: &mut crate::rng::DeterministicRng) {
        let Some(drain) = drain else {
            self.future_site = self.site;
            self.outcome = FutureOutcome::Stay;
            return;
        };
        drain.record_attempt();
        if rng.chance(drain.rate) {
            drain.record_success();
            self.pathlength += 1;
            self.outcome = FutureOutcome::Drained;
        } else {
            self.future_site = self.site;
            self.outcome = FutureOutcome::Stay;
        }
    }

    /// Apply the decided outcome to the grid: move, drain, or no-op.
    /// Returns `true` if the move was aborted because another carrier
    /// occupied the target site between `decide_future` and `commit`
    /// (spec.md §4.3 step 3, §5 ordering guarantees). A `Drained` carrier
    /// only vacates its own site, the drain special agent it moved into is
    /// permanent for the run's duration and keeps absorbing carriers.
    pub fn commit(&mut self, grid: &mut Grid) -> bool {
        if self.future_site == self.site {
            return false;
        }

        match self.outcome {
            FutureOutcome::Drained => {
                let agent = self.agent_tag();
                let _ = grid.unregister(self.site, agent);
                self.removed = true;
                false
            }
            FutureOutcome::Move => {
                if !grid.agent_at(self.future_site).is_empty() {
                    self.future_site = self.site;
                    return true;
                }
                let agent = self.agent_tag();
                let _ = grid.unregister(self.site, agent);
                let _ = grid.register(self.future_site, agent_at_new_site(agent, self.future_site));
                self.site = self.future_site;
                false
            }
            FutureOutcome::Stay => false,
        }
    }

    /// Remove this carrier from the grid outside the normal commit path:
    /// used by the recombination sweep, which runs between `decide_future`
    /// and `commit` and must vacate both carriers in a colliding pair before
    /// `commit` ever looks at their (now-stale) `future_site`.
    pub fn remove_via_recombination(&mut self, grid: &mut Grid) {
        let agent = self.agent_tag();
        let _ = grid.unregister(self.site, agent);
        self.future_site = self.site;
        self.outcome = FutureOutcome::Stay;
        self.removed = true;
    }

    fn agent_tag(&self) -> Agent {
        match self.species {
            Species::Electron => Agent::Electron(self.id),
            Species::Hole => Agent::Hole(self.id),
        }
    }
}

fn agent_at_new_site(agent: Agent, _new_site: Site) -> Agent {
    // The agent variant carries only the carrier id, not its site (the
    // site is the grid index itself), so re-registering at the new site
    // uses the identical tag.
    agent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameters;
    use crate::rng::DeterministicRng;

    fn tables_uniform() -> PrecomputedTables {
        PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1).with_uniform_coupling(1.0)
    }

    #[test]
    fn choose_future_picks_a_neighbor() {
        let grid = Grid::new(3, 3, 1);
        let mut rng = DeterministicRng::from_seed(1);
        let mut carrier = Carrier::new(CarrierId(0), Species::Electron, grid.index(1, 1, 0));
        carrier.choose_future(&grid, 1, &mut rng);
        assert!(grid.neighbors(grid.index(1, 1, 0), 1).contains(&carrier.future_site));
        assert_eq!(carrier.lifetime, 1);
    }

    #[test]
    fn metropolis_accept_always_when_field_favors_hop_and_coupling_is_one() {
        let mut grid = Grid::new(3, 1, 1);
        let params = test_params();
        let mut rng = DeterministicRng::from_seed(5);
        let potential = Potential::restore(&mut grid, &params, Vec::new());
        grid.set_potential(grid.index(0, 0, 0), 10.0);
        grid.set_potential(grid.index(1, 0, 0), 0.0);
        let tables = tables_uniform();
        let electrons: Vec<(Site, i32)> = Vec::new();
        let mut carrier = Carrier::new(CarrierId(0), Species::Electron, grid.index(0, 0, 0));
        carrier.future_site = grid.index(1, 0, 0);
        let ctx = DecideContext {
            grid: &grid,
            tables: &tables,
            potential: &potential,
            electrons: &electrons,
            holes: &[],
            defects: &[],
            coulomb_enabled: false,
            gaussian_enabled: false,
            exciton_binding: 0.0,
            gpu_coulomb: None,
        };
        carrier.decide_future(&ctx, None, &mut rng);
        assert_eq!(carrier.outcome(), FutureOutcome::Move);
    }

    #[test]
    fn metropolis_rejects_when_coupling_is_zero_regardless_of_field() {
        let mut grid = Grid::new(3, 1, 1);
        let params = test_params();
        let mut rng = DeterministicRng::from_seed(5);
        let potential = Potential::restore(&mut grid, &params, Vec::new());
        grid.set_potential(grid.index(0, 0, 0), 10.0);
        grid.set_potential(grid.index(1, 0, 0), 0.0);
        let tables = PrecomputedTables::build(3, 3.5, 1e-9, 300.0, None, 1).with_uniform_coupling(0.0);
        let electrons: Vec<(Site, i32)> = Vec::new();
        let mut carrier = Carrier::new(CarrierId(0), Species::Electron, grid.index(0, 0, 0));
        carrier.future_site = grid.index(1, 0, 0);
        let ctx = DecideContext {
            grid: &grid,
            tables: &tables,
            potential: &potential,
            electrons: &electrons,
            holes: &[],
            defects: &[],
            coulomb_enabled: false,
            gaussian_enabled: false,
            exciton_binding: 0.0,
            gpu_coulomb: None,
        };
        carrier.decide_future(&ctx, None, &mut rng);
        assert_eq!(carrier.outcome(), FutureOutcome::Stay);
    }

    fn test_params() -> Parameters {
        Parameters::parse(
            "\
grid.x = 3\ngrid.y = 1\ngrid.z = 1\n\
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

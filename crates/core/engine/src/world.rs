use std::sync::Mutex;

use hashbrown::HashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::carriers::flux::{FluxAgent, FluxKind};
use crate::carriers::{Carrier, CarrierId, DecideContext, FutureOutcome, Species};
use crate::error::{EngineError, GpuError, PlacementError, StateError};
use crate::gpu::CoulombBackend;
use crate::grid::{Agent, Face, Grid, Site};
use crate::params::{Parameters, SimulationKind};
use crate::potential::Potential;
use crate::rng::DeterministicRng;
use crate::tables::PrecomputedTables;

/// Retry budget for randomized placement. spec.md §7: "random placement
/// exceeds `10·volume` retries".
fn retry_budget(volume: u32) -> usize {
    10 * volume as usize
}

/// Combine a tick number, carrier id, and phase tag (0 = `choose_future`,
/// 1 = `decide_future`) into a single substream ordinal. spec.md §5: each
/// parallel task draws from a deterministic per-task substream so results
/// never depend on how the work is scheduled across threads; reusing a
/// carrier's id alone across both the choose and decide phases of the same
/// tick would hand it the identical substream twice, so the phase tag keeps
/// the two draws independent.
fn substream_ordinal(tick: u64, carrier_id: u32, phase: u8) -> u64 {
    let mut x = tick;
    x = x.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(carrier_id as u64);
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9).wrapping_add(phase as u64);
    x
}

fn species_label(species: Species) -> &'static str {
    match species {
        Species::Electron => "electron",
        Species::Hole => "hole",
    }
}

fn rate_or(explicit: Option<f64>, default: f64) -> f64 {
    explicit.unwrap_or(default)
}

/// Owns the grid, the precomputed tables, the potential landscape, the RNG,
/// every carrier and flux agent, and the defect registry. See spec.md §3
/// invariants and §4.7 `new`.
#[derive(Serialize, Deserialize)]
pub struct World {
    params: Parameters,
    grid: Grid,
    tables: PrecomputedTables,
    potential: Potential,
    rng: DeterministicRng,
    carriers: Vec<Carrier>,
    next_carrier_id: u32,
    defect_sites: Vec<Site>,
    /// `(site, charge)` for defect sites, populated only when
    /// `defects.charge != 0`, an uncharged defect contributes nothing to any
    /// Coulomb sum, so there is nothing to track.
    charged_defects: Vec<(Site, i32)>,
    sources: Vec<FluxAgent>,
    #[serde(with = "drain_mutex_vec")]
    drains: Vec<Mutex<FluxAgent>>,
    exciton_source: Option<FluxAgent>,
    recombination: Option<FluxAgent>,
    current_step: u64,
}

/// `Mutex<FluxAgent>` has no native `Serialize`/`Deserialize` impl; drains
/// are only locked transiently during a single-threaded `decide_future` pass
/// per carrier, never held across a checkpoint save, so serializing the
/// inner value directly (and rewrapping on load) is sound.
mod drain_mutex_vec {
    use std::sync::Mutex;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::carriers::flux::FluxAgent;

    pub fn serialize<S: Serializer>(value: &[Mutex<FluxAgent>], s: S) -> Result<S::Ok, S::Error> {
        let plain: Vec<FluxAgent> =
            value.iter().map(|m| m.lock().expect("drain mutex poisoned").clone()).collect();
        plain.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Mutex<FluxAgent>>, D::Error> {
        let plain = Vec::<FluxAgent>::deserialize(d)?;
        Ok(plain.into_iter().map(Mutex::new).collect())
    }
}

impl World {
    /// Build a fresh world: validate parameters, draw or accept a seed,
    /// precompute tables, place defects then build the potential landscape
    /// (traps skip defect sites), seed initial carriers, then register the
    /// flux agents appropriate to `simulation.type`. spec.md §4.7 `new`.
    #[tracing::instrument(level = "debug", skip_all, fields(grid = %format!("{}x{}x{}", params.grid_x, params.grid_y, params.grid_z)))]
    pub fn new(params: Parameters) -> Result<Self, EngineError> {
        params.validate()?;

        let seed = if params.random_seed == 0 {
            use rand::RngCore;
            rand::rngs::OsRng.next_u64()
        } else {
            params.random_seed
        };
        let mut rng = DeterministicRng::from_seed(seed);
        let mut params = params;
        params.random_seed = seed;

        let mut grid = Grid::new(params.grid_x, params.grid_y, params.grid_z);

        let gaussian_sigma =
            if params.coulomb_gaussian_sigma > 0.0 { Some(params.coulomb_gaussian_sigma) } else { None };
        let tables = PrecomputedTables::build(
            params.electrostatic_cutoff,
            params.dielectric_constant,
            params.grid_factor,
            params.temperature_kelvin,
            gaussian_sigma,
            params.hopping_range,
        );

        let defect_target = (params.defect_percentage * grid.volume() as f64).round() as u32;
        let defect_sites = place_random_defects(&mut grid, &mut rng, defect_target)?;
        let charged_defects = if params.defects_charge != 0 {
            defect_sites.iter().map(|&s| (s, params.defects_charge)).collect()
        } else {
            Vec::new()
        };

        let potential = Potential::build(&mut grid, &params, &mut rng)?;

        let mut next_carrier_id = 0u32;
        let mut carriers = Vec::new();
        let electrons_to_seed =
            (params.max_electrons() as f64 * params.seed_charges).round() as u32;
        carriers.extend(place_random_carriers(
            &mut grid,
            &mut rng,
            electrons_to_seed,
            Species::Electron,
            &mut next_carrier_id,
        )?);
        let holes_to_seed = (params.max_holes() as f64 * params.seed_charges).round() as u32;
        carriers.extend(place_random_carriers(
            &mut grid,
            &mut rng,
            holes_to_seed,
            Species::Hole,
            &mut next_carrier_id,
        )?);

        let sources = build_sources(&params, &mut grid);
        let drains: Vec<Mutex<FluxAgent>> =
            build_drains(&params, &mut grid).into_iter().map(Mutex::new).collect();
        let (exciton_source, recombination) = build_flux_extras(&params, &mut grid);

        Ok(World {
            params,
            grid,
            tables,
            potential,
            rng,
            carriers,
            next_carrier_id,
            defect_sites,
            charged_defects,
            sources,
            drains,
            exciton_source,
            recombination,
            current_step: 0,
        })
    }

    /// Reconstruct a world directly from checkpointed parts, bypassing
    /// randomized placement entirely. Used by `checkpoint::load_checkpoint`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        params: Parameters,
        grid: Grid,
        rng: DeterministicRng,
        carriers: Vec<Carrier>,
        next_carrier_id: u32,
        defect_sites: Vec<Site>,
        traps: Vec<(Site, f64)>,
        sources: Vec<FluxAgent>,
        drains: Vec<FluxAgent>,
        exciton_source: Option<FluxAgent>,
        recombination: Option<FluxAgent>,
        current_step: u64,
    ) -> Result<Self, EngineError> {
        params.validate()?;
        let gaussian_sigma =
            if params.coulomb_gaussian_sigma > 0.0 { Some(params.coulomb_gaussian_sigma) } else { None };
        let tables = PrecomputedTables::build(
            params.electrostatic_cutoff,
            params.dielectric_constant,
            params.grid_factor,
            params.temperature_kelvin,
            gaussian_sigma,
            params.hopping_range,
        );
        let charged_defects = if params.defects_charge != 0 {
            defect_sites.iter().map(|&s| (s, params.defects_charge)).collect()
        } else {
            Vec::new()
        };
        let mut grid = grid;
        let potential = Potential::restore(&mut grid, &params, traps);
        Ok(World {
            params,
            grid,
            tables,
            potential,
            rng,
            carriers,
            next_carrier_id,
            defect_sites,
            charged_defects,
            sources,
            drains: drains.into_iter().map(Mutex::new).collect(),
            exciton_source,
            recombination,
            current_step,
        })
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    pub fn tables(&self) -> &PrecomputedTables {
        &self.tables
    }

    pub fn potential(&self) -> &Potential {
        &self.potential
    }

    pub fn rng(&self) -> &DeterministicRng {
        &self.rng
    }

    pub fn rng_mut(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn carriers(&self) -> &[Carrier] {
        &self.carriers
    }

    pub fn carriers_mut(&mut self) -> &mut Vec<Carrier> {
        &mut self.carriers
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// The id the next carrier created by placement, injection, or exciton
    /// generation will receive. Persisted in `[RandomState]` so a resumed
    /// run never reissues an id still live in `[Electrons]`/`[Holes]`.
    pub fn next_carrier_id(&self) -> u32 {
        self.next_carrier_id
    }

    pub(crate) fn advance_step(&mut self) {
        self.current_step += 1;
    }

    pub fn defect_sites(&self) -> &[Site] {
        &self.defect_sites
    }

    pub fn charged_defect_sites(&self) -> &[(Site, i32)] {
        &self.charged_defects
    }

    pub fn sources(&self) -> &[FluxAgent] {
        &self.sources
    }

    pub fn drains(&self) -> &[Mutex<FluxAgent>] {
        &self.drains
    }

    /// Snapshot the drains as plain `FluxAgent` values (for checkpointing).
    pub fn drains_snapshot(&self) -> Vec<FluxAgent> {
        self.drains.iter().map(|m| m.lock().expect("drain mutex poisoned").clone()).collect()
    }

    pub fn exciton_source(&self) -> Option<&FluxAgent> {
        self.exciton_source.as_ref()
    }

    pub fn recombination(&self) -> Option<&FluxAgent> {
        self.recombination.as_ref()
    }

    pub fn electron_count(&self) -> u32 {
        self.carriers.iter().filter(|c| !c.removed && c.species == Species::Electron).count() as u32
    }

    pub fn hole_count(&self) -> u32 {
        self.carriers.iter().filter(|c| !c.removed && c.species == Species::Hole).count() as u32
    }

    /// `(site, charge)` for every live carrier of `species`, rebuilt fresh
    /// each tick for the CPU Coulomb path and the GPU staging arrays.
    /// spec.md §4.6: "host staging arrays are rebuilt each tick in a fixed
    /// order (electrons, holes, charged defects)".
    pub fn charge_snapshot(&self, species: Species) -> Vec<(Site, i32)> {
        self.carriers
            .iter()
            .filter(|c| !c.removed && c.species == species)
            .map(|c| (c.site, c.species.charge()))
            .collect()
    }

    /// Stage `gpu_index` on every live carrier in the fixed electrons →
    /// holes → charged-defects order spec.md §4.6 requires (defects aren't
    /// carriers, so they have no index to assign, only electrons and holes
    /// get one). Returns the packed `current`/`future` site arrays used to
    /// call the GPU backend.
    pub fn refresh_gpu_index(&mut self) -> (Vec<Site>, Vec<Site>) {
        let mut current = Vec::with_capacity(self.carriers.len());
        let mut future = Vec::with_capacity(self.carriers.len());
        for species in [Species::Electron, Species::Hole] {
            for carrier in self.carriers.iter_mut().filter(|c| !c.removed && c.species == species) {
                carrier.gpu_index = current.len();
                current.push(carrier.site);
                future.push(carrier.future_site);
            }
        }
        (current, future)
    }

    /// spec.md §4.4: each source agent attempts once per tick, in
    /// registration order: pick a random face-neighbor site, accept iff
    /// empty.
    pub fn source_injection(&mut self) {
        for idx in 0..self.sources.len() {
            let (species, face, rate) = {
                let s = &self.sources[idx];
                (s.kind.species().expect("source kinds always carry a species"), s.face, s.rate)
            };
            self.sources[idx].record_attempt();
            if !self.rng.chance(rate) {
                continue;
            }
            let candidates = self.grid.neighbors_face(face);
            if candidates.is_empty() {
                continue;
            }
            let site = candidates[self.rng.next_index(candidates.len())];
            if !self.grid.agent_at(site).is_empty() {
                continue;
            }
            let id = CarrierId(self.next_carrier_id);
            self.next_carrier_id += 1;
            let agent = match species {
                Species::Electron => Agent::Electron(id),
                Species::Hole => Agent::Hole(id),
            };
            self.grid.register(site, agent).expect("site checked empty above");
            self.carriers.push(Carrier::new(id, species, site));
            self.sources[idx].record_success();
        }
    }

    /// spec.md §4.4 `ExcitonSource`: pick any bulk site, accept iff empty;
    /// on accept, register an electron there and a hole on a uniform-random
    /// neighbor. Resolves spec.md §9's Open Question as option (a): both
    /// sites are checked empty before either agent is registered, so there
    /// is no transient invalid state to roll back from.
    pub fn exciton_injection(&mut self) {
        let Some(exciton) = self.exciton_source.as_mut() else { return };
        let rate = exciton.rate;
        exciton.record_attempt();
        if !self.rng.chance(rate) {
            return;
        }
        let volume = self.grid.volume();
        let site = self.rng.next_index(volume as usize) as Site;
        if !self.grid.agent_at(site).is_empty() {
            return;
        }
        let neighbors = self.grid.neighbors(site, 1);
        let empty_neighbors: Vec<Site> =
            neighbors.into_iter().filter(|&n| self.grid.agent_at(n).is_empty()).collect();
        if empty_neighbors.is_empty() {
            return;
        }
        let hole_site = empty_neighbors[self.rng.next_index(empty_neighbors.len())];

        let electron_id = CarrierId(self.next_carrier_id);
        self.next_carrier_id += 1;
        let hole_id = CarrierId(self.next_carrier_id);
        self.next_carrier_id += 1;

        self.grid.register(site, Agent::Electron(electron_id)).expect("checked empty above");
        self.grid.register(hole_site, Agent::Hole(hole_id)).expect("checked empty above");
        self.carriers.push(Carrier::new(electron_id, Species::Electron, site));
        self.carriers.push(Carrier::new(hole_id, Species::Hole, hole_site));
        self.exciton_source.as_mut().unwrap().record_success();
    }

    /// spec.md §4.4 `Recombination` / §2 data flow: pair electrons and holes
    /// whose `decide_future` picked the *same* proposed site (a collision
    /// the commit phase would otherwise resolve as a first-writer-wins
    /// occupancy race), and remove both, per rate, before commit runs. Pairs
    /// are resolved in site order (spec.md §5 ordering guarantees).
    pub fn recombination_sweep(&mut self) {
        let Some(rate) = self.recombination.as_ref().map(|r| r.rate) else { return };

        let mut by_site: HashMap<Site, (Option<usize>, Option<usize>)> = HashMap::new();
        for (idx, carrier) in self.carriers.iter().enumerate() {
            if carrier.removed || carrier.outcome() != FutureOutcome::Move {
                continue;
            }
            let entry = by_site.entry(carrier.future_site).or_insert((None, None));
            match carrier.species {
                Species::Electron => entry.0 = Some(idx),
                Species::Hole => entry.1 = Some(idx),
            }
        }

        let mut sites: Vec<Site> = by_site.keys().copied().collect();
        sites.sort_unstable();

        for site in sites {
            let (electron_idx, hole_idx) = by_site.get(&site).copied().unwrap_or((None, None));
            let (Some(electron_idx), Some(hole_idx)) = (electron_idx, hole_idx) else { continue };

            self.recombination.as_mut().unwrap().record_attempt();
            if !self.rng.chance(rate) {
                continue;
            }
            self.recombination.as_mut().unwrap().record_success();

            let (lo, hi) = if electron_idx < hole_idx { (electron_idx, hole_idx) } else { (hole_idx, electron_idx) };
            let (left, right) = self.carriers.split_at_mut(hi);
            left[lo].remove_via_recombination(&mut self.grid);
            right[0].remove_via_recombination(&mut self.grid);
        }
    }

    /// spec.md §4.7 pipeline stage 2: every carrier proposes a future site
    /// in parallel, each draw taken from an independent per-carrier-per-tick
    /// RNG substream (spec.md §5) so the result is the same regardless of
    /// how rayon schedules the work across threads.
    pub fn choose_future_phase(&mut self) {
        let tick = self.current_step;
        let hopping_range = self.params.hopping_range;
        let grid = &self.grid;
        let base_rng = &self.rng;
        self.carriers.par_iter_mut().for_each(|carrier| {
            let mut sub = base_rng.fork(substream_ordinal(tick, carrier.id.0, 0));
            carrier.choose_future(grid, hopping_range, &mut sub);
        });
    }

    /// spec.md §4.7 pipeline stages 3–4: optionally batch the Coulomb sums
    /// for every carrier's current/future site through `backend` (kernel 2
    /// of spec.md §4.6), then run every carrier's `decide_future` in
    /// parallel. `backend` is `None` to force the CPU path even when
    /// `coulomb.carriers` is set, used by tests and by the CLI when `--gpu`
    /// is absent.
    pub fn decide_future_phase(&mut self, backend: Option<&dyn CoulombBackend>) -> Result<(), GpuError> {
        let tick = self.current_step;
        let coulomb_enabled = self.params.coulomb_carriers;
        let gaussian_enabled = self.params.coulomb_gaussian_sigma > 0.0;
        let exciton_binding = self.params.exciton_binding;

        let electrons = self.charge_snapshot(Species::Electron);
        let holes = self.charge_snapshot(Species::Hole);
        let defects = self.charged_defects.clone();

        let gpu_sums: Option<Vec<f64>> = if coulomb_enabled {
            if let Some(backend) = backend {
                let (current, future) = self.refresh_gpu_index();
                let mut sources = Vec::with_capacity(electrons.len() + holes.len() + defects.len());
                sources.extend(electrons.iter().copied());
                sources.extend(holes.iter().copied());
                sources.extend(defects.iter().copied());
                Some(backend.coulomb_batch(
                    &self.grid,
                    &self.tables,
                    &current,
                    &future,
                    &sources,
                    gaussian_enabled,
                )?)
            } else {
                None
            }
        } else {
            None
        };

        let drain_lookup: Vec<(Site, usize)> = self
            .drains
            .iter()
            .enumerate()
            .filter_map(|(idx, d)| d.lock().expect("drain mutex poisoned").site.map(|site| (site, idx)))
            .collect();

        let grid = &self.grid;
        let tables = &self.tables;
        let potential = &self.potential;
        let base_rng = &self.rng;
        let drains = &self.drains;
        let carrier_count = self.carriers.len();

        self.carriers.par_iter_mut().for_each(|carrier| {
            let gpu_coulomb = gpu_sums
                .as_ref()
                .map(|sums| (sums[carrier.gpu_index], sums[carrier_count + carrier.gpu_index]));
            let ctx = DecideContext {
                grid,
                tables,
                potential,
                electrons: &electrons,
                holes: &holes,
                defects: &defects,
                coulomb_enabled,
                gaussian_enabled,
                exciton_binding,
                gpu_coulomb,
            };
            let mut drain_guard = drain_lookup
                .iter()
                .find(|&&(site, _)| site == carrier.future_site)
                .map(|&(_, idx)| drains[idx].lock().expect("drain mutex poisoned"));
            let mut sub = base_rng.fork(substream_ordinal(tick, carrier.id.0, 1));
            carrier.decide_future(&ctx, drain_guard.as_deref_mut(), &mut sub);
        });

        Ok(())
    }

    /// spec.md §4.3 step 3 / §4.7: apply every carrier's decided outcome to
    /// the grid in carrier-index order, then drop removed carriers.
    pub fn commit_all(&mut self) {
        for carrier in self.carriers.iter_mut() {
            carrier.commit(&mut self.grid);
        }
        self.carriers.retain(|c| !c.removed);
    }

    /// spec.md §3 invariants: every non-empty site's occupant matches the
    /// carrier that claims to live there, and no two carriers collide.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let mut seen = vec![false; self.grid.len() as usize];
        for carrier in &self.carriers {
            if carrier.removed {
                continue;
            }
            let expected = match carrier.species {
                Species::Electron => Agent::Electron(carrier.id),
                Species::Hole => Agent::Hole(carrier.id),
            };
            if self.grid.agent_at(carrier.site) != expected {
                return Err(StateError::DanglingCarrier { id: carrier.id, site: carrier.site });
            }
            let slot = carrier.site as usize;
            if seen[slot] {
                return Err(StateError::DanglingCarrier { id: carrier.id, site: carrier.site });
            }
            seen[slot] = true;
        }
        Ok(())
    }
}

fn place_random_carriers(
    grid: &mut Grid,
    rng: &mut DeterministicRng,
    count: u32,
    species: Species,
    next_id: &mut u32,
) -> Result<Vec<Carrier>, PlacementError> {
    let volume = grid.volume();
    if volume == 0 {
        return Ok(Vec::new());
    }
    let free = (0..volume).filter(|&s| grid.agent_at(s).is_empty()).count();
    if free < count as usize {
        return Err(PlacementError::InsufficientSites {
            kind: species_label(species),
            requested: count as usize,
            available: free,
        });
    }
    let budget = retry_budget(volume);
    let mut carriers = Vec::with_capacity(count as usize);
    let mut attempts = 0usize;
    while carriers.len() < count as usize {
        if attempts >= budget {
            return Err(PlacementError::RetryBudgetExceeded { kind: species_label(species), limit: budget });
        }
        attempts += 1;
        let site = rng.next_index(volume as usize) as Site;
        if !grid.agent_at(site).is_empty() {
            continue;
        }
        let id = CarrierId(*next_id);
        *next_id += 1;
        let agent = match species {
            Species::Electron => Agent::Electron(id),
            Species::Hole => Agent::Hole(id),
        };
        grid.register(site, agent).expect("site checked empty above");
        carriers.push(Carrier::new(id, species, site));
    }
    Ok(carriers)
}

fn place_random_defects(
    grid: &mut Grid,
    rng: &mut DeterministicRng,
    count: u32,
) -> Result<Vec<Site>, PlacementError> {
    let volume = grid.volume();
    if volume == 0 || count == 0 {
        return Ok(Vec::new());
    }
    let free = (0..volume).filter(|&s| grid.agent_at(s).is_empty()).count();
    if free < count as usize {
        return Err(PlacementError::InsufficientSites { kind: "defect", requested: count as usize, available: free });
    }
    let budget = retry_budget(volume);
    let mut sites = Vec::with_capacity(count as usize);
    let mut attempts = 0usize;
    while sites.len() < count as usize {
        if attempts >= budget {
            return Err(PlacementError::RetryBudgetExceeded { kind: "defect", limit: budget });
        }
        attempts += 1;
        let site = rng.next_index(volume as usize) as Site;
        if !grid.agent_at(site).is_empty() {
            continue;
        }
        grid.register_defect(site).expect("site checked empty above");
        sites.push(site);
    }
    Ok(sites)
}

/// spec.md §6 rate groups, defaults per `original_source/world.cpp`
/// `createSources`: transistor biases the left electron source at
/// `source.rate`; every other source/face combination defaults to zero
/// unless an explicit `e.source.*`/`h.source.*` override is present.
pub(crate) fn build_sources(params: &Parameters, grid: &mut Grid) -> Vec<FluxAgent> {
    let e_l = rate_or(params.e_source_l_rate, match params.simulation_kind {
        SimulationKind::Transistor => params.source_rate,
        SimulationKind::SolarCell => 0.0,
    });
    let e_r = rate_or(params.e_source_r_rate, 0.0);
    let h_l = rate_or(params.h_source_l_rate, 0.0);
    let h_r = rate_or(params.h_source_r_rate, 0.0);

    let mut agents = vec![
        FluxAgent::new(0, FluxKind::ElectronSource, Face::XMinus, e_l),
        FluxAgent::new(1, FluxKind::ElectronSource, Face::XPlus, e_r),
        FluxAgent::new(2, FluxKind::HoleSource, Face::XMinus, h_l),
        FluxAgent::new(3, FluxKind::HoleSource, Face::XPlus, h_r),
    ];
    for agent in &mut agents {
        let species = agent.kind.species().expect("source kinds always carry a species");
        agent.site =
            Some(grid.register_special(Agent::Source { face: agent.face, species, id: agent.id }, agent.face));
    }
    agents
}

/// spec.md §6 rate groups, defaults per `original_source/world.cpp`
/// `createDrains`: transistor biases only the right electron drain at
/// `drain.rate`; solar cell biases all four at `drain.rate` (both carrier
/// species are swept out at both contacts).
pub(crate) fn build_drains(params: &Parameters, grid: &mut Grid) -> Vec<FluxAgent> {
    let (e_l_default, e_r_default, h_l_default, h_r_default) = match params.simulation_kind {
        SimulationKind::Transistor => (0.0, params.drain_rate, 0.0, 0.0),
        SimulationKind::SolarCell => {
            (params.drain_rate, params.drain_rate, params.drain_rate, params.drain_rate)
        }
    };
    let e_l = rate_or(params.e_drain_l_rate, e_l_default);
    let e_r = rate_or(params.e_drain_r_rate, e_r_default);
    let h_l = rate_or(params.h_drain_l_rate, h_l_default);
    let h_r = rate_or(params.h_drain_r_rate, h_r_default);

    let mut agents = vec![
        FluxAgent::new(0, FluxKind::ElectronDrain, Face::XMinus, e_l),
        FluxAgent::new(1, FluxKind::ElectronDrain, Face::XPlus, e_r),
        FluxAgent::new(2, FluxKind::HoleDrain, Face::XMinus, h_l),
        FluxAgent::new(3, FluxKind::HoleDrain, Face::XPlus, h_r),
    ];
    for agent in &mut agents {
        let species = agent.kind.species().expect("drain kinds always carry a species");
        agent.site =
            Some(grid.register_special(Agent::Drain { face: agent.face, species, id: agent.id }, agent.face));
    }
    agents
}

/// Register the exciton-source and recombination special agents a solar
/// cell carries (spec.md §3: "created once during world initialization");
/// a transistor has neither. Factored out of `new` so `checkpoint::load`
/// can rebuild the same pair of special-agent sites before overwriting
/// their counters from `[FluxInfo]`.
pub(crate) fn build_flux_extras(
    params: &Parameters,
    grid: &mut Grid,
) -> (Option<FluxAgent>, Option<FluxAgent>) {
    if params.simulation_kind != SimulationKind::SolarCell {
        return (None, None);
    }
    let mut exciton = FluxAgent::new(0, FluxKind::ExcitonSource, Face::XMinus, params.generation_rate);
    exciton.site = Some(grid.register_special(Agent::ExcitonSource { id: 0 }, Face::XMinus));
    let mut recomb = FluxAgent::new(0, FluxKind::Recombination, Face::XMinus, params.recombination_rate);
    recomb.site = Some(grid.register_special(Agent::Recombination { id: 0 }, Face::XMinus));
    (Some(exciton), Some(recomb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transistor_body(grid_x: u32) -> String {
        format!(
            "\
grid.x = {grid_x}\ngrid.y = 1\ngrid.z = 1\n\
simulation.type = transistor\n\
iterations.real = 10\niterations.print = 10\nrandom.seed = 7\n\
electron.percentage = 0.0\nhole.percentage = 0.0\n\
defect.percentage = 0.0\ntrap.percentage = 0.0\nseed.percentage = 1.0\nseed.charges = 0\n\
voltage.left = 0\nvoltage.right = 0\nslope.z = 0\ntrap.potential = 0\n\
gaussian.stdev = 0\ngaussian.average = 0\n\
temperature.kelvin = 300\ndielectric.constant = 3.5\ngrid.factor = 1e-9\

source.rate = 1\ndrain.rate = 1\nrecombination.rate = 1\ngeneration.rate = 0\n\
e.source.l.rate = 1\n\
coulomb.carriers = false\ndefects.charge = 0\nelectrostatic.cutoff = 3\n\
coulomb.gaussian.sigma = 0\nexciton.binding = 0\nhopping.range = 1\n\
use.opencl = false\nwork.x = 0\nwork.y = 0\nwork.z = 0\nwork.size = 0\n\
"
        )
    }

    fn solarcell_body() -> String {
        "\
grid.x = 5\ngrid.y = 5\ngrid.z = 1\n\
simulation.type = solarcell\n\
iterations.real = 10\niterations.print = 10\nrandom.seed = 11\n\
electron.percentage = 0.0\nhole.percentage = 0.0\n\
defect.percentage = 0.0\ntrap.percentage = 0.0\nseed.percentage = 1.0\nseed.charges = 0\n\
voltage.left = 0\nvoltage.right = 0\nslope.z = 0\ntrap.potential = 0\n\
gaussian.stdev = 0\ngaussian.average = 0\n\
temperature.kelvin = 300\ndielectric.constant = 3.5\ngrid.factor = 1e-9\

source.rate = 0\ndrain.rate = 1\nrecombination.rate = 1\ngeneration.rate = 1\n\
coulomb.carriers = false\ndefects.charge = 0\nelectrostatic.cutoff = 3\n\
coulomb.gaussian.sigma = 0\nexciton.binding = 0\nhopping.range = 1\n\
use.opencl = false\nwork.x = 0\nwork.y = 0\nwork.z = 0\nwork.size = 0\n\
"
        .to_string()
    }

    #[test]
    fn new_world_has_no_carriers_when_percentages_are_zero() {
        let params = Parameters::parse(&transistor_body(4)).unwrap();
        let world = World::new(params).unwrap();
        assert_eq!(world.electron_count(), 0);
        assert_eq!(world.hole_count(), 0);
        assert!(world.check_invariants().is_ok());
    }

    #[test]
    fn transistor_world_has_four_sources_and_drains() {
        let params = Parameters::parse(&transistor_body(4)).unwrap();
        let world = World::new(params).unwrap();
        assert_eq!(world.sources().len(), 4);
        assert_eq!(world.drains().len(), 4);
        assert!(world.exciton_source().is_none());
        assert!(world.recombination().is_none());
    }

    #[test]
    fn solarcell_world_has_exciton_and_recombination_agents() {
        let params = Parameters::parse(&solarcell_body()).unwrap();
        let world = World::new(params).unwrap();
        assert!(world.exciton_source().is_some());
        assert!(world.recombination().is_some());
    }

    #[test]
    fn source_injection_on_saturated_grid_counts_attempt_not_success() {
        // S3: grid=2x2x1, all four bulk sites occupied, e.source.l.rate=1.
        let params = Parameters::parse(&transistor_body(2)).unwrap();
        let mut world = World::new(params).unwrap();
        for x in 0..2 {
            for y in 0..2 {
                let site = world.grid().index(x, y, 0);
                let id = CarrierId(world.next_carrier_id);
                world.next_carrier_id += 1;
                world.grid.register(site, Agent::Electron(id)).unwrap();
                world.carriers.push(Carrier::new(id, Species::Electron, site));
            }
        }
        let before_successes = world.sources()[0].successes();
        world.source_injection();
        assert_eq!(world.sources()[0].attempts(), 1);
        assert_eq!(world.sources()[0].successes(), before_successes);
    }

    #[test]
    fn exciton_injection_creates_adjacent_pair_or_nothing() {
        let params = Parameters::parse(&solarcell_body()).unwrap();
        let mut world = World::new(params).unwrap();
        world.exciton_injection();
        match world.carriers().len() {
            0 => {}
            2 => {
                let e = world.carriers().iter().find(|c| c.species == Species::Electron).unwrap();
                let h = world.carriers().iter().find(|c| c.species == Species::Hole).unwrap();
                assert!(world.grid().neighbors(e.site, 1).contains(&h.site));
            }
            other => panic!("unexpected carrier count {other}"),
        }
        assert!(world.check_invariants().is_ok());
    }

    #[test]
    fn drains_persist_after_absorbing_a_carrier() {
        let params = Parameters::parse(&transistor_body(4)).unwrap();
        let mut world = World::new(params).unwrap();
        let site = world.grid().index(3, 0, 0);
        let drain_site = world
            .grid()
            .neighbors(site, 1)
            .into_iter()
            .find(|&s| matches!(world.grid().agent_at(s), Agent::Drain { .. }))
            .unwrap();

        let id = CarrierId(0);
        world.grid_mut().register(site, Agent::Electron(id)).unwrap();
        let mut carrier = Carrier::new(id, Species::Electron, site);
        carrier.future_site = drain_site;
        {
            let mut drain_guard = world.drains()[1].lock().unwrap();
            let ctx = crate::carriers::DecideContext {
                grid: world.grid(),
                tables: world.tables(),
                potential: world.potential(),
                electrons: &[],
                holes: &[],
                defects: &[],
                coulomb_enabled: false,
                gaussian_enabled: false,
                exciton_binding: 0.0,
                gpu_coulomb: None,
            };
            carrier.decide_future(&ctx, Some(&mut *drain_guard), &mut DeterministicRng::from_seed(1));
        }
        assert_eq!(carrier.outcome(), FutureOutcome::Drained);
        world.carriers_mut().push(carrier);
        world.commit_all();
        assert!(matches!(world.grid().agent_at(drain_site), Agent::Drain { .. }));
    }
}

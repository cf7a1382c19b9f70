//! Full-state checkpoint load/save. See spec.md §4.8 and §6's section-stream
//! file format.
//!
//! The file is a sequence of `[SectionName]` headers followed by a body, in
//! the fixed order `Parameters, Electrons, Holes, Defects, Traps,
//! TrapPotentials, FluxInfo, RandomState`. Two details are not spelled out
//! by spec.md's literal grammar and are resolved here, recorded in
//! DESIGN.md:
//!
//! - `[Electrons]`/`[Holes]` list `id site` pairs, one per line, rather than
//!   a bare site: carrier ids must survive a checkpoint round-trip exactly,
//!   because `World::choose_future_phase`/`decide_future_phase` derive each
//!   carrier's per-tick RNG substream from its id (spec.md §5 "split the
//!   master generator into deterministic sub-streams"). Renumbering ids on
//!   load would feed every surviving carrier a different substream than an
//!   uninterrupted run would have, breaking spec.md §8's checkpoint-identity
//!   property (S5).
//! - `[RandomState]` carries the literal seed (for human inspection) and the
//!   next-carrier-id counter on a second line, in addition to the spec's
//!   `seed word0 ... word_{k-1}` line. The word list is the bincode encoding
//!   of the full `DeterministicRng` (seed plus live generator position), not
//!   just the seed, since reseeding from the bare seed would restart the
//!   stream rather than resume it. A third line carries the tick counter
//!   (`current_step`), without it resuming a checkpoint would always
//!   restart at tick 0 and every subsequent substream ordinal
//!   (`substream_ordinal(tick, ...)`) would diverge from the uninterrupted
//!   run, breaking the same determinism property the carrier-id line
//!   protects. Missing for files written before this line existed; such
//!   files fall back to `current_step = 0`.

use std::fs;
use std::path::Path;

use crate::carriers::flux::FluxAgent;
use crate::carriers::{Carrier, CarrierId, Species};
use crate::error::CheckpointError;
use crate::grid::{Agent, Grid, Site};
use crate::params::Parameters;
use crate::rng::DeterministicRng;
use crate::world::{self, World};

const SECTION_ORDER: [&str; 8] = [
    "Parameters",
    "Electrons",
    "Holes",
    "Defects",
    "Traps",
    "TrapPotentials",
    "FluxInfo",
    "RandomState",
];

/// Write every piece of `world`'s state to `path` in the section order
/// spec.md §6 defines. spec.md §4.8 "save: write the inverse [of load] in
/// the same section order".
pub fn save_checkpoint(world: &World, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let mut out = String::new();

    out.push_str("[Parameters]\n");
    out.push_str(&world.params().to_body());
    out.push('\n');

    write_carrier_section(&mut out, "Electrons", world, Species::Electron);
    write_carrier_section(&mut out, "Holes", world, Species::Hole);

    out.push_str("[Defects]\n");
    out.push_str(&format!("{}\n", world.defect_sites().len()));
    for &site in world.defect_sites() {
        out.push_str(&format!("{site}\n"));
    }
    out.push('\n');

    out.push_str("[Traps]\n");
    out.push_str(&format!("{}\n", world.potential().traps().len()));
    for &(site, _) in world.potential().traps() {
        out.push_str(&format!("{site}\n"));
    }
    out.push('\n');

    out.push_str("[TrapPotentials]\n");
    out.push_str(&format!("{}\n", world.potential().traps().len()));
    for &(_, value) in world.potential().traps() {
        out.push_str(&format!("{value}\n"));
    }
    out.push('\n');

    let flux_pairs = flux_pairs_in_order(world);
    out.push_str("[FluxInfo]\n");
    out.push_str(&format!("{}\n", flux_pairs.len()));
    let flat: Vec<String> =
        flux_pairs.iter().flat_map(|&(a, s)| [a.to_string(), s.to_string()]).collect();
    out.push_str(&flat.join(" "));
    out.push('\n');
    out.push('\n');

    out.push_str("[RandomState]\n");
    let rng_bytes = bincode::serialize(world.rng())
        .map_err(|_| CheckpointError::MalformedEntry { section: "RandomState", line: String::new() })?;
    let words: Vec<String> = rng_bytes.iter().map(|b| b.to_string()).collect();
    out.push_str(&format!("{} {}\n", world.rng().seed(), words.join(" ")));
    out.push_str(&format!("{}\n", world.next_carrier_id()));
    out.push_str(&format!("{}\n", world.current_step()));

    fs::write(path, out)?;
    Ok(())
}

/// Reconstruct a `World` from a checkpoint file written by `save_checkpoint`.
/// spec.md §4.8 "load: read the parameters section; reseed the RNG from the
/// persisted state (not the configured seed); recreate grid; place
/// defects/traps/electrons/holes from the stored site lists; restore trap
/// potentials; restore source/drain attempt/success counters".
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<World, CheckpointError> {
    let text = fs::read_to_string(path)?;
    let sections = split_sections(&text)?;

    let params = Parameters::parse(section_body(&sections, "Parameters")?)?;

    let mut grid = Grid::new(params.grid_x, params.grid_y, params.grid_z);

    let defect_sites = parse_site_list(&sections, "Defects")?;
    for &site in &defect_sites {
        grid.register_defect(site)
            .map_err(|_| CheckpointError::MalformedEntry { section: "Defects", line: site.to_string() })?;
    }

    let trap_sites = parse_site_list(&sections, "Traps")?;
    let trap_values = parse_f64_list(&sections, "TrapPotentials")?;
    if trap_sites.len() != trap_values.len() {
        return Err(CheckpointError::TruncatedSection("TrapPotentials"));
    }
    let traps: Vec<(Site, f64)> = itertools::izip!(trap_sites, trap_values).collect();

    let electrons = parse_id_site_list(&sections, "Electrons")?;
    let holes = parse_id_site_list(&sections, "Holes")?;

    let mut carriers = Vec::with_capacity(electrons.len() + holes.len());
    for &(id, site) in &electrons {
        grid.register(site, Agent::Electron(id))
            .map_err(|_| CheckpointError::MalformedEntry { section: "Electrons", line: site.to_string() })?;
        carriers.push(Carrier::new(id, Species::Electron, site));
    }
    for &(id, site) in &holes {
        grid.register(site, Agent::Hole(id))
            .map_err(|_| CheckpointError::MalformedEntry { section: "Holes", line: site.to_string() })?;
        carriers.push(Carrier::new(id, Species::Hole, site));
    }

    let sources = world::build_sources(&params, &mut grid);
    let drains = world::build_drains(&params, &mut grid);
    let (exciton_source, recombination) = world::build_flux_extras(&params, &mut grid);

    let flux_pairs = parse_flux_info(&sections)?;
    let expected_flux_len =
        sources.len() + drains.len() + exciton_source.is_some() as usize + recombination.is_some() as usize;
    if flux_pairs.len() != expected_flux_len {
        return Err(CheckpointError::TruncatedSection("FluxInfo"));
    }
    let mut sources = sources;
    let mut drains = drains;
    let mut exciton_source = exciton_source;
    let mut recombination = recombination;
    let mut pairs = flux_pairs.into_iter();
    for agent in sources.iter_mut() {
        apply_counters(agent, pairs.next().expect("length checked above"));
    }
    for agent in drains.iter_mut() {
        apply_counters(agent, pairs.next().expect("length checked above"));
    }
    if let Some(agent) = exciton_source.as_mut() {
        apply_counters(agent, pairs.next().expect("length checked above"));
    }
    if let Some(agent) = recombination.as_mut() {
        apply_counters(agent, pairs.next().expect("length checked above"));
    }

    let (rng, next_carrier_id, current_step) = parse_random_state(&sections, &electrons, &holes)?;

    World::restore(
        params,
        grid,
        rng,
        carriers,
        next_carrier_id,
        defect_sites,
        traps,
        sources,
        drains,
        exciton_source,
        recombination,
        current_step,
    )
    .map_err(|err| match err {
        crate::error::EngineError::Config(e) => CheckpointError::Config(e),
        crate::error::EngineError::State(e) => CheckpointError::State(e),
        crate::error::EngineError::Placement(e) => CheckpointError::Placement(e),
        crate::error::EngineError::Checkpoint(e) => e,
        crate::error::EngineError::Gpu(_) => {
            CheckpointError::MalformedEntry { section: "Parameters", line: String::new() }
        }
    })
}

fn apply_counters(agent: &mut FluxAgent, (attempts, successes): (u64, u64)) {
    for _ in 0..attempts {
        agent.record_attempt();
    }
    for _ in 0..successes {
        agent.record_success();
    }
}

fn write_carrier_section(out: &mut String, name: &str, world: &World, species: Species) {
    let rows: Vec<(CarrierId, Site)> = world
        .carriers()
        .iter()
        .filter(|c| !c.removed && c.species == species)
        .map(|c| (c.id, c.site))
        .collect();
    out.push_str(&format!("[{name}]\n"));
    out.push_str(&format!("{}\n", rows.len()));
    for (id, site) in rows {
        out.push_str(&format!("{} {}\n", id.0, site));
    }
    out.push('\n');
}

/// `(attempts, successes)` for every flux agent in the fixed save/load
/// order: sources (registration order), drains (registration order),
/// exciton source, recombination.
fn flux_pairs_in_order(world: &World) -> Vec<(u64, u64)> {
    let mut pairs: Vec<(u64, u64)> =
        world.sources().iter().map(|a| (a.attempts(), a.successes())).collect();
    pairs.extend(world.drains_snapshot().iter().map(|a| (a.attempts(), a.successes())));
    if let Some(agent) = world.exciton_source() {
        pairs.push((agent.attempts(), agent.successes()));
    }
    if let Some(agent) = world.recombination() {
        pairs.push((agent.attempts(), agent.successes()));
    }
    pairs
}

/// Raw `[SectionName] -> body lines` split, preserving section order but
/// tolerant of any order on read (only `save_checkpoint` commits to
/// `SECTION_ORDER`).
fn split_sections(text: &str) -> Result<Vec<(String, Vec<String>)>, CheckpointError> {
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.starts_with('[') && line.ends_with(']') {
            sections.push((line[1..line.len() - 1].to_string(), Vec::new()));
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        match sections.last_mut() {
            Some((_, body)) => body.push(line.to_string()),
            None => continue,
        }
    }
    Ok(sections)
}

fn section_body<'a>(
    sections: &'a [(String, Vec<String>)],
    name: &'static str,
) -> Result<&'a [String], CheckpointError> {
    sections
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, body)| body.as_slice())
        .ok_or(CheckpointError::TruncatedSection(name))
}

fn parse_count_and_rest<'a>(
    body: &'a [String],
    section: &'static str,
) -> Result<(usize, &'a [String]), CheckpointError> {
    let (first, rest) = body.split_first().ok_or(CheckpointError::TruncatedSection(section))?;
    let count: usize = first
        .trim()
        .parse()
        .map_err(|_| CheckpointError::MalformedEntry { section, line: first.clone() })?;
    if rest.len() < count {
        return Err(CheckpointError::TruncatedSection(section));
    }
    Ok((count, &rest[..count]))
}

fn parse_site_list(
    sections: &[(String, Vec<String>)],
    name: &'static str,
) -> Result<Vec<Site>, CheckpointError> {
    let body = section_body(sections, name)?;
    let (_, rows) = parse_count_and_rest(body, name)?;
    rows.iter()
        .map(|line| line.trim().parse().map_err(|_| CheckpointError::MalformedEntry { section: name, line: line.clone() }))
        .collect()
}

fn parse_f64_list(
    sections: &[(String, Vec<String>)],
    name: &'static str,
) -> Result<Vec<f64>, CheckpointError> {
    let body = section_body(sections, name)?;
    let (_, rows) = parse_count_and_rest(body, name)?;
    rows.iter()
        .map(|line| line.trim().parse().map_err(|_| CheckpointError::MalformedEntry { section: name, line: line.clone() }))
        .collect()
}

fn parse_id_site_list(
    sections: &[(String, Vec<String>)],
    name: &'static str,
) -> Result<Vec<(CarrierId, Site)>, CheckpointError> {
    let body = section_body(sections, name)?;
    let (_, rows) = parse_count_and_rest(body, name)?;
    rows.iter()
        .map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| CheckpointError::MalformedEntry { section: name, line: line.clone() })?;
            let site = parts
                .next()
                .and_then(|s| s.parse::<Site>().ok())
                .ok_or_else(|| CheckpointError::MalformedEntry { section: name, line: line.clone() })?;
            Ok((CarrierId(id), site))
        })
        .collect()
}

fn parse_flux_info(sections: &[(String, Vec<String>)]) -> Result<Vec<(u64, u64)>, CheckpointError> {
    let body = section_body(sections, "FluxInfo")?;
    let (count, rest) = body.split_first().ok_or(CheckpointError::TruncatedSection("FluxInfo"))?;
    let count: usize = count
        .trim()
        .parse()
        .map_err(|_| CheckpointError::MalformedEntry { section: "FluxInfo", line: count.clone() })?;
    let flat: Vec<u64> = rest
        .iter()
        .flat_map(|line| line.split_whitespace())
        .map(|tok| {
            tok.parse::<u64>().map_err(|_| CheckpointError::MalformedEntry {
                section: "FluxInfo",
                line: tok.to_string(),
            })
        })
        .collect::<Result<_, _>>()?;
    if flat.len() != count * 2 {
        return Err(CheckpointError::TruncatedSection("FluxInfo"));
    }
    Ok(flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

fn parse_random_state(
    sections: &[(String, Vec<String>)],
    electrons: &[(CarrierId, Site)],
    holes: &[(CarrierId, Site)],
) -> Result<(DeterministicRng, u32, u64), CheckpointError> {
    let body = section_body(sections, "RandomState")?;
    let (state_line, rest) = body.split_first().ok_or(CheckpointError::TruncatedSection("RandomState"))?;
    let mut tokens = state_line.split_whitespace();
    let _seed: u64 = tokens
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CheckpointError::MalformedEntry { section: "RandomState", line: state_line.clone() })?;
    let bytes: Vec<u8> = tokens
        .map(|tok| {
            tok.parse::<u8>().map_err(|_| CheckpointError::MalformedEntry {
                section: "RandomState",
                line: tok.to_string(),
            })
        })
        .collect::<Result<_, _>>()?;
    let rng: DeterministicRng =
        bincode::deserialize(&bytes).map_err(|_| CheckpointError::RngRoundTrip)?;

    let next_carrier_id = match rest.first() {
        Some(line) => line
            .trim()
            .parse()
            .map_err(|_| CheckpointError::MalformedEntry { section: "RandomState", line: line.clone() })?,
        None => {
            let max_id = electrons.iter().chain(holes.iter()).map(|&(id, _)| id.0).max();
            max_id.map(|m| m + 1).unwrap_or(0)
        }
    };

    let current_step = match rest.get(1) {
        Some(line) => line
            .trim()
            .parse()
            .map_err(|_| CheckpointError::MalformedEntry { section: "RandomState", line: line.clone() })?,
        None => 0,
    };

    Ok((rng, next_carrier_id, current_step))
}

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::carriers::{CarrierId, Species};
use crate::error::StateError;

/// A single lattice cell, or a reserved special-agent slot. See spec.md §3.
pub type Site = u32;

/// Which face of the device slab a special agent (source/drain) is bound
/// to. `X`-faces host sources/drains in both device archetypes; `Z`-faces
/// only matter when `grid.z > 1` (the gate slope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    XMinus,
    XPlus,
    YMinus,
    YPlus,
    ZMinus,
    ZPlus,
}

impl Face {
    pub fn all() -> [Face; 6] {
        [Face::XMinus, Face::XPlus, Face::YMinus, Face::YPlus, Face::ZMinus, Face::ZPlus]
    }
}

/// The polymorphic lattice occupant. Charge-carrier variants carry the
/// stable identity assigned when they were registered with the grid; flux
/// agents carry the identity they were registered under in `World`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Agent {
    Empty,
    Defect,
    Electron(CarrierId),
    Hole(CarrierId),
    Source { face: Face, species: Species, id: u32 },
    Drain { face: Face, species: Species, id: u32 },
    ExcitonSource { id: u32 },
    Recombination { id: u32 },
}

impl Agent {
    pub fn is_empty(&self) -> bool {
        matches!(self, Agent::Empty)
    }

    pub fn carrier_id(&self) -> Option<CarrierId> {
        match self {
            Agent::Electron(id) | Agent::Hole(id) => Some(*id),
            _ => None,
        }
    }
}

/// Indexing, neighbor lookup and occupancy for the cubic lattice plus its
/// reserved special-agent block. See spec.md §3 and §4.1.
#[derive(Clone, Serialize, Deserialize)]
pub struct Grid {
    x: u32,
    y: u32,
    z: u32,
    volume: u32,
    occupant: Vec<Agent>,
    potential: Vec<f64>,
    faces: HashMap<Face, Vec<Site>>,
}

impl Grid {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        let volume = x * y * z;
        Grid {
            x,
            y,
            z,
            volume,
            occupant: vec![Agent::Empty; volume as usize],
            potential: vec![0.0; volume as usize],
            faces: HashMap::new(),
        }
    }

    pub fn dims(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    /// Total number of sites, bulk plus the special-agent reserve allocated
    /// so far.
    pub fn len(&self) -> u32 {
        self.occupant.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.volume == 0
    }

    pub fn is_bulk(&self, site: Site) -> bool {
        site < self.volume
    }

    /// `x = s mod X`, `y = (s / X) mod Y`, `z = s / (X·Y)`. Only valid for
    /// bulk sites.
    pub fn coords(&self, site: Site) -> (u32, u32, u32) {
        debug_assert!(self.is_bulk(site), "coords() called on a special-agent site");
        let xy = self.x * self.y;
        let cx = site % self.x;
        let cy = (site / self.x) % self.y;
        let cz = site / xy;
        (cx, cy, cz)
    }

    pub fn index(&self, x: u32, y: u32, z: u32) -> Site {
        z * self.x * self.y + y * self.x + x
    }

    pub fn agent_at(&self, site: Site) -> Agent {
        self.occupant.get(site as usize).copied().unwrap_or(Agent::Empty)
    }

    pub fn potential_at(&self, site: Site) -> f64 {
        self.potential.get(site as usize).copied().unwrap_or(0.0)
    }

    pub fn set_potential(&mut self, site: Site, value: f64) {
        self.potential[site as usize] = value;
    }

    /// Register a charge carrier, a source, a drain, an exciton source, or
    /// a recombination agent at `site`. Fails if the site is already
    /// occupied by anything other than `Empty`.
    pub fn register(&mut self, site: Site, agent: Agent) -> Result<(), StateError> {
        let slot =
            self.occupant.get_mut(site as usize).ok_or(StateError::SiteOutOfBounds(site))?;
        if !slot.is_empty() {
            return Err(StateError::SiteOccupied { site });
        }
        *slot = agent;
        Ok(())
    }

    /// Remove `agent` from `site`, failing if the current occupant does not
    /// match the agent being removed (by `PartialEq`, which compares
    /// variant and identity).
    pub fn unregister(&mut self, site: Site, agent: Agent) -> Result<(), StateError> {
        let slot =
            self.occupant.get_mut(site as usize).ok_or(StateError::SiteOutOfBounds(site))?;
        if *slot != agent {
            return Err(StateError::OccupantMismatch { site });
        }
        *slot = Agent::Empty;
        Ok(())
    }

    pub fn register_defect(&mut self, site: Site) -> Result<(), StateError> {
        self.register(site, Agent::Defect)
    }

    pub fn unregister_defect(&mut self, site: Site) -> Result<(), StateError> {
        self.unregister(site, Agent::Defect)
    }

    /// Allocate a new site in the reserved block for a face-bound special
    /// agent, link it into that face's list, and assign it the neighbor set
    /// of the face (every bulk site on the opposing boundary column/slab).
    pub fn register_special(&mut self, agent: Agent, face: Face) -> Site {
        let site = self.occupant.len() as Site;
        self.occupant.push(agent);
        self.potential.push(0.0);
        self.faces.entry(face).or_default().push(site);
        site
    }

    pub fn unregister_special(&mut self, site: Site, face: Face) -> Result<(), StateError> {
        let slot =
            self.occupant.get_mut(site as usize).ok_or(StateError::SiteOutOfBounds(site))?;
        *slot = Agent::Empty;
        if let Some(list) = self.faces.get_mut(&face) {
            list.retain(|&s| s != site);
        }
        Ok(())
    }

    /// All special-agent sites registered to `face`, in registration order.
    pub fn special_agents_on(&self, face: Face) -> &[Site] {
        self.faces.get(&face).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The full bulk-site list of a face slab (x=0 for `XMinus`, x=X-1 for
    /// `XPlus`, and so on), distinct from `special_agents_on`, which lists
    /// the special agents bound to the face, not the bulk sites it borders.
    pub fn neighbors_face(&self, face: Face) -> Vec<Site> {
        let mut out = Vec::new();
        for z in 0..self.z {
            for y in 0..self.y {
                for x in 0..self.x {
                    let on_face = match face {
                        Face::XMinus => x == 0,
                        Face::XPlus => x == self.x - 1,
                        Face::YMinus => y == 0,
                        Face::YPlus => y == self.y - 1,
                        Face::ZMinus => z == 0,
                        Face::ZPlus => z == self.z - 1,
                    };
                    if on_face {
                        out.push(self.index(x, y, z));
                    }
                }
            }
        }
        out
    }

    /// Ordered, deterministic neighbor list for `site` at the given hopping
    /// range (1 or 2), with drain special-agents appended when `site` sits
    /// on a drain-bearing boundary column.
    ///
    /// Range 2 has a documented special case for `z == 1`: it omits the
    /// z-axis diagonal terms that the general 3D enumeration would include,
    /// since there is no second layer to diagonal into. spec.md §9 flags
    /// this as possibly unintentional in the original; we preserve it as a
    /// distinct, named 2D mode rather than guessing at the author's intent.
    pub fn neighbors(&self, site: Site, range: u8) -> Vec<Site> {
        if !self.is_bulk(site) {
            return Vec::new();
        }
        let (x, y, z) = self.coords(site);
        let mut out = match range {
            1 => self.neighbors_range1(x, y, z),
            2 if self.z == 1 => self.neighbors_range2_planar(x, y, z),
            2 => self.neighbors_range2_general(x, y, z),
            other => panic!("unsupported hopping.range {other}, expected 1 or 2"),
        };

        if x == 0 {
            out.extend(self.special_agents_on(Face::XMinus));
        }
        if x == self.x - 1 {
            out.extend(self.special_agents_on(Face::XPlus));
        }
        out
    }

    fn push_if_valid(&self, out: &mut Vec<Site>, x: i64, y: i64, z: i64) {
        if x >= 0 && y >= 0 && z >= 0 && (x as u32) < self.x && (y as u32) < self.y && (z as u32) < self.z
        {
            out.push(self.index(x as u32, y as u32, z as u32));
        }
    }

    fn neighbors_range1(&self, x: u32, y: u32, z: u32) -> Vec<Site> {
        let (xi, yi, zi) = (x as i64, y as i64, z as i64);
        let mut out = Vec::with_capacity(6);
        self.push_if_valid(&mut out, xi - 1, yi, zi);
        self.push_if_valid(&mut out, xi + 1, yi, zi);
        self.push_if_valid(&mut out, xi, yi - 1, zi);
        self.push_if_valid(&mut out, xi, yi + 1, zi);
        self.push_if_valid(&mut out, xi, yi, zi - 1);
        self.push_if_valid(&mut out, xi, yi, zi + 1);
        out
    }

    /// 2D fast path used when `z == 1`: the 6-connected shell plus the four
    /// diagonal neighbors and the four axial distance-2 neighbors, all
    /// within the single z-layer.
    fn neighbors_range2_planar(&self, x: u32, y: u32, z: u32) -> Vec<Site> {
        let (xi, yi, zi) = (x as i64, y as i64, z as i64);
        let mut out = self.neighbors_range1(x, y, z);
        self.push_if_valid(&mut out, xi - 1, yi - 1, zi);
        self.push_if_valid(&mut out, xi - 1, yi + 1, zi);
        self.push_if_valid(&mut out, xi - 2, yi, zi);
        self.push_if_valid(&mut out, xi + 1, yi - 1, zi);
        self.push_if_valid(&mut out, xi + 1, yi + 1, zi);
        self.push_if_valid(&mut out, xi + 2, yi, zi);
        self.push_if_valid(&mut out, xi, yi - 2, zi);
        self.push_if_valid(&mut out, xi, yi + 2, zi);
        out
    }

    /// General 3D range-2 enumeration: the range-1 shell, the distance-2
    /// axial neighbors, and the face/edge/corner diagonals of the
    /// surrounding 5×5×5 cube within distance 2.
    fn neighbors_range2_general(&self, x: u32, y: u32, z: u32) -> Vec<Site> {
        let (xi, yi, zi) = (x as i64, y as i64, z as i64);
        let mut out = self.neighbors_range1(x, y, z);
        self.push_if_valid(&mut out, xi - 2, yi, zi);
        self.push_if_valid(&mut out, xi + 2, yi, zi);
        self.push_if_valid(&mut out, xi, yi - 2, zi);
        self.push_if_valid(&mut out, xi, yi + 2, zi);
        self.push_if_valid(&mut out, xi, yi, zi - 2);
        self.push_if_valid(&mut out, xi, yi, zi + 2);
        for &dx in &[-1i64, 1] {
            for &dy in &[-1i64, 1] {
                self.push_if_valid(&mut out, xi + dx, yi + dy, zi);
                self.push_if_valid(&mut out, xi + dx, yi, zi + dy);
                self.push_if_valid(&mut out, xi, yi + dx, zi + dy);
            }
        }
        out
    }

    /// Integer axial displacement `(dx, dy, dz)` between two bulk sites.
    pub fn distance_i(&self, a: Site, b: Site) -> (i32, i32, i32) {
        let (ax, ay, az) = self.coords(a);
        let (bx, by, bz) = self.coords(b);
        (ax as i32 - bx as i32, ay as i32 - by as i32, az as i32 - bz as i32)
    }

    /// Image-axial displacement, used for the mirror-image electrode
    /// correction: `|x_a + x_b| + 1` per axis, matching
    /// `Grid::xImageDistancei` in the original implementation.
    pub fn distance_image_i(&self, a: Site, b: Site) -> (i32, i32, i32) {
        let (ax, ay, az) = self.coords(a);
        let (bx, by, bz) = self.coords(b);
        (
            (ax as i32 + bx as i32).abs() + 1,
            (ay as i32 + by as i32).abs() + 1,
            (az as i32 + bz as i32).abs() + 1,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range1_interior_has_six_neighbors() {
        let grid = Grid::new(5, 5, 5);
        let site = grid.index(2, 2, 2);
        assert_eq!(grid.neighbors(site, 1).len(), 6);
    }

    #[test]
    fn range1_corner_has_three_neighbors() {
        let grid = Grid::new(5, 5, 5);
        let site = grid.index(0, 0, 0);
        assert_eq!(grid.neighbors(site, 1).len(), 3);
    }

    #[test]
    fn range1_never_wraps() {
        let grid = Grid::new(3, 3, 1);
        for s in grid.neighbors(grid.index(0, 0, 0), 1) {
            let (x, y, z) = grid.coords(s);
            assert!(x < 3 && y < 3 && z < 1);
        }
    }

    #[test]
    fn range2_planar_and_general_differ_for_z_gt_1() {
        let planar = Grid::new(5, 5, 1);
        let general = Grid::new(5, 5, 5);
        let ps = planar.index(2, 2, 0);
        let gs = general.index(2, 2, 2);
        // The general 3D cube includes z-diagonals the planar mode omits;
        // it must therefore enumerate strictly more neighbors at an
        // interior site away from every boundary.
        assert!(general.neighbors(gs, 2).len() > planar.neighbors(ps, 2).len());
    }

    #[test]
    fn neighbors_no_duplicates() {
        let grid = Grid::new(6, 6, 6);
        for range in [1u8, 2] {
            let n = grid.neighbors(grid.index(3, 3, 3), range);
            let mut sorted = n.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), n.len());
        }
    }

    #[test]
    fn register_rejects_occupied_site() {
        let mut grid = Grid::new(2, 2, 1);
        let site = grid.index(0, 0, 0);
        grid.register(site, Agent::Defect).unwrap();
        assert!(matches!(grid.register(site, Agent::Defect), Err(StateError::SiteOccupied { .. })));
    }

    #[test]
    fn unregister_rejects_mismatched_occupant() {
        let mut grid = Grid::new(2, 2, 1);
        let site = grid.index(0, 0, 0);
        grid.register(site, Agent::Defect).unwrap();
        assert!(matches!(
            grid.unregister(site, Agent::Electron(CarrierId(0))),
            Err(StateError::OccupantMismatch { .. })
        ));
    }

    #[test]
    fn special_agent_reaches_drain_via_neighbors() {
        let mut grid = Grid::new(4, 1, 1);
        let drain_site =
            grid.register_special(Agent::Drain { face: Face::XPlus, species: Species::Electron, id: 0 }, Face::XPlus);
        let boundary = grid.index(3, 0, 0);
        assert!(grid.neighbors(boundary, 1).contains(&drain_site));
    }
}

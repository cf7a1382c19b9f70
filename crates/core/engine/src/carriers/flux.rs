use serde::{Deserialize, Serialize};

use crate::grid::{Face, Site};
use crate::rng::DeterministicRng;
use crate::Species;

/// The six flux-agent roles. See spec.md §3 "Agent" and §4.4. Modeled as a
/// tagged enum rather than a trait hierarchy: `FluxAgent` never needs
/// dynamic dispatch, and a closed, known set of variants is cheaper to
/// match on than to downcast (spec.md §9 "Design Notes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxKind {
    ElectronSource,
    HoleSource,
    ExcitonSource,
    ElectronDrain,
    HoleDrain,
    Recombination,
}

impl FluxKind {
    pub fn species(self) -> Option<Species> {
        match self {
            FluxKind::ElectronSource | FluxKind::ElectronDrain => Some(Species::Electron),
            FluxKind::HoleSource | FluxKind::HoleDrain => Some(Species::Hole),
            FluxKind::ExcitonSource | FluxKind::Recombination => None,
        }
    }

    pub fn is_source(self) -> bool {
        matches!(self, FluxKind::ElectronSource | FluxKind::HoleSource | FluxKind::ExcitonSource)
    }

    pub fn is_drain(self) -> bool {
        matches!(self, FluxKind::ElectronDrain | FluxKind::HoleDrain)
    }
}

/// A source, drain, exciton-source, or recombination agent bound to a grid
/// face. Carries no reference back to `World` or `Grid`, every method here
/// is a pure function of its own fields plus an RNG, so orchestration that
/// needs grid access (placing carriers, removing them) stays in `World`.
/// spec.md §9 "Design Notes: Cyclic ownership".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxAgent {
    pub id: u32,
    pub kind: FluxKind,
    pub face: Face,
    /// The reserved grid site this agent occupies, once registered.
    pub site: Option<Site>,
    /// Per-attempt acceptance probability (`source.rate`/`drain.rate`, or
    /// the species/face-specific override).
    pub rate: f64,
    attempts: u64,
    successes: u64,
}

impl FluxAgent {
    pub fn new(id: u32, kind: FluxKind, face: Face, rate: f64) -> Self {
        FluxAgent { id, kind, face, site: None, rate, attempts: 0, successes: 0 }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// A single Bernoulli trial at this agent's rate, counted as an
    /// attempt (and a success, if it fires). Used by source injection and
    /// the recombination/exciton sweep in `World`, which all follow the
    /// same "try once per tick per agent" shape (spec.md §4.4).
    pub fn try_fire(&mut self, rng: &mut DeterministicRng) -> bool {
        self.record_attempt();
        let fired = rng.chance(self.rate);
        if fired {
            self.record_success();
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_fire_always_succeeds_at_rate_one() {
        let mut agent = FluxAgent::new(0, FluxKind::ElectronSource, Face::XMinus, 1.0);
        let mut rng = DeterministicRng::from_seed(3);
        assert!(agent.try_fire(&mut rng));
        assert_eq!(agent.attempts(), 1);
        assert_eq!(agent.successes(), 1);
        assert!((agent.success_rate() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn try_fire_never_succeeds_at_rate_zero() {
        let mut agent = FluxAgent::new(0, FluxKind::HoleDrain, Face::XPlus, 0.0);
        let mut rng = DeterministicRng::from_seed(3);
        for _ in 0..20 {
            assert!(!agent.try_fire(&mut rng));
        }
        assert_eq!(agent.attempts(), 20);
        assert_eq!(agent.successes(), 0);
    }

    #[test]
    fn kind_reports_species_and_role() {
        assert_eq!(FluxKind::ElectronSource.species(), Some(Species::Electron));
        assert_eq!(FluxKind::Recombination.species(), None);
        assert!(FluxKind::HoleDrain.is_drain());
        assert!(FluxKind::ExcitonSource.is_source());
    }
}

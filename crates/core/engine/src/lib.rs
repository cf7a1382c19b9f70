mod carriers;
mod checkpoint;
mod error;
mod gpu;
mod grid;
mod params;
mod potential;
mod rng;
mod tables;
mod world;

pub mod driver;

pub use carriers::{Carrier, CarrierId, FutureOutcome, Species};
pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use driver::Simulation;
pub use error::{CheckpointError, ConfigError, EngineError, GpuError, PlacementError, StateError};
pub use gpu::{CoulombBackend, CpuBackend};
pub use grid::{Agent, Face, Grid, Site};
pub use params::{Parameters, SimulationKind};
pub use potential::Potential;
pub use rng::DeterministicRng;
pub use tables::PrecomputedTables;
pub use world::World;

/// Flux-agent bookkeeping shared by sources, drains and recombination.
pub use carriers::flux::{FluxAgent, FluxKind};

use thiserror::Error;

/// Errors raised while parsing or validating a `[Parameters]` section.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown parameter key `{0}`")]
    UnknownKey(String),
    #[error("malformed line (missing `=`): `{0}`")]
    MissingEquals(String),
    #[error("key `{key}` has value `{value}` which cannot be parsed as {expected}")]
    BadValue { key: String, value: String, expected: &'static str },
    #[error("key `{key}` must be in [0, 1], got {value}")]
    PercentageOutOfRange { key: String, value: f64 },
    #[error("iterations.real ({real}) is not divisible by iterations.print ({print})")]
    IterationsNotDivisible { real: u64, print: u64 },
    #[error("unknown simulation.type `{0}`, expected `transistor` or `solarcell`")]
    UnknownSimulationKind(String),
    #[error("defect.percentage + trap.percentage = {sum} exceeds 1")]
    DefectTrapOverflow { sum: f64 },
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
}

/// Errors raised while placing defects, traps or initial carriers on the grid.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("requested {requested} sites of kind `{kind}` but only {available} are free")]
    InsufficientSites { kind: &'static str, requested: usize, available: usize },
    #[error("random placement of `{kind}` exceeded {limit} attempts (volume-scaled retry budget)")]
    RetryBudgetExceeded { kind: &'static str, limit: usize },
}

/// Errors raised by grid occupancy operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("site {site} is already occupied, cannot register")]
    SiteOccupied { site: u32 },
    #[error("site {site} occupant does not match the agent being unregistered")]
    OccupantMismatch { site: u32 },
    #[error("carrier {id:?} references site {site}, which does not carry a matching tag")]
    DanglingCarrier { id: crate::CarrierId, site: u32 },
    #[error("site {0} is out of bounds for this grid")]
    SiteOutOfBounds(u32),
}

/// Errors raised while reading or writing a checkpoint file.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint section `{0}` is truncated or missing")]
    TruncatedSection(&'static str),
    #[error("checkpoint section `{section}` has malformed entry: `{line}`")]
    MalformedEntry { section: &'static str, line: String },
    #[error("RNG state failed to round-trip through serialization")]
    RngRoundTrip,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
}

/// Errors raised by the optional GPU Coulomb backend.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter was found")]
    NoAdapter,
    #[error("device request failed: {0}")]
    DeviceRequest(String),
    #[error("GPU buffer mapping failed: {0}")]
    MapFailure(String),
}

/// Aggregate error type returned from top-level engine entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

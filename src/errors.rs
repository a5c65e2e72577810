use thiserror::Error;

/// Configuration problems abort startup; nothing here is recoverable at
/// runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("configuration conflict: {0}")]
    Conflict(String),
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Planner-level failures, surfaced to the orchestrator which decides policy
/// (retry with backoff, refuse the mission, or ask the operator).
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("boundary polygon is empty")]
    EmptyPolygon,

    #[error("point ({x:.2}, {y:.2}) is outside the occupancy grid")]
    OutOfBounds { x: f64, y: f64 },

    #[error(
        "target ({x:.2}, {y:.2}) lies inside an obstacle; nearest free cell is ({suggest_x:.2}, {suggest_y:.2})"
    )]
    TargetInObstacle {
        x: f64,
        y: f64,
        suggest_x: f64,
        suggest_y: f64,
    },

    #[error("no traversable path from ({from_x:.2}, {from_y:.2}) to ({to_x:.2}, {to_y:.2})")]
    PathNotFound {
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
    },
}

/// Hardware-port init or I/O failure. Surfaced as degraded health; the
/// supervisor demotes dependent features rather than crashing the daemon.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port `{port}` failed to initialize: {reason}")]
    Init { port: &'static str, reason: String },

    #[error("port `{port}` I/O error: {reason}")]
    Io { port: &'static str, reason: String },

    #[error("command rejected: stale supervisor token {got}, current {current}")]
    StaleToken { got: u64, current: u64 },
}

/// Persistence failures. Optional feature, so these never affect correctness.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persist I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("persist encode/decode: {0}")]
    Codec(#[from] serde_json::Error),
}

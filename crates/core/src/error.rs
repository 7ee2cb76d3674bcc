//! Typed error kinds for the control plane (§7). `anyhow` is reserved for
//! fallible setup paths (file IO, config parsing) the way the teacher's
//! `config.rs`/`db.rs` use `.context(...)`; everything a caller might match
//! on is a `thiserror` enum instead.

use thiserror::Error;

use crate::model::{PumpId, ZoneId};

/// Host API failures, split into the two categories §4.2 requires.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("transient host error for {entity}: {detail}")]
    Transient { entity: String, detail: String },

    #[error("permanent host error for {entity}: {detail}")]
    Permanent { entity: String, detail: String },
}

impl HostError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HostError::Transient { .. })
    }
}

/// Errors surfaced while resolving configuration at job-build time.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("zone '{0}' references unknown pump '{1}'")]
    DanglingPumpRef(ZoneId, PumpId),

    #[error("event '{0}' assigns unknown zone '{1}'")]
    DanglingZoneRef(String, ZoneId),

    #[error("room '{0}' enables a P1 event but has no readable lights-on reference")]
    MissingLightsOnRef(String),

    #[error("config document uses a v1-only field '{field}' on '{entity}' — v2 (room-first) config is required")]
    LegacyV1Field { entity: String, field: String },

    #[error("P2 event '{0}' has an invalid time_of_day '{1}'")]
    InvalidTimeOfDay(String, String),
}

/// Errors returned synchronously by `ManualController` (§6).
#[derive(Error, Debug, Clone)]
pub enum ManualError {
    #[error("zone '{0}' not found")]
    ZoneNotFound(ZoneId),

    #[error("pump '{0}' not found")]
    PumpNotFound(PumpId),

    #[error("duration must be > 0 seconds, got {0}")]
    DurationInvalid(i64),

    #[error("pump executor unavailable — supervisor is shutting down")]
    ExecutorUnavailable,
}

/// Crate-wide error kind covering the taxonomy in §7: transient/permanent
/// host errors are folded in via `#[from]`; `StuckLock`, `Cancelled`, and
/// `Internal` are control-plane-specific outcomes that never escape a pump
/// worker's own task boundary (see `pump_executor.rs`).
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pump '{0}' lock stuck on beyond the configured timeout")]
    StuckLock(PumpId),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

//! The configuration data model (§3): rooms, pumps, zones, water events,
//! system settings, and the runtime-only `Job`. Shape follows the teacher's
//! `db.rs` config structs (`ZoneConfig`, `SensorConfig`) — plain, cloneable,
//! serde-derived records with no behaviour of their own.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type RoomId = String;
pub type PumpId = String;
pub type ZoneId = String;
pub type EventId = String;
pub type JobId = u64;

/// An opaque reference to a host entity (§9: "dynamic entity references...
/// become opaque string handles passed to `HostClient`").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef(pub String);

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityRef {
    fn from(s: String) -> Self {
        EntityRef(s)
    }
}

impl From<&str> for EntityRef {
    fn from(s: &str) -> Self {
        EntityRef(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub enabled: bool,
    pub lights_on_ref: Option<EntityRef>,
    pub lights_off_ref: Option<EntityRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pump {
    pub id: PumpId,
    pub room_id: RoomId,
    pub name: String,
    pub lock_ref: EntityRef,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub pump_id: PumpId,
    pub name: String,
    pub switch_ref: EntityRef,
    pub enabled: bool,
}

/// Kind-specific firing rule for a `WaterEvent`. Modeled as a tagged union
/// rather than two optional fields so `kind = P1` with a `time_of_day` set
/// (or vice versa) is unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WaterEventSchedule {
    /// P1: fires at `lights_on + delay_minutes`.
    P1 { delay_minutes: i64 },
    /// P2: fires at a fixed local time of day ("HH:MM" or "HH:MM:SS").
    P2 { time_of_day: String },
    /// v1 "Auto Mode" — deliberately unsupported (§9 open question #2).
    /// `ScheduleCalculator::next_firings_today` returns the empty set and
    /// logs a warning for this variant; it exists only so a config document
    /// that names it fails closed instead of silently dropping the event.
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterEvent {
    pub id: EventId,
    pub room_id: RoomId,
    pub name: String,
    pub schedule: WaterEventSchedule,
    pub run_seconds: i64,
    pub enabled: bool,
    pub assigned_zone_ids: Vec<ZoneId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SystemSettings {
    pub pump_startup_delay_sec: u64,
    pub zone_switch_delay_sec: u64,
    pub scheduler_interval_sec: u64,
    pub stuck_lock_timeout_sec: u64,
}

impl SystemSettings {
    pub const DEFAULT_PUMP_STARTUP_DELAY_SEC: u64 = 5;
    pub const DEFAULT_ZONE_SWITCH_DELAY_SEC: u64 = 2;
    pub const DEFAULT_SCHEDULER_INTERVAL_SEC: u64 = 60;
    pub const DEFAULT_STUCK_LOCK_TIMEOUT_SEC: u64 = 300;
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            pump_startup_delay_sec: Self::DEFAULT_PUMP_STARTUP_DELAY_SEC,
            zone_switch_delay_sec: Self::DEFAULT_ZONE_SWITCH_DELAY_SEC,
            scheduler_interval_sec: Self::DEFAULT_SCHEDULER_INTERVAL_SEC,
            stuck_lock_timeout_sec: Self::DEFAULT_STUCK_LOCK_TIMEOUT_SEC,
        }
    }
}

/// Where a `Job` came from — used only for status reporting; FIFO ordering
/// does not distinguish origin (§4.7: "there is no priority — FIFO is
/// strict").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOrigin {
    Scheduled,
    Manual,
}

/// A unit of work for exactly one zone on exactly one pump. Runtime-only —
/// never persisted (§3 Lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub pump_id: PumpId,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub switch_ref: EntityRef,
    pub run_seconds: i64,
    pub origin: JobOrigin,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_for: Option<OffsetDateTime>,
}

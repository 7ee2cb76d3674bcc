//! Configuration snapshot + live-reload source (§4.3). Mirrors the teacher's
//! `config.rs` split between "parse a document" and "apply it", except here
//! the applied result is held in memory and handed out as an immutable
//! `Arc<ConfigSnapshot>` rather than written into a database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::model::{Pump, Room, SystemSettings, WaterEvent, Zone};

/// Immutable, fully-resolved view of the configuration document, handed out
/// to the scheduler/manual controller on every read (§4.3: "config changes
/// take effect for the next read; in-flight jobs are not retroactively
/// affected").
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub rooms: Vec<Room>,
    pub pumps: Vec<Pump>,
    pub zones: Vec<Zone>,
    pub events: Vec<WaterEvent>,
    pub settings: SystemSettings,
}

impl ConfigSnapshot {
    pub fn pump(&self, id: &str) -> Option<&Pump> {
        self.pumps.iter().find(|p| p.id == id)
    }

    pub fn zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn room(&self, id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == id)
    }

    /// Validates invariant 1: every zone's `pump_id` and every event's
    /// `assigned_zone_ids` must resolve, and a room with an enabled P1 event
    /// must carry a `lights_on_ref`.
    fn validate(&self) -> Result<(), ConfigError> {
        let pump_ids: std::collections::HashSet<_> = self.pumps.iter().map(|p| &p.id).collect();
        let zone_ids: std::collections::HashSet<_> = self.zones.iter().map(|z| &z.id).collect();

        for zone in &self.zones {
            if !pump_ids.contains(&zone.pump_id) {
                return Err(ConfigError::DanglingPumpRef(
                    zone.id.clone(),
                    zone.pump_id.clone(),
                ));
            }
        }

        for event in &self.events {
            for zone_id in &event.assigned_zone_ids {
                if !zone_ids.contains(zone_id) {
                    return Err(ConfigError::DanglingZoneRef(event.id.clone(), zone_id.clone()));
                }
            }

            if event.enabled && matches!(event.schedule, crate::model::WaterEventSchedule::P1 { .. }) {
                let room = self.rooms.iter().find(|r| r.id == event.room_id);
                let has_ref = room.is_some_and(|r| r.lights_on_ref.is_some());
                if !has_ref {
                    return Err(ConfigError::MissingLightsOnRef(event.id.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Source of `ConfigSnapshot`s, with a change notification channel so the
/// scheduler can pick up edits without restarting (§4.3).
pub trait ConfigStore: Send + Sync {
    fn snapshot(&self) -> Arc<ConfigSnapshot>;

    /// Fires (empty value) whenever a new snapshot has been installed.
    fn subscribe(&self) -> watch::Receiver<()>;
}

// ---------------------------------------------------------------------------
// TOML document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    room: Vec<RoomDoc>,
    #[serde(default)]
    pump: Vec<PumpDoc>,
    #[serde(default)]
    zone: Vec<ZoneDoc>,
    #[serde(default)]
    event: Vec<EventDoc>,
    #[serde(default)]
    settings: Option<SystemSettings>,
}

#[derive(Debug, Deserialize)]
struct RoomDoc {
    id: String,
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    lights_on_ref: Option<String>,
    lights_off_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PumpDoc {
    id: String,
    room_id: String,
    name: String,
    lock_ref: String,
    #[serde(default = "default_true")]
    enabled: bool,
    /// v1-only field — rejected outright so a stale config fails loudly
    /// rather than silently losing its lock semantics (§9 open question #1).
    zone_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ZoneDoc {
    id: String,
    pump_id: String,
    name: String,
    switch_ref: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct EventDoc {
    id: String,
    room_id: String,
    name: String,
    kind: String,
    delay_minutes: Option<i64>,
    time_of_day: Option<String>,
    run_seconds: i64,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    assigned_zone_ids: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn resolve(doc: ConfigDoc) -> Result<ConfigSnapshot, ConfigError> {
    for pump in &doc.pump {
        if pump.zone_ids.is_some() {
            return Err(ConfigError::LegacyV1Field {
                entity: pump.id.clone(),
                field: "zone_ids".to_string(),
            });
        }
    }

    let rooms = doc
        .room
        .into_iter()
        .map(|r| Room {
            id: r.id,
            name: r.name,
            enabled: r.enabled,
            lights_on_ref: r.lights_on_ref.map(Into::into),
            lights_off_ref: r.lights_off_ref.map(Into::into),
        })
        .collect();

    let pumps = doc
        .pump
        .into_iter()
        .map(|p| Pump {
            id: p.id,
            room_id: p.room_id,
            name: p.name,
            lock_ref: p.lock_ref.into(),
            enabled: p.enabled,
        })
        .collect::<Vec<_>>();

    let zones = doc
        .zone
        .into_iter()
        .map(|z| Zone {
            id: z.id,
            pump_id: z.pump_id,
            name: z.name,
            switch_ref: z.switch_ref.into(),
            enabled: z.enabled,
        })
        .collect();

    let mut events = Vec::with_capacity(doc.event.len());
    for e in doc.event {
        let schedule = match e.kind.as_str() {
            "P1" => crate::model::WaterEventSchedule::P1 {
                delay_minutes: e.delay_minutes.unwrap_or(0),
            },
            "P2" => {
                let time_of_day = e.time_of_day.clone().ok_or_else(|| {
                    ConfigError::InvalidTimeOfDay(e.id.clone(), "<missing>".to_string())
                })?;
                crate::model::WaterEventSchedule::P2 { time_of_day }
            }
            "Auto" => crate::model::WaterEventSchedule::Auto,
            other => {
                return Err(ConfigError::InvalidTimeOfDay(e.id.clone(), other.to_string()))
            }
        };

        events.push(WaterEvent {
            id: e.id,
            room_id: e.room_id,
            name: e.name,
            schedule,
            run_seconds: e.run_seconds,
            enabled: e.enabled,
            assigned_zone_ids: e.assigned_zone_ids,
        });
    }

    let snapshot = ConfigSnapshot {
        rooms,
        pumps,
        zones,
        events,
        settings: doc.settings.unwrap_or_default(),
    };
    snapshot.validate()?;
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Default `ConfigStore`: loads `config.toml` once at startup and reloads it
/// on demand via `reload()` (wired to SIGHUP in `main.rs`), the way the
/// teacher re-reads `CONFIG_PATH` rather than watching the filesystem.
pub struct FileConfigStore {
    path: PathBuf,
    current: std::sync::RwLock<Arc<ConfigSnapshot>>,
    tx: watch::Sender<()>,
    _rx: watch::Receiver<()>,
}

impl FileConfigStore {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_and_resolve(&path)?;
        let (tx, rx) = watch::channel(());
        info!(path = %path.display(), "loaded configuration");
        Ok(Self {
            path,
            current: std::sync::RwLock::new(Arc::new(snapshot)),
            tx,
            _rx: rx,
        })
    }

    fn read_and_resolve(path: &Path) -> anyhow::Result<ConfigSnapshot> {
        use anyhow::Context;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let doc: ConfigDoc = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        resolve(doc).with_context(|| format!("resolving config file {}", path.display()))
    }

    /// Re-reads the config file from disk and installs the new snapshot if
    /// it parses and validates; a bad edit is logged and ignored, leaving
    /// the previous snapshot in effect.
    pub fn reload(&self) {
        match Self::read_and_resolve(&self.path) {
            Ok(snapshot) => {
                *self.current.write().expect("config lock poisoned") = Arc::new(snapshot);
                let _ = self.tx.send(());
                info!(path = %self.path.display(), "reloaded configuration");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload failed — keeping previous snapshot");
            }
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().expect("config lock poisoned").clone()
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

/// In-memory `ConfigStore` for tests: holds a fixed snapshot, reload is a
/// no-op unless `set()` is called.
#[cfg(test)]
pub(crate) struct StaticConfigStore {
    current: std::sync::RwLock<Arc<ConfigSnapshot>>,
    tx: watch::Sender<()>,
}

#[cfg(test)]
impl StaticConfigStore {
    pub(crate) fn new(snapshot: ConfigSnapshot) -> Self {
        let (tx, _rx) = watch::channel(());
        Self {
            current: std::sync::RwLock::new(Arc::new(snapshot)),
            tx,
        }
    }

    pub(crate) fn set(&self, snapshot: ConfigSnapshot) {
        *self.current.write().unwrap() = Arc::new(snapshot);
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
impl ConfigStore for StaticConfigStore {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().unwrap().clone()
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

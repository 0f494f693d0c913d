//! C1: layered parameter engine.
//!
//! Four layers — built-in defaults, model profile, user overrides, runtime
//! values — are merged last-writer-wins into an effective view. The view is
//! a composed read-only snapshot rebuilt lazily whenever any layer mutates,
//! mirroring the teacher's flat `AdapterSettings` config struct but with a
//! closed key enum instead of named fields, per the dynamic-dict-to-enum
//! redesign.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::watch;
use tracing::warn;

use crate::model::Zone;

/// The closed set of parameter keys the core recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Model,
    IgnoredZones,
    CommandDelay,
    MaxSourceId,
    MaxVolume,
    MaxVolumeZonex,
    PowerOnVolumeBounce,
    VolumeStepOnly,
    IgnoreVolumeCheck,
    ZoneSources(Zone),
    HdzoneSources,
    AmpSpeakerSystemModes,
    ExtraAmpListeningModes,
    EnabledAmpListeningModes,
    DisabledAmpListeningModes,
    VideoResolutionModes,
    MhlSource,
    EnabledFunctions,
    DisableAutoQuery,
    AmFrequencyStep,
    AlwaysPoll,
    ScanInterval,
    Timeout,
    ZonesInitialRefresh,
}

/// A typed parameter value. Unknown keys (forward-compat / lenient mode)
/// round-trip as `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
    ZoneSet(Vec<Zone>),
}

impl ParamValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// A single layer of the parameter stack: a partial map of keys to values.
type Layer = HashMap<ParamKey, ParamValue>;

fn builtin_defaults() -> Layer {
    let mut m = Layer::new();
    m.insert(ParamKey::CommandDelay, ParamValue::Float(0.06));
    m.insert(ParamKey::MaxSourceId, ParamValue::Int(60));
    m.insert(ParamKey::MaxVolume, ParamValue::Int(185));
    m.insert(ParamKey::MaxVolumeZonex, ParamValue::Int(81));
    m.insert(ParamKey::PowerOnVolumeBounce, ParamValue::Bool(false));
    m.insert(ParamKey::VolumeStepOnly, ParamValue::Bool(false));
    m.insert(ParamKey::IgnoreVolumeCheck, ParamValue::Bool(false));
    m.insert(ParamKey::DisableAutoQuery, ParamValue::Bool(false));
    m.insert(ParamKey::AlwaysPoll, ParamValue::Bool(false));
    m.insert(ParamKey::ScanInterval, ParamValue::Float(60.0));
    m.insert(ParamKey::Timeout, ParamValue::Float(5.0));
    m.insert(ParamKey::AmFrequencyStep, ParamValue::Float(1.0));
    m
}

/// Known model profiles, selected by longest-prefix match against the
/// detected model string. Real profile data is an external concern (the
/// per-command code table names model quirks); this registry ships empty
/// and is populated by the embedding application via
/// [`Parameters::register_model_profile`].
#[derive(Default)]
struct ModelProfiles {
    profiles: HashMap<String, Layer>,
}

impl ModelProfiles {
    fn resolve(&self, model: &str) -> Layer {
        self.profiles
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, layer)| layer.clone())
            .unwrap_or_default()
    }
}

struct Inner {
    defaults: Layer,
    model_profiles: ModelProfiles,
    model_layer: Layer,
    user: Layer,
    runtime: Layer,
    effective: Layer,
}

impl Inner {
    fn recompute(&mut self) {
        let mut merged = self.defaults.clone();
        merged.extend(self.model_layer.clone());
        merged.extend(self.user.clone());
        merged.extend(self.runtime.clone());
        self.effective = merged;
    }
}

/// The layered parameter engine (C1). Readers take the effective view under
/// a read lock; mutations take a write lock, recompute, and bump the change
/// signal so [`crate::properties::Properties`] and the updater can react.
pub struct Parameters {
    inner: RwLock<Inner>,
    changes: watch::Sender<u64>,
    version: std::sync::atomic::AtomicU64,
}

impl Parameters {
    pub fn new() -> Self {
        let defaults = builtin_defaults();
        let effective = defaults.clone();
        let (tx, _rx) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                defaults,
                model_profiles: ModelProfiles::default(),
                model_layer: Layer::new(),
                user: Layer::new(),
                runtime: Layer::new(),
                effective,
            }),
            changes: tx,
            version: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Subscribe to change notifications. The carried value is a monotonic
    /// version counter, not the changed key; subscribers re-read the
    /// effective view on wakeup.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self, inner: &mut Inner) {
        inner.recompute();
        let v = self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if self.changes.send(v).is_err() {
            warn!("no subscribers for parameter change notification");
        }
    }

    /// Register a model profile layer under a prefix. Longest-prefix match
    /// wins when `set_default_params_model` resolves the active model.
    pub fn register_model_profile(&self, prefix: impl Into<String>, layer: Vec<(ParamKey, ParamValue)>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .model_profiles
            .profiles
            .insert(prefix.into(), layer.into_iter().collect());
    }

    /// Resolve layer 1 (model profile) by exact match, else longest prefix.
    /// On miss, layer 1 is left empty.
    pub fn set_default_params_model(&self, model: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let exact = inner.model_profiles.profiles.get(model).cloned();
        inner.model_layer = exact.unwrap_or_else(|| inner.model_profiles.resolve(model));
        inner
            .user
            .insert(ParamKey::Model, ParamValue::Str(model.to_string()));
        self.bump(&mut inner);
    }

    pub fn set_user_param(&self, key: ParamKey, value: ParamValue) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.user.insert(key, value);
        self.bump(&mut inner);
    }

    pub fn set_user_params(&self, params: Vec<(ParamKey, ParamValue)>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (k, v) in params {
            inner.user.insert(k, v);
        }
        self.bump(&mut inner);
    }

    pub fn get_user_params(&self) -> HashMap<ParamKey, ParamValue> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.user.clone()
    }

    pub fn set_runtime(&self, key: ParamKey, value: ParamValue) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.runtime.insert(key, value);
        self.bump(&mut inner);
    }

    pub fn get(&self, key: ParamKey) -> Option<ParamValue> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.effective.get(&key).cloned()
    }

    pub fn get_all(&self) -> HashMap<ParamKey, ParamValue> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.effective.clone()
    }

    /// Accept and store unknown keys while logging a warning, per §4.1.
    /// Used by callers that accept raw string keys from outside the crate
    /// (e.g. a config front-end) before mapping them to `ParamKey`.
    pub fn set_unknown(&self, raw_key: &str) {
        warn!("unrecognized parameter key '{}', storing but ignoring", raw_key);
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

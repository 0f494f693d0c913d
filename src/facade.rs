//! C8: the facade.
//!
//! Typed operations that compose C3 (code lookup) through C7 (the
//! updater), exposed as the crate's public entry point. Construction
//! creates the parameter engine and the empty property cache; `connect`
//! creates the connection, responder, command queue, and updater; they are
//! torn down in reverse order on disconnect, mirroring the lifecycle in
//! `spec.md` §3.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::codes::{CodeRegistry, SharedRegistry};
use crate::connection::{Connection, ConnectionState};
use crate::error::AvrError;
use crate::model::{CommandItem, Scalar, Tristate, TunerBand, Zone};
use crate::params::{ParamKey, Parameters};
use crate::properties::{PropertiesSnapshot, Properties, SharedProperties};
use crate::queue::CommandQueue;
use crate::responder::Responder;
use crate::updater::Updater;

const WATCHDOG_MAX_TUNER_STEPS: u32 = 400;
const TUNER_FM_STEP_MHZ: f64 = 0.1;

/// Session state created at construction and kept across reconnects.
struct Core {
    params: Arc<Parameters>,
    properties: SharedProperties,
    registry: SharedRegistry,
}

/// Session state created at `connect` and torn down at `disconnect`.
struct Session {
    connection: Arc<Connection>,
    responder: Arc<Responder>,
    queue: Arc<CommandQueue>,
    updater: Arc<Updater>,
}

/// The AVR client facade (C8).
pub struct Facade {
    addr: String,
    core: Core,
    session: tokio::sync::RwLock<Option<Session>>,
}

impl Facade {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            core: Core {
                params: Arc::new(Parameters::new()),
                properties: Arc::new(Properties::new()),
                registry: Arc::new(std::sync::RwLock::new(CodeRegistry::new())),
            },
            session: tokio::sync::RwLock::new(None),
        }
    }

    pub fn params(&self) -> &Arc<Parameters> {
        &self.core.params
    }

    pub fn properties(&self) -> &SharedProperties {
        &self.core.properties
    }

    /// Grants write access to the command/decoder registry before connect,
    /// since it is an external collaborator's data (the per-command code
    /// table and decoders are out of scope for this crate).
    pub fn registry(&self) -> &SharedRegistry {
        &self.core.registry
    }

    pub async fn available(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(s) => s.connection.available(),
            None => false,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.session.read().await.as_ref() {
            Some(s) => s.connection.state(),
            None => ConnectionState::Disconnected,
        }
    }

    pub async fn subscribe_connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.connection.subscribe_state())
    }

    /// Creates the connection, responder, command queue, and updater, and
    /// starts the session.
    pub async fn connect(&self, reconnect: bool) -> Result<(), AvrError> {
        self.core
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate()
            .map_err(|e| AvrError::Validation(e.to_string()))?;

        let responder = Arc::new(Responder::new(
            self.core.registry.clone(),
            self.core.properties.clone(),
            self.core.params.clone(),
        ));
        let connection = Arc::new(Connection::new(self.addr.clone(), responder.clone(), self.core.properties.clone()));
        let queue = Arc::new(CommandQueue::new(
            connection.clone(),
            responder.clone(),
            self.core.registry.clone(),
            self.core.params.clone(),
            self.core.properties.clone(),
        ));
        let updater = Arc::new(Updater::new(queue.clone(), connection.clone(), self.core.params.clone()));
        queue.set_initial_refresh_tracker(updater.initial_refresh_tracker());

        connection.connect(reconnect).await?;
        queue.schedule();
        updater.spawn();

        let updater_for_hook = updater.clone();
        self.core.properties.set_power_on_hook(Some(Arc::new(move |zone| {
            let updater = updater_for_hook.clone();
            tokio::spawn(async move { updater.on_power_transition_on(zone).await });
        })));

        *self.session.write().await = Some(Session {
            connection,
            responder,
            queue,
            updater,
        });
        info!("AVR facade connected");
        Ok(())
    }

    /// Gracefully closes the link; reconnect toggles future supervisor
    /// behavior. Tears down the session components in reverse creation
    /// order (updater, queue, responder, connection).
    pub async fn disconnect(&self, reconnect: bool) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            self.core.properties.set_power_on_hook(None);
            session.updater.stop();
            session.queue.cancel().await;
            session.queue.stop_schedule();
            session.connection.disconnect(reconnect).await;
        }
    }

    /// Closes and forbids further connects. Permanent.
    pub async fn shutdown(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            self.core.properties.set_power_on_hook(None);
            session.updater.stop();
            session.queue.cancel().await;
            session.queue.stop_schedule();
            session.connection.shutdown().await;
        }
    }

    async fn require_session(&self) -> Result<tokio::sync::RwLockReadGuard<'_, Option<Session>>, AvrError> {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(_) => Ok(guard),
            None => Err(AvrError::Unavailable),
        }
    }

    fn max_volume_default(zone: Zone) -> i32 {
        if zone == Zone::Main {
            185
        } else {
            81
        }
    }

    async fn effective_max_volume(&self, zone: Zone) -> i32 {
        let key = match zone {
            Zone::Main => ParamKey::MaxVolume,
            _ => ParamKey::MaxVolumeZonex,
        };
        self.core
            .params
            .get(key)
            .and_then(|v| v.as_int())
            .map(|v| v as i32)
            .unwrap_or_else(|| Self::max_volume_default(zone))
    }

    async fn run_command(&self, item: CommandItem) -> Result<Option<String>, AvrError> {
        let guard = self.require_session().await?;
        let session = match guard.as_ref() {
            Some(s) => s,
            None => return Err(AvrError::Unavailable),
        };
        let rx = session.queue.enqueue_and_wait(item).await;
        drop(guard);
        rx.await.map_err(|_| AvrError::Cancelled)?
    }

    pub async fn power_on(&self, zone: Zone) -> Result<(), AvrError> {
        self.run_command(CommandItem::new("PWR_ON").with_args(vec![Scalar::Zone(zone)]))
            .await?;
        let bounce = self
            .core
            .params
            .get(ParamKey::PowerOnVolumeBounce)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if bounce && zone == Zone::Main {
            let _ = self
                .run_command(CommandItem::new("VOL_UP").with_args(vec![Scalar::Zone(zone)]))
                .await;
            let _ = self
                .run_command(CommandItem::new("VOL_DOWN").with_args(vec![Scalar::Zone(zone)]))
                .await;
        }
        Ok(())
    }

    pub async fn power_off(&self, zone: Zone) -> Result<(), AvrError> {
        self.run_command(CommandItem::new("PWR_OFF").with_args(vec![Scalar::Zone(zone)]))
            .await?;
        Ok(())
    }

    /// Validates `0 <= target <= max_volume[zone]` (185 Main, 81 others
    /// unless overridden), then dispatches. When `volume_step_only`, expands
    /// to a deterministic up/down sequence pushed at the head of the active
    /// queue, per §4.8.
    pub async fn set_volume_level(&self, target: i32, zone: Zone) -> Result<(), AvrError> {
        let max = self.effective_max_volume(zone).await;
        if target < 0 || target > max {
            return Err(AvrError::Validation(format!(
                "volume {} out of range [0, {}] for {}",
                target, max, zone
            )));
        }

        let step_only = self
            .core
            .params
            .get(ParamKey::VolumeStepOnly)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if step_only {
            let current = self.core.properties.volume(zone).unwrap_or(0);
            let steps = target - current;
            let direction = if steps >= 0 { "VOL_UP" } else { "VOL_DOWN" };
            for _ in 0..steps.unsigned_abs() {
                self.run_command(
                    CommandItem::new(direction)
                        .with_args(vec![Scalar::Zone(zone)])
                        .with_queue(0),
                )
                .await?;
            }
        } else {
            self.run_command(
                CommandItem::new("VOL_SET").with_args(vec![Scalar::Zone(zone), Scalar::Int(target as i64)]),
            )
            .await?;
        }
        Ok(())
    }

    /// Resolves `source` (integer id or name) against `source_dict`. An
    /// ambiguous name fails validation; the caller must disambiguate by id.
    pub async fn select_source(&self, source: Scalar, zone: Zone) -> Result<(), AvrError> {
        let id = match source {
            Scalar::Int(id) => id,
            Scalar::Str(name) => {
                let dict = self.core.properties.get_source_dict(Some(zone));
                let matches: Vec<i64> = dict
                    .iter()
                    .filter(|(_, n)| n.as_str() == name.as_str())
                    .map(|(id, _)| *id)
                    .collect();
                match matches.as_slice() {
                    [] => {
                        return Err(AvrError::Validation(format!("unknown source '{}'", name)));
                    }
                    [single] => *single,
                    _ => {
                        return Err(AvrError::Validation(format!(
                            "source name '{}' is ambiguous; select by id",
                            name
                        )));
                    }
                }
            }
            other => {
                return Err(AvrError::Validation(format!("invalid source selector {:?}", other)));
            }
        };

        self.run_command(
            CommandItem::new("FN_SET").with_args(vec![Scalar::Zone(zone), Scalar::Int(id)]),
        )
        .await?;
        Ok(())
    }

    /// Exactly one of `name`/`id` must be provided.
    pub async fn select_listening_mode(&self, name: Option<&str>, id: Option<&str>) -> Result<(), AvrError> {
        match (name, id) {
            (Some(_), Some(_)) | (None, None) => Err(AvrError::Validation(
                "select_listening_mode requires exactly one of name or id".to_string(),
            )),
            (Some(name), None) => {
                self.run_command(CommandItem::new("LM_SET_NAME").with_args(vec![Scalar::Str(name.to_string())]))
                    .await?;
                Ok(())
            }
            (None, Some(id)) => {
                self.run_command(CommandItem::new("LM_SET_ID").with_args(vec![Scalar::Str(id.to_string())]))
                    .await?;
                Ok(())
            }
        }
    }

    /// If direct-entry is unsupported by the model, iterates up/down
    /// commands until the target is reached, capped by a watchdog
    /// iteration count, per scenario #4 in §8.
    pub async fn set_tuner_frequency(&self, band: TunerBand, target: f64, direct_entry_supported: bool) -> Result<(), AvrError> {
        if direct_entry_supported {
            self.run_command(
                CommandItem::new("TFR_SET").with_args(vec![Scalar::Float(target)]),
            )
            .await?;
            return Ok(());
        }

        let step = match band {
            TunerBand::Fm => TUNER_FM_STEP_MHZ,
            TunerBand::Am => self
                .core
                .params
                .get(ParamKey::AmFrequencyStep)
                .and_then(|v| v.as_float())
                .unwrap_or(1.0),
        };

        let mut current = self.current_tuner_frequency().await.unwrap_or(target);
        let mut iterations = 0;
        while (current - target).abs() > step / 2.0 && iterations < WATCHDOG_MAX_TUNER_STEPS {
            let direction = if target > current { "TFR_UP" } else { "TFR_DOWN" };
            self.run_command(CommandItem::new(direction)).await?;
            current += if target > current { step } else { -step };
            iterations += 1;
        }
        if iterations >= WATCHDOG_MAX_TUNER_STEPS {
            warn!(target, "tuner frequency watchdog reached max iterations");
        }
        Ok(())
    }

    async fn current_tuner_frequency(&self) -> Option<f64> {
        self.core
            .properties
            .get_topic("tuner", "frequency")
            .and_then(|s| s.parse::<f64>().ok())
    }

    /// Iterates candidate ids `0..max_source_id`, querying each and
    /// collecting responses into the source dictionary. This is a full
    /// device-info query, so per §4.7 it waits for Main's initial refresh to
    /// complete before issuing any wire traffic.
    pub async fn build_source_dict(&self) -> Result<(), AvrError> {
        {
            let guard = self.require_session().await?;
            let tracker = match guard.as_ref() {
                Some(s) => s.updater.initial_refresh_tracker(),
                None => return Err(AvrError::Unavailable),
            };
            drop(guard);
            while !tracker.main_done() {
                if !self.available().await {
                    return Err(AvrError::Unavailable);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let max_source_id = self
            .core
            .params
            .get(ParamKey::MaxSourceId)
            .and_then(|v| v.as_int())
            .unwrap_or(60);

        let mut dict = self.core.properties.get_source_dict(None);
        for id in 0..=max_source_id {
            let name = self
                .run_command(
                    CommandItem::new("FN_QUERY").with_args(vec![Scalar::Int(id)]),
                )
                .await;
            if let Ok(Some(name)) = name {
                dict.insert(id, name.trim_end().to_string());
            }
        }
        self.core.properties.set_source_dict(dict);
        Ok(())
    }

    /// Enqueues per-zone refresh items; when `wait`, returns only after the
    /// queue drains for those items.
    pub async fn refresh(&self, zones: Option<&[Zone]>, wait: bool) -> Result<(), AvrError> {
        let targets: Vec<Zone> = zones.map(|z| z.to_vec()).unwrap_or_else(|| Zone::addressable().to_vec());
        let guard = self.require_session().await?;
        let session = match guard.as_ref() {
            Some(s) => s,
            None => return Err(AvrError::Unavailable),
        };
        let mut receivers = Vec::new();
        for zone in targets {
            let mut item = CommandItem::new("_refresh_zone").with_args(vec![Scalar::Zone(zone)]);
            item.skip_if_queued = Tristate::True;
            if wait {
                receivers.push(session.queue.enqueue_and_wait(item).await);
            } else {
                session.queue.enqueue(item).await;
            }
        }
        drop(guard);
        if wait {
            for rx in receivers {
                let _ = rx.await;
            }
        }
        Ok(())
    }

    /// Generic escape hatch: resolves `name` via the registry for its wire
    /// template, but `prefix`/`suffix` (when given) override the response
    /// correlation and wire suffix the registry entry would otherwise use,
    /// and `rate_limit` overrides whether this call paces against
    /// `command_delay`. Still goes through C6, so ordering and the
    /// single-outbound-frame rule hold for this call like any other.
    pub async fn send_command(
        &self,
        name: &str,
        zone: Zone,
        args: Vec<Scalar>,
        prefix: Option<&str>,
        suffix: Option<&str>,
        ignore_error: bool,
        rate_limit: bool,
    ) -> Result<Option<String>, AvrError> {
        let mut spec = {
            let registry = self.core.registry.read().unwrap_or_else(|e| e.into_inner());
            registry
                .lookup_command(name)
                .cloned()
                .ok_or_else(|| AvrError::Validation(format!("unknown command '{}'", name)))?
        };
        if let Some(prefix) = prefix {
            spec.expected_response_prefix = Some(prefix.to_string());
        }
        if let Some(suffix) = suffix {
            spec.wire_template = format!("{}{}", spec.wire_template, suffix);
        }
        spec.flags.rate_limited = rate_limit;

        let guard = self.require_session().await?;
        let session = match guard.as_ref() {
            Some(s) => s,
            None => return Err(AvrError::Unavailable),
        };
        let mut full_args = vec![Scalar::Zone(zone)];
        full_args.extend(args);
        let item = CommandItem::new(name).with_args(full_args);
        let rx = session.queue.enqueue_ad_hoc_and_wait(item, spec).await;
        drop(guard);

        match rx.await.map_err(|_| AvrError::Cancelled)? {
            Ok(v) => Ok(v),
            Err(e) if ignore_error && (e.is_avr_error() || e.is_timeout()) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bypasses C3 lookup entirely: writes `raw` verbatim through the
    /// command queue (so ordering/pacing still apply) with no expected
    /// response. Always raises on a broken link (no `ignore_error` escape
    /// hatch, per §4.8).
    pub async fn send_raw_command(&self, raw: &str) -> Result<(), AvrError> {
        let guard = self.require_session().await?;
        let session = match guard.as_ref() {
            Some(s) => s,
            None => return Err(AvrError::Unavailable),
        };
        let spec = crate::codes::CommandSpec::new(raw).fire_and_forget();
        let item = CommandItem::new(format!("raw:{}", raw));
        let rx = session.queue.enqueue_ad_hoc_and_wait(item, spec).await;
        drop(guard);
        rx.await.map_err(|_| AvrError::Cancelled)?.map(|_| ())
    }

    /// Bypasses C3 lookup entirely: writes `raw` through the command queue
    /// and awaits a response matching `response_prefix`. `rate_limit`
    /// controls whether this call paces against `command_delay`.
    pub async fn send_raw_request(
        &self,
        raw: &str,
        response_prefix: &str,
        rate_limit: bool,
    ) -> Result<String, AvrError> {
        let guard = self.require_session().await?;
        let session = match guard.as_ref() {
            Some(s) => s,
            None => return Err(AvrError::Unavailable),
        };
        let mut spec =
            crate::codes::CommandSpec::new(raw).with_response_prefix(response_prefix.to_string());
        spec.flags.rate_limited = rate_limit;
        let item = CommandItem::new(format!("raw:{}", raw));
        let rx = session.queue.enqueue_ad_hoc_and_wait(item, spec).await;
        drop(guard);

        let outcome: crate::queue::CommandOutcome = rx.await.map_err(|_| AvrError::Cancelled)?;
        outcome?.ok_or(AvrError::ResponseTimeout)
    }

    pub fn snapshot(&self) -> PropertiesSnapshot {
        self.core.properties.snapshot()
    }
}

//! C7: the updater / scheduler.
//!
//! A timer-driven task that only enqueues: it never touches the socket
//! directly. On each tick it either forces a full refresh (`always_poll`)
//! or skips the poll if an unsolicited frame already arrived since the
//! last tick, per the open-question resolution in `SPEC_FULL.md` §11
//! (reset on *every* inbound frame, not only status-bearing ones).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::model::{CommandItem, Scalar, Zone};
use crate::params::{ParamKey, Parameters};
use crate::queue::CommandQueue;

const POWER_SETTLE_DELAY_SECS: f64 = 2.5;
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Tracks which zones have completed at least one full refresh since
/// connect, so device-info queries can be deferred until Main is done.
#[derive(Default)]
pub struct InitialRefreshTracker {
    done: Mutex<HashSet<Zone>>,
}

impl InitialRefreshTracker {
    pub fn mark_done(&self, zone: Zone) {
        self.done.lock().unwrap_or_else(|e| e.into_inner()).insert(zone);
    }

    pub fn is_done(&self, zone: Zone) -> bool {
        self.done.lock().unwrap_or_else(|e| e.into_inner()).contains(&zone)
    }

    pub fn main_done(&self) -> bool {
        self.is_done(Zone::Main)
    }
}

/// The updater (C7).
pub struct Updater {
    queue: Arc<CommandQueue>,
    connection: Arc<Connection>,
    params: Arc<Parameters>,
    initial_refresh: Arc<InitialRefreshTracker>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Updater {
    pub fn new(queue: Arc<CommandQueue>, connection: Arc<Connection>, params: Arc<Parameters>) -> Self {
        Self {
            queue,
            connection,
            params,
            initial_refresh: Arc::new(InitialRefreshTracker::default()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn initial_refresh_tracker(&self) -> Arc<InitialRefreshTracker> {
        self.initial_refresh.clone()
    }

    fn scan_interval(&self) -> Duration {
        self.params
            .get(ParamKey::ScanInterval)
            .and_then(|v| v.as_float())
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_SCAN_INTERVAL)
    }

    fn always_poll(&self) -> bool {
        self.params
            .get(ParamKey::AlwaysPoll)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn disable_auto_query(&self) -> bool {
        self.params
            .get(ParamKey::DisableAutoQuery)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Spawns the periodic refresh loop. Idempotent: a second call while
    /// already running is a no-op.
    pub fn spawn(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let updater = self.clone();
        tokio::spawn(async move { updater.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut last_check = self.connection.millis_since_last_frame();
        loop {
            let interval = self.scan_interval();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("updater stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if self.always_poll() {
                self.queue.enqueue(CommandItem::new("_full_refresh")).await;
                continue;
            }

            let since_last_frame = self.connection.millis_since_last_frame();
            if since_last_frame >= interval.as_millis() as u64 {
                self.queue.enqueue(CommandItem::new("_full_refresh")).await;
            } else {
                debug!(
                    since_last_frame,
                    "skipping poll: unsolicited frame already satisfied this tick"
                );
            }
            last_check = since_last_frame;
            let _ = last_check;
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Called by the facade/reader wiring whenever `power[zone]`
    /// transitions false->true. Enqueues exactly one `_delayed_query_basic`
    /// unless `disable_auto_query` is set, per the invariant in §8.
    pub async fn on_power_transition_on(&self, zone: Zone) {
        if self.disable_auto_query() {
            return;
        }
        let item = CommandItem::new("_delayed_query_basic")
            .with_args(vec![Scalar::Float(POWER_SETTLE_DELAY_SECS)]);
        let _ = zone;
        self.queue.enqueue(item).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::codes::CodeRegistry;
    use crate::properties::Properties;
    use crate::responder::Responder;

    async fn test_updater() -> (Arc<Updater>, Arc<CommandQueue>) {
        let registry = Arc::new(std::sync::RwLock::new(CodeRegistry::new()));
        let properties = Arc::new(Properties::new());
        let params = Arc::new(Parameters::new());
        let responder = Arc::new(Responder::new(registry.clone(), properties.clone(), params.clone()));
        let connection = Arc::new(Connection::new("127.0.0.1:1", responder.clone(), properties.clone()));
        let queue = Arc::new(CommandQueue::new(connection.clone(), responder, registry, params.clone(), properties));
        let updater = Arc::new(Updater::new(queue.clone(), connection, params));
        (updater, queue)
    }

    #[tokio::test]
    async fn power_transition_enqueues_delayed_query_basic_once() {
        let (updater, queue) = test_updater().await;
        updater.on_power_transition_on(Zone::Main).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn power_transition_skipped_when_auto_query_disabled() {
        let (updater, queue) = test_updater().await;
        updater
            .params
            .set_user_param(ParamKey::DisableAutoQuery, crate::params::ParamValue::Bool(true));
        updater.on_power_transition_on(Zone::Main).await;
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn initial_refresh_tracker_tracks_main() {
        let tracker = InitialRefreshTracker::default();
        assert!(!tracker.main_done());
        tracker.mark_done(Zone::Main);
        assert!(tracker.main_done());
    }
}

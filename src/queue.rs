//! C6: the command queue.
//!
//! An ordered set of FIFO queues keyed by `queue_id`, drained by one
//! cooperative executor in round-robin order across non-empty queues and
//! strict FIFO within a queue. Handles local pseudo-commands, dedup,
//! skip-rules, and rate limiting; delegates wire I/O to C4 and response
//! correlation to C5.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codes::{CommandSpec, SharedRegistry};
use crate::connection::Connection;
use crate::error::AvrError;
use crate::model::{CommandItem, Scalar, Tristate, Zone};
use crate::params::{ParamKey, ParamValue, Parameters};
use crate::properties::SharedProperties;
use crate::responder::Responder;

/// Delay before a `_delayed_refresh_zone` re-enqueues, per §4.6.
const DELAYED_REFRESH_DELAY: Duration = Duration::from_millis(2500);
/// Settle delay before `_delayed_query_basic` fires after a power
/// off->on transition, per §4.7.
const POWER_SETTLE_DELAY: Duration = Duration::from_millis(2500);
/// Queue id reserved for delayed/local re-enqueues so they don't reorder the
/// main queue's FIFO.
const DELAYED_QUEUE_ID: i32 = 1;

struct Queues {
    /// `queue_id -> FIFO of items`. Order of keys (a `Vec` rather than a
    /// `HashMap`) establishes round-robin precedence: queues are visited in
    /// the order they were first created.
    order: Vec<i32>,
    items: HashMap<i32, VecDeque<CommandItem>>,
}

impl Queues {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            items: HashMap::new(),
        }
    }

    fn queue_mut(&mut self, queue_id: i32) -> &mut VecDeque<CommandItem> {
        if !self.items.contains_key(&queue_id) {
            self.order.push(queue_id);
        }
        self.items.entry(queue_id).or_insert_with(VecDeque::new)
    }

    fn contains_dedup(&self, queue_id: i32, item: &CommandItem) -> bool {
        self.items
            .get(&queue_id)
            .map(|q| q.iter().any(|existing| existing.dedup_eq(item)))
            .unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.items.values().map(|q| q.len()).sum()
    }

    /// Pops the next item round-robin: starting after the last-served
    /// queue, the first non-empty queue in order yields its front item.
    fn pop_round_robin(&mut self, last_served_idx: &mut usize) -> Option<CommandItem> {
        if self.order.is_empty() {
            return None;
        }
        let n = self.order.len();
        for step in 0..n {
            let idx = (*last_served_idx + step) % n;
            let qid = self.order[idx];
            if let Some(q) = self.items.get_mut(&qid) {
                if let Some(item) = q.pop_front() {
                    *last_served_idx = idx;
                    return Some(item);
                }
            }
        }
        None
    }

    fn purge(&mut self) {
        self.order.clear();
        self.items.clear();
    }
}

/// Outcome of executing one [`CommandItem`], delivered to callers who
/// `await` a specific command via [`CommandQueue::enqueue_and_wait`].
pub type CommandOutcome = Result<Option<String>, AvrError>;

struct Completion {
    slot: oneshot::Sender<CommandOutcome>,
}

/// The command queue (C6).
pub struct CommandQueue {
    queues: Mutex<Queues>,
    last_served_idx: Mutex<usize>,
    completions: Mutex<VecDeque<(CommandItem, Completion)>>,
    refreshing: Mutex<HashSet<Zone>>,
    connection: Arc<Connection>,
    responder: Arc<Responder>,
    registry: SharedRegistry,
    params: Arc<Parameters>,
    properties: SharedProperties,
    last_outbound_at: Mutex<Option<Instant>>,
    cancelled: std::sync::atomic::AtomicBool,
    delayed_queue_counter: AtomicI64,
    /// Woken by `enqueue_inner` on every successful push so the executor
    /// (`schedule`) doesn't have to busy-poll an empty queue.
    item_available: Notify,
    /// Cancelled by `stop_schedule` to end the executor's loop without
    /// tearing down the queue's state (still readable via `commands`/`len`
    /// after the executor stops).
    scheduler_shutdown: CancellationToken,
    scheduler_running: AtomicBool,
    /// Zones that have completed at least one full refresh since connect,
    /// mirrored into the `ZonesInitialRefresh` runtime parameter whenever it
    /// changes. Set by the facade after construction; left unset in
    /// standalone tests that don't exercise the initial-refresh gate.
    initial_refresh: std::sync::Mutex<Option<Arc<crate::updater::InitialRefreshTracker>>>,
    /// Per-call spec overrides for `send_command`'s prefix/suffix/rate_limit
    /// escape hatch (§4.8). Matched against the queued item by dedup key and
    /// consumed once, ahead of the registry lookup, so a single call can
    /// override response correlation without mutating the shared (read-only)
    /// command table.
    ad_hoc: Mutex<Vec<(CommandItem, CommandSpec)>>,
}

impl CommandQueue {
    pub fn new(
        connection: Arc<Connection>,
        responder: Arc<Responder>,
        registry: SharedRegistry,
        params: Arc<Parameters>,
        properties: SharedProperties,
    ) -> Self {
        Self {
            queues: Mutex::new(Queues::new()),
            last_served_idx: Mutex::new(0),
            completions: Mutex::new(VecDeque::new()),
            refreshing: Mutex::new(HashSet::new()),
            connection,
            responder,
            registry,
            params,
            properties,
            last_outbound_at: Mutex::new(None),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            delayed_queue_counter: AtomicI64::new(DELAYED_QUEUE_ID),
            item_available: Notify::new(),
            scheduler_shutdown: CancellationToken::new(),
            scheduler_running: AtomicBool::new(false),
            initial_refresh: std::sync::Mutex::new(None),
            ad_hoc: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues `item` to run against `spec` instead of a registry lookup,
    /// for callers (the facade's `send_command`/raw escape hatches) that
    /// need to override the expected response prefix or opt out of pacing
    /// for a single call.
    pub async fn enqueue_ad_hoc_and_wait(
        &self,
        item: CommandItem,
        spec: CommandSpec,
    ) -> oneshot::Receiver<CommandOutcome> {
        self.ad_hoc.lock().await.push((item.clone(), spec));
        self.enqueue_and_wait(item).await
    }

    /// Wires the initial-refresh tracker owned by C7. `_refresh_zone`
    /// completions mark the zone done here and mirror the updated set into
    /// the `ZonesInitialRefresh` runtime parameter.
    pub fn set_initial_refresh_tracker(&self, tracker: Arc<crate::updater::InitialRefreshTracker>) {
        *self.initial_refresh.lock().unwrap_or_else(|e| e.into_inner()) = Some(tracker);
    }

    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Evaluates skip rules against current queue contents and connection
    /// state, then enqueues. Returns `true` if the item was actually
    /// enqueued (`false` if skipped).
    pub async fn enqueue(&self, item: CommandItem) -> bool {
        self.enqueue_inner(item, None).await.is_some()
    }

    /// Enqueues and returns a receiver that resolves when the item
    /// completes (or is skipped, in which case the receiver is dropped
    /// immediately and awaiting it yields `Cancelled`).
    pub async fn enqueue_and_wait(&self, item: CommandItem) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.enqueue_inner(item, Some(tx)).await.is_none() {
            // Skipped: rx's sender was dropped inside enqueue_inner already.
        }
        rx
    }

    async fn enqueue_inner(
        &self,
        item: CommandItem,
        completion: Option<oneshot::Sender<CommandOutcome>>,
    ) -> Option<()> {
        let skip_starting = item.skip_if_starting.resolve(false);
        let skip_queued = item.skip_if_queued.resolve(false);
        let skip_refreshing = item.skip_if_refreshing.resolve(false);

        if skip_starting && !self.connection.available() {
            debug!(name = %item.name, "skipped: connection not ready and skip_if_starting set");
            return None;
        }

        if skip_refreshing {
            if let Some(zone) = single_zone_arg(&item) {
                if self.refreshing.lock().await.contains(&zone) {
                    debug!(name = %item.name, ?zone, "skipped: refresh already pending for zone");
                    return None;
                }
            }
        }

        {
            let mut queues = self.queues.lock().await;
            if skip_queued && queues.contains_dedup(item.queue_id, &item) {
                debug!(name = %item.name, "skipped: equal item already queued");
                return None;
            }
            let q = queues.queue_mut(item.queue_id);
            match item.insert_at {
                Some(idx) if idx >= 0 => {
                    let idx = (idx as usize).min(q.len());
                    q.insert(idx, item.clone());
                }
                Some(idx) => {
                    let offset = (-idx) as usize;
                    let idx = q.len().saturating_sub(offset);
                    q.insert(idx, item.clone());
                }
                None => q.push_back(item.clone()),
            }
        }

        if item.name == "_refresh_zone" || item.name == "_delayed_refresh_zone" {
            if let Some(zone) = single_zone_arg(&item) {
                self.refreshing.lock().await.insert(zone);
            }
        }

        if let Some(tx) = completion {
            self.completions.lock().await.push_back((item, Completion { slot: tx }));
        }
        self.item_available.notify_one();
        Some(())
    }

    pub async fn extend(&self, items: Vec<CommandItem>) {
        for item in items {
            self.enqueue(item).await;
        }
    }

    /// Drops all queues and fails any in-flight waiter with `Cancelled`.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.queues.lock().await.purge();
        self.responder.cancel_all();
        let mut completions = self.completions.lock().await;
        for (_, completion) in completions.drain(..) {
            if completion.slot.send(Err(AvrError::Cancelled)).is_err() {
                debug!("completion receiver dropped before cancel notice");
            }
        }
        drop(completions);
        self.item_available.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Starts the executor that drives the queue: a background task
    /// looping `run_once`, idling on `item_available` between rounds
    /// instead of busy-polling. Idempotent: a second call while already
    /// running is a no-op, mirroring `Updater::spawn`.
    pub fn schedule(self: &Arc<Self>) {
        if self.scheduler_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move { queue.run_scheduler().await });
    }

    async fn run_scheduler(self: Arc<Self>) {
        loop {
            if self.scheduler_shutdown.is_cancelled() {
                debug!("command queue executor stopped");
                return;
            }
            if self.run_once().await {
                continue;
            }
            tokio::select! {
                _ = self.scheduler_shutdown.cancelled() => {
                    debug!("command queue executor stopped");
                    return;
                }
                _ = self.item_available.notified() => {}
            }
        }
    }

    /// Stops the executor started by `schedule`. Does not purge queued
    /// items or fail outstanding waiters; pair with `cancel` for a full
    /// teardown.
    pub fn stop_schedule(&self) {
        self.scheduler_shutdown.cancel();
    }

    /// Blocks until the queue has no pending items left to run. Used by
    /// callers that need to know the executor has drained everything
    /// enqueued so far (§4.6).
    pub async fn wait(&self) {
        loop {
            if self.len().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Snapshots every item currently queued, in round-robin serving order,
    /// for introspection (§4.6). Does not include items already popped and
    /// mid-execution.
    pub async fn commands(&self) -> Vec<CommandItem> {
        let queues = self.queues.lock().await;
        let idx = *self.last_served_idx.lock().await;
        let mut out = Vec::new();
        if queues.order.is_empty() {
            return out;
        }
        let n = queues.order.len();
        for step in 0..n {
            let qid = queues.order[(idx + step) % n];
            if let Some(q) = queues.items.get(&qid) {
                out.extend(q.iter().cloned());
            }
        }
        out
    }

    /// Runs one round of the executor: pops the next item (round-robin
    /// across non-empty queues), executes it, and completes its waiter if
    /// any. Returns `false` when there was nothing to execute.
    pub async fn run_once(self: &Arc<Self>) -> bool {
        let item = {
            let mut queues = self.queues.lock().await;
            let mut idx = self.last_served_idx.lock().await;
            queues.pop_round_robin(&mut idx)
        };
        let Some(item) = item else { return false };

        let outcome = self.execute(&item).await;

        let mut completions = self.completions.lock().await;
        if let Some(pos) = completions.iter().position(|(i, _)| i.dedup_eq(&item)) {
            if let Some((_, completion)) = completions.remove(pos) {
                if completion.slot.send(outcome).is_err() {
                    debug!("completion receiver dropped before command finished");
                }
            }
        }
        true
    }

    async fn execute(self: &Arc<Self>, item: &CommandItem) -> CommandOutcome {
        if item.is_local() {
            return self.execute_local(item).await;
        }

        let ad_hoc_spec = {
            let mut ad_hoc = self.ad_hoc.lock().await;
            ad_hoc
                .iter()
                .position(|(i, _)| i.dedup_eq(item))
                .map(|pos| ad_hoc.remove(pos).1)
        };

        let spec = match ad_hoc_spec {
            Some(spec) => spec,
            None => {
                let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
                match registry.lookup_command(&item.name) {
                    Some(spec) => spec.clone(),
                    None => {
                        return Err(AvrError::Validation(format!("unknown command '{}'", item.name)));
                    }
                }
            }
        };

        let zone = single_zone_arg(item).unwrap_or(Zone::Main);
        let frame = spec.render(zone, &item.args)?;

        if spec.flags.rate_limited {
            self.pace().await;
        }

        let waiter = spec
            .expected_response_prefix
            .as_ref()
            .map(|prefix| self.responder.register_waiter(prefix.clone()));

        self.connection.write_frame(&frame).await?;
        *self.last_outbound_at.lock().await = Some(Instant::now());

        match waiter {
            Some(rx) => {
                let deadline = self
                    .params
                    .get(ParamKey::Timeout)
                    .and_then(|v| v.as_float())
                    .map(Duration::from_secs_f64)
                    .unwrap_or(self.connection.timeout().await);
                self.responder.await_waiter(rx, deadline).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn pace(&self) {
        let delay = self
            .params
            .get(ParamKey::CommandDelay)
            .and_then(|v| v.as_float())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_millis(60));

        let last = *self.last_outbound_at.lock().await;
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
    }

    async fn execute_local(self: &Arc<Self>, item: &CommandItem) -> CommandOutcome {
        match item.name.as_str() {
            "_full_refresh" => {
                for zone in Zone::addressable() {
                    let refresh = CommandItem::new("_refresh_zone").with_args(vec![Scalar::Zone(zone)]);
                    self.enqueue(refresh).await;
                }
                Ok(None)
            }
            "_refresh_zone" => {
                if let Some(zone) = single_zone_arg(item) {
                    self.refreshing.lock().await.remove(&zone);
                    debug!(?zone, "refresh_zone executed");
                    let tracker = self
                        .initial_refresh
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    if let Some(tracker) = tracker {
                        tracker.mark_done(zone);
                        let done: Vec<Zone> = Zone::addressable()
                            .into_iter()
                            .filter(|z| tracker.is_done(*z))
                            .collect();
                        self.params.set_runtime(
                            ParamKey::ZonesInitialRefresh,
                            crate::params::ParamValue::StrList(
                                done.iter().map(|z| z.label().to_string()).collect(),
                            ),
                        );
                    }
                }
                Ok(None)
            }
            "_delayed_refresh_zone" => {
                if let Some(zone) = single_zone_arg(item) {
                    let queue = self.clone();
                    let delayed_id = self.delayed_queue_counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        tokio::time::sleep(DELAYED_REFRESH_DELAY).await;
                        let refresh = CommandItem::new("_refresh_zone")
                            .with_args(vec![Scalar::Zone(zone)])
                            .with_queue(delayed_id);
                        queue.enqueue(refresh).await;
                    });
                }
                Ok(None)
            }
            "_delayed_query_basic" => {
                if self
                    .params
                    .get(ParamKey::DisableAutoQuery)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                let delay = item
                    .args
                    .first()
                    .and_then(|a| match a {
                        Scalar::Float(v) => Some(Duration::from_secs_f64(*v)),
                        Scalar::Int(v) => Some(Duration::from_secs(*v as u64)),
                        _ => None,
                    })
                    .unwrap_or(POWER_SETTLE_DELAY);
                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.enqueue(CommandItem::new("_full_refresh")).await;
                });
                Ok(None)
            }
            "_update_listening_modes" => {
                self.properties.update_listening_modes();
                Ok(None)
            }
            "_calculate_am_frequency_step" => {
                // AM tuning grids are either 9 kHz (Europe/Asia) or 10 kHz
                // (North America); the AVR never reports which one it
                // uses. Both grids anchor at 0 kHz, so an observed AM
                // frequency that isn't a multiple of 10 must be on the
                // 9 kHz grid. A frequency that happens to divide evenly by
                // both (e.g. 990) is left as the existing default.
                if let Some(khz) = self
                    .properties
                    .get_topic("tuner", "am_frequency")
                    .and_then(|v| v.parse::<f64>().ok())
                {
                    let step = if (khz % 10.0).abs() > f64::EPSILON { 9.0 } else { 10.0 };
                    self.params.set_runtime(ParamKey::AmFrequencyStep, ParamValue::Float(step));
                }
                Ok(None)
            }
            "_sleep" => {
                let delay = item
                    .args
                    .first()
                    .and_then(|a| match a {
                        Scalar::Float(v) => Some(Duration::from_secs_f64(*v)),
                        Scalar::Int(v) => Some(Duration::from_secs(*v as u64)),
                        _ => None,
                    })
                    .unwrap_or(Duration::from_millis(0));
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            other => {
                warn!(command = other, "unknown local pseudo-command");
                Err(AvrError::Validation(format!("unknown local command '{}'", other)))
            }
        }
    }
}

fn single_zone_arg(item: &CommandItem) -> Option<Zone> {
    item.args.iter().find_map(|a| match a {
        Scalar::Zone(z) => Some(*z),
        _ => None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::codes::CodeRegistry;
    use crate::properties::Properties;

    async fn test_queue() -> Arc<CommandQueue> {
        let registry = Arc::new(std::sync::RwLock::new(CodeRegistry::new()));
        let properties = Arc::new(Properties::new());
        let params = Arc::new(Parameters::new());
        let responder = Arc::new(Responder::new(registry.clone(), properties.clone(), params.clone()));
        let connection = Arc::new(Connection::new("127.0.0.1:1", responder.clone(), properties.clone()));
        Arc::new(CommandQueue::new(connection, responder, registry, params, properties))
    }

    #[tokio::test]
    async fn skip_if_queued_keeps_length_unchanged() {
        let queue = test_queue().await;
        let mut item = CommandItem::new("PF")
            .with_args(vec![Scalar::Zone(Zone::Main)]);
        item.skip_if_queued = Tristate::True;

        assert!(queue.enqueue(item.clone()).await);
        assert_eq!(queue.len().await, 1);
        assert!(!queue.enqueue(item).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn full_refresh_enqueues_all_zones() {
        let queue = test_queue().await;
        queue.enqueue(CommandItem::new("_full_refresh")).await;
        assert!(queue.run_once().await);
        assert_eq!(queue.len().await, 4);
    }

    #[tokio::test]
    async fn dedup_on_refresh_zone() {
        let queue = test_queue().await;
        let mut item = CommandItem::new("_refresh_zone").with_args(vec![Scalar::Zone(Zone::Z2)]);
        item.skip_if_queued = Tristate::True;
        assert!(queue.enqueue(item.clone()).await);
        assert!(!queue.enqueue(item).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn rate_limited_false_skips_pacing() {
        use crate::codes::CommandSpec;

        let mut registry = CodeRegistry::new();
        registry.register_command("FAST", CommandSpec::new("FAST").fire_and_forget().rate_unlimited());
        let registry = Arc::new(std::sync::RwLock::new(registry));
        let properties = Arc::new(Properties::new());
        let params = Arc::new(Parameters::new());
        params.set_user_param(ParamKey::CommandDelay, crate::params::ParamValue::Float(5.0));
        let responder = Arc::new(Responder::new(registry.clone(), properties.clone(), params.clone()));
        let connection = Arc::new(Connection::new("127.0.0.1:1", responder.clone(), properties.clone()));
        let queue = Arc::new(CommandQueue::new(connection, responder, registry, params, properties));

        queue.enqueue(CommandItem::new("FAST")).await;
        queue.enqueue(CommandItem::new("FAST")).await;
        let start = std::time::Instant::now();
        assert!(queue.run_once().await);
        assert!(queue.run_once().await);
        // A 5s command_delay would make this test time out if pacing were
        // (incorrectly) applied to a rate_unlimited() command.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancel_fails_pending_waiters() {
        let queue = test_queue().await;
        let rx = queue.enqueue_and_wait(CommandItem::new("PF")).await;
        queue.cancel().await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(AvrError::Cancelled)));
    }

    #[tokio::test]
    async fn schedule_drives_enqueued_commands_to_completion() {
        let queue = test_queue().await;
        queue.schedule();
        let rx = queue.enqueue_and_wait(CommandItem::new("_sleep")).await;
        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
        queue.stop_schedule();
    }

    #[tokio::test]
    async fn wait_returns_once_queue_drains() {
        let queue = test_queue().await;
        queue.schedule();
        queue.enqueue(CommandItem::new("_sleep")).await;
        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .unwrap();
        assert_eq!(queue.len().await, 0);
        queue.stop_schedule();
    }

    #[tokio::test]
    async fn commands_snapshots_queued_items_without_consuming_them() {
        let queue = test_queue().await;
        queue.enqueue(CommandItem::new("PF").with_args(vec![Scalar::Zone(Zone::Main)])).await;
        queue.enqueue(CommandItem::new("PO").with_args(vec![Scalar::Zone(Zone::Main)])).await;
        let snapshot = queue.commands().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_command_is_validation_error() {
        let queue = test_queue().await;
        let rx = queue.enqueue_and_wait(CommandItem::new("NOPE")).await;
        assert!(queue.run_once().await);
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(AvrError::Validation(_))));
    }
}

//! C5: the responder / correlator.
//!
//! Classifies every inbound frame: AVR error tokens fulfill the oldest
//! outstanding waiter as an error; otherwise the frame is offered to
//! outstanding waiters in FIFO order, and the first whose expected prefix
//! matches consumes it. Regardless of consumption the frame is always also
//! submitted to the decoder registry (C3), whose match updates the
//! property cache (C2) and reports the touched zones.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codes::SharedRegistry;
use crate::error::AvrError;
use crate::model::Zone;
use crate::params::Parameters;
use crate::properties::Properties;

/// Matches an `E0[1-6]` AVR error token at the start of a line.
fn avr_error_code(line: &str) -> Option<&str> {
    if line.len() >= 3 && line.as_bytes()[0] == b'E' && line.as_bytes()[1].is_ascii_digit() {
        let code = &line[0..3];
        if code.as_bytes()[2].is_ascii_digit() && matches!(&code[1..3], "01" | "02" | "03" | "04" | "05" | "06")
        {
            return Some(code);
        }
    }
    None
}

/// Outcome delivered to a waiting command execution.
#[derive(Debug)]
pub enum WaitOutcome {
    Matched(String),
    AvrError(String),
    Disconnected,
    /// Sent by `cancel_all` when the command queue is explicitly torn down
    /// (via `CommandQueue::cancel`), distinct from an unsolicited link drop.
    Cancelled,
}

struct Waiter {
    /// `None` for requests with no expected response (shouldn't normally be
    /// registered, since fire-and-forget commands don't wait, but kept for
    /// symmetry with `send_raw_request`, which always expects a prefix).
    prefix: String,
    slot: oneshot::Sender<WaitOutcome>,
}

/// The ordered list of outstanding waiters, oldest first. At most one
/// waiter per prefix is permitted by construction (the command queue
/// enforces this by never issuing a second command with an in-flight
/// prefix).
struct PendingList {
    waiters: VecDeque<Waiter>,
}

impl PendingList {
    fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }
}

/// The responder/correlator (C5).
pub struct Responder {
    pending: Mutex<PendingList>,
    registry: SharedRegistry,
    properties: crate::properties::SharedProperties,
    params: std::sync::Arc<Parameters>,
}

impl Responder {
    pub fn new(
        registry: SharedRegistry,
        properties: crate::properties::SharedProperties,
        params: std::sync::Arc<Parameters>,
    ) -> Self {
        Self {
            pending: Mutex::new(PendingList::new()),
            registry,
            properties,
            params,
        }
    }

    /// Registers a waiter for `prefix` and returns a receiver that resolves
    /// once a matching frame (or an AVR error, or a disconnect) arrives.
    /// Panics (via a logged return of [`AvrError::Validation`]) would be
    /// wrong here: the command queue is responsible for the single-waiter-
    /// per-prefix invariant, so this simply registers.
    pub fn register_waiter(&self, prefix: impl Into<String>) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let prefix = prefix.into();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .push_back(Waiter { prefix, slot: tx });
        rx
    }

    pub async fn await_waiter(
        &self,
        rx: oneshot::Receiver<WaitOutcome>,
        deadline: Duration,
    ) -> Result<String, AvrError> {
        match timeout(deadline, rx).await {
            Ok(Ok(WaitOutcome::Matched(s))) => Ok(s),
            Ok(Ok(WaitOutcome::AvrError(code))) => Err(AvrError::Avr(code)),
            Ok(Ok(WaitOutcome::Disconnected)) => Err(AvrError::ConnectionFailure(
                "session disconnected while awaiting response".to_string(),
            )),
            Ok(Ok(WaitOutcome::Cancelled)) => Err(AvrError::Cancelled),
            Ok(Err(_recv_dropped)) => Err(AvrError::Cancelled),
            Err(_elapsed) => Err(AvrError::ResponseTimeout),
        }
    }

    /// Fails every outstanding waiter with a disconnect outcome. Called by
    /// C4 when the link drops.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for waiter in pending.waiters.drain(..) {
            if waiter.slot.send(WaitOutcome::Disconnected).is_err() {
                debug!("waiter receiver already dropped during fail_all");
            }
        }
    }

    /// Fails every outstanding waiter with cancellation. Called by C6's
    /// `cancel()`.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for waiter in pending.waiters.drain(..) {
            if waiter.slot.send(WaitOutcome::Cancelled).is_err() {
                debug!("waiter receiver already dropped during cancel_all");
            }
        }
    }

    /// Classifies one inbound frame per §4.5 and applies it to the decoder
    /// registry. Returns the zones touched by the matching decoder, if any,
    /// so the caller (the reader task) can flush [`Properties`] observers.
    pub fn handle_frame(&self, line: &str) -> Vec<Zone> {
        if let Some(code) = avr_error_code(line) {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let idx = pending.waiters.iter().position(|w| !w.prefix.is_empty());
            match idx.and_then(|idx| pending.waiters.remove(idx)) {
                Some(waiter) => {
                    drop(pending);
                    if waiter.slot.send(WaitOutcome::AvrError(code.to_string())).is_err() {
                        debug!("waiter receiver dropped before AVR error delivery");
                    }
                }
                None => warn!(code, "AVR error with no outstanding waiter"),
            }
            return Vec::new();
        }

        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let idx = pending
                .waiters
                .iter()
                .position(|w| !w.prefix.is_empty() && line.starts_with(w.prefix.as_str()));
            if let Some(waiter) = idx.and_then(|idx| pending.waiters.remove(idx)) {
                drop(pending);
                let suffix = line[waiter.prefix.len()..].to_string();
                if waiter.slot.send(WaitOutcome::Matched(suffix)).is_err() {
                    debug!("waiter receiver dropped before match delivery");
                }
            }
        }

        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        match registry.find_decoder(line) {
            Some((decoder, rest)) => {
                let decoder = decoder.clone();
                drop(registry);
                decoder.decode(rest, &self.properties, &self.params)
            }
            None => {
                debug!(line, "no decoder matched inbound frame");
                Vec::new()
            }
        }
    }
}

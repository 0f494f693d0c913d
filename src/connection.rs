//! C4: the connection.
//!
//! Owns a single TCP socket and exactly two cooperating tasks — a reader
//! and a writer — plus a reconnect supervisor. Framing is `\r\n`-delimited
//! ASCII; outbound frames are written one at a time by whichever caller
//! holds the write lock (enforced by the command queue's single-outbound
//! rule, C6). Reconnection runs an exponential backoff schedule capped at
//! 64s, reset whenever the session reaches `Ready`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AvrError;
use crate::properties::SharedProperties;
use crate::responder::Responder;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(64);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle time before the OS starts probing a quiet AVR link, per §4.4.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Starting,
    Ready,
    Disconnecting,
    Reconnecting,
    Shutdown,
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    write_half: AsyncMutex<Option<OwnedWriteHalf>>,
    responder: Arc<Responder>,
    properties: SharedProperties,
    reconnect: AtomicBool,
    shutdown: CancellationToken,
    /// Millis since [`Shared::epoch`] of the last inbound frame, solicited
    /// or not — used by the updater to decide whether an unsolicited frame
    /// already satisfied this tick's poll.
    last_frame_millis: AtomicU64,
    epoch: std::time::Instant,
    timeout: AsyncMutex<Duration>,
}

impl Shared {
    fn bump_last_frame(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_frame_millis.store(millis, Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state_tx.send(state).is_err() {
            debug!("no subscribers for connection state change");
        }
    }
}

/// The connection (C4).
pub struct Connection {
    addr: String,
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(addr: impl Into<String>, responder: Arc<Responder>, properties: SharedProperties) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            addr: addr.into(),
            shared: Arc::new(Shared {
                state_tx,
                write_half: AsyncMutex::new(None),
                responder,
                properties,
                reconnect: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                last_frame_millis: AtomicU64::new(0),
                epoch: std::time::Instant::now(),
                timeout: AsyncMutex::new(DEFAULT_TIMEOUT),
            }),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn available(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Millis elapsed since the last inbound frame of any kind.
    pub fn millis_since_last_frame(&self) -> u64 {
        let now = self.shared.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(self.shared.last_frame_millis.load(Ordering::Relaxed))
    }

    pub async fn set_timeout(&self, d: Duration) {
        *self.shared.timeout.lock().await = d;
    }

    pub async fn timeout(&self) -> Duration {
        *self.shared.timeout.lock().await
    }

    /// Starts the state machine. Raises [`AvrError::ConnectionFailure`]
    /// synchronously only if the initial dial fails and `reconnect` is
    /// false; otherwise returns immediately and the reconnect supervisor
    /// keeps retrying in the background.
    pub async fn connect(self: &Arc<Self>, reconnect: bool) -> Result<(), AvrError> {
        self.shared.reconnect.store(reconnect, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);

        match self.dial_and_spawn_reader().await {
            Ok(()) => {
                let conn = self.clone();
                tokio::spawn(async move { conn.supervise().await });
                Ok(())
            }
            Err(e) => {
                if reconnect {
                    warn!(error = %e, "initial dial failed, reconnect enabled, retrying in background");
                    self.shared.set_state(ConnectionState::Reconnecting);
                    let conn = self.clone();
                    tokio::spawn(async move { conn.supervise().await });
                    Ok(())
                } else {
                    self.shared.set_state(ConnectionState::Disconnected);
                    Err(e)
                }
            }
        }
    }

    async fn dial_and_spawn_reader(self: &Arc<Self>) -> Result<(), AvrError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| AvrError::ConnectionFailure(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AvrError::ConnectionFailure(e.to_string()))?;
        SockRef::from(&stream)
            .set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))
            .map_err(|e| AvrError::ConnectionFailure(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        *self.shared.write_half.lock().await = Some(write_half);
        self.shared.set_state(ConnectionState::Starting);

        let conn = self.clone();
        tokio::spawn(async move { conn.read_loop(read_half).await });
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, read_half: tokio::net::tcp::OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        let mut first_frame_seen = false;
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => {
                    debug!("read loop cancelled by shutdown");
                    return;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => {
                            let frame = raw.trim_end_matches('\r');
                            if frame.is_empty() {
                                continue;
                            }
                            self.shared.bump_last_frame();
                            if !first_frame_seen {
                                first_frame_seen = true;
                                self.shared.set_state(ConnectionState::Ready);
                                info!("AVR session ready");
                            }
                            let touched = self.shared.responder.handle_frame(frame);
                            if !touched.is_empty() {
                                self.shared.properties.flush();
                            }
                        }
                        Ok(None) => {
                            warn!("AVR closed the connection (EOF)");
                            self.on_link_failure().await;
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "read error on AVR connection");
                            self.on_link_failure().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn on_link_failure(&self) {
        self.shared.responder.fail_all();
        *self.shared.write_half.lock().await = None;
        if self.shared.shutdown.is_cancelled() {
            self.shared.set_state(ConnectionState::Shutdown);
        } else if self.shared.reconnect.load(Ordering::SeqCst) {
            self.shared.set_state(ConnectionState::Reconnecting);
        } else {
            self.shared.set_state(ConnectionState::Disconnected);
        }
    }

    /// Exponential backoff loop: 1s, 2s, 4s, 8s, ... capped at 64s, reset
    /// once the session reaches `Ready` again.
    async fn supervise(self: Arc<Self>) {
        let mut delay = INITIAL_BACKOFF;
        loop {
            if self.shared.shutdown.is_cancelled() {
                return;
            }
            if self.state() == ConnectionState::Ready {
                delay = INITIAL_BACKOFF;
            }
            if !matches!(
                self.state(),
                ConnectionState::Reconnecting | ConnectionState::Disconnected
            ) {
                // Connected/starting/ready: nothing to supervise right now,
                // just wait for a state change.
                let mut rx = self.subscribe_state();
                tokio::select! {
                    _ = self.shared.shutdown.cancelled() => return,
                    _ = rx.changed() => continue,
                }
            }
            if !self.shared.reconnect.load(Ordering::SeqCst) {
                return;
            }

            info!(?delay, "reconnecting to AVR");
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.dial_and_spawn_reader().await {
                Ok(()) => {
                    delay = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(error = %e, ?delay, "reconnect attempt failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Gracefully closes the link. `reconnect` toggles future supervisor
    /// behavior (a `disconnect(true)` followed by a later link drop would
    /// still reconnect; `disconnect(false)` will not).
    pub async fn disconnect(&self, reconnect: bool) {
        self.shared.set_state(ConnectionState::Disconnecting);
        self.shared.reconnect.store(reconnect, Ordering::SeqCst);
        self.shared.responder.fail_all();
        *self.shared.write_half.lock().await = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Closes the link and forbids all future connects. Terminal.
    pub async fn shutdown(&self) {
        self.shared.reconnect.store(false, Ordering::SeqCst);
        self.shared.shutdown.cancel();
        self.shared.responder.fail_all();
        *self.shared.write_half.lock().await = None;
        self.shared.set_state(ConnectionState::Shutdown);
    }

    /// Writes one frame (appending `\r\n`). The command queue is
    /// responsible for ensuring only one frame is outbound at a time; this
    /// only serializes against concurrent callers at the socket level.
    pub async fn write_frame(&self, frame: &str) -> Result<(), AvrError> {
        if self.state() != ConnectionState::Ready && self.state() != ConnectionState::Starting {
            return Err(AvrError::Unavailable);
        }

        // Take the write half out from behind the lock before the socket
        // write so the lock is never held across an await point, then put
        // it back once the write completes.
        let taken = self.shared.write_half.lock().await.take();
        let mut write_half = match taken {
            Some(write_half) => write_half,
            None => return Err(AvrError::Unavailable),
        };

        let mut bytes = frame.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        let write_result = write_half.write_all(&bytes).await;

        match write_result {
            Ok(()) => {
                *self.shared.write_half.lock().await = Some(write_half);
                debug!(frame, "wrote frame to AVR");
                Ok(())
            }
            Err(e) => {
                self.on_link_failure().await;
                Err(AvrError::ConnectionFailure(e.to_string()))
            }
        }
    }
}

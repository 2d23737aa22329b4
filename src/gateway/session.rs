//! Gateway session management
//!
//! Owns the single TCP connection to the brokerage gateway. State machine
//! with well-defined transitions, graded heartbeat supervision, capped
//! exponential reconnect backoff, and client-id negotiation on handshake.
//! Everything else reaches the gateway through `with_session`.

use crate::config::GatewayConfig;
use crate::errors::{CoreError, CoreResult};
use crate::gateway::broker::RequestBroker;
use crate::gateway::health::ConnectionHealth;
use crate::gateway::wire::{
    classify_error_code, decode_event, encode_frame, ErrorSeverity, GatewayEvent, GatewayRequest,
    CODE_CLIENT_ID_IN_USE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// One heartbeat strike; recovers on the next good heartbeat.
    Degraded,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Graded response to consecutive heartbeat misses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Log and mark degraded; no behaviour change.
    Warning,
    /// Drop and reconnect, preserving subscriptions.
    SoftReconnect,
    /// Drop, reset the request-id allocator, re-register listeners.
    HardReconnect,
}

/// Strike 1 warns, strike 2 soft-reconnects, strike 3 and beyond
/// hard-reconnects.
pub fn heartbeat_action(strikes: u32) -> HeartbeatAction {
    match strikes {
        0 | 1 => HeartbeatAction::Warning,
        2 => HeartbeatAction::SoftReconnect,
        _ => HeartbeatAction::HardReconnect,
    }
}

/// Capped exponential backoff: 2s, 4s, 8s, 16s, then 30s forever.
pub fn reconnect_backoff_ms(attempt: u32) -> u64 {
    const TABLE: [u64; 4] = [2_000, 4_000, 8_000, 16_000];
    TABLE.get(attempt as usize).copied().unwrap_or(30_000)
}

/// Why the connected phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectedExit {
    /// Transport closed or a fatal stream error.
    Remote,
    SoftReconnect,
    HardReconnect,
    Closed,
}

/// A write handle plus a freshly assigned request id
pub struct SessionChannel {
    req_id: i64,
    tx: mpsc::UnboundedSender<GatewayRequest>,
}

impl SessionChannel {
    pub fn req_id(&self) -> i64 {
        self.req_id
    }

    pub fn send(&self, request: GatewayRequest) -> CoreResult<()> {
        self.tx
            .send(request)
            .map_err(|_| CoreError::SessionDropped)
    }
}

/// A live news-bulletin stream. Dropping it cancels at the gateway.
pub struct NewsStream {
    req_id: i64,
    subscription: crate::gateway::broker::EventSubscription,
    session: Arc<SessionManager>,
}

impl NewsStream {
    /// Next bulletin; `None` once the session drops.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        self.subscription.next().await
    }
}

impl Drop for NewsStream {
    fn drop(&mut self) {
        let request = GatewayRequest::ReqNewsBulletins {
            req_id: self.req_id,
        };
        self.session.forget_subscription(&request);
        let _ = self.session.send(GatewayRequest::CancelNewsBulletins {
            req_id: self.req_id,
        });
    }
}

/// Owner of the one live gateway connection
pub struct SessionManager {
    config: GatewayConfig,
    broker: Arc<RequestBroker>,
    health: Arc<ConnectionHealth>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    writer: Mutex<Option<mpsc::UnboundedSender<GatewayRequest>>>,
    /// Next order id; seeded from the handshake ack.
    order_ids: AtomicI64,
    hb_strikes: AtomicU32,
    /// Backoff override installed by gateway code 1100.
    backoff_override_ms: Mutex<Option<u64>>,
    /// Subscriptions replayed after every reconnect.
    resubscribe: Mutex<Vec<GatewayRequest>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl SessionManager {
    pub fn new(config: GatewayConfig, broker: Arc<RequestBroker>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            config,
            broker,
            health: Arc::new(ConnectionHealth::new()),
            state_tx,
            state_rx,
            writer: Mutex::new(None),
            order_ids: AtomicI64::new(1),
            hb_strikes: AtomicU32::new(0),
            backoff_override_ms: Mutex::new(None),
            resubscribe: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn health(&self) -> Arc<ConnectionHealth> {
        Arc::clone(&self.health)
    }

    pub fn broker(&self) -> Arc<RequestBroker> {
        Arc::clone(&self.broker)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Allocate the next gateway order id.
    pub fn next_order_id(&self) -> i64 {
        self.order_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate `count` consecutive order ids, returning the first.
    pub fn allocate_order_ids(&self, count: i64) -> i64 {
        self.order_ids.fetch_add(count, Ordering::SeqCst)
    }

    /// Remember a subscription request so it is replayed after reconnects.
    pub fn remember_subscription(&self, request: GatewayRequest) {
        self.resubscribe.lock().push(request);
    }

    pub fn forget_subscription(&self, request: &GatewayRequest) {
        self.resubscribe.lock().retain(|r| r != request);
    }

    /// Subscribe to the untagged news-bulletin stream. The gateway-side
    /// subscription is replayed on reconnect; dropping or cancelling the
    /// returned stream forwards the cancel to the gateway.
    pub async fn subscribe_news(
        self: &Arc<Self>,
        wait_timeout: Duration,
    ) -> CoreResult<NewsStream> {
        let channel = self.with_session(wait_timeout).await?;
        let req_id = channel.req_id();
        let subscription = self
            .broker
            .subscribe(|event| matches!(event, GatewayEvent::NewsBulletin { .. }));
        let request = GatewayRequest::ReqNewsBulletins { req_id };
        self.remember_subscription(request.clone());
        channel.send(request)?;
        Ok(NewsStream {
            req_id,
            subscription,
            session: Arc::clone(self),
        })
    }

    /// Wait for a live session, then hand back a write channel with a
    /// fresh request id. Cancellation surfaces through the broker when
    /// the session drops mid-request.
    pub async fn with_session(&self, wait_timeout: Duration) -> CoreResult<SessionChannel> {
        let deadline = Instant::now() + wait_timeout;
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            match state {
                SessionState::Connected | SessionState::Degraded => break,
                SessionState::Closed => {
                    return Err(CoreError::SessionUnavailable("session closed".into()))
                }
                _ => {}
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    CoreError::SessionUnavailable("gateway unreachable after backoff".into())
                })?;
            tokio::time::timeout(remaining, rx.changed())
                .await
                .map_err(|_| {
                    CoreError::SessionUnavailable("gateway unreachable after backoff".into())
                })?
                .map_err(|_| CoreError::SessionUnavailable("session task gone".into()))?;
        }

        let tx = self
            .writer
            .lock()
            .clone()
            .ok_or_else(|| CoreError::SessionUnavailable("no live writer".into()))?;
        Ok(SessionChannel {
            req_id: self.broker.next_req_id(),
            tx,
        })
    }

    /// Fire-and-forget send on the live session.
    pub fn send(&self, request: GatewayRequest) -> CoreResult<()> {
        match self.writer.lock().as_ref() {
            Some(tx) => tx.send(request).map_err(|_| CoreError::SessionDropped),
            None => Err(CoreError::SessionUnavailable("no live session".into())),
        }
    }

    /// Request a terminal close. The run loop exits at the next suspension
    /// point; `Reconnecting` becomes `Closed` instead of retrying.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }

    fn set_state(&self, state: SessionState) {
        let previous = *self.state_rx.borrow();
        if previous != state {
            debug!(from = %previous, to = %state, "session state transition");
            self.state_tx.send_replace(state);
        }
    }

    /// Supervisor loop. Spawn once; runs until `close()`.
    pub async fn run(self: Arc<Self>) {
        let mut backoff_attempt: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.set_state(SessionState::Closed);
                return;
            }

            self.set_state(SessionState::Connecting);
            match self.connect_and_handshake().await {
                Ok((reader, writer_handle)) => {
                    backoff_attempt = 0;
                    self.set_state(SessionState::Connected);
                    self.health.record_availability(true);
                    self.replay_subscriptions();

                    let exit = self.run_connected(reader).await;

                    *self.writer.lock() = None;
                    writer_handle.abort();
                    self.health.record_availability(false);
                    self.broker.notify_session_dropped();

                    match exit {
                        ConnectedExit::Closed => {
                            self.set_state(SessionState::Closed);
                            return;
                        }
                        ConnectedExit::HardReconnect => {
                            warn!("hard reconnect: resetting request-id allocator");
                            self.broker.reset_req_ids();
                            self.hb_strikes.store(0, Ordering::SeqCst);
                        }
                        ConnectedExit::SoftReconnect | ConnectedExit::Remote => {}
                    }

                    self.set_state(SessionState::Reconnecting);
                    self.health.record_reconnect_start();
                }
                Err(err) => {
                    warn!(error = %err, "gateway handshake failed");
                    self.set_state(SessionState::Disconnected);
                }
            }

            let delay_ms = self
                .backoff_override_ms
                .lock()
                .take()
                .unwrap_or_else(|| reconnect_backoff_ms(backoff_attempt));
            backoff_attempt = backoff_attempt.saturating_add(1);
            info!(delay_ms, attempt = backoff_attempt, "reconnect backoff");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = self.close_notify.notified() => {
                    self.set_state(SessionState::Closed);
                    return;
                }
            }
        }
    }

    /// Connect and negotiate a client id. On "id in use" retry with id+1
    /// up to the configured cap.
    async fn connect_and_handshake(
        &self,
    ) -> CoreResult<(BufReader<OwnedReadHalf>, tokio::task::JoinHandle<()>)> {
        let mut attempt: u32 = 0;
        loop {
            let client_id = self.config.client_id + attempt;
            match self.handshake_once(client_id).await {
                Ok(parts) => {
                    if attempt > 0 {
                        info!(client_id, "negotiated alternate client id");
                    }
                    return Ok(parts);
                }
                Err(CoreError::Gateway { code, message })
                    if code == CODE_CLIENT_ID_IN_USE =>
                {
                    attempt += 1;
                    if attempt > self.config.max_client_id_retries {
                        return Err(CoreError::SessionUnavailable(format!(
                            "client id exhausted after {attempt} attempts: {message}"
                        )));
                    }
                    debug!(next = self.config.client_id + attempt, "client id in use, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn handshake_once(
        &self,
        client_id: u32,
    ) -> CoreResult<(BufReader<OwnedReadHalf>, tokio::task::JoinHandle<()>)> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = tokio::time::timeout(
            Duration::from_millis(self.config.order_timeout_ms),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| CoreError::SessionUnavailable("connect timeout".into()))?
        .map_err(|e| CoreError::SessionUnavailable(format!("connect: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let start = encode_frame(&GatewayRequest::StartApi { client_id })
            .map_err(|e| CoreError::SessionUnavailable(format!("encode: {e}")))?;
        let mut write_half = write_half;
        write_half
            .write_all(start.as_bytes())
            .await
            .map_err(|e| CoreError::SessionUnavailable(format!("handshake write: {e}")))?;

        // First server frame decides the handshake.
        let mut line = String::new();
        let deadline = Duration::from_millis(self.config.order_timeout_ms);
        let read = tokio::time::timeout(deadline, reader.read_line(&mut line))
            .await
            .map_err(|_| CoreError::SessionUnavailable("handshake timeout".into()))?
            .map_err(|e| CoreError::SessionUnavailable(format!("handshake read: {e}")))?;
        if read == 0 {
            return Err(CoreError::SessionUnavailable("gateway closed during handshake".into()));
        }

        match decode_event(&line) {
            Ok(GatewayEvent::ConnectAck {
                server_version,
                client_id: acked,
                next_order_id,
            }) => {
                info!(server_version, client_id = acked, next_order_id, "gateway session up");
                self.order_ids.fetch_max(next_order_id, Ordering::SeqCst);
                let writer_handle = self.install_writer(write_half);
                Ok((reader, writer_handle))
            }
            Ok(GatewayEvent::Error { code, message, .. }) => {
                Err(CoreError::Gateway { code, message })
            }
            Ok(other) => Err(CoreError::SessionUnavailable(format!(
                "unexpected handshake frame: {other:?}"
            ))),
            Err(e) => Err(CoreError::SessionUnavailable(format!("handshake decode: {e}"))),
        }
    }

    fn install_writer(&self, mut write_half: OwnedWriteHalf) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayRequest>();
        *self.writer.lock() = Some(tx);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let line = match encode_frame(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(error = %e, "gateway write failed, writer exiting");
                    return;
                }
            }
        })
    }

    fn replay_subscriptions(&self) {
        let subs = self.resubscribe.lock().clone();
        for request in subs {
            if let Err(e) = self.send(request.clone()) {
                warn!(error = %e, ?request, "failed to replay subscription");
            }
        }
    }

    /// Connected phase: demultiplex the event stream and supervise
    /// heartbeats until something forces an exit.
    async fn run_connected(&self, reader: BufReader<OwnedReadHalf>) -> ConnectedExit {
        // Reads happen on their own task so a heartbeat tick can never
        // cancel a partially read frame.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let reader_handle = tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(line).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        debug!(error = %e, "gateway read failed");
                        return;
                    }
                }
            }
        });

        let exit = self.supervise(&mut line_rx).await;
        reader_handle.abort();
        exit
    }

    async fn supervise(&self, line_rx: &mut mpsc::UnboundedReceiver<String>) -> ConnectedExit {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut hb_seq: u64 = 0;
        let mut pending_hb: Option<(u64, Instant)> = None;

        loop {
            tokio::select! {
                maybe_line = line_rx.recv() => {
                    let Some(line) = maybe_line else {
                        warn!("gateway stream ended");
                        return ConnectedExit::Remote;
                    };
                    match decode_event(&line) {
                        Ok(event) => {
                            if let Some(exit) = self.handle_event(event, &mut pending_hb) {
                                return exit;
                            }
                        }
                        Err(e) => debug!(error = %e, "undecodable frame skipped"),
                    }
                }
                _ = ticker.tick() => {
                    if pending_hb.take().is_some() {
                        let strikes = self.hb_strikes.fetch_add(1, Ordering::SeqCst) + 1;
                        match heartbeat_action(strikes) {
                            HeartbeatAction::Warning => {
                                warn!(strikes, "heartbeat miss");
                                self.set_state(SessionState::Degraded);
                            }
                            HeartbeatAction::SoftReconnect => {
                                warn!(strikes, "heartbeat miss, soft reconnect");
                                return ConnectedExit::SoftReconnect;
                            }
                            HeartbeatAction::HardReconnect => {
                                error!(strikes, "heartbeat miss, hard reconnect");
                                return ConnectedExit::HardReconnect;
                            }
                        }
                    }
                    hb_seq += 1;
                    if self.send(GatewayRequest::Heartbeat { seq: hb_seq }).is_err() {
                        return ConnectedExit::Remote;
                    }
                    pending_hb = Some((hb_seq, Instant::now()));
                }
                _ = self.close_notify.notified() => {
                    return ConnectedExit::Closed;
                }
            }
        }
    }

    /// Returns an exit when the event forces one.
    fn handle_event(
        &self,
        event: GatewayEvent,
        pending_hb: &mut Option<(u64, Instant)>,
    ) -> Option<ConnectedExit> {
        match event {
            GatewayEvent::HeartbeatAck { seq } => {
                if let Some((sent_seq, sent_at)) = pending_hb.take() {
                    if seq == sent_seq {
                        let latency_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                        self.health.record_heartbeat_latency(latency_ms);
                        self.hb_strikes.store(0, Ordering::SeqCst);
                        if self.state() == SessionState::Degraded {
                            self.set_state(SessionState::Connected);
                        }
                    } else {
                        *pending_hb = Some((sent_seq, sent_at));
                    }
                }
                None
            }
            GatewayEvent::Error { req_id: -1, code, message } => {
                match classify_error_code(code) {
                    ErrorSeverity::ConnectionLost => {
                        warn!(code, detail = %message, "gateway connectivity lost, retry in 10s");
                        *self.backoff_override_ms.lock() = Some(10_000);
                        Some(ConnectedExit::Remote)
                    }
                    ErrorSeverity::ConnectionRestored => {
                        info!(code, detail = %message, "gateway connectivity restored in place");
                        self.hb_strikes.store(0, Ordering::SeqCst);
                        if self.state() == SessionState::Degraded {
                            self.set_state(SessionState::Connected);
                        }
                        None
                    }
                    ErrorSeverity::NonFatal => {
                        debug!(code, detail = %message, "transient gateway notice");
                        None
                    }
                    ErrorSeverity::Fatal => {
                        error!(code, detail = %message, "fatal gateway error");
                        Some(ConnectedExit::Remote)
                    }
                }
            }
            other => {
                self.broker.dispatch(&other);
                None
            }
        }
    }
}

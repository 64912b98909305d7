use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::Peekable;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hearth_db::Store;
use hearth_types::events::{WebSocketMessage, WebSocketRequest, is_droppable_event};
use hearth_types::models::Session;
use hearth_types::{new_id, now_millis};

use crate::auth::SessionGate;
use crate::filter::{ChannelMemberCache, should_send};
use crate::frame::{PumpError, WsFrame};
use crate::hub::Hub;
use crate::readiness::PumpMode;
use crate::session::AtomicSession;
use crate::{presence, router};

pub const SEND_QUEUE_SIZE: usize = 256;
/// Queue depth at which droppable events are discarded.
pub const SEND_SLOW_WARN: usize = SEND_QUEUE_SIZE * 50 / 100;
/// Queue depth at which every write is logged as backed up.
pub const SEND_FULL_WARN: usize = SEND_QUEUE_SIZE * 95 / 100;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const AUTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub pong_wait: Duration,
    pub max_message_size: usize,
    pub mode: PumpMode,
    pub away_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(60),
            max_message_size: 8 * 1024,
            mode: PumpMode::detect(),
            away_timeout: Duration::from_secs(300),
        }
    }
}

/// Everything a connection's pump needs from the rest of the process.
#[derive(Clone)]
pub struct ConnContext {
    pub hub: Hub,
    pub store: Arc<dyn Store>,
    pub gate: Arc<dyn SessionGate>,
    pub config: PumpConfig,
    /// Bounds how many event-driven readers run at once, process-wide.
    pub reader_permits: Arc<Semaphore>,
}

/// One user's live websocket connection.
pub struct WebConn {
    pub id: String,
    pub locale: String,
    pub session: AtomicSession,
    user_id: OnceLock<String>,
    send: mpsc::Sender<WebSocketMessage>,
    terminate: CancellationToken,
    closed: AtomicBool,
    members_invalidated: AtomicBool,
    last_activity: AtomicI64,
}

impl WebConn {
    /// Create a connection and the receiving end of its send queue.
    pub fn new(locale: &str) -> (Arc<Self>, mpsc::Receiver<WebSocketMessage>) {
        let (send, rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let conn = Arc::new(Self {
            id: new_id(),
            locale: locale.to_string(),
            session: AtomicSession::new(),
            user_id: OnceLock::new(),
            send,
            terminate: CancellationToken::new(),
            closed: AtomicBool::new(false),
            members_invalidated: AtomicBool::new(false),
            last_activity: AtomicI64::new(now_millis()),
        });
        (conn, rx)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Attach a validated session. The owning user is fixed by the first
    /// successful call; a session for anyone else is refused.
    pub fn authenticate(&self, session: Session, token: String) -> bool {
        let owner = self.user_id.get_or_init(|| session.user_id.clone());
        if *owner != session.user_id {
            warn!(
                "conn {} refused session for {} (owned by {})",
                self.id, session.user_id, owner
            );
            return false;
        }
        self.session.set_token(token);
        self.session.store(session);
        true
    }

    /// Cheap when the cached session is still fresh; otherwise re-asks the gate.
    pub async fn is_authenticated(&self, gate: &dyn SessionGate) -> bool {
        if self.session.expires_at() > now_millis() {
            return true;
        }
        let Some(token) = self.session.token() else {
            return false;
        };
        match gate.session(&token).await {
            Ok(session) => {
                self.session.store(session);
                true
            }
            Err(e) => {
                if e.status_code() < 500 {
                    debug!("conn {} session refresh rejected: {}", self.id, e);
                } else {
                    error!("conn {} session refresh failed: {}", self.id, e);
                }
                self.session.clear();
                false
            }
        }
    }

    /// Non-blocking enqueue.
    pub fn try_send(
        &self,
        msg: WebSocketMessage,
    ) -> Result<(), mpsc::error::TrySendError<WebSocketMessage>> {
        self.send.try_send(msg)
    }

    pub fn queue_len(&self) -> usize {
        self.send.max_capacity() - self.send.capacity()
    }

    /// Ask both loops to stop. Safe to call any number of times.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("conn {} closing", self.id);
            self.terminate.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn invalidate_channel_members(&self) {
        self.members_invalidated.store(true, Ordering::Release);
    }

    pub(crate) fn take_members_invalidated(&self) -> bool {
        self.members_invalidated.swap(false, Ordering::AcqRel)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

// ── Axum entry point ──

/// Drive an upgraded axum socket until it closes. `token` comes from the
/// upgrade request (header or cookie) when the client sent one.
pub async fn handle_socket(socket: WebSocket, ctx: ConnContext, locale: String, token: Option<String>) {
    let (conn, rx) = WebConn::new(&locale);

    if let Some(token) = token {
        match ctx.gate.session(&token).await {
            Ok(session) => {
                router::complete_authentication(&ctx, &conn, session, token).await;
            }
            Err(e) => debug!("conn {} upgrade token rejected: {}", conn.id, e),
        }
    }

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: WsFrame| future::ready(Ok::<Message, PumpError>(frame.into())));
    let stream = stream.map(|msg| msg.map(WsFrame::from).map_err(PumpError::from));

    info!("conn {} opened ({:?} reader)", conn.id, ctx.config.mode);
    run_pump(conn, rx, stream, sink, ctx).await;
}

// ── Pump ──

/// Run the reader and writer for `conn` until either ends, then unregister.
pub async fn run_pump<S, K>(
    conn: Arc<WebConn>,
    rx: mpsc::Receiver<WebSocketMessage>,
    stream: S,
    sink: K,
    ctx: ConnContext,
) where
    S: Stream<Item = Result<WsFrame, PumpError>> + Unpin + Send + 'static,
    K: Sink<WsFrame, Error = PumpError> + Unpin + Send + 'static,
{
    let writer = tokio::spawn(write_pump(conn.clone(), rx, sink, ctx.clone()));
    let reader = tokio::spawn(read_pump(conn.clone(), stream, ctx.clone()));

    let (written, read) = tokio::join!(finish(writer, &conn), finish(reader, &conn));
    for (side, result) in [("writer", written), ("reader", read)] {
        match result {
            Err(e) if e.is_expected() => debug!("conn {} {} ended: {}", conn.id, side, e),
            Err(e) => warn!("conn {} {} failed: {}", conn.id, side, e),
            Ok(()) => {}
        }
    }

    let still_connected = ctx.hub.unregister(&conn).await;
    if let Some(user_id) = conn.user_id() {
        if !still_connected {
            presence::set_status_offline(ctx.store.as_ref(), &ctx.hub, user_id).await;
        }
        info!("conn {} ({}) disconnected", conn.id, user_id);
    } else {
        info!("conn {} disconnected before authenticating", conn.id);
    }
}

async fn finish(handle: JoinHandle<Result<(), PumpError>>, conn: &WebConn) -> Result<(), PumpError> {
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(PumpError::Transport(format!("pump task panicked: {}", e))),
    };
    conn.close();
    result
}

// ── Writer ──

async fn write_pump<K>(
    conn: Arc<WebConn>,
    mut rx: mpsc::Receiver<WebSocketMessage>,
    mut sink: K,
    ctx: ConnContext,
) -> Result<(), PumpError>
where
    K: Sink<WsFrame, Error = PumpError> + Unpin,
{
    let ping_period = ctx.config.pong_wait * 6 / 10;
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    let mut auth_check = interval_at(Instant::now() + AUTH_CHECK_INTERVAL, AUTH_CHECK_INTERVAL);
    let mut auth_pending = true;
    let mut members = ChannelMemberCache::default();
    let mut seq: i64 = 0;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = write_frame(&mut sink, WsFrame::Close).await;
                    return Ok(());
                };
                let depth = rx.len();

                let text = match msg {
                    WebSocketMessage::Event(event) => {
                        if depth >= SEND_SLOW_WARN && is_droppable_event(&event.event) {
                            warn!(
                                "websocket.slow: dropping message conn_id={} user_id={} type={} channel_id={}",
                                conn.id,
                                conn.user_id().unwrap_or_default(),
                                event.event,
                                event.broadcast.channel_id
                            );
                            continue;
                        }
                        if !should_send(&event, &conn, &mut members, ctx.store.as_ref(), ctx.gate.as_ref()).await {
                            continue;
                        }
                        let text = event.to_json_with_seq(seq)?;
                        seq += 1;
                        text
                    }
                    WebSocketMessage::Response(response) => serde_json::to_string(&response)?,
                };

                if depth >= SEND_FULL_WARN {
                    warn!(
                        "websocket.full: conn_id={} user_id={} queue={}/{}",
                        conn.id,
                        conn.user_id().unwrap_or_default(),
                        depth,
                        SEND_QUEUE_SIZE
                    );
                }
                write_frame(&mut sink, WsFrame::Text(text)).await?;
            }
            _ = ping.tick() => {
                write_frame(&mut sink, WsFrame::Ping(Bytes::new())).await?;
            }
            _ = auth_check.tick(), if auth_pending => {
                if !conn.session.has_token() {
                    debug!("conn {} did not authenticate in time", conn.id);
                    let _ = write_frame(&mut sink, WsFrame::Close).await;
                    return Ok(());
                }
                auth_pending = false;
            }
            _ = conn.terminate.cancelled() => {
                let _ = write_frame(&mut sink, WsFrame::Close).await;
                return Ok(());
            }
        }
    }
}

async fn write_frame<K>(sink: &mut K, frame: WsFrame) -> Result<(), PumpError>
where
    K: Sink<WsFrame, Error = PumpError> + Unpin,
{
    timeout(WRITE_WAIT, sink.send(frame))
        .await
        .map_err(|_| PumpError::WriteTimeout)?
}

// ── Reader ──

struct ReadState<S: Stream> {
    stream: Peekable<S>,
    deadline: Instant,
}

enum Readiness {
    Readable,
    HungUp,
    TimedOut,
}

async fn read_pump<S>(conn: Arc<WebConn>, stream: S, ctx: ConnContext) -> Result<(), PumpError>
where
    S: Stream<Item = Result<WsFrame, PumpError>> + Unpin + Send + 'static,
{
    let state = ReadState {
        stream: stream.peekable(),
        deadline: Instant::now() + ctx.config.pong_wait,
    };
    match ctx.config.mode {
        PumpMode::Blocking => blocking_reader(conn, state, ctx).await,
        PumpMode::EventDriven => event_reader(conn, state, ctx).await,
    }
}

async fn blocking_reader<S>(
    conn: Arc<WebConn>,
    mut state: ReadState<S>,
    ctx: ConnContext,
) -> Result<(), PumpError>
where
    S: Stream<Item = Result<WsFrame, PumpError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.terminate.cancelled() => return Ok(()),
            next = timeout_at(state.deadline, state.stream.next()) => {
                next.map_err(|_| PumpError::ReadTimeout)?
            }
        };
        let frame = next.ok_or(PumpError::Closed)??;
        handle_frame(&conn, &mut state.deadline, frame, &ctx).await?;
    }
}

/// Waits for readability without consuming the frame, then hands the read
/// lock to a pooled worker that reads and handles exactly one frame. The
/// next wait cannot start until that worker releases the lock.
async fn event_reader<S>(
    conn: Arc<WebConn>,
    state: ReadState<S>,
    ctx: ConnContext,
) -> Result<(), PumpError>
where
    S: Stream<Item = Result<WsFrame, PumpError>> + Unpin + Send + 'static,
{
    let read_lock = Arc::new(Mutex::new(state));

    loop {
        let mut guard = tokio::select! {
            _ = conn.terminate.cancelled() => return Ok(()),
            guard = read_lock.clone().lock_owned() => guard,
        };

        let deadline = guard.deadline;
        let readiness = tokio::select! {
            _ = conn.terminate.cancelled() => return Ok(()),
            peeked = timeout_at(deadline, Pin::new(&mut guard.stream).peek()) => match peeked {
                Err(_) => Readiness::TimedOut,
                Ok(None) => Readiness::HungUp,
                Ok(Some(_)) => Readiness::Readable,
            },
        };

        match readiness {
            Readiness::TimedOut => return Err(PumpError::ReadTimeout),
            Readiness::HungUp => return Err(PumpError::Closed),
            Readiness::Readable => {
                let permit = ctx
                    .reader_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PumpError::Transport("reader pool shut down".into()))?;
                let conn = conn.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let mut guard = guard;
                    let state = &mut *guard;
                    let result = match state.stream.next().await {
                        Some(Ok(frame)) => handle_frame(&conn, &mut state.deadline, frame, &ctx).await,
                        Some(Err(e)) => Err(e),
                        None => Err(PumpError::Closed),
                    };
                    if let Err(e) = result {
                        if e.is_expected() {
                            debug!("conn {} reader stopped: {}", conn.id, e);
                        } else {
                            warn!("conn {} reader failed: {}", conn.id, e);
                        }
                        conn.close();
                    }
                });
            }
        }
    }
}

async fn handle_frame(
    conn: &Arc<WebConn>,
    deadline: &mut Instant,
    frame: WsFrame,
    ctx: &ConnContext,
) -> Result<(), PumpError> {
    conn.touch();
    match frame {
        WsFrame::Close => Err(PumpError::Closed),
        WsFrame::Pong(_) => {
            *deadline = Instant::now() + ctx.config.pong_wait;
            if conn.is_authenticated(ctx.gate.as_ref()).await {
                if let Some(user_id) = conn.user_id() {
                    let user_id = user_id.to_string();
                    let store = ctx.store.clone();
                    let hub = ctx.hub.clone();
                    let away_timeout = ctx.config.away_timeout;
                    tokio::spawn(async move {
                        presence::set_status_away_if_needed(store.as_ref(), &hub, &user_id, away_timeout)
                            .await;
                    });
                }
            }
            Ok(())
        }
        WsFrame::Ping(_) => Ok(()),
        WsFrame::Text(text) => handle_request(conn, text.as_bytes(), ctx).await,
        WsFrame::Binary(data) => handle_request(conn, &data, ctx).await,
    }
}

async fn handle_request(conn: &Arc<WebConn>, raw: &[u8], ctx: &ConnContext) -> Result<(), PumpError> {
    let limit = ctx.config.max_message_size;
    if raw.len() > limit {
        return Err(PumpError::TooLarge {
            size: raw.len(),
            limit,
        });
    }
    let request: WebSocketRequest = serde_json::from_slice(raw)?;
    router::route(ctx, conn, request).await;
    Ok(())
}

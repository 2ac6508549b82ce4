//! The Gateway: the axum WebSocket front door (spec §4.4, §6) that turns a
//! registered user's socket into a [`crate::signaling::Signaler`] bound to a
//! [`crate::negotiator::Negotiator`], and the plain HTTP registration
//! endpoint that hands out session names.
//!
//! Grounded in `nexus-voice::handler`'s `build_router`/`ws_handler`/
//! `handle_voice_connection` shape — a split socket, a receive loop
//! dispatching a tagged enum, and `send_signal`/`send_error` helpers — with
//! the reference's JWT/channel/voice-state plumbing replaced by spec §6's
//! bare `create_webrtc_peer` / `signal` control protocol.

use crate::negotiator::Negotiator;
use crate::rtc::Str0mPeer;
use crate::signaling::{ControlMessage, SignalBody, Signaler};
use crate::sfu::Sfu;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use signalmesh_common::error::SignalmeshError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Shared state for the signalling service.
#[derive(Clone)]
pub struct GatewayState {
    pub sfu: Arc<Sfu>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self { sfu: Sfu::new() }
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    name: String,
}

/// Assemble the public router: `POST /` to register a session name, `GET
/// /ws` to upgrade to the signalling socket. Any other method on `/`
/// returns 405, per spec §6's explicit license to reject non-POST
/// registration requests instead of silently dropping them (a completion
/// over the reference, which had no equivalent bare endpoint at all).
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", post(register).fallback(method_not_allowed))
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn method_not_allowed(method: Method) -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        format!("{method} not allowed on this endpoint"),
    )
}

async fn register(Json(req): Json<RegisterRequest>) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return SignalmeshError::Validation("name must not be empty".into()).into_response();
    }
    Json(RegisterResponse { name: req.name }).into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

async fn handle_connection(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::debug!(session = %session_id, peer = %addr, "signalling socket connected");

    let config = signalmesh_common::config::get();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<SignalBody>(config.queue.signal_queue_capacity);

    let write_deadline = std::time::Duration::from_secs(config.heartbeat.write_deadline_secs);
    let ping_interval = std::time::Duration::from_secs(config.heartbeat.ping_interval_secs);
    // Heartbeat ping-sender, merged into the write task so there is a single
    // owner of the sink half (spec §4.4/§6: "server sends ping at 54s
    // intervals"). `original_source/raven.go` defines this same constant
    // (`pingPeriod`) but never actually drives a ticker off it — a gap this
    // port fixes rather than reproduces.
    let write_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                body = outbox_rx.recv() => {
                    let Some(body) = body else { break };
                    let msg = ControlMessage::Signal(body);
                    let json = match serde_json::to_string(&msg) {
                        Ok(j) => j,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode outbound signal");
                            continue;
                        }
                    };
                    let send = sender.send(Message::Text(json.into()));
                    if tokio::time::timeout(write_deadline, send).await.is_err() {
                        tracing::warn!("write deadline exceeded, closing signalling socket");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let send = sender.send(Message::Ping(Vec::new().into()));
                    if tokio::time::timeout(write_deadline, send).await.is_err() {
                        tracing::warn!("write deadline exceeded sending heartbeat ping");
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    let mut negotiator_handle: Option<NegotiatorHandle> = None;
    let max_frame_bytes = config.heartbeat.max_frame_bytes;
    // Read deadline, refreshed on every pong (spec §4.4/§6: "clients must
    // respond within 60s"); a client that never pongs (or goes silent) is
    // disconnected once the deadline lapses, mirroring gorilla websocket's
    // `SetReadDeadline`/`SetPongHandler` pair in the original.
    let pong_timeout = std::time::Duration::from_secs(config.heartbeat.pong_timeout_secs);

    loop {
        let next = tokio::time::timeout(pong_timeout, receiver.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                tracing::warn!(session = %session_id, "heartbeat timeout, closing signalling socket");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if text.len() > max_frame_bytes {
                    tracing::warn!(session = %session_id, "oversized control frame dropped");
                    continue;
                }
                let control: ControlMessage = match serde_json::from_str(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "malformed control frame");
                        continue;
                    }
                };
                match control {
                    ControlMessage::CreateWebrtcPeer => {
                        if negotiator_handle.is_some() {
                            // idempotent: a second request on an already-set-up
                            // connection is a no-op, not an error.
                            continue;
                        }
                        match setup_peer(&state, &session_id, outbox_tx.clone()).await {
                            Ok(handle) => negotiator_handle = Some(handle),
                            Err(e) => {
                                tracing::warn!(session = %session_id, error = %e, "failed to create webrtc peer");
                            }
                        }
                    }
                    ControlMessage::Signal(body) => {
                        if let Some(handle) = &negotiator_handle {
                            let _ = handle.inbound_tx.send(body).await;
                        } else {
                            tracing::warn!(session = %session_id, "signal received before peer setup");
                        }
                    }
                }
            }
            Message::Close(_) => break,
            // Receiving a pong (or any frame) simply lets the next loop
            // iteration re-arm the read deadline; gorilla's `SetPongHandler`
            // analogue needs no separate bookkeeping here.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    tracing::debug!(session = %session_id, "signalling socket disconnected");
    state.sfu.deregister_peer(&session_id);
    if let Some(handle) = negotiator_handle {
        handle.shutdown().await;
    }
    write_task.abort();
}

struct NegotiatorHandle {
    inbound_tx: mpsc::Sender<SignalBody>,
    negotiator: Negotiator<Str0mPeer>,
}

impl NegotiatorHandle {
    async fn shutdown(self) {
        self.negotiator.close().await;
    }
}

/// Accept an initial empty-offer handshake is out of scope here: spec §6's
/// `create_webrtc_peer` control message only provisions a peer connection
/// and Negotiator; the offer itself arrives as a subsequent `signal`
/// message, matching the reference's split between "create SFU peer" and
/// the SDP/ICE exchange that follows.
async fn setup_peer(
    state: &GatewayState,
    session_id: &str,
    outbox_tx: mpsc::Sender<SignalBody>,
) -> Result<NegotiatorHandle, SignalmeshError> {
    let local_ip = signalmesh_common::config::get()
        .server
        .host
        .parse()
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    // An offer-less placeholder peer is built immediately so ICE gathering
    // and the Negotiator's event loop can start before the client's first
    // SDP offer arrives; str0m supports building an `Rtc` and applying the
    // first offer via the same `set_remote_description` path the Negotiator
    // already drives, so no separate bootstrap offer is synthesized here.
    let (peer, _initial_answer, peer_events) =
        Str0mPeer::accept_offer(local_ip, EMPTY_BOOTSTRAP_OFFER).await?;

    state.sfu.register_peer(session_id, Arc::clone(&peer) as Arc<dyn crate::rtc::PeerConnection>);

    // The raw peer-event stream is tapped here rather than handed to the
    // Negotiator whole: `PeerEvent::RemoteTrack` carries the inbound track's
    // packet receiver, which the SFU's on-new-remote-track handler (spec
    // §4.3) must own, not the Negotiator — which only ever reads ICE
    // candidates, negotiation-needed, and close events off this stream.
    let (negotiator_events_tx, negotiator_events_rx) = mpsc::channel(64);
    let sfu_for_tap = Arc::clone(&state.sfu);
    let session_for_tap = session_id.to_string();
    tokio::spawn(async move {
        let mut peer_events = peer_events;
        while let Some(event) = peer_events.recv().await {
            match event {
                crate::rtc::PeerEvent::RemoteTrack(handle) => {
                    sfu_for_tap.accept_inbound_track(&session_for_tap, handle);
                }
                other => {
                    if negotiator_events_tx.send(other).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let bridging_signaler: Arc<dyn Signaler> = Arc::new(BridgingSignaler {
        outbox_tx,
        inbound_rx: Mutex::new(Some(inbound_rx)),
        closed: std::sync::atomic::AtomicBool::new(false),
    });

    let negotiator = Negotiator::builder(peer, bridging_signaler)
        .polite()
        .build(negotiator_events_rx);

    Ok(NegotiatorHandle {
        inbound_tx,
        negotiator,
    })
}

/// A degenerate but syntactically valid SDP offer used only to stand up the
/// ICE-lite `Rtc` instance before the client's real offer is known; it
/// describes zero media lines and is immediately superseded by the first
/// `signal` message's real offer.
const EMPTY_BOOTSTRAP_OFFER: &str = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

/// Bridges the gateway's inbound channel (fed by the socket read loop) and
/// outbound channel (drained by the socket write task) behind the
/// [`Signaler`] trait the Negotiator expects.
struct BridgingSignaler {
    outbox_tx: mpsc::Sender<SignalBody>,
    inbound_rx: Mutex<Option<mpsc::Receiver<SignalBody>>>,
    closed: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl Signaler for BridgingSignaler {
    async fn send(&self, body: SignalBody) -> Result<(), SignalmeshError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SignalmeshError::SignalerClosed);
        }
        self.outbox_tx
            .send(body)
            .await
            .map_err(|_| SignalmeshError::SignalerClosed)
    }

    fn on_message(&self, callback: crate::signaling::MessageCallback) {
        let rx = self.inbound_rx.lock_blocking_take();
        if let Some(mut rx) = rx {
            tokio::spawn(async move {
                while let Some(body) = rx.recv().await {
                    callback(body);
                }
            });
        }
    }

    fn on_error(&self, _callback: crate::signaling::ErrorCallback) {
        // Transport-level errors on a WebSocket surface as a closed socket,
        // observed by the connection loop itself rather than this callback.
    }

    /// Marks the bridge closed so further `send` calls fail immediately,
    /// without waiting on the write task (which is torn down independently
    /// by the connection loop) — matching spec §4.1's "send fails; pending
    /// dispatches for already-received messages may still fire" contract
    /// instead of blocking on the outbox's receiver being dropped.
    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

trait MutexTakeExt<T> {
    fn lock_blocking_take(&self) -> Option<T>;
}

impl<T> MutexTakeExt<T> for Mutex<Option<T>> {
    fn lock_blocking_take(&self) -> Option<T> {
        self.try_lock().ok().and_then(|mut guard| guard.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_config() {
        let _ = signalmesh_common::config::init();
    }

    #[tokio::test]
    async fn register_rejects_blank_name() {
        ensure_config();
        let response = register(Json(RegisterRequest { name: "   ".into() }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_accepts_nonblank_name() {
        ensure_config();
        let response = register(Json(RegisterRequest { name: "alice".into() }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bridging_signaler_send_fails_after_close() {
        ensure_config();
        let (outbox_tx, mut outbox_rx) = mpsc::channel(4);
        let (_inbound_tx, inbound_rx) = mpsc::channel(4);
        let signaler = BridgingSignaler {
            outbox_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: std::sync::atomic::AtomicBool::new(false),
        };

        signaler.send(SignalBody::default()).await.unwrap();
        assert!(outbox_rx.recv().await.is_some());

        signaler.close().await;
        let err = signaler.send(SignalBody::default()).await.unwrap_err();
        assert!(matches!(err, SignalmeshError::SignalerClosed));
    }
}

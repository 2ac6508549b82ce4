//! `SignalBody` and the `Signaler` capability — the abstraction boundary
//! between control-channel transports and the [`crate::negotiator::Negotiator`].

use serde::{Deserialize, Serialize};
use signalmesh_common::error::SignalmeshError;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// SDP description type tag, mirroring `RTCSdpType` in the peer-transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP session description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// An ICE candidate, carried opaquely — the trickle-ICE unit exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// The minimal control message of the negotiation protocol: one of an SDP
/// description or an ICE candidate, immutable once constructed. At most one
/// field is set per instance in practice (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidateInit>,
}

impl SignalBody {
    pub fn description(desc: SessionDescription) -> Self {
        Self {
            description: Some(desc),
            candidate: None,
        }
    }

    pub fn candidate(candidate: IceCandidateInit) -> Self {
        Self {
            description: None,
            candidate: Some(candidate),
        }
    }

    /// Debug tag derived from which field is set (spec §3).
    pub fn tag(&self) -> &'static str {
        match (&self.description, &self.candidate) {
            (Some(d), _) => match d.sdp_type {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
                SdpType::Pranswer => "pranswer",
                SdpType::Rollback => "rollback",
            },
            (None, Some(_)) => "candidate",
            (None, None) => "empty",
        }
    }
}

pub type MessageCallback = Arc<dyn Fn(SignalBody) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(SignalmeshError) + Send + Sync>;
pub type InterceptorHook = Arc<dyn Fn(&mut SignalBody) -> Result<(), SignalmeshError> + Send + Sync>;

/// A capability object bound to one side of a full-duplex pipe of [`SignalBody`]
/// values (spec §3, §4.1). The Gateway owns a user's Signaler; the Negotiator
/// holds it long enough to call `send` and install callbacks exactly once.
#[async_trait::async_trait]
pub trait Signaler: Send + Sync {
    /// Enqueue `body` for the far side. Fails with `SignalerClosed` once closed.
    async fn send(&self, body: SignalBody) -> Result<(), SignalmeshError>;

    /// Install the callback invoked once per received body, in arrival order.
    /// Installing replaces any previously installed callback.
    fn on_message(&self, callback: MessageCallback);

    /// Install the callback invoked for asynchronous pipe errors.
    fn on_error(&self, callback: ErrorCallback);

    /// Idempotent. After close, `send` fails; already-dispatched messages may
    /// still fire their callback, but no new ones will.
    async fn close(&self);
}

struct LoopbackState {
    closed: bool,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
}

/// One endpoint of a bounded, in-process loopback pipe — the required
/// test/loopback Signaler from spec §4.1, occupying the same seam
/// `negotiator_test.go`'s `DummySignalersPipeline` does in the original: two
/// endpoints joined by two bounded(32) queues, each carrying optional
/// interceptor hooks (`before_send`/`before_recv`).
pub struct LoopbackSignaler {
    outbox: mpsc::Sender<SignalBody>,
    state: Mutex<LoopbackState>,
    before_send: Option<InterceptorHook>,
}

impl LoopbackSignaler {
    /// Construct a linked pair: messages sent on one side are dispatched
    /// (subject to `before_recv`) to the other's `on_message` callback.
    pub fn new_pair(capacity: usize) -> (Arc<Self>, Arc<Self>) {
        Self::new_pair_with_interceptors(capacity, None, None, None, None)
    }

    /// Same as [`new_pair`](Self::new_pair) but with interceptor hooks
    /// installed on each direction — the seam unit tests use to simulate
    /// corruption or reordering without any real network.
    pub fn new_pair_with_interceptors(
        capacity: usize,
        before_send_a: Option<InterceptorHook>,
        before_recv_a: Option<InterceptorHook>,
        before_send_b: Option<InterceptorHook>,
        before_recv_b: Option<InterceptorHook>,
    ) -> (Arc<Self>, Arc<Self>) {
        let (tx_a_to_b, rx_a_to_b) = mpsc::channel(capacity);
        let (tx_b_to_a, rx_b_to_a) = mpsc::channel(capacity);

        let a = Arc::new(Self {
            outbox: tx_a_to_b,
            state: Mutex::new(LoopbackState {
                closed: false,
                on_message: None,
                on_error: None,
            }),
            before_send: before_send_a,
        });
        let b = Arc::new(Self {
            outbox: tx_b_to_a,
            state: Mutex::new(LoopbackState {
                closed: false,
                on_message: None,
                on_error: None,
            }),
            before_send: before_send_b,
        });

        spawn_dispatch_loop(rx_b_to_a, Arc::clone(&a), before_recv_a);
        spawn_dispatch_loop(rx_a_to_b, Arc::clone(&b), before_recv_b);

        (a, b)
    }
}

fn spawn_dispatch_loop(
    mut rx: mpsc::Receiver<SignalBody>,
    owner: Arc<LoopbackSignaler>,
    before_recv: Option<InterceptorHook>,
) {
    tokio::spawn(async move {
        while let Some(mut body) = rx.recv().await {
            if let Some(intercept) = &before_recv {
                if let Err(e) = intercept(&mut body) {
                    let cb = owner.state.lock().unwrap().on_error.clone();
                    if let Some(cb) = cb {
                        cb(e);
                    }
                    continue;
                }
            }
            let cb = owner.state.lock().unwrap().on_message.clone();
            if let Some(cb) = cb {
                cb(body);
            }
        }
    });
}

#[async_trait::async_trait]
impl Signaler for LoopbackSignaler {
    async fn send(&self, mut body: SignalBody) -> Result<(), SignalmeshError> {
        if self.state.lock().unwrap().closed {
            return Err(SignalmeshError::SignalerClosed);
        }
        if let Some(intercept) = &self.before_send {
            intercept(&mut body)?;
        }
        self.outbox
            .send(body)
            .await
            .map_err(|_| SignalmeshError::SignalerClosed)
    }

    fn on_message(&self, callback: MessageCallback) {
        self.state.lock().unwrap().on_message = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.state.lock().unwrap().on_error = Some(callback);
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// The control-channel envelope: `{"type": ..., "payload": ...}` (spec §4.4, §6).
/// Rust's tagged-enum serde replaces the Go original's `WebsocketMessageType`
/// interface plus generic `Match[T]` dispatcher with a single match expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    #[serde(rename = "create_webrtc_peer")]
    CreateWebrtcPeer,
    #[serde(rename = "signal")]
    Signal(SignalBody),
}

//! Message Transport (C4): the axum websocket upgrade handler, per-peer
//! reader/writer task pair, and liveness ping/pong. Grounded on the teacher's
//! `ws::handle_ws` / `tunnel::relay::device_register_ws` split-socket
//! reader+writer task pattern.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::activity::ActivityKind;
use crate::broker::{self, Classification};
use crate::registry::{Peer, PeerRole};
use crate::state::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let new_peer = state.registry.insert().await;
    let peer = new_peer.peer;
    let mut mailbox_rx = new_peer.mailbox_rx;

    state
        .activity
        .log(ActivityKind::PeerConnected, format!("peer {} connected", peer.id), None, None)
        .await;

    let (mut sink, mut stream) = socket.split();
    let mut evicted = peer.evicted_watcher();
    let mut activity_rx = state.activity_broadcast.subscribe();

    let ping_interval = Duration::from_secs(state.config.ping_interval.max(1));
    let idle_timeout = ping_interval * u32::try_from(state.config.ping_timeout.max(1)).unwrap_or(1);

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        let mut ping_tick = tokio::time::interval(ping_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_tick.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                frame = mailbox_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                // Controllers additionally receive real-time activity-journal
                // entries over the same socket, alongside their ordinary
                // broker-routed frames.
                activity_frame = activity_rx.recv(), if writer_peer.role().await == PeerRole::Controller => {
                    match activity_frame {
                        Ok(frame) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ping_tick.tick() => {
                    if send_frame(&mut sink, &liveness_ping_frame(writer_peer.role().await)).await.is_err() {
                        break;
                    }
                }
                _ = evicted.changed() => {
                    if *evicted.borrow() {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    });

    read_loop(&mut stream, &state, &peer, idle_timeout).await;

    writer.abort();
    finalize_disconnect(&state, &peer).await;
}

async fn read_loop(
    stream: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
    peer: &Arc<Peer>,
    idle_timeout: Duration,
) {
    loop {
        let next = tokio::time::timeout(idle_timeout, stream.next()).await;
        let Ok(next) = next else {
            debug!(peer_id = peer.id, "peer idle timeout, closing");
            break;
        };
        let Some(message) = next else { break };
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(peer_id = peer.id, error = %e, "websocket read error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                peer.touch_inbound(broker::unix_now());
                handle_text_frame(state, peer, &text).await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {
                peer.touch_inbound(broker::unix_now());
            }
        }

        if peer.is_evicted() {
            break;
        }
    }
}

async fn handle_text_frame(state: &AppState, peer: &Arc<Peer>, text: &str) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            state
                .activity
                .log(ActivityKind::EnvelopeMalformed, format!("invalid JSON: {e}"), None, None)
                .await;
            return;
        }
    };

    if !peer.handshake_complete() {
        match broker::classify(state, &raw) {
            Classification::Controller => {
                state.registry.classify_controller(peer.id).await;
                state
                    .activity
                    .log(ActivityKind::PeerClassified, format!("peer {} classified as controller", peer.id), None, None)
                    .await;
                broker::handle_controller_frame(state, peer, raw).await;
            }
            Classification::Device { udid } => {
                if let Some(evicted_peer) = state.registry.classify_device(peer.id, &udid).await {
                    state
                        .activity
                        .log(ActivityKind::PeerEvicted, format!("device {udid} reconnected, evicting stale peer"), None, None)
                        .await;
                    broker::broadcast_device_disconnect(state, &udid).await;
                    let _ = evicted_peer;
                }
                info!(udid, "device classified");
                broker::handle_device_frame(state, peer, &udid, raw).await;
            }
            Classification::Reject => {
                broker::log_peer_discarded("unclassifiable first frame");
            }
        }
        return;
    }

    match peer.role().await {
        PeerRole::Controller => broker::handle_controller_frame(state, peer, raw).await,
        PeerRole::Device => {
            if let Some(udid) = peer.device_udid() {
                broker::handle_device_frame(state, peer, &udid, raw).await;
            }
        }
        PeerRole::Unclassified => {}
    }
}

/// The liveness frame emitted every `ping_interval` (§4.3): a plain
/// `control/ping` for controllers and still-unclassified peers, or an
/// `app/state` request for devices, which doubles as a state poll.
fn liveness_ping_frame(role: PeerRole) -> Value {
    match role {
        PeerRole::Device => serde_json::json!({ "type": "app/state" }),
        PeerRole::Controller | PeerRole::Unclassified => serde_json::json!({ "type": "control/ping" }),
    }
}

async fn send_frame(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &Value,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(text)).await
}

async fn finalize_disconnect(state: &AppState, peer: &Arc<Peer>) {
    let udid = state.registry.remove(peer.id).await;
    state
        .activity
        .log(ActivityKind::PeerDisconnected, format!("peer {} disconnected", peer.id), None, None)
        .await;
    if let Some(udid) = udid {
        broker::broadcast_device_disconnect(state, &udid).await;
    }
}

//! Broker / Router (C5).
//!
//! Classifies anonymous peers into controller or device, decodes control and
//! device envelopes, fans control commands out to devices, correlates
//! `control/http` requests with device responses via C6, and broadcasts
//! device-originated envelopes (and disconnect notices) to every connected
//! controller. Grounded on the teacher's `tunnel::relay::device_register_ws`
//! / `handle_device_ws` message-type dispatch and `ws::mod::handle_ws`'s
//! `"type"`-keyed match.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::activity::ActivityKind;
use crate::http_proxy::{self, ControlHttpRequest, HttpResponseBody};
use crate::registry::Peer;
use crate::signer::Signer;
use crate::state::AppState;

/// How long an unclassified peer is given to send its first, classifying
/// envelope before the connection is dropped (§4.4 step 4).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    ts: i64,
    sign: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
}

pub enum Classification {
    Controller,
    Device { udid: String },
    Reject,
}

/// Attempt to classify the first inbound frame from an unclassified peer
/// (§4.4 handshake steps 1–3).
#[must_use]
pub fn classify(state: &AppState, raw: &Value) -> Classification {
    if let Ok(envelope) = serde_json::from_value::<ControlEnvelope>(raw.clone()) {
        if envelope.kind.starts_with("control/") {
            let now = unix_now();
            if Signer::verify(&state.config.passhash, envelope.ts, &envelope.sign, now) {
                return Classification::Controller;
            }
            return Classification::Reject;
        }
    }
    if let Ok(envelope) = serde_json::from_value::<DeviceEnvelope>(raw.clone()) {
        if envelope.kind == "app/state" {
            if let Some(udid) = envelope
                .body
                .get("system")
                .and_then(|s| s.get("udid"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            {
                return Classification::Device { udid: udid.to_string() };
            }
        }
    }
    Classification::Reject
}

/// Handle a raw frame from an already-classified controller peer.
pub async fn handle_controller_frame(state: &AppState, peer: &Arc<Peer>, raw: Value) {
    let envelope: ControlEnvelope = match serde_json::from_value(raw) {
        Ok(e) => e,
        Err(e) => {
            state
                .activity
                .log(ActivityKind::EnvelopeMalformed, format!("bad control envelope: {e}"), None, None)
                .await;
            return;
        }
    };

    let now = unix_now();
    if !Signer::verify(&state.config.passhash, envelope.ts, &envelope.sign, now) {
        state
            .activity
            .log(ActivityKind::SignatureRejected, "control envelope signature invalid", None, None)
            .await;
        return;
    }

    match envelope.kind.as_str() {
        "control/devices" => {
            let snapshot = state.registry.snapshot_device_states().await;
            let _ = peer.send(json!({ "type": "control/devices", "body": snapshot })).await;
        }
        "control/refresh" => {
            for (_, device_peer) in state.registry.all_devices().await {
                let _ = device_peer.send(json!({ "type": "app/state" })).await;
            }
        }
        "control/command" => {
            dispatch_command(state, &envelope.body, envelope.request_id).await;
        }
        "control/commands" => {
            if let Some(commands) = envelope.body.get("commands").and_then(Value::as_array) {
                for command in commands.clone() {
                    dispatch_command(state, &command, None).await;
                }
            }
        }
        "control/http" => {
            handle_control_http(state, peer, envelope.body).await;
        }
        other => {
            state
                .activity
                .log(ActivityKind::EnvelopeMalformed, format!("unknown control type: {other}"), None, None)
                .await;
        }
    }
}

/// `control/command` fan-out (§4.4): validate `devices` is non-empty, then
/// enqueue one copy per target. Missing targets are silently skipped (§4.4
/// "fan-out failure").
async fn dispatch_command(state: &AppState, body: &Value, request_id_hint: Option<String>) {
    let Some(devices) = body.get("devices").and_then(Value::as_array) else {
        return;
    };
    if devices.is_empty() {
        return;
    }
    let Some(kind) = body.get("type").and_then(Value::as_str) else {
        return;
    };
    let payload = body.get("body").cloned().unwrap_or(Value::Null);
    let request_id = request_id_hint
        .or_else(|| body.get("requestId").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut fanned_out = 0u32;
    for device in devices {
        let Some(udid) = device.as_str() else { continue };
        if let Some(device_peer) = state.registry.lookup_by_udid(udid).await {
            let frame = json!({ "type": kind, "body": payload, "requestId": request_id });
            if device_peer.send(frame).await.is_ok() {
                fanned_out += 1;
            }
        }
    }
    state
        .activity
        .log(
            ActivityKind::FanOut,
            format!("fanned out {kind} to {fanned_out}/{} targets", devices.len()),
            None,
            Some(request_id),
        )
        .await;
}

async fn handle_control_http(state: &AppState, origin: &Arc<Peer>, body: Value) {
    let req: ControlHttpRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            state
                .activity
                .log(ActivityKind::EnvelopeMalformed, format!("bad control/http body: {e}"), None, None)
                .await;
            return;
        }
    };
    if req.devices.is_empty() {
        return;
    }

    let frame = http_proxy::build_device_request_frame(&req);
    let mut delivered = false;
    for udid in &req.devices {
        if let Some(device_peer) = state.registry.lookup_by_udid(udid).await {
            if device_peer.send(frame.clone()).await.is_ok() {
                delivered = true;
            }
        }
    }
    if !delivered {
        return;
    }

    let pending = state.pending_http.clone();
    let origin = origin.clone();
    let ice_servers = state.turn.ice_servers().await;
    let request_id = req.request_id.clone();
    tokio::spawn(async move {
        let response = pending.await_response(request_id.clone()).await;
        let enriched = http_proxy::enrich_webrtc_response(&req, response, &ice_servers);
        let _ = origin.send(build_http_response_frame(&enriched)).await;
    });
}

fn build_http_response_frame(body: &HttpResponseBody) -> Value {
    json!({ "type": "http/response", "body": body })
}

/// Handle a raw frame from an already-classified device peer.
pub async fn handle_device_frame(state: &AppState, peer: &Arc<Peer>, udid: &str, raw: Value) {
    let envelope: DeviceEnvelope = match serde_json::from_value(raw) {
        Ok(e) => e,
        Err(e) => {
            state
                .activity
                .log(ActivityKind::EnvelopeMalformed, format!("bad device envelope: {e}"), None, None)
                .await;
            return;
        }
    };

    if envelope.kind == "http/response" {
        if let Ok(mut response) = serde_json::from_value::<HttpResponseBody>(envelope.body) {
            response.request_id = envelope
                .request_id
                .unwrap_or(response.request_id);
            state.pending_http.resolve(response).await;
        }
        return;
    }

    if envelope.kind == "app/state" {
        state.registry.update_device_state(udid, envelope.body.clone()).await;
    }

    broadcast_device_envelope(state, udid, &envelope.kind, envelope.body, envelope.request_id).await;
}

async fn broadcast_device_envelope(
    state: &AppState,
    udid: &str,
    kind: &str,
    body: Value,
    request_id: Option<String>,
) {
    let mut frame = json!({ "type": kind, "body": body, "udid": udid });
    if let Some(request_id) = request_id {
        frame["requestId"] = Value::String(request_id);
    }
    broadcast_to_controllers(state, frame).await;
}

/// Broadcast a frame to every connected controller peer (used for ordinary
/// device-originated envelopes and for `device/disconnect`).
pub async fn broadcast_to_controllers(state: &AppState, frame: Value) {
    for controller in state.registry.all_controllers().await {
        let _ = controller.send(frame.clone()).await;
    }
}

/// Build and broadcast a `device/disconnect` notice (§4.4, §9 — MUST precede
/// any envelope from a peer that reclaimed the same udid).
pub async fn broadcast_device_disconnect(state: &AppState, udid: &str) {
    info!(udid, "device disconnected");
    broadcast_to_controllers(state, json!({ "type": "device/disconnect", "body": udid })).await;
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn log_peer_discarded(reason: &str) {
    warn!(reason, "peer discarded during handshake");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_device_requires_udid() {
        let state_frame = json!({ "type": "app/state", "body": { "system": { "udid": "A" } } });
        match classify(&test_state(), &state_frame) {
            Classification::Device { udid } => assert_eq!(udid, "A"),
            _ => panic!("expected device classification"),
        }
    }

    #[test]
    fn classify_rejects_missing_udid() {
        let state_frame = json!({ "type": "app/state", "body": { "system": {} } });
        assert!(matches!(classify(&test_state(), &state_frame), Classification::Reject));
    }

    #[test]
    fn classify_controller_requires_valid_signature() {
        let mut state = test_state();
        let passhash = Signer::hash_password("pw");
        state.config = Arc::new({
            let mut c = (*state.config).clone();
            c.passhash = passhash.clone();
            c
        });
        let ts = unix_now();
        let sign = Signer::sign(&passhash, ts);
        let frame = json!({ "ts": ts, "sign": sign, "type": "control/devices" });
        assert!(matches!(classify(&state, &frame), Classification::Controller));

        let bad_frame = json!({ "ts": ts, "sign": "0000", "type": "control/devices" });
        assert!(matches!(classify(&state, &bad_frame), Classification::Reject));
    }

    fn test_state() -> AppState {
        AppState::new_for_test()
    }
}

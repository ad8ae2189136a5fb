//! Signature-verification middleware for the HTTP front end (C11 §6).
//!
//! Every `/api/*` route requires the same `ts`/`sign` pair the websocket
//! control channel does (§4.1), passed as query parameters, except a small
//! whitelist of routes that must be reachable before a password has ever been
//! set. Grounded on the teacher's `auth::verify_request` axum middleware.

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::broker::unix_now;
use crate::signer::Signer;
use crate::state::AppState;

/// Exact-path routes reachable without a valid signature: a liveness probe,
/// the bind-script download (needed before any controller has learned the
/// password it would otherwise sign with), and the frontend bootstrap config
/// (§6 — the frontend needs it to render before a password is entered).
const WHITELIST_EXACT: &[&str] = &["/api/health", "/api/download-bind-script", "/api/config"];

/// Path prefixes reachable without a valid signature: the one-shot transfer
/// tokens (§6) are their own capability — the token in the URL is the proof
/// of authorization, so requiring a `ts`/`sign` pair on top would make these
/// routes unreachable (and serves no purpose, since a device fetching/pushing
/// bytes has no password to sign with in the first place).
const WHITELIST_PREFIX: &[&str] = &["/api/transfer/download/", "/api/transfer/upload/"];

fn is_whitelisted(path: &str) -> bool {
    WHITELIST_EXACT.contains(&path) || WHITELIST_PREFIX.iter().any(|prefix| path.starts_with(prefix))
}

pub async fn require_signature<B>(
    State(state): State<AppState>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    if is_whitelisted(request.uri().path()) {
        return next.run(request).await;
    }

    let Some((ts, sign)) = request.uri().query().and_then(parse_signature_query) else {
        return (StatusCode::UNAUTHORIZED, "missing ts/sign").into_response();
    };

    let now = unix_now();
    if Signer::verify(&state.config.passhash, ts, &sign, now) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "invalid signature").into_response()
    }
}

/// `ts` and `sign` are always plain decimal/hex, so a full percent-decoding
/// query parser is unnecessary — split on `&`/`=` directly.
fn parse_signature_query(query: &str) -> Option<(i64, String)> {
    let mut ts = None;
    let mut sign = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "ts" => ts = value.parse::<i64>().ok(),
            "sign" => sign = Some(value.to_string()),
            _ => {}
        }
    }
    Some((ts?, sign?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ts_and_sign_in_any_order() {
        let (ts, sign) = parse_signature_query("sign=abc123&ts=1700000000").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(sign, "abc123");
    }

    #[test]
    fn missing_field_yields_none() {
        assert!(parse_signature_query("ts=1700000000").is_none());
    }

    #[test]
    fn whitelists_exact_paths() {
        assert!(is_whitelisted("/api/health"));
        assert!(is_whitelisted("/api/config"));
        assert!(is_whitelisted("/api/download-bind-script"));
        assert!(!is_whitelisted("/api/devices"));
    }

    #[test]
    fn whitelists_transfer_token_paths_by_prefix() {
        assert!(is_whitelisted("/api/transfer/download/abc-123"));
        assert!(is_whitelisted("/api/transfer/upload/abc-123"));
        assert!(!is_whitelisted("/api/transfer/push-to-device"));
    }
}

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use td_verifier::attestation::constant_time_eq;
use td_verifier::AttestationKind;
use tokio::signal;
use tracing::{error, warn};

use crate::backend::NonceResponse;
use crate::errors::AuthError;
use crate::records::Fields;
use crate::state::AppState;
use crate::token::{Credential, TokenEntry};

/// Liveness probe endpoint.
pub async fn ready() -> &'static str {
    "ready"
}

#[derive(Serialize)]
/// Static response body for `/health`.
pub struct Health {
    pub status: &'static str,
}

pub async fn health(State(_state): State<AppState>) -> (StatusCode, Json<Health>) {
    (StatusCode::OK, Json(Health { status: "ok" }))
}

#[derive(Deserialize)]
pub struct NonceRequest {
    #[serde(default)]
    pub totp: String,
}

#[derive(Deserialize)]
/// Login body of both kinds; each reads the fields it needs.
pub struct LoginRequest {
    #[serde(default)]
    pub totp: String,
    /// Base64 TDX quote.
    #[serde(default)]
    pub quote: String,
    /// Base64 JSON of the TPM 2.0 platform parameters.
    #[serde(default)]
    pub attestation: String,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub auth: Credential,
}

#[derive(Deserialize)]
pub struct LookupRequest {
    #[serde(default)]
    pub token: String,
}

fn parse_kind(kind: &str) -> Result<AttestationKind, AuthError> {
    Ok(kind.parse()?)
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    body.map(|Json(req)| req)
        .map_err(|rej| AuthError::InvalidRequest(rej.body_text()))
}

/// Unauthenticated endpoints fail with the same delay and message whatever went wrong.
async fn reject<T>(state: &AppState, err: AuthError) -> Result<T, AuthError> {
    state.backend.sanitise(async { Err(err) }).await
}

pub async fn nonce(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    body: Result<Json<NonceRequest>, JsonRejection>,
) -> Result<Json<NonceResponse>, AuthError> {
    let (kind, req) = match parse_kind(&kind).and_then(|k| Ok((k, parse_body(body)?))) {
        Ok(parsed) => parsed,
        Err(err) => return reject(&state, err).await,
    };
    let cancel = state.request_token();
    let res = match kind {
        AttestationKind::Tdx => state.backend.tdx_nonce(&cancel, &name, &req.totp).await,
        AttestationKind::Tpm2 => state.backend.tpm2_nonce(&cancel, &name, &req.totp).await,
    };
    res.map(Json)
}

pub async fn login(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AuthError> {
    let (kind, req) = match parse_kind(&kind).and_then(|k| Ok((k, parse_body(body)?))) {
        Ok(parsed) => parsed,
        Err(err) => return reject(&state, err).await,
    };
    let cancel = state.request_token();
    let auth = match kind {
        AttestationKind::Tdx => {
            state
                .backend
                .tdx_login(&cancel, &name, &req.totp, &req.quote)
                .await?
        }
        AttestationKind::Tpm2 => {
            state
                .backend
                .tpm2_login(&cancel, &name, &req.totp, &req.attestation, &req.nonce)
                .await?
        }
    };
    Ok(Json(LoginResponse { auth }))
}

pub async fn alias(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Value>, AuthError> {
    let alias = state.backend.alias(parse_kind(&kind)?, &name)?;
    Ok(Json(json!({ "alias": alias })))
}

pub async fn upsert_domain(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Fields>, AuthError> {
    let kind = parse_kind(&kind)?;
    // an empty body is a create with defaults
    let fields: Fields = if body.iter().all(u8::is_ascii_whitespace) {
        Fields::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AuthError::InvalidRequest(format!("failed to parse request body: {e}")))?
    };
    let out = state
        .backend
        .upsert(&state.request_token(), kind, &name, &fields)
        .await?;
    Ok(Json(out))
}

pub async fn read_domain(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Fields>, AuthError> {
    let kind = parse_kind(&kind)?;
    let out = state.backend.read(&state.request_token(), kind, &name).await?;
    Ok(Json(out))
}

pub async fn delete_domain(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<StatusCode, AuthError> {
    let kind = parse_kind(&kind)?;
    state.backend.delete(&state.request_token(), kind, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_domains(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, AuthError> {
    let kind = parse_kind(&kind)?;
    let keys = state.backend.list(&state.request_token(), kind).await?;
    Ok(Json(json!({ "keys": keys })))
}

pub async fn lookup_token(
    State(state): State<AppState>,
    body: Result<Json<LookupRequest>, JsonRejection>,
) -> Result<Json<TokenEntry>, AuthError> {
    let req = parse_body(body)?;
    if req.token.is_empty() {
        return Err(AuthError::InvalidRequest("`token` field is required".into()));
    }
    state
        .backend
        .tokens()
        .lookup(&req.token)
        .await?
        .map(Json)
        .ok_or_else(|| AuthError::InvalidRequest("token is unknown or expired".into()))
}

fn presented_admin_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer
        .or_else(|| headers.get("x-admin-token").and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

/// Gate of the record management API.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(AuthError::AdminDisabled);
    };
    let presented = presented_admin_token(req.headers()).unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        warn!(path = %req.uri().path(), "rejected admin request");
        return Err(AuthError::Unauthorized);
    }
    Ok(next.run(req).await)
}

/// Blocks until Ctrl+C (or SIGTERM on Unix) to trigger graceful shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, };
}

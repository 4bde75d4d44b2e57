//! HTTP surface - auth minting, session lifecycle, station directory
//!
//! Every body and response is JSON. Authenticated endpoints take a bearer
//! token minted by [crate::auth]; failures come back as `{ "error": ... }`
//! with the status the error kind dictates. Request payloads are picked
//! apart defensively rather than derive-deserialized, so a client sending a
//! number where a string belongs gets a clean invalid-input answer instead
//! of a framework rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::TypedHeader;
use headers::authorization::Bearer;
use headers::Authorization;
use serde_json::{json, Value};

use crate::auth::Principal;
use crate::registry::CodeLookup;
use crate::session::{Session, MAX_MEMBERS};
use crate::AppState;

/// Everything that can go wrong at the HTTP edge, mapped onto statuses
#[derive(Debug, PartialEq)]
pub enum ApiError {
    /// Client bug: missing or mistyped field
    BadInput(String),

    /// Missing, malformed or expired bearer token
    PermissionDenied,

    /// Unknown session or join code
    NotFound,

    /// An admission gate tripped
    RateLimited(&'static str),

    /// Session already at its member cap
    SessionFull,

    /// Join code past its TTL (the session itself may well be alive)
    Expired,

    /// Something on our side; the client did nothing wrong
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadInput(message) => (StatusCode::BAD_REQUEST, message),
            Self::PermissionDenied => (StatusCode::UNAUTHORIZED, "permission denied".into()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            Self::RateLimited(message) => (StatusCode::TOO_MANY_REQUESTS, message.into()),
            Self::SessionFull => (StatusCode::CONFLICT, "session full".into()),
            Self::Expired => (StatusCode::GONE, "join code expired".into()),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".into(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Resolve the bearer token on a request to a principal
fn authenticate(
    state: &AppState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Principal, ApiError> {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return Err(ApiError::PermissionDenied);
    };
    state.tokens.verify(bearer.token()).map_err(|err| {
        tracing::debug!("rejecting request with bad token: {err}");
        ApiError::PermissionDenied
    })
}

/// Unwrap a JSON body, turning framework rejections into our error shape
fn json_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    let Json(body) = body.map_err(|err| ApiError::BadInput(err.to_string()))?;
    Ok(body)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "status": "ok", "sessions": state.registry.session_count() }))
}

/// POST /auth - exchange an external-provider user id for a bearer token.
/// First contact also assigns the caller a display name and a station
/// frequency for the life of the process.
pub async fn mint_token(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let body = json_body(body)?;
    let Some(user_id) = body.get("spotifyUserId").and_then(Value::as_str) else {
        return Err(ApiError::BadInput(
            "spotifyUserId is required and must be a string".into(),
        ));
    };
    let display_name = body.get("displayName").and_then(Value::as_str);

    let profile = state.registry.register_user(user_id, display_name);
    let token = state
        .tokens
        .mint(user_id, &profile.display_name)
        .map_err(|err| {
            tracing::error!("failed to mint token for {user_id}: {err}");
            ApiError::Internal
        })?;
    Ok(Json(json!({ "token": token })))
}

/// POST /sessions - open a new station
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = authenticate(&state, bearer)?;
    let now = crate::now_ms();
    if !state.create_gate.check(&principal.user_id, now) {
        return Err(ApiError::RateLimited("too many sessions created recently"));
    }

    let (id, join_code) = state.registry.create_session(&principal, now);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "joinCode": join_code,
            "creatorId": principal.user_id,
            "djUserId": principal.user_id,
        })),
    ))
}

/// What a successful join returns: enough to open the WebSocket and render
/// the lobby
fn join_response(state: &AppState, session: &Session) -> Value {
    let dj_display_name = state
        .registry
        .profile(&session.dj_user_id)
        .map(|profile| profile.display_name)
        .unwrap_or_else(|| session.dj_user_id.clone());
    json!({
        "id": session.id,
        "joinCode": session.join_code,
        "djUserId": session.dj_user_id,
        "djDisplayName": dj_display_name,
        "memberCount": session.members.len(),
    })
}

/// POST /sessions/join - resolve a 4-digit join code
pub async fn join_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&state, bearer)?;
    let now = crate::now_ms();
    if !state.join_gate.check(&addr.ip().to_string(), now) {
        return Err(ApiError::RateLimited("too many join attempts"));
    }

    let body = json_body(body)?;
    let Some(code) = body.get("code").and_then(Value::as_str) else {
        return Err(ApiError::BadInput("code is required and must be a string".into()));
    };

    match state.registry.lookup_code(code, now) {
        CodeLookup::NotFound => Err(ApiError::NotFound),
        CodeLookup::Expired => Err(ApiError::Expired),
        CodeLookup::Found(session) => {
            let session = session.lock().unwrap();
            if session.members.len() >= MAX_MEMBERS
                && !session.members.contains_key(&principal.user_id)
            {
                return Err(ApiError::SessionFull);
            }
            Ok(Json(join_response(&state, &session)))
        }
    }
}

/// POST /sessions/join-by-id - rejoin a known session directly, bypassing
/// the (possibly expired) join code
pub async fn join_session_by_id(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, bearer)?;
    let body = json_body(body)?;
    let Some(session_id) = body.get("sessionId").and_then(Value::as_str) else {
        return Err(ApiError::BadInput(
            "sessionId is required and must be a string".into(),
        ));
    };

    let Some(session) = state.registry.session(session_id) else {
        return Err(ApiError::NotFound);
    };
    let session = session.lock().unwrap();
    Ok(Json(join_response(&state, &session)))
}

/// GET /sessions/{id} - full state snapshot
pub async fn session_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, bearer)?;
    let Some(session) = state.registry.session(&id) else {
        return Err(ApiError::NotFound);
    };
    let snapshot = session.lock().unwrap().snapshot();
    Ok(Json(
        serde_json::to_value(snapshot).expect("snapshots always serialize"),
    ))
}

/// GET /stations - the dial: every session currently playing or with
/// something queued, listed under its DJ's frequency
pub async fn stations(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Value>, ApiError> {
    authenticate(&state, bearer)?;

    let mut stations = Vec::new();
    for session in state.registry.sessions_snapshot() {
        let session = session.lock().unwrap();
        if !session.is_playing && session.queue.is_empty() {
            continue;
        }
        let Some(profile) = state.registry.profile(&session.dj_user_id) else {
            continue;
        };
        stations.push(json!({
            "userId": session.dj_user_id,
            "displayName": profile.display_name,
            "frequency": profile.frequency,
            "sessionId": session.id,
            "currentTrack": session.current_track,
        }));
    }
    stations.sort_by(|a, b| {
        a["frequency"]
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&b["frequency"].as_f64().unwrap_or(0.0))
    });
    Ok(Json(json!({ "stations": stations })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session;
    use tokio::sync::mpsc;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Some("test-secret".into())))
    }

    fn bearer_for(state: &Arc<AppState>, user_id: &str) -> Option<TypedHeader<Authorization<Bearer>>> {
        let profile = state.registry.register_user(user_id, None);
        let token = state.tokens.mint(user_id, &profile.display_name).unwrap();
        Some(TypedHeader(Authorization::bearer(&token).unwrap()))
    }

    fn local_addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000)))
    }

    #[tokio::test]
    async fn health_reports_session_count() {
        let state = test_state();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["sessions"], json!(0));
    }

    #[tokio::test]
    async fn mint_token_round_trips_through_verify() {
        let state = test_state();
        let body = Ok(Json(json!({ "spotifyUserId": "a", "displayName": "DJ A" })));
        let Json(response) = mint_token(State(state.clone()), body).await.unwrap();
        let token = response["token"].as_str().unwrap();
        let principal = state.tokens.verify(token).unwrap();
        assert_eq!(principal.user_id, "a");
        assert_eq!(principal.display_name, "DJ A");
    }

    #[tokio::test]
    async fn mint_token_rejects_missing_or_mistyped_user_id() {
        let state = test_state();
        let result = mint_token(State(state.clone()), Ok(Json(json!({})))).await;
        assert!(matches!(result, Err(ApiError::BadInput(_))));

        let result = mint_token(
            State(state),
            Ok(Json(json!({ "spotifyUserId": 4711 }))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadInput(_))));
    }

    #[tokio::test]
    async fn create_session_requires_a_token() {
        let state = test_state();
        let result = create_session(State(state), None).await;
        assert!(matches!(result, Err(ApiError::PermissionDenied)));
    }

    #[tokio::test]
    async fn create_session_is_rate_limited_per_principal() {
        let state = test_state();
        for _ in 0..5 {
            create_session(State(state.clone()), bearer_for(&state, "busy"))
                .await
                .expect("under the limit");
        }
        let result = create_session(State(state.clone()), bearer_for(&state, "busy")).await;
        assert!(matches!(result, Err(ApiError::RateLimited(_))));

        // A different principal is unaffected
        assert!(create_session(State(state.clone()), bearer_for(&state, "other"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn join_resolves_codes_and_rejects_unknown_ones() {
        let state = test_state();
        let creator = crate::auth::Principal {
            user_id: "a".into(),
            display_name: "DJ A".into(),
        };
        state.registry.register_user("a", Some("DJ A"));
        let (id, code) = state.registry.create_session(&creator, crate::now_ms());

        let Json(body) = join_session(
            State(state.clone()),
            local_addr(),
            bearer_for(&state, "b"),
            Ok(Json(json!({ "code": code }))),
        )
        .await
        .unwrap();
        assert_eq!(body["id"], json!(id));
        assert_eq!(body["djUserId"], json!("a"));
        assert_eq!(body["djDisplayName"], json!("DJ A"));
        assert_eq!(body["memberCount"], json!(0));

        let result = join_session(
            State(state.clone()),
            local_addr(),
            bearer_for(&state, "b"),
            Ok(Json(json!({ "code": "0000" }))),
        )
        .await;
        // One in ten thousand chance of a collision with the real code
        if code != "0000" {
            assert!(matches!(result, Err(ApiError::NotFound)));
        }
    }

    #[tokio::test]
    async fn join_refuses_a_full_session() {
        let state = test_state();
        let creator = crate::auth::Principal {
            user_id: "a".into(),
            display_name: "DJ A".into(),
        };
        state.registry.register_user("a", None);
        let (id, code) = state.registry.create_session(&creator, crate::now_ms());
        let session = state.registry.session(&id).unwrap();
        for n in 0..MAX_MEMBERS {
            let (tx, _rx) = mpsc::unbounded_channel();
            session::connect(
                &mut session.lock().unwrap(),
                &format!("user-{n}"),
                "Listener",
                n as u64,
                tx,
            )
            .unwrap();
        }

        let result = join_session(
            State(state.clone()),
            local_addr(),
            bearer_for(&state, "late"),
            Ok(Json(json!({ "code": code }))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::SessionFull)));

        // An existing member may still re-resolve the code
        assert!(join_session(
            State(state.clone()),
            local_addr(),
            bearer_for(&state, "user-0"),
            Ok(Json(json!({ "code": code }))),
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn join_by_id_skips_the_code_entirely() {
        let state = test_state();
        let creator = crate::auth::Principal {
            user_id: "a".into(),
            display_name: "DJ A".into(),
        };
        state.registry.register_user("a", None);
        let (id, _code) = state.registry.create_session(&creator, crate::now_ms());

        let Json(body) = join_session_by_id(
            State(state.clone()),
            bearer_for(&state, "b"),
            Ok(Json(json!({ "sessionId": id }))),
        )
        .await
        .unwrap();
        assert_eq!(body["id"], json!(id));

        let result = join_session_by_id(
            State(state.clone()),
            bearer_for(&state, "b"),
            Ok(Json(json!({ "sessionId": "no-such-session" }))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[tokio::test]
    async fn snapshot_returns_full_state_or_404() {
        let state = test_state();
        let creator = crate::auth::Principal {
            user_id: "a".into(),
            display_name: "DJ A".into(),
        };
        state.registry.register_user("a", None);
        let (id, _code) = state.registry.create_session(&creator, crate::now_ms());

        let Json(body) = session_snapshot(
            State(state.clone()),
            Path(id.clone()),
            bearer_for(&state, "a"),
        )
        .await
        .unwrap();
        assert_eq!(body["sessionId"], json!(id));
        assert_eq!(body["isPlaying"], json!(false));
        assert_eq!(body["djUserId"], json!("a"));

        let result = session_snapshot(
            State(state.clone()),
            Path("gone".into()),
            bearer_for(&state, "a"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[tokio::test]
    async fn stations_lists_only_live_or_stocked_sessions() {
        let state = test_state();
        let creator = crate::auth::Principal {
            user_id: "a".into(),
            display_name: "DJ A".into(),
        };
        state.registry.register_user("a", Some("DJ A"));
        let (silent_id, _) = state.registry.create_session(&creator, crate::now_ms());
        let (live_id, _) = state.registry.create_session(&creator, crate::now_ms());

        {
            let session = state.registry.session(&live_id).unwrap();
            let mut session = session.lock().unwrap();
            session.current_track = Some(crate::protocol::Track {
                id: "T1".into(),
                duration_ms: Some(1000.0),
                metadata: serde_json::Map::new(),
            });
            session.is_playing = true;
        }

        let Json(body) = stations(State(state.clone()), bearer_for(&state, "b"))
            .await
            .unwrap();
        let stations = body["stations"].as_array().unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0]["sessionId"], json!(live_id));
        assert_eq!(stations[0]["frequency"], json!(88.1));
        assert_eq!(stations[0]["currentTrack"]["id"], json!("T1"));
        assert_ne!(stations[0]["sessionId"], json!(silent_id));
    }
}

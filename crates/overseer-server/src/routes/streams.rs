//! Stream watch routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use overseer_core::types::{CreateWatchRequest, NewWatch, ReportRequest, SessionKey, WatchSession};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::services::delegation::{self, Placement};
use crate::services::reporter;
use crate::state::AppState;

/// Create stream router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/streams", get(list_watches)).route(
        "/streams/{handle}/{game_kind}",
        get(get_watch)
            .put(create_watch)
            .patch(report)
            .delete(delete_watch),
    )
}

/// List every stream record of this node
pub async fn list_watches(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WatchSession>>, ApiError> {
    Ok(Json(state.db.list_sessions()?))
}

/// Get one stream, as seen by the node watching it
pub async fn get_watch(
    State(state): State<Arc<AppState>>,
    Path((handle, game_kind)): Path<(String, String)>,
) -> Result<Json<WatchSession>, ApiError> {
    let key = SessionKey::new(handle, game_kind);
    Ok(Json(delegation::get_watch(&state, &key).await?))
}

/// Watch a stream for a match, or attach the match to a watched stream
pub async fn create_watch(
    State(state): State<Arc<AppState>>,
    Path((handle, game_kind)): Path<(String, String)>,
    Json(req): Json<CreateWatchRequest>,
) -> Result<(StatusCode, Json<WatchSession>), ApiError> {
    let new = NewWatch {
        handle,
        game_kind,
        match_ref: req.match_ref,
        participant_a: req.participant_a,
        participant_b: req.participant_b,
    };

    let placement = delegation::create_watch(&state, new).await?;
    let status = match placement {
        Placement::Created(_) => StatusCode::CREATED,
        Placement::Forwarded(_) | Placement::Attached(_) => StatusCode::OK,
    };
    Ok((status, Json(placement.into_session())))
}

/// Result or event reported by the node watching the stream
pub async fn report(
    State(state): State<Arc<AppState>>,
    Path((handle, game_kind)): Path<(String, String)>,
    Json(req): Json<ReportRequest>,
) -> Result<StatusCode, ApiError> {
    let key = SessionKey::new(handle, game_kind);
    let report = req
        .into_report()
        .ok_or_else(|| ApiError::InvalidReport("either winner or event is required".to_string()))?;

    info!(key = %key, "Report received");
    reporter::report(&state, &key, report).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Acknowledge a result and drop the stream
pub async fn delete_watch(
    State(state): State<Arc<AppState>>,
    Path((handle, game_kind)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let key = SessionKey::new(handle, game_kind);
    delegation::delete_watch(&state, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::state::AppState;
    use crate::config::PeerConfig;
    use crate::testing::{spawn_node, test_state, RecordingSink};
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{Method, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use overseer_core::types::{LifecycleState, Winner};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(adjust: impl FnOnce(&mut crate::config::Config)) -> (Router, Arc<AppState>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(Arc::clone(&sink), adjust);
        (create_router(Arc::clone(&state)), state, sink)
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        req
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn watch_body(match_ref: &str, a: &str, b: &str) -> Value {
        json!({ "match_ref": match_ref, "participant_a": a, "participant_b": b })
    }

    #[tokio::test]
    async fn test_create_get_and_attach() {
        let (app, state, _) = router(|_| {});

        let (status, body) = send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["primary_match_ref"], "10");

        let (status, body) = send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("20", "Bob", "Alice"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["linked_matches"][0]["match_ref"], "20");
        assert_eq!(body["linked_matches"][0]["inverted"], true);

        let (status, body) = send(&app, request(Method::GET, "/streams/streamer/test", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["participant_a"], "Alice");

        let (status, body) = send(&app, request(Method::GET, "/streams", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(state.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_participants() {
        let (app, _, _) = router(|_| {});
        send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;

        let (status, body) = send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("20", "Alice", "Carol"))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], 409);
    }

    #[tokio::test]
    async fn test_no_capacity_creates_no_record() {
        let (app, state, _) = router(|c| c.node.max_sessions = 0);

        let (status, body) = send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;
        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(body["error_code"], 507);
        assert!(state.db.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_game_kind() {
        let (app, _, _) = router(|_| {});
        let (status, _) = send(
            &app,
            request(Method::PUT, "/streams/streamer/chess", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_report_result_settles_and_deletes() {
        let (app, state, sink) = router(|_| {});
        send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;

        let (status, _) = send(
            &app,
            request(
                Method::PATCH,
                "/streams/streamer/test",
                Some(json!({ "winner": "participant_b", "strong": true, "details": "1 - 2", "timestamp": 1400000000.0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let results = sink.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.winner, Winner::ParticipantB);

        assert!(state.pool.wait_idle(std::time::Duration::from_secs(5)).await);
        for _ in 0..100 {
            if state.db.get_session("streamer", "test").unwrap().is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("settled record was not deleted");
    }

    #[tokio::test]
    async fn test_empty_report_is_rejected() {
        let (app, _, _) = router(|_| {});
        let (status, body) = send(
            &app,
            request(Method::PATCH, "/streams/streamer/test", Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], 400);
    }

    #[tokio::test]
    async fn test_delete_unknown_stream() {
        let (app, _, _) = router(|_| {});
        let (status, _) = send(&app, request(Method::DELETE, "/streams/ghost/test", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_keeps_other_state_consistent() {
        let (app, state, _) = router(|_| {});
        send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;
        let record = state.db.get_session("streamer", "test").unwrap().unwrap();
        assert!(matches!(record.state, LifecycleState::Waiting | LifecycleState::Watching));

        let (status, _) = send(&app, request(Method::DELETE, "/streams/streamer/test", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.pool.wait_idle(std::time::Duration::from_secs(5)).await);
        assert!(state.db.list_sessions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load() {
        let (app, _, _) = router(|c| c.node.max_sessions = 2);
        let (status, body) = send(&app, request(Method::GET, "/load", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_sessions"], 0);
        assert_eq!(body["max_sessions"], 2);
    }

    #[tokio::test]
    async fn test_unknown_origin_is_forbidden() {
        let sink = Arc::new(RecordingSink::default());
        let state = test_state(sink, |c| c.node.trust_real_ip_header = true);
        let app = create_router(state);

        let mut req = Request::builder().uri("/load").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([8, 8, 8, 8], 40000))));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_code"], 403);

        // a forged header from an unknown peer changes nothing
        let mut req = Request::builder()
            .uri("/load")
            .header("X-Real-IP", "127.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([8, 8, 8, 8], 40000))));
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // health stays public
        let mut req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([8, 8, 8, 8], 40000))));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_forwarded_stream_answers_ok() {
        let child = test_state(Arc::new(RecordingSink::default()), |_| {});
        let url = spawn_node(Arc::clone(&child)).await;
        let (app, state, _) = router(|c| {
            c.children.push(PeerConfig {
                name: "slave1".to_string(),
                url,
            })
        });

        let (status, body) = send(
            &app,
            request(Method::PUT, "/streams/streamer/test", Some(watch_body("10", "Alice", "Bob"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], "slave1");
        assert_eq!(state.pool.len(), 0);
        assert_eq!(child.pool.len(), 1);

        // the child answers for the stream it watches
        let (status, body) = send(&app, request(Method::GET, "/streams/streamer/test", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], Value::Null);

        let (status, _) = send(&app, request(Method::DELETE, "/streams/streamer/test", None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.db.list_sessions().unwrap().is_empty());
        assert!(child.db.list_sessions().unwrap().is_empty());
    }
}

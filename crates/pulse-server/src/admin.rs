//! Administrative HTTP surface: stats, connection lookup, and broadcast.
//!
//! Every route requires `Authorization: Bearer <jwt>` whose claims carry
//! `role = "admin"`.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use pulse_auth::{AuthError, Identity};
use pulse_core::{Envelope, EventCategory, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::authority::{AuthorityStats, ConnectionInfo};
use crate::server::AppState;

/// Admin request failures.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No usable bearer token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Authenticated but not an admin.
    #[error("admin role required")]
    Forbidden,
    /// No such connection.
    #[error("connection {0} not found")]
    NotFound(String),
    /// The request body is not acceptable.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

impl From<AuthError> for AdminError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

/// `POST /admin/broadcast` body.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Message type to send (a server-to-client tag).
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Restrict delivery to subscribers of this category.
    #[serde(default)]
    pub category: Option<String>,
}

/// `POST /admin/broadcast` response.
#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    /// Connections the message was queued to.
    pub delivered: usize,
}

/// Admin routes, to be merged into the main router.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/stats", get(stats_handler))
        .route("/admin/connections/{id}", get(connection_handler))
        .route("/admin/broadcast", post(broadcast_handler))
}

async fn authorize(headers: &HeaderMap, state: &AppState) -> Result<Identity, AdminError> {
    let token = bearer_token(headers)?;
    let identity = state.authority.validator().validate(token).await?;
    if !identity.is_admin {
        warn!(user_id = %identity.user_id, "non-admin request to admin surface");
        return Err(AdminError::Forbidden);
    }
    Ok(identity)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AdminError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AdminError::Unauthorized("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| AdminError::Unauthorized("Authorization header is not ASCII".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AdminError::Unauthorized("expected a bearer token".into()))?;
    Ok(token)
}

/// GET /admin/stats
async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuthorityStats>, AdminError> {
    let _ = authorize(&headers, &state).await?;
    Ok(Json(state.authority.stats()))
}

/// GET /admin/connections/{id}
async fn connection_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ConnectionInfo>, AdminError> {
    let _ = authorize(&headers, &state).await?;
    state
        .authority
        .connection_info(&id)
        .map(Json)
        .ok_or(AdminError::NotFound(id))
}

/// POST /admin/broadcast
async fn broadcast_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, AdminError> {
    let admin = authorize(&headers, &state).await?;

    let kind: MessageType = request
        .kind
        .parse()
        .map_err(|_| AdminError::BadRequest(format!("unknown message type '{}'", request.kind)))?;
    if kind.is_client_message() {
        return Err(AdminError::BadRequest(format!(
            "'{}' is a client-to-server type",
            request.kind
        )));
    }
    let category = request
        .category
        .as_deref()
        .map(str::parse::<EventCategory>)
        .transpose()
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;

    let delivered = state
        .authority
        .broadcast_envelope(&Envelope::new(kind, request.data), category);
    info!(
        admin = %admin.user_id,
        r#type = kind.as_str(),
        category = category.map(EventCategory::as_str),
        delivered,
        "admin broadcast"
    );
    Ok(Json(BroadcastResponse { delivered }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canceller::NoUploadPipeline;
    use crate::config::ServerConfig;
    use crate::server::PulseServer;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use pulse_auth::{AllowAllDirectory, Claims, JwtCredentialValidator, encode_token};
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "admin-test";

    fn server() -> PulseServer {
        let validator = JwtCredentialValidator::new(SECRET, Arc::new(AllowAllDirectory));
        PulseServer::new(
            ServerConfig::default(),
            Arc::new(validator),
            Arc::new(NoUploadPipeline),
        )
    }

    fn admin_token() -> String {
        let claims = Claims::for_user("ops", ChronoDuration::minutes(5)).with_role("admin");
        encode_token(&claims, SECRET).unwrap()
    }

    fn user_token(user: &str) -> String {
        encode_token(&Claims::for_user(user, ChronoDuration::minutes(5)), SECRET).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, token: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        let _ = headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
        let _ = headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc");
    }

    #[tokio::test]
    async fn stats_requires_token() {
        let resp = server()
            .router()
            .oneshot(get("/admin/stats", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "unauthorized");
    }

    #[tokio::test]
    async fn stats_requires_admin_role() {
        let token = user_token("u1");
        let resp = server()
            .router()
            .oneshot(get("/admin/stats", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stats_for_admin() {
        let srv = server();
        let _conn = srv.authority().admit(&user_token("u1")).await.unwrap();
        let token = admin_token();
        let resp = srv
            .router()
            .oneshot(get("/admin/stats", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stats = body_json(resp).await;
        assert_eq!(stats["connections"], 1);
        assert_eq!(stats["per_user_limit"], 3);
    }

    #[tokio::test]
    async fn connection_lookup() {
        let srv = server();
        let (conn, _rx) = srv.authority().admit(&user_token("u1")).await.unwrap();
        let token = admin_token();

        let resp = srv
            .router()
            .oneshot(get(&format!("/admin/connections/{}", conn.id), Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["user_id"], "u1");

        let resp = srv
            .router()
            .oneshot(get("/admin/connections/nope", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn broadcast_to_category_subscribers() {
        let srv = server();
        let (conn, mut rx) = srv.authority().admit(&user_token("u1")).await.unwrap();
        let _ = rx.recv().await;
        let _ = conn.subscribe(&[EventCategory::SystemMaintenance]);
        let (_other, _orx) = srv.authority().admit(&user_token("u2")).await.unwrap();

        let body = json!({
            "type": "system.maintenance",
            "data": {"in_minutes": 10},
            "category": "system.maintenance",
        });
        let resp = srv
            .router()
            .oneshot(post_json("/admin/broadcast", &admin_token(), &body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["delivered"], 1);

        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "system.maintenance");
        assert_eq!(msg["data"]["in_minutes"], 10);
    }

    #[tokio::test]
    async fn broadcast_without_category_reaches_everyone() {
        let srv = server();
        let _a = srv.authority().admit(&user_token("u1")).await.unwrap();
        let _b = srv.authority().admit(&user_token("u2")).await.unwrap();
        let body = json!({"type": "system.notification", "data": {"text": "hi"}});
        let resp = srv
            .router()
            .oneshot(post_json("/admin/broadcast", &admin_token(), &body))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["delivered"], 2);
    }

    #[tokio::test]
    async fn broadcast_rejects_client_types_and_unknown_categories() {
        let srv = server();
        let token = admin_token();
        let resp = srv
            .router()
            .oneshot(post_json("/admin/broadcast", &token, &json!({"type": "ping"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = srv
            .router()
            .oneshot(post_json(
                "/admin/broadcast",
                &token,
                &json!({"type": "file.ready", "category": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, patch, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::catalog::{AIModel, Channel, Effect, RuleTarget};
use crate::engine::EngineError;
use crate::entity::{Identity, Role, User};
use crate::manager::{ClientContext, SessionError};
use crate::service::{ChatError, ChatService};
use crate::store::Store;

pub const DEFAULT_CHANNEL: &str = "general";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("Request failed: {:#}", e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        let status = match &e {
            ChatError::NoSession | ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::NoAvailableModel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::ModelNotAllowed { .. } => StatusCode::FORBIDDEN,
            ChatError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ChatError::Session(SessionError::NotOwned(_)) => StatusCode::FORBIDDEN,
            ChatError::Session(SessionError::NoCurrentSession) => StatusCode::BAD_REQUEST,
            ChatError::Session(SessionError::NotConfirmed) => StatusCode::UNPROCESSABLE_ENTITY,
            ChatError::Engine(EngineError::Busy(_)) => StatusCode::CONFLICT,
            ChatError::Session(SessionError::Storage(_))
            | ChatError::Engine(_)
            | ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("Request failed: {}", e);
        } else {
            debug!("Request rejected ({}): {}", status, e);
        }
        ApiError::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

/// Contexts idle this long are evicted unless a request still holds them.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct ClientSlot {
    context: Arc<ClientContext>,
    last_seen: Instant,
}

/// One context per signed-in user; dropped on logout or after going idle.
struct ClientRegistry {
    idle_timeout: Duration,
    slots: Mutex<HashMap<String, ClientSlot>>,
}

impl ClientRegistry {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_insert(&self, user_id: &str) -> Arc<ClientContext> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());

        let before = slots.len();
        slots.retain(|id, slot| {
            id == user_id
                || slot.last_seen.elapsed() < self.idle_timeout
                || Arc::strong_count(&slot.context) > 1
        });
        if slots.len() < before {
            debug!("Evicted {} idle client contexts", before - slots.len());
        }

        let slot = slots.entry(user_id.to_string()).or_insert_with(|| ClientSlot {
            context: Arc::new(ClientContext::new(user_id)),
            last_seen: Instant::now(),
        });
        slot.last_seen = Instant::now();
        slot.context.clone()
    }

    fn remove(&self, user_id: &str) -> Option<Arc<ClientContext>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.remove(user_id).map(|slot| slot.context)
    }
}

pub struct AppState {
    store: Arc<Store>,
    service: Arc<ChatService>,
    event_bus: Arc<EventBus>,
    admin_email: String,
    clients: ClientRegistry,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        service: Arc<ChatService>,
        event_bus: Arc<EventBus>,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            store,
            service,
            event_bus,
            admin_email: admin_email.into(),
            clients: ClientRegistry::new(CLIENT_IDLE_TIMEOUT),
        }
    }

    fn client_for(&self, user_id: &str) -> Arc<ClientContext> {
        self.clients.get_or_insert(user_id)
    }

    fn drop_client(&self, user_id: &str) -> Option<Arc<ClientContext>> {
        self.clients.remove(user_id)
    }

    async fn authenticate(&self, headers: &HeaderMap) -> ApiResult<(User, Arc<ClientContext>)> {
        let identity = identity_from_headers(headers)?;
        let user = self
            .store
            .get_or_create_user(&identity, &self.admin_email)
            .await?;
        let client = self.client_for(&user.id);
        Ok((user, client))
    }

    async fn authenticate_admin(&self, headers: &HeaderMap) -> ApiResult<User> {
        let (user, _) = self.authenticate(headers).await?;
        if !user.is_admin() {
            warn!("Non-admin {} attempted an admin operation", user);
            return Err(ApiError::new(StatusCode::FORBIDDEN, "Admin role required"));
        }
        Ok(user)
    }
}

/// Identity is asserted by the upstream proxy through `x-user-*` headers.
fn identity_from_headers(headers: &HeaderMap) -> ApiResult<Identity> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    match (get("x-user-id"), get("x-user-email")) {
        (Some(id), Some(email)) => Ok(Identity {
            id,
            email,
            display_name: get("x-user-name"),
        }),
        _ => Err(ApiError::new(StatusCode::UNAUTHORIZED, "Missing identity headers")),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/:id/models", get(channel_models))
        .route("/sessions", get(list_sessions).post(start_session))
        .route("/sessions/current", post(open_current))
        .route("/sessions/current/clear", post(clear_current))
        .route("/sessions/:id/switch", post(switch_session))
        .route("/transcript", get(transcript))
        .route("/messages", post(send_message))
        .route("/export", get(export))
        .route("/events", get(events))
        .route("/logout", post(logout))
        .route("/admin/models", post(admin_upsert_model))
        .route("/admin/channels", post(admin_upsert_channel))
        .route("/admin/permissions", post(admin_add_permission))
        .route("/admin/permissions/:id", delete(admin_delete_permission))
        .route("/admin/users/:id", patch(admin_update_user))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// -----------------------------------------------------------------------------
// Chat handlers
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct SessionRequest {
    channel_id: Option<String>,
    model_id: Option<String>,
}

impl SessionRequest {
    fn channel(&self) -> &str {
        self.channel_id.as_deref().unwrap_or(DEFAULT_CHANNEL)
    }

    fn model(&self) -> &str {
        self.model_id.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    text: String,
    model_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ClearRequest {
    #[serde(default)]
    confirm: bool,
}

async fn list_channels(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let (user, _) = state.authenticate(&headers).await?;
    Ok(Json(state.service.channels(&user).await?))
}

async fn channel_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(channel_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (user, _) = state.authenticate(&headers).await?;
    Ok(Json(state.service.models(&user, &channel_id).await?))
}

async fn list_sessions(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let (user, _) = state.authenticate(&headers).await?;
    Ok(Json(state.service.history(&user).await?))
}

async fn open_current(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<SessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let (user, client) = state.authenticate(&headers).await?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    state
        .service
        .open_current(&client, &user, request.channel(), request.model())
        .await?;
    Ok(Json(state.service.transcript(&client)))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<SessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let (user, client) = state.authenticate(&headers).await?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let session = state
        .service
        .start_new(&client, &user, request.channel(), request.model())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn switch_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, client) = state.authenticate(&headers).await?;
    state.service.switch_to(&client, &session_id).await?;
    Ok(Json(state.service.transcript(&client)))
}

async fn transcript(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let (_, client) = state.authenticate(&headers).await?;
    Ok(Json(state.service.transcript(&client)))
}

/// Runs the whole turn; draft progress is delivered over `/events`.
async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> ApiResult<impl IntoResponse> {
    let (user, client) = state.authenticate(&headers).await?;
    let outcome = state
        .service
        .send_message(&client, &user, &request.text, request.model_id.as_deref())
        .await?;
    Ok(Json(outcome))
}

async fn export(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let (_, client) = state.authenticate(&headers).await?;
    let export = state.service.export(&client).await?;
    let body = export.to_json()?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.file_name()),
            ),
        ],
        body,
    ))
}

async fn clear_current(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<ClearRequest>>,
) -> ApiResult<impl IntoResponse> {
    let (_, client) = state.authenticate(&headers).await?;
    let confirm = body.map(|Json(r)| r.confirm).unwrap_or(false);

    let removed = state.service.clear_current(&client, confirm).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let identity = identity_from_headers(&headers)?;
    if let Some(client) = state.drop_client(&identity.id) {
        client.reset();
        info!("User {} logged out", identity.id);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, axum::BoxError>>>> {
    let (user, _) = state.authenticate(&headers).await?;
    info!("New SSE connection for {}", user);

    let mut rx = state.event_bus.subscribe();
    let user_id = user.id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) if event.user_id() == user_id => {
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(SseEvent::default().event(event.kind()).data(data)),
                        Err(e) => error!("Failed to serialize event: {}", e),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber for {} lagged, {} events skipped", user_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// -----------------------------------------------------------------------------
// Admin handlers
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PermissionRequest {
    user_id: String,
    channel_id: Option<String>,
    model_id: Option<String>,
    effect: Effect,
}

#[derive(Debug, Deserialize)]
struct UserUpdate {
    role: Option<Role>,
    is_active: Option<bool>,
}

async fn admin_upsert_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(model): Json<AIModel>,
) -> ApiResult<impl IntoResponse> {
    let admin = state.authenticate_admin(&headers).await?;
    model
        .validate()
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    state.store.upsert_model(&model).await?;
    info!("{} saved model {}", admin, model.id);
    Ok(Json(model))
}

async fn admin_upsert_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(channel): Json<Channel>,
) -> ApiResult<impl IntoResponse> {
    let admin = state.authenticate_admin(&headers).await?;
    if channel.id.trim().is_empty() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "Channel id is required"));
    }

    let models = state.service.catalog().list_models().await?;
    let unknown = channel.allowed_models.unknown_ids(&models);
    if !unknown.is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Unknown models in allow-list: {}", unknown.join(", ")),
        ));
    }

    state.store.upsert_channel(&channel).await?;
    info!("{} saved channel {}", admin, channel.id);
    Ok(Json(channel))
}

async fn admin_add_permission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PermissionRequest>,
) -> ApiResult<impl IntoResponse> {
    let admin = state.authenticate_admin(&headers).await?;
    let target = RuleTarget::from_columns(request.channel_id, request.model_id)
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let rule = state
        .store
        .add_permission(&request.user_id, target, request.effect)
        .await?;
    info!(
        "{} added {} rule {} for user {}",
        admin,
        rule.effect.as_str(),
        rule.id,
        rule.user_id
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn admin_delete_permission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(rule_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let admin = state.authenticate_admin(&headers).await?;
    if !state.store.delete_permission(&rule_id).await? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "Permission rule not found"));
    }
    info!("{} deleted permission rule {}", admin, rule_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_update_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(update): Json<UserUpdate>,
) -> ApiResult<impl IntoResponse> {
    let admin = state.authenticate_admin(&headers).await?;
    let user = state
        .store
        .update_user(&user_id, update.role, update.is_active)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "User not found"))?;

    info!("{} updated user {}", admin, user);
    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn identity_requires_id_and_email() {
        let identity = identity_from_headers(&headers(&[
            ("x-user-id", "u1"),
            ("x-user-email", "u1@example.com"),
            ("x-user-name", " "),
        ]))
        .unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.display_name, None);

        let err = identity_from_headers(&headers(&[("x-user-id", "u1")])).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn idle_clients_are_evicted_unless_in_use() {
        let registry = ClientRegistry::new(Duration::ZERO);

        let held = registry.get_or_insert("a");
        drop(registry.get_or_insert("b"));
        let c = registry.get_or_insert("c");

        // "a" is still referenced, "b" was idle and unreferenced.
        let slots = registry.slots.lock().unwrap();
        assert!(slots.contains_key("a"));
        assert!(!slots.contains_key("b"));
        assert!(slots.contains_key("c"));
        drop(slots);

        assert!(Arc::ptr_eq(&held, &registry.get_or_insert("a")));
        assert!(Arc::ptr_eq(&c, &registry.remove("c").unwrap()));
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        let cases = [
            (ChatError::EmptyMessage, StatusCode::BAD_REQUEST),
            (ChatError::NoAvailableModel("general".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ChatError::ModelNotAllowed {
                    channel: "coding".into(),
                    model: "gpt-4o-mini".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (ChatError::Engine(EngineError::Busy("s".into())), StatusCode::CONFLICT),
            (ChatError::Session(SessionError::NotFound("s".into())), StatusCode::NOT_FOUND),
            (ChatError::Session(SessionError::NotConfirmed), StatusCode::UNPROCESSABLE_ENTITY),
            (ChatError::Storage(anyhow::anyhow!("db gone")), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}

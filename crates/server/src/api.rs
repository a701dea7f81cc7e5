//! HTTP routes: course records, accounts, progress, and session diagnostics.
//!
//! Every record route acquires the shared store connection first, so the
//! first request after an idle close transparently reopens it. Response
//! bodies keep the field names and messages the web frontend expects.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use campusdock_protocol::{ConnectionStatus, DisconnectReport, ServerMessage, SessionStatusEntry};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::admin_token_middleware;
use crate::state::AppState;
use crate::store::{run_blocking, Course, NewCourse, StoreError, StoreHandle};
use crate::websocket::ws_handler;

/// Errors surfaced to HTTP clients as `{ "error": ... }`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Faltan datos")]
    MissingFields,

    #[error("Usuario ya existe")]
    UserExists,

    #[error("Credenciales incorrectas")]
    BadCredentials,

    #[error("Usuario no encontrado")]
    UserNotFound,

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("{message}")]
    Internal {
        message: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFields => StatusCode::BAD_REQUEST,
            ApiError::UserExists => StatusCode::CONFLICT,
            ApiError::BadCredentials => StatusCode::UNAUTHORIZED,
            ApiError::UserNotFound | ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a store failure, using `message` for anything unexpected.
    fn from_store(message: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => ApiError::UserExists,
            StoreError::Unauthorized => ApiError::BadCredentials,
            StoreError::NotFound(_) => ApiError::UserNotFound,
            source => {
                error!(
                    component = "api",
                    event = "api.store_failed",
                    error = %source,
                    "{message}"
                );
                ApiError::Internal { message, source }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn mensaje(text: &str) -> Json<Value> {
    Json(json!({ "mensaje": text }))
}

/// Acquire the store and run `op` on the blocking pool.
async fn with_store<T, F>(state: &AppState, failure: &'static str, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&StoreHandle) -> Result<T, StoreError> + Send + 'static,
{
    let lease = state
        .store
        .acquire()
        .await
        .map_err(|e| ApiError::from_store(failure, e.into()))?;
    run_blocking(lease, op)
        .await
        .map_err(|e| ApiError::from_store(failure, e))
}

/// Build the full application router.
pub fn router(state: AppState, admin_token: Option<String>) -> Router {
    let mut diagnostics = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/disconnect-idle", post(disconnect_idle))
        .route("/api/sessions/{id}/disconnect", post(disconnect_session))
        .route("/api/connection", get(connection_status));
    if let Some(token) = admin_token {
        diagnostics = diagnostics.route_layer(middleware::from_fn_with_state(
            token,
            admin_token_middleware,
        ));
    }

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/curso", post(create_course))
        .route("/api/cursos", get(list_courses))
        .route("/api/registrar", post(register_user))
        .route("/api/login", post(login))
        .route("/api/progreso", post(save_progress))
        .route("/api/progreso/{usuario}", get(get_progress))
        .merge(diagnostics)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

// ── Records ─────────────────────────────────────────────────────────

pub async fn create_course(
    State(state): State<AppState>,
    body: Result<Json<NewCourse>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(course) = body.map_err(|_| ApiError::MissingFields)?;
    let id = with_store(&state, "Error al guardar el curso", move |store| {
        store.insert_course(&course)
    })
    .await?;

    let notified = state.registry.broadcast(ServerMessage::CourseAdded {
        message: "Nuevo curso agregado".to_string(),
    });
    info!(
        component = "api",
        event = "course.created",
        course_id = %id,
        notified,
        "Course stored"
    );
    Ok(mensaje("Curso recibido"))
}

pub async fn list_courses(State(state): State<AppState>) -> Result<Json<Vec<Course>>, ApiError> {
    with_store(&state, "Error al leer los cursos", |store| store.list_courses())
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    usuario: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn required(self) -> Result<(String, String), ApiError> {
        match (self.usuario, self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok((u, p)),
            _ => Err(ApiError::MissingFields),
        }
    }
}

pub async fn register_user(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(credentials) = body.map_err(|_| ApiError::MissingFields)?;
    let (usuario, password) = credentials.required()?;
    with_store(&state, "Error al registrar usuario", move |store| {
        store.register_user(&usuario, &password)
    })
    .await?;
    Ok(mensaje("Usuario registrado"))
}

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(credentials) = body.map_err(|_| ApiError::MissingFields)?;
    let (usuario, password) = credentials.required()?;
    with_store(&state, "Error al hacer login", move |store| {
        store.verify_login(&usuario, &password)
    })
    .await?;
    Ok(mensaje("Login correcto"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    usuario: Option<String>,
    curso_id: Option<Value>,
    paso: Option<Value>,
}

/// Course ids arrive as either strings or numbers.
fn course_key(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub async fn save_progress(
    State(state): State<AppState>,
    body: Result<Json<ProgressUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(update) = body.map_err(|_| ApiError::MissingFields)?;
    let usuario = update.usuario.filter(|u| !u.is_empty());
    let course_id = update.curso_id.and_then(course_key);
    let paso = update.paso.filter(|p| !p.is_null());
    let (Some(usuario), Some(course_id), Some(paso)) = (usuario, course_id, paso) else {
        return Err(ApiError::MissingFields);
    };

    with_store(&state, "Error al guardar progreso", move |store| {
        store.save_progress(&usuario, &course_id, &paso)
    })
    .await?;
    Ok(mensaje("Progreso guardado"))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(usuario): Path<String>,
) -> Result<Json<Value>, ApiError> {
    with_store(&state, "Error al obtener progreso", move |store| {
        store.get_progress(&usuario)
    })
    .await
    .map(Json)
}

// ── Diagnostics ─────────────────────────────────────────────────────

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionStatusEntry>> {
    Json(state.registry.list_status())
}

pub async fn connection_status(State(state): State<AppState>) -> Json<ConnectionStatus> {
    Json(state.store.status())
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DisconnectReport>, ApiError> {
    if !state.registry.disconnect(&id) {
        return Err(ApiError::SessionNotFound(id));
    }
    Ok(Json(DisconnectReport {
        disconnected: vec![id],
    }))
}

#[derive(Debug, Deserialize)]
pub struct IdleQuery {
    idle_secs: u64,
}

pub async fn disconnect_idle(
    State(state): State<AppState>,
    Query(query): Query<IdleQuery>,
) -> Json<DisconnectReport> {
    let disconnected = state
        .registry
        .disconnect_idle(Duration::from_secs(query.idle_secs));
    Json(DisconnectReport { disconnected })
}

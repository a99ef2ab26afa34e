use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

use crate::auth::Authenticator;
use crate::catalog::Catalog;
use crate::error::SyncError;
use crate::models::{Course, UserProgress};
use crate::session::{Identity, IdentityProvider};
use crate::store::{SnapshotStream, SyncStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SyncStore>,
    pub catalog: Catalog,
    pub auth: Arc<Authenticator>,
}

impl AppState {
    pub fn new(store: Arc<SyncStore>, auth: Arc<Authenticator>) -> Self {
        Self {
            catalog: Catalog::new(store.clone()),
            store,
            auth,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignInReq {
    pub provider: IdentityProvider,
    pub access_token: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn router(state: AppState) -> Router {
    Router::new()
        // session
        .route("/api/session", get(current_session).post(sign_in).delete(sign_out))
        .route("/api/session/refresh", post(refresh_session))
        // catalog
        .route("/api/courses", get(list_courses).post(add_course))
        .route("/api/courses/stream", get(course_events))
        .route("/api/courses/:id", get(get_course).delete(delete_course))
        .route("/api/courses/:id/complete", post(complete_lesson))
        // progress
        .route("/api/progress", get(list_progress))
        .route("/api/progress/stream", get(progress_events))
        .with_state(state)
}

async fn current_session(State(app): State<AppState>) -> Json<Option<Identity>> {
    Json(app.auth.session().current())
}

async fn sign_in(State(app): State<AppState>, Json(req): Json<SignInReq>) -> ApiResult<Identity> {
    let identity = app
        .auth
        .sign_in(req.provider, &req.access_token)
        .await
        .map_err(reject)?;
    Ok(Json(identity))
}

async fn refresh_session(State(app): State<AppState>) -> ApiResult<Identity> {
    Ok(Json(app.auth.refresh().await.map_err(reject)?))
}

async fn sign_out(State(app): State<AppState>) -> StatusCode {
    app.auth.sign_out().await;
    StatusCode::NO_CONTENT
}

async fn list_courses(State(app): State<AppState>) -> ApiResult<Vec<Course>> {
    Ok(Json(app.store.courses().await.map_err(reject)?))
}

async fn add_course(State(app): State<AppState>, Json(course): Json<Course>) -> ApiResult<Course> {
    Ok(Json(app.catalog.add_course(course).await.map_err(reject)?))
}

async fn get_course(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Course> {
    app.store
        .get_course_by_id(&id)
        .await
        .map_err(reject)?
        .map(Json)
        .ok_or_else(|| reject(SyncError::CourseNotFound(id)))
}

async fn delete_course(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    if app.catalog.delete_course(&id).await.map_err(reject)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(reject(SyncError::CourseNotFound(id)))
    }
}

async fn complete_lesson(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<UserProgress> {
    Ok(Json(app.store.complete_lesson(&id).await.map_err(reject)?))
}

async fn list_progress(State(app): State<AppState>) -> ApiResult<Vec<UserProgress>> {
    Ok(Json(app.store.progress().await.map_err(reject)?))
}

async fn course_events(
    State(app): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let feed = app.store.courses_stream().await.map_err(reject)?;
    Ok(Sse::new(snapshot_events(feed)).keep_alive(KeepAlive::default()))
}

async fn progress_events(
    State(app): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let feed = app.store.progress_stream().await.map_err(reject)?;
    Ok(Sse::new(snapshot_events(feed)).keep_alive(KeepAlive::default()))
}

// --- helpers ---

/// One `snapshot` event per emitted snapshot; a terminal failure becomes a
/// final `error` event and closes the response.
fn snapshot_events<T>(feed: SnapshotStream<T>) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    stream::unfold(Some(feed), |feed| async move {
        let mut feed = feed?;
        match feed.next().await? {
            Ok(snapshot) => {
                let event = Event::default()
                    .event("snapshot")
                    .json_data(snapshot.as_slice())
                    .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
                Some((Ok::<_, Infallible>(event), Some(feed)))
            }
            Err(e) => Some((Ok(Event::default().event("error").data(e.to_string())), None)),
        }
    })
}

fn reject(e: SyncError) -> (StatusCode, String) {
    let status = match &e {
        SyncError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::CourseNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::Division(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::Identity(_) => StatusCode::BAD_GATEWAY,
        SyncError::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    } else {
        tracing::debug!(error = %e, "request rejected");
    }
    (status, e.to_string())
}

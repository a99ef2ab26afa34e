use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursesync::auth::{AuthClient, Authenticator};
use coursesync::config::{BackendKind, Config};
use coursesync::routes::{self, AppState};
use coursesync::session::Session;
use coursesync::store::{Backend, MemoryBackend, PgBackend, SyncStore};
use coursesync::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend: Arc<dyn Backend> = match (config.backend, config.database_url.as_deref()) {
        (BackendKind::Postgres, Some(url)) => {
            let pool = db::connect(url).await?;
            db::migrate(&pool).await?;
            Arc::new(PgBackend::new(pool))
        }
        (BackendKind::Postgres, None) => anyhow::bail!("DATABASE_URL not set"),
        (BackendKind::Memory, _) => {
            tracing::warn!("using in-memory store, data is lost on exit");
            if config.seed_sample_data {
                Arc::new(MemoryBackend::with_sample_data())
            } else {
                Arc::new(MemoryBackend::new())
            }
        }
    };

    // one session per process: the store and the authenticator share it
    let session = Session::new();
    let store = Arc::new(
        SyncStore::new(backend, session.clone()).with_default_total_lessons(config.default_total_lessons)?,
    );
    let auth = Arc::new(Authenticator::new(AuthClient::new(config.auth.clone())?, session));

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(AppState::new(store, auth)))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
        );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}

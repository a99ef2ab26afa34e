use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::error::{Result, SyncError};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str) -> Result<Db> {
    Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
}

pub async fn migrate(db: &Db) -> Result<()> {
    // crate-relative path for sqlx migrations
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))
}

//! Course catalog and progress synchronization for the course app.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod progress;
pub mod routes;
pub mod sample;
pub mod session;
pub mod store;

pub use error::{Result, SyncError};

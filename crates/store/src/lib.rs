//! Postgres persistence for both recognition services.
//!
//! Each service owns its own database; SQL statements live here as module
//! constants named after the operations they back. Multi-statement writes
//! run in explicit transactions that roll back before surfacing the error.

pub mod frs;
pub mod lprs;

use fp_domain::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(Error::persistence)
}

pub(crate) fn db_err(err: sqlx::Error) -> Error {
    Error::persistence(err)
}

//! License plate recognition store: streams, the events log and its
//! maintenance.

use chrono::{DateTime, Utc};
use fp_domain::Result;
use sqlx::{PgPool, Row};

use crate::db_err;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_POLL_GROUPS: &str = "select auth_token::varchar, id_group from vstream_groups";

const SQL_POLL_VSTREAMS: &str = r#"
    select
      concat(vs.id_group, '_', vs.ext_id) unique_key,
      vs.id_group,
      vs.id_vstream,
      vs.ext_id,
      coalesce(d.config, '{}') || coalesce(vs.config, '{}') config
    from
      vstreams vs
      left join default_vstream_config d
        on d.id_group = vs.id_group
"#;

const SQL_GET_STREAM: &str = "select id_vstream from vstreams where id_group = $1 and ext_id = $2";

const SQL_ADD_STREAM: &str = "insert into vstreams(id_group, ext_id, config) values($1, $2, $3)";

const SQL_UPDATE_STREAM: &str = "update vstreams set config = $1 where id_vstream = $2";

const SQL_REMOVE_STREAM: &str = "delete from vstreams where id_group = $1 and ext_id = $2";

const SQL_LIST_STREAMS: &str =
    "select ext_id, config from vstreams where id_group = $1 order by ext_id";

const SQL_ADD_EVENT: &str =
    "insert into events_log(id_vstream, log_date, info) values($1, $2, $3) returning id_event";

const SQL_GET_EVENT_BY_ID: &str =
    "select log_date, info, id_vstream from events_log where id_event = $1";

// Strict interval bounds, in contrast with the FRS best-quality query.
const SQL_GET_NEAREST_EVENT: &str = r#"
    select
      log_date,
      info
    from
      events_log
    where
      id_vstream = $1
      and log_date > $2
      and log_date < $3
    order by
      abs(extract(epoch from (log_date - $4)))
    limit
      1
"#;

const SQL_REMOVE_OLD_EVENTS: &str = "delete from events_log where log_date < $1";

const SQL_SET_STREAM_DEFAULT_CONFIG_PARAMS: &str =
    "update default_vstream_config set config = coalesce(config, $2) || $2 where id_group = $1";
const SQL_GET_STREAM_DEFAULT_CONFIG_PARAMS: &str =
    "select config from default_vstream_config where id_group = $1";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub auth_token: String,
    pub id_group: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VStreamRow {
    pub unique_key: String,
    pub id_group: i32,
    pub id_vstream: i32,
    pub ext_id: String,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub log_date: DateTime<Utc>,
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StreamListRow {
    pub ext_id: String,
    pub config: Option<serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct LprsStore {
    pool: PgPool,
}

impl LprsStore {
    pub fn new(pool: PgPool) -> LprsStore {
        LprsStore { pool }
    }

    pub async fn poll_groups(&self) -> Result<Vec<GroupRow>> {
        sqlx::query_as(SQL_POLL_GROUPS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn poll_vstreams(&self) -> Result<Vec<VStreamRow>> {
        sqlx::query_as(SQL_POLL_VSTREAMS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Insert-or-update a stream's config blob.
    pub async fn upsert_stream(
        &self,
        id_group: i32,
        ext_id: &str,
        config: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query(SQL_GET_STREAM)
            .bind(id_group)
            .bind(ext_id)
            .fetch_optional(&mut *trx)
            .await
            .map_err(db_err)?;
        match existing {
            None => {
                sqlx::query(SQL_ADD_STREAM)
                    .bind(id_group)
                    .bind(ext_id)
                    .bind(&config)
                    .execute(&mut *trx)
                    .await
                    .map_err(db_err)?;
            }
            Some(row) => {
                let id_vstream: i32 = row.get("id_vstream");
                sqlx::query(SQL_UPDATE_STREAM)
                    .bind(&config)
                    .bind(id_vstream)
                    .execute(&mut *trx)
                    .await
                    .map_err(db_err)?;
            }
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn remove_stream(&self, id_group: i32, ext_id: &str) -> Result<()> {
        sqlx::query(SQL_REMOVE_STREAM)
            .bind(id_group)
            .bind(ext_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn list_streams(&self, id_group: i32) -> Result<Vec<StreamListRow>> {
        sqlx::query_as(SQL_LIST_STREAMS)
            .bind(id_group)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn add_event(
        &self,
        id_vstream: i32,
        log_date: DateTime<Utc>,
        info: &serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(SQL_ADD_EVENT)
            .bind(id_vstream)
            .bind(log_date)
            .bind(info)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("id_event"))
    }

    pub async fn event_by_id(
        &self,
        id_event: i64,
    ) -> Result<Option<(DateTime<Utc>, serde_json::Value, i32)>> {
        let row = sqlx::query(SQL_GET_EVENT_BY_ID)
            .bind(id_event)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| (r.get("log_date"), r.get("info"), r.get("id_vstream"))))
    }

    /// Event closest to `date` within the `(date - before, date + after)`
    /// open interval.
    pub async fn nearest_event(
        &self,
        id_vstream: i32,
        date: DateTime<Utc>,
        before: chrono::Duration,
        after: chrono::Duration,
    ) -> Result<Option<EventRow>> {
        sqlx::query_as(SQL_GET_NEAREST_EVENT)
            .bind(id_vstream)
            .bind(date - before)
            .bind(date + after)
            .bind(date)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn remove_old_events(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(SQL_REMOVE_OLD_EVENTS)
            .bind(cutoff)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        trx.commit().await.map_err(db_err)
    }

    pub async fn set_default_config(&self, id_group: i32, config: &serde_json::Value) -> Result<()> {
        sqlx::query(SQL_SET_STREAM_DEFAULT_CONFIG_PARAMS)
            .bind(id_group)
            .bind(config)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_default_config(&self, id_group: i32) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(SQL_GET_STREAM_DEFAULT_CONFIG_PARAMS)
            .bind(id_group)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| r.get("config")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_event_bounds_are_strict() {
        assert!(SQL_GET_NEAREST_EVENT.contains("> $2"));
        assert!(SQL_GET_NEAREST_EVENT.contains("< $3"));
        assert!(!SQL_GET_NEAREST_EVENT.contains(">="));
    }
}

//! Face recognition store: streams, descriptors, special groups, face logs
//! and the maintenance sweeps over them.

use chrono::{DateTime, Utc};
use fp_domain::geometry::Rect;
use fp_domain::{Error, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// `copy_data` states of a log row.
pub const COPY_DATA_DISABLED: i32 = -1;
pub const COPY_DATA_NONE: i32 = 0;
pub const COPY_DATA_SCHEDULED: i32 = 1;
pub const COPY_DATA_DONE: i32 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache polling queries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_POLL_GROUPS: &str = "select auth_token::varchar, id_group from vstream_groups";

const SQL_POLL_CONFIGS: &str = r#"
    select
      vg.id_group,
      coalesce(cc.config, '{}') || coalesce(dvc.config, '{}') config
    from
      vstream_groups vg
      left join common_config cc
        on cc.id_group = vg.id_group
      left join default_vstream_config dvc
        on dvc.id_group = vg.id_group
"#;

const SQL_POLL_VSTREAMS: &str = r#"
    select
      concat(vs.id_group, '_', vs.vstream_ext) unique_key,
      vs.id_group,
      vs.id_vstream,
      vs.vstream_ext,
      coalesce(vs.url, '') url,
      coalesce(vs.callback_url, '') callback_url,
      coalesce(d.config, '{}') || coalesce(vs.config, '{}') config,
      vs.flag_deleted,
      vs.last_updated
    from
      video_streams vs
      left join default_vstream_config d
        on d.id_group = vs.id_group
"#;

const SQL_POLL_DESCRIPTORS: &str =
    "select id_descriptor, descriptor_data, id_parent, flag_deleted, last_updated from face_descriptors";

const SQL_POLL_VSTREAM_LINKS: &str =
    "select id_vstream, id_descriptor, flag_deleted, last_updated from link_descriptor_vstream";

const SQL_POLL_SGROUPS: &str = r#"
    select
      sg_api_token::varchar,
      id_special_group,
      coalesce(callback_url, '') callback_url,
      max_descriptor_count,
      id_group
    from
      special_groups
    where
      not flag_deleted
"#;

const SQL_POLL_SGROUP_LINKS: &str =
    "select id_sgroup, id_descriptor, flag_deleted, last_updated from link_descriptor_sgroup";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream / descriptor management
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_GET_VSTREAM_ID: &str =
    "select id_vstream from video_streams where id_group = $1 and vstream_ext = $2 and not flag_deleted";

const SQL_GET_STREAM: &str =
    "select id_vstream, url, callback_url from video_streams where id_group = $1 and vstream_ext = $2";

const SQL_ADD_STREAM: &str = r#"
    insert into video_streams(id_group, vstream_ext, url, callback_url, config)
    values($1, $2, $3, $4, $5) returning id_vstream
"#;

const SQL_UPDATE_STREAM: &str = r#"
    update
      video_streams
    set
      url = $2,
      callback_url = $3,
      flag_deleted = false,
      config = $4,
      last_updated = now()
    where
      id_group = $1
      and id_vstream = $5
"#;

const SQL_ADD_LINK_DESCRIPTOR_VSTREAM: &str = r#"
    insert into link_descriptor_vstream(id_vstream, id_descriptor)
        select $2, f.id_descriptor from face_descriptors f where f.id_descriptor = $3 and f.id_group = $1
    on conflict (id_vstream, id_descriptor) do update set last_updated = now(), flag_deleted = false
"#;

// Links and descriptors are never deleted inline, only marked; the
// flag-deleted maintenance sweep removes them after the TTL.
const SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM: &str =
    "update link_descriptor_vstream set last_updated = now(), flag_deleted = true where id_vstream = $1 and id_descriptor = $2";

const SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM_BY_VSTREAM: &str =
    "update link_descriptor_vstream set last_updated = now(), flag_deleted = true where id_vstream = $1";

const SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM_BY_DESCRIPTOR: &str = r#"
    update
      link_descriptor_vstream
    set
      last_updated = now(),
      flag_deleted = true
    where
      id_descriptor = $2
      and $1 = (select fd.id_group from face_descriptors fd where fd.id_descriptor = $2)
"#;

const SQL_REMOVE_DESCRIPTOR: &str =
    "update face_descriptors set last_updated = now(), flag_deleted = true where id_group = $1 and id_descriptor = $2";

const SQL_REMOVE_SPAWNED_DESCRIPTORS: &str =
    "update face_descriptors set last_updated = now(), flag_deleted = true where id_group = $1 and id_parent = $2";

const SQL_DELETE_VIDEO_STREAM: &str =
    "update video_streams set last_updated = now(), flag_deleted = true where id_group = $1 and id_vstream = $2";

const SQL_LIST_STREAMS_SIMPLE: &str = r#"
    select
      v.vstream_ext,
      v.url,
      v.callback_url,
      v.config
    from
      video_streams v
    where
      v.id_group = $1
      and not v.flag_deleted
"#;

const SQL_LIST_STREAM_FACES: &str = r#"
    select
      v.vstream_ext,
      ldv.id_descriptor
    from
      video_streams v
      inner join link_descriptor_vstream ldv
        on v.id_vstream = ldv.id_vstream
        and not ldv.flag_deleted
    where
      v.id_group = $1
      and not v.flag_deleted
"#;

const SQL_LIST_ALL_FACES: &str = r#"
    select
      id_descriptor
    from
      face_descriptors
    where
      id_group = $1
      and not flag_deleted
      and id_descriptor not in (select ldsg.id_descriptor from link_descriptor_sgroup ldsg)
"#;

const SQL_ADD_FACE_DESCRIPTOR: &str =
    "insert into face_descriptors(id_group, descriptor_data, id_parent) values($1, $2, $3) returning id_descriptor";

const SQL_ADD_DESCRIPTOR_IMAGE: &str =
    "insert into descriptor_images(id_descriptor, mime_type, face_image) values($1, $2, $3)";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Face log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_ADD_LOG_FACE: &str = r#"
    insert into log_faces(id_vstream, log_date, id_descriptor, quality, face_left, face_top,
      face_width, face_height, screenshot_url, log_uuid, copy_data)
    values($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) returning id_log
"#;

// Inclusive interval bounds, in contrast with the LPRS nearest-event query.
const SQL_GET_LOG_FACE_BEST_QUALITY: &str = r#"
    select
      l.id_log,
      l.screenshot_url,
      l.face_left,
      l.face_top,
      l.face_width,
      l.face_height,
      l.log_date,
      l.copy_data
    from
      log_faces l
    where
      l.id_vstream = $1
      and l.log_date >= $2
      and l.log_date <= $3
      and l.copy_data >= 0
    order by
      l.quality desc
    limit
      1
"#;

const SQL_GET_LOG_FACE_BY_ID: &str = r#"
    select
      l.id_log,
      l.screenshot_url,
      l.face_left,
      l.face_top,
      l.face_width,
      l.face_height,
      l.log_date,
      l.copy_data
    from
      log_faces l
      join video_streams vs
        on vs.id_vstream = l.id_vstream
    where
      vs.id_group = $1
      and l.id_log = $2
"#;

const SQL_GET_LOG_FACES_FROM_INTERVAL: &str = r#"
    select
      l.id_log,
      l.log_date,
      l.id_descriptor,
      l.quality,
      l.screenshot_url,
      l.face_left,
      l.face_top,
      l.face_width,
      l.face_height
    from
      log_faces l
    where
      l.id_vstream = $1
      and l.log_date >= $2
      and l.log_date <= $3
    order by
      l.log_date
"#;

const SQL_SET_COPY_DATA_BY_ID: &str =
    "update log_faces set copy_data = $1, ext_event_uuid = $2 where id_log = $3";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Special groups
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_ADD_SPECIAL_GROUP: &str = r#"
    insert into
      special_groups(id_group, group_name, sg_api_token, max_descriptor_count)
    values($1, $2, gen_random_uuid(), $3) returning id_special_group, sg_api_token::varchar
"#;

const SQL_UPDATE_SPECIAL_GROUP: &str = r#"
    update
      special_groups
    set
      group_name = coalesce($1, group_name),
      max_descriptor_count = coalesce($2, max_descriptor_count)
    where
      id_group = $3
      and id_special_group = $4
"#;

const SQL_DELETE_SPECIAL_GROUP: &str =
    "update special_groups set last_updated = now(), flag_deleted = true where id_group = $1 and id_special_group = $2";

const SQL_LIST_SPECIAL_GROUPS: &str = r#"
    select
      id_special_group,
      group_name,
      sg_api_token::varchar,
      callback_url,
      max_descriptor_count
    from
      special_groups
    where
      id_group = $1
      and flag_deleted = false
"#;

const SQL_ADD_LINK_DESCRIPTOR_SGROUP: &str =
    "insert into link_descriptor_sgroup(id_sgroup, id_descriptor) values($1, $2)";

const SQL_REMOVE_LINK_DESCRIPTOR_SG: &str =
    "update link_descriptor_sgroup set last_updated = now(), flag_deleted = true where id_sgroup = $1 and id_descriptor = $2";

const SQL_REMOVE_LINK_DESCRIPTOR_SG_ALL: &str =
    "update link_descriptor_sgroup set last_updated = now(), flag_deleted = true where id_sgroup = $1";

const SQL_REMOVE_SG_FACE_DESCRIPTOR: &str = r#"
    update
      face_descriptors fd
    set
      last_updated = now(),
      flag_deleted = true
    where
      id_descriptor = $2
      and id_descriptor in (select ldsg.id_descriptor from link_descriptor_sgroup ldsg where ldsg.id_sgroup = $1)
"#;

const SQL_REMOVE_SG_FACE_DESCRIPTORS: &str = r#"
    update
      face_descriptors fd
    set
      last_updated = now(),
      flag_deleted = true
    where
      id_descriptor in (select ldsg.id_descriptor from link_descriptor_sgroup ldsg where ldsg.id_sgroup = $1)
"#;

const SQL_SG_LIST_FACES: &str = r#"
    select
      di.id_descriptor,
      concat('data:', di.mime_type, ';base64,', translate(encode(di.face_image, 'base64'), E'\n', '')) face_image
    from
      link_descriptor_sgroup ldsg
      inner join face_descriptors fd
        on ldsg.id_descriptor = fd.id_descriptor
      inner join descriptor_images di
        on fd.id_descriptor = di.id_descriptor
    where
      ldsg.id_sgroup = $1
      and not ldsg.flag_deleted
      and not fd.flag_deleted
"#;

// The upstream statement carried a duplicated `set` keyword and could never
// have executed; implemented as the plain single-column update (see
// DESIGN.md, open questions).
const SQL_SG_UPDATE_GROUP: &str =
    "update special_groups set callback_url = $2 where id_special_group = $1";

const SQL_SG_RENEW_TOKEN: &str = r#"
    update
      special_groups
    set
      sg_api_token = gen_random_uuid()
    where
      id_special_group = $1
    returning sg_api_token::varchar
"#;

const SQL_SG_DESCRIPTORS: &str = r#"
    select
      f.id_descriptor,
      f.descriptor_data
    from
      link_descriptor_sgroup l
      inner join face_descriptors f
      on f.id_descriptor = l.id_descriptor
    where
      not l.flag_deleted
      and l.id_sgroup = $1
      and f.id_descriptor = any($2)
"#;

const SQL_SG_DESCRIPTOR_COUNT: &str = r#"
    select
      count(*) n
    from
      link_descriptor_sgroup
    where
      id_sgroup = $1
      and not flag_deleted
"#;

const SQL_SG_GROUP_OF: &str =
    "select id_group from special_groups where id_special_group = $1";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tenant config blobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_SET_COMMON_CONFIG_PARAMS: &str =
    "update common_config set config = coalesce(config, $2) || $2 where id_group = $1";
const SQL_GET_COMMON_CONFIG_PARAMS: &str = "select config from common_config where id_group = $1";
const SQL_SET_STREAM_DEFAULT_CONFIG_PARAMS: &str =
    "update default_vstream_config set config = coalesce(config, $2) || $2 where id_group = $1";
const SQL_GET_STREAM_DEFAULT_CONFIG_PARAMS: &str =
    "select config from default_vstream_config where id_group = $1";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Maintenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SQL_REMOVE_OLD_LOG_FACES: &str = "delete from log_faces where log_date < $1";

const SQL_DELETE_MARKED: [&str; 5] = [
    "delete from video_streams where flag_deleted and last_updated < $1",
    "delete from face_descriptors where flag_deleted and last_updated < $1",
    "delete from link_descriptor_vstream where flag_deleted and last_updated < $1",
    "delete from special_groups where flag_deleted and last_updated < $1",
    "delete from link_descriptor_sgroup where flag_deleted and last_updated < $1",
];

const SQL_GET_LOG_COPY_DATA: &str = r#"
    select
      l.id_log,
      v.id_group,
      l.id_vstream,
      l.log_uuid,
      l.ext_event_uuid,
      l.log_date
    from
      log_faces l
      inner join video_streams v
        on v.id_vstream = l.id_vstream
    where
      l.copy_data = 1
"#;

const SQL_UPDATE_LOG_COPY_DATA: &str = "update log_faces set copy_data = 2 where id_log = $1";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub auth_token: String,
    pub id_group: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigRow {
    pub id_group: i32,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VStreamRow {
    pub unique_key: String,
    pub id_group: i32,
    pub id_vstream: i32,
    pub vstream_ext: String,
    pub url: String,
    pub callback_url: String,
    pub config: Option<serde_json::Value>,
    pub flag_deleted: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DescriptorRow {
    pub id_descriptor: i32,
    pub descriptor_data: Vec<u8>,
    pub id_parent: Option<i32>,
    pub flag_deleted: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VStreamLinkRow {
    pub id_vstream: i32,
    pub id_descriptor: i32,
    pub flag_deleted: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SpecialGroupRow {
    pub sg_api_token: String,
    pub id_special_group: i32,
    pub callback_url: String,
    pub max_descriptor_count: i32,
    pub id_group: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SgLinkRow {
    pub id_sgroup: i32,
    pub id_descriptor: i32,
    pub flag_deleted: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StreamListRow {
    pub vstream_ext: String,
    pub url: Option<String>,
    pub callback_url: Option<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogFaceRow {
    pub id_log: i64,
    pub screenshot_url: String,
    pub face_left: i32,
    pub face_top: i32,
    pub face_width: i32,
    pub face_height: i32,
    pub log_date: DateTime<Utc>,
    pub copy_data: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogEventRow {
    pub id_log: i64,
    pub log_date: DateTime<Utc>,
    pub id_descriptor: Option<i32>,
    pub quality: f64,
    pub screenshot_url: String,
    pub face_left: i32,
    pub face_top: i32,
    pub face_width: i32,
    pub face_height: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CopyDataRow {
    pub id_log: i64,
    pub id_group: i32,
    pub id_vstream: i32,
    pub log_uuid: Uuid,
    pub ext_event_uuid: String,
    pub log_date: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SpecialGroupListRow {
    pub id_special_group: i32,
    pub group_name: String,
    pub sg_api_token: String,
    pub callback_url: Option<String>,
    pub max_descriptor_count: i32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct FrsStore {
    pool: PgPool,
}

fn with_watermark(base: &str, since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(_) => format!("{base} where last_updated > $1"),
        None => base.to_string(),
    }
}

impl FrsStore {
    pub fn new(pool: PgPool) -> FrsStore {
        FrsStore { pool }
    }

    // ── Cache polling ────────────────────────────────────────────────

    pub async fn poll_groups(&self) -> Result<Vec<GroupRow>> {
        sqlx::query_as(SQL_POLL_GROUPS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn poll_configs(&self) -> Result<Vec<ConfigRow>> {
        sqlx::query_as(SQL_POLL_CONFIGS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn poll_vstreams(&self, since: Option<DateTime<Utc>>) -> Result<Vec<VStreamRow>> {
        let sql = match since {
            Some(_) => format!("{SQL_POLL_VSTREAMS} where vs.last_updated > $1"),
            None => SQL_POLL_VSTREAMS.to_string(),
        };
        let mut query = sqlx::query_as(&sql);
        if let Some(ts) = since {
            query = query.bind(ts);
        }
        query.fetch_all(&self.pool).await.map_err(db_err)
    }

    pub async fn poll_descriptors(&self, since: Option<DateTime<Utc>>) -> Result<Vec<DescriptorRow>> {
        let sql = with_watermark(SQL_POLL_DESCRIPTORS, since);
        let mut query = sqlx::query_as(&sql);
        if let Some(ts) = since {
            query = query.bind(ts);
        }
        query.fetch_all(&self.pool).await.map_err(db_err)
    }

    pub async fn poll_vstream_links(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<VStreamLinkRow>> {
        let sql = with_watermark(SQL_POLL_VSTREAM_LINKS, since);
        let mut query = sqlx::query_as(&sql);
        if let Some(ts) = since {
            query = query.bind(ts);
        }
        query.fetch_all(&self.pool).await.map_err(db_err)
    }

    pub async fn poll_special_groups(&self) -> Result<Vec<SpecialGroupRow>> {
        sqlx::query_as(SQL_POLL_SGROUPS)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn poll_sgroup_links(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SgLinkRow>> {
        let sql = with_watermark(SQL_POLL_SGROUP_LINKS, since);
        let mut query = sqlx::query_as(&sql);
        if let Some(ts) = since {
            query = query.bind(ts);
        }
        query.fetch_all(&self.pool).await.map_err(db_err)
    }

    // ── Streams ──────────────────────────────────────────────────────

    pub async fn vstream_id(&self, id_group: i32, vstream_ext: &str) -> Result<Option<i32>> {
        let row = sqlx::query(SQL_GET_VSTREAM_ID)
            .bind(id_group)
            .bind(vstream_ext)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("id_vstream")))
    }

    /// Insert-or-update a stream and bind the listed faces, atomically.
    pub async fn upsert_stream(
        &self,
        id_group: i32,
        vstream_ext: &str,
        url: Option<String>,
        callback_url: Option<String>,
        config: Option<serde_json::Value>,
        faces: &[i32],
    ) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query(SQL_GET_STREAM)
            .bind(id_group)
            .bind(vstream_ext)
            .fetch_optional(&mut *trx)
            .await
            .map_err(db_err)?;

        let id_vstream: i32 = match existing {
            None => sqlx::query(SQL_ADD_STREAM)
                .bind(id_group)
                .bind(vstream_ext)
                .bind(&url)
                .bind(&callback_url)
                .bind(&config)
                .fetch_one(&mut *trx)
                .await
                .map_err(db_err)?
                .get("id_vstream"),
            Some(row) => {
                let id: i32 = row.get("id_vstream");
                // Absent members keep the stored values.
                let url = url.or_else(|| row.get::<Option<String>, _>("url"));
                let callback_url =
                    callback_url.or_else(|| row.get::<Option<String>, _>("callback_url"));
                sqlx::query(SQL_UPDATE_STREAM)
                    .bind(id_group)
                    .bind(&url)
                    .bind(&callback_url)
                    .bind(&config)
                    .bind(id)
                    .execute(&mut *trx)
                    .await
                    .map_err(db_err)?;
                id
            }
        };

        for id_descriptor in faces {
            sqlx::query(SQL_ADD_LINK_DESCRIPTOR_VSTREAM)
                .bind(id_group)
                .bind(id_vstream)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn list_streams(
        &self,
        id_group: i32,
    ) -> Result<(Vec<StreamListRow>, Vec<(String, i32)>)> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        let streams: Vec<StreamListRow> = sqlx::query_as(SQL_LIST_STREAMS_SIMPLE)
            .bind(id_group)
            .fetch_all(&mut *trx)
            .await
            .map_err(db_err)?;
        let faces = sqlx::query(SQL_LIST_STREAM_FACES)
            .bind(id_group)
            .fetch_all(&mut *trx)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(|r| (r.get("vstream_ext"), r.get("id_descriptor")))
            .collect();
        trx.commit().await.map_err(db_err)?;
        Ok((streams, faces))
    }

    pub async fn remove_stream(&self, id_group: i32, id_vstream: i32) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM_BY_VSTREAM)
            .bind(id_vstream)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        sqlx::query(SQL_DELETE_VIDEO_STREAM)
            .bind(id_group)
            .bind(id_vstream)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        trx.commit().await.map_err(db_err)
    }

    pub async fn add_faces(&self, id_group: i32, id_vstream: i32, faces: &[i32]) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        for id_descriptor in faces {
            sqlx::query(SQL_ADD_LINK_DESCRIPTOR_VSTREAM)
                .bind(id_group)
                .bind(id_vstream)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn remove_faces(&self, id_vstream: i32, faces: &[i32]) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        for id_descriptor in faces {
            sqlx::query(SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM)
                .bind(id_vstream)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn list_all_faces(&self, id_group: i32) -> Result<Vec<i32>> {
        let rows = sqlx::query(SQL_LIST_ALL_FACES)
            .bind(id_group)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("id_descriptor")).collect())
    }

    pub async fn delete_faces(&self, id_group: i32, faces: &[i32]) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        for id_descriptor in faces {
            sqlx::query(SQL_REMOVE_LINK_DESCRIPTOR_VSTREAM_BY_DESCRIPTOR)
                .bind(id_group)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
            sqlx::query(SQL_REMOVE_DESCRIPTOR)
                .bind(id_group)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
            sqlx::query(SQL_REMOVE_SPAWNED_DESCRIPTORS)
                .bind(id_group)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    // ── Descriptors ──────────────────────────────────────────────────

    /// Persist a descriptor with its face crop; a non-spawned descriptor is
    /// also bound to the stream it was registered on.
    pub async fn add_face_descriptor(
        &self,
        id_group: i32,
        id_vstream: i32,
        descriptor: &[u8],
        face_image: &[u8],
        mime_type: &str,
        id_parent: Option<i32>,
    ) -> Result<i32> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        let id_descriptor: i32 = sqlx::query(SQL_ADD_FACE_DESCRIPTOR)
            .bind(id_group)
            .bind(descriptor)
            .bind(id_parent)
            .fetch_one(&mut *trx)
            .await
            .map_err(db_err)?
            .get("id_descriptor");
        sqlx::query(SQL_ADD_DESCRIPTOR_IMAGE)
            .bind(id_descriptor)
            .bind(mime_type)
            .bind(face_image)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        if id_parent.is_none() && id_vstream > 0 {
            sqlx::query(SQL_ADD_LINK_DESCRIPTOR_VSTREAM)
                .bind(id_group)
                .bind(id_vstream)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)?;
        Ok(id_descriptor)
    }

    /// Persist a descriptor into a special group, enforcing the group's
    /// descriptor quota.
    pub async fn add_sgroup_face_descriptor(
        &self,
        id_sgroup: i32,
        descriptor: &[u8],
        face_image: &[u8],
        mime_type: &str,
        max_descriptor_count: i32,
    ) -> Result<i32> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        let count: i64 = sqlx::query(SQL_SG_DESCRIPTOR_COUNT)
            .bind(id_sgroup)
            .fetch_one(&mut *trx)
            .await
            .map_err(db_err)?
            .get("n");
        if count >= max_descriptor_count as i64 {
            trx.rollback().await.map_err(db_err)?;
            return Err(Error::bad_request(
                "The special group descriptor limit has been reached.",
            ));
        }
        let id_group: i32 = sqlx::query(SQL_SG_GROUP_OF)
            .bind(id_sgroup)
            .fetch_one(&mut *trx)
            .await
            .map_err(db_err)?
            .get("id_group");
        let id_descriptor: i32 = sqlx::query(SQL_ADD_FACE_DESCRIPTOR)
            .bind(id_group)
            .bind(descriptor)
            .bind(Option::<i32>::None)
            .fetch_one(&mut *trx)
            .await
            .map_err(db_err)?
            .get("id_descriptor");
        sqlx::query(SQL_ADD_DESCRIPTOR_IMAGE)
            .bind(id_descriptor)
            .bind(mime_type)
            .bind(face_image)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        sqlx::query(SQL_ADD_LINK_DESCRIPTOR_SGROUP)
            .bind(id_sgroup)
            .bind(id_descriptor)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        trx.commit().await.map_err(db_err)?;
        Ok(id_descriptor)
    }

    // ── Face log ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn add_log_face(
        &self,
        id_vstream: i32,
        log_date: DateTime<Utc>,
        id_descriptor: Option<i32>,
        quality: f64,
        face_rect: &Rect,
        screenshot_url: &str,
        log_uuid: Uuid,
        copy_data: i32,
    ) -> Result<i64> {
        let row = sqlx::query(SQL_ADD_LOG_FACE)
            .bind(id_vstream)
            .bind(log_date)
            .bind(id_descriptor)
            .bind(quality)
            .bind(face_rect.x)
            .bind(face_rect.y)
            .bind(face_rect.width)
            .bind(face_rect.height)
            .bind(screenshot_url)
            .bind(log_uuid)
            .bind(copy_data)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("id_log"))
    }

    pub async fn log_face_best_quality(
        &self,
        id_vstream: i32,
        date: DateTime<Utc>,
        before: chrono::Duration,
        after: chrono::Duration,
    ) -> Result<Option<LogFaceRow>> {
        sqlx::query_as(SQL_GET_LOG_FACE_BEST_QUALITY)
            .bind(id_vstream)
            .bind(date - before)
            .bind(date + after)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn log_face_by_id(&self, id_group: i32, id_log: i64) -> Result<Option<LogFaceRow>> {
        sqlx::query_as(SQL_GET_LOG_FACE_BY_ID)
            .bind(id_group)
            .bind(id_log)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn log_faces_in_interval(
        &self,
        id_vstream: i32,
        date_start: DateTime<Utc>,
        date_end: DateTime<Utc>,
    ) -> Result<Vec<LogEventRow>> {
        sqlx::query_as(SQL_GET_LOG_FACES_FROM_INTERVAL)
            .bind(id_vstream)
            .bind(date_start)
            .bind(date_end)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn schedule_copy_data(&self, id_log: i64, ext_event_uuid: &str) -> Result<()> {
        sqlx::query(SQL_SET_COPY_DATA_BY_ID)
            .bind(COPY_DATA_SCHEDULED)
            .bind(ext_event_uuid)
            .bind(id_log)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ── Special groups ───────────────────────────────────────────────

    pub async fn add_special_group(
        &self,
        id_group: i32,
        group_name: &str,
        max_descriptor_count: i32,
    ) -> Result<(i32, String)> {
        let row = sqlx::query(SQL_ADD_SPECIAL_GROUP)
            .bind(id_group)
            .bind(group_name)
            .bind(max_descriptor_count)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::bad_request("A special group with this name already exists.")
                } else {
                    db_err(e)
                }
            })?;
        Ok((row.get("id_special_group"), row.get("sg_api_token")))
    }

    pub async fn update_special_group(
        &self,
        id_group: i32,
        id_sgroup: i32,
        group_name: Option<String>,
        max_descriptor_count: Option<i32>,
    ) -> Result<()> {
        sqlx::query(SQL_UPDATE_SPECIAL_GROUP)
            .bind(group_name)
            .bind(max_descriptor_count)
            .bind(id_group)
            .bind(id_sgroup)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn delete_special_group(&self, id_group: i32, id_sgroup: i32) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(SQL_REMOVE_LINK_DESCRIPTOR_SG_ALL)
            .bind(id_sgroup)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        sqlx::query(SQL_REMOVE_SG_FACE_DESCRIPTORS)
            .bind(id_sgroup)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        sqlx::query(SQL_DELETE_SPECIAL_GROUP)
            .bind(id_group)
            .bind(id_sgroup)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        trx.commit().await.map_err(db_err)
    }

    pub async fn list_special_groups(&self, id_group: i32) -> Result<Vec<SpecialGroupListRow>> {
        sqlx::query_as(SQL_LIST_SPECIAL_GROUPS)
            .bind(id_group)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn sg_delete_faces(&self, id_sgroup: i32, faces: &[i32]) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        for id_descriptor in faces {
            sqlx::query(SQL_REMOVE_LINK_DESCRIPTOR_SG)
                .bind(id_sgroup)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
            sqlx::query(SQL_REMOVE_SG_FACE_DESCRIPTOR)
                .bind(id_sgroup)
                .bind(id_descriptor)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn sg_list_faces(&self, id_sgroup: i32) -> Result<Vec<(i32, String)>> {
        let rows = sqlx::query(SQL_SG_LIST_FACES)
            .bind(id_sgroup)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id_descriptor"), r.get("face_image")))
            .collect())
    }

    pub async fn sg_update_callback(&self, id_sgroup: i32, callback_url: &str) -> Result<()> {
        sqlx::query(SQL_SG_UPDATE_GROUP)
            .bind(id_sgroup)
            .bind(callback_url)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn sg_renew_token(&self, id_sgroup: i32) -> Result<String> {
        let row = sqlx::query(SQL_SG_RENEW_TOKEN)
            .bind(id_sgroup)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("sg_api_token"))
    }

    pub async fn sg_descriptors(
        &self,
        id_sgroup: i32,
        faces: &[i32],
    ) -> Result<Vec<(i32, Vec<u8>)>> {
        let rows = sqlx::query(SQL_SG_DESCRIPTORS)
            .bind(id_sgroup)
            .bind(faces)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id_descriptor"), r.get("descriptor_data")))
            .collect())
    }

    // ── Tenant config blobs ──────────────────────────────────────────

    pub async fn set_common_config(&self, id_group: i32, config: &serde_json::Value) -> Result<()> {
        sqlx::query(SQL_SET_COMMON_CONFIG_PARAMS)
            .bind(id_group)
            .bind(config)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_common_config(&self, id_group: i32) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(SQL_GET_COMMON_CONFIG_PARAMS)
            .bind(id_group)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| r.get("config")))
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

    // ── Maintenance ──────────────────────────────────────────────────

    pub async fn remove_old_log_faces(&self, cutoff: DateTime<Utc>) -> Result<()> {
        sqlx::query(SQL_REMOVE_OLD_LOG_FACES)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Hard-delete rows that were marked before `cutoff`, all five tables in
    /// one transaction.
    pub async fn flag_deleted_sweep(&self, cutoff: DateTime<Utc>) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        for sql in SQL_DELETE_MARKED {
            sqlx::query(sql)
                .bind(cutoff)
                .execute(&mut *trx)
                .await
                .map_err(db_err)?;
        }
        trx.commit().await.map_err(db_err)
    }

    pub async fn copy_data_rows(&self) -> Result<Vec<CopyDataRow>> {
        sqlx::query_as(SQL_GET_LOG_COPY_DATA)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    pub async fn mark_copy_done(&self, id_log: i64) -> Result<()> {
        let mut trx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(SQL_UPDATE_LOG_COPY_DATA)
            .bind(id_log)
            .execute(&mut *trx)
            .await
            .map_err(db_err)?;
        trx.commit().await.map_err(db_err)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_clause_appended_only_when_incremental() {
        let full = with_watermark(SQL_POLL_DESCRIPTORS, None);
        assert!(!full.contains("where last_updated"));
        let incremental = with_watermark(SQL_POLL_DESCRIPTORS, Some(Utc::now()));
        assert!(incremental.ends_with("where last_updated > $1"));
    }

    #[test]
    fn marked_sweep_covers_five_tables() {
        let tables: Vec<&str> = SQL_DELETE_MARKED
            .iter()
            .map(|sql| sql.split_whitespace().nth(2).unwrap_or(""))
            .collect();
        assert_eq!(
            tables,
            vec![
                "video_streams",
                "face_descriptors",
                "link_descriptor_vstream",
                "special_groups",
                "link_descriptor_sgroup",
            ]
        );
        for sql in SQL_DELETE_MARKED {
            assert!(sql.contains("flag_deleted and last_updated < $1"));
        }
    }

    #[test]
    fn best_quality_bounds_are_inclusive() {
        assert!(SQL_GET_LOG_FACE_BEST_QUALITY.contains(">= $2"));
        assert!(SQL_GET_LOG_FACE_BEST_QUALITY.contains("<= $3"));
        assert!(SQL_GET_LOG_FACE_BEST_QUALITY.contains("copy_data >= 0"));
    }
}

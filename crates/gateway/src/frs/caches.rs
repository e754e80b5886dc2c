//! FRS read-through caches, refreshed by a single polling task.
//!
//! Full-refresh caches: tenant tokens, tenant common+default config,
//! special-group config. Incremental caches (by `last_updated`): per-stream
//! config, face descriptors, stream↔descriptor links and special-group↔
//! descriptor links; rows flagged deleted vanish from the snapshot but stay
//! in the store until the maintenance sweep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fp_domain::frs::{CommonConfig, StreamConfig};
use fp_domain::Result;
use fp_store::frs::FrsStore;

use crate::cache::{SnapshotCell, Watermark};
use crate::frs::descriptor::{floats_from_bytes, normalize_l2};

#[derive(Debug, Clone)]
pub struct SgConfig {
    pub sg_api_token: String,
    pub id_special_group: i32,
    pub callback_url: String,
    pub max_descriptor_count: i32,
    pub id_group: i32,
}

#[derive(Default, Clone)]
pub struct ConfigSnapshot {
    pub common: HashMap<i32, CommonConfig>,
    pub default_stream: HashMap<i32, StreamConfig>,
}

#[derive(Default, Clone)]
pub struct DescriptorSnapshot {
    /// L2-normalized descriptor vectors.
    pub data: HashMap<i32, Arc<Vec<f32>>>,
    /// spawned id → parent id
    pub spawned: HashMap<i32, i32>,
}

#[derive(Default, Clone)]
pub struct SgConfigSnapshot {
    pub by_token: HashMap<String, SgConfig>,
    pub token_of: HashMap<i32, String>,
    pub by_group: HashMap<i32, HashSet<i32>>,
}

impl SgConfigSnapshot {
    pub fn by_id(&self, id_sgroup: i32) -> Option<&SgConfig> {
        self.token_of
            .get(&id_sgroup)
            .and_then(|token| self.by_token.get(token))
    }
}

#[derive(Default)]
pub struct FrsCaches {
    pub tokens: SnapshotCell<HashMap<String, i32>>,
    pub configs: SnapshotCell<ConfigSnapshot>,
    pub streams: SnapshotCell<HashMap<String, StreamConfig>>,
    pub descriptors: SnapshotCell<DescriptorSnapshot>,
    pub stream_links: SnapshotCell<HashMap<i32, HashSet<i32>>>,
    pub sg_configs: SnapshotCell<SgConfigSnapshot>,
    pub sg_links: SnapshotCell<HashMap<i32, HashSet<i32>>>,

    streams_watermark: Watermark,
    descriptors_watermark: Watermark,
    links_watermark: Watermark,
    sg_links_watermark: Watermark,
}

impl FrsCaches {
    pub fn new() -> FrsCaches {
        FrsCaches::default()
    }

    pub fn token_to_group(&self, token: &str) -> Option<i32> {
        self.tokens.load().get(token).copied()
    }

    pub fn sg_token_to_id(&self, token: &str) -> Option<i32> {
        self.sg_configs
            .load()
            .by_token
            .get(token)
            .map(|c| c.id_special_group)
    }

    /// Refresh every cache once. Individual cache failures are logged and do
    /// not stop the others; the next poll retries.
    pub async fn refresh(&self, store: &FrsStore) {
        if let Err(e) = self.refresh_tokens(store).await {
            tracing::warn!(error = %e, "groups cache refresh failed");
        }
        if let Err(e) = self.refresh_configs(store).await {
            tracing::warn!(error = %e, "config cache refresh failed");
        }
        if let Err(e) = self.refresh_streams(store).await {
            tracing::warn!(error = %e, "stream config cache refresh failed");
        }
        if let Err(e) = self.refresh_descriptors(store).await {
            tracing::warn!(error = %e, "face descriptor cache refresh failed");
        }
        if let Err(e) = self.refresh_stream_links(store).await {
            tracing::warn!(error = %e, "stream link cache refresh failed");
        }
        if let Err(e) = self.refresh_sg_configs(store).await {
            tracing::warn!(error = %e, "special group config cache refresh failed");
        }
        if let Err(e) = self.refresh_sg_links(store).await {
            tracing::warn!(error = %e, "special group link cache refresh failed");
        }
    }

    async fn refresh_tokens(&self, store: &FrsStore) -> Result<()> {
        let rows = store.poll_groups().await?;
        self.tokens
            .store(rows.into_iter().map(|r| (r.auth_token, r.id_group)).collect());
        Ok(())
    }

    async fn refresh_configs(&self, store: &FrsStore) -> Result<()> {
        let rows = store.poll_configs().await?;
        let mut snapshot = ConfigSnapshot::default();
        for row in rows {
            let mut common = CommonConfig::default();
            let mut stream = StreamConfig::default();
            if let Some(config) = &row.config {
                common.apply(config);
                stream.apply(config);
            }
            stream.id_group = row.id_group;
            snapshot.common.insert(row.id_group, common);
            snapshot.default_stream.insert(row.id_group, stream);
        }
        self.configs.store(snapshot);
        Ok(())
    }

    async fn refresh_streams(&self, store: &FrsStore) -> Result<()> {
        let since = self.streams_watermark.get();
        let rows = store.poll_vstreams(since).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let newest = rows.iter().map(|r| r.last_updated).max();
        self.streams.update(|data| {
            for row in rows {
                if row.flag_deleted {
                    data.remove(&row.unique_key);
                    continue;
                }
                let mut config = StreamConfig::default();
                if let Some(blob) = &row.config {
                    config.apply(blob);
                }
                config.id_group = row.id_group;
                config.id_vstream = row.id_vstream;
                config.vstream_ext = row.vstream_ext;
                config.url = row.url;
                config.callback_url = row.callback_url;
                data.insert(row.unique_key, config);
            }
        });
        self.streams_watermark.advance(newest);
        Ok(())
    }

    async fn refresh_descriptors(&self, store: &FrsStore) -> Result<()> {
        let since = self.descriptors_watermark.get();
        let rows = store.poll_descriptors(since).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let newest = rows.iter().map(|r| r.last_updated).max();
        self.descriptors.update(|snapshot| {
            for row in rows {
                if row.flag_deleted {
                    snapshot.data.remove(&row.id_descriptor);
                    snapshot.spawned.remove(&row.id_descriptor);
                    continue;
                }
                let mut floats = floats_from_bytes(&row.descriptor_data);
                normalize_l2(&mut floats);
                snapshot.data.insert(row.id_descriptor, Arc::new(floats));
                if let Some(parent) = row.id_parent {
                    snapshot.spawned.insert(row.id_descriptor, parent);
                }
            }
        });
        self.descriptors_watermark.advance(newest);
        Ok(())
    }

    async fn refresh_stream_links(&self, store: &FrsStore) -> Result<()> {
        let since = self.links_watermark.get();
        let rows = store.poll_vstream_links(since).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let newest = rows.iter().map(|r| r.last_updated).max();
        self.stream_links.update(|data| {
            for row in rows {
                if row.flag_deleted {
                    if let Some(set) = data.get_mut(&row.id_vstream) {
                        set.remove(&row.id_descriptor);
                    }
                } else {
                    data.entry(row.id_vstream).or_default().insert(row.id_descriptor);
                }
            }
        });
        self.links_watermark.advance(newest);
        Ok(())
    }

    async fn refresh_sg_configs(&self, store: &FrsStore) -> Result<()> {
        let rows = store.poll_special_groups().await?;
        let mut snapshot = SgConfigSnapshot::default();
        for row in rows {
            snapshot
                .token_of
                .insert(row.id_special_group, row.sg_api_token.clone());
            snapshot
                .by_group
                .entry(row.id_group)
                .or_default()
                .insert(row.id_special_group);
            snapshot.by_token.insert(
                row.sg_api_token.clone(),
                SgConfig {
                    sg_api_token: row.sg_api_token,
                    id_special_group: row.id_special_group,
                    callback_url: row.callback_url,
                    max_descriptor_count: row.max_descriptor_count,
                    id_group: row.id_group,
                },
            );
        }
        self.sg_configs.store(snapshot);
        Ok(())
    }

    async fn refresh_sg_links(&self, store: &FrsStore) -> Result<()> {
        let since = self.sg_links_watermark.get();
        let rows = store.poll_sgroup_links(since).await?;
        if rows.is_empty() {
            return Ok(());
        }
        let newest = rows.iter().map(|r| r.last_updated).max();
        self.sg_links.update(|data| {
            for row in rows {
                if row.flag_deleted {
                    if let Some(set) = data.get_mut(&row.id_sgroup) {
                        set.remove(&row.id_descriptor);
                    }
                } else {
                    data.entry(row.id_sgroup).or_default().insert(row.id_descriptor);
                }
            }
        });
        self.sg_links_watermark.advance(newest);
        Ok(())
    }
}

//! LPRS read-through caches: tenant tokens and per-stream config. Stream
//! rows are hard-deleted in this schema, so both caches rebuild in full on
//! every poll.

use std::collections::HashMap;

use fp_domain::lprs::StreamConfig;
use fp_domain::Result;
use fp_store::lprs::LprsStore;

use crate::cache::SnapshotCell;

#[derive(Default)]
pub struct LprsCaches {
    pub tokens: SnapshotCell<HashMap<String, i32>>,
    pub streams: SnapshotCell<HashMap<String, StreamConfig>>,
}

impl LprsCaches {
    pub fn new() -> LprsCaches {
        LprsCaches::default()
    }

    pub fn token_to_group(&self, token: &str) -> Option<i32> {
        self.tokens.load().get(token).copied()
    }

    pub async fn refresh(&self, store: &LprsStore) {
        if let Err(e) = self.refresh_tokens(store).await {
            tracing::warn!(error = %e, "groups cache refresh failed");
        }
        if let Err(e) = self.refresh_streams(store).await {
            tracing::warn!(error = %e, "stream config cache refresh failed");
        }
    }

    async fn refresh_tokens(&self, store: &LprsStore) -> Result<()> {
        let rows = store.poll_groups().await?;
        self.tokens
            .store(rows.into_iter().map(|r| (r.auth_token, r.id_group)).collect());
        Ok(())
    }

    async fn refresh_streams(&self, store: &LprsStore) -> Result<()> {
        let rows = store.poll_vstreams().await?;
        let mut data = HashMap::with_capacity(rows.len());
        for row in rows {
            let mut config = StreamConfig::default();
            if let Some(blob) = &row.config {
                config.apply(blob);
            }
            config.id_group = row.id_group;
            config.id_vstream = row.id_vstream;
            config.ext_id = row.ext_id;
            data.insert(row.unique_key, config);
        }
        self.streams.store(data);
        Ok(())
    }
}

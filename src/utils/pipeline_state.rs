// src/utils/pipeline_state.rs - Checkpoints, committed resolutions and the edge log
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;

use crate::models::core::{CanonicalId, MentionId, SourceKind};
use crate::models::matching::{BlockKeyKind, EdgeState, EdgeTarget, MatchEdge, MatchMethod, Resolution};
use crate::utils::db_connect::PgPool;

/// Last committed offset for one (source kind, partition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub source_kind: SourceKind,
    pub partition: u32,
    pub last_offset: u64,
    pub epoch: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResolution {
    pub mention_id: MentionId,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDelta {
    pub canonical_id: CanonicalId,
    pub display_name: String,
    pub mention_count: usize,
}

/// Everything one micro-batch makes visible, written atomically.
#[derive(Debug, Clone)]
pub struct BatchCommit {
    pub run_id: String,
    pub epoch: u64,
    pub batch_num: usize,
    pub resolutions: Vec<StoredResolution>,
    pub edges: Vec<MatchEdge>,
    pub entities: Vec<EntityDelta>,
    pub checkpoints: Vec<Checkpoint>,
}

#[allow(async_fn_in_trait)]
pub trait RunStateStore {
    /// Drops all persisted run state (fresh runs).
    async fn reset(&mut self) -> Result<()>;
    async fn load_checkpoints(&mut self) -> Result<Vec<Checkpoint>>;
    async fn load_resolutions(&mut self) -> Result<Vec<StoredResolution>>;
    /// Edge log in sequence order.
    async fn load_edges(&mut self) -> Result<Vec<MatchEdge>>;
    /// All-or-nothing; re-committing the same batch must not duplicate anything.
    async fn commit_batch(&mut self, batch: &BatchCommit) -> Result<()>;
}

/// In-process store for tests and dry runs. Can be told to fail commits.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    checkpoints: BTreeMap<(SourceKind, u32), Checkpoint>,
    resolutions: BTreeMap<MentionId, Resolution>,
    edges: BTreeMap<u64, MatchEdge>,
    entities: BTreeMap<CanonicalId, EntityDelta>,
    commits_succeeded: usize,
    fail_after: Option<usize>,
    failures_remaining: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// After `successes` more successful commits, fail the next `failures` attempts.
    pub fn inject_failures(&mut self, successes: usize, failures: usize) {
        self.fail_after = Some(self.commits_succeeded + successes);
        self.failures_remaining = failures;
    }

    pub fn clear_failures(&mut self) {
        self.fail_after = None;
        self.failures_remaining = 0;
    }

    pub fn commits_succeeded(&self) -> usize {
        self.commits_succeeded
    }

    pub fn checkpoint(&self, source_kind: SourceKind, partition: u32) -> Option<&Checkpoint> {
        self.checkpoints.get(&(source_kind, partition))
    }
}

impl RunStateStore for MemoryStateStore {
    async fn reset(&mut self) -> Result<()> {
        self.checkpoints.clear();
        self.resolutions.clear();
        self.edges.clear();
        self.entities.clear();
        Ok(())
    }

    async fn load_checkpoints(&mut self) -> Result<Vec<Checkpoint>> {
        Ok(self.checkpoints.values().cloned().collect())
    }

    async fn load_resolutions(&mut self) -> Result<Vec<StoredResolution>> {
        Ok(self
            .resolutions
            .iter()
            .map(|(mention_id, resolution)| StoredResolution {
                mention_id: mention_id.clone(),
                resolution: *resolution,
            })
            .collect())
    }

    async fn load_edges(&mut self) -> Result<Vec<MatchEdge>> {
        Ok(self.edges.values().cloned().collect())
    }

    async fn commit_batch(&mut self, batch: &BatchCommit) -> Result<()> {
        if let Some(after) = self.fail_after {
            if self.commits_succeeded >= after && self.failures_remaining > 0 {
                self.failures_remaining -= 1;
                bail!("Injected commit failure for batch {}", batch.batch_num);
            }
        }

        for r in &batch.resolutions {
            self.resolutions.insert(r.mention_id.clone(), r.resolution);
        }
        for edge in &batch.edges {
            self.edges.insert(edge.seq, edge.clone());
        }
        for entity in &batch.entities {
            self.entities.insert(entity.canonical_id, entity.clone());
        }
        for cp in &batch.checkpoints {
            self.checkpoints.insert((cp.source_kind, cp.partition), cp.clone());
        }
        self.commits_succeeded += 1;
        Ok(())
    }
}

/// PostgreSQL-backed store in the `linkage_state` schema.
pub struct PgStateStore {
    pool: PgPool,
}

const SCHEMA_SQL: &str = "
    CREATE SCHEMA IF NOT EXISTS linkage_state;
    CREATE TABLE IF NOT EXISTS linkage_state.checkpoint (
        source_kind TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        last_offset BIGINT NOT NULL,
        epoch BIGINT NOT NULL,
        run_id TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (source_kind, partition_id)
    );
    CREATE TABLE IF NOT EXISTS linkage_state.mention_resolution (
        mention_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        canonical_id BIGINT,
        epoch BIGINT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS linkage_state.match_edge (
        seq BIGINT PRIMARY KEY,
        mention_id TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        method TEXT NOT NULL,
        score DOUBLE PRECISION NOT NULL,
        state TEXT NOT NULL,
        block_kind TEXT NOT NULL,
        block_key TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS linkage_state.canonical_entity (
        canonical_id BIGINT PRIMARY KEY,
        display_name TEXT NOT NULL,
        mention_count BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    );";

// Keeps each multi-row statement well under the 65535 bind-parameter limit.
const ROWS_PER_STATEMENT: usize = 1000;

fn placeholders(row: usize, width: usize) -> String {
    let start = row * width + 1;
    let cols: Vec<String> = (start..start + width).map(|i| format!("${}", i)).collect();
    format!("({})", cols.join(", "))
}

impl PgStateStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for ensure_schema")?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .context("Failed to create linkage_state schema")?;
        info!("📐 linkage_state schema is ready");
        Ok(())
    }
}

impl RunStateStore for PgStateStore {
    async fn reset(&mut self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset")?;
        conn.batch_execute(
            "TRUNCATE linkage_state.checkpoint, linkage_state.mention_resolution,
                      linkage_state.match_edge, linkage_state.canonical_entity",
        )
        .await
        .context("Failed to truncate linkage_state tables")?;
        warn!("🧹 Cleared persisted linkage state for a fresh run");
        Ok(())
    }

    async fn load_checkpoints(&mut self) -> Result<Vec<Checkpoint>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_checkpoints")?;
        let rows = conn
            .query(
                "SELECT source_kind, partition_id, last_offset, epoch, updated_at
                 FROM linkage_state.checkpoint ORDER BY source_kind, partition_id",
                &[],
            )
            .await
            .context("Failed to query linkage_state.checkpoint")?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("source_kind");
                let partition: i32 = row.get("partition_id");
                let last_offset: i64 = row.get("last_offset");
                let epoch: i64 = row.get("epoch");
                Ok(Checkpoint {
                    source_kind: SourceKind::parse(&kind)
                        .ok_or_else(|| anyhow!("Unknown source kind '{}' in checkpoint", kind))?,
                    partition: partition as u32,
                    last_offset: last_offset as u64,
                    epoch: epoch as u64,
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }

    async fn load_resolutions(&mut self) -> Result<Vec<StoredResolution>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_resolutions")?;
        let rows = conn
            .query(
                "SELECT mention_id, status, canonical_id FROM linkage_state.mention_resolution",
                &[],
            )
            .await
            .context("Failed to query linkage_state.mention_resolution")?;

        rows.iter()
            .map(|row| {
                let mention_id: String = row.get("mention_id");
                let status: String = row.get("status");
                let canonical_id: Option<i64> = row.get("canonical_id");
                let resolution =
                    Resolution::from_parts(&status, canonical_id.map(|id| CanonicalId(id as u64)))
                        .ok_or_else(|| {
                            anyhow!("Invalid stored resolution '{}' for {}", status, mention_id)
                        })?;
                Ok(StoredResolution {
                    mention_id: MentionId(mention_id),
                    resolution,
                })
            })
            .collect()
    }

    async fn load_edges(&mut self) -> Result<Vec<MatchEdge>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_edges")?;
        let rows = conn
            .query(
                "SELECT seq, mention_id, target_type, target_id, method, score, state, block_kind, block_key
                 FROM linkage_state.match_edge ORDER BY seq",
                &[],
            )
            .await
            .context("Failed to query linkage_state.match_edge")?;

        rows.iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let target_type: String = row.get("target_type");
                let target_id: String = row.get("target_id");
                let method: String = row.get("method");
                let state: String = row.get("state");
                let block_kind: String = row.get("block_kind");
                let target = match target_type.as_str() {
                    "entity" => EdgeTarget::Entity(CanonicalId(
                        target_id
                            .parse::<u64>()
                            .with_context(|| format!("Bad entity target '{}' on edge {}", target_id, seq))?,
                    )),
                    "mention" => EdgeTarget::Mention(MentionId(target_id)),
                    other => bail!("Unknown edge target type '{}' on edge {}", other, seq),
                };
                Ok(MatchEdge {
                    seq: seq as u64,
                    mention: MentionId(row.get("mention_id")),
                    target,
                    method: MatchMethod::parse(&method)
                        .ok_or_else(|| anyhow!("Unknown match method '{}' on edge {}", method, seq))?,
                    score: row.get("score"),
                    state: EdgeState::parse(&state)
                        .ok_or_else(|| anyhow!("Unknown edge state '{}' on edge {}", state, seq))?,
                    block_kind: BlockKeyKind::parse(&block_kind)
                        .ok_or_else(|| anyhow!("Unknown block kind '{}' on edge {}", block_kind, seq))?,
                    block_key: row.get("block_key"),
                })
            })
            .collect()
    }

    async fn commit_batch(&mut self, batch: &BatchCommit) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for commit_batch")?;
        let transaction = conn
            .transaction()
            .await
            .context("Failed to start transaction for batch commit")?;

        for chunk in batch.resolutions.chunks(ROWS_PER_STATEMENT) {
            let mut values = Vec::with_capacity(chunk.len());
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * 4);
            for (i, r) in chunk.iter().enumerate() {
                values.push(placeholders(i, 4));
                params.push(Box::new(r.mention_id.as_str().to_string()));
                params.push(Box::new(r.resolution.as_str().to_string()));
                params.push(Box::new(r.resolution.canonical_id().map(|id| id.0 as i64)));
                params.push(Box::new(batch.epoch as i64));
            }
            let sql = format!(
                "INSERT INTO linkage_state.mention_resolution (mention_id, status, canonical_id, epoch)
                 VALUES {}
                 ON CONFLICT (mention_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    canonical_id = EXCLUDED.canonical_id,
                    epoch = EXCLUDED.epoch",
                values.join(", ")
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            transaction
                .execute(sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to upsert mention resolutions")?;
        }

        for chunk in batch.edges.chunks(ROWS_PER_STATEMENT) {
            let mut values = Vec::with_capacity(chunk.len());
            let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::with_capacity(chunk.len() * 9);
            for (i, e) in chunk.iter().enumerate() {
                values.push(placeholders(i, 9));
                let (target_type, target_id) = match &e.target {
                    EdgeTarget::Entity(id) => ("entity", id.0.to_string()),
                    EdgeTarget::Mention(id) => ("mention", id.as_str().to_string()),
                };
                params.push(Box::new(e.seq as i64));
                params.push(Box::new(e.mention.as_str().to_string()));
                params.push(Box::new(target_type.to_string()));
                params.push(Box::new(target_id));
                params.push(Box::new(e.method.as_str().to_string()));
                params.push(Box::new(e.score));
                params.push(Box::new(e.state.as_str().to_string()));
                params.push(Box::new(e.block_kind.as_str().to_string()));
                params.push(Box::new(e.block_key.clone()));
            }
            let sql = format!(
                "INSERT INTO linkage_state.match_edge
                    (seq, mention_id, target_type, target_id, method, score, state, block_kind, block_key)
                 VALUES {}
                 ON CONFLICT (seq) DO NOTHING",
                values.join(", ")
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            transaction
                .execute(sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to insert match edges")?;
        }

        for entity in &batch.entities {
            transaction
                .execute(
                    "INSERT INTO linkage_state.canonical_entity (canonical_id, display_name, mention_count)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (canonical_id) DO UPDATE SET
                        display_name = EXCLUDED.display_name,
                        mention_count = EXCLUDED.mention_count,
                        updated_at = CURRENT_TIMESTAMP",
                    &[
                        &(entity.canonical_id.0 as i64),
                        &entity.display_name,
                        &(entity.mention_count as i64),
                    ],
                )
                .await
                .context("Failed to upsert canonical entity")?;
        }

        for cp in &batch.checkpoints {
            transaction
                .execute(
                    "INSERT INTO linkage_state.checkpoint
                        (source_kind, partition_id, last_offset, epoch, run_id, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     ON CONFLICT (source_kind, partition_id) DO UPDATE SET
                        last_offset = EXCLUDED.last_offset,
                        epoch = EXCLUDED.epoch,
                        run_id = EXCLUDED.run_id,
                        updated_at = EXCLUDED.updated_at",
                    &[
                        &cp.source_kind.as_str(),
                        &(cp.partition as i32),
                        &(cp.last_offset as i64),
                        &(cp.epoch as i64),
                        &batch.run_id,
                        &cp.updated_at,
                    ],
                )
                .await
                .context("Failed to upsert checkpoint")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit batch transaction")?;
        debug!(
            "Committed batch {} to linkage_state: {} resolutions, {} edges, {} entities",
            batch.batch_num,
            batch.resolutions.len(),
            batch.edges.len(),
            batch.entities.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(batch_num: usize, offset: u64) -> BatchCommit {
        BatchCommit {
            run_id: "run".to_string(),
            epoch: 0,
            batch_num,
            resolutions: vec![StoredResolution {
                mention_id: MentionId::new(SourceKind::Filer, &offset.to_string()),
                resolution: Resolution::Linked(CanonicalId(offset)),
            }],
            edges: Vec::new(),
            entities: Vec::new(),
            checkpoints: vec![Checkpoint {
                source_kind: SourceKind::Filer,
                partition: 0,
                last_offset: offset,
                epoch: 0,
                updated_at: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_state() {
        let mut store = MemoryStateStore::new();
        store.inject_failures(1, 1);

        store.commit_batch(&batch(1, 10)).await.unwrap();
        assert!(store.commit_batch(&batch(2, 20)).await.is_err());
        assert_eq!(store.checkpoint(SourceKind::Filer, 0).map(|c| c.last_offset), Some(10));
        assert_eq!(store.load_resolutions().await.unwrap().len(), 1);

        // The retry goes through and re-committing is idempotent.
        store.commit_batch(&batch(2, 20)).await.unwrap();
        store.commit_batch(&batch(2, 20)).await.unwrap();
        assert_eq!(store.checkpoint(SourceKind::Filer, 0).map(|c| c.last_offset), Some(20));
        assert_eq!(store.load_resolutions().await.unwrap().len(), 2);
        assert_eq!(store.commits_succeeded(), 3);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let mut store = MemoryStateStore::new();
        store.commit_batch(&batch(1, 10)).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.load_checkpoints().await.unwrap().is_empty());
        assert!(store.load_resolutions().await.unwrap().is_empty());
        assert!(store.load_edges().await.unwrap().is_empty());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0, 3), "($1, $2, $3)");
        assert_eq!(placeholders(2, 2), "($5, $6)");
    }
}

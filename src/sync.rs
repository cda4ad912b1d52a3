// src/sync.rs - pulls confirmed blocks from the coordinator and keeps
// the local difficulty policy in step.
use crate::block::Block;
use crate::constants::SYNC_RETRY_BACKOFF_SECS;
use crate::engine::Engine;
use crate::store::Store;
use num_bigint::BigUint;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BLOCKS_PER_REQUEST: i64 = 500;

#[derive(Deserialize)]
struct BlocksRangeResponse {
    status: String,
    #[serde(default)]
    blocks: Vec<WireBlock>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct DifficultyResponse {
    status: String,
    #[serde(default)]
    difficulty: Option<String>,
}

#[derive(Deserialize)]
struct WireBlock {
    version: String,
    height: i64,
    id: String,
    prev_hash: Option<String>,
    time: String,
    transactions: Vec<crate::transaction::Transaction>,
    merkle_root: String,
    difficulty: String,
    nonce: u64,
    hash: String,
}

impl TryFrom<WireBlock> for Block {
    type Error = crate::error::NodeError;

    fn try_from(w: WireBlock) -> crate::error::Result<Block> {
        let difficulty = BigUint::from_str(&w.difficulty)
            .map_err(|_| crate::error::NodeError::BadTxFields("difficulty is not a valid integer".into()))?;
        Block::from_fields(
            w.version,
            w.height,
            w.id,
            w.prev_hash,
            w.time,
            w.transactions,
            w.merkle_root,
            difficulty,
            w.nonce,
            w.hash,
            false,
        )
    }
}

pub struct SyncLoop<S: Store> {
    engine: Arc<Engine<S>>,
    client: reqwest::Client,
    coordinator_uri: String,
}

impl<S: Store + Send + Sync + 'static> SyncLoop<S> {
    pub fn new(engine: Arc<Engine<S>>, coordinator_uri: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with a static config");
        SyncLoop {
            engine,
            client,
            coordinator_uri,
        }
    }

    /// The block-sync loop: pulls `[next, next + limit)` forever until
    /// `cancel` is observed at the next suspension point.
    pub async fn run(&self, cancel: Arc<AtomicBool>) {
        let mut next = match self.engine.get_last_block() {
            Ok(Some(b)) => b.height + 1,
            Ok(None) => 0,
            Err(e) => {
                log::error!("sync loop: failed to read last block, starting from 0: {e}");
                0
            }
        };

        while !cancel.load(Ordering::Relaxed) {
            match self.fetch_range(next, BLOCKS_PER_REQUEST).await {
                Ok(blocks) if blocks.is_empty() => {
                    tokio::time::sleep(Duration::from_secs(SYNC_RETRY_BACKOFF_SECS)).await;
                }
                Ok(blocks) => {
                    let (new_next, err) = self.apply_blocks(blocks, next);
                    next = new_next;
                    if let Some(e) = err {
                        log::warn!("sync loop: rejected block while applying batch: {e}, resuming from height {next}");
                        tokio::time::sleep(Duration::from_secs(SYNC_RETRY_BACKOFF_SECS)).await;
                    }
                }
                Err(e) => {
                    log::warn!("sync loop: fetch failed: {e}, retrying");
                    tokio::time::sleep(Duration::from_secs(SYNC_RETRY_BACKOFF_SECS)).await;
                }
            }
        }
    }

    /// The lightweight difficulty-poll loop, run concurrently with `run`.
    pub async fn poll_difficulty(&self, cancel: Arc<AtomicBool>) {
        while !cancel.load(Ordering::Relaxed) {
            match self.fetch_difficulty().await {
                Ok(d) => self.engine.policy.set_difficulty(d),
                Err(e) => log::warn!("difficulty poll failed: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(SYNC_RETRY_BACKOFF_SECS)).await;
        }
    }

    async fn fetch_range(&self, start: i64, limit: i64) -> crate::error::Result<Vec<Block>> {
        let url = format!("{}/v1/block/get-range", self.coordinator_uri);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "start": start, "end": start + limit }))
            .send()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;

        let body: BlocksRangeResponse = resp
            .json()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;

        if body.status != "success" {
            return Err(crate::error::NodeError::TransportError(
                body.message.unwrap_or_else(|| "coordinator returned an error".into()),
            ));
        }

        body.blocks.into_iter().map(Block::try_from).collect()
    }

    async fn fetch_difficulty(&self) -> crate::error::Result<BigUint> {
        let url = format!("{}/v1/difficulty", self.coordinator_uri);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        let body: DifficultyResponse = resp
            .json()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        if body.status != "success" {
            return Err(crate::error::NodeError::TransportError("coordinator returned an error".into()));
        }
        let raw = body.difficulty.ok_or_else(|| crate::error::NodeError::TransportError("missing difficulty".into()))?;
        BigUint::from_str(&raw).map_err(|_| crate::error::NodeError::TransportError("malformed difficulty".into()))
    }

    /// Apply a contiguous batch without the difficulty check (the sync
    /// loop trusts the coordinator's proof-of-work, already verified
    /// by `Block::verify()` inside `add_block`). Each block commits to
    /// the store individually, so on a mid-batch rejection the blocks
    /// before it are already durable; the returned height always
    /// reflects the last one actually committed, never the original
    /// `start`, so the caller never re-fetches an already-applied
    /// prefix and stalls.
    fn apply_blocks(&self, blocks: Vec<Block>, start: i64) -> (i64, Option<crate::error::NodeError>) {
        let mut next = start;
        for block in blocks {
            let height = block.height;
            match self.engine.add_block(block, false) {
                Ok(()) => next = height + 1,
                Err(e) => return (next, Some(e)),
            }
        }
        (next, None)
    }
}

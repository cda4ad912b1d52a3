// src/mining.rs - assembles and mines candidate blocks from the
// coordinator's unconfirmed pool.
use crate::block::Block;
use crate::constants::{MINE_REJECT_BACKOFF_SECS, MINE_RETRY_BACKOFF_SECS, MINING_BATCH_SIZE, MINING_TX_BATCH};
use crate::crypto;
use crate::engine::Engine;
use crate::store::Store;
use crate::transaction::{gen_random_id, now_iso, Transaction};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
struct TxRangeResponse {
    status: String,
    #[serde(default)]
    transactions: Vec<Transaction>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

/// Distinguishes where in the cycle an error came from, so `run` can
/// apply the short retry backoff to everything before submission and
/// reserve the long one for an actual submit rejection.
enum CycleError {
    PreSubmit(crate::error::NodeError),
    Submit(crate::error::NodeError),
}

pub struct MiningLoop<S: Store> {
    engine: Arc<Engine<S>>,
    client: reqwest::Client,
    coordinator_uri: String,
    miner_address: String,
}

impl<S: Store + Send + Sync + 'static> MiningLoop<S> {
    pub fn new(engine: Arc<Engine<S>>, coordinator_uri: String, miner_address: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with a static config");
        MiningLoop {
            engine,
            client,
            coordinator_uri,
            miner_address,
        }
    }

    pub async fn run(&self, cancel: Arc<AtomicBool>) {
        while !cancel.load(Ordering::Relaxed) {
            match self.mine_one_cycle(&cancel).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(Duration::from_secs(MINE_RETRY_BACKOFF_SECS)).await,
                Err(CycleError::Submit(e)) => {
                    log::warn!("block submission rejected: {e}");
                    tokio::time::sleep(Duration::from_secs(MINE_REJECT_BACKOFF_SECS)).await;
                }
                Err(CycleError::PreSubmit(e)) => {
                    log::warn!("mining cycle failed before submission: {e}");
                    tokio::time::sleep(Duration::from_secs(MINE_RETRY_BACKOFF_SECS)).await;
                }
            }
        }
    }

    /// Returns `Ok(true)` if a block was mined and submitted successfully.
    /// Errors before the submit step are ordinary failures (empty pool,
    /// transport hiccup fetching candidates, a stale parent); only a
    /// rejection from the coordinator's submit endpoint gets the longer
    /// backoff.
    async fn mine_one_cycle(&self, cancel: &Arc<AtomicBool>) -> Result<bool, CycleError> {
        let pending = self.fetch_unconfirmed(MINING_TX_BATCH as i64).await.map_err(CycleError::PreSubmit)?;
        let accepted = self.filter_by_balance(pending).map_err(CycleError::PreSubmit)?;

        let last = self
            .engine
            .get_last_block()
            .map_err(CycleError::PreSubmit)?
            .ok_or(crate::error::NodeError::MissingParent)
            .map_err(CycleError::PreSubmit)?;

        let fees: i64 = accepted.iter().map(|t| t.fee).sum();
        let mut reward = Transaction::new_unsigned(
            self.miner_address.clone(),
            None,
            None,
            self.engine.policy.reward_amount + fees,
            0,
        );
        reward.finalize_unsigned();

        let mut transactions = Vec::with_capacity(accepted.len() + 1);
        transactions.push(reward);
        transactions.extend(accepted);

        let block = Block::from_fields(
            crate::constants::VERSION.to_string(),
            last.height + 1,
            gen_random_id(),
            Some(last.hash.clone()),
            now_iso(),
            transactions,
            String::new(),
            self.engine.policy.difficulty(),
            0,
            String::new(),
            false,
        )
        .map_err(CycleError::PreSubmit)?;

        let cancel_for_batches = cancel.clone();
        let mined = tokio::task::spawn_blocking(move || {
            let mut block = block;
            if block.mine(MINING_BATCH_SIZE, cancel_for_batches.as_ref())? {
                Ok::<Option<Block>, crate::error::NodeError>(Some(block))
            } else {
                Ok(None)
            }
        });

        let block = match mined.await {
            Ok(Ok(Some(block))) => block,
            Ok(Ok(None)) => return Ok(false),
            Ok(Err(e)) => return Err(CycleError::PreSubmit(e)),
            Err(_) => return Ok(false),
        };

        self.submit(&block).await.map_err(CycleError::Submit)?;
        Ok(true)
    }

    async fn fetch_unconfirmed(&self, limit: i64) -> crate::error::Result<Vec<Transaction>> {
        let url = format!("{}/v1/unconfirmed-transaction/get-range", self.coordinator_uri);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "start": 0, "end": limit, "is_reversed": true }))
            .send()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        let body: TxRangeResponse = resp
            .json()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        if body.status != "success" {
            return Err(crate::error::NodeError::TransportError("coordinator returned an error".into()));
        }
        Ok(body.transactions)
    }

    /// Drop txs with a malformed address, then drop any tx whose
    /// sender can no longer cover `amount + fee` against a running,
    /// cumulatively-debited balance.
    fn filter_by_balance(&self, candidates: Vec<Transaction>) -> crate::error::Result<Vec<Transaction>> {
        let mut running: HashMap<String, i64> = HashMap::new();
        let mut accepted = Vec::new();
        for tx in candidates {
            let sender = match &tx.sender_address {
                Some(s) if crypto::is_valid_address_shape(s) => s.clone(),
                _ => continue,
            };
            if !crypto::is_valid_address_shape(&tx.recipient_address) {
                continue;
            }
            let balance = *running
                .entry(sender.clone())
                .or_insert_with(|| self.engine.confirmed_balance(&sender).unwrap_or(0));
            let cost = tx.amount + tx.fee;
            if balance < cost {
                continue;
            }
            running.insert(sender, balance - cost);
            accepted.push(tx);
        }
        Ok(accepted)
    }

    async fn submit(&self, block: &Block) -> crate::error::Result<()> {
        let url = format!("{}/v1/block/add", self.coordinator_uri);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "block": block_to_wire(block) }))
            .send()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| crate::error::NodeError::TransportError(e.to_string()))?;
        if body.status != "success" {
            return Err(crate::error::NodeError::TransportError(
                body.message.unwrap_or_else(|| "block rejected".into()),
            ));
        }
        Ok(())
    }
}

fn block_to_wire(b: &Block) -> serde_json::Value {
    serde_json::json!({
        "version": b.version,
        "height": b.height,
        "id": b.id,
        "prev_hash": b.prev_hash,
        "time": b.time,
        "transactions": b.transactions,
        "merkle_root": b.merkle_root,
        "difficulty": b.difficulty.to_string(),
        "nonce": b.nonce,
        "hash": b.hash,
    })
}

// src/api.rs - warp route table: one logical envelope,
// {status: "success"|"error", ...}, errors carry `message`.
use crate::block::Block;
use crate::engine::Engine;
use crate::error::NodeError;
use crate::store::Store;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

fn ok_json(value: Value) -> warp::reply::Json {
    let mut body = match value {
        Value::Object(map) => map,
        other => {
            let mut m = serde_json::Map::new();
            m.insert("data".into(), other);
            m
        }
    };
    body.insert("status".into(), json!("success"));
    warp::reply::json(&Value::Object(body))
}

fn err_json(err: &NodeError) -> warp::reply::Json {
    if err.is_infrastructure() {
        log::error!("infrastructure error: {err}");
        warp::reply::json(&json!({
            "status": "error",
            "message": "internal error",
            "kind": "SystemError",
        }))
    } else {
        log::warn!("rejected request: {} ({})", err.message(), err.kind());
        warp::reply::json(&json!({
            "status": "error",
            "message": err.message(),
            "kind": err.kind(),
        }))
    }
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> impl Reply {
    match result {
        Ok(value) => ok_json(serde_json::to_value(value).unwrap_or(json!({}))),
        Err(e) => err_json(&e),
    }
}

#[derive(Deserialize)]
struct AddressInfoRequest {
    address: String,
    #[serde(default)]
    include_transactions: bool,
}

#[derive(Deserialize)]
struct TxIdRequest {
    transaction_id: String,
}

#[derive(Deserialize)]
struct RangeRequest {
    start: i64,
    end: Option<i64>,
    #[serde(default)]
    is_reversed: bool,
}

#[derive(Deserialize)]
struct AddTxRequest {
    transaction: Transaction,
}

#[derive(Deserialize)]
struct BlockIdRequest {
    block_id: Option<String>,
    height: Option<i64>,
}

#[derive(Deserialize)]
struct AddBlockRequest {
    block: RawBlock,
}

/// Wire shape of a block, deserialised non-strictly and turned into a
/// `Block` by the engine's own `from_fields` strict check.
#[derive(Deserialize)]
struct RawBlock {
    version: String,
    height: i64,
    id: String,
    prev_hash: Option<String>,
    time: String,
    transactions: Vec<Transaction>,
    merkle_root: String,
    difficulty: String,
    nonce: u64,
    hash: String,
}

fn with_engine<S: Store + Send + Sync + 'static>(
    engine: Arc<Engine<S>>,
) -> impl Filter<Extract = (Arc<Engine<S>>,), Error = Infallible> + Clone {
    warp::any().map(move || engine.clone())
}

pub fn routes<S: Store + Send + Sync + 'static>(
    engine: Arc<Engine<S>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let base = warp::path("v1");

    let stats = base
        .and(warp::path("stats"))
        .and(warp::path::end())
        .and(with_engine(engine.clone()))
        .and_then(stats_handler);

    let difficulty = base
        .and(warp::path("difficulty"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(difficulty_handler);

    let reward = base
        .and(warp::path("reward"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(reward_handler);

    let fee = base
        .and(warp::path("fee"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_engine(engine.clone()))
        .and_then(fee_handler);

    let address_info = base
        .and(warp::path("get-address-info"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(address_info_handler);

    let tx_get = base
        .and(warp::path("transaction"))
        .and(warp::path("get"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(tx_get_handler);

    let tx_range = base
        .and(warp::path("transaction"))
        .and(warp::path("get-range"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(tx_range_handler);

    let utx_get = base
        .and(warp::path("unconfirmed-transaction"))
        .and(warp::path("get"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(utx_get_handler);

    let utx_range = base
        .and(warp::path("unconfirmed-transaction"))
        .and(warp::path("get-range"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(utx_range_handler);

    let utx_add = base
        .and(warp::path("unconfirmed-transaction"))
        .and(warp::path("add"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(utx_add_handler);

    let block_get = base
        .and(warp::path("block"))
        .and(warp::path("get"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(block_get_handler);

    let block_range = base
        .and(warp::path("block"))
        .and(warp::path("get-range"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine.clone()))
        .and_then(block_range_handler);

    let block_add = base
        .and(warp::path("block"))
        .and(warp::path("add"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_engine(engine))
        .and_then(block_add_handler);

    stats
        .or(difficulty)
        .unify()
        .or(reward)
        .unify()
        .or(fee)
        .unify()
        .or(address_info)
        .unify()
        .or(tx_get)
        .unify()
        .or(tx_range)
        .unify()
        .or(utx_get)
        .unify()
        .or(utx_range)
        .unify()
        .or(utx_add)
        .unify()
        .or(block_get)
        .unify()
        .or(block_range)
        .unify()
        .or(block_add)
        .unify()
}

async fn stats_handler<S: Store + 'static>(engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = (|| -> crate::error::Result<Value> {
        let supply = engine.get_total_supply()?;
        let volumes = engine.get_volumes()?;
        let volumes: serde_json::Map<String, Value> =
            volumes.into_iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
        let hourly = engine.get_cumulative_volume(crate::constants::VolumeUnit::Hours, crate::constants::HOURLY_BUCKETS)?;
        let daily = engine.get_cumulative_volume(crate::constants::VolumeUnit::Days, crate::constants::DAILY_BUCKETS)?;
        let monthly = engine.get_cumulative_volume(crate::constants::VolumeUnit::Months, crate::constants::MONTHLY_BUCKETS)?;
        Ok(json!({
            "supply": supply,
            "volumes": volumes,
            "hourly": hourly,
            "daily": daily,
            "monthly": monthly,
        }))
    })();
    Ok(match result {
        Ok(v) => ok_json(v),
        Err(e) => err_json(&e),
    })
}

async fn difficulty_handler<S: Store + 'static>(engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    Ok(ok_json(json!({ "difficulty": engine.policy.difficulty().to_string() })))
}

async fn reward_handler<S: Store + 'static>(engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    Ok(ok_json(json!({ "reward": engine.policy.reward_amount })))
}

async fn fee_handler<S: Store + 'static>(engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    Ok(ok_json(json!({ "fee": engine.policy.min_fee })))
}

async fn address_info_handler<S: Store + 'static>(
    req: AddressInfoRequest,
    engine: Arc<Engine<S>>,
) -> Result<warp::reply::Json, Infallible> {
    Ok(respond(engine.get_address_info(&req.address, req.include_transactions)))
}

async fn tx_get_handler<S: Store + 'static>(req: TxIdRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = engine
        .get_confirmed_tx(&req.transaction_id)
        .and_then(|opt| opt.ok_or_else(|| NodeError::UnknownEntity(req.transaction_id.clone())));
    Ok(respond(result))
}

async fn tx_range_handler<S: Store + 'static>(req: RangeRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    match range_limit(&req, crate::constants::MAX_CONFIRMED_TX_RANGE as i64) {
        Ok(limit) => Ok(respond(engine.get_confirmed_txs_range(req.start, limit, req.is_reversed))),
        Err(e) => Ok(err_json(&e)),
    }
}

async fn utx_get_handler<S: Store + 'static>(req: TxIdRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = engine
        .get_unconfirmed_tx(&req.transaction_id)
        .and_then(|opt| opt.ok_or_else(|| NodeError::UnknownEntity(req.transaction_id.clone())));
    Ok(respond(result))
}

async fn utx_range_handler<S: Store + 'static>(req: RangeRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    match range_limit(&req, crate::constants::MAX_UNCONFIRMED_TX_RANGE as i64) {
        Ok(limit) => Ok(respond(engine.get_unconfirmed_txs_range(req.start, limit, req.is_reversed))),
        Err(e) => Ok(err_json(&e)),
    }
}

async fn utx_add_handler<S: Store + 'static>(req: AddTxRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = engine.add_unconfirmed_transaction(req.transaction).map(|_| json!({}));
    Ok(respond(result))
}

async fn block_get_handler<S: Store + 'static>(req: BlockIdRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = (|| -> crate::error::Result<Block> {
        let found = match (&req.block_id, req.height) {
            (Some(id), _) => engine.get_block_by_id(id)?,
            (None, Some(h)) => engine.get_block_at_height(h)?,
            (None, None) => None,
        };
        found.ok_or_else(|| NodeError::UnknownEntity("block".into()))
    })();
    Ok(match result {
        Ok(b) => ok_json(block_to_json(&b)),
        Err(e) => err_json(&e),
    })
}

async fn block_range_handler<S: Store + 'static>(req: RangeRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let limit = match range_limit(&req, crate::constants::MAX_BLOCKS_RANGE as i64) {
        Ok(limit) => limit,
        Err(e) => return Ok(err_json(&e)),
    };
    let result = engine.get_blocks_range(req.start, limit, req.is_reversed);
    Ok(match result {
        Ok(blocks) => ok_json(json!({ "blocks": blocks.iter().map(block_to_json).collect::<Vec<_>>() })),
        Err(e) => err_json(&e),
    })
}

/// `end - start` must not exceed `cap`; a request with no `end` asks
/// for exactly `cap` rows, matching the coordinator's own default.
fn range_limit(req: &RangeRequest, cap: i64) -> crate::error::Result<i64> {
    match req.end {
        Some(end) => {
            let limit = end - req.start;
            if limit > cap {
                return Err(NodeError::BadTxFields(format!("end - start exceeds the maximum of {cap}")));
            }
            Ok(limit)
        }
        None => Ok(cap),
    }
}

async fn block_add_handler<S: Store + 'static>(req: AddBlockRequest, engine: Arc<Engine<S>>) -> Result<warp::reply::Json, Infallible> {
    let result = (|| -> crate::error::Result<()> {
        let difficulty = num_bigint::BigUint::parse_bytes(req.block.difficulty.as_bytes(), 10)
            .ok_or_else(|| NodeError::BadTxFields("difficulty is not a valid integer".into()))?;
        let block = Block::from_fields(
            req.block.version,
            req.block.height,
            req.block.id,
            req.block.prev_hash,
            req.block.time,
            req.block.transactions,
            req.block.merkle_root,
            difficulty,
            req.block.nonce,
            req.block.hash,
            true,
        )?;
        engine.add_block(block, true)
    })();
    Ok(respond(result.map(|_| json!({}))))
}

fn block_to_json(b: &Block) -> Value {
    json!({
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

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (StatusCode::BAD_REQUEST, "malformed request body")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "status": "error", "message": message })),
        code,
    ))
}

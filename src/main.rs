// src/main.rs - CLI entry point: load config, open the store, spawn
// the sync and mining loops, serve the HTTP API.
use clap::Parser;
use jolt_node::config::{Cli, NodeConfig};
use jolt_node::engine::{Engine, Policy};
use jolt_node::store::RocksDbStore;
use jolt_node::{api, constants, init_logging, mining, sync};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[tokio::main]
async fn main() -> jolt_node::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::load_default()?,
    };
    config.apply_cli(&cli);
    config.validate()?;

    init_logging(&config.log_level);
    log::info!("starting {} v{}", jolt_node::NAME, jolt_node::VERSION);

    let store = RocksDbStore::open(&config.store_path)?;

    let policy = Policy::new(
        constants::max_u256() >> 8u32,
        constants::DEFAULT_REWARD_AMOUNT,
        constants::DEFAULT_MIN_FEE,
        constants::DEFAULT_MAX_SUPPLY,
    );
    let engine = Arc::new(Engine::new(store, policy));
    maybe_generate_genesis(&engine, &config)?;
    let cancel = Arc::new(AtomicBool::new(false));

    if !config.no_sync {
        let sync_loop = Arc::new(sync::SyncLoop::new(engine.clone(), config.coordinator_uri.clone()));
        let block_cancel = cancel.clone();
        let diff_cancel = cancel.clone();
        let block_loop = sync_loop.clone();
        let diff_loop = sync_loop.clone();
        tokio::spawn(async move { block_loop.run(block_cancel).await });
        tokio::spawn(async move { diff_loop.poll_difficulty(diff_cancel).await });
    }

    if !config.no_mine {
        let miner_address = config
            .miner_address
            .clone()
            .expect("validate() requires miner_address when mining is enabled");
        let mining_loop = mining::MiningLoop::new(engine.clone(), config.coordinator_uri.clone(), miner_address);
        let mine_cancel = cancel.clone();
        tokio::spawn(async move { mining_loop.run(mine_cancel).await });
    }

    let routes = api::routes(engine).recover(api::handle_rejection);
    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| jolt_node::NodeError::BadTxFields("invalid host/port".into()))?;

    log::info!("serving on {addr}");
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        log::info!("shutdown signal received");
    });
    server.await;

    Ok(())
}

/// Builds the height-0 block from the configured credit-pair list and
/// admits it through the same `add_block` path as any other block, so
/// genesis gets the same uniqueness/double-spend checks as height > 0.
fn maybe_generate_genesis(engine: &Engine<RocksDbStore>, config: &NodeConfig) -> jolt_node::Result<()> {
    if !config.generate_genesis || engine.count_blocks()? > 0 {
        return Ok(());
    }

    let mut credits = Vec::with_capacity(config.genesis_credits.len());
    for entry in &config.genesis_credits {
        let mut credit = jolt_node::Transaction::new_unsigned(entry.address.clone(), None, None, entry.amount, 0);
        credit.finalize_unsigned();
        credits.push(credit);
    }

    let mut block = jolt_node::Block::from_fields(
        constants::VERSION.to_string(),
        0,
        jolt_node::transaction::gen_random_id(),
        None,
        jolt_node::transaction::now_iso(),
        credits,
        String::new(),
        constants::max_u256() >> 8u32,
        0,
        String::new(),
        false,
    )?;
    let cancel = AtomicBool::new(false);
    block.mine(constants::MINING_BATCH_SIZE, &cancel)?;
    let id = block.id.clone();
    engine.add_block(block, false)?;
    log::info!("generated genesis block {id}");
    Ok(())
}

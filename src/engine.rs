// src/engine.rs - the chain engine: admits/rejects blocks and
// unconfirmed transactions, answers aggregate queries. All mutators
// and all readers funnel through a single serialised critical section
// over the store (see design notes: one guard, never per-row locks).
use crate::block::Block;
use crate::constants::{self, VERSION, VOLUME_WINDOWS};
use crate::crypto;
use crate::error::{NodeError, Result};
use crate::store::Store;
use crate::transaction::Transaction;
use chrono::{Duration, NaiveDateTime, Utc};
use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Process-wide policy. Only `difficulty` changes at runtime (written
/// by the sync loop); the rest is fixed for the life of the process.
pub struct Policy {
    pub difficulty: RwLock<BigUint>,
    pub reward_amount: i64,
    pub min_fee: i64,
    pub max_supply: i64,
}

impl Policy {
    pub fn new(difficulty: BigUint, reward_amount: i64, min_fee: i64, max_supply: i64) -> Self {
        Policy {
            difficulty: RwLock::new(difficulty),
            reward_amount,
            min_fee,
            max_supply,
        }
    }

    pub fn difficulty(&self) -> BigUint {
        self.difficulty.read().clone()
    }

    pub fn set_difficulty(&self, d: BigUint) {
        *self.difficulty.write() = d;
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AddressInfo {
    pub confirmed_received: i64,
    pub confirmed_sent: i64,
    pub confirmed_fee: i64,
    pub confirmed_balance: i64,
    pub unconfirmed_received: i64,
    pub unconfirmed_sent: i64,
    pub unconfirmed_fee: i64,
    pub unconfirmed_balance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_transactions: Option<Vec<Transaction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unconfirmed_transactions: Option<Vec<Transaction>>,
}

pub struct Engine<S: Store> {
    store: S,
    lock: Mutex<()>,
    pub policy: Policy,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, policy: Policy) -> Self {
        Engine {
            store,
            lock: Mutex::new(()),
            policy,
        }
    }

    /// §4.6.1: validate and admit an unconfirmed transaction.
    pub fn add_unconfirmed_transaction(&self, tx: Transaction) -> Result<()> {
        match self.add_unconfirmed_transaction_inner(tx) {
            Ok(id) => {
                log::info!("admitted unconfirmed transaction {id}");
                Ok(())
            }
            Err(e) => {
                log::warn!("rejected unconfirmed transaction: {} ({})", e.message(), e.kind());
                Err(e)
            }
        }
    }

    fn add_unconfirmed_transaction_inner(&self, tx: Transaction) -> Result<String> {
        let _guard = self.lock.lock();
        if tx.amount < 0 {
            return Err(NodeError::NegativeAmount);
        }
        if tx.fee < self.policy.min_fee {
            return Err(NodeError::FeeTooLow);
        }
        if !tx.verify() {
            return Err(NodeError::VerifyFailed);
        }
        if self.store.exists_confirmed_tx(&tx.id)? {
            return Err(NodeError::AlreadyConfirmed);
        }
        if self.store.exists_unconfirmed_tx(&tx.id)? {
            return Err(NodeError::AlreadyPending);
        }
        self.store.insert_unconfirmed_tx(&tx)?;
        Ok(tx.id)
    }

    /// §4.6.2: validate and admit a block, in the exact order the
    /// design specifies. Genesis (height 0) skips rules 3, 4, 6, 8 and
    /// treats every transaction as a credit; rule 7 still applies.
    pub fn add_block(&self, block: Block, check_difficulty: bool) -> Result<()> {
        let height = block.height;
        match self.add_block_inner(block, check_difficulty) {
            Ok(id) => {
                log::info!("admitted block {id} at height {height}");
                Ok(())
            }
            Err(e) => {
                log::warn!("rejected block at height {height}: {} ({})", e.message(), e.kind());
                Err(e)
            }
        }
    }

    fn add_block_inner(&self, block: Block, check_difficulty: bool) -> Result<String> {
        let _guard = self.lock.lock();
        let height = block.height;

        if check_difficulty && block.difficulty != self.policy.difficulty() {
            return Err(NodeError::DifficultyMismatch);
        }

        if !block.verify() {
            return Err(NodeError::BlockInvalid);
        }

        if height > 0 {
            self.check_reward_tx(&block)?;
            self.check_remaining_txs(&block)?;
        }

        if self.store.get_block_by_id(&block.id)?.is_some() || self.store.get_block_at_height(height)?.is_some() {
            return Err(NodeError::BlockExists);
        }

        if height > 0 {
            let parent = self
                .store
                .get_block_at_height(height - 1)?
                .ok_or(NodeError::MissingParent)?;
            if block.prev_hash.as_deref() != Some(parent.hash.as_str()) {
                return Err(NodeError::PrevHashMismatch);
            }
        }

        let ids: Vec<String> = block.transactions.iter().map(|t| t.id.clone()).collect();
        if !self.store.ids_of_confirmed_txs_in(&ids)?.is_empty() {
            return Err(NodeError::DoubleSpend);
        }

        if height > 0 {
            self.check_solvency(&block)?;
        }

        let mut promote_ids = Vec::new();
        let mut new_confirmed = Vec::new();
        for tx in &block.transactions {
            if self.store.exists_unconfirmed_tx(&tx.id)? {
                promote_ids.push(tx.id.clone());
            } else {
                new_confirmed.push(tx.clone());
            }
        }

        let id = block.id.clone();
        self.store.insert_block(&block, &promote_ids, &new_confirmed)?;
        Ok(id)
    }

    fn check_reward_tx(&self, block: &Block) -> Result<()> {
        let reward = block
            .transactions
            .first()
            .ok_or_else(|| NodeError::BadRewardTx("block has no reward transaction".into()))?;

        if reward.version != VERSION {
            return Err(NodeError::BadRewardTx("wrong version".into()));
        }
        if reward.id.len() != 64 {
            return Err(NodeError::BadRewardTx("id must be 64 hex chars".into()));
        }
        if parse_time(&reward.time).is_none() {
            return Err(NodeError::BadRewardTx("unparseable time".into()));
        }
        if !reward.is_senderless() {
            return Err(NodeError::BadRewardTx(
                "sender_address/sender_public_key/signature must be absent".into(),
            ));
        }
        if !crypto::is_valid_address_shape(&reward.recipient_address) {
            return Err(NodeError::BadRewardTx("bad recipient address shape".into()));
        }
        if reward.fee != 0 {
            return Err(NodeError::BadRewardTx("reward fee must be zero".into()));
        }
        let other_fees: i64 = block.transactions[1..].iter().map(|t| t.fee).sum();
        let ceiling = self.policy.reward_amount + other_fees;
        if reward.amount < 0 || reward.amount > ceiling {
            return Err(NodeError::BadRewardTx("amount exceeds reward + fees".into()));
        }
        Ok(())
    }

    fn check_remaining_txs(&self, block: &Block) -> Result<()> {
        for tx in &block.transactions[1..] {
            if tx.version != VERSION {
                return Err(NodeError::BadTxFields("wrong version".into()));
            }
            if tx.id.len() != 64 {
                return Err(NodeError::BadTxFields("id must be 64 hex chars".into()));
            }
            if parse_time(&tx.time).is_none() {
                return Err(NodeError::BadTxFields("unparseable time".into()));
            }
            let sender_ok = tx
                .sender_address
                .as_deref()
                .map(crypto::is_valid_address_shape)
                .unwrap_or(false);
            if !sender_ok || !crypto::is_valid_address_shape(&tx.recipient_address) {
                return Err(NodeError::BadTxFields("bad address shape".into()));
            }
            if tx.amount < 0 {
                return Err(NodeError::BadTxFields("negative amount".into()));
            }
            if tx.fee < self.policy.min_fee {
                return Err(NodeError::BadTxFields("fee below minimum".into()));
            }
        }
        Ok(())
    }

    fn check_solvency(&self, block: &Block) -> Result<()> {
        let mut spend_by_sender: HashMap<&str, i64> = HashMap::new();
        for tx in &block.transactions[1..] {
            let sender = tx.sender_address.as_deref().unwrap_or_default();
            *spend_by_sender.entry(sender).or_insert(0) += tx.amount + tx.fee;
        }
        for (sender, total) in spend_by_sender {
            let balance = self.store.confirmed_credit_sum(sender)?
                - self.store.confirmed_debit_sum(sender)?
                - self.store.confirmed_fee_sum(sender)?;
            if balance < total {
                return Err(NodeError::InsufficientFunds);
            }
        }
        Ok(())
    }

    pub fn get_last_block(&self) -> Result<Option<Block>> {
        let _guard = self.lock.lock();
        self.store.get_last_block()
    }

    pub fn get_block_by_id(&self, id: &str) -> Result<Option<Block>> {
        let _guard = self.lock.lock();
        self.store.get_block_by_id(id)
    }

    pub fn get_block_at_height(&self, height: i64) -> Result<Option<Block>> {
        let _guard = self.lock.lock();
        self.store.get_block_at_height(height)
    }

    pub fn get_blocks_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Block>> {
        if limit > constants::MAX_BLOCKS_RANGE as i64 {
            return Err(NodeError::BadTxFields(format!(
                "range exceeds maximum of {} blocks",
                constants::MAX_BLOCKS_RANGE
            )));
        }
        let _guard = self.lock.lock();
        self.store.get_blocks_range(offset, limit, reversed)
    }

    pub fn count_blocks(&self) -> Result<i64> {
        let _guard = self.lock.lock();
        self.store.count_blocks()
    }

    pub fn get_confirmed_tx(&self, id: &str) -> Result<Option<Transaction>> {
        let _guard = self.lock.lock();
        self.store.get_confirmed_tx(id)
    }

    pub fn get_unconfirmed_tx(&self, id: &str) -> Result<Option<Transaction>> {
        let _guard = self.lock.lock();
        self.store.get_unconfirmed_tx(id)
    }

    pub fn get_confirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>> {
        if limit > constants::MAX_CONFIRMED_TX_RANGE as i64 {
            return Err(NodeError::BadTxFields(format!(
                "range exceeds maximum of {} confirmed transactions",
                constants::MAX_CONFIRMED_TX_RANGE
            )));
        }
        let _guard = self.lock.lock();
        self.store.get_confirmed_txs_range(offset, limit, reversed)
    }

    pub fn get_unconfirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>> {
        if limit > constants::MAX_UNCONFIRMED_TX_RANGE as i64 {
            return Err(NodeError::BadTxFields(format!(
                "range exceeds maximum of {} unconfirmed transactions",
                constants::MAX_UNCONFIRMED_TX_RANGE
            )));
        }
        let _guard = self.lock.lock();
        self.store.get_unconfirmed_txs_range(offset, limit, reversed)
    }

    /// Pull up to `limit` unconfirmed transactions for the mining loop,
    /// most-recent first.
    pub fn pull_unconfirmed_for_mining(&self, limit: i64) -> Result<Vec<Transaction>> {
        self.get_unconfirmed_txs_range(0, limit, true)
    }

    pub fn confirmed_balance(&self, address: &str) -> Result<i64> {
        let _guard = self.lock.lock();
        Ok(self.store.confirmed_credit_sum(address)?
            - self.store.confirmed_debit_sum(address)?
            - self.store.confirmed_fee_sum(address)?)
    }

    pub fn get_address_info(&self, address: &str, include_transactions: bool) -> Result<AddressInfo> {
        if !crypto::is_valid_address_shape(address) {
            return Err(NodeError::BadAddress(address.to_string()));
        }
        let _guard = self.lock.lock();

        let confirmed_received = self.store.confirmed_credit_sum(address)?;
        let confirmed_sent = self.store.confirmed_debit_sum(address)?;
        let confirmed_fee = self.store.confirmed_fee_sum(address)?;

        let since = (Utc::now() - Duration::seconds(constants::UNCONFIRMED_WINDOW_SECS)).timestamp_millis();
        let unconfirmed_received = self.store.unconfirmed_credit_sum_since(address, since)?;
        let unconfirmed_sent = self.store.unconfirmed_debit_sum_since(address, since)?;
        let unconfirmed_fee = self.store.unconfirmed_fee_sum_since(address, since)?;

        let (confirmed_transactions, unconfirmed_transactions) = if include_transactions {
            let conf_count = self.store.count_confirmed_txs()?;
            let unconf_count = self.store.count_unconfirmed_txs()?;
            let conf = self
                .store
                .get_confirmed_txs_range(0, conf_count, false)?
                .into_iter()
                .filter(|t| t.recipient_address == address || t.sender_address.as_deref() == Some(address))
                .collect();
            let unconf = self
                .store
                .get_unconfirmed_txs_range(0, unconf_count, false)?
                .into_iter()
                .filter(|t| t.recipient_address == address || t.sender_address.as_deref() == Some(address))
                .collect();
            (Some(conf), Some(unconf))
        } else {
            (None, None)
        };

        Ok(AddressInfo {
            confirmed_received,
            confirmed_sent,
            confirmed_fee,
            confirmed_balance: confirmed_received - confirmed_sent - confirmed_fee,
            unconfirmed_received,
            unconfirmed_sent,
            unconfirmed_fee,
            unconfirmed_balance: unconfirmed_received - unconfirmed_sent - unconfirmed_fee,
            confirmed_transactions,
            unconfirmed_transactions,
        })
    }

    pub fn get_total_supply(&self) -> Result<i64> {
        let _guard = self.lock.lock();
        self.store.total_supply()
    }

    /// Named volume windows, in the fixed order `constants::VOLUME_WINDOWS`
    /// declares them.
    pub fn get_volumes(&self) -> Result<Vec<(&'static str, i64)>> {
        let _guard = self.lock.lock();
        let now = Utc::now();
        let mut out = Vec::with_capacity(VOLUME_WINDOWS.len());
        for (name, unit, n) in VOLUME_WINDOWS {
            let since = trailing_since(now, *unit, *n);
            out.push((*name, self.store.volume_since(since)?));
        }
        Ok(out)
    }

    /// Cumulative confirmed no-sender volume since `now - i` for
    /// `i` in `0..buckets`.
    pub fn get_cumulative_volume(&self, unit: constants::VolumeUnit, buckets: usize) -> Result<Vec<i64>> {
        let _guard = self.lock.lock();
        let now = Utc::now();
        let mut out = Vec::with_capacity(buckets);
        for i in 0..buckets as i64 {
            let since = trailing_since(now, unit, i);
            out.push(self.store.volume_since(since)?);
        }
        Ok(out)
    }
}

fn trailing_since(now: chrono::DateTime<Utc>, unit: constants::VolumeUnit, n: i64) -> i64 {
    use constants::VolumeUnit;
    let since = match unit {
        VolumeUnit::Hours => now - Duration::hours(n),
        VolumeUnit::Days => now - Duration::days(n),
        VolumeUnit::Months => now
            .checked_sub_months(chrono::Months::new(n.max(0) as u32))
            .unwrap_or(now),
    };
    since.timestamp_millis()
}

fn parse_time(time: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RocksDbStore;

    fn engine_with_store() -> (Engine<RocksDbStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).unwrap();
        let policy = Policy::new(
            BigUint::from(1u8) << 200,
            constants::DEFAULT_REWARD_AMOUNT,
            constants::DEFAULT_MIN_FEE,
            constants::DEFAULT_MAX_SUPPLY,
        );
        (Engine::new(store, policy), dir)
    }

    fn mine_genesis(engine: &Engine<RocksDbStore>, credits: &[(String, i64)]) -> Block {
        let mut txs = Vec::new();
        for (addr, amount) in credits {
            let mut tx = Transaction::new_unsigned(addr.clone(), None, None, *amount, 0);
            tx.finalize_unsigned();
            txs.push(tx);
        }
        let mut block = Block::from_fields(
            VERSION.to_string(),
            0,
            crate::transaction::gen_random_id(),
            None,
            crate::transaction::now_iso(),
            txs,
            String::new(),
            engine.policy.difficulty(),
            0,
            String::new(),
            false,
        )
        .unwrap();
        let cancel = std::sync::atomic::AtomicBool::new(false);
        block.mine(10_000, &cancel).unwrap();
        block
    }

    #[test]
    fn scenario_genesis_admit() {
        let (engine, _dir) = engine_with_store();
        let (_, _, addr_a) = crypto::keygen();
        let (_, _, addr_b) = crypto::keygen();
        let block = mine_genesis(&engine, &[(addr_a, 500), (addr_b, 1500)]);
        engine.add_block(block, false).unwrap();
        assert_eq!(engine.get_total_supply().unwrap(), 2000);
        assert_eq!(engine.count_blocks().unwrap(), 1);
    }

    #[test]
    fn scenario_transfer_and_double_spend() {
        let (engine, _dir) = engine_with_store();
        let (sk_a, _, addr_a) = crypto::keygen();
        let (_, _, addr_b) = crypto::keygen();
        let (_, _, addr_c) = crypto::keygen();

        let genesis = mine_genesis(&engine, &[(addr_a.clone(), 10_000)]);
        engine.add_block(genesis, false).unwrap();

        let mut transfer = Transaction::new_unsigned(addr_b.clone(), Some(addr_a.clone()), Some(crypto::derive_pub(&sk_a).unwrap()), 1_000, 1_000);
        transfer.sign(&sk_a).unwrap();
        engine.add_unconfirmed_transaction(transfer.clone()).unwrap();

        let other_fees = transfer.fee;
        let mut reward = Transaction::new_unsigned(addr_c.clone(), None, None, engine.policy.reward_amount + other_fees, 0);
        reward.finalize_unsigned();

        let mut block1 = Block::from_fields(
            VERSION.to_string(),
            1,
            crate::transaction::gen_random_id(),
            Some(engine.get_block_at_height(0).unwrap().unwrap().hash),
            crate::transaction::now_iso(),
            vec![reward, transfer.clone()],
            String::new(),
            engine.policy.difficulty(),
            0,
            String::new(),
            false,
        )
        .unwrap();
        let cancel = std::sync::atomic::AtomicBool::new(false);
        block1.mine(10_000, &cancel).unwrap();
        engine.add_block(block1, false).unwrap();

        assert_eq!(engine.confirmed_balance(&addr_a).unwrap(), 8_000);
        assert_eq!(engine.confirmed_balance(&addr_b).unwrap(), 1_000);
        assert_eq!(
            engine.confirmed_balance(&addr_c).unwrap(),
            engine.policy.reward_amount + other_fees
        );

        // reusing the same transfer id is already confirmed
        let err = engine.add_unconfirmed_transaction(transfer).unwrap_err();
        assert!(matches!(err, NodeError::AlreadyConfirmed));
    }

    #[test]
    fn scenario_insufficient_funds_block_rejected() {
        let (engine, _dir) = engine_with_store();
        let (sk_a, pk_a, addr_a) = crypto::keygen();
        let (_, _, addr_b) = crypto::keygen();
        let (_, _, addr_c) = crypto::keygen();

        let genesis = mine_genesis(&engine, &[(addr_a.clone(), 10_000)]);
        engine.add_block(genesis, false).unwrap();

        let mut tx1 = Transaction::new_unsigned(addr_b.clone(), Some(addr_a.clone()), Some(pk_a.clone()), 6_000, 1_000);
        tx1.sign(&sk_a).unwrap();
        let mut tx2 = Transaction::new_unsigned(addr_b.clone(), Some(addr_a.clone()), Some(pk_a.clone()), 6_000, 1_000);
        tx2.sign(&sk_a).unwrap();

        let mut reward = Transaction::new_unsigned(addr_c, None, None, engine.policy.reward_amount + 2_000, 0);
        reward.finalize_unsigned();

        let mut block1 = Block::from_fields(
            VERSION.to_string(),
            1,
            crate::transaction::gen_random_id(),
            Some(engine.get_block_at_height(0).unwrap().unwrap().hash),
            crate::transaction::now_iso(),
            vec![reward, tx1, tx2],
            String::new(),
            engine.policy.difficulty(),
            0,
            String::new(),
            false,
        )
        .unwrap();
        let cancel = std::sync::atomic::AtomicBool::new(false);
        block1.mine(10_000, &cancel).unwrap();

        let err = engine.add_block(block1, false).unwrap_err();
        assert!(matches!(err, NodeError::InsufficientFunds));
    }

    #[test]
    fn scenario_pow_too_easy_rejected() {
        let (engine, _dir) = engine_with_store();
        let (_, _, addr_a) = crypto::keygen();
        let mut genesis = mine_genesis(&engine, &[(addr_a, 1)]);
        // corrupt the nonce so it no longer satisfies the PoW check
        genesis.nonce = 0;
        genesis.hash = genesis.calc_hash();

        let err = engine.add_block(genesis, false).unwrap_err();
        assert!(matches!(err, NodeError::BlockInvalid));
    }
}

// src/store.rs - narrow persistence interface the chain engine depends
// on, backed by RocksDB column families.
use crate::block::Block;
use crate::crypto;
use crate::error::{NodeError, Result};
use crate::transaction::Transaction;
use num_bigint::BigUint;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

const CF_BLOCKS_BY_ID: &str = "blocks_by_id";
const CF_BLOCKS_BY_HEIGHT: &str = "blocks_by_height";
const CF_TRANSACTIONS: &str = "transactions";
const CF_CONFIRMED_SEQ: &str = "confirmed_seq";
const CF_UNCONFIRMED_SEQ: &str = "unconfirmed_seq";
const CF_META: &str = "meta";

const KEY_NEXT_CONFIRMED_SEQ: &[u8] = b"next_confirmed_seq";
const KEY_NEXT_UNCONFIRMED_SEQ: &[u8] = b"next_unconfirmed_seq";

/// Typed queries the chain engine invokes on the store. All mutating
/// operations here are wrapped by the engine in a single serialised
/// critical section; the store itself enforces uniqueness on block
/// id, block height, and transaction id.
pub trait Store: Send + Sync {
    fn get_last_block(&self) -> Result<Option<Block>>;
    fn get_block_by_id(&self, id: &str) -> Result<Option<Block>>;
    fn get_block_at_height(&self, height: i64) -> Result<Option<Block>>;
    fn get_blocks_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Block>>;
    fn count_blocks(&self) -> Result<i64>;
    fn insert_block(&self, block: &Block, promote_ids: &[String], new_confirmed: &[Transaction]) -> Result<()>;

    fn get_confirmed_tx(&self, id: &str) -> Result<Option<Transaction>>;
    fn get_unconfirmed_tx(&self, id: &str) -> Result<Option<Transaction>>;
    fn get_confirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>>;
    fn count_confirmed_txs(&self) -> Result<i64>;
    fn get_unconfirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>>;
    fn count_unconfirmed_txs(&self) -> Result<i64>;

    fn confirmed_credit_sum(&self, address: &str) -> Result<i64>;
    fn confirmed_debit_sum(&self, address: &str) -> Result<i64>;
    fn confirmed_fee_sum(&self, address: &str) -> Result<i64>;

    fn unconfirmed_credit_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64>;
    fn unconfirmed_debit_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64>;
    fn unconfirmed_fee_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64>;

    fn exists_confirmed_tx(&self, id: &str) -> Result<bool>;
    fn exists_unconfirmed_tx(&self, id: &str) -> Result<bool>;
    fn ids_of_confirmed_txs_in(&self, ids: &[String]) -> Result<HashSet<String>>;

    fn insert_unconfirmed_tx(&self, tx: &Transaction) -> Result<()>;

    fn total_supply(&self) -> Result<i64>;
    fn volume_since(&self, since_epoch_millis: i64) -> Result<i64>;
}

#[derive(Serialize, Deserialize)]
struct BlockRecord {
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

impl From<&Block> for BlockRecord {
    fn from(b: &Block) -> Self {
        BlockRecord {
            version: b.version.clone(),
            height: b.height,
            id: b.id.clone(),
            prev_hash: b.prev_hash.clone(),
            time: b.time.clone(),
            transactions: b.transactions.clone(),
            merkle_root: b.merkle_root.clone(),
            difficulty: b.difficulty.to_string(),
            nonce: b.nonce,
            hash: b.hash.clone(),
        }
    }
}

impl TryFrom<BlockRecord> for Block {
    type Error = NodeError;

    fn try_from(r: BlockRecord) -> Result<Block> {
        let difficulty = BigUint::from_str(&r.difficulty)
            .map_err(|_| NodeError::BadTxFields("stored difficulty is not a valid integer".into()))?;
        Ok(Block {
            version: r.version,
            height: r.height,
            id: r.id,
            prev_hash: r.prev_hash,
            time: r.time,
            transactions: r.transactions,
            merkle_root: r.merkle_root,
            difficulty,
            nonce: r.nonce,
            hash: r.hash,
        })
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct TxRecord {
    confirmed: bool,
    block_id: Option<String>,
    tx: Transaction,
    /// Milliseconds since the epoch, parsed from `tx.time` at insert
    /// time so window queries don't re-parse on every read.
    parsed_time_millis: i64,
}

/// RocksDB-backed implementation of [`Store`].
pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS_BY_ID, Options::default()),
            ColumnFamilyDescriptor::new(CF_BLOCKS_BY_HEIGHT, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_CONFIRMED_SEQ, Options::default()),
            ColumnFamilyDescriptor::new(CF_UNCONFIRMED_SEQ, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)?;
        Ok(RocksDbStore { db })
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .unwrap_or_else(|| panic!("column family {name} must exist"))
    }

    fn next_seq(&self, meta_key: &[u8], seq_cf: &str, id: &str) -> Result<u64> {
        let meta_cf = self.cf(CF_META);
        let seq = match self.db.get_cf(meta_cf, meta_key)? {
            Some(bytes) => u64::from_be_bytes(bytes[..8].try_into().unwrap()),
            None => 0,
        };
        self.db
            .put_cf(self.cf(seq_cf), seq.to_be_bytes(), id.as_bytes())?;
        self.db
            .put_cf(meta_cf, meta_key, (seq + 1).to_be_bytes())?;
        Ok(seq)
    }

    fn read_tx_record(&self, id: &str) -> Result<Option<TxRecord>> {
        match self.db.get_cf(self.cf(CF_TRANSACTIONS), id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_tx_record(&self, id: &str, record: &TxRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.db.put_cf(self.cf(CF_TRANSACTIONS), id.as_bytes(), bytes)?;
        Ok(())
    }

    fn scan_tx_records(&self) -> Result<Vec<TxRecord>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_TRANSACTIONS), IteratorMode::Start) {
            let (_, value) = item?;
            out.push(serde_json::from_slice::<TxRecord>(&value)?);
        }
        Ok(out)
    }

    fn seq_range(&self, seq_cf: &str, offset: i64, limit: i64, reversed: bool) -> Result<Vec<String>> {
        let count = self.seq_count(seq_cf)?;
        if count == 0 || offset >= count {
            return Ok(Vec::new());
        }
        let end = (offset + limit).min(count);
        let mut ids = Vec::with_capacity((end - offset) as usize);
        for seq in offset..end {
            if let Some(bytes) = self.db.get_cf(self.cf(seq_cf), (seq as u64).to_be_bytes())? {
                ids.push(String::from_utf8_lossy(&bytes).to_string());
            }
        }
        if reversed {
            ids.reverse();
        }
        Ok(ids)
    }

    fn seq_count(&self, seq_cf: &str) -> Result<i64> {
        Ok(self.db.iterator_cf(self.cf(seq_cf), IteratorMode::Start).count() as i64)
    }
}

impl Store for RocksDbStore {
    fn get_last_block(&self) -> Result<Option<Block>> {
        let mut last: Option<Block> = None;
        for item in self.db.iterator_cf(self.cf(CF_BLOCKS_BY_HEIGHT), IteratorMode::End) {
            let (_, id_bytes) = item?;
            let id = String::from_utf8_lossy(&id_bytes).to_string();
            last = self.get_block_by_id(&id)?;
            break;
        }
        Ok(last)
    }

    fn get_block_by_id(&self, id: &str) -> Result<Option<Block>> {
        match self.db.get_cf(self.cf(CF_BLOCKS_BY_ID), id.as_bytes())? {
            Some(bytes) => {
                let record: BlockRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.try_into()?))
            }
            None => Ok(None),
        }
    }

    fn get_block_at_height(&self, height: i64) -> Result<Option<Block>> {
        match self
            .db
            .get_cf(self.cf(CF_BLOCKS_BY_HEIGHT), (height as u64).to_be_bytes())?
        {
            Some(id_bytes) => self.get_block_by_id(&String::from_utf8_lossy(&id_bytes)),
            None => Ok(None),
        }
    }

    fn get_blocks_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Block>> {
        let count = self.count_blocks()?;
        if offset >= count || offset < 0 {
            return Ok(Vec::new());
        }
        let end = (offset + limit).min(count);
        let mut heights: Vec<i64> = (offset..end).collect();
        if reversed {
            heights.reverse();
        }
        let mut out = Vec::with_capacity(heights.len());
        for h in heights {
            if let Some(b) = self.get_block_at_height(h)? {
                out.push(b);
            }
        }
        Ok(out)
    }

    fn count_blocks(&self) -> Result<i64> {
        Ok(self
            .db
            .iterator_cf(self.cf(CF_BLOCKS_BY_HEIGHT), IteratorMode::Start)
            .count() as i64)
    }

    fn insert_block(&self, block: &Block, promote_ids: &[String], new_confirmed: &[Transaction]) -> Result<()> {
        let record = BlockRecord::from(block);
        self.db
            .put_cf(self.cf(CF_BLOCKS_BY_ID), block.id.as_bytes(), serde_json::to_vec(&record)?)?;
        self.db.put_cf(
            self.cf(CF_BLOCKS_BY_HEIGHT),
            (block.height as u64).to_be_bytes(),
            block.id.as_bytes(),
        )?;

        for id in promote_ids {
            if let Some(mut rec) = self.read_tx_record(id)? {
                rec.confirmed = true;
                rec.block_id = Some(block.id.clone());
                self.write_tx_record(id, &rec)?;
                self.next_seq(KEY_NEXT_CONFIRMED_SEQ, CF_CONFIRMED_SEQ, id)?;
            }
        }

        for tx in new_confirmed {
            let parsed_time_millis = parse_time_millis(&tx.time);
            let rec = TxRecord {
                confirmed: true,
                block_id: Some(block.id.clone()),
                tx: tx.clone(),
                parsed_time_millis,
            };
            self.write_tx_record(&tx.id, &rec)?;
            self.next_seq(KEY_NEXT_CONFIRMED_SEQ, CF_CONFIRMED_SEQ, &tx.id)?;
        }

        Ok(())
    }

    fn get_confirmed_tx(&self, id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .read_tx_record(id)?
            .filter(|r| r.confirmed)
            .map(|r| r.tx))
    }

    fn get_unconfirmed_tx(&self, id: &str) -> Result<Option<Transaction>> {
        match self.read_tx_record(id)?.filter(|r| !r.confirmed) {
            Some(r) => {
                if !r.tx.verify() {
                    return Ok(None);
                }
                Ok(Some(r.tx))
            }
            None => Ok(None),
        }
    }

    fn get_confirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>> {
        let ids = self.seq_range(CF_CONFIRMED_SEQ, offset, limit, reversed)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = self.get_confirmed_tx(&id)? {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn count_confirmed_txs(&self) -> Result<i64> {
        self.seq_count(CF_CONFIRMED_SEQ)
    }

    fn get_unconfirmed_txs_range(&self, offset: i64, limit: i64, reversed: bool) -> Result<Vec<Transaction>> {
        let ids = self.seq_range(CF_UNCONFIRMED_SEQ, offset, limit, reversed)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // a row whose address shape no longer validates is skipped,
            // not an error for the whole range call.
            if let Some(rec) = self.read_tx_record(&id)? {
                let sender_ok = rec.tx.sender_address.as_deref().map(crypto::is_valid_address_shape).unwrap_or(true);
                let recipient_ok = crypto::is_valid_address_shape(&rec.tx.recipient_address);
                if !rec.tx.verify() {
                    log::warn!("skipping unconfirmed tx {id}: signature/hash verification failed");
                } else if !sender_ok || !recipient_ok {
                    log::warn!("skipping unconfirmed tx {id}: malformed address shape");
                } else {
                    out.push(rec.tx);
                }
            }
        }
        Ok(out)
    }

    fn count_unconfirmed_txs(&self) -> Result<i64> {
        self.seq_count(CF_UNCONFIRMED_SEQ)
    }

    fn confirmed_credit_sum(&self, address: &str) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| r.confirmed && r.tx.recipient_address == address)
            .map(|r| r.tx.amount)
            .sum())
    }

    fn confirmed_debit_sum(&self, address: &str) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| r.confirmed && r.tx.sender_address.as_deref() == Some(address))
            .map(|r| r.tx.amount)
            .sum())
    }

    fn confirmed_fee_sum(&self, address: &str) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| r.confirmed && r.tx.sender_address.as_deref() == Some(address))
            .map(|r| r.tx.fee)
            .sum())
    }

    fn unconfirmed_credit_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| {
                !r.confirmed
                    && r.tx.recipient_address == address
                    && r.parsed_time_millis >= since_epoch_millis
                    && r.tx.amount >= 0
                    && r.tx.fee >= 0
            })
            .map(|r| r.tx.amount)
            .sum())
    }

    fn unconfirmed_debit_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| {
                !r.confirmed
                    && r.tx.sender_address.as_deref() == Some(address)
                    && r.parsed_time_millis >= since_epoch_millis
                    && r.tx.amount >= 0
                    && r.tx.fee >= 0
            })
            .map(|r| r.tx.amount)
            .sum())
    }

    fn unconfirmed_fee_sum_since(&self, address: &str, since_epoch_millis: i64) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| {
                !r.confirmed
                    && r.tx.sender_address.as_deref() == Some(address)
                    && r.parsed_time_millis >= since_epoch_millis
                    && r.tx.amount >= 0
                    && r.tx.fee >= 0
            })
            .map(|r| r.tx.fee)
            .sum())
    }

    fn exists_confirmed_tx(&self, id: &str) -> Result<bool> {
        Ok(self.read_tx_record(id)?.map(|r| r.confirmed).unwrap_or(false))
    }

    fn exists_unconfirmed_tx(&self, id: &str) -> Result<bool> {
        Ok(self.read_tx_record(id)?.map(|r| !r.confirmed).unwrap_or(false))
    }

    fn ids_of_confirmed_txs_in(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for id in ids {
            if self.exists_confirmed_tx(id)? {
                out.insert(id.clone());
            }
        }
        Ok(out)
    }

    fn insert_unconfirmed_tx(&self, tx: &Transaction) -> Result<()> {
        let parsed_time_millis = parse_time_millis(&tx.time);
        let rec = TxRecord {
            confirmed: false,
            block_id: None,
            tx: tx.clone(),
            parsed_time_millis,
        };
        self.write_tx_record(&tx.id, &rec)?;
        self.next_seq(KEY_NEXT_UNCONFIRMED_SEQ, CF_UNCONFIRMED_SEQ, &tx.id)?;
        Ok(())
    }

    fn total_supply(&self) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| r.confirmed && r.tx.sender_address.is_none())
            .map(|r| r.tx.amount)
            .sum())
    }

    fn volume_since(&self, since_epoch_millis: i64) -> Result<i64> {
        Ok(self
            .scan_tx_records()?
            .iter()
            .filter(|r| r.confirmed && r.tx.sender_address.is_none() && r.parsed_time_millis >= since_epoch_millis)
            .map(|r| r.tx.amount)
            .sum())
    }
}

/// Parse the ISO-8601-without-timezone `time` field into epoch
/// milliseconds, assuming UTC. Unparseable input sorts as the epoch so
/// it never spuriously satisfies a "since" window.
fn parse_time_millis(time: &str) -> i64 {
    use chrono::NaiveDateTime;
    NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn temp_store() -> (RocksDbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn credit(addr: &str, amount: i64) -> Transaction {
        let mut tx = Transaction::new_unsigned(addr.to_string(), None, None, amount, 0);
        tx.finalize_unsigned();
        tx
    }

    #[test]
    fn insert_and_fetch_unconfirmed() {
        let (store, _dir) = temp_store();
        let (_, _, addr) = crypto::keygen();
        let tx = credit(&addr, 100);
        store.insert_unconfirmed_tx(&tx).unwrap();
        assert!(store.exists_unconfirmed_tx(&tx.id).unwrap());
        assert!(!store.exists_confirmed_tx(&tx.id).unwrap());
        assert_eq!(store.get_unconfirmed_tx(&tx.id).unwrap().unwrap().id, tx.id);
    }

    #[test]
    fn insert_block_promotes_matching_unconfirmed() {
        let (store, _dir) = temp_store();
        let (_, _, addr) = crypto::keygen();
        let tx = credit(&addr, 100);
        store.insert_unconfirmed_tx(&tx).unwrap();

        let block = crate::block::Block::from_fields(
            "1.0".into(),
            0,
            crate::transaction::gen_random_id(),
            None,
            crate::transaction::now_iso(),
            vec![tx.clone()],
            hex::encode(crate::merkle::merkle_root(&[hex::decode(&tx.hash).unwrap().try_into().unwrap()]).unwrap()),
            num_bigint::BigUint::from(1u8) << 200,
            0,
            String::new(),
            false,
        )
        .unwrap();
        let mut block = block;
        block.hash = block.calc_hash();

        store.insert_block(&block, &[tx.id.clone()], &[]).unwrap();

        assert!(store.exists_confirmed_tx(&tx.id).unwrap());
        assert_eq!(store.total_supply().unwrap(), 100);
        assert_eq!(store.count_blocks().unwrap(), 1);
        assert_eq!(store.get_last_block().unwrap().unwrap().id, block.id);
    }
}

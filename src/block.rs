// src/block.rs - header assembly, Merkle root, proof-of-work search & check
use crate::canonical::{render_array, render_object, Field};
use crate::constants::VERSION;
use crate::crypto;
use crate::error::{NodeError, Result};
use crate::merkle;
use crate::transaction::Transaction;
use num_bigint::BigUint;
use num_traits::Zero;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct Block {
    pub version: String,
    pub height: i64,
    pub id: String,
    pub prev_hash: Option<String>,
    pub time: String,
    pub transactions: Vec<Transaction>,
    pub merkle_root: String,
    pub difficulty: BigUint,
    pub nonce: u64,
    pub hash: String,
}

/// Length, in bytes, of the minimal big-endian representation of
/// `nonce`: `ceil(bit_length(nonce) / 8)`. Zero has zero length.
fn minimal_be_nonce(nonce: u64) -> Vec<u8> {
    if nonce == 0 {
        return Vec::new();
    }
    let bits = 64 - nonce.leading_zeros();
    let byte_len = ((bits + 7) / 8) as usize;
    nonce.to_be_bytes()[8 - byte_len..].to_vec()
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn from_fields(
        version: String,
        height: i64,
        id: String,
        prev_hash: Option<String>,
        time: String,
        transactions: Vec<Transaction>,
        merkle_root: String,
        difficulty: BigUint,
        nonce: u64,
        hash: String,
        strict: bool,
    ) -> Result<Self> {
        let block = Block {
            version,
            height,
            id,
            prev_hash,
            time,
            transactions,
            merkle_root,
            difficulty,
            nonce,
            hash,
        };

        if strict {
            if !block.verify_hash() {
                return Err(NodeError::WrongHash);
            }
            if !block.verify_merkle_root() {
                return Err(NodeError::WrongMerkleRoot);
            }
            if !block.verify_nonce() {
                return Err(NodeError::WrongNonce);
            }
        }

        Ok(block)
    }

    fn tx_values(&self) -> Vec<String> {
        self.transactions
            .iter()
            .map(|t| String::from_utf8(t.canonical_bytes(&[])).expect("canonical bytes are utf-8"))
            .collect()
    }

    fn fields<'a>(&'a self, without: &[&str], tx_rendered: &'a str) -> Vec<(&'static str, Field<'a>)> {
        let mut out = Vec::with_capacity(10);
        let mut push = |key: &'static str, value: Field<'a>| {
            if !without.contains(&key) {
                out.push((key, value));
            }
        };
        push("version", Field::Str(&self.version));
        push("height", Field::Int(self.height));
        push("id", Field::Str(&self.id));
        push("prev_hash", Field::OptStr(self.prev_hash.as_deref()));
        push("time", Field::Str(&self.time));
        push("transactions", Field::Raw(tx_rendered.to_string()));
        push("merkle_root", Field::Str(&self.merkle_root));
        push("difficulty", Field::BigUint(&self.difficulty));
        push("nonce", Field::Int(self.nonce as i64));
        push("hash", Field::Str(&self.hash));
        out
    }

    /// Canonical bytes of this block, omitting the named fields.
    pub fn canonical_bytes(&self, without: &[&str]) -> Vec<u8> {
        let tx_rendered = render_array(&self.tx_values());
        render_object(&self.fields(without, &tx_rendered)).into_bytes()
    }

    pub fn calc_merkle_root(&self) -> Result<String> {
        let mut leaves = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            let mut decoded = [0u8; 32];
            let bytes = hex::decode(&tx.hash)?;
            if bytes.len() != 32 {
                return Err(NodeError::WrongMerkleRoot);
            }
            decoded.copy_from_slice(&bytes);
            leaves.push(decoded);
        }
        match merkle::merkle_root(&leaves) {
            Some(root) => Ok(hex::encode(root)),
            None => Err(NodeError::WrongMerkleRoot),
        }
    }

    pub fn calc_hash(&self) -> String {
        crypto::sha256_hex(&self.canonical_bytes(&["hash"]))
    }

    fn header_without_nonce_and_hash(&self) -> Vec<u8> {
        self.canonical_bytes(&["nonce", "hash"])
    }

    /// Interpret `SHA256(header_without_nonce_and_hash || minimal_be(nonce))`
    /// as a big-endian unsigned integer and compare against `difficulty`.
    pub fn pow_digest_value(&self, nonce: u64) -> BigUint {
        let mut buf = self.header_without_nonce_and_hash();
        buf.extend(minimal_be_nonce(nonce));
        let digest = crypto::sha256(&buf);
        BigUint::from_bytes_be(&digest)
    }

    pub fn meets_difficulty(&self, nonce: u64) -> bool {
        self.pow_digest_value(nonce) < self.difficulty
    }

    pub fn verify_hash(&self) -> bool {
        self.hash == self.calc_hash()
    }

    pub fn verify_merkle_root(&self) -> bool {
        self.calc_merkle_root()
            .map(|root| root == self.merkle_root)
            .unwrap_or(false)
    }

    pub fn verify_nonce(&self) -> bool {
        self.meets_difficulty(self.nonce)
    }

    /// `hash`, `merkle_root`, and PoW all hold.
    pub fn verify(&self) -> bool {
        self.verify_hash() && self.verify_merkle_root() && self.verify_nonce()
    }

    /// Try nonces `[start, start + attempts)`. Returns the winning
    /// nonce if one satisfies the PoW check within the batch.
    pub fn mine_batch(&self, start: u64, attempts: u64) -> Option<u64> {
        for nonce in start..start.saturating_add(attempts) {
            if self.meets_difficulty(nonce) {
                return Some(nonce);
            }
        }
        None
    }

    /// Fills `merkle_root` if missing, searches for a winning nonce in
    /// batches of `batch_size`, checking `cancel` between batches, then
    /// fills `hash`. Returns `false` (no mutation of nonce/hash) if
    /// cancelled before a nonce is found.
    pub fn mine(&mut self, batch_size: u64, cancel: &AtomicBool) -> Result<bool> {
        if self.merkle_root.is_empty() {
            self.merkle_root = self.calc_merkle_root()?;
        }

        let mut start = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Ok(false);
            }
            if let Some(nonce) = self.mine_batch(start, batch_size) {
                self.nonce = nonce;
                self.hash = self.calc_hash();
                return Ok(true);
            }
            start += batch_size;
        }
    }

    /// `true` iff `difficulty` is a positive value no larger than 2^256 - 1.
    pub fn difficulty_in_range(difficulty: &BigUint) -> bool {
        !difficulty.is_zero() && difficulty.bits() <= 256
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    fn easy_difficulty() -> BigUint {
        // accept roughly 1 in 256 hashes, so tests mine quickly
        (BigUint::from(1u8) << 256) >> 8u32
    }

    fn genesis_tx(amount: i64) -> Transaction {
        let (_, _, addr) = crypto::keygen();
        let mut tx = Transaction::new_unsigned(addr, None, None, amount, 0);
        tx.finalize_unsigned();
        tx
    }

    fn unmined_block(height: i64, prev_hash: Option<String>, txs: Vec<Transaction>) -> Block {
        Block {
            version: VERSION.to_string(),
            height,
            id: crate::transaction::gen_random_id(),
            prev_hash,
            time: crate::transaction::now_iso(),
            transactions: txs,
            merkle_root: String::new(),
            difficulty: easy_difficulty(),
            nonce: 0,
            hash: String::new(),
        }
    }

    #[test]
    fn mine_then_verify_round_trips() {
        let mut block = unmined_block(0, None, vec![genesis_tx(500), genesis_tx(1500)]);
        let cancel = AtomicBool::new(false);
        assert!(block.mine(10_000, &cancel).unwrap());
        assert!(block.verify());
    }

    #[test]
    fn cancelling_mid_search_leaves_block_unmined() {
        let mut block = unmined_block(0, None, vec![genesis_tx(1)]);
        block.difficulty = BigUint::from(1u8); // effectively impossible
        let cancel = AtomicBool::new(true);
        assert!(!block.mine(10, &cancel).unwrap());
        assert!(block.hash.is_empty());
    }

    #[test]
    fn nonce_too_small_fails_pow_check() {
        let mut block = unmined_block(0, None, vec![genesis_tx(1)]);
        block.difficulty = BigUint::from(1u8); // nothing satisfies this
        let cancel = AtomicBool::new(false);
        block.merkle_root = block.calc_merkle_root().unwrap();
        block.nonce = 0;
        block.hash = block.calc_hash();
        let _ = &cancel;
        assert!(!block.verify_nonce());
    }

    #[test]
    fn minimal_be_nonce_lengths() {
        assert_eq!(minimal_be_nonce(0), Vec::<u8>::new());
        assert_eq!(minimal_be_nonce(255), vec![0xFF]);
        assert_eq!(minimal_be_nonce(256), vec![0x01, 0x00]);
    }

    #[test]
    fn tampered_merkle_root_is_detected() {
        let mut block = unmined_block(0, None, vec![genesis_tx(1), genesis_tx(2)]);
        let cancel = AtomicBool::new(false);
        block.mine(10_000, &cancel).unwrap();
        block.merkle_root = "0".repeat(64);
        assert!(!block.verify_merkle_root());
    }
}

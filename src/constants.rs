// src/constants.rs - protocol and policy constants
use num_bigint::BigUint;

/// Fixed version literal stamped on every transaction and block.
pub const VERSION: &str = "1.0";

/// Address string length: literal `J` + 64 lowercase hex digits.
pub const ADDRESS_LEN: usize = 65;

/// Nonce-search attempts per batch before the mining loop checks for
/// cancellation and yields back to the event loop.
pub const MINING_BATCH_SIZE: u64 = 100_000;

/// Coordinator request timeout / retry backoff for the sync loop.
pub const SYNC_RETRY_BACKOFF_SECS: u64 = 10;

/// Mining loop backoff after an ordinary failed/empty cycle.
pub const MINE_RETRY_BACKOFF_SECS: u64 = 5;

/// Mining loop backoff after the coordinator rejects a submitted block.
pub const MINE_REJECT_BACKOFF_SECS: u64 = 30;

/// Max unconfirmed transactions pulled per mining cycle.
pub const MINING_TX_BATCH: usize = 200;

/// Range query caps.
pub const MAX_BLOCKS_RANGE: u64 = 15_000;
pub const MAX_CONFIRMED_TX_RANGE: u64 = 15_000;
pub const MAX_UNCONFIRMED_TX_RANGE: u64 = 10_000;

/// Unconfirmed balance contributions only count transactions timestamped
/// within this trailing window.
pub const UNCONFIRMED_WINDOW_SECS: i64 = 24 * 3600;

/// Default policy, used to initialise a fresh chain / genesis bootstrap.
pub const DEFAULT_REWARD_AMOUNT: i64 = 1_000_000;
pub const DEFAULT_MIN_FEE: i64 = 1_000;
pub const DEFAULT_MAX_SUPPLY: i64 = 21_000_000 * 1_000_000;

#[derive(Clone, Copy, Debug)]
pub enum VolumeUnit {
    Hours,
    Days,
    Months,
}

/// Stats volume windows, in the exact order the API reports them.
/// `1d` intentionally duplicates `24h` and `1y` duplicates `12m`: both
/// are computed independently via the same trailing-duration formula.
pub const VOLUME_WINDOWS: &[(&str, VolumeUnit, i64)] = &[
    ("1h", VolumeUnit::Hours, 1),
    ("8h", VolumeUnit::Hours, 8),
    ("12h", VolumeUnit::Hours, 12),
    ("24h", VolumeUnit::Hours, 24),
    ("1d", VolumeUnit::Days, 1),
    ("2d", VolumeUnit::Days, 2),
    ("3d", VolumeUnit::Days, 3),
    ("5d", VolumeUnit::Days, 5),
    ("7d", VolumeUnit::Days, 7),
    ("10d", VolumeUnit::Days, 10),
    ("15d", VolumeUnit::Days, 15),
    ("30d", VolumeUnit::Days, 30),
    ("1m", VolumeUnit::Months, 1),
    ("2m", VolumeUnit::Months, 2),
    ("3m", VolumeUnit::Months, 3),
    ("6m", VolumeUnit::Months, 6),
    ("12m", VolumeUnit::Months, 12),
    ("1y", VolumeUnit::Months, 12),
    ("2y", VolumeUnit::Months, 24),
    ("3y", VolumeUnit::Months, 36),
];

pub const HOURLY_BUCKETS: usize = 24;
pub const DAILY_BUCKETS: usize = 32;
pub const MONTHLY_BUCKETS: usize = 36;

/// 256-bit maximum value, used to bound difficulty targets.
pub fn max_u256() -> BigUint {
    (BigUint::from(1u8) << 256) - BigUint::from(1u8)
}

//! Mining fund accounting.
//!
//! The fund is a consensus-tracked balance. Deposits (transactions carrying
//! the `OP_RETURN "fundmining"` marker) add to it. Once the `MiningFund`
//! upgrade is active, every coinbase draws a fixed subsidy from it until it
//! runs dry. Each connected block records a [`BlockFundDelta`] so the exact
//! pre-block balance can be restored when the block is disconnected.

pub mod classifier;
pub mod ledger;
pub mod reward;
pub mod store;

use std::fmt;

use ixd_consensus::{Amount, Hash256};
use ixd_primitives::encoding::{DecodeError, Decoder, Encoder};

pub use classifier::{classify, scan_block, BlockDeposits, FundingDeposit};
pub use ledger::FundLedger;
pub use reward::{compute_subsidy, validate_coinbase};
pub use store::{BlockDeltaStore, FundReplay};

/// Fund movement caused by one connected block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockFundDelta {
    pub height: i32,
    pub deposits_total: Amount,
    pub subsidy_paid: Amount,
    /// Fund balance after the block: `pre - subsidy_paid + deposits_total`.
    pub resulting_balance: Amount,
}

impl BlockFundDelta {
    pub const ENCODED_LEN: usize = 4 + 8 + 8 + 8;

    /// Balance before the block, recovered from the recorded movement.
    pub fn pre_balance(&self) -> Option<Amount> {
        self.resulting_balance
            .checked_add(self.subsidy_paid)?
            .checked_sub(self.deposits_total)
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut encoder = Encoder::with_capacity(Self::ENCODED_LEN);
        encoder.write_i32_le(self.height);
        encoder.write_i64_le(self.deposits_total);
        encoder.write_i64_le(self.subsidy_paid);
        encoder.write_i64_le(self.resulting_balance);
        let mut out = [0u8; Self::ENCODED_LEN];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            height: decoder.read_i32_le()?,
            deposits_total: decoder.read_i64_le()?,
            subsidy_paid: decoder.read_i64_le()?,
            resulting_balance: decoder.read_i64_le()?,
        })
    }
}

/// Rule violations raised while applying or undoing a block against the fund.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsensusError {
    /// Coinbase does not pay exactly the fund subsidy plus fees.
    BadCoinbaseAmount {
        height: i32,
        expected: Amount,
        actual: Amount,
    },
    /// Block does not extend the ledger tip.
    InvalidApplyOrder {
        expected_parent: Hash256,
        expected_height: i32,
        height: i32,
    },
    /// Undo requested for something other than the most recently applied block.
    InvalidUndoOrder { tip_height: i32, height: i32 },
    /// The fund would go below zero. Never produced by a valid chain.
    NegativeFundBalance { height: i32, balance: Amount },
    /// A fund or coinbase amount left the money range.
    ValueOutOfRange { height: i32 },
}

impl ConsensusError {
    /// Fatal errors mean local state can no longer be trusted and the node
    /// must stop processing blocks.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::NegativeFundBalance { .. })
    }

    /// The block itself is invalid and must be marked failed.
    pub fn is_block_invalid(&self) -> bool {
        matches!(
            self,
            ConsensusError::BadCoinbaseAmount { .. } | ConsensusError::ValueOutOfRange { .. }
        )
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::BadCoinbaseAmount {
                height,
                expected,
                actual,
            } => write!(
                f,
                "bad-cb-amount: coinbase at height {height} pays {actual}, expected {expected}"
            ),
            ConsensusError::InvalidApplyOrder {
                expected_height,
                height,
                ..
            } => write!(
                f,
                "block at height {height} does not extend fund ledger tip (expected height {expected_height})"
            ),
            ConsensusError::InvalidUndoOrder { tip_height, height } => write!(
                f,
                "undo of block at height {height} does not match fund ledger tip at height {tip_height}"
            ),
            ConsensusError::NegativeFundBalance { height, balance } => write!(
                f,
                "mining fund balance would become {balance} at height {height}"
            ),
            ConsensusError::ValueOutOfRange { height } => {
                write!(f, "mining fund amount out of range at height {height}")
            }
        }
    }
}

impl std::error::Error for ConsensusError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ixd_consensus::COIN;

    #[test]
    fn delta_layout_is_fixed() {
        let delta = BlockFundDelta {
            height: 0x0102_0304,
            deposits_total: 5 * COIN,
            subsidy_paid: COIN,
            resulting_balance: 14 * COIN,
        };
        let bytes = delta.encode();
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..12], &(5 * COIN).to_le_bytes());
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(BlockFundDelta::decode(&mut decoder).expect("decode"), delta);
        assert!(decoder.is_empty());
        assert_eq!(delta.pre_balance(), Some(10 * COIN));
    }

    #[test]
    fn pre_balance_overflow_is_none() {
        let delta = BlockFundDelta {
            height: 1,
            deposits_total: 0,
            subsidy_paid: i64::MAX,
            resulting_balance: 1,
        };
        assert_eq!(delta.pre_balance(), None);
    }

    #[test]
    fn only_negative_balance_is_fatal() {
        let fatal = ConsensusError::NegativeFundBalance {
            height: 3,
            balance: -1,
        };
        assert!(fatal.is_fatal());
        assert!(!fatal.is_block_invalid());
        let bad = ConsensusError::BadCoinbaseAmount {
            height: 3,
            expected: COIN,
            actual: 2 * COIN,
        };
        assert!(!bad.is_fatal());
        assert!(bad.is_block_invalid());
        assert!(bad.to_string().starts_with("bad-cb-amount"));
        let order = ConsensusError::InvalidUndoOrder {
            tip_height: 5,
            height: 4,
        };
        assert!(!order.is_fatal());
        assert!(!order.is_block_invalid());
    }
}

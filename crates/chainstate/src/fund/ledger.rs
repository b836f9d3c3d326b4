//! Fund balance at a chain tip and the transitions that move it.

use ixd_consensus::{money_range, Amount, ConsensusParams, Hash256};
use ixd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ixd_primitives::Block;

use super::classifier::scan_block;
use super::reward::{compute_subsidy, validate_coinbase};
use super::{BlockFundDelta, ConsensusError};

/// Fund state after the block `tip` at `height`. Values are immutable; a
/// transition returns the next ledger and leaves the current one untouched,
/// so callers can stage the result and publish it only once it is committed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FundLedger {
    tip: Hash256,
    height: i32,
    balance: Amount,
}

impl FundLedger {
    pub const ENCODED_LEN: usize = 32 + 4 + 8;

    /// State before the genesis block: height -1, initial balance.
    pub fn pre_genesis(params: &ConsensusParams) -> Self {
        Self {
            tip: [0u8; 32],
            height: -1,
            balance: params.mining_fund.initial_balance,
        }
    }

    pub fn new(tip: Hash256, height: i32, balance: Amount) -> Self {
        Self {
            tip,
            height,
            balance,
        }
    }

    pub fn tip(&self) -> &Hash256 {
        &self.tip
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn balance(&self) -> Amount {
        self.balance
    }

    /// Applies `block` (hash `hash`, at `height`) on top of this ledger.
    ///
    /// The subsidy is computed from the balance before the block, so
    /// deposits made in the block only become payable from the next one.
    /// Nothing is mutated on error.
    pub fn apply_block(
        &self,
        block: &Block,
        hash: &Hash256,
        height: i32,
        fees: Amount,
        params: &ConsensusParams,
    ) -> Result<(FundLedger, BlockFundDelta), ConsensusError> {
        if block.header.prev_block != self.tip || Some(height) != self.height.checked_add(1) {
            return Err(ConsensusError::InvalidApplyOrder {
                expected_parent: self.tip,
                expected_height: self.height.saturating_add(1),
                height,
            });
        }
        if self.balance < 0 {
            return Err(ConsensusError::NegativeFundBalance {
                height: self.height,
                balance: self.balance,
            });
        }

        let deposits_total = scan_block(block)
            .total()
            .ok_or(ConsensusError::ValueOutOfRange { height })?;
        let subsidy_paid = compute_subsidy(height, self.balance, params);
        validate_coinbase(block, height, subsidy_paid, fees)?;

        let resulting_balance = self
            .balance
            .checked_sub(subsidy_paid)
            .and_then(|value| value.checked_add(deposits_total))
            .ok_or(ConsensusError::ValueOutOfRange { height })?;
        if resulting_balance < 0 {
            return Err(ConsensusError::NegativeFundBalance {
                height,
                balance: resulting_balance,
            });
        }
        if !money_range(resulting_balance) {
            return Err(ConsensusError::ValueOutOfRange { height });
        }

        let delta = BlockFundDelta {
            height,
            deposits_total,
            subsidy_paid,
            resulting_balance,
        };
        let next = FundLedger {
            tip: *hash,
            height,
            balance: resulting_balance,
        };
        Ok((next, delta))
    }

    /// Reverts the most recently applied block `hash`, whose parent is
    /// `parent`, using the delta recorded when it was applied.
    pub fn undo_block(
        &self,
        hash: &Hash256,
        parent: &Hash256,
        delta: &BlockFundDelta,
    ) -> Result<FundLedger, ConsensusError> {
        if *hash != self.tip
            || delta.height != self.height
            || delta.resulting_balance != self.balance
        {
            return Err(ConsensusError::InvalidUndoOrder {
                tip_height: self.height,
                height: delta.height,
            });
        }
        let balance = delta
            .pre_balance()
            .ok_or(ConsensusError::ValueOutOfRange {
                height: delta.height,
            })?;
        if balance < 0 {
            return Err(ConsensusError::NegativeFundBalance {
                height: delta.height - 1,
                balance,
            });
        }
        Ok(FundLedger {
            tip: *parent,
            height: delta.height - 1,
            balance,
        })
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut encoder = Encoder::with_capacity(Self::ENCODED_LEN);
        encoder.write_hash_le(&self.tip);
        encoder.write_i32_le(self.height);
        encoder.write_i64_le(self.balance);
        let mut out = [0u8; Self::ENCODED_LEN];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tip = decoder.read_hash_le()?;
        let height = decoder.read_i32_le()?;
        let balance = decoder.read_i64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            tip,
            height,
            balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::classifier::mining_fund_script;
    use ixd_consensus::upgrades::NetworkUpgrade;
    use ixd_consensus::{consensus_params, Network, UpgradeIndex, COIN};
    use ixd_primitives::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};

    fn params(activation: i32, initial: Amount) -> ConsensusParams {
        let mut params = consensus_params(Network::Regtest);
        params.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height = activation;
        params.mining_fund.initial_balance = initial;
        params
    }

    fn block(prev: Hash256, height: i32, coinbase_value: Amount, deposits: &[Amount]) -> Block {
        let mut transactions = vec![Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x02, height as u8, 0x00],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: coinbase_value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }];
        for (idx, amount) in deposits.iter().enumerate() {
            transactions.push(Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint::new([idx as u8 + 1; 32], 0),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                }],
                vout: vec![TxOut {
                    value: *amount,
                    script_pubkey: mining_fund_script(),
                }],
                lock_time: 0,
            });
        }
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: height as u32,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn apply_then_undo_restores_state() {
        let params = params(0, 10 * COIN);
        let genesis = FundLedger::pre_genesis(&params);
        let b0 = block([0u8; 32], 0, 50 * COIN, &[]);
        let h0 = b0.header.hash();
        let (l0, d0) = genesis.apply_block(&b0, &h0, 0, 0, &params).expect("genesis");
        // Subsidy is drawn at genesis too when the upgrade is active from 0.
        assert_eq!(d0.subsidy_paid, COIN);
        assert_eq!(l0.balance(), 9 * COIN);

        let b1 = block(h0, 1, COIN, &[3 * COIN]);
        let h1 = b1.header.hash();
        let (l1, d1) = l0.apply_block(&b1, &h1, 1, 0, &params).expect("apply");
        assert_eq!(d1.deposits_total, 3 * COIN);
        assert_eq!(l1.balance(), 11 * COIN);

        assert_eq!(l1.undo_block(&h1, &h0, &d1).expect("undo"), l0);
        assert_eq!(l0.undo_block(&h0, &[0u8; 32], &d0).expect("undo"), genesis);
    }

    #[test]
    fn apply_must_extend_tip() {
        let params = params(0, 10 * COIN);
        let genesis = FundLedger::pre_genesis(&params);
        let orphan = block([7u8; 32], 0, 0, &[]);
        let err = genesis
            .apply_block(&orphan, &orphan.header.hash(), 0, 0, &params)
            .expect_err("orphan");
        assert!(matches!(err, ConsensusError::InvalidApplyOrder { .. }));

        let b0 = block([0u8; 32], 0, 0, &[]);
        let err = genesis
            .apply_block(&b0, &b0.header.hash(), 3, 0, &params)
            .expect_err("height gap");
        assert!(matches!(err, ConsensusError::InvalidApplyOrder { height: 3, .. }));
    }

    #[test]
    fn undo_out_of_order_is_rejected() {
        let params = params(NetworkUpgrade::NO_ACTIVATION_HEIGHT, 10 * COIN);
        let genesis = FundLedger::pre_genesis(&params);
        let b0 = block([0u8; 32], 0, 0, &[]);
        let h0 = b0.header.hash();
        let (l0, d0) = genesis.apply_block(&b0, &h0, 0, 0, &params).expect("apply");
        let b1 = block(h0, 1, 0, &[COIN]);
        let h1 = b1.header.hash();
        let (l1, _) = l0.apply_block(&b1, &h1, 1, 0, &params).expect("apply");

        // Undoing block 0 while block 1 is still applied.
        assert_eq!(
            l1.undo_block(&h0, &[0u8; 32], &d0),
            Err(ConsensusError::InvalidUndoOrder {
                tip_height: 1,
                height: 0,
            })
        );
    }

    #[test]
    fn bad_coinbase_leaves_ledger_untouched() {
        let params = params(0, 10 * COIN);
        let genesis = FundLedger::pre_genesis(&params);
        let b0 = block([0u8; 32], 0, 0, &[]);
        let h0 = b0.header.hash();
        let (l0, _) = genesis.apply_block(&b0, &h0, 0, 0, &params).expect("apply");
        let greedy = block(h0, 1, 2 * COIN, &[]);
        let err = l0
            .apply_block(&greedy, &greedy.header.hash(), 1, 0, &params)
            .expect_err("overpay");
        assert_eq!(
            err,
            ConsensusError::BadCoinbaseAmount {
                height: 1,
                expected: COIN,
                actual: 2 * COIN,
            }
        );
        assert_eq!(l0.balance(), 9 * COIN);
    }

    #[test]
    fn negative_pre_balance_is_fatal() {
        let params = params(0, 0);
        let corrupt = FundLedger::new([0u8; 32], -1, -5);
        let b0 = block([0u8; 32], 0, 0, &[]);
        let err = corrupt
            .apply_block(&b0, &b0.header.hash(), 0, 0, &params)
            .expect_err("negative");
        assert!(err.is_fatal());
    }

    #[test]
    fn encoding_is_fixed_width() {
        let ledger = FundLedger::new([4u8; 32], 12, 16 * COIN);
        let bytes = ledger.encode();
        assert_eq!(bytes.len(), FundLedger::ENCODED_LEN);
        assert_eq!(FundLedger::decode(&bytes).expect("decode"), ledger);
        assert!(FundLedger::decode(&bytes[..40]).is_err());
    }
}

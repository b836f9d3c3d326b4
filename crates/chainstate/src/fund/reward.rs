//! Coinbase payout rule.
//!
//! There is no minted block reward: the coinbase of every block after genesis
//! must pay exactly the mining fund subsidy plus the fees of the block.

use ixd_consensus::{mining_fund_subsidy, money_range, Amount, ConsensusParams};
use ixd_primitives::Block;

use super::ConsensusError;

/// Subsidy owed by the fund to the miner of the block at `height`.
pub fn compute_subsidy(height: i32, pre_balance: Amount, params: &ConsensusParams) -> Amount {
    mining_fund_subsidy(height, pre_balance, params)
}

/// Checks the coinbase of `block` against `subsidy + fees`. The genesis
/// coinbase is exempt.
pub fn validate_coinbase(
    block: &Block,
    height: i32,
    subsidy: Amount,
    fees: Amount,
) -> Result<(), ConsensusError> {
    if height == 0 {
        return Ok(());
    }

    let expected = subsidy
        .checked_add(fees)
        .filter(|value| money_range(*value))
        .ok_or(ConsensusError::ValueOutOfRange { height })?;

    let actual = match block.transactions.first().filter(|tx| tx.is_coinbase()) {
        Some(coinbase) => coinbase
            .value_out()
            .filter(|value| money_range(*value))
            .ok_or(ConsensusError::ValueOutOfRange { height })?,
        None => {
            return Err(ConsensusError::BadCoinbaseAmount {
                height,
                expected,
                actual: 0,
            })
        }
    };

    if actual != expected {
        return Err(ConsensusError::BadCoinbaseAmount {
            height,
            expected,
            actual,
        });
    }
    Ok(())
}

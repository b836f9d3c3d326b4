//! Mining fund payout rule.

use crate::money::Amount;
use crate::params::ConsensusParams;
use crate::upgrades::{network_upgrade_active, UpgradeIndex};

pub fn mining_fund_activation_height(params: &ConsensusParams) -> i32 {
    params.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height
}

pub fn mining_fund_active(height: i32, params: &ConsensusParams) -> bool {
    network_upgrade_active(height, &params.upgrades, UpgradeIndex::MiningFund)
}

/// Subsidy the fund owes the miner of the block at `height`, given the fund
/// balance before that block. Deposits made in the same block are not
/// counted; they become payable from the next block on.
pub fn mining_fund_subsidy(height: i32, pre_balance: Amount, params: &ConsensusParams) -> Amount {
    if !mining_fund_active(height, params) || pre_balance <= 0 {
        return 0;
    }
    params.mining_fund.subsidy_per_block.max(0).min(pre_balance)
}

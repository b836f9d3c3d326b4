//! Consensus constants, network parameters and the upgrade schedule.

pub mod constants;
pub mod fund;
pub mod money;
pub mod params;
pub mod upgrades;

pub use fund::{mining_fund_activation_height, mining_fund_active, mining_fund_subsidy};
pub use money::{money_range, Amount, COIN, MAX_MONEY};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams,
    ConsensusParams, GenesisParams, MiningFundParams, Network,
};
pub use upgrades::{Hash256, UpgradeIndex};

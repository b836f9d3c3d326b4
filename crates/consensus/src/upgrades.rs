//! Network upgrade schedule.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpgradeIndex {
    Base = 0,
    /// Miners start drawing a per-block subsidy from the mining fund.
    MiningFund = 1,
}

pub const MAX_NETWORK_UPGRADES: usize = 2;

pub const ALL_UPGRADES: [UpgradeIndex; MAX_NETWORK_UPGRADES] =
    [UpgradeIndex::Base, UpgradeIndex::MiningFund];

impl UpgradeIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            UpgradeIndex::Base => "Base",
            UpgradeIndex::MiningFund => "MiningFund",
        }
    }
}

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug)]
pub struct NetworkUpgrade {
    pub protocol_version: i32,
    pub activation_height: i32,
}

impl NetworkUpgrade {
    pub const ALWAYS_ACTIVE: i32 = 0;
    pub const NO_ACTIVATION_HEIGHT: i32 = -1;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Disabled,
    Pending,
    Active,
}

pub fn network_upgrade_state(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> UpgradeState {
    let activation_height = upgrades[idx.as_usize()].activation_height;
    if activation_height == NetworkUpgrade::NO_ACTIVATION_HEIGHT {
        UpgradeState::Disabled
    } else if height >= activation_height {
        UpgradeState::Active
    } else {
        UpgradeState::Pending
    }
}

pub fn network_upgrade_active(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> bool {
    network_upgrade_state(height, upgrades, idx) == UpgradeState::Active
}

pub fn is_activation_height(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> bool {
    if idx == UpgradeIndex::Base || height < 0 {
        return false;
    }
    height == upgrades[idx.as_usize()].activation_height
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn regtest_mining_fund_activation_edges() {
        let params = consensus_params(Network::Regtest);
        let height = params.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height;

        assert!(!network_upgrade_active(
            height - 1,
            &params.upgrades,
            UpgradeIndex::MiningFund
        ));
        assert!(network_upgrade_active(
            height,
            &params.upgrades,
            UpgradeIndex::MiningFund
        ));
        assert!(is_activation_height(
            height,
            &params.upgrades,
            UpgradeIndex::MiningFund
        ));
        assert!(network_upgrade_active(
            0,
            &params.upgrades,
            UpgradeIndex::Base
        ));
    }

    #[test]
    fn disabled_upgrade_never_activates() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            network_upgrade_state(i32::MAX, &params.upgrades, UpgradeIndex::MiningFund),
            UpgradeState::Disabled
        );
        assert!(!is_activation_height(
            -1,
            &params.upgrades,
            UpgradeIndex::MiningFund
        ));
    }
}

//! Consensus parameter definitions.

use std::fmt;

use crate::constants::COINBASE_MATURITY;
use crate::money::{Amount, COIN};
use crate::upgrades::{Hash256, NetworkUpgrade, MAX_NETWORK_UPGRADES};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mining fund economics. The activation height lives in the upgrade table
/// under `UpgradeIndex::MiningFund`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MiningFundParams {
    /// Fund balance that exists before the genesis block is applied.
    pub initial_balance: Amount,
    /// Most the fund pays to the miner of a single block.
    pub subsidy_per_block: Amount,
}

/// Inputs of the genesis block; the block itself is assembled by the chain state.
#[derive(Clone, Copy, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: Amount,
    pub timestamp: &'static str,
    pub output_pubkey: &'static str,
    pub merkle_root: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis: GenesisParams,
    pub coinbase_maturity: i32,
    pub pow_limit: Hash256,
    pub upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES],
    pub mining_fund: MiningFundParams,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    /// Subdirectory of the data dir used for non-main networks.
    pub data_subdir: Option<&'static str>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex must be 1-64 digits"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big endian) hash into internal byte order. Short
/// inputs are left-padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (idx, ch) in hex.bytes().rev().enumerate() {
        let nibble = (ch as char).to_digit(16).ok_or(HexError::InvalidHex)? as u8;
        bytes[idx / 2] |= if idx % 2 == 0 { nibble } else { nibble << 4 };
    }
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// Values below are fixed, known-good constants.
fn const_hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_consensus_params(),
            message_start: [0xf1, 0xba, 0xb6, 0xdb],
            default_port: 8_337,
            data_subdir: None,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_consensus_params(),
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18_333,
            data_subdir: Some("testnet3"),
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_consensus_params(),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18_444,
            data_subdir: Some("regtest"),
        },
    }
}

const GENESIS_TIMESTAMP: &str = "To see the farm is to leave it";
const GENESIS_OUTPUT_PUBKEY: &str = "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11984";
const GENESIS_MERKLE_ROOT: &str =
    "cb3ae7b867c97ceb834c5d131355cd4bc176a44360fede9ed6d47b897397ba3f";

fn genesis_params(time: u32, nonce: u32, bits: u32) -> GenesisParams {
    GenesisParams {
        version: 1,
        time,
        bits,
        nonce,
        reward: 50 * COIN,
        timestamp: GENESIS_TIMESTAMP,
        output_pubkey: GENESIS_OUTPUT_PUBKEY,
        merkle_root: const_hash(GENESIS_MERKLE_ROOT),
    }
}

fn upgrade_table(mining_fund_height: i32) -> [NetworkUpgrade; MAX_NETWORK_UPGRADES] {
    [
        NetworkUpgrade {
            protocol_version: 70_015,
            activation_height: NetworkUpgrade::ALWAYS_ACTIVE,
        },
        NetworkUpgrade {
            protocol_version: 70_016,
            activation_height: mining_fund_height,
        },
    ]
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: const_hash(
            "0000000001534ef8893b025b9c1da67250285e35c9f76cae36a4904fdf72c591",
        ),
        genesis: genesis_params(1_304_113_447, 2_245_271_137, 0x1d00_ffff),
        coinbase_maturity: COINBASE_MATURITY,
        pow_limit: const_hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        upgrades: upgrade_table(NetworkUpgrade::NO_ACTIVATION_HEIGHT),
        mining_fund: MiningFundParams {
            initial_balance: 0,
            subsidy_per_block: COIN,
        },
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: const_hash(
            "42f523ffac3a1969593cf16b40808303ef61d2e94762af43a28ac556bc95220e",
        ),
        genesis: genesis_params(1_296_688_602, 414_098_458, 0x1d00_ffff),
        coinbase_maturity: COINBASE_MATURITY,
        pow_limit: const_hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        upgrades: upgrade_table(1_000),
        mining_fund: MiningFundParams {
            initial_balance: 0,
            subsidy_per_block: COIN,
        },
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: const_hash(
            "1e2749a69baaf13a0421321e109c3873e4f90690bec49f80a6dae39fc0f35d26",
        ),
        genesis: genesis_params(1_296_688_602, 2, 0x207f_ffff),
        coinbase_maturity: COINBASE_MATURITY,
        pow_limit: const_hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        upgrades: upgrade_table(500),
        mining_fund: MiningFundParams {
            initial_balance: 10 * COIN,
            subsidy_per_block: COIN,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrades::UpgradeIndex;

    #[test]
    fn hash_hex_round_trip() {
        let hex = "0000000001534ef8893b025b9c1da67250285e35c9f76cae36a4904fdf72c591";
        let hash = hash256_from_hex(hex).expect("hex");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x91);
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn short_hex_is_left_padded() {
        let hash = hash256_from_hex("0x1ff").expect("hex");
        assert_eq!(hash[0], 0xff);
        assert_eq!(hash[1], 0x01);
        assert!(hash[2..].iter().all(|byte| *byte == 0));
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
        assert_eq!(
            hash256_from_hex(&"f".repeat(65)),
            Err(HexError::InvalidLength)
        );
    }

    #[test]
    fn mining_fund_schedule_per_network() {
        let main = consensus_params(Network::Mainnet);
        assert_eq!(
            main.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height,
            NetworkUpgrade::NO_ACTIVATION_HEIGHT
        );
        assert_eq!(main.mining_fund.initial_balance, 0);

        let regtest = consensus_params(Network::Regtest);
        assert_eq!(regtest.mining_fund.initial_balance, 10 * COIN);
        assert_eq!(regtest.mining_fund.subsidy_per_block, COIN);
        assert_eq!(
            regtest.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height,
            500
        );
    }

    #[test]
    fn network_names_parse_back() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            assert_eq!(Network::parse(network.as_str()), Some(network));
            assert_eq!(chain_params(network).consensus.network, network);
        }
        assert_eq!(Network::parse("signet"), None);
    }
}

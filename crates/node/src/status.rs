//! JSON views printed by the `status` and `verify-fund` commands.

use ixd_chainstate::state::{ChainState, ChainStatus};
use ixd_consensus::money::format_amount;
use ixd_consensus::{hash256_to_hex, Amount};
use ixd_storage::KeyValueStore;
use serde::Serialize;

/// Mirrors the chain fields of `getblockchaininfo`, including the mining fund.
#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    pub chain: &'static str,
    pub blocks: i32,
    pub headers: i32,
    pub bestblockhash: String,
    pub chainwork: String,
    /// Fund balance in coins as an exact decimal.
    pub miningfund: String,
    pub miningfund_zat: Amount,
    pub miningfund_activation_height: i32,
    pub halted: bool,
}

impl StatusReport {
    pub(crate) fn from_status(status: &ChainStatus) -> Self {
        let (bestblockhash, chainwork) = match &status.best_block {
            Some(tip) => (hash256_to_hex(&tip.hash), chainwork_hex(&tip.chainwork)),
            None => (hash256_to_hex(&[0u8; 32]), chainwork_hex(&[0u8; 32])),
        };
        Self {
            chain: status.network.as_str(),
            blocks: status.blocks(),
            headers: status.headers(),
            bestblockhash,
            chainwork,
            miningfund: format_amount(status.mining_fund),
            miningfund_zat: status.mining_fund,
            miningfund_activation_height: status.mining_fund_activation_height,
            halted: status.halted,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct FundVerification {
    pub ok: bool,
    pub height: i32,
    pub blocks: u64,
    pub miningfund: String,
    pub miningfund_zat: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn verify_fund<S: KeyValueStore>(chainstate: &ChainState<S>) -> FundVerification {
    let ledger = chainstate.fund_ledger();
    match chainstate.verify_fund_replay() {
        Ok(replay) => FundVerification {
            ok: true,
            height: replay.ledger.height(),
            blocks: replay.blocks,
            miningfund: format_amount(replay.ledger.balance()),
            miningfund_zat: replay.ledger.balance(),
            error: None,
        },
        Err(err) => FundVerification {
            ok: false,
            height: ledger.height(),
            blocks: 0,
            miningfund: format_amount(ledger.balance()),
            miningfund_zat: ledger.balance(),
            error: Some(err.to_string()),
        },
    }
}

/// Chainwork is stored big endian, so it prints in byte order.
fn chainwork_hex(chainwork: &[u8; 32]) -> String {
    let mut reversed = *chainwork;
    reversed.reverse();
    hash256_to_hex(&reversed)
}

#![allow(dead_code)]

use std::sync::Arc;

use ixd_chainstate::fund::classifier::mining_fund_script;
use ixd_chainstate::genesis::genesis_block;
use ixd_chainstate::state::ChainState;
use ixd_chainstate::validation::ValidationFlags;
use ixd_consensus::upgrades::UpgradeIndex;
use ixd_consensus::{chain_params, Amount, ChainParams, Hash256, Network};
use ixd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use ixd_storage::memory::MemoryStore;
use ixd_storage::KeyValueStore;

pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Regtest parameters with a one-block coinbase maturity so the genesis
/// output can fund deposits right away.
pub fn regtest_params(initial_balance: Amount, activation_height: i32) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.consensus.coinbase_maturity = 1;
    params.consensus.mining_fund.initial_balance = initial_balance;
    params.consensus.upgrades[UpgradeIndex::MiningFund.as_usize()].activation_height =
        activation_height;
    params
}

/// Regtest targets are trivially met; the tests check everything else.
pub fn flags() -> ValidationFlags {
    ValidationFlags {
        check_pow: false,
        check_merkle_root: true,
    }
}

pub fn open_state<S: KeyValueStore>(store: Arc<S>, params: &ChainParams) -> ChainState<S> {
    let state = ChainState::new(store, params.clone()).expect("chainstate");
    state.ensure_genesis().expect("genesis");
    state
}

pub fn memory_state(params: &ChainParams) -> (Arc<MemoryStore>, ChainState<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = open_state(Arc::clone(&store), params);
    (store, state)
}

pub fn genesis_hash<S: KeyValueStore>(state: &ChainState<S>) -> Hash256 {
    state.height_hash(0).expect("height index").expect("genesis")
}

pub fn genesis_output(params: &ChainParams) -> OutPoint {
    let genesis = genesis_block(&params.consensus).expect("genesis block");
    OutPoint::new(genesis.transactions[0].txid(), 0)
}

pub fn coinbase(height: i32, tag: u8, value: Amount) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![payout(value)],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, vout: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout,
        lock_time: 0,
    }
}

pub fn deposit(value: Amount) -> TxOut {
    TxOut {
        value,
        script_pubkey: mining_fund_script(),
    }
}

pub fn payout(value: Amount) -> TxOut {
    TxOut {
        value,
        script_pubkey: vec![0x51],
    }
}

pub fn make_block(prev: Hash256, height: i32, tag: u8, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_296_688_602 + height as u32,
            bits: REGTEST_BITS,
            nonce: u32::from(tag),
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block
}

/// Block holding only a coinbase that claims `coinbase_value`.
pub fn coinbase_block(prev: Hash256, height: i32, tag: u8, coinbase_value: Amount) -> Block {
    make_block(prev, height, tag, vec![coinbase(height, tag, coinbase_value)])
}

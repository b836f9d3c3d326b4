//! Context-free block and transaction checks run before a block touches the
//! UTXO set or the mining fund.

use std::collections::HashSet;

use ixd_consensus::constants::{
    MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_SIZE, MIN_BLOCK_VERSION, MIN_COINBASE_SCRIPT_SIZE,
};
use ixd_consensus::{money_range, ConsensusParams, Hash256};
use ixd_primitives::{merkle_root, Block, OutPoint, Transaction};

use crate::work::{check_proof_of_work, PowError};

#[derive(Clone, Debug, Default)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_merkle_root: bool,
}

impl ValidationFlags {
    /// Every check enabled; what the node uses for blocks from the network.
    pub fn full() -> Self {
        Self {
            check_pow: true,
            check_merkle_root: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidHeader(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    DuplicateInput,
    DuplicateTransaction,
    MerkleMismatch,
    Pow(PowError),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidHeader(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::Pow(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

/// Validates `block` in isolation and returns its txids in block order.
pub fn validate_block(
    block: &Block,
    params: &ConsensusParams,
    flags: &ValidationFlags,
) -> Result<Vec<Hash256>, ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    if block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::InvalidBlock("block size too large"));
    }
    validate_header(block, params, flags)?;

    let txids = block.txids();
    if flags.check_merkle_root {
        validate_merkle_root(block, &txids)?;
    }

    let mut seen_txids = HashSet::with_capacity(txids.len());
    let mut spent = HashSet::new();
    for (index, (tx, txid)) in block.transactions.iter().zip(&txids).enumerate() {
        validate_transaction(tx, index == 0)?;
        if !seen_txids.insert(*txid) {
            return Err(ValidationError::DuplicateTransaction);
        }
        if index > 0 {
            for input in &tx.vin {
                if !spent.insert(input.prevout.clone()) {
                    return Err(ValidationError::DuplicateInput);
                }
            }
        }
    }
    Ok(txids)
}

fn validate_header(
    block: &Block,
    params: &ConsensusParams,
    flags: &ValidationFlags,
) -> Result<(), ValidationError> {
    if block.header.version < MIN_BLOCK_VERSION {
        return Err(ValidationError::InvalidHeader("block version too low"));
    }
    check_proof_of_work(
        &block.header.hash(),
        block.header.bits,
        &params.pow_limit,
        flags.check_pow,
    )?;
    Ok(())
}

fn validate_merkle_root(block: &Block, txids: &[Hash256]) -> Result<(), ValidationError> {
    let (root, mutated) = merkle_root(txids);
    if mutated {
        return Err(ValidationError::DuplicateTransaction);
    }
    if root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }
    Ok(())
}

fn validate_transaction(tx: &Transaction, is_coinbase: bool) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::InvalidTransaction(
            "transaction must have inputs",
        ));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction(
            "transaction must have outputs",
        ));
    }

    if is_coinbase {
        if !tx.is_coinbase() {
            return Err(ValidationError::InvalidTransaction(
                "coinbase must have exactly one null input",
            ));
        }
        let script_len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&script_len) {
            return Err(ValidationError::InvalidTransaction(
                "coinbase scriptSig length out of range",
            ));
        }
    } else if tx.vin.iter().any(|input| input.prevout == OutPoint::null()) {
        return Err(ValidationError::InvalidTransaction(
            "non-coinbase cannot contain null prevout",
        ));
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(ValidationError::DuplicateInput);
        }
    }

    let mut value_out = 0i64;
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        value_out = value_out
            .checked_add(output.value)
            .filter(|total| money_range(*total))
            .ok_or(ValidationError::ValueOutOfRange)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixd_consensus::{consensus_params, Network, MAX_MONEY};
    use ixd_primitives::{BlockHeader, TxIn, TxOut};

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block
    }

    fn flags() -> ValidationFlags {
        ValidationFlags {
            check_pow: false,
            check_merkle_root: true,
        }
    }

    #[test]
    fn accepts_well_formed_block() {
        let params = consensus_params(Network::Regtest);
        let block = block(vec![coinbase(), spend(OutPoint::new([1u8; 32], 0), 5)]);
        let txids = validate_block(&block, &params, &flags()).expect("valid");
        assert_eq!(txids.len(), 2);
    }

    #[test]
    fn first_transaction_must_be_coinbase() {
        let params = consensus_params(Network::Regtest);
        let block = block(vec![spend(OutPoint::new([1u8; 32], 0), 5)]);
        assert!(matches!(
            validate_block(&block, &params, &flags()),
            Err(ValidationError::InvalidTransaction(_))
        ));
        let block = block_with_two_coinbases();
        assert!(matches!(
            validate_block(&block, &params, &flags()),
            Err(ValidationError::InvalidTransaction(_))
        ));
    }

    fn block_with_two_coinbases() -> Block {
        let mut second = coinbase();
        second.vin[0].script_sig = vec![0x01, 0x02];
        block(vec![coinbase(), second])
    }

    #[test]
    fn rejects_double_spend_inside_block() {
        let params = consensus_params(Network::Regtest);
        let outpoint = OutPoint::new([1u8; 32], 0);
        let block = block(vec![
            coinbase(),
            spend(outpoint.clone(), 5),
            spend(outpoint, 6),
        ]);
        assert_eq!(
            validate_block(&block, &params, &flags()),
            Err(ValidationError::DuplicateInput)
        );
    }

    #[test]
    fn rejects_out_of_range_outputs() {
        let params = consensus_params(Network::Regtest);
        let block = block(vec![coinbase(), spend(OutPoint::new([1u8; 32], 0), MAX_MONEY + 1)]);
        assert_eq!(
            validate_block(&block, &params, &flags()),
            Err(ValidationError::ValueOutOfRange)
        );
    }

    #[test]
    fn merkle_root_must_match_when_checked() {
        let params = consensus_params(Network::Regtest);
        let mut block = block(vec![coinbase()]);
        block.header.merkle_root = [9u8; 32];
        assert_eq!(
            validate_block(&block, &params, &flags()),
            Err(ValidationError::MerkleMismatch)
        );
        assert!(validate_block(&block, &params, &ValidationFlags::default()).is_ok());
    }
}

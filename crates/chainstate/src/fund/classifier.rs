//! Recognizes mining fund deposits.
//!
//! A deposit is a non-coinbase transaction with exactly one output whose
//! script is `OP_RETURN <"fundmining">` and whose value is in `(0, MAX_MONEY]`.
//! Any other shape (no marker, several markers, zero or out-of-range value)
//! is an ordinary transaction. Classification is a pure function of the
//! transaction bytes and never fails.

use ixd_consensus::constants::MINING_FUND_MARKER;
use ixd_consensus::{money_range, Amount, Hash256};
use ixd_primitives::{Block, Transaction, TxOut};
use rayon::prelude::*;

const OP_RETURN: u8 = 0x6a;

/// Blocks with fewer transactions are scanned on the calling thread.
const PARALLEL_SCAN_MIN_TXS: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FundingDeposit {
    pub amount: Amount,
    pub source_txid: Hash256,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockDeposits {
    /// Deposits in block order.
    pub deposits: Vec<FundingDeposit>,
}

impl BlockDeposits {
    /// Sum of all deposits, or `None` if it overflows or leaves the money range.
    pub fn total(&self) -> Option<Amount> {
        self.deposits
            .iter()
            .try_fold(0 as Amount, |total, deposit| total.checked_add(deposit.amount))
            .filter(|total| money_range(*total))
    }
}

/// Locking script of a deposit output.
pub fn mining_fund_script() -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + MINING_FUND_MARKER.len());
    script.push(OP_RETURN);
    script.push(MINING_FUND_MARKER.len() as u8);
    script.extend_from_slice(MINING_FUND_MARKER);
    script
}

pub fn is_mining_fund_script(script_pubkey: &[u8]) -> bool {
    match script_pubkey {
        [OP_RETURN, len, marker @ ..] => {
            *len as usize == MINING_FUND_MARKER.len() && marker == MINING_FUND_MARKER
        }
        _ => false,
    }
}

/// The single marker output of `tx`, if it has exactly one.
pub fn funding_output(tx: &Transaction) -> Option<&TxOut> {
    let mut markers = tx
        .vout
        .iter()
        .filter(|out| is_mining_fund_script(&out.script_pubkey));
    let first = markers.next()?;
    match markers.next() {
        Some(_) => None,
        None => Some(first),
    }
}

pub fn classify(tx: &Transaction) -> Option<FundingDeposit> {
    if tx.is_coinbase() {
        return None;
    }
    let output = funding_output(tx)?;
    if output.value <= 0 || !money_range(output.value) {
        return None;
    }
    Some(FundingDeposit {
        amount: output.value,
        source_txid: tx.txid(),
    })
}

/// Classifies every transaction of `block`, coinbase excluded.
pub fn scan_block(block: &Block) -> BlockDeposits {
    let deposits = if block.transactions.len() >= PARALLEL_SCAN_MIN_TXS {
        block.transactions.par_iter().filter_map(classify).collect()
    } else {
        block.transactions.iter().filter_map(classify).collect()
    };
    BlockDeposits { deposits }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixd_consensus::{COIN, MAX_MONEY};
    use ixd_primitives::{BlockHeader, OutPoint, TxIn};

    fn spend(tag: u8, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([tag; 32], 0),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    fn marker(value: Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: mining_fund_script(),
        }
    }

    fn payment(value: Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: vec![0x76, 0xa9, 0x14],
        }
    }

    fn coinbase(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: u32::MAX,
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    #[test]
    fn marker_script_shape() {
        let script = mining_fund_script();
        assert_eq!(script.len(), 12);
        assert_eq!(&script[..2], &[0x6a, 0x0a]);
        assert!(is_mining_fund_script(&script));
        assert!(!is_mining_fund_script(&[0x6a, 0x0a]));
        assert!(!is_mining_fund_script(b"\x6a\x0afundminin"));
        let mut longer = script.clone();
        longer.push(0x00);
        assert!(!is_mining_fund_script(&longer));
    }

    #[test]
    fn single_marker_is_deposit() {
        let tx = spend(1, vec![payment(COIN), marker(5 * COIN)]);
        let deposit = classify(&tx).expect("deposit");
        assert_eq!(deposit.amount, 5 * COIN);
        assert_eq!(deposit.source_txid, tx.txid());
    }

    #[test]
    fn ambiguous_or_empty_markers_are_ordinary() {
        assert_eq!(classify(&spend(1, vec![payment(COIN)])), None);
        assert_eq!(classify(&spend(1, vec![marker(COIN), marker(COIN)])), None);
        assert_eq!(classify(&spend(1, vec![marker(0)])), None);
        assert_eq!(classify(&spend(1, vec![marker(-1)])), None);
        assert_eq!(classify(&spend(1, vec![marker(MAX_MONEY + 1)])), None);
        assert!(classify(&spend(1, vec![marker(MAX_MONEY)])).is_some());
    }

    #[test]
    fn coinbase_is_never_a_deposit() {
        assert_eq!(classify(&coinbase(vec![marker(COIN)])), None);
    }

    #[test]
    fn scan_keeps_block_order() {
        let mut transactions = vec![coinbase(vec![payment(COIN)])];
        for tag in 0..100u8 {
            let outputs = if tag % 10 == 0 {
                vec![marker(i64::from(tag) + 1)]
            } else {
                vec![payment(COIN)]
            };
            transactions.push(spend(tag, outputs));
        }
        let block = Block {
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

        let scanned = scan_block(&block);
        let amounts: Vec<Amount> = scanned.deposits.iter().map(|d| d.amount).collect();
        assert_eq!(amounts, vec![1, 11, 21, 31, 41, 51, 61, 71, 81, 91]);
        assert_eq!(scanned.total(), Some(460));
    }

    #[test]
    fn total_outside_money_range_is_none() {
        let deposits = BlockDeposits {
            deposits: vec![
                FundingDeposit {
                    amount: MAX_MONEY,
                    source_txid: [1u8; 32],
                },
                FundingDeposit {
                    amount: 1,
                    source_txid: [2u8; 32],
                },
            ],
        };
        assert_eq!(deposits.total(), None);
    }
}

//! Assembles the genesis block from network parameters.

use ixd_consensus::ConsensusParams;
use ixd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

use crate::validation::ValidationError;

const OP_CHECKSIG: u8 = 0xac;
/// `nBits` value pushed at the start of every genesis coinbase script.
const GENESIS_SCRIPT_BITS: u32 = 0x1d00_ffff;

pub fn genesis_block(params: &ConsensusParams) -> Result<Block, ValidationError> {
    let genesis = &params.genesis;

    let mut script_sig = Vec::with_capacity(8 + genesis.timestamp.len());
    script_sig.push(4);
    script_sig.extend_from_slice(&GENESIS_SCRIPT_BITS.to_le_bytes());
    script_sig.extend_from_slice(&[0x01, 0x04]);
    push_data(&mut script_sig, genesis.timestamp.as_bytes())?;

    let pubkey = decode_hex(genesis.output_pubkey).ok_or(ValidationError::InvalidBlock(
        "invalid genesis output key",
    ))?;
    let mut script_pubkey = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script_pubkey, &pubkey)?;
    script_pubkey.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: genesis.reward,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let mut block = Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    Ok(block)
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) -> Result<(), ValidationError> {
    // Direct pushes only; genesis data is always shorter than OP_PUSHDATA1.
    let len = u8::try_from(data.len())
        .ok()
        .filter(|len| *len < 0x4c)
        .ok_or(ValidationError::InvalidBlock("genesis push too large"))?;
    script.push(len);
    script.extend_from_slice(data);
    Ok(())
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    input
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixd_consensus::{consensus_params, Network};

    #[test]
    fn genesis_hash_matches_params() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = consensus_params(network);
            let block = genesis_block(&params).expect("genesis");
            assert_eq!(
                block.header.merkle_root, params.genesis.merkle_root,
                "{network} merkle root"
            );
            assert_eq!(
                block.header.hash(),
                params.hash_genesis_block,
                "{network} genesis hash"
            );
        }
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}

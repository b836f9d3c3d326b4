//! Per-block undo data: the outputs a block spent, in spend order.

use ixd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ixd_primitives::OutPoint;

use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;
const MIN_SPENT_OUTPUT_SIZE: usize = 36 + 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.spent.len() as u64);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&spent.entry.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let spent_len = decoder.read_count(MIN_SPENT_OUTPUT_SIZE)?;
        let mut spent = Vec::with_capacity(spent_len);
        for _ in 0..spent_len {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry_bytes = decoder.read_var_bytes()?;
            let entry = UtxoEntry::decode(&entry_bytes)
                .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
            spent.push(SpentOutput { outpoint, entry });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = BlockUndo::default().encode();
        assert_eq!(bytes, vec![BLOCK_UNDO_VERSION, 0]);
        bytes[0] = 9;
        assert!(matches!(
            BlockUndo::decode(&bytes),
            Err(DecodeError::InvalidData(_))
        ));
    }

    #[test]
    fn keeps_spend_order() {
        let undo = BlockUndo {
            spent: (0..3u32)
                .map(|index| SpentOutput {
                    outpoint: OutPoint::new([index as u8; 32], index),
                    entry: UtxoEntry {
                        value: i64::from(index) * 100,
                        script_pubkey: vec![0x51],
                        height: 4,
                        is_coinbase: index == 0,
                    },
                })
                .collect(),
        };
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
    }
}

//! Per-block index entry: storage status, transaction count and the mining
//! fund delta recorded when the block was connected.

use ixd_primitives::encoding::{Decoder, Encoder};

use crate::fund::BlockFundDelta;

pub const STATUS_HAVE_DATA: u32 = 1 << 0;
pub const STATUS_HAVE_UNDO: u32 = 1 << 1;
/// The recorded fund delta is currently applied to the active chain.
pub const STATUS_FUND_APPLIED: u32 = 1 << 2;

const BLOCK_INDEX_V1_LEN: usize = 8;
const BLOCK_INDEX_V2_LEN: usize = BLOCK_INDEX_V1_LEN + BlockFundDelta::ENCODED_LEN;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub tx_count: u32,
    pub status: u32,
    /// Left in place after the block is disconnected for inspection; only
    /// counts towards the fund while `STATUS_FUND_APPLIED` is set.
    pub fund: Option<BlockFundDelta>,
}

impl BlockIndexEntry {
    pub fn has_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }

    pub fn has_undo(&self) -> bool {
        self.status & STATUS_HAVE_UNDO != 0
    }

    pub fn applied_fund(&self) -> Option<BlockFundDelta> {
        if self.status & STATUS_FUND_APPLIED != 0 {
            self.fund
        } else {
            None
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = if self.fund.is_some() {
            BLOCK_INDEX_V2_LEN
        } else {
            BLOCK_INDEX_V1_LEN
        };
        let mut encoder = Encoder::with_capacity(len);
        encoder.write_u32_le(self.tx_count);
        encoder.write_u32_le(self.status);
        if let Some(fund) = &self.fund {
            encoder.write_bytes(&fund.encode());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != BLOCK_INDEX_V1_LEN && bytes.len() != BLOCK_INDEX_V2_LEN {
            return Err(format!("invalid block index entry length {}", bytes.len()));
        }
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let status = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let fund = if decoder.is_empty() {
            None
        } else {
            Some(BlockFundDelta::decode(&mut decoder).map_err(|err| err.to_string())?)
        };
        let entry = Self {
            tx_count,
            status,
            fund,
        };
        if entry.status & STATUS_FUND_APPLIED != 0 && entry.fund.is_none() {
            return Err("fund applied flag set without a fund delta".to_string());
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_entry_has_no_fund() {
        let entry = BlockIndexEntry {
            tx_count: 3,
            status: STATUS_HAVE_DATA,
            fund: None,
        };
        let bytes = entry.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(BlockIndexEntry::decode(&bytes).expect("decode"), entry);
        assert!(entry.has_data());
        assert!(!entry.has_undo());
    }

    #[test]
    fn undone_delta_is_retained_but_not_applied() {
        let delta = BlockFundDelta {
            height: 7,
            deposits_total: 0,
            subsidy_paid: 1,
            resulting_balance: 4,
        };
        let mut entry = BlockIndexEntry {
            tx_count: 1,
            status: STATUS_HAVE_DATA | STATUS_HAVE_UNDO | STATUS_FUND_APPLIED,
            fund: Some(delta),
        };
        assert_eq!(entry.applied_fund(), Some(delta));
        assert_eq!(entry.encode().len(), 36);

        entry.status &= !(STATUS_FUND_APPLIED | STATUS_HAVE_UNDO);
        let decoded = BlockIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded.fund, Some(delta));
        assert_eq!(decoded.applied_fund(), None);
    }

    #[test]
    fn rejects_inconsistent_entries() {
        assert!(BlockIndexEntry::decode(&[0u8; 12]).is_err());
        let mut bytes = vec![0u8; 8];
        bytes[4] = STATUS_FUND_APPLIED as u8;
        assert!(BlockIndexEntry::decode(&bytes).is_err());
    }
}

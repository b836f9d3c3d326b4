//! Persistence of per-block fund deltas and of the fund ledger.
//!
//! Deltas live inside the block index entry of their block and the ledger
//! lives under a single meta key. Both are always written through the same
//! [`WriteBatch`] as the rest of a block connect or disconnect, so they never
//! disagree with the UTXO set or the best block pointer after a crash.

use std::sync::Arc;
use std::time::Instant;

use ixd_consensus::{Amount, ConsensusParams, Hash256};
use ixd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::{BlockIndexEntry, STATUS_FUND_APPLIED};
use crate::index::ChainIndex;
use crate::state::ChainStateError;

use super::reward::compute_subsidy;
use super::{BlockFundDelta, FundLedger};

pub const FUND_LEDGER_KEY: &[u8] = b"mining_fund_v1";

/// Result of recomputing the fund from recorded deltas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FundReplay {
    pub ledger: FundLedger,
    pub blocks: u64,
}

pub struct BlockDeltaStore<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockDeltaStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn entry(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, StoreError> {
        match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => BlockIndexEntry::decode(&bytes)
                .map(Some)
                .map_err(StoreError::Backend),
            None => Ok(None),
        }
    }

    pub fn put_entry(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &BlockIndexEntry) {
        batch.put(Column::BlockIndex, hash, entry.encode());
    }

    pub fn applied_delta(&self, hash: &Hash256) -> Result<Option<BlockFundDelta>, StoreError> {
        Ok(self.entry(hash)?.and_then(|entry| entry.applied_fund()))
    }

    pub fn record_applied(
        &self,
        batch: &mut WriteBatch,
        hash: &Hash256,
        mut entry: BlockIndexEntry,
        delta: BlockFundDelta,
    ) -> BlockIndexEntry {
        entry.fund = Some(delta);
        entry.status |= STATUS_FUND_APPLIED;
        self.put_entry(batch, hash, &entry);
        entry
    }

    pub fn mark_undone(
        &self,
        batch: &mut WriteBatch,
        hash: &Hash256,
        mut entry: BlockIndexEntry,
    ) -> BlockIndexEntry {
        entry.status &= !STATUS_FUND_APPLIED;
        self.put_entry(batch, hash, &entry);
        entry
    }

    pub fn ledger(&self) -> Result<Option<FundLedger>, StoreError> {
        match self.store.get(Column::Meta, FUND_LEDGER_KEY)? {
            Some(bytes) => FundLedger::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(format!("invalid mining fund ledger: {err}"))),
            None => Ok(None),
        }
    }

    pub fn put_ledger(&self, batch: &mut WriteBatch, ledger: &FundLedger) {
        batch.put(Column::Meta, FUND_LEDGER_KEY, ledger.encode());
    }

    /// Recomputes the ledger by walking the active chain from genesis and
    /// checking every recorded delta against the payout rule.
    pub fn replay(
        &self,
        index: &ChainIndex<S>,
        params: &ConsensusParams,
    ) -> Result<FundReplay, ChainStateError> {
        let mut ledger = FundLedger::pre_genesis(params);
        let best = match index.best_block()? {
            Some(tip) => tip,
            None => return Ok(FundReplay { ledger, blocks: 0 }),
        };

        let started = Instant::now();
        let mut blocks = 0u64;
        for height in 0..=best.height {
            let hash = index
                .height_hash(height)?
                .ok_or(ChainStateError::CorruptIndex("missing height index entry"))?;
            let header = index
                .get_header(&hash)?
                .ok_or(ChainStateError::CorruptIndex("missing header for active block"))?;
            if header.prev_hash != *ledger.tip() || header.height != height {
                return Err(ChainStateError::CorruptIndex(
                    "height index does not form a chain",
                ));
            }
            let delta = self
                .applied_delta(&hash)?
                .ok_or(ChainStateError::CorruptIndex("missing fund delta for active block"))?;
            check_delta(&ledger, &delta, height, params)?;
            ledger = FundLedger::new(hash, height, delta.resulting_balance);
            blocks += 1;

            if height > 0 && height % 100_000 == 0 {
                ixd_log::log_info!(
                    "Replayed mining fund to height {} (elapsed {:?})",
                    height,
                    started.elapsed()
                );
            }
        }
        if *ledger.tip() != best.hash {
            return Err(ChainStateError::CorruptIndex(
                "height index does not end at best block",
            ));
        }
        Ok(FundReplay { ledger, blocks })
    }
}

fn check_delta(
    ledger: &FundLedger,
    delta: &BlockFundDelta,
    height: i32,
    params: &ConsensusParams,
) -> Result<(), ChainStateError> {
    let mismatch = |field: &'static str, expected: Amount, found: Amount| {
        ChainStateError::FundReplayMismatch {
            height,
            field,
            expected,
            found,
        }
    };
    if delta.height != height {
        return Err(mismatch("height", height.into(), delta.height.into()));
    }
    let pre = delta
        .pre_balance()
        .ok_or(ChainStateError::CorruptIndex("fund delta out of range"))?;
    if pre != ledger.balance() {
        return Err(mismatch("pre_balance", ledger.balance(), pre));
    }
    let subsidy = compute_subsidy(height, ledger.balance(), params);
    if delta.subsidy_paid != subsidy {
        return Err(mismatch("subsidy_paid", subsidy, delta.subsidy_paid));
    }
    if delta.deposits_total < 0 || delta.resulting_balance < 0 {
        return Err(ChainStateError::CorruptIndex("negative mining fund delta"));
    }
    Ok(())
}

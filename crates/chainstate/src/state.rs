//! Chain state: header index, active chain, UTXO set and the mining fund.
//!
//! Every transition is staged into a [`WriteBatch`] and becomes visible only
//! through [`ChainState::commit_batch`], which writes the batch atomically and
//! then publishes the new fund ledger to readers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use ixd_consensus::constants::MAX_REORG_LENGTH;
use ixd_consensus::{
    hash256_to_hex, mining_fund_activation_height, money_range, Amount, ChainParams,
    ConsensusParams, Hash256, Network,
};
use ixd_primitives::encoding::{decode, encode, DecodeError};
use ixd_primitives::{Block, BlockHeader, OutPoint};
use ixd_storage::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};
use primitive_types::U256;

use crate::blockindex::{BlockIndexEntry, STATUS_HAVE_DATA, STATUS_HAVE_UNDO};
use crate::fund::store::FUND_LEDGER_KEY;
use crate::fund::{BlockDeltaStore, BlockFundDelta, ConsensusError, FundLedger, FundReplay};
use crate::genesis::genesis_block;
use crate::index::{
    status_with_block, status_with_failed, status_with_failed_child, status_with_header,
    ChainIndex, ChainTip, HeaderEntry,
};
use crate::undo::{BlockUndo, SpentOutput};
use crate::utxo::{is_unspendable, UtxoEntry, UtxoSet};
use crate::validation::{validate_block, ValidationError, ValidationFlags};
use crate::work::{chainwork_add, check_proof_of_work, PowError};

#[derive(Debug)]
pub enum ChainStateError {
    Validation(ValidationError),
    Consensus(ConsensusError),
    Store(StoreError),
    Decode(DecodeError),
    MissingInput,
    MissingHeader,
    CorruptIndex(&'static str),
    InvalidHeader(&'static str),
    /// A recorded fund delta disagrees with the payout rule or its neighbours.
    FundReplayMismatch {
        height: i32,
        field: &'static str,
        expected: Amount,
        found: Amount,
    },
    ReorgTooDeep {
        depth: i32,
        limit: i32,
    },
    /// Block processing stopped after a fatal fund error.
    Halted,
}

impl ChainStateError {
    /// The block being connected is invalid in itself (as opposed to the
    /// node being unable to process it).
    pub fn is_block_invalid(&self) -> bool {
        match self {
            ChainStateError::Validation(_) | ChainStateError::MissingInput => true,
            ChainStateError::Consensus(err) => err.is_block_invalid(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            ChainStateError::Consensus(err) => err.is_fatal(),
            ChainStateError::Halted => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::Consensus(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::MissingInput => write!(f, "missing input"),
            ChainStateError::MissingHeader => write!(f, "missing header"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::InvalidHeader(message) => write!(f, "{message}"),
            ChainStateError::FundReplayMismatch {
                height,
                field,
                expected,
                found,
            } => write!(
                f,
                "mining fund replay mismatch at height {height}: {field} expected {expected}, found {found}"
            ),
            ChainStateError::ReorgTooDeep { depth, limit } => {
                write!(f, "reorg of {depth} blocks exceeds limit of {limit}")
            }
            ChainStateError::Halted => {
                write!(f, "block processing halted after a fatal mining fund error")
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

impl From<ConsensusError> for ChainStateError {
    fn from(err: ConsensusError) -> Self {
        ChainStateError::Consensus(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<PowError> for ChainStateError {
    fn from(err: PowError) -> Self {
        ChainStateError::Validation(ValidationError::from(err))
    }
}

const HEADER_CACHE_CAPACITY: usize = 50_000;

struct HeaderCache {
    entries: HashMap<Hash256, HeaderEntry>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl HeaderCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<HeaderEntry> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: Hash256, entry: HeaderEntry) {
        if self.entries.insert(hash, entry).is_some() {
            return;
        }
        self.order.push_back(hash);
        if self.entries.len() > self.capacity {
            while let Some(evicted) = self.order.pop_front() {
                if self.entries.remove(&evicted).is_some() {
                    break;
                }
            }
        }
    }
}

/// Outcome of [`ChainState::activate_branch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchActivation {
    pub fork_height: i32,
    /// Old branch, tip first.
    pub disconnected: Vec<Hash256>,
    /// New branch, lowest first.
    pub connected: Vec<Hash256>,
}

#[derive(Clone, Debug)]
pub struct ChainStatus {
    pub network: Network,
    pub best_block: Option<ChainTip>,
    pub best_header: Option<ChainTip>,
    pub mining_fund: Amount,
    pub mining_fund_activation_height: i32,
    pub halted: bool,
}

impl ChainStatus {
    pub fn blocks(&self) -> i32 {
        self.best_block.as_ref().map_or(-1, |tip| tip.height)
    }

    pub fn headers(&self) -> i32 {
        self.best_header.as_ref().map_or(-1, |tip| tip.height)
    }
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    index: ChainIndex<S>,
    utxos: UtxoSet<Arc<S>>,
    deltas: BlockDeltaStore<S>,
    header_cache: Mutex<HeaderCache>,
    /// Fund ledger at the committed best block; replaced wholesale on commit.
    ledger: RwLock<FundLedger>,
    writer: Mutex<()>,
    halted: AtomicBool,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the chain state. A missing fund ledger (older database or a
    /// deleted meta key) is rebuilt by replaying the recorded deltas. A stored
    /// ledger must agree with the delta recorded for the best block.
    pub fn new(store: Arc<S>, params: ChainParams) -> Result<Self, ChainStateError> {
        let index = ChainIndex::new(Arc::clone(&store));
        let utxos = UtxoSet::new(Arc::clone(&store));
        let deltas = BlockDeltaStore::new(Arc::clone(&store));

        let best = index.best_block()?;
        let ledger = match deltas.ledger()? {
            Some(ledger) => {
                let (tip, height) = best
                    .as_ref()
                    .map_or(([0u8; 32], -1), |tip| (tip.hash, tip.height));
                if *ledger.tip() != tip || ledger.height() != height {
                    return Err(ChainStateError::CorruptIndex(
                        "mining fund ledger does not match best block",
                    ));
                }
                if ledger.balance() < 0 {
                    return Err(ChainStateError::CorruptIndex(
                        "mining fund ledger balance is negative",
                    ));
                }
                let expected = match &best {
                    Some(best) => {
                        deltas
                            .applied_delta(&best.hash)?
                            .ok_or(ChainStateError::CorruptIndex(
                                "missing fund delta for best block",
                            ))?
                            .resulting_balance
                    }
                    None => params.consensus.mining_fund.initial_balance,
                };
                if ledger.balance() != expected {
                    return Err(ChainStateError::FundReplayMismatch {
                        height,
                        field: "balance",
                        expected,
                        found: ledger.balance(),
                    });
                }
                ledger
            }
            None => {
                let replay = deltas.replay(&index, &params.consensus)?;
                let mut batch = WriteBatch::new();
                deltas.put_ledger(&mut batch, &replay.ledger);
                store.write_batch(&batch)?;
                if replay.blocks > 0 {
                    ixd_log::log_info!(
                        "Rebuilt mining fund ledger from {} blocks: balance {} at height {}",
                        replay.blocks,
                        replay.ledger.balance(),
                        replay.ledger.height()
                    );
                }
                replay.ledger
            }
        };

        Ok(Self {
            store,
            params,
            index,
            utxos,
            deltas,
            header_cache: Mutex::new(HeaderCache::new(HEADER_CACHE_CAPACITY)),
            ledger: RwLock::new(ledger),
            writer: Mutex::new(()),
            halted: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn consensus(&self) -> &ConsensusParams {
        &self.params.consensus
    }

    pub fn best_block(&self) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.index.best_block()?)
    }

    pub fn best_header(&self) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.index.best_header()?)
    }

    pub fn height_hash(&self, height: i32) -> Result<Option<Hash256>, ChainStateError> {
        Ok(self.index.height_hash(height)?)
    }

    pub fn header_entry(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainStateError> {
        if let Ok(cache) = self.header_cache.lock() {
            if let Some(entry) = cache.get(hash) {
                return Ok(Some(entry));
            }
        }
        let entry = self.index.get_header(hash)?;
        if let Some(entry) = entry.clone() {
            if let Ok(mut cache) = self.header_cache.lock() {
                cache.insert(*hash, entry);
            }
        }
        Ok(entry)
    }

    pub fn block_index_entry(
        &self,
        hash: &Hash256,
    ) -> Result<Option<BlockIndexEntry>, ChainStateError> {
        Ok(self.deltas.entry(hash)?)
    }

    /// Fund delta of `hash` if the block is currently connected.
    pub fn block_fund_delta(&self, hash: &Hash256) -> Result<Option<BlockFundDelta>, ChainStateError> {
        Ok(self.deltas.applied_delta(hash)?)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.store.get(Column::BlockData, hash)? {
            Some(bytes) => decode::<Block>(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::CorruptIndex("invalid block bytes")),
            None => Ok(None),
        }
    }

    pub fn block_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainStateError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => BlockUndo::decode(&bytes)
                .map(Some)
                .map_err(|_| ChainStateError::CorruptIndex("invalid block undo bytes")),
            None => Ok(None),
        }
    }

    pub fn utxo_entry(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        Ok(self.utxos.get(outpoint)?)
    }

    /// Snapshot of the fund at the committed tip. Never blocks on a writer
    /// for longer than a pointer swap and never observes a half-applied block.
    pub fn fund_ledger(&self) -> FundLedger {
        *self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fund_balance(&self) -> Amount {
        self.fund_ledger().balance()
    }

    /// Fund balance right after block `hash`, for any block that has ever
    /// been connected.
    pub fn fund_balance_at(&self, hash: &Hash256) -> Result<Option<Amount>, ChainStateError> {
        Ok(self
            .deltas
            .entry(hash)?
            .and_then(|entry| entry.fund)
            .map(|delta| delta.resulting_balance))
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn chain_status(&self) -> Result<ChainStatus, ChainStateError> {
        Ok(ChainStatus {
            network: self.params.network,
            best_block: self.best_block()?,
            best_header: self.best_header()?,
            mining_fund: self.fund_balance(),
            mining_fund_activation_height: mining_fund_activation_height(&self.params.consensus),
            halted: self.is_halted(),
        })
    }

    pub fn insert_header(
        &self,
        header: &BlockHeader,
        batch: &mut WriteBatch,
    ) -> Result<HeaderEntry, ChainStateError> {
        let mut pending = HashMap::new();
        let mut best = self.best_header_work()?;
        self.insert_header_with_pending(header, batch, &mut pending, &mut best)
    }

    /// Stages a run of headers, each of which may build on the ones before it.
    pub fn insert_headers_batch(
        &self,
        headers: &[BlockHeader],
        batch: &mut WriteBatch,
    ) -> Result<Vec<HeaderEntry>, ChainStateError> {
        let mut pending = HashMap::new();
        let mut best = self.best_header_work()?;
        headers
            .iter()
            .map(|header| self.insert_header_with_pending(header, batch, &mut pending, &mut best))
            .collect()
    }

    fn best_header_work(&self) -> Result<Option<(Hash256, U256)>, ChainStateError> {
        Ok(self
            .best_header()?
            .map(|tip| (tip.hash, U256::from_big_endian(&tip.chainwork))))
    }

    fn insert_header_with_pending(
        &self,
        header: &BlockHeader,
        batch: &mut WriteBatch,
        pending: &mut HashMap<Hash256, HeaderEntry>,
        best: &mut Option<(Hash256, U256)>,
    ) -> Result<HeaderEntry, ChainStateError> {
        let hash = header.hash();
        if let Some(existing) = header_entry_with_pending(self, pending, &hash)? {
            return Ok(existing);
        }

        let (height, parent_work) = if header.has_null_parent() {
            if hash != self.params.consensus.hash_genesis_block {
                return Err(ChainStateError::InvalidHeader("unexpected genesis header"));
            }
            (0, [0u8; 32])
        } else {
            let parent = header_entry_with_pending(self, pending, &header.prev_block)?
                .ok_or(ChainStateError::MissingHeader)?;
            if parent.is_failed() {
                let entry = HeaderEntry {
                    prev_hash: header.prev_block,
                    height: parent.height + 1,
                    time: header.time,
                    bits: header.bits,
                    chainwork: parent.chainwork,
                    status: status_with_failed_child(status_with_header(0)),
                };
                self.index.put_header(batch, &hash, &entry);
                pending.insert(hash, entry);
                return Err(ChainStateError::InvalidHeader(
                    "parent header failed validation",
                ));
            }
            (parent.height + 1, parent.chainwork)
        };

        check_proof_of_work(&hash, header.bits, &self.params.consensus.pow_limit, false)?;
        let chainwork = chainwork_add(&parent_work, header.bits).map_err(PowError::from)?;
        let entry = HeaderEntry {
            prev_hash: header.prev_block,
            height,
            time: header.time,
            bits: header.bits,
            chainwork,
            status: status_with_header(0),
        };
        self.index.put_header(batch, &hash, &entry);
        pending.insert(hash, entry.clone());

        let work = entry.chainwork_value();
        let should_update_best = match best {
            Some((_, best_work)) => work > *best_work,
            None => true,
        };
        if should_update_best {
            *best = Some((hash, work));
            self.index.set_best_header(batch, &hash);
        }
        Ok(entry)
    }

    /// Stages the connection of `block` at `height` on top of the best block.
    ///
    /// Nothing is written until the returned batch is passed to
    /// [`commit_batch`](Self::commit_batch). Callers that may race with other
    /// writers should use [`connect_and_commit`](Self::connect_and_commit).
    pub fn connect_block(
        &self,
        block: &Block,
        height: i32,
        flags: &ValidationFlags,
    ) -> Result<WriteBatch, ChainStateError> {
        self.ensure_running()?;
        let hash = block.header.hash();
        let result = self.stage_connect(block, &hash, height, flags);
        if let Err(err) = &result {
            self.note_failure("connect", &hash, height, err);
        }
        result
    }

    fn stage_connect(
        &self,
        block: &Block,
        hash: &Hash256,
        height: i32,
        flags: &ValidationFlags,
    ) -> Result<WriteBatch, ChainStateError> {
        let consensus = &self.params.consensus;
        let mut batch = WriteBatch::new();

        let mut header_entry = self.insert_header(&block.header, &mut batch)?;
        if header_entry.height != height {
            return Err(ChainStateError::InvalidHeader(
                "block height does not match header index",
            ));
        }
        if header_entry.is_failed() {
            return Err(ChainStateError::InvalidHeader(
                "block previously failed validation",
            ));
        }
        match self.best_block()? {
            Some(best) if block.header.prev_block != best.hash => {
                return Err(ChainStateError::InvalidHeader(
                    "block does not extend best block",
                ));
            }
            None if height != 0 => {
                return Err(ChainStateError::InvalidHeader(
                    "missing best block for non-genesis height",
                ));
            }
            _ => {}
        }

        // The genesis block is identified by hash, not by its work.
        let flags = if height == 0 {
            ValidationFlags {
                check_pow: false,
                ..flags.clone()
            }
        } else {
            flags.clone()
        };
        let txids = validate_block(block, consensus, &flags)?;

        let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut undo = BlockUndo::default();
        let mut fees: Amount = 0;
        for (tx, txid) in block.transactions.iter().zip(&txids) {
            let is_coinbase = tx.is_coinbase();
            if !is_coinbase {
                let mut value_in: Amount = 0;
                for input in &tx.vin {
                    let entry = match created.remove(&input.prevout) {
                        Some(entry) => entry,
                        None => {
                            let entry = self
                                .utxos
                                .get(&input.prevout)?
                                .ok_or(ChainStateError::MissingInput)?;
                            self.utxos.delete(&mut batch, &input.prevout);
                            undo.spent.push(SpentOutput {
                                outpoint: input.prevout.clone(),
                                entry: entry.clone(),
                            });
                            entry
                        }
                    };
                    if entry.is_coinbase && height - entry.height < consensus.coinbase_maturity {
                        return Err(ValidationError::InvalidTransaction(
                            "premature spend of coinbase output",
                        )
                        .into());
                    }
                    value_in = value_in
                        .checked_add(entry.value)
                        .filter(|value| money_range(*value))
                        .ok_or(ValidationError::ValueOutOfRange)?;
                }
                let value_out = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
                if value_in < value_out {
                    return Err(ValidationError::InvalidTransaction(
                        "transaction outputs exceed inputs",
                    )
                    .into());
                }
                fees = fees
                    .checked_add(value_in - value_out)
                    .filter(|value| money_range(*value))
                    .ok_or(ValidationError::ValueOutOfRange)?;
            }
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                created.insert(
                    OutPoint::new(*txid, index as u32),
                    UtxoEntry {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height,
                        is_coinbase,
                    },
                );
            }
        }

        let ledger = self.fund_ledger();
        let (next_ledger, delta) = ledger.apply_block(block, hash, height, fees, consensus)?;

        for (outpoint, entry) in &created {
            self.utxos.put(&mut batch, outpoint, entry);
        }
        batch.put(Column::BlockData, *hash, encode(block));
        batch.put(Column::BlockUndo, *hash, undo.encode());
        let entry = BlockIndexEntry {
            tx_count: block.transactions.len() as u32,
            status: STATUS_HAVE_DATA | STATUS_HAVE_UNDO,
            fund: None,
        };
        self.deltas.record_applied(&mut batch, hash, entry, delta);
        header_entry.status = status_with_block(header_entry.status);
        self.index.put_header(&mut batch, hash, &header_entry);
        self.index.set_height_hash(&mut batch, height, hash);
        self.index.set_best_block(&mut batch, hash);
        self.deltas.put_ledger(&mut batch, &next_ledger);

        ixd_log::log_debug!(
            "Staged block {} at height {}: fees {} fund deposits {} subsidy {} balance {}",
            hash256_to_hex(hash),
            height,
            fees,
            delta.deposits_total,
            delta.subsidy_paid,
            delta.resulting_balance
        );
        Ok(batch)
    }

    /// Stages the disconnection of `hash`, which must be the best block.
    pub fn disconnect_block(&self, hash: &Hash256) -> Result<WriteBatch, ChainStateError> {
        self.ensure_running()?;
        let result = self.stage_disconnect(hash);
        if let Err(err) = &result {
            self.note_failure("disconnect", hash, self.fund_ledger().height(), err);
        }
        result
    }

    fn stage_disconnect(&self, hash: &Hash256) -> Result<WriteBatch, ChainStateError> {
        let best = self
            .best_block()?
            .ok_or(ChainStateError::InvalidHeader("no active chain to disconnect"))?;
        let header = self
            .header_entry(hash)?
            .ok_or(ChainStateError::MissingHeader)?;
        if best.hash != *hash {
            return Err(ConsensusError::InvalidUndoOrder {
                tip_height: best.height,
                height: header.height,
            }
            .into());
        }

        let index_entry = self
            .deltas
            .entry(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block index entry"))?;
        let delta = index_entry
            .applied_fund()
            .ok_or(ChainStateError::CorruptIndex("missing fund delta for active block"))?;
        let prev_ledger = self
            .fund_ledger()
            .undo_block(hash, &header.prev_hash, &delta)?;

        let block = self
            .read_block(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block data"))?;
        let undo = self
            .block_undo(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block undo data"))?;

        let mut batch = WriteBatch::new();
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for (index, output) in tx.vout.iter().enumerate() {
                if !is_unspendable(&output.script_pubkey) {
                    self.utxos
                        .delete(&mut batch, &OutPoint::new(txid, index as u32));
                }
            }
        }
        for spent in undo.spent.iter().rev() {
            self.utxos.put(&mut batch, &spent.outpoint, &spent.entry);
        }
        batch.delete(Column::BlockUndo, *hash);

        let mut entry = index_entry;
        entry.status &= !STATUS_HAVE_UNDO;
        self.deltas.mark_undone(&mut batch, hash, entry);
        self.index.clear_height_hash(&mut batch, header.height);
        if header.height == 0 {
            self.index.clear_best_block(&mut batch);
        } else {
            self.index.set_best_block(&mut batch, &header.prev_hash);
        }
        self.deltas.put_ledger(&mut batch, &prev_ledger);

        ixd_log::log_debug!(
            "Staged disconnect of block {} at height {}: fund balance {} -> {}",
            hash256_to_hex(hash),
            header.height,
            delta.resulting_balance,
            prev_ledger.balance()
        );
        Ok(batch)
    }

    /// Writes `batch` atomically, then refreshes the caches it touched.
    pub fn commit_batch(&self, batch: WriteBatch) -> Result<(), ChainStateError> {
        let mut ledger_update = None;
        let mut header_updates = Vec::new();
        for op in batch.iter() {
            if let WriteOp::Put { column, key, value } = op {
                match *column {
                    Column::Meta if key.as_slice() == FUND_LEDGER_KEY => {
                        ledger_update = Some(FundLedger::decode(value.as_slice())?);
                    }
                    Column::HeaderIndex => {
                        let hash = <Hash256>::try_from(key.as_slice()).map_err(|_| {
                            ChainStateError::CorruptIndex("invalid header index key in batch")
                        })?;
                        let entry = crate::index::decode_header_entry(value.as_slice()).map_err(
                            |_| ChainStateError::CorruptIndex("invalid header index entry in batch"),
                        )?;
                        header_updates.push((hash, entry));
                    }
                    _ => {}
                }
            }
        }
        self.store.write_batch(&batch)?;
        if !header_updates.is_empty() {
            if let Ok(mut cache) = self.header_cache.lock() {
                for (hash, entry) in header_updates {
                    cache.insert(hash, entry);
                }
            }
        }
        if let Some(ledger) = ledger_update {
            *self.ledger.write().unwrap_or_else(PoisonError::into_inner) = ledger;
        }
        Ok(())
    }

    /// Connects and commits `block` at `height` under the writer lock and
    /// returns the fund delta it recorded.
    pub fn connect_and_commit(
        &self,
        block: &Block,
        height: i32,
        flags: &ValidationFlags,
    ) -> Result<BlockFundDelta, ChainStateError> {
        let _guard = self.lock_writer();
        self.connect_locked(block, height, flags)
    }

    /// Connects `block` on top of the current tip.
    pub fn connect_tip(
        &self,
        block: &Block,
        flags: &ValidationFlags,
    ) -> Result<BlockFundDelta, ChainStateError> {
        let _guard = self.lock_writer();
        let height = self.fund_ledger().height() + 1;
        self.connect_locked(block, height, flags)
    }

    fn connect_locked(
        &self,
        block: &Block,
        height: i32,
        flags: &ValidationFlags,
    ) -> Result<BlockFundDelta, ChainStateError> {
        let hash = block.header.hash();
        let batch = self.connect_block(block, height, flags)?;
        self.commit_batch(batch)?;
        self.block_fund_delta(&hash)?
            .ok_or(ChainStateError::CorruptIndex("connected block has no fund delta"))
    }

    /// Disconnects and commits `hash` under the writer lock and returns the
    /// delta that was undone.
    pub fn disconnect_and_commit(&self, hash: &Hash256) -> Result<BlockFundDelta, ChainStateError> {
        let _guard = self.lock_writer();
        let delta = self
            .block_fund_delta(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing fund delta for active block"))?;
        let batch = self.disconnect_block(hash)?;
        self.commit_batch(batch)?;
        Ok(delta)
    }

    /// Connects the genesis block if the chain is empty. Returns its hash
    /// when it was connected by this call.
    pub fn ensure_genesis(&self) -> Result<Option<Hash256>, ChainStateError> {
        if self.best_block()?.is_some() {
            return Ok(None);
        }
        let block = genesis_block(&self.params.consensus)?;
        let hash = block.header.hash();
        let delta = self.connect_and_commit(&block, 0, &ValidationFlags::full())?;
        ixd_log::log_info!(
            "Connected {} genesis block {}: mining fund {}",
            self.params.network,
            hash256_to_hex(&hash),
            delta.resulting_balance
        );
        Ok(Some(hash))
    }

    /// Replaces the active chain above the parent of `blocks[0]` with
    /// `blocks`. If any step fails, the previous branch is restored before
    /// the error is returned.
    pub fn activate_branch(
        &self,
        blocks: &[Block],
        flags: &ValidationFlags,
    ) -> Result<BranchActivation, ChainStateError> {
        let _guard = self.lock_writer();
        self.ensure_running()?;

        let first = blocks
            .first()
            .ok_or(ChainStateError::InvalidHeader("empty branch"))?;
        for pair in blocks.windows(2) {
            if pair[1].header.prev_block != pair[0].header.hash() {
                return Err(ChainStateError::InvalidHeader(
                    "branch blocks are not contiguous",
                ));
            }
        }

        let fork_hash = first.header.prev_block;
        let fork_height = if first.header.has_null_parent() {
            -1
        } else {
            let fork = self
                .header_entry(&fork_hash)?
                .ok_or(ChainStateError::MissingHeader)?;
            if self.height_hash(fork.height)? != Some(fork_hash) {
                return Err(ChainStateError::InvalidHeader(
                    "fork point is not on the active chain",
                ));
            }
            fork.height
        };
        let best = self.best_block()?;
        let best_height = best.as_ref().map_or(-1, |tip| tip.height);
        let depth = best_height - fork_height;
        if depth > MAX_REORG_LENGTH {
            return Err(ChainStateError::ReorgTooDeep {
                depth,
                limit: MAX_REORG_LENGTH,
            });
        }

        let headers: Vec<BlockHeader> = blocks.iter().map(|block| block.header.clone()).collect();
        let mut header_batch = WriteBatch::new();
        let entries = self.insert_headers_batch(&headers, &mut header_batch)?;
        self.commit_batch(header_batch)?;
        if let (Some(best), Some(new_tip)) = (best.as_ref(), entries.last()) {
            if new_tip.chainwork_value() <= U256::from_big_endian(&best.chainwork) {
                return Err(ChainStateError::InvalidHeader(
                    "branch does not have more work than the active chain",
                ));
            }
        }

        let mut disconnected = Vec::with_capacity(depth.max(0) as usize);
        while let Some(tip) = self.best_block()? {
            if tip.height <= fork_height {
                break;
            }
            let step = self
                .disconnect_block(&tip.hash)
                .and_then(|batch| self.commit_batch(batch));
            if let Err(err) = step {
                ixd_log::log_warn!(
                    "Branch activation failed disconnecting {}: {}; restoring previous tip",
                    hash256_to_hex(&tip.hash),
                    err
                );
                self.restore_branch(&[], &disconnected, flags)?;
                return Err(err);
            }
            disconnected.push(tip.hash);
        }

        let mut connected = Vec::with_capacity(blocks.len());
        for (offset, block) in blocks.iter().enumerate() {
            let height = fork_height + 1 + offset as i32;
            let hash = block.header.hash();
            let step = self
                .connect_block(block, height, flags)
                .and_then(|batch| self.commit_batch(batch));
            if let Err(err) = step {
                if self.is_halted() {
                    return Err(err);
                }
                ixd_log::log_warn!(
                    "Branch activation failed at height {} ({}): {}; restoring previous tip",
                    height,
                    hash256_to_hex(&hash),
                    err
                );
                if err.is_block_invalid() {
                    self.mark_branch_failed(&blocks[offset..])?;
                }
                self.restore_branch(&connected, &disconnected, flags)?;
                return Err(err);
            }
            connected.push(hash);
        }

        ixd_log::log_info!(
            "Activated branch at fork height {}: disconnected {} blocks, connected {} blocks, mining fund {}",
            fork_height,
            disconnected.len(),
            connected.len(),
            self.fund_balance()
        );
        Ok(BranchActivation {
            fork_height,
            disconnected,
            connected,
        })
    }

    fn restore_branch(
        &self,
        connected: &[Hash256],
        disconnected: &[Hash256],
        flags: &ValidationFlags,
    ) -> Result<(), ChainStateError> {
        let result: Result<(), ChainStateError> = (|| {
            for hash in connected.iter().rev() {
                let batch = self.disconnect_block(hash)?;
                self.commit_batch(batch)?;
            }
            for hash in disconnected.iter().rev() {
                let block = self
                    .read_block(hash)?
                    .ok_or(ChainStateError::CorruptIndex("missing block data for rollback"))?;
                let height = self
                    .header_entry(hash)?
                    .ok_or(ChainStateError::MissingHeader)?
                    .height;
                let batch = self.connect_block(&block, height, flags)?;
                self.commit_batch(batch)?;
            }
            Ok(())
        })();
        if let Err(err) = &result {
            ixd_log::log_error!("Failed to restore previous chain tip: {}", err);
        }
        result
    }

    /// Marks the first block of `blocks` failed and the rest as descendants of
    /// a failed block.
    fn mark_branch_failed(&self, blocks: &[Block]) -> Result<(), ChainStateError> {
        let mut batch = WriteBatch::new();
        for (offset, block) in blocks.iter().enumerate() {
            let hash = block.header.hash();
            let Some(mut entry) = self.header_entry(&hash)? else {
                continue;
            };
            entry.status = if offset == 0 {
                status_with_failed(entry.status)
            } else {
                status_with_failed_child(entry.status)
            };
            self.index.put_header(&mut batch, &hash, &entry);
        }
        self.commit_batch(batch)
    }

    /// Disconnects the active chain down to and including `hash`, then marks
    /// it failed so it is not reconnected. Returns the disconnected hashes,
    /// tip first.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<Vec<Hash256>, ChainStateError> {
        let _guard = self.lock_writer();
        self.ensure_running()?;
        let mut header = self
            .header_entry(hash)?
            .ok_or(ChainStateError::MissingHeader)?;

        let mut disconnected = Vec::new();
        if self.height_hash(header.height)? == Some(*hash) {
            let best_height = self.best_block()?.map_or(-1, |tip| tip.height);
            let depth = best_height - header.height + 1;
            if depth > MAX_REORG_LENGTH {
                return Err(ChainStateError::ReorgTooDeep {
                    depth,
                    limit: MAX_REORG_LENGTH,
                });
            }
            while let Some(tip) = self.best_block()? {
                let batch = self.disconnect_block(&tip.hash)?;
                self.commit_batch(batch)?;
                disconnected.push(tip.hash);
                if tip.hash == *hash {
                    break;
                }
            }
        }

        header.status = status_with_failed(header.status);
        let mut batch = WriteBatch::new();
        self.index.put_header(&mut batch, hash, &header);
        self.commit_batch(batch)?;
        ixd_log::log_info!(
            "Invalidated block {}: disconnected {} blocks, mining fund {}",
            hash256_to_hex(hash),
            disconnected.len(),
            self.fund_balance()
        );
        Ok(disconnected)
    }

    /// Recomputes the fund from the recorded deltas and checks it against
    /// the committed ledger.
    pub fn verify_fund_replay(&self) -> Result<FundReplay, ChainStateError> {
        let _guard = self.lock_writer();
        let replay = self.deltas.replay(&self.index, &self.params.consensus)?;
        let ledger = self.fund_ledger();
        if replay.ledger.tip() != ledger.tip() || replay.ledger.height() != ledger.height() {
            return Err(ChainStateError::CorruptIndex(
                "mining fund ledger tip does not match active chain",
            ));
        }
        if replay.ledger.balance() != ledger.balance() {
            return Err(ChainStateError::FundReplayMismatch {
                height: ledger.height(),
                field: "balance",
                expected: replay.ledger.balance(),
                found: ledger.balance(),
            });
        }
        Ok(replay)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), ChainStateError> {
        if self.is_halted() {
            return Err(ChainStateError::Halted);
        }
        Ok(())
    }

    fn note_failure(&self, action: &str, hash: &Hash256, height: i32, err: &ChainStateError) {
        if err.is_fatal() {
            self.halted.store(true, Ordering::SeqCst);
            ixd_log::log_error!(
                "Fatal error during {} of block {} at height {}: {}; halting block processing",
                action,
                hash256_to_hex(hash),
                height,
                err
            );
        } else if err.is_block_invalid() {
            ixd_log::log_warn!(
                "Rejected block {} at height {}: {}",
                hash256_to_hex(hash),
                height,
                err
            );
        }
    }
}

fn header_entry_with_pending<S: KeyValueStore>(
    state: &ChainState<S>,
    pending: &HashMap<Hash256, HeaderEntry>,
    hash: &Hash256,
) -> Result<Option<HeaderEntry>, ChainStateError> {
    if let Some(entry) = pending.get(hash) {
        return Ok(Some(entry.clone()));
    }
    state.header_entry(hash)
}

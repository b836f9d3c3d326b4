//! Header index, height index and best-chain pointers.

use ixd_consensus::Hash256;
use ixd_primitives::encoding::{Decoder, Encoder};
use ixd_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use std::sync::Arc;

const META_BEST_HEADER_KEY: &[u8] = b"best_header";
const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

const STATUS_HAS_HEADER: u8 = 1 << 0;
const STATUS_HAS_BLOCK: u8 = 1 << 1;
const STATUS_FAILED_VALIDATION: u8 = 1 << 2;
const STATUS_FAILED_CHILD: u8 = 1 << 3;
const STATUS_FAILED_MASK: u8 = STATUS_FAILED_VALIDATION | STATUS_FAILED_CHILD;

const HEADER_ENTRY_LEN: usize = 32 + 4 + 4 + 4 + 32 + 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderEntry {
    pub prev_hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    pub chainwork: [u8; 32],
    pub status: u8,
}

impl HeaderEntry {
    pub fn has_block(&self) -> bool {
        has_block(self.status)
    }

    pub fn has_header(&self) -> bool {
        has_header(self.status)
    }

    pub fn is_failed(&self) -> bool {
        is_failed(self.status)
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub chainwork: [u8; 32],
}

pub struct ChainIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, StoreError> {
        let bytes = match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode_header_entry(&bytes)
            .map(Some)
            .map_err(StoreError::Backend)
    }

    pub fn put_header(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &HeaderEntry) {
        batch.put(Column::HeaderIndex, hash, encode_header_entry(entry));
    }

    pub fn set_best_header(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_HEADER_KEY, *hash);
    }

    pub fn set_best_block(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *hash);
    }

    pub fn clear_best_block(&self, batch: &mut WriteBatch) {
        batch.delete(Column::Meta, META_BEST_BLOCK_KEY);
    }

    pub fn best_header(&self) -> Result<Option<ChainTip>, StoreError> {
        self.tip_at(META_BEST_HEADER_KEY)
    }

    pub fn best_block(&self) -> Result<Option<ChainTip>, StoreError> {
        self.tip_at(META_BEST_BLOCK_KEY)
    }

    fn tip_at(&self, key: &[u8]) -> Result<Option<ChainTip>, StoreError> {
        let hash = match self.store.get(Column::Meta, key)? {
            Some(bytes) => decode_hash(&bytes).map_err(StoreError::Backend)?,
            None => return Ok(None),
        };
        let entry = match self.get_header(&hash)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        Ok(Some(ChainTip {
            hash,
            height: entry.height,
            chainwork: entry.chainwork,
        }))
    }

    pub fn height_hash(&self, height: i32) -> Result<Option<Hash256>, StoreError> {
        let key = height_key(height);
        let bytes = match self.store.get(Column::HeightIndex, &key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode_hash(&bytes).map(Some).map_err(StoreError::Backend)
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, height: i32, hash: &Hash256) {
        batch.put(Column::HeightIndex, height_key(height), *hash);
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, height: i32) {
        batch.delete(Column::HeightIndex, height_key(height));
    }
}

/// Big endian so a prefix scan over the height column walks the chain in order.
pub fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

fn encode_header_entry(entry: &HeaderEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(HEADER_ENTRY_LEN);
    encoder.write_hash_le(&entry.prev_hash);
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.bits);
    encoder.write_bytes(&entry.chainwork);
    encoder.write_u8(entry.status);
    encoder.into_inner()
}

pub(crate) fn decode_header_entry(bytes: &[u8]) -> Result<HeaderEntry, String> {
    let mut decoder = Decoder::new(bytes);
    let prev_hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
    let height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let time = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let bits = decoder.read_u32_le().map_err(|err| err.to_string())?;
    let chainwork = decoder.read_fixed::<32>().map_err(|err| err.to_string())?;
    let status = decoder.read_u8().map_err(|err| err.to_string())?;
    if !decoder.is_empty() {
        return Err("trailing bytes in header entry".to_string());
    }
    Ok(HeaderEntry {
        prev_hash,
        height,
        time,
        bits,
        chainwork,
        status,
    })
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, String> {
    <Hash256>::try_from(bytes).map_err(|_| "invalid hash length".to_string())
}

pub fn status_with_header(status: u8) -> u8 {
    status | STATUS_HAS_HEADER
}

pub fn status_with_block(status: u8) -> u8 {
    status | STATUS_HAS_BLOCK
}

pub fn status_with_failed(status: u8) -> u8 {
    status | STATUS_FAILED_VALIDATION
}

pub fn status_with_failed_child(status: u8) -> u8 {
    status | STATUS_FAILED_CHILD
}

pub fn has_header(status: u8) -> bool {
    (status & STATUS_HAS_HEADER) != 0
}

pub fn has_block(status: u8) -> bool {
    (status & STATUS_HAS_BLOCK) != 0
}

pub fn is_failed(status: u8) -> bool {
    (status & STATUS_FAILED_MASK) != 0
}

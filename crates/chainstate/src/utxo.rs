//! UTXO set logic backed by the storage trait.

use ixd_consensus::constants::MAX_SCRIPT_SIZE;
use ixd_consensus::Amount;
use ixd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ixd_primitives::OutPoint;
use ixd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

const OP_RETURN: u8 = 0x6a;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(8 + 1 + self.script_pubkey.len() + 5);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_i32_le(self.height);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_i32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

/// Outputs that can never be spent are kept out of the UTXO set. This covers
/// mining fund deposits, whose value moves into the fund instead.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => Ok(Some(
                UtxoEntry::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        let key = OutPointKey::new(outpoint);
        batch.put(Column::Utxo, key.as_bytes(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        let key = OutPointKey::new(outpoint);
        batch.delete(Column::Utxo, key.as_bytes());
    }
}

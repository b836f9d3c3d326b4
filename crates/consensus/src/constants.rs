//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Coinbase scriptSig length bounds (network rule).
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;
/// Maximum number of blocks a single branch switch may disconnect.
pub const MAX_REORG_LENGTH: i32 = 100;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Script pattern that marks an output as a mining fund deposit:
/// `OP_RETURN <"fundmining">`.
pub const MINING_FUND_MARKER: &[u8] = b"fundmining";

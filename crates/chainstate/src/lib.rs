//! Chain state, UTXO set and mining fund ledger.

pub mod blockindex;
pub mod fund;
pub mod genesis;
pub mod index;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;
pub mod work;

pub use fund::{BlockFundDelta, ConsensusError, FundLedger};
pub use state::{BranchActivation, ChainState, ChainStateError, ChainStatus};
pub use validation::{ValidationError, ValidationFlags};

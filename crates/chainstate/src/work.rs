//! Compact targets, proof-of-work checks and chainwork accumulation.

use ixd_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    ZeroTarget,
    AboveLimit,
    HashAboveTarget,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "{err}"),
            PowError::ZeroTarget => write!(f, "compact target is zero"),
            PowError::AboveLimit => write!(f, "target above proof-of-work limit"),
            PowError::HashAboveTarget => write!(f, "block hash does not meet target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    Ok(value)
}

/// Expected number of hashes needed to find a block at `bits`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Checks that `bits` decodes to a target inside `(0, pow_limit]` and, when
/// `check_hash` is set, that `hash` meets it.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    pow_limit: &Hash256,
    check_hash: bool,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::ZeroTarget);
    }
    if target > U256::from_little_endian(pow_limit) {
        return Err(PowError::AboveLimit);
    }
    if check_hash && U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

pub fn chainwork_add(parent: &[u8; 32], bits: u32) -> Result<[u8; 32], CompactError> {
    let work = U256::from_big_endian(parent).saturating_add(block_proof(bits)?);
    Ok(work.to_big_endian())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixd_consensus::{consensus_params, Network};

    #[test]
    fn proof_for_known_targets() {
        assert_eq!(block_proof(0x207f_ffff).expect("proof"), U256::from(2u64));
        assert_eq!(
            block_proof(0x1d00_ffff).expect("proof"),
            U256::from(0x1_0001_0001u64)
        );
        assert_eq!(block_proof(0).expect("proof"), U256::zero());
    }

    #[test]
    fn rejects_malformed_compact() {
        assert_eq!(compact_to_u256(0x0480_0001), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0x2301_0000), Err(CompactError::Overflow));
        assert_eq!(compact_to_u256(0x0112_3456).expect("small"), U256::from(0x12u64));
    }

    #[test]
    fn pow_limit_is_enforced() {
        let regtest = consensus_params(Network::Regtest);
        let main = consensus_params(Network::Mainnet);
        let zero = [0u8; 32];
        assert!(check_proof_of_work(&zero, 0x207f_ffff, &regtest.pow_limit, true).is_ok());
        assert_eq!(
            check_proof_of_work(&zero, 0x207f_ffff, &main.pow_limit, true),
            Err(PowError::AboveLimit)
        );
        assert_eq!(
            check_proof_of_work(&[0xff; 32], 0x1d00_ffff, &main.pow_limit, true),
            Err(PowError::HashAboveTarget)
        );
        assert!(check_proof_of_work(&[0xff; 32], 0x1d00_ffff, &main.pow_limit, false).is_ok());
        assert_eq!(
            check_proof_of_work(&zero, 0x0100_0000, &main.pow_limit, true),
            Err(PowError::ZeroTarget)
        );
    }

    #[test]
    fn chainwork_accumulates() {
        let one = chainwork_add(&[0u8; 32], 0x207f_ffff).expect("work");
        let two = chainwork_add(&one, 0x207f_ffff).expect("work");
        assert_eq!(U256::from_big_endian(&two), U256::from(4u64));
    }
}

use ixd_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        let digest = sha256d(b"");
        assert_eq!(
            digest[..4],
            [0x5d, 0xf6, 0xe0, 0xe2],
            "sha256d(\"\") starts with 5df6e0e2"
        );
        assert_ne!(sha256(b""), digest);
    }
}

use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A 32-byte digest used for block hashes and txids.
///
/// Bytes are kept in internal (wire) order and shown reversed, the way
/// bitcoind and block explorers print them. `Hash` feeds only the folded
/// [`Hash256::bucket_key`] to the hasher, while `Eq` compares the full digest,
/// so table placement is identical on every platform and two digests sharing
/// a bucket are still told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Fixed-width table key: XOR of the four little-endian 8-byte lanes.
    pub fn bucket_key(&self) -> u64 {
        self.0.chunks_exact(8).fold(0u64, |acc, lane| {
            let mut word = [0u8; 8];
            word.copy_from_slice(lane);
            acc ^ u64::from_le_bytes(word)
        })
    }

    /// Display-order hex.
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn to_block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.0)
    }
}

impl Hash for Hash256 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.bucket_key());
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Txid> for Hash256 {
    fn from(txid: Txid) -> Self {
        Self(txid.to_byte_array())
    }
}

impl From<BlockHash> for Hash256 {
    fn from(hash: BlockHash) -> Self {
        Self(hash.to_byte_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash as _;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;
    use std::collections::HashSet;

    const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    #[test]
    fn test_display_matches_bitcoind() {
        let genesis = genesis_block(Network::Bitcoin).block_hash();
        let hash = Hash256::from(genesis);

        assert_eq!(hash.to_string(), GENESIS_HASH);
        assert_eq!(hash.to_string(), genesis.to_string());
        // Internal order ends with the leading zeros of the display form.
        let internal = genesis.to_byte_array();
        assert_eq!(hash, Hash256::new(internal));
        assert_eq!((internal[0], internal[31]), (0x6f, 0));
    }

    #[test]
    fn test_block_hash_conversion_round_trips() {
        let genesis = genesis_block(Network::Bitcoin).block_hash();
        assert_eq!(Hash256::from(genesis).to_block_hash(), genesis);
        assert_eq!(genesis.to_string(), GENESIS_HASH);
    }

    #[test]
    fn test_txid_conversion_keeps_bytes() {
        let txid = Txid::from_byte_array([9; 32]);
        assert_eq!(Hash256::from(txid), Hash256::new([9; 32]));
        assert_eq!(Hash256::from(txid).to_string(), txid.to_string());
    }

    #[test]
    fn test_bucket_key_uses_every_lane() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let tail_only = Hash256::new(bytes);
        assert_eq!(tail_only.bucket_key(), 1u64 << 56);

        bytes[0] = 1;
        assert_eq!(Hash256::new(bytes).bucket_key(), 1 | (1u64 << 56));
    }

    #[test]
    fn test_colliding_bucket_keys_stay_distinct() {
        // Swapping two lanes keeps the XOR fold but changes the digest.
        let mut a = [0u8; 32];
        a[0] = 7;
        let mut b = [0u8; 32];
        b[8] = 7;
        let (a, b) = (Hash256::new(a), Hash256::new(b));

        assert_eq!(a.bucket_key(), b.bucket_key());
        assert_ne!(a, b);

        let set: HashSet<Hash256> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}

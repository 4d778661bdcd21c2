use crate::crypto::hash::Hash256;

pub use bitcoin::block::Header as BlockHeader;

/// A header as reported by the backend, with its position in the backend's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub hash: Hash256,
    pub height: u32,
    pub header: BlockHeader,
}

impl HeaderInfo {
    pub fn new(height: u32, header: BlockHeader) -> Self {
        Self {
            hash: Hash256::from(header.block_hash()),
            height,
            header,
        }
    }

    pub fn prev_hash(&self) -> Hash256 {
        Hash256::from(self.header.prev_blockhash)
    }

    pub fn timestamp(&self) -> u32 {
        self.header.time
    }
}

/// Header on top of `prev` with the given time; the nonce keeps siblings apart.
#[cfg(test)]
pub(crate) fn sample_header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
    use bitcoin::hashes::Hash;
    use bitcoin::{block, CompactTarget, TxMerkleNode};

    BlockHeader {
        version: block::Version::from_consensus(0x2000_0000),
        prev_blockhash: prev.to_block_hash(),
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_info_links_to_parent() {
        let parent = HeaderInfo::new(10, sample_header(Hash256::zero(), 1_700_000_000, 1));
        let child = HeaderInfo::new(11, sample_header(parent.hash, 1_700_000_600, 2));

        assert_eq!(child.prev_hash(), parent.hash);
        assert_eq!(child.timestamp(), 1_700_000_600);
        assert_eq!(child.hash.to_string(), child.header.block_hash().to_string());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let a = HeaderInfo::new(1, sample_header(Hash256::zero(), 0, 0));
        let b = HeaderInfo::new(1, sample_header(Hash256::zero(), 0, 1));

        assert_ne!(a.hash, b.hash);
    }
}

use std::fmt::{self, Display, Formatter};

use primitive_types::U256;

use crate::{crypto::Hash, error::BlockAssemblyError};

/// The largest block body we will assemble. Larger bodies are rejected before hashing.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Identifies a connected peer for the lifetime of its connection. Assigned by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash)]
pub struct PeerId(pub u64);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A currently active peer, as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    /// The total difficulty of the peer's best block, as last reported.
    pub total_difficulty: U256,
    /// Short human-readable identifier, for logs only.
    pub display_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub parent_hash: Hash,
    /// The sealed hash of this header. See [BlockHeader::compute_hash].
    pub hash: Hash,
    pub difficulty: U256,
    pub timestamp: u64,
    pub transactions_root: Hash,
}

impl BlockHeader {
    pub fn genesis() -> BlockHeader {
        BlockHeader {
            number: 0,
            parent_hash: Hash::ZERO,
            hash: Hash::ZERO,
            difficulty: U256::one(),
            timestamp: 0,
            transactions_root: BlockBody::default().transactions_root(),
        }
        .seal()
    }

    /// Hash every field except `hash` itself.
    pub fn compute_hash(&self) -> Hash {
        let mut difficulty = [0u8; 32];
        self.difficulty.to_big_endian(&mut difficulty);
        Hash::builder()
            .with(self.number.to_be_bytes())
            .with(self.parent_hash.as_bytes())
            .with(difficulty)
            .with(self.timestamp.to_be_bytes())
            .with(self.transactions_root.as_bytes())
            .finalize()
    }

    pub fn seal(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    /// Opaque encoded transactions. Their contents are the chain engine's concern.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn transactions_root(&self) -> Hash {
        self.transactions
            .iter()
            .fold(Hash::builder().with(Hash::ZERO.as_bytes()), |root, tx| {
                root.with(Hash::compute([tx]).as_bytes())
            })
            .finalize()
    }

    pub fn size(&self) -> usize {
        self.transactions.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Assemble a block from a header and the body a peer returned for it. The body must match the header's
    /// commitment.
    pub fn from_network(header: BlockHeader, body: BlockBody) -> Result<Block, BlockAssemblyError> {
        let size = body.size();
        if size > MAX_BODY_SIZE {
            return Err(BlockAssemblyError::Oversized {
                number: header.number,
                size,
                limit: MAX_BODY_SIZE,
            });
        }
        let actual = body.transactions_root();
        if actual != header.transactions_root {
            return Err(BlockAssemblyError::TransactionsRootMismatch {
                number: header.number,
                expected: header.transactions_root,
                actual,
            });
        }
        Ok(Block { header, body })
    }

    pub fn genesis() -> Block {
        Block {
            header: BlockHeader::genesis(),
            body: BlockBody::default(),
        }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn transaction_count(&self) -> usize {
        self.body.transactions.len()
    }
}

/// Messages the synchronizer sends to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalMessage {
    /// Ask a peer for its best block number, hash and total difficulty.
    StatusRequest,
    /// Ask a peer for `count` consecutive headers starting at block `from`.
    HeaderRangeRequest { from: u64, count: u64 },
    /// Ask a peer for the bodies of these blocks, in this order.
    BodiesRequest { hashes: Vec<Hash> },
}

impl ExternalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ExternalMessage::StatusRequest => "StatusRequest",
            ExternalMessage::HeaderRangeRequest { .. } => "HeaderRangeRequest",
            ExternalMessage::BodiesRequest { .. } => "BodiesRequest",
        }
    }
}

/// Returns a terse, human-readable summary of a message.
impl Display for ExternalMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExternalMessage::StatusRequest => write!(f, "StatusRequest"),
            ExternalMessage::HeaderRangeRequest { from, count } => {
                write!(f, "HeaderRangeRequest({from}, {count})")
            }
            ExternalMessage::BodiesRequest { hashes } => match (hashes.first(), hashes.last()) {
                (None, _) => write!(f, "BodiesRequest([])"),
                (Some(first), Some(last)) if hashes.len() > 1 => write!(
                    f,
                    "BodiesRequest([{}, ..., {}])",
                    first.short(),
                    last.short()
                ),
                (Some(first), _) => write!(f, "BodiesRequest([{}])", first.short()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use super::*;

    fn child_of(parent: &BlockHeader, body: &BlockBody) -> BlockHeader {
        BlockHeader {
            number: parent.number + 1,
            parent_hash: parent.hash,
            hash: Hash::ZERO,
            difficulty: U256::from(10),
            timestamp: parent.timestamp + 1,
            transactions_root: body.transactions_root(),
        }
        .seal()
    }

    #[test]
    fn sealing() {
        let genesis = BlockHeader::genesis();
        assert!(genesis.is_sealed());

        let mut tampered = child_of(&genesis, &BlockBody::default());
        assert!(tampered.is_sealed());
        tampered.difficulty = U256::from(11);
        assert!(!tampered.is_sealed());
    }

    #[test]
    fn assembly_checks_body_commitment() {
        let genesis = BlockHeader::genesis();
        let body = BlockBody {
            transactions: vec![vec![1, 2, 3], vec![4]],
        };
        let header = child_of(&genesis, &body);

        let block = Block::from_network(header.clone(), body.clone()).unwrap();
        assert_eq!(block.number(), 1);
        assert_eq!(block.parent_hash(), genesis.hash);
        assert_eq!(block.transaction_count(), 2);

        let wrong = BlockBody {
            transactions: vec![vec![1, 2, 3]],
        };
        let err = Block::from_network(header, wrong).unwrap_err();
        assert!(matches!(
            err,
            BlockAssemblyError::TransactionsRootMismatch { number: 1, .. }
        ));
    }

    #[test]
    fn assembly_rejects_oversized_bodies() {
        let body = BlockBody {
            transactions: vec![vec![0; MAX_BODY_SIZE + 1]],
        };
        let header = child_of(&BlockHeader::genesis(), &body);
        let err = Block::from_network(header, body).unwrap_err();
        assert_eq!(err.number(), 1);
        assert!(matches!(err, BlockAssemblyError::Oversized { .. }));
    }

    #[test]
    fn display_is_terse() {
        let a = Hash::compute([b"a"]);
        let b = Hash::compute([b"b"]);
        assert_eq!(
            ExternalMessage::HeaderRangeRequest { from: 1, count: 5 }.to_string(),
            "HeaderRangeRequest(1, 5)"
        );
        assert_eq!(
            ExternalMessage::BodiesRequest { hashes: vec![] }.to_string(),
            "BodiesRequest([])"
        );
        assert_eq!(
            ExternalMessage::BodiesRequest { hashes: vec![a] }.to_string(),
            format!("BodiesRequest([{}])", a.short())
        );
        assert_eq!(
            ExternalMessage::BodiesRequest {
                hashes: vec![a, b, a]
            }
            .to_string(),
            format!("BodiesRequest([{}, ..., {}])", a.short(), a.short())
        );
    }
}

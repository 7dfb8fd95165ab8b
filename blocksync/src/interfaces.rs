//! The collaborators the synchronizer drives but does not own: the chain engine, the peer transport, the header
//! validator and whoever listens for sync events.

use std::fmt::{self, Display, Formatter};

use anyhow::Result;
use primitive_types::U256;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    crypto::Hash,
    message::{Block, BlockHeader, ExternalMessage, PeerId, PeerInfo},
};

/// The local chain's best block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestBlock {
    pub number: u64,
    pub hash: Hash,
    pub total_difficulty: U256,
}

/// What the chain engine did with a block we handed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Connected, and now the head of the best chain.
    ImportedBest,
    /// Connected to a side branch.
    ImportedNotBest,
    /// Already known.
    AlreadyExists,
    /// The parent is unknown, so the block could not be connected.
    NoParent,
    /// Rejected by consensus or structural checks.
    Invalid,
}

impl Display for ImportOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImportOutcome::ImportedBest => write!(f, "imported-best"),
            ImportOutcome::ImportedNotBest => write!(f, "imported-not-best"),
            ImportOutcome::AlreadyExists => write!(f, "already-exists"),
            ImportOutcome::NoParent => write!(f, "no-parent"),
            ImportOutcome::Invalid => write!(f, "invalid"),
        }
    }
}

/// Validates and appends fully assembled blocks.
///
/// `try_import` must be idempotent: the same block may be offered more than once.
pub trait ChainEngine: Send + Sync {
    fn best_block(&self) -> BestBlock;

    /// An `Err` is an unrecognised outcome; the synchronizer logs it and moves on.
    fn try_import(&self, block: &Block) -> Result<ImportOutcome>;
}

/// Maintains the active peer set and delivers messages to peers.
pub trait PeerTransport: Send + Sync {
    fn active_peers(&self) -> Vec<PeerInfo>;

    /// Fire-and-forget. Must not block.
    fn send(&self, peer: PeerId, message: ExternalMessage) -> Result<()>;
}

/// Structural and proof checks on a single header. Pure and stateless.
pub trait HeaderValidator: Send + Sync {
    fn validate(&self, header: &BlockHeader) -> bool;
}

/// Accepts headers which are correctly sealed, carry non-zero difficulty and are not genesis.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealValidator;

impl HeaderValidator for SealValidator {
    fn validate(&self, header: &BlockHeader) -> bool {
        header.number > 0 && !header.difficulty.is_zero() && header.is_sealed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// The local chain has reached the best block known to the network.
    SyncComplete,
}

/// Receives sync events. Delivery is at-least-once.
pub trait SyncEventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

impl SyncEventSink for UnboundedSender<SyncEvent> {
    fn emit(&self, event: SyncEvent) {
        // A closed channel means nobody is listening any more.
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use primitive_types::U256;

    use super::{HeaderValidator, SealValidator};
    use crate::message::{BlockBody, BlockHeader};

    #[test]
    fn seal_validator() {
        let genesis = BlockHeader::genesis();
        assert!(!SealValidator.validate(&genesis));

        let child = BlockHeader {
            number: 1,
            parent_hash: genesis.hash,
            hash: genesis.hash,
            difficulty: U256::from(5),
            timestamp: 1,
            transactions_root: BlockBody::default().transactions_root(),
        };
        assert!(!SealValidator.validate(&child));

        let sealed = child.clone().seal();
        assert!(SealValidator.validate(&sealed));

        let zero_difficulty = BlockHeader {
            difficulty: U256::zero(),
            ..child
        }
        .seal();
        assert!(!SealValidator.validate(&zero_difficulty));
    }
}

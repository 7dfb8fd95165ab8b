use crate::crypto::Hash;

/// Why a (header, body) pair received from the network could not be assembled into a block.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockAssemblyError {
    #[error(
        "transactions root mismatch at block {number}: header commits to {expected}, body hashes to {actual}"
    )]
    TransactionsRootMismatch {
        number: u64,
        expected: Hash,
        actual: Hash,
    },
    #[error("body of block {number} is {size} bytes, limit is {limit}")]
    Oversized {
        number: u64,
        size: usize,
        limit: usize,
    },
}

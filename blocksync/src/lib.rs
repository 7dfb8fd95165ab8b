pub mod block_queue;
pub mod cfg;
pub mod crypto;
pub mod dedup;
pub mod error;
mod in_flight;
pub mod interfaces;
pub mod message;
pub mod network_best;
mod scheduler;
pub mod sim;
pub mod sync;

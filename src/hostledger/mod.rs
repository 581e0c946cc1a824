//! Host-ledger side: N-of-M consensus reading of irreversible blocks and
//! the withdrawal intents found in them.

pub mod consensus;
pub mod ingestor;
pub mod rpc;

pub use consensus::statistical_mode;
pub use ingestor::WithdrawalIngestor;
pub use rpc::HostNodeClient;

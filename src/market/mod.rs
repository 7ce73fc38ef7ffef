pub mod client;
pub mod error;
pub mod protocol;
pub mod state;
pub mod transaction;
pub mod types;

pub use client::MarketClient;
pub use error::MarketError;
pub use protocol::{MarketProtocol, ProtocolOutcome};
pub use state::{TransactionMachine, TransactionState};
pub use transaction::{MarketTransaction, RetryConfig};
pub use types::{DiscoverRequest, DiscoverResponse, FlexibilityOffer};

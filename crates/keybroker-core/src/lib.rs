pub mod catalog;
pub mod config;
pub mod random;

pub use catalog::Catalog;
pub use config::{BrokerConfig, ConnectionEndpoint};
pub use random::EntropyError;

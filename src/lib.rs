// Library interface for the Majordomo broker
// The binaries, benchmarks and integration tests build on these modules

pub mod broker;
pub mod error;

pub use broker::{AsyncClient, Broker, BrokerConfig, BrokerHandle, MdpWorker, SyncClient};
pub use error::{BrokerError, ClientError};

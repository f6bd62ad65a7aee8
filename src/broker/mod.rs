//! Majordomo service broker
//!
//! Clients send requests for named services; workers announce services and
//! answer them. The broker sits in between, queueing requests per service in
//! RBAC priority order and handing them to idle workers.
//!
//! - `protocol`: MDPC01/MDPW01 message codec
//! - `transport`: endpoints, stream framing and the router socket
//! - `rbac`: role ranks and per-role priority queues
//! - `registry`: worker, service and client bookkeeping
//! - `server`: the broker event loop
//! - `worker_pool`: in-process service threads
//! - `client`: synchronous and asynchronous clients
//! - `worker`: external worker library
//! - `config`: `.mdbrokerrc` / environment configuration

pub mod protocol;
pub mod transport;
pub mod rbac;
pub mod registry;
pub mod server;
pub mod worker_pool;
pub mod client;
pub mod worker;
pub mod config;

pub use protocol::{ClientMessage, Frame, Message, Protocol, WorkerCommand, WorkerMessage};
pub use transport::Endpoint;
pub use rbac::RbacRoleSet;
pub use registry::BrokerStats;
pub use server::{Broker, BrokerHandle, MMI_DNS, MMI_ECHO, MMI_SERVICE};
pub use worker_pool::RequestHandler;
pub use client::{AsyncClient, SyncClient};
pub use worker::{MdpWorker, WorkerRequest};
pub use config::BrokerConfig;

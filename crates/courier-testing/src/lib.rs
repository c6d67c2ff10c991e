//! Test infrastructure for courier.
//!
//! Provides [`MockBroker`], an in-memory broker that plugs into
//! [`courier_broker::BrokerHandle`] in place of a real AMQP server, so
//! topology, retry and consumer behavior can be exercised deterministically.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod broker;

pub use broker::{MockBroker, MockMessage, Operation, OperationKind, SettlementCounts};

#![warn(missing_docs)]
//! DoIP to CAN diagnostic gateway
//!
//! This library bridges diagnostic testers speaking DoIP over TCP to ECUs
//! reachable on CAN buses. Each diagnostic request received from a tester is
//! routed by its target logical address to a CAN request identifier, sent on
//! the bus, and the ECU response is relayed back once it arrives.
//!
//! It enables async operations thanks to tokio framework.
//!
//! The main pieces are :
//! - [`Gateway`], the core, routing requests and correlating responses.
//! - [`GatewayServer`], accepting tester connections for a [`Gateway`].
//! - [`DoIpTester`], the tester side of a connection.
//! - [`BusTransport`], the seam to the CAN buses. [`VirtualBus`] and
//! [`SimulatedEcu`] provide an in-memory bus with simulated ECUs.
//!
//! A runnable gateway is provided in the demos directory.

mod bus;
mod can;
mod config;
mod connection;
mod diagnostic_message;
mod doip_tcp;
mod ecu;
mod gateway;
mod message;
mod nrc;
mod router;
mod tracker;
mod uds;

use thiserror::Error;

#[derive(Debug, Error)]
/// A gateway error
pub enum GatewayError {
    /// A TCP connection error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    /// A TCP connection timeout.
    #[error("connection timed out")]
    ConnectionTimeout,
    /// No reply from the gateway in the allotted time.
    #[error("reply timed out")]
    ReplyTimeout,
    /// A received DoIP message is inconsistent.
    #[error("DoIP protocol error: {0}")]
    Protocol(#[from] DoIpCodecError),
    /// A CAN message is inconsistent.
    #[error("CAN protocol error: {0}")]
    Can(#[from] CanCodecError),
    /// A message cannot be routed.
    #[error(transparent)]
    Routing(#[from] RouterError),
    /// A response matches no request.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// A bus cannot be used.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    /// No bus of that name is attached.
    #[error("unknown bus {0}")]
    UnknownBus(String),
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A tester received another reply than the one it expected.
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(GatewayReply),
}

pub use crate::bus::{BusError, BusNode, BusTransport, NodeSender, VirtualBus};
pub use crate::can::{CanCodecError, CanFrame, CanMessage, Reassembler};
pub use crate::config::{ConfigError, GatewayConfig, Timings};
pub use crate::diagnostic_message::{
    decode_reply, decode_request, encode_reply, encode_request, split_message, DoIpCodecError,
    DoIpHeader,
};
pub use crate::doip_tcp::{DoIpTester, GatewayServer};
pub use crate::ecu::{EcuHandler, SimulatedEcu};
pub use crate::gateway::{Gateway, GatewayState};
pub use crate::message::{
    CanId, DiagnosticNack, DiagnosticNackCode, DiagnosticRequest, DiagnosticResponse,
    GatewayReply, GenericNackCode, LogicalAddress, PayloadType,
};
pub use crate::nrc::NegativeResponseCode;
pub use crate::router::{AddressRouter, RouterError, RoutingEntry, DEFAULT_BUS};
pub use crate::tracker::{
    CorrelationKey, Outcome, PendingTransaction, Transaction, TransactionError,
    TransactionState, TransactionTracker,
};
pub use crate::uds::{read_data_by_identifier, request_service, READ_DATA_BY_IDENTIFIER};

/// Build a [`Gateway`] from `config`, attaching the named buses.
///
/// Every bus used by a route must be provided.
///
/// # Errors
///
/// - [`GatewayError::Config`] if the routing table is inconsistent.
/// - [`GatewayError::UnknownBus`] if a route uses a bus missing from `buses`.
pub fn build_gateway<I>(config: &GatewayConfig, buses: I) -> Result<Gateway, GatewayError>
where
    I: IntoIterator<Item = (String, std::sync::Arc<dyn BusTransport>)>,
{
    let router = config.router()?;
    let buses: std::collections::HashMap<_, _> = buses.into_iter().collect();
    if let Some(missing) = router.buses().into_iter().find(|b| !buses.contains_key(*b)) {
        return Err(GatewayError::UnknownBus(missing.to_string()));
    }
    Ok(buses
        .into_iter()
        .fold(Gateway::new(router, config.timings()), |gateway, (name, bus)| {
            gateway.with_bus(name, bus)
        }))
}

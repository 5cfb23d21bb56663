//! Logical address to CAN route resolution.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{CanId, LogicalAddress};

/// Bus a route uses when the configuration names none.
pub const DEFAULT_BUS: &str = "can0";

fn default_bus() -> String {
    DEFAULT_BUS.to_string()
}

/// Where the diagnostic requests for one logical address go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    /// ECU logical address.
    pub logical_address: LogicalAddress,
    /// CAN identifier of requests sent to the ECU.
    pub request_id: CanId,
    /// CAN identifier of the ECU responses.
    pub response_id: CanId,
    /// Name of the bus the ECU is attached to.
    #[serde(default = "default_bus")]
    pub bus: String,
}

impl RoutingEntry {
    /// Route on the default bus.
    pub fn new(logical_address: LogicalAddress, request_id: CanId, response_id: CanId) -> Self {
        RoutingEntry {
            logical_address,
            request_id,
            response_id,
            bus: default_bus(),
        }
    }

    /// Same route on another bus.
    pub fn on_bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = bus.into();
        self
    }
}

/// Routing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// No route for the address.
    #[error("unknown logical address 0x{0:04x}")]
    UnknownAddress(LogicalAddress),
    /// Two routes for the same address.
    #[error("logical address 0x{0:04x} is routed twice")]
    DuplicateAddress(LogicalAddress),
    /// Two routes answering on the same identifier of the same bus.
    #[error("response identifier 0x{response_id:03x} is used twice on bus {bus}")]
    DuplicateResponseId {
        /// Bus name.
        bus: String,
        /// Shared identifier.
        response_id: CanId,
    },
    /// No route answers on this identifier of this bus.
    #[error("no route answers on 0x{response_id:03x} of bus {bus}")]
    UnknownResponseId {
        /// Bus name.
        bus: String,
        /// Identifier of the unattributed response.
        response_id: CanId,
    },
    /// A route using the same identifier for requests and responses.
    #[error("route 0x{0:04x} uses the same identifier for requests and responses")]
    IdentifierClash(LogicalAddress),
}

/// The routing table, immutable once built.
#[derive(Debug, Default)]
pub struct AddressRouter {
    routes: HashMap<LogicalAddress, RoutingEntry>,
    by_response: HashMap<(String, CanId), LogicalAddress>,
}

impl AddressRouter {
    /// Build the table, refusing ambiguous routes.
    pub fn new(entries: impl IntoIterator<Item = RoutingEntry>) -> Result<Self, RouterError> {
        let mut router = AddressRouter::default();
        for entry in entries {
            if entry.request_id == entry.response_id {
                return Err(RouterError::IdentifierClash(entry.logical_address));
            }
            if router.routes.contains_key(&entry.logical_address) {
                return Err(RouterError::DuplicateAddress(entry.logical_address));
            }
            let response_key = (entry.bus.clone(), entry.response_id);
            if router.by_response.contains_key(&response_key) {
                return Err(RouterError::DuplicateResponseId {
                    bus: entry.bus,
                    response_id: entry.response_id,
                });
            }
            debug!(
                target: "router",
                "0x{:04x} -> {} 0x{:03x}/0x{:03x}",
                entry.logical_address, entry.bus, entry.request_id, entry.response_id
            );
            router.by_response.insert(response_key, entry.logical_address);
            router.routes.insert(entry.logical_address, entry);
        }
        Ok(router)
    }

    /// Route of a logical address.
    pub fn resolve(&self, logical_address: LogicalAddress) -> Result<&RoutingEntry, RouterError> {
        self.routes
            .get(&logical_address)
            .ok_or(RouterError::UnknownAddress(logical_address))
    }

    /// Route whose ECU answers on `response_id` of `bus`.
    pub fn resolve_response(&self, bus: &str, response_id: CanId) -> Result<&RoutingEntry, RouterError> {
        self.by_response
            .get(&(bus.to_string(), response_id))
            .and_then(|la| self.routes.get(la))
            .ok_or_else(|| RouterError::UnknownResponseId {
                bus: bus.to_string(),
                response_id,
            })
    }

    /// All routes, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.routes.values()
    }

    /// Names of the buses used by at least one route.
    pub fn buses(&self) -> Vec<&str> {
        let mut buses: Vec<&str> = self.routes.values().map(|r| r.bus.as_str()).collect();
        buses.sort_unstable();
        buses.dedup();
        buses
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

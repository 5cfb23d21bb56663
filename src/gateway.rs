//! Gateway core.
//!
//! Every inbound diagnostic request walks the same states:
//!
//! ```text
//! Idle -> Routing -> AwaitingBusResponse -> Completing -> Idle
//! ```
//!
//! Requests that cannot be routed skip the bus and go straight from
//! `Routing` to `Completing`. Each request carries its own state, so any
//! number of requests may be in flight at once, as long as their correlation
//! keys differ.
//!
//! Responses are read from the buses by one listener task per bus (see
//! [`Gateway::spawn_bus_listeners`]), which reassembles them and hands them to
//! the [`TransactionTracker`].

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::bus::{BusError, BusTransport};
use crate::can::{CanFrame, CanMessage, Reassembler};
use crate::config::Timings;
use crate::diagnostic_message::decode_request;
use crate::message::{
    CanId, DiagnosticNack, DiagnosticNackCode, DiagnosticRequest, DiagnosticResponse,
    GatewayReply,
};
use crate::nrc::NegativeResponseCode;
use crate::router::AddressRouter;
use crate::tracker::{CorrelationKey, Outcome, PendingTransaction, Transaction, TransactionTracker};
use crate::GatewayError;

/// Where a request stands in the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Not started, or done.
    Idle,
    /// Looking up the route and opening the transaction.
    Routing,
    /// Sent on the bus, waiting for the ECU.
    AwaitingBusResponse,
    /// Building the reply to the tester.
    Completing,
}

fn transition(key: &CorrelationKey, from: GatewayState, to: GatewayState) {
    trace!(target: "gateway", "{}: {:?} -> {:?}", key, from, to);
}

struct BusLink {
    transport: Arc<dyn BusTransport>,
    // Frames of one segmented message must not interleave with another's.
    sending: Mutex<()>,
}

impl BusLink {
    async fn send_all(&self, frames: Vec<CanFrame>) -> Result<(), BusError> {
        let _sending = self.sending.lock().await;
        for frame in frames {
            self.transport.send(frame).await?;
        }
        Ok(())
    }
}

/// The DoIP to CAN gateway.
pub struct Gateway {
    router: AddressRouter,
    tracker: TransactionTracker,
    buses: HashMap<String, BusLink>,
    timings: Timings,
}

impl Gateway {
    /// A gateway routing with `router`, without any bus yet.
    pub fn new(router: AddressRouter, timings: Timings) -> Self {
        Gateway {
            router,
            tracker: TransactionTracker::new(),
            buses: HashMap::new(),
            timings,
        }
    }

    /// Attach `transport` as the bus called `name`.
    pub fn with_bus(mut self, name: impl Into<String>, transport: Arc<dyn BusTransport>) -> Self {
        let name = name.into();
        info!(target: "gateway", "Bus {} attached", name);
        self.buses.insert(
            name,
            BusLink {
                transport,
                sending: Mutex::new(()),
            },
        );
        self
    }

    /// The routing table.
    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    /// The live transactions.
    pub fn tracker(&self) -> &TransactionTracker {
        &self.tracker
    }

    /// The timings in use.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Handle one complete DoIP message, as read from a tester.
    ///
    /// Messages that cannot be decoded are answered with a generic negative
    /// acknowledge.
    ///
    /// # Errors
    ///
    /// See [`handle_request()`](Self::handle_request).
    pub async fn handle_message(&self, message: &[u8]) -> Result<GatewayReply, GatewayError> {
        match decode_request(message) {
            Ok(request) => self.handle_request(&request).await,
            Err(e) => {
                warn!(target: "gateway", "Rejecting DoIP message: {}", e);
                Ok(GatewayReply::GenericNack(e.nack_code()))
            }
        }
    }

    /// Route `request` to its ECU and wait for the answer.
    ///
    /// Exactly one reply is produced per request:
    /// - the ECU response, positive or negative,
    /// - a [`BusyRepeatRequest`](NegativeResponseCode::BusyRepeatRequest)
    ///   negative response if the same request is already in flight,
    /// - a [`NoResponseFromSubnet`](NegativeResponseCode::NoResponseFromSubnet)
    ///   negative response if the ECU stays silent past the response timeout,
    /// - a diagnostic negative acknowledge if the target cannot be routed.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Bus`] if the request cannot be put on the bus. The
    /// transaction is dropped and nothing is waited for.
    pub async fn handle_request(
        &self,
        request: &DiagnosticRequest,
    ) -> Result<GatewayReply, GatewayError> {
        let key = CorrelationKey::from(request);
        transition(&key, GatewayState::Idle, GatewayState::Routing);

        let route = match self.router.resolve(request.target_address) {
            Ok(route) => route,
            Err(e) => {
                warn!(target: "gateway", "{}: {}", key, e);
                return Ok(refuse(&key, request, DiagnosticNackCode::UnknownTargetAddress));
            }
        };
        let Some(link) = self.buses.get(&route.bus) else {
            error!(target: "gateway", "{}: bus {} is not attached", key, route.bus);
            return Ok(refuse(&key, request, DiagnosticNackCode::UnknownNetwork));
        };
        let frames = match CanMessage::request(route.request_id, request).to_frames() {
            Ok(frames) => frames,
            Err(e) => {
                error!(target: "gateway", "{}: {}", key, e);
                return Ok(refuse(&key, request, DiagnosticNackCode::TransportProtocolError));
            }
        };

        let deadline = Instant::now() + self.timings.response_timeout;
        let pending = match self.tracker.begin(key, deadline) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(target: "gateway", "{}", e);
                transition(&key, GatewayState::Routing, GatewayState::Completing);
                let reply = GatewayReply::Response(DiagnosticResponse::negative(
                    request,
                    NegativeResponseCode::BusyRepeatRequest,
                ));
                transition(&key, GatewayState::Completing, GatewayState::Idle);
                return Ok(reply);
            }
        };

        debug!(
            target: "gateway",
            "{}: routed to {} 0x{:03x}", key, route.bus, route.request_id
        );
        if let Err(e) = link.send_all(frames).await {
            error!(target: "gateway", "{}: bus {}: {}", key, route.bus, e);
            self.tracker.abandon(&key);
            transition(&key, GatewayState::Routing, GatewayState::Idle);
            return Err(e.into());
        }
        transition(&key, GatewayState::Routing, GatewayState::AwaitingBusResponse);

        let outcome = self.await_outcome(pending).await;
        transition(&key, GatewayState::AwaitingBusResponse, GatewayState::Completing);
        let reply = match outcome {
            Outcome::Resolved(mut response) => {
                response.target_address = request.source_address;
                GatewayReply::Response(response)
            }
            Outcome::TimedOut => {
                warn!(
                    target: "gateway",
                    "{}: no response within {:?}", key, self.timings.response_timeout
                );
                GatewayReply::Response(DiagnosticResponse::negative(
                    request,
                    NegativeResponseCode::NoResponseFromSubnet,
                ))
            }
        };
        transition(&key, GatewayState::Completing, GatewayState::Idle);
        Ok(reply)
    }

    async fn await_outcome(&self, pending: PendingTransaction) -> Outcome {
        let PendingTransaction {
            transaction,
            mut outcome,
        } = pending;
        let mut deadline = transaction.deadline;
        loop {
            match time::timeout_at(deadline, &mut outcome).await {
                Ok(Ok(outcome)) => return outcome,
                // The tracker only drops a notifier by abandoning the transaction.
                Ok(Err(_)) => return Outcome::TimedOut,
                Err(_) => {
                    self.tracker.expire(Instant::now());
                    match self.tracker.deadline(&transaction.key) {
                        // Extended by a pending response of the ECU.
                        Some(extended) => deadline = extended,
                        // Expired or resolved: the notifier is sent or dropped.
                        None => return (&mut outcome).await.unwrap_or(Outcome::TimedOut),
                    }
                }
            }
        }
    }

    /// Hand a reassembled ECU response read on `bus` to the request waiting
    /// for it.
    ///
    /// The response either echoes the service of a live request, or follows
    /// the UDS convention (service + 0x40, or 0x7F for a negative response).
    /// A [`ResponsePending`](NegativeResponseCode::ResponsePending) negative
    /// response does not complete the request: its deadline is pushed back by
    /// the response timeout instead.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Routing`] if no route answers on the message
    ///   identifier.
    /// - [`GatewayError::Can`] if the message is not a response.
    /// - [`GatewayError::Transaction`] if no request is waiting for it, for
    ///   example because it already timed out.
    pub fn dispatch(&self, bus: &str, message: CanMessage) -> Result<Transaction, GatewayError> {
        let route = self.router.resolve_response(bus, message.can_id)?;
        let echoed = CorrelationKey {
            target_address: route.logical_address,
            service_id: message.service_id,
            identifier: message.identifier,
        };
        let response = if self.tracker.is_live(&echoed) {
            message.into_echoed_response(route.logical_address)
        } else {
            message.into_response(route.logical_address)?
        };
        let key = CorrelationKey {
            target_address: route.logical_address,
            service_id: response.service_id,
            identifier: response.identifier,
        };
        if response.nrc == Some(NegativeResponseCode::ResponsePending) {
            let deadline = Instant::now() + self.timings.response_timeout;
            debug!(target: "gateway", "{}: response pending", key);
            return Ok(self.tracker.extend(&key, deadline)?);
        }
        Ok(self.tracker.complete(&key, response)?)
    }

    /// Read responses from the bus called `bus` until it closes.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownBus`] if no such bus is attached.
    /// - [`GatewayError::Bus`] once the bus fails.
    pub async fn listen(&self, bus: &str) -> Result<(), GatewayError> {
        let link = self
            .buses
            .get(bus)
            .ok_or_else(|| GatewayError::UnknownBus(bus.to_string()))?;
        let mut reassemblers: HashMap<CanId, Reassembler> = self
            .router
            .entries()
            .filter(|route| route.bus == bus)
            .map(|route| (route.response_id, Reassembler::new(route.response_id)))
            .collect();
        info!(
            target: "gateway",
            "Listening on bus {} for {} ECUs", bus, reassemblers.len()
        );

        loop {
            let frame = link.transport.receive().await?;
            let Some(reassembler) = reassemblers.get_mut(&frame.id) else {
                trace!(target: "gateway", "{}: ignoring 0x{:03x}", bus, frame.id);
                continue;
            };
            match reassembler.push(&frame) {
                Ok(Some(message)) => {
                    if let Err(e) = self.dispatch(bus, message) {
                        warn!(target: "gateway", "{}: dropping response: {}", bus, e);
                    }
                }
                Ok(None) => (),
                Err(e) => warn!(target: "gateway", "{}: 0x{:03x}: {}", bus, frame.id, e),
            }
        }
    }

    /// Spawn one [`listen()`](Self::listen) task per attached bus.
    pub fn spawn_bus_listeners(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.buses
            .keys()
            .cloned()
            .map(|bus| {
                let gateway = self.clone();
                tokio::spawn(async move {
                    match gateway.listen(&bus).await {
                        Ok(()) | Err(GatewayError::Bus(BusError::Closed)) => {
                            info!(target: "gateway", "Bus {} closed", bus)
                        }
                        Err(e) => error!(target: "gateway", "Bus {} listener: {}", bus, e),
                    }
                })
            })
            .collect()
    }
}

fn refuse(key: &CorrelationKey, request: &DiagnosticRequest, code: DiagnosticNackCode) -> GatewayReply {
    transition(key, GatewayState::Routing, GatewayState::Completing);
    let reply = GatewayReply::DiagnosticNack(DiagnosticNack::refuse(request, code));
    transition(key, GatewayState::Completing, GatewayState::Idle);
    reply
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::VirtualBus;
    use crate::ecu::SimulatedEcu;
    use crate::router::RoutingEntry;
    use crate::can::CanCodecError;
    use crate::tracker::{TransactionError, TransactionState};

    const VIN: &[u8] = b"1HGBH41JXMN109186";

    fn door() -> RoutingEntry {
        RoutingEntry::new(0x0205, 0x600, 0x601)
    }

    fn engine() -> RoutingEntry {
        RoutingEntry::new(0x0401, 0x7e0, 0x7e8)
    }

    fn request(target_address: u16, identifier: u16) -> DiagnosticRequest {
        DiagnosticRequest {
            source_address: 0x0e80,
            target_address,
            service_id: 0x22,
            flags: 0,
            identifier,
        }
    }

    fn door_answers(_service: u8, identifier: u16) -> Result<Vec<u8>, NegativeResponseCode> {
        match identifier {
            0xf190 => Ok(VIN.to_vec()),
            0xf18c => Ok(b"SN-42".to_vec()),
            _ => Err(NegativeResponseCode::RequestOutOfRange),
        }
    }

    fn gateway(routes: Vec<RoutingEntry>, bus: &Arc<VirtualBus>, timeout: Duration) -> Arc<Gateway> {
        let timings = Timings {
            response_timeout: timeout,
            ..Timings::default()
        };
        let gateway = Gateway::new(AddressRouter::new(routes).unwrap(), timings)
            .with_bus("can0", bus.clone());
        let gateway = Arc::new(gateway);
        gateway.spawn_bus_listeners();
        gateway
    }

    fn positive(reply: GatewayReply) -> DiagnosticResponse {
        match reply {
            GatewayReply::Response(rsp) if rsp.is_positive() => rsp,
            other => panic!("expected a positive response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn forwards_request_and_relays_response() {
        let bus = Arc::new(VirtualBus::new());
        let mut sniffer = bus.attach();
        tokio::spawn(SimulatedEcu::for_route(&door(), door_answers).run(bus.attach()));
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));

        let reply = gateway.handle_request(&request(0x0205, 0xf190)).await.unwrap();
        let rsp = positive(reply);
        assert_eq!(rsp.source_address, 0x0205);
        assert_eq!(rsp.target_address, 0x0e80);
        assert_eq!(rsp.service_id, 0x22);
        assert_eq!(rsp.identifier, 0xf190);
        assert_eq!(rsp.payload, VIN);

        let sent = sniffer.try_receive().unwrap();
        assert_eq!(sent.id, 0x600);
        assert_eq!(sent.data, vec![0x03, 0x22, 0xf1, 0x90]);
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn unknown_target_never_reaches_the_bus() {
        let bus = Arc::new(VirtualBus::new());
        let mut sniffer = bus.attach();
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));

        let reply = gateway.handle_request(&request(0x0300, 0xf190)).await.unwrap();
        assert_eq!(
            reply,
            GatewayReply::DiagnosticNack(DiagnosticNack {
                source_address: 0x0300,
                target_address: 0x0e80,
                code: DiagnosticNackCode::UnknownTargetAddress,
            })
        );
        assert!(sniffer.try_receive().is_none());
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn route_on_missing_bus_is_refused() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![engine().on_bus("powertrain")], &bus, Duration::from_secs(1));
        let reply = gateway.handle_request(&request(0x0401, 0xf190)).await.unwrap();
        assert!(matches!(
            reply,
            GatewayReply::DiagnosticNack(DiagnosticNack {
                code: DiagnosticNackCode::UnknownNetwork,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn each_route_uses_its_request_id() {
        let routes = vec![door(), engine(), RoutingEntry::new(0x0206, 0x602, 0x603)];
        let bus = Arc::new(VirtualBus::new());
        let mut sniffer = bus.attach();
        for route in &routes {
            tokio::spawn(SimulatedEcu::for_route(route, door_answers).run(bus.attach()));
        }
        let gateway = gateway(routes.clone(), &bus, Duration::from_secs(1));

        for route in &routes {
            let reply = gateway
                .handle_request(&request(route.logical_address, 0xf18c))
                .await
                .unwrap();
            assert_eq!(positive(reply).source_address, route.logical_address);
            let sent = sniffer.try_receive().unwrap();
            assert_eq!(sent.id, route.request_id);
            assert_eq!(sent.data, vec![0x03, 0x22, 0xf1, 0x8c]);
        }
    }

    #[tokio::test]
    async fn concurrent_ecus_are_not_cross_matched() {
        let bus = Arc::new(VirtualBus::new());
        tokio::spawn(
            SimulatedEcu::for_route(&door(), |_, _| Ok(b"door".to_vec()))
                .with_delay(Duration::from_millis(50))
                .run(bus.attach()),
        );
        tokio::spawn(SimulatedEcu::for_route(&engine(), |_, _| Ok(b"engine".to_vec())).run(bus.attach()));
        let gateway = gateway(vec![door(), engine()], &bus, Duration::from_secs(1));

        let (door_vin, engine_vin) = (request(0x0205, 0xf190), request(0x0401, 0xf190));
        let (slow, fast) = tokio::join!(
            gateway.handle_request(&door_vin),
            gateway.handle_request(&engine_vin),
        );
        assert_eq!(positive(slow.unwrap()).payload, b"door");
        assert_eq!(positive(fast.unwrap()).payload, b"engine");
    }

    #[tokio::test]
    async fn late_response_still_matches_its_request() {
        let bus = Arc::new(VirtualBus::new());
        tokio::spawn(
            SimulatedEcu::for_route(&door(), door_answers)
                .with_delay_for(0xf190, Duration::from_millis(50))
                .run(bus.attach()),
        );
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));

        let (vin_request, serial_request) = (request(0x0205, 0xf190), request(0x0205, 0xf18c));
        let (vin, serial) = tokio::join!(
            gateway.handle_request(&vin_request),
            gateway.handle_request(&serial_request),
        );
        assert_eq!(positive(vin.unwrap()).payload, VIN);
        assert_eq!(positive(serial.unwrap()).payload, b"SN-42");
    }

    #[tokio::test]
    async fn ecu_negative_response_is_relayed() {
        let bus = Arc::new(VirtualBus::new());
        tokio::spawn(SimulatedEcu::for_route(&door(), door_answers).run(bus.attach()));
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));

        let reply = gateway.handle_request(&request(0x0205, 0x1234)).await.unwrap();
        assert_eq!(
            reply,
            GatewayReply::Response(DiagnosticResponse::negative(
                &request(0x0205, 0x1234),
                NegativeResponseCode::RequestOutOfRange
            ))
        );
    }

    #[tokio::test]
    async fn silent_ecu_times_out() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![door()], &bus, Duration::from_millis(50));

        let reply = gateway.handle_request(&request(0x0205, 0xf190)).await.unwrap();
        assert_eq!(
            reply,
            GatewayReply::Response(DiagnosticResponse::negative(
                &request(0x0205, 0xf190),
                NegativeResponseCode::NoResponseFromSubnet
            ))
        );
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn request_in_flight_is_not_repeated() {
        let bus = Arc::new(VirtualBus::new());
        let mut sniffer = bus.attach();
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));
        let key = CorrelationKey::from(&request(0x0205, 0xf190));
        let _first = gateway
            .tracker()
            .begin(key, Instant::now() + Duration::from_secs(1))
            .unwrap();

        let reply = gateway.handle_request(&request(0x0205, 0xf190)).await.unwrap();
        assert_eq!(
            reply,
            GatewayReply::Response(DiagnosticResponse::negative(
                &request(0x0205, 0xf190),
                NegativeResponseCode::BusyRepeatRequest
            ))
        );
        assert!(sniffer.try_receive().is_none());
        assert_eq!(gateway.tracker().len(), 1);
    }

    #[tokio::test]
    async fn bus_failure_is_reported_and_forgotten() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));
        bus.set_failing(true);

        let err = gateway
            .handle_request(&request(0x0205, 0xf190))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Bus(BusError::SendFailed(_))));
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn unsolicited_response_is_dropped() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));
        let message = CanMessage::positive_response(0x601, 0x22, 0xf190, VIN.to_vec());
        let key = CorrelationKey::from(&request(0x0205, 0xf190));
        assert!(matches!(
            gateway.dispatch("can0", message),
            Err(GatewayError::Transaction(TransactionError::UnknownTransaction(k))) if k == key
        ));
        let stray = CanMessage::positive_response(0x7e8, 0x22, 0xf190, vec![]);
        assert!(matches!(
            gateway.dispatch("can0", stray),
            Err(GatewayError::Routing(_))
        ));
    }

    #[tokio::test]
    async fn echoed_service_response_completes_the_request() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));
        let vin_request = request(0x0205, 0xf190);
        let echo = CanMessage {
            can_id: 0x601,
            service_id: 0x22,
            identifier: 0xf190,
            data: VIN.to_vec(),
        };
        assert!(matches!(
            gateway.dispatch("can0", echo.clone()),
            Err(GatewayError::Can(CanCodecError::InvalidResponseService(0x22)))
        ));

        let waiting = gateway.handle_request(&vin_request);
        let answering = async {
            while !gateway.tracker().is_live(&CorrelationKey::from(&vin_request)) {
                tokio::task::yield_now().await;
            }
            gateway.dispatch("can0", echo).unwrap()
        };
        let (reply, done) = tokio::join!(waiting, answering);
        assert_eq!(done.state, TransactionState::Resolved);
        let rsp = positive(reply.unwrap());
        assert_eq!(rsp.service_id, 0x22);
        assert_eq!(rsp.target_address, 0x0e80);
        assert_eq!(rsp.payload, VIN);
    }

    #[tokio::test]
    async fn echoing_ecu_is_relayed() {
        let bus = Arc::new(VirtualBus::new());
        tokio::spawn(
            SimulatedEcu::for_route(&door(), door_answers)
                .echoing()
                .run(bus.attach()),
        );
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));

        let reply = gateway.handle_request(&request(0x0205, 0xf190)).await.unwrap();
        assert_eq!(positive(reply).payload, VIN);
        // Refusals still follow the negative response convention.
        let reply = gateway.handle_request(&request(0x0205, 0x1234)).await.unwrap();
        assert_eq!(
            reply,
            GatewayReply::Response(DiagnosticResponse::negative(
                &request(0x0205, 0x1234),
                NegativeResponseCode::RequestOutOfRange
            ))
        );
    }

    #[tokio::test]
    async fn response_pending_extends_the_deadline() {
        let bus = Arc::new(VirtualBus::new());
        let mut ecu = bus.attach();
        tokio::spawn(async move {
            let frame = ecu.receive().await.unwrap();
            assert_eq!(frame.id, 0x600);
            time::sleep(Duration::from_millis(120)).await;
            let pending = CanMessage::negative_response(
                0x601,
                0x22,
                0xf190,
                NegativeResponseCode::ResponsePending,
            );
            for frame in pending.to_frames().unwrap() {
                ecu.send(frame).await.unwrap();
            }
            // Past the first deadline, within the extended one.
            time::sleep(Duration::from_millis(150)).await;
            let answer = CanMessage::positive_response(0x601, 0x22, 0xf190, VIN.to_vec());
            for frame in answer.to_frames().unwrap() {
                ecu.send(frame).await.unwrap();
            }
        });
        let gateway = gateway(vec![door()], &bus, Duration::from_millis(200));

        let reply = gateway.handle_request(&request(0x0205, 0xf190)).await.unwrap();
        assert_eq!(positive(reply).payload, VIN);
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn undecodable_message_gets_generic_nack() {
        let bus = Arc::new(VirtualBus::new());
        let gateway = gateway(vec![door()], &bus, Duration::from_secs(1));
        let bad_version = [0x02u8, 0x02, 0x80, 0x01, 0, 0, 0, 8, 0x0e, 0x80, 0x02, 0x05, 0x22, 0, 0xf1, 0x90];
        assert_eq!(
            gateway.handle_message(&bad_version).await.unwrap(),
            GatewayReply::GenericNack(crate::message::GenericNackCode::IncorrectPatternFormat)
        );
        assert_eq!(
            gateway.handle_message(&[0x02, 0xfd, 0x80]).await.unwrap(),
            GatewayReply::GenericNack(crate::message::GenericNackCode::InvalidPayloadLength)
        );
    }
}

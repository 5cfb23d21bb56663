//! Simulated ECU, answering diagnostic requests on a [`VirtualBus`].
//!
//! The simulator only handles the bus side: it reassembles requests sent on
//! its request identifier, asks its handler for an answer and sends the
//! segmented response on its response identifier. What the answer is belongs
//! to the handler.
//!
//! [`VirtualBus`]: crate::bus::VirtualBus

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time;

use crate::bus::{BusError, BusNode};
use crate::can::{CanMessage, Reassembler};
use crate::message::CanId;
use crate::nrc::NegativeResponseCode;
use crate::router::RoutingEntry;

/// Answer of an ECU to a service/identifier pair.
pub type EcuHandler =
    Arc<dyn Fn(u8, u16) -> Result<Vec<u8>, NegativeResponseCode> + Send + Sync>;

/// A simulated ECU.
pub struct SimulatedEcu {
    request_id: CanId,
    response_id: CanId,
    handler: EcuHandler,
    delay: Duration,
    delays: HashMap<u16, Duration>,
    echoing: bool,
}

impl SimulatedEcu {
    /// ECU listening on `request_id` and answering on `response_id`.
    pub fn new<F>(request_id: CanId, response_id: CanId, handler: F) -> Self
    where
        F: Fn(u8, u16) -> Result<Vec<u8>, NegativeResponseCode> + Send + Sync + 'static,
    {
        SimulatedEcu {
            request_id,
            response_id,
            handler: Arc::new(handler),
            delay: Duration::ZERO,
            delays: HashMap::new(),
            echoing: false,
        }
    }

    /// ECU at the bus end of `route`.
    pub fn for_route<F>(route: &RoutingEntry, handler: F) -> Self
    where
        F: Fn(u8, u16) -> Result<Vec<u8>, NegativeResponseCode> + Send + Sync + 'static,
    {
        Self::new(route.request_id, route.response_id, handler)
    }

    /// Answer every request after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer requests for `identifier` after `delay`.
    pub fn with_delay_for(mut self, identifier: u16, delay: Duration) -> Self {
        self.delays.insert(identifier, delay);
        self
    }

    /// Answer positively with the request service byte, instead of the UDS
    /// positive response service.
    pub fn echoing(mut self) -> Self {
        self.echoing = true;
        self
    }

    /// Serve requests until the bus closes.
    ///
    /// Requests are answered concurrently; the frames of one response are
    /// never interleaved with the frames of another.
    pub async fn run(self, mut node: BusNode) -> Result<(), BusError> {
        info!(
            target: "ecu",
            "ECU 0x{:03x}/0x{:03x} listening", self.request_id, self.response_id
        );
        let sender = node.sender();
        let (reply_tx, mut reply_rx) = mpsc::channel::<CanMessage>(64);
        tokio::spawn(async move {
            while let Some(response) = reply_rx.recv().await {
                let frames = match response.to_frames() {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(target: "ecu", "0x{:03x}: {}", response.can_id, e);
                        continue;
                    }
                };
                for frame in frames {
                    if sender.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut reassembler = Reassembler::new(self.request_id);
        loop {
            let frame = match node.receive().await {
                Ok(frame) => frame,
                Err(BusError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            if frame.id != self.request_id {
                continue;
            }
            match reassembler.push(&frame) {
                Ok(Some(request)) => self.spawn_answer(request, reply_tx.clone()),
                Ok(None) => (),
                Err(e) => warn!(target: "ecu", "0x{:03x}: {}", self.request_id, e),
            }
        }
    }

    fn spawn_answer(&self, request: CanMessage, replies: mpsc::Sender<CanMessage>) {
        let handler = self.handler.clone();
        let response_id = self.response_id;
        let echoing = self.echoing;
        let delay = self
            .delays
            .get(&request.identifier)
            .copied()
            .unwrap_or(self.delay);
        tokio::spawn(async move {
            debug!(
                target: "ecu",
                "0x{:03x}: service 0x{:02x} identifier 0x{:04x}",
                request.can_id, request.service_id, request.identifier
            );
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let response = match handler(request.service_id, request.identifier) {
                Ok(data) if echoing => CanMessage {
                    can_id: response_id,
                    data,
                    ..request
                },
                Ok(data) => CanMessage::positive_response(
                    response_id,
                    request.service_id,
                    request.identifier,
                    data,
                ),
                Err(nrc) => CanMessage::negative_response(
                    response_id,
                    request.service_id,
                    request.identifier,
                    nrc,
                ),
            };
            let _ = replies.send(response).await;
        });
    }
}

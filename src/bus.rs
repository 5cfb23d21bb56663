//! Bus transport collaborator.
//!
//! The gateway drives each CAN bus through a [`BusTransport`]. It does not own
//! the bus: opening, closing and reconnecting are left to the implementation.
//!
//! [`VirtualBus`] is an in-memory bus. The gateway side implements
//! [`BusTransport`]; every attached [`BusNode`] sees the frames the gateway
//! sends, and the frames sent by nodes reach the gateway.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::can::CanFrame;

/// Bus transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus is gone.
    #[error("bus closed")]
    Closed,
    /// The frame could not be put on the bus.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Transport-agnostic access to a CAN bus.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Put a frame on the bus, returning once it is sent.
    async fn send(&self, frame: CanFrame) -> Result<(), BusError>;

    /// Wait for the next frame from the bus.
    async fn receive(&self) -> Result<CanFrame, BusError>;
}

const BUS_CAPACITY: usize = 256;

/// In-memory CAN bus.
pub struct VirtualBus {
    to_nodes: broadcast::Sender<CanFrame>,
    to_gateway: mpsc::Sender<CanFrame>,
    from_nodes: Mutex<mpsc::Receiver<CanFrame>>,
    failing: AtomicBool,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    /// A bus without any node.
    pub fn new() -> Self {
        let (to_nodes, _) = broadcast::channel(BUS_CAPACITY);
        let (to_gateway, from_nodes) = mpsc::channel(BUS_CAPACITY);
        VirtualBus {
            to_nodes,
            to_gateway,
            from_nodes: Mutex::new(from_nodes),
            failing: AtomicBool::new(false),
        }
    }

    /// Attach a node, which receives every frame sent from now on.
    pub fn attach(&self) -> BusNode {
        BusNode {
            rx: self.to_nodes.subscribe(),
            tx: self.to_gateway.clone(),
        }
    }

    /// Make the gateway side sends fail, as a bus-off controller would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusTransport for VirtualBus {
    async fn send(&self, frame: CanFrame) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::SendFailed("bus off".to_string()));
        }
        trace!(target: "can", "tx 0x{:03x} {:02x?}", frame.id, frame.data);
        // A frame nobody listens to is still sent.
        if self.to_nodes.send(frame).is_err() {
            debug!(target: "can", "no node attached");
        }
        Ok(())
    }

    async fn receive(&self) -> Result<CanFrame, BusError> {
        let frame = self.from_nodes.lock().await.recv().await.ok_or(BusError::Closed)?;
        trace!(target: "can", "rx 0x{:03x} {:02x?}", frame.id, frame.data);
        Ok(frame)
    }
}

/// A node attached to a [`VirtualBus`].
pub struct BusNode {
    rx: broadcast::Receiver<CanFrame>,
    tx: mpsc::Sender<CanFrame>,
}

impl BusNode {
    /// Wait for the next frame sent by the gateway.
    pub async fn receive(&mut self) -> Result<CanFrame, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "can", "node lagged, {} frames lost", n)
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Next frame sent by the gateway, if one is already queued.
    pub fn try_receive(&mut self) -> Option<CanFrame> {
        self.rx.try_recv().ok()
    }

    /// Send a frame to the gateway.
    pub async fn send(&self, frame: CanFrame) -> Result<(), BusError> {
        self.tx.send(frame).await.map_err(|_| BusError::Closed)
    }

    /// A handle sending on behalf of this node, usable from another task.
    pub fn sender(&self) -> NodeSender {
        NodeSender {
            tx: self.tx.clone(),
        }
    }
}

/// Sending half of a [`BusNode`].
#[derive(Clone)]
pub struct NodeSender {
    tx: mpsc::Sender<CanFrame>,
}

impl NodeSender {
    /// Send a frame to the gateway.
    pub async fn send(&self, frame: CanFrame) -> Result<(), BusError> {
        self.tx.send(frame).await.map_err(|_| BusError::Closed)
    }
}

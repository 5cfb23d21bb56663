use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection as cnx;
use crate::diagnostic_message::{decode_reply, decode_request};
use crate::message::{
    DiagnosticNack, DiagnosticNackCode, DiagnosticRequest, GatewayReply, LogicalAddress,
};
use crate::{Gateway, GatewayError, Timings};
use log::{debug, info, warn};
use tokio::{
    io,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpSocket, TcpStream,
    },
    sync::mpsc,
    time,
};

const REPLY_QUEUE: usize = 32;

// Largest reply payload a tester accepts: the diagnostic fixed part followed
// by the longest CAN message body.
const MAX_REPLY_LENGTH: usize = 0x1000 + 8;

/// GatewayServer
///
/// Accepts tester connections and hands their diagnostic messages to a
/// [`Gateway`].
///
/// Each connection is served by its own task, and each request of a
/// connection by yet another one: a slow ECU never holds back the requests
/// queued behind it. Replies are written in the order they become available,
/// which is not necessarily the order of the requests.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    max_payload_length: usize,
}

impl GatewayServer {
    /// A server for `gateway`, refusing DoIP payloads longer than
    /// `max_payload_length`.
    pub fn new(gateway: Arc<Gateway>, max_payload_length: usize) -> Self {
        GatewayServer {
            gateway,
            max_payload_length,
        }
    }

    /// Accept connections on `listener` forever.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Io`] if the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let local_addr = listener.local_addr()?;
        info!(target: "doip_tcp", "DoIP gateway listening on {}", local_addr);
        loop {
            let (stream, client_addr) = listener.accept().await?;
            info!(
                target: "doip_tcp",
                "DoIP connection accepted {}->{}", client_addr, local_addr
            );
            tokio::spawn(serve_connection(
                self.gateway.clone(),
                stream,
                client_addr,
                self.max_payload_length,
            ));
        }
    }
}

async fn serve_connection(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    client_addr: SocketAddr,
    max_payload_length: usize,
) {
    let (mut tcp_reader, mut tcp_writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<GatewayReply>(REPLY_QUEUE);
    let writer = tokio::spawn(async move {
        let mut send_buffer = vec![];
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = cnx::send_reply(&mut tcp_writer, &reply, &mut send_buffer).await {
                warn!(target: "doip_tcp", "{}: write failed: {}", client_addr, e);
                break;
            }
        }
    });

    let mut receive_buffer = vec![];
    loop {
        match cnx::read_message(&mut tcp_reader, &mut receive_buffer, max_payload_length).await {
            Ok(()) => {
                let message = std::mem::take(&mut receive_buffer);
                let gateway = gateway.clone();
                let replies = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = answer(&gateway, &message).await;
                    let _ = replies.send(reply).await;
                });
            }
            Err(GatewayError::Protocol(e)) => {
                warn!(target: "doip_tcp", "{}: {}", client_addr, e);
                let _ = reply_tx.send(GatewayReply::GenericNack(e.nack_code())).await;
                if e.is_fatal() {
                    break;
                }
            }
            Err(GatewayError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(target: "doip_tcp", "{}: closed by peer", client_addr);
                break;
            }
            Err(e) => {
                warn!(target: "doip_tcp", "{}: {}", client_addr, e);
                break;
            }
        }
    }
    // Requests still in flight keep the writer alive until they are answered.
    drop(reply_tx);
    let _ = writer.await;
    info!(target: "doip_tcp", "DoIP connection closed {}", client_addr);
}

async fn answer(gateway: &Gateway, message: &[u8]) -> GatewayReply {
    match gateway.handle_message(message).await {
        Ok(reply) => reply,
        Err(e) => match decode_request(message) {
            Ok(request) => {
                warn!(
                    target: "doip_tcp",
                    "0x{:04x} unreachable: {}", request.target_address, e
                );
                GatewayReply::DiagnosticNack(DiagnosticNack::refuse(
                    &request,
                    DiagnosticNackCode::TargetUnreachable,
                ))
            }
            // Only a decoded request reaches the bus.
            Err(e) => GatewayReply::GenericNack(e.nack_code()),
        },
    }
}

/// DoIpTester
///
/// The tester end of a DoIP connection to a gateway.
pub struct DoIpTester {
    la: LogicalAddress,
    tcp_reader: OwnedReadHalf,
    tcp_writer: OwnedWriteHalf,
    send_buffer: Vec<u8>,
    receive_buffer: Vec<u8>,
    max_payload_length: usize,
}

impl DoIpTester {
    /// Connect to the gateway at `remote_addr`, as tester `la`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConnectionTimeout`] if the TCP connection cannot be
    /// established within [`Timings::tcp_connect`].
    /// - [`GatewayError::Io`] if the TCP connection cannot be established
    /// (think network error here).
    pub async fn connect(
        remote_addr: SocketAddr,
        la: LogicalAddress,
        timings: &Timings,
    ) -> Result<DoIpTester, GatewayError> {
        let socket = if remote_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let stream = time::timeout(timings.tcp_connect, socket.connect(remote_addr))
            .await
            .map_err(|_| GatewayError::ConnectionTimeout)??;
        info!(
            target: "doip_tcp",
            "DoIP connection established {}->{}", stream.local_addr()?, remote_addr
        );
        let (tcp_reader, tcp_writer) = stream.into_split();
        Ok(DoIpTester {
            la,
            tcp_reader,
            tcp_writer,
            send_buffer: vec![],
            receive_buffer: vec![],
            max_payload_length: MAX_REPLY_LENGTH,
        })
    }

    /// Logical address of the tester.
    pub fn logical_address(&self) -> LogicalAddress {
        self.la
    }

    /// Send `service_id` for `identifier` to the ECU at `ta`.
    ///
    /// Returns the request as sent.
    pub async fn send_diagnostic(
        &mut self,
        ta: LogicalAddress,
        service_id: u8,
        identifier: u16,
    ) -> io::Result<DiagnosticRequest> {
        let request = DiagnosticRequest {
            source_address: self.la,
            target_address: ta,
            service_id,
            flags: 0,
            identifier,
        };
        self.send_request(&request).await?;
        Ok(request)
    }

    /// Send a diagnostic request as is, whatever its source address.
    pub async fn send_request(&mut self, request: &DiagnosticRequest) -> io::Result<()> {
        cnx::send_request(&mut self.tcp_writer, request, &mut self.send_buffer).await
    }

    /// Send bytes as is, for messages no well-behaved tester would send.
    pub async fn send_raw(&mut self, message: &[u8]) -> io::Result<()> {
        cnx::send_raw(&mut self.tcp_writer, message).await
    }

    /// Receive the next reply of the gateway.
    ///
    /// Replies to concurrent requests arrive in completion order; match them
    /// on their addresses, service and identifier.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Io`] if the connection breaks.
    /// - [`GatewayError::Protocol`] if the reply cannot be decoded.
    pub async fn receive_reply(&mut self) -> Result<GatewayReply, GatewayError> {
        cnx::read_message(
            &mut self.tcp_reader,
            &mut self.receive_buffer,
            self.max_payload_length,
        )
        .await?;
        Ok(decode_reply(&self.receive_buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::diagnostic_message::encode_request;
    use crate::message::GenericNackCode;
    use crate::{AddressRouter, RoutingEntry, VirtualBus};

    fn failing_gateway() -> Gateway {
        let bus = Arc::new(VirtualBus::new());
        bus.set_failing(true);
        let router = AddressRouter::new(vec![RoutingEntry::new(0x0205, 0x600, 0x601)]).unwrap();
        let timings = Timings {
            response_timeout: Duration::from_millis(100),
            ..Timings::default()
        };
        Gateway::new(router, timings).with_bus("can0", bus)
    }

    #[tokio::test]
    async fn answer_turns_bus_failure_into_unreachable() {
        let gateway = failing_gateway();
        let request = DiagnosticRequest {
            source_address: 0x0e80,
            target_address: 0x0205,
            service_id: 0x22,
            flags: 0,
            identifier: 0xf190,
        };
        let mut message = vec![];
        encode_request(&request, &mut message);
        assert_eq!(
            answer(&gateway, &message).await,
            GatewayReply::DiagnosticNack(DiagnosticNack {
                source_address: 0x0205,
                target_address: 0x0e80,
                code: DiagnosticNackCode::TargetUnreachable,
            })
        );
        assert!(gateway.tracker().is_empty());
    }

    #[tokio::test]
    async fn answer_refuses_undecodable_message() {
        let gateway = failing_gateway();
        assert_eq!(
            answer(&gateway, &[0x02, 0xfd, 0x80, 0x01, 0, 0, 0, 2, 0x0e, 0x80]).await,
            GatewayReply::GenericNack(GenericNackCode::InvalidPayloadLength)
        );
    }
}

use std::time::Duration;

use crate::message::{DiagnosticResponse, GatewayReply, LogicalAddress};
use crate::{DoIpTester, GatewayError};

use tokio::time;

/// UDS ReadDataByIdentifier service.
pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;

/// Send an UDS request and wait for its diagnostic response.
///
/// Send `service_id` for `identifier` to the ECU at `ta`, and returns the
/// response received, positive or negative. A duration `reply_timeout` limits
/// the wait time; it should exceed the response timeout of the gateway,
/// which answers silent ECUs itself.
///
/// Only one request should be in flight on `tester`, as the first reply
/// received is taken as the answer.
///
/// # Errors
///
/// - [`GatewayError::ReplyTimeout`] if no reply comes in time.
/// - [`GatewayError::UnexpectedReply`] if the gateway refuses the request
/// with a negative acknowledge.
pub async fn request_service(
    tester: &mut DoIpTester,
    ta: LogicalAddress,
    service_id: u8,
    identifier: u16,
    reply_timeout: Duration,
) -> Result<DiagnosticResponse, GatewayError> {
    tester.send_diagnostic(ta, service_id, identifier).await?;
    let reply = time::timeout(reply_timeout, tester.receive_reply())
        .await
        .map_err(|_| GatewayError::ReplyTimeout)??;
    match reply {
        GatewayReply::Response(rsp) => Ok(rsp),
        other => Err(GatewayError::UnexpectedReply(other)),
    }
}

/// Read the data identifier `did` of the ECU at `ta`.
///
/// See [`request_service()`].
pub async fn read_data_by_identifier(
    tester: &mut DoIpTester,
    ta: LogicalAddress,
    did: u16,
    reply_timeout: Duration,
) -> Result<DiagnosticResponse, GatewayError> {
    request_service(tester, ta, READ_DATA_BY_IDENTIFIER, did, reply_timeout).await
}

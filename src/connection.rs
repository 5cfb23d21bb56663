use log::trace;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::diagnostic_message::{encode_reply, encode_request, DoIpCodecError, DoIpHeader};
use crate::message::{DiagnosticRequest, GatewayReply, DOIP_HEADER_LENGTH};
use crate::GatewayError;

/// Read exactly one DoIP message from `reader` into `buffer`.
///
/// On success `buffer` holds the header followed by the whole payload. A
/// header that cannot be trusted is reported as
/// [`GatewayError::Protocol`], after which the stream is no longer aligned
/// on message boundaries.
pub async fn read_message<R>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    max_payload_length: usize,
) -> Result<(), GatewayError>
where
    R: AsyncReadExt + Unpin,
{
    buffer.resize(DOIP_HEADER_LENGTH, 0);
    reader
        .read_exact(&mut buffer[0..DOIP_HEADER_LENGTH])
        .await?;
    let header = DoIpHeader::decode(&buffer[0..DOIP_HEADER_LENGTH])?;
    let plen = header.payload_length as usize;
    if plen > max_payload_length {
        return Err(DoIpCodecError::PayloadTooLarge {
            length: plen,
            limit: max_payload_length,
        }
        .into());
    }
    trace!(target: "doip", "Reading in {} payload bytes", plen);
    buffer.resize(DOIP_HEADER_LENGTH + plen, 0);
    reader.read_exact(&mut buffer[DOIP_HEADER_LENGTH..]).await?;
    Ok(())
}

async fn write_buffer<W>(writer: &mut W, buffer: &[u8]) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    trace!(target: "doip", "Writing out {:02x?}", buffer);
    writer.write_all(buffer).await?;
    writer.flush().await
}

/// Encode `reply` and write it out.
pub async fn send_reply<W>(
    writer: &mut W,
    reply: &GatewayReply,
    buffer: &mut Vec<u8>,
) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    encode_reply(reply, buffer);
    write_buffer(writer, buffer).await
}

/// Encode `request` and write it out.
pub async fn send_request<W>(
    writer: &mut W,
    request: &DiagnosticRequest,
    buffer: &mut Vec<u8>,
) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    encode_request(request, buffer);
    write_buffer(writer, buffer).await
}

/// Write out an already encoded message.
pub async fn send_raw<W>(writer: &mut W, message: &[u8]) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_buffer(writer, message).await
}

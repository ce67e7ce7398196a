//! SFTP session pump
//!
//! Reads length-prefixed packets from a byte stream (normally an SSH
//! channel), hands requests to the [`Dispatcher`] one at a time and writes
//! each response back before reading the next packet. Works over any
//! `AsyncRead + AsyncWrite` stream, which is how the tests drive it.

use crate::dispatcher::Dispatcher;
use crate::protocol::{Packet, Response, SFTP_VERSION, StatusCode};
use crate::{Error, Result};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Slack above `max_packet_size` for the request header around a payload
const FRAME_OVERHEAD: usize = 1024;

/// Serve one SFTP session until the peer closes the stream
///
/// Every descriptor the session opened is released before returning,
/// whether the session ended cleanly or not.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for a request before INIT, a packet too short
/// to carry a request id, or a broken frame, and [`Error::Ssh`] when a
/// response cannot be written.
pub async fn serve<S>(
    stream: S,
    mut dispatcher: Dispatcher,
    max_packet_size: u32,
    user: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = Uuid::new_v4();
    let span = info_span!("sftp_session", %session_id, user);

    async move {
        info!(
            event = "session_start",
            root = ?dispatcher.jail().root(),
            "SFTP session started"
        );

        let max_frame = usize::try_from(max_packet_size)
            .unwrap_or(usize::MAX)
            .saturating_add(FRAME_OVERHEAD);
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max_frame)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        let result = pump(&mut framed, &mut dispatcher).await;
        let released = dispatcher.shutdown();

        match &result {
            Ok(()) => info!(event = "session_end", released, "SFTP session ended"),
            Err(e) => warn!(event = "session_end", released, error = %e, "SFTP session aborted"),
        }
        result
    }
    .instrument(span)
    .await
}

async fn pump<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    dispatcher: &mut Dispatcher,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut initialized = false;

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| Error::Protocol(format!("Framing error: {e}")))?;

        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                let id = Packet::peek_request_id(&frame).filter(|_| initialized);
                let Some(id) = id else {
                    return Err(e);
                };
                debug!(request_id = id, error = %e, "Undecodable request");
                send(framed, Response::status(StatusCode::Failure, e.to_string()), id).await?;
                continue;
            }
        };

        match packet {
            Packet::Init { version } => {
                debug!(
                    client_version = version,
                    server_version = SFTP_VERSION,
                    "SFTP INIT"
                );
                initialized = true;
                // VERSION carries no request id
                send(framed, Response::Version, 0).await?;
            }
            Packet::Request { id, request } => {
                if !initialized {
                    return Err(Error::Protocol(format!(
                        "{} received before INIT",
                        request.name()
                    )));
                }
                let response = dispatcher.dispatch(request).await;
                send(framed, response, id).await?;
            }
        }
    }

    Ok(())
}

async fn send<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    response: Response,
    id: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body: BytesMut = response.encode(id);
    framed
        .send(body.freeze())
        .await
        .map_err(|e| Error::Ssh(format!("Failed to send response: {e}")))
}

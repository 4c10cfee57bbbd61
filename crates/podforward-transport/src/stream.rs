//! Port stream over an upgraded port-forward connection
//!
//! The kubelet multiplexes a forwarded port onto two WebSocket channels:
//!
//! Frame format:
//! - 1 byte: channel (0=data, 1=error)
//! - Rest: payload
//!
//! The first frame on each channel carries only the port number
//! (2 bytes, little-endian). The v4 protocol cannot signal a half-close:
//! local EOF only stops the upstream, and the WebSocket stays open until
//! the kubelet closes it once the pod side of the connection is done.

use futures_util::{SinkExt, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};

pub(crate) const DATA_CHANNEL: u8 = 0;
pub(crate) const ERROR_CHANNEL: u8 = 1;

/// Buffer size for the in-memory pipe between the WebSocket and the caller
const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// One forwarded byte stream to a port inside the pod
#[derive(Debug)]
pub struct PortStream {
    io: DuplexStream,
    remote_error: Option<oneshot::Receiver<String>>,
    /// Ends the relay task when the stream is dropped
    _relay: Option<DropGuard>,
}

impl PortStream {
    /// Wrap an in-memory pipe. Used by transports that carry no error channel.
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            remote_error: None,
            _relay: None,
        }
    }

    /// Wrap an in-memory pipe whose transport may report a remote error
    pub fn with_remote_error(io: DuplexStream, remote_error: oneshot::Receiver<String>) -> Self {
        Self {
            io,
            remote_error: Some(remote_error),
            _relay: None,
        }
    }

    /// Relay an upgraded WebSocket onto a new port stream.
    ///
    /// A background task owns the WebSocket until either side closes.
    pub fn spawn<S>(ws: WebSocketStream<S>, port: u16) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (error_tx, error_rx) = oneshot::channel();
        let released = CancellationToken::new();

        let token = released.clone();
        tokio::spawn(async move {
            if let Err(e) = relay(ws, remote, port, error_tx, token).await {
                debug!(port = port, "Port stream ended with error: {}", e);
            }
        });

        Self {
            io: local,
            remote_error: Some(error_rx),
            _relay: Some(released.drop_guard()),
        }
    }

    /// Error text reported by the remote side, if any.
    ///
    /// Resolves once the transport has finished; call it after the stream
    /// reached EOF.
    pub async fn remote_error(&mut self) -> Option<String> {
        match self.remote_error.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl AsyncRead for PortStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PortStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Decode a channel frame into `(channel, payload)`
pub(crate) fn decode_frame(data: &[u8]) -> Option<(u8, &[u8])> {
    let (&channel, payload) = data.split_first()?;
    Some((channel, payload))
}

/// Encode a channel frame
pub(crate) fn encode_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

/// Strips and checks the port prefix of the first frame on a channel
#[derive(Debug)]
struct ChannelState {
    port: u16,
    prefix_seen: bool,
}

impl ChannelState {
    fn new(port: u16) -> Self {
        Self {
            port,
            prefix_seen: false,
        }
    }

    fn payload<'a>(&mut self, payload: &'a [u8]) -> TransportResult<&'a [u8]> {
        if self.prefix_seen {
            return Ok(payload);
        }
        if payload.len() < 2 {
            return Err(TransportError::ProtocolError(
                "missing port prefix on first frame".to_string(),
            ));
        }
        let port = u16::from_le_bytes([payload[0], payload[1]]);
        if port != self.port {
            return Err(TransportError::ProtocolError(format!(
                "expected port {}, server sent {}",
                self.port, port
            )));
        }
        self.prefix_seen = true;
        Ok(&payload[2..])
    }
}

async fn relay<S>(
    ws: WebSocketStream<S>,
    local: DuplexStream,
    port: u16,
    error_tx: oneshot::Sender<String>,
    released: CancellationToken,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = ws.split();
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let mut remote_error = Vec::new();

    let outcome = {
        // Local -> WebSocket
        let upstream = async {
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                let n = local_read.read(&mut buffer).await?;
                if n == 0 {
                    trace!(port = port, "Local side closed");
                    return Ok::<(), TransportError>(());
                }
                sink.send(Message::Binary(encode_frame(DATA_CHANNEL, &buffer[..n])))
                    .await?;
            }
        };

        // WebSocket -> local
        let downstream = async {
            let mut data = ChannelState::new(port);
            let mut error = ChannelState::new(port);

            while let Some(message) = source.next().await {
                match message? {
                    Message::Binary(frame) => {
                        let (channel, payload) = decode_frame(&frame).ok_or_else(|| {
                            TransportError::ProtocolError("empty frame".to_string())
                        })?;
                        match channel {
                            DATA_CHANNEL => {
                                let payload = data.payload(payload)?;
                                if !payload.is_empty() {
                                    local_write.write_all(payload).await?;
                                }
                            }
                            ERROR_CHANNEL => {
                                let payload = error.payload(payload)?;
                                remote_error.extend_from_slice(payload);
                            }
                            other => {
                                warn!(port = port, "Frame on unknown channel {}", other);
                            }
                        }
                    }
                    Message::Close(_) => {
                        trace!(port = port, "Remote side closed");
                        break;
                    }
                    _ => {}
                }
            }
            Ok::<(), TransportError>(())
        };

        tokio::pin!(upstream);
        tokio::pin!(downstream);

        tokio::select! {
            result = &mut downstream => result,
            _ = released.cancelled() => Ok(()),
            result = &mut upstream => match result {
                // Half-closed: keep delivering what the pod still sends
                Ok(()) => tokio::select! {
                    result = &mut downstream => result,
                    _ = released.cancelled() => {
                        trace!(port = port, "Port stream dropped");
                        Ok(())
                    }
                },
                Err(e) => Err(e),
            },
        }
    };

    let _ = sink.close().await;
    let _ = local_write.shutdown().await;

    if !remote_error.is_empty() {
        let _ = error_tx.send(String::from_utf8_lossy(&remote_error).into_owned());
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn prefix(channel: u8, port: u16) -> Message {
        let port = port.to_le_bytes();
        Message::Binary(vec![channel, port[0], port[1]])
    }

    #[test]
    fn test_frame_encoding() {
        let frame = encode_frame(DATA_CHANNEL, b"hello");
        assert_eq!(frame.len(), 1 + 5);

        let (channel, payload) = decode_frame(&frame).unwrap();
        assert_eq!(channel, DATA_CHANNEL);
        assert_eq!(payload, b"hello");
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn test_port_prefix_is_checked() {
        let mut state = ChannelState::new(8080);
        assert!(state.payload(&[0x90]).is_err());

        let mut state = ChannelState::new(8080);
        assert!(state.payload(&9090u16.to_le_bytes()).is_err());

        let mut state = ChannelState::new(8080);
        let first = [0x90, 0x1f, b'h', b'i'];
        assert_eq!(state.payload(&first).unwrap(), b"hi");
        assert_eq!(state.payload(&[0x90, 0x1f]).unwrap(), &[0x90, 0x1f]);
    }

    #[tokio::test]
    async fn test_relays_data_both_ways() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 8080);

        server.send(prefix(DATA_CHANNEL, 8080)).await.unwrap();
        server.send(prefix(ERROR_CHANNEL, 8080)).await.unwrap();
        server
            .send(Message::Binary(encode_frame(DATA_CHANNEL, b"pong")))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        stream.write_all(b"ping").await.unwrap();
        match server.next().await.unwrap().unwrap() {
            Message::Binary(frame) => assert_eq!(frame, encode_frame(DATA_CHANNEL, b"ping")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 5432);

        server.send(prefix(DATA_CHANNEL, 5432)).await.unwrap();
        server.send(prefix(ERROR_CHANNEL, 5432)).await.unwrap();
        server
            .send(Message::Binary(encode_frame(
                ERROR_CHANNEL,
                b"failed to connect to localhost:5432",
            )))
            .await
            .unwrap();
        server.close(None).await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let error = stream.remote_error().await;
        assert_eq!(error.as_deref(), Some("failed to connect to localhost:5432"));
    }

    #[tokio::test]
    async fn test_response_after_local_shutdown_is_delivered() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 8080);

        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        stream.shutdown().await.unwrap();

        // Same order as the kubelet: port prefixes, the request, then the reply
        server.send(prefix(DATA_CHANNEL, 8080)).await.unwrap();
        server.send(prefix(ERROR_CHANNEL, 8080)).await.unwrap();
        match server.next().await.unwrap().unwrap() {
            Message::Binary(frame) => {
                assert_eq!(frame, encode_frame(DATA_CHANNEL, b"GET / HTTP/1.0\r\n\r\n"))
            }
            other => panic!("unexpected message: {:?}", other),
        }
        server
            .send(Message::Binary(encode_frame(
                DATA_CHANNEL,
                b"HTTP/1.0 200 OK\r\n\r\n",
            )))
            .await
            .unwrap();
        server
            .send(Message::Binary(encode_frame(DATA_CHANNEL, b"hello")))
            .await
            .unwrap();
        server.close(None).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nhello");
        assert!(stream.remote_error().await.is_none());
    }

    #[tokio::test]
    async fn test_local_shutdown_keeps_websocket_open() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 8080);

        stream.shutdown().await.unwrap();

        // No close frame until the remote side ends the connection
        let pending = tokio::time::timeout(Duration::from_millis(100), server.next()).await;
        assert!(pending.is_err());

        server.close(None).await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(stream.remote_error().await.is_none());
    }

    #[tokio::test]
    async fn test_remote_close_ends_stream_while_local_is_open() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 8080);

        server.send(prefix(DATA_CHANNEL, 8080)).await.unwrap();
        server.send(prefix(ERROR_CHANNEL, 8080)).await.unwrap();
        server
            .send(Message::Binary(encode_frame(DATA_CHANNEL, b"bye")))
            .await
            .unwrap();
        server.close(None).await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest, b"bye");
    }

    #[tokio::test]
    async fn test_dropping_half_closed_stream_closes_websocket() {
        let (client, mut server) = ws_pair().await;
        let mut stream = PortStream::spawn(client, 8080);

        stream.shutdown().await.unwrap();
        drop(stream);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match server.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}

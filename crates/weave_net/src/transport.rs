//! Byte-stream and WebSocket transports behind one frame-level interface.
//!
//! A connection only ever sees a [`FrameReader`] and a [`FrameWriter`].
//! Stream transports (TCP, in-memory duplex) carry back-to-back frames;
//! the WebSocket transport carries exactly one frame per binary message.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config, client_async_with_config};
use tracing::debug;

use crate::error::NetError;
use crate::frame::{self, Frame, HEADER_LEN, MAX_BODY_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    #[serde(rename = "ws")]
    WebSocket,
}

/// Read side of a transport. Returns whole frames only.
#[async_trait]
pub trait FrameReader: Send + 'static {
    async fn read_frame(&mut self) -> Result<Frame, NetError>;
}

/// Write side of a transport. Owned by a single writer task.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), NetError>;

    /// Best-effort graceful close of the write side.
    async fn shutdown(&mut self);
}

pub type BoxReader = Box<dyn FrameReader>;
pub type BoxWriter = Box<dyn FrameWriter>;

// ---------------------------------------------------------------------------
// Stream transports
// ---------------------------------------------------------------------------

pub struct StreamFrameReader<R> {
    inner: BufReader<R>,
    max_body: usize,
}

#[async_trait]
impl<R> FrameReader for StreamFrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Frame, NetError> {
        frame::read_frame(&mut self.inner, self.max_body).await
    }
}

pub struct StreamFrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

#[async_trait]
impl<W> FrameWriter for StreamFrameWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), NetError> {
        self.buf.clear();
        frame.encode_into(&mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!("Stream shutdown failed: {e}");
        }
    }
}

/// Split any duplex byte stream into frame halves.
pub fn split_stream<S>(stream: S, max_body: usize) -> (BoxReader, BoxWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (
        Box::new(StreamFrameReader {
            inner: BufReader::new(read),
            max_body,
        }),
        Box::new(StreamFrameWriter {
            inner: write,
            buf: BytesMut::new(),
        }),
    )
}

/// Split a TCP stream into frame halves without the shared-lock overhead
/// of [`split_stream`].
pub fn split_tcp(stream: TcpStream, max_body: usize) -> (BoxReader, BoxWriter) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let (read, write) = stream.into_split();
    (
        Box::new(StreamFrameReader {
            inner: BufReader::new(read),
            max_body,
        }),
        Box::new(StreamFrameWriter {
            inner: write,
            buf: BytesMut::new(),
        }),
    )
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<TcpStream>;

pub struct WsFrameReader {
    stream: SplitStream<WsStream>,
    max_body: usize,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Frame, NetError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Frame::decode(&data, self.max_body),
                Some(Ok(Message::Text(_))) => {
                    return Err(NetError::Protocol("text message on binary channel".into()));
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(NetError::Disconnected),
                Some(Err(e)) => return Err(NetError::Transport(format!("WebSocket read: {e}"))),
            }
        }
    }
}

pub struct WsFrameWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), NetError> {
        let bytes = frame.encode()?;
        self.sink
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| NetError::Transport(format!("WebSocket write: {e}")))
    }

    async fn shutdown(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

/// Caps WebSocket messages at one frame so oversized bodies are refused
/// by tungstenite before they are buffered.
fn ws_config(max_body: usize) -> WebSocketConfig {
    let max_message = HEADER_LEN + max_body.min(MAX_BODY_LEN);
    WebSocketConfig::default()
        .max_message_size(Some(max_message))
        .max_frame_size(Some(max_message))
}

fn split_ws(ws: WsStream, max_body: usize) -> (BoxReader, BoxWriter) {
    let (sink, stream) = ws.split();
    (
        Box::new(WsFrameReader { stream, max_body }),
        Box::new(WsFrameWriter { sink }),
    )
}

/// Complete the server side of a WebSocket upgrade on an accepted socket.
pub async fn accept_ws(
    stream: TcpStream,
    max_body: usize,
) -> Result<(BoxReader, BoxWriter), NetError> {
    let ws = accept_async_with_config(stream, Some(ws_config(max_body)))
        .await
        .map_err(|e| NetError::Transport(format!("WebSocket accept: {e}")))?;
    Ok(split_ws(ws, max_body))
}

/// Wrap an accepted socket in the requested transport.
pub async fn accept(
    kind: TransportKind,
    stream: TcpStream,
    max_body: usize,
) -> Result<(BoxReader, BoxWriter), NetError> {
    match kind {
        TransportKind::Tcp => Ok(split_tcp(stream, max_body)),
        TransportKind::WebSocket => accept_ws(stream, max_body).await,
    }
}

fn host_port(addr: &str) -> &str {
    let rest = addr
        .trim_start_matches("ws://")
        .trim_start_matches("tcp://");
    rest.split('/').next().unwrap_or(rest)
}

/// Dial `addr` with the given transport within `timeout`.
///
/// `addr` may carry a `ws://` or `tcp://` scheme; for WebSocket any path
/// after the host is kept in the upgrade request.
pub async fn dial(
    kind: TransportKind,
    addr: &str,
    max_body: usize,
    timeout: Duration,
) -> Result<(BoxReader, BoxWriter, SocketAddr), NetError> {
    let target = host_port(addr);
    let connect = async {
        let stream = TcpStream::connect(target).await?;
        let remote = stream.peer_addr()?;
        let halves = match kind {
            TransportKind::Tcp => split_tcp(stream, max_body),
            TransportKind::WebSocket => {
                let url = if addr.starts_with("ws://") {
                    addr.to_string()
                } else {
                    format!("ws://{addr}")
                };
                let (ws, _) =
                    client_async_with_config(url.as_str(), stream, Some(ws_config(max_body)))
                        .await
                        .map_err(|e| {
                            NetError::Transport(format!("Connect to {addr} failed: {e}"))
                        })?;
                split_ws(ws, max_body)
            }
        };
        Ok::<_, NetError>((halves.0, halves.1, remote))
    };
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| NetError::Timeout(timeout))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

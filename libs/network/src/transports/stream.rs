//! Framed stream transport for TCP and Unix sockets
//!
//! Each message is encoded with the codec and wrapped in a sync-word frame.
//! A new connection first exchanges handshake frames ([`FramedStream`]) and is
//! then turned into a [`StreamTransport`] for use under a [`Link`].
//!
//! Invalid frames and undecodable messages are logged and skipped; only I/O
//! failures and end-of-stream close the transport.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mesh_codec::{
    decode_message, encode_frame, encode_message, FrameDecoder, HandshakeRequest,
    HandshakeResponse, DEFAULT_MAX_FRAME_SIZE,
};
use mesh_types::{Cost, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LinkTransport, TransportInfo, TransportType};
use crate::link::Link;
use crate::{costs, Result, TransportError, DEFAULT_HANDSHAKE_TIMEOUT};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_BUFFER_SIZE: usize = 64 * 1024;

struct FrameReader {
    inner: BoxReader,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl FrameReader {
    /// Cancel safe: partial reads stay in `buffer`
    async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let read = self
                .inner
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| TransportError::connection_closed(format!("read failed: {e}")))?;
            if read == 0 {
                return Err(TransportError::connection_closed("peer closed the stream"));
            }
        }
    }
}

async fn write_frame(writer: &mut BoxWriter, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    let written = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    }
    .await;
    written.map_err(|e| TransportError::connection_closed(format!("write failed: {e}")))
}

/// A byte stream speaking sync-word frames, before it becomes a link
pub struct FramedStream {
    reader: FrameReader,
    writer: BoxWriter,
    info: TransportInfo,
}

impl FramedStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        info: TransportInfo,
        max_frame_size: usize,
    ) -> Self {
        Self {
            reader: FrameReader {
                inner: Box::new(reader),
                buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
                decoder: FrameDecoder::new(max_frame_size),
            },
            writer: Box::new(writer),
            info,
        }
    }

    pub fn from_tcp(stream: TcpStream, max_frame_size: usize) -> Self {
        let mut info = TransportInfo::new(TransportType::Tcp);
        if let Ok(peer) = stream.peer_addr() {
            info = info.with_remote(peer.to_string());
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, info, max_frame_size)
    }

    pub fn from_unix(stream: UnixStream, label: impl Into<String>, max_frame_size: usize) -> Self {
        let info = TransportInfo::new(TransportType::Unix).with_remote(label);
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, info, max_frame_size)
    }

    pub fn info(&self) -> &TransportInfo {
        &self.info
    }

    pub async fn read_frame(&mut self) -> Result<Bytes> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, payload).await
    }

    /// Connecting side of the handshake
    pub async fn client_handshake(&mut self, auth: Option<&str>, timeout: Duration) -> Result<()> {
        let exchange = async {
            let request = HandshakeRequest::new(auth.map(str::to_string));
            self.write_frame(&request.encode()?).await?;
            let response = HandshakeResponse::decode(&self.read_frame().await?)?;
            response.into_result()?;
            Ok::<(), TransportError>(())
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::timeout("client handshake", timeout.as_millis() as u64))?
    }

    /// Accepting side of the handshake; a rejected peer is told why
    pub async fn server_handshake(
        &mut self,
        expected_auth: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let exchange = async {
            let request = HandshakeRequest::decode(&self.read_frame().await?)?;
            let response = request.evaluate(expected_auth);
            self.write_frame(&response.encode()?).await?;
            if let Some(reason) = &response.reason {
                warn!(peer = %self.info, reason = %reason, "Rejected connection");
            }
            response.into_result()?;
            Ok::<(), TransportError>(())
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::timeout("server handshake", timeout.as_millis() as u64))?
    }

    pub fn into_transport(self) -> StreamTransport {
        StreamTransport {
            reader: Mutex::new(self.reader),
            writer: Arc::new(Mutex::new(Some(self.writer))),
            closed: CancellationToken::new(),
            info: self.info,
        }
    }
}

/// Message transport over a framed byte stream
pub struct StreamTransport {
    reader: Mutex<FrameReader>,
    writer: Arc<Mutex<Option<BoxWriter>>>,
    closed: CancellationToken,
    info: TransportInfo,
}

impl StreamTransport {
    fn closed_error(&self) -> TransportError {
        TransportError::connection_closed(format!("{} closed", self.info))
    }
}

#[async_trait]
impl LinkTransport for StreamTransport {
    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }

        let payload = encode_message(&message)?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(self.closed_error());
        };

        let result = write_frame(writer, &payload).await;
        if result.is_err() {
            self.closed.cancel();
        }
        result
    }

    async fn recv(&self) -> Result<Message> {
        let mut reader = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            guard = self.reader.lock() => guard,
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.closed_error()),
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(frame) => match decode_message(&frame) {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!(peer = %self.info, error = %e, "Dropping undecodable message"),
                },
                Err(e) if e.is_closed() => {
                    debug!(peer = %self.info, error = %e, "Stream ended");
                    self.closed.cancel();
                    return Err(e);
                }
                Err(e) => warn!(peer = %self.info, error = %e, "Dropping invalid frame"),
            }
        }
    }

    fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    fn close(&self) {
        self.closed.cancel();

        // Shut the write half down so the peer observes end-of-stream
        let writer = Arc::clone(&self.writer);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(mut writer) = writer.lock().await.take() {
                    let _ = writer.shutdown().await;
                }
            });
        }
    }

    fn transport_info(&self) -> TransportInfo {
        self.info.clone()
    }
}

/// Options for outbound stream connections
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Link cost; transport default when `None`
    pub cost: Option<Cost>,
    pub auth: Option<String>,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            cost: None,
            auth: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Connect to a TCP link server and complete the handshake
pub async fn connect_tcp(address: &str, options: &ConnectOptions) -> Result<Arc<Link>> {
    let stream = TcpStream::connect(address).await.map_err(|e| {
        TransportError::connection_with_source("Failed to connect", Some(address.to_string()), e)
    })?;
    stream.set_nodelay(true)?;

    let mut framed = FramedStream::from_tcp(stream, options.max_frame_size);
    framed
        .client_handshake(options.auth.as_deref(), options.handshake_timeout)
        .await?;

    let link = Link::new(framed.into_transport(), options.cost.unwrap_or(costs::TCP))?;
    info!(link = link.id(), address, cost = link.cost(), "Connected TCP link");
    Ok(Arc::new(link))
}

/// Connect to a Unix socket link server and complete the handshake
pub async fn connect_unix(path: impl AsRef<Path>, options: &ConnectOptions) -> Result<Arc<Link>> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let stream = UnixStream::connect(path).await.map_err(|e| {
        TransportError::connection_with_source("Failed to connect", Some(label.clone()), e)
    })?;

    let mut framed = FramedStream::from_unix(stream, label.clone(), options.max_frame_size);
    framed
        .client_handshake(options.auth.as_deref(), options.handshake_timeout)
        .await?;

    let link = Link::new(framed.into_transport(), options.cost.unwrap_or(costs::UNIX))?;
    info!(link = link.id(), path = %label, cost = link.cost(), "Connected Unix link");
    Ok(Arc::new(link))
}

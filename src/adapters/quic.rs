/// QUIC session-stream adapter
///
/// One proxied connection maps to exactly one bidirectional stream inside
/// its own QUIC connection. The adapter owns both, so closing the stream
/// also closes the connection.

use async_trait::async_trait;
use quinn::{ClosedStream, ConnectError, Connection, ConnectionError, ReadError, RecvStream, SendStream, WriteError};
use std::time::Duration;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    SessionId,
    error::TransportError,
    protocol::TransportKind,
    stream::{acquire, ByteStream, StreamControl, StreamInfo},
};

/// How long close waits for the peer to acknowledge buffered data
const CLOSE_LINGER: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum QuicError {
    #[error("Quinn connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Quinn connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Quinn read error: {0}")]
    Read(#[from] ReadError),

    #[error("Quinn write error: {0}")]
    Write(#[from] WriteError),

    #[error("Quinn stream closed: {0}")]
    ClosedStream(#[from] ClosedStream),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Endpoint closed")]
    EndpointClosed,
}

impl From<QuicError> for TransportError {
    fn from(error: QuicError) -> Self {
        match error {
            QuicError::Connect(e) => TransportError::connection_error(format!("QUIC connect failed: {}", e), true),
            QuicError::Connection(e) => TransportError::connection_error(format!("QUIC connection error: {}", e), true),
            QuicError::Read(e) => TransportError::connection_error(format!("QUIC read error: {}", e), false),
            QuicError::Write(e) => TransportError::connection_error(format!("QUIC write error: {}", e), false),
            QuicError::ClosedStream(e) => TransportError::connection_error(format!("QUIC stream closed: {}", e), false),
            QuicError::Io(e) => TransportError::connection_error(format!("QUIC IO error: {}", e), true),
            QuicError::EndpointClosed => TransportError::connection_error("QUIC endpoint closed", false),
        }
    }
}

/// QUIC bidirectional stream exposed as a [`ByteStream`]
pub struct SessionStream {
    connection: Connection,
    recv: Mutex<RecvStream>,
    send: Mutex<SendStream>,
    control: StreamControl,
    info: StreamInfo,
}

impl SessionStream {
    pub fn new(connection: Connection, send: SendStream, recv: RecvStream, session_id: SessionId) -> Self {
        let info = StreamInfo::new(session_id, TransportKind::Quic, Some(connection.remote_address()));
        Self {
            connection,
            recv: Mutex::new(recv),
            send: Mutex::new(send),
            control: StreamControl::new(),
            info,
        }
    }

    /// Accept the single stream the peer opens on an inbound connection
    pub async fn accept(connection: Connection, session_id: SessionId) -> Result<Self, QuicError> {
        let (send, recv) = connection.accept_bi().await?;
        tracing::debug!("[ACCEPT] QUIC stream accepted from {} ({})", connection.remote_address(), session_id);
        Ok(Self::new(connection, send, recv, session_id))
    }

    /// Open the single stream used by an outbound connection
    pub async fn open(connection: Connection, session_id: SessionId) -> Result<Self, QuicError> {
        let (send, recv) = connection.open_bi().await?;
        tracing::debug!("[CONNECT] QUIC stream opened to {} ({})", connection.remote_address(), session_id);
        Ok(Self::new(connection, send, recv, session_id))
    }
}

// A peer closing the whole connection with code 0 ends the stream cleanly
fn read_result(result: Result<Option<usize>, ReadError>) -> Result<usize, TransportError> {
    match result {
        Ok(Some(n)) => Ok(n),
        Ok(None) => Ok(0),
        Err(ReadError::ConnectionLost(ConnectionError::ApplicationClosed(close)))
            if close.error_code == quinn::VarInt::from_u32(0) =>
        {
            Ok(0)
        }
        Err(e) => Err(QuicError::Read(e).into()),
    }
}

#[async_trait]
impl ByteStream for SessionStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.control.check_read()?;
        let mut recv = acquire(&self.recv, "read", &self.info)?;
        self.control
            .run_read(async { read_result(recv.read(buf).await) })
            .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.control.check_write()?;
        let mut send = acquire(&self.send, "write", &self.info)?;
        self.control
            .run_write(async { send.write(buf).await.map_err(|e| QuicError::Write(e).into()) })
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.control.begin_close() {
            return Ok(());
        }
        tracing::debug!("[CLOSE] Closing QUIC stream {}", self.info);

        let mut send = self.send.lock().await;
        if send.finish().is_ok() {
            // 等待对端确认已发送的数据，超时则直接关闭连接
            if tokio::time::timeout(CLOSE_LINGER, send.stopped()).await.is_err() {
                tracing::debug!("[CLOSE] QUIC stream {} linger timed out", self.info);
            }
        }
        self.connection.close(quinn::VarInt::from_u32(0), b"done");
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.control.set_read_deadline(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.control.set_write_deadline(deadline);
    }

    fn info(&self) -> StreamInfo {
        self.info.clone()
    }
}

/// 拨号端：为每个入站连接建立一个出站连接

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

use crate::{
    SessionId,
    adapters::{MessageStream, QuicError, SessionStream, StreamSocket, WebSocketError},
    config::ProxyConfig,
    error::TransportError,
    protocol::TransportKind,
    stream::ByteStream,
    tls,
};

use super::listener::resolve;

/// 出站拨号器
pub enum DialerBack {
    Tcp {
        addr: String,
        timeout: Duration,
    },
    /// QUIC 客户端端点在启动时创建一次，所有出站连接共用；
    /// 端点随最后一个连接释放，停止代理不会打断已建立的中继
    Quic {
        endpoint: quinn::Endpoint,
        addr: String,
        server_name: String,
        timeout: Duration,
    },
    WebSocket {
        url: url::Url,
        timeout: Duration,
    },
}

impl DialerBack {
    /// 按配置的远端传输创建拨号器
    pub fn new(config: &ProxyConfig) -> Result<Self, TransportError> {
        let timeout = config.connect_timeout;
        let dialer = match config.remote {
            TransportKind::Tcp => DialerBack::Tcp {
                addr: config.remote_addr.clone(),
                timeout,
            },
            TransportKind::Quic => {
                let bind: SocketAddr = if config.remote_addr.starts_with('[') {
                    SocketAddr::from(([0u16; 8], 0))
                } else {
                    SocketAddr::from(([0u8; 4], 0))
                };
                let mut endpoint = quinn::Endpoint::client(bind).map_err(QuicError::from)?;
                endpoint.set_default_client_config(tls::client_config(&config.quic)?);
                DialerBack::Quic {
                    endpoint,
                    addr: config.remote_addr.clone(),
                    server_name: config.quic_server_name(),
                    timeout,
                }
            }
            TransportKind::WebSocket => DialerBack::WebSocket {
                url: config.remote_ws_url()?,
                timeout,
            },
        };
        Ok(dialer)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            DialerBack::Tcp { .. } => TransportKind::Tcp,
            DialerBack::Quic { .. } => TransportKind::Quic,
            DialerBack::WebSocket { .. } => TransportKind::WebSocket,
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            DialerBack::Tcp { timeout, .. } | DialerBack::Quic { timeout, .. } | DialerBack::WebSocket { timeout, .. } => {
                *timeout
            }
        }
    }

    /// 建立出站连接，整个过程受连接超时约束
    pub async fn dial(&self, session_id: SessionId) -> Result<Arc<dyn ByteStream>, TransportError> {
        let timeout = self.timeout();
        let stream = tokio::time::timeout(timeout, self.connect(session_id))
            .await
            .map_err(|_| TransportError::timeout_error(format!("{} dial", self.kind()), timeout))??;
        tracing::debug!("[CONNECT] Connected {}", stream.info());
        Ok(stream)
    }

    async fn connect(&self, session_id: SessionId) -> Result<Arc<dyn ByteStream>, TransportError> {
        match self {
            DialerBack::Tcp { addr, .. } => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| TransportError::connection_error(format!("TCP connect to {} failed: {}", addr, e), true))?;
                Ok(Arc::new(StreamSocket::from_tcp(stream, session_id)?))
            }
            DialerBack::Quic {
                endpoint,
                addr,
                server_name,
                ..
            } => {
                let remote = resolve(addr).await?;
                let connection = endpoint
                    .connect(remote, server_name)
                    .map_err(QuicError::from)?
                    .await
                    .map_err(QuicError::from)?;
                Ok(Arc::new(SessionStream::open(connection, session_id).await?))
            }
            DialerBack::WebSocket { url, .. } => {
                let (ws, _response) = tokio_tungstenite::connect_async_with_config(url.as_str(), None, true)
                    .await
                    .map_err(WebSocketError::from)?;
                let peer_addr = match ws.get_ref() {
                    MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
                    _ => None,
                };
                Ok(Arc::new(MessageStream::with_session(ws, session_id, peer_addr)))
            }
        }
    }
}

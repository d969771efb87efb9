/// 监听端：为每种传输接受入站连接
///
/// `accept` 只做最快的部分（TCP accept 或取出一个 QUIC `Incoming`），
/// 握手和流建立由 [`Inbound::establish`] 在每个连接自己的任务里完成，
/// 慢速客户端不会阻塞接受循环。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};

use crate::{
    SessionId,
    adapters::{MessageStream, QuicError, SessionStream, StreamSocket, WebSocketError},
    config::ProxyConfig,
    error::TransportError,
    protocol::TransportKind,
    stream::ByteStream,
    tls::{self, TlsIdentity},
};

/// 解析 host:port，取第一个地址
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TransportError::config_error("address", format!("'{}' did not resolve to any address", addr)))
}

/// 已绑定的监听器
pub enum ListenerFront {
    Tcp(TcpListener),
    Quic(quinn::Endpoint),
    WebSocket { listener: TcpListener, path: Arc<str> },
}

/// 已接受但尚未完成握手的入站连接
pub enum Inbound {
    Tcp(TcpStream),
    Quic(quinn::Incoming),
    WebSocket { stream: TcpStream, path: Arc<str> },
}

impl ListenerFront {
    /// 按配置的监听传输绑定本地地址
    ///
    /// QUIC 监听器需要 `identity`。
    pub async fn bind(config: &ProxyConfig, identity: Option<&TlsIdentity>) -> Result<Self, TransportError> {
        let addr = resolve(&config.local_addr).await?;

        let listener = match config.listen {
            TransportKind::Tcp => ListenerFront::Tcp(TcpListener::bind(addr).await?),
            TransportKind::Quic => {
                let identity = identity
                    .ok_or_else(|| TransportError::config_error("tls", "QUIC listener requires a TLS identity"))?;
                let server_config = tls::server_config(identity, &config.quic)?;
                let endpoint = quinn::Endpoint::server(server_config, addr).map_err(QuicError::from)?;
                ListenerFront::Quic(endpoint)
            }
            TransportKind::WebSocket => ListenerFront::WebSocket {
                listener: TcpListener::bind(addr).await?,
                path: Arc::from(config.ws_path.as_str()),
            },
        };

        tracing::info!("[START] {} listener bound on {}", config.listen, listener.local_addr()?);
        Ok(listener)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        match self {
            ListenerFront::Tcp(listener) | ListenerFront::WebSocket { listener, .. } => Ok(listener.local_addr()?),
            ListenerFront::Quic(endpoint) => Ok(endpoint.local_addr()?),
        }
    }

    /// 等待下一个入站连接
    ///
    /// QUIC 端点关闭后返回 [`TransportError::Closed`]。
    pub async fn accept(&self) -> Result<Inbound, TransportError> {
        match self {
            ListenerFront::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Inbound::Tcp(stream))
            }
            ListenerFront::Quic(endpoint) => endpoint.accept().await.map(Inbound::Quic).ok_or(TransportError::Closed),
            ListenerFront::WebSocket { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(Inbound::WebSocket {
                    stream,
                    path: path.clone(),
                })
            }
        }
    }

    /// 停止接受新连接
    pub fn close(&self) {
        if let ListenerFront::Quic(endpoint) = self {
            endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        }
    }
}

impl Inbound {
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Inbound::Tcp(stream) | Inbound::WebSocket { stream, .. } => stream.peer_addr().ok(),
            Inbound::Quic(incoming) => Some(incoming.remote_address()),
        }
    }

    /// 完成握手，得到入站字节流
    pub async fn establish(self, session_id: SessionId, timeout: Duration) -> Result<Arc<dyn ByteStream>, TransportError> {
        match self {
            Inbound::Tcp(stream) => Ok(Arc::new(StreamSocket::from_tcp(stream, session_id)?)),
            Inbound::Quic(incoming) => {
                // 超时只约束 TLS 握手；客户端写入首个字节前流不可见，
                // 等待流的时间由连接空闲超时兜底
                let connection = tokio::time::timeout(timeout, incoming)
                    .await
                    .map_err(|_| TransportError::timeout_error("quic handshake", timeout))?
                    .map_err(QuicError::from)?;
                tracing::debug!("[ACCEPT] QUIC connection from {} ({})", connection.remote_address(), session_id);
                let stream = SessionStream::accept(connection, session_id).await?;
                Ok(Arc::new(stream))
            }
            Inbound::WebSocket { stream, path } => {
                stream.set_nodelay(true)?;
                let peer_addr = stream.peer_addr().ok();
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    if request.uri().path() == &*path {
                        Ok(response)
                    } else {
                        tracing::debug!("[ACCEPT] Rejecting WebSocket upgrade for path {}", request.uri().path());
                        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                        *rejection.status_mut() = StatusCode::NOT_FOUND;
                        Err(rejection)
                    }
                };
                let ws = tokio::time::timeout(timeout, tokio_tungstenite::accept_hdr_async(stream, callback))
                    .await
                    .map_err(|_| TransportError::timeout_error("websocket upgrade", timeout))?
                    .map_err(WebSocketError::from)?;
                Ok(Arc::new(MessageStream::with_session(ws, session_id, peer_addr)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuicOptions;

    fn quic_listen_config() -> ProxyConfig {
        ProxyConfig::new("127.0.0.1:0", "127.0.0.1:1", TransportKind::Quic, TransportKind::Tcp)
    }

    #[tokio::test]
    async fn test_quic_handshake_timeout_excludes_first_stream_wait() {
        let identity = TlsIdentity::self_signed().unwrap();
        let listener = ListenerFront::bind(&quic_listen_config(), Some(&identity)).await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let mut client = quinn::Endpoint::client(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        client.set_default_client_config(tls::client_config(&QuicOptions::default()).unwrap());

        let establish = tokio::spawn(async move {
            let inbound = listener.accept().await.unwrap();
            let stream = inbound.establish(SessionId::new(1), Duration::from_millis(200)).await;
            (stream, listener)
        });

        let connection = client.connect(server_addr, "localhost").unwrap().await.unwrap();
        // 握手早已完成，首个字节比超时晚到
        tokio::time::sleep(Duration::from_millis(500)).await;
        let outbound = SessionStream::open(connection, SessionId::new(2)).await.unwrap();
        outbound.write_all(b"late").await.unwrap();

        let (inbound, _listener) = tokio::time::timeout(Duration::from_secs(10), establish)
            .await
            .unwrap()
            .unwrap();
        let inbound = inbound.unwrap();

        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            got += inbound.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_closed_quic_listener_stops_accepting() {
        let identity = TlsIdentity::self_signed().unwrap();
        let listener = ListenerFront::bind(&quic_listen_config(), Some(&identity)).await.unwrap();
        listener.close();
        assert!(matches!(listener.accept().await, Err(TransportError::Closed)));
    }
}

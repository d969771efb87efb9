/// 代理编排：把 (监听传输, 远端传输) 组合为 监听端 + 拨号端 + 中继引擎
///
/// 所有配置错误（不支持的组合、证书加载失败、非法地址）都在 [`Proxy::bind`]
/// 绑定监听端口之前返回。连接级别的错误只记录日志，不会离开连接任务。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    SessionId,
    config::ProxyConfig,
    error::TransportError,
    protocol::{Route, TransportKind},
    relay::RelayEngine,
    tls::TlsIdentity,
    transport::{DialerBack, Inbound, ListenerFront},
};

/// 暂时性 accept 错误后的退避时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 已绑定、尚未开始接受连接的代理
pub struct Proxy {
    config: Arc<ProxyConfig>,
    route: Route,
    listener: ListenerFront,
    dialer: Arc<DialerBack>,
    relay: RelayEngine,
    next_session: AtomicU64,
}

impl Proxy {
    /// 校验配置，创建拨号端并绑定监听端
    pub async fn bind(config: ProxyConfig) -> Result<Self, TransportError> {
        let route = config.validate()?;

        let identity = if route.listen() == TransportKind::Quic {
            Some(TlsIdentity::from_options(&config.quic)?)
        } else {
            None
        };
        let dialer = DialerBack::new(&config)?;
        let listener = ListenerFront::bind(&config, identity.as_ref()).await?;

        tracing::info!("[START] Route {} ready", route);
        Ok(Self {
            relay: RelayEngine::from_config(&config),
            config: Arc::new(config),
            route,
            listener,
            dialer: Arc::new(dialer),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// 一直运行接受循环
    pub async fn serve(self) -> Result<(), TransportError> {
        self.run_with_shutdown(CancellationToken::new()).await
    }

    /// 运行接受循环直到 `shutdown` 被取消或监听端关闭
    ///
    /// 已建立的中继不受影响，继续运行到各自结束。拨号端不在这里关闭：
    /// 关闭共享的 QUIC 客户端端点会立即断开所有出站连接。
    pub async fn run_with_shutdown(self, shutdown: CancellationToken) -> Result<(), TransportError> {
        tracing::info!(
            "[START] Listening on {} ({}), proxying to {} ({})",
            self.local_addr()?,
            self.route.listen(),
            self.config.remote_addr,
            self.route.remote()
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("[STOP] Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(inbound) => self.spawn_connection(inbound),
                Err(TransportError::Closed) => {
                    tracing::info!("[STOP] Listener closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("[ACCEPT] Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        self.listener.close();
        Ok(())
    }

    fn spawn_connection(&self, inbound: Inbound) {
        let session_id = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let dialer = self.dialer.clone();
        let relay = self.relay.clone();
        let handshake_timeout = self.config.connect_timeout;

        tokio::spawn(async move {
            handle_connection(inbound, session_id, dialer, relay, handshake_timeout).await;
        });
    }
}

async fn handle_connection(
    inbound: Inbound,
    session_id: SessionId,
    dialer: Arc<DialerBack>,
    relay: RelayEngine,
    handshake_timeout: Duration,
) {
    match inbound.remote_addr() {
        Some(addr) => tracing::info!("[ACCEPT] New connection from {} ({})", addr, session_id),
        None => tracing::info!("[ACCEPT] New connection ({})", session_id),
    }

    let inbound = match inbound.establish(session_id, handshake_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("[ACCEPT] Handshake failed ({}): {}", session_id, e);
            return;
        }
    };

    let outbound = match dialer.dial(session_id).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("[CONNECT] Dial {} failed ({}): {}", dialer.kind(), session_id, e);
            if let Err(e) = inbound.close().await {
                tracing::debug!("[CLOSE] Error closing {}: {}", inbound.info(), e);
            }
            return;
        }
    };

    let report = relay.run(inbound, outbound).await;
    if let Some(e) = report.first_error {
        tracing::debug!("[RELAY] {} ended with error: {}", session_id, e);
    }
}

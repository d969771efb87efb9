/// anyrelay - 多协议字节流中继
///
/// 在一个本地监听端口和一个远端目标之间双向转发字节，两端可以分别使用
/// TCP、QUIC 或 WebSocket。所有传输都通过统一的 [`ByteStream`] 接口交给
/// 同一个中继引擎。

// 传输层
pub mod transport;

// 协议适配器
pub mod adapters;

// 传输类型与路由
pub mod protocol;

// 核心类型
pub mod config;
pub mod deadline;
pub mod error;
pub mod stream;
pub mod tls;

// 中继与编排
pub mod proxy;
pub mod relay;

/// 会话ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// 创建新的会话ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// 重新导出核心类型
pub use config::{ConfigError, ProxyConfig, QuicOptions};
pub use error::{ErrorSeverity, TransportError};
pub use protocol::{Route, TransportKind};
pub use proxy::Proxy;
pub use relay::{Direction, RelayEngine, RelayReport};
pub use stream::{ByteStream, StreamInfo};
pub use tls::TlsIdentity;

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;

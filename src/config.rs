/// 代理配置
///
/// 启动时构造一次，之后只读地传给编排器和所有适配器

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    error::TransportError,
    protocol::{Route, TransportKind},
};

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("Missing required field: {field}. {suggestion}")]
    MissingField {
        field: String,
        suggestion: String,
    },

    #[error("Unsupported transport pair: listen={listen} remote={remote}")]
    UnsupportedRoute {
        listen: TransportKind,
        remote: TransportKind,
    },

    #[error("Configuration conflict: {message}")]
    Conflict { message: String },

    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// 出错的字段名
    pub fn field(&self) -> &str {
        match self {
            ConfigError::InvalidValue { field, .. } | ConfigError::MissingField { field, .. } => field,
            ConfigError::UnsupportedRoute { .. } => "route",
            ConfigError::Conflict { .. } => "config",
            ConfigError::Io { .. } | ConfigError::Parse { .. } => "file",
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        TransportError::config_error(error.field().to_string(), error.to_string())
    }
}

/// QUIC 相关选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicOptions {
    /// ALPN 协议标识
    pub alpn: String,
    /// 拨号时使用的 TLS 服务器名，默认取远端地址的主机部分
    pub server_name: Option<String>,
    /// keepalive 间隔，0 表示关闭
    #[serde(with = "secs")]
    pub keep_alive_interval: Duration,
    /// 最大空闲超时
    #[serde(with = "secs")]
    pub max_idle_timeout: Duration,
    /// 是否校验对端证书（默认不校验）
    pub verify_certificate: bool,
    /// 监听端证书 PEM 文件，未设置时生成自签名证书
    pub cert_pem_path: Option<PathBuf>,
    /// 监听端私钥 PEM 文件
    pub key_pem_path: Option<PathBuf>,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            alpn: "proto".to_string(),
            server_name: None,
            keep_alive_interval: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(30),
            verify_certificate: false,
            cert_pem_path: None,
            key_pem_path: None,
        }
    }
}

/// 代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 本地监听地址 host:port
    pub local_addr: String,
    /// 远端目标地址 host:port（WebSocket 也可以是完整 URL）
    pub remote_addr: String,
    /// 监听端传输
    pub listen: TransportKind,
    /// 远端传输
    pub remote: TransportKind,
    /// WebSocket 升级路径
    pub ws_path: String,
    /// 拨号和握手超时
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// 每个方向的中继缓冲区大小
    pub buffer_size: usize,
    /// 第一个方向结束后等待另一方向的时间
    #[serde(with = "secs")]
    pub relay_grace: Duration,
    pub quic: QuicOptions,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            local_addr: "localhost:9999".to_string(),
            remote_addr: "127.0.0.1:5201".to_string(),
            listen: TransportKind::Tcp,
            remote: TransportKind::Tcp,
            ws_path: "/".to_string(),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            relay_grace: Duration::from_secs(5),
            quic: QuicOptions::default(),
        }
    }
}

impl ProxyConfig {
    pub fn new(
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        listen: TransportKind,
        remote: TransportKind,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            listen,
            remote,
            ..Self::default()
        }
    }

    /// 从 TOML 文件加载，缺失字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// 校验配置并解析路由
    pub fn validate(&self) -> Result<Route, ConfigError> {
        if self.local_addr.is_empty() {
            return Err(ConfigError::MissingField {
                field: "local_addr".to_string(),
                suggestion: "use host:port, e.g. 127.0.0.1:9999".to_string(),
            });
        }
        if self.remote_addr.is_empty() {
            return Err(ConfigError::MissingField {
                field: "remote_addr".to_string(),
                suggestion: "use host:port, e.g. 127.0.0.1:5201".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
                suggestion: "use 32768".to_string(),
            });
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "ws_path".to_string(),
                value: self.ws_path.clone(),
                reason: "must start with '/'".to_string(),
                suggestion: "use /".to_string(),
            });
        }
        if self.quic.alpn.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "quic.alpn".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
                suggestion: "use proto".to_string(),
            });
        }
        if self.quic.cert_pem_path.is_some() != self.quic.key_pem_path.is_some() {
            return Err(ConfigError::Conflict {
                message: "quic.cert_pem_path and quic.key_pem_path must be set together".to_string(),
            });
        }
        if !self.quic.keep_alive_interval.is_zero() && self.quic.keep_alive_interval >= self.quic.max_idle_timeout {
            return Err(ConfigError::Conflict {
                message: "quic.keep_alive_interval must be shorter than quic.max_idle_timeout".to_string(),
            });
        }

        Route::resolve(self.listen, self.remote).map_err(|_| ConfigError::UnsupportedRoute {
            listen: self.listen,
            remote: self.remote,
        })
    }

    /// 远端 WebSocket URL
    pub fn remote_ws_url(&self) -> Result<url::Url, ConfigError> {
        let raw = if self.remote_addr.starts_with("ws://") || self.remote_addr.starts_with("wss://") {
            self.remote_addr.clone()
        } else {
            format!("ws://{}{}", self.remote_addr, self.ws_path)
        };
        url::Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
            field: "remote_addr".to_string(),
            value: raw.clone(),
            reason: e.to_string(),
            suggestion: "use host:port or ws://host:port/path".to_string(),
        })
    }

    /// 拨号 QUIC 时的 TLS 服务器名
    pub fn quic_server_name(&self) -> String {
        if let Some(name) = &self.quic.server_name {
            return name.clone();
        }
        match self.remote_addr.rsplit_once(':') {
            Some((host, _)) if !host.is_empty() => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            _ => "localhost".to_string(),
        }
    }
}

/// 以秒（浮点）表示的 Duration
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

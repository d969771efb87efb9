use std::time::Duration;

/// 统一传输错误类型
///
/// 所有适配器、监听器、拨号器和中继引擎都返回这个错误类型
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 连接相关错误
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 拨号或握手超时
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// 读写截止时间已过
    #[error("Deadline exceeded for {operation}")]
    DeadlineExceeded {
        operation: &'static str,
    },

    /// 同一方向上已有操作在进行
    #[error("Concurrent {operation} not allowed: another {operation} is already in flight")]
    ConcurrentOperation {
        operation: &'static str,
    },

    /// 消息帧不符合预期
    #[error("Framing error: {reason}")]
    Framing {
        reason: String,
    },

    /// 流已被本地关闭
    #[error("Stream closed")]
    Closed,
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Timeout { .. } => true,
            TransportError::DeadlineExceeded { .. } => true,
            TransportError::Protocol { .. }
            | TransportError::Configuration { .. }
            | TransportError::ConcurrentOperation { .. }
            | TransportError::Framing { .. }
            | TransportError::Closed => false,
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            TransportError::ConcurrentOperation { .. } => "CONCURRENT_OPERATION",
            TransportError::Framing { .. } => "FRAMING_ERROR",
            TransportError::Closed => "CLOSED",
        }
    }

    /// 是否为截止时间错误
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, TransportError::DeadlineExceeded { .. })
    }

    /// 获取错误严重性
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransportError::Configuration { .. } => ErrorSeverity::Critical,
            TransportError::ConcurrentOperation { .. } => ErrorSeverity::Critical,
            TransportError::Connection { retryable, .. } => {
                if *retryable {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::High
                }
            }
            TransportError::Protocol { .. } | TransportError::Framing { .. } => ErrorSeverity::Medium,
            TransportError::Timeout { .. } | TransportError::DeadlineExceeded { .. } => ErrorSeverity::Medium,
            TransportError::Closed => ErrorSeverity::Low,
        }
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn deadline_exceeded(operation: &'static str) -> Self {
        Self::DeadlineExceeded { operation }
    }

    pub fn concurrent(operation: &'static str) -> Self {
        Self::ConcurrentOperation { operation }
    }
}

/// 兼容性转换 - 从标准IO错误
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

/// 错误分级
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,      // 可忽略的错误
    Medium,   // 需要关注的错误
    High,     // 需要处理的错误
    Critical, // 严重错误
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_retryable_kinds() {
        let refused: TransportError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(refused.is_retryable());
        assert_eq!(refused.error_code(), "CONNECTION_ERROR");

        let denied: TransportError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_severity_of_contract_violations() {
        assert_eq!(TransportError::concurrent("read").severity(), ErrorSeverity::Critical);
        assert_eq!(TransportError::Closed.severity(), ErrorSeverity::Low);
        assert!(TransportError::deadline_exceeded("write").is_deadline_exceeded());
        assert_eq!(
            TransportError::concurrent("read").to_string(),
            "Concurrent read not allowed: another read is already in flight"
        );
    }
}

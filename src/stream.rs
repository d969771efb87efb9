/// 统一字节流抽象
///
/// 所有传输适配器（TCP、QUIC、WebSocket）都实现 [`ByteStream`]，
/// 中继引擎只依赖这个接口。

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    SessionId,
    deadline::Deadline,
    error::TransportError,
    protocol::TransportKind,
};

/// 流的描述信息，用于日志
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// 会话ID
    pub session_id: SessionId,
    /// 传输类型
    pub protocol: TransportKind,
    /// 对端地址（WebSocket 客户端可能未知）
    pub peer_addr: Option<SocketAddr>,
}

impl StreamInfo {
    pub fn new(session_id: SessionId, protocol: TransportKind, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            session_id,
            protocol,
            peer_addr,
        }
    }
}

impl std::fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{} {} ({})", self.protocol, addr, self.session_id),
            None => write!(f, "{} unknown-addr ({})", self.protocol, self.session_id),
        }
    }
}

/// 统一的双向字节流接口
///
/// 约定：
/// - 同一时刻每个方向最多一个在途操作，第二个并发调用立即返回
///   [`TransportError::ConcurrentOperation`]
/// - `read` 返回 `Ok(0)` 表示流结束
/// - `None` 截止时间表示清除
/// - `close` 可以被多次调用，只有第一次真正关闭底层传输
#[async_trait]
pub trait ByteStream: Send + Sync + 'static {
    /// 读取数据到 `buf`，返回读取的字节数
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// 写入 `buf`，返回写入的字节数
    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// 关闭流并唤醒所有在途操作
    async fn close(&self) -> Result<(), TransportError>;

    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// 获取流信息
    fn info(&self) -> StreamInfo;

    /// 写入整个缓冲区
    async fn write_all(&self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(TransportError::connection_error("write returned zero bytes", false));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// 适配器共享的控制状态：读写截止时间和关闭信号
#[derive(Debug, Default)]
pub(crate) struct StreamControl {
    read_deadline: Deadline,
    write_deadline: Deadline,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl StreamControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
    }

    pub(crate) fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
    }

    /// 已关闭或读截止时间已过则立即失败
    ///
    /// 关闭检查先于守卫获取：`close` 持有写守卫期间到达的读写直接返回
    /// [`TransportError::Closed`]，不会被误报为并发操作。
    pub(crate) fn check_read(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.read_deadline.is_expired() {
            return Err(TransportError::deadline_exceeded("read"));
        }
        Ok(())
    }

    /// 已关闭或写截止时间已过则立即失败
    pub(crate) fn check_write(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.write_deadline.is_expired() {
            return Err(TransportError::deadline_exceeded("write"));
        }
        Ok(())
    }

    /// 在读截止时间和关闭信号约束下执行读操作
    pub(crate) async fn run_read<F, T>(&self, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        self.run(&self.read_deadline, "read", op).await
    }

    /// 在写截止时间和关闭信号约束下执行写操作
    pub(crate) async fn run_write<F, T>(&self, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        self.run(&self.write_deadline, "write", op).await
    }

    async fn run<F, T>(&self, deadline: &Deadline, operation: &'static str, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            _ = deadline.expired() => Err(TransportError::deadline_exceeded(operation)),
            result = op => result,
        }
    }

    /// 标记关闭并唤醒在途操作；只有第一次调用返回 true
    pub(crate) fn begin_close(&self) -> bool {
        self.shutdown.cancel();
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 获取单方向操作守卫，已被占用则立即失败
pub(crate) fn acquire<'a, T>(
    lock: &'a Mutex<T>,
    operation: &'static str,
    info: &StreamInfo,
) -> Result<MutexGuard<'a, T>, TransportError> {
    lock.try_lock().map_err(|_| {
        tracing::error!("[ERROR] Concurrent {} on {}", operation, info);
        TransportError::concurrent(operation)
    })
}

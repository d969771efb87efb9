/// 双向中继引擎
///
/// 每个被代理的连接对应一次 [`RelayEngine::run`]：两个拷贝任务分别负责
/// 入站→出站和出站→入站。任一方向结束（流结束或出错）后两个流都被关闭，
/// 引擎在宽限期内等待另一个任务退出，超时则中止它。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::{config::ProxyConfig, error::TransportError, stream::ByteStream};

/// 拷贝方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 入站 → 出站
    Forward,
    /// 出站 → 入站
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "inbound->outbound"),
            Direction::Backward => write!(f, "outbound->inbound"),
        }
    }
}

/// 一次中继的结果
#[derive(Debug)]
pub struct RelayReport {
    /// 入站 → 出站字节数
    pub forward_bytes: u64,
    /// 出站 → 入站字节数
    pub backward_bytes: u64,
    /// 先结束的方向（任务异常退出时为 `None`）
    pub first_finished: Option<Direction>,
    /// 先结束方向的错误，正常流结束时为 `None`
    pub first_error: Option<TransportError>,
    /// 另一个任务是否在宽限期后被中止
    pub grace_expired: bool,
}

/// 中继引擎
#[derive(Debug, Clone)]
pub struct RelayEngine {
    buffer_size: usize,
    grace: Duration,
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(32 * 1024, Duration::from_secs(5))
    }
}

impl RelayEngine {
    pub fn new(buffer_size: usize, grace: Duration) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            grace,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.buffer_size, config.relay_grace)
    }

    /// 在两个流之间双向拷贝，直到任一方向结束
    pub async fn run(&self, inbound: Arc<dyn ByteStream>, outbound: Arc<dyn ByteStream>) -> RelayReport {
        let forward_bytes = Arc::new(AtomicU64::new(0));
        let backward_bytes = Arc::new(AtomicU64::new(0));
        let pair = format!("{} <-> {}", inbound.info(), outbound.info());

        let mut tasks = JoinSet::new();
        tasks.spawn(copy(
            Direction::Forward,
            inbound.clone(),
            outbound.clone(),
            self.buffer_size,
            forward_bytes.clone(),
        ));
        tasks.spawn(copy(
            Direction::Backward,
            outbound.clone(),
            inbound.clone(),
            self.buffer_size,
            backward_bytes.clone(),
        ));
        tracing::debug!("[RELAY] Started {}", pair);

        let (first_finished, first_error) = match tasks.join_next().await {
            Some(Ok((direction, result))) => (Some(direction), result.err()),
            Some(Err(e)) => {
                tracing::error!("[RELAY] Copy task failed: {}", e);
                (None, Some(TransportError::connection_error(format!("copy task failed: {}", e), false)))
            }
            None => (None, None),
        };
        match (&first_finished, &first_error) {
            (Some(direction), None) => tracing::debug!("[RELAY] {} reached end of stream", direction),
            (Some(direction), Some(e)) => tracing::debug!("[RELAY] {} stopped: {}", direction, e),
            _ => {}
        }

        // 关闭两端会唤醒另一个任务阻塞中的读写
        for stream in [&inbound, &outbound] {
            if let Err(e) = stream.close().await {
                tracing::debug!("[CLOSE] Error closing {}: {}", stream.info(), e);
            }
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((direction, Err(e))) => tracing::trace!("[RELAY] {} stopped after close: {}", direction, e),
                    Ok((direction, Ok(()))) => tracing::trace!("[RELAY] {} finished after close", direction),
                    Err(e) => tracing::error!("[RELAY] Copy task failed: {}", e),
                }
            }
        };
        let grace_expired = tokio::time::timeout(self.grace, drain).await.is_err();
        if grace_expired {
            tracing::warn!("[RELAY] Copy task still running after {:?}, aborting ({})", self.grace, pair);
            tasks.abort_all();
        }

        let report = RelayReport {
            forward_bytes: forward_bytes.load(Ordering::Relaxed),
            backward_bytes: backward_bytes.load(Ordering::Relaxed),
            first_finished,
            first_error,
            grace_expired,
        };
        tracing::info!(
            "[RELAY] Finished {}: {} bytes forward, {} bytes backward",
            pair,
            report.forward_bytes,
            report.backward_bytes
        );
        report
    }
}

async fn copy(
    direction: Direction,
    source: Arc<dyn ByteStream>,
    sink: Arc<dyn ByteStream>,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
) -> (Direction, Result<(), TransportError>) {
    let result = pump(source.as_ref(), sink.as_ref(), buffer_size, &counter).await;
    (direction, result)
}

async fn pump(
    source: &dyn ByteStream,
    sink: &dyn ByteStream,
    buffer_size: usize,
    counter: &AtomicU64,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapters::StreamSocket, protocol::TransportKind, stream::StreamInfo, SessionId};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    fn pipe(id: u64) -> (DuplexStream, Arc<dyn ByteStream>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let info = StreamInfo::new(SessionId::new(id), TransportKind::Tcp, None);
        (near, Arc::new(StreamSocket::new(far, info)))
    }

    fn spawn_echo(server: DuplexStream) {
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
    }

    async fn echo_round_trip(size: usize) {
        let (client, inbound) = pipe(1);
        let (server, outbound) = pipe(2);
        spawn_echo(server);

        let engine = RelayEngine::new(4096, Duration::from_secs(2));
        let relay = tokio::spawn(async move { engine.run(inbound, outbound).await });

        let payload: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
        let (mut reader, mut writer) = tokio::io::split(client);
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                writer.write_all(&payload).await.unwrap();
                writer
            })
        };

        let mut received = vec![0u8; size];
        reader.read_exact(&mut received).await.unwrap();
        assert!(received == payload, "payload of {} bytes corrupted", size);

        drop(writer.await.unwrap());
        drop(reader);

        let report = tokio::time::timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(report.forward_bytes, size as u64);
        assert_eq!(report.backward_bytes, size as u64);
        assert_eq!(report.first_finished, Some(Direction::Forward));
        assert!(report.first_error.is_none());
        assert!(!report.grace_expired);
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        for size in [0, 1, 4096, 100_000, 3 * 1024 * 1024] {
            echo_round_trip(size).await;
        }
    }

    #[tokio::test]
    async fn test_outbound_close_tears_down_inbound() {
        let (mut client, inbound) = pipe(1);
        let (mut server, outbound) = pipe(2);

        let engine = RelayEngine::default();
        let relay = tokio::spawn(async move { engine.run(inbound, outbound).await });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(server);

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("inbound should see end of stream")
            .unwrap();
        assert_eq!(n, 0);

        let report = relay.await.unwrap();
        assert_eq!(report.first_finished, Some(Direction::Backward));
        assert_eq!(report.forward_bytes, 5);
    }

    /// 读操作永不返回，关闭也不会唤醒它
    struct StuckStream;

    #[async_trait]
    impl ByteStream for StuckStream {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            std::future::pending().await
        }

        async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
            Ok(buf.len())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_read_deadline(&self, _deadline: Option<Instant>) {}

        fn set_write_deadline(&self, _deadline: Option<Instant>) {}

        fn info(&self) -> StreamInfo {
            StreamInfo::new(SessionId::new(9), TransportKind::Quic, None)
        }
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted_after_grace() {
        let (client, inbound) = pipe(1);
        drop(client);

        let grace = Duration::from_millis(200);
        let start = Instant::now();
        let report = RelayEngine::new(1024, grace).run(inbound, Arc::new(StuckStream)).await;

        assert!(report.grace_expired);
        assert_eq!(report.first_finished, Some(Direction::Forward));
        assert!(start.elapsed() >= grace);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}

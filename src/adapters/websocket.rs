use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
    time::Instant,
};
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    WebSocketStream,
};

use crate::{
    SessionId,
    error::TransportError,
    protocol::TransportKind,
    stream::{acquire, ByteStream, StreamControl, StreamInfo},
};

/// 发送关闭帧的最长等待时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// WebSocket适配器错误类型
#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected {0} frame (expected binary)")]
    UnexpectedFrame(&'static str),

    #[error("closed by peer with status {code}: {reason}")]
    AbnormalClose { code: u16, reason: String },
}

impl From<WebSocketError> for TransportError {
    fn from(error: WebSocketError) -> Self {
        match error {
            WebSocketError::WebSocket(ws_err) => TransportError::protocol_error("websocket", ws_err.to_string()),
            WebSocketError::Io(io_err) => io_err.into(),
            e @ WebSocketError::UnexpectedFrame(_) => TransportError::Framing { reason: e.to_string() },
            e @ WebSocketError::AbnormalClose { .. } => TransportError::protocol_error("websocket", e.to_string()),
        }
    }
}

/// 读方向状态
struct ReadState<S> {
    source: SplitStream<WebSocketStream<S>>,
    /// 已打开但未读完的消息帧
    pending: Option<Bytes>,
}

/// 打开下一帧的结果
enum NextFrame {
    Data(Bytes),
    End,
}

/// WebSocket消息流适配器
///
/// 把以二进制消息为单位的 WebSocket 连接包装为 [`ByteStream`]：
/// - 每次写入作为一个二进制消息发送
/// - 读取时把消息重新拼接为连续字节流，帧边界对调用者不可见
/// - 对端以正常关闭或离开状态码关闭时返回流结束，并且之后一直返回流结束
/// - 收到文本帧时以 1003 状态码关闭连接并返回帧错误
pub struct MessageStream<S> {
    reader: Mutex<ReadState<S>>,
    writer: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    /// 粘性的流结束标记，一旦设置不再清除
    eof: AtomicBool,
    /// 有帧在发送途中被中止，通道不可再用
    abandoned: AtomicBool,
    control: StreamControl,
    info: StreamInfo,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// 创建新的WebSocket消息流适配器
    pub fn new(ws: WebSocketStream<S>, info: StreamInfo) -> Self {
        let (sink, source) = ws.split();
        Self {
            reader: Mutex::new(ReadState { source, pending: None }),
            writer: Mutex::new(sink),
            eof: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            control: StreamControl::new(),
            info,
        }
    }

    /// 使用给定会话ID和对端地址创建
    pub fn with_session(ws: WebSocketStream<S>, session_id: SessionId, peer_addr: Option<std::net::SocketAddr>) -> Self {
        Self::new(ws, StreamInfo::new(session_id, TransportKind::WebSocket, peer_addr))
    }

    async fn next_frame(source: &mut SplitStream<WebSocketStream<S>>) -> Result<NextFrame, WebSocketError> {
        loop {
            match source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    // 空帧不携带数据，返回 0 会被误认为流结束
                    if data.is_empty() {
                        continue;
                    }
                    return Ok(NextFrame::Data(Bytes::from(data)));
                }
                Some(Ok(Message::Text(_))) => return Err(WebSocketError::UnexpectedFrame("text")),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        None => Ok(NextFrame::End),
                        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => Ok(NextFrame::End),
                        Some(frame) => Err(WebSocketError::AbnormalClose {
                            code: u16::from(frame.code),
                            reason: frame.reason.into_owned(),
                        }),
                    };
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    return Ok(NextFrame::End)
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// 从当前帧（必要时先打开新帧）读取数据
    async fn read_frame(&self, state: &mut ReadState<S>, buf: &mut [u8]) -> Result<usize, WebSocketError> {
        let frame = match state.pending.take() {
            Some(frame) => frame,
            None => match Self::next_frame(&mut state.source).await? {
                NextFrame::Data(frame) => frame,
                NextFrame::End => {
                    self.eof.store(true, Ordering::Release);
                    return Ok(0);
                }
            },
        };

        let mut frame = frame;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame.split_to(n));
        if !frame.is_empty() {
            state.pending = Some(frame);
        }
        Ok(n)
    }

    /// 以给定状态码关闭，只有第一次调用生效
    async fn close_with(&self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        if !self.control.begin_close() {
            return Ok(());
        }
        tracing::debug!("[CLOSE] Closing WebSocket {} with status {}", self.info, u16::from(code));

        let mut sink = self.writer.lock().await;
        if self.abandoned.load(Ordering::Acquire) {
            // 关闭帧会先把被中止的帧冲刷出去
            tracing::debug!("[CLOSE] Dropping WebSocket {} without close frame", self.info);
            return Ok(());
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
            Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {}
            Ok(Err(e)) => tracing::debug!("[CLOSE] Failed to send close frame on {}: {}", self.info, e),
            Err(_) => tracing::debug!("[CLOSE] Timed out sending close frame on {}", self.info),
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        Ok(())
    }
}

#[async_trait]
impl<S> ByteStream for MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.control.check_read()?;
        if self.eof.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut state = acquire(&self.reader, "read", &self.info)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let result = self
            .control
            .run_read(async { self.read_frame(&mut state, buf).await.map_err(TransportError::from) })
            .await;

        if let Err(TransportError::Framing { reason }) = &result {
            tracing::warn!("[ERROR] Protocol violation on {}: {}", self.info, reason);
            let reason = reason.clone();
            drop(state);
            self.close_with(CloseCode::Unsupported, &reason).await?;
        }
        result
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.control.check_write()?;
        let mut sink = acquire(&self.writer, "write", &self.info)?;
        if buf.is_empty() {
            return Ok(0);
        }

        // 帧一旦进入发送缓冲区就无法撤回
        let mut accepted = false;
        let result = self
            .control
            .run_write(async {
                sink.feed(Message::Binary(buf.to_vec()))
                    .await
                    .map_err(|e| TransportError::from(WebSocketError::from(e)))?;
                accepted = true;
                sink.flush()
                    .await
                    .map_err(|e| TransportError::from(WebSocketError::from(e)))?;
                Ok(buf.len())
            })
            .await;

        let aborted = matches!(result, Err(TransportError::DeadlineExceeded { .. }) | Err(TransportError::Closed));
        if accepted && aborted {
            // 之后任何读写都会冲刷缓冲区，把已报告失败的帧发出去，只能放弃整个通道
            self.abandoned.store(true, Ordering::Release);
            drop(sink);
            if self.control.begin_close() {
                tracing::warn!("[CLOSE] Write aborted mid-frame on {}, abandoning channel", self.info);
            }
        }
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_with(CloseCode::Normal, "").await
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (MessageStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        pair_with_capacity(64 * 1024).await
    }

    async fn pair_with_capacity(capacity: usize) -> (MessageStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(capacity);
        let ours = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let theirs = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (MessageStream::with_session(ours, SessionId::new(1), None), theirs)
    }

    #[tokio::test]
    async fn test_frame_reassembly_with_small_buffers() {
        let (stream, mut peer) = pair().await;
        let payload: Vec<u8> = (0u8..10).collect();
        peer.send(Message::Binary(payload.clone())).await.unwrap();

        let mut chunks = Vec::new();
        for _ in 0..4 {
            let mut buf = [0u8; 3];
            let n = stream.read(&mut buf).await.unwrap();
            chunks.push(buf[..n].to_vec());
        }
        assert_eq!(
            chunks,
            vec![payload[0..3].to_vec(), payload[3..6].to_vec(), payload[6..9].to_vec(), payload[9..10].to_vec()]
        );
    }

    #[tokio::test]
    async fn test_reads_span_frames_in_order() {
        let (stream, mut peer) = pair().await;
        peer.send(Message::Binary(b"ab".to_vec())).await.unwrap();
        peer.send(Message::Binary(Vec::new())).await.unwrap();
        peer.send(Message::Ping(b"p".to_vec())).await.unwrap();
        peer.send(Message::Binary(b"cdef".to_vec())).await.unwrap();

        let mut out = Vec::new();
        while out.len() < 6 {
            let mut buf = [0u8; 4];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_each_write_is_one_binary_frame() {
        let (stream, mut peer) = pair().await;
        assert_eq!(stream.write(b"ping").await.unwrap(), 4);
        assert_eq!(stream.write(b"").await.unwrap(), 0);
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(peer.next().await.unwrap().unwrap(), Message::Binary(b"ping".to_vec()));
        assert_eq!(peer.next().await.unwrap().unwrap(), Message::Binary(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_normal_close_is_sticky_eof() {
        let (stream, mut peer) = pair().await;
        peer.send(Message::Binary(b"bye".to_vec())).await.unwrap();
        peer.close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() })).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.eof.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_going_away_is_eof() {
        let (stream, mut peer) = pair().await;
        peer.close(Some(CloseFrame { code: CloseCode::Away, reason: "restart".into() })).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abnormal_close_is_error() {
        let (stream, mut peer) = pair().await;
        peer.close(Some(CloseFrame { code: CloseCode::Error, reason: "boom".into() })).await.unwrap();

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.error_code(), "PROTOCOL_ERROR");
    }

    #[tokio::test]
    async fn test_text_frame_closes_with_unsupported_data() {
        let (stream, mut peer) = pair().await;
        peer.send(Message::Text("hello".to_string())).await.unwrap();

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::Framing { .. }));

        match peer.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_read_fails_fast() {
        let (stream, _peer) = pair().await;
        let stream = Arc::new(stream);

        let first = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                stream.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::ConcurrentOperation { operation: "read" }));

        stream.close().await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_read_deadline_aborts_in_flight_read_only() {
        let (stream, mut peer) = pair().await;
        let stream = Arc::new(stream);
        let delta = Duration::from_millis(100);
        let start = Instant::now();
        stream.set_read_deadline(Some(start + delta));

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(start.elapsed() >= delta);

        // 到期后立即失败
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(err.is_deadline_exceeded());

        // 重新设置后恢复正常，写方向不受影响
        stream.set_read_deadline(None);
        stream.write_all(b"ok").await.unwrap();
        peer.send(Message::Binary(b"ok".to_vec())).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    #[tokio::test]
    async fn test_close_sends_normal_status_once() {
        let (stream, mut peer) = pair().await;
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        match peer.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {:?}", other),
        }

        let mut buf = [0u8; 4];
        assert!(matches!(stream.read(&mut buf).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_stalled_write_hits_deadline() {
        // 对端从不读取，64 KiB 的帧卡在 1 KiB 的缓冲区里
        let (stream, mut peer) = pair_with_capacity(1024).await;
        let delta = Duration::from_millis(100);
        let start = Instant::now();
        stream.set_write_deadline(Some(start + delta));

        let err = stream.write(&[7u8; 64 * 1024]).await.unwrap_err();
        assert!(err.is_deadline_exceeded());
        let elapsed = start.elapsed();
        assert!(elapsed >= delta, "returned after {:?}", elapsed);
        assert!(elapsed < delta + Duration::from_secs(1), "returned after {:?}", elapsed);

        // 帧已部分发出，通道被放弃，清除截止时间也不能恢复
        stream.set_write_deadline(None);
        assert!(matches!(stream.write(b"x").await, Err(TransportError::Closed)));
        let mut buf = [0u8; 4];
        assert!(matches!(stream.read(&mut buf).await, Err(TransportError::Closed)));
        stream.close().await.unwrap();
        drop(stream);

        let mut frames = Vec::new();
        let drain = async {
            while let Some(Ok(message)) = peer.next().await {
                frames.push(message);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), drain).await.unwrap();
        assert!(
            !frames.iter().any(|message| matches!(message, Message::Binary(_))),
            "aborted frame reached the peer: {:?}",
            frames.iter().map(|message| message.len()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_cleared_write_deadline_does_not_fire() {
        let (stream, mut peer) = pair_with_capacity(1024).await;
        let stream = Arc::new(stream);
        stream.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));
        stream.set_write_deadline(None);

        let writer = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&[7u8; 64 * 1024]).await })
        };

        tokio::time::sleep(Duration::from_millis(150)).await;
        match peer.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data.len(), 64 * 1024),
            other => panic!("expected binary frame, got {:?}", other.map(|m| m.map(|m| m.len()))),
        }
        assert_eq!(writer.await.unwrap().unwrap(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_concurrent_write_fails_fast() {
        let (stream, _peer) = pair_with_capacity(1024).await;
        let stream = Arc::new(stream);

        let first = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&[7u8; 64 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = stream.write(b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::ConcurrentOperation { operation: "write" }));

        stream.close().await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(TransportError::Closed)));
        assert!(matches!(stream.write(b"x").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_operations_during_close_report_closed() {
        let (stream, _peer) = pair().await;

        // close 等待关闭帧发送时持有写守卫
        let _writer = stream.writer.lock().await;
        assert!(stream.control.begin_close());

        assert!(matches!(stream.write(b"x").await, Err(TransportError::Closed)));
        let mut buf = [0u8; 4];
        assert!(matches!(stream.read(&mut buf).await, Err(TransportError::Closed)));
    }
}

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
    time::Instant,
};

use crate::{
    SessionId,
    error::TransportError,
    protocol::TransportKind,
    stream::{acquire, ByteStream, StreamControl, StreamInfo},
};

/// 流式套接字适配器
///
/// 把任意 `AsyncRead + AsyncWrite` 字节流（生产环境中是 TCP 连接）包装为
/// [`ByteStream`]，读写两半各自独立，截止时间由 [`StreamControl`] 统一处理。
pub struct StreamSocket<S> {
    /// 读半部，同时充当单读者守卫
    reader: Mutex<ReadHalf<S>>,
    /// 写半部，同时充当单写者守卫
    writer: Mutex<WriteHalf<S>>,
    control: StreamControl,
    info: StreamInfo,
}

impl<S> StreamSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// 创建新的流式套接字适配器
    pub fn new(io: S, info: StreamInfo) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: StreamControl::new(),
            info,
        }
    }
}

impl StreamSocket<TcpStream> {
    /// 包装一个已建立的 TCP 连接
    pub fn from_tcp(stream: TcpStream, session_id: SessionId) -> Result<Self, TransportError> {
        // 中继场景下小包要立即发出
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self::new(stream, StreamInfo::new(session_id, TransportKind::Tcp, peer_addr)))
    }
}

#[async_trait]
impl<S> ByteStream for StreamSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.control.check_read()?;
        let mut reader = acquire(&self.reader, "read", &self.info)?;
        self.control
            .run_read(async { reader.read(buf).await.map_err(TransportError::from) })
            .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.control.check_write()?;
        let mut writer = acquire(&self.writer, "write", &self.info)?;
        self.control
            .run_write(async { writer.write(buf).await.map_err(TransportError::from) })
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.control.begin_close() {
            return Ok(());
        }
        tracing::debug!("[CLOSE] Closing stream socket {}", self.info);

        // 在途写操作已被关闭信号中止，这里可以拿到写半部
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
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
